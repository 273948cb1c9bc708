//! Scenario runner tests against scripted collaborators.
//!
//! The observer, runner, and gateway seams are replaced with in-memory
//! doubles so the full validation pass is exercised without a live
//! supervisor or any namespaces.

use std::collections::{HashMap, HashSet};
use std::os::unix::fs::PermissionsExt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nsgate_core::clock::SystemClock;
use nsgate_core::config::{
    CallerConfig, DeploymentConfig, GatewayConfig, NamespaceConfig, RecoveryConfig, ScenarioConfig,
    SecretConfig, ServiceConfig,
};
use nsgate_core::registry::NamespaceRegistry;
use nsgate_harness::observer::{LogLine, ObserverError, UnitObserver, UnitState};
use nsgate_harness::runner::{CommandRunner, ExecError, ExecOutput, GatewayProbe};
use nsgate_harness::scenario::{standard_steps, ScenarioError, ScenarioRunner, Step};

// ---------------------------------------------------------------------------
// Scripted doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedObserver {
    states: HashMap<String, UnitState>,
    logs: Mutex<HashMap<String, Vec<LogLine>>>,
    /// Log lines appended whenever the listed unit is restarted.
    on_restart: HashMap<String, (String, String)>,
    restarts: Mutex<Vec<Vec<String>>>,
}

impl ScriptedObserver {
    fn with_state(mut self, unit: &str, state: UnitState) -> Self {
        self.states.insert(unit.to_string(), state);
        self
    }

    fn with_log_line(self, unit: &str, timestamp: DateTime<Utc>, text: &str) -> Self {
        self.logs
            .lock()
            .unwrap()
            .entry(unit.to_string())
            .or_default()
            .push(LogLine {
                timestamp,
                text: text.to_string(),
            });
        self
    }

    /// When `trigger` is restarted, append `text` to `unit`'s log.
    fn with_restart_effect(mut self, trigger: &str, unit: &str, text: &str) -> Self {
        self.on_restart
            .insert(trigger.to_string(), (unit.to_string(), text.to_string()));
        self
    }
}

impl UnitObserver for ScriptedObserver {
    async fn unit_state(&self, unit: &str) -> Result<UnitState, ObserverError> {
        Ok(self
            .states
            .get(unit)
            .copied()
            .unwrap_or(UnitState::Active))
    }

    async fn unit_log(
        &self,
        unit: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LogLine>, ObserverError> {
        let logs = self.logs.lock().unwrap();
        let lines = logs.get(unit).cloned().unwrap_or_default();
        Ok(match since {
            None => lines,
            Some(cursor) => lines
                .into_iter()
                .filter(|line| line.timestamp >= cursor)
                .collect(),
        })
    }

    async fn start_units(&self, _units: &[String]) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn stop_units(&self, _units: &[String]) -> Result<(), ObserverError> {
        Ok(())
    }

    async fn restart_units(&self, units: &[String]) -> Result<(), ObserverError> {
        self.restarts.lock().unwrap().push(units.to_vec());
        for unit in units {
            if let Some((target, text)) = self.on_restart.get(unit) {
                self.logs
                    .lock()
                    .unwrap()
                    .entry(target.clone())
                    .or_default()
                    .push(LogLine {
                        timestamp: Utc::now(),
                        text: text.clone(),
                    });
            }
        }
        Ok(())
    }
}

/// Scripted command runner: ping probes answer from a reachable-pair
/// set, other commands from a canned output table.
#[derive(Default)]
struct ScriptedRunner {
    /// `(namespace, target address)` pairs that answer pings.
    reachable: HashSet<(String, String)>,
    /// Canned outputs keyed by the joined host-context command.
    outputs: HashMap<String, ExecOutput>,
}

impl ScriptedRunner {
    fn with_reachable(mut self, namespace: &str, address: &str) -> Self {
        self.reachable
            .insert((namespace.to_string(), address.to_string()));
        self
    }

    fn with_output(mut self, command: &str, exit_code: i32, stdout: &str) -> Self {
        self.outputs.insert(
            command.to_string(),
            ExecOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: String::new(),
            },
        );
        self
    }
}

impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        namespace: Option<&str>,
        command: &[String],
    ) -> Result<ExecOutput, ExecError> {
        if let (Some(ns), Some(program)) = (namespace, command.first()) {
            if program == "ping" {
                let address = command.last().cloned().unwrap_or_default();
                let reached = self.reachable.contains(&(ns.to_string(), address));
                return Ok(ExecOutput {
                    exit_code: i32::from(!reached),
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
        }
        let key = command.join(" ");
        Ok(self.outputs.get(&key).cloned().unwrap_or(ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: format!("unscripted command: {key}"),
        }))
    }
}

/// Scripted gateway: a fixed `(caller, namespace)` grant; the capability
/// probe reports an empty set unless told otherwise.
struct ScriptedGateway {
    operator: String,
    granted: String,
    capability_output: String,
    invocations: Mutex<Vec<(String, String)>>,
}

impl ScriptedGateway {
    fn new(operator: &str, granted: &str) -> Self {
        Self {
            operator: operator.to_string(),
            granted: granted.to_string(),
            capability_output: "Current: =\n".to_string(),
            invocations: Mutex::new(Vec::new()),
        }
    }

    fn with_capability_output(mut self, output: &str) -> Self {
        self.capability_output = output.to_string();
        self
    }
}

impl GatewayProbe for ScriptedGateway {
    async fn execute_as(
        &self,
        caller: &str,
        namespace: &str,
        _command: &[String],
    ) -> Result<ExecOutput, ExecError> {
        self.invocations
            .lock()
            .unwrap()
            .push((caller.to_string(), namespace.to_string()));
        if caller != self.operator || namespace != self.granted {
            return Err(ExecError::Unauthorized {
                caller: caller.to_string(),
            });
        }
        Ok(ExecOutput {
            exit_code: 0,
            stdout: self.capability_output.clone(),
            stderr: String::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

fn deployment(secret: Option<SecretConfig>) -> DeploymentConfig {
    DeploymentConfig {
        gateway: GatewayConfig {
            operator: "operator".to_string(),
            ..Default::default()
        },
        namespaces: vec![
            NamespaceConfig {
                name: "nb-bitcoind".to_string(),
                address: "169.254.1.12".to_string(),
                peers: vec!["nb-clightning".to_string()],
            },
            NamespaceConfig {
                name: "nb-clightning".to_string(),
                address: "169.254.1.13".to_string(),
                peers: vec![],
            },
        ],
        callers: vec![CallerConfig {
            user: "operator".to_string(),
            namespaces: vec!["nb-bitcoind".to_string()],
        }],
        services: vec![ServiceConfig {
            name: "bitcoind".to_string(),
            unit: None,
            namespace: Some("nb-bitcoind".to_string()),
            ready_port: None,
            ready_log: None,
            ready_command: Some(vec![
                "bitcoin-cli".to_string(),
                "getnetworkinfo".to_string(),
            ]),
            ready_json_field: Some("version".to_string()),
        }],
        secrets: secret.into_iter().collect(),
        scenario: ScenarioConfig {
            poll_interval: Duration::from_millis(10),
            convergence_timeout: Duration::from_millis(200),
            unauthorized_caller: Some("clightning".to_string()),
            recovery: Some(RecoveryConfig {
                unit: "bitcoind-import-banlist".to_string(),
                pattern: "Importing node banlist".to_string(),
                restart_units: vec!["bitcoind".to_string()],
            }),
        },
    }
}

fn scripted_runner() -> ScriptedRunner {
    ScriptedRunner::default()
        .with_reachable("nb-bitcoind", "169.254.1.13")
        .with_output(
            "bitcoin-cli getnetworkinfo",
            0,
            "{\"version\": 270000, \"connections\": 8}",
        )
}

fn stale_banlist_observer() -> ScriptedObserver {
    // The banlist import already ran once long before the scenario; the
    // recovery check must not be satisfied by that stale line.
    let stale = DateTime::from_timestamp_micros(1_600_000_000_000_000).unwrap();
    ScriptedObserver::default()
        .with_log_line("bitcoind-import-banlist", stale, "Importing node banlist")
        .with_restart_effect("bitcoind", "bitcoind-import-banlist", "Importing node banlist")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_standard_scenario_passes() {
    let dir = tempfile::TempDir::new().unwrap();
    let secret_path = dir.path().join("dummy");
    std::fs::write(&secret_path, b"secret").unwrap();
    std::fs::set_permissions(&secret_path, std::fs::Permissions::from_mode(0o440)).unwrap();

    let owner = nix::unistd::User::from_uid(nix::unistd::getuid())
        .unwrap()
        .unwrap()
        .name;
    let group = nix::unistd::Group::from_gid(nix::unistd::getgid())
        .unwrap()
        .unwrap()
        .name;

    let config = deployment(Some(SecretConfig {
        path: secret_path,
        owner,
        group,
        mode: 0o440,
    }));
    let registry = NamespaceRegistry::from_config(&config);
    let observer = stale_banlist_observer();
    let runner = scripted_runner();
    let gateway = ScriptedGateway::new("operator", "nb-bitcoind");
    let clock = SystemClock;

    let steps = standard_steps(&config).unwrap();
    let scenario = ScenarioRunner::new(&config, &registry, &observer, &runner, &gateway, &clock);
    let report = scenario.run(&steps).await.unwrap();

    assert_eq!(report.steps.len(), steps.len());

    // The boundary step probed the outsider in every namespace plus the
    // operator outside its grant and inside it.
    let invocations = gateway.invocations.lock().unwrap();
    let outsider_probes = invocations
        .iter()
        .filter(|(caller, _)| caller == "clightning")
        .count();
    assert_eq!(outsider_probes, registry.len());
    assert!(invocations.contains(&("operator".to_string(), "nb-clightning".to_string())));
    assert!(invocations.contains(&("operator".to_string(), "nb-bitcoind".to_string())));

    // The recovery step restarted its trigger units.
    assert_eq!(
        observer.restarts.lock().unwrap().as_slice(),
        &[vec!["bitcoind".to_string()]]
    );
}

#[tokio::test]
async fn test_failed_unit_aborts_at_the_first_step() {
    let config = deployment(None);
    let registry = NamespaceRegistry::from_config(&config);
    let observer = stale_banlist_observer().with_state("bitcoind", UnitState::Failed);
    let runner = scripted_runner();
    let gateway = ScriptedGateway::new("operator", "nb-bitcoind");
    let clock = SystemClock;

    let steps = standard_steps(&config).unwrap();
    let scenario = ScenarioRunner::new(&config, &registry, &observer, &runner, &gateway, &clock);
    let err = scenario.run(&steps).await.unwrap_err();

    match err {
        ScenarioError::StepFailed { index, step, .. } => {
            assert_eq!(index, 0);
            assert_eq!(step, "await-unit-active(bitcoind)");
        }
        ScenarioError::InvalidPattern { .. } => panic!("expected step failure"),
    }
}

#[tokio::test]
async fn test_forbidden_pair_reachable_fails_the_matrix() {
    let config = deployment(None);
    let registry = NamespaceRegistry::from_config(&config);
    let observer = stale_banlist_observer();
    // clightning can unexpectedly reach bitcoind back.
    let runner = scripted_runner().with_reachable("nb-clightning", "169.254.1.12");
    let gateway = ScriptedGateway::new("operator", "nb-bitcoind");
    let clock = SystemClock;

    let steps = standard_steps(&config).unwrap();
    let scenario = ScenarioRunner::new(&config, &registry, &observer, &runner, &gateway, &clock);
    let err = scenario.run(&steps).await.unwrap_err();

    match err {
        ScenarioError::StepFailed { step, reason, .. } => {
            assert_eq!(step, "reachability-matrix");
            assert!(reason.contains("nb-clightning"));
            assert!(reason.contains("expected unreachable"));
        }
        ScenarioError::InvalidPattern { .. } => panic!("expected step failure"),
    }
}

#[tokio::test]
async fn test_missing_positive_reachability_fails_the_matrix() {
    let config = deployment(None);
    let registry = NamespaceRegistry::from_config(&config);
    let observer = stale_banlist_observer();
    // The permitted pair does not answer.
    let runner = ScriptedRunner::default().with_output(
        "bitcoin-cli getnetworkinfo",
        0,
        "{\"version\": 270000}",
    );
    let gateway = ScriptedGateway::new("operator", "nb-bitcoind");
    let clock = SystemClock;

    let steps = standard_steps(&config).unwrap();
    let scenario = ScenarioRunner::new(&config, &registry, &observer, &runner, &gateway, &clock);
    let err = scenario.run(&steps).await.unwrap_err();

    match err {
        ScenarioError::StepFailed { step, reason, .. } => {
            assert_eq!(step, "reachability-matrix");
            assert!(reason.contains("expected reachable"));
        }
        ScenarioError::InvalidPattern { .. } => panic!("expected step failure"),
    }
}

#[tokio::test]
async fn test_nonempty_capability_set_fails_the_boundary() {
    let config = deployment(None);
    let registry = NamespaceRegistry::from_config(&config);
    let observer = stale_banlist_observer();
    let runner = scripted_runner();
    let gateway = ScriptedGateway::new("operator", "nb-bitcoind")
        .with_capability_output("Current: = cap_net_admin+ep\n");
    let clock = SystemClock;

    let steps = standard_steps(&config).unwrap();
    let scenario = ScenarioRunner::new(&config, &registry, &observer, &runner, &gateway, &clock);
    let err = scenario.run(&steps).await.unwrap_err();

    match err {
        ScenarioError::StepFailed { step, reason, .. } => {
            assert_eq!(step, "gateway-boundary");
            assert!(reason.contains("Current: ="));
        }
        ScenarioError::InvalidPattern { .. } => panic!("expected step failure"),
    }
}

#[tokio::test]
async fn test_recovery_not_satisfied_by_stale_log_lines() {
    let config = deployment(None);
    let registry = NamespaceRegistry::from_config(&config);
    // The stale import line exists, but restarting produces no new one.
    let stale = DateTime::from_timestamp_micros(1_600_000_000_000_000).unwrap();
    let observer = ScriptedObserver::default().with_log_line(
        "bitcoind-import-banlist",
        stale,
        "Importing node banlist",
    );
    let runner = scripted_runner();
    let gateway = ScriptedGateway::new("operator", "nb-bitcoind");
    let clock = SystemClock;

    let steps = standard_steps(&config).unwrap();
    let scenario = ScenarioRunner::new(&config, &registry, &observer, &runner, &gateway, &clock);
    let err = scenario.run(&steps).await.unwrap_err();

    match err {
        ScenarioError::StepFailed { step, .. } => {
            assert_eq!(step, "idempotent-recovery(bitcoind-import-banlist)");
        }
        ScenarioError::InvalidPattern { .. } => panic!("expected step failure"),
    }
}

#[tokio::test]
async fn test_wrong_secret_mode_fails_verification() {
    let dir = tempfile::TempDir::new().unwrap();
    let secret_path = dir.path().join("dummy");
    std::fs::write(&secret_path, b"secret").unwrap();
    std::fs::set_permissions(&secret_path, std::fs::Permissions::from_mode(0o644)).unwrap();

    let owner = nix::unistd::User::from_uid(nix::unistd::getuid())
        .unwrap()
        .unwrap()
        .name;
    let group = nix::unistd::Group::from_gid(nix::unistd::getgid())
        .unwrap()
        .unwrap()
        .name;

    let config = deployment(Some(SecretConfig {
        path: secret_path.clone(),
        owner,
        group,
        mode: 0o440,
    }));
    let registry = NamespaceRegistry::from_config(&config);
    let observer = stale_banlist_observer();
    let runner = scripted_runner();
    let gateway = ScriptedGateway::new("operator", "nb-bitcoind");
    let clock = SystemClock;

    let steps = standard_steps(&config).unwrap();
    let scenario = ScenarioRunner::new(&config, &registry, &observer, &runner, &gateway, &clock);
    let err = scenario.run(&steps).await.unwrap_err();

    match err {
        ScenarioError::StepFailed { step, reason, .. } => {
            assert!(step.starts_with("verify-secret"));
            assert!(reason.contains("440"));
            assert!(reason.contains("644"));
        }
        ScenarioError::InvalidPattern { .. } => panic!("expected step failure"),
    }
}

#[tokio::test]
async fn test_explicit_step_list_runs_in_order() {
    let config = deployment(None);
    let registry = NamespaceRegistry::from_config(&config);
    let observer = stale_banlist_observer();
    let runner = scripted_runner();
    let gateway = ScriptedGateway::new("operator", "nb-bitcoind");
    let clock = SystemClock;

    let steps = vec![
        Step::AwaitUnitActive {
            unit: "bitcoind".to_string(),
        },
        Step::RestartUnits {
            units: vec!["bitcoind".to_string()],
        },
        Step::AssertNoFailure {
            unit: "bitcoind".to_string(),
        },
    ];
    let scenario = ScenarioRunner::new(&config, &registry, &observer, &runner, &gateway, &clock);
    let report = scenario.run(&steps).await.unwrap();

    let names: Vec<&str> = report.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "await-unit-active(bitcoind)",
            "restart-units(bitcoind)",
            "assert-no-failure(bitcoind)",
        ]
    );
}
