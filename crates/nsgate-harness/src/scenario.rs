//! End-to-end scenario execution.
//!
//! A scenario is an ordered list of steps representing one full
//! validation pass over a deployment: unit liveness, service readiness,
//! secret permissions, the namespace reachability matrix, the gateway
//! authorization boundary, and the idempotent-recovery check. Steps run
//! strictly in order on a single task; each one blocks until it resolves.
//! The first failure aborts the scenario and names the failing step —
//! nothing is rolled back, since the harness assumes a disposable,
//! restartable environment.

use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

use nsgate_core::clock::Clock;
use nsgate_core::config::{DeploymentConfig, RecoveryConfig, SecretConfig};
use nsgate_core::registry::NamespaceRegistry;

use crate::convergence::{await_condition, WaitConfig};
use crate::observer::{UnitObserver, UnitState};
use crate::predicate::{ProbeEvaluator, ProbePredicate};
use crate::runner::{CommandRunner, ExecError, GatewayProbe};
use crate::secrets::verify_secret;

/// Log pattern the supervisor emits when a unit fails.
const FAILURE_PATTERN: &str = "Failed with result";

/// One scenario step.
#[derive(Debug, Clone)]
pub enum Step {
    /// Wait until the unit reports `active`.
    AwaitUnitActive {
        /// Unit name.
        unit: String,
    },

    /// The unit's log must be free of the supervisor failure marker.
    AssertNoFailure {
        /// Unit name.
        unit: String,
    },

    /// Wait until the predicate holds.
    Await {
        /// Predicate to converge on.
        predicate: ProbePredicate,
    },

    /// The predicate must hold right now.
    Assert {
        /// Predicate to check once.
        predicate: ProbePredicate,
    },

    /// The predicate must *not* hold right now.
    AssertFails {
        /// Predicate that must be unmet.
        predicate: ProbePredicate,
    },

    /// Verify a secret file's owner, group, and mode.
    VerifySecret {
        /// The secret to verify.
        secret: SecretConfig,
    },

    /// Probe every directed namespace pair: listed peers must be
    /// reachable, everything else must not.
    ReachabilityMatrix,

    /// Exercise the gateway authorization boundary.
    GatewayBoundary,

    /// Re-run a recovery operation after a restart; it must succeed
    /// again and log its start line exactly once.
    IdempotentRecovery {
        /// The recovery operation.
        recovery: RecoveryConfig,
    },

    /// Request the supervisor to stop units.
    StopUnits {
        /// Units to stop.
        units: Vec<String>,
    },

    /// Request the supervisor to start units.
    StartUnits {
        /// Units to start.
        units: Vec<String>,
    },

    /// Request the supervisor to restart units.
    RestartUnits {
        /// Units to restart.
        units: Vec<String>,
    },
}

impl Step {
    /// Short name used in logs and failure reports.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::AwaitUnitActive { unit } => format!("await-unit-active({unit})"),
            Self::AssertNoFailure { unit } => format!("assert-no-failure({unit})"),
            Self::Await { predicate } => format!("await: {}", predicate.describe()),
            Self::Assert { predicate } => format!("assert: {}", predicate.describe()),
            Self::AssertFails { predicate } => {
                format!("assert-fails: {}", predicate.describe())
            }
            Self::VerifySecret { secret } => {
                format!("verify-secret({})", secret.path.display())
            }
            Self::ReachabilityMatrix => "reachability-matrix".to_string(),
            Self::GatewayBoundary => "gateway-boundary".to_string(),
            Self::IdempotentRecovery { recovery } => {
                format!("idempotent-recovery({})", recovery.unit)
            }
            Self::StopUnits { units } => format!("stop-units({})", units.join(",")),
            Self::StartUnits { units } => format!("start-units({})", units.join(",")),
            Self::RestartUnits { units } => format!("restart-units({})", units.join(",")),
        }
    }
}

/// Outcome of a completed step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Step name.
    pub name: String,

    /// What was observed.
    pub detail: String,
}

/// Report for a scenario that ran to completion.
#[derive(Debug, Clone, Default)]
pub struct ScenarioReport {
    /// Completed steps in execution order.
    pub steps: Vec<StepOutcome>,
}

/// Scenario failures.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// A step failed; later steps did not run.
    #[error("step {index} ({step}) failed: {reason}")]
    StepFailed {
        /// Zero-based index of the failing step.
        index: usize,
        /// Step name.
        step: String,
        /// Observed vs expected condition.
        reason: String,
    },

    /// A configured pattern is not a valid regular expression.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Parser error.
        reason: String,
    },
}

/// Executes scenario steps in order against the deployment.
pub struct ScenarioRunner<'a, O, R, G> {
    config: &'a DeploymentConfig,
    registry: &'a NamespaceRegistry,
    observer: &'a O,
    runner: &'a R,
    gateway: &'a G,
    clock: &'a dyn Clock,
}

impl<'a, O, R, G> ScenarioRunner<'a, O, R, G>
where
    O: UnitObserver,
    R: CommandRunner,
    G: GatewayProbe,
{
    /// Create a runner over the given collaborators.
    #[must_use]
    pub const fn new(
        config: &'a DeploymentConfig,
        registry: &'a NamespaceRegistry,
        observer: &'a O,
        runner: &'a R,
        gateway: &'a G,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            config,
            registry,
            observer,
            runner,
            gateway,
            clock,
        }
    }

    /// Run `steps` in order, aborting at the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError::StepFailed`] naming the failing step and
    /// the observed vs expected condition.
    pub async fn run(&self, steps: &[Step]) -> Result<ScenarioReport, ScenarioError> {
        let wait = WaitConfig::new(
            self.config.scenario.convergence_timeout,
            self.config.scenario.poll_interval,
        );
        let evaluator = ProbeEvaluator::new(self.observer, self.runner, Duration::from_secs(1));
        let mut report = ScenarioReport::default();

        for (index, step) in steps.iter().enumerate() {
            let name = step.name();
            info!(step = %name, index, "running scenario step");

            match self.execute(step, &evaluator, wait).await {
                Ok(detail) => {
                    debug!(step = %name, %detail, "step passed");
                    report.steps.push(StepOutcome { name, detail });
                }
                Err(reason) => {
                    return Err(ScenarioError::StepFailed {
                        index,
                        step: name,
                        reason,
                    });
                }
            }
        }

        Ok(report)
    }

    async fn execute(
        &self,
        step: &Step,
        evaluator: &ProbeEvaluator<'_, O, R>,
        wait: WaitConfig,
    ) -> Result<String, String> {
        match step {
            Step::AwaitUnitActive { unit } => {
                let converged = await_condition(
                    &format!("unit '{unit}' active"),
                    || async {
                        match self.observer.unit_state(unit).await {
                            Ok(state) => Ok(state == UnitState::Active),
                            Err(e) => {
                                debug!(%unit, error = %e, "state query failed, retrying");
                                Ok(false)
                            }
                        }
                    },
                    wait,
                )
                .await
                .map_err(|e| e.to_string())?;
                Ok(format!("active after {} samples", converged.attempts))
            }

            Step::AssertNoFailure { unit } => {
                let predicate = ProbePredicate::LogPatternAbsent {
                    unit: unit.clone(),
                    pattern: compile(FAILURE_PATTERN)?,
                };
                self.assert_once(evaluator, &predicate, true).await
            }

            Step::Await { predicate } => {
                let converged = await_condition(
                    &predicate.describe(),
                    || evaluator.evaluate(predicate),
                    wait,
                )
                .await
                .map_err(|e| e.to_string())?;
                Ok(format!("met after {} samples", converged.attempts))
            }

            Step::Assert { predicate } => self.assert_once(evaluator, predicate, true).await,

            Step::AssertFails { predicate } => self.assert_once(evaluator, predicate, false).await,

            Step::VerifySecret { secret } => {
                verify_secret(secret).map_err(|e| e.to_string())?;
                Ok(format!(
                    "{} is {}:{} {:o}",
                    secret.path.display(),
                    secret.owner,
                    secret.group,
                    secret.mode
                ))
            }

            Step::ReachabilityMatrix => self.check_reachability().await,

            Step::GatewayBoundary => self.check_gateway_boundary().await,

            Step::IdempotentRecovery { recovery } => self.check_recovery(recovery, wait).await,

            Step::StopUnits { units } => {
                self.observer
                    .stop_units(units)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(format!("stopped {}", units.join(", ")))
            }

            Step::StartUnits { units } => {
                self.observer
                    .start_units(units)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(format!("started {}", units.join(", ")))
            }

            Step::RestartUnits { units } => {
                self.observer
                    .restart_units(units)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(format!("restarted {}", units.join(", ")))
            }
        }
    }

    async fn assert_once(
        &self,
        evaluator: &ProbeEvaluator<'_, O, R>,
        predicate: &ProbePredicate,
        expected: bool,
    ) -> Result<String, String> {
        let observed = evaluator
            .evaluate(predicate)
            .await
            .map_err(|e| e.to_string())?;
        if observed == expected {
            Ok(if expected {
                "satisfied".to_string()
            } else {
                "correctly unmet".to_string()
            })
        } else {
            Err(format!(
                "'{}': expected {}, observed {}",
                predicate.describe(),
                if expected { "satisfied" } else { "unmet" },
                if observed { "satisfied" } else { "unmet" },
            ))
        }
    }

    /// Probe every directed namespace pair.
    ///
    /// The positive and negative sets are derived from the topology:
    /// listed peers must answer a one-shot ping, every other pair must
    /// not. A succeeding probe on a forbidden pair is as much a failure
    /// as a silent permitted one.
    async fn check_reachability(&self) -> Result<String, String> {
        let mut checked = 0usize;
        for from in self.registry.iter() {
            for to in self.registry.iter() {
                if from.name == to.name {
                    continue;
                }
                let expected = from.peers.contains(&to.name);
                let command = vec![
                    "ping".to_string(),
                    "-c".to_string(),
                    "1".to_string(),
                    "-w".to_string(),
                    "1".to_string(),
                    to.address.clone(),
                ];
                let reached = match self.runner.run(Some(from.name.as_str()), &command).await {
                    Ok(out) => out.success(),
                    Err(e) => return Err(format!("probe {} -> {}: {e}", from.name, to.name)),
                };
                if reached != expected {
                    return Err(format!(
                        "probe {} -> {} ({}): expected {}, observed {}",
                        from.name,
                        to.name,
                        to.address,
                        reachability(expected),
                        reachability(reached),
                    ));
                }
                checked += 1;
            }
        }
        Ok(format!("{checked} directed pairs verified"))
    }

    /// Exercise the gateway authorization boundary from both sides.
    async fn check_gateway_boundary(&self) -> Result<String, String> {
        let operator = &self.config.gateway.operator;
        let grant = self
            .config
            .callers
            .iter()
            .find(|caller| caller.user == *operator)
            .ok_or_else(|| format!("operator '{operator}' has no caller entry"))?;
        let authorized_ns = grant
            .namespaces
            .first()
            .ok_or_else(|| format!("operator '{operator}' has no granted namespace"))?;
        let probe_cmd = vec!["ip".to_string(), "a".to_string()];
        let mut checks = 0usize;

        // A caller other than the operator is rejected everywhere, even
        // though it can reach the gateway binary.
        if let Some(outsider) = &self.config.scenario.unauthorized_caller {
            for ns in self.registry.names() {
                match self.gateway.execute_as(outsider, ns, &probe_cmd).await {
                    Err(ExecError::Unauthorized { .. }) => checks += 1,
                    Ok(_) => {
                        return Err(format!(
                            "caller '{outsider}' in '{ns}': expected rejection, command ran"
                        ));
                    }
                    Err(e) => {
                        return Err(format!(
                            "caller '{outsider}' in '{ns}': expected Unauthorized, got {e}"
                        ));
                    }
                }
            }
        }

        // The operator is rejected outside its granted set.
        if let Some(outside_ns) = self
            .registry
            .names()
            .find(|ns| !grant.namespaces.iter().any(|granted| granted.as_str() == *ns))
        {
            match self.gateway.execute_as(operator, outside_ns, &probe_cmd).await {
                Err(ExecError::Unauthorized { .. }) => checks += 1,
                Ok(_) => {
                    return Err(format!(
                        "operator in ungranted '{outside_ns}': expected rejection, command ran"
                    ));
                }
                Err(e) => {
                    return Err(format!(
                        "operator in ungranted '{outside_ns}': expected Unauthorized, got {e}"
                    ));
                }
            }
        }

        // The operator succeeds inside its set, and the resulting
        // process holds no capability in any set.
        let cap_cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            "capsh --print | grep '^Current:'".to_string(),
        ];
        let output = self
            .gateway
            .execute_as(operator, authorized_ns, &cap_cmd)
            .await
            .map_err(|e| format!("operator in '{authorized_ns}': expected success, got {e}"))?;
        if !output.success() {
            return Err(format!(
                "capability probe in '{authorized_ns}' exited with code {}",
                output.exit_code
            ));
        }
        let current = output.stdout.trim();
        if current != "Current: =" {
            return Err(format!(
                "capability set in '{authorized_ns}': expected 'Current: =', observed '{current}'"
            ));
        }
        checks += 1;

        Ok(format!("{checks} boundary checks passed"))
    }

    /// Re-run a recovery operation after restarting its triggers.
    ///
    /// The cursor is taken immediately before the restart so stale log
    /// lines from the previous lifecycle never satisfy the check.
    async fn check_recovery(
        &self,
        recovery: &RecoveryConfig,
        wait: WaitConfig,
    ) -> Result<String, String> {
        let cursor = DateTime::<Utc>::from_timestamp_micros(self.clock.now_micros())
            .ok_or_else(|| "clock produced an unrepresentable timestamp".to_string())?;

        self.observer
            .restart_units(&recovery.restart_units)
            .await
            .map_err(|e| e.to_string())?;

        let pattern = compile(&recovery.pattern)?;
        await_condition(
            &format!(
                "log of '{}' contains /{}/ since cursor",
                recovery.unit, recovery.pattern
            ),
            || async {
                match self.observer.unit_log(&recovery.unit, Some(cursor)).await {
                    Ok(lines) => Ok(lines.iter().any(|line| pattern.is_match(&line.text))),
                    Err(e) => {
                        debug!(unit = %recovery.unit, error = %e, "log query failed, retrying");
                        Ok(false)
                    }
                }
            },
            wait,
        )
        .await
        .map_err(|e| e.to_string())?;

        let lines = self
            .observer
            .unit_log(&recovery.unit, Some(cursor))
            .await
            .map_err(|e| e.to_string())?;

        let occurrences = lines
            .iter()
            .filter(|line| pattern.is_match(&line.text))
            .count();
        if occurrences != 1 {
            return Err(format!(
                "recovery line /{}/ in '{}' appeared {occurrences} times since restart, expected exactly once",
                recovery.pattern, recovery.unit
            ));
        }

        let failure = compile(FAILURE_PATTERN)?;
        if lines.iter().any(|line| failure.is_match(&line.text)) {
            return Err(format!(
                "unit '{}' logged a failure after the recovery re-run",
                recovery.unit
            ));
        }

        Ok(format!(
            "recovery re-run in '{}' succeeded once",
            recovery.unit
        ))
    }
}

fn reachability(reached: bool) -> &'static str {
    if reached {
        "reachable"
    } else {
        "unreachable"
    }
}

fn compile(pattern: &str) -> Result<Regex, String> {
    Regex::new(pattern).map_err(|e| format!("invalid pattern '{pattern}': {e}"))
}

/// Build the standard validation pass for a deployment.
///
/// Order follows the shape the scenario contract requires: liveness and
/// readiness first, then secret permissions, the reachability matrix,
/// the gateway boundary, and finally the idempotent-recovery check.
///
/// # Errors
///
/// Returns [`ScenarioError::InvalidPattern`] when a configured readiness
/// pattern does not compile.
pub fn standard_steps(config: &DeploymentConfig) -> Result<Vec<Step>, ScenarioError> {
    let mut steps = Vec::new();

    for service in &config.services {
        let unit = service.unit_name().to_string();
        steps.push(Step::AwaitUnitActive { unit: unit.clone() });
        steps.push(Step::AssertNoFailure { unit: unit.clone() });

        if let Some(port) = service.ready_port {
            steps.push(Step::Await {
                predicate: ProbePredicate::TcpPortOpen {
                    namespace: service.namespace.clone(),
                    host: "localhost".to_string(),
                    port,
                },
            });
        }

        if let Some(pattern) = &service.ready_log {
            let pattern = Regex::new(pattern).map_err(|e| ScenarioError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            steps.push(Step::Await {
                predicate: ProbePredicate::LogPatternPresent {
                    unit: unit.clone(),
                    pattern,
                    since: None,
                },
            });
        }

        if let Some(command) = &service.ready_command {
            let predicate = match &service.ready_json_field {
                Some(field) => ProbePredicate::JsonFieldPresent {
                    namespace: None,
                    command: command.clone(),
                    field: field.clone(),
                },
                None => ProbePredicate::CommandSucceeds {
                    namespace: None,
                    command: command.clone(),
                },
            };
            steps.push(Step::Await { predicate });
        }
    }

    for secret in &config.secrets {
        steps.push(Step::VerifySecret {
            secret: secret.clone(),
        });
    }

    steps.push(Step::ReachabilityMatrix);
    steps.push(Step::GatewayBoundary);

    if let Some(recovery) = &config.scenario.recovery {
        steps.push(Step::IdempotentRecovery {
            recovery: recovery.clone(),
        });
    }

    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsgate_core::config::{
        CallerConfig, NamespaceConfig, ScenarioConfig, ServiceConfig,
    };

    fn config() -> DeploymentConfig {
        DeploymentConfig {
            namespaces: vec![NamespaceConfig {
                name: "nb-bitcoind".to_string(),
                address: "169.254.1.12".to_string(),
                peers: vec![],
            }],
            callers: vec![CallerConfig {
                user: "operator".to_string(),
                namespaces: vec!["nb-bitcoind".to_string()],
            }],
            services: vec![ServiceConfig {
                name: "bitcoind".to_string(),
                unit: None,
                namespace: Some("nb-bitcoind".to_string()),
                ready_port: Some(8332),
                ready_log: Some("init done".to_string()),
                ready_command: Some(vec![
                    "bitcoin-cli".to_string(),
                    "getnetworkinfo".to_string(),
                ]),
                ready_json_field: Some("version".to_string()),
            }],
            scenario: ScenarioConfig {
                recovery: Some(RecoveryConfig {
                    unit: "bitcoind-import-banlist".to_string(),
                    pattern: "Importing node banlist".to_string(),
                    restart_units: vec!["bitcoind".to_string()],
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_standard_steps_order() {
        let steps = standard_steps(&config()).unwrap();
        let names: Vec<String> = steps.iter().map(Step::name).collect();

        assert_eq!(names[0], "await-unit-active(bitcoind)");
        assert_eq!(names[1], "assert-no-failure(bitcoind)");
        assert!(names[2].contains("tcp localhost:8332"));
        assert!(names[3].contains("init done"));
        assert!(names[4].contains("version"));
        let matrix = names
            .iter()
            .position(|n| n == "reachability-matrix")
            .unwrap();
        let boundary = names.iter().position(|n| n == "gateway-boundary").unwrap();
        let recovery = names
            .iter()
            .position(|n| n.starts_with("idempotent-recovery"))
            .unwrap();
        assert!(matrix < boundary);
        assert!(boundary < recovery);
    }

    #[test]
    fn test_standard_steps_rejects_bad_pattern() {
        let mut config = config();
        config.services[0].ready_log = Some("([unclosed".to_string());
        assert!(matches!(
            standard_steps(&config),
            Err(ScenarioError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_step_names_name_their_subject() {
        let step = Step::IdempotentRecovery {
            recovery: RecoveryConfig {
                unit: "bitcoind-import-banlist".to_string(),
                pattern: "Importing node banlist".to_string(),
                restart_units: vec![],
            },
        };
        assert_eq!(step.name(), "idempotent-recovery(bitcoind-import-banlist)");
    }
}
