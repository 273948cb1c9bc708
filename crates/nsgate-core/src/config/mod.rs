//! Deployment configuration parsing and validation.
//!
//! This module handles parsing of deployment configuration files (TOML)
//! that define the namespace topology, authorized callers, supervised
//! services, and secret file invariants.
//!
//! The configuration is loaded exactly once at process start and never
//! mutated afterwards; updates require reloading the whole mapping, so
//! concurrent lookups can never observe a partial update.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level deployment configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeploymentConfig {
    /// Gateway configuration.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Namespace topology.
    #[serde(default)]
    pub namespaces: Vec<NamespaceConfig>,

    /// Callers authorized to use the gateway.
    #[serde(default)]
    pub callers: Vec<CallerConfig>,

    /// Supervised services and their readiness probes.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Secret files whose ownership and mode are verified.
    #[serde(default)]
    pub secrets: Vec<SecretConfig>,

    /// Scenario settings for the verification harness.
    #[serde(default)]
    pub scenario: ScenarioConfig,
}

impl DeploymentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// Validation is fail-closed: a configuration that references an
    /// undeclared namespace, declares a duplicate name, or omits the
    /// operator from the caller list is rejected at load time rather than
    /// at first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut names = BTreeSet::new();
        for ns in &self.namespaces {
            if ns.name.is_empty() {
                return Err(ConfigError::Validation(
                    "namespace with empty name".to_string(),
                ));
            }
            if !names.insert(ns.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate namespace '{}'",
                    ns.name
                )));
            }
        }

        for ns in &self.namespaces {
            for peer in &ns.peers {
                if !names.contains(peer.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "namespace '{}' lists undeclared peer '{}'",
                        ns.name, peer
                    )));
                }
            }
        }

        let mut users = BTreeSet::new();
        for caller in &self.callers {
            if !users.insert(caller.user.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate caller '{}'",
                    caller.user
                )));
            }
            for ns in &caller.namespaces {
                if !names.contains(ns.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "caller '{}' references undeclared namespace '{}'",
                        caller.user, ns
                    )));
                }
            }
        }

        if !users.contains(self.gateway.operator.as_str()) {
            return Err(ConfigError::Validation(format!(
                "operator '{}' is not in the caller list",
                self.gateway.operator
            )));
        }

        for service in &self.services {
            if let Some(ns) = &service.namespace {
                if !names.contains(ns.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "service '{}' references undeclared namespace '{}'",
                        service.name, ns
                    )));
                }
            }
        }

        for secret in &self.secrets {
            if secret.mode & !0o777 != 0 {
                return Err(ConfigError::Validation(format!(
                    "secret '{}' has mode bits outside 0o777: {:o}",
                    secret.path.display(),
                    secret.mode
                )));
            }
        }

        if let Some(recovery) = &self.scenario.recovery {
            if recovery.unit.is_empty() || recovery.pattern.is_empty() {
                return Err(ConfigError::Validation(
                    "recovery section requires both 'unit' and 'pattern'".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// The single operator account allowed to invoke the gateway.
    #[serde(default = "default_operator")]
    pub operator: String,

    /// Directory holding named network namespace files.
    #[serde(default = "default_netns_dir")]
    pub netns_dir: PathBuf,

    /// Wall-clock bound for a single gateway command.
    #[serde(default = "default_exec_timeout")]
    #[serde(with = "humantime_serde")]
    pub exec_timeout: Duration,
}

fn default_operator() -> String {
    "operator".to_string()
}

fn default_netns_dir() -> PathBuf {
    PathBuf::from("/run/netns")
}

const fn default_exec_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            operator: default_operator(),
            netns_dir: default_netns_dir(),
            exec_timeout: default_exec_timeout(),
        }
    }
}

/// A single network namespace and the peers it may reach.
///
/// Peer sets are directed: `a` listing `b` permits probes from `a` to
/// `b` and says nothing about the reverse direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Namespace identifier, also the file name under `netns_dir`.
    pub name: String,

    /// Link-local address of the service confined to this namespace.
    pub address: String,

    /// Namespaces this one is permitted to reach.
    #[serde(default)]
    pub peers: Vec<String>,
}

/// A caller identity and the namespaces it may target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerConfig {
    /// User account name.
    pub user: String,

    /// Namespaces this caller may invoke commands in.
    #[serde(default)]
    pub namespaces: Vec<String>,
}

/// A supervised service and its readiness probes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name.
    pub name: String,

    /// Supervisor unit name. Defaults to the service name.
    #[serde(default)]
    pub unit: Option<String>,

    /// Namespace the service is confined to, if any.
    #[serde(default)]
    pub namespace: Option<String>,

    /// TCP port that must accept connections once the service is ready.
    #[serde(default)]
    pub ready_port: Option<u16>,

    /// Log pattern that must appear once the service is ready.
    #[serde(default)]
    pub ready_log: Option<String>,

    /// Command that must succeed once the service is ready.
    #[serde(default)]
    pub ready_command: Option<Vec<String>>,

    /// JSON field that must be present in the ready command's output.
    #[serde(default)]
    pub ready_json_field: Option<String>,
}

impl ServiceConfig {
    /// Supervisor unit name for this service.
    #[must_use]
    pub fn unit_name(&self) -> &str {
        self.unit.as_deref().unwrap_or(&self.name)
    }
}

/// A secret file whose ownership and mode are verified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretConfig {
    /// Absolute path of the secret file.
    pub path: PathBuf,

    /// Required owner account.
    pub owner: String,

    /// Required group.
    pub group: String,

    /// Required permission bits, e.g. `0o440`.
    pub mode: u32,
}

/// Settings for the verification scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Interval between predicate samples.
    #[serde(default = "default_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Deadline for a single convergence check.
    #[serde(default = "default_convergence_timeout")]
    #[serde(with = "humantime_serde")]
    pub convergence_timeout: Duration,

    /// A caller that must be rejected by the gateway for every namespace.
    #[serde(default)]
    pub unauthorized_caller: Option<String>,

    /// Idempotent-recovery check run after a service restart.
    #[serde(default)]
    pub recovery: Option<RecoveryConfig>,
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_convergence_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            convergence_timeout: default_convergence_timeout(),
            unauthorized_caller: None,
            recovery: None,
        }
    }
}

/// An import/recovery operation that must tolerate being re-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Unit performing the recovery operation.
    pub unit: String,

    /// Log line the operation emits when it starts.
    pub pattern: String,

    /// Units restarted to trigger the re-run.
    #[serde(default)]
    pub restart_units: Vec<String>,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[source] std::io::Error),

    /// TOML parsing failed.
    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    /// TOML serialization failed.
    #[error("failed to serialize config: {0}")]
    Serialize(#[source] toml::ser::Error),

    /// Configuration is structurally invalid.
    #[error("invalid config: {0}")]
    Validation(String),
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        [gateway]
        operator = "operator"
        netns_dir = "/run/netns"
        exec_timeout = "30s"

        [[namespaces]]
        name = "nb-bitcoind"
        address = "169.254.1.12"
        peers = ["nb-clightning", "nb-electrs"]

        [[namespaces]]
        name = "nb-clightning"
        address = "169.254.1.13"
        peers = ["nb-bitcoind"]

        [[namespaces]]
        name = "nb-electrs"
        address = "169.254.1.16"
        peers = ["nb-bitcoind"]

        [[callers]]
        user = "operator"
        namespaces = ["nb-bitcoind", "nb-clightning"]

        [[services]]
        name = "bitcoind"
        namespace = "nb-bitcoind"
        ready_command = ["bitcoin-cli", "getnetworkinfo"]
        ready_json_field = "version"

        [[secrets]]
        path = "/secrets/dummy"
        owner = "root"
        group = "root"
        mode = 0o440

        [scenario]
        poll_interval = "1s"
        convergence_timeout = "30s"
        unauthorized_caller = "clightning"
    "#;

    #[test]
    fn test_parse_example() {
        let config = DeploymentConfig::from_toml(EXAMPLE).unwrap();
        assert_eq!(config.gateway.operator, "operator");
        assert_eq!(config.gateway.exec_timeout, Duration::from_secs(30));
        assert_eq!(config.namespaces.len(), 3);
        assert_eq!(config.namespaces[0].peers.len(), 2);
        assert_eq!(config.callers[0].namespaces.len(), 2);
        assert_eq!(config.secrets[0].mode, 0o440);
        assert_eq!(config.scenario.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_roundtrip() {
        let config = DeploymentConfig::from_toml(EXAMPLE).unwrap();
        let serialized = config.to_toml().unwrap();
        let reparsed = DeploymentConfig::from_toml(&serialized).unwrap();
        assert_eq!(reparsed.namespaces.len(), config.namespaces.len());
        assert_eq!(reparsed.gateway.exec_timeout, config.gateway.exec_timeout);
    }

    #[test]
    fn test_rejects_undeclared_peer() {
        let content = r#"
            [[namespaces]]
            name = "a"
            address = "169.254.1.2"
            peers = ["missing"]

            [[callers]]
            user = "operator"
            namespaces = ["a"]
        "#;
        let err = DeploymentConfig::from_toml(content).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_duplicate_namespace() {
        let content = r#"
            [[namespaces]]
            name = "a"
            address = "169.254.1.2"

            [[namespaces]]
            name = "a"
            address = "169.254.1.3"

            [[callers]]
            user = "operator"
        "#;
        let err = DeploymentConfig::from_toml(content).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_missing_operator() {
        let content = r#"
            [[namespaces]]
            name = "a"
            address = "169.254.1.2"

            [[callers]]
            user = "someone-else"
            namespaces = ["a"]
        "#;
        let err = DeploymentConfig::from_toml(content).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_secret_mode_outside_permission_bits() {
        let content = r#"
            [[callers]]
            user = "operator"

            [[secrets]]
            path = "/secrets/dummy"
            owner = "root"
            group = "root"
            mode = 0o4440
        "#;
        let err = DeploymentConfig::from_toml(content).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_caller_referencing_unknown_namespace_is_rejected() {
        let content = r#"
            [[namespaces]]
            name = "a"
            address = "169.254.1.2"

            [[callers]]
            user = "operator"
            namespaces = ["a", "b"]
        "#;
        let err = DeploymentConfig::from_toml(content).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
