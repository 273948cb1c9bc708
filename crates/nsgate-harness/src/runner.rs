//! Command execution seams.
//!
//! Two seams separate the harness from the processes it drives:
//!
//! - [`CommandRunner`] runs probe commands, optionally inside a network
//!   namespace. The production implementation, [`HostRunner`], runs with
//!   the harness's own (root) privileges and uses `ip netns exec` for
//!   in-namespace probes — reachability probing must not depend on the
//!   gateway whose boundaries it helps verify.
//! - [`GatewayProbe`] invokes the execution gateway as an arbitrary
//!   caller, which is what the authorization-boundary assertions need.
//!
//! Both traits are implemented by scripted doubles in tests, so
//! predicates and scenarios are testable without shelling out.

use std::process::Stdio;
use std::time::Duration;

use nsgate_core::gateway::{ExecutionGateway, GatewayError, GatewayRequest};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

/// Captured outcome of a completed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the command exited zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Failures of commands that never ran to completion.
///
/// A command that ran and exited nonzero is an `Ok(ExecOutput)`; these
/// variants are reserved for requests rejected or lost before exit.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The gateway denied the request.
    #[error("caller '{caller}' unauthorized")]
    Unauthorized {
        /// The rejected caller.
        caller: String,
    },

    /// The target namespace does not exist.
    #[error("namespace '{name}' not found")]
    NamespaceNotFound {
        /// The requested namespace.
        name: String,
    },

    /// The command could not be spawned or timed out.
    #[error("spawn failed: {reason}")]
    Spawn {
        /// What went wrong.
        reason: String,
    },
}

/// Runs probe commands on the host or inside a namespace.
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Run `command`, inside `namespace` when given.
    async fn run(
        &self,
        namespace: Option<&str>,
        command: &[String],
    ) -> Result<ExecOutput, ExecError>;
}

/// Invokes the gateway as an explicit caller.
#[allow(async_fn_in_trait)]
pub trait GatewayProbe {
    /// Execute `command` in `namespace` as `caller`.
    async fn execute_as(
        &self,
        caller: &str,
        namespace: &str,
        command: &[String],
    ) -> Result<ExecOutput, ExecError>;
}

/// Production [`CommandRunner`] using the harness's own privileges.
#[derive(Debug, Clone)]
pub struct HostRunner {
    exec_timeout: Duration,
}

impl Default for HostRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl HostRunner {
    /// Create a runner with a per-command wall-clock bound.
    #[must_use]
    pub const fn new(exec_timeout: Duration) -> Self {
        Self { exec_timeout }
    }
}

impl CommandRunner for HostRunner {
    async fn run(
        &self,
        namespace: Option<&str>,
        command: &[String],
    ) -> Result<ExecOutput, ExecError> {
        let (program, args): (String, Vec<String>) = match namespace {
            Some(ns) => {
                let mut full = vec!["netns".to_string(), "exec".to_string(), ns.to_string()];
                full.extend(command.iter().cloned());
                ("ip".to_string(), full)
            }
            None => {
                let Some((program, args)) = command.split_first() else {
                    return Err(ExecError::Spawn {
                        reason: "empty command".to_string(),
                    });
                };
                (program.clone(), args.to_vec())
            }
        };

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| ExecError::Spawn {
            reason: format!("failed to spawn {program}: {e}"),
        })?;

        let output = timeout(self.exec_timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecError::Spawn {
                reason: format!("{program} timed out after {:?}", self.exec_timeout),
            })?
            .map_err(|e| ExecError::Spawn {
                reason: format!("failed to wait for {program}: {e}"),
            })?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl GatewayProbe for ExecutionGateway {
    async fn execute_as(
        &self,
        caller: &str,
        namespace: &str,
        command: &[String],
    ) -> Result<ExecOutput, ExecError> {
        let request = GatewayRequest {
            caller: caller.to_string(),
            namespace: namespace.to_string(),
            command: command.to_vec(),
        };
        match self.execute(&request).await {
            Ok(result) => Ok(ExecOutput {
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
            }),
            Err(GatewayError::Unauthorized { caller }) => Err(ExecError::Unauthorized { caller }),
            Err(GatewayError::NamespaceNotFound { name }) => {
                Err(ExecError::NamespaceNotFound { name })
            }
            Err(GatewayError::ExecutionFailed {
                exit_code: Some(code),
                reason,
            }) => Ok(ExecOutput {
                exit_code: code,
                stdout: String::new(),
                stderr: reason,
            }),
            Err(GatewayError::ExecutionFailed {
                exit_code: None,
                reason,
            }) => Err(ExecError::Spawn { reason }),
        }
    }
}
