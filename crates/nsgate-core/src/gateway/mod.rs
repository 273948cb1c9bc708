//! The execution gateway.
//!
//! Privileged entry point that lets an authorized caller run a command
//! inside a specific service's network namespace. Authorization is
//! evaluated over the full request before anything else happens; on
//! success the child process enters the target namespace, drops every
//! capability, and only then execs the command, so the spawned process
//! sees the target namespace's interfaces and nothing else.
//!
//! The gateway holds only the read-only registry and policy. Each
//! invocation works on per-call locals, so concurrent invocations cannot
//! interfere with each other's namespace or capability state.

mod sandbox;

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::User;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::policy::AuthorizationPolicy;
use crate::registry::NamespaceRegistry;

/// A single gateway invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRequest {
    /// Caller identity (user account name).
    pub caller: String,

    /// Target namespace.
    pub namespace: String,

    /// Command and arguments.
    pub command: Vec<String>,
}

/// Outcome of a successfully executed gateway command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResult {
    /// Exit code of the command (zero here; nonzero exits surface as
    /// [`GatewayError::ExecutionFailed`] with the code attached).
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,
}

/// Gateway failure modes.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Policy denial. Never retried; reveals nothing about which
    /// namespaces exist.
    #[error("caller '{caller}' is not authorized for the requested namespace")]
    Unauthorized {
        /// The rejected caller identity.
        caller: String,
    },

    /// The target namespace is absent from the registry or its
    /// network-namespace file is missing.
    #[error("namespace '{name}' not found")]
    NamespaceNotFound {
        /// The requested namespace.
        name: String,
    },

    /// The command could not be spawned, timed out, or exited nonzero.
    #[error("execution failed: {reason}")]
    ExecutionFailed {
        /// What went wrong, including any captured output.
        reason: String,

        /// Exit code when the command ran to completion.
        exit_code: Option<i32>,
    },
}

/// The namespace-scoped execution gateway.
#[derive(Debug, Clone)]
pub struct ExecutionGateway {
    registry: Arc<NamespaceRegistry>,
    policy: Arc<AuthorizationPolicy>,
    exec_timeout: Duration,
}

impl ExecutionGateway {
    /// Create a gateway over a loaded registry and policy.
    #[must_use]
    pub fn new(
        registry: Arc<NamespaceRegistry>,
        policy: Arc<AuthorizationPolicy>,
        exec_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            policy,
            exec_timeout,
        }
    }

    /// The registry this gateway enforces.
    #[must_use]
    pub fn registry(&self) -> &NamespaceRegistry {
        &self.registry
    }

    /// Execute a command inside the requested namespace.
    ///
    /// Authorization is decided over the full request: the policy scan
    /// and the registry lookup both run to completion before any
    /// decision is taken, and an unauthorized caller receives
    /// [`GatewayError::Unauthorized`] whether or not the namespace
    /// exists.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Unauthorized`] on policy denial.
    /// - [`GatewayError::NamespaceNotFound`] when the namespace is not
    ///   registered or its netns file cannot be opened.
    /// - [`GatewayError::ExecutionFailed`] when the command cannot be
    ///   spawned, exceeds the execution timeout, or exits nonzero.
    pub async fn execute(&self, request: &GatewayRequest) -> Result<GatewayResult, GatewayError> {
        let authorized = self.policy.is_authorized(&request.caller, &request.namespace);
        let namespace = self.registry.get(&request.namespace);

        if !authorized {
            warn!(
                caller = %request.caller,
                "gateway request denied"
            );
            return Err(GatewayError::Unauthorized {
                caller: request.caller.clone(),
            });
        }

        let Some(namespace) = namespace else {
            return Err(GatewayError::NamespaceNotFound {
                name: request.namespace.clone(),
            });
        };

        let netns_path = self.registry.netns_path(&namespace.name);
        let netns_file =
            std::fs::File::open(&netns_path).map_err(|e| GatewayError::NamespaceNotFound {
                name: format!("{} ({e})", request.namespace),
            })?;

        let account =
            User::from_name(&request.caller).map_err(|e| GatewayError::ExecutionFailed {
                reason: format!("caller account lookup failed: {e}"),
                exit_code: None,
            })?;
        let Some(account) = account else {
            return Err(GatewayError::ExecutionFailed {
                reason: format!("caller account '{}' does not exist", request.caller),
                exit_code: None,
            });
        };

        let Some((program, args)) = request.command.split_first() else {
            return Err(GatewayError::ExecutionFailed {
                reason: "empty command".to_string(),
                exit_code: None,
            });
        };

        info!(
            caller = %request.caller,
            namespace = %request.namespace,
            command = %program,
            "executing gateway command"
        );

        let plan = sandbox::SandboxPlan {
            netns_fd: std::os::fd::AsRawFd::as_raw_fd(&netns_file),
            uid: account.uid.as_raw(),
            gid: account.gid.as_raw(),
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.env_clear();
        cmd.env("PATH", std::env::var("PATH").unwrap_or_default());
        cmd.env("LANG", "C.UTF-8");
        cmd.env("USER", &account.name);
        cmd.env("LOGNAME", &account.name);
        cmd.env("HOME", &account.dir);

        // Safety: the hook runs in the child between fork and exec; the
        // sandbox sequence uses raw syscalls only and does not allocate.
        unsafe {
            cmd.pre_exec(move || sandbox::apply(plan));
        }

        let child = cmd.spawn().map_err(|e| GatewayError::ExecutionFailed {
            reason: format!("failed to spawn command: {e}"),
            exit_code: None,
        })?;

        let output = match timeout(self.exec_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(GatewayError::ExecutionFailed {
                    reason: format!("failed to wait for command: {e}"),
                    exit_code: None,
                });
            }
            Err(_) => {
                warn!(command = %program, "gateway command timed out");
                return Err(GatewayError::ExecutionFailed {
                    reason: format!(
                        "command timed out after {}ms",
                        self.exec_timeout.as_millis()
                    ),
                    exit_code: None,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            debug!(command = %program, "gateway command succeeded");
            Ok(GatewayResult {
                exit_code: 0,
                stdout,
                stderr,
            })
        } else {
            let code = output.status.code().unwrap_or(-1);
            Err(GatewayError::ExecutionFailed {
                reason: format!("command exited with code {code}: {}", stderr.trim()),
                exit_code: Some(code),
            })
        }
    }
}
