//! `nsgate exec` — the gateway invocation surface.
//!
//! The caller identity is the *real* uid of the invoking process
//! resolved to a user name. This is the second authorization layer: a
//! user who can reach the binary (for instance through a wrapper) is
//! still rejected by policy unless it is the configured operator.

use std::sync::Arc;

use anyhow::{Context, Result};
use nix::unistd::{getuid, User};
use nsgate_core::config::DeploymentConfig;
use nsgate_core::gateway::{ExecutionGateway, GatewayError, GatewayRequest};
use nsgate_core::policy::AuthorizationPolicy;
use nsgate_core::registry::NamespaceRegistry;

use crate::exit_codes::codes as exit_codes;

/// Run a command inside `namespace` as the invoking user.
pub async fn run(config: &DeploymentConfig, namespace: &str, command: &[String]) -> Result<i32> {
    let caller = resolve_caller()?;

    let registry = Arc::new(NamespaceRegistry::from_config(config));
    let policy = Arc::new(AuthorizationPolicy::from_config(config));
    let gateway = ExecutionGateway::new(registry, policy, config.gateway.exec_timeout);

    let request = GatewayRequest {
        caller,
        namespace: namespace.to_string(),
        command: command.to_vec(),
    };

    match gateway.execute(&request).await {
        Ok(result) => {
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            Ok(exit_codes::SUCCESS)
        }
        Err(err) => {
            eprintln!("nsgate: {err}");
            Ok(exit_code_for(&err))
        }
    }
}

/// Map a gateway failure to its exit code range.
fn exit_code_for(err: &GatewayError) -> i32 {
    match err {
        GatewayError::Unauthorized { .. } => exit_codes::UNAUTHORIZED,
        GatewayError::NamespaceNotFound { .. } => exit_codes::NAMESPACE_NOT_FOUND,
        GatewayError::ExecutionFailed { exit_code, .. } => {
            exit_code.unwrap_or(exit_codes::SPAWN_FAILED)
        }
    }
}

/// Resolve the invoking real uid to a user name.
fn resolve_caller() -> Result<String> {
    let uid = getuid();
    let user = User::from_uid(uid)
        .with_context(|| format!("failed to look up uid {uid}"))?
        .with_context(|| format!("uid {uid} has no user account"))?;
    Ok(user.name)
}
