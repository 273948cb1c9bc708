//! Secret file verification.
//!
//! Secrets are distributed with strict filesystem permissions: owned by
//! a privileged account, group-restricted, and mode `0440` in the
//! reference deployment. Any deviation is a verification failure, not a
//! runtime error — the check compares the observed `owner:group mode`
//! tuple against the configured one and reports both on mismatch.

use nix::sys::stat;
use nix::unistd::{Gid, Group, Uid, User};
use nsgate_core::config::SecretConfig;
use thiserror::Error;

/// Secret verification failures.
#[derive(Debug, Error)]
pub enum SecretError {
    /// The file could not be inspected at all.
    #[error("cannot inspect secret '{path}': {reason}")]
    Inspect {
        /// The secret path.
        path: String,
        /// Why the inspection failed.
        reason: String,
    },

    /// The observed ownership or mode differs from the required tuple.
    #[error("secret '{path}' is {observed}, expected {expected}")]
    Mismatch {
        /// The secret path.
        path: String,
        /// Observed `owner:group mode` tuple.
        observed: String,
        /// Expected `owner:group mode` tuple.
        expected: String,
    },
}

/// Verify that a secret file matches its required owner, group, and
/// exact mode bits.
///
/// # Errors
///
/// Returns [`SecretError::Inspect`] when the file cannot be stat'ed or
/// its owner/group ids cannot be resolved to names, and
/// [`SecretError::Mismatch`] when the observed tuple differs.
pub fn verify_secret(spec: &SecretConfig) -> Result<(), SecretError> {
    let path = spec.path.display().to_string();

    let st = stat::stat(&spec.path).map_err(|e| SecretError::Inspect {
        path: path.clone(),
        reason: e.to_string(),
    })?;

    let owner = User::from_uid(Uid::from_raw(st.st_uid))
        .map_err(|e| SecretError::Inspect {
            path: path.clone(),
            reason: format!("uid {} lookup failed: {e}", st.st_uid),
        })?
        .map_or_else(|| st.st_uid.to_string(), |user| user.name);

    let group = Group::from_gid(Gid::from_raw(st.st_gid))
        .map_err(|e| SecretError::Inspect {
            path: path.clone(),
            reason: format!("gid {} lookup failed: {e}", st.st_gid),
        })?
        .map_or_else(|| st.st_gid.to_string(), |group| group.name);

    #[allow(clippy::cast_possible_truncation)]
    let mode = (st.st_mode as u32) & 0o7777;

    let observed = format!("{owner}:{group} {mode:o}");
    let expected = format!("{}:{} {:o}", spec.owner, spec.group, spec.mode);

    if observed == expected {
        Ok(())
    } else {
        Err(SecretError::Mismatch {
            path,
            observed,
            expected,
        })
    }
}
