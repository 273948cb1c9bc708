//! Caller authorization policy.
//!
//! Maps a caller identity to the set of namespaces that caller may target
//! through the gateway. Default-deny: an unknown caller, or a namespace
//! outside the caller's permitted set, is rejected.
//!
//! The lookup never returns early. Every configured caller and namespace
//! entry is compared with constant-time byte equality and the results are
//! accumulated, so a denied request inspects exactly as much policy state
//! as a granted one and cannot be used to probe which entries exist. This
//! is a defense-in-depth measure, not a cryptographic constant-time
//! guarantee.

use subtle::{Choice, ConstantTimeEq};

use crate::config::DeploymentConfig;

/// A caller and the namespaces it is granted.
#[derive(Debug, Clone)]
struct CallerGrant {
    user: String,
    namespaces: Vec<String>,
}

/// Immutable caller authorization policy.
///
/// Loaded once from the deployment configuration; there is no mutation
/// API, so concurrent authorization checks require no locking.
#[derive(Debug, Clone)]
pub struct AuthorizationPolicy {
    callers: Vec<CallerGrant>,
}

impl AuthorizationPolicy {
    /// Build the policy from a validated deployment configuration.
    #[must_use]
    pub fn from_config(config: &DeploymentConfig) -> Self {
        let callers = config
            .callers
            .iter()
            .map(|caller| CallerGrant {
                user: caller.user.clone(),
                namespaces: caller.namespaces.clone(),
            })
            .collect();
        Self { callers }
    }

    /// Whether `caller` may invoke commands in `namespace`.
    ///
    /// Evaluates the full policy regardless of outcome.
    #[must_use]
    pub fn is_authorized(&self, caller: &str, namespace: &str) -> bool {
        let mut authorized = Choice::from(0u8);
        for grant in &self.callers {
            let user_match = ct_str_eq(&grant.user, caller);
            for granted in &grant.namespaces {
                authorized |= user_match & ct_str_eq(granted, namespace);
            }
        }
        authorized.unwrap_u8() == 1
    }

    /// Whether `caller` is known to the policy at all.
    ///
    /// Also scans every entry without early return.
    #[must_use]
    pub fn is_known_caller(&self, caller: &str) -> bool {
        let mut known = Choice::from(0u8);
        for grant in &self.callers {
            known |= ct_str_eq(&grant.user, caller);
        }
        known.unwrap_u8() == 1
    }
}

/// Constant-time string equality over the byte representations.
///
/// Strings of different lengths compare unequal; the comparison still
/// touches the configured entry's bytes so the scan length depends only
/// on the policy, not on the candidate.
fn ct_str_eq(configured: &str, candidate: &str) -> Choice {
    let len_eq = Choice::from(u8::from(configured.len() == candidate.len()));
    if configured.len() == candidate.len() {
        len_eq & configured.as_bytes().ct_eq(candidate.as_bytes())
    } else {
        len_eq & configured.as_bytes().ct_eq(configured.as_bytes())
    }
}
