//! Exit codes for the nsgate CLI.
//!
//! The gateway's failure modes map to distinct code ranges so callers
//! can branch without parsing stderr.

pub mod codes {
    /// Successful execution.
    pub const SUCCESS: i32 = 0;

    /// Generic failure (a scenario step failed).
    pub const FAILURE: i32 = 1;

    /// Policy denial.
    pub const UNAUTHORIZED: i32 = 77;

    /// Target namespace absent from the registry or the filesystem.
    pub const NAMESPACE_NOT_FOUND: i32 = 78;

    /// The command could not be spawned at all.
    pub const SPAWN_FAILED: i32 = 126;
}
