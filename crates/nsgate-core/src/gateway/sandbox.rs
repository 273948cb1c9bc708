//! Namespace entry and capability dropping.
//!
//! The two-phase sequence the gateway applies to a child process before
//! exec, modeled as a typestate machine so the mandatory ordering is
//! enforced by the types: the network namespace is entered first, then
//! every privilege and capability is dropped. The reverse order is
//! unrepresentable — [`EnteredNamespace::drop_privileges`] is the only
//! way to obtain a [`SandboxedProcess`].
//!
//! [`apply`] runs inside a `pre_exec` hook, i.e. in the child after
//! `fork` and before `exec`. The closure must not allocate; all inputs
//! (namespace fd, target uid/gid) are resolved in the parent.

use std::io;
use std::os::fd::{BorrowedFd, RawFd};

use nix::libc;
use nix::sched::{setns, CloneFlags};
use nix::unistd::{setgid, setgroups, setuid, Gid, Uid};

/// Linux capability user-space header, version 3.
const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// Highest capability number probed when clearing the bounding set.
/// `PR_CAPBSET_DROP` returns `EINVAL` past the kernel's last capability,
/// which ends the loop.
const CAP_PROBE_LIMIT: u64 = 63;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Inputs for the sandbox sequence, resolved before `fork`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SandboxPlan {
    /// Open fd of the target network-namespace file.
    pub netns_fd: RawFd,
    /// Uid the command runs as.
    pub uid: libc::uid_t,
    /// Gid the command runs as.
    pub gid: libc::gid_t,
}

/// Witness that the child has entered the target network namespace.
#[derive(Debug)]
pub(crate) struct EnteredNamespace {
    uid: libc::uid_t,
    gid: libc::gid_t,
}

/// Witness that the child holds no capability in any set and cannot
/// re-acquire one.
pub(crate) struct SandboxedProcess(());

impl SandboxPlan {
    /// Phase one: move the child into the target network namespace.
    pub(crate) fn enter_network_namespace(self) -> io::Result<EnteredNamespace> {
        // Safety: the fd was opened by the parent and stays open across
        // fork; pre_exec runs before exec closes cloexec descriptors.
        let fd = unsafe { BorrowedFd::borrow_raw(self.netns_fd) };
        setns(fd, CloneFlags::CLONE_NEWNET).map_err(errno_to_io)?;
        Ok(EnteredNamespace {
            uid: self.uid,
            gid: self.gid,
        })
    }
}

impl EnteredNamespace {
    /// Phase two: drop every privilege the child still holds.
    ///
    /// Order matters within the phase: the bounding set is cleared while
    /// the child still has `CAP_SETPCAP`, then uid/gid are dropped, then
    /// the ambient set is cleared, `no_new_privs` is set, and an explicit
    /// empty `capset` leaves effective, permitted and inheritable all
    /// empty even when the target uid is 0.
    pub(crate) fn drop_privileges(self) -> io::Result<SandboxedProcess> {
        clear_bounding_set()?;

        setgroups(&[Gid::from_raw(self.gid)]).map_err(errno_to_io)?;
        setgid(Gid::from_raw(self.gid)).map_err(errno_to_io)?;
        setuid(Uid::from_raw(self.uid)).map_err(errno_to_io)?;

        // Safety: prctl with valid option constants and no pointers.
        let rc = unsafe {
            libc::prctl(
                libc::PR_CAP_AMBIENT,
                libc::PR_CAP_AMBIENT_CLEAR_ALL as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }

        // Safety: prctl with valid option constants and no pointers.
        let rc = unsafe {
            libc::prctl(
                libc::PR_SET_NO_NEW_PRIVS,
                1 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }

        clear_capability_sets()?;

        Ok(SandboxedProcess(()))
    }
}

/// Run the full sequence. The only caller is the gateway's `pre_exec`
/// hook.
pub(crate) fn apply(plan: SandboxPlan) -> io::Result<()> {
    let entered = plan.enter_network_namespace()?;
    let _sandboxed: SandboxedProcess = entered.drop_privileges()?;
    Ok(())
}

/// Remove every capability from the bounding set.
fn clear_bounding_set() -> io::Result<()> {
    for cap in 0..=CAP_PROBE_LIMIT {
        // Safety: prctl with valid option constants and no pointers.
        let rc = unsafe {
            libc::prctl(
                libc::PR_CAPBSET_DROP,
                cap as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if rc == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINVAL) {
                // Past the kernel's last supported capability.
                break;
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Set effective, permitted and inheritable to the empty set.
fn clear_capability_sets() -> io::Result<()> {
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [CapUserData {
        effective: 0,
        permitted: 0,
        inheritable: 0,
    }; 2];
    // Safety: header and data are valid for the duration of the call and
    // match the layout the kernel expects for version 3.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            std::ptr::addr_of!(header),
            data.as_ptr(),
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn errno_to_io(err: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_fails_on_non_namespace_fd() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let fd = std::fs::File::open(file.path()).unwrap();
        let plan = SandboxPlan {
            netns_fd: std::os::fd::AsRawFd::as_raw_fd(&fd),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        };
        // A regular file is not a namespace; setns must refuse it before
        // any privilege is touched.
        let err = plan.enter_network_namespace().unwrap_err();
        assert!(err.raw_os_error().is_some());
    }
}
