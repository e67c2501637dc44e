//! Identity of a process holding segment references.

use std::sync::OnceLock;

/// A process that holds references to a segment.
///
/// Pids are only comparable inside one pid namespace, so the namespace inode
/// is recorded alongside. A pid namespace of `0` means it could not be
/// determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderId {
    /// Process id as seen from `pid_ns`.
    pub pid: u32,
    /// Inode of `/proc/self/ns/pid` for the recording process.
    pub pid_ns: u64,
}

impl HolderId {
    /// Identity of the calling process (computed once).
    pub fn current() -> Self {
        static CURRENT: OnceLock<HolderId> = OnceLock::new();
        *CURRENT.get_or_init(|| HolderId {
            pid: rustix::process::getpid().as_raw_nonzero().get() as u32,
            pid_ns: current_pid_namespace(),
        })
    }

    /// Whether this holder's pid can be judged from the calling process.
    ///
    /// A holder whose namespace is unknown is never local.
    pub fn is_local(&self) -> bool {
        self.pid_ns != 0 && self.pid_ns == HolderId::current().pid_ns
    }

    /// Whether the process still exists.
    ///
    /// Only meaningful when [`is_local`](Self::is_local) is true. A process
    /// that exists but cannot be signalled (`EPERM`) counts as alive.
    pub fn is_alive(&self) -> bool {
        let Some(pid) = i32::try_from(self.pid).ok().and_then(rustix::process::Pid::from_raw) else {
            return false;
        };
        match rustix::process::test_kill_process(pid) {
            Ok(()) => true,
            Err(rustix::io::Errno::SRCH) => false,
            Err(_) => true,
        }
    }
}

fn current_pid_namespace() -> u64 {
    match rustix::fs::stat("/proc/self/ns/pid") {
        Ok(st) => st.st_ino as u64,
        Err(e) => {
            tracing::debug!("pid namespace unavailable, holders untracked across namespaces: {e}");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_is_alive_and_local() {
        let me = HolderId::current();
        assert!(me.pid > 0);
        assert!(me.is_local());
        assert!(me.is_alive());
        assert_eq!(me, HolderId::current());
    }

    #[test]
    fn test_dead_pid() {
        // Reap a child so its pid is known to be gone.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let holder = HolderId {
            pid,
            pid_ns: HolderId::current().pid_ns,
        };
        assert!(!holder.is_alive());
    }

    #[test]
    fn test_unknown_namespace_is_not_local() {
        let holder = HolderId {
            pid: HolderId::current().pid,
            pid_ns: 0,
        };
        assert!(!holder.is_local());
    }

    #[test]
    fn test_invalid_pid_is_dead() {
        let holder = HolderId { pid: 0, pid_ns: 0 };
        assert!(!holder.is_alive());
    }
}
