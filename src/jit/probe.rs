//! Debug-state probe.
//!
//! Reports whether something is already tracing this process. A failed query
//! reads as "not debugged".

/// Returns `true` when the process is currently marked as being debugged.
///
/// Never fails. Query errors are logged at `debug` and reported as `false`.
pub fn is_debugged() -> bool {
    imp::is_debugged()
}

/// Extracts the `TracerPid:` value from the contents of `/proc/<pid>/status`.
///
/// Returns `None` when the field is absent or malformed.
pub fn tracer_pid(status: &str) -> Option<u32> {
    let (_, tail) = status.split_once("TracerPid:")?;
    tail.split_whitespace().next()?.parse().ok()
}

#[cfg(target_vendor = "apple")]
mod imp {
    use tracing::debug;

    use crate::jit::ffi::{CS_DEBUGGED, CS_OPS_STATUS, csops};

    pub(super) fn is_debugged() -> bool {
        let mut flags: u32 = 0;
        // SAFETY: csops writes at most `size_of::<u32>()` bytes into `flags`.
        let rc = unsafe {
            csops(
                libc::getpid(),
                CS_OPS_STATUS,
                (&raw mut flags).cast(),
                std::mem::size_of::<u32>(),
            )
        };
        if rc != 0 {
            debug!(
                error = %std::io::Error::last_os_error(),
                "csops status query failed; assuming no debugger"
            );
            return false;
        }
        flags & CS_DEBUGGED != 0
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use tracing::debug;

    pub(super) fn is_debugged() -> bool {
        match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => super::tracer_pid(&status).is_some_and(|pid| pid != 0),
            Err(e) => {
                debug!(error = %e, "could not read /proc/self/status; assuming no debugger");
                false
            }
        }
    }
}

#[cfg(not(any(target_vendor = "apple", target_os = "linux")))]
mod imp {
    pub(super) fn is_debugged() -> bool {
        false
    }
}
