//! Process-wide JIT enablement through the public API.
//!
//! Only Linux is exercised here: on Apple targets the real calls would put
//! the test binary under self-trace.

#![cfg(target_os = "linux")]

use jit_launcher::jit::{self, JitEnablement, JitState, probe};

#[test]
fn untraced_linux_process_falls_back_to_interpreter() {
    if probe::is_debugged() {
        // Running under a debugger reports AlreadyDebugged instead.
        assert_eq!(jit::enable_jit(), JitEnablement::AlreadyDebugged);
        return;
    }

    assert_eq!(jit::enable_jit(), JitEnablement::Failed);
    assert_eq!(jit::process_state(), JitState::Failed { traced: false });

    // Untraced failures may be retried; the outcome is the same.
    assert_eq!(jit::enable_jit(), JitEnablement::Failed);
    assert!(!jit::relay::is_running());
}
