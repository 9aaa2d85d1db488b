//! JIT enablement state machine.
//!
//! ```text
//! NotAttempted ──► InProgress ──┬─► AlreadyDebugged
//!        ▲                      ├─► Enabled
//!        └──── Failed{traced: false} ◄─┤
//!                               └─► Failed{traced: true}   (terminal)
//! ```
//!
//! The self-trace request is not reentrant, so entry is guarded: a caller
//! that arrives while another thread is in `InProgress` is turned away rather
//! than queued behind it. Successful outcomes are sticky. A failure before the
//! process was traced may be retried; a failure after it cannot, because the
//! process is already traced without its safety net.

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::JitError;
use crate::jit::platform::TracePlatform;
use crate::jit::{JitEnablement, JitGate};

/// Where the controller is in the enablement sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitState {
    NotAttempted,
    InProgress,
    AlreadyDebugged,
    Enabled,
    /// `traced` records whether `PT_TRACE_ME` had already succeeded.
    Failed { traced: bool },
}

/// Drives enablement against a [`TracePlatform`].
#[derive(Debug)]
pub struct JitController<P> {
    platform: P,
    state: Mutex<JitState>,
}

impl<P: TracePlatform> JitController<P> {
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            state: Mutex::new(JitState::NotAttempted),
        }
    }

    /// Current state, for diagnostics.
    pub fn state(&self) -> JitState {
        *self.state.lock()
    }

    /// Runs (or replays) enablement and reports the outcome.
    ///
    /// Never panics and never aborts the process; every error is logged and
    /// reported as [`JitEnablement::Failed`].
    pub fn enable_jit(&self) -> JitEnablement {
        match self.try_enable() {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "JIT enablement skipped");
                JitEnablement::Failed
            }
        }
    }

    /// Like [`enable_jit`](Self::enable_jit), but surfaces the reason a fresh
    /// attempt failed. Replayed outcomes are always `Ok`.
    pub fn try_enable(&self) -> Result<JitEnablement, JitError> {
        {
            let mut state = self.state.lock();
            match *state {
                JitState::InProgress => return Err(JitError::EnablementInProgress),
                JitState::AlreadyDebugged => return Ok(JitEnablement::AlreadyDebugged),
                JitState::Enabled => return Ok(JitEnablement::NewlyEnabled),
                JitState::Failed { traced: true } => return Ok(JitEnablement::Failed),
                JitState::NotAttempted | JitState::Failed { traced: false } => {
                    *state = JitState::InProgress;
                }
            }
        }

        let (next, result) = self.attempt();
        *self.state.lock() = next;
        result
    }

    fn attempt(&self) -> (JitState, Result<JitEnablement, JitError>) {
        if self.platform.is_debugged() {
            info!("debugger already attached; JIT permitted without self-trace");
            return (
                JitState::AlreadyDebugged,
                Ok(JitEnablement::AlreadyDebugged),
            );
        }

        if let Err(e) = self.platform.trace_me() {
            warn!(error = %e, "self-trace rejected; falling back to interpreter");
            return (JitState::Failed { traced: false }, Err(e));
        }

        let safety_net = self
            .platform
            .redirect_signals()
            .and_then(|()| self.platform.claim_exception_port())
            .and_then(|endpoint| self.platform.start_relay(endpoint));

        match safety_net {
            Ok(()) => {
                info!("self-trace active with exception relay; JIT enabled");
                (JitState::Enabled, Ok(JitEnablement::NewlyEnabled))
            }
            Err(e) => {
                error!(error = %e, "self-traced without exception relay; JIT disabled");
                (JitState::Failed { traced: true }, Err(e))
            }
        }
    }
}

impl<P: TracePlatform> JitGate for JitController<P> {
    fn enable_jit(&self) -> JitEnablement {
        JitController::enable_jit(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;

    use mockall::mock;
    use rstest::rstest;

    use super::*;
    use crate::jit::ExceptionEndpoint;

    mock! {
        Platform {}
        impl TracePlatform for Platform {
            fn is_debugged(&self) -> bool;
            fn trace_me(&self) -> Result<(), JitError>;
            fn redirect_signals(&self) -> Result<(), JitError>;
            fn claim_exception_port(&self) -> Result<ExceptionEndpoint, JitError>;
            fn start_relay(&self, endpoint: ExceptionEndpoint) -> Result<(), JitError>;
        }
    }

    fn rejected() -> JitError {
        JitError::SelfTraceRejected(std::io::Error::from_raw_os_error(libc::EPERM))
    }

    /// A platform where self-trace and every safety-net step succeed once.
    fn cooperative_platform() -> MockPlatform {
        let mut platform = MockPlatform::new();
        platform.expect_is_debugged().once().return_const(false);
        platform.expect_trace_me().once().returning(|| Ok(()));
        platform.expect_redirect_signals().once().returning(|| Ok(()));
        platform
            .expect_claim_exception_port()
            .once()
            .returning(|| Ok(ExceptionEndpoint::from_raw(0x0f03)));
        platform
            .expect_start_relay()
            .once()
            .withf(|endpoint| endpoint.raw() == 0x0f03)
            .returning(|_| Ok(()));
        platform
    }

    #[test]
    fn already_debugged_never_self_traces() {
        let mut platform = MockPlatform::new();
        platform.expect_is_debugged().once().return_const(true);
        platform.expect_trace_me().never();
        platform.expect_redirect_signals().never();
        platform.expect_claim_exception_port().never();
        platform.expect_start_relay().never();

        let controller = JitController::new(platform);

        assert_eq!(controller.enable_jit(), JitEnablement::AlreadyDebugged);
        assert_eq!(controller.state(), JitState::AlreadyDebugged);
    }

    #[test]
    fn self_trace_installs_relay_and_enables() {
        let controller = JitController::new(cooperative_platform());

        assert_eq!(controller.enable_jit(), JitEnablement::NewlyEnabled);
        assert_eq!(controller.state(), JitState::Enabled);
    }

    #[rstest]
    #[case::after_enable(cooperative_platform(), JitEnablement::NewlyEnabled)]
    #[case::after_debugger({
        let mut platform = MockPlatform::new();
        platform.expect_is_debugged().once().return_const(true);
        platform
    }, JitEnablement::AlreadyDebugged)]
    fn second_call_replays_without_touching_the_kernel(
        #[case] platform: MockPlatform,
        #[case] expected: JitEnablement,
    ) {
        // `once()` expectations fail the test if any step runs twice.
        let controller = JitController::new(platform);

        assert_eq!(controller.enable_jit(), expected);
        assert_eq!(controller.enable_jit(), expected);
        assert!(expected.allows_jit());
    }

    #[test]
    fn rejected_self_trace_fails_without_safety_net() {
        let mut platform = MockPlatform::new();
        platform.expect_is_debugged().return_const(false);
        platform.expect_trace_me().once().returning(|| Err(rejected()));
        platform.expect_redirect_signals().never();
        platform.expect_start_relay().never();

        let controller = JitController::new(platform);

        assert!(matches!(
            controller.try_enable(),
            Err(JitError::SelfTraceRejected(_))
        ));
        assert_eq!(controller.state(), JitState::Failed { traced: false });
    }

    #[test]
    fn untraced_failure_may_be_retried() {
        let mut platform = MockPlatform::new();
        platform.expect_is_debugged().times(2).return_const(false);
        let mut attempts = 0;
        platform.expect_trace_me().times(2).returning(move || {
            attempts += 1;
            if attempts == 1 { Err(rejected()) } else { Ok(()) }
        });
        platform.expect_redirect_signals().once().returning(|| Ok(()));
        platform
            .expect_claim_exception_port()
            .once()
            .returning(|| Ok(ExceptionEndpoint::from_raw(7)));
        platform.expect_start_relay().once().returning(|_| Ok(()));

        let controller = JitController::new(platform);

        assert_eq!(controller.enable_jit(), JitEnablement::Failed);
        assert_eq!(controller.enable_jit(), JitEnablement::NewlyEnabled);
    }

    #[test]
    fn relay_failure_after_self_trace_is_terminal() {
        let mut platform = MockPlatform::new();
        platform.expect_is_debugged().once().return_const(false);
        platform.expect_trace_me().once().returning(|| Ok(()));
        platform.expect_redirect_signals().once().returning(|| Ok(()));
        platform
            .expect_claim_exception_port()
            .once()
            .returning(|| Ok(ExceptionEndpoint::from_raw(7)));
        platform
            .expect_start_relay()
            .once()
            .returning(|_| Err(JitError::RelayAlreadyRunning));

        let controller = JitController::new(platform);

        assert_eq!(controller.enable_jit(), JitEnablement::Failed);
        assert_eq!(controller.state(), JitState::Failed { traced: true });
        // No second self-trace: the mock would panic on another trace_me.
        assert_eq!(controller.enable_jit(), JitEnablement::Failed);
    }

    #[test]
    fn port_failure_skips_relay() {
        let mut platform = MockPlatform::new();
        platform.expect_is_debugged().once().return_const(false);
        platform.expect_trace_me().once().returning(|| Ok(()));
        platform.expect_redirect_signals().once().returning(|| Ok(()));
        platform.expect_claim_exception_port().once().returning(|| {
            Err(JitError::ExceptionPortFailed {
                call: "mach_port_allocate",
                code: 3,
            })
        });
        platform.expect_start_relay().never();

        let controller = JitController::new(platform);

        assert_eq!(controller.enable_jit(), JitEnablement::Failed);
    }

    #[test]
    fn concurrent_entry_is_rejected() {
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let mut platform = MockPlatform::new();
        platform.expect_is_debugged().once().return_const(false);
        platform.expect_trace_me().once().returning(move || {
            entered_tx.send(()).expect("test receiver alive");
            release_rx.recv().expect("test sender alive");
            Err(rejected())
        });

        let controller = Arc::new(JitController::new(platform));
        let first = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.enable_jit())
        };

        entered_rx.recv().expect("first caller reached self-trace");
        assert_eq!(controller.state(), JitState::InProgress);
        assert!(matches!(
            controller.try_enable(),
            Err(JitError::EnablementInProgress)
        ));

        release_tx.send(()).expect("first caller waiting");
        assert_eq!(first.join().expect("no panic"), JitEnablement::Failed);
    }
}
