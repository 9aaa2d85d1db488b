//! Operating-system seam for the self-trace trick.
//!
//! [`JitController`](crate::jit::JitController) only talks to the kernel
//! through [`TracePlatform`], so the enablement sequence can be exercised with
//! a scripted platform in tests.

use crate::error::JitError;
use crate::jit::{ExceptionEndpoint, probe, relay};

/// The privileged operations enablement is built from.
pub trait TracePlatform: Send + Sync {
    /// Whether a debugger already traces this process.
    fn is_debugged(&self) -> bool;

    /// Declares the process as traced by itself.
    fn trace_me(&self) -> Result<(), JitError>;

    /// Asks the kernel to turn subsequently delivered signals into software
    /// exceptions.
    fn redirect_signals(&self) -> Result<(), JitError>;

    /// Allocates a receive port and installs it as the task's handler for
    /// software exceptions.
    fn claim_exception_port(&self) -> Result<ExceptionEndpoint, JitError>;

    /// Starts the relay serving `endpoint`.
    fn start_relay(&self, endpoint: ExceptionEndpoint) -> Result<(), JitError>;
}

/// The real platform for the running process.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPlatform;

impl TracePlatform for HostPlatform {
    fn is_debugged(&self) -> bool {
        probe::is_debugged()
    }

    fn trace_me(&self) -> Result<(), JitError> {
        imp::trace_me()
    }

    fn redirect_signals(&self) -> Result<(), JitError> {
        imp::redirect_signals()
    }

    fn claim_exception_port(&self) -> Result<ExceptionEndpoint, JitError> {
        imp::claim_exception_port()
    }

    fn start_relay(&self, endpoint: ExceptionEndpoint) -> Result<(), JitError> {
        relay::start(endpoint)
    }
}

// ---------------------------------------------------------------------------
// Apple implementation
// ---------------------------------------------------------------------------

#[cfg(target_vendor = "apple")]
mod imp {
    use std::io;
    use std::ptr;

    use mach2::kern_return::KERN_SUCCESS;
    use mach2::mach_port::{mach_port_allocate, mach_port_insert_right};
    use mach2::message::MACH_MSG_TYPE_MAKE_SEND;
    use mach2::port::{MACH_PORT_NULL, MACH_PORT_RIGHT_RECEIVE, mach_port_t};
    use mach2::traps::mach_task_self;

    use crate::error::JitError;
    use crate::jit::ExceptionEndpoint;
    use crate::jit::ffi::{
        EXC_MASK_SOFTWARE, EXCEPTION_DEFAULT, PT_SIGEXC, PT_TRACE_ME, THREAD_STATE_NONE,
        mach_port_destroy, ptrace, task_set_exception_ports,
    };

    pub(super) fn trace_me() -> Result<(), JitError> {
        // SAFETY: PT_TRACE_ME takes no pointer arguments.
        let rc = unsafe { ptrace(PT_TRACE_ME, 0, ptr::null_mut(), 0) };
        if rc < 0 {
            return Err(JitError::SelfTraceRejected(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub(super) fn redirect_signals() -> Result<(), JitError> {
        // SAFETY: PT_SIGEXC takes no pointer arguments.
        let rc = unsafe { ptrace(PT_SIGEXC, 0, ptr::null_mut(), 0) };
        if rc < 0 {
            return Err(JitError::SignalRedirectFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub(super) fn claim_exception_port() -> Result<ExceptionEndpoint, JitError> {
        let mut port: mach_port_t = MACH_PORT_NULL;

        // SAFETY: plain Mach calls on our own task with a valid out-pointer.
        unsafe {
            let task = mach_task_self();

            let kr = mach_port_allocate(task, MACH_PORT_RIGHT_RECEIVE, &mut port);
            if kr != KERN_SUCCESS {
                return Err(JitError::ExceptionPortFailed {
                    call: "mach_port_allocate",
                    code: kr,
                });
            }

            let kr = mach_port_insert_right(task, port, port, MACH_MSG_TYPE_MAKE_SEND);
            if kr != KERN_SUCCESS {
                mach_port_destroy(task, port);
                return Err(JitError::ExceptionPortFailed {
                    call: "mach_port_insert_right",
                    code: kr,
                });
            }

            let kr = task_set_exception_ports(
                task,
                EXC_MASK_SOFTWARE,
                port,
                EXCEPTION_DEFAULT,
                THREAD_STATE_NONE,
            );
            if kr != KERN_SUCCESS {
                mach_port_destroy(task, port);
                return Err(JitError::ExceptionPortFailed {
                    call: "task_set_exception_ports",
                    code: kr,
                });
            }
        }

        Ok(ExceptionEndpoint::from_raw(port))
    }
}

// ---------------------------------------------------------------------------
// Everywhere else: no W^X gate to defeat, so no trick to play
// ---------------------------------------------------------------------------

#[cfg(not(target_vendor = "apple"))]
mod imp {
    use crate::error::JitError;
    use crate::jit::ExceptionEndpoint;

    pub(super) fn trace_me() -> Result<(), JitError> {
        Err(JitError::Unsupported)
    }

    pub(super) fn redirect_signals() -> Result<(), JitError> {
        Err(JitError::Unsupported)
    }

    pub(super) fn claim_exception_port() -> Result<ExceptionEndpoint, JitError> {
        Err(JitError::Unsupported)
    }
}
