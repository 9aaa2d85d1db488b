//! Self-debug JIT enablement.
//!
//! Some operating systems refuse writable-and-executable mappings unless the
//! process holds a dynamic code-signing entitlement, but grant the exception
//! implicitly while a debugger traces the process. This module obtains that
//! state without an external debugger by having the process trace itself, and
//! installs an exception relay so that signals delivered while self-traced do
//! not wedge the process.
//!
//! ## Architecture
//!
//! ```text
//! enable_jit()
//!     └─► JitController<HostPlatform>          (process-wide, guarded)
//!             ├─► probe::is_debugged()          already debugged → done
//!             ├─► ptrace(PT_TRACE_ME)           rejected         → Failed
//!             ├─► ptrace(PT_SIGEXC)
//!             ├─► claim exception port          (EXC_MASK_SOFTWARE)
//!             └─► relay::start(port)            detached "exception-relay" thread
//! ```

use once_cell::sync::Lazy;

mod controller;
#[cfg(target_vendor = "apple")]
mod ffi;
mod platform;
pub mod probe;
pub mod relay;

pub use controller::{JitController, JitState};
pub use platform::{HostPlatform, TracePlatform};

/// Outcome of a JIT enablement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitEnablement {
    /// A debugger was already attached; nothing was changed.
    AlreadyDebugged,
    /// The process now traces itself behind an exception relay.
    NewlyEnabled,
    /// Enablement is unavailable; the monitor must interpret, not JIT.
    Failed,
}

impl JitEnablement {
    /// Whether the monitor may request writable+executable memory.
    pub fn allows_jit(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// Anything that can hand out a JIT enablement outcome.
///
/// The launcher depends on this rather than on the global controller so
/// callers can supply their own policy.
pub trait JitGate: Send + Sync {
    fn enable_jit(&self) -> JitEnablement;
}

/// The receive port the relay serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEndpoint {
    port: u32,
}

impl ExceptionEndpoint {
    /// Wraps a Mach port name.
    pub fn from_raw(port: u32) -> Self {
        Self { port }
    }

    pub fn raw(self) -> u32 {
        self.port
    }
}

static PROCESS_JIT: Lazy<JitController<HostPlatform>> =
    Lazy::new(|| JitController::new(HostPlatform));

/// Enables JIT for the current process, at most once.
///
/// Later calls replay the first outcome. See [`JitController`].
pub fn enable_jit() -> JitEnablement {
    PROCESS_JIT.enable_jit()
}

/// State of the process-wide controller.
pub fn process_state() -> JitState {
    PROCESS_JIT.state()
}

/// [`JitGate`] backed by the process-wide controller.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessJit;

impl JitGate for ProcessJit {
    fn enable_jit(&self) -> JitEnablement {
        enable_jit()
    }
}
