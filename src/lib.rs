//! jit-launcher: run a VM monitor in-process with JIT where the OS allows it.
//!
//! Two halves:
//!
//! - [`jit`] obtains permission for writable+executable memory by having the
//!   process trace itself, and relays the exceptions that result.
//! - [`vm`] builds the monitor's argument vector and drives the monitor on a
//!   background worker thread, choosing the JIT or interpreter accelerator
//!   based on the outcome of [`jit::enable_jit`].

pub mod config;
pub mod error;
pub mod jit;
pub mod logging;
pub mod paths;
pub mod vm;

pub use config::LauncherConfig;
pub use error::{EngineError, JitError, LaunchError, MonitorError, SlotError, WorkerError};
pub use jit::{JitEnablement, JitGate, enable_jit};
pub use vm::{LaunchReceipt, LaunchRequest, Launcher};
