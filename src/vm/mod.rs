//! Background VM execution.
//!
//! Turns a [`LaunchRequest`] into a monitor argument vector and runs the
//! monitor's initialize / main-loop / cleanup sequence on a dedicated worker
//! thread, so the caller's thread stays responsive. Also provides the
//! instant-boot slot store and a client for the monitor's control socket.

use std::path::PathBuf;

pub mod args;
pub mod engine;
mod input;
pub mod launch;
pub mod monitor;
pub mod slots;
mod worker;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Everything needed to start one VM.
///
/// Passed by reference to [`Launcher::launch`]; the launcher copies what it
/// needs before returning, so the caller may drop or reuse it immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Where the monitor's entry points come from.
    pub engine: engine::EngineLocator,

    /// Path to the guest kernel image (e.g. `bzImage`).
    pub kernel_path: PathBuf,

    /// Path to the initial ramdisk image (e.g. `initrd.img`).
    pub initrd_path: PathBuf,

    /// Directory searched for firmware/BIOS blobs.
    pub bios_dir: PathBuf,

    /// Persistent disk image; enables disk-backed boot when present.
    pub disk_path: Option<PathBuf>,

    /// Host directory exported to the guest over 9p.
    pub shared_folder: Option<PathBuf>,

    /// Snapshot to resume from instead of booting.
    pub snapshot: Option<String>,

    /// File receiving the monitor's own log output.
    pub log_path: Option<PathBuf>,

    /// Whether the caller wants JIT execution if the process allows it.
    pub jit_enabled: bool,
}

impl LaunchRequest {
    /// A request with only the required inputs and JIT requested.
    pub fn new(
        engine: engine::EngineLocator,
        kernel_path: impl Into<PathBuf>,
        initrd_path: impl Into<PathBuf>,
        bios_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            kernel_path: kernel_path.into(),
            initrd_path: initrd_path.into(),
            bios_dir: bios_dir.into(),
            disk_path: None,
            shared_folder: None,
            snapshot: None,
            log_path: None,
            jit_enabled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use args::{ArgumentVector, build_arguments};
pub use engine::{Engine, EngineArguments, EngineLoader, EngineLocator, HostEngineLoader};
pub use launch::{LaunchReceipt, Launcher};
pub use monitor::MonitorClient;
pub use slots::{BootSlot, BootSlots};
