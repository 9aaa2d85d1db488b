//! Launch facade.
//!
//! [`Launcher::launch`] validates and copies the caller's request, enables
//! JIT if asked to, builds the argument vector and hands everything to a
//! detached worker thread. It returns as soon as the worker exists; the VM
//! itself runs until the guest powers off.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::info;

use crate::config::LauncherConfig;
use crate::error::{LaunchError, WorkerError};
use crate::jit::{JitGate, ProcessJit};
use crate::vm::LaunchRequest;
use crate::vm::args::build_arguments;
use crate::vm::engine::{EngineLoader, HostEngineLoader};
use crate::vm::worker::{self, WorkerJob};

/// Starts VMs on background threads.
///
/// Clones share one JIT entry lock, so concurrent launches through the same
/// launcher wait for an in-progress enablement and then see its outcome.
/// Separate launchers sharing the process controller do not; the one that
/// loses the race runs with the interpreter.
#[derive(Clone)]
pub struct Launcher {
    config: Arc<LauncherConfig>,
    loader: Arc<dyn EngineLoader>,
    jit: Arc<dyn JitGate>,
    jit_entry: Arc<Mutex<()>>,
}

impl Launcher {
    /// A launcher using real engines and the process-wide JIT controller.
    pub fn new(config: LauncherConfig) -> Self {
        Self::with_parts(config, Arc::new(HostEngineLoader), Arc::new(ProcessJit))
    }

    pub fn with_parts(
        config: LauncherConfig,
        loader: Arc<dyn EngineLoader>,
        jit: Arc<dyn JitGate>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            loader,
            jit,
            jit_entry: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Fire-and-forget launch.
    ///
    /// `request` is copied before this returns. Failures after the worker
    /// starts are only logged.
    pub fn launch(&self, request: &LaunchRequest) -> Result<(), LaunchError> {
        self.start(request, None)
    }

    /// Like [`launch`](Self::launch), with a receipt that resolves when the
    /// worker finishes.
    pub fn launch_with_receipt(&self, request: &LaunchRequest) -> Result<LaunchReceipt, LaunchError> {
        let (tx, rx) = oneshot::channel();
        self.start(request, Some(tx))?;
        Ok(LaunchReceipt { rx })
    }

    fn start(
        &self,
        request: &LaunchRequest,
        report: Option<oneshot::Sender<Result<(), WorkerError>>>,
    ) -> Result<(), LaunchError> {
        let request = self.config.inputs.copy_request(request)?;

        let jit = request.jit_enabled.then(|| {
            let _entry = self.jit_entry.lock();
            self.jit.enable_jit()
        });
        let arguments = build_arguments(&request, &self.config, jit);

        info!(
            engine = ?request.engine,
            kernel = %request.kernel_path.display(),
            disk = request.disk_path.is_some(),
            snapshot = request.snapshot.as_deref().unwrap_or("-"),
            jit = ?jit,
            "launching VM"
        );

        worker::spawn(WorkerJob {
            locator: request.engine,
            arguments,
            loader: Arc::clone(&self.loader),
            report,
        })
    }
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Resolves once the VM worker has finished all of its phases, or failed.
#[derive(Debug)]
pub struct LaunchReceipt {
    rx: oneshot::Receiver<Result<(), WorkerError>>,
}

impl LaunchReceipt {
    /// Waits asynchronously for the worker's outcome.
    pub async fn finished(self) -> Result<(), WorkerError> {
        self.rx.await.unwrap_or(Err(WorkerError::Vanished))
    }

    /// Blocks the current thread until the worker finishes.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Result<(), WorkerError> {
        self.rx.blocking_recv().unwrap_or(Err(WorkerError::Vanished))
    }

    /// The outcome, if the worker has already finished.
    pub fn try_outcome(&mut self) -> Option<Result<(), WorkerError>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(WorkerError::Vanished)),
        }
    }
}
