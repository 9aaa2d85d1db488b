//! The VM worker thread.
//!
//! One worker per launch. It owns its copy of the request and everything
//! derived from it, so it never touches caller memory. Phases run strictly
//! in order:
//!
//! 1. resolve the engine
//! 2. lay out `argv`/`envp`
//! 3. initialise
//! 4. run the main loop (blocks for the life of the VM)
//! 5. clean up, then release the arguments

use std::sync::Arc;
use std::thread;

use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span};

use crate::error::{LaunchError, WorkerError};
use crate::vm::args::ArgumentVector;
use crate::vm::engine::{EngineArguments, EngineLoader, EngineLocator};

const THREAD_NAME: &str = "vm-worker";

/// Everything the worker needs, owned.
pub(crate) struct WorkerJob {
    pub locator: EngineLocator,
    pub arguments: ArgumentVector,
    pub loader: Arc<dyn EngineLoader>,
    pub report: Option<oneshot::Sender<Result<(), WorkerError>>>,
}

/// Starts the worker detached. Returns once the thread exists.
pub(crate) fn spawn(job: WorkerJob) -> Result<(), LaunchError> {
    thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || {
            raise_priority();
            let WorkerJob {
                locator,
                arguments,
                loader,
                report,
            } = job;
            let outcome = run(&locator, arguments, loader.as_ref());
            if let Err(e) = &outcome {
                error!("VM worker failed: {e}");
            }
            if let Some(report) = report {
                // Receiver may be gone; the launch is fire-and-forget.
                let _ = report.send(outcome);
            }
        })
        .map(drop)
        .map_err(LaunchError::ThreadSpawn)
}

fn run(
    locator: &EngineLocator,
    arguments: ArgumentVector,
    loader: &dyn EngineLoader,
) -> Result<(), WorkerError> {
    let _span = info_span!("vm", argc = arguments.len()).entered();

    let mut engine = loader.load(locator)?;
    let mut args = EngineArguments::new(arguments)?;

    info!(argv = ?args.vector().to_lossy_strings(), "initialising engine");
    engine.initialize(&mut args);

    info!("entering engine main loop");
    engine.run_main_loop();

    info!("engine main loop returned; cleaning up");
    engine.cleanup();

    drop(engine);
    drop(args);
    Ok(())
}

#[cfg(target_vendor = "apple")]
fn raise_priority() {
    use std::ffi::c_int;

    const QOS_CLASS_USER_INTERACTIVE: u32 = 0x21;

    unsafe extern "C" {
        fn pthread_set_qos_class_self_np(qos_class: u32, relative_priority: c_int) -> c_int;
    }

    // SAFETY: only affects the calling thread.
    let rc = unsafe { pthread_set_qos_class_self_np(QOS_CLASS_USER_INTERACTIVE, 0) };
    if rc != 0 {
        tracing::warn!(rc, "could not raise VM worker QoS class");
    } else {
        debug!("VM worker running at user-interactive QoS");
    }
}

#[cfg(not(target_vendor = "apple"))]
fn raise_priority() {
    debug!("no QoS classes on this platform; VM worker keeps default priority");
}
