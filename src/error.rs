//! Domain errors raised by JIT enablement, engine resolution and launching.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while acquiring the JIT permission for this process.
///
/// None of these are fatal to the process; the controller folds every one of
/// them into [`JitEnablement::Failed`](crate::jit::JitEnablement::Failed).
#[derive(Debug, Error)]
pub enum JitError {
    /// The kernel refused `PT_TRACE_ME`.
    #[error("self-trace request rejected: {0}")]
    SelfTraceRejected(#[source] io::Error),

    /// `PT_SIGEXC` failed after the self-trace succeeded.
    #[error("could not convert signals into software exceptions: {0}")]
    SignalRedirectFailed(#[source] io::Error),

    /// A Mach call made while claiming the exception port failed.
    #[error("exception port setup failed in {call} (kern_return {code})")]
    ExceptionPortFailed { call: &'static str, code: i32 },

    /// An exception relay is already serving this process.
    #[error("an exception relay is already running in this process")]
    RelayAlreadyRunning,

    /// The relay thread could not be spawned.
    #[error("failed to spawn the exception relay thread: {0}")]
    RelaySpawnFailed(#[source] io::Error),

    /// Another thread is currently running enablement.
    #[error("JIT enablement is already in progress on another thread")]
    EnablementInProgress,

    /// This platform has no self-trace mechanism.
    #[error("self-trace JIT enablement is not supported on this platform")]
    Unsupported,
}

/// Errors raised while resolving or driving the VM monitor.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine image could not be opened.
    #[error("failed to load engine image {path}: {source}")]
    LibraryLoad {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    /// One of the three entry points is missing from the engine image.
    #[error("engine image {path} does not export `{symbol}`: {source}")]
    MissingSymbol {
        path: PathBuf,
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },

    /// A statically linked engine was requested but not compiled in.
    #[error("no statically linked engine; rebuild with the `static-engine` feature")]
    StaticEngineUnavailable,

    /// An argument could not be handed to the engine.
    #[error("engine argument {index} is not a valid C string")]
    InvalidArgument { index: usize },
}

/// Errors returned synchronously by [`Launcher`](crate::vm::Launcher).
#[derive(Debug, Error)]
pub enum LaunchError {
    /// An input exceeded the configured bound and the policy is `reject`.
    #[error("{field} is {len} bytes, exceeding the {max}-byte limit")]
    InputTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// A required input is empty.
    #[error("{field} must not be empty")]
    MissingInput { field: &'static str },

    /// An input contains a NUL byte and cannot become a C string.
    #[error("{field} contains an interior NUL byte")]
    InteriorNul { field: &'static str },

    /// The VM worker thread could not be created.
    #[error("failed to spawn the VM worker thread: {0}")]
    ThreadSpawn(#[source] io::Error),
}

/// Terminal failure of a single VM worker, reported on the receipt channel.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The engine could not be resolved or initialised.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The worker went away without reporting, which means it panicked.
    #[error("the VM worker exited without reporting an outcome")]
    Vanished,
}

/// Errors raised while talking to the VM monitor socket.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// No monitor is listening at the address.
    #[error("failed to connect to the VM monitor at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Reading or writing the monitor socket failed.
    #[error("monitor I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The monitor did not return to its prompt in time.
    #[error("monitor did not answer `{command}` within {seconds} s")]
    Timeout { command: String, seconds: u64 },

    /// The monitor closed the connection.
    #[error("the VM monitor closed the connection")]
    Closed,

    /// The monitor answered a command with an error message.
    #[error("monitor rejected `{command}`: {output}")]
    Rejected { command: String, output: String },

    /// The slot marker could not be read or committed.
    #[error(transparent)]
    Slot(#[from] SlotError),
}

/// Errors raised by the instant-boot slot store.
#[derive(Debug, Error)]
pub enum SlotError {
    /// Reading or writing the slot marker failed.
    #[error("slot marker {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The slot marker holds something other than `A` or `B`.
    #[error("slot marker {path} holds {found:?}, expected \"A\" or \"B\"")]
    Corrupt { path: PathBuf, found: String },
}
