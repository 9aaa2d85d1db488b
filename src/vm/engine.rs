//! Engine resolution.
//!
//! The VM monitor exposes three C entry points:
//!
//! ```c
//! int  qemu_init(int argc, const char *argv[], const char *envp[]);
//! void qemu_main_loop(void);
//! void qemu_cleanup(void);
//! ```
//!
//! They are resolved either from a shared library at launch time
//! ([`EngineLocator::Library`]) or from symbols linked into the binary
//! ([`EngineLocator::Static`], behind the `static-engine` feature).

use std::ffi::{CString, c_char, c_int};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;

use libloading::Library;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::vm::args::ArgumentVector;

const INIT_SYMBOL: &str = "qemu_init";
const MAIN_LOOP_SYMBOL: &str = "qemu_main_loop";
const CLEANUP_SYMBOL: &str = "qemu_cleanup";

type InitFn = unsafe extern "C" fn(c_int, *const *const c_char, *const *const c_char) -> c_int;
type MainLoopFn = unsafe extern "C" fn();
type CleanupFn = unsafe extern "C" fn();

/// Where the monitor's entry points come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineLocator {
    /// A shared library exporting the three entry points.
    Library(PathBuf),
    /// Entry points linked into this binary.
    Static,
}

// ---------------------------------------------------------------------------
// Engine trait
// ---------------------------------------------------------------------------

/// A resolved monitor, driven once by the VM worker.
///
/// The worker calls [`initialize`](Engine::initialize), then
/// [`run_main_loop`](Engine::run_main_loop), then [`cleanup`](Engine::cleanup),
/// each exactly once and in that order.
pub trait Engine: Send {
    /// Hands the monitor its arguments. `args` outlives every later phase.
    fn initialize(&mut self, args: &mut EngineArguments);

    /// Blocks for the lifetime of the VM.
    fn run_main_loop(&mut self);

    fn cleanup(&mut self);
}

/// Produces engines from locators.
pub trait EngineLoader: Send + Sync {
    fn load(&self, locator: &EngineLocator) -> Result<Box<dyn Engine>, EngineError>;
}

// ---------------------------------------------------------------------------
// EngineArguments
// ---------------------------------------------------------------------------

/// An [`ArgumentVector`] laid out as C `argv`/`envp` arrays.
///
/// Owns the NUL-terminated storage the pointer arrays refer to, so the
/// arrays stay valid for as long as this value lives. Both arrays end with a
/// null pointer.
pub struct EngineArguments {
    vector: ArgumentVector,
    _storage: Vec<CString>,
    argv: Vec<*const c_char>,
    envp: Vec<*const c_char>,
}

// SAFETY: the raw pointers point into `_storage`, which is owned by the same
// value and never mutated after construction. Moving the struct moves the
// `CString` handles, not their heap buffers, so the pointers stay valid on
// whichever thread ends up owning it.
unsafe impl Send for EngineArguments {}

impl EngineArguments {
    pub fn new(vector: ArgumentVector) -> Result<Self, EngineError> {
        let to_c = |index: usize, token: &std::ffi::OsStr| {
            CString::new(token.as_bytes()).map_err(|_| EngineError::InvalidArgument { index })
        };

        let args = vector
            .tokens()
            .iter()
            .enumerate()
            .map(|(i, t)| to_c(i, t.as_os_str()))
            .collect::<Result<Vec<_>, _>>()?;
        let env = vector
            .environment()
            .iter()
            .enumerate()
            .map(|(i, t)| to_c(args.len() + i, t.as_os_str()))
            .collect::<Result<Vec<_>, _>>()?;

        let argv = args
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();
        let envp = env
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();

        let mut storage = args;
        storage.extend(env);

        Ok(Self {
            vector,
            _storage: storage,
            argv,
            envp,
        })
    }

    pub fn vector(&self) -> &ArgumentVector {
        &self.vector
    }

    pub fn argc(&self) -> c_int {
        self.vector.len() as c_int
    }

    /// Null-terminated `argv`.
    pub fn argv(&self) -> *const *const c_char {
        self.argv.as_ptr()
    }

    /// Null-terminated `envp`.
    pub fn envp(&self) -> *const *const c_char {
        self.envp.as_ptr()
    }
}

impl std::fmt::Debug for EngineArguments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineArguments")
            .field("argv", &self.vector.to_lossy_strings())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// C engines
// ---------------------------------------------------------------------------

/// Entry points of a C monitor.
#[derive(Clone, Copy)]
struct EntryPoints {
    init: InitFn,
    main_loop: MainLoopFn,
    cleanup: CleanupFn,
}

impl EntryPoints {
    fn initialize(&self, args: &mut EngineArguments) {
        // SAFETY: argv/envp are null-terminated arrays of valid C strings
        // owned by `args`, which the worker keeps alive past cleanup.
        let status = unsafe { (self.init)(args.argc(), args.argv(), args.envp()) };
        debug!(status, "engine initialised");
    }

    fn run_main_loop(&self) {
        // SAFETY: called once, after a successful initialise.
        unsafe { (self.main_loop)() }
    }

    fn cleanup(&self) {
        // SAFETY: called once, after the main loop returned.
        unsafe { (self.cleanup)() }
    }
}

/// A monitor loaded from a shared library.
pub struct LibraryEngine {
    entry: EntryPoints,
    path: PathBuf,
    // Keeps the image mapped while `entry` is callable.
    _library: Library,
}

impl LibraryEngine {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        // SAFETY: loading runs the image's initialisers; the engine image is
        // trusted input chosen by the caller.
        let library = unsafe { Library::new(path) }.map_err(|source| EngineError::LibraryLoad {
            path: path.to_path_buf(),
            source,
        })?;

        let entry = EntryPoints {
            init: symbol(&library, path, INIT_SYMBOL)?,
            main_loop: symbol(&library, path, MAIN_LOOP_SYMBOL)?,
            cleanup: symbol(&library, path, CLEANUP_SYMBOL)?,
        };

        info!(path = %path.display(), "engine library loaded");
        Ok(Self {
            entry,
            path: path.to_path_buf(),
            _library: library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn symbol<T: Copy>(library: &Library, path: &Path, name: &'static str) -> Result<T, EngineError> {
    // SAFETY: `T` is one of the declared entry point signatures; the copied
    // function pointer is only used while `library` is kept alive.
    unsafe { library.get::<T>(name.as_bytes()) }
        .map(|sym| *sym)
        .map_err(|source| EngineError::MissingSymbol {
            path: path.to_path_buf(),
            symbol: name,
            source,
        })
}

impl Engine for LibraryEngine {
    fn initialize(&mut self, args: &mut EngineArguments) {
        self.entry.initialize(args);
    }

    fn run_main_loop(&mut self) {
        self.entry.run_main_loop();
    }

    fn cleanup(&mut self) {
        self.entry.cleanup();
    }
}

#[cfg(feature = "static-engine")]
mod linked {
    use std::ffi::{c_char, c_int};

    unsafe extern "C" {
        pub fn qemu_init(argc: c_int, argv: *const *const c_char, envp: *const *const c_char) -> c_int;
        pub fn qemu_main_loop();
        pub fn qemu_cleanup();
    }
}

/// A monitor linked into this binary.
#[cfg(feature = "static-engine")]
pub struct StaticEngine {
    entry: EntryPoints,
}

#[cfg(feature = "static-engine")]
impl StaticEngine {
    pub fn new() -> Self {
        Self {
            entry: EntryPoints {
                init: linked::qemu_init,
                main_loop: linked::qemu_main_loop,
                cleanup: linked::qemu_cleanup,
            },
        }
    }
}

#[cfg(feature = "static-engine")]
impl Default for StaticEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "static-engine")]
impl Engine for StaticEngine {
    fn initialize(&mut self, args: &mut EngineArguments) {
        self.entry.initialize(args);
    }

    fn run_main_loop(&mut self) {
        self.entry.run_main_loop();
    }

    fn cleanup(&mut self) {
        self.entry.cleanup();
    }
}

// ---------------------------------------------------------------------------
// Host loader
// ---------------------------------------------------------------------------

/// Resolves real C monitors.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostEngineLoader;

impl EngineLoader for HostEngineLoader {
    fn load(&self, locator: &EngineLocator) -> Result<Box<dyn Engine>, EngineError> {
        match locator {
            EngineLocator::Library(path) => Ok(Box::new(LibraryEngine::open(path)?)),
            #[cfg(feature = "static-engine")]
            EngineLocator::Static => Ok(Box::new(StaticEngine::new())),
            #[cfg(not(feature = "static-engine"))]
            EngineLocator::Static => Err(EngineError::StaticEngineUnavailable),
        }
    }
}
