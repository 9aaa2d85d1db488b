//! End-to-end launch lifecycle against scripted engines.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use mockall::mock;
use parking_lot::Mutex;
use rstest::{fixture, rstest};

use jit_launcher::config::LauncherConfig;
use jit_launcher::error::{EngineError, LaunchError, WorkerError};
use jit_launcher::jit::{JitEnablement, JitGate};
use jit_launcher::vm::{
    Engine, EngineArguments, EngineLoader, EngineLocator, LaunchRequest, Launcher,
};

// ---------------------------------------------------------------------------
// Recording engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Load(EngineLocator),
    Initialize { thread: Option<String>, argv: Vec<String> },
    MainLoop,
    Cleanup,
}

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    fn push(&self, event: Event) {
        self.0.lock().push(event);
    }

    fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    fn argv(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .find_map(|e| match e {
                Event::Initialize { argv, .. } => Some(argv),
                _ => None,
            })
            .expect("engine was initialised")
    }
}

struct RecordingEngine {
    journal: Journal,
    done: Option<mpsc::Sender<()>>,
}

impl Engine for RecordingEngine {
    fn initialize(&mut self, args: &mut EngineArguments) {
        self.journal.push(Event::Initialize {
            thread: std::thread::current().name().map(str::to_string),
            argv: args.vector().to_lossy_strings(),
        });
    }

    fn run_main_loop(&mut self) {
        self.journal.push(Event::MainLoop);
    }

    fn cleanup(&mut self) {
        self.journal.push(Event::Cleanup);
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

struct RecordingLoader {
    journal: Journal,
    done: Mutex<Option<mpsc::Sender<()>>>,
}

impl EngineLoader for RecordingLoader {
    fn load(&self, locator: &EngineLocator) -> Result<Box<dyn Engine>, EngineError> {
        self.journal.push(Event::Load(locator.clone()));
        Ok(Box::new(RecordingEngine {
            journal: self.journal.clone(),
            done: self.done.lock().clone(),
        }))
    }
}

struct FixedGate(JitEnablement);

impl JitGate for FixedGate {
    fn enable_jit(&self) -> JitEnablement {
        self.0
    }
}

mock! {
    Loader {}
    impl EngineLoader for Loader {
        fn load(&self, locator: &EngineLocator) -> Result<Box<dyn Engine>, EngineError>;
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Harness {
    journal: Journal,
    done: mpsc::Receiver<()>,
    launcher: Launcher,
}

fn harness(jit: JitEnablement) -> Harness {
    let journal = Journal::default();
    let (tx, done) = mpsc::channel();
    let loader = RecordingLoader {
        journal: journal.clone(),
        done: Mutex::new(Some(tx)),
    };
    let launcher = Launcher::with_parts(
        LauncherConfig::default(),
        Arc::new(loader),
        Arc::new(FixedGate(jit)),
    );
    Harness {
        journal,
        done,
        launcher,
    }
}

fn base_request() -> LaunchRequest {
    LaunchRequest {
        disk_path: Some("/d".into()),
        snapshot: Some("boot1".to_string()),
        ..LaunchRequest::new(EngineLocator::Library("/opt/engine.so".into()), "/k", "/i", "/b")
    }
}

#[fixture]
fn request() -> LaunchRequest {
    base_request()
}

fn value_after(argv: &[String], flag: &str) -> Option<String> {
    let i = argv.iter().position(|t| t == flag)?;
    argv.get(i + 1).cloned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[rstest]
fn phases_run_once_in_order_on_the_worker(request: LaunchRequest) {
    let h = harness(JitEnablement::NewlyEnabled);

    h.launcher
        .launch_with_receipt(&request)
        .expect("launch")
        .wait()
        .expect("worker succeeded");

    let events = h.journal.events();
    assert_eq!(events.len(), 4, "{events:?}");
    assert_eq!(events[0], Event::Load(request.engine.clone()));
    assert!(matches!(
        &events[1],
        Event::Initialize { thread: Some(name), .. } if name == "vm-worker"
    ));
    assert_eq!(events[2], Event::MainLoop);
    assert_eq!(events[3], Event::Cleanup);
}

#[rstest]
fn fire_and_forget_launch_still_runs_the_vm(request: LaunchRequest) {
    let h = harness(JitEnablement::AlreadyDebugged);

    h.launcher.launch(&request).expect("launch");

    h.done
        .recv_timeout(Duration::from_secs(5))
        .expect("engine cleaned up");
    assert_eq!(h.journal.events().last(), Some(&Event::Cleanup));
}

#[rstest]
fn dropping_the_receipt_does_not_stop_the_worker(request: LaunchRequest) {
    let h = harness(JitEnablement::NewlyEnabled);

    drop(h.launcher.launch_with_receipt(&request).expect("launch"));

    h.done
        .recv_timeout(Duration::from_secs(5))
        .expect("engine cleaned up");
}

#[rstest]
fn worker_sees_the_request_as_it_was_at_launch(mut request: LaunchRequest) {
    let h = harness(JitEnablement::NewlyEnabled);

    let receipt = h.launcher.launch_with_receipt(&request).expect("launch");
    request.snapshot = Some("clobbered".to_string());
    request.kernel_path = "/elsewhere".into();
    receipt.wait().expect("worker succeeded");

    let argv = h.journal.argv();
    assert_eq!(value_after(&argv, "-loadvm").as_deref(), Some("boot1"));
    assert_eq!(value_after(&argv, "-kernel").as_deref(), Some("/k"));
}

#[rstest]
#[case::enabled(JitEnablement::NewlyEnabled, true, "tcg,thread=multi,split-wx=on")]
#[case::already_debugged(JitEnablement::AlreadyDebugged, true, "tcg,thread=multi,split-wx=on")]
#[case::failed(JitEnablement::Failed, true, "tcg,thread=single")]
#[case::not_requested(JitEnablement::NewlyEnabled, false, "tcg,thread=single")]
fn accelerator_reflects_jit_outcome(
    #[case] jit: JitEnablement,
    #[case] requested: bool,
    #[case] accel: &str,
    mut request: LaunchRequest,
) {
    let h = harness(jit);
    request.jit_enabled = requested;

    h.launcher
        .launch_with_receipt(&request)
        .expect("launch")
        .wait()
        .expect("worker succeeded");

    let argv = h.journal.argv();
    assert_eq!(value_after(&argv, "-accel").as_deref(), Some(accel));
    assert_eq!(argv.last().map(String::as_str), Some("boot1"));
}

#[rstest]
fn unresolvable_engine_skips_every_phase(request: LaunchRequest) {
    let mut loader = MockLoader::new();
    loader
        .expect_load()
        .times(1)
        .returning(|_| Err(EngineError::StaticEngineUnavailable));
    let launcher = Launcher::with_parts(
        LauncherConfig::default(),
        Arc::new(loader),
        Arc::new(FixedGate(JitEnablement::Failed)),
    );

    let outcome = launcher
        .launch_with_receipt(&request)
        .expect("launch")
        .wait();

    assert!(matches!(
        outcome,
        Err(WorkerError::Engine(EngineError::StaticEngineUnavailable))
    ));
}

#[rstest]
fn over_long_input_is_refused_synchronously(mut request: LaunchRequest) {
    let mut loader = MockLoader::new();
    loader.expect_load().never();
    let launcher = Launcher::with_parts(
        LauncherConfig::default(),
        Arc::new(loader),
        Arc::new(FixedGate(JitEnablement::Failed)),
    );
    request.disk_path = Some(format!("/{}", "d".repeat(4096)).into());

    let err = launcher.launch(&request).expect_err("refused");
    assert!(matches!(err, LaunchError::InputTooLong { field: "disk", .. }));
}

#[tokio::test]
async fn receipt_resolves_asynchronously() {
    let h = harness(JitEnablement::NewlyEnabled);

    h.launcher
        .launch_with_receipt(&base_request())
        .expect("launch")
        .finished()
        .await
        .expect("worker succeeded");

    assert_eq!(h.journal.events().len(), 4);
}
