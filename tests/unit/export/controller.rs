use super::*;
use crate::export::engine::CompletionHandler;
use crate::export::library::DirectoryLibrary;
use crate::foundation::core::Fps;
use crate::foundation::error::ExportEngineError;
use crate::graph::dsl::CompositionBuilder;
use crate::ops::OperationRegistry;
use serde_json::Value;
use std::sync::Mutex;

/// Engine whose sessions only end when the test says so.
#[derive(Default)]
struct Script {
    created: Vec<PathBuf>,
    existed_at_create: Vec<bool>,
    callbacks: Vec<Option<CompletionHandler>>,
    cancelled: Vec<usize>,
    progress: f32,
    fail_create: bool,
}

struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
}

impl ExportEngine for ScriptedEngine {
    type Session = usize;

    fn create_session(
        &mut self,
        _graph: Arc<Graph>,
        _preset: QualityPreset,
        output: &Path,
    ) -> Result<usize, ExportEngineError> {
        let mut s = self.script.lock().unwrap();
        if s.fail_create {
            return Err(ExportEngineError::new("disk full"));
        }
        s.existed_at_create.push(output.exists());
        std::fs::write(output, b"video").unwrap();
        s.created.push(output.to_path_buf());
        s.callbacks.push(None);
        Ok(s.created.len() - 1)
    }

    fn export_async(&mut self, session: &usize, on_terminal: CompletionHandler) {
        self.script.lock().unwrap().callbacks[*session] = Some(on_terminal);
    }

    fn cancel(&mut self, session: &usize) {
        self.script.lock().unwrap().cancelled.push(*session);
    }

    fn progress(&self, _session: &usize) -> Option<f32> {
        Some(self.script.lock().unwrap().progress)
    }

    fn status(&self, session: &usize) -> SessionStatus {
        if self.script.lock().unwrap().cancelled.contains(session) {
            SessionStatus::Cancelled
        } else {
            SessionStatus::Exporting
        }
    }
}

#[derive(Clone, Default)]
struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn progress_count(&self) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.starts_with("progress"))
            .count()
    }
}

impl ExportObserver for Recorder {
    fn on_progress(&mut self, id: ExportId, progress: f32, _status: SessionStatus) {
        self.log
            .lock()
            .unwrap()
            .push(format!("progress {} {progress}", id.0));
    }

    fn on_terminal(
        &mut self,
        id: ExportId,
        state: ExportState,
        _error: Option<&FramegraphError>,
    ) {
        self.log
            .lock()
            .unwrap()
            .push(format!("terminal {} {state:?}", id.0));
    }

    fn on_library(&mut self, id: ExportId, result: Result<(), &FramegraphError>) {
        let r = if result.is_ok() { "ok" } else { "err" };
        self.log.lock().unwrap().push(format!("library {} {r}", id.0));
    }
}

struct Harness {
    handle: ExportHandle,
    script: Arc<Mutex<Script>>,
    library: Arc<DirectoryLibrary>,
    recorder: Recorder,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new(library: impl FnOnce(&Path) -> DirectoryLibrary, opts: ExportControllerOpts) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let script = Arc::new(Mutex::new(Script::default()));
        let library = Arc::new(library(&dir.path().join("library")));
        let recorder = Recorder::default();
        let handle = ExportController::new(
            ScriptedEngine {
                script: Arc::clone(&script),
            },
            Arc::clone(&library) as Arc<dyn LibraryWriter>,
            opts,
        )
        .with_observer(recorder.clone())
        .spawn();
        Self {
            handle,
            script,
            library,
            recorder,
            dir,
        }
    }

    fn authorized() -> Self {
        Self::new(
            |dir| DirectoryLibrary::authorized(dir),
            ExportControllerOpts::default(),
        )
    }

    fn out(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    async fn start(&self, name: &str) -> ExportId {
        let id = self.handle.start(graph(), self.out(name)).unwrap();
        self.wait(|s| s.id == Some(id) && s.state != ExportState::Idle)
            .await;
        id
    }

    async fn wait(&self, pred: impl Fn(&ExportSnapshot) -> bool) -> ExportSnapshot {
        self.handle.wait_until(pred).await.unwrap()
    }

    fn finish(&self, session: usize, outcome: EngineOutcome) {
        let cb = self.script.lock().unwrap().callbacks[session].take();
        cb.expect("session was never started")(outcome);
    }

    fn set_progress(&self, p: f32) {
        self.script.lock().unwrap().progress = p;
    }
}

fn graph() -> Arc<Graph> {
    let comp = CompositionBuilder::new(Fps::new(30, 1).unwrap(), 90)
        .source("clip", 8, 8)
        .op("aa", "fxaa", Value::Null)
        .connect("clip", "aa", 0)
        .output("aa")
        .build()
        .unwrap();
    Arc::new(Graph::build(&comp, &OperationRegistry::with_builtins()).unwrap())
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn ticks_report_monotonic_progress() {
    let h = Harness::authorized();
    let id = h.start("out.mp4").await;
    let snap = h.handle.snapshot();
    assert_eq!(snap.state, ExportState::Exporting);
    assert!(snap.timer_active);
    assert_eq!(snap.live_timers, 1);

    h.set_progress(0.25);
    sleep_ms(160).await;
    assert_eq!(h.handle.snapshot().progress, 0.25);
    assert_eq!(h.handle.snapshot().status, SessionStatus::Exporting);

    h.set_progress(0.1);
    sleep_ms(150).await;
    assert_eq!(h.handle.snapshot().progress, 0.25);

    h.set_progress(0.6);
    sleep_ms(150).await;
    assert_eq!(h.handle.snapshot().progress, 0.6);
    assert_eq!(h.recorder.progress_count(), 3);
    assert_eq!(h.handle.snapshot().id, Some(id));
}

#[tokio::test(start_paused = true)]
async fn completion_hands_off_to_library_once() {
    let h = Harness::authorized();
    let id = h.start("out.mp4").await;
    h.set_progress(0.5);
    sleep_ms(200).await;

    h.finish(0, EngineOutcome::Completed);
    let snap = h
        .wait(|s| s.id == Some(id) && s.library == LibraryState::Saved)
        .await;

    assert_eq!(snap.state, ExportState::Completed);
    assert_eq!(snap.progress, 1.0);
    assert_eq!(snap.status, SessionStatus::Completed);
    assert!(!snap.timer_active);
    assert_eq!(snap.live_timers, 0);
    assert_eq!(snap.library_writes, 1);
    assert_eq!(h.library.write_count(), 1);
    assert!(h.library.dir().join("out.mp4").exists());

    let log = h.recorder.entries();
    let done = log.iter().position(|e| e == "terminal 1 Completed").unwrap();
    assert_eq!(log[done - 1], "progress 1 1");
    assert_eq!(log.last().map(String::as_str), Some("library 1 ok"));

    let ticks = h.recorder.progress_count();
    sleep_ms(1_000).await;
    assert_eq!(h.recorder.progress_count(), ticks);
}

#[tokio::test(start_paused = true)]
async fn cancel_shortly_after_start_stops_within_one_tick() {
    let h = Harness::authorized();
    let id = h.start("out.mp4").await;
    sleep_ms(50).await;

    let t0 = tokio::time::Instant::now();
    h.handle.cancel().unwrap();
    let snap = h
        .wait(|s| s.id == Some(id) && s.state == ExportState::Cancelled)
        .await;
    assert!(t0.elapsed() <= Duration::from_millis(150));
    assert!(!snap.timer_active);
    assert_eq!(snap.live_timers, 0);
    assert_eq!(h.script.lock().unwrap().cancelled, vec![0]);

    // The engine may still report after a cancel request.
    h.finish(0, EngineOutcome::Completed);
    sleep_ms(500).await;
    let after = h.handle.snapshot();
    assert_eq!(after.state, ExportState::Cancelled);
    assert_eq!(after.library, LibraryState::NotStarted);
    assert_eq!(after.library_writes, 0);
    assert_eq!(after.live_timers, 0);
    assert_eq!(h.library.write_count(), 0);
    assert_eq!(h.recorder.progress_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn restart_supersedes_running_export() {
    let h = Harness::authorized();
    let first = h.start("a.mp4").await;
    sleep_ms(160).await;
    let second = h.start("b.mp4").await;

    let snap = h.handle.snapshot();
    assert_eq!(snap.id, Some(second));
    assert_eq!(snap.state, ExportState::Exporting);
    assert_eq!(snap.live_timers, 1);
    assert_eq!(snap.peak_live_timers, 1);
    assert_eq!(h.script.lock().unwrap().cancelled, vec![0]);
    assert!(
        h.recorder
            .entries()
            .contains(&format!("terminal {} Cancelled", first.0))
    );

    // Late completion of the superseded session.
    h.finish(0, EngineOutcome::Completed);
    sleep_ms(400).await;
    let snap = h.handle.snapshot();
    assert_eq!(snap.id, Some(second));
    assert_eq!(snap.state, ExportState::Exporting);
    assert!(snap.timer_active);
    assert_eq!(h.library.write_count(), 0);

    h.finish(1, EngineOutcome::Completed);
    let snap = h
        .wait(|s| s.id == Some(second) && s.library == LibraryState::Saved)
        .await;
    assert_eq!(snap.peak_live_timers, 1);
    assert_eq!(h.library.write_count(), 1);
    assert!(h.library.dir().join("b.mp4").exists());
}

#[tokio::test(start_paused = true)]
async fn engine_failure_is_terminal() {
    let h = Harness::authorized();
    let id = h.start("out.mp4").await;
    h.finish(0, EngineOutcome::Failed(ExportEngineError::new("codec error")));
    let snap = h
        .wait(|s| s.id == Some(id) && s.state == ExportState::Failed)
        .await;
    assert!(snap.last_error.unwrap().contains("codec error"));
    assert_eq!(snap.live_timers, 0);

    sleep_ms(1_000).await;
    assert_eq!(h.recorder.progress_count(), 0);
    assert_eq!(h.library.write_count(), 0);
    assert_eq!(h.handle.snapshot().library, LibraryState::NotStarted);
}

#[tokio::test(start_paused = true)]
async fn session_creation_failure_never_arms_a_timer() {
    let h = Harness::authorized();
    h.script.lock().unwrap().fail_create = true;
    let id = h.handle.start(graph(), h.out("out.mp4")).unwrap();
    let snap = h
        .wait(|s| s.id == Some(id) && s.state == ExportState::Failed)
        .await;
    assert!(snap.last_error.unwrap().contains("disk full"));
    assert_eq!(snap.peak_live_timers, 0);
    assert_eq!(
        h.recorder.entries(),
        vec![format!("terminal {} Failed", id.0)]
    );
}

#[tokio::test(start_paused = true)]
async fn denied_authorization_keeps_file_and_can_be_retried() {
    let h = Harness::new(
        |dir| DirectoryLibrary::new(dir).deny_requests(),
        ExportControllerOpts::default(),
    );
    let id = h.start("out.mp4").await;
    h.finish(0, EngineOutcome::Completed);
    let snap = h
        .wait(|s| s.id == Some(id) && s.library == LibraryState::PermissionDenied)
        .await;

    assert_eq!(snap.state, ExportState::Completed);
    assert_eq!(snap.library_writes, 0);
    assert!(snap.last_error.unwrap().starts_with("permission denied"));
    assert!(h.out("out.mp4").exists());
    assert_eq!(h.library.write_count(), 0);
    assert_eq!(h.recorder.entries().last().unwrap(), "library 1 err");

    h.library.set_grant_requests(true);
    h.handle.retry_library_write().unwrap();
    let snap = h
        .wait(|s| s.id == Some(id) && s.library == LibraryState::Saved)
        .await;
    assert_eq!(snap.library_writes, 1);
    assert_eq!(h.library.write_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_is_ignored_without_a_refused_write() {
    let h = Harness::authorized();
    h.handle.retry_library_write().unwrap();
    let id = h.start("out.mp4").await;
    h.handle.retry_library_write().unwrap();
    sleep_ms(10).await;
    assert_eq!(h.handle.snapshot().library, LibraryState::NotStarted);

    h.finish(0, EngineOutcome::Completed);
    h.wait(|s| s.id == Some(id) && s.library == LibraryState::Saved)
        .await;
    h.handle.retry_library_write().unwrap();
    sleep_ms(10).await;
    assert_eq!(h.library.write_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn existing_output_is_removed_unless_disabled() {
    let h = Harness::authorized();
    std::fs::write(h.out("out.mp4"), b"old").unwrap();
    h.start("out.mp4").await;
    assert_eq!(h.script.lock().unwrap().existed_at_create, vec![false]);

    let keep = Harness::new(
        |dir| DirectoryLibrary::authorized(dir),
        ExportControllerOpts {
            remove_existing_output: false,
            ..ExportControllerOpts::default()
        },
    );
    std::fs::write(keep.out("out.mp4"), b"old").unwrap();
    keep.start("out.mp4").await;
    assert_eq!(keep.script.lock().unwrap().existed_at_create, vec![true]);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_last_handle_cancels() {
    let h = Harness::authorized();
    let id = h.start("out.mp4").await;
    let mut rx = h.handle.subscribe();
    let extra = h.handle.clone();
    drop(h.handle);
    sleep_ms(10).await;
    assert_eq!(rx.borrow().state, ExportState::Exporting);

    drop(extra);
    let snap = rx
        .wait_for(|s| s.state == ExportState::Cancelled)
        .await
        .unwrap()
        .clone();
    assert_eq!(snap.id, Some(id));
    assert_eq!(snap.live_timers, 0);
    assert_eq!(h.script.lock().unwrap().cancelled, vec![0]);
}
