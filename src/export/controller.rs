use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::export::engine::{EngineOutcome, ExportEngine, QualityPreset, SessionStatus};
use crate::export::library::LibraryWriter;
use crate::foundation::error::{FramegraphError, FramegraphResult};
use crate::graph::build::Graph;

/// Export controller options.
#[derive(Clone, Debug)]
pub struct ExportControllerOpts {
    /// Period of the progress timer while exporting.
    pub tick_interval: Duration,
    /// Delete a file already present at the output location before each export.
    pub remove_existing_output: bool,
    /// Quality requested from the engine.
    pub preset: QualityPreset,
}

impl Default for ExportControllerOpts {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(150),
            remove_existing_output: true,
            preset: QualityPreset::Highest,
        }
    }
}

/// Identifies one `start` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExportId(pub u64);

impl std::fmt::Display for ExportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "export#{}", self.0)
    }
}

/// Controller lifecycle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ExportState {
    /// Nothing started yet.
    #[default]
    Idle,
    /// A session is running and the progress timer is live.
    Exporting,
    /// The last export produced its output file.
    Completed,
    /// The last export failed.
    Failed,
    /// The last export was cancelled or superseded.
    Cancelled,
}

impl ExportState {
    /// `true` for the three end states.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Progress of the library hand-off after a completed export.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LibraryState {
    /// No completed export to hand off.
    #[default]
    NotStarted,
    /// Waiting for the user to grant access.
    AwaitingAuthorization,
    /// Write in flight.
    Writing,
    /// The file is in the library.
    Saved,
    /// Access was refused. The output file is kept and the write can be retried.
    PermissionDenied,
    /// The library rejected the write.
    Failed,
}

impl LibraryState {
    /// `true` once the hand-off stopped, successfully or not.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Saved | Self::PermissionDenied | Self::Failed)
    }
}

/// Published view of the controller.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExportSnapshot {
    /// Most recent export.
    pub id: Option<ExportId>,
    /// Lifecycle state of that export.
    pub state: ExportState,
    /// Last progress read, monotonic per export. Exactly `1.0` once completed.
    pub progress: f32,
    /// Last status read from the engine.
    pub status: SessionStatus,
    /// `true` while the progress timer exists.
    pub timer_active: bool,
    /// Progress timers currently alive.
    pub live_timers: usize,
    /// Highest value `live_timers` ever reached.
    pub peak_live_timers: usize,
    /// Message of the most recent failure, including library failures.
    pub last_error: Option<String>,
    /// Library hand-off state for the most recent export.
    pub library: LibraryState,
    /// Library writes attempted for the most recent export.
    pub library_writes: u32,
}

/// Receives controller notifications on the control loop.
pub trait ExportObserver: Send + 'static {
    /// A progress tick, or the final `1.0` on completion.
    fn on_progress(&mut self, _id: ExportId, _progress: f32, _status: SessionStatus) {}

    /// The export reached a terminal state.
    fn on_terminal(
        &mut self,
        _id: ExportId,
        _state: ExportState,
        _error: Option<&FramegraphError>,
    ) {
    }

    /// The library hand-off finished.
    fn on_library(&mut self, _id: ExportId, _result: Result<(), &FramegraphError>) {}
}

impl ExportObserver for () {}

enum Command {
    Start {
        id: ExportId,
        graph: Arc<Graph>,
        output: PathBuf,
    },
    Cancel,
    RetryLibraryWrite,
}

enum Event {
    Engine {
        generation: u64,
        outcome: EngineOutcome,
    },
    Authorized {
        generation: u64,
        granted: bool,
    },
    Written {
        generation: u64,
        result: FramegraphResult<()>,
    },
}

/// Drives an [`ExportEngine`] through the export lifecycle.
///
/// The controller runs as a single tokio task. Commands from [`ExportHandle`]s, engine callbacks,
/// library callbacks and progress ticks are all handled on that task, one at a time. Each started
/// session gets a fresh generation number; callbacks and ticks carrying an older generation are
/// dropped, so a late callback can neither change state nor revive a timer.
pub struct ExportController<E: ExportEngine> {
    engine: E,
    library: Arc<dyn LibraryWriter>,
    observer: Box<dyn ExportObserver>,
    opts: ExportControllerOpts,
}

impl<E: ExportEngine> ExportController<E> {
    /// Controller for `engine` handing finished files to `library`.
    pub fn new(engine: E, library: Arc<dyn LibraryWriter>, opts: ExportControllerOpts) -> Self {
        Self {
            engine,
            library,
            observer: Box::new(()),
            opts,
        }
    }

    /// Forward notifications to `observer`.
    pub fn with_observer(mut self, observer: impl ExportObserver) -> Self {
        self.observer = Box::new(observer);
        self
    }

    /// Spawn the control loop on the current tokio runtime.
    ///
    /// The loop stops when the last [`ExportHandle`] is dropped, cancelling any running export.
    pub fn spawn(self) -> ExportHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ExportSnapshot::default());

        let actor = Actor {
            engine: self.engine,
            library: self.library,
            observer: self.observer,
            opts: self.opts,
            events: event_tx,
            snapshot_tx,
            snap: ExportSnapshot::default(),
            generation: 0,
            active: None,
            finished: None,
            timer: None,
        };
        tokio::spawn(actor.run(cmd_rx, event_rx));

        ExportHandle {
            commands: cmd_tx,
            snapshot: snapshot_rx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Cloneable handle to a running [`ExportController`].
#[derive(Clone, Debug)]
pub struct ExportHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ExportSnapshot>,
    next_id: Arc<AtomicU64>,
}

impl ExportHandle {
    fn send(&self, cmd: Command) -> FramegraphResult<()> {
        self.commands
            .send(cmd)
            .map_err(|_| FramegraphError::from(anyhow::anyhow!("export controller has stopped")))
    }

    /// Export `graph` into `output`, superseding any running export. Returns immediately.
    pub fn start(
        &self,
        graph: Arc<Graph>,
        output: impl Into<PathBuf>,
    ) -> FramegraphResult<ExportId> {
        let id = ExportId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.send(Command::Start {
            id,
            graph,
            output: output.into(),
        })?;
        Ok(id)
    }

    /// Cancel the running export, if any.
    pub fn cancel(&self) -> FramegraphResult<()> {
        self.send(Command::Cancel)
    }

    /// Retry the library hand-off of the last completed export after a refusal or failure.
    pub fn retry_library_write(&self) -> FramegraphResult<()> {
        self.send(Command::RetryLibraryWrite)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> ExportSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified on every snapshot change.
    pub fn subscribe(&self) -> watch::Receiver<ExportSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until `pred` holds for a published snapshot and return that snapshot.
    pub async fn wait_until(
        &self,
        pred: impl Fn(&ExportSnapshot) -> bool,
    ) -> FramegraphResult<ExportSnapshot> {
        let mut rx = self.snapshot.clone();
        loop {
            {
                let snap = rx.borrow_and_update();
                if pred(&snap) {
                    return Ok(snap.clone());
                }
            }
            rx.changed().await.map_err(|_| {
                FramegraphError::from(anyhow::anyhow!("export controller has stopped"))
            })?;
        }
    }
}

struct Active<S> {
    id: ExportId,
    generation: u64,
    session: S,
    output: PathBuf,
}

struct Finished {
    id: ExportId,
    generation: u64,
    output: PathBuf,
}

struct ProgressTimer {
    generation: u64,
    interval: Interval,
}

enum Step {
    Command(Option<Command>),
    Event(Event),
    Tick(u64),
}

struct Actor<E: ExportEngine> {
    engine: E,
    library: Arc<dyn LibraryWriter>,
    observer: Box<dyn ExportObserver>,
    opts: ExportControllerOpts,
    events: mpsc::UnboundedSender<Event>,
    snapshot_tx: watch::Sender<ExportSnapshot>,
    snap: ExportSnapshot,
    generation: u64,
    active: Option<Active<E::Session>>,
    finished: Option<Finished>,
    timer: Option<ProgressTimer>,
}

async fn next_tick(timer: &mut Option<ProgressTimer>) -> u64 {
    match timer {
        Some(t) => {
            t.interval.tick().await;
            t.generation
        }
        None => std::future::pending().await,
    }
}

impl<E: ExportEngine> Actor<E> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            let step = tokio::select! {
                biased;
                cmd = commands.recv() => Step::Command(cmd),
                Some(event) = events.recv() => Step::Event(event),
                generation = next_tick(&mut self.timer) => Step::Tick(generation),
            };
            match step {
                Step::Command(Some(cmd)) => self.on_command(cmd),
                Step::Command(None) => {
                    self.teardown();
                    break;
                }
                Step::Event(event) => self.on_event(event),
                Step::Tick(generation) => self.on_tick(generation),
            }
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snap.clone());
    }

    fn arm_timer(&mut self, generation: u64) {
        self.invalidate_timer();
        let period = self.opts.tick_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.timer = Some(ProgressTimer {
            generation,
            interval,
        });
        self.snap.live_timers += 1;
        self.snap.peak_live_timers = self.snap.peak_live_timers.max(self.snap.live_timers);
        self.snap.timer_active = true;
    }

    // Idempotent.
    fn invalidate_timer(&mut self) {
        if self.timer.take().is_some() {
            self.snap.live_timers = self.snap.live_timers.saturating_sub(1);
        }
        self.snap.timer_active = false;
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { id, graph, output } => self.start(id, graph, output),
            Command::Cancel => self.cancel(),
            Command::RetryLibraryWrite => self.retry_library_write(),
        }
    }

    fn start(&mut self, id: ExportId, graph: Arc<Graph>, output: PathBuf) {
        if let Some(prev) = self.active.take() {
            self.engine.cancel(&prev.session);
            self.invalidate_timer();
            tracing::info!(export = %prev.id, by = %id, "export superseded");
            self.snap.state = ExportState::Cancelled;
            self.snap.status = SessionStatus::Cancelled;
            self.observer.on_terminal(prev.id, ExportState::Cancelled, None);
            self.publish();
        }
        self.finished = None;
        self.generation += 1;
        let generation = self.generation;

        if self.opts.remove_existing_output {
            remove_existing_output(&output);
        }

        self.snap = ExportSnapshot {
            id: Some(id),
            state: ExportState::Exporting,
            status: SessionStatus::Waiting,
            live_timers: self.snap.live_timers,
            peak_live_timers: self.snap.peak_live_timers,
            ..ExportSnapshot::default()
        };

        let session = match self.engine.create_session(graph, self.opts.preset, &output) {
            Ok(s) => s,
            Err(e) => {
                self.fail(id, e.into());
                return;
            }
        };

        let events = self.events.clone();
        self.engine.export_async(
            &session,
            Box::new(move |outcome| {
                let _ = events.send(Event::Engine {
                    generation,
                    outcome,
                });
            }),
        );
        tracing::info!(export = %id, generation, out = %output.display(), "export started");
        self.active = Some(Active {
            id,
            generation,
            session,
            output,
        });
        self.arm_timer(generation);
        self.publish();
    }

    fn cancel(&mut self) {
        let Some(active) = self.active.take() else {
            tracing::debug!("cancel ignored: no export running");
            return;
        };
        self.engine.cancel(&active.session);
        self.invalidate_timer();
        tracing::info!(export = %active.id, "export cancelled");
        self.snap.state = ExportState::Cancelled;
        self.snap.status = SessionStatus::Cancelled;
        self.observer.on_terminal(active.id, ExportState::Cancelled, None);
        self.publish();
    }

    fn fail(&mut self, id: ExportId, err: FramegraphError) {
        self.invalidate_timer();
        tracing::warn!(export = %id, error = %err, "export failed");
        self.snap.state = ExportState::Failed;
        self.snap.status = SessionStatus::Failed;
        self.snap.last_error = Some(err.to_string());
        self.observer.on_terminal(id, ExportState::Failed, Some(&err));
        self.publish();
    }

    fn on_tick(&mut self, generation: u64) {
        let Some(active) = self.active.as_ref().filter(|a| a.generation == generation) else {
            tracing::debug!(generation, "dropping tick for a finished export");
            self.invalidate_timer();
            self.publish();
            return;
        };
        let id = active.id;
        let status = self.engine.status(&active.session);
        if let Some(p) = self.engine.progress(&active.session) {
            self.snap.progress = self.snap.progress.max(p.clamp(0.0, 1.0));
        }
        self.snap.status = status;
        tracing::trace!(export = %id, progress = self.snap.progress, ?status, "export progress");
        self.observer.on_progress(id, self.snap.progress, status);
        self.publish();
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Engine {
                generation,
                outcome,
            } => self.on_engine_outcome(generation, outcome),
            Event::Authorized {
                generation,
                granted,
            } => self.on_authorized(generation, granted),
            Event::Written { generation, result } => self.on_written(generation, result),
        }
    }

    fn on_engine_outcome(&mut self, generation: u64, outcome: EngineOutcome) {
        let Some(active) = self.active.take_if(|a| a.generation == generation) else {
            tracing::debug!(generation, ?outcome, "ignoring stale engine callback");
            return;
        };
        self.invalidate_timer();
        match outcome {
            EngineOutcome::Completed => {
                tracing::info!(
                    export = %active.id,
                    out = %active.output.display(),
                    "export completed"
                );
                self.snap.progress = 1.0;
                self.snap.status = SessionStatus::Completed;
                self.snap.state = ExportState::Completed;
                self.observer.on_progress(active.id, 1.0, SessionStatus::Completed);
                self.observer.on_terminal(active.id, ExportState::Completed, None);
                self.finished = Some(Finished {
                    id: active.id,
                    generation,
                    output: active.output,
                });
                self.publish();
                self.hand_off_to_library();
            }
            EngineOutcome::Failed(e) => self.fail(active.id, e.into()),
            EngineOutcome::Cancelled => {
                tracing::info!(export = %active.id, "engine cancelled export");
                self.snap.state = ExportState::Cancelled;
                self.snap.status = SessionStatus::Cancelled;
                self.observer.on_terminal(active.id, ExportState::Cancelled, None);
                self.publish();
            }
        }
    }

    fn hand_off_to_library(&mut self) {
        let Some(done) = &self.finished else {
            return;
        };
        if self.library.is_authorized() {
            self.write_to_library();
            return;
        }
        let generation = done.generation;
        tracing::debug!(export = %done.id, "requesting library authorization");
        self.snap.library = LibraryState::AwaitingAuthorization;
        self.publish();
        let events = self.events.clone();
        self.library.request_authorization(Box::new(move |granted| {
            let _ = events.send(Event::Authorized {
                generation,
                granted,
            });
        }));
    }

    fn write_to_library(&mut self) {
        let Some(done) = &self.finished else {
            return;
        };
        let generation = done.generation;
        let output = done.output.clone();
        self.snap.library = LibraryState::Writing;
        self.snap.library_writes += 1;
        self.publish();
        let events = self.events.clone();
        self.library.write_video(
            &output,
            Box::new(move |result| {
                let _ = events.send(Event::Written { generation, result });
            }),
        );
    }

    fn on_authorized(&mut self, generation: u64, granted: bool) {
        let Some(done) = self.finished.as_ref().filter(|f| f.generation == generation) else {
            tracing::debug!(generation, "ignoring stale authorization callback");
            return;
        };
        if granted {
            self.write_to_library();
            return;
        }
        let id = done.id;
        let err = FramegraphError::permission_denied(format!(
            "library write refused for '{}'",
            done.output.display()
        ));
        self.library_failed(id, err);
    }

    fn on_written(&mut self, generation: u64, result: FramegraphResult<()>) {
        let Some(done) = self.finished.as_ref().filter(|f| f.generation == generation) else {
            tracing::debug!(generation, "ignoring stale library callback");
            return;
        };
        let id = done.id;
        match result {
            Ok(()) => {
                tracing::info!(export = %id, "library write succeeded");
                self.snap.library = LibraryState::Saved;
                self.observer.on_library(id, Ok(()));
                self.publish();
            }
            Err(e) => self.library_failed(id, e),
        }
    }

    fn library_failed(&mut self, id: ExportId, err: FramegraphError) {
        tracing::warn!(export = %id, error = %err, "library write failed");
        self.snap.library = match err {
            FramegraphError::PermissionDenied(_) => LibraryState::PermissionDenied,
            _ => LibraryState::Failed,
        };
        self.snap.last_error = Some(err.to_string());
        self.observer.on_library(id, Err(&err));
        self.publish();
    }

    fn retry_library_write(&mut self) {
        let retryable = matches!(
            self.snap.library,
            LibraryState::PermissionDenied | LibraryState::Failed
        );
        if self.finished.is_none() || !retryable {
            tracing::debug!(library = ?self.snap.library, "library retry ignored");
            return;
        }
        self.hand_off_to_library();
    }

    fn teardown(&mut self) {
        if let Some(active) = self.active.take() {
            self.engine.cancel(&active.session);
            tracing::info!(export = %active.id, "export controller dropped; export cancelled");
            self.snap.state = ExportState::Cancelled;
            self.snap.status = SessionStatus::Cancelled;
            self.observer.on_terminal(active.id, ExportState::Cancelled, None);
        }
        self.invalidate_timer();
        self.finished = None;
        self.publish();
    }
}

fn remove_existing_output(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(out = %path.display(), "removed existing output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            out = %path.display(),
            error = %e,
            "failed to remove existing output; continuing"
        ),
    }
}

#[cfg(test)]
#[path = "../../tests/unit/export/controller.rs"]
mod tests;
