use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::encode::ffmpeg::{FfmpegSink, FfmpegSinkOpts};
use crate::encode::sink::{FrameSink, SinkConfig};
use crate::export::engine::{
    CompletionHandler, EngineOutcome, ExportEngine, QualityPreset, SessionStatus,
};
use crate::foundation::core::{FrameIndex, FrameRange};
use crate::foundation::error::{ExportEngineError, FramegraphResult};
use crate::graph::build::Graph;
use crate::render::backend::{BackendKind, RenderBackend, create_backend};
use crate::render::pipeline::{FrameInputs, RenderPipeline, RenderPipelineOpts};
use crate::texture::Texture;

/// Supplies the source textures for each exported frame.
pub trait FrameSource: Send + Sync {
    /// Inputs for frame `idx`.
    fn frame(&self, idx: FrameIndex) -> FramegraphResult<FrameInputs>;
}

impl<F> FrameSource for F
where
    F: Fn(FrameIndex) -> FramegraphResult<FrameInputs> + Send + Sync,
{
    fn frame(&self, idx: FrameIndex) -> FramegraphResult<FrameInputs> {
        self(idx)
    }
}

/// The same textures for every frame.
#[derive(Clone, Debug, Default)]
pub struct StillFrames {
    inputs: FrameInputs,
}

impl StillFrames {
    /// No sources.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `texture` for `source` on every frame.
    pub fn with(mut self, source: impl Into<String>, texture: impl Into<Arc<Texture>>) -> Self {
        self.inputs.insert(source, texture);
        self
    }

    /// Load a PNG and use it for `source` on every frame.
    pub fn with_png(self, source: impl Into<String>, path: &Path) -> FramegraphResult<Self> {
        let texture = Texture::load_png(path)?;
        Ok(self.with(source, texture))
    }
}

impl FrameSource for StillFrames {
    fn frame(&self, _idx: FrameIndex) -> FramegraphResult<FrameInputs> {
        Ok(self.inputs.clone())
    }
}

/// Creates a render backend for each session.
pub type BackendFactory = Arc<dyn Fn() -> FramegraphResult<Box<dyn RenderBackend>> + Send + Sync>;

/// Creates the frame sink for an output path and preset.
pub type SinkFactory =
    Arc<dyn Fn(&Path, QualityPreset) -> FramegraphResult<Box<dyn FrameSink>> + Send + Sync>;

/// Built-in export engine: renders the graph frame by frame on a dedicated thread and streams the
/// frames into a [`FrameSink`] (MP4 via `ffmpeg` by default).
pub struct RenderExportEngine {
    frames: Arc<dyn FrameSource>,
    backend: BackendFactory,
    sinks: SinkFactory,
    pipeline_opts: RenderPipelineOpts,
}

impl RenderExportEngine {
    /// CPU backend, `ffmpeg` MP4 output.
    pub fn new(frames: impl FrameSource + 'static) -> Self {
        Self {
            frames: Arc::new(frames),
            backend: Arc::new(|| create_backend(BackendKind::Cpu)),
            sinks: Arc::new(|path: &Path, _preset: QualityPreset| {
                Ok(Box::new(FfmpegSink::new(FfmpegSinkOpts::new(path))) as Box<dyn FrameSink>)
            }),
            pipeline_opts: RenderPipelineOpts::default(),
        }
    }

    /// Render on `kind` with default options.
    pub fn with_backend(mut self, kind: BackendKind) -> Self {
        self.backend = Arc::new(move || create_backend(kind));
        self
    }

    /// Render on backends built by `factory`.
    pub fn with_backend_factory(
        mut self,
        factory: impl Fn() -> FramegraphResult<Box<dyn RenderBackend>> + Send + Sync + 'static,
    ) -> Self {
        self.backend = Arc::new(factory);
        self
    }

    /// Write frames into sinks built by `factory`.
    pub fn with_sink_factory(
        mut self,
        factory: impl Fn(&Path, QualityPreset) -> FramegraphResult<Box<dyn FrameSink>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.sinks = Arc::new(factory);
        self
    }

    /// Render pipeline options for new sessions.
    pub fn with_pipeline_opts(mut self, opts: RenderPipelineOpts) -> Self {
        self.pipeline_opts = opts;
        self
    }
}

fn status_to_u8(s: SessionStatus) -> u8 {
    match s {
        SessionStatus::Unknown => 0,
        SessionStatus::Waiting => 1,
        SessionStatus::Exporting => 2,
        SessionStatus::Completed => 3,
        SessionStatus::Failed => 4,
        SessionStatus::Cancelled => 5,
    }
}

fn status_from_u8(v: u8) -> SessionStatus {
    match v {
        1 => SessionStatus::Waiting,
        2 => SessionStatus::Exporting,
        3 => SessionStatus::Completed,
        4 => SessionStatus::Failed,
        5 => SessionStatus::Cancelled,
        _ => SessionStatus::Unknown,
    }
}

#[derive(Debug)]
struct SessionShared {
    // f32 bits. Non-negative floats order the same as their bit patterns, so `fetch_max` keeps
    // progress monotonic.
    progress: AtomicU32,
    status: AtomicU8,
    cancel: AtomicBool,
    total: u64,
}

impl SessionShared {
    fn set_status(&self, s: SessionStatus) {
        self.status.store(status_to_u8(s), Ordering::Release);
    }

    fn status(&self) -> SessionStatus {
        status_from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_done(&self, done: u64) {
        let p = (done as f64 / self.total.max(1) as f64).clamp(0.0, 1.0) as f32;
        self.progress.fetch_max(p.to_bits(), Ordering::AcqRel);
    }

    fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Acquire))
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

struct Job {
    pipeline: RenderPipeline,
    sink: Box<dyn FrameSink>,
    frames: Arc<dyn FrameSource>,
    cfg: SinkConfig,
    range: FrameRange,
    output: PathBuf,
}

/// Session handle of [`RenderExportEngine`].
pub struct RenderSession {
    shared: Arc<SessionShared>,
    job: Mutex<Option<Job>>,
}

impl RenderSession {
    fn take_job(&self) -> Option<Job> {
        match self.job.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl std::fmt::Debug for RenderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderSession")
            .field("status", &self.shared.status())
            .field("progress", &self.shared.progress())
            .field("total", &self.shared.total)
            .finish()
    }
}

fn engine_err(e: impl std::fmt::Display) -> ExportEngineError {
    ExportEngineError::new(e.to_string())
}

impl ExportEngine for RenderExportEngine {
    type Session = RenderSession;

    fn create_session(
        &mut self,
        graph: Arc<Graph>,
        preset: QualityPreset,
        output: &Path,
    ) -> Result<Self::Session, ExportEngineError> {
        let range = graph.frame_range();
        if range.is_empty() {
            return Err(ExportEngineError::new("timeline has no frames to export"));
        }
        let desc = graph.output_desc();
        let cfg = SinkConfig {
            width: desc.width(),
            height: desc.height(),
            fps: graph.fps(),
            preset,
        };

        let backend = (self.backend)().map_err(engine_err)?;
        let pipeline = RenderPipeline::new(graph, backend, self.pipeline_opts.clone())
            .map_err(engine_err)?;
        let sink = (self.sinks)(output, preset).map_err(engine_err)?;

        tracing::debug!(
            out = %output.display(),
            frames = range.len_frames(),
            backend = pipeline.backend_name(),
            "export session created"
        );

        Ok(RenderSession {
            shared: Arc::new(SessionShared {
                progress: AtomicU32::new(0f32.to_bits()),
                status: AtomicU8::new(status_to_u8(SessionStatus::Waiting)),
                cancel: AtomicBool::new(false),
                total: range.len_frames(),
            }),
            job: Mutex::new(Some(Job {
                pipeline,
                sink,
                frames: Arc::clone(&self.frames),
                cfg,
                range,
                output: output.to_path_buf(),
            })),
        })
    }

    fn export_async(&mut self, session: &Self::Session, on_terminal: CompletionHandler) {
        let Some(job) = session.take_job() else {
            on_terminal(EngineOutcome::Failed(ExportEngineError::new(
                "session was already started",
            )));
            return;
        };
        let shared = Arc::clone(&session.shared);
        shared.set_status(SessionStatus::Exporting);
        let guard = TerminalGuard {
            shared: Arc::clone(&shared),
            on_terminal: Some(on_terminal),
        };

        let spawned = std::thread::Builder::new()
            .name("framegraph-export".to_owned())
            .spawn(move || {
                let mut job = job;
                let outcome = run_guarded(&mut job, &shared);
                guard.finish(outcome);
            });
        if let Err(e) = spawned {
            // `spawn` dropped the closure, so the guard has already reported `Failed`.
            tracing::error!(error = %e, "failed to spawn render thread");
        }
    }

    fn cancel(&mut self, session: &Self::Session) {
        session.shared.cancel.store(true, Ordering::Release);
        // Never started: nothing will observe the flag, so finish the job here.
        if let Some(mut job) = session.take_job() {
            job.sink.abort();
            session.shared.set_status(SessionStatus::Cancelled);
        }
    }

    fn progress(&self, session: &Self::Session) -> Option<f32> {
        match session.shared.status() {
            SessionStatus::Unknown | SessionStatus::Waiting => None,
            _ => Some(session.shared.progress()),
        }
    }

    fn status(&self, session: &Self::Session) -> SessionStatus {
        session.shared.status()
    }
}

/// Delivers the completion handler exactly once. Dropped unfired, it reports `Failed`.
struct TerminalGuard {
    shared: Arc<SessionShared>,
    on_terminal: Option<CompletionHandler>,
}

impl TerminalGuard {
    fn finish(mut self, outcome: EngineOutcome) {
        self.deliver(outcome);
    }

    fn deliver(&mut self, outcome: EngineOutcome) {
        let Some(on_terminal) = self.on_terminal.take() else {
            return;
        };
        self.shared.set_status(match &outcome {
            EngineOutcome::Completed => SessionStatus::Completed,
            EngineOutcome::Failed(_) => SessionStatus::Failed,
            EngineOutcome::Cancelled => SessionStatus::Cancelled,
        });
        on_terminal(outcome);
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        self.deliver(EngineOutcome::Failed(ExportEngineError::new(
            "render thread exited without reporting an outcome",
        )));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Runs the job, turning a panic anywhere in the frame loop into `Failed`.
fn run_guarded(job: &mut Job, shared: &SessionShared) -> EngineOutcome {
    match std::panic::catch_unwind(AssertUnwindSafe(|| run_job(job, shared))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            tracing::error!(out = %job.output.display(), panic = %msg, "render thread panicked");
            let _ = std::panic::catch_unwind(AssertUnwindSafe(|| job.sink.abort()));
            EngineOutcome::Failed(ExportEngineError::new(format!(
                "render thread panicked: {msg}"
            )))
        }
    }
}

fn run_job(job: &mut Job, shared: &SessionShared) -> EngineOutcome {
    if let Err(e) = job.sink.begin(job.cfg.clone()) {
        job.sink.abort();
        return EngineOutcome::Failed(engine_err(e));
    }

    let start = job.range.start.0;
    for f in start..job.range.end.0 {
        if shared.cancelled() {
            job.sink.abort();
            tracing::debug!(out = %job.output.display(), frame = f, "export cancelled");
            return EngineOutcome::Cancelled;
        }
        let idx = FrameIndex(f);
        let step = job
            .frames
            .frame(idx)
            .and_then(|inputs| Ok(job.pipeline.render(&inputs)?))
            .and_then(|frame| job.sink.push_frame(idx, &frame));
        if let Err(e) = step {
            job.sink.abort();
            tracing::warn!(frame = f, error = %e, "export frame failed");
            return EngineOutcome::Failed(engine_err(e));
        }
        shared.set_done(f - start + 1);
    }

    if let Err(e) = job.sink.end() {
        job.sink.abort();
        return EngineOutcome::Failed(engine_err(e));
    }
    let stats = job.pipeline.stats();
    tracing::debug!(
        out = %job.output.display(),
        frames = stats.frames,
        retries = stats.retries,
        peak_live_textures = stats.peak_live_textures,
        "export finished"
    );
    EngineOutcome::Completed
}

#[cfg(test)]
#[path = "../../tests/unit/export/render_engine.rs"]
mod tests;
