use std::path::Path;
use std::sync::Arc;

use crate::foundation::error::ExportEngineError;
use crate::graph::build::Graph;

/// Encoder quality tier requested for an export.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityPreset {
    /// Fast, small, visibly lossy.
    Low,
    /// Balanced.
    Medium,
    /// High quality.
    High,
    /// Best quality the engine offers.
    #[default]
    Highest,
}

/// Status reported by an export engine for one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// The engine has no information about the session.
    #[default]
    Unknown,
    /// Created, not started yet.
    Waiting,
    /// Frames are being produced.
    Exporting,
    /// Output file is complete.
    Completed,
    /// The engine gave up.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl SessionStatus {
    /// `true` for the three end states.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Terminal result delivered to the completion callback of [`ExportEngine::export_async`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineOutcome {
    /// Every frame was written and the output finalized.
    Completed,
    /// The engine failed.
    Failed(ExportEngineError),
    /// The export stopped after a cancel request.
    Cancelled,
}

/// Completion callback. Called exactly once per started session, from any thread.
pub type CompletionHandler = Box<dyn FnOnce(EngineOutcome) + Send + 'static>;

/// Asynchronous encode/mux engine the export controller drives.
///
/// Sessions are opaque handles. An engine must tolerate queries and cancel requests for sessions
/// that already finished; those report no progress and [`SessionStatus::Unknown`] or their final
/// status, never an error.
pub trait ExportEngine: Send + 'static {
    /// Engine-specific session handle.
    type Session: Send + Sync + 'static;

    /// Prepare an export of `graph` into `output`.
    fn create_session(
        &mut self,
        graph: Arc<Graph>,
        preset: QualityPreset,
        output: &Path,
    ) -> Result<Self::Session, ExportEngineError>;

    /// Start exporting. Returns immediately; `on_terminal` fires once the session ends.
    fn export_async(&mut self, session: &Self::Session, on_terminal: CompletionHandler);

    /// Ask the engine to stop. Advisory: the completion callback may still report any outcome.
    fn cancel(&mut self, session: &Self::Session);

    /// Fraction of work done in `0.0..=1.0`, or `None` when the session has nothing to report.
    fn progress(&self, session: &Self::Session) -> Option<f32>;

    /// Current status of `session`.
    fn status(&self, session: &Self::Session) -> SessionStatus;
}
