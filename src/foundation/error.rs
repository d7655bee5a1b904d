/// Result alias used throughout the crate.
pub type FramegraphResult<T> = Result<T, FramegraphError>;

/// Top-level error type.
///
/// Each sub-taxonomy is kept as its own type so callers can match on the failure class without
/// string inspection.
#[derive(thiserror::Error, Debug)]
pub enum FramegraphError {
    /// Graph construction failed.
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// A GPU (or CPU) pipeline could not be built.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// A frame failed to render.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// The export engine reported a failure.
    #[error(transparent)]
    ExportEngine(#[from] ExportEngineError),

    /// Writing to the media library was not authorized.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The media library rejected the write.
    #[error("library error: {0}")]
    Library(String),

    /// Invalid caller-provided value.
    #[error("validation error: {0}")]
    Validation(String),

    /// Composition parse failure.
    #[error("serialization error: {0}")]
    Serde(String),

    /// Anything else, usually I/O with context attached.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FramegraphError {
    /// Build a [`FramegraphError::Validation`].
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Build a [`FramegraphError::Serde`].
    pub fn serde(msg: impl Into<String>) -> Self {
        Self::Serde(msg.into())
    }

    /// Build a [`FramegraphError::PermissionDenied`].
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Build a [`FramegraphError::Library`].
    pub fn library(msg: impl Into<String>) -> Self {
        Self::Library(msg.into())
    }
}

/// Construction-time graph validation failures. Never retried.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The composition declares no operations.
    #[error("graph error: composition has no operations")]
    Empty,

    /// Two nodes share the same id.
    #[error("graph error: duplicate node id '{0}'")]
    DuplicateId(String),

    /// A source declaration is unusable.
    #[error("graph error: source '{source_id}' is invalid: {reason}")]
    InvalidSource {
        /// Source id.
        source_id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// An edge or output references a node that does not exist.
    #[error("graph error: unknown node '{0}'")]
    UnknownNode(String),

    /// An operation names a kind that is not registered.
    #[error("graph error: operation '{op}' uses unknown kind '{kind}'")]
    UnknownOperation {
        /// Operation id.
        op: String,
        /// Requested kind.
        kind: String,
    },

    /// Operation parameters failed to parse.
    #[error("graph error: operation '{op}' has invalid params: {reason}")]
    InvalidParams {
        /// Operation id.
        op: String,
        /// Parser message.
        reason: String,
    },

    /// The graph contains at least one cycle.
    #[error("graph error: cycle detected through {ops:?}")]
    CycleDetected {
        /// Operations that could not be scheduled, in declaration order.
        ops: Vec<String>,
    },

    /// A declared input has no incoming edge.
    #[error("graph error: input {input} of operation '{op}' is not connected")]
    UnconnectedInput {
        /// Operation id.
        op: String,
        /// Input index.
        input: usize,
    },

    /// An edge targets an input index beyond the operation's arity.
    #[error("graph error: operation '{op}' accepts {expected} inputs but input {got} was wired")]
    ArityMismatch {
        /// Operation id.
        op: String,
        /// Declared arity.
        expected: usize,
        /// Offending input index.
        got: usize,
    },

    /// More than one edge targets the same input.
    #[error("graph error: input {input} of operation '{op}' is wired more than once")]
    DuplicateInput {
        /// Operation id.
        op: String,
        /// Input index.
        input: usize,
    },

    /// Inputs violate the operation's compatibility rule.
    #[error("graph error: operation '{op}' has incompatible inputs: {reason}")]
    IncompatibleInputs {
        /// Operation id.
        op: String,
        /// Mismatch description.
        reason: String,
    },

    /// The declared output is missing or is not an operation.
    #[error("graph error: output must name an operation, got '{0}'")]
    MissingOutput(String),
}

/// Pipeline construction failures. Fatal to the graph on the backend that raised them.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// A shader program is not known to the backend.
    #[error("resource error: shader program '{program}' is not available")]
    ShaderNotFound {
        /// Program identifier.
        program: String,
    },

    /// The backend rejected the pipeline description.
    #[error("resource error: failed to build pipeline for '{program}': {reason}")]
    PipelineBuild {
        /// Program identifier.
        program: String,
        /// Backend message.
        reason: String,
    },

    /// No device could be acquired.
    #[error("resource error: no render device available: {0}")]
    DeviceUnavailable(String),
}

/// Per-frame render failures.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// A source consumed by the graph was not supplied for this frame.
    #[error("render error: source '{0}' missing from frame inputs")]
    MissingSource(String),

    /// A supplied source texture does not match its declaration.
    #[error("render error: source '{source_id}' expected {expected}, got {got}")]
    SourceMismatch {
        /// Source id.
        source_id: String,
        /// Declared description.
        expected: String,
        /// Supplied description.
        got: String,
    },

    /// The device was lost mid-frame.
    #[error("render error: device lost: {0}")]
    DeviceLost(String),

    /// Allocation failed mid-frame.
    #[error("render error: out of memory: {0}")]
    OutOfMemory(String),

    /// Anything else the backend reported.
    #[error("render error: {0}")]
    Backend(String),
}

impl RenderError {
    /// `true` for device-level failures that a fresh resource pool may fix.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DeviceLost(_) | Self::OutOfMemory(_))
    }

    /// Build a [`RenderError::Backend`].
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// Opaque failure reported by an export engine.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("export engine error: {message}")]
pub struct ExportEngineError {
    /// Engine-provided description.
    pub message: String,
}

impl ExportEngineError {
    /// Wrap any displayable cause.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/error.rs"]
mod tests;
