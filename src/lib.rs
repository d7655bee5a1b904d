//! framegraph applies graphs of shader operations to video frames and exports the result.
//!
//! The pieces, leaves first:
//!
//! - Build a [`Composition`] (JSON or [`CompositionBuilder`]) and validate it into an immutable
//!   [`Graph`] against an [`OperationRegistry`]
//! - Render frames with a [`RenderPipeline`] on a [`RenderBackend`] (CPU by default, wgpu with the
//!   `gpu` feature)
//! - Export through an [`ExportController`], which drives an [`ExportEngine`] session, polls its
//!   progress and hands the finished file to a [`LibraryWriter`]
#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod foundation;

/// Frame sinks (MP4 via `ffmpeg`, PNG sequences, in-memory).
pub mod encode;
/// Export lifecycle: engine contract, built-in engine, controller and library adapter.
pub mod export;
/// Composition model, graph validation and scheduling.
pub mod graph;
/// Operation kinds, parameters and the registry.
pub mod ops;
/// Render backends and the per-frame pipeline.
pub mod render;
/// Host-side textures.
pub mod texture;

pub use crate::foundation::core::{Extent, Fps, FrameIndex, FrameRange};
pub use crate::foundation::error::{
    ExportEngineError, FramegraphError, FramegraphResult, GraphError, RenderError, ResourceError,
};
pub use crate::foundation::math::Fnv1a64;

pub use crate::encode::ffmpeg::{FfmpegSink, FfmpegSinkOpts, is_ffmpeg_on_path};
pub use crate::encode::png::PngSequenceSink;
pub use crate::encode::sink::{FrameSink, InMemorySink, SinkConfig};
pub use crate::export::controller::{
    ExportController, ExportControllerOpts, ExportHandle, ExportId, ExportObserver, ExportSnapshot,
    ExportState, LibraryState,
};
pub use crate::export::engine::{
    CompletionHandler, EngineOutcome, ExportEngine, QualityPreset, SessionStatus,
};
pub use crate::export::library::{DirectoryLibrary, LibraryWriter};
pub use crate::export::render_engine::{FrameSource, RenderExportEngine, RenderSession, StillFrames};
pub use crate::graph::build::{Graph, NodeId};
pub use crate::graph::composition::{Composition, CompositionDef};
pub use crate::graph::dsl::CompositionBuilder;
pub use crate::ops::{
    InputCompat, OpParams, Operation, OperationKind, OperationRegistry, OutputSizing,
    ShaderProgram,
};
pub use crate::render::backend::{BackendKind, RenderBackend, SlotId, create_backend};
pub use crate::render::cpu::{CpuBackend, CpuBackendOpts};
#[cfg(feature = "gpu")]
pub use crate::render::gpu::{GpuBackend, GpuBackendOpts};
pub use crate::render::pipeline::{FrameInputs, RenderPipeline, RenderPipelineOpts, RenderStats};
pub use crate::texture::{PixelFormat, Texture, TextureDesc};
