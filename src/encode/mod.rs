//! Frame sinks.
//!
//! Sinks consume rendered frames in timeline order. The built-in export engine streams into one.

/// `ffmpeg`-based MP4 sink.
pub mod ffmpeg;
/// PNG image-sequence sink.
pub mod png;
/// Sink trait and in-memory sink.
pub mod sink;
