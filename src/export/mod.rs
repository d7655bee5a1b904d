//! Asynchronous export.
//!
//! An [`ExportController`](controller::ExportController) drives an
//! [`ExportEngine`](engine::ExportEngine) session per export, polls its progress on a timer and
//! hands finished files to a [`LibraryWriter`](library::LibraryWriter).

/// Export controller state machine and its handle.
pub mod controller;
/// Export engine contract.
pub mod engine;
/// Media library adapter.
pub mod library;
/// Built-in engine that renders the graph into a frame sink.
pub mod render_engine;
