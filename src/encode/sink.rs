use std::sync::{Arc, Mutex};

use crate::export::engine::QualityPreset;
use crate::foundation::core::{Fps, FrameIndex};
use crate::foundation::error::{FramegraphError, FramegraphResult};
use crate::texture::Texture;

/// Configuration provided to a [`FrameSink`] before the first frame.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Output frames-per-second.
    pub fps: Fps,
    /// Encoder quality tier.
    pub preset: QualityPreset,
}

/// Sink contract for consuming rendered frames in timeline order.
///
/// Ordering contract: `push_frame` is called in strictly increasing `FrameIndex` order. After
/// `begin`, exactly one of `end` or `abort` is called.
pub trait FrameSink: Send {
    /// Called once before any frames are pushed.
    fn begin(&mut self, cfg: SinkConfig) -> FramegraphResult<()>;
    /// Push one frame in strictly increasing timeline order.
    fn push_frame(&mut self, idx: FrameIndex, frame: &Texture) -> FramegraphResult<()>;
    /// Called once after the last frame is pushed. The output is complete when this returns.
    fn end(&mut self) -> FramegraphResult<()>;
    /// Stop early and discard whatever partial output exists.
    fn abort(&mut self) {}
}

#[derive(Debug, Default)]
struct InMemoryState {
    cfg: Option<SinkConfig>,
    frames: Vec<(FrameIndex, Texture)>,
    ended: bool,
    aborted: bool,
}

/// In-memory sink for tests and debugging.
///
/// Clones share storage, so a clone kept by the caller observes frames pushed from a render
/// thread.
#[derive(Debug, Default, Clone)]
pub struct InMemorySink {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemorySink {
    /// Create a new in-memory sink.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut InMemoryState) -> T) -> T {
        match self.state.lock() {
            Ok(mut g) => f(&mut g),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Sink configuration captured in `begin`, if any.
    pub fn config(&self) -> Option<SinkConfig> {
        self.with_state(|s| s.cfg.clone())
    }

    /// Captured frames in timeline order.
    pub fn frames(&self) -> Vec<(FrameIndex, Texture)> {
        self.with_state(|s| s.frames.clone())
    }

    /// Number of captured frames.
    pub fn frame_count(&self) -> usize {
        self.with_state(|s| s.frames.len())
    }

    /// `true` once `end` succeeded.
    pub fn ended(&self) -> bool {
        self.with_state(|s| s.ended)
    }

    /// `true` once `abort` was called.
    pub fn aborted(&self) -> bool {
        self.with_state(|s| s.aborted)
    }
}

impl FrameSink for InMemorySink {
    fn begin(&mut self, cfg: SinkConfig) -> FramegraphResult<()> {
        self.with_state(|s| {
            s.cfg = Some(cfg);
            s.frames.clear();
            s.ended = false;
            s.aborted = false;
        });
        Ok(())
    }

    fn push_frame(&mut self, idx: FrameIndex, frame: &Texture) -> FramegraphResult<()> {
        self.with_state(|s| {
            if let Some((last, _)) = s.frames.last()
                && idx.0 <= last.0
            {
                return Err(FramegraphError::validation(
                    "in-memory sink received out-of-order frame index",
                ));
            }
            s.frames.push((idx, frame.clone()));
            Ok(())
        })
    }

    fn end(&mut self) -> FramegraphResult<()> {
        self.with_state(|s| s.ended = true);
        Ok(())
    }

    fn abort(&mut self) {
        self.with_state(|s| {
            s.frames.clear();
            s.aborted = true;
        });
    }
}
