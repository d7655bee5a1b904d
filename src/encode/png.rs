use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::encode::ffmpeg::ensure_parent_dir;
use crate::encode::sink::{FrameSink, SinkConfig};
use crate::foundation::core::FrameIndex;
use crate::foundation::error::{FramegraphError, FramegraphResult};
use crate::texture::Texture;

/// Sink that writes every frame as `frame_NNNNNN.png` into a directory.
///
/// Useful when `ffmpeg` is not installed, and for inspecting individual frames.
#[derive(Debug)]
pub struct PngSequenceSink {
    dir: PathBuf,
    written: Vec<PathBuf>,
    cfg: Option<SinkConfig>,
    last_idx: Option<FrameIndex>,
}

impl PngSequenceSink {
    /// Write frames into `dir`, creating it on `begin`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            written: Vec::new(),
            cfg: None,
            last_idx: None,
        }
    }

    /// Output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file written for `idx`.
    pub fn frame_path(&self, idx: FrameIndex) -> PathBuf {
        self.dir.join(format!("frame_{:06}.png", idx.0))
    }
}

impl FrameSink for PngSequenceSink {
    fn begin(&mut self, cfg: SinkConfig) -> FramegraphResult<()> {
        if cfg.width == 0 || cfg.height == 0 {
            return Err(FramegraphError::validation(
                "png sink width/height must be non-zero",
            ));
        }
        ensure_parent_dir(&self.dir.join("frame"))?;
        self.written.clear();
        self.cfg = Some(cfg);
        self.last_idx = None;
        Ok(())
    }

    fn push_frame(&mut self, idx: FrameIndex, frame: &Texture) -> FramegraphResult<()> {
        let cfg = self
            .cfg
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("png sink not started"))?;
        if let Some(last) = self.last_idx
            && idx.0 <= last.0
        {
            return Err(FramegraphError::validation(
                "png sink received out-of-order frame index",
            ));
        }
        if frame.desc().width() != cfg.width || frame.desc().height() != cfg.height {
            return Err(FramegraphError::validation(format!(
                "frame size mismatch: got {}, expected {}x{}",
                frame.extent(),
                cfg.width,
                cfg.height
            )));
        }
        self.last_idx = Some(idx);

        let path = self.frame_path(idx);
        frame.save_png(&path)?;
        self.written.push(path);
        Ok(())
    }

    fn end(&mut self) -> FramegraphResult<()> {
        if self.cfg.take().is_none() {
            return Err(anyhow::anyhow!("png sink not started").into());
        }
        tracing::debug!(
            dir = %self.dir.display(),
            frames = self.written.len(),
            "png sequence written"
        );
        Ok(())
    }

    fn abort(&mut self) {
        self.cfg = None;
        for path in self.written.drain(..) {
            if let Err(e) = std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove '{}'", path.display()))
            {
                tracing::warn!(error = %e, "png sink cleanup failed");
            }
        }
    }
}
