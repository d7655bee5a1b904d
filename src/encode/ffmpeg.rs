use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::encode::sink::{FrameSink, SinkConfig};
use crate::export::engine::QualityPreset;
use crate::foundation::core::{Fps, FrameIndex};
use crate::foundation::error::{FramegraphError, FramegraphResult};
use crate::foundation::math::{mul_div255_u8, mul_div255_u16};
use crate::texture::Texture;

/// Options for [`FfmpegSink`] MP4 output.
#[derive(Clone, Debug)]
pub struct FfmpegSinkOpts {
    /// Output MP4 file path.
    pub out_path: PathBuf,
    /// Overwrite output file if it already exists.
    pub overwrite: bool,
    /// Background color used to flatten alpha (RGBA8, straight alpha).
    pub bg_rgba: [u8; 4],
    /// Program to run; `ffmpeg` from `PATH` by default.
    pub program: PathBuf,
}

impl FfmpegSinkOpts {
    /// Create options for outputting an MP4 to `out_path`.
    pub fn new(out_path: impl Into<PathBuf>) -> Self {
        Self {
            out_path: out_path.into(),
            overwrite: true,
            bg_rgba: [0, 0, 0, 255],
            program: PathBuf::from("ffmpeg"),
        }
    }
}

/// Sink that spawns `ffmpeg` and streams raw RGBA frames to its stdin.
///
/// `ffmpeg` writes into a hidden partial file next to the output, which is renamed into place by
/// `end`. Aborting only ever removes that partial file.
pub struct FfmpegSink {
    opts: FfmpegSinkOpts,
    partial_path: Option<PathBuf>,

    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr_drain: Option<std::thread::JoinHandle<std::io::Result<Vec<u8>>>>,

    scratch: Vec<u8>,
    cfg: Option<SinkConfig>,
    last_idx: Option<FrameIndex>,
}

impl FfmpegSink {
    /// Create a new sink that streams into `ffmpeg`.
    pub fn new(opts: FfmpegSinkOpts) -> Self {
        Self {
            opts,
            partial_path: None,
            child: None,
            stdin: None,
            stderr_drain: None,
            scratch: Vec::new(),
            cfg: None,
            last_idx: None,
        }
    }

    /// Move the finished partial file onto the output path.
    fn commit_partial(&mut self) -> FramegraphResult<()> {
        use anyhow::Context as _;

        let Some(partial) = self.partial_path.take() else {
            return Ok(());
        };
        let out = &self.opts.out_path;
        // The output may have appeared while encoding.
        if !self.opts.overwrite && out.exists() {
            let _ = std::fs::remove_file(&partial);
            return Err(FramegraphError::validation(format!(
                "output file '{}' already exists",
                out.display()
            )));
        }
        // `rename` replaces an existing file atomically everywhere but Windows.
        #[cfg(windows)]
        if out.exists() {
            std::fs::remove_file(out)
                .with_context(|| format!("failed to replace '{}'", out.display()))?;
        }
        std::fs::rename(&partial, out).with_context(|| {
            format!("failed to move encoded output into '{}'", out.display())
        })?;
        Ok(())
    }
}

fn partial_path_for(out: &Path) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    let name = out
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_owned());
    out.with_file_name(format!(".{name}.{}-{n}.part", std::process::id()))
}

/// `libx264` arguments for a quality tier.
fn preset_args(preset: QualityPreset) -> [&'static str; 4] {
    match preset {
        QualityPreset::Low => ["-preset", "veryfast", "-crf", "32"],
        QualityPreset::Medium => ["-preset", "medium", "-crf", "26"],
        QualityPreset::High => ["-preset", "slow", "-crf", "20"],
        QualityPreset::Highest => ["-preset", "slower", "-crf", "16"],
    }
}

impl FrameSink for FfmpegSink {
    fn begin(&mut self, cfg: SinkConfig) -> FramegraphResult<()> {
        if cfg.fps.num == 0 || cfg.fps.den == 0 {
            return Err(FramegraphError::validation("fps must be non-zero"));
        }
        if cfg.width == 0 || cfg.height == 0 {
            return Err(FramegraphError::validation(
                "ffmpeg sink width/height must be non-zero",
            ));
        }
        if !cfg.width.is_multiple_of(2) || !cfg.height.is_multiple_of(2) {
            return Err(FramegraphError::validation(
                "ffmpeg sink width/height must be even (required for yuv420p mp4 output)",
            ));
        }

        ensure_parent_dir(&self.opts.out_path)?;
        if !self.opts.overwrite && self.opts.out_path.exists() {
            return Err(FramegraphError::validation(format!(
                "output file '{}' already exists",
                self.opts.out_path.display()
            )));
        }

        let mut cmd = Command::new(&self.opts.program);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        cmd.arg("-y");

        // Input: raw opaque RGBA8. Alpha is flattened in push_frame.
        cmd.args([
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgba",
            "-s",
            &format!("{}x{}", cfg.width, cfg.height),
        ]);
        push_input_fps(&mut cmd, cfg.fps);
        cmd.args(["-i", "pipe:0"]);
        cmd.args(["-an", "-c:v", "libx264"])
            .args(preset_args(cfg.preset))
            .args(["-pix_fmt", "yuv420p", "-movflags", "+faststart", "-f", "mp4"]);
        let partial = partial_path_for(&self.opts.out_path);
        cmd.arg(&partial);

        let mut child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!(
                "failed to spawn '{}' (is it installed and on PATH?): {e}",
                self.opts.program.display()
            )
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to open ffmpeg stdin"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to open ffmpeg stderr"))?;
        let stderr_drain = std::thread::spawn(move || {
            let mut stderr_bytes = Vec::new();
            stderr.read_to_end(&mut stderr_bytes)?;
            Ok(stderr_bytes)
        });

        tracing::debug!(
            out = %self.opts.out_path.display(),
            size = %format!("{}x{}", cfg.width, cfg.height),
            preset = ?cfg.preset,
            "ffmpeg started"
        );

        self.scratch = vec![0u8; (cfg.width as usize) * (cfg.height as usize) * 4];
        self.partial_path = Some(partial);
        self.child = Some(child);
        self.stdin = Some(stdin);
        self.stderr_drain = Some(stderr_drain);
        self.cfg = Some(cfg);
        self.last_idx = None;
        Ok(())
    }

    fn push_frame(&mut self, idx: FrameIndex, frame: &Texture) -> FramegraphResult<()> {
        let cfg = self
            .cfg
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("ffmpeg sink not started"))?;
        if let Some(last) = self.last_idx
            && idx.0 <= last.0
        {
            return Err(FramegraphError::validation(
                "ffmpeg sink received out-of-order frame index",
            ));
        }
        self.last_idx = Some(idx);

        let desc = frame.desc();
        if desc.width() != cfg.width || desc.height() != cfg.height {
            return Err(FramegraphError::validation(format!(
                "frame size mismatch: got {}, expected {}x{}",
                desc.extent, cfg.width, cfg.height
            )));
        }

        flatten_over_bg_to_opaque_rgba8(
            &mut self.scratch,
            frame.data(),
            desc.format.is_premultiplied(),
            self.opts.bg_rgba,
        )?;

        let Some(stdin) = self.stdin.as_mut() else {
            return Err(anyhow::anyhow!("ffmpeg sink is already finalized").into());
        };

        use std::io::Write as _;
        stdin
            .write_all(&self.scratch)
            .map_err(|e| anyhow::anyhow!("failed to write frame to ffmpeg stdin: {e}"))?;
        Ok(())
    }

    fn end(&mut self) -> FramegraphResult<()> {
        drop(self.stdin.take());
        let mut child = self
            .child
            .take()
            .ok_or_else(|| anyhow::anyhow!("ffmpeg sink not started"))?;

        let status = child
            .wait()
            .map_err(|e| anyhow::anyhow!("failed to wait for ffmpeg to finish: {e}"))?;
        let stderr_bytes = match self.stderr_drain.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow::anyhow!("ffmpeg stderr drain thread panicked"))?
                .map_err(|e| anyhow::anyhow!("ffmpeg stderr read failed: {e}"))?,
            None => Vec::new(),
        };

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr_bytes);
            return Err(anyhow::anyhow!(
                "ffmpeg exited with status {}: {}",
                status,
                stderr.trim()
            )
            .into());
        }

        self.commit_partial()?;
        self.cfg = None;
        Ok(())
    }

    fn abort(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(handle) = self.stderr_drain.take() {
            let _ = handle.join();
        }
        self.cfg = None;
        let Some(partial) = self.partial_path.take() else {
            return;
        };
        match std::fs::remove_file(&partial) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                out = %partial.display(),
                error = %e,
                "failed to remove partial ffmpeg output"
            ),
        }
    }
}

fn push_input_fps(cmd: &mut Command, fps: Fps) {
    // For rawvideo input, `-r` before `-i` sets the input framerate, as `num/den`.
    cmd.args(["-r", &format!("{}/{}", fps.num, fps.den)]);
}

fn flatten_over_bg_to_opaque_rgba8(
    dst: &mut [u8],
    src: &[u8],
    premultiplied: bool,
    bg_rgba: [u8; 4],
) -> FramegraphResult<()> {
    if dst.len() != src.len() || !dst.len().is_multiple_of(4) {
        return Err(FramegraphError::validation(
            "flatten_over_bg_to_opaque_rgba8 expects equal-length rgba8 buffers",
        ));
    }

    let bg = [
        u16::from(bg_rgba[0]),
        u16::from(bg_rgba[1]),
        u16::from(bg_rgba[2]),
    ];

    for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        let a = u16::from(s[3]);
        if a == 255 {
            d.copy_from_slice(s);
            continue;
        }

        let inv = 255u16 - a;
        for c in 0..3 {
            let fg = if premultiplied {
                u16::from(s[c])
            } else {
                u16::from(mul_div255_u8(u16::from(s[c]), a))
            };
            d[c] = (fg + mul_div255_u16(bg[c], inv)).min(255) as u8;
        }
        d[3] = 255;
    }

    Ok(())
}

/// Ensure the parent directory of `path` exists.
pub fn ensure_parent_dir(path: &Path) -> FramegraphResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        use anyhow::Context as _;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory '{}'", parent.display()))?;
    }
    Ok(())
}

/// Return `true` when `ffmpeg` can be invoked from `PATH`.
pub fn is_ffmpeg_on_path() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
