use std::collections::HashMap;

use crate::foundation::error::RenderError;
use crate::texture::TextureDesc;

/// Pool configuration for cached pixel buffers.
#[derive(Debug, Clone, Copy)]
pub struct SurfacePoolOpts {
    /// Maximum bytes retained across all buckets.
    pub max_pool_bytes: usize,
    /// Maximum number of retained buffers per (w,h,format) bucket.
    pub max_surfaces_per_bucket: usize,
}

impl Default for SurfacePoolOpts {
    fn default() -> Self {
        Self {
            max_pool_bytes: 256 * 1024 * 1024,
            max_surfaces_per_bucket: 8,
        }
    }
}

/// Counters exposed for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SurfacePoolStats {
    /// Buffers currently parked in the pool.
    pub retained_surfaces: usize,
    /// Bytes currently parked in the pool.
    pub retained_bytes: usize,
    /// Fresh allocations made by `borrow`.
    pub alloc_surfaces: u64,
    /// Bytes allocated by `borrow`.
    pub alloc_bytes: u64,
    /// Buffers dropped instead of parked because a cap was hit.
    pub dropped_on_release: u64,
}

struct Bucket {
    surfaces: Vec<Vec<u8>>,
}

/// Bounded pooled allocator for host pixel buffers.
///
/// Keyed by `(width, height, format)`. Borrow/release happen at operation granularity, never
/// per pixel.
pub(crate) struct SurfacePool {
    opts: SurfacePoolOpts,
    stats: SurfacePoolStats,

    // Hash lookup is acceptable here: this is op-level, not per-pixel.
    bucket_idx_by_key: HashMap<TextureDesc, usize>,
    buckets: Vec<Bucket>,
}

impl SurfacePool {
    pub(crate) fn new(opts: SurfacePoolOpts) -> Self {
        Self {
            opts,
            stats: SurfacePoolStats::default(),
            bucket_idx_by_key: HashMap::new(),
            buckets: Vec::new(),
        }
    }

    pub(crate) fn stats(&self) -> SurfacePoolStats {
        self.stats.clone()
    }

    /// Buffer of `desc.byte_len()` bytes. Reused buffers keep stale contents; callers overwrite
    /// every byte. A failed fresh allocation is reported as `OutOfMemory`.
    pub(crate) fn borrow(&mut self, desc: TextureDesc) -> Result<Vec<u8>, RenderError> {
        let bytes = desc.byte_len();
        if let Some(&bi) = self.bucket_idx_by_key.get(&desc)
            && let Some(buf) = self.buckets[bi].surfaces.pop()
        {
            self.stats.retained_surfaces = self.stats.retained_surfaces.saturating_sub(1);
            self.stats.retained_bytes = self.stats.retained_bytes.saturating_sub(bytes);
            return Ok(buf);
        }

        let mut buf = Vec::new();
        buf.try_reserve_exact(bytes).map_err(|e| {
            RenderError::OutOfMemory(format!("{} buffer of {bytes} bytes: {e}", desc.extent))
        })?;
        buf.resize(bytes, 0);
        self.stats.alloc_surfaces = self.stats.alloc_surfaces.saturating_add(1);
        self.stats.alloc_bytes = self.stats.alloc_bytes.saturating_add(bytes as u64);
        Ok(buf)
    }

    pub(crate) fn release(&mut self, desc: TextureDesc, buf: Vec<u8>) {
        if self.opts.max_pool_bytes == 0 || self.opts.max_surfaces_per_bucket == 0 {
            self.stats.dropped_on_release = self.stats.dropped_on_release.saturating_add(1);
            return;
        }

        let bytes = desc.byte_len();
        if buf.len() != bytes
            || self.stats.retained_bytes.saturating_add(bytes) > self.opts.max_pool_bytes
        {
            self.stats.dropped_on_release = self.stats.dropped_on_release.saturating_add(1);
            return;
        }

        let bi = match self.bucket_idx_by_key.get(&desc).copied() {
            Some(i) => i,
            None => {
                let i = self.buckets.len();
                self.buckets.push(Bucket {
                    surfaces: Vec::new(),
                });
                self.bucket_idx_by_key.insert(desc, i);
                i
            }
        };

        let bucket = &mut self.buckets[bi];
        if bucket.surfaces.len() >= self.opts.max_surfaces_per_bucket {
            self.stats.dropped_on_release = self.stats.dropped_on_release.saturating_add(1);
            return;
        }

        bucket.surfaces.push(buf);
        self.stats.retained_surfaces = self.stats.retained_surfaces.saturating_add(1);
        self.stats.retained_bytes = self.stats.retained_bytes.saturating_add(bytes);
    }

    /// Drop every retained buffer.
    pub(crate) fn clear(&mut self) {
        self.buckets.clear();
        self.bucket_idx_by_key.clear();
        self.stats.retained_surfaces = 0;
        self.stats.retained_bytes = 0;
    }
}
