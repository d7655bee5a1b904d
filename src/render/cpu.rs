use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::foundation::error::{RenderError, ResourceError};
use crate::foundation::math::{u8_to_unorm, unorm_to_u8};
use crate::ops::{Operation, PARAM_SLOTS};
use crate::render::backend::{RenderBackend, SlotId};
use crate::render::surface_pool::{SurfacePool, SurfacePoolOpts, SurfacePoolStats};
use crate::texture::{Texture, TextureDesc};

/// Straight-alpha RGBA in `[0, 1]`.
pub type Rgba = [f32; 4];

/// Per-pixel CPU implementation of a shader program.
///
/// Called once per output pixel with the pixel's integer coordinates. Returns a straight-alpha
/// color; the backend clamps it and encodes it into the output format.
pub type CpuKernel = Arc<dyn Fn(&KernelCtx<'_>, u32, u32) -> Rgba + Send + Sync>;

/// CPU backend configuration.
#[derive(Clone, Debug, Default)]
pub struct CpuBackendOpts {
    /// Buffer pool limits.
    pub pool: SurfacePoolOpts,
}

/// Read-only view of an input texture with clamp-to-edge addressing.
pub struct Plane<'a> {
    desc: TextureDesc,
    data: &'a [u8],
}

impl<'a> Plane<'a> {
    fn new(desc: TextureDesc, data: &'a [u8]) -> Self {
        Self { desc, data }
    }

    /// Description of the underlying texture.
    pub fn desc(&self) -> TextureDesc {
        self.desc
    }

    fn raw(&self, x: i64, y: i64) -> Rgba {
        let w = i64::from(self.desc.width());
        let h = i64::from(self.desc.height());
        let x = x.clamp(0, w - 1) as usize;
        let y = y.clamp(0, h - 1) as usize;
        let i = (y * w as usize + x) * 4;
        match self.data.get(i..i + 4) {
            Some(p) => [
                u8_to_unorm(p[0]),
                u8_to_unorm(p[1]),
                u8_to_unorm(p[2]),
                u8_to_unorm(p[3]),
            ],
            None => [0.0; 4],
        }
    }

    fn decode(&self, c: Rgba) -> Rgba {
        if self.desc.format.is_premultiplied() {
            unpremul(c)
        } else {
            c
        }
    }

    /// Straight-alpha texel at integer coordinates.
    pub fn fetch(&self, x: i64, y: i64) -> Rgba {
        self.decode(self.raw(x, y))
    }

    /// Straight-alpha bilinear sample at normalized coordinates (texel centers at `(i + 0.5) / n`).
    pub fn sample(&self, u: f32, v: f32) -> Rgba {
        let fx = snap(u * self.desc.width() as f32 - 0.5);
        let fy = snap(v * self.desc.height() as f32 - 0.5);
        let x0 = fx.floor();
        let y0 = fy.floor();
        let tx = fx - x0;
        let ty = fy - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);

        // Filtering happens on stored values, like a hardware sampler.
        let a = self.raw(x0, y0);
        let b = self.raw(x0 + 1, y0);
        let c = self.raw(x0, y0 + 1);
        let d = self.raw(x0 + 1, y0 + 1);
        let mut out = [0.0f32; 4];
        for k in 0..4 {
            let top = a[k] + (b[k] - a[k]) * tx;
            let bottom = c[k] + (d[k] - c[k]) * tx;
            out[k] = top + (bottom - top) * ty;
        }
        self.decode(out)
    }
}

/// Everything a kernel may read.
pub struct KernelCtx<'a> {
    inputs: SmallVec<[Plane<'a>; 2]>,
    params: [f32; PARAM_SLOTS],
    output: TextureDesc,
}

impl KernelCtx<'_> {
    /// Input `i`. Kernels are only called with the operation's declared arity.
    pub fn input(&self, i: usize) -> &Plane<'_> {
        &self.inputs[i]
    }

    /// Parameter slot `i` (see [`crate::OpParams::pack`]).
    pub fn param(&self, i: usize) -> f32 {
        self.params.get(i).copied().unwrap_or(0.0)
    }

    /// Output description.
    pub fn output(&self) -> TextureDesc {
        self.output
    }

    /// Normalized coordinates of the center of output pixel `(x, y)`.
    pub fn uv(&self, x: u32, y: u32) -> (f32, f32) {
        (
            (x as f32 + 0.5) / self.output.width() as f32,
            (y as f32 + 0.5) / self.output.height() as f32,
        )
    }
}

struct CpuSlot {
    desc: TextureDesc,
    data: Vec<u8>,
}

/// Reference backend running every built-in program on the CPU.
///
/// Output is a deterministic function of the inputs and parameters.
pub struct CpuBackend {
    pool: SurfacePool,
    slots: HashMap<SlotId, CpuSlot>,
    kernels: HashMap<String, CpuKernel>,
    prepared: HashMap<String, CpuKernel>,
}

impl CpuBackend {
    /// Backend with the built-in kernels.
    pub fn new(opts: CpuBackendOpts) -> Self {
        Self {
            pool: SurfacePool::new(opts.pool),
            slots: HashMap::new(),
            kernels: HashMap::new(),
            prepared: HashMap::new(),
        }
    }

    /// Provide a kernel for a custom program id. Overrides a built-in of the same id.
    pub fn register_kernel(&mut self, program_id: impl Into<String>, kernel: CpuKernel) {
        let id = program_id.into();
        self.prepared.remove(&id);
        self.kernels.insert(id, kernel);
    }

    /// Buffer pool counters.
    pub fn pool_stats(&self) -> SurfacePoolStats {
        self.pool.stats()
    }

    fn kernel_for(&self, program_id: &str) -> Option<CpuKernel> {
        if let Some(k) = self.kernels.get(program_id) {
            return Some(k.clone());
        }
        builtin_kernel(program_id)
    }
}

impl RenderBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn prepare(&mut self, op: &Operation) -> Result<(), ResourceError> {
        let program = &op.kind().program;
        if self.prepared.contains_key(program.id.as_ref()) {
            return Ok(());
        }
        let kernel = self
            .kernel_for(&program.id)
            .ok_or_else(|| ResourceError::ShaderNotFound {
                program: program.id.to_string(),
            })?;
        self.prepared.insert(program.id.to_string(), kernel);
        Ok(())
    }

    fn upload(&mut self, slot: SlotId, texture: &Texture) -> Result<(), RenderError> {
        self.release(slot);
        let desc = texture.desc();
        let mut data = self.pool.borrow(desc)?;
        data.copy_from_slice(texture.data());
        self.slots.insert(slot, CpuSlot { desc, data });
        Ok(())
    }

    fn execute(
        &mut self,
        op: &Operation,
        inputs: &[SlotId],
        output: SlotId,
        desc: TextureDesc,
    ) -> Result<(), RenderError> {
        let program = &op.kind().program;
        let kernel = self.prepared.get(program.id.as_ref()).cloned().ok_or_else(|| {
            RenderError::backend(format!("program '{}' was not prepared", program.id))
        })?;

        let mut out = self.pool.borrow(desc)?;
        {
            let mut planes = SmallVec::<[Plane<'_>; 2]>::new();
            for slot in inputs {
                let Some(s) = self.slots.get(slot) else {
                    self.pool.release(desc, out);
                    return Err(RenderError::backend(format!(
                        "operation '{}' reads empty slot {}",
                        op.id(),
                        slot.0
                    )));
                };
                planes.push(Plane::new(s.desc, &s.data));
            }
            let ctx = KernelCtx {
                inputs: planes,
                params: op.params().pack(),
                output: desc,
            };
            let premul = desc.format.is_premultiplied();
            let w = desc.width() as usize;
            for (i, px) in out.chunks_exact_mut(4).enumerate() {
                let x = (i % w) as u32;
                let y = (i / w) as u32;
                let c = encode(kernel(&ctx, x, y), premul);
                px.copy_from_slice(&c);
            }
        }

        if let Some(prev) = self.slots.insert(output, CpuSlot { desc, data: out }) {
            self.pool.release(prev.desc, prev.data);
        }
        Ok(())
    }

    fn readback(&mut self, slot: SlotId) -> Result<Texture, RenderError> {
        let s = self
            .slots
            .get(&slot)
            .ok_or_else(|| RenderError::backend(format!("readback of empty slot {}", slot.0)))?;
        Texture::new(s.desc, s.data.clone()).map_err(|e| RenderError::backend(e.to_string()))
    }

    fn release(&mut self, slot: SlotId) {
        if let Some(s) = self.slots.remove(&slot) {
            self.pool.release(s.desc, s.data);
        }
    }

    fn reset_resources(&mut self) -> Result<(), ResourceError> {
        self.slots.clear();
        self.prepared.clear();
        self.pool.clear();
        Ok(())
    }

    fn live_slots(&self) -> usize {
        self.slots.len()
    }
}

// Absorb float error so texel-center lookups hit exactly one texel.
fn snap(f: f32) -> f32 {
    let r = f.round();
    if (f - r).abs() < 1e-3 { r } else { f }
}

fn unpremul(c: Rgba) -> Rgba {
    if c[3] <= 0.0 {
        return [0.0; 4];
    }
    [c[0] / c[3], c[1] / c[3], c[2] / c[3], c[3]]
}

fn premul(c: Rgba) -> Rgba {
    [c[0] * c[3], c[1] * c[3], c[2] * c[3], c[3]]
}

fn encode(c: Rgba, premultiplied: bool) -> [u8; 4] {
    let mut s = c.map(|v| if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) });
    if premultiplied {
        s = premul(s);
    }
    s.map(unorm_to_u8)
}

fn luma(c: Rgba) -> f32 {
    c[0] * 0.299 + c[1] * 0.587 + c[2] * 0.114
}

fn lerp(a: Rgba, b: Rgba, t: f32) -> Rgba {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
        a[3] + (b[3] - a[3]) * t,
    ]
}

fn smoothstep(x: f32) -> f32 {
    let t = x.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

fn builtin_kernel(program_id: &str) -> Option<CpuKernel> {
    let k: CpuKernel = match program_id {
        "passthrough" | "scale" => Arc::new(passthrough),
        "fxaa" => Arc::new(fxaa),
        "color_matrix" => Arc::new(color_matrix),
        "brightness" => Arc::new(brightness),
        "saturation" => Arc::new(saturation),
        "invert" => Arc::new(invert),
        "mix" => Arc::new(mix),
        "over" => Arc::new(over),
        "mask" => Arc::new(mask),
        _ => return None,
    };
    Some(k)
}

fn passthrough(ctx: &KernelCtx<'_>, x: u32, y: u32) -> Rgba {
    let (u, v) = ctx.uv(x, y);
    ctx.input(0).sample(u, v)
}

const FXAA_EDGE_THRESHOLD_MIN: f32 = 0.0312;
const FXAA_MIN_EDGE_BLEND: f32 = 0.25;

fn fxaa(ctx: &KernelCtx<'_>, x: u32, y: u32) -> Rgba {
    let src = ctx.input(0);
    let subpix = ctx.param(0);
    let edge_threshold = ctx.param(1);
    let (x, y) = (i64::from(x), i64::from(y));

    let m = src.fetch(x, y);
    let lm = luma(m);
    let ln = luma(src.fetch(x, y - 1));
    let ls = luma(src.fetch(x, y + 1));
    let le = luma(src.fetch(x + 1, y));
    let lw = luma(src.fetch(x - 1, y));

    let range_max = lm.max(ln.max(ls)).max(le.max(lw));
    let range_min = lm.min(ln.min(ls)).min(le.min(lw));
    let range = range_max - range_min;
    if range < FXAA_EDGE_THRESHOLD_MIN.max(range_max * edge_threshold) {
        return m;
    }

    let lnw = luma(src.fetch(x - 1, y - 1));
    let lne = luma(src.fetch(x + 1, y - 1));
    let lsw = luma(src.fetch(x - 1, y + 1));
    let lse = luma(src.fetch(x + 1, y + 1));

    let luma_l = (ln + ls + le + lw) * 0.25;
    let blend_l = ((luma_l - lm).abs() / range).clamp(0.0, 1.0);
    let sub = smoothstep(blend_l);
    let sub_blend = sub * sub * subpix;

    let edge_horz = (ln + ls - 2.0 * lm).abs() * 2.0
        + (lnw + lsw - 2.0 * lw).abs()
        + (lne + lse - 2.0 * le).abs();
    let edge_vert = (le + lw - 2.0 * lm).abs() * 2.0
        + (lnw + lne - 2.0 * ln).abs()
        + (lsw + lse - 2.0 * ls).abs();

    // Step across the edge toward the neighbor with the larger gradient.
    let (step, l1, l2) = if edge_horz >= edge_vert {
        ((0, 1), ln, ls)
    } else {
        ((1, 0), lw, le)
    };
    let dir = if (l1 - lm).abs() >= (l2 - lm).abs() {
        (-step.0, -step.1)
    } else {
        step
    };

    let other = src.fetch(x + dir.0, y + dir.1);
    lerp(m, other, sub_blend.max(FXAA_MIN_EDGE_BLEND))
}

fn color_matrix(ctx: &KernelCtx<'_>, x: u32, y: u32) -> Rgba {
    let (u, v) = ctx.uv(x, y);
    let c = ctx.input(0).sample(u, v);
    let mut out = [0.0f32; 4];
    for (row, o) in out.iter_mut().enumerate() {
        let b = row * 5;
        *o = ctx.param(b) * c[0]
            + ctx.param(b + 1) * c[1]
            + ctx.param(b + 2) * c[2]
            + ctx.param(b + 3) * c[3]
            + ctx.param(b + 4);
    }
    out
}

fn brightness(ctx: &KernelCtx<'_>, x: u32, y: u32) -> Rgba {
    let (u, v) = ctx.uv(x, y);
    let c = ctx.input(0).sample(u, v);
    let a = ctx.param(0);
    [c[0] + a, c[1] + a, c[2] + a, c[3]]
}

fn saturation(ctx: &KernelCtx<'_>, x: u32, y: u32) -> Rgba {
    let (u, v) = ctx.uv(x, y);
    let c = ctx.input(0).sample(u, v);
    let l = luma(c);
    let s = ctx.param(0);
    [
        l + (c[0] - l) * s,
        l + (c[1] - l) * s,
        l + (c[2] - l) * s,
        c[3],
    ]
}

fn invert(ctx: &KernelCtx<'_>, x: u32, y: u32) -> Rgba {
    let (u, v) = ctx.uv(x, y);
    let c = ctx.input(0).sample(u, v);
    [1.0 - c[0], 1.0 - c[1], 1.0 - c[2], c[3]]
}

// Two-input programs blend in premultiplied space.

fn mix(ctx: &KernelCtx<'_>, x: u32, y: u32) -> Rgba {
    let (u, v) = ctx.uv(x, y);
    let a = premul(ctx.input(0).sample(u, v));
    let b = premul(ctx.input(1).sample(u, v));
    unpremul(lerp(a, b, ctx.param(0)))
}

fn over(ctx: &KernelCtx<'_>, x: u32, y: u32) -> Rgba {
    let (u, v) = ctx.uv(x, y);
    let bg = premul(ctx.input(0).sample(u, v));
    let fg = premul(ctx.input(1).sample(u, v)).map(|c| c * ctx.param(0));
    let k = 1.0 - fg[3];
    unpremul([
        fg[0] + bg[0] * k,
        fg[1] + bg[1] * k,
        fg[2] + bg[2] * k,
        fg[3] + bg[3] * k,
    ])
}

fn mask(ctx: &KernelCtx<'_>, x: u32, y: u32) -> Rgba {
    let (u, v) = ctx.uv(x, y);
    let src = premul(ctx.input(0).sample(u, v));
    let mut m = ctx.input(1).sample(u, v)[3];
    if ctx.param(0) != 0.0 {
        m = 1.0 - m;
    }
    unpremul(src.map(|c| c * m))
}

#[cfg(test)]
#[path = "../../tests/unit/render/cpu.rs"]
mod tests;
