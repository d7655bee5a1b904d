use crate::foundation::error::{FramegraphResult, RenderError, ResourceError};
use crate::ops::Operation;
use crate::texture::{Texture, TextureDesc};

/// Per-frame texture slot. The render pipeline uses the graph node index, so slots form an
/// arena indexed by node id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub u32);

/// Device abstraction the render pipeline drives.
///
/// A backend owns device-side textures keyed by [`SlotId`] and one cached pipeline per shader
/// program. The pipeline decides *when* slots are filled and released; the backend only does
/// what it is told.
pub trait RenderBackend: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Build (or reuse) the pipeline state for `op`'s program.
    fn prepare(&mut self, op: &Operation) -> Result<(), ResourceError>;

    /// Copy a host texture into `slot`.
    fn upload(&mut self, slot: SlotId, texture: &Texture) -> Result<(), RenderError>;

    /// Run `op` reading `inputs` and writing a fresh `output` slot described by `desc`.
    fn execute(
        &mut self,
        op: &Operation,
        inputs: &[SlotId],
        output: SlotId,
        desc: TextureDesc,
    ) -> Result<(), RenderError>;

    /// Copy `slot` back to host memory.
    fn readback(&mut self, slot: SlotId) -> Result<Texture, RenderError>;

    /// Return `slot`'s storage to the backend. Releasing an empty slot is a no-op.
    fn release(&mut self, slot: SlotId);

    /// Drop every slot and cached pipeline and reacquire device resources. Pipelines must be
    /// prepared again afterwards.
    fn reset_resources(&mut self) -> Result<(), ResourceError>;

    /// Number of occupied slots.
    fn live_slots(&self) -> usize;
}

/// Available backend kinds.
///
/// - `Cpu` is always available.
/// - `Gpu` requires the `gpu` cargo feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Reference CPU kernels.
    Cpu,
    /// wgpu render pipelines.
    #[cfg(feature = "gpu")]
    Gpu,
}

/// Create a rendering backend implementation with default options.
pub fn create_backend(kind: BackendKind) -> FramegraphResult<Box<dyn RenderBackend>> {
    match kind {
        BackendKind::Cpu => Ok(Box::new(crate::render::cpu::CpuBackend::new(
            crate::render::cpu::CpuBackendOpts::default(),
        ))),
        #[cfg(feature = "gpu")]
        BackendKind::Gpu => Ok(Box::new(crate::render::gpu::GpuBackend::new(
            crate::render::gpu::GpuBackendOpts::default(),
        )?)),
    }
}
