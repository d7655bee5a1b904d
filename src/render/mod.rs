/// Backend trait and factory.
pub mod backend;
/// Reference CPU kernels.
pub mod cpu;
/// wgpu backend.
#[cfg(feature = "gpu")]
pub mod gpu;
/// Per-frame graph execution.
pub mod pipeline;
/// Pooled host pixel buffers.
pub mod surface_pool;
