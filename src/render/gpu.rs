use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::foundation::error::{RenderError, ResourceError};
use crate::ops::{Operation, PARAM_SLOTS};
use crate::render::backend::{RenderBackend, SlotId};
use crate::texture::{Texture, TextureDesc};

const PRELUDE: &str = include_str!("../shaders/prelude.wgsl");
const STORAGE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// GPU backend configuration.
#[derive(Clone, Debug)]
pub struct GpuBackendOpts {
    /// Adapter preference.
    pub power_preference: wgpu::PowerPreference,
    /// Accept only a software adapter.
    pub force_fallback_adapter: bool,
}

impl Default for GpuBackendOpts {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct OpUniforms {
    texel: [f32; 2],
    src_texel: [f32; 2],
    flags: [u32; 4],
    values: [f32; PARAM_SLOTS],
}

struct DeviceState {
    device: wgpu::Device,
    queue: wgpu::Queue,
    lost: Arc<AtomicBool>,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    sampler: wgpu::Sampler,
    uniforms: wgpu::Buffer,
}

struct GpuSlot {
    desc: TextureDesc,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

/// wgpu backend: one render pipeline per shader program, drawn as a full-screen triangle.
///
/// Textures are stored as `Rgba8Unorm`; premultiplication is carried in the uniform flags so the
/// shared prelude can decode and encode each side correctly.
pub struct GpuBackend {
    opts: GpuBackendOpts,
    state: DeviceState,
    pipelines: HashMap<String, wgpu::RenderPipeline>,
    slots: HashMap<SlotId, GpuSlot>,
}

impl GpuBackend {
    /// Acquire an adapter and device.
    pub fn new(opts: GpuBackendOpts) -> Result<Self, ResourceError> {
        let state = DeviceState::acquire(&opts)?;
        Ok(Self {
            opts,
            state,
            pipelines: HashMap::new(),
            slots: HashMap::new(),
        })
    }

    fn check_device(&self) -> Result<(), RenderError> {
        if self.state.lost.load(Ordering::Acquire) {
            return Err(RenderError::DeviceLost("wgpu device lost".to_owned()));
        }
        Ok(())
    }

    fn create_texture(&self, desc: TextureDesc) -> Result<GpuSlot, RenderError> {
        let device = &self.state.device;
        let max_side = device.limits().max_texture_dimension_2d;
        if desc.width() > max_side || desc.height() > max_side {
            return Err(RenderError::backend(format!(
                "texture {} exceeds the device limit of {max_side} per side",
                desc.extent
            )));
        }
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("framegraph_slot"),
            size: extent3d(desc),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: STORAGE_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let oom = pollster::block_on(device.pop_error_scope());
        let invalid = pollster::block_on(device.pop_error_scope());
        if let Some(err) = oom {
            return Err(RenderError::OutOfMemory(err.to_string()));
        }
        if let Some(err) = invalid {
            return Err(RenderError::backend(format!("create_texture: {err}")));
        }
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(GpuSlot {
            desc,
            texture,
            view,
        })
    }
}

impl DeviceState {
    fn acquire(opts: &GpuBackendOpts) -> Result<Self, ResourceError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: opts.power_preference,
            compatible_surface: None,
            force_fallback_adapter: opts.force_fallback_adapter,
        }))
        .map_err(|e| ResourceError::DeviceUnavailable(format!("request_adapter: {e}")))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("framegraph"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| ResourceError::DeviceUnavailable(format!("request_device: {e}")))?;

        let lost = Arc::new(AtomicBool::new(false));
        {
            let lost = Arc::clone(&lost);
            device.set_device_lost_callback(move |reason, msg| {
                tracing::error!(?reason, %msg, "wgpu device lost");
                lost.store(true, Ordering::Release);
            });
        }

        let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                multisampled: false,
                view_dimension: wgpu::TextureViewDimension::D2,
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("framegraph_op_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                texture_entry(2),
                texture_entry(3),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("framegraph_op_pl"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("framegraph_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("framegraph_op_uniforms"),
            size: std::mem::size_of::<OpUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        tracing::info!(adapter = ?adapter.get_info().name, "gpu device acquired");

        Ok(Self {
            device,
            queue,
            lost,
            bind_group_layout,
            pipeline_layout,
            sampler,
            uniforms,
        })
    }
}

impl RenderBackend for GpuBackend {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn prepare(&mut self, op: &Operation) -> Result<(), ResourceError> {
        let program = &op.kind().program;
        if self.pipelines.contains_key(program.id.as_ref()) {
            return Ok(());
        }
        let device = &self.state.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let source = format!("{PRELUDE}\n{}", program.wgsl);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(program.id.as_ref()),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(program.id.as_ref()),
            layout: Some(&self.state.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: Some(program.vertex_entry.as_ref()),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: Some(program.fragment_entry.as_ref()),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: STORAGE_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(ResourceError::PipelineBuild {
                program: program.id.to_string(),
                reason: err.to_string(),
            });
        }
        tracing::debug!(program = %program.id, "gpu pipeline built");
        self.pipelines.insert(program.id.to_string(), pipeline);
        Ok(())
    }

    fn upload(&mut self, slot: SlotId, texture: &Texture) -> Result<(), RenderError> {
        self.check_device()?;
        self.release(slot);
        let desc = texture.desc();
        let gpu = self.create_texture(desc)?;
        self.state.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &gpu.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            texture.data(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(desc.width() * 4),
                rows_per_image: Some(desc.height()),
            },
            extent3d(desc),
        );
        self.slots.insert(slot, gpu);
        Ok(())
    }

    fn execute(
        &mut self,
        op: &Operation,
        inputs: &[SlotId],
        output: SlotId,
        desc: TextureDesc,
    ) -> Result<(), RenderError> {
        self.check_device()?;
        let program = &op.kind().program;
        let pipeline = self.pipelines.get(program.id.as_ref()).ok_or_else(|| {
            RenderError::backend(format!("program '{}' was not prepared", program.id))
        })?;

        let mut in_slots = Vec::with_capacity(inputs.len());
        for s in inputs {
            let gs = self.slots.get(s).ok_or_else(|| {
                RenderError::backend(format!("operation '{}' reads empty slot {}", op.id(), s.0))
            })?;
            in_slots.push(gs);
        }
        let Some(first) = in_slots.first() else {
            return Err(RenderError::backend(format!(
                "operation '{}' has no inputs",
                op.id()
            )));
        };
        let second = in_slots.get(1).unwrap_or(first);

        let target = self.create_texture(desc)?;
        let uniforms = OpUniforms {
            texel: [1.0 / desc.width() as f32, 1.0 / desc.height() as f32],
            src_texel: [
                1.0 / first.desc.width() as f32,
                1.0 / first.desc.height() as f32,
            ],
            flags: [
                u32::from(first.desc.format.is_premultiplied()),
                u32::from(second.desc.format.is_premultiplied()),
                u32::from(desc.format.is_premultiplied()),
                0,
            ],
            values: op.params().pack(),
        };
        let queue = &self.state.queue;
        queue.write_buffer(&self.state.uniforms, 0, bytemuck::bytes_of(&uniforms));

        let device = &self.state.device;
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("framegraph_op_bg"),
            layout: &self.state.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.state.uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.state.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&first.view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&second.view),
                },
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("framegraph_op_encoder"),
        });
        {
            let mut rp = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(op.id()),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            rp.set_pipeline(pipeline);
            rp.set_bind_group(0, &bind_group, &[]);
            rp.draw(0..3, 0..1);
        }
        queue.submit(Some(encoder.finish()));
        self.check_device()?;

        self.slots.insert(output, target);
        Ok(())
    }

    fn readback(&mut self, slot: SlotId) -> Result<Texture, RenderError> {
        self.check_device()?;
        let s = self
            .slots
            .get(&slot)
            .ok_or_else(|| RenderError::backend(format!("readback of empty slot {}", slot.0)))?;
        let desc = s.desc;
        let unpadded = desc.width() * 4;
        let bytes_per_row = align_to(unpadded, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let device = &self.state.device;
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("framegraph_readback"),
            size: u64::from(bytes_per_row) * u64::from(desc.height()),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("framegraph_readback_encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &s.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(desc.height()),
                },
            },
            extent3d(desc),
        );
        self.state.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| RenderError::DeviceLost(format!("wgpu poll failed: {e}")))?;
        rx.recv()
            .map_err(|_| RenderError::backend("readback channel closed"))?
            .map_err(|e| RenderError::backend(format!("readback map failed: {e}")))?;

        let mut data = Vec::with_capacity(desc.byte_len());
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks_exact(bytes_per_row as usize) {
                data.extend_from_slice(&row[..unpadded as usize]);
            }
        }
        buffer.unmap();
        Texture::new(desc, data).map_err(|e| RenderError::backend(e.to_string()))
    }

    fn release(&mut self, slot: SlotId) {
        if let Some(s) = self.slots.remove(&slot) {
            s.texture.destroy();
        }
    }

    fn reset_resources(&mut self) -> Result<(), ResourceError> {
        self.slots.clear();
        self.pipelines.clear();
        self.state = DeviceState::acquire(&self.opts)?;
        Ok(())
    }

    fn live_slots(&self) -> usize {
        self.slots.len()
    }
}

fn extent3d(desc: TextureDesc) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: desc.width(),
        height: desc.height(),
        depth_or_array_layers: 1,
    }
}

fn align_to(v: u32, alignment: u32) -> u32 {
    v.div_ceil(alignment) * alignment
}
