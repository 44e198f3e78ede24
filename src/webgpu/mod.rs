//! wgpu engine.
//!
//! wgpu render passes borrow their encoder, which does not fit an
//! immediate-mode surface where draws and clears arrive one call at a
//! time. Instead of fighting the borrow, the engine defers: every clear,
//! target switch, draw, and pixel copy is recorded as a frame op with
//! all of its GPU objects resolved eagerly, and the whole list is
//! replayed into one encoder at `present`.

mod convert;

use std::borrow::Cow;
use std::collections::HashMap;
use std::num::NonZeroU64;

use glam::{IVec2, Vec4};

use crate::backend::{
    expand_rgb_to_rgba, Backend, BackendType, BindingQueues, RenderTargetHandle, ShaderHandle,
    TextureHandle, WindowSurface,
};
use crate::cache::{PipelineCache, ShaderId, ShaderKeyed};
use crate::error::{GfxError, Result};
use crate::shader::{BindingKind, CompiledShader, MergedBinding};
use crate::stream::StreamPool;
use crate::types::{
    BlendMode, BufferView, CullMode, DepthMode, PipelineState, Sampler, Scissor, StencilMode,
    TextureAddress, Topology, Viewport,
};
use crate::utils::{Handle, Pool};
use crate::vertex::VertexLayout;

use convert::vertex_format;

const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth24PlusStencil8;

struct WgTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

struct WgRenderTarget {
    color: Handle<WgTexture>,
    depth_view: wgpu::TextureView,
    width: u32,
    height: u32,
}

struct WgShader {
    id: ShaderId,
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
    bindings: Vec<MergedBinding>,
    layout: VertexLayout,
    main_group_layout: wgpu::BindGroupLayout,
    sampler_group_layout: Option<wgpu::BindGroupLayout>,
    pipeline_layout: wgpu::PipelineLayout,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    shader: ShaderId,
    state: PipelineState,
    // Strip topologies bake the index width into the pipeline.
    strip_index: Option<wgpu::IndexFormat>,
}

impl ShaderKeyed for PipelineKey {
    fn shader_id(&self) -> ShaderId {
        self.shader
    }
}

enum DrawKind {
    Plain { count: u32, first: u32 },
    Indexed { count: u32, first: u32 },
}

struct DrawCmd {
    target: Option<RenderTargetHandle>,
    pipeline: wgpu::RenderPipeline,
    main_group: Option<wgpu::BindGroup>,
    sampler_group: Option<wgpu::BindGroup>,
    vertex: wgpu::Buffer,
    vertex_len: u64,
    index: Option<(wgpu::Buffer, wgpu::IndexFormat, u64)>,
    viewport: Option<Viewport>,
    scissor: Option<Scissor>,
    stencil_reference: u32,
    kind: DrawKind,
}

enum FrameOp {
    BeginPass {
        target: Option<RenderTargetHandle>,
        clear_color: Option<Vec4>,
        clear_depth: Option<f32>,
        clear_stencil: Option<u8>,
    },
    Draw(Box<DrawCmd>),
    ReadPixels {
        position: IVec2,
        size: IVec2,
        dst: TextureHandle,
        // The target bound when the read was issued, not whatever is
        // bound by the time the frame replays.
        target: Option<RenderTargetHandle>,
    },
}

#[derive(Default)]
struct DrawState {
    topology: Topology,
    cull: CullMode,
    blend: Option<BlendMode>,
    depth: Option<DepthMode>,
    stencil: Option<StencilMode>,
    viewport: Option<Viewport>,
    scissor: Option<Scissor>,
    sampler: Sampler,
    address: TextureAddress,
    shader: Option<ShaderHandle>,
    target: Option<RenderTargetHandle>,
}

pub struct WgpuEngine {
    _instance: wgpu::Instance,
    surface: wgpu::Surface<'static>,
    _adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    backbuffer_readable: bool,
    depth_view: wgpu::TextureView,

    textures: Pool<WgTexture>,
    render_targets: Pool<WgRenderTarget>,
    shaders: Pool<WgShader>,
    pipelines: PipelineCache<PipelineKey, wgpu::RenderPipeline>,
    next_shader_id: ShaderId,
    samplers: HashMap<(Sampler, TextureAddress), wgpu::Sampler>,
    streams: StreamPool<wgpu::Buffer>,

    state: DrawState,
    vertex: Option<(wgpu::Buffer, u64)>,
    index: Option<(wgpu::Buffer, wgpu::IndexFormat, u64)>,
    bindings: BindingQueues<TextureHandle, (wgpu::Buffer, u64)>,
    ops: Vec<FrameOp>,
}

impl WgpuEngine {
    pub fn new(window: WindowSurface) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = unsafe {
            instance.create_surface_unsafe(wgpu::SurfaceTargetUnsafe::RawHandle {
                raw_display_handle: window.display,
                raw_window_handle: window.window,
            })
        }?;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .map_err(|_| GfxError::NoSuitableAdapter)?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("fresco device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        }))?;

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| !f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or(GfxError::NoSuitableAdapter)?;

        // Backbuffer readback is an optional surface capability here.
        let backbuffer_readable = caps.usages.contains(wgpu::TextureUsages::COPY_SRC);
        let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
        if backbuffer_readable {
            usage |= wgpu::TextureUsages::COPY_SRC;
        }

        let config = wgpu::SurfaceConfiguration {
            usage,
            format,
            width: window.width.max(1),
            height: window.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        let depth_view = build_depth_view(&device, config.width, config.height);

        log::info!(
            "wgpu engine up: {:?} surface {}x{}, backbuffer readback {}",
            format,
            config.width,
            config.height,
            if backbuffer_readable { "on" } else { "off" }
        );

        Ok(Self {
            _instance: instance,
            surface,
            _adapter: adapter,
            device,
            queue,
            config,
            backbuffer_readable,
            depth_view,
            textures: Pool::default(),
            render_targets: Pool::default(),
            shaders: Pool::default(),
            pipelines: PipelineCache::default(),
            next_shader_id: 1,
            samplers: HashMap::new(),
            streams: StreamPool::new(64 * 1024),
            state: DrawState::default(),
            vertex: None,
            index: None,
            bindings: BindingQueues::default(),
            ops: Vec::new(),
        })
    }

    fn upload(&mut self, data: &[u8]) -> Result<(wgpu::Buffer, u64)> {
        let Self {
            ref device,
            ref queue,
            ref mut streams,
            ..
        } = *self;

        let buffer = streams.acquire(data.len(), |old, size| {
            drop(old);
            Ok::<_, GfxError>(device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("fresco stream buffer"),
                size: size as u64,
                usage: wgpu::BufferUsages::VERTEX
                    | wgpu::BufferUsages::INDEX
                    | wgpu::BufferUsages::UNIFORM
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }))
        })?;

        queue.write_buffer(buffer, 0, data);
        Ok((buffer.clone(), data.len() as u64))
    }

    fn sampler(&mut self, filter: Sampler, address: TextureAddress) -> wgpu::Sampler {
        self.samplers
            .entry((filter, address))
            .or_insert_with(|| {
                self.device.create_sampler(&wgpu::SamplerDescriptor {
                    label: Some("fresco sampler"),
                    address_mode_u: address.into(),
                    address_mode_v: address.into(),
                    address_mode_w: address.into(),
                    mag_filter: filter.into(),
                    min_filter: filter.into(),
                    mipmap_filter: filter.into(),
                    ..Default::default()
                })
            })
            .clone()
    }

    fn target_extent(&self, target: Option<RenderTargetHandle>) -> Result<(u32, u32)> {
        match target {
            None => Ok((self.config.width, self.config.height)),
            Some(rt) => {
                let rt = self
                    .render_targets
                    .get_ref(Handle::from_raw(rt.raw()))
                    .ok_or(GfxError::StaleHandle("render target"))?;
                Ok((rt.width, rt.height))
            }
        }
    }

    fn record_draw(&mut self, kind: DrawKind, indexed: bool) -> Result<()> {
        let shader_handle = self
            .state
            .shader
            .ok_or(GfxError::MissingDrawState("shader"))?;
        let (vertex, vertex_len) = self
            .vertex
            .clone()
            .ok_or(GfxError::MissingDrawState("vertex buffer"))?;
        let index = if indexed {
            Some(
                self.index
                    .clone()
                    .ok_or(GfxError::MissingDrawState("index buffer"))?,
            )
        } else {
            None
        };
        let sampler = self.sampler(self.state.sampler, self.state.address);

        let Self {
            ref device,
            ref mut pipelines,
            ref shaders,
            ref textures,
            ref config,
            ref state,
            ref bindings,
            ..
        } = *self;

        let shader = shaders
            .get_ref(Handle::from_raw(shader_handle.raw()))
            .ok_or(GfxError::StaleHandle("shader"))?;

        let pipeline_state = PipelineState {
            topology: state.topology,
            cull_mode: state.cull,
            blend: state.blend,
            depth: state.depth,
            stencil: state.stencil,
        };
        let strip_index = match (state.topology, &index) {
            (Topology::LineStrip | Topology::TriangleStrip, Some((_, format, _))) => Some(*format),
            _ => None,
        };
        let key = PipelineKey {
            shader: shader.id,
            state: pipeline_state,
            strip_index,
        };
        let pipeline = pipelines
            .get_or_try_insert(key.clone(), || {
                build_pipeline(device, shader, &key, config.format)
            })?
            .clone();

        // Combined image samplers are split across two groups: the
        // texture keeps the shader's binding slot in group 0, the
        // sampler mirrors it in group 1.
        let mut main_entries = Vec::new();
        let mut sampler_entries = Vec::new();
        let mut buffer_bindings = Vec::with_capacity(shader.bindings.len());
        for binding in &shader.bindings {
            if binding.kind == BindingKind::UniformBuffer {
                let (buffer, len) = bindings
                    .buffers
                    .get(&binding.binding)
                    .ok_or(GfxError::MissingDrawState("uniform buffer"))?;
                buffer_bindings.push((binding.binding, buffer.clone(), *len));
            }
        }
        for (slot, buffer, len) in &buffer_bindings {
            main_entries.push(wgpu::BindGroupEntry {
                binding: *slot,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer,
                    offset: 0,
                    size: NonZeroU64::new(*len),
                }),
            });
        }
        for binding in &shader.bindings {
            if binding.kind != BindingKind::CombinedImageSampler {
                continue;
            }
            let tex_handle = bindings
                .images
                .get(&binding.binding)
                .ok_or(GfxError::MissingDrawState("texture"))?;
            let tex = textures
                .get_ref(Handle::from_raw(tex_handle.raw()))
                .ok_or(GfxError::StaleHandle("texture"))?;
            main_entries.push(wgpu::BindGroupEntry {
                binding: binding.binding,
                resource: wgpu::BindingResource::TextureView(&tex.view),
            });
            sampler_entries.push(wgpu::BindGroupEntry {
                binding: binding.binding,
                resource: wgpu::BindingResource::Sampler(&sampler),
            });
        }

        let main_group = if main_entries.is_empty() {
            None
        } else {
            Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("fresco draw bindings"),
                layout: &shader.main_group_layout,
                entries: &main_entries,
            }))
        };
        let sampler_group = match &shader.sampler_group_layout {
            Some(layout) => Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("fresco draw samplers"),
                layout,
                entries: &sampler_entries,
            })),
            None => None,
        };

        let stencil_reference = state.stencil.map(|s| s.reference as u32).unwrap_or(0);
        let cmd = DrawCmd {
            target: state.target,
            pipeline,
            main_group,
            sampler_group,
            vertex,
            vertex_len,
            index,
            viewport: state.viewport,
            scissor: state.scissor,
            stencil_reference,
            kind,
        };
        self.ops.push(FrameOp::Draw(Box::new(cmd)));
        Ok(())
    }

    fn begin_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        frame_view: &wgpu::TextureView,
        target: Option<RenderTargetHandle>,
        clear_color: Option<Vec4>,
        clear_depth: Option<f32>,
        clear_stencil: Option<u8>,
    ) -> Result<wgpu::RenderPass<'static>> {
        let (color_view, depth_view) = match target {
            None => (frame_view, &self.depth_view),
            Some(rt) => {
                let rt = self
                    .render_targets
                    .get_ref(Handle::from_raw(rt.raw()))
                    .ok_or(GfxError::StaleHandle("render target"))?;
                let color = self
                    .textures
                    .get_ref(rt.color)
                    .ok_or(GfxError::StaleHandle("render target texture"))?;
                (&color.view, &rt.depth_view)
            }
        };

        let load_color = match clear_color {
            Some(c) => wgpu::LoadOp::Clear(wgpu::Color {
                r: c.x as f64,
                g: c.y as f64,
                b: c.z as f64,
                a: c.w as f64,
            }),
            None => wgpu::LoadOp::Load,
        };

        let pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("fresco pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: color_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: load_color,
                    store: wgpu::StoreOp::Store,
                },
                depth_slice: None,
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: match clear_depth {
                        Some(d) => wgpu::LoadOp::Clear(d),
                        None => wgpu::LoadOp::Load,
                    },
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: Some(wgpu::Operations {
                    load: match clear_stencil {
                        Some(s) => wgpu::LoadOp::Clear(s as u32),
                        None => wgpu::LoadOp::Load,
                    },
                    store: wgpu::StoreOp::Store,
                }),
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });
        Ok(pass.forget_lifetime())
    }

    fn replay(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        frame_texture: &wgpu::Texture,
        frame_view: &wgpu::TextureView,
    ) -> Result<()> {
        let mut pass: Option<wgpu::RenderPass<'static>> = None;

        for op in &self.ops {
            match op {
                FrameOp::BeginPass {
                    target,
                    clear_color,
                    clear_depth,
                    clear_stencil,
                } => {
                    pass = None;
                    pass = Some(self.begin_pass(
                        encoder,
                        frame_view,
                        *target,
                        *clear_color,
                        *clear_depth,
                        *clear_stencil,
                    )?);
                }
                FrameOp::Draw(cmd) => {
                    if pass.is_none() {
                        pass =
                            Some(self.begin_pass(encoder, frame_view, cmd.target, None, None, None)?);
                    }
                    let Some(p) = pass.as_mut() else { continue };

                    let (tw, th) = self.target_extent(cmd.target)?;
                    p.set_pipeline(&cmd.pipeline);
                    if let Some(group) = &cmd.main_group {
                        p.set_bind_group(0, group, &[]);
                    }
                    if let Some(group) = &cmd.sampler_group {
                        p.set_bind_group(1, group, &[]);
                    }
                    p.set_vertex_buffer(0, cmd.vertex.slice(0..cmd.vertex_len));

                    match cmd.viewport {
                        Some(v) => p.set_viewport(
                            v.position.x,
                            v.position.y,
                            v.size.x,
                            v.size.y,
                            v.min_depth,
                            v.max_depth,
                        ),
                        None => p.set_viewport(0.0, 0.0, tw as f32, th as f32, 0.0, 1.0),
                    }
                    match cmd.scissor {
                        Some(s) => {
                            let x = (s.position.x.max(0.0) as u32).min(tw);
                            let y = (s.position.y.max(0.0) as u32).min(th);
                            let w = (s.size.x.max(0.0) as u32).min(tw - x);
                            let h = (s.size.y.max(0.0) as u32).min(th - y);
                            p.set_scissor_rect(x, y, w, h);
                        }
                        None => p.set_scissor_rect(0, 0, tw, th),
                    }
                    p.set_stencil_reference(cmd.stencil_reference);

                    match cmd.kind {
                        DrawKind::Plain { count, first } => {
                            p.draw(first..first + count, 0..1);
                        }
                        DrawKind::Indexed { count, first } => {
                            let (buffer, format, len) = match &cmd.index {
                                Some(i) => i,
                                None => {
                                    return Err(GfxError::MissingDrawState("index buffer"))
                                }
                            };
                            p.set_index_buffer(buffer.slice(0..*len), *format);
                            p.draw_indexed(first..first + count, 0, 0..1);
                        }
                    }
                }
                FrameOp::ReadPixels {
                    position,
                    size,
                    dst,
                    target,
                } => {
                    pass = None;
                    self.record_read_pixels(
                        encoder,
                        frame_texture,
                        *position,
                        *size,
                        *dst,
                        *target,
                    )?;
                }
            }
        }

        drop(pass);
        Ok(())
    }

    fn record_read_pixels(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        frame_texture: &wgpu::Texture,
        position: IVec2,
        size: IVec2,
        dst: TextureHandle,
        target: Option<RenderTargetHandle>,
    ) -> Result<()> {
        let (src_texture, src_w, src_h) = match target {
            None => {
                if !self.backbuffer_readable {
                    log::warn!("backbuffer does not support readback on this surface, skipping");
                    return Ok(());
                }
                (frame_texture, self.config.width, self.config.height)
            }
            Some(rt) => {
                let rt = self
                    .render_targets
                    .get_ref(Handle::from_raw(rt.raw()))
                    .ok_or(GfxError::StaleHandle("render target"))?;
                let color = self
                    .textures
                    .get_ref(rt.color)
                    .ok_or(GfxError::StaleHandle("render target texture"))?;
                (&color.texture, color.width, color.height)
            }
        };

        let dst_tex = self
            .textures
            .get_ref(Handle::from_raw(dst.raw()))
            .ok_or(GfxError::StaleHandle("texture"))?;

        let x = position.x.max(0) as u32;
        let y = position.y.max(0) as u32;
        if x >= src_w || y >= src_h || size.x <= 0 || size.y <= 0 {
            return Ok(());
        }
        let w = (size.x as u32).min(src_w - x).min(dst_tex.width);
        let h = (size.y as u32).min(src_h - y).min(dst_tex.height);
        if w == 0 || h == 0 {
            return Ok(());
        }

        let extent = wgpu::Extent3d {
            width: w,
            height: h,
            depth_or_array_layers: 1,
        };
        let src_copy = wgpu::TexelCopyTextureInfo {
            texture: src_texture,
            mip_level: 0,
            origin: wgpu::Origin3d { x, y, z: 0 },
            aspect: wgpu::TextureAspect::All,
        };
        let dst_copy = wgpu::TexelCopyTextureInfo {
            texture: &dst_tex.texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        };

        if src_texture.format() == dst_tex.texture.format() {
            encoder.copy_texture_to_texture(src_copy, dst_copy, extent);
        } else {
            // Image copies demand matching formats, and the surface
            // format is not always RGBA8. Buffer copies only care about
            // texel size, so bounce the rectangle through one.
            let padded = (w * 4).next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
            let bounce = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("fresco pixel bounce"),
                size: (padded * h) as u64,
                usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let layout = wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded),
                rows_per_image: Some(h),
            };
            encoder.copy_texture_to_buffer(
                src_copy,
                wgpu::TexelCopyBufferInfo {
                    buffer: &bounce,
                    layout,
                },
                extent,
            );
            encoder.copy_buffer_to_texture(
                wgpu::TexelCopyBufferInfo {
                    buffer: &bounce,
                    layout,
                },
                dst_copy,
                extent,
            );
        }
        Ok(())
    }
}

impl Backend for WgpuEngine {
    fn backend_type(&self) -> BackendType {
        BackendType::WebGpu
    }

    fn set_topology(&mut self, topology: Topology) {
        self.state.topology = topology;
    }

    fn set_viewport(&mut self, viewport: Option<Viewport>) {
        self.state.viewport = viewport;
    }

    fn set_scissor(&mut self, scissor: Option<Scissor>) {
        self.state.scissor = scissor;
    }

    fn set_blend_mode(&mut self, blend: Option<BlendMode>) {
        self.state.blend = blend;
    }

    fn set_depth_mode(&mut self, depth: Option<DepthMode>) {
        self.state.depth = depth;
    }

    fn set_stencil_mode(&mut self, stencil: Option<StencilMode>) {
        self.state.stencil = stencil;
    }

    fn set_cull_mode(&mut self, cull: CullMode) {
        self.state.cull = cull;
    }

    fn set_sampler(&mut self, sampler: Sampler) {
        self.state.sampler = sampler;
    }

    fn set_texture_address(&mut self, address: TextureAddress) {
        self.state.address = address;
    }

    fn set_shader(&mut self, shader: ShaderHandle) {
        self.state.shader = Some(shader);
    }

    fn set_vertex_buffer(&mut self, view: BufferView<'_>) -> Result<()> {
        self.vertex = Some(self.upload(view.data)?);
        Ok(())
    }

    fn set_index_buffer(&mut self, view: BufferView<'_>) -> Result<()> {
        let format = match view.stride {
            2 => wgpu::IndexFormat::Uint16,
            4 => wgpu::IndexFormat::Uint32,
            _ => {
                return Err(GfxError::InvalidArgument(
                    "index buffer stride must be 2 or 4 bytes",
                ))
            }
        };
        let (buffer, len) = self.upload(view.data)?;
        self.index = Some((buffer, format, len));
        Ok(())
    }

    fn set_uniform_buffer(&mut self, binding: u32, data: &[u8]) -> Result<()> {
        let slice = self.upload(data)?;
        self.bindings.set_buffer(binding, slice);
        Ok(())
    }

    fn set_texture(&mut self, binding: u32, texture: TextureHandle) -> Result<()> {
        if self
            .textures
            .get_ref(Handle::from_raw(texture.raw()))
            .is_none()
        {
            return Err(GfxError::StaleHandle("texture"));
        }
        self.bindings.set_image(binding, texture);
        Ok(())
    }

    fn set_render_target(&mut self, target: Option<RenderTargetHandle>) -> Result<()> {
        if let Some(rt) = target {
            if self
                .render_targets
                .get_ref(Handle::from_raw(rt.raw()))
                .is_none()
            {
                return Err(GfxError::StaleHandle("render target"));
            }
        }
        if self.state.target == target {
            return Ok(());
        }
        self.state.target = target;
        self.ops.push(FrameOp::BeginPass {
            target,
            clear_color: None,
            clear_depth: None,
            clear_stencil: None,
        });
        Ok(())
    }

    fn clear(
        &mut self,
        color: Option<Vec4>,
        depth: Option<f32>,
        stencil: Option<u8>,
    ) -> Result<()> {
        self.ops.push(FrameOp::BeginPass {
            target: self.state.target,
            clear_color: color,
            clear_depth: depth,
            clear_stencil: stencil,
        });
        Ok(())
    }

    fn draw(&mut self, vertex_count: u32, first_vertex: u32) -> Result<()> {
        self.record_draw(
            DrawKind::Plain {
                count: vertex_count,
                first: first_vertex,
            },
            false,
        )
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32) -> Result<()> {
        self.record_draw(
            DrawKind::Indexed {
                count: index_count,
                first: first_index,
            },
            true,
        )
    }

    fn read_pixels(&mut self, position: IVec2, size: IVec2, dst: TextureHandle) -> Result<()> {
        if self
            .textures
            .get_ref(Handle::from_raw(dst.raw()))
            .is_none()
        {
            return Err(GfxError::StaleHandle("texture"));
        }
        self.ops.push(FrameOp::ReadPixels {
            position,
            size,
            dst,
            target: self.state.target,
        });
        Ok(())
    }

    fn read_texture(&mut self, texture: TextureHandle) -> Result<Vec<u8>> {
        let tex = self
            .textures
            .get_ref(Handle::from_raw(texture.raw()))
            .ok_or(GfxError::StaleHandle("texture"))?;
        let (width, height) = (tex.width, tex.height);
        let row = width * 4;
        let padded = row.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);

        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("fresco readback buffer"),
            size: (padded * height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("fresco readback encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &tex.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| GfxError::ResourceCreation(err.to_string()))?;
        receiver
            .recv()
            .map_err(|_| GfxError::ResourceCreation("readback map lost".to_string()))?
            .map_err(|err| GfxError::ResourceCreation(err.to_string()))?;

        let mapped = slice.get_mapped_range();
        let mut out = vec![0u8; (row * height) as usize];
        for y in 0..height as usize {
            let src = y * padded as usize;
            let dst = y * row as usize;
            out[dst..dst + row as usize].copy_from_slice(&mapped[src..src + row as usize]);
        }
        drop(mapped);
        readback.unmap();
        Ok(out)
    }

    fn present(&mut self) -> Result<()> {
        let frame = match self.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Outdated) | Err(wgpu::SurfaceError::Lost) => {
                self.surface.configure(&self.device, &self.config);
                self.surface
                    .get_current_texture()
                    .map_err(|e| GfxError::ResourceCreation(e.to_string()))?
            }
            Err(err) => return Err(GfxError::ResourceCreation(err.to_string())),
        };
        let frame_view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("fresco frame encoder"),
            });

        let replayed = self.replay(&mut encoder, &frame.texture, &frame_view);

        self.ops.clear();
        self.vertex = None;
        self.index = None;
        self.bindings.buffers.clear();
        self.streams.begin_frame();
        replayed?;

        self.queue.submit(std::iter::once(encoder.finish()));
        frame.present();
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.config.width = width.max(1);
        self.config.height = height.max(1);
        self.surface.configure(&self.device, &self.config);
        self.depth_view = build_depth_view(&self.device, self.config.width, self.config.height);
        Ok(())
    }

    fn set_vsync(&mut self, enabled: bool) -> Result<()> {
        self.config.present_mode = if enabled {
            wgpu::PresentMode::AutoVsync
        } else {
            wgpu::PresentMode::AutoNoVsync
        };
        self.surface.configure(&self.device, &self.config);
        Ok(())
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        channels: u32,
        pixels: Option<&[u8]>,
        mipmap: bool,
    ) -> Result<TextureHandle> {
        if width == 0 || height == 0 {
            return Err(GfxError::InvalidArgument("texture extent must be nonzero"));
        }
        if !matches!(channels, 3 | 4) {
            return Err(GfxError::InvalidArgument(
                "texture channel count must be 3 or 4",
            ));
        }
        if let Some(pixels) = pixels {
            if pixels.len() != (width * height * channels) as usize {
                return Err(GfxError::InvalidArgument(
                    "pixel data must be width * height * channels bytes",
                ));
            }
        }
        if mipmap {
            log::debug!("mipmap generation is not implemented on the wgpu engine");
        }

        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("fresco texture"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        if let Some(pixels) = pixels {
            let expanded;
            let pixels = if channels == 3 {
                expanded = expand_rgb_to_rgba(pixels);
                expanded.as_slice()
            } else {
                pixels
            };
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                pixels,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(width * 4),
                    rows_per_image: Some(height),
                },
                size,
            );
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let handle = self
            .textures
            .insert(WgTexture {
                texture,
                view,
                width,
                height,
            })
            .ok_or(GfxError::ResourceCreation("texture pool full".to_string()))?;
        Ok(TextureHandle(handle.into_raw()))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) -> Result<()> {
        self.textures
            .release(Handle::from_raw(texture.raw()))
            .ok_or(GfxError::StaleHandle("texture"))?;
        Ok(())
    }

    fn create_render_target(&mut self, width: u32, height: u32) -> Result<RenderTargetHandle> {
        if width == 0 || height == 0 {
            return Err(GfxError::InvalidArgument(
                "render target extent must be nonzero",
            ));
        }

        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        // Color matches the surface format so one pipeline serves both
        // onscreen and offscreen passes.
        let color = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("fresco render target color"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.config.format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = color.create_view(&wgpu::TextureViewDescriptor::default());
        let color_handle = self
            .textures
            .insert(WgTexture {
                texture: color,
                view,
                width,
                height,
            })
            .ok_or(GfxError::ResourceCreation("texture pool full".to_string()))?;

        let depth_view = build_depth_view(&self.device, width, height);
        let handle = self
            .render_targets
            .insert(WgRenderTarget {
                color: color_handle,
                depth_view,
                width,
                height,
            })
            .ok_or_else(|| {
                GfxError::ResourceCreation("render target pool full".to_string())
            })?;
        Ok(RenderTargetHandle(handle.into_raw()))
    }

    fn render_target_texture(&self, target: RenderTargetHandle) -> Result<TextureHandle> {
        let rt = self
            .render_targets
            .get_ref(Handle::from_raw(target.raw()))
            .ok_or(GfxError::StaleHandle("render target"))?;
        Ok(TextureHandle(rt.color.into_raw()))
    }

    fn destroy_render_target(&mut self, target: RenderTargetHandle) -> Result<()> {
        let rt = self
            .render_targets
            .release(Handle::from_raw(target.raw()))
            .ok_or(GfxError::StaleHandle("render target"))?;
        self.textures
            .release(rt.color)
            .ok_or(GfxError::StaleHandle("render target texture"))?;
        Ok(())
    }

    fn create_shader(
        &mut self,
        layout: &VertexLayout,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<ShaderHandle> {
        let compiled: CompiledShader = crate::shader::compile(
            layout,
            vertex_source,
            fragment_source,
            &[("FLIP_TEXCOORD_Y", None)],
        )?;

        let vertex = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("fresco vertex shader"),
                source: wgpu::ShaderSource::SpirV(Cow::Owned(compiled.vertex_spirv)),
            });
        let fragment = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("fresco fragment shader"),
                source: wgpu::ShaderSource::SpirV(Cow::Owned(compiled.fragment_spirv)),
            });

        let mut main_entries = Vec::new();
        let mut sampler_entries = Vec::new();
        for binding in &compiled.bindings {
            match binding.kind {
                BindingKind::UniformBuffer => main_entries.push(wgpu::BindGroupLayoutEntry {
                    binding: binding.binding,
                    visibility: binding.stages.into(),
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }),
                BindingKind::CombinedImageSampler => {
                    main_entries.push(wgpu::BindGroupLayoutEntry {
                        binding: binding.binding,
                        visibility: binding.stages.into(),
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    });
                    sampler_entries.push(wgpu::BindGroupLayoutEntry {
                        binding: binding.binding,
                        visibility: binding.stages.into(),
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    });
                }
            }
        }

        let main_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("fresco shader bindings"),
                    entries: &main_entries,
                });
        let sampler_group_layout = if sampler_entries.is_empty() {
            None
        } else {
            Some(
                self.device
                    .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                        label: Some("fresco shader samplers"),
                        entries: &sampler_entries,
                    }),
            )
        };

        let mut group_layouts = vec![&main_group_layout];
        if let Some(layout) = &sampler_group_layout {
            group_layouts.push(layout);
        }
        let pipeline_layout =
            self.device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some("fresco pipeline layout"),
                    bind_group_layouts: &group_layouts,
                    immediate_size: 0,
                });

        let id = self.next_shader_id;
        self.next_shader_id += 1;

        let handle = self
            .shaders
            .insert(WgShader {
                id,
                vertex,
                fragment,
                bindings: compiled.bindings,
                layout: compiled.layout,
                main_group_layout,
                sampler_group_layout,
                pipeline_layout,
            })
            .ok_or(GfxError::ResourceCreation("shader pool full".to_string()))?;
        Ok(ShaderHandle(handle.into_raw()))
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) -> Result<()> {
        let sh = self
            .shaders
            .release(Handle::from_raw(shader.raw()))
            .ok_or(GfxError::StaleHandle("shader"))?;
        // Evicted pipelines drop here; wgpu reclaims them internally.
        drop(self.pipelines.evict_shader(sh.id));
        Ok(())
    }
}

fn build_depth_view(device: &wgpu::Device, width: u32, height: u32) -> wgpu::TextureView {
    let depth = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("fresco depth buffer"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    depth.create_view(&wgpu::TextureViewDescriptor::default())
}

fn build_pipeline(
    device: &wgpu::Device,
    shader: &WgShader,
    key: &PipelineKey,
    color_format: wgpu::TextureFormat,
) -> Result<wgpu::RenderPipeline> {
    let attributes = shader
        .layout
        .attributes
        .iter()
        .enumerate()
        .map(|(location, attr)| {
            Ok(wgpu::VertexAttribute {
                format: vertex_format(attr.format)?,
                offset: attr.offset as u64,
                shader_location: location as u32,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let vertex_layout = wgpu::VertexBufferLayout {
        array_stride: shader.layout.stride as u64,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &attributes,
    };

    let state = &key.state;
    let depth_mode = state.depth.unwrap_or_default();
    let stencil_mode = state.stencil.unwrap_or_default();
    let depth_stencil = wgpu::DepthStencilState {
        format: DEPTH_FORMAT,
        depth_write_enabled: depth_mode.enabled,
        depth_compare: if depth_mode.enabled {
            depth_mode.func.into()
        } else {
            wgpu::CompareFunction::Always
        },
        stencil: wgpu::StencilState {
            front: stencil_mode.into(),
            back: stencil_mode.into(),
            read_mask: stencil_mode.read_mask as u32,
            write_mask: stencil_mode.write_mask as u32,
        },
        bias: wgpu::DepthBiasState::default(),
    };

    Ok(device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("fresco pipeline"),
        layout: Some(&shader.pipeline_layout),
        vertex: wgpu::VertexState {
            module: &shader.vertex,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            buffers: &[vertex_layout],
        },
        fragment: Some(wgpu::FragmentState {
            module: &shader.fragment,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format: color_format,
                blend: state.blend.map(Into::into),
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        primitive: wgpu::PrimitiveState {
            topology: state.topology.into(),
            strip_index_format: key.strip_index,
            front_face: wgpu::FrontFace::Cw,
            cull_mode: state.cull_mode.into(),
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: Some(depth_stencil),
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    }))
}
