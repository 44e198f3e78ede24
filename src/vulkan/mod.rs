//! Vulkan engine, built on dynamic rendering (core 1.3) and
//! `VK_KHR_push_descriptor`.
//!
//! All draw state is buffered on the CPU and resolved at draw time:
//! fixed-function toggles that Vulkan 1.3 can set dynamically are set
//! per draw, the rest (blend equation, topology class) is folded into
//! the pipeline cache key. Transient vertex/index/uniform data lives in
//! grow-only per-frame buffer pools, so a steady-state frame allocates
//! nothing.
//!
//! Passes record into secondary command buffers, so the swapchain image
//! is acquired only at `present`, right before the recorded segments
//! are replayed into the frame's primary buffer and submitted.

mod convert;

use std::collections::HashMap;
use std::mem::ManuallyDrop;

use ash::vk;
use glam::{IVec2, Vec4};
use vk_mem::Alloc;

use crate::backend::{
    expand_rgb_to_rgba, Backend, BackendType, BindingQueues, RenderTargetHandle, ShaderHandle,
    TextureHandle, WindowSurface,
};
use crate::cache::{PipelineCache, ShaderId, ShaderKeyed};
use crate::error::{GfxError, Result};
use crate::frame::FrameRing;
use crate::shader::{BindingKind, CompiledShader, MergedBinding};
use crate::stream::StreamPool;
use crate::types::{
    BlendMode, BufferView, CullMode, DepthMode, Sampler, Scissor, StencilMode, TextureAddress,
    Topology, Viewport,
};
use crate::utils::{Handle, Pool};
use crate::vertex::VertexLayout;

use convert::topology_class;

const MIN_SWAPCHAIN_IMAGES: u32 = 2;
const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT_S8_UINT;
const STREAM_MIN_BLOCK: usize = 64 * 1024;

struct VkTexture {
    image: vk::Image,
    alloc: vk_mem::Allocation,
    view: vk::ImageView,
    width: u32,
    height: u32,
    mip_levels: u32,
    layout: vk::ImageLayout,
}

struct VkRenderTarget {
    color: Handle<VkTexture>,
    depth_image: vk::Image,
    depth_alloc: vk_mem::Allocation,
    depth_view: vk::ImageView,
    width: u32,
    height: u32,
}

struct VkShader {
    id: ShaderId,
    vertex: vk::ShaderModule,
    fragment: vk::ShaderModule,
    bindings: Vec<MergedBinding>,
    layout: VertexLayout,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    shader: ShaderId,
    blend: Option<BlendMode>,
    topology_class: vk::PrimitiveTopology,
}

impl ShaderKeyed for PipelineKey {
    fn shader_id(&self) -> ShaderId {
        self.shader
    }
}

struct StreamBuffer {
    buf: vk::Buffer,
    alloc: vk_mem::Allocation,
}

#[derive(Clone, Copy)]
struct StreamSlice {
    buffer: vk::Buffer,
    size: u64,
}

struct FrameSet {
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    secondaries: Vec<vk::CommandBuffer>,
    fence: vk::Fence,
    acquire: vk::Semaphore,
    render_done: vk::Semaphore,
    streams: StreamPool<StreamBuffer>,
    submitted: bool,
}

struct SwapchainBundle {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    layouts: Vec<vk::ImageLayout>,
    format: vk::Format,
    extent: vk::Extent2D,
}

struct DepthBuffer {
    image: vk::Image,
    alloc: vk_mem::Allocation,
    view: vk::ImageView,
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

/// One piece of a frame, replayed into the primary command buffer at
/// `present` once the swapchain image is known.
enum FramePart {
    Pass {
        cmd: vk::CommandBuffer,
        target: Option<RenderTargetHandle>,
    },
    ReadPixels {
        position: IVec2,
        size: IVec2,
        dst: TextureHandle,
        target: Option<RenderTargetHandle>,
    },
}

pub struct VulkanEngine {
    entry: ash::Entry,
    instance: ash::Instance,
    pdevice: vk::PhysicalDevice,
    device: ash::Device,
    allocator: ManuallyDrop<vk_mem::Allocator>,
    queue: vk::Queue,
    queue_family: u32,
    surface_loader: ash::extensions::khr::Surface,
    swapchain_loader: ash::extensions::khr::Swapchain,
    push_descriptor: ash::extensions::khr::PushDescriptor,
    surface: vk::SurfaceKHR,
    swapchain: SwapchainBundle,
    depth: DepthBuffer,
    frames: FrameRing<FrameSet>,
    oneshot_pool: vk::CommandPool,
    oneshot_fence: vk::Fence,

    textures: Pool<VkTexture>,
    render_targets: Pool<VkRenderTarget>,
    shaders: Pool<VkShader>,
    pipelines: PipelineCache<PipelineKey, vk::Pipeline>,
    next_shader_id: ShaderId,
    samplers: HashMap<(Sampler, TextureAddress), vk::Sampler>,

    state: DrawState,
    vertex: Option<StreamSlice>,
    index: Option<(StreamSlice, vk::IndexType)>,
    bindings: BindingQueues<TextureHandle, StreamSlice>,
    recording: bool,
    parts: Vec<FramePart>,
    // The pass segment currently accepting commands, if any.
    open: Option<(vk::CommandBuffer, Option<RenderTargetHandle>)>,
    vsync: bool,
    window_size: (u32, u32),
}

impl VulkanEngine {
    pub fn new(window: WindowSurface) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }?;

        let app_name = c"fresco";
        let app_info = vk::ApplicationInfo::builder()
            .application_name(app_name)
            .engine_name(app_name)
            .api_version(vk::API_VERSION_1_3);

        let mut inst_exts = vec![ash::extensions::khr::Surface::name().as_ptr()];
        #[cfg(target_os = "windows")]
        inst_exts.push(ash::extensions::khr::Win32Surface::name().as_ptr());
        #[cfg(target_os = "linux")]
        {
            inst_exts.push(ash::extensions::khr::XlibSurface::name().as_ptr());
            inst_exts.push(ash::extensions::khr::WaylandSurface::name().as_ptr());
        }

        let instance = unsafe {
            entry.create_instance(
                &vk::InstanceCreateInfo::builder()
                    .application_info(&app_info)
                    .enabled_extension_names(&inst_exts)
                    .build(),
                None,
            )
        }?;

        let surface = create_surface(&entry, &instance, &window)?;
        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);

        let (pdevice, queue_family) =
            pick_device(&instance, &surface_loader, surface).ok_or(GfxError::NoSuitableAdapter)?;

        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)
            .build()];

        let device_exts = [
            ash::extensions::khr::Swapchain::name().as_ptr(),
            ash::extensions::khr::PushDescriptor::name().as_ptr(),
        ];

        let mut vk13 = vk::PhysicalDeviceVulkan13Features::builder().dynamic_rendering(true);
        let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut vk13);

        let device = unsafe {
            instance.create_device(
                pdevice,
                &vk::DeviceCreateInfo::builder()
                    .queue_create_infos(&queue_infos)
                    .enabled_extension_names(&device_exts)
                    .push_next(&mut features2),
                None,
            )
        }?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let allocator = vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(
            &instance, &device, pdevice,
        ))?;

        let swapchain_loader = ash::extensions::khr::Swapchain::new(&instance, &device);
        let push_descriptor = ash::extensions::khr::PushDescriptor::new(&instance, &device);

        let swapchain = build_swapchain(
            &swapchain_loader,
            &surface_loader,
            &device,
            pdevice,
            surface,
            window.width,
            window.height,
            true,
        )?;
        let depth = build_depth_buffer(&device, &allocator, swapchain.extent)?;

        // One frame set per swapchain image keeps every image's work on
        // its own fence and semaphores.
        let mut frames = Vec::with_capacity(swapchain.images.len());
        for _ in 0..swapchain.images.len() {
            frames.push(build_frame_set(&device, queue_family)?);
        }

        let oneshot_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(queue_family)
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT),
                None,
            )
        }?;
        let oneshot_fence =
            unsafe { device.create_fence(&vk::FenceCreateInfo::builder(), None) }?;

        log::info!(
            "vulkan engine up: {}x{} swapchain, {} frames in flight",
            swapchain.extent.width,
            swapchain.extent.height,
            frames.len()
        );

        Ok(Self {
            entry,
            instance,
            pdevice,
            device,
            allocator: ManuallyDrop::new(allocator),
            queue,
            queue_family,
            surface_loader,
            swapchain_loader,
            push_descriptor,
            surface,
            swapchain,
            depth,
            frames: FrameRing::new(frames),
            oneshot_pool,
            oneshot_fence,
            textures: Pool::default(),
            render_targets: Pool::default(),
            shaders: Pool::default(),
            pipelines: PipelineCache::default(),
            next_shader_id: 1,
            samplers: HashMap::new(),
            state: DrawState::default(),
            vertex: None,
            index: None,
            bindings: BindingQueues::default(),
            recording: false,
            parts: Vec::new(),
            open: None,
            vsync: true,
            window_size: (window.width, window.height),
        })
    }

    fn ensure_frame(&mut self) -> Result<()> {
        if self.recording {
            return Ok(());
        }

        let frame = self.frames.current_mut();
        if frame.submitted {
            unsafe {
                self.device
                    .wait_for_fences(&[frame.fence], true, u64::MAX)?
            };
            frame.submitted = false;
        }
        if !frame.secondaries.is_empty() {
            unsafe {
                self.device
                    .free_command_buffers(frame.pool, &frame.secondaries)
            };
            frame.secondaries.clear();
        }
        unsafe {
            self.device
                .reset_command_pool(frame.pool, vk::CommandPoolResetFlags::empty())?
        };
        frame.streams.begin_frame();

        // Slices uploaded last frame point into rewound pools.
        self.vertex = None;
        self.index = None;
        self.bindings.buffers.clear();

        self.parts.clear();
        self.open = None;
        self.recording = true;
        Ok(())
    }

    /// Opens (or re-opens) a pass segment on the buffered target.
    ///
    /// Segments record into secondary command buffers so no swapchain
    /// image needs to be acquired while the caller is still drawing;
    /// attachment views and barriers are resolved during replay at
    /// `present`, once the image is known.
    fn ensure_scope(&mut self) -> Result<()> {
        self.ensure_frame()?;
        let target = self.state.target;
        if let Some((_, open_target)) = self.open {
            if open_target == target {
                return Ok(());
            }
        }
        if let Some(rt) = target {
            if self
                .render_targets
                .get_ref(Handle::from_raw(rt.raw()))
                .is_none()
            {
                return Err(GfxError::StaleHandle("render target"));
            }
        }
        self.close_scope()?;

        let frame = self.frames.current_mut();
        let cmd = unsafe {
            self.device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(frame.pool)
                    .level(vk::CommandBufferLevel::SECONDARY)
                    .command_buffer_count(1),
            )
        }?[0];
        frame.secondaries.push(cmd);

        // Offscreen targets share the swapchain's color format, so one
        // inheritance info covers every pass.
        let color_formats = [self.swapchain.format];
        let mut rendering = vk::CommandBufferInheritanceRenderingInfo::builder()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(DEPTH_FORMAT)
            .stencil_attachment_format(DEPTH_FORMAT)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let inheritance = vk::CommandBufferInheritanceInfo::builder().push_next(&mut rendering);
        unsafe {
            self.device.begin_command_buffer(
                cmd,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(
                        vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                            | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
                    )
                    .inheritance_info(&inheritance),
            )?
        };

        self.parts.push(FramePart::Pass { cmd, target });
        self.open = Some((cmd, target));
        Ok(())
    }

    fn close_scope(&mut self) -> Result<()> {
        if let Some((cmd, _)) = self.open.take() {
            unsafe { self.device.end_command_buffer(cmd)? };
        }
        Ok(())
    }

    /// Replays one recorded pass segment into the primary command
    /// buffer, wrapped in its own dynamic-rendering scope with the
    /// barriers its attachments need.
    fn replay_pass(
        &mut self,
        primary: vk::CommandBuffer,
        image_index: usize,
        pass: vk::CommandBuffer,
        target: Option<RenderTargetHandle>,
    ) -> Result<()> {
        let (color_view, depth_view, extent) = match target {
            None => {
                // First use of the backbuffer this frame transitions it
                // out of whatever the last present left behind.
                let old = self.swapchain.layouts[image_index];
                if old != vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
                    image_barrier(
                        &self.device,
                        primary,
                        self.swapchain.images[image_index],
                        vk::ImageAspectFlags::COLOR,
                        old,
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        1,
                    );
                    self.swapchain.layouts[image_index] =
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
                }
                (
                    self.swapchain.views[image_index],
                    self.depth.view,
                    self.swapchain.extent,
                )
            }
            Some(rt) => {
                let rt = self
                    .render_targets
                    .get_ref(Handle::from_raw(rt.raw()))
                    .ok_or(GfxError::StaleHandle("render target"))?;
                let color_handle = rt.color;
                let depth_view = rt.depth_view;
                let extent = vk::Extent2D {
                    width: rt.width,
                    height: rt.height,
                };
                let color = self
                    .textures
                    .get_mut_ref(color_handle)
                    .ok_or(GfxError::StaleHandle("render target texture"))?;
                if color.layout != vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
                    image_barrier(
                        &self.device,
                        primary,
                        color.image,
                        vk::ImageAspectFlags::COLOR,
                        color.layout,
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        color.mip_levels,
                    );
                    color.layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
                }
                (color.view, depth_view, extent)
            }
        };

        let color_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)
            .build();
        let depth_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(depth_view)
            .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)
            .build();

        unsafe {
            self.device.cmd_begin_rendering(
                primary,
                &vk::RenderingInfo::builder()
                    .flags(vk::RenderingFlags::CONTENTS_SECONDARY_COMMAND_BUFFERS)
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent,
                    })
                    .layer_count(1)
                    .color_attachments(std::slice::from_ref(&color_attachment))
                    .depth_attachment(&depth_attachment)
                    .stencil_attachment(&depth_attachment),
            );
            self.device.cmd_execute_commands(primary, &[pass]);
            self.device.cmd_end_rendering(primary);
        }

        // A finished offscreen pass leaves its color texture sampleable.
        if let Some(rt) = target {
            if let Some(rt) = self.render_targets.get_ref(Handle::from_raw(rt.raw())) {
                let color = rt.color;
                if let Some(tex) = self.textures.get_mut_ref(color) {
                    image_barrier(
                        &self.device,
                        primary,
                        tex.image,
                        vk::ImageAspectFlags::COLOR,
                        tex.layout,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        tex.mip_levels,
                    );
                    tex.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
                }
            }
        }
        Ok(())
    }

    /// Drops whatever has been recorded for the current frame without
    /// submitting it. Used around swapchain rebuilds.
    fn abandon_frame(&mut self) {
        self.parts.clear();
        self.open = None;
        self.recording = false;
    }

    /// Records a deferred pixel copy into the primary command buffer.
    fn record_read_pixels(
        &mut self,
        cmd: vk::CommandBuffer,
        image_index: usize,
        position: IVec2,
        size: IVec2,
        dst: TextureHandle,
        target: Option<RenderTargetHandle>,
    ) -> Result<()> {
        let (src_image, src_w, src_h, src_layout) = match target {
            None => (
                self.swapchain.images[image_index],
                self.swapchain.extent.width,
                self.swapchain.extent.height,
                self.swapchain.layouts[image_index],
            ),
            Some(rt) => {
                let rt = self
                    .render_targets
                    .get_ref(Handle::from_raw(rt.raw()))
                    .ok_or(GfxError::StaleHandle("render target"))?;
                let color = self
                    .textures
                    .get_ref(rt.color)
                    .ok_or(GfxError::StaleHandle("render target texture"))?;
                (color.image, color.width, color.height, color.layout)
            }
        };

        let dst_handle: Handle<VkTexture> = Handle::from_raw(dst.raw());
        let (dst_image, dst_w, dst_h, dst_layout, dst_mips) = {
            let tex = self
                .textures
                .get_ref(dst_handle)
                .ok_or(GfxError::StaleHandle("texture"))?;
            (tex.image, tex.width, tex.height, tex.layout, tex.mip_levels)
        };

        // Clamp the rectangle against both surfaces.
        let x = position.x.max(0) as u32;
        let y = position.y.max(0) as u32;
        if x >= src_w || y >= src_h || size.x <= 0 || size.y <= 0 {
            return Ok(());
        }
        let w = (size.x as u32).min(src_w - x).min(dst_w);
        let h = (size.y as u32).min(src_h - y).min(dst_h);
        if w == 0 || h == 0 {
            return Ok(());
        }

        image_barrier(
            &self.device,
            cmd,
            src_image,
            vk::ImageAspectFlags::COLOR,
            src_layout,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            1,
        );
        image_barrier(
            &self.device,
            cmd,
            dst_image,
            vk::ImageAspectFlags::COLOR,
            dst_layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            dst_mips,
        );

        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageCopy {
            src_subresource: subresource,
            src_offset: vk::Offset3D {
                x: x as i32,
                y: y as i32,
                z: 0,
            },
            dst_subresource: subresource,
            dst_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            extent: vk::Extent3D {
                width: w,
                height: h,
                depth: 1,
            },
        };
        unsafe {
            self.device.cmd_copy_image(
                cmd,
                src_image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            )
        };

        // Restore layouts so rendering and sampling continue unchanged.
        let src_restore = match target {
            None => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Some(_) => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        image_barrier(
            &self.device,
            cmd,
            src_image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            src_restore,
            1,
        );
        image_barrier(
            &self.device,
            cmd,
            dst_image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            dst_mips,
        );

        match target {
            None => self.swapchain.layouts[image_index] = src_restore,
            Some(rt) => {
                if let Some(rt) = self.render_targets.get_ref(Handle::from_raw(rt.raw())) {
                    let color = rt.color;
                    if let Some(tex) = self.textures.get_mut_ref(color) {
                        tex.layout = src_restore;
                    }
                }
            }
        }
        if let Some(tex) = self.textures.get_mut_ref(dst_handle) {
            tex.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        }
        Ok(())
    }

    fn current_extent(&self) -> Result<vk::Extent2D> {
        match self.state.target {
            None => Ok(self.swapchain.extent),
            Some(rt) => {
                let rt = self
                    .render_targets
                    .get_ref(Handle::from_raw(rt.raw()))
                    .ok_or(GfxError::StaleHandle("render target"))?;
                Ok(vk::Extent2D {
                    width: rt.width,
                    height: rt.height,
                })
            }
        }
    }

    fn upload_stream(&mut self, data: &[u8]) -> Result<StreamSlice> {
        self.ensure_frame()?;
        let Self {
            ref allocator,
            ref mut frames,
            ..
        } = *self;
        let frame = frames.current_mut();

        let block = frame.streams.acquire(data.len(), |old, size| {
            if let Some(mut old) = old {
                unsafe { allocator.destroy_buffer(old.buf, &mut old.alloc) };
            }
            let (buf, alloc) = unsafe {
                allocator.create_buffer(
                    &vk::BufferCreateInfo::builder()
                        .size(size as u64)
                        .usage(
                            vk::BufferUsageFlags::VERTEX_BUFFER
                                | vk::BufferUsageFlags::INDEX_BUFFER
                                | vk::BufferUsageFlags::UNIFORM_BUFFER,
                        )
                        .sharing_mode(vk::SharingMode::EXCLUSIVE)
                        .build(),
                    &vk_mem::AllocationCreateInfo {
                        usage: vk_mem::MemoryUsage::AutoPreferHost,
                        flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
                        ..Default::default()
                    },
                )
            }?;
            Ok::<_, GfxError>(StreamBuffer { buf, alloc })
        })?;

        let mapped = unsafe { allocator.map_memory(&mut block.alloc) }?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped, data.len());
            allocator.unmap_memory(&mut block.alloc);
        }

        Ok(StreamSlice {
            buffer: block.buf,
            size: data.len() as u64,
        })
    }

    fn sampler(&mut self, filter: Sampler, address: TextureAddress) -> Result<vk::Sampler> {
        if let Some(s) = self.samplers.get(&(filter, address)) {
            return Ok(*s);
        }
        let mipmap_mode = match filter {
            Sampler::Linear => vk::SamplerMipmapMode::LINEAR,
            Sampler::Nearest => vk::SamplerMipmapMode::NEAREST,
        };
        let s = unsafe {
            self.device.create_sampler(
                &vk::SamplerCreateInfo::builder()
                    .mag_filter(filter.into())
                    .min_filter(filter.into())
                    .mipmap_mode(mipmap_mode)
                    .address_mode_u(address.into())
                    .address_mode_v(address.into())
                    .address_mode_w(address.into())
                    .max_lod(vk::LOD_CLAMP_NONE),
                None,
            )
        }?;
        self.samplers.insert((filter, address), s);
        Ok(s)
    }

    /// Resolves buffered state into pipeline binding, dynamic state, and
    /// descriptor pushes. Returns the command buffer to record the draw
    /// into.
    fn flush_draw_state(&mut self) -> Result<vk::CommandBuffer> {
        let shader_handle = self
            .state
            .shader
            .ok_or(GfxError::MissingDrawState("shader"))?;
        let sampler = self.sampler(self.state.sampler, self.state.address)?;
        self.ensure_scope()?;

        let extent = self.current_extent()?;
        let cmd = match self.open {
            Some((cmd, _)) => cmd,
            None => return Err(GfxError::MissingDrawState("active frame")),
        };

        let Self {
            ref device,
            ref mut pipelines,
            ref shaders,
            ref textures,
            ref swapchain,
            ref state,
            ref bindings,
            ..
        } = *self;

        let shader = shaders
            .get_ref(Handle::from_raw(shader_handle.raw()))
            .ok_or(GfxError::StaleHandle("shader"))?;

        let key = PipelineKey {
            shader: shader.id,
            blend: state.blend,
            topology_class: topology_class(state.topology),
        };
        let pipeline = *pipelines.get_or_try_insert(key, || {
            build_pipeline(device, shader, state.blend, key.topology_class, swapchain.format)
        })?;

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);

            // Viewport is flipped so the origin sits top-left, which also
            // flips the winding; CLOCKWISE front face restores it.
            let vp = match state.viewport {
                Some(v) => vk::Viewport {
                    x: v.position.x,
                    y: v.position.y + v.size.y,
                    width: v.size.x,
                    height: -v.size.y,
                    min_depth: v.min_depth,
                    max_depth: v.max_depth,
                },
                None => vk::Viewport {
                    x: 0.0,
                    y: extent.height as f32,
                    width: extent.width as f32,
                    height: -(extent.height as f32),
                    min_depth: 0.0,
                    max_depth: 1.0,
                },
            };
            device.cmd_set_viewport(cmd, 0, &[vp]);

            let sc = match state.scissor {
                Some(s) => vk::Rect2D {
                    offset: vk::Offset2D {
                        x: s.position.x as i32,
                        y: s.position.y as i32,
                    },
                    extent: vk::Extent2D {
                        width: s.size.x as u32,
                        height: s.size.y as u32,
                    },
                },
                None => vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                },
            };
            device.cmd_set_scissor(cmd, 0, &[sc]);

            device.cmd_set_primitive_topology(cmd, state.topology.into());
            device.cmd_set_cull_mode(cmd, state.cull.into());
            device.cmd_set_front_face(cmd, vk::FrontFace::CLOCKWISE);

            let depth = state.depth.unwrap_or_default();
            device.cmd_set_depth_test_enable(cmd, depth.enabled);
            device.cmd_set_depth_write_enable(cmd, depth.enabled);
            device.cmd_set_depth_compare_op(cmd, depth.func.into());

            let stencil = state.stencil.unwrap_or_default();
            let faces = vk::StencilFaceFlags::FRONT_AND_BACK;
            device.cmd_set_stencil_test_enable(cmd, stencil.enabled);
            device.cmd_set_stencil_op(
                cmd,
                faces,
                stencil.fail_op.into(),
                stencil.pass_op.into(),
                stencil.depth_fail_op.into(),
                stencil.func.into(),
            );
            device.cmd_set_stencil_compare_mask(cmd, faces, stencil.read_mask as u32);
            device.cmd_set_stencil_write_mask(cmd, faces, stencil.write_mask as u32);
            device.cmd_set_stencil_reference(cmd, faces, stencil.reference as u32);
        }

        // Push every binding the shader declares, from the buffered
        // queues. Infos are pre-sized so the write pointers stay valid.
        let mut buffer_infos = Vec::with_capacity(shader.bindings.len());
        let mut image_infos = Vec::with_capacity(shader.bindings.len());
        let mut writes = Vec::with_capacity(shader.bindings.len());
        for binding in &shader.bindings {
            match binding.kind {
                BindingKind::UniformBuffer => {
                    let slice = bindings
                        .buffers
                        .get(&binding.binding)
                        .ok_or(GfxError::MissingDrawState("uniform buffer"))?;
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: slice.buffer,
                        offset: 0,
                        range: slice.size,
                    });
                }
                BindingKind::CombinedImageSampler => {
                    let tex_handle = bindings
                        .images
                        .get(&binding.binding)
                        .ok_or(GfxError::MissingDrawState("texture"))?;
                    let tex = textures
                        .get_ref(Handle::from_raw(tex_handle.raw()))
                        .ok_or(GfxError::StaleHandle("texture"))?;
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler,
                        image_view: tex.view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    });
                }
            }
        }

        let mut next_buffer = 0;
        let mut next_image = 0;
        for binding in &shader.bindings {
            let write = vk::WriteDescriptorSet::builder()
                .dst_binding(binding.binding)
                .descriptor_type(binding.kind.into());
            let write = match binding.kind {
                BindingKind::UniformBuffer => {
                    let info = &buffer_infos[next_buffer];
                    next_buffer += 1;
                    write.buffer_info(std::slice::from_ref(info))
                }
                BindingKind::CombinedImageSampler => {
                    let info = &image_infos[next_image];
                    next_image += 1;
                    write.image_info(std::slice::from_ref(info))
                }
            };
            writes.push(write.build());
        }

        if !writes.is_empty() {
            unsafe {
                self.push_descriptor.cmd_push_descriptor_set(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    shader.pipeline_layout,
                    0,
                    &writes,
                )
            };
        }

        let vertex = self
            .vertex
            .ok_or(GfxError::MissingDrawState("vertex buffer"))?;
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(cmd, 0, &[vertex.buffer], &[0])
        };

        Ok(cmd)
    }

    fn oneshot(
        &self,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    ) -> Result<()> {
        let cmd = unsafe {
            self.device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(self.oneshot_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )
        }?[0];

        unsafe {
            self.device.begin_command_buffer(
                cmd,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?
        };
        record(&self.device, cmd)?;
        unsafe {
            self.device.end_command_buffer(cmd)?;
            self.device.queue_submit(
                self.queue,
                &[vk::SubmitInfo::builder()
                    .command_buffers(std::slice::from_ref(&cmd))
                    .build()],
                self.oneshot_fence,
            )?;
            self.device
                .wait_for_fences(&[self.oneshot_fence], true, u64::MAX)?;
            self.device.reset_fences(&[self.oneshot_fence])?;
            self.device
                .free_command_buffers(self.oneshot_pool, &[cmd]);
        }
        Ok(())
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        for view in self.swapchain.views.drain(..) {
            unsafe { self.device.destroy_image_view(view, None) };
        }
        unsafe {
            self.swapchain_loader
                .destroy_swapchain(self.swapchain.handle, None);
            self.device.destroy_image_view(self.depth.view, None);
            self.allocator
                .destroy_image(self.depth.image, &mut self.depth.alloc);
        }
        self.swapchain = build_swapchain(
            &self.swapchain_loader,
            &self.surface_loader,
            &self.device,
            self.pdevice,
            self.surface,
            width,
            height,
            self.vsync,
        )?;
        self.depth = build_depth_buffer(&self.device, &self.allocator, self.swapchain.extent)?;
        self.window_size = (width, height);
        Ok(())
    }

    fn destroy_texture_now(&mut self, handle: Handle<VkTexture>) -> Result<()> {
        let mut tex = self
            .textures
            .release(handle)
            .ok_or(GfxError::StaleHandle("texture"))?;
        unsafe {
            self.device.device_wait_idle()?;
            self.device.destroy_image_view(tex.view, None);
            self.allocator.destroy_image(tex.image, &mut tex.alloc);
        }
        Ok(())
    }
}

impl Backend for VulkanEngine {
    fn backend_type(&self) -> BackendType {
        BackendType::Vulkan
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
        let slice = self.upload_stream(view.data)?;
        self.vertex = Some(slice);
        Ok(())
    }

    fn set_index_buffer(&mut self, view: BufferView<'_>) -> Result<()> {
        let index_type = match view.stride {
            2 => vk::IndexType::UINT16,
            4 => vk::IndexType::UINT32,
            _ => {
                return Err(GfxError::InvalidArgument(
                    "index buffer stride must be 2 or 4 bytes",
                ))
            }
        };
        let slice = self.upload_stream(view.data)?;
        self.index = Some((slice, index_type));
        Ok(())
    }

    fn set_uniform_buffer(&mut self, binding: u32, data: &[u8]) -> Result<()> {
        let slice = self.upload_stream(data)?;
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
        self.state.target = target;
        Ok(())
    }

    fn clear(
        &mut self,
        color: Option<Vec4>,
        depth: Option<f32>,
        stencil: Option<u8>,
    ) -> Result<()> {
        self.ensure_scope()?;
        let extent = self.current_extent()?;
        let cmd = match self.open {
            Some((cmd, _)) => cmd,
            None => return Err(GfxError::MissingDrawState("active frame")),
        };

        let mut attachments = Vec::with_capacity(2);
        if let Some(c) = color {
            attachments.push(vk::ClearAttachment {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                color_attachment: 0,
                clear_value: vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: c.to_array(),
                    },
                },
            });
        }
        let mut ds_aspect = vk::ImageAspectFlags::empty();
        if depth.is_some() {
            ds_aspect |= vk::ImageAspectFlags::DEPTH;
        }
        if stencil.is_some() {
            ds_aspect |= vk::ImageAspectFlags::STENCIL;
        }
        if !ds_aspect.is_empty() {
            attachments.push(vk::ClearAttachment {
                aspect_mask: ds_aspect,
                color_attachment: 0,
                clear_value: vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: depth.unwrap_or(1.0),
                        stencil: stencil.unwrap_or(0) as u32,
                    },
                },
            });
        }
        if attachments.is_empty() {
            return Ok(());
        }

        let rect = vk::ClearRect {
            rect: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            self.device
                .cmd_clear_attachments(cmd, &attachments, &[rect])
        };
        Ok(())
    }

    fn draw(&mut self, vertex_count: u32, first_vertex: u32) -> Result<()> {
        let cmd = self.flush_draw_state()?;
        unsafe { self.device.cmd_draw(cmd, vertex_count, 1, first_vertex, 0) };
        Ok(())
    }

    fn draw_indexed(&mut self, index_count: u32, first_index: u32) -> Result<()> {
        let (index, index_type) = self
            .index
            .ok_or(GfxError::MissingDrawState("index buffer"))?;
        let cmd = self.flush_draw_state()?;
        unsafe {
            self.device
                .cmd_bind_index_buffer(cmd, index.buffer, 0, index_type);
            self.device
                .cmd_draw_indexed(cmd, index_count, 1, first_index, 0, 0);
        }
        Ok(())
    }

    fn read_pixels(&mut self, position: IVec2, size: IVec2, dst: TextureHandle) -> Result<()> {
        self.ensure_frame()?;
        if self
            .textures
            .get_ref(Handle::from_raw(dst.raw()))
            .is_none()
        {
            return Err(GfxError::StaleHandle("texture"));
        }
        // The copy must run outside any rendering scope, so it becomes
        // its own frame part between pass segments.
        self.close_scope()?;
        self.parts.push(FramePart::ReadPixels {
            position,
            size,
            dst,
            target: self.state.target,
        });
        Ok(())
    }

    fn read_texture(&mut self, texture: TextureHandle) -> Result<Vec<u8>> {
        let handle: Handle<VkTexture> = Handle::from_raw(texture.raw());
        let (image, width, height, layout, mip_levels) = {
            let tex = self
                .textures
                .get_ref(handle)
                .ok_or(GfxError::StaleHandle("texture"))?;
            (tex.image, tex.width, tex.height, tex.layout, tex.mip_levels)
        };
        let size = (width * height * 4) as usize;

        let (buffer, mut alloc) = unsafe {
            self.allocator.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(size as u64)
                    .usage(vk::BufferUsageFlags::TRANSFER_DST)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .build(),
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::AutoPreferHost,
                    flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
                    ..Default::default()
                },
            )
        }?;

        // One-shot submissions on the same queue order after everything
        // `present` already submitted, and the fence wait inside
        // `oneshot` makes the copy visible to the host.
        let copied = self.oneshot(|device, cmd| {
            image_barrier(
                device,
                cmd,
                image,
                vk::ImageAspectFlags::COLOR,
                layout,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                mip_levels,
            );
            unsafe {
                device.cmd_copy_image_to_buffer(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    buffer,
                    &[vk::BufferImageCopy {
                        buffer_offset: 0,
                        buffer_row_length: 0,
                        buffer_image_height: 0,
                        image_subresource: vk::ImageSubresourceLayers {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            mip_level: 0,
                            base_array_layer: 0,
                            layer_count: 1,
                        },
                        image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                        image_extent: vk::Extent3D {
                            width,
                            height,
                            depth: 1,
                        },
                    }],
                )
            };
            image_barrier(
                device,
                cmd,
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                mip_levels,
            );
            Ok(())
        });
        if let Err(err) = copied {
            unsafe { self.allocator.destroy_buffer(buffer, &mut alloc) };
            return Err(err);
        }
        if let Some(tex) = self.textures.get_mut_ref(handle) {
            tex.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        }

        let mut out = vec![0u8; size];
        let mapped = match unsafe { self.allocator.map_memory(&mut alloc) } {
            Ok(ptr) => ptr,
            Err(err) => {
                unsafe { self.allocator.destroy_buffer(buffer, &mut alloc) };
                return Err(err.into());
            }
        };
        unsafe {
            std::ptr::copy_nonoverlapping(mapped, out.as_mut_ptr(), size);
            self.allocator.unmap_memory(&mut alloc);
            self.allocator.destroy_buffer(buffer, &mut alloc);
        }
        Ok(out)
    }

    fn present(&mut self) -> Result<()> {
        self.ensure_frame()?;
        self.close_scope()?;
        self.recording = false;
        let parts = std::mem::take(&mut self.parts);

        // Only now, with the whole frame recorded, does the swapchain
        // image get acquired.
        let acquire = self.frames.current().acquire;
        let acquired = match unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain.handle,
                u64::MAX,
                acquire,
                vk::Fence::null(),
            )
        } {
            Ok((index, _suboptimal)) => index,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.recreate_swapchain(self.window_size.0, self.window_size.1)?;
                let (index, _) = unsafe {
                    self.swapchain_loader.acquire_next_image(
                        self.swapchain.handle,
                        u64::MAX,
                        acquire,
                        vk::Fence::null(),
                    )
                }?;
                index
            }
            Err(err) => return Err(err.into()),
        };
        let image_index = acquired as usize;

        let cmd = self.frames.current().cmd;
        unsafe {
            self.device.begin_command_buffer(
                cmd,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?
        };

        for part in parts {
            match part {
                FramePart::Pass { cmd: pass, target } => {
                    self.replay_pass(cmd, image_index, pass, target)?
                }
                FramePart::ReadPixels {
                    position,
                    size,
                    dst,
                    target,
                } => self.record_read_pixels(cmd, image_index, position, size, dst, target)?,
            }
        }

        let old = self.swapchain.layouts[image_index];
        if old != vk::ImageLayout::PRESENT_SRC_KHR {
            image_barrier(
                &self.device,
                cmd,
                self.swapchain.images[image_index],
                vk::ImageAspectFlags::COLOR,
                old,
                vk::ImageLayout::PRESENT_SRC_KHR,
                1,
            );
            self.swapchain.layouts[image_index] = vk::ImageLayout::PRESENT_SRC_KHR;
        }

        let frame = self.frames.current_mut();
        unsafe {
            self.device.end_command_buffer(frame.cmd)?;
            self.device.reset_fences(&[frame.fence])?;
            self.device.queue_submit(
                self.queue,
                &[vk::SubmitInfo::builder()
                    .wait_semaphores(std::slice::from_ref(&frame.acquire))
                    .wait_dst_stage_mask(&[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT])
                    .command_buffers(std::slice::from_ref(&frame.cmd))
                    .signal_semaphores(std::slice::from_ref(&frame.render_done))
                    .build()],
                frame.fence,
            )?;
        }
        frame.submitted = true;

        let render_done = frame.render_done;
        let result = unsafe {
            self.swapchain_loader.queue_present(
                self.queue,
                &vk::PresentInfoKHR::builder()
                    .wait_semaphores(std::slice::from_ref(&render_done))
                    .swapchains(std::slice::from_ref(&self.swapchain.handle))
                    .image_indices(&[acquired]),
            )
        };
        match result {
            Ok(_) => {}
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                self.recreate_swapchain(self.window_size.0, self.window_size.1)?;
            }
            Err(err) => return Err(err.into()),
        }

        self.frames.advance();
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.abandon_frame();
        self.recreate_swapchain(width, height)
    }

    fn set_vsync(&mut self, enabled: bool) -> Result<()> {
        if self.vsync == enabled {
            return Ok(());
        }
        self.vsync = enabled;
        self.abandon_frame();
        self.recreate_swapchain(self.window_size.0, self.window_size.1)
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
        let mip_levels = if mipmap {
            32 - width.max(height).leading_zeros()
        } else {
            1
        };

        let (image, alloc) = unsafe {
            self.allocator.create_image(
                &vk::ImageCreateInfo::builder()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(vk::Format::R8G8B8A8_UNORM)
                    .extent(vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    })
                    .mip_levels(mip_levels)
                    .array_layers(1)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(
                        vk::ImageUsageFlags::SAMPLED
                            | vk::ImageUsageFlags::TRANSFER_DST
                            | vk::ImageUsageFlags::TRANSFER_SRC,
                    )
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .build(),
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::Auto,
                    ..Default::default()
                },
            )
        }?;

        let view = unsafe {
            self.device.create_image_view(
                &vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(vk::Format::R8G8B8A8_UNORM)
                    .subresource_range(
                        vk::ImageSubresourceRange::builder()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(0)
                            .level_count(mip_levels)
                            .base_array_layer(0)
                            .layer_count(1)
                            .build(),
                    ),
                None,
            )
        }?;

        if let Some(pixels) = pixels {
            let expanded;
            let pixels = if channels == 3 {
                expanded = expand_rgb_to_rgba(pixels);
                expanded.as_slice()
            } else {
                pixels
            };
            let (staging, mut staging_alloc) = unsafe {
                self.allocator.create_buffer(
                    &vk::BufferCreateInfo::builder()
                        .size(pixels.len() as u64)
                        .usage(vk::BufferUsageFlags::TRANSFER_SRC)
                        .sharing_mode(vk::SharingMode::EXCLUSIVE)
                        .build(),
                    &vk_mem::AllocationCreateInfo {
                        usage: vk_mem::MemoryUsage::AutoPreferHost,
                        flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
                        ..Default::default()
                    },
                )
            }?;
            let mapped = unsafe { self.allocator.map_memory(&mut staging_alloc) }?;
            unsafe {
                std::ptr::copy_nonoverlapping(pixels.as_ptr(), mapped, pixels.len());
                self.allocator.unmap_memory(&mut staging_alloc);
            }

            self.oneshot(|device, cmd| {
                image_barrier(
                    device,
                    cmd,
                    image,
                    vk::ImageAspectFlags::COLOR,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    mip_levels,
                );
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        staging,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[vk::BufferImageCopy {
                            buffer_offset: 0,
                            buffer_row_length: 0,
                            buffer_image_height: 0,
                            image_subresource: vk::ImageSubresourceLayers {
                                aspect_mask: vk::ImageAspectFlags::COLOR,
                                mip_level: 0,
                                base_array_layer: 0,
                                layer_count: 1,
                            },
                            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                            image_extent: vk::Extent3D {
                                width,
                                height,
                                depth: 1,
                            },
                        }],
                    )
                };
                if mip_levels > 1 {
                    generate_mips(device, cmd, image, width, height, mip_levels);
                } else {
                    image_barrier(
                        device,
                        cmd,
                        image,
                        vk::ImageAspectFlags::COLOR,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        1,
                    );
                }
                Ok(())
            })?;

            unsafe {
                self.allocator.destroy_buffer(staging, &mut staging_alloc);
            }
        } else {
            self.oneshot(|device, cmd| {
                image_barrier(
                    device,
                    cmd,
                    image,
                    vk::ImageAspectFlags::COLOR,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    mip_levels,
                );
                Ok(())
            })?;
        }

        let handle = self
            .textures
            .insert(VkTexture {
                image,
                alloc,
                view,
                width,
                height,
                mip_levels,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
            .ok_or(GfxError::ResourceCreation("texture pool full".to_string()))?;
        Ok(TextureHandle(handle.into_raw()))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) -> Result<()> {
        self.destroy_texture_now(Handle::from_raw(texture.raw()))
    }

    fn create_render_target(&mut self, width: u32, height: u32) -> Result<RenderTargetHandle> {
        if width == 0 || height == 0 {
            return Err(GfxError::InvalidArgument(
                "render target extent must be nonzero",
            ));
        }

        // Color matches the swapchain format so one pipeline serves both
        // onscreen and offscreen passes.
        let format = self.swapchain.format;
        let (image, alloc) = unsafe {
            self.allocator.create_image(
                &vk::ImageCreateInfo::builder()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(format)
                    .extent(vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    })
                    .mip_levels(1)
                    .array_layers(1)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(
                        vk::ImageUsageFlags::COLOR_ATTACHMENT
                            | vk::ImageUsageFlags::SAMPLED
                            | vk::ImageUsageFlags::TRANSFER_SRC
                            | vk::ImageUsageFlags::TRANSFER_DST,
                    )
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .build(),
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::Auto,
                    ..Default::default()
                },
            )
        }?;
        let view = unsafe {
            self.device.create_image_view(
                &vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format)
                    .subresource_range(
                        vk::ImageSubresourceRange::builder()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .level_count(1)
                            .layer_count(1)
                            .build(),
                    ),
                None,
            )
        }?;

        self.oneshot(|device, cmd| {
            image_barrier(
                device,
                cmd,
                image,
                vk::ImageAspectFlags::COLOR,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                1,
            );
            Ok(())
        })?;

        let color = self
            .textures
            .insert(VkTexture {
                image,
                alloc,
                view,
                width,
                height,
                mip_levels: 1,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
            .ok_or(GfxError::ResourceCreation("texture pool full".to_string()))?;

        let extent = vk::Extent2D { width, height };
        let depth = build_depth_buffer(&self.device, &self.allocator, extent)?;

        let handle = self
            .render_targets
            .insert(VkRenderTarget {
                color,
                depth_image: depth.image,
                depth_alloc: depth.alloc,
                depth_view: depth.view,
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
        let mut rt = self
            .render_targets
            .release(Handle::from_raw(target.raw()))
            .ok_or(GfxError::StaleHandle("render target"))?;
        unsafe {
            self.device.device_wait_idle()?;
            self.device.destroy_image_view(rt.depth_view, None);
            self.allocator
                .destroy_image(rt.depth_image, &mut rt.depth_alloc);
        }
        self.destroy_texture_now(rt.color)
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

        let vertex = unsafe {
            self.device.create_shader_module(
                &vk::ShaderModuleCreateInfo::builder().code(&compiled.vertex_spirv),
                None,
            )
        }?;
        let fragment = unsafe {
            self.device.create_shader_module(
                &vk::ShaderModuleCreateInfo::builder().code(&compiled.fragment_spirv),
                None,
            )
        }?;

        let layout_bindings: Vec<_> = compiled
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.kind.into())
                    .descriptor_count(1)
                    .stage_flags(b.stages.into())
                    .build()
            })
            .collect();
        let set_layout = unsafe {
            self.device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::builder()
                    .flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR)
                    .bindings(&layout_bindings),
                None,
            )
        }?;
        let pipeline_layout = unsafe {
            self.device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::builder()
                    .set_layouts(std::slice::from_ref(&set_layout)),
                None,
            )
        }?;

        let id = self.next_shader_id;
        self.next_shader_id += 1;

        let handle = self
            .shaders
            .insert(VkShader {
                id,
                vertex,
                fragment,
                bindings: compiled.bindings,
                layout: compiled.layout,
                set_layout,
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
        unsafe { self.device.device_wait_idle()? };
        for pipeline in self.pipelines.evict_shader(sh.id) {
            unsafe { self.device.destroy_pipeline(pipeline, None) };
        }
        unsafe {
            self.device.destroy_pipeline_layout(sh.pipeline_layout, None);
            self.device.destroy_descriptor_set_layout(sh.set_layout, None);
            self.device.destroy_shader_module(sh.vertex, None);
            self.device.destroy_shader_module(sh.fragment, None);
        }
        Ok(())
    }
}

impl Drop for VulkanEngine {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            for mut tex in self.textures.drain() {
                self.device.destroy_image_view(tex.view, None);
                self.allocator.destroy_image(tex.image, &mut tex.alloc);
            }
            for mut rt in self.render_targets.drain() {
                self.device.destroy_image_view(rt.depth_view, None);
                self.allocator
                    .destroy_image(rt.depth_image, &mut rt.depth_alloc);
            }
            for sh in self.shaders.drain() {
                self.device.destroy_pipeline_layout(sh.pipeline_layout, None);
                self.device.destroy_descriptor_set_layout(sh.set_layout, None);
                self.device.destroy_shader_module(sh.vertex, None);
                self.device.destroy_shader_module(sh.fragment, None);
            }
            for pipeline in self.pipelines.drain() {
                self.device.destroy_pipeline(pipeline, None);
            }
            for (_, sampler) in self.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }

            for frame in self.frames.iter_mut() {
                frame.streams.drain(|mut block| {
                    self.allocator.destroy_buffer(block.buf, &mut block.alloc);
                });
                self.device.destroy_command_pool(frame.pool, None);
                self.device.destroy_fence(frame.fence, None);
                self.device.destroy_semaphore(frame.acquire, None);
                self.device.destroy_semaphore(frame.render_done, None);
            }
            self.device.destroy_command_pool(self.oneshot_pool, None);
            self.device.destroy_fence(self.oneshot_fence, None);

            for view in self.swapchain.views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            self.swapchain_loader
                .destroy_swapchain(self.swapchain.handle, None);
            self.device.destroy_image_view(self.depth.view, None);
            self.allocator
                .destroy_image(self.depth.image, &mut self.depth.alloc);

            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
        // entry must outlive everything above.
        let _ = &self.entry;
    }
}

fn create_surface(
    entry: &ash::Entry,
    instance: &ash::Instance,
    window: &WindowSurface,
) -> Result<vk::SurfaceKHR> {
    use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

    match (window.window, window.display) {
        #[cfg(target_os = "windows")]
        (RawWindowHandle::Win32(w), _) => {
            let loader = ash::extensions::khr::Win32Surface::new(entry, instance);
            let info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(
                    w.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void
                )
                .hwnd(w.hwnd.get() as *const std::ffi::c_void);
            Ok(unsafe { loader.create_win32_surface(&info, None) }?)
        }
        #[cfg(target_os = "linux")]
        (RawWindowHandle::Xlib(w), RawDisplayHandle::Xlib(d)) => {
            let loader = ash::extensions::khr::XlibSurface::new(entry, instance);
            let dpy = d
                .display
                .map(|p| p.as_ptr())
                .unwrap_or(std::ptr::null_mut());
            let info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy as *mut _)
                .window(w.window);
            Ok(unsafe { loader.create_xlib_surface(&info, None) }?)
        }
        #[cfg(target_os = "linux")]
        (RawWindowHandle::Wayland(w), RawDisplayHandle::Wayland(d)) => {
            let loader = ash::extensions::khr::WaylandSurface::new(entry, instance);
            let info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(d.display.as_ptr())
                .surface(w.surface.as_ptr());
            Ok(unsafe { loader.create_wayland_surface(&info, None) }?)
        }
        _ => Err(GfxError::ResourceCreation(
            "unsupported window handle for vulkan surface".to_string(),
        )),
    }
}

fn pick_device(
    instance: &ash::Instance,
    surface_loader: &ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
) -> Option<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }.ok()?;
    for pdevice in devices {
        let families = unsafe { instance.get_physical_device_queue_family_properties(pdevice) };
        for (idx, family) in families.iter().enumerate() {
            if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                continue;
            }
            let presentable = unsafe {
                surface_loader.get_physical_device_surface_support(pdevice, idx as u32, surface)
            }
            .unwrap_or(false);
            if presentable {
                return Some((pdevice, idx as u32));
            }
        }
    }
    None
}

#[allow(clippy::too_many_arguments)]
fn build_swapchain(
    swapchain_loader: &ash::extensions::khr::Swapchain,
    surface_loader: &ash::extensions::khr::Surface,
    device: &ash::Device,
    pdevice: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    width: u32,
    height: u32,
    vsync: bool,
) -> Result<SwapchainBundle> {
    let capabilities = unsafe {
        surface_loader.get_physical_device_surface_capabilities(pdevice, surface)
    }?;
    let formats =
        unsafe { surface_loader.get_physical_device_surface_formats(pdevice, surface) }?;

    let chosen = formats
        .iter()
        .find(|f| {
            f.format == vk::Format::R8G8B8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| {
            formats.iter().find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| formats.first())
        .ok_or(GfxError::NoSuitableAdapter)?;

    let mut extent = vk::Extent2D { width, height };
    if capabilities.current_extent.width != u32::MAX {
        extent = capabilities.current_extent;
    } else {
        extent.width = extent.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        );
        extent.height = extent.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        );
    }

    let present_mode = if vsync {
        vk::PresentModeKHR::FIFO
    } else {
        let modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(pdevice, surface)
        }?;
        if modes.contains(&vk::PresentModeKHR::IMMEDIATE) {
            vk::PresentModeKHR::IMMEDIATE
        } else {
            vk::PresentModeKHR::FIFO
        }
    };

    let handle = unsafe {
        swapchain_loader.create_swapchain(
            &vk::SwapchainCreateInfoKHR::builder()
                .surface(surface)
                .min_image_count(MIN_SWAPCHAIN_IMAGES.max(capabilities.min_image_count))
                .image_format(chosen.format)
                .image_color_space(chosen.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
                )
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(present_mode)
                .clipped(true)
                .build(),
            None,
        )
    }?;

    let images = unsafe { swapchain_loader.get_swapchain_images(handle) }?;
    let mut views = Vec::with_capacity(images.len());
    for image in &images {
        let view = unsafe {
            device.create_image_view(
                &vk::ImageViewCreateInfo::builder()
                    .image(*image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(chosen.format)
                    .subresource_range(
                        vk::ImageSubresourceRange::builder()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .level_count(1)
                            .layer_count(1)
                            .build(),
                    ),
                None,
            )
        }?;
        views.push(view);
    }

    let layouts = vec![vk::ImageLayout::UNDEFINED; images.len()];
    Ok(SwapchainBundle {
        handle,
        images,
        views,
        layouts,
        format: chosen.format,
        extent,
    })
}

fn build_depth_buffer(
    device: &ash::Device,
    allocator: &vk_mem::Allocator,
    extent: vk::Extent2D,
) -> Result<DepthBuffer> {
    let (image, alloc) = unsafe {
        allocator.create_image(
            &vk::ImageCreateInfo::builder()
                .image_type(vk::ImageType::TYPE_2D)
                .format(DEPTH_FORMAT)
                .extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .build(),
            &vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::Auto,
                ..Default::default()
            },
        )
    }?;
    let view = unsafe {
        device.create_image_view(
            &vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(DEPTH_FORMAT)
                .subresource_range(
                    vk::ImageSubresourceRange::builder()
                        .aspect_mask(
                            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
                        )
                        .level_count(1)
                        .layer_count(1)
                        .build(),
                ),
            None,
        )
    }?;
    Ok(DepthBuffer { image, alloc, view })
}

fn build_frame_set(device: &ash::Device, queue_family: u32) -> Result<FrameSet> {
    let pool = unsafe {
        device.create_command_pool(
            &vk::CommandPoolCreateInfo::builder().queue_family_index(queue_family),
            None,
        )
    }?;
    let cmd = unsafe {
        device.allocate_command_buffers(
            &vk::CommandBufferAllocateInfo::builder()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1),
        )
    }?[0];
    let fence = unsafe {
        device.create_fence(
            &vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED),
            None,
        )
    }?;
    let acquire = unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::builder(), None) }?;
    let render_done =
        unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::builder(), None) }?;
    Ok(FrameSet {
        pool,
        cmd,
        secondaries: Vec::new(),
        fence,
        acquire,
        render_done,
        streams: StreamPool::new(STREAM_MIN_BLOCK),
        submitted: false,
    })
}

fn image_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    mip_levels: u32,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::builder()
                .aspect_mask(aspect)
                .base_mip_level(0)
                .level_count(mip_levels)
                .base_array_layer(0)
                .layer_count(1)
                .build(),
        )
        .build();
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        )
    };
}

fn generate_mips(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
    mip_levels: u32,
) {
    let mut mip_w = width as i32;
    let mut mip_h = height as i32;

    for level in 1..mip_levels {
        let src_range = vk::ImageSubresourceRange::builder()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(level - 1)
            .level_count(1)
            .layer_count(1)
            .build();
        let to_src = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(src_range)
            .build();
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_src],
            )
        };

        let next_w = (mip_w / 2).max(1);
        let next_h = (mip_h / 2).max(1);
        let blit = vk::ImageBlit {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: level - 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            src_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: mip_w,
                    y: mip_h,
                    z: 1,
                },
            ],
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: level,
                base_array_layer: 0,
                layer_count: 1,
            },
            dst_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: next_w,
                    y: next_h,
                    z: 1,
                },
            ],
        };
        unsafe {
            device.cmd_blit_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            )
        };

        let to_read = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_READ)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(src_range)
            .build();
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_read],
            )
        };

        mip_w = next_w;
        mip_h = next_h;
    }

    // Last level never became a blit source.
    let last_range = vk::ImageSubresourceRange::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(mip_levels - 1)
        .level_count(1)
        .layer_count(1)
        .build();
    let last = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ)
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(last_range)
        .build();
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[last],
        )
    };
}

fn build_pipeline(
    device: &ash::Device,
    shader: &VkShader,
    blend: Option<BlendMode>,
    topology_class: vk::PrimitiveTopology,
    color_format: vk::Format,
) -> Result<vk::Pipeline> {
    let entry_point = c"main";
    let stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(shader.vertex)
            .name(entry_point)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(shader.fragment)
            .name(entry_point)
            .build(),
    ];

    let binding_desc = [vk::VertexInputBindingDescription {
        binding: 0,
        stride: shader.layout.stride as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }];
    let attribute_descs: Vec<_> = shader
        .layout
        .attributes
        .iter()
        .enumerate()
        .map(|(location, attr)| vk::VertexInputAttributeDescription {
            location: location as u32,
            binding: 0,
            format: attr.format.into(),
            offset: attr.offset as u32,
        })
        .collect();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&binding_desc)
        .vertex_attribute_descriptions(&attribute_descs);

    let input_assembly =
        vk::PipelineInputAssemblyStateCreateInfo::builder().topology(topology_class);

    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
        .polygon_mode(vk::PolygonMode::FILL)
        .front_face(vk::FrontFace::CLOCKWISE)
        .cull_mode(vk::CullModeFlags::NONE)
        .line_width(1.0);

    let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder();

    let attachment = match blend {
        Some(b) => vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(true)
            .src_color_blend_factor(b.color_src.into())
            .dst_color_blend_factor(b.color_dst.into())
            .color_blend_op(b.color_op.into())
            .src_alpha_blend_factor(b.alpha_src.into())
            .dst_alpha_blend_factor(b.alpha_dst.into())
            .alpha_blend_op(b.alpha_op.into())
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .build(),
        None => vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .build(),
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
        .attachments(std::slice::from_ref(&attachment));

    let dynamic_states = [
        vk::DynamicState::VIEWPORT,
        vk::DynamicState::SCISSOR,
        vk::DynamicState::PRIMITIVE_TOPOLOGY,
        vk::DynamicState::CULL_MODE,
        vk::DynamicState::FRONT_FACE,
        vk::DynamicState::DEPTH_TEST_ENABLE,
        vk::DynamicState::DEPTH_WRITE_ENABLE,
        vk::DynamicState::DEPTH_COMPARE_OP,
        vk::DynamicState::STENCIL_TEST_ENABLE,
        vk::DynamicState::STENCIL_OP,
        vk::DynamicState::STENCIL_COMPARE_MASK,
        vk::DynamicState::STENCIL_WRITE_MASK,
        vk::DynamicState::STENCIL_REFERENCE,
    ];
    let dynamic = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let color_formats = [color_format];
    let mut rendering = vk::PipelineRenderingCreateInfo::builder()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(DEPTH_FORMAT)
        .stencil_attachment_format(DEPTH_FORMAT);

    let create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic)
        .layout(shader.pipeline_layout)
        .push_next(&mut rendering)
        .build();

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
    }
    .map_err(|(_, err)| err)?;
    Ok(pipelines[0])
}
