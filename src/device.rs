use std::cell::RefCell;
use std::ops::Deref;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use glam::{IVec2, Vec4};

use crate::backend::{
    Backend, BackendType, RenderTargetHandle, ShaderHandle, TextureHandle, WindowSurface,
};
use crate::error::{GfxError, Result};
use crate::types::{
    BlendMode, BufferView, CullMode, DepthMode, Sampler, Scissor, StencilMode, TextureAddress,
    Topology, Viewport,
};
use crate::vertex::{HasVertexLayout, VertexLayout};

static BACKEND_ACTIVE: AtomicBool = AtomicBool::new(false);

struct InstanceGuard;

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        BACKEND_ACTIVE.store(false, Ordering::Release);
    }
}

pub(crate) struct BackendCell {
    inner: RefCell<Box<dyn Backend>>,
    _guard: InstanceGuard,
}

/// Entry point of the crate. Owns the selected engine and hands out
/// RAII wrappers for textures, render targets, and shaders; draw state
/// set through the device is buffered until the next draw call.
///
/// Only one device may exist per process at a time. Resources keep the
/// engine alive, so dropping the device while resources are outstanding
/// defers engine teardown until the last of them goes away.
pub struct Device {
    backend: Rc<BackendCell>,
}

impl Device {
    pub fn new(ty: BackendType, surface: WindowSurface) -> Result<Device> {
        if BACKEND_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(GfxError::BackendAlreadyActive);
        }
        // Released by drop on every early return below.
        let guard = InstanceGuard;

        let engine: Box<dyn Backend> = match ty {
            #[cfg(feature = "fresco-vulkan")]
            BackendType::Vulkan => Box::new(crate::vulkan::VulkanEngine::new(surface)?),
            #[cfg(feature = "fresco-wgpu")]
            BackendType::WebGpu => Box::new(crate::webgpu::WgpuEngine::new(surface)?),
            other => return Err(GfxError::BackendUnavailable(other)),
        };

        log::info!("device created with {:?} backend", ty);

        Ok(Device {
            backend: Rc::new(BackendCell {
                inner: RefCell::new(engine),
                _guard: guard,
            }),
        })
    }

    pub fn backend_type(&self) -> BackendType {
        self.backend.inner.borrow().backend_type()
    }

    pub fn set_topology(&self, topology: Topology) {
        self.backend.inner.borrow_mut().set_topology(topology);
    }

    pub fn set_viewport(&self, viewport: Option<Viewport>) {
        self.backend.inner.borrow_mut().set_viewport(viewport);
    }

    pub fn set_scissor(&self, scissor: Option<Scissor>) {
        self.backend.inner.borrow_mut().set_scissor(scissor);
    }

    pub fn set_blend_mode(&self, blend: Option<BlendMode>) {
        self.backend.inner.borrow_mut().set_blend_mode(blend);
    }

    pub fn set_depth_mode(&self, depth: Option<DepthMode>) {
        self.backend.inner.borrow_mut().set_depth_mode(depth);
    }

    pub fn set_stencil_mode(&self, stencil: Option<StencilMode>) {
        self.backend.inner.borrow_mut().set_stencil_mode(stencil);
    }

    pub fn set_cull_mode(&self, cull: CullMode) {
        self.backend.inner.borrow_mut().set_cull_mode(cull);
    }

    pub fn set_sampler(&self, sampler: Sampler) {
        self.backend.inner.borrow_mut().set_sampler(sampler);
    }

    pub fn set_texture_address(&self, address: TextureAddress) {
        self.backend.inner.borrow_mut().set_texture_address(address);
    }

    pub fn set_shader(&self, shader: &Shader) {
        self.backend.inner.borrow_mut().set_shader(shader.handle);
    }

    /// Uploads a typed vertex slice for the next draws this frame.
    pub fn set_vertex_buffer<T: HasVertexLayout>(&self, vertices: &[T]) -> Result<()> {
        self.backend
            .inner
            .borrow_mut()
            .set_vertex_buffer(BufferView::of(vertices))
    }

    /// Raw-bytes variant for custom vertex layouts.
    pub fn set_vertex_buffer_raw(&self, view: BufferView<'_>) -> Result<()> {
        self.backend.inner.borrow_mut().set_vertex_buffer(view)
    }

    pub fn set_index_buffer_u16(&self, indices: &[u16]) -> Result<()> {
        self.backend
            .inner
            .borrow_mut()
            .set_index_buffer(BufferView::of(indices))
    }

    pub fn set_index_buffer_u32(&self, indices: &[u32]) -> Result<()> {
        self.backend
            .inner
            .borrow_mut()
            .set_index_buffer(BufferView::of(indices))
    }

    pub fn set_uniform_buffer<T: bytemuck::Pod>(&self, binding: u32, value: &T) -> Result<()> {
        self.backend
            .inner
            .borrow_mut()
            .set_uniform_buffer(binding, bytemuck::bytes_of(value))
    }

    pub fn set_texture(&self, binding: u32, texture: &Texture) -> Result<()> {
        self.backend
            .inner
            .borrow_mut()
            .set_texture(binding, texture.handle)
    }

    pub fn set_render_target(&self, target: Option<&RenderTarget>) -> Result<()> {
        self.backend
            .inner
            .borrow_mut()
            .set_render_target(target.map(|t| t.handle))
    }

    pub fn clear(&self, color: Option<Vec4>, depth: Option<f32>, stencil: Option<u8>) -> Result<()> {
        self.backend.inner.borrow_mut().clear(color, depth, stencil)
    }

    pub fn draw(&self, vertex_count: u32, first_vertex: u32) -> Result<()> {
        self.backend
            .inner
            .borrow_mut()
            .draw(vertex_count, first_vertex)
    }

    pub fn draw_indexed(&self, index_count: u32, first_index: u32) -> Result<()> {
        self.backend
            .inner
            .borrow_mut()
            .draw_indexed(index_count, first_index)
    }

    pub fn read_pixels(&self, position: IVec2, size: IVec2, dst: &Texture) -> Result<()> {
        self.backend
            .inner
            .borrow_mut()
            .read_pixels(position, size, dst.handle)
    }

    /// Downloads a texture's base level to the CPU as tightly packed
    /// 4-byte pixels in the texture's native channel order. Blocks until
    /// the GPU work already submitted against it has finished.
    pub fn read_texture(&self, texture: &Texture) -> Result<Vec<u8>> {
        self.backend.inner.borrow_mut().read_texture(texture.handle)
    }

    pub fn present(&self) -> Result<()> {
        self.backend.inner.borrow_mut().present()
    }

    pub fn resize(&self, width: u32, height: u32) -> Result<()> {
        self.backend.inner.borrow_mut().resize(width, height)
    }

    pub fn set_vsync(&self, enabled: bool) -> Result<()> {
        self.backend.inner.borrow_mut().set_vsync(enabled)
    }

    /// `channels` is 3 or 4; `pixels`, when given, holds
    /// `width * height * channels` tightly packed bytes. RGB data is
    /// expanded to opaque RGBA before upload.
    pub fn create_texture(
        &self,
        width: u32,
        height: u32,
        channels: u32,
        pixels: Option<&[u8]>,
        mipmap: bool,
    ) -> Result<Texture> {
        let handle = self
            .backend
            .inner
            .borrow_mut()
            .create_texture(width, height, channels, pixels, mipmap)?;
        Ok(Texture {
            backend: self.backend.clone(),
            handle,
            width,
            height,
            owned: true,
        })
    }

    pub fn create_render_target(&self, width: u32, height: u32) -> Result<RenderTarget> {
        let mut backend = self.backend.inner.borrow_mut();
        let handle = backend.create_render_target(width, height)?;
        let color = backend.render_target_texture(handle)?;
        Ok(RenderTarget {
            handle,
            // The engine destroys the color texture with the target.
            color: Texture {
                backend: self.backend.clone(),
                handle: color,
                width,
                height,
                owned: false,
            },
        })
    }

    pub fn create_shader(
        &self,
        layout: &VertexLayout,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<Shader> {
        let handle = self.backend.inner.borrow_mut().create_shader(
            layout,
            vertex_source,
            fragment_source,
        )?;
        Ok(Shader {
            backend: self.backend.clone(),
            handle,
        })
    }
}

/// Engine-owned texture, destroyed exactly once when dropped.
pub struct Texture {
    backend: Rc<BackendCell>,
    handle: TextureHandle,
    width: u32,
    height: u32,
    owned: bool,
}

impl Texture {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        if let Err(err) = self.backend.inner.borrow_mut().destroy_texture(self.handle) {
            log::warn!("texture destroy failed: {}", err);
        }
    }
}

/// Offscreen color + depth attachment pair. Dereferences to its color
/// texture so it can be sampled like any other texture.
pub struct RenderTarget {
    handle: RenderTargetHandle,
    color: Texture,
}

impl Deref for RenderTarget {
    type Target = Texture;

    fn deref(&self) -> &Texture {
        &self.color
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        if let Err(err) = self
            .color
            .backend
            .inner
            .borrow_mut()
            .destroy_render_target(self.handle)
        {
            log::warn!("render target destroy failed: {}", err);
        }
    }
}

/// Compiled vertex/fragment program. Dropping it also evicts every
/// pipeline the engines cached for it.
pub struct Shader {
    backend: Rc<BackendCell>,
    handle: ShaderHandle,
}

impl Drop for Shader {
    fn drop(&mut self) {
        if let Err(err) = self.backend.inner.borrow_mut().destroy_shader(self.handle) {
            log::warn!("shader destroy failed: {}", err);
        }
    }
}
