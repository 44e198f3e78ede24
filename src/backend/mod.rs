use std::collections::BTreeMap;

use glam::{IVec2, Vec4};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::Result;
use crate::types::{
    BlendMode, BufferView, CullMode, DepthMode, Sampler, Scissor, StencilMode, TextureAddress,
    Topology, Viewport,
};
use crate::utils::RawHandle;
use crate::vertex::VertexLayout;

/// The rendering API family an engine drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendType {
    Vulkan,
    WebGpu,
    Metal,
    D3D12,
}

macro_rules! resource_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) RawHandle);

        impl $name {
            pub(crate) fn raw(&self) -> RawHandle {
                self.0
            }
        }
    };
}

resource_handle!(
    /// Opaque reference to an engine-owned texture.
    TextureHandle
);
resource_handle!(
    /// Opaque reference to an offscreen color + depth attachment pair.
    RenderTargetHandle
);
resource_handle!(
    /// Opaque reference to a compiled vertex/fragment program.
    ShaderHandle
);

/// Native window the engine presents into, expressed through
/// raw-window-handle so any windowing crate can feed it.
#[derive(Clone, Copy)]
pub struct WindowSurface {
    pub window: RawWindowHandle,
    pub display: RawDisplayHandle,
    pub width: u32,
    pub height: u32,
}

/// Contract every engine implements. State setters buffer their value;
/// nothing touches the GPU until `draw`/`draw_indexed` resolves the
/// buffered state into native pipeline and binding updates, or until
/// `present` flushes the frame.
pub trait Backend {
    fn backend_type(&self) -> BackendType;

    fn set_topology(&mut self, topology: Topology);
    fn set_viewport(&mut self, viewport: Option<Viewport>);
    fn set_scissor(&mut self, scissor: Option<Scissor>);
    fn set_blend_mode(&mut self, blend: Option<BlendMode>);
    fn set_depth_mode(&mut self, depth: Option<DepthMode>);
    fn set_stencil_mode(&mut self, stencil: Option<StencilMode>);
    fn set_cull_mode(&mut self, cull: CullMode);
    fn set_sampler(&mut self, sampler: Sampler);
    fn set_texture_address(&mut self, address: TextureAddress);
    fn set_shader(&mut self, shader: ShaderHandle);

    /// Copies the caller's bytes into frame-local pooled storage. The
    /// element stride of the view must match the bound shader's vertex
    /// layout at draw time.
    fn set_vertex_buffer(&mut self, view: BufferView<'_>) -> Result<()>;
    /// Index width is taken from the view's stride: 2 or 4 bytes.
    fn set_index_buffer(&mut self, view: BufferView<'_>) -> Result<()>;
    fn set_uniform_buffer(&mut self, binding: u32, data: &[u8]) -> Result<()>;
    fn set_texture(&mut self, binding: u32, texture: TextureHandle) -> Result<()>;
    /// `None` targets the swapchain backbuffer.
    fn set_render_target(&mut self, target: Option<RenderTargetHandle>) -> Result<()>;

    fn clear(&mut self, color: Option<Vec4>, depth: Option<f32>, stencil: Option<u8>)
        -> Result<()>;
    fn draw(&mut self, vertex_count: u32, first_vertex: u32) -> Result<()>;
    fn draw_indexed(&mut self, index_count: u32, first_index: u32) -> Result<()>;

    /// Copies a rectangle of the current render target into `dst`,
    /// ordered after the draws recorded so far this frame. Out-of-bounds
    /// rectangles are clamped; engines that cannot read their backbuffer
    /// log and skip the copy.
    fn read_pixels(&mut self, position: IVec2, size: IVec2, dst: TextureHandle) -> Result<()>;

    /// Downloads the base mip level of `texture` as tightly packed
    /// 4-byte pixels in the texture's native channel order. Blocks until
    /// GPU work already submitted against the texture has finished, so
    /// it reflects everything up to the last `present`.
    fn read_texture(&mut self, texture: TextureHandle) -> Result<Vec<u8>>;

    fn present(&mut self) -> Result<()>;
    fn resize(&mut self, width: u32, height: u32) -> Result<()>;
    fn set_vsync(&mut self, enabled: bool) -> Result<()>;

    /// `channels` is 3 (RGB) or 4 (RGBA); `pixels` is tightly packed,
    /// `width * height * channels` bytes. Three-channel data is expanded
    /// to opaque RGBA before upload.
    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        channels: u32,
        pixels: Option<&[u8]>,
        mipmap: bool,
    ) -> Result<TextureHandle>;
    fn destroy_texture(&mut self, texture: TextureHandle) -> Result<()>;

    fn create_render_target(&mut self, width: u32, height: u32) -> Result<RenderTargetHandle>;
    /// Returns the color texture backing `target`, usable wherever a
    /// texture handle is.
    fn render_target_texture(&self, target: RenderTargetHandle) -> Result<TextureHandle>;
    fn destroy_render_target(&mut self, target: RenderTargetHandle) -> Result<()>;

    fn create_shader(
        &mut self,
        layout: &VertexLayout,
        vertex_source: &str,
        fragment_source: &str,
    ) -> Result<ShaderHandle>;
    /// Also evicts every cached pipeline built from this shader.
    fn destroy_shader(&mut self, shader: ShaderHandle) -> Result<()>;
}

/// Expands tightly packed RGB8 pixel data to RGBA8 with opaque alpha.
/// Neither engine samples 24-bit formats, so three-channel uploads are
/// widened on the CPU.
pub(crate) fn expand_rgb_to_rgba(pixels: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pixels.len() / 3 * 4);
    for rgb in pixels.chunks_exact(3) {
        out.extend_from_slice(rgb);
        out.push(u8::MAX);
    }
    out
}

/// Buffered descriptor bindings, flushed at draw. Keys are binding
/// slots; BTreeMap keeps flush order deterministic.
pub struct BindingQueues<I, B> {
    pub images: BTreeMap<u32, I>,
    pub buffers: BTreeMap<u32, B>,
}

impl<I, B> Default for BindingQueues<I, B> {
    fn default() -> Self {
        Self {
            images: BTreeMap::new(),
            buffers: BTreeMap::new(),
        }
    }
}

impl<I, B> BindingQueues<I, B> {
    pub fn set_image(&mut self, binding: u32, image: I) {
        self.images.insert(binding, image);
    }

    pub fn set_buffer(&mut self, binding: u32, buffer: B) {
        self.buffers.insert(binding, buffer);
    }

    pub fn clear(&mut self) {
        self.images.clear();
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_pixels_widen_to_opaque_rgba() {
        let rgb = [10, 20, 30, 40, 50, 60];
        assert_eq!(
            expand_rgb_to_rgba(&rgb),
            vec![10, 20, 30, 255, 40, 50, 60, 255]
        );
        assert!(expand_rgb_to_rgba(&[]).is_empty());
    }

    #[test]
    fn binding_queues_iterate_in_slot_order() {
        let mut q: BindingQueues<&str, &str> = BindingQueues::default();
        q.set_buffer(5, "b5");
        q.set_buffer(1, "b1");
        q.set_image(3, "i3");
        q.set_buffer(1, "b1-replaced");

        let slots: Vec<_> = q.buffers.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(slots, vec![(1, "b1-replaced"), (5, "b5")]);
        assert_eq!(q.images.len(), 1);

        q.clear();
        assert!(q.buffers.is_empty() && q.images.is_empty());
    }
}
