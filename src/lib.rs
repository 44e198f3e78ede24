//! Immediate-mode rendering abstraction over multiple GPU APIs.
//!
//! A [`Device`] wraps one native engine behind a buffered-state draw
//! model: set topology, blend, shader, buffers and textures in any
//! order, then call [`Device::draw`] and the engine resolves the
//! accumulated state into native pipeline and binding updates.
//! Shaders are written once in Vulkan-style GLSL; the crate compiles
//! them to SPIR-V, reflects their bindings, and adapts them to whatever
//! engine is active.
//!
//! Engines are selected at [`Device::new`] and gated behind cargo
//! features: `fresco-vulkan` (ash + vk-mem) and `fresco-wgpu` (wgpu).

pub mod backend;
pub mod cache;
pub mod device;
pub mod error;
pub mod frame;
pub mod shader;
pub mod stream;
pub mod types;
pub mod utils;
pub mod vertex;

#[cfg(feature = "fresco-vulkan")]
pub mod vulkan;
#[cfg(feature = "fresco-wgpu")]
pub mod webgpu;

pub use backend::{BackendType, WindowSurface};
pub use device::{Device, RenderTarget, Shader, Texture};
pub use error::{GfxError, Result};
pub use types::{
    BlendFactor, BlendMode, BlendOp, BufferView, ComparisonFunc, CullMode, DepthMode,
    PipelineState, Sampler, Scissor, StencilMode, StencilOp, TextureAddress, Topology, Viewport,
};
pub use vertex::{
    AttributeFormat, HasVertexLayout, PositionColorTextureVertex, PositionColorVertex,
    PositionTextureNormalVertex, PositionTextureVertex, PositionVertex, Semantic, VertexAttribute,
    VertexLayout,
};
