use glam::Vec2;

/// Primitive assembly topology, buffered until the next draw.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Topology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ComparisonFunc {
    #[default]
    Always,
    Never,
    Less,
    Equal,
    NotEqual,
    LessEqual,
    Greater,
    GreaterEqual,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendFactor {
    One,
    Zero,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DstColor,
    InvDstColor,
    DstAlpha,
    InvDstAlpha,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    InvSubtract,
    Min,
    Max,
}

/// Fixed-function blend equation, one for color and one for alpha.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlendMode {
    pub color_src: BlendFactor,
    pub color_dst: BlendFactor,
    pub color_op: BlendOp,
    pub alpha_src: BlendFactor,
    pub alpha_dst: BlendFactor,
    pub alpha_op: BlendOp,
}

impl BlendMode {
    /// Same factor pair for the color and alpha channels.
    pub fn new(src: BlendFactor, dst: BlendFactor) -> Self {
        Self {
            color_src: src,
            color_dst: dst,
            color_op: BlendOp::Add,
            alpha_src: src,
            alpha_dst: dst,
            alpha_op: BlendOp::Add,
        }
    }

    pub const ALPHA_BLEND: BlendMode = BlendMode {
        color_src: BlendFactor::SrcAlpha,
        color_dst: BlendFactor::InvSrcAlpha,
        color_op: BlendOp::Add,
        alpha_src: BlendFactor::One,
        alpha_dst: BlendFactor::InvSrcAlpha,
        alpha_op: BlendOp::Add,
    };

    pub const ADDITIVE: BlendMode = BlendMode {
        color_src: BlendFactor::SrcAlpha,
        color_dst: BlendFactor::One,
        color_op: BlendOp::Add,
        alpha_src: BlendFactor::One,
        alpha_dst: BlendFactor::One,
        alpha_op: BlendOp::Add,
    };
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthMode {
    pub enabled: bool,
    pub func: ComparisonFunc,
}

impl Default for DepthMode {
    fn default() -> Self {
        Self {
            enabled: false,
            func: ComparisonFunc::Always,
        }
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrementSaturation,
    DecrementSaturation,
    Invert,
    Increment,
    Decrement,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
pub struct StencilMode {
    pub enabled: bool,
    pub read_mask: u8,
    pub write_mask: u8,
    pub fail_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub func: ComparisonFunc,
    pub reference: u8,
}

impl Default for StencilMode {
    fn default() -> Self {
        Self {
            enabled: false,
            read_mask: 0xFF,
            write_mask: 0xFF,
            fail_op: StencilOp::Keep,
            depth_fail_op: StencilOp::Keep,
            pass_op: StencilOp::Keep,
            func: ComparisonFunc::Always,
            reference: 0,
        }
    }
}

/// Texture filtering of the implicit sampler used for all texture slots.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Sampler {
    #[default]
    Linear,
    Nearest,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TextureAddress {
    #[default]
    Wrap,
    Clamp,
    MirrorWrap,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub position: Vec2,
    pub size: Vec2,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            position: Vec2::ZERO,
            size: Vec2::new(width as f32, height as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Scissor {
    pub position: Vec2,
    pub size: Vec2,
}

/// Every fixed-function toggle a draw depends on, in one variant-agnostic
/// value. Engines that can set a field per-draw do so; engines whose native
/// pipeline model bakes a field fold this value into their pipeline cache
/// key. Either way two backends given the same `PipelineState` must produce
/// the same picture.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PipelineState {
    pub topology: Topology,
    pub cull_mode: CullMode,
    pub blend: Option<BlendMode>,
    pub depth: Option<DepthMode>,
    pub stencil: Option<StencilMode>,
}

/// Borrowed caller bytes plus element stride. Valid only for the duration
/// of the call that receives it; backends copy it into pooled storage
/// before returning.
#[derive(Clone, Copy, Debug)]
pub struct BufferView<'a> {
    pub data: &'a [u8],
    pub stride: usize,
}

impl<'a> BufferView<'a> {
    pub fn of<T: bytemuck::Pod>(elements: &'a [T]) -> Self {
        Self {
            data: bytemuck::cast_slice(elements),
            stride: std::mem::size_of::<T>(),
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.data.len()
    }
}
