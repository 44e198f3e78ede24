//! Conversions from the crate's fixed-function enums to wgpu's.

use crate::error::{GfxError, Result};
use crate::shader::StageFlags;
use crate::types::{
    BlendFactor, BlendMode, BlendOp, ComparisonFunc, CullMode, Sampler, StencilMode, StencilOp,
    TextureAddress, Topology,
};
use crate::vertex::AttributeFormat;

impl From<Topology> for wgpu::PrimitiveTopology {
    fn from(value: Topology) -> Self {
        match value {
            Topology::PointList => wgpu::PrimitiveTopology::PointList,
            Topology::LineList => wgpu::PrimitiveTopology::LineList,
            Topology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
            Topology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
            Topology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        }
    }
}

impl From<CullMode> for Option<wgpu::Face> {
    fn from(value: CullMode) -> Self {
        match value {
            CullMode::None => None,
            CullMode::Front => Some(wgpu::Face::Front),
            CullMode::Back => Some(wgpu::Face::Back),
        }
    }
}

impl From<ComparisonFunc> for wgpu::CompareFunction {
    fn from(value: ComparisonFunc) -> Self {
        match value {
            ComparisonFunc::Always => wgpu::CompareFunction::Always,
            ComparisonFunc::Never => wgpu::CompareFunction::Never,
            ComparisonFunc::Less => wgpu::CompareFunction::Less,
            ComparisonFunc::Equal => wgpu::CompareFunction::Equal,
            ComparisonFunc::NotEqual => wgpu::CompareFunction::NotEqual,
            ComparisonFunc::LessEqual => wgpu::CompareFunction::LessEqual,
            ComparisonFunc::Greater => wgpu::CompareFunction::Greater,
            ComparisonFunc::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        }
    }
}

impl From<BlendFactor> for wgpu::BlendFactor {
    fn from(value: BlendFactor) -> Self {
        match value {
            BlendFactor::One => wgpu::BlendFactor::One,
            BlendFactor::Zero => wgpu::BlendFactor::Zero,
            BlendFactor::SrcColor => wgpu::BlendFactor::Src,
            BlendFactor::InvSrcColor => wgpu::BlendFactor::OneMinusSrc,
            BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
            BlendFactor::InvSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
            BlendFactor::DstColor => wgpu::BlendFactor::Dst,
            BlendFactor::InvDstColor => wgpu::BlendFactor::OneMinusDst,
            BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
            BlendFactor::InvDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        }
    }
}

impl From<BlendOp> for wgpu::BlendOperation {
    fn from(value: BlendOp) -> Self {
        match value {
            BlendOp::Add => wgpu::BlendOperation::Add,
            BlendOp::Subtract => wgpu::BlendOperation::Subtract,
            BlendOp::InvSubtract => wgpu::BlendOperation::ReverseSubtract,
            BlendOp::Min => wgpu::BlendOperation::Min,
            BlendOp::Max => wgpu::BlendOperation::Max,
        }
    }
}

impl From<BlendMode> for wgpu::BlendState {
    fn from(value: BlendMode) -> Self {
        wgpu::BlendState {
            color: wgpu::BlendComponent {
                src_factor: value.color_src.into(),
                dst_factor: value.color_dst.into(),
                operation: value.color_op.into(),
            },
            alpha: wgpu::BlendComponent {
                src_factor: value.alpha_src.into(),
                dst_factor: value.alpha_dst.into(),
                operation: value.alpha_op.into(),
            },
        }
    }
}

impl From<StencilOp> for wgpu::StencilOperation {
    fn from(value: StencilOp) -> Self {
        match value {
            StencilOp::Keep => wgpu::StencilOperation::Keep,
            StencilOp::Zero => wgpu::StencilOperation::Zero,
            StencilOp::Replace => wgpu::StencilOperation::Replace,
            StencilOp::IncrementSaturation => wgpu::StencilOperation::IncrementClamp,
            StencilOp::DecrementSaturation => wgpu::StencilOperation::DecrementClamp,
            StencilOp::Invert => wgpu::StencilOperation::Invert,
            StencilOp::Increment => wgpu::StencilOperation::IncrementWrap,
            StencilOp::Decrement => wgpu::StencilOperation::DecrementWrap,
        }
    }
}

impl From<StencilMode> for wgpu::StencilFaceState {
    fn from(value: StencilMode) -> Self {
        if !value.enabled {
            return wgpu::StencilFaceState::IGNORE;
        }
        wgpu::StencilFaceState {
            compare: value.func.into(),
            fail_op: value.fail_op.into(),
            depth_fail_op: value.depth_fail_op.into(),
            pass_op: value.pass_op.into(),
        }
    }
}

/// wgpu has no three-channel byte vertex format, so that one attribute
/// layout is rejected rather than silently padded.
pub(super) fn vertex_format(value: AttributeFormat) -> Result<wgpu::VertexFormat> {
    match value {
        AttributeFormat::R32F => Ok(wgpu::VertexFormat::Float32),
        AttributeFormat::R32G32F => Ok(wgpu::VertexFormat::Float32x2),
        AttributeFormat::R32G32B32F => Ok(wgpu::VertexFormat::Float32x3),
        AttributeFormat::R32G32B32A32F => Ok(wgpu::VertexFormat::Float32x4),
        AttributeFormat::R8UN => Ok(wgpu::VertexFormat::Unorm8),
        AttributeFormat::R8G8UN => Ok(wgpu::VertexFormat::Unorm8x2),
        AttributeFormat::R8G8B8UN => Err(GfxError::InvalidArgument(
            "three-channel byte vertex attributes are not supported on this backend",
        )),
        AttributeFormat::R8G8B8A8UN => Ok(wgpu::VertexFormat::Unorm8x4),
    }
}

impl From<Sampler> for wgpu::FilterMode {
    fn from(value: Sampler) -> Self {
        match value {
            Sampler::Linear => wgpu::FilterMode::Linear,
            Sampler::Nearest => wgpu::FilterMode::Nearest,
        }
    }
}

impl From<TextureAddress> for wgpu::AddressMode {
    fn from(value: TextureAddress) -> Self {
        match value {
            TextureAddress::Wrap => wgpu::AddressMode::Repeat,
            TextureAddress::Clamp => wgpu::AddressMode::ClampToEdge,
            TextureAddress::MirrorWrap => wgpu::AddressMode::MirrorRepeat,
        }
    }
}

impl From<StageFlags> for wgpu::ShaderStages {
    fn from(value: StageFlags) -> Self {
        let mut out = wgpu::ShaderStages::NONE;
        if value.contains(StageFlags::VERTEX) {
            out |= wgpu::ShaderStages::VERTEX;
        }
        if value.contains(StageFlags::FRAGMENT) {
            out |= wgpu::ShaderStages::FRAGMENT;
        }
        out
    }
}
