//! Conversions from the crate's fixed-function enums to their Vulkan
//! counterparts. Exhaustive matches, so adding a variant upstream fails
//! to compile until it is mapped here.

use ash::vk;

use crate::shader::{BindingKind, StageFlags};
use crate::types::{
    BlendFactor, BlendOp, ComparisonFunc, CullMode, Sampler, StencilOp, TextureAddress, Topology,
};
use crate::vertex::AttributeFormat;

impl From<Topology> for vk::PrimitiveTopology {
    fn from(value: Topology) -> Self {
        match value {
            Topology::PointList => vk::PrimitiveTopology::POINT_LIST,
            Topology::LineList => vk::PrimitiveTopology::LINE_LIST,
            Topology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        }
    }
}

/// Pipelines are created with the class representative; the exact
/// topology is set dynamically at draw.
pub(super) fn topology_class(value: Topology) -> vk::PrimitiveTopology {
    match value {
        Topology::PointList => vk::PrimitiveTopology::POINT_LIST,
        Topology::LineList | Topology::LineStrip => vk::PrimitiveTopology::LINE_LIST,
        Topology::TriangleList | Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_LIST,
    }
}

impl From<CullMode> for vk::CullModeFlags {
    fn from(value: CullMode) -> Self {
        match value {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
        }
    }
}

impl From<ComparisonFunc> for vk::CompareOp {
    fn from(value: ComparisonFunc) -> Self {
        match value {
            ComparisonFunc::Always => vk::CompareOp::ALWAYS,
            ComparisonFunc::Never => vk::CompareOp::NEVER,
            ComparisonFunc::Less => vk::CompareOp::LESS,
            ComparisonFunc::Equal => vk::CompareOp::EQUAL,
            ComparisonFunc::NotEqual => vk::CompareOp::NOT_EQUAL,
            ComparisonFunc::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
            ComparisonFunc::Greater => vk::CompareOp::GREATER,
            ComparisonFunc::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        }
    }
}

impl From<BlendFactor> for vk::BlendFactor {
    fn from(value: BlendFactor) -> Self {
        match value {
            BlendFactor::One => vk::BlendFactor::ONE,
            BlendFactor::Zero => vk::BlendFactor::ZERO,
            BlendFactor::SrcColor => vk::BlendFactor::SRC_COLOR,
            BlendFactor::InvSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
            BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
            BlendFactor::InvSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            BlendFactor::DstColor => vk::BlendFactor::DST_COLOR,
            BlendFactor::InvDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
            BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
            BlendFactor::InvDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        }
    }
}

impl From<BlendOp> for vk::BlendOp {
    fn from(value: BlendOp) -> Self {
        match value {
            BlendOp::Add => vk::BlendOp::ADD,
            BlendOp::Subtract => vk::BlendOp::SUBTRACT,
            BlendOp::InvSubtract => vk::BlendOp::REVERSE_SUBTRACT,
            BlendOp::Min => vk::BlendOp::MIN,
            BlendOp::Max => vk::BlendOp::MAX,
        }
    }
}

impl From<StencilOp> for vk::StencilOp {
    fn from(value: StencilOp) -> Self {
        match value {
            StencilOp::Keep => vk::StencilOp::KEEP,
            StencilOp::Zero => vk::StencilOp::ZERO,
            StencilOp::Replace => vk::StencilOp::REPLACE,
            StencilOp::IncrementSaturation => vk::StencilOp::INCREMENT_AND_CLAMP,
            StencilOp::DecrementSaturation => vk::StencilOp::DECREMENT_AND_CLAMP,
            StencilOp::Invert => vk::StencilOp::INVERT,
            StencilOp::Increment => vk::StencilOp::INCREMENT_AND_WRAP,
            StencilOp::Decrement => vk::StencilOp::DECREMENT_AND_WRAP,
        }
    }
}

impl From<AttributeFormat> for vk::Format {
    fn from(value: AttributeFormat) -> Self {
        match value {
            AttributeFormat::R32F => vk::Format::R32_SFLOAT,
            AttributeFormat::R32G32F => vk::Format::R32G32_SFLOAT,
            AttributeFormat::R32G32B32F => vk::Format::R32G32B32_SFLOAT,
            AttributeFormat::R32G32B32A32F => vk::Format::R32G32B32A32_SFLOAT,
            AttributeFormat::R8UN => vk::Format::R8_UNORM,
            AttributeFormat::R8G8UN => vk::Format::R8G8_UNORM,
            AttributeFormat::R8G8B8UN => vk::Format::R8G8B8_UNORM,
            AttributeFormat::R8G8B8A8UN => vk::Format::R8G8B8A8_UNORM,
        }
    }
}

impl From<Sampler> for vk::Filter {
    fn from(value: Sampler) -> Self {
        match value {
            Sampler::Linear => vk::Filter::LINEAR,
            Sampler::Nearest => vk::Filter::NEAREST,
        }
    }
}

impl From<TextureAddress> for vk::SamplerAddressMode {
    fn from(value: TextureAddress) -> Self {
        match value {
            TextureAddress::Wrap => vk::SamplerAddressMode::REPEAT,
            TextureAddress::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            TextureAddress::MirrorWrap => vk::SamplerAddressMode::MIRRORED_REPEAT,
        }
    }
}

impl From<StageFlags> for vk::ShaderStageFlags {
    fn from(value: StageFlags) -> Self {
        let mut out = vk::ShaderStageFlags::empty();
        if value.contains(StageFlags::VERTEX) {
            out |= vk::ShaderStageFlags::VERTEX;
        }
        if value.contains(StageFlags::FRAGMENT) {
            out |= vk::ShaderStageFlags::FRAGMENT;
        }
        out
    }
}

impl From<BindingKind> for vk::DescriptorType {
    fn from(value: BindingKind) -> Self {
        match value {
            BindingKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        }
    }
}
