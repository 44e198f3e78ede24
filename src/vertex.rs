use bytemuck::{Pod, Zeroable};

/// Role of a vertex attribute. Shader sources reference attributes by
/// semantic through the injected `*_LOCATION` macros rather than by
/// hard-coded location numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Semantic {
    Position,
    Color,
    TexCoord,
    Normal,
}

impl Semantic {
    /// Macro name injected into GLSL sources for this semantic.
    pub fn location_define(&self) -> &'static str {
        match self {
            Semantic::Position => "POSITION_LOCATION",
            Semantic::Color => "COLOR_LOCATION",
            Semantic::TexCoord => "TEXCOORD_LOCATION",
            Semantic::Normal => "NORMAL_LOCATION",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttributeFormat {
    R32F,
    R32G32F,
    R32G32B32F,
    R32G32B32A32F,
    R8UN,
    R8G8UN,
    R8G8B8UN,
    R8G8B8A8UN,
}

impl AttributeFormat {
    pub fn size_bytes(&self) -> usize {
        match self {
            AttributeFormat::R32F => 4,
            AttributeFormat::R32G32F => 8,
            AttributeFormat::R32G32B32F => 12,
            AttributeFormat::R32G32B32A32F => 16,
            AttributeFormat::R8UN => 1,
            AttributeFormat::R8G8UN => 2,
            AttributeFormat::R8G8B8UN => 3,
            AttributeFormat::R8G8B8A8UN => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub semantic: Semantic,
    pub format: AttributeFormat,
    pub offset: usize,
}

/// Describes one interleaved vertex buffer. Attribute order defines the
/// shader locations: attribute `i` lands at `location = i`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub stride: usize,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// `(macro name, location)` pairs to inject when compiling shaders
    /// against this layout.
    pub fn location_defines(&self) -> Vec<(&'static str, u32)> {
        self.attributes
            .iter()
            .enumerate()
            .map(|(i, attr)| (attr.semantic.location_define(), i as u32))
            .collect()
    }
}

/// Implemented by the predefined vertex structs so a typed slice can be
/// handed straight to `set_vertex_buffer`.
pub trait HasVertexLayout: Pod {
    fn layout() -> VertexLayout;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PositionVertex {
    pub pos: [f32; 3],
}

impl HasVertexLayout for PositionVertex {
    fn layout() -> VertexLayout {
        VertexLayout {
            stride: std::mem::size_of::<Self>(),
            attributes: vec![VertexAttribute {
                semantic: Semantic::Position,
                format: AttributeFormat::R32G32B32F,
                offset: 0,
            }],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PositionColorVertex {
    pub pos: [f32; 3],
    pub color: [f32; 4],
}

impl HasVertexLayout for PositionColorVertex {
    fn layout() -> VertexLayout {
        VertexLayout {
            stride: std::mem::size_of::<Self>(),
            attributes: vec![
                VertexAttribute {
                    semantic: Semantic::Position,
                    format: AttributeFormat::R32G32B32F,
                    offset: 0,
                },
                VertexAttribute {
                    semantic: Semantic::Color,
                    format: AttributeFormat::R32G32B32A32F,
                    offset: 12,
                },
            ],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PositionTextureVertex {
    pub pos: [f32; 3],
    pub texcoord: [f32; 2],
}

impl HasVertexLayout for PositionTextureVertex {
    fn layout() -> VertexLayout {
        VertexLayout {
            stride: std::mem::size_of::<Self>(),
            attributes: vec![
                VertexAttribute {
                    semantic: Semantic::Position,
                    format: AttributeFormat::R32G32B32F,
                    offset: 0,
                },
                VertexAttribute {
                    semantic: Semantic::TexCoord,
                    format: AttributeFormat::R32G32F,
                    offset: 12,
                },
            ],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PositionColorTextureVertex {
    pub pos: [f32; 3],
    pub color: [f32; 4],
    pub texcoord: [f32; 2],
}

impl HasVertexLayout for PositionColorTextureVertex {
    fn layout() -> VertexLayout {
        VertexLayout {
            stride: std::mem::size_of::<Self>(),
            attributes: vec![
                VertexAttribute {
                    semantic: Semantic::Position,
                    format: AttributeFormat::R32G32B32F,
                    offset: 0,
                },
                VertexAttribute {
                    semantic: Semantic::Color,
                    format: AttributeFormat::R32G32B32A32F,
                    offset: 12,
                },
                VertexAttribute {
                    semantic: Semantic::TexCoord,
                    format: AttributeFormat::R32G32F,
                    offset: 28,
                },
            ],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct PositionTextureNormalVertex {
    pub pos: [f32; 3],
    pub texcoord: [f32; 2],
    pub normal: [f32; 3],
}

impl HasVertexLayout for PositionTextureNormalVertex {
    fn layout() -> VertexLayout {
        VertexLayout {
            stride: std::mem::size_of::<Self>(),
            attributes: vec![
                VertexAttribute {
                    semantic: Semantic::Position,
                    format: AttributeFormat::R32G32B32F,
                    offset: 0,
                },
                VertexAttribute {
                    semantic: Semantic::TexCoord,
                    format: AttributeFormat::R32G32F,
                    offset: 12,
                },
                VertexAttribute {
                    semantic: Semantic::Normal,
                    format: AttributeFormat::R32G32B32F,
                    offset: 20,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_offsets_cover_the_stride() {
        let layout = PositionColorTextureVertex::layout();
        assert_eq!(layout.stride, 36);
        let last = layout.attributes.last().unwrap();
        assert_eq!(last.offset + last.format.size_bytes(), layout.stride);
    }

    #[test]
    fn location_defines_follow_attribute_order() {
        let layout = PositionTextureNormalVertex::layout();
        assert_eq!(
            layout.location_defines(),
            vec![
                ("POSITION_LOCATION", 0),
                ("TEXCOORD_LOCATION", 1),
                ("NORMAL_LOCATION", 2),
            ]
        );
    }
}
