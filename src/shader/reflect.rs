//! Minimal SPIR-V reflection, just enough to recover the descriptor
//! binding table of the modules this crate compiles itself: combined
//! image samplers and uniform blocks, all in descriptor set 0.

use crate::error::{GfxError, Result};

const SPIRV_MAGIC: u32 = 0x0723_0203;
const HEADER_WORDS: usize = 5;

const OP_TYPE_SAMPLED_IMAGE: u32 = 27;
const OP_TYPE_POINTER: u32 = 32;
const OP_VARIABLE: u32 = 59;
const OP_DECORATE: u32 = 71;

const DECORATION_BINDING: u32 = 33;

const STORAGE_CLASS_UNIFORM_CONSTANT: u32 = 0;
const STORAGE_CLASS_UNIFORM: u32 = 2;

/// Kind of resource a shader declares at a binding slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    CombinedImageSampler,
    UniformBuffer,
}

/// Which pipeline stages reference a binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct StageFlags(u8);

impl StageFlags {
    pub const VERTEX: StageFlags = StageFlags(1);
    pub const FRAGMENT: StageFlags = StageFlags(2);

    pub fn contains(&self, other: StageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: StageFlags) -> StageFlags {
        StageFlags(self.0 | other.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReflectedBinding {
    pub binding: u32,
    pub kind: BindingKind,
}

/// Binding annotated with the stages that declare it, produced by
/// [`merge_stage_bindings`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergedBinding {
    pub binding: u32,
    pub kind: BindingKind,
    pub stages: StageFlags,
}

/// Walks the module's instruction stream and lists its descriptor
/// bindings, sorted by slot.
pub fn reflect_bindings(spirv: &[u32]) -> Result<Vec<ReflectedBinding>> {
    if spirv.len() < HEADER_WORDS || spirv[0] != SPIRV_MAGIC {
        return Err(GfxError::Reflect("not a SPIR-V module"));
    }

    // id -> binding decoration
    let mut bindings = std::collections::HashMap::new();
    // sampled image type ids
    let mut sampled_image_types = std::collections::HashSet::new();
    // pointer type id -> (storage class, pointee type id)
    let mut pointers = std::collections::HashMap::new();
    // (variable id, pointer type id, storage class)
    let mut variables = Vec::new();

    let mut offset = HEADER_WORDS;
    while offset < spirv.len() {
        let word = spirv[offset];
        let word_count = (word >> 16) as usize;
        let opcode = word & 0xFFFF;
        if word_count == 0 || offset + word_count > spirv.len() {
            return Err(GfxError::Reflect("truncated instruction stream"));
        }
        let operands = &spirv[offset + 1..offset + word_count];

        match opcode {
            OP_DECORATE => {
                if operands.len() >= 3 && operands[1] == DECORATION_BINDING {
                    bindings.insert(operands[0], operands[2]);
                }
            }
            OP_TYPE_SAMPLED_IMAGE => {
                if !operands.is_empty() {
                    sampled_image_types.insert(operands[0]);
                }
            }
            OP_TYPE_POINTER => {
                if operands.len() >= 3 {
                    pointers.insert(operands[0], (operands[1], operands[2]));
                }
            }
            OP_VARIABLE => {
                if operands.len() >= 3 {
                    variables.push((operands[1], operands[0], operands[2]));
                }
            }
            _ => {}
        }
        offset += word_count;
    }

    let mut out = Vec::new();
    for (id, pointer_type, storage_class) in variables {
        let kind = match storage_class {
            STORAGE_CLASS_UNIFORM => BindingKind::UniformBuffer,
            STORAGE_CLASS_UNIFORM_CONSTANT => {
                let pointee = pointers.get(&pointer_type).map(|(_, p)| *p);
                match pointee {
                    Some(p) if sampled_image_types.contains(&p) => {
                        BindingKind::CombinedImageSampler
                    }
                    _ => continue,
                }
            }
            _ => continue,
        };
        let binding = *bindings
            .get(&id)
            .ok_or(GfxError::Reflect("resource variable lacks a binding"))?;
        out.push(ReflectedBinding { binding, kind });
    }

    out.sort_by_key(|b| b.binding);
    Ok(out)
}

/// Merges per-stage binding tables into the shader's combined layout.
/// A slot declared by both stages must agree on resource kind; its stage
/// mask becomes the union.
pub fn merge_stage_bindings(
    vertex: &[ReflectedBinding],
    fragment: &[ReflectedBinding],
) -> Result<Vec<MergedBinding>> {
    let mut merged: std::collections::BTreeMap<u32, MergedBinding> = Default::default();

    for (stage, stage_bindings) in [
        (StageFlags::VERTEX, vertex),
        (StageFlags::FRAGMENT, fragment),
    ] {
        for b in stage_bindings {
            match merged.get_mut(&b.binding) {
                Some(existing) => {
                    if existing.kind != b.kind {
                        return Err(GfxError::BindingConflict { binding: b.binding });
                    }
                    existing.stages = existing.stages.union(stage);
                }
                None => {
                    merged.insert(
                        b.binding,
                        MergedBinding {
                            binding: b.binding,
                            kind: b.kind,
                            stages: stage,
                        },
                    );
                }
            }
        }
    }

    Ok(merged.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use inline_spirv::inline_spirv;

    #[test]
    fn finds_uniform_blocks_and_samplers() {
        let spirv: &[u32] = inline_spirv!(
            r#"
            #version 450
            layout(binding = 0) uniform sampler2D uColor;
            layout(binding = 2) uniform Settings { vec4 tint; } uSettings;
            layout(location = 0) out vec4 oColor;
            layout(location = 0) in vec2 vTexCoord;
            void main() {
                oColor = texture(uColor, vTexCoord) * uSettings.tint;
            }
            "#,
            frag
        );

        let bindings = reflect_bindings(spirv).unwrap();
        assert_eq!(
            bindings,
            vec![
                ReflectedBinding {
                    binding: 0,
                    kind: BindingKind::CombinedImageSampler,
                },
                ReflectedBinding {
                    binding: 2,
                    kind: BindingKind::UniformBuffer,
                },
            ]
        );
    }

    #[test]
    fn ignores_plain_inputs_and_outputs() {
        let spirv: &[u32] = inline_spirv!(
            r#"
            #version 450
            layout(location = 0) in vec3 aPosition;
            void main() { gl_Position = vec4(aPosition, 1.0); }
            "#,
            vert
        );
        assert!(reflect_bindings(spirv).unwrap().is_empty());
    }

    #[test]
    fn rejects_garbage_words() {
        assert!(reflect_bindings(&[1, 2, 3]).is_err());
    }

    #[test]
    fn merge_unions_stage_masks() {
        let shared = ReflectedBinding {
            binding: 1,
            kind: BindingKind::UniformBuffer,
        };
        let frag_only = ReflectedBinding {
            binding: 0,
            kind: BindingKind::CombinedImageSampler,
        };

        let merged = merge_stage_bindings(&[shared], &[frag_only, shared]).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].binding, 0);
        assert_eq!(merged[0].stages, StageFlags::FRAGMENT);
        assert_eq!(merged[1].binding, 1);
        assert!(merged[1].stages.contains(StageFlags::VERTEX));
        assert!(merged[1].stages.contains(StageFlags::FRAGMENT));
    }

    #[test]
    fn merge_rejects_kind_conflicts() {
        let vert = ReflectedBinding {
            binding: 3,
            kind: BindingKind::UniformBuffer,
        };
        let frag = ReflectedBinding {
            binding: 3,
            kind: BindingKind::CombinedImageSampler,
        };
        assert!(matches!(
            merge_stage_bindings(&[vert], &[frag]),
            Err(GfxError::BindingConflict { binding: 3 })
        ));
    }
}
