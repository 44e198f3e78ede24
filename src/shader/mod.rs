//! GLSL -> SPIR-V translation and binding reflection, shared by every
//! engine. Backends receive ready-made SPIR-V plus a merged binding
//! table and only have to wrap it in their native module type.

mod reflect;

pub use reflect::{
    merge_stage_bindings, reflect_bindings, BindingKind, MergedBinding, ReflectedBinding,
    StageFlags,
};

use crate::error::{GfxError, Result};
use crate::vertex::VertexLayout;

/// Stage-agnostic defines an engine injects on top of the layout's
/// location macros. Vulkan-family engines add `FLIP_TEXCOORD_Y` here.
pub type ShaderDefine<'a> = (&'a str, Option<&'a str>);

/// Output of [`compile`]: both SPIR-V modules plus everything a backend
/// needs to build pipelines against them.
#[derive(Clone, Debug)]
pub struct CompiledShader {
    pub vertex_spirv: Vec<u32>,
    pub fragment_spirv: Vec<u32>,
    pub bindings: Vec<MergedBinding>,
    pub layout: VertexLayout,
}

/// Compiles a vertex/fragment GLSL pair against `layout`.
///
/// Attribute location macros (`POSITION_LOCATION` etc.) are injected
/// from the layout's attribute order, so shader sources stay portable
/// across vertex types. Both modules are reflected and their binding
/// tables merged; a slot declared with different resource kinds in the
/// two stages is an error.
pub fn compile(
    layout: &VertexLayout,
    vertex_source: &str,
    fragment_source: &str,
    extra_defines: &[ShaderDefine<'_>],
) -> Result<CompiledShader> {
    let compiler = shaderc::Compiler::new()
        .ok_or(GfxError::ShaderCompile("shaderc unavailable".to_string()))?;
    let mut options = shaderc::CompileOptions::new()
        .ok_or(GfxError::ShaderCompile("shaderc options unavailable".to_string()))?;
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_2 as u32,
    );

    for (name, location) in layout.location_defines() {
        options.add_macro_definition(name, Some(&location.to_string()));
    }
    for (name, value) in extra_defines {
        options.add_macro_definition(name, *value);
    }

    let vertex = compiler.compile_into_spirv(
        vertex_source,
        shaderc::ShaderKind::Vertex,
        "vertex",
        "main",
        Some(&options),
    )?;
    let fragment = compiler.compile_into_spirv(
        fragment_source,
        shaderc::ShaderKind::Fragment,
        "fragment",
        "main",
        Some(&options),
    )?;

    let vertex_spirv = vertex.as_binary().to_vec();
    let fragment_spirv = fragment.as_binary().to_vec();

    let vertex_bindings = reflect_bindings(&vertex_spirv)?;
    let fragment_bindings = reflect_bindings(&fragment_spirv)?;
    let bindings = merge_stage_bindings(&vertex_bindings, &fragment_bindings)?;

    Ok(CompiledShader {
        vertex_spirv,
        fragment_spirv,
        bindings,
        layout: layout.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vertex::{HasVertexLayout, PositionColorTextureVertex};

    const VERT: &str = r#"
        #version 450
        layout(location = POSITION_LOCATION) in vec3 aPosition;
        layout(location = COLOR_LOCATION) in vec4 aColor;
        layout(location = TEXCOORD_LOCATION) in vec2 aTexCoord;
        layout(binding = 1) uniform Matrices { mat4 mvp; } uMatrices;
        layout(location = 0) out vec4 vColor;
        layout(location = 1) out vec2 vTexCoord;
        void main() {
            gl_Position = uMatrices.mvp * vec4(aPosition, 1.0);
            vColor = aColor;
            vTexCoord = aTexCoord;
        #ifdef FLIP_TEXCOORD_Y
            vTexCoord.y = 1.0 - vTexCoord.y;
        #endif
        }
    "#;

    const FRAG: &str = r#"
        #version 450
        layout(binding = 0) uniform sampler2D uColorTexture;
        layout(location = 0) in vec4 vColor;
        layout(location = 1) in vec2 vTexCoord;
        layout(location = 0) out vec4 oColor;
        void main() {
            oColor = texture(uColorTexture, vTexCoord) * vColor;
        }
    "#;

    #[test]
    fn compiles_and_merges_bindings() {
        let layout = PositionColorTextureVertex::layout();
        let shader = compile(&layout, VERT, FRAG, &[]).unwrap();

        assert!(!shader.vertex_spirv.is_empty());
        assert!(!shader.fragment_spirv.is_empty());

        assert_eq!(shader.bindings.len(), 2);
        assert_eq!(shader.bindings[0].binding, 0);
        assert_eq!(shader.bindings[0].kind, BindingKind::CombinedImageSampler);
        assert_eq!(shader.bindings[0].stages, StageFlags::FRAGMENT);
        assert_eq!(shader.bindings[1].binding, 1);
        assert_eq!(shader.bindings[1].kind, BindingKind::UniformBuffer);
        assert_eq!(shader.bindings[1].stages, StageFlags::VERTEX);
    }

    #[test]
    fn extra_defines_reach_the_preprocessor() {
        let layout = PositionColorTextureVertex::layout();
        // FLIP_TEXCOORD_Y only has to preprocess cleanly; behavior is a
        // GPU-side concern.
        compile(&layout, VERT, FRAG, &[("FLIP_TEXCOORD_Y", None)]).unwrap();
    }

    #[test]
    fn reports_compile_errors() {
        let layout = PositionColorTextureVertex::layout();
        let err = compile(&layout, "#version 450\nvoid main() { bogus; }", FRAG, &[]);
        assert!(matches!(err, Err(GfxError::ShaderCompile(_))));
    }
}
