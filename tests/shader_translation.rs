//! CPU-side tests of the shader translation layer: GLSL compilation,
//! location macro injection, and cross-stage binding merge. No GPU is
//! required; everything runs through shaderc and the reflection walker.

use fresco::shader::{compile, BindingKind, StageFlags};
use fresco::{
    AttributeFormat, GfxError, HasVertexLayout, PositionColorTextureVertex, PositionColorVertex,
    PositionTextureNormalVertex, Semantic, VertexAttribute, VertexLayout,
};

const PASSTHROUGH_FRAG: &str = r#"
    #version 450
    layout(location = 0) out vec4 oColor;
    void main() { oColor = vec4(1.0); }
"#;

#[test]
fn location_macros_follow_layout_order() {
    // The same source compiles against two layouts that place the
    // color attribute at different locations.
    let source = r#"
        #version 450
        layout(location = POSITION_LOCATION) in vec3 aPosition;
        layout(location = COLOR_LOCATION) in vec4 aColor;
        layout(location = 0) out vec4 vColor;
        void main() {
            gl_Position = vec4(aPosition, 1.0);
            vColor = aColor;
        }
    "#;

    compile(&PositionColorVertex::layout(), source, PASSTHROUGH_FRAG, &[]).unwrap();
    compile(
        &PositionColorTextureVertex::layout(),
        source,
        PASSTHROUGH_FRAG,
        &[],
    )
    .unwrap();

    // A layout without a color attribute leaves COLOR_LOCATION
    // undefined and the source must fail to compile.
    let err = compile(
        &PositionTextureNormalVertex::layout(),
        source,
        PASSTHROUGH_FRAG,
        &[],
    );
    assert!(matches!(err, Err(GfxError::ShaderCompile(_))));
}

#[test]
fn shared_uniform_reports_both_stages() {
    let vert = r#"
        #version 450
        layout(location = POSITION_LOCATION) in vec3 aPosition;
        layout(binding = 0) uniform Globals { mat4 mvp; vec4 tint; } uGlobals;
        void main() { gl_Position = uGlobals.mvp * vec4(aPosition, 1.0); }
    "#;
    let frag = r#"
        #version 450
        layout(binding = 0) uniform Globals { mat4 mvp; vec4 tint; } uGlobals;
        layout(location = 0) out vec4 oColor;
        void main() { oColor = uGlobals.tint; }
    "#;

    let layout = VertexLayout {
        stride: 12,
        attributes: vec![VertexAttribute {
            semantic: Semantic::Position,
            format: AttributeFormat::R32G32B32F,
            offset: 0,
        }],
    };
    let shader = compile(&layout, vert, frag, &[]).unwrap();

    assert_eq!(shader.bindings.len(), 1);
    assert_eq!(shader.bindings[0].binding, 0);
    assert_eq!(shader.bindings[0].kind, BindingKind::UniformBuffer);
    assert_eq!(
        shader.bindings[0].stages,
        StageFlags::VERTEX.union(StageFlags::FRAGMENT)
    );
}

#[test]
fn conflicting_binding_kinds_are_rejected() {
    // Slot 0 is a uniform buffer in the vertex stage and a combined
    // image sampler in the fragment stage.
    let vert = r#"
        #version 450
        layout(location = POSITION_LOCATION) in vec3 aPosition;
        layout(binding = 0) uniform Matrices { mat4 mvp; } uMatrices;
        void main() { gl_Position = uMatrices.mvp * vec4(aPosition, 1.0); }
    "#;
    let frag = r#"
        #version 450
        layout(binding = 0) uniform sampler2D uTexture;
        layout(location = 0) out vec4 oColor;
        void main() { oColor = texture(uTexture, vec2(0.5)); }
    "#;

    let layout = VertexLayout {
        stride: 12,
        attributes: vec![VertexAttribute {
            semantic: Semantic::Position,
            format: AttributeFormat::R32G32B32F,
            offset: 0,
        }],
    };
    let err = compile(&layout, vert, frag, &[]);
    assert!(matches!(err, Err(GfxError::BindingConflict { binding: 0 })));
}

#[test]
fn textures_and_uniforms_merge_sorted_by_slot() {
    let vert = r#"
        #version 450
        layout(location = POSITION_LOCATION) in vec3 aPosition;
        layout(location = TEXCOORD_LOCATION) in vec2 aTexCoord;
        layout(binding = 2) uniform Matrices { mat4 mvp; } uMatrices;
        layout(location = 0) out vec2 vTexCoord;
        void main() {
            gl_Position = uMatrices.mvp * vec4(aPosition, 1.0);
            vTexCoord = aTexCoord;
        }
    "#;
    let frag = r#"
        #version 450
        layout(binding = 0) uniform sampler2D uDiffuse;
        layout(binding = 1) uniform sampler2D uMask;
        layout(location = 0) in vec2 vTexCoord;
        layout(location = 0) out vec4 oColor;
        void main() {
            oColor = texture(uDiffuse, vTexCoord) * texture(uMask, vTexCoord).r;
        }
    "#;

    let shader = compile(&PositionColorTextureVertex::layout(), vert, frag, &[]).unwrap();

    let table: Vec<_> = shader
        .bindings
        .iter()
        .map(|b| (b.binding, b.kind))
        .collect();
    assert_eq!(
        table,
        vec![
            (0, BindingKind::CombinedImageSampler),
            (1, BindingKind::CombinedImageSampler),
            (2, BindingKind::UniformBuffer),
        ]
    );
    assert_eq!(shader.bindings[2].stages, StageFlags::VERTEX);
}

#[test]
fn flip_texcoord_define_toggles_preprocessor_branches() {
    let vert = r#"
        #version 450
        layout(location = POSITION_LOCATION) in vec3 aPosition;
        layout(location = TEXCOORD_LOCATION) in vec2 aTexCoord;
        layout(location = 0) out vec2 vTexCoord;
        void main() {
            gl_Position = vec4(aPosition, 1.0);
            vTexCoord = aTexCoord;
        #ifdef FLIP_TEXCOORD_Y
            vTexCoord.y = 1.0 - vTexCoord.y;
        #endif
        }
    "#;

    let layout = PositionColorTextureVertex::layout();
    let plain = compile(&layout, vert, PASSTHROUGH_FRAG, &[]).unwrap();
    let flipped = compile(&layout, vert, PASSTHROUGH_FRAG, &[("FLIP_TEXCOORD_Y", None)]).unwrap();

    // The extra arithmetic must leave a trace in the module.
    assert_ne!(plain.vertex_spirv, flipped.vertex_spirv);
}

#[test]
fn compiled_shader_carries_its_layout() {
    let vert = r#"
        #version 450
        layout(location = POSITION_LOCATION) in vec3 aPosition;
        void main() { gl_Position = vec4(aPosition, 1.0); }
    "#;
    let layout = PositionColorVertex::layout();
    let shader = compile(&layout, vert, PASSTHROUGH_FRAG, &[]).unwrap();
    assert_eq!(shader.layout, layout);
}
