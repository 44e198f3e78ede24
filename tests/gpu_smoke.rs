//! End-to-end smoke test against a live GPU. Runs only with
//! `--features fresco-gpu-tests` since CI machines rarely have a
//! display; everything lives in one test because the process can hold
//! only one window event loop and one device at a time.
#![cfg(feature = "fresco-gpu-tests")]

use bytemuck::{Pod, Zeroable};
use glam::{IVec2, Vec4};
use serial_test::serial;
use winit::event_loop::EventLoop;
use winit::raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::Window;

use fresco::{
    BackendType, BlendMode, ComparisonFunc, DepthMode, Device, HasVertexLayout,
    PositionColorVertex, PositionTextureVertex, WindowSurface,
};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Matrices {
    mvp: [[f32; 4]; 4],
}

const IDENTITY: Matrices = Matrices {
    mvp: [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ],
};

const COLOR_VERT: &str = r#"
    #version 450
    layout(location = POSITION_LOCATION) in vec3 aPosition;
    layout(location = COLOR_LOCATION) in vec4 aColor;
    layout(binding = 0) uniform Matrices { mat4 mvp; } uMatrices;
    layout(location = 0) out vec4 vColor;
    void main() {
        gl_Position = uMatrices.mvp * vec4(aPosition, 1.0);
        vColor = aColor;
    }
"#;

const COLOR_FRAG: &str = r#"
    #version 450
    layout(location = 0) in vec4 vColor;
    layout(location = 0) out vec4 oColor;
    void main() { oColor = vColor; }
"#;

const TEXTURE_VERT: &str = r#"
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

const TEXTURE_FRAG: &str = r#"
    #version 450
    layout(binding = 0) uniform sampler2D uColorTexture;
    layout(location = 0) in vec2 vTexCoord;
    layout(location = 0) out vec4 oColor;
    void main() { oColor = texture(uColorTexture, vTexCoord); }
"#;

fn triangle(z: f32, color: [f32; 4]) -> [PositionColorVertex; 3] {
    [
        PositionColorVertex {
            pos: [-0.5, -0.5, z],
            color,
        },
        PositionColorVertex {
            pos: [0.5, -0.5, z],
            color,
        },
        PositionColorVertex {
            pos: [0.0, 0.5, z],
            color,
        },
    ]
}

fn fullscreen_quad() -> ([PositionTextureVertex; 4], [u16; 6]) {
    let vertices = [
        PositionTextureVertex {
            pos: [-1.0, -1.0, 0.0],
            texcoord: [0.0, 0.0],
        },
        PositionTextureVertex {
            pos: [1.0, -1.0, 0.0],
            texcoord: [1.0, 0.0],
        },
        PositionTextureVertex {
            pos: [1.0, 1.0, 0.0],
            texcoord: [1.0, 1.0],
        },
        PositionTextureVertex {
            pos: [-1.0, 1.0, 0.0],
            texcoord: [0.0, 1.0],
        },
    ];
    (vertices, [0, 1, 2, 2, 3, 0])
}

fn backend_type() -> BackendType {
    if cfg!(feature = "fresco-vulkan") {
        BackendType::Vulkan
    } else {
        BackendType::WebGpu
    }
}

#[test]
#[serial]
fn full_frame_smoke() {
    let _ = env_logger::builder().is_test(true).try_init();

    let event_loop = EventLoop::new().expect("event loop");
    #[allow(deprecated)]
    let window = event_loop
        .create_window(
            Window::default_attributes()
                .with_inner_size(winit::dpi::PhysicalSize::new(WIDTH, HEIGHT)),
        )
        .expect("window");

    let surface = WindowSurface {
        window: window.window_handle().expect("window handle").as_raw(),
        display: window.display_handle().expect("display handle").as_raw(),
        width: WIDTH,
        height: HEIGHT,
    };
    let device = Device::new(backend_type(), surface).expect("device");

    // Bare clears through a few frames.
    for color in [Vec4::new(1.0, 0.0, 0.0, 1.0), Vec4::ZERO, Vec4::ONE] {
        device.clear(Some(color), Some(1.0), Some(0)).unwrap();
        device.present().unwrap();
    }

    // Depth-tested triangles: the far green one is drawn second and
    // must lose the depth test against the near red one.
    let color_shader = device
        .create_shader(&PositionColorVertex::layout(), COLOR_VERT, COLOR_FRAG)
        .expect("color shader");
    device
        .clear(Some(Vec4::new(0.1, 0.1, 0.1, 1.0)), Some(1.0), Some(0))
        .unwrap();
    device.set_shader(&color_shader);
    device.set_depth_mode(Some(DepthMode {
        enabled: true,
        func: ComparisonFunc::Less,
    }));
    device.set_uniform_buffer(0, &IDENTITY).unwrap();
    device
        .set_vertex_buffer(&triangle(0.2, [1.0, 0.0, 0.0, 1.0]))
        .unwrap();
    device.draw(3, 0).unwrap();
    device
        .set_vertex_buffer(&triangle(0.8, [0.0, 1.0, 0.0, 1.0]))
        .unwrap();
    device.draw(3, 0).unwrap();
    device.set_depth_mode(None);
    device.present().unwrap();

    // Offscreen pass: clear the target to exact white, blend a triangle
    // into its middle, and snapshot the untouched corner before the
    // backbuffer is rebound. Once presented, every downloaded snapshot
    // pixel must hold the clear color. White and the 0/255 components
    // below survive any channel order the surface format dictates.
    let target = device.create_render_target(256, 256).expect("render target");
    let snapshot = device.create_texture(64, 64, 4, None, false).expect("snapshot");
    let texture_shader = device
        .create_shader(&PositionTextureVertex::layout(), TEXTURE_VERT, TEXTURE_FRAG)
        .expect("texture shader");

    device.set_render_target(Some(&target)).unwrap();
    device.clear(Some(Vec4::ONE), Some(1.0), Some(0)).unwrap();
    device.set_shader(&color_shader);
    device.set_blend_mode(Some(BlendMode::ALPHA_BLEND));
    device.set_uniform_buffer(0, &IDENTITY).unwrap();
    device
        .set_vertex_buffer(&triangle(0.5, [1.0, 1.0, 0.0, 0.5]))
        .unwrap();
    device.draw(3, 0).unwrap();
    device.set_blend_mode(None);
    device
        .read_pixels(IVec2::new(0, 0), IVec2::new(64, 64), &snapshot)
        .unwrap();
    device.set_render_target(None).unwrap();

    device
        .clear(Some(Vec4::new(0.0, 0.0, 0.0, 1.0)), Some(1.0), Some(0))
        .unwrap();
    device.set_shader(&texture_shader);
    device.set_texture(0, &target).unwrap();
    let (quad, indices) = fullscreen_quad();
    device.set_vertex_buffer(&quad).unwrap();
    device.set_index_buffer_u16(&indices).unwrap();
    device.draw_indexed(6, 0).unwrap();
    device.present().unwrap();

    let pixels = device.read_texture(&snapshot).expect("snapshot download");
    assert_eq!(pixels.len(), 64 * 64 * 4);
    assert!(
        pixels.iter().all(|&b| b == 255),
        "snapshot of the cleared corner must be solid white"
    );

    // The near green triangle must win the depth test at the target's
    // center no matter which order the two triangles are submitted in.
    let near_green = triangle(0.2, [0.0, 1.0, 0.0, 1.0]);
    let far_red = triangle(0.8, [1.0, 0.0, 0.0, 1.0]);
    for pair in [[near_green, far_red], [far_red, near_green]] {
        device.set_render_target(Some(&target)).unwrap();
        device
            .clear(Some(Vec4::new(0.0, 0.0, 0.0, 1.0)), Some(1.0), Some(0))
            .unwrap();
        device.set_shader(&color_shader);
        device.set_depth_mode(Some(DepthMode {
            enabled: true,
            func: ComparisonFunc::Less,
        }));
        device.set_uniform_buffer(0, &IDENTITY).unwrap();
        for tri in pair {
            device.set_vertex_buffer(&tri).unwrap();
            device.draw(3, 0).unwrap();
        }
        device.set_depth_mode(None);
        device.set_render_target(None).unwrap();
        device
            .clear(Some(Vec4::new(0.0, 0.0, 0.0, 1.0)), Some(1.0), Some(0))
            .unwrap();
        device.present().unwrap();

        let pixels = device.read_texture(&target).expect("target download");
        let center = (128 * 256 + 128) * 4;
        assert_eq!(
            &pixels[center..center + 4],
            &[0, 255, 0, 255],
            "near triangle must shade the center regardless of draw order"
        );
    }

    // RGB uploads widen to opaque RGBA, with a full mip chain.
    let rgb: Vec<u8> = (0..4 * 4 * 3).map(|i| (i * 5) as u8).collect();
    let rgb_texture = device
        .create_texture(4, 4, 3, Some(&rgb), true)
        .expect("rgb texture");
    let texels = device.read_texture(&rgb_texture).expect("rgb download");
    assert_eq!(texels.len(), 4 * 4 * 4);
    for (texel, src) in texels.chunks_exact(4).zip(rgb.chunks_exact(3)) {
        assert_eq!(&texel[..3], src);
        assert_eq!(texel[3], 255);
    }
    assert!(device.create_texture(4, 4, 2, None, false).is_err());

    // Surface churn: resize and vsync changes survive another frame.
    device.resize(800, 600).unwrap();
    device.set_vsync(false).unwrap();
    device
        .clear(Some(Vec4::new(0.2, 0.0, 0.2, 1.0)), Some(1.0), Some(0))
        .unwrap();
    device.present().unwrap();

    // A second device in the same process must be refused.
    assert!(matches!(
        Device::new(backend_type(), surface),
        Err(fresco::GfxError::BackendAlreadyActive)
    ));
}
