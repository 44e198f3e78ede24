use std::fmt;

use crate::backend::BackendType;

/// Crate-wide error type. Every variant is fatal to the operation that
/// produced it; there is no retry policy anywhere in the engine.
#[derive(Debug)]
pub enum GfxError {
    /// The requested backend variant was not compiled into this build.
    BackendUnavailable(BackendType),
    /// A backend instance already exists in this process.
    BackendAlreadyActive,
    /// No physical device / adapter was suitable for the surface.
    NoSuitableAdapter,
    /// GLSL -> SPIR-V compilation failed.
    ShaderCompile(String),
    /// SPIR-V reflection could not recover the binding table.
    Reflect(&'static str),
    /// The two shader stages declare incompatible resources at one slot.
    BindingConflict { binding: u32 },
    /// `draw` was issued without the state it requires.
    MissingDrawState(&'static str),
    /// A caller-supplied value is outside what the contract allows.
    InvalidArgument(&'static str),
    /// Native object creation failed outside the shader pipeline.
    ResourceCreation(String),
    /// Handle did not resolve to a live resource.
    StaleHandle(&'static str),
    #[cfg(feature = "fresco-vulkan")]
    Vulkan(ash::vk::Result),
    #[cfg(feature = "fresco-vulkan")]
    Loading(ash::LoadingError),
}

/// Convenient crate-wide result type.
pub type Result<T, E = GfxError> = std::result::Result<T, E>;

impl fmt::Display for GfxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GfxError::BackendUnavailable(ty) => {
                write!(f, "backend {:?} was not compiled into this build", ty)
            }
            GfxError::BackendAlreadyActive => {
                write!(f, "a backend instance is already active in this process")
            }
            GfxError::NoSuitableAdapter => write!(f, "no suitable graphics adapter found"),
            GfxError::ShaderCompile(msg) => write!(f, "shader compilation failed: {}", msg),
            GfxError::Reflect(msg) => write!(f, "shader reflection failed: {}", msg),
            GfxError::BindingConflict { binding } => write!(
                f,
                "binding {} is declared with conflicting resource kinds across stages",
                binding
            ),
            GfxError::MissingDrawState(what) => {
                write!(f, "draw issued without required state: {}", what)
            }
            GfxError::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            GfxError::ResourceCreation(msg) => write!(f, "resource creation failed: {}", msg),
            GfxError::StaleHandle(what) => write!(f, "stale {} handle", what),
            #[cfg(feature = "fresco-vulkan")]
            GfxError::Vulkan(res) => write!(f, "vulkan error: {}", res),
            #[cfg(feature = "fresco-vulkan")]
            GfxError::Loading(err) => write!(f, "vulkan loader error: {}", err),
        }
    }
}

impl std::error::Error for GfxError {}

impl From<shaderc::Error> for GfxError {
    fn from(err: shaderc::Error) -> Self {
        GfxError::ShaderCompile(err.to_string())
    }
}

#[cfg(feature = "fresco-vulkan")]
impl From<ash::vk::Result> for GfxError {
    fn from(res: ash::vk::Result) -> Self {
        GfxError::Vulkan(res)
    }
}

#[cfg(feature = "fresco-vulkan")]
impl From<ash::LoadingError> for GfxError {
    fn from(err: ash::LoadingError) -> Self {
        GfxError::Loading(err)
    }
}

#[cfg(feature = "fresco-wgpu")]
impl From<wgpu::CreateSurfaceError> for GfxError {
    fn from(err: wgpu::CreateSurfaceError) -> Self {
        GfxError::ResourceCreation(err.to_string())
    }
}

#[cfg(feature = "fresco-wgpu")]
impl From<wgpu::RequestDeviceError> for GfxError {
    fn from(err: wgpu::RequestDeviceError) -> Self {
        GfxError::ResourceCreation(err.to_string())
    }
}
