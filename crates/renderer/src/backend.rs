//! Graphics backend contract consumed by the engine.
//!
//! Everything the engine needs from a graphics API fits in [`Backend`]:
//! off-screen targets, stage compilation with file/line diagnostics,
//! program linking with uniform reflection, a full-screen quad draw and a
//! split (begin/finish) pixel readback. Environments only ever see the
//! narrower [`TextureStore`].

use std::collections::BTreeMap;
use std::fmt;

use crate::compile::{CompileError, LinkError};
use crate::glsl::UniformTable;
use crate::types::{RasterImage, Stage};

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $what:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($what, " #{}"), self.0)
            }
        }
    };
}

handle_type!(
    /// Off-screen colour target owned by a backend.
    TargetId,
    "render target"
);
handle_type!(ShaderId, "shader stage");
handle_type!(ProgramId, "program");
handle_type!(
    /// Sampleable texture. Whoever created it releases it.
    TextureId,
    "texture"
);

/// Value pushed to a named uniform for one frame.
///
/// Matrices are column-major.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Int(i32),
    UInt(u32),
    Bool(bool),
    Mat2([f32; 4]),
    Mat3([f32; 9]),
    Mat4([f32; 16]),
    Sampler(TextureId),
}

impl UniformValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            UniformValue::Float(_) => "float",
            UniformValue::Vec2(_) => "vec2",
            UniformValue::Vec3(_) => "vec3",
            UniformValue::Vec4(_) => "vec4",
            UniformValue::Int(_) => "int",
            UniformValue::UInt(_) => "uint",
            UniformValue::Bool(_) => "bool",
            UniformValue::Mat2(_) => "mat2",
            UniformValue::Mat3(_) => "mat3",
            UniformValue::Mat4(_) => "mat4",
            UniformValue::Sampler(_) => "sampler2D",
        }
    }
}

/// Uniform assignments collected for a single draw.
///
/// Array elements are addressed as `name[i]`. Names the linked program does
/// not declare are ignored at draw time, mirroring how GL treats inactive
/// uniforms.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UniformValues {
    values: BTreeMap<String, UniformValue>,
}

impl UniformValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: UniformValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&UniformValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &UniformValue)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Wrap {
    #[default]
    Repeat,
    Clamp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Filter {
    #[default]
    Nearest,
    Linear,
}

/// Shape and sampling of an RGBA8 texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub wrap: Wrap,
    pub filter: Filter,
}

impl TextureDesc {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            wrap: Wrap::default(),
            filter: Filter::default(),
        }
    }

    pub fn with_wrap(mut self, wrap: Wrap) -> Self {
        self.wrap = wrap;
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Bytes an upload for this texture must contain.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("graphics device unavailable: {0}")]
    Unavailable(String),
    #[error("unknown {0}")]
    UnknownHandle(String),
    #[error("invalid size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
    #[error("texture upload for {width}x{height} expects {expected} bytes, got {actual}")]
    PixelSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("no readback pending for {0}")]
    NoPendingReadback(TargetId),
    #[error("readback failed: {0}")]
    Readback(String),
    #[error("device error: {0}")]
    Device(String),
}

impl BackendError {
    pub(crate) fn unknown(handle: impl fmt::Display) -> Self {
        BackendError::UnknownHandle(handle.to_string())
    }
}

/// A linked program together with the uniforms it declares.
#[derive(Clone, Debug)]
pub struct LinkedProgram {
    pub id: ProgramId,
    pub uniforms: UniformTable,
}

/// Texture lifetime management, the part of the backend environments and
/// resources are allowed to touch.
pub trait TextureStore {
    /// Uploads `pixels` (RGBA8, row 0 at the bottom, GL convention).
    fn create_texture(
        &mut self,
        desc: &TextureDesc,
        pixels: &[u8],
    ) -> Result<TextureId, BackendError>;

    fn release_texture(&mut self, texture: TextureId);
}

/// Graphics API seen by the engine.
///
/// Implementations are bound to the thread that created them; the engine
/// never calls a backend from anywhere else.
pub trait Backend: TextureStore {
    fn create_target(&mut self, width: u32, height: u32) -> Result<TargetId, BackendError>;

    fn destroy_target(&mut self, target: TargetId);

    /// Compiles one stage from ordered source fragments. Diagnostics refer
    /// to fragment indices and 1-based lines within them.
    fn compile_stage(
        &mut self,
        stage: Stage,
        fragments: &[String],
    ) -> Result<ShaderId, CompileError>;

    fn delete_shader(&mut self, shader: ShaderId);

    fn link_program(&mut self, shaders: &[ShaderId]) -> Result<LinkedProgram, LinkError>;

    fn delete_program(&mut self, program: ProgramId);

    /// Clears `target` and draws a full-screen quad with `program`.
    fn draw(
        &mut self,
        program: ProgramId,
        target: TargetId,
        uniforms: &UniformValues,
    ) -> Result<(), BackendError>;

    /// Starts copying `target` to host memory without waiting for it.
    fn begin_readback(&mut self, target: TargetId) -> Result<(), BackendError>;

    /// Waits for the transfer started by [`Backend::begin_readback`]. Rows
    /// come back in memory order, bottom row first.
    fn finish_readback(&mut self, target: TargetId) -> Result<RasterImage, BackendError>;

    fn read_pixels(&mut self, target: TargetId) -> Result<RasterImage, BackendError> {
        self.begin_readback(target)?;
        self.finish_readback(target)
    }

    /// Copies the current contents of `target` into a new texture.
    fn snapshot_target(&mut self, target: TargetId) -> Result<TextureId, BackendError>;
}
