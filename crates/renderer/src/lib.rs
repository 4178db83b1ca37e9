//! Shader render engine.
//!
//! The crate turns GLSL fragment programs into a stream of raster images.
//! The moving parts, leaf to root:
//!
//! ```text
//!   Environment ──sources/uniforms──▶ Engine ──draw──▶ RenderRing ──readback──▶ animate()
//!        ▲                              │                                         │
//!        │ hand-off slot                └─ child nodes (sub-environments)         ▼
//!   loader / watcher                                                   bounded frame channel
//! ```
//!
//! [`Backend`] abstracts the graphics API. [`gpu::WgpuBackend`] drives a
//! headless `wgpu` device; [`headless::HeadlessBackend`] is a deterministic
//! software stand-in used throughout the tests.
//!
//! An [`Engine`] must only be driven from the thread that created its
//! backend. Environments cross threads through the [`handoff`] slot; frames
//! leave through a bounded channel fed by [`Engine::animate`].

mod animate;
pub mod backend;
mod cancel;
pub mod compile;
mod engine;
pub mod environment;
pub mod glsl;
pub mod gpu;
pub mod handoff;
pub mod headless;
mod ring;
pub mod source;
mod types;

pub use backend::{
    Backend, BackendError, Filter, LinkedProgram, ProgramId, ShaderId, TargetId, TextureDesc,
    TextureId, TextureStore, UniformValue, UniformValues, Wrap,
};
pub use cancel::CancelToken;
pub use compile::{CompileError, ErrorMarker, LinkError};
pub use engine::{Engine, EngineError, MAX_SUB_ENVIRONMENT_DEPTH};
pub use environment::{Environment, RenderState, Resource, SubEnvironment};
pub use glsl::{GlslType, UniformTable};
pub use gpu::{GpuPowerPreference, WgpuBackend};
pub use handoff::{handoff, EnvironmentReceiver, EnvironmentSender, WaitError};
pub use headless::{DrawRecord, HeadlessBackend};
pub use ring::RingHandle;
pub use source::{resolve_includes, Source, Sources};
pub use types::{
    ConfigError, EngineConfig, RasterImage, Stage, DEFAULT_RING_SIZE, MAX_RING_SIZE,
};
