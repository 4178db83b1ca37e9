//! ShaderToy environment for the render engine.
//!
//! Shaders written for shadertoy.com define `mainImage` and read the `i*`
//! uniforms. Extra inputs are bound with mapping directives in the source:
//!
//! ```glsl
//! // map iChannel0=image:textures/wood.png
//! // map iChannel1=builtin:RGBA Noise Small
//! // map iChannel2=buffer:blur.glsl;256x256
//! // map view=perip_mat4:/tmp/head-tracker?
//! ```
//!
//! `buffer` mappings become sub-environments that the engine renders before
//! the shader that samples them.

mod environment;
pub mod mapping;
mod path;
pub mod resources;

pub use environment::{is_shadertoy, ShaderToy, DEFAULT_GLSL_VERSION};
pub use mapping::{apply_overrides, extract_mappings, Mapping, MappingError};
pub use path::resolve_path;
pub use resources::{ResourceBuilder, ResourceContext, ResourceKinds};
