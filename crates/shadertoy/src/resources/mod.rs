//! Resource kinds a mapping can name.
//!
//! [`ResourceKinds`] is a plain table from kind name to builder. The
//! default table knows `image`, `builtin`, `buffer` and `perip_mat4`;
//! callers may register more before handing the table to
//! [`ShaderToy`](crate::ShaderToy).

mod buffer;
mod peripheral;
mod texture;

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use regex::Regex;
use renderer::{Resource, TextureStore, UniformValue, UniformValues};

use crate::mapping::{Mapping, MappingError};

pub use self::buffer::BufferImage;
pub use self::peripheral::PeripheralMat4;
pub use self::texture::{noise, BackBuffer, ImageTexture};

/// Builds the resource for one mapping.
pub type ResourceBuilder = fn(&Mapping, &mut ResourceContext<'_>) -> Result<Box<dyn Resource>>;

/// What a builder gets to work with during setup.
pub struct ResourceContext<'a> {
    pub textures: &'a mut dyn TextureStore,
    /// Table nested buffers resolve their own mappings with.
    pub kinds: &'a Arc<ResourceKinds>,
    pub glsl_version: &'a str,
}

#[derive(Clone)]
pub struct ResourceKinds {
    builders: BTreeMap<String, ResourceBuilder>,
}

impl ResourceKinds {
    pub fn empty() -> Self {
        Self {
            builders: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, kind: impl Into<String>, builder: ResourceBuilder) -> &mut Self {
        self.builders.insert(kind.into(), builder);
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.builders.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }

    pub fn build(
        &self,
        mapping: &Mapping,
        context: &mut ResourceContext<'_>,
    ) -> Result<Box<dyn Resource>> {
        let builder = self
            .builders
            .get(&mapping.kind)
            .ok_or_else(|| MappingError::UnknownKind {
                name: mapping.name.clone(),
                kind: mapping.kind.clone(),
            })?;
        builder(mapping, context)
    }
}

impl Default for ResourceKinds {
    fn default() -> Self {
        let mut kinds = Self::empty();
        kinds
            .register("image", texture::build_image)
            .register("builtin", texture::build_builtin)
            .register("buffer", buffer::build)
            .register("perip_mat4", peripheral::build);
        kinds
    }
}

impl std::fmt::Debug for ResourceKinds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.builders.keys()).finish()
    }
}

fn channel_regex() -> &'static Regex {
    static CHANNEL_REGEX: OnceLock<Regex> = OnceLock::new();
    CHANNEL_REGEX.get_or_init(|| Regex::new(r"^iChannel(\d+)$").expect("invalid channel regex"))
}

/// Declarations shared by every texture resource.
pub(crate) fn sampler_source(name: &str) -> String {
    format!("uniform sampler2D {name};\nuniform vec3 {name}Size;\n")
}

/// Pushes `<name>Size` and, for `iChannel<n>`, `iChannelResolution[n]`.
pub(crate) fn push_texture_size(name: &str, width: u32, height: u32, uniforms: &mut UniformValues) {
    let size = UniformValue::Vec3([width as f32, height as f32, 1.0]);
    uniforms.set(format!("{name}Size"), size);
    if let Some(captures) = channel_regex().captures(name) {
        uniforms.set(format!("iChannelResolution[{}]", &captures[1]), size);
    }
}
