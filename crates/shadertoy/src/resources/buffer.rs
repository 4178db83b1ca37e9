use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use renderer::{
    RenderState, Resource, SubEnvironment, TextureStore, UniformValue, UniformValues,
};

use super::{push_texture_size, sampler_source, ResourceContext};
use crate::mapping::Mapping;
use crate::path::resolve_path;
use crate::ShaderToy;

fn value_regex() -> &'static Regex {
    static VALUE_REGEX: OnceLock<Regex> = OnceLock::new();
    VALUE_REGEX.get_or_init(|| {
        Regex::new(r"^([^;]+);(\d+)x(\d+)$").expect("invalid buffer value regex")
    })
}

/// Output of a nested ShaderToy pass rendered at its own resolution.
///
/// The nested environment is handed to the engine as a sub-environment;
/// the engine renders it first every frame and this resource binds the
/// result.
pub struct BufferImage {
    name: String,
    width: u32,
    height: u32,
    environment: Option<ShaderToy>,
}

impl BufferImage {
    pub fn new(name: impl Into<String>, environment: ShaderToy, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            environment: Some(environment),
        }
    }
}

impl Resource for BufferImage {
    fn uniform_source(&self) -> String {
        sampler_source(&self.name)
    }

    fn pre_render(&mut self, state: &RenderState<'_>, uniforms: &mut UniformValues) {
        if let Some(texture) = state.sub_buffer(&self.name) {
            uniforms.set(self.name.clone(), UniformValue::Sampler(texture));
        }
        push_texture_size(&self.name, self.width, self.height, uniforms);
    }

    fn sub_environment(&mut self) -> Result<Option<SubEnvironment>> {
        Ok(self.environment.take().map(|environment| {
            SubEnvironment::new(
                self.name.clone(),
                Box::new(environment),
                self.width,
                self.height,
            )
        }))
    }

    fn close(&mut self, _: &mut dyn TextureStore) -> Result<()> {
        // The engine owns and closes the nested environment.
        Ok(())
    }
}

pub(super) fn build(
    mapping: &Mapping,
    context: &mut ResourceContext<'_>,
) -> Result<Box<dyn Resource>> {
    let captures = value_regex()
        .captures(mapping.value.trim())
        .ok_or_else(|| mapping.invalid("<path>;<width>x<height>"))?;
    let width: u32 = captures[2]
        .parse()
        .map_err(|_| mapping.invalid("a width that fits 32 bits"))?;
    let height: u32 = captures[3]
        .parse()
        .map_err(|_| mapping.invalid("a height that fits 32 bits"))?;

    let path = resolve_path(&mapping.dir, &captures[1])?;
    let environment = ShaderToy::from_file(&path)?
        .with_resource_kinds(context.kinds.clone())
        .with_glsl_version(context.glsl_version);
    tracing::debug!(
        uniform = %mapping.name,
        path = %path.display(),
        width,
        height,
        "declared buffer pass"
    );
    Ok(Box::new(BufferImage::new(
        &mapping.name,
        environment,
        width,
        height,
    )))
}
