use anyhow::{Context, Result};
use image::RgbaImage;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use renderer::{
    RenderState, Resource, TextureDesc, TextureId, TextureStore, UniformValue, UniformValues,
};

use super::{push_texture_size, sampler_source, ResourceContext};
use crate::mapping::Mapping;
use crate::path::resolve_path;

const NOISE_SEED: u64 = 1337;

/// Random RGBA texels, identical on every run.
pub fn noise(width: u32, height: u32) -> RgbaImage {
    let mut pixels = vec![0u8; width as usize * height as usize * 4];
    StdRng::seed_from_u64(NOISE_SEED).fill_bytes(&mut pixels);
    RgbaImage::from_raw(width, height, pixels).unwrap_or_else(|| RgbaImage::new(width, height))
}

/// A static texture uploaded once during setup.
#[derive(Debug)]
pub struct ImageTexture {
    name: String,
    texture: TextureId,
    width: u32,
    height: u32,
}

impl ImageTexture {
    /// Uploads `image` (top row first) in GL orientation.
    pub fn upload(
        name: impl Into<String>,
        image: &RgbaImage,
        textures: &mut dyn TextureStore,
    ) -> Result<Self> {
        let name = name.into();
        let (width, height) = image.dimensions();
        let flipped = image::imageops::flip_vertical(image);
        let texture = textures
            .create_texture(&TextureDesc::new(width, height), flipped.as_raw())
            .with_context(|| format!("failed to upload texture for `{name}`"))?;
        tracing::debug!(uniform = %name, width, height, "uploaded texture");
        Ok(Self {
            name,
            texture,
            width,
            height,
        })
    }

    pub fn texture(&self) -> TextureId {
        self.texture
    }
}

impl Resource for ImageTexture {
    fn uniform_source(&self) -> String {
        sampler_source(&self.name)
    }

    fn pre_render(&mut self, _: &RenderState<'_>, uniforms: &mut UniformValues) {
        uniforms.set(self.name.clone(), UniformValue::Sampler(self.texture));
        push_texture_size(&self.name, self.width, self.height, uniforms);
    }

    fn close(&mut self, textures: &mut dyn TextureStore) -> Result<()> {
        textures.release_texture(self.texture);
        Ok(())
    }
}

/// The previous frame of the environment that declares it.
#[derive(Debug)]
pub struct BackBuffer {
    name: String,
}

impl BackBuffer {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Resource for BackBuffer {
    fn uniform_source(&self) -> String {
        sampler_source(&self.name)
    }

    fn pre_render(&mut self, state: &RenderState<'_>, uniforms: &mut UniformValues) {
        // Nothing to sample on the first frame; the unit stays unbound.
        if let Some(previous) = state.previous_frame() {
            uniforms.set(self.name.clone(), UniformValue::Sampler(previous));
        }
        push_texture_size(&self.name, state.width, state.height, uniforms);
    }

    fn close(&mut self, _: &mut dyn TextureStore) -> Result<()> {
        Ok(())
    }
}

pub(super) fn build_image(
    mapping: &Mapping,
    context: &mut ResourceContext<'_>,
) -> Result<Box<dyn Resource>> {
    let path = resolve_path(&mapping.dir, &mapping.value)?;
    let image = image::open(&path)
        .with_context(|| format!("failed to load image {}", path.display()))?
        .into_rgba8();
    Ok(Box::new(ImageTexture::upload(
        &mapping.name,
        &image,
        context.textures,
    )?))
}

pub(super) fn build_builtin(
    mapping: &Mapping,
    context: &mut ResourceContext<'_>,
) -> Result<Box<dyn Resource>> {
    let size = match mapping.value.trim() {
        "Back Buffer" => return Ok(Box::new(BackBuffer::new(&mapping.name))),
        "RGBA Noise Small" => 64,
        "RGBA Noise Medium" => 256,
        _ => return Err(mapping.invalid("a builtin texture name").into()),
    };
    Ok(Box::new(ImageTexture::upload(
        &mapping.name,
        &noise(size, size),
        context.textures,
    )?))
}
