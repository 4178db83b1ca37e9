//! GLSLSandbox environment for the render engine.
//!
//! glslsandbox.com shaders are plain fragment programs that declare the
//! uniforms they use themselves: `time`, `resolution`, `mouse`,
//! `surfaceSize` and the `backbuffer` sampler. The vertex stage passes the
//! quad position on as `surfacePosition`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use renderer::{
    resolve_includes, Environment, RenderState, Source, Sources, Stage, TextureStore,
    UniformValue, UniformValues,
};

pub const DEFAULT_GLSL_VERSION: &str = "330";

const VERTEX_STAGE: &str = "\
attribute vec3 vert;
varying vec2 surfacePosition;

void main() {
    surfacePosition = vert.xy;
    gl_Position = vec4(vert, 1.0);
}
";

fn resolution_regex() -> &'static Regex {
    static RESOLUTION_REGEX: OnceLock<Regex> = OnceLock::new();
    RESOLUTION_REGEX.get_or_init(|| {
        Regex::new(r"uniform\s+vec2\s+resolution\b").expect("invalid resolution regex")
    })
}

/// Whether `source` looks like a GLSLSandbox shader.
pub fn is_glslsandbox(source: &str) -> bool {
    resolution_regex().is_match(source)
}

#[derive(Clone, Debug)]
pub struct GlslSandbox {
    sources: Vec<Source>,
    identity: Option<String>,
    glsl_version: String,
}

impl GlslSandbox {
    /// Loads the shader at `path` together with its `#pragma use`
    /// includes.
    pub fn from_file(path: &Path) -> Result<Self> {
        let files = resolve_includes(path)?;
        let root: PathBuf = files
            .last()
            .cloned()
            .with_context(|| format!("no sources resolved for {}", path.display()))?;
        let identity = std::fs::canonicalize(&root)
            .unwrap_or(root)
            .display()
            .to_string();
        Ok(Self {
            sources: files.into_iter().map(Source::File).collect(),
            identity: Some(identity),
            glsl_version: DEFAULT_GLSL_VERSION.to_string(),
        })
    }

    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            sources: vec![Source::text(source)],
            identity: None,
            glsl_version: DEFAULT_GLSL_VERSION.to_string(),
        }
    }

    /// Version declared by the generated vertex stage.
    pub fn with_glsl_version(mut self, version: impl Into<String>) -> Self {
        self.glsl_version = version.into();
        self
    }

    pub fn source_files(&self) -> impl Iterator<Item = &Path> {
        self.sources.iter().filter_map(Source::path)
    }
}

impl Environment for GlslSandbox {
    fn name(&self) -> &str {
        "glslsandbox"
    }

    fn identity(&self) -> Option<String> {
        self.identity.clone()
    }

    fn setup(&mut self, _: &RenderState<'_>, _: &mut dyn TextureStore) -> Result<()> {
        tracing::debug!(identity = ?self.identity, "glslsandbox environment ready");
        Ok(())
    }

    fn sources(&self) -> Result<Sources> {
        Ok(Sources::from([
            (
                Stage::Vertex,
                vec![Source::text(format!(
                    "#version {}\n{VERTEX_STAGE}",
                    self.glsl_version
                ))],
            ),
            (Stage::Fragment, self.sources.clone()),
        ]))
    }

    fn pre_render(&mut self, state: &RenderState<'_>, uniforms: &mut UniformValues) {
        let (width, height) = (state.width as f32, state.height as f32);
        uniforms.set("resolution", UniformValue::Vec2([width, height]));
        uniforms.set("time", UniformValue::Float(state.time.as_secs_f32()));
        uniforms.set("mouse", UniformValue::Vec2([width * 0.5, height * 0.5]));
        uniforms.set("surfaceSize", UniformValue::Vec2([width, height]));
        if state.uniforms.contains("backbuffer") {
            if let Some(previous) = state.previous_frame() {
                uniforms.set("backbuffer", UniformValue::Sampler(previous));
            }
        }
    }

    fn close(&mut self, _: &mut dyn TextureStore) -> Result<()> {
        Ok(())
    }
}
