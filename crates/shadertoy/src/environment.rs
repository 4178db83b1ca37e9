use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use chrono::{Datelike, Local, Timelike};
use regex::Regex;
use renderer::{
    resolve_includes, Environment, RenderState, Resource, Source, Sources, Stage, SubEnvironment,
    TextureStore, UniformValue, UniformValues,
};

use crate::mapping::{apply_overrides, extract_mappings, Mapping};
use crate::resources::{ResourceContext, ResourceKinds};

pub const DEFAULT_GLSL_VERSION: &str = "330";

/// Reported to shaders through `iSampleRate`.
const SAMPLE_RATE: f32 = 44_100.0;

const BUILTIN_UNIFORMS: &str = "\
uniform vec3 iResolution;
uniform float iTime;
uniform float iTimeDelta;
uniform int iFrame;
uniform float iChannelTime[4];
uniform vec4 iMouse;
uniform vec4 iDate;
uniform float iSampleRate;
uniform vec3 iChannelResolution[4];
";

const ENTRY_POINT: &str = "\
void main() {
    mainImage(gl_FragColor, gl_FragCoord.xy);
}
";

const VERTEX_STAGE: &str = "\
attribute vec3 vert;
void main() {
    gl_Position = vec4(vert, 1.0);
}
";

fn main_image_regex() -> &'static Regex {
    static MAIN_IMAGE_REGEX: OnceLock<Regex> = OnceLock::new();
    MAIN_IMAGE_REGEX.get_or_init(|| {
        Regex::new(r"void\s+mainImage\s*\(\s*out\s+vec4\s+\w+\s*,\s*(?:in\s+)?vec2\s+\w+\s*\)")
            .expect("invalid mainImage regex")
    })
}

/// Whether `source` looks like a ShaderToy image shader.
pub fn is_shadertoy(source: &str) -> bool {
    main_image_regex().is_match(source)
}

/// The shadertoy.com conventions: `mainImage` entry point, `i*` uniforms
/// and mapped channels.
pub struct ShaderToy {
    sources: Vec<Source>,
    dir: PathBuf,
    identity: Option<String>,
    overrides: Vec<Mapping>,
    kinds: Arc<ResourceKinds>,
    glsl_version: String,
    resources: Vec<Box<dyn Resource>>,
}

impl ShaderToy {
    /// Loads the shader at `path` together with its `#pragma use`
    /// includes.
    pub fn from_file(path: &Path) -> Result<Self> {
        let files = resolve_includes(path)?;
        let root = files
            .last()
            .cloned()
            .with_context(|| format!("no sources resolved for {}", path.display()))?;
        let dir = root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let identity = std::fs::canonicalize(&root)
            .unwrap_or_else(|_| root.clone())
            .display()
            .to_string();
        Ok(Self {
            identity: Some(identity),
            ..Self::new(files.into_iter().map(Source::File).collect(), dir)
        })
    }

    /// Shader text held in memory; mapping paths resolve against `dir`.
    pub fn from_source(source: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self::new(vec![Source::text(source)], dir.into())
    }

    fn new(sources: Vec<Source>, dir: PathBuf) -> Self {
        Self {
            sources,
            dir,
            identity: None,
            overrides: Vec::new(),
            kinds: Arc::new(ResourceKinds::default()),
            glsl_version: DEFAULT_GLSL_VERSION.to_string(),
            resources: Vec::new(),
        }
    }

    /// Mappings that replace in-source mappings of the same uniform.
    pub fn with_mappings(mut self, overrides: Vec<Mapping>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_resource_kinds(mut self, kinds: Arc<ResourceKinds>) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_glsl_version(mut self, version: impl Into<String>) -> Self {
        self.glsl_version = version.into();
        self
    }

    /// Files this environment reads its shader from.
    pub fn source_files(&self) -> impl Iterator<Item = &Path> {
        self.sources.iter().filter_map(Source::path)
    }

    /// Effective mappings: in-source directives with overrides applied.
    pub fn mappings(&self) -> Result<Vec<Mapping>> {
        let mut text = String::new();
        for source in &self.sources {
            text.push_str(&source.contents()?);
            text.push('\n');
        }
        let mappings = extract_mappings(&text, &self.dir)?;
        Ok(apply_overrides(mappings, &self.overrides))
    }

    fn version_line(&self) -> String {
        format!("#version {}\n", self.glsl_version)
    }
}

fn seconds(duration: std::time::Duration) -> f32 {
    duration.as_secs_f32()
}

/// `iDate`: year, zero-based month, day, seconds since local midnight.
fn date_uniform() -> [f32; 4] {
    let now = Local::now();
    let since_midnight =
        now.num_seconds_from_midnight() as f32 + now.nanosecond() as f32 / 1_000_000_000.0;
    [
        now.year() as f32,
        now.month0() as f32,
        now.day() as f32,
        since_midnight,
    ]
}

impl Environment for ShaderToy {
    fn name(&self) -> &str {
        "shadertoy"
    }

    fn identity(&self) -> Option<String> {
        self.identity.clone()
    }

    fn setup(&mut self, _: &RenderState<'_>, textures: &mut dyn TextureStore) -> Result<()> {
        let mappings = self.mappings()?;
        let mut context = ResourceContext {
            textures,
            kinds: &self.kinds,
            glsl_version: &self.glsl_version,
        };

        let mut resources: Vec<Box<dyn Resource>> = Vec::with_capacity(mappings.len());
        for mapping in &mappings {
            match self.kinds.build(mapping, &mut context) {
                Ok(resource) => resources.push(resource),
                Err(err) => {
                    for mut resource in resources {
                        if let Err(close_err) = resource.close(context.textures) {
                            tracing::warn!(error = %close_err, "failed to release resource");
                        }
                    }
                    return Err(err.context(format!(
                        "failed to set up mapping `{}` ({}:{})",
                        mapping.name, mapping.kind, mapping.value
                    )));
                }
            }
        }

        tracing::debug!(
            identity = ?self.identity,
            resources = resources.len(),
            "shadertoy environment ready"
        );
        self.resources = resources;
        Ok(())
    }

    fn sub_environments(&mut self) -> Result<Vec<SubEnvironment>> {
        let mut subs = Vec::new();
        for resource in &mut self.resources {
            if let Some(sub) = resource.sub_environment()? {
                subs.push(sub);
            }
        }
        Ok(subs)
    }

    fn sources(&self) -> Result<Sources> {
        let declarations: String = self
            .resources
            .iter()
            .map(|resource| resource.uniform_source())
            .collect();

        let mut fragment = Vec::with_capacity(self.sources.len() + 3);
        fragment.push(Source::text(format!(
            "{}{BUILTIN_UNIFORMS}",
            self.version_line()
        )));
        fragment.push(Source::text(declarations));
        fragment.extend(self.sources.iter().cloned());
        fragment.push(Source::text(ENTRY_POINT));

        Ok(Sources::from([
            (
                Stage::Vertex,
                vec![Source::text(format!("{}{VERTEX_STAGE}", self.version_line()))],
            ),
            (Stage::Fragment, fragment),
        ]))
    }

    fn pre_render(&mut self, state: &RenderState<'_>, uniforms: &mut UniformValues) {
        let time = seconds(state.time);
        uniforms.set(
            "iResolution",
            UniformValue::Vec3([state.width as f32, state.height as f32, 0.0]),
        );
        uniforms.set("iTime", UniformValue::Float(time));
        uniforms.set("iTimeDelta", UniformValue::Float(seconds(state.interval)));
        uniforms.set(
            "iFrame",
            UniformValue::Int(i32::try_from(state.frame).unwrap_or(i32::MAX)),
        );
        for channel in 0..4 {
            uniforms.set(format!("iChannelTime[{channel}]"), UniformValue::Float(time));
        }
        uniforms.set("iMouse", UniformValue::Vec4([0.0; 4]));
        uniforms.set("iDate", UniformValue::Vec4(date_uniform()));
        uniforms.set("iSampleRate", UniformValue::Float(SAMPLE_RATE));

        for resource in &mut self.resources {
            resource.pre_render(state, uniforms);
        }
    }

    fn close(&mut self, textures: &mut dyn TextureStore) -> Result<()> {
        let mut first_error = None;
        for mut resource in self.resources.drain(..) {
            if let Err(err) = resource.close(textures) {
                tracing::warn!(error = %err, "failed to close resource");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
