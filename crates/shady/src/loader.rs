//! Turning a shader file into an environment.
//!
//! Detection is an explicit ordered list: the first [`Detector`] whose
//! predicate accepts the shader text builds the environment. A configured
//! environment name skips detection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use glslsandbox::GlslSandbox;
use renderer::{resolve_includes, Environment, Source};
use shadertoy::{Mapping, MappingError, ResourceKinds, ShaderToy};

use crate::config::{ShadyConfig, DEFAULT_GLSL_VERSION};

/// Settings every environment builder receives.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub glsl_version: String,
    pub mappings: Vec<Mapping>,
    pub resource_kinds: Arc<ResourceKinds>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            glsl_version: DEFAULT_GLSL_VERSION.to_string(),
            mappings: Vec::new(),
            resource_kinds: Arc::new(ResourceKinds::default()),
        }
    }
}

pub type BuildFn = fn(&Path, &LoadOptions) -> Result<Box<dyn Environment>>;

/// Recognises one shader flavour and builds its environment.
#[derive(Clone, Copy)]
pub struct Detector {
    pub name: &'static str,
    pub matches: fn(&str) -> bool,
    pub build: BuildFn,
}

impl std::fmt::Debug for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detector").field("name", &self.name).finish()
    }
}

fn build_shadertoy(path: &Path, options: &LoadOptions) -> Result<Box<dyn Environment>> {
    let environment = ShaderToy::from_file(path)?
        .with_glsl_version(options.glsl_version.clone())
        .with_mappings(options.mappings.clone())
        .with_resource_kinds(Arc::clone(&options.resource_kinds));
    Ok(Box::new(environment))
}

fn build_glslsandbox(path: &Path, options: &LoadOptions) -> Result<Box<dyn Environment>> {
    if !options.mappings.is_empty() {
        tracing::warn!("mappings are ignored by the glslsandbox environment");
    }
    let environment = GlslSandbox::from_file(path)?.with_glsl_version(options.glsl_version.clone());
    Ok(Box::new(environment))
}

/// ShaderToy first: its shaders may also declare a `resolution` uniform.
pub fn default_detectors() -> Vec<Detector> {
    vec![
        Detector {
            name: "shadertoy",
            matches: shadertoy::is_shadertoy,
            build: build_shadertoy,
        },
        Detector {
            name: "glslsandbox",
            matches: glslsandbox::is_glslsandbox,
            build: build_glslsandbox,
        },
    ]
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("unknown environment `{name}`, expected one of: {known}")]
    UnknownEnvironment { name: String, known: String },
    #[error("could not detect the environment of {0}")]
    Undetected(PathBuf),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("failed to load {path}: {error:#}")]
    Build { path: PathBuf, error: anyhow::Error },
}

#[derive(Debug, Clone)]
pub struct Loader {
    detectors: Vec<Detector>,
    forced: Option<String>,
    options: LoadOptions,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new(default_detectors())
    }
}

impl Loader {
    pub fn new(detectors: Vec<Detector>) -> Self {
        Self {
            detectors,
            forced: None,
            options: LoadOptions::default(),
        }
    }

    /// Loader with the default detectors, set up from `config`. Mapping
    /// overrides resolve against `base_dir`.
    pub fn from_config(config: &ShadyConfig, base_dir: &Path) -> Result<Self, LoadError> {
        let mappings = config
            .mappings
            .iter()
            .map(|mapping| Mapping::parse(mapping, base_dir))
            .collect::<Result<Vec<_>, _>>()?;
        let mut loader = Self::default().with_options(LoadOptions {
            glsl_version: config.glsl_version.clone(),
            mappings,
            ..LoadOptions::default()
        });
        if let Some(name) = &config.environment {
            loader = loader.with_environment(name)?;
        }
        Ok(loader)
    }

    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    /// Always builds the environment called `name`.
    pub fn with_environment(mut self, name: &str) -> Result<Self, LoadError> {
        if !self.detectors.iter().any(|detector| detector.name == name) {
            return Err(LoadError::UnknownEnvironment {
                name: name.to_string(),
                known: self.names().join(", "),
            });
        }
        self.forced = Some(name.to_string());
        Ok(self)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|detector| detector.name).collect()
    }

    /// First detector accepting `source`.
    pub fn detect(&self, source: &str) -> Option<&Detector> {
        self.detectors
            .iter()
            .find(|detector| (detector.matches)(source))
    }

    /// Files that make up the shader at `path`; the path itself when its
    /// includes cannot be resolved.
    pub fn source_files(&self, path: &Path) -> Vec<PathBuf> {
        resolve_includes(path).unwrap_or_else(|err| {
            tracing::debug!(path = %path.display(), error = %err, "include resolution failed");
            vec![path.to_path_buf()]
        })
    }

    pub fn load(&self, path: &Path) -> Result<Box<dyn Environment>, LoadError> {
        let build_error = |error: anyhow::Error| LoadError::Build {
            path: path.to_path_buf(),
            error,
        };

        let detector = match &self.forced {
            Some(name) => self
                .detectors
                .iter()
                .find(|detector| detector.name == name)
                .ok_or_else(|| LoadError::UnknownEnvironment {
                    name: name.clone(),
                    known: self.names().join(", "),
                })?,
            None => {
                let text = self.detection_text(path).map_err(build_error)?;
                self.detect(&text)
                    .ok_or_else(|| LoadError::Undetected(path.to_path_buf()))?
            }
        };

        tracing::info!(
            path = %path.display(),
            environment = detector.name,
            forced = self.forced.is_some(),
            "loading shader"
        );
        (detector.build)(path, &self.options).map_err(build_error)
    }

    fn detection_text(&self, path: &Path) -> Result<String> {
        let mut text = String::new();
        for file in resolve_includes(path)? {
            text.push_str(&Source::File(file).contents()?);
            text.push('\n');
        }
        Ok(text)
    }
}
