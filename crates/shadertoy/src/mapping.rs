//! `// map <uniform>=<kind>:<value>` directives.
//!
//! A mapping binds a uniform to an external input. Mappings are written in
//! the shader source itself; configuration may add more or replace ones of
//! the same uniform name.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

/// Kinds that need a codec or a hardware backend this workspace does not
/// ship.
const UNSUPPORTED_KINDS: &[&str] = &["audio", "video", "kinect", "serial"];

fn directive_regex() -> &'static Regex {
    static DIRECTIVE_REGEX: OnceLock<Regex> = OnceLock::new();
    DIRECTIVE_REGEX.get_or_init(|| {
        Regex::new(r"(?m)^//\s+map\s+(\w+)=([^:\r\n]+):(.+?)\s*$").expect("invalid mapping regex")
    })
}

fn override_regex() -> &'static Regex {
    static OVERRIDE_REGEX: OnceLock<Regex> = OnceLock::new();
    OVERRIDE_REGEX.get_or_init(|| {
        Regex::new(r"^(\w+)=([^:]+):(.+)$").expect("invalid mapping override regex")
    })
}

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("malformed mapping `{0}`, expected <uniform>=<kind>:<value>")]
    Syntax(String),
    #[error("mapping `{name}` uses kind `{kind}`, which is not supported")]
    Unsupported { name: String, kind: String },
    #[error("mapping `{name}` uses unknown kind `{kind}`")]
    UnknownKind { name: String, kind: String },
    #[error("mapping `{name}` has invalid value `{value}`: expected {expected}")]
    InvalidValue {
        name: String,
        value: String,
        expected: &'static str,
    },
}

/// One parsed mapping directive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// Uniform the resource is bound to.
    pub name: String,
    pub kind: String,
    pub value: String,
    /// Directory relative paths in `value` are resolved against.
    pub dir: PathBuf,
}

impl Mapping {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        value: impl Into<String>,
        dir: impl Into<PathBuf>,
    ) -> Result<Self, MappingError> {
        let mapping = Self {
            name: name.into(),
            kind: kind.into().trim().to_string(),
            value: value.into(),
            dir: dir.into(),
        };
        if UNSUPPORTED_KINDS.contains(&mapping.kind.as_str()) {
            return Err(MappingError::Unsupported {
                name: mapping.name,
                kind: mapping.kind,
            });
        }
        Ok(mapping)
    }

    /// Parses a `<uniform>=<kind>:<value>` override as given in
    /// configuration; paths resolve against `dir`.
    pub fn parse(input: &str, dir: &Path) -> Result<Self, MappingError> {
        let captures = override_regex()
            .captures(input.trim())
            .ok_or_else(|| MappingError::Syntax(input.to_string()))?;
        Self::new(&captures[1], &captures[2], &captures[3], dir)
    }

    pub(crate) fn invalid(&self, expected: &'static str) -> MappingError {
        MappingError::InvalidValue {
            name: self.name.clone(),
            value: self.value.clone(),
            expected,
        }
    }
}

/// Collects the mapping directives in `source`, in order of appearance.
pub fn extract_mappings(source: &str, dir: &Path) -> Result<Vec<Mapping>, MappingError> {
    directive_regex()
        .captures_iter(source)
        .map(|captures| Mapping::new(&captures[1], &captures[2], &captures[3], dir))
        .collect()
}

/// Replaces mappings whose uniform name an override also binds and
/// appends the remaining overrides.
pub fn apply_overrides(mappings: Vec<Mapping>, overrides: &[Mapping]) -> Vec<Mapping> {
    let mut merged: Vec<Mapping> = mappings
        .into_iter()
        .filter(|mapping| !overrides.iter().any(|o| o.name == mapping.name))
        .collect();
    merged.extend(overrides.iter().cloned());
    merged
}
