//! Shader source fragments and `#pragma use` resolution.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::types::Stage;

fn use_regex() -> &'static Regex {
    static USE_REGEX: OnceLock<Regex> = OnceLock::new();
    USE_REGEX.get_or_init(|| {
        Regex::new(r#"(?im)^#pragma\s+use\s+"([^"]+)"\s*$"#).expect("invalid include regex")
    })
}

/// One piece of shader text, either inline or read from disk on demand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    Text(String),
    File(PathBuf),
}

impl Source {
    pub fn text(text: impl Into<String>) -> Self {
        Source::Text(text.into())
    }

    pub fn contents(&self) -> Result<String> {
        match self {
            Source::Text(text) => Ok(text.clone()),
            Source::File(path) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read shader source {}", path.display())),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Source::Text(_) => None,
            Source::File(path) => Some(path),
        }
    }
}

/// Ordered fragments per pipeline stage; later fragments may use
/// identifiers declared by earlier ones.
pub type Sources = BTreeMap<Stage, Vec<Source>>;

/// Resolves `#pragma use "file"` directives starting at `root`.
///
/// Paths are relative to the including file. The result lists every file
/// once, dependencies before the files that use them, with `root` last.
/// A file that is already part of the chain is skipped, which breaks
/// include cycles.
pub fn resolve_includes(root: &Path) -> Result<Vec<PathBuf>> {
    let mut resolved = Vec::new();
    resolve_file(&absolute(root)?, &mut Vec::new(), &mut resolved)?;
    Ok(resolved)
}

fn resolve_file(
    file: &Path,
    chain: &mut Vec<PathBuf>,
    resolved: &mut Vec<PathBuf>,
) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read shader source {}", file.display()))?;
    let dir = file.parent().unwrap_or_else(|| Path::new("/"));

    chain.push(file.to_path_buf());
    for caps in use_regex().captures_iter(&contents) {
        let included = normalize(&dir.join(&caps[1]));
        if chain.contains(&included) || resolved.contains(&included) {
            tracing::debug!(
                file = %file.display(),
                include = %included.display(),
                "skipping already included source"
            );
            continue;
        }
        resolve_file(&included, chain, resolved)?;
    }
    chain.pop();

    resolved.push(file.to_path_buf());
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    let path = std::path::absolute(path)
        .with_context(|| format!("failed to resolve {}", path.display()))?;
    Ok(normalize(&path))
}

/// Lexically removes `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
