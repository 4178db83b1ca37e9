//! Path rules for mapping values.
//!
//! Mapping values name files relative to the shader that declares them.
//! `~` and `~/...` expand to the home directory; `~user` forms are rejected
//! rather than guessed at.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use directories_next::BaseDirs;
use tracing::debug;

/// Resolves `value` against `dir`, the directory of the declaring shader.
pub fn resolve_path(dir: &Path, value: &str) -> Result<PathBuf> {
    let value = value.trim();
    if value.is_empty() {
        anyhow::bail!("mapping path must not be empty");
    }

    let expanded = expand_home(value)?;
    let resolved = if expanded.is_absolute() {
        expanded
    } else {
        dir.join(expanded)
    };
    debug!(original = %value, resolved = %resolved.display(), "resolved mapping path");
    Ok(resolved)
}

fn expand_home(input: &str) -> Result<PathBuf> {
    if !input.starts_with('~') {
        return Ok(PathBuf::from(input));
    }

    let base_dirs = BaseDirs::new()
        .ok_or_else(|| anyhow!("unable to determine home directory for '~' expansion"))?;
    let home_dir = base_dirs.home_dir();

    if input == "~" {
        return Ok(home_dir.to_path_buf());
    }
    if let Some(rest) = input.strip_prefix("~/") {
        return Ok(home_dir.join(rest));
    }

    anyhow::bail!("user-specific home expansion ('{input}') is not supported")
}
