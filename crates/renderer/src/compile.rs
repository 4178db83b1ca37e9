//! Shader diagnostics.
//!
//! Backends report failures against the fragments they were given, so the
//! engine can point at the file and line a user actually wrote. Logs in the
//! Mesa style `fragment:line(column): message` are parsed into markers;
//! backends with structured diagnostics build markers directly.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::types::Stage;

fn marker_regex() -> &'static Regex {
    static MARKER_REGEX: OnceLock<Regex> = OnceLock::new();
    MARKER_REGEX.get_or_init(|| {
        Regex::new(r"(?m)^(\d+):(\d+)\((\d+)\): (.+)$").expect("invalid marker regex")
    })
}

/// Location of a diagnostic inside the fragments of one stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorMarker {
    /// Index into the fragments passed to the compiler.
    pub fragment: usize,
    /// 1-based line within that fragment.
    pub line: usize,
    pub column: Option<usize>,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct CompileError {
    stage: Stage,
    sources: Vec<String>,
    log: String,
    markers: Vec<ErrorMarker>,
}

impl CompileError {
    /// Builds an error from a raw compiler log, extracting any markers.
    pub fn from_log(stage: Stage, sources: &[String], log: impl Into<String>) -> Self {
        let log = log.into();
        let markers = parse_markers(&log);
        Self {
            stage,
            sources: sources.to_vec(),
            log,
            markers,
        }
    }

    pub fn with_markers(
        stage: Stage,
        sources: &[String],
        log: impl Into<String>,
        markers: Vec<ErrorMarker>,
    ) -> Self {
        Self {
            stage,
            sources: sources.to_vec(),
            log: log.into(),
            markers,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn log(&self) -> &str {
        &self.log
    }

    pub fn markers(&self) -> &[ErrorMarker] {
        &self.markers
    }

    /// Writes every marker with a few lines of surrounding source, or the
    /// raw log when there are no markers.
    pub fn pretty_print(&self, out: &mut impl fmt::Write) -> fmt::Result {
        if self.markers.is_empty() {
            return writeln!(out, "{}", self.log.trim_end());
        }
        for marker in &self.markers {
            let lines: Vec<&str> = self
                .sources
                .get(marker.fragment)
                .map(|source| source.split('\n').collect())
                .unwrap_or_default();
            let first = marker.line.saturating_sub(2);
            for index in first..marker.line + 2 {
                if let Some(line) = lines.get(index) {
                    writeln!(out, "{:04}: {}", index + 1, line)?;
                }
                if index + 1 == marker.line {
                    writeln!(out, "      ^ {}", marker.message)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error compiling {} shader:", self.stage)?;
        self.pretty_print(f)
    }
}

impl std::error::Error for CompileError {}

/// Failure to combine compiled stages into a program.
#[derive(Clone, Debug, thiserror::Error)]
#[error("error linking program: {log}")]
pub struct LinkError {
    log: String,
}

impl LinkError {
    pub fn new(log: impl Into<String>) -> Self {
        Self { log: log.into() }
    }

    pub fn log(&self) -> &str {
        &self.log
    }
}

fn parse_markers(log: &str) -> Vec<ErrorMarker> {
    marker_regex()
        .captures_iter(log)
        .filter_map(|caps| {
            Some(ErrorMarker {
                fragment: caps[1].parse().ok()?,
                line: caps[2].parse().ok()?,
                column: caps[3].parse().ok(),
                message: caps[4].trim_end().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sources() -> Vec<String> {
        vec![
            "uniform float a;\nuniform float b;".to_string(),
            "void main() {\n    float x = 1.0;\n    gl_FragColor = y;\n}".to_string(),
        ]
    }

    #[test]
    fn mesa_log_yields_markers() {
        let log = "1:3(20): error: `y' undeclared\n1:3(5): error: type mismatch\n";
        let err = CompileError::from_log(Stage::Fragment, &sources(), log);
        assert_eq!(err.markers().len(), 2);
        assert_eq!(err.markers()[0].fragment, 1);
        assert_eq!(err.markers()[0].line, 3);
        assert_eq!(err.markers()[0].column, Some(20));
        assert_eq!(err.markers()[0].message, "error: `y' undeclared");
    }

    #[test]
    fn pretty_print_points_at_the_failing_line() {
        let log = "1:3(20): error: `y' undeclared";
        let err = CompileError::from_log(Stage::Fragment, &sources(), log);
        let rendered = err.to_string();
        let expected = "error compiling fragment shader:\n\
                        0002:     float x = 1.0;\n\
                        0003:     gl_FragColor = y;\n      ^ error: `y' undeclared\n\
                        0004: }\n";
        assert_eq!(rendered, expected);
    }

    #[test]
    fn pretty_print_falls_back_to_raw_log() {
        let err = CompileError::from_log(Stage::Vertex, &sources(), "driver exploded\n");
        assert_eq!(
            err.to_string(),
            "error compiling vertex shader:\ndriver exploded\n"
        );
        assert!(err.markers().is_empty());
    }

    #[test]
    fn marker_on_first_line_skips_missing_context() {
        let log = "0:1(1): error: bad";
        let err = CompileError::from_log(Stage::Fragment, &sources(), log);
        let mut rendered = String::new();
        err.pretty_print(&mut rendered).unwrap();
        assert!(rendered.starts_with("0001: uniform float a;\n      ^ error: bad\n"));
        assert!(rendered.ends_with("0002: uniform float b;\n"));
    }
}
