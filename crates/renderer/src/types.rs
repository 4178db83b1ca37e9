use std::fmt;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

/// Frames handed to consumers: RGBA8, top row first.
pub type RasterImage = image::RgbaImage;

/// Ring depth used when the configuration does not say otherwise.
pub const DEFAULT_RING_SIZE: usize = 3;

/// Deeper rings only add latency.
pub const MAX_RING_SIZE: usize = 8;

/// Programmable pipeline stage a source fragment belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Vertex,
    Fragment,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Vertex => "vertex",
            Stage::Fragment => "fragment",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Output geometry and pipelining depth of the root engine.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub width: u32,
    pub height: u32,
    pub ring_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            ring_size: DEFAULT_RING_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    pub fn with_ring_size(mut self, ring_size: usize) -> Self {
        self.ring_size = ring_size;
        self
    }

    /// Parses an `[engine]`-style TOML table and validates it.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "output size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.ring_size == 0 || self.ring_size > MAX_RING_SIZE {
            return Err(ConfigError::Invalid(format!(
                "ring_size must be between 1 and {MAX_RING_SIZE}, got {}",
                self.ring_size
            )));
        }
        Ok(())
    }

    /// Egress channel bounded to the ring, as `Engine::animate` expects.
    pub fn frame_channel(&self) -> (Sender<RasterImage>, Receiver<RasterImage>) {
        crossbeam_channel::bounded(self.ring_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_fills_defaults() {
        let config = EngineConfig::from_toml_str("width = 64").unwrap();
        assert_eq!(config.width, 64);
        assert_eq!(config.height, 512);
        assert_eq!(config.ring_size, DEFAULT_RING_SIZE);
    }

    #[test]
    fn engine_config_rejects_zero_ring() {
        let err = EngineConfig::from_toml_str("ring_size = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn engine_config_rejects_empty_output() {
        let err = EngineConfig::from_toml_str("width = 0\nheight = 10").unwrap_err();
        assert!(err.to_string().contains("0x10"));
    }

    #[test]
    fn engine_config_reports_syntax_errors() {
        let err = EngineConfig::from_toml_str("width = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn frame_channel_is_bounded_to_the_ring() {
        let (tx, _rx) = EngineConfig::new(4, 4).with_ring_size(5).frame_channel();
        assert_eq!(tx.capacity(), Some(5));
    }
}
