use std::fmt;
use std::path::Path;
use std::time::Duration;

use renderer::{ConfigError, EngineConfig};
use serde::de::{self, Deserializer};
use serde::Deserialize;

pub const DEFAULT_GLSL_VERSION: &str = "330";

/// Top-level configuration, usually read from `shady.toml`.
///
/// ```toml
/// framerate = 30
/// duration = "10s"
/// realtime = true
/// glsl_version = "330"
/// environment = "shadertoy"
/// mappings = ["iChannel0=image:~/textures/wood.png"]
///
/// [engine]
/// width = 640
/// height = 360
/// ring_size = 3
///
/// [watch]
/// enabled = true
/// debounce = "50ms"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShadyConfig {
    pub engine: EngineConfig,
    /// Frames per second; `0` renders a single image.
    pub framerate: f64,
    /// Stop after this many frames. Needs a framerate.
    pub frames: Option<u64>,
    /// Stop after this much shader time. Needs a framerate; exclusive
    /// with `frames`.
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub duration: Option<Duration>,
    /// Deliver frames no faster than the framerate.
    pub realtime: bool,
    pub glsl_version: String,
    /// Skips detection and always builds this environment.
    pub environment: Option<String>,
    /// `<uniform>=<kind>:<value>` overrides for ShaderToy mappings.
    pub mappings: Vec<String>,
    pub watch: WatchConfig,
}

impl Default for ShadyConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            framerate: 0.0,
            frames: None,
            duration: None,
            realtime: false,
            glsl_version: DEFAULT_GLSL_VERSION.to_string(),
            environment: None,
            mappings: Vec::new(),
            watch: WatchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    pub enabled: bool,
    /// Quiet period after a change before the shader is rebuilt.
    #[serde(deserialize_with = "deserialize_duration")]
    pub debounce: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce: default_debounce(),
        }
    }
}

fn default_debounce() -> Duration {
    Duration::from_millis(20)
}

impl ShadyConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: ShadyConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path).map_err(|err| {
            ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        if !self.framerate.is_finite() || self.framerate < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "framerate must be zero or a positive number, got {}",
                self.framerate
            )));
        }
        let animated = self.framerate > 0.0;
        if self.frames.is_some() && self.duration.is_some() {
            return Err(ConfigError::Invalid(
                "frames and duration are mutually exclusive".into(),
            ));
        }
        for (set, key) in [
            (self.frames.is_some(), "frames"),
            (self.duration.is_some(), "duration"),
            (self.realtime, "realtime"),
        ] {
            if set && !animated {
                return Err(ConfigError::Invalid(format!(
                    "{key} is set while framerate is not"
                )));
            }
        }
        if self.frame_limit() == Some(0) {
            return Err(ConfigError::Invalid(
                "frame limit must allow at least one frame".into(),
            ));
        }
        if self.glsl_version.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "glsl_version must not be empty".into(),
            ));
        }
        if let Some(name) = &self.environment {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "environment must name an environment when set".into(),
                ));
            }
        }
        Ok(())
    }

    /// Number of frames to deliver before stopping; `None` animates until
    /// cancelled. Single-image mode delivers one.
    pub fn frame_limit(&self) -> Option<u64> {
        if self.framerate <= 0.0 {
            return Some(1);
        }
        match (self.frames, self.duration) {
            (Some(frames), _) => Some(frames),
            (None, Some(duration)) => Some((duration.as_secs_f64() * self.framerate) as u64),
            (None, None) => None,
        }
    }

    /// Time between frames; zero in single-image mode.
    pub fn frame_interval(&self) -> Duration {
        if self.framerate > 0.0 {
            Duration::from_secs_f64(1.0 / self.framerate)
        } else {
            Duration::ZERO
        }
    }
}

fn deserialize_optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration(deserializer).map(Some)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must be non-negative"))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if !v.is_finite() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs_f64(v))
        }
    }

    deserializer.deserialize_any(Visitor)
}
