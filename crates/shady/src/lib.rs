//! Front door of the shady render engine.
//!
//! Ties the renderer to the two shader flavours: a [`Loader`] detects
//! whether a file is a ShaderToy or a GLSLSandbox shader and builds the
//! environment, [`watch`] rebuilds it on every edit and [`run`] drives an
//! engine from a [`ShadyConfig`].
//!
//! ```no_run
//! use std::path::Path;
//! use renderer::{CancelToken, HeadlessBackend};
//!
//! shady::init_tracing("info");
//! let config = shady::ShadyConfig::default();
//! let (frames, images) = config.engine.frame_channel();
//! shady::run(
//!     HeadlessBackend::new(),
//!     &config,
//!     Path::new("shaders/plasma.glsl"),
//!     &frames,
//!     &CancelToken::new(),
//! )?;
//! let image = images.recv()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod config;
mod loader;
mod logging;
mod run;
mod watch;

pub use config::{ShadyConfig, WatchConfig, DEFAULT_GLSL_VERSION};
pub use loader::{default_detectors, BuildFn, Detector, LoadError, LoadOptions, Loader};
pub use logging::init_tracing;
pub use run::run;
pub use watch::watch;
