//! The contract between the engine and a shader flavour.
//!
//! An [`Environment`] supplies stage sources, acquires its external
//! resources once, pushes uniform values every frame and may declare
//! child environments whose output it samples. Environments are handed to
//! the engine by value, which rules out sharing one between engines; the
//! engine wraps each in a lifecycle guard so that setting one up or
//! closing it twice is reported instead of silently repeated.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::Result;

use crate::backend::{TextureId, TextureStore, UniformValues};
use crate::engine::EngineError;
use crate::glsl::UniformTable;
use crate::source::Sources;

/// A shader flavour: sources, resources, per-frame uniforms and children.
///
/// Call order during a swap is `setup`, `sub_environments`, `sources`.
/// `pre_render` then runs once per frame until `close`.
pub trait Environment: Send {
    /// Short label for logs.
    fn name(&self) -> &str {
        "environment"
    }

    /// Key identifying what this environment renders, for example the
    /// canonical path of its root shader. A key repeated along one branch
    /// of the sub-environment tree is a cycle.
    fn identity(&self) -> Option<String> {
        None
    }

    /// Acquires external resources. Anything opened before a failure must
    /// be released before returning the error.
    fn setup(&mut self, state: &RenderState<'_>, textures: &mut dyn TextureStore) -> Result<()>;

    /// Child environments rendered before this one every frame.
    fn sub_environments(&mut self) -> Result<Vec<SubEnvironment>> {
        Ok(Vec::new())
    }

    fn sources(&self) -> Result<Sources>;

    /// Pushes this frame's uniform values. Must not block.
    fn pre_render(&mut self, state: &RenderState<'_>, uniforms: &mut UniformValues);

    fn close(&mut self, textures: &mut dyn TextureStore) -> Result<()>;
}

/// A named child environment rendered at its own resolution.
pub struct SubEnvironment {
    pub name: String,
    pub environment: Box<dyn Environment>,
    pub width: u32,
    pub height: u32,
}

impl SubEnvironment {
    pub fn new(
        name: impl Into<String>,
        environment: Box<dyn Environment>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            name: name.into(),
            environment,
            width,
            height,
        }
    }
}

impl fmt::Debug for SubEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubEnvironment")
            .field("name", &self.name)
            .field("environment", &self.environment.name())
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// An external input bound to shader uniforms (image, noise, peripheral,
/// nested buffer, ...).
pub trait Resource: Send {
    /// GLSL declarations this resource needs in the fragment stage.
    fn uniform_source(&self) -> String;

    /// Pushes this frame's values. Runtime failures are absorbed here by
    /// falling back to the last good value.
    fn pre_render(&mut self, state: &RenderState<'_>, uniforms: &mut UniformValues);

    /// Buffers render a child environment; everything else has none.
    fn sub_environment(&mut self) -> Result<Option<SubEnvironment>> {
        Ok(None)
    }

    fn close(&mut self, textures: &mut dyn TextureStore) -> Result<()>;
}

static NO_SUB_BUFFERS: BTreeMap<String, TextureId> = BTreeMap::new();
static NO_UNIFORMS: UniformTable = UniformTable::EMPTY;

/// Per-frame parameters handed to environments and resources.
#[derive(Clone, Copy)]
pub struct RenderState<'a> {
    /// Animation time at the start of this frame.
    pub time: Duration,
    /// Time since the previous frame.
    pub interval: Duration,
    /// Frames rendered so far.
    pub frame: u64,
    pub width: u32,
    pub height: u32,
    /// Uniforms of the active program; empty during setup.
    pub uniforms: &'a UniformTable,
    /// Current output of each sub-environment, by name.
    pub sub_buffers: &'a BTreeMap<String, TextureId>,
    previous_frame: Option<&'a dyn Fn() -> Option<TextureId>>,
}

impl RenderState<'static> {
    pub fn new(time: Duration, frame: u64, width: u32, height: u32) -> Self {
        Self {
            time,
            interval: Duration::ZERO,
            frame,
            width,
            height,
            uniforms: &NO_UNIFORMS,
            sub_buffers: &NO_SUB_BUFFERS,
            previous_frame: None,
        }
    }
}

impl<'a> RenderState<'a> {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_uniforms(mut self, uniforms: &'a UniformTable) -> Self {
        self.uniforms = uniforms;
        self
    }

    pub fn with_sub_buffers(mut self, sub_buffers: &'a BTreeMap<String, TextureId>) -> Self {
        self.sub_buffers = sub_buffers;
        self
    }

    pub fn with_previous_frame(mut self, previous: &'a dyn Fn() -> Option<TextureId>) -> Self {
        self.previous_frame = Some(previous);
        self
    }

    /// Texture holding the previous frame of this engine, created on first
    /// request. `None` before the first frame.
    pub fn previous_frame(&self) -> Option<TextureId> {
        self.previous_frame.and_then(|previous| previous())
    }

    pub fn sub_buffer(&self, name: &str) -> Option<TextureId> {
        self.sub_buffers.get(name).copied()
    }
}

impl fmt::Debug for RenderState<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderState")
            .field("time", &self.time)
            .field("interval", &self.interval)
            .field("frame", &self.frame)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sub_buffers", &self.sub_buffers)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Fresh,
    Ready,
    Failed,
    Closed,
}

/// Lifecycle guard around an environment owned by the engine.
pub(crate) struct ManagedEnvironment {
    inner: Box<dyn Environment>,
    phase: Phase,
}

impl ManagedEnvironment {
    pub(crate) fn new(inner: Box<dyn Environment>) -> Self {
        Self {
            inner,
            phase: Phase::Fresh,
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.inner.name()
    }

    pub(crate) fn identity(&self) -> Option<String> {
        self.inner.identity()
    }

    fn expect_phase(&self, expected: Phase, operation: &str) -> Result<(), EngineError> {
        if self.phase == expected {
            return Ok(());
        }
        Err(EngineError::Lifecycle(format!(
            "{operation} called on {} environment `{}`",
            match self.phase {
                Phase::Fresh => "a fresh",
                Phase::Ready => "an already set up",
                Phase::Failed => "a failed",
                Phase::Closed => "a closed",
            },
            self.inner.name()
        )))
    }

    pub(crate) fn setup(
        &mut self,
        state: &RenderState<'_>,
        textures: &mut dyn TextureStore,
    ) -> Result<(), EngineError> {
        self.expect_phase(Phase::Fresh, "setup")?;
        match self.inner.setup(state, textures) {
            Ok(()) => {
                self.phase = Phase::Ready;
                Ok(())
            }
            Err(err) => {
                self.phase = Phase::Failed;
                Err(EngineError::Setup(err))
            }
        }
    }

    pub(crate) fn sub_environments(&mut self) -> Result<Vec<SubEnvironment>, EngineError> {
        self.expect_phase(Phase::Ready, "sub_environments")?;
        self.inner
            .sub_environments()
            .map_err(EngineError::SubEnvironment)
    }

    pub(crate) fn sources(&self) -> Result<Sources, EngineError> {
        self.expect_phase(Phase::Ready, "sources")?;
        self.inner.sources().map_err(EngineError::Source)
    }

    pub(crate) fn pre_render(&mut self, state: &RenderState<'_>, uniforms: &mut UniformValues) {
        if self.phase == Phase::Ready {
            self.inner.pre_render(state, uniforms);
        }
    }

    /// Closes a set up environment. Environments that never finished setup
    /// own nothing and are closed without calling into them.
    pub(crate) fn close(&mut self, textures: &mut dyn TextureStore) -> Result<(), EngineError> {
        match self.phase {
            Phase::Closed => Err(EngineError::Lifecycle(format!(
                "close called twice on environment `{}`",
                self.inner.name()
            ))),
            Phase::Fresh | Phase::Failed => {
                self.phase = Phase::Closed;
                Ok(())
            }
            Phase::Ready => {
                self.phase = Phase::Closed;
                self.inner.close(textures).map_err(EngineError::Close)
            }
        }
    }
}

impl Drop for ManagedEnvironment {
    fn drop(&mut self) {
        if self.phase == Phase::Ready {
            tracing::warn!(
                environment = self.inner.name(),
                "environment dropped without being closed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, TextureDesc, UniformValue};
    use crate::source::Source;
    use crate::types::Stage;
    use std::cell::Cell;

    struct NullStore;

    impl TextureStore for NullStore {
        fn create_texture(&mut self, _: &TextureDesc, _: &[u8]) -> Result<TextureId, BackendError> {
            Ok(TextureId::from_raw(0))
        }

        fn release_texture(&mut self, _: TextureId) {}
    }

    #[derive(Default)]
    struct Counting {
        setups: usize,
        closes: usize,
        fail_setup: bool,
    }

    impl Environment for Counting {
        fn setup(&mut self, _: &RenderState<'_>, _: &mut dyn TextureStore) -> Result<()> {
            self.setups += 1;
            if self.fail_setup {
                anyhow::bail!("no such device");
            }
            Ok(())
        }

        fn sources(&self) -> Result<Sources> {
            Ok(Sources::from([(Stage::Fragment, vec![Source::text("void main() {}")])]))
        }

        fn pre_render(&mut self, state: &RenderState<'_>, uniforms: &mut UniformValues) {
            uniforms.set("frame", UniformValue::Int(state.frame as i32));
        }

        fn close(&mut self, _: &mut dyn TextureStore) -> Result<()> {
            self.closes += 1;
            Ok(())
        }
    }

    fn state() -> RenderState<'static> {
        RenderState::new(Duration::ZERO, 0, 4, 4)
    }

    #[test]
    fn second_setup_is_rejected() {
        let mut env = ManagedEnvironment::new(Box::new(Counting::default()));
        env.setup(&state(), &mut NullStore).unwrap();
        let err = env.setup(&state(), &mut NullStore).unwrap_err();
        assert!(matches!(err, EngineError::Lifecycle(_)));
        env.close(&mut NullStore).unwrap();
    }

    #[test]
    fn second_close_is_rejected() {
        let mut env = ManagedEnvironment::new(Box::new(Counting::default()));
        env.setup(&state(), &mut NullStore).unwrap();
        env.close(&mut NullStore).unwrap();
        let err = env.close(&mut NullStore).unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn failed_setup_is_not_closed_again() {
        let mut env = ManagedEnvironment::new(Box::new(Counting {
            fail_setup: true,
            ..Counting::default()
        }));
        let err = env.setup(&state(), &mut NullStore).unwrap_err();
        assert!(matches!(err, EngineError::Setup(_)));
        assert!(env.sources().is_err());
        env.close(&mut NullStore).unwrap();
    }

    #[test]
    fn pre_render_before_setup_is_skipped() {
        let mut env = ManagedEnvironment::new(Box::new(Counting::default()));
        let mut uniforms = UniformValues::new();
        env.pre_render(&state(), &mut uniforms);
        assert!(uniforms.is_empty());
    }

    #[test]
    fn previous_frame_is_evaluated_on_demand() {
        let calls = Cell::new(0);
        let previous = || {
            calls.set(calls.get() + 1);
            Some(TextureId::from_raw(3))
        };
        let state = state().with_previous_frame(&previous);
        assert_eq!(calls.get(), 0);
        assert_eq!(state.previous_frame(), Some(TextureId::from_raw(3)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn missing_sub_buffer_is_none() {
        let buffers = BTreeMap::from([("a".to_string(), TextureId::from_raw(1))]);
        let state = state().with_sub_buffers(&buffers);
        assert_eq!(state.sub_buffer("a"), Some(TextureId::from_raw(1)));
        assert_eq!(state.sub_buffer("b"), None);
    }
}
