//! The render engine: owns the root ring, the active environment tree and
//! the hand-off that delivers replacement environments.
//!
//! Every environment is rendered by a node: a ring plus the
//! environment's program, uniform table and children. Children render
//! first each frame and are sampled by their parent through a texture
//! snapshot that lives only for that frame.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::backend::{
    Backend, BackendError, LinkedProgram, ProgramId, ShaderId, TextureId, UniformValues,
};
use crate::compile::{CompileError, LinkError};
use crate::environment::{Environment, ManagedEnvironment, RenderState, SubEnvironment};
use crate::glsl::UniformTable;
use crate::handoff::{handoff, EnvironmentReceiver, EnvironmentSender};
use crate::ring::{RenderRing, RingHandle};
use crate::source::Sources;
use crate::types::{ConfigError, EngineConfig, RasterImage};

/// Deepest sub-environment nesting accepted before a swap is rejected.
pub const MAX_SUB_ENVIRONMENT_DEPTH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("environment setup failed: {0:#}")]
    Setup(anyhow::Error),
    #[error("failed to declare sub-environments: {0:#}")]
    SubEnvironment(anyhow::Error),
    #[error("failed to load shader sources: {0:#}")]
    Source(anyhow::Error),
    #[error("failed to close environment: {0:#}")]
    Close(anyhow::Error),
    #[error("sub-environment `{name}`: {source}")]
    Child {
        name: String,
        #[source]
        source: Box<EngineError>,
    },
    #[error("sub-environment `{name}` has invalid size {width}x{height}")]
    InvalidSubEnvironment { name: String, width: u32, height: u32 },
    #[error("duplicate sub-environment name `{0}`")]
    DuplicateSubEnvironment(String),
    #[error("sub-environment cycle through `{0}`")]
    Cycle(String),
    #[error("sub-environments nested deeper than {MAX_SUB_ENVIRONMENT_DEPTH} levels")]
    TooDeep,
    #[error("environment lifecycle violated: {0}")]
    Lifecycle(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(
        "frame channel must be bounded to at most the ring capacity {ring}, got {}",
        egress_capacity(.capacity)
    )]
    Egress { capacity: Option<usize>, ring: usize },
    #[error("frame was overwritten before it was read")]
    StaleFrame,
    #[error("no environment is active")]
    NoEnvironment,
    #[error("engine is closed")]
    Closed,
}

impl EngineError {
    /// Whether the engine can keep rendering after this error. Failed swaps
    /// leave the previous environment running; device failures do not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Backend(_) | EngineError::StaleFrame | EngineError::Closed => false,
            EngineError::Child { source, .. } => source.is_recoverable(),
            _ => true,
        }
    }
}

fn egress_capacity(capacity: &Option<usize>) -> String {
    capacity.map_or_else(|| "an unbounded channel".to_string(), |c| c.to_string())
}

/// Renders environments into a ring of off-screen targets.
///
/// An engine and its backend belong to the thread that created them.
/// Other threads talk to it only through [`EnvironmentSender`] and the
/// frame channel passed to [`Engine::animate`].
pub struct Engine<B: Backend> {
    backend: B,
    root: Option<RenderNode>,
    ring_size: usize,
    sender: EnvironmentSender,
    pub(crate) receiver: EnvironmentReceiver,
    swap_error: Option<EngineError>,
}

impl<B: Backend> Engine<B> {
    pub fn new(mut backend: B, config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let ring = RenderRing::setup(
            &mut backend,
            config.width,
            config.height,
            config.ring_size,
            true,
        )?;
        let (sender, receiver) = handoff();
        info!(
            width = config.width,
            height = config.height,
            ring_size = config.ring_size,
            "render engine ready"
        );
        Ok(Self {
            backend,
            root: Some(RenderNode::new(ring)),
            ring_size: config.ring_size,
            sender,
            receiver,
            swap_error: None,
        })
    }

    /// A handle other threads use to publish replacement environments.
    pub fn environment_sender(&self) -> EnvironmentSender {
        self.sender.clone()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Shader time of the next frame.
    pub fn time(&self) -> Duration {
        self.root.as_ref().map_or(Duration::ZERO, |root| root.time)
    }

    /// Index of the next frame.
    pub fn frame(&self) -> u64 {
        self.root.as_ref().map_or(0, |root| root.frame)
    }

    pub fn size(&self) -> (u32, u32) {
        self.root
            .as_ref()
            .map_or((0, 0), |root| root.ring.size())
    }

    pub fn ring_capacity(&self) -> usize {
        self.root
            .as_ref()
            .map_or(0, |root| root.ring.capacity())
    }

    pub fn is_active(&self) -> bool {
        self.root
            .as_ref()
            .is_some_and(|root| root.active.is_some())
    }

    pub fn is_closed(&self) -> bool {
        self.root.is_none()
    }

    /// Activates `environment` right away. On failure the previous
    /// environment keeps rendering and the error is returned.
    pub fn load(&mut self, environment: Box<dyn Environment>) -> Result<(), EngineError> {
        self.swap(environment)
    }

    /// The error of the most recent failed background swap, if it has not
    /// been taken yet.
    pub fn take_swap_error(&mut self) -> Option<EngineError> {
        self.swap_error.take()
    }

    /// Applies a pending environment, then renders one frame.
    ///
    /// Returns `Ok(None)` while no environment has been activated. Failed
    /// swaps are logged and kept for [`Engine::take_swap_error`]; only
    /// unrecoverable errors are returned.
    pub fn tick(&mut self, interval: Duration) -> Result<Option<RingHandle>, EngineError> {
        if self.root.is_none() {
            return Err(EngineError::Closed);
        }
        if let Some(environment) = self.receiver.try_take() {
            self.apply_swap(environment)?;
        }
        let Some(root) = self.root.as_mut() else {
            return Err(EngineError::Closed);
        };
        if root.active.is_none() {
            return Ok(None);
        }
        root.tick(&mut self.backend, interval).map(Some)
    }

    /// Waits for the frame behind `handle` and returns it top row first.
    pub fn image(&mut self, handle: RingHandle) -> Result<RasterImage, EngineError> {
        let root = self.root.as_mut().ok_or(EngineError::Closed)?;
        root.ring.image(&mut self.backend, handle)
    }

    /// Renders a single frame at the current time and frame index and
    /// returns it. Neither counter advances, so repeated calls see the same
    /// `RenderState`.
    pub fn render_image(&mut self) -> Result<RasterImage, EngineError> {
        let frame = self.frame();
        let handle = self
            .tick(Duration::ZERO)?
            .ok_or(EngineError::NoEnvironment)?;
        if let Some(root) = self.root.as_mut() {
            root.frame = frame;
        }
        self.image(handle)
    }

    /// Releases every environment, program and target. Closing twice is a
    /// no-op.
    pub fn close(&mut self) -> Result<(), EngineError> {
        let Some(root) = self.root.take() else {
            return Ok(());
        };
        if let Some(pending) = self.receiver.try_take() {
            debug!(
                environment = pending.name(),
                "discarding environment published during shutdown"
            );
        }
        let result = root.close(&mut self.backend);
        info!("render engine closed");
        result
    }

    pub(crate) fn apply_swap(
        &mut self,
        environment: Box<dyn Environment>,
    ) -> Result<(), EngineError> {
        match self.swap(environment) {
            Ok(()) => Ok(()),
            Err(err) if err.is_recoverable() => {
                error!(error = %err, "environment swap failed, keeping the current environment");
                self.swap_error = Some(err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn swap(&mut self, environment: Box<dyn Environment>) -> Result<(), EngineError> {
        let root = self.root.as_mut().ok_or(EngineError::Closed)?;
        let name = environment.name().to_string();
        let started = Instant::now();
        let (width, height) = root.ring.size();
        let frame = Frame {
            time: root.time,
            frame: root.frame,
            width,
            height,
        };
        let mut builder = Builder {
            backend: &mut self.backend,
            ring_size: self.ring_size,
            ancestors: Vec::new(),
        };
        let active = builder.activate(environment, frame, 0)?;
        if let Some(replaced) = root.active.replace(active) {
            if let Err(err) = replaced.close(&mut self.backend) {
                warn!(error = %err, "failed to close replaced environment");
            }
        }
        info!(
            environment = %name,
            elapsed = ?started.elapsed(),
            "environment activated"
        );
        Ok(())
    }
}

impl<B: Backend> Drop for Engine<B> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "render engine closed with errors");
        }
    }
}

/// Clock and size a new environment starts with.
#[derive(Clone, Copy, Debug)]
struct Frame {
    time: Duration,
    frame: u64,
    width: u32,
    height: u32,
}

/// A ring plus whatever environment currently renders into it.
struct RenderNode {
    ring: RenderRing,
    time: Duration,
    frame: u64,
    previous: Option<RingHandle>,
    active: Option<ActiveEnvironment>,
}

struct ActiveEnvironment {
    environment: ManagedEnvironment,
    program: ProgramId,
    uniforms: UniformTable,
    children: Vec<(String, RenderNode)>,
}

impl RenderNode {
    fn new(ring: RenderRing) -> Self {
        Self {
            ring,
            time: Duration::ZERO,
            frame: 0,
            previous: None,
            active: None,
        }
    }

    fn tick<B: Backend>(
        &mut self,
        backend: &mut B,
        interval: Duration,
    ) -> Result<RingHandle, EngineError> {
        let Some(active) = self.active.as_mut() else {
            return Err(EngineError::NoEnvironment);
        };
        let (width, height) = self.ring.size();
        let clock = Frame {
            time: self.time,
            frame: self.frame,
            width,
            height,
        };
        let mut transient = Vec::new();
        let outcome = render(
            backend,
            &mut self.ring,
            active,
            self.previous,
            clock,
            interval,
            &mut transient,
        );
        for texture in transient {
            backend.release_texture(texture);
        }
        let handle = outcome?;
        self.time += interval;
        self.frame += 1;
        self.previous = Some(handle);
        Ok(handle)
    }

    fn close<B: Backend>(self, backend: &mut B) -> Result<(), EngineError> {
        let result = match self.active {
            Some(active) => active.close(backend),
            None => Ok(()),
        };
        self.ring.close(backend);
        result
    }
}

impl ActiveEnvironment {
    /// Closes children first, then the program, then the environment. The
    /// first error is returned after everything has been released.
    fn close<B: Backend>(self, backend: &mut B) -> Result<(), EngineError> {
        let ActiveEnvironment {
            mut environment,
            program,
            children,
            ..
        } = self;
        let mut first_error = close_children(backend, children).err();
        backend.delete_program(program);
        if let Err(err) = environment.close(backend) {
            first_error.get_or_insert(err);
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn close_children<B: Backend>(
    backend: &mut B,
    children: Vec<(String, RenderNode)>,
) -> Result<(), EngineError> {
    let mut first_error = None;
    for (name, child) in children {
        if let Err(err) = child.close(backend) {
            warn!(sub_environment = %name, error = %err, "failed to close sub-environment");
            first_error.get_or_insert(EngineError::Child {
                name,
                source: Box::new(err),
            });
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Draws one frame of `active` into the next slot of `ring`.
///
/// Textures created along the way are pushed to `transient` so the caller
/// can release them whether or not the frame succeeded.
fn render<B: Backend>(
    backend: &mut B,
    ring: &mut RenderRing,
    active: &mut ActiveEnvironment,
    previous: Option<RingHandle>,
    clock: Frame,
    interval: Duration,
    transient: &mut Vec<TextureId>,
) -> Result<RingHandle, EngineError> {
    let mut sub_buffers = BTreeMap::new();
    for (name, child) in &mut active.children {
        let handle = child
            .tick(backend, interval)
            .map_err(|err| child_error(name, err))?;
        let texture = child
            .ring
            .texture(backend, handle)
            .map_err(|err| child_error(name, err))?;
        transient.push(texture);
        sub_buffers.insert(name.clone(), texture);
    }

    let mut uniforms = UniformValues::new();
    let snapshot = Cell::new(None);
    let failure = RefCell::new(None);
    {
        let shared = RefCell::new(&mut *backend);
        let ring = &*ring;
        let previous_frame = || -> Option<TextureId> {
            if let Some(texture) = snapshot.get() {
                return Some(texture);
            }
            let handle = previous?;
            let mut backend = shared.borrow_mut();
            match ring.texture(&mut **backend, handle) {
                Ok(texture) => {
                    snapshot.set(Some(texture));
                    Some(texture)
                }
                Err(err) => {
                    failure.replace(Some(err));
                    None
                }
            }
        };
        let state = RenderState::new(clock.time, clock.frame, clock.width, clock.height)
            .with_interval(interval)
            .with_uniforms(&active.uniforms)
            .with_sub_buffers(&sub_buffers)
            .with_previous_frame(&previous_frame);
        active.environment.pre_render(&state, &mut uniforms);
    }
    if let Some(texture) = snapshot.get() {
        transient.push(texture);
    }
    if let Some(err) = failure.into_inner() {
        return Err(err);
    }

    let program = active.program;
    ring.draw(backend, |backend, target| {
        backend.draw(program, target, &uniforms)
    })
}

fn child_error(name: &str, err: EngineError) -> EngineError {
    // Device errors are reported as-is so callers can tell them apart.
    if err.is_recoverable() {
        EngineError::Child {
            name: name.to_string(),
            source: Box::new(err),
        }
    } else {
        err
    }
}

/// Builds an environment tree during a swap.
struct Builder<'b, B: Backend> {
    backend: &'b mut B,
    ring_size: usize,
    /// Identities of the environments currently being built, outermost
    /// first.
    ancestors: Vec<String>,
}

impl<B: Backend> Builder<'_, B> {
    /// Runs setup, builds children, then compiles and links. On failure
    /// everything acquired so far is released again.
    fn activate(
        &mut self,
        environment: Box<dyn Environment>,
        frame: Frame,
        depth: usize,
    ) -> Result<ActiveEnvironment, EngineError> {
        if depth > MAX_SUB_ENVIRONMENT_DEPTH {
            return Err(EngineError::TooDeep);
        }
        let mut environment = ManagedEnvironment::new(environment);
        let identity = environment.identity();
        if let Some(identity) = &identity {
            if self.ancestors.contains(identity) {
                return Err(EngineError::Cycle(identity.clone()));
            }
        }

        let state = RenderState::new(frame.time, frame.frame, frame.width, frame.height);
        environment.setup(&state, &mut *self.backend)?;
        debug!(environment = environment.name(), depth, "environment set up");

        let pushed = identity.is_some();
        if let Some(identity) = identity {
            self.ancestors.push(identity);
        }
        let built = self.build_program(&mut environment, frame, depth);
        if pushed {
            self.ancestors.pop();
        }

        match built {
            Ok((children, linked)) => Ok(ActiveEnvironment {
                environment,
                program: linked.id,
                uniforms: linked.uniforms,
                children,
            }),
            Err(err) => {
                if let Err(close_err) = environment.close(&mut *self.backend) {
                    warn!(error = %close_err, "failed to close environment after a failed swap");
                }
                Err(err)
            }
        }
    }

    fn build_program(
        &mut self,
        environment: &mut ManagedEnvironment,
        frame: Frame,
        depth: usize,
    ) -> Result<(Vec<(String, RenderNode)>, LinkedProgram), EngineError> {
        let declared = environment.sub_environments()?;
        for (i, sub) in declared.iter().enumerate() {
            if declared[..i].iter().any(|other| other.name == sub.name) {
                return Err(EngineError::DuplicateSubEnvironment(sub.name.clone()));
            }
        }

        let mut children = Vec::with_capacity(declared.len());
        for sub in declared {
            let name = sub.name.clone();
            match self.build_child(sub, frame, depth + 1) {
                Ok(node) => children.push((name, node)),
                Err(err) => {
                    discard_children(self.backend, children);
                    return Err(child_error(&name, err));
                }
            }
        }

        match environment
            .sources()
            .and_then(|sources| link_sources(self.backend, &sources))
        {
            Ok(linked) => Ok((children, linked)),
            Err(err) => {
                discard_children(self.backend, children);
                Err(err)
            }
        }
    }

    fn build_child(
        &mut self,
        sub: SubEnvironment,
        parent: Frame,
        depth: usize,
    ) -> Result<RenderNode, EngineError> {
        let SubEnvironment {
            name,
            environment,
            width,
            height,
        } = sub;
        if width == 0 || height == 0 {
            return Err(EngineError::InvalidSubEnvironment {
                name,
                width,
                height,
            });
        }
        let frame = Frame {
            width,
            height,
            ..parent
        };
        let ring = RenderRing::setup(&mut *self.backend, width, height, self.ring_size, false)?;
        match self.activate(environment, frame, depth) {
            Ok(active) => Ok(RenderNode {
                ring,
                time: frame.time,
                frame: frame.frame,
                previous: None,
                active: Some(active),
            }),
            Err(err) => {
                ring.close(&mut *self.backend);
                Err(err)
            }
        }
    }
}

fn discard_children<B: Backend>(backend: &mut B, children: Vec<(String, RenderNode)>) {
    if let Err(err) = close_children(backend, children) {
        warn!(error = %err, "failed to close sub-environments after a failed swap");
    }
}

/// Compiles every stage and links them. Shader objects are deleted again
/// whatever the outcome.
fn link_sources<B: Backend>(
    backend: &mut B,
    sources: &Sources,
) -> Result<LinkedProgram, EngineError> {
    let mut shaders = Vec::with_capacity(sources.len());
    let result = compile_stages(backend, sources, &mut shaders)
        .and_then(|()| backend.link_program(&shaders).map_err(EngineError::from));
    for shader in shaders {
        backend.delete_shader(shader);
    }
    result
}

fn compile_stages<B: Backend>(
    backend: &mut B,
    sources: &Sources,
    shaders: &mut Vec<ShaderId>,
) -> Result<(), EngineError> {
    for (stage, fragments) in sources {
        let texts = fragments
            .iter()
            .map(|source| source.contents())
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(EngineError::Source)?;
        shaders.push(backend.compile_stage(*stage, &texts)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{TextureStore, UniformValue};
    use crate::headless::HeadlessBackend;
    use crate::source::Source;
    use crate::types::Stage;

    struct Solid {
        value: f32,
    }

    impl Environment for Solid {
        fn setup(&mut self, _: &RenderState<'_>, _: &mut dyn TextureStore) -> anyhow::Result<()> {
            Ok(())
        }

        fn sources(&self) -> anyhow::Result<Sources> {
            Ok(Sources::from([
                (Stage::Vertex, vec![Source::text("void main() {}")]),
                (
                    Stage::Fragment,
                    vec![Source::text("uniform float value;\nvoid main() {}")],
                ),
            ]))
        }

        fn pre_render(&mut self, _: &RenderState<'_>, uniforms: &mut UniformValues) {
            uniforms.set("value", UniformValue::Float(self.value));
        }

        fn close(&mut self, _: &mut dyn TextureStore) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn engine() -> Engine<HeadlessBackend> {
        Engine::new(HeadlessBackend::new(), &EngineConfig::new(4, 4)).unwrap()
    }

    #[test]
    fn idle_engine_renders_nothing() {
        let mut engine = engine();
        assert!(engine.tick(Duration::from_millis(16)).unwrap().is_none());
        assert_eq!(engine.frame(), 0);
        assert!(engine.backend().draws().is_empty());
    }

    #[test]
    fn tick_advances_clock() {
        let mut engine = engine();
        engine.load(Box::new(Solid { value: 0.5 })).unwrap();
        engine.tick(Duration::from_millis(10)).unwrap();
        engine.tick(Duration::from_millis(10)).unwrap();
        assert_eq!(engine.frame(), 2);
        assert_eq!(engine.time(), Duration::from_millis(20));
    }

    #[test]
    fn render_image_keeps_the_clock() {
        let mut engine = engine();
        engine.load(Box::new(Solid { value: 0.5 })).unwrap();
        let image = engine.render_image().unwrap();
        assert_eq!(image.dimensions(), (4, 4));
        let again = engine.render_image().unwrap();
        assert_eq!(image.as_raw(), again.as_raw());
        assert_eq!(engine.time(), Duration::ZERO);
        assert_eq!(engine.frame(), 0);
    }

    #[test]
    fn render_image_without_environment_fails() {
        let mut engine = engine();
        assert!(matches!(
            engine.render_image(),
            Err(EngineError::NoEnvironment)
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let mut engine = engine();
        engine.load(Box::new(Solid { value: 0.5 })).unwrap();
        engine.close().unwrap();
        engine.close().unwrap();
        assert!(engine.is_closed());
        assert_eq!(engine.backend().live_targets(), 0);
        assert_eq!(engine.backend().live_programs(), 0);
        assert!(matches!(
            engine.tick(Duration::ZERO),
            Err(EngineError::Closed)
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = EngineConfig::new(0, 4);
        assert!(matches!(
            Engine::new(HeadlessBackend::new(), &config),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn recoverable_errors() {
        assert!(EngineError::Cycle("a".into()).is_recoverable());
        assert!(!EngineError::StaleFrame.is_recoverable());
        let nested = EngineError::Child {
            name: "a".into(),
            source: Box::new(EngineError::Backend(BackendError::Device("lost".into()))),
        };
        assert!(!nested.is_recoverable());
    }
}
