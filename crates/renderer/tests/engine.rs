use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use renderer::{
    CancelToken, Engine, EngineConfig, EngineError, Environment, HeadlessBackend, RasterImage,
    RenderState, Source, Sources, Stage, SubEnvironment, TextureStore, UniformValue,
    UniformValues,
};

#[derive(Clone, Debug, PartialEq)]
enum Event {
    Setup(String),
    Frame {
        name: String,
        time: Duration,
        frame: u64,
    },
    Close(String),
}

#[derive(Clone, Default)]
struct Events(Arc<Mutex<Vec<Event>>>);

impl Events {
    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    fn all(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
        self.all().iter().filter(|event| matches(event)).count()
    }

    fn setups(&self, name: &str) -> usize {
        self.count(|event| matches!(event, Event::Setup(n) if n == name))
    }

    fn closes(&self, name: &str) -> usize {
        self.count(|event| matches!(event, Event::Close(n) if n == name))
    }

    fn frames(&self, name: &str) -> Vec<(Duration, u64)> {
        self.all()
            .into_iter()
            .filter_map(|event| match event {
                Event::Frame { name: n, time, frame } if n == name => Some((time, frame)),
                _ => None,
            })
            .collect()
    }
}

/// Configurable environment that reports its lifecycle to `events`.
#[derive(Clone)]
struct Probe {
    name: String,
    identity: Option<String>,
    fail_setup: bool,
    fail_sources: bool,
    children: Vec<Probe>,
    events: Events,
}

impl Probe {
    fn new(name: &str, events: &Events) -> Self {
        Self {
            name: name.to_string(),
            identity: None,
            fail_setup: false,
            fail_sources: false,
            children: Vec::new(),
            events: events.clone(),
        }
    }

    fn with_child(mut self, child: Probe) -> Self {
        self.children.push(child);
        self
    }

    fn with_identity(mut self, identity: &str) -> Self {
        self.identity = Some(identity.to_string());
        self
    }

    fn failing_setup(mut self) -> Self {
        self.fail_setup = true;
        self
    }

    fn failing_sources(mut self) -> Self {
        self.fail_sources = true;
        self
    }
}

impl Environment for Probe {
    fn name(&self) -> &str {
        &self.name
    }

    fn identity(&self) -> Option<String> {
        self.identity.clone()
    }

    fn setup(&mut self, _: &RenderState<'_>, _: &mut dyn TextureStore) -> Result<()> {
        if self.fail_setup {
            bail!("{} refuses to start", self.name);
        }
        self.events.push(Event::Setup(self.name.clone()));
        Ok(())
    }

    fn sub_environments(&mut self) -> Result<Vec<SubEnvironment>> {
        Ok(self
            .children
            .iter()
            .map(|child| SubEnvironment::new(child.name.clone(), Box::new(child.clone()), 2, 2))
            .collect())
    }

    fn sources(&self) -> Result<Sources> {
        if self.fail_sources {
            bail!("{} has no sources", self.name);
        }
        let mut fragment = String::from("uniform float time;\nuniform int frame;\n");
        for child in &self.children {
            fragment.push_str(&format!("uniform sampler2D {};\n", child.name));
        }
        fragment.push_str(&format!("// {}\nvoid main() {{}}\n", self.name));
        Ok(Sources::from([
            (Stage::Vertex, vec![Source::text("void main() {}")]),
            (Stage::Fragment, vec![Source::text(fragment)]),
        ]))
    }

    fn pre_render(&mut self, state: &RenderState<'_>, uniforms: &mut UniformValues) {
        self.events.push(Event::Frame {
            name: self.name.clone(),
            time: state.time,
            frame: state.frame,
        });
        uniforms.set("time", UniformValue::Float(state.time.as_secs_f32()));
        uniforms.set("frame", UniformValue::Int(state.frame as i32));
        for child in &self.children {
            if let Some(texture) = state.sub_buffer(&child.name) {
                uniforms.set(child.name.clone(), UniformValue::Sampler(texture));
            }
        }
    }

    fn close(&mut self, _: &mut dyn TextureStore) -> Result<()> {
        self.events.push(Event::Close(self.name.clone()));
        Ok(())
    }
}

/// Declares itself as its own child until the engine gives up.
struct Bottomless;

impl Environment for Bottomless {
    fn setup(&mut self, _: &RenderState<'_>, _: &mut dyn TextureStore) -> Result<()> {
        Ok(())
    }

    fn sub_environments(&mut self) -> Result<Vec<SubEnvironment>> {
        Ok(vec![SubEnvironment::new("deeper", Box::new(Bottomless), 1, 1)])
    }

    fn sources(&self) -> Result<Sources> {
        bail!("never reached")
    }

    fn pre_render(&mut self, _: &RenderState<'_>, _: &mut UniformValues) {}

    fn close(&mut self, _: &mut dyn TextureStore) -> Result<()> {
        Ok(())
    }
}

fn engine(ring_size: usize) -> Engine<HeadlessBackend> {
    let config = EngineConfig::new(4, 3).with_ring_size(ring_size);
    Engine::new(HeadlessBackend::new(), &config).unwrap()
}

fn root_cause(err: &EngineError) -> &EngineError {
    match err {
        EngineError::Child { source, .. } => root_cause(source),
        other => other,
    }
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn single_image_is_reproducible() {
    let render = || -> RasterImage {
        let events = Events::default();
        let mut engine = engine(3);
        engine.load(Box::new(Probe::new("main", &events))).unwrap();
        engine.render_image().unwrap()
    };
    let first = render();
    let second = render();
    assert_eq!(first.dimensions(), (4, 3));
    assert_eq!(first.as_raw(), second.as_raw());
}

#[test]
fn repeated_single_images_share_one_render_state() {
    let events = Events::default();
    let mut engine = engine(3);
    engine.load(Box::new(Probe::new("main", &events))).unwrap();
    engine.tick(Duration::from_millis(40)).unwrap();

    let first = engine.render_image().unwrap();
    let second = engine.render_image().unwrap();
    assert_eq!(first.as_raw(), second.as_raw());
    let frames = events.frames("main");
    assert_eq!(
        frames[1..],
        [
            (Duration::from_millis(40), 1),
            (Duration::from_millis(40), 1)
        ]
    );
    assert_eq!(engine.frame(), 1);
}

#[test]
fn frames_arrive_in_tick_order_for_every_ring_size() {
    for ring_size in 1..=4 {
        let events = Events::default();
        let mut engine = engine(ring_size);
        engine.load(Box::new(Probe::new("main", &events))).unwrap();

        let cancel = CancelToken::new();
        let (tx, rx) = engine.frame_channel();
        let collector = thread::spawn(move || rx.iter().collect::<Vec<RasterImage>>());
        let stopper = {
            let cancel = cancel.clone();
            let events = events.clone();
            thread::spawn(move || {
                wait_until(Duration::from_secs(5), || events.frames("main").len() >= 12);
                cancel.cancel();
            })
        };
        engine
            .animate(Duration::from_millis(16), &tx, &cancel)
            .unwrap();
        stopper.join().unwrap();
        drop(tx);

        let delivered = collector.join().unwrap();
        assert!(!delivered.is_empty(), "ring size {ring_size}");
        let draws = engine.backend().draws();
        for (k, image) in delivered.iter().enumerate() {
            assert_eq!(
                image.get_pixel(0, 0).0,
                draws[k].fill,
                "frame {k} with ring size {ring_size}"
            );
        }
        engine.close().unwrap();
    }
}

#[test]
fn driver_blocks_on_a_full_channel_and_resumes() {
    let events = Events::default();
    let mut engine = engine(3);
    let capacity = engine.ring_capacity();
    engine.load(Box::new(Probe::new("main", &events))).unwrap();

    let cancel = CancelToken::new();
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let driver = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            let result = engine.animate(Duration::from_millis(16), &tx, &cancel);
            (engine, result)
        })
    };

    // Filling the ring takes `capacity` ticks, the channel `capacity` more;
    // the next frame is then drawn and stuck waiting for room.
    let blocked_at = 2 * capacity;
    assert!(wait_until(Duration::from_secs(5), || rx.len() == capacity));
    assert!(wait_until(Duration::from_secs(5), || {
        events.frames("main").len() == blocked_at
    }));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(events.frames("main").len(), blocked_at);

    rx.recv().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        events.frames("main").len() > blocked_at
    }));

    cancel.cancel();
    let (mut engine, result) = driver.join().unwrap();
    result.unwrap();
    engine.close().unwrap();
}

#[test]
fn failed_setup_leaves_the_active_environment_running() {
    let events = Events::default();
    let mut engine = engine(2);
    engine.load(Box::new(Probe::new("good", &events))).unwrap();
    engine.tick(Duration::from_millis(10)).unwrap();
    let targets = engine.backend().live_targets();
    let programs = engine.backend().live_programs();

    engine
        .environment_sender()
        .publish(Box::new(Probe::new("bad", &events).failing_setup()));
    let handle = engine.tick(Duration::from_millis(10)).unwrap();
    assert!(handle.is_some());
    assert!(matches!(
        engine.take_swap_error(),
        Some(EngineError::Setup(_))
    ));

    let frames = events.frames("good");
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1], (Duration::from_millis(10), 1));
    assert_eq!(events.closes("good"), 0);
    assert_eq!(events.setups("bad"), 0);
    assert_eq!(events.closes("bad"), 0);
    assert_eq!(engine.backend().live_targets(), targets);
    assert_eq!(engine.backend().live_programs(), programs);
}

#[test]
fn failed_build_after_setup_releases_everything() {
    let events = Events::default();
    let mut engine = engine(2);
    engine.load(Box::new(Probe::new("good", &events))).unwrap();
    let targets = engine.backend().live_targets();
    let programs = engine.backend().live_programs();

    let broken = Probe::new("broken", &events)
        .with_child(Probe::new("child", &events))
        .failing_sources();
    let err = engine.load(Box::new(broken)).unwrap_err();
    assert!(matches!(err, EngineError::Source(_)));
    assert!(err.is_recoverable());

    assert_eq!(events.setups("broken"), events.closes("broken"));
    assert_eq!(events.setups("child"), 1);
    assert_eq!(events.closes("child"), 1);
    assert_eq!(engine.backend().live_targets(), targets);
    assert_eq!(engine.backend().live_programs(), programs);
    assert_eq!(engine.backend().live_shaders(), 0);
    assert_eq!(engine.backend().live_textures(), 0);

    engine.tick(Duration::from_millis(10)).unwrap();
    assert_eq!(events.frames("good").len(), 1);
}

#[test]
fn compile_error_keeps_the_previous_program() {
    struct Broken;

    impl Environment for Broken {
        fn setup(&mut self, _: &RenderState<'_>, _: &mut dyn TextureStore) -> Result<()> {
            Ok(())
        }

        fn sources(&self) -> Result<Sources> {
            Ok(Sources::from([
                (Stage::Vertex, vec![Source::text("void main() {}")]),
                (
                    Stage::Fragment,
                    vec![Source::text("void main() {\n#error unterminated thought\n}")],
                ),
            ]))
        }

        fn pre_render(&mut self, _: &RenderState<'_>, _: &mut UniformValues) {}

        fn close(&mut self, _: &mut dyn TextureStore) -> Result<()> {
            Ok(())
        }
    }

    let events = Events::default();
    let mut engine = engine(2);
    engine.load(Box::new(Probe::new("good", &events))).unwrap();
    let err = engine.load(Box::new(Broken)).unwrap_err();
    match &err {
        EngineError::Compile(compile) => {
            assert_eq!(compile.stage(), Stage::Fragment);
            assert_eq!(compile.markers()[0].line, 2);
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(engine.backend().live_shaders(), 0);
    engine.tick(Duration::from_millis(10)).unwrap();
    assert_eq!(events.frames("good").len(), 1);
}

#[test]
fn clock_carries_over_a_swap() {
    let events = Events::default();
    let mut engine = engine(2);
    engine.load(Box::new(Probe::new("first", &events))).unwrap();
    for _ in 0..3 {
        engine.tick(Duration::from_millis(10)).unwrap();
    }

    engine
        .environment_sender()
        .publish(Box::new(Probe::new("second", &events)));
    engine.tick(Duration::from_millis(10)).unwrap();

    assert_eq!(events.closes("first"), 1);
    assert_eq!(
        events.frames("second"),
        vec![(Duration::from_millis(30), 3)]
    );
    assert_eq!(engine.time(), Duration::from_millis(40));
    assert_eq!(engine.frame(), 4);
}

#[test]
fn latest_published_environment_wins() {
    let events = Events::default();
    let mut engine = engine(2);
    let sender = engine.environment_sender();
    sender.publish(Box::new(Probe::new("stale", &events)));
    sender.publish(Box::new(Probe::new("fresh", &events)));
    engine.tick(Duration::from_millis(10)).unwrap();

    assert_eq!(events.setups("stale"), 0);
    assert_eq!(events.frames("fresh").len(), 1);
}

#[test]
fn children_render_before_their_parent() {
    let events = Events::default();
    let mut engine = engine(2);
    let parent = Probe::new("parent", &events)
        .with_child(Probe::new("a", &events))
        .with_child(Probe::new("b", &events));
    engine.load(Box::new(parent)).unwrap();
    for _ in 0..3 {
        engine.tick(Duration::from_millis(10)).unwrap();
    }

    let order: Vec<String> = events
        .all()
        .into_iter()
        .filter_map(|event| match event {
            Event::Frame { name, .. } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(
        order,
        ["a", "b", "parent", "a", "b", "parent", "a", "b", "parent"]
    );

    // Within a frame the parent samples what its children drew just before.
    let draws = engine.backend().draws();
    for frame in draws.chunks(3) {
        let [a, b, parent] = frame else {
            panic!("expected three draws per frame");
        };
        assert_eq!(parent.samples["a"], a.fill);
        assert_eq!(parent.samples["b"], b.fill);
    }
    assert_eq!(engine.backend().live_textures(), 0);
}

#[test]
fn children_share_the_parent_clock() {
    let events = Events::default();
    let mut engine = engine(2);
    engine.load(Box::new(Probe::new("first", &events))).unwrap();
    engine.tick(Duration::from_millis(25)).unwrap();
    engine
        .load(Box::new(
            Probe::new("parent", &events).with_child(Probe::new("child", &events)),
        ))
        .unwrap();
    engine.tick(Duration::from_millis(25)).unwrap();

    assert_eq!(events.frames("child"), vec![(Duration::from_millis(25), 1)]);
    assert_eq!(events.frames("parent"), vec![(Duration::from_millis(25), 1)]);
}

#[test]
fn cancellation_with_a_full_channel_stops_promptly() {
    let events = Events::default();
    let mut engine = engine(2);
    let capacity = engine.ring_capacity();
    engine.load(Box::new(Probe::new("main", &events))).unwrap();

    let cancel = CancelToken::new();
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let driver = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            let result = engine.animate(Duration::from_millis(16), &tx, &cancel);
            (engine, result)
        })
    };
    assert!(wait_until(Duration::from_secs(5), || rx.len() == capacity));

    cancel.cancel();
    let (mut engine, result) = driver.join().unwrap();
    result.unwrap();
    let produced = events.frames("main").len();
    assert_eq!(rx.len(), capacity);

    engine.close().unwrap();
    assert_eq!(events.closes("main"), 1);
    assert_eq!(events.frames("main").len(), produced);
    assert_eq!(engine.backend().live_targets(), 0);
}

#[test]
fn idle_driver_waits_for_an_environment() {
    let events = Events::default();
    let mut engine = engine(2);
    let sender = engine.environment_sender();
    let cancel = CancelToken::new();
    let (tx, rx) = engine.frame_channel();

    let publisher = {
        let events = events.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sender.publish(Box::new(Probe::new("late", &events)));
        })
    };
    engine.animate(Duration::ZERO, &tx, &cancel).unwrap();
    publisher.join().unwrap();

    assert_eq!(rx.len(), 1);
    assert_eq!(events.frames("late").len(), 1);
}

#[test]
fn cyclic_sub_environments_are_rejected() {
    let events = Events::default();
    let mut engine = engine(2);
    let looped = Probe::new("outer", &events)
        .with_identity("shader.glsl")
        .with_child(Probe::new("inner", &events).with_identity("shader.glsl"));

    let err = engine.load(Box::new(looped)).unwrap_err();
    assert!(matches!(root_cause(&err), EngineError::Cycle(id) if id == "shader.glsl"));
    assert!(!engine.is_active());
    assert_eq!(events.setups("outer"), events.closes("outer"));
    assert_eq!(engine.backend().live_targets(), engine.ring_capacity());
}

#[test]
fn duplicate_sub_environment_names_are_rejected() {
    let events = Events::default();
    let mut engine = engine(2);
    let parent = Probe::new("parent", &events)
        .with_child(Probe::new("twin", &events))
        .with_child(Probe::new("twin", &events));

    let err = engine.load(Box::new(parent)).unwrap_err();
    assert!(matches!(err, EngineError::DuplicateSubEnvironment(name) if name == "twin"));
    assert_eq!(events.setups("twin"), 0);
    assert_eq!(events.closes("parent"), 1);
}

#[test]
fn runaway_nesting_is_cut_off() {
    let mut engine = engine(1);
    let err = engine.load(Box::new(Bottomless)).unwrap_err();
    assert!(matches!(root_cause(&err), EngineError::TooDeep));
    assert_eq!(engine.backend().live_targets(), 1);
}

#[test]
fn backend_failure_is_fatal() {
    let events = Events::default();
    let mut engine = engine(2);
    engine.load(Box::new(Probe::new("main", &events))).unwrap();
    engine.backend_mut().fail_draws(true);

    let err = engine.tick(Duration::from_millis(10)).unwrap_err();
    assert!(matches!(err, EngineError::Backend(_)));
    assert!(!err.is_recoverable());
    assert_eq!(engine.frame(), 0);
}

#[test]
fn previous_frame_is_available_from_the_second_frame() {
    struct Feedback {
        seen: Arc<Mutex<Vec<bool>>>,
    }

    impl Environment for Feedback {
        fn setup(&mut self, _: &RenderState<'_>, _: &mut dyn TextureStore) -> Result<()> {
            Ok(())
        }

        fn sources(&self) -> Result<Sources> {
            Ok(Sources::from([
                (Stage::Vertex, vec![Source::text("void main() {}")]),
                (
                    Stage::Fragment,
                    vec![Source::text("uniform sampler2D backbuffer;\nvoid main() {}")],
                ),
            ]))
        }

        fn pre_render(&mut self, state: &RenderState<'_>, uniforms: &mut UniformValues) {
            let previous = state.previous_frame();
            // Asking twice must not allocate twice.
            assert_eq!(previous, state.previous_frame());
            self.seen.lock().unwrap().push(previous.is_some());
            if let Some(texture) = previous {
                uniforms.set("backbuffer", UniformValue::Sampler(texture));
            }
        }

        fn close(&mut self, _: &mut dyn TextureStore) -> Result<()> {
            Ok(())
        }
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut engine = engine(2);
    engine
        .load(Box::new(Feedback { seen: seen.clone() }))
        .unwrap();
    for _ in 0..3 {
        engine.tick(Duration::from_millis(10)).unwrap();
    }

    assert_eq!(*seen.lock().unwrap(), [false, true, true]);
    let draws = engine.backend().draws();
    assert_eq!(draws[1].samples["backbuffer"], draws[0].fill);
    assert_eq!(draws[2].samples["backbuffer"], draws[1].fill);
    assert_eq!(engine.backend().live_textures(), 0);
}

#[test]
fn close_releases_the_whole_tree() {
    let events = Events::default();
    let mut engine = engine(3);
    let tree = Probe::new("root", &events).with_child(
        Probe::new("mid", &events).with_child(Probe::new("leaf", &events)),
    );
    engine.load(Box::new(tree)).unwrap();
    engine.tick(Duration::from_millis(10)).unwrap();
    engine.close().unwrap();

    assert_eq!(events.count(|event| matches!(event, Event::Close(_))), 3);
    let backend = engine.backend();
    assert_eq!(backend.live_targets(), 0);
    assert_eq!(backend.live_programs(), 0);
    assert_eq!(backend.live_textures(), 0);
}
