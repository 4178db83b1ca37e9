use std::fs;
use std::path::Path;
use std::time::Duration;

use renderer::{Engine, EngineConfig, EngineError, HeadlessBackend, UniformValue};
use shadertoy::ShaderToy;

const PASS: &str = "void mainImage(out vec4 c, in vec2 p) { c = vec4(p, 0.0, 1.0); }\n";

fn engine() -> Engine<HeadlessBackend> {
    let config = EngineConfig::new(16, 8).with_ring_size(2);
    Engine::new(HeadlessBackend::new(), &config).unwrap()
}

fn write(dir: &Path, name: &str, text: &str) {
    fs::write(dir.join(name), text).unwrap();
}

fn root_cause(err: &EngineError) -> &EngineError {
    match err {
        EngineError::Child { source, .. } => root_cause(source),
        other => other,
    }
}

#[test]
fn buffer_pass_renders_first_and_is_sampled() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "blur.glsl", PASS);
    write(
        dir.path(),
        "main.glsl",
        &format!("// map iChannel0=buffer:blur.glsl;8x4\n{PASS}"),
    );

    let mut engine = engine();
    engine
        .load(Box::new(ShaderToy::from_file(&dir.path().join("main.glsl")).unwrap()))
        .unwrap();
    engine.render_image().unwrap();

    let draws = engine.backend().draws();
    assert_eq!(draws.len(), 2);
    let (child, parent) = (&draws[0], &draws[1]);
    assert_eq!(parent.samples.get("iChannel0"), Some(&child.fill));
    assert_eq!(
        parent.uniforms.get("iChannelResolution[0]"),
        Some(&UniformValue::Vec3([8.0, 4.0, 1.0]))
    );
    assert_eq!(
        child.uniforms.get("iResolution"),
        Some(&UniformValue::Vec3([8.0, 4.0, 0.0]))
    );

    engine.close().unwrap();
    assert_eq!(engine.backend().live_targets(), 0);
    assert_eq!(engine.backend().live_textures(), 0);
}

#[test]
fn self_referencing_buffer_is_a_cycle() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "loop.glsl",
        &format!("// map iChannel0=buffer:loop.glsl;8x8\n{PASS}"),
    );

    let mut engine = engine();
    let err = engine
        .load(Box::new(ShaderToy::from_file(&dir.path().join("loop.glsl")).unwrap()))
        .unwrap_err();
    assert!(matches!(root_cause(&err), EngineError::Cycle(_)), "{err}");
    assert!(err.is_recoverable());
    assert!(!engine.is_active());
    assert_eq!(engine.backend().live_programs(), 0);
}

#[test]
fn mutually_referencing_buffers_are_a_cycle() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.glsl", &format!("// map iChannel0=buffer:b.glsl;4x4\n{PASS}"));
    write(dir.path(), "b.glsl", &format!("// map iChannel0=buffer:a.glsl;4x4\n{PASS}"));

    let mut engine = engine();
    let err = engine
        .load(Box::new(ShaderToy::from_file(&dir.path().join("a.glsl")).unwrap()))
        .unwrap_err();
    assert!(matches!(root_cause(&err), EngineError::Cycle(_)), "{err}");
}

#[test]
fn back_buffer_feeds_the_previous_frame() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "feedback.glsl",
        &format!("// map iChannel0=builtin:Back Buffer\n{PASS}"),
    );

    let mut engine = engine();
    engine
        .load(Box::new(ShaderToy::from_file(&dir.path().join("feedback.glsl")).unwrap()))
        .unwrap();
    engine.tick(Duration::from_millis(10)).unwrap();
    engine.tick(Duration::from_millis(10)).unwrap();

    let draws = engine.backend().draws();
    assert!(!draws[0].samples.contains_key("iChannel0"));
    assert_eq!(draws[1].samples.get("iChannel0"), Some(&draws[0].fill));
    engine.close().unwrap();
    assert_eq!(engine.backend().live_textures(), 0);
}

#[test]
fn broken_mapping_keeps_the_running_shader() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "good.glsl", PASS);
    write(
        dir.path(),
        "bad.glsl",
        &format!("// map iChannel0=image:missing.png\n{PASS}"),
    );

    let mut engine = engine();
    engine
        .load(Box::new(ShaderToy::from_file(&dir.path().join("good.glsl")).unwrap()))
        .unwrap();
    let err = engine
        .load(Box::new(ShaderToy::from_file(&dir.path().join("bad.glsl")).unwrap()))
        .unwrap_err();
    assert!(matches!(err, EngineError::Setup(_)));
    assert!(err.to_string().contains("missing.png"));
    assert!(engine.is_active());
    engine.render_image().unwrap();
    engine.close().unwrap();
}
