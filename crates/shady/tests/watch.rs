use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use renderer::{handoff, CancelToken, EnvironmentReceiver, EnvironmentSender};
use shady::Loader;

const TOY: &str = "void mainImage(out vec4 c, in vec2 p) { c = vec4(1.0); }\n";
const SANDBOX: &str = "uniform vec2 resolution;\nvoid main() { gl_FragColor = vec4(1.0); }\n";

/// Cancels after a generous timeout so a missed event fails instead of
/// hanging the test run.
fn deadline() -> CancelToken {
    let token = CancelToken::new();
    let timer = token.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_secs(10));
        timer.cancel();
    });
    token
}

fn next_name(receiver: &EnvironmentReceiver) -> String {
    receiver
        .wait(&deadline())
        .map(|environment| environment.name().to_string())
        .expect("no environment published in time")
}

fn spawn_watch(
    path: PathBuf,
    sender: EnvironmentSender,
    stop: CancelToken,
) -> thread::JoinHandle<anyhow::Result<()>> {
    thread::spawn(move || {
        shady::watch(
            &Loader::default(),
            &path,
            &sender,
            &stop,
            Duration::from_millis(20),
        )
    })
}

#[test]
fn edits_republish_the_environment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shader.glsl");
    fs::write(&path, TOY).unwrap();

    let (sender, receiver) = handoff();
    let stop = CancelToken::new();
    let watcher = spawn_watch(path.clone(), sender, stop.clone());

    assert_eq!(next_name(&receiver), "shadertoy");
    fs::write(&path, SANDBOX).unwrap();
    assert_eq!(next_name(&receiver), "glslsandbox");

    stop.cancel();
    watcher.join().unwrap().unwrap();
}

#[test]
fn included_files_are_watched() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.glsl");
    let include = dir.path().join("body.glsl");
    fs::write(&include, TOY).unwrap();
    fs::write(&path, "#pragma use \"body.glsl\"\n").unwrap();

    let (sender, receiver) = handoff();
    let stop = CancelToken::new();
    let watcher = spawn_watch(path, sender, stop.clone());

    assert_eq!(next_name(&receiver), "shadertoy");
    fs::write(&include, SANDBOX).unwrap();
    assert_eq!(next_name(&receiver), "glslsandbox");

    stop.cancel();
    watcher.join().unwrap().unwrap();
}

#[test]
fn broken_edits_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shader.glsl");
    fs::write(&path, "void main() {}\n").unwrap();

    let (sender, receiver) = handoff();
    let stop = CancelToken::new();
    let watcher = spawn_watch(path.clone(), sender, stop.clone());

    thread::sleep(Duration::from_millis(100));
    assert!(receiver.try_take().is_none());
    fs::write(&path, TOY).unwrap();
    assert_eq!(next_name(&receiver), "shadertoy");

    stop.cancel();
    watcher.join().unwrap().unwrap();
}
