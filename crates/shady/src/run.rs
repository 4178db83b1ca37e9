use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{at, select, Receiver, Sender};
use renderer::{Backend, CancelToken, Engine, EngineError, RasterImage};

use crate::config::ShadyConfig;
use crate::loader::Loader;
use crate::watch::watch;

/// Renders `shader` with `backend` and streams the frames to `frames` until
/// the configured frame limit is reached, `cancel` fires or the consumer
/// hangs up.
///
/// `frames` must be bounded to at most `config.engine.ring_size`;
/// [`renderer::EngineConfig::frame_channel`] builds a matching channel.
/// With a zero framerate a single image is sent. With `realtime` set,
/// frames are delivered no faster than the framerate. When watching is
/// enabled the shader is rebuilt on a background thread after every edit
/// and the running shader stays on screen while an edit fails to build.
pub fn run<B: Backend>(
    backend: B,
    config: &ShadyConfig,
    shader: &Path,
    frames: &Sender<RasterImage>,
    cancel: &CancelToken,
) -> Result<()> {
    config.validate()?;
    let ring = config.engine.ring_size;
    match frames.capacity() {
        Some(capacity) if capacity <= ring => {}
        capacity => return Err(EngineError::Egress { capacity, ring }.into()),
    }
    let base_dir = std::env::current_dir().context("failed to resolve working directory")?;
    let loader = Loader::from_config(config, &base_dir)?;
    let mut engine = Engine::new(backend, &config.engine)?;

    let stop = CancelToken::new();
    let watcher = if config.watch.enabled {
        let sender = engine.environment_sender();
        let stop = stop.clone();
        let shader: PathBuf = shader.to_path_buf();
        let debounce = config.watch.debounce;
        let handle = thread::Builder::new()
            .name("shady-watch".into())
            .spawn(move || watch(&loader, &shader, &sender, &stop, debounce))
            .context("failed to spawn watcher thread")?;
        Some(handle)
    } else {
        let loaded = loader
            .load(shader)
            .map_err(anyhow::Error::from)
            .and_then(|environment| Ok(engine.load(environment)?));
        if let Err(err) = loaded {
            let _ = engine.close();
            return Err(err);
        }
        None
    };

    let (rendered, delivered) = engine.frame_channel();
    let delivery = Delivery {
        limit: config.frame_limit(),
        pace: config.realtime.then(|| config.frame_interval()),
        cancel: cancel.clone(),
        stop: stop.clone(),
    };
    let frames = frames.clone();
    let forwarder = thread::Builder::new()
        .name("shady-deliver".into())
        .spawn(move || delivery.forward(&delivered, &frames));
    let forwarder = match forwarder {
        Ok(handle) => handle,
        Err(err) => {
            stop.cancel();
            let _ = engine.close();
            return Err(anyhow::Error::new(err).context("failed to spawn delivery thread"));
        }
    };

    tracing::info!(
        shader = %shader.display(),
        framerate = config.framerate,
        limit = ?config.frame_limit(),
        realtime = config.realtime,
        watch = config.watch.enabled,
        "rendering"
    );
    let animated = engine.animate(config.frame_interval(), &rendered, &stop);
    if animated.is_err() {
        stop.cancel();
    }
    drop(rendered);
    let forwarded = forwarder
        .join()
        .map_err(|_| anyhow!("delivery thread panicked"));
    stop.cancel();
    let closed = engine.close();

    let watched = match watcher {
        Some(handle) => handle
            .join()
            .map_err(|_| anyhow!("watcher thread panicked"))
            .and_then(|result| result),
        None => Ok(()),
    };

    animated?;
    let count = forwarded?;
    tracing::info!(frames = count, "rendering finished");
    closed?;
    watched
}

/// Moves frames from the render loop to the consumer.
struct Delivery {
    limit: Option<u64>,
    pace: Option<Duration>,
    cancel: CancelToken,
    /// Ends the render loop; cancelled whenever delivery stops.
    stop: CancelToken,
}

impl Delivery {
    /// Forwards frames until the limit is reached, the consumer hangs up,
    /// either token fires or the render loop stops producing. Returns the
    /// number of frames delivered.
    fn forward(self, rendered: &Receiver<RasterImage>, frames: &Sender<RasterImage>) -> u64 {
        let mut delivered = 0;
        let mut next = Instant::now();
        while self.limit.map_or(true, |limit| delivered < limit) {
            let image = select! {
                recv(rendered) -> image => image.ok(),
                recv(self.cancel.signal()) -> _ => None,
                recv(self.stop.signal()) -> _ => None,
            };
            let Some(image) = image else {
                break;
            };
            if let Some(interval) = self.pace {
                let waited = select! {
                    recv(at(next)) -> _ => true,
                    recv(self.cancel.signal()) -> _ => false,
                    recv(self.stop.signal()) -> _ => false,
                };
                if !waited {
                    break;
                }
                next = Instant::now() + interval;
            }
            let sent = select! {
                send(frames, image) -> sent => sent.is_ok(),
                recv(self.cancel.signal()) -> _ => false,
                recv(self.stop.signal()) -> _ => false,
            };
            if !sent {
                break;
            }
            delivered += 1;
        }
        tracing::debug!(delivered, limit = ?self.limit, "frame delivery ended");
        self.stop.cancel();
        delivered
    }
}
