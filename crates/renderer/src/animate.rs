//! The animation driver: renders frames back to back and streams them to a
//! bounded channel until cancelled.

use std::collections::VecDeque;
use std::time::Duration;

use crossbeam_channel::{select, Receiver, Sender};
use tracing::debug;

use crate::backend::Backend;
use crate::cancel::CancelToken;
use crate::engine::{Engine, EngineError};
use crate::handoff::WaitError;
use crate::types::RasterImage;

impl<B: Backend> Engine<B> {
    /// Egress channel sized to the ring, the largest one
    /// [`Engine::animate`] accepts.
    pub fn frame_channel(&self) -> (Sender<RasterImage>, Receiver<RasterImage>) {
        crossbeam_channel::bounded(self.ring_capacity())
    }

    /// Streams frames spaced `interval` apart in shader time.
    ///
    /// A frame is read back only once the ring holds `capacity` frames in
    /// flight, so the GPU keeps drawing while earlier transfers complete.
    /// Images are delivered in render order; a full channel blocks the
    /// loop, which throttles rendering to the consumer. An `interval` of
    /// zero renders and sends a single image.
    ///
    /// The channel is the only backpressure on the loop, so `frames` must
    /// be bounded to at most the ring capacity; anything larger, or an
    /// unbounded channel, is rejected with [`EngineError::Egress`].
    ///
    /// Returns `Ok(())` when `cancel` fires or the consumer hangs up.
    /// Frames still in flight at that point are dropped.
    pub fn animate(
        &mut self,
        interval: Duration,
        frames: &Sender<RasterImage>,
        cancel: &CancelToken,
    ) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        let ring = self.ring_capacity();
        match frames.capacity() {
            Some(capacity) if capacity <= ring => {}
            capacity => return Err(EngineError::Egress { capacity, ring }),
        }
        if interval.is_zero() {
            if !self.wait_for_environment(cancel)? {
                return Ok(());
            }
            let image = self.render_image()?;
            deliver(frames, image, cancel);
            return Ok(());
        }

        let capacity = self.ring_capacity();
        let mut in_flight = VecDeque::with_capacity(capacity);
        loop {
            if cancel.is_cancelled() {
                debug!(in_flight = in_flight.len(), "animation cancelled");
                return Ok(());
            }
            if !self.is_active() {
                if !self.wait_for_environment(cancel)? {
                    return Ok(());
                }
                continue;
            }
            let Some(handle) = self.tick(interval)? else {
                continue;
            };
            in_flight.push_back(handle);
            if in_flight.len() < capacity {
                continue;
            }
            let Some(oldest) = in_flight.pop_front() else {
                continue;
            };
            let image = self.image(oldest)?;
            if !deliver(frames, image, cancel) {
                debug!("frame consumer gone or cancelled, stopping animation");
                return Ok(());
            }
        }
    }

    /// Blocks until an environment is active. Returns `false` if `cancel`
    /// fired first.
    fn wait_for_environment(&mut self, cancel: &CancelToken) -> Result<bool, EngineError> {
        loop {
            if self.is_active() {
                return Ok(true);
            }
            debug!("waiting for an environment");
            match self.receiver.wait(cancel) {
                Ok(environment) => self.apply_swap(environment)?,
                Err(WaitError::Cancelled | WaitError::Disconnected) => return Ok(false),
            }
        }
    }
}

/// Sends `image` unless cancellation wins. Returns whether it was sent.
fn deliver(frames: &Sender<RasterImage>, image: RasterImage, cancel: &CancelToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    select! {
        send(frames, image) -> sent => sent.is_ok(),
        recv(cancel.signal()) -> _ => false,
    }
}
