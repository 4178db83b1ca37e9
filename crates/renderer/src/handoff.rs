//! Single-slot, latest-wins delivery of environments to the render thread.
//!
//! Producers (a file watcher, a loader thread) publish fully built
//! environments without ever blocking on the renderer. At most one
//! environment waits in the slot; publishing again replaces it, so rapid
//! edits cannot queue up work. A `bounded(1)` doorbell lets an idle engine
//! sleep until something arrives.

use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{select, Receiver, Sender, TrySendError};

use crate::cancel::CancelToken;
use crate::environment::Environment;

type Slot = Arc<Mutex<Option<Box<dyn Environment>>>>;

/// Creates a connected sender/receiver pair around an empty slot.
pub fn handoff() -> (EnvironmentSender, EnvironmentReceiver) {
    let slot: Slot = Arc::new(Mutex::new(None));
    let (doorbell, ring) = crossbeam_channel::bounded(1);
    (
        EnvironmentSender {
            slot: slot.clone(),
            doorbell,
        },
        EnvironmentReceiver { slot, ring },
    )
}

#[derive(Clone)]
pub struct EnvironmentSender {
    slot: Slot,
    doorbell: Sender<()>,
}

impl EnvironmentSender {
    /// Places `environment` in the slot, dropping any environment that was
    /// still waiting there.
    pub fn publish(&self, environment: Box<dyn Environment>) {
        let replaced = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(environment);
        if let Some(replaced) = replaced {
            tracing::debug!(
                environment = replaced.name(),
                "pending environment superseded before it was used"
            );
        }
        match self.doorbell.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                tracing::debug!("environment published after the engine went away");
            }
        }
    }
}

/// Why waiting for an environment ended without one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitError {
    Cancelled,
    Disconnected,
}

pub struct EnvironmentReceiver {
    slot: Slot,
    ring: Receiver<()>,
}

impl EnvironmentReceiver {
    /// Takes the pending environment, if any, without blocking.
    pub fn try_take(&self) -> Option<Box<dyn Environment>> {
        while self.ring.try_recv().is_ok() {}
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Blocks until an environment is published or `cancel` fires.
    pub fn wait(&self, cancel: &CancelToken) -> Result<Box<dyn Environment>, WaitError> {
        loop {
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }
            if let Some(environment) = self.try_take() {
                return Ok(environment);
            }
            select! {
                recv(self.ring) -> rung => {
                    if rung.is_err() {
                        return self.try_take().ok_or(WaitError::Disconnected);
                    }
                }
                recv(cancel.signal()) -> _ => return Err(WaitError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{TextureStore, UniformValues};
    use crate::environment::RenderState;
    use crate::source::Sources;
    use std::time::Duration;

    struct Named(&'static str);

    impl Environment for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn setup(&mut self, _: &RenderState<'_>, _: &mut dyn TextureStore) -> anyhow::Result<()> {
            Ok(())
        }

        fn sources(&self) -> anyhow::Result<Sources> {
            Ok(Sources::new())
        }

        fn pre_render(&mut self, _: &RenderState<'_>, _: &mut UniformValues) {}

        fn close(&mut self, _: &mut dyn TextureStore) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn empty_slot_yields_nothing() {
        let (_sender, receiver) = handoff();
        assert!(receiver.try_take().is_none());
    }

    #[test]
    fn latest_publish_wins() {
        let (sender, receiver) = handoff();
        sender.publish(Box::new(Named("first")));
        sender.publish(Box::new(Named("second")));
        let taken = receiver.try_take().unwrap();
        assert_eq!(taken.name(), "second");
        assert!(receiver.try_take().is_none());
    }

    #[test]
    fn wait_returns_environment_published_from_another_thread() {
        let (sender, receiver) = handoff();
        let publisher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            sender.publish(Box::new(Named("late")));
        });
        let taken = receiver.wait(&CancelToken::new()).unwrap();
        assert_eq!(taken.name(), "late");
        publisher.join().unwrap();
    }

    #[test]
    fn wait_observes_cancellation() {
        let (_sender, receiver) = handoff();
        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            canceller.cancel();
        });
        assert_eq!(receiver.wait(&cancel).err(), Some(WaitError::Cancelled));
    }

    #[test]
    fn wait_reports_dropped_senders() {
        let (sender, receiver) = handoff();
        drop(sender);
        assert_eq!(
            receiver.wait(&CancelToken::new()).err(),
            Some(WaitError::Disconnected)
        );
    }
}
