//! Render Target Ring: a fixed pool of off-screen targets that lets the GPU
//! draw frame `n` while the pixels of frame `n - N + 1` are still in flight
//! to host memory.

use image::imageops::flip_vertical_in_place;

use crate::backend::{Backend, BackendError, TargetId, TextureId};
use crate::engine::EngineError;
use crate::types::RasterImage;

/// Identifies the ring slot a frame was drawn into.
///
/// The handle stays valid until that slot is drawn again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingHandle {
    slot: usize,
    generation: u64,
}

#[derive(Debug)]
struct Slot {
    target: TargetId,
    generation: u64,
    pending: bool,
}

#[derive(Debug)]
pub(crate) struct RenderRing {
    width: u32,
    height: u32,
    slots: Vec<Slot>,
    cursor: usize,
    draws: u64,
    readback: bool,
}

impl RenderRing {
    /// Allocates `capacity` targets. Rings that are only ever sampled
    /// (sub-environments) pass `readback = false` and skip the transfers.
    pub(crate) fn setup<B: Backend>(
        backend: &mut B,
        width: u32,
        height: u32,
        capacity: usize,
        readback: bool,
    ) -> Result<Self, EngineError> {
        if capacity == 0 {
            return Err(EngineError::Backend(BackendError::Device(
                "render ring needs at least one target".to_string(),
            )));
        }
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            match backend.create_target(width, height) {
                Ok(target) => slots.push(Slot {
                    target,
                    generation: 0,
                    pending: false,
                }),
                Err(err) => {
                    for slot in slots {
                        backend.destroy_target(slot.target);
                    }
                    return Err(err.into());
                }
            }
        }
        tracing::debug!(width, height, capacity, readback, "render ring ready");
        Ok(Self {
            width,
            height,
            cursor: capacity - 1,
            slots,
            draws: 0,
            readback,
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Advances to the next slot, lets `draw` render into it and requests
    /// its pixels without waiting for them.
    pub(crate) fn draw<B, F>(&mut self, backend: &mut B, draw: F) -> Result<RingHandle, EngineError>
    where
        B: Backend,
        F: FnOnce(&mut B, TargetId) -> Result<(), BackendError>,
    {
        self.cursor = (self.cursor + 1) % self.slots.len();
        self.draws += 1;
        let slot = &mut self.slots[self.cursor];
        slot.generation = self.draws;
        slot.pending = false;

        draw(backend, slot.target)?;
        if self.readback {
            backend.begin_readback(slot.target)?;
            slot.pending = true;
        }

        Ok(RingHandle {
            slot: self.cursor,
            generation: slot.generation,
        })
    }

    fn slot(&self, handle: RingHandle) -> Result<&Slot, EngineError> {
        match self.slots.get(handle.slot) {
            Some(slot) if slot.generation == handle.generation => Ok(slot),
            _ => Err(EngineError::StaleFrame),
        }
    }

    /// Waits for the frame behind `handle` and returns it top row first.
    pub(crate) fn image<B: Backend>(
        &mut self,
        backend: &mut B,
        handle: RingHandle,
    ) -> Result<RasterImage, EngineError> {
        let target = self.slot(handle)?.target;
        let pending = std::mem::replace(&mut self.slots[handle.slot].pending, false);
        let mut image = if pending {
            backend.finish_readback(target)?
        } else {
            backend.read_pixels(target)?
        };
        flip_vertical_in_place(&mut image);
        Ok(image)
    }

    /// Copies the frame behind `handle` into a new texture owned by the
    /// caller.
    pub(crate) fn texture<B: Backend>(
        &self,
        backend: &mut B,
        handle: RingHandle,
    ) -> Result<TextureId, EngineError> {
        let target = self.slot(handle)?.target;
        Ok(backend.snapshot_target(target)?)
    }

    pub(crate) fn close<B: Backend>(self, backend: &mut B) {
        for slot in self.slots {
            backend.destroy_target(slot.target);
        }
    }
}
