use crossbeam_channel::Receiver;

use crate::backend::BackendError;
use crate::types::RasterImage;

type MapResult = Result<(), wgpu::BufferAsyncError>;

/// Host-visible copy of one render target. Rows are padded to
/// `COPY_BYTES_PER_ROW_ALIGNMENT` as the copy requires.
pub(crate) struct Staging {
    buffer: wgpu::Buffer,
    width: u32,
    height: u32,
    padded_row: u32,
    mapping: Option<Receiver<MapResult>>,
}

impl Staging {
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let padded_row = (width * 4).next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size: u64::from(padded_row) * u64::from(height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            width,
            height,
            padded_row,
            mapping: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.mapping.is_some()
    }

    /// Records the copy of `texture` and asks for the buffer to be mapped
    /// once the GPU gets there.
    pub fn begin(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, texture: &wgpu::Texture) {
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &self.buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        queue.submit(Some(encoder.finish()));

        let (tx, rx) = crossbeam_channel::bounded(1);
        self.buffer
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = tx.send(result);
            });
        self.mapping = Some(rx);
    }

    /// Blocks until the mapping requested by [`Staging::begin`] completes
    /// and returns the rows without padding.
    pub fn finish(&mut self, device: &wgpu::Device) -> Result<RasterImage, BackendError> {
        let mapping = self.mapping.take().ok_or_else(|| {
            BackendError::Readback("no transfer in flight for staging buffer".to_string())
        })?;
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| BackendError::Readback(err.to_string()))?;
        mapping
            .recv()
            .map_err(|_| BackendError::Readback("buffer mapping was abandoned".to_string()))?
            .map_err(|err| BackendError::Readback(err.to_string()))?;

        let row_len = self.width as usize * 4;
        let mut pixels = Vec::with_capacity(row_len * self.height as usize);
        {
            let data = self.buffer.slice(..).get_mapped_range();
            for row in data.chunks(self.padded_row as usize).take(self.height as usize) {
                pixels.extend_from_slice(&row[..row_len]);
            }
        }
        self.buffer.unmap();

        RasterImage::from_raw(self.width, self.height, pixels)
            .ok_or_else(|| BackendError::Readback("readback returned a short image".to_string()))
    }

    /// Waits out a transfer nobody collected so the buffer can be reused.
    pub fn discard(&mut self, device: &wgpu::Device) {
        if self.is_pending() {
            if let Err(err) = self.finish(device) {
                tracing::debug!(error = %err, "dropped uncollected readback");
            }
        }
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        self.buffer.destroy();
    }
}
