use serde::Deserialize;

use crate::backend::BackendError;

/// Which adapter to ask for when several are available.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuPowerPreference {
    #[default]
    Low,
    High,
}

/// Device and queue without a surface; everything renders off-screen.
pub(crate) struct GpuContext {
    _instance: wgpu::Instance,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub max_dimension: u32,
}

impl GpuContext {
    pub(crate) fn headless(power: GpuPowerPreference) -> Result<Self, BackendError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });

        let power_preference = match power {
            GpuPowerPreference::Low => wgpu::PowerPreference::LowPower,
            GpuPowerPreference::High => wgpu::PowerPreference::HighPerformance,
        };
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|err| BackendError::Unavailable(format!("no suitable GPU adapter: {err}")))?;

        let info = adapter.get_info();
        let limits = adapter.limits();
        tracing::debug!(
            name = %info.name,
            backend = ?info.backend,
            device_type = ?info.device_type,
            max_dimension = limits.max_texture_dimension_2d,
            "selected GPU adapter"
        );

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("shady device"),
            required_features: wgpu::Features::empty(),
            required_limits: limits.clone(),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|err| BackendError::Unavailable(format!("failed to create GPU device: {err}")))?;

        Ok(Self {
            _instance: instance,
            device,
            queue,
            max_dimension: limits.max_texture_dimension_2d,
        })
    }

    /// Runs `f` inside a validation error scope and reports what it caught.
    pub(crate) fn validated<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(err.to_string()),
            None => Ok(value),
        }
    }
}
