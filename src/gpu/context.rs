//! Device acquisition shared by the window and headless backends.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use winit::window::Window;

/// Adapter, device and queue owned by one backend.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
}

fn new_instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    })
}

impl GpuContext {
    /// A device that can present to `window`, together with the window's surface.
    pub fn for_window(window: Arc<Window>) -> Result<(Self, wgpu::Surface<'static>)> {
        let instance = new_instance();
        let surface = instance
            .create_surface(window)
            .context("Failed to create window surface")?;
        let context = Self::acquire(instance, Some(&surface), wgpu::Limits::default())?;
        Ok((context, surface))
    }

    /// A device for offscreen rendering.
    pub fn headless() -> Result<Self> {
        Self::acquire(new_instance(), None, wgpu::Limits::downlevel_defaults())
    }

    fn acquire(
        instance: wgpu::Instance,
        surface: Option<&wgpu::Surface<'_>>,
        required_limits: wgpu::Limits,
    ) -> Result<Self> {
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: surface,
            force_fallback_adapter: false,
        }))
        .map_err(|e| anyhow!("No suitable GPU adapter: {e:?}"))?;

        let info = adapter.get_info();
        tracing::info!("Using GPU adapter {} ({:?})", info.name, info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Scanline Device"),
            required_features: wgpu::Features::empty(),
            required_limits,
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        }))
        .context("Failed to open GPU device")?;

        // Errors outside a validation scope are logged instead of aborting the process.
        device.on_uncaptured_error(Arc::new(|e: wgpu::Error| {
            tracing::error!("Uncaptured GPU error: {e}");
        }));

        Ok(Self {
            device,
            queue,
            instance,
            adapter,
        })
    }
}
