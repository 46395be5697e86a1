//! Off-screen render targets owned by one pipeline instance.

use crate::error::{GpuError, PipelineError};
use crate::gpu::{GpuBackend, TextureId};
use tracing::{debug, Span};

/// An RGBA8 color-attachable texture and its size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTarget {
    pub name: String,
    pub texture: TextureId,
    pub width: u32,
    pub height: u32,
}

/// Named intermediate targets. Insertion order is kept so `resize_all` and
/// `dispose_all` walk them the way they were created.
pub struct RenderTargetManager {
    targets: Vec<RenderTarget>,
    span: Span,
}

impl RenderTargetManager {
    pub fn new(span: Span) -> Self {
        Self {
            targets: Vec::new(),
            span,
        }
    }

    /// Allocate `name`, releasing any texture already registered under it.
    /// Zero dimensions are clamped to 1.
    pub fn allocate(
        &mut self,
        backend: &mut dyn GpuBackend,
        name: &str,
        width: u32,
        height: u32,
    ) -> Result<&RenderTarget, PipelineError> {
        let (width, height) = (width.max(1), height.max(1));
        let index = match self.targets.iter().position(|t| t.name == name) {
            Some(index) => {
                backend.destroy_texture(self.targets[index].texture);
                index
            }
            None => {
                self.targets.push(RenderTarget {
                    name: name.to_string(),
                    texture: backend.default_texture(),
                    width,
                    height,
                });
                self.targets.len() - 1
            }
        };

        let texture = match backend.create_render_target(name, width, height) {
            Ok(texture) => texture,
            Err(e) => {
                self.targets.remove(index);
                return Err(framebuffer_error(name, width, height, e));
            }
        };
        debug!(parent: &self.span, "Allocated render target {} ({}x{})", name, width, height);

        let target = &mut self.targets[index];
        target.texture = texture;
        target.width = width;
        target.height = height;
        Ok(target)
    }

    pub fn get(&self, name: &str) -> Option<&RenderTarget> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Reallocate `name` at a new size. Unknown names are allocated fresh.
    pub fn resize(
        &mut self,
        backend: &mut dyn GpuBackend,
        name: &str,
        width: u32,
        height: u32,
    ) -> Result<&RenderTarget, PipelineError> {
        if let Some(index) = self.targets.iter().position(|t| t.name == name) {
            let target = &self.targets[index];
            if target.width == width.max(1) && target.height == height.max(1) {
                return Ok(&self.targets[index]);
            }
        }
        self.allocate(backend, name, width, height)
    }

    /// Reallocate every target at the same size.
    pub fn resize_all(&mut self, backend: &mut dyn GpuBackend, width: u32, height: u32) -> Result<(), PipelineError> {
        let names: Vec<String> = self.targets.iter().map(|t| t.name.clone()).collect();
        for name in names {
            self.resize(backend, &name, width, height)?;
        }
        Ok(())
    }

    pub fn dispose_all(&mut self, backend: &mut dyn GpuBackend) {
        for target in self.targets.drain(..) {
            backend.destroy_texture(target.texture);
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RenderTarget> {
        self.targets.iter()
    }
}

fn framebuffer_error(name: &str, width: u32, height: u32, error: GpuError) -> PipelineError {
    PipelineError::FramebufferIncomplete {
        name: name.to_string(),
        width,
        height,
        reason: error.to_string(),
    }
}
