//! Replays recorded canvas commands against a [`GpuBackend`].

use super::DrawCommand;
use crate::error::GpuError;
use crate::gpu::{CanvasPaint, CanvasVertex, GpuBackend, Surface};
use tracing::{trace, Span};

/// Turns a batch of [`DrawCommand`]s into backend draws.
///
/// Runs of solid commands collapse into a single draw. Image commands upload
/// their bitmap, draw it and release the texture again.
pub struct CanvasRenderer {
    span: Span,
}

impl CanvasRenderer {
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    /// Draw `commands` onto `target`, mapping `canvas_size` pixels onto the whole surface.
    pub fn flush(
        &mut self,
        backend: &mut dyn GpuBackend,
        target: Surface,
        canvas_size: (u32, u32),
        commands: &[DrawCommand],
    ) -> Result<(), GpuError> {
        let to_clip = ClipMapper::new(canvas_size);
        let mut batch: Vec<CanvasVertex> = Vec::new();

        for command in commands {
            match command {
                DrawCommand::Solid { vertices, color } => {
                    batch.extend(vertices.iter().map(|p| to_clip.vertex(*p, [0.0, 0.0], *color)));
                }
                DrawCommand::Clear { vertices } => {
                    flush_batch(backend, target, &mut batch)?;
                    let clear: Vec<CanvasVertex> = vertices
                        .iter()
                        .map(|p| to_clip.vertex(*p, [0.0, 0.0], [0.0; 4]))
                        .collect();
                    backend.draw_canvas(target, &clear, CanvasPaint::Replace)?;
                }
                DrawCommand::Image {
                    corners,
                    width,
                    height,
                    pixels,
                    tint,
                } => {
                    flush_batch(backend, target, &mut batch)?;
                    let texture = backend.upload_texture("canvas image", *width, *height, pixels)?;
                    let [tl, tr, br, bl] = *corners;
                    let quad = [
                        to_clip.vertex(tl, [0.0, 0.0], *tint),
                        to_clip.vertex(tr, [1.0, 0.0], *tint),
                        to_clip.vertex(br, [1.0, 1.0], *tint),
                        to_clip.vertex(tl, [0.0, 0.0], *tint),
                        to_clip.vertex(br, [1.0, 1.0], *tint),
                        to_clip.vertex(bl, [0.0, 1.0], *tint),
                    ];
                    let result = backend.draw_canvas(target, &quad, CanvasPaint::Image(texture));
                    backend.destroy_texture(texture);
                    result?;
                }
            }
        }
        flush_batch(backend, target, &mut batch)?;
        trace!(parent: &self.span, "Flushed {} canvas commands", commands.len());
        Ok(())
    }
}

fn flush_batch(backend: &mut dyn GpuBackend, target: Surface, batch: &mut Vec<CanvasVertex>) -> Result<(), GpuError> {
    if batch.is_empty() {
        return Ok(());
    }
    let result = backend.draw_canvas(target, batch, CanvasPaint::Solid);
    batch.clear();
    result
}

/// Device pixels (y down) to clip space (y up).
struct ClipMapper {
    sx: f32,
    sy: f32,
}

impl ClipMapper {
    fn new((width, height): (u32, u32)) -> Self {
        Self {
            sx: 2.0 / width.max(1) as f32,
            sy: 2.0 / height.max(1) as f32,
        }
    }

    fn vertex(&self, [x, y]: [f32; 2], uv: [f32; 2], color: [f32; 4]) -> CanvasVertex {
        CanvasVertex {
            position: [x * self.sx - 1.0, 1.0 - y * self.sy],
            uv,
            color,
        }
    }
}
