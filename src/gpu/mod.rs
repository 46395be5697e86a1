//! The GPU seam. Everything above this module talks to a [`GpuBackend`] and
//! never to wgpu directly.

mod context;
#[cfg(any(test, feature = "recording"))]
pub mod recording;
mod wgpu_backend;

pub use context::GpuContext;
#[cfg(any(test, feature = "recording"))]
pub use recording::{GpuCall, RecordingBackend};
pub use wgpu_backend::WgpuBackend;

use crate::error::GpuError;
use crate::shader::{CompiledShader, FilterMode};

/// Handle to a texture owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

/// Handle to a linked program owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramId(pub u64);

/// Where a draw lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// The presented frame: the window swapchain, or the offscreen frame when headless.
    Screen,
    Texture(TextureId),
}

/// Vertex fed to every shader pass: `Position` at location 0, `TexCoord` at location 1.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PassVertex {
    pub position: [f32; 4],
    pub tex_coord: [f32; 2],
}

impl PassVertex {
    /// Unit quad as two triangles. The MVP maps it onto the whole viewport.
    pub const QUAD: [PassVertex; 6] = [
        PassVertex { position: [0.0, 0.0, 0.0, 1.0], tex_coord: [0.0, 0.0] },
        PassVertex { position: [1.0, 0.0, 0.0, 1.0], tex_coord: [1.0, 0.0] },
        PassVertex { position: [1.0, 1.0, 0.0, 1.0], tex_coord: [1.0, 1.0] },
        PassVertex { position: [0.0, 0.0, 0.0, 1.0], tex_coord: [0.0, 0.0] },
        PassVertex { position: [1.0, 1.0, 0.0, 1.0], tex_coord: [1.0, 1.0] },
        PassVertex { position: [0.0, 1.0, 0.0, 1.0], tex_coord: [0.0, 1.0] },
    ];

    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<PassVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x4,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 4]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}

/// Column-major matrix mapping the unit quad to clip space with y pointing down.
pub const QUAD_MVP: [f32; 16] = [
    2.0, 0.0, 0.0, 0.0, //
    0.0, -2.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    -1.0, 1.0, 0.0, 1.0,
];

/// Vertex of the 2D canvas programs. `position` is already in clip space.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CanvasVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
    /// Premultiplied RGBA.
    pub color: [f32; 4],
}

impl CanvasVertex {
    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<CanvasVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: 8,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: 16,
                    shader_location: 2,
                    format: wgpu::VertexFormat::Float32x4,
                },
            ],
        }
    }
}

/// How canvas triangles are shaded and blended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanvasPaint {
    /// Vertex color, premultiplied source-over.
    Solid,
    /// Vertex color written without blending. Used by `clearRect`.
    Replace,
    /// Texture sampled at `uv`, tinted by the vertex color, premultiplied source-over.
    Image(TextureId),
}

/// A texture bound to a split texture/sampler pair of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureBinding {
    pub texture_binding: u32,
    pub sampler_binding: u32,
    pub texture: TextureId,
    pub filter: FilterMode,
}

/// Bytes for one uniform block of a program.
#[derive(Debug, Clone, Copy)]
pub struct UniformUpload<'a> {
    pub binding: u32,
    pub data: &'a [u8],
}

/// One full-screen draw of a shader pass.
#[derive(Debug, Clone, Copy)]
pub struct PassDraw<'a> {
    pub program: ProgramId,
    pub textures: &'a [TextureBinding],
    pub uniforms: &'a [UniformUpload<'a>],
    pub output: Surface,
}

/// Operations the pipeline, the canvas renderer and the orchestrator need from a GPU.
pub trait GpuBackend {
    /// Link a compiled shader into a program. The bind layout comes from its reflection.
    fn create_program(&mut self, label: &str, shader: &CompiledShader) -> Result<ProgramId, GpuError>;
    fn destroy_program(&mut self, program: ProgramId);

    /// RGBA8 color-attachable texture, sampled with clamp-to-edge.
    fn create_render_target(&mut self, label: &str, width: u32, height: u32) -> Result<TextureId, GpuError>;
    /// Sampled-only texture initialized from tightly packed RGBA8 rows.
    fn upload_texture(&mut self, label: &str, width: u32, height: u32, rgba: &[u8]) -> Result<TextureId, GpuError>;
    fn destroy_texture(&mut self, texture: TextureId);
    fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)>;
    /// 1x1 transparent texture bound to samplers nobody provided an input for.
    fn default_texture(&self) -> TextureId;

    fn draw_pass(&mut self, draw: &PassDraw<'_>) -> Result<(), GpuError>;
    fn draw_canvas(&mut self, target: Surface, vertices: &[CanvasVertex], paint: CanvasPaint) -> Result<(), GpuError>;
    fn clear(&mut self, target: Surface, color: [f32; 4]) -> Result<(), GpuError>;

    fn surface_size(&self) -> (u32, u32);
    fn resize_surface(&mut self, width: u32, height: u32);
    /// Show everything drawn to [`Surface::Screen`] since the last present.
    fn present(&mut self) -> Result<(), GpuError>;
    /// Drop the frame in progress without showing it.
    fn discard_frame(&mut self);
}
