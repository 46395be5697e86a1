//! wgpu implementation of [`GpuBackend`], presenting to a window or to an offscreen frame.

use super::{
    CanvasPaint, CanvasVertex, GpuBackend, GpuContext, PassDraw, PassVertex, ProgramId, Surface,
    TextureId,
};
use crate::error::GpuError;
use crate::shader::{CompiledShader, FilterMode, SamplerBinding};
use crate::utils::rgba_len;
use anyhow::{anyhow, Result};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn, Span};
use wgpu::util::DeviceExt;
use winit::window::Window;

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

struct GpuTexture {
    texture: wgpu::Texture,
    width: u32,
    height: u32,
    renderable: bool,
}

impl GpuTexture {
    fn view(&self) -> wgpu::TextureView {
        self.texture.create_view(&wgpu::TextureViewDescriptor::default())
    }
}

struct GpuProgram {
    label: String,
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
    uniform_buffers: Vec<(u32, wgpu::Buffer)>,
    samplers: Vec<SamplerBinding>,
}

struct CanvasPipelines {
    solid: wgpu::RenderPipeline,
    replace: wgpu::RenderPipeline,
    image: wgpu::RenderPipeline,
}

enum Screen {
    Window {
        window: Arc<Window>,
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
        frame: Option<wgpu::SurfaceTexture>,
    },
    Offscreen(GpuTexture),
}

pub struct WgpuBackend {
    context: GpuContext,
    screen: Screen,
    screen_format: wgpu::TextureFormat,
    screen_drawn: bool,
    textures: HashMap<u64, GpuTexture>,
    programs: HashMap<u64, GpuProgram>,
    next_id: u64,
    default_texture: TextureId,
    linear_sampler: wgpu::Sampler,
    nearest_sampler: wgpu::Sampler,
    quad_buffer: wgpu::Buffer,
    canvas_module: wgpu::ShaderModule,
    canvas_image_layout: wgpu::BindGroupLayout,
    canvas_pipelines: HashMap<wgpu::TextureFormat, CanvasPipelines>,
    span: Span,
}

impl WgpuBackend {
    /// Backend presenting to `window`.
    pub fn with_window(window: Arc<Window>, span: Span) -> Result<Self> {
        let (context, surface) = GpuContext::for_window(window.clone())?;

        let size = window.inner_size();
        let caps = surface.get_capabilities(&context.adapter);
        // Pass shaders write display-referred values, so skip the sRGB encode.
        let format = caps
            .formats
            .iter()
            .find(|f| !f.is_srgb())
            .or_else(|| caps.formats.first())
            .copied()
            .ok_or_else(|| anyhow!("surface reports no supported formats"))?;

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&context.device, &config);
        info!(parent: &span, ?format, width = config.width, height = config.height, "configured window surface");

        let screen = Screen::Window {
            window,
            surface,
            config,
            frame: None,
        };
        Ok(Self::from_parts(context, screen, format, span))
    }

    /// Backend whose screen is an offscreen RGBA8 texture that can be read back.
    pub fn headless(width: u32, height: u32, span: Span) -> Result<Self> {
        let context = GpuContext::headless()?;
        let texture = create_texture(
            &context.device,
            "Offscreen Screen",
            width.max(1),
            height.max(1),
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
        );
        info!(parent: &span, width, height, "created headless backend");
        Ok(Self::from_parts(
            context,
            Screen::Offscreen(GpuTexture {
                texture,
                width: width.max(1),
                height: height.max(1),
                renderable: true,
            }),
            TARGET_FORMAT,
            span,
        ))
    }

    fn from_parts(context: GpuContext, screen: Screen, screen_format: wgpu::TextureFormat, span: Span) -> Self {
        let device = &context.device;

        let sampler = |label: &str, filter: wgpu::FilterMode| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some(label),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                address_mode_w: wgpu::AddressMode::ClampToEdge,
                mag_filter: filter,
                min_filter: filter,
                ..Default::default()
            })
        };
        let linear_sampler = sampler("Linear Sampler", wgpu::FilterMode::Linear);
        let nearest_sampler = sampler("Nearest Sampler", wgpu::FilterMode::Nearest);

        let quad_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Pass Quad Vertex Buffer"),
            contents: bytemuck::cast_slice(&PassVertex::QUAD),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let canvas_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Canvas Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("shaders/canvas.wgsl"))),
        });

        let canvas_image_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Canvas Image Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let default_texture = create_texture(
            device,
            "Default Texture",
            1,
            1,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        write_rgba(&context.queue, &default_texture, 1, 1, &[0, 0, 0, 0]);

        let mut textures = HashMap::new();
        textures.insert(
            0,
            GpuTexture {
                texture: default_texture,
                width: 1,
                height: 1,
                renderable: false,
            },
        );

        Self {
            context,
            screen,
            screen_format,
            screen_drawn: false,
            textures,
            programs: HashMap::new(),
            next_id: 1,
            default_texture: TextureId(0),
            linear_sampler,
            nearest_sampler,
            quad_buffer,
            canvas_module,
            canvas_image_layout,
            canvas_pipelines: HashMap::new(),
            span,
        }
    }

    pub fn window(&self) -> Option<&Arc<Window>> {
        match &self.screen {
            Screen::Window { window, .. } => Some(window),
            Screen::Offscreen(_) => None,
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// View, format and load op for a draw into `surface`.
    fn resolve_target(
        &mut self,
        surface: Surface,
        full_screen: bool,
    ) -> Result<(wgpu::TextureView, wgpu::TextureFormat, wgpu::LoadOp<wgpu::Color>), GpuError> {
        match surface {
            Surface::Screen => {
                let view = self.screen_view()?;
                let load = if self.screen_drawn {
                    wgpu::LoadOp::Load
                } else {
                    wgpu::LoadOp::Clear(wgpu::Color::BLACK)
                };
                self.screen_drawn = true;
                Ok((view, self.screen_format, load))
            }
            Surface::Texture(id) => {
                let texture = self.textures.get(&id.0).ok_or(GpuError::UnknownResource(id.0))?;
                if !texture.renderable {
                    return Err(GpuError::Backend(format!("texture {} is not a render target", id.0)));
                }
                let load = if full_screen {
                    wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)
                } else {
                    wgpu::LoadOp::Load
                };
                Ok((texture.view(), TARGET_FORMAT, load))
            }
        }
    }

    fn screen_view(&mut self) -> Result<wgpu::TextureView, GpuError> {
        let span = self.span.clone();
        let device = &self.context.device;
        match &mut self.screen {
            Screen::Offscreen(texture) => Ok(texture.view()),
            Screen::Window {
                surface,
                config,
                frame,
                ..
            } => {
                if frame.is_none() {
                    let acquired = match surface.get_current_texture() {
                        Ok(texture) => texture,
                        Err(e) => {
                            warn!(parent: &span, error = %e, "surface texture unavailable, reconfiguring");
                            surface.configure(device, config);
                            surface
                                .get_current_texture()
                                .map_err(|e| GpuError::SurfaceLost(e.to_string()))?
                        }
                    };
                    *frame = Some(acquired);
                }
                frame
                    .as_ref()
                    .map(|f| f.texture.create_view(&wgpu::TextureViewDescriptor::default()))
                    .ok_or_else(|| GpuError::SurfaceLost("no frame acquired".into()))
            }
        }
    }

    fn ensure_pass_pipeline(&mut self, id: ProgramId, format: wgpu::TextureFormat) -> Result<(), GpuError> {
        let span = self.span.clone();
        let device = &self.context.device;
        let program = self.programs.get_mut(&id.0).ok_or(GpuError::UnknownResource(id.0))?;
        if !program.pipelines.contains_key(&format) {
            debug!(parent: &span, program = %program.label, ?format, "creating pass pipeline");
            let pipeline = validated(device, || create_pass_pipeline(device, program, format))
                .map_err(|e| GpuError::ProgramRejected(format!("{} ({format:?}): {e}", program.label)))?;
            program.pipelines.insert(format, pipeline);
        }
        Ok(())
    }

    fn ensure_canvas_pipelines(&mut self, format: wgpu::TextureFormat) -> Result<(), GpuError> {
        if self.canvas_pipelines.contains_key(&format) {
            return Ok(());
        }
        let device = &self.context.device;
        let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
        let solid_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Canvas Solid Pipeline Layout"),
            bind_group_layouts: &[],
            immediate_size: 0,
        });
        let image_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Canvas Image Pipeline Layout"),
            bind_group_layouts: &[&self.canvas_image_layout],
            immediate_size: 0,
        });
        let premultiplied = Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING);
        let pipelines = CanvasPipelines {
            solid: create_canvas_pipeline(device, &self.canvas_module, &solid_layout, "fs_solid", format, premultiplied, "Canvas Solid Pipeline"),
            replace: create_canvas_pipeline(device, &self.canvas_module, &solid_layout, "fs_solid", format, None, "Canvas Replace Pipeline"),
            image: create_canvas_pipeline(device, &self.canvas_module, &image_layout, "fs_image", format, premultiplied, "Canvas Image Pipeline"),
        };
        if let Some(e) = pollster::block_on(scope.pop()) {
            return Err(GpuError::ProgramRejected(format!("canvas pipelines ({format:?}): {e}")));
        }
        self.canvas_pipelines.insert(format, pipelines);
        Ok(())
    }

    fn submit_pass(
        &self,
        label: &str,
        view: &wgpu::TextureView,
        load: wgpu::LoadOp<wgpu::Color>,
        record: impl FnOnce(&mut wgpu::RenderPass<'_>),
    ) -> Result<(), GpuError> {
        let device = &self.context.device;
        let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(label),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            record(&mut render_pass);
        }
        self.context.queue.submit(std::iter::once(encoder.finish()));
        match pollster::block_on(scope.pop()) {
            Some(e) => Err(GpuError::Backend(format!("{label}: {e}"))),
            None => Ok(()),
        }
    }

    /// Snapshot of the offscreen screen, used for headless screenshots.
    pub fn snapshot(&self) -> Result<image::RgbaImage, GpuError> {
        let Screen::Offscreen(screen) = &self.screen else {
            return Err(GpuError::Backend("only the headless backend can snapshot its screen".into()));
        };
        let pitch = padded_row_bytes(screen.width);
        let readback = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Snapshot Readback Buffer"),
            size: u64::from(pitch) * u64::from(screen.height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Snapshot Encoder"),
            });
        encoder.copy_texture_to_buffer(
            screen.texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(pitch),
                    rows_per_image: Some(screen.height),
                },
            },
            screen.texture.size(),
        );
        let submitted = self.context.queue.submit([encoder.finish()]);

        let packed = self.map_readback(&readback, submitted, |mapped| {
            pack_rows(mapped, pitch as usize, screen.width as usize * 4)
        })?;
        debug!(parent: &self.span, width = screen.width, height = screen.height, "snapshot taken");
        image::RgbaImage::from_raw(screen.width, screen.height, packed)
            .ok_or_else(|| GpuError::Backend("snapshot does not match the screen size".into()))
    }

    /// Wait for `submitted`, map `buffer` and hand its bytes to `read`.
    fn map_readback<T>(
        &self,
        buffer: &wgpu::Buffer,
        submitted: wgpu::SubmissionIndex,
        read: impl FnOnce(&[u8]) -> T,
    ) -> Result<T, GpuError> {
        let (tx, rx) = std::sync::mpsc::channel();
        buffer.map_async(wgpu::MapMode::Read, .., move |mapped| {
            let _ = tx.send(mapped);
        });
        self.context
            .device
            .poll(wgpu::PollType::Wait {
                timeout: None,
                submission_index: Some(submitted),
            })
            .map_err(|e| GpuError::Backend(format!("waiting for readback: {e}")))?;
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(GpuError::Backend(format!("mapping readback: {e}"))),
            Err(_) => return Err(GpuError::Backend("readback callback dropped".into())),
        }
        let value = read(&buffer.get_mapped_range(..));
        buffer.unmap();
        Ok(value)
    }
}

impl GpuBackend for WgpuBackend {
    fn create_program(&mut self, label: &str, shader: &CompiledShader) -> Result<ProgramId, GpuError> {
        let device = &self.context.device;
        // The offscreen variant is built here so a bad shader fails the load, not a frame.
        let program = validated(device, || {
            let mut program = build_program(device, label, shader);
            let pipeline = create_pass_pipeline(device, &program, TARGET_FORMAT);
            program.pipelines.insert(TARGET_FORMAT, pipeline);
            program
        })
        .map_err(|e| GpuError::ProgramRejected(format!("{label}: {e}")))?;

        let id = self.allocate_id();
        self.programs.insert(id, program);
        debug!(parent: &self.span, label, id, "created program");
        Ok(ProgramId(id))
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(&program.0);
    }

    fn create_render_target(&mut self, label: &str, width: u32, height: u32) -> Result<TextureId, GpuError> {
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidSize { width, height });
        }
        let max = self.context.device.limits().max_texture_dimension_2d;
        if width > max || height > max {
            return Err(GpuError::FramebufferIncomplete(format!(
                "{width}x{height} exceeds the device limit of {max}"
            )));
        }
        let texture = create_texture(
            &self.context.device,
            label,
            width,
            height,
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
        );
        let id = self.allocate_id();
        self.textures.insert(
            id,
            GpuTexture {
                texture,
                width,
                height,
                renderable: true,
            },
        );
        Ok(TextureId(id))
    }

    fn upload_texture(&mut self, label: &str, width: u32, height: u32, rgba: &[u8]) -> Result<TextureId, GpuError> {
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidSize { width, height });
        }
        let Some(expected) = rgba_len(width, height) else {
            return Err(GpuError::InvalidSize { width, height });
        };
        if rgba.len() != expected {
            return Err(GpuError::Backend(format!(
                "{label}: expected {expected} bytes for {width}x{height}, got {}",
                rgba.len()
            )));
        }
        let texture = create_texture(
            &self.context.device,
            label,
            width,
            height,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        write_rgba(&self.context.queue, &texture, width, height, rgba);
        let id = self.allocate_id();
        self.textures.insert(
            id,
            GpuTexture {
                texture,
                width,
                height,
                renderable: false,
            },
        );
        Ok(TextureId(id))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if texture != self.default_texture {
            self.textures.remove(&texture.0);
        }
    }

    fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)> {
        self.textures.get(&texture.0).map(|t| (t.width, t.height))
    }

    fn default_texture(&self) -> TextureId {
        self.default_texture
    }

    fn draw_pass(&mut self, draw: &PassDraw<'_>) -> Result<(), GpuError> {
        let (view, format, load) = self.resolve_target(draw.output, true)?;
        self.ensure_pass_pipeline(draw.program, format)?;

        let program = self
            .programs
            .get(&draw.program.0)
            .ok_or(GpuError::UnknownResource(draw.program.0))?;

        for upload in draw.uniforms {
            if let Some((_, buffer)) = program.uniform_buffers.iter().find(|(b, _)| *b == upload.binding) {
                self.context.queue.write_buffer(buffer, 0, upload.data);
            }
        }

        let mut views = Vec::with_capacity(program.samplers.len());
        for sampler in &program.samplers {
            let (texture, filter) = draw
                .textures
                .iter()
                .find(|t| t.texture_binding == sampler.texture_binding)
                .map(|t| (t.texture, t.filter))
                .unwrap_or((self.default_texture, FilterMode::Linear));
            let texture = self.textures.get(&texture.0).ok_or(GpuError::UnknownResource(texture.0))?;
            views.push((sampler, texture.view(), filter));
        }

        let mut entries: Vec<wgpu::BindGroupEntry<'_>> = program
            .uniform_buffers
            .iter()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: *binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        for (sampler, view, filter) in &views {
            entries.push(wgpu::BindGroupEntry {
                binding: sampler.texture_binding,
                resource: wgpu::BindingResource::TextureView(view),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: sampler.sampler_binding,
                resource: wgpu::BindingResource::Sampler(match filter {
                    FilterMode::Linear => &self.linear_sampler,
                    FilterMode::Nearest => &self.nearest_sampler,
                }),
            });
        }

        let device = &self.context.device;
        let bind_group = validated(device, || {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("{} Bind Group", program.label)),
                layout: &program.bind_group_layout,
                entries: &entries,
            })
        })
        .map_err(|e| GpuError::Backend(format!("{} bind group: {e}", program.label)))?;
        let pipeline = program
            .pipelines
            .get(&format)
            .ok_or(GpuError::UnknownResource(draw.program.0))?;

        self.submit_pass(&program.label, &view, load, |render_pass| {
            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.set_vertex_buffer(0, self.quad_buffer.slice(..));
            render_pass.draw(0..PassVertex::QUAD.len() as u32, 0..1);
        })
    }

    fn draw_canvas(&mut self, target: Surface, vertices: &[CanvasVertex], paint: CanvasPaint) -> Result<(), GpuError> {
        if vertices.is_empty() {
            return Ok(());
        }
        let (view, format, load) = self.resolve_target(target, false)?;
        self.ensure_canvas_pipelines(format)?;
        let pipelines = self
            .canvas_pipelines
            .get(&format)
            .ok_or_else(|| GpuError::Backend(format!("no canvas pipelines for {format:?}")))?;

        let vertex_buffer = self
            .context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Canvas Vertex Buffer"),
                contents: bytemuck::cast_slice(vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });

        let (pipeline, bind_group) = match paint {
            CanvasPaint::Solid => (&pipelines.solid, None),
            CanvasPaint::Replace => (&pipelines.replace, None),
            CanvasPaint::Image(id) => {
                let texture = self.textures.get(&id.0).ok_or(GpuError::UnknownResource(id.0))?;
                let view = texture.view();
                let bind_group = self.context.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Canvas Image Bind Group"),
                    layout: &self.canvas_image_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: wgpu::BindingResource::TextureView(&view),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::Sampler(&self.linear_sampler),
                        },
                    ],
                });
                (&pipelines.image, Some(bind_group))
            }
        };

        self.submit_pass("Canvas Pass", &view, load, |render_pass| {
            render_pass.set_pipeline(pipeline);
            if let Some(bind_group) = &bind_group {
                render_pass.set_bind_group(0, bind_group, &[]);
            }
            render_pass.set_vertex_buffer(0, vertex_buffer.slice(..));
            render_pass.draw(0..vertices.len() as u32, 0..1);
        })
    }

    fn clear(&mut self, target: Surface, color: [f32; 4]) -> Result<(), GpuError> {
        let (view, _, _) = self.resolve_target(target, false)?;
        let color = wgpu::Color {
            r: f64::from(color[0]),
            g: f64::from(color[1]),
            b: f64::from(color[2]),
            a: f64::from(color[3]),
        };
        self.submit_pass("Clear Pass", &view, wgpu::LoadOp::Clear(color), |_| {})
    }

    fn surface_size(&self) -> (u32, u32) {
        match &self.screen {
            Screen::Window { config, .. } => (config.width, config.height),
            Screen::Offscreen(texture) => (texture.width, texture.height),
        }
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.screen_drawn = false;
        match &mut self.screen {
            Screen::Window {
                surface,
                config,
                frame,
                ..
            } => {
                *frame = None;
                config.width = width;
                config.height = height;
                surface.configure(&self.context.device, config);
            }
            Screen::Offscreen(texture) => {
                *texture = GpuTexture {
                    texture: create_texture(
                        &self.context.device,
                        "Offscreen Screen",
                        width,
                        height,
                        wgpu::TextureUsages::RENDER_ATTACHMENT
                            | wgpu::TextureUsages::TEXTURE_BINDING
                            | wgpu::TextureUsages::COPY_SRC,
                    ),
                    width,
                    height,
                    renderable: true,
                };
            }
        }
        debug!(parent: &self.span, width, height, "resized screen");
    }

    fn present(&mut self) -> Result<(), GpuError> {
        self.screen_drawn = false;
        if let Screen::Window { window, frame, .. } = &mut self.screen {
            if let Some(frame) = frame.take() {
                window.pre_present_notify();
                frame.present();
            }
        }
        Ok(())
    }

    fn discard_frame(&mut self) {
        self.screen_drawn = false;
        if let Screen::Window { frame, .. } = &mut self.screen {
            // Dropping an unpresented surface texture discards it.
            frame.take();
            return;
        }
        if let Err(e) = self.clear(Surface::Screen, [0.0, 0.0, 0.0, 1.0]) {
            warn!(parent: &self.span, error = %e, "failed to blank discarded frame");
        }
        self.screen_drawn = false;
    }
}

fn create_texture(
    device: &wgpu::Device,
    label: &str,
    width: u32,
    height: u32,
    usage: wgpu::TextureUsages,
) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TARGET_FORMAT,
        usage,
        view_formats: &[],
    })
}

fn write_rgba(queue: &wgpu::Queue, texture: &wgpu::Texture, width: u32, height: u32, rgba: &[u8]) {
    queue.write_texture(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        rgba,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(width * 4),
            rows_per_image: Some(height),
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
}

fn build_program(device: &wgpu::Device, label: &str, shader: &CompiledShader) -> GpuProgram {
    let vertex = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(&format!("{label} Vertex Shader")),
        source: wgpu::ShaderSource::Wgsl(Cow::Owned(shader.vertex_source.clone())),
    });
    let fragment = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(&format!("{label} Fragment Shader")),
        source: wgpu::ShaderSource::Wgsl(Cow::Owned(shader.fragment_source.clone())),
    });

    let visibility = wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT;
    let mut entries = Vec::new();
    for block in &shader.reflection.uniform_blocks {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: block.binding,
            visibility,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
    }
    for sampler in &shader.reflection.samplers {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: sampler.texture_binding,
            visibility,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: sampler.sampler_binding,
            visibility,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        });
    }

    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(&format!("{label} Bind Group Layout")),
        entries: &entries,
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&format!("{label} Pipeline Layout")),
        bind_group_layouts: &[&bind_group_layout],
        immediate_size: 0,
    });

    let uniform_buffers = shader
        .reflection
        .uniform_blocks
        .iter()
        .map(|block| {
            let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("{label} {} Uniform Buffer", block.instance)),
                size: u64::from(block.size.div_ceil(16) * 16),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            (block.binding, buffer)
        })
        .collect();

    GpuProgram {
        label: label.to_string(),
        vertex,
        fragment,
        bind_group_layout,
        pipeline_layout,
        pipelines: HashMap::new(),
        uniform_buffers,
        samplers: shader.reflection.samplers.clone(),
    }
}

/// Bytes per row of a texture-to-buffer copy `width` texels wide.
fn padded_row_bytes(width: u32) -> u32 {
    (width * 4).next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
}

/// Drop the per-row copy padding, keeping `row` bytes of every `pitch`.
fn pack_rows(mapped: &[u8], pitch: usize, row: usize) -> Vec<u8> {
    mapped.chunks_exact(pitch).flat_map(|line| &line[..row]).copied().collect()
}

/// Run `f` inside a validation error scope and return what the scope caught.
fn validated<T>(device: &wgpu::Device, f: impl FnOnce() -> T) -> Result<T, wgpu::Error> {
    let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    match pollster::block_on(scope.pop()) {
        Some(e) => Err(e),
        None => Ok(value),
    }
}

fn create_pass_pipeline(
    device: &wgpu::Device,
    program: &GpuProgram,
    format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(&program.label),
        layout: Some(&program.pipeline_layout),
        vertex: wgpu::VertexState {
            module: &program.vertex,
            entry_point: Some("main"),
            buffers: &[PassVertex::layout()],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: &program.fragment,
            entry_point: Some("main"),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    })
}

fn create_canvas_pipeline(
    device: &wgpu::Device,
    module: &wgpu::ShaderModule,
    layout: &wgpu::PipelineLayout,
    fragment_entry: &str,
    format: wgpu::TextureFormat,
    blend: Option<wgpu::BlendState>,
    label: &str,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: Some("vs_main"),
            buffers: &[CanvasVertex::layout()],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: Some(fragment_entry),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            ..Default::default()
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::ShaderReflection;
    use std::path::PathBuf;

    /// Headless backend, or `None` on machines without any adapter.
    fn headless(width: u32, height: u32) -> Option<WgpuBackend> {
        match WgpuBackend::headless(width, height, Span::none()) {
            Ok(backend) => Some(backend),
            Err(e) => {
                eprintln!("skipping, no GPU adapter: {e:#}");
                None
            }
        }
    }

    #[test]
    fn copy_rows_are_padded_to_the_copy_alignment() {
        assert_eq!(padded_row_bytes(64), 256);
        assert_eq!(padded_row_bytes(70), 512);
        assert_eq!(padded_row_bytes(1), 256);

        let mut mapped = vec![0u8; 2 * 256];
        mapped[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        mapped[256..264].copy_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16]);
        assert_eq!(pack_rows(&mapped, 256, 8), (1..=16).collect::<Vec<u8>>());
    }

    #[test]
    fn broken_wgsl_is_rejected_instead_of_aborting() {
        let Some(mut backend) = headless(16, 16) else {
            return;
        };
        let shader = CompiledShader {
            path: PathBuf::from("broken.slang"),
            vertex_source: "@vertex fn main( -> {".to_string(),
            fragment_source: "@fragment fn main() -> @location(0) vec4<f32> { return vec4(1.0); }".to_string(),
            parameters: Vec::new(),
            alias: None,
            reflection: ShaderReflection::default(),
        };
        assert!(matches!(
            backend.create_program("pass_0", &shader),
            Err(GpuError::ProgramRejected(msg)) if msg.starts_with("pass_0")
        ));
        // The device survives the rejection.
        assert!(backend.clear(Surface::Screen, [0.0, 0.0, 0.0, 1.0]).is_ok());
    }

    #[test]
    fn snapshot_returns_the_cleared_screen() {
        let Some(mut backend) = headless(70, 3) else {
            return;
        };
        backend.clear(Surface::Screen, [1.0, 0.0, 0.0, 1.0]).unwrap();
        let image = backend.snapshot().unwrap();
        assert_eq!(image.dimensions(), (70, 3));
        assert!(image.pixels().all(|px| px.0 == [255, 0, 0, 255]));
    }

    #[test]
    fn oversized_uploads_fail_before_reaching_the_device() {
        let Some(mut backend) = headless(4, 4) else {
            return;
        };
        assert_eq!(
            backend.upload_texture("huge", u32::MAX, u32::MAX, &[]),
            Err(GpuError::InvalidSize {
                width: u32::MAX,
                height: u32::MAX
            })
        );
        assert!(backend.upload_texture("short", 2, 2, &[0; 4]).is_err());
    }
}
