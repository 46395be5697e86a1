//! A backend that records calls instead of drawing. Drives the pipeline and
//! orchestrator in tests without a GPU adapter.

use super::{CanvasPaint, CanvasVertex, GpuBackend, PassDraw, ProgramId, Surface, TextureId};
use crate::error::GpuError;
use crate::shader::{CompiledShader, ShaderReflection};
use crate::utils::rgba_len;
use std::collections::{BTreeMap, HashMap};

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCall {
    CreateProgram { program: ProgramId, label: String },
    DestroyProgram(ProgramId),
    CreateTarget { texture: TextureId, label: String, width: u32, height: u32 },
    UploadTexture { texture: TextureId, label: String, width: u32, height: u32 },
    DestroyTexture(TextureId),
    DrawPass {
        program: ProgramId,
        label: String,
        output: Surface,
        /// Sampler name to bound texture, resolved through the program reflection.
        samplers: BTreeMap<String, TextureId>,
        uniform_bytes: usize,
    },
    DrawCanvas { target: Surface, vertices: usize, paint: CanvasPaint },
    Clear { target: Surface, color: [f32; 4] },
    Present,
    Discard,
}

struct RecordedProgram {
    label: String,
    reflection: ShaderReflection,
}

/// Records every call and hands out sequential ids.
pub struct RecordingBackend {
    calls: Vec<GpuCall>,
    textures: HashMap<u64, (String, u32, u32)>,
    programs: HashMap<u64, RecordedProgram>,
    next_id: u64,
    size: (u32, u32),
    pass_draws: usize,
    fail_pass_draw_at: Option<usize>,
    fail_targets: bool,
    reject_programs: bool,
}

impl RecordingBackend {
    /// The default texture is id 0, everything else counts up from 1.
    pub fn new(width: u32, height: u32) -> Self {
        let mut textures = HashMap::new();
        textures.insert(0, ("default".to_string(), 1, 1));
        Self {
            calls: Vec::new(),
            textures,
            programs: HashMap::new(),
            next_id: 1,
            size: (width, height),
            pass_draws: 0,
            fail_pass_draw_at: None,
            fail_targets: false,
            reject_programs: false,
        }
    }

    /// Make the `n`-th pass draw (1-based, counted from construction) fail.
    pub fn fail_pass_draw_at(&mut self, n: usize) {
        self.fail_pass_draw_at = Some(n);
    }

    /// Make every subsequent render target allocation report an incomplete framebuffer.
    pub fn fail_render_targets(&mut self, fail: bool) {
        self.fail_targets = fail;
    }

    /// Make every subsequent program creation fail.
    pub fn reject_programs(&mut self, reject: bool) {
        self.reject_programs = reject;
    }

    pub fn calls(&self) -> &[GpuCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Pass draws recorded so far, in order.
    pub fn pass_draws(&self) -> Vec<&GpuCall> {
        self.calls
            .iter()
            .filter(|c| matches!(c, GpuCall::DrawPass { .. }))
            .collect()
    }

    /// Pass draws attempted, including the one that failed.
    pub fn pass_draw_attempts(&self) -> usize {
        self.pass_draws
    }

    /// Textures currently alive, excluding the default texture.
    pub fn live_textures(&self) -> usize {
        self.textures.len() - 1
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn label_of(&self, texture: TextureId) -> Option<&str> {
        self.textures.get(&texture.0).map(|(label, _, _)| label.as_str())
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_surface(&self, surface: Surface) -> Result<(), GpuError> {
        match surface {
            Surface::Screen => Ok(()),
            Surface::Texture(id) if self.textures.contains_key(&id.0) => Ok(()),
            Surface::Texture(id) => Err(GpuError::UnknownResource(id.0)),
        }
    }
}

impl GpuBackend for RecordingBackend {
    fn create_program(&mut self, label: &str, shader: &CompiledShader) -> Result<ProgramId, GpuError> {
        if self.reject_programs {
            return Err(GpuError::ProgramRejected(format!("{label} rejected")));
        }
        let program = ProgramId(self.allocate_id());
        self.programs.insert(
            program.0,
            RecordedProgram {
                label: label.to_string(),
                reflection: shader.reflection.clone(),
            },
        );
        self.calls.push(GpuCall::CreateProgram {
            program,
            label: label.to_string(),
        });
        Ok(program)
    }

    fn destroy_program(&mut self, program: ProgramId) {
        if self.programs.remove(&program.0).is_some() {
            self.calls.push(GpuCall::DestroyProgram(program));
        }
    }

    fn create_render_target(&mut self, label: &str, width: u32, height: u32) -> Result<TextureId, GpuError> {
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidSize { width, height });
        }
        if self.fail_targets {
            return Err(GpuError::FramebufferIncomplete(format!("{label}: attachment rejected")));
        }
        let texture = TextureId(self.allocate_id());
        self.textures.insert(texture.0, (label.to_string(), width, height));
        self.calls.push(GpuCall::CreateTarget {
            texture,
            label: label.to_string(),
            width,
            height,
        });
        Ok(texture)
    }

    fn upload_texture(&mut self, label: &str, width: u32, height: u32, rgba: &[u8]) -> Result<TextureId, GpuError> {
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidSize { width, height });
        }
        if rgba_len(width, height) != Some(rgba.len()) {
            return Err(GpuError::Backend(format!("{label}: pixel buffer has the wrong length")));
        }
        let texture = TextureId(self.allocate_id());
        self.textures.insert(texture.0, (label.to_string(), width, height));
        self.calls.push(GpuCall::UploadTexture {
            texture,
            label: label.to_string(),
            width,
            height,
        });
        Ok(texture)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if texture.0 != 0 && self.textures.remove(&texture.0).is_some() {
            self.calls.push(GpuCall::DestroyTexture(texture));
        }
    }

    fn texture_size(&self, texture: TextureId) -> Option<(u32, u32)> {
        self.textures.get(&texture.0).map(|(_, w, h)| (*w, *h))
    }

    fn default_texture(&self) -> TextureId {
        TextureId(0)
    }

    fn draw_pass(&mut self, draw: &PassDraw<'_>) -> Result<(), GpuError> {
        self.pass_draws += 1;
        if self.fail_pass_draw_at == Some(self.pass_draws) {
            return Err(GpuError::Injected(self.pass_draws));
        }
        self.check_surface(draw.output)?;
        let program = self
            .programs
            .get(&draw.program.0)
            .ok_or(GpuError::UnknownResource(draw.program.0))?;

        let mut samplers = BTreeMap::new();
        for binding in draw.textures {
            if !self.textures.contains_key(&binding.texture.0) {
                return Err(GpuError::UnknownResource(binding.texture.0));
            }
            if let Some(sampler) = program
                .reflection
                .samplers
                .iter()
                .find(|s| s.texture_binding == binding.texture_binding)
            {
                samplers.insert(sampler.name.clone(), binding.texture);
            }
        }

        let call = GpuCall::DrawPass {
            program: draw.program,
            label: program.label.clone(),
            output: draw.output,
            samplers,
            uniform_bytes: draw.uniforms.iter().map(|u| u.data.len()).sum(),
        };
        self.calls.push(call);
        Ok(())
    }

    fn draw_canvas(&mut self, target: Surface, vertices: &[CanvasVertex], paint: CanvasPaint) -> Result<(), GpuError> {
        self.check_surface(target)?;
        if let CanvasPaint::Image(texture) = paint {
            self.check_surface(Surface::Texture(texture))?;
        }
        self.calls.push(GpuCall::DrawCanvas {
            target,
            vertices: vertices.len(),
            paint,
        });
        Ok(())
    }

    fn clear(&mut self, target: Surface, color: [f32; 4]) -> Result<(), GpuError> {
        self.check_surface(target)?;
        self.calls.push(GpuCall::Clear { target, color });
        Ok(())
    }

    fn surface_size(&self) -> (u32, u32) {
        self.size
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.size = (width, height);
        }
    }

    fn present(&mut self) -> Result<(), GpuError> {
        self.calls.push(GpuCall::Present);
        Ok(())
    }

    fn discard_frame(&mut self) {
        self.calls.push(GpuCall::Discard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{PassDraw, TextureBinding};
    use crate::shader::{FilterMode, SamplerBinding};
    use std::path::PathBuf;

    fn shader_with_sampler(name: &str) -> CompiledShader {
        CompiledShader {
            path: PathBuf::from("test.slang"),
            vertex_source: String::new(),
            fragment_source: String::new(),
            parameters: Vec::new(),
            alias: None,
            reflection: ShaderReflection {
                uniform_blocks: Vec::new(),
                samplers: vec![SamplerBinding {
                    name: name.to_string(),
                    texture_binding: 2,
                    sampler_binding: 3,
                }],
            },
        }
    }

    #[test]
    fn records_resolved_sampler_names() {
        let mut backend = RecordingBackend::new(64, 64);
        let program = backend.create_program("pass_0", &shader_with_sampler("Source")).unwrap();
        let input = backend.create_render_target("input", 8, 8).unwrap();
        let textures = [TextureBinding {
            texture_binding: 2,
            sampler_binding: 3,
            texture: input,
            filter: FilterMode::Linear,
        }];
        backend
            .draw_pass(&PassDraw {
                program,
                textures: &textures,
                uniforms: &[],
                output: Surface::Screen,
            })
            .unwrap();

        let draws = backend.pass_draws();
        assert_eq!(draws.len(), 1);
        let GpuCall::DrawPass { samplers, output, .. } = draws[0] else {
            panic!("expected a pass draw");
        };
        assert_eq!(samplers.get("Source"), Some(&input));
        assert_eq!(*output, Surface::Screen);
    }

    #[test]
    fn injected_failure_hits_only_the_nth_draw() {
        let mut backend = RecordingBackend::new(64, 64);
        let program = backend.create_program("p", &shader_with_sampler("Source")).unwrap();
        backend.fail_pass_draw_at(2);
        let draw = PassDraw {
            program,
            textures: &[],
            uniforms: &[],
            output: Surface::Screen,
        };
        assert!(backend.draw_pass(&draw).is_ok());
        assert_eq!(backend.draw_pass(&draw), Err(GpuError::Injected(2)));
        assert!(backend.draw_pass(&draw).is_ok());
        assert_eq!(backend.pass_draw_attempts(), 3);
        assert_eq!(backend.pass_draws().len(), 2);
    }

    #[test]
    fn tracks_live_resources() {
        let mut backend = RecordingBackend::new(64, 64);
        let a = backend.create_render_target("a", 4, 4).unwrap();
        let b = backend.upload_texture("b", 1, 1, &[0, 0, 0, 255]).unwrap();
        assert_eq!(backend.live_textures(), 2);
        backend.destroy_texture(a);
        backend.destroy_texture(backend.default_texture());
        assert_eq!(backend.live_textures(), 1);
        assert_eq!(backend.label_of(b), Some("b"));
        assert_eq!(
            backend.create_render_target("zero", 0, 4),
            Err(GpuError::InvalidSize { width: 0, height: 4 })
        );
        assert!(matches!(
            backend.upload_texture("huge", u32::MAX, u32::MAX, &[]),
            Err(GpuError::Backend(_))
        ));
        backend.fail_render_targets(true);
        assert!(matches!(
            backend.create_render_target("c", 4, 4),
            Err(GpuError::FramebufferIncomplete(_))
        ));
    }
}
