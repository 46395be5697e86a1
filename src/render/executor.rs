//! Program registry and single full-screen pass execution.

use crate::gpu::{GpuBackend, PassDraw, ProgramId, Surface, TextureBinding, TextureId, UniformUpload};
use crate::shader::{CompiledShader, FilterMode, UniformBlock, UniformKind};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, Span};

/// A value for one named uniform member.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    UInt(u32),
    Vec4([f32; 4]),
    /// Column-major.
    Mat4([f32; 16]),
}

pub type UniformValues = BTreeMap<String, UniformValue>;

/// A `*Size` uniform: width, height and their reciprocals.
pub fn size_uniform((width, height): (u32, u32)) -> UniformValue {
    let (w, h) = (width as f32, height as f32);
    UniformValue::Vec4([w, h, 1.0 / w, 1.0 / h])
}

struct Program {
    id: ProgramId,
    shader: Arc<CompiledShader>,
}

/// Owns one linked program per pass name and draws passes with it.
///
/// Every operation reports failure through its return value and `last_error`
/// so the pipeline decides how to escalate.
pub struct PassExecutor {
    programs: HashMap<String, Program>,
    last_error: Option<String>,
    span: Span,
}

impl PassExecutor {
    pub fn new(span: Span) -> Self {
        Self {
            programs: HashMap::new(),
            last_error: None,
            span,
        }
    }

    /// Link `shader` as the program for `name`, replacing any previous one.
    pub fn compile_program(&mut self, backend: &mut dyn GpuBackend, name: &str, shader: Arc<CompiledShader>) -> bool {
        if let Some(old) = self.programs.remove(name) {
            backend.destroy_program(old.id);
        }
        match backend.create_program(name, &shader) {
            Ok(id) => {
                debug!(parent: &self.span, "Linked program for {}", name);
                self.programs.insert(name.to_string(), Program { id, shader });
                true
            }
            Err(e) => {
                error!(parent: &self.span, "Failed to link program for {}: {}", name, e);
                self.last_error = Some(e.to_string());
                false
            }
        }
    }

    /// Draw `name` into `output` with its samplers bound to `inputs`.
    ///
    /// Samplers with no entry in `inputs` see the backend's default texture.
    pub fn execute_pass(
        &mut self,
        backend: &mut dyn GpuBackend,
        name: &str,
        inputs: &BTreeMap<String, TextureId>,
        output: Surface,
        uniforms: &UniformValues,
        filter: FilterMode,
    ) -> bool {
        let Some(program) = self.programs.get(name) else {
            let message = format!("no program linked for {name}");
            error!(parent: &self.span, "{}", message);
            self.last_error = Some(message);
            return false;
        };

        let default_texture = backend.default_texture();
        let textures: Vec<TextureBinding> = program
            .shader
            .reflection
            .samplers
            .iter()
            .map(|sampler| TextureBinding {
                texture_binding: sampler.texture_binding,
                sampler_binding: sampler.sampler_binding,
                texture: inputs.get(&sampler.name).copied().unwrap_or(default_texture),
                filter,
            })
            .collect();

        let blocks: Vec<(u32, Vec<u8>)> = program
            .shader
            .reflection
            .uniform_blocks
            .iter()
            .map(|block| (block.binding, pack_uniforms(block, uniforms)))
            .collect();
        let uploads: Vec<UniformUpload> = blocks
            .iter()
            .map(|(binding, data)| UniformUpload {
                binding: *binding,
                data,
            })
            .collect();

        let draw = PassDraw {
            program: program.id,
            textures: &textures,
            uniforms: &uploads,
            output,
        };
        match backend.draw_pass(&draw) {
            Ok(()) => true,
            Err(e) => {
                error!(parent: &self.span, "Pass {} failed: {}", name, e);
                self.last_error = Some(e.to_string());
                false
            }
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn has_program(&self, name: &str) -> bool {
        self.programs.contains_key(name)
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    pub fn dispose(&mut self, backend: &mut dyn GpuBackend) {
        for (_, program) in self.programs.drain() {
            backend.destroy_program(program.id);
        }
    }
}

/// Lay out `values` in a std140 block at the reflected member offsets.
///
/// Members without a value stay zero. Values are coerced to the member's type.
pub fn pack_uniforms(block: &UniformBlock, values: &UniformValues) -> Vec<u8> {
    let mut data = vec![0u8; block.size as usize];
    for member in &block.members {
        let Some(value) = values.get(&member.name) else {
            continue;
        };
        let bytes: Vec<u8> = match (member.kind, *value) {
            (UniformKind::Float, UniformValue::Float(v)) => v.to_ne_bytes().to_vec(),
            (UniformKind::Float, UniformValue::UInt(v)) => (v as f32).to_ne_bytes().to_vec(),
            (UniformKind::UInt, UniformValue::UInt(v)) => v.to_ne_bytes().to_vec(),
            (UniformKind::UInt, UniformValue::Float(v)) => (v.max(0.0) as u32).to_ne_bytes().to_vec(),
            (UniformKind::Int, UniformValue::UInt(v)) => (v as i32).to_ne_bytes().to_vec(),
            (UniformKind::Int, UniformValue::Float(v)) => (v as i32).to_ne_bytes().to_vec(),
            (UniformKind::Vec2, UniformValue::Vec4(v)) => bytemuck::cast_slice::<f32, u8>(&v[..2]).to_vec(),
            (UniformKind::Vec3, UniformValue::Vec4(v)) => bytemuck::cast_slice::<f32, u8>(&v[..3]).to_vec(),
            (UniformKind::Vec4, UniformValue::Vec4(v)) => bytemuck::cast_slice::<f32, u8>(&v).to_vec(),
            (UniformKind::Mat4, UniformValue::Mat4(m)) => bytemuck::cast_slice::<f32, u8>(&m).to_vec(),
            _ => continue,
        };
        let start = member.offset as usize;
        if let Some(slot) = data.get_mut(start..start + bytes.len()) {
            slot.copy_from_slice(&bytes);
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuCall, RecordingBackend};
    use crate::shader::{SamplerBinding, ShaderReflection, UniformMember};
    use std::path::PathBuf;

    fn block() -> UniformBlock {
        UniformBlock {
            instance: "global".into(),
            binding: 0,
            size: 96,
            members: vec![
                UniformMember { name: "MVP".into(), offset: 0, kind: UniformKind::Mat4 },
                UniformMember { name: "OutputSize".into(), offset: 64, kind: UniformKind::Vec4 },
                UniformMember { name: "FrameCount".into(), offset: 80, kind: UniformKind::UInt },
                UniformMember { name: "GLOW".into(), offset: 84, kind: UniformKind::Float },
            ],
        }
    }

    fn shader() -> Arc<CompiledShader> {
        Arc::new(CompiledShader {
            path: PathBuf::from("pass.slang"),
            vertex_source: String::new(),
            fragment_source: String::new(),
            parameters: Vec::new(),
            alias: None,
            reflection: ShaderReflection {
                uniform_blocks: vec![block()],
                samplers: vec![
                    SamplerBinding { name: "Source".into(), texture_binding: 1, sampler_binding: 2 },
                    SamplerBinding { name: "InfoCachePass".into(), texture_binding: 3, sampler_binding: 4 },
                ],
            },
        })
    }

    fn read_f32(data: &[u8], offset: usize) -> f32 {
        f32::from_ne_bytes(data[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn packs_members_at_reflected_offsets() {
        let mut values = UniformValues::new();
        values.insert("OutputSize".into(), UniformValue::Vec4([640.0, 480.0, 1.0 / 640.0, 1.0 / 480.0]));
        values.insert("FrameCount".into(), UniformValue::UInt(7));
        values.insert("GLOW".into(), UniformValue::Float(0.5));
        values.insert("NotInTheBlock".into(), UniformValue::Float(9.0));

        let data = pack_uniforms(&block(), &values);
        assert_eq!(data.len(), 96);
        assert_eq!(read_f32(&data, 64), 640.0);
        assert_eq!(read_f32(&data, 68), 480.0);
        assert_eq!(u32::from_ne_bytes(data[80..84].try_into().unwrap()), 7);
        assert_eq!(read_f32(&data, 84), 0.5);
        // MVP had no value.
        assert!(data[..64].iter().all(|b| *b == 0));
    }

    #[test]
    fn float_parameters_coerce_into_integer_members() {
        let mut values = UniformValues::new();
        values.insert("FrameCount".into(), UniformValue::Float(3.0));
        let data = pack_uniforms(&block(), &values);
        assert_eq!(u32::from_ne_bytes(data[80..84].try_into().unwrap()), 3);
    }

    #[test]
    fn unresolved_samplers_get_the_default_texture() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut executor = PassExecutor::new(Span::none());
        assert!(executor.compile_program(&mut backend, "pass_0", shader()));
        let source = backend.create_render_target("source", 8, 8).unwrap();

        let inputs = BTreeMap::from([("Source".to_string(), source)]);
        assert!(executor.execute_pass(
            &mut backend,
            "pass_0",
            &inputs,
            Surface::Screen,
            &UniformValues::new(),
            FilterMode::Linear,
        ));

        let draws = backend.pass_draws();
        let GpuCall::DrawPass { samplers, uniform_bytes, .. } = draws[0] else {
            panic!("expected a pass draw");
        };
        assert_eq!(samplers["Source"], source);
        assert_eq!(samplers["InfoCachePass"], backend.default_texture());
        assert_eq!(*uniform_bytes, 96);
    }

    #[test]
    fn failures_return_false_and_keep_the_error() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut executor = PassExecutor::new(Span::none());

        assert!(!executor.execute_pass(
            &mut backend,
            "missing",
            &BTreeMap::new(),
            Surface::Screen,
            &UniformValues::new(),
            FilterMode::Linear,
        ));
        assert!(executor.last_error().unwrap().contains("missing"));

        backend.reject_programs(true);
        assert!(!executor.compile_program(&mut backend, "pass_0", shader()));
        assert!(!executor.has_program("pass_0"));
    }

    #[test]
    fn recompiling_a_name_replaces_its_program() {
        let mut backend = RecordingBackend::new(64, 64);
        let mut executor = PassExecutor::new(Span::none());
        assert!(executor.compile_program(&mut backend, "pass_0", shader()));
        assert!(executor.compile_program(&mut backend, "pass_0", shader()));
        assert_eq!(executor.program_count(), 1);
        assert_eq!(backend.live_programs(), 1);

        executor.dispose(&mut backend);
        assert_eq!(backend.live_programs(), 0);
    }
}
