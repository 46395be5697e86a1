//! Translation of the retro dialect into WGSL through naga's GLSL front end.

use super::{
    CompiledShader, SamplerBinding, ShaderReflection, ShaderSource, SourceProvider, UniformBlock,
    UniformKind, UniformMember,
};
use crate::error::ShaderError;
use naga::front::glsl::{Frontend, Options};
use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::{Binding, Module, ScalarKind, ShaderStage, TypeInner, VectorSize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn, Span};

const SUPPORTED_FORMAT: &str = "R8G8B8A8_UNORM";

/// Compiles `.slang` files into [`CompiledShader`]s, caching by path.
pub struct ShaderCompiler {
    provider: Arc<dyn SourceProvider>,
    cache: HashMap<PathBuf, Arc<CompiledShader>>,
    span: Span,
}

impl ShaderCompiler {
    pub fn new(provider: Arc<dyn SourceProvider>, span: Span) -> Self {
        Self {
            provider,
            cache: HashMap::new(),
            span,
        }
    }

    pub fn provider(&self) -> &Arc<dyn SourceProvider> {
        &self.provider
    }

    /// Compile the shader at `path`, reusing an earlier result for the same file.
    pub fn compile(&mut self, path: &Path) -> Result<Arc<CompiledShader>, ShaderError> {
        let key = super::normalize_path(path);
        if let Some(shader) = self.cache.get(&key) {
            debug!(parent: &self.span, path = %key.display(), "shader cache hit");
            return Ok(shader.clone());
        }

        let source = ShaderSource::load(self.provider.as_ref(), &key)?;
        let shader = Arc::new(self.compile_source(&source)?);
        self.cache.insert(key, shader.clone());
        Ok(shader)
    }

    /// Compile an already preprocessed source without consulting the cache.
    pub fn compile_source(&self, source: &ShaderSource) -> Result<CompiledShader, ShaderError> {
        let start = std::time::Instant::now();

        if let Some(format) = source.format.as_deref().filter(|f| *f != SUPPORTED_FORMAT) {
            warn!(
                parent: &self.span,
                path = %source.path.display(),
                format,
                "ignoring render target format, intermediate targets are always {SUPPORTED_FORMAT}"
            );
        }

        let syntax = |message: String| ShaderError::Syntax {
            path: source.path.clone(),
            message,
        };

        let translated = translate(&source.body).map_err(syntax)?;
        let (vertex_glsl, fragment_glsl) = super::split_stages(&translated.text).map_err(syntax)?;

        let vertex = parse_stage(&vertex_glsl, ShaderStage::Vertex).map_err(syntax)?;
        let fragment = parse_stage(&fragment_glsl, ShaderStage::Fragment).map_err(syntax)?;

        let name = source
            .alias
            .clone()
            .unwrap_or_else(|| source.path.display().to_string());
        check_link(&vertex.module, &fragment.module).map_err(|message| ShaderError::Link {
            name: name.clone(),
            message,
        })?;

        let mut uniform_blocks = reflect_uniform_blocks(&vertex.module);
        for block in reflect_uniform_blocks(&fragment.module) {
            if !uniform_blocks.iter().any(|b| b.binding == block.binding) {
                uniform_blocks.push(block);
            }
        }
        uniform_blocks.sort_by_key(|b| b.binding);

        info!(
            parent: &self.span,
            shader = %name,
            parameters = source.parameters.len(),
            samplers = translated.samplers.len(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "compiled shader"
        );

        Ok(CompiledShader {
            path: source.path.clone(),
            vertex_source: vertex.wgsl,
            fragment_source: fragment.wgsl,
            parameters: source.parameters.clone(),
            alias: source.alias.clone(),
            reflection: ShaderReflection {
                uniform_blocks,
                samplers: translated.samplers,
            },
        })
    }
}

/// Dialect text rewritten into plain GLSL 450 resource declarations.
#[derive(Debug, Clone)]
pub(crate) struct Translation {
    pub text: String,
    pub samplers: Vec<SamplerBinding>,
}

/// Rebind uniform blocks and split combined samplers.
///
/// Bindings are handed out in order of appearance over the whole file, before
/// the stage split, so both stages agree on every slot.
pub(crate) fn translate(body: &str) -> Result<Translation, String> {
    let mut next_binding = 0u32;
    let mut samplers: Vec<SamplerBinding> = Vec::new();
    let mut lines: Vec<(String, bool)> = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("//") {
            lines.push((line.to_string(), true));
            continue;
        }
        let Some(uniform_at) = find_identifier(trimmed, "uniform") else {
            lines.push((line.to_string(), false));
            continue;
        };
        let qualifiers = trimmed[..uniform_at].trim();
        if !qualifiers.is_empty() && !qualifiers.starts_with("layout") {
            lines.push((line.to_string(), false));
            continue;
        }

        let rest = trimmed[uniform_at + "uniform".len()..].trim_start();
        if let Some(decl) = rest.strip_prefix("sampler2D") {
            let name: String = decl
                .trim_start()
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            if name.is_empty() {
                return Err(format!("sampler declaration without a name: {}", line.trim()));
            }
            if samplers.iter().any(|s| s.name == name) {
                return Err(format!("sampler {name} declared twice"));
            }
            let binding = SamplerBinding {
                name: name.clone(),
                texture_binding: next_binding,
                sampler_binding: next_binding + 1,
            };
            next_binding += 2;
            lines.push((
                format!(
                    "layout(set = 0, binding = {}) uniform texture2D {name};",
                    binding.texture_binding
                ),
                true,
            ));
            lines.push((
                format!(
                    "layout(set = 0, binding = {}) uniform sampler {name}_smp;",
                    binding.sampler_binding
                ),
                true,
            ));
            samplers.push(binding);
        } else {
            lines.push((
                format!("layout(std140, set = 0, binding = {next_binding}) uniform {rest}"),
                false,
            ));
            next_binding += 1;
        }
    }

    let mut text = String::with_capacity(body.len() + 256);
    for (line, verbatim) in lines {
        let mut line = line;
        if !verbatim {
            for sampler in &samplers {
                let combined = format!("sampler2D({0}, {0}_smp)", sampler.name);
                line = replace_identifier(&line, &sampler.name, &combined);
            }
        }
        text.push_str(&line);
        text.push('\n');
    }

    Ok(Translation { text, samplers })
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Byte offset of `word` in `line` as a standalone identifier.
fn find_identifier(line: &str, word: &str) -> Option<usize> {
    let mut search = 0;
    while let Some(found) = line[search..].find(word) {
        let start = search + found;
        let end = start + word.len();
        let before = line[..start].chars().next_back();
        let after = line[end..].chars().next();
        if !before.is_some_and(is_ident_char) && !after.is_some_and(is_ident_char) {
            return Some(start);
        }
        search = end;
    }
    None
}

/// Replace every standalone use of `ident` that is not a member access.
pub(crate) fn replace_identifier(line: &str, ident: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    let mut prev: Option<char> = None;

    while let Some(found) = rest.find(ident) {
        let before = rest[..found].chars().next_back().or(prev);
        let after = rest[found + ident.len()..].chars().next();
        let standalone = !before.is_some_and(|c| is_ident_char(c) || c == '.')
            && !after.is_some_and(is_ident_char);

        out.push_str(&rest[..found]);
        if standalone {
            out.push_str(replacement);
        } else {
            out.push_str(ident);
        }
        prev = ident.chars().next_back();
        rest = &rest[found + ident.len()..];
    }
    out.push_str(rest);
    out
}

struct StageOutput {
    module: Module,
    wgsl: String,
}

fn parse_stage(glsl: &str, stage: ShaderStage) -> Result<StageOutput, String> {
    let mut frontend = Frontend::default();
    let options = Options::from(stage);
    let module = frontend
        .parse(&options, glsl)
        .map_err(|e| format!("{stage:?} GLSL parse error: {e:?}"))?;

    let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
    let info = validator
        .validate(&module)
        .map_err(|e| format!("{stage:?} shader validation error: {e:?}"))?;
    let wgsl = naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())
        .map_err(|e| format!("{stage:?} WGSL generation error: {e:?}"))?;

    Ok(StageOutput { module, wgsl })
}

/// Component count and scalar kind of an interface variable.
fn io_shape(inner: &TypeInner) -> Option<(u8, ScalarKind)> {
    match *inner {
        TypeInner::Scalar(scalar) => Some((1, scalar.kind)),
        TypeInner::Vector { size, scalar } => Some((vector_len(size), scalar.kind)),
        _ => None,
    }
}

fn vector_len(size: VectorSize) -> u8 {
    match size {
        VectorSize::Bi => 2,
        VectorSize::Tri => 3,
        VectorSize::Quad => 4,
    }
}

fn entry_outputs(module: &Module) -> Vec<(u32, Option<(u8, ScalarKind)>)> {
    let mut out = Vec::new();
    let Some(entry) = module.entry_points.first() else {
        return out;
    };
    let Some(result) = &entry.function.result else {
        return out;
    };
    match (&result.binding, &module.types[result.ty].inner) {
        (Some(Binding::Location { location, .. }), inner) => out.push((*location, io_shape(inner))),
        (None, TypeInner::Struct { members, .. }) => {
            for member in members {
                if let Some(Binding::Location { location, .. }) = member.binding {
                    out.push((location, io_shape(&module.types[member.ty].inner)));
                }
            }
        }
        _ => {}
    }
    out
}

fn entry_inputs(module: &Module) -> Vec<(u32, Option<(u8, ScalarKind)>)> {
    let mut out = Vec::new();
    let Some(entry) = module.entry_points.first() else {
        return out;
    };
    for argument in &entry.function.arguments {
        match (&argument.binding, &module.types[argument.ty].inner) {
            (Some(Binding::Location { location, .. }), inner) => {
                out.push((*location, io_shape(inner)))
            }
            (None, TypeInner::Struct { members, .. }) => {
                for member in members {
                    if let Some(Binding::Location { location, .. }) = member.binding {
                        out.push((location, io_shape(&module.types[member.ty].inner)));
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Every fragment input location must be fed by a vertex output of the same shape.
fn check_link(vertex: &Module, fragment: &Module) -> Result<(), String> {
    let outputs = entry_outputs(vertex);
    for (location, shape) in entry_inputs(fragment) {
        match outputs.iter().find(|(l, _)| *l == location) {
            None => {
                return Err(format!(
                    "fragment input at location {location} is not written by the vertex stage"
                ))
            }
            Some((_, written)) if *written != shape => {
                return Err(format!(
                    "location {location} type mismatch: vertex writes {written:?}, fragment reads {shape:?}"
                ))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn uniform_kind(inner: &TypeInner) -> UniformKind {
    match *inner {
        TypeInner::Scalar(scalar) => match scalar.kind {
            ScalarKind::Float => UniformKind::Float,
            ScalarKind::Uint => UniformKind::UInt,
            ScalarKind::Sint => UniformKind::Int,
            _ => UniformKind::Other,
        },
        TypeInner::Vector { size, scalar } if scalar.kind == ScalarKind::Float => match size {
            VectorSize::Bi => UniformKind::Vec2,
            VectorSize::Tri => UniformKind::Vec3,
            VectorSize::Quad => UniformKind::Vec4,
        },
        TypeInner::Matrix {
            columns: VectorSize::Quad,
            rows: VectorSize::Quad,
            ..
        } => UniformKind::Mat4,
        _ => UniformKind::Other,
    }
}

fn reflect_uniform_blocks(module: &Module) -> Vec<UniformBlock> {
    let mut blocks = Vec::new();
    for (_, var) in module.global_variables.iter() {
        if var.space != naga::AddressSpace::Uniform {
            continue;
        }
        let Some(binding) = &var.binding else {
            continue;
        };
        let ty = &module.types[var.ty];
        let TypeInner::Struct { members, span } = &ty.inner else {
            continue;
        };

        let members = members
            .iter()
            .map(|m| UniformMember {
                name: m.name.clone().unwrap_or_default(),
                offset: m.offset,
                kind: uniform_kind(&module.types[m.ty].inner),
            })
            .collect();

        blocks.push(UniformBlock {
            instance: var
                .name
                .clone()
                .or_else(|| ty.name.clone())
                .unwrap_or_default(),
            binding: binding.binding,
            size: (*span).max(16),
            members,
        });
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::MemoryProvider;

    const STOCK: &str = include_str!("../../shaders/stock.slang");

    fn compiler_with(files: &[(&str, &str)]) -> ShaderCompiler {
        let mut provider = MemoryProvider::new();
        for (path, text) in files {
            provider.insert(*path, *text);
        }
        ShaderCompiler::new(Arc::new(provider), Span::none())
    }

    #[test]
    fn combined_samplers_are_split() {
        let body = "layout(set = 0, binding = 2) uniform sampler2D Source;\n\
                    vec4 c = texture(Source, uv) + texture(Source, uv * 0.5);\n\
                    float s = params.SourceSize.x;\n";
        let translated = translate(body).unwrap();

        assert_eq!(
            translated.samplers,
            vec![SamplerBinding {
                name: "Source".into(),
                texture_binding: 0,
                sampler_binding: 1
            }]
        );
        assert!(translated.text.contains("uniform texture2D Source;"));
        assert!(translated.text.contains("uniform sampler Source_smp;"));
        assert_eq!(
            translated.text.matches("sampler2D(Source, Source_smp)").count(),
            2
        );
        assert!(translated.text.contains("params.SourceSize.x"));
    }

    #[test]
    fn bindings_are_shared_across_stages() {
        let body = "layout(push_constant) uniform Push { vec4 SourceSize; } params;\n\
                    layout(std140, set = 0, binding = 0) uniform UBO { mat4 MVP; } global;\n\
                    #pragma stage vertex\n\
                    void main() {}\n\
                    #pragma stage fragment\n\
                    layout(set = 0, binding = 2) uniform sampler2D Source;\n\
                    layout(set = 0, binding = 3) uniform sampler2D Original;\n";
        let translated = translate(body).unwrap();

        assert!(translated
            .text
            .contains("layout(std140, set = 0, binding = 0) uniform Push"));
        assert!(translated
            .text
            .contains("layout(std140, set = 0, binding = 1) uniform UBO"));
        let original = translated.samplers.iter().find(|s| s.name == "Original").unwrap();
        assert_eq!((original.texture_binding, original.sampler_binding), (4, 5));
    }

    #[test]
    fn identifier_replacement_respects_boundaries() {
        assert_eq!(
            replace_identifier("Source + SourceSize + x.Source + Source", "Source", "S"),
            "S + SourceSize + x.Source + S"
        );
    }

    #[test]
    fn stock_shader_compiles_and_reflects() {
        let mut compiler = compiler_with(&[("shaders/stock.slang", STOCK)]);
        let shader = compiler.compile(Path::new("shaders/stock.slang")).unwrap();

        assert!(shader.vertex_source.contains("@vertex"));
        assert!(shader.fragment_source.contains("@fragment"));
        assert!(shader.reflection.has_uniform("MVP"));
        assert!(shader.reflection.has_uniform("SourceSize"));
        assert_eq!(shader.reflection.sampler_names().collect::<Vec<_>>(), ["Source"]);

        let mvp_block = shader
            .reflection
            .uniform_blocks
            .iter()
            .find(|b| b.members.iter().any(|m| m.name == "MVP"))
            .unwrap();
        assert!(mvp_block.size >= 64);
        assert_eq!(mvp_block.members[0].kind, UniformKind::Mat4);
    }

    #[test]
    fn compile_is_cached_by_path() {
        let mut compiler = compiler_with(&[("stock.slang", STOCK)]);
        let a = compiler.compile(Path::new("stock.slang")).unwrap();
        let b = compiler.compile(Path::new("./stock.slang")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn mismatched_interface_is_a_link_error() {
        let shader = r#"#version 450
#pragma stage vertex
layout(location = 0) in vec4 Position;
layout(location = 0) out vec2 vTexCoord;
void main() { gl_Position = Position; vTexCoord = Position.xy; }
#pragma stage fragment
layout(location = 1) in vec2 vOther;
layout(location = 0) out vec4 FragColor;
void main() { FragColor = vec4(vOther, 0.0, 1.0); }
"#;
        let mut compiler = compiler_with(&[("bad.slang", shader)]);
        assert!(matches!(
            compiler.compile(Path::new("bad.slang")),
            Err(ShaderError::Link { .. })
        ));
    }

    #[test]
    fn invalid_glsl_is_a_syntax_error() {
        let shader = "#version 450\n#pragma stage vertex\nvoid main() { nope }\n#pragma stage fragment\nvoid main() {}\n";
        let mut compiler = compiler_with(&[("broken.slang", shader)]);
        assert!(matches!(
            compiler.compile(Path::new("broken.slang")),
            Err(ShaderError::Syntax { .. })
        ));
    }

    #[test]
    fn bundled_crt_shaders_compile() {
        let mut provider = MemoryProvider::new();
        provider
            .insert("crt/include/common.inc", include_str!("../../shaders/crt/include/common.inc"))
            .insert("crt/derez.slang", include_str!("../../shaders/crt/derez.slang"))
            .insert("crt/cache-info.slang", include_str!("../../shaders/crt/cache-info.slang"))
            .insert("crt/crt-scanlines.slang", include_str!("../../shaders/crt/crt-scanlines.slang"))
            .insert("crt/bezel.slang", include_str!("../../shaders/crt/bezel.slang"));
        let mut compiler = ShaderCompiler::new(Arc::new(provider), Span::none());

        for path in [
            "crt/derez.slang",
            "crt/cache-info.slang",
            "crt/crt-scanlines.slang",
            "crt/bezel.slang",
        ] {
            let shader = compiler
                .compile(Path::new(path))
                .unwrap_or_else(|e| panic!("{path}: {e}"));
            assert!(shader.reflection.sampler("Source").is_some(), "{path}");
            assert!(!shader.parameters.is_empty(), "{path}");
        }

        let bezel = compiler.compile(Path::new("crt/bezel.slang")).unwrap();
        assert!(bezel.reflection.sampler("InfoCachePass").is_some());
        assert!(bezel.reflection.sampler("DerezedPass").is_some());
    }
}
