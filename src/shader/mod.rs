//! Retro shader front end: source loading, dialect translation and preset parsing.

mod compiler;
mod preset;
mod source;

pub use compiler::ShaderCompiler;
pub use preset::{FilterMode, PresetConfig, PresetParser, ScaleType, ShaderPassConfig};
pub use source::{split_stages, ShaderSource};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where shader and preset text comes from.
///
/// The pipeline loads presets off the render thread, so providers must be shareable.
pub trait SourceProvider: Send + Sync {
    /// Read the full text at `path`.
    fn read(&self, path: &Path) -> std::io::Result<String>;
}

/// Reads shader text from the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProvider;

impl SourceProvider for FsProvider {
    fn read(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }
}

/// In-memory sources keyed by path. Used for the bundled stock shader.
#[derive(Debug, Default, Clone)]
pub struct MemoryProvider {
    files: HashMap<PathBuf, String>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `text` under `path`, replacing any previous entry.
    pub fn insert(&mut self, path: impl Into<PathBuf>, text: impl Into<String>) -> &mut Self {
        self.files.insert(normalize_path(&path.into()), text.into());
        self
    }
}

impl SourceProvider for MemoryProvider {
    fn read(&self, path: &Path) -> std::io::Result<String> {
        self.files.get(&normalize_path(path)).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("{} not found", path.display()))
        })
    }
}

/// Lexically collapse `.` and `..` components without touching the filesystem.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // `/..` is `/`.
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// A tunable declared with `#pragma parameter`.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderParameter {
    pub name: String,
    pub description: String,
    pub default: f32,
    pub min: f32,
    pub max: f32,
    pub step: f32,
}

/// Scalar shape of a reflected uniform member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformKind {
    Float,
    UInt,
    Int,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
    Other,
}

/// One member of a reflected uniform block.
#[derive(Debug, Clone, PartialEq)]
pub struct UniformMember {
    pub name: String,
    pub offset: u32,
    pub kind: UniformKind,
}

/// A std140 uniform block and where it is bound.
#[derive(Debug, Clone, PartialEq)]
pub struct UniformBlock {
    pub instance: String,
    pub binding: u32,
    pub size: u32,
    pub members: Vec<UniformMember>,
}

/// A sampled texture split into its texture and sampler bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerBinding {
    pub name: String,
    pub texture_binding: u32,
    pub sampler_binding: u32,
}

/// Resource interface of a compiled program, shared by both stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShaderReflection {
    pub uniform_blocks: Vec<UniformBlock>,
    pub samplers: Vec<SamplerBinding>,
}

impl ShaderReflection {
    pub fn sampler(&self, name: &str) -> Option<&SamplerBinding> {
        self.samplers.iter().find(|s| s.name == name)
    }

    pub fn sampler_names(&self) -> impl Iterator<Item = &str> {
        self.samplers.iter().map(|s| s.name.as_str())
    }

    /// Whether any uniform block has a member called `name`.
    pub fn has_uniform(&self, name: &str) -> bool {
        self.uniform_blocks
            .iter()
            .any(|b| b.members.iter().any(|m| m.name == name))
    }
}

/// Translated program: WGSL for both stages plus the extracted metadata.
#[derive(Debug, Clone)]
pub struct CompiledShader {
    pub path: PathBuf,
    pub vertex_source: String,
    pub fragment_source: String,
    pub parameters: Vec<ShaderParameter>,
    pub alias: Option<String>,
    pub reflection: ShaderReflection,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_parent_components() {
        assert_eq!(normalize_path(Path::new("a/b/../c/./d.inc")), PathBuf::from("a/c/d.inc"));
        assert_eq!(normalize_path(Path::new("../x.slang")), PathBuf::from("../x.slang"));
    }

    #[test]
    fn normalize_keeps_leading_parent_steps() {
        assert_eq!(normalize_path(Path::new("../../x.slang")), PathBuf::from("../../x.slang"));
        assert_eq!(
            normalize_path(&Path::new("../presets").join("../../shaders/x.slang")),
            PathBuf::from("../../shaders/x.slang")
        );
        assert_eq!(normalize_path(Path::new("a/../../b")), PathBuf::from("../b"));
        assert_eq!(normalize_path(Path::new("/../etc")), PathBuf::from("/etc"));
    }

    #[test]
    fn memory_provider_matches_normalized_paths() {
        let mut provider = MemoryProvider::new();
        provider.insert("shaders/crt/../stock.slang", "#version 450");
        assert_eq!(provider.read(Path::new("shaders/stock.slang")).unwrap(), "#version 450");
        assert!(provider.read(Path::new("missing.slang")).is_err());
    }
}
