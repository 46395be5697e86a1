//! `.slangp` preset manifests.

use super::{normalize_path, SourceProvider};
use crate::error::PipelineError;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Texture filtering used when a pass samples its inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilterMode {
    #[default]
    Linear,
    Nearest,
}

/// How a pass derives its output size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleType {
    /// Multiple of the pass input size.
    Source,
    /// Multiple of the final viewport.
    Viewport,
    /// `scale` is a size in pixels.
    Absolute,
}

impl ScaleType {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "source" => Some(Self::Source),
            "viewport" => Some(Self::Viewport),
            "absolute" => Some(Self::Absolute),
            _ => None,
        }
    }
}

/// One pass of a preset. `shader_path` is relative to the preset directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderPassConfig {
    pub name: String,
    pub shader_path: PathBuf,
    pub filter: FilterMode,
    pub scale: Option<f32>,
    pub scale_type: Option<ScaleType>,
    pub alias: Option<String>,
    pub frame_count_mod: Option<u32>,
}

impl ShaderPassConfig {
    /// Output size of this pass given its input and the final viewport.
    pub fn output_size(&self, source: (u32, u32), viewport: (u32, u32)) -> (u32, u32) {
        let scale = self.scale.unwrap_or(1.0);
        let (w, h) = match self.scale_type.unwrap_or(ScaleType::Viewport) {
            ScaleType::Source => (source.0 as f32 * scale, source.1 as f32 * scale),
            ScaleType::Viewport => (viewport.0 as f32 * scale, viewport.1 as f32 * scale),
            ScaleType::Absolute => match self.scale {
                Some(px) => (px, px),
                None => (viewport.0 as f32, viewport.1 as f32),
            },
        };
        ((w.round() as u32).max(1), (h.round() as u32).max(1))
    }
}

/// A parsed preset: ordered passes plus preset-level parameter values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresetConfig {
    pub path: PathBuf,
    pub base_dir: PathBuf,
    pub passes: Vec<ShaderPassConfig>,
    pub parameters: BTreeMap<String, f32>,
}

impl PresetConfig {
    /// Shader path of `pass` resolved against the preset directory.
    pub fn resolve(&self, pass: &ShaderPassConfig) -> PathBuf {
        normalize_path(&self.base_dir.join(&pass.shader_path))
    }
}

pub struct PresetParser;

impl PresetParser {
    /// Parse preset text. Unknown keys are ignored and missing `shaderN` entries skipped.
    pub fn parse(text: &str, preset_path: &Path) -> PresetConfig {
        let entries: HashMap<String, String> = text.lines().filter_map(parse_line).collect();
        let get = |key: &str| entries.get(key).map(String::as_str);

        let count = get("shaders")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);

        // Walk the `shaderN` keys that exist rather than trusting `count` for allocation.
        let mut indices: Vec<usize> = entries
            .keys()
            .filter_map(|key| key.strip_prefix("shader")?.parse::<usize>().ok())
            .filter(|i| *i < count)
            .collect();
        indices.sort_unstable();

        let mut passes = Vec::with_capacity(indices.len());
        for i in indices {
            let Some(shader) = get(&format!("shader{i}")).filter(|s| !s.is_empty()) else {
                continue;
            };
            let filter = match get(&format!("filter_linear{i}")).and_then(parse_bool) {
                Some(false) => FilterMode::Nearest,
                _ => FilterMode::Linear,
            };
            let scale_type = get(&format!("scale_type{i}"))
                .or_else(|| get(&format!("scale_type_x{i}")))
                .and_then(ScaleType::parse);
            let scale = get(&format!("scale{i}"))
                .or_else(|| get(&format!("scale_x{i}")))
                .and_then(|v| v.parse::<f32>().ok());
            let alias = get(&format!("alias{i}"))
                .filter(|a| !a.is_empty())
                .map(str::to_string);
            let frame_count_mod = get(&format!("frame_count_mod{i}"))
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|m| *m > 0);

            passes.push(ShaderPassConfig {
                name: format!("pass_{i}"),
                shader_path: PathBuf::from(shader),
                filter,
                scale,
                scale_type,
                alias,
                frame_count_mod,
            });
        }

        let mut parameters = BTreeMap::new();
        if let Some(list) = get("parameters") {
            for name in list.split(';').map(str::trim).filter(|n| !n.is_empty()) {
                if let Some(value) = get(name).and_then(|v| v.parse::<f32>().ok()) {
                    parameters.insert(name.to_string(), value);
                }
            }
        }

        PresetConfig {
            path: preset_path.to_path_buf(),
            base_dir: preset_path.parent().map(Path::to_path_buf).unwrap_or_default(),
            passes,
            parameters,
        }
    }

    /// Read and parse a preset, rejecting one with no passes.
    pub fn load(provider: &dyn SourceProvider, path: &Path) -> Result<PresetConfig, PipelineError> {
        let text = provider.read(path).map_err(|source| PipelineError::Preset {
            path: path.to_path_buf(),
            source,
        })?;
        let preset = Self::parse(&text, path);
        if preset.passes.is_empty() {
            return Err(PipelineError::EmptyPreset {
                path: path.to_path_buf(),
            });
        }
        Ok(preset)
    }
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let line = strip_comment(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Some((key.to_string(), value.trim().to_string()))
}

/// Drop `#` and `//` comments that are not inside quotes.
fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    let bytes = line.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b'#' if !in_quotes => return &line[..i],
            b'/' if !in_quotes && bytes.get(i + 1) == Some(&b'/') => return &line[..i],
            _ => {}
        }
    }
    line
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}
