//! Which earlier pass feeds which named sampler.
//!
//! Every pass gets `Source`, `Original`, `PassOutputJ` and the aliases of earlier
//! passes. Presets whose shaders sample anything else must match one of the
//! shapes listed here, which name the extra routes and the samplers left on the
//! default texture explicitly.

use crate::error::PipelineError;
use crate::shader::{CompiledShader, PresetConfig};
use std::path::Path;
use std::sync::Arc;

/// Feed the output of pass `source` into sampler `sampler` of pass `pass`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub pass: usize,
    pub sampler: &'static str,
    pub source: usize,
}

/// A preset layout recognized by the stems of its shader files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetShape {
    pub name: &'static str,
    /// One keyword per pass, matched against the shader file stem.
    pub stems: &'static [&'static str],
    pub routes: &'static [Route],
    /// `(pass, sampler)` pairs that stay on the default texture.
    pub unbound: &'static [(usize, &'static str)],
}

impl PresetShape {
    fn routes_or_leaves(&self, pass: usize, sampler: &str) -> bool {
        self.routes.iter().any(|r| r.pass == pass && r.sampler == sampler)
            || self.unbound.iter().any(|&(p, s)| p == pass && s == sampler)
    }

    fn matches(&self, preset: &PresetConfig) -> bool {
        self.stems.len() == preset.passes.len()
            && self.stems.iter().zip(&preset.passes).all(|(keyword, pass)| {
                pass.shader_path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|stem| stem.to_ascii_lowercase().contains(keyword))
            })
    }
}

pub const CRT_BEZEL_3: PresetShape = PresetShape {
    name: "crt-bezel-3",
    stems: &["derez", "crt", "bezel"],
    routes: &[Route { pass: 2, sampler: "DerezedPass", source: 0 }],
    // No cache pass in this layout.
    unbound: &[(1, "InfoCachePass"), (2, "InfoCachePass")],
};

pub const CRT_BEZEL_4: PresetShape = PresetShape {
    name: "crt-bezel-4",
    stems: &["derez", "cache-info", "crt", "bezel"],
    routes: &[
        Route { pass: 2, sampler: "InfoCachePass", source: 1 },
        Route { pass: 3, sampler: "InfoCachePass", source: 1 },
        Route { pass: 3, sampler: "DerezedPass", source: 0 },
    ],
    unbound: &[],
};

/// The resolved wiring for one loaded preset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassRouting {
    /// Matched shape, or `None` when default wiring covers every sampler.
    pub shape: Option<&'static str>,
    pub routes: Vec<Route>,
    /// Effective alias of each pass: the preset's `aliasN`, else the shader's `#pragma name`.
    pub aliases: Vec<Option<String>>,
}

impl PassRouting {
    /// Extra `(sampler, source pass)` inputs of pass `pass`.
    pub fn inputs_for(&self, pass: usize) -> Vec<(&'static str, usize)> {
        self.routes
            .iter()
            .filter(|r| r.pass == pass)
            .map(|r| (r.sampler, r.source))
            .collect()
    }

    pub fn alias_of(&self, pass: usize) -> Option<&str> {
        self.aliases.get(pass).and_then(|a| a.as_deref())
    }
}

/// Ordered list of known preset shapes.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    shapes: Vec<PresetShape>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new(vec![CRT_BEZEL_3, CRT_BEZEL_4])
    }
}

impl RoutingTable {
    pub fn new(shapes: Vec<PresetShape>) -> Self {
        Self { shapes }
    }

    pub fn shapes(&self) -> &[PresetShape] {
        &self.shapes
    }

    /// Resolve the wiring of `preset`, whose pass `i` was compiled into `shaders[i]`.
    pub fn resolve(
        &self,
        preset: &PresetConfig,
        shaders: &[Arc<CompiledShader>],
    ) -> Result<PassRouting, PipelineError> {
        let aliases: Vec<Option<String>> = preset
            .passes
            .iter()
            .zip(shaders)
            .map(|(pass, shader)| pass.alias.clone().or_else(|| shader.alias.clone()))
            .collect();

        let shape = self.shapes.iter().find(|s| s.matches(preset));
        if let Some(shape) = shape {
            for route in shape.routes {
                if route.source >= route.pass || route.pass >= preset.passes.len() {
                    return Err(unsupported(&preset.path, route.pass, route.sampler));
                }
            }
        }

        for (pass, shader) in shaders.iter().enumerate() {
            for sampler in shader.reflection.sampler_names() {
                let covered = default_wiring_covers(sampler, pass, &aliases)
                    || shape.is_some_and(|s| s.routes_or_leaves(pass, sampler));
                if !covered {
                    return Err(unsupported(&preset.path, pass, sampler));
                }
            }
        }
        Ok(PassRouting {
            shape: shape.map(|s| s.name),
            routes: shape.map_or_else(Vec::new, |s| s.routes.to_vec()),
            aliases,
        })
    }
}

fn default_wiring_covers(sampler: &str, pass: usize, aliases: &[Option<String>]) -> bool {
    if sampler == "Source" || sampler == "Original" {
        return true;
    }
    if let Some(j) = sampler
        .strip_prefix("PassOutput")
        .and_then(|j| j.parse::<usize>().ok())
    {
        return j < pass;
    }
    aliases[..pass.min(aliases.len())]
        .iter()
        .flatten()
        .any(|alias| alias == sampler)
}

fn unsupported(preset: &Path, pass: usize, sampler: &str) -> PipelineError {
    PipelineError::UnsupportedPresetShape {
        preset: preset.to_path_buf(),
        pass,
        sampler: sampler.to_string(),
    }
}
