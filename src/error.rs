//! Error taxonomy shared by the shader compiler, the pass pipeline and the
//! frame orchestrator.

use std::path::PathBuf;
use thiserror::Error;

/// Failures while loading, translating or linking a single shader file.
#[derive(Debug, Error)]
pub enum ShaderError {
    #[error("failed to load shader {path:?}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("include cycle: {}", format_chain(.chain))]
    IncludeCycle { chain: Vec<PathBuf> },

    #[error("shader syntax error in {path:?}: {message}")]
    Syntax { path: PathBuf, message: String },

    #[error("shader link error in {name}: {message}")]
    Link { name: String, message: String },
}

fn format_chain(chain: &[PathBuf]) -> String {
    chain
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Failures reported by a [`crate::gpu::GpuBackend`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GpuError {
    #[error("unknown GPU resource {0}")]
    UnknownResource(u64),

    #[error("invalid size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("framebuffer incomplete: {0}")]
    FramebufferIncomplete(String),

    #[error("program rejected: {0}")]
    ProgramRejected(String),

    #[error("surface unavailable: {0}")]
    SurfaceLost(String),

    #[error("injected failure on call {0}")]
    Injected(usize),

    #[error("{0}")]
    Backend(String),
}

/// Failures of the multi-pass pipeline, from preset load through per-frame execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Shader(#[from] ShaderError),

    #[error("failed to read preset {path:?}: {source}")]
    Preset {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("preset {path:?} has no usable passes")]
    EmptyPreset { path: PathBuf },

    #[error("unsupported preset shape {preset:?}: pass {pass} samples {sampler:?} which no routing rule provides")]
    UnsupportedPresetShape {
        preset: PathBuf,
        pass: usize,
        sampler: String,
    },

    #[error("framebuffer incomplete for {name} ({width}x{height}): {reason}")]
    FramebufferIncomplete {
        name: String,
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("pass {pass} failed: {message}")]
    PassExecution { pass: String, message: String },

    #[error("pipeline is not ready")]
    NotReady,

    #[error("pipeline has failed and will not run again")]
    Failed,
}

/// Misuse of the per-frame token protocol, or a failure while finishing a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("begin_frame called while frame {0} is still open")]
    FrameAlreadyOpen(u64),

    #[error("frame token {got} does not match the open frame {expected:?}")]
    TokenMismatch { expected: Option<u64>, got: u64 },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Gpu(#[from] GpuError),
}
