//! Scanline: retro shader presets over a GPU-backed Canvas2D surface.
//!
//! Game code draws through [`canvas::Canvas2D`]; the
//! [`orchestrator::PostProcessOrchestrator`] captures each frame and resolves it
//! through a multi-pass `.slangp` preset before presenting.

pub mod canvas;
pub mod config;
pub mod error;
pub mod gpu;
pub mod orchestrator;
pub mod render;
pub mod shader;
pub mod utils;
