//! Multi-pass execution: render targets, pass drawing, routing and the pipeline itself.

mod executor;
mod pipeline;
pub mod routing;
mod targets;

pub use executor::{pack_uniforms, size_uniform, PassExecutor, UniformValue, UniformValues};
pub use pipeline::{MultiPassPipeline, PipelineState};
pub use routing::{PassRouting, PresetShape, Route, RoutingTable};
pub use targets::{RenderTarget, RenderTargetManager};

/// The bundled shader tree under `shaders/`, served from memory.
#[cfg(test)]
pub(crate) fn bundled_shaders() -> crate::shader::MemoryProvider {
    let mut provider = crate::shader::MemoryProvider::new();
    provider
        .insert("shaders/stock.slang", include_str!("../../shaders/stock.slang"))
        .insert("shaders/crt-bezel-3.slangp", include_str!("../../shaders/crt-bezel-3.slangp"))
        .insert("shaders/crt-bezel-4.slangp", include_str!("../../shaders/crt-bezel-4.slangp"))
        .insert("shaders/crt-lite.slangp", include_str!("../../shaders/crt-lite.slangp"))
        .insert("shaders/crt/derez.slang", include_str!("../../shaders/crt/derez.slang"))
        .insert("shaders/crt/cache-info.slang", include_str!("../../shaders/crt/cache-info.slang"))
        .insert("shaders/crt/crt-scanlines.slang", include_str!("../../shaders/crt/crt-scanlines.slang"))
        .insert("shaders/crt/bezel.slang", include_str!("../../shaders/crt/bezel.slang"))
        .insert("shaders/crt/include/common.inc", include_str!("../../shaders/crt/include/common.inc"));
    provider
}
