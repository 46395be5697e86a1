//! The multi-pass preset pipeline and its background loader.

use super::executor::{size_uniform, PassExecutor, UniformValue, UniformValues};
use super::routing::{PassRouting, RoutingTable};
use super::targets::RenderTargetManager;
use crate::error::{PipelineError, ShaderError};
use crate::gpu::{GpuBackend, Surface, TextureId, QUAD_MVP};
use crate::shader::{CompiledShader, PresetConfig, PresetParser, ShaderCompiler, SourceProvider};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn, Span};

/// Lifecycle of one pipeline instance. `Failed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Unloaded,
    Loading,
    Ready,
    Rendering,
    Failed,
}

/// CPU side of a preset load: the parsed manifest and one compiled shader per pass.
struct LoadedPreset {
    preset: PresetConfig,
    shaders: Vec<Arc<CompiledShader>>,
}

struct LoadMessage {
    generation: u64,
    result: Result<LoadedPreset, PipelineError>,
}

/// Runs a preset's passes in order, each into its own target and the last onto the screen.
pub struct MultiPassPipeline {
    provider: Arc<dyn SourceProvider>,
    routing_table: RoutingTable,
    executor: PassExecutor,
    targets: RenderTargetManager,
    state: PipelineState,
    generation: u64,
    sender: Sender<LoadMessage>,
    receiver: Receiver<LoadMessage>,
    preset: Option<PresetConfig>,
    shaders: Vec<Arc<CompiledShader>>,
    routing: Option<PassRouting>,
    parameters: BTreeMap<String, f32>,
    overrides: BTreeMap<String, f32>,
    viewport: (u32, u32),
    source_size: (u32, u32),
    frame_count: u64,
    span: Span,
}

impl MultiPassPipeline {
    pub fn new(provider: Arc<dyn SourceProvider>, viewport: (u32, u32), span: Span) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            provider,
            routing_table: RoutingTable::default(),
            executor: PassExecutor::new(span.clone()),
            targets: RenderTargetManager::new(span.clone()),
            state: PipelineState::Unloaded,
            generation: 0,
            sender,
            receiver,
            preset: None,
            shaders: Vec::new(),
            routing: None,
            parameters: BTreeMap::new(),
            overrides: BTreeMap::new(),
            viewport: (viewport.0.max(1), viewport.1.max(1)),
            source_size: (viewport.0.max(1), viewport.1.max(1)),
            frame_count: 0,
            span,
        }
    }

    pub fn with_routing_table(mut self, routing_table: RoutingTable) -> Self {
        self.routing_table = routing_table;
        self
    }

    /// Start loading `path` on a background thread.
    ///
    /// Releases everything the current preset holds first. A load still in flight
    /// is superseded and its result is dropped when it arrives. Returns `false`
    /// once the pipeline has failed.
    pub fn load_preset(&mut self, backend: &mut dyn GpuBackend, path: &Path) -> bool {
        if self.state == PipelineState::Failed {
            warn!(parent: &self.span, "Refusing to load {:?}, pipeline has failed", path);
            return false;
        }
        self.dispose(backend);
        self.state = PipelineState::Loading;
        let generation = self.generation;

        let provider = self.provider.clone();
        let sender = self.sender.clone();
        let span = self.span.clone();
        let path = path.to_path_buf();
        info!(parent: &self.span, "Loading preset {:?} (generation {})", path, generation);

        let spawned = std::thread::Builder::new()
            .name("preset-loader".into())
            .spawn(move || {
                let result = read_preset(provider, &path, span);
                // The pipeline may have been dropped meanwhile.
                let _ = sender.send(LoadMessage { generation, result });
            });
        if let Err(e) = spawned {
            error!(parent: &self.span, "Failed to spawn preset loader: {}", e);
            self.state = PipelineState::Failed;
            return false;
        }
        true
    }

    /// Load `path` on the calling thread.
    pub fn load_preset_blocking(&mut self, backend: &mut dyn GpuBackend, path: &Path) -> Result<(), PipelineError> {
        if self.state == PipelineState::Failed {
            return Err(PipelineError::Failed);
        }
        self.dispose(backend);
        self.state = PipelineState::Loading;
        let result = read_preset(self.provider.clone(), path, self.span.clone());
        self.finish_load(backend, result)
    }

    /// Apply a finished background load, if one arrived for the current generation.
    ///
    /// Call once per frame on the thread that owns the backend.
    pub fn poll(&mut self, backend: &mut dyn GpuBackend) -> Option<Result<(), PipelineError>> {
        let mut outcome = None;
        while let Ok(message) = self.receiver.try_recv() {
            if message.generation != self.generation || self.state != PipelineState::Loading {
                debug!(parent: &self.span, "Dropping stale preset load (generation {})", message.generation);
                continue;
            }
            outcome = Some(self.finish_load(backend, message.result));
        }
        outcome
    }

    fn finish_load(
        &mut self,
        backend: &mut dyn GpuBackend,
        result: Result<LoadedPreset, PipelineError>,
    ) -> Result<(), PipelineError> {
        let outcome = result.and_then(|loaded| self.install(backend, loaded));
        if let Err(e) = &outcome {
            error!(parent: &self.span, "Preset load failed: {}", e);
            self.release(backend);
            self.state = PipelineState::Failed;
        }
        outcome
    }

    fn install(&mut self, backend: &mut dyn GpuBackend, loaded: LoadedPreset) -> Result<(), PipelineError> {
        let start = Instant::now();
        let LoadedPreset { preset, shaders } = loaded;
        let routing = self.routing_table.resolve(&preset, &shaders)?;

        for (pass, shader) in preset.passes.iter().zip(&shaders) {
            if !self.executor.compile_program(backend, &pass.name, shader.clone()) {
                return Err(ShaderError::Link {
                    name: pass.name.clone(),
                    message: self.executor.last_error().unwrap_or("program rejected").to_string(),
                }
                .into());
            }
        }

        let mut parameters = BTreeMap::new();
        for shader in &shaders {
            for parameter in &shader.parameters {
                parameters.entry(parameter.name.clone()).or_insert(parameter.default);
            }
        }
        parameters.extend(preset.parameters.iter().map(|(k, v)| (k.clone(), *v)));
        parameters.extend(self.overrides.iter().map(|(k, v)| (k.clone(), *v)));

        self.preset = Some(preset);
        self.shaders = shaders;
        self.routing = Some(routing);
        self.parameters = parameters;
        self.frame_count = 0;
        self.allocate_targets(backend)?;

        self.state = PipelineState::Ready;
        info!(
            parent: &self.span,
            "Preset ready: {} passes, {} targets, shape {:?} ({:?})",
            self.pass_count(),
            self.target_count(),
            self.routing.as_ref().and_then(|r| r.shape),
            start.elapsed()
        );
        Ok(())
    }

    /// Output size of every pass for the current source and viewport. The last pass is the viewport.
    fn pass_sizes(&self) -> Vec<(u32, u32)> {
        let Some(preset) = &self.preset else {
            return Vec::new();
        };
        let mut input = self.source_size;
        let last = preset.passes.len().saturating_sub(1);
        preset
            .passes
            .iter()
            .enumerate()
            .map(|(i, pass)| {
                let size = if i == last {
                    self.viewport
                } else {
                    pass.output_size(input, self.viewport)
                };
                input = size;
                size
            })
            .collect()
    }

    fn allocate_targets(&mut self, backend: &mut dyn GpuBackend) -> Result<(), PipelineError> {
        let Some(preset) = &self.preset else {
            return Ok(());
        };
        let names: Vec<String> = preset.passes.iter().map(|p| p.name.clone()).collect();
        let sizes = self.pass_sizes();
        for (name, (width, height)) in names.iter().zip(sizes).take(names.len().saturating_sub(1)) {
            self.targets.resize(backend, name, width, height)?;
        }
        Ok(())
    }

    /// Run every pass over `source`. The last pass draws to the screen.
    ///
    /// A failed pass aborts the frame and leaves the pipeline `Failed`.
    pub fn render(
        &mut self,
        backend: &mut dyn GpuBackend,
        source: TextureId,
        source_size: (u32, u32),
    ) -> Result<(), PipelineError> {
        match self.state {
            PipelineState::Ready => {}
            PipelineState::Failed => return Err(PipelineError::Failed),
            _ => return Err(PipelineError::NotReady),
        }
        self.state = PipelineState::Rendering;
        let start = Instant::now();

        let source_size = (source_size.0.max(1), source_size.1.max(1));
        if source_size != self.source_size {
            self.source_size = source_size;
            if let Err(e) = self.allocate_targets(backend) {
                self.state = PipelineState::Failed;
                return Err(e);
            }
        }

        if let Err(e) = self.run_passes(backend, source) {
            error!(parent: &self.span, "Frame {} aborted: {}", self.frame_count, e);
            self.state = PipelineState::Failed;
            return Err(e);
        }

        self.frame_count += 1;
        self.state = PipelineState::Ready;
        debug!(parent: &self.span, "[Perf] Pipeline render: {:?}", start.elapsed());
        Ok(())
    }

    fn run_passes(&mut self, backend: &mut dyn GpuBackend, source: TextureId) -> Result<(), PipelineError> {
        let (Some(preset), Some(routing)) = (&self.preset, &self.routing) else {
            return Err(PipelineError::NotReady);
        };
        let sizes = self.pass_sizes();
        let last = preset.passes.len() - 1;

        let mut base = UniformValues::new();
        base.insert("MVP".into(), UniformValue::Mat4(QUAD_MVP));
        base.insert("OriginalSize".into(), size_uniform(self.source_size));
        base.insert("FinalViewportSize".into(), size_uniform(self.viewport));
        base.insert("FrameDirection".into(), UniformValue::UInt(1));
        for (name, value) in &self.parameters {
            base.insert(name.clone(), UniformValue::Float(*value));
        }

        // Output of each finished pass.
        let mut outputs: Vec<(TextureId, (u32, u32))> = Vec::with_capacity(preset.passes.len());

        for (i, pass) in preset.passes.iter().enumerate() {
            let (input, input_size) = match outputs.last() {
                Some(&(texture, size)) => (texture, size),
                None => (source, self.source_size),
            };

            let mut inputs = BTreeMap::new();
            inputs.insert("Source".to_string(), input);
            inputs.insert("Original".to_string(), source);
            let mut uniforms = base.clone();
            for (j, &(texture, size)) in outputs.iter().enumerate() {
                inputs.insert(format!("PassOutput{j}"), texture);
                uniforms.insert(format!("PassOutputSize{j}"), size_uniform(size));
                if let Some(alias) = routing.alias_of(j) {
                    inputs.insert(alias.to_string(), texture);
                    uniforms.insert(format!("{alias}Size"), size_uniform(size));
                }
            }
            for (sampler, from) in routing.inputs_for(i) {
                if let Some(&(texture, size)) = outputs.get(from) {
                    inputs.insert(sampler.to_string(), texture);
                    uniforms.insert(format!("{sampler}Size"), size_uniform(size));
                }
            }

            let frame_count = match pass.frame_count_mod {
                Some(m) => self.frame_count % u64::from(m),
                None => self.frame_count,
            };
            uniforms.insert("FrameCount".into(), UniformValue::UInt(frame_count as u32));
            uniforms.insert("SourceSize".into(), size_uniform(input_size));
            uniforms.insert("OutputSize".into(), size_uniform(sizes[i]));

            let output = if i == last {
                Surface::Screen
            } else {
                let target = self.targets.get(&pass.name).ok_or_else(|| PipelineError::PassExecution {
                    pass: pass.name.clone(),
                    message: "render target missing".into(),
                })?;
                Surface::Texture(target.texture)
            };

            if !self
                .executor
                .execute_pass(backend, &pass.name, &inputs, output, &uniforms, pass.filter)
            {
                return Err(PipelineError::PassExecution {
                    pass: pass.name.clone(),
                    message: self.executor.last_error().unwrap_or("draw failed").to_string(),
                });
            }

            if let Surface::Texture(texture) = output {
                outputs.push((texture, sizes[i]));
            }
        }
        Ok(())
    }

    /// Track a new viewport, reallocating viewport-relative targets.
    pub fn resize(&mut self, backend: &mut dyn GpuBackend, width: u32, height: u32) -> Result<(), PipelineError> {
        self.viewport = (width.max(1), height.max(1));
        if self.state != PipelineState::Ready {
            return Ok(());
        }
        if let Err(e) = self.allocate_targets(backend) {
            self.state = PipelineState::Failed;
            return Err(e);
        }
        Ok(())
    }

    /// Release every program and target and cancel any load in flight.
    pub fn dispose(&mut self, backend: &mut dyn GpuBackend) {
        self.release(backend);
        self.generation += 1;
        if self.state != PipelineState::Failed {
            self.state = PipelineState::Unloaded;
        }
    }

    fn release(&mut self, backend: &mut dyn GpuBackend) {
        self.executor.dispose(backend);
        self.targets.dispose_all(backend);
        self.preset = None;
        self.shaders.clear();
        self.routing = None;
    }

    /// Override a parameter for this and every later preset load.
    pub fn set_parameter(&mut self, name: &str, value: f32) {
        self.overrides.insert(name.to_string(), value);
        self.parameters.insert(name.to_string(), value);
    }

    pub fn parameters(&self) -> &BTreeMap<String, f32> {
        &self.parameters
    }

    pub fn overrides(&self) -> &BTreeMap<String, f32> {
        &self.overrides
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == PipelineState::Ready
    }

    pub fn pass_count(&self) -> usize {
        self.preset.as_ref().map_or(0, |p| p.passes.len())
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn routing(&self) -> Option<&PassRouting> {
        self.routing.as_ref()
    }

    pub fn preset_path(&self) -> Option<&Path> {
        self.preset.as_ref().map(|p| p.path.as_path())
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

/// Parse the preset and compile each pass. Touches no GPU state.
fn read_preset(provider: Arc<dyn SourceProvider>, path: &Path, span: Span) -> Result<LoadedPreset, PipelineError> {
    let preset = PresetParser::load(provider.as_ref(), path)?;
    let mut compiler = ShaderCompiler::new(provider, span);
    let shaders = preset
        .passes
        .iter()
        .map(|pass| compiler.compile(&preset.resolve(pass)))
        .collect::<Result<Vec<_>, ShaderError>>()?;
    Ok(LoadedPreset { preset, shaders })
}

impl std::fmt::Debug for MultiPassPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiPassPipeline")
            .field("state", &self.state)
            .field("preset", &self.preset_path())
            .field("passes", &self.pass_count())
            .field("targets", &self.target_count())
            .finish()
    }
}
