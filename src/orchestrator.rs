//! Frame orchestration: capture the canvas, run the preset chain, present.

use crate::canvas::{Canvas2D, CanvasRenderer, DrawCommand};
use crate::error::{FrameError, PipelineError};
use crate::gpu::{GpuBackend, Surface, QUAD_MVP};
use crate::render::{size_uniform, MultiPassPipeline, PassExecutor, RenderTargetManager, UniformValue, UniformValues};
use crate::shader::{FilterMode, MemoryProvider, ShaderCompiler, SourceProvider};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn, Span};

const CAPTURE_TARGET: &str = "capture";
const PASSTHROUGH: &str = "stock";
const PASSTHROUGH_PATH: &str = "shaders/stock.slang";
const BLACK: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// What a capture frame shows while the preset chain is not ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    /// The capture drawn through the stock shader.
    #[default]
    Passthrough,
    /// A black frame.
    Blank,
}

/// Where a frame's canvas draws land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRoute {
    /// Into the capture target, resolved by the pipeline in `end_frame`.
    Capture,
    /// Straight onto the screen.
    Direct,
}

/// Proof of an open frame. Consumed by [`PostProcessOrchestrator::end_frame`].
#[derive(Debug, PartialEq, Eq)]
pub struct FrameToken {
    id: u64,
    route: FrameRoute,
}

impl FrameToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn route(&self) -> FrameRoute {
        self.route
    }
}

/// Owns the backend and decides, frame by frame, whether the canvas goes
/// through the preset chain, through the passthrough, or straight to the screen.
///
/// Any pipeline error sets `shaders_failed` for the lifetime of the instance.
pub struct PostProcessOrchestrator<B: GpuBackend> {
    backend: B,
    provider: Arc<dyn SourceProvider>,
    pipeline: MultiPassPipeline,
    captures: RenderTargetManager,
    canvas_renderer: CanvasRenderer,
    passthrough: PassExecutor,
    passthrough_ready: bool,
    fallback: FallbackMode,
    shaders_enabled: bool,
    shaders_failed: bool,
    pipeline_ready: bool,
    open_frame: Option<u64>,
    next_frame: u64,
    span: Span,
}

impl<B: GpuBackend> PostProcessOrchestrator<B> {
    pub fn new(mut backend: B, provider: Arc<dyn SourceProvider>, span: Span) -> Self {
        let viewport = backend.surface_size();
        let pipeline = MultiPassPipeline::new(provider.clone(), viewport, span.clone());
        let mut passthrough = PassExecutor::new(span.clone());
        let passthrough_ready = compile_passthrough(&mut backend, &mut passthrough, &span);

        Self {
            backend,
            provider,
            pipeline,
            captures: RenderTargetManager::new(span.clone()),
            canvas_renderer: CanvasRenderer::new(span.clone()),
            passthrough,
            passthrough_ready,
            fallback: FallbackMode::default(),
            shaders_enabled: true,
            shaders_failed: false,
            pipeline_ready: false,
            open_frame: None,
            next_frame: 0,
            span,
        }
    }

    pub fn with_fallback(mut self, fallback: FallbackMode) -> Self {
        self.set_fallback(fallback);
        self
    }

    pub fn set_fallback(&mut self, fallback: FallbackMode) {
        self.fallback = fallback;
    }

    /// Start loading a preset into a fresh pipeline, releasing the current one.
    ///
    /// Frames keep flowing through the fallback until the load lands.
    pub fn load_preset(&mut self, path: &Path) -> bool {
        if self.shaders_failed {
            warn!(parent: &self.span, "Shaders have failed, not loading {:?}", path);
            return false;
        }
        self.pipeline.dispose(&mut self.backend);
        let mut pipeline = MultiPassPipeline::new(self.provider.clone(), self.backend.surface_size(), self.span.clone());
        for (name, value) in self.pipeline.overrides() {
            pipeline.set_parameter(name, *value);
        }
        self.pipeline = pipeline;
        self.pipeline_ready = false;
        self.pipeline.load_preset(&mut self.backend, path)
    }

    /// Override a preset parameter. Survives later preset loads.
    pub fn set_parameter(&mut self, name: &str, value: f32) {
        self.pipeline.set_parameter(name, value);
    }

    pub fn set_shaders_enabled(&mut self, enabled: bool) {
        if enabled != self.shaders_enabled {
            info!(parent: &self.span, "Shaders {}", if enabled { "enabled" } else { "disabled" });
        }
        self.shaders_enabled = enabled;
    }

    pub fn shaders_enabled(&self) -> bool {
        self.shaders_enabled
    }

    pub fn shaders_failed(&self) -> bool {
        self.shaders_failed
    }

    pub fn pipeline_ready(&self) -> bool {
        self.pipeline_ready
    }

    pub fn are_shaders_active(&self) -> bool {
        self.shaders_enabled && self.pipeline_ready && !self.shaders_failed
    }

    pub fn fallback(&self) -> FallbackMode {
        self.fallback
    }

    pub fn pipeline(&self) -> &MultiPassPipeline {
        &self.pipeline
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn poll_pipeline(&mut self) {
        match self.pipeline.poll(&mut self.backend) {
            Some(Ok(())) => {
                info!(parent: &self.span, "Shader pipeline ready");
                self.pipeline_ready = true;
            }
            Some(Err(e)) => {
                error!(parent: &self.span, "Shader pipeline failed to load: {}", e);
                self.fail_shaders();
            }
            None => {}
        }
    }

    fn fail_shaders(&mut self) {
        self.shaders_failed = true;
        self.pipeline_ready = false;
        warn!(parent: &self.span, "Shaders disabled for this session, presenting directly");
    }

    /// Open a frame. Canvas draws made before the matching `end_frame` land on
    /// the capture target when shaders are enabled and have not failed.
    pub fn begin_frame(&mut self) -> Result<FrameToken, FrameError> {
        if let Some(open) = self.open_frame {
            return Err(FrameError::FrameAlreadyOpen(open));
        }
        self.poll_pipeline();

        let route = if self.shaders_enabled && !self.shaders_failed {
            match self.ensure_capture() {
                Ok(()) => FrameRoute::Capture,
                Err(e) => {
                    error!(parent: &self.span, "Capture target unavailable: {}", e);
                    self.fail_shaders();
                    FrameRoute::Direct
                }
            }
        } else {
            FrameRoute::Direct
        };

        self.next_frame += 1;
        self.open_frame = Some(self.next_frame);
        Ok(FrameToken {
            id: self.next_frame,
            route,
        })
    }

    fn ensure_capture(&mut self) -> Result<(), PipelineError> {
        let (width, height) = self.backend.surface_size();
        self.captures.resize(&mut self.backend, CAPTURE_TARGET, width, height)?;
        Ok(())
    }

    /// Close the frame opened by `token`: draw the canvas batch and present.
    ///
    /// A pipeline error disables shaders for good, drops the frame and is returned.
    pub fn end_frame(&mut self, token: FrameToken, canvas: &mut Canvas2D) -> Result<(), FrameError> {
        if self.open_frame != Some(token.id) {
            return Err(FrameError::TokenMismatch {
                expected: self.open_frame,
                got: token.id,
            });
        }
        self.open_frame = None;

        let start = Instant::now();
        let commands = canvas.take_commands();
        let canvas_size = (canvas.width(), canvas.height());
        let result = match token.route {
            FrameRoute::Direct => self.present_direct(&commands, canvas_size),
            FrameRoute::Capture => self.present_capture(&commands, canvas_size),
        };
        match &result {
            Ok(()) => debug!(parent: &self.span, "[Perf] Frame {}: {:?}", token.id, start.elapsed()),
            Err(e) => {
                error!(parent: &self.span, "Frame {} dropped: {}", token.id, e);
                self.backend.discard_frame();
            }
        }
        result
    }

    fn present_direct(&mut self, commands: &[DrawCommand], canvas_size: (u32, u32)) -> Result<(), FrameError> {
        self.backend.clear(Surface::Screen, BLACK)?;
        self.canvas_renderer
            .flush(&mut self.backend, Surface::Screen, canvas_size, commands)?;
        self.backend.present()?;
        Ok(())
    }

    fn present_capture(&mut self, commands: &[DrawCommand], canvas_size: (u32, u32)) -> Result<(), FrameError> {
        let Some(capture) = self.captures.get(CAPTURE_TARGET).cloned() else {
            return self.present_direct(commands, canvas_size);
        };
        let surface = Surface::Texture(capture.texture);
        self.backend.clear(surface, BLACK)?;
        self.canvas_renderer
            .flush(&mut self.backend, surface, canvas_size, commands)?;

        if self.are_shaders_active() {
            if let Err(e) = self
                .pipeline
                .render(&mut self.backend, capture.texture, (capture.width, capture.height))
            {
                error!(parent: &self.span, "Shader pipeline failed: {}", e);
                self.fail_shaders();
                return Err(e.into());
            }
        } else {
            self.draw_fallback()?;
        }
        self.backend.present()?;
        Ok(())
    }

    /// Present the last capture without the preset chain.
    ///
    /// Meant for callers recovering from an `end_frame` error.
    pub fn present_fallback(&mut self) -> Result<(), FrameError> {
        if let Some(open) = self.open_frame {
            return Err(FrameError::FrameAlreadyOpen(open));
        }
        self.draw_fallback()?;
        self.backend.present()?;
        Ok(())
    }

    fn draw_fallback(&mut self) -> Result<(), FrameError> {
        let capture = self.captures.get(CAPTURE_TARGET).cloned();
        let (Some(capture), FallbackMode::Passthrough, true) = (capture, self.fallback, self.passthrough_ready) else {
            self.backend.clear(Surface::Screen, BLACK)?;
            return Ok(());
        };

        let size = (capture.width, capture.height);
        let viewport = self.backend.surface_size();
        let mut uniforms = UniformValues::new();
        uniforms.insert("MVP".into(), UniformValue::Mat4(QUAD_MVP));
        uniforms.insert("SourceSize".into(), size_uniform(size));
        uniforms.insert("OriginalSize".into(), size_uniform(size));
        uniforms.insert("OutputSize".into(), size_uniform(viewport));
        uniforms.insert("FrameCount".into(), UniformValue::UInt(self.next_frame as u32));
        let inputs = BTreeMap::from([("Source".to_string(), capture.texture)]);

        if !self.passthrough.execute_pass(
            &mut self.backend,
            PASSTHROUGH,
            &inputs,
            Surface::Screen,
            &uniforms,
            FilterMode::Linear,
        ) {
            return Err(PipelineError::PassExecution {
                pass: PASSTHROUGH.to_string(),
                message: self.passthrough.last_error().unwrap_or("draw failed").to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Track a new window size.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), FrameError> {
        self.backend.resize_surface(width, height);
        let (width, height) = self.backend.surface_size();
        if self.captures.get(CAPTURE_TARGET).is_some() {
            self.captures.resize(&mut self.backend, CAPTURE_TARGET, width, height)?;
        }
        if let Err(e) = self.pipeline.resize(&mut self.backend, width, height) {
            error!(parent: &self.span, "Shader pipeline failed to resize: {}", e);
            self.fail_shaders();
            return Err(e.into());
        }
        Ok(())
    }

    /// Release every GPU resource this instance created and hand the backend back.
    pub fn into_backend(mut self) -> B {
        self.pipeline.dispose(&mut self.backend);
        self.captures.dispose_all(&mut self.backend);
        self.passthrough.dispose(&mut self.backend);
        self.backend
    }
}

fn compile_passthrough(backend: &mut dyn GpuBackend, executor: &mut PassExecutor, span: &Span) -> bool {
    let mut provider = MemoryProvider::new();
    provider.insert(PASSTHROUGH_PATH, include_str!("../shaders/stock.slang"));
    let mut compiler = ShaderCompiler::new(Arc::new(provider), span.clone());
    match compiler.compile(Path::new(PASSTHROUGH_PATH)) {
        Ok(shader) => executor.compile_program(backend, PASSTHROUGH, shader),
        Err(e) => {
            error!(parent: span, "Passthrough shader failed to compile: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::FontDatabase;
    use crate::gpu::{GpuCall, RecordingBackend};
    use crate::render::bundled_shaders;
    use std::time::Duration;

    /// Serves the bundled shaders slowly enough that a load spans several frames.
    struct SlowProvider(MemoryProvider);

    impl SourceProvider for SlowProvider {
        fn read(&self, path: &Path) -> std::io::Result<String> {
            std::thread::sleep(Duration::from_millis(100));
            self.0.read(path)
        }
    }

    fn orchestrator() -> PostProcessOrchestrator<RecordingBackend> {
        PostProcessOrchestrator::new(
            RecordingBackend::new(320, 240),
            Arc::new(bundled_shaders()),
            Span::none(),
        )
    }

    fn canvas() -> Canvas2D {
        Canvas2D::new(320, 240, Arc::new(FontDatabase::empty()))
    }

    fn frame(orchestrator: &mut PostProcessOrchestrator<RecordingBackend>, canvas: &mut Canvas2D) -> Result<(), FrameError> {
        canvas.set_fill_style("#00ff00");
        canvas.fill_rect(10.0, 10.0, 100.0, 50.0);
        let token = orchestrator.begin_frame()?;
        orchestrator.end_frame(token, canvas)
    }

    /// Drive frames until the preset lands.
    fn run_until_active(orchestrator: &mut PostProcessOrchestrator<RecordingBackend>, canvas: &mut Canvas2D) {
        for _ in 0..1000 {
            frame(orchestrator, canvas).unwrap();
            if orchestrator.are_shaders_active() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("preset load did not finish");
    }

    fn pass_labels(backend: &RecordingBackend) -> Vec<String> {
        backend
            .pass_draws()
            .iter()
            .filter_map(|call| match call {
                GpuCall::DrawPass { label, .. } => Some(label.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn fifth_pass_failure_disables_shaders_for_good() {
        let mut orchestrator = orchestrator();
        let mut canvas = canvas();
        assert!(orchestrator.load_preset(Path::new("shaders/crt-bezel-4.slangp")));
        run_until_active(&mut orchestrator, &mut canvas);

        let base = orchestrator.backend().pass_draw_attempts();
        orchestrator.backend_mut().fail_pass_draw_at(base + 5);

        // Four passes succeed, the first pass of the next frame is the fifth draw.
        frame(&mut orchestrator, &mut canvas).unwrap();
        let err = frame(&mut orchestrator, &mut canvas).unwrap_err();
        assert!(matches!(err, FrameError::Pipeline(PipelineError::PassExecution { .. })));
        assert!(orchestrator.shaders_failed());
        assert!(!orchestrator.are_shaders_active());
        assert_eq!(orchestrator.backend().calls().last(), Some(&GpuCall::Discard));

        for _ in 0..3 {
            frame(&mut orchestrator, &mut canvas).unwrap();
            assert!(!orchestrator.are_shaders_active());
        }
        assert_eq!(orchestrator.backend().pass_draw_attempts(), base + 5);
        assert!(!orchestrator.load_preset(Path::new("shaders/crt-bezel-3.slangp")));
    }

    #[test]
    fn parameter_overrides_survive_a_preset_switch() {
        let mut orchestrator = orchestrator();
        orchestrator.set_parameter("SCANLINE_STRENGTH", 0.25);
        assert!(orchestrator.load_preset(Path::new("shaders/crt-bezel-3.slangp")));
        assert!(orchestrator.load_preset(Path::new("shaders/crt-bezel-4.slangp")));
        assert_eq!(orchestrator.pipeline().overrides().get("SCANLINE_STRENGTH"), Some(&0.25));

        orchestrator.set_fallback(FallbackMode::Blank);
        assert_eq!(orchestrator.fallback(), FallbackMode::Blank);
    }

    #[test]
    fn frames_pass_through_while_the_preset_loads() {
        let mut orchestrator = PostProcessOrchestrator::new(
            RecordingBackend::new(320, 240),
            Arc::new(SlowProvider(bundled_shaders())),
            Span::none(),
        );
        let mut canvas = canvas();
        assert!(orchestrator.load_preset(Path::new("shaders/crt-bezel-3.slangp")));

        let token = orchestrator.begin_frame().unwrap();
        assert_eq!(token.route(), FrameRoute::Capture);
        orchestrator.backend_mut().clear_calls();
        orchestrator.end_frame(token, &mut canvas).unwrap();

        assert_eq!(pass_labels(orchestrator.backend()), vec!["stock".to_string()]);
        assert_eq!(orchestrator.backend().calls().last(), Some(&GpuCall::Present));

        run_until_active(&mut orchestrator, &mut canvas);
        orchestrator.backend_mut().clear_calls();
        frame(&mut orchestrator, &mut canvas).unwrap();
        assert_eq!(pass_labels(orchestrator.backend()).len(), 3);
    }

    #[test]
    fn blank_fallback_draws_no_passes() {
        let mut orchestrator = orchestrator().with_fallback(FallbackMode::Blank);
        let mut canvas = canvas();
        frame(&mut orchestrator, &mut canvas).unwrap();

        assert!(pass_labels(orchestrator.backend()).is_empty());
        assert!(orchestrator
            .backend()
            .calls()
            .iter()
            .any(|call| matches!(call, GpuCall::Clear { target: Surface::Screen, .. })));
    }

    #[test]
    fn disabled_shaders_draw_straight_to_the_screen() {
        let mut orchestrator = orchestrator();
        orchestrator.set_shaders_enabled(false);
        let mut canvas = canvas();
        canvas.fill_rect(0.0, 0.0, 5.0, 5.0);

        let token = orchestrator.begin_frame().unwrap();
        assert_eq!(token.route(), FrameRoute::Direct);
        orchestrator.end_frame(token, &mut canvas).unwrap();

        assert!(orchestrator
            .backend()
            .calls()
            .iter()
            .any(|call| matches!(call, GpuCall::DrawCanvas { target: Surface::Screen, .. })));
        assert!(pass_labels(orchestrator.backend()).is_empty());
        assert!(canvas.commands().is_empty());
    }

    #[test]
    fn frame_tokens_must_match() {
        let mut orchestrator = orchestrator();
        let mut canvas = canvas();

        let token = orchestrator.begin_frame().unwrap();
        let open = token.id();
        assert!(matches!(orchestrator.begin_frame(), Err(FrameError::FrameAlreadyOpen(id)) if id == open));
        orchestrator.end_frame(token, &mut canvas).unwrap();

        let stale = FrameToken {
            id: open,
            route: FrameRoute::Direct,
        };
        assert!(matches!(
            orchestrator.end_frame(stale, &mut canvas),
            Err(FrameError::TokenMismatch { expected: None, got }) if got == open
        ));
        // The orchestrator is still usable.
        frame(&mut orchestrator, &mut canvas).unwrap();
    }

    #[test]
    fn failed_load_presents_directly() {
        let mut orchestrator = orchestrator();
        let mut canvas = canvas();
        assert!(orchestrator.load_preset(Path::new("shaders/missing.slangp")));

        for _ in 0..1000 {
            frame(&mut orchestrator, &mut canvas).unwrap();
            if orchestrator.shaders_failed() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(orchestrator.shaders_failed());
        let token = orchestrator.begin_frame().unwrap();
        assert_eq!(token.route(), FrameRoute::Direct);
        orchestrator.end_frame(token, &mut canvas).unwrap();
    }

    #[test]
    fn into_backend_releases_everything() {
        let mut orchestrator = orchestrator();
        let mut canvas = canvas();
        assert!(orchestrator.load_preset(Path::new("shaders/crt-bezel-4.slangp")));
        run_until_active(&mut orchestrator, &mut canvas);

        let backend = orchestrator.into_backend();
        assert_eq!(backend.live_textures(), 0);
        assert_eq!(backend.live_programs(), 0);
    }
}
