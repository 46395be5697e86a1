//! Scanline: runs an attract-mode Canvas2D scene through a retro shader preset.

mod demo;

use anyhow::{Context, Result};
use clap::Parser;
use demo::AttractScene;
use scanline::canvas::{Canvas2D, FontDatabase};
use scanline::config::{Config, ConfigWatcher};
use scanline::gpu::{GpuBackend, WgpuBackend};
use scanline::orchestrator::PostProcessOrchestrator;
use scanline::render::PipelineState;
use scanline::shader::FsProvider;
use scanline::utils::FrameClock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowAttributes, WindowId};

/// How long headless mode waits for a preset before rendering anyway.
const HEADLESS_LOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Retro CRT shader presets over a GPU Canvas2D surface.
#[derive(Parser, Debug)]
#[command(name = "scanline")]
#[command(about = "Render a Canvas2D scene through a multi-pass retro shader preset")]
struct Args {
    /// YAML configuration file, watched for changes
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Shader preset (.slangp), overrides the config file
    #[arg(short, long)]
    preset: Option<PathBuf>,

    /// Canvas width
    #[arg(long)]
    width: Option<u32>,

    /// Canvas height
    #[arg(long)]
    height: Option<u32>,

    /// Target frames per second
    #[arg(long)]
    fps: Option<u32>,

    /// Present the canvas without shaders
    #[arg(long)]
    no_shaders: bool,

    /// Render offscreen and write a screenshot instead of opening a window
    #[arg(long)]
    headless: bool,

    /// Frames to render in headless mode
    #[arg(long, default_value = "60")]
    frames: u32,

    /// Screenshot path for headless mode
    #[arg(long, default_value = "scanline.png")]
    screenshot: PathBuf,
}

impl Args {
    /// The config file, if any, with command-line flags applied on top.
    fn settings(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                let base = path.parent().map(PathBuf::from).unwrap_or_default();
                Config::load(path)?.resolve_paths(&base)
            }
            None => Config::default(),
        };
        self.apply_overrides(&mut config);
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut Config) {
        if let Some(preset) = &self.preset {
            config.preset = Some(preset.clone());
        }
        if let Some(width) = self.width {
            config.width = width.max(1);
        }
        if let Some(height) = self.height {
            config.height = height.max(1);
        }
        if let Some(fps) = self.fps {
            config.fps = fps.max(1);
        }
        if self.no_shaders {
            config.shaders_enabled = false;
        }
    }
}

fn load_fonts(config: &Config) -> Arc<FontDatabase> {
    let mut fonts = FontDatabase::new();
    for path in &config.font_files {
        match fonts.load_font_file(path) {
            Ok(()) => info!("Loaded font file {:?}", path),
            Err(e) => warn!("Failed to load font file {:?}: {}", path, e),
        }
    }
    Arc::new(fonts)
}

fn build_orchestrator<B: GpuBackend>(backend: B, config: &Config) -> PostProcessOrchestrator<B> {
    let mut orchestrator = PostProcessOrchestrator::new(backend, Arc::new(FsProvider), info_span!("orchestrator"))
        .with_fallback(config.fallback);
    orchestrator.set_shaders_enabled(config.shaders_enabled);
    for (name, value) in &config.parameters {
        orchestrator.set_parameter(name, *value);
    }
    match &config.preset {
        Some(preset) => {
            orchestrator.load_preset(preset);
        }
        None => info!("No preset configured, using passthrough shader"),
    }
    orchestrator
}

/// Draw one scene frame through the orchestrator, falling back after a shader failure.
fn render_frame<B: GpuBackend>(
    orchestrator: &mut PostProcessOrchestrator<B>,
    canvas: &mut Canvas2D,
    scene: &AttractScene,
    time: f32,
) {
    let token = match orchestrator.begin_frame() {
        Ok(token) => token,
        Err(e) => {
            error!("Failed to begin frame: {}", e);
            return;
        }
    };
    scene.draw(canvas, time);
    if let Err(e) = orchestrator.end_frame(token, canvas) {
        error!("Frame failed: {}", e);
        if let Err(e) = orchestrator.present_fallback() {
            error!("Fallback presentation failed: {}", e);
        }
    }
}

/// Application state for the event loop.
struct ScanlineApp {
    args: Args,
    config: Config,
    watcher: Option<ConfigWatcher>,
    window: Option<Arc<Window>>,
    orchestrator: Option<PostProcessOrchestrator<WgpuBackend>>,
    canvas: Option<Canvas2D>,
    fonts: Arc<FontDatabase>,
    scene: AttractScene,
    clock: FrameClock,
}

impl ScanlineApp {
    fn new(args: Args, mut config: Config) -> Self {
        let watcher = args.config.as_deref().and_then(|path| match ConfigWatcher::new(path) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Config hot reload disabled: {:#}", e);
                None
            }
        });
        if let Some(watcher) = &watcher {
            config = watcher.current().clone();
            args.apply_overrides(&mut config);
        }
        let fonts = load_fonts(&config);
        Self {
            scene: AttractScene::new(&config.font_family),
            clock: FrameClock::new(config.fps),
            args,
            config,
            watcher,
            window: None,
            orchestrator: None,
            canvas: None,
            fonts,
        }
    }

    fn initialize(&mut self, window: Arc<Window>) -> Result<()> {
        let backend = WgpuBackend::with_window(window, info_span!("gpu"))?;
        self.orchestrator = Some(build_orchestrator(backend, &self.config));
        self.canvas = Some(Canvas2D::new(self.config.width, self.config.height, self.fonts.clone()));
        Ok(())
    }

    /// Apply a reloaded config on top of the running state, touching only what changed.
    fn apply_config(&mut self, mut config: Config) {
        self.args.apply_overrides(&mut config);
        let diff = self.config.diff(&config);
        if diff.is_empty() {
            return;
        }

        if diff.font_files {
            self.fonts = load_fonts(&config);
        }
        if let Some(family) = &diff.font_family {
            self.scene.set_font_family(family);
        }
        if let Some(fps) = diff.fps {
            self.clock.set_fps(fps);
        }
        if diff.font_files || diff.canvas_size.is_some() {
            self.canvas = Some(Canvas2D::new(config.width, config.height, self.fonts.clone()));
        }

        let failed = self.orchestrator.as_ref().is_some_and(|o| o.shaders_failed());
        if diff.preset == Some(None) || (diff.preset.is_some() && failed) {
            // Shader failure is sticky, and without a preset only the passthrough is left.
            if let Some(orchestrator) = self.orchestrator.take() {
                self.orchestrator = Some(build_orchestrator(orchestrator.into_backend(), &config));
            }
        } else if let Some(orchestrator) = self.orchestrator.as_mut() {
            if let Some(enabled) = diff.shaders_enabled {
                orchestrator.set_shaders_enabled(enabled);
            }
            if let Some(fallback) = diff.fallback {
                orchestrator.set_fallback(fallback);
            }
            for (name, value) in &diff.parameters {
                orchestrator.set_parameter(name, *value);
            }
            if let Some(Some(preset)) = &diff.preset {
                orchestrator.load_preset(preset);
            }
        }
        info!("Applied new configuration: {:?}", diff);
        self.config = config;
    }

    fn redraw(&mut self) {
        let now = Instant::now();
        if !self.clock.is_due(now) {
            return;
        }
        if let Some(config) = self.watcher.as_mut().and_then(|w| w.poll()) {
            self.apply_config(config);
        }

        let (Some(orchestrator), Some(canvas)) = (&mut self.orchestrator, &mut self.canvas) else {
            return;
        };
        render_frame(orchestrator, canvas, &self.scene, self.clock.elapsed(now));

        if let Some(fps) = self.clock.tick(now) {
            debug!(
                "[Perf] Rendering at {:.2} FPS (shaders active: {})",
                fps,
                orchestrator.are_shaders_active()
            );
        }
    }
}

impl ApplicationHandler for ScanlineApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attrs = WindowAttributes::default()
            .with_title("Scanline")
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        match event_loop.create_window(window_attrs) {
            Ok(window) => {
                let window = Arc::new(window);
                self.window = Some(window.clone());
                match self.initialize(window) {
                    Ok(()) => info!("Window created successfully"),
                    Err(e) => {
                        error!("Initialization error: {:#}", e);
                        event_loop.exit();
                    }
                }
            }
            Err(e) => {
                error!("Failed to create window: {}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Window closed");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(orchestrator) = &mut self.orchestrator {
                    if let Err(e) = orchestrator.resize(size.width, size.height) {
                        error!("Resize failed: {}", e);
                    }
                }
            }
            WindowEvent::RedrawRequested => {
                self.redraw();
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = args.settings()?;
    info!("Starting Scanline...");

    if args.headless {
        run_headless(&args, &config)
    } else {
        run_window_mode(args, config)
    }
}

fn run_window_mode(args: Args, config: Config) -> Result<()> {
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = ScanlineApp::new(args, config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Render offscreen and save the last frame.
fn run_headless(args: &Args, config: &Config) -> Result<()> {
    let backend = WgpuBackend::headless(config.width, config.height, info_span!("gpu"))?;
    let mut orchestrator = build_orchestrator(backend, config);
    let mut canvas = Canvas2D::new(config.width, config.height, load_fonts(config));
    let scene = AttractScene::new(&config.font_family);
    let frame_time = 1.0 / config.fps as f32;

    let start = Instant::now();
    while orchestrator.pipeline().state() == PipelineState::Loading && start.elapsed() < HEADLESS_LOAD_TIMEOUT {
        render_frame(&mut orchestrator, &mut canvas, &scene, 0.0);
        std::thread::sleep(Duration::from_millis(10));
    }
    if orchestrator.pipeline().state() == PipelineState::Loading {
        warn!("Preset still loading after {:?}", HEADLESS_LOAD_TIMEOUT);
    }

    for frame in 0..args.frames.max(1) {
        render_frame(&mut orchestrator, &mut canvas, &scene, frame as f32 * frame_time);
    }
    info!(
        "Rendered {} frames (shaders active: {})",
        args.frames.max(1),
        orchestrator.are_shaders_active()
    );

    orchestrator
        .backend()
        .snapshot()?
        .save(&args.screenshot)
        .with_context(|| format!("Failed to write {:?}", args.screenshot))?;
    info!("Saved {:?}", args.screenshot);
    Ok(())
}
