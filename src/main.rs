// =============================================================================
// FRAME PACER - multi-buffered presentation with CPU/GPU lockstep
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (resize, keys, redraw)                        │
// │    └── Presenter (fence timeline + frame slots + submitter)     │
// │          └── Vulkan backend: timeline semaphore, swapchain,     │
// │              one command pool per slot                          │
// │          └── or the headless backend (worker-thread GPU)        │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW (one tick):
// 1. Wait until the slot's previous frame is done, reset its pool
// 2. Record clear + transitions, submit
// 3. Present, then signal the fence with the frame's value
// 4. Ask the swapchain for the next image and wait for that slot
//
// =============================================================================

use anyhow::{Context, Result};
use frame_pacer::backend::{
    FrameCommands, HeadlessGpu, Surface, Swapchain, TimelineFence, VulkanDevice, VulkanPresenter,
};
use frame_pacer::config::Config;
use frame_pacer::error::{FrameError, FrameResult};
use frame_pacer::frame::{CommandRecorder, Extent, FrameReport, GpuFence, PresentMode, Presenter};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, ModifiersState, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let (config, load_error) = Config::load();

    init_logging(&config);
    if let Some(e) = load_error {
        log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
    }
    log::info!("Starting frame pacer");
    log::info!(
        "{} frames in flight, vsync {}, stall timeout {:?}",
        config.presentation.frames_in_flight,
        if config.presentation.vsync { "on" } else { "off" },
        config.stall_timeout()
    );

    if config.headless.enabled {
        return run_headless(&config);
    }

    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Initialize logging, optionally into a file with a start header
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env, Target};

    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    let mut file_error = None;
    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Frame Pacer Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => file_error = Some(e),
        }
    }

    builder.init();

    if let Some(e) = file_error {
        log::warn!("Could not open log file {}: {}", config.debug.log_file, e);
    }
}

// =============================================================================
// TICK OUTCOMES
// =============================================================================

enum TickFlow {
    Presented(FrameReport),
    /// Nothing presented this time; try again next redraw
    Retry,
    Fatal(FrameError),
}

/// Stalls are recoverable unless configured otherwise; an out-of-date
/// swapchain just waits for the next tick's rebuild.
fn classify(result: FrameResult<FrameReport>, abort_on_stall: bool) -> TickFlow {
    match result {
        Ok(report) => TickFlow::Presented(report),
        Err(e) if e.is_stall() && !abort_on_stall => {
            log::warn!("{}; retrying next frame", e);
            TickFlow::Retry
        }
        Err(FrameError::OutOfDate) => {
            log::debug!("Swapchain out of date, skipping frame");
            TickFlow::Retry
        }
        Err(e) => TickFlow::Fatal(e),
    }
}

/// Frames per second over one-second windows.
struct FpsCounter {
    frame_count: u32,
    last_update: Instant,
    last_frame: Instant,
}

impl FpsCounter {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            frame_count: 0,
            last_update: now,
            last_frame: now,
        }
    }

    /// Count a frame. Returns (fps, frame ms) once per second.
    fn frame(&mut self) -> Option<(f32, f32)> {
        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_update).as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }

        let fps = self.frame_count as f32 / elapsed;
        self.frame_count = 0;
        self.last_update = now;
        Some((fps, frame_time * 1000.0))
    }
}

fn log_frame(report: &FrameReport) {
    log::trace!(
        "Frame {} on slot {} ({:?}), next slot {:?}",
        report.fence_value,
        report.slot,
        report.outcome,
        report.next_slot
    );
}

/// Flush and release the presenter so later events find nothing to tick.
fn shut_down<F, S, R>(presenter: &mut Option<Presenter<F, S, R>>)
where
    F: GpuFence,
    S: frame_pacer::frame::Swapchain,
    R: CommandRecorder<S::Image>,
{
    if let Some(mut presenter) = presenter.take() {
        if let Err(e) = presenter.shutdown() {
            log::error!("Shutdown flush failed: {}", e);
        }
    }
}

// =============================================================================
// HEADLESS MODE
// =============================================================================

fn run_headless(config: &Config) -> Result<()> {
    let latency = Duration::from_millis(config.headless.gpu_latency_ms);
    let gpu = HeadlessGpu::new(latency)?;
    let mut presenter = gpu.presenter(
        config.window.width,
        config.window.height,
        config.presenter_options(false),
    )?;

    log::info!("Headless run: {} frames", config.headless.frames);

    let start = Instant::now();
    let mut fps = FpsCounter::new();
    while presenter.frames_presented() < config.headless.frames {
        match classify(presenter.tick(), config.presentation.abort_on_stall) {
            TickFlow::Presented(report) => {
                log_frame(&report);
                if let Some((rate, ms)) = fps.frame() {
                    if config.debug.show_fps {
                        log::info!("{:.0} FPS ({:.2}ms)", rate, ms);
                    }
                }
            }
            TickFlow::Retry => {}
            TickFlow::Fatal(e) => return Err(e).context("Headless frame failed"),
        }
    }

    presenter.shutdown()?;
    let stats = gpu.stats();
    log::info!(
        "Headless run done in {:.2}s: {} executed, {} presented, fence at {}",
        start.elapsed().as_secs_f32(),
        stats.executed,
        stats.presented,
        stats.completed
    );

    if stats.stale_executions > 0 || stats.bad_transitions > 0 {
        anyhow::bail!(
            "{} stale executions, {} bad transitions",
            stats.stale_executions,
            stats.bad_transitions
        );
    }
    Ok(())
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Windowed application.
///
/// Field order matters for Drop: the presenter flushes the GPU and releases
/// its Vulkan objects before the window goes away.
struct App {
    config: Config,
    presenter: Option<VulkanPresenter>,
    window: Option<Arc<Window>>,

    is_minimized: bool,
    modifiers: ModifiersState,
    fps: FpsCounter,

    /// Error that ended the event loop, reported from main
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            presenter: None,
            window: None,
            is_minimized: false,
            modifiers: ModifiersState::empty(),
            fps: FpsCounter::new(),
            fatal: None,
        }
    }

    fn init_vulkan(&mut self, window: &Window) -> Result<VulkanPresenter> {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(
            &self.config.window.title,
            enable_validation,
            self.config.graphics.use_software_adapter,
        )?;

        let surface = Surface::new(&device, window)?;

        let size = window.inner_size();
        let extent = Extent::clamped(size.width, size.height);
        let slots = self.config.presentation.frames_in_flight;
        let initial_mode = if self.config.presentation.vsync {
            PresentMode::Vsync
        } else {
            PresentMode::Unsynced { tearing: true }
        };

        let swapchain = Swapchain::new(
            device.clone(),
            surface,
            extent.width,
            extent.height,
            slots as u32,
            initial_mode,
            self.config.stall_timeout(),
        )?;
        let tearing_supported = swapchain.tearing_supported();
        log::info!("Tearing support: {}", tearing_supported);

        let fence = TimelineFence::new(device.clone())?;
        let commands = FrameCommands::new(device, slots)?;

        let presenter = Presenter::new(
            fence,
            swapchain,
            commands,
            self.config.presenter_options(tearing_supported),
        )?;

        log::info!("Vulkan initialized successfully!");
        Ok(presenter)
    }

    /// Stop the loop, keeping the error for main.
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.fatal = Some(error);
        self.shutdown();
        event_loop.exit();
    }

    fn shutdown(&mut self) {
        shut_down(&mut self.presenter);
    }

    fn render_frame(&mut self, event_loop: &ActiveEventLoop) {
        if self.is_minimized {
            return;
        }
        let Some(presenter) = self.presenter.as_mut() else {
            return;
        };

        match classify(presenter.tick(), self.config.presentation.abort_on_stall) {
            TickFlow::Presented(report) => {
                log_frame(&report);
                self.update_fps();
            }
            TickFlow::Retry => {}
            TickFlow::Fatal(e) => {
                let error = anyhow::Error::new(e).context("Frame failed");
                self.fail(event_loop, error);
            }
        }
    }

    fn resize(&mut self, event_loop: &ActiveEventLoop, width: u32, height: u32) {
        // Minimized: keep the old images, stop ticking
        if width == 0 || height == 0 {
            self.is_minimized = true;
            return;
        }
        self.is_minimized = false;

        let Some(presenter) = self.presenter.as_mut() else {
            return;
        };
        if let Err(e) = presenter.on_resize(width, height) {
            let error = anyhow::Error::new(e).context("Resize failed");
            self.fail(event_loop, error);
        }
    }

    fn toggle_fullscreen(&mut self) {
        let (Some(window), Some(presenter)) = (self.window.as_ref(), self.presenter.as_mut()) else {
            return;
        };

        // The resulting size change arrives as a Resized event
        if presenter.on_toggle_fullscreen() {
            window.set_fullscreen(Some(Fullscreen::Borderless(None)));
        } else {
            window.set_fullscreen(None);
        }
    }

    fn toggle_vsync(&mut self) {
        if let Some(presenter) = self.presenter.as_mut() {
            let vsync = !presenter.flags().vsync;
            presenter.on_present_mode_changed(vsync);
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        let Some((fps, frame_ms)) = self.fps.frame() else {
            return;
        };
        let (Some(window), Some(presenter)) = (self.window.as_ref(), self.presenter.as_ref()) else {
            return;
        };

        let flags = presenter.flags();
        let mode = if flags.fullscreen { "fullscreen" } else { "windowed" };
        let vsync = if flags.vsync { "vsync" } else { "no vsync" };
        window.set_title(&format!(
            "{} - {:.0} FPS ({:.2}ms) [{}, {}]",
            self.config.window.title, fps, frame_ms, mode, vsync
        ));
        log::debug!("{:.0} FPS ({:.2}ms)", fps, frame_ms);
    }
}

// =============================================================================
// WINIT EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match self.init_vulkan(&window) {
            Ok(mut presenter) => {
                if self.config.window.fullscreen {
                    presenter.set_fullscreen(true);
                }
                self.presenter = Some(presenter);
            }
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize Vulkan"));
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.resize(event_loop, size.width, size.height);
            }

            WindowEvent::RedrawRequested => {
                self.render_frame(event_loop);
            }

            WindowEvent::ModifiersChanged(modifiers) => {
                self.modifiers = modifiers.state();
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if !event.state.is_pressed() || event.repeat {
                    return;
                }
                if let PhysicalKey::Code(key) = event.physical_key {
                    match key {
                        KeyCode::Escape => {
                            log::info!("ESC pressed, exiting...");
                            self.shutdown();
                            event_loop.exit();
                        }
                        KeyCode::F11 => self.toggle_fullscreen(),
                        KeyCode::Enter if self.modifiers.alt_key() => self.toggle_fullscreen(),
                        KeyCode::KeyV => self.toggle_vsync(),
                        _ => {}
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
