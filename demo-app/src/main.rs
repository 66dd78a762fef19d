#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

use std::{
    fs::{self, File},
    path::PathBuf,
    sync::Arc,
};

use clap::Parser;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};
use vkboot::{
    ash::vk,
    device::{Device, DeviceConfig},
    diagnostics::{DiagnosticsConfig, VulkanLogLevel},
    instance::{Instance, InstanceExtensions},
    surface::Surface,
    swapchain::Swapchain,
};
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliLogLevel {
    /// Disable logging entirely.
    Off,
    #[default]
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl CliLogLevel {
    fn as_level(self) -> Option<tracing::Level> {
        match self {
            CliLogLevel::Off => None,
            CliLogLevel::Error => Some(tracing::Level::ERROR),
            CliLogLevel::Warn => Some(tracing::Level::WARN),
            CliLogLevel::Info => Some(tracing::Level::INFO),
            CliLogLevel::Debug => Some(tracing::Level::DEBUG),
            CliLogLevel::Trace => Some(tracing::Level::TRACE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        match value {
            CliVulkanLogLevel::Verbose => VulkanLogLevel::Verbose,
            CliVulkanLogLevel::Info => VulkanLogLevel::Info,
            CliVulkanLogLevel::Warning => VulkanLogLevel::Warning,
            CliVulkanLogLevel::Error => VulkanLogLevel::Error,
        }
    }
}

/// Brings up a Vulkan device and presentation chain inside a winit window.
#[derive(Debug, Parser)]
struct CliArgs {
    /// Stdout log verbosity. The log file always records everything.
    #[arg(short, long, default_value = "error")]
    log_level: CliLogLevel,
    /// Forward Vulkan debug messages at this severity and above.
    #[arg(short, long)]
    graphics_debug_level: Option<CliVulkanLogLevel>,
    /// Fail startup when the debug messenger cannot be installed.
    #[arg(long)]
    require_graphics_debug: bool,
    #[arg(long, default_value_t = 1280)]
    window_width: u32,
    #[arg(long, default_value_t = 720)]
    window_height: u32,
}

/// Wires a pretty stdout layer and a plain-text file layer into the global
/// subscriber. Only stdout is filtered by `level`. Returns the log file
/// path so main can print it before logging starts mattering.
fn init_logging(level: tracing::Level) -> eyre::Result<PathBuf> {
    let log_dir = match directories::ProjectDirs::from("", "vkboot", "demo-app") {
        Some(dirs) => dirs
            .runtime_dir()
            .unwrap_or_else(|| dirs.data_dir())
            .to_owned(),
        None => std::env::current_dir()?,
    };
    fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join("demo-app.log");
    let log_file = File::create(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(Arc::new(log_file))
        .with_ansi(false);
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_filter(tracing_subscriber::filter::LevelFilter::from_level(level));

    tracing_subscriber::registry()
        .with(stdout_layer.and_then(file_layer))
        .init();

    Ok(log_path)
}

fn main() -> eyre::Result<()> {
    let args = CliArgs::parse();

    if let Some(level) = args.log_level.as_level() {
        let log_path = init_logging(level)?;
        println!("Logging to {}", log_path.display());
    }
    tracing::debug!("Parsed command line: {args:?}");

    let diagnostics = args.graphics_debug_level.map(|level| DiagnosticsConfig {
        max_log_level: level.into(),
        required: args.require_graphics_debug,
        ..Default::default()
    });

    let event_loop = EventLoop::new()?;

    //SAFETY: the loader library named by the platform's linking convention
    //is trusted to be a real Vulkan loader
    let instance = Arc::new(unsafe {
        Instance::new(
            "demo-app",
            diagnostics,
            Some(&event_loop),
            InstanceExtensions { surface: true },
        )
    }?);
    tracing::info!(
        "Vulkan instance up, api version {}, debug messenger installed: {}",
        instance.api_version(),
        instance.diagnostics_installed()
    );

    let mut app = DemoApp::new(
        instance,
        LogicalSize::new(args.window_width, args.window_height),
    );
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Everything whose lifetime is tied to the platform window surface. Torn
/// down as a unit when the platform suspends us.
struct ViewState {
    surface: Arc<Surface<Window>>,
    /// None while the window is zero-sized. The next real resize brings
    /// it back.
    swapchain: Option<Swapchain<Window>>,
}

struct DemoApp {
    instance: Arc<Instance>,
    device_config: DeviceConfig,
    initial_size: LogicalSize<u32>,
    window: Option<Arc<Window>>,
    /// Created on the first resume, then kept across suspend cycles.
    device: Option<Arc<Device>>,
    view: Option<ViewState>,
}

impl DemoApp {
    fn new(instance: Arc<Instance>, initial_size: LogicalSize<u32>) -> Self {
        Self {
            instance,
            device_config: DeviceConfig::default(),
            initial_size,
            window: None,
            device: None,
            view: None,
        }
    }

    fn window_extent(window: &Window) -> vk::Extent2D {
        let size = window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    /// Builds the surface, the device if this is the first resume, and a
    /// swapchain sized to the window.
    fn bring_up_view(&mut self) -> eyre::Result<()> {
        let Some(window) = self.window.clone() else {
            eyre::bail!("no window to build a view for");
        };

        //SAFETY: suspended() drops this surface before the platform
        //invalidates the window it came from
        let surface =
            Arc::new(unsafe { Surface::new(&self.instance, Arc::clone(&window)) }?);

        let device = match self.device.as_ref() {
            Some(device) => Arc::clone(device),
            None => {
                let created = Arc::new(Device::create_for_surface(
                    &self.instance,
                    &surface,
                    &self.device_config,
                )?);
                self.device = Some(Arc::clone(&created));
                created
            }
        };

        let extent = Self::window_extent(&window);
        let swapchain = if extent.width == 0 || extent.height == 0 {
            tracing::debug!(
                "Window is zero-sized ({}x{}), deferring swapchain creation",
                extent.width,
                extent.height
            );
            None
        } else {
            Some(Swapchain::new(&device, &surface, extent, None)?)
        };

        self.view = Some(ViewState { surface, swapchain });
        Ok(())
    }

    /// Reacts to a new window extent. Zero-sized windows park the
    /// swapchain until they grow back; anything else recreates it through
    /// the old-swapchain handoff. Returns false when the app should exit.
    fn resize_view(&mut self, extent: vk::Extent2D) -> bool {
        let (Some(device), Some(view)) = (self.device.as_ref(), self.view.as_mut())
        else {
            return true;
        };

        if extent.width == 0 || extent.height == 0 {
            tracing::debug!("Window went zero-sized, parking the swapchain");
            if let Err(e) = device.wait_idle() {
                tracing::error!("wait_idle failed before swapchain teardown: {e}");
                return false;
            }
            view.swapchain = None;
            return true;
        }

        if let Some(chain) = view.swapchain.as_ref()
            && chain.extent() == extent
        {
            tracing::trace!(
                "Extent unchanged at {}x{}, keeping the swapchain",
                extent.width,
                extent.height
            );
            return true;
        }

        match Swapchain::new_with_old(
            device,
            &view.surface,
            extent,
            view.swapchain.as_ref(),
            None,
        ) {
            Ok(chain) => {
                view.swapchain = Some(chain);
                true
            }
            Err(e) => {
                tracing::error!("Swapchain recreation failed: {e}");
                false
            }
        }
    }

    /// Tears everything down and stops the event loop. The Arc chains
    /// inside vkboot enforce chain-before-surface-before-device order.
    fn shut_down(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(device) = self.device.as_ref()
            && let Err(e) = device.wait_idle()
        {
            tracing::error!("wait_idle failed during shutdown: {e}");
        }
        self.view = None;
        self.device = None;
        self.window = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for DemoApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        // Nothing renders, so there is no reason to spin the loop.
        event_loop.set_control_flow(ControlFlow::Wait);

        if self.window.is_none() {
            let attrs = Window::default_attributes()
                .with_title("demo-app")
                .with_inner_size(self.initial_size);
            match event_loop.create_window(attrs) {
                Ok(window) => self.window = Some(Arc::new(window)),
                Err(e) => {
                    tracing::error!("Could not create a window: {e}");
                    event_loop.exit();
                    return;
                }
            }
        }

        // Some platforms deliver resumed() more than once; only rebuild
        // the view when the last suspend actually tore it down.
        if self.view.is_none()
            && let Err(e) = self.bring_up_view()
        {
            tracing::error!("Vulkan bring-up failed: {e:#}");
            self.shut_down(event_loop);
        }
    }

    fn suspended(&mut self, _event_loop: &ActiveEventLoop) {
        // The platform is about to invalidate the window surface. Release
        // the swapchain and surface now; the device and window survive
        // until the next resume.
        if let Some(view) = self.view.take() {
            if let Some(device) = self.device.as_ref()
                && let Err(e) = device.wait_idle()
            {
                tracing::error!("wait_idle failed during suspend: {e}");
            }
            drop(view);
            tracing::debug!("Suspended, released surface and swapchain");
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        let ours = self
            .window
            .as_ref()
            .is_some_and(|window| window.id() == window_id);
        if !ours {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                tracing::debug!("Close requested");
                self.shut_down(event_loop);
            }
            WindowEvent::Resized(size) => {
                let extent = vk::Extent2D {
                    width: size.width,
                    height: size.height,
                };
                if !self.resize_view(extent) {
                    self.shut_down(event_loop);
                }
            }
            WindowEvent::ScaleFactorChanged { .. } => {
                let extent = match self.window.as_ref() {
                    Some(window) => Self::window_extent(window),
                    None => return,
                };
                if !self.resize_view(extent) {
                    self.shut_down(event_loop);
                }
            }
            _ => {}
        }
    }
}
