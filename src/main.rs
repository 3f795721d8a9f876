use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use parking_lot::{Condvar, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capture_hal::camera::{
    msg, CameraCallbacks, CameraRegistry, Facing, MemoryDisplay, MemorySlot, Notification,
};
use capture_hal::config::{AppConfig, LogConfig};
use capture_hal::video::{DeviceBackend, SimBackend, V4l2Backend};

/// Log level for the application
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Verbose,
    Debug,
    Trace,
}

/// capture-hal command line arguments
#[derive(Parser, Debug)]
#[command(name = "capture-hal")]
#[command(version, about = "Camera capture pipeline exerciser", long_about = None)]
struct CliArgs {
    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Primary capture node (overrides the config file)
    #[arg(short = 'd', long, value_name = "NODE")]
    device: Option<String>,

    /// Record capture node (overrides the config file)
    #[arg(long, value_name = "NODE")]
    record_device: Option<String>,

    /// Sensor to open (back or front)
    #[arg(long, value_name = "FACING")]
    facing: Option<Facing>,

    /// Use the in-memory device backend instead of V4L2
    #[arg(long)]
    simulate: bool,

    /// Preview frames to receive before stopping
    #[arg(short = 'n', long, value_name = "N", default_value_t = 30)]
    frames: u64,

    /// Take one picture and write the JPEG here
    #[arg(long, value_name = "FILE")]
    picture: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// What the callbacks have seen so far
#[derive(Default)]
struct Progress {
    preview_frames: u64,
    picture: Option<Bytes>,
    failed: bool,
}

/// Callbacks that log events and wake the main thread
#[derive(Default)]
struct DemoCallbacks {
    progress: Mutex<Progress>,
    changed: Condvar,
}

impl DemoCallbacks {
    /// Wait until `done` holds or `timeout` passes
    fn wait(&self, timeout: Duration, mut done: impl FnMut(&Progress) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut progress = self.progress.lock();
        while !done(&progress) {
            if self.changed.wait_until(&mut progress, deadline).timed_out() {
                return done(&progress);
            }
        }
        true
    }
}

impl CameraCallbacks for DemoCallbacks {
    fn notify(&self, event: Notification) {
        tracing::info!("Camera event: {:?}", event);
        if let Notification::Error(_) = event {
            self.progress.lock().failed = true;
            self.changed.notify_all();
        }
    }

    fn on_preview_frame(&self, frame: MemorySlot) {
        let mut progress = self.progress.lock();
        progress.preview_frames += 1;
        tracing::trace!(
            "Preview frame {} in slot {}",
            progress.preview_frames,
            frame.index
        );
        self.changed.notify_all();
    }

    fn on_compressed_image(&self, data: Bytes) {
        tracing::info!("Compressed picture: {} bytes", data.len());
        self.progress.lock().picture = Some(data);
        self.changed.notify_all();
    }
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => AppConfig::default(),
    };
    init_logging(&config.log, args.log_level, args.verbose);
    tracing::info!("Starting capture-hal v{}", env!("CARGO_PKG_VERSION"));

    if let Some(device) = args.device {
        config.camera.device = device;
    }
    if let Some(record) = args.record_device {
        config.camera.record_device = Some(record);
    }
    if let Some(facing) = args.facing {
        config.camera.facing = facing;
    }
    config.validate()?;

    let backend: Arc<dyn DeviceBackend> = if args.simulate {
        Arc::new(SimBackend::new())
    } else {
        Arc::new(V4l2Backend::new())
    };
    let registry = CameraRegistry::new(backend);
    let camera = registry
        .open(config.camera.clone())
        .with_context(|| format!("Failed to open {}", config.camera.device))?;

    let callbacks = Arc::new(DemoCallbacks::default());
    camera.set_callbacks(callbacks.clone());
    camera.enable_msg_type(msg::PREVIEW_FRAME | msg::COMPRESSED_IMAGE | msg::SHUTTER | msg::ERROR);

    let display = MemoryDisplay::new(3);
    let presented = display.presented();
    camera.set_preview_window(Some(Box::new(display)))?;
    camera.start_preview()?;

    // Generous bound: the first frame alone may take a full frame timeout
    let budget = config.camera.frame_timeout() * 2 + Duration::from_millis(100 * args.frames);
    let frames = args.frames;
    if !callbacks.wait(budget, |p| p.preview_frames >= frames) {
        bail!(
            "Received {} of {} preview frames",
            callbacks.progress.lock().preview_frames,
            frames
        );
    }
    tracing::info!(
        "Received {} preview frames, {} presented",
        frames,
        presented.load(std::sync::atomic::Ordering::Relaxed)
    );

    if let Some(path) = &args.picture {
        camera.take_picture()?;
        if !callbacks.wait(budget, |p| p.picture.is_some() || p.failed) {
            bail!("No picture within {:?}", budget);
        }
        camera.cancel_picture()?;

        let picture = callbacks.progress.lock().picture.take();
        let Some(data) = picture else {
            bail!("Still capture failed");
        };
        std::fs::write(path, &data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!("Wrote {} bytes to {}", data.len(), path.display());
    } else {
        camera.stop_preview();
    }

    drop(camera);
    tracing::info!("Done");
    Ok(())
}

fn init_logging(config: &LogConfig, level: Option<LogLevel>, verbose_count: u8) {
    // Verbose count overrides log level
    let level = match verbose_count {
        0 => level,
        1 => Some(LogLevel::Verbose),
        2 => Some(LogLevel::Debug),
        _ => Some(LogLevel::Trace),
    };

    let filter = match level {
        Some(LogLevel::Error) => "capture_hal=error".to_string(),
        Some(LogLevel::Warn) => "capture_hal=warn".to_string(),
        Some(LogLevel::Info) => "capture_hal=info".to_string(),
        Some(LogLevel::Verbose) | Some(LogLevel::Debug) => "capture_hal=debug".to_string(),
        Some(LogLevel::Trace) => "capture_hal=trace".to_string(),
        None => format!("capture_hal={}", config.level),
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
