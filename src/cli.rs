// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands for camera operations
//!
//! This module provides command-line functionality for:
//! - Running the long-lived capture service
//! - Listing available cameras
//! - Taking photos
//! - Recording videos
//! - Streaming with a private device handle

use camkeeper::device::CameraSource;
use camkeeper::device::reset::{NoopReset, ResetFacility, UsbAuthorizedReset};
use camkeeper::device::virtual_dev::VirtualBackend;
use camkeeper::photo::PhotoMode;
use camkeeper::settings::{JsonFileSettings, SettingsProvider};
use camkeeper::stream::{StreamSession, StreamSource};
use camkeeper::timelapse::TimelapseScheduler;
use camkeeper::watchdog::{Monitored, Watchdog, WatchdogConfig};
use camkeeper::{CameraService, CaptureBackend, ServiceConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

/// Pick the capture backend: real hardware or the synthetic source
fn backend(use_virtual: bool) -> Arc<dyn CaptureBackend> {
    if use_virtual {
        return Arc::new(VirtualBackend::default());
    }
    #[cfg(target_os = "linux")]
    {
        Arc::new(camkeeper::device::v4l2::V4l2Backend::default())
    }
    #[cfg(not(target_os = "linux"))]
    {
        eprintln!("No V4L2 support on this platform, using the virtual backend");
        Arc::new(VirtualBackend::default())
    }
}

fn reset_facility(use_virtual: bool) -> Arc<dyn ResetFacility> {
    if use_virtual {
        Arc::new(NoopReset)
    } else {
        Arc::new(UsbAuthorizedReset::default())
    }
}

fn settings_provider(path: Option<PathBuf>) -> Arc<dyn SettingsProvider> {
    let path = path.unwrap_or_else(JsonFileSettings::default_path);
    Arc::new(JsonFileSettings::new(path))
}

fn service_for(
    source: CameraSource,
    output: Option<PathBuf>,
    settings: Option<PathBuf>,
    use_virtual: bool,
) -> CameraService {
    let config = ServiceConfig {
        source,
        output_dir: output.unwrap_or_else(|| ServiceConfig::default().output_dir),
        ..Default::default()
    };
    CameraService::new(backend(use_virtual), config, settings_provider(settings))
}

/// Run the capture service until interrupted
pub fn run_service(
    source: CameraSource,
    output: Option<PathBuf>,
    settings: Option<PathBuf>,
    use_virtual: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings_provider = settings_provider(settings.clone());
    let service = service_for(source.clone(), output, settings, use_virtual);

    service.start_stream()?;
    info!(%source, "streaming started");

    let watchdog = Watchdog::new(
        Arc::new(service.clone()) as Arc<dyn Monitored>,
        source,
        reset_facility(use_virtual),
        WatchdogConfig::default(),
    );
    watchdog.start();

    let timelapse = TimelapseScheduler::new(service.photo_coordinator(), settings_provider);
    timelapse.start();

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    })?;

    println!("camkeeper running, Ctrl-C to stop");
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        service.reap_finished_recordings();
    }

    println!("shutting down");
    timelapse.stop();
    watchdog.stop();
    service.shutdown();
    Ok(())
}

/// List video device nodes
pub fn list_cameras() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_os = "linux")]
    {
        let nodes = camkeeper::device::v4l2::enumerate_devices();
        if nodes.is_empty() {
            println!("No cameras found.");
            return Ok(());
        }
        println!("Available cameras:");
        for node in nodes {
            println!("  {}", node.display());
        }
    }
    #[cfg(not(target_os = "linux"))]
    println!("Camera enumeration requires Linux; the virtual backend is always available.");
    Ok(())
}

/// Take a single photo and print where it landed
pub fn take_photo(
    source: CameraSource,
    output: Option<PathBuf>,
    settings: Option<PathBuf>,
    use_virtual: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let service = service_for(source, output, settings, use_virtual);
    let path = service.capture_photo(PhotoMode::Manual)?;
    println!("Photo saved: {}", path.display());
    service.shutdown();
    Ok(())
}

/// Record a video for the given number of seconds
pub fn record_video(
    source: CameraSource,
    duration_secs: u64,
    output: Option<PathBuf>,
    settings: Option<PathBuf>,
    use_virtual: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let service = service_for(source, output, settings, use_virtual);
    service.start_stream()?;

    let id = service.start_recording(Duration::from_secs(duration_secs))?;
    println!("Recording for {}s...", duration_secs);

    // Wait for the task to run its course, with some slack for finalization
    let deadline = std::time::Instant::now() + Duration::from_secs(duration_secs + 10);
    while service.active_recordings() > 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(100));
    }
    let frames = service.stop_recording(id).unwrap_or(0);
    println!("Recording done, {} frames written", frames);

    service.shutdown();
    Ok(())
}

/// Stream with a private device handle, reporting frame statistics.
/// Useful for checking a camera without touching a running service.
pub fn run_stream(
    source: CameraSource,
    settings: Option<PathBuf>,
    use_virtual: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = StreamSession::new(
        "cli",
        StreamSource::Owned {
            backend: backend(use_virtual),
            source,
        },
    )
    .with_settings(settings_provider(settings));
    session.start();

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_handler.store(false, Ordering::SeqCst);
    })?;

    println!("streaming, Ctrl-C to stop");
    let mut last_report = std::time::Instant::now();
    while running.load(Ordering::SeqCst) && (session.is_running() || !session.has_failed()) {
        std::thread::sleep(Duration::from_millis(200));
        if last_report.elapsed() >= Duration::from_secs(5) {
            last_report = std::time::Instant::now();
            match session.get_frame() {
                Some(frame) => println!(
                    "{}x{}, last frame {}ms ago, {} retries",
                    frame.width,
                    frame.height,
                    frame.age().as_millis(),
                    session.retry_count()
                ),
                None => println!("no frames yet, {} retries", session.retry_count()),
            }
        }
    }

    if session.has_failed() {
        eprintln!("stream gave up after repeated failures");
    }
    session.stop();
    Ok(())
}
