//! hexeye - six-sensor panoramic grab, save, and UDP streaming pipeline

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tracing::{info, warn};

use hexeye::capture::{Camera, SimCamera};
use hexeye::net::UdpStreamer;
use hexeye::output::ImageSaver;
use hexeye::pipeline::{grab, FanOut};
use hexeye::utils;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hexeye=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("hexeye launching...");

    // Load configuration (optional TOML path as the first argument)
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = hexeye::load_config(config_path.as_deref())?;
    hexeye::CONFIG.store(Arc::new(config.clone()));

    // Bring up the camera head; any failure here is fatal
    let camera: Arc<dyn Camera> = Arc::new(SimCamera::new(&config.capture));
    let device = camera.info();
    info!("starting {} ({})...", device.model, device.serial);
    camera.set_grab_timeout(Duration::from_millis(config.capture.grab_timeout_ms));
    camera.set_color_processing(config.capture.color_method);
    camera.start(config.capture.data_format)?;

    let saver = if config.output.enabled {
        let dir = config
            .output
            .directory
            .clone()
            .unwrap_or_else(utils::writeable_directory);
        info!(dir = %dir.display(), "saving sensor images");
        Some(Arc::new(ImageSaver::new(
            dir,
            config.output.format,
            device.serial,
        )?))
    } else {
        None
    };

    let streamer = if config.network.enabled {
        let streamer = UdpStreamer::from_config(&config.network)?;
        info!(dest = %streamer.dest(), mode = ?config.network.mode, "streaming sensor buffers");
        Some(Arc::new(streamer))
    } else {
        None
    };

    let fanout = Arc::new(FanOut::new(
        camera.clone(),
        config.capture.pixel_format,
        saver,
        streamer,
        config.pipeline.parallel,
    ));

    // Cooperative shutdown, checked between frames and between sensors
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    let summary = grab::run(
        camera.clone(),
        fanout.clone(),
        config.capture.grab_retries,
        config.pipeline.frame_count,
        shutdown,
    )
    .await;

    if let Err(err) = camera.stop() {
        warn!(%err, "camera stop failed");
    }

    let summary = summary?;
    let totals = fanout.totals();
    info!(
        frames = summary.frames,
        skipped = summary.skipped,
        saved = totals.images_saved,
        datagrams = totals.datagrams_sent,
        "done"
    );
    Ok(())
}
