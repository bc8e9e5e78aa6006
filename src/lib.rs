pub mod capture;
pub mod net;
pub mod output;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::capture::frame::{DataFormat, PixelFormat};
use crate::capture::ColorMethod;
use crate::net::TransmitMode;
use crate::output::SaveFormat;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Per-sensor image height.
    pub rows: u32,
    /// Per-sensor image width.
    pub cols: u32,
    pub fps: u32,
    pub data_format: DataFormat,
    pub pixel_format: PixelFormat,
    pub color_method: ColorMethod,
    pub grab_timeout_ms: u64,
    /// Acquisition attempts per frame cycle before the cycle is skipped.
    pub grab_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// One worker per sensor, joined per frame. `false` runs the sensors
    /// one after another on a single worker.
    pub parallel: bool,
    /// Stop after this many processed frames; 0 runs until shutdown.
    pub frame_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub enabled: bool,
    /// Defaults to the user's home directory when unset.
    pub directory: Option<PathBuf>,
    pub format: SaveFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Local bind port for outbound sockets; 0 picks an ephemeral port.
    pub source_port: u16,
    pub mode: TransmitMode,
    pub packet_size: usize,
    pub packet_delay_us: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                rows: 960,
                cols: 1280,
                fps: 10,
                data_format: DataFormat::Raw8,
                pixel_format: PixelFormat::Bgra8,
                color_method: ColorMethod::NearestNeighborFast,
                grab_timeout_ms: 3500,
                grab_retries: 10,
            },
            pipeline: PipelineConfig {
                parallel: true,
                frame_count: 10,
            },
            output: OutputConfig {
                enabled: true,
                directory: None,
                format: SaveFormat::Jpeg,
            },
            network: NetworkConfig {
                enabled: true,
                host: "127.0.0.1".into(),
                port: 10001,
                source_port: 0,
                mode: TransmitMode::Chunked,
                packet_size: 50_000,
                packet_delay_us: 500,
            },
        }
    }
}

/// Layer defaults, an optional TOML file, and `HEXEYE_`-prefixed environment
/// variables (e.g. `HEXEYE_NETWORK__PORT=9000`).
pub fn load_config(path: Option<&Path>) -> Result<Config, config::ConfigError> {
    let mut builder =
        config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path));
    }

    builder
        .add_source(config::Environment::with_prefix("HEXEYE").separator("__"))
        .build()?
        .try_deserialize()
}
