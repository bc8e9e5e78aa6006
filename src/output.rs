//! Encoded image persistence for converted sensor buffers.

use std::fs;
use std::path::{Path, PathBuf};

use image::{ExtendedColorType, ImageFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::capture::{PixelFormat, SensorImage};

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("could not create output directory {0}: {1}")]
    CreateDir(PathBuf, #[source] std::io::Error),

    #[error(transparent)]
    Encode(#[from] image::ImageError),
}

/// On-disk encoding for saved sensor images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    Jpeg,
    Png,
}

impl SaveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            SaveFormat::Jpeg => "jpg",
            SaveFormat::Png => "png",
        }
    }

    fn image_format(&self) -> ImageFormat {
        match self {
            SaveFormat::Jpeg => ImageFormat::Jpeg,
            SaveFormat::Png => ImageFormat::Png,
        }
    }
}

/// Writes converted sensor images into one output directory, one file per
/// sensor per frame.
pub struct ImageSaver {
    dir: PathBuf,
    format: SaveFormat,
    serial: u32,
}

impl ImageSaver {
    /// Creates the output directory if it does not exist yet.
    pub fn new(dir: PathBuf, format: SaveFormat, serial: u32) -> Result<Self, OutputError> {
        fs::create_dir_all(&dir).map_err(|e| OutputError::CreateDir(dir.clone(), e))?;
        Ok(Self {
            dir,
            format,
            serial,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Output file name embedding the frame index, device serial, and
    /// sensor index.
    pub fn path_for(&self, frame_index: u64, sensor: usize) -> PathBuf {
        self.dir.join(format!(
            "hexeye_frame{:03}_{}_camera_{:02}.{}",
            frame_index,
            self.serial,
            sensor,
            self.format.extension()
        ))
    }

    pub fn save(&self, image: &SensorImage, frame_index: u64) -> Result<PathBuf, OutputError> {
        let path = self.path_for(frame_index, image.sensor());
        let pixels = rgb_pixels(image);
        image::save_buffer_with_format(
            &path,
            &pixels,
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
            self.format.image_format(),
        )?;
        debug!(path = %path.display(), "wrote sensor image");
        Ok(path)
    }
}

/// Swizzle the converted buffer into the encoder's RGB channel order. The
/// fourth channel carries no image data and is dropped.
fn rgb_pixels(image: &SensorImage) -> Vec<u8> {
    let data = image.as_bytes();
    let mut rgb = Vec::with_capacity(data.len() / image.format().bytes_per_pixel() * 3);
    match image.format() {
        PixelFormat::Bgra8 => {
            for px in data.chunks_exact(4) {
                rgb.extend_from_slice(&[px[2], px[1], px[0]]);
            }
        }
        PixelFormat::Rgba8 => {
            for px in data.chunks_exact(4) {
                rgb.extend_from_slice(&[px[0], px[1], px[2]]);
            }
        }
        PixelFormat::Bgr8 => {
            for px in data.chunks_exact(3) {
                rgb.extend_from_slice(&[px[2], px[1], px[0]]);
            }
        }
    }
    rgb
}
