use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Fill value for freshly allocated conversion buffers. Guarantees the
/// fourth channel reads as fully opaque even for pixel formats whose
/// conversion never writes it.
pub const CHANNEL_FILL: u8 = 0xff;

/// One synchronized multi-sensor capture cycle.
///
/// The buffer holds all six sensors' data; for the raw formats the layout is
/// sensor-major, one contiguous plane per sensor. The frame is shared by
/// reference during fan-out and returns to the allocator when the last
/// holder drops it.
#[derive(Clone)]
pub struct RawFrame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub rows: u32,
    pub cols: u32,
    pub format: DataFormat,
}

impl RawFrame {
    /// Borrow one sensor's raw plane. `None` if the index or the buffer
    /// geometry is off.
    pub fn sensor_plane(&self, sensor: usize) -> Option<&[u8]> {
        let plane = self.meta.rows as usize
            * self.meta.cols as usize
            * self.meta.format.bytes_per_sensor_pixel();
        let start = sensor.checked_mul(plane)?;
        self.data.get(start..start + plane)
    }
}

/// Raw transfer formats the camera head can stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFormat {
    Raw8,
    Raw16,
}

impl DataFormat {
    pub const fn bytes_per_sensor_pixel(&self) -> usize {
        match self {
            DataFormat::Raw8 => 1,
            DataFormat::Raw16 => 2,
        }
    }
}

/// Display pixel formats conversion can target.
///
/// For `Bgra8` and `Rgba8` the fourth channel is unused by conversion and
/// keeps the [`CHANNEL_FILL`] sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Bgra8,
    Rgba8,
    Bgr8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Bgr8 => 3,
        }
    }
}

/// One sensor's converted image, exclusively owned by the worker that
/// created it.
///
/// The buffer length is pinned to `rows * cols * bytes_per_pixel` at
/// construction and never changes afterwards.
pub struct SensorImage {
    sensor: usize,
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl SensorImage {
    /// Allocate a conversion target for one sensor, pre-filled with the
    /// opaque sentinel.
    pub fn new(sensor: usize, rows: u32, cols: u32, format: PixelFormat) -> Self {
        let len = rows as usize * cols as usize * format.bytes_per_pixel();
        Self {
            sensor,
            width: cols,
            height: rows,
            format,
            data: vec![CHANNEL_FILL; len],
        }
    }

    pub fn sensor(&self) -> usize {
        self.sensor
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_len_matches_geometry() {
        for (rows, cols) in [(1u32, 1u32), (4, 6), (960, 1280)] {
            for format in [PixelFormat::Bgra8, PixelFormat::Rgba8, PixelFormat::Bgr8] {
                let image = SensorImage::new(0, rows, cols, format);
                assert_eq!(
                    image.len(),
                    rows as usize * cols as usize * format.bytes_per_pixel()
                );
            }
        }
    }

    #[test]
    fn fresh_buffer_is_fully_opaque() {
        let image = SensorImage::new(2, 8, 8, PixelFormat::Bgra8);
        assert!(image.as_bytes().iter().all(|&b| b == CHANNEL_FILL));
    }

    #[test]
    fn sensor_planes_tile_the_frame() {
        let rows = 2u32;
        let cols = 3u32;
        let plane = (rows * cols) as usize;
        let data: Vec<u8> = (0..plane * 6).map(|i| (i / plane) as u8).collect();

        let frame = RawFrame {
            data: Bytes::from(data),
            meta: Arc::new(FrameMetadata {
                sequence: 1,
                rows,
                cols,
                format: DataFormat::Raw8,
            }),
            timestamp: Instant::now(),
        };

        for sensor in 0..6 {
            let plane = frame.sensor_plane(sensor).unwrap();
            assert!(plane.iter().all(|&b| b == sensor as u8));
        }
        assert!(frame.sensor_plane(6).is_none());
    }
}
