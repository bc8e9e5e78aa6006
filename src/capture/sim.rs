//! Simulated camera head.
//!
//! Produces deterministic synthetic sensor planes so the full pipeline can
//! run and be tested without hardware on the bus. Grabs are paced to the
//! configured frame rate and honor the start/stop state and grab timeout
//! the way a real head does.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use super::frame::{DataFormat, FrameMetadata, RawFrame, SensorImage};
use super::{Camera, CameraInfo, CaptureError, ColorMethod, NUM_SENSORS};
use crate::CaptureConfig;

pub struct SimCamera {
    info: CameraInfo,
    rows: u32,
    cols: u32,
    frame_interval: Duration,
    state: Mutex<SimState>,
}

struct SimState {
    streaming: Option<DataFormat>,
    sequence: u64,
    next_frame_at: Option<Instant>,
    grab_timeout: Duration,
    color_method: ColorMethod,
}

impl SimCamera {
    pub fn new(config: &CaptureConfig) -> Self {
        let frame_interval = if config.fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / config.fps
        };

        Self {
            info: CameraInfo {
                serial: 14_150_029,
                model: "HexEye 6S (simulated)".into(),
            },
            rows: config.rows,
            cols: config.cols,
            frame_interval,
            state: Mutex::new(SimState {
                streaming: None,
                sequence: 0,
                next_frame_at: None,
                grab_timeout: Duration::from_millis(config.grab_timeout_ms),
                color_method: config.color_method,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Synthetic sample for one raw pixel, stable across runs.
    fn sample(sequence: u64, sensor: usize, x: u32, y: u32) -> u8 {
        (x.wrapping_add(y)
            .wrapping_add(sequence as u32 * 7)
            .wrapping_add(sensor as u32 * 31)
            & 0xff) as u8
    }
}

impl Camera for SimCamera {
    fn info(&self) -> CameraInfo {
        self.info.clone()
    }

    fn start(&self, format: DataFormat) -> Result<(), CaptureError> {
        let mut state = self.lock();
        state.streaming = Some(format);
        state.next_frame_at = None;
        debug!(?format, method = ?state.color_method, "simulated camera streaming");
        Ok(())
    }

    fn stop(&self) -> Result<(), CaptureError> {
        self.lock().streaming = None;
        Ok(())
    }

    fn set_grab_timeout(&self, timeout: Duration) {
        self.lock().grab_timeout = timeout;
    }

    fn set_color_processing(&self, method: ColorMethod) {
        self.lock().color_method = method;
    }

    fn grab(&self) -> Result<RawFrame, CaptureError> {
        let (format, wait) = {
            let state = self.lock();
            let format = state.streaming.ok_or(CaptureError::NotStarted)?;
            let wait = state
                .next_frame_at
                .map(|due| due.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::ZERO);
            if wait > state.grab_timeout {
                return Err(CaptureError::Timeout(state.grab_timeout));
            }
            (format, wait)
        };

        // Pace outside the lock so concurrent convert calls are not held up.
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }

        let sequence = {
            let mut state = self.lock();
            state.sequence += 1;
            state.next_frame_at = Some(Instant::now() + self.frame_interval);
            state.sequence
        };

        let bytes_per_pixel = format.bytes_per_sensor_pixel();
        let plane_len = self.rows as usize * self.cols as usize * bytes_per_pixel;
        let mut data = Vec::with_capacity(plane_len * NUM_SENSORS);
        for sensor in 0..NUM_SENSORS {
            for y in 0..self.rows {
                for x in 0..self.cols {
                    let value = Self::sample(sequence, sensor, x, y);
                    match format {
                        DataFormat::Raw8 => data.push(value),
                        DataFormat::Raw16 => data.extend_from_slice(&[value, 0]),
                    }
                }
            }
        }

        Ok(RawFrame {
            data: Bytes::from(data),
            meta: Arc::new(FrameMetadata {
                sequence,
                rows: self.rows,
                cols: self.cols,
                format,
            }),
            timestamp: Instant::now(),
        })
    }

    fn convert(&self, frame: &RawFrame, out: &mut SensorImage) -> Result<(), CaptureError> {
        let sensor = out.sensor();
        if sensor >= NUM_SENSORS {
            return Err(CaptureError::BadSensor(sensor));
        }
        if out.width() != frame.meta.cols || out.height() != frame.meta.rows {
            return Err(CaptureError::Conversion {
                sensor,
                reason: format!(
                    "target geometry {}x{} does not match frame {}x{}",
                    out.width(),
                    out.height(),
                    frame.meta.cols,
                    frame.meta.rows
                ),
            });
        }

        let plane = frame
            .sensor_plane(sensor)
            .ok_or(CaptureError::BadSensor(sensor))?;

        // Gray expansion of the raw plane. Only the three color channels are
        // written; the fourth keeps its sentinel fill.
        let raw_pixel = frame.meta.format.bytes_per_sensor_pixel();
        let out_pixel = out.format().bytes_per_pixel();
        let dst = out.as_bytes_mut();
        for (i, px) in plane.chunks_exact(raw_pixel).enumerate() {
            let value = px[0];
            let o = i * out_pixel;
            dst[o] = value;
            dst[o + 1] = value;
            dst[o + 2] = value;
        }

        Ok(())
    }
}
