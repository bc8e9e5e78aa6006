//! Per-sensor fan-out: convert, persist, transmit.
//!
//! Each frame fans out to one worker per sensor. A worker allocates the
//! conversion buffer, asks the camera to fill it, then performs two
//! independent side effects: save to disk and send over UDP. A failure in
//! any step is contained to that sensor and step; the other sensors and the
//! other side effect proceed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use tokio::task::JoinSet;
use tracing::warn;

use crate::capture::{Camera, PixelFormat, RawFrame, SensorImage, NUM_SENSORS};
use crate::net::{SendStats, UdpStreamer};
use crate::output::ImageSaver;

pub struct FanOut {
    camera: Arc<dyn Camera>,
    pixel_format: PixelFormat,
    saver: Option<Arc<ImageSaver>>,
    streamer: Option<Arc<UdpStreamer>>,
    parallel: bool,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_processed: AtomicU64,
    images_converted: AtomicU64,
    conversion_failures: AtomicU64,
    images_saved: AtomicU64,
    save_failures: AtomicU64,
    datagrams_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_failures: AtomicU64,
}

/// Aggregated totals since startup.
#[derive(Debug, Clone, Copy)]
pub struct PipelineTotals {
    pub frames_processed: u64,
    pub images_converted: u64,
    pub conversion_failures: u64,
    pub images_saved: u64,
    pub save_failures: u64,
    pub datagrams_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
}

/// Outcome of one sensor worker for one frame.
#[derive(Debug)]
pub struct SensorReport {
    pub sensor: usize,
    pub converted: bool,
    pub saved: Option<PathBuf>,
    pub save_failed: bool,
    pub sent: Option<SendStats>,
    pub send_failed: bool,
}

#[derive(Debug)]
pub struct FrameReport {
    pub frame_index: u64,
    pub sequence: u64,
    /// One report per spawned sensor worker, ordered by sensor index.
    pub sensors: Vec<SensorReport>,
    pub elapsed: Duration,
}

/// Everything a sensor worker needs, cloned per spawn.
struct WorkerCtx {
    camera: Arc<dyn Camera>,
    frame: Arc<RawFrame>,
    pixel_format: PixelFormat,
    frame_index: u64,
    saver: Option<Arc<ImageSaver>>,
    streamer: Option<Arc<UdpStreamer>>,
}

impl FanOut {
    pub fn new(
        camera: Arc<dyn Camera>,
        pixel_format: PixelFormat,
        saver: Option<Arc<ImageSaver>>,
        streamer: Option<Arc<UdpStreamer>>,
        parallel: bool,
    ) -> Self {
        Self {
            camera,
            pixel_format,
            saver,
            streamer,
            parallel,
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn worker_ctx(&self, frame: Arc<RawFrame>, frame_index: u64) -> WorkerCtx {
        WorkerCtx {
            camera: self.camera.clone(),
            frame,
            pixel_format: self.pixel_format,
            frame_index,
            saver: self.saver.clone(),
            streamer: self.streamer.clone(),
        }
    }

    /// Process one frame: fan out to the sensor workers and wait for all of
    /// them. The raw frame buffer is released when the last worker drops
    /// its reference, before this returns.
    pub async fn process_frame(
        &self,
        frame: RawFrame,
        frame_index: u64,
        shutdown: &AtomicBool,
    ) -> FrameReport {
        let started = Instant::now();
        let sequence = frame.meta.sequence;
        let frame = Arc::new(frame);
        let (tx, rx) = flume::bounded::<SensorReport>(NUM_SENSORS);

        if self.parallel {
            let mut workers = JoinSet::new();
            for sensor in 0..NUM_SENSORS {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let ctx = self.worker_ctx(frame.clone(), frame_index);
                let tx = tx.clone();
                workers.spawn_blocking(move || {
                    let _ = tx.send(process_sensor(&ctx, sensor));
                });
            }
            drop(tx);
            // join barrier: the next frame is not acquired until every
            // sensor worker has finished
            while workers.join_next().await.is_some() {}
        } else {
            for sensor in 0..NUM_SENSORS {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let ctx = self.worker_ctx(frame.clone(), frame_index);
                let tx = tx.clone();
                let worker =
                    tokio::task::spawn_blocking(move || {
                        let _ = tx.send(process_sensor(&ctx, sensor));
                    });
                let _ = worker.await;
            }
            drop(tx);
        }

        let mut sensors: Vec<SensorReport> = rx.try_iter().collect();
        sensors.sort_by_key(|r| r.sensor);
        self.tally(&sensors);

        let elapsed = started.elapsed();
        metrics::histogram!("frame_process_ms").record(elapsed.as_millis() as f64);
        metrics::histogram!("frame_latency_ms")
            .record(frame.timestamp.elapsed().as_millis() as f64);

        FrameReport {
            frame_index,
            sequence,
            sensors,
            elapsed,
        }
    }

    fn tally(&self, sensors: &[SensorReport]) {
        self.stats.frames_processed.fetch_add(1, Ordering::Relaxed);
        for report in sensors {
            if report.converted {
                self.stats.images_converted.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats
                    .conversion_failures
                    .fetch_add(1, Ordering::Relaxed);
                metrics::counter!("conversion_failures").increment(1);
            }
            if report.saved.is_some() {
                self.stats.images_saved.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("images_saved").increment(1);
            }
            if report.save_failed {
                self.stats.save_failures.fetch_add(1, Ordering::Relaxed);
            }
            if let Some(sent) = report.sent {
                self.stats
                    .datagrams_sent
                    .fetch_add(sent.datagrams, Ordering::Relaxed);
                self.stats.bytes_sent.fetch_add(sent.bytes, Ordering::Relaxed);
                metrics::counter!("udp_datagrams").increment(sent.datagrams);
                metrics::counter!("udp_bytes").increment(sent.bytes);
            }
            if report.send_failed {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn totals(&self) -> PipelineTotals {
        PipelineTotals {
            frames_processed: self.stats.frames_processed.load(Ordering::Relaxed),
            images_converted: self.stats.images_converted.load(Ordering::Relaxed),
            conversion_failures: self.stats.conversion_failures.load(Ordering::Relaxed),
            images_saved: self.stats.images_saved.load(Ordering::Relaxed),
            save_failures: self.stats.save_failures.load(Ordering::Relaxed),
            datagrams_sent: self.stats.datagrams_sent.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
        }
    }
}

fn process_sensor(ctx: &WorkerCtx, sensor: usize) -> SensorReport {
    let mut report = SensorReport {
        sensor,
        converted: false,
        saved: None,
        save_failed: false,
        sent: None,
        send_failed: false,
    };

    let meta = &ctx.frame.meta;
    let mut image = SensorImage::new(sensor, meta.rows, meta.cols, ctx.pixel_format);

    if let Err(err) = ctx.camera.convert(&ctx.frame, &mut image) {
        warn!(sensor, %err, "conversion failed; sensor outputs skipped this frame");
        return report;
    }
    report.converted = true;

    if let Some(saver) = &ctx.saver {
        match saver.save(&image, ctx.frame_index) {
            Ok(path) => report.saved = Some(path),
            Err(err) => {
                report.save_failed = true;
                warn!(sensor, %err, "save failed");
            }
        }
    }

    // transmission is attempted regardless of the save outcome
    if let Some(streamer) = &ctx.streamer {
        match streamer.send(image.as_bytes()) {
            Ok(stats) => report.sent = Some(stats),
            Err(err) => {
                report.send_failed = true;
                warn!(sensor, %err, "transmit failed");
            }
        }
    }

    report
    // the converted buffer drops here, after both side effects
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::TransmitMode;
    use crate::output::SaveFormat;
    use crate::pipeline::testutil::MockCamera;

    fn fanout(
        camera: Arc<MockCamera>,
        saver: Option<Arc<ImageSaver>>,
        streamer: Option<Arc<UdpStreamer>>,
        parallel: bool,
    ) -> FanOut {
        FanOut::new(camera, PixelFormat::Bgra8, saver, streamer, parallel)
    }

    fn grab_one(camera: &MockCamera) -> RawFrame {
        camera.grab().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn every_sensor_yields_a_named_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let camera = Arc::new(MockCamera::new(4, 6));
        let saver = Arc::new(ImageSaver::new(dir.path().into(), SaveFormat::Png, 4242).unwrap());
        let fanout = fanout(camera.clone(), Some(saver), None, true);

        let shutdown = AtomicBool::new(false);
        let report = fanout
            .process_frame(grab_one(&camera), 0, &shutdown)
            .await;

        assert_eq!(report.sensors.len(), NUM_SENSORS);
        for (sensor, sensor_report) in report.sensors.iter().enumerate() {
            assert_eq!(sensor_report.sensor, sensor);
            assert!(sensor_report.converted);
            let name = sensor_report
                .saved
                .as_ref()
                .unwrap()
                .file_name()
                .unwrap()
                .to_str()
                .unwrap()
                .to_owned();
            assert!(name.contains("frame000"));
            assert!(name.contains(&format!("camera_{:02}", sensor)));
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), NUM_SENSORS);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn conversion_failure_on_one_sensor_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = MockCamera::new(4, 6);
        camera.fail_sensors = vec![3];
        let camera = Arc::new(camera);
        let saver = Arc::new(ImageSaver::new(dir.path().into(), SaveFormat::Png, 4242).unwrap());
        let fanout = fanout(camera.clone(), Some(saver), None, true);

        let shutdown = AtomicBool::new(false);
        let report = fanout
            .process_frame(grab_one(&camera), 0, &shutdown)
            .await;

        for sensor_report in &report.sensors {
            if sensor_report.sensor == 3 {
                assert!(!sensor_report.converted);
                assert!(sensor_report.saved.is_none());
            } else {
                assert!(sensor_report.converted);
                assert!(sensor_report.saved.is_some());
            }
        }
        assert_eq!(fanout.totals().conversion_failures, 1);
        assert_eq!(fanout.totals().images_saved, (NUM_SENSORS - 1) as u64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn save_failure_does_not_block_transmission() {
        let dir = tempfile::tempdir().unwrap();
        let saver = Arc::new(ImageSaver::new(dir.path().into(), SaveFormat::Png, 4242).unwrap());
        // pull the directory out from under the saver so every write fails
        std::fs::remove_dir_all(dir.path()).unwrap();

        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let streamer = Arc::new(UdpStreamer::new(
            receiver.local_addr().unwrap(),
            TransmitMode::Chunked,
        ));

        let camera = Arc::new(MockCamera::new(4, 6));
        let fanout = fanout(camera.clone(), Some(saver), Some(streamer), true);

        let shutdown = AtomicBool::new(false);
        let report = fanout
            .process_frame(grab_one(&camera), 0, &shutdown)
            .await;

        for sensor_report in &report.sensors {
            assert!(sensor_report.save_failed);
            assert!(sensor_report.sent.is_some());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn parallel_pool_beats_the_sum_of_sensor_times() {
        let mut camera = MockCamera::new(4, 6);
        camera.convert_delay = Duration::from_millis(60);
        let camera = Arc::new(camera);
        let fanout = fanout(camera.clone(), None, None, true);

        let shutdown = AtomicBool::new(false);
        let report = fanout
            .process_frame(grab_one(&camera), 0, &shutdown)
            .await;

        let serial_floor = camera.convert_delay * NUM_SENSORS as u32;
        assert!(
            report.elapsed < serial_floor,
            "parallel frame took {:?}, serial floor is {:?}",
            report.elapsed,
            serial_floor
        );
    }
}
