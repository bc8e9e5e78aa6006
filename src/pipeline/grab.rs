//! Frame acquisition loop.
//!
//! Pulls one frame per cycle from the camera and hands it to fan-out with a
//! synchronous per-frame barrier, so frames are always processed in
//! acquisition order. Transient grab failures are retried back-to-back up
//! to the configured budget; an exhausted budget skips the cycle. Hard
//! failures (disconnect, not started) propagate and end the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::fanout::FanOut;
use crate::capture::{Camera, CaptureError, RawFrame};

/// Totals for one loop run.
#[derive(Debug, Default, Clone, Copy)]
pub struct GrabSummary {
    pub frames: u64,
    pub skipped: u64,
}

pub async fn run(
    camera: Arc<dyn Camera>,
    fanout: Arc<FanOut>,
    retries: u32,
    frame_budget: u64,
    shutdown: Arc<AtomicBool>,
) -> Result<GrabSummary, CaptureError> {
    let mut summary = GrabSummary::default();

    while !shutdown.load(Ordering::Relaxed) {
        if frame_budget != 0 && summary.frames >= frame_budget {
            break;
        }

        match acquire(camera.clone(), retries).await? {
            Some(frame) => {
                metrics::counter!("frames_grabbed").increment(1);
                let report = fanout
                    .process_frame(frame, summary.frames, &shutdown)
                    .await;
                debug!(
                    frame = report.frame_index,
                    sequence = report.sequence,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "frame processed"
                );
                summary.frames += 1;
            }
            None => {
                metrics::counter!("frames_skipped").increment(1);
                summary.skipped += 1;
            }
        }
    }

    info!(
        frames = summary.frames,
        skipped = summary.skipped,
        "grab loop finished"
    );
    Ok(summary)
}

/// One acquisition cycle: up to `retries` back-to-back attempts. `None`
/// means the cycle was skipped.
async fn acquire(
    camera: Arc<dyn Camera>,
    retries: u32,
) -> Result<Option<RawFrame>, CaptureError> {
    tokio::task::spawn_blocking(move || {
        for attempt in 1..=retries.max(1) {
            match camera.grab() {
                Ok(frame) => return Ok(Some(frame)),
                Err(err) if err.is_transient() => {
                    debug!(attempt, %err, "grab attempt failed");
                }
                Err(err) => return Err(err),
            }
        }
        warn!(retries, "all grab attempts failed; skipping this frame cycle");
        Ok(None)
    })
    .await
    .map_err(|e| CaptureError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::pipeline::testutil::MockCamera;

    fn fanout_for(camera: &Arc<MockCamera>) -> Arc<FanOut> {
        Arc::new(FanOut::new(
            camera.clone(),
            PixelFormat::Bgra8,
            None,
            None,
            true,
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exhausted_retries_skip_the_cycle_and_the_loop_recovers() {
        let camera = Arc::new(MockCamera::new(2, 3));
        camera.fail_grabs.store(10, Ordering::Relaxed);
        let fanout = fanout_for(&camera);
        let shutdown = Arc::new(AtomicBool::new(false));

        let summary = run(camera.clone(), fanout, 10, 1, shutdown)
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.frames, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn disconnect_ends_the_loop_with_an_error() {
        let camera = Arc::new(MockCamera::new(2, 3));
        camera.disconnected.store(true, Ordering::Relaxed);
        let fanout = fanout_for(&camera);
        let shutdown = Arc::new(AtomicBool::new(false));

        let result = run(camera.clone(), fanout, 10, 0, shutdown).await;
        assert!(matches!(result, Err(CaptureError::Disconnected)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn raised_shutdown_flag_stops_before_the_next_grab() {
        let camera = Arc::new(MockCamera::new(2, 3));
        let fanout = fanout_for(&camera);
        let shutdown = Arc::new(AtomicBool::new(true));

        let summary = run(camera.clone(), fanout, 10, 0, shutdown)
            .await
            .unwrap();
        assert_eq!(summary.frames, 0);
    }
}
