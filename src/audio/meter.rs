//! Per-frame level metering.
//!
//! Each frame the loop copies the analyser window into the graph-owned
//! sample buffer, asks an `RmsRoutine` for a level, and publishes it on a
//! watch channel. Cancellation is synchronous with respect to the
//! cooperative scheduler: once `cancel()` returns, no further computation
//! starts and nothing more is published.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::graph::AnalyserNode;

/// Default meter cadence (~60 fps).
pub const DEFAULT_FRAME: Duration = Duration::from_micros(16_667);

/// External routine turning a sample window into a displayable level.
#[async_trait]
pub trait RmsRoutine: Send + Sync {
    async fn compute_rms(&self, samples: &[f32]) -> anyhow::Result<f32>;
}

/// Handle to a running meter loop. Dropping it cancels the loop.
pub struct MeterLoop {
    cancelled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl MeterLoop {
    /// Spawn the loop. `buffer` is the reusable window owned by the graph.
    pub fn spawn(
        analyser: AnalyserNode,
        buffer: Arc<Mutex<Vec<f32>>>,
        routine: Arc<dyn RmsRoutine>,
        level: watch::Sender<f32>,
        frame: Duration,
    ) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::Acquire) {
                    break;
                }

                // Borrow the window out of the graph for the duration of the
                // computation; it goes back before the next frame.
                let mut window = match buffer.lock() {
                    Ok(mut b) => std::mem::take(&mut *b),
                    Err(e) => {
                        warn!("Meter buffer lock poisoned: {}", e);
                        break;
                    }
                };
                if window.is_empty() {
                    window.resize(analyser.fft_size(), 0.0);
                }
                if !analyser.get_float_time_domain_data(&mut window) {
                    debug!("Analyser released, meter loop exiting");
                    break;
                }

                let result = routine.compute_rms(&window).await;
                if let Ok(mut b) = buffer.lock() {
                    *b = window;
                }
                if flag.load(Ordering::Acquire) {
                    break;
                }

                match result {
                    Ok(rms) => {
                        let _ = level.send(rms);
                    }
                    Err(e) => warn!("RMS computation failed: {}", e),
                }
            }
        });
        Self { cancelled, handle }
    }

    /// Cancel the pending iteration. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.handle.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for MeterLoop {
    fn drop(&mut self) {
        self.cancel();
    }
}
