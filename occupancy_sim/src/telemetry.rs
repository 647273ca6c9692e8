//! Simulated telemetry feed with fault injection.

use async_trait::async_trait;
use occupancy_env::{EnvError, TelemetryController, TelemetrySample, TelemetrySource};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Shared fault state between the feed and its controller.
#[derive(Debug, Default)]
struct FaultState {
    stalled: AtomicBool,
    /// Dropout probability as f64 bits
    dropout_bits: AtomicU64,
}

impl FaultState {
    fn dropout_rate(&self) -> f64 {
        f64::from_bits(self.dropout_bits.load(Ordering::Relaxed))
    }
}

/// Producer side of the simulated feed, driven by the world.
pub struct SimTelemetryFeed {
    tx: mpsc::Sender<TelemetrySample>,
    faults: Arc<FaultState>,
    rng: Mutex<ChaCha8Rng>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl SimTelemetryFeed {
    /// Offers a sample; returns true if it entered the channel.
    ///
    /// Stalled feeds and dropouts swallow the sample; a full channel drops
    /// it (the drone never waits for a slow consumer).
    pub fn publish(&self, sample: TelemetrySample) -> bool {
        if self.faults.stalled.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let rate = self.faults.dropout_rate();
        if rate > 0.0 {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            if rng.gen::<f64>() < rate {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        match self.tx.try_send(sample) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer side of the simulated feed.
pub struct SimTelemetry {
    /// Receiver for incoming samples (behind tokio mutex for async)
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TelemetrySample>>>,
    received: AtomicU64,
}

impl SimTelemetry {
    /// Creates a feed/source/controller triple over a bounded channel.
    pub fn channel(
        capacity: usize,
        rng: ChaCha8Rng,
    ) -> (SimTelemetryFeed, SimTelemetry, SimTelemetryController) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let faults = Arc::new(FaultState::default());

        let feed = SimTelemetryFeed {
            tx,
            faults: Arc::clone(&faults),
            rng: Mutex::new(rng),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        };
        let source = SimTelemetry {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            received: AtomicU64::new(0),
        };
        (feed, source, SimTelemetryController { faults })
    }

    /// Takes every sample already queued, without waiting.
    pub fn drain(&self) -> Vec<TelemetrySample> {
        let mut samples = Vec::new();
        if let Ok(mut rx) = self.rx.try_lock() {
            while let Ok(sample) = rx.try_recv() {
                samples.push(sample);
            }
        }
        self.received
            .fetch_add(samples.len() as u64, Ordering::Relaxed);
        samples
    }
}

#[async_trait]
impl TelemetrySource for SimTelemetry {
    async fn recv(&self) -> Result<TelemetrySample, EnvError> {
        let mut rx = self.rx.lock().await;
        let sample = rx.recv().await.ok_or(EnvError::TelemetryClosed)?;
        self.received.fetch_add(1, Ordering::Relaxed);
        Ok(sample)
    }

    fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// Telemetry controller for fault injection.
#[derive(Clone)]
pub struct SimTelemetryController {
    faults: Arc<FaultState>,
}

impl SimTelemetryController {
    pub fn dropout_rate(&self) -> f64 {
        self.faults.dropout_rate()
    }
}

impl TelemetryController for SimTelemetryController {
    fn stall(&self) {
        self.faults.stalled.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.faults.stalled.store(false, Ordering::Release);
    }

    fn set_dropout_rate(&self, rate: f64) {
        let rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 };
        self.faults
            .dropout_bits
            .store(rate.to_bits(), Ordering::Relaxed);
    }

    fn is_stalled(&self) -> bool {
        self.faults.stalled.load(Ordering::Acquire)
    }
}
