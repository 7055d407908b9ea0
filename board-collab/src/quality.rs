//! Connection quality monitor.
//!
//! Round-trip samples are smoothed with an EWMA; loss is the ratio of
//! unanswered probes over a sliding window of the last [`LOSS_WINDOW`]
//! probes. The resulting class scales the awareness broadcast interval so a
//! degraded link carries fewer cursor frames.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::subscription::lock;

/// Number of probes considered for the loss ratio.
pub const LOSS_WINDOW: usize = 20;

/// Weight of a new RTT sample.
const EWMA_ALPHA: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
    Offline,
}

impl ConnectionQuality {
    /// Broadcast interval multiplier, in halves (2 = 1x).
    fn interval_halves(self) -> u32 {
        match self {
            ConnectionQuality::Excellent => 2,
            ConnectionQuality::Good => 3,
            ConnectionQuality::Poor => 9,
            ConnectionQuality::Offline => 15,
        }
    }
}

#[derive(Debug, Default)]
struct Samples {
    connected: bool,
    rtt_ms: Option<f64>,
    probes: VecDeque<bool>,
}

impl Samples {
    fn push_probe(&mut self, answered: bool) {
        if self.probes.len() == LOSS_WINDOW {
            self.probes.pop_front();
        }
        self.probes.push_back(answered);
    }

    fn loss_ratio(&self) -> f64 {
        if self.probes.is_empty() {
            return 0.0;
        }
        let lost = self.probes.iter().filter(|answered| !**answered).count();
        lost as f64 / self.probes.len() as f64
    }
}

/// Thread-safe link classifier shared by a transport and the awareness publisher.
#[derive(Debug)]
pub struct QualityMonitor {
    base_interval: Duration,
    samples: Mutex<Samples>,
}

impl QualityMonitor {
    /// `base_interval` is the broadcast interval on an excellent link.
    pub fn new(base_interval: Duration) -> Self {
        Self {
            base_interval,
            samples: Mutex::new(Samples::default()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        let mut samples = lock(&self.samples);
        if samples.connected != connected {
            log::debug!("Link {}", if connected { "up" } else { "down" });
        }
        samples.connected = connected;
        if !connected {
            samples.rtt_ms = None;
            samples.probes.clear();
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.samples).connected
    }

    /// Record an answered probe.
    pub fn record_rtt(&self, rtt: Duration) {
        let sample = rtt.as_secs_f64() * 1000.0;
        let mut samples = lock(&self.samples);
        samples.rtt_ms = Some(match samples.rtt_ms {
            Some(prev) => prev + EWMA_ALPHA * (sample - prev),
            None => sample,
        });
        samples.push_probe(true);
    }

    /// Record a probe that was never answered.
    pub fn record_loss(&self) {
        lock(&self.samples).push_probe(false);
    }

    pub fn latency_ms(&self) -> Option<u64> {
        lock(&self.samples).rtt_ms.map(|rtt| rtt.round() as u64)
    }

    pub fn loss_ratio(&self) -> f64 {
        lock(&self.samples).loss_ratio()
    }

    pub fn quality(&self) -> ConnectionQuality {
        let samples = lock(&self.samples);
        if !samples.connected {
            return ConnectionQuality::Offline;
        }
        let loss = samples.loss_ratio();
        match samples.rtt_ms {
            // No samples yet: assume a usable link.
            None if loss == 0.0 => ConnectionQuality::Good,
            Some(rtt) if rtt < 100.0 && loss < 0.02 => ConnectionQuality::Excellent,
            Some(rtt) if rtt < 300.0 && loss < 0.10 => ConnectionQuality::Good,
            None if loss < 0.10 => ConnectionQuality::Good,
            _ => ConnectionQuality::Poor,
        }
    }

    /// Minimum spacing between two awareness broadcasts.
    pub fn recommended_interval(&self) -> Duration {
        self.base_interval * self.quality().interval_halves() / 2
    }
}
