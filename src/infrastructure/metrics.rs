//! Metrics collection for the feed connection
//!
//! Lock-free counters using atomic operations. Updated by the state machine
//! as it runs, read through snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

/// `latency_us` value while no sample is held
const NO_SAMPLE: u64 = u64::MAX;

/// Feed metrics collector
pub struct FeedMetrics {
    /// Inbound frames received on a live transport
    messages: AtomicU64,
    /// Inbound frames dropped because they did not parse
    malformed: AtomicU64,
    /// Outbound payloads dropped while the transport was not open
    sends_dropped: AtomicU64,
    /// Reconnect attempts started
    reconnects: AtomicU64,
    /// Times synthetic mode was entered
    synthetic_activations: AtomicU64,
    /// Last latency sample in microseconds (`NO_SAMPLE` = none)
    latency_us: AtomicU64,
    /// Last inbound frame timestamp (Unix millis)
    last_message_time: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

/// Metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub messages: u64,
    pub malformed: u64,
    pub sends_dropped: u64,
    pub reconnects: u64,
    pub synthetic_activations: u64,
    pub latency_ms: Option<f64>,
    pub message_rate: f64, // messages per second
    pub uptime_seconds: u64,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self {
            messages: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            sends_dropped: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            synthetic_activations: AtomicU64::new(0),
            latency_us: AtomicU64::new(NO_SAMPLE),
            last_message_time: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    #[inline]
    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last_message_time.store(now, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_send_dropped(&self) {
        self.sends_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_synthetic_activation(&self) {
        self.synthetic_activations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_latency(&self, latency: Duration) {
        let us = latency.as_micros().min(u128::from(NO_SAMPLE - 1)) as u64;
        self.latency_us.store(us, Ordering::Relaxed);
    }

    /// Forget the last latency sample
    #[inline]
    pub fn clear_latency(&self) {
        self.latency_us.store(NO_SAMPLE, Ordering::Relaxed);
    }

    /// Milliseconds since the last inbound frame, `None` if nothing arrived yet
    pub fn idle_ms(&self) -> Option<u64> {
        let last = self.last_message_time.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Some(now.saturating_sub(last))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let messages = self.messages.load(Ordering::Relaxed);
        let uptime = self.start_time.elapsed().as_secs();
        let rate = if uptime > 0 {
            messages as f64 / uptime as f64
        } else {
            0.0
        };
        let latency_us = self.latency_us.load(Ordering::Relaxed);

        MetricsSnapshot {
            messages,
            malformed: self.malformed.load(Ordering::Relaxed),
            sends_dropped: self.sends_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            synthetic_activations: self.synthetic_activations.load(Ordering::Relaxed),
            latency_ms: (latency_us != NO_SAMPLE).then(|| latency_us as f64 / 1_000.0),
            message_rate: rate,
            uptime_seconds: uptime,
        }
    }
}

impl Default for FeedMetrics {
    fn default() -> Self {
        Self::new()
    }
}
