//! Ping/pong latency sampling
//!
//! Tracks at most one outstanding application-level `ping`. A matching
//! `pong` yields the round-trip time; a `pong` with nothing outstanding is
//! ignored.

use std::time::{Duration, Instant};

/// Round-trip sampler over the open channel
#[derive(Debug, Default)]
pub struct LatencySampler {
    /// Send time of the outstanding ping
    outstanding: Option<Instant>,
    /// Last measured round trip
    last: Option<Duration>,
    /// Pings sent since the sampler was created
    pings_sent: u64,
}

impl LatencySampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a ping is being sent at `now`.
    ///
    /// A previous unanswered ping is forgotten.
    #[inline]
    pub fn begin(&mut self, now: Instant) {
        self.outstanding = Some(now);
        self.pings_sent += 1;
    }

    /// Match a pong received at `now`. Returns the new latency sample.
    #[inline]
    pub fn complete(&mut self, now: Instant) -> Option<Duration> {
        let sent = self.outstanding.take()?;
        let rtt = now.saturating_duration_since(sent);
        self.last = Some(rtt);
        Some(rtt)
    }

    /// Drop the outstanding ping (transport went away)
    pub fn abandon(&mut self) {
        self.outstanding = None;
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn last(&self) -> Option<Duration> {
        self.last
    }

    pub fn pings_sent(&self) -> u64 {
        self.pings_sent
    }
}
