//! Connection lifecycle state machine
//!
//! Sans-IO: every stimulus (caller request, probe answer, transport event,
//! timer fire) enters through [`FeedMachine::handle`], which mutates the
//! state and returns the [`Command`]s the driver must execute. No clocks,
//! sockets or tasks live here, so every transition is unit-testable.
//!
//! Probe and transport attempts carry increasing ids and timers carry
//! tokens; inputs that refer to anything but the live attempt are ignored.

use crate::feed::state::{ConnectionState, FailureKind, FeedEvent, FeedStatus, ProbeOutcome};
use crate::feed::synthetic::SyntheticFeed;
use crate::feed::timers::{TimerKind, TimerOp, TimerSlots, TimerToken};
use crate::infrastructure::config::FeedConfig;
use crate::infrastructure::metrics::FeedMetrics;
use crate::ws::connection::NORMAL_CLOSURE;
use crate::ws::ping::LatencySampler;
use crate::ws::protocol::{iso_timestamp, parse_inbound, InboundMessage, OutboundMessage};
use crate::ws::subscription::SubscriptionSet;
use serde_json::Value;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identity of one health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId(pub u64);

/// Identity of one transport attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(pub u64);

/// Timing and retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub probe_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub ping_interval: Duration,
    pub synthetic_interval: Duration,
    pub synthetic_latency_ms: Range<u64>,
}

impl Policy {
    /// Delay before reconnect number `attempts` (0-based):
    /// `min(base * 2^attempts, cap)`
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.reconnect_base_delay
            .saturating_mul(factor)
            .min(self.reconnect_max_delay)
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::from(&FeedConfig::default())
    }
}

impl From<&FeedConfig> for Policy {
    fn from(config: &FeedConfig) -> Self {
        Self {
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(config.reconnect_max_delay_ms),
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            synthetic_interval: Duration::from_millis(config.synthetic_interval_ms),
            synthetic_latency_ms: config.synthetic_latency_min_ms..config.synthetic_latency_max_ms,
        }
    }
}

/// Stimulus delivered to the machine
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Connect,
    Disconnect,
    /// Disconnect and forget all subscriptions
    Shutdown,
    Subscribe(String),
    Unsubscribe(String),
    Send(Value),
    ProbeFinished {
        probe: ProbeId,
        outcome: ProbeOutcome,
    },
    TransportOpened {
        transport: TransportId,
    },
    TransportClosed {
        transport: TransportId,
        code: Option<u16>,
    },
    TransportMessage {
        transport: TransportId,
        text: String,
    },
    TimerFired {
        kind: TimerKind,
        token: TimerToken,
    },
}

/// Side effect requested by the machine
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartProbe {
        probe: ProbeId,
        timeout: Duration,
    },
    OpenTransport {
        transport: TransportId,
    },
    /// Close (or abandon, if still opening) the transport
    CloseTransport {
        transport: TransportId,
        code: u16,
    },
    Send {
        transport: TransportId,
        text: String,
    },
    Timer(TimerOp),
    Emit(FeedEvent),
}

/// State with the data only that state needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Probing { probe: ProbeId },
    Connecting { transport: TransportId },
    Connected { transport: TransportId },
    /// Waiting for the reconnect timer
    Disconnected,
    Error,
    Synthetic,
}

impl Phase {
    fn state(self) -> ConnectionState {
        match self {
            Phase::Idle => ConnectionState::Idle,
            Phase::Probing { .. } => ConnectionState::Probing,
            Phase::Connecting { .. } => ConnectionState::Connecting,
            Phase::Connected { .. } => ConnectionState::Connected,
            Phase::Disconnected => ConnectionState::Disconnected,
            Phase::Error => ConnectionState::Error,
            Phase::Synthetic => ConnectionState::SyntheticMode,
        }
    }

    /// Transport this phase owns, if any
    fn transport(self) -> Option<TransportId> {
        match self {
            Phase::Connecting { transport } | Phase::Connected { transport } => Some(transport),
            _ => None,
        }
    }
}

/// The connection manager's state machine
pub struct FeedMachine {
    policy: Policy,
    phase: Phase,
    timers: TimerSlots,
    subscriptions: SubscriptionSet,
    sampler: LatencySampler,
    synthetic: SyntheticFeed,
    metrics: Arc<FeedMetrics>,
    latency: Option<Duration>,
    reconnect_attempts: u32,
    next_probe: u64,
    next_transport: u64,
    out: Vec<Command>,
}

impl FeedMachine {
    pub fn new(policy: Policy, metrics: Arc<FeedMetrics>) -> Self {
        let synthetic = SyntheticFeed::new(policy.synthetic_latency_ms.clone());
        Self::with_synthetic(policy, synthetic, metrics)
    }

    pub fn with_synthetic(
        policy: Policy,
        synthetic: SyntheticFeed,
        metrics: Arc<FeedMetrics>,
    ) -> Self {
        Self {
            policy,
            phase: Phase::Idle,
            timers: TimerSlots::new(),
            subscriptions: SubscriptionSet::new(),
            sampler: LatencySampler::new(),
            synthetic,
            metrics,
            latency: None,
            reconnect_attempts: 0,
            next_probe: 0,
            next_transport: 0,
            out: Vec::new(),
        }
    }

    /// The single transition function
    pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Command> {
        match input {
            Input::Connect => self.on_connect(),
            Input::Disconnect => self.on_disconnect(),
            Input::Shutdown => {
                self.on_disconnect();
                self.subscriptions.clear();
                self.synthetic.retain(|_| false);
            }
            Input::Subscribe(symbol) => self.on_subscribe(&symbol),
            Input::Unsubscribe(symbol) => self.on_unsubscribe(&symbol),
            Input::Send(payload) => self.on_send(payload),
            Input::ProbeFinished { probe, outcome } => self.on_probe_finished(probe, outcome),
            Input::TransportOpened { transport } => self.on_transport_opened(transport),
            Input::TransportClosed { transport, code } => self.on_transport_closed(transport, code),
            Input::TransportMessage { transport, text } => self.on_message(transport, &text, now),
            Input::TimerFired { kind, token } => self.on_timer(kind, token, now),
        }
        std::mem::take(&mut self.out)
    }

    // ---- caller requests ----

    fn on_connect(&mut self) {
        if matches!(
            self.phase,
            Phase::Probing { .. } | Phase::Connecting { .. } | Phase::Connected { .. }
        ) {
            tracing::debug!(target: "feed", state = %self.state(), "connect ignored, attempt in progress");
            return;
        }

        self.cancel_all_timers();
        self.reconnect_attempts = 0;
        if self.phase == Phase::Synthetic {
            // Synthetic samples must not outlive synthetic mode
            self.clear_latency();
        }
        self.begin_probe();
    }

    fn on_disconnect(&mut self) {
        self.cancel_all_timers();
        if let Some(transport) = self.phase.transport() {
            self.out.push(Command::CloseTransport {
                transport,
                code: NORMAL_CLOSURE,
            });
        }
        self.sampler.abandon();
        self.reconnect_attempts = 0;
        self.clear_latency();
        self.set_phase(Phase::Idle);
    }

    fn on_subscribe(&mut self, symbol: &str) {
        if !self.subscriptions.insert(symbol) {
            return;
        }
        tracing::debug!(target: "feed", symbol, "subscribed");
        if let Phase::Connected { transport } = self.phase {
            self.send(transport, OutboundMessage::subscribe(symbol).to_text());
        }
    }

    fn on_unsubscribe(&mut self, symbol: &str) {
        if !self.subscriptions.remove(symbol) {
            return;
        }
        tracing::debug!(target: "feed", symbol, "unsubscribed");
        let subscriptions = &self.subscriptions;
        self.synthetic.retain(|s| subscriptions.contains(s));
        if let Phase::Connected { transport } = self.phase {
            self.send(transport, OutboundMessage::unsubscribe(symbol).to_text());
        }
    }

    fn on_send(&mut self, payload: Value) {
        match self.phase {
            Phase::Connected { transport } => self.send(transport, payload.to_string()),
            _ => {
                self.metrics.record_send_dropped();
                tracing::debug!(target: "feed", state = %self.state(), "send dropped, transport not open");
            }
        }
    }

    // ---- probe ----

    fn begin_probe(&mut self) {
        self.next_probe += 1;
        let probe = ProbeId(self.next_probe);
        self.set_phase(Phase::Probing { probe });
        self.out.push(Command::StartProbe {
            probe,
            timeout: self.policy.probe_timeout,
        });
        self.arm(TimerKind::ProbeTimeout, self.policy.probe_timeout);
    }

    fn on_probe_finished(&mut self, probe: ProbeId, outcome: ProbeOutcome) {
        if self.phase != (Phase::Probing { probe }) {
            return;
        }
        self.cancel_timer(TimerKind::ProbeTimeout);

        match outcome {
            ProbeOutcome::Reachable => self.begin_connecting(),
            ProbeOutcome::Ambiguous => {
                self.report(FailureKind::ProbeAmbiguous);
                self.begin_connecting();
            }
            ProbeOutcome::Negative => {
                tracing::warn!(target: "feed", "health probe reports server absent, skipping handshake");
                self.report(FailureKind::ProbeNegative);
                self.enter_synthetic();
            }
        }
    }

    // ---- transport ----

    fn begin_connecting(&mut self) {
        self.next_transport += 1;
        let transport = TransportId(self.next_transport);
        self.set_phase(Phase::Connecting { transport });
        self.out.push(Command::OpenTransport { transport });
        self.arm(TimerKind::ConnectTimeout, self.policy.connect_timeout);
    }

    fn on_transport_opened(&mut self, transport: TransportId) {
        if self.phase != (Phase::Connecting { transport }) {
            // Opened after we gave up on it
            self.out.push(Command::CloseTransport {
                transport,
                code: NORMAL_CLOSURE,
            });
            return;
        }

        self.cancel_timer(TimerKind::ConnectTimeout);
        self.reconnect_attempts = 0;
        self.sampler.abandon();
        self.set_phase(Phase::Connected { transport });

        let replay = self.subscriptions.begin_replay();
        if !replay.is_empty() {
            tracing::info!(target: "feed", count = replay.len(), "replaying subscriptions");
        }
        for symbol in replay {
            self.send(transport, OutboundMessage::subscribe(&symbol).to_text());
        }

        self.arm(TimerKind::Ping, self.policy.ping_interval);
    }

    fn on_transport_closed(&mut self, transport: TransportId, code: Option<u16>) {
        match self.phase {
            Phase::Connecting { transport: live } if live == transport => {
                self.cancel_timer(TimerKind::ConnectTimeout);
                tracing::warn!(target: "feed", ?code, "transport failed before opening");
                self.report(FailureKind::AbnormalClose);
                self.fail_attempt();
            }
            Phase::Connected { transport: live } if live == transport => {
                self.cancel_timer(TimerKind::Ping);
                self.sampler.abandon();

                if code == Some(NORMAL_CLOSURE) {
                    tracing::info!(target: "feed", "server closed the session normally");
                    self.set_phase(Phase::Disconnected);
                    self.enter_synthetic();
                } else {
                    tracing::warn!(target: "feed", ?code, "transport closed abnormally");
                    self.report(FailureKind::AbnormalClose);
                    self.set_phase(Phase::Disconnected);
                    self.retry_or_fallback();
                }
            }
            _ => {}
        }
    }

    fn on_message(&mut self, transport: TransportId, text: &str, now: Instant) {
        if self.phase != (Phase::Connected { transport }) {
            return;
        }
        self.metrics.record_message();

        let message = match parse_inbound(text) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.record_malformed();
                tracing::debug!(target: "feed", error = %e, "dropping malformed message");
                self.report(FailureKind::MalformedMessage);
                return;
            }
        };

        match message {
            InboundMessage::Pong { .. } => match self.sampler.complete(now) {
                Some(latency) => self.record_latency(latency, false),
                None => tracing::debug!(target: "feed", "unsolicited pong ignored"),
            },
            InboundMessage::MarketDataUpdate {
                symbol,
                data,
                timestamp,
            } => self.emit(FeedEvent::MarketData {
                symbol,
                data,
                timestamp,
                synthetic: false,
            }),
            InboundMessage::SubscriptionResponse { symbol, success } => {
                let success = success.unwrap_or(true);
                self.subscriptions.acknowledge(&symbol, success);
                self.emit(FeedEvent::SubscriptionAck { symbol, success });
            }
            InboundMessage::UnsubscriptionResponse { symbol, success } => {
                self.emit(FeedEvent::UnsubscriptionAck {
                    symbol,
                    success: success.unwrap_or(true),
                });
            }
            InboundMessage::Unknown => {
                tracing::trace!(target: "feed", "unrecognized message type dropped");
            }
        }
    }

    // ---- timers ----

    fn on_timer(&mut self, kind: TimerKind, token: TimerToken, now: Instant) {
        if !self.timers.fire(kind, token) {
            return;
        }

        match (kind, self.phase) {
            (TimerKind::ProbeTimeout, Phase::Probing { .. }) => {
                tracing::debug!(target: "feed", "health probe timed out");
                self.report(FailureKind::ProbeAmbiguous);
                self.begin_connecting();
            }
            (TimerKind::ConnectTimeout, Phase::Connecting { transport }) => {
                tracing::warn!(target: "feed", timeout = ?self.policy.connect_timeout, "handshake timed out");
                self.out.push(Command::CloseTransport {
                    transport,
                    code: NORMAL_CLOSURE,
                });
                self.report(FailureKind::HandshakeTimeout);
                self.fail_attempt();
            }
            (TimerKind::Reconnect, Phase::Disconnected) => {
                tracing::info!(target: "feed", attempt = self.reconnect_attempts, "reconnecting");
                self.metrics.record_reconnect();
                self.begin_connecting();
            }
            (TimerKind::Ping, Phase::Connected { transport }) => {
                self.sampler.begin(now);
                self.send(transport, OutboundMessage::ping().to_text());
                self.arm(TimerKind::Ping, self.policy.ping_interval);
            }
            (TimerKind::SyntheticTick, Phase::Synthetic) => {
                self.synthetic_tick();
                self.arm(TimerKind::SyntheticTick, self.policy.synthetic_interval);
            }
            (kind, phase) => {
                tracing::debug!(target: "feed", ?kind, ?phase, "timer fired outside its state");
            }
        }
    }

    // ---- recovery policy ----

    /// Attempt failed while connecting (timeout or early close)
    fn fail_attempt(&mut self) {
        self.set_phase(Phase::Error);
        if self.reconnect_attempts == 0 {
            // Cold start: no server rather than a blip
            self.enter_synthetic();
        } else {
            self.retry_or_fallback();
        }
    }

    fn retry_or_fallback(&mut self) {
        if self.reconnect_attempts >= self.policy.max_reconnect_attempts {
            tracing::warn!(target: "feed", attempts = self.reconnect_attempts, "reconnect attempts exhausted");
            self.enter_synthetic();
            return;
        }

        let delay = self.policy.backoff(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        self.set_phase(Phase::Disconnected);
        tracing::info!(target: "feed", ?delay, attempt = self.reconnect_attempts, "scheduling reconnect");
        self.arm(TimerKind::Reconnect, delay);
    }

    fn enter_synthetic(&mut self) {
        self.cancel_all_timers();
        self.sampler.abandon();
        self.set_phase(Phase::Synthetic);
        self.metrics.record_synthetic_activation();
        // First reading right away so the UI never shows an empty value
        self.synthetic_tick();
        self.arm(TimerKind::SyntheticTick, self.policy.synthetic_interval);
    }

    fn synthetic_tick(&mut self) {
        let latency = self.synthetic.sample_latency();
        self.record_latency(latency, true);

        for symbol in self.subscriptions.symbols() {
            let data = self.synthetic.next_quote(&symbol);
            self.emit(FeedEvent::MarketData {
                symbol,
                data,
                timestamp: Some(iso_timestamp()),
                synthetic: true,
            });
        }
    }

    // ---- helpers ----

    fn set_phase(&mut self, next: Phase) {
        let from = self.phase.state();
        self.phase = next;
        let to = next.state();
        if from != to {
            tracing::info!(target: "feed", %from, %to, "connection state changed");
            self.emit(FeedEvent::StateChanged { from, to });
        }
    }

    fn record_latency(&mut self, latency: Duration, synthetic: bool) {
        self.latency = Some(latency);
        self.metrics.set_latency(latency);
        self.emit(FeedEvent::LatencyUpdated { latency, synthetic });
    }

    fn clear_latency(&mut self) {
        self.latency = None;
        self.metrics.clear_latency();
    }

    fn send(&mut self, transport: TransportId, text: String) {
        self.out.push(Command::Send { transport, text });
    }

    fn emit(&mut self, event: FeedEvent) {
        self.out.push(Command::Emit(event));
    }

    fn report(&mut self, kind: FailureKind) {
        self.emit(FeedEvent::Failure(kind));
    }

    fn arm(&mut self, kind: TimerKind, after: Duration) {
        let mut ops = Vec::with_capacity(2);
        self.timers.replace(kind, after, &mut ops);
        self.out.extend(ops.into_iter().map(Command::Timer));
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        let mut ops = Vec::with_capacity(1);
        self.timers.cancel(kind, &mut ops);
        self.out.extend(ops.into_iter().map(Command::Timer));
    }

    fn cancel_all_timers(&mut self) {
        let mut ops = Vec::with_capacity(TimerKind::COUNT);
        self.timers.cancel_all(&mut ops);
        self.out.extend(ops.into_iter().map(Command::Timer));
    }

    // ---- observers ----

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.phase.state()
    }

    #[inline]
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    #[inline]
    pub fn is_synthetic_mode(&self) -> bool {
        self.phase == Phase::Synthetic
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn subscriptions(&self) -> &SubscriptionSet {
        &self.subscriptions
    }

    pub fn outstanding_timers(&self) -> usize {
        self.timers.outstanding()
    }

    pub fn is_timer_armed(&self, kind: TimerKind) -> bool {
        self.timers.is_armed(kind)
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn status(&self) -> FeedStatus {
        FeedStatus {
            state: self.state(),
            latency: self.latency,
            reconnect_attempts: self.reconnect_attempts,
            subscriptions: self.subscriptions.symbols(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::subscription::SubscriptionStatus;
    use proptest::prelude::*;
    use std::collections::HashMap;

    /// Drives the machine and remembers the ids/tokens it handed out
    struct Harness {
        machine: FeedMachine,
        now: Instant,
        probe: Option<ProbeId>,
        transport: Option<TransportId>,
        tokens: HashMap<TimerKind, (TimerToken, Duration)>,
        log: Vec<Command>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_policy(Policy::default())
        }

        fn with_policy(policy: Policy) -> Self {
            let synthetic = SyntheticFeed::seeded(11, policy.synthetic_latency_ms.clone());
            Self {
                machine: FeedMachine::with_synthetic(policy, synthetic, Arc::new(FeedMetrics::new())),
                now: Instant::now(),
                probe: None,
                transport: None,
                tokens: HashMap::new(),
                log: Vec::new(),
            }
        }

        fn input(&mut self, input: Input) -> Vec<Command> {
            let commands = self.machine.handle(input, self.now);
            for command in &commands {
                match command {
                    Command::StartProbe { probe, .. } => self.probe = Some(*probe),
                    Command::OpenTransport { transport } => self.transport = Some(*transport),
                    Command::Timer(TimerOp::Arm { kind, token, after }) => {
                        self.tokens.insert(*kind, (*token, *after));
                    }
                    Command::Timer(TimerOp::Cancel { kind }) => {
                        self.tokens.remove(kind);
                    }
                    _ => {}
                }
            }
            self.log.extend(commands.iter().cloned());
            commands
        }

        fn connect(&mut self) -> Vec<Command> {
            self.input(Input::Connect)
        }

        fn probe(&mut self, outcome: ProbeOutcome) -> Vec<Command> {
            let probe = self.probe.expect("no probe started");
            self.input(Input::ProbeFinished { probe, outcome })
        }

        fn open(&mut self) -> Vec<Command> {
            let transport = self.transport.expect("no transport opened");
            self.input(Input::TransportOpened { transport })
        }

        fn close(&mut self, code: Option<u16>) -> Vec<Command> {
            let transport = self.transport.expect("no transport opened");
            self.input(Input::TransportClosed { transport, code })
        }

        fn message(&mut self, text: &str) -> Vec<Command> {
            let transport = self.transport.expect("no transport opened");
            self.input(Input::TransportMessage {
                transport,
                text: text.to_string(),
            })
        }

        /// Fire the live timer of `kind`, advancing the clock by its delay
        fn fire(&mut self, kind: TimerKind) -> Vec<Command> {
            let (token, after) = *self.tokens.get(&kind).expect("timer not armed");
            self.tokens.remove(&kind);
            self.now += after;
            self.input(Input::TimerFired { kind, token })
        }

        fn connected(&mut self) {
            self.connect();
            self.probe(ProbeOutcome::Reachable);
            self.open();
            assert_eq!(self.machine.state(), ConnectionState::Connected);
        }

        fn state(&self) -> ConnectionState {
            self.machine.state()
        }
    }

    fn sent_texts(commands: &[Command]) -> Vec<Value> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Send { text, .. } => serde_json::from_str(text).ok(),
                _ => None,
            })
            .collect()
    }

    fn subscribes_for(commands: &[Command], symbol: &str) -> usize {
        sent_texts(commands)
            .iter()
            .filter(|v| v["type"] == "subscribe" && v["symbol"] == symbol)
            .count()
    }

    fn states(commands: &[Command]) -> Vec<ConnectionState> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Emit(FeedEvent::StateChanged { to, .. }) => Some(*to),
                _ => None,
            })
            .collect()
    }

    fn opens(commands: &[Command]) -> usize {
        commands
            .iter()
            .filter(|c| matches!(c, Command::OpenTransport { .. }))
            .count()
    }

    #[test]
    fn test_connect_starts_probe() {
        let mut h = Harness::new();
        let commands = h.connect();

        assert_eq!(h.state(), ConnectionState::Probing);
        assert!(commands.iter().any(|c| matches!(
            c,
            Command::StartProbe { timeout, .. } if *timeout == Duration::from_millis(300)
        )));
        assert!(h.machine.is_timer_armed(TimerKind::ProbeTimeout));
    }

    #[test]
    fn test_probe_reachable_opens_transport() {
        let mut h = Harness::new();
        h.connect();
        let commands = h.probe(ProbeOutcome::Reachable);

        assert_eq!(h.state(), ConnectionState::Connecting);
        assert_eq!(opens(&commands), 1);
        assert!(!h.machine.is_timer_armed(TimerKind::ProbeTimeout));
        assert_eq!(h.tokens[&TimerKind::ConnectTimeout].1, Duration::from_millis(1200));
    }

    #[test]
    fn test_probe_ambiguous_still_attempts() {
        let mut h = Harness::new();
        h.connect();
        let commands = h.probe(ProbeOutcome::Ambiguous);

        assert_eq!(h.state(), ConnectionState::Connecting);
        assert_eq!(opens(&commands), 1);
    }

    #[test]
    fn test_probe_timeout_still_attempts() {
        let mut h = Harness::new();
        h.connect();
        let commands = h.fire(TimerKind::ProbeTimeout);

        assert_eq!(h.state(), ConnectionState::Connecting);
        assert_eq!(opens(&commands), 1);

        // Late answer from the abandoned probe changes nothing
        let late = h.probe(ProbeOutcome::Negative);
        assert!(late.is_empty());
        assert_eq!(h.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_probe_negative_skips_transport() {
        let mut h = Harness::new();
        h.connect();
        h.probe(ProbeOutcome::Negative);

        assert_eq!(opens(&h.log), 0);
        assert_eq!(
            states(&h.log),
            vec![ConnectionState::Probing, ConnectionState::SyntheticMode]
        );
        assert!(h.machine.is_synthetic_mode());
        assert!(h.machine.latency().is_some());
    }

    #[test]
    fn test_open_resets_counter_and_starts_ping() {
        let mut h = Harness::new();
        h.connected();

        assert_eq!(h.machine.reconnect_attempts(), 0);
        assert!(!h.machine.is_timer_armed(TimerKind::ConnectTimeout));
        assert_eq!(h.tokens[&TimerKind::Ping].1, Duration::from_secs(30));
        assert_eq!(h.machine.outstanding_timers(), 1);
    }

    #[test]
    fn test_cold_start_timeout_goes_synthetic() {
        let mut h = Harness::new();
        h.connect();
        h.probe(ProbeOutcome::Reachable);
        let commands = h.fire(TimerKind::ConnectTimeout);

        assert!(commands
            .iter()
            .any(|c| matches!(c, Command::CloseTransport { .. })));
        assert_eq!(
            states(&commands),
            vec![ConnectionState::Error, ConnectionState::SyntheticMode]
        );
        assert!(!h.machine.is_timer_armed(TimerKind::Reconnect));
        assert!(h.machine.is_timer_armed(TimerKind::SyntheticTick));
    }

    #[test]
    fn test_cold_start_refused_goes_synthetic() {
        let mut h = Harness::new();
        h.connect();
        h.probe(ProbeOutcome::Ambiguous);
        h.close(None);

        assert!(h.machine.is_synthetic_mode());
        assert!(!h.machine.is_timer_armed(TimerKind::ConnectTimeout));
    }

    #[test]
    fn test_reconnect_timeout_schedules_retry() {
        let mut h = Harness::new();
        h.connected();
        h.close(Some(1006));
        assert_eq!(h.machine.reconnect_attempts(), 1);

        h.fire(TimerKind::Reconnect);
        assert_eq!(h.state(), ConnectionState::Connecting);

        let commands = h.fire(TimerKind::ConnectTimeout);
        assert_eq!(
            states(&commands),
            vec![ConnectionState::Error, ConnectionState::Disconnected]
        );
        assert!(h.machine.is_timer_armed(TimerKind::Reconnect));
        assert_eq!(h.machine.reconnect_attempts(), 2);
    }

    #[test]
    fn test_abnormal_close_backoff_sequence() {
        let mut h = Harness::new();
        h.connected();
        let commands = h.close(Some(1006));

        assert_eq!(h.state(), ConnectionState::Disconnected);
        assert!(!h.machine.is_timer_armed(TimerKind::Ping));
        assert!(commands.contains(&Command::Emit(FeedEvent::Failure(FailureKind::AbnormalClose))));
        assert_eq!(h.tokens[&TimerKind::Reconnect].1, Duration::from_secs(1));

        h.fire(TimerKind::Reconnect);
        h.close(None);
        assert_eq!(h.tokens[&TimerKind::Reconnect].1, Duration::from_secs(2));
    }

    #[test]
    fn test_reconnects_exhausted_goes_synthetic() {
        let mut h = Harness::new();
        h.connected();
        h.close(Some(1006));

        for _ in 0..h.machine.policy().max_reconnect_attempts {
            assert_eq!(h.state(), ConnectionState::Disconnected);
            h.fire(TimerKind::Reconnect);
            h.close(Some(1006));
        }

        assert!(h.machine.is_synthetic_mode());
        assert!(!h.machine.is_timer_armed(TimerKind::Reconnect));
        assert_eq!(h.machine.outstanding_timers(), 1);
        assert!(h.machine.is_timer_armed(TimerKind::SyntheticTick));
    }

    #[test]
    fn test_successful_reconnect_resets_counter() {
        let mut h = Harness::new();
        h.connected();
        h.close(Some(1011));
        h.fire(TimerKind::Reconnect);
        h.open();

        assert_eq!(h.state(), ConnectionState::Connected);
        assert_eq!(h.machine.reconnect_attempts(), 0);
    }

    #[test]
    fn test_normal_server_close_falls_back_without_retry() {
        let mut h = Harness::new();
        h.connected();
        let commands = h.close(Some(NORMAL_CLOSURE));

        assert_eq!(
            states(&commands),
            vec![ConnectionState::Disconnected, ConnectionState::SyntheticMode]
        );
        assert!(!h.machine.is_timer_armed(TimerKind::Reconnect));
    }

    #[test]
    fn test_replay_after_reconnect_sends_once() {
        let mut h = Harness::new();
        h.connected();

        let commands = h.input(Input::Subscribe("X".into()));
        assert_eq!(subscribes_for(&commands, "X"), 1);

        h.close(Some(1006));
        h.fire(TimerKind::Reconnect);
        let commands = h.open();

        assert_eq!(subscribes_for(&commands, "X"), 1);
    }

    #[test]
    fn test_subscribe_idempotent_while_connected() {
        let mut h = Harness::new();
        h.connected();

        h.input(Input::Subscribe("X".into()));
        let again = h.input(Input::Subscribe("X".into()));
        assert!(again.is_empty());

        let gone = h.input(Input::Unsubscribe("Y".into()));
        assert!(gone.is_empty());
    }

    #[test]
    fn test_subscribe_while_offline_is_deferred() {
        let mut h = Harness::new();
        let commands = h.input(Input::Subscribe("AAPL".into()));
        assert!(sent_texts(&commands).is_empty());
        assert!(h.machine.subscriptions().contains("AAPL"));

        h.connect();
        h.probe(ProbeOutcome::Reachable);
        let commands = h.open();
        assert_eq!(subscribes_for(&commands, "AAPL"), 1);
    }

    #[test]
    fn test_unsubscribe_sent_when_open() {
        let mut h = Harness::new();
        h.connected();
        h.input(Input::Subscribe("AAPL".into()));
        let commands = h.input(Input::Unsubscribe("AAPL".into()));

        let sent = sent_texts(&commands);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "unsubscribe");
        assert_eq!(sent[0]["symbol"], "AAPL");
    }

    #[test]
    fn test_ping_pong_latency() {
        let mut h = Harness::new();
        h.connected();

        let commands = h.fire(TimerKind::Ping);
        let sent = sent_texts(&commands);
        assert_eq!(sent[0]["type"], "ping");
        assert!(h.machine.is_timer_armed(TimerKind::Ping));

        h.now += Duration::from_millis(25);
        let commands = h.message(r#"{"type":"pong","timestamp":"2024-01-01T00:00:00"}"#);

        assert_eq!(h.machine.latency(), Some(Duration::from_millis(25)));
        assert!(commands.contains(&Command::Emit(FeedEvent::LatencyUpdated {
            latency: Duration::from_millis(25),
            synthetic: false,
        })));
    }

    #[test]
    fn test_unsolicited_pong_ignored() {
        let mut h = Harness::new();
        h.connected();

        let commands = h.message(r#"{"type":"pong"}"#);
        assert!(commands.is_empty());
        assert_eq!(h.machine.latency(), None);
        assert_eq!(h.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_malformed_message_dropped() {
        let mut h = Harness::new();
        h.connected();

        let commands = h.message("{not json");
        assert_eq!(
            commands,
            vec![Command::Emit(FeedEvent::Failure(FailureKind::MalformedMessage))]
        );
        assert_eq!(h.state(), ConnectionState::Connected);

        let commands = h.message(r#"{"type":"system_message","message":"hi"}"#);
        assert!(commands.is_empty());
        assert_eq!(h.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_market_data_and_acks() {
        let mut h = Harness::new();
        h.connected();
        h.input(Input::Subscribe("MSFT".into()));

        let commands = h.message(r#"{"type":"subscription_response","symbol":"MSFT","success":true}"#);
        assert!(commands.contains(&Command::Emit(FeedEvent::SubscriptionAck {
            symbol: "MSFT".into(),
            success: true,
        })));
        assert_eq!(
            h.machine.subscriptions().status("MSFT"),
            Some(SubscriptionStatus::Active)
        );

        let commands = h.message(r#"{"type":"market_data_update","symbol":"MSFT","data":{"price":1.5}}"#);
        match &commands[0] {
            Command::Emit(FeedEvent::MarketData {
                symbol,
                data,
                synthetic,
                ..
            }) => {
                assert_eq!(symbol, "MSFT");
                assert_eq!(data["price"], 1.5);
                assert!(!synthetic);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_send_message_dropped_when_offline() {
        let mut h = Harness::new();
        let commands = h.input(Input::Send(serde_json::json!({"type": "custom"})));
        assert!(commands.is_empty());
        assert_eq!(h.machine.metrics.snapshot().sends_dropped, 1);

        h.connected();
        let commands = h.input(Input::Send(serde_json::json!({"type": "custom"})));
        assert_eq!(sent_texts(&commands)[0]["type"], "custom");
    }

    #[test]
    fn test_synthetic_tick_emits_latency_and_quotes() {
        let mut h = Harness::new();
        h.input(Input::Subscribe("AAPL".into()));
        h.connect();
        h.probe(ProbeOutcome::Negative);

        let commands = h.fire(TimerKind::SyntheticTick);
        let latency = commands.iter().find_map(|c| match c {
            Command::Emit(FeedEvent::LatencyUpdated { latency, synthetic: true }) => Some(*latency),
            _ => None,
        });
        let latency = latency.expect("no synthetic latency");
        assert!(latency >= Duration::from_millis(10) && latency < Duration::from_millis(60));

        assert!(commands.iter().any(|c| matches!(
            c,
            Command::Emit(FeedEvent::MarketData { symbol, synthetic: true, .. }) if symbol == "AAPL"
        )));
        assert_eq!(h.tokens[&TimerKind::SyntheticTick].1, Duration::from_secs(3));
    }

    #[test]
    fn test_connect_from_synthetic_restarts() {
        let mut h = Harness::new();
        h.connect();
        h.probe(ProbeOutcome::Negative);

        h.connect();
        assert_eq!(h.state(), ConnectionState::Probing);
        assert!(!h.machine.is_timer_armed(TimerKind::SyntheticTick));
        assert_eq!(h.machine.outstanding_timers(), 1);
    }

    #[test]
    fn test_connected_after_synthetic_has_no_latency() {
        let mut h = Harness::new();
        h.connect();
        h.probe(ProbeOutcome::Negative);
        assert!(h.machine.latency().is_some());

        h.connect();
        assert_eq!(h.machine.latency(), None);
        h.probe(ProbeOutcome::Reachable);
        h.open();

        assert_eq!(h.state(), ConnectionState::Connected);
        assert!(!h.machine.is_synthetic_mode());
        assert_eq!(h.machine.latency(), None);
        assert_eq!(h.machine.status().latency, None);
        assert_eq!(h.machine.metrics.snapshot().latency_ms, None);
    }

    #[test]
    fn test_connect_while_connected_is_noop() {
        let mut h = Harness::new();
        h.connected();
        assert!(h.connect().is_empty());
    }

    #[test]
    fn test_disconnect_closes_with_normal_code() {
        let mut h = Harness::new();
        h.connected();
        let transport = h.transport.unwrap();
        let commands = h.input(Input::Disconnect);

        assert!(commands.contains(&Command::CloseTransport {
            transport,
            code: NORMAL_CLOSURE,
        }));
        assert_eq!(h.state(), ConnectionState::Idle);
        assert_eq!(h.machine.outstanding_timers(), 0);

        // Close event from the torn-down transport is ignored
        assert!(h.close(Some(NORMAL_CLOSURE)).is_empty());
    }

    #[test]
    fn test_disconnect_keeps_subscriptions_shutdown_clears() {
        let mut h = Harness::new();
        h.input(Input::Subscribe("AAPL".into()));
        h.connected();

        h.input(Input::Disconnect);
        assert!(h.machine.subscriptions().contains("AAPL"));

        h.input(Input::Shutdown);
        assert!(h.machine.subscriptions().is_empty());
    }

    #[test]
    fn test_stale_transport_open_is_closed() {
        let mut h = Harness::new();
        h.connect();
        h.probe(ProbeOutcome::Reachable);
        let stale = h.transport.unwrap();
        h.fire(TimerKind::ConnectTimeout);

        let commands = h.input(Input::TransportOpened { transport: stale });
        assert_eq!(
            commands,
            vec![Command::CloseTransport {
                transport: stale,
                code: NORMAL_CLOSURE,
            }]
        );
        assert!(h.machine.is_synthetic_mode());
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = Policy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(3));
        assert_eq!(policy.backoff(40), Duration::from_secs(3));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Connect,
        Disconnect,
        Subscribe(u8),
        Unsubscribe(u8),
        Probe(u8),
        Open,
        Close(Option<u16>),
        Fire(u8),
        Pong,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Connect),
            Just(Step::Disconnect),
            (0u8..4).prop_map(Step::Subscribe),
            (0u8..4).prop_map(Step::Unsubscribe),
            (0u8..3).prop_map(Step::Probe),
            Just(Step::Open),
            prop_oneof![Just(None), Just(Some(1000u16)), Just(Some(1006u16))].prop_map(Step::Close),
            (0u8..5).prop_map(Step::Fire),
            Just(Step::Pong),
        ]
    }

    fn apply(h: &mut Harness, step: &Step) {
        match step {
            Step::Connect => {
                h.connect();
            }
            Step::Disconnect => {
                h.input(Input::Disconnect);
            }
            Step::Subscribe(i) => {
                h.input(Input::Subscribe(format!("S{}", i)));
            }
            Step::Unsubscribe(i) => {
                h.input(Input::Unsubscribe(format!("S{}", i)));
            }
            Step::Probe(o) => {
                if h.probe.is_some() {
                    let outcome = [
                        ProbeOutcome::Reachable,
                        ProbeOutcome::Negative,
                        ProbeOutcome::Ambiguous,
                    ][*o as usize];
                    h.probe(outcome);
                }
            }
            Step::Open => {
                if h.transport.is_some() {
                    h.open();
                }
            }
            Step::Close(code) => {
                if h.transport.is_some() {
                    h.close(*code);
                }
            }
            Step::Fire(k) => {
                let kind = TimerKind::ALL[*k as usize];
                if h.tokens.contains_key(&kind) {
                    h.fire(kind);
                }
            }
            Step::Pong => {
                if h.transport.is_some() {
                    h.message(r#"{"type":"pong"}"#);
                }
            }
        }
    }

    proptest! {
        #[test]
        fn prop_disconnect_leaves_no_timers(steps in prop::collection::vec(step(), 0..60)) {
            let mut h = Harness::new();
            for s in &steps {
                apply(&mut h, s);
                // Never more than one timer per kind
                prop_assert!(h.machine.outstanding_timers() <= TimerKind::COUNT);
                prop_assert_eq!(h.machine.outstanding_timers(), h.tokens.len());
            }

            h.input(Input::Disconnect);
            prop_assert_eq!(h.state(), ConnectionState::Idle);
            prop_assert_eq!(h.machine.outstanding_timers(), 0);
            prop_assert!(h.tokens.is_empty());
        }

        #[test]
        fn prop_offline_subscriptions_replay_net_set(
            ops in prop::collection::vec((any::<bool>(), 0u8..5), 0..40)
        ) {
            let mut h = Harness::new();
            let mut expected = std::collections::BTreeSet::new();
            for (add, i) in &ops {
                let symbol = format!("S{}", i);
                if *add {
                    h.input(Input::Subscribe(symbol.clone()));
                    expected.insert(symbol);
                } else {
                    h.input(Input::Unsubscribe(symbol.clone()));
                    expected.remove(&symbol);
                }
            }

            h.connect();
            h.probe(ProbeOutcome::Reachable);
            let commands = h.open();

            let replayed: Vec<String> = sent_texts(&commands)
                .iter()
                .filter(|v| v["type"] == "subscribe")
                .map(|v| v["symbol"].as_str().unwrap().to_string())
                .collect();
            let replayed_set: std::collections::BTreeSet<String> = replayed.iter().cloned().collect();

            prop_assert_eq!(replayed.len(), replayed_set.len());
            prop_assert_eq!(replayed_set, expected);
        }

        #[test]
        fn prop_unsolicited_pong_never_changes_latency(steps in prop::collection::vec(step(), 0..30)) {
            let mut h = Harness::new();
            for s in &steps {
                apply(&mut h, s);
            }
            h.input(Input::Disconnect);
            h.connected();
            let before = h.machine.latency();
            h.message(r#"{"type":"pong"}"#);
            prop_assert_eq!(h.machine.latency(), before);
        }
    }
}
