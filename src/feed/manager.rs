//! Connection manager runtime
//!
//! [`FeedManager`] is the handle collaborators hold. It forwards requests
//! over an unbounded channel to a single driver task, which feeds every
//! stimulus through the [`FeedMachine`] in delivery order and executes the
//! returned commands: spawning probes and handshakes, arming tokio timers,
//! writing to the transport and publishing state.
//!
//! Outbound frames are queued to a per-transport writer task, so a peer
//! that stops reading never stalls the driver. Reader, probe, handshake
//! and timer tasks report back through the driver's internal channel.
//! Status is published before the events of the same step.

use crate::feed::machine::{Command, FeedMachine, Input, Policy, ProbeId, TransportId};
use crate::feed::probe::{HealthProbe, HttpHealthProbe};
use crate::feed::state::{ConnectionState, FeedEvent, FeedStatus, ProbeOutcome};
use crate::feed::timers::{TimerKind, TimerOp};
use crate::infrastructure::config::FeedConfig;
use crate::infrastructure::metrics::FeedMetrics;
use crate::ws::connection::{
    Frame, TransportReader, TransportWriter, WebSocketConnection, NORMAL_CLOSURE,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Level;

/// Messages reaching the driver from its own helper tasks
enum Internal {
    Machine(Input),
    Opened(TransportId, WebSocketConnection),
}

/// Frames queued for a transport's writer task
enum Outgoing {
    Text(String),
    Close(u16),
}

/// Handle to a running connection manager
///
/// Control calls never block and never fail: they are queued for the
/// driver and folded into the state machine.
pub struct FeedManager {
    control: mpsc::UnboundedSender<Input>,
    status: watch::Receiver<FeedStatus>,
    events: broadcast::Sender<FeedEvent>,
    metrics: Arc<FeedMetrics>,
    task: Option<JoinHandle<()>>,
}

impl FeedManager {
    /// Start a manager probing over HTTP as configured.
    ///
    /// Must be called inside a tokio runtime. The manager stays `Idle`
    /// until [`connect`](Self::connect).
    pub fn new(config: &FeedConfig) -> Self {
        let probe = HttpHealthProbe::new(config.health_url().map(str::to_owned));
        Self::with_probe(config, probe)
    }

    /// Start a manager with a custom health probe
    pub fn with_probe<P: HealthProbe>(config: &FeedConfig, probe: P) -> Self {
        let metrics = Arc::new(FeedMetrics::new());
        let machine = FeedMachine::new(Policy::from(config), metrics.clone());
        Self::spawn(machine, config, probe, metrics)
    }

    fn spawn<P: HealthProbe>(
        machine: FeedMachine,
        config: &FeedConfig,
        probe: P,
        metrics: Arc<FeedMetrics>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(machine.status());
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let driver = Driver {
            machine,
            probe: Arc::new(probe),
            url: config.ws_url.clone(),
            write_timeout: Duration::from_millis(config.connect_timeout_ms),
            internal: internal_tx,
            timers: TimerTasks::default(),
            probe_task: None,
            opening: None,
            transport: None,
            status: status_tx,
            events: events_tx.clone(),
        };
        let task = tokio::spawn(driver.run(control_rx, internal_rx));

        Self {
            control: control_tx,
            status: status_rx,
            events: events_tx,
            metrics,
            task: Some(task),
        }
    }

    /// Start (or restart) a connection attempt
    pub fn connect(&self) {
        self.request(Input::Connect);
    }

    /// Tear the connection down to `Idle`, keeping subscriptions
    pub fn disconnect(&self) {
        self.request(Input::Disconnect);
    }

    /// Add `symbol` to the subscription set
    pub fn subscribe(&self, symbol: impl Into<String>) {
        self.request(Input::Subscribe(symbol.into()));
    }

    /// Remove `symbol` from the subscription set
    pub fn unsubscribe(&self, symbol: impl Into<String>) {
        self.request(Input::Unsubscribe(symbol.into()));
    }

    /// Send a raw payload if connected; dropped otherwise
    pub fn send_message(&self, payload: Value) {
        self.request(Input::Send(payload));
    }

    fn request(&self, input: Input) {
        if self.control.send(input).is_err() {
            tracing::debug!(target: "feed", "request after shutdown ignored");
        }
    }

    /// Disconnect, clear subscriptions and stop the driver
    pub async fn shutdown(mut self) {
        self.request(Input::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    #[inline]
    pub fn latency(&self) -> Option<Duration> {
        self.status.borrow().latency
    }

    #[inline]
    pub fn is_synthetic_mode(&self) -> bool {
        self.status.borrow().is_synthetic_mode()
    }

    /// Full snapshot
    pub fn status(&self) -> FeedStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change
    pub fn watch_status(&self) -> watch::Receiver<FeedStatus> {
        self.status.clone()
    }

    /// Subscribe to the event stream
    pub fn events(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> Arc<FeedMetrics> {
        self.metrics.clone()
    }
}

/// One tokio task per outstanding timer kind
#[derive(Default)]
struct TimerTasks {
    slots: [Option<JoinHandle<()>>; TimerKind::COUNT],
}

impl TimerTasks {
    /// Abort whatever occupies `kind`, then install `task`
    fn replace(&mut self, kind: TimerKind, task: JoinHandle<()>) {
        if let Some(previous) = self.slots[kind.index()].replace(task) {
            previous.abort();
        }
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some(task) = self.slots[kind.index()].take() {
            task.abort();
        }
    }

    fn cancel_all(&mut self) {
        for kind in TimerKind::ALL {
            self.cancel(kind);
        }
    }
}

/// Live transport owned by the driver
struct ActiveTransport {
    id: TransportId,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    reader: JoinHandle<()>,
}

struct Driver<P> {
    machine: FeedMachine,
    probe: Arc<P>,
    url: String,
    /// Bound on any single transport write
    write_timeout: Duration,
    internal: mpsc::UnboundedSender<Internal>,
    timers: TimerTasks,
    probe_task: Option<JoinHandle<()>>,
    opening: Option<(TransportId, JoinHandle<()>)>,
    transport: Option<ActiveTransport>,
    status: watch::Sender<FeedStatus>,
    events: broadcast::Sender<FeedEvent>,
}

impl<P: HealthProbe> Driver<P> {
    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Input>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        crate::log_feed!(Level::DEBUG, url = %self.url, "feed driver started");

        loop {
            // Caller requests first so a disconnect is never starved
            let input = tokio::select! {
                biased;
                request = control.recv() => match request {
                    Some(input) => input,
                    None => Input::Shutdown,
                },
                Some(message) = internal.recv() => match message {
                    Internal::Machine(input) => input,
                    Internal::Opened(id, connection) => self.adopt(id, connection),
                },
            };

            if let Input::TransportClosed { transport, .. } = input {
                self.release(transport);
            }
            let shutdown = matches!(input, Input::Shutdown);
            self.step(input);
            if shutdown {
                break;
            }
        }

        self.timers.cancel_all();
        if let Some((_, task)) = self.opening.take() {
            task.abort();
        }
        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
        crate::log_feed!(Level::DEBUG, "feed driver stopped");
    }

    fn step(&mut self, input: Input) {
        let commands = self.machine.handle(input, Instant::now());
        let events: Vec<FeedEvent> = commands
            .into_iter()
            .filter_map(|command| self.execute(command))
            .collect();

        let status = self.machine.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        for event in events {
            // No receivers is fine
            let _ = self.events.send(event);
        }
    }

    /// Forget a transport whose stream has already ended
    fn release(&mut self, transport: TransportId) {
        if matches!(&self.transport, Some(active) if active.id == transport) {
            self.transport = None;
        }
    }

    /// Take ownership of a freshly opened connection
    fn adopt(&mut self, id: TransportId, connection: WebSocketConnection) -> Input {
        if matches!(&self.opening, Some((opening, _)) if *opening == id) {
            self.opening = None;
        }

        let (writer, reader) = connection.split();
        let (outgoing, queue) = mpsc::unbounded_channel();
        if self.transport.is_some() {
            // Another transport is live, so this one is stale
            let _ = outgoing.send(Outgoing::Close(NORMAL_CLOSURE));
            tokio::spawn(write_loop(writer, queue, self.write_timeout));
        } else {
            tokio::spawn(write_loop(writer, queue, self.write_timeout));
            let reader = tokio::spawn(read_loop(id, reader, self.internal.clone()));
            self.transport = Some(ActiveTransport {
                id,
                outgoing,
                reader,
            });
        }
        Input::TransportOpened { transport: id }
    }

    /// Carry out one command; events are handed back for publishing
    fn execute(&mut self, command: Command) -> Option<FeedEvent> {
        match command {
            Command::StartProbe { probe, timeout } => self.start_probe(probe, timeout),
            Command::OpenTransport { transport } => self.open_transport(transport),
            Command::CloseTransport { transport, code } => self.close_transport(transport, code),
            Command::Send { transport, text } => match &self.transport {
                Some(active) if active.id == transport => {
                    if active.outgoing.send(Outgoing::Text(text)).is_err() {
                        tracing::debug!(target: "feed", "writer gone, send dropped");
                    }
                }
                _ => tracing::debug!(target: "feed", "send for inactive transport dropped"),
            },
            Command::Timer(TimerOp::Arm { kind, token, after }) => {
                let internal = self.internal.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = internal.send(Internal::Machine(Input::TimerFired { kind, token }));
                });
                self.timers.replace(kind, task);
            }
            Command::Timer(TimerOp::Cancel { kind }) => self.timers.cancel(kind),
            Command::Emit(event) => return Some(event),
        }
        None
    }

    fn start_probe(&mut self, probe: ProbeId, timeout: Duration) {
        let prober = self.probe.clone();
        let internal = self.internal.clone();
        let task = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, prober.probe(timeout)).await {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome::Ambiguous,
            };
            let _ = internal.send(Internal::Machine(Input::ProbeFinished { probe, outcome }));
        });
        if let Some(previous) = self.probe_task.replace(task) {
            previous.abort();
        }
    }

    fn open_transport(&mut self, transport: TransportId) {
        let url = self.url.clone();
        let internal = self.internal.clone();
        let task = tokio::spawn(async move {
            let message = match WebSocketConnection::connect(&url).await {
                Ok(connection) => Internal::Opened(transport, connection),
                Err(e) => {
                    tracing::debug!(target: "feed", error = %e, "handshake failed");
                    Internal::Machine(Input::TransportClosed {
                        transport,
                        code: None,
                    })
                }
            };
            let _ = internal.send(message);
        });
        if let Some((_, previous)) = self.opening.replace((transport, task)) {
            previous.abort();
        }
    }

    fn close_transport(&mut self, transport: TransportId, code: u16) {
        if matches!(&self.opening, Some((opening, _)) if *opening == transport) {
            if let Some((_, task)) = self.opening.take() {
                task.abort();
            }
        }

        if matches!(&self.transport, Some(active) if active.id == transport) {
            if let Some(active) = self.transport.take() {
                active.reader.abort();
                // The writer task finishes queued frames, then closes
                let _ = active.outgoing.send(Outgoing::Close(code));
            }
        }
    }
}

/// Drain queued frames into the transport until closed or abandoned.
///
/// Each write is bounded by `deadline`; a peer that stops reading loses
/// its writer instead of holding it forever.
async fn write_loop(
    mut writer: TransportWriter,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    deadline: Duration,
) {
    let mut code = NORMAL_CLOSURE;
    while let Some(frame) = queue.recv().await {
        match frame {
            Outgoing::Text(text) => {
                match tokio::time::timeout(deadline, writer.send_text(&text)).await {
                    Ok(Ok(())) => {}
                    // The reader observes the broken stream and reports the close
                    Ok(Err(e)) => tracing::warn!(target: "feed", error = %e, "transport send failed"),
                    Err(_) => {
                        tracing::warn!(target: "feed", "transport send timed out, writer abandoned");
                        return;
                    }
                }
            }
            Outgoing::Close(requested) => {
                code = requested;
                break;
            }
        }
    }

    if tokio::time::timeout(deadline, writer.close(code)).await.is_err() {
        tracing::debug!(target: "feed", code, "transport close timed out");
    }
}

/// Forward inbound frames until the stream ends
async fn read_loop(
    transport: TransportId,
    mut reader: TransportReader,
    internal: mpsc::UnboundedSender<Internal>,
) {
    loop {
        let input = match reader.next_frame().await {
            Frame::Text(text) => Input::TransportMessage { transport, text },
            Frame::Closed(code) => {
                let _ = internal.send(Internal::Machine(Input::TransportClosed { transport, code }));
                return;
            }
        };
        if internal.send(Internal::Machine(input)).is_err() {
            return;
        }
    }
}
