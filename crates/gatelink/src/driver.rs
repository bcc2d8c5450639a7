//! Connection driver.
//!
//! A single task owns every piece of mutable protocol state: the transport, the
//! phase, timers, the heartbeat and quality bookkeeping, the reconnection scheduler
//! and the outbound queue. [`GatewayClient`](crate::GatewayClient) handles talk to it
//! over a command channel, and helper tasks (credential fetch plus handshake, and the
//! transport reader) report back over an internal channel.
//!
//! Every connection attempt gets a new epoch. Results and inbound frames tagged with
//! an older epoch belong to a transport that was cancelled or replaced and are
//! discarded, which is what keeps at most one transport alive at a time.

use std::sync::Arc;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use gatelink_proto::control::{heartbeat_ack_payload, HEARTBEAT, HEARTBEAT_ACK};
use gatelink_proto::{decode, encode, ControlMessage, Frame};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::GatewayError;
use crate::heartbeat::{HeartbeatMonitor, HeartbeatTick};
use crate::quality::{QualityEstimator, QualityInputs};
use crate::queue::{MessageQueue, QueuedMessage};
use crate::reconnect::ReconnectScheduler;
use crate::router::{EventRouter, Route};
use crate::state::{ConnectionMetrics, ConnectionPhase, ConnectionState, LastError, StateObservers};
use crate::token::TokenProvider;
use crate::transport::{Connector, FrameSink, FrameStream, InboundFrame, OutboundFrame, Transport};

/// Helper-task reports the driver may fall behind on before readers wait.
const INTERNAL_BUFFER: usize = 32;

/// How a send was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the open transport.
    Sent,
    /// Queued until the next successful open.
    Queued,
}

pub(crate) type Reply<T> = oneshot::Sender<T>;

/// Requests from client handles.
pub(crate) enum Command {
    Connect {
        reply: Reply<Result<(), GatewayError>>,
    },
    Disconnect {
        manual: bool,
        reply: Reply<()>,
    },
    Reconnect {
        reply: Reply<Result<(), GatewayError>>,
    },
    Send {
        event_type: String,
        payload: Value,
        reply: Reply<Result<SendOutcome, GatewayError>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Reports from helper tasks.
enum Internal {
    AttemptFinished {
        epoch: u64,
        result: Result<Transport, GatewayError>,
    },
    Inbound {
        epoch: u64,
        frame: InboundFrame,
    },
    LinkLost {
        epoch: u64,
        error: GatewayError,
    },
}

struct Link {
    epoch: u64,
    sink: FrameSink,
    reader: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Counters {
    messages_sent: u64,
    messages_queued: u64,
    frames_received: u64,
    frames_rejected: u64,
}

/// Shared handles the driver publishes through.
pub(crate) struct Outlets {
    pub router: Arc<EventRouter>,
    pub observers: Arc<StateObservers>,
    pub state_tx: watch::Sender<ConnectionState>,
    pub metrics_tx: watch::Sender<ConnectionMetrics>,
}

pub(crate) struct Driver {
    config: ClientConfig,
    token_provider: Arc<dyn TokenProvider>,
    connector: Arc<dyn Connector>,
    outlets: Outlets,
    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,

    state: ConnectionState,
    epoch: u64,
    attempt: Option<JoinHandle<()>>,
    link: Option<Link>,
    waiters: Vec<Reply<Result<(), GatewayError>>>,
    scheduler: ReconnectScheduler,
    heartbeat: HeartbeatMonitor,
    quality: QualityEstimator,
    queue: MessageQueue,
    backoff_until: Option<Instant>,
    idle_deadline: Option<Instant>,
    connected_at: Option<Instant>,
    protocol_errors: u32,
    counters: Counters,
}

/// Resolve at `deadline`, or never when there is none.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    pub(crate) fn new(
        config: ClientConfig,
        token_provider: Arc<dyn TokenProvider>,
        connector: Arc<dyn Connector>,
        outlets: Outlets,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_BUFFER);
        Self {
            scheduler: ReconnectScheduler::new(config.reconnect.clone()),
            heartbeat: HeartbeatMonitor::new(config.heartbeat.clone()),
            quality: QualityEstimator::new(config.quality.clone()),
            queue: MessageQueue::new(config.queue.clone()),
            config,
            token_provider,
            connector,
            outlets,
            commands,
            internal_tx,
            internal_rx,
            state: ConnectionState::default(),
            epoch: 0,
            attempt: None,
            link: None,
            waiters: Vec::new(),
            backoff_until: None,
            idle_deadline: None,
            connected_at: None,
            protocol_errors: 0,
            counters: Counters::default(),
        }
    }

    /// Run until shut down or every client handle is dropped.
    pub(crate) async fn run(mut self) {
        debug!(gateway = %self.config.gateway_url, "Gateway driver started");
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(event) = self.internal_rx.recv() => self.handle_internal(event).await,
                () = sleep_until(self.backoff_until) => self.on_backoff_elapsed(),
                () = sleep_until(self.heartbeat.next_tick()) => self.on_heartbeat_tick().await,
                () = sleep_until(self.heartbeat.next_ack_deadline()) => self.on_ack_deadline(),
                () = sleep_until(self.idle_deadline) => self.on_idle_timeout(),
                () = sleep_until(self.quality.next_check()) => {
                    self.evaluate_quality(Some(Instant::now()));
                }
            }
            self.publish();
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => self.connect(reply),
            Command::Disconnect { manual, reply } => {
                let was_active = self.state.phase != ConnectionPhase::Disconnected;
                self.disconnect(manual).await;
                if !manual && was_active {
                    self.schedule_reconnect();
                }
                self.publish();
                let _ = reply.send(());
            }
            Command::Reconnect { reply } => {
                info!("Reconnect requested");
                // Dial right away instead of going through the backoff.
                self.disconnect(false).await;
                self.scheduler.reset();
                self.connect(reply);
            }
            Command::Send {
                event_type,
                payload,
                reply,
            } => {
                let outcome = self.send(event_type, payload).await;
                self.publish();
                let _ = reply.send(outcome);
            }
            // Handled in `run`.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::AttemptFinished { epoch, result } => {
                if epoch != self.epoch || self.state.phase != ConnectionPhase::Connecting {
                    debug!(epoch, current = self.epoch, "Discarding superseded connection attempt");
                    if let Ok(transport) = result {
                        self.spawn_close(transport.sink, "superseded");
                    }
                    return;
                }
                self.attempt = None;
                match result {
                    Ok(transport) => self.on_open(transport).await,
                    Err(err) => self.on_attempt_failed(err),
                }
            }
            Internal::Inbound { epoch, frame } => {
                if self.is_current_link(epoch) {
                    self.on_inbound(frame).await;
                } else {
                    trace!(epoch, "Dropping frame from a replaced transport");
                }
            }
            Internal::LinkLost { epoch, error } => {
                if self.is_current_link(epoch) {
                    self.on_link_lost(error);
                }
            }
        }
    }

    fn is_current_link(&self, epoch: u64) -> bool {
        self.link.as_ref().is_some_and(|link| link.epoch == epoch)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn connect(&mut self, reply: Reply<Result<(), GatewayError>>) {
        match self.state.phase {
            ConnectionPhase::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionPhase::Connecting => {
                debug!("Connect joined the attempt in progress");
                self.waiters.push(reply);
            }
            ConnectionPhase::Disconnected | ConnectionPhase::Backoff => {
                self.state.manually_disconnected = false;
                self.waiters.push(reply);
                self.start_attempt();
            }
        }
    }

    fn start_attempt(&mut self) {
        self.epoch += 1;
        self.backoff_until = None;
        self.state.phase = ConnectionPhase::Connecting;

        let epoch = self.epoch;
        let config = self.config.clone();
        let provider = Arc::clone(&self.token_provider);
        let connector = Arc::clone(&self.connector);
        let tx = self.internal_tx.clone();

        info!(epoch, attempt = self.scheduler.attempts(), "Connecting to gateway");
        self.attempt = Some(tokio::spawn(async move {
            let result = open_transport(&config, provider.as_ref(), connector.as_ref()).await;
            let _ = tx.send(Internal::AttemptFinished { epoch, result }).await;
        }));
    }

    async fn on_open(&mut self, transport: Transport) {
        let Transport { sink, stream } = transport;
        let epoch = self.epoch;
        let reader = tokio::spawn(read_loop(epoch, stream, self.internal_tx.clone()));
        self.link = Some(Link {
            epoch,
            sink,
            reader,
        });

        let now = Instant::now();
        self.scheduler.reset();
        self.state.phase = ConnectionPhase::Connected;
        self.state.last_connected_at = Some(Utc::now());
        self.state.last_error = None;
        self.state.connection_id = None;
        self.connected_at = Some(now);
        self.protocol_errors = 0;
        self.heartbeat.start(now);
        self.quality.start(now);
        self.idle_deadline = Some(now + self.config.heartbeat.idle_timeout());

        info!(epoch, "Connected to gateway");
        // Waiters observe the connected state as soon as they resume.
        self.publish();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        self.flush_queue().await;
    }

    fn on_attempt_failed(&mut self, err: GatewayError) {
        warn!(error = %err, "Connection attempt failed");
        self.state.last_error = Some(LastError::from(&err));
        self.state.phase = ConnectionPhase::Disconnected;

        if err.is_retryable() {
            self.schedule_reconnect();
        } else {
            info!(kind = %err.kind(), "Not retrying; waiting for an explicit connect");
        }

        self.publish();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn on_link_lost(&mut self, err: GatewayError) {
        warn!(error = %err, "Gateway connection lost");
        // The transport is already gone; nothing to close.
        drop(self.teardown());
        self.state.last_error = Some(LastError::from(&err));
        self.state.phase = ConnectionPhase::Disconnected;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.state.manually_disconnected {
            debug!("Manually disconnected; not scheduling a reconnection");
            return;
        }

        match self.scheduler.schedule() {
            Ok(delay) => {
                self.state.phase = ConnectionPhase::Backoff;
                self.backoff_until = Some(Instant::now() + delay);
                info!(
                    attempt = self.scheduler.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnection"
                );
            }
            Err(err) => {
                error!(error = %err, "Giving up on reconnection; call reconnect() to retry");
                self.state.phase = ConnectionPhase::Disconnected;
                self.state.last_error = Some(LastError::from(&err));
                self.backoff_until = None;
            }
        }
    }

    fn on_backoff_elapsed(&mut self) {
        self.backoff_until = None;
        // State may have moved on since the timer was armed.
        if self.state.phase != ConnectionPhase::Backoff
            || self.state.manually_disconnected
            || self.link.is_some()
            || self.attempt.is_some()
        {
            debug!(phase = %self.state.phase, "Skipping stale reconnection timer");
            return;
        }
        self.start_attempt();
    }

    /// Replace a live but unhealthy transport right away.
    fn force_reconnect(&mut self, reason: GatewayError) {
        warn!(reason = %reason, "Forcing reconnection");
        if let Some(sink) = self.teardown() {
            self.spawn_close(sink, "reconnecting");
        }
        self.state.last_error = Some(LastError::from(&reason));
        self.state.phase = ConnectionPhase::Disconnected;
        if !self.state.manually_disconnected {
            self.start_attempt();
        }
    }

    async fn disconnect(&mut self, manual: bool) {
        // Invalidates the in-flight attempt and the current reader.
        self.epoch += 1;
        self.backoff_until = None;
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        if let Some(mut sink) = self.teardown() {
            let close = async {
                sink.send(OutboundFrame::normal_close("client disconnect")).await?;
                sink.close().await
            };
            match tokio::time::timeout(self.config.handshake_timeout(), close).await {
                Ok(Ok(())) => debug!("Closed gateway connection"),
                Ok(Err(e)) => debug!(error = %e, "Close frame not delivered"),
                Err(_) => debug!("Timed out closing gateway connection"),
            }
        }

        if manual {
            self.state.manually_disconnected = true;
        }
        self.state.phase = ConnectionPhase::Disconnected;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(GatewayError::Cancelled));
        }
        info!(manual, "Disconnected from gateway");
    }

    async fn shutdown(&mut self) {
        self.disconnect(true).await;
        let discarded = self.queue.clear();
        if discarded > 0 {
            warn!(discarded, "Discarding queued messages on shutdown");
        }
        self.publish();
        debug!("Gateway driver stopped");
    }

    /// Stop per-connection timers and detach the transport.
    fn teardown(&mut self) -> Option<FrameSink> {
        self.heartbeat.stop();
        self.quality.stop();
        self.idle_deadline = None;
        self.connected_at = None;
        self.state.connection_id = None;
        let link = self.link.take()?;
        link.reader.abort();
        Some(link.sink)
    }

    fn spawn_close(&self, mut sink: FrameSink, reason: &'static str) {
        let timeout = self.config.handshake_timeout();
        tokio::spawn(async move {
            let _ = tokio::time::timeout(timeout, async {
                let _ = sink.send(OutboundFrame::normal_close(reason)).await;
                let _ = sink.close().await;
            })
            .await;
        });
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    async fn send(&mut self, event_type: String, payload: Value) -> Result<SendOutcome, GatewayError> {
        if event_type.is_empty() {
            return Err(GatewayError::Protocol("event type cannot be empty".to_string()));
        }

        if self.state.phase == ConnectionPhase::Connected {
            let bytes = encode(&event_type, &payload)?;
            match self.write_frame(bytes).await {
                Ok(()) => {
                    self.counters.messages_sent += 1;
                    return Ok(SendOutcome::Sent);
                }
                Err(err) => {
                    self.enqueue(event_type, payload);
                    self.on_link_lost(err);
                    return Ok(SendOutcome::Queued);
                }
            }
        }

        self.enqueue(event_type, payload);
        Ok(SendOutcome::Queued)
    }

    fn enqueue(&mut self, event_type: String, payload: Value) {
        trace!(event_type = %event_type, depth = self.queue.len(), "Queueing outbound message");
        self.queue
            .push(QueuedMessage::new(event_type, payload, Instant::now()));
        self.counters.messages_queued += 1;
    }

    async fn flush_queue(&mut self) {
        self.queue.evict_stale(Instant::now());
        if self.queue.is_empty() {
            return;
        }

        let pending = self.queue.len();
        let mut flushed = 0_usize;
        while let Some(message) = self.queue.pop_front() {
            let bytes = match encode(&message.event_type, &message.payload) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(event_type = %message.event_type, error = %e, "Dropping unencodable queued message");
                    continue;
                }
            };
            if let Err(err) = self.write_frame(bytes).await {
                self.queue.push_front(message);
                warn!(flushed, remaining = self.queue.len(), "Queue flush interrupted");
                self.on_link_lost(err);
                return;
            }
            self.counters.messages_sent += 1;
            flushed += 1;
        }
        info!(flushed, pending, "Flushed queued messages");
    }

    async fn write_frame(&mut self, bytes: Vec<u8>) -> Result<(), GatewayError> {
        // A write stalled for longer than an ack timeout means the link is dead.
        let timeout = self.config.heartbeat.ack_timeout();
        let Some(link) = self.link.as_mut() else {
            return Err(GatewayError::Transport("no open transport".to_string()));
        };
        match tokio::time::timeout(timeout, link.sink.send(OutboundFrame::Binary(bytes))).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Transport(format!("write stalled for {timeout:?}"))),
        }
    }

    async fn write_event(&mut self, event_type: &str, payload: &Value) {
        let bytes = match encode(event_type, payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(event_type, error = %e, "Failed to encode control frame");
                return;
            }
        };
        if let Err(err) = self.write_frame(bytes).await {
            self.on_link_lost(err);
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    async fn on_inbound(&mut self, frame: InboundFrame) {
        self.idle_deadline = Some(Instant::now() + self.config.heartbeat.idle_timeout());

        match frame {
            InboundFrame::Binary(bytes) => match decode(&bytes) {
                Ok(frame) => {
                    self.counters.frames_received += 1;
                    self.on_frame(frame).await;
                }
                Err(e) => {
                    self.counters.frames_rejected += 1;
                    self.on_protocol_error(e.into());
                }
            },
            InboundFrame::Text(_) => {
                self.counters.frames_rejected += 1;
                self.on_protocol_error(GatewayError::Protocol(
                    "unexpected text frame".to_string(),
                ));
            }
            InboundFrame::Keepalive => {}
            // The reader reports closes as `LinkLost`.
            InboundFrame::Close(reason) => {
                self.on_link_lost(GatewayError::Transport(format!(
                    "closed by gateway: {}",
                    reason.unwrap_or_default()
                )));
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        let route = self.outlets.router.route(&frame);
        match route {
            Route::Control(control) => self.on_control(control).await,
            Route::Dispatched(report) => {
                self.protocol_errors = 0;
                trace!(
                    event_type = %frame.event_type,
                    delivered = report.delivered,
                    failed = report.failed,
                    "Dispatched event"
                );
            }
        }
    }

    async fn on_control(&mut self, control: ControlMessage) {
        match control {
            ControlMessage::ConnectionEstablished {
                connection_id,
                session_id,
            } => {
                self.protocol_errors = 0;
                info!(
                    connection_id = connection_id.as_deref().unwrap_or("-"),
                    session_id = session_id.as_deref().unwrap_or("-"),
                    "Gateway session established"
                );
                self.state.connection_id = connection_id;
            }
            ControlMessage::HeartbeatAck { server_timestamp } => {
                self.protocol_errors = 0;
                let rtt = self.heartbeat.on_ack(Instant::now(), server_timestamp);
                debug!(rtt = ?rtt, "Heartbeat acknowledged");
                self.evaluate_quality(None);
            }
            ControlMessage::Heartbeat => {
                self.protocol_errors = 0;
                trace!("Answering gateway heartbeat");
                let payload = heartbeat_ack_payload(Utc::now().timestamp_millis());
                self.write_event(HEARTBEAT_ACK, &payload).await;
            }
            ControlMessage::Error { message } => {
                self.on_protocol_error(GatewayError::Protocol(format!("gateway error: {message}")));
            }
        }
    }

    fn on_protocol_error(&mut self, err: GatewayError) {
        self.protocol_errors += 1;
        warn!(error = %err, consecutive = self.protocol_errors, "Protocol error");
        self.state.last_error = Some(LastError::from(&err));
        if self.protocol_errors >= self.config.max_protocol_errors {
            self.force_reconnect(err);
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    async fn on_heartbeat_tick(&mut self) {
        match self.heartbeat.on_tick(Instant::now(), Utc::now().timestamp_millis()) {
            HeartbeatTick::Ping { payload } => {
                trace!(missed = self.heartbeat.missed_acks(), "Sending heartbeat");
                self.write_event(HEARTBEAT, &payload).await;
            }
            HeartbeatTick::Dead { missed } => {
                self.force_reconnect(GatewayError::HeartbeatTimeout { missed });
            }
        }
    }

    fn on_ack_deadline(&mut self) {
        if self.heartbeat.expire(Instant::now()) {
            let missed = self.heartbeat.missed_acks();
            self.force_reconnect(GatewayError::HeartbeatTimeout { missed });
        } else {
            debug!(missed = self.heartbeat.missed_acks(), "Heartbeat acknowledgement overdue");
        }
    }

    fn on_idle_timeout(&mut self) {
        let idle = self.config.heartbeat.idle_timeout();
        self.force_reconnect(GatewayError::Transport(format!(
            "no inbound traffic for {idle:?}"
        )));
    }

    fn evaluate_quality(&mut self, reschedule_from: Option<Instant>) {
        let Some(connected_at) = self.connected_at else {
            return;
        };
        let now = Instant::now();
        let last_ack = self.heartbeat.record().last_ack_at.unwrap_or(connected_at);
        let inputs = QualityInputs {
            missed_heartbeats: self.heartbeat.missed_acks(),
            since_last_ack: now.saturating_duration_since(last_ack),
            connected_for: now.saturating_duration_since(connected_at),
        };

        let previous = self.quality.score().level();
        let score = self.quality.evaluate(&inputs, reschedule_from);
        if score.level() != previous {
            info!(score = score.value(), level = %score.level(), "Connection quality changed");
        }

        if self.state.phase == ConnectionPhase::Connected && self.quality.should_reconnect(score) {
            self.force_reconnect(GatewayError::Transport(format!(
                "connection quality critical: {score}"
            )));
        }
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    fn publish(&mut self) {
        self.state.reconnect_attempts = self.scheduler.attempts();

        let previous = self.outlets.state_tx.borrow().phase;
        let changed = *self.outlets.state_tx.borrow() != self.state;
        if changed {
            if previous != self.state.phase {
                debug!(from = %previous, to = %self.state.phase, "Connection phase changed");
            }
            self.outlets.state_tx.send_replace(self.state.clone());
            self.outlets.observers.notify(&self.state);
        }

        self.outlets.metrics_tx.send_replace(self.metrics());
    }

    fn metrics(&self) -> ConnectionMetrics {
        let quality_score = self.quality.score();
        ConnectionMetrics {
            phase: self.state.phase,
            reconnect_attempts: self.scheduler.attempts(),
            queue_depth: self.queue.len(),
            quality_score,
            quality_level: quality_score.level(),
            missed_heartbeats: self.heartbeat.missed_acks(),
            last_rtt: self.heartbeat.last_rtt(),
            last_server_timestamp: self.heartbeat.last_server_timestamp(),
            messages_sent: self.counters.messages_sent,
            messages_queued: self.counters.messages_queued,
            messages_dropped: self.queue.dropped(),
            frames_received: self.counters.frames_received,
            frames_rejected: self.counters.frames_rejected,
            connection_id: self.state.connection_id.clone(),
        }
    }
}

/// Fetch a credential and perform the handshake.
async fn open_transport(
    config: &ClientConfig,
    provider: &dyn TokenProvider,
    connector: &dyn Connector,
) -> Result<Transport, GatewayError> {
    let token = tokio::time::timeout(config.token_timeout(), provider.token())
        .await
        .map_err(|_| {
            GatewayError::Transport(format!(
                "token fetch timed out after {:?}",
                config.token_timeout()
            ))
        })?
        .filter(|token| !token.is_empty())
        .ok_or(GatewayError::CredentialUnavailable)?;

    let url = config.connection_url(&token)?;
    debug!(url = %config.redact(&url), "Opening transport");

    tokio::time::timeout(config.handshake_timeout(), connector.connect(url))
        .await
        .map_err(|_| {
            GatewayError::Transport(format!(
                "handshake timed out after {:?}",
                config.handshake_timeout()
            ))
        })?
}

/// Forward inbound frames until the transport ends.
///
/// Waits for the driver to take each frame before reading the next, so a slow
/// driver pushes back on the transport.
async fn read_loop(epoch: u64, mut stream: FrameStream, tx: mpsc::Sender<Internal>) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(InboundFrame::Close(reason)) => {
                let reason = reason.unwrap_or_else(|| "no reason".to_string());
                let _ = tx
                    .send(Internal::LinkLost {
                        epoch,
                        error: GatewayError::Transport(format!("closed by gateway: {reason}")),
                    })
                    .await;
                return;
            }
            Ok(frame) => {
                if tx.send(Internal::Inbound { epoch, frame }).await.is_err() {
                    return;
                }
            }
            Err(error) => {
                let _ = tx.send(Internal::LinkLost { epoch, error }).await;
                return;
            }
        }
    }
    let _ = tx
        .send(Internal::LinkLost {
            epoch,
            error: GatewayError::Transport("connection dropped without a close frame".to_string()),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_until_some_fires() {
        let start = Instant::now();
        sleep_until(Some(start + Duration::from_secs(5))).await;
        assert_eq!(Instant::now(), start + Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_until_none_never_fires() {
        let result = tokio::time::timeout(Duration::from_secs(3600), sleep_until(None)).await;
        assert!(result.is_err());
    }
}
