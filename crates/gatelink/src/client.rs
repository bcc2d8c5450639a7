//! Gateway client handle.
//!
//! [`GatewayClient`] is a cheap, cloneable handle to a connection driver running on
//! the tokio runtime. Lifecycle operations and sends are forwarded to the driver;
//! handler registration and state reads are served from shared structures without
//! a round trip.

use std::sync::Arc;

use gatelink_proto::Frame;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::config::ClientConfig;
use crate::driver::{Command, Driver, Outlets, SendOutcome};
use crate::error::GatewayError;
use crate::router::{EventRouter, HandlerId, HandlerResult};
use crate::state::{
    ConnectionMetrics, ConnectionPhase, ConnectionState, StateObservers, StateSubscription,
};
use crate::token::TokenProvider;
use crate::transport::{Connector, TungsteniteConnector};

const COMMAND_BUFFER: usize = 64;

/// Handle to a gateway connection.
///
/// Dropping every clone (or calling [`shutdown`](Self::shutdown)) stops the driver
/// and closes the transport.
#[derive(Clone)]
pub struct GatewayClient {
    commands: mpsc::Sender<Command>,
    router: Arc<EventRouter>,
    observers: Arc<StateObservers>,
    state: watch::Receiver<ConnectionState>,
    metrics: watch::Receiver<ConnectionMetrics>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl GatewayClient {
    /// Start a client that connects over WebSocket.
    ///
    /// Must be called from within a tokio runtime. No connection is made until
    /// [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the configuration is invalid.
    pub fn spawn(
        config: ClientConfig,
        token_provider: impl TokenProvider,
    ) -> Result<Self, GatewayError> {
        Self::spawn_with_connector(config, token_provider, TungsteniteConnector::new())
    }

    /// Start a client over a custom transport.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the configuration is invalid.
    pub fn spawn_with_connector(
        config: ClientConfig,
        token_provider: impl TokenProvider,
        connector: impl Connector,
    ) -> Result<Self, GatewayError> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        let (metrics_tx, metrics_rx) = watch::channel(ConnectionMetrics::default());
        let router = Arc::new(EventRouter::new());
        let observers = Arc::new(StateObservers::new());

        let driver = Driver::new(
            config,
            Arc::new(token_provider),
            Arc::new(connector),
            Outlets {
                router: Arc::clone(&router),
                observers: Arc::clone(&observers),
                state_tx,
                metrics_tx,
            },
            commands_rx,
        );
        tokio::spawn(driver.run());
        debug!("Gateway client spawned");

        Ok(Self {
            commands: commands_tx,
            router,
            observers,
            state: state_rx,
            metrics: metrics_rx,
        })
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, GatewayError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| GatewayError::ClientClosed)?;
        response.await.map_err(|_| GatewayError::ClientClosed)
    }

    /// Connect to the gateway.
    ///
    /// Resolves once the attempt this call started (or joined) finishes. Returns
    /// immediately if already connected. Clears a previous manual disconnect.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::CredentialUnavailable`] if the token provider has no
    ///   credential; no socket is opened and nothing is retried.
    /// - [`GatewayError::Transport`] if the handshake failed; reconnection continues
    ///   in the background.
    /// - [`GatewayError::Cancelled`] if a disconnect interrupted the attempt.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    /// Close the connection with a normal-closure code and cancel pending timers.
    ///
    /// With `manual` set, automatic reconnection stays off until the next
    /// [`connect`](Self::connect) or [`reconnect`](Self::reconnect). Otherwise an
    /// active client hands off to the reconnection backoff and dials again.
    pub async fn disconnect(&self, manual: bool) {
        let _ = self
            .request(|reply| Command::Disconnect { manual, reply })
            .await;
    }

    /// Drop the current connection, reset the attempt counter and connect again.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn reconnect(&self) -> Result<(), GatewayError> {
        self.request(|reply| Command::Reconnect { reply }).await?
    }

    /// Send an event, or queue it until the next successful open.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Protocol`] if the payload cannot be serialized or the
    /// event type is empty, and [`GatewayError::ClientClosed`] after shutdown.
    pub async fn send_message<P>(&self, event_type: &str, payload: &P) -> Result<SendOutcome, GatewayError>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)
            .map_err(|e| GatewayError::Protocol(format!("payload not serializable: {e}")))?;
        let event_type = event_type.to_string();
        self.request(|reply| Command::Send {
            event_type,
            payload,
            reply,
        })
        .await?
    }

    /// Register a handler for an application event type.
    pub fn on<F>(&self, event_type: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Frame) -> HandlerResult + Send + Sync + 'static,
    {
        self.router.on(event_type, handler)
    }

    /// Remove a handler. Returns `false` if it was not registered for `event_type`.
    pub fn off(&self, event_type: &str, id: HandlerId) -> bool {
        self.router.off(event_type, id)
    }

    /// Call `listener` on every state change.
    pub fn on_connection_state_change<F>(&self, listener: F) -> StateSubscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.observers.subscribe(listener)
    }

    /// Current state snapshot.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Current metrics snapshot.
    #[must_use]
    pub fn connection_metrics(&self) -> ConnectionMetrics {
        self.metrics.borrow().clone()
    }

    /// Watch channel of state snapshots.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Watch channel of metrics snapshots.
    #[must_use]
    pub fn subscribe_metrics(&self) -> watch::Receiver<ConnectionMetrics> {
        self.metrics.clone()
    }

    /// Wait until the connection reaches `phase`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ClientClosed`] if the driver stops first.
    pub async fn wait_for_phase(&self, phase: ConnectionPhase) -> Result<ConnectionState, GatewayError> {
        let mut state = self.state.clone();
        let snapshot = state
            .wait_for(|s| s.phase == phase)
            .await
            .map_err(|_| GatewayError::ClientClosed)?
            .clone();
        Ok(snapshot)
    }

    /// Disconnect, discard queued messages and stop the driver.
    pub async fn shutdown(self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }
}
