//! # Connection Supervisor
//!
//! Owns the single logical broker connection and its lifecycle:
//!
//! ```text
//! Disconnected → Connecting → Open → Closing → Closed
//!                    ↑          │
//!                    └─ Failed ←┘   (unexpected close, failed connect)
//! ```
//!
//! The state is published through a `watch` channel. The supervisor holds
//! the only strong reference to every broker channel it opens and hands out
//! [`ChannelHandle`]s that merely observe them; when the connection leaves
//! `Open` the strong references are dropped and every handle stops
//! upgrading.
//!
//! [`ConnectionSupervisor::supervise`] drives a [`ConnectionSession`] over
//! successive connections: connect, run the session until the connection is
//! lost or the session fails, wait out the [`ReconnectPolicy`] delay, repeat.
//! An explicit shutdown stops the loop and no reconnect is ever scheduled
//! after it.

use crate::error::{ReliabilityError, Result};
use crate::policy::ReconnectPolicy;
use async_trait::async_trait;
use broker::{BrokerChannel, BrokerConnection, Connector};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use types::{CloseReason, ConnectionState};

/// Non-owning reference to a broker channel opened by the supervisor
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: u16,
    channel: Weak<dyn BrokerChannel>,
}

impl ChannelHandle {
    pub fn new(channel: &Arc<dyn BrokerChannel>) -> Self {
        Self {
            id: channel.id(),
            channel: Arc::downgrade(channel),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// The channel, if the supervisor still holds it and it is open
    pub fn upgrade(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel.upgrade().filter(|channel| channel.is_open())
    }

    pub fn is_valid(&self) -> bool {
        self.upgrade().is_some()
    }
}

/// Why a connection session ended
#[derive(Debug)]
pub enum SessionEnd {
    /// Shutdown was requested
    Shutdown,
    /// The broker connection closed underneath the session
    ConnectionLost(CloseReason),
    /// The session could not continue on this connection
    Failed(ReliabilityError),
}

/// Work performed on each connection the supervisor establishes
#[async_trait]
pub trait ConnectionSession: Send + Sync {
    /// Acquire channels and serve traffic until the connection is lost,
    /// the session fails or shutdown is requested
    async fn run(
        &self,
        supervisor: &ConnectionSupervisor,
        connection: Arc<dyn BrokerConnection>,
    ) -> SessionEnd;

    /// Drop per-connection state after a session ended without shutdown
    async fn detach(&self);
}

#[derive(Debug, Default)]
pub struct SupervisorMetrics {
    pub connect_attempts: AtomicU64,
    pub successful_connects: AtomicU64,
    pub reconnects_scheduled: AtomicU64,
}

/// Point-in-time copy of [`SupervisorMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    pub connect_attempts: u64,
    pub successful_connects: u64,
    pub reconnects_scheduled: u64,
}

impl SupervisorMetrics {
    pub fn snapshot(&self) -> SupervisorStats {
        SupervisorStats {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            successful_connects: self.successful_connects.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct SupervisorInner {
    connection: Option<Arc<dyn BrokerConnection>>,
    channels: Vec<Arc<dyn BrokerChannel>>,
    consecutive_failures: u32,
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    url: String,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    inner: Mutex<SupervisorInner>,
    metrics: SupervisorMetrics,
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("url", &redact_url(&self.url))
            .field("state", &*self.state_tx.borrow())
            .field("policy", &self.policy)
            .finish()
    }
}

impl ConnectionSupervisor {
    pub fn new(connector: Arc<dyn Connector>, url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            connector,
            url: url.into(),
            policy,
            state_tx,
            shutdown_tx,
            inner: Mutex::new(SupervisorInner::default()),
            metrics: SupervisorMetrics::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn stats(&self) -> SupervisorStats {
        self.metrics.snapshot()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Flag shutdown without closing anything yet. Running sessions and the
    /// reconnect wait observe the flag and stop.
    pub fn request_shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    /// Resolve once shutdown has been requested
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Apply a state change. Nothing leaves `Closed`, and `Closing` only
    /// moves on to `Closed` or `Failed`. Returns whether `next` is the state
    /// afterwards.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut applied = true;
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            if !state.can_transition_to(&next) {
                if matches!(state, ConnectionState::Closing | ConnectionState::Closed) {
                    debug!(from = %state, to = %next, "State change refused after close");
                    applied = false;
                    return false;
                }
                warn!(from = %state, to = %next, "Unexpected connection state transition");
            }
            info!(from = %state, to = %next, "Connection state changed");
            *state = next;
            true
        });
        applied
    }

    /// Open the connection, suspending until it is open or the attempt failed
    pub async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        if self.is_shutting_down() || self.state().is_terminal() {
            return Err(ReliabilityError::Closed);
        }

        self.transition(ConnectionState::Connecting);
        let attempt = self.metrics.connect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(attempt, url = %redact_url(&self.url), "Connecting to broker");

        let connection = match self.connector.connect(&self.url).await {
            Ok(connection) => connection,
            Err(err) => {
                warn!(attempt, error = %err, "Broker connection attempt failed");
                self.transition(ConnectionState::Failed(err.close_reason()));
                return Err(ReliabilityError::Connection(err));
            }
        };

        // close() may have run while the attempt was in flight
        let stored = {
            let mut inner = self.inner.lock();
            if self.is_shutting_down() || self.state().is_terminal() {
                false
            } else {
                inner.connection = Some(connection.clone());
                inner.consecutive_failures = 0;
                true
            }
        };
        if !stored || !self.transition(ConnectionState::Open) {
            self.discard(&connection).await;
            return Err(ReliabilityError::Closed);
        }

        self.metrics.successful_connects.fetch_add(1, Ordering::Relaxed);
        Ok(connection)
    }

    /// Close a connection that completed after shutdown began
    async fn discard(&self, connection: &Arc<dyn BrokerConnection>) {
        {
            let mut inner = self.inner.lock();
            if inner
                .connection
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, connection))
            {
                inner.connection = None;
            }
        }
        info!("Connection opened after close, discarding it");
        if connection.is_open() {
            if let Err(err) = connection.close(CloseReason::normal()).await {
                debug!(error = %err, "Error closing discarded connection");
            }
        }
    }

    /// Open a channel on the current connection
    pub async fn open_channel(&self) -> Result<ChannelHandle> {
        let connection = self
            .inner
            .lock()
            .connection
            .clone()
            .filter(|c| c.is_open())
            .ok_or(ReliabilityError::ChannelUnavailable)?;

        let channel = connection
            .open_channel()
            .await
            .map_err(ReliabilityError::from_broker)?;
        let handle = ChannelHandle::new(&channel);

        let mut inner = self.inner.lock();
        // The connection may have been replaced or dropped during the round trip
        let current = inner
            .connection
            .as_ref()
            .map(|c| Arc::ptr_eq(c, &connection))
            .unwrap_or(false);
        if !current {
            return Err(ReliabilityError::ChannelUnavailable);
        }
        inner.channels.push(channel);
        debug!(channel = handle.id(), "Channel opened");
        Ok(handle)
    }

    /// Drop the strong channel references, invalidating every handle
    fn invalidate(&self) -> Option<Arc<dyn BrokerConnection>> {
        let mut inner = self.inner.lock();
        let dropped = inner.channels.len();
        inner.channels.clear();
        if dropped > 0 {
            debug!(dropped, "Channel handles invalidated");
        }
        inner.connection.take()
    }

    /// React to the connection closing without a requested shutdown.
    ///
    /// Returns the delay before the next connect attempt, or `None` when no
    /// reconnect must happen (shutdown requested or attempts exhausted).
    pub fn handle_close(&self, reason: CloseReason) -> Option<Duration> {
        self.invalidate();

        if self.is_shutting_down() || self.state().is_terminal() {
            debug!(%reason, "Close observed during shutdown, not reconnecting");
            return None;
        }

        self.transition(ConnectionState::Failed(reason.clone()));

        let failures = {
            let mut inner = self.inner.lock();
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.consecutive_failures
        };

        match self.policy.delay_for(failures) {
            Some(delay) => {
                self.metrics.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
                warn!(
                    %reason,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "Connection lost, reconnect scheduled"
                );
                Some(delay)
            }
            None => {
                error!(%reason, failures, "Reconnect attempts exhausted");
                None
            }
        }
    }

    fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Close the connection for good. Idempotent.
    pub async fn close(&self) {
        self.request_shutdown();
        if self.state().is_terminal() {
            return;
        }

        self.transition(ConnectionState::Closing);
        if let Some(connection) = self.invalidate() {
            if connection.is_open() {
                if let Err(err) = connection.close(CloseReason::normal()).await {
                    warn!(error = %err, "Error while closing broker connection");
                }
            }
        }
        self.transition(ConnectionState::Closed);
    }

    /// Run `session` over successive connections until shutdown
    pub async fn supervise(&self, session: &dyn ConnectionSession) -> Result<()> {
        loop {
            if self.is_shutting_down() {
                break;
            }

            let end = match self.connect().await {
                Ok(connection) => {
                    let end = session.run(self, connection.clone()).await;
                    if !matches!(end, SessionEnd::Shutdown) {
                        session.detach().await;
                        if connection.is_open() {
                            // Session failed on a live connection: start over from scratch
                            let reason = match &end {
                                SessionEnd::Failed(err) => err.close_reason(),
                                _ => CloseReason::normal(),
                            };
                            if let Err(err) = connection.close(reason).await {
                                debug!(error = %err, "Error closing failed connection");
                            }
                        }
                    }
                    end
                }
                Err(ReliabilityError::Closed) => break,
                Err(err) => SessionEnd::Failed(err),
            };

            let reason = match end {
                SessionEnd::Shutdown => break,
                SessionEnd::ConnectionLost(reason) => reason,
                SessionEnd::Failed(err) if !err.is_recoverable() => {
                    error!(error = %err, "Connection session failed, not reconnecting");
                    self.close().await;
                    return Err(err);
                }
                SessionEnd::Failed(err) => {
                    warn!(error = %err, "Connection session failed");
                    err.close_reason()
                }
            };

            match self.handle_close(reason) {
                Some(delay) => {
                    tokio::select! {
                        biased;
                        _ = self.shutdown_requested() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None if self.is_shutting_down() => break,
                None => {
                    return Err(ReliabilityError::ReconnectExhausted(
                        self.consecutive_failures().saturating_sub(1),
                    ))
                }
            }
        }

        debug!("Supervision loop stopped");
        Ok(())
    }
}

/// Hide the password of an AMQP URL for logging
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.split_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{}://{}:***@{}", scheme, user, host)
        }
        None => url.to_string(),
    }
}
