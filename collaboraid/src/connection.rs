//! Connection manager: one supervised broker link per session.
//!
//! [`ConnectionManager::connect`] spawns a supervisor task that keeps a
//! link alive. It connects, publishes `true` on the status channel, pumps
//! inbound messages into a broadcast channel, and on link loss publishes
//! `false`, waits the fixed reconnect delay and tries again, until
//! [`ConnectionManager::disconnect`] is called.
//!
//! Connection errors never reach callers: they are logged and show up as
//! a `false` status.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use collaboraid_proto::message::{Message, OutgoingMessage};

use crate::session::Session;
use crate::transport::{Connector, Transport, TransportError};

/// Default capacity of the inbound fan-out channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

struct Inner<C: Connector> {
    connector: C,
    session: Arc<Session>,
    reconnect_delay: Duration,
    status_tx: watch::Sender<bool>,
    updates_tx: broadcast::Sender<Message>,
    current: Mutex<Option<Arc<C::Transport>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> Inner<C> {
    /// Publishes only real transitions.
    fn set_connected(&self, connected: bool) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
        if changed {
            tracing::info!(user_id = %self.session.user_id(), connected, "connection status changed");
        }
    }
}

/// Owns the single broker link of a session.
///
/// Cloning yields another handle to the same link.
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Creates a manager; nothing happens until [`connect`](Self::connect).
    pub fn new(
        connector: C,
        session: Arc<Session>,
        reconnect_delay: Duration,
        event_buffer: usize,
    ) -> Self {
        let (status_tx, _) = watch::channel(false);
        let (updates_tx, _) = broadcast::channel(event_buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                connector,
                session,
                reconnect_delay,
                status_tx,
                updates_tx,
                current: Mutex::new(None),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Starts the supervisor if it is not already running.
    ///
    /// Safe to call any number of times. Must be called from within a
    /// Tokio runtime.
    pub fn connect(&self) {
        let mut supervisor = self.inner.supervisor.lock();
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!("connect ignored, supervisor already running");
            return;
        }
        *supervisor = Some(tokio::spawn(supervise(Arc::clone(&self.inner))));
    }

    /// Stops reconnecting and closes the live link, if any.
    pub async fn disconnect(&self) {
        let handle = self.inner.supervisor.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        let transport = self.inner.current.lock().take();
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.inner.set_connected(false);
    }

    /// Publishes `message` over the live link.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] when no link is up, or the
    /// transport's own error if the publish fails.
    pub async fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        let transport = self
            .inner
            .current
            .lock()
            .clone()
            .filter(|t| t.is_connected())
            .ok_or(TransportError::NotConnected)?;
        transport.publish(message).await
    }

    /// Receiver of connection status transitions.
    ///
    /// The current value is readable immediately with `borrow()`.
    #[must_use]
    pub fn connection_status(&self) -> watch::Receiver<bool> {
        self.inner.status_tx.subscribe()
    }

    /// Whether a link is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.status_tx.borrow()
    }

    /// Independent receiver of every inbound message from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inner.updates_tx.subscribe()
    }

    /// The session this manager authenticates as.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }
}

/// Connect → pump → reconnect loop. Runs until aborted.
async fn supervise<C: Connector>(inner: Arc<Inner<C>>) {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        match inner.connector.connect(&inner.session).await {
            Ok(transport) => {
                attempt = 0;
                let transport = Arc::new(transport);
                *inner.current.lock() = Some(Arc::clone(&transport));
                inner.set_connected(true);
                pump(&inner, &transport).await;
                inner.current.lock().take();
                inner.set_connected(false);
            }
            Err(e) => {
                tracing::warn!(attempt, err = %e, "connect failed");
            }
        }
        tokio::time::sleep(inner.reconnect_delay).await;
    }
}

async fn pump<C: Connector>(inner: &Inner<C>, transport: &C::Transport) {
    loop {
        match transport.recv().await {
            Ok(message) => {
                tracing::debug!(
                    sender_id = %message.sender_id,
                    receiver_id = %message.receiver_id,
                    "inbound message"
                );
                // No subscribers is fine; the message is simply not observed.
                let _ = inner.updates_tx.send(message);
            }
            Err(e) => {
                tracing::info!(err = %e, "link lost");
                return;
            }
        }
    }
}
