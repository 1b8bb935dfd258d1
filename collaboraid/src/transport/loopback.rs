//! Loopback broker for testing.
//!
//! [`LoopbackBroker`] stands in for the backend's STOMP broker inside the
//! process. Every connected [`LoopbackTransport`] is subscribed to its user's
//! topic; an accepted publish is echoed back to both participants as a
//! server-confirmed message carrying a fresh id and the sender's temp id.
//! Echoing the temp id is the contract the client assumes; the current
//! backend's message DTO does not carry it yet. Turn the echo off with
//! [`LoopbackBroker::set_echo`] to drive that case.
//!
//! The broker can be switched offline (dropping every live link and
//! refusing new ones) or told to reject publishes, which makes the
//! reconnect and queueing paths easy to drive from tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use collaboraid_proto::message::{
    Message, MessageId, OutgoingMessage, SendStatus, Timestamp, UserId,
};

use super::{Connector, Transport, TransportError};
use crate::session::Session;

/// Per-link channel capacity.
const LINK_BUFFER: usize = 256;

struct Link {
    id: usize,
    user_id: UserId,
    tx: mpsc::Sender<Message>,
}

struct BrokerInner {
    online: AtomicBool,
    reject: AtomicBool,
    echo: AtomicBool,
    next_id: AtomicI64,
    connects: AtomicUsize,
    published: Mutex<Vec<OutgoingMessage>>,
    links: Mutex<Vec<Link>>,
}

/// In-process message broker shared by loopback transports.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct LoopbackBroker {
    inner: Arc<BrokerInner>,
}

impl LoopbackBroker {
    /// Creates an online broker that echoes accepted publishes.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                online: AtomicBool::new(true),
                reject: AtomicBool::new(false),
                echo: AtomicBool::new(true),
                next_id: AtomicI64::new(1),
                connects: AtomicUsize::new(0),
                published: Mutex::new(Vec::new()),
                links: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a connector bound to this broker.
    #[must_use]
    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector {
            broker: self.clone(),
        }
    }

    /// Switches the broker on or off.
    ///
    /// Going offline drops every live link: their `recv` ends with
    /// `ConnectionClosed` and new connects fail until the broker is back.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
        if !online {
            let dropped = std::mem::take(&mut *self.inner.links.lock());
            tracing::debug!(links = dropped.len(), "loopback broker went offline");
        }
    }

    /// Whether the broker accepts connections.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Makes every publish fail with `Rejected` while `reject` is set.
    pub fn set_reject(&self, reject: bool) {
        self.inner.reject.store(reject, Ordering::SeqCst);
    }

    /// Enables or disables echoing accepted publishes back to participants.
    pub fn set_echo(&self, echo: bool) {
        self.inner.echo.store(echo, Ordering::SeqCst);
    }

    /// Every publish the broker accepted, in order.
    #[must_use]
    pub fn published(&self) -> Vec<OutgoingMessage> {
        self.inner.published.lock().clone()
    }

    /// How many links have been established so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Number of links currently attached.
    #[must_use]
    pub fn live_links(&self) -> usize {
        let mut links = self.inner.links.lock();
        links.retain(|l| !l.tx.is_closed());
        links.len()
    }

    /// Delivers `message` to every link of its sender and receiver.
    pub fn inject(&self, message: &Message) {
        self.route(message);
    }

    fn attach(&self, session: &Session) -> Result<LoopbackTransport, TransportError> {
        if !self.is_online() {
            return Err(TransportError::Unreachable("loopback broker".into()));
        }
        let (tx, rx) = mpsc::channel(LINK_BUFFER);
        let link_id = self.inner.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.links.lock().push(Link {
            id: link_id,
            user_id: session.user_id(),
            tx,
        });
        tracing::debug!(user_id = %session.user_id(), link_id, "loopback link attached");
        Ok(LoopbackTransport {
            link_id,
            user_id: session.user_id(),
            username: session.username().to_string(),
            broker: self.clone(),
            rx: AsyncMutex::new(rx),
            open: AtomicBool::new(true),
        })
    }

    fn detach(&self, link_id: usize) {
        self.inner.links.lock().retain(|l| l.id != link_id);
    }

    fn accept(
        &self,
        sender_id: UserId,
        sender_username: &str,
        outgoing: &OutgoingMessage,
    ) -> Result<(), TransportError> {
        if !self.is_online() {
            return Err(TransportError::ConnectionClosed);
        }
        if self.inner.reject.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("loopback broker rejects sends".into()));
        }
        self.inner.published.lock().push(outgoing.clone());

        if self.inner.echo.load(Ordering::SeqCst) {
            let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
            let confirmed = Message {
                id: Some(MessageId::new(id)),
                temp_id: Some(outgoing.temp_id),
                sender_id,
                sender_username: Some(sender_username.to_string()),
                receiver_id: outgoing.receiver_id,
                receiver_username: None,
                content: outgoing.content.clone(),
                timestamp: Timestamp::now(),
                read: false,
                send_status: SendStatus::Sent,
            };
            self.route(&confirmed);
        }
        Ok(())
    }

    fn route(&self, message: &Message) {
        let mut links = self.inner.links.lock();
        links.retain(|l| !l.tx.is_closed());
        for link in links.iter().filter(|l| message.involves(l.user_id)) {
            if link.tx.try_send(message.clone()).is_err() {
                tracing::warn!(user_id = %link.user_id, "loopback link full, dropping message");
            }
        }
    }
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Connector`] that attaches links to a [`LoopbackBroker`].
#[derive(Clone)]
pub struct LoopbackConnector {
    broker: LoopbackBroker,
}

impl LoopbackConnector {
    /// The broker this connector attaches to.
    #[must_use]
    pub const fn broker(&self) -> &LoopbackBroker {
        &self.broker
    }
}

impl Connector for LoopbackConnector {
    type Transport = LoopbackTransport;

    async fn connect(&self, session: &Session) -> Result<LoopbackTransport, TransportError> {
        self.broker.attach(session)
    }
}

/// One user's link to a [`LoopbackBroker`].
pub struct LoopbackTransport {
    link_id: usize,
    user_id: UserId,
    username: String,
    broker: LoopbackBroker,
    rx: AsyncMutex<mpsc::Receiver<Message>>,
    open: AtomicBool,
}

impl Transport for LoopbackTransport {
    async fn publish(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.broker.accept(self.user_id, &self.username, message)
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        let mut rx = self.rx.lock().await;
        let received = rx.recv().await;
        if received.is_none() {
            self.open.store(false, Ordering::SeqCst);
        }
        received.ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.broker.is_online()
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.broker.detach(self.link_id);
    }
}
