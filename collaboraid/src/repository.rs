//! Message repository: the single entry point for sending and loading messages.
//!
//! Wraps the [`ConnectionManager`] for live traffic and a [`HistoryApi`]
//! for stored history. It holds no state of its own.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use collaboraid_proto::message::{Message, OutgoingMessage, UserId};

use crate::api::{ApiError, HistoryApi};
use crate::connection::ConnectionManager;
use crate::session::Session;
use crate::transport::{Connector, TransportError};

/// Why a send did not reach the broker.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The message is not sendable as-is.
    #[error("invalid message: {0}")]
    Validation(&'static str),

    /// No live link.
    #[error("not connected")]
    NotConnected,

    /// The link failed while publishing.
    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for SendError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected => Self::NotConnected,
            other => Self::Transport(other),
        }
    }
}

/// Live and stored messages of one session.
pub struct MessageRepository<C: Connector, H: HistoryApi> {
    connection: ConnectionManager<C>,
    history: Arc<H>,
}

impl<C: Connector, H: HistoryApi> Clone for MessageRepository<C, H> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            history: Arc::clone(&self.history),
        }
    }
}

impl<C: Connector, H: HistoryApi> MessageRepository<C, H> {
    /// Combines a connection manager and a history backend.
    pub fn new(connection: ConnectionManager<C>, history: H) -> Self {
        Self {
            connection,
            history: Arc::new(history),
        }
    }

    /// Starts the live link (idempotent).
    pub fn connect(&self) {
        self.connection.connect();
    }

    /// Stops the live link.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Hands `message` to the broker.
    ///
    /// `true` only means the transport accepted it; confirmation arrives on
    /// [`message_updates`](Self::message_updates).
    pub async fn send_message(&self, message: &OutgoingMessage) -> bool {
        match self.try_send(message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    temp_id = %message.temp_id,
                    receiver_id = %message.receiver_id,
                    err = %e,
                    "send failed"
                );
                false
            }
        }
    }

    /// Like [`send_message`](Self::send_message) but keeps the reason.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Validation`] for blank content,
    /// [`SendError::NotConnected`] without a live link and
    /// [`SendError::Transport`] if the publish itself fails.
    pub async fn try_send(&self, message: &OutgoingMessage) -> Result<(), SendError> {
        if message.content.trim().is_empty() {
            return Err(SendError::Validation("message content is blank"));
        }
        self.connection.send(message).await?;
        tracing::debug!(temp_id = %message.temp_id, "message handed to broker");
        Ok(())
    }

    /// Full history with `peer`.
    ///
    /// # Errors
    ///
    /// Propagates the history backend's [`ApiError`].
    pub async fn get_conversation(&self, peer: UserId) -> Result<Vec<Message>, ApiError> {
        self.history.conversation(peer).await
    }

    /// Every message the session user sent.
    ///
    /// # Errors
    ///
    /// Propagates the history backend's [`ApiError`].
    pub async fn get_sent_messages(&self) -> Result<Vec<Message>, ApiError> {
        self.history.sent().await
    }

    /// Every message the session user received.
    ///
    /// # Errors
    ///
    /// Propagates the history backend's [`ApiError`].
    pub async fn get_received_messages(&self) -> Result<Vec<Message>, ApiError> {
        self.history.received().await
    }

    /// Independent stream of inbound messages.
    #[must_use]
    pub fn message_updates(&self) -> broadcast::Receiver<Message> {
        self.connection.subscribe()
    }

    /// Connection status transitions.
    #[must_use]
    pub fn connection_status(&self) -> watch::Receiver<bool> {
        self.connection.connection_status()
    }

    /// Whether a link is up right now.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// The session this repository acts for.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        self.connection.session()
    }
}
