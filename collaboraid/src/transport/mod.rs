//! Transport layer abstraction for the messaging client.
//!
//! A [`Connector`] establishes one live link to the message broker and
//! returns it as a [`Transport`]. The connection manager drives the
//! connector again whenever the link is lost. Implementations:
//! - [`stomp::StompConnector`]: STOMP over WebSocket against the backend
//! - [`loopback::LoopbackConnector`]: in-process broker for tests and demos

pub mod loopback;
pub mod stomp;

use std::future::Future;

use collaboraid_proto::message::{Message, OutgoingMessage};

use crate::session::Session;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No live link exists.
    #[error("not connected")]
    NotConnected,

    /// The link was closed by either side.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The broker refused the operation.
    #[error("rejected by broker: {0}")]
    Rejected(String),

    /// The STOMP handshake did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The endpoint could not be reached.
    #[error("{0} is unreachable")]
    Unreachable(String),

    /// A frame or payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A live link to the message broker.
///
/// A transport is single-use: once [`Transport::recv`] fails the link is
/// gone and the connector must be asked for a new one.
pub trait Transport: Send + Sync + 'static {
    /// Hands `message` to the broker.
    ///
    /// `Ok(())` means the broker accepted the frame. It does not mean the
    /// recipient received it; confirmation arrives as an echo on the inbound
    /// stream.
    fn publish(
        &self,
        message: &OutgoingMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Waits for the next inbound message on the user's topic.
    fn recv(&self) -> impl Future<Output = Result<Message, TransportError>> + Send;

    /// Whether the link is still up.
    fn is_connected(&self) -> bool;

    /// Closes the link politely. Idempotent.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Factory for fresh [`Transport`] links.
pub trait Connector: Send + Sync + 'static {
    /// The transport this connector produces.
    type Transport: Transport;

    /// Establishes a link authenticated as `session`.
    fn connect(
        &self,
        session: &Session,
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}
