//! STOMP-over-WebSocket transport to the backend message broker.
//!
//! [`StompConnector::connect`] performs the full handshake:
//! 1. WebSocket upgrade carrying `Authorization: Bearer <token>`
//! 2. STOMP `CONNECT` with credentials and heart-beat offer
//! 3. wait for `CONNECTED` (bounded by the connect timeout)
//! 4. `SUBSCRIBE` to the user's personal topic
//!
//! A background reader task turns `MESSAGE` frames into [`Message`]s and a
//! heart-beat task keeps the link alive at the negotiated interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use collaboraid_proto::message::{Message, OutgoingMessage, UserId};
use collaboraid_proto::stomp::{self, Command, Frame, HeartBeat, Inbound};
use collaboraid_proto::wire::{SendPayload, WireMessage};

use super::{Connector, Transport, TransportError};
use crate::session::Session;

/// Write half of the WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

/// Read half of the WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Subscription id used for the personal topic.
const SUBSCRIPTION_ID: &str = "sub-0";

/// Inbound channel capacity between the reader task and `recv`.
const INBOUND_BUFFER: usize = 256;

/// How many missed incoming heart-beat intervals are tolerated.
const HEARTBEAT_GRACE: u32 = 2;

/// Establishes [`StompTransport`] links to one backend endpoint.
#[derive(Debug, Clone)]
pub struct StompConnector {
    ws_url: String,
    connect_timeout: Duration,
    heart_beat: HeartBeat,
}

impl StompConnector {
    /// Creates a connector for `ws_url` (`ws://` or `wss://`).
    pub fn new(ws_url: impl Into<String>, connect_timeout: Duration, heart_beat: HeartBeat) -> Self {
        Self {
            ws_url: ws_url.into(),
            connect_timeout,
            heart_beat,
        }
    }

    /// The endpoint this connector dials.
    #[must_use]
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    async fn handshake(&self, session: &Session) -> Result<StompTransport, TransportError> {
        let url = url::Url::parse(&self.ws_url)
            .map_err(|e| TransportError::Handshake(format!("invalid URL {}: {e}", self.ws_url)))?;
        let host = url.host_str().unwrap_or("localhost").to_string();

        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let bearer = HeaderValue::from_str(&session.bearer())
            .map_err(|_| TransportError::Handshake("token is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _response) = connect_async(request).await.map_err(|e| {
            tracing::warn!(url = %self.ws_url, err = %e, "WebSocket connect failed");
            map_ws_connect_error(&self.ws_url, e)
        })?;
        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let connect = Frame::connect(&host, session.token(), session.user_id(), self.heart_beat);
        send_frame(&mut ws_sender, &connect).await?;

        let connected = await_connected(&mut ws_reader).await?;
        let server_hb = match connected.header("heart-beat") {
            Some(raw) => HeartBeat::parse(raw).unwrap_or_else(|e| {
                tracing::warn!(err = %e, "ignoring unparseable server heart-beat");
                HeartBeat::default()
            }),
            None => HeartBeat::default(),
        };
        let negotiated = HeartBeat::negotiate(self.heart_beat, server_hb);

        let topic = stomp::user_topic(session.user_id());
        send_frame(
            &mut ws_sender,
            &Frame::subscribe(SUBSCRIPTION_ID, &topic),
        )
        .await?;

        tracing::info!(
            url = %self.ws_url,
            user_id = %session.user_id(),
            topic = %topic,
            heartbeat_out_ms = u64::try_from(negotiated.outgoing.as_millis()).unwrap_or(u64::MAX),
            heartbeat_in_ms = u64::try_from(negotiated.incoming.as_millis()).unwrap_or(u64::MAX),
            "STOMP session established"
        );

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));
        let ws_sender = Arc::new(Mutex::new(ws_sender));

        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            tx,
            Arc::clone(&connected),
            negotiated.incoming,
        ));
        let heartbeat_handle = (!negotiated.outgoing.is_zero()).then(|| {
            tokio::spawn(heartbeat_loop(
                Arc::clone(&ws_sender),
                Arc::clone(&connected),
                negotiated.outgoing,
            ))
        });

        Ok(StompTransport {
            user_id: session.user_id(),
            username: session.username().to_string(),
            ws_sender,
            incoming: Mutex::new(rx),
            connected,
            reader_handle,
            heartbeat_handle,
        })
    }
}

impl Connector for StompConnector {
    type Transport = StompTransport;

    async fn connect(&self, session: &Session) -> Result<StompTransport, TransportError> {
        tokio::time::timeout(self.connect_timeout, self.handshake(session))
            .await
            .map_err(|_| {
                tracing::warn!(url = %self.ws_url, "STOMP connect timed out");
                TransportError::Timeout
            })?
    }
}

/// A live STOMP session on top of a WebSocket.
pub struct StompTransport {
    user_id: UserId,
    username: String,
    ws_sender: Arc<Mutex<WsSender>>,
    incoming: Mutex<mpsc::Receiver<Message>>,
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
    heartbeat_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Transport for StompTransport {
    async fn publish(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let json = SendPayload::new(self.user_id, &self.username, message)
            .to_json()
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        let frame = Frame::send_json(stomp::SEND_DESTINATION, json);

        let mut sender = self.ws_sender.lock().await;
        sender
            .send(WsMessage::Text(stomp::encode(&frame).into()))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, temp_id = %message.temp_id, "STOMP send failed");
                self.connected.store(false, Ordering::SeqCst);
                TransportError::ConnectionClosed
            })
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if let Some(handle) = &self.heartbeat_handle {
            handle.abort();
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            let mut sender = self.ws_sender.lock().await;
            let bye = stomp::encode(&Frame::disconnect("disconnect-0"));
            if let Err(e) = sender.send(WsMessage::Text(bye.into())).await {
                tracing::debug!(err = %e, "DISCONNECT frame not sent");
            }
            let _ = sender.close().await;
        }
        self.reader_handle.abort();
        tracing::info!(user_id = %self.user_id, "STOMP session closed");
    }
}

impl Drop for StompTransport {
    fn drop(&mut self) {
        self.reader_handle.abort();
        if let Some(handle) = &self.heartbeat_handle {
            handle.abort();
        }
    }
}

async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<(), TransportError> {
    sender
        .send(WsMessage::Text(stomp::encode(frame).into()))
        .await
        .map_err(|e| {
            tracing::warn!(command = %frame.command, err = %e, "failed to send STOMP frame");
            TransportError::ConnectionClosed
        })
}

/// Reads until `CONNECTED`, skipping heart-beats and control frames.
async fn await_connected(reader: &mut WsReader) -> Result<Frame, TransportError> {
    while let Some(next) = reader.next().await {
        match next {
            Ok(WsMessage::Text(text)) => match stomp::decode(text.as_str()) {
                Ok(Inbound::Heartbeat) => {}
                Ok(Inbound::Frame(frame)) if frame.command == Command::Connected => {
                    return Ok(frame);
                }
                Ok(Inbound::Frame(frame)) if frame.command == Command::Error => {
                    let reason = frame
                        .header("message")
                        .map_or_else(|| frame.body.clone(), str::to_string);
                    tracing::warn!(reason = %reason, "broker rejected STOMP CONNECT");
                    return Err(TransportError::Rejected(reason));
                }
                Ok(Inbound::Frame(frame)) => {
                    return Err(TransportError::Handshake(format!(
                        "expected CONNECTED, got {}",
                        frame.command
                    )));
                }
                Err(e) => return Err(TransportError::Codec(e.to_string())),
            },
            Ok(WsMessage::Close(_)) => return Err(TransportError::ConnectionClosed),
            Ok(_) => {}
            Err(e) => {
                return Err(TransportError::Io(std::io::Error::other(format!(
                    "WebSocket error during handshake: {e}"
                ))));
            }
        }
    }
    Err(TransportError::ConnectionClosed)
}

/// Background task that reads frames and forwards chat messages.
///
/// Malformed frames and payloads are logged and skipped. `ERROR` frames,
/// WebSocket close, read errors and missed heart-beats end the task and
/// clear `connected`.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<Message>,
    connected: Arc<AtomicBool>,
    incoming: Duration,
) {
    let deadline = (!incoming.is_zero()).then(|| incoming * HEARTBEAT_GRACE);
    loop {
        let next = match deadline {
            Some(limit) => match tokio::time::timeout(limit, ws_reader.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::warn!(
                        limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                        "no data from broker within heart-beat window"
                    );
                    break;
                }
            },
            None => ws_reader.next().await,
        };
        let Some(next) = next else {
            tracing::info!("broker WebSocket stream ended");
            break;
        };
        match next {
            Ok(WsMessage::Text(text)) => match stomp::decode(text.as_str()) {
                Ok(Inbound::Heartbeat) => {}
                Ok(Inbound::Frame(frame)) => match frame.command {
                    Command::Message => {
                        let parsed = WireMessage::from_json(&frame.body)
                            .and_then(WireMessage::into_message);
                        match parsed {
                            Ok(message) => {
                                if tx.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!(err = %e, "malformed chat payload, skipping"),
                        }
                    }
                    Command::Error => {
                        tracing::warn!(
                            reason = frame.header("message").unwrap_or_default(),
                            "broker sent ERROR frame"
                        );
                        break;
                    }
                    Command::Receipt => {
                        tracing::debug!(receipt = frame.header("receipt-id").unwrap_or_default(), "receipt");
                    }
                    other => tracing::debug!(command = %other, "ignoring unexpected frame"),
                },
                Err(e) => tracing::warn!(err = %e, "malformed STOMP frame, skipping"),
            },
            Ok(WsMessage::Close(_)) => {
                tracing::info!("broker closed the WebSocket");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    tracing::debug!("STOMP reader task exiting");
}

/// Sends an EOL every `interval` while the link is up.
async fn heartbeat_loop(
    ws_sender: Arc<Mutex<WsSender>>,
    connected: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !connected.load(Ordering::SeqCst) {
            break;
        }
        let mut sender = ws_sender.lock().await;
        if let Err(e) = sender.send(WsMessage::Text(stomp::HEARTBEAT.to_string().into())).await {
            tracing::warn!(err = %e, "heart-beat send failed");
            connected.store(false, Ordering::SeqCst);
            break;
        }
    }
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable
            ) {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                TransportError::Rejected(format!("upgrade refused: {status}"))
            } else {
                TransportError::Handshake(format!("HTTP error: status {status}"))
            }
        }
        WsError::Url(e) => TransportError::Handshake(format!("invalid URL: {e}")),
        other => TransportError::Io(std::io::Error::other(format!(
            "WebSocket connection error: {other}"
        ))),
    }
}
