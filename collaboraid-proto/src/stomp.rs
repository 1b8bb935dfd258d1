//! STOMP 1.2 framing over WebSocket text messages.
//!
//! The backend speaks STOMP on top of a WebSocket: the client sends
//! `CONNECT`, waits for `CONNECTED`, subscribes to its personal topic and
//! publishes chat messages with `SEND`. Each WebSocket text message carries
//! one frame terminated by a NUL octet, or a bare end-of-line heart-beat.

use std::time::Duration;

use crate::message::UserId;

/// Destination for outgoing chat messages.
pub const SEND_DESTINATION: &str = "/app/sendMessage";

/// Personal topic on which the server delivers a user's messages.
#[must_use]
pub fn user_topic(user: UserId) -> String {
    format!("/topic/messages/{user}")
}

/// Error type for STOMP encode/decode operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StompError {
    /// The first line is not a known STOMP command.
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),
    /// A header line has no `:` separator.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    /// A header contains an escape sequence STOMP 1.2 does not define.
    #[error("invalid escape sequence in header: {0:?}")]
    InvalidEscape(String),
    /// No blank line separates the headers from the body.
    #[error("frame has no header terminator")]
    MissingHeaderEnd,
    /// The body is not terminated by a NUL octet.
    #[error("frame is not NUL-terminated")]
    Unterminated,
    /// The `content-length` header is unparseable or exceeds the data.
    #[error("invalid content-length: {0}")]
    ContentLength(String),
    /// The `heart-beat` header is not `<cx>,<cy>`.
    #[error("invalid heart-beat header: {0:?}")]
    InvalidHeartBeat(String),
}

/// STOMP commands used by the messaging client and its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// Wire spelling of the command.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED headers are never escaped (STOMP 1.2).
    const fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Stomp | Self::Connected)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heart-beat intervals; zero means "disabled".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    /// How often this side promises to send something.
    pub outgoing: Duration,
    /// How often this side wants to receive something.
    pub incoming: Duration,
}

impl HeartBeat {
    /// Heart-beat settings from millisecond values.
    #[must_use]
    pub const fn from_millis(outgoing: u64, incoming: u64) -> Self {
        Self {
            outgoing: Duration::from_millis(outgoing),
            incoming: Duration::from_millis(incoming),
        }
    }

    /// Parses a `heart-beat` header value (`"<cx>,<cy>"`).
    ///
    /// # Errors
    ///
    /// Returns `StompError::InvalidHeartBeat` if the value is not two
    /// comma-separated millisecond counts.
    pub fn parse(raw: &str) -> Result<Self, StompError> {
        let invalid = || StompError::InvalidHeartBeat(raw.to_string());
        let (cx, cy) = raw.split_once(',').ok_or_else(invalid)?;
        let cx = cx.trim().parse::<u64>().map_err(|_| invalid())?;
        let cy = cy.trim().parse::<u64>().map_err(|_| invalid())?;
        Ok(Self::from_millis(cx, cy))
    }

    /// Renders the header value.
    #[must_use]
    pub fn header_value(&self) -> String {
        format!(
            "{},{}",
            self.outgoing.as_millis(),
            self.incoming.as_millis()
        )
    }

    /// Negotiates the effective intervals from the client's point of view.
    ///
    /// Each direction is disabled if either side disables it, otherwise the
    /// larger of the two requested intervals wins.
    #[must_use]
    pub fn negotiate(client: Self, server: Self) -> Self {
        let pick = |mine: Duration, theirs: Duration| {
            if mine.is_zero() || theirs.is_zero() {
                Duration::ZERO
            } else {
                mine.max(theirs)
            }
        };
        Self {
            outgoing: pick(client.outgoing, server.incoming),
            incoming: pick(client.incoming, server.outgoing),
        }
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Headers in wire order. Repeated names are kept; the first one wins.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    /// An empty frame with no headers.
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replaces the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of the named header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// The authenticated `CONNECT` frame the backend expects.
    #[must_use]
    pub fn connect(host: &str, token: &str, user: UserId, heart_beat: HeartBeat) -> Self {
        Self::new(Command::Connect)
            .with_header("accept-version", "1.2,1.1,1.0")
            .with_header("host", host)
            .with_header("heart-beat", heart_beat.header_value())
            .with_header("Authorization", format!("Bearer {token}"))
            .with_header("userId", user.to_string())
    }

    /// A `SUBSCRIBE` frame with automatic acknowledgement.
    #[must_use]
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    /// A `SEND` frame carrying a JSON document.
    #[must_use]
    pub fn send_json(destination: &str, json: String) -> Self {
        Self::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-type", "application/json")
            .with_header("content-length", json.len().to_string())
            .with_body(json)
    }

    /// A `DISCONNECT` frame asking for a receipt.
    #[must_use]
    pub fn disconnect(receipt: &str) -> Self {
        Self::new(Command::Disconnect).with_header("receipt", receipt)
    }
}

/// Something received on the wire: a frame, or a bare heart-beat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(Frame),
    Heartbeat,
}

/// Heart-beat payload sent by the client.
pub const HEARTBEAT: &str = "\n";

/// Encodes a frame as a WebSocket text payload.
#[must_use]
pub fn encode(frame: &Frame) -> String {
    let escape = frame.command.escapes_headers();
    let mut out = String::with_capacity(32 + frame.body.len());
    out.push_str(frame.command.as_str());
    out.push('\n');
    for (name, value) in &frame.headers {
        if escape {
            push_escaped(&mut out, name);
            out.push(':');
            push_escaped(&mut out, value);
        } else {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
        }
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&frame.body);
    out.push('\0');
    out
}

/// Decodes one WebSocket text payload.
///
/// Leading end-of-lines are heart-beats; a payload made only of them
/// decodes to [`Inbound::Heartbeat`].
///
/// # Errors
///
/// Returns a [`StompError`] describing the first structural problem found.
pub fn decode(raw: &str) -> Result<Inbound, StompError> {
    let raw = raw.trim_start_matches(['\r', '\n']);
    if raw.is_empty() {
        return Ok(Inbound::Heartbeat);
    }

    let (head, rest) = split_head(raw).ok_or(StompError::MissingHeaderEnd)?;
    let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
    let command_line = lines.next().unwrap_or_default();
    let command = Command::parse(command_line)
        .ok_or_else(|| StompError::UnknownCommand(command_line.to_string()))?;

    let escaped = command.escapes_headers();
    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| StompError::MalformedHeader(line.to_string()))?;
        if escaped {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| StompError::ContentLength(v.clone()))
        })
        .transpose()?;

    let body = match content_length {
        Some(len) => {
            let body = rest
                .get(..len)
                .ok_or_else(|| StompError::ContentLength(format!("{len} exceeds frame")))?;
            if !rest[len..].starts_with('\0') {
                return Err(StompError::Unterminated);
            }
            body
        }
        None => {
            let end = rest.find('\0').ok_or(StompError::Unterminated)?;
            &rest[..end]
        }
    };

    Ok(Inbound::Frame(Frame {
        command,
        headers,
        body: body.to_string(),
    }))
}

/// Splits at the first blank line, accepting LF or CRLF line endings.
fn split_head(raw: &str) -> Option<(&str, &str)> {
    let lf = raw.find("\n\n").map(|i| (i, i + 2));
    let crlf = raw.find("\r\n\r\n").map(|i| (i, i + 4));
    let (end, body_start) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (a, b) => a.or(b)?,
    };
    Some((&raw[..end], &raw[body_start..]))
}

fn push_escaped(out: &mut String, raw: &str) {
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
}

fn unescape(raw: &str) -> Result<String, StompError> {
    if !raw.contains('\\') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(StompError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}
