//! Message data model shared by every `CollaborAid` client component.
//!
//! A [`Message`] is either server-confirmed (it carries a [`MessageId`]) or
//! optimistic (it only carries a client-generated [`TempId`]). The client-only
//! [`SendStatus`] tracks the delivery lifecycle of optimistic entries and is
//! never sent to the server.

use std::fmt::Write as _;
use std::str::FromStr;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Identifier of a user (a peer in a one-to-one conversation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    /// Wraps a raw backend user id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw backend user id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(i64);

impl MessageId {
    /// Wraps a raw backend message id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw backend message id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated identifier for an optimistic message (random UUID v4).
///
/// Unique per send attempt created by the UI. When the server echoes it
/// back, the confirmed message replaces the optimistic one by this key;
/// otherwise the server id and the send result settle the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempId(Uuid);

impl TempId {
    /// Generates a fresh random temporary id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a `TempId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TempId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TempId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TempId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Error returned when a timestamp string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized timestamp: {0:?}")]
pub struct TimestampError(pub String);

/// Naive formats accepted from the backend, tried in order.
///
/// `%.f` also matches an absent fraction.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

/// Canonical rendering used for provisional client timestamps.
const CANONICAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Wall-clock send time, compared by value.
///
/// The backend emits local date-times without an offset, so the value is
/// kept as a naive local date-time. RFC 3339 input is converted to local
/// time before it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(NaiveDateTime);

impl Timestamp {
    /// Provisional timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        Self(Local::now().naive_local())
    }

    /// Wraps an existing naive date-time.
    #[must_use]
    pub const fn from_naive(value: NaiveDateTime) -> Self {
        Self(value)
    }

    /// Returns the inner naive date-time.
    #[must_use]
    pub const fn as_naive(&self) -> &NaiveDateTime {
        &self.0
    }

    /// Parses any of the timestamp shapes the backend produces.
    ///
    /// # Errors
    ///
    /// Returns [`TimestampError`] if no accepted format matches.
    pub fn parse(raw: &str) -> Result<Self, TimestampError> {
        let raw = raw.trim();
        if let Ok(with_offset) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Self(with_offset.with_timezone(&Local).naive_local()));
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(Self)
            .ok_or_else(|| TimestampError(raw.to_string()))
    }

    /// Whether `fmt` is a chrono format string [`format`](Self::format)
    /// can render.
    #[must_use]
    pub fn is_valid_format(fmt: &str) -> bool {
        !StrftimeItems::new(fmt).any(|item| matches!(item, Item::Error))
    }

    /// Renders the timestamp with a chrono format string.
    ///
    /// An invalid `fmt` falls back to the canonical `%Y-%m-%dT%H:%M:%S`.
    #[must_use]
    pub fn format(&self, fmt: &str) -> String {
        let mut out = String::new();
        if write!(out, "{}", self.0.format(fmt)).is_err() {
            out.clear();
            out.push_str(&self.to_string());
        }
        out
    }

    /// Time elapsed from `self` until `now` (negative if `self` is later).
    #[must_use]
    pub fn elapsed_until(&self, now: Self) -> TimeDelta {
        now.0.signed_duration_since(self.0)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format(CANONICAL_FORMAT))
    }
}

impl FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Client-side delivery state of a message.
///
/// ```text
/// Sending ──► Sent (terminal)
///    │          ▲
///    ├──► Queued ┤  (reconnect sweep)
///    │      │    │
///    └──► Failed ┘  (explicit retry: Failed/Queued ──► Sending)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendStatus {
    /// A delivery attempt is in flight.
    Sending,
    /// The transport accepted the message, or the server echoed it back.
    Sent,
    /// Delivery failed; waiting in the outbound queue for a reconnect sweep.
    Queued,
    /// An explicit retry failed, or the queue policy gave up on it.
    Failed,
}

impl SendStatus {
    /// Whether moving from `self` to `next` is a legal lifecycle step.
    ///
    /// `Sent` is terminal: nothing moves a delivered message backwards.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Sending => matches!(next, Self::Sent | Self::Queued | Self::Failed),
            Self::Queued => matches!(next, Self::Sending | Self::Sent | Self::Failed),
            Self::Failed => matches!(next, Self::Sending | Self::Sent),
            Self::Sent => false,
        }
    }

    /// Upper-case label, matching what the clients display.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Sending => "SENDING",
            Self::Sent => "SENT",
            Self::Queued => "QUEUED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for SendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// A chat message between two users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Server id; `None` until the server confirms the message.
    pub id: Option<MessageId>,
    /// Client id of the optimistic send that produced this message, if any.
    pub temp_id: Option<TempId>,
    /// Author.
    pub sender_id: UserId,
    /// Author display name, when the server provided one.
    pub sender_username: Option<String>,
    /// Recipient.
    pub receiver_id: UserId,
    /// Recipient display name, when the server provided one.
    pub receiver_username: Option<String>,
    /// Text body.
    pub content: String,
    /// Send time (provisional for optimistic entries).
    pub timestamp: Timestamp,
    /// Read acknowledgement, controlled by the server.
    pub read: bool,
    /// Client-only delivery state.
    pub send_status: SendStatus,
}

impl Message {
    /// Builds an optimistic entry for a message the local user is sending.
    #[must_use]
    pub fn optimistic(sender_id: UserId, sender_username: &str, outgoing: &OutgoingMessage) -> Self {
        Self {
            id: None,
            temp_id: Some(outgoing.temp_id),
            sender_id,
            sender_username: Some(sender_username.to_string()),
            receiver_id: outgoing.receiver_id,
            receiver_username: None,
            content: outgoing.content.clone(),
            timestamp: Timestamp::now(),
            read: false,
            send_status: SendStatus::Sending,
        }
    }

    /// Whether the server has assigned an id.
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        self.id.is_some()
    }

    /// Whether `user` is the sender or the receiver.
    #[must_use]
    pub fn involves(&self, user: UserId) -> bool {
        self.sender_id == user || self.receiver_id == user
    }

    /// The other participant, seen from `me`.
    #[must_use]
    pub fn peer_of(&self, me: UserId) -> UserId {
        if self.sender_id == me {
            self.receiver_id
        } else {
            self.sender_id
        }
    }

    /// Display name of the other participant, seen from `me`.
    #[must_use]
    pub fn peer_username_of(&self, me: UserId) -> Option<&str> {
        if self.sender_id == me {
            self.receiver_username.as_deref()
        } else {
            self.sender_username.as_deref()
        }
    }

    /// Dual-key identity match: same server id, or same temp id.
    ///
    /// Absent keys never match each other.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        let same_id = matches!((self.id, other.id), (Some(a), Some(b)) if a == b);
        let same_temp = matches!((self.temp_id, other.temp_id), (Some(a), Some(b)) if a == b);
        same_id || same_temp
    }
}

/// A message waiting to be handed to the transport.
///
/// This is the outbound queue entry: `(receiver, content, temp id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Recipient.
    pub receiver_id: UserId,
    /// Text body.
    pub content: String,
    /// Temp id of the optimistic entry this send belongs to.
    pub temp_id: TempId,
}

impl OutgoingMessage {
    /// Creates an outgoing message with a fresh temp id.
    #[must_use]
    pub fn new(receiver_id: UserId, content: impl Into<String>) -> Self {
        Self {
            receiver_id,
            content: content.into(),
            temp_id: TempId::new(),
        }
    }
}
