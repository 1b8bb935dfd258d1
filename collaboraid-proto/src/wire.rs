//! JSON shapes exchanged with the backend.
//!
//! Inbound messages arrive in two shapes: the flat DTO the server pushes
//! over STOMP and returns from the REST history endpoints, and a nested
//! shape with `sender`/`receiver` objects. [`WireMessage`] accepts both and
//! normalizes them into a [`Message`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{
    Message, MessageId, OutgoingMessage, SendStatus, TempId, Timestamp, TimestampError, UserId,
};

/// Error type for wire conversions.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The JSON document could not be parsed.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A required field is absent in both the flat and nested shapes.
    #[error("missing field: {0}")]
    MissingField(&'static str),
    /// The timestamp has an unrecognized shape.
    #[error(transparent)]
    Timestamp(#[from] TimestampError),
    /// The echoed temp id is not a UUID.
    #[error("invalid tempId {0:?}")]
    TempId(String),
}

/// A participant reference in the nested shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Tolerant view of an inbound message document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub temp_id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<i64>,
    #[serde(default)]
    pub sender_username: Option<String>,
    #[serde(default)]
    pub receiver_id: Option<i64>,
    #[serde(default)]
    pub receiver_username: Option<String>,
    #[serde(default)]
    pub sender: Option<WireUser>,
    #[serde(default)]
    pub receiver: Option<WireUser>,
    #[serde(default)]
    pub content: Option<String>,
    /// Either an ISO string or a `[y, m, d, h, min, s, nanos]` array.
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub read: Option<bool>,
}

impl WireMessage {
    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `WireError::Json` if the text is not a JSON object.
    pub fn from_json(raw: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Normalizes into a confirmed [`Message`].
    ///
    /// Missing `timestamp` defaults to now and missing `read` to `false`.
    /// Flat fields take precedence over nested ones.
    ///
    /// # Errors
    ///
    /// Returns `WireError::MissingField` if either participant id or the
    /// content is absent, and `WireError::Timestamp` if a timestamp is
    /// present but unparseable.
    pub fn into_message(self) -> Result<Message, WireError> {
        let sender = self.sender.unwrap_or_default();
        let receiver = self.receiver.unwrap_or_default();

        let sender_id = self
            .sender_id
            .or(sender.id)
            .ok_or(WireError::MissingField("senderId"))?;
        let receiver_id = self
            .receiver_id
            .or(receiver.id)
            .ok_or(WireError::MissingField("receiverId"))?;
        let content = self.content.ok_or(WireError::MissingField("content"))?;

        let temp_id = self
            .temp_id
            .filter(|t| !t.is_empty())
            .map(|t| t.parse::<TempId>().map_err(|_| WireError::TempId(t)))
            .transpose()?;

        let timestamp = match self.timestamp {
            None | Some(Value::Null) => Timestamp::now(),
            Some(value) => parse_timestamp(&value)?,
        };

        Ok(Message {
            id: self.id.or(self.message_id).map(MessageId::new),
            temp_id,
            sender_id: UserId::new(sender_id),
            sender_username: self.sender_username.or(sender.username),
            receiver_id: UserId::new(receiver_id),
            receiver_username: self.receiver_username.or(receiver.username),
            content,
            timestamp,
            read: self.read.unwrap_or(false),
            send_status: SendStatus::Sent,
        })
    }
}

fn parse_timestamp(value: &Value) -> Result<Timestamp, TimestampError> {
    match value {
        Value::String(raw) => Timestamp::parse(raw),
        Value::Array(parts) => {
            let nums: Vec<i64> = parts.iter().filter_map(Value::as_i64).collect();
            from_parts(&nums).ok_or_else(|| TimestampError(value.to_string()))
        }
        other => Err(TimestampError(other.to_string())),
    }
}

fn from_parts(parts: &[i64]) -> Option<Timestamp> {
    let part = |i: usize| -> Option<u32> {
        parts.get(i).map_or(Some(0), |&v| u32::try_from(v).ok())
    };
    if parts.len() < 3 {
        return None;
    }
    let year = i32::try_from(parts[0]).ok()?;
    let date = chrono::NaiveDate::from_ymd_opt(year, part(1)?, part(2)?)?;
    let time = chrono::NaiveTime::from_hms_nano_opt(part(3)?, part(4)?, part(5)?, part(6)?)?;
    Some(Timestamp::from_naive(date.and_time(time)))
}

/// Body of a `SEND` to the chat destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPayload {
    pub sender: WireUser,
    pub receiver: WireUser,
    pub content: String,
    pub temp_id: String,
}

impl SendPayload {
    /// Builds the payload for `outgoing` sent by the session user.
    #[must_use]
    pub fn new(sender_id: UserId, sender_username: &str, outgoing: &OutgoingMessage) -> Self {
        Self {
            sender: WireUser {
                id: Some(sender_id.get()),
                username: Some(sender_username.to_string()),
            },
            receiver: WireUser {
                id: Some(outgoing.receiver_id.get()),
                username: None,
            },
            content: outgoing.content.clone(),
            temp_id: outgoing.temp_id.to_string(),
        }
    }

    /// Serializes to JSON text.
    ///
    /// # Errors
    ///
    /// Returns `WireError::Json` if serialization fails.
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }
}
