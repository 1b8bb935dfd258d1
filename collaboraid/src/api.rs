//! REST history endpoints of the backend.
//!
//! The live link only carries new messages; existing history is fetched
//! over HTTP. [`HistoryApi`] is the seam, [`RestClient`] the real
//! implementation and [`InMemoryHistory`] a scripted stand-in.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use collaboraid_proto::message::{Message, UserId};
use collaboraid_proto::wire::WireMessage;

use crate::session::Session;

/// Errors from history requests, rendered for display in view state.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The server answered with a non-success status.
    #[error("server returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Server-provided message, or the status reason.
        message: String,
    },

    /// The request could not be sent or the response not read.
    #[error("network error: {0}")]
    Request(#[from] reqwest::Error),

    /// The response body is not a message list.
    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Read access to message history.
pub trait HistoryApi: Send + Sync + 'static {
    /// Full history between the session user and `peer`.
    fn conversation(
        &self,
        peer: UserId,
    ) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send;

    /// Every message the session user sent.
    fn sent(&self) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send;

    /// Every message the session user received.
    fn received(&self) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send;
}

/// [`HistoryApi`] over the backend's REST routes.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    session: Arc<Session>,
}

impl RestClient {
    /// Creates a client for `base_url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Request` if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        session: Arc<Session>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
        })
    }

    async fn fetch(&self, path: &str) -> Result<Vec<Message>, ApiError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(self.session.token())
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(url = %url, err = %e, "history request failed");
                ApiError::from(e)
            })?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let message = error_message(&body)
                .or_else(|| status.canonical_reason().map(str::to_string))
                .unwrap_or_default();
            tracing::warn!(url = %url, status = status.as_u16(), message = %message, "history request rejected");
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let wire: Vec<WireMessage> =
            serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))?;
        let total = wire.len();
        let messages: Vec<Message> = wire
            .into_iter()
            .filter_map(|w| match w.into_message() {
                Ok(m) => Some(m),
                Err(e) => {
                    tracing::warn!(url = %url, err = %e, "skipping malformed history entry");
                    None
                }
            })
            .collect();
        tracing::debug!(url = %url, total, kept = messages.len(), "history loaded");
        Ok(messages)
    }
}

/// Pulls a human-readable `message` or `error` field out of an error body.
fn error_message(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let field = ["message", "error"]
            .iter()
            .find_map(|k| value.get(k).and_then(serde_json::Value::as_str));
        if let Some(text) = field {
            return Some(text.to_string());
        }
    }
    let trimmed = body.trim();
    (!trimmed.is_empty() && trimmed.len() <= 200 && !trimmed.starts_with('<'))
        .then(|| trimmed.to_string())
}

impl HistoryApi for RestClient {
    async fn conversation(&self, peer: UserId) -> Result<Vec<Message>, ApiError> {
        self.fetch(&format!(
            "/api/messages/conversation/user-authenticated/{peer}"
        ))
        .await
    }

    async fn sent(&self) -> Result<Vec<Message>, ApiError> {
        self.fetch("/api/messages/sent").await
    }

    async fn received(&self) -> Result<Vec<Message>, ApiError> {
        self.fetch("/api/messages/received").await
    }
}

/// Scripted in-memory [`HistoryApi`] seen from one user.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct InMemoryHistory {
    me: UserId,
    messages: Arc<Mutex<Vec<Message>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryHistory {
    /// Empty history for `me`.
    #[must_use]
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            messages: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Appends a stored message.
    pub fn push(&self, message: Message) {
        self.messages.lock().push(message);
    }

    /// Makes every request fail with a 503 while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn select(&self, keep: impl Fn(&Message) -> bool) -> Result<Vec<Message>, ApiError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 503,
                message: "history unavailable".into(),
            });
        }
        Ok(self
            .messages
            .lock()
            .iter()
            .filter(|m| keep(m))
            .cloned()
            .collect())
    }
}

impl HistoryApi for InMemoryHistory {
    async fn conversation(&self, peer: UserId) -> Result<Vec<Message>, ApiError> {
        let me = self.me;
        self.select(|m| m.involves(me) && m.peer_of(me) == peer)
    }

    async fn sent(&self) -> Result<Vec<Message>, ApiError> {
        let me = self.me;
        self.select(|m| m.sender_id == me)
    }

    async fn received(&self) -> Result<Vec<Message>, ApiError> {
        let me = self.me;
        self.select(|m| m.receiver_id == me)
    }
}
