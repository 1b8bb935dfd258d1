//! Authenticated user session.
//!
//! A [`Session`] is built once from configuration and handed to every
//! component that needs the user id or the bearer token.

use std::fmt;

use collaboraid_proto::message::UserId;

/// Immutable identity and credentials of the signed-in user.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    user_id: UserId,
    username: String,
    token: String,
}

impl Session {
    /// Creates a session for `user_id` authenticated by `token`.
    pub fn new(user_id: UserId, username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
            token: token.into(),
        }
    }

    /// The signed-in user's id.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    /// The signed-in user's display name.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Bearer token for REST and STOMP authentication.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// `Authorization` header value.
    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}
