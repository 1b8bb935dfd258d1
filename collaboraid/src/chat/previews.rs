//! One preview per peer, derived from every message the user sent or received.

use std::collections::HashMap;

use chrono::TimeDelta;

use collaboraid_proto::message::{Message, Timestamp, UserId};

use super::reconcile_into;

/// Summary line of one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationPreview {
    pub peer_id: UserId,
    pub peer_name: Option<String>,
    pub last_message: String,
    pub timestamp: Timestamp,
    /// The last message came from the peer and is not read yet.
    pub has_unread: bool,
    /// Messages from the peer not read yet, across the whole conversation.
    pub unread_count: usize,
    pub last_from_me: bool,
}

impl ConversationPreview {
    fn from_message(me: UserId, message: &Message) -> Self {
        let from_me = message.sender_id == me;
        Self {
            peer_id: message.peer_of(me),
            peer_name: message.peer_username_of(me).map(str::to_string),
            last_message: message.content.clone(),
            timestamp: message.timestamp,
            has_unread: !from_me && !message.read,
            unread_count: usize::from(!from_me && !message.read),
            last_from_me: from_me,
        }
    }

    /// Name to show for the peer.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.peer_name
            .clone()
            .unwrap_or_else(|| format!("user {}", self.peer_id))
    }

    /// Coarse age of the last message relative to `now`.
    ///
    /// `Today` under a day, `Yesterday` under two, then days, weeks and
    /// months (`3d`, `2w`, `4mo`). Timestamps in the future count as today.
    #[must_use]
    pub fn relative_label(&self, now: Timestamp) -> String {
        relative_label(self.timestamp.elapsed_until(now))
    }
}

fn relative_label(age: TimeDelta) -> String {
    let hours = age.num_hours();
    let days = age.num_days();
    match hours {
        h if h < 24 => "Today".to_string(),
        h if h < 48 => "Yesterday".to_string(),
        h if h < 24 * 7 => format!("{days}d"),
        h if h < 24 * 30 => format!("{}w", days / 7),
        _ => format!("{}mo", days / 30),
    }
}

/// Per-peer previews and message lists for the signed-in user.
#[derive(Debug, Clone)]
pub struct ConversationListAggregator {
    me: UserId,
    previews: HashMap<UserId, ConversationPreview>,
    conversations: HashMap<UserId, Vec<Message>>,
}

impl ConversationListAggregator {
    #[must_use]
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            previews: HashMap::new(),
            conversations: HashMap::new(),
        }
    }

    /// Folds one message in. Returns whether the peer's preview changed.
    ///
    /// A message replaces the preview when its timestamp is newer than or
    /// equal to the current one, so the later arrival wins ties. The unread
    /// count is recounted either way, so a read copy of an older message
    /// still lowers it. Messages the user is not part of are ignored.
    pub fn apply(&mut self, message: &Message) -> bool {
        if !message.involves(self.me) {
            tracing::debug!(sender_id = %message.sender_id, "ignoring message for another user");
            return false;
        }
        let peer = message.peer_of(self.me);
        let list = self.conversations.entry(peer).or_default();
        reconcile_into(list, message.clone());
        let unread_count = list
            .iter()
            .filter(|m| m.sender_id == peer && !m.read)
            .count();

        let mut candidate = ConversationPreview::from_message(self.me, message);
        candidate.unread_count = unread_count;
        match self.previews.get_mut(&peer) {
            Some(current) if candidate.timestamp >= current.timestamp => {
                let peer_name = candidate.peer_name.clone().or_else(|| current.peer_name.take());
                *current = ConversationPreview {
                    peer_name,
                    ..candidate
                };
                true
            }
            Some(current) => {
                // Older message; still learn the peer's name from it.
                let mut changed = current.unread_count != unread_count;
                current.unread_count = unread_count;
                if current.peer_name.is_none() && candidate.peer_name.is_some() {
                    current.peer_name = candidate.peer_name;
                    changed = true;
                }
                changed
            }
            None => {
                self.previews.insert(peer, candidate);
                true
            }
        }
    }

    /// Rebuilds everything from a full history load.
    pub fn load(&mut self, messages: impl IntoIterator<Item = Message>) {
        let mut messages: Vec<Message> = messages.into_iter().collect();
        messages.sort_by_key(|m| m.timestamp);
        self.previews.clear();
        self.conversations.clear();
        for message in &messages {
            self.apply(message);
        }
        tracing::debug!(
            messages = messages.len(),
            peers = self.previews.len(),
            "conversation list rebuilt"
        );
    }

    /// Replaces the message list of `peer` with a freshly loaded history.
    pub fn load_conversation(&mut self, peer: UserId, messages: impl IntoIterator<Item = Message>) {
        self.conversations.remove(&peer);
        let mut messages: Vec<Message> = messages
            .into_iter()
            .filter(|m| m.involves(self.me) && m.peer_of(self.me) == peer)
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        for message in &messages {
            self.apply(message);
        }
    }

    /// Every preview, newest first. Ties are ordered by peer id.
    #[must_use]
    pub fn previews(&self) -> Vec<ConversationPreview> {
        let mut list: Vec<_> = self.previews.values().cloned().collect();
        list.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.peer_id.get().cmp(&b.peer_id.get()))
        });
        list
    }

    #[must_use]
    pub fn preview(&self, peer: UserId) -> Option<&ConversationPreview> {
        self.previews.get(&peer)
    }

    /// Messages exchanged with `peer`, in arrival order.
    #[must_use]
    pub fn conversation(&self, peer: UserId) -> &[Message] {
        self.conversations.get(&peer).map_or(&[], Vec::as_slice)
    }

    /// Number of peers with a preview.
    #[must_use]
    pub fn len(&self) -> usize {
        self.previews.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.previews.is_empty()
    }
}
