//! Conversation state for one peer.
//!
//! [`ConversationState`] owns the message list the presentation layer
//! renders, published through a `watch` store as a [`ConversationView`].
//!
//! # Send flow
//!
//! 1. [`send_message`](ConversationState::send_message) appends an
//!    optimistic entry with status `SENDING`
//! 2. the repository hands it to the broker: `SENT`, or on failure the
//!    entry goes into the [`OutboundQueue`] and becomes `QUEUED`
//! 3. every transition to connected sweeps this peer's queued entries
//! 4. the server echo replaces the optimistic entry in place
//!
//! Status changes only follow [`SendStatus::can_transition_to`], so a
//! message that reached `SENT` never moves back.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use collaboraid_proto::message::{Message, OutgoingMessage, SendStatus, TempId, UserId};

use super::queue::{OutboundQueue, SweepReport};
use super::{Reconciled, reconcile_into};
use crate::api::HistoryApi;
use crate::repository::MessageRepository;
use crate::transport::Connector;

/// Banner shown when a send falls back to the queue.
pub const QUEUED_NOTICE: &str =
    "Message queued for sending. Will be delivered when connection is restored.";

/// Snapshot of one conversation for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationView {
    pub loading: bool,
    pub peer_id: UserId,
    pub peer_name: Option<String>,
    /// Messages in send order; optimistic entries included.
    pub messages: Vec<Message>,
    /// Transient, human-readable problem description.
    pub error: Option<String>,
    pub connected: bool,
}

impl ConversationView {
    fn new(peer_id: UserId, peer_name: Option<String>) -> Self {
        Self {
            loading: false,
            peer_id,
            peer_name,
            messages: Vec::new(),
            error: None,
            connected: false,
        }
    }

    /// The entry carrying `temp_id`, if any.
    #[must_use]
    pub fn find_temp(&self, temp_id: &TempId) -> Option<&Message> {
        self.messages.iter().find(|m| m.temp_id.as_ref() == Some(temp_id))
    }
}

struct Inner<C: Connector, H: HistoryApi> {
    repo: MessageRepository<C, H>,
    peer: UserId,
    queue: Arc<OutboundQueue>,
    view: watch::Sender<ConversationView>,
}

/// Message list and send actions for the conversation with one peer.
pub struct ConversationState<C: Connector, H: HistoryApi> {
    inner: Arc<Inner<C, H>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Connector, H: HistoryApi> ConversationState<C, H> {
    /// Creates the state for `peer`. `queue` may be shared between
    /// conversations of the same session; each one only sweeps the entries
    /// addressed to its own peer.
    pub fn new(
        repo: MessageRepository<C, H>,
        peer: UserId,
        peer_name: Option<String>,
        queue: Arc<OutboundQueue>,
    ) -> Self {
        let (view, _) = watch::channel(ConversationView::new(peer, peer_name));
        Self {
            inner: Arc::new(Inner {
                repo,
                peer,
                queue,
                view,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The peer of this conversation.
    #[must_use]
    pub fn peer(&self) -> UserId {
        self.inner.peer
    }

    /// Receiver of view updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConversationView> {
        self.inner.view.subscribe()
    }

    /// The current view.
    #[must_use]
    pub fn snapshot(&self) -> ConversationView {
        self.inner.view.borrow().clone()
    }

    /// The outbound queue this conversation uses.
    #[must_use]
    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.inner.queue
    }

    /// Connects and starts following inbound messages and connection status.
    ///
    /// Calling it again while running has no effect.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        // Subscribe before connecting so nothing is missed.
        let updates = self.inner.repo.message_updates();
        let status = self.inner.repo.connection_status();
        self.inner.repo.connect();

        tasks.push(tokio::spawn(follow_inbound(Arc::clone(&self.inner), updates)));
        tasks.push(tokio::spawn(follow_status(Arc::clone(&self.inner), status)));
        tracing::debug!(peer_id = %self.inner.peer, "conversation started");
    }

    /// Loads the stored history, keeping optimistic entries not yet confirmed.
    pub async fn load_conversation(&self) {
        self.inner.view.send_modify(|v| {
            v.loading = true;
            v.error = None;
        });
        match self.inner.repo.get_conversation(self.inner.peer).await {
            Ok(history) => {
                let me = self.inner.repo.session().user_id();
                let peer = self.inner.peer;
                self.inner.view.send_modify(|v| {
                    let mut merged: Vec<Message> =
                        history.into_iter().filter(|m| m.involves(peer)).collect();
                    if v.peer_name.is_none() {
                        v.peer_name = merged
                            .iter()
                            .find_map(|m| m.peer_username_of(me))
                            .map(str::to_string);
                    }
                    let pending = v.messages.drain(..).filter(|m| !m.is_confirmed());
                    for local in pending {
                        if !merged.iter().any(|m| m.matches(&local)) {
                            merged.push(local);
                        }
                    }
                    v.messages = merged;
                    v.loading = false;
                });
                tracing::info!(peer_id = %peer, "conversation loaded");
            }
            Err(e) => {
                tracing::warn!(peer_id = %self.inner.peer, err = %e, "conversation load failed");
                self.inner.view.send_modify(|v| {
                    v.loading = false;
                    v.error = Some(format!("Failed to load conversation: {e}"));
                });
            }
        }
    }

    /// Sends `content` to the peer optimistically.
    ///
    /// Returns the temp id of the new entry, or `None` for blank content.
    pub async fn send_message(&self, content: &str) -> Option<TempId> {
        if content.trim().is_empty() {
            return None;
        }
        let inner = &self.inner;
        let session = inner.repo.session();
        let outgoing = OutgoingMessage::new(inner.peer, content);
        let temp_id = outgoing.temp_id;
        let optimistic = Message::optimistic(session.user_id(), session.username(), &outgoing);
        inner.view.send_modify(|v| v.messages.push(optimistic));

        if inner.repo.send_message(&outgoing).await {
            inner.set_status(&temp_id, SendStatus::Sent);
            return Some(temp_id);
        }

        inner.queue.enqueue(outgoing);
        inner.set_status(&temp_id, SendStatus::Queued);
        inner
            .view
            .send_modify(|v| v.error = Some(QUEUED_NOTICE.to_string()));
        // The link may have come back while the send was failing.
        if inner.repo.is_connected() {
            inner.sweep().await;
        }
        Some(temp_id)
    }

    /// Explicitly resends a `QUEUED` or `FAILED` entry.
    ///
    /// Returns `true` if the broker accepted it. On failure the entry
    /// becomes `FAILED`.
    pub async fn retry_message(&self, temp_id: &TempId) -> bool {
        let inner = &self.inner;
        let Some(entry) = inner.view.borrow().find_temp(temp_id).cloned() else {
            tracing::debug!(temp_id = %temp_id, "retry for unknown message");
            return false;
        };
        if !inner.set_status(temp_id, SendStatus::Sending) {
            return false;
        }
        let outgoing = OutgoingMessage {
            receiver_id: entry.receiver_id,
            content: entry.content,
            temp_id: *temp_id,
        };
        if inner.repo.send_message(&outgoing).await {
            inner.queue.remove(temp_id);
            inner.set_status(temp_id, SendStatus::Sent);
            true
        } else {
            inner.set_status(temp_id, SendStatus::Failed);
            false
        }
    }

    /// Merges one inbound message if it belongs to this conversation.
    ///
    /// Returns `false` when the message was ignored.
    pub fn apply_inbound(&self, message: Message) -> bool {
        self.inner.apply_inbound(message)
    }

    /// Runs a queue sweep now, as on a transition to connected.
    pub async fn on_connected(&self) -> SweepReport {
        self.inner.sweep().await
    }

    /// Stops following events and closes the connection.
    pub async fn close(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.inner.repo.disconnect().await;
        self.inner.view.send_modify(|v| v.connected = false);
        tracing::debug!(peer_id = %self.inner.peer, "conversation closed");
    }
}

impl<C: Connector, H: HistoryApi> Drop for ConversationState<C, H> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl<C: Connector, H: HistoryApi> Inner<C, H> {
    /// Applies `status` to the entry with `temp_id` if the lifecycle allows it.
    fn set_status(&self, temp_id: &TempId, status: SendStatus) -> bool {
        self.view.send_if_modified(|v| {
            let Some(entry) = v
                .messages
                .iter_mut()
                .find(|m| m.temp_id.as_ref() == Some(temp_id))
            else {
                return false;
            };
            if entry.send_status.can_transition_to(status) {
                entry.send_status = status;
                true
            } else {
                tracing::debug!(
                    temp_id = %temp_id,
                    from = %entry.send_status,
                    to = %status,
                    "status change refused"
                );
                false
            }
        })
    }

    fn apply_inbound(&self, message: Message) -> bool {
        if !message.involves(self.peer) {
            return false;
        }
        if let Some(temp_id) = &message.temp_id {
            if self.queue.remove(temp_id) {
                tracing::debug!(temp_id = %temp_id, "echo confirmed a queued message");
            }
        }
        let me = self.repo.session().user_id();
        self.view.send_modify(|v| {
            if v.peer_name.is_none() {
                v.peer_name = message.peer_username_of(me).map(str::to_string);
            }
            let outcome = reconcile_into(&mut v.messages, message);
            if let Reconciled::Replaced(pos) = outcome {
                tracing::debug!(pos, "optimistic entry reconciled");
            }
        });
        true
    }

    async fn sweep(&self) -> SweepReport {
        let report = self
            .queue
            .sweep(self.peer, |message| {
                let repo = self.repo.clone();
                async move { repo.send_message(&message).await }
            })
            .await;
        for temp_id in &report.delivered {
            self.set_status(temp_id, SendStatus::Sent);
        }
        for temp_id in &report.expired {
            self.set_status(temp_id, SendStatus::Failed);
        }
        if !report.skipped && report.still_queued.is_empty() {
            self.view.send_if_modified(|v| {
                if v.error.as_deref() == Some(QUEUED_NOTICE) {
                    v.error = None;
                    true
                } else {
                    false
                }
            });
        }
        report
    }
}

async fn follow_inbound<C: Connector, H: HistoryApi>(
    inner: Arc<Inner<C, H>>,
    mut updates: broadcast::Receiver<Message>,
) {
    loop {
        match updates.recv().await {
            Ok(message) => {
                inner.apply_inbound(message);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, peer_id = %inner.peer, "conversation lagged behind inbound stream");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn follow_status<C: Connector, H: HistoryApi>(
    inner: Arc<Inner<C, H>>,
    mut status: watch::Receiver<bool>,
) {
    loop {
        let connected = *status.borrow_and_update();
        inner.view.send_if_modified(|v| {
            let changed = v.connected != connected;
            v.connected = connected;
            changed
        });
        if connected {
            inner.sweep().await;
        }
        if status.changed().await.is_err() {
            break;
        }
    }
}
