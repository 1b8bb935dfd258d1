//! Reactive conversation list.
//!
//! [`Inbox`] feeds a [`ConversationListAggregator`] from REST history and
//! the live message stream and publishes an [`InboxView`] after each change.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use collaboraid_proto::message::{Message, UserId};

use super::previews::{ConversationListAggregator, ConversationPreview};
use crate::api::HistoryApi;
use crate::repository::MessageRepository;
use crate::transport::Connector;

/// Snapshot of the conversation list for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxView {
    pub loading: bool,
    /// Newest first.
    pub previews: Vec<ConversationPreview>,
    pub username: String,
    pub error: Option<String>,
    pub connected: bool,
}

impl InboxView {
    /// Unread messages across every conversation.
    #[must_use]
    pub fn unread_total(&self) -> usize {
        self.previews.iter().map(|p| p.unread_count).sum()
    }
}

struct Inner<C: Connector, H: HistoryApi> {
    repo: MessageRepository<C, H>,
    aggregator: Mutex<ConversationListAggregator>,
    view: watch::Sender<InboxView>,
}

impl<C: Connector, H: HistoryApi> Inner<C, H> {
    fn publish(&self) {
        let previews = self.aggregator.lock().previews();
        self.view.send_if_modified(|v| {
            if v.previews == previews {
                return false;
            }
            v.previews = previews;
            true
        });
    }

    fn apply(&self, message: &Message) {
        if self.aggregator.lock().apply(message) {
            self.publish();
        }
    }
}

/// Conversation list of the session user.
pub struct Inbox<C: Connector, H: HistoryApi> {
    inner: Arc<Inner<C, H>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Connector, H: HistoryApi> Inbox<C, H> {
    pub fn new(repo: MessageRepository<C, H>) -> Self {
        let me = repo.session().user_id();
        let (view, _) = watch::channel(InboxView {
            loading: false,
            previews: Vec::new(),
            username: repo.session().username().to_string(),
            error: None,
            connected: false,
        });
        Self {
            inner: Arc::new(Inner {
                repo,
                aggregator: Mutex::new(ConversationListAggregator::new(me)),
                view,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<InboxView> {
        self.inner.view.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> InboxView {
        self.inner.view.borrow().clone()
    }

    /// Connects and folds live messages into the list.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let updates = self.inner.repo.message_updates();
        let status = self.inner.repo.connection_status();
        self.inner.repo.connect();
        tasks.push(tokio::spawn(follow_inbound(Arc::clone(&self.inner), updates)));
        tasks.push(tokio::spawn(follow_status(Arc::clone(&self.inner), status)));
    }

    /// Rebuilds every preview from the sent and received history.
    ///
    /// Both requests run concurrently and both must succeed; on failure
    /// the previous previews stay and `error` is set.
    pub async fn load_conversations(&self) {
        self.inner.view.send_modify(|v| {
            v.loading = true;
            v.error = None;
        });
        let repo = &self.inner.repo;
        match tokio::try_join!(repo.get_sent_messages(), repo.get_received_messages()) {
            Ok((sent, received)) => {
                let total = sent.len() + received.len();
                self.inner.aggregator.lock().load(sent.into_iter().chain(received));
                self.inner.publish();
                self.inner.view.send_modify(|v| v.loading = false);
                tracing::info!(messages = total, "conversations loaded");
            }
            Err(e) => {
                tracing::warn!(err = %e, "conversation list load failed");
                self.inner.view.send_modify(|v| {
                    v.loading = false;
                    v.error = Some(format!("Failed to load conversations: {e}"));
                });
            }
        }
    }

    /// Loads the full history with `peer` into the aggregator.
    pub async fn load_conversation(&self, peer: UserId) {
        match self.inner.repo.get_conversation(peer).await {
            Ok(history) => {
                self.inner.aggregator.lock().load_conversation(peer, history);
                self.inner.publish();
            }
            Err(e) => {
                tracing::warn!(peer_id = %peer, err = %e, "conversation load failed");
                self.inner
                    .view
                    .send_modify(|v| v.error = Some(format!("Failed to load conversation: {e}")));
            }
        }
    }

    /// Messages known for `peer`, in arrival order.
    #[must_use]
    pub fn conversation(&self, peer: UserId) -> Vec<Message> {
        self.inner.aggregator.lock().conversation(peer).to_vec()
    }

    /// Folds one message in directly.
    pub fn apply(&self, message: &Message) {
        self.inner.apply(message);
    }

    /// Stops following events and closes the connection.
    pub async fn close(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.inner.repo.disconnect().await;
        self.inner.view.send_modify(|v| v.connected = false);
    }
}

impl<C: Connector, H: HistoryApi> Drop for Inbox<C, H> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn follow_inbound<C: Connector, H: HistoryApi>(
    inner: Arc<Inner<C, H>>,
    mut updates: broadcast::Receiver<Message>,
) {
    loop {
        match updates.recv().await {
            Ok(message) => inner.apply(&message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "inbox lagged behind inbound stream");
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
        if status.changed().await.is_err() {
            break;
        }
    }
}
