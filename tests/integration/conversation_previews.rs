// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Integration tests for the conversation list.
//!
//! An `Inbox` is loaded from REST history and then fed live messages
//! through a `LoopbackBroker`. These tests validate:
//! - the preview of a peer always shows its newest message
//! - previews are ordered newest first and re-sorted on every update
//! - the unread flag and count follow the direction and read state of messages
//! - sends made in a conversation update the list seen by the inbox

use std::sync::Arc;
use std::time::Duration;

use collaboraid::api::InMemoryHistory;
use collaboraid::chat::conversation::ConversationState;
use collaboraid::chat::inbox::{Inbox, InboxView};
use collaboraid::chat::queue::OutboundQueue;
use collaboraid::connection::ConnectionManager;
use collaboraid::repository::MessageRepository;
use collaboraid::session::Session;
use collaboraid::transport::loopback::{LoopbackBroker, LoopbackConnector};
use collaboraid_proto::message::{Message, MessageId, SendStatus, Timestamp, UserId};
use tokio::sync::watch;

type Repo = MessageRepository<LoopbackConnector, InMemoryHistory>;

const ME: i64 = 1;

// =============================================================================
// Helpers
// =============================================================================

fn repo(broker: &LoopbackBroker, history: InMemoryHistory) -> Repo {
    let session = Arc::new(Session::new(UserId::new(ME), "ana", "token"));
    let cm = ConnectionManager::new(broker.connector(), session, Duration::from_millis(20), 64);
    MessageRepository::new(cm, history)
}

fn message(id: i64, from: i64, to: i64, content: &str, at: &str) -> Message {
    Message {
        id: Some(MessageId::new(id)),
        temp_id: None,
        sender_id: UserId::new(from),
        sender_username: Some(format!("user{from}")),
        receiver_id: UserId::new(to),
        receiver_username: Some(format!("user{to}")),
        content: content.to_string(),
        timestamp: Timestamp::parse(at).unwrap(),
        read: false,
        send_status: SendStatus::Sent,
    }
}

async fn wait_for(
    rx: &mut watch::Receiver<InboxView>,
    what: &str,
    pred: impl Fn(&InboxView) -> bool,
) -> InboxView {
    tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|v| pred(v)))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap()
        .clone()
}

fn last_message_of(view: &InboxView, peer: i64) -> Option<String> {
    view.previews
        .iter()
        .find(|p| p.peer_id == UserId::new(peer))
        .map(|p| p.last_message.clone())
}

// =============================================================================
// Freshness
// =============================================================================

#[tokio::test]
async fn back_to_back_messages_show_the_newest() {
    let broker = LoopbackBroker::new();
    let inbox = Inbox::new(repo(&broker, InMemoryHistory::new(UserId::new(ME))));
    let mut rx = inbox.subscribe();
    inbox.start();
    wait_for(&mut rx, "connected", |v| v.connected).await;

    broker.inject(&message(1, 7, ME, "at ten", "2024-05-01T10:00:00"));
    broker.inject(&message(2, 7, ME, "at five past", "2024-05-01T10:05:00"));

    let view = wait_for(&mut rx, "newest preview", |v| {
        last_message_of(v, 7).as_deref() == Some("at five past")
    })
    .await;
    assert_eq!(view.previews.len(), 1);
    assert_eq!(
        view.previews[0].timestamp,
        Timestamp::parse("2024-05-01T10:05:00").unwrap()
    );

    // A late-arriving older message does not take over.
    broker.inject(&message(3, 7, ME, "delayed", "2024-05-01T09:00:00"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        last_message_of(&inbox.snapshot(), 7).as_deref(),
        Some("at five past")
    );
    assert_eq!(inbox.conversation(UserId::new(7)).len(), 3);

    inbox.close().await;
}

#[tokio::test]
async fn freshness_compares_time_not_text() {
    let broker = LoopbackBroker::new();
    let inbox = Inbox::new(repo(&broker, InMemoryHistory::new(UserId::new(ME))));
    // Mixed formats and fractional seconds only order correctly as times.
    inbox.apply(&message(1, 7, ME, "nine", "2024-05-01T09:59:59"));
    inbox.apply(&message(2, 7, ME, "ten", "2024-05-01T10:00:00.5"));
    inbox.apply(&message(3, 7, ME, "ten-ish", "2024-05-01 10:00:00"));
    assert_eq!(last_message_of(&inbox.snapshot(), 7).as_deref(), Some("ten"));
}

// =============================================================================
// Ordering and unread state
// =============================================================================

#[tokio::test]
async fn history_load_then_live_update_resorts() {
    let broker = LoopbackBroker::new();
    let history = InMemoryHistory::new(UserId::new(ME));
    history.push(message(1, ME, 7, "to seven", "2024-05-01T10:00:00"));
    history.push(message(2, 8, ME, "from eight", "2024-05-02T10:00:00"));
    let mut read = message(3, 9, ME, "from nine, read", "2024-05-03T10:00:00");
    read.read = true;
    history.push(read);

    let inbox = Inbox::new(repo(&broker, history));
    let mut rx = inbox.subscribe();
    inbox.start();
    inbox.load_conversations().await;

    let view = inbox.snapshot();
    let order: Vec<i64> = view.previews.iter().map(|p| p.peer_id.get()).collect();
    assert_eq!(order, vec![9, 8, 7]);
    assert!(!view.previews[0].has_unread, "read message");
    assert!(view.previews[1].has_unread, "unread from peer");
    assert!(!view.previews[2].has_unread, "last message was mine");
    assert_eq!(view.previews[0].unread_count, 0);
    assert_eq!(view.previews[1].unread_count, 1);
    assert_eq!(view.previews[2].unread_count, 0);
    assert!(view.previews[2].last_from_me);
    assert_eq!(view.previews[0].display_name(), "user9");

    wait_for(&mut rx, "connected", |v| v.connected).await;
    broker.inject(&message(4, 7, ME, "seven again", "2024-05-04T10:00:00"));
    let view = wait_for(&mut rx, "seven on top", |v| {
        v.previews.first().map(|p| p.peer_id.get()) == Some(7)
    })
    .await;
    let order: Vec<i64> = view.previews.iter().map(|p| p.peer_id.get()).collect();
    assert_eq!(order, vec![7, 9, 8]);
    assert!(view.previews[0].has_unread);
    assert_eq!(view.previews[0].unread_count, 1);

    broker.inject(&message(5, 7, ME, "and again", "2024-05-04T10:01:00"));
    let view = wait_for(&mut rx, "two unread from seven", |v| {
        v.previews.first().is_some_and(|p| p.unread_count == 2)
    })
    .await;
    assert_eq!(view.previews[0].last_message, "and again");

    inbox.close().await;
}

#[tokio::test]
async fn sends_from_a_conversation_reach_the_inbox() {
    let broker = LoopbackBroker::new();
    let repo = repo(&broker, InMemoryHistory::new(UserId::new(ME)));
    let inbox = Inbox::new(repo.clone());
    let chat = ConversationState::new(
        repo,
        UserId::new(42),
        None,
        Arc::new(OutboundQueue::default()),
    );
    let mut rx = inbox.subscribe();
    inbox.start();
    chat.start();
    wait_for(&mut rx, "connected", |v| v.connected).await;

    chat.send_message("hi forty-two").await.unwrap();
    let view = wait_for(&mut rx, "preview for 42", |v| !v.previews.is_empty()).await;
    assert_eq!(view.previews[0].peer_id, UserId::new(42));
    assert_eq!(view.previews[0].last_message, "hi forty-two");
    assert!(view.previews[0].last_from_me);
    assert!(!view.previews[0].has_unread);

    chat.close().await;
    inbox.close().await;
}
