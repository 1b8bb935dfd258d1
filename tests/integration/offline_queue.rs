// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Integration tests for sending while offline.
//!
//! A `ConversationState` runs against a `LoopbackBroker` that is toggled
//! offline and online. Covers:
//! - a send while disconnected is shown as QUEUED and lands in the queue
//! - the reconnect sweep delivers queued messages and marks them SENT
//! - failing sweeps keep every entry queued, none is dropped
//! - a SENT message never moves back to QUEUED or FAILED
//! - an explicit retry of a FAILED entry delivers it and clears the queue
//! - entries past the queue policy end up FAILED, visible for retry
//! - conversations sharing one queue each drain only their own entries

use std::sync::Arc;
use std::time::Duration;

use collaboraid::api::InMemoryHistory;
use collaboraid::chat::conversation::{ConversationState, ConversationView, QUEUED_NOTICE};
use collaboraid::chat::queue::{OutboundQueue, QueuePolicy};
use collaboraid::connection::ConnectionManager;
use collaboraid::repository::MessageRepository;
use collaboraid::session::Session;
use collaboraid::transport::loopback::{LoopbackBroker, LoopbackConnector};
use collaboraid_proto::message::{SendStatus, TempId, UserId};
use tokio::sync::watch;

type Repo = MessageRepository<LoopbackConnector, InMemoryHistory>;
type State = ConversationState<LoopbackConnector, InMemoryHistory>;

const ME: i64 = 1;
const PEER: i64 = 42;

// =============================================================================
// Helpers
// =============================================================================

fn repo(broker: &LoopbackBroker) -> Repo {
    let session = Arc::new(Session::new(UserId::new(ME), "ana", "token"));
    let cm = ConnectionManager::new(broker.connector(), session, Duration::from_millis(20), 64);
    MessageRepository::new(cm, InMemoryHistory::new(UserId::new(ME)))
}

fn state_with(repo: Repo, policy: QueuePolicy) -> State {
    ConversationState::new(
        repo,
        UserId::new(PEER),
        None,
        Arc::new(OutboundQueue::new(policy)),
    )
}

async fn wait_for(
    rx: &mut watch::Receiver<ConversationView>,
    what: &str,
    pred: impl Fn(&ConversationView) -> bool,
) -> ConversationView {
    tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|v| pred(v)))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap()
        .clone()
}

fn status_of(view: &ConversationView, temp_id: &TempId) -> SendStatus {
    view.find_temp(temp_id).unwrap().send_status
}

// =============================================================================
// Queueing and draining
// =============================================================================

#[tokio::test]
async fn send_while_disconnected_is_queued() {
    let broker = LoopbackBroker::new();
    broker.set_online(false);
    let state = state_with(repo(&broker), QueuePolicy::default());
    state.start();

    let temp = state.send_message("hello").await.unwrap();

    let view = state.snapshot();
    assert_eq!(view.messages.len(), 1, "appended immediately");
    assert_eq!(status_of(&view, &temp), SendStatus::Queued);
    assert_eq!(view.error.as_deref(), Some(QUEUED_NOTICE));

    let queued = state.queue().snapshot();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].message.receiver_id, UserId::new(PEER));
    assert_eq!(queued[0].message.content, "hello");
    assert_eq!(queued[0].message.temp_id, temp);
    assert!(broker.published().is_empty());

    state.close().await;
}

#[tokio::test]
async fn reconnect_drains_queue_and_marks_sent() {
    let broker = LoopbackBroker::new();
    broker.set_online(false);
    let state = state_with(repo(&broker), QueuePolicy::default());
    let mut rx = state.subscribe();
    state.start();

    let temp = state.send_message("hello").await.unwrap();
    assert_eq!(status_of(&state.snapshot(), &temp), SendStatus::Queued);

    broker.set_online(true);
    let view = wait_for(&mut rx, "queued message to be sent", |v| {
        v.find_temp(&temp)
            .is_some_and(|m| m.send_status == SendStatus::Sent)
    })
    .await;

    assert!(view.connected);
    assert!(state.queue().is_empty());
    assert_eq!(broker.published().len(), 1);
    assert_eq!(broker.published()[0].temp_id, temp);
    // Banner clears once nothing is left queued.
    wait_for(&mut rx, "banner to clear", |v| v.error.is_none()).await;

    state.close().await;
}

#[tokio::test]
async fn failing_sweep_keeps_every_entry_queued() {
    let broker = LoopbackBroker::new();
    broker.set_online(false);
    let state = state_with(repo(&broker), QueuePolicy::default());
    let mut rx = state.subscribe();
    state.start();

    let mut temps = Vec::new();
    for i in 0..4 {
        temps.push(state.send_message(&format!("m{i}")).await.unwrap());
    }
    assert_eq!(state.queue().len(), 4);

    broker.set_reject(true);
    broker.set_online(true);
    wait_for(&mut rx, "connected", |v| v.connected).await;

    let report = state.on_connected().await;
    if !report.skipped {
        assert_eq!(report.still_queued, temps);
        assert!(report.delivered.is_empty());
    }
    assert_eq!(state.queue().len(), 4);
    let view = state.snapshot();
    for temp in &temps {
        assert_eq!(status_of(&view, temp), SendStatus::Queued);
    }

    broker.set_reject(false);
    let report = loop {
        let report = state.on_connected().await;
        if !report.skipped {
            break report;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert!(report.expired.is_empty());
    assert!(state.queue().is_empty());
    let view = state.snapshot();
    for temp in &temps {
        assert_eq!(status_of(&view, temp), SendStatus::Sent);
    }
    let order: Vec<TempId> = broker.published().iter().map(|m| m.temp_id).collect();
    assert_eq!(order, temps, "sweep keeps insertion order");

    state.close().await;
}

#[tokio::test]
async fn sent_never_regresses() {
    let broker = LoopbackBroker::new();
    let state = state_with(repo(&broker), QueuePolicy::default());
    let mut rx = state.subscribe();
    state.start();
    wait_for(&mut rx, "connected", |v| v.connected).await;

    let temp = state.send_message("once").await.unwrap();
    assert_eq!(status_of(&state.snapshot(), &temp), SendStatus::Sent);

    // Record every status the view shows for this message from here on.
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorder = {
        let seen = Arc::clone(&seen);
        let mut rx = state.subscribe();
        tokio::spawn(async move {
            loop {
                if let Some(m) = rx.borrow_and_update().find_temp(&temp) {
                    seen.lock().push(m.send_status);
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    };

    broker.set_online(false);
    wait_for(&mut rx, "offline", |v| !v.connected).await;
    assert!(!state.retry_message(&temp).await, "retry of SENT is refused");
    broker.set_online(true);
    wait_for(&mut rx, "online again", |v| v.connected).await;
    state.on_connected().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    recorder.abort();
    assert!(seen.lock().iter().all(|s| *s == SendStatus::Sent));
    assert_eq!(broker.published().len(), 1, "never resent");

    state.close().await;
}

// =============================================================================
// Explicit retry and expiry
// =============================================================================

#[tokio::test]
async fn retry_of_failed_entry_delivers_and_dequeues() {
    let broker = LoopbackBroker::new();
    broker.set_online(false);
    let repo = repo(&broker);
    // Not started: no automatic sweep, so only the explicit retry sends.
    let state = state_with(repo.clone(), QueuePolicy::default());

    let temp = state.send_message("retry me").await.unwrap();
    assert!(!state.retry_message(&temp).await);
    assert_eq!(status_of(&state.snapshot(), &temp), SendStatus::Failed);
    assert!(state.queue().contains(&temp), "failed entry stays queued");

    broker.set_online(true);
    let mut status = repo.connection_status();
    repo.connect();
    tokio::time::timeout(Duration::from_secs(3), status.wait_for(|c| *c))
        .await
        .unwrap()
        .unwrap();

    assert!(state.retry_message(&temp).await);
    assert_eq!(status_of(&state.snapshot(), &temp), SendStatus::Sent);
    assert!(!state.queue().contains(&temp));
    assert_eq!(broker.published().len(), 1);

    repo.disconnect().await;
}

#[tokio::test]
async fn expired_entries_become_failed() {
    let broker = LoopbackBroker::new();
    broker.set_online(false);
    let state = state_with(
        repo(&broker),
        QueuePolicy {
            max_attempts: 1,
            max_age: Duration::from_secs(3600),
        },
    );

    let temp = state.send_message("doomed").await.unwrap();
    let first = state.on_connected().await;
    assert_eq!(first.still_queued, vec![temp]);
    assert_eq!(status_of(&state.snapshot(), &temp), SendStatus::Queued);

    let second = state.on_connected().await;
    assert_eq!(second.expired, vec![temp]);
    assert!(state.queue().is_empty());
    assert_eq!(status_of(&state.snapshot(), &temp), SendStatus::Failed);
}

// =============================================================================
// Shared queue
// =============================================================================

fn sharing(repo: Repo, peer: i64, queue: &Arc<OutboundQueue>) -> State {
    ConversationState::new(repo, UserId::new(peer), None, Arc::clone(queue))
}

#[tokio::test]
async fn shared_queue_sweep_leaves_other_peers_entries() {
    let broker = LoopbackBroker::new();
    broker.set_online(false);
    // No temp id comes back, so only the sweep can mark an entry SENT.
    broker.set_echo(false);
    let repo = repo(&broker);
    let queue = Arc::new(OutboundQueue::default());
    let with_a = sharing(repo.clone(), 7, &queue);
    let with_b = sharing(repo.clone(), 8, &queue);

    let to_a = with_a.send_message("to a").await.unwrap();
    let to_b = with_b.send_message("to b").await.unwrap();
    assert_eq!(queue.len(), 2);

    broker.set_online(true);
    let mut status = repo.connection_status();
    repo.connect();
    tokio::time::timeout(Duration::from_secs(3), status.wait_for(|c| *c))
        .await
        .unwrap()
        .unwrap();

    let report = with_a.on_connected().await;
    assert_eq!(report.delivered, vec![to_a]);
    assert_eq!(status_of(&with_a.snapshot(), &to_a), SendStatus::Sent);
    assert!(queue.contains(&to_b), "left for its own conversation");
    assert_eq!(status_of(&with_b.snapshot(), &to_b), SendStatus::Queued);

    let report = with_b.on_connected().await;
    assert_eq!(report.delivered, vec![to_b]);
    assert_eq!(status_of(&with_b.snapshot(), &to_b), SendStatus::Sent);
    assert!(queue.is_empty());
    assert_eq!(broker.published().len(), 2);

    repo.disconnect().await;
}

#[tokio::test]
async fn shared_queue_reconnect_marks_every_conversation_sent() {
    let broker = LoopbackBroker::new();
    broker.set_online(false);
    broker.set_echo(false);
    let repo = repo(&broker);
    let queue = Arc::new(OutboundQueue::default());
    let with_a = sharing(repo.clone(), 7, &queue);
    let with_b = sharing(repo, 8, &queue);
    let mut rx_a = with_a.subscribe();
    let mut rx_b = with_b.subscribe();
    with_a.start();
    with_b.start();

    let to_a = with_a.send_message("to a").await.unwrap();
    let to_b = with_b.send_message("to b").await.unwrap();

    broker.set_online(true);
    wait_for(&mut rx_a, "a sent", |v| {
        v.find_temp(&to_a)
            .is_some_and(|m| m.send_status == SendStatus::Sent)
    })
    .await;
    wait_for(&mut rx_b, "b sent", |v| {
        v.find_temp(&to_b)
            .is_some_and(|m| m.send_status == SendStatus::Sent)
    })
    .await;
    assert!(queue.is_empty());

    with_a.close().await;
    with_b.close().await;
}
