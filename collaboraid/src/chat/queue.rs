//! Outbound queue for messages that failed immediate delivery.
//!
//! Entries are keyed by temp id and kept in insertion order. A sweep
//! covers one receiver and retries each of its entries once, sequentially.
//! Delivered entries are removed, failing ones stay queued, and entries that
//! outlived the [`QueuePolicy`] are removed and reported as expired so the
//! caller can mark them failed. One queue can serve every conversation of a
//! session: each conversation sweeps only its own peer.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use collaboraid_proto::message::{OutgoingMessage, TempId, UserId};

/// Retention limits for queued messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    /// Sweep attempts before an entry expires. The initial failed send
    /// is not counted.
    pub max_attempts: u32,
    /// Age after which an entry expires.
    pub max_age: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// A message waiting for the next sweep.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub message: OutgoingMessage,
    /// Sweep attempts made so far.
    pub attempts: u32,
    pub enqueued_at: Instant,
}

impl QueueEntry {
    fn is_expired(&self, policy: &QueuePolicy) -> bool {
        self.attempts >= policy.max_attempts || self.enqueued_at.elapsed() >= policy.max_age
    }
}

/// Outcome of one sweep, by temp id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub delivered: Vec<TempId>,
    pub still_queued: Vec<TempId>,
    pub expired: Vec<TempId>,
    /// Another sweep for the same receiver was already running; nothing
    /// was attempted.
    pub skipped: bool,
}

impl SweepReport {
    /// Whether the sweep touched nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty() && self.still_queued.is_empty() && self.expired.is_empty()
    }
}

/// Pending outbound messages, oldest first.
pub struct OutboundQueue {
    policy: QueuePolicy,
    entries: Mutex<VecDeque<QueueEntry>>,
    /// Receivers with a sweep in progress.
    sweeping: Mutex<HashSet<UserId>>,
}

/// Releases the receiver's sweep slot even if the sweep future is dropped.
struct SweepGuard<'a> {
    sweeping: &'a Mutex<HashSet<UserId>>,
    receiver: UserId,
    held: bool,
}

impl SweepGuard<'_> {
    fn release(&mut self) {
        if self.held {
            self.sweeping.lock().remove(&self.receiver);
            self.held = false;
        }
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl OutboundQueue {
    /// Creates an empty queue governed by `policy`.
    #[must_use]
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(VecDeque::new()),
            sweeping: Mutex::new(HashSet::new()),
        }
    }

    /// The retention policy.
    #[must_use]
    pub const fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Adds `message` at the back. Returns `false` if its temp id is
    /// already queued.
    pub fn enqueue(&self, message: OutgoingMessage) -> bool {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.message.temp_id == message.temp_id) {
            return false;
        }
        tracing::info!(
            temp_id = %message.temp_id,
            receiver_id = %message.receiver_id,
            queue_len = entries.len() + 1,
            "message queued for delivery on reconnect"
        );
        entries.push_back(QueueEntry {
            message,
            attempts: 0,
            enqueued_at: Instant::now(),
        });
        true
    }

    /// Removes the entry for `temp_id`. Returns whether one existed.
    pub fn remove(&self, temp_id: &TempId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.message.temp_id != *temp_id);
        before != entries.len()
    }

    /// Whether `temp_id` is queued.
    #[must_use]
    pub fn contains(&self, temp_id: &TempId) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.message.temp_id == *temp_id)
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of every entry, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Retries every entry addressed to `receiver` once, in insertion order.
    ///
    /// `send` returns `true` when the transport accepted the message. The
    /// lock is never held while `send` runs, so entries may be enqueued or
    /// removed concurrently; removed ones are skipped and ones enqueued for
    /// `receiver` before the sweep finishes are attempted too. Overlapping
    /// sweeps for the same receiver are not run: the second returns a report
    /// with `skipped` set.
    pub async fn sweep<F, Fut>(&self, receiver: UserId, mut send: F) -> SweepReport
    where
        F: FnMut(OutgoingMessage) -> Fut,
        Fut: Future<Output = bool>,
    {
        if !self.sweeping.lock().insert(receiver) {
            tracing::debug!(receiver_id = %receiver, "sweep already running, skipping");
            return SweepReport {
                skipped: true,
                ..SweepReport::default()
            };
        }
        let mut guard = SweepGuard {
            sweeping: &self.sweeping,
            receiver,
            held: true,
        };

        let mut seen: HashSet<TempId> = HashSet::new();
        let mut report = SweepReport::default();

        while let Some(batch) = self.next_batch(&mut guard, &seen) {
            for temp_id in batch {
                seen.insert(temp_id);
                let Some(message) = self.begin_attempt(&temp_id, &mut report) else {
                    continue;
                };
                if send(message).await {
                    self.remove(&temp_id);
                    report.delivered.push(temp_id);
                } else {
                    report.still_queued.push(temp_id);
                }
            }
        }

        if !report.is_empty() {
            tracing::info!(
                receiver_id = %receiver,
                delivered = report.delivered.len(),
                still_queued = report.still_queued.len(),
                expired = report.expired.len(),
                "outbound queue swept"
            );
        }
        report
    }

    /// Entries for `receiver` this sweep has not seen yet.
    ///
    /// When there are none the sweep slot is released under the entry lock,
    /// so a concurrent enqueue is either picked up here or finds the slot
    /// free for its own sweep.
    fn next_batch(&self, guard: &mut SweepGuard<'_>, seen: &HashSet<TempId>) -> Option<Vec<TempId>> {
        let entries = self.entries.lock();
        let batch: Vec<TempId> = entries
            .iter()
            .filter(|e| e.message.receiver_id == guard.receiver && !seen.contains(&e.message.temp_id))
            .map(|e| e.message.temp_id)
            .collect();
        if batch.is_empty() {
            guard.release();
            None
        } else {
            Some(batch)
        }
    }

    /// Expires or counts an attempt for `temp_id`; returns the message to send.
    fn begin_attempt(&self, temp_id: &TempId, report: &mut SweepReport) -> Option<OutgoingMessage> {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|e| e.message.temp_id == *temp_id)?;
        if entries[pos].is_expired(&self.policy) {
            if let Some(entry) = entries.remove(pos) {
                tracing::warn!(
                    temp_id = %temp_id,
                    attempts = entry.attempts,
                    "queued message expired"
                );
            }
            report.expired.push(*temp_id);
            return None;
        }
        entries[pos].attempts += 1;
        Some(entries[pos].message.clone())
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(QueuePolicy::default())
    }
}
