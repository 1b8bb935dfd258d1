//! Chat state: per-peer conversations, the outbound queue and the inbox.
//!
//! - [`conversation::ConversationState`]: one peer's message list with
//!   optimistic sends and reconciliation
//! - [`queue::OutboundQueue`]: messages waiting for a reconnect
//! - [`previews::ConversationListAggregator`]: one preview per peer
//! - [`inbox::Inbox`]: reactive wrapper around the aggregator

pub mod conversation;
pub mod inbox;
pub mod previews;
pub mod queue;

use collaboraid_proto::message::Message;

/// What [`reconcile_into`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// An existing entry at this index was replaced in place.
    Replaced(usize),
    /// The message was appended at this index.
    Appended(usize),
}

/// Merges `incoming` into `list` by dual-key identity.
///
/// The first entry with the same server id, or the same temp id, is
/// replaced in place so list order is preserved; otherwise `incoming` is
/// appended. A temp id known locally survives when the server copy
/// lacks one.
pub fn reconcile_into(list: &mut Vec<Message>, mut incoming: Message) -> Reconciled {
    if let Some(pos) = list.iter().position(|m| m.matches(&incoming)) {
        if incoming.temp_id.is_none() {
            incoming.temp_id = list[pos].temp_id;
        }
        list[pos] = incoming;
        Reconciled::Replaced(pos)
    } else {
        list.push(incoming);
        Reconciled::Appended(list.len() - 1)
    }
}
