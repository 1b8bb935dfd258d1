//! Shared protocol definitions for the `CollaborAid` messaging client.
//!
//! - [`message`]: the message data model and client-side send status
//! - [`stomp`]: STOMP frame codec used over the WebSocket connection
//! - [`wire`]: JSON shapes exchanged with the backend
//! - [`task`]: the backend's task status vocabulary

pub mod message;
pub mod stomp;
pub mod task;
pub mod wire;
