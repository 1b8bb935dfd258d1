//! `CollaborAid` client messaging layer.
//!
//! A supervised STOMP link to the backend broker, REST history, an
//! outbound queue for sends made while offline, and reactive conversation
//! and inbox state built on top of them.

pub mod api;
pub mod chat;
pub mod config;
pub mod connection;
pub mod repository;
pub mod session;
pub mod transport;
