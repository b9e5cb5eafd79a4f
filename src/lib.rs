//! Rust client for the NSQ distributed messaging platform.
//!
//! The crate provides a [`Producer`] for publishing, a [`Consumer`] for
//! subscribing with RDY flow control and failure backoff, and the
//! thread-and-channel substrate ([`chan`], [`select`]) both are built on.

pub mod admin;
pub mod chan;
pub mod config;
mod conn;
pub mod consumer;
pub mod duration;
pub mod error;
pub mod message;
pub mod producer;
pub mod protocol;
pub mod select;

pub use admin::{AdminClient, TopicStats};
pub use config::Config;
pub use consumer::{Consumer, ConsumerStats, Handler};
pub use error::{Error, Result};
pub use message::{Message, MessageDelegate, MessageId, MSG_ID_LENGTH};
pub use producer::{Producer, TransactionResult};
