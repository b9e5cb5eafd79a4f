//! Administrative collaborator seam.
//!
//! The consumer does not speak the nsqd HTTP API itself; callers that
//! want topics and channels created on demand plug in an [`AdminClient`]
//! via [`Consumer::set_admin_client`](crate::Consumer::set_admin_client)
//! and the consumer invokes it before each subscribe. Keeping this behind
//! a trait keeps the library transport-agnostic and makes the consumer
//! testable without an HTTP stack.

use crate::Result;

/// Out-of-band administrative operations against a cluster.
pub trait AdminClient: Send + Sync {
    /// Creates `topic` if it does not already exist. Must be idempotent.
    fn create_topic(&self, topic: &str) -> Result<()>;

    /// Creates `channel` on `topic` if it does not already exist. Must be
    /// idempotent.
    fn create_channel(&self, topic: &str, channel: &str) -> Result<()>;

    /// Current counters for `channel` on `topic`, if the backend exposes
    /// them.
    fn stats(&self, topic: &str, channel: &str) -> Result<TopicStats>;
}

/// Counters reported by [`AdminClient::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicStats {
    /// Messages currently queued in memory and on disk.
    pub depth: u64,
    /// Messages delivered but not yet finished.
    pub in_flight: u64,
    pub finished: u64,
    pub requeued: u64,
    pub timed_out: u64,
}
