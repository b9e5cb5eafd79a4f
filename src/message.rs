//! Messages and their lifecycle.
//!
//! A [`Message`] is owned by the handler thread processing it. Exactly one
//! terminal action (finish, or the final requeue) may happen per message;
//! touches and the responses are routed back to the owning connection
//! through a [`MessageDelegate`] installed by the consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{Error, Result};

pub const MSG_ID_LENGTH: usize = 16;

/// Fixed-width opaque message identifier (ASCII on the wire).
pub type MessageId = [u8; MSG_ID_LENGTH];

/// Receives lifecycle events for a message and turns them into protocol
/// commands plus consumer-side bookkeeping.
pub trait MessageDelegate: Send + Sync {
    fn on_finish(&self, msg: &Message);
    /// `backoff` is false for `requeue_without_backoff`.
    fn on_requeue(&self, msg: &Message, delay: Option<Duration>, backoff: bool);
    fn on_touch(&self, msg: &Message);
}

/// One in-flight message received from a connection.
pub struct Message {
    pub id: MessageId,
    pub body: Vec<u8>,
    /// Server-assigned timestamp, nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub attempts: u16,
    /// Address of the nsqd this message arrived from.
    pub nsqd_address: String,
    received_at: Instant,
    responded: AtomicBool,
    auto_response_disabled: AtomicBool,
    delegate: Arc<dyn MessageDelegate>,
}

impl Message {
    /// Decodes a message frame body:
    /// `[u64 timestamp][u16 attempts][16-byte id][payload]`.
    pub(crate) fn decode(
        body: &[u8],
        nsqd_address: String,
        delegate: Arc<dyn MessageDelegate>,
    ) -> Result<Message> {
        if body.len() < 8 + 2 + MSG_ID_LENGTH {
            return Err(Error::BadFrame("message frame body too short"));
        }
        let timestamp = i64::from_be_bytes(body[0..8].try_into().unwrap());
        let attempts = u16::from_be_bytes(body[8..10].try_into().unwrap());
        let mut id = [0u8; MSG_ID_LENGTH];
        id.copy_from_slice(&body[10..10 + MSG_ID_LENGTH]);
        Ok(Message {
            id,
            body: body[10 + MSG_ID_LENGTH..].to_vec(),
            timestamp,
            attempts,
            nsqd_address,
            received_at: Instant::now(),
            responded: AtomicBool::new(false),
            auto_response_disabled: AtomicBool::new(false),
            delegate,
        })
    }

    /// The message id as a string (ids are ASCII on the wire).
    pub fn id_str(&self) -> String {
        String::from_utf8_lossy(&self.id).into_owned()
    }

    /// How long ago this message was received from the connection.
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }

    /// Disables the automatic finish/requeue the handler pool performs
    /// after the handler returns. The handler then owns responding.
    pub fn disable_auto_response(&self) {
        self.auto_response_disabled.store(true, Ordering::SeqCst);
    }

    pub fn is_auto_response_disabled(&self) -> bool {
        self.auto_response_disabled.load(Ordering::SeqCst)
    }

    /// Whether a terminal action (finish or requeue) already happened.
    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::SeqCst)
    }

    /// Terminal success. A second terminal action is a no-op.
    pub fn finish(&self) {
        if self.responded.swap(true, Ordering::SeqCst) {
            return;
        }
        self.delegate.on_finish(self);
    }

    /// Terminal failure (or explicit defer): returns the message to the
    /// server queue for redelivery after `delay`, or after the consumer's
    /// attempt-scaled default when `None`. Counts toward backoff.
    pub fn requeue(&self, delay: Option<Duration>) {
        if self.responded.swap(true, Ordering::SeqCst) {
            return;
        }
        self.delegate.on_requeue(self, delay, true);
    }

    /// Like [`Message::requeue`] but without affecting the consumer's
    /// backoff state, for scheduled/deferred processing rather than
    /// failure.
    pub fn requeue_without_backoff(&self, delay: Duration) {
        if self.responded.swap(true, Ordering::SeqCst) {
            return;
        }
        self.delegate.on_requeue(self, Some(delay), false);
    }

    /// Resets the server-side processing timeout without completing the
    /// message. May be called repeatedly before the terminal action; a
    /// touch after the terminal action is a no-op.
    pub fn touch(&self) {
        if self.has_responded() {
            return;
        }
        self.delegate.on_touch(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingDelegate {
        finished: AtomicUsize,
        requeued: AtomicUsize,
        touched: AtomicUsize,
        backoff_flags: Mutex<Vec<bool>>,
    }

    impl MessageDelegate for CountingDelegate {
        fn on_finish(&self, _: &Message) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
        fn on_requeue(&self, _: &Message, _: Option<Duration>, backoff: bool) {
            self.requeued.fetch_add(1, Ordering::SeqCst);
            self.backoff_flags.lock().unwrap().push(backoff);
        }
        fn on_touch(&self, _: &Message) {
            self.touched.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wire_body(id: &[u8; MSG_ID_LENGTH], payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&1_700_000_000_000_000_000_i64.to_be_bytes());
        body.extend_from_slice(&3u16.to_be_bytes());
        body.extend_from_slice(id);
        body.extend_from_slice(payload);
        body
    }

    #[test]
    fn decodes_wire_layout() {
        let id = *b"0123456789abcdef";
        let delegate = Arc::new(CountingDelegate::default());
        let msg =
            Message::decode(&wire_body(&id, b"payload"), "127.0.0.1:4150".into(), delegate)
                .unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(msg.attempts, 3);
        assert_eq!(msg.timestamp, 1_700_000_000_000_000_000);
        assert_eq!(msg.body, b"payload");
        assert_eq!(msg.id_str(), "0123456789abcdef");
    }

    #[test]
    fn rejects_short_body() {
        let delegate = Arc::new(CountingDelegate::default());
        assert!(matches!(
            Message::decode(&[0u8; 10], "x".into(), delegate),
            Err(Error::BadFrame(_))
        ));
    }

    #[test]
    fn exactly_one_terminal_action() {
        let id = *b"0123456789abcdef";
        let delegate = Arc::new(CountingDelegate::default());
        let msg = Message::decode(
            &wire_body(&id, b""),
            "x".into(),
            delegate.clone() as Arc<dyn MessageDelegate>,
        )
        .unwrap();

        msg.touch();
        msg.touch();
        msg.finish();
        msg.finish();
        msg.requeue(None);
        msg.touch();

        assert_eq!(delegate.finished.load(Ordering::SeqCst), 1);
        assert_eq!(delegate.requeued.load(Ordering::SeqCst), 0);
        assert_eq!(delegate.touched.load(Ordering::SeqCst), 2);
        assert!(msg.has_responded());
    }

    #[test]
    fn requeue_variants_report_the_backoff_flag() {
        let id = *b"0123456789abcdef";
        let delegate = Arc::new(CountingDelegate::default());

        let deferred = Message::decode(
            &wire_body(&id, b""),
            "x".into(),
            delegate.clone() as Arc<dyn MessageDelegate>,
        )
        .unwrap();
        deferred.requeue_without_backoff(Duration::from_secs(1));

        let failed = Message::decode(
            &wire_body(&id, b""),
            "x".into(),
            delegate.clone() as Arc<dyn MessageDelegate>,
        )
        .unwrap();
        failed.requeue(None);

        assert_eq!(delegate.requeued.load(Ordering::SeqCst), 2);
        assert_eq!(*delegate.backoff_flags.lock().unwrap(), vec![false, true]);
    }
}
