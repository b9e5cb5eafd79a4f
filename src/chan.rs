//! Synchronization channels.
//!
//! A `Channel<T>` is a typed, thread-safe hand-off point between workers.
//! Two modes exist:
//!
//! - **unbuffered** (rendezvous): `send` blocks until a receiver takes the
//!   value, so a completed send proves delivery;
//! - **bounded**: `send` blocks only when the buffer is full.
//!
//! `close()` is idempotent, wakes every blocked sender and receiver, fails
//! all future sends, and lets receivers drain any buffered values before
//! observing the closed state. A value that made it into the buffer is
//! never lost to a close.
//!
//! There is no separate cancellation mechanism: a blocked `send`/`recv` is
//! released only by the operation completing or the channel closing.
//! Callers that need a timeout compose a timer channel (`after`, `tick`)
//! into a [`Select`](crate::select::Select).
//!
//! Internally a channel is one mutex around a ring buffer plus a rendezvous
//! slot, with two condvars ("space available", "data available") and a
//! listener registry so a blocked select is woken by any state change
//! without polling.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// Wake latch shared between a select and the channels it waits on.
///
/// Channels notify the token on every state change; the select re-scans its
/// cases after each wake. The fired flag latches so a notification during a
/// scan is not lost.
pub(crate) struct WakeToken {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl WakeToken {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            fired: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    pub(crate) fn notify(&self) {
        let mut fired = self.fired.lock().unwrap();
        *fired = true;
        self.cv.notify_all();
    }

    /// Blocks until notified, then resets the latch for the next round.
    pub(crate) fn wait_and_reset(&self) {
        let mut fired = self.fired.lock().unwrap();
        while !*fired {
            fired = self.cv.wait(fired).unwrap();
        }
        *fired = false;
    }
}

struct State<T> {
    buf: VecDeque<T>,
    cap: usize, // 0 = rendezvous
    closed: bool,
    // rendezvous hand-off: one value in flight at a time, identified by a
    // sequence number so concurrent senders each wait for their own pickup
    handoff: Option<T>,
    handoff_id: u64,
    taken_id: u64,
    recv_waiting: usize,
    listeners: Vec<Weak<WakeToken>>,
}

impl<T> State<T> {
    fn wake_listeners(&mut self) {
        self.listeners.retain(|w| match w.upgrade() {
            Some(token) => {
                token.notify();
                true
            }
            None => false,
        });
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    send_cv: Condvar, // space available / value picked up
    recv_cv: Condvar, // data available / closed
}

/// A cloneable handle to a synchronization channel.
///
/// All clones refer to the same channel; closing through any handle closes
/// the channel for every holder.
pub struct Channel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Outcome of a non-blocking send attempt.
pub enum TrySend<T> {
    Ok,
    /// No buffer space (bounded) or no waiting receiver (unbuffered).
    Full(T),
    Closed(T),
}

/// Outcome of a non-blocking receive attempt.
pub enum TryRecv<T> {
    Value(T),
    Empty,
    Closed,
}

impl<T> Channel<T> {
    /// Creates an unbuffered (rendezvous) channel.
    pub fn unbuffered() -> Self {
        Self::with_capacity(0)
    }

    /// Creates a bounded channel that buffers up to `cap` values.
    pub fn bounded(cap: usize) -> Self {
        assert!(cap > 0, "bounded channel requires capacity > 0");
        Self::with_capacity(cap)
    }

    fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    buf: VecDeque::new(),
                    cap,
                    closed: false,
                    handoff: None,
                    handoff_id: 0,
                    taken_id: 0,
                    recv_waiting: 0,
                    listeners: Vec::new(),
                }),
                send_cv: Condvar::new(),
                recv_cv: Condvar::new(),
            }),
        }
    }

    /// Sends a value, blocking until it is delivered (unbuffered) or
    /// buffered (bounded).
    ///
    /// # Errors
    ///
    /// Returns `Error::ChannelClosed` if the channel is, or becomes, closed
    /// before the value is accepted.
    pub fn send(&self, value: T) -> Result<()> {
        let mut st = self.inner.state.lock().unwrap();
        if st.cap == 0 {
            // rendezvous: wait for a receiver, hand the value over, then
            // wait for the pickup
            let mut value = Some(value);
            loop {
                if st.closed {
                    return Err(Error::ChannelClosed);
                }
                if st.recv_waiting > 0 && st.handoff.is_none() {
                    st.handoff_id += 1;
                    let id = st.handoff_id;
                    st.handoff = value.take();
                    self.inner.recv_cv.notify_one();
                    st.wake_listeners();
                    while st.taken_id < id && !st.closed {
                        st = self.inner.send_cv.wait(st).unwrap();
                    }
                    if st.taken_id >= id {
                        return Ok(());
                    }
                    // closed before pickup: reclaim the slot if still ours
                    if st.handoff_id == id {
                        st.handoff = None;
                    }
                    return Err(Error::ChannelClosed);
                }
                st = self.inner.send_cv.wait(st).unwrap();
            }
        } else {
            loop {
                if st.closed {
                    return Err(Error::ChannelClosed);
                }
                if st.buf.len() < st.cap {
                    st.buf.push_back(value);
                    self.inner.recv_cv.notify_one();
                    st.wake_listeners();
                    return Ok(());
                }
                st = self.inner.send_cv.wait(st).unwrap();
            }
        }
    }

    /// Attempts a send without blocking.
    pub fn try_send(&self, value: T) -> TrySend<T> {
        let mut st = self.inner.state.lock().unwrap();
        if st.closed {
            return TrySend::Closed(value);
        }
        if st.cap == 0 {
            if st.recv_waiting > 0 && st.handoff.is_none() {
                st.handoff_id += 1;
                st.handoff = Some(value);
                self.inner.recv_cv.notify_one();
                st.wake_listeners();
                TrySend::Ok
            } else {
                TrySend::Full(value)
            }
        } else if st.buf.len() < st.cap {
            st.buf.push_back(value);
            self.inner.recv_cv.notify_one();
            st.wake_listeners();
            TrySend::Ok
        } else {
            TrySend::Full(value)
        }
    }

    /// Receives the next value, blocking until one is available.
    ///
    /// Returns `None` once the channel is closed and drained. Receiving
    /// never errors; buffered values survive a close.
    pub fn recv(&self) -> Option<T> {
        let mut st = self.inner.state.lock().unwrap();
        loop {
            if let Some(v) = Self::take_ready(&mut st, &self.inner) {
                return Some(v);
            }
            if st.closed {
                return None;
            }
            st.recv_waiting += 1;
            // a rendezvous sender may be parked waiting for a receiver
            self.inner.send_cv.notify_all();
            st.wake_listeners();
            st = self.inner.recv_cv.wait(st).unwrap();
            st.recv_waiting -= 1;
        }
    }

    /// Receives with a timeout.
    ///
    /// Returns `Ok(Some(v))` on success, `Ok(None)` if the channel closed
    /// and drained, or `Err(Error::Timeout)`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        let deadline = Instant::now() + timeout;
        let mut st = self.inner.state.lock().unwrap();
        loop {
            if let Some(v) = Self::take_ready(&mut st, &self.inner) {
                return Ok(Some(v));
            }
            if st.closed {
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            st.recv_waiting += 1;
            self.inner.send_cv.notify_all();
            st.wake_listeners();
            let (guard, _res) = self
                .inner
                .recv_cv
                .wait_timeout(st, deadline - now)
                .unwrap();
            st = guard;
            st.recv_waiting -= 1;
        }
    }

    /// Attempts a receive without blocking.
    pub fn try_recv(&self) -> TryRecv<T> {
        let mut st = self.inner.state.lock().unwrap();
        if let Some(v) = Self::take_ready(&mut st, &self.inner) {
            TryRecv::Value(v)
        } else if st.closed {
            TryRecv::Closed
        } else {
            TryRecv::Empty
        }
    }

    fn take_ready(st: &mut State<T>, inner: &Inner<T>) -> Option<T> {
        if let Some(v) = st.buf.pop_front() {
            inner.send_cv.notify_one();
            st.wake_listeners();
            return Some(v);
        }
        if st.handoff.is_some() {
            let v = st.handoff.take();
            st.taken_id = st.handoff_id;
            inner.send_cv.notify_all();
            st.wake_listeners();
            return v;
        }
        None
    }

    /// Closes the channel. Idempotent.
    ///
    /// Blocked senders fail with `Error::ChannelClosed`; receivers drain
    /// any buffered values first.
    pub fn close(&self) {
        let mut st = self.inner.state.lock().unwrap();
        if st.closed {
            return;
        }
        st.closed = true;
        self.inner.send_cv.notify_all();
        self.inner.recv_cv.notify_all();
        st.wake_listeners();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    /// Number of values currently buffered.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn register(&self, token: &Arc<WakeToken>) {
        let mut st = self.inner.state.lock().unwrap();
        st.listeners.push(Arc::downgrade(token));
    }

    pub(crate) fn unregister(&self, token: &Arc<WakeToken>) {
        let mut st = self.inner.state.lock().unwrap();
        st.listeners
            .retain(|w| w.upgrade().is_some_and(|t| !Arc::ptr_eq(&t, token)));
    }
}

/// Returns a channel that receives one `()` after `d`, then closes.
///
/// The timer runs on its own thread; dropping the returned channel does not
/// cancel it.
pub fn after(d: Duration) -> Channel<()> {
    let ch = Channel::bounded(1);
    let tx = ch.clone();
    thread::spawn(move || {
        thread::sleep(d);
        let _ = tx.try_send(());
        tx.close();
    });
    ch
}

/// Stop handle for a [`tick`] channel.
pub struct Ticker {
    stop: Channel<()>,
}

impl Ticker {
    /// Stops the ticker; the tick channel closes shortly after. Idempotent.
    pub fn stop(&self) {
        self.stop.close();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop.close();
    }
}

/// Returns a channel that receives `()` every `every`, plus its stop handle.
///
/// Ticks are coalesced: if the receiver lags, at most one tick is buffered.
pub fn tick(every: Duration) -> (Channel<()>, Ticker) {
    let ch = Channel::bounded(1);
    let tx = ch.clone();
    let stop = Channel::<()>::bounded(1);
    let stop_rx = stop.clone();
    thread::spawn(move || loop {
        match stop_rx.recv_timeout(every) {
            Err(Error::Timeout) => {
                let _ = tx.try_send(());
            }
            _ => {
                tx.close();
                return;
            }
        }
    });
    (ch, Ticker { stop })
}
