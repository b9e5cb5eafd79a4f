//! Multi-way select over synchronization channels.
//!
//! A [`Select`] is built by chaining receive and send cases and fired with
//! either [`Select::default_fn`] (non-blocking: run at most one ready case,
//! otherwise the default closure) or [`Select::no_default`] (block until
//! one case fires). Per-case callbacks run synchronously inside the select
//! before it returns.
//!
//! **Ordering**: cases are evaluated in registration order and the first
//! ready case fires. This is deliberately not a fair/random choice: the
//! consumer and producer control loops rely on the deterministic scan
//! order, so do not reorder cases to express priority you do not mean.
//!
//! A select can also be pre-built once and driven in a loop with
//! [`Select::execute`], which amortizes listener registration across
//! iterations; [`Select::dispose`] (also run on drop) deregisters the
//! wake listeners from every participating channel.

use std::sync::Arc;

use crate::chan::{Channel, TryRecv, TrySend, WakeToken};
use crate::{Error, Result};

trait Case {
    /// Attempts the case; on success runs its callback and returns true.
    fn poll(&mut self) -> bool;
    fn register(&mut self, token: &Arc<WakeToken>);
    fn unregister(&mut self, token: &Arc<WakeToken>);
}

struct RecvCase<'a, T> {
    ch: Channel<T>,
    cb: Box<dyn FnMut(Option<T>) + 'a>,
}

impl<'a, T> Case for RecvCase<'a, T> {
    fn poll(&mut self) -> bool {
        match self.ch.try_recv() {
            TryRecv::Value(v) => {
                (self.cb)(Some(v));
                true
            }
            TryRecv::Closed => {
                // closed channels are always ready, mirroring recv()
                (self.cb)(None);
                true
            }
            TryRecv::Empty => false,
        }
    }

    fn register(&mut self, token: &Arc<WakeToken>) {
        self.ch.register(token);
    }

    fn unregister(&mut self, token: &Arc<WakeToken>) {
        self.ch.unregister(token);
    }
}

struct SendCase<'a, T> {
    ch: Channel<T>,
    value: Option<T>,
    cb: Box<dyn FnMut(Result<()>) + 'a>,
}

impl<'a, T> Case for SendCase<'a, T> {
    fn poll(&mut self) -> bool {
        let Some(value) = self.value.take() else {
            // the value was already handed over; the case is inert
            return false;
        };
        match self.ch.try_send(value) {
            TrySend::Ok => {
                (self.cb)(Ok(()));
                true
            }
            TrySend::Closed(_) => {
                (self.cb)(Err(Error::ChannelClosed));
                true
            }
            TrySend::Full(v) => {
                self.value = Some(v);
                false
            }
        }
    }

    fn register(&mut self, token: &Arc<WakeToken>) {
        self.ch.register(token);
    }

    fn unregister(&mut self, token: &Arc<WakeToken>) {
        self.ch.unregister(token);
    }
}

/// A multi-way channel select. See the module docs for semantics.
pub struct Select<'a> {
    cases: Vec<Box<dyn Case + 'a>>,
    token: Arc<WakeToken>,
    registered: bool,
}

impl<'a> Select<'a> {
    pub fn new() -> Self {
        Self {
            cases: Vec::new(),
            token: WakeToken::new(),
            registered: false,
        }
    }

    /// Adds a receive case. The callback gets `Some(v)` for a received
    /// value or `None` if the channel is closed and drained.
    pub fn recv<T: 'a>(
        mut self,
        ch: &Channel<T>,
        cb: impl FnMut(Option<T>) + 'a,
    ) -> Self {
        self.cases.push(Box::new(RecvCase {
            ch: ch.clone(),
            cb: Box::new(cb),
        }));
        self
    }

    /// Adds a send case carrying `value`. The case is one-shot: after the
    /// value is handed over (or the channel is found closed) it goes inert.
    pub fn send<T: 'a>(
        mut self,
        ch: &Channel<T>,
        value: T,
        cb: impl FnMut(Result<()>) + 'a,
    ) -> Self {
        self.cases.push(Box::new(SendCase {
            ch: ch.clone(),
            value: Some(value),
            cb: Box::new(cb),
        }));
        self
    }

    fn poll_once(&mut self) -> Option<usize> {
        for (i, case) in self.cases.iter_mut().enumerate() {
            if case.poll() {
                return Some(i);
            }
        }
        None
    }

    /// Non-blocking select: fires the first ready case, or runs `default`
    /// if none is ready. Returns the fired case index, if any.
    pub fn default_fn(mut self, default: impl FnOnce()) -> Option<usize> {
        let fired = self.poll_once();
        if fired.is_none() {
            default();
        }
        fired
    }

    /// Blocking select: waits until exactly one case fires and returns its
    /// registration index. Consumes the select.
    pub fn no_default(mut self) -> usize {
        self.execute()
    }

    /// Blocking select for the deferred/reusable mode: registers wake
    /// listeners on first use and leaves them in place so the select can be
    /// executed repeatedly in a loop.
    pub fn execute(&mut self) -> usize {
        if !self.registered {
            for case in &mut self.cases {
                case.register(&self.token);
            }
            self.registered = true;
        }
        loop {
            if let Some(i) = self.poll_once() {
                return i;
            }
            self.token.wait_and_reset();
        }
    }

    /// Deregisters the wake listeners from every channel. Idempotent; also
    /// runs on drop.
    pub fn dispose(&mut self) {
        if self.registered {
            for case in &mut self.cases {
                case.unregister(&self.token);
            }
            self.registered = false;
        }
    }
}

impl Default for Select<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Select<'_> {
    fn drop(&mut self) {
        self.dispose();
    }
}
