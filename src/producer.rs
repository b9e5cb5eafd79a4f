//! Topic producer.
//!
//! A [`Producer`] owns one connection to an nsqd and publishes messages to
//! named topics, synchronously or asynchronously. Replies are correlated
//! to commands by a FIFO transaction queue per connection: the protocol
//! guarantees the Nth reply answers the Nth outstanding command.
//!
//! The connection is dialed lazily; the first publish connects. After
//! [`Producer::stop`] every publish fails with `Error::Stopped`.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::chan::Channel;
use crate::config::Config;
use crate::conn::{Conn, ConnDelegate};
use crate::protocol::{self, Command};
use crate::select::Select;
use crate::{Error, Result};

/// Outcome of an asynchronous publish, delivered on the caller's result
/// channel.
pub struct TransactionResult {
    /// `None` on success; the command's failure otherwise.
    pub error: Option<Error>,
    /// Caller-supplied correlation arguments, passed back untouched.
    pub args: Option<Box<dyn Any + Send>>,
}

struct Transaction {
    cmd: Command,
    done: Channel<TransactionResult>,
    args: Option<Box<dyn Any + Send>>,
}

impl Transaction {
    fn resolve(self, error: Option<Error>) {
        // bounded(1) caller channels always have room; a full or closed
        // channel means the caller walked away, which is their business
        let _ = self.done.try_send(TransactionResult {
            error,
            args: self.args,
        });
    }
}

struct Running {
    conn: Arc<Conn>,
    txn_chan: Channel<Transaction>,
    router: Option<JoinHandle<()>>,
    read_loop: Option<JoinHandle<()>>,
}

enum State {
    Idle,
    Running(Running),
    Stopped,
}

struct ProducerInner {
    addr: String,
    config: Config,
    state: Mutex<State>,
    stopped: AtomicBool,
}

/// Publishes messages to topics on a single nsqd.
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    /// Creates a producer for the nsqd at `addr` (`host:port`). No
    /// connection is made until [`Producer::connect`] or the first publish.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `config` fails validation.
    pub fn new(addr: &str, config: Config) -> Result<Producer> {
        config.validate()?;
        Ok(Producer {
            inner: Arc::new(ProducerInner {
                addr: addr.to_string(),
                config,
                state: Mutex::new(State::Idle),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Dials the nsqd now instead of on first publish. Idempotent while
    /// the connection is healthy.
    pub fn connect(&self) -> Result<()> {
        self.ensure_connected().map(|_| ())
    }

    /// Publishes `body` to `topic`, blocking until the server acknowledges.
    ///
    /// # Errors
    ///
    /// `Error::Stopped` after [`Producer::stop`]; `Error::ProtocolError`
    /// when the server answers with an error frame; connection errors
    /// otherwise.
    pub fn publish(&self, topic: &str, body: &[u8]) -> Result<()> {
        protocol::check_topic_name(topic)?;
        self.publish_sync(Command::publish(topic, body.to_vec()))
    }

    /// Atomically publishes a batch of messages to `topic`.
    pub fn multi_publish(&self, topic: &str, bodies: &[Vec<u8>]) -> Result<()> {
        protocol::check_topic_name(topic)?;
        self.publish_sync(Command::multi_publish(topic, bodies))
    }

    /// Enqueues a publish and returns immediately; a [`TransactionResult`]
    /// carrying `args` is later pushed onto `done`.
    ///
    /// `done` should be a bounded channel with room for the result; this
    /// is the building block for pooling one producer across many
    /// concurrent publishers.
    pub fn publish_async(
        &self,
        topic: &str,
        body: &[u8],
        done: &Channel<TransactionResult>,
        args: Option<Box<dyn Any + Send>>,
    ) -> Result<()> {
        protocol::check_topic_name(topic)?;
        self.enqueue(Command::publish(topic, body.to_vec()), done.clone(), args)
    }

    /// Asynchronous batch publish; see [`Producer::publish_async`].
    pub fn multi_publish_async(
        &self,
        topic: &str,
        bodies: &[Vec<u8>],
        done: &Channel<TransactionResult>,
        args: Option<Box<dyn Any + Send>>,
    ) -> Result<()> {
        protocol::check_topic_name(topic)?;
        self.enqueue(Command::multi_publish(topic, bodies), done.clone(), args)
    }

    /// Stops the producer: fails pending transactions, closes the
    /// connection, and blocks until the router and read-loop workers have
    /// exited. Safe to call concurrently with in-flight publishes;
    /// idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("producer[{}] stopping", self.inner.addr);
        let prev = {
            let mut st = self.inner.state.lock().unwrap();
            mem::replace(&mut *st, State::Stopped)
        };
        if let State::Running(mut running) = prev {
            running.txn_chan.close();
            running.conn.close();
            if let Some(h) = running.router.take() {
                let _ = h.join();
            }
            if let Some(h) = running.read_loop.take() {
                let _ = h.join();
            }
        }
    }

    fn publish_sync(&self, cmd: Command) -> Result<()> {
        let done = Channel::bounded(1);
        self.enqueue(cmd, done.clone(), None)?;
        match done.recv() {
            Some(result) => match result.error {
                Some(e) => Err(e),
                None => Ok(()),
            },
            None => Err(Error::Stopped("producer")),
        }
    }

    fn enqueue(
        &self,
        cmd: Command,
        done: Channel<TransactionResult>,
        args: Option<Box<dyn Any + Send>>,
    ) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::Stopped("producer"));
        }
        let txn_chan = self.ensure_connected()?;
        txn_chan
            .send(Transaction { cmd, done, args })
            .map_err(|_| Error::Stopped("producer"))
    }

    fn ensure_connected(&self) -> Result<Channel<Transaction>> {
        let mut st = self.inner.state.lock().unwrap();
        match &mut *st {
            State::Stopped => Err(Error::Stopped("producer")),
            State::Running(running) if !running.conn.is_closed() => {
                Ok(running.txn_chan.clone())
            }
            other => {
                // reap a dead connection's workers before redialing
                if let State::Running(mut running) = mem::replace(other, State::Idle) {
                    if let Some(h) = running.router.take() {
                        let _ = h.join();
                    }
                    if let Some(h) = running.read_loop.take() {
                        let _ = h.join();
                    }
                }
                let running = self.dial()?;
                let txn_chan = running.txn_chan.clone();
                *other = State::Running(running);
                Ok(txn_chan)
            }
        }
    }

    fn dial(&self) -> Result<Running> {
        let inner = &self.inner;
        let response_chan = Channel::unbuffered();
        let error_chan = Channel::unbuffered();
        let close_chan = Channel::<()>::bounded(1);
        let delegate = Arc::new(ProducerConnDelegate {
            response_chan: response_chan.clone(),
            error_chan: error_chan.clone(),
            close_chan: close_chan.clone(),
        });
        let (conn, read_loop) = Conn::connect(&inner.addr, &inner.config, delegate)?;
        log::info!("producer[{}] connected", inner.addr);

        let txn_chan = Channel::<Transaction>::unbuffered();
        let router = {
            let conn = Arc::clone(&conn);
            let txn_chan = txn_chan.clone();
            let addr = inner.addr.clone();
            std::thread::Builder::new()
                .name(format!("nsq-producer-{addr}"))
                .spawn(move || {
                    router(addr, conn, txn_chan, response_chan, error_chan, close_chan)
                })
                .map_err(Error::Io)?
        };
        Ok(Running {
            conn,
            txn_chan,
            router: Some(router),
            read_loop: Some(read_loop),
        })
    }
}

enum RouterEvent {
    Txn(Option<Transaction>),
    Reply(Option<Vec<u8>>),
    Fault(Option<Vec<u8>>),
    ConnClosed,
}

/// One worker per connection: accepts transactions, writes their commands,
/// and resolves them in FIFO order as replies arrive.
fn router(
    addr: String,
    conn: Arc<Conn>,
    txn_chan: Channel<Transaction>,
    response_chan: Channel<Vec<u8>>,
    error_chan: Channel<Vec<u8>>,
    close_chan: Channel<()>,
) {
    let mut pending: VecDeque<Transaction> = VecDeque::new();
    let slot: Rc<RefCell<Option<RouterEvent>>> = Rc::new(RefCell::new(None));
    let (s1, s2, s3, s4) = (slot.clone(), slot.clone(), slot.clone(), slot.clone());
    let mut sel = Select::new()
        .recv(&txn_chan, move |t| {
            *s1.borrow_mut() = Some(RouterEvent::Txn(t));
        })
        .recv(&response_chan, move |d| {
            *s2.borrow_mut() = Some(RouterEvent::Reply(d));
        })
        .recv(&error_chan, move |d| {
            *s3.borrow_mut() = Some(RouterEvent::Fault(d));
        })
        .recv(&close_chan, move |_| {
            *s4.borrow_mut() = Some(RouterEvent::ConnClosed);
        });

    let mut txn_open = true;
    loop {
        if !txn_open && conn.is_closed() {
            break;
        }
        sel.execute();
        let Some(event) = slot.borrow_mut().take() else {
            continue;
        };
        match event {
            RouterEvent::Txn(Some(txn)) => {
                if let Err(e) = conn.write_command(&txn.cmd) {
                    log::error!("producer[{addr}] {} write failed: {e}", txn.cmd.name());
                    txn.resolve(Some(e));
                    conn.close();
                } else {
                    pending.push_back(txn);
                }
            }
            RouterEvent::Txn(None) => {
                // producer is stopping; the conn close event finishes us
                txn_open = false;
            }
            RouterEvent::Reply(Some(data)) => match pending.pop_front() {
                Some(txn) => txn.resolve(None),
                None => log::warn!(
                    "producer[{addr}] reply with no outstanding command: {}",
                    String::from_utf8_lossy(&data)
                ),
            },
            RouterEvent::Fault(Some(data)) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                match pending.pop_front() {
                    Some(txn) => txn.resolve(Some(Error::ProtocolError(text))),
                    None => log::warn!(
                        "producer[{addr}] error frame with no outstanding command: {text}"
                    ),
                }
            }
            RouterEvent::Reply(None) | RouterEvent::Fault(None) | RouterEvent::ConnClosed => {
                break;
            }
        }
    }
    // whatever is still outstanding can never be answered
    for txn in pending {
        txn.resolve(Some(Error::Stopped("producer")));
    }
    // unblock publishers that were racing the shutdown
    txn_chan.close();
    while let crate::chan::TryRecv::Value(txn) = txn_chan.try_recv() {
        txn.resolve(Some(Error::Stopped("producer")));
    }
    // and the read loop, should it be parked delivering a frame
    response_chan.close();
    error_chan.close();
    log::debug!("producer[{addr}] router exited");
}

struct ProducerConnDelegate {
    response_chan: Channel<Vec<u8>>,
    error_chan: Channel<Vec<u8>>,
    close_chan: Channel<()>,
}

impl ConnDelegate for ProducerConnDelegate {
    fn on_response(&self, _conn: &Arc<Conn>, data: Vec<u8>) {
        let _ = self.response_chan.send(data);
    }

    fn on_error(&self, _conn: &Arc<Conn>, data: Vec<u8>) {
        let _ = self.error_chan.send(data);
    }

    fn on_message_frame(&self, conn: &Arc<Conn>, _body: Vec<u8>) {
        log::warn!(
            "producer[{}] discarding unexpected message frame",
            conn.addr()
        );
    }

    fn on_io_error(&self, conn: &Arc<Conn>, err: Error) {
        log::error!("producer[{}] io error: {err}", conn.addr());
    }

    fn on_close(&self, conn: &Arc<Conn>) {
        log::info!("producer[{}] connection closed", conn.addr());
        self.close_chan.close();
    }
}
