//! Topic/channel consumer.
//!
//! A [`Consumer`] owns N connections for one topic/channel pair and
//! dispatches received messages to a pool of handler workers. Three
//! mechanisms share the work of keeping the pipeline full without
//! overrunning the `max_in_flight` budget:
//!
//! - **RDY flow control**: each connection is granted a slice of the
//!   budget (`max(1, max_in_flight / connections)`, never exceeding the
//!   total) and the grant is refreshed when its remaining credit runs low;
//! - **backoff**: handler failures drive a whole-consumer exponential
//!   backoff: credit is pulled to zero everywhere, and after the backoff
//!   window one randomly chosen connection gets a single probe message
//!   whose outcome moves the state machine;
//! - **redistribution**: when the budget is smaller than the connection
//!   count, a periodic pass reclaims credit from idle connections and
//!   hands it to starved ones, so an empty topic partition cannot pin the
//!   only credit.
//!
//! Shutdown is a join barrier: [`Consumer::stop`] closes every socket and
//! the incoming message channel, then blocks until every read loop,
//! handler worker and the redistribution worker have exited.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::admin::AdminClient;
use crate::chan::{self, Channel};
use crate::config::Config;
use crate::conn::{Conn, ConnDelegate};
use crate::duration;
use crate::message::{Message, MessageDelegate};
use crate::protocol::{self, Command};
use crate::select::Select;
use crate::{Error, Result};

/// Application message handler. One handler instance is shared by every
/// worker in the pool, so implementations must be internally synchronized
/// (or stateless).
pub trait Handler: Send + Sync + 'static {
    /// Processes one message. Returning `Err` (or panicking) counts as a
    /// failure: the message is requeued and the consumer's backoff counter
    /// grows. With [`Message::disable_auto_response`] the handler takes
    /// over responding itself.
    fn handle_message(
        &self,
        msg: &Message,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Called instead of another requeue when a message exceeds
    /// `max_attempts`; the message is then finished.
    fn log_failed_message(&self, msg: &Message) {
        log::warn!(
            "giving up on message {} after {} attempts",
            msg.id_str(),
            msg.attempts
        );
    }
}

/// Point-in-time counters for a consumer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumerStats {
    pub connections: usize,
    pub messages_received: u64,
    pub messages_finished: u64,
    pub messages_requeued: u64,
}

/// Whole-consumer backoff state plus the granted-RDY ledger.
///
/// `total_rdy` is the sum of the most recent RDY grant per live
/// connection; every grant goes through `update_rdy_locked` so the sum
/// can never exceed `max_in_flight`.
struct Flow {
    total_rdy: i64,
    backoff_counter: u32,
    resume_at: Option<Instant>,
}

impl Flow {
    fn in_backoff(&self) -> bool {
        self.backoff_counter > 0
    }
}

struct ConsumerInner {
    topic: String,
    channel: String,
    config: Config,

    conns: Mutex<HashMap<String, Arc<Conn>>>,
    flow: Mutex<Flow>,
    max_in_flight: AtomicI64,

    incoming: Channel<Message>,
    backoff_signal: Channel<()>,
    exit_chan: Channel<()>,
    stopped_chan: Channel<()>,
    stop_flag: AtomicBool,

    threads: Mutex<Vec<JoinHandle<()>>>,
    handler_count: AtomicUsize,

    admin: Mutex<Option<Arc<dyn AdminClient>>>,

    messages_received: AtomicU64,
    messages_finished: AtomicU64,
    messages_requeued: AtomicU64,
}

/// Consumes a topic through a named channel across one or more nsqd
/// connections.
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    /// Creates a consumer for `topic`/`channel`.
    ///
    /// # Errors
    ///
    /// `Error::InvalidName` for a bad topic or channel name;
    /// `Error::Config` if `config` fails validation.
    pub fn new(topic: &str, channel: &str, config: Config) -> Result<Consumer> {
        protocol::check_topic_name(topic)?;
        protocol::check_channel_name(channel)?;
        config.validate()?;

        let max_in_flight = config.max_in_flight as i64;
        let inner = Arc::new(ConsumerInner {
            topic: topic.to_string(),
            channel: channel.to_string(),
            config,
            conns: Mutex::new(HashMap::new()),
            flow: Mutex::new(Flow {
                total_rdy: 0,
                backoff_counter: 0,
                resume_at: None,
            }),
            max_in_flight: AtomicI64::new(max_in_flight),
            incoming: Channel::unbuffered(),
            backoff_signal: Channel::bounded(1),
            exit_chan: Channel::bounded(1),
            stopped_chan: Channel::bounded(1),
            stop_flag: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            handler_count: AtomicUsize::new(0),
            admin: Mutex::new(None),
            messages_received: AtomicU64::new(0),
            messages_finished: AtomicU64::new(0),
            messages_requeued: AtomicU64::new(0),
        });

        let rdy_worker = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name(format!("nsq-rdy-{topic}/{channel}"))
                .spawn(move || rdy_loop(inner))
                .map_err(Error::Io)?
        };
        inner.threads.lock().unwrap().push(rdy_worker);

        Ok(Consumer { inner })
    }

    /// Installs the collaborator used to create the topic/channel before
    /// the first connect. Optional; without it the server is expected to
    /// know the topic already.
    pub fn set_admin_client(&self, admin: Arc<dyn AdminClient>) {
        *self.inner.admin.lock().unwrap() = Some(admin);
    }

    /// Adds `concurrency` handler workers sharing `handler`. Must be
    /// called before the first connect.
    pub fn add_handler(&self, handler: Arc<dyn Handler>, concurrency: usize) -> Result<()> {
        if self.inner.stop_flag.load(Ordering::SeqCst) {
            return Err(Error::Stopped("consumer"));
        }
        if !self.inner.conns.lock().unwrap().is_empty() {
            return Err(Error::Config(
                "handlers must be added before connecting".to_string(),
            ));
        }
        if concurrency == 0 {
            return Err(Error::Config("handler concurrency must be > 0".to_string()));
        }
        let mut threads = self.inner.threads.lock().unwrap();
        for i in 0..concurrency {
            let inner = Arc::clone(&self.inner);
            let handler = Arc::clone(&handler);
            let worker = std::thread::Builder::new()
                .name(format!("nsq-handler-{}/{}-{i}", self.inner.topic, self.inner.channel))
                .spawn(move || handler_loop(inner, handler))
                .map_err(Error::Io)?;
            threads.push(worker);
        }
        self.inner
            .handler_count
            .fetch_add(concurrency, Ordering::SeqCst);
        Ok(())
    }

    /// Connects to the nsqd at `addr`, subscribes, and grants the initial
    /// RDY slice. Idempotent connections are an error: each address may be
    /// connected at most once.
    pub fn connect_to_nsqd(&self, addr: &str) -> Result<()> {
        let inner = &self.inner;
        if inner.stop_flag.load(Ordering::SeqCst) {
            return Err(Error::Stopped("consumer"));
        }
        if inner.handler_count.load(Ordering::SeqCst) == 0 {
            return Err(Error::Config(
                "add a handler before connecting".to_string(),
            ));
        }
        if inner.conns.lock().unwrap().contains_key(addr) {
            return Err(Error::AlreadyConnected(addr.to_string()));
        }

        let admin = inner.admin.lock().unwrap().clone();
        if let Some(admin) = admin {
            admin.create_topic(&inner.topic)?;
            admin.create_channel(&inner.topic, &inner.channel)?;
        }

        let delegate = Arc::new(ConsumerConnDelegate {
            inner: Arc::clone(inner),
        });
        let (conn, read_worker) = Conn::connect(addr, &inner.config, delegate)?;
        // the read worker must be joinable from stop() even when SUB fails
        inner.threads.lock().unwrap().push(read_worker);
        if let Err(e) =
            conn.write_command(&Command::subscribe(&inner.topic, &inner.channel))
        {
            conn.close();
            return Err(e);
        }
        inner
            .conns
            .lock()
            .unwrap()
            .insert(addr.to_string(), Arc::clone(&conn));
        log::info!(
            "consumer[{}/{}] connected to {addr}",
            inner.topic,
            inner.channel
        );

        // grant the initial slice and shrink existing grants to the new
        // per-connection share
        let mut flow = inner.flow.lock().unwrap();
        if !flow.in_backoff() {
            inner.rebalance_locked(&mut flow);
        }
        Ok(())
    }

    /// Closes the connection to `addr` and removes it from the RDY pool.
    pub fn disconnect_from_nsqd(&self, addr: &str) -> Result<()> {
        let inner = &self.inner;
        let conn = {
            let mut flow = inner.flow.lock().unwrap();
            let conn = inner
                .conns
                .lock()
                .unwrap()
                .remove(addr)
                .ok_or(Error::NotConnected)?;
            flow.total_rdy -= conn.last_rdy();
            conn
        };
        let _ = conn.write_command(&Command::start_close());
        conn.close();
        Ok(())
    }

    /// Adjusts the total in-flight budget at runtime and rebalances the
    /// per-connection grants.
    pub fn change_max_in_flight(&self, max_in_flight: usize) {
        self.inner
            .max_in_flight
            .store(max_in_flight as i64, Ordering::SeqCst);
        let mut flow = self.inner.flow.lock().unwrap();
        if !flow.in_backoff() {
            self.inner.rebalance_locked(&mut flow);
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            connections: self.inner.conns.lock().unwrap().len(),
            messages_received: self.inner.messages_received.load(Ordering::SeqCst),
            messages_finished: self.inner.messages_finished.load(Ordering::SeqCst),
            messages_requeued: self.inner.messages_requeued.load(Ordering::SeqCst),
        }
    }

    /// A channel that closes once [`Consumer::stop`] has fully torn the
    /// consumer down.
    pub fn stopped_chan(&self) -> Channel<()> {
        self.inner.stopped_chan.clone()
    }

    /// Stops the consumer: asks every connection to close cleanly, shuts
    /// the sockets, closes the incoming message channel so handler workers
    /// drain, and blocks until every worker has exited. Idempotent; safe
    /// concurrently with in-flight handling.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner.stop_flag.swap(true, Ordering::SeqCst) {
            // a concurrent stop() is already tearing down; wait for it
            inner.stopped_chan.recv();
            return;
        }
        log::info!("consumer[{}/{}] stopping", inner.topic, inner.channel);

        let conns: Vec<Arc<Conn>> = inner.conns.lock().unwrap().values().cloned().collect();
        for conn in &conns {
            let _ = conn.write_command(&Command::ready(0));
            let _ = conn.write_command(&Command::start_close());
            conn.close();
        }
        inner.exit_chan.close();
        inner.incoming.close();

        let handles: Vec<JoinHandle<()>> = mem::take(&mut *inner.threads.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        inner.stopped_chan.close();
        log::info!("consumer[{}/{}] stopped", inner.topic, inner.channel);
    }
}

impl ConsumerInner {
    fn max_in_flight(&self) -> i64 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn conn_snapshot(&self) -> Vec<Arc<Conn>> {
        self.conns.lock().unwrap().values().cloned().collect()
    }

    /// Budget slice for one connection:
    /// `min(max(1, max_in_flight / connections), max_in_flight)`.
    fn per_conn_max_in_flight(&self) -> i64 {
        let conns = self.conns.lock().unwrap().len().max(1) as i64;
        let mif = self.max_in_flight();
        (mif / conns).max(1).min(mif)
    }

    /// Grants `count` RDY to `conn`, clamped so the sum of grants never
    /// exceeds `max_in_flight` (or the server's negotiated ceiling).
    /// Caller holds the flow lock, which also serializes RDY writes.
    fn update_rdy_locked(&self, flow: &mut Flow, conn: &Arc<Conn>, count: i64) {
        if conn.is_closed() {
            return;
        }
        let count = count.min(conn.max_rdy_count());
        let granted = conn.last_rdy();
        let available = self.max_in_flight() - (flow.total_rdy - granted);
        let target = count.min(available.max(0));
        if target == granted && target == conn.rdy() {
            return;
        }
        flow.total_rdy += target - granted;
        conn.set_rdy(target);
        log::debug!(
            "consumer[{}/{}] RDY {target} -> {}",
            self.topic,
            self.channel,
            conn.addr()
        );
        if let Err(e) = conn.write_command(&Command::ready(target)) {
            log::error!("RDY write to {} failed: {e}", conn.addr());
            conn.close();
        }
    }

    /// Re-slices the budget across all live connections. Caller holds the
    /// flow lock and has checked we are not backing off.
    fn rebalance_locked(&self, flow: &mut Flow) {
        let count = self.per_conn_max_in_flight();
        for conn in self.conn_snapshot() {
            self.update_rdy_locked(flow, &conn, count);
        }
    }

    /// Refreshes a connection's grant when its remaining credit runs low,
    /// so delivery never stalls waiting for the next redistribution pass.
    fn maybe_update_rdy(&self, conn: &Arc<Conn>) {
        if self.stop_flag.load(Ordering::SeqCst) {
            return;
        }
        let mut flow = self.flow.lock().unwrap();
        if flow.in_backoff() {
            return;
        }
        let remaining = conn.rdy();
        let granted = conn.last_rdy();
        if remaining <= (granted / 4).max(1) {
            let slice = self.per_conn_max_in_flight();
            self.update_rdy_locked(&mut flow, conn, slice);
        }
    }

    /// `multiplier * 2^(n-1)`, clamped to `max_backoff_duration`.
    fn backoff_duration(&self, counter: u32) -> Duration {
        let shift = counter.saturating_sub(1).min(16);
        self.config
            .backoff_multiplier
            .saturating_mul(1u32 << shift)
            .min(self.config.max_backoff_duration)
    }

    /// Opens (or extends) the backoff window: all credit to zero, one
    /// timer armed for the resume probe. Caller holds the flow lock.
    fn enter_backoff_window_locked(&self, flow: &mut Flow) {
        let d = self.backoff_duration(flow.backoff_counter);
        flow.resume_at = Some(Instant::now() + d);
        log::warn!(
            "consumer[{}/{}] backing off for {} (counter {})",
            self.topic,
            self.channel,
            duration::format(d),
            flow.backoff_counter
        );
        for conn in self.conn_snapshot() {
            self.update_rdy_locked(flow, &conn, 0);
        }
        let signal = self.backoff_signal.clone();
        std::thread::spawn(move || {
            std::thread::sleep(d);
            let _ = signal.try_send(());
        });
    }

    /// Success path, run *before* the FIN is written so the RDY command
    /// sequence is strictly ordered per connection.
    fn on_message_success(&self) {
        let mut flow = self.flow.lock().unwrap();
        if !flow.in_backoff() {
            return;
        }
        flow.backoff_counter -= 1;
        if flow.backoff_counter == 0 {
            flow.resume_at = None;
            log::info!(
                "consumer[{}/{}] backoff complete, resuming",
                self.topic,
                self.channel
            );
            self.rebalance_locked(&mut flow);
        } else {
            self.enter_backoff_window_locked(&mut flow);
        }
    }

    /// Failure path, run *before* the REQ is written.
    fn on_message_failure(&self) {
        let mut flow = self.flow.lock().unwrap();
        flow.backoff_counter += 1;
        self.enter_backoff_window_locked(&mut flow);
    }

    /// Backoff-timer wakeup: grant a single probe RDY to one random
    /// connection. Stale timers (a later failure extended the window) are
    /// detected by re-checking the deadline.
    fn resume_from_backoff(&self) {
        let mut flow = self.flow.lock().unwrap();
        if !flow.in_backoff() {
            return;
        }
        let Some(resume_at) = flow.resume_at else {
            return; // probe already granted
        };
        if Instant::now() < resume_at {
            return; // stale timer from an earlier, shorter window
        }
        let conns = self.conn_snapshot();
        if conns.is_empty() {
            // nothing to probe; try again shortly
            flow.resume_at = Some(Instant::now() + self.config.backoff_multiplier);
            let signal = self.backoff_signal.clone();
            let d = self.config.backoff_multiplier;
            std::thread::spawn(move || {
                std::thread::sleep(d);
                let _ = signal.try_send(());
            });
            return;
        }
        flow.resume_at = None;
        let probe = &conns[rand::thread_rng().gen_range(0..conns.len())];
        log::info!(
            "consumer[{}/{}] backoff probe: RDY 1 -> {}",
            self.topic,
            self.channel,
            probe.addr()
        );
        self.update_rdy_locked(&mut flow, probe, 1);
    }

    /// Periodic pass: reclaim credit from idle connections and hand it to
    /// starved ones. Only meaningful when the budget is smaller than the
    /// connection count; never runs during backoff (credit belongs at 0).
    fn redistribute_rdy(&self) {
        let mut flow = self.flow.lock().unwrap();
        if flow.in_backoff() {
            return;
        }
        let conns = self.conn_snapshot();
        let mif = self.max_in_flight();
        if conns.is_empty() || (conns.len() as i64) <= mif {
            return;
        }

        let mut reclaimed: HashSet<String> = HashSet::new();
        for conn in &conns {
            if conn.last_rdy() > 0
                && conn.messages_in_flight() == 0
                && conn.idle_for() > self.config.low_rdy_idle_timeout
            {
                log::debug!(
                    "consumer[{}/{}] reclaiming idle RDY from {}",
                    self.topic,
                    self.channel,
                    conn.addr()
                );
                reclaimed.insert(conn.addr().to_string());
                self.update_rdy_locked(&mut flow, conn, 0);
            }
        }

        // connections just reclaimed sit this cycle out, so a lone credit
        // provably moves to a starved connection
        let mut candidates: Vec<&Arc<Conn>> = conns
            .iter()
            .filter(|c| c.last_rdy() == 0 && !reclaimed.contains(c.addr()))
            .collect();
        let mut rng = rand::thread_rng();
        while flow.total_rdy < mif && !candidates.is_empty() {
            let conn = candidates.swap_remove(rng.gen_range(0..candidates.len()));
            log::debug!(
                "consumer[{}/{}] redistributing RDY 1 -> {}",
                self.topic,
                self.channel,
                conn.addr()
            );
            self.update_rdy_locked(&mut flow, conn, 1);
        }
    }

    /// Attempt-scaled requeue delay, clamped to the configured maximum.
    fn requeue_delay(&self, msg: &Message) -> Duration {
        self.config
            .default_requeue_delay
            .saturating_mul(u32::from(msg.attempts))
            .min(self.config.max_requeue_delay)
    }
}

enum LoopEvent {
    Tick,
    Resume,
    Exit,
}

/// The consumer's timer worker: periodic RDY redistribution plus backoff
/// resume probes, multiplexed over one deferred select.
fn rdy_loop(inner: Arc<ConsumerInner>) {
    let (tick_chan, ticker) = chan::tick(inner.config.rdy_redistribute_interval);
    let backoff_signal = inner.backoff_signal.clone();
    let exit_chan = inner.exit_chan.clone();

    let slot: Rc<RefCell<Option<LoopEvent>>> = Rc::new(RefCell::new(None));
    let (s1, s2, s3) = (slot.clone(), slot.clone(), slot.clone());
    let mut sel = Select::new()
        .recv(&tick_chan, move |_| {
            *s1.borrow_mut() = Some(LoopEvent::Tick);
        })
        .recv(&backoff_signal, move |_| {
            *s2.borrow_mut() = Some(LoopEvent::Resume);
        })
        .recv(&exit_chan, move |_| {
            *s3.borrow_mut() = Some(LoopEvent::Exit);
        });

    loop {
        sel.execute();
        match slot.borrow_mut().take() {
            Some(LoopEvent::Tick) => inner.redistribute_rdy(),
            Some(LoopEvent::Resume) => inner.resume_from_backoff(),
            Some(LoopEvent::Exit) | None => break,
        }
    }
    ticker.stop();
    log::debug!(
        "consumer[{}/{}] rdy loop exited",
        inner.topic,
        inner.channel
    );
}

/// One worker of the handler pool.
fn handler_loop(inner: Arc<ConsumerInner>, handler: Arc<dyn Handler>) {
    while let Some(msg) = inner.incoming.recv() {
        let max_attempts = inner.config.max_attempts;
        if max_attempts > 0 && msg.attempts > max_attempts {
            log::warn!(
                "message {} exceeded {max_attempts} attempts, finishing",
                msg.id_str()
            );
            handler.log_failed_message(&msg);
            msg.finish();
            continue;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle_message(&msg)));
        let failed = match outcome {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                log::error!("handler error on message {}: {e}", msg.id_str());
                true
            }
            Err(_) => {
                log::error!("handler panicked on message {}", msg.id_str());
                true
            }
        };
        if msg.is_auto_response_disabled() {
            continue;
        }
        if failed {
            msg.requeue(None);
        } else {
            msg.finish();
        }
    }
}

/// Routes one connection's frames into the consumer.
struct ConsumerConnDelegate {
    inner: Arc<ConsumerInner>,
}

impl ConnDelegate for ConsumerConnDelegate {
    fn on_response(&self, conn: &Arc<Conn>, data: Vec<u8>) {
        if data != b"OK" {
            log::debug!("[{}] response: {}", conn.addr(), String::from_utf8_lossy(&data));
        }
    }

    fn on_error(&self, conn: &Arc<Conn>, data: Vec<u8>) {
        let text = String::from_utf8_lossy(&data);
        // per-message failures are non-fatal; anything else poisons the conn
        let benign = text.starts_with("E_FIN_FAILED")
            || text.starts_with("E_REQ_FAILED")
            || text.starts_with("E_TOUCH_FAILED");
        if !benign {
            log::error!("[{}] fatal protocol error: {text}", conn.addr());
            conn.close();
        }
    }

    fn on_message_frame(&self, conn: &Arc<Conn>, body: Vec<u8>) {
        let inner = &self.inner;
        let responder = Arc::new(MessageResponder {
            inner: Arc::clone(inner),
            conn: Arc::clone(conn),
        });
        match Message::decode(&body, conn.addr().to_string(), responder) {
            Ok(msg) => {
                inner.messages_received.fetch_add(1, Ordering::SeqCst);
                inner.maybe_update_rdy(conn);
                if inner.incoming.send(msg).is_err() {
                    // shutting down; the server redelivers after msg_timeout
                    log::debug!("[{}] dropping message during shutdown", conn.addr());
                }
            }
            Err(e) => {
                log::error!("[{}] malformed message frame: {e}", conn.addr());
                conn.close();
            }
        }
    }

    fn on_io_error(&self, conn: &Arc<Conn>, err: Error) {
        log::error!("[{}] io error: {err}", conn.addr());
    }

    fn on_close(&self, conn: &Arc<Conn>) {
        let inner = &self.inner;
        let mut flow = inner.flow.lock().unwrap();
        let removed = inner.conns.lock().unwrap().remove(conn.addr()).is_some();
        if removed {
            flow.total_rdy -= conn.last_rdy();
            log::warn!(
                "consumer[{}/{}] disconnected from {}",
                inner.topic,
                inner.channel,
                conn.addr()
            );
        }
    }
}

/// Per-message responder installed by the connection delegate. Backoff
/// bookkeeping (and any RDY commands it emits) runs before the FIN/REQ is
/// written, which keeps the per-connection command order deterministic.
struct MessageResponder {
    inner: Arc<ConsumerInner>,
    conn: Arc<Conn>,
}

impl MessageDelegate for MessageResponder {
    fn on_finish(&self, msg: &Message) {
        self.inner.messages_finished.fetch_add(1, Ordering::SeqCst);
        self.inner.on_message_success();
        self.conn.message_done();
        if let Err(e) = self.conn.write_command(&Command::finish(&msg.id)) {
            if !self.conn.is_closed() {
                log::error!("FIN write to {} failed: {e}", self.conn.addr());
                self.conn.close();
            }
        }
    }

    fn on_requeue(&self, msg: &Message, delay: Option<Duration>, backoff: bool) {
        self.inner.messages_requeued.fetch_add(1, Ordering::SeqCst);
        if backoff {
            self.inner.on_message_failure();
        }
        let delay = delay.unwrap_or_else(|| self.inner.requeue_delay(msg));
        self.conn.message_done();
        let cmd = Command::requeue(&msg.id, delay.as_millis() as u64);
        if let Err(e) = self.conn.write_command(&cmd) {
            if !self.conn.is_closed() {
                log::error!("REQ write to {} failed: {e}", self.conn.addr());
                self.conn.close();
            }
        }
    }

    fn on_touch(&self, msg: &Message) {
        if let Err(e) = self.conn.write_command(&Command::touch(&msg.id)) {
            log::error!("TOUCH write to {} failed: {e}", self.conn.addr());
        }
    }
}
