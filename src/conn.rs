//! One physical TCP link to an nsqd.
//!
//! A [`Conn`] owns the socket, frames outbound commands through a locked
//! buffered writer, and runs one read-loop worker thread that decodes
//! inbound frames and hands them to a [`ConnDelegate`]. Heartbeats are
//! answered inline. The connection does not reconnect itself: any IO or
//! fatal protocol failure tears it down and the owner decides what to do.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::protocol::{
    self, Command, FRAME_TYPE_ERROR, FRAME_TYPE_MESSAGE, FRAME_TYPE_RESPONSE, HEARTBEAT, MAGIC_V2,
};
use crate::{Error, Result};

/// Server RDY ceiling assumed until IDENTIFY negotiates the real one.
const DEFAULT_MAX_RDY_COUNT: i64 = 2500;

/// Receives decoded frames and lifecycle events from a connection's read
/// loop. Implemented by the producer and consumer internals.
pub(crate) trait ConnDelegate: Send + Sync {
    fn on_response(&self, conn: &Arc<Conn>, data: Vec<u8>);
    fn on_error(&self, conn: &Arc<Conn>, data: Vec<u8>);
    /// Raw message frame body; the delegate decodes it so it can install
    /// its own message responder.
    fn on_message_frame(&self, conn: &Arc<Conn>, body: Vec<u8>);
    fn on_io_error(&self, conn: &Arc<Conn>, err: Error);
    /// Fired exactly once, after the read loop has exited.
    fn on_close(&self, conn: &Arc<Conn>);
}

#[derive(Serialize)]
struct IdentifyBody<'a> {
    client_id: &'a str,
    hostname: &'a str,
    user_agent: &'a str,
    feature_negotiation: bool,
    heartbeat_interval: i64,
    output_buffer_size: i64,
    output_buffer_timeout: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg_timeout: Option<i64>,
    sample_rate: i32,
    deflate: bool,
    deflate_level: i32,
}

#[derive(Deserialize, Debug, Default)]
struct IdentifyResponse {
    #[serde(default)]
    max_rdy_count: i64,
    #[serde(default)]
    auth_required: bool,
    #[serde(default)]
    version: String,
}

#[derive(Deserialize, Debug, Default)]
struct AuthResponse {
    #[serde(default)]
    identity: String,
    #[serde(default)]
    permission_count: i64,
}

pub(crate) struct Conn {
    addr: String,
    stream: TcpStream,
    writer: Mutex<BufWriter<TcpStream>>,
    delegate: Arc<dyn ConnDelegate>,

    // flow-control bookkeeping, owned by the consumer but stored here so
    // the read loop can update it as messages arrive
    rdy_count: AtomicI64,
    last_rdy: AtomicI64,
    messages_in_flight: AtomicI64,
    last_msg_at: Mutex<Instant>,
    max_rdy_count: AtomicI64,

    closed: AtomicBool,
}

impl Conn {
    /// Dials `addr`, performs the magic + IDENTIFY (+ AUTH) handshake, and
    /// spawns the read-loop worker. Returns the connection and the
    /// worker's join handle; the owner keeps the handle for shutdown.
    pub(crate) fn connect(
        addr: &str,
        config: &Config,
        delegate: Arc<dyn ConnDelegate>,
    ) -> Result<(Arc<Conn>, JoinHandle<()>)> {
        let sock_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::DialTimeout(addr.to_string()))?;
        let stream = TcpStream::connect_timeout(&sock_addr, config.dial_timeout)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut => Error::DialTimeout(addr.to_string()),
                _ => Error::Io(e),
            })?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.read_timeout))?;
        stream.set_write_timeout(Some(config.write_timeout))?;

        let mut writer = BufWriter::new(stream.try_clone()?);
        let mut reader = BufReader::new(stream.try_clone()?);

        writer.write_all(MAGIC_V2)?;
        writer.flush()?;

        let identify = identify_handshake(addr, config, &mut reader, &mut writer)?;
        log::debug!(
            "[{addr}] identified: server v{} max_rdy_count={}",
            identify.version,
            identify.max_rdy_count
        );
        if identify.auth_required {
            auth_handshake(addr, config, &mut reader, &mut writer)?;
        }

        let conn = Arc::new(Conn {
            addr: addr.to_string(),
            stream,
            writer: Mutex::new(writer),
            delegate,
            rdy_count: AtomicI64::new(0),
            last_rdy: AtomicI64::new(0),
            messages_in_flight: AtomicI64::new(0),
            last_msg_at: Mutex::new(Instant::now()),
            max_rdy_count: AtomicI64::new(if identify.max_rdy_count > 0 {
                identify.max_rdy_count
            } else {
                DEFAULT_MAX_RDY_COUNT
            }),
            closed: AtomicBool::new(false),
        });

        let worker = {
            let conn = Arc::clone(&conn);
            std::thread::Builder::new()
                .name(format!("nsq-conn-{addr}"))
                .spawn(move || read_loop(conn, reader))
                .map_err(Error::Io)?
        };
        Ok((conn, worker))
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    /// Encodes and flushes one command.
    ///
    /// # Errors
    ///
    /// `Error::NotConnected` once the connection is closed; `Error::Io` on
    /// socket failure (the caller is expected to close the conn).
    pub(crate) fn write_command(&self, cmd: &Command) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        let mut w = self.writer.lock().unwrap();
        cmd.write_to(&mut *w)?;
        w.flush()?;
        Ok(())
    }

    /// Shuts the socket down; the read loop exits and fires `on_close`.
    /// Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn rdy(&self) -> i64 {
        self.rdy_count.load(Ordering::SeqCst)
    }

    pub(crate) fn last_rdy(&self) -> i64 {
        self.last_rdy.load(Ordering::SeqCst)
    }

    pub(crate) fn max_rdy_count(&self) -> i64 {
        self.max_rdy_count.load(Ordering::SeqCst)
    }

    /// Records a granted RDY count (what the server was told).
    pub(crate) fn set_rdy(&self, count: i64) {
        self.rdy_count.store(count, Ordering::SeqCst);
        self.last_rdy.store(count, Ordering::SeqCst);
    }

    /// Read-loop bookkeeping when a message frame arrives: consumes one
    /// RDY credit and marks the connection busy.
    pub(crate) fn message_received(&self) {
        self.rdy_count.fetch_sub(1, Ordering::SeqCst);
        self.messages_in_flight.fetch_add(1, Ordering::SeqCst);
        *self.last_msg_at.lock().unwrap() = Instant::now();
    }

    /// Bookkeeping when a message reaches its terminal action.
    pub(crate) fn message_done(&self) {
        self.messages_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn messages_in_flight(&self) -> i64 {
        self.messages_in_flight.load(Ordering::SeqCst)
    }

    /// Time since the last message arrived (or since connect).
    pub(crate) fn idle_for(&self) -> Duration {
        self.last_msg_at.lock().unwrap().elapsed()
    }
}

fn identify_handshake(
    addr: &str,
    config: &Config,
    reader: &mut impl Read,
    writer: &mut impl Write,
) -> Result<IdentifyResponse> {
    let body = IdentifyBody {
        client_id: &config.client_id,
        hostname: &config.hostname,
        user_agent: &config.user_agent,
        feature_negotiation: true,
        heartbeat_interval: config.heartbeat_interval.as_millis() as i64,
        output_buffer_size: config.output_buffer_size,
        output_buffer_timeout: config.output_buffer_timeout.as_millis() as i64,
        msg_timeout: if config.msg_timeout.is_zero() {
            None
        } else {
            Some(config.msg_timeout.as_millis() as i64)
        },
        sample_rate: config.sample_rate,
        deflate: config.deflate,
        deflate_level: config.deflate_level,
    };
    let body = serde_json::to_vec(&body)
        .map_err(|e| Error::Config(format!("identify body: {e}")))?;
    Command::identify(body).write_to(writer)?;
    writer.flush()?;

    let (frame_type, data) = protocol::read_frame(reader)?;
    match frame_type {
        FRAME_TYPE_RESPONSE => {
            if data == b"OK" {
                return Ok(IdentifyResponse::default());
            }
            serde_json::from_slice(&data).map_err(|_| {
                Error::BadResponse(format!(
                    "[{addr}] unparsable identify response: {}",
                    String::from_utf8_lossy(&data)
                ))
            })
        }
        FRAME_TYPE_ERROR => Err(Error::ProtocolError(
            String::from_utf8_lossy(&data).into_owned(),
        )),
        other => Err(Error::BadResponse(format!(
            "[{addr}] unexpected frame type {other} during identify"
        ))),
    }
}

fn auth_handshake(
    addr: &str,
    config: &Config,
    reader: &mut impl Read,
    writer: &mut impl Write,
) -> Result<()> {
    if config.auth_secret.is_empty() {
        return Err(Error::AuthRequired);
    }
    Command::auth(&config.auth_secret).write_to(writer)?;
    writer.flush()?;
    let (frame_type, data) = protocol::read_frame(reader)?;
    match frame_type {
        FRAME_TYPE_RESPONSE => {
            let resp: AuthResponse = serde_json::from_slice(&data).unwrap_or_default();
            log::info!(
                "[{addr}] authenticated as {:?} ({} permissions)",
                resp.identity,
                resp.permission_count
            );
            Ok(())
        }
        FRAME_TYPE_ERROR => Err(Error::ProtocolError(
            String::from_utf8_lossy(&data).into_owned(),
        )),
        other => Err(Error::BadResponse(format!(
            "[{addr}] unexpected frame type {other} during auth"
        ))),
    }
}

fn read_loop(conn: Arc<Conn>, mut reader: BufReader<TcpStream>) {
    loop {
        match protocol::read_frame(&mut reader) {
            Ok((FRAME_TYPE_RESPONSE, data)) => {
                if data == HEARTBEAT {
                    log::debug!("[{}] heartbeat", conn.addr);
                    if let Err(e) = conn.write_command(&Command::nop()) {
                        if !conn.is_closed() {
                            log::error!("[{}] heartbeat NOP failed: {e}", conn.addr);
                            conn.delegate.on_io_error(&conn, e);
                            conn.close();
                        }
                        break;
                    }
                } else {
                    conn.delegate.on_response(&conn, data);
                }
            }
            Ok((FRAME_TYPE_ERROR, data)) => {
                log::warn!(
                    "[{}] server error: {}",
                    conn.addr,
                    String::from_utf8_lossy(&data)
                );
                conn.delegate.on_error(&conn, data);
            }
            Ok((FRAME_TYPE_MESSAGE, body)) => {
                conn.message_received();
                conn.delegate.on_message_frame(&conn, body);
            }
            Ok((other, _)) => {
                log::error!("[{}] unknown frame type {other}", conn.addr);
                conn.delegate
                    .on_io_error(&conn, Error::BadFrame("unknown frame type"));
                conn.close();
                break;
            }
            Err(e) => {
                // a close() from our side surfaces here as an IO error
                if !conn.is_closed() {
                    log::error!("[{}] read error: {e}", conn.addr);
                    conn.delegate.on_io_error(&conn, e);
                    conn.close();
                }
                break;
            }
        }
    }
    conn.delegate.on_close(&conn);
    log::debug!("[{}] read loop exited", conn.addr);
}
