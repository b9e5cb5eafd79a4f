//! Scripted in-process nsqd for integration tests.
//!
//! Speaks just enough of the V2 protocol to exercise the client: it
//! answers the IDENTIFY/SUB handshake, tracks RDY credit, and delivers
//! queued messages strictly one at a time, each gated on the FIN/REQ for
//! the previous one. REQ drops the message instead of redelivering, so a
//! test's command transcript is a pure function of its script. Every
//! inbound command is recorded in normalized form for assertions.

// each test binary uses a different subset of this module
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};

/// Call at the top of each test; repeat calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const FRAME_TYPE_RESPONSE: u32 = 0;
const FRAME_TYPE_ERROR: u32 = 1;
const FRAME_TYPE_MESSAGE: u32 = 2;

/// Scripted reply to a PUB/MPUB command.
pub enum PubReply {
    Ok,
    Error(&'static str),
}

struct Shared {
    commands: Mutex<Vec<String>>,
    queue: Mutex<VecDeque<Vec<u8>>>,
    pub_replies: Mutex<VecDeque<PubReply>>,
    next_id: Mutex<u64>,
    heartbeat_after_sub: Mutex<bool>,
}

pub struct ScriptedNsqd {
    addr: String,
    shared: Arc<Shared>,
}

impl ScriptedNsqd {
    /// Starts a server on an ephemeral port with `messages` queued for
    /// delivery to the first subscriber.
    pub fn start(messages: Vec<Vec<u8>>) -> ScriptedNsqd {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind scripted nsqd");
        let addr = listener.local_addr().expect("local addr").to_string();
        let shared = Arc::new(Shared {
            commands: Mutex::new(Vec::new()),
            queue: Mutex::new(messages.into_iter().collect()),
            pub_replies: Mutex::new(VecDeque::new()),
            next_id: Mutex::new(0),
            heartbeat_after_sub: Mutex::new(false),
        });
        {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                // connections are served one at a time; tests never need
                // concurrent clients on the same daemon
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            let _ = serve(stream, &shared);
                        }
                        Err(_) => break,
                    }
                }
            });
        }
        ScriptedNsqd { addr, shared }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends a `_heartbeat_` frame right after acknowledging the next SUB.
    pub fn heartbeat_after_sub(&self) {
        *self.shared.heartbeat_after_sub.lock().unwrap() = true;
    }

    /// Queues a reply for the next unscripted PUB/MPUB (default is OK).
    pub fn script_pub_reply(&self, reply: PubReply) {
        self.shared.pub_replies.lock().unwrap().push_back(reply);
    }

    /// The normalized commands received so far.
    pub fn commands(&self) -> Vec<String> {
        self.shared.commands.lock().unwrap().clone()
    }
}

fn serve(stream: TcpStream, shared: &Shared) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != b"  V2" {
        return Ok(());
    }

    let mut rdy: i64 = 0;
    let mut in_flight = false;

    loop {
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        let line = String::from_utf8_lossy(&line).into_owned();
        let mut parts = line.split(' ');
        let name = parts.next().unwrap_or("");

        match name {
            "IDENTIFY" => {
                read_body(&mut reader)?;
                record(shared, "IDENTIFY");
                send_frame(&mut writer, FRAME_TYPE_RESPONSE, b"OK")?;
            }
            "SUB" => {
                record(shared, "SUB");
                send_frame(&mut writer, FRAME_TYPE_RESPONSE, b"OK")?;
                if std::mem::take(&mut *shared.heartbeat_after_sub.lock().unwrap()) {
                    send_frame(&mut writer, FRAME_TYPE_RESPONSE, b"_heartbeat_")?;
                }
            }
            "RDY" => {
                rdy = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                record(shared, &format!("RDY {rdy}"));
            }
            "FIN" => {
                record(shared, "FIN");
                in_flight = false;
            }
            "REQ" => {
                record(shared, "REQ");
                in_flight = false;
            }
            "TOUCH" => record(shared, "TOUCH"),
            "NOP" => record(shared, "NOP"),
            "CLS" => {
                record(shared, "CLS");
                // the client may already have shut the socket down
                let _ = send_frame(&mut writer, FRAME_TYPE_RESPONSE, b"CLOSE_WAIT");
                return Ok(());
            }
            "PUB" => {
                let topic = parts.next().unwrap_or("").to_string();
                let body = read_body(&mut reader)?;
                record(
                    shared,
                    &format!("PUB {topic} {}", String::from_utf8_lossy(&body)),
                );
                reply_pub(&mut writer, shared)?;
            }
            "MPUB" => {
                let topic = parts.next().unwrap_or("").to_string();
                let body = read_body(&mut reader)?;
                let count = if body.len() >= 4 {
                    u32::from_be_bytes([body[0], body[1], body[2], body[3]])
                } else {
                    0
                };
                record(shared, &format!("MPUB {topic} {count}"));
                reply_pub(&mut writer, shared)?;
            }
            "AUTH" => {
                read_body(&mut reader)?;
                record(shared, "AUTH");
                send_frame(&mut writer, FRAME_TYPE_RESPONSE, br#"{"identity":"test"}"#)?;
            }
            other => record(shared, other),
        }

        // one message at a time, gated on the response to the previous
        while rdy > 0 && !in_flight {
            let Some(body) = shared.queue.lock().unwrap().pop_front() else {
                break;
            };
            deliver(&mut writer, shared, &body)?;
            rdy -= 1;
            in_flight = true;
        }
    }
}

fn record(shared: &Shared, cmd: &str) {
    shared.commands.lock().unwrap().push(cmd.to_string());
}

fn read_body(reader: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
    reader.read_exact(&mut body)?;
    Ok(body)
}

fn send_frame(writer: &mut TcpStream, frame_type: u32, data: &[u8]) -> io::Result<()> {
    writer.write_all(&((data.len() + 4) as u32).to_be_bytes())?;
    writer.write_all(&frame_type.to_be_bytes())?;
    writer.write_all(data)
}

fn deliver(writer: &mut TcpStream, shared: &Shared, body: &[u8]) -> io::Result<()> {
    let id = {
        let mut next = shared.next_id.lock().unwrap();
        *next += 1;
        *next
    };
    let mut frame = Vec::with_capacity(8 + 2 + 16 + body.len());
    frame.extend_from_slice(&0i64.to_be_bytes());
    frame.extend_from_slice(&1u16.to_be_bytes());
    frame.extend_from_slice(format!("{id:016}").as_bytes());
    frame.extend_from_slice(body);
    send_frame(writer, FRAME_TYPE_MESSAGE, &frame)
}

fn reply_pub(writer: &mut TcpStream, shared: &Shared) -> io::Result<()> {
    let reply = shared
        .pub_replies
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(PubReply::Ok);
    match reply {
        PubReply::Ok => send_frame(writer, FRAME_TYPE_RESPONSE, b"OK"),
        PubReply::Error(text) => send_frame(writer, FRAME_TYPE_ERROR, text.as_bytes()),
    }
}
