//! NSQ V2 wire protocol: framing and command encoding.
//!
//! Every frame on the wire is `[u32 length][u32 type][body]`, big-endian,
//! where `length` covers the type word plus the body. Commands flow in the
//! other direction as newline-terminated ASCII lines, optionally followed
//! by a 4-byte length-prefixed binary body (IDENTIFY, AUTH, PUB, MPUB).

use std::io::{Read, Write};

use crate::message::MSG_ID_LENGTH;
use crate::{Error, Result};

/// Protocol magic sent immediately after connect, before any command.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

pub const FRAME_TYPE_RESPONSE: u32 = 0;
pub const FRAME_TYPE_ERROR: u32 = 1;
pub const FRAME_TYPE_MESSAGE: u32 = 2;

/// Body of the periodic server liveness response.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

const MAX_NAME_LENGTH: usize = 64;
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// Reads one frame, returning `(frame_type, body)`.
///
/// # Errors
///
/// `Error::Io` on a short read or socket failure; `Error::BadFrame` when
/// the length word cannot cover the type word.
pub fn read_frame(r: &mut impl Read) -> Result<(u32, Vec<u8>)> {
    let mut word = [0u8; 4];
    r.read_exact(&mut word)?;
    let size = u32::from_be_bytes(word) as usize;
    if size < 4 {
        return Err(Error::BadFrame("frame length shorter than type word"));
    }
    r.read_exact(&mut word)?;
    let frame_type = u32::from_be_bytes(word);
    let mut body = vec![0u8; size - 4];
    r.read_exact(&mut body)?;
    Ok((frame_type, body))
}

/// One protocol command: an ASCII line plus an optional binary body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: &'static str,
    params: Vec<Vec<u8>>,
    body: Option<Vec<u8>>,
}

impl Command {
    pub fn identify(body: Vec<u8>) -> Command {
        Command {
            name: "IDENTIFY",
            params: Vec::new(),
            body: Some(body),
        }
    }

    pub fn auth(secret: &str) -> Command {
        Command {
            name: "AUTH",
            params: Vec::new(),
            body: Some(secret.as_bytes().to_vec()),
        }
    }

    pub fn subscribe(topic: &str, channel: &str) -> Command {
        Command {
            name: "SUB",
            params: vec![topic.into(), channel.into()],
            body: None,
        }
    }

    pub fn ready(count: i64) -> Command {
        Command {
            name: "RDY",
            params: vec![count.to_string().into_bytes()],
            body: None,
        }
    }

    pub fn finish(id: &[u8; MSG_ID_LENGTH]) -> Command {
        Command {
            name: "FIN",
            params: vec![id.to_vec()],
            body: None,
        }
    }

    pub fn requeue(id: &[u8; MSG_ID_LENGTH], delay_ms: u64) -> Command {
        Command {
            name: "REQ",
            params: vec![id.to_vec(), delay_ms.to_string().into_bytes()],
            body: None,
        }
    }

    pub fn touch(id: &[u8; MSG_ID_LENGTH]) -> Command {
        Command {
            name: "TOUCH",
            params: vec![id.to_vec()],
            body: None,
        }
    }

    pub fn publish(topic: &str, body: Vec<u8>) -> Command {
        Command {
            name: "PUB",
            params: vec![topic.into()],
            body: Some(body),
        }
    }

    /// MPUB body layout: `[u32 count]([u32 len][body])*`, wrapped by the
    /// outer length prefix like any other binary body.
    pub fn multi_publish(topic: &str, bodies: &[Vec<u8>]) -> Command {
        let inner: usize = bodies.iter().map(|b| 4 + b.len()).sum();
        let mut body = Vec::with_capacity(4 + inner);
        body.extend_from_slice(&(bodies.len() as u32).to_be_bytes());
        for b in bodies {
            body.extend_from_slice(&(b.len() as u32).to_be_bytes());
            body.extend_from_slice(b);
        }
        Command {
            name: "MPUB",
            params: vec![topic.into()],
            body: Some(body),
        }
    }

    pub fn nop() -> Command {
        Command {
            name: "NOP",
            params: Vec::new(),
            body: None,
        }
    }

    /// CLS: asks the server to stop sending messages and close cleanly.
    pub fn start_close() -> Command {
        Command {
            name: "CLS",
            params: Vec::new(),
            body: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Encodes the command onto `w`. The caller flushes.
    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(self.name.as_bytes())?;
        for p in &self.params {
            w.write_all(b" ")?;
            w.write_all(p)?;
        }
        w.write_all(b"\n")?;
        if let Some(body) = &self.body {
            w.write_all(&(body.len() as u32).to_be_bytes())?;
            w.write_all(body)?;
        }
        Ok(())
    }
}

fn valid_name(s: &str) -> bool {
    let base = s.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(s);
    !base.is_empty()
        && base.len() <= MAX_NAME_LENGTH
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

/// Validates a topic name: 1-64 chars of `[.a-zA-Z0-9_-]`, optionally
/// suffixed with `#ephemeral`.
pub fn check_topic_name(s: &str) -> Result<()> {
    if valid_name(s) {
        Ok(())
    } else {
        Err(Error::InvalidName(format!("topic {s:?}")))
    }
}

/// Validates a channel name under the same rules as topics.
pub fn check_channel_name(s: &str) -> Result<()> {
    if valid_name(s) {
        Ok(())
    } else {
        Err(Error::InvalidName(format!("channel {s:?}")))
    }
}
