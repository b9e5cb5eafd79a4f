//! Client configuration.
//!
//! [`Config`] is a plain struct with public fields and sensible defaults;
//! construct one, adjust fields (directly or through [`Config::set`] with
//! the stable option names), and call [`Config::validate`] before handing
//! it to a producer or consumer. `set` coerces strings, integers and
//! durations to the declared type of the option and rejects out-of-range
//! values by name; a default config always validates.
//!
//! The name → setter mapping is an explicit schema table (`defs`), not
//! runtime type inspection.

use std::time::Duration;

use crate::duration;
use crate::{Error, Result};

/// A dynamically-typed option value accepted by [`Config::set`].
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Duration(Duration),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}
impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}
impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
impl From<Duration> for Value {
    fn from(v: Duration) -> Self {
        Value::Duration(v)
    }
}

/// Validated option bag for connections, producers and consumers.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP connect timeout.
    pub dial_timeout: Duration,
    /// Socket read deadline; must exceed `heartbeat_interval`.
    pub read_timeout: Duration,
    pub write_timeout: Duration,

    /// How often a lookup directory is polled for topic producers.
    pub lookupd_poll_interval: Duration,
    /// Fractional jitter [0,1] applied to the first lookup poll.
    pub lookupd_poll_jitter: f64,

    pub max_requeue_delay: Duration,
    pub default_requeue_delay: Duration,

    /// Unit duration of the exponential backoff curve
    /// (`multiplier * 2^(n-1)`).
    pub backoff_multiplier: Duration,
    pub max_backoff_duration: Duration,

    /// Deliveries after which a message is failed instead of requeued.
    /// 0 disables the limit.
    pub max_attempts: u16,

    /// A connection idle longer than this has its RDY credit reclaimed by
    /// the redistribution pass.
    pub low_rdy_idle_timeout: Duration,
    /// Period of the RDY redistribution pass.
    pub rdy_redistribute_interval: Duration,

    /// Total in-flight budget shared by all of a consumer's connections.
    pub max_in_flight: usize,

    /// Identification, sent in IDENTIFY.
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,

    /// Server → client heartbeat period, negotiated via IDENTIFY.
    pub heartbeat_interval: Duration,
    /// Deliver only this percentage of messages (0 = all, max 99).
    pub sample_rate: i32,
    pub deflate: bool,
    /// Deflate compression level, 1-9.
    pub deflate_level: i32,
    /// Server-side output buffering toward this client.
    pub output_buffer_size: i64,
    pub output_buffer_timeout: Duration,
    /// Server-side per-message processing timeout; zero keeps the server
    /// default.
    pub msg_timeout: Duration,

    /// Secret sent via AUTH when the server requires it.
    pub auth_secret: String,
}

fn default_hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(s) = std::str::from_utf8(&buf[..end]) {
            return s.to_string();
        }
    }
    "localhost".to_string()
}

impl Default for Config {
    fn default() -> Self {
        let hostname = default_hostname();
        let client_id = hostname
            .split('.')
            .next()
            .unwrap_or(&hostname)
            .to_string();
        Config {
            dial_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(1),
            lookupd_poll_interval: Duration::from_secs(60),
            lookupd_poll_jitter: 0.3,
            max_requeue_delay: Duration::from_secs(15 * 60),
            default_requeue_delay: Duration::from_secs(90),
            backoff_multiplier: Duration::from_secs(1),
            max_backoff_duration: Duration::from_secs(120),
            max_attempts: 5,
            low_rdy_idle_timeout: Duration::from_secs(10),
            rdy_redistribute_interval: Duration::from_secs(5),
            max_in_flight: 1,
            client_id,
            hostname,
            user_agent: concat!("nsq-rust/", env!("CARGO_PKG_VERSION")).to_string(),
            heartbeat_interval: Duration::from_secs(30),
            sample_rate: 0,
            deflate: false,
            deflate_level: 6,
            output_buffer_size: 16 * 1024,
            output_buffer_timeout: Duration::from_millis(250),
            msg_timeout: Duration::ZERO,
            auth_secret: String::new(),
        }
    }
}

struct OptionDef {
    name: &'static str,
    set: fn(&mut Config, &Value) -> Result<()>,
}

fn as_duration(name: &str, v: &Value) -> Result<Duration> {
    match v {
        Value::Duration(d) => Ok(*d),
        Value::Str(s) => duration::parse(s),
        // integers carry nanoseconds, matching the wire representation
        Value::Int(n) if *n >= 0 => Ok(Duration::from_nanos(*n as u64)),
        _ => Err(Error::Config(format!("{name}: expected a duration"))),
    }
}

fn as_int(name: &str, v: &Value) -> Result<i64> {
    match v {
        Value::Int(n) => Ok(*n),
        Value::Str(s) => s
            .parse()
            .map_err(|_| Error::Config(format!("{name}: expected an integer"))),
        _ => Err(Error::Config(format!("{name}: expected an integer"))),
    }
}

fn as_float(name: &str, v: &Value) -> Result<f64> {
    match v {
        Value::Float(f) => Ok(*f),
        Value::Int(n) => Ok(*n as f64),
        Value::Str(s) => s
            .parse()
            .map_err(|_| Error::Config(format!("{name}: expected a number"))),
        _ => Err(Error::Config(format!("{name}: expected a number"))),
    }
}

fn as_bool(name: &str, v: &Value) -> Result<bool> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::Str(s) => match s.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(Error::Config(format!("{name}: expected a bool"))),
        },
        Value::Int(0) => Ok(false),
        Value::Int(1) => Ok(true),
        _ => Err(Error::Config(format!("{name}: expected a bool"))),
    }
}

fn as_string(name: &str, v: &Value) -> Result<String> {
    match v {
        Value::Str(s) => Ok(s.clone()),
        _ => Err(Error::Config(format!("{name}: expected a string"))),
    }
}

fn int_in_range(name: &str, v: &Value, min: i64, max: i64) -> Result<i64> {
    let n = as_int(name, v)?;
    if n < min || n > max {
        return Err(Error::Config(format!(
            "{name}: value {n} out of range [{min}, {max}]"
        )));
    }
    Ok(n)
}

fn duration_in_range(name: &str, v: &Value, min: Duration, max: Duration) -> Result<Duration> {
    let d = as_duration(name, v)?;
    if d < min || d > max {
        return Err(Error::Config(format!(
            "{name}: value {} out of range [{}, {}]",
            duration::format(d),
            duration::format(min),
            duration::format(max)
        )));
    }
    Ok(d)
}

const MAX_DURATION: Duration = Duration::from_secs(60 * 60);

fn defs() -> &'static [OptionDef] {
    &[
        OptionDef {
            name: "dial_timeout",
            set: |c, v| {
                c.dial_timeout = duration_in_range(
                    "dial_timeout",
                    v,
                    Duration::from_millis(100),
                    Duration::from_secs(300),
                )?;
                Ok(())
            },
        },
        OptionDef {
            name: "read_timeout",
            set: |c, v| {
                c.read_timeout = duration_in_range(
                    "read_timeout",
                    v,
                    Duration::from_millis(100),
                    Duration::from_secs(300),
                )?;
                Ok(())
            },
        },
        OptionDef {
            name: "write_timeout",
            set: |c, v| {
                c.write_timeout = duration_in_range(
                    "write_timeout",
                    v,
                    Duration::from_millis(100),
                    Duration::from_secs(300),
                )?;
                Ok(())
            },
        },
        OptionDef {
            name: "lookupd_poll_interval",
            set: |c, v| {
                c.lookupd_poll_interval = duration_in_range(
                    "lookupd_poll_interval",
                    v,
                    Duration::from_millis(10),
                    Duration::from_secs(300),
                )?;
                Ok(())
            },
        },
        OptionDef {
            name: "lookupd_poll_jitter",
            set: |c, v| {
                let f = as_float("lookupd_poll_jitter", v)?;
                if !(0.0..=1.0).contains(&f) {
                    return Err(Error::Config(format!(
                        "lookupd_poll_jitter: value {f} out of range [0, 1]"
                    )));
                }
                c.lookupd_poll_jitter = f;
                Ok(())
            },
        },
        OptionDef {
            name: "max_requeue_delay",
            set: |c, v| {
                c.max_requeue_delay =
                    duration_in_range("max_requeue_delay", v, Duration::ZERO, MAX_DURATION)?;
                Ok(())
            },
        },
        OptionDef {
            name: "default_requeue_delay",
            set: |c, v| {
                c.default_requeue_delay =
                    duration_in_range("default_requeue_delay", v, Duration::ZERO, MAX_DURATION)?;
                Ok(())
            },
        },
        OptionDef {
            name: "backoff_multiplier",
            set: |c, v| {
                c.backoff_multiplier = duration_in_range(
                    "backoff_multiplier",
                    v,
                    Duration::from_millis(1),
                    MAX_DURATION,
                )?;
                Ok(())
            },
        },
        OptionDef {
            name: "max_backoff_duration",
            set: |c, v| {
                c.max_backoff_duration =
                    duration_in_range("max_backoff_duration", v, Duration::ZERO, MAX_DURATION)?;
                Ok(())
            },
        },
        OptionDef {
            name: "max_attempts",
            set: |c, v| {
                c.max_attempts = int_in_range("max_attempts", v, 0, 65535)? as u16;
                Ok(())
            },
        },
        OptionDef {
            name: "low_rdy_idle_timeout",
            set: |c, v| {
                c.low_rdy_idle_timeout = duration_in_range(
                    "low_rdy_idle_timeout",
                    v,
                    Duration::from_millis(10),
                    Duration::from_secs(300),
                )?;
                Ok(())
            },
        },
        OptionDef {
            name: "rdy_redistribute_interval",
            set: |c, v| {
                c.rdy_redistribute_interval = duration_in_range(
                    "rdy_redistribute_interval",
                    v,
                    Duration::from_millis(1),
                    Duration::from_secs(300),
                )?;
                Ok(())
            },
        },
        OptionDef {
            name: "max_in_flight",
            set: |c, v| {
                c.max_in_flight = int_in_range("max_in_flight", v, 0, i64::MAX)? as usize;
                Ok(())
            },
        },
        OptionDef {
            name: "client_id",
            set: |c, v| {
                c.client_id = as_string("client_id", v)?;
                Ok(())
            },
        },
        OptionDef {
            name: "hostname",
            set: |c, v| {
                c.hostname = as_string("hostname", v)?;
                Ok(())
            },
        },
        OptionDef {
            name: "user_agent",
            set: |c, v| {
                c.user_agent = as_string("user_agent", v)?;
                Ok(())
            },
        },
        OptionDef {
            name: "heartbeat_interval",
            set: |c, v| {
                c.heartbeat_interval =
                    duration_in_range("heartbeat_interval", v, Duration::ZERO, MAX_DURATION)?;
                Ok(())
            },
        },
        OptionDef {
            name: "sample_rate",
            set: |c, v| {
                c.sample_rate = int_in_range("sample_rate", v, 0, 99)? as i32;
                Ok(())
            },
        },
        OptionDef {
            name: "deflate",
            set: |c, v| {
                c.deflate = as_bool("deflate", v)?;
                Ok(())
            },
        },
        OptionDef {
            name: "deflate_level",
            set: |c, v| {
                c.deflate_level = int_in_range("deflate_level", v, 1, 9)? as i32;
                Ok(())
            },
        },
        OptionDef {
            name: "output_buffer_size",
            set: |c, v| {
                c.output_buffer_size = int_in_range("output_buffer_size", v, 64, 5 * 1024 * 1024)?;
                Ok(())
            },
        },
        OptionDef {
            name: "output_buffer_timeout",
            set: |c, v| {
                c.output_buffer_timeout = duration_in_range(
                    "output_buffer_timeout",
                    v,
                    Duration::ZERO,
                    Duration::from_secs(300),
                )?;
                Ok(())
            },
        },
        OptionDef {
            name: "msg_timeout",
            set: |c, v| {
                c.msg_timeout = duration_in_range("msg_timeout", v, Duration::ZERO, MAX_DURATION)?;
                Ok(())
            },
        },
        OptionDef {
            name: "auth_secret",
            set: |c, v| {
                c.auth_secret = as_string("auth_secret", v)?;
                Ok(())
            },
        },
    ]
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// Sets an option by its canonical name. Hyphens and underscores are
    /// interchangeable in `name`.
    ///
    /// # Errors
    ///
    /// `Error::Config` for an unknown option, a value of the wrong type,
    /// or a value outside the option's bounds; values are never silently clamped.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let key = name.replace('-', "_");
        let def = defs()
            .iter()
            .find(|d| d.name == key)
            .ok_or_else(|| Error::Config(format!("unknown option {name:?}")))?;
        (def.set)(self, &value.into())
    }

    /// Re-checks cross-field invariants. Idempotent; a default config
    /// always passes.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval >= self.read_timeout {
            return Err(Error::Config(format!(
                "heartbeat_interval {} must be less than read_timeout {}",
                duration::format(self.heartbeat_interval),
                duration::format(self.read_timeout)
            )));
        }
        if self.default_requeue_delay > self.max_requeue_delay {
            return Err(Error::Config(
                "default_requeue_delay must not exceed max_requeue_delay".to_string(),
            ));
        }
        if self.backoff_multiplier.is_zero() {
            return Err(Error::Config(
                "backoff_multiplier must be non-zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.lookupd_poll_jitter) {
            return Err(Error::Config(
                "lookupd_poll_jitter must be within [0, 1]".to_string(),
            ));
        }
        if !(1..=9).contains(&self.deflate_level) {
            return Err(Error::Config(
                "deflate_level must be within [1, 9]".to_string(),
            ));
        }
        if !(0..=99).contains(&self.sample_rate) {
            return Err(Error::Config(
                "sample_rate must be within [0, 99]".to_string(),
            ));
        }
        Ok(())
    }
}
