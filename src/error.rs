use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dial timeout connecting to {0}")]
    DialTimeout(String),
    #[error("operation timed out")]
    Timeout,
    #[error("channel closed")]
    ChannelClosed,
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("bad frame: {0}")]
    BadFrame(&'static str),
    #[error("bad response: {0}")]
    BadResponse(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("{0} stopped")]
    Stopped(&'static str),
    #[error("not connected")]
    NotConnected,
    #[error("already connected to {0}")]
    AlreadyConnected(String),
    #[error("auth required but no auth secret configured")]
    AuthRequired,
}

pub type Result<T> = std::result::Result<T, Error>;
