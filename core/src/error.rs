use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModemError {
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("link failure after {0} attempts")]
    LinkFailure(u32),

    #[error("connection reset by peer")]
    PeerReset,

    #[error("operation timed out")]
    Timeout,

    #[error("session closed")]
    Closed,

    #[error("session not established")]
    NotEstablished,

    #[error("invalid session state: {0}")]
    BadState(&'static str),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, ModemError>;
