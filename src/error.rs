use crate::crypto::CryptoError;
use thiserror::Error;

/// Errors raised by the DNS tunnel transport.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The encoded payload cannot fit inside a single DNS name.
    #[error("too much data to encode into one query")]
    MsgTooLong,

    /// The handshake did not yield a usable 24-bit session id.
    #[error("invalid dns session id")]
    InvalidDnsSessionId,

    /// No resolvers were configured, or none survived fingerprinting.
    #[error("no usable resolvers")]
    NoResolvers,

    /// A resolver exhausted its retry budget.
    #[error("dns query timed out")]
    Timeout,

    /// Operation attempted on a closed session.
    #[error("dns session closed")]
    Closed,

    /// A framing record failed to deserialize, carried the wrong type,
    /// or failed authentication.
    #[error("invalid response from controller")]
    InvalidResponse,

    /// A downlink fragment declared offsets outside the payload bounds.
    #[error("invalid start/stop index")]
    InvalidIndex,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
