//! Error types for the Bluetooth audio driver.

use thiserror::Error;

/// Bus fault name returned to a remote peer for malformed or conflicting
/// configuration requests.
pub const FAULT_INVALID_ARGUMENTS: &str = "org.bluez.Error.InvalidArguments";

/// Bus fault name returned when no mutually supported codec setting exists.
pub const FAULT_NOT_SUPPORTED: &str = "org.bluez.Error.NotSupported";

/// Bus error name signalled when the remote daemon is not running.
pub const FAULT_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";

/// Primary error type for all driver operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote peer unavailable")]
    PeerUnavailable,

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Errors parsing or validating inbound bus messages.
///
/// A protocol error aborts processing of the offending message only; the
/// listener and all registry state survive it.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unexpected argument type for {0}")]
    UnexpectedType(&'static str),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Attempt to rewrite immutable property {property} on {path}")]
    ImmutableProperty { property: &'static str, path: String },

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Errors selecting or applying a codec configuration.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("No supported sample rate in capabilities")]
    NoSupportedRate,

    #[error("No supported channel mode in capabilities")]
    NoSupportedChannelMode,

    #[error("No supported block length in capabilities")]
    NoSupportedBlockLength,

    #[error("No supported subband count in capabilities")]
    NoSupportedSubbands,

    #[error("No supported allocation method in capabilities")]
    NoSupportedAllocation,

    #[error("Peer bitpool range [{peer_min}, {peer_max}] is unusable")]
    BitpoolRangeEmpty { peer_min: u8, peer_max: u8 },

    #[error("Capability blob has wrong size: expected {expected}, got {actual}")]
    BadCapabilitySize { expected: usize, actual: usize },

    #[error("Transport {0} is already configured")]
    TransportExists(String),

    #[error("Profile slot already occupied on device {0}")]
    SlotOccupied(String),

    #[error("Invalid configuration request: {0}")]
    InvalidRequest(String),
}

impl NegotiationError {
    /// Bus fault name a remote peer receives for this error.
    pub fn fault_name(&self) -> &'static str {
        match self {
            NegotiationError::NoSupportedRate
            | NegotiationError::NoSupportedChannelMode
            | NegotiationError::NoSupportedBlockLength
            | NegotiationError::NoSupportedSubbands
            | NegotiationError::NoSupportedAllocation
            | NegotiationError::BitpoolRangeEmpty { .. } => FAULT_NOT_SUPPORTED,
            _ => FAULT_INVALID_ARGUMENTS,
        }
    }
}

/// Errors inside the real-time transport engine.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Transport not acquired")]
    NotAcquired,

    #[error("Socket read failed: {0}")]
    Read(std::io::Error),

    #[error("Socket write failed: {0}")]
    Write(std::io::Error),

    #[error("Short write: wrote {written} of {wanted} bytes")]
    ShortWrite { written: usize, wanted: usize },

    #[error("SBC encoding error")]
    Encode,

    #[error("SBC decoding error")]
    Decode,

    #[error("Poll failed: {0}")]
    Poll(std::io::Error),

    #[error("Socket reported an error condition")]
    SocketError,
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formats() {
        let err = Error::Protocol(ProtocolError::MissingField("Device"));
        assert!(err.to_string().contains("Protocol error"));
        assert!(err.to_string().contains("Device"));

        let err = Error::Negotiation(NegotiationError::NoSupportedRate);
        assert!(err.to_string().contains("sample rate"));

        let err = Error::PeerUnavailable;
        assert!(err.to_string().contains("unavailable"));
    }

    #[test]
    fn error_source_chain() {
        use std::error::Error as StdError;

        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "test");
        let err = Error::Io(io_err);
        assert!(err.source().is_some());
    }

    #[test]
    fn negotiation_faults_map_to_fixed_names() {
        assert_eq!(
            NegotiationError::NoSupportedRate.fault_name(),
            FAULT_NOT_SUPPORTED
        );
        assert_eq!(
            NegotiationError::TransportExists("/t0".into()).fault_name(),
            FAULT_INVALID_ARGUMENTS
        );
        assert_eq!(
            NegotiationError::SlotOccupied("/dev".into()).fault_name(),
            FAULT_INVALID_ARGUMENTS
        );
    }

    #[test]
    fn error_conversions() {
        let err: Error = ProtocolError::Malformed("bad".into()).into();
        assert!(matches!(err, Error::Protocol(_)));

        let err: Error = NegotiationError::NoSupportedSubbands.into();
        assert!(matches!(err, Error::Negotiation(_)));

        let err: Error = StreamError::NotAcquired.into();
        assert!(matches!(err, Error::Stream(_)));
    }
}
