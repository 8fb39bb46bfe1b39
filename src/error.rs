use std::io;
use thiserror::Error;

/// Errors surfaced by [`Processor::process`](crate::turn::Processor::process).
///
/// The set is closed: every failure the core can produce for an inbound
/// packet collapses into one of these variants, and none of them carry a
/// nested cause.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StunError {
    /// Truncated header, malformed attribute, bad length or a request the
    /// current allocation state cannot satisfy
    #[error("invalid input")]
    InvalidInput,

    /// Address family byte is unknown or does not match the relay family
    #[error("unsupported ip family")]
    UnsupportedIpFamily,

    /// The keyed hash primitive rejected its input
    #[error("sha failed")]
    ShaFailed,

    /// Request requires MESSAGE-INTEGRITY but carries none
    #[error("message integrity attribute missing")]
    NotIntegrity,

    /// Integrity, fingerprint or credential check failed
    #[error("integrity check failed")]
    IntegrityFailed,

    /// Magic cookie is absent
    #[error("magic cookie mismatch")]
    NotCookie,

    /// Method not served by this core
    #[error("unknown method")]
    UnknownMethod,

    /// Internal invariant violated; the processor should be recreated
    #[error("fatal error")]
    FatalError,

    /// A text attribute is not valid UTF-8
    #[error("utf8 error")]
    Utf8Error,
}

impl StunError {
    /// Stable name used across language boundaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "InvalidInput",
            Self::UnsupportedIpFamily => "UnsupportedIpFamily",
            Self::ShaFailed => "ShaFailed",
            Self::NotIntegrity => "NotIntegrity",
            Self::IntegrityFailed => "IntegrityFailed",
            Self::NotCookie => "NotCookie",
            Self::UnknownMethod => "UnknownMethod",
            Self::FatalError => "FatalError",
            Self::Utf8Error => "Utf8Error",
        }
    }

    /// Authentication failures share one wire response so the sub-case
    /// stays hidden from the client.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::NotIntegrity | Self::IntegrityFailed | Self::ShaFailed)
    }

    /// Everything except `FatalError` leaves the processor usable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::FatalError)
    }

    /// STUN ERROR-CODE a request failing with this error is answered with.
    ///
    /// `None` means no wire response is produced.
    pub fn error_code(&self) -> Option<u16> {
        match self {
            Self::NotIntegrity | Self::IntegrityFailed | Self::ShaFailed => Some(401),
            Self::InvalidInput | Self::UnknownMethod => Some(400),
            Self::UnsupportedIpFamily => Some(440),
            Self::NotCookie | Self::Utf8Error | Self::FatalError => None,
        }
    }
}

/// Result type for packet processing
pub type StunResult<T> = Result<T, StunError>;

/// Host-side errors: configuration, address parsing and I/O.
#[derive(Debug, Error)]
pub enum TurnError {
    /// Protocol errors
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An address string did not parse
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Network or file I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Config file is not valid JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for host-side operations
pub type TurnResult<T> = Result<T, TurnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_share_wire_code() {
        let codes: Vec<_> = [StunError::NotIntegrity, StunError::IntegrityFailed, StunError::ShaFailed]
            .iter()
            .map(|e| e.error_code())
            .collect();
        assert!(codes.iter().all(|c| *c == Some(401)));
    }

    #[test]
    fn test_only_fatal_is_unrecoverable() {
        assert!(!StunError::FatalError.is_recoverable());
        assert!(StunError::InvalidInput.is_recoverable());
        assert!(StunError::UnknownMethod.is_recoverable());
        assert_eq!(StunError::Utf8Error.as_str(), "Utf8Error");
    }
}
