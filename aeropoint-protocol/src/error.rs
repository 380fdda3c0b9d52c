//! Error handling for the AeroPoint protocol
//!
//! One error type covers the whole crate. Channel-level failures carry the
//! condition the UI needs to render accurate guidance (permission vs radio
//! unavailable vs peer lost), and decode failures are always locally
//! recoverable by dropping the offending packet.

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// # Automatic Conversions
///
/// `std::io::Error` converts via `From` into `ProtocolError::Io`. Prefer
/// [`ProtocolError::from_io_error`] on network paths so timeouts and
/// permission failures surface as their specific variants.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (socket, adapter, file system)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A report buffer was too short or carried an invalid header
    ///
    /// Decode-time only. Handled by dropping the packet, never fatal.
    #[error("Malformed report: {0}")]
    MalformedReport(String),

    /// The platform denied access to a transport
    ///
    /// Also produced when the local-network stack reports its "permission
    /// possibly required but no prompt shown" sentinel; the lan channel
    /// remaps that condition here so the UI has one actionable message.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The transport is switched off or unsupported on this host
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// A connection attempt or channel operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The remote peer vanished mid-session
    #[error("Peer lost: {0}")]
    PeerLost(String),

    /// A report could not be sent on the active session
    ///
    /// Movement data is ephemeral: logged, dropped, never retried.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Transport layer error that fits no more specific variant
    #[error("Transport error: {0}")]
    Transport(String),

    /// An operation was attempted in a state that does not allow it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific channel error
    ///
    /// Examines the error kind so users see "timeout" or "permission
    /// denied" instead of a raw errno string.
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::PermissionDenied => {
                ProtocolError::PermissionDenied(format!("{}: {}", context, error))
            }
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ProtocolError::PeerLost(format!("{}: {}", context, error))
            }
            ErrorKind::Unsupported | ErrorKind::NotFound => {
                ProtocolError::Unavailable(format!("{}: {}", context, error))
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Check if this error is transient and might succeed on retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout(_)
                | ProtocolError::PeerLost(_)
                | ProtocolError::SendFailed(_)
                | ProtocolError::Io(_)
        )
    }

    /// Check if this error requires user action to resolve
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ProtocolError::PermissionDenied(_)
                | ProtocolError::Unavailable(_)
                | ProtocolError::Configuration(_)
        )
    }

    /// Get a user-friendly message suitable for status text in a UI
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::PermissionDenied(_) => {
                "Permission denied. Allow local network and Bluetooth access in system settings."
                    .to_string()
            }
            ProtocolError::Unavailable(msg) => {
                format!("Transport unavailable: {}. Check that the radio is enabled.", msg)
            }
            ProtocolError::Timeout(_) => {
                "Connection timed out. Make sure both devices are nearby and try again."
                    .to_string()
            }
            ProtocolError::PeerLost(_) => {
                "The remote device disconnected. Move closer and reconnect.".to_string()
            }
            ProtocolError::MalformedReport(msg) => {
                format!("Invalid data received: {}.", msg)
            }
            ProtocolError::SendFailed(msg) => {
                format!("Failed to send input: {}.", msg)
            }
            ProtocolError::Transport(msg) => {
                format!("Transport error: {}.", msg)
            }
            ProtocolError::InvalidState(msg) => {
                format!("Invalid state: {}.", msg)
            }
            ProtocolError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            ProtocolError::Io(e) => {
                format!("I/O error: {}.", e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProtocolError::MalformedReport("buffer too short".to_string());
        assert_eq!(error.to_string(), "Malformed report: buffer too short");

        let error = ProtocolError::PeerLost("radio".to_string());
        assert_eq!(error.to_string(), "Peer lost: radio");
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error, ErrorKind};

        let io_error = Error::new(ErrorKind::TimedOut, "no reply");
        let error = ProtocolError::from_io_error(io_error, "connecting to peer");
        assert!(matches!(error, ProtocolError::Timeout(_)));

        let io_error = Error::new(ErrorKind::PermissionDenied, "denied");
        let error = ProtocolError::from_io_error(io_error, "binding socket");
        assert!(matches!(error, ProtocolError::PermissionDenied(_)));

        let io_error = Error::new(ErrorKind::BrokenPipe, "pipe closed");
        let error = ProtocolError::from_io_error(io_error, "sending report");
        assert!(matches!(error, ProtocolError::PeerLost(_)));
    }

    #[test]
    fn test_recoverability() {
        assert!(ProtocolError::Timeout("t".into()).is_recoverable());
        assert!(ProtocolError::SendFailed("s".into()).is_recoverable());
        assert!(!ProtocolError::PermissionDenied("p".into()).is_recoverable());
    }

    #[test]
    fn test_requires_user_action() {
        assert!(ProtocolError::PermissionDenied("p".into()).requires_user_action());
        assert!(ProtocolError::Unavailable("radio off".into()).requires_user_action());
        assert!(!ProtocolError::Timeout("t".into()).requires_user_action());
    }
}
