//! Error types for the softphone core
//!
//! Every user-initiated operation returns a [`SoftphoneResult`]. Failures that
//! happen asynchronously (negotiation, remote hangups, registration refusal)
//! never surface here; they arrive on the event stream instead.
//!
//! # Error Categories
//!
//! - **Connection** - the signaling transport could not be reached or was superseded
//! - **Registration** - the registrar refused the binding
//! - **Session state** - an operation was invoked outside the states that allow it
//! - **Media** - microphone capture was denied or no device exists
//! - **Transport** - the peer transport could not be created or configured
//! - **Signaling operation** - a session primitive (refer, DTMF, answer) was rejected
//! - **Configuration** - the supplied [`SoftphoneConfig`](crate::SoftphoneConfig) is unusable
//!
//! # Examples
//!
//! ```rust
//! use webphone_core::SoftphoneError;
//!
//! let err = SoftphoneError::invalid_state("transfer", "Progressing");
//! assert_eq!(err.category(), "session_state");
//! assert!(!err.is_recoverable());
//! ```

use thiserror::Error;

/// Result type for softphone operations
pub type SoftphoneResult<T> = Result<T, SoftphoneError>;

/// Errors that can occur in the softphone core
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SoftphoneError {
    /// The signaling transport is unreachable, dropped, or the attempt was superseded
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable detail
        message: String,
    },

    /// The registrar rejected the registration
    #[error("Registration failed: {cause}")]
    RegistrationFailed {
        /// Failure detail reported by the signaling layer
        cause: String,
    },

    /// Operation invoked outside its valid state
    #[error("Operation '{operation}' is not valid in state {state}")]
    InvalidSessionState {
        /// The rejected operation
        operation: String,
        /// The state the session or user agent was in
        state: String,
    },

    /// Microphone capture was declined or no capture device is available
    #[error("Media access denied: {reason}")]
    MediaAccessDenied {
        /// Reason reported by the media layer
        reason: String,
    },

    /// The peer transport could not be created or configured
    #[error("Transport negotiation error: {message}")]
    TransportNegotiation {
        /// Human-readable detail
        message: String,
    },

    /// A signaling session primitive was rejected
    #[error("Signaling operation '{operation}' failed: {message}")]
    SignalingOperation {
        /// The session primitive that failed (answer, refer, dtmf, ...)
        operation: String,
        /// Detail from the signaling layer
        message: String,
    },

    /// Configuration is incomplete or malformed
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        /// What is wrong with the configuration
        message: String,
    },

    /// A DTMF tone outside `0-9 * # A-D`
    #[error("Invalid DTMF tone: {tone:?}")]
    InvalidDtmfTone {
        /// The rejected tone
        tone: char,
    },
}

impl SoftphoneError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a registration failure
    pub fn registration_failed(cause: impl Into<String>) -> Self {
        Self::RegistrationFailed {
            cause: cause.into(),
        }
    }

    /// Create an invalid session state error
    pub fn invalid_state(operation: impl Into<String>, state: impl Into<String>) -> Self {
        Self::InvalidSessionState {
            operation: operation.into(),
            state: state.into(),
        }
    }

    /// Create a media access error
    pub fn media_denied(reason: impl Into<String>) -> Self {
        Self::MediaAccessDenied {
            reason: reason.into(),
        }
    }

    /// Create a transport negotiation error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportNegotiation {
            message: message.into(),
        }
    }

    /// Create a signaling operation error
    pub fn signaling(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SignalingOperation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later can reasonably succeed
    ///
    /// Connection and transport problems are usually transient. State and
    /// configuration errors will fail identically until the caller changes
    /// something.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::RegistrationFailed { .. }
                | Self::TransportNegotiation { .. }
                | Self::SignalingOperation { .. }
        )
    }

    /// Stable category name, suitable for metrics labels or UI lookups
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::RegistrationFailed { .. } => "registration",
            Self::InvalidSessionState { .. } => "session_state",
            Self::MediaAccessDenied { .. } => "media",
            Self::TransportNegotiation { .. } => "transport",
            Self::SignalingOperation { .. } => "signaling",
            Self::InvalidConfiguration { .. } => "configuration",
            Self::InvalidDtmfTone { .. } => "dtmf",
        }
    }
}

impl From<crate::media::MediaError> for SoftphoneError {
    fn from(err: crate::media::MediaError) -> Self {
        Self::media_denied(err.to_string())
    }
}

impl From<crate::transport::TransportError> for SoftphoneError {
    fn from(err: crate::transport::TransportError) -> Self {
        Self::transport(err.to_string())
    }
}
