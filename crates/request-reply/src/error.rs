use crate::transfer::RemoteFailure;

use std::time::Duration;

use courier_messaging::MessagingError;
use thiserror::Error;

/// Result type alias for request/reply operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The producer or consumer was started twice.
    #[error("already started")]
    AlreadyStarted,

    /// A request with the same correlation key is still waiting for its reply.
    #[error("correlation key {0} is already pending")]
    DuplicateCorrelationKey(String),

    /// No reply arrived within the request timeout.
    #[error("no reply received within {timeout:?} for correlation id {correlation_id}")]
    ExchangeTimedOut {
        /// Correlation key of the abandoned request.
        correlation_id: String,
        /// The timeout that applied to the request.
        timeout: Duration,
    },

    /// An endpoint option has an unusable value.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The reply destination options contradict each other.
    #[error("invalid reply-to configuration: {0}")]
    InvalidReplyToConfiguration(String),

    /// The endpoint URI could not be parsed.
    #[error("invalid endpoint uri {uri}: {reason}")]
    InvalidUri {
        /// The offending URI.
        uri: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Error reported by the messaging provider.
    #[error("messaging error: {source}")]
    Messaging {
        /// The provider error.
        source: Box<dyn std::error::Error + Send + Sync>,
        /// Whether the provider connection was lost.
        connection_lost: bool,
    },

    /// Operation requires a started producer or consumer.
    #[error("not started")]
    NotStarted,

    /// The responder failed and transferred its failure back in the reply.
    #[error("remote processing failed: {0}")]
    RemoteProcessingFailure(RemoteFailure),

    /// Serialization error.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// The correlator or reply manager shut down while the request was waiting.
    #[error("stopped")]
    Stopped,
}

impl Error {
    /// Wraps a provider error.
    pub fn messaging<E>(error: E) -> Self
    where
        E: MessagingError,
    {
        Self::Messaging {
            connection_lost: error.is_connection_lost(),
            source: Box::new(error),
        }
    }

    /// Whether a provider error indicated connection loss.
    #[must_use]
    pub const fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Messaging {
                connection_lost: true,
                ..
            }
        )
    }

    pub(crate) fn invalid_uri<U, R>(uri: U, reason: R) -> Self
    where
        U: Into<String>,
        R: Into<String>,
    {
        Self::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }
}
