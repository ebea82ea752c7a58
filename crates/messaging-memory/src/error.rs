use courier_messaging::MessagingError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The broker refused new connections.
    #[error("broker unavailable")]
    BrokerUnavailable,

    /// The connection was closed by its owner.
    #[error("connection {0} is closed")]
    ConnectionClosed(String),

    /// The connection was dropped by the broker.
    #[error("connection {0} lost")]
    ConnectionLost(String),

    /// The destination does not exist (deleted temporary queue).
    #[error("destination not found: {0}")]
    DestinationNotFound(String),

    /// Temporary queues may only be consumed by the connection that created them.
    #[error("temporary queue {0} belongs to another connection")]
    ForeignTemporaryQueue(String),
}

impl MessagingError for Error {
    fn is_connection_lost(&self) -> bool {
        matches!(self, Self::BrokerUnavailable | Self::ConnectionLost(_))
    }
}
