use crate::consumer::Consumer;
use crate::destination::Destination;
use crate::message::{DEFAULT_PRIORITY, DeliveryMode, Message};
use crate::selector::Selector;

use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Marker trait for provider errors.
pub trait MessagingError: Error + Send + Sync + 'static {
    /// Whether the error means the connection is gone and must be recreated.
    fn is_connection_lost(&self) -> bool {
        false
    }
}

/// Quality of service applied by the provider when sending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendOptions {
    /// Persistence of the sent message.
    pub delivery_mode: DeliveryMode,

    /// Priority of the sent message.
    pub priority: u8,

    /// How long the message stays deliverable. `None` means forever.
    pub time_to_live: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::Persistent,
            priority: DEFAULT_PRIORITY,
            time_to_live: None,
        }
    }
}

/// Creates connections to a provider.
#[async_trait]
pub trait ConnectionFactory
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The connection type.
    type Connection: Connection;

    /// Opens a new connection.
    async fn create_connection(
        &self,
    ) -> Result<Self::Connection, <Self::Connection as Connection>::Error>;
}

/// A live connection to a provider.
#[async_trait]
pub trait Connection
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the connection.
    type Error: MessagingError;

    /// The consumer type created by this connection.
    type Consumer: Consumer<Error = Self::Error>;

    /// Unique id of this connection.
    fn connection_id(&self) -> &str;

    /// Sends a message and returns the provider-assigned message id.
    async fn send(
        &self,
        destination: &Destination,
        message: Message,
        options: &SendOptions,
    ) -> Result<String, Self::Error>;

    /// Creates a consumer on `destination`, optionally filtered by `selector`.
    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<Arc<dyn Selector>>,
    ) -> Result<Self::Consumer, Self::Error>;

    /// Allocates a temporary queue owned by this connection.
    async fn create_temporary_queue(&self) -> Result<Destination, Self::Error>;

    /// Deletes a temporary queue owned by this connection.
    async fn delete_temporary_queue(&self, destination: &Destination) -> Result<(), Self::Error>;

    /// Whether the connection has been closed or lost.
    fn is_closed(&self) -> bool;

    /// Closes the connection, its consumers and its temporary queues.
    async fn close(&self) -> Result<(), Self::Error>;
}
