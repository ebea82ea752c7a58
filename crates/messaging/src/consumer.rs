use crate::connection::MessagingError;
use crate::destination::Destination;
use crate::message::Message;

use std::fmt::Debug;

use async_trait::async_trait;

/// Receives messages from a single destination.
#[async_trait]
pub trait Consumer
where
    Self: Debug + Send + Sync + 'static,
{
    /// The error type for the consumer.
    type Error: MessagingError;

    /// The destination this consumer reads from.
    fn destination(&self) -> &Destination;

    /// Waits for the next matching message. Returns `None` once the consumer
    /// or its connection has been closed.
    async fn receive(&self) -> Result<Option<Message>, Self::Error>;

    /// Stops the consumer. Pending `receive` calls return `None`.
    async fn close(&self) -> Result<(), Self::Error>;
}
