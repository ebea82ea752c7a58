use crate::config::ReplyStrategy;
use crate::error::{Error, Result};

use std::sync::Arc;

use courier_messaging::{Connection, ConnectionFactory, Consumer, Destination, Selector};
use tracing::{debug, warn};

/// A reply destination and the consumers serving it, on a dedicated connection.
#[derive(Debug)]
pub struct ReplyBinding<C>
where
    C: Connection,
{
    connection: C,
    destination: Destination,
    consumers: Vec<C::Consumer>,
}

impl<C> ReplyBinding<C>
where
    C: Connection,
{
    /// Opens a connection, resolves the reply destination (allocating a
    /// temporary queue if needed) and attaches `consumers` consumers to it.
    pub async fn open<F>(
        factory: &F,
        strategy: &ReplyStrategy,
        consumers: usize,
        selector: Option<Arc<dyn Selector>>,
    ) -> Result<Self>
    where
        F: ConnectionFactory<Connection = C>,
    {
        let connection = factory.create_connection().await.map_err(Error::messaging)?;

        match Self::attach(&connection, strategy, consumers, selector).await {
            Ok((destination, consumers)) => {
                debug!(%destination, consumers = consumers.len(), "bound reply destination");
                Ok(Self {
                    connection,
                    destination,
                    consumers,
                })
            }
            Err(error) => {
                if let Err(close_error) = connection.close().await {
                    warn!(%close_error, "failed to close connection after bind failure");
                }
                Err(error)
            }
        }
    }

    async fn attach(
        connection: &C,
        strategy: &ReplyStrategy,
        count: usize,
        selector: Option<Arc<dyn Selector>>,
    ) -> Result<(Destination, Vec<C::Consumer>)> {
        let destination = match strategy {
            ReplyStrategy::Temporary { .. } => connection
                .create_temporary_queue()
                .await
                .map_err(Error::messaging)?,
            ReplyStrategy::Shared { destination } | ReplyStrategy::Exclusive { destination } => {
                destination.clone()
            }
        };

        let mut consumers = Vec::with_capacity(count);
        for _ in 0..count {
            consumers.push(
                connection
                    .create_consumer(&destination, selector.clone())
                    .await
                    .map_err(Error::messaging)?,
            );
        }

        Ok((destination, consumers))
    }

    /// The destination replies arrive on.
    pub const fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Consumers attached to the destination.
    pub fn consumers(&self) -> &[C::Consumer] {
        &self.consumers
    }

    /// Releases the consumers, the temporary queue (if any) and the connection.
    /// Failures are logged; the connection is usually already gone.
    pub async fn close(self) {
        for consumer in &self.consumers {
            if let Err(error) = consumer.close().await {
                debug!(%error, "failed to close reply consumer");
            }
        }

        if self.destination.is_temporary() && !self.connection.is_closed() {
            if let Err(error) = self
                .connection
                .delete_temporary_queue(&self.destination)
                .await
            {
                debug!(%error, "failed to delete temporary reply queue");
            }
        }

        if let Err(error) = self.connection.close().await {
            debug!(%error, "failed to close reply connection");
        }
    }
}
