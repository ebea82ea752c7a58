use crate::connection::ConnectionInner;
use crate::error::Error;
use crate::queue::MemoryQueue;

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use courier_messaging::{Consumer, Destination, Message, Selector};
use tokio::sync::Notify;
use tracing::trace;

/// A consumer created by a [`MemoryConnection`](crate::MemoryConnection).
#[derive(Debug)]
pub struct MemoryConsumer {
    destination: Destination,
    queue: Arc<MemoryQueue>,
    selector: Option<Arc<dyn Selector>>,
    connection: Arc<ConnectionInner>,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl MemoryConsumer {
    pub(crate) fn new(
        destination: Destination,
        queue: Arc<MemoryQueue>,
        selector: Option<Arc<dyn Selector>>,
        connection: Arc<ConnectionInner>,
    ) -> Self {
        Self {
            destination,
            queue,
            selector,
            connection,
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        }
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    type Error = Error;

    fn destination(&self) -> &Destination {
        &self.destination
    }

    async fn receive(&self) -> Result<Option<Message>, Error> {
        loop {
            // Register interest before checking state so a push or close
            // between the check and the await still wakes us.
            let mut queue_notified = pin!(self.queue.notify.notified());
            let mut consumer_closed = pin!(self.closed_notify.notified());
            let mut connection_closed = pin!(self.connection.closed_notify.notified());
            queue_notified.as_mut().enable();
            consumer_closed.as_mut().enable();
            connection_closed.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }

            match self.connection.ensure_open() {
                Ok(()) => {}
                Err(Error::ConnectionClosed(_)) => return Ok(None),
                Err(error) => return Err(error),
            }

            if self.queue.is_deleted() {
                return Err(Error::DestinationNotFound(
                    self.destination.name().to_string(),
                ));
            }

            if let Some(message) = self
                .queue
                .take_matching(self.selector.as_deref(), SystemTime::now())
            {
                trace!(destination = %self.destination, message_id = ?message.message_id, "received");
                return Ok(Some(message));
            }

            tokio::select! {
                () = queue_notified.as_mut() => {}
                () = consumer_closed.as_mut() => {}
                () = connection_closed.as_mut() => {}
            }
        }
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        self.closed_notify.notify_waiters();
        Ok(())
    }
}
