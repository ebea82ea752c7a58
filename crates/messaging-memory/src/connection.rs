use crate::broker::BrokerState;
use crate::consumer::MemoryConsumer;
use crate::error::Error;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use async_trait::async_trait;
use courier_messaging::message::MESSAGE_ID_PREFIX;
use courier_messaging::{Connection, Destination, Message, SendOptions, Selector};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

pub(crate) struct ConnectionInner {
    id: String,
    broker: Arc<BrokerState>,
    closed: AtomicBool,
    lost: AtomicBool,
    pub(crate) closed_notify: Notify,
    temporary_counter: AtomicU64,
    temporary_queues: Mutex<Vec<Destination>>,
}

impl fmt::Debug for ConnectionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInner")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .field("lost", &self.lost)
            .finish_non_exhaustive()
    }
}

impl ConnectionInner {
    /// Fails if the connection can no longer be used.
    pub(crate) fn ensure_open(&self) -> Result<(), Error> {
        if self.lost.load(Ordering::SeqCst) {
            Err(Error::ConnectionLost(self.id.clone()))
        } else if self.closed.load(Ordering::SeqCst) {
            Err(Error::ConnectionClosed(self.id.clone()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn mark_lost(&self) {
        self.lost.store(true, Ordering::SeqCst);
        self.shut();
    }

    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let temporary_queues = std::mem::take(&mut *self.temporary_queues.lock());
        for destination in &temporary_queues {
            self.broker.remove_temporary_queue(destination);
        }

        self.closed_notify.notify_waiters();
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }
}

/// A connection to a [`MemoryBroker`](crate::MemoryBroker).
#[derive(Clone, Debug)]
pub struct MemoryConnection {
    inner: Arc<ConnectionInner>,
}

impl MemoryConnection {
    pub(crate) fn new(broker: Arc<BrokerState>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: Uuid::new_v4().simple().to_string(),
                broker,
                closed: AtomicBool::new(false),
                lost: AtomicBool::new(false),
                closed_notify: Notify::new(),
                temporary_counter: AtomicU64::new(0),
                temporary_queues: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn connection_id_owned(&self) -> String {
        self.inner.id.clone()
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Error = Error;

    type Consumer = MemoryConsumer;

    fn connection_id(&self) -> &str {
        self.inner.id()
    }

    async fn send(
        &self,
        destination: &Destination,
        mut message: Message,
        options: &SendOptions,
    ) -> Result<String, Error> {
        self.inner.ensure_open()?;

        let now = SystemTime::now();
        let message_id = format!("{MESSAGE_ID_PREFIX}{}", Uuid::new_v4());

        message.message_id = Some(message_id.clone());
        message.destination = Some(destination.clone());
        message.timestamp = Some(now);
        message.redelivered = false;
        message.delivery_mode = options.delivery_mode;
        message.priority = options.priority;
        message.expiration = options.time_to_live.map(|ttl| now + ttl);

        trace!(%destination, %message_id, "send");
        self.inner.broker.deliver(destination, message)?;

        Ok(message_id)
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<Arc<dyn Selector>>,
    ) -> Result<MemoryConsumer, Error> {
        self.inner.ensure_open()?;

        let queue = match destination {
            Destination::Queue(_) => self.inner.broker.queue(destination),
            Destination::Topic(name) => self.inner.broker.subscribe(name),
            Destination::TemporaryQueue(name) => {
                let owner = self
                    .inner
                    .broker
                    .temporary_owner(name)
                    .ok_or_else(|| Error::DestinationNotFound(name.clone()))?;
                if owner != self.inner.id {
                    return Err(Error::ForeignTemporaryQueue(name.clone()));
                }
                self.inner
                    .broker
                    .existing_queue(destination)
                    .ok_or_else(|| Error::DestinationNotFound(name.clone()))?
            }
        };

        debug!(connection_id = %self.inner.id, %destination, "created consumer");
        Ok(MemoryConsumer::new(
            destination.clone(),
            queue,
            selector,
            Arc::clone(&self.inner),
        ))
    }

    async fn create_temporary_queue(&self) -> Result<Destination, Error> {
        self.inner.ensure_open()?;

        let sequence = self.inner.temporary_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let destination =
            Destination::TemporaryQueue(format!("{MESSAGE_ID_PREFIX}{}:{sequence}", self.inner.id));

        self.inner
            .broker
            .add_temporary_queue(destination.clone(), &self.inner.id);
        self.inner.temporary_queues.lock().push(destination.clone());

        debug!(connection_id = %self.inner.id, %destination, "created temporary queue");
        Ok(destination)
    }

    async fn delete_temporary_queue(&self, destination: &Destination) -> Result<(), Error> {
        let name = destination.name();
        if self.inner.broker.temporary_owner(name).as_deref() != Some(self.inner.id.as_str()) {
            return Err(Error::ForeignTemporaryQueue(name.to_string()));
        }

        self.inner
            .temporary_queues
            .lock()
            .retain(|owned| owned != destination);
        self.inner.broker.remove_temporary_queue(destination);

        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), Error> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.shut();
        self.inner.broker.forget_connection(&self.inner.id);

        debug!(connection_id = %self.inner.id, "closed connection");
        Ok(())
    }
}
