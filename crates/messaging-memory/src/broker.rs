use crate::connection::{ConnectionInner, MemoryConnection};
use crate::error::Error;
use crate::queue::MemoryQueue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use courier_messaging::{ConnectionFactory, Destination, Message};
use dashmap::DashMap;
use tracing::{debug, trace};

#[derive(Debug)]
pub(crate) struct BrokerState {
    queues: DashMap<Destination, Arc<MemoryQueue>>,
    topics: DashMap<String, Vec<Weak<MemoryQueue>>>,
    temporary_owners: DashMap<String, String>,
    connections: DashMap<String, Weak<ConnectionInner>>,
    unavailable: AtomicBool,
}

impl BrokerState {
    /// Delivers a message to a queue or to every live subscriber of a topic.
    pub(crate) fn deliver(&self, destination: &Destination, message: Message) -> Result<(), Error> {
        match destination {
            Destination::Queue(_) => {
                self.queue(destination).push(message);
            }
            Destination::TemporaryQueue(name) => {
                let queue = self
                    .queues
                    .get(destination)
                    .map(|entry| Arc::clone(entry.value()))
                    .ok_or_else(|| Error::DestinationNotFound(name.clone()))?;
                queue.push(message);
            }
            Destination::Topic(name) => {
                let mut subscribers = self.topics.entry(name.clone()).or_default();
                subscribers.retain(|subscriber| subscriber.strong_count() > 0);
                trace!(topic = %name, subscribers = subscribers.len(), "publishing");
                for subscriber in subscribers.iter().filter_map(Weak::upgrade) {
                    subscriber.push(message.clone());
                }
            }
        }

        Ok(())
    }

    /// Returns the queue for a named queue, creating it on first use.
    pub(crate) fn queue(&self, destination: &Destination) -> Arc<MemoryQueue> {
        Arc::clone(self.queues.entry(destination.clone()).or_default().value())
    }

    pub(crate) fn existing_queue(&self, destination: &Destination) -> Option<Arc<MemoryQueue>> {
        self.queues
            .get(destination)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn subscribe(&self, topic: &str) -> Arc<MemoryQueue> {
        let queue = Arc::new(MemoryQueue::default());
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push(Arc::downgrade(&queue));
        queue
    }

    pub(crate) fn add_temporary_queue(&self, destination: Destination, owner: &str) {
        self.temporary_owners
            .insert(destination.name().to_string(), owner.to_string());
        self.queues
            .insert(destination, Arc::new(MemoryQueue::default()));
    }

    pub(crate) fn temporary_owner(&self, name: &str) -> Option<String> {
        self.temporary_owners
            .get(name)
            .map(|entry| entry.value().clone())
    }

    pub(crate) fn remove_temporary_queue(&self, destination: &Destination) {
        self.temporary_owners.remove(destination.name());
        if let Some((_, queue)) = self.queues.remove(destination) {
            queue.delete();
        }
    }

    pub(crate) fn forget_connection(&self, connection_id: &str) {
        self.connections.remove(connection_id);
    }
}

/// An in-process broker. Clones share the same queues and topics.
#[derive(Clone, Debug)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                queues: DashMap::new(),
                topics: DashMap::new(),
                temporary_owners: DashMap::new(),
                connections: DashMap::new(),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Number of messages waiting on a queue.
    #[must_use]
    pub fn queue_depth(&self, destination: &Destination) -> usize {
        self.state
            .existing_queue(destination)
            .map_or(0, |queue| queue.len())
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state
            .connections
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// Number of temporary queues currently allocated.
    #[must_use]
    pub fn temporary_queue_count(&self) -> usize {
        self.state.temporary_owners.len()
    }

    /// Simulates a network failure: every open connection is lost and its
    /// temporary queues are deleted. Returns the number of dropped connections.
    pub fn drop_connections(&self) -> usize {
        let connections: Vec<_> = self
            .state
            .connections
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();

        for connection in &connections {
            connection.mark_lost();
        }
        self.state.connections.clear();

        debug!(count = connections.len(), "dropped connections");
        connections.len()
    }

    /// While unavailable, new connections are refused with
    /// [`Error::BrokerUnavailable`].
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionFactory for MemoryBroker {
    type Connection = MemoryConnection;

    async fn create_connection(&self) -> Result<MemoryConnection, Error> {
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(Error::BrokerUnavailable);
        }

        let connection = MemoryConnection::new(Arc::clone(&self.state));
        self.state.connections.insert(
            connection.connection_id_owned(),
            connection.downgrade(),
        );

        debug!(connection_id = %connection.connection_id_owned(), "opened connection");
        Ok(connection)
    }
}
