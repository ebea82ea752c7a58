//! Abstract interface for JMS-style point-to-point messaging.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Connections send messages and own consumers and temporary queues.
pub mod connection;

/// Consumers receive messages from a destination.
pub mod consumer;

/// Destinations are named queues, topics and provider temporary queues.
pub mod destination;

/// Messages carry a body, standard headers and properties.
pub mod message;

/// Selectors restrict which messages a consumer receives.
pub mod selector;

pub use connection::{Connection, ConnectionFactory, MessagingError, SendOptions};
pub use consumer::Consumer;
pub use destination::Destination;
pub use message::{DeliveryMode, Message, MessageBody, PropertyValue};
pub use selector::Selector;
