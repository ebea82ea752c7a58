//! In-memory implementation of the messaging crate.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker;
mod connection;
mod consumer;
mod error;
mod queue;

pub use broker::MemoryBroker;
pub use connection::MemoryConnection;
pub use consumer::MemoryConsumer;
pub use error::Error;
