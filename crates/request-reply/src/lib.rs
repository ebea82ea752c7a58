//! Synchronous request/reply over asynchronous JMS-style messaging.
//!
//! A [`JmsProducer`] sends a request carrying a `JMSReplyTo` destination and
//! a correlation key, then waits until the matching reply arrives or the
//! request times out. A [`JmsConsumer`] does the other side: it consumes
//! requests, hands them to a [`RequestHandler`] and sends the result back to
//! wherever the request asked.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Maps exchanges to provider messages and back.
pub mod binding;

/// Creates endpoints and owns state shared between them.
pub mod component;

/// Endpoint options, reply strategies and `jms:` URI parsing.
pub mod config;

/// Listener container for the responding side.
pub mod consumer;

/// Matches replies to the requests waiting for them.
pub mod correlator;

/// A destination plus its options.
pub mod endpoint;

mod error;

/// Exchanges, replies and well-known headers.
pub mod exchange;

/// The requesting side.
pub mod producer;

mod reply;

/// Responder failures carried back to the requester.
pub mod transfer;

pub use binding::JmsBinding;
pub use component::JmsComponent;
pub use config::{
    CorrelationStrategy, EndpointConfig, QosOptions, ReplyStrategy, ReplyToType,
    TemporaryAffinity,
};
pub use consumer::{HandlerError, JmsConsumer, RequestHandler};
pub use correlator::{Correlator, PendingReply, Resolution};
pub use endpoint::JmsEndpoint;
pub use error::{Error, Result};
pub use exchange::{Exchange, ExchangePattern, HeaderValue, Headers, Reply, headers};
pub use producer::{JmsProducer, Outcome};
pub use transfer::RemoteFailure;
