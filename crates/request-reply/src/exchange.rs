use std::collections::BTreeMap;

use bytes::Bytes;
use courier_messaging::{Destination, MessageBody, PropertyValue};

/// Header names understood by the producer, consumer and binding.
pub mod headers {
    /// Correlation id of the message.
    pub const JMS_CORRELATION_ID: &str = "JMSCorrelationID";
    /// Delivery mode code of the message.
    pub const JMS_DELIVERY_MODE: &str = "JMSDeliveryMode";
    /// Destination the message was sent to.
    pub const JMS_DESTINATION: &str = "JMSDestination";
    /// Expiration as milliseconds since the epoch.
    pub const JMS_EXPIRATION: &str = "JMSExpiration";
    /// Provider assigned message id.
    pub const JMS_MESSAGE_ID: &str = "JMSMessageID";
    /// Priority of the message.
    pub const JMS_PRIORITY: &str = "JMSPriority";
    /// Whether the message was delivered before.
    pub const JMS_REDELIVERED: &str = "JMSRedelivered";
    /// Where replies should be sent.
    pub const JMS_REPLY_TO: &str = "JMSReplyTo";
    /// Send time as milliseconds since the epoch.
    pub const JMS_TIMESTAMP: &str = "JMSTimestamp";
    /// Application message type.
    pub const JMS_TYPE: &str = "JMSType";

    /// Prefix of headers that are never sent as message properties.
    pub const INTERNAL_PREFIX: &str = "Courier";

    /// Overrides the endpoint request timeout (milliseconds) for one request.
    pub const REQUEST_TIMEOUT: &str = "CourierJmsRequestTimeout";

    /// Overrides the endpoint destination for one message.
    pub const DESTINATION_NAME: &str = "CourierJmsDestinationName";

    /// Marks a reply that carries a transferred responder failure.
    pub const TRANSFER_EXCEPTION: &str = "CourierJmsTransferException";
}

/// How the producer treats an exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExchangePattern {
    /// Fire and forget.
    InOnly,

    /// Send a request and wait for the reply.
    #[default]
    InOut,
}

/// A header attached to an exchange.
#[derive(Clone, Debug, PartialEq)]
pub enum HeaderValue {
    /// A primitive value, eligible to become a message property.
    Value(PropertyValue),

    /// A destination, used for `JMSReplyTo` and `JMSDestination`.
    Destination(Destination),

    /// Binary data. Never sent as a property.
    Binary(Bytes),
}

impl HeaderValue {
    /// Renders primitive and destination values as a string.
    #[must_use]
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::Value(value) => Some(value.to_string()),
            Self::Destination(destination) => Some(destination.to_string()),
            Self::Binary(_) => None,
        }
    }

    /// Returns the value as an integer when it holds one, or a string that
    /// parses as one.
    #[must_use]
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Value(PropertyValue::Long(value)) => Some(*value),
            Self::Value(PropertyValue::String(value)) => value.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<PropertyValue> for HeaderValue {
    fn from(value: PropertyValue) -> Self {
        Self::Value(value)
    }
}

macro_rules! header_value_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for HeaderValue {
                fn from(value: $ty) -> Self {
                    Self::Value(PropertyValue::from(value))
                }
            }
        )*
    };
}

header_value_from!(bool, i32, i64, f64, &str, String);

impl From<Destination> for HeaderValue {
    fn from(value: Destination) -> Self {
        Self::Destination(value)
    }
}

impl From<Bytes> for HeaderValue {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

/// Named headers of an exchange or reply.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A message travelling through a producer or consumer, with its headers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Exchange {
    /// How the producer should treat the exchange.
    pub pattern: ExchangePattern,

    /// The payload.
    pub body: MessageBody,

    /// Headers; standard `JMS*` names map to message header fields.
    pub headers: Headers,
}

impl Exchange {
    /// Creates a request/reply exchange.
    pub fn in_out<B>(body: B) -> Self
    where
        B: Into<MessageBody>,
    {
        Self {
            pattern: ExchangePattern::InOut,
            body: body.into(),
            headers: Headers::new(),
        }
    }

    /// Creates a fire-and-forget exchange.
    pub fn in_only<B>(body: B) -> Self
    where
        B: Into<MessageBody>,
    {
        Self {
            pattern: ExchangePattern::InOnly,
            body: body.into(),
            headers: Headers::new(),
        }
    }

    /// Sets a header.
    #[must_use]
    pub fn with_header<K, V>(mut self, name: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<HeaderValue>,
    {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Returns a header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    /// Returns the `JMSCorrelationID` header, if set.
    #[must_use]
    pub fn correlation_id(&self) -> Option<String> {
        self.header(headers::JMS_CORRELATION_ID)
            .and_then(HeaderValue::as_string)
    }

    /// Returns the body as text, if it is a text body.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.body.as_text()
    }
}

/// The reply to a request/reply exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    /// The reply payload.
    pub body: MessageBody,

    /// Headers bound from the reply message.
    pub headers: Headers,

    /// Correlation id carried by the reply.
    pub correlation_id: Option<String>,

    /// Provider message id of the reply.
    pub message_id: Option<String>,
}

impl Reply {
    /// Returns the body as text, if it is a text body.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.body.as_text()
    }

    /// Returns a header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }
}
