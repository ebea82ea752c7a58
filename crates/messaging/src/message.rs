use crate::destination::Destination;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Prefix carried by every provider-assigned message id.
pub const MESSAGE_ID_PREFIX: &str = "ID:";

/// Priority used when none is set explicitly.
pub const DEFAULT_PRIORITY: u8 = 4;

/// Highest priority a message may carry.
pub const MAX_PRIORITY: u8 = 9;

/// Whether the provider must keep a message across restarts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// The message may be lost if the provider fails.
    NonPersistent,

    /// The message is kept until delivered.
    #[default]
    Persistent,
}

impl DeliveryMode {
    /// The numeric code used on the wire (1 or 2).
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::NonPersistent => 1,
            Self::Persistent => 2,
        }
    }

    /// Maps a numeric code back to a delivery mode.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::NonPersistent),
            2 => Some(Self::Persistent),
            _ => None,
        }
    }
}

/// Error returned when a delivery mode string is not recognised.
#[derive(Debug, thiserror::Error)]
#[error("unknown delivery mode: {0}")]
pub struct UnknownDeliveryMode(pub String);

impl FromStr for DeliveryMode {
    type Err = UnknownDeliveryMode;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "PERSISTENT" | "2" => Ok(Self::Persistent),
            "NON_PERSISTENT" | "NONPERSISTENT" | "1" => Ok(Self::NonPersistent),
            _ => Err(UnknownDeliveryMode(value.to_string())),
        }
    }
}

/// A value that may be stored as a message property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// A boolean property.
    Bool(bool),

    /// An integral property.
    Long(i64),

    /// A floating point property.
    Double(f64),

    /// A string property.
    String(String),
}

impl PropertyValue {
    /// Returns the string value, if this is a string property.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the integral value, if this is a long property.
    #[must_use]
    pub const fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Long(value) => write!(f, "{value}"),
            Self::Double(value) => write!(f, "{value}"),
            Self::String(value) => f.write_str(value),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Long(i64::from(value))
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// The payload of a message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    /// No payload.
    #[default]
    Empty,

    /// A text payload.
    Text(String),

    /// An opaque binary payload.
    Bytes(Bytes),

    /// A map of named primitive values.
    Map(BTreeMap<String, PropertyValue>),
}

impl MessageBody {
    /// Returns the text, if this is a text body.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<&str> for MessageBody {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MessageBody {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Bytes> for MessageBody {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

/// A message with its standard headers and user properties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The payload.
    pub body: MessageBody,

    /// Assigned by the provider on send.
    pub message_id: Option<String>,

    /// Value used to tie a reply to its request.
    pub correlation_id: Option<String>,

    /// Where replies to this message should be sent.
    pub reply_to: Option<Destination>,

    /// Set by the provider on send.
    pub destination: Option<Destination>,

    /// Persistence requested for this message.
    pub delivery_mode: DeliveryMode,

    /// 0 (lowest) to 9 (highest).
    pub priority: u8,

    /// After this instant the provider discards the message.
    pub expiration: Option<SystemTime>,

    /// Set by the provider on send.
    pub timestamp: Option<SystemTime>,

    /// Application-defined message type.
    pub message_type: Option<String>,

    /// Whether the provider has delivered this message before.
    pub redelivered: bool,

    /// User properties.
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            body: MessageBody::Empty,
            message_id: None,
            correlation_id: None,
            reply_to: None,
            destination: None,
            delivery_mode: DeliveryMode::default(),
            priority: DEFAULT_PRIORITY,
            expiration: None,
            timestamp: None,
            message_type: None,
            redelivered: false,
            properties: BTreeMap::new(),
        }
    }
}

impl Message {
    /// Creates a message with the given body.
    pub fn new<B>(body: B) -> Self
    where
        B: Into<MessageBody>,
    {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Creates a text message.
    pub fn text<K>(text: K) -> Self
    where
        K: Into<String>,
    {
        Self::new(MessageBody::Text(text.into()))
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id<K>(mut self, correlation_id: K) -> Self
    where
        K: Into<String>,
    {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the reply destination.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: Destination) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Returns a property rendered as a string, if present.
    #[must_use]
    pub fn string_property(&self, key: &str) -> Option<String> {
        self.properties.get(key).map(ToString::to_string)
    }

    /// Whether the message expired before `now`.
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expiration.is_some_and(|expiration| expiration <= now)
    }
}
