use crate::message::Message;

use std::fmt::Debug;

/// A predicate evaluated by the provider before handing a message to a consumer.
///
/// Providers that understand selector expressions may use [`Selector::expression`];
/// in-process providers call [`Selector::matches`] directly. Both must agree.
pub trait Selector: Debug + Send + Sync + 'static {
    /// Whether the consumer should receive `message`.
    fn matches(&self, message: &Message) -> bool;

    /// The equivalent SQL-92 style selector expression.
    fn expression(&self) -> String;
}

/// Matches messages with a given correlation id.
#[derive(Clone, Debug)]
pub struct CorrelationIdSelector {
    correlation_id: String,
}

impl CorrelationIdSelector {
    /// Creates a selector for `correlation_id`.
    pub fn new<K>(correlation_id: K) -> Self
    where
        K: Into<String>,
    {
        Self {
            correlation_id: correlation_id.into(),
        }
    }
}

impl Selector for CorrelationIdSelector {
    fn matches(&self, message: &Message) -> bool {
        message.correlation_id.as_deref() == Some(self.correlation_id.as_str())
    }

    fn expression(&self) -> String {
        format!("JMSCorrelationID='{}'", quote(&self.correlation_id))
    }
}

/// Matches messages whose string property equals a value.
#[derive(Clone, Debug)]
pub struct PropertySelector {
    property: String,
    value: String,
}

impl PropertySelector {
    /// Creates a selector matching `property = value`.
    pub fn new<K, V>(property: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            property: property.into(),
            value: value.into(),
        }
    }
}

impl Selector for PropertySelector {
    fn matches(&self, message: &Message) -> bool {
        message
            .string_property(&self.property)
            .is_some_and(|value| value == self.value)
    }

    fn expression(&self) -> String {
        format!("{}='{}'", self.property, quote(&self.value))
    }
}

/// Escapes single quotes for use inside a selector string literal.
#[must_use]
pub fn quote(value: &str) -> String {
    value.replace('\'', "''")
}
