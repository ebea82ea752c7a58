use crate::exchange::{Exchange, ExchangePattern, HeaderValue, Headers, headers};

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use courier_messaging::{DeliveryMode, Destination, Message, PropertyValue};
use tracing::trace;

/// Encodes header names into valid message property names and back.
pub trait KeyFormatStrategy: Debug + Send + Sync + 'static {
    /// Encodes a header name for use as a property name.
    fn encode_key(&self, key: &str) -> String;

    /// Decodes a property name back into a header name.
    fn decode_key(&self, key: &str) -> String;
}

/// Replaces `.` with `_DOT_` and `-` with `_HYPHEN_`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultKeyFormat;

impl KeyFormatStrategy for DefaultKeyFormat {
    fn encode_key(&self, key: &str) -> String {
        key.replace('.', "_DOT_").replace('-', "_HYPHEN_")
    }

    fn decode_key(&self, key: &str) -> String {
        key.replace("_HYPHEN_", "-").replace("_DOT_", ".")
    }
}

/// Leaves names untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThroughKeyFormat;

impl KeyFormatStrategy for PassThroughKeyFormat {
    fn encode_key(&self, key: &str) -> String {
        key.to_string()
    }

    fn decode_key(&self, key: &str) -> String {
        key.to_string()
    }
}

/// Decides which headers cross the exchange/message boundary.
pub trait HeaderFilter: Debug + Send + Sync + 'static {
    /// Returns `true` if the header must not become a message property.
    fn filter_outbound(&self, name: &str, value: &HeaderValue) -> bool;

    /// Returns `true` if the property must not become an exchange header.
    fn filter_inbound(&self, name: &str, value: &PropertyValue) -> bool;
}

/// Drops internal `Courier*` headers in both directions.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHeaderFilter;

impl DefaultHeaderFilter {
    fn is_internal(name: &str) -> bool {
        name.starts_with(headers::INTERNAL_PREFIX) || name.starts_with("courier")
    }
}

impl HeaderFilter for DefaultHeaderFilter {
    fn filter_outbound(&self, name: &str, _value: &HeaderValue) -> bool {
        Self::is_internal(name)
    }

    fn filter_inbound(&self, name: &str, _value: &PropertyValue) -> bool {
        Self::is_internal(name)
    }
}

/// Whether `name` is a standard JMS header (`JMS` followed by a letter),
/// as opposed to a provider (`JMSX`) or vendor (`JMS_`) property.
#[must_use]
pub fn is_standard_jms_header(name: &str) -> bool {
    name.starts_with("JMS")
        && !name.starts_with("JMSX")
        && !name.starts_with("JMS_")
        && name.chars().nth(3).is_some_and(char::is_alphabetic)
}

/// Maps between exchanges and provider messages.
#[derive(Clone, Debug)]
pub struct JmsBinding {
    key_format: Arc<dyn KeyFormatStrategy>,
    header_filter: Arc<dyn HeaderFilter>,
}

impl Default for JmsBinding {
    fn default() -> Self {
        Self {
            key_format: Arc::new(DefaultKeyFormat),
            header_filter: Arc::new(DefaultHeaderFilter),
        }
    }
}

impl JmsBinding {
    /// Creates a binding with custom strategies.
    #[must_use]
    pub fn new(
        key_format: Arc<dyn KeyFormatStrategy>,
        header_filter: Arc<dyn HeaderFilter>,
    ) -> Self {
        Self {
            key_format,
            header_filter,
        }
    }

    /// Builds a message from the exchange body and headers.
    #[must_use]
    pub fn make_message(&self, exchange: &Exchange) -> Message {
        let mut message = Message::new(exchange.body.clone());
        self.append_headers(&mut message, &exchange.headers);
        message
    }

    /// Copies headers onto a message: standard JMS headers to header fields,
    /// everything the filter lets through to properties.
    pub fn append_headers(&self, message: &mut Message, headers: &Headers) {
        for (name, value) in headers {
            if is_standard_jms_header(name) {
                Self::apply_standard_header(message, name, value);
            } else if self.header_filter.filter_outbound(name, value) {
                trace!(header = %name, "header filtered");
            } else if let HeaderValue::Value(property) = value {
                message
                    .properties
                    .insert(self.key_format.encode_key(name), property.clone());
            } else {
                trace!(header = %name, "header is not a valid property value, ignoring");
            }
        }
    }

    fn apply_standard_header(message: &mut Message, name: &str, value: &HeaderValue) {
        match name {
            headers::JMS_CORRELATION_ID => {
                message.correlation_id = value.as_string().filter(|id| !id.is_empty());
            }
            headers::JMS_REPLY_TO => {
                message.reply_to = match value {
                    HeaderValue::Destination(destination) => Some(destination.clone()),
                    HeaderValue::Value(PropertyValue::String(name)) if !name.is_empty() => {
                        Some(Destination::parse(name))
                    }
                    _ => None,
                };
            }
            headers::JMS_TYPE => message.message_type = value.as_string(),
            headers::JMS_PRIORITY => {
                if let Some(priority) = value.as_long().and_then(|p| u8::try_from(p).ok()) {
                    message.priority = priority;
                }
            }
            headers::JMS_DELIVERY_MODE => {
                let mode = value.as_long().map_or_else(
                    || value.as_string().and_then(|mode| mode.parse().ok()),
                    DeliveryMode::from_code,
                );
                if let Some(mode) = mode {
                    message.delivery_mode = mode;
                }
            }
            headers::JMS_EXPIRATION => {
                message.expiration = value
                    .as_long()
                    .and_then(|millis| u64::try_from(millis).ok())
                    .filter(|millis| *millis > 0)
                    .map(|millis| UNIX_EPOCH + Duration::from_millis(millis));
            }
            _ => trace!(header = %name, "provider-assigned header ignored"),
        }
    }

    /// Builds headers from a received message.
    #[must_use]
    pub fn extract_headers(&self, message: &Message) -> Headers {
        let mut extracted = Headers::new();

        let mut put = |name: &str, value: Option<HeaderValue>| {
            if let Some(value) = value {
                extracted.insert(name.to_string(), value);
            }
        };
        put(
            headers::JMS_MESSAGE_ID,
            message.message_id.clone().map(HeaderValue::from),
        );
        put(
            headers::JMS_CORRELATION_ID,
            message.correlation_id.clone().map(HeaderValue::from),
        );
        put(
            headers::JMS_REPLY_TO,
            message.reply_to.clone().map(HeaderValue::from),
        );
        put(
            headers::JMS_DESTINATION,
            message.destination.clone().map(HeaderValue::from),
        );
        put(
            headers::JMS_TYPE,
            message.message_type.clone().map(HeaderValue::from),
        );
        put(
            headers::JMS_PRIORITY,
            Some(HeaderValue::from(i64::from(message.priority))),
        );
        put(
            headers::JMS_DELIVERY_MODE,
            Some(HeaderValue::from(message.delivery_mode.code())),
        );
        put(
            headers::JMS_EXPIRATION,
            message.expiration.map(|at| HeaderValue::from(epoch_millis(at))),
        );
        put(
            headers::JMS_TIMESTAMP,
            message.timestamp.map(|at| HeaderValue::from(epoch_millis(at))),
        );
        put(
            headers::JMS_REDELIVERED,
            Some(HeaderValue::from(message.redelivered)),
        );

        for (name, value) in &message.properties {
            let name = self.key_format.decode_key(name);
            if self.header_filter.filter_inbound(&name, value) {
                continue;
            }
            extracted.insert(name, HeaderValue::Value(value.clone()));
        }

        extracted
    }

    /// Builds an exchange from a received request.
    #[must_use]
    pub fn make_exchange(&self, message: &Message, pattern: ExchangePattern) -> Exchange {
        Exchange {
            pattern,
            body: message.body.clone(),
            headers: self.extract_headers(message),
        }
    }
}

fn epoch_millis(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map_or(0, |since| i64::try_from(since.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_header_rule() {
        assert!(is_standard_jms_header("JMSCorrelationID"));
        assert!(is_standard_jms_header("JMSReplyTo"));
        assert!(!is_standard_jms_header("JMSXGroupID"));
        assert!(!is_standard_jms_header("JMS_IBM_Format"));
        assert!(!is_standard_jms_header("JMS1"));
        assert!(!is_standard_jms_header("JMS"));
        assert!(!is_standard_jms_header("foo"));
    }

    #[test]
    fn test_default_key_format() {
        let format = DefaultKeyFormat;

        assert_eq!(format.encode_key("my.header-name"), "my_DOT_header_HYPHEN_name");
        assert_eq!(format.decode_key("my_DOT_header_HYPHEN_name"), "my.header-name");
        assert_eq!(PassThroughKeyFormat.encode_key("a.b"), "a.b");
    }

    #[test]
    fn test_make_message_maps_headers() {
        let exchange = Exchange::in_out("body")
            .with_header(headers::JMS_CORRELATION_ID, "abc")
            .with_header(headers::JMS_REPLY_TO, "queue:replies")
            .with_header(headers::JMS_PRIORITY, 8)
            .with_header(headers::JMS_DELIVERY_MODE, "NON_PERSISTENT")
            .with_header(headers::JMS_MESSAGE_ID, "ID:ignored")
            .with_header(headers::REQUEST_TIMEOUT, 100)
            .with_header("JMSXGroupID", "group")
            .with_header("order.id", 42)
            .with_header("payload", bytes::Bytes::from_static(b"raw"));

        let message = JmsBinding::default().make_message(&exchange);

        assert_eq!(message.correlation_id.as_deref(), Some("abc"));
        assert_eq!(message.reply_to, Some(Destination::queue("replies")));
        assert_eq!(message.priority, 8);
        assert_eq!(message.delivery_mode, DeliveryMode::NonPersistent);
        assert_eq!(message.message_id, None);
        assert_eq!(
            message.properties.get("order_DOT_id"),
            Some(&PropertyValue::Long(42))
        );
        assert_eq!(
            message.properties.get("JMSXGroupID"),
            Some(&PropertyValue::from("group"))
        );
        assert!(!message.properties.contains_key(headers::REQUEST_TIMEOUT));
        assert!(!message.properties.contains_key("payload"));
    }

    #[test]
    fn test_extract_headers_decodes_keys() {
        let mut message = Message::text("x")
            .with_correlation_id("abc")
            .with_property("order_DOT_id", 42)
            .with_property(headers::TRANSFER_EXCEPTION, true);
        message.message_id = Some("ID:1".to_string());

        let extracted = JmsBinding::default().extract_headers(&message);

        assert_eq!(
            extracted.get("order.id"),
            Some(&HeaderValue::Value(PropertyValue::Long(42)))
        );
        assert_eq!(
            extracted.get(headers::JMS_MESSAGE_ID),
            Some(&HeaderValue::from("ID:1"))
        );
        assert_eq!(
            extracted.get(headers::JMS_CORRELATION_ID),
            Some(&HeaderValue::from("abc"))
        );
        assert!(!extracted.contains_key(headers::TRANSFER_EXCEPTION));
    }

    #[test]
    fn test_empty_correlation_header_is_ignored() {
        let exchange = Exchange::in_out("x").with_header(headers::JMS_CORRELATION_ID, "");

        let message = JmsBinding::default().make_message(&exchange);

        assert_eq!(message.correlation_id, None);
    }
}
