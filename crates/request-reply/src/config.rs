use crate::error::{Error, Result};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use courier_messaging::message::{DEFAULT_PRIORITY, MAX_PRIORITY};
use courier_messaging::{DeliveryMode, Destination};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use url::Url;

/// URI scheme of JMS endpoints.
pub const SCHEME: &str = "jms";

/// Where replies to requests are received.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyToType {
    /// A provider temporary queue.
    Temporary,

    /// A fixed queue shared with other requesters; a selector picks our replies.
    Shared,

    /// A fixed queue used only by this requester.
    Exclusive,
}

impl FromStr for ReplyToType {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "temporary" => Ok(Self::Temporary),
            "shared" => Ok(Self::Shared),
            "exclusive" => Ok(Self::Exclusive),
            _ => Err(format!("unknown reply-to type {value}")),
        }
    }
}

/// Scope of a temporary reply queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemporaryAffinity {
    /// Each producer owns a temporary queue.
    #[default]
    Producer,

    /// All producers of a component share one temporary queue.
    Component,
}

impl FromStr for TemporaryAffinity {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "producer" => Ok(Self::Producer),
            "component" => Ok(Self::Component),
            _ => Err(format!("unknown temporary affinity {value}")),
        }
    }
}

/// How a reply is tied to its request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CorrelationStrategy {
    /// The caller's (or a generated) correlation id.
    #[default]
    CorrelationId,

    /// The provider message id of the request.
    MessageId,
}

/// Reply destination handling, resolved once from the endpoint options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyStrategy {
    /// Replies arrive on a provider temporary queue.
    Temporary {
        /// Who owns the temporary queue.
        affinity: TemporaryAffinity,
    },

    /// Replies arrive on a queue shared with other requesters.
    Shared {
        /// The reply queue.
        destination: Destination,
    },

    /// Replies arrive on a queue owned by this requester.
    Exclusive {
        /// The reply queue.
        destination: Destination,
    },
}

impl ReplyStrategy {
    /// Short name used in logs.
    #[must_use]
    pub const fn kind(&self) -> ReplyToType {
        match self {
            Self::Temporary { .. } => ReplyToType::Temporary,
            Self::Shared { .. } => ReplyToType::Shared,
            Self::Exclusive { .. } => ReplyToType::Exclusive,
        }
    }
}

impl fmt::Display for ReplyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temporary { affinity } => write!(f, "temporary ({affinity:?} affinity)"),
            Self::Shared { destination } => write!(f, "shared {destination}"),
            Self::Exclusive { destination } => write!(f, "exclusive {destination}"),
        }
    }
}

/// Quality of service options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QosOptions {
    /// Apply `delivery_mode`, `priority` and `time_to_live` when sending.
    pub explicit_qos_enabled: bool,

    /// Use the QoS values carried by the exchange headers instead.
    pub preserve_message_qos: bool,

    /// Delivery mode of sent messages.
    pub delivery_mode: DeliveryMode,

    /// Priority of sent messages when explicit QoS is enabled.
    pub priority: u8,

    /// Time to live of sent messages.
    #[serde(with = "option_millis")]
    pub time_to_live: Option<Duration>,
}

impl Default for QosOptions {
    fn default() -> Self {
        Self {
            explicit_qos_enabled: false,
            preserve_message_qos: false,
            delivery_mode: DeliveryMode::Persistent,
            priority: DEFAULT_PRIORITY,
            time_to_live: None,
        }
    }
}

/// Options of a JMS endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Fixed reply queue.
    pub reply_to: Option<String>,

    /// Reply destination strategy. Defaults to shared when `reply_to` is set,
    /// temporary otherwise.
    pub reply_to_type: Option<ReplyToType>,

    /// Reply destination stamped on requests instead of the one we listen on.
    pub reply_to_override: Option<String>,

    /// Correlate on the provider message id of the request.
    #[serde(rename = "useMessageIDAsCorrelationID")]
    pub use_message_id_as_correlation_id: bool,

    /// Property carrying the correlation value instead of `JMSCorrelationID`.
    pub correlation_property: Option<String>,

    /// How long a request waits for its reply.
    #[serde(with = "millis")]
    pub request_timeout: Duration,

    /// How often expired requests are purged.
    #[serde(with = "millis")]
    pub request_timeout_checker_interval: Duration,

    /// Listeners on the reply destination.
    pub reply_to_concurrent_consumers: usize,

    /// Listeners on the request destination.
    pub concurrent_consumers: usize,

    /// Scope of temporary reply queues.
    pub temporary_affinity: TemporaryAffinity,

    /// Send responder failures back to the requester.
    pub transfer_exception: bool,

    /// Never reply, and never set `JMSReplyTo` on sent messages.
    pub disable_reply_to: bool,

    /// Allow a consumer to reply to the destination it consumes from.
    pub reply_to_same_destination_allowed: bool,

    /// Quality of service.
    #[serde(flatten)]
    pub qos: QosOptions,

    /// Do not derive a time to live from the request timeout.
    pub disable_time_to_live: bool,

    /// Pause before reconnecting after a connection loss.
    #[serde(with = "millis")]
    pub recovery_interval: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            reply_to: None,
            reply_to_type: None,
            reply_to_override: None,
            use_message_id_as_correlation_id: false,
            correlation_property: None,
            request_timeout: Duration::from_secs(20),
            request_timeout_checker_interval: Duration::from_secs(1),
            reply_to_concurrent_consumers: 1,
            concurrent_consumers: 1,
            temporary_affinity: TemporaryAffinity::Producer,
            transfer_exception: false,
            disable_reply_to: false,
            reply_to_same_destination_allowed: false,
            qos: QosOptions::default(),
            disable_time_to_live: false,
            recovery_interval: Duration::from_secs(5),
        }
    }
}

impl EndpointConfig {
    /// Correlation strategy implied by the options.
    #[must_use]
    pub const fn correlation_strategy(&self) -> CorrelationStrategy {
        if self.use_message_id_as_correlation_id {
            CorrelationStrategy::MessageId
        } else {
            CorrelationStrategy::CorrelationId
        }
    }

    /// Resolves the reply destination strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidReplyToConfiguration`] when a temporary reply
    /// destination is combined with a fixed `reply_to`, or a shared/exclusive
    /// one lacks it.
    pub fn reply_strategy(&self) -> Result<ReplyStrategy> {
        let reply_to = self.reply_to.as_deref().filter(|name| !name.is_empty());

        match (self.reply_to_type, reply_to) {
            (Some(ReplyToType::Temporary), Some(name)) => {
                Err(Error::InvalidReplyToConfiguration(format!(
                    "replyToType Temporary cannot be combined with a fixed replyTo ({name})"
                )))
            }
            (Some(ReplyToType::Temporary) | None, None) => Ok(ReplyStrategy::Temporary {
                affinity: self.temporary_affinity,
            }),
            (Some(kind @ (ReplyToType::Shared | ReplyToType::Exclusive)), None) => {
                Err(Error::InvalidReplyToConfiguration(format!(
                    "replyToType {kind:?} requires replyTo"
                )))
            }
            (Some(ReplyToType::Shared) | None, Some(name)) => Ok(ReplyStrategy::Shared {
                destination: Destination::parse(name),
            }),
            (Some(ReplyToType::Exclusive), Some(name)) => Ok(ReplyStrategy::Exclusive {
                destination: Destination::parse(name),
            }),
        }
    }

    /// Checks option values that do not depend on the reply strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] describing the first bad option.
    pub fn validate(&self) -> Result<()> {
        if self.concurrent_consumers == 0 {
            return Err(Error::InvalidConfiguration(
                "concurrentConsumers must be at least 1".to_string(),
            ));
        }
        if self.reply_to_concurrent_consumers == 0 {
            return Err(Error::InvalidConfiguration(
                "replyToConcurrentConsumers must be at least 1".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidConfiguration(
                "requestTimeout must be positive".to_string(),
            ));
        }
        if self.request_timeout_checker_interval.is_zero() {
            return Err(Error::InvalidConfiguration(
                "requestTimeoutCheckerInterval must be positive".to_string(),
            ));
        }
        if self.qos.priority > MAX_PRIORITY {
            return Err(Error::InvalidConfiguration(format!(
                "priority must be between 0 and {MAX_PRIORITY}"
            )));
        }
        Ok(())
    }

    /// Applies one URI option.
    fn set_option(&mut self, name: &str, value: &str) -> std::result::Result<(), String> {
        match name {
            "replyTo" => self.reply_to = non_empty(value),
            "replyToType" => self.reply_to_type = Some(value.parse()?),
            "replyToOverride" => self.reply_to_override = non_empty(value),
            "useMessageIDAsCorrelationID" => {
                self.use_message_id_as_correlation_id = parse_bool(name, value)?;
            }
            "correlationProperty" => self.correlation_property = non_empty(value),
            "requestTimeout" => self.request_timeout = parse_millis(name, value)?,
            "requestTimeoutCheckerInterval" => {
                self.request_timeout_checker_interval = parse_millis(name, value)?;
            }
            "replyToConcurrentConsumers" => {
                self.reply_to_concurrent_consumers = parse_number(name, value)?;
            }
            "concurrentConsumers" => self.concurrent_consumers = parse_number(name, value)?,
            "temporaryAffinity" => self.temporary_affinity = value.parse()?,
            "transferException" => self.transfer_exception = parse_bool(name, value)?,
            "disableReplyTo" => self.disable_reply_to = parse_bool(name, value)?,
            "replyToSameDestinationAllowed" => {
                self.reply_to_same_destination_allowed = parse_bool(name, value)?;
            }
            "explicitQosEnabled" => self.qos.explicit_qos_enabled = parse_bool(name, value)?,
            "preserveMessageQos" => self.qos.preserve_message_qos = parse_bool(name, value)?,
            "deliveryMode" => {
                self.qos.delivery_mode = value.parse().map_err(|e| format!("{e}"))?;
            }
            "priority" => self.qos.priority = parse_number(name, value)?,
            "timeToLive" => {
                let millis: i64 = parse_number(name, value)?;
                self.qos.time_to_live = u64::try_from(millis)
                    .ok()
                    .filter(|millis| *millis > 0)
                    .map(Duration::from_millis);
            }
            "disableTimeToLive" => self.disable_time_to_live = parse_bool(name, value)?,
            "recoveryInterval" => self.recovery_interval = parse_millis(name, value)?,
            _ => return Err(format!("unknown option {name}")),
        }
        Ok(())
    }
}

/// Parses `jms:[queue:|topic:]name?option=value&...` on top of `defaults`.
///
/// # Errors
///
/// Returns [`Error::InvalidUri`] for a malformed URI, a foreign scheme, an
/// empty destination, an unknown option or an unparsable value.
pub fn parse_uri(uri: &str, defaults: &EndpointConfig) -> Result<(Destination, EndpointConfig)> {
    let url = Url::parse(uri).map_err(|e| Error::invalid_uri(uri, e.to_string()))?;

    if url.scheme() != SCHEME {
        return Err(Error::invalid_uri(
            uri,
            format!("expected scheme {SCHEME}, found {}", url.scheme()),
        ));
    }

    let path = percent_decode_str(url.path())
        .decode_utf8()
        .map_err(|e| Error::invalid_uri(uri, e.to_string()))?;
    let destination = Destination::parse(&path);
    if destination.name().is_empty() {
        return Err(Error::invalid_uri(uri, "missing destination name"));
    }

    let mut config = defaults.clone();
    for (name, value) in url.query_pairs() {
        config
            .set_option(&name, &value)
            .map_err(|reason| Error::invalid_uri(uri, reason))?;
    }

    Ok((destination, config))
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_bool(name: &str, value: &str) -> std::result::Result<bool, String> {
    value
        .parse()
        .map_err(|_| format!("{name} expects true or false, found {value}"))
}

fn parse_number<N>(name: &str, value: &str) -> std::result::Result<N, String>
where
    N: FromStr,
{
    value
        .parse()
        .map_err(|_| format!("{name} expects a number, found {value}"))
}

fn parse_millis(name: &str, value: &str) -> std::result::Result<Duration, String> {
    parse_number(name, value).map(Duration::from_millis)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<i64>::deserialize(deserializer)?
            .and_then(|millis| u64::try_from(millis).ok())
            .filter(|millis| *millis > 0)
            .map(Duration::from_millis))
    }
}
