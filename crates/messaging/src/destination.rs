use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix selecting a queue in a destination name.
pub const QUEUE_PREFIX: &str = "queue:";

/// Prefix selecting a topic in a destination name.
pub const TOPIC_PREFIX: &str = "topic:";

/// Prefix used when rendering provider temporary queues.
pub const TEMPORARY_QUEUE_PREFIX: &str = "temp-queue:";

/// A place messages are sent to and consumed from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// A named point-to-point queue.
    Queue(String),

    /// A named publish/subscribe topic.
    Topic(String),

    /// A queue allocated by the provider and owned by a single connection.
    TemporaryQueue(String),
}

impl Destination {
    /// Creates a queue destination.
    pub fn queue<K>(name: K) -> Self
    where
        K: Into<String>,
    {
        Self::Queue(name.into())
    }

    /// Creates a topic destination.
    pub fn topic<K>(name: K) -> Self
    where
        K: Into<String>,
    {
        Self::Topic(name.into())
    }

    /// Parses a destination name, honouring the `queue:`, `topic:` and
    /// `temp-queue:` prefixes. Names without a prefix are queues.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        if let Some(rest) = name.strip_prefix(TOPIC_PREFIX) {
            Self::Topic(strip_slashes(rest).to_string())
        } else if let Some(rest) = name.strip_prefix(TEMPORARY_QUEUE_PREFIX) {
            Self::TemporaryQueue(strip_slashes(rest).to_string())
        } else {
            Self::Queue(normalize_destination_name(name).to_string())
        }
    }

    /// The name without any type prefix.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Queue(name) | Self::Topic(name) | Self::TemporaryQueue(name) => name,
        }
    }

    /// Whether this destination was allocated by the provider.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::TemporaryQueue(_))
    }

    /// Whether this destination is a topic.
    #[must_use]
    pub const fn is_topic(&self) -> bool {
        matches!(self, Self::Topic(_))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(name) => write!(f, "{QUEUE_PREFIX}//{name}"),
            Self::Topic(name) => write!(f, "{TOPIC_PREFIX}//{name}"),
            Self::TemporaryQueue(name) => write!(f, "{TEMPORARY_QUEUE_PREFIX}//{name}"),
        }
    }
}

impl From<Destination> for String {
    fn from(destination: Destination) -> Self {
        destination.to_string()
    }
}

/// Strips a `queue:` or `topic:` prefix (and any `//` following it).
#[must_use]
pub fn normalize_destination_name(name: &str) -> &str {
    let name = name
        .strip_prefix(QUEUE_PREFIX)
        .or_else(|| name.strip_prefix(TOPIC_PREFIX))
        .unwrap_or(name);
    strip_slashes(name)
}

fn strip_slashes(name: &str) -> &str {
    name.strip_prefix("//").unwrap_or(name)
}
