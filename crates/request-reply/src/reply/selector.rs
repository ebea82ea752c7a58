use crate::correlator::Correlator;

use std::sync::Arc;

use courier_messaging::selector::quote;
use courier_messaging::{Message, Selector};

const NO_PENDING_KEYS: &str = "CourierDummyJmsMessageSelector";

/// Accepts only replies whose correlation key is pending in one correlator,
/// so several requesters can share a reply queue.
#[derive(Debug)]
pub struct PendingKeysSelector {
    correlator: Arc<Correlator<Message>>,
    correlation_property: Option<String>,
}

impl PendingKeysSelector {
    /// Creates a selector over the keys pending in `correlator`.
    #[must_use]
    pub const fn new(
        correlator: Arc<Correlator<Message>>,
        correlation_property: Option<String>,
    ) -> Self {
        Self {
            correlator,
            correlation_property,
        }
    }
}

impl Selector for PendingKeysSelector {
    fn matches(&self, message: &Message) -> bool {
        super::correlation_key(message, self.correlation_property.as_deref())
            .is_some_and(|key| self.correlator.is_pending(&key))
    }

    fn expression(&self) -> String {
        let field = self
            .correlation_property
            .as_deref()
            .unwrap_or("JMSCorrelationID");

        let keys = self.correlator.pending_keys();
        if keys.is_empty() {
            return format!("{field}='{NO_PENDING_KEYS}'");
        }

        let quoted: Vec<String> = keys.iter().map(|key| format!("'{}'", quote(key))).collect();
        format!("{field} IN ({})", quoted.join(","))
    }
}
