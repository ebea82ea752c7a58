use crate::error::Result;
use crate::exchange::headers;

use std::error::Error as StdError;
use std::fmt;

use courier_messaging::{Message, PropertyValue};
use serde::{Deserialize, Serialize};

/// A responder failure carried back to the requester.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    /// Type name of the responder's error.
    pub kind: String,

    /// Display text of the error.
    pub message: String,

    /// Display text of each error in the source chain, outermost first.
    #[serde(default)]
    pub causes: Vec<String>,
}

impl RemoteFailure {
    /// Captures an error and its source chain.
    pub fn capture<E>(error: &E) -> Self
    where
        E: StdError + 'static,
    {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        Self {
            kind: std::any::type_name::<E>().to_string(),
            message: error.to_string(),
            causes,
        }
    }

    /// Encodes the failure as a reply message.
    ///
    /// # Errors
    ///
    /// Returns an error if the failure cannot be serialized.
    pub fn to_message(&self) -> Result<Message> {
        Ok(Message::text(serde_json::to_string(self)?)
            .with_property(headers::TRANSFER_EXCEPTION, true))
    }

    /// Decodes a failure from a reply, if the reply carries one.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply is marked as a failure but its body is
    /// not a valid encoded failure.
    pub fn from_message(message: &Message) -> Result<Option<Self>> {
        if message.properties.get(headers::TRANSFER_EXCEPTION) != Some(&PropertyValue::Bool(true)) {
            return Ok(None);
        }

        let body = message.body.as_text().unwrap_or_default();
        Ok(Some(serde_json::from_str(body)?))
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        for cause in &self.causes {
            write!(f, ", caused by: {cause}")?;
        }
        Ok(())
    }
}

impl StdError for RemoteFailure {}
