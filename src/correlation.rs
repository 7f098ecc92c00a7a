//! Correlation tokens route replies back to the instance that is waiting for them.
//!
//! A token is the pair `(instance_id, routing_label)` carried in the
//! [`CORRELATION_HEADER`] header of a message as `"{instance_id}|{routing_label}"`.
//! Messages without the header are start inputs; the orchestrator mints the
//! instance id for those.

use crate::bus::Message;
use crate::{InstanceId, OrchestratorError};
use std::fmt;

/// Well-known header that carries the encoded token.
pub const CORRELATION_HEADER: &str = "durohost-correlation";

/// Separates the instance id from the routing label.
pub const SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationToken {
    pub instance_id: InstanceId,
    pub routing_label: String,
}

impl CorrelationToken {
    /// Build a token, rejecting labels that would not survive a round trip.
    /// An empty label has no definition to route to and is rejected too.
    pub fn new(instance_id: InstanceId, routing_label: impl Into<String>) -> Result<Self, OrchestratorError> {
        let routing_label = routing_label.into();
        if routing_label.is_empty() || routing_label.contains(SEPARATOR) {
            return Err(OrchestratorError::Encoding { label: routing_label });
        }
        Ok(Self {
            instance_id,
            routing_label,
        })
    }

    pub fn encode(&self) -> String {
        format!("{}{SEPARATOR}{}", self.instance_id, self.routing_label)
    }

    /// Parse an encoded token.
    ///
    /// # Errors
    ///
    /// `MalformedCorrelation` when the separator (and with it the label) is
    /// missing, the label is empty or holds a second separator, or the id
    /// segment is not a UUID.
    pub fn parse(token: &str) -> Result<Self, OrchestratorError> {
        let malformed = |reason: &str| OrchestratorError::MalformedCorrelation {
            token: token.to_string(),
            reason: reason.to_string(),
        };
        let (id, label) = token
            .split_once(SEPARATOR)
            .ok_or_else(|| malformed("routing label segment is missing"))?;
        if label.is_empty() {
            return Err(malformed("routing label is empty"));
        }
        if label.contains(SEPARATOR) {
            return Err(malformed("routing label contains a separator"));
        }
        let instance_id = uuid::Uuid::parse_str(id.trim()).map_err(|e| malformed(&format!("invalid instance id: {e}")))?;
        Ok(Self {
            instance_id,
            routing_label: label.to_string(),
        })
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.instance_id, self.routing_label)
    }
}

/// Encode `(instance_id, routing_label)` into its wire form.
pub fn encode(instance_id: InstanceId, routing_label: &str) -> Result<String, OrchestratorError> {
    CorrelationToken::new(instance_id, routing_label).map(|t| t.encode())
}

/// Read the token from `message`, if it carries one.
///
/// `Ok(None)` means the message is a start input. A header that is present
/// but unparseable is an error, never `None`.
pub fn try_decode(message: &Message) -> Result<Option<CorrelationToken>, OrchestratorError> {
    message.header(CORRELATION_HEADER).map(CorrelationToken::parse).transpose()
}

/// Read the token from `message`, treating its absence as malformed.
pub fn decode(message: &Message) -> Result<CorrelationToken, OrchestratorError> {
    try_decode(message)?.ok_or_else(|| OrchestratorError::MalformedCorrelation {
        token: String::new(),
        reason: format!("message of type {:?} carries no correlation token", message.type_tag),
    })
}
