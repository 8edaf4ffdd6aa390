//! Outbound frames and inbound line parsing.
//!
//! Every line on the transport is a newline-terminated JSON array.
//!
//! # Outbound
//!
//! ```json
//! [[correlationId, responseKind], [tag, ...args]]
//! ```
//!
//! # Inbound
//!
//! ```json
//! [correlationId, responseKind, ...payload]   // correlationId > 0
//! [correlationId, [payload...]]               // correlationId > 0, kind omitted
//! [0, diagnosticKind, ...data]                // unsolicited diagnostic
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::ser::{Serialize, SerializeTuple, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::CorrelationId;

use super::command::CommandBody;
use super::event::{Diagnostic, DiagnosticKind};

// ============================================================================
// ResponseKind
// ============================================================================

/// How the firmware should format its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ResponseKind {
    /// Plain acknowledgement.
    #[default]
    Acknowledge = 1,
    /// Full state reply used by diagnostic commands.
    Test = 2,
}

impl ResponseKind {
    /// Returns the wire value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a wire value.
    #[inline]
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Acknowledge),
            2 => Some(Self::Test),
            _ => None,
        }
    }
}

// ============================================================================
// Request
// ============================================================================

/// A command frame ready to be written to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Correlation id assigned by the queue.
    pub id: CorrelationId,

    /// Expected reply format.
    pub kind: ResponseKind,

    /// Vocabulary tag and arguments.
    pub body: CommandBody,
}

impl Request {
    /// Creates a new request.
    #[inline]
    #[must_use]
    pub fn new(id: CorrelationId, kind: ResponseKind, body: CommandBody) -> Self {
        Self { id, kind, body }
    }

    /// Serializes the request as one newline-terminated line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut frame = serializer.serialize_tuple(2)?;
        frame.serialize_element(&(self.id, self.kind.as_u8()))?;
        frame.serialize_element(&self.body.to_wire())?;
        frame.end()
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// A parsed inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to a pending command.
    Reply(Reply),
    /// Unsolicited diagnostic message.
    Diagnostic(Diagnostic),
}

/// Reply payload for one correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Correlation id of the originating command.
    pub id: CorrelationId,

    /// Echoed response kind, when the firmware sent one.
    pub kind: Option<u8>,

    /// Remaining elements of the line.
    pub payload: Vec<Value>,
}

impl Inbound {
    /// Parses one inbound line.
    ///
    /// A missing or zero correlation id marks a diagnostic message. In a
    /// reply, a numeric second element is always taken as the echoed kind,
    /// so kind-less payloads must not start with a bare number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedLine`] if the line is not a JSON array or
    /// its header is unusable.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| Error::malformed_line(trimmed, e.to_string()))?;

        let Value::Array(elements) = value else {
            return Err(Error::malformed_line(trimmed, "expected a JSON array"));
        };

        let mut elements = elements.into_iter();
        let raw_id = match elements.next() {
            None | Some(Value::Null) => 0,
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| Error::malformed_line(trimmed, "correlation id is not unsigned"))?,
            Some(_) => {
                return Err(Error::malformed_line(
                    trimmed,
                    "correlation id is not a number",
                ));
            }
        };

        if raw_id == 0 {
            let kind = match elements.next() {
                Some(Value::Number(n)) => n.as_u64().unwrap_or(u64::MAX),
                _ => u64::MAX,
            };
            return Ok(Self::Diagnostic(Diagnostic {
                kind: DiagnosticKind::from_wire(kind),
                data: elements.collect(),
            }));
        }

        let id = CorrelationId::from_wire(raw_id).ok_or_else(|| {
            Error::malformed_line(trimmed, format!("correlation id {raw_id} out of range"))
        })?;

        let mut rest: Vec<Value> = elements.collect();
        let kind = match rest.first() {
            Some(Value::Number(n)) => {
                let kind = n.as_u64().and_then(|k| u8::try_from(k).ok());
                rest.remove(0);
                kind
            }
            _ => None,
        };

        Ok(Self::Reply(Reply {
            id,
            kind,
            payload: rest,
        }))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::DeviceId;
    use serde_json::json;

    fn id(n: u16) -> CorrelationId {
        CorrelationId::new(n).expect("valid id")
    }

    #[test]
    fn test_request_serialization() {
        let request = Request::new(id(1), ResponseKind::Acknowledge, CommandBody::GetState);
        assert_eq!(request.to_line().expect("serialize"), "[[1,1],[1]]\n");
    }

    #[test]
    fn test_request_with_arguments() {
        let request = Request::new(
            id(42),
            ResponseKind::Test,
            CommandBody::SetDeviceId {
                device_id: DeviceId::new(77),
            },
        );
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value, json!([[42, 2], [7, 77]]));
    }

    #[test]
    fn test_parse_reply_with_kind() {
        let inbound = Inbound::parse("[5, 1, 7, 50]").expect("parse");
        let Inbound::Reply(reply) = inbound else {
            panic!("expected reply");
        };
        assert_eq!(reply.id, id(5));
        assert_eq!(reply.kind, Some(1));
        assert_eq!(reply.payload, vec![json!(7), json!(50)]);
    }

    #[test]
    fn test_parse_reply_without_kind() {
        let inbound = Inbound::parse("[1, [7, 50, 150, []]]\r\n").expect("parse");
        let Inbound::Reply(reply) = inbound else {
            panic!("expected reply");
        };
        assert_eq!(reply.kind, None);
        assert_eq!(reply.payload, vec![json!([7, 50, 150, []])]);
    }

    #[test]
    fn test_parse_leading_number_is_taken_as_kind() {
        let inbound = Inbound::parse("[3, 7, 50, 150, []]").expect("parse");
        let Inbound::Reply(reply) = inbound else {
            panic!("expected reply");
        };
        assert_eq!(reply.kind, Some(7));
        assert_eq!(reply.payload, vec![json!(50), json!(150), json!([])]);

        // Out-of-range kinds are still consumed
        let Inbound::Reply(reply) = Inbound::parse("[3, 4096, 1]").expect("parse") else {
            panic!("expected reply");
        };
        assert_eq!(reply.kind, None);
        assert_eq!(reply.payload, vec![json!(1)]);
    }

    #[test]
    fn test_parse_diagnostic() {
        let inbound = Inbound::parse(r#"[0, 130, "overcurrent", 3]"#).expect("parse");
        let Inbound::Diagnostic(diagnostic) = inbound else {
            panic!("expected diagnostic");
        };
        assert_eq!(diagnostic.kind, DiagnosticKind::Error);
        assert_eq!(diagnostic.data, vec![json!("overcurrent"), json!(3)]);
    }

    #[test]
    fn test_parse_empty_array_is_diagnostic() {
        let inbound = Inbound::parse("[]").expect("parse");
        assert!(matches!(inbound, Inbound::Diagnostic(_)));
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            Inbound::parse("[1, 2"),
            Err(Error::MalformedLine { .. })
        ));
        assert!(matches!(
            Inbound::parse(r#"{"id": 1}"#),
            Err(Error::MalformedLine { .. })
        ));
        assert!(matches!(
            Inbound::parse(r#"["one", 1]"#),
            Err(Error::MalformedLine { .. })
        ));
        assert!(matches!(
            Inbound::parse("[10000, 1]"),
            Err(Error::MalformedLine { .. })
        ));
    }

    #[test]
    fn test_response_kind_roundtrip() {
        assert_eq!(ResponseKind::from_u8(1), Some(ResponseKind::Acknowledge));
        assert_eq!(ResponseKind::from_u8(2), Some(ResponseKind::Test));
        assert_eq!(ResponseKind::from_u8(9), None);
        assert_eq!(ResponseKind::default(), ResponseKind::Acknowledge);
    }
}
