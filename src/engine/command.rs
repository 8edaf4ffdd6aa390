//! Outbound command with its completion handlers.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde_json::Value;

use crate::error::Result;
use crate::identifiers::CorrelationId;
use crate::protocol::{CommandBody, DeviceState, Request, ResponseKind};

// ============================================================================
// Types
// ============================================================================

/// Converts the raw reply payload into a typed [`Response`].
pub type Transform = Box<dyn FnOnce(Vec<Value>) -> Result<Response> + Send>;

/// Completion handler.
///
/// Receives the (transformed) response and the command it answers.
pub type Callback = Box<dyn FnOnce(&Response, &Command) + Send>;

// ============================================================================
// Response
// ============================================================================

/// A reply after the command's transform has been applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Untransformed payload.
    Raw(Vec<Value>),
    /// Decoded device state.
    State(DeviceState),
}

impl Response {
    /// Returns the decoded state, if this is a state response.
    #[inline]
    #[must_use]
    pub fn as_state(&self) -> Option<&DeviceState> {
        match self {
            Self::State(state) => Some(state),
            Self::Raw(_) => None,
        }
    }
}

/// Transform decoding a device state reply.
#[must_use]
pub fn decode_state() -> Transform {
    Box::new(|payload| DeviceState::from_payload(payload).map(Response::State))
}

// ============================================================================
// Command
// ============================================================================

/// An outbound instruction owned by the correlation engine.
///
/// Built fluently, then handed to
/// [`CommandQueue::enqueue`](super::CommandQueue::enqueue). After enqueue
/// only the id is ever written.
///
/// # Example
///
/// ```ignore
/// let command = Command::new(CommandBody::GetState)
///     .with_transform(decode_state())
///     .on_complete(|response, _| println!("{response:?}"));
/// ```
pub struct Command {
    /// Correlation id, assigned at enqueue unless pre-allocated.
    id: Option<CorrelationId>,
    /// Vocabulary tag and arguments.
    body: CommandBody,
    /// Reply format requested from the firmware.
    kind: ResponseKind,
    /// Optional reply decoder.
    transform: Option<Transform>,
    /// Completion handlers in registration order.
    callbacks: Vec<Callback>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("body", &self.body)
            .field("kind", &self.kind)
            .field("transform", &self.transform.is_some())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl Command {
    /// Creates a command expecting a plain acknowledgement.
    #[inline]
    #[must_use]
    pub fn new(body: CommandBody) -> Self {
        Self {
            id: None,
            body,
            kind: ResponseKind::Acknowledge,
            transform: None,
            callbacks: Vec::new(),
        }
    }

    /// Uses a pre-allocated correlation id.
    #[inline]
    #[must_use]
    pub fn with_id(mut self, id: CorrelationId) -> Self {
        self.id = Some(id);
        self
    }

    /// Requests a different reply format.
    #[inline]
    #[must_use]
    pub fn with_kind(mut self, kind: ResponseKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the reply decoder.
    #[inline]
    #[must_use]
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Appends a completion handler.
    #[inline]
    #[must_use]
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Response, &Command) + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Appends already boxed completion handlers.
    #[inline]
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: Vec<Callback>) -> Self {
        self.callbacks.extend(callbacks);
        self
    }

    /// Returns the correlation id, if assigned.
    #[inline]
    #[must_use]
    pub fn id(&self) -> Option<CorrelationId> {
        self.id
    }

    /// Returns the command body.
    #[inline]
    #[must_use]
    pub fn body(&self) -> &CommandBody {
        &self.body
    }

    /// Returns the requested reply format.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    /// Assigns the correlation id.
    pub(crate) fn assign_id(&mut self, id: CorrelationId) {
        self.id = Some(id);
    }

    /// Builds the wire frame, once an id is assigned.
    #[must_use]
    pub fn request(&self) -> Option<Request> {
        self.id
            .map(|id| Request::new(id, self.kind, self.body.clone()))
    }

    /// Applies the transform and fans the response out to every callback
    /// in registration order.
    ///
    /// # Errors
    ///
    /// Returns the transform's error; callbacks are not invoked then.
    pub(crate) fn complete(mut self, payload: Vec<Value>) -> Result<Response> {
        let response = match self.transform.take() {
            Some(transform) => transform(payload)?,
            None => Response::Raw(payload),
        };

        let callbacks = std::mem::take(&mut self.callbacks);
        for callback in callbacks {
            callback(&response, &self);
        }

        Ok(response)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let command = Command::new(CommandBody::ResetDevice);
        assert_eq!(command.id(), None);
        assert_eq!(command.kind(), ResponseKind::Acknowledge);
        assert!(command.request().is_none());
    }

    #[test]
    fn test_callbacks_run_in_order_with_transformed_response() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&seen);
        let second = Arc::clone(&seen);

        let mut command = Command::new(CommandBody::GetState)
            .with_transform(decode_state())
            .on_complete(move |response, _| {
                let id = response.as_state().map(|s| s.device_id.get());
                first.lock().push(("first", id));
            })
            .on_complete(move |response, command| {
                assert_eq!(command.body(), &CommandBody::GetState);
                let id = response.as_state().map(|s| s.device_id.get());
                second.lock().push(("second", id));
            });
        command.assign_id(CorrelationId::FIRST);

        let response = command
            .complete(vec![json!(7), json!(50), json!(150), json!([])])
            .expect("complete");

        assert!(response.as_state().is_some());
        assert_eq!(
            *seen.lock(),
            vec![("first", Some(7)), ("second", Some(7))]
        );
    }

    #[test]
    fn test_transform_failure_skips_callbacks() {
        let called = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&called);
        let command = Command::new(CommandBody::GetState)
            .with_transform(decode_state())
            .on_complete(move |_, _| *flag.lock() = true);

        assert!(command.complete(vec![json!("garbage")]).is_err());
        assert!(!*called.lock());
    }

    #[test]
    fn test_raw_response_without_transform() {
        let command = Command::new(CommandBody::ResetDevice);
        let response = command.complete(vec![json!(1)]).expect("complete");
        assert_eq!(response, Response::Raw(vec![json!(1)]));
    }
}
