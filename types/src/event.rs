//! Stream events for session-scoped, resumable delivery.
//!
//! Every outbound message a session produces while handling a request is
//! recorded as a [`StreamEvent`] with a session-scoped, strictly
//! increasing, gapless sequence number. The sequence doubles as the SSE
//! event id, so a client can resume with `Last-Event-ID` after a dropped
//! connection.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// What kind of outbound message an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A `notifications/message` log notification.
    Log,
    /// A `notifications/progress` update.
    Progress,
    /// Any other server-initiated notification.
    Custom,
    /// The terminal JSON-RPC response for a request.
    Response,
}

/// One immutable entry in a session's event log.
///
/// `payload` is the complete outbound JSON-RPC message, ready to be
/// written to the wire as SSE data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Session-scoped sequence number, strictly increasing and gapless.
    pub sequence: u64,
    /// The request id this event belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_request_id: Option<Value>,
    /// Message kind.
    pub kind: EventKind,
    /// The full JSON-RPC message.
    pub payload: Value,
}

impl StreamEvent {
    /// Whether this event terminates the stream for its request.
    pub fn is_response(&self) -> bool {
        self.kind == EventKind::Response
    }
}

/// Build a `notifications/message` envelope.
pub fn log_message(level: &str, logger: Option<&str>, data: impl Into<Value>) -> Value {
    let mut params = json!({
        "level": level,
        "data": data.into(),
    });
    if let Some(logger) = logger {
        params["logger"] = json!(logger);
    }
    json!({
        "jsonrpc": "2.0",
        "method": "notifications/message",
        "params": params,
    })
}

/// Build a `notifications/progress` envelope.
///
/// `progress_token` correlates the update to the originating request, as
/// supplied by the client in `params._meta.progressToken` (falling back
/// to the request id).
pub fn progress(
    progress_token: &Value,
    progress: f64,
    total: Option<f64>,
    message: Option<&str>,
) -> Value {
    let mut params = json!({
        "progressToken": progress_token,
        "progress": progress,
    });
    if let Some(total) = total {
        params["total"] = json!(total);
    }
    if let Some(message) = message {
        params["message"] = json!(message);
    }
    json!({
        "jsonrpc": "2.0",
        "method": "notifications/progress",
        "params": params,
    })
}

/// Build a `notifications/resources/updated` envelope.
pub fn resource_updated(uri: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "notifications/resources/updated",
        "params": { "uri": uri },
    })
}

/// Build a `notifications/resources/list_changed` envelope.
pub fn resource_list_changed() -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "notifications/resources/list_changed",
    })
}
