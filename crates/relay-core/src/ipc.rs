//! Message types exchanged between the coordinator and workers.
//!
//! Requests travel down each worker's mailbox; claims, releases, replies and
//! session events travel back up a single shared channel, so the coordinator
//! observes them in the order each worker produced them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ActionError;
use crate::events::SessionEvent;
use crate::ids::{CorrelationId, SessionId};

/// Action dispatched to the worker owning a session.
#[derive(Clone, Debug)]
pub enum Action {
    Start,
    SendText {
        to: String,
        text: String,
    },
    SendMedia {
        to: String,
        bytes: bytes::Bytes,
        caption: Option<String>,
    },
    Disconnect,
    GetStatus,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start_session",
            Self::SendText { .. } => "send_text",
            Self::SendMedia { .. } => "send_media",
            Self::Disconnect => "disconnect",
            Self::GetStatus => "get_status",
        }
    }
}

/// One forwarded request. The correlation id is single-use.
#[derive(Debug)]
pub struct ActionRequest {
    pub request_id: CorrelationId,
    pub session_id: SessionId,
    pub action: Action,
}

/// Wire form of a worker-side failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyError {
    pub kind: String,
    pub message: String,
}

/// Asynchronous reply to an [`ActionRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionReply {
    pub request_id: CorrelationId,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl ActionReply {
    pub fn ok(request_id: CorrelationId, data: Value) -> Self {
        Self {
            request_id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(request_id: CorrelationId, error: &ActionError) -> Self {
        Self {
            request_id,
            success: false,
            data: None,
            error: Some(ReplyError {
                kind: error.kind().to_string(),
                message: error.to_string(),
            }),
        }
    }

    /// Convert back into the caller-facing result on the coordinator side.
    pub fn into_result(self) -> Result<Value, ActionError> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            let e = self.error.unwrap_or(ReplyError {
                kind: "internal".into(),
                message: "worker reply carried no error".into(),
            });
            Err(ActionError::from_wire(&e.kind, &e.message))
        }
    }
}

/// Everything a worker reports upward to the coordinator.
#[derive(Clone, Debug)]
pub enum WorkerEvent {
    /// Worker asserts ownership of a session it just made resident.
    Claim { session_id: SessionId, worker: usize },
    /// Worker revokes ownership (logout, terminal give-up, disconnect).
    Release { session_id: SessionId, worker: usize },
    Reply(ActionReply),
    Session(SessionEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ok_reply_into_result() {
        let id = CorrelationId::new();
        let reply = ActionReply::ok(id, serde_json::json!({"status": "initializing"}));
        let value = reply.into_result().unwrap();
        assert_eq!(value["status"], "initializing");
    }

    #[test]
    fn err_reply_preserves_kind() {
        let id = CorrelationId::new();
        let reply = ActionReply::err(id, &ActionError::NotConnected(Duration::from_secs(20)));
        assert!(!reply.success);
        let err = reply.into_result().unwrap_err();
        assert_eq!(err.kind(), "not_connected");
    }

    #[test]
    fn reply_serializes_without_empty_fields() {
        let reply = ActionReply::ok(CorrelationId::new(), serde_json::json!({"ok": true}));
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn action_names() {
        assert_eq!(Action::Start.name(), "start_session");
        assert_eq!(Action::Disconnect.name(), "disconnect");
        assert_eq!(Action::GetStatus.name(), "get_status");
    }
}
