use serde::{Deserialize, Serialize};
use serde_json::Value;

use keel_core::KeelError;

/// Error codes the hub itself produces. Tool failures carry the code of
/// the underlying [`KeelError`].
pub mod codes {
    pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
    pub const PARSE_ERROR: &str = "PARSE_ERROR";
    pub const INVALID_TOPIC: &str = "INVALID_TOPIC";
    pub const TOOL_NOT_FOUND: &str = "TOOL_NOT_FOUND";
}

/// Messages an observer sends to the hub.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Authenticate {
        auth: String,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Ping,
    Execute {
        tool: String,
        #[serde(default)]
        params: Value,
        #[serde(rename = "requestId", default)]
        request_id: Option<String>,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Ping => "ping",
            Self::Execute { .. } => "execute",
        }
    }
}

/// Messages the hub sends to an observer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HubMessage {
    Auth {
        authenticated: bool,
        message: String,
    },
    Event {
        topic: String,
        data: Value,
    },
    Result {
        #[serde(rename = "requestId")]
        request_id: Option<String>,
        data: Value,
    },
    Error {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none", default)]
        request_id: Option<String>,
        error: String,
        code: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        suggestion: Option<String>,
    },
    Pong,
    Unsubscribed {
        topic: String,
    },
}

impl HubMessage {
    pub fn event(topic: impl Into<String>, data: Value) -> Self {
        Self::Event {
            topic: topic.into(),
            data,
        }
    }

    pub fn error(request_id: Option<String>, code: &str, error: impl Into<String>) -> Self {
        Self::Error {
            request_id,
            error: error.into(),
            code: code.to_string(),
            suggestion: None,
        }
    }

    /// Correlated failure of a tool call. The code is the innermost error's.
    pub fn tool_error(request_id: Option<String>, err: &KeelError) -> Self {
        Self::Error {
            request_id,
            error: err.to_string(),
            code: err.root().error_code().to_string(),
            suggestion: Some(err.suggestion()),
        }
    }

    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize hub message");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_execute() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "execute",
            "tool": "get_session_status",
            "params": { "session_id": "sess_1" },
            "requestId": "r1"
        }))
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Execute {
                tool: "get_session_status".into(),
                params: json!({ "session_id": "sess_1" }),
                request_id: Some("r1".into()),
            }
        );
        assert_eq!(msg.kind(), "execute");
    }

    #[test]
    fn execute_params_default_to_null() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"execute","tool":"list_sessions"}"#).unwrap();
        let ClientMessage::Execute {
            params, request_id, ..
        } = msg
        else {
            panic!("expected execute");
        };
        assert!(params.is_null());
        assert!(request_id.is_none());
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"topic":"x"}"#).is_err());
    }

    #[test]
    fn error_shape() {
        let err = KeelError::SessionNotFound("sess_x".into()).in_tool("resume_session");
        let msg = HubMessage::tool_error(Some("r9".into()), &err);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["requestId"], "r9");
        assert_eq!(value["code"], "SESSION_NOT_FOUND");
        assert!(value["error"].as_str().unwrap().contains("resume_session"));
        assert!(value["suggestion"].is_string());

        let bare = serde_json::to_value(HubMessage::error(None, codes::PARSE_ERROR, "bad")).unwrap();
        assert!(bare.get("requestId").is_none());
        assert!(bare.get("suggestion").is_none());
    }

    #[test]
    fn pong_and_unsubscribed() {
        assert_eq!(
            serde_json::to_value(HubMessage::Pong).unwrap(),
            json!({ "type": "pong" })
        );
        assert_eq!(
            serde_json::to_value(HubMessage::Unsubscribed {
                topic: "context.status".into()
            })
            .unwrap(),
            json!({ "type": "unsubscribed", "topic": "context.status" })
        );
    }
}
