//! Gateway wire protocol.
//!
//! JSON frames over a message-framed duplex channel. Request/response
//! correlation is by client-generated `request_id`; the server pushes
//! typed events with a monotonic `seq`. The handshake is
//! challenge/connect/hello_ok; anything else during authentication is
//! fatal.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frames sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Auth reply to the server's challenge.
    Connect {
        token: String,
        client_id: String,
        scopes: Vec<String>,
        nonce: String,
    },
    /// Event subscription, optionally resuming from a known sequence.
    Subscribe {
        classes: Vec<String>,
        last_seq: Option<u64>,
    },
    /// A correlated RPC request.
    Request {
        request_id: Uuid,
        #[serde(flatten)]
        op: RequestOp,
    },
}

/// RPC operations. The `op` names are contractual.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RequestOp {
    SessionsList {
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    SessionsSpawn {
        params: SpawnParams,
    },
    SessionsSend {
        session_key: String,
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
    },
    SessionsHistory {
        session_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
    SessionsKill {
        session_key: String,
    },
}

/// Parameters for spawning a remote session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnParams {
    pub model: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub denied_tools: Vec<String>,
    #[serde(default)]
    pub sandboxed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<(String, String)>,
}

/// Inline attachment on a send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub data: String,
}

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    /// First frame after dial: the auth challenge.
    Challenge { nonce: String },
    /// Authentication accepted.
    HelloOk {
        connection_id: String,
        protocol_version: u32,
    },
    /// Authentication rejected. Fatal; the client must not retry.
    HelloErr { reason: String },
    /// Subscription acknowledged. `next_seq` is the first sequence the
    /// server will deliver; a hole after a requested resume point means
    /// events were lost.
    SubscribeOk {
        resume_supported: bool,
        next_seq: u64,
    },
    /// RPC response correlated by request id.
    Response {
        request_id: Uuid,
        ok: bool,
        #[serde(default)]
        body: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_kind: Option<String>,
    },
    /// Server-pushed event.
    Event {
        seq: u64,
        class: String,
        #[serde(default)]
        body: serde_json::Value,
    },
}

/// One remote session as reported by `sessions_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_key: String,
    pub session_id: String,
    #[serde(default)]
    pub model: String,
    pub created_at: String,
}

/// Result body of `sessions_spawn`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnedSession {
    pub session_key: String,
    pub session_id: String,
}

/// Result body of `sessions_send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAccepted {
    pub run_id: String,
    pub status: String,
}

/// One message of a session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_wire_shape() {
        let frame = ClientFrame::Request {
            request_id: Uuid::nil(),
            op: RequestOp::SessionsKill { session_key: "s1".into() },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["frame"], "request");
        assert_eq!(json["op"], "sessions_kill");
        assert_eq!(json["session_key"], "s1");
    }

    #[test]
    fn test_connect_frame_roundtrip() {
        let frame = ClientFrame::Connect {
            token: "tok".into(),
            client_id: "drover".into(),
            scopes: vec!["sessions".into()],
            nonce: "abc".into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: ClientFrame = serde_json::from_str(&json).unwrap();
        match back {
            ClientFrame::Connect { nonce, .. } => assert_eq!(nonce, "abc"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_server_response_parses_without_optional_fields() {
        let json = r#"{"frame":"response","request_id":"00000000-0000-0000-0000-000000000000","ok":true}"#;
        let frame: ServerFrame = serde_json::from_str(json).unwrap();
        match frame {
            ServerFrame::Response { ok, body, error, .. } => {
                assert!(ok);
                assert!(body.is_null());
                assert!(error.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_event_frame_carries_seq() {
        let json = r#"{"frame":"event","seq":42,"class":"agent","body":{"x":1}}"#;
        let frame: ServerFrame = serde_json::from_str(json).unwrap();
        match frame {
            ServerFrame::Event { seq, class, .. } => {
                assert_eq!(seq, 42);
                assert_eq!(class, "agent");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_spawn_op_nests_params() {
        let frame = ClientFrame::Request {
            request_id: Uuid::nil(),
            op: RequestOp::SessionsSpawn {
                params: SpawnParams { model: "sonnet".into(), task: "do".into(), ..Default::default() },
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["params"]["model"], "sonnet");
    }
}
