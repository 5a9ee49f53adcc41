//! agentd-protocol - Wire messages for agentd
//!
//! Every frame is a JSON text message tagged by `type`:
//!
//! - client → server: `start`, `input`, `resize`, `stop`, `close`,
//!   `permission-response`, `pc-command`, `listen`, `control`, `workflow_control`
//! - server → client: `started`, `ready`, `output`, `done`, `exit`, `stopped`,
//!   `closed`, `error`, `permission-request`, `control`, `workflow_control`,
//!   `pc-command-result`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Spawn the agent in `cwd`, replacing any session this connection owns
    #[serde(rename = "start", rename_all = "camelCase")]
    Start {
        cwd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_token: Option<String>,
    },
    /// Raw keystrokes for the agent
    #[serde(rename = "input")]
    Input { data: String },
    #[serde(rename = "resize")]
    Resize { cols: u16, rows: u16 },
    /// Kill the session, keep the connection
    #[serde(rename = "stop")]
    Stop,
    /// Close the session, keep the connection
    #[serde(rename = "close")]
    Close,
    #[serde(rename = "permission-response", rename_all = "camelCase")]
    PermissionResponse { request_id: String, approved: bool },
    /// Direct command execution, checked by the safety gate
    #[serde(rename = "pc-command")]
    PcCommand {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Switch this connection to the broadcast-listener role
    #[serde(rename = "listen")]
    Listen,
    /// Publish a control message to every listener
    #[serde(rename = "control")]
    Control(ControlPayload),
    /// Publish a workflow control message to every listener
    #[serde(rename = "workflow_control")]
    WorkflowControl(Map<String, Value>),
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "started")]
    Started { pid: u32, cwd: String },
    /// The agent produced its first output
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "output")]
    Output { data: String },
    /// The agent finished cleanly (exit code 0, no signal)
    #[serde(rename = "done", rename_all = "camelCase")]
    Done { exit_code: i32 },
    /// The agent process exited on its own
    #[serde(rename = "exit", rename_all = "camelCase")]
    Exit {
        exit_code: i32,
        signal: Option<String>,
    },
    /// Acknowledges `stop`
    #[serde(rename = "stopped")]
    Stopped,
    /// Acknowledges `close`
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "error")]
    Error { error: String },
    #[serde(rename = "permission-request", rename_all = "camelCase")]
    PermissionRequest {
        request_id: String,
        tool: String,
        action: String,
        full_text: String,
    },
    #[serde(rename = "control")]
    Control(ControlPayload),
    #[serde(rename = "workflow_control")]
    WorkflowControl(Map<String, Value>),
    #[serde(rename = "pc-command-result")]
    PcCommandResult(PcCommandResult),
}

/// UI control instruction relayed to broadcast listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPayload {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
}

/// Outcome of a `pc-command`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PcCommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl PcCommandResult {
    /// A command that never ran
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

impl ServerMessage {
    pub fn error(error: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
        }
    }

    /// Whether this message puts a session into the running phase
    pub fn starts_run(&self) -> bool {
        matches!(self, ServerMessage::Started { .. } | ServerMessage::Ready)
    }

    /// Whether this message ends the running phase
    pub fn ends_run(&self) -> bool {
        matches!(
            self,
            ServerMessage::Done { .. }
                | ServerMessage::Exit { .. }
                | ServerMessage::Stopped
                | ServerMessage::Closed
        )
    }

    /// Messages delivered to broadcast listeners
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            ServerMessage::Control(_) | ServerMessage::WorkflowControl(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_start_with_defaults() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"start","cwd":"/tmp/proj"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Start {
                cwd: "/tmp/proj".to_string(),
                cols: None,
                rows: None,
                resume_token: None,
            }
        );

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"start","cwd":"~/w","cols":100,"rows":40,"resumeToken":"abc"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Start {
                cols,
                rows,
                resume_token,
                ..
            } => {
                assert_eq!(cols, Some(100));
                assert_eq!(rows, Some(40));
                assert_eq!(resume_token.as_deref(), Some("abc"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_permission_response() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"permission-response","requestId":"r1","approved":true}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::PermissionResponse {
                request_id: "r1".to_string(),
                approved: true,
            }
        );
    }

    #[test]
    fn test_parse_unit_and_command_messages() {
        let stop: ClientMessage = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(stop, ClientMessage::Stop);

        let cmd: ClientMessage =
            serde_json::from_str(r#"{"type":"pc-command","command":"ls"}"#).unwrap();
        assert_eq!(
            cmd,
            ClientMessage::PcCommand {
                command: "ls".to_string(),
                args: vec![],
            }
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"bogus"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn test_server_message_shapes() {
        let value = serde_json::to_value(ServerMessage::PermissionRequest {
            request_id: "r1".to_string(),
            tool: "write".to_string(),
            action: "config.json".to_string(),
            full_text: "Allow write to config.json?".to_string(),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({
                "type": "permission-request",
                "requestId": "r1",
                "tool": "write",
                "action": "config.json",
                "fullText": "Allow write to config.json?"
            })
        );

        let value = serde_json::to_value(ServerMessage::Exit {
            exit_code: 0,
            signal: None,
        })
        .unwrap();
        assert_eq!(value, json!({"type": "exit", "exitCode": 0, "signal": null}));

        let value =
            serde_json::to_value(ServerMessage::PcCommandResult(PcCommandResult::failure(
                "blocked",
            )))
            .unwrap();
        assert_eq!(value["type"], "pc-command-result");
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "blocked");
    }

    #[test]
    fn test_control_messages() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"control","action":"navigate","route":"/tasks"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::Control(ControlPayload {
                action: "navigate".to_string(),
                data: None,
                route: Some("/tasks".to_string()),
            })
        );
        assert!(msg.is_broadcast());

        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"workflow_control","step":3,"status":"paused"}"#)
                .unwrap();
        match msg {
            ServerMessage::WorkflowControl(map) => {
                assert_eq!(map.get("step"), Some(&json!(3)));
                assert!(!map.contains_key("type"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_run_boundaries() {
        assert!(ServerMessage::Ready.starts_run());
        assert!(ServerMessage::Stopped.ends_run());
        assert!(ServerMessage::Done { exit_code: 0 }.ends_run());
        assert!(!ServerMessage::Output {
            data: String::new()
        }
        .ends_run());
    }
}
