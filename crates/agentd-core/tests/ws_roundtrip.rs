//! End-to-end: WebSocket client → server → PTY child and back

use std::net::SocketAddr;
use std::time::Duration;

use agentd_core::config::AgentdConfig;
use agentd_core::AgentdServer;
use agentd_protocol::{ClientMessage, ControlPayload, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tempfile::{tempdir, TempDir};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn config(args: &[&str]) -> AgentdConfig {
    let mut config = AgentdConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.agent.command = "/bin/sh".to_string();
    config.agent.args = args.iter().map(|s| s.to_string()).collect();
    config
}

async fn serve(config: &AgentdConfig) -> (AgentdServer, SocketAddr) {
    let mut server = AgentdServer::new(config);
    let addr = server.start().await.unwrap();
    (server, addr)
}

async fn connect(addr: SocketAddr, path: &str) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}{}", addr, path)).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, msg: &ClientMessage) {
    let text = serde_json::to_string(msg).unwrap();
    ws.send(Message::Text(text)).await.unwrap();
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

fn start(dir: &TempDir) -> ClientMessage {
    ClientMessage::Start {
        cwd: dir.path().to_string_lossy().to_string(),
        cols: Some(100),
        rows: Some(30),
        resume_token: None,
    }
}

#[tokio::test]
async fn test_permission_round_trip() {
    let dir = tempdir().unwrap();
    let script = "printf 'Working...\\n'; printf 'Allow write to config.json? (y/n) '; read answer; echo \"answer=$answer\"; exit 0";
    let (mut server, addr) = serve(&config(&["-c", script])).await;
    let mut ws = connect(addr, "/session").await;

    send(&mut ws, &start(&dir)).await;
    match recv(&mut ws).await {
        ServerMessage::Started { pid, cwd } => {
            assert!(pid > 0);
            assert_eq!(cwd, dir.path().to_string_lossy());
        }
        other => panic!("expected started, got {:?}", other),
    }
    assert_eq!(recv(&mut ws).await, ServerMessage::Ready);

    // Output until the prompt is recognized
    let request_id = loop {
        match recv(&mut ws).await {
            ServerMessage::Output { .. } => continue,
            ServerMessage::PermissionRequest {
                request_id,
                tool,
                action,
                full_text,
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(tool, "write");
                assert_eq!(action, "config.json");
                assert!(full_text.contains("config.json"));
                break request_id;
            }
            other => panic!("unexpected {:?}", other),
        }
    };

    send(
        &mut ws,
        &ClientMessage::PermissionResponse {
            request_id: request_id.clone(),
            approved: true,
        },
    )
    .await;
    // A second answer to the same request is ignored
    send(
        &mut ws,
        &ClientMessage::PermissionResponse {
            request_id,
            approved: false,
        },
    )
    .await;

    let mut output = String::new();
    let mut done = false;
    loop {
        match recv(&mut ws).await {
            ServerMessage::Output { data } => output.push_str(&data),
            ServerMessage::Done { exit_code } => {
                assert_eq!(exit_code, 0);
                done = true;
            }
            ServerMessage::Exit { exit_code, signal } => {
                assert_eq!(exit_code, 0);
                assert!(signal.is_none());
                break;
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert!(done, "done must precede exit on a clean exit");
    assert!(output.contains("answer=y"), "output was {:?}", output);
    assert_eq!(server.registry().stats().await.sessions, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_input_echo_and_stop() {
    let dir = tempdir().unwrap();
    let (mut server, addr) = serve(&config(&[])).await;
    let mut ws = connect(addr, "/session").await;

    send(&mut ws, &start(&dir)).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Started { .. }));

    send(
        &mut ws,
        &ClientMessage::Input {
            data: "echo ping-$((6 * 7))\n".to_string(),
        },
    )
    .await;

    let mut output = String::new();
    while !output.contains("ping-42") {
        match recv(&mut ws).await {
            ServerMessage::Output { data } => output.push_str(&data),
            ServerMessage::Ready => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    let session = server.registry().session(1).await;
    send(&mut ws, &ClientMessage::Stop).await;
    loop {
        match recv(&mut ws).await {
            ServerMessage::Stopped => break,
            ServerMessage::Output { .. } => {}
            other => panic!("unexpected {:?}", other),
        }
    }
    if let Some(session) = session {
        assert!(!session.is_running());
    }
    assert_eq!(server.registry().stats().await.sessions, 0);

    // Still usable after stop
    send(&mut ws, &start(&dir)).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Started { .. }));

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_messages_are_ignored() {
    let dir = tempdir().unwrap();
    let (mut server, addr) = serve(&config(&[])).await;
    let mut ws = connect(addr, "/session").await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"bogus"}"#.to_string()))
        .await
        .unwrap();
    send(&mut ws, &start(&dir)).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Started { .. }));

    server.stop().await;
}

#[tokio::test]
async fn test_start_in_missing_directory() {
    let dir = tempdir().unwrap();
    let (mut server, addr) = serve(&config(&[])).await;
    let mut ws = connect(addr, "/session").await;

    send(
        &mut ws,
        &ClientMessage::Start {
            cwd: dir.path().join("nope").to_string_lossy().to_string(),
            cols: None,
            rows: None,
            resume_token: None,
        },
    )
    .await;
    match recv(&mut ws).await {
        ServerMessage::Error { error } => assert!(error.contains("does not exist")),
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(server.registry().stats().await.sessions, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_dangerous_command_is_denied() {
    let (mut server, addr) = serve(&config(&[])).await;
    let mut ws = connect(addr, "/session").await;

    send(
        &mut ws,
        &ClientMessage::PcCommand {
            command: "rm".to_string(),
            args: vec!["-rf".to_string(), "/".to_string()],
        },
    )
    .await;
    match recv(&mut ws).await {
        ServerMessage::PcCommandResult(result) => {
            assert!(!result.success);
            assert!(result.error.unwrap_or_default().contains("blocked"));
            assert!(result.exit_code.is_none());
        }
        other => panic!("expected pc-command-result, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_allowed_command_runs_in_session_directory() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
    let (mut server, addr) = serve(&config(&[])).await;
    let mut ws = connect(addr, "/session").await;

    send(&mut ws, &start(&dir)).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Started { .. }));

    send(
        &mut ws,
        &ClientMessage::PcCommand {
            command: "ls".to_string(),
            args: vec![],
        },
    )
    .await;
    let result = loop {
        match recv(&mut ws).await {
            ServerMessage::PcCommandResult(result) => break result,
            _ => continue,
        }
    };
    assert!(result.success);
    assert!(result.stdout.contains("marker.txt"));

    server.stop().await;
}

#[tokio::test]
async fn test_ready_timeout() {
    let dir = tempdir().unwrap();
    let mut config = config(&["-c", "sleep 30"]);
    config.session.ready_timeout_secs = 1;
    let (mut server, addr) = serve(&config).await;
    let mut ws = connect(addr, "/session").await;

    send(&mut ws, &start(&dir)).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Started { .. }));
    match recv(&mut ws).await {
        ServerMessage::Error { error } => assert!(error.contains("no output")),
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(server.registry().stats().await.sessions, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_invalid_route_is_closed() {
    let (mut server, addr) = serve(&config(&[])).await;
    let mut ws = connect(addr, "/pty/1").await;

    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap();
    match msg {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 4000),
        other => panic!("expected close frame, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_control_reaches_listeners() {
    let (mut server, addr) = serve(&config(&[])).await;
    let mut listener = connect(addr, "/events").await;
    let mut owner = connect(addr, "/session").await;

    let control = ControlPayload {
        action: "navigate".to_string(),
        data: None,
        route: Some("/tasks".to_string()),
    };

    // The listener subscribes right after its handshake; publish until it sees one
    let received = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            send(&mut owner, &ClientMessage::Control(control.clone())).await;
            if let Ok(Some(Ok(Message::Text(text)))) =
                tokio::time::timeout(Duration::from_millis(200), listener.next()).await
            {
                return serde_json::from_str::<ServerMessage>(&text).unwrap();
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(received, ServerMessage::Control(control));

    // Listeners cannot start sessions
    let dir = tempdir().unwrap();
    send(&mut listener, &start(&dir)).await;
    loop {
        match recv(&mut listener).await {
            ServerMessage::Control(_) => continue,
            ServerMessage::Error { error } => {
                assert!(error.contains("Listener"));
                break;
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    server.stop().await;
}

#[tokio::test]
async fn test_closing_connection_kills_session() {
    let dir = tempdir().unwrap();
    let (mut server, addr) = serve(&config(&[])).await;
    let mut ws = connect(addr, "/session").await;

    send(&mut ws, &start(&dir)).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Started { .. }));
    let registry = server.registry();
    assert_eq!(registry.stats().await.sessions, 1);

    ws.close(None).await.unwrap();
    drop(ws);

    let cleared = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if registry.stats().await.sessions == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(cleared.is_ok());

    server.stop().await;
}

#[tokio::test]
async fn test_signal_exit_sends_exit_without_done() {
    let dir = tempdir().unwrap();
    let (mut server, addr) = serve(&config(&["-c", "echo going; kill -KILL $$"])).await;
    let mut ws = connect(addr, "/session").await;

    send(&mut ws, &start(&dir)).await;
    loop {
        match recv(&mut ws).await {
            ServerMessage::Started { .. } | ServerMessage::Ready | ServerMessage::Output { .. } => {}
            ServerMessage::Exit { exit_code, signal } => {
                assert_ne!(exit_code, 0);
                assert!(signal.is_some());
                break;
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(server.registry().stats().await.sessions, 0);

    server.stop().await;
}
