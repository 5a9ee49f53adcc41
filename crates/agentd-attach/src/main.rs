//! agentd-attach - terminal client for agentd
//!
//! Starts an agent session in a directory and attaches the local terminal to
//! it. Permission prompts are answered with `y` / `n`.
//!
//! Usage:
//!   agentd-attach
//!   agentd-attach ~/src/project --host localhost --port 9130

use std::io::{stdout, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentd_client::{ClientConnection, WsConnector};
use agentd_protocol::ServerMessage;
use anyhow::{Context, Result};
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use tokio::sync::mpsc;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 9130;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "agentd-attach")]
#[command(about = "Run an agent session through agentd in this terminal")]
#[command(version)]
struct Args {
    /// Working directory for the agent (default: current directory)
    cwd: Option<PathBuf>,

    /// WebSocket server host
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    host: String,

    /// WebSocket server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Resume a previous agent conversation
    #[arg(short, long)]
    resume: Option<String>,
}

enum Input {
    Data(String),
    Resize(u16, u16),
    Detach,
}

fn key_to_data(key: KeyEvent) -> Option<String> {
    let data = match key.code {
        KeyCode::Char(c) => {
            if key.modifiers.contains(KeyModifiers::CONTROL) && c.is_ascii_lowercase() {
                ((c as u8 - b'a' + 1) as char).to_string()
            } else {
                c.to_string()
            }
        }
        KeyCode::Enter => "\r".to_string(),
        KeyCode::Backspace => "\x7f".to_string(),
        KeyCode::Tab => "\t".to_string(),
        KeyCode::Esc => "\x1b".to_string(),
        KeyCode::Up => "\x1b[A".to_string(),
        KeyCode::Down => "\x1b[B".to_string(),
        KeyCode::Right => "\x1b[C".to_string(),
        KeyCode::Left => "\x1b[D".to_string(),
        KeyCode::Home => "\x1b[H".to_string(),
        KeyCode::End => "\x1b[F".to_string(),
        KeyCode::PageUp => "\x1b[5~".to_string(),
        KeyCode::PageDown => "\x1b[6~".to_string(),
        KeyCode::Delete => "\x1b[3~".to_string(),
        KeyCode::Insert => "\x1b[2~".to_string(),
        KeyCode::F(n) => format!("\x1b[{}~", n + 10),
        _ => return None,
    };
    Some(data)
}

/// Print a status line; raw mode needs the explicit carriage return
fn notice(color: &str, text: &str) {
    eprint!("\r\n\x1b[{}m{}\x1b[0m\r\n", color, text);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cwd = match args.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let connector = WsConnector::session(&args.host, args.port);
    eprintln!("\x1b[90mConnecting to {}...\x1b[0m", connector.url());

    let conn = ClientConnection::connect(&connector, CONNECT_TIMEOUT)
        .await
        .context("Failed to connect to agentd")?;

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let _subscription = conn.subscribe(move |msg| {
        let _ = msg_tx.send(msg.clone());
    });

    let (cols, rows) = crossterm::terminal::size().unwrap_or((120, 40));
    if !conn.start_session(
        cwd.to_string_lossy().to_string(),
        Some(cols),
        Some(rows),
        args.resume,
    ) {
        anyhow::bail!("Connection closed before the session could start");
    }
    eprintln!("\x1b[90mPress Ctrl+C to end the session\x1b[0m");

    let running = Arc::new(AtomicBool::new(true));
    let (input_tx, mut input_rx) = mpsc::channel::<Input>(32);

    let running_input = running.clone();
    let input_handle = tokio::task::spawn_blocking(move || {
        if let Err(e) = enable_raw_mode() {
            eprintln!("\x1b[31mFailed to enable raw mode: {}\x1b[0m", e);
            return;
        }

        while running_input.load(Ordering::SeqCst) {
            if !event::poll(Duration::from_millis(100)).unwrap_or(false) {
                continue;
            }
            let input = match event::read() {
                Ok(Event::Key(key))
                    if key.modifiers.contains(KeyModifiers::CONTROL)
                        && key.code == KeyCode::Char('c') =>
                {
                    Input::Detach
                }
                Ok(Event::Key(key)) => match key_to_data(key) {
                    Some(data) => Input::Data(data),
                    None => continue,
                },
                Ok(Event::Resize(cols, rows)) => Input::Resize(cols, rows),
                _ => continue,
            };
            let detach = matches!(input, Input::Detach);
            if input_tx.blocking_send(input).is_err() || detach {
                break;
            }
        }

        let _ = disable_raw_mode();
    });

    let mut pending: Option<String> = None;
    let exit_code = loop {
        tokio::select! {
            msg = msg_rx.recv() => {
                let Some(msg) = msg else {
                    notice("33", "Disconnected from agentd");
                    break 1;
                };
                match msg {
                    ServerMessage::Started { pid, cwd } => {
                        notice("32", &format!("Agent started (pid {}) in {}", pid, cwd));
                    }
                    ServerMessage::Output { data } => {
                        print!("{}", data);
                        stdout().flush()?;
                    }
                    ServerMessage::PermissionRequest { request_id, tool, action, .. } => {
                        notice("36", &format!("[permission] {} {} - answer y / n", tool, action));
                        pending = Some(request_id);
                    }
                    ServerMessage::Error { error } => notice("31", &error),
                    ServerMessage::Exit { exit_code, signal } => {
                        match signal {
                            Some(signal) => notice("33", &format!("Agent killed by {}", signal)),
                            None => notice("33", &format!("Agent exited with code {}", exit_code)),
                        }
                        break exit_code;
                    }
                    ServerMessage::Stopped | ServerMessage::Closed => break 0,
                    _ => {}
                }
            }

            input = input_rx.recv() => {
                match input {
                    Some(Input::Data(data)) => {
                        let answer = match data.as_str() {
                            "y" | "Y" => Some(true),
                            "n" | "N" => Some(false),
                            _ => None,
                        };
                        match (answer, pending.take()) {
                            (Some(approved), Some(request_id)) => {
                                conn.respond_permission(request_id, approved);
                            }
                            (_, request_id) => {
                                pending = request_id;
                                conn.send_input(data);
                            }
                        }
                    }
                    Some(Input::Resize(cols, rows)) => {
                        conn.resize(cols, rows);
                    }
                    Some(Input::Detach) | None => {
                        notice("33", "Ending session");
                        conn.close_session();
                        break 0;
                    }
                }
            }
        }
    };

    running.store(false, Ordering::SeqCst);
    let _ = input_handle.await;
    conn.shutdown();

    std::process::exit(exit_code);
}
