//! agentd - WebSocket bridge between browser clients and CLI agent sessions
//!
//! Responsibilities:
//! - Spawn one agent per `/session` connection in a pseudo-terminal
//! - Stream output, surface permission prompts, relay answers
//! - Run gated direct commands
//! - Fan control messages out to `/events` listeners

use std::path::PathBuf;

use agentd_core::{default_home, AgentdConfig, AgentdServer, RegistryStats};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "agentd")]
#[command(about = "Serve CLI agent sessions over WebSocket")]
#[command(version)]
struct Args {
    /// Config file (default: <AGENTD_HOME>/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port, overrides config and AGENTD_PORT
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address, overrides config and AGENTD_HOST
    #[arg(long)]
    host: Option<String>,
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("AGENTD_LOG_LEVEL") {
        match v.as_str() {
            "silent" => "off".to_string(),
            "fatal" => "error".to_string(),
            other => other.to_string(),
        }
    } else {
        "info".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

fn log_shutdown(stats: &RegistryStats) {
    info!(
        sessions = stats.sessions,
        running = stats.running,
        pending_permissions = stats.pending_permissions,
        started_total = stats.started_total,
        "Shutting down"
    );
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let home = default_home();
    std::fs::create_dir_all(&home).ok();

    // stderr + daily-rotated file
    let log_dir = home.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "agentd.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    std::panic::set_hook(Box::new(|info| {
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        eprintln!("PANIC at {}: {}", location, payload);
        tracing::error!(location = %location, "AGENTD PANIC: {}", payload);
    }));

    let config_path = args.config.unwrap_or_else(|| home.join("config.yaml"));
    let mut config = AgentdConfig::load(&config_path);
    config.apply_env();
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    let mut server = AgentdServer::new(&config);
    let addr = server
        .start()
        .await
        .with_context(|| format!("Failed to start server on {}", config.bind_addr()))?;
    info!(
        addr = %addr,
        agent = %config.agent.command,
        commands_enabled = config.commands.enabled,
        "agentd ready"
    );

    shutdown_signal().await;

    log_shutdown(&server.registry().stats().await);
    server.stop().await;
    info!("agentd stopped");
    Ok(())
}
