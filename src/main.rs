//! phx-socket CLI - join topics on a channel socket and print their events.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use phx_socket::{Socket, SocketConfig};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "phx-socket", version, about = "Join channel topics and print their events")]
struct Cli {
    /// Socket endpoint (overrides config file and PHX_SOCKET_URL).
    #[arg(long)]
    url: Option<String>,

    /// Bearer token sent as `?token=` (overrides PHX_SOCKET_TOKEN).
    #[arg(long)]
    token: Option<String>,

    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Topic to join. May be repeated.
    #[arg(long = "topic", required = true)]
    topics: Vec<String>,

    /// Event to print for every joined topic. May be repeated.
    #[arg(long = "event", default_value = "msg")]
    events: Vec<String>,

    /// Push `EVENT=JSON` to every joined topic after joining.
    #[arg(long, value_parser = parse_push)]
    push: Option<(String, serde_json::Value)>,
}

fn parse_push(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (event, json) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected EVENT=JSON, got {raw}"))?;
    let payload = serde_json::from_str(json).map_err(|e| format!("invalid JSON payload: {e}"))?;
    Ok((event.to_string(), payload))
}

fn load_config(cli: &Cli) -> Result<SocketConfig> {
    let mut config = match &cli.config {
        Some(path) => SocketConfig::load(path)?,
        None => SocketConfig::default(),
    };
    config.apply_env_overrides();
    if let Some(url) = &cli.url {
        config.url.clone_from(url);
    }
    if let Some(token) = &cli.token {
        config.token = Some(token.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let socket = Socket::new(load_config(&cli)?);
    socket.connect().await.context("connect failed")?;

    for topic in &cli.topics {
        let response = socket
            .join(topic)
            .await
            .with_context(|| format!("join {topic} failed"))?;
        log::info!("Joined {topic}: {response}");

        for event in &cli.events {
            let (topic_name, event_name) = (topic.clone(), event.clone());
            socket.on(topic, event, move |payload| {
                let line = serde_json::json!({
                    "topic": topic_name,
                    "event": event_name,
                    "payload": payload,
                });
                println!("{line}");
            });
        }

        if let Some((event, payload)) = &cli.push {
            let reference = socket.try_push(topic, event, payload.clone(), None)?;
            log::info!("Pushed {event} to {topic} (ref {reference})");
        }
    }

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    log::info!("Shutting down");
    socket.disconnect().await;
    Ok(())
}
