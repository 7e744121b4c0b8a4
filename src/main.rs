//! MeshLink node
//!
//! Joins the mesh on the first Bluetooth adapter and chats over stdin:
//! `@abcd text` sends to peer `abcd`, any other line is broadcast.
//! `/peers` and `/status` print mesh state. Ctrl-C or EOF leaves the mesh.

use anyhow::{Context, Result};
use log::{error, info};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use meshlink::bluetooth::{AlwaysUsable, BtleplugAdapter};
use meshlink::message::InMemoryMessageStore;
use meshlink::{MeshConfig, MeshEvent, MeshSession, PeerId};

enum Command {
    Send(PeerId, String),
    Peers,
    Status,
    Nothing,
}

fn parse_line(line: &str) -> Result<Command> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Nothing);
    }
    match line {
        "/peers" => return Ok(Command::Peers),
        "/status" => return Ok(Command::Status),
        _ => {}
    }
    if let Some(rest) = line.strip_prefix('@') {
        let (peer, text) = rest.split_once(' ').unwrap_or((rest, ""));
        let peer: PeerId = peer.parse().context("Expected @<4 hex digits> <text>")?;
        return Ok(Command::Send(peer, text.to_string()));
    }
    Ok(Command::Send(PeerId::BROADCAST, line.to_string()))
}

fn print_event(event: &MeshEvent) {
    match event {
        MeshEvent::MessageReceived(message) => {
            println!("[{}] {}: {}", message.received_at.format("%H:%M:%S"), message.sender, message.content)
        }
        MeshEvent::PeerListChanged(peers) => {
            let names: Vec<String> = peers.iter().map(|p| p.display_name()).collect();
            println!("* peers: {}", names.join(", "));
        }
        other => match serde_json::to_string(other) {
            Ok(json) => info!("{}", json),
            Err(e) => error!("Unprintable event: {}", e),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = MeshConfig::load().context("Failed to load configuration")?;
    let adapter = BtleplugAdapter::new(config.max_write_size)
        .await
        .context("Failed to open Bluetooth adapter")?;
    let session = MeshSession::new(
        config,
        Arc::new(adapter),
        Arc::new(InMemoryMessageStore::default()),
        Arc::new(AlwaysUsable),
    )
    .context("Failed to create mesh session")?;

    if let Some(mut events) = session.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                print_event(&event);
            }
        });
    }

    session.start().await.context("Failed to join the mesh")?;
    println!("Joined the mesh as {}", session.local_peer_id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match parse_line(&line) {
                    Ok(Command::Send(peer, text)) => {
                        if let Err(e) = session.send_message(peer, &text).await {
                            error!("Send failed: {}", e);
                        }
                    }
                    Ok(Command::Peers) => {
                        for peer in session.peers() {
                            let distance = session
                                .proximity(peer.peer_id)
                                .map(|d| d.bucket.to_string())
                                .unwrap_or_else(|| "?".to_string());
                            println!("  {} ~{}", peer.display_name(), distance);
                        }
                    }
                    Ok(Command::Status) => println!("{}", serde_json::to_string_pretty(&session.status())?),
                    Ok(Command::Nothing) => {}
                    Err(e) => eprintln!("{e:#}"),
                }
            }
        }
    }

    session.stop().await;
    Ok(())
}
