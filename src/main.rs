// src/main.rs

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use throughput_engine::prelude::*;
use tracing_subscriber::EnvFilter;

// Usage: throughput-engine [config.json] [preset] [profile]
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next().filter(|arg| arg != "-") {
        Some(path) => {
            let path = PathBuf::from(path);
            EngineConfig::from_json_file(&path)
                .with_context(|| format!("loading config from {}", path.display()))?
        }
        None => EngineConfig::default(),
    };

    let transport = Arc::new(ReqwestTransport::new(&config)?);
    let engine = Engine::new(config, transport)?;
    if let Some(preset) = args.next() {
        engine.set_policy(&preset)?;
    }
    if let Some(profile) = args.next() {
        engine.set_source_profile(&profile)?;
    }

    println!("--- throughput engine ---");
    println!("Sources in rotation: {}", engine.allowed_sources().join(", "));
    println!("Press Ctrl-C to stop.\n");

    engine.start();
    let mut snapshots = engine.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                print_snapshot(&snapshot);
            }
        }
    }

    engine.stop();
    let snapshot = engine.snapshot();
    println!(
        "\nStopped after {}: {:.2} GiB on the wire, peak {:.2} MB/s.",
        snapshot.session_clock(),
        snapshot.total_bytes as f64 / throughput_engine::config::GIB as f64,
        snapshot.peak_speed_mbps
    );
    for event in engine.log_events().iter().rev().take(10) {
        println!("  [{:?}] {}", event.severity, event.message);
    }
    Ok(())
}

fn print_snapshot(snapshot: &EngineSnapshot) {
    let sources: Vec<String> = snapshot
        .top_sources
        .iter()
        .map(|source| format!("{} ({})", source.label, source.hits))
        .collect();
    println!(
        "[{}] {:?} {:>8.2} MB/s | peak {:>8.2} | streams {}/{} | chunk {} MB{}{} | {}",
        snapshot.session_clock(),
        snapshot.status,
        snapshot.instantaneous_speed_mbps,
        snapshot.peak_speed_mbps,
        snapshot.active_workers,
        snapshot.worker_target,
        snapshot.chunk_size_mb,
        if snapshot.burst_active { " | burst" } else { "" },
        if snapshot.reachability_available { " | tailnet" } else { "" },
        sources.join(", ")
    );
}
