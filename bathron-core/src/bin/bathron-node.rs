// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Daemon entry point. Loads `NodeConfig`, opens a `NodeContext`, runs the
//! startup recovery check and then idles, logging periodic status, while
//! polling the shutdown flag described in spec §5 ("Cancellation"). The P2P
//! gossip transport, wallet and RPC dispatcher that would actually drive
//! block production are out of scope (spec §1); this binary only proves out
//! the wiring between config, the node context and the library's consensus
//! components.

use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bathron_core::config::NodeConfig;
use bathron_core::node::NodeContext;
use slog::{error, info, warn};

fn main() {
    let args: Vec<String> = env::args().collect();
    let config_path = match parse_config_path(&args) {
        Some(p) => p,
        None => {
            eprintln!("usage: {} --config <config_file.toml>", args.first().map(String::as_str).unwrap_or("bathron-node"));
            std::process::exit(1);
        }
    };

    let config = match NodeConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    let ctx = match NodeContext::open(&config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to open node context: {e}");
            std::process::exit(1);
        }
    };

    info!(ctx.logger, "bathron-node starting";
        "network" => ?config.consensus_network(),
        "data_dir" => config.data_dir.display().to_string(),
        "btcheaderspublish" => config.btcspv.btcheaderspublish,
        "btcburnsenabled" => config.consensus.btcburnsenabled,
    );

    // A Resource-class failure aborts the node after logging (spec §7):
    // running past an inconsistent recovery marker would silently
    // desynchronize A5/A6.
    if let Err(e) = ctx.startup_check() {
        error!(ctx.logger, "startup recovery check failed, refusing to start"; "error" => %e);
        std::process::exit(1);
    }

    if let Some(operator_key) = config.masternode.operator_secret_key().unwrap_or(None) {
        let secp = secp256k1::Secp256k1::new();
        let pubkey = secp256k1::PublicKey::from_secret_key(&secp, &operator_key);
        info!(ctx.logger, "running with a configured masternode operator key"; "operator_pubkey" => hex::encode(pubkey.serialize()));
    }

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    {
        let flag = shutdown_requested.clone();
        if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
            warn!(ctx.logger, "failed to install signal handler, Ctrl-C will not shut the node down cleanly"; "error" => %e);
        }
    }

    run_event_loop(&ctx, &shutdown_requested);

    info!(ctx.logger, "bathron-node shutdown complete");
}

fn parse_config_path(args: &[String]) -> Option<PathBuf> {
    let idx = args.iter().position(|a| a == "--config")?;
    args.get(idx + 1).map(PathBuf::from)
}

/// Polls `shutdown_requested` at every loop boundary per spec §5, logging a
/// metrics snapshot every `target_spacing` seconds — the masternode block
/// cadence for this network.
fn run_event_loop(ctx: &NodeContext, shutdown_requested: &AtomicBool) {
    let start = Instant::now();
    let tick = Duration::from_secs(ctx.params.target_spacing.max(1));

    while !shutdown_requested.load(Ordering::SeqCst) {
        std::thread::sleep(tick.min(Duration::from_secs(1)));
        if shutdown_requested.load(Ordering::SeqCst) {
            break;
        }
        if start.elapsed().as_secs() % tick.as_secs().max(1) == 0 {
            let snapshot = ctx.metrics.snapshot();
            info!(ctx.logger, "status";
                "uptime_secs" => start.elapsed().as_secs(),
                "blocks_connected" => snapshot.blocks_connected,
                "last_finalized_height" => snapshot.last_finalized_height,
                "finality_lag_blocks" => snapshot.finality_lag_blocks,
                "btc_tip_height" => ctx.spv.tip_height().unwrap_or(0),
            );
        }
    }
}
