//! Weft CLI: exercise gossip-routed channels from the terminal.

mod cli;
mod config;
mod demo;
mod ui;

use crate::cli::{Cli, Commands};
use crate::config::{load_config, WeftConfig};
use clap::Parser;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref());

    match cli.command.unwrap_or(Commands::Demo {
        nodes: None,
        transport: None,
        calls: None,
    }) {
        Commands::Demo {
            nodes,
            transport,
            calls,
        } => {
            if let Some(nodes) = nodes {
                config.demo.nodes = nodes;
            }
            if let Some(transport) = transport {
                config.demo.transport = transport;
            }
            if let Some(calls) = calls {
                config.demo.calls = calls;
            }
            cmd_demo(&config).await;
        }
        Commands::Config => cmd_config(&config),
    }
}

async fn cmd_demo(config: &WeftConfig) {
    ui::section("Weft topology demo");
    ui::kv("Nodes", &config.demo.nodes.max(2).to_string());
    ui::kv("Transport", &config.demo.transport.to_string());
    ui::kv("Namespace", &config.channel.namespace);
    ui::blank();

    match demo::run_demo(&config.channel, &config.demo).await {
        Ok(report) => {
            ui::kv_ok("Route", &format!("{} -> {} via {}", report.client, report.host, report.via));
            for (n, reply) in &report.results {
                ui::success(&format!("ping({n}) = {reply}"));
            }
            ui::blank();
            ui::section("Channel stats");
            for (id, stats) in &report.stats {
                ui::kv(
                    id,
                    &format!(
                        "handshakes={} changes={} proxied={} no-route={} bounces={}",
                        stats.handshakes_received,
                        stats.topology_changes,
                        stats.messages_proxied,
                        stats.dropped_no_route,
                        stats.bounces_dropped,
                    ),
                );
            }
            ui::blank();
            ui::kv("Elapsed", &format!("{:.1?}", report.elapsed));
        }
        Err(e) => {
            ui::error(&format!("Demo failed: {e}"));
            ui::hint("raise channel.call_timeout_ms or run with RUST_LOG=weft_wire=debug");
            std::process::exit(1);
        }
    }
}

fn cmd_config(config: &WeftConfig) {
    match toml::to_string_pretty(config) {
        Ok(text) => print!("{text}"),
        Err(e) => {
            ui::error(&format!("Failed to render config: {e}"));
            std::process::exit(1);
        }
    }
}
