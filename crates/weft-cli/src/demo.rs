//! In-process topology demo.
//!
//! Builds a line `node-0 <-> node-1 <-> ... <-> node-(n-1)`, serves `ping`
//! on the last node and calls it from the first, so every call is proxied
//! through each intermediate node in both directions.

use crate::config::{DemoConfig, DemoTransport};
use std::time::Duration;
use tracing::info;
use weft_wire::{
    Channel, ChannelConfig, ChannelError, ChannelResult, ChannelStats, Port, RemoteClient,
    RemoteHost, StreamPipe,
};

/// What a demo run observed.
#[derive(Debug)]
pub struct DemoReport {
    pub client: String,
    pub host: String,
    /// Next hop from the client toward the host.
    pub via: String,
    /// `(argument, result)` of each successful `ping`.
    pub results: Vec<(i64, i64)>,
    pub stats: Vec<(String, ChannelStats)>,
    pub elapsed: Duration,
}

fn node_id(index: usize) -> String {
    format!("node-{index}")
}

/// Wire neighbours `left` and `right` with the configured transport.
fn link(left: &Channel, right: &Channel, transport: DemoTransport) -> ChannelResult<()> {
    match transport {
        DemoTransport::Port => {
            let port = Port::new();
            left.add_pipe(port.create_pipe(left.id()))?;
            right.add_pipe(port.create_pipe(right.id()))?;
        }
        DemoTransport::Stream => {
            let (a, b) = StreamPipe::pair();
            left.add_pipe(a)?;
            right.add_pipe(b)?;
        }
    }
    Ok(())
}

/// Build the line, run the calls and tear everything down.
pub async fn run_demo(template: &ChannelConfig, demo: &DemoConfig) -> ChannelResult<DemoReport> {
    let started = std::time::Instant::now();
    let count = demo.nodes.max(2);

    let channels: Vec<Channel> = (0..count)
        .map(|i| {
            Channel::new(ChannelConfig {
                id: node_id(i),
                ..template.clone()
            })
        })
        .collect();
    for pair in channels.windows(2) {
        link(&pair[0], &pair[1], demo.transport)?;
    }
    info!(nodes = count, transport = %demo.transport, "Demo topology wired");

    let host_channel = &channels[count - 1];
    let _host = RemoteHost::builder(host_channel.clone())
        .procedure("ping", |(n,): (i64,)| async move { Ok::<_, String>(n + 1) })
        .serve();

    let client = RemoteClient::new(host_channel.id(), channels[0].clone());
    let connect_timeout = template.call_timeout();
    let via = match tokio::time::timeout(connect_timeout, client.connect()).await {
        Ok(via) => via?,
        Err(_) => {
            return Err(ChannelError::Timeout {
                name: "connect".to_string(),
                timeout_ms: connect_timeout.as_millis() as u64,
            })
        }
    };

    let mut results = Vec::with_capacity(demo.calls as usize);
    for n in 0..i64::from(demo.calls) {
        let reply: i64 = client.run("ping", (n,)).await?;
        results.push((n, reply));
    }

    let stats = channels
        .iter()
        .map(|channel| (channel.id().to_string(), channel.stats()))
        .collect();
    for channel in &channels {
        channel.destroy();
    }

    Ok(DemoReport {
        client: channels[0].id().to_string(),
        host: host_channel.id().to_string(),
        via,
        results,
        stats,
        elapsed: started.elapsed(),
    })
}
