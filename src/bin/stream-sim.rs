//! Run a streaming plan across simulated in-process nodes and print what the
//! reporting API sees while it runs.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use shard_stream::storage::MemoryStorage;
use shard_stream::streaming::types::TableId;
use shard_stream::transport::MemoryNetwork;
use shard_stream::{logging, report, StreamNode, StreamPlan, StreamingConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "stream-sim", version, about = "Simulate a multi-node streaming plan")]
struct Cli {
    /// Number of nodes, including the initiator
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Shards per node (defaults to the configured value)
    #[arg(long, env = "SHARD_STREAM_SHARDS")]
    shards: Option<usize>,

    /// Files per table on every node
    #[arg(long, default_value_t = 4)]
    files: usize,

    /// Size of each file in bytes
    #[arg(long, default_value_t = 256 * 1024)]
    file_size: usize,

    /// Chunk size in bytes
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Compress chunks with lz4
    #[arg(long)]
    compress: bool,

    /// Cut the link to this node index after that many frames
    #[arg(long, value_names = ["NODE", "FRAMES"], num_args = 2)]
    disconnect: Option<Vec<usize>>,

    /// Per-frame network latency in milliseconds
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,

    /// Print the current streams every N milliseconds while the plan runs
    #[arg(long, default_value_t = 0)]
    watch_ms: u64,

    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn node_addr(index: usize) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, (index + 1) as u8], 7000))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let mut config = match &cli.config {
        Some(path) => StreamingConfig::load(path)?,
        None => StreamingConfig::from_env(),
    };
    if let Some(shards) = cli.shards {
        config.shard_count = shards;
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.chunk_size = chunk_size;
    }
    config.compress |= cli.compress;
    config.validate()?;

    if cli.nodes < 2 || cli.nodes > 250 {
        anyhow::bail!("--nodes must be between 2 and 250");
    }

    let net = MemoryNetwork::new();
    if cli.latency_ms > 0 {
        net.set_latency(Some(Duration::from_millis(cli.latency_ms)));
    }
    if let Some(spec) = &cli.disconnect {
        net.disconnect_after(node_addr(spec[0]), spec[1]);
    }

    let outbound = TableId::from_u128(1);
    let inbound = TableId::from_u128(2);
    let payload = Bytes::from(vec![0x5au8; cli.file_size]);

    let mut nodes = Vec::with_capacity(cli.nodes);
    for index in 0..cli.nodes {
        let storage = Arc::new(MemoryStorage::new());
        let table = if index == 0 { outbound } else { inbound };
        for file in 0..cli.files {
            storage.insert_file(table, format!("node{}-{}-Data.db", index, file), payload.clone());
        }
        let (transport, incoming) = net.bind(node_addr(index));
        let mut node = StreamNode::start(config.clone(), Arc::new(transport), storage)
            .with_context(|| format!("starting node {}", index))?;
        node.serve(incoming);
        nodes.push(node);
    }

    let mut plan = StreamPlan::new("simulated rebuild");
    for index in 1..cli.nodes {
        plan = plan
            .transfer_ranges(node_addr(index), [outbound])
            .request_ranges(node_addr(index), [inbound]);
    }
    let mut handle = plan.execute(&nodes[0]).await?;

    let outcome = if cli.watch_ms > 0 {
        let mut ticker = tokio::time::interval(Duration::from_millis(cli.watch_ms));
        loop {
            tokio::select! {
                outcome = handle.wait() => break outcome?,
                _ = ticker.tick() => {
                    let streams = nodes[0].get_current_streams().await;
                    println!("{}", report::to_json(&streams)?);
                }
            }
        }
    } else {
        handle.wait().await?
    };

    println!("{}", report::to_json(std::slice::from_ref(&shard_stream::StreamState {
        plan_id: outcome.plan_id,
        description: outcome.description.clone(),
        sessions: outcome.sessions.clone(),
    }))?);
    let totals = nodes[0].progress_totals().await;
    eprintln!(
        "plan {} {}: {} sessions, {} plans still registered",
        outcome.plan_id,
        if outcome.is_success() { "completed" } else { "failed" },
        outcome.sessions.len(),
        totals.plans
    );

    for node in nodes {
        node.shutdown().await?;
    }
    if !outcome.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
