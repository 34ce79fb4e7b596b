use std::collections::HashMap;

use clap::Parser;
use quorum::server::{Config, Server};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// This node's numeric ID (must be unique in the cluster).
    #[arg(long)]
    id: u64,

    /// TCP address to listen on for peer RPCs.
    #[arg(long)]
    addr: String,

    /// HTTP address for the client API.
    #[arg(long)]
    api_addr: String,

    /// A peer in the form ID=ADDR. Repeat for each peer.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Directory for persistent state (meta.json, log.jsonl).
    #[arg(long)]
    data_dir: std::path::PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut peers: HashMap<String, String> = HashMap::new();
    for p in &args.peers {
        let (id, addr) = p
            .split_once('=')
            .ok_or_else(|| format!("--peer must be ID=ADDR, got: {p}"))?;
        peers.insert(id.to_string(), addr.to_string());
    }

    Server::start(Config {
        id: args.id,
        addr: args.addr,
        api_addr: args.api_addr,
        peers,
        data_dir: args.data_dir,
    })?
    .run()?;

    Ok(())
}
