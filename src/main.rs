use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};
use env_logger::Env;
use raftfs::{ClusterConfig, FileMachine, RaftNode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    // Usage: cargo run -- cluster.toml INDEX
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <cluster.toml> <index>", args[0]);
        eprintln!("  where <index> selects this node in the member list");
        std::process::exit(1);
    }

    let config = ClusterConfig::from_file(&args[1])?;
    let me: usize = args[2].parse().context("index must be a number")?;
    if me >= config.members.len() {
        bail!(
            "index {me} out of range for {} members",
            config.members.len()
        );
    }

    let id = config.members[me].id;
    let addr = config.members[me].addr.clone();
    let machine = Arc::new(FileMachine::new(format!("data_{id}"))?);
    let node = RaftNode::new(config.members, me, machine, format!("meta_{id}"));

    node.start().await?;
    log::info!("node {id} listening on {addr}");

    tokio::signal::ctrl_c().await?;
    node.stop();
    Ok(())
}
