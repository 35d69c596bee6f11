use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::fs;

/// One cluster member: a nonzero ID and a `host:port` transport address.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: u64,
    pub addr: String,
}

/// The fixed, ordered member list every node is started with. A node is
/// identified by its index into this list; the composition is immutable
/// for the life of the process.
#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    pub members: Vec<Member>,
}

impl ClusterConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("read {path}"))?;
        let cfg: ClusterConfig = toml::from_str(&content).with_context(|| format!("parse {path}"))?;
        ensure!(!cfg.members.is_empty(), "cluster has no members");
        for m in &cfg.members {
            ensure!(m.id != 0, "member id must not be 0");
        }
        Ok(cfg)
    }
}
