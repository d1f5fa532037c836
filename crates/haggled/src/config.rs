//! Configuration for haggled.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Security levels recognised by the Security Manager (spec §4.9).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
}

impl SecurityLevel {
    pub fn from_flag(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::Low),
            1 => Some(Self::Medium),
            2 => Some(Self::High),
            _ => None,
        }
    }
}

impl Default for SecurityLevel {
    fn default() -> Self {
        Self::Medium
    }
}

/// haggled - opportunistic, search-based content dissemination daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "haggled")]
#[command(about = "Haggle: a node-local daemon for opportunistic, search-based content dissemination")]
pub struct Config {
    /// Data directory for the sled store and PID file.
    #[arg(short = 'p', long, default_value = "./data/haggled")]
    pub data_dir: PathBuf,

    /// Turn off interactive information (-I).
    #[arg(short = 'I', long)]
    pub non_interactive: bool,

    /// Run in the background as a daemon (-d).
    #[arg(short = 'd', long)]
    pub daemonize: bool,

    /// Delete the data store before starting (-dd).
    #[arg(long = "delete-datastore")]
    pub delete_datastore: bool,

    /// Write debug output to a file instead of stderr (-f).
    #[arg(short = 'f', long = "filelog")]
    pub filelog: bool,

    /// Advance create time in the node description on every Bloom filter
    /// update (-c).
    #[arg(short = 'c', long = "create-time-bloomfilter")]
    pub create_time_on_bloomfilter_update: bool,

    /// Security level 0-2 (low, medium, high); default medium (-s).
    #[arg(short = 's', long = "security-level", default_value = "1")]
    pub security_level: u8,

    /// Local application port (UDP) for IPC with applications.
    #[arg(long, default_value = "8787")]
    pub application_port: u16,

    /// TCP port the protocol engine listens on for peer connections.
    #[arg(long, default_value = "7676")]
    pub peer_port: u16,

    /// Log format (json or pretty).
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if SecurityLevel::from_flag(self.security_level).is_none() {
            anyhow::bail!("security level must be 0, 1, or 2, got {}", self.security_level);
        }
        if self.log_format != "pretty" && self.log_format != "json" {
            anyhow::bail!("log format must be 'pretty' or 'json', got '{}'", self.log_format);
        }
        Ok(())
    }

    pub fn security_level(&self) -> SecurityLevel {
        SecurityLevel::from_flag(self.security_level).unwrap_or_default()
    }

    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("haggled.pid")
    }
}

/// Persisted node identity, surviving process restarts. Kept separate from
/// the repository key/value store because it must be readable before the
/// store is opened (the repository's own key, `SecurityManager -> privkey`,
/// is what the security manager reads once storage is up).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// This node's stable name.
    pub name: String,
    /// Resolution threshold (spec §3, `Node.matching_threshold`).
    pub matching_threshold: u32,
    /// Max objects handed back per match (spec §3, `Node.max_objects_per_match`).
    pub max_objects_per_match: u32,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            name: "haggle-node".to_string(),
            matching_threshold: haggle_core::node::DEFAULT_MATCHING_THRESHOLD,
            max_objects_per_match: haggle_core::node::DEFAULT_MAX_OBJECTS_PER_MATCH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_level_from_flag() {
        assert_eq!(SecurityLevel::from_flag(0), Some(SecurityLevel::Low));
        assert_eq!(SecurityLevel::from_flag(1), Some(SecurityLevel::Medium));
        assert_eq!(SecurityLevel::from_flag(2), Some(SecurityLevel::High));
        assert_eq!(SecurityLevel::from_flag(3), None);
    }

    #[test]
    fn default_node_state_matches_node_defaults() {
        let state = NodeState::default();
        assert_eq!(state.matching_threshold, 1);
        assert_eq!(state.max_objects_per_match, 5);
    }
}
