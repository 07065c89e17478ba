//! Configuration types for ethspv-node.
//! Parsed from ~/.ethspv/config.toml.

use ethspv_protocol::discovery::Node;
use ethspv_protocol::{BlockHeader, CURRENT_PARAMS, H256, U256};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Mainnet genesis block hash.
pub const MAINNET_GENESIS_HASH: &str =
    "d4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3";
/// Mainnet genesis difficulty (0x400000000), which is also its total difficulty.
pub const MAINNET_GENESIS_DIFFICULTY: &str = "17179869184";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_key_file")]
    pub key_file: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            key_file: default_key_file(),
            data_dir: default_data_dir(),
            client_id: default_client_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_network_id")]
    pub network_id: u64,
    #[serde(default = "default_genesis_hash")]
    pub genesis_hash: String,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_port")]
    pub tcp_port: u16,
    #[serde(default = "default_port")]
    pub udp_port: u16,
    /// Bootnodes as enode URLs.
    #[serde(default)]
    pub bootnodes: Vec<String>,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            network_id: default_network_id(),
            genesis_hash: default_genesis_hash(),
            listen_host: default_listen_host(),
            tcp_port: default_port(),
            udp_port: default_port(),
            bootnodes: Vec::new(),
            max_peers: default_max_peers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_headers_limit")]
    pub headers_limit: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Trusted header sync starts from when nothing is stored yet.
    #[serde(default)]
    pub checkpoint_number: u64,
    #[serde(default = "default_genesis_hash")]
    pub checkpoint_hash: String,
    /// Total difficulty at the checkpoint, decimal.
    #[serde(default = "default_checkpoint_td")]
    pub checkpoint_total_difficulty: String,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            headers_limit: default_headers_limit(),
            request_timeout_secs: default_request_timeout(),
            max_attempts: default_max_attempts(),
            checkpoint_number: 0,
            checkpoint_hash: default_genesis_hash(),
            checkpoint_total_difficulty: default_checkpoint_td(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_alpha")]
    pub alpha: usize,
    #[serde(default = "default_lookup_interval")]
    pub lookup_interval_secs: u64,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: true,
            alpha: default_alpha(),
            lookup_interval_secs: default_lookup_interval(),
            session_timeout_secs: default_session_timeout(),
        }
    }
}

// Default value functions
fn default_key_file() -> String {
    "~/.ethspv/node.key".into()
}
fn default_data_dir() -> String {
    "~/.ethspv/data".into()
}
fn default_client_id() -> String {
    format!("ethspv/v{}", env!("CARGO_PKG_VERSION"))
}
fn default_network_id() -> u64 {
    1
}
fn default_genesis_hash() -> String {
    MAINNET_GENESIS_HASH.into()
}
fn default_listen_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    30303
}
fn default_max_peers() -> usize {
    5
}
fn default_headers_limit() -> u64 {
    CURRENT_PARAMS.headers_limit
}
fn default_request_timeout() -> u64 {
    CURRENT_PARAMS.request_timeout_secs
}
fn default_max_attempts() -> u32 {
    CURRENT_PARAMS.max_task_attempts
}
fn default_checkpoint_td() -> String {
    MAINNET_GENESIS_DIFFICULTY.into()
}
fn default_true() -> bool {
    true
}
fn default_alpha() -> usize {
    CURRENT_PARAMS.discovery_alpha
}
fn default_lookup_interval() -> u64 {
    30
}
fn default_session_timeout() -> u64 {
    CURRENT_PARAMS.discovery_session_timeout_secs
}

fn parse_h256(field: &str, text: &str) -> anyhow::Result<H256> {
    let bytes = hex::decode(text.trim_start_matches("0x"))
        .map_err(|e| anyhow::anyhow!("{field}: {e}"))?;
    if bytes.len() != 32 {
        anyhow::bail!("{field}: expected 32 bytes, got {}", bytes.len());
    }
    Ok(H256::from_slice(&bytes))
}

impl NetworkSection {
    pub fn genesis(&self) -> anyhow::Result<H256> {
        parse_h256("network.genesis_hash", &self.genesis_hash)
    }

    /// Parse every bootnode URL; the first bad one is an error.
    pub fn bootnodes(&self) -> anyhow::Result<Vec<Node>> {
        self.bootnodes
            .iter()
            .map(|url| {
                Node::from_enode(url).map_err(|e| anyhow::anyhow!("bootnode {url}: {e}"))
            })
            .collect()
    }
}

impl SyncSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The trusted anchor. Only hash, number and total difficulty are
    /// known; the first synced window fills in the rest.
    pub fn checkpoint(&self) -> anyhow::Result<BlockHeader> {
        let total_difficulty = U256::from_dec_str(&self.checkpoint_total_difficulty)
            .map_err(|e| anyhow::anyhow!("sync.checkpoint_total_difficulty: {e:?}"))?;
        Ok(BlockHeader {
            hash: parse_h256("sync.checkpoint_hash", &self.checkpoint_hash)?,
            number: self.checkpoint_number,
            total_difficulty,
            ..Default::default()
        })
    }
}

impl NodeConfig {
    /// Load config from file, or create default if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.network.network_id, 1);
        assert_eq!(cfg.network.tcp_port, 30303);
        assert_eq!(cfg.sync.headers_limit, 50);
        assert_eq!(cfg.sync.max_attempts, 3);
        assert_eq!(cfg.discovery.alpha, 3);
        assert!(cfg.discovery.enabled);
        assert!(cfg.node.client_id.starts_with("ethspv/"));
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[node]
key_file = "~/.ethspv/node.key"
client_id = "ethspv/test"

[network]
network_id = 3
tcp_port = 30304
bootnodes = [
    "enode://a979fb575495b8d6db44f750317d0f4622bf4c2aa3365d6af7c284339968eef29b69ad0dce72a4d8db5ebb4968de0e3bec910127f134779fbcb0cb6d3331163c@52.16.188.185:30303",
    "enode://3f1d12044546b76342d59d4a05532c14b85aa669704bfe1f864fe079415aa2c02d743e03218e57a33fb94523adb54032871a6c51b2cc5514cb7c7e35b3ed0a99@13.93.211.84:30303?discport=30301",
]

[sync]
headers_limit = 20
request_timeout_secs = 5

[discovery]
enabled = false
"#;

        let cfg: NodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.node.client_id, "ethspv/test");
        assert_eq!(cfg.node.data_dir, "~/.ethspv/data");
        assert_eq!(cfg.network.network_id, 3);
        assert_eq!(cfg.network.udp_port, 30303);
        assert_eq!(cfg.sync.headers_limit, 20);
        assert_eq!(cfg.sync.request_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.sync.max_attempts, 3);
        assert!(!cfg.discovery.enabled);

        let nodes = cfg.network.bootnodes().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].endpoint.tcp_port, 30303);
        assert_eq!(nodes[1].endpoint.udp_port, 30301);
    }

    #[test]
    fn test_empty_file_is_all_defaults() {
        let cfg: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.network.max_peers, 5);
        assert_eq!(cfg.network.genesis().unwrap(), cfg.sync.checkpoint().unwrap().hash);
    }

    #[test]
    fn test_checkpoint_fields() {
        let checkpoint = SyncSection::default().checkpoint().unwrap();
        assert_eq!(checkpoint.number, 0);
        assert_eq!(checkpoint.total_difficulty, U256::from(0x4_0000_0000u64));
    }

    #[test]
    fn test_bad_values_rejected() {
        let mut cfg = NodeConfig::default();
        cfg.network.genesis_hash = "abcd".into();
        assert!(cfg.network.genesis().is_err());
        cfg.network.bootnodes = vec!["enode://nope".into()];
        assert!(cfg.network.bootnodes().is_err());
        cfg.sync.checkpoint_total_difficulty = "lots".into();
        assert!(cfg.sync.checkpoint().is_err());
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = NodeConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.network.network_id, 1);

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[network]\nmax_peers = 9\n").unwrap();
        let cfg = NodeConfig::load_or_default(&path).unwrap();
        assert_eq!(cfg.network.max_peers, 9);
    }

    #[test]
    fn test_serialise_default() {
        let cfg = NodeConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        assert!(toml_str.contains("[node]"));
        assert!(toml_str.contains("[discovery]"));
        assert!(toml_str.contains("checkpoint_hash"));
    }
}
