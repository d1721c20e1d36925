//! Bridge configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default public bootstrap peers (the IPFS bootstrap set)
pub const DEFAULT_BOOTSTRAP_NODES: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

fn default_ipfs_get_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_stream_open_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_bootstrap_nodes() -> Vec<String> {
    DEFAULT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect()
}

/// Bridge-wide settings shared by every managed peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Log verbosity (0 = quiet, 1 = connection events, 2 = per-message)
    #[serde(default)]
    pub verbosity: u8,

    /// Timeout for block-store gets
    #[serde(default = "default_ipfs_get_timeout", with = "duration_secs")]
    pub ipfs_get_timeout: Duration,

    /// Timeout for opening an application stream to a remote peer
    #[serde(default = "default_stream_open_timeout", with = "duration_secs")]
    pub stream_open_timeout: Duration,

    /// Topic on which peers announce file-tree updates (optional)
    #[serde(default)]
    pub file_update_notify_topic: Option<String>,

    /// Bootstrap peers for the DHT (multiaddrs including /p2p/ component)
    #[serde(default = "default_bootstrap_nodes")]
    pub bootstrap_nodes: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            verbosity: 0,
            ipfs_get_timeout: default_ipfs_get_timeout(),
            stream_open_timeout: default_stream_open_timeout(),
            file_update_notify_topic: None,
            bootstrap_nodes: default_bootstrap_nodes(),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.verbosity, 0);
        assert_eq!(config.ipfs_get_timeout, Duration::from_secs(3));
        assert_eq!(config.stream_open_timeout, Duration::from_secs(10));
        assert!(config.file_update_notify_topic.is_none());
        assert!(!config.bootstrap_nodes.is_empty());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let mut config = BridgeConfig::default();
        config.verbosity = 2;
        config.file_update_notify_topic = Some("p2p-webapp-files".to_string());

        let json = serde_json::to_string(&config).unwrap();
        let parsed: BridgeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.verbosity, 2);
        assert_eq!(
            parsed.file_update_notify_topic.as_deref(),
            Some("p2p-webapp-files")
        );
        assert_eq!(parsed.ipfs_get_timeout, config.ipfs_get_timeout);
    }

    #[test]
    fn test_bootstrap_nodes_parse_as_multiaddrs() {
        use libp2p::Multiaddr;

        for addr in DEFAULT_BOOTSTRAP_NODES {
            addr.parse::<Multiaddr>().expect("bootstrap addr must parse");
        }
    }
}
