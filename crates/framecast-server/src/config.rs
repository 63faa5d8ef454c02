use serde::Deserialize;

/// Relay configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind on (default "0.0.0.0").
    /// Replies leave from this address, so on multi-homed hosts set it to the
    /// address clients send to.
    #[serde(default = "default_host")]
    pub host: String,

    /// UDP port for frame datagrams.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Kernel receive buffer. Video keyframes arrive as bursts of dozens of
    /// datagrams.
    #[serde(default = "default_buffer_bytes")]
    pub recv_buffer_bytes: usize,

    #[serde(default = "default_buffer_bytes")]
    pub send_buffer_bytes: usize,

    /// Maximum peers tracked at once. Datagrams from further peers are dropped.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Seconds of silence after which a peer is forgotten.
    #[serde(default = "default_peer_idle_timeout_secs")]
    pub peer_idle_timeout_secs: u64,

    /// Probability in [0, 1] of discarding a datagram instead of echoing it.
    #[serde(default)]
    pub drop_probability: f64,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    4433
}

fn default_buffer_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_max_peers() -> usize {
    64
}

fn default_peer_idle_timeout_secs() -> u64 {
    30
}

impl ServerConfig {
    /// Reject settings the relay cannot honor.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.drop_probability) {
            anyhow::bail!("drop_probability must be within [0, 1], got {}", self.drop_probability);
        }
        if self.max_peers == 0 {
            anyhow::bail!("max_peers must be at least 1");
        }
        if self.peer_idle_timeout_secs == 0 {
            anyhow::bail!("peer_idle_timeout_secs must be at least 1");
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            recv_buffer_bytes: default_buffer_bytes(),
            send_buffer_bytes: default_buffer_bytes(),
            max_peers: default_max_peers(),
            peer_idle_timeout_secs: default_peer_idle_timeout_secs(),
            drop_probability: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 4433);
        assert_eq!(config.max_peers, 64);
        assert_eq!(config.recv_buffer_bytes, 2 * 1024 * 1024);
        assert_eq!(config.drop_probability, 0.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            host = "127.0.0.1"
            port = 5678
            max_peers = 8
            drop_probability = 0.05
        "#;
        let config: ServerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5678);
        assert_eq!(config.max_peers, 8);
        assert_eq!(config.drop_probability, 0.05);
        // Unset fields keep their defaults.
        assert_eq!(config.peer_idle_timeout_secs, 30);
        assert_eq!(config.send_buffer_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn empty_toml_is_default() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.port, ServerConfig::default().port);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let config = ServerConfig { drop_probability: 1.5, ..ServerConfig::default() };
        assert!(config.validate().is_err());
        let config = ServerConfig { max_peers: 0, ..ServerConfig::default() };
        assert!(config.validate().is_err());
        let config = ServerConfig { peer_idle_timeout_secs: 0, ..ServerConfig::default() };
        assert!(config.validate().is_err());
    }
}
