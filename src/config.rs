use anyhow::Result;
use serde::Deserialize;
use std::fs;

#[derive(Deserialize, Clone)]
pub struct PeerCfg {
    pub id: String,
    pub addr: String,
}

#[derive(Deserialize)]
pub struct Config {
    pub node_id: String,
    pub host: Option<String>,
    pub port: u16,
    pub peers: Vec<PeerCfg>,
    pub data_dir: String,
}

impl Config {
    pub fn new(file: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(&fs::read_to_string(file)?)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_roster() {
        let cfg: Config = toml::from_str(
            r#"
            node_id = "n1"
            port = 50051
            data_dir = "/tmp/grovekv"

            [[peers]]
            id = "n1"
            addr = "http://[::1]:50051"

            [[peers]]
            id = "n2"
            addr = "http://[::1]:50052"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.node_id, "n1");
        assert!(cfg.host.is_none());
        assert_eq!(cfg.peers.len(), 2);
        assert_eq!(cfg.peers[1].addr, "http://[::1]:50052");
    }
}
