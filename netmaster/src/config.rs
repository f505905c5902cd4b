use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

fn default_listen_url() -> String {
    "0.0.0.0:9999".to_string()
}

fn default_lock_ttl() -> u64 {
    30
}

fn default_service_ttl() -> u64 {
    10
}

fn default_settle_ms() -> u64 {
    1000
}

fn default_rpc_port() -> u16 {
    9001
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetmasterConfig {
    // address the REST API binds to
    #[serde(default = "default_listen_url")]
    pub listen_url: String,
    // address other nodes use to reach this one; also the lock holder id
    #[serde(default = "default_listen_url")]
    pub control_url: String,
    pub store: StoreConfig,
    #[serde(default = "default_lock_ttl")]
    pub leader_lock_ttl: u64,
    #[serde(default = "default_service_ttl")]
    pub service_ttl: u64,
    #[serde(default = "default_settle_ms")]
    pub follower_settle_ms: u64,
    #[serde(default)]
    pub defaults: ModelDefaults,
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Tag pools handed to tenants created through the object model.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelDefaults {
    pub vlans: String,
    pub vxlans: String,
    pub default_net_type: String,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            vlans: "1-4094".to_string(),
            vxlans: "1-10000".to_string(),
            default_net_type: "vxlan".to_string(),
        }
    }
}

pub fn load_config(path: &str) -> Result<NetmasterConfig> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: NetmasterConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}
