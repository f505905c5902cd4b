//! Declarative configuration fed to the lifecycle functions in `master`.

use serde::{Deserialize, Serialize};

/// An endpoint: one leg of a container into a network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConfigEP {
    pub container: String,
    pub host: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    pub service_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConfigNetwork {
    pub name: String,
    pub nw_type: String,
    // overrides for when auto allocation is not wanted
    pub pkt_tag_type: String,
    pub pkt_tag: u32,
    #[serde(rename = "SubnetCIDR")]
    pub subnet_cidr: String,
    pub gateway: String,
    pub endpoints: Vec<ConfigEP>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConfigTenant {
    pub name: String,
    pub default_net_type: String,
    pub default_network: String,
    pub subnet_pool: String,
    pub alloc_subnet_len: u32,
    #[serde(rename = "VLANs")]
    pub vlans: String,
    #[serde(rename = "VXLANs")]
    pub vxlans: String,
    pub networks: Vec<ConfigNetwork>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConfigHost {
    pub name: String,
    pub intf: String,
    #[serde(rename = "VtepIP")]
    pub vtep_ip: String,
    #[serde(rename = "NetID")]
    pub net_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServiceLbConfig {
    pub service_name: String,
    pub tenant: String,
    pub network: String,
    pub selectors: std::collections::BTreeMap<String, String>,
    pub ports: Vec<String>,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
}

/// Top-level intent: tenants with their networks and endpoints, plus hosts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    pub tenants: Vec<ConfigTenant>,
    pub hosts: Vec<ConfigHost>,
}

impl Config {
    pub fn parse(bytes: &[u8]) -> anyhow::Result<Config> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
