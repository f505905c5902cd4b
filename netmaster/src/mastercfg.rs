//! Persisted control-plane records and their key layout.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fixedbitset::FixedBitSet;
use libresource::bitset::serde_bits;
use libresource::{StateDriver, StateError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A record stored at `<PREFIX><id>`.
pub trait StateRecord: Serialize + DeserializeOwned + Send + Sync {
    const PREFIX: &'static str;

    fn id(&self) -> &str;

    fn key_for(id: &str) -> String {
        format!("{}{id}", Self::PREFIX)
    }
}

pub async fn read_record<T: StateRecord>(
    driver: &Arc<dyn StateDriver>,
    id: &str,
) -> Result<T, StateError> {
    driver.read_state(&T::key_for(id)).await
}

pub async fn try_read_record<T: StateRecord>(
    driver: &Arc<dyn StateDriver>,
    id: &str,
) -> Result<Option<T>, StateError> {
    driver.try_read_state(&T::key_for(id)).await
}

pub async fn write_record<T: StateRecord>(
    driver: &Arc<dyn StateDriver>,
    rec: &T,
) -> Result<(), StateError> {
    driver.write_state(&T::key_for(rec.id()), rec).await
}

pub async fn clear_record<T: StateRecord>(
    driver: &Arc<dyn StateDriver>,
    id: &str,
) -> Result<(), StateError> {
    driver.clear_state(&T::key_for(id)).await
}

/// Every record of type `T`; an empty store lists as empty.
pub async fn list_records<T: StateRecord>(
    driver: &Arc<dyn StateDriver>,
) -> Result<Vec<T>, StateError> {
    driver.list_state(T::PREFIX).await
}

macro_rules! state_prefix {
    ($name:literal) => {
        concat!("/contiv.io/state/", $name, "/")
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    pub id: String,
    pub tenant: String,
    pub network_name: String,
    pub nw_type: String,
    pub pkt_tag_type: String,
    pub pkt_tag: u32,
    pub ext_pkt_tag: u32,
    #[serde(rename = "subnetIP")]
    pub subnet_ip: String,
    pub subnet_len: u32,
    pub gateway: String,
    pub subnet_is_allocated: bool,
    #[serde(default)]
    pub pkt_tag_is_allocated: bool,
    pub ep_count: u32,
    #[serde(with = "serde_bits")]
    pub ip_alloc_map: FixedBitSet,
}

impl StateRecord for NetworkState {
    const PREFIX: &'static str = state_prefix!("nets");

    fn id(&self) -> &str {
        &self.id
    }
}

impl NetworkState {
    pub fn subnet_cidr(&self) -> String {
        format!("{}/{}", self.subnet_ip, self.subnet_len)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointState {
    pub id: String,
    #[serde(rename = "netID")]
    pub net_id: String,
    #[serde(rename = "endpointID")]
    pub endpoint_id: String,
    pub service_name: String,
    pub endpoint_group_id: u32,
    pub endpoint_group_key: String,
    pub ip_address: String,
    pub mac_address: String,
    pub homing_host: String,
    pub intf_name: String,
    #[serde(rename = "vtepIP")]
    pub vtep_ip: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub container_id: String,
    pub ep_common_name: String,
}

impl StateRecord for EndpointState {
    const PREFIX: &'static str = state_prefix!("eps");

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointGroupState {
    pub id: String,
    pub group_name: String,
    pub tenant_name: String,
    pub network_name: String,
    pub endpoint_group_id: u32,
    pub pkt_tag_type: String,
    pub pkt_tag: u32,
    pub ext_pkt_tag: u32,
    pub ep_count: u32,
}

impl StateRecord for EndpointGroupState {
    const PREFIX: &'static str = state_prefix!("endpointGroups");

    fn id(&self) -> &str {
        &self.id
    }
}

/// `group:tenant`, or empty for endpoints outside any group.
pub fn endpoint_group_key(group: &str, tenant: &str) -> String {
    if group.is_empty() {
        String::new()
    } else {
        format!("{group}:{tenant}")
    }
}

/// Numeric id of the group, 0 for endpoints outside any group.
pub async fn endpoint_group_id(
    driver: &Arc<dyn StateDriver>,
    group: &str,
    tenant: &str,
) -> Result<u32, StateError> {
    if group.is_empty() {
        return Ok(0);
    }
    let epg: EndpointGroupState = read_record(driver, &endpoint_group_key(group, tenant)).await?;
    Ok(epg.endpoint_group_id)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpgPolicyState {
    pub id: String,
    pub endpoint_group_id: u32,
    pub rule_ids: BTreeSet<String>,
}

impl StateRecord for EpgPolicyState {
    const PREFIX: &'static str = state_prefix!("policy");

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRuleState {
    pub id: String,
    pub priority: u32,
    pub src_endpoint_group: u32,
    pub dst_endpoint_group: u32,
    pub src_ip_addr: String,
    pub dst_ip_addr: String,
    pub ip_protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub action: String,
}

impl StateRecord for PolicyRuleState {
    const PREFIX: &'static str = state_prefix!("policyRule");

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub ip_address: String,
    pub container_id: String,
    pub labels: BTreeMap<String, String>,
    pub tenant: String,
    pub network: String,
    pub services: Vec<String>,
    pub container: String,
    pub ep_id_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceLbState {
    pub id: String,
    pub service_name: String,
    pub tenant: String,
    pub network: String,
    pub ports: Vec<String>,
    pub selectors: BTreeMap<String, String>,
    pub ip_address: String,
    pub providers: BTreeMap<String, Provider>,
}

impl StateRecord for ServiceLbState {
    const PREFIX: &'static str = state_prefix!("serviceLB");

    fn id(&self) -> &str {
        &self.id
    }
}

impl ServiceLbState {
    /// True when every selector is carried by `labels`.
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        !self.selectors.is_empty()
            && self
                .selectors
                .iter()
                .all(|(k, v)| labels.get(k).is_some_and(|l| l == v))
    }
}

/// `service:tenant`, the key of a load-balanced service.
pub fn service_key(service: &str, tenant: &str) -> String {
    format!("{service}:{tenant}")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SvcProviderState {
    pub id: String,
    pub service_name: String,
    pub providers: Vec<String>,
}

impl StateRecord for SvcProviderState {
    const PREFIX: &'static str = state_prefix!("provider");

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostState {
    pub id: String,
    pub intf: String,
    #[serde(rename = "vtepIP")]
    pub vtep_ip: String,
    #[serde(rename = "netID")]
    pub net_id: String,
}

impl StateRecord for HostState {
    const PREFIX: &'static str = state_prefix!("hosts");

    fn id(&self) -> &str {
        &self.id
    }
}
