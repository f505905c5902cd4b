//! User-facing objects, stored under `/contiv.io/model/<type>/<key>`.

use std::sync::Arc;

use anyhow::Result;
use libresource::StateDriver;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const MODEL_PREFIX: &str = "/contiv.io/model/";

pub trait ModelObject: Serialize + DeserializeOwned + Send + Sync {
    /// Type segment of the storage path, also used in links.
    const KIND: &'static str;

    fn key(&self) -> String;
}

pub fn model_key(kind: &str, key: &str) -> String {
    format!("{MODEL_PREFIX}{kind}/{key}")
}

pub async fn find<T: ModelObject>(driver: &Arc<dyn StateDriver>, key: &str) -> Result<Option<T>> {
    Ok(driver.try_read_state(&model_key(T::KIND, key)).await?)
}

pub async fn save<T: ModelObject>(driver: &Arc<dyn StateDriver>, obj: &T) -> Result<()> {
    Ok(driver
        .write_state(&model_key(T::KIND, &obj.key()), obj)
        .await?)
}

pub async fn remove<T: ModelObject>(driver: &Arc<dyn StateDriver>, key: &str) -> Result<()> {
    Ok(driver.clear_state(&model_key(T::KIND, key)).await?)
}

pub async fn list<T: ModelObject>(driver: &Arc<dyn StateDriver>) -> Result<Vec<T>> {
    Ok(driver.list_state(&format!("{MODEL_PREFIX}{}/", T::KIND)).await?)
}

macro_rules! model_object {
    ($ty:ty, $kind:literal, |$s:ident| $key:expr) => {
        impl ModelObject for $ty {
            const KIND: &'static str = $kind;

            fn key(&self) -> String {
                let $s = self;
                $key
            }
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tenant {
    pub tenant_name: String,
    pub default_network: String,
}

model_object!(Tenant, "tenant", |t| t.tenant_name.clone());

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Network {
    pub tenant_name: String,
    pub network_name: String,
    pub nw_type: String,
    pub encap: String,
    pub pkt_tag: u32,
    pub subnet: String,
    pub gateway: String,
    pub is_public: bool,
    pub is_private: bool,
}

model_object!(Network, "network", |n| format!("{}:{}", n.tenant_name, n.network_name));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointGroup {
    pub tenant_name: String,
    pub group_name: String,
    pub network_name: String,
    pub policies: Vec<String>,
    /// Assigned from the global group id pool on create.
    pub endpoint_group_id: u32,
}

model_object!(EndpointGroup, "endpointGroup", |g| format!(
    "{}:{}",
    g.tenant_name, g.group_name
));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Policy {
    pub tenant_name: String,
    pub policy_name: String,
}

model_object!(Policy, "policy", |p| format!("{}:{}", p.tenant_name, p.policy_name));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Rule {
    pub tenant_name: String,
    pub policy_name: String,
    pub rule_id: String,
    pub priority: u32,
    pub direction: String,
    pub from_endpoint_group: String,
    pub from_network: String,
    pub from_ip_address: String,
    pub to_endpoint_group: String,
    pub to_network: String,
    pub to_ip_address: String,
    pub protocol: String,
    pub port: u16,
    pub action: String,
}

model_object!(Rule, "rule", |r| format!(
    "{}:{}:{}",
    r.tenant_name, r.policy_name, r.rule_id
));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct App {
    pub tenant_name: String,
    pub app_name: String,
}

model_object!(App, "app", |a| format!("{}:{}", a.tenant_name, a.app_name));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Service {
    pub tenant_name: String,
    pub app_name: String,
    pub service_name: String,
    pub image: String,
    pub command: String,
    pub scale: u32,
    pub networks: Vec<String>,
    pub endpoint_groups: Vec<String>,
    pub volume_profile: String,
}

model_object!(Service, "service", |s| format!(
    "{}:{}:{}",
    s.tenant_name, s.app_name, s.service_name
));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceInstance {
    pub tenant_name: String,
    pub app_name: String,
    pub service_name: String,
    pub instance_id: String,
    pub volumes: Vec<String>,
}

model_object!(ServiceInstance, "serviceInstance", |i| format!(
    "{}:{}:{}:{}",
    i.tenant_name, i.app_name, i.service_name, i.instance_id
));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Volume {
    pub tenant_name: String,
    pub volume_name: String,
    pub datastore_type: String,
    pub pool_name: String,
    pub size: String,
    pub mount_point: String,
}

model_object!(Volume, "volume", |v| format!("{}:{}", v.tenant_name, v.volume_name));

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeProfile {
    pub tenant_name: String,
    pub volume_profile_name: String,
    pub datastore_type: String,
    pub pool_name: String,
    pub size: String,
    pub mount_point: String,
}

model_object!(VolumeProfile, "volumeProfile", |p| format!(
    "{}:{}",
    p.tenant_name, p.volume_profile_name
));
