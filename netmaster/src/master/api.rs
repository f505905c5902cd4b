//! Requests the node agents send to the leader, and their handlers.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use log::{error, info};
use serde::{Deserialize, Serialize};

use super::NetMaster;
use super::endpoint::get_ep_name;
use super::network::network_id;
use crate::intent::ConfigEP;
use crate::mastercfg::{EndpointGroupState, EndpointState, NetworkState, list_records, read_record};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AddressAllocRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    pub address_pool: String,
    #[serde(rename = "PreferredIPv4Address")]
    pub preferred_ipv4_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AddressAllocResponse {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    /// `address/len`
    #[serde(rename = "IPv4Address")]
    pub ipv4_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AddressReleaseRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "IPv4Address")]
    pub ipv4_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CreateEndpointRequest {
    pub tenant_name: String,
    pub network_name: String,
    pub service_name: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(rename = "EPCommonName")]
    pub ep_common_name: String,
    #[serde(rename = "ConfigEP")]
    pub config_ep: ConfigEP,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CreateEndpointResponse {
    pub endpoint_config: EndpointState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeleteEndpointRequest {
    pub tenant_name: String,
    pub network_name: String,
    pub service_name: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(rename = "IPv4Address")]
    pub ipv4_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeleteEndpointResponse {
    pub endpoint_config: EndpointState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UpdateEndpointRequest {
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    pub labels: BTreeMap<String, String>,
    pub tenant: String,
    pub network: String,
    /// `start` or `die`
    pub event: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(rename = "EPCommonName")]
    pub ep_common_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UpdateEndpointResponse {
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
}

/// Asks the leader to republish the provider list of a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SvcProviderUpdateRequest {
    pub service_name: String,
    pub tenant: String,
}

/// Splits `net:group.tenant` into the network id and the group key. Any
/// other form is a plain network id.
fn split_alloc_id(alloc_id: &str) -> (String, Option<String>) {
    if let Some((network, rest)) = alloc_id.split_once(':') {
        if let Some((group, tenant)) = rest.split_once('.') {
            if !network.contains(':') && !tenant.contains('.') {
                return (network_id(network, tenant), Some(format!("{group}:{tenant}")));
            }
        }
    }
    (alloc_id.to_string(), None)
}

impl NetMaster {
    /// Resolves the network of an allocation request: the explicit id, or
    /// the network whose subnet is the pool `ip/len[:tenant]`.
    async fn alloc_network_id(&self, req: &AddressAllocRequest) -> Result<Option<String>> {
        if !req.network_id.is_empty() {
            let (net_id, group) = split_alloc_id(&req.network_id);
            if let Some(group) = group {
                read_record::<EndpointGroupState>(self.driver(), &group)
                    .await
                    .inspect_err(|e| error!("failed to read epg {group}, {e}"))?;
                info!("AddressAllocRequest for network: {net_id} epg: {group}");
            }
            return Ok(Some(net_id));
        }

        let Some((subnet_ip, rest)) = req.address_pool.split_once('/') else {
            return Ok(None);
        };
        let (subnet_len, tenant) = rest.split_once(':').unwrap_or((rest, ""));
        let networks = list_records::<NetworkState>(self.driver()).await?;
        Ok(networks
            .into_iter()
            .filter(|nw| nw.subnet_ip == subnet_ip && nw.subnet_len.to_string() == subnet_len)
            .filter(|nw| tenant.is_empty() || nw.tenant == tenant)
            .last()
            .map(|nw| nw.id))
    }

    pub async fn alloc_address(&self, req: &AddressAllocRequest) -> Result<AddressAllocResponse> {
        info!("Received AddressAllocRequest: {req:?}");
        let _guard = self.addr_guard().await;

        let Some(net_id) = self.alloc_network_id(req).await? else {
            error!("Could not find the network for: {}", req.network_id);
            return Err(anyhow!("network not found"));
        };
        let mut nw: NetworkState = read_record(self.driver(), &net_id)
            .await
            .inspect_err(|_| error!("network {net_id} is not operational"))?;
        let addr = self
            .network_alloc_address(&mut nw, &req.preferred_ipv4_address)
            .await
            .inspect_err(|e| error!("Failed to allocate address. Err: {e}"))?;

        Ok(AddressAllocResponse {
            network_id: req.network_id.clone(),
            ipv4_address: format!("{addr}/{}", nw.subnet_len),
        })
    }

    /// Returns `"success"` once the address is back in the network's map.
    pub async fn release_address(&self, req: &AddressReleaseRequest) -> Result<String> {
        info!("Received AddressReleaseRequest: {req:?}");
        let _guard = self.addr_guard().await;

        let (net_id, group) = split_alloc_id(&req.network_id);
        if let Some(group) = group {
            read_record::<EndpointGroupState>(self.driver(), &group)
                .await
                .inspect_err(|e| error!("failed to read epg {group}, {e}"))?;
        }
        let mut nw: NetworkState = read_record(self.driver(), &net_id)
            .await
            .inspect_err(|_| error!("network {} is not operational", req.network_id))?;
        NetMaster::network_release_address(&mut nw, &req.ipv4_address)
            .inspect_err(|e| error!("Failed to release address. Err: {e}"))?;
        crate::mastercfg::write_record(self.driver(), &nw).await?;
        Ok("success".to_string())
    }

    pub async fn create_endpoint_handler(
        &self,
        req: &CreateEndpointRequest,
    ) -> Result<CreateEndpointResponse> {
        info!("Received CreateEndpointRequest: {req:?}");
        let _guard = self.addr_guard().await;

        let net_id = network_id(&req.network_name, &req.tenant_name);
        let mut nw: NetworkState = read_record(self.driver(), &net_id)
            .await
            .inspect_err(|_| error!("network {net_id} is not operational"))?;

        let mut ep = req.config_ep.clone();
        if ep.service_name.is_empty() {
            ep.service_name = req.service_name.clone();
        }
        let endpoint_config = self
            .create_endpoint(&mut nw, &ep, &req.ep_common_name)
            .await
            .inspect_err(|e| error!("CreateEndpoint failure for ep: {ep:?}. Err: {e}"))?;
        Ok(CreateEndpointResponse { endpoint_config })
    }

    pub async fn delete_endpoint_handler(
        &self,
        req: &DeleteEndpointRequest,
    ) -> Result<DeleteEndpointResponse> {
        info!("Received DeleteEndpointRequest: {req:?}");
        let _guard = self.addr_guard().await;

        let net_id = network_id(&req.network_name, &req.tenant_name);
        let ep_id = get_ep_name(
            &net_id,
            &ConfigEP {
                container: req.endpoint_id.clone(),
                ..Default::default()
            },
        );
        let endpoint_config = self
            .delete_endpoint_id(&ep_id)
            .await
            .inspect_err(|_| error!("Error deleting endpoint: {ep_id}"))?;
        Ok(DeleteEndpointResponse { endpoint_config })
    }
}
