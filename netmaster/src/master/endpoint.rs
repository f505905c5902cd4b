use std::net::Ipv4Addr;

use anyhow::{Context, Result, bail};
use log::{error, info, warn};

use super::NetMaster;
use super::network::network_id;
use crate::intent::{ConfigEP, ConfigTenant};
use crate::mastercfg::{
    EndpointGroupState, EndpointState, NetworkState, clear_record, endpoint_group_id,
    endpoint_group_key, list_records, read_record, try_read_record, write_record,
};

/// Endpoint record id: `<net>-<container>`, or `<host>-native-intf` for a
/// host interface without a container.
pub fn get_ep_name(net_id: &str, ep: &ConfigEP) -> String {
    if ep.container.is_empty() {
        format!("{}-native-intf", ep.host)
    } else {
        format!("{net_id}-{}", ep.container)
    }
}

fn mac_from_ip(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("02:02:{a:02x}:{b:02x}:{c:02x}:{d:02x}")
}

fn validate_endpoint_config(tenant: &ConfigTenant) -> Result<()> {
    if tenant.name.is_empty() {
        bail!("null tenant name");
    }
    for network in &tenant.networks {
        for ep in &network.endpoints {
            if ep.container.is_empty() {
                bail!("invalid container name for the endpoint");
            }
            if ep.ip_address.is_empty() {
                continue;
            }
            if !network.subnet_cidr.is_empty() {
                error!("found ep with ip for auto-allocated net");
                bail!("found ep with ip for auto-allocated net");
            }
            if ep.ip_address.parse::<Ipv4Addr>().is_err() {
                bail!("invalid ep IP");
            }
        }
    }
    Ok(())
}

fn validate_ep_bindings(bindings: &[ConfigEP]) -> Result<()> {
    for ep in bindings {
        if ep.host.is_empty() {
            bail!("invalid host name for the endpoint");
        }
        if ep.container.is_empty() {
            bail!("invalid container name for the endpoint");
        }
    }
    Ok(())
}

/// Which endpoints a cleanup request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMatch {
    /// Every endpoint on the network id.
    Network,
    /// Every endpoint in the service group.
    Group,
    /// Endpoints whose container id contains the given text.
    Endpoint,
}

impl std::str::FromStr for EndpointMatch {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "net" => Ok(Self::Network),
            "group" => Ok(Self::Group),
            "ep" => Ok(Self::Endpoint),
            other => bail!("unknown cleanup category {other:?}"),
        }
    }
}

impl NetMaster {
    async fn adjust_epg_count(&self, epg_key: &str, up: bool) -> Result<()> {
        let driver = self.driver();
        let mut epg: EndpointGroupState = read_record(driver, epg_key).await?;
        if up {
            epg.ep_count += 1;
        } else {
            epg.ep_count = epg.ep_count.saturating_sub(1);
        }
        write_record(driver, &epg).await?;
        Ok(())
    }

    async fn free_addr_on_err(&self, nw: &mut NetworkState, ip_address: &str) {
        info!("Freeing {ip_address} on error");
        if let Err(e) = NetMaster::network_release_address(nw, ip_address) {
            error!("error releasing {ip_address}. Error: {e}");
            return;
        }
        if let Err(e) = write_record(self.driver(), nw).await {
            error!("error writing nw config. Error: {e}");
        }
    }

    /// Creates the endpoint of `ep` on `nw`, allocating its address. An
    /// endpoint that already exists is returned unchanged.
    pub async fn create_endpoint(
        &self,
        nw: &mut NetworkState,
        ep: &ConfigEP,
        ep_common_name: &str,
    ) -> Result<EndpointState> {
        let driver = self.driver();
        let id = get_ep_name(&nw.id, ep);
        if let Some(existing) = try_read_record::<EndpointState>(driver, &id).await? {
            return Ok(existing);
        }

        let mut state = EndpointState {
            id,
            net_id: nw.id.clone(),
            endpoint_id: ep.container.clone(),
            homing_host: ep.host.clone(),
            service_name: ep.service_name.clone(),
            ep_common_name: ep_common_name.to_string(),
            ..Default::default()
        };

        if !state.service_name.is_empty() {
            let epg_key = endpoint_group_key(&state.service_name, &nw.tenant);
            read_record::<EndpointGroupState>(driver, &epg_key)
                .await
                .inspect_err(|e| error!("failed to read endpoint group {epg_key}, {e}"))?;
        }

        let ip_address = self
            .network_alloc_address(nw, &ep.ip_address)
            .await
            .inspect_err(|e| error!("error allocating and/or reserving IP. Error: {e}"))?;
        let ip: Ipv4Addr = ip_address.parse()?;
        state.mac_address = mac_from_ip(ip);
        state.ip_address = ip_address;

        match self.finish_endpoint(nw, &mut state).await {
            Ok(()) => Ok(state),
            Err(e) => {
                self.free_addr_on_err(nw, &state.ip_address).await;
                Err(e)
            }
        }
    }

    async fn finish_endpoint(
        &self,
        nw: &mut NetworkState,
        state: &mut EndpointState,
    ) -> Result<()> {
        let driver = self.driver();
        if nw.nw_type != "infra" {
            state.endpoint_group_key = endpoint_group_key(&state.service_name, &nw.tenant);
            state.endpoint_group_id = endpoint_group_id(driver, &state.service_name, &nw.tenant)
                .await
                .with_context(|| {
                    format!(
                        "Error getting endpoint group ID for {}.{}",
                        state.service_name, nw.id
                    )
                })?;
            if !state.endpoint_group_key.is_empty() {
                self.adjust_epg_count(&state.endpoint_group_key, true)
                    .await
                    .inspect_err(|e| error!("Error saving epg state. Error: {e}"))?;
            }
        }

        nw.ep_count += 1;
        write_record(driver, nw)
            .await
            .inspect_err(|e| error!("Error incrementing ep count. Err: {e}"))?;
        write_record(driver, &*state)
            .await
            .inspect_err(|e| error!("error writing ep config. Error: {e}"))?;
        Ok(())
    }

    /// Creates the endpoints listed in the tenant's networks.
    pub async fn create_endpoints(&self, tenant: &ConfigTenant) -> Result<()> {
        validate_endpoint_config(tenant)
            .inspect_err(|e| error!("error validating endpoint config. Error: {e}"))?;

        for network in &tenant.networks {
            let net_id = network_id(&network.name, &tenant.name);
            let mut nw: NetworkState = read_record(self.driver(), &net_id)
                .await
                .inspect_err(|e| {
                    error!("error reading oper network {}. Error: {e}", network.name)
                })?;
            for ep in &network.endpoints {
                self.create_endpoint(&mut nw, ep, "")
                    .await
                    .inspect_err(|e| error!("Error creating endpoint {ep:?}. Err: {e}"))?;
            }
        }
        Ok(())
    }

    /// Deletes the endpoints listed in the tenant's networks.
    pub async fn delete_endpoints(&self, tenant: &ConfigTenant) -> Result<()> {
        validate_endpoint_config(tenant)
            .inspect_err(|e| error!("error validating endpoint config. Error: {e}"))?;

        for network in &tenant.networks {
            let net_id = network_id(&network.name, &tenant.name);
            for ep in &network.endpoints {
                let ep_id = get_ep_name(&net_id, ep);
                self.delete_endpoint_id(&ep_id)
                    .await
                    .inspect_err(|e| error!("error deleting endpoint {ep_id}. Error: {e}"))?;
            }
        }
        Ok(())
    }

    /// Removes an endpoint. When its network still exists the address is
    /// returned and the counters are decremented; the endpoint record is
    /// cleared either way.
    pub async fn delete_endpoint_id(&self, ep_id: &str) -> Result<EndpointState> {
        let driver = self.driver();
        let state: EndpointState = read_record(driver, ep_id).await?;

        let nw = try_read_record::<NetworkState>(driver, &state.net_id).await?;
        // the network may already be gone, e.g. infra
        if let Some(mut nw) = nw.filter(|_| !state.ip_address.is_empty()) {
            if let Err(e) = NetMaster::network_release_address(&mut nw, &state.ip_address) {
                error!(
                    "Error releasing endpoint state for: {}. Err: {e}",
                    state.ip_address
                );
            }
            if !state.endpoint_group_key.is_empty() {
                if let Err(e) = self.adjust_epg_count(&state.endpoint_group_key, false).await {
                    error!("Error reading EPG for endpoint: {state:?}. Error: {e}");
                }
            }
            nw.ep_count = nw.ep_count.saturating_sub(1);
            if let Err(e) = write_record(driver, &nw).await {
                error!("error writing nw config. Error: {e}");
            }
        }

        clear_record::<EndpointState>(driver, ep_id)
            .await
            .inspect_err(|e| error!("error writing ep config. Error: {e}"))?;
        Ok(state)
    }

    /// Deletes every endpoint homed on `host`. Failures are logged and the
    /// walk continues.
    pub async fn delete_endpoints_on_host(&self, host: &str) -> Result<()> {
        for ep in list_records::<EndpointState>(self.driver()).await? {
            if ep.homing_host != host {
                continue;
            }
            info!("Sending DeleteEndpoint for {}", ep.id);
            if let Err(e) = self.delete_endpoint_id(&ep.id).await {
                error!("Error delete endpoint: {}. Err: {e}", ep.id);
            }
        }
        Ok(())
    }

    /// Binds containers to hosts by updating the homing host of every
    /// endpoint the container owns.
    pub async fn create_ep_bindings(&self, bindings: &[ConfigEP]) -> Result<()> {
        validate_ep_bindings(bindings)
            .inspect_err(|e| error!("error validating the ep bindings. Error: {e}"))?;

        let driver = self.driver();
        let eps = list_records::<EndpointState>(driver).await?;
        for binding in bindings {
            info!(
                "creating binding between container '{}' and host '{}'",
                binding.container, binding.host
            );
            for ep in eps.iter().filter(|ep| ep.endpoint_id == binding.container) {
                let mut ep = ep.clone();
                ep.homing_host = binding.host.clone();
                write_record(driver, &ep).await?;
            }
        }
        Ok(())
    }

    /// Deletes the endpoints of a network, a group or a container within
    /// `tenant`. Returns the ids removed.
    pub async fn clear_endpoints(
        &self,
        tenant: &str,
        category: EndpointMatch,
        id: &str,
    ) -> Result<Vec<String>> {
        let driver = self.driver();
        let net_id = network_id(id, tenant);
        match category {
            EndpointMatch::Network => {
                let nw: NetworkState = read_record(driver, &net_id).await?;
                if nw.ep_count == 0 {
                    return Ok(Vec::new());
                }
            }
            EndpointMatch::Group => {
                let epg: EndpointGroupState =
                    read_record(driver, &endpoint_group_key(id, tenant)).await?;
                if epg.ep_count == 0 {
                    return Ok(Vec::new());
                }
            }
            EndpointMatch::Endpoint => {}
        }

        let mut cleared = Vec::new();
        for ep in list_records::<EndpointState>(driver).await? {
            let hit = match category {
                EndpointMatch::Network => ep.net_id == net_id,
                EndpointMatch::Group => ep.service_name == id,
                EndpointMatch::Endpoint => ep.endpoint_id.contains(id),
            };
            if !hit {
                continue;
            }
            self.delete_endpoint_id(&ep.id)
                .await
                .with_context(|| format!("Cannot cleanup EP: {}", ep.endpoint_id))?;
            cleared.push(ep.id);
        }
        if cleared.is_empty() {
            warn!("no endpoints matched {category:?} {id} in tenant {tenant}");
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::ConfigNetwork;
    use libresource::{FakeStateDriver, StateResourceManager};
    use serial_test::serial;
    use std::sync::Arc;

    fn master() -> NetMaster {
        let rm = StateResourceManager::new(Arc::new(FakeStateDriver::new())).unwrap();
        NetMaster::new(Arc::new(rm))
    }

    fn ep(container: &str) -> ConfigEP {
        ConfigEP {
            container: container.into(),
            host: "host1".into(),
            ..Default::default()
        }
    }

    fn tenant(endpoints: Vec<ConfigEP>) -> ConfigTenant {
        ConfigTenant {
            name: "tenant-one".into(),
            default_net_type: "vlan".into(),
            subnet_pool: "11.1.0.0/16".into(),
            alloc_subnet_len: 24,
            vlans: "11-28".into(),
            networks: vec![ConfigNetwork {
                name: "orange".into(),
                endpoints,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn endpoint_names() {
        assert_eq!(get_ep_name("orange.t1", &ep("c1")), "orange.t1-c1");
        let intf = ConfigEP {
            host: "host1".into(),
            ..Default::default()
        };
        assert_eq!(get_ep_name("orange.t1", &intf), "host1-native-intf");
        assert_eq!(mac_from_ip(Ipv4Addr::new(11, 1, 0, 10)), "02:02:0b:01:00:0a");
    }

    #[test]
    fn endpoint_validation() {
        assert_eq!(
            validate_endpoint_config(&tenant(vec![ep("")]))
                .unwrap_err()
                .to_string(),
            "invalid container name for the endpoint"
        );
        let mut bad_ip = ep("c1");
        bad_ip.ip_address = "11.1.0.300".into();
        assert_eq!(
            validate_endpoint_config(&tenant(vec![bad_ip.clone()]))
                .unwrap_err()
                .to_string(),
            "invalid ep IP"
        );
        let mut t = tenant(vec![ep("c1")]);
        t.networks[0].endpoints[0].ip_address = "20.1.1.5".into();
        t.networks[0].subnet_cidr = "20.1.1.0/24".into();
        assert!(validate_endpoint_config(&t).is_err());
    }

    #[tokio::test]
    #[serial]
    async fn create_and_delete_keep_counts() {
        let nm = master();
        let mut fixed = ep("c2");
        fixed.ip_address = "11.1.0.9".into();
        let t = tenant(vec![ep("c1"), fixed]);
        nm.create_tenant(&t).await.unwrap();
        nm.create_networks(&t).await.unwrap();
        nm.create_endpoints(&t).await.unwrap();
        nm.create_endpoints(&t).await.unwrap();

        let c1: EndpointState = read_record(nm.driver(), "orange.tenant-one-c1").await.unwrap();
        assert_eq!(c1.ip_address, "11.1.0.1");
        assert_eq!(c1.mac_address, "02:02:0b:01:00:01");
        let c2: EndpointState = read_record(nm.driver(), "orange.tenant-one-c2").await.unwrap();
        assert_eq!(c2.ip_address, "11.1.0.9");

        let nw: NetworkState = read_record(nm.driver(), "orange.tenant-one").await.unwrap();
        assert_eq!(nw.ep_count, 2);
        assert!(nw.ip_alloc_map.contains(9));

        nm.delete_endpoint_id("orange.tenant-one-c2").await.unwrap();
        let nw: NetworkState = read_record(nm.driver(), "orange.tenant-one").await.unwrap();
        assert_eq!(nw.ep_count, 1);
        assert!(!nw.ip_alloc_map.contains(9));
        assert!(nm.delete_endpoint_id("orange.tenant-one-c2").await.is_err());
    }

    #[tokio::test]
    #[serial]
    async fn group_endpoint_counts_and_missing_group_frees_address() {
        let nm = master();
        let t = tenant(vec![]);
        nm.create_tenant(&t).await.unwrap();
        nm.create_networks(&t).await.unwrap();
        let mut nw: NetworkState = read_record(nm.driver(), "orange.tenant-one").await.unwrap();

        let mut grouped = ep("web1");
        grouped.service_name = "web".into();
        assert!(nm.create_endpoint(&mut nw, &grouped, "").await.is_err());

        nm.create_endpoint_group("tenant-one", "orange", "web", 5)
            .await
            .unwrap();
        let state = nm.create_endpoint(&mut nw, &grouped, "pod-web1").await.unwrap();
        assert_eq!(state.endpoint_group_id, 5);
        assert_eq!(state.endpoint_group_key, "web:tenant-one");
        assert_eq!(state.ip_address, "11.1.0.1");

        let epg: EndpointGroupState = read_record(nm.driver(), "web:tenant-one").await.unwrap();
        assert_eq!(epg.ep_count, 1);

        let cleared = nm
            .clear_endpoints("tenant-one", EndpointMatch::Group, "web")
            .await
            .unwrap();
        assert_eq!(cleared, vec!["orange.tenant-one-web1".to_string()]);
        let epg: EndpointGroupState = read_record(nm.driver(), "web:tenant-one").await.unwrap();
        assert_eq!(epg.ep_count, 0);
    }

    #[tokio::test]
    #[serial]
    async fn bindings_and_host_cleanup() {
        let nm = master();
        let t = tenant(vec![ep("c1"), ep("c2")]);
        nm.create_tenant(&t).await.unwrap();
        nm.create_networks(&t).await.unwrap();
        nm.create_endpoints(&t).await.unwrap();

        assert!(nm.create_ep_bindings(&[ConfigEP::default()]).await.is_err());
        let binding = ConfigEP {
            container: "c2".into(),
            host: "host2".into(),
            ..Default::default()
        };
        nm.create_ep_bindings(&[binding]).await.unwrap();

        nm.delete_endpoints_on_host("host1").await.unwrap();
        let eps = list_records::<EndpointState>(nm.driver()).await.unwrap();
        assert_eq!(eps.len(), 1);
        assert_eq!(eps[0].homing_host, "host2");
    }
}
