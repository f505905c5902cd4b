use anyhow::{Result, bail};
use log::{error, info};

use super::NetMaster;
use super::endpoint::get_ep_name;
use crate::intent::{ConfigEP, ConfigHost};
use crate::mastercfg::{
    EndpointState, HostState, NetworkState, clear_record, list_records, read_record,
    try_read_record, write_record,
};

/// Network that carries host interfaces not attached to a tenant network.
pub const INFRA_NETWORK: &str = "infra";

fn validate_host_config(host: &ConfigHost) -> Result<()> {
    if host.name.is_empty() {
        bail!("null host name");
    }
    if host.vtep_ip.is_empty() && host.intf.is_empty() {
        bail!("either vtep or intf needed for the host");
    }
    Ok(())
}

fn host_ep(host_name: &str) -> ConfigEP {
    ConfigEP {
        host: host_name.to_string(),
        ..Default::default()
    }
}

fn vtep_ep(host_name: &str) -> ConfigEP {
    ConfigEP {
        container: host_name.to_string(),
        ..Default::default()
    }
}

impl NetMaster {
    /// Writes the VTEP endpoint of `host` on network `net_id`.
    pub(crate) async fn create_vtep(&self, host: &HostState, net_id: &str) -> Result<()> {
        let ep = EndpointState {
            id: get_ep_name(net_id, &vtep_ep(&host.id)),
            net_id: net_id.to_string(),
            vtep_ip: host.vtep_ip.clone(),
            homing_host: host.id.clone(),
            ..Default::default()
        };
        write_record(self.driver(), &ep).await?;
        Ok(())
    }

    /// Registers a host. A host with a VTEP address gets a tunnel endpoint on
    /// every network; a host interface lands on the host's network, or on
    /// the infra network when none is named.
    pub async fn create_host(&self, host: &ConfigHost) -> Result<()> {
        validate_host_config(host)?;
        let driver = self.driver();

        let state = HostState {
            id: host.name.clone(),
            intf: host.intf.clone(),
            vtep_ip: host.vtep_ip.clone(),
            net_id: host.net_id.clone(),
        };

        if !host.vtep_ip.is_empty() {
            for nw in list_records::<NetworkState>(driver).await? {
                if nw.nw_type == INFRA_NETWORK {
                    continue;
                }
                self.create_vtep(&state, &nw.id)
                    .await
                    .inspect_err(|e| error!("Error creating vtep on {}. Error: {e}", nw.id))?;
            }
        }

        if !host.intf.is_empty() {
            let net_id = if host.net_id.is_empty() {
                INFRA_NETWORK.to_string()
            } else {
                host.net_id.clone()
            };
            if net_id == INFRA_NETWORK
                && try_read_record::<NetworkState>(driver, INFRA_NETWORK)
                    .await?
                    .is_none()
            {
                let infra = NetworkState {
                    id: INFRA_NETWORK.to_string(),
                    nw_type: INFRA_NETWORK.to_string(),
                    ..Default::default()
                };
                write_record(driver, &infra).await?;
            }

            let ep = EndpointState {
                id: get_ep_name(&net_id, &host_ep(&host.name)),
                net_id,
                intf_name: host.intf.clone(),
                homing_host: host.name.clone(),
                ..Default::default()
            };
            write_record(driver, &ep).await?;
        }

        write_record(driver, &state).await?;
        info!("created host {}", host.name);
        Ok(())
    }

    /// Removes a host together with its VTEP and interface endpoints.
    pub async fn delete_host_id(&self, host_name: &str) -> Result<()> {
        let driver = self.driver();
        let state: HostState = read_record(driver, host_name)
            .await
            .inspect_err(|e| error!("error reading host {host_name}. Error: {e}"))?;

        if !state.vtep_ip.is_empty() {
            for nw in list_records::<NetworkState>(driver).await? {
                let id = get_ep_name(&nw.id, &vtep_ep(host_name));
                clear_record::<EndpointState>(driver, &id).await?;
            }
        }
        if !state.intf.is_empty() {
            let net_id = if state.net_id.is_empty() {
                INFRA_NETWORK
            } else {
                &state.net_id
            };
            clear_record::<EndpointState>(driver, &get_ep_name(net_id, &host_ep(host_name)))
                .await?;
        }

        clear_record::<HostState>(driver, host_name).await?;
        info!("deleted host {host_name}");
        Ok(())
    }

    pub async fn delete_host(&self, host: &ConfigHost) -> Result<()> {
        validate_host_config(host)?;
        self.delete_host_id(&host.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{ConfigNetwork, ConfigTenant};
    use libresource::{FakeStateDriver, StateResourceManager};
    use serial_test::serial;
    use std::sync::Arc;

    fn master() -> NetMaster {
        let rm = StateResourceManager::new(Arc::new(FakeStateDriver::new())).unwrap();
        NetMaster::new(Arc::new(rm))
    }

    fn vxlan_tenant() -> ConfigTenant {
        ConfigTenant {
            name: "tenant-one".into(),
            default_net_type: "vxlan".into(),
            subnet_pool: "11.1.0.0/16".into(),
            alloc_subnet_len: 24,
            vxlans: "10001-14000".into(),
            networks: vec![ConfigNetwork {
                name: "orange".into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn host_needs_name_and_vtep_or_intf() {
        let mut host = ConfigHost::default();
        assert_eq!(
            validate_host_config(&host).unwrap_err().to_string(),
            "null host name"
        );
        host.name = "host1".into();
        assert_eq!(
            validate_host_config(&host).unwrap_err().to_string(),
            "either vtep or intf needed for the host"
        );
        host.intf = "eth2".into();
        assert!(validate_host_config(&host).is_ok());
    }

    #[tokio::test]
    #[serial]
    async fn vteps_follow_hosts_and_networks() {
        let nm = master();
        let t = vxlan_tenant();
        nm.create_tenant(&t).await.unwrap();
        nm.create_networks(&t).await.unwrap();

        let host = ConfigHost {
            name: "host1".into(),
            vtep_ip: "10.0.0.1".into(),
            ..Default::default()
        };
        nm.create_host(&host).await.unwrap();
        let ep: EndpointState = read_record(nm.driver(), "orange.tenant-one-host1")
            .await
            .unwrap();
        assert_eq!(ep.vtep_ip, "10.0.0.1");

        let mut t2 = vxlan_tenant();
        t2.networks[0].name = "purple".into();
        nm.create_networks(&t2).await.unwrap();
        assert!(
            try_read_record::<EndpointState>(nm.driver(), "purple.tenant-one-host1")
                .await
                .unwrap()
                .is_some()
        );

        nm.delete_host(&host).await.unwrap();
        assert!(list_records::<EndpointState>(nm.driver()).await.unwrap().is_empty());
        assert!(list_records::<HostState>(nm.driver()).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn interface_lands_on_infra_network() {
        let nm = master();
        let host = ConfigHost {
            name: "host2".into(),
            intf: "eth2".into(),
            ..Default::default()
        };
        nm.create_host(&host).await.unwrap();

        let infra: NetworkState = read_record(nm.driver(), INFRA_NETWORK).await.unwrap();
        assert_eq!(infra.nw_type, INFRA_NETWORK);
        let ep: EndpointState = read_record(nm.driver(), "host2-native-intf").await.unwrap();
        assert_eq!(ep.net_id, INFRA_NETWORK);
        assert_eq!(ep.intf_name, "eth2");

        nm.delete_host_id("host2").await.unwrap();
        assert!(
            try_read_record::<EndpointState>(nm.driver(), "host2-native-intf")
                .await
                .unwrap()
                .is_none()
        );
    }
}
