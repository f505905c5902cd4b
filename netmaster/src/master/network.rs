use std::net::Ipv4Addr;

use anyhow::{Context, Result, bail};
use libresource::bitset::{clear_bit, init_subnet_bitset, next_clear, set_grow};
use libresource::netutils::{get_ip_number, get_subnet_ip, parse_cidr, parse_tag_ranges};
use log::{error, info};

use super::NetMaster;
use super::tenant::check_pkt_tag_type;
use crate::gstate;
use crate::intent::{ConfigNetwork, ConfigTenant};
use crate::mastercfg::{
    HostState, NetworkState, clear_record, list_records, read_record, try_read_record,
    write_record,
};

/// `name.tenant`, the id of a network's state record.
pub fn network_id(network: &str, tenant: &str) -> String {
    format!("{network}.{tenant}")
}

fn validate_network_config(tenant: &ConfigTenant) -> Result<()> {
    if tenant.name.is_empty() {
        bail!("null tenant name");
    }
    for network in &tenant.networks {
        if network.name.is_empty() {
            bail!("null network name");
        }
        check_pkt_tag_type(&network.pkt_tag_type)?;
        if !network.subnet_cidr.is_empty() {
            parse_cidr(&network.subnet_cidr)?;
        }
        if !network.gateway.is_empty() && network.gateway.parse::<Ipv4Addr>().is_err() {
            bail!("invalid IP");
        }
    }
    Ok(())
}

/// Rejects a caller-chosen VXLAN outside the tenant's range.
fn check_explicit_vxlan(gc: &gstate::Cfg, vxlan: u32) -> Result<()> {
    if gc.auto.vxlans.is_empty() {
        return Ok(());
    }
    let ranges = parse_tag_ranges(&gc.auto.vxlans, "vxlan")?;
    if !ranges.iter().any(|r| r.min <= vxlan && vxlan <= r.max) {
        bail!("requested vxlan is out of range");
    }
    Ok(())
}

fn subnet_ip(nw: &NetworkState) -> Result<Ipv4Addr> {
    nw.subnet_ip
        .parse()
        .with_context(|| format!("invalid subnet address {:?} on {}", nw.subnet_ip, nw.id))
}

impl NetMaster {
    /// Creates one network of `tenant`. Tags and subnets are reused when
    /// given and allocated from the tenant pools otherwise. A network that
    /// already exists is left as is.
    pub async fn create_network(&self, network: &ConfigNetwork, tenant: &str) -> Result<()> {
        let driver = self.driver();
        let gc = self.tenant_cfg(tenant).await?;
        let rm = self.resource_manager();

        let id = network_id(&network.name, tenant);
        if try_read_record::<NetworkState>(driver, &id).await?.is_some() {
            return Ok(());
        }

        let mut nw = NetworkState {
            id: id.clone(),
            tenant: tenant.to_string(),
            network_name: network.name.clone(),
            nw_type: network.nw_type.clone(),
            pkt_tag_type: network.pkt_tag_type.clone(),
            gateway: network.gateway.clone(),
            ..Default::default()
        };
        if !network.subnet_cidr.is_empty() {
            let (ip, len) = parse_cidr(&network.subnet_cidr)?;
            nw.subnet_ip = ip.to_string();
            nw.subnet_len = len;
        }
        if nw.pkt_tag_type.is_empty() {
            nw.pkt_tag_type = gc.deploy.default_net_type.clone();
        }

        if network.pkt_tag == 0 {
            match nw.pkt_tag_type.as_str() {
                "vlan" => {
                    nw.pkt_tag = gc.alloc_vlan(rm, 0).await?;
                    nw.pkt_tag_is_allocated = true;
                }
                "vxlan" => {
                    let (vxlan, local_vlan) = gc.alloc_vxlan(rm, 0).await?;
                    nw.ext_pkt_tag = vxlan;
                    nw.pkt_tag = local_vlan;
                    nw.pkt_tag_is_allocated = true;
                }
                _ => {}
            }
        } else if nw.pkt_tag_type == "vxlan" {
            check_explicit_vxlan(&gc, network.pkt_tag)?;
            nw.ext_pkt_tag = network.pkt_tag;
            nw.pkt_tag = network.pkt_tag;
        } else {
            nw.pkt_tag = network.pkt_tag;
        }

        if nw.subnet_ip.is_empty() {
            nw.subnet_len = gc.auto.alloc_subnet_len;
            nw.subnet_ip = gc.alloc_subnet(rm).await?;
            nw.subnet_is_allocated = true;
        }

        let default_name = gc
            .assign_default_network(driver, &network.name)
            .await
            .inspect_err(|e| error!("error assigning the default network. Error: {e}"))?;

        if network.name == default_name && nw.gateway.is_empty() && nw.subnet_is_allocated {
            // last usable unicast address of an auto-derived subnet
            let host_id = (1u32 << (32 - nw.subnet_len)) - 2;
            nw.gateway = get_subnet_ip(subnet_ip(&nw)?, nw.subnet_len, 32, host_id)?.to_string();
            set_grow(&mut nw.ip_alloc_map, host_id as usize);
        } else if !nw.gateway.is_empty() {
            let gw: Ipv4Addr = nw
                .gateway
                .parse()
                .with_context(|| format!("invalid gateway {}", nw.gateway))?;
            let host_id = get_ip_number(subnet_ip(&nw)?, nw.subnet_len, 32, gw)?;
            set_grow(&mut nw.ip_alloc_map, host_id as usize);
        }

        init_subnet_bitset(&mut nw.ip_alloc_map, nw.subnet_len);
        write_record(driver, &nw).await?;
        info!(
            "created network {id} ({} {} subnet {})",
            nw.pkt_tag_type,
            nw.pkt_tag,
            nw.subnet_cidr()
        );

        if nw.pkt_tag_type == "vxlan" {
            for host in list_records::<HostState>(driver).await? {
                if host.vtep_ip.is_empty() {
                    continue;
                }
                if let Err(e) = self.create_vtep(&host, &id).await {
                    error!("error creating vtep on host {}. Error: {e}", host.id);
                }
            }
        }
        Ok(())
    }

    pub async fn create_networks(&self, tenant: &ConfigTenant) -> Result<()> {
        validate_network_config(tenant)
            .inspect_err(|e| error!("error validating network config. Error: {e}"))?;
        for network in &tenant.networks {
            self.create_network(network, &tenant.name)
                .await
                .inspect_err(|e| error!("Error creating network {network:?}. Err: {e}"))?;
        }
        Ok(())
    }

    async fn free_network_resources(&self, nw: &NetworkState, gc: &gstate::Cfg) -> Result<()> {
        let rm = self.resource_manager();
        if nw.pkt_tag_is_allocated {
            match nw.pkt_tag_type.as_str() {
                "vlan" => gc.free_vlan(rm, nw.pkt_tag).await?,
                "vxlan" => {
                    info!("freeing vlan {} vxlan {}", nw.pkt_tag, nw.ext_pkt_tag);
                    gc.free_vxlan(rm, nw.ext_pkt_tag, nw.pkt_tag).await?;
                }
                _ => {}
            }
        }
        if nw.subnet_is_allocated {
            info!("freeing subnet {}", nw.subnet_cidr());
            gc.free_subnet(rm, &nw.subnet_ip).await?;
        }
        gc.unassign_network(self.driver(), &nw.network_name).await?;
        Ok(())
    }

    /// Frees the network's allocated tag and subnet, then removes it.
    pub async fn delete_network_id(&self, net_id: &str) -> Result<()> {
        let driver = self.driver();
        let nw: NetworkState = read_record(driver, net_id)
            .await
            .inspect_err(|_| error!("network {net_id} is not operational"))?;
        let gc = self.tenant_cfg(&nw.tenant).await?;

        self.free_network_resources(&nw, &gc).await?;
        clear_record::<NetworkState>(driver, net_id)
            .await
            .inspect_err(|e| error!("error writing nw config. Error: {e}"))?;
        info!("deleted network {net_id}");
        Ok(())
    }

    /// Deletes the tenant's networks that no longer list endpoints.
    pub async fn delete_networks(&self, tenant: &ConfigTenant) -> Result<()> {
        let gc = self.tenant_cfg(&tenant.name).await?;
        validate_network_config(tenant)?;

        let driver = self.driver();
        for network in &tenant.networks {
            if !network.endpoints.is_empty() {
                continue;
            }
            let id = network_id(&network.name, &tenant.name);
            let Some(nw) = try_read_record::<NetworkState>(driver, &id).await? else {
                info!("network {:?} is not operational", network.name);
                continue;
            };
            self.free_network_resources(&nw, &gc).await?;
            clear_record::<NetworkState>(driver, &id).await?;
        }
        Ok(())
    }

    /// Takes `req_addr`, or the lowest free address when empty, from the
    /// network's address map and persists the network.
    pub async fn network_alloc_address(
        &self,
        nw: &mut NetworkState,
        req_addr: &str,
    ) -> Result<String> {
        let subnet = subnet_ip(nw)?;
        let (host_id, address) = if req_addr.is_empty() {
            let Some(host_id) = next_clear(&nw.ip_alloc_map, 0) else {
                error!(
                    "auto allocation failed - address exhaustion in subnet {}",
                    nw.subnet_cidr()
                );
                bail!(
                    "auto allocation failed - address exhaustion in subnet {}",
                    nw.subnet_cidr()
                );
            };
            let ip = get_subnet_ip(subnet, nw.subnet_len, 32, host_id as u32)?;
            (host_id, ip.to_string())
        } else {
            let req: Ipv4Addr = req_addr
                .parse()
                .with_context(|| format!("invalid address {req_addr}"))?;
            let host_id = get_ip_number(subnet, nw.subnet_len, 32, req)? as usize;
            if nw.ip_alloc_map.contains(host_id) {
                bail!("address {req_addr} is already allocated");
            }
            (host_id, req_addr.to_string())
        };

        set_grow(&mut nw.ip_alloc_map, host_id);
        write_record(self.driver(), nw)
            .await
            .inspect_err(|e| error!("error writing nw config. Error: {e}"))?;
        Ok(address)
    }

    /// Returns an address to the network's map. The caller persists `nw`.
    pub fn network_release_address(nw: &mut NetworkState, ip_address: &str) -> Result<()> {
        let ip: Ipv4Addr = ip_address
            .parse()
            .with_context(|| format!("invalid address {ip_address}"))?;
        let host_id = get_ip_number(subnet_ip(nw)?, nw.subnet_len, 32, ip).inspect_err(|e| {
            error!(
                "error getting host id from hostIP {ip_address} Subnet {}. Error: {e}",
                nw.subnet_cidr()
            )
        })?;
        clear_bit(&mut nw.ip_alloc_map, host_id as usize);
        Ok(())
    }

    /// Reads a network, treating a missing record as `None`.
    pub async fn find_network(&self, net_id: &str) -> Result<Option<NetworkState>> {
        Ok(try_read_record(self.driver(), net_id).await?)
    }
}
