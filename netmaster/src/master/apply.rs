//! Applying a whole intent document to the store.
//!
//! Each entry is processed on its own; a failure is logged, the walk moves
//! on, and the last error is returned.

use anyhow::Result;
use log::error;

use super::NetMaster;
use super::endpoint::get_ep_name;
use super::network::network_id;
use crate::gstate;
use crate::intent::Config;
use crate::mastercfg::{EndpointState, HostState, NetworkState, list_records};

fn tenant_present(cfg: &Config, tenant: &str) -> bool {
    cfg.tenants.iter().any(|t| t.name == tenant)
}

fn net_present(cfg: &Config, net_id: &str) -> bool {
    cfg.tenants.iter().any(|t| {
        t.networks
            .iter()
            .any(|n| network_id(&n.name, &t.name) == net_id)
    })
}

fn ep_present(cfg: &Config, ep_id: &str) -> bool {
    cfg.tenants.iter().any(|t| {
        t.networks.iter().any(|n| {
            let net_id = network_id(&n.name, &t.name);
            n.endpoints.iter().any(|ep| get_ep_name(&net_id, ep) == ep_id)
        })
    })
}

fn host_present(cfg: &Config, host: &str) -> bool {
    cfg.hosts.iter().any(|h| h.name == host)
}

fn keep_last(last: &mut Option<anyhow::Error>, res: Result<()>, what: &str) {
    if let Err(e) = res {
        error!("error {what}: {e}");
        *last = Some(e);
    }
}

fn into_result(last: Option<anyhow::Error>) -> Result<()> {
    match last {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

impl NetMaster {
    /// Creates the tenants, networks, endpoints and hosts of `cfg`.
    pub async fn process_additions(&self, cfg: &Config) -> Result<()> {
        let mut last = None;
        for tenant in &cfg.tenants {
            if let Err(e) = self.create_tenant(tenant).await {
                keep_last(&mut last, Err(e), &format!("adding tenant {}", tenant.name));
                continue;
            }
            if let Err(e) = self.create_networks(tenant).await {
                keep_last(&mut last, Err(e), "adding networks");
                continue;
            }
            keep_last(
                &mut last,
                self.create_endpoints(tenant).await,
                "adding endpoints",
            );
        }
        for host in &cfg.hosts {
            keep_last(
                &mut last,
                self.create_host(host).await,
                &format!("adding host {}", host.name),
            );
        }
        into_result(last)
    }

    /// Deletes what `cfg` names, innermost objects first.
    pub async fn process_deletions(&self, cfg: &Config) -> Result<()> {
        let mut last = None;
        for host in &cfg.hosts {
            keep_last(
                &mut last,
                self.delete_host(host).await,
                &format!("deleting host {}", host.name),
            );
        }
        for tenant in &cfg.tenants {
            if let Err(e) = self.delete_endpoints(tenant).await {
                keep_last(&mut last, Err(e), "deleting endpoints");
                continue;
            }
            if let Err(e) = self.delete_networks(tenant).await {
                keep_last(&mut last, Err(e), "deleting networks");
                continue;
            }
            keep_last(
                &mut last,
                self.delete_tenant(tenant).await,
                &format!("deleting tenant {}", tenant.name),
            );
        }
        into_result(last)
    }

    /// Removes every stored endpoint, network, tenant and host that `cfg`
    /// no longer mentions.
    pub async fn delete_delta(&self, cfg: &Config) -> Result<()> {
        let driver = self.driver();
        let mut last = None;

        for ep in list_records::<EndpointState>(driver).await? {
            // vtep and host interface endpoints belong to their host
            if ep.endpoint_id.is_empty() || !ep.vtep_ip.is_empty() || ep_present(cfg, &ep.id) {
                continue;
            }
            let res = self.delete_endpoint_id(&ep.id).await.map(|_| ());
            keep_last(&mut last, res, &format!("deleting epid {}", ep.id));
        }

        for nw in list_records::<NetworkState>(driver).await? {
            if net_present(cfg, &nw.id) {
                continue;
            }
            keep_last(
                &mut last,
                self.delete_network_id(&nw.id).await,
                &format!("deleting net {}", nw.id),
            );
        }

        for gc in gstate::Cfg::list(driver).await? {
            if tenant_present(cfg, &gc.tenant) {
                continue;
            }
            keep_last(
                &mut last,
                self.delete_tenant_id(&gc.tenant).await,
                &format!("deleting tenant {}", gc.tenant),
            );
        }

        for host in list_records::<HostState>(driver).await? {
            if host_present(cfg, &host.id) {
                continue;
            }
            keep_last(
                &mut last,
                self.delete_host_id(&host.id).await,
                &format!("deleting host {}", host.id),
            );
        }
        into_result(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{ConfigEP, ConfigNetwork, ConfigTenant};
    use crate::mastercfg::try_read_record;
    use libresource::{FakeStateDriver, StateResourceManager};
    use serial_test::serial;
    use std::sync::Arc;

    fn intent(containers: &[&str]) -> Config {
        Config {
            tenants: vec![ConfigTenant {
                name: "tenant-one".into(),
                default_net_type: "vlan".into(),
                subnet_pool: "11.1.0.0/16".into(),
                alloc_subnet_len: 24,
                vlans: "11-28".into(),
                networks: vec![ConfigNetwork {
                    name: "orange".into(),
                    endpoints: containers
                        .iter()
                        .map(|c| ConfigEP {
                            container: c.to_string(),
                            host: "host1".into(),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            hosts: Vec::new(),
        }
    }

    #[tokio::test]
    #[serial]
    async fn delta_removes_what_the_intent_dropped() {
        let rm = StateResourceManager::new(Arc::new(FakeStateDriver::new())).unwrap();
        let nm = NetMaster::new(Arc::new(rm));

        nm.process_additions(&intent(&["c1", "c2"])).await.unwrap();
        let d = nm.driver();
        assert!(
            try_read_record::<EndpointState>(d, "orange.tenant-one-c2")
                .await
                .unwrap()
                .is_some()
        );

        nm.delete_delta(&intent(&["c1"])).await.unwrap();
        assert!(
            try_read_record::<EndpointState>(d, "orange.tenant-one-c2")
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            try_read_record::<EndpointState>(d, "orange.tenant-one-c1")
                .await
                .unwrap()
                .is_some()
        );

        nm.process_deletions(&intent(&["c1"])).await.unwrap();
        assert!(
            try_read_record::<EndpointState>(d, "orange.tenant-one-c1")
                .await
                .unwrap()
                .is_none()
        );
        assert!(try_read_record::<NetworkState>(d, "orange.tenant-one").await.unwrap().is_none());

        nm.delete_delta(&Config::default()).await.unwrap();
        assert!(gstate::Cfg::list(d).await.unwrap().is_empty());
    }
}
