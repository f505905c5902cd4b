use anyhow::{Result, bail};
use libresource::is_key_not_found;
use libresource::netutils::{parse_cidr, parse_tag_ranges};
use log::{error, info};

use super::NetMaster;
use crate::gstate::{self, AutoParams, DeployParams, ResKind};
use crate::intent::ConfigTenant;

pub const VERSION_BETA1: &str = "0.01";

pub(crate) fn check_pkt_tag_type(pkt_tag_type: &str) -> Result<()> {
    if !pkt_tag_type.is_empty() && pkt_tag_type != "vlan" && pkt_tag_type != "vxlan" {
        bail!("invalid pktTagType");
    }
    Ok(())
}

fn validate_tenant_config(tenant: &ConfigTenant) -> Result<()> {
    if tenant.name.is_empty() {
        bail!("invalid tenant name");
    }
    check_pkt_tag_type(&tenant.default_net_type)?;

    if !tenant.subnet_pool.is_empty() {
        parse_cidr(&tenant.subnet_pool)?;
    }
    if !tenant.vlans.is_empty() {
        parse_tag_ranges(&tenant.vlans, "vlan").inspect_err(|e| {
            error!("error parsing vlan range '{}'. Error: {e}", tenant.vlans)
        })?;
    }
    if !tenant.vxlans.is_empty() {
        parse_tag_ranges(&tenant.vxlans, "vxlan").inspect_err(|e| {
            error!("error parsing vxlan range '{}'. Error: {e}", tenant.vxlans)
        })?;
    }
    Ok(())
}

impl NetMaster {
    /// Writes the tenant's allocation parameters and defines its pools.
    /// A tenant that already has operational state is left untouched.
    pub async fn create_tenant(&self, tenant: &ConfigTenant) -> Result<()> {
        let driver = self.driver();
        match gstate::Oper::read(driver, &tenant.name).await {
            Ok(_) => return Ok(()),
            Err(e) if is_key_not_found(&e) => {}
            Err(e) => {
                error!("error reading tenant info '{}'. Error: {e}", tenant.name);
                return Err(e);
            }
        }
        validate_tenant_config(tenant)?;

        let (subnet_pool, subnet_len) = if tenant.subnet_pool.is_empty() {
            (String::new(), 0)
        } else {
            let (ip, len) = parse_cidr(&tenant.subnet_pool)?;
            (ip.to_string(), len)
        };
        let gc = gstate::Cfg {
            version: VERSION_BETA1.to_string(),
            tenant: tenant.name.clone(),
            auto: AutoParams {
                vlans: tenant.vlans.clone(),
                vxlans: tenant.vxlans.clone(),
                subnet_pool,
                subnet_len,
                alloc_subnet_len: tenant.alloc_subnet_len,
            },
            deploy: DeployParams {
                default_net_type: tenant.default_net_type.clone(),
                default_network: tenant.default_network.clone(),
            },
        };
        gc.write(driver)
            .await
            .inspect_err(|e| error!("error updating tenant '{}'.Error: {e}", tenant.name))?;

        let rm = self.resource_manager();
        for kind in [ResKind::Vlan, ResKind::Vxlan, ResKind::Subnet] {
            gc.process(rm, kind)
                .await
                .inspect_err(|e| error!("Error updating the config {gc:?}. Error: {e}"))?;
        }

        // the oper record marks the tenant as created even without vxlans
        let oper = gstate::Oper::read_or_default(driver, &tenant.name).await?;
        oper.write(driver).await?;
        info!("created tenant {}", tenant.name);
        Ok(())
    }

    /// Removes the tenant's pools and global state. Failures past the
    /// existence check are logged; the last one is returned.
    pub async fn delete_tenant_id(&self, tenant_id: &str) -> Result<()> {
        let driver = self.driver();
        gstate::Oper::read(driver, tenant_id)
            .await
            .inspect_err(|e| error!("error reading tenant info '{tenant_id}'. Error: {e}"))?;

        let gc = match gstate::Cfg::read(driver, tenant_id).await {
            Ok(gc) => gc,
            Err(e) => {
                error!("error reading cfg for tenant {tenant_id:?}: {e}");
                gstate::Cfg {
                    tenant: tenant_id.to_string(),
                    ..Default::default()
                }
            }
        };

        let rm = self.resource_manager();
        let mut last_err = None;
        for (configured, kind) in [
            (!gc.auto.vlans.is_empty(), ResKind::Vlan),
            (!gc.auto.vxlans.is_empty(), ResKind::Vxlan),
            (!gc.auto.subnet_pool.is_empty(), ResKind::Subnet),
        ] {
            if configured {
                if let Err(e) = gc.delete_resources(rm, kind).await {
                    last_err = Some(e);
                }
            }
        }

        gc.clear(driver).await.inspect_err(|e| {
            error!("error deleting cfg for tenant {tenant_id:?}: Error: {e}")
        })?;
        if let Some(e) = last_err {
            return Err(e);
        }
        info!("deleted tenant {tenant_id}");
        Ok(())
    }

    /// Deletes the tenant when the intent no longer carries networks.
    pub async fn delete_tenant(&self, tenant: &ConfigTenant) -> Result<()> {
        validate_tenant_config(tenant)?;
        if tenant.networks.is_empty() {
            return self.delete_tenant_id(&tenant.name).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libresource::{AUTO_VLAN, FakeStateDriver, StateDriver, StateResourceManager};
    use serial_test::serial;
    use std::sync::Arc;

    fn master() -> NetMaster {
        let rm = StateResourceManager::new(Arc::new(FakeStateDriver::new())).unwrap();
        NetMaster::new(Arc::new(rm))
    }

    fn tenant(name: &str) -> ConfigTenant {
        ConfigTenant {
            name: name.into(),
            default_net_type: "vlan".into(),
            subnet_pool: "11.1.0.0/16".into(),
            alloc_subnet_len: 24,
            vlans: "11-28".into(),
            ..Default::default()
        }
    }

    #[test]
    fn tenant_validation() {
        assert!(validate_tenant_config(&tenant("t1")).is_ok());
        assert!(validate_tenant_config(&tenant("")).is_err());

        let mut bad = tenant("t1");
        bad.default_net_type = "gre".into();
        assert_eq!(
            validate_tenant_config(&bad).unwrap_err().to_string(),
            "invalid pktTagType"
        );
        let mut bad = tenant("t1");
        bad.vlans = "30-20".into();
        assert!(validate_tenant_config(&bad).is_err());
        let mut bad = tenant("t1");
        bad.subnet_pool = "11.1.0.0".into();
        assert!(validate_tenant_config(&bad).is_err());
    }

    #[tokio::test]
    #[serial]
    async fn create_is_idempotent_and_delete_frees_pools() {
        let nm = master();
        nm.create_tenant(&tenant("t1")).await.unwrap();
        nm.create_tenant(&tenant("t1")).await.unwrap();

        let rm = nm.resource_manager();
        assert_eq!(
            rm.allocate_resource_val("t1", AUTO_VLAN, 0)
                .await
                .unwrap()
                .id(),
            Some(11)
        );

        nm.delete_tenant_id("t1").await.unwrap();
        assert!(nm.delete_tenant_id("t1").await.is_err());
        assert!(rm.allocate_resource_val("t1", AUTO_VLAN, 0).await.is_err());

        nm.create_tenant(&tenant("t1")).await.unwrap();
        assert_eq!(rm.get_resource_list("t1", AUTO_VLAN).await, (0, String::new()));
    }

    #[tokio::test]
    #[serial]
    async fn unreadable_tenant_state_is_not_treated_as_absent() {
        let nm = master();
        nm.driver()
            .write("/contiv.io/oper/global/t1", b"{not json".to_vec())
            .await
            .unwrap();
        let err = nm.create_tenant(&tenant("t1")).await.unwrap_err();
        assert!(!is_key_not_found(&err));
        assert!(gstate::Cfg::read(nm.driver(), "t1").await.is_err());
    }

    #[tokio::test]
    #[serial]
    async fn delete_reports_pool_failure_after_clearing_cfg() {
        let nm = master();
        nm.create_tenant(&tenant("t1")).await.unwrap();
        // the cfg names a vxlan pool that was never defined
        let mut gc = gstate::Cfg::read(nm.driver(), "t1").await.unwrap();
        gc.auto.vxlans = "10001-10010".into();
        gc.write(nm.driver()).await.unwrap();

        let err = nm.delete_tenant_id("t1").await.unwrap_err();
        assert!(err.to_string().contains("No resource found"));
        assert!(gstate::Cfg::read(nm.driver(), "t1").await.is_err());
        let rm = nm.resource_manager();
        assert!(rm.allocate_resource_val("t1", AUTO_VLAN, 0).await.is_err());
    }
}
