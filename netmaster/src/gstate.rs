//! Per-tenant auto-allocation parameters (Cfg) and the state derived from
//! them (Oper), plus the tag and subnet allocation entry points built on
//! the resource manager.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use fixedbitset::FixedBitSet;
use libresource::bitset::create_bitset;
use libresource::netutils::{TagRange, parse_cidr, parse_tag_ranges};
use libresource::resources::ResourceConfig;
use libresource::{
    AUTO_SUBNET, AUTO_VLAN, AUTO_VXLAN, StateDriver, StateResourceManager, SubnetConfig,
    SubnetIpLenPair, VxlanConfig, VxlanVlanPair,
};
use libresource::{ResourceValue, is_key_not_found};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

const CFG_GLOBAL_PREFIX: &str = "/contiv.io/state/global/";
const OPER_GLOBAL_PREFIX: &str = "/contiv.io/oper/global/";
const VXLAN_LOCAL_VLAN_RANGE: &str = "1-4094";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResKind {
    Vlan,
    Vxlan,
    Subnet,
}

impl fmt::Display for ResKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResKind::Vlan => "vlan",
            ResKind::Vxlan => "vxlan",
            ResKind::Subnet => "subnet",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoParams {
    #[serde(rename = "VLANs", default)]
    pub vlans: String,
    #[serde(rename = "VXLANs", default)]
    pub vxlans: String,
    #[serde(rename = "SubnetPool", default)]
    pub subnet_pool: String,
    #[serde(rename = "SubnetLen", default)]
    pub subnet_len: u32,
    #[serde(rename = "AllocSubnetLen", default)]
    pub alloc_subnet_len: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployParams {
    #[serde(rename = "DefaultNetType", default)]
    pub default_net_type: String,
    #[serde(rename = "DefaultNetwork", default)]
    pub default_network: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cfg {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub auto: AutoParams,
    #[serde(default)]
    pub deploy: DeployParams,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Oper {
    pub tenant: String,
    pub default_network: String,
    #[serde(rename = "freeVXLANsStart")]
    pub free_vxlans_start: u32,
}

fn cfg_key(tenant: &str) -> String {
    format!("{CFG_GLOBAL_PREFIX}{tenant}")
}

fn oper_key(tenant: &str) -> String {
    format!("{OPER_GLOBAL_PREFIX}{tenant}")
}

impl Oper {
    pub async fn read(driver: &Arc<dyn StateDriver>, tenant: &str) -> Result<Oper> {
        Ok(driver.read_state(&oper_key(tenant)).await?)
    }

    /// Reads the Oper record, starting from an empty one when absent.
    pub async fn read_or_default(driver: &Arc<dyn StateDriver>, tenant: &str) -> Result<Oper> {
        match Self::read(driver, tenant).await {
            Ok(g) => Ok(g),
            Err(e) if is_key_not_found(&e) => Ok(Oper {
                tenant: tenant.to_string(),
                ..Default::default()
            }),
            Err(e) => Err(e),
        }
    }

    pub async fn write(&self, driver: &Arc<dyn StateDriver>) -> Result<()> {
        Ok(driver.write_state(&oper_key(&self.tenant), self).await?)
    }
}

fn vlan_bitset(ranges: &[TagRange]) -> FixedBitSet {
    let mut b = create_bitset(12);
    for r in ranges {
        b.insert_range(r.min as usize..r.max as usize + 1);
    }
    b.set(0, false);
    b.set(4095, false);
    b
}

/// Parses one `"a-b"` or `"a"` item of an in-use list.
fn used_run(item: &str) -> Option<(u32, u32)> {
    let item = item.trim();
    let (lo, hi) = item.split_once('-').unwrap_or((item, item));
    let (lo, hi) = (lo.trim().parse().ok()?, hi.trim().parse().ok()?);
    (lo <= hi).then_some((lo, hi))
}

/// True when `ranges` still covers every tag in `in_use`, the compressed
/// `"a-b, c"` list of tags currently handed out. Each in-use run must sit
/// inside a single new range, so a gap that opens under a used tag fails.
pub fn check_in_bit_range(ranges: &str, in_use: &str, tag_type: &str) -> bool {
    if in_use.trim().is_empty() {
        return true;
    }
    let Ok(ranges) = parse_tag_ranges(ranges, tag_type) else {
        return false;
    };
    in_use.split(',').all(|item| {
        used_run(item).is_some_and(|(lo, hi)| {
            ranges.iter().any(|r| r.min <= lo && hi <= r.max)
        })
    })
}

impl Cfg {
    /// Deserializes and validates a tenant's allocation parameters.
    pub fn parse(bytes: &[u8]) -> Result<Cfg> {
        let gc: Cfg = serde_json::from_slice(bytes).context("invalid global config")?;
        gc.check_errors(ResKind::Vlan)?;
        gc.check_errors(ResKind::Vxlan)?;
        Ok(gc)
    }

    fn check_errors(&self, kind: ResKind) -> Result<()> {
        match kind {
            ResKind::Vlan => {
                parse_tag_ranges(&self.auto.vlans, "vlan")?;
            }
            ResKind::Vxlan => {
                parse_tag_ranges(&self.auto.vxlans, "vxlan")?;
            }
            ResKind::Subnet => {
                if !self.auto.subnet_pool.is_empty() {
                    let cidr = format!("{}/{}", self.auto.subnet_pool, self.auto.subnet_len);
                    parse_cidr(&cidr)?;
                    if self.auto.alloc_subnet_len < self.auto.subnet_len {
                        bail!(
                            "alloc subnet len {} is smaller than subnet len {}",
                            self.auto.alloc_subnet_len,
                            self.auto.subnet_len
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn read(driver: &Arc<dyn StateDriver>, tenant: &str) -> Result<Cfg> {
        Ok(driver.read_state(&cfg_key(tenant)).await?)
    }

    pub async fn write(&self, driver: &Arc<dyn StateDriver>) -> Result<()> {
        Ok(driver.write_state(&cfg_key(&self.tenant), self).await?)
    }

    /// Every tenant's Cfg record.
    pub async fn list(driver: &Arc<dyn StateDriver>) -> Result<Vec<Cfg>> {
        Ok(driver.list_state(CFG_GLOBAL_PREFIX).await?)
    }

    /// Removes both the Cfg and the Oper record of the tenant.
    pub async fn clear(&self, driver: &Arc<dyn StateDriver>) -> Result<()> {
        driver.clear_state(&oper_key(&self.tenant)).await?;
        driver.clear_state(&cfg_key(&self.tenant)).await?;
        Ok(())
    }

    fn init_vlan_bitset(vlans: &str) -> Result<FixedBitSet> {
        Ok(vlan_bitset(&parse_tag_ranges(vlans, "vlan")?))
    }

    fn init_vxlan_config(vxlans: &str) -> Result<VxlanConfig> {
        let ranges = parse_tag_ranges(vxlans, "vxlan")?;
        let range = ranges[0];
        if range.min == 0 {
            bail!("vxlan range is not configured");
        }
        let start = range.min - 1;
        let mut vxlans = create_bitset(14);
        vxlans.insert_range((range.min - start) as usize..(range.max - start) as usize + 1);

        Ok(VxlanConfig {
            vxlans,
            local_vlans: Self::init_vlan_bitset(VXLAN_LOCAL_VLAN_RANGE)?,
            free_vxlans_start: start,
        })
    }

    fn subnet_config(&self) -> Result<SubnetConfig> {
        let (ip, len) = parse_cidr(&format!("{}/{}", self.auto.subnet_pool, self.auto.subnet_len))?;
        Ok(SubnetConfig {
            subnet_pool: ip,
            subnet_pool_len: len,
            alloc_subnet_len: self.auto.alloc_subnet_len,
        })
    }

    async fn record_vxlan_start(&self, driver: &Arc<dyn StateDriver>, start: u32) -> Result<()> {
        let mut g = Oper::read_or_default(driver, &self.tenant).await?;
        g.free_vxlans_start = start;
        if let Err(e) = g.write(driver).await {
            error!("error '{e}' updating global oper state {g:?}");
            return Err(e);
        }
        Ok(())
    }

    /// Defines the tenant's pool for `kind` from the configured ranges.
    pub async fn process(&self, rm: &StateResourceManager, kind: ResKind) -> Result<()> {
        self.check_errors(kind)
            .with_context(|| format!("process failed on error checks for {kind}"))?;
        let driver = rm.driver();

        match kind {
            ResKind::Vlan => {
                if !self.auto.vlans.is_empty() {
                    let pool = Self::init_vlan_bitset(&self.auto.vlans)?;
                    rm.define_resource(&self.tenant, AUTO_VLAN, ResourceConfig::Vlan(pool))
                        .await?;
                }
            }
            ResKind::Vxlan => {
                if !self.auto.vxlans.is_empty() {
                    let cfg = Self::init_vxlan_config(&self.auto.vxlans)?;
                    let start = cfg.free_vxlans_start;
                    rm.define_resource(&self.tenant, AUTO_VXLAN, ResourceConfig::Vxlan(cfg))
                        .await?;
                    self.record_vxlan_start(&driver, start).await?;
                }
            }
            ResKind::Subnet => {
                if !self.auto.subnet_pool.is_empty() {
                    let cfg = self.subnet_config()?;
                    rm.define_resource(&self.tenant, AUTO_SUBNET, ResourceConfig::Subnet(cfg))
                        .await?;
                }
            }
        }
        debug!("updated global config of tenant {} for {kind}", self.tenant);
        Ok(())
    }

    /// Resizes a live pool. Refused when tags already handed out would fall
    /// outside the new range.
    pub async fn update_resources(&self, rm: &StateResourceManager, kind: ResKind) -> Result<()> {
        info!("Received update resource for res {kind}");
        self.check_errors(kind)
            .with_context(|| format!("process failed on error checks for {kind}"))?;
        let driver = rm.driver();

        match kind {
            ResKind::Vlan => {
                let (_, in_use) = self.get_vlans_in_use(rm).await;
                if !check_in_bit_range(&self.auto.vlans, &in_use, "vlan") {
                    bail!(
                        "Existing vlans {in_use} not in new range {}",
                        self.auto.vlans
                    );
                }
                let pool = Self::init_vlan_bitset(&self.auto.vlans)?;
                rm.redefine_resource(&self.tenant, AUTO_VLAN, ResourceConfig::Vlan(pool))
                    .await?;
            }
            ResKind::Vxlan => {
                let (_, in_use) = self.get_vxlans_in_use(rm).await;
                if !check_in_bit_range(&self.auto.vxlans, &in_use, "vxlan") {
                    bail!(
                        "Existing vxlans {in_use} not in new range {}",
                        self.auto.vxlans
                    );
                }
                let cfg = Self::init_vxlan_config(&self.auto.vxlans)?;
                let start = cfg.free_vxlans_start;
                rm.redefine_resource(&self.tenant, AUTO_VXLAN, ResourceConfig::Vxlan(cfg))
                    .await?;
                self.record_vxlan_start(&driver, start).await?;
            }
            ResKind::Subnet => bail!("subnet pools cannot be resized"),
        }
        Ok(())
    }

    pub async fn delete_resources(&self, rm: &StateResourceManager, kind: ResKind) -> Result<()> {
        let desc = match kind {
            ResKind::Vlan => AUTO_VLAN,
            ResKind::Vxlan => AUTO_VXLAN,
            ResKind::Subnet => AUTO_SUBNET,
        };
        if let Err(e) = rm.undefine_resource(&self.tenant, desc).await {
            error!("Error deleting {kind} resource. Err: {e}");
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn get_vlans_in_use(&self, rm: &StateResourceManager) -> (usize, String) {
        rm.get_resource_list(&self.tenant, AUTO_VLAN).await
    }

    pub async fn get_vxlans_in_use(&self, rm: &StateResourceManager) -> (usize, String) {
        rm.get_resource_list(&self.tenant, AUTO_VXLAN).await
    }

    pub async fn alloc_vlan(&self, rm: &StateResourceManager, req: u32) -> Result<u32> {
        let value = rm
            .allocate_resource_val(&self.tenant, AUTO_VLAN, req)
            .await
            .inspect_err(|e| error!("alloc vlan failed: {e}"))?;
        value
            .id()
            .ok_or_else(|| anyhow::anyhow!("unexpected vlan value {value:?}"))
    }

    pub async fn free_vlan(&self, rm: &StateResourceManager, vlan: u32) -> Result<()> {
        rm.deallocate_resource_val(&self.tenant, AUTO_VLAN, ResourceValue::Id(vlan))
            .await?;
        Ok(())
    }

    /// Allocates a VXLAN (absolute number) with its local VLAN. The range
    /// offset is read fresh on every call.
    pub async fn alloc_vxlan(&self, rm: &StateResourceManager, req: u32) -> Result<(u32, u32)> {
        let g = Oper::read(&rm.driver(), &self.tenant).await?;
        let start = g.free_vxlans_start;
        if req != 0 && req <= start {
            bail!("requested vxlan is out of range");
        }
        let req = if req != 0 { req - start } else { 0 };

        let value = rm
            .allocate_resource_val(&self.tenant, AUTO_VXLAN, req)
            .await?;
        let pair = value
            .vxlan_vlan()
            .ok_or_else(|| anyhow::anyhow!("unexpected vxlan value {value:?}"))?;
        Ok((pair.vxlan + start, pair.vlan))
    }

    pub async fn free_vxlan(
        &self,
        rm: &StateResourceManager,
        vxlan: u32,
        local_vlan: u32,
    ) -> Result<()> {
        let g = Oper::read(&rm.driver(), &self.tenant).await?;
        let Some(pos) = vxlan.checked_sub(g.free_vxlans_start) else {
            bail!("vxlan {vxlan} is below the configured range");
        };
        rm.deallocate_resource_val(
            &self.tenant,
            AUTO_VXLAN,
            ResourceValue::VxlanVlan(VxlanVlanPair {
                vxlan: pos,
                vlan: local_vlan,
            }),
        )
        .await?;
        Ok(())
    }

    /// Allocates a subnet block; returns its address.
    pub async fn alloc_subnet(&self, rm: &StateResourceManager) -> Result<String> {
        let value = rm
            .allocate_resource_val(&self.tenant, AUTO_SUBNET, 0)
            .await?;
        let pair = value
            .subnet()
            .ok_or_else(|| anyhow::anyhow!("unexpected subnet value {value:?}"))?;
        Ok(pair.ip.to_string())
    }

    pub async fn free_subnet(&self, rm: &StateResourceManager, subnet_ip: &str) -> Result<()> {
        let ip = subnet_ip
            .parse()
            .with_context(|| format!("invalid subnet address {subnet_ip}"))?;
        rm.deallocate_resource_val(
            &self.tenant,
            AUTO_SUBNET,
            ResourceValue::Subnet(SubnetIpLenPair {
                ip,
                len: self.auto.alloc_subnet_len,
            }),
        )
        .await?;
        Ok(())
    }

    /// Records `network` as the tenant default unless one is already set.
    /// Returns the name now assigned, or empty when nothing changed.
    pub async fn assign_default_network(
        &self,
        driver: &Arc<dyn StateDriver>,
        network: &str,
    ) -> Result<String> {
        let mut g = Oper::read_or_default(driver, &self.tenant).await?;
        if !g.default_network.is_empty() {
            return Ok(String::new());
        }
        g.default_network = network.to_string();
        if let Err(e) = g.write(driver).await {
            error!("error '{e}' updating goper state {g:?}");
            return Err(e);
        }
        Ok(g.default_network)
    }

    pub async fn unassign_network(
        &self,
        driver: &Arc<dyn StateDriver>,
        network: &str,
    ) -> Result<()> {
        if network.is_empty() {
            return Ok(());
        }
        let mut g = Oper::read_or_default(driver, &self.tenant).await?;
        if g.default_network == network {
            g.default_network.clear();
            if let Err(e) = g.write(driver).await {
                error!("error '{e}' updating goper state {g:?}");
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libresource::FakeStateDriver;
    use serial_test::serial;

    fn tenant_cfg(vlans: &str, vxlans: &str) -> Cfg {
        Cfg {
            version: "0.01".into(),
            tenant: "default".into(),
            auto: AutoParams {
                vlans: vlans.into(),
                vxlans: vxlans.into(),
                ..Default::default()
            },
            deploy: DeployParams {
                default_net_type: "vlan".into(),
                ..Default::default()
            },
        }
    }

    fn manager() -> StateResourceManager {
        StateResourceManager::new(Arc::new(FakeStateDriver::new())).unwrap()
    }

    #[test]
    fn parse_validates_ranges() {
        let ok = br#"{"tenant":"t1","auto":{"VLANs":"11-28","VXLANs":"10000-10100"}}"#;
        let gc = Cfg::parse(ok).unwrap();
        assert_eq!(gc.auto.vlans, "11-28");

        let bad_vlan = br#"{"tenant":"t1","auto":{"VLANs":"11-5000","VXLANs":""}}"#;
        assert!(Cfg::parse(bad_vlan).is_err());
        let bad_vxlan = br#"{"tenant":"t1","auto":{"VLANs":"","VXLANs":"1-10,20-30"}}"#;
        assert!(Cfg::parse(bad_vxlan).is_err());
        assert!(Cfg::parse(b"not json").is_err());
    }

    #[test]
    fn reserved_vlans_are_never_pooled() {
        let b = Cfg::init_vlan_bitset("1-4095").unwrap();
        assert!(!b.contains(0));
        assert!(!b.contains(4095));
        assert_eq!(b.count_ones(..), 4094);
    }

    #[test]
    fn in_use_range_check() {
        assert!(check_in_bit_range("1-100", "", "vlan"));
        assert!(check_in_bit_range("1-100", "1-2, 19", "vlan"));
        assert!(check_in_bit_range("2-19", "2-5, 19", "vlan"));
        assert!(!check_in_bit_range("3-100", "1-2, 19", "vlan"));
        assert!(!check_in_bit_range("1-18", "1-2, 19", "vlan"));
        assert!(!check_in_bit_range("bogus", "5", "vlan"));
        assert!(check_in_bit_range("1000-2000", "1500", "vxlan"));
        assert!(!check_in_bit_range("1-10, 20-30", "15", "vlan"));
        assert!(check_in_bit_range("1-10, 20-30", "2-4, 25", "vlan"));
        assert!(!check_in_bit_range("1-10, 20-30", "8-22", "vlan"));
    }

    #[tokio::test]
    #[serial]
    async fn vlan_alloc_free_and_resize() {
        let rm = manager();
        let driver = rm.driver();
        let gc = tenant_cfg("1-20", "");
        gc.write(&driver).await.unwrap();
        gc.process(&rm, ResKind::Vlan).await.unwrap();

        assert_eq!(gc.alloc_vlan(&rm, 0).await.unwrap(), 1);
        assert_eq!(gc.alloc_vlan(&rm, 19).await.unwrap(), 19);
        assert!(gc.alloc_vlan(&rm, 19).await.is_err());

        let grown = tenant_cfg("1-40", "");
        grown.update_resources(&rm, ResKind::Vlan).await.unwrap();
        assert!(grown.alloc_vlan(&rm, 19).await.is_err());
        assert_eq!(grown.get_vlans_in_use(&rm).await, (2, "1, 19".to_string()));

        let shrunk = tenant_cfg("1-10", "");
        assert!(shrunk.update_resources(&rm, ResKind::Vlan).await.is_err());

        grown.free_vlan(&rm, 19).await.unwrap();
        grown.free_vlan(&rm, 19).await.unwrap();
        shrunk.update_resources(&rm, ResKind::Vlan).await.unwrap();
        assert_eq!(shrunk.get_vlans_in_use(&rm).await, (1, "1".to_string()));
        rm.release().unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn resize_cannot_open_a_gap_under_a_used_vlan() {
        let rm = manager();
        let gc = tenant_cfg("1-30", "");
        gc.write(&rm.driver()).await.unwrap();
        gc.process(&rm, ResKind::Vlan).await.unwrap();
        assert_eq!(gc.alloc_vlan(&rm, 15).await.unwrap(), 15);

        let split = tenant_cfg("1-10, 20-30", "");
        let err = split.update_resources(&rm, ResKind::Vlan).await.unwrap_err();
        assert!(err.to_string().contains("Existing vlans 15 not in new range"));
        assert!(gc.alloc_vlan(&rm, 15).await.is_err());

        gc.free_vlan(&rm, 15).await.unwrap();
        split.update_resources(&rm, ResKind::Vlan).await.unwrap();
        assert!(split.alloc_vlan(&rm, 15).await.is_err());
        rm.release().unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn vxlan_numbers_are_offset_by_range_start() {
        let rm = manager();
        let driver = rm.driver();
        let gc = tenant_cfg("", "10001-10010");
        gc.process(&rm, ResKind::Vxlan).await.unwrap();
        assert_eq!(
            Oper::read(&driver, "default").await.unwrap().free_vxlans_start,
            10000
        );

        let (vxlan, local) = gc.alloc_vxlan(&rm, 0).await.unwrap();
        assert_eq!((vxlan, local), (10001, 1));
        let (vxlan2, _) = gc.alloc_vxlan(&rm, 10005).await.unwrap();
        assert_eq!(vxlan2, 10005);
        assert_eq!(
            gc.alloc_vxlan(&rm, 10000).await.unwrap_err().to_string(),
            "requested vxlan is out of range"
        );
        assert_eq!(
            gc.get_vxlans_in_use(&rm).await,
            (2, "10001, 10005".to_string())
        );

        gc.free_vxlan(&rm, vxlan, local).await.unwrap();
        let (again, _) = gc.alloc_vxlan(&rm, 0).await.unwrap();
        assert_eq!(again, 10001);

        let moved = tenant_cfg("", "10001-10020");
        moved.update_resources(&rm, ResKind::Vxlan).await.unwrap();
        assert!(moved.alloc_vxlan(&rm, 10005).await.is_err());
        rm.release().unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn default_network_is_first_writer_wins() {
        let rm = manager();
        let driver = rm.driver();
        let gc = tenant_cfg("1-10", "");

        assert_eq!(
            gc.assign_default_network(&driver, "orange").await.unwrap(),
            "orange"
        );
        assert_eq!(gc.assign_default_network(&driver, "purple").await.unwrap(), "");

        gc.unassign_network(&driver, "purple").await.unwrap();
        assert_eq!(
            Oper::read(&driver, "default").await.unwrap().default_network,
            "orange"
        );
        gc.unassign_network(&driver, "orange").await.unwrap();
        assert_eq!(
            gc.assign_default_network(&driver, "purple").await.unwrap(),
            "purple"
        );
        rm.release().unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn subnet_pool_is_defined_when_configured() {
        let rm = manager();
        let mut gc = tenant_cfg("1-10", "");
        gc.auto.subnet_pool = "11.5.0.0".into();
        gc.auto.subnet_len = 16;
        gc.auto.alloc_subnet_len = 24;
        gc.process(&rm, ResKind::Subnet).await.unwrap();

        let first = gc.alloc_subnet(&rm).await.unwrap();
        assert_eq!(first, "11.5.0.0");
        assert_eq!(gc.alloc_subnet(&rm).await.unwrap(), "11.5.1.0");
        gc.free_subnet(&rm, &first).await.unwrap();
        assert_eq!(gc.alloc_subnet(&rm).await.unwrap(), "11.5.0.0");

        gc.delete_resources(&rm, ResKind::Subnet).await.unwrap();
        assert!(gc.alloc_subnet(&rm).await.is_err());
        rm.release().unwrap();
    }
}
