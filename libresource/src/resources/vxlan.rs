use std::sync::Arc;

use async_trait::async_trait;
use fixedbitset::FixedBitSet;
use log::error;
use serde::{Deserialize, Serialize};

use super::{
    AUTO_VXLAN, Resource, ResourceConfig, ResourceValue, VxlanConfig, VxlanVlanPair, cfg_key,
    oper_key,
};
use crate::bitset::{compress_runs, next_set, serde_bits};
use crate::error::{ResourceError, Result};
use crate::state::StateDriver;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VxlanCfg {
    pub id: String,
    #[serde(rename = "VXLANs")]
    #[serde(with = "serde_bits")]
    pub vxlans: FixedBitSet,
    #[serde(rename = "LocalVLANs")]
    #[serde(with = "serde_bits")]
    pub local_vlans: FixedBitSet,
    #[serde(rename = "FreeVXLANsStart")]
    pub free_vxlans_start: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VxlanOper {
    pub id: String,
    #[serde(rename = "freeVXLANs")]
    #[serde(with = "serde_bits")]
    pub free_vxlans: FixedBitSet,
    #[serde(rename = "freeLocalVLANs")]
    #[serde(with = "serde_bits")]
    pub free_local_vlans: FixedBitSet,
}

/// Hands out a VXLAN id together with a host-local VLAN. Bit `i` of the
/// VXLAN set stands for VXLAN `i + free_vxlans_start`.
pub struct VxlanResource {
    driver: Arc<dyn StateDriver>,
    id: String,
}

impl VxlanResource {
    pub fn new(driver: Arc<dyn StateDriver>, id: &str) -> Self {
        Self {
            driver,
            id: id.to_string(),
        }
    }

    fn cfg_key(&self) -> String {
        cfg_key(AUTO_VXLAN, &self.id)
    }

    fn oper_key(&self) -> String {
        oper_key(AUTO_VXLAN, &self.id)
    }

    async fn read_cfg(&self) -> Result<VxlanCfg> {
        Ok(self.driver.read_state(&self.cfg_key()).await?)
    }

    async fn read_oper(&self) -> Result<VxlanOper> {
        Ok(self.driver.read_state(&self.oper_key()).await?)
    }

    async fn write_oper(&self, oper: &VxlanOper) -> Result<()> {
        Ok(self.driver.write_state(&self.oper_key(), oper).await?)
    }

    fn expect_config(cfg: ResourceConfig) -> Result<VxlanConfig> {
        match cfg {
            ResourceConfig::Vxlan(c) => Ok(c),
            _ => Err(ResourceError::InvalidConfig(
                "Invalid vxlan resource config.".into(),
            )),
        }
    }

    fn record(&self, cfg: VxlanConfig) -> VxlanCfg {
        VxlanCfg {
            id: self.id.clone(),
            vxlans: cfg.vxlans,
            local_vlans: cfg.local_vlans,
            free_vxlans_start: cfg.free_vxlans_start,
        }
    }
}

#[async_trait]
impl Resource for VxlanResource {
    fn description(&self) -> &'static str {
        AUTO_VXLAN
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn init(&self, cfg: ResourceConfig) -> Result<()> {
        let record = self.record(Self::expect_config(cfg)?);
        self.driver.write_state(&self.cfg_key(), &record).await?;

        let oper = VxlanOper {
            id: self.id.clone(),
            free_vxlans: record.vxlans,
            free_local_vlans: record.local_vlans,
        };
        if let Err(e) = self.write_oper(&oper).await {
            if let Err(ce) = self.driver.clear_state(&self.cfg_key()).await {
                error!("failed to roll back vxlan cfg {}: {ce}", self.id);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn reinit(&self, cfg: ResourceConfig) -> Result<()> {
        let next = self.record(Self::expect_config(cfg)?);
        let prev = self.read_cfg().await?;
        let mut oper = self.read_oper().await?;

        let mut allocated = prev.vxlans;
        allocated.symmetric_difference_with(&oper.free_vxlans);

        let mut free = next.vxlans.clone();
        for i in allocated.ones() {
            let vxlan = i as i64 + prev.free_vxlans_start as i64;
            let pos = vxlan - next.free_vxlans_start as i64;
            if pos >= 0 && (pos as usize) < free.len() {
                free.set(pos as usize, false);
            }
        }
        oper.free_vxlans = free;
        oper.free_local_vlans.intersect_with(&next.local_vlans);

        self.driver.write_state(&self.cfg_key(), &next).await?;
        self.write_oper(&oper).await
    }

    async fn deinit(&self) -> Result<()> {
        self.driver.clear_state(&self.oper_key()).await?;
        self.driver.clear_state(&self.cfg_key()).await?;
        Ok(())
    }

    async fn allocate(&self, req: u32) -> Result<ResourceValue> {
        let mut oper = self.read_oper().await?;

        let vxlan = if req != 0 {
            if !oper.free_vxlans.contains(req as usize) {
                return Err(ResourceError::NotAvailable {
                    what: "vxlan",
                    label: "vxlan",
                    value: req,
                });
            }
            req as usize
        } else {
            next_set(&oper.free_vxlans, 0).ok_or(ResourceError::Exhausted("vxlans"))?
        };
        let vlan =
            next_set(&oper.free_local_vlans, 0).ok_or(ResourceError::Exhausted("local vlans"))?;

        oper.free_vxlans.set(vxlan, false);
        oper.free_local_vlans.set(vlan, false);
        self.write_oper(&oper).await?;

        Ok(ResourceValue::VxlanVlan(VxlanVlanPair {
            vxlan: vxlan as u32,
            vlan: vlan as u32,
        }))
    }

    async fn deallocate(&self, value: ResourceValue) -> Result<()> {
        let pair = value.vxlan_vlan().ok_or_else(|| {
            ResourceError::InvalidConfig("Invalid type for vxlan-vlan pair".into())
        })?;
        let mut oper = self.read_oper().await?;
        let (vxlan, vlan) = (pair.vxlan as usize, pair.vlan as usize);
        if vxlan < oper.free_vxlans.len() {
            oper.free_vxlans.insert(vxlan);
        }
        if vlan < oper.free_local_vlans.len() {
            oper.free_local_vlans.insert(vlan);
        }
        self.write_oper(&oper).await
    }

    async fn get_list(&self) -> Result<(usize, String)> {
        let cfg = self.read_cfg().await?;
        let oper = self.read_oper().await?;
        let mut allocated = oper.free_vxlans;
        allocated.symmetric_difference_with(&cfg.vxlans);
        Ok(compress_runs(&allocated, cfg.free_vxlans_start as usize))
    }
}
