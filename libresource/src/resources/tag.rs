use std::sync::Arc;

use async_trait::async_trait;
use fixedbitset::FixedBitSet;
use log::{error, warn};
use serde::{Deserialize, Serialize};

use super::{AUTO_EPG, AUTO_VLAN, Resource, ResourceConfig, ResourceValue, cfg_key, oper_key};
use crate::bitset::{compress_runs, next_set, serde_bits};
use crate::error::{ResourceError, Result};
use crate::state::StateDriver;

#[derive(Debug, Clone, Copy)]
struct TagLabels {
    desc: &'static str,
    what: &'static str,
    label: &'static str,
    plural: &'static str,
}

const VLAN_LABELS: TagLabels = TagLabels {
    desc: AUTO_VLAN,
    what: "vlan",
    label: "vlan",
    plural: "vlans",
};

const EPG_LABELS: TagLabels = TagLabels {
    desc: AUTO_EPG,
    what: "epg id",
    label: "epg_id",
    plural: "epgs",
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagCfg {
    pub id: String,
    #[serde(with = "serde_bits")]
    pub pool: FixedBitSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagOper {
    pub id: String,
    #[serde(rename = "freeTags")]
    #[serde(with = "serde_bits")]
    pub free: FixedBitSet,
}

/// Single-bitset allocator. Backs both the VLAN pool and the endpoint-group
/// id pool; the two differ only in their description and error wording.
pub struct TagResource {
    driver: Arc<dyn StateDriver>,
    id: String,
    labels: TagLabels,
}

impl TagResource {
    pub fn vlan(driver: Arc<dyn StateDriver>, id: &str) -> Self {
        Self {
            driver,
            id: id.to_string(),
            labels: VLAN_LABELS,
        }
    }

    pub fn epg(driver: Arc<dyn StateDriver>, id: &str) -> Self {
        Self {
            driver,
            id: id.to_string(),
            labels: EPG_LABELS,
        }
    }

    fn cfg_key(&self) -> String {
        cfg_key(self.labels.desc, &self.id)
    }

    fn oper_key(&self) -> String {
        oper_key(self.labels.desc, &self.id)
    }

    async fn read_cfg(&self) -> Result<TagCfg> {
        Ok(self.driver.read_state(&self.cfg_key()).await?)
    }

    async fn read_oper(&self) -> Result<TagOper> {
        Ok(self.driver.read_state(&self.oper_key()).await?)
    }

    async fn write_oper(&self, free: FixedBitSet) -> Result<()> {
        let oper = TagOper {
            id: self.id.clone(),
            free,
        };
        Ok(self.driver.write_state(&self.oper_key(), &oper).await?)
    }

    fn pool_from(&self, cfg: ResourceConfig) -> Result<FixedBitSet> {
        match (self.labels.desc, cfg) {
            (AUTO_VLAN, ResourceConfig::Vlan(b)) | (AUTO_EPG, ResourceConfig::Epg(b)) => Ok(b),
            _ => Err(ResourceError::InvalidConfig(format!(
                "invalid type for {} resource config",
                self.labels.desc
            ))),
        }
    }
}

#[async_trait]
impl Resource for TagResource {
    fn description(&self) -> &'static str {
        self.labels.desc
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn init(&self, cfg: ResourceConfig) -> Result<()> {
        let pool = self.pool_from(cfg)?;
        let record = TagCfg {
            id: self.id.clone(),
            pool: pool.clone(),
        };
        self.driver.write_state(&self.cfg_key(), &record).await?;

        if let Err(e) = self.write_oper(pool).await {
            if let Err(ce) = self.driver.clear_state(&self.cfg_key()).await {
                error!("failed to roll back {} cfg {}: {ce}", self.labels.desc, self.id);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn reinit(&self, cfg: ResourceConfig) -> Result<()> {
        let pool = self.pool_from(cfg)?;
        let prev = self.read_cfg().await?;
        let oper = self.read_oper().await?;

        let mut allocated = prev.pool;
        allocated.symmetric_difference_with(&oper.free);

        let mut free = pool.clone();
        free.difference_with(&allocated);

        let record = TagCfg {
            id: self.id.clone(),
            pool,
        };
        self.driver.write_state(&self.cfg_key(), &record).await?;
        self.write_oper(free).await
    }

    async fn deinit(&self) -> Result<()> {
        self.driver.clear_state(&self.oper_key()).await?;
        self.driver.clear_state(&self.cfg_key()).await?;
        Ok(())
    }

    async fn allocate(&self, req: u32) -> Result<ResourceValue> {
        let mut oper = self.read_oper().await?;
        let value = if req != 0 {
            if !oper.free.contains(req as usize) {
                return Err(ResourceError::NotAvailable {
                    what: self.labels.what,
                    label: self.labels.label,
                    value: req,
                });
            }
            req as usize
        } else {
            next_set(&oper.free, 0).ok_or(ResourceError::Exhausted(self.labels.plural))?
        };

        oper.free.set(value, false);
        self.write_oper(oper.free).await?;
        Ok(ResourceValue::Id(value as u32))
    }

    async fn deallocate(&self, value: ResourceValue) -> Result<()> {
        let v = value.id().ok_or_else(|| {
            ResourceError::InvalidConfig(format!("invalid type for {} value", self.labels.what))
        })? as usize;

        let mut oper = self.read_oper().await?;
        if oper.free.contains(v) {
            return Ok(());
        }

        let cfg = self.read_cfg().await?;
        if !cfg.pool.contains(v) {
            warn!(
                "{} {v} is outside the pool of {}, dropping it",
                self.labels.what, self.id
            );
            return Ok(());
        }

        oper.free.insert(v);
        self.write_oper(oper.free).await
    }

    async fn get_list(&self) -> Result<(usize, String)> {
        let cfg = self.read_cfg().await?;
        let oper = self.read_oper().await?;
        let mut allocated = cfg.pool;
        allocated.difference_with(&oper.free);
        Ok(compress_runs(&allocated, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitset::create_bitset;
    use crate::fake::FakeStateDriver;

    fn pool(range: std::ops::RangeInclusive<usize>) -> FixedBitSet {
        let mut b = create_bitset(12);
        for i in range {
            b.insert(i);
        }
        b
    }

    fn driver() -> Arc<dyn StateDriver> {
        Arc::new(FakeStateDriver::new())
    }

    #[tokio::test]
    async fn allocate_until_exhausted() {
        let r = TagResource::vlan(driver(), "t1");
        r.init(ResourceConfig::Vlan(pool(1..=20))).await.unwrap();

        for want in 1..=20 {
            assert_eq!(r.allocate(0).await.unwrap(), ResourceValue::Id(want));
        }
        let err = r.allocate(0).await.unwrap_err();
        assert_eq!(err.to_string(), "no vlans available");
        assert_eq!(r.get_list().await.unwrap(), (20, "1-20".to_string()));
    }

    #[tokio::test]
    async fn explicit_request_and_idempotent_free() {
        let r = TagResource::vlan(driver(), "t1");
        r.init(ResourceConfig::Vlan(pool(1..=20))).await.unwrap();

        for v in [1, 2, 19] {
            r.allocate(v).await.unwrap();
        }
        assert_eq!(r.get_list().await.unwrap(), (3, "1-2, 19".to_string()));

        let err = r.allocate(19).await.unwrap_err();
        assert_eq!(err.to_string(), "requested vlan not available - vlan:19");

        r.deallocate(ResourceValue::Id(19)).await.unwrap();
        r.deallocate(ResourceValue::Id(19)).await.unwrap();
        r.deallocate(ResourceValue::Id(30)).await.unwrap();
        assert_eq!(r.get_list().await.unwrap(), (2, "1-2".to_string()));
    }

    #[tokio::test]
    async fn reinit_keeps_allocated_ids() {
        let r = TagResource::vlan(driver(), "t1");
        r.init(ResourceConfig::Vlan(pool(1..=20))).await.unwrap();
        r.allocate(5).await.unwrap();

        r.reinit(ResourceConfig::Vlan(pool(1..=40))).await.unwrap();
        assert!(r.allocate(5).await.is_err());
        assert_eq!(r.get_list().await.unwrap(), (1, "5".to_string()));

        r.reinit(ResourceConfig::Vlan(pool(3..=10))).await.unwrap();
        assert!(r.allocate(5).await.is_err());
        assert_eq!(r.allocate(0).await.unwrap(), ResourceValue::Id(3));
        assert_eq!(r.get_list().await.unwrap(), (2, "3, 5".to_string()));
    }

    #[tokio::test]
    async fn epg_wording_and_type_check() {
        let r = TagResource::epg(driver(), "global");
        assert!(r.init(ResourceConfig::Vlan(pool(1..=2))).await.is_err());
        r.init(ResourceConfig::Epg(pool(1..=1))).await.unwrap();
        r.allocate(0).await.unwrap();
        assert_eq!(r.allocate(0).await.unwrap_err().to_string(), "no epgs available");
        assert_eq!(
            r.allocate(1).await.unwrap_err().to_string(),
            "requested epg id not available - epg_id:1"
        );
        r.deinit().await.unwrap();
        assert!(r.get_list().await.is_err());
    }
}
