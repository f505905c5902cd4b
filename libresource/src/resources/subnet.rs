use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use fixedbitset::FixedBitSet;
use log::error;
use serde::{Deserialize, Serialize};

use super::{
    AUTO_SUBNET, Resource, ResourceConfig, ResourceValue, SubnetConfig, SubnetIpLenPair, cfg_key,
    oper_key,
};
use crate::bitset::{compress_runs, create_bitset, next_set, serde_bits};
use crate::error::{ResourceError, Result};
use crate::netutils::{get_ip_number, get_subnet_ip};
use crate::state::StateDriver;

/// Widest pool, in bits of block index, a single subnet resource tracks.
const MAX_SUBNET_BITS: u32 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetCfg {
    pub id: String,
    pub subnet_pool: Ipv4Addr,
    pub subnet_pool_len: u32,
    pub alloc_subnet_len: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetOper {
    pub id: String,
    #[serde(with = "serde_bits")]
    pub free_subnets: FixedBitSet,
}

/// Carves `/alloc_subnet_len` blocks out of a `/subnet_pool_len` pool.
pub struct SubnetResource {
    driver: Arc<dyn StateDriver>,
    id: String,
}

impl SubnetResource {
    pub fn new(driver: Arc<dyn StateDriver>, id: &str) -> Self {
        Self {
            driver,
            id: id.to_string(),
        }
    }

    fn cfg_key(&self) -> String {
        cfg_key(AUTO_SUBNET, &self.id)
    }

    fn oper_key(&self) -> String {
        oper_key(AUTO_SUBNET, &self.id)
    }

    async fn read_cfg(&self) -> Result<SubnetCfg> {
        Ok(self.driver.read_state(&self.cfg_key()).await?)
    }

    async fn read_oper(&self) -> Result<SubnetOper> {
        Ok(self.driver.read_state(&self.oper_key()).await?)
    }

    async fn write_oper(&self, free_subnets: FixedBitSet) -> Result<()> {
        let oper = SubnetOper {
            id: self.id.clone(),
            free_subnets,
        };
        Ok(self.driver.write_state(&self.oper_key(), &oper).await?)
    }
}

#[async_trait]
impl Resource for SubnetResource {
    fn description(&self) -> &'static str {
        AUTO_SUBNET
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn init(&self, cfg: ResourceConfig) -> Result<()> {
        let SubnetConfig {
            subnet_pool,
            subnet_pool_len,
            alloc_subnet_len,
        } = match cfg {
            ResourceConfig::Subnet(c) => c,
            _ => {
                return Err(ResourceError::InvalidConfig(
                    "Invalid type for subnet resource config".into(),
                ));
            }
        };
        if alloc_subnet_len < subnet_pool_len {
            return Err(ResourceError::InvalidConfig(
                "AllocSubnetLen should be greater than or equal to SubnetPoolLen".into(),
            ));
        }
        let width = alloc_subnet_len - subnet_pool_len;
        if width > MAX_SUBNET_BITS || alloc_subnet_len > 32 {
            return Err(ResourceError::InvalidConfig(format!(
                "subnet pool /{subnet_pool_len} split into /{alloc_subnet_len} is too large"
            )));
        }

        let record = SubnetCfg {
            id: self.id.clone(),
            subnet_pool,
            subnet_pool_len,
            alloc_subnet_len,
        };
        self.driver.write_state(&self.cfg_key(), &record).await?;

        let mut free = create_bitset(width);
        free.insert_range(..);
        if let Err(e) = self.write_oper(free).await {
            if let Err(ce) = self.driver.clear_state(&self.cfg_key()).await {
                error!("failed to roll back subnet cfg {}: {ce}", self.id);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn reinit(&self, _cfg: ResourceConfig) -> Result<()> {
        Err(ResourceError::InvalidConfig(
            "subnet resource does not support redefinition".into(),
        ))
    }

    async fn deinit(&self) -> Result<()> {
        self.driver.clear_state(&self.oper_key()).await?;
        self.driver.clear_state(&self.cfg_key()).await?;
        Ok(())
    }

    async fn allocate(&self, _req: u32) -> Result<ResourceValue> {
        let cfg = self.read_cfg().await?;
        let mut oper = self.read_oper().await?;

        let slot = next_set(&oper.free_subnets, 0).ok_or(ResourceError::Exhausted("subnets"))?;
        let ip = get_subnet_ip(
            cfg.subnet_pool,
            cfg.subnet_pool_len,
            cfg.alloc_subnet_len,
            slot as u32,
        )?;

        oper.free_subnets.set(slot, false);
        self.write_oper(oper.free_subnets).await?;
        Ok(ResourceValue::Subnet(SubnetIpLenPair {
            ip,
            len: cfg.alloc_subnet_len,
        }))
    }

    async fn deallocate(&self, value: ResourceValue) -> Result<()> {
        let pair = value.subnet().ok_or_else(|| {
            ResourceError::InvalidConfig("Invalid type for subnet value".into())
        })?;
        let cfg = self.read_cfg().await?;
        if pair.len != cfg.alloc_subnet_len {
            return Err(ResourceError::InvalidConfig(format!(
                "Invalid subnet length. Exp: {} Rcvd: {}",
                cfg.alloc_subnet_len, pair.len
            )));
        }
        let slot = get_ip_number(cfg.subnet_pool, cfg.subnet_pool_len, pair.len, pair.ip)? as usize;

        let mut oper = self.read_oper().await?;
        if slot >= oper.free_subnets.len() || oper.free_subnets.contains(slot) {
            return Ok(());
        }
        oper.free_subnets.insert(slot);
        self.write_oper(oper.free_subnets).await
    }

    async fn get_list(&self) -> Result<(usize, String)> {
        let oper = self.read_oper().await?;
        let mut allocated = oper.free_subnets;
        allocated.toggle_range(..);
        Ok(compress_runs(&allocated, 0))
    }
}
