//! Bitset-backed allocators persisted as a Cfg record (the defined pool)
//! and an Oper record (the current free set).

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use fixedbitset::FixedBitSet;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::StateDriver;

pub mod manager;
pub mod subnet;
pub mod tag;
pub mod vxlan;

pub use manager::StateResourceManager;
pub use subnet::SubnetResource;
pub use tag::TagResource;
pub use vxlan::VxlanResource;

pub const AUTO_VLAN: &str = "auto-vlan";
pub const AUTO_VXLAN: &str = "auto-vxlan";
pub const AUTO_SUBNET: &str = "auto-subnet";
pub const AUTO_EPG: &str = "auto-epg";

/// Pool definition handed to `init`/`reinit`.
#[derive(Debug, Clone)]
pub enum ResourceConfig {
    Vlan(FixedBitSet),
    Vxlan(VxlanConfig),
    Subnet(SubnetConfig),
    Epg(FixedBitSet),
}

#[derive(Debug, Clone)]
pub struct VxlanConfig {
    pub vxlans: FixedBitSet,
    pub local_vlans: FixedBitSet,
    pub free_vxlans_start: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SubnetConfig {
    pub subnet_pool: Ipv4Addr,
    pub subnet_pool_len: u32,
    pub alloc_subnet_len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VxlanVlanPair {
    pub vxlan: u32,
    pub vlan: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetIpLenPair {
    pub ip: Ipv4Addr,
    pub len: u32,
}

/// A value handed out by `allocate` and returned through `deallocate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceValue {
    Id(u32),
    VxlanVlan(VxlanVlanPair),
    Subnet(SubnetIpLenPair),
}

impl ResourceValue {
    pub fn id(&self) -> Option<u32> {
        match self {
            ResourceValue::Id(v) => Some(*v),
            _ => None,
        }
    }

    pub fn vxlan_vlan(&self) -> Option<VxlanVlanPair> {
        match self {
            ResourceValue::VxlanVlan(p) => Some(*p),
            _ => None,
        }
    }

    pub fn subnet(&self) -> Option<SubnetIpLenPair> {
        match self {
            ResourceValue::Subnet(p) => Some(*p),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Resource: Send + Sync {
    fn description(&self) -> &'static str;

    fn id(&self) -> &str;

    /// Persists the pool definition and seeds the free set from it.
    async fn init(&self, cfg: ResourceConfig) -> Result<()>;

    /// Replaces the pool definition while keeping every allocated value
    /// allocated.
    async fn reinit(&self, cfg: ResourceConfig) -> Result<()>;

    async fn deinit(&self) -> Result<()>;

    /// Takes `req` when non-zero, else the lowest free value.
    async fn allocate(&self, req: u32) -> Result<ResourceValue>;

    /// Returns a value to the free set. Freeing a free value is a no-op.
    async fn deallocate(&self, value: ResourceValue) -> Result<()>;

    /// Number of allocated values and their compressed range string.
    async fn get_list(&self) -> Result<(usize, String)>;
}

/// Static table of the allocator kinds this crate knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Vlan,
    Vxlan,
    Subnet,
    Epg,
}

impl ResourceKind {
    pub fn from_description(desc: &str) -> Option<Self> {
        match desc {
            AUTO_VLAN => Some(ResourceKind::Vlan),
            AUTO_VXLAN => Some(ResourceKind::Vxlan),
            AUTO_SUBNET => Some(ResourceKind::Subnet),
            AUTO_EPG => Some(ResourceKind::Epg),
            _ => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ResourceKind::Vlan => AUTO_VLAN,
            ResourceKind::Vxlan => AUTO_VXLAN,
            ResourceKind::Subnet => AUTO_SUBNET,
            ResourceKind::Epg => AUTO_EPG,
        }
    }

    /// Builds the typed allocator bound to `id`.
    pub fn build(self, driver: Arc<dyn StateDriver>, id: &str) -> Box<dyn Resource> {
        match self {
            ResourceKind::Vlan => Box::new(TagResource::vlan(driver, id)),
            ResourceKind::Epg => Box::new(TagResource::epg(driver, id)),
            ResourceKind::Vxlan => Box::new(VxlanResource::new(driver, id)),
            ResourceKind::Subnet => Box::new(SubnetResource::new(driver, id)),
        }
    }
}

/// Config-record prefix for a resource kind.
pub fn cfg_prefix(desc: &str) -> String {
    format!("{}{desc}/", crate::state::STATE_CONFIG_PATH)
}

pub(crate) fn cfg_key(desc: &str, id: &str) -> String {
    format!("{}{id}", cfg_prefix(desc))
}

pub(crate) fn oper_key(desc: &str, id: &str) -> String {
    format!("{}{desc}/{id}", crate::state::STATE_OPER_PATH)
}
