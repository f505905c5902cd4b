//! Lifecycle of tenants, networks, endpoints and the groups, policies and
//! services layered on top of them.
//!
//! Every operation hangs off [`NetMaster`], which owns the state driver,
//! the resource manager and the leader-side caches. Operations are
//! synchronous request/response against the store; a failure midway
//! returns the first error and leaves earlier steps in place.

use std::sync::Arc;

use anyhow::{Context, Result};
use libresource::{StateDriver, StateResourceManager};
use log::info;
use tokio::sync::{Mutex, MutexGuard};

use crate::gstate;

pub mod api;
pub mod apply;
pub mod endpoint;
pub mod epg;
pub mod host;
pub mod network;
pub mod policy;
pub mod servicelb;
pub mod tenant;

pub use api::{
    AddressAllocRequest, AddressAllocResponse, AddressReleaseRequest, CreateEndpointRequest,
    CreateEndpointResponse, DeleteEndpointRequest, DeleteEndpointResponse, SvcProviderUpdateRequest,
    UpdateEndpointRequest, UpdateEndpointResponse,
};
pub use endpoint::get_ep_name;
pub use network::network_id;
pub use policy::{PolicyError, PolicyManager};
pub use servicelb::ServiceCache;

pub struct NetMaster {
    driver: Arc<dyn StateDriver>,
    rm: Arc<StateResourceManager>,
    // serializes address allocation and endpoint create/delete
    addr_lock: Mutex<()>,
    policy: PolicyManager,
    services: ServiceCache,
}

impl NetMaster {
    pub fn new(rm: Arc<StateResourceManager>) -> Self {
        let driver = rm.driver();
        Self {
            policy: PolicyManager::new(Arc::clone(&driver)),
            services: ServiceCache::default(),
            driver,
            rm,
            addr_lock: Mutex::new(()),
        }
    }

    pub fn driver(&self) -> &Arc<dyn StateDriver> {
        &self.driver
    }

    pub fn resource_manager(&self) -> &StateResourceManager {
        &self.rm
    }

    pub fn policy(&self) -> &PolicyManager {
        &self.policy
    }

    pub fn services(&self) -> &ServiceCache {
        &self.services
    }

    pub(crate) async fn addr_guard(&self) -> MutexGuard<'_, ()> {
        self.addr_lock.lock().await
    }

    /// Reloads the leader-side caches from the store.
    pub async fn restore(&self) -> Result<()> {
        info!("Restoring epg policies and service/provider caches");
        self.policy.restore().await?;
        self.services.restore(&self.driver).await?;
        Ok(())
    }

    pub(crate) async fn tenant_cfg(&self, tenant: &str) -> Result<gstate::Cfg> {
        gstate::Cfg::read(&self.driver, tenant)
            .await
            .with_context(|| format!("error reading tenant cfg state for {tenant}"))
    }
}
