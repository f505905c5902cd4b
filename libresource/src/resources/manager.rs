use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info};
use serde::Deserialize;

use super::{Resource, ResourceConfig, ResourceKind, ResourceValue, cfg_prefix};
use crate::error::{ResourceError, Result};
use crate::state::StateDriver;

static MANAGER_LIVE: AtomicBool = AtomicBool::new(false);

#[derive(Deserialize)]
struct CfgHeader {
    id: String,
}

/// Registry of persisted allocators. At most one manager lives in a
/// process; create it with [`StateResourceManager::new`] and hand it to
/// whoever allocates.
pub struct StateResourceManager {
    driver: Arc<dyn StateDriver>,
    armed: bool,
}

impl StateResourceManager {
    pub fn new(driver: Arc<dyn StateDriver>) -> Result<Self> {
        if MANAGER_LIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ResourceError::SingletonExists);
        }
        Ok(Self {
            driver,
            armed: true,
        })
    }

    /// Tears the manager down so a new one can be created.
    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        if MANAGER_LIVE.swap(false, Ordering::AcqRel) {
            Ok(())
        } else {
            Err(ResourceError::SingletonMissing)
        }
    }

    pub fn driver(&self) -> Arc<dyn StateDriver> {
        Arc::clone(&self.driver)
    }

    /// Resolves `desc` to its allocator and reports whether a Cfg record
    /// for `id` is already persisted.
    async fn find_resource(&self, id: &str, desc: &str) -> Result<(Box<dyn Resource>, bool)> {
        let kind = ResourceKind::from_description(desc)
            .ok_or_else(|| ResourceError::UnknownKind(desc.to_string()))?;
        let defined: Vec<CfgHeader> = self.driver.list_state(&cfg_prefix(desc)).await?;
        let found = defined.iter().any(|h| h.id == id);
        Ok((kind.build(self.driver(), id), found))
    }

    fn not_found(id: &str, desc: &str) -> ResourceError {
        ResourceError::NotFound {
            desc: desc.to_string(),
            id: id.to_string(),
        }
    }

    // TODO: allocation mutations assume a single writer; wrap them in a
    // store transaction once the etcd driver exposes one.
    pub async fn define_resource(&self, id: &str, desc: &str, cfg: ResourceConfig) -> Result<()> {
        let (rsrc, found) = self.find_resource(id, desc).await?;
        if found {
            return Err(ResourceError::AlreadyExists(id.to_string()));
        }
        rsrc.init(cfg).await?;
        info!("defined resource {desc}/{id}");
        Ok(())
    }

    pub async fn undefine_resource(&self, id: &str, desc: &str) -> Result<()> {
        let (rsrc, found) = self.find_resource(id, desc).await?;
        if !found {
            return Err(Self::not_found(id, desc));
        }
        rsrc.deinit().await?;
        info!("undefined resource {desc}/{id}");
        Ok(())
    }

    pub async fn redefine_resource(&self, id: &str, desc: &str, cfg: ResourceConfig) -> Result<()> {
        let (rsrc, found) = self.find_resource(id, desc).await?;
        if !found {
            return Err(Self::not_found(id, desc));
        }
        rsrc.reinit(cfg).await
    }

    /// `(count, "a-b, c")` of allocated values; `(0, "")` when the resource
    /// cannot be read.
    pub async fn get_resource_list(&self, id: &str, desc: &str) -> (usize, String) {
        let rsrc = match self.find_resource(id, desc).await {
            Ok((rsrc, true)) => rsrc,
            Ok((_, false)) => {
                error!("unable to find resource {id} desc {desc}");
                return (0, String::new());
            }
            Err(e) => {
                error!("unable to find resource {id} desc {desc}: {e}");
                return (0, String::new());
            }
        };
        match rsrc.get_list().await {
            Ok(list) => list,
            Err(e) => {
                error!("error reading resource {id}: {e}");
                (0, String::new())
            }
        }
    }

    pub async fn allocate_resource_val(
        &self,
        id: &str,
        desc: &str,
        req: u32,
    ) -> Result<ResourceValue> {
        let (rsrc, found) = self.find_resource(id, desc).await?;
        if !found {
            return Err(Self::not_found(id, desc));
        }
        rsrc.allocate(req).await
    }

    pub async fn deallocate_resource_val(
        &self,
        id: &str,
        desc: &str,
        value: ResourceValue,
    ) -> Result<()> {
        let (rsrc, found) = self.find_resource(id, desc).await?;
        if !found {
            return Err(Self::not_found(id, desc));
        }
        rsrc.deallocate(value).await
    }
}

impl Drop for StateResourceManager {
    fn drop(&mut self) {
        if self.armed {
            MANAGER_LIVE.store(false, Ordering::Release);
        }
    }
}
