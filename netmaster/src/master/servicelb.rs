//! Load-balanced services and the containers providing them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use libresource::StateDriver;
use log::{error, info, warn};
use tokio::sync::Mutex;

use super::NetMaster;
use super::api::{SvcProviderUpdateRequest, UpdateEndpointRequest, UpdateEndpointResponse};
use super::endpoint::get_ep_name;
use super::network::network_id;
use crate::intent::{ConfigEP, ServiceLbConfig};
use crate::mastercfg::{
    EndpointGroupState, EndpointState, NetworkState, Provider, ServiceLbState, SvcProviderState,
    clear_record, endpoint_group_key, list_records, read_record, service_key, try_read_record,
    write_record,
};

#[derive(Debug, Default)]
struct SvcDb {
    // keyed by service id
    services: HashMap<String, ServiceLbState>,
    // keyed by container id
    providers: HashMap<String, Provider>,
}

/// Leader-side copy of the service and provider records. Both maps sit
/// behind one lock so a provider never points at a service mid-update.
#[derive(Default)]
pub struct ServiceCache {
    db: Mutex<SvcDb>,
}

impl ServiceCache {
    /// Reloads services, their providers, and providers derivable from
    /// labelled endpoints.
    pub async fn restore(&self, driver: &Arc<dyn StateDriver>) -> Result<()> {
        info!("Restoring ProviderDb and ServiceDB cache");
        let mut db = self.db.lock().await;
        db.services.clear();
        db.providers.clear();

        for svc in list_records::<ServiceLbState>(driver).await? {
            for provider in svc.providers.values() {
                db.providers
                    .insert(provider.container_id.clone(), provider.clone());
            }
            db.services.insert(svc.id.clone(), svc);
        }

        for ep in list_records::<EndpointState>(driver).await? {
            if ep.labels.is_empty() || db.providers.contains_key(&ep.container_id) {
                continue;
            }
            let Some((network, tenant)) = ep.net_id.split_once('.') else {
                warn!("endpoint {} has malformed network id {}", ep.id, ep.net_id);
                continue;
            };
            let provider = Provider {
                ip_address: ep.ip_address.clone(),
                container_id: ep.container_id.clone(),
                labels: ep.labels.clone(),
                tenant: tenant.to_string(),
                network: network.to_string(),
                ep_id_key: ep.id.clone(),
                ..Default::default()
            };
            db.providers.insert(ep.container_id, provider);
        }
        Ok(())
    }

    pub async fn service(&self, id: &str) -> Option<ServiceLbState> {
        self.db.lock().await.services.get(id).cloned()
    }

    pub async fn services(&self) -> Vec<ServiceLbState> {
        let mut all: Vec<_> = self.db.lock().await.services.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn provider(&self, container_id: &str) -> Option<Provider> {
        self.db.lock().await.providers.get(container_id).cloned()
    }
}

/// Publishes the provider addresses of a service, or removes the record
/// once the service is gone.
async fn svc_provider_update(
    driver: &Arc<dyn StateDriver>,
    db: &SvcDb,
    service_id: &str,
    is_delete: bool,
) -> Result<()> {
    if is_delete {
        clear_record::<SvcProviderState>(driver, service_id).await?;
        return Ok(());
    }
    let Some(svc) = db.services.get(service_id) else {
        bail!("service {service_id} not found");
    };
    let record = SvcProviderState {
        id: service_id.to_string(),
        service_name: svc.service_name.clone(),
        providers: svc.providers.keys().cloned().collect(),
    };
    write_record(driver, &record).await?;
    Ok(())
}

impl NetMaster {
    /// Creates or replaces a service. An unchanged definition is a no-op; a
    /// changed one keeps its address.
    pub async fn create_service_lb(&self, cfg: &ServiceLbConfig) -> Result<()> {
        info!("Received Create Service Load Balancer config {cfg:?}");
        let _guard = self.addr_guard().await;
        let driver = self.driver();
        let mut db = self.services().db.lock().await;

        let id = service_key(&cfg.service_name, &cfg.tenant);
        let mut service_ip = cfg.ip_address.clone();
        if let Some(old) = db.services.get(&id) {
            if old.ports == cfg.ports
                && old.selectors == cfg.selectors
                && old.tenant == cfg.tenant
            {
                return Ok(());
            }
            service_ip = old.ip_address.clone();
            let (name, tenant) = (old.service_name.clone(), old.tenant.clone());
            if let Err(e) = self.delete_service_locked(&mut db, &name, &tenant).await {
                error!("Error removing old definition of {id}: {e}");
            }
        }

        let net_id = network_id(&cfg.network, &cfg.tenant);
        let mut nw: NetworkState = read_record(driver, &net_id).await.inspect_err(|_| {
            error!(
                "network {} on tenant {} is not created {net_id}",
                cfg.network, cfg.tenant
            )
        })?;
        let ip_address = self
            .network_alloc_address(&mut nw, &service_ip)
            .await
            .inspect_err(|e| error!("Failed to allocate address. Err: {e}"))?;

        let mut state = ServiceLbState {
            id: id.clone(),
            service_name: cfg.service_name.clone(),
            tenant: cfg.tenant.clone(),
            network: cfg.network.clone(),
            ports: cfg.ports.clone(),
            selectors: cfg.selectors.clone(),
            ip_address,
            ..Default::default()
        };
        for provider in db.providers.values_mut() {
            if provider.tenant == state.tenant && state.selects(&provider.labels) {
                provider.services.push(id.clone());
                state
                    .providers
                    .insert(provider.ip_address.clone(), provider.clone());
            }
        }

        write_record(driver, &state).await?;
        let has_providers = !state.providers.is_empty();
        db.services.insert(id.clone(), state);
        if has_providers {
            svc_provider_update(driver, &db, &id, false)
                .await
                .inspect_err(|e| error!("Error updating Provider for service {id} : {e}"))?;
        }
        Ok(())
    }

    pub async fn delete_service_lb(&self, service_name: &str, tenant: &str) -> Result<()> {
        info!("Received Delete Service Load Balancer {service_name} on {tenant}");
        let _guard = self.addr_guard().await;
        let mut db = self.services().db.lock().await;
        self.delete_service_locked(&mut db, service_name, tenant).await
    }

    async fn delete_service_locked(
        &self,
        db: &mut SvcDb,
        service_name: &str,
        tenant: &str,
    ) -> Result<()> {
        let driver = self.driver();
        let id = service_key(service_name, tenant);
        let state: ServiceLbState = read_record(driver, &id).await.inspect_err(|_| {
            error!("Error reading service lb config for service {service_name} in tenant {tenant}")
        })?;

        let net_id = network_id(&state.network, &state.tenant);
        let mut nw: NetworkState = read_record(driver, &net_id).await.inspect_err(|_| {
            error!("network {net_id} is not operational. Service object deletion failed")
        })?;
        match NetMaster::network_release_address(&mut nw, &state.ip_address) {
            Ok(()) => write_record(driver, &nw).await?,
            Err(e) => error!("Network release address failed {e}"),
        }

        if let Some(svc) = db.services.remove(&id) {
            for provider in svc.providers.values() {
                if let Some(p) = db.providers.get_mut(&provider.container_id) {
                    p.services.retain(|s| s != &id);
                }
            }
        }
        if let Err(e) = svc_provider_update(driver, db, &id, true).await {
            error!("Error clearing providers of {id}: {e}");
        }

        clear_record::<ServiceLbState>(driver, &id).await.inspect_err(|_| {
            error!("Error deleting service lb config for service {service_name} in tenant {tenant}")
        })?;
        Ok(())
    }

    /// Rewrites the provider record of a service from the cache and returns it.
    pub async fn svc_provider_refresh(
        &self,
        req: &SvcProviderUpdateRequest,
    ) -> Result<SvcProviderState> {
        info!("Received SvcProviderUpdateRequest {req:?}");
        let driver = self.driver();
        let db = self.services().db.lock().await;
        let id = service_key(&req.service_name, &req.tenant);
        svc_provider_update(driver, &db, &id, false).await?;
        Ok(read_record(driver, &id).await?)
    }

    /// Container start/stop notification. A started container becomes a
    /// provider of every service whose selectors its labels satisfy; a
    /// stopped one is removed from the services it provided.
    pub async fn update_endpoint(
        &self,
        req: &UpdateEndpointRequest,
    ) -> Result<UpdateEndpointResponse> {
        info!("Received EndpointUpdateRequest {req:?}");
        match req.event.as_str() {
            "start" => self.provider_started(req).await?,
            "die" => self.provider_died(req).await?,
            other => warn!("ignoring endpoint event {other:?}"),
        }
        Ok(UpdateEndpointResponse {
            ip_address: req.ip_address.clone(),
        })
    }

    async fn provider_started(&self, req: &UpdateEndpointRequest) -> Result<()> {
        let driver = self.driver();
        // the network name may be an endpoint group
        let mut net_id = network_id(&req.network, &req.tenant);
        if try_read_record::<NetworkState>(driver, &net_id).await?.is_none() {
            let epg: EndpointGroupState =
                read_record(driver, &endpoint_group_key(&req.network, &req.tenant)).await?;
            net_id = network_id(&epg.network_name, &req.tenant);
        }

        let ep_id = get_ep_name(
            &net_id,
            &ConfigEP {
                container: req.endpoint_id.clone(),
                ..Default::default()
            },
        );
        let mut ep: EndpointState = read_record(driver, &ep_id).await?;
        ep.labels
            .extend(req.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        ep.container_id = req.container_id.clone();
        ep.ep_common_name = req.ep_common_name.clone();
        write_record(driver, &ep)
            .await
            .inspect_err(|e| error!("error writing ep config. Error: {e}"))?;

        let mut provider = Provider {
            ip_address: req.ip_address.clone(),
            container_id: req.container_id.clone(),
            labels: req.labels.clone(),
            tenant: req.tenant.clone(),
            network: req.network.clone(),
            ep_id_key: ep.id.clone(),
            ..Default::default()
        };
        if provider.ip_address.is_empty() || provider.container_id.is_empty() {
            bail!("invalid ProviderID from providerInfo:{{{provider:?}}}");
        }

        let mut db = self.services().db.lock().await;
        let matching: Vec<String> = db
            .services
            .values()
            .filter(|svc| svc.tenant == req.tenant && svc.selects(&req.labels))
            .map(|svc| svc.id.clone())
            .collect();
        provider.services = matching.clone();
        db.providers
            .insert(provider.container_id.clone(), provider.clone());

        for service_id in matching {
            if let Some(svc) = db.services.get_mut(&service_id) {
                svc.providers
                    .insert(provider.ip_address.clone(), provider.clone());
            }
            let mut state: ServiceLbState = read_record(driver, &service_id).await?;
            state
                .providers
                .insert(provider.ip_address.clone(), provider.clone());
            write_record(driver, &state).await?;
            if let Err(e) = svc_provider_update(driver, &db, &service_id, false).await {
                error!("Error updating Provider for service {service_id} : {e}");
            }
        }
        Ok(())
    }

    async fn provider_died(&self, req: &UpdateEndpointRequest) -> Result<()> {
        if req.container_id.is_empty() {
            bail!("invalid containerID in UpdateEndpointRequest:(nil)");
        }
        let driver = self.driver();
        let mut db = self.services().db.lock().await;
        let Some(provider) = db.providers.remove(&req.container_id) else {
            // not a provider
            return Ok(());
        };

        for service_id in &provider.services {
            let removed = db
                .services
                .get_mut(service_id)
                .and_then(|svc| svc.providers.remove(&provider.ip_address));
            if removed.is_none() {
                continue;
            }
            let mut state: ServiceLbState = read_record(driver, service_id).await?;
            state.providers.remove(&provider.ip_address);
            write_record(driver, &state).await?;
            if let Err(e) = svc_provider_update(driver, &db, service_id, false).await {
                error!("Error updating Provider for service {service_id} : {e}");
            }
        }
        Ok(())
    }
}
