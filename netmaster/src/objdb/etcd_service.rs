use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, GetOptions, PutOptions};
use log::{error, info, warn};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::{ObjdbError, SERVICE_PREFIX, ServiceInfo, ServiceRegistry};

struct Registration {
    lease_id: i64,
    stop: CancellationToken,
}

/// Service instances kept under a lease per registration and refreshed
/// until deregistered or the process exits.
pub struct EtcdServiceRegistry {
    client: Arc<Mutex<Client>>,
    registrations: Mutex<HashMap<String, Registration>>,
}

impl EtcdServiceRegistry {
    pub fn new(client: Arc<Mutex<Client>>) -> Self {
        Self {
            client,
            registrations: Mutex::new(HashMap::new()),
        }
    }

    async fn cli(&self) -> tokio::sync::MutexGuard<'_, Client> {
        self.client.lock().await
    }

    fn spawn_refresh(
        client: Arc<Mutex<Client>>,
        key: String,
        lease_id: i64,
        ttl: u64,
    ) -> CancellationToken {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let interval = Duration::from_secs((ttl / 3).max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = sleep(interval) => {
                        let res = client.lock().await.lease_keep_alive(lease_id).await;
                        match res {
                            Ok((mut keeper, mut stream)) => {
                                if let Err(e) = keeper.keep_alive().await {
                                    warn!("service {key}: refresh failed: {e}");
                                    continue;
                                }
                                if let Ok(Some(resp)) = stream.message().await {
                                    if resp.ttl() <= 0 {
                                        error!("service {key}: lease expired");
                                        return;
                                    }
                                }
                            }
                            Err(e) => warn!("service {key}: refresh failed: {e}"),
                        }
                    }
                }
            }
        });
        stop
    }
}

#[async_trait]
impl ServiceRegistry for EtcdServiceRegistry {
    async fn register_service(&self, info: ServiceInfo) -> Result<(), ObjdbError> {
        let key = info.key();
        let value = serde_json::to_vec(&info)?;

        let lease_id = self
            .cli()
            .await
            .lease_grant(info.ttl.max(1) as i64, None)
            .await?
            .id();
        let put = self
            .cli()
            .await
            .put(key.as_str(), value, Some(PutOptions::new().with_lease(lease_id)))
            .await;
        if let Err(e) = put {
            let _ = self.cli().await.lease_revoke(lease_id).await;
            return Err(e.into());
        }

        let stop =
            Self::spawn_refresh(Arc::clone(&self.client), key.clone(), lease_id, info.ttl);
        let previous = self
            .registrations
            .lock()
            .await
            .insert(key.clone(), Registration { lease_id, stop });
        if let Some(prev) = previous {
            prev.stop.cancel();
            let _ = self.cli().await.lease_revoke(prev.lease_id).await;
        }
        info!("registered service {key}");
        Ok(())
    }

    async fn deregister_service(&self, info: &ServiceInfo) -> Result<(), ObjdbError> {
        let key = info.key();
        if let Some(reg) = self.registrations.lock().await.remove(&key) {
            reg.stop.cancel();
            self.cli().await.lease_revoke(reg.lease_id).await?;
        }
        self.cli().await.delete(key.as_str(), None).await?;
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInfo>, ObjdbError> {
        let prefix = format!("{SERVICE_PREFIX}{name}/");
        let resp = self
            .cli()
            .await
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let mut out = Vec::new();
        for kv in resp.kvs() {
            match serde_json::from_slice::<ServiceInfo>(kv.value()) {
                Ok(info) => out.push(info),
                Err(e) => warn!("ignoring bad service record: {e}"),
            }
        }
        Ok(out)
    }
}
