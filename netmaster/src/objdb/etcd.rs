use std::sync::Arc;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions};
use libresource::{StateDriver, StateError};
use log::info;
use tokio::sync::Mutex;

use super::ObjdbError;
use crate::config::StoreConfig;

pub async fn connect(cfg: &StoreConfig) -> Result<Client, ObjdbError> {
    let opts = if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        ConnectOptions::default().with_user(user.clone(), pass.clone())
    } else {
        ConnectOptions::default()
    };
    let cli = Client::connect(cfg.endpoints.clone(), Some(opts)).await?;
    info!("connected to etcd at {:?}", cfg.endpoints);
    Ok(cli)
}

fn etcd_err(e: etcd_client::Error) -> StateError {
    StateError::Etcd(e.to_string())
}

/// [`StateDriver`] over an etcd v3 keyspace.
pub struct EtcdStateDriver {
    client: Arc<Mutex<Client>>,
}

impl EtcdStateDriver {
    pub fn new(client: Arc<Mutex<Client>>) -> Self {
        Self { client }
    }

    async fn cli(&self) -> tokio::sync::MutexGuard<'_, Client> {
        self.client.lock().await
    }
}

#[async_trait]
impl StateDriver for EtcdStateDriver {
    async fn write(&self, key: &str, value: Vec<u8>) -> Result<(), StateError> {
        self.cli().await.put(key, value, None).await.map_err(etcd_err)?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, StateError> {
        let resp = self.cli().await.get(key, None).await.map_err(etcd_err)?;
        match resp.kvs().first() {
            Some(kv) => Ok(kv.value().to_vec()),
            None => Err(StateError::KeyNotFound(key.to_string())),
        }
    }

    async fn read_all(&self, prefix: &str) -> Result<Vec<Vec<u8>>, StateError> {
        let opts = GetOptions::new().with_prefix();
        let resp = self
            .cli()
            .await
            .get(prefix, Some(opts))
            .await
            .map_err(etcd_err)?;
        if resp.kvs().is_empty() {
            return Err(StateError::KeyNotFound(prefix.to_string()));
        }
        Ok(resp.kvs().iter().map(|kv| kv.value().to_vec()).collect())
    }

    async fn clear(&self, key: &str) -> Result<(), StateError> {
        self.cli().await.delete(key, None).await.map_err(etcd_err)?;
        Ok(())
    }
}
