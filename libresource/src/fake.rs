use std::collections::BTreeMap;

use async_trait::async_trait;
use log::debug;
use tokio::sync::RwLock;

use crate::error::StateError;
use crate::state::StateDriver;

/// In-memory state driver. Keys are kept ordered so prefix scans are
/// deterministic.
#[derive(Default)]
pub struct FakeStateDriver {
    store: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl FakeStateDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.store.read().await.keys().cloned().collect()
    }

    pub async fn dump(&self) {
        for (k, v) in self.store.read().await.iter() {
            debug!("{k} => {}", String::from_utf8_lossy(v));
        }
    }
}

#[async_trait]
impl StateDriver for FakeStateDriver {
    async fn write(&self, key: &str, value: Vec<u8>) -> Result<(), StateError> {
        self.store.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, StateError> {
        self.store
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StateError::KeyNotFound(key.to_string()))
    }

    async fn read_all(&self, prefix: &str) -> Result<Vec<Vec<u8>>, StateError> {
        let store = self.store.read().await;
        let values: Vec<Vec<u8>> = store
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect();
        if values.is_empty() {
            return Err(StateError::KeyNotFound(prefix.to_string()));
        }
        Ok(values)
    }

    async fn clear(&self, key: &str) -> Result<(), StateError> {
        self.store.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Rec {
        id: String,
        n: u32,
    }

    #[tokio::test]
    async fn read_write_clear() {
        let d: Arc<dyn StateDriver> = Arc::new(FakeStateDriver::new());
        let r = Rec {
            id: "a".into(),
            n: 3,
        };
        d.write_state("/x/a", &r).await.unwrap();
        let back: Rec = d.read_state("/x/a").await.unwrap();
        assert_eq!(back, r);

        d.clear_state("/x/a").await.unwrap();
        let err = d.read_state::<Rec>("/x/a").await.unwrap_err();
        assert!(err.is_key_not_found());
        assert!(d.try_read_state::<Rec>("/x/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prefix_scan_stops_at_prefix_boundary() {
        let d: Arc<dyn StateDriver> = Arc::new(FakeStateDriver::new());
        for (k, n) in [("/p/a", 1), ("/p/b", 2), ("/q/c", 3)] {
            d.write_state(k, &Rec { id: k.into(), n }).await.unwrap();
        }
        let all: Vec<Rec> = d.read_all_state("/p/").await.unwrap();
        assert_eq!(all.len(), 2);

        assert!(d.read_all("/none/").await.unwrap_err().is_key_not_found());
        let empty: Vec<Rec> = d.list_state("/none/").await.unwrap();
        assert!(empty.is_empty());
    }
}
