use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StateError;

/// Root of every key written by the control plane.
pub const STATE_BASE_PATH: &str = "/contiv.io/";
/// Prefix for configuration (desired) records.
pub const STATE_CONFIG_PATH: &str = "/contiv.io/state/";
/// Prefix for operational (derived) records.
pub const STATE_OPER_PATH: &str = "/contiv.io/oper/";

/// Byte-level persistence boundary. Any KV store that can read, write,
/// list by prefix and delete can back the control plane.
///
/// `read` returns [`StateError::KeyNotFound`] for an absent key and
/// `read_all` returns it when nothing lives under the prefix.
#[async_trait]
pub trait StateDriver: Send + Sync {
    async fn write(&self, key: &str, value: Vec<u8>) -> Result<(), StateError>;

    async fn read(&self, key: &str) -> Result<Vec<u8>, StateError>;

    async fn read_all(&self, prefix: &str) -> Result<Vec<Vec<u8>>, StateError>;

    async fn clear(&self, key: &str) -> Result<(), StateError>;
}

impl<'a> dyn StateDriver + 'a {
    pub async fn write_state<T>(&self, key: &str, value: &T) -> Result<(), StateError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let bytes = serde_json::to_vec(value)?;
        self.write(key, bytes).await
    }

    pub async fn read_state<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        let bytes = self.read(key).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Like [`read_state`](Self::read_state) but maps a missing key to `None`.
    pub async fn try_read_state<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StateError> {
        match self.read_state(key).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_key_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn read_all_state<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<T>, StateError> {
        let values = self.read_all(prefix).await?;
        values
            .iter()
            .map(|v| serde_json::from_slice(v).map_err(StateError::from))
            .collect()
    }

    /// Lists every record under `prefix`; an empty prefix is an empty list.
    pub async fn list_state<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<T>, StateError> {
        match self.read_all_state(prefix).await {
            Ok(v) => Ok(v),
            Err(e) if e.is_key_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn clear_state(&self, key: &str) -> Result<(), StateError> {
        self.clear(key).await
    }
}
