//! Cluster-store plumbing: the etcd-backed state driver, leader lock and
//! service registry, plus in-memory stand-ins used by tests.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Receiver;

pub mod etcd;
pub mod etcd_lock;
pub mod etcd_service;
pub mod fake;

pub use etcd::EtcdStateDriver;
pub use etcd_lock::EtcdLock;
pub use etcd_service::EtcdServiceRegistry;
pub use fake::{FakeLock, FakeServiceRegistry};

pub const LOCK_PREFIX: &str = "/contiv.io/lock/";
pub const SERVICE_PREFIX: &str = "/contiv.io/service/";

#[derive(Debug, thiserror::Error)]
pub enum ObjdbError {
    #[error("lock {0} is already being acquired")]
    AlreadyAcquiring(String),
    #[error("lock event channel already taken")]
    EventsTaken,
    #[error(transparent)]
    Etcd(#[from] Box<etcd_client::Error>),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<etcd_client::Error> for ObjdbError {
    fn from(e: etcd_client::Error) -> Self {
        ObjdbError::Etcd(Box::new(e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    Acquired,
    Lost,
    AcquireTimeout,
}

/// Distributed mutual exclusion with an event channel. `acquire` returns
/// immediately; the outcome arrives as a [`LockEvent`].
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Value written into the lock key while this node holds it.
    fn holder_id(&self) -> &str;

    /// Starts contending. A zero timeout waits forever.
    async fn acquire(&self, timeout: Duration) -> Result<(), ObjdbError>;

    async fn release(&self) -> Result<(), ObjdbError>;

    /// Current holder read from the store, `None` when nobody holds it.
    async fn get_holder(&self) -> Result<Option<String>, ObjdbError>;

    /// Hands out the event receiver. Only the first caller gets it.
    async fn take_events(&self) -> Result<Receiver<LockEvent>, ObjdbError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub service_name: String,
    pub ttl: u64,
    pub host_addr: String,
    pub port: u16,
    #[serde(default)]
    pub role: String,
}

impl ServiceInfo {
    pub fn key(&self) -> String {
        format!(
            "{SERVICE_PREFIX}{}/{}:{}",
            self.service_name, self.host_addr, self.port
        )
    }
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Publishes the instance; it stays visible while this process refreshes it.
    async fn register_service(&self, info: ServiceInfo) -> Result<(), ObjdbError>;

    async fn deregister_service(&self, info: &ServiceInfo) -> Result<(), ObjdbError>;

    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInfo>, ObjdbError>;
}

/// Splits `host:port`, accepting a bare `:port` as the wildcard address.
pub fn split_host_port(url: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = url
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("invalid address {url:?}, expected host:port"))?;
    let port: u16 = port
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid port in {url:?}: {e}"))?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_key_layout() {
        let info = ServiceInfo {
            service_name: "netmaster".into(),
            ttl: 10,
            host_addr: "10.0.0.1".into(),
            port: 9999,
            role: "leader".into(),
        };
        assert_eq!(info.key(), "/contiv.io/service/netmaster/10.0.0.1:9999");
    }

    #[test]
    fn host_port_parsing() {
        assert_eq!(
            split_host_port(":9999").unwrap(),
            ("0.0.0.0".to_string(), 9999)
        );
        assert_eq!(
            split_host_port("10.1.1.1:80").unwrap(),
            ("10.1.1.1".to_string(), 80)
        );
        assert!(split_host_port("10.1.1.1").is_err());
        assert!(split_host_port("10.1.1.1:http").is_err());
    }
}
