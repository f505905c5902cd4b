//! These need an etcd listening on 127.0.0.1:2379.

mod common;

use std::sync::Arc;
use std::time::Duration;

use libresource::StateDriver;
use netmaster::mastercfg::{HostState, list_records, read_record, write_record};
use netmaster::objdb::{
    self, EtcdLock, EtcdServiceRegistry, EtcdStateDriver, LeaderLock, LockEvent, ServiceInfo,
    ServiceRegistry,
};
use tokio::sync::Mutex;
use tokio::time::timeout;

use common::{fixture_config, init_logging};

async fn client() -> Arc<Mutex<etcd_client::Client>> {
    let cfg = fixture_config();
    Arc::new(Mutex::new(objdb::etcd::connect(&cfg.store).await.unwrap()))
}

#[tokio::test]
#[ignore]
async fn etcd_driver_round_trip() {
    init_logging();
    let driver: Arc<dyn StateDriver> = Arc::new(EtcdStateDriver::new(client().await));
    let host = HostState {
        id: "it-host1".into(),
        intf: "eth2".into(),
        vtep_ip: "10.0.0.9".into(),
        ..Default::default()
    };
    write_record(&driver, &host).await.unwrap();
    let back: HostState = read_record(&driver, "it-host1").await.unwrap();
    assert_eq!(back, host);
    let all: Vec<HostState> = list_records(&driver).await.unwrap();
    assert!(all.iter().any(|h| h.id == "it-host1"));

    driver.clear("/contiv.io/state/hosts/it-host1").await.unwrap();
    let err = driver
        .read_state::<HostState>("/contiv.io/state/hosts/it-host1")
        .await
        .unwrap_err();
    assert!(err.is_key_not_found());
}

#[tokio::test]
#[ignore]
async fn etcd_lock_is_exclusive() {
    init_logging();
    let c = client().await;
    let a = EtcdLock::new(Arc::clone(&c), "it-leader", "10.0.0.1:9999", 10);
    let b = EtcdLock::new(c, "it-leader", "10.0.0.2:9999", 10);
    let mut a_events = a.take_events().await.unwrap();
    let mut b_events = b.take_events().await.unwrap();

    a.acquire(Duration::ZERO).await.unwrap();
    let ev = timeout(Duration::from_secs(5), a_events.recv()).await.unwrap();
    assert_eq!(ev, Some(LockEvent::Acquired));
    assert_eq!(b.get_holder().await.unwrap().as_deref(), Some("10.0.0.1:9999"));

    b.acquire(Duration::from_secs(1)).await.unwrap();
    let ev = timeout(Duration::from_secs(5), b_events.recv()).await.unwrap();
    assert_eq!(ev, Some(LockEvent::AcquireTimeout));

    a.release().await.unwrap();
    b.release().await.unwrap();
    assert!(b.get_holder().await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn etcd_lock_reports_lost_key() {
    init_logging();
    let c = client().await;
    let lock = EtcdLock::new(Arc::clone(&c), "it-lost", "10.0.0.1:9999", 30);
    let mut events = lock.take_events().await.unwrap();
    lock.acquire(Duration::ZERO).await.unwrap();
    let ev = timeout(Duration::from_secs(5), events.recv()).await.unwrap();
    assert_eq!(ev, Some(LockEvent::Acquired));

    c.lock()
        .await
        .delete("/contiv.io/lock/it-lost", None)
        .await
        .unwrap();
    let ev = timeout(Duration::from_secs(5), events.recv()).await.unwrap();
    assert_eq!(ev, Some(LockEvent::Lost));
    lock.release().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn etcd_registry_lists_by_name() {
    init_logging();
    let registry = EtcdServiceRegistry::new(client().await);
    let info = ServiceInfo {
        service_name: "it-netmaster".into(),
        ttl: 10,
        host_addr: "10.0.0.1".into(),
        port: 9999,
        role: "leader".into(),
    };
    registry.register_service(info.clone()).await.unwrap();
    let found = registry.get_service("it-netmaster").await.unwrap();
    assert_eq!(found, vec![info.clone()]);
    registry.deregister_service(&info).await.unwrap();
    assert!(registry.get_service("it-netmaster").await.unwrap().is_empty());
}
