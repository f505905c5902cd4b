use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, Receiver, Sender};

use super::{LeaderLock, LockEvent, ObjdbError, ServiceInfo, ServiceRegistry};

/// Lock whose events are driven by the caller. Injecting `Acquired` makes
/// this node the holder, `Lost` clears it.
pub struct FakeLock {
    my_id: String,
    holder: Mutex<Option<String>>,
    tx: Sender<LockEvent>,
    rx: Mutex<Option<Receiver<LockEvent>>>,
    acquire_calls: Mutex<Vec<Duration>>,
}

impl FakeLock {
    pub fn new(my_id: &str) -> Self {
        let (tx, rx) = mpsc::channel(8);
        Self {
            my_id: my_id.to_string(),
            holder: Mutex::new(None),
            tx,
            rx: Mutex::new(Some(rx)),
            acquire_calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn inject(&self, ev: LockEvent) {
        {
            let mut holder = self.holder.lock().await;
            match ev {
                LockEvent::Acquired => *holder = Some(self.my_id.clone()),
                LockEvent::Lost => {
                    if holder.as_deref() == Some(self.my_id.as_str()) {
                        *holder = None;
                    }
                }
                LockEvent::AcquireTimeout => {}
            }
        }
        debug!("fake lock {}: injecting {ev:?}", self.my_id);
        let _ = self.tx.send(ev).await;
    }

    /// Pretends another node (or nobody) holds the lock.
    pub async fn set_holder(&self, holder: Option<&str>) {
        *self.holder.lock().await = holder.map(str::to_string);
    }

    pub async fn acquire_calls(&self) -> Vec<Duration> {
        self.acquire_calls.lock().await.clone()
    }
}

#[async_trait]
impl LeaderLock for FakeLock {
    fn holder_id(&self) -> &str {
        &self.my_id
    }

    async fn acquire(&self, timeout: Duration) -> Result<(), ObjdbError> {
        self.acquire_calls.lock().await.push(timeout);
        Ok(())
    }

    async fn release(&self) -> Result<(), ObjdbError> {
        let mut holder = self.holder.lock().await;
        if holder.as_deref() == Some(self.my_id.as_str()) {
            *holder = None;
        }
        Ok(())
    }

    async fn get_holder(&self) -> Result<Option<String>, ObjdbError> {
        Ok(self.holder.lock().await.clone())
    }

    async fn take_events(&self) -> Result<Receiver<LockEvent>, ObjdbError> {
        self.rx.lock().await.take().ok_or(ObjdbError::EventsTaken)
    }
}

#[derive(Default)]
pub struct FakeServiceRegistry {
    services: Mutex<BTreeMap<String, ServiceInfo>>,
}

impl FakeServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceRegistry for FakeServiceRegistry {
    async fn register_service(&self, info: ServiceInfo) -> Result<(), ObjdbError> {
        self.services.lock().await.insert(info.key(), info);
        Ok(())
    }

    async fn deregister_service(&self, info: &ServiceInfo) -> Result<(), ObjdbError> {
        self.services.lock().await.remove(&info.key());
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInfo>, ObjdbError> {
        Ok(self
            .services
            .lock()
            .await
            .values()
            .filter(|s| s.service_name == name)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn injected_events_move_the_holder() {
        let lock = FakeLock::new("10.0.0.1:9999");
        let mut events = lock.take_events().await.unwrap();
        assert!(matches!(
            lock.take_events().await,
            Err(ObjdbError::EventsTaken)
        ));

        lock.inject(LockEvent::Acquired).await;
        assert_eq!(events.recv().await, Some(LockEvent::Acquired));
        assert_eq!(
            lock.get_holder().await.unwrap().as_deref(),
            Some("10.0.0.1:9999")
        );

        lock.inject(LockEvent::Lost).await;
        assert_eq!(events.recv().await, Some(LockEvent::Lost));
        assert_eq!(lock.get_holder().await.unwrap(), None);
    }

    #[tokio::test]
    async fn registry_filters_by_name() {
        let reg = FakeServiceRegistry::new();
        for (name, port) in [("netmaster", 9999), ("netmaster.rpc", 9001)] {
            reg.register_service(ServiceInfo {
                service_name: name.into(),
                ttl: 10,
                host_addr: "10.0.0.1".into(),
                port,
                role: String::new(),
            })
            .await
            .unwrap();
        }
        let found = reg.get_service("netmaster").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].port, 9999);
    }
}
