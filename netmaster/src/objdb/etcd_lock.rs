use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, EventType, PutOptions, Txn, TxnOp};
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use super::{LOCK_PREFIX, LeaderLock, LockEvent, ObjdbError};

enum Attempt {
    Acquired(i64),
    HeldBy(String),
    Contended,
}

enum WaitOutcome {
    Released,
    TimedOut,
    Cancelled,
}

struct LockInner {
    client: Arc<Mutex<Client>>,
    name: String,
    key: String,
    my_id: String,
    ttl: i64,
    events: Sender<LockEvent>,
    cancel: CancellationToken,
    lease: Mutex<Option<i64>>,
}

/// Leader lock stored at `/contiv.io/lock/<name>`. The key is created under
/// a lease only when absent, and the lease is kept alive every ttl/3.
pub struct EtcdLock {
    inner: Arc<LockInner>,
    events_rx: Mutex<Option<Receiver<LockEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EtcdLock {
    pub fn new(client: Arc<Mutex<Client>>, name: &str, my_id: &str, ttl: u64) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let inner = LockInner {
            client,
            name: name.to_string(),
            key: format!("{LOCK_PREFIX}{name}"),
            my_id: my_id.to_string(),
            ttl: ttl.max(1) as i64,
            events: tx,
            cancel: CancellationToken::new(),
            lease: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
            events_rx: Mutex::new(Some(rx)),
            task: Mutex::new(None),
        }
    }
}

impl LockInner {
    async fn cli(&self) -> tokio::sync::MutexGuard<'_, Client> {
        self.client.lock().await
    }

    async fn notify(&self, ev: LockEvent) {
        if self.events.send(ev).await.is_err() {
            warn!("lock {}: nobody is listening for {ev:?}", self.name);
        }
    }

    async fn try_acquire(&self) -> Result<Attempt, ObjdbError> {
        let resp = self.cli().await.get(self.key.as_str(), None).await?;
        if let Some(kv) = resp.kvs().first() {
            let holder = String::from_utf8(kv.value().to_vec())?;
            if holder == self.my_id {
                return Ok(Attempt::Acquired(kv.lease()));
            }
            return Ok(Attempt::HeldBy(holder));
        }

        let lease_id = self.cli().await.lease_grant(self.ttl, None).await?.id();
        let put_op = TxnOp::put(
            self.key.as_str(),
            self.my_id.as_str(),
            Some(PutOptions::new().with_lease(lease_id)),
        );
        let cmp = Compare::version(self.key.as_str(), CompareOp::Equal, 0);
        let txn = Txn::new().when([cmp]).and_then([put_op]);

        let txn_resp = match self.cli().await.txn(txn).await {
            Ok(resp) => resp,
            Err(e) => {
                let _ = self.cli().await.lease_revoke(lease_id).await;
                return Err(e.into());
            }
        };
        if !txn_resp.succeeded() {
            let _ = self.cli().await.lease_revoke(lease_id).await;
            return Ok(Attempt::Contended);
        }
        Ok(Attempt::Acquired(lease_id))
    }

    /// Keeps the lease alive until it is lost (`true`) or the lock is
    /// released (`false`). Losing the key to a delete or to another holder
    /// counts as lost even while the lease is still alive.
    async fn hold(&self, lease_id: i64) -> bool {
        let keep_alive = self.cli().await.lease_keep_alive(lease_id).await;
        let (mut keeper, mut stream) = match keep_alive {
            Ok(pair) => pair,
            Err(e) => {
                error!("lock {}: cannot keep lease alive: {e}", self.name);
                return true;
            }
        };
        let watch = self.cli().await.watch(self.key.as_str(), None).await;
        let (_watcher, mut changes) = match watch {
            Ok(pair) => pair,
            Err(e) => {
                error!("lock {}: cannot watch lock key: {e}", self.name);
                return true;
            }
        };
        // the key may have changed hands before the watch was in place
        match self.cli().await.get(self.key.as_str(), None).await {
            Ok(resp) => {
                let current = resp.kvs().first().map(|kv| kv.value());
                if current != Some(self.my_id.as_bytes()) {
                    warn!("lock {}: key no longer held by {}", self.name, self.my_id);
                    return self.give_up_lease(lease_id).await;
                }
            }
            Err(e) => {
                error!("lock {}: cannot read lock key: {e}", self.name);
                return true;
            }
        }
        let interval = Duration::from_secs((self.ttl / 3).max(1) as u64);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                msg = changes.next() => match msg {
                    Some(Ok(resp)) => {
                        let lost = resp
                            .events()
                            .iter()
                            .any(|ev| {
                                let value = ev.kv().map(|kv| kv.value());
                                holder_changed(ev.event_type(), value, &self.my_id)
                            });
                        if lost {
                            warn!("lock {}: key deleted or taken over", self.name);
                            return self.give_up_lease(lease_id).await;
                        }
                    }
                    other => {
                        error!("lock {}: watch on lock key ended ({other:?})", self.name);
                        return self.give_up_lease(lease_id).await;
                    }
                },
                _ = sleep(interval) => {
                    if let Err(e) = keeper.keep_alive().await {
                        error!("lock {}: error refreshing ttl: {e}", self.name);
                        return true;
                    }
                    match stream.message().await {
                        Ok(Some(resp)) if resp.ttl() > 0 => {
                            debug!("lock {}: refreshed ttl {}", self.name, resp.ttl());
                        }
                        other => {
                            error!("lock {}: lease expired ({other:?})", self.name);
                            return true;
                        }
                    }
                }
            }
        }
    }

    /// Revokes a lease whose key is no longer ours. Always reports lost.
    async fn give_up_lease(&self, lease_id: i64) -> bool {
        if let Err(e) = self.cli().await.lease_revoke(lease_id).await {
            debug!("lock {}: revoking lease {lease_id}: {e}", self.name);
        }
        true
    }

    async fn wait_for_release(&self, deadline: Option<Instant>) -> WaitOutcome {
        let watch = self.cli().await.watch(self.key.as_str(), None).await;
        let (_watcher, mut stream) = match watch {
            Ok(pair) => pair,
            Err(e) => {
                error!("lock {}: watch failed: {e}", self.name);
                sleep(Duration::from_secs(1)).await;
                return WaitOutcome::Released;
            }
        };
        // the holder may have gone away before the watch was in place
        if let Ok(resp) = self.cli().await.get(self.key.as_str(), None).await {
            if resp.kvs().is_empty() {
                return WaitOutcome::Released;
            }
        }

        let expired = async {
            match deadline {
                Some(d) => sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return WaitOutcome::Cancelled,
                _ = &mut expired => return WaitOutcome::TimedOut,
                msg = stream.next() => match msg {
                    Some(Ok(resp)) => {
                        if resp
                            .events()
                            .iter()
                            .any(|ev| ev.event_type() == EventType::Delete)
                        {
                            info!("lock {} released by holder, retrying", self.name);
                            return WaitOutcome::Released;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("lock {}: watch stream error: {e}", self.name);
                        return WaitOutcome::Released;
                    }
                    None => return WaitOutcome::Released,
                },
            }
        }
    }

    async fn run(self: Arc<Self>, timeout: Duration) {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.try_acquire().await {
                Ok(Attempt::Acquired(lease_id)) => {
                    info!("acquired lock {} as {}", self.key, self.my_id);
                    *self.lease.lock().await = Some(lease_id);
                    self.notify(LockEvent::Acquired).await;
                    if !self.hold(lease_id).await {
                        return;
                    }
                    *self.lease.lock().await = None;
                    self.notify(LockEvent::Lost).await;
                }
                Ok(Attempt::HeldBy(holder)) => {
                    info!("lock {} already acquired by {holder}", self.key);
                    match self.wait_for_release(deadline).await {
                        WaitOutcome::Released => {}
                        WaitOutcome::TimedOut => {
                            info!("lock acquire timed out on {}", self.key);
                            self.notify(LockEvent::AcquireTimeout).await;
                            return;
                        }
                        WaitOutcome::Cancelled => return,
                    }
                }
                Ok(Attempt::Contended) => {
                    debug!("lock {} created by someone else, rechecking", self.key);
                }
                Err(e) => {
                    error!("error acquiring lock {}: {e}", self.key);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }
}

/// True when a watch event on the lock key means `my_id` no longer holds it.
fn holder_changed(kind: EventType, value: Option<&[u8]>, my_id: &str) -> bool {
    match kind {
        EventType::Delete => true,
        EventType::Put => value != Some(my_id.as_bytes()),
    }
}

#[async_trait]
impl LeaderLock for EtcdLock {
    fn holder_id(&self) -> &str {
        &self.inner.my_id
    }

    async fn acquire(&self, timeout: Duration) -> Result<(), ObjdbError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(ObjdbError::AlreadyAcquiring(self.inner.name.clone()));
        }
        *task = Some(tokio::spawn(Arc::clone(&self.inner).run(timeout)));
        Ok(())
    }

    async fn release(&self) -> Result<(), ObjdbError> {
        self.inner.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("lock {} task ended abnormally: {e}", self.inner.name);
            }
        }

        let Some(lease_id) = self.inner.lease.lock().await.take() else {
            return Ok(());
        };
        let key = self.inner.key.as_str();
        let txn = Txn::new()
            .when([Compare::value(key, CompareOp::Equal, self.inner.my_id.as_str())])
            .and_then([TxnOp::delete(key, None)]);
        let mut cli = self.inner.cli().await;
        if let Err(e) = cli.txn(txn).await {
            error!("error deleting lock key {key}: {e}");
        }
        cli.lease_revoke(lease_id).await?;
        info!("released lock {key}");
        Ok(())
    }

    async fn get_holder(&self) -> Result<Option<String>, ObjdbError> {
        let resp = self.inner.cli().await.get(self.inner.key.as_str(), None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(String::from_utf8(kv.value().to_vec())?)),
            None => Ok(None),
        }
    }

    async fn take_events(&self) -> Result<Receiver<LockEvent>, ObjdbError> {
        self.events_rx.lock().await.take().ok_or(ObjdbError::EventsTaken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_changes_that_lose_the_lock() {
        let me = "10.0.0.1:9999";
        assert!(holder_changed(EventType::Delete, None, me));
        assert!(holder_changed(EventType::Delete, Some(me.as_bytes()), me));
        assert!(holder_changed(EventType::Put, Some(b"10.0.0.2:9999"), me));
        assert!(holder_changed(EventType::Put, None, me));
        assert!(!holder_changed(EventType::Put, Some(me.as_bytes()), me));
    }
}
