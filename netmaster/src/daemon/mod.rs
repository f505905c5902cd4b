//! Leader/follower state machine.
//!
//! Every node contends for the `netmaster/leader` lock. The holder serves
//! the full API; everyone else forwards requests to it. Lock events drive
//! the transitions, and only one of the two HTTP servers binds the listen
//! address at a time.

use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use axum::Router;
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::NetmasterConfig;
use crate::master::NetMaster;
use crate::objapi::ObjController;
use crate::objdb::{LeaderLock, LockEvent, ServiceInfo, ServiceRegistry, split_host_port};

pub mod proxy;
pub mod routes;

pub const LEADER_LOCK_NAME: &str = "netmaster/leader";
pub const MASTER_SERVICE: &str = "netmaster";
pub const MASTER_RPC_SERVICE: &str = "netmaster.rpc";
pub const PLUGIN_SERVICE: &str = "netplugin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Follower,
    Leader,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Follower => write!(f, "follower"),
            Mode::Leader => write!(f, "leader"),
        }
    }
}

/// Shared with the HTTP handlers of both modes.
pub struct DaemonState {
    pub master: Arc<NetMaster>,
    pub controller: Arc<ObjController>,
    pub lock: Arc<dyn LeaderLock>,
    pub registry: Arc<dyn ServiceRegistry>,
    pub mode: watch::Receiver<Mode>,
    /// Host part of the control address.
    pub local_ip: String,
    pub http: reqwest::Client,
}

impl DaemonState {
    pub fn current_mode(&self) -> Mode {
        *self.mode.borrow()
    }
}

struct Running {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

pub struct MasterDaemon {
    cfg: NetmasterConfig,
    state: Arc<DaemonState>,
    mode_tx: watch::Sender<Mode>,
    // held for as long as a server owns the listen address
    listener: Mutex<()>,
    fatal: mpsc::Sender<anyhow::Error>,
    fatal_rx: Mutex<Option<mpsc::Receiver<anyhow::Error>>>,
}

impl MasterDaemon {
    pub async fn new(
        cfg: NetmasterConfig,
        master: Arc<NetMaster>,
        lock: Arc<dyn LeaderLock>,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Result<Self> {
        let (local_ip, _) = split_host_port(&cfg.control_url)
            .with_context(|| format!("Invalid netmaster URL {}", cfg.control_url))?;
        let controller =
            Arc::new(ObjController::new(Arc::clone(&master), cfg.defaults.clone()).await?);
        let (mode_tx, mode) = watch::channel(Mode::Follower);
        let (fatal, fatal_rx) = mpsc::channel(4);
        let state = DaemonState {
            master,
            controller,
            lock,
            registry,
            mode,
            local_ip,
            http: reqwest::Client::new(),
        };
        Ok(Self {
            cfg,
            state: Arc::new(state),
            mode_tx,
            listener: Mutex::new(()),
            fatal,
            fatal_rx: Mutex::new(Some(fatal_rx)),
        })
    }

    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    /// Mode of the server currently bound, updated once it listens.
    pub fn mode(&self) -> watch::Receiver<Mode> {
        self.mode_tx.subscribe()
    }

    /// Publishes this node under the control-plane and RPC service names.
    async fn register_services(&self, mode: Mode) -> Result<()> {
        let (host_addr, port) = split_host_port(&self.cfg.control_url)?;
        for (name, port) in [
            (MASTER_SERVICE, port),
            (MASTER_RPC_SERVICE, self.cfg.rpc_port),
        ] {
            let info = ServiceInfo {
                service_name: name.to_string(),
                ttl: self.cfg.service_ttl,
                host_addr: host_addr.clone(),
                port,
                role: mode.to_string(),
            };
            self.state
                .registry
                .register_service(info)
                .await
                .with_context(|| format!("Error registering service {name}"))?;
        }
        info!("Registered netmaster service with registry");
        Ok(())
    }

    fn router(&self, mode: Mode) -> Router {
        match mode {
            Mode::Leader => routes::leader_router(Arc::clone(&self.state)),
            Mode::Follower => proxy::follower_router(Arc::clone(&self.state)),
        }
    }

    /// Binds the listen address, and the control address when it is not
    /// already covered, then serves until `stop` fires.
    async fn serve(&self, mode: Mode, stop: CancellationToken) -> Result<()> {
        let _guard = self.listener.lock().await;
        if stop.is_cancelled() {
            return Ok(());
        }
        let router = self.router(mode);

        let listener = TcpListener::bind(&self.cfg.listen_url)
            .await
            .with_context(|| format!("cannot listen on {}", self.cfg.listen_url))?;
        info!("Netmaster listening on {} as {mode}", self.cfg.listen_url);

        let ctrl_listener = if self.cfg.control_url != self.cfg.listen_url {
            let (ext_host, ext_port) = split_host_port(&self.cfg.listen_url)?;
            let (_, int_port) = split_host_port(&self.cfg.control_url)?;
            if ext_host == "0.0.0.0" && ext_port == int_port {
                info!(
                    "Ignore creating API listener on {:?} because {:?} covers it",
                    self.cfg.control_url, self.cfg.listen_url
                );
                None
            } else {
                let l = TcpListener::bind(&self.cfg.control_url)
                    .await
                    .with_context(|| format!("cannot listen on {}", self.cfg.control_url))?;
                info!(
                    "Netmaster listening on {} for control packets",
                    self.cfg.control_url
                );
                Some(l)
            }
        } else {
            None
        };

        let _ = self.mode_tx.send(mode);

        let external = axum::serve(listener, router.clone())
            .with_graceful_shutdown(stop.clone().cancelled_owned());
        match ctrl_listener {
            Some(l) => {
                let control =
                    axum::serve(l, router).with_graceful_shutdown(stop.clone().cancelled_owned());
                tokio::try_join!(external.into_future(), control.into_future())?;
            }
            None => external.await?,
        }
        info!("Exiting {mode} mode");
        Ok(())
    }

    async fn run_leader(&self, stop: CancellationToken) -> Result<()> {
        self.state
            .master
            .restore()
            .await
            .context("restoring leader caches")?;
        self.register_services(Mode::Leader).await?;
        self.serve(Mode::Leader, stop).await
    }

    async fn run_follower(&self, stop: CancellationToken) -> Result<()> {
        self.register_services(Mode::Follower).await?;
        info!("Listening in follower mode");
        self.serve(Mode::Follower, stop).await
    }

    fn spawn_mode(self: &Arc<Self>, mode: Mode) -> Running {
        let stop = CancellationToken::new();
        let this = Arc::clone(self);
        let token = stop.clone();
        let task = tokio::spawn(async move {
            let res = match mode {
                Mode::Leader => this.run_leader(token).await,
                Mode::Follower => this.run_follower(token).await,
            };
            if let Err(e) = res {
                error!("{mode} server failed: {e:#}");
                let _ = this.fatal.send(e).await;
            }
        });
        Running { stop, task }
    }

    async fn stop_mode(running: Running) {
        running.stop.cancel();
        if let Err(e) = running.task.await {
            error!("server task ended abnormally: {e}");
        }
    }

    /// Runs the state machine until `shutdown` fires or a server fails.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut fatal = self
            .fatal_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("daemon is already running"))?;
        let mut events = self.state.lock.take_events().await?;

        // zero timeout: contend until granted
        self.state
            .lock
            .acquire(Duration::ZERO)
            .await
            .context("Error while acquiring lock")?;

        let mut current = self.spawn_mode(Mode::Follower);
        let mut mode = Mode::Follower;

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down netmaster");
                    break Ok(());
                }
                Some(e) = fatal.recv() => break Err(e),
                ev = events.recv() => {
                    let Some(ev) = ev else {
                        break Err(anyhow!("leader lock event channel closed"));
                    };
                    match ev {
                        LockEvent::Acquired if mode != Mode::Leader => {
                            info!("Leader lock acquired");
                            Self::stop_mode(current).await;
                            mode = Mode::Leader;
                            current = self.spawn_mode(mode);
                        }
                        LockEvent::Lost if mode != Mode::Follower => {
                            info!("Leader lock lost. Becoming follower");
                            Self::stop_mode(current).await;
                            sleep(Duration::from_millis(self.cfg.follower_settle_ms)).await;
                            mode = Mode::Follower;
                            current = self.spawn_mode(mode);
                        }
                        LockEvent::AcquireTimeout => warn!("timed out acquiring leader lock"),
                        other => info!("ignoring lock event {other:?} in {mode} mode"),
                    }
                }
            }
        };

        Self::stop_mode(current).await;
        if let Err(e) = self.state.lock.release().await {
            error!("Error releasing leader lock: {e}");
        }
        result
    }
}

/// Fails when the lock has no holder; used where the leader address is
/// required.
pub async fn leader_addr(lock: &dyn LeaderLock) -> Result<String> {
    match lock.get_holder().await? {
        Some(holder) if !holder.is_empty() => Ok(holder),
        _ => bail!("Leader not found"),
    }
}
