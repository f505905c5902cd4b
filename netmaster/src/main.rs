use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use etcd_client::Client;
use libresource::{StateDriver, StateResourceManager};
use log::{error, info};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use netmaster::cfgtool::{self, CfgRequest};
use netmaster::cli::{Cli, Commands};
use netmaster::config::{NetmasterConfig, load_config};
use netmaster::daemon::{LEADER_LOCK_NAME, MasterDaemon};
use netmaster::master::NetMaster;
use netmaster::objdb::{self, EtcdLock, EtcdServiceRegistry, EtcdStateDriver};

async fn open_store(
    cfg: &NetmasterConfig,
) -> anyhow::Result<(Arc<Mutex<Client>>, StateResourceManager)> {
    let client = objdb::etcd::connect(&cfg.store)
        .await
        .context("Failed to connect to the cluster store")?;
    let client = Arc::new(Mutex::new(client));
    let driver: Arc<dyn StateDriver> = Arc::new(EtcdStateDriver::new(Arc::clone(&client)));
    let rm = StateResourceManager::new(driver).context("Failed to create resource manager")?;
    Ok((client, rm))
}

async fn start(cfg: NetmasterConfig) -> anyhow::Result<()> {
    let (client, rm) = open_store(&cfg).await?;
    let master = Arc::new(NetMaster::new(Arc::new(rm)));
    let lock = Arc::new(EtcdLock::new(
        Arc::clone(&client),
        LEADER_LOCK_NAME,
        &cfg.control_url,
        cfg.leader_lock_ttl,
    ));
    let registry = Arc::new(EtcdServiceRegistry::new(client));
    let daemon = Arc::new(MasterDaemon::new(cfg, master, lock, registry).await?);

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl_c: {e:?}");
            return;
        }
        info!("received ctrl_c, shutting down");
        token.cancel();
    });

    daemon.run(shutdown).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => {
            let cfg = load_config(&config.to_string_lossy())?;
            info!("netmaster {} starting on {}", env!("CARGO_PKG_VERSION"), cfg.listen_url);
            start(cfg).await?;
        }
        Commands::Cfgtool {
            config,
            resource,
            tenant,
            state,
            id,
            field,
            set,
        } => {
            let req = CfgRequest::from_flags(resource, tenant, state, id, field, set)?;
            let cfg = load_config(&config.to_string_lossy())?;
            let (_client, rm) = open_store(&cfg).await?;
            let mut stdout = std::io::stdout();
            cfgtool::run(&rm, &req, &mut stdout).await?;
        }
    }

    Ok(())
}
