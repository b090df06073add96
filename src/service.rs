use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use tokio::{signal, sync::watch};
use tracing::info;

use crate::{
    config::DispatcherConfig,
    instance_lock::InstanceLock,
    processor::{
        dispatch_loop::DispatchLoop, housekeeping::HousekeepingScheduler,
        lifecycle::JobLifecycleEngine,
    },
    remote::{CommandComputeClient, ComputeClient, LoggingNotifier, Notifier},
    state_store::JobLogStore,
};

/// Wires the store, engine and loop together and owns the single-instance
/// lock for the process lifetime.
#[allow(dead_code)]
pub struct Service {
    pub config: DispatcherConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub store: Arc<JobLogStore>,
    dispatch_loop: DispatchLoop,
    _instance_lock: InstanceLock,
}

impl Service {
    /// Production wiring: the compute transport is bridged to the
    /// site-provided submit/poll executables named in the config.
    pub fn from_config(config: DispatcherConfig, config_path: Option<PathBuf>) -> Result<Service> {
        let client: Arc<dyn ComputeClient> = match (&config.submit_command, &config.poll_command) {
            (Some(submit), Some(poll)) => {
                Arc::new(CommandComputeClient::new(submit.clone(), poll.clone()))
            }
            _ => {
                return Err(anyhow::anyhow!(
                    "submit_command and poll_command must be configured"
                ));
            }
        };
        Service::new(config, config_path, client, Arc::new(LoggingNotifier))
    }

    pub fn new(
        config: DispatcherConfig,
        config_path: Option<PathBuf>,
        client: Arc<dyn ComputeClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Service> {
        let instance_lock = InstanceLock::acquire(&config.instance_lock_path)
            .context("error acquiring instance lock")?;

        for dir in [
            config.result_dir(),
            config.log_dir(),
            config.stat_dir(),
            config.tmp_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("error creating {}", dir.display()))?;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let store = Arc::new(JobLogStore::new(config.log_dir(), config.result_dir()));
        let engine = JobLifecycleEngine::new(store.clone(), client, notifier);
        let housekeeping = HousekeepingScheduler::new(store.clone());
        let dispatch_loop =
            DispatchLoop::new(config.clone(), config_path, engine, housekeeping);

        Ok(Service {
            config,
            shutdown_tx,
            shutdown_rx,
            store,
            dispatch_loop,
            _instance_lock: instance_lock,
        })
    }

    pub async fn start(mut self) -> Result<()> {
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal(shutdown_tx).await;
        });

        self.dispatch_loop.start(self.shutdown_rx.clone()).await;
        Ok(())
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    let _ = shutdown_tx.send(());
    info!("signal received, shutting down gracefully");
}
