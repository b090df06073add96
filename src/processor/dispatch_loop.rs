use std::{path::PathBuf, time::Duration};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{
    config::DispatcherConfig,
    error::Result,
    node_registry,
    processor::{
        housekeeping::HousekeepingScheduler,
        lifecycle::{CycleStats, JobLifecycleEngine},
    },
};

/// Sleep between pause-marker checks instead of spinning on the marker.
pub const PAUSE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum LoopOutcome {
    /// The cache-cleaning marker is present; nothing was submitted, polled
    /// or housekept.
    Paused,
    Ran(CycleStats),
}

/// The daemon's outer loop: reload config and registry, run one lifecycle
/// pass over the in-flight jobs, run housekeeping, sleep, repeat. A failed
/// cycle is logged and the loop keeps going; only shutdown stops it.
pub struct DispatchLoop {
    config: DispatcherConfig,
    config_path: Option<PathBuf>,
    engine: JobLifecycleEngine,
    housekeeping: HousekeepingScheduler,
    cycle: u64,
}

impl DispatchLoop {
    pub fn new(
        config: DispatcherConfig,
        config_path: Option<PathBuf>,
        engine: JobLifecycleEngine,
        housekeeping: HousekeepingScheduler,
    ) -> DispatchLoop {
        DispatchLoop {
            config,
            config_path,
            engine,
            housekeeping,
            cycle: 0,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub async fn start(&mut self, mut shutdown_rx: watch::Receiver<()>) {
        info!("dispatch loop started");
        loop {
            let sleep = match self.run_once().await {
                Ok(LoopOutcome::Paused) => PAUSE_BACKOFF,
                Ok(LoopOutcome::Ran(_)) => self.config.sleep_interval(),
                Err(err) => {
                    error!(error = %err, "cycle failed");
                    self.config.sleep_interval()
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown_rx.changed() => {
                    info!("dispatch loop shutting down");
                    break;
                }
            }
        }
    }

    pub async fn run_once(&mut self) -> Result<LoopOutcome> {
        if self.config.pause_marker_path().exists() {
            info!("cache cleaning in progress, dispatch paused");
            return Ok(LoopOutcome::Paused);
        }

        self.reload_config();
        let registry = match node_registry::load(&self.config.node_registry_path) {
            Ok(nodes) => nodes,
            Err(err) => {
                // polling of dispatched jobs continues with zero nodes
                error!(error = %err, "node registry unavailable, no new submissions this cycle");
                Vec::new()
            }
        };

        let stats = self.engine.run_cycle(&self.config, &registry).await?;
        self.housekeeping.run(self.cycle, &self.config);
        info!(
            cycle = self.cycle,
            nodes = registry.len(),
            jobs = stats.jobs_seen,
            submitted = stats.submitted_seqs,
            polled = stats.polled_handles,
            finalized = stats.finalized,
            "cycle complete"
        );
        self.cycle += 1;
        Ok(LoopOutcome::Ran(stats))
    }

    fn reload_config(&mut self) {
        let Some(path) = self.config_path.clone() else {
            return;
        };
        match DispatcherConfig::from_path(&path) {
            Ok(config) => self.config = config,
            Err(err) => {
                warn!(error = %err, "config reload failed, keeping previous configuration");
            }
        }
    }
}
