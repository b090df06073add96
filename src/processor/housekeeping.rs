use std::{fs, sync::Arc, time::SystemTime};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    config::DispatcherConfig,
    data_model::{format_datetime, JobStatus},
    error::Result,
    state_store::JobLogStore,
};

pub const STATISTICS_FILE: &str = "statistics.json";

#[derive(Debug, Serialize)]
struct PortalStatistics {
    generated_at: String,
    in_flight_jobs: usize,
    finished_success: usize,
    finished_partial: usize,
    finished_failed: usize,
    total_finished: usize,
    total_finished_sequences: u64,
}

/// Periodic maintenance around the dispatch pass: statistics, stale-result
/// eviction and server-file cleanup run on the configured cycle cadence
/// (`cycle % divisor == offset`); log archival is checked every cycle. Every
/// task is error-contained so a failed sweep never stalls dispatching.
pub struct HousekeepingScheduler {
    store: Arc<JobLogStore>,
}

impl HousekeepingScheduler {
    pub fn new(store: Arc<JobLogStore>) -> HousekeepingScheduler {
        HousekeepingScheduler { store }
    }

    pub fn run(&self, cycle: u64, config: &DispatcherConfig) {
        if let Err(err) = self
            .store
            .archive_run_log(config.log_archive_threshold_bytes)
        {
            error!(error = %err, "run log archival failed");
        }
        if let Err(err) = self.store.archive_plain_log(
            &self.store.finished_log_path(),
            config.log_archive_threshold_bytes,
        ) {
            error!(error = %err, "finished log archival failed");
        }

        let frequency = &config.status_update_frequency;
        if cycle % frequency.divisor != frequency.offset {
            return;
        }
        info!(cycle, "running gated housekeeping tasks");
        if let Err(err) = self.generate_statistics(config) {
            error!(error = %err, "statistics generation failed");
        }
        match self.delete_old_results(config, config.max_keep_days) {
            Ok(deleted) if deleted > 0 => info!(deleted, "stale result directories removed"),
            Ok(_) => {}
            Err(err) => error!(error = %err, "stale result deletion failed"),
        }
        if let Err(err) = self.clean_server_files(config) {
            error!(error = %err, "server file cleanup failed");
        }
    }

    pub fn generate_statistics(&self, config: &DispatcherConfig) -> Result<()> {
        let finished = self.store.read_finished_records()?;
        let in_flight = self.store.read_in_flight_jobs()?;
        let stats = PortalStatistics {
            generated_at: format_datetime(&Utc::now()),
            in_flight_jobs: in_flight.len(),
            finished_success: finished
                .iter()
                .filter(|r| r.status == JobStatus::FinishedSuccess)
                .count(),
            finished_partial: finished
                .iter()
                .filter(|r| r.status == JobStatus::FinishedPartial)
                .count(),
            finished_failed: finished
                .iter()
                .filter(|r| r.status == JobStatus::FinishedFailed)
                .count(),
            total_finished: finished.len(),
            total_finished_sequences: finished.iter().map(|r| r.num_seq as u64).sum(),
        };
        let stat_dir = config.stat_dir();
        fs::create_dir_all(&stat_dir)?;
        let path = stat_dir.join(STATISTICS_FILE);
        let tmp = path.with_extension("tmp");
        fs::write(
            &tmp,
            serde_json::to_string_pretty(&stats).map_err(std::io::Error::other)?,
        )?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "statistics written");
        Ok(())
    }

    /// Removes result directories of jobs that finished more than
    /// `max_keep_days` ago. Deletion is conservative: a record whose finish
    /// date is missing or unparsable is never deleted, regardless of the
    /// directory's age on disk.
    pub fn delete_old_results(&self, config: &DispatcherConfig, max_keep_days: u32) -> Result<usize> {
        let now = Utc::now();
        let mut deleted = 0usize;
        for record in self.store.read_finished_records()? {
            let Some(finish_date) = record.finish_date else {
                debug!(job_id = %record.job_id, "finish date missing or unparsable, keeping");
                continue;
            };
            let age_days = now.signed_duration_since(finish_date).num_days();
            if age_days <= max_keep_days as i64 {
                continue;
            }
            let dir = config.job_dir(&record.job_id);
            if !dir.exists() {
                continue;
            }
            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    info!(
                        job_id = %record.job_id,
                        age_days,
                        max_keep_days,
                        "deleted stale result directory"
                    );
                    deleted += 1;
                }
                Err(err) => {
                    warn!(job_id = %record.job_id, error = %err, "cannot delete result directory");
                }
            }
        }
        Ok(deleted)
    }

    /// Sweeps leftover upload/scratch files under `static/tmp` older than
    /// the retention window.
    pub fn clean_server_files(&self, config: &DispatcherConfig) -> Result<()> {
        let tmp_dir = config.tmp_dir();
        if !tmp_dir.exists() {
            return Ok(());
        }
        let cutoff = std::time::Duration::from_secs(config.max_keep_days as u64 * 24 * 3600);
        for entry in fs::read_dir(&tmp_dir)? {
            let entry = entry?;
            let modified = match entry.metadata().and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default();
            if age < cutoff {
                continue;
            }
            let path = entry.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match removed {
                Ok(()) => debug!(path = %path.display(), "removed stale server file"),
                Err(err) => warn!(path = %path.display(), error = %err, "cannot remove server file"),
            }
        }
        Ok(())
    }
}
