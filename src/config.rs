use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Result;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::data_model::JobId;

/// Two-part housekeeping cadence: the gated tasks run on cycles where
/// `cycle % divisor == offset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateFrequency {
    pub divisor: u64,
    pub offset: u64,
}

/// Daemon configuration, reloaded at every cycle boundary so operators can
/// adjust limits without a restart. Path-valued fields (`data_dir`,
/// `instance_lock_path`) are only read at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Root of the portal data tree; `result/`, `log/` and `static/` live
    /// underneath it.
    pub data_dir: PathBuf,
    pub node_registry_path: PathBuf,
    pub instance_lock_path: PathBuf,
    pub sleep_interval_secs: u64,
    pub max_submit_jobs_per_node: usize,
    pub max_resubmit: u32,
    pub max_submit_tries: u32,
    pub max_time_in_remote_queue_secs: u64,
    pub max_keep_days: u32,
    pub status_update_frequency: StatusUpdateFrequency,
    pub log_archive_threshold_bytes: u64,
    /// Debug mode: poll and finalize as usual but never hand new work to a
    /// compute node.
    pub debug_no_submit: bool,
    pub structured_logging: bool,
    pub submit_command: Option<String>,
    pub poll_command: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let data_dir = env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("dispatchd_data");
        DispatcherConfig {
            node_registry_path: data_dir.join("config/computenode.txt"),
            instance_lock_path: PathBuf::from("/tmp/dispatchd.lock"),
            data_dir,
            sleep_interval_secs: 5,
            max_submit_jobs_per_node: 100,
            max_resubmit: 2,
            max_submit_tries: 3,
            max_time_in_remote_queue_secs: 24 * 3600,
            max_keep_days: 30,
            status_update_frequency: StatusUpdateFrequency {
                divisor: 500,
                offset: 50,
            },
            log_archive_threshold_bytes: 20 * 1024 * 1024,
            debug_no_submit: false,
            structured_logging: false,
            submit_command: None,
            poll_command: None,
        }
    }
}

impl DispatcherConfig {
    pub fn from_path(path: &Path) -> Result<DispatcherConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: DispatcherConfig = Figment::new().merge(Yaml::string(&config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sleep_interval_secs == 0 {
            return Err(anyhow::anyhow!("sleep_interval_secs must be nonzero"));
        }
        if self.max_submit_jobs_per_node == 0 {
            return Err(anyhow::anyhow!("max_submit_jobs_per_node must be nonzero"));
        }
        if self.status_update_frequency.divisor == 0 {
            return Err(anyhow::anyhow!(
                "status_update_frequency.divisor must be nonzero"
            ));
        }
        if self.status_update_frequency.offset >= self.status_update_frequency.divisor {
            return Err(anyhow::anyhow!(
                "status_update_frequency.offset {} must be smaller than the divisor {}",
                self.status_update_frequency.offset,
                self.status_update_frequency.divisor
            ));
        }
        Ok(())
    }

    pub fn result_dir(&self) -> PathBuf {
        self.data_dir.join("result")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }

    pub fn stat_dir(&self) -> PathBuf {
        self.log_dir().join("stat")
    }

    pub fn static_dir(&self) -> PathBuf {
        self.data_dir.join("static")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.static_dir().join("tmp")
    }

    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.result_dir().join(job_id.get())
    }

    /// An external cache-maintenance process drops this marker to pause the
    /// whole loop.
    pub fn pause_marker_path(&self) -> PathBuf {
        self.result_dir().join("CACHE_CLEANING_IN_PROGRESS")
    }

    pub fn sleep_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_interval_secs)
    }

    pub fn remote_queue_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_time_in_remote_queue_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DispatcherConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_submit_jobs_per_node, 100);
        assert_eq!(config.max_resubmit, 2);
        assert_eq!(config.status_update_frequency.divisor, 500);
    }

    #[test]
    fn partial_yaml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "max_submit_jobs_per_node: 4\nsleep_interval_secs: 1\ndebug_no_submit: true"
        )
        .unwrap();
        let config = DispatcherConfig::from_path(file.path()).unwrap();
        assert_eq!(config.max_submit_jobs_per_node, 4);
        assert!(config.debug_no_submit);
        // untouched fields keep their defaults
        assert_eq!(config.max_resubmit, 2);
    }

    #[test]
    fn invalid_cadence_is_rejected() {
        let config = DispatcherConfig {
            status_update_frequency: StatusUpdateFrequency {
                divisor: 10,
                offset: 10,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DispatcherConfig {
            max_submit_jobs_per_node: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
