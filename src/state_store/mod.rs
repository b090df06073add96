pub mod log_reader;

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::Utc;
use tracing::{info, warn};

use crate::{
    data_model::{
        format_datetime, FinishedRecord, Job, JobId, RemoteQueueEntry, RunLogRecord, SeqIndex,
    },
    error::Result,
    state_store::log_reader::LogBlockReader,
};

pub const RUN_LOG_FILE: &str = "runjob_log.log";
pub const FINISHED_LOG_FILE: &str = "finished_job.log";
pub const REMOTE_QUEUE_FILE: &str = "remotequeue_seqindex.txt";
pub const PENDING_SEQ_FILE: &str = "torun_seqindex.txt";
pub const FINISHED_SEQ_FILE: &str = "finished_seqindex.txt";
pub const START_TAG_FILE: &str = "runjob.start";
pub const FINISH_TAG_FILE: &str = "runjob.finish";
pub const JOB_LOCK_FILE: &str = "runjob.lock";
const RESUBMIT_COUNT_FILE: &str = "resubmit.count";
const SUBMIT_TRY_COUNT_FILE: &str = "submit_try.count";

/// Durable job state over append-only, tab-delimited text logs: the single
/// source of truth across process restarts. Appends are single-write whole
/// lines so concurrent readers never observe a partial record; everything
/// else is written to a temp file and atomically renamed.
pub struct JobLogStore {
    log_dir: PathBuf,
    result_dir: PathBuf,
}

impl JobLogStore {
    pub fn new(log_dir: PathBuf, result_dir: PathBuf) -> JobLogStore {
        JobLogStore {
            log_dir,
            result_dir,
        }
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.log_dir.join(RUN_LOG_FILE)
    }

    pub fn finished_log_path(&self) -> PathBuf {
        self.log_dir.join(FINISHED_LOG_FILE)
    }

    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.result_dir.join(job_id.get())
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        // one write call per record keeps the line atomic for readers
        file.write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }

    fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn append_run_record(&self, record: &RunLogRecord) -> Result<()> {
        self.append_line(&self.run_log_path(), &record.to_line())
    }

    /// Latest run-log record per job id, in first-appearance order.
    pub(crate) fn read_latest_records(&self) -> Result<Vec<RunLogRecord>> {
        let mut order: Vec<JobId> = Vec::new();
        let mut latest: BTreeMap<JobId, RunLogRecord> = BTreeMap::new();
        let Some(mut reader) = LogBlockReader::open(&self.run_log_path())? else {
            return Ok(Vec::new());
        };
        while let Some(block) = reader.next_block()? {
            for line in block {
                let Some(record) = RunLogRecord::parse(&line) else {
                    continue;
                };
                if !latest.contains_key(&record.job_id) {
                    order.push(record.job_id.clone());
                }
                latest.insert(record.job_id.clone(), record);
            }
        }
        Ok(order
            .into_iter()
            .map(|id| latest.remove(&id).expect("ordered id has a record"))
            .collect())
    }

    /// Reconstructs the in-flight job set: for every job id the latest
    /// record wins, terminal jobs are dropped, and the rest come back in
    /// log (submission) order. A missing log means no jobs in flight.
    pub fn read_in_flight_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for record in self.read_latest_records()? {
            if record.status.is_terminal() {
                continue;
            }
            let mut job = Job::from_record(&record);
            job.resubmit_count = self.read_counter(&record.job_id, RESUBMIT_COUNT_FILE);
            job.submit_try_count = self.read_counter(&record.job_id, SUBMIT_TRY_COUNT_FILE);
            jobs.push(job);
        }
        Ok(jobs)
    }

    pub fn append_remote_queue_entries(
        &self,
        job_id: &JobId,
        entries: &[RemoteQueueEntry],
    ) -> Result<()> {
        let path = self.job_dir(job_id).join(REMOTE_QUEUE_FILE);
        for entry in entries {
            self.append_line(&path, &entry.to_line())?;
        }
        Ok(())
    }

    /// Live dispatch entries for a job: the latest entry per sequence index
    /// (resubmission supersedes), ordered by sequence index.
    pub fn read_remote_queue_index(&self, job_id: &JobId) -> Result<Vec<RemoteQueueEntry>> {
        let path = self.job_dir(job_id).join(REMOTE_QUEUE_FILE);
        let Some(mut reader) = LogBlockReader::open(&path)? else {
            return Ok(Vec::new());
        };
        let mut latest: BTreeMap<SeqIndex, RemoteQueueEntry> = BTreeMap::new();
        while let Some(block) = reader.next_block()? {
            for line in block {
                if let Some(entry) = RemoteQueueEntry::parse(&line) {
                    latest.insert(entry.seq_index, entry);
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    /// `None` means the pending file has never been written for this job.
    pub fn read_pending_seqs(&self, job_id: &JobId) -> Result<Option<Vec<SeqIndex>>> {
        let path = self.job_dir(job_id).join(PENDING_SEQ_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut seqs: Vec<SeqIndex> = content
            .lines()
            .filter_map(|line| line.trim().parse::<SeqIndex>().ok())
            .collect();
        seqs.sort_unstable();
        seqs.dedup();
        Ok(Some(seqs))
    }

    pub fn write_pending_seqs(&self, job_id: &JobId, seqs: &[SeqIndex]) -> Result<()> {
        let path = self.job_dir(job_id).join(PENDING_SEQ_FILE);
        let mut content = String::new();
        for seq in seqs {
            content.push_str(&seq.to_string());
            content.push('\n');
        }
        self.write_atomic(&path, &content)
    }

    pub fn append_finished_seqs(&self, job_id: &JobId, results: &[(SeqIndex, bool)]) -> Result<()> {
        let path = self.job_dir(job_id).join(FINISHED_SEQ_FILE);
        let now = format_datetime(&Utc::now());
        for (seq, succeeded) in results {
            self.append_line(&path, &format!("{seq}\t{succeeded}\t{now}"))?;
        }
        Ok(())
    }

    pub fn read_finished_seqs(&self, job_id: &JobId) -> Result<BTreeMap<SeqIndex, bool>> {
        let path = self.job_dir(job_id).join(FINISHED_SEQ_FILE);
        let Some(mut reader) = LogBlockReader::open(&path)? else {
            return Ok(BTreeMap::new());
        };
        let mut finished = BTreeMap::new();
        while let Some(block) = reader.next_block()? {
            for line in block {
                let mut fields = line.split('\t');
                let (Some(seq), Some(flag)) = (fields.next(), fields.next()) else {
                    continue;
                };
                if let (Ok(seq), Ok(flag)) = (seq.parse::<SeqIndex>(), flag.parse::<bool>()) {
                    finished.insert(seq, flag);
                }
            }
        }
        Ok(finished)
    }

    /// Existence-based lifecycle marker; writing is a no-op when the file is
    /// already present, so the first timestamp is preserved.
    pub fn write_tag_file(&self, job_id: &JobId, name: &str) -> Result<()> {
        let path = self.job_dir(job_id).join(name);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format_datetime(&Utc::now()))?;
        Ok(())
    }

    pub fn tag_exists(&self, job_id: &JobId, name: &str) -> bool {
        self.job_dir(job_id).join(name).exists()
    }

    /// Returns false when another pass already holds the job.
    pub fn acquire_job_lock(&self, job_id: &JobId) -> Result<bool> {
        let path = self.job_dir(job_id).join(JOB_LOCK_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().create_new(true).write(true).open(&path) {
            Ok(mut file) => {
                let _ = file.write_all(format_datetime(&Utc::now()).as_bytes());
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn release_job_lock(&self, job_id: &JobId) -> Result<()> {
        match fs::remove_file(self.job_dir(job_id).join(JOB_LOCK_FILE)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn read_counter(&self, job_id: &JobId, name: &str) -> u32 {
        let path = self.job_dir(job_id).join(name);
        match fs::read_to_string(&path) {
            Ok(content) => match content.trim().parse::<u32>() {
                Ok(value) => value,
                Err(_) => {
                    warn!(job_id = %job_id, file = name, "unparsable counter, treating as 0");
                    0
                }
            },
            Err(_) => 0,
        }
    }

    pub fn write_resubmit_count(&self, job_id: &JobId, value: u32) -> Result<()> {
        self.write_atomic(
            &self.job_dir(job_id).join(RESUBMIT_COUNT_FILE),
            &value.to_string(),
        )
    }

    pub fn write_submit_try_count(&self, job_id: &JobId, value: u32) -> Result<()> {
        self.write_atomic(
            &self.job_dir(job_id).join(SUBMIT_TRY_COUNT_FILE),
            &value.to_string(),
        )
    }

    pub fn append_finished_record(&self, record: &FinishedRecord) -> Result<()> {
        self.append_line(&self.finished_log_path(), &record.to_line())
    }

    pub fn read_finished_records(&self) -> Result<Vec<FinishedRecord>> {
        let Some(mut reader) = LogBlockReader::open(&self.finished_log_path())? else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        while let Some(block) = reader.next_block()? {
            for line in block {
                if let Some(record) = FinishedRecord::parse(&line) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    pub fn read_finished_ids(&self) -> Result<BTreeSet<JobId>> {
        Ok(self
            .read_finished_records()?
            .into_iter()
            .map(|record| record.job_id)
            .collect())
    }

    pub fn find_finished_record(&self, job_id: &JobId) -> Result<Option<FinishedRecord>> {
        Ok(self
            .read_finished_records()?
            .into_iter()
            .rev()
            .find(|record| &record.job_id == job_id))
    }

    /// Drops the per-job scratch files once a job reaches a terminal status.
    /// Result data and tag files stay until housekeeping retires the
    /// directory.
    pub fn remove_job_scratch_files(&self, job_id: &JobId) -> Result<()> {
        let dir = self.job_dir(job_id);
        for name in [
            REMOTE_QUEUE_FILE,
            PENDING_SEQ_FILE,
            RESUBMIT_COUNT_FILE,
            SUBMIT_TRY_COUNT_FILE,
        ] {
            match fs::remove_file(dir.join(name)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    pub fn remove_result_dir(&self, job_id: &JobId) -> Result<()> {
        let dir = self.job_dir(job_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn archive_name(path: &Path) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "log".to_string());
        path.with_file_name(format!("{name}.{stamp}"))
    }

    /// Rotates `path` once it exceeds `threshold` bytes: renamed with a
    /// timestamp suffix, a fresh file starts on the next append.
    pub fn archive_plain_log(&self, path: &Path, threshold: u64) -> Result<bool> {
        let len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if len <= threshold {
            return Ok(false);
        }
        let archived = Self::archive_name(path);
        fs::rename(path, &archived)?;
        info!(from = %path.display(), to = %archived.display(), "archived log file");
        Ok(true)
    }

    /// Rotates the run log, then re-appends the latest record of every
    /// still-in-flight job to the fresh file so the ledger's working set
    /// survives the rotation.
    pub fn archive_run_log(&self, threshold: u64) -> Result<bool> {
        let path = self.run_log_path();
        let len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if len <= threshold {
            return Ok(false);
        }
        let carryover: Vec<RunLogRecord> = self
            .read_latest_records()?
            .into_iter()
            .filter(|record| !record.status.is_terminal())
            .collect();
        let archived = Self::archive_name(&path);
        fs::rename(&path, &archived)?;
        for record in &carryover {
            self.append_run_record(record)?;
        }
        info!(
            from = %path.display(),
            to = %archived.display(),
            carried = carryover.len(),
            "archived run log"
        );
        Ok(true)
    }
}
