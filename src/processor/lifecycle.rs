use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::{
    config::DispatcherConfig,
    data_model::{Job, JobId, JobStatus, NodeConfig, NodeId, RemoteHandle, RemoteQueueEntry, SeqIndex},
    error::{DispatchError, Result},
    processor::{
        admission::CapacityTable,
        retry_policy::{ResubmitPolicy, RetryDecision},
    },
    remote::{ComputeClient, Notifier, PollStatus},
    state_store::{JobLogStore, FINISH_TAG_FILE, START_TAG_FILE},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    pub jobs_seen: usize,
    pub submitted_seqs: usize,
    pub polled_handles: usize,
    pub finalized: usize,
    pub skipped_locked: usize,
}

/// A job's dispatch state for one lifecycle pass, reconstructed from the
/// job directory: sequences still waiting locally, live remote-queue
/// entries, and per-sequence outcomes collected so far.
struct DispatchView {
    pending: Vec<SeqIndex>,
    live: Vec<RemoteQueueEntry>,
    finished: BTreeMap<SeqIndex, bool>,
}

fn completion_outcome(finished: &BTreeMap<SeqIndex, bool>) -> JobStatus {
    let succeeded = finished.values().filter(|ok| **ok).count();
    if succeeded == finished.len() {
        JobStatus::FinishedSuccess
    } else if succeeded > 0 {
        JobStatus::FinishedPartial
    } else {
        JobStatus::FinishedFailed
    }
}

/// Drives every tracked job through submit, poll, timeout and finalize once
/// per cycle. All state is reconstructed from the durable logs at the start
/// of the pass; one job's failure never aborts the cycle for the others.
pub struct JobLifecycleEngine {
    store: Arc<JobLogStore>,
    client: Arc<dyn ComputeClient>,
    notifier: Arc<dyn Notifier>,
}

impl JobLifecycleEngine {
    pub fn new(
        store: Arc<JobLogStore>,
        client: Arc<dyn ComputeClient>,
        notifier: Arc<dyn Notifier>,
    ) -> JobLifecycleEngine {
        JobLifecycleEngine {
            store,
            client,
            notifier,
        }
    }

    pub async fn run_cycle(
        &self,
        config: &DispatcherConfig,
        registry: &[NodeConfig],
    ) -> Result<CycleStats> {
        let mut stats = CycleStats::default();
        let mut jobs = self.store.read_in_flight_jobs()?;
        let finished_ids = self.store.read_finished_ids()?;
        stats.jobs_seen = jobs.len();

        // per-node in-flight counts come from the durable remote-queue
        // indexes, not from any in-memory counter
        let mut counts: BTreeMap<NodeId, usize> = BTreeMap::new();
        for job in &jobs {
            match self.load_dispatch_view(job) {
                Ok(view) => {
                    for entry in &view.live {
                        *counts.entry(entry.node.clone()).or_insert(0) += 1;
                    }
                }
                Err(err) => {
                    warn!(
                        job_id = %job.id,
                        error = %err,
                        "cannot read dispatch state for capacity accounting"
                    );
                }
            }
        }
        let mut capacity = CapacityTable::build(registry, &counts, config.max_submit_jobs_per_node);
        debug!(?counts, "rebuilt per-node in-flight counts");

        for job in &mut jobs {
            if let Err(err) = self
                .process_job(config, &mut capacity, &finished_ids, job, &mut stats)
                .await
            {
                error!(job_id = %job.id, error = %err, "lifecycle pass failed for job");
            }
        }
        Ok(stats)
    }

    async fn process_job(
        &self,
        config: &DispatcherConfig,
        capacity: &mut CapacityTable,
        finished_ids: &BTreeSet<JobId>,
        job: &mut Job,
        stats: &mut CycleStats,
    ) -> Result<()> {
        if finished_ids.contains(&job.id) {
            return self.repair_terminal_record(job).await;
        }

        if !self.store.acquire_job_lock(&job.id)? {
            info!(job_id = %job.id, "job lock present, skipping this cycle");
            stats.skipped_locked += 1;
            return Ok(());
        }
        let result = self.process_job_locked(config, capacity, job, stats).await;
        if let Err(err) = self.store.release_job_lock(&job.id) {
            warn!(job_id = %job.id, error = %err, "failed to release job lock");
        }
        result
    }

    async fn process_job_locked(
        &self,
        config: &DispatcherConfig,
        capacity: &mut CapacityTable,
        job: &mut Job,
        stats: &mut CycleStats,
    ) -> Result<()> {
        let mut view = self.load_dispatch_view(job)?;

        if job.status == JobStatus::QueuedLocal && !view.live.is_empty() {
            // entries landed but the status record never did (crash window)
            job.status = JobStatus::SubmittedRemote;
            self.store.append_run_record(&job.to_record(None))?;
        }

        if !config.debug_no_submit && !view.pending.is_empty() && capacity.has_available_node() {
            self.submit_pending(config, capacity, job, &mut view, stats)
                .await?;
            if job.status == JobStatus::FinishedFailed {
                return self.finalize(job, JobStatus::FinishedFailed, stats).await;
            }
        }

        if job.status.is_dispatched() && !view.live.is_empty() {
            self.poll_dispatched(job, &mut view, stats).await?;
        }

        if job.status.is_dispatched() && view.finished.len() as u32 >= job.num_seq {
            let outcome = completion_outcome(&view.finished);
            return self.finalize(job, outcome, stats).await;
        }

        if job.status.is_dispatched() && self.check_timeout(config, job, &mut view)? {
            warn!(job_id = %job.id, "resubmit budget exhausted after remote queue timeout");
            return self.finalize(job, JobStatus::FinishedFailed, stats).await;
        }

        Ok(())
    }

    fn load_dispatch_view(&self, job: &Job) -> Result<DispatchView> {
        let finished = self.store.read_finished_seqs(&job.id)?;
        let entries = self.store.read_remote_queue_index(&job.id)?;
        let pending: Vec<SeqIndex> = match self.store.read_pending_seqs(&job.id)? {
            Some(seqs) => seqs
                .into_iter()
                .filter(|seq| !finished.contains_key(seq))
                .collect(),
            // no pending file yet: everything not dispatched and not
            // finished still waits locally
            None => {
                let dispatched: BTreeSet<SeqIndex> =
                    entries.iter().map(|entry| entry.seq_index).collect();
                (0..job.num_seq)
                    .filter(|seq| !finished.contains_key(seq) && !dispatched.contains(seq))
                    .collect()
            }
        };
        let pending_set: BTreeSet<SeqIndex> = pending.iter().copied().collect();
        let live = entries
            .into_iter()
            .filter(|entry| {
                !finished.contains_key(&entry.seq_index) && !pending_set.contains(&entry.seq_index)
            })
            .collect();
        Ok(DispatchView {
            pending,
            live,
            finished,
        })
    }

    /// First-fit packs pending sequences onto nodes with spare capacity.
    /// One submit call per node batch; every dispatched sequence gets its
    /// own remote-queue entry under the returned handle.
    async fn submit_pending(
        &self,
        config: &DispatcherConfig,
        capacity: &mut CapacityTable,
        job: &mut Job,
        view: &mut DispatchView,
        stats: &mut CycleStats,
    ) -> Result<()> {
        for node_id in capacity.node_ids() {
            if view.pending.is_empty() {
                break;
            }
            let room = capacity.remaining_capacity(&node_id);
            if room == 0 {
                continue;
            }
            let batch: Vec<SeqIndex> = view.pending.iter().copied().take(room).collect();
            match self.client.submit(&job.id, &node_id, &batch).await {
                Ok(handle) => {
                    let now = Utc::now();
                    let entries: Vec<RemoteQueueEntry> = batch
                        .iter()
                        .map(|seq| RemoteQueueEntry {
                            seq_index: *seq,
                            node: node_id.clone(),
                            remote_handle: handle.clone(),
                            seq_file: format!("seq_{seq}.fa"),
                            dispatch_date: Some(now),
                        })
                        .collect();
                    self.store.append_remote_queue_entries(&job.id, &entries)?;
                    view.pending.retain(|seq| !batch.contains(seq));
                    self.store.write_pending_seqs(&job.id, &view.pending)?;
                    view.live.extend(entries);
                    capacity.reserve(&node_id, batch.len());
                    stats.submitted_seqs += batch.len();
                    if job.submit_try_count != 0 {
                        job.submit_try_count = 0;
                        self.store.write_submit_try_count(&job.id, 0)?;
                    }
                    if job.status == JobStatus::QueuedLocal {
                        job.status = JobStatus::SubmittedRemote;
                        self.store.append_run_record(&job.to_record(None))?;
                    }
                    info!(
                        job_id = %job.id,
                        node = %node_id,
                        sequences = batch.len(),
                        handle = %handle,
                        "dispatched sequence batch"
                    );
                }
                Err(DispatchError::PermanentJob(reason)) => {
                    warn!(job_id = %job.id, reason = %reason, "remote rejected job permanently");
                    job.status = JobStatus::FinishedFailed;
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        job_id = %job.id,
                        node = %node_id,
                        error = %err,
                        "submission attempt failed"
                    );
                    match ResubmitPolicy::on_submit_failure(
                        job,
                        config.max_submit_tries,
                        config.max_resubmit,
                    ) {
                        RetryDecision::RetryNextCycle => {
                            self.store
                                .write_submit_try_count(&job.id, job.submit_try_count)?;
                        }
                        RetryDecision::Resubmit => {
                            self.store.write_submit_try_count(&job.id, 0)?;
                            self.store
                                .write_resubmit_count(&job.id, job.resubmit_count)?;
                            info!(
                                job_id = %job.id,
                                resubmit_count = job.resubmit_count,
                                "submit tries exhausted, counted as one resubmission"
                            );
                        }
                        RetryDecision::Fail => {
                            job.status = JobStatus::FinishedFailed;
                        }
                    }
                    // no point trying further nodes this cycle
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn poll_dispatched(
        &self,
        job: &mut Job,
        view: &mut DispatchView,
        stats: &mut CycleStats,
    ) -> Result<()> {
        let mut by_handle: BTreeMap<RemoteHandle, Vec<SeqIndex>> = BTreeMap::new();
        for entry in &view.live {
            by_handle
                .entry(entry.remote_handle.clone())
                .or_default()
                .push(entry.seq_index);
        }
        for (handle, seqs) in by_handle {
            stats.polled_handles += 1;
            match self.client.poll(&handle).await {
                Ok(PollStatus::Pending) => {}
                Ok(PollStatus::Started) => self.mark_started(job)?,
                Ok(PollStatus::Finished(results)) => {
                    // a finished batch implies it started
                    self.mark_started(job)?;
                    let fresh: Vec<(SeqIndex, bool)> = results
                        .iter()
                        .filter(|r| {
                            seqs.contains(&r.seq_index) && !view.finished.contains_key(&r.seq_index)
                        })
                        .map(|r| (r.seq_index, r.succeeded))
                        .collect();
                    if !fresh.is_empty() {
                        self.store.append_finished_seqs(&job.id, &fresh)?;
                        view.finished.extend(fresh.iter().copied());
                    }
                }
                Err(DispatchError::PermanentJob(reason)) => {
                    warn!(
                        job_id = %job.id,
                        handle = %handle,
                        reason = %reason,
                        "remote reported unrecoverable failure"
                    );
                    let failed: Vec<(SeqIndex, bool)> = seqs
                        .iter()
                        .filter(|seq| !view.finished.contains_key(seq))
                        .map(|seq| (*seq, false))
                        .collect();
                    if !failed.is_empty() {
                        self.store.append_finished_seqs(&job.id, &failed)?;
                        view.finished.extend(failed.iter().copied());
                    }
                }
                Err(err) => {
                    warn!(
                        job_id = %job.id,
                        handle = %handle,
                        error = %err,
                        "poll failed, retrying next cycle"
                    );
                }
            }
        }
        view.live
            .retain(|entry| !view.finished.contains_key(&entry.seq_index));
        Ok(())
    }

    /// The start tag is written when the first result arrives; writing is a
    /// no-op when the file already exists.
    fn mark_started(&self, job: &mut Job) -> Result<()> {
        self.store.write_tag_file(&job.id, START_TAG_FILE)?;
        if job.status == JobStatus::SubmittedRemote {
            job.status = JobStatus::Running;
            self.store.append_run_record(&job.to_record(None))?;
            info!(job_id = %job.id, "job started on remote node");
        }
        Ok(())
    }

    /// Returns true when the resubmit budget is exhausted and the job must
    /// be finalized as failed.
    fn check_timeout(
        &self,
        config: &DispatcherConfig,
        job: &mut Job,
        view: &mut DispatchView,
    ) -> Result<bool> {
        let Some(oldest) = view.live.iter().filter_map(|entry| entry.dispatch_date).min() else {
            return Ok(false);
        };
        if Utc::now().signed_duration_since(oldest) <= config.remote_queue_timeout() {
            return Ok(false);
        }
        match ResubmitPolicy::on_remote_timeout(job, config.max_resubmit) {
            RetryDecision::Resubmit => {
                warn!(
                    job_id = %job.id,
                    resubmit_count = job.resubmit_count,
                    "remote queue timeout, sequences returned for resubmission"
                );
                self.store
                    .write_resubmit_count(&job.id, job.resubmit_count)?;
                let mut pending = view.pending.clone();
                pending.extend(view.live.iter().map(|entry| entry.seq_index));
                pending.sort_unstable();
                pending.dedup();
                self.store.write_pending_seqs(&job.id, &pending)?;
                view.pending = pending;
                view.live.clear();
                if job.status == JobStatus::Running {
                    job.status = JobStatus::SubmittedRemote;
                }
                self.store.append_run_record(&job.to_record(None))?;
                Ok(false)
            }
            RetryDecision::Fail => Ok(true),
            // timeouts never ask for a plain retry
            RetryDecision::RetryNextCycle => Ok(false),
        }
    }

    /// Exactly-once finalization: the finished-log record is the guard. The
    /// notification goes out after the record is durable, so a replayed log
    /// can never notify twice.
    async fn finalize(
        &self,
        job: &mut Job,
        outcome: JobStatus,
        stats: &mut CycleStats,
    ) -> Result<()> {
        job.status = outcome;
        let now = Utc::now();
        self.store.write_tag_file(&job.id, FINISH_TAG_FILE)?;
        self.store.append_run_record(&job.to_record(Some(now)))?;
        self.store
            .append_finished_record(&job.to_finished_record(now))?;
        self.store.remove_job_scratch_files(&job.id)?;
        stats.finalized += 1;
        info!(job_id = %job.id, status = %outcome, "job finalized");
        if let Err(err) = self.notifier.notify(&job.id, outcome, &job.email).await {
            warn!(job_id = %job.id, error = %err, "owner notification failed");
        }
        Ok(())
    }

    /// The finished log already holds a terminal record for this job but the
    /// run log does not (crash between the two appends): re-append the
    /// terminal run record without re-notifying.
    async fn repair_terminal_record(&self, job: &mut Job) -> Result<()> {
        let Some(record) = self.store.find_finished_record(&job.id)? else {
            return Ok(());
        };
        warn!(job_id = %job.id, "run log lags the finished log, repairing terminal record");
        job.status = record.status;
        self.store.append_run_record(&job.to_record(record.finish_date))?;
        self.store.remove_job_scratch_files(&job.id)?;
        Ok(())
    }
}
