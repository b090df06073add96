use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::{
    config::DispatcherConfig,
    data_model::{
        test_objects::tests::mock_run_record, JobId, JobStatus, NodeConfig, NodeId, RemoteHandle,
        RemoteQueueEntry, SeqIndex,
    },
    error::{DispatchError, Result},
    node_registry,
    processor::{
        dispatch_loop::DispatchLoop,
        housekeeping::HousekeepingScheduler,
        lifecycle::{CycleStats, JobLifecycleEngine},
    },
    remote::{ComputeClient, Notifier, PollStatus},
    state_store::JobLogStore,
};

#[derive(Debug, Clone, Copy)]
pub enum SubmitBehavior {
    Accept,
    Transient,
    Permanent,
}

/// Scriptable in-memory compute collaborator. Submissions mint `rh-<n>`
/// handles; polls answer `Pending` unless a response was programmed.
pub struct MockComputeClient {
    pub submissions: Mutex<Vec<(JobId, NodeId, Vec<SeqIndex>)>>,
    pub submit_attempts: Mutex<usize>,
    pub polled: Mutex<Vec<RemoteHandle>>,
    behavior: Mutex<SubmitBehavior>,
    poll_responses: Mutex<HashMap<RemoteHandle, PollStatus>>,
    next_handle: AtomicU64,
}

impl MockComputeClient {
    pub fn new() -> Arc<MockComputeClient> {
        Arc::new(MockComputeClient {
            submissions: Mutex::new(Vec::new()),
            submit_attempts: Mutex::new(0),
            polled: Mutex::new(Vec::new()),
            behavior: Mutex::new(SubmitBehavior::Accept),
            poll_responses: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn set_submit_behavior(&self, behavior: SubmitBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn set_poll(&self, handle: &RemoteHandle, status: PollStatus) {
        self.poll_responses
            .lock()
            .unwrap()
            .insert(handle.clone(), status);
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    pub fn poll_count(&self) -> usize {
        self.polled.lock().unwrap().len()
    }

    pub fn last_handle(&self) -> RemoteHandle {
        let n = self.next_handle.load(Ordering::SeqCst);
        RemoteHandle::from(format!("rh-{}", n - 1).as_str())
    }
}

#[async_trait]
impl ComputeClient for MockComputeClient {
    async fn submit(
        &self,
        job_id: &JobId,
        node: &NodeId,
        seqs: &[SeqIndex],
    ) -> Result<RemoteHandle> {
        *self.submit_attempts.lock().unwrap() += 1;
        match *self.behavior.lock().unwrap() {
            SubmitBehavior::Accept => {
                let n = self.next_handle.fetch_add(1, Ordering::SeqCst);
                let handle = RemoteHandle::from(format!("rh-{n}").as_str());
                self.submissions
                    .lock()
                    .unwrap()
                    .push((job_id.clone(), node.clone(), seqs.to_vec()));
                Ok(handle)
            }
            SubmitBehavior::Transient => Err(DispatchError::TransientRemote(
                "mock queue hiccup".to_string(),
            )),
            SubmitBehavior::Permanent => Err(DispatchError::PermanentJob(
                "mock rejects job content".to_string(),
            )),
        }
    }

    async fn poll(&self, handle: &RemoteHandle) -> Result<PollStatus> {
        self.polled.lock().unwrap().push(handle.clone());
        Ok(self
            .poll_responses
            .lock()
            .unwrap()
            .get(handle)
            .cloned()
            .unwrap_or(PollStatus::Pending))
    }
}

pub struct RecordingNotifier {
    pub notifications: Mutex<Vec<(JobId, JobStatus, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<RecordingNotifier> {
        Arc::new(RecordingNotifier {
            notifications: Mutex::new(Vec::new()),
        })
    }

    pub fn count(&self) -> usize {
        self.notifications.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, job_id: &JobId, outcome: JobStatus, recipient: &str) -> Result<()> {
        self.notifications
            .lock()
            .unwrap()
            .push((job_id.clone(), outcome, recipient.to_string()));
        Ok(())
    }
}

/// One daemon's worth of state over a temp directory, with scriptable
/// collaborators.
pub struct TestEnv {
    pub config: DispatcherConfig,
    pub store: Arc<JobLogStore>,
    pub client: Arc<MockComputeClient>,
    pub notifier: Arc<RecordingNotifier>,
    pub engine: JobLifecycleEngine,
    _temp_dir: tempfile::TempDir,
}

impl TestEnv {
    pub fn new() -> TestEnv {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = DispatcherConfig {
            data_dir: temp_dir.path().to_path_buf(),
            node_registry_path: temp_dir.path().join("computenode.txt"),
            instance_lock_path: temp_dir.path().join("dispatchd.lock"),
            max_submit_jobs_per_node: 2,
            sleep_interval_secs: 1,
            ..Default::default()
        };
        std::fs::create_dir_all(config.result_dir()).unwrap();
        std::fs::create_dir_all(config.log_dir()).unwrap();

        let store = Arc::new(JobLogStore::new(config.log_dir(), config.result_dir()));
        let client = MockComputeClient::new();
        let notifier = RecordingNotifier::new();
        let engine = JobLifecycleEngine::new(
            store.clone(),
            client.clone() as Arc<dyn ComputeClient>,
            notifier.clone() as Arc<dyn Notifier>,
        );
        TestEnv {
            config,
            store,
            client,
            notifier,
            engine,
            _temp_dir: temp_dir,
        }
    }

    pub fn write_registry(&self, content: &str) {
        std::fs::write(&self.config.node_registry_path, content).unwrap();
    }

    pub fn registry(&self) -> Vec<NodeConfig> {
        node_registry::load(&self.config.node_registry_path).unwrap_or_default()
    }

    /// What the external intake does: log a new job as queued.
    pub fn enqueue_job(&self, id: &str, num_seq: u32) {
        self.store
            .append_run_record(&mock_run_record(id, JobStatus::QueuedLocal, num_seq))
            .unwrap();
    }

    /// Puts a job directly into the dispatched state with entries aged
    /// `age_secs` seconds, as if a batch had been submitted earlier.
    pub fn force_dispatched(&self, id: &str, node: &str, handle: &str, num_seq: u32, age_secs: i64) {
        let job_id = JobId::from(id);
        self.store
            .append_run_record(&mock_run_record(id, JobStatus::SubmittedRemote, num_seq))
            .unwrap();
        let dispatch_date = Utc::now() - Duration::seconds(age_secs);
        let entries: Vec<RemoteQueueEntry> = (0..num_seq)
            .map(|seq| RemoteQueueEntry {
                seq_index: seq,
                node: NodeId::from(node),
                remote_handle: RemoteHandle::from(handle),
                seq_file: format!("seq_{seq}.fa"),
                dispatch_date: Some(dispatch_date),
            })
            .collect();
        self.store
            .append_remote_queue_entries(&job_id, &entries)
            .unwrap();
        self.store.write_pending_seqs(&job_id, &[]).unwrap();
    }

    pub async fn run_cycle(&self) -> CycleStats {
        self.engine
            .run_cycle(&self.config, &self.registry())
            .await
            .unwrap()
    }

    /// Latest run-log status for a job, terminal records included.
    pub fn job_status(&self, id: &str) -> Option<JobStatus> {
        let job_id = JobId::from(id);
        self.store
            .read_latest_records()
            .unwrap()
            .into_iter()
            .find(|record| record.job_id == job_id)
            .map(|record| record.status)
    }

    pub fn make_loop(&self) -> DispatchLoop {
        let engine = JobLifecycleEngine::new(
            self.store.clone(),
            self.client.clone() as Arc<dyn ComputeClient>,
            self.notifier.clone() as Arc<dyn Notifier>,
        );
        DispatchLoop::new(
            self.config.clone(),
            None,
            engine,
            HousekeepingScheduler::new(self.store.clone()),
        )
    }
}
