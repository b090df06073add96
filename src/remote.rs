use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::{
    data_model::{JobId, JobStatus, NodeId, RemoteHandle, SeqIndex},
    error::{DispatchError, Result},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqResult {
    pub seq_index: SeqIndex,
    pub succeeded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Still waiting in the remote queue.
    Pending,
    /// The node has produced its first output chunk.
    Started,
    /// Every sequence under the handle is terminal.
    Finished(Vec<SeqResult>),
}

/// The remote job-submission collaborator. At-least-once semantics: a
/// resubmission after a timeout must not corrupt node-side state.
#[async_trait]
pub trait ComputeClient: Send + Sync {
    async fn submit(
        &self,
        job_id: &JobId,
        node: &NodeId,
        seqs: &[SeqIndex],
    ) -> Result<RemoteHandle>;

    async fn poll(&self, handle: &RemoteHandle) -> Result<PollStatus>;
}

/// Owner notification collaborator. Fire-and-forget: failures are logged by
/// the caller and never block the loop.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, job_id: &JobId, outcome: JobStatus, recipient: &str) -> Result<()>;
}

/// Default notifier: records the notification in the daemon log. Actual
/// email delivery belongs to the portal's mail collaborator.
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, job_id: &JobId, outcome: JobStatus, recipient: &str) -> Result<()> {
        info!(job_id = %job_id, outcome = %outcome, recipient, "job outcome notification");
        Ok(())
    }
}

/// Bridges submission and polling to site-provided executables, the way the
/// portal's other transports are shelled out to.
///
/// `submit_command jobid node seq_csv` prints the remote handle on stdout.
/// `poll_command handle` prints `pending`, `started`, `failed <reason>`, or
/// `finished` followed by one `seq<TAB>ok|fail` line per sequence.
pub struct CommandComputeClient {
    submit_command: String,
    poll_command: String,
}

impl CommandComputeClient {
    pub fn new(submit_command: String, poll_command: String) -> CommandComputeClient {
        CommandComputeClient {
            submit_command,
            poll_command,
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|err| {
                DispatchError::TransientRemote(format!("cannot run {program}: {err}"))
            })?;
        if !output.status.success() {
            return Err(DispatchError::TransientRemote(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ComputeClient for CommandComputeClient {
    async fn submit(
        &self,
        job_id: &JobId,
        node: &NodeId,
        seqs: &[SeqIndex],
    ) -> Result<RemoteHandle> {
        let seq_csv = seqs
            .iter()
            .map(|seq| seq.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let stdout = self
            .run(&self.submit_command, &[job_id.get(), node.get(), &seq_csv])
            .await?;
        let handle = stdout.lines().next().unwrap_or_default().trim();
        if handle.is_empty() {
            return Err(DispatchError::TransientRemote(
                "submit command returned no remote handle".to_string(),
            ));
        }
        Ok(RemoteHandle::from(handle))
    }

    async fn poll(&self, handle: &RemoteHandle) -> Result<PollStatus> {
        let stdout = self.run(&self.poll_command, &[handle.get()]).await?;
        let mut lines = stdout.lines();
        let first = lines.next().unwrap_or_default().trim();
        if first == "pending" {
            return Ok(PollStatus::Pending);
        }
        if first == "started" {
            return Ok(PollStatus::Started);
        }
        if let Some(reason) = first.strip_prefix("failed") {
            return Err(DispatchError::PermanentJob(reason.trim().to_string()));
        }
        if first == "finished" {
            let mut results = Vec::new();
            for line in lines {
                let mut fields = line.split('\t');
                let (Some(seq), Some(flag)) = (fields.next(), fields.next()) else {
                    continue;
                };
                let Ok(seq_index) = seq.trim().parse::<SeqIndex>() else {
                    continue;
                };
                results.push(SeqResult {
                    seq_index,
                    succeeded: flag.trim() == "ok",
                });
            }
            return Ok(PollStatus::Finished(results));
        }
        Err(DispatchError::TransientRemote(format!(
            "poll command printed unrecognized status {first:?}"
        )))
    }
}
