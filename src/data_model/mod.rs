pub mod test_objects;

use std::fmt::{self, Display};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Index of one sequence within a job's query set.
pub type SeqIndex = u32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct JobId(String);

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl JobId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct NodeId(String);

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl NodeId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

/// Opaque identifier a compute node returns for one dispatched batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct RemoteHandle(String);

impl Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl RemoteHandle {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RemoteHandle {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

/// How jobs are handed to a compute node.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QueueMethod {
    Slurm,
    Direct,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    QueuedLocal,
    SubmittedRemote,
    Running,
    FinishedSuccess,
    FinishedPartial,
    FinishedFailed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::FinishedSuccess | JobStatus::FinishedPartial | JobStatus::FinishedFailed
        )
    }

    /// True once at least one batch has been handed to a compute node.
    pub fn is_dispatched(&self) -> bool {
        matches!(self, JobStatus::SubmittedRemote | JobStatus::Running)
    }
}

/// One compute node as described by the registry file. Rebuilt every cycle,
/// never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub id: NodeId,
    pub queue_method: QueueMethod,
}

pub fn format_datetime(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Lenient timestamp parsing: RFC 3339 first, then the legacy
/// `%Y-%m-%d %H:%M:%S` form (assumed UTC). Anything else is `None`, and
/// consumers must treat `None` conservatively.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn opt_datetime_field(t: &Option<DateTime<Utc>>) -> String {
    t.as_ref().map(format_datetime).unwrap_or_default()
}

/// One line of the run-job log: the authoritative, append-only ledger from
/// which in-memory job state is reconstructed at the start of each cycle.
///
/// Tab-separated, at least 11 fields:
/// `jobid status jobname ip email numseq method submit_date finish_date app
/// numseq_this_user`. The latest record per job id wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLogRecord {
    pub job_id: JobId,
    pub status: JobStatus,
    pub job_name: String,
    pub ip: String,
    pub email: String,
    pub num_seq: u32,
    pub method: String,
    pub submit_date: Option<DateTime<Utc>>,
    pub finish_date: Option<DateTime<Utc>>,
    pub app: String,
    pub num_seq_this_user: u32,
}

impl RunLogRecord {
    /// Parses one log line. Short or malformed lines yield `None` and are
    /// skipped by readers.
    pub fn parse(line: &str) -> Option<RunLogRecord> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 11 || fields[0].is_empty() {
            return None;
        }
        let status = fields[1].parse::<JobStatus>().ok()?;
        Some(RunLogRecord {
            job_id: JobId::from(fields[0]),
            status,
            job_name: fields[2].to_string(),
            ip: fields[3].to_string(),
            email: fields[4].to_string(),
            num_seq: fields[5].parse().unwrap_or(1).max(1),
            method: fields[6].to_string(),
            submit_date: parse_datetime(fields[7]),
            finish_date: parse_datetime(fields[8]),
            app: fields[9].to_string(),
            num_seq_this_user: fields[10].parse().unwrap_or(1).max(1),
        })
    }

    pub fn to_line(&self) -> String {
        [
            self.job_id.to_string(),
            self.status.to_string(),
            self.job_name.clone(),
            self.ip.clone(),
            self.email.clone(),
            self.num_seq.to_string(),
            self.method.clone(),
            opt_datetime_field(&self.submit_date),
            opt_datetime_field(&self.finish_date),
            self.app.clone(),
            self.num_seq_this_user.to_string(),
        ]
        .join("\t")
    }
}

/// One dispatched unit of work, one line of a job's remote-queue index file.
///
/// Tab-separated, at least 5 fields:
/// `seq_index node remote_handle seq_file dispatch_date`. Append-only; a
/// later entry for the same sequence index supersedes the earlier one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteQueueEntry {
    pub seq_index: SeqIndex,
    pub node: NodeId,
    pub remote_handle: RemoteHandle,
    pub seq_file: String,
    pub dispatch_date: Option<DateTime<Utc>>,
}

impl RemoteQueueEntry {
    pub fn parse(line: &str) -> Option<RemoteQueueEntry> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 5 {
            return None;
        }
        let seq_index = fields[0].parse::<SeqIndex>().ok()?;
        if fields[1].is_empty() || fields[2].is_empty() {
            return None;
        }
        Some(RemoteQueueEntry {
            seq_index,
            node: NodeId::from(fields[1]),
            remote_handle: RemoteHandle::from(fields[2]),
            seq_file: fields[3].to_string(),
            dispatch_date: parse_datetime(fields[4]),
        })
    }

    pub fn to_line(&self) -> String {
        [
            self.seq_index.to_string(),
            self.node.to_string(),
            self.remote_handle.to_string(),
            self.seq_file.clone(),
            opt_datetime_field(&self.dispatch_date),
        ]
        .join("\t")
    }
}

/// One line of the finished-job log, appended exactly once per job at
/// finalization. Field 8 is the finish date housekeeping keys on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedRecord {
    pub job_id: JobId,
    pub status: JobStatus,
    pub job_name: String,
    pub ip: String,
    pub email: String,
    pub num_seq: u32,
    pub method: String,
    pub submit_date: Option<DateTime<Utc>>,
    pub finish_date: Option<DateTime<Utc>>,
    pub app: String,
}

impl FinishedRecord {
    pub fn parse(line: &str) -> Option<FinishedRecord> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 9 || fields[0].is_empty() {
            return None;
        }
        let status = fields[1].parse::<JobStatus>().ok()?;
        Some(FinishedRecord {
            job_id: JobId::from(fields[0]),
            status,
            job_name: fields[2].to_string(),
            ip: fields[3].to_string(),
            email: fields[4].to_string(),
            num_seq: fields[5].parse().unwrap_or(1).max(1),
            method: fields[6].to_string(),
            submit_date: parse_datetime(fields[7]),
            finish_date: parse_datetime(fields[8]),
            app: fields.get(9).unwrap_or(&"").to_string(),
        })
    }

    pub fn to_line(&self) -> String {
        [
            self.job_id.to_string(),
            self.status.to_string(),
            self.job_name.clone(),
            self.ip.clone(),
            self.email.clone(),
            self.num_seq.to_string(),
            self.method.clone(),
            opt_datetime_field(&self.submit_date),
            opt_datetime_field(&self.finish_date),
            self.app.clone(),
        ]
        .join("\t")
    }
}

/// One tracked job, reconstructed from its latest run-log record plus the
/// durable per-job counters at the start of each cycle.
#[derive(Debug, Clone, Builder)]
pub struct Job {
    #[builder(setter(into))]
    pub id: JobId,
    #[builder(setter(into), default)]
    pub email: String,
    #[builder(setter(into), default)]
    pub job_name: String,
    #[builder(setter(into), default)]
    pub ip: String,
    #[builder(setter(into), default)]
    pub app: String,
    #[builder(setter(into), default)]
    pub method: String,
    #[builder(default = "1")]
    pub num_seq: u32,
    #[builder(default = "1")]
    pub num_seq_this_user: u32,
    #[builder(default)]
    pub submit_date: Option<DateTime<Utc>>,
    #[builder(default = "JobStatus::QueuedLocal")]
    pub status: JobStatus,
    #[builder(default)]
    pub resubmit_count: u32,
    #[builder(default)]
    pub submit_try_count: u32,
}

impl Job {
    pub fn from_record(record: &RunLogRecord) -> Job {
        Job {
            id: record.job_id.clone(),
            email: record.email.clone(),
            job_name: record.job_name.clone(),
            ip: record.ip.clone(),
            app: record.app.clone(),
            method: record.method.clone(),
            num_seq: record.num_seq,
            num_seq_this_user: record.num_seq_this_user,
            submit_date: record.submit_date,
            status: record.status,
            resubmit_count: 0,
            submit_try_count: 0,
        }
    }

    pub fn to_record(&self, finish_date: Option<DateTime<Utc>>) -> RunLogRecord {
        RunLogRecord {
            job_id: self.id.clone(),
            status: self.status,
            job_name: self.job_name.clone(),
            ip: self.ip.clone(),
            email: self.email.clone(),
            num_seq: self.num_seq,
            method: self.method.clone(),
            submit_date: self.submit_date,
            finish_date,
            app: self.app.clone(),
            num_seq_this_user: self.num_seq_this_user,
        }
    }

    pub fn to_finished_record(&self, finish_date: DateTime<Utc>) -> FinishedRecord {
        FinishedRecord {
            job_id: self.id.clone(),
            status: self.status,
            job_name: self.job_name.clone(),
            ip: self.ip.clone(),
            email: self.email.clone(),
            num_seq: self.num_seq,
            method: self.method.clone(),
            submit_date: self.submit_date,
            finish_date: Some(finish_date),
            app: self.app.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trips_through_wire_names() {
        for status in [
            JobStatus::QueuedLocal,
            JobStatus::SubmittedRemote,
            JobStatus::Running,
            JobStatus::FinishedSuccess,
            JobStatus::FinishedPartial,
            JobStatus::FinishedFailed,
        ] {
            let name = status.to_string();
            assert_eq!(name.parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!(
            "submitted_remote".parse::<JobStatus>().unwrap(),
            JobStatus::SubmittedRemote
        );
        assert!(JobStatus::FinishedPartial.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Running.is_dispatched());
        assert!(!JobStatus::QueuedLocal.is_dispatched());
    }

    #[test]
    fn run_log_record_round_trips() {
        let record = RunLogRecord {
            job_id: JobId::from("rst_x9K2f"),
            status: JobStatus::Running,
            job_name: "membrane scan".to_string(),
            ip: "192.0.2.17".to_string(),
            email: "user@example.org".to_string(),
            num_seq: 12,
            method: "wsdl".to_string(),
            submit_date: parse_datetime("2026-02-01 10:00:00"),
            finish_date: None,
            app: "topology".to_string(),
            num_seq_this_user: 30,
        };
        let parsed = RunLogRecord::parse(&record.to_line()).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn short_or_malformed_run_log_lines_are_skipped() {
        assert!(RunLogRecord::parse("").is_none());
        assert!(RunLogRecord::parse("rst_1\tqueued_local\tonly three").is_none());
        // unknown status
        let line = "rst_1\texploded\tn\tip\te\t1\tm\t\t\tapp\t1";
        assert!(RunLogRecord::parse(line).is_none());
        // empty job id
        let line = "\tqueued_local\tn\tip\te\t1\tm\t\t\tapp\t1";
        assert!(RunLogRecord::parse(line).is_none());
    }

    #[test]
    fn unparsable_numeric_fields_default_to_one() {
        let line = "rst_1\tqueued_local\tn\tip\te\tnot-a-number\tm\t\t\tapp\t0";
        let record = RunLogRecord::parse(line).unwrap();
        assert_eq!(record.num_seq, 1);
        assert_eq!(record.num_seq_this_user, 1);
    }

    #[test]
    fn remote_queue_entry_round_trips_and_rejects_short_lines() {
        let entry = RemoteQueueEntry {
            seq_index: 3,
            node: NodeId::from("10.0.0.5"),
            remote_handle: RemoteHandle::from("rh-779"),
            seq_file: "seq_3.fa".to_string(),
            dispatch_date: parse_datetime("2026-02-01T10:00:00Z"),
        };
        assert_eq!(RemoteQueueEntry::parse(&entry.to_line()).unwrap(), entry);
        assert!(RemoteQueueEntry::parse("3\tnode").is_none());
        assert!(RemoteQueueEntry::parse("nan\tnode\trh\tf\t2026-02-01T10:00:00Z").is_none());
    }

    #[test]
    fn datetime_parsing_is_lenient() {
        let rfc = parse_datetime("2026-02-01T10:00:00Z").unwrap();
        let legacy = parse_datetime("2026-02-01 10:00:00").unwrap();
        assert_eq!(rfc, legacy);
        assert!(parse_datetime("").is_none());
        assert!(parse_datetime("last tuesday").is_none());
    }

    #[test]
    fn job_builder_applies_defaults() {
        let job = JobBuilder::default().id("rst_1").build().unwrap();
        assert_eq!(job.status, JobStatus::QueuedLocal);
        assert_eq!(job.num_seq, 1);
        assert_eq!(job.resubmit_count, 0);
    }
}
