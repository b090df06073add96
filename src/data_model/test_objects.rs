#[cfg(test)]
pub mod tests {
    use chrono::Utc;

    use crate::data_model::{
        Job, JobBuilder, JobStatus, NodeConfig, NodeId, QueueMethod, RunLogRecord,
    };

    pub const TEST_EMAIL: &str = "user@example.org";
    pub const TEST_NODE: &str = "10.0.0.1";

    pub fn mock_node(id: &str) -> NodeConfig {
        NodeConfig {
            id: NodeId::from(id),
            queue_method: QueueMethod::Direct,
        }
    }

    pub fn mock_registry(ids: &[&str]) -> Vec<NodeConfig> {
        ids.iter().map(|id| mock_node(id)).collect()
    }

    pub fn mock_job(id: &str, num_seq: u32) -> Job {
        JobBuilder::default()
            .id(id)
            .email(TEST_EMAIL)
            .job_name(format!("job {id}"))
            .ip("192.0.2.1")
            .app("topology")
            .method("wsdl")
            .num_seq(num_seq)
            .num_seq_this_user(num_seq)
            .submit_date(Some(Utc::now()))
            .build()
            .unwrap()
    }

    pub fn mock_run_record(id: &str, status: JobStatus, num_seq: u32) -> RunLogRecord {
        let mut job = mock_job(id, num_seq);
        job.status = status;
        job.to_record(None)
    }
}
