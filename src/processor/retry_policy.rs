use crate::data_model::Job;

/// What the lifecycle engine should do with a job after a failed dispatch
/// attempt or a remote-queue timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try the submission again on the next cycle.
    RetryNextCycle,
    /// Re-dispatch the job's remaining work; the resubmit count has been
    /// consumed.
    Resubmit,
    /// The resubmit budget is exhausted; finalize as failed.
    Fail,
}

/// Determines the retry path for a job based on its attempt counters and
/// the configured bounds, updating the job accordingly.
pub struct ResubmitPolicy;

impl ResubmitPolicy {
    /// A transient submission failure. Retried next cycle until the
    /// submit-try budget is spent, at which point it converts into one
    /// resubmission-eligible failure and the try counter resets.
    pub fn on_submit_failure(job: &mut Job, max_submit_tries: u32, max_resubmit: u32) -> RetryDecision {
        job.submit_try_count += 1;
        if job.submit_try_count < max_submit_tries {
            return RetryDecision::RetryNextCycle;
        }
        job.submit_try_count = 0;
        Self::on_resubmission_eligible(job, max_resubmit)
    }

    /// The job sat in the remote queue longer than the configured maximum.
    pub fn on_remote_timeout(job: &mut Job, max_resubmit: u32) -> RetryDecision {
        Self::on_resubmission_eligible(job, max_resubmit)
    }

    fn on_resubmission_eligible(job: &mut Job, max_resubmit: u32) -> RetryDecision {
        if job.resubmit_count < max_resubmit {
            job.resubmit_count += 1;
            RetryDecision::Resubmit
        } else {
            RetryDecision::Fail
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::test_objects::tests::mock_job;

    #[test]
    fn submit_failures_retry_until_the_try_budget_is_spent() {
        let mut job = mock_job("rst_1", 1);
        assert_eq!(
            ResubmitPolicy::on_submit_failure(&mut job, 3, 2),
            RetryDecision::RetryNextCycle
        );
        assert_eq!(
            ResubmitPolicy::on_submit_failure(&mut job, 3, 2),
            RetryDecision::RetryNextCycle
        );
        // third failed try converts to a resubmission and resets the counter
        assert_eq!(
            ResubmitPolicy::on_submit_failure(&mut job, 3, 2),
            RetryDecision::Resubmit
        );
        assert_eq!(job.submit_try_count, 0);
        assert_eq!(job.resubmit_count, 1);
    }

    #[test]
    fn timeouts_resubmit_up_to_the_bound_then_fail() {
        let mut job = mock_job("rst_1", 1);
        assert_eq!(
            ResubmitPolicy::on_remote_timeout(&mut job, 2),
            RetryDecision::Resubmit
        );
        assert_eq!(
            ResubmitPolicy::on_remote_timeout(&mut job, 2),
            RetryDecision::Resubmit
        );
        assert_eq!(job.resubmit_count, 2);
        assert_eq!(
            ResubmitPolicy::on_remote_timeout(&mut job, 2),
            RetryDecision::Fail
        );
        // the bound is never exceeded
        assert_eq!(job.resubmit_count, 2);
    }
}
