use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Error taxonomy for the dispatch daemon.
///
/// Every per-job error is contained within that job's lifecycle pass; only
/// `FatalStartup` terminates the process.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Malformed registry or configuration. The affected feature is skipped
    /// for the current cycle.
    #[error("config error: {0}")]
    Config(String),

    /// Network or remote-queue hiccup. Retried up to the configured submit
    /// tries, then counted as one resubmission-eligible failure.
    #[error("transient remote error: {0}")]
    TransientRemote(String),

    /// The job content is invalid or the remote side reported an
    /// unrecoverable failure. The job is finalized as failed.
    #[error("permanent job error: {0}")]
    PermanentJob(String),

    /// A log or job-directory file could not be read or written. Logged and
    /// skipped; the loop keeps running.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Startup could not complete (single-instance lock held elsewhere).
    #[error("fatal startup error: {0}")]
    FatalStartup(String),
}
