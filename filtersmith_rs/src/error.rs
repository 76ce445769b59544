use thiserror::Error;

/// Job-level failure taxonomy surfaced by the coordinator and service.
///
/// Plumbing inside the engine stays on `anyhow`; anything that reaches
/// this type has already been classified. Transport and persistence
/// failures arrive through the `From<anyhow::Error>` conversion.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("configuration {0} not found")]
    ConfigurationNotFound(u64),

    #[error("job {0} stopped by user signal")]
    StoppedByUser(String),

    #[error("external optimizer exited with {status:?}: {stderr}")]
    SubprocessFailure { status: Option<i32>, stderr: String },

    #[error("job {0} is already owned by another coordinator")]
    AlreadyRunning(String),

    #[error("invalid job plan: {0}")]
    InvalidPlan(String),

    #[error("transport or persistence failure: {0:#}")]
    Transport(#[from] anyhow::Error),
}

impl JobError {
    /// Only infrastructure failures are worth another attempt; user stops,
    /// missing configurations and bad plans fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Transport(_))
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, JobError::StoppedByUser(_))
    }

    pub(crate) fn invalid_plan(error: anyhow::Error) -> Self {
        JobError::InvalidPlan(format!("{error:#}"))
    }
}
