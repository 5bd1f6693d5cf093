use thiserror::Error;

pub type Result<T> = std::result::Result<T, MonitorError>;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Job queue store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A job ID resolved to more than one persisted task
    #[error("there are more than one task with the same job ID {job_id} ({count} tasks)")]
    DuplicateTasks { job_id: String, count: usize },

    #[error("Task error: {0}")]
    Task(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MonitorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MonitorError::NotFound(_))
    }

    /// HTTP status the API layer answers with
    pub fn status_code(&self) -> u16 {
        match self {
            MonitorError::NotFound(_) => 404,
            MonitorError::BadRequest(_) => 400,
            _ => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            MonitorError::NotFound(_) => "NOT_FOUND",
            MonitorError::BadRequest(_) => "BAD_REQUEST",
            _ => "UNKNOWN",
        }
    }
}
