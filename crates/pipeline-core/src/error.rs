use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("not initialized: run 'pipeline init'")]
    NotInitialized,

    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    #[error("'{program}' timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("'{program}' exited with {status}: {output}")]
    CommandFailed {
        program: String,
        status: String,
        output: String,
    },

    #[error("unexpected output from {source_name}: {reason}")]
    UnexpectedOutput { source_name: String, reason: String },

    #[error("backlog request failed: {0}")]
    Backlog(String),

    #[error("backlog API key not set: export {0}")]
    MissingApiKey(String),

    #[error("invalid lock record: {0}")]
    InvalidLock(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
