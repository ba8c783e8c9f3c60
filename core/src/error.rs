use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("BUSYGROUP consumer group '{group}' already exists on stream '{stream}'")]
    BusyGroup { stream: String, group: String },

    #[error("NOGROUP no consumer group '{group}' on stream '{stream}'")]
    NoSuchGroup { stream: String, group: String },

    #[error("Stream '{stream}' does not exist")]
    NoSuchStream { stream: String },

    #[error("Invalid stream id '{raw}'")]
    InvalidStreamId { raw: String },

    #[error("Feature vector has {actual} values, model expects {expected}")]
    FeatureShape { expected: usize, actual: usize },

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Training set is empty")]
    EmptyTrainingSet,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
