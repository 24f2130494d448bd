use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(u64),

    #[error("Job queue is full ({0} jobs)")]
    QueueFull(usize),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Unknown load-balancing algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GridError>;
