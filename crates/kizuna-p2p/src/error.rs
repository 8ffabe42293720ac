use thiserror::Error;

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("identity error: {0}")]
    Identity(String),

    #[error("envelope error: {0}")]
    Envelope(String),

    #[error("overlay error: {0}")]
    Overlay(String),

    #[error("cannot leave the default topic")]
    DefaultTopic,

    #[error("not joined to topic: {0}")]
    TopicNotFound(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task not found: {0}")]
    TaskNotFound(uuid::Uuid),

    #[error("node already shut down")]
    Shutdown,

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for P2pError {
    fn from(e: std::io::Error) -> Self {
        P2pError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for P2pError {
    fn from(e: serde_json::Error) -> Self {
        P2pError::Envelope(e.to_string())
    }
}
