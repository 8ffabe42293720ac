use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP server error: {0}")]
    Http(#[from] std::io::Error),

    #[error("bridge error: {0}")]
    Bridge(#[from] kizuna_p2p::P2pError),

    #[error("storage error: {0}")]
    Storage(String),
}
