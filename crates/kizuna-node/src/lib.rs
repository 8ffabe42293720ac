pub mod a2a;
pub mod auth;
pub mod config;
pub mod error;
pub mod http;
pub mod node;
pub mod store;

pub use config::NodeConfig;
pub use error::NodeError;
pub use http::AppState;
pub use store::{BlobDrive, InMemoryDrive, InMemoryLog, MemoryLog};
