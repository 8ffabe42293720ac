pub mod config;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod inbox;
pub mod node;
pub mod overlay;
pub mod peer;
pub mod protocol;
pub mod tasks;

mod reaper;
mod session;

pub use config::{BridgeConfig, BridgeTiming};
pub use envelope::SignedEnvelope;
pub use error::P2pError;
pub use identity::NodeIdentity;
pub use inbox::InboxMessage;
pub use node::{BridgeHandle, BridgeNode, NodeEvent, SubmitOutcome};
pub use overlay::{memory::MemoryDht, ConnectionSource, NewPeer, DEFAULT_TOPIC};
pub use peer::PeerView;
pub use protocol::types::{
    Manifest, PeerMessage, Priority, TaskPayload, TaskRequestMsg, TaskResponseMsg, TaskStatus,
    TaskType,
};
pub use tasks::{DeadLetter, NewTask, ReceivedTask, SentTask};
