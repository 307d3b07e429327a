pub mod config;
pub mod error;
pub mod message;
pub mod paths;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use message::PushMessage;
pub use paths::Paths;
pub use types::{
    AgentState, ChannelKey, ConnectionHandle, JobFailure, JobState, PeerInfo, RemoteIdentity,
    TransportKind, TrustStatus,
};

/// Version string reported to the coordinator and on `Status`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
