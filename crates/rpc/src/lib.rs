//! RPC surface of the Agent: one command table served over a local Unix
//! socket and a network WebSocket, plus the client used to reach either.

pub mod client;
pub mod handlers;
pub mod local;
pub mod network;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

pub use client::RpcClient;
pub use local::LocalListener;
pub use network::NetworkListener;
pub use peer::RpcPeerLink;
pub use protocol::{Frame, MAX_FRAME_LEN};
pub use registry::{CommandRegistry, Scope};
pub use session::{spawn_in_process, Session, SessionContext};
pub use transport::{bind_with_retry, start, Listener, Transports};
