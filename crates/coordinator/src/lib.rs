pub mod client;
pub mod link;
pub mod protocol;

pub use client::CoordinatorClient;
pub use link::{CoordinatorLink, HttpCoordinator};
pub use protocol::{CoordinatorCommand, PingReport, PingResponse};
