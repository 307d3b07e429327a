pub mod hash;
pub mod index;
pub mod staging;
pub mod store;

pub use hash::{content_hash, is_content_hash};
pub use store::{CacheCommand, CacheStats, ChannelBlob, ChannelStore, MaintenanceReport};
