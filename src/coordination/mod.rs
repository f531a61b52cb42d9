//! Coordination service access
//!
//! - [`client`]: the client capability consumed from a coordination service
//! - [`memory`]: an in-process coordination service
//! - [`session`]: reconnecting session wrapper used by the lock backend

pub mod client;
pub mod memory;
pub mod session;

pub use client::{ClientError, CoordinationClient, Connector, CreateMode, WatchEvent, Watcher};
pub use memory::MemoryCoordinator;
pub use session::CoordinationSession;
