//! Hierarchical lock manager
//!
//! Layers, from the caller down:
//! - [`manager`]: per-thread facade with multi-key ordering and critical sections
//! - [`service`]: service registration and crash cleanup on top of the facade
//! - [`pool`] and [`gate`]: shared per-key gates with FIFO admission
//! - [`object`]: per-key process-level counts over a backend's global lock
//! - [`backend`]: memory, file and coordination-service backends
//! - [`local`]: per-thread re-entrancy counts

pub mod backend;
pub mod gate;
pub mod local;
pub mod manager;
pub mod object;
pub mod pool;
pub mod service;


pub use backend::{GlobalLock, LockBackend};
pub use local::{LocalLock, LocalLockTable};
pub use manager::{LockManager, LockService};
pub use service::ServiceCleanup;
