//! Query result caching
//!
//! [`GeneralCache`] is the process-wide store; [`QueryCache`] layers
//! transaction visibility and cross-process invalidation on top of it.

pub mod general;
pub mod manager;

pub use general::{CachedObject, GeneralCache};
pub use manager::{CacheTransactions, QueryCache, QueryDescription, cache_lock_key, stamp_key};
