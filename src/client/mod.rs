//! Lock client side: the per-process lock cache.

mod cache;

pub use cache::{LockClientCache, LockClientConfig, LockReleaseUser, LockState};
