//! Query cache for API reads.
//!
//! - Serves fresh entries without touching the network
//! - Shares one fetch between concurrent readers of a key
//! - Invalidates by key prefix after successful writes
//! - Evicts unobserved entries after their retention window, and the least
//!   recently used ones once the cache is full

mod layer;
mod storage;
mod traits;

pub use layer::QueryClient;
pub use storage::DEFAULT_MAX_ENTRIES;
pub use traits::{Cacheable, Freshness, KeyPart, QueryKey};
