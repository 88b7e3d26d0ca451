pub mod lru;
pub mod sharded;

pub use lru::{CacheHandle, LruCache, DEFAULT_CHARGE, DEFAULT_TOTAL_CHARGE};
pub use sharded::ShardedLruCache;
