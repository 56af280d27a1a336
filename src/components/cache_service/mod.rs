mod actor;
pub mod store;

pub use actor::{CacheActor, CacheCommand, CacheHandle};
pub use store::{cache_key, CacheStore, CachedDocument, CACHE_TTL_SECS};
