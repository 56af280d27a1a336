// Export components
pub mod cache_service;
pub mod ics_feed;

// Re-export the handles callers wire together
pub use cache_service::CacheHandle;
pub use ics_feed::{QueryEngine, SourceFetcher};
