use crate::components::cache_service::{CacheHandle, CacheStore};
use crate::components::ics_feed::{Expander, HttpTransport, QueryEngine, SourceFetcher};
use crate::config::Config;
use crate::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize logging with environment-based configuration
pub fn init_logging() -> miette::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn")),
        )
        // stdout carries the JSON result
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Other(format!("Failed to set up logging: {}", e)))?;

    Ok(())
}

/// Load the application config
pub fn load_config() -> miette::Result<Config> {
    match Config::load() {
        Ok(config) => Ok(config),
        Err(e) => {
            error!("Failed to load configuration: {:?}", e);
            Err(e.into())
        }
    }
}

/// Wire the cache actor, HTTP transport and query engine together
pub fn build_engine(config: &Config) -> miette::Result<(QueryEngine, CacheHandle)> {
    let tz = config.tz()?;
    let cache_dir = config.cache_path();
    info!(
        sources = config.sources.len(),
        timezone = %tz,
        cache_dir = %cache_dir.display(),
        "Starting calendar engine"
    );

    let cache = CacheHandle::spawn(CacheStore::new(cache_dir));
    let transport = HttpTransport::new(
        Duration::from_secs(config.request_timeout_secs),
        &config.user_agent,
    )?;
    let fetcher = SourceFetcher::new(Arc::new(transport), cache.clone());

    let engine = QueryEngine::new(fetcher, Expander::new(tz), config.sources.clone())
        .with_defaults(config.default_limit, config.default_range_days);

    Ok((engine, cache))
}
