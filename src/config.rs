use crate::components::ics_feed::models::CalendarSource;
use crate::components::ics_feed::query::{DEFAULT_LIMIT, DEFAULT_RANGE_DAYS};
use crate::components::ics_feed::fetcher::{DEFAULT_TIMEOUT_SECS, DEFAULT_USER_AGENT};
use crate::error::{config_error, env_error, FeedResult};
use chrono_tz::Tz;
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::info;
use url::Url;

/// Default location of the source list
pub const DEFAULT_CONFIG_PATH: &str = "config/calendars.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configured calendar feeds, in display order
    #[serde(default)]
    pub sources: Vec<CalendarSource>,
    /// IANA timezone for date-only and floating values
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Directory for cached documents
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_range_days")]
    pub default_range_days: i64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timezone() -> String {
    String::from("UTC")
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_range_days() -> i64 {
    DEFAULT_RANGE_DAYS
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            timezone: default_timezone(),
            cache_dir: None,
            request_timeout_secs: default_timeout(),
            default_limit: default_limit(),
            default_range_days: default_range_days(),
            user_agent: default_user_agent(),
        }
    }
}

impl Config {
    /// Load configuration from environment and config file
    pub fn load() -> FeedResult<Self> {
        // Load .env file if it exists
        dotenv().ok();

        let path = env::var("CALFEED_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(Path::new(&path))?;

        if let Ok(timezone) = env::var("TIMEZONE") {
            config.timezone = timezone;
        }
        if let Ok(dir) = env::var("CALFEED_CACHE_DIR") {
            config.cache_dir = Some(PathBuf::from(dir));
        }
        if let Ok(secs) = env::var("CALFEED_TIMEOUT_SECS") {
            config.request_timeout_secs = secs
                .parse::<u64>()
                .map_err(|_| env_error("CALFEED_TIMEOUT_SECS"))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file; a missing file means no sources
    pub fn from_file(path: &Path) -> FeedResult<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "No calendar config found, starting without sources");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_toml_str(content: &str) -> FeedResult<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check names, URLs and timezone
    pub fn validate(&self) -> FeedResult<()> {
        self.tz()?;

        let mut seen = HashSet::new();
        for source in &self.sources {
            let name = source.name.trim();
            if name.is_empty() {
                return Err(config_error("Source name must not be empty"));
            }
            if !seen.insert(name.to_lowercase()) {
                return Err(config_error(&format!("Duplicate source name: {}", name)));
            }

            let url = Url::parse(source.url.trim())
                .map_err(|e| config_error(&format!("Invalid URL for {}: {}", name, e)))?;
            if !matches!(url.scheme(), "http" | "https" | "webcal") {
                return Err(config_error(&format!(
                    "Unsupported URL scheme for {}: {}",
                    name,
                    url.scheme()
                )));
            }
        }

        if self.default_limit == 0 {
            return Err(config_error("default_limit must be positive"));
        }
        if self.default_range_days <= 0 {
            return Err(config_error("default_range_days must be positive"));
        }

        Ok(())
    }

    /// Configured default timezone
    pub fn tz(&self) -> FeedResult<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| config_error(&format!("Unknown timezone: {}", self.timezone)))
    }

    /// Cache directory, falling back to the platform cache dir
    pub fn cache_path(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(env::temp_dir)
                .join("calfeed")
        })
    }
}
