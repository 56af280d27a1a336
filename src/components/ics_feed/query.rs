use super::expand::Expander;
use super::fetcher::SourceFetcher;
use super::models::{CalendarSource, Occurrence, QueryWindow};
use crate::error::{Error, FeedResult};
use crate::utils::time::default_window;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{info, warn};

/// Default number of returned occurrences
pub const DEFAULT_LIMIT: usize = 50;

/// Default window length when `to` is not given
pub const DEFAULT_RANGE_DAYS: i64 = 30;

/// Caller-facing query parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Case-insensitive source name; all sources when absent
    pub source: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Case-insensitive substring tested against summary, description and location
    pub search: Option<String>,
    pub limit: Option<usize>,
}

/// Merged, ordered and truncated query outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub events: Vec<Occurrence>,
    /// Matches before truncation
    pub total_count: usize,
    pub returned_count: usize,
    /// One `"{source}: {error}"` entry per failed source
    pub warnings: Vec<String>,
}

/// Outcome of an explicit cache invalidation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub invalidated: usize,
    pub repopulated: usize,
    pub warnings: Vec<String>,
}

/// Fans queries out over the configured sources and merges the results
pub struct QueryEngine {
    fetcher: SourceFetcher,
    expander: Expander,
    sources: Vec<CalendarSource>,
    default_limit: usize,
    default_range_days: i64,
}

impl QueryEngine {
    pub fn new(fetcher: SourceFetcher, expander: Expander, sources: Vec<CalendarSource>) -> Self {
        Self {
            fetcher,
            expander,
            sources,
            default_limit: DEFAULT_LIMIT,
            default_range_days: DEFAULT_RANGE_DAYS,
        }
    }

    /// Override the default limit and window length
    pub fn with_defaults(mut self, limit: usize, range_days: i64) -> Self {
        self.default_limit = limit;
        self.default_range_days = range_days;
        self
    }

    /// Sources matching `name`, or every source when no name is given.
    ///
    /// A name that matches nothing is an error; an empty configuration is not.
    pub fn select_sources(&self, name: Option<&str>) -> FeedResult<Vec<CalendarSource>> {
        let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
            return Ok(self.sources.clone());
        };

        let selected: Vec<CalendarSource> = self
            .sources
            .iter()
            .filter(|s| s.name.eq_ignore_ascii_case(name))
            .cloned()
            .collect();

        if selected.is_empty() {
            return Err(Error::SourceNotFound(name.to_string()));
        }

        Ok(selected)
    }

    /// Run a query across the selected sources.
    ///
    /// Per-source failures become warnings. Cancelling `cancel` aborts all
    /// in-flight work and discards whatever already finished.
    pub async fn query(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> FeedResult<QueryResult> {
        let selected = self.select_sources(request.source.as_deref())?;
        let window = default_window(request.from, request.to, self.default_range_days, Utc::now());
        let limit = request.limit.unwrap_or(self.default_limit);

        info!(
            sources = selected.len(),
            from = %window.from,
            to = %window.to,
            "Running calendar query"
        );

        let outcomes = self.collect(&selected, window, cancel).await?;

        let mut events = Vec::new();
        let mut warnings = Vec::new();
        for (source, outcome) in selected.iter().zip(outcomes) {
            match outcome {
                Ok(occurrences) => events.extend(occurrences),
                Err(message) => {
                    warn!(source = %source.name, error = %message, "Calendar source failed");
                    warnings.push(format!("{}: {}", source.name, message));
                }
            }
        }

        if let Some(needle) = request.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let needle = needle.to_lowercase();
            events.retain(|event| event.matches_text(&needle));
        }

        // Stable: ties keep source order
        events.sort_by_key(|event| event.start);

        let total_count = events.len();
        events.truncate(limit);

        Ok(QueryResult {
            returned_count: events.len(),
            total_count,
            events,
            warnings,
        })
    }

    /// One task per source; results come back in source order.
    ///
    /// Tasks are aborted when the token fires or when this future is dropped,
    /// e.g. by a caller-side timeout.
    async fn collect(
        &self,
        sources: &[CalendarSource],
        window: QueryWindow,
        cancel: &CancellationToken,
    ) -> FeedResult<Vec<Result<Vec<Occurrence>, String>>> {
        let tasks: Vec<_> = sources
            .iter()
            .cloned()
            .map(|source| {
                let fetcher = self.fetcher.clone();
                let expander = self.expander;
                AbortOnDropHandle::new(tokio::spawn(async move {
                    let document = fetcher.resolve(&source).await?;
                    Ok::<_, Error>(expander.expand(&document, &window, &source.name))
                }))
            })
            .collect();

        tokio::select! {
            biased;
            // Leaving the select drops the pending join and aborts every task
            _ = cancel.cancelled() => {
                info!("Calendar query cancelled");
                Err(Error::Cancelled)
            }
            results = join_all(tasks) => {
                Ok(results
                    .into_iter()
                    .map(|joined| match joined {
                        Ok(Ok(occurrences)) => Ok(occurrences),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(e) => Err(format!("Task failed: {}", e)),
                    })
                    .collect())
            }
        }
    }

    /// Drop cached documents for the selected sources, optionally fetching them again
    pub async fn refresh(
        &self,
        source: Option<&str>,
        repopulate: bool,
    ) -> FeedResult<RefreshReport> {
        let selected = self.select_sources(source)?;
        let mut report = RefreshReport::default();

        for source in &selected {
            match self.fetcher.invalidate(source).await {
                Ok(()) => report.invalidated += 1,
                Err(e) => report.warnings.push(format!("{}: {}", source.name, e)),
            }
        }

        if repopulate {
            let results =
                join_all(selected.iter().map(|source| self.fetcher.resolve(source))).await;
            for (source, result) in selected.iter().zip(results) {
                match result {
                    Ok(_) => report.repopulated += 1,
                    Err(e) => {
                        warn!(source = %source.name, error = %e, "Failed to repopulate calendar");
                        report.warnings.push(format!("{}: {}", source.name, e));
                    }
                }
            }
        }

        info!(
            invalidated = report.invalidated,
            repopulated = report.repopulated,
            "Calendar cache refreshed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::cache_service::{CacheHandle, CacheStore};
    use crate::components::ics_feed::fetcher::FeedTransport;
    use crate::error::fetch_error;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Serves canned bodies by URL; unknown URLs answer 404
    struct MapTransport {
        bodies: HashMap<String, String>,
        delay: Option<Duration>,
        /// Fetches that got past the delay
        completed: AtomicUsize,
    }

    impl MapTransport {
        fn new(bodies: Vec<(&str, String)>, delay: Option<Duration>) -> Self {
            Self {
                bodies: bodies.into_iter().map(|(u, b)| (u.to_string(), b)).collect(),
                delay,
                completed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FeedTransport for MapTransport {
        async fn fetch_text(&self, url: &str) -> FeedResult<String> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.completed.fetch_add(1, Ordering::SeqCst);
            self.bodies
                .get(url)
                .cloned()
                .ok_or_else(|| fetch_error(Some(404), "HTTP 404 Not Found"))
        }
    }

    fn feed(events: &[(&str, &str, &str)]) -> String {
        let mut text = String::from("BEGIN:VCALENDAR\r\nVERSION:2.0\r\n");
        for (uid, start, summary) in events {
            text.push_str(&format!(
                "BEGIN:VEVENT\r\nUID:{}\r\nDTSTART:{}\r\nSUMMARY:{}\r\nEND:VEVENT\r\n",
                uid, start, summary
            ));
        }
        text.push_str("END:VCALENDAR\r\n");
        text
    }

    fn engine(
        dir: &TempDir,
        bodies: Vec<(&str, String)>,
        sources: Vec<CalendarSource>,
        delay: Option<Duration>,
    ) -> QueryEngine {
        engine_with(dir, Arc::new(MapTransport::new(bodies, delay)), sources)
    }

    fn engine_with(
        dir: &TempDir,
        transport: Arc<MapTransport>,
        sources: Vec<CalendarSource>,
    ) -> QueryEngine {
        let cache = CacheHandle::spawn(CacheStore::new(dir.path()));
        let fetcher = SourceFetcher::new(transport, cache);
        QueryEngine::new(fetcher, Expander::default(), sources)
    }

    fn january() -> QueryRequest {
        QueryRequest {
            from: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            to: Some(Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap()),
            ..QueryRequest::default()
        }
    }

    #[tokio::test]
    async fn test_partial_failure_becomes_warning() {
        let dir = TempDir::new().unwrap();
        let engine = engine(
            &dir,
            vec![
                ("https://a.test/a.ics", feed(&[("a1", "20240105T090000Z", "Alpha")])),
                ("https://b.test/b.ics", feed(&[("b1", "20240103T090000Z", "Beta")])),
            ],
            vec![
                CalendarSource::new("a", "https://a.test/a.ics"),
                CalendarSource::new("broken", "https://c.test/c.ics"),
                CalendarSource::new("b", "https://b.test/b.ics"),
            ],
            None,
        );

        let result = engine.query(&january(), &CancellationToken::new()).await.unwrap();

        assert_eq!(result.total_count, 2);
        assert_eq!(result.events[0].summary, "Beta");
        assert_eq!(result.events[1].source_name, "a");
        assert_eq!(
            result.warnings,
            vec!["broken: Failed to fetch calendar: HTTP 404 Not Found"]
        );
    }

    #[tokio::test]
    async fn test_sort_and_limit() {
        let dir = TempDir::new().unwrap();
        let events: Vec<(String, String)> = (1..=7)
            .rev()
            .map(|day| (format!("e{}", day), format!("202401{:02}T120000Z", day)))
            .collect();
        let refs: Vec<(&str, &str, &str)> = events
            .iter()
            .map(|(u, s)| (u.as_str(), s.as_str(), "Event"))
            .collect();
        let engine = engine(
            &dir,
            vec![("https://a.test/a.ics", feed(&refs))],
            vec![CalendarSource::new("a", "https://a.test/a.ics")],
            None,
        );

        let request = QueryRequest {
            limit: Some(5),
            ..january()
        };
        let result = engine.query(&request, &CancellationToken::new()).await.unwrap();

        assert_eq!(result.total_count, 7);
        assert_eq!(result.returned_count, 5);
        let uids: Vec<_> = result.events.iter().map(|e| e.uid.as_str()).collect();
        assert_eq!(uids, vec!["e1", "e2", "e3", "e4", "e5"]);
    }

    #[tokio::test]
    async fn test_search_and_source_filter() {
        let dir = TempDir::new().unwrap();
        let engine = engine(
            &dir,
            vec![
                (
                    "https://a.test/a.ics",
                    feed(&[
                        ("a1", "20240105T090000Z", "Dentist"),
                        ("a2", "20240106T090000Z", "Gym"),
                    ]),
                ),
                ("https://b.test/b.ics", feed(&[("b1", "20240103T090000Z", "Dentist again")])),
            ],
            vec![
                CalendarSource::new("Home", "https://a.test/a.ics"),
                CalendarSource::new("Work", "https://b.test/b.ics"),
            ],
            None,
        );

        let request = QueryRequest {
            source: Some("home".to_string()),
            search: Some("DENT".to_string()),
            ..january()
        };
        let result = engine.query(&request, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.total_count, 1);
        assert_eq!(result.events[0].uid, "a1");
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_source_is_an_error() {
        let dir = TempDir::new().unwrap();
        let sources = vec![CalendarSource::new("Home", "https://a.test/a.ics")];
        let engine = engine(&dir, vec![], sources, None);

        let request = QueryRequest {
            source: Some("nope".to_string()),
            ..january()
        };
        let err = engine.query(&request, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::SourceNotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_no_sources_is_empty_result() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, vec![], vec![], None);

        let result = engine.query(&january(), &CancellationToken::new()).await.unwrap();
        assert_eq!(result.total_count, 0);
        assert!(result.events.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_discards_results() {
        let dir = TempDir::new().unwrap();
        let engine = engine(
            &dir,
            vec![("https://a.test/a.ics", feed(&[("a1", "20240105T090000Z", "Slow")]))],
            vec![CalendarSource::new("a", "https://a.test/a.ics")],
            Some(Duration::from_secs(30)),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = engine.query(&january(), &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_dropped_query_aborts_fetches() {
        let dir = TempDir::new().unwrap();
        let url = "https://a.test/a.ics";
        let transport = Arc::new(MapTransport::new(
            vec![(url, feed(&[("a1", "20240105T090000Z", "Slow")]))],
            Some(Duration::from_millis(100)),
        ));
        let engine = engine_with(&dir, transport.clone(), vec![CalendarSource::new("a", url)]);

        let cancel = CancellationToken::new();
        let deadline = Duration::from_millis(20);
        let outcome = tokio::time::timeout(deadline, engine.query(&january(), &cancel)).await;
        assert!(outcome.is_err());

        // Well past the transport delay; an orphaned task would have finished by now
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(transport.completed.load(Ordering::SeqCst), 0);
        assert!(CacheStore::new(dir.path()).get(url).is_none());
    }

    #[tokio::test]
    async fn test_refresh_reports_counts() {
        let dir = TempDir::new().unwrap();
        let engine = engine(
            &dir,
            vec![("https://a.test/a.ics", feed(&[("a1", "20240105T090000Z", "Alpha")]))],
            vec![
                CalendarSource::new("a", "https://a.test/a.ics"),
                CalendarSource::new("gone", "https://gone.test/x.ics"),
            ],
            None,
        );

        let report = engine.refresh(None, true).await.unwrap();
        assert_eq!(report.invalidated, 2);
        assert_eq!(report.repopulated, 1);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("gone: "));

        let report = engine.refresh(Some("A"), false).await.unwrap();
        assert_eq!(report.invalidated, 1);
        assert_eq!(report.repopulated, 0);
    }
}
