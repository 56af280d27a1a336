//! Remote iCalendar feeds: fetching, repair, parsing, recurrence expansion and
//! the aggregated query over all configured sources.

pub mod expand;
pub mod fetcher;
pub mod models;
pub mod parser;
pub mod query;
pub mod rrule;
pub mod sanitize;
pub mod time;

pub use expand::Expander;
pub use fetcher::{FeedTransport, HttpTransport, SourceFetcher};
pub use models::{
    CalendarSource, Document, EventTime, Occurrence, QueryWindow, RawComponent, RawEvent,
};
pub use query::{QueryEngine, QueryRequest, QueryResult, RefreshReport};
