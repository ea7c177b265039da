//! Page/feed sources and the pure parsing core: field extraction, layout
//! normalization, timeline reconstruction and current-conditions mapping.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;
use wxh_core::City;
use wxh_storage::{FetchError, HttpFetcher};

pub mod current;
pub mod extract;
pub mod layout;
pub mod page;
pub mod timeline;

pub use current::{
    map_current_observations, observation_time, parse_current_feed, station_index, FeedError,
    FeedRow,
};
pub use extract::{extract_label, extract_value, extract_whole_number};
pub use layout::{normalize_rows, ColumnMap, LayoutKind, NormalizedRow, NormalizedTable, RawEntry};
pub use page::{parse_forecast_page, split_entry_text, ForecastPage};
pub use timeline::{
    build_timeline, month_from_name, parse_anchor_label, resolve_anchor_year, Anchor, ScrapeTime,
};

pub const CRATE_NAME: &str = "wxh-adapters";

/// Structural problems with a forecast page. Any of these abandons the city
/// for the current cycle.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error("expected {expected} forecast rows, found {found}")]
    RowCount { expected: usize, found: usize },
    #[error("{layout:?} layout expects {expected} columns, found {found}")]
    ColumnCount {
        layout: LayoutKind,
        expected: usize,
        found: usize,
    },
    #[error("row {row}: hour cell {value:?} is not a clock time")]
    InvalidHour { row: usize, value: Option<String> },
    #[error("day label missing from page")]
    MissingAnchor,
    #[error("day label {0:?} has no day and month")]
    MalformedAnchor(String),
    #[error("unknown month name {0:?}")]
    UnknownMonth(String),
    #[error("{year}-{month:02}-{day:02} {hour:02}:00 is not a valid date")]
    InvalidAnchorDate {
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
    },
}

impl ParseError {
    /// Short stable label for logs and failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Selector(_) => "selector",
            Self::RowCount { .. } => "row_count",
            Self::ColumnCount { .. } => "column_count",
            Self::InvalidHour { .. } => "invalid_hour",
            Self::MissingAnchor => "missing_anchor",
            Self::MalformedAnchor(_) => "malformed_anchor",
            Self::UnknownMonth(_) => "unknown_month",
            Self::InvalidAnchorDate { .. } => "invalid_anchor_date",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where raw page and feed text comes from.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch_forecast_page(
        &self,
        ctx: &FetchContext,
        city: &City,
    ) -> Result<String, SourceError>;

    async fn fetch_current_feed(&self, ctx: &FetchContext) -> Result<String, SourceError>;
}

pub struct HttpPageSource {
    http: HttpFetcher,
    current_feed_url: String,
}

impl HttpPageSource {
    pub fn new(http: HttpFetcher, current_feed_url: impl Into<String>) -> Self {
        Self {
            http,
            current_feed_url: current_feed_url.into(),
        }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    fn describe(&self) -> String {
        format!("http (feed {})", self.current_feed_url)
    }

    async fn fetch_forecast_page(
        &self,
        ctx: &FetchContext,
        city: &City,
    ) -> Result<String, SourceError> {
        let response = self
            .http
            .fetch_bytes(ctx.run_id, &city_slug(&city.display_name), &city.page_address)
            .await?;
        Ok(response.text())
    }

    async fn fetch_current_feed(&self, ctx: &FetchContext) -> Result<String, SourceError> {
        let response = self
            .http
            .fetch_bytes(ctx.run_id, "current", &self.current_feed_url)
            .await?;
        Ok(response.text())
    }
}

/// Saved pages on disk: `<root>/<city-slug>.html` and `<root>/current.csv`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn page_path(&self, city: &City) -> PathBuf {
        self.root.join(format!("{}.html", city_slug(&city.display_name)))
    }

    pub fn feed_path(&self) -> PathBuf {
        self.root.join("current.csv")
    }
}

async fn read_text(path: &Path) -> Result<String, SourceError> {
    debug!(path = %path.display(), "reading saved input");
    fs::read_to_string(path).await.map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl PageSource for DirectorySource {
    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }

    async fn fetch_forecast_page(
        &self,
        _ctx: &FetchContext,
        city: &City,
    ) -> Result<String, SourceError> {
        read_text(&self.page_path(city)).await
    }

    async fn fetch_current_feed(&self, _ctx: &FetchContext) -> Result<String, SourceError> {
        read_text(&self.feed_path()).await
    }
}

/// Lowercase ASCII slug of a city name, Polish letters folded: `"Bielsko-Biała"` -> `"bielsko-biala"`.
pub fn city_slug(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .chars()
        .map(fold_polish)
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn fold_polish(c: char) -> char {
    match c {
        'ą' => 'a',
        'ć' => 'c',
        'ę' => 'e',
        'ł' => 'l',
        'ń' => 'n',
        'ó' => 'o',
        'ś' => 's',
        'ź' | 'ż' => 'z',
        other => other,
    }
}
