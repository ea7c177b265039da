//! Harvest cycle orchestration: city registry, per-city failure isolation,
//! deduplicated event log and the cron scheduler.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;
use wxh_adapters::{
    city_slug, map_current_observations, parse_current_feed, parse_forecast_page, station_index,
    DirectorySource, FetchContext, HttpPageSource, PageSource, ScrapeTime,
};
use wxh_core::{City, CitySeed};
use wxh_storage::{
    ArtifactStore, ArtifactSubject, HttpClientConfig, HttpFetcher, SaveSummary, SqliteStore,
    WeatherStore,
};

pub const CRATE_NAME: &str = "wxh-sync";

pub const DEFAULT_CURRENT_FEED_URL: &str = "https://danepubliczne.imgw.pl/api/data/synop/format/csv";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub artifacts_dir: PathBuf,
    pub cities_file: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub utc_offset_hours: i32,
    pub current_feed_url: String,
    pub request_delay: Duration,
    pub fixtures_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://weather.db".to_string()),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            cities_file: std::env::var("WXH_CITIES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("cities.yaml")),
            scheduler_enabled: std::env::var("WXH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("WXH_SYNC_CRON")
                .unwrap_or_else(|_| "0 1,31 * * * *".to_string()),
            user_agent: std::env::var("WXH_USER_AGENT")
                .unwrap_or_else(|_| "wxh-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("WXH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            utc_offset_hours: std::env::var("WXH_UTC_OFFSET_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            current_feed_url: std::env::var("WXH_CURRENT_FEED_URL")
                .unwrap_or_else(|_| DEFAULT_CURRENT_FEED_URL.to_string()),
            request_delay: Duration::from_millis(
                std::env::var("WXH_REQUEST_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(2000),
            ),
            fixtures_dir: std::env::var("WXH_FIXTURES_DIR").ok().map(PathBuf::from),
        }
    }

    /// Point the config at a SQLite file, appending `.db` when the path has no such suffix.
    pub fn with_database_path(mut self, path: &str) -> Self {
        let file = if path.ends_with(".db") {
            path.to_string()
        } else {
            format!("{path}.db")
        };
        self.database_url = format!("sqlite://{file}");
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CityRegistry {
    pub cities: Vec<CitySeed>,
}

pub async fn load_city_registry(path: &Path) -> Result<CityRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Appended,
    Repeated(u32),
}

/// Remembers the last event so a message repeated back to back is counted
/// rather than written again.
#[derive(Debug, Default)]
pub struct EventLog {
    last: Option<String>,
    times: u32,
}

impl EventLog {
    pub fn record(&mut self, message: &str) -> EventOutcome {
        if self.last.as_deref() == Some(message) {
            self.times += 1;
            return EventOutcome::Repeated(self.times);
        }
        self.last = Some(message.to_string());
        self.times = 1;
        EventOutcome::Appended
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    Structural,
    Store,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Fetch => "fetch",
            Self::Structural => "structural",
            Self::Store => "store",
        };
        f.write_str(label)
    }
}

/// Why one city produced nothing this cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CityFailure {
    pub city_id: i64,
    pub city_name: String,
    pub kind: FailureKind,
    pub detail: String,
    /// Raw page kept for offline inspection, when one was captured.
    pub artifact: Option<PathBuf>,
}

impl fmt::Display for CityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (city {}): {} error: {}",
            self.city_name, self.city_id, self.kind, self.detail
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub gather_date: NaiveDateTime,
    pub cities: usize,
    pub inserted: usize,
    pub discarded: usize,
    pub failures: Vec<CityFailure>,
    /// `None` when the current-conditions flow was skipped this cycle.
    pub current_inserted: Option<usize>,
}

pub fn page_source_for(config: &SyncConfig) -> Result<Box<dyn PageSource>> {
    if let Some(dir) = &config.fixtures_dir {
        return Ok(Box::new(DirectorySource::new(dir.clone())));
    }
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    Ok(Box::new(HttpPageSource::new(http, config.current_feed_url.clone())))
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn WeatherStore>,
    source: Box<dyn PageSource>,
    artifact_store: ArtifactStore,
    events: Mutex<EventLog>,
    cycle: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn WeatherStore>, source: Box<dyn PageSource>) -> Self {
        let artifact_store = ArtifactStore::new(config.artifacts_dir.clone());
        Self {
            config,
            store,
            source,
            artifact_store,
            events: Mutex::new(EventLog::default()),
            cycle: Mutex::new(()),
        }
    }

    /// Open the configured SQLite database, migrate it and pick the page source.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let store = SqliteStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening {}", config.database_url))?;
        store.migrate().await.context("running migrations")?;
        let source = page_source_for(&config)?;
        info!(database = %config.database_url, source = %source.describe(), "pipeline ready");
        Ok(Self::new(config, Arc::new(store), source))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Load the city registry file into the store. Returns newly added cities.
    pub async fn setup(&self) -> Result<usize> {
        let registry = load_city_registry(&self.config.cities_file).await?;
        let added = self
            .store
            .register_cities(&registry.cities)
            .await
            .context("registering cities")?;
        info!(added, listed = registry.cities.len(), "city registry loaded");
        Ok(added)
    }

    /// One harvest cycle: every city in turn, then the current-conditions feed.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CycleSummary> {
        let _running = self.cycle.lock().await;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let time = ScrapeTime::at(now, self.config.utc_offset_hours).with_context(|| {
            format!("utc offset {} is out of range", self.config.utc_offset_hours)
        })?;
        let ctx = FetchContext {
            run_id,
            fetched_at: now,
        };

        let cities = self.store.cities().await.context("loading cities")?;
        info!(%run_id, cities = cities.len(), gather_date = %time.gather_date, "harvest cycle started");

        let mut totals = SaveSummary::default();
        let mut failures = Vec::new();
        for (index, city) in cities.iter().enumerate() {
            if index > 0 && !self.config.request_delay.is_zero() {
                tokio::time::sleep(self.config.request_delay).await;
            }

            let span = info_span!("city", %run_id, city_id = city.id, city = %city.display_name);
            match self.harvest_city(&ctx, city, &time).instrument(span).await {
                Ok(summary) => {
                    totals.inserted += summary.inserted;
                    totals.discarded += summary.discarded;
                }
                Err(failure) => {
                    self.record_event(&failure.to_string()).await;
                    failures.push(failure);
                }
            }
        }

        let current_inserted = match self.harvest_current(&ctx, &cities).await {
            Ok(inserted) => inserted,
            Err(err) => {
                self.record_event(&format!("current conditions skipped: {err:#}"))
                    .await;
                None
            }
        };

        let summary = CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            gather_date: time.gather_date,
            cities: cities.len(),
            inserted: totals.inserted,
            discarded: totals.discarded,
            failures,
            current_inserted,
        };
        info!(
            %run_id,
            inserted = summary.inserted,
            discarded = summary.discarded,
            failed = summary.failures.len(),
            current = ?summary.current_inserted,
            "harvest cycle finished"
        );
        Ok(summary)
    }

    async fn harvest_city(
        &self,
        ctx: &FetchContext,
        city: &City,
        time: &ScrapeTime,
    ) -> Result<SaveSummary, CityFailure> {
        let failure = |kind: FailureKind, detail: String, artifact: Option<PathBuf>| CityFailure {
            city_id: city.id,
            city_name: city.display_name.clone(),
            kind,
            detail,
            artifact,
        };

        let html = self
            .source
            .fetch_forecast_page(ctx, city)
            .await
            .map_err(|err| failure(FailureKind::Fetch, err.to_string(), None))?;

        let records = match parse_forecast_page(&html, city.id, time) {
            Ok(records) => records,
            Err(err) => {
                let slug = city_slug(&city.display_name);
                let subject = ArtifactSubject::city_page(city.id, &slug, err.kind());
                let artifact = self.capture(ctx, &subject, &html).await;
                return Err(failure(
                    FailureKind::Structural,
                    format!("{}: {err}", err.kind()),
                    artifact,
                ));
            }
        };

        let summary = self
            .store
            .save_forecasts(&records)
            .await
            .map_err(|err| failure(FailureKind::Store, err.to_string(), None))?;
        debug!(
            inserted = summary.inserted,
            discarded = summary.discarded,
            undecodable = summary.undecodable,
            "forecast batch reconciled"
        );
        Ok(summary)
    }

    async fn harvest_current(&self, ctx: &FetchContext, cities: &[City]) -> Result<Option<usize>> {
        let stations = station_index(cities);
        if stations.is_empty() {
            debug!("no city has a current-conditions station");
            return Ok(None);
        }

        let text = self
            .source
            .fetch_current_feed(ctx)
            .await
            .context("fetching current-conditions feed")?;

        let observations = match parse_current_feed(&text)
            .and_then(|rows| map_current_observations(&rows, &stations))
        {
            Ok(observations) => observations,
            Err(err) => {
                self.capture(ctx, &ArtifactSubject::current_feed(err.kind()), &text)
                    .await;
                return Err(err).context("reading current-conditions feed");
            }
        };

        let inserted = self
            .store
            .insert_current_if_absent(&observations)
            .await
            .context("storing current conditions")?;
        debug!(mapped = observations.len(), inserted, "current conditions stored");
        Ok(Some(inserted))
    }

    async fn capture(
        &self,
        ctx: &FetchContext,
        subject: &ArtifactSubject,
        text: &str,
    ) -> Option<PathBuf> {
        match self
            .artifact_store
            .store_bytes(ctx.fetched_at, subject, text.as_bytes())
            .await
        {
            Ok(stored) => Some(stored.absolute_path),
            Err(err) => {
                warn!(
                    origin = %subject.origin,
                    reason = %subject.reason,
                    error = %format!("{err:#}"),
                    "could not keep raw input"
                );
                None
            }
        }
    }

    async fn record_event(&self, message: &str) {
        let outcome = self.events.lock().await.record(message);
        let written = match outcome {
            EventOutcome::Appended => {
                warn!(event = message, "harvest event");
                self.store.append_event(message, None).await
            }
            EventOutcome::Repeated(times) => {
                debug!(event = message, times, "harvest event repeated");
                self.store.bump_last_event().await
            }
        };
        if let Err(err) = written {
            warn!(error = %err, "could not persist harvest event");
        }
    }

    pub async fn build_scheduler(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if let Err(err) = pipeline.run_once(Utc::now()).await {
                    error!(error = %format!("{err:#}"), "scheduled harvest cycle failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        self.build_scheduler().await.map(Some)
    }
}

pub async fn run_sync_once_from_env() -> Result<CycleSummary> {
    let pipeline = SyncPipeline::connect(SyncConfig::from_env()).await?;
    pipeline.run_once(Utc::now()).await
}
