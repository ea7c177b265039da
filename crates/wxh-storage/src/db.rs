//! Persistence contract for cities, forecasts, current observations and the
//! event log, with a SQLite implementation and an in-memory one.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use wxh_core::{reconcile, City, CitySeed, CurrentObservation, Decision, ForecastRecord, ForecastValues};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("city id {0} is not registered")]
    UnknownCity(i64),
    #[error("stored row could not be decoded: {0}")]
    Decode(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Outcome of reconciling one city's batch against stored history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveSummary {
    pub inserted: usize,
    pub discarded: usize,
    /// Lookups whose stored row could not be read back; these were inserted.
    pub undecodable: usize,
}

impl SaveSummary {
    fn record(&mut self, decision: Decision) {
        match decision {
            Decision::Insert => self.inserted += 1,
            Decision::Discard => self.discarded += 1,
        }
    }
}

#[async_trait]
pub trait WeatherStore: Send + Sync {
    /// Insert-or-ignore the registry, keyed by page address. Returns rows added.
    async fn register_cities(&self, seeds: &[CitySeed]) -> Result<usize, StoreError>;

    async fn cities(&self) -> Result<Vec<City>, StoreError>;

    /// Latest stored values for `(city, forecast hour)` by insertion order.
    async fn latest_forecast(
        &self,
        city_id: i64,
        forecast_date: NaiveDateTime,
    ) -> Result<Option<ForecastValues>, StoreError>;

    /// Reconcile and append one city's batch as a single unit.
    async fn save_forecasts(&self, records: &[ForecastRecord]) -> Result<SaveSummary, StoreError>;

    async fn count_forecasts(&self, city_id: i64) -> Result<usize, StoreError>;

    /// Insert observations whose `(city, date)` is not stored yet. Returns rows added.
    async fn insert_current_if_absent(
        &self,
        observations: &[CurrentObservation],
    ) -> Result<usize, StoreError>;

    async fn append_event(&self, info: &str, times: Option<i64>) -> Result<(), StoreError>;

    /// Increment the repeat counter of the most recent event.
    async fn bump_last_event(&self) -> Result<(), StoreError>;
}

fn distinct_city_ids<'a>(ids: impl Iterator<Item = &'a i64>) -> BTreeSet<i64> {
    ids.copied().collect()
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url`, e.g. `sqlite://weather.db`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // One connection: the cycle shares a single handle, and `sqlite::memory:`
        // databases are per-connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        let store = Self::connect("sqlite::memory:").await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn ensure_cities(conn: &mut SqliteConnection, ids: BTreeSet<i64>) -> Result<(), StoreError> {
    for id in ids {
        let found = sqlx::query("SELECT 1 FROM cityInfo WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        if found.is_none() {
            return Err(StoreError::UnknownCity(id));
        }
    }
    Ok(())
}

fn decode_values(row: &SqliteRow) -> Result<ForecastValues, sqlx::Error> {
    Ok(ForecastValues {
        temperature: row.try_get("temp")?,
        sensed_temperature: row.try_get("sensedTemp")?,
        cover: row.try_get("cover")?,
        wind_direction: row.try_get("windDirection")?,
        wind_speed: row.try_get("windSpeed")?,
        max_wind_speed: row.try_get("maxWindSpeed")?,
        cloud_percent: row.try_get("cloudy")?,
        rain_amount: row.try_get("rain")?,
        humidity_percent: row.try_get("humidity")?,
        snow_amount: row.try_get("snow")?,
    })
}

async fn latest_in(
    conn: &mut SqliteConnection,
    city_id: i64,
    forecast_date: NaiveDateTime,
) -> Result<Option<ForecastValues>, StoreError> {
    let row = sqlx::query(
        "SELECT temp, sensedTemp, cover, windDirection, windSpeed, maxWindSpeed, cloudy, rain, humidity, snow \
         FROM weather WHERE cityId = ? AND forecastDate = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(city_id)
    .bind(forecast_date)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(|row| decode_values(&row).map_err(|e| StoreError::Decode(e.to_string())))
        .transpose()
}

async fn insert_forecast(conn: &mut SqliteConnection, record: &ForecastRecord) -> Result<(), StoreError> {
    let v = &record.values;
    sqlx::query(
        "INSERT INTO weather (cityId, gatherDate, forecastDate, temp, sensedTemp, cover, windDirection, \
         windSpeed, maxWindSpeed, cloudy, rain, humidity, snow) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(record.city_id)
    .bind(record.gather_date)
    .bind(record.forecast_date)
    .bind(v.temperature)
    .bind(v.sensed_temperature)
    .bind(v.cover.as_deref())
    .bind(v.wind_direction.as_deref())
    .bind(v.wind_speed)
    .bind(v.max_wind_speed)
    .bind(v.cloud_percent)
    .bind(v.rain_amount)
    .bind(v.humidity_percent)
    .bind(v.snow_amount)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl WeatherStore for SqliteStore {
    async fn register_cities(&self, seeds: &[CitySeed]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut added = 0;
        for seed in seeds {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO cityInfo (name, pageAddress, nameInCurrent) VALUES (?, ?, ?)",
            )
            .bind(&seed.name)
            .bind(&seed.page_address)
            .bind(seed.current_feed_station.as_deref())
            .execute(&mut *tx)
            .await?;
            added += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(added)
    }

    async fn cities(&self) -> Result<Vec<City>, StoreError> {
        let rows = sqlx::query("SELECT id, name, pageAddress, nameInCurrent FROM cityInfo ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(City {
                    id: row.try_get("id")?,
                    display_name: row.try_get("name")?,
                    page_address: row.try_get("pageAddress")?,
                    current_feed_station: row.try_get("nameInCurrent")?,
                })
            })
            .collect()
    }

    async fn latest_forecast(
        &self,
        city_id: i64,
        forecast_date: NaiveDateTime,
    ) -> Result<Option<ForecastValues>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        latest_in(&mut conn, city_id, forecast_date).await
    }

    async fn save_forecasts(&self, records: &[ForecastRecord]) -> Result<SaveSummary, StoreError> {
        let mut tx = self.pool.begin().await?;
        ensure_cities(&mut tx, distinct_city_ids(records.iter().map(|r| &r.city_id))).await?;

        let mut summary = SaveSummary::default();
        for record in records {
            let latest = match latest_in(&mut tx, record.city_id, record.forecast_date).await {
                Ok(latest) => latest,
                Err(StoreError::Decode(reason)) => {
                    warn!(city_id = record.city_id, forecast_date = %record.forecast_date, %reason,
                        "stored forecast unreadable; keeping candidate");
                    summary.undecodable += 1;
                    None
                }
                Err(err) => return Err(err),
            };
            let decision = reconcile(&record.values, latest.as_ref());
            if decision == Decision::Insert {
                insert_forecast(&mut tx, record).await?;
            }
            summary.record(decision);
        }

        tx.commit().await?;
        debug!(?summary, "forecast batch saved");
        Ok(summary)
    }

    async fn count_forecasts(&self, city_id: i64) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM weather WHERE cityId = ?")
            .bind(city_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn insert_current_if_absent(
        &self,
        observations: &[CurrentObservation],
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        ensure_cities(&mut tx, distinct_city_ids(observations.iter().map(|o| &o.city_id))).await?;

        let mut added = 0;
        for obs in observations {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO current (cityId, date, temp, windSpeed, windDirection, humidity, \
                 rainSnowFall, pressure) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(obs.city_id)
            .bind(obs.observation_date)
            .bind(obs.temperature)
            .bind(obs.wind_speed)
            .bind(obs.wind_direction)
            .bind(obs.humidity_percent)
            .bind(obs.precipitation_amount)
            .bind(obs.pressure)
            .execute(&mut *tx)
            .await?;
            added += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(added)
    }

    async fn append_event(&self, info: &str, times: Option<i64>) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO logs (info, times) VALUES (?, ?)")
            .bind(info)
            .bind(times)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bump_last_event(&self) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE logs SET times = COALESCE(times, 1) + 1 WHERE id = (SELECT MAX(id) FROM logs)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    cities: Vec<City>,
    weather: Vec<ForecastRecord>,
    current: BTreeMap<(i64, NaiveDateTime), CurrentObservation>,
    events: Vec<(String, Option<i64>)>,
}

impl MemoryState {
    fn ensure_cities(&self, ids: BTreeSet<i64>) -> Result<(), StoreError> {
        match ids.into_iter().find(|id| !self.cities.iter().any(|c| c.id == *id)) {
            Some(missing) => Err(StoreError::UnknownCity(missing)),
            None => Ok(()),
        }
    }

    fn latest(&self, city_id: i64, forecast_date: NaiveDateTime) -> Option<&ForecastValues> {
        self.weather
            .iter()
            .rev()
            .find(|r| r.city_id == city_id && r.forecast_date == forecast_date)
            .map(|r| &r.values)
    }
}

/// Store kept entirely in memory; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn forecasts(&self) -> Vec<ForecastRecord> {
        self.state.lock().await.weather.clone()
    }

    pub async fn observations(&self) -> Vec<CurrentObservation> {
        self.state.lock().await.current.values().cloned().collect()
    }

    pub async fn events(&self) -> Vec<(String, Option<i64>)> {
        self.state.lock().await.events.clone()
    }
}

#[async_trait]
impl WeatherStore for MemoryStore {
    async fn register_cities(&self, seeds: &[CitySeed]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut added = 0;
        for seed in seeds {
            if state.cities.iter().any(|c| c.page_address == seed.page_address) {
                continue;
            }
            let id = state.cities.iter().map(|c| c.id).max().unwrap_or(0) + 1;
            state.cities.push(City {
                id,
                display_name: seed.name.clone(),
                page_address: seed.page_address.clone(),
                current_feed_station: seed.current_feed_station.clone(),
            });
            added += 1;
        }
        Ok(added)
    }

    async fn cities(&self) -> Result<Vec<City>, StoreError> {
        Ok(self.state.lock().await.cities.clone())
    }

    async fn latest_forecast(
        &self,
        city_id: i64,
        forecast_date: NaiveDateTime,
    ) -> Result<Option<ForecastValues>, StoreError> {
        Ok(self.state.lock().await.latest(city_id, forecast_date).cloned())
    }

    async fn save_forecasts(&self, records: &[ForecastRecord]) -> Result<SaveSummary, StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_cities(distinct_city_ids(records.iter().map(|r| &r.city_id)))?;

        let mut summary = SaveSummary::default();
        for record in records {
            let decision = reconcile(&record.values, state.latest(record.city_id, record.forecast_date));
            if decision == Decision::Insert {
                state.weather.push(record.clone());
            }
            summary.record(decision);
        }
        Ok(summary)
    }

    async fn count_forecasts(&self, city_id: i64) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.weather.iter().filter(|r| r.city_id == city_id).count())
    }

    async fn insert_current_if_absent(
        &self,
        observations: &[CurrentObservation],
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_cities(distinct_city_ids(observations.iter().map(|o| &o.city_id)))?;

        let mut added = 0;
        for obs in observations {
            let key = (obs.city_id, obs.observation_date);
            if !state.current.contains_key(&key) {
                state.current.insert(key, obs.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    async fn append_event(&self, info: &str, times: Option<i64>) -> Result<(), StoreError> {
        self.state.lock().await.events.push((info.to_string(), times));
        Ok(())
    }

    async fn bump_last_event(&self) -> Result<(), StoreError> {
        if let Some((_, times)) = self.state.lock().await.events.last_mut() {
            *times = Some(times.unwrap_or(1) + 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn at(d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn seed(name: &str, station: Option<&str>) -> CitySeed {
        CitySeed {
            name: name.to_string(),
            page_address: format!("https://example.test/{}", name.to_lowercase()),
            current_feed_station: station.map(str::to_string),
        }
    }

    fn record(city_id: i64, gathered: NaiveDateTime, hour: i64, temp: f64) -> ForecastRecord {
        ForecastRecord {
            city_id,
            gather_date: gathered,
            forecast_date: at(15, 0) + Duration::hours(hour),
            values: ForecastValues {
                temperature: Some(temp),
                cover: Some("Pochmurno".to_string()),
                wind_direction: Some("SW".to_string()),
                wind_speed: Some(12.0),
                humidity_percent: Some(80.0),
                ..Default::default()
            },
        }
    }

    fn observation(city_id: i64, hour: u32, temp: f64) -> CurrentObservation {
        CurrentObservation {
            city_id,
            observation_date: at(15, hour),
            temperature: Some(temp),
            wind_speed: Some(3),
            wind_direction: Some(220),
            humidity_percent: Some(71.5),
            precipitation_amount: Some(0.0),
            pressure: None,
        }
    }

    async fn exercise_reconciliation(store: &dyn WeatherStore) {
        store
            .register_cities(&[seed("Warszawa", Some("WARSZAWA"))])
            .await
            .unwrap();
        let city = store.cities().await.unwrap().remove(0);

        let first: Vec<_> = (0..3).map(|h| record(city.id, at(15, 0), h, 5.0)).collect();
        let summary = store.save_forecasts(&first).await.unwrap();
        assert_eq!(summary.inserted, 3);

        // Same values gathered half an hour later: nothing new.
        let unchanged: Vec<_> = (0..3).map(|h| record(city.id, at(15, 1), h, 5.0)).collect();
        let summary = store.save_forecasts(&unchanged).await.unwrap();
        assert_eq!(summary, SaveSummary { inserted: 0, discarded: 3, undecodable: 0 });

        // One hour revised: only that one is appended.
        let mut revised = unchanged.clone();
        revised[1].values.temperature = Some(5.5);
        let summary = store.save_forecasts(&revised).await.unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(store.count_forecasts(city.id).await.unwrap(), 4);

        let latest = store
            .latest_forecast(city.id, revised[1].forecast_date)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.temperature, Some(5.5));

        // Reverting to the first value is a revision relative to the latest row.
        let summary = store.save_forecasts(&first[1..2]).await.unwrap();
        assert_eq!(summary.inserted, 1);
    }

    async fn exercise_orphans_and_current(store: &dyn WeatherStore) {
        let err = store
            .save_forecasts(&[record(42, at(15, 0), 0, 1.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownCity(42)));

        store
            .register_cities(&[seed("Krakow", Some("KRAKÓW"))])
            .await
            .unwrap();
        let city = store.cities().await.unwrap().remove(0);

        let added = store
            .insert_current_if_absent(&[observation(city.id, 13, 9.0), observation(city.id, 14, 9.5)])
            .await
            .unwrap();
        assert_eq!(added, 2);

        // A later feed repeating 14:00 with a different reading never overwrites.
        let added = store
            .insert_current_if_absent(&[observation(city.id, 14, 99.0), observation(city.id, 15, 10.0)])
            .await
            .unwrap();
        assert_eq!(added, 1);

        let err = store
            .insert_current_if_absent(&[observation(7, 14, 1.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownCity(7)));
    }

    #[tokio::test]
    async fn memory_store_reconciles_batches() {
        exercise_reconciliation(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_reconciles_batches() {
        exercise_reconciliation(&SqliteStore::in_memory().await.unwrap()).await;
    }

    #[tokio::test]
    async fn memory_store_rejects_orphans_and_never_overwrites_current() {
        exercise_orphans_and_current(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_rejects_orphans_and_never_overwrites_current() {
        exercise_orphans_and_current(&SqliteStore::in_memory().await.unwrap()).await;
    }

    #[tokio::test]
    async fn registering_the_same_city_twice_is_ignored() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert_eq!(store.register_cities(&[seed("Gdansk", None)]).await.unwrap(), 1);
        assert_eq!(store.register_cities(&[seed("Gdansk", None)]).await.unwrap(), 0);
        let cities = store.cities().await.unwrap();
        assert_eq!(cities.len(), 1);
        assert_eq!(cities[0].current_feed_station, None);
    }

    #[tokio::test]
    async fn unreadable_stored_row_forces_insert() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.register_cities(&[seed("Lodz", None)]).await.unwrap();
        let city_id = store.cities().await.unwrap()[0].id;

        let candidate = record(city_id, at(15, 0), 0, 3.0);
        sqlx::query("INSERT INTO weather (cityId, gatherDate, forecastDate, temp) VALUES (?, ?, ?, 'n/a')")
            .bind(city_id)
            .bind(at(14, 23))
            .bind(candidate.forecast_date)
            .execute(store.pool())
            .await
            .unwrap();

        let summary = store.save_forecasts(&[candidate]).await.unwrap();
        assert_eq!(summary, SaveSummary { inserted: 1, discarded: 0, undecodable: 1 });
    }

    #[tokio::test]
    async fn repeated_events_bump_the_counter() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.append_event("loop nr.1\tstarted downloading", None).await.unwrap();
        store.append_event("page parse failed", Some(1)).await.unwrap();
        store.bump_last_event().await.unwrap();
        store.bump_last_event().await.unwrap();

        let rows: Vec<(String, Option<i64>)> = sqlx::query_as("SELECT info, times FROM logs ORDER BY id")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert_eq!(rows[0], ("loop nr.1\tstarted downloading".to_string(), None));
        assert_eq!(rows[1], ("page parse failed".to_string(), Some(3)));
    }
}
