//! Core domain model and reconciliation rules for the weather harvester.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "wxh-core";

/// Number of hourly rows every forecast page must yield.
pub const FORECAST_HOURS: usize = 120;

/// City registry row as configured, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitySeed {
    pub name: String,
    pub page_address: String,
    #[serde(default)]
    pub current_feed_station: Option<String>,
}

/// Immutable reference data for one city.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct City {
    pub id: i64,
    pub display_name: String,
    pub page_address: String,
    pub current_feed_station: Option<String>,
}

/// Every non-key field of a forecast row.
///
/// Numeric fields are nullable; the extractor never yields NaN, so `None` is
/// the only "missing" marker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForecastValues {
    pub temperature: Option<f64>,
    pub sensed_temperature: Option<f64>,
    pub cover: Option<String>,
    pub wind_direction: Option<String>,
    pub wind_speed: Option<f64>,
    pub max_wind_speed: Option<f64>,
    pub cloud_percent: Option<f64>,
    pub rain_amount: Option<f64>,
    pub humidity_percent: Option<f64>,
    pub snow_amount: Option<f64>,
}

impl ForecastValues {
    fn numbers(&self) -> [Option<f64>; 8] {
        [
            self.temperature,
            self.sensed_temperature,
            self.wind_speed,
            self.max_wind_speed,
            self.cloud_percent,
            self.rain_amount,
            self.humidity_percent,
            self.snow_amount,
        ]
    }

    fn labels(&self) -> [Option<&str>; 2] {
        [self.cover.as_deref(), self.wind_direction.as_deref()]
    }

    /// True when every field matches `other` under the reconciliation rules.
    pub fn same_as(&self, other: &ForecastValues) -> bool {
        let numbers_match = self
            .numbers()
            .iter()
            .zip(other.numbers().iter())
            .all(|(a, b)| same_number(*a, *b));
        numbers_match && self.labels() == other.labels()
    }
}

/// Exact float equality where two nulls are equal and null never equals a value.
pub fn same_number(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// One hourly forecast for one city, as gathered at `gather_date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub city_id: i64,
    pub gather_date: NaiveDateTime,
    pub forecast_date: NaiveDateTime,
    #[serde(flatten)]
    pub values: ForecastValues,
}

/// One row of the national current-conditions feed, mapped onto a city.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentObservation {
    pub city_id: i64,
    pub observation_date: NaiveDateTime,
    pub temperature: Option<f64>,
    pub wind_speed: Option<i64>,
    pub wind_direction: Option<i64>,
    pub humidity_percent: Option<f64>,
    pub precipitation_amount: Option<f64>,
    pub pressure: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Insert,
    Discard,
}

/// Decide whether `candidate` is worth storing given the latest stored row for
/// the same `(city, forecast hour)`.
///
/// The store is append-only: a revision of an earlier forecast becomes a new
/// row, an unchanged re-forecast is dropped.
pub fn reconcile(candidate: &ForecastValues, latest: Option<&ForecastValues>) -> Decision {
    match latest {
        None => Decision::Insert,
        Some(stored) if stored.same_as(candidate) => Decision::Discard,
        Some(_) => Decision::Insert,
    }
}

/// Wall clock at a fixed UTC offset, with seconds and sub-seconds dropped.
pub fn local_wall_clock(now: DateTime<Utc>, utc_offset_hours: i32) -> Option<NaiveDateTime> {
    let offset = FixedOffset::east_opt(utc_offset_hours.checked_mul(3600)?)?;
    now.with_timezone(&offset)
        .naive_local()
        .with_second(0)?
        .with_nanosecond(0)
}

/// Minutes below 30 floor to `:00`, the rest to `:30`.
pub fn floor_to_half_hour(at: NaiveDateTime) -> NaiveDateTime {
    let minute = if at.minute() < 30 { 0 } else { 30 };
    at.with_minute(minute)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

/// Timestamp stamped on every record of one scrape batch.
pub fn gather_date(now: DateTime<Utc>, utc_offset_hours: i32) -> Option<NaiveDateTime> {
    local_wall_clock(now, utc_offset_hours).map(floor_to_half_hour)
}
