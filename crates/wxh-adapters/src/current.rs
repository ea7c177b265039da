//! National current-conditions CSV feed mapped onto registered cities.

use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Deserialize;
use thiserror::Error;
use wxh_core::{floor_to_half_hour, City, CurrentObservation};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("reading current-conditions csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("station {station}: {field} value {value:?} is not a number")]
    InvalidNumber {
        station: String,
        field: &'static str,
        value: String,
    },
    #[error("station {station}: cannot build a timestamp from {date:?} {hour:?}")]
    InvalidTimestamp {
        station: String,
        date: String,
        hour: String,
    },
}

impl FeedError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Csv(_) => "csv",
            Self::InvalidNumber { .. } => "invalid_number",
            Self::InvalidTimestamp { .. } => "invalid_timestamp",
        }
    }
}

/// One feed row as published, every cell still text.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct FeedRow {
    #[serde(rename = "stacja")]
    pub station: String,
    #[serde(rename = "data_pomiaru")]
    pub date: String,
    #[serde(rename = "godzina_pomiaru")]
    pub hour: String,
    #[serde(rename = "temperatura", default)]
    pub temperature: String,
    #[serde(rename = "predkosc_wiatru", default)]
    pub wind_speed: String,
    #[serde(rename = "kierunek_wiatru", default)]
    pub wind_direction: String,
    #[serde(rename = "wilgotnosc_wzgledna", default)]
    pub humidity: String,
    #[serde(rename = "suma_opadu", default)]
    pub precipitation: String,
    #[serde(rename = "cisnienie", default)]
    pub pressure: String,
}

pub fn parse_current_feed(text: &str) -> Result<Vec<FeedRow>, FeedError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for row in reader.deserialize::<FeedRow>() {
        rows.push(row?);
    }
    Ok(rows)
}

/// `currentFeedStationName -> cityId` for every city that has a station.
pub fn station_index(cities: &[City]) -> HashMap<String, i64> {
    cities
        .iter()
        .filter_map(|city| {
            city.current_feed_station
                .as_ref()
                .map(|station| (station.trim().to_string(), city.id))
        })
        .collect()
}

/// Map feed rows onto known cities, dropping unknown stations, sorted by city id.
pub fn map_current_observations(
    rows: &[FeedRow],
    stations: &HashMap<String, i64>,
) -> Result<Vec<CurrentObservation>, FeedError> {
    let mut observations = rows
        .iter()
        .filter_map(|row| stations.get(row.station.trim()).map(|id| (*id, row)))
        .map(|(city_id, row)| map_row(city_id, row))
        .collect::<Result<Vec<_>, _>>()?;
    observations.sort_by_key(|obs| (obs.city_id, obs.observation_date));
    Ok(observations)
}

fn map_row(city_id: i64, row: &FeedRow) -> Result<CurrentObservation, FeedError> {
    let observation_date =
        observation_time(&row.date, &row.hour).ok_or_else(|| FeedError::InvalidTimestamp {
            station: row.station.clone(),
            date: row.date.clone(),
            hour: row.hour.clone(),
        })?;

    Ok(CurrentObservation {
        city_id,
        observation_date,
        temperature: float_cell(row, "temperatura", &row.temperature)?,
        wind_speed: integer_cell(row, "predkosc_wiatru", &row.wind_speed)?,
        wind_direction: integer_cell(row, "kierunek_wiatru", &row.wind_direction)?,
        humidity_percent: float_cell(row, "wilgotnosc_wzgledna", &row.humidity)?,
        precipitation_amount: float_cell(row, "suma_opadu", &row.precipitation)?,
        pressure: float_cell(row, "cisnienie", &row.pressure)?,
    })
}

/// `date` is `YYYY-MM-DD`; `hour` is `H`, `HH` or `HH:MM`. Minutes floor to the half hour.
pub fn observation_time(date: &str, hour: &str) -> Option<NaiveDateTime> {
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok()?;
    let hour = hour.trim();
    let (h, m) = match hour.split_once(':') {
        Some((h, m)) => (h.parse().ok()?, m.parse().ok()?),
        None => (hour.parse().ok()?, 0),
    };
    let time = NaiveTime::from_hms_opt(h, m, 0)?;
    Some(floor_to_half_hour(date.and_time(time)))
}

fn invalid(row: &FeedRow, field: &'static str, value: &str) -> FeedError {
    FeedError::InvalidNumber {
        station: row.station.clone(),
        field,
        value: value.to_string(),
    }
}

fn float_cell(row: &FeedRow, field: &'static str, value: &str) -> Result<Option<f64>, FeedError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value
        .replace(',', ".")
        .parse::<f64>()
        .map(Some)
        .map_err(|_| invalid(row, field, value))
}

fn integer_cell(row: &FeedRow, field: &'static str, value: &str) -> Result<Option<i64>, FeedError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<i64>()
        .map(Some)
        .map_err(|_| invalid(row, field, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = "\
id_stacji,stacja,data_pomiaru,godzina_pomiaru,temperatura,predkosc_wiatru,kierunek_wiatru,wilgotnosc_wzgledna,suma_opadu,cisnienie
12375,Warszawa,2024-03-15,14,8.4,3,250,61.2,0,1012.4
12566,Kraków,2024-03-15,14,10.1,2,180,55.0,0.2,
12160,Elbląg,2024-03-15,14,6.0,5,270,80.1,0,1010.0
";

    fn index() -> HashMap<String, i64> {
        HashMap::from([("Warszawa".to_string(), 2), ("Kraków".to_string(), 1)])
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn known_stations_are_mapped_and_sorted() {
        let rows = parse_current_feed(FEED).expect("csv");
        assert_eq!(rows.len(), 3);

        let observations = map_current_observations(&rows, &index()).expect("map");
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].city_id, 1);
        assert_eq!(observations[1].city_id, 2);

        let warszawa = &observations[1];
        assert_eq!(warszawa.observation_date, at(14, 0));
        assert_eq!(warszawa.temperature, Some(8.4));
        assert_eq!(warszawa.wind_speed, Some(3));
        assert_eq!(warszawa.wind_direction, Some(250));
        assert_eq!(warszawa.humidity_percent, Some(61.2));
        assert_eq!(warszawa.precipitation_amount, Some(0.0));
        assert_eq!(warszawa.pressure, Some(1012.4));

        assert_eq!(observations[0].pressure, None);
    }

    #[test]
    fn observation_minutes_floor_to_half_hour() {
        assert_eq!(observation_time("2024-03-15", "14:45"), Some(at(14, 30)));
        assert_eq!(observation_time("2024-03-15", "14:29"), Some(at(14, 0)));
        assert_eq!(observation_time("2024-03-15", "7"), Some(at(7, 0)));
        assert_eq!(observation_time("2024-03-15", "24"), None);
        assert_eq!(observation_time("15.03.2024", "14"), None);
    }

    #[test]
    fn malformed_value_on_mapped_station_fails_the_feed() {
        let feed = "stacja,data_pomiaru,godzina_pomiaru,temperatura,predkosc_wiatru\n\
                    Warszawa,2024-03-15,14,ciepło,3\n";
        let rows = parse_current_feed(feed).expect("csv");
        let err = map_current_observations(&rows, &index()).expect_err("bad temperature");
        assert!(matches!(
            err,
            FeedError::InvalidNumber {
                field: "temperatura",
                ..
            }
        ));
    }

    #[test]
    fn malformed_value_on_unknown_station_is_ignored() {
        let feed = "stacja,data_pomiaru,godzina_pomiaru,temperatura\n\
                    Hel,2024-03-15,xx,ciepło\n";
        let rows = parse_current_feed(feed).expect("csv");
        assert!(map_current_observations(&rows, &index())
            .expect("map")
            .is_empty());
    }

    #[test]
    fn integer_columns_reject_fractional_text() {
        for speed in ["4.0", "3.5"] {
            let feed = format!(
                "stacja,data_pomiaru,godzina_pomiaru,predkosc_wiatru,kierunek_wiatru\n\
                 Kraków,2024-03-15,9,{speed},\n"
            );
            let rows = parse_current_feed(&feed).expect("csv");
            let err = map_current_observations(&rows, &index()).expect_err("fractional speed");
            assert_eq!(err.kind(), "invalid_number");
            assert!(matches!(
                err,
                FeedError::InvalidNumber { field: "predkosc_wiatru", ref value, .. } if value == speed
            ));
        }
    }

    #[test]
    fn blank_integer_cell_is_null() {
        let feed = "stacja,data_pomiaru,godzina_pomiaru,predkosc_wiatru,kierunek_wiatru\n\
                    Kraków,2024-03-15,9,4,\n";
        let rows = parse_current_feed(feed).expect("csv");
        let observations = map_current_observations(&rows, &index()).expect("map");
        assert_eq!(observations[0].wind_speed, Some(4));
        assert_eq!(observations[0].wind_direction, None);
    }

    #[test]
    fn station_index_skips_cities_without_station() {
        let cities = vec![
            City {
                id: 1,
                display_name: "Kraków".into(),
                page_address: "https://example.invalid/krakow".into(),
                current_feed_station: Some("Kraków".into()),
            },
            City {
                id: 2,
                display_name: "Zakopane".into(),
                page_address: "https://example.invalid/zakopane".into(),
                current_feed_station: None,
            },
        ];
        let index = station_index(&cities);
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("Kraków"), Some(&1));
    }
}
