//! Maps the ragged per-hour cell lists of a forecast page onto named fields.
//!
//! Pages come in two layouts, told apart only by the widest row. On snow
//! pages, some rows carry the snow value one slot to the right of where the
//! humidity label sits, so those rows are repaired before columns are read.

use serde::Serialize;
use wxh_core::{ForecastValues, FORECAST_HOURS};

use crate::extract::{extract_label, extract_value, extract_whole_number, has_digit};
use crate::ParseError;

/// Cell texts of one hourly entry, in page order.
pub type RawEntry = Vec<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    WithSnow,
    WithoutSnow,
}

/// Swap `indicator` with `partner` in a row whose `indicator` cell holds a digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapRule {
    pub indicator: usize,
    pub partner: usize,
}

/// Source column for every output field of one layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMap {
    pub width: usize,
    pub hour: usize,
    pub temperature: usize,
    pub sensed_temperature: usize,
    pub cover: usize,
    pub wind_direction: usize,
    pub wind_speed: usize,
    pub max_wind_speed: usize,
    pub cloud_percent: usize,
    pub rain_amount: usize,
    pub humidity_percent: usize,
    pub snow_amount: Option<usize>,
    pub swap: Option<SwapRule>,
}

const WITH_SNOW_COLUMNS: ColumnMap = ColumnMap {
    width: 18,
    hour: 1,
    temperature: 2,
    sensed_temperature: 3,
    cover: 4,
    wind_direction: 5,
    wind_speed: 6,
    max_wind_speed: 8,
    cloud_percent: 10,
    rain_amount: 12,
    humidity_percent: 13,
    snow_amount: Some(14),
    swap: Some(SwapRule {
        indicator: 15,
        partner: 13,
    }),
};

const WITHOUT_SNOW_COLUMNS: ColumnMap = ColumnMap {
    width: 16,
    hour: 1,
    temperature: 2,
    sensed_temperature: 3,
    cover: 4,
    wind_direction: 5,
    wind_speed: 6,
    max_wind_speed: 8,
    cloud_percent: 10,
    rain_amount: 12,
    humidity_percent: 13,
    snow_amount: None,
    swap: None,
};

impl LayoutKind {
    pub fn detect(width: usize) -> Self {
        if width == WITH_SNOW_COLUMNS.width {
            Self::WithSnow
        } else {
            Self::WithoutSnow
        }
    }

    pub fn columns(self) -> &'static ColumnMap {
        match self {
            Self::WithSnow => &WITH_SNOW_COLUMNS,
            Self::WithoutSnow => &WITHOUT_SNOW_COLUMNS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRow {
    pub hour: u32,
    pub values: ForecastValues,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedTable {
    pub layout: LayoutKind,
    pub rows: Vec<NormalizedRow>,
}

impl NormalizedTable {
    pub fn first_hour(&self) -> u32 {
        self.rows.first().map(|row| row.hour).unwrap_or(0)
    }
}

/// Normalize all entries of one page. The matrix must hold exactly
/// [`FORECAST_HOURS`] entries.
pub fn normalize_rows(entries: &[RawEntry]) -> Result<NormalizedTable, ParseError> {
    if entries.len() != FORECAST_HOURS {
        return Err(ParseError::RowCount {
            expected: FORECAST_HOURS,
            found: entries.len(),
        });
    }

    let width = entries.iter().map(Vec::len).max().unwrap_or(0);
    let layout = LayoutKind::detect(width);
    let columns = layout.columns();
    if width != columns.width {
        return Err(ParseError::ColumnCount {
            layout,
            expected: columns.width,
            found: width,
        });
    }

    let rows = entries
        .iter()
        .enumerate()
        .map(|(index, entry)| normalize_row(columns, index, entry))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(NormalizedTable { layout, rows })
}

fn normalize_row(
    columns: &ColumnMap,
    index: usize,
    entry: &RawEntry,
) -> Result<NormalizedRow, ParseError> {
    // Short rows are padded with missing cells up to the layout width.
    let mut cells: Vec<Option<&str>> = (0..columns.width)
        .map(|i| entry.get(i).map(String::as_str))
        .collect();

    if let Some(rule) = columns.swap {
        if cells[rule.indicator].is_some_and(has_digit) {
            cells.swap(rule.indicator, rule.partner);
        }
    }

    let cell = |i: usize| cells[i];
    let hour = parse_hour(cell(columns.hour)).ok_or_else(|| ParseError::InvalidHour {
        row: index,
        value: cell(columns.hour).map(str::to_string),
    })?;

    let values = ForecastValues {
        temperature: extract_value(cell(columns.temperature)),
        sensed_temperature: extract_value(cell(columns.sensed_temperature)),
        cover: extract_label(cell(columns.cover)),
        wind_direction: extract_label(cell(columns.wind_direction)),
        wind_speed: extract_whole_number(cell(columns.wind_speed)),
        max_wind_speed: extract_value(cell(columns.max_wind_speed)),
        cloud_percent: extract_value(cell(columns.cloud_percent)),
        rain_amount: extract_value(cell(columns.rain_amount)),
        humidity_percent: extract_value(cell(columns.humidity_percent)),
        snow_amount: columns
            .snow_amount
            .and_then(|i| extract_value(cell(i))),
    };

    Ok(NormalizedRow { hour, values })
}

/// `"1400"` is hour 14; anything that is not a clock time on the hour grid is rejected.
fn parse_hour(raw: Option<&str>) -> Option<u32> {
    let hour = raw?.trim().parse::<u32>().ok()? / 100;
    (hour < 24).then_some(hour)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cells: &[&str]) -> RawEntry {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn no_snow_entry(hour: u32) -> RawEntry {
        entry(&[
            "",
            &format!("{hour}00"),
            "5°C",
            "Odczuwalna 3°C",
            "Pochmurno",
            "SW",
            "12",
            "km/h",
            "25",
            "km/h",
            "80%",
            "zachm.",
            "0.4 mm",
            "75%",
            "wilg.",
            "",
        ])
    }

    fn snow_entry(hour: u32) -> RawEntry {
        entry(&[
            "",
            &format!("{hour}00"),
            "-2°C",
            "Odczuwalna -6°C",
            "Śnieg",
            "N",
            "20",
            "km/h",
            "40",
            "km/h",
            "100%",
            "zachm.",
            "0.0 mm",
            "90%",
            "1.5 cm",
            "wilg.",
            "",
            "",
        ])
    }

    fn day_of(make: fn(u32) -> RawEntry) -> Vec<RawEntry> {
        (0..FORECAST_HOURS as u32).map(|i| make(i % 24)).collect()
    }

    #[test]
    fn eighteen_wide_page_is_snow_layout() {
        let table = normalize_rows(&day_of(snow_entry)).expect("normalize");
        assert_eq!(table.layout, LayoutKind::WithSnow);
        assert_eq!(table.rows.len(), FORECAST_HOURS);

        let first = &table.rows[0].values;
        assert_eq!(first.temperature, Some(-2.0));
        assert_eq!(first.sensed_temperature, Some(-6.0));
        assert_eq!(first.cover.as_deref(), Some("Śnieg"));
        assert_eq!(first.wind_speed, Some(20.0));
        assert_eq!(first.max_wind_speed, Some(40.0));
        assert_eq!(first.humidity_percent, Some(90.0));
        assert_eq!(first.snow_amount, Some(1.5));
    }

    #[test]
    fn misaligned_snow_row_is_repaired_by_swap() {
        let mut entries = day_of(snow_entry);
        entries[3][13] = "wilg.".to_string();
        entries[3][15] = "85%".to_string();

        let table = normalize_rows(&entries).expect("normalize");
        assert_eq!(table.rows[3].values.humidity_percent, Some(85.0));
        assert_eq!(table.rows[3].values.snow_amount, Some(1.5));
    }

    #[test]
    fn sixteen_wide_page_has_no_snow_field() {
        let table = normalize_rows(&day_of(no_snow_entry)).expect("normalize");
        assert_eq!(table.layout, LayoutKind::WithoutSnow);
        assert_eq!(table.layout.columns().snow_amount, None);
        assert!(table.rows.iter().all(|row| row.values.snow_amount.is_none()));
        assert_eq!(table.rows[0].values.rain_amount, Some(0.4));
        assert_eq!(table.rows[0].values.humidity_percent, Some(75.0));
    }

    #[test]
    fn short_rows_read_as_missing_cells() {
        let mut entries = day_of(no_snow_entry);
        entries[7].truncate(10);

        let table = normalize_rows(&entries).expect("normalize");
        let row = &table.rows[7].values;
        assert_eq!(row.temperature, Some(5.0));
        assert_eq!(row.rain_amount, None);
        assert_eq!(row.humidity_percent, None);
    }

    #[test]
    fn wrong_row_count_is_structural() {
        let entries: Vec<RawEntry> = day_of(no_snow_entry).into_iter().take(119).collect();
        assert_eq!(
            normalize_rows(&entries),
            Err(ParseError::RowCount {
                expected: FORECAST_HOURS,
                found: 119
            })
        );
        assert!(matches!(
            normalize_rows(&[]),
            Err(ParseError::RowCount { found: 0, .. })
        ));
    }

    #[test]
    fn unexpected_width_is_structural() {
        let mut entries = day_of(no_snow_entry);
        entries[0].push("extra".to_string());
        assert!(matches!(
            normalize_rows(&entries),
            Err(ParseError::ColumnCount {
                layout: LayoutKind::WithoutSnow,
                expected: 16,
                found: 17
            })
        ));
    }

    #[test]
    fn unreadable_hour_is_structural() {
        let mut entries = day_of(no_snow_entry);
        entries[2][1] = "jutro".to_string();
        assert!(matches!(
            normalize_rows(&entries),
            Err(ParseError::InvalidHour { row: 2, .. })
        ));

        let mut entries = day_of(no_snow_entry);
        entries[0][1] = "2500".to_string();
        assert!(matches!(
            normalize_rows(&entries),
            Err(ParseError::InvalidHour { row: 0, .. })
        ));
    }
}
