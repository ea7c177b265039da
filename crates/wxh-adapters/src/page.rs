//! Reading the raw structure out of a city's forecast page.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use wxh_core::ForecastRecord;

use crate::layout::{normalize_rows, RawEntry};
use crate::timeline::{build_timeline, parse_anchor_label, resolve_anchor_year, ScrapeTime};
use crate::ParseError;

pub const ENTRY_SELECTOR: &str = ".weather-entry";
pub const ANCHOR_SELECTOR: &str = ".weather-forecast-hbh-day-labelRight";
pub const CITY_SELECTOR: &str = ".weather-currently-city";

static LINE_BREAKS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\r?\n)+").expect("line break regex"));

/// Split the flattened text of one hourly entry into cells.
///
/// Decimal commas become periods first, then every run of line breaks
/// separates two cells. The leading empty cell before the first line break is
/// kept; column positions depend on it.
pub fn split_entry_text(text: &str) -> RawEntry {
    let text = text.replace(',', ".");
    LINE_BREAKS_RE.split(&text).map(str::to_string).collect()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector(e.to_string()))
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, ParseError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

/// Raw content of a forecast page before any interpretation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastPage {
    pub city_label: Option<String>,
    pub anchor_label: Option<String>,
    pub entries: Vec<RawEntry>,
}

impl ForecastPage {
    pub fn parse(html: &str) -> Result<Self, ParseError> {
        let document = Html::parse_document(html);
        let entry_sel = selector(ENTRY_SELECTOR)?;
        let entries = document
            .select(&entry_sel)
            .map(|node| split_entry_text(&node.text().collect::<String>()))
            .collect();

        Ok(Self {
            city_label: select_first_text(&document, CITY_SELECTOR)?,
            anchor_label: select_first_text(&document, ANCHOR_SELECTOR)?,
            entries,
        })
    }

    /// Turn the page into one record per forecast hour.
    ///
    /// Either all [`wxh_core::FORECAST_HOURS`] records come back or none do.
    pub fn forecast_records(
        &self,
        city_id: i64,
        time: &ScrapeTime,
    ) -> Result<Vec<ForecastRecord>, ParseError> {
        let table = normalize_rows(&self.entries)?;
        let label = self.anchor_label.as_deref().ok_or(ParseError::MissingAnchor)?;
        let anchor = parse_anchor_label(label)?;
        let year = resolve_anchor_year(time.local_now, anchor.month);
        let stamps = build_timeline(anchor, year, table.first_hour())?;

        Ok(table
            .rows
            .into_iter()
            .zip(stamps)
            .map(|(row, forecast_date)| ForecastRecord {
                city_id,
                gather_date: time.gather_date,
                forecast_date,
                values: row.values,
            })
            .collect())
    }
}

/// Convenience wrapper: parse `html` and build its records in one go.
pub fn parse_forecast_page(
    html: &str,
    city_id: i64,
    time: &ScrapeTime,
) -> Result<Vec<ForecastRecord>, ParseError> {
    ForecastPage::parse(html)?.forecast_records(city_id, time)
}
