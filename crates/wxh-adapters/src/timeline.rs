//! Rebuilds absolute forecast timestamps from the page's day label and the
//! hour of its first row.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use wxh_core::{gather_date, local_wall_clock, FORECAST_HOURS};

use crate::ParseError;

const MONTHS: [(&[&str], u32); 12] = [
    (&["stycznia", "styczeń", "styczen", "january", "jan"], 1),
    (&["lutego", "luty", "february", "feb"], 2),
    (&["marca", "marzec", "march", "mar"], 3),
    (&["kwietnia", "kwiecień", "kwiecien", "april", "apr"], 4),
    (&["maja", "maj", "may"], 5),
    (&["czerwca", "czerwiec", "june", "jun"], 6),
    (&["lipca", "lipiec", "july", "jul"], 7),
    (&["sierpnia", "sierpień", "sierpien", "august", "aug"], 8),
    (&["września", "wrzesień", "wrzesnia", "wrzesien", "september", "sep"], 9),
    (&["października", "październik", "pazdziernika", "pazdziernik", "october", "oct"], 10),
    (&["listopada", "listopad", "november", "nov"], 11),
    (&["grudnia", "grudzień", "grudzien", "december", "dec"], 12),
];

/// Month number for a Polish (genitive or nominative) or English month name.
pub fn month_from_name(name: &str) -> Option<u32> {
    let needle = name.trim().trim_end_matches('.').to_lowercase();
    MONTHS
        .iter()
        .find(|(names, _)| names.contains(&needle.as_str()))
        .map(|(_, month)| *month)
}

/// Day and month of the first forecast row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Anchor {
    pub day: u32,
    pub month: u32,
}

impl Anchor {
    pub fn new(day: u32, month_name: &str) -> Result<Self, ParseError> {
        let month =
            month_from_name(month_name).ok_or_else(|| ParseError::UnknownMonth(month_name.to_string()))?;
        Ok(Self { day, month })
    }
}

/// Read the anchor from a label such as `"Piątek, 15 Marca"` or `"1, January"`.
pub fn parse_anchor_label(label: &str) -> Result<Anchor, ParseError> {
    let normalized = label.replace(',', " ");
    let mut tokens = normalized.split_whitespace();
    let malformed = || ParseError::MalformedAnchor(label.trim().to_string());

    let day = tokens
        .by_ref()
        .find_map(|token| token.trim_end_matches('.').parse::<u32>().ok())
        .ok_or_else(malformed)?;
    let month_name = tokens.next().ok_or_else(malformed)?;
    Anchor::new(day, month_name)
}

/// The label carries no year, so take it from the scrape clock and step over
/// a year boundary when the label is on the other side of it.
pub fn resolve_anchor_year(local_now: NaiveDateTime, anchor_month: u32) -> i32 {
    let year = local_now.year();
    match (local_now.month(), anchor_month) {
        (12, 1) => year + 1,
        (1, 12) => year - 1,
        _ => year,
    }
}

/// Consecutive hourly timestamps starting at `anchor`/`year` `first_hour`:00.
pub fn build_timeline(
    anchor: Anchor,
    year: i32,
    first_hour: u32,
) -> Result<Vec<NaiveDateTime>, ParseError> {
    let invalid = || ParseError::InvalidAnchorDate {
        year,
        month: anchor.month,
        day: anchor.day,
        hour: first_hour,
    };
    let start = NaiveDate::from_ymd_opt(year, anchor.month, anchor.day)
        .and_then(|date| date.and_hms_opt(first_hour, 0, 0))
        .ok_or_else(invalid)?;

    Ok((0..FORECAST_HOURS as i64)
        .map(|offset| start + Duration::hours(offset))
        .collect())
}

/// Clock readings a page parse depends on, fixed once per scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScrapeTime {
    /// Local wall clock, used for year inference.
    pub local_now: NaiveDateTime,
    /// Batch stamp written on every record.
    pub gather_date: NaiveDateTime,
}

impl ScrapeTime {
    pub fn at(now: DateTime<Utc>, utc_offset_hours: i32) -> Option<Self> {
        Some(Self {
            local_now: local_wall_clock(now, utc_offset_hours)?,
            gather_date: gather_date(now, utc_offset_hours)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn timeline_covers_five_days_hourly() {
        let anchor = Anchor::new(15, "March").expect("anchor");
        let stamps = build_timeline(anchor, 2024, 14).expect("timeline");
        assert_eq!(stamps.len(), 120);
        assert_eq!(stamps[0], at(2024, 3, 15, 14));
        assert_eq!(stamps[119], at(2024, 3, 20, 13));
        assert!(stamps.windows(2).all(|w| w[1] - w[0] == Duration::hours(1)));
    }

    #[test]
    fn polish_genitive_months_are_recognized() {
        assert_eq!(month_from_name("Marca"), Some(3));
        assert_eq!(month_from_name("WRZEŚNIA"), Some(9));
        assert_eq!(month_from_name("października"), Some(10));
        assert_eq!(month_from_name("Grudnia"), Some(12));
        assert_eq!(month_from_name("Smarch"), None);
    }

    #[test]
    fn anchor_label_forms() {
        assert_eq!(
            parse_anchor_label("Piątek, 15 Marca").expect("polish"),
            Anchor { day: 15, month: 3 }
        );
        assert_eq!(
            parse_anchor_label("1, January").expect("english"),
            Anchor { day: 1, month: 1 }
        );
        assert_eq!(
            parse_anchor_label("  Dzisiaj,  3 lipca ").expect("spacing"),
            Anchor { day: 3, month: 7 }
        );
    }

    #[test]
    fn anchor_label_failures() {
        assert!(matches!(
            parse_anchor_label("Dzisiaj"),
            Err(ParseError::MalformedAnchor(_))
        ));
        assert!(matches!(
            parse_anchor_label("Piątek, 15"),
            Err(ParseError::MalformedAnchor(_))
        ));
        assert!(matches!(
            parse_anchor_label("Piątek, 15 Smarca"),
            Err(ParseError::UnknownMonth(_))
        ));
    }

    #[test]
    fn impossible_anchor_date_is_rejected() {
        let anchor = Anchor::new(30, "lutego").expect("anchor");
        assert!(matches!(
            build_timeline(anchor, 2024, 0),
            Err(ParseError::InvalidAnchorDate { day: 30, month: 2, .. })
        ));
    }

    #[test]
    fn year_steps_over_new_year() {
        assert_eq!(resolve_anchor_year(at(2024, 12, 31, 23), 1), 2025);
        assert_eq!(resolve_anchor_year(at(2025, 1, 1, 0), 12), 2024);
        assert_eq!(resolve_anchor_year(at(2024, 12, 30, 10), 12), 2024);
        assert_eq!(resolve_anchor_year(at(2024, 6, 1, 10), 6), 2024);
    }

    #[test]
    fn scrape_time_uses_local_clock() {
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 23, 40, 0).single().unwrap();
        let time = ScrapeTime::at(now, 1).expect("scrape time");
        assert_eq!(time.local_now, at(2025, 1, 1, 0) + Duration::minutes(40));
        assert_eq!(time.gather_date, at(2025, 1, 1, 0) + Duration::minutes(30));
    }
}
