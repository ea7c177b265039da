//! Forgiving scalar extraction from raw cell text.
//!
//! Only the first short numeric match of a cell survives: a sign, an integer
//! part of at most two digits when a decimal point follows (one digit
//! otherwise), and one or two fractional digits. `"1013 hPa"` therefore reads
//! as `101`, the precision ceiling of the source data.

use std::sync::LazyLock;

use regex::Regex;

static VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-?[0-9]?[0-9]\.[0-9]{1,2}|-?[0-9]?\.?[0-9]{1,2}").expect("value regex")
});

static WHOLE_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-?[0-9]+").expect("whole number regex"));

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.filter(|s| !s.trim().is_empty())
}

/// Extract the first short numeric value, accepting `,` as decimal separator.
pub fn extract_value(raw: Option<&str>) -> Option<f64> {
    let text = non_empty(raw)?.replace(',', ".");
    VALUE_RE.find(&text)?.as_str().parse().ok()
}

/// First run of digits, optionally signed; used for wind speed.
pub fn extract_whole_number(raw: Option<&str>) -> Option<f64> {
    let text = non_empty(raw)?;
    WHOLE_NUMBER_RE.find(text)?.as_str().parse().ok()
}

/// Free-text cell with surrounding whitespace removed.
pub fn extract_label(raw: Option<&str>) -> Option<String> {
    non_empty(raw).map(|s| s.trim().to_string())
}

pub fn has_digit(raw: &str) -> bool {
    raw.chars().any(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_decimal_with_unit() {
        assert_eq!(extract_value(Some("12,5°C")), Some(12.5));
    }

    #[test]
    fn negative_decimal_with_unit() {
        assert_eq!(extract_value(Some("-3.2 mm")), Some(-3.2));
    }

    #[test]
    fn missing_and_non_numeric_are_null() {
        assert_eq!(extract_value(None), None);
        assert_eq!(extract_value(Some("")), None);
        assert_eq!(extract_value(Some("   ")), None);
        assert_eq!(extract_value(Some("N/A")), None);
    }

    #[test]
    fn only_first_short_match_is_kept() {
        assert_eq!(extract_value(Some("Odczuwalna 11°C")), Some(11.0));
        assert_eq!(extract_value(Some("100%")), Some(100.0));
        assert_eq!(extract_value(Some("1.234")), Some(1.23));
        assert_eq!(extract_value(Some("1013 hPa")), Some(101.0));
        assert_eq!(extract_value(Some("0,3 mm / 12 mm")), Some(0.3));
    }

    #[test]
    fn wind_speed_reads_whole_digits() {
        assert_eq!(extract_whole_number(Some("15")), Some(15.0));
        assert_eq!(extract_whole_number(Some(" 104 km/h")), Some(104.0));
        assert_eq!(extract_whole_number(Some("cisza")), None);
        assert_eq!(extract_whole_number(None), None);
    }

    #[test]
    fn labels_are_trimmed_and_blank_is_null() {
        assert_eq!(extract_label(Some(" Pochmurno ")), Some("Pochmurno".to_string()));
        assert_eq!(extract_label(Some("")), None);
    }
}
