//! Trading calendar.
//!
//! The calendar is the single authority on which dates are trading dates.
//! It is loaded once per run from a static source and never mutated, so
//! every query is a pure function of the source.
//!
//! # Sources
//! - A calendar file: JSON array of ISO dates, or one ISO date per line
//!   (blank lines and `#` comments ignored)
//! - A weekday calendar: Monday to Friday minus configured holidays

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use std::collections::BTreeSet;
use std::path::Path;
use stockpool_common::config::CalendarConfig;
use thiserror::Error;
use tracing::{debug, info};

/// Calendar failure. Fatal for a run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CalendarError {
    #[error("Calendar unavailable: {0}")]
    Unavailable(String),
}

/// Ordered set of distinct trading dates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TradingCalendar {
    /// Strictly increasing
    dates: Vec<NaiveDate>,
}

impl TradingCalendar {
    /// Build a calendar from any collection of dates. Order and duplicates
    /// in the input do not matter.
    pub fn from_dates(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        let set: BTreeSet<NaiveDate> = dates.into_iter().collect();
        Self {
            dates: set.into_iter().collect(),
        }
    }

    /// Monday to Friday in `[since, until]` minus `holidays`.
    pub fn weekdays(since: NaiveDate, until: NaiveDate, holidays: &[NaiveDate]) -> Self {
        let holidays: BTreeSet<NaiveDate> = holidays.iter().copied().collect();
        let mut dates = Vec::new();
        let mut day = since;
        while day <= until {
            if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) && !holidays.contains(&day)
            {
                dates.push(day);
            }
            day += Duration::days(1);
        }
        Self { dates }
    }

    /// Load a calendar file.
    pub fn load_from_file(path: &Path) -> Result<Self, CalendarError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CalendarError::Unavailable(format!("failed to read {}: {}", path.display(), e))
        })?;
        let calendar = Self::parse(&content).map_err(|e| {
            CalendarError::Unavailable(format!("failed to parse {}: {}", path.display(), e))
        })?;
        info!(
            path = %path.display(),
            dates = calendar.len(),
            "Loaded trading calendar"
        );
        Ok(calendar)
    }

    /// Parse calendar file content.
    pub fn parse(content: &str) -> Result<Self, String> {
        let trimmed = content.trim_start();
        if trimmed.starts_with('[') {
            let dates: Vec<NaiveDate> =
                serde_json::from_str(trimmed).map_err(|e| e.to_string())?;
            return Ok(Self::from_dates(dates));
        }

        let mut dates = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let date = line
                .parse::<NaiveDate>()
                .map_err(|e| format!("line {}: '{}': {}", lineno + 1, line, e))?;
            dates.push(date);
        }
        Ok(Self::from_dates(dates))
    }

    /// Build the calendar described by the configuration, covering dates up
    /// to `as_of`.
    pub fn from_config(config: &CalendarConfig, as_of: NaiveDate) -> Result<Self, CalendarError> {
        match &config.path {
            Some(path) => Self::load_from_file(path),
            None => {
                let calendar = Self::weekdays(config.since, as_of, &config.holidays);
                debug!(
                    since = %config.since,
                    as_of = %as_of,
                    dates = calendar.len(),
                    "Generated weekday calendar"
                );
                Ok(calendar)
            }
        }
    }

    /// Trading dates in `[start, end]`, ascending. Empty when `start > end`.
    pub fn trading_dates(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        if start > end {
            return Vec::new();
        }
        let lo = self.dates.partition_point(|d| *d < start);
        let hi = self.dates.partition_point(|d| *d <= end);
        self.dates[lo..hi].to_vec()
    }

    /// Latest trading date at or before `as_of`.
    pub fn latest_trading_date(&self, as_of: NaiveDate) -> Result<NaiveDate, CalendarError> {
        let idx = self.dates.partition_point(|d| *d <= as_of);
        if idx == 0 {
            return Err(CalendarError::Unavailable(format!(
                "no trading date at or before {}",
                as_of
            )));
        }
        Ok(self.dates[idx - 1])
    }

    pub fn is_trading_date(&self, date: NaiveDate) -> bool {
        self.dates.binary_search(&date).is_ok()
    }

    /// Index of a trading date within the calendar.
    pub fn position(&self, date: NaiveDate) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    /// Up to `n` trading dates ending at `date` (inclusive, when `date` is a
    /// trading date), ascending.
    pub fn trailing(&self, date: NaiveDate, n: usize) -> &[NaiveDate] {
        let hi = self.dates.partition_point(|d| *d <= date);
        let lo = hi.saturating_sub(n);
        &self.dates[lo..hi]
    }

    /// The trading date `n` positions before `date`, or the first calendar
    /// date when the calendar is shorter.
    pub fn shift_back(&self, date: NaiveDate, n: usize) -> Option<NaiveDate> {
        let hi = self.dates.partition_point(|d| *d <= date);
        if hi == 0 {
            return None;
        }
        let idx = (hi - 1).saturating_sub(n);
        Some(self.dates[idx])
    }

    /// Trading dates in `(from, to]`. Zero when `to <= from`.
    pub fn trading_days_between(&self, from: NaiveDate, to: NaiveDate) -> usize {
        if to <= from {
            return 0;
        }
        let lo = self.dates.partition_point(|d| *d <= from);
        let hi = self.dates.partition_point(|d| *d <= to);
        hi - lo
    }

    pub fn first(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn last(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn january() -> TradingCalendar {
        TradingCalendar::from_dates(
            ["2024-01-02", "2024-01-03", "2024-01-04", "2024-01-05", "2024-01-08"]
                .iter()
                .map(|s| d(s)),
        )
    }

    #[test]
    fn test_from_dates_sorts_and_dedups() {
        let cal = TradingCalendar::from_dates(vec![
            d("2024-01-04"),
            d("2024-01-02"),
            d("2024-01-04"),
        ]);
        assert_eq!(cal.trading_dates(d("2024-01-01"), d("2024-12-31")), vec![
            d("2024-01-02"),
            d("2024-01-04")
        ]);
    }

    #[test]
    fn test_trading_dates_range() {
        let cal = january();
        assert_eq!(
            cal.trading_dates(d("2024-01-03"), d("2024-01-06")),
            vec![d("2024-01-03"), d("2024-01-04"), d("2024-01-05")]
        );
        assert!(cal.trading_dates(d("2024-01-06"), d("2024-01-07")).is_empty());
        assert!(cal.trading_dates(d("2024-01-05"), d("2024-01-02")).is_empty());
    }

    #[test]
    fn test_latest_trading_date() {
        let cal = january();
        assert_eq!(cal.latest_trading_date(d("2024-01-07")).unwrap(), d("2024-01-05"));
        assert_eq!(cal.latest_trading_date(d("2024-01-08")).unwrap(), d("2024-01-08"));
        assert!(matches!(
            cal.latest_trading_date(d("2023-12-31")),
            Err(CalendarError::Unavailable(_))
        ));
        assert!(TradingCalendar::default()
            .latest_trading_date(d("2024-01-01"))
            .is_err());
    }

    #[test]
    fn test_weekdays_skip_weekends_and_holidays() {
        let cal = TradingCalendar::weekdays(d("2024-01-01"), d("2024-01-09"), &[d("2024-01-01")]);
        assert_eq!(cal.len(), 6);
        assert!(!cal.is_trading_date(d("2024-01-06")));
        assert!(!cal.is_trading_date(d("2024-01-01")));
        assert!(cal.is_trading_date(d("2024-01-08")));
    }

    #[test]
    fn test_trailing_and_shift_back() {
        let cal = january();
        assert_eq!(cal.trailing(d("2024-01-05"), 2), &[d("2024-01-04"), d("2024-01-05")]);
        // Non-trading date anchors at the previous trading date
        assert_eq!(cal.trailing(d("2024-01-06"), 1), &[d("2024-01-05")]);
        assert_eq!(cal.trailing(d("2024-01-03"), 10).len(), 2);
        assert_eq!(cal.shift_back(d("2024-01-05"), 2), Some(d("2024-01-03")));
        assert_eq!(cal.shift_back(d("2024-01-05"), 60), Some(d("2024-01-02")));
        assert_eq!(cal.shift_back(d("2023-01-01"), 1), None);
    }

    #[test]
    fn test_trading_days_between() {
        let cal = january();
        assert_eq!(cal.trading_days_between(d("2024-01-02"), d("2024-01-05")), 3);
        assert_eq!(cal.trading_days_between(d("2024-01-05"), d("2024-01-08")), 1);
        assert_eq!(cal.trading_days_between(d("2024-01-05"), d("2024-01-05")), 0);
        assert_eq!(cal.trading_days_between(d("2024-01-08"), d("2024-01-02")), 0);
    }

    #[test]
    fn test_parse_line_format() {
        let cal = TradingCalendar::parse("# SSE 2024\n2024-01-03\n\n2024-01-02\n").unwrap();
        assert_eq!(cal.first(), Some(d("2024-01-02")));
        assert_eq!(cal.len(), 2);
        assert!(TradingCalendar::parse("2024-13-40\n").is_err());
    }

    #[test]
    fn test_parse_json_format() {
        let cal = TradingCalendar::parse(r#"["2024-01-05", "2024-01-04"]"#).unwrap();
        assert_eq!(cal.last(), Some(d("2024-01-05")));
    }

    #[test]
    fn test_load_missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let result = TradingCalendar::load_from_file(&dir.path().join("nope.txt"));
        assert!(matches!(result, Err(CalendarError::Unavailable(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calendar.txt");
        std::fs::write(&path, "2024-01-02\n2024-01-03\n").unwrap();
        let cal = TradingCalendar::load_from_file(&path).unwrap();
        assert_eq!(cal.len(), 2);
    }

    fn arb_dates() -> impl Strategy<Value = Vec<NaiveDate>> {
        prop::collection::vec(0i64..400, 0..80).prop_map(|offsets| {
            let base = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
            offsets.into_iter().map(|o| base + Duration::days(o)).collect()
        })
    }

    proptest! {
        #[test]
        fn prop_calendar_is_restartable(dates in arb_dates(), a in 0i64..400, b in 0i64..400) {
            let base = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
            let (start, end) = (base + Duration::days(a), base + Duration::days(b));

            let mut reversed = dates.clone();
            reversed.reverse();
            let first = TradingCalendar::from_dates(dates);
            let second = TradingCalendar::from_dates(reversed);

            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.trading_dates(start, end), second.trading_dates(start, end));
            prop_assert_eq!(
                first.latest_trading_date(end).ok(),
                second.latest_trading_date(end).ok()
            );
        }

        #[test]
        fn prop_trading_dates_strictly_increasing(dates in arb_dates(), a in 0i64..400, b in 0i64..400) {
            let base = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
            let cal = TradingCalendar::from_dates(dates);
            let range = cal.trading_dates(base + Duration::days(a), base + Duration::days(b));
            prop_assert!(range.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
