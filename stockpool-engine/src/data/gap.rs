//! Gap detection.
//!
//! A gap is a trading date inside the detection window with no stored row.
//! Cold and warm starts only differ in how the window is chosen; both reduce
//! to `expected - present` over the calendar.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use super::calendar::{CalendarError, TradingCalendar};

/// Missing dates of one instrument. Computed each run, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingRange {
    pub instrument: String,
    /// Ascending, distinct trading dates
    pub dates: Vec<NaiveDate>,
}

impl MissingRange {
    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// First and last missing date.
    pub fn span(&self) -> Option<(NaiveDate, NaiveDate)> {
        Some((*self.dates.first()?, *self.dates.last()?))
    }
}

/// Computes missing trading dates for a stored series.
pub struct GapDetector<'a> {
    calendar: &'a TradingCalendar,
    /// Cold-start window length in calendar days
    max_fill_days: i64,
}

impl<'a> GapDetector<'a> {
    pub fn new(calendar: &'a TradingCalendar, max_fill_days: i64) -> Self {
        Self {
            calendar,
            max_fill_days: max_fill_days.max(0),
        }
    }

    /// Trading dates in `[start, end]` that are not in `series_dates`, in
    /// calendar order.
    pub fn find_missing(
        &self,
        series_dates: &BTreeSet<NaiveDate>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<NaiveDate> {
        self.calendar
            .trading_dates(start, end)
            .into_iter()
            .filter(|d| !series_dates.contains(d))
            .collect()
    }

    /// Detection window for a series as of `latest`.
    ///
    /// Cold start (no rows) looks back `max_fill_days` calendar days; a warm
    /// start spans from the earliest stored date so interior holes surface
    /// as well as the tail.
    pub fn window(
        &self,
        series_dates: &BTreeSet<NaiveDate>,
        latest: NaiveDate,
    ) -> (NaiveDate, NaiveDate) {
        match series_dates.iter().next() {
            Some(first) => (*first, latest),
            None => {
                // Spans past the representable range start at the earliest date
                let start = Duration::try_days(self.max_fill_days.max(0))
                    .and_then(|span| latest.checked_sub_signed(span))
                    .unwrap_or(NaiveDate::MIN);
                (start, latest)
            }
        }
    }

    /// Missing dates for one instrument as of the run date.
    pub fn detect(
        &self,
        instrument: &str,
        series_dates: &BTreeSet<NaiveDate>,
        as_of: NaiveDate,
    ) -> Result<MissingRange, CalendarError> {
        let latest = self.calendar.latest_trading_date(as_of)?;
        let (start, end) = self.window(series_dates, latest);
        let dates = self.find_missing(series_dates, start, end);

        debug!(
            instrument,
            start = %start,
            end = %end,
            cold_start = series_dates.is_empty(),
            missing = dates.len(),
            "Detected gaps"
        );

        Ok(MissingRange {
            instrument: instrument.to_string(),
            dates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn calendar() -> TradingCalendar {
        TradingCalendar::weekdays(d("2023-11-01"), d("2024-01-31"), &[d("2024-01-01")])
    }

    #[test]
    fn test_interior_hole() {
        let cal = TradingCalendar::from_dates(vec![
            d("2024-01-02"),
            d("2024-01-03"),
            d("2024-01-04"),
            d("2024-01-05"),
        ]);
        let detector = GapDetector::new(&cal, 30);
        let present: BTreeSet<_> = [d("2024-01-02"), d("2024-01-04"), d("2024-01-05")].into();

        let missing = detector.detect("X", &present, d("2024-01-05")).unwrap();
        assert_eq!(missing.dates, vec![d("2024-01-03")]);
        assert_eq!(missing.span(), Some((d("2024-01-03"), d("2024-01-03"))));
    }

    #[test]
    fn test_warm_start_trailing_gap() {
        let cal = calendar();
        let detector = GapDetector::new(&cal, 30);
        let present: BTreeSet<_> = [d("2024-01-22"), d("2024-01-23")].into();

        let missing = detector.detect("X", &present, d("2024-01-26")).unwrap();
        assert_eq!(
            missing.dates,
            vec![d("2024-01-24"), d("2024-01-25"), d("2024-01-26")]
        );
    }

    #[test]
    fn test_cold_start_window() {
        let cal = calendar();
        let detector = GapDetector::new(&cal, 14);
        let missing = detector
            .detect("X", &BTreeSet::new(), d("2024-01-28"))
            .unwrap();

        // latest = Fri 01-26, window starts 14 calendar days earlier
        assert_eq!(missing.dates.first(), Some(&d("2024-01-12")));
        assert_eq!(missing.dates.last(), Some(&d("2024-01-26")));
        assert_eq!(missing.dates.len(), 11);
    }

    #[test]
    fn test_huge_cold_start_window_covers_whole_calendar() {
        let cal = calendar();
        let detector = GapDetector::new(&cal, i64::MAX);
        let missing = detector
            .detect("X", &BTreeSet::new(), d("2024-01-31"))
            .unwrap();
        assert_eq!(missing.dates, cal.trading_dates(d("2023-11-01"), d("2024-01-31")));

        let detector = GapDetector::new(&cal, 1_000_000_000);
        let (start, _) = detector.window(&BTreeSet::new(), d("2024-01-31"));
        assert_eq!(start, NaiveDate::MIN);
    }

    #[test]
    fn test_empty_window_is_not_an_error() {
        let cal = calendar();
        let detector = GapDetector::new(&cal, 30);
        let present = BTreeSet::new();
        assert!(detector
            .find_missing(&present, d("2024-01-10"), d("2024-01-01"))
            .is_empty());
        assert!(detector
            .find_missing(&present, d("2024-01-06"), d("2024-01-07"))
            .is_empty());
    }

    #[test]
    fn test_no_calendar_date_before_as_of() {
        let cal = calendar();
        let detector = GapDetector::new(&cal, 30);
        assert!(detector.detect("X", &BTreeSet::new(), d("2020-01-01")).is_err());
    }

    #[test]
    fn test_complete_series_has_no_gaps() {
        let cal = calendar();
        let detector = GapDetector::new(&cal, 30);
        let present: BTreeSet<_> = cal
            .trading_dates(d("2024-01-02"), d("2024-01-31"))
            .into_iter()
            .collect();
        assert!(detector.detect("X", &present, d("2024-01-31")).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn prop_cold_find_missing_equals_calendar(a in 0i64..90, b in 0i64..90) {
            let cal = calendar();
            let detector = GapDetector::new(&cal, 30);
            let base = d("2023-11-01");
            let (start, end) = (base + Duration::days(a), base + Duration::days(b));

            let missing = detector.find_missing(&BTreeSet::new(), start, end);
            prop_assert_eq!(&missing, &cal.trading_dates(start, end));
            prop_assert!(missing.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
