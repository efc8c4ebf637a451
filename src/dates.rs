//! Year inference for show dates.
//!
//! Listings frequently print "Sat, Dec 15" with no year. Which year is meant
//! depends on where the listing came from: an artist's tour page is normally
//! about upcoming shows, a "past concerts" section is about the opposite.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::DateResolutionError;

pub const DEFAULT_YEAR_WINDOW: i32 = 8;
pub const MAX_YEAR_WINDOW: i32 = 100;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z]+|\d+(?:st|nd|rd|th)?").unwrap());
static HINT_BEFORE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b((?:19|20)\d{2})\s+(?:[a-z]+\s+){0,2}(?:tour|shows|dates|concerts)\b").unwrap()
});
static HINT_AFTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:tour|shows|dates|concerts)\s*[:\-]?\s+((?:19|20)\d{2})\b").unwrap()
});

const MONTHS: [&str; 12] = [
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december",
];
const WEEKDAYS: [&str; 7] = [
    "monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday",
];
const FILLER: [&str; 2] = ["of", "the"];

/// A date as handed over by extraction: either already concrete, or free text
/// that may lack a year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DateExpression {
    Concrete(NaiveDate),
    Partial(String),
}

impl DateExpression {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        // Extractors sometimes return full timestamps; the day is what counts.
        let (head, rest) = match raw.get(..10) {
            Some(head) => (head, &raw[10..]),
            None => (raw, ""),
        };
        ["%Y-%m-%d", "%Y/%m/%d"]
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(head, fmt).ok())
            .filter(|_| rest.is_empty() || rest.starts_with(['T', ' ']))
            .map(DateExpression::Concrete)
            .unwrap_or_else(|| DateExpression::Partial(raw.to_string()))
    }
}

impl From<String> for DateExpression {
    fn from(raw: String) -> Self {
        DateExpression::parse(&raw)
    }
}

impl From<DateExpression> for String {
    fn from(expr: DateExpression) -> Self {
        expr.to_string()
    }
}

impl fmt::Display for DateExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DateExpression::Concrete(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            DateExpression::Partial(s) => f.write_str(s),
        }
    }
}

/// Which way to lean when the year is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateBias {
    /// Next occurrence on or after the reference day.
    FutureLeaning,
    /// Latest occurrence on or before the reference day.
    PastLeaning,
    /// Use a year stated in the surrounding text ("2025 Tour"), else lean forward.
    AutoDetect { context: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MonthDay {
    month: u32,
    day: u32,
    year: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
pub struct DateResolver {
    window: i32,
}

impl Default for DateResolver {
    fn default() -> Self {
        Self {
            window: DEFAULT_YEAR_WINDOW,
        }
    }
}

impl DateResolver {
    /// `window` bounds the year search in either direction.
    pub fn new(window: i32) -> Self {
        Self {
            window: window.clamp(0, MAX_YEAR_WINDOW),
        }
    }

    pub fn resolve(
        &self,
        raw: &DateExpression,
        reference_now: NaiveDate,
        bias: &DateBias,
    ) -> Result<NaiveDate, DateResolutionError> {
        let text = match raw {
            DateExpression::Concrete(d) => return Ok(*d),
            DateExpression::Partial(text) => text,
        };
        let parsed = parse_month_day(text)?;
        let MonthDay { month, day, .. } = parsed;

        // Reject days that exist in no year at all (e.g. April 31).
        if NaiveDate::from_ymd_opt(2000, month, day).is_none() {
            return Err(DateResolutionError::InvalidDate { month, day });
        }

        if let Some(year) = parsed.year {
            return NaiveDate::from_ymd_opt(year, month, day)
                .ok_or(DateResolutionError::InvalidDate { month, day });
        }

        match bias {
            DateBias::FutureLeaning => self.next_on_or_after(month, day, reference_now),
            DateBias::PastLeaning => self.last_on_or_before(month, day, reference_now),
            DateBias::AutoDetect { context } => match year_hint(context) {
                Some(year) => NaiveDate::from_ymd_opt(year, month, day)
                    .ok_or(DateResolutionError::InvalidDate { month, day }),
                None => self.next_on_or_after(month, day, reference_now),
            },
        }
    }

    fn next_on_or_after(
        &self,
        month: u32,
        day: u32,
        now: NaiveDate,
    ) -> Result<NaiveDate, DateResolutionError> {
        (now.year()..=now.year() + self.window)
            .filter_map(|y| NaiveDate::from_ymd_opt(y, month, day))
            .find(|d| *d >= now)
            .ok_or_else(|| self.no_occurrence(month, day, now))
    }

    fn last_on_or_before(
        &self,
        month: u32,
        day: u32,
        now: NaiveDate,
    ) -> Result<NaiveDate, DateResolutionError> {
        (now.year() - self.window..=now.year())
            .rev()
            .filter_map(|y| NaiveDate::from_ymd_opt(y, month, day))
            .find(|d| *d <= now)
            .ok_or_else(|| self.no_occurrence(month, day, now))
    }

    fn no_occurrence(&self, month: u32, day: u32, reference: NaiveDate) -> DateResolutionError {
        DateResolutionError::NoOccurrence {
            month,
            day,
            window: self.window,
            reference,
        }
    }
}

/// Resolve with the default search window.
pub fn resolve(
    raw: &DateExpression,
    reference_now: NaiveDate,
    bias: &DateBias,
) -> Result<NaiveDate, DateResolutionError> {
    DateResolver::default().resolve(raw, reference_now, bias)
}

/// A year explicitly attached to a tour-like word. Several distinct years make
/// the hint ambiguous, and then there is none.
pub fn year_hint(context: &str) -> Option<i32> {
    let years: BTreeSet<i32> = HINT_BEFORE_RE
        .captures_iter(context)
        .chain(HINT_AFTER_RE.captures_iter(context))
        .filter_map(|c| c[1].parse().ok())
        .collect();
    match years.len() {
        1 => years.into_iter().next(),
        _ => None,
    }
}

fn month_from_token(token: &str) -> Option<u32> {
    if token.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|m| m.starts_with(token))
        .map(|i| i as u32 + 1)
}

fn is_weekday(token: &str) -> bool {
    token.len() >= 3 && WEEKDAYS.iter().any(|w| w.starts_with(token))
}

/// Accepts "December 15", "Dec 15th", "15 December 2024", "Sat, Sep 10",
/// "March 1, 2023" and similar. Numeric-only forms other than ISO are
/// ambiguous between day-first and month-first and are rejected.
fn parse_month_day(text: &str) -> Result<MonthDay, DateResolutionError> {
    let unparseable = || DateResolutionError::Unparseable(text.to_string());
    let lower = text.to_lowercase();

    let mut month = None;
    let mut day = None;
    let mut year = None;

    for token in TOKEN_RE.find_iter(&lower).map(|m| m.as_str()) {
        if token.starts_with(|c: char| c.is_ascii_digit()) {
            let digits = token.trim_end_matches(|c: char| c.is_ascii_alphabetic());
            let value: u32 = digits.parse().map_err(|_| unparseable())?;
            if digits.len() == 4 {
                if year.replace(value as i32).is_some() {
                    return Err(unparseable());
                }
            } else if digits.len() <= 2 && (1..=31).contains(&value) {
                if day.replace(value).is_some() {
                    return Err(unparseable());
                }
            } else {
                return Err(unparseable());
            }
        } else if let Some(m) = month_from_token(token) {
            // A second month means a range.
            if month.replace(m).is_some() {
                return Err(unparseable());
            }
        } else if is_weekday(token) || FILLER.contains(&token) {
            continue;
        } else {
            return Err(unparseable());
        }
    }

    match (month, day) {
        (Some(month), Some(day)) => Ok(MonthDay { month, day, year }),
        _ => Err(unparseable()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn partial(s: &str) -> DateExpression {
        DateExpression::parse(s)
    }

    #[test]
    fn future_leaning_same_year() {
        let got = resolve(&partial("December 15"), date(2024, 6, 1), &DateBias::FutureLeaning);
        assert_eq!(got, Ok(date(2024, 12, 15)));
    }

    #[test]
    fn future_leaning_rolls_to_next_year() {
        let got = resolve(&partial("April 23"), date(2024, 6, 1), &DateBias::FutureLeaning);
        assert_eq!(got, Ok(date(2025, 4, 23)));
    }

    #[test]
    fn same_day_counts_as_future() {
        let got = resolve(&partial("June 1"), date(2024, 6, 1), &DateBias::FutureLeaning);
        assert_eq!(got, Ok(date(2024, 6, 1)));
    }

    #[test]
    fn explicit_year_passes_through_any_bias() {
        for bias in [
            DateBias::FutureLeaning,
            DateBias::PastLeaning,
            DateBias::AutoDetect {
                context: "2025 Tour".into(),
            },
        ] {
            let got = resolve(&partial("March 1, 2023"), date(2024, 6, 1), &bias);
            assert_eq!(got, Ok(date(2023, 3, 1)));
        }
    }

    #[test]
    fn past_leaning() {
        let now = date(2024, 6, 1);
        assert_eq!(
            resolve(&partial("December 15"), now, &DateBias::PastLeaning),
            Ok(date(2023, 12, 15))
        );
        assert_eq!(
            resolve(&partial("April 23"), now, &DateBias::PastLeaning),
            Ok(date(2024, 4, 23))
        );
    }

    #[test]
    fn auto_detect_uses_tour_year() {
        let bias = DateBias::AutoDetect {
            context: "Men I Trust 2023 Tour\nApril 23 - Paris".into(),
        };
        assert_eq!(resolve(&partial("April 23"), date(2024, 6, 1), &bias), Ok(date(2023, 4, 23)));
    }

    #[test]
    fn auto_detect_falls_back_to_future() {
        let bias = DateBias::AutoDetect {
            context: "Tour dates\n© 2019 Some Label".into(),
        };
        assert_eq!(resolve(&partial("April 23"), date(2024, 6, 1), &bias), Ok(date(2025, 4, 23)));
    }

    #[test]
    fn leap_day_searches_forward_for_a_leap_year() {
        let got = resolve(&partial("February 29"), date(2025, 3, 1), &DateBias::FutureLeaning);
        assert_eq!(got, Ok(date(2028, 2, 29)));
        let got = resolve(&partial("Feb 29"), date(2025, 3, 1), &DateBias::PastLeaning);
        assert_eq!(got, Ok(date(2024, 2, 29)));
    }

    #[test]
    fn oversized_window_is_clamped() {
        let resolver = DateResolver::new(i32::MAX);
        let got = resolver.resolve(&partial("February 29"), date(2025, 3, 1), &DateBias::FutureLeaning);
        assert_eq!(got, Ok(date(2028, 2, 29)));
        let got = resolver.resolve(&partial("February 29"), date(2025, 3, 1), &DateBias::PastLeaning);
        assert_eq!(got, Ok(date(2024, 2, 29)));
    }

    #[test]
    fn leap_day_outside_window_fails() {
        let resolver = DateResolver::new(2);
        let got = resolver.resolve(&partial("February 29"), date(2025, 3, 1), &DateBias::FutureLeaning);
        assert!(matches!(got, Err(DateResolutionError::NoOccurrence { month: 2, day: 29, .. })));
    }

    #[test]
    fn leap_day_with_non_leap_hint_fails() {
        let bias = DateBias::AutoDetect {
            context: "2025 tour".into(),
        };
        let got = resolve(&partial("February 29"), date(2024, 6, 1), &bias);
        assert_eq!(got, Err(DateResolutionError::InvalidDate { month: 2, day: 29 }));
    }

    #[test]
    fn accepted_shapes() {
        let now = date(2024, 6, 1);
        let f = DateBias::FutureLeaning;
        for (raw, want) in [
            ("Dec 15th", date(2024, 12, 15)),
            ("15 December", date(2024, 12, 15)),
            ("Sat, Sep 10", date(2024, 9, 10)),
            ("Sept. 10", date(2024, 9, 10)),
            ("the 3rd of July", date(2024, 7, 3)),
            ("10 Sep 2026", date(2026, 9, 10)),
        ] {
            assert_eq!(resolve(&partial(raw), now, &f), Ok(want), "{raw}");
        }
    }

    #[test]
    fn rejected_shapes() {
        let now = date(2024, 6, 1);
        for raw in ["TBA", "10/09", "June", "April 31", "May 3 - May 5", ""] {
            assert!(resolve(&partial(raw), now, &DateBias::FutureLeaning).is_err(), "{raw}");
        }
    }

    #[test]
    fn iso_dates_are_concrete() {
        assert_eq!(partial("2024-09-10"), DateExpression::Concrete(date(2024, 9, 10)));
        assert_eq!(
            partial("2024-09-10T20:00:00"),
            DateExpression::Concrete(date(2024, 9, 10))
        );
        assert!(matches!(partial("September 10"), DateExpression::Partial(_)));
    }

    #[test]
    fn year_hint_requires_single_tour_year() {
        assert_eq!(year_hint("The 2025 Tour"), Some(2025));
        assert_eq!(year_hint("Tour: 2024"), Some(2024));
        assert_eq!(year_hint("2024 European tour"), Some(2024));
        assert_eq!(year_hint("2024 Tour ... 2025 Tour"), None);
        assert_eq!(year_hint("Copyright 2021"), None);
    }

    #[test]
    fn deserializes_from_json_string() {
        let expr: DateExpression = serde_json::from_str("\"2024-09-10\"").unwrap();
        assert_eq!(expr, DateExpression::Concrete(date(2024, 9, 10)));
        let expr: DateExpression = serde_json::from_str("\"July 4\"").unwrap();
        assert_eq!(expr, DateExpression::Partial("July 4".into()));
    }
}
