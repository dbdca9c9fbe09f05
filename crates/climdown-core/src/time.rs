//! Calendar dates, the base-unit time axis, and season membership.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{DownscaleError, Result};

/// Days per month of a 366-day climatological year (February kept at 29 so
/// that Feb 29 is a distinct day of year).
const CLIM_YEAR_MONTH_DAYS: [u32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// Days per month of a regular (non-leap) year, used for output-year bounds.
pub(crate) const REGULAR_YEAR_MONTH_DAYS: [u32; 12] =
    [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// A calendar day. Ordered by (year, month, day).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Day {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl Day {
    pub fn new(year: i32, month: u32, day: u32) -> Self {
        Day { year, month, day }
    }

    /// Day of the climatological year, 1-based, with Feb 29 distinct from
    /// Mar 1 (366-day calendar).
    pub fn day_of_clim_year(&self) -> u32 {
        let mut doy = self.day;
        for m in 0..(self.month as usize - 1) {
            doy += CLIM_YEAR_MONTH_DAYS[m];
        }
        doy
    }

    /// Whether this day falls in a season defined by a month set.
    pub fn in_season(&self, months: &[u32]) -> bool {
        months.contains(&self.month)
    }

    fn to_date(self) -> Result<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day).ok_or_else(|| {
            DownscaleError::Calendar(format!("invalid calendar date {self}"))
        })
    }

    fn from_date(date: NaiveDate) -> Self {
        Day {
            year: date.year(),
            month: date.month(),
            day: date.day(),
        }
    }

    /// The next calendar day.
    pub fn succ(&self) -> Result<Day> {
        Ok(Day::from_date(self.to_date()?.succ_opt().ok_or_else(
            || DownscaleError::Calendar(format!("date overflow after {self}")),
        )?))
    }
}

impl std::fmt::Display for Day {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// Base unit of a udunits-style time string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BaseUnit {
    Days,
    Hours,
}

/// A daily time axis anchored to a udunits-style base string such as
/// `"days since 1950-01-01 00:00:00"`. Maps days to contiguous indexes and
/// to base-unit values.
#[derive(Debug, Clone)]
pub struct TimeAxis {
    unit: BaseUnit,
    origin: NaiveDate,
    days: Vec<Day>,
}

impl TimeAxis {
    /// Build a daily axis spanning `begin..=end` (inclusive).
    pub fn daily(base_units: &str, begin: Day, end: Day) -> Result<Self> {
        let (unit, origin) = parse_base_units(base_units)?;
        if end < begin {
            return Err(DownscaleError::Calendar(format!(
                "period end {end} precedes begin {begin}"
            )));
        }
        let mut days = Vec::new();
        let mut cur = begin;
        loop {
            days.push(cur);
            if cur == end {
                break;
            }
            cur = cur.succ()?;
        }
        Ok(TimeAxis { unit, origin, days })
    }

    /// Build an axis from an explicit day sequence, enforcing daily cadence.
    pub fn from_days(base_units: &str, days: Vec<Day>) -> Result<Self> {
        let (unit, origin) = parse_base_units(base_units)?;
        for w in days.windows(2) {
            let d0 = w[0].to_date()?;
            let d1 = w[1].to_date()?;
            if (d1 - d0).num_days() != 1 {
                return Err(DownscaleError::Calendar(format!(
                    "non-daily cadence between {} and {}",
                    w[0], w[1]
                )));
            }
        }
        Ok(TimeAxis { unit, origin, days })
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn days(&self) -> &[Day] {
        &self.days
    }

    pub fn day(&self, index: usize) -> Day {
        self.days[index]
    }

    /// Index of a day on this axis, if covered.
    pub fn index_of(&self, day: Day) -> Option<usize> {
        self.days.binary_search(&day).ok()
    }

    /// Base-unit value of a day (days or hours since the origin, midnight).
    pub fn base_value(&self, day: Day) -> Result<f64> {
        let elapsed = (day.to_date()? - self.origin).num_days() as f64;
        Ok(match self.unit {
            BaseUnit::Days => elapsed,
            BaseUnit::Hours => elapsed * 24.0,
        })
    }
}

/// Parse a udunits-compatible base string (`days since ...` or
/// `hours since ...`, optional clock time).
fn parse_base_units(base_units: &str) -> Result<(BaseUnit, NaiveDate)> {
    let mut parts = base_units.split_whitespace();
    let unit = match parts.next() {
        Some("days") | Some("day") => BaseUnit::Days,
        Some("hours") | Some("hour") => BaseUnit::Hours,
        other => {
            return Err(DownscaleError::Calendar(format!(
                "unsupported base unit in {base_units:?}: {other:?}"
            )))
        }
    };
    if parts.next() != Some("since") {
        return Err(DownscaleError::Calendar(format!(
            "expected 'since' in time units {base_units:?}"
        )));
    }
    let date = parts.next().ok_or_else(|| {
        DownscaleError::Calendar(format!("missing origin date in {base_units:?}"))
    })?;
    let origin = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|e| {
        DownscaleError::Calendar(format!("bad origin date {date:?} in {base_units:?}: {e}"))
    })?;
    // Any trailing clock time ("00:00:00") is accepted and ignored: the axis
    // is daily at midnight.
    Ok((unit, origin))
}

/// Positions in `days` whose month is part of the given season month set,
/// preserving order.
pub fn season_indices(days: &[Day], months: &[u32]) -> Vec<usize> {
    days.iter()
        .enumerate()
        .filter(|(_, d)| d.in_season(months))
        .map(|(i, _)| i)
        .collect()
}

/// Positions in `a` whose calendar day also occurs in `b`, preserving order.
/// This is the learning/model common-period restriction.
pub fn common_indices(a: &[Day], b: &[Day]) -> Vec<usize> {
    let set: std::collections::HashSet<Day> = b.iter().copied().collect();
    a.iter()
        .enumerate()
        .filter(|(_, d)| set.contains(d))
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_of_clim_year_keeps_feb29_distinct() {
        assert_eq!(Day::new(2000, 1, 1).day_of_clim_year(), 1);
        assert_eq!(Day::new(2000, 2, 29).day_of_clim_year(), 60);
        assert_eq!(Day::new(2000, 3, 1).day_of_clim_year(), 61);
        assert_eq!(Day::new(2001, 3, 1).day_of_clim_year(), 61);
        assert_eq!(Day::new(2000, 12, 31).day_of_clim_year(), 366);
    }

    #[test]
    fn daily_axis_maps_days_to_indexes() {
        let axis =
            TimeAxis::daily("days since 1950-01-01", Day::new(2000, 1, 1), Day::new(2000, 3, 1))
                .unwrap();
        assert_eq!(axis.len(), 61);
        assert_eq!(axis.index_of(Day::new(2000, 2, 29)), Some(59));
        assert_eq!(axis.index_of(Day::new(2001, 1, 1)), None);
        assert_eq!(axis.base_value(Day::new(1950, 1, 2)).unwrap(), 1.0);
    }

    #[test]
    fn hours_base_unit_scales_values() {
        let axis =
            TimeAxis::daily("hours since 2000-01-01 00:00:00", Day::new(2000, 1, 1), Day::new(2000, 1, 3))
                .unwrap();
        assert_eq!(axis.base_value(Day::new(2000, 1, 2)).unwrap(), 24.0);
    }

    #[test]
    fn non_daily_cadence_is_rejected() {
        let days = vec![Day::new(2000, 1, 1), Day::new(2000, 1, 3)];
        let err = TimeAxis::from_days("days since 1950-01-01", days).unwrap_err();
        assert!(matches!(err, DownscaleError::Calendar(_)));
    }

    #[test]
    fn unknown_base_unit_is_rejected() {
        assert!(parse_base_units("fortnights since 1950-01-01").is_err());
        assert!(parse_base_units("days after 1950-01-01").is_err());
    }

    #[test]
    fn season_and_common_restrictions() {
        let axis =
            TimeAxis::daily("days since 1950-01-01", Day::new(2000, 1, 30), Day::new(2000, 3, 2))
                .unwrap();
        let idx = season_indices(axis.days(), &[2]);
        assert_eq!(idx.len(), 29);
        assert_eq!(axis.day(idx[0]), Day::new(2000, 2, 1));

        let other = vec![Day::new(2000, 2, 28), Day::new(2000, 2, 29), Day::new(2000, 3, 1)];
        let common = common_indices(axis.days(), &other);
        assert_eq!(common.len(), 3);
        assert_eq!(axis.day(common[2]), Day::new(2000, 3, 1));
    }
}
