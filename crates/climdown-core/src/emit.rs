//! Contract between the engine and the external output layer.
//!
//! The engine hands one [`DownscaledDay`] per merged record to an
//! [`AnalogEmitter`]; gridded reconstruction and NetCDF writing live outside
//! the core. Output files span one "output year" beginning at the configured
//! month.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::merge::MergedRecords;
use crate::time::{Day, TimeAxis, REGULAR_YEAR_MONTH_DAYS};

/// One candidate of the first selection as it leaves the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmittedCandidate {
    pub date: Day,
    pub metric_norm: f64,
    pub delta: f64,
}

/// Everything the output layer needs for one downscaled day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownscaledDay {
    /// The day being downscaled and its position on the model axis.
    pub date: Day,
    pub model_index: usize,
    /// Base-unit time value of the downscaled day.
    pub time_value: f64,
    /// The chosen analog day and its position in the learning season.
    pub analog_date: Day,
    pub analog_index: usize,
    /// Temperature correction in physical units.
    pub delta: f64,
    pub candidates: Vec<EmittedCandidate>,
    /// Normalized distance to the assigned cluster, and the cluster itself.
    pub cluster_dist: f64,
    pub class_id: usize,
}

/// Receives the downscaled stream in global time order.
pub trait AnalogEmitter {
    fn emit(&mut self, day: &DownscaledDay) -> Result<()>;
}

/// Stream every merged record through the emitter in time order.
pub fn stream_records(
    merged: &MergedRecords,
    axis: &TimeAxis,
    emitter: &mut dyn AnalogEmitter,
) -> Result<()> {
    for day in &merged.days {
        let record = DownscaledDay {
            date: day.analog.model_day,
            model_index: day.analog.model_axis_index,
            time_value: axis.base_value(day.analog.model_day)?,
            analog_date: day.analog.day,
            analog_index: day.analog.learn_index,
            delta: day.delta.delta,
            candidates: day
                .analog
                .candidates
                .iter()
                .zip(day.delta.candidate_deltas.iter())
                .map(|(c, &delta)| EmittedCandidate {
                    date: c.day,
                    metric_norm: c.metric_norm,
                    delta,
                })
                .collect(),
            cluster_dist: day.cluster_dist,
            class_id: day.class_id,
        };
        emitter.emit(&record)?;
    }
    Ok(())
}

/// First and last day of the output year containing `day`, for a year that
/// begins at `month_begin`. The closing month length is taken from a regular
/// (non-leap) year.
pub fn output_year_bounds(day: Day, month_begin: u32) -> (Day, Day) {
    let start_year = if day.month < month_begin {
        day.year - 1
    } else {
        day.year
    };
    let (end_year, end_month) = if month_begin == 1 {
        (start_year, 12)
    } else {
        (start_year + 1, month_begin - 1)
    };
    let end_day = REGULAR_YEAR_MONTH_DAYS[end_month as usize - 1];
    (
        Day::new(start_year, month_begin, 1),
        Day::new(end_year, end_month, end_day),
    )
}

/// Output filename for a variable over the output year containing `day`,
/// e.g. `evapn_1d_19790801_19800731.nc`.
pub fn output_filename(var: &str, day: Day, month_begin: u32) -> String {
    let (begin, end) = output_year_bounds(day, month_begin);
    format!(
        "{var}_1d_{:04}{:02}{:02}_{:04}{:02}{:02}.nc",
        begin.year, begin.month, begin.day, end.year, end.month, end.day
    )
}

/// Consecutive slices of the merged record stream that fall into the same
/// output year, with that year's bounds. The stream is already time-ordered,
/// so each output year surfaces exactly once.
pub fn output_year_groups(
    merged: &MergedRecords,
    month_begin: u32,
) -> Vec<((Day, Day), std::ops::Range<usize>)> {
    let mut groups: Vec<((Day, Day), std::ops::Range<usize>)> = Vec::new();
    for (i, day) in merged.days.iter().enumerate() {
        let bounds = output_year_bounds(day.analog.model_day, month_begin);
        match groups.last_mut() {
            Some((current, range)) if *current == bounds => range.end = i + 1,
            _ => groups.push((bounds, i..i + 1)),
        }
    }
    groups
}
