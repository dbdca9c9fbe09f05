//! Daily climatology of a gridded field and seasonal-cycle removal.
//!
//! The climatological year has 366 slots (Feb 29 included). Slots never
//! observed are filled by circular interpolation before the climatology is
//! smoothed with a cyclic Hanning window and subtracted from the field.

use crate::error::{DownscaleError, Result};
use crate::field::Field;
use crate::time::Day;

/// Length of the climatological year.
pub const CLIM_YEAR_DAYS: usize = 366;

/// Smooth a series with a cyclic Hanning-weighted moving average. The
/// window covers `width` points, forced odd so it stays centered; a width
/// below three returns the series unchanged.
pub fn filter_cyclic(series: &[f64], width: usize) -> Vec<f64> {
    let n = series.len();
    if n == 0 || width < 3 {
        return series.to_vec();
    }
    let span = if width % 2 == 0 { width + 1 } else { width };
    let span = span.min(if n % 2 == 0 { n - 1 } else { n });
    if span < 3 {
        return series.to_vec();
    }
    let half = span / 2;

    let mut weights = Vec::with_capacity(span);
    for i in 0..span {
        let phase = 2.0 * std::f64::consts::PI * i as f64 / (span - 1) as f64;
        weights.push(0.5 * (1.0 - phase.cos()));
    }
    let total: f64 = weights.iter().sum();

    let mut out = vec![0.0; n];
    for (t, slot) in out.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (i, w) in weights.iter().enumerate() {
            let offset = i as i64 - half as i64;
            let src = (t as i64 + offset).rem_euclid(n as i64) as usize;
            acc += w * series[src];
        }
        *slot = acc / total;
    }
    out
}

/// Per-cell daily climatology of a field, as 366 slabs in day-of-year
/// order, smoothed with a cyclic Hanning filter of `filter_width` days.
/// Missing cells are skipped; a day of year with no observation at all for
/// a cell is interpolated from its nearest observed neighbors around the
/// cycle.
pub fn daily_climatology(field: &Field, days: &[Day], filter_width: usize) -> Result<Vec<f64>> {
    if field.ntime != days.len() {
        return Err(DownscaleError::DimensionMismatch {
            context: "climatology calendar".to_string(),
            expected: format!("{}", field.ntime),
            got: format!("{}", days.len()),
        });
    }
    let n_cells = field.nlat * field.nlon;
    let mut sum = vec![0.0; CLIM_YEAR_DAYS * n_cells];
    let mut count = vec![0usize; CLIM_YEAR_DAYS * n_cells];

    for (t, day) in days.iter().enumerate() {
        let doy = day.day_of_clim_year() as usize - 1;
        let slab = field.slab(t);
        for (c, &v) in slab.iter().enumerate() {
            if v != field.missing {
                sum[doy * n_cells + c] += v;
                count[doy * n_cells + c] += 1;
            }
        }
    }

    let mut clim = vec![0.0; CLIM_YEAR_DAYS * n_cells];
    for c in 0..n_cells {
        let mut series = vec![None; CLIM_YEAR_DAYS];
        for (doy, slot) in series.iter_mut().enumerate() {
            if count[doy * n_cells + c] > 0 {
                *slot = Some(sum[doy * n_cells + c] / count[doy * n_cells + c] as f64);
            }
        }
        let filled = fill_circular(&series).ok_or_else(|| {
            DownscaleError::Calendar(format!(
                "cell {c} has no valid observation for any day of year"
            ))
        })?;
        let smoothed = filter_cyclic(&filled, filter_width);
        for (doy, v) in smoothed.iter().enumerate() {
            clim[doy * n_cells + c] = *v;
        }
    }
    Ok(clim)
}

/// Subtract a 366-slab climatology from a field; missing cells pass
/// through.
pub fn remove_seasonal_cycle(field: &Field, days: &[Day], clim: &[f64]) -> Result<Field> {
    let n_cells = field.nlat * field.nlon;
    if field.ntime != days.len() {
        return Err(DownscaleError::DimensionMismatch {
            context: "seasonal-cycle calendar".to_string(),
            expected: format!("{}", field.ntime),
            got: format!("{}", days.len()),
        });
    }
    if clim.len() != CLIM_YEAR_DAYS * n_cells {
        return Err(DownscaleError::DimensionMismatch {
            context: "climatology slabs".to_string(),
            expected: format!("{}", CLIM_YEAR_DAYS * n_cells),
            got: format!("{}", clim.len()),
        });
    }
    let mut values = vec![0.0; field.values.len()];
    for (t, day) in days.iter().enumerate() {
        let doy = day.day_of_clim_year() as usize - 1;
        let slab = field.slab(t);
        for c in 0..n_cells {
            values[t * n_cells + c] = if slab[c] == field.missing {
                field.missing
            } else {
                slab[c] - clim[doy * n_cells + c]
            };
        }
    }
    Field::new(values, field.nlon, field.nlat, field.ntime, field.missing)
}

/// Fill the `None` slots of a cyclic series by linear interpolation between
/// the nearest observed neighbors. Returns `None` when nothing is observed.
fn fill_circular(series: &[Option<f64>]) -> Option<Vec<f64>> {
    let n = series.len();
    if series.iter().all(|v| v.is_none()) {
        return None;
    }
    let mut out = vec![0.0; n];
    for (i, slot) in series.iter().enumerate() {
        if let Some(v) = slot {
            out[i] = *v;
            continue;
        }
        let mut back = 1;
        while series[(i + n - back) % n].is_none() {
            back += 1;
        }
        let mut fwd = 1;
        while series[(i + fwd) % n].is_none() {
            fwd += 1;
        }
        let prev = series[(i + n - back) % n].unwrap();
        let next = series[(i + fwd) % n].unwrap();
        let frac = back as f64 / (back + fwd) as f64;
        out[i] = prev + (next - prev) * frac;
    }
    Some(out)
}
