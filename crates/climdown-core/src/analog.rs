//! Analog-day search over the learning catalogue.
//!
//! For each downscaled day of a season: gather the learning days inside the
//! day-of-year window, build the precipitation-index metric (and optionally
//! a secondary-field metric), standardize over the candidate set, keep the
//! first selection of smallest combined metrics, then pick the analog by
//! shuffle, secondary metric, or smallest combined metric.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::debug;

use crate::error::{DownscaleError, Result};
use crate::field::spatial_covariance;
use crate::time::Day;

/// Per-season knobs of the search.
#[derive(Debug, Clone, Copy)]
pub struct SearchParams {
    /// Half-width of the day-of-year candidate window.
    pub window: u32,
    /// First-selection size.
    pub n_choices: usize,
    pub shuffle: bool,
    pub secondary_choice: bool,
    pub secondary_main_choice: bool,
    pub secondary_cov: bool,
    pub use_downscaled_year: bool,
    pub only_wt: bool,
    /// Master PRNG seed; every day derives its own sub-seeded generator.
    pub seed: u64,
}

/// Season-restricted inputs on both the downscaled and the learning side.
/// Secondary 2-D fields are time-major slabs and are only consulted when the
/// covariance metric is enabled.
pub struct SearchInputs<'a> {
    pub model_days: &'a [Day],
    /// Position of each season day on the global model time axis.
    pub model_axis_indices: &'a [usize],
    pub learn_days: &'a [Day],
    pub precip_index_model: &'a [f64],
    pub precip_index_learn: &'a [f64],
    pub n_pts: usize,
    pub sup_index_model: &'a [f64],
    pub sup_index_learn: &'a [f64],
    pub sup_field_model: Option<&'a [f64]>,
    pub sup_field_learn: Option<&'a [f64]>,
    pub sup_nlon: usize,
    pub sup_nlat: usize,
    pub learn_sup_nlon: usize,
    pub learn_sup_nlat: usize,
    pub sup_mask: Option<&'a [u8]>,
    pub class_model: &'a [usize],
    pub class_learn: &'a [usize],
}

/// One first-selection candidate, carrying its standardized metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalogCandidate {
    pub day: Day,
    pub learn_index: usize,
    pub metric_norm: f64,
}

/// The search result for one downscaled day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalogDay {
    pub model_day: Day,
    /// Position within the season-restricted model series.
    pub model_index: usize,
    /// Position on the global model time axis.
    pub model_axis_index: usize,
    /// The chosen analog day.
    pub day: Day,
    /// Its position within the season-restricted learning series.
    pub learn_index: usize,
    /// First selection, ascending by standardized metric.
    pub candidates: Vec<AnalogCandidate>,
}

/// Search the analog day for every downscaled day of one season. Days are
/// independent and run in parallel; each writes only its own slot.
pub fn find_analog_days(inputs: &SearchInputs<'_>, params: &SearchParams) -> Result<Vec<AnalogDay>> {
    check_inputs(inputs, params)?;
    debug!(
        days = inputs.model_days.len(),
        learning = inputs.learn_days.len(),
        "searching analog days"
    );
    inputs
        .model_days
        .par_iter()
        .enumerate()
        .map(|(t, &day)| search_one(t, day, inputs, params))
        .collect()
}

fn check_inputs(inputs: &SearchInputs<'_>, params: &SearchParams) -> Result<()> {
    let n_model = inputs.model_days.len();
    let n_learn = inputs.learn_days.len();
    if params.n_choices == 0 {
        return Err(DownscaleError::Config(
            "first-selection size must be positive".to_string(),
        ));
    }
    if inputs.precip_index_model.len() != n_model * inputs.n_pts
        || inputs.precip_index_learn.len() != n_learn * inputs.n_pts
    {
        return Err(DownscaleError::DimensionMismatch {
            context: "precipitation index".to_string(),
            expected: format!("{}x{} and {}x{}", n_model, inputs.n_pts, n_learn, inputs.n_pts),
            got: format!(
                "{}/{}",
                inputs.precip_index_model.len(),
                inputs.precip_index_learn.len()
            ),
        });
    }
    if inputs.class_model.len() != n_model || inputs.class_learn.len() != n_learn {
        return Err(DownscaleError::DimensionMismatch {
            context: "cluster classification".to_string(),
            expected: format!("{n_model} and {n_learn}"),
            got: format!("{}/{}", inputs.class_model.len(), inputs.class_learn.len()),
        });
    }
    let need_sup = params.secondary_choice || params.secondary_main_choice;
    if need_sup {
        if params.secondary_cov {
            if inputs.sup_field_model.is_none() || inputs.sup_field_learn.is_none() {
                return Err(DownscaleError::Config(
                    "secondary covariance metric requires 2-D secondary fields".to_string(),
                ));
            }
            if inputs.sup_nlon != inputs.learn_sup_nlon || inputs.sup_nlat != inputs.learn_sup_nlat
            {
                return Err(DownscaleError::DimensionMismatch {
                    context: "secondary field grids".to_string(),
                    expected: format!("{}x{}", inputs.sup_nlon, inputs.sup_nlat),
                    got: format!("{}x{}", inputs.learn_sup_nlon, inputs.learn_sup_nlat),
                });
            }
        } else if inputs.sup_index_model.len() < n_model || inputs.sup_index_learn.len() < n_learn
        {
            return Err(DownscaleError::DimensionMismatch {
                context: "secondary index series".to_string(),
                expected: format!("{n_model} and {n_learn}"),
                got: format!(
                    "{}/{}",
                    inputs.sup_index_model.len(),
                    inputs.sup_index_learn.len()
                ),
            });
        }
    }
    Ok(())
}

fn search_one(
    t: usize,
    day: Day,
    inputs: &SearchInputs<'_>,
    params: &SearchParams,
) -> Result<AnalogDay> {
    let doy = day.day_of_clim_year() as i64;
    let need_sup = params.secondary_choice || params.secondary_main_choice;

    // Candidate learning days inside the day-of-year window.
    let mut cand: Vec<usize> = Vec::new();
    for (tl, learn_day) in inputs.learn_days.iter().enumerate() {
        if !params.use_downscaled_year && learn_day.year == day.year {
            continue;
        }
        let diff = (doy - learn_day.day_of_clim_year() as i64).abs();
        if diff <= params.window as i64 {
            cand.push(tl);
        }
    }
    if cand.is_empty() {
        return Err(DownscaleError::NoCandidates { day });
    }

    // Primary metric: distance between regressed precipitation indexes.
    let n_pts = inputs.n_pts;
    let mut metric_p: Vec<f64> = cand
        .iter()
        .map(|&tl| {
            let mut sum = 0.0;
            for pt in 0..n_pts {
                let diff = inputs.precip_index_model[t * n_pts + pt]
                    - inputs.precip_index_learn[tl * n_pts + pt];
                sum += diff * diff;
            }
            sum.sqrt()
        })
        .collect();

    // Secondary metric: index difference, or masked spatial covariance.
    let mut metric_s: Option<Vec<f64>> = match (
        need_sup,
        params.secondary_cov,
        inputs.sup_field_model,
        inputs.sup_field_learn,
    ) {
        (false, _, _, _) => None,
        (true, true, Some(model_field), Some(learn_field)) => {
            let n_cells = inputs.sup_nlon * inputs.sup_nlat;
            let values = cand
                .iter()
                .map(|&tl| {
                    let model = &model_field[t * n_cells..(t + 1) * n_cells];
                    let learn = &learn_field[tl * n_cells..(tl + 1) * n_cells];
                    spatial_covariance(model, learn, inputs.sup_mask, inputs.sup_nlon, inputs.sup_nlat)
                        .map(|cov| cov.abs())
                })
                .collect::<Result<Vec<f64>>>()?;
            Some(values)
        }
        (true, true, _, _) => {
            return Err(DownscaleError::Config(
                "secondary covariance metric requires 2-D secondary fields".to_string(),
            ))
        }
        (true, false, _, _) => Some(
            cand.iter()
                .map(|&tl| (inputs.sup_index_model[t] - inputs.sup_index_learn[tl]).abs())
                .collect(),
        ),
    };

    // De-prioritize off-regime candidates by pushing them to the observed
    // metric maximum (they stay in the pool).
    if params.only_wt {
        let max_p = metric_p.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let max_s = metric_s
            .as_ref()
            .map(|m| m.iter().cloned().fold(f64::NEG_INFINITY, f64::max));
        for (pos, &tl) in cand.iter().enumerate() {
            if inputs.class_learn[tl] != inputs.class_model[t] {
                metric_p[pos] = max_p;
                if let (Some(metric_s), Some(max_s)) = (metric_s.as_mut(), max_s) {
                    metric_s[pos] = max_s;
                }
            }
        }
    }

    // Standardize over the candidate pool and combine.
    let norm_p = standardize(&metric_p);
    let metric_norm: Vec<f64> = if params.secondary_choice {
        let norm_s = standardize(metric_s.as_ref().unwrap());
        norm_p.iter().zip(norm_s.iter()).map(|(p, s)| p + s).collect()
    } else {
        norm_p.clone()
    };

    // First selection: the K candidates of smallest combined metric, ties to
    // the earliest learning day.
    let k = params.n_choices.min(cand.len());
    let mut order: Vec<usize> = (0..cand.len()).collect();
    order.sort_by(|&a, &b| {
        metric_norm[a]
            .partial_cmp(&metric_norm[b])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(cand[a].cmp(&cand[b]))
    });
    order.truncate(k);

    let candidates: Vec<AnalogCandidate> = order
        .iter()
        .map(|&pos| AnalogCandidate {
            day: inputs.learn_days[cand[pos]],
            learn_index: cand[pos],
            metric_norm: metric_norm[pos],
        })
        .collect();

    // Second selection.
    let chosen_pos = if params.shuffle {
        let mut rng = day_rng(params.seed, inputs.model_axis_indices[t]);
        let keys: Vec<u32> = (0..k).map(|_| rng.gen_range(0..100)).collect();
        let mut slots: Vec<usize> = (0..k).collect();
        slots.sort_by_key(|&i| keys[i]);
        order[slots[0]]
    } else if params.secondary_main_choice {
        let metric_s = metric_s.as_ref().unwrap();
        *order
            .iter()
            .min_by(|&&a, &&b| {
                metric_s[a]
                    .partial_cmp(&metric_s[b])
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(
                        norm_p[a]
                            .partial_cmp(&norm_p[b])
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    .then(cand[a].cmp(&cand[b]))
            })
            .expect("first selection is non-empty")
    } else {
        order[0]
    };

    Ok(AnalogDay {
        model_day: day,
        model_index: t,
        model_axis_index: inputs.model_axis_indices[t],
        day: inputs.learn_days[cand[chosen_pos]],
        learn_index: cand[chosen_pos],
        candidates,
    })
}

/// Center and scale by the sample standard deviation; a constant metric
/// standardizes to zero everywhere, which leaves ties to the index order.
fn standardize(values: &[f64]) -> Vec<f64> {
    if values.len() < 2 {
        return vec![0.0; values.len()];
    }
    let mean = values.iter().mean();
    let sd = values.iter().std_dev();
    values
        .iter()
        .map(|v| if sd > 0.0 { (v - mean) / sd } else { 0.0 })
        .collect()
}

/// An independent generator for one downscaled day, derived from the master
/// seed so that reruns with the same seed reproduce the same shuffles.
fn day_rng(seed: u64, day_axis_index: usize) -> StdRng {
    let sub_seed = seed ^ (day_axis_index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    StdRng::seed_from_u64(sub_seed)
}
