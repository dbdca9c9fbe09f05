//! Per-anchor-point regression of the precipitation index on the
//! cluster-distance vector (optionally extended with the secondary index).

use anofox_regression::prelude::*;

use crate::error::{DownscaleError, Result};
use crate::field::{distance_point, Field, Grid};

/// Observed precipitation index at every anchor point: square root of the
/// equal-weighted spatial mean of raw precipitation over the grid cells
/// within `dist_thresh` meters of the point, non-missing cells only.
///
/// Output is day-major `index[t*n_pts + pt]`; a timestep with no usable cell
/// in the neighborhood yields NaN and is skipped by the fit.
pub fn observed_precip_index(
    precip: &Field,
    grid: &Grid,
    lon: &[f64],
    lat: &[f64],
    dist_thresh: f64,
) -> Result<Vec<f64>> {
    if grid.nlon != precip.nlon || grid.nlat != precip.nlat {
        return Err(DownscaleError::DimensionMismatch {
            context: "observation grid".to_string(),
            expected: format!("{}x{}", precip.nlon, precip.nlat),
            got: format!("{}x{}", grid.nlon, grid.nlat),
        });
    }
    let n_pts = lon.len();
    let n_cells = precip.nlon * precip.nlat;
    let mut index = vec![f64::NAN; precip.ntime * n_pts];

    for pt in 0..n_pts {
        let neighborhood: Vec<usize> = (0..n_cells)
            .filter(|&c| distance_point(lon[pt], lat[pt], grid.lon[c], grid.lat[c]) <= dist_thresh)
            .collect();
        if neighborhood.is_empty() {
            return Err(DownscaleError::NoObservationsInNeighborhood {
                point: pt,
                dist_meters: dist_thresh,
            });
        }
        for t in 0..precip.ntime {
            let slab = precip.slab(t);
            let mut sum = 0.0;
            let mut count = 0usize;
            for &c in &neighborhood {
                if slab[c] != precip.missing {
                    sum += slab[c];
                    count += 1;
                }
            }
            if count > 0 {
                index[t * n_pts + pt] = (sum / count as f64).sqrt();
            }
        }
    }
    Ok(index)
}

/// Fitted per-anchor-point regressions for one season.
#[derive(Debug, Clone)]
pub struct SeasonRegression {
    /// Coefficients, row-major `n_pts × n_reg`.
    pub coef: Vec<f64>,
    /// Intercept per point.
    pub intercept: Vec<f64>,
    /// Fitted index at every timestep, day-major `n_pts` per day.
    pub fitted: Vec<f64>,
    /// Root-mean-square residual per point over the fitted timesteps.
    pub residual_err: Vec<f64>,
}

/// Stack the cluster distances (and the optional secondary index) into the
/// regressor layout `x[r*n_time + t]`.
pub fn regressor_matrix(
    dist: &[f64],
    n_clusters: usize,
    sup_index: Option<&[f64]>,
    n_time: usize,
) -> Vec<f64> {
    let n_reg = n_clusters + usize::from(sup_index.is_some());
    let mut x = vec![0.0; n_reg * n_time];
    x[..n_clusters * n_time].copy_from_slice(&dist[..n_clusters * n_time]);
    if let Some(sup) = sup_index {
        x[n_clusters * n_time..].copy_from_slice(&sup[..n_time]);
    }
    x
}

/// Fit one OLS regression per anchor point. `y` is the observed index,
/// day-major with NaN marking missing timesteps; `x` is regressor-major.
pub fn fit_precip_regressions(
    y: &[f64],
    x: &[f64],
    n_pts: usize,
    n_reg: usize,
    n_time: usize,
) -> Result<SeasonRegression> {
    if y.len() != n_pts * n_time || x.len() != n_reg * n_time {
        return Err(DownscaleError::DimensionMismatch {
            context: "regression inputs".to_string(),
            expected: format!("{}x{} and {}x{}", n_time, n_pts, n_reg, n_time),
            got: format!("{}/{}", y.len(), x.len()),
        });
    }

    let mut coef = vec![0.0; n_pts * n_reg];
    let mut intercept = vec![0.0; n_pts];
    let mut fitted = vec![0.0; n_pts * n_time];
    let mut residual_err = vec![0.0; n_pts];

    for pt in 0..n_pts {
        let valid: Vec<usize> = (0..n_time)
            .filter(|&t| y[t * n_pts + pt].is_finite())
            .collect();
        if valid.len() < n_reg + 1 {
            return Err(DownscaleError::InsufficientSamples {
                point: pt,
                needed: n_reg + 1,
                got: valid.len(),
            });
        }

        let x_mat = faer::Mat::from_fn(valid.len(), n_reg, |i, j| x[j * n_time + valid[i]]);
        let y_col = faer::Col::from_fn(valid.len(), |i| y[valid[i] * n_pts + pt]);

        let model = OlsRegressor::builder()
            .with_intercept(true)
            .build()
            .fit(&x_mat, &y_col)
            .map_err(|_| DownscaleError::InsufficientSamples {
                point: pt,
                needed: n_reg + 1,
                got: valid.len(),
            })?;

        intercept[pt] = model.intercept().unwrap_or(0.0);
        let coeffs = model.coefficients();
        for r in 0..n_reg {
            coef[pt * n_reg + r] = coeffs[r];
        }

        // Fitted values over the whole season, residuals over the fitted rows.
        for t in 0..n_time {
            let mut value = intercept[pt];
            for r in 0..n_reg {
                value += coef[pt * n_reg + r] * x[r * n_time + t];
            }
            fitted[t * n_pts + pt] = value;
        }
        let sq_sum: f64 = valid
            .iter()
            .map(|&t| {
                let r = y[t * n_pts + pt] - fitted[t * n_pts + pt];
                r * r
            })
            .sum();
        residual_err[pt] = (sq_sum / valid.len() as f64).sqrt();
    }

    Ok(SeasonRegression {
        coef,
        intercept,
        fitted,
        residual_err,
    })
}

/// Apply fitted coefficients to a regressor matrix, day-major output.
pub fn apply_regression(
    coef: &[f64],
    intercept: &[f64],
    x: &[f64],
    n_pts: usize,
    n_reg: usize,
    n_time: usize,
) -> Vec<f64> {
    let mut out = vec![0.0; n_pts * n_time];
    for t in 0..n_time {
        for pt in 0..n_pts {
            let mut value = intercept[pt];
            for r in 0..n_reg {
                value += coef[pt * n_reg + r] * x[r * n_time + t];
            }
            out[t * n_pts + pt] = value;
        }
    }
    out
}
