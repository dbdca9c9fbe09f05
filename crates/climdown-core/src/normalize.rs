//! Normalization of EOF projections and fields against control references.
//!
//! The reference is the variance of the first singular-value-scaled principal
//! component over the learning ∩ control window. Every PC value is divided by
//! its square root; per-EOF scaling enters later through `pc_normalized_var`
//! where the cluster metric is evaluated.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::error::{DownscaleError, Result};
use crate::field::Field;

/// A principal-component time series per EOF, layout `pcs[eof*n_time + t]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EofProjection {
    pub pcs: Vec<f64>,
    pub singular: Vec<f64>,
    pub n_eof: usize,
    pub n_time: usize,
}

impl EofProjection {
    pub fn new(pcs: Vec<f64>, singular: Vec<f64>, n_eof: usize, n_time: usize) -> Result<Self> {
        if pcs.len() != n_eof * n_time {
            return Err(DownscaleError::DimensionMismatch {
                context: "EOF projection".to_string(),
                expected: format!("{}", n_eof * n_time),
                got: format!("{}", pcs.len()),
            });
        }
        if singular.len() != n_eof {
            return Err(DownscaleError::DimensionMismatch {
                context: "singular values".to_string(),
                expected: format!("{n_eof}"),
                got: format!("{}", singular.len()),
            });
        }
        Ok(EofProjection {
            pcs,
            singular,
            n_eof,
            n_time,
        })
    }

    #[inline]
    pub fn pc(&self, eof: usize, t: usize) -> f64 {
        self.pcs[eof * self.n_time + t]
    }

    /// The projection with every PC multiplied by its singular value.
    pub fn scaled_by_singular(&self) -> Vec<f64> {
        let mut out = vec![0.0; self.pcs.len()];
        for eof in 0..self.n_eof {
            let sing = self.singular[eof];
            for t in 0..self.n_time {
                out[eof * self.n_time + t] = self.pc(eof, t) * sing;
            }
        }
        out
    }
}

/// First-EOF reference variance and the per-EOF normalized variances derived
/// from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcNorm {
    pub first_variance: f64,
    pub pc_normalized_var: Vec<f64>,
}

/// Compute the reference statistics of a singular-scaled projection over the
/// reference window (`window` holds time indexes into the projection).
///
/// `pc_normalized_var[k] = var(scaled_pc[k]) / V1` with `V1` the variance of
/// the first scaled component; this is the one-step form of the reference
/// renormalization.
pub fn reference_statistics(
    scaled: &[f64],
    n_eof: usize,
    n_time: usize,
    window: &[usize],
) -> Result<PcNorm> {
    if scaled.len() != n_eof * n_time {
        return Err(DownscaleError::DimensionMismatch {
            context: "scaled projection".to_string(),
            expected: format!("{}", n_eof * n_time),
            got: format!("{}", scaled.len()),
        });
    }
    if window.len() < 2 {
        return Err(DownscaleError::Calendar(format!(
            "reference window has {} days; need at least 2",
            window.len()
        )));
    }
    let mut var = vec![0.0; n_eof];
    for (eof, slot) in var.iter_mut().enumerate() {
        let series: Vec<f64> = window.iter().map(|&t| scaled[eof * n_time + t]).collect();
        *slot = series.iter().variance();
    }
    let first_variance = var[0];
    if !(first_variance > 0.0) {
        return Err(DownscaleError::Config(format!(
            "degenerate first-EOF reference variance {first_variance}"
        )));
    }
    let pc_normalized_var = var.iter().map(|v| v / first_variance).collect();
    Ok(PcNorm {
        first_variance,
        pc_normalized_var,
    })
}

/// Divide every PC value by the square root of the reference variance.
pub fn normalize_pcs(scaled: &[f64], first_variance: f64) -> Vec<f64> {
    let norm = first_variance.sqrt();
    scaled.iter().map(|v| v / norm).collect()
}

/// Normalize a series against a (mean, variance) pair.
pub fn normalize_series(series: &[f64], mean: f64, variance: f64) -> Vec<f64> {
    let sd = variance.sqrt();
    series
        .iter()
        .map(|v| if sd > 0.0 { (v - mean) / sd } else { 0.0 })
        .collect()
}

/// Extract the given time positions from an eof-major buffer.
pub(crate) fn restrict_eof_major(
    buf: &[f64],
    n_time: usize,
    n_eof: usize,
    idx: &[usize],
) -> Vec<f64> {
    let mut out = vec![0.0; n_eof * idx.len()];
    for eof in 0..n_eof {
        for (pos, &i) in idx.iter().enumerate() {
            out[eof * idx.len() + pos] = buf[eof * n_time + i];
        }
    }
    out
}

/// Per-cell normalization of the selected timesteps of a field against
/// per-cell (mean, variance) maps. Missing cells pass through unchanged;
/// constant cells normalize to zero anomaly. Output is time-major over the
/// selected timesteps.
pub fn normalize_field_cells(
    field: &Field,
    times: &[usize],
    mean: &[f64],
    variance: &[f64],
) -> Result<Vec<f64>> {
    let n = field.nlat * field.nlon;
    if mean.len() != n || variance.len() != n {
        return Err(DownscaleError::DimensionMismatch {
            context: "per-cell reference maps".to_string(),
            expected: format!("{n}"),
            got: format!("{}/{}", mean.len(), variance.len()),
        });
    }
    let mut out = vec![0.0; times.len() * n];
    for (pos, &t) in times.iter().enumerate() {
        let slab = field.slab(t);
        for c in 0..n {
            let v = slab[c];
            out[pos * n + c] = if v == field.missing {
                field.missing
            } else {
                let sd = variance[c].sqrt();
                if sd > 0.0 {
                    (v - mean[c]) / sd
                } else {
                    0.0
                }
            };
        }
    }
    Ok(out)
}
