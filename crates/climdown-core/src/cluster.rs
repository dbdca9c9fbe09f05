//! Cluster distances and day-to-regime classification.

use statrs::statistics::Statistics;

use crate::error::{DownscaleError, Result};

/// Reference mean and variance of the unnormalized distance to each cluster,
/// computed over the control ∩ learning window.
#[derive(Debug, Clone)]
pub struct DistStats {
    pub mean: Vec<f64>,
    pub var: Vec<f64>,
}

/// Weighted Euclidean distance of one day's PC vector to one cluster centre.
/// `var` holds the per-EOF normalized variances used as weights.
#[inline]
pub fn weighted_distance(pcs: &[f64], n_time: usize, t: usize, centre: &[f64], var: &[f64]) -> f64 {
    let mut sum = 0.0;
    for (eof, (&w, &v)) in centre.iter().zip(var.iter()).enumerate() {
        let diff = pcs[eof * n_time + t] - w;
        sum += diff * diff * v;
    }
    sum.sqrt()
}

/// Unnormalized distances of every day to every cluster, cluster-major:
/// `dist[c*n_time + t]`.
fn raw_distances(
    pcs: &[f64],
    weights: &[f64],
    pc_var: &[f64],
    n_eof: usize,
    n_clusters: usize,
    n_time: usize,
) -> Result<Vec<f64>> {
    if pcs.len() != n_eof * n_time {
        return Err(DownscaleError::DimensionMismatch {
            context: "cluster metric PCs".to_string(),
            expected: format!("{}", n_eof * n_time),
            got: format!("{}", pcs.len()),
        });
    }
    if weights.len() != n_clusters * n_eof || pc_var.len() != n_eof {
        return Err(DownscaleError::DimensionMismatch {
            context: "cluster weights".to_string(),
            expected: format!("{}x{}", n_clusters, n_eof),
            got: format!("{}/{}", weights.len(), pc_var.len()),
        });
    }
    let mut dist = vec![0.0; n_clusters * n_time];
    for c in 0..n_clusters {
        let centre = &weights[c * n_eof..(c + 1) * n_eof];
        for t in 0..n_time {
            dist[c * n_time + t] = weighted_distance(pcs, n_time, t, centre, pc_var);
        }
    }
    Ok(dist)
}

/// Mean and variance of the unnormalized distances over a reference window.
pub fn distance_stats(
    pcs: &[f64],
    weights: &[f64],
    pc_var: &[f64],
    n_eof: usize,
    n_clusters: usize,
    n_time: usize,
) -> Result<DistStats> {
    let dist = raw_distances(pcs, weights, pc_var, n_eof, n_clusters, n_time)?;
    let mut mean = vec![0.0; n_clusters];
    let mut var = vec![0.0; n_clusters];
    for c in 0..n_clusters {
        let row = &dist[c * n_time..(c + 1) * n_time];
        mean[c] = row.iter().mean();
        var[c] = if n_time > 1 { row.iter().variance() } else { 0.0 };
    }
    Ok(DistStats { mean, var })
}

/// Distances of every day to every cluster, normalized against the reference
/// statistics when provided: `(D - mean_c) / sqrt(var_c)`. Cluster-major.
pub fn distances(
    pcs: &[f64],
    weights: &[f64],
    pc_var: &[f64],
    stats: Option<&DistStats>,
    n_eof: usize,
    n_clusters: usize,
    n_time: usize,
) -> Result<Vec<f64>> {
    let mut dist = raw_distances(pcs, weights, pc_var, n_eof, n_clusters, n_time)?;
    if let Some(stats) = stats {
        if stats.mean.len() != n_clusters || stats.var.len() != n_clusters {
            return Err(DownscaleError::DimensionMismatch {
                context: "distance reference statistics".to_string(),
                expected: format!("{n_clusters}"),
                got: format!("{}/{}", stats.mean.len(), stats.var.len()),
            });
        }
        for c in 0..n_clusters {
            let sd = stats.var[c].sqrt();
            for t in 0..n_time {
                let v = &mut dist[c * n_time + t];
                *v = if sd > 0.0 { (*v - stats.mean[c]) / sd } else { *v - stats.mean[c] };
            }
        }
    }
    Ok(dist)
}

/// Standardize each cluster row of a distance matrix to mean 0, variance 1
/// in place (the learning-side treatment), returning the (mean, variance)
/// pairs that were removed.
pub fn standardize_rows(dist: &mut [f64], n_clusters: usize, n_time: usize) -> DistStats {
    let mut mean = vec![0.0; n_clusters];
    let mut var = vec![0.0; n_clusters];
    for c in 0..n_clusters {
        let row = &dist[c * n_time..(c + 1) * n_time];
        mean[c] = row.iter().mean();
        var[c] = if n_time > 1 { row.iter().variance() } else { 0.0 };
        let sd = var[c].sqrt();
        for t in 0..n_time {
            let v = &mut dist[c * n_time + t];
            *v = if sd > 0.0 { (*v - mean[c]) / sd } else { 0.0 };
        }
    }
    DistStats { mean, var }
}

/// Classify each day as the arg-min over clusters of the distance matrix.
/// Ties go to the smallest cluster index.
pub fn classify(dist: &[f64], n_clusters: usize, n_time: usize) -> Vec<usize> {
    let mut class = vec![0usize; n_time];
    for (t, slot) in class.iter_mut().enumerate() {
        let mut best = 0usize;
        let mut best_dist = dist[t];
        for c in 1..n_clusters {
            let d = dist[c * n_time + t];
            if d < best_dist {
                best_dist = d;
                best = c;
            }
        }
        *slot = best;
    }
    class
}

/// Classify day-major feature rows against centroid rows by plain Euclidean
/// distance (the learning-side classification on concatenated PC features).
pub fn classify_features(
    features: &[f64],
    centroids: &[f64],
    n_features: usize,
    n_clusters: usize,
    n_days: usize,
) -> Vec<usize> {
    let mut class = vec![0usize; n_days];
    for (d, slot) in class.iter_mut().enumerate() {
        let row = &features[d * n_features..(d + 1) * n_features];
        let mut best = 0usize;
        let mut best_dist = f64::INFINITY;
        for c in 0..n_clusters {
            let centre = &centroids[c * n_features..(c + 1) * n_features];
            let dist: f64 = row
                .iter()
                .zip(centre.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            if dist < best_dist {
                best_dist = dist;
                best = c;
            }
        }
        *slot = best;
    }
    class
}
