//! K-means clustering of PC feature vectors into weather regimes.
//!
//! Each classification is an independent restart of Lloyd's algorithm,
//! initialized from the best of `n_partitions` random partitions of the
//! days. A restart that is already stable after a single assignment pass
//! points at degenerate input and aborts the run.

use rand::rngs::StdRng;
use rand::Rng;

use crate::cluster::classify_features;
use crate::error::{DownscaleError, Result};

/// Centroids of the best classification, row-major `n_clusters × n_features`.
#[derive(Debug)]
pub struct Clustering {
    pub centroids: Vec<f64>,
    pub inertia: f64,
}

/// Run `n_classifications` restarts of Lloyd's algorithm over day-major
/// feature rows and keep the solution with the smallest within-cluster
/// inertia.
pub fn best_clusters(
    features: &[f64],
    n_features: usize,
    n_days: usize,
    n_clusters: usize,
    n_partitions: usize,
    n_classifications: usize,
    rng: &mut StdRng,
) -> Result<Clustering> {
    if features.len() != n_features * n_days {
        return Err(DownscaleError::DimensionMismatch {
            context: "clustering features".to_string(),
            expected: format!("{}", n_features * n_days),
            got: format!("{}", features.len()),
        });
    }
    if n_clusters == 0 || n_days < n_clusters {
        return Err(DownscaleError::Config(format!(
            "cannot build {n_clusters} clusters from {n_days} days"
        )));
    }
    if n_partitions == 0 || n_classifications == 0 {
        return Err(DownscaleError::Config(
            "clustering needs at least one partition and one classification".to_string(),
        ));
    }

    let mut best: Option<Clustering> = None;
    for _ in 0..n_classifications {
        // Best of the random partitions as the starting assignment.
        let mut start: Option<(Vec<usize>, f64)> = None;
        for _ in 0..n_partitions {
            let partition = random_partition(rng, n_days, n_clusters);
            let centroids = centroids_of(features, &partition, n_features, n_days, n_clusters);
            let inertia = inertia_of(features, &partition, &centroids, n_features, n_days);
            if start.as_ref().map_or(true, |(_, i)| inertia < *i) {
                start = Some((partition, inertia));
            }
        }
        let (mut assign, _) = start.expect("at least one partition");

        let mut centroids = vec![0.0; n_clusters * n_features];
        let mut iterations = 0usize;
        loop {
            update_centroids(
                features,
                &assign,
                &mut centroids,
                n_features,
                n_days,
                n_clusters,
                iterations == 0,
            );
            let next = classify_features(features, &centroids, n_features, n_clusters, n_days);
            iterations += 1;
            if next == assign {
                break;
            }
            assign = next;
        }
        if iterations == 1 {
            return Err(DownscaleError::DegenerateClustering);
        }

        let inertia = inertia_of(features, &assign, &centroids, n_features, n_days);
        if best.as_ref().map_or(true, |b| inertia < b.inertia) {
            best = Some(Clustering { centroids, inertia });
        }
    }
    Ok(best.expect("at least one classification"))
}

/// A random partition of the days into `n_clusters` non-empty groups.
fn random_partition(rng: &mut StdRng, n_days: usize, n_clusters: usize) -> Vec<usize> {
    loop {
        let assign: Vec<usize> = (0..n_days).map(|_| rng.gen_range(0..n_clusters)).collect();
        let mut seen = vec![false; n_clusters];
        for &c in &assign {
            seen[c] = true;
        }
        if seen.iter().all(|&s| s) {
            return assign;
        }
    }
}

fn centroids_of(
    features: &[f64],
    assign: &[usize],
    n_features: usize,
    n_days: usize,
    n_clusters: usize,
) -> Vec<f64> {
    let mut centroids = vec![0.0; n_clusters * n_features];
    update_centroids(features, assign, &mut centroids, n_features, n_days, n_clusters, true);
    centroids
}

/// Recompute centroids from an assignment. An emptied cluster keeps its
/// previous centroid unless this is the first update.
fn update_centroids(
    features: &[f64],
    assign: &[usize],
    centroids: &mut [f64],
    n_features: usize,
    n_days: usize,
    n_clusters: usize,
    first: bool,
) {
    let mut counts = vec![0usize; n_clusters];
    let mut sums = vec![0.0; n_clusters * n_features];
    for d in 0..n_days {
        let c = assign[d];
        counts[c] += 1;
        for f in 0..n_features {
            sums[c * n_features + f] += features[d * n_features + f];
        }
    }
    for c in 0..n_clusters {
        if counts[c] == 0 {
            if first {
                for f in 0..n_features {
                    centroids[c * n_features + f] = 0.0;
                }
            }
            continue;
        }
        for f in 0..n_features {
            centroids[c * n_features + f] = sums[c * n_features + f] / counts[c] as f64;
        }
    }
}

fn inertia_of(
    features: &[f64],
    assign: &[usize],
    centroids: &[f64],
    n_features: usize,
    n_days: usize,
) -> f64 {
    let mut total = 0.0;
    for d in 0..n_days {
        let row = &features[d * n_features..(d + 1) * n_features];
        let centre = &centroids[assign[d] * n_features..(assign[d] + 1) * n_features];
        total += row
            .iter()
            .zip(centre.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>();
    }
    total
}
