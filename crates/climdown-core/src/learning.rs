//! Assembly of the learning record that drives the downscaling, and its
//! on-disk cache contract.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{info, warn};

use crate::cluster::{classify_features, distances, standardize_rows};
use crate::config::Config;
use crate::error::{DownscaleError, Result};
use crate::field::{Field, Grid};
use crate::kmeans::best_clusters;
use crate::normalize::{
    normalize_pcs, normalize_series, reference_statistics, restrict_eof_major, EofProjection,
};
use crate::regression::{fit_precip_regressions, observed_precip_index, regressor_matrix};
use crate::time::{common_indices, season_indices, Day};

/// Everything the assembler reads: precomputed EOF projections of the
/// reanalysis and observation fields, the gridded precipitation
/// observations, and the reanalysis secondary field.
pub struct LearningInputs<'a> {
    pub rea_eofs: &'a EofProjection,
    pub rea_days: &'a [Day],
    pub obs_eofs: &'a EofProjection,
    pub obs_days: &'a [Day],
    /// Total precipitation on the observation calendar.
    pub precip: &'a Field,
    pub precip_grid: &'a Grid,
    /// Secondary reanalysis field on the reanalysis calendar.
    pub secondary: &'a Field,
    pub secondary_mask: Option<&'a [u8]>,
    /// Optional mask applied to the precipitation before the anchor index.
    pub learning_mask: Option<&'a [u8]>,
}

/// Per-season learning data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeasonLearning {
    pub days: Vec<Day>,
    pub n_clusters: usize,
    pub n_reg: usize,
    /// Cluster centres in reanalysis-EOF space, row-major
    /// `n_clusters × n_eof`.
    pub weight: Vec<f64>,
    pub class_clusters: Vec<usize>,
    /// Regression coefficients, row-major `n_pts × n_reg`.
    pub precip_reg: Vec<f64>,
    pub precip_reg_cst: Vec<f64>,
    /// Fitted precipitation index, day-major `n_pts` per day.
    pub precip_index: Vec<f64>,
    /// Observed precipitation index at the anchor points, day-major.
    pub precip_index_obs: Vec<f64>,
    /// Per-point residual error of the regression; absent in caches written
    /// by older runs.
    #[serde(default)]
    pub precip_reg_err: Option<Vec<f64>>,
    /// Normalized secondary index and its raw seasonal moments.
    pub sup_index: Vec<f64>,
    pub sup_index_mean: f64,
    pub sup_index_var: f64,
    /// Season-restricted secondary field slabs for the covariance metric.
    pub sup_field: Vec<f64>,
}

/// The complete learning record, either assembled or loaded from cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRecord {
    pub seasons: Vec<SeasonLearning>,
    /// Per-EOF variance after first-EOF normalization.
    pub pc_normalized_var: Vec<f64>,
    pub n_eof: usize,
    pub n_pts: usize,
    pub sup_nlon: usize,
    pub sup_nlat: usize,
}

/// Assemble the learning record from its inputs: calendar intersection, PC
/// normalization, clustering, classification, distance standardization,
/// regressions, and secondary statistics.
pub fn assemble(
    config: &Config,
    inputs: &LearningInputs<'_>,
    rng: &mut StdRng,
) -> Result<LearningRecord> {
    config.validate()?;
    check_inputs(config, inputs)?;
    let n_eof_rea = inputs.rea_eofs.n_eof;
    let n_eof_obs = inputs.obs_eofs.n_eof;
    let (anchor_lon, anchor_lat) = config.anchor_lon_lat();
    let n_pts = anchor_lon.len();

    // Common calendar of the reanalysis and observation datasets.
    let rea_common = common_indices(inputs.rea_days, inputs.obs_days);
    let obs_common = common_indices(inputs.obs_days, inputs.rea_days);
    let n_common = rea_common.len();
    if n_common < 2 {
        return Err(DownscaleError::Calendar(format!(
            "learning calendars share only {n_common} days"
        )));
    }
    let common_days: Vec<Day> = rea_common.iter().map(|&i| inputs.rea_days[i]).collect();
    info!(days = n_common, "learning period after calendar intersection");

    // Singular-scaled PCs over the common period, eof-major.
    let rea_scaled = restrict_eof_major(
        &inputs.rea_eofs.scaled_by_singular(),
        inputs.rea_eofs.n_time,
        n_eof_rea,
        &rea_common,
    );
    let obs_scaled = restrict_eof_major(
        &inputs.obs_eofs.scaled_by_singular(),
        inputs.obs_eofs.n_time,
        n_eof_obs,
        &obs_common,
    );

    // First-EOF reference over the whole learning period, then the
    // normalized series entering the cluster metric.
    let window: Vec<usize> = (0..n_common).collect();
    let pc_norm = reference_statistics(&rea_scaled, n_eof_rea, n_common, &window)?;
    let rea_normalized = normalize_pcs(&rea_scaled, pc_norm.first_variance);

    // Observed precipitation index at the anchor points, restricted to the
    // common calendar.
    let masked_precip;
    let precip = if let Some(mask) = inputs.learning_mask {
        let mut field = inputs.precip.clone();
        field.mask_points(mask)?;
        masked_precip = field;
        &masked_precip
    } else {
        inputs.precip
    };
    let precip_index_full = observed_precip_index(
        precip,
        inputs.precip_grid,
        &anchor_lon,
        &anchor_lat,
        config.regression.dist_thresh_meters,
    )?;
    let mut precip_index_common = vec![f64::NAN; n_common * n_pts];
    for (i, &obs_t) in obs_common.iter().enumerate() {
        precip_index_common[i * n_pts..(i + 1) * n_pts]
            .copy_from_slice(&precip_index_full[obs_t * n_pts..(obs_t + 1) * n_pts]);
    }

    // Spatial mean of the secondary field over the common calendar.
    let smean_full = inputs.secondary.spatial_mean_series(inputs.secondary_mask)?;
    let smean_common: Vec<f64> = rea_common.iter().map(|&i| smean_full[i]).collect();
    let n_sup_cells = inputs.secondary.nlon * inputs.secondary.nlat;

    let rea_sing0 = inputs.rea_eofs.singular[0];
    let obs_sing0 = inputs.obs_eofs.singular[0];

    let mut seasons = Vec::with_capacity(config.seasons.len());
    for (s, season) in config.seasons.iter().enumerate() {
        let sub = season_indices(&common_days, &season.months);
        let n = sub.len();
        if n < season.n_clusters {
            return Err(DownscaleError::Config(format!(
                "season {s} has {n} learning days for {} clusters",
                season.n_clusters
            )));
        }
        let days: Vec<Day> = sub.iter().map(|&i| common_days[i]).collect();
        info!(season = s, days = n, "assembling season");

        // Concatenated feature rows: both PC sets normalized by their first
        // singular value.
        let n_feat = n_eof_rea + n_eof_obs;
        let mut features = vec![0.0; n * n_feat];
        for (row, &i) in sub.iter().enumerate() {
            for eof in 0..n_eof_rea {
                features[row * n_feat + eof] = rea_scaled[eof * n_common + i] / rea_sing0;
            }
            for eof in 0..n_eof_obs {
                features[row * n_feat + n_eof_rea + eof] =
                    obs_scaled[eof * n_common + i] / obs_sing0;
            }
        }

        let clustering = best_clusters(
            &features,
            n_feat,
            n,
            season.n_clusters,
            config.clustering.n_partitions,
            config.clustering.n_classifications,
            rng,
        )?;

        // Keep the reanalysis half of each centre as the season weights.
        let mut weight = vec![0.0; season.n_clusters * n_eof_rea];
        for c in 0..season.n_clusters {
            weight[c * n_eof_rea..(c + 1) * n_eof_rea]
                .copy_from_slice(&clustering.centroids[c * n_feat..c * n_feat + n_eof_rea]);
        }

        // Classify each season day against the weights in reanalysis space.
        let mut rea_features = vec![0.0; n * n_eof_rea];
        for row in 0..n {
            rea_features[row * n_eof_rea..(row + 1) * n_eof_rea]
                .copy_from_slice(&features[row * n_feat..row * n_feat + n_eof_rea]);
        }
        let class_clusters =
            classify_features(&rea_features, &weight, n_eof_rea, season.n_clusters, n);

        // Normalized distances, standardized per cluster over the season.
        let pcs_sub = restrict_eof_major(&rea_normalized, n_common, n_eof_rea, &sub);
        let mut dist = distances(
            &pcs_sub,
            &weight,
            &pc_norm.pc_normalized_var,
            None,
            n_eof_rea,
            season.n_clusters,
            n,
        )?;
        standardize_rows(&mut dist, season.n_clusters, n);

        // Secondary index statistics and the normalized series.
        let smean_sub: Vec<f64> = sub.iter().map(|&i| smean_common[i]).collect();
        let sup_index_mean = smean_sub.iter().mean();
        let sup_index_var = if n > 1 { smean_sub.iter().variance() } else { 0.0 };
        let sup_index = normalize_series(&smean_sub, sup_index_mean, sup_index_var);

        // Per-anchor-point regressions on the distance vector, optionally
        // extended with the secondary index.
        let sup_for_reg = (season.n_reg == season.n_clusters + 1).then_some(&sup_index[..]);
        let x = regressor_matrix(&dist, season.n_clusters, sup_for_reg, n);
        let mut y = vec![f64::NAN; n * n_pts];
        for (row, &i) in sub.iter().enumerate() {
            y[row * n_pts..(row + 1) * n_pts]
                .copy_from_slice(&precip_index_common[i * n_pts..(i + 1) * n_pts]);
        }
        let regression = fit_precip_regressions(&y, &x, n_pts, season.n_reg, n)?;

        // Season-restricted secondary slabs for the covariance metric.
        let mut sup_field = vec![0.0; n * n_sup_cells];
        for (row, &i) in sub.iter().enumerate() {
            let t = rea_common[i];
            sup_field[row * n_sup_cells..(row + 1) * n_sup_cells]
                .copy_from_slice(inputs.secondary.slab(t));
        }

        seasons.push(SeasonLearning {
            days,
            n_clusters: season.n_clusters,
            n_reg: season.n_reg,
            weight,
            class_clusters,
            precip_reg: regression.coef,
            precip_reg_cst: regression.intercept,
            precip_index: regression.fitted,
            precip_index_obs: y,
            precip_reg_err: Some(regression.residual_err),
            sup_index,
            sup_index_mean,
            sup_index_var,
            sup_field,
        });
    }

    Ok(LearningRecord {
        seasons,
        pc_normalized_var: pc_norm.pc_normalized_var,
        n_eof: n_eof_rea,
        n_pts,
        sup_nlon: inputs.secondary.nlon,
        sup_nlat: inputs.secondary.nlat,
    })
}

fn check_inputs(config: &Config, inputs: &LearningInputs<'_>) -> Result<()> {
    if inputs.rea_eofs.n_time != inputs.rea_days.len()
        || inputs.obs_eofs.n_time != inputs.obs_days.len()
    {
        return Err(DownscaleError::DimensionMismatch {
            context: "learning EOF calendars".to_string(),
            expected: format!("{}/{}", inputs.rea_days.len(), inputs.obs_days.len()),
            got: format!("{}/{}", inputs.rea_eofs.n_time, inputs.obs_eofs.n_time),
        });
    }
    if inputs.rea_eofs.n_eof != config.eof.n_eof_rea
        || inputs.obs_eofs.n_eof != config.eof.n_eof_obs
    {
        return Err(DownscaleError::Config(format!(
            "EOF counts {}/{} disagree with configuration {}/{}",
            inputs.rea_eofs.n_eof,
            inputs.obs_eofs.n_eof,
            config.eof.n_eof_rea,
            config.eof.n_eof_obs
        )));
    }
    if inputs.precip.ntime != inputs.obs_days.len() {
        return Err(DownscaleError::DimensionMismatch {
            context: "precipitation calendar".to_string(),
            expected: format!("{}", inputs.obs_days.len()),
            got: format!("{}", inputs.precip.ntime),
        });
    }
    if inputs.secondary.ntime != inputs.rea_days.len() {
        return Err(DownscaleError::DimensionMismatch {
            context: "secondary field calendar".to_string(),
            expected: format!("{}", inputs.rea_days.len()),
            got: format!("{}", inputs.secondary.ntime),
        });
    }
    Ok(())
}

/// Write the learning record as a self-describing JSON cache.
pub fn save_cache(record: &LearningRecord, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer(BufWriter::new(file), record)
        .map_err(|e| DownscaleError::Config(format!("cannot write learning cache: {e}")))?;
    info!(path = %path.display(), "learning cache written");
    Ok(())
}

/// Load a previously written cache and verify that its shape agrees with the
/// current configuration.
pub fn load_cache(path: &Path, config: &Config) -> Result<LearningRecord> {
    let file = File::open(path)?;
    let record: LearningRecord = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| DownscaleError::Config(format!("invalid learning cache: {e}")))?;
    verify_cache(&record, config)?;
    info!(path = %path.display(), "learning cache loaded");
    Ok(record)
}

fn verify_cache(record: &LearningRecord, config: &Config) -> Result<()> {
    if record.n_eof != config.eof.n_eof_rea {
        return Err(DownscaleError::Config(format!(
            "cached EOF count {} disagrees with configuration {}",
            record.n_eof, config.eof.n_eof_rea
        )));
    }
    if record.n_pts != config.regression.anchor_points.len() {
        return Err(DownscaleError::Config(format!(
            "cached anchor-point count {} disagrees with configuration {}",
            record.n_pts,
            config.regression.anchor_points.len()
        )));
    }
    if record.seasons.len() != config.seasons.len() {
        return Err(DownscaleError::Config(format!(
            "cached season count {} disagrees with configuration {}",
            record.seasons.len(),
            config.seasons.len()
        )));
    }
    for (s, (cached, configured)) in record.seasons.iter().zip(config.seasons.iter()).enumerate() {
        if cached.n_clusters != configured.n_clusters || cached.n_reg != configured.n_reg {
            return Err(DownscaleError::Config(format!(
                "cached season {s} shape {}x{} disagrees with configuration {}x{}",
                cached.n_clusters, cached.n_reg, configured.n_clusters, configured.n_reg
            )));
        }
        if cached.precip_reg_err.is_none() {
            warn!(season = s, "learning cache predates regression errors; continuing without them");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ClassifType, ClusteringConfig, EofConfig, OutputConfig, OutputFormat, PeriodConfig,
        PeriodsConfig, RegressionConfig, SearchConfig, SeasonConfig, TimeConfig, Timestep,
    };
    use crate::time::TimeAxis;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    fn config() -> Config {
        Config {
            seasons: vec![SeasonConfig {
                months: vec![1, 2],
                n_clusters: 2,
                n_reg: 3,
                n_days_window: 30,
                n_days_choices: 5,
                shuffle: false,
                secondary_choice: false,
                secondary_main_choice: false,
                secondary_cov: false,
            }],
            periods: PeriodsConfig {
                model: PeriodConfig {
                    begin: Day::new(2001, 1, 1),
                    end: Day::new(2001, 2, 28),
                },
                control: None,
            },
            regression: RegressionConfig {
                anchor_points: vec![(0.0, 45.0)],
                dist_thresh_meters: 50_000.0,
            },
            eof: EofConfig {
                n_eof_rea: 1,
                n_eof_obs: 1,
                scale: 1.0,
            },
            clustering: ClusteringConfig {
                n_partitions: 2,
                n_classifications: 2,
            },
            search: SearchConfig {
                use_downscaled_year: true,
                only_wt: false,
                classif_type: ClassifType::Euclidian,
            },
            output: OutputConfig {
                format: OutputFormat::V4,
                compression: false,
                month_begin: 1,
                path: "out".to_string(),
                timestep: Timestep::Daily,
            },
            time: TimeConfig {
                base_units: "days since 1950-01-01".to_string(),
                calendar_type: "standard".to_string(),
            },
            seed: Some(42),
        }
    }

    /// Learning inputs over Jan-Feb 2000, with the observation calendar
    /// starting two days late to exercise the intersection.
    fn build_inputs() -> (
        EofProjection,
        Vec<Day>,
        EofProjection,
        Vec<Day>,
        Field,
        Grid,
        Field,
    ) {
        let rea_axis = TimeAxis::daily(
            "days since 1950-01-01",
            Day::new(2000, 1, 1),
            Day::new(2000, 2, 29),
        )
        .unwrap();
        let obs_axis = TimeAxis::daily(
            "days since 1950-01-01",
            Day::new(2000, 1, 3),
            Day::new(2000, 2, 29),
        )
        .unwrap();
        let n_rea = rea_axis.len();
        let n_obs = obs_axis.len();

        // A drifting oscillation keeps the clustering off its fixed points.
        let rea_pcs: Vec<f64> = (0..n_rea)
            .map(|t| (t as f64 * 0.7).sin() * 2.0 + t as f64 * 0.01)
            .collect();
        let rea = EofProjection::new(rea_pcs, vec![2.0], 1, n_rea).unwrap();
        let obs_pcs: Vec<f64> = (0..n_obs)
            .map(|t| (t as f64 * 0.5).cos() * 1.5 - t as f64 * 0.02)
            .collect();
        let obs = EofProjection::new(obs_pcs, vec![1.0], 1, n_obs).unwrap();

        let precip_values: Vec<f64> = (0..n_obs).map(|t| (t % 7) as f64).collect();
        let precip = Field::new(precip_values, 1, 1, n_obs, -9999.0).unwrap();
        let grid = Grid::new(vec![0.0], vec![45.0], 1, 1).unwrap();

        let secondary_values: Vec<f64> = (0..n_rea).map(|t| 270.0 + (t % 11) as f64).collect();
        let secondary = Field::new(secondary_values, 1, 1, n_rea, -9999.0).unwrap();

        (
            rea,
            rea_axis.days().to_vec(),
            obs,
            obs_axis.days().to_vec(),
            precip,
            grid,
            secondary,
        )
    }

    #[test]
    fn assemble_produces_consistent_record() {
        let config = config();
        let (rea, rea_days, obs, obs_days, precip, grid, secondary) = build_inputs();
        let inputs = LearningInputs {
            rea_eofs: &rea,
            rea_days: &rea_days,
            obs_eofs: &obs,
            obs_days: &obs_days,
            precip: &precip,
            precip_grid: &grid,
            secondary: &secondary,
            secondary_mask: None,
            learning_mask: None,
        };
        let mut rng = StdRng::seed_from_u64(42);
        let record = assemble(&config, &inputs, &mut rng).unwrap();

        assert_eq!(record.seasons.len(), 1);
        assert_eq!(record.n_eof, 1);
        assert_relative_eq!(record.pc_normalized_var[0], 1.0, epsilon = 1e-9);

        let season = &record.seasons[0];
        // Intersection drops the first two reanalysis days.
        assert_eq!(season.days.len(), 58);
        assert_eq!(season.days[0], Day::new(2000, 1, 3));
        assert_eq!(season.class_clusters.len(), 58);
        assert!(season.class_clusters.iter().all(|&c| c < 2));
        assert_eq!(season.weight.len(), 2);
        assert_eq!(season.precip_reg.len(), 3);

        // The normalized secondary index is standardized over the season.
        assert_relative_eq!(season.sup_index.iter().mean(), 0.0, epsilon = 1e-9);
        assert_relative_eq!(season.sup_index.iter().variance(), 1.0, epsilon = 1e-9);

        // Observed index is sqrt of the single-cell precipitation, which
        // cycles 0..7 from the first observation day.
        assert_relative_eq!(season.precip_index_obs[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(season.precip_index_obs[2], 2.0_f64.sqrt(), epsilon = 1e-12);
        assert!(season.precip_index.iter().all(|v| v.is_finite()));
        assert!(season.precip_reg_err.is_some());
    }

    #[test]
    fn cache_round_trip_is_identical_and_verified() {
        let config = config();
        let (rea, rea_days, obs, obs_days, precip, grid, secondary) = build_inputs();
        let inputs = LearningInputs {
            rea_eofs: &rea,
            rea_days: &rea_days,
            obs_eofs: &obs,
            obs_days: &obs_days,
            precip: &precip,
            precip_grid: &grid,
            secondary: &secondary,
            secondary_mask: None,
            learning_mask: None,
        };
        let mut rng = StdRng::seed_from_u64(42);
        let record = assemble(&config, &inputs, &mut rng).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning.json");
        save_cache(&record, &path).unwrap();
        let loaded = load_cache(&path, &config).unwrap();

        assert_eq!(loaded.seasons[0].weight, record.seasons[0].weight);
        assert_eq!(loaded.seasons[0].precip_index, record.seasons[0].precip_index);
        assert_eq!(loaded.seasons[0].sup_index, record.seasons[0].sup_index);
        assert_eq!(loaded.pc_normalized_var, record.pc_normalized_var);

        // A mismatching configuration is rejected.
        let mut other = config.clone();
        other.regression.anchor_points.push((2.0, 46.0));
        assert!(matches!(
            load_cache(&path, &other).unwrap_err(),
            DownscaleError::Config(_)
        ));
    }

    #[test]
    fn old_cache_without_regression_errors_still_loads() {
        let config = config();
        let (rea, rea_days, obs, obs_days, precip, grid, secondary) = build_inputs();
        let inputs = LearningInputs {
            rea_eofs: &rea,
            rea_days: &rea_days,
            obs_eofs: &obs,
            obs_days: &obs_days,
            precip: &precip,
            precip_grid: &grid,
            secondary: &secondary,
            secondary_mask: None,
            learning_mask: None,
        };
        let mut rng = StdRng::seed_from_u64(42);
        let mut record = assemble(&config, &inputs, &mut rng).unwrap();
        record.seasons[0].precip_reg_err = None;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning.json");
        save_cache(&record, &path).unwrap();
        let loaded = load_cache(&path, &config).unwrap();
        assert!(loaded.seasons[0].precip_reg_err.is_none());
        assert_eq!(loaded.seasons[0].days.len(), 58);
    }

    #[test]
    fn no_observation_near_anchor_fails_assembly() {
        let mut config = config();
        config.regression.anchor_points = vec![(90.0, 0.0)];
        let (rea, rea_days, obs, obs_days, precip, grid, secondary) = build_inputs();
        let inputs = LearningInputs {
            rea_eofs: &rea,
            rea_days: &rea_days,
            obs_eofs: &obs,
            obs_days: &obs_days,
            precip: &precip,
            precip_grid: &grid,
            secondary: &secondary,
            secondary_mask: None,
            learning_mask: None,
        };
        let mut rng = StdRng::seed_from_u64(42);
        let err = assemble(&config, &inputs, &mut rng).unwrap_err();
        assert!(matches!(
            err,
            DownscaleError::NoObservationsInNeighborhood { .. }
        ));
    }
}
