//! Orchestration of a downscaling run.
//!
//! The control run establishes every reference: the first-EOF variance, the
//! per-season per-cluster distance statistics, and the seasonal moments of
//! the spatially-averaged secondary field. The model run is then normalized
//! against those references, classified, regressed, resampled, and merged.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::analog::{find_analog_days, SearchInputs, SearchParams};
use crate::cluster::{classify, distance_stats, distances};
use crate::config::Config;
use crate::delta::secondary_deltas;
use crate::error::{DownscaleError, Result};
use crate::field::{mean_variance_series, Field};
use crate::learning::LearningRecord;
use crate::merge::{merge_seasons, MergedRecords, SeasonOutput};
use crate::normalize::{
    normalize_field_cells, normalize_pcs, normalize_series, reference_statistics,
    restrict_eof_major, EofProjection,
};
use crate::regression::{apply_regression, regressor_matrix};
use crate::time::{common_indices, Day, TimeAxis};

/// One simulation entering the pipeline: precomputed PC series of the
/// primary field plus the gridded secondary field, on a shared calendar.
pub struct RunInputs {
    pub eofs: EofProjection,
    pub secondary: Field,
    pub days: Vec<Day>,
}

/// The complete result of a run.
#[derive(Debug)]
pub struct DownscaleOutput {
    pub merged: MergedRecords,
    pub axis: TimeAxis,
}

/// Downscale the model run against the learning record. `control` carries
/// the reference simulation; when absent the model run is its own control.
pub fn downscale(
    config: &Config,
    model: &RunInputs,
    control: Option<&RunInputs>,
    learning: &LearningRecord,
    secondary_mask: Option<&[u8]>,
) -> Result<DownscaleOutput> {
    config.validate()?;
    check_run(model, "model")?;
    if let Some(ctrl) = control {
        check_run(ctrl, "control")?;
    }
    if model.eofs.n_eof != learning.n_eof {
        return Err(DownscaleError::Config(format!(
            "model carries {} EOFs but the learning record has {}",
            model.eofs.n_eof, learning.n_eof
        )));
    }
    if config.seasons.len() != learning.seasons.len() {
        return Err(DownscaleError::Config(format!(
            "{} seasons configured but the learning record has {}",
            config.seasons.len(),
            learning.seasons.len()
        )));
    }

    let axis = TimeAxis::from_days(&config.time.base_units, model.days.clone())?;
    let seed = config.seed.unwrap_or_else(wall_clock_seed);
    let ctrl = control.unwrap_or(model);
    let n_eof = learning.n_eof;
    let n_pts = learning.n_pts;

    // The learning calendar is the union of the season calendars.
    let mut learning_days: Vec<Day> = learning
        .seasons
        .iter()
        .flat_map(|s| s.days.iter().copied())
        .collect();
    learning_days.sort_unstable();

    // Control reference: first-EOF variance over the control ∩ learning
    // window, then both runs normalized by it.
    let ctrl_scaled = ctrl.eofs.scaled_by_singular();
    let ctrl_learn_window = common_indices(&ctrl.days, &learning_days);
    let pc_norm_ctrl = reference_statistics(
        &ctrl_scaled,
        n_eof,
        ctrl.eofs.n_time,
        &ctrl_learn_window,
    )?;
    info!(
        first_variance = pc_norm_ctrl.first_variance,
        window = ctrl_learn_window.len(),
        "control-run reference established"
    );
    let ctrl_u = normalize_pcs(&ctrl_scaled, pc_norm_ctrl.first_variance);
    let model_u = normalize_pcs(
        &model.eofs.scaled_by_singular(),
        pc_norm_ctrl.first_variance,
    );

    // Spatial means of the secondary fields.
    let ctrl_smean = ctrl.secondary.spatial_mean_series(secondary_mask)?;
    let model_smean = model.secondary.spatial_mean_series(secondary_mask)?;

    let mut outputs = Vec::with_capacity(config.seasons.len());
    for (s, season) in config.seasons.iter().enumerate() {
        let learn = &learning.seasons[s];
        info!(season = s, "downscaling season");
        let n_learn = learn.days.len();
        if learn.precip_reg.len() != n_pts * learn.n_reg
            || learn.precip_reg_cst.len() != n_pts
            || learn.precip_index.len() != n_pts * n_learn
            || learn.class_clusters.len() != n_learn
            || learn.sup_index.len() != n_learn
        {
            return Err(DownscaleError::DimensionMismatch {
                context: format!("season {s} learning arrays"),
                expected: format!("{n_learn} days, {n_pts} points, {} regressors", learn.n_reg),
                got: format!(
                    "{}/{}/{}/{}/{}",
                    learn.precip_reg.len(),
                    learn.precip_reg_cst.len(),
                    learn.precip_index.len(),
                    learn.class_clusters.len(),
                    learn.sup_index.len()
                ),
            });
        }

        // Control ∩ learning-season window for the reference statistics.
        let window = common_indices(&ctrl.days, &learn.days);
        if window.len() < 2 {
            return Err(DownscaleError::Calendar(format!(
                "season {s}: control and learning share only {} days",
                window.len()
            )));
        }
        let ctrl_sub = restrict_eof_major(&ctrl_u, ctrl.eofs.n_time, n_eof, &window);
        let stats = distance_stats(
            &ctrl_sub,
            &learn.weight,
            &learning.pc_normalized_var,
            n_eof,
            learn.n_clusters,
            window.len(),
        )?;
        let (sup_mean_ctrl, sup_var_ctrl) = mean_variance_series(&ctrl_smean, &window);
        info!(
            season = s,
            mean = sup_mean_ctrl,
            variance = sup_var_ctrl,
            "control secondary reference"
        );

        // Season-restricted model days inside the downscaling period.
        let begin = config.periods.model.begin;
        let end = config.periods.model.end;
        let sub: Vec<usize> = model
            .days
            .iter()
            .enumerate()
            .filter(|(_, d)| d.in_season(&season.months) && **d >= begin && **d <= end)
            .map(|(i, _)| i)
            .collect();
        let n = sub.len();
        let model_days_sub: Vec<Day> = sub.iter().map(|&i| model.days[i]).collect();
        if n == 0 {
            outputs.push(SeasonOutput {
                analogs: Vec::new(),
                deltas: Vec::new(),
                cluster_dist: Vec::new(),
                class_id: Vec::new(),
            });
            continue;
        }

        // Normalized distances against the control references, and the
        // regime of every day.
        let pcs_sub = restrict_eof_major(&model_u, model.eofs.n_time, n_eof, &sub);
        let dist = distances(
            &pcs_sub,
            &learn.weight,
            &learning.pc_normalized_var,
            Some(&stats),
            n_eof,
            learn.n_clusters,
            n,
        )?;
        let class = classify(&dist, learn.n_clusters, n);
        let cluster_dist: Vec<f64> = (0..n).map(|t| dist[class[t] * n + t]).collect();

        // Normalized secondary index, and the normalized 2-D field when the
        // covariance metric asks for it.
        let smean_sub: Vec<f64> = sub.iter().map(|&i| model_smean[i]).collect();
        let smean_norm = normalize_series(&smean_sub, sup_mean_ctrl, sup_var_ctrl);
        let sup_val_norm = if season.secondary_cov {
            let (cell_mean, cell_var) = ctrl.secondary.time_mean_variance(&window);
            Some(normalize_field_cells(
                &model.secondary,
                &sub,
                &cell_mean,
                &cell_var,
            )?)
        } else {
            None
        };

        // Precipitation index from the fitted regressions.
        let sup_for_reg = (learn.n_reg == learn.n_clusters + 1).then_some(&smean_norm[..]);
        let x = regressor_matrix(&dist, learn.n_clusters, sup_for_reg, n);
        let precip_index = apply_regression(
            &learn.precip_reg,
            &learn.precip_reg_cst,
            &x,
            n_pts,
            learn.n_reg,
            n,
        );

        // Analog search and the secondary-field correction.
        let inputs = SearchInputs {
            model_days: &model_days_sub,
            model_axis_indices: &sub,
            learn_days: &learn.days,
            precip_index_model: &precip_index,
            precip_index_learn: &learn.precip_index,
            n_pts,
            sup_index_model: &smean_norm,
            sup_index_learn: &learn.sup_index,
            sup_field_model: sup_val_norm.as_deref(),
            sup_field_learn: season.secondary_cov.then_some(&learn.sup_field[..]),
            sup_nlon: model.secondary.nlon,
            sup_nlat: model.secondary.nlat,
            learn_sup_nlon: learning.sup_nlon,
            learn_sup_nlat: learning.sup_nlat,
            sup_mask: secondary_mask,
            class_model: &class,
            class_learn: &learn.class_clusters,
        };
        let params = SearchParams {
            window: season.n_days_window,
            n_choices: season.n_days_choices,
            shuffle: season.shuffle,
            secondary_choice: season.secondary_choice,
            secondary_main_choice: season.secondary_main_choice,
            secondary_cov: season.secondary_cov,
            use_downscaled_year: config.search.use_downscaled_year,
            only_wt: config.search.only_wt,
            seed,
        };
        let analogs = find_analog_days(&inputs, &params)?;
        let deltas = secondary_deltas(
            &analogs,
            &smean_norm,
            &learn.sup_index,
            sup_var_ctrl,
            learn.sup_index_var,
        )?;

        outputs.push(SeasonOutput {
            analogs,
            deltas,
            cluster_dist,
            class_id: class,
        });
    }

    let merged = merge_seasons(&outputs, model.days.len())?;
    info!(records = merged.days.len(), "seasons merged");
    Ok(DownscaleOutput { merged, axis })
}

fn check_run(run: &RunInputs, name: &str) -> Result<()> {
    if run.eofs.n_time != run.days.len() || run.secondary.ntime != run.days.len() {
        return Err(DownscaleError::DimensionMismatch {
            context: format!("{name} run calendars"),
            expected: format!("{}", run.days.len()),
            got: format!("{}/{}", run.eofs.n_time, run.secondary.ntime),
        });
    }
    Ok(())
}

fn wall_clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ClassifType, ClusteringConfig, EofConfig, OutputConfig, OutputFormat, PeriodConfig,
        PeriodsConfig, RegressionConfig, SearchConfig, SeasonConfig, TimeConfig, Timestep,
    };
    use crate::learning::SeasonLearning;

    fn single_season_config() -> Config {
        Config {
            seasons: vec![SeasonConfig {
                months: vec![1],
                n_clusters: 2,
                n_reg: 2,
                n_days_window: 30,
                n_days_choices: 5,
                shuffle: false,
                secondary_choice: false,
                secondary_main_choice: false,
                secondary_cov: false,
            }],
            periods: PeriodsConfig {
                model: PeriodConfig {
                    begin: Day::new(2001, 1, 16),
                    end: Day::new(2001, 1, 16),
                },
                control: None,
            },
            regression: RegressionConfig {
                anchor_points: vec![(0.0, 45.0)],
                dist_thresh_meters: 40_000.0,
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
                month_begin: 8,
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

    fn january(year: i32) -> Vec<Day> {
        (1..=31).map(|d| Day::new(year, 1, d)).collect()
    }

    /// A learning record whose fitted index ramps over January 2000 and a
    /// regression that predicts zero everywhere (so 2001-01-16 matches the
    /// middle of the ramp).
    fn ramp_learning() -> LearningRecord {
        let days = january(2000);
        let n = days.len();
        LearningRecord {
            seasons: vec![SeasonLearning {
                days,
                n_clusters: 2,
                n_reg: 2,
                weight: vec![1.0, -1.0],
                class_clusters: vec![0; n],
                precip_reg: vec![0.0, 0.0],
                precip_reg_cst: vec![0.0],
                precip_index: (0..n).map(|t| t as f64 - 15.5).collect(),
                precip_index_obs: vec![0.0; n],
                precip_reg_err: Some(vec![0.0]),
                sup_index: vec![0.0; n],
                sup_index_mean: 280.0,
                sup_index_var: 0.0,
                sup_field: vec![280.0; n],
            }],
            pc_normalized_var: vec![1.0],
            n_eof: 1,
            n_pts: 1,
            sup_nlon: 1,
            sup_nlat: 1,
        }
    }

    fn run_inputs(year: i32) -> RunInputs {
        let days = january(year);
        let n = days.len();
        let pcs: Vec<f64> = (0..n).map(|t| (t as f64 * 0.9).sin()).collect();
        RunInputs {
            eofs: EofProjection::new(pcs, vec![1.0], 1, n).unwrap(),
            secondary: Field::new(vec![280.0; n], 1, 1, n, -9999.0).unwrap(),
            days,
        }
    }

    #[test]
    fn single_day_run_picks_the_ramp_center() {
        let config = single_season_config();
        let model = run_inputs(2001);
        let control = run_inputs(2000);
        let learning = ramp_learning();

        let output = downscale(&config, &model, Some(&control), &learning, None).unwrap();
        assert_eq!(output.merged.days.len(), 1);
        let record = &output.merged.days[0];
        assert_eq!(record.analog.model_day, Day::new(2001, 1, 16));
        assert_eq!(record.analog.day, Day::new(2000, 1, 16));
        assert_eq!(record.delta.delta, 0.0);
        // The model-axis projection covers exactly the one downscaled slot.
        assert_eq!(output.merged.slot_of_model_index[15], Some(0));
        assert_eq!(
            output
                .merged
                .slot_of_model_index
                .iter()
                .flatten()
                .count(),
            1
        );
    }

    #[test]
    fn classification_matches_the_distance_argmin() {
        let mut config = single_season_config();
        config.periods.model.begin = Day::new(2001, 1, 1);
        config.periods.model.end = Day::new(2001, 1, 31);
        let model = run_inputs(2001);
        let control = run_inputs(2000);
        let learning = ramp_learning();

        let output = downscale(&config, &model, Some(&control), &learning, None).unwrap();
        assert_eq!(output.merged.days.len(), 31);
        for record in &output.merged.days {
            assert!(record.class_id < 2);
            assert!(record.cluster_dist.is_finite());
        }
    }

    #[test]
    fn mismatched_learning_record_is_rejected() {
        let config = single_season_config();
        let model = run_inputs(2001);
        let mut learning = ramp_learning();
        learning.n_eof = 3;
        let err = downscale(&config, &model, None, &learning, None).unwrap_err();
        assert!(matches!(err, DownscaleError::Config(_)));
    }
}
