//! Typed configuration consumed by the downscaling engine.
//!
//! Unknown options are rejected at deserialization; cross-field consistency
//! is checked by [`Config::validate`].

use serde::{Deserialize, Serialize};

use crate::error::{DownscaleError, Result};
use crate::time::Day;

/// One season of the downscaling year.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeasonConfig {
    /// Month numbers (1-12) belonging to this season.
    pub months: Vec<u32>,
    pub n_clusters: usize,
    /// Regressor count: `n_clusters`, or `n_clusters + 1` when the secondary
    /// index enters the regression.
    pub n_reg: usize,
    /// Half-width of the day-of-year search window.
    pub n_days_window: u32,
    /// First-selection size of the analog search.
    pub n_days_choices: usize,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub secondary_choice: bool,
    #[serde(default)]
    pub secondary_main_choice: bool,
    #[serde(default)]
    pub secondary_cov: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeriodConfig {
    pub begin: Day,
    pub end: Day,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeriodsConfig {
    pub model: PeriodConfig,
    /// Control run establishing the reference statistics; when absent the
    /// model run doubles as its own control.
    #[serde(default)]
    pub control: Option<PeriodConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegressionConfig {
    /// (lon, lat) of the regression anchor points.
    pub anchor_points: Vec<(f64, f64)>,
    pub dist_thresh_meters: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EofConfig {
    pub n_eof_rea: usize,
    pub n_eof_obs: usize,
    /// Scale factor applied to large-scale fields before projection (part of
    /// the preprocessor contract; carried for cache verification).
    pub scale: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifType {
    Euclidian,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchConfig {
    pub use_downscaled_year: bool,
    pub only_wt: bool,
    pub classif_type: ClassifType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    V3,
    V4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timestep {
    Hourly,
    Daily,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub format: OutputFormat,
    #[serde(default)]
    pub compression: bool,
    /// Month (1-12) at which an output year begins.
    pub month_begin: u32,
    pub path: String,
    pub timestep: Timestep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeConfig {
    /// Udunits-compatible base string, e.g. `"days since 1950-01-01"`.
    pub base_units: String,
    pub calendar_type: String,
}

/// Restart structure of the k-means classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusteringConfig {
    pub n_partitions: usize,
    pub n_classifications: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub seasons: Vec<SeasonConfig>,
    pub periods: PeriodsConfig,
    pub regression: RegressionConfig,
    pub eof: EofConfig,
    pub clustering: ClusteringConfig,
    pub search: SearchConfig,
    pub output: OutputConfig,
    pub time: TimeConfig,
    /// Master PRNG seed; wall-clock seeded at startup when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.seasons.is_empty() {
            return Err(DownscaleError::Config("no seasons configured".to_string()));
        }
        let mut claimed = [false; 13];
        for (s, season) in self.seasons.iter().enumerate() {
            if season.months.is_empty() {
                return Err(DownscaleError::Config(format!("season {s} has no months")));
            }
            for &m in &season.months {
                if !(1..=12).contains(&m) {
                    return Err(DownscaleError::Config(format!(
                        "season {s} month {m} outside 1-12"
                    )));
                }
                if claimed[m as usize] {
                    return Err(DownscaleError::Config(format!(
                        "month {m} appears in more than one season"
                    )));
                }
                claimed[m as usize] = true;
            }
            if season.n_clusters == 0 {
                return Err(DownscaleError::Config(format!(
                    "season {s} needs at least one cluster"
                )));
            }
            if season.n_reg != season.n_clusters && season.n_reg != season.n_clusters + 1 {
                return Err(DownscaleError::Config(format!(
                    "season {s}: n_reg {} must be n_clusters or n_clusters + 1",
                    season.n_reg
                )));
            }
            if season.n_days_choices == 0 {
                return Err(DownscaleError::Config(format!(
                    "season {s}: n_days_choices must be positive"
                )));
            }
        }
        if self.regression.anchor_points.is_empty() {
            return Err(DownscaleError::Config(
                "no regression anchor points".to_string(),
            ));
        }
        if !(self.regression.dist_thresh_meters > 0.0) {
            return Err(DownscaleError::Config(format!(
                "non-positive anchor distance threshold {}",
                self.regression.dist_thresh_meters
            )));
        }
        if self.eof.n_eof_rea == 0 || self.eof.n_eof_obs == 0 {
            return Err(DownscaleError::Config(
                "need at least one reanalysis and one observation EOF".to_string(),
            ));
        }
        if !(1..=12).contains(&self.output.month_begin) {
            return Err(DownscaleError::Config(format!(
                "output month_begin {} outside 1-12",
                self.output.month_begin
            )));
        }
        if self.clustering.n_partitions == 0 || self.clustering.n_classifications == 0 {
            return Err(DownscaleError::Config(
                "clustering needs positive partition and classification counts".to_string(),
            ));
        }
        let mut periods = vec![("model", &self.periods.model)];
        if let Some(ctrl) = &self.periods.control {
            periods.push(("control", ctrl));
        }
        for (name, p) in periods {
            if p.end < p.begin {
                return Err(DownscaleError::Config(format!(
                    "{name} period ends {} before it begins {}",
                    p.end, p.begin
                )));
            }
        }
        Ok(())
    }

    /// Anchor-point longitudes and latitudes as parallel slices.
    pub fn anchor_lon_lat(&self) -> (Vec<f64>, Vec<f64>) {
        let lon = self.regression.anchor_points.iter().map(|p| p.0).collect();
        let lat = self.regression.anchor_points.iter().map(|p| p.1).collect();
        (lon, lat)
    }
}
