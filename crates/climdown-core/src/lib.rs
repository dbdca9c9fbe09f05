//! Core engine for statistical downscaling of climate scenarios by weather
//! typing.
//!
//! Given daily large-scale model fields, a historical learning catalogue,
//! and precomputed EOF projections, the engine classifies each model day
//! into a weather regime, predicts a precipitation index at regression
//! anchor points, resamples the best analog day from the learning period,
//! and derives a temperature correction from the secondary-field difference.

pub mod analog;
pub mod clim;
pub mod cluster;
pub mod config;
pub mod delta;
pub mod emit;
pub mod error;
pub mod field;
pub mod kmeans;
pub mod learning;
pub mod merge;
pub mod normalize;
pub mod pipeline;
pub mod regression;
pub mod time;

// Re-exports for convenience
pub use analog::{find_analog_days, AnalogCandidate, AnalogDay, SearchInputs, SearchParams};
pub use clim::{daily_climatology, filter_cyclic, remove_seasonal_cycle, CLIM_YEAR_DAYS};
pub use cluster::{classify, classify_features, distance_stats, distances, DistStats};
pub use config::{
    ClassifType, ClusteringConfig, Config, EofConfig, OutputConfig, OutputFormat, PeriodConfig,
    PeriodsConfig, RegressionConfig, SearchConfig, SeasonConfig, TimeConfig, Timestep,
};
pub use delta::{secondary_deltas, DayDelta};
pub use emit::{
    output_filename, output_year_bounds, output_year_groups, stream_records, AnalogEmitter,
    DownscaledDay, EmittedCandidate,
};
pub use error::{DownscaleError, Result};
pub use field::{distance_point, mean_variance_series, spatial_covariance, Field, Grid};
pub use kmeans::{best_clusters, Clustering};
pub use learning::{
    assemble, load_cache, save_cache, LearningInputs, LearningRecord, SeasonLearning,
};
pub use merge::{merge_seasons, MergedDay, MergedRecords, SeasonOutput};
pub use normalize::{
    normalize_field_cells, normalize_pcs, normalize_series, reference_statistics, EofProjection,
    PcNorm,
};
pub use pipeline::{downscale, DownscaleOutput, RunInputs};
pub use regression::{
    apply_regression, fit_precip_regressions, observed_precip_index, regressor_matrix,
    SeasonRegression,
};
pub use time::{common_indices, season_indices, Day, TimeAxis};
