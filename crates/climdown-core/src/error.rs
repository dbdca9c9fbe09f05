//! Error types for the downscaling engine.

use thiserror::Error;

use crate::time::Day;

/// Result type for downscaling operations.
pub type Result<T> = std::result::Result<T, DownscaleError>;

/// Failure classes of the downscaling engine. All are fatal; the caller
/// decides whether to abort.
#[derive(Error, Debug)]
pub enum DownscaleError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        context: String,
        expected: String,
        got: String,
    },

    #[error("Calendar error: {0}")]
    Calendar(String),

    #[error("Insufficient samples at anchor point {point}: need at least {needed} non-missing timesteps, got {got}")]
    InsufficientSamples {
        point: usize,
        needed: usize,
        got: usize,
    },

    #[error("No analog candidates for day {day}")]
    NoCandidates { day: Day },

    #[error("No observations within {dist_meters} m of anchor point {point}")]
    NoObservationsInNeighborhood { point: usize, dist_meters: f64 },

    #[error("Degenerate clustering: a k-means restart converged in a single iteration")]
    DegenerateClustering,

    #[error("Overlapping seasons: day {day} is claimed by more than one season")]
    OverlappingSeasons { day: Day },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownscaleError {
    /// Convert to a process exit code for the CLI boundary.
    pub fn exit_code(&self) -> i32 {
        match self {
            DownscaleError::Config(_) => 2,
            DownscaleError::DimensionMismatch { .. } => 3,
            DownscaleError::Calendar(_) => 4,
            DownscaleError::InsufficientSamples { .. } => 5,
            DownscaleError::NoCandidates { .. } => 6,
            DownscaleError::NoObservationsInNeighborhood { .. } => 7,
            DownscaleError::DegenerateClustering => 8,
            DownscaleError::OverlappingSeasons { .. } => 9,
            DownscaleError::Io(_) => 10,
        }
    }
}
