//! Secondary-field correction between analog and model days.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::analog::AnalogDay;
use crate::error::{DownscaleError, Result};

/// The temperature correction of one downscaled day, in the physical units
/// of the secondary field before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayDelta {
    pub delta: f64,
    /// One delta per first-selection candidate, in candidate order.
    pub candidate_deltas: Vec<f64>,
}

/// Denormalized difference between the model day's secondary index and the
/// analog day's learning index: `x_mdl sqrt(V_ctrl) - x_lrn sqrt(V_lrn)`.
pub fn secondary_deltas(
    analogs: &[AnalogDay],
    sup_norm_model: &[f64],
    sup_index_learn: &[f64],
    control_var: f64,
    learning_var: f64,
) -> Result<Vec<DayDelta>> {
    if sup_norm_model.len() != analogs.len() {
        return Err(DownscaleError::DimensionMismatch {
            context: "secondary model index".to_string(),
            expected: format!("{}", analogs.len()),
            got: format!("{}", sup_norm_model.len()),
        });
    }
    let ctrl_sd = control_var.sqrt();
    let learn_sd = learning_var.sqrt();
    Ok(analogs
        .par_iter()
        .map(|analog| {
            let model_term = sup_norm_model[analog.model_index] * ctrl_sd;
            let delta = model_term - sup_index_learn[analog.learn_index] * learn_sd;
            let candidate_deltas = analog
                .candidates
                .iter()
                .map(|c| model_term - sup_index_learn[c.learn_index] * learn_sd)
                .collect();
            DayDelta {
                delta,
                candidate_deltas,
            }
        })
        .collect())
}
