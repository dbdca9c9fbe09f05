//! Merge per-season analog records onto the global model time axis.

use serde::{Deserialize, Serialize};

use crate::analog::AnalogDay;
use crate::delta::DayDelta;
use crate::error::{DownscaleError, Result};

/// One season's complete downscaling output before merging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeasonOutput {
    pub analogs: Vec<AnalogDay>,
    pub deltas: Vec<DayDelta>,
    /// Normalized distance of each season day to its assigned cluster.
    pub cluster_dist: Vec<f64>,
    /// Assigned cluster per season day.
    pub class_id: Vec<usize>,
}

/// One globally-ordered downscaled day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedDay {
    pub analog: AnalogDay,
    pub delta: DayDelta,
    pub cluster_dist: f64,
    pub class_id: usize,
}

/// All seasons merged, ordered by the downscaled day's position on the model
/// time axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedRecords {
    pub days: Vec<MergedDay>,
    /// Projection of the global model axis onto merged slots; `None` marks a
    /// day whose month no season claims.
    pub slot_of_model_index: Vec<Option<usize>>,
}

/// Merge the seasons into a single record, verifying that no model day is
/// claimed twice and that every record lands on the model axis.
pub fn merge_seasons(seasons: &[SeasonOutput], n_model_time: usize) -> Result<MergedRecords> {
    let mut claimed: Vec<bool> = vec![false; n_model_time];
    let mut days: Vec<MergedDay> = Vec::new();

    for season in seasons {
        if season.deltas.len() != season.analogs.len()
            || season.cluster_dist.len() != season.analogs.len()
            || season.class_id.len() != season.analogs.len()
        {
            return Err(DownscaleError::DimensionMismatch {
                context: "season output arrays".to_string(),
                expected: format!("{}", season.analogs.len()),
                got: format!(
                    "{}/{}/{}",
                    season.deltas.len(),
                    season.cluster_dist.len(),
                    season.class_id.len()
                ),
            });
        }
        for (pos, analog) in season.analogs.iter().enumerate() {
            let axis = analog.model_axis_index;
            if axis >= n_model_time {
                return Err(DownscaleError::DimensionMismatch {
                    context: "merged model index".to_string(),
                    expected: format!("< {n_model_time}"),
                    got: format!("{axis}"),
                });
            }
            if claimed[axis] {
                return Err(DownscaleError::OverlappingSeasons {
                    day: analog.model_day,
                });
            }
            claimed[axis] = true;
            days.push(MergedDay {
                analog: analog.clone(),
                delta: season.deltas[pos].clone(),
                cluster_dist: season.cluster_dist[pos],
                class_id: season.class_id[pos],
            });
        }
    }

    days.sort_by_key(|d| d.analog.model_axis_index);

    let mut slot_of_model_index = vec![None; n_model_time];
    for (slot, day) in days.iter().enumerate() {
        slot_of_model_index[day.analog.model_axis_index] = Some(slot);
    }

    Ok(MergedRecords {
        days,
        slot_of_model_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analog::AnalogCandidate;
    use crate::time::Day;

    fn season(entries: &[(Day, usize)]) -> SeasonOutput {
        SeasonOutput {
            analogs: entries
                .iter()
                .enumerate()
                .map(|(pos, &(day, axis))| AnalogDay {
                    model_day: day,
                    model_index: pos,
                    model_axis_index: axis,
                    day: Day::new(2000, day.month, day.day),
                    learn_index: pos,
                    candidates: vec![AnalogCandidate {
                        day: Day::new(2000, day.month, day.day),
                        learn_index: pos,
                        metric_norm: 0.0,
                    }],
                })
                .collect(),
            deltas: entries
                .iter()
                .map(|_| DayDelta {
                    delta: 0.0,
                    candidate_deltas: vec![0.0],
                })
                .collect(),
            cluster_dist: vec![0.0; entries.len()],
            class_id: vec![0; entries.len()],
        }
    }

    #[test]
    fn merge_orders_by_model_axis_and_projects_slots() {
        let summer = season(&[(Day::new(2001, 7, 20), 200)]);
        let winter = season(&[(Day::new(2001, 2, 10), 40)]);
        let merged = merge_seasons(&[summer, winter], 365).unwrap();

        assert_eq!(merged.days.len(), 2);
        assert_eq!(merged.days[0].analog.model_day, Day::new(2001, 2, 10));
        assert_eq!(merged.days[1].analog.model_day, Day::new(2001, 7, 20));
        assert!(merged
            .days
            .windows(2)
            .all(|w| w[0].analog.model_axis_index < w[1].analog.model_axis_index));

        assert_eq!(merged.slot_of_model_index[40], Some(0));
        assert_eq!(merged.slot_of_model_index[200], Some(1));
        assert_eq!(merged.slot_of_model_index[41], None);
        let covered = merged.slot_of_model_index.iter().flatten().count();
        assert_eq!(covered, 2);
    }

    #[test]
    fn duplicate_model_day_fails() {
        let a = season(&[(Day::new(2001, 2, 10), 40)]);
        let b = season(&[(Day::new(2001, 2, 10), 40)]);
        let err = merge_seasons(&[a, b], 365).unwrap_err();
        assert!(matches!(err, DownscaleError::OverlappingSeasons { .. }));
    }

    #[test]
    fn record_count_matches_season_totals() {
        let a = season(&[(Day::new(2001, 1, 1), 0), (Day::new(2001, 1, 2), 1)]);
        let b = season(&[(Day::new(2001, 7, 1), 181)]);
        let merged = merge_seasons(&[a, b], 365).unwrap();
        assert_eq!(merged.days.len(), 3);
    }
}
