//! Gridded fields and their spatial/temporal reductions.
//!
//! All fields are promoted to `f64` at ingest and carry an explicit missing
//! value, compared exactly. Layout is time-major: `values[t*nlat*nlon + j*nlon + i]`.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::error::{DownscaleError, Result};

/// Mean Earth radius in meters for great-circle distances.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A 2-D field over a daily time axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub values: Vec<f64>,
    pub nlon: usize,
    pub nlat: usize,
    pub ntime: usize,
    pub missing: f64,
}

impl Field {
    pub fn new(values: Vec<f64>, nlon: usize, nlat: usize, ntime: usize, missing: f64) -> Result<Self> {
        if values.len() != nlon * nlat * ntime {
            return Err(DownscaleError::DimensionMismatch {
                context: "field values".to_string(),
                expected: format!("{}", nlon * nlat * ntime),
                got: format!("{}", values.len()),
            });
        }
        Ok(Field {
            values,
            nlon,
            nlat,
            ntime,
            missing,
        })
    }

    #[inline]
    pub fn cell(&self, t: usize, j: usize, i: usize) -> f64 {
        self.values[t * self.nlat * self.nlon + j * self.nlon + i]
    }

    /// One timestep as a flat slice of `nlat*nlon` cells.
    #[inline]
    pub fn slab(&self, t: usize) -> &[f64] {
        let n = self.nlat * self.nlon;
        &self.values[t * n..(t + 1) * n]
    }

    /// Overwrite masked-out cells (mask value 0) with the missing value at
    /// every timestep.
    pub fn mask_points(&mut self, mask: &[u8]) -> Result<()> {
        check_mask_len(mask, self.nlon, self.nlat, "field mask")?;
        let n = self.nlat * self.nlon;
        for t in 0..self.ntime {
            for c in 0..n {
                if mask[c] == 0 {
                    self.values[t * n + c] = self.missing;
                }
            }
        }
        Ok(())
    }

    /// Spatial mean of one timestep under an optional binary mask, skipping
    /// missing cells. Returns the missing value when nothing contributes.
    pub fn spatial_mean(&self, t: usize, mask: Option<&[u8]>) -> f64 {
        let slab = self.slab(t);
        let mut sum = 0.0;
        let mut count = 0usize;
        for (c, &v) in slab.iter().enumerate() {
            if let Some(m) = mask {
                if m[c] == 0 {
                    continue;
                }
            }
            if v != self.missing {
                sum += v;
                count += 1;
            }
        }
        if count == 0 {
            self.missing
        } else {
            sum / count as f64
        }
    }

    /// Spatial mean at every timestep.
    pub fn spatial_mean_series(&self, mask: Option<&[u8]>) -> Result<Vec<f64>> {
        if let Some(m) = mask {
            check_mask_len(m, self.nlon, self.nlat, "secondary field mask")?;
        }
        Ok((0..self.ntime).map(|t| self.spatial_mean(t, mask)).collect())
    }

    /// Per-cell mean and sample variance over a set of timesteps.
    pub fn time_mean_variance(&self, times: &[usize]) -> (Vec<f64>, Vec<f64>) {
        let n = self.nlat * self.nlon;
        let mut mean = vec![0.0; n];
        let mut var = vec![0.0; n];
        for c in 0..n {
            let series: Vec<f64> = times.iter().map(|&t| self.values[t * n + c]).collect();
            mean[c] = series.iter().mean();
            var[c] = if series.len() > 1 {
                series.iter().variance()
            } else {
                0.0
            };
        }
        (mean, var)
    }
}

/// Coordinates of a gridded domain; `lon`/`lat` are per cell, row-major.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grid {
    pub lon: Vec<f64>,
    pub lat: Vec<f64>,
    pub nlon: usize,
    pub nlat: usize,
}

impl Grid {
    pub fn new(lon: Vec<f64>, lat: Vec<f64>, nlon: usize, nlat: usize) -> Result<Self> {
        if lon.len() != nlon * nlat || lat.len() != nlon * nlat {
            return Err(DownscaleError::DimensionMismatch {
                context: "grid coordinates".to_string(),
                expected: format!("{}", nlon * nlat),
                got: format!("{}/{}", lon.len(), lat.len()),
            });
        }
        Ok(Grid {
            lon,
            lat,
            nlon,
            nlat,
        })
    }
}

/// Great-circle distance in meters between two (lon, lat) points in degrees,
/// by the spherical law of cosines.
pub fn distance_point(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dlambda = (lon2 - lon1).to_radians();
    let cosine = phi1.sin() * phi2.sin() + phi1.cos() * phi2.cos() * dlambda.cos();
    EARTH_RADIUS_M * cosine.clamp(-1.0, 1.0).acos()
}

/// Mean and sample variance of a spatially-averaged field over a set of
/// timesteps (the control-run seasonal reference of the secondary field).
pub fn mean_variance_series(series: &[f64], times: &[usize]) -> (f64, f64) {
    let sub: Vec<f64> = times.iter().map(|&t| series[t]).collect();
    let mean = sub.iter().mean();
    let var = if sub.len() > 1 { sub.iter().variance() } else { 0.0 };
    (mean, var)
}

/// Masked spatial covariance between one timestep of each of two fields.
/// Both slabs must share the grid shape; the mask (1 = active) selects the
/// cells entering the covariance.
pub fn spatial_covariance(
    a: &[f64],
    b: &[f64],
    mask: Option<&[u8]>,
    nlon: usize,
    nlat: usize,
) -> Result<f64> {
    let n = nlon * nlat;
    if a.len() != n || b.len() != n {
        return Err(DownscaleError::DimensionMismatch {
            context: "covariance slabs".to_string(),
            expected: format!("{n}"),
            got: format!("{}/{}", a.len(), b.len()),
        });
    }
    let active: Vec<usize> = (0..n)
        .filter(|&c| mask.map_or(true, |m| m[c] != 0))
        .collect();
    if active.is_empty() {
        return Ok(0.0);
    }
    let count = active.len() as f64;
    let mean_a: f64 = active.iter().map(|&c| a[c]).sum::<f64>() / count;
    let mean_b: f64 = active.iter().map(|&c| b[c]).sum::<f64>() / count;
    let cov = active
        .iter()
        .map(|&c| (a[c] - mean_a) * (b[c] - mean_b))
        .sum::<f64>()
        / count;
    Ok(cov)
}

fn check_mask_len(mask: &[u8], nlon: usize, nlat: usize, context: &str) -> Result<()> {
    if mask.len() != nlon * nlat {
        return Err(DownscaleError::DimensionMismatch {
            context: context.to_string(),
            expected: format!("{}", nlon * nlat),
            got: format!("{}", mask.len()),
        });
    }
    Ok(())
}
