//! Karhunen-Loève wavefront modes.
//!
//! The KL basis is built by diagonalizing the Kolmogorov covariance of the
//! Zernike coefficients over a chosen Noll range. Each KL mode is a linear
//! combination of Zernikes; eigenmodes with variance below the singular-value
//! cutoff are discarded.

use crate::error::OpticsError;
use crate::zernike;
use nalgebra::DMatrix;
use ndarray::Array2;
use statrs::function::gamma::ln_gamma;

/// Kolmogorov normalization of the Zernike covariance, in (D/r0)^(5/3)
/// units.
const KOLMOGOROV_NORM: f64 = 2.2698;

/// Weights below this contribute nothing visible to a mode surface.
const WEIGHT_FLOOR: f64 = 1e-9;

/// Covariance of the Kolmogorov-turbulence Zernike coefficients for Noll
/// modes `i` and `j` (piston excluded by the caller).
pub fn kolmogorov_covariance(i: u16, j: u16) -> f64 {
    let (ni, mi) = zernike::noll_to_nm(i);
    let (nj, mj) = zernike::noll_to_nm(j);
    if mi != mj {
        return 0.0;
    }
    let m_abs = mi.unsigned_abs();
    let ni = ni as f64;
    let nj = nj as f64;
    let sign = if ((ni + nj) as i64 - 2 * m_abs as i64) / 2 % 2 == 0 {
        1.0
    } else {
        -1.0
    };
    let log_value = ln_gamma((ni + nj - 5.0 / 3.0) / 2.0)
        - ln_gamma((ni - nj + 17.0 / 3.0) / 2.0)
        - ln_gamma((nj - ni + 17.0 / 3.0) / 2.0)
        - ln_gamma((ni + nj + 23.0 / 3.0) / 2.0);
    KOLMOGOROV_NORM * sign * ((ni + 1.0) * (nj + 1.0)).sqrt() * log_value.exp()
}

/// A KL expansion over a Zernike range.
#[derive(Debug, Clone)]
pub struct KarhunenLoeve {
    /// First Noll mode of the expansion range.
    pub kl_min: u16,
    /// Last Noll mode of the expansion range.
    pub kl_max: u16,
    /// Eigenvalues, descending.
    pub eigenvalues: Vec<f64>,
    /// Per eigenmode: (Noll mode, weight) pairs, weight floor applied.
    pub weights: Vec<Vec<(u16, f64)>>,
}

impl KarhunenLoeve {
    /// Diagonalize the Kolmogorov covariance over [kl_min, kl_max].
    ///
    /// `cutoff` is relative to the largest eigenvalue; eigenmodes below it
    /// are dropped.
    pub fn expand(kl_min: u16, kl_max: u16, cutoff: f64) -> Result<Self, OpticsError> {
        if kl_min < 2 || kl_min > kl_max {
            return Err(OpticsError::EmptyExpansion {
                min: kl_min,
                max: kl_max,
            });
        }
        let modes: Vec<u16> = (kl_min..=kl_max).collect();
        let n = modes.len();
        let cov = DMatrix::from_fn(n, n, |r, c| kolmogorov_covariance(modes[r], modes[c]));
        let eig = cov.symmetric_eigen();

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            eig.eigenvalues[b]
                .partial_cmp(&eig.eigenvalues[a])
                .expect("turbulence covariance eigenvalues are finite")
        });

        let largest = eig.eigenvalues[order[0]];
        if largest <= 0.0 {
            return Err(OpticsError::EmptyExpansion {
                min: kl_min,
                max: kl_max,
            });
        }

        let mut eigenvalues = Vec::new();
        let mut weights = Vec::new();
        for &col in &order {
            let value = eig.eigenvalues[col];
            if value < cutoff * largest {
                break;
            }
            eigenvalues.push(value);
            let vector = eig.eigenvectors.column(col);
            let mode_weights: Vec<(u16, f64)> = modes
                .iter()
                .zip(vector.iter())
                .filter(|(_, &w)| w.abs() > WEIGHT_FLOOR)
                .map(|(&m, &w)| (m, w))
                .collect();
            weights.push(mode_weights);
        }
        if eigenvalues.is_empty() {
            return Err(OpticsError::EmptyExpansion {
                min: kl_min,
                max: kl_max,
            });
        }
        Ok(Self {
            kl_min,
            kl_max,
            eigenvalues,
            weights,
        })
    }

    /// Number of retained eigenmodes.
    pub fn len(&self) -> usize {
        self.eigenvalues.len()
    }

    /// True when no eigenmode survived the cutoff.
    pub fn is_empty(&self) -> bool {
        self.eigenvalues.is_empty()
    }

    /// Evaluate the eigenmode of the given rank on a pixel grid.
    pub fn evaluate(
        &self,
        rank: usize,
        n_pixels: usize,
        radius: f64,
        angle: f64,
    ) -> Option<Array2<f64>> {
        let mode_weights = self.weights.get(rank)?;
        let mut surface = Array2::zeros((n_pixels, n_pixels));
        for &(mode, weight) in mode_weights {
            surface += &(zernike::evaluate(mode, n_pixels, radius, angle) * weight);
        }
        Some(surface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn covariance_is_symmetric() {
        for i in 2..12u16 {
            for j in 2..12u16 {
                assert_relative_eq!(
                    kolmogorov_covariance(i, j),
                    kolmogorov_covariance(j, i),
                    epsilon = 1e-12
                );
            }
        }
    }

    #[test]
    fn covariance_vanishes_across_azimuthal_orders() {
        // Tilt (m=1) against defocus (m=0) and astigmatism (m=2).
        assert_eq!(kolmogorov_covariance(2, 4), 0.0);
        assert_eq!(kolmogorov_covariance(2, 6), 0.0);
        // Cosine tilt against sine tilt.
        assert_eq!(kolmogorov_covariance(2, 3), 0.0);
    }

    #[test]
    fn tilt_variance_dominates() {
        let tilt = kolmogorov_covariance(2, 2);
        for mode in 4..15u16 {
            assert!(tilt > kolmogorov_covariance(mode, mode));
        }
    }

    #[test]
    fn radial_mode_coupling_is_negative() {
        // Defocus couples to spherical with opposite sign, a known property
        // of the Kolmogorov covariance.
        assert!(kolmogorov_covariance(4, 11) < 0.0);
    }

    #[test]
    fn expansion_orders_eigenvalues_descending() {
        let kl = KarhunenLoeve::expand(2, 36, 0.0).unwrap();
        for pair in kl.eigenvalues.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
        assert_eq!(kl.len(), 35);
    }

    #[test]
    fn cutoff_drops_weak_eigenmodes() {
        let full = KarhunenLoeve::expand(2, 36, 0.0).unwrap();
        let trimmed = KarhunenLoeve::expand(2, 36, 1e-2).unwrap();
        assert!(trimmed.len() < full.len());
        assert!(!trimmed.is_empty());
    }

    #[test]
    fn leading_eigenmode_is_tilt_dominated() {
        let kl = KarhunenLoeve::expand(2, 36, 0.0).unwrap();
        let first = &kl.weights[0];
        let (dominant, weight) = first
            .iter()
            .max_by(|a, b| a.1.abs().partial_cmp(&b.1.abs()).unwrap())
            .unwrap();
        assert!(*dominant == 2 || *dominant == 3, "dominant {dominant}");
        assert!(weight.abs() > 0.9);
    }

    #[test]
    fn invalid_range_is_rejected() {
        assert!(KarhunenLoeve::expand(1, 10, 0.0).is_err());
        assert!(KarhunenLoeve::expand(5, 4, 0.0).is_err());
    }
}
