//! Step-direction strategies for the β optimizer.
//!
//! The method is chosen once at solver construction and dispatched through
//! a tagged variant, not re-selected per iteration. All of them produce a
//! descent direction in β-space; the driver owns the line search.

use nalgebra::{DMatrix, DVector};
use shared::StepMethod;

/// Curvature floor below which quasi-Newton updates are skipped.
const CURVATURE_FLOOR: f64 = 1e-14;

/// Direction generator for the chosen GETSTEP method.
pub enum Stepper {
    /// β ← β − s·grad.
    SteepestDescent,
    /// Polak-Ribière conjugate gradient.
    ConjugateGradient {
        /// Gradient at the previous accepted point.
        prev_grad: Option<Vec<f64>>,
        /// Previous search direction.
        prev_dir: Option<Vec<f64>>,
    },
    /// Dense BFGS Hessian approximation; direction solves H·d = −g.
    Bfgs {
        /// Current Hessian approximation.
        hessian: DMatrix<f64>,
        /// β at the previous accepted point.
        prev_beta: Option<DVector<f64>>,
        /// Gradient at the previous accepted point.
        prev_grad: Option<DVector<f64>>,
    },
    /// Dense inverse-BFGS; direction is −H⁻¹·g directly.
    BfgsInverse {
        /// Current inverse-Hessian approximation.
        inverse: DMatrix<f64>,
        /// β at the previous accepted point.
        prev_beta: Option<DVector<f64>>,
        /// Gradient at the previous accepted point.
        prev_grad: Option<DVector<f64>>,
    },
}

impl Stepper {
    /// Build the stepper for `method` over `n` free parameters.
    pub fn new(method: StepMethod, n: usize) -> Self {
        match method {
            StepMethod::SteepestDescent => Self::SteepestDescent,
            StepMethod::ConjugateGradient => Self::ConjugateGradient {
                prev_grad: None,
                prev_dir: None,
            },
            StepMethod::Bfgs => Self::Bfgs {
                hessian: DMatrix::identity(n, n),
                prev_beta: None,
                prev_grad: None,
            },
            StepMethod::BfgsInverse => Self::BfgsInverse {
                inverse: DMatrix::identity(n, n),
                prev_beta: None,
                prev_grad: None,
            },
        }
    }

    /// Forget accumulated curvature; called when the enabled-mode set grows.
    pub fn reset(&mut self) {
        match self {
            Self::SteepestDescent => {}
            Self::ConjugateGradient { prev_grad, prev_dir } => {
                *prev_grad = None;
                *prev_dir = None;
            }
            Self::Bfgs {
                hessian,
                prev_beta,
                prev_grad,
            } => {
                hessian.fill_with_identity();
                *prev_beta = None;
                *prev_grad = None;
            }
            Self::BfgsInverse {
                inverse,
                prev_beta,
                prev_grad,
            } => {
                inverse.fill_with_identity();
                *prev_beta = None;
                *prev_grad = None;
            }
        }
    }

    /// Next search direction for the current point and gradient.
    pub fn direction(&mut self, beta: &[f64], grad: &[f64]) -> Vec<f64> {
        match self {
            Self::SteepestDescent => grad.iter().map(|&g| -g).collect(),

            Self::ConjugateGradient { prev_grad, prev_dir } => {
                let dir = match (prev_grad.as_ref(), prev_dir.as_ref()) {
                    (Some(pg), Some(pd)) => {
                        // Polak-Ribière: β = gᵀ(g − g_prev) / |g_prev|².
                        let denom: f64 = pg.iter().map(|&v| v * v).sum();
                        let numer: f64 = grad
                            .iter()
                            .zip(pg.iter())
                            .map(|(&g, &p)| g * (g - p))
                            .sum();
                        let pr = if denom > 0.0 {
                            (numer / denom).max(0.0)
                        } else {
                            0.0
                        };
                        grad.iter()
                            .zip(pd.iter())
                            .map(|(&g, &d)| -g + pr * d)
                            .collect::<Vec<f64>>()
                    }
                    _ => grad.iter().map(|&g| -g).collect(),
                };
                // A non-descent direction restarts on steepest descent.
                let slope: f64 = dir.iter().zip(grad.iter()).map(|(&d, &g)| d * g).sum();
                let dir = if slope >= 0.0 {
                    grad.iter().map(|&g| -g).collect()
                } else {
                    dir
                };
                *prev_grad = Some(grad.to_vec());
                *prev_dir = Some(dir.clone());
                dir
            }

            Self::Bfgs {
                hessian,
                prev_beta,
                prev_grad,
            } => {
                let g = DVector::from_column_slice(grad);
                let b = DVector::from_column_slice(beta);
                if let (Some(pb), Some(pg)) = (prev_beta.as_ref(), prev_grad.as_ref()) {
                    let s = &b - pb;
                    let y = &g - pg;
                    let sy = s.dot(&y);
                    if sy > CURVATURE_FLOOR {
                        // H ← H − (H s sᵀ H)/(sᵀ H s) + (y yᵀ)/(yᵀ s).
                        let hs = &*hessian * &s;
                        let shs = s.dot(&hs);
                        if shs > CURVATURE_FLOOR {
                            *hessian -= &hs * hs.transpose() / shs;
                        }
                        *hessian += &y * y.transpose() / sy;
                    }
                }
                *prev_beta = Some(b);
                *prev_grad = Some(g.clone());
                let dir = hessian
                    .clone()
                    .lu()
                    .solve(&(-&g))
                    .unwrap_or_else(|| -&g);
                // Guard against an indefinite approximation.
                if dir.dot(&g) >= 0.0 {
                    (-g).iter().cloned().collect()
                } else {
                    dir.iter().cloned().collect()
                }
            }

            Self::BfgsInverse {
                inverse,
                prev_beta,
                prev_grad,
            } => {
                let g = DVector::from_column_slice(grad);
                let b = DVector::from_column_slice(beta);
                if let (Some(pb), Some(pg)) = (prev_beta.as_ref(), prev_grad.as_ref()) {
                    let s = &b - pb;
                    let y = &g - pg;
                    let sy = s.dot(&y);
                    if sy > CURVATURE_FLOOR {
                        // Sherman-Morrison form of the inverse update.
                        let rho = 1.0 / sy;
                        let n = s.len();
                        let identity = DMatrix::<f64>::identity(n, n);
                        let left = &identity - rho * &s * y.transpose();
                        let right = &identity - rho * &y * s.transpose();
                        *inverse = &left * &*inverse * right + rho * &s * s.transpose();
                    }
                }
                *prev_beta = Some(b);
                *prev_grad = Some(g.clone());
                let dir = -(&*inverse * &g);
                if dir.dot(&g) >= 0.0 {
                    (-g).iter().cloned().collect()
                } else {
                    dir.iter().cloned().collect()
                }
            }
        }
    }
}
