//! Per-patch nonlinear optimizer over the free parameters β.
//!
//! The solver owns the flattened subimage state of one patch, evaluates the
//! image-formation metric and its gradient, and drives line-search steps
//! with the configured method. β and α are only ever connected through the
//! constraint operators. Per-subimage work inside a step fans out on the
//! rayon pool; the outer step stays sequential because it owns β.

pub mod getstep;

use crate::constraints::Constraints;
use crate::data::PatchData;
use crate::error::MomfbdError;
use crate::object::Object;
use crate::subimage::SubImage;
use getstep::Stepper;
use ndarray::Array2;
use rayon::prelude::*;
use rustfft::num_complex::Complex64;
use shared::{GlobalCfg, GradientMethod};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Armijo sufficient-decrease constant.
const ARMIJO_C1: f64 = 1e-4;
/// Line-search halvings before giving up on a direction.
const MAX_BACKTRACKS: usize = 24;

/// What a finished solve reports back.
#[derive(Debug, Clone, Copy)]
pub struct SolveSummary {
    /// Total inner iterations across all mode-progression rounds.
    pub iterations: usize,
    /// Final metric value.
    pub metric: f64,
}

/// The per-patch optimizer.
pub struct Solver<'a> {
    cfg: &'a GlobalCfg,
    objects: &'a [Object],
    constraints: &'a Constraints,
    /// All subimages of the patch, flattened in global image order.
    pub subimages: Vec<SubImage>,
    /// Object index of each flattened subimage.
    object_of: Vec<usize>,
    n_modes: usize,
    alpha: Vec<f64>,
    grad_alpha: Vec<f64>,
    beta: Vec<f64>,
    grad_beta: Vec<f64>,
    enabled: Vec<bool>,
    stepper: Stepper,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> Solver<'a> {
    /// Build the solver state for one patch: cut subimages, prime the
    /// image-power sums and the regularization feedback.
    pub fn new(
        cfg: &'a GlobalCfg,
        objects: &'a [Object],
        constraints: &'a Constraints,
        patch: &PatchData,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Result<Self, MomfbdError> {
        if patch.objects.len() != objects.len() {
            return Err(MomfbdError::Numeric(format!(
                "patch carries {} objects, job has {}",
                patch.objects.len(),
                objects.len()
            )));
        }
        let n_modes = objects
            .first()
            .map(|o| o.modes.len())
            .ok_or_else(|| MomfbdError::config("job without objects"))?;

        let mut subimages = Vec::new();
        let mut object_of = Vec::new();
        for (oi, object) in objects.iter().enumerate() {
            object.init_patch();
            let subs = object.make_subimages(&patch.objects[oi], subimages.len())?;
            for sub in subs {
                object.add_to_ft(&sub.ft);
                object.add_reg_gamma(cfg.reg_gamma * sub.noise * sub.noise);
                object_of.push(oi);
                subimages.push(sub);
            }
        }

        let n_parameters = subimages.len() * n_modes;
        if n_parameters != constraints.n_parameters as usize {
            return Err(MomfbdError::Numeric(format!(
                "constraint system covers {} parameters, patch needs {n_parameters}",
                constraints.n_parameters
            )));
        }
        let n_free = constraints.n_free_parameters as usize;

        Ok(Self {
            cfg,
            objects,
            constraints,
            subimages,
            object_of,
            n_modes,
            alpha: vec![0.0; n_parameters],
            grad_alpha: vec![0.0; n_parameters],
            beta: vec![0.0; n_free],
            grad_beta: vec![0.0; n_free],
            enabled: vec![false; n_modes],
            stepper: Stepper::new(cfg.getstep_method, n_free),
            cancel,
        })
    }

    /// Run the mode-progression loop and write results into the patch.
    pub fn run(&mut self, patch: &mut PatchData) -> Result<SolveSummary, MomfbdError> {
        let mut total_iterations = 0usize;
        let mut enabled_count = (self.cfg.mode_start as usize).min(self.n_modes).max(1);
        let mut metric = f64::INFINITY;

        loop {
            for slot in self.enabled.iter_mut().take(enabled_count) {
                *slot = true;
            }
            self.stepper.reset();
            debug!(enabled = enabled_count, "mode-progression round");

            metric = self.optimize_round(&mut total_iterations)?;

            if enabled_count >= self.n_modes {
                break;
            }
            self.recentre_windows();
            enabled_count =
                (enabled_count + (self.cfg.mode_step as usize).max(1)).min(self.n_modes);
        }

        // Subimages are contiguous per object by construction.
        patch.results.clear();
        for (oi, object) in self.objects.iter().enumerate() {
            let start = self
                .object_of
                .iter()
                .position(|&o| o == oi)
                .unwrap_or(self.subimages.len());
            let count = self.object_of.iter().filter(|&&o| o == oi).count();
            let slice = &self.subimages[start..start + count];
            patch
                .results
                .push(object.get_results(slice, self.cfg.run_flags)?);
        }
        patch.final_metric = metric;

        Ok(SolveSummary {
            iterations: total_iterations,
            metric,
        })
    }

    /// Inner loop for one enabled-mode set. Returns the final metric.
    fn optimize_round(&mut self, total_iterations: &mut usize) -> Result<f64, MomfbdError> {
        let beta = self.beta.clone();
        let mut f = self.evaluate(&beta)?;
        let mut step_scale: Option<f64> = None;

        for iteration in 0..self.cfg.max_iterations as usize {
            self.check_cancelled()?;

            self.compute_gradient()?;
            let grad_norm: f64 = self.grad_beta.iter().map(|&g| g * g).sum::<f64>().sqrt();
            if grad_norm == 0.0 {
                trace!("gradient vanished, round done");
                break;
            }

            let beta_snapshot = self.beta.clone();
            let direction = self.stepper.direction(&beta_snapshot, &self.grad_beta);
            let slope: f64 = direction
                .iter()
                .zip(&self.grad_beta)
                .map(|(&d, &g)| d * g)
                .sum();
            if slope >= 0.0 {
                warn!("search direction does not descend, stopping round");
                break;
            }

            // Armijo backtracking: start from twice the last accepted
            // scale, or a unit-length step while none has been accepted.
            let dir_norm: f64 = direction.iter().map(|&d| d * d).sum::<f64>().sqrt();
            let mut s = match step_scale {
                Some(prev) => (2.0 * prev).min(1e3),
                None => 1.0 / dir_norm.max(f64::MIN_POSITIVE),
            };
            let mut accepted = None;
            for _ in 0..MAX_BACKTRACKS {
                let trial: Vec<f64> = beta_snapshot
                    .iter()
                    .zip(&direction)
                    .map(|(&b, &d)| b + s * d)
                    .collect();
                let f_trial = self.evaluate(&trial)?;
                if f_trial <= f + ARMIJO_C1 * s * slope {
                    accepted = Some((trial, f_trial, s));
                    break;
                }
                s *= 0.5;
            }

            *total_iterations += 1;
            let Some((new_beta, f_new, s_used)) = accepted else {
                // No decrease along a descent direction: restore the best
                // point and end the round.
                let _ = self.evaluate(&beta_snapshot)?;
                trace!("line search exhausted, round done");
                break;
            };

            let df = f - f_new;
            self.beta = new_beta;
            step_scale = Some(s_used);
            f = f_new;
            trace!(iteration, f, df, s_used, "accepted step");

            if !f.is_finite() {
                return Err(MomfbdError::Numeric("metric became non-finite".into()));
            }
            let relative = df / f.abs().max(f64::MIN_POSITIVE);
            if relative < self.cfg.ftol && iteration + 1 >= self.cfg.min_iterations as usize {
                break;
            }
        }
        Ok(f)
    }

    /// Metric at a trial β: map to α, rebuild every OTF and the P/Q
    /// accumulators, and sum the per-object metrics.
    fn evaluate(&mut self, beta: &[f64]) -> Result<f64, MomfbdError> {
        self.constraints.reverse(beta, &mut self.alpha);

        let n_modes = self.n_modes;
        let alpha = &self.alpha;
        self.subimages
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, sub)| {
                sub.apply_alpha(&alpha[i * n_modes..(i + 1) * n_modes]);
            });

        for object in self.objects {
            object.init_pq();
        }
        let objects = self.objects;
        let object_of = &self.object_of;
        self.subimages.par_iter().enumerate().for_each(|(i, sub)| {
            objects[object_of[i]].add_to_pq(&sub.ft, &sub.otf);
        });

        let metric: f64 = self.objects.iter().map(Object::calc_metric).sum();
        if metric.is_nan() {
            return Err(MomfbdError::Numeric("metric evaluated to NaN".into()));
        }
        Ok(metric)
    }

    /// Gradient of the metric at the current point, in α then β space.
    fn compute_gradient(&mut self) -> Result<(), MomfbdError> {
        let snapshots: Vec<(Array2<Complex64>, Array2<f64>)> =
            self.objects.iter().map(Object::pq_snapshot).collect();

        let n_modes = self.n_modes;
        let eps = self.cfg.eps;
        let method = self.cfg.gradient_method;
        let enabled = &self.enabled;
        let objects = self.objects;
        let object_of = &self.object_of;
        let alpha = &self.alpha;

        let blocks: Vec<Vec<f64>> = self
            .subimages
            .par_iter()
            .enumerate()
            .map(|(i, sub)| {
                let oi = object_of[i];
                let (p, q) = &snapshots[oi];
                let otf_n = 2 * objects[oi].pupil.n_pixels;
                let scale = objects[oi].weight / (otf_n * otf_n) as f64;
                let mut block = vec![0.0; n_modes];
                match method {
                    GradientMethod::Vogel => {
                        sub.gradient_vogel(p, q, scale, &mut block);
                        for (k, slot) in block.iter_mut().enumerate() {
                            if !enabled[k] {
                                *slot = 0.0;
                            }
                        }
                    }
                    GradientMethod::Difference => {
                        for (k, slot) in block.iter_mut().enumerate() {
                            if !enabled[k] {
                                continue;
                            }
                            let a = alpha[i * n_modes + k];
                            let h = eps * a.abs().max(1.0);
                            let delta = sub.metric_delta_for_mode(k, h, p, q);
                            *slot = scale * delta / h;
                        }
                    }
                }
                block
            })
            .collect();

        for (i, block) in blocks.iter().enumerate() {
            self.grad_alpha[i * n_modes..(i + 1) * n_modes].copy_from_slice(block);
        }
        if self.grad_alpha.iter().any(|v| v.is_nan()) {
            return Err(MomfbdError::Numeric("gradient evaluated to NaN".into()));
        }

        self.constraints.apply(&self.grad_alpha, &mut self.grad_beta);
        Ok(())
    }

    /// Re-centre windows whose effective tilt has grown past a whole pixel.
    ///
    /// The window slides inside its cutout margin, the absorbed whole-pixel
    /// shift moves out of the tilt offsets, and the image-power sum is
    /// updated with the FT delta. Runs between mode-progression rounds,
    /// before the next round re-evaluates the metric.
    fn recentre_windows(&mut self) {
        let n_modes = self.n_modes;
        let objects = self.objects;
        let object_of = &self.object_of;
        let alpha = &self.alpha;
        for (i, sub) in self.subimages.iter_mut().enumerate() {
            let object = &objects[object_of[i]];
            if object.pixels_to_alpha == 0.0 {
                continue;
            }
            let pixel_shift = |tilt: Option<usize>| -> i32 {
                match tilt {
                    Some(k) => {
                        let effective = alpha[i * n_modes + k] + sub.alpha_offset[k];
                        (effective / object.pixels_to_alpha).round() as i32
                    }
                    None => 0,
                }
            };
            let dy = pixel_shift(object.modes.y_tilt_index);
            let dx = pixel_shift(object.modes.x_tilt_index);
            if dy == 0 && dx == 0 {
                continue;
            }
            if let Some((applied_y, applied_x, old_ft)) = sub.shift_window(dy, dx) {
                if let Some(k) = object.modes.y_tilt_index {
                    sub.alpha_offset[k] -= applied_y as f64 * object.pixels_to_alpha;
                }
                if let Some(k) = object.modes.x_tilt_index {
                    sub.alpha_offset[k] -= applied_x as f64 * object.pixels_to_alpha;
                }
                object.add_diff_to_ft(&sub.ft, &old_ft);
                trace!(image = sub.index, applied_y, applied_x, "window re-centred");
            }
        }
    }

    fn check_cancelled(&self) -> Result<(), MomfbdError> {
        if let Some(token) = &self.cancel {
            if token.load(Ordering::Relaxed) {
                return Err(MomfbdError::Cancelled);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelInput};
    use crate::data::{ChannelPatch, ObjectPatch};
    use approx::assert_relative_eq;
    use ndarray::{s, Array3};
    use rand::prelude::*;
    use rand_distr::Normal;
    use shared::{ChannelCfg, ObjectCfg, PointF, RunFlags, SaveFlags, StepMethod};

    const PUPIL_N: usize = 8;
    const PATCH_N: usize = 16;

    fn test_global(gradient: GradientMethod, step: StepMethod) -> GlobalCfg {
        let mut global = GlobalCfg {
            telescope_d: 1.0,
            mode_start: 3,
            mode_step: 3,
            min_iterations: 3,
            max_iterations: 300,
            ftol: 1e-12,
            eps: 1e-6,
            gradient_method: gradient,
            getstep_method: step,
            ..Default::default()
        };
        global.object_defaults.patch_size = PATCH_N as u16;
        global.object_defaults.pupil_pixels = PUPIL_N as u16;
        global.object_defaults.wavelength = 500e-9;
        global
    }

    fn make_channel(n_frames: usize, diversity: Vec<f64>) -> Channel {
        let cfg = ChannelCfg {
            // Chosen so the derived pupil radius is ~3.5 px on the 8-px grid.
            arcsec_per_pixel: 0.045,
            weight: 1.0,
            image_numbers: (0..n_frames as u32).collect(),
            diversity,
            ..Default::default()
        };
        Channel::preprocess(
            cfg,
            ChannelInput {
                frames: Array3::from_elem((n_frames, PATCH_N, PATCH_N), 1.0),
                ..Default::default()
            },
            RunFlags::empty(),
            1e-5,
        )
        .unwrap()
    }

    fn smooth_object(seed: u64) -> Array2<f64> {
        // Random field pushed through a heavy low-pass so the scene has
        // power mostly inside the OTF support.
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Normal::new(100.0, 20.0).unwrap();
        let raw = Array2::from_shape_fn((PATCH_N, PATCH_N), |_| dist.sample(&mut rng));
        let mut spectrum = crate::fourier::fft2_real(&raw.view());
        let (rows, cols) = spectrum.dim();
        for y in 0..rows {
            for x in 0..cols {
                let fy = if y > rows / 2 { y as f64 - rows as f64 } else { y as f64 };
                let fx = if x > cols / 2 { x as f64 - cols as f64 } else { x as f64 };
                let r = (fy * fy + fx * fx).sqrt();
                spectrum[[y, x]] *= (-r * r / 8.0).exp();
            }
        }
        crate::fourier::ifft2(&spectrum).mapv(|v| v.re)
    }

    /// Build a two-channel phase-diversity setup with a known wavefront,
    /// returning (objects, constraints, patch, alpha_true).
    fn synthetic_problem(
        global: &GlobalCfg,
    ) -> (Vec<Object>, Constraints, PatchData, Vec<f64>) {
        let object_cfg = ObjectCfg {
            patch_size: PATCH_N as u16,
            pupil_pixels: PUPIL_N as u16,
            wavelength: 500e-9,
            save_flags: SaveFlags::ALPHA,
            ..Default::default()
        };
        // Focus channel plus a defocus-diversity channel.
        let channels = vec![
            make_channel(1, vec![]),
            make_channel(1, vec![0.0, 0.0, 1.2]),
        ];
        let mode_numbers = [2u16, 3, 4];
        let object =
            Object::init_processing(object_cfg, channels, global, &mode_numbers).unwrap();

        // Both frames see the same wavefront.
        let constraints = Constraints::frame_pairs(mode_numbers.len(), &[1, 1]).unwrap();

        // The common-tilt direction is flat in the metric (a shared tilt
        // trades exactly against an object shift), so the ground truth
        // keeps the tilts at zero.
        let alpha_true = vec![0.0, 0.0, 0.3];
        let scene = smooth_object(11);

        // Degrade the scene through each channel's OTF at alpha_true.
        let mut cubes = Vec::new();
        for ci in 0..2 {
            let probe = ObjectPatch {
                channels: vec![ChannelPatch {
                    cube: Array3::zeros((1, PATCH_N, PATCH_N)),
                    shift_y: 0,
                    shift_x: 0,
                    residual: PointF::default(),
                }],
            };
            let mut sub = object.make_subimages(&probe, 0).unwrap().remove(0);
            sub.phi_fixed = object_diversity(&object, ci);
            sub.apply_alpha(&alpha_true);
            let degraded = sub.convolve_image(&scene.view());
            let mut cube = Array3::zeros((1, PATCH_N, PATCH_N));
            cube.slice_mut(s![0, .., ..]).assign(&degraded.mapv(|v| v as f32));
            cubes.push(cube);
        }

        let mut patch = PatchData::new(
            1,
            shared::Point16::new(0, 0),
            shared::Point16::new((PATCH_N / 2) as u16, (PATCH_N / 2) as u16),
            shared::Region::new(0, PATCH_N as u16 - 1, 0, PATCH_N as u16 - 1),
        );
        patch.objects = vec![ObjectPatch {
            channels: cubes
                .into_iter()
                .map(|cube| ChannelPatch {
                    cube,
                    shift_y: 0,
                    shift_x: 0,
                    residual: PointF::default(),
                })
                .collect(),
        }];

        (vec![object], constraints, patch, alpha_true)
    }

    fn object_diversity(object: &Object, channel: usize) -> Option<Array2<f64>> {
        let cfg = &object.channels[channel].cfg;
        if cfg.diversity.iter().all(|&d| d == 0.0) {
            return None;
        }
        let n = object.pupil.n_pixels;
        let mut phi = Array2::zeros((n, n));
        for (k, &d) in cfg.diversity.iter().enumerate() {
            if d == 0.0 || k >= object.modes.len() {
                continue;
            }
            let mode = object.modes.surface(k);
            for &idx in &object.pupil.support {
                let (y, x) = (idx / n, idx % n);
                phi[[y, x]] += d * mode[[y, x]];
            }
        }
        Some(phi)
    }

    #[test]
    fn solver_recovers_known_wavefront() {
        let global = test_global(GradientMethod::Vogel, StepMethod::ConjugateGradient);
        let (objects, constraints, mut patch, alpha_true) = synthetic_problem(&global);
        let mut solver = Solver::new(&global, &objects, &constraints, &patch, None).unwrap();
        let summary = solver.run(&mut patch).unwrap();
        assert!(summary.iterations > 0);

        let result_alpha = patch.results[0].alpha.as_ref().expect("alpha requested");
        for frame in 0..2 {
            for (k, &truth) in alpha_true.iter().enumerate() {
                assert_relative_eq!(
                    result_alpha[[frame, k]] as f64,
                    truth,
                    epsilon = 1e-3,
                    max_relative = 1e-2
                );
            }
        }
    }

    #[test]
    fn difference_gradient_also_converges() {
        let global = test_global(GradientMethod::Difference, StepMethod::BfgsInverse);
        let (objects, constraints, mut patch, alpha_true) = synthetic_problem(&global);
        let mut solver = Solver::new(&global, &objects, &constraints, &patch, None).unwrap();
        solver.run(&mut patch).unwrap();
        let result_alpha = patch.results[0].alpha.as_ref().unwrap();
        for (k, &truth) in alpha_true.iter().enumerate() {
            assert_relative_eq!(
                result_alpha[[0, k]] as f64,
                truth,
                epsilon = 5e-3,
                max_relative = 5e-2
            );
        }
    }

    #[test]
    fn metric_decreases_from_start() {
        let global = test_global(GradientMethod::Vogel, StepMethod::SteepestDescent);
        let (objects, constraints, patch, _) = synthetic_problem(&global);
        let mut solver = Solver::new(&global, &objects, &constraints, &patch, None).unwrap();
        let f0 = solver.evaluate(&vec![0.0; constraints.n_free_parameters as usize]).unwrap();
        let mut patch = patch;
        let summary = solver.run(&mut patch).unwrap();
        assert!(summary.metric <= f0 + 1e-12);
    }

    #[test]
    fn recentring_absorbs_whole_pixel_tilts() {
        let global = test_global(GradientMethod::Vogel, StepMethod::ConjugateGradient);
        let object_cfg = ObjectCfg {
            patch_size: PATCH_N as u16,
            pupil_pixels: PUPIL_N as u16,
            wavelength: 500e-9,
            save_flags: SaveFlags::ALPHA,
            ..Default::default()
        };
        let object = Object::init_processing(
            object_cfg,
            vec![make_channel(1, vec![])],
            &global,
            &[2, 3, 4],
        )
        .unwrap();
        let objects = vec![object];
        let constraints = Constraints::frame_pairs(3, &[1]).unwrap();

        // One frame with a 4-pixel margin around the 16-pixel window.
        let mut rng = StdRng::seed_from_u64(21);
        let dist = Normal::new(120.0, 15.0).unwrap();
        let cube = Array3::from_shape_fn((1, 24, 24), |_| dist.sample(&mut rng) as f32);
        let mut patch = PatchData::new(
            1,
            shared::Point16::new(0, 0),
            shared::Point16::new(12, 12),
            shared::Region::new(0, 23, 0, 23),
        );
        patch.objects = vec![ObjectPatch {
            channels: vec![ChannelPatch {
                cube,
                shift_y: 0,
                shift_x: 0,
                residual: PointF::default(),
            }],
        }];

        let mut solver = Solver::new(&global, &objects, &constraints, &patch, None).unwrap();
        let ix = objects[0].modes.x_tilt_index.unwrap();
        let p2a = objects[0].pixels_to_alpha;

        // An effective tilt worth 1.6 pixels re-centres by 2 whole pixels
        // and leaves the fractional remainder in the offset.
        solver.subimages[0].alpha_offset[ix] = 1.6 * p2a;
        solver.recentre_windows();
        assert_eq!(solver.subimages[0].origin, (4, 6));
        assert_relative_eq!(
            solver.subimages[0].alpha_offset[ix] / p2a,
            -0.4,
            epsilon = 1e-9
        );

        // The delta-updated power sum matches a fresh accumulation over the
        // moved windows.
        let after = objects[0].calc_metric();
        objects[0].init_patch();
        for sub in &solver.subimages {
            objects[0].add_to_ft(&sub.ft);
        }
        assert_relative_eq!(after, objects[0].calc_metric(), max_relative = 1e-9);
    }

    #[test]
    fn cancellation_interrupts_the_run() {
        let global = test_global(GradientMethod::Vogel, StepMethod::ConjugateGradient);
        let (objects, constraints, mut patch, _) = synthetic_problem(&global);
        let token = Arc::new(AtomicBool::new(true));
        let mut solver =
            Solver::new(&global, &objects, &constraints, &patch, Some(token)).unwrap();
        assert!(matches!(
            solver.run(&mut patch),
            Err(MomfbdError::Cancelled)
        ));
    }

    #[test]
    fn mismatched_constraints_are_rejected() {
        let global = test_global(GradientMethod::Vogel, StepMethod::ConjugateGradient);
        let (objects, _, patch, _) = synthetic_problem(&global);
        let wrong = Constraints::frame_pairs(3, &[1, 1, 1]).unwrap();
        assert!(Solver::new(&global, &objects, &wrong, &patch, None).is_err());
    }
}
