//! Per-frame state during optimization.
//!
//! A `SubImage` owns one frame's cutout inside a patch: its Fourier
//! transform, the current phase estimate φ, the OTF derived from it, the
//! per-image noise estimate, and the gradient machinery. φ lives on the
//! pupil grid and is only meaningful on the pupil support; the complex
//! pupil function is placed at offset (N/2, N/2) on the 2N×2N grid so the
//! PSF lands with the correct shift after the FFT.

use crate::fourier;
use ndarray::{Array2, ArrayView2};
use optics::{ModeSet, Pupil};
use rustfft::num_complex::Complex64;
use std::sync::Arc;

/// Guard against division by a vanishing Q bin.
pub const Q_FLOOR: f64 = 1e-12;

/// One frame's optimizer state.
pub struct SubImage {
    /// Global image index (across objects and channels).
    pub index: usize,
    /// Pupil shared by the object.
    pub pupil: Arc<Pupil>,
    /// Mode basis shared by the object.
    pub modes: Arc<ModeSet>,
    /// Fixed phase offset of this frame's channel (phase diversity).
    pub phi_fixed: Option<Array2<f64>>,
    /// The full cutout block, patch plus the local-shift margin.
    pub cutout: Array2<f64>,
    /// Origin of the current window inside the cutout.
    pub origin: (usize, usize),
    /// The current window, side 2N.
    pub img: Array2<f64>,
    /// FT of the current window.
    pub ft: Array2<Complex64>,
    /// High-frequency noise estimate of the current window.
    pub noise: f64,
    /// Current phase on the pupil grid (N×N); valid on the support only.
    pub phi: Array2<f64>,
    /// Current OTF on the 2N grid.
    pub otf: Array2<Complex64>,
    /// OTF before the most recent `apply_alpha`, for delta accumulation.
    pub old_otf: Array2<Complex64>,
    /// Current coefficients, one per mode in `modes`.
    pub alpha: Vec<f64>,
    /// Fixed coefficient offsets (residual tilt shifts from alignment).
    pub alpha_offset: Vec<f64>,
}

impl SubImage {
    /// Record a cutout block and derive the FT and noise of its central
    /// window.
    ///
    /// `cutout` must be at least (2N, 2N) where N is the pupil grid side;
    /// any margin beyond that is room for [`Self::shift_window`].
    pub fn new(
        index: usize,
        cutout: Array2<f64>,
        pupil: Arc<Pupil>,
        modes: Arc<ModeSet>,
        phi_fixed: Option<Array2<f64>>,
    ) -> Self {
        let n = pupil.n_pixels;
        let otf_n = 2 * n;
        let (rows, cols) = cutout.dim();
        debug_assert!(rows >= otf_n && cols >= otf_n);
        let origin = ((rows - otf_n) / 2, (cols - otf_n) / 2);
        let img = cutout
            .slice(ndarray::s![
                origin.0..origin.0 + otf_n,
                origin.1..origin.1 + otf_n
            ])
            .to_owned();
        let ft = fourier::fft2_real(&img.view());
        let noise = noise_estimate(&ft);
        let n_modes = modes.len();
        Self {
            index,
            pupil,
            modes,
            phi_fixed,
            cutout,
            origin,
            img,
            ft,
            noise,
            phi: Array2::zeros((n, n)),
            otf: Array2::zeros((otf_n, otf_n)),
            old_otf: Array2::zeros((otf_n, otf_n)),
            alpha: vec![0.0; n_modes],
            alpha_offset: vec![0.0; n_modes],
        }
    }

    /// Slide the window inside the cutout and recompute FT and noise.
    ///
    /// The requested shift is clamped to the cutout margin. Returns the
    /// applied (dy, dx) and the previous FT, so the caller can feed the
    /// image-power delta into the object accumulator; `None` when the
    /// window did not move.
    pub fn shift_window(&mut self, dy: i32, dx: i32) -> Option<(i32, i32, Array2<Complex64>)> {
        let otf_n = 2 * self.pupil.n_pixels;
        let (rows, cols) = self.cutout.dim();
        let clamp = |origin: usize, delta: i32, limit: usize| -> usize {
            (origin as i64 + delta as i64).clamp(0, limit as i64) as usize
        };
        let new_origin = (
            clamp(self.origin.0, dy, rows - otf_n),
            clamp(self.origin.1, dx, cols - otf_n),
        );
        if new_origin == self.origin {
            return None;
        }
        let applied = (
            new_origin.0 as i32 - self.origin.0 as i32,
            new_origin.1 as i32 - self.origin.1 as i32,
        );
        self.origin = new_origin;
        self.img = self
            .cutout
            .slice(ndarray::s![
                new_origin.0..new_origin.0 + otf_n,
                new_origin.1..new_origin.1 + otf_n
            ])
            .to_owned();
        let old_ft = std::mem::replace(&mut self.ft, fourier::fft2_real(&self.img.view()));
        self.noise = noise_estimate(&self.ft);
        Some((applied.0, applied.1, old_ft))
    }

    /// Rebuild φ and the OTF from mode coefficients.
    ///
    /// The previous OTF is kept for [`Self::otf_delta`]. The effective
    /// coefficients are `alpha + alpha_offset`.
    pub fn apply_alpha(&mut self, alpha: &[f64]) {
        debug_assert_eq!(alpha.len(), self.modes.len());
        self.alpha.copy_from_slice(alpha);
        std::mem::swap(&mut self.otf, &mut self.old_otf);

        let n = self.pupil.n_pixels;
        self.phi.fill(0.0);
        if let Some(fixed) = &self.phi_fixed {
            self.phi.assign(fixed);
        }
        for (k, &a) in alpha.iter().enumerate() {
            let a = a + self.alpha_offset[k];
            if a == 0.0 {
                continue;
            }
            let mode = self.modes.surface(k);
            for &idx in &self.pupil.support {
                let (y, x) = (idx / n, idx % n);
                self.phi[[y, x]] += a * mode[[y, x]];
            }
        }
        self.otf = self.compute_otf(&self.phi);
    }

    /// OTF of an arbitrary phase, without touching stored state.
    pub fn compute_otf(&self, phi: &Array2<f64>) -> Array2<Complex64> {
        let psi = self.pupil_function(phi);
        let mut otf = fourier::autocorrelate(&psi);
        let scale = 1.0 / self.pupil.area;
        otf.mapv_inplace(|v| v * scale);
        otf
    }

    /// Complex pupil function `pupil · e^{iφ}` placed on the 2N grid.
    fn pupil_function(&self, phi: &Array2<f64>) -> Array2<Complex64> {
        let n = self.pupil.n_pixels;
        let otf_n = 2 * n;
        let mut psi = Array2::from_elem((otf_n, otf_n), Complex64::default());
        let pupil_flat = self
            .pupil
            .values
            .as_slice()
            .expect("pupil values are contiguous");
        for &(idx, otf_idx) in &self.pupil.support_in_otf {
            let (y, x) = (idx / n, idx % n);
            let amplitude = pupil_flat[idx];
            let (oy, ox) = (otf_idx / otf_n, otf_idx % otf_n);
            psi[[oy, ox]] = Complex64::from_polar(amplitude, phi[[y, x]]);
        }
        psi
    }

    /// (old, new) OTF pair since the last `apply_alpha`.
    pub fn otf_delta(&self) -> (&Array2<Complex64>, &Array2<Complex64>) {
        (&self.old_otf, &self.otf)
    }

    /// Copy the effective coefficients out.
    pub fn get_alphas(&self, out: &mut [f64]) {
        for (o, (&a, &off)) in out.iter_mut().zip(self.alpha.iter().zip(&self.alpha_offset)) {
            *o = a + off;
        }
    }

    /// Accumulate this image into the object estimate: numerator
    /// `conj(OTF)·F` and denominator `|OTF|²`.
    pub fn restore(&self, avg_obj_ft: &mut Array2<Complex64>, denominator: &mut Array2<f64>) {
        for ((acc, d), (s, f)) in avg_obj_ft
            .iter_mut()
            .zip(denominator.iter_mut())
            .zip(self.otf.iter().zip(self.ft.iter()))
        {
            *acc += s.conj() * f;
            *d += s.norm_sqr();
        }
    }

    /// PSF of the current OTF, real part of the inverse transform.
    pub fn get_psf(&self) -> Array2<f64> {
        fourier::ifft2(&self.otf).mapv(|v| v.re)
    }

    /// Add this image's PSF into an accumulator.
    pub fn add_psf(&self, acc: &mut Array2<f64>) {
        let psf = self.get_psf();
        *acc += &psf;
    }

    /// Convolve a restored object image with this frame's PSF.
    pub fn convolve_image(&self, object: &ArrayView2<'_, f64>) -> Array2<f64> {
        let obj_ft = fourier::fft2_real(object);
        let product = ndarray::Zip::from(&obj_ft)
            .and(&self.otf)
            .map_collect(|&o, &s| o * s);
        fourier::ifft2(&product).mapv(|v| v.re)
    }

    /// Difference between the frame and the restored object seen through
    /// this frame's OTF.
    pub fn residual(&self, object: &ArrayView2<'_, f64>) -> Array2<f64> {
        let convolved = self.convolve_image(object);
        &self.img - &convolved
    }

    /// Residual against an already-convolved object image.
    pub fn convolved_residual(&self, convolved: &ArrayView2<'_, f64>) -> Array2<f64> {
        &self.img - convolved
    }

    /// Closed-form (Vogel) gradient of the metric w.r.t. this image's
    /// coefficients, added into `out` (one slot per mode).
    ///
    /// `p` and `q` are the object accumulators including this image's
    /// current OTF; `scale` carries the object weight over the grid size.
    pub fn gradient_vogel(&self, p: &Array2<Complex64>, q: &Array2<f64>, scale: f64, out: &mut [f64]) {
        let n = self.pupil.n_pixels;
        let otf_n = 2 * n;

        // g(k) = ∂f/∂S(k) for this image's OTF S, from
        // f = Σ (|F̂|² − |P|²/Q):
        //   g = −( conj(P)·conj(F)/Q − |P|²·conj(S)/Q² )
        let mut g = Array2::from_elem((otf_n, otf_n), Complex64::default());
        for &idx in &self.pupil.otf_support {
            let (y, x) = (idx / otf_n, idx % otf_n);
            let qv = q[[y, x]].max(Q_FLOOR);
            let pv = p[[y, x]];
            let fv = self.ft[[y, x]];
            let sv = self.otf[[y, x]];
            g[[y, x]] = -(pv.conj() * fv.conj() / qv - pv.norm_sqr() * sv.conj() / (qv * qv));
        }

        let psi = self.pupil_function(&self.phi);
        let psi_conj = psi.mapv(|v| v.conj());

        // A1 = g ∗ conj(ψ);  B1(x) = Σ_k g(k) ψ(x+k) = ψ ∗ g(−·).
        let g_hat = fourier::fft2(&g);
        let a1 = fourier::ifft2(&(&g_hat * &fourier::fft2(&psi_conj)));
        let b1 = fourier::ifft2(&(&fourier::reversed(&g_hat) * &fourier::fft2(&psi)));

        // d f / d φ(y) = −2 Im[ψ A1 − conj(ψ) B1]; chain through
        // φ = Σ αk mk and the OTF normalization.
        let kernel_scale = scale / self.pupil.area;
        for &(idx, otf_idx) in &self.pupil.support_in_otf {
            let (py, px) = (idx / n, idx % n);
            let (oy, ox) = (otf_idx / otf_n, otf_idx % otf_n);
            let d = -2.0
                * (psi[[oy, ox]] * a1[[oy, ox]] - psi_conj[[oy, ox]] * b1[[oy, ox]]).im
                * kernel_scale;
            for (k, slot) in out.iter_mut().enumerate() {
                *slot += d * self.modes.surface(k)[[py, px]];
            }
        }
    }

    /// Finite-difference gradient for one mode: the metric change from
    /// perturbing αk by `step`, with only this image's OTF replaced inside
    /// the object accumulators.
    pub fn metric_delta_for_mode(
        &self,
        k: usize,
        step: f64,
        p: &Array2<Complex64>,
        q: &Array2<f64>,
    ) -> f64 {
        let mut phi = self.phi.clone();
        let n = self.pupil.n_pixels;
        let mode = self.modes.surface(k);
        for &idx in &self.pupil.support {
            let (y, x) = (idx / n, idx % n);
            phi[[y, x]] += step * mode[[y, x]];
        }
        let new_otf = self.compute_otf(&phi);

        let otf_n = 2 * n;
        let mut delta = 0.0;
        for &idx in &self.pupil.otf_support {
            let (y, x) = (idx / otf_n, idx % otf_n);
            let f = self.ft[[y, x]];
            let s_old = self.otf[[y, x]];
            let s_new = new_otf[[y, x]];
            let p_new = p[[y, x]] + f.conj() * (s_new - s_old);
            let q_new = (q[[y, x]] + s_new.norm_sqr() - s_old.norm_sqr()).max(Q_FLOOR);
            let q_old = q[[y, x]].max(Q_FLOOR);
            delta += p[[y, x]].norm_sqr() / q_old - p_new.norm_sqr() / q_new;
        }
        delta
    }
}

/// Noise from the high-frequency annulus of the power spectrum: radii in
/// (N/6, N/2] of the centred spectrum, RMS per pixel.
fn noise_estimate(ft: &Array2<Complex64>) -> f64 {
    let (rows, cols) = ft.dim();
    let n = rows;
    let mask = n as f64 / 6.0;
    let limit = ((n * n) as f64 / 4.0).sqrt();
    let mut acc = 0.0;
    let mut count = 0usize;
    for y in 0..rows {
        for x in 0..cols {
            // Signed frequency coordinates.
            let fy = if y > rows / 2 { y as f64 - rows as f64 } else { y as f64 };
            let fx = if x > cols / 2 { x as f64 - cols as f64 } else { x as f64 };
            let r = (fy * fy + fx * fx).sqrt();
            if r > mask && r <= limit {
                acc += ft[[y, x]].norm_sqr();
                count += 1;
            }
        }
    }
    if count == 0 {
        return 0.0;
    }
    (acc / count as f64).sqrt() / (rows * cols) as f64 * (rows as f64 * cols as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use optics::{ModeInfo, Pupil};
    use rand::prelude::*;
    use rand_distr::Normal;
    use shared::ModeBasis;

    fn test_setup(n: usize) -> (Arc<Pupil>, Arc<ModeSet>) {
        let radius = n as f64 * 0.45;
        let pupil = Arc::new(Pupil::generate(n, radius).unwrap());
        let info = ModeInfo {
            basis: ModeBasis::Zernike,
            kl_min: 2,
            kl_max: 40,
            cutoff: 0.0,
            n_pixels: n,
            radius,
            angle: 0.0,
            mode_numbers: vec![2, 3, 4],
        };
        let modes = Arc::new(ModeSet::generate(info, &pupil).unwrap());
        (pupil, modes)
    }

    fn random_image(side: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Normal::new(100.0, 12.0).unwrap();
        Array2::from_shape_fn((side, side), |_| dist.sample(&mut rng))
    }

    #[test]
    fn zero_alpha_gives_diffraction_limited_otf() {
        let (pupil, modes) = test_setup(16);
        let mut sub = SubImage::new(0, random_image(32, 1), pupil.clone(), modes.clone(), None);
        sub.apply_alpha(&[0.0, 0.0, 0.0]);
        // Zero phase: OTF peak at zero lag equals pupil power / area.
        let peak = sub.otf[[0, 0]].re;
        let power: f64 = pupil
            .support
            .iter()
            .map(|&i| {
                let v = pupil.values.as_slice().unwrap()[i];
                v * v
            })
            .sum();
        assert_relative_eq!(peak, power / pupil.area, epsilon = 1e-9);
        assert_relative_eq!(sub.otf[[0, 0]].im, 0.0, epsilon = 1e-12);
        // And every other bin is no larger.
        for v in sub.otf.iter() {
            assert!(v.norm() <= peak + 1e-9);
        }
    }

    #[test]
    fn otf_support_bounds_the_numerical_otf() {
        let (pupil, modes) = test_setup(16);
        let mut sub = SubImage::new(0, random_image(32, 2), pupil.clone(), modes, None);
        sub.apply_alpha(&[0.4, -0.2, 0.1]);
        let otf_n = 2 * pupil.n_pixels;
        let support: std::collections::HashSet<usize> =
            pupil.otf_support.iter().copied().collect();
        for (idx, v) in sub.otf.iter().enumerate() {
            if !support.contains(&idx) {
                assert!(
                    v.norm() < 1e-9,
                    "OTF leaked outside support at {} ({},{})",
                    idx,
                    idx / otf_n,
                    idx % otf_n
                );
            }
        }
    }

    #[test]
    fn phi_follows_alpha_on_the_support() {
        let (pupil, modes) = test_setup(16);
        let mut sub = SubImage::new(0, random_image(32, 3), pupil.clone(), modes.clone(), None);
        sub.apply_alpha(&[1.0, 0.0, 0.0]);
        let n = pupil.n_pixels;
        let tilt = modes.surface(0);
        for &idx in pupil.support.iter().take(20) {
            let (y, x) = (idx / n, idx % n);
            assert_relative_eq!(sub.phi[[y, x]], tilt[[y, x]], epsilon = 1e-12);
        }
    }

    #[test]
    fn alpha_offset_shifts_effective_coefficients() {
        let (pupil, modes) = test_setup(16);
        let mut sub = SubImage::new(0, random_image(32, 4), pupil, modes, None);
        sub.alpha_offset[0] = 0.25;
        sub.apply_alpha(&[0.5, 0.0, 0.0]);
        let mut out = vec![0.0; 3];
        sub.get_alphas(&mut out);
        assert_relative_eq!(out[0], 0.75, epsilon = 1e-12);
    }

    #[test]
    fn shift_window_slides_and_recomputes_ft() {
        let (pupil, modes) = test_setup(16);
        let cutout = Array2::from_shape_fn((40, 40), |(y, x)| (y * 40 + x) as f64);
        let mut sub = SubImage::new(0, cutout.clone(), pupil, modes, None);
        assert_eq!(sub.origin, (4, 4));
        assert_relative_eq!(sub.img[[0, 0]], cutout[[4, 4]], epsilon = 1e-12);

        let (dy, dx, old_ft) = sub.shift_window(1, -2).expect("window moved");
        assert_eq!((dy, dx), (1, -2));
        assert_eq!(sub.origin, (5, 2));
        assert_relative_eq!(sub.img[[0, 0]], cutout[[5, 2]], epsilon = 1e-12);
        // The FT followed the new window.
        assert!((sub.ft[[0, 0]] - old_ft[[0, 0]]).norm() > 1e-9);
        let expected: f64 = sub.img.iter().sum();
        assert_relative_eq!(sub.ft[[0, 0]].re, expected, max_relative = 1e-10);
    }

    #[test]
    fn shift_window_clamps_to_the_margin() {
        let (pupil, modes) = test_setup(16);
        let mut sub = SubImage::new(0, random_image(40, 9), pupil, modes, None);
        let (dy, dx, _) = sub.shift_window(-100, 100).expect("window moved");
        assert_eq!((dy, dx), (-4, 4));
        assert_eq!(sub.origin, (0, 8));
        // Pinned against the margin, a further push does nothing.
        assert!(sub.shift_window(-1, 1).is_none());
    }

    #[test]
    fn shift_window_without_margin_is_a_noop() {
        let (pupil, modes) = test_setup(16);
        let mut sub = SubImage::new(0, random_image(32, 10), pupil, modes, None);
        assert!(sub.shift_window(2, 2).is_none());
        assert_eq!(sub.origin, (0, 0));
    }

    #[test]
    fn vogel_gradient_matches_finite_differences() {
        let (pupil, modes) = test_setup(16);
        // Synthesize a frame through a known OTF so P and Q are non-trivial.
        let mut truth = SubImage::new(0, random_image(32, 5), pupil.clone(), modes.clone(), None);
        truth.apply_alpha(&[0.3, -0.15, 0.2]);
        let object = random_image(32, 6);
        let degraded = truth.convolve_image(&object.view());

        let mut sub = SubImage::new(0, degraded, pupil.clone(), modes.clone(), None);
        sub.apply_alpha(&[0.05, 0.02, -0.04]);

        // Single-image accumulators.
        let otf_n = 2 * pupil.n_pixels;
        let mut p = Array2::from_elem((otf_n, otf_n), Complex64::default());
        let mut q = Array2::zeros((otf_n, otf_n));
        for ((pv, qv), (s, f)) in p
            .iter_mut()
            .zip(q.iter_mut())
            .zip(sub.otf.iter().zip(sub.ft.iter()))
        {
            *pv += f.conj() * s;
            *qv += s.norm_sqr();
        }

        let mut analytic = vec![0.0; 3];
        sub.gradient_vogel(&p, &q, 1.0, &mut analytic);

        for k in 0..3 {
            let h = 1e-5;
            let plus = sub.metric_delta_for_mode(k, h, &p, &q);
            let minus = sub.metric_delta_for_mode(k, -h, &p, &q);
            let numeric = (plus - minus) / (2.0 * h);
            assert_relative_eq!(analytic[k], numeric, max_relative = 1e-3, epsilon = 1e-8);
        }
    }

    #[test]
    fn restore_accumulates_wiener_terms() {
        let (pupil, modes) = test_setup(16);
        let mut sub = SubImage::new(0, random_image(32, 7), pupil.clone(), modes, None);
        sub.apply_alpha(&[0.0, 0.0, 0.0]);
        let otf_n = 2 * pupil.n_pixels;
        let mut num = Array2::from_elem((otf_n, otf_n), Complex64::default());
        let mut den = Array2::zeros((otf_n, otf_n));
        sub.restore(&mut num, &mut den);
        assert_relative_eq!(
            num[[0, 0]].re,
            (sub.otf[[0, 0]].conj() * sub.ft[[0, 0]]).re,
            epsilon = 1e-9
        );
        assert!(den[[0, 0]] > 0.0);
    }

    #[test]
    fn noise_estimate_scales_with_noise_amplitude() {
        let quiet = SubImage::new(
            0,
            random_image(32, 8).mapv(|v| v * 0.1),
            test_setup(16).0,
            test_setup(16).1,
            None,
        );
        let loud = SubImage::new(
            0,
            random_image(32, 8),
            test_setup(16).0,
            test_setup(16).1,
            None,
        );
        assert!(loud.noise > quiet.noise);
    }
}
