//! An object groups the channels observing one target at one wavelength and
//! owns the Fourier-domain accumulators that couple its frames.
//!
//! P, Q and the image-power sum are shared mutable state during a solver
//! step; they live behind one per-object mutex and are only touched through
//! the `add*` operations. Callers never see the raw buffers mid-update.

use crate::channel::Channel;
use crate::data::{ObjectPatch, ObjectResult};
use crate::error::MomfbdError;
use crate::fourier;
use crate::subimage::{SubImage, Q_FLOOR};
use ndarray::{s, Array2, Array3};
use optics::{get_modes, get_pupil, ModeInfo, ModeSet, Pupil};
use rustfft::num_complex::Complex64;
use shared::{GlobalCfg, ObjectCfg, PointF, RunFlags, SaveFlags};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const RAD_TO_ARCSEC: f64 = 180.0 * 3600.0 / std::f64::consts::PI;

/// The shared accumulators, all on the 2N×2N grid.
struct Accumulators {
    /// Σ conj(F)·OTF over the object's images.
    p: Array2<Complex64>,
    /// Σ |OTF|² plus the regularization floor.
    q: Array2<f64>,
    /// Σ |F|² over the object's images.
    ft_sum: Array2<f64>,
    /// Regularization feedback from the subimages.
    reg_gamma: f64,
}

/// One restoration target.
pub struct Object {
    /// Object configuration after defaulting.
    pub cfg: ObjectCfg,
    /// Metric weight of this object.
    pub weight: f64,
    /// The object's channels, calibrated.
    pub channels: Vec<Channel>,
    /// Shared pupil from the global cache.
    pub pupil: Arc<Pupil>,
    /// Shared mode basis from the global cache.
    pub modes: Arc<ModeSet>,
    /// Diffraction cutoff in frequency pixels.
    pub frequency_cutoff: f64,
    /// Conversion from image-pixel shifts to tilt coefficients.
    pub pixels_to_alpha: f64,
    /// Total images across channels.
    pub n_images: usize,
    /// Plane fitted to the stack average, patch-sized, for re-adding.
    pub fitted_plane: Option<Array2<f64>>,
    acc: Mutex<Accumulators>,
}

impl Object {
    /// Build the object: derive the pupil geometry from the telescope
    /// configuration, fetch pupil and modes from the caches, and size the
    /// accumulators.
    pub fn init_processing(
        cfg: ObjectCfg,
        channels: Vec<Channel>,
        global: &GlobalCfg,
        mode_numbers: &[u16],
    ) -> Result<Self, MomfbdError> {
        let patch_size = cfg.patch_size as usize;
        let pupil_pixels = cfg.pupil_pixels as usize;
        if patch_size == 0 || pupil_pixels == 0 {
            return Err(MomfbdError::config("object patch or pupil size is zero"));
        }

        let arcsec_per_pixel = channels
            .first()
            .map(|c| c.cfg.arcsec_per_pixel)
            .unwrap_or(0.0);
        let frequency_cutoff = frequency_cutoff(
            patch_size,
            arcsec_per_pixel,
            global.telescope_d,
            cfg.wavelength,
        )?;
        let pupil_radius = frequency_cutoff / 2.0;
        if pupil_radius >= pupil_pixels as f64 {
            return Err(MomfbdError::config(format!(
                "pupil radius {pupil_radius:.1} px exceeds the {pupil_pixels}-pixel pupil grid; \
                 increase PUPIL_POINTS or reduce NUM_POINTS"
            )));
        }

        let pupil = get_pupil(pupil_pixels, pupil_radius)?;
        let angle = channels
            .first()
            .map(|c| c.cfg.rotation_angle)
            .unwrap_or(0.0);
        let info = ModeInfo {
            basis: global.basis,
            kl_min: global.kl_min_mode,
            kl_max: global.kl_max_mode,
            cutoff: global.kl_cutoff,
            n_pixels: pupil_pixels,
            radius: pupil_radius,
            angle,
            mode_numbers: mode_numbers.to_vec(),
        };
        let modes = get_modes(&info, &pupil)?;

        let tilt_step = modes.x_tilt_step().or_else(|| modes.y_tilt_step());
        let otf_n = 2 * pupil_pixels;
        let pixels_to_alpha = match tilt_step {
            Some(step) if step.abs() > 0.0 => {
                2.0 * std::f64::consts::PI / (otf_n as f64 * step)
            }
            _ => 0.0,
        };

        let n_images = channels.iter().map(Channel::n_frames).sum();
        let weight = channels.first().map(|c| c.cfg.weight).unwrap_or(1.0).max(0.0);

        debug!(
            wavelength = cfg.wavelength,
            frequency_cutoff,
            pupil_radius,
            n_images,
            "object initialized"
        );

        Ok(Self {
            cfg,
            weight,
            channels,
            pupil,
            modes,
            frequency_cutoff,
            pixels_to_alpha,
            n_images,
            fitted_plane: None,
            acc: Mutex::new(Accumulators {
                p: Array2::from_elem((otf_n, otf_n), Complex64::default()),
                q: Array2::zeros((otf_n, otf_n)),
                ft_sum: Array2::zeros((otf_n, otf_n)),
                reg_gamma: 0.0,
            }),
        })
    }

    /// Reset the per-patch accumulators.
    pub fn init_patch(&self) {
        let mut acc = self.acc.lock().expect("object accumulator poisoned");
        acc.ft_sum.fill(0.0);
        acc.reg_gamma = 0.0;
    }

    /// Zero P and floor Q at the regularization level.
    pub fn init_pq(&self) {
        let mut acc = self.acc.lock().expect("object accumulator poisoned");
        acc.p.fill(Complex64::default());
        let gamma = acc.reg_gamma;
        acc.q.fill(gamma);
    }

    /// Feed a subimage's regularization estimate back into γ.
    pub fn add_reg_gamma(&self, rg: f64) {
        let mut acc = self.acc.lock().expect("object accumulator poisoned");
        acc.reg_gamma += 0.10 * rg / self.n_images.max(1) as f64;
    }

    /// Add |F|² of one image into the power sum.
    pub fn add_to_ft(&self, ft: &Array2<Complex64>) {
        let mut acc = self.acc.lock().expect("object accumulator poisoned");
        ndarray::Zip::from(&mut acc.ft_sum)
            .and(ft)
            .for_each(|s, f| *s += f.norm_sqr());
    }

    /// Replace one image's |F|² contribution after its cutout window moved
    /// and the FT was recomputed.
    pub fn add_diff_to_ft(&self, ft: &Array2<Complex64>, old_ft: &Array2<Complex64>) {
        let mut acc = self.acc.lock().expect("object accumulator poisoned");
        ndarray::Zip::from(&mut acc.ft_sum)
            .and(ft)
            .and(old_ft)
            .for_each(|s, f, o| *s += f.norm_sqr() - o.norm_sqr());
    }

    /// Add one image's P/Q contribution over the OTF support.
    pub fn add_to_pq(&self, ft: &Array2<Complex64>, otf: &Array2<Complex64>) {
        let mut acc = self.acc.lock().expect("object accumulator poisoned");
        let otf_n = acc.q.dim().0;
        for &idx in &self.pupil.otf_support {
            let (y, x) = (idx / otf_n, idx % otf_n);
            acc.q[[y, x]] += otf[[y, x]].norm_sqr();
            acc.p[[y, x]] += ft[[y, x]].conj() * otf[[y, x]];
        }
    }

    /// Replace one image's P/Q contribution with its updated OTF.
    pub fn add_diff_to_pq(
        &self,
        ft: &Array2<Complex64>,
        otf: &Array2<Complex64>,
        old_otf: &Array2<Complex64>,
    ) {
        let mut acc = self.acc.lock().expect("object accumulator poisoned");
        let otf_n = acc.q.dim().0;
        for &idx in &self.pupil.otf_support {
            let (y, x) = (idx / otf_n, idx % otf_n);
            acc.q[[y, x]] += otf[[y, x]].norm_sqr() - old_otf[[y, x]].norm_sqr();
            acc.p[[y, x]] += ft[[y, x]].conj() * (otf[[y, x]] - old_otf[[y, x]]);
        }
    }

    /// Current metric contribution of this object:
    /// weight · Σ (|F̂|² − |P|²/Q) / otfSize².
    pub fn calc_metric(&self) -> f64 {
        let acc = self.acc.lock().expect("object accumulator poisoned");
        let n = acc.q.len();
        let mut sum: f64 = acc.ft_sum.iter().sum();
        let otf_n = acc.q.dim().0;
        for &idx in &self.pupil.otf_support {
            let (y, x) = (idx / otf_n, idx % otf_n);
            let q = acc.q[[y, x]];
            if q > Q_FLOOR {
                sum -= acc.p[[y, x]].norm_sqr() / q;
            }
        }
        self.weight * sum / n as f64
    }

    /// Snapshot of (P, Q) for the gradient evaluators.
    pub fn pq_snapshot(&self) -> (Array2<Complex64>, Array2<f64>) {
        let acc = self.acc.lock().expect("object accumulator poisoned");
        (acc.p.clone(), acc.q.clone())
    }

    /// Fit a plane to the stack-average over the cutout and subtract it
    /// from every frame. The plane, trimmed to patch size, is re-added by
    /// [`Self::get_results`]. Guarded by the FIT_PLANE run flag.
    pub fn fit_avg_plane(
        &mut self,
        patch: &mut ObjectPatch,
        run_flags: RunFlags,
        max_local_shift: usize,
    ) {
        if !run_flags.contains(RunFlags::FIT_PLANE) {
            return;
        }
        let Some(first) = patch.channels.first() else {
            return;
        };
        let (_, rows, cols) = first.cube.dim();
        let mut average = Array2::<f64>::zeros((rows, cols));
        let mut count = 0usize;
        for channel in &patch.channels {
            if channel.cube.dim().1 != rows || channel.cube.dim().2 != cols {
                warn!("cutout size mismatch while fitting average plane");
                return;
            }
            for plane in channel.cube.outer_iter() {
                ndarray::Zip::from(&mut average)
                    .and(&plane)
                    .for_each(|a, &v| *a += v as f64);
                count += 1;
            }
        }
        if count == 0 {
            return;
        }
        average.mapv_inplace(|v| v / count as f64);

        let plane = fit_plane(&average);
        for channel in &mut patch.channels {
            for mut frame in channel.cube.outer_iter_mut() {
                ndarray::Zip::from(&mut frame)
                    .and(&plane)
                    .for_each(|v, &p| *v -= p as f32);
            }
        }

        // Store only the central patch-sized piece for re-adding.
        let patch_size = self.cfg.patch_size as usize;
        let m = max_local_shift.min((rows.saturating_sub(patch_size)) / 2);
        self.fitted_plane = Some(
            plane
                .slice(s![m..m + patch_size, m..m + patch_size])
                .to_owned(),
        );
        debug!("subtracted average plane before processing");
    }

    /// Build the per-frame state for one patch.
    ///
    /// Each subimage gets the full cutout block (its window starts centred
    /// and may re-centre during solving), the channel's diversity phase,
    /// and tilt offsets seeded from the residual fractional shifts.
    pub fn make_subimages(
        &self,
        patch: &ObjectPatch,
        first_index: usize,
    ) -> Result<Vec<SubImage>, MomfbdError> {
        let size = 2 * self.pupil.n_pixels;
        let mut subimages = Vec::new();
        let mut index = first_index;
        for (ci, channel_patch) in patch.channels.iter().enumerate() {
            let (n_frames, rows, cols) = channel_patch.cube.dim();
            if rows < size || cols < size {
                return Err(MomfbdError::Resource(format!(
                    "patch cutout ({rows}, {cols}) smaller than the {size}-pixel solver window"
                )));
            }
            let phi_fixed = self.diversity_phase(ci);
            for f in 0..n_frames {
                let block = channel_patch.cube.slice(s![f, .., ..]).mapv(|v| v as f64);
                let mut sub = SubImage::new(
                    index,
                    block,
                    Arc::clone(&self.pupil),
                    Arc::clone(&self.modes),
                    phi_fixed.clone(),
                );
                self.seed_tilt_offsets(&mut sub, channel_patch.residual);
                subimages.push(sub);
                index += 1;
            }
        }
        Ok(subimages)
    }

    fn seed_tilt_offsets(&self, sub: &mut SubImage, residual: PointF) {
        if let Some(ix) = self.modes.x_tilt_index {
            sub.alpha_offset[ix] = residual.x * self.pixels_to_alpha;
        }
        if let Some(iy) = self.modes.y_tilt_index {
            sub.alpha_offset[iy] = residual.y * self.pixels_to_alpha;
        }
    }

    /// The fixed diversity phase of a channel, when it declares one.
    fn diversity_phase(&self, channel_index: usize) -> Option<Array2<f64>> {
        let cfg = &self.channels.get(channel_index)?.cfg;
        if cfg.diversity.iter().all(|&d| d == 0.0) {
            return None;
        }
        let n = self.pupil.n_pixels;
        let mut phi = Array2::zeros((n, n));
        for (k, &d) in cfg.diversity.iter().enumerate() {
            if k >= self.modes.len() || d == 0.0 {
                continue;
            }
            let mode = self.modes.surface(k);
            for &idx in &self.pupil.support {
                let (y, x) = (idx / n, idx % n);
                phi[[y, x]] += d * mode[[y, x]];
            }
        }
        Some(phi)
    }

    /// Assemble the final products from the fitted subimages.
    pub fn get_results(
        &self,
        subimages: &[SubImage],
        run_flags: RunFlags,
    ) -> Result<ObjectResult, MomfbdError> {
        let otf_n = 2 * self.pupil.n_pixels;
        let mut avg_obj_ft = Array2::from_elem((otf_n, otf_n), Complex64::default());
        let mut denominator = Array2::<f64>::zeros((otf_n, otf_n));
        let mut avg_noise_variance = 0.0;
        for sub in subimages {
            sub.restore(&mut avg_obj_ft, &mut denominator);
            avg_noise_variance += sub.noise * sub.noise;
        }
        if subimages.is_empty() {
            return Err(MomfbdError::Numeric("no subimages to restore".into()));
        }
        avg_noise_variance /= subimages.len() as f64;
        if run_flags.contains(RunFlags::GLOBAL_NOISE) {
            let global = self.mean_noise();
            avg_noise_variance = global * global;
        }

        // Wiener-style division, zero where nothing contributed.
        ndarray::Zip::from(&mut avg_obj_ft)
            .and(&denominator)
            .for_each(|a, &d| {
                *a = if d > Q_FLOOR { *a / d } else { Complex64::default() };
            });

        if !run_flags.contains(RunFlags::NO_FILTER) {
            debug!(
                cutoff = 0.9 * self.frequency_cutoff,
                noise_variance = avg_noise_variance,
                "applying noise filter to restored object"
            );
            noise_filter(
                &mut avg_obj_ft,
                &denominator,
                avg_noise_variance,
                0.9 * self.frequency_cutoff,
            );
        }

        let mut img = fourier::ifft2(&avg_obj_ft).mapv(|v| v.re);
        if let Some(plane) = &self.fitted_plane {
            if plane.dim() == img.dim() {
                img += plane;
            } else {
                warn!("size mismatch when re-adding fitted plane");
            }
        }
        let img32 = img.mapv(|v| v as f32);

        let save = self.cfg.save_flags;
        let psf = self.collect_psf(subimages, save);
        let cobj = save.contains(SaveFlags::COBJ).then(|| {
            let mut cube = Array3::zeros((subimages.len(), otf_n, otf_n));
            for (i, sub) in subimages.iter().enumerate() {
                let convolved = sub.convolve_image(&img.view());
                cube.index_axis_mut(ndarray::Axis(0), i)
                    .assign(&convolved.mapv(|v| v as f32));
            }
            cube
        });
        let res = save.contains(SaveFlags::RESIDUAL).then(|| {
            let mut cube = Array3::zeros((subimages.len(), otf_n, otf_n));
            for (i, sub) in subimages.iter().enumerate() {
                let residual = match &cobj {
                    Some(cobj) => {
                        let convolved =
                            cobj.index_axis(ndarray::Axis(0), i).mapv(|v| v as f64);
                        sub.convolved_residual(&convolved.view())
                    }
                    None => sub.residual(&img.view()),
                };
                cube.index_axis_mut(ndarray::Axis(0), i)
                    .assign(&residual.mapv(|v| v as f32));
            }
            cube
        });
        let alpha = save.contains(SaveFlags::ALPHA).then(|| {
            let n_modes = self.modes.len();
            let mut out = Array2::zeros((subimages.len(), n_modes));
            let mut row = vec![0.0f64; n_modes];
            for (i, sub) in subimages.iter().enumerate() {
                sub.get_alphas(&mut row);
                for (k, &v) in row.iter().enumerate() {
                    out[[i, k]] = v as f32;
                }
            }
            out
        });
        let div = save.contains(SaveFlags::DIVERSITY).then(|| {
            let n = self.pupil.n_pixels;
            let mut cube = Array3::zeros((self.channels.len(), n, n));
            for (ci, _) in self.channels.iter().enumerate() {
                if let Some(phi) = self.diversity_phase(ci) {
                    cube.index_axis_mut(ndarray::Axis(0), ci)
                        .assign(&phi.mapv(|v| v as f32));
                }
            }
            cube
        });

        Ok(ObjectResult {
            img: img32,
            psf,
            cobj,
            res,
            alpha,
            div,
        })
    }

    fn collect_psf(&self, subimages: &[SubImage], save: SaveFlags) -> Option<Array3<f32>> {
        let otf_n = 2 * self.pupil.n_pixels;
        if save.contains(SaveFlags::PSF_AVG) {
            let mut acc = Array2::<f64>::zeros((otf_n, otf_n));
            for sub in subimages {
                sub.add_psf(&mut acc);
            }
            acc.mapv_inplace(|v| v / subimages.len().max(1) as f64);
            let mut cube = Array3::zeros((1, otf_n, otf_n));
            cube.index_axis_mut(ndarray::Axis(0), 0)
                .assign(&acc.mapv(|v| v as f32));
            Some(cube)
        } else if save.contains(SaveFlags::PSF) {
            let mut cube = Array3::zeros((subimages.len(), otf_n, otf_n));
            for (i, sub) in subimages.iter().enumerate() {
                cube.index_axis_mut(ndarray::Axis(0), i)
                    .assign(&sub.get_psf().mapv(|v| v as f32));
            }
            Some(cube)
        } else {
            None
        }
    }

    /// Mean of the per-frame noise across all channels (GLOBAL_NOISE).
    pub fn mean_noise(&self) -> f64 {
        let mut acc = 0.0;
        let mut count = 0usize;
        for channel in &self.channels {
            for &n in &channel.noise {
                acc += n;
                count += 1;
            }
        }
        if count == 0 {
            0.0
        } else {
            acc / count as f64
        }
    }
}

/// The diffraction cutoff nPixels / q with q = λ / (radians-per-pixel · D).
pub fn frequency_cutoff(
    n_pixels: usize,
    arcsec_per_pixel: f64,
    telescope_d: f64,
    wavelength: f64,
) -> Result<f64, MomfbdError> {
    if arcsec_per_pixel <= 0.0 || telescope_d <= 0.0 || wavelength <= 0.0 {
        return Err(MomfbdError::config(format!(
            "cannot derive frequency cutoff from arcsec/pix {arcsec_per_pixel}, \
             D {telescope_d}, λ {wavelength}"
        )));
    }
    let radians_per_pixel = arcsec_per_pixel / RAD_TO_ARCSEC;
    Ok(n_pixels as f64 * radians_per_pixel * telescope_d / wavelength)
}

/// Least-squares plane a·x + b·y + c over the full grid.
fn fit_plane(image: &Array2<f64>) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let cy = (rows as f64 - 1.0) / 2.0;
    let cx = (cols as f64 - 1.0) / 2.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    let mut sxz = 0.0;
    let mut syz = 0.0;
    let mut sz = 0.0;
    for y in 0..rows {
        for x in 0..cols {
            let dy = y as f64 - cy;
            let dx = x as f64 - cx;
            let z = image[[y, x]];
            sxx += dx * dx;
            syy += dy * dy;
            sxz += dx * z;
            syz += dy * z;
            sz += z;
        }
    }
    let n = (rows * cols) as f64;
    let a = if sxx > 0.0 { sxz / sxx } else { 0.0 };
    let b = if syy > 0.0 { syz / syy } else { 0.0 };
    let c = sz / n;
    Array2::from_shape_fn((rows, cols), |(y, x)| {
        a * (x as f64 - cx) + b * (y as f64 - cy) + c
    })
}

/// Noise-adaptive low-pass on the restored object FT.
///
/// Wiener attenuation from the per-bin SNR estimate, with a hard cutoff at
/// `cutoff` frequency pixels.
fn noise_filter(
    spectrum: &mut Array2<Complex64>,
    denominator: &Array2<f64>,
    noise_variance: f64,
    cutoff: f64,
) {
    let (rows, cols) = spectrum.dim();
    for y in 0..rows {
        for x in 0..cols {
            let fy = if y > rows / 2 { y as f64 - rows as f64 } else { y as f64 };
            let fx = if x > cols / 2 { x as f64 - cols as f64 } else { x as f64 };
            let r = (fy * fy + fx * fx).sqrt();
            if r > cutoff {
                spectrum[[y, x]] = Complex64::default();
                continue;
            }
            if noise_variance <= 0.0 {
                continue;
            }
            let d = denominator[[y, x]];
            if d <= Q_FLOOR {
                continue;
            }
            let signal = spectrum[[y, x]].norm_sqr();
            let noise = noise_variance / d;
            let gain = signal / (signal + noise);
            spectrum[[y, x]] *= gain;
        }
    }
}
