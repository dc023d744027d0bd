//! Mode-set construction and the descriptor-keyed caches.
//!
//! A [`ModeSet`] is a stack of wavefront-mode surfaces on the pupil grid,
//! normalized so that the power of each mode over the pupil equals the pupil
//! area. Generated sets are cached by descriptor: two requests with equal
//! [`ModeInfo`] return the same `Arc`.

use crate::error::OpticsError;
use crate::karhunen::KarhunenLoeve;
use crate::pupil::Pupil;
use crate::zernike;
use ndarray::{Array2, Array3};
use once_cell::sync::Lazy;
use shared::ModeBasis;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Everything that determines a generated mode set.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeInfo {
    /// Basis family.
    pub basis: ModeBasis,
    /// First Zernike entering a KL expansion.
    pub kl_min: u16,
    /// Last Zernike entering a KL expansion.
    pub kl_max: u16,
    /// KL singular-value cutoff.
    pub cutoff: f64,
    /// Grid side in pixels.
    pub n_pixels: usize,
    /// Pupil radius in pixels.
    pub radius: f64,
    /// Detector rotation angle, radians.
    pub angle: f64,
    /// Noll mode numbers to build, in order.
    pub mode_numbers: Vec<u16>,
}

/// Hashable stand-in for `ModeInfo`; float fields keyed by their bits.
#[derive(PartialEq, Eq, Hash)]
struct ModeKey {
    basis: u8,
    kl_min: u16,
    kl_max: u16,
    cutoff_bits: u64,
    n_pixels: usize,
    radius_bits: u64,
    angle_bits: u64,
    mode_numbers: Vec<u16>,
}

impl From<&ModeInfo> for ModeKey {
    fn from(info: &ModeInfo) -> Self {
        Self {
            basis: match info.basis {
                ModeBasis::Zernike => 0,
                ModeBasis::KarhunenLoeve => 1,
            },
            kl_min: info.kl_min,
            kl_max: info.kl_max,
            cutoff_bits: info.cutoff.to_bits(),
            n_pixels: info.n_pixels,
            radius_bits: info.radius.to_bits(),
            angle_bits: info.angle.to_bits(),
            mode_numbers: info.mode_numbers.clone(),
        }
    }
}

/// A stack of normalized wavefront modes over one pupil.
#[derive(Debug)]
pub struct ModeSet {
    /// The descriptor this set was built from.
    pub info: ModeInfo,
    /// Mode surfaces, shape (mode, y, x).
    pub modes: Array3<f64>,
    /// Noll numbers, aligned with the first axis of `modes`.
    pub mode_numbers: Vec<u16>,
    /// Position of the x-tilt in `mode_numbers`, when present.
    pub x_tilt_index: Option<usize>,
    /// Position of the y-tilt in `mode_numbers`, when present.
    pub y_tilt_index: Option<usize>,
}

impl ModeSet {
    /// Build the modes named by `info` and normalize them against `pupil`.
    pub fn generate(info: ModeInfo, pupil: &Pupil) -> Result<Self, OpticsError> {
        let n = info.n_pixels;
        if pupil.n_pixels != n {
            return Err(OpticsError::PupilDimensions {
                got_y: pupil.n_pixels,
                got_x: pupil.n_pixels,
                expected: n,
            });
        }

        let kl = match info.basis {
            ModeBasis::KarhunenLoeve => {
                Some(KarhunenLoeve::expand(info.kl_min, info.kl_max, info.cutoff)?)
            }
            ModeBasis::Zernike => None,
        };

        let mut modes = Array3::zeros((info.mode_numbers.len(), n, n));
        for (idx, &mode) in info.mode_numbers.iter().enumerate() {
            let surface = build_surface(&info, kl.as_ref(), mode)?;
            let normalized = normalize_against_pupil(surface, pupil, mode)?;
            modes.index_axis_mut(ndarray::Axis(0), idx).assign(&normalized);
        }

        let x_tilt_index = info.mode_numbers.iter().position(|&m| m == 2);
        let y_tilt_index = info.mode_numbers.iter().position(|&m| m == 3);

        Ok(Self {
            mode_numbers: info.mode_numbers.clone(),
            info,
            modes,
            x_tilt_index,
            y_tilt_index,
        })
    }

    /// Number of modes in the stack.
    pub fn len(&self) -> usize {
        self.mode_numbers.len()
    }

    /// True when the stack holds no modes.
    pub fn is_empty(&self) -> bool {
        self.mode_numbers.is_empty()
    }

    /// One mode surface.
    pub fn surface(&self, idx: usize) -> ndarray::ArrayView2<'_, f64> {
        self.modes.index_axis(ndarray::Axis(0), idx)
    }

    /// Per-pixel increment of the x-tilt mode through the grid centre.
    ///
    /// Feeds the pixels-to-alpha scale that converts residual image shifts
    /// into tilt coefficients.
    pub fn x_tilt_step(&self) -> Option<f64> {
        let idx = self.x_tilt_index?;
        let n = self.info.n_pixels;
        let m = self.surface(idx);
        Some(m[[n / 2, n / 2 + 1]] - m[[n / 2, n / 2]])
    }

    /// Per-pixel increment of the y-tilt mode through the grid centre.
    pub fn y_tilt_step(&self) -> Option<f64> {
        let idx = self.y_tilt_index?;
        let n = self.info.n_pixels;
        let m = self.surface(idx);
        Some(m[[n / 2 + 1, n / 2]] - m[[n / 2, n / 2]])
    }
}

/// Evaluate one mode surface, before pupil normalization.
fn build_surface(
    info: &ModeInfo,
    kl: Option<&KarhunenLoeve>,
    mode: u16,
) -> Result<Array2<f64>, OpticsError> {
    if mode < 2 {
        return Err(OpticsError::BadModeNumber(mode));
    }
    // Tilts stay Zernike in every basis.
    if mode == 2 || mode == 3 {
        return Ok(zernike::evaluate(mode, info.n_pixels, info.radius, info.angle));
    }
    match kl {
        None => Ok(zernike::evaluate(mode, info.n_pixels, info.radius, info.angle)),
        Some(kl) => {
            let rank = (mode - kl.kl_min) as usize;
            kl.evaluate(rank, info.n_pixels, info.radius, info.angle)
                .ok_or(OpticsError::BadModeNumber(mode))
        }
    }
}

/// Rescale so the mode's power over the pupil equals the pupil area.
fn normalize_against_pupil(
    mut surface: Array2<f64>,
    pupil: &Pupil,
    mode: u16,
) -> Result<Array2<f64>, OpticsError> {
    let flat = surface
        .as_slice()
        .expect("mode surfaces are freshly allocated and contiguous");
    let mut power = 0.0;
    for &idx in &pupil.support {
        let v = flat[idx];
        power += v * v * pupil.values.as_slice().expect("pupil values are contiguous")[idx];
    }
    if power <= 0.0 {
        return Err(OpticsError::DegenerateMode(mode));
    }
    let scale = (pupil.area / power).sqrt();
    surface.mapv_inplace(|v| v * scale);
    Ok(surface)
}

static MODE_CACHE: Lazy<Mutex<HashMap<ModeKey, Arc<ModeSet>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static PUPIL_CACHE: Lazy<Mutex<HashMap<(usize, u64), Arc<Pupil>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Fetch (or build) the mode set for `info`, normalized against `pupil`.
///
/// Insertion is idempotent by descriptor; concurrent misses collapse to a
/// single build under the cache mutex.
pub fn get_modes(info: &ModeInfo, pupil: &Pupil) -> Result<Arc<ModeSet>, OpticsError> {
    let key = ModeKey::from(info);
    let mut cache = MODE_CACHE.lock().expect("mode cache poisoned");
    if let Some(set) = cache.get(&key) {
        return Ok(Arc::clone(set));
    }
    debug!(
        n_modes = info.mode_numbers.len(),
        n_pixels = info.n_pixels,
        "building mode set"
    );
    let set = Arc::new(ModeSet::generate(info.clone(), pupil)?);
    cache.insert(key, Arc::clone(&set));
    Ok(set)
}

/// Fetch (or generate) the soft-edged disk pupil for a grid/radius pair.
pub fn get_pupil(n_pixels: usize, radius: f64) -> Result<Arc<Pupil>, OpticsError> {
    let key = (n_pixels, radius.to_bits());
    let mut cache = PUPIL_CACHE.lock().expect("pupil cache poisoned");
    if let Some(pupil) = cache.get(&key) {
        return Ok(Arc::clone(pupil));
    }
    let pupil = Arc::new(Pupil::generate(n_pixels, radius)?);
    cache.insert(key, Arc::clone(&pupil));
    Ok(pupil)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn zernike_info(modes: &[u16]) -> ModeInfo {
        ModeInfo {
            basis: ModeBasis::Zernike,
            kl_min: 2,
            kl_max: 40,
            cutoff: 1e-3,
            n_pixels: 32,
            radius: 14.0,
            angle: 0.0,
            mode_numbers: modes.to_vec(),
        }
    }

    fn mode_inner_product(set: &ModeSet, pupil: &Pupil, a: usize, b: usize) -> f64 {
        let ma = set.surface(a);
        let mb = set.surface(b);
        let mut acc = 0.0;
        for &idx in &pupil.support {
            let (y, x) = (idx / pupil.n_pixels, idx % pupil.n_pixels);
            acc += ma[[y, x]] * mb[[y, x]] * pupil.values[[y, x]];
        }
        acc
    }

    #[test]
    fn modes_normalize_to_pupil_area() {
        let pupil = Pupil::generate(32, 14.0).unwrap();
        let set = ModeSet::generate(zernike_info(&[2, 3, 4, 5, 6]), &pupil).unwrap();
        for k in 0..set.len() {
            assert_relative_eq!(
                mode_inner_product(&set, &pupil, k, k),
                pupil.area,
                max_relative = 1e-10
            );
        }
    }

    #[test]
    fn symmetry_distinct_modes_are_orthogonal() {
        let pupil = Pupil::generate(32, 14.0).unwrap();
        let set = ModeSet::generate(zernike_info(&[2, 3, 4, 5, 6]), &pupil).unwrap();
        // Pairs orthogonal by grid symmetry: tilt/tilt, tilt/defocus,
        // tilt/astigmatism.
        for (a, b) in [(0, 1), (0, 2), (1, 2), (0, 3), (1, 4)] {
            let cross = mode_inner_product(&set, &pupil, a, b);
            assert!(
                cross.abs() < 1e-10 * pupil.area,
                "modes {a},{b} coupled: {cross}"
            );
        }
    }

    #[test]
    fn tilt_indices_are_recorded() {
        let pupil = Pupil::generate(32, 14.0).unwrap();
        let set = ModeSet::generate(zernike_info(&[4, 2, 3]), &pupil).unwrap();
        assert_eq!(set.x_tilt_index, Some(1));
        assert_eq!(set.y_tilt_index, Some(2));

        let no_tilts = ModeSet::generate(zernike_info(&[4, 5, 6]), &pupil).unwrap();
        assert_eq!(no_tilts.x_tilt_index, None);
        assert_eq!(no_tilts.y_tilt_step(), None);
    }

    #[test]
    fn tilt_steps_are_symmetric_across_axes() {
        let pupil = Pupil::generate(32, 14.0).unwrap();
        let set = ModeSet::generate(zernike_info(&[2, 3]), &pupil).unwrap();
        let sx = set.x_tilt_step().unwrap();
        let sy = set.y_tilt_step().unwrap();
        assert_relative_eq!(sx, sy, max_relative = 1e-9);
        assert!(sx > 0.0);
    }

    #[test]
    fn kl_set_uses_zernike_tilts() {
        let pupil = Pupil::generate(32, 14.0).unwrap();
        let kl_info = ModeInfo {
            basis: ModeBasis::KarhunenLoeve,
            mode_numbers: vec![2, 3, 4, 5],
            ..zernike_info(&[])
        };
        let kl_set = ModeSet::generate(kl_info, &pupil).unwrap();
        let z_set = ModeSet::generate(zernike_info(&[2, 3]), &pupil).unwrap();
        for (y, x) in [(10, 12), (16, 16), (20, 7)] {
            assert_relative_eq!(
                kl_set.surface(0)[[y, x]],
                z_set.surface(0)[[y, x]],
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn cache_returns_the_same_arc() {
        let pupil = get_pupil(32, 14.0).unwrap();
        let info = zernike_info(&[2, 3, 4]);
        let first = get_modes(&info, &pupil).unwrap();
        let second = get_modes(&info, &pupil).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = get_modes(&zernike_info(&[2, 3, 5]), &pupil).unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn pupil_cache_is_idempotent() {
        let a = get_pupil(16, 6.0).unwrap();
        let b = get_pupil(16, 6.0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn piston_is_rejected() {
        let pupil = Pupil::generate(32, 14.0).unwrap();
        assert!(matches!(
            ModeSet::generate(zernike_info(&[1, 2]), &pupil),
            Err(OpticsError::BadModeNumber(1))
        ));
    }
}
