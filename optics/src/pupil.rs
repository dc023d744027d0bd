//! Telescope pupil mask on a square grid.
//!
//! The mask is either generated as a soft-edged disk or supplied by the
//! caller (loaded from a file outside the core) and rescaled to [0, 1].
//! Alongside the values the pupil records its support (pixel indices with
//! value above threshold), the placement of those pixels inside the 2N OTF
//! grid, and the OTF support: the non-zero set of the pupil
//! auto-correlation.

use crate::error::OpticsError;
use ndarray::Array2;

/// Support threshold for both the pupil mask and its auto-correlation.
pub const SUPPORT_THRESHOLD: f64 = 1e-9;

/// Subsamples per axis when integrating pixel coverage of the disk edge.
const EDGE_SAMPLES: usize = 16;

/// Pupil mask plus the index sets the solver iterates over.
#[derive(Debug, Clone)]
pub struct Pupil {
    /// Grid side N.
    pub n_pixels: usize,
    /// Disk radius in pixels; 0 for loaded pupils.
    pub radius: f64,
    /// Sum of mask values over the support.
    pub area: f64,
    /// Mask values in [0, 1], shape (N, N).
    pub values: Array2<f64>,
    /// Flat indices (row-major, N×N) where the mask exceeds the threshold.
    pub support: Vec<usize>,
    /// For each support pixel, its flat index inside the 2N×2N OTF grid,
    /// offset by (N/2, N/2).
    pub support_in_otf: Vec<(usize, usize)>,
    /// Flat indices (row-major, 2N×2N) where the pupil auto-correlation is
    /// non-zero.
    pub otf_support: Vec<usize>,
}

impl Pupil {
    /// Generate a soft-edged disk of `radius` pixels centred on the grid.
    ///
    /// Edge pixels carry their coverage fraction, integrated on an
    /// `EDGE_SAMPLES`² sub-grid, so the recorded area tracks the disk area.
    pub fn generate(n_pixels: usize, radius: f64) -> Result<Self, OpticsError> {
        if n_pixels == 0 || radius <= 0.0 {
            return Err(OpticsError::PupilGeometry(format!(
                "n_pixels = {n_pixels}, radius = {radius}"
            )));
        }
        if 2.0 * radius > n_pixels as f64 + 1.0 {
            return Err(OpticsError::PupilGeometry(format!(
                "disk of radius {radius} does not fit a {n_pixels}-pixel grid"
            )));
        }
        let centre = n_pixels as f64 / 2.0;
        let values = Array2::from_shape_fn((n_pixels, n_pixels), |(y, x)| {
            pixel_coverage(y as f64 + 0.5 - centre, x as f64 + 0.5 - centre, radius)
        });
        let mut pupil = Self {
            n_pixels,
            radius,
            area: 0.0,
            values,
            support: Vec::new(),
            support_in_otf: Vec::new(),
            otf_support: Vec::new(),
        };
        pupil.normalize();
        pupil.generate_support(SUPPORT_THRESHOLD);
        Ok(pupil)
    }

    /// Wrap caller-supplied mask data (a pupil loaded from file).
    ///
    /// The data must already match the requested grid; rescaling differently
    /// sized files happens in the I/O layer. Values are normalized to [0, 1].
    pub fn from_values(values: Array2<f64>, n_pixels: usize) -> Result<Self, OpticsError> {
        let (got_y, got_x) = values.dim();
        if got_y != n_pixels || got_x != n_pixels {
            return Err(OpticsError::PupilDimensions {
                got_y,
                got_x,
                expected: n_pixels,
            });
        }
        let mut pupil = Self {
            n_pixels,
            radius: 0.0,
            area: 0.0,
            values,
            support: Vec::new(),
            support_in_otf: Vec::new(),
            otf_support: Vec::new(),
        };
        pupil.normalize();
        pupil.generate_support(SUPPORT_THRESHOLD);
        Ok(pupil)
    }

    /// Rescale the mask to [0, 1].
    fn normalize(&mut self) {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &v in self.values.iter() {
            min = min.min(v);
            max = max.max(v);
        }
        if min == 0.0 && max == 1.0 {
            return;
        }
        let span = max - min;
        if span <= 0.0 {
            return;
        }
        self.values.mapv_inplace(|v| (v - min) / span);
    }

    /// Record the pupil support, its placement in the OTF grid, and the OTF
    /// support from the pupil auto-correlation.
    fn generate_support(&mut self, threshold: f64) {
        let n = self.n_pixels;
        let otf_n = 2 * n;

        self.support.clear();
        self.support_in_otf.clear();
        self.area = 0.0;
        for (idx, &v) in self.values.iter().enumerate() {
            if v > threshold {
                self.support.push(idx);
                let row = idx / n;
                let col = idx % n;
                let otf_idx = (row + n / 2) * otf_n + col + n / 2;
                self.support_in_otf.push((idx, otf_idx));
                self.area += v;
            }
        }

        // Auto-correlation support, directly over the support sets: index k
        // is non-zero iff two support pixels are separated by the lag k
        // encodes. Standard FFT layout, zero lag at index 0, negative lags
        // wrapped onto the top of the 2N grid.
        let mut hits = vec![false; otf_n * otf_n];
        for &a in &self.support {
            let (ay, ax) = (a / n, a % n);
            for &b in &self.support {
                let (by, bx) = (b / n, b % n);
                let row = (ay + otf_n - by) % otf_n;
                let col = (ax + otf_n - bx) % otf_n;
                hits[row * otf_n + col] = true;
            }
        }
        self.otf_support = hits
            .iter()
            .enumerate()
            .filter_map(|(i, &h)| h.then_some(i))
            .collect();
    }

    /// Number of pixels in the pupil support.
    pub fn support_count(&self) -> usize {
        self.support.len()
    }
}

/// Fraction of the unit pixel centred at (dy, dx) that lies inside the disk.
fn pixel_coverage(dy: f64, dx: f64, radius: f64) -> f64 {
    let d = (dy * dy + dx * dx).sqrt();
    // Fully inside / outside: no integration needed.
    if d <= radius - std::f64::consts::FRAC_1_SQRT_2 {
        return 1.0;
    }
    if d >= radius + std::f64::consts::FRAC_1_SQRT_2 {
        return 0.0;
    }
    let step = 1.0 / EDGE_SAMPLES as f64;
    let mut inside = 0usize;
    for sy in 0..EDGE_SAMPLES {
        let py = dy - 0.5 + (sy as f64 + 0.5) * step;
        for sx in 0..EDGE_SAMPLES {
            let px = dx - 0.5 + (sx as f64 + 0.5) * step;
            if px * px + py * py <= radius * radius {
                inside += 1;
            }
        }
    }
    inside as f64 / (EDGE_SAMPLES * EDGE_SAMPLES) as f64
}
