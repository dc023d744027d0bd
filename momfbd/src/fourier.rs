//! Planar 2-D FFT helpers on top of `rustfft`.
//!
//! Spectra use the standard FFT layout: DC at index (0, 0), negative
//! frequencies wrapped onto the upper half of each axis. All the solver
//! quantities (image FTs, OTFs, the P/Q accumulators) share this layout.

use ndarray::Array2;
use once_cell::sync::Lazy;
use rustfft::{num_complex::Complex64, FftPlanner};
use std::sync::Mutex;

static PLANNER: Lazy<Mutex<FftPlanner<f64>>> = Lazy::new(|| Mutex::new(FftPlanner::new()));

fn transform_axis(data: &mut Array2<Complex64>, rows: bool, inverse: bool) {
    let len = if rows { data.ncols() } else { data.nrows() };
    let fft = {
        let mut planner = PLANNER.lock().expect("fft planner poisoned");
        if inverse {
            planner.plan_fft_inverse(len)
        } else {
            planner.plan_fft_forward(len)
        }
    };
    let mut scratch = vec![Complex64::default(); len];
    if rows {
        for mut row in data.rows_mut() {
            scratch.copy_from_slice(row.as_slice().expect("row-major array"));
            fft.process(&mut scratch);
            row.as_slice_mut()
                .expect("row-major array")
                .copy_from_slice(&scratch);
        }
    } else {
        let ncols = data.ncols();
        for c in 0..ncols {
            for (r, v) in scratch.iter_mut().enumerate() {
                *v = data[[r, c]];
            }
            fft.process(&mut scratch);
            for (r, &v) in scratch.iter().enumerate() {
                data[[r, c]] = v;
            }
        }
    }
}

/// Forward 2-D FFT, unnormalized.
pub fn fft2(input: &Array2<Complex64>) -> Array2<Complex64> {
    let mut out = input.clone();
    transform_axis(&mut out, true, false);
    transform_axis(&mut out, false, false);
    out
}

/// Inverse 2-D FFT, scaled by 1/(rows·cols) so `ifft2(fft2(x)) == x`.
pub fn ifft2(input: &Array2<Complex64>) -> Array2<Complex64> {
    let mut out = input.clone();
    transform_axis(&mut out, true, true);
    transform_axis(&mut out, false, true);
    let scale = 1.0 / (out.nrows() * out.ncols()) as f64;
    out.mapv_inplace(|v| v * scale);
    out
}

/// Forward FFT of a real image.
pub fn fft2_real(input: &ndarray::ArrayView2<'_, f64>) -> Array2<Complex64> {
    let complex = input.mapv(|v| Complex64::new(v, 0.0));
    fft2(&complex)
}

/// |X|² per element.
pub fn power(spectrum: &Array2<Complex64>) -> Array2<f64> {
    spectrum.mapv(|v| v.norm_sqr())
}

/// Index reversal modulo the grid: `out(f) = in(-f)`.
///
/// Turns the spectrum of `g(y)` into the spectrum of `g(-y)`, which is what
/// cross-correlations need when expressed through convolutions.
pub fn reversed(input: &Array2<Complex64>) -> Array2<Complex64> {
    let (rows, cols) = input.dim();
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        input[[(rows - r) % rows, (cols - c) % cols]]
    })
}

/// Circular auto-correlation via the FFT: `ifft2(|fft2(x)|²)`.
///
/// Zero lag lands at (0, 0). The result of a real-ish input is real up to
/// rounding; the imaginary part is kept so callers can assert on it.
pub fn autocorrelate(input: &Array2<Complex64>) -> Array2<Complex64> {
    let mut spectrum = fft2(input);
    spectrum.mapv_inplace(|v| Complex64::new(v.norm_sqr(), 0.0));
    ifft2(&spectrum)
}
