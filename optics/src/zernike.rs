//! Zernike polynomials with Noll ordering.
//!
//! Mode numbers follow Noll (1976): 1 is piston, 2/3 are the x/y tilts,
//! 4 is defocus. Even numbers take the cosine azimuthal factor, odd numbers
//! the sine. Radial coordinates are normalized to the pupil radius.

use ndarray::Array2;

/// Radial order n and signed azimuthal frequency m for a Noll mode number.
///
/// Positive m means the cosine variant, negative the sine variant, zero a
/// purely radial mode.
pub fn noll_to_nm(mode: u16) -> (u32, i32) {
    debug_assert!(mode >= 1);
    let mut n = 0u32;
    let mut j = mode as u32 - 1;
    while j > n {
        n += 1;
        j -= n;
    }
    let m_abs = if n % 2 == 0 {
        2 * ((j + 1) / 2)
    } else {
        2 * (j / 2) + 1
    };
    let m = if mode % 2 == 0 {
        m_abs as i32
    } else {
        -(m_abs as i32)
    };
    (n, m)
}

/// Radial polynomial R_n^m(rho) for rho in [0, 1].
fn radial(n: u32, m_abs: u32, rho: f64) -> f64 {
    let half = ((n - m_abs) / 2) as i64;
    let mut sum = 0.0;
    for k in 0..=half {
        let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
        let num = factorial(n as i64 - k);
        let den = factorial(k)
            * factorial((n as i64 + m_abs as i64) / 2 - k)
            * factorial((n as i64 - m_abs as i64) / 2 - k);
        sum += sign * num / den * rho.powi(n as i32 - 2 * k as i32);
    }
    sum
}

fn factorial(k: i64) -> f64 {
    (2..=k).map(|v| v as f64).product::<f64>().max(1.0)
}

/// Evaluate Noll mode `mode` on an `n_pixels` grid with the given pupil
/// radius in pixels.
///
/// Carries the Noll normalization factor; the caller renormalizes against
/// the actual (soft-edged) pupil afterwards. Values outside the unit radius
/// extrapolate smoothly, which keeps the soft pupil edge well-behaved.
pub fn evaluate(mode: u16, n_pixels: usize, radius: f64, angle: f64) -> Array2<f64> {
    let (n, m) = noll_to_nm(mode);
    let m_abs = m.unsigned_abs();
    let norm = if m == 0 {
        ((n + 1) as f64).sqrt()
    } else {
        (2.0 * (n + 1) as f64).sqrt()
    };
    let centre = n_pixels as f64 / 2.0;
    Array2::from_shape_fn((n_pixels, n_pixels), |(y, x)| {
        let dy = y as f64 + 0.5 - centre;
        let dx = x as f64 + 0.5 - centre;
        let rho = (dy * dy + dx * dx).sqrt() / radius;
        let theta = dy.atan2(dx) + angle;
        let azimuthal = if m > 0 {
            (m_abs as f64 * theta).cos()
        } else if m < 0 {
            (m_abs as f64 * theta).sin()
        } else {
            1.0
        };
        norm * radial(n, m_abs, rho) * azimuthal
    })
}
