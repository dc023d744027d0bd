//! One detector's frames and their calibration.
//!
//! A channel ingests the raw frame stack plus calibration images, applies
//! dark/gain flat-fielding and descatter, fills bad pixels, clips to the
//! ALIGN_CLIP rectangle (reversed endpoints flip that axis) and trims the
//! BORDER_CLIP margin, then exposes per-patch sub-cubes and mean alignment
//! offsets to the patch pipeline.

use crate::error::MomfbdError;
use crate::fourier;
use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use rustfft::num_complex::Complex64;
use shared::{ChannelCfg, FillPixMethod, Region, RunFlags};
use tracing::{debug, warn};

/// Raw inputs for one channel, handed over by the I/O layer.
#[derive(Debug, Clone, Default)]
pub struct ChannelInput {
    /// Frame stack [frame, y, x].
    pub frames: Array3<f32>,
    /// Master dark, same frame geometry.
    pub dark: Option<Array2<f32>>,
    /// Gain table; values below the bad-pixel threshold mark bad pixels.
    pub gain: Option<Array2<f32>>,
    /// Detector response correction, multiplied in with the gain.
    pub response: Option<Array2<f32>>,
    /// Back-scatter gain (descatter pair).
    pub back_gain: Option<Array2<f32>>,
    /// Back-scatter PSF (descatter pair).
    pub psf: Option<Array2<f32>>,
    /// Integer x-offset alignment map.
    pub x_offsets: Option<Array2<i16>>,
    /// Integer y-offset alignment map.
    pub y_offsets: Option<Array2<i16>>,
}

/// A calibrated, clipped channel.
pub struct Channel {
    /// The channel's configuration after defaulting.
    pub cfg: ChannelCfg,
    /// Calibrated frames [frame, y, x].
    pub frames: Array3<f64>,
    /// Clipped x-offset map, when supplied.
    pub x_offsets: Option<Array2<i16>>,
    /// Clipped y-offset map, when supplied.
    pub y_offsets: Option<Array2<i16>>,
    /// Per-frame noise estimates.
    pub noise: Vec<f64>,
}

impl Channel {
    /// Run the calibration pipeline on raw inputs.
    pub fn preprocess(
        cfg: ChannelCfg,
        input: ChannelInput,
        run_flags: RunFlags,
        badpixel_threshold: f64,
    ) -> Result<Self, MomfbdError> {
        let (n_frames, rows, cols) = input.frames.dim();
        if n_frames == 0 {
            return Err(MomfbdError::Io("channel has no frames".into()));
        }
        check_calibration_dims("dark", &input.dark, rows, cols)?;
        check_calibration_dims("gain", &input.gain, rows, cols)?;
        check_calibration_dims("response", &input.response, rows, cols)?;
        check_calibration_dims("back-gain", &input.back_gain, rows, cols)?;

        let mut frames = input.frames.mapv(|v| v as f64);

        if run_flags.contains(RunFlags::FLATFIELD) {
            flatfield(
                &mut frames,
                input.dark.as_ref(),
                input.gain.as_ref(),
                input.response.as_ref(),
            );
            if let (Some(back_gain), Some(psf)) = (&input.back_gain, &input.psf) {
                for mut frame in frames.axis_iter_mut(Axis(0)) {
                    let corrected = descatter(&frame.view(), back_gain, psf);
                    frame.assign(&corrected);
                }
            }
        }

        if let Some(gain) = &input.gain {
            let bad = bad_pixel_mask(gain, badpixel_threshold);
            let n_bad = bad.iter().filter(|&&b| b).count();
            if n_bad > 0 {
                debug!(n_bad, method = ?cfg.fillpix_method, "filling bad pixels");
                for mut frame in frames.axis_iter_mut(Axis(0)) {
                    fill_bad_pixels(&mut frame, &bad, cfg.fillpix_method);
                }
            }
        }

        let (frames, x_offsets, y_offsets) = if run_flags.contains(RunFlags::NO_CLIP) {
            (frames, input.x_offsets, input.y_offsets)
        } else {
            clip_channel(frames, input.x_offsets, input.y_offsets, &cfg)?
        };

        let noise = frames
            .axis_iter(Axis(0))
            .map(|frame| frame_noise(&frame))
            .collect();

        Ok(Self {
            cfg,
            frames,
            x_offsets,
            y_offsets,
            noise,
        })
    }

    /// Configuration-only channel for workers, which receive patch cubes
    /// over the wire and never hold full frame stacks.
    pub fn stub(cfg: ChannelCfg) -> Self {
        let n_frames = cfg.image_numbers.len();
        Self {
            cfg,
            frames: Array3::zeros((n_frames, 0, 0)),
            x_offsets: None,
            y_offsets: None,
            noise: vec![0.0; n_frames],
        }
    }

    /// Frame count.
    pub fn n_frames(&self) -> usize {
        self.frames.dim().0
    }

    /// Clipped frame geometry (rows, cols).
    pub fn frame_size(&self) -> (usize, usize) {
        let (_, rows, cols) = self.frames.dim();
        (rows, cols)
    }

    /// Cut the patch cube for `roi`, shifted by whole pixels.
    ///
    /// The shift comes from the integer part of the channel's mean offset
    /// over the patch; the ROI is clamped back inside the frame when the
    /// shift would push it over an edge.
    pub fn patch_cube(&self, roi: Region, shift_y: i32, shift_x: i32) -> Array3<f64> {
        let (rows, cols) = self.frame_size();
        let height = roi.height();
        let width = roi.width();
        let first_y = clamp_start(roi.first_y as i64 + shift_y as i64, height, rows);
        let first_x = clamp_start(roi.first_x as i64 + shift_x as i64, width, cols);
        self.frames
            .slice(s![
                ..,
                first_y..first_y + height,
                first_x..first_x + width
            ])
            .to_owned()
    }

    /// Mean alignment offset over `roi`: (y, x), in pixels.
    pub fn mean_offset(&self, roi: Region) -> (f64, f64) {
        let mean_of = |map: &Option<Array2<i16>>| -> f64 {
            match map {
                None => 0.0,
                Some(map) => {
                    let (rows, cols) = map.dim();
                    let y0 = (roi.first_y as usize).min(rows.saturating_sub(1));
                    let y1 = ((roi.last_y as usize) + 1).min(rows);
                    let x0 = (roi.first_x as usize).min(cols.saturating_sub(1));
                    let x1 = ((roi.last_x as usize) + 1).min(cols);
                    if y0 >= y1 || x0 >= x1 {
                        return 0.0;
                    }
                    let window = map.slice(s![y0..y1, x0..x1]);
                    window.iter().map(|&v| v as f64).sum::<f64>() / window.len() as f64
                }
            }
        };
        (mean_of(&self.y_offsets), mean_of(&self.x_offsets))
    }
}

fn check_calibration_dims(
    label: &str,
    image: &Option<Array2<f32>>,
    rows: usize,
    cols: usize,
) -> Result<(), MomfbdError> {
    if let Some(image) = image {
        if image.dim() != (rows, cols) {
            return Err(MomfbdError::Io(format!(
                "{label} is {:?}, frames are ({rows}, {cols})",
                image.dim()
            )));
        }
    }
    Ok(())
}

/// frame ← (frame − dark) · response? · gain.
fn flatfield(
    frames: &mut Array3<f64>,
    dark: Option<&Array2<f32>>,
    gain: Option<&Array2<f32>>,
    response: Option<&Array2<f32>>,
) {
    for mut frame in frames.axis_iter_mut(Axis(0)) {
        if let Some(dark) = dark {
            ndarray::Zip::from(&mut frame)
                .and(dark)
                .for_each(|v, &d| *v -= d as f64);
        }
        if let Some(response) = response {
            ndarray::Zip::from(&mut frame)
                .and(response)
                .for_each(|v, &r| *v *= r as f64);
        }
        if let Some(gain) = gain {
            ndarray::Zip::from(&mut frame)
                .and(gain)
                .for_each(|v, &g| *v *= g as f64);
        }
    }
}

/// Remove scattered light: frame − conv(frame · back_gain, psf).
fn descatter(
    frame: &ArrayView2<'_, f64>,
    back_gain: &Array2<f32>,
    psf: &Array2<f32>,
) -> Array2<f64> {
    let (rows, cols) = frame.dim();
    let scattered = ndarray::Zip::from(frame)
        .and(back_gain)
        .map_collect(|&v, &g| Complex64::new(v * g as f64, 0.0));
    // The scatter PSF is small against the frame; embed it centred, zero
    // elsewhere, and convolve circularly.
    let (p_rows, p_cols) = psf.dim();
    let mut kernel = Array2::from_elem((rows, cols), Complex64::default());
    for y in 0..p_rows.min(rows) {
        for x in 0..p_cols.min(cols) {
            let ky = (y + rows - p_rows / 2) % rows;
            let kx = (x + cols - p_cols / 2) % cols;
            kernel[[ky, kx]] = Complex64::new(psf[[y, x]] as f64, 0.0);
        }
    }
    let product = fourier::fft2(&scattered) * fourier::fft2(&kernel);
    let scatter = fourier::ifft2(&product);
    ndarray::Zip::from(frame)
        .and(&scatter)
        .map_collect(|&v, s| v - s.re)
}

fn bad_pixel_mask(gain: &Array2<f32>, threshold: f64) -> Array2<bool> {
    gain.mapv(|g| (g as f64) < threshold)
}

fn fill_bad_pixels(
    frame: &mut ndarray::ArrayViewMut2<'_, f64>,
    bad: &Array2<bool>,
    method: FillPixMethod,
) {
    let (rows, cols) = frame.dim();
    let source = frame.to_owned();
    for y in 0..rows {
        for x in 0..cols {
            if !bad[[y, x]] {
                continue;
            }
            frame[[y, x]] = match method {
                FillPixMethod::Median => median_of_neighbours(&source, bad, y, x),
                FillPixMethod::InvDistWeight => inverse_distance_fill(&source, bad, y, x),
                FillPixMethod::HorizontalInterpolation => horizontal_fill(&source, bad, y, x),
            };
        }
    }
}

fn median_of_neighbours(frame: &Array2<f64>, bad: &Array2<bool>, y: usize, x: usize) -> f64 {
    let (rows, cols) = frame.dim();
    let mut values = Vec::with_capacity(8);
    for dy in -1i64..=1 {
        for dx in -1i64..=1 {
            if dy == 0 && dx == 0 {
                continue;
            }
            let ny = y as i64 + dy;
            let nx = x as i64 + dx;
            if ny < 0 || nx < 0 || ny >= rows as i64 || nx >= cols as i64 {
                continue;
            }
            let (ny, nx) = (ny as usize, nx as usize);
            if !bad[[ny, nx]] {
                values.push(frame[[ny, nx]]);
            }
        }
    }
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).expect("frame values are finite"));
    values[values.len() / 2]
}

fn inverse_distance_fill(frame: &Array2<f64>, bad: &Array2<bool>, y: usize, x: usize) -> f64 {
    let (rows, cols) = frame.dim();
    let mut num = 0.0;
    let mut den = 0.0;
    for dy in -2i64..=2 {
        for dx in -2i64..=2 {
            if dy == 0 && dx == 0 {
                continue;
            }
            let ny = y as i64 + dy;
            let nx = x as i64 + dx;
            if ny < 0 || nx < 0 || ny >= rows as i64 || nx >= cols as i64 {
                continue;
            }
            let (ny, nx) = (ny as usize, nx as usize);
            if bad[[ny, nx]] {
                continue;
            }
            let w = 1.0 / ((dy * dy + dx * dx) as f64).sqrt();
            num += w * frame[[ny, nx]];
            den += w;
        }
    }
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

fn horizontal_fill(frame: &Array2<f64>, bad: &Array2<bool>, y: usize, x: usize) -> f64 {
    let cols = frame.dim().1;
    let mut left = None;
    for nx in (0..x).rev() {
        if !bad[[y, nx]] {
            left = Some((nx, frame[[y, nx]]));
            break;
        }
    }
    let mut right = None;
    for nx in x + 1..cols {
        if !bad[[y, nx]] {
            right = Some((nx, frame[[y, nx]]));
            break;
        }
    }
    match (left, right) {
        (Some((lx, lv)), Some((rx, rv))) => {
            let t = (x - lx) as f64 / (rx - lx) as f64;
            lv + t * (rv - lv)
        }
        (Some((_, lv)), None) => lv,
        (None, Some((_, rv))) => rv,
        (None, None) => 0.0,
    }
}

/// Apply ALIGN_CLIP (x1, x2, y1, y2), 1-based inclusive — a reversed pair
/// flips that axis — then trim BORDER_CLIP pixels off every remaining
/// edge. Offset maps are clipped the same way.
#[allow(clippy::type_complexity)]
fn clip_channel(
    frames: Array3<f64>,
    x_offsets: Option<Array2<i16>>,
    y_offsets: Option<Array2<i16>>,
    cfg: &ChannelCfg,
) -> Result<(Array3<f64>, Option<Array2<i16>>, Option<Array2<i16>>), MomfbdError> {
    let (mut clipped, mut x_offsets, mut y_offsets) = if cfg.align_clip.is_empty() {
        (frames, x_offsets, y_offsets)
    } else {
        let (_, rows, cols) = frames.dim();
        let clip = &cfg.align_clip;
        let (x1, x2, y1, y2) = (clip[0], clip[1], clip[2], clip[3]);
        let flip_x = x1 > x2;
        let flip_y = y1 > y2;
        let (x_lo, x_hi) = if flip_x { (x2, x1) } else { (x1, x2) };
        let (y_lo, y_hi) = if flip_y { (y2, y1) } else { (y1, y2) };
        if x_lo < 1 || y_lo < 1 || x_hi as usize > cols || y_hi as usize > rows {
            return Err(MomfbdError::Io(format!(
                "ALIGN_CLIP [{x1}, {x2}, {y1}, {y2}] does not fit a ({rows}, {cols}) frame"
            )));
        }
        if flip_x || flip_y {
            warn!(flip_x, flip_y, "ALIGN_CLIP endpoints reversed, flipping axes");
        }

        let y_range = (y_lo as usize - 1)..(y_hi as usize);
        let x_range = (x_lo as usize - 1)..(x_hi as usize);

        let mut aligned = frames
            .slice(s![.., y_range.clone(), x_range.clone()])
            .to_owned();
        if flip_y {
            aligned.invert_axis(Axis(1));
        }
        if flip_x {
            aligned.invert_axis(Axis(2));
        }

        let clip_map = |map: Option<Array2<i16>>| -> Option<Array2<i16>> {
            map.map(|m| {
                let mut c = m.slice(s![y_range.clone(), x_range.clone()]).to_owned();
                if flip_y {
                    c.invert_axis(Axis(0));
                }
                if flip_x {
                    c.invert_axis(Axis(1));
                }
                c
            })
        };

        let x_offsets = clip_map(x_offsets);
        let y_offsets = clip_map(y_offsets);
        (aligned, x_offsets, y_offsets)
    };

    let border = cfg.border_clip as usize;
    if border > 0 {
        let (_, rows, cols) = clipped.dim();
        if 2 * border >= rows || 2 * border >= cols {
            return Err(MomfbdError::Io(format!(
                "BORDER_CLIP {border} leaves nothing of a ({rows}, {cols}) frame"
            )));
        }
        clipped = clipped
            .slice(s![.., border..rows - border, border..cols - border])
            .to_owned();
        let trim = |map: Option<Array2<i16>>| -> Option<Array2<i16>> {
            map.map(|m| {
                m.slice(s![border..rows - border, border..cols - border])
                    .to_owned()
            })
        };
        x_offsets = trim(x_offsets);
        y_offsets = trim(y_offsets);
    }

    Ok((clipped, x_offsets, y_offsets))
}

fn clamp_start(desired: i64, span: usize, total: usize) -> usize {
    let max_start = total.saturating_sub(span) as i64;
    desired.clamp(0, max_start) as usize
}

/// High-frequency RMS of one frame, from the annulus of its power spectrum.
fn frame_noise(frame: &ArrayView2<'_, f64>) -> f64 {
    let ft = fourier::fft2_real(frame);
    let (rows, cols) = ft.dim();
    let mask = rows.min(cols) as f64 / 6.0;
    let limit = rows.min(cols) as f64 / 2.0;
    let mut acc = 0.0;
    let mut count = 0usize;
    for y in 0..rows {
        for x in 0..cols {
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
    (acc / count as f64).sqrt() / ((rows * cols) as f64).sqrt()
}
