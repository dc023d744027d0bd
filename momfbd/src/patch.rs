//! Master-side patch pipeline: split the clipped image area into
//! overlapping patches and materialize the per-patch data.

use crate::data::{ChannelPatch, ObjectPatch, PatchData};
use crate::error::MomfbdError;
use crate::object::Object;
use shared::{GlobalCfg, Point16, PointF, Region};
use tracing::{debug, warn};

/// Candidate patch centres along one axis.
///
/// Centres start at `first`, advance by 3·patchSize/4 − minimumOverlap and
/// stop at `last` (inclusive).
pub fn segment(first: u16, last: u16, patch_size: u16, minimum_overlap: u16) -> Vec<u16> {
    let stride = (3 * patch_size / 4).saturating_sub(minimum_overlap).max(1);
    let mut positions = Vec::new();
    let mut pos = first as u32;
    while pos <= last as u32 {
        positions.push(pos as u16);
        pos += stride as u32;
    }
    positions
}

/// Clamp user-supplied centres into the valid band, warning on trims.
fn clamp_positions(positions: &[u16], half_block: u16, image_size: u16, axis: &str) -> Vec<u16> {
    positions
        .iter()
        .map(|&pos| {
            let trimmed = pos.clamp(half_block, image_size - half_block);
            if trimmed != pos {
                warn!(
                    "{axis}-position of patch was outside the image area and was trimmed: \
                     {pos} -> {trimmed}"
                );
            }
            trimmed
        })
        .collect()
}

/// Split the clipped image area into queued patches.
///
/// Patch centres honor SIM_X/SIM_Y when given, otherwise they are generated
/// by [`segment`]. Each patch gets a stable sequence id and the ROI that
/// includes the local-shift margin.
pub fn split_patches(
    global: &GlobalCfg,
    image_rows: u16,
    image_cols: u16,
) -> Result<Vec<PatchData>, MomfbdError> {
    let patch_size = global.object_defaults.patch_size;
    let max_local_shift = global.object_defaults.channel_defaults.max_local_shift;
    let half_block = patch_size / 2 + max_local_shift;
    if image_rows < 2 * half_block || image_cols < 2 * half_block {
        return Err(MomfbdError::config(format!(
            "clipped image ({image_rows}x{image_cols}) cannot hold a single \
             {patch_size}-pixel patch with a {max_local_shift}-pixel shift margin"
        )));
    }

    let xs = if global.sim_x.is_empty() {
        segment(
            half_block,
            image_cols - half_block - 1,
            patch_size,
            global.minimum_overlap,
        )
    } else {
        clamp_positions(&global.sim_x, half_block, image_cols, "x")
    };
    let ys = if global.sim_y.is_empty() {
        segment(
            half_block,
            image_rows - half_block - 1,
            patch_size,
            global.minimum_overlap,
        )
    } else {
        clamp_positions(&global.sim_y, half_block, image_rows, "y")
    };
    if xs.is_empty() || ys.is_empty() {
        return Err(MomfbdError::config(
            "no patch positions specified or generated",
        ));
    }

    let cutout = patch_size + 2 * max_local_shift;
    let mut patches = Vec::with_capacity(xs.len() * ys.len());
    let mut id = 0u64;
    for (yi, &cy) in ys.iter().enumerate() {
        for (xi, &cx) in xs.iter().enumerate() {
            id += 1;
            let centre = Point16::new(cy, cx);
            let roi = Region::centred_square(centre, cutout);
            patches.push(PatchData::new(
                id,
                Point16::new(yi as u16, xi as u16),
                centre,
                roi,
            ));
        }
    }
    debug!(
        n_patches = patches.len(),
        per_row = xs.len(),
        per_col = ys.len(),
        "generated patch positions"
    );
    Ok(patches)
}

/// Fill one patch with its per-object, per-channel pixel cubes.
///
/// Each channel's mean offset over the patch region decomposes into a whole
/// pixel shift (applied when slicing) and a residual fraction that rides
/// along for the solver's tilt offsets.
pub fn materialize(patch: &mut PatchData, objects: &[Object]) -> Result<(), MomfbdError> {
    patch.objects.clear();
    for object in objects {
        let mut object_patch = ObjectPatch::default();
        for channel in &object.channels {
            let (mean_dy, mean_dx) = channel.mean_offset(patch.roi);
            let shift_y = mean_dy.round() as i32;
            let shift_x = mean_dx.round() as i32;
            let residual = PointF::new(mean_dy - shift_y as f64, mean_dx - shift_x as f64);
            let cube = channel
                .patch_cube(patch.roi, shift_y, shift_x)
                .mapv(|v| v as f32);
            object_patch.channels.push(ChannelPatch {
                cube,
                shift_y,
                shift_x,
                residual,
            });
        }
        patch.objects.push(object_patch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Step;
    use approx::assert_relative_eq;

    fn splitter_cfg(patch_size: u16, max_local_shift: u16, overlap: u16) -> GlobalCfg {
        let mut global = GlobalCfg {
            minimum_overlap: overlap,
            ..Default::default()
        };
        global.object_defaults.patch_size = patch_size;
        global.object_defaults.channel_defaults.max_local_shift = max_local_shift;
        global
    }

    #[test]
    fn segment_matches_reference_run() {
        // 1024 pixels, patch 128, shift 5, overlap 16: halfBlock 69,
        // stride 80, centres 69..=949.
        let centres = segment(69, 1024 - 69 - 1, 128, 16);
        assert_eq!(centres.len(), 12);
        assert_eq!(centres[0], 69);
        assert_eq!(centres[1], 149);
        assert_eq!(*centres.last().unwrap(), 949);
    }

    #[test]
    fn split_covers_both_axes() {
        let global = splitter_cfg(128, 5, 16);
        let patches = split_patches(&global, 1024, 1024).unwrap();
        assert_eq!(patches.len(), 144);
        // Ids are stable and start at 1.
        assert_eq!(patches[0].id, 1);
        assert_eq!(patches[143].id, 144);
        // Every centre stays inside the valid band.
        for patch in &patches {
            assert!(patch.position.y >= 69 && patch.position.y <= 1024 - 69);
            assert!(patch.position.x >= 69 && patch.position.x <= 1024 - 69);
            assert_eq!(patch.step, Step::Queued);
            assert_eq!(patch.roi.height(), 138);
        }
    }

    #[test]
    fn user_positions_are_clamped_with_warning() {
        let mut global = splitter_cfg(128, 5, 16);
        global.sim_x = vec![10, 500, 1020];
        global.sim_y = vec![500];
        let patches = split_patches(&global, 1024, 1024).unwrap();
        assert_eq!(patches.len(), 3);
        assert_eq!(patches[0].position.x, 69);
        assert_eq!(patches[1].position.x, 500);
        assert_eq!(patches[2].position.x, 955);
    }

    #[test]
    fn too_small_image_is_rejected() {
        let global = splitter_cfg(128, 5, 16);
        assert!(split_patches(&global, 100, 1024).is_err());
    }

    #[test]
    fn residual_offsets_split_into_integer_and_fraction() {
        // Direct check of the decomposition arithmetic.
        let mean: f64 = 3.75;
        let shift = mean.round() as i32;
        let residual = mean - shift as f64;
        assert_eq!(shift, 4);
        assert_relative_eq!(residual, -0.25, epsilon = 1e-12);
    }
}
