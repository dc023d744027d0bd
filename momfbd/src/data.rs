//! Transported data records: per-patch work units and their results.
//!
//! Everything here crosses the master/worker link, so every type carries a
//! wire `Record` implementation. Image planes go on the wire as
//! (rows, cols, samples) with 4-byte dimensions and binary32 samples.

use crate::step::Step;
use ndarray::{Array2, Array3};
use shared::{Point16, PointF, Reader, Record, Region, WireError, Writer};

/// Pack a 2-D float image as (rows, cols, samples).
pub fn pack_image(w: &mut Writer, image: &Array2<f32>) {
    let (rows, cols) = image.dim();
    w.put_u32(rows as u32);
    w.put_u32(cols as u32);
    for &v in image.iter() {
        w.put_f32(v);
    }
}

/// Unpack a 2-D float image.
pub fn unpack_image(r: &mut Reader<'_>) -> Result<Array2<f32>, WireError> {
    let rows = r.get_u32()? as usize;
    let cols = r.get_u32()? as usize;
    let needed = rows.checked_mul(cols).ok_or(WireError::BadCount {
        count: u64::MAX,
        remaining: r.remaining(),
    })?;
    if needed * 4 > r.remaining() {
        return Err(WireError::BadCount {
            count: needed as u64,
            remaining: r.remaining(),
        });
    }
    let mut data = Vec::with_capacity(needed);
    for _ in 0..needed {
        data.push(r.get_f32()?);
    }
    Array2::from_shape_vec((rows, cols), data).map_err(|_| WireError::BadCount {
        count: needed as u64,
        remaining: 0,
    })
}

/// Pack a 3-D float cube as (planes, rows, cols, samples).
pub fn pack_cube(w: &mut Writer, cube: &Array3<f32>) {
    let (planes, rows, cols) = cube.dim();
    w.put_u32(planes as u32);
    w.put_u32(rows as u32);
    w.put_u32(cols as u32);
    for &v in cube.iter() {
        w.put_f32(v);
    }
}

/// Unpack a 3-D float cube.
pub fn unpack_cube(r: &mut Reader<'_>) -> Result<Array3<f32>, WireError> {
    let planes = r.get_u32()? as usize;
    let rows = r.get_u32()? as usize;
    let cols = r.get_u32()? as usize;
    let needed = planes
        .checked_mul(rows)
        .and_then(|v| v.checked_mul(cols))
        .ok_or(WireError::BadCount {
            count: u64::MAX,
            remaining: r.remaining(),
        })?;
    if needed * 4 > r.remaining() {
        return Err(WireError::BadCount {
            count: needed as u64,
            remaining: r.remaining(),
        });
    }
    let mut data = Vec::with_capacity(needed);
    for _ in 0..needed {
        data.push(r.get_f32()?);
    }
    Array3::from_shape_vec((planes, rows, cols), data).map_err(|_| WireError::BadCount {
        count: needed as u64,
        remaining: 0,
    })
}

fn image_size(image: &Array2<f32>) -> u64 {
    8 + image.len() as u64 * 4
}

fn cube_size(cube: &Array3<f32>) -> u64 {
    12 + cube.len() as u64 * 4
}

fn optional_cube_size(cube: &Option<Array3<f32>>) -> u64 {
    1 + cube.as_ref().map(cube_size).unwrap_or(0)
}

fn pack_optional_cube(w: &mut Writer, cube: &Option<Array3<f32>>) {
    match cube {
        None => w.put_u8(0),
        Some(c) => {
            w.put_u8(1);
            pack_cube(w, c);
        }
    }
}

fn unpack_optional_cube(r: &mut Reader<'_>) -> Result<Option<Array3<f32>>, WireError> {
    Ok(match r.get_u8()? {
        0 => None,
        _ => Some(unpack_cube(r)?),
    })
}

/// One channel's slice of a patch: the pixel cube plus its alignment.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPatch {
    /// Calibrated pixels [frame, y, x], already shifted by whole pixels.
    pub cube: Array3<f32>,
    /// Whole-pixel shift applied when slicing.
    pub shift_y: i32,
    /// Whole-pixel shift applied when slicing.
    pub shift_x: i32,
    /// Residual fractional shift, handed to the solver as tilt offsets.
    pub residual: PointF,
}

impl Record for ChannelPatch {
    fn wire_size(&self) -> u64 {
        cube_size(&self.cube) + 8 + self.residual.wire_size()
    }

    fn pack(&self, w: &mut Writer) {
        pack_cube(w, &self.cube);
        w.put_i32(self.shift_y);
        w.put_i32(self.shift_x);
        self.residual.pack(w);
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            cube: unpack_cube(r)?,
            shift_y: r.get_i32()?,
            shift_x: r.get_i32()?,
            residual: PointF::unpack(r)?,
        })
    }
}

/// One object's slice of a patch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectPatch {
    /// Per-channel cubes.
    pub channels: Vec<ChannelPatch>,
}

impl Record for ObjectPatch {
    fn wire_size(&self) -> u64 {
        8 + self.channels.iter().map(|c| c.wire_size()).sum::<u64>()
    }

    fn pack(&self, w: &mut Writer) {
        w.put_u64(self.channels.len() as u64);
        for c in &self.channels {
            c.pack(w);
        }
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let n = r.get_u64()? as usize;
        let mut channels = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            channels.push(ChannelPatch::unpack(r)?);
        }
        Ok(Self { channels })
    }
}

/// Restored products for one object of one patch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectResult {
    /// Restored image.
    pub img: Array2<f32>,
    /// PSF cube (one plane per frame, or a single averaged plane).
    pub psf: Option<Array3<f32>>,
    /// Convolved-object cube.
    pub cobj: Option<Array3<f32>>,
    /// Residual cube.
    pub res: Option<Array3<f32>>,
    /// Mode coefficients, one row per frame.
    pub alpha: Option<Array2<f32>>,
    /// Per-channel diversity phases.
    pub div: Option<Array3<f32>>,
}

impl Record for ObjectResult {
    fn wire_size(&self) -> u64 {
        image_size(&self.img)
            + optional_cube_size(&self.psf)
            + optional_cube_size(&self.cobj)
            + optional_cube_size(&self.res)
            + 1
            + self.alpha.as_ref().map(image_size).unwrap_or(0)
            + optional_cube_size(&self.div)
    }

    fn pack(&self, w: &mut Writer) {
        pack_image(w, &self.img);
        pack_optional_cube(w, &self.psf);
        pack_optional_cube(w, &self.cobj);
        pack_optional_cube(w, &self.res);
        match &self.alpha {
            None => w.put_u8(0),
            Some(a) => {
                w.put_u8(1);
                pack_image(w, a);
            }
        }
        pack_optional_cube(w, &self.div);
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            img: unpack_image(r)?,
            psf: unpack_optional_cube(r)?,
            cobj: unpack_optional_cube(r)?,
            res: unpack_optional_cube(r)?,
            alpha: match r.get_u8()? {
                0 => None,
                _ => Some(unpack_image(r)?),
            },
            div: unpack_optional_cube(r)?,
        })
    }
}

/// One patch: identity, placement, input cubes and (eventually) results.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchData {
    /// Stable sequence id, unique inside a job.
    pub id: u64,
    /// (row, col) of the patch in the patch grid.
    pub index: Point16,
    /// Patch centre in clipped-image coordinates.
    pub position: Point16,
    /// Region of interest around the centre, including the local-shift
    /// margin.
    pub roi: Region,
    /// Life-cycle step.
    pub step: Step,
    /// Times this patch has been re-queued after an error.
    pub n_retries: u16,
    /// Input cubes, one entry per object.
    pub objects: Vec<ObjectPatch>,
    /// Results, one entry per object once processing finished.
    pub results: Vec<ObjectResult>,
    /// Final metric value reported by the solver.
    pub final_metric: f64,
}

impl PatchData {
    /// Fresh queued patch with no data attached yet.
    pub fn new(id: u64, index: Point16, position: Point16, roi: Region) -> Self {
        Self {
            id,
            index,
            position,
            roi,
            step: Step::Queued,
            n_retries: 0,
            objects: Vec::new(),
            results: Vec::new(),
            final_metric: 0.0,
        }
    }

    /// Strip input cubes, keeping identity and results: the shape a worker
    /// sends back in PUT_PARTS.
    pub fn results_only(&self) -> Self {
        Self {
            objects: Vec::new(),
            ..self.clone()
        }
    }
}

impl Record for PatchData {
    fn wire_size(&self) -> u64 {
        8 + self.index.wire_size()
            + self.position.wire_size()
            + self.roi.wire_size()
            + 1
            + 2
            + 8
            + self.objects.iter().map(|o| o.wire_size()).sum::<u64>()
            + 8
            + self.results.iter().map(|o| o.wire_size()).sum::<u64>()
            + 8
    }

    fn pack(&self, w: &mut Writer) {
        w.put_u64(self.id);
        self.index.pack(w);
        self.position.pack(w);
        self.roi.pack(w);
        self.step.pack(w);
        w.put_u16(self.n_retries);
        w.put_u64(self.objects.len() as u64);
        for o in &self.objects {
            o.pack(w);
        }
        w.put_u64(self.results.len() as u64);
        for o in &self.results {
            o.pack(w);
        }
        w.put_f64(self.final_metric);
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let id = r.get_u64()?;
        let index = Point16::unpack(r)?;
        let position = Point16::unpack(r)?;
        let roi = Region::unpack(r)?;
        let step = Step::unpack(r)?;
        let n_retries = r.get_u16()?;
        let n_objects = r.get_u64()? as usize;
        let mut objects = Vec::with_capacity(n_objects.min(64));
        for _ in 0..n_objects {
            objects.push(ObjectPatch::unpack(r)?);
        }
        let n_results = r.get_u64()? as usize;
        let mut results = Vec::with_capacity(n_results.min(64));
        for _ in 0..n_results {
            results.push(ObjectResult::unpack(r)?);
        }
        let final_metric = r.get_f64()?;
        Ok(Self {
            id,
            index,
            position,
            roi,
            step,
            n_retries,
            objects,
            results,
            final_metric,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_patch() -> PatchData {
        let cube = Array3::from_shape_fn((2, 4, 4), |(p, y, x)| (p * 16 + y * 4 + x) as f32);
        let mut patch = PatchData::new(
            3,
            Point16::new(0, 1),
            Point16::new(69, 149),
            Region::new(0, 137, 80, 217),
        );
        patch.objects = vec![ObjectPatch {
            channels: vec![ChannelPatch {
                cube,
                shift_y: -1,
                shift_x: 2,
                residual: PointF::new(0.25, -0.125),
            }],
        }];
        patch.results = vec![ObjectResult {
            img: Array2::from_elem((4, 4), 1.5),
            psf: Some(Array3::from_elem((2, 4, 4), 0.25)),
            alpha: Some(Array2::from_elem((2, 3), 0.01)),
            ..Default::default()
        }];
        patch.final_metric = 0.125;
        patch
    }

    #[test]
    fn patch_roundtrips_byte_exact() {
        let patch = sample_patch();
        let bytes = patch.to_bytes();
        assert_eq!(bytes.len() as u64, patch.wire_size());
        let back = PatchData::from_bytes(&bytes, false).unwrap();
        assert_eq!(back, patch);
        assert_eq!(back.to_bytes(), bytes);
    }

    #[test]
    fn patch_roundtrips_through_swapped_wire() {
        let patch = sample_patch();
        let mut w = Writer::with_swap();
        patch.pack(&mut w);
        let swapped = w.into_inner();
        let back = PatchData::from_bytes(&swapped, true).unwrap();
        assert_eq!(back, patch);
        assert_eq!(back.to_bytes(), patch.to_bytes());
    }

    #[test]
    fn results_only_strips_input_cubes() {
        let patch = sample_patch();
        let stripped = patch.results_only();
        assert!(stripped.objects.is_empty());
        assert_eq!(stripped.results, patch.results);
        assert_eq!(stripped.id, patch.id);
    }

    #[test]
    fn truncated_image_is_rejected() {
        let mut w = Writer::new();
        w.put_u32(1000);
        w.put_u32(1000);
        w.put_f32(1.0);
        let bytes = w.into_inner();
        let mut r = Reader::new(&bytes, false);
        assert!(matches!(
            unpack_image(&mut r),
            Err(WireError::BadCount { .. })
        ));
    }
}
