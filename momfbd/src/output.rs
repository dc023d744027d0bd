//! The structured binary output container, one per object.
//!
//! Layout: a 1-byte endian flag; three count-prefixed ASCII strings
//! (version, time, date); an optional pupil+modes block; the per-channel
//! clip-rectangle table; a patch-offset table recomputed at write time;
//! the per-patch records; and a trailing filename table. Numerical fields
//! are stored little-endian with the endian flag declaring it.

use crate::data::{pack_cube, pack_image, unpack_cube, unpack_image, ObjectResult, PatchData};
use crate::object::Object;
use ndarray::{Array2, Array3};
use shared::{Reader, Record, Region, WireError, Writer};

/// Endian flag value for little-endian payloads.
const LITTLE_ENDIAN_FLAG: u8 = 1;

/// One patch as stored in the container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerPatch {
    /// Patch region in clipped-image coordinates.
    pub region: Region,
    /// Whole-pixel shift applied per channel, (y, x) pairs.
    pub channel_shifts: Vec<(i32, i32)>,
    /// The restored products of one object.
    pub result: ObjectResult,
}

impl Record for ContainerPatch {
    fn wire_size(&self) -> u64 {
        self.region.wire_size() + 8 + self.channel_shifts.len() as u64 * 8 + self.result.wire_size()
    }

    fn pack(&self, w: &mut Writer) {
        self.region.pack(w);
        w.put_u64(self.channel_shifts.len() as u64);
        for &(dy, dx) in &self.channel_shifts {
            w.put_i32(dy);
            w.put_i32(dx);
        }
        self.result.pack(w);
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let region = Region::unpack(r)?;
        let n = r.get_u64()? as usize;
        let mut channel_shifts = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            let dy = r.get_i32()?;
            let dx = r.get_i32()?;
            channel_shifts.push((dy, dx));
        }
        let result = ObjectResult::unpack(r)?;
        Ok(Self {
            region,
            channel_shifts,
            result,
        })
    }
}

/// Everything the container for one object holds.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Container {
    /// Writer version string.
    pub version: String,
    /// Observation time.
    pub time_obs: String,
    /// Observation date.
    pub date_obs: String,
    /// Pupil mask, when GET_MODES was requested.
    pub pupil: Option<Array2<f32>>,
    /// Mode surfaces, when GET_MODES was requested.
    pub modes: Option<Array3<f32>>,
    /// ALIGN_CLIP rectangle per channel (x1, x2, y1, y2).
    pub clips: Vec<[i32; 4]>,
    /// Patch records.
    pub patches: Vec<ContainerPatch>,
    /// Input file names that went into the restoration.
    pub filenames: Vec<String>,
}

impl Container {
    /// Assemble the container for `object` from the job's finished patches.
    pub fn assemble(
        object: &Object,
        object_index: usize,
        patches: &[PatchData],
        version: &str,
        date_obs: &str,
        time_obs: &str,
        include_modes: bool,
    ) -> Self {
        let pupil = include_modes.then(|| object.pupil.values.mapv(|v| v as f32));
        let modes = include_modes.then(|| object.modes.modes.mapv(|v| v as f32));
        let clips = object
            .channels
            .iter()
            .map(|c| {
                let clip = &c.cfg.align_clip;
                if clip.len() == 4 {
                    [clip[0], clip[1], clip[2], clip[3]]
                } else {
                    [0, 0, 0, 0]
                }
            })
            .collect();
        let mut container_patches = Vec::new();
        for patch in patches {
            let Some(result) = patch.results.get(object_index) else {
                continue;
            };
            let channel_shifts = patch
                .objects
                .get(object_index)
                .map(|o| o.channels.iter().map(|c| (c.shift_y, c.shift_x)).collect())
                .unwrap_or_default();
            container_patches.push(ContainerPatch {
                region: patch.roi,
                channel_shifts,
                result: result.clone(),
            });
        }
        let filenames = object
            .channels
            .iter()
            .flat_map(|c| {
                c.cfg
                    .image_numbers
                    .iter()
                    .map(|n| format_template(&c.cfg.image_template, *n))
                    .collect::<Vec<_>>()
            })
            .collect();
        Self {
            version: version.to_string(),
            time_obs: time_obs.to_string(),
            date_obs: date_obs.to_string(),
            pupil,
            modes,
            clips,
            patches: container_patches,
            filenames,
        }
    }

    /// Serialize, recomputing every patch offset.
    pub fn write(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_u8(LITTLE_ENDIAN_FLAG);
        w.put_str(&self.version);
        w.put_str(&self.time_obs);
        w.put_str(&self.date_obs);

        match (&self.pupil, &self.modes) {
            (Some(pupil), Some(modes)) => {
                w.put_u8(1);
                pack_image(&mut w, pupil);
                pack_cube(&mut w, modes);
            }
            _ => w.put_u8(0),
        }

        w.put_u64(self.clips.len() as u64);
        for clip in &self.clips {
            for &v in clip {
                w.put_i32(v);
            }
        }

        // Offset table: absolute positions of each patch record, computed
        // from the running position at write time.
        w.put_u64(self.patches.len() as u64);
        let table_start = w.len();
        let mut position = table_start as u64 + self.patches.len() as u64 * 8;
        for patch in &self.patches {
            w.put_u64(position);
            position += patch.wire_size();
        }
        for patch in &self.patches {
            patch.pack(&mut w);
        }

        w.put_u64(self.filenames.len() as u64);
        for name in &self.filenames {
            w.put_str(name);
        }
        w.into_inner()
    }

    /// Parse a container back, verifying the offset table.
    pub fn read(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(buf, false);
        let endian = r.get_u8()?;
        let swap = endian != LITTLE_ENDIAN_FLAG;
        let mut r = Reader::new(&buf[1..], swap);

        let version = r.get_str()?;
        let time_obs = r.get_str()?;
        let date_obs = r.get_str()?;
        let (pupil, modes) = match r.get_u8()? {
            0 => (None, None),
            _ => (Some(unpack_image(&mut r)?), Some(unpack_cube(&mut r)?)),
        };
        let n_clips = r.get_u64()? as usize;
        let mut clips = Vec::with_capacity(n_clips.min(64));
        for _ in 0..n_clips {
            clips.push([r.get_i32()?, r.get_i32()?, r.get_i32()?, r.get_i32()?]);
        }
        let n_patches = r.get_u64()? as usize;
        let mut offsets = Vec::with_capacity(n_patches.min(4096));
        for _ in 0..n_patches {
            offsets.push(r.get_u64()?);
        }
        let mut patches = Vec::with_capacity(n_patches.min(4096));
        for &offset in &offsets {
            // Offsets are relative to the start of the file; the reader
            // tracks the payload after the endian byte.
            if offset as usize != r.pos() + 1 {
                return Err(WireError::SizeMismatch {
                    declared: offset,
                    consumed: r.pos() as u64 + 1,
                });
            }
            patches.push(ContainerPatch::unpack(&mut r)?);
        }
        let n_files = r.get_u64()? as usize;
        let mut filenames = Vec::with_capacity(n_files.min(4096));
        for _ in 0..n_files {
            filenames.push(r.get_str()?);
        }
        Ok(Self {
            version,
            time_obs,
            date_obs,
            pupil,
            modes,
            clips,
            patches,
            filenames,
        })
    }
}

/// Substitute a frame number into a printf-style `%0Nd` template.
fn format_template(template: &str, number: u32) -> String {
    let Some(start) = template.find('%') else {
        return template.to_string();
    };
    let rest = &template[start + 1..];
    let Some(d_pos) = rest.find('d') else {
        return template.to_string();
    };
    let spec = &rest[..d_pos];
    let width: usize = spec.trim_start_matches('0').parse().unwrap_or(0);
    let formatted = if spec.starts_with('0') {
        format!("{number:0width$}")
    } else {
        format!("{number:width$}")
    };
    format!("{}{}{}", &template[..start], formatted, &rest[d_pos + 1..])
}
