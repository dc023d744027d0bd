//! Small geometry value types shared by the patch pipeline, the wire records
//! and the output container.

use crate::wire::{Reader, Record, WireError, Writer};
use serde::{Deserialize, Serialize};

/// Integer pixel position, row-major (y first) like the image arrays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point16 {
    /// Row coordinate.
    pub y: u16,
    /// Column coordinate.
    pub x: u16,
}

impl Point16 {
    /// New point from (y, x).
    pub fn new(y: u16, x: u16) -> Self {
        Self { y, x }
    }
}

impl Record for Point16 {
    fn wire_size(&self) -> u64 {
        4
    }

    fn pack(&self, w: &mut Writer) {
        w.put_u16(self.y);
        w.put_u16(self.x);
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            y: r.get_u16()?,
            x: r.get_u16()?,
        })
    }
}

/// Sub-pixel position or shift, row-major.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PointF {
    /// Row coordinate.
    pub y: f64,
    /// Column coordinate.
    pub x: f64,
}

impl PointF {
    /// New point from (y, x).
    pub fn new(y: f64, x: f64) -> Self {
        Self { y, x }
    }
}

impl Record for PointF {
    fn wire_size(&self) -> u64 {
        16
    }

    fn pack(&self, w: &mut Writer) {
        w.put_f64(self.y);
        w.put_f64(self.x);
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            y: r.get_f64()?,
            x: r.get_f64()?,
        })
    }
}

/// Inclusive pixel rectangle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    /// First row.
    pub first_y: u16,
    /// Last row (inclusive).
    pub last_y: u16,
    /// First column.
    pub first_x: u16,
    /// Last column (inclusive).
    pub last_x: u16,
}

impl Region {
    /// Region from inclusive bounds.
    pub fn new(first_y: u16, last_y: u16, first_x: u16, last_x: u16) -> Self {
        Self {
            first_y,
            last_y,
            first_x,
            last_x,
        }
    }

    /// Square region of side `size` centred on `centre`.
    ///
    /// The caller guarantees the centre is at least `size / 2` away from the
    /// image border; the patch splitter clamps positions to make that hold.
    pub fn centred_square(centre: Point16, size: u16) -> Self {
        let half = size / 2;
        Self {
            first_y: centre.y - half,
            last_y: centre.y - half + size - 1,
            first_x: centre.x - half,
            last_x: centre.x - half + size - 1,
        }
    }

    /// Number of rows.
    pub fn height(&self) -> usize {
        (self.last_y - self.first_y) as usize + 1
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        (self.last_x - self.first_x) as usize + 1
    }

    /// Shift the whole region by whole pixels, saturating at zero.
    pub fn shifted(&self, dy: i32, dx: i32) -> Self {
        let move_edge = |edge: u16, delta: i32| -> u16 {
            let v = edge as i32 + delta;
            v.max(0) as u16
        };
        Self {
            first_y: move_edge(self.first_y, dy),
            last_y: move_edge(self.last_y, dy),
            first_x: move_edge(self.first_x, dx),
            last_x: move_edge(self.last_x, dx),
        }
    }

    /// True when `p` falls inside the region.
    pub fn contains(&self, p: Point16) -> bool {
        p.y >= self.first_y && p.y <= self.last_y && p.x >= self.first_x && p.x <= self.last_x
    }
}

impl Record for Region {
    fn wire_size(&self) -> u64 {
        8
    }

    fn pack(&self, w: &mut Writer) {
        w.put_u16(self.first_y);
        w.put_u16(self.last_y);
        w.put_u16(self.first_x);
        w.put_u16(self.last_x);
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            first_y: r.get_u16()?,
            last_y: r.get_u16()?,
            first_x: r.get_u16()?,
            last_x: r.get_u16()?,
        })
    }
}
