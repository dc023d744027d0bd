use thiserror::Error;

/// Errors produced while building pupils and mode bases.
#[derive(Error, Debug)]
pub enum OpticsError {
    /// Pupil grid or radius is unusable.
    #[error("invalid pupil geometry: {0}")]
    PupilGeometry(String),

    /// Loaded pupil image has the wrong rank or dimensions.
    #[error("pupil data has dimensions {got_y}x{got_x}, expected {expected}x{expected}")]
    PupilDimensions {
        /// Rows of the supplied data.
        got_y: usize,
        /// Columns of the supplied data.
        got_x: usize,
        /// Required square side.
        expected: usize,
    },

    /// Mode number outside what the basis can produce.
    #[error("mode number {0} is not constructible (piston and out-of-range modes are excluded)")]
    BadModeNumber(u16),

    /// Karhunen-Loève diagonalization produced no usable modes.
    #[error("empty Karhunen-Loève expansion over Zernike range [{min}, {max}]")]
    EmptyExpansion {
        /// First Zernike mode of the range.
        min: u16,
        /// Last Zernike mode of the range.
        max: u16,
    },

    /// A mode normalized to zero power over the pupil.
    #[error("mode {0} has no power over the pupil support")]
    DegenerateMode(u16),
}
