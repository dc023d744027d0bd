//! Processing steps shared by jobs and their parts.
//!
//! Steps are one-hot bit values so a set of parts can be OR-reduced into a
//! single mask; a job promotes only when the mask holds exactly one bit.

use shared::{Reader, Record, WireError, Writer};

/// Life-cycle step of a job or a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Step {
    /// Accepted but not validated.
    None = 0,
    /// Validated, awaiting pre-processing.
    Submit = 1,
    /// Loading calibration, clipping, splitting patches.
    Preprocess = 1 << 1,
    /// Parts available for workers.
    Queued = 1 << 2,
    /// At least one part is being processed.
    Running = 1 << 3,
    /// Assembling outputs.
    Postprocess = 1 << 4,
    /// Done.
    Completed = 1 << 5,
    /// Fatal.
    Err = 1 << 7,
}

impl Step {
    /// Bit value of this step.
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// Decode a single-step bit value.
    pub fn from_bits(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Submit),
            2 => Ok(Self::Preprocess),
            4 => Ok(Self::Queued),
            8 => Ok(Self::Running),
            16 => Ok(Self::Postprocess),
            32 => Ok(Self::Completed),
            128 => Ok(Self::Err),
            other => Err(WireError::BadTag {
                value: other as u64,
                type_name: "Step",
            }),
        }
    }

    /// OR-reduce a set of steps into a mask.
    pub fn reduce(steps: impl IntoIterator<Item = Step>) -> u8 {
        steps.into_iter().fold(0u8, |mask, s| mask | s.bits())
    }

    /// The single step a mask holds, if it holds exactly one.
    pub fn unanimous(mask: u8) -> Option<Step> {
        if mask.count_ones() == 1 {
            Self::from_bits(mask).ok()
        } else if mask == 0 {
            Some(Step::None)
        } else {
            None
        }
    }
}

impl Record for Step {
    fn wire_size(&self) -> u64 {
        1
    }

    fn pack(&self, w: &mut Writer) {
        w.put_u8(self.bits());
    }

    fn unpack(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Self::from_bits(r.get_u8()?)
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Step::None => "NONE",
            Step::Submit => "SUBMIT",
            Step::Preprocess => "PREPROCESS",
            Step::Queued => "QUEUED",
            Step::Running => "RUNNING",
            Step::Postprocess => "POSTPROCESS",
            Step::Completed => "COMPLETED",
            Step::Err => "ERR",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_and_unanimous() {
        let mask = Step::reduce([Step::Completed, Step::Completed]);
        assert_eq!(Step::unanimous(mask), Some(Step::Completed));

        let mixed = Step::reduce([Step::Completed, Step::Running]);
        assert_eq!(Step::unanimous(mixed), None);

        assert_eq!(Step::unanimous(0), Some(Step::None));
    }

    #[test]
    fn roundtrip() {
        for step in [
            Step::None,
            Step::Submit,
            Step::Preprocess,
            Step::Queued,
            Step::Running,
            Step::Postprocess,
            Step::Completed,
            Step::Err,
        ] {
            let bytes = step.to_bytes();
            assert_eq!(Step::from_bytes(&bytes, false).unwrap(), step);
        }
        assert!(Step::from_bits(3).is_err());
    }
}
