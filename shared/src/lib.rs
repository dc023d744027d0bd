//! Common types for the restoration pipeline.
//!
//! Holds what every other crate needs to agree on: the wire codec used on the
//! master/worker links and in the output container, small geometry value
//! types, and the flat configuration records the core consumes after parsing.

pub mod cfg;
pub mod geometry;
pub mod wire;

pub use cfg::{
    ChannelCfg, FillPixMethod, GlobalCfg, GradientMethod, JobCfg, ModeBasis, ObjectCfg,
    ObjectSetup, OutputDataType, RunFlags, SaveFlags, StepMethod,
};
pub use geometry::{Point16, PointF, Region};
pub use wire::{seq_size, str_size, Reader, Record, WireError, Writer};
