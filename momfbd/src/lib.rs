//! Multi-object multi-frame blind deconvolution core.
//!
//! Many short-exposure frames of one scene, seen through several optical
//! channels, are jointly deconvolved: the solver estimates wavefront-mode
//! coefficients and a latent sharp image per object, with linear equality
//! constraints tying common wavefront modes across frames and objects.
//!
//! The crate owns the in-memory data model (objects, channels, subimages),
//! the constraint engine with its null-space reduction, the per-patch
//! optimizer, the patch pipeline and the job state machine. Networking and
//! the worker loop live in the `dispatch` crate; pupils and mode bases come
//! from `optics`.

pub mod channel;
pub mod constraints;
pub mod data;
pub mod error;
pub mod fourier;
pub mod job;
pub mod object;
pub mod output;
pub mod patch;
pub mod solver;
pub mod step;
pub mod subimage;

pub use channel::{Channel, ChannelInput};
pub use constraints::{ConstraintKind, Constraints};
pub use data::{ChannelPatch, ObjectPatch, ObjectResult, PatchData};
pub use error::MomfbdError;
pub use job::{FrameSource, JobContext, MomfbdJob};
pub use object::Object;
pub use output::Container;
pub use solver::{SolveSummary, Solver};
pub use step::Step;
pub use subimage::SubImage;
