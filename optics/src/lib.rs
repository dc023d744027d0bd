//! Pupil and wavefront-mode generation for the restoration core.
//!
//! Provides the telescope pupil mask with its support bookkeeping, Zernike
//! and Karhunen-Loève mode bases, pupil-normalized mode sets, and the
//! descriptor-keyed caches that let every patch share one generated set.

pub mod error;
pub mod karhunen;
pub mod modeset;
pub mod pupil;
pub mod zernike;

pub use error::OpticsError;
pub use karhunen::KarhunenLoeve;
pub use modeset::{get_modes, get_pupil, ModeInfo, ModeSet};
pub use pupil::Pupil;
