use thiserror::Error;

/// Errors raised by the restoration core.
#[derive(Error, Debug)]
pub enum MomfbdError {
    /// Invalid or contradictory configuration; one message per cause.
    #[error("configuration rejected:\n{}", .0.join("\n"))]
    Config(Vec<String>),

    /// Calibration or input data missing or mis-sized.
    #[error("input data error: {0}")]
    Io(String),

    /// The numerics broke down (singular null-space, NaN gradient, ...).
    #[error("numerical failure: {0}")]
    Numeric(String),

    /// A patch allocation or buffer was refused.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// Processing was cancelled; no results follow.
    #[error("cancelled")]
    Cancelled,

    /// Pupil or mode construction failed.
    #[error(transparent)]
    Optics(#[from] optics::OpticsError),

    /// A record failed to pack or unpack.
    #[error(transparent)]
    Wire(#[from] shared::WireError),
}

impl MomfbdError {
    /// Single-message configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(vec![msg.into()])
    }
}
