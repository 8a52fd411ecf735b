use std::path::PathBuf;

/// Errors returned while building schedules, graphs and training pairs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid scheduler, builder or generator parameters.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("timestep {timestep} out of range for a schedule of {timesteps} steps")]
    TimestepOutOfRange { timestep: usize, timesteps: usize },

    #[error("expected a tensor of shape {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<i64>, got: Vec<i64> },

    #[error("index {index} out of range for {len} source images")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("error loading image {path:?}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: tch::TchError,
    },

    #[error(transparent)]
    Torch(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn config_error<T>(msg: impl Into<String>) -> Result<T> {
    Err(Error::Configuration(msg.into()))
}
