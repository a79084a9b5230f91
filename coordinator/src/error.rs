use std::{
    error::Error,
    fmt::{self, Display},
    io,
    path::PathBuf,
};

use machine_learning::MlErr;

use crate::schedule::ScheduleErr;

/// The result type used across the coordinator.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// The fatal errors a coordinator can stop with.
#[derive(Debug)]
pub enum TrainErr {
    /// The configuration is invalid, raised while initializing.
    Config(String),
    /// A batch couldn't be produced or moved to its device.
    Transfer(MlErr),
    /// A checkpoint couldn't be written or read back.
    Checkpoint { path: PathBuf, msg: String },
    /// The model or the optimizer rejected an operation.
    Model(MlErr),
    Io(io::Error),
}

impl TrainErr {
    pub(crate) fn checkpoint(path: impl Into<PathBuf>, msg: impl Display) -> Self {
        Self::Checkpoint {
            path: path.into(),
            msg: msg.to_string(),
        }
    }
}

impl Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainErr::Config(msg) => write!(f, "invalid configuration: {msg}"),
            TrainErr::Transfer(e) => write!(f, "failed to transfer batch: {e}"),
            TrainErr::Checkpoint { path, msg } => {
                write!(f, "checkpoint '{}': {msg}", path.display())
            }
            TrainErr::Model(e) => write!(f, "model error: {e}"),
            TrainErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainErr::Transfer(e) | TrainErr::Model(e) => Some(e),
            TrainErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrainErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ScheduleErr> for TrainErr {
    fn from(value: ScheduleErr) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<TrainErr> for io::Error {
    fn from(value: TrainErr) -> Self {
        match value {
            TrainErr::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}
