use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    UnknownParameter {
        name: String,
    },
    EmptyBatch,
    Unsupported(&'static str),
    Audio {
        path: String,
        msg: String,
    },
    Io(io::Error),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch in {what}, got {got} and expected {expected}"
            ),
            MlErr::UnknownParameter { name } => {
                write!(f, "The model has no parameter named '{name}'")
            }
            MlErr::EmptyBatch => f.write_str("The batch has no items"),
            MlErr::Unsupported(what) => write!(f, "Unsupported operation: {what}"),
            MlErr::Audio { path, msg } => write!(f, "Failed to process audio '{path}': {msg}"),
            MlErr::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MlErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<hound::Error> for MlErr {
    fn from(value: hound::Error) -> Self {
        match value {
            hound::Error::IoError(e) => Self::Io(e),
            other => Self::Audio {
                path: String::new(),
                msg: other.to_string(),
            },
        }
    }
}
