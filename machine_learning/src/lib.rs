mod batch;
pub mod diagnostics;
pub mod error;
pub mod model;
pub mod mulaw;
pub mod optimization;
pub mod source;

pub use batch::{Batch, Device, RunPosition};
pub use error::{MlErr, Result};
