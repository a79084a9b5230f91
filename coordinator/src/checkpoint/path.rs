use std::path::PathBuf;

use crate::error::{Result, TrainErr};

/// Maps a global step to the checkpoint path of that step.
#[derive(Debug, Clone)]
pub struct CheckpointPath {
    template: String,
    writer: bool,
}

impl CheckpointPath {
    /// Creates a new `CheckpointPath`.
    ///
    /// # Arguments
    /// * `template` - A path with a `{}` placeholder for the global step.
    /// * `writer` - Whether this replica is the one writing checkpoints.
    ///
    /// # Returns
    /// The path mapping or a `Config` error if the placeholder is missing.
    pub fn new(template: impl Into<String>, writer: bool) -> Result<Self> {
        let template = template.into();

        if !template.contains("{}") {
            return Err(TrainErr::Config(format!(
                "checkpoint template '{template}' has no '{{}}' placeholder"
            )));
        }

        Ok(Self { template, writer })
    }

    pub fn for_step(&self, global_step: u64) -> PathBuf {
        PathBuf::from(self.template.replacen("{}", &global_step.to_string(), 1))
    }

    pub fn is_writer(&self) -> bool {
        self.writer
    }
}
