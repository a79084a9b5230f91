mod file;
mod path;

use std::path::{Path, PathBuf};

use machine_learning::{RunPosition, model::Parameter, optimization::OptimizerState};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

pub use file::FileCheckpointStore;
pub use path::CheckpointPath;

use crate::{config::Hparams, error::Result};

/// The exact position of a `ChaCha8Rng` stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    pub seed: [u8; 32],
    pub stream: u64,
    pub word_pos: u128,
}

impl RngState {
    pub fn capture(rng: &ChaCha8Rng) -> Self {
        Self {
            seed: rng.get_seed(),
            stream: rng.get_stream(),
            word_pos: rng.get_word_pos(),
        }
    }

    /// Rebuilds a generator that continues exactly where the captured one was.
    pub fn restore(&self) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::from_seed(self.seed);
        rng.set_stream(self.stream);
        rng.set_word_pos(self.word_pos);
        rng
    }
}

/// Everything needed to continue a run.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub params: Vec<Parameter>,
    /// Model state the optimizer doesn't own, see `Model::buffers`.
    pub buffers: Vec<Parameter>,
    pub optimizer: OptimizerState,
    pub rng: RngState,
    /// The position of the first batch not yet trained on.
    pub position: RunPosition,
    pub optim_step: u64,
    pub hparams: Hparams,
}

/// Persists and restores `CheckpointRecord`s.
pub trait CheckpointStore: Send + Sync {
    /// Loads the checkpoint at `path`.
    ///
    /// # Returns
    /// `None` when `path` is `None`, meaning a fresh run.
    ///
    /// # Errors
    /// A `Checkpoint` error if the file can't be read or decoded.
    fn load(&self, path: Option<&Path>) -> Result<Option<CheckpointRecord>>;

    /// Writes `record` to `path`, replacing whatever was there.
    ///
    /// # Returns
    /// The path that was written.
    fn save(&self, path: &Path, record: &CheckpointRecord) -> Result<PathBuf>;
}
