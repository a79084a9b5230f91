mod memory;
mod shard;
mod wav;

pub use memory::{InMemorySource, SyntheticSpec};
pub use shard::ShardSpec;
pub use wav::{FEATURES, HOP, frame_features, load_wav_dir};

use crate::{Batch, Result, RunPosition};

/// A lazy, single pass sequence of batches.
pub type BatchIter = Box<dyn Iterator<Item = Result<Batch>> + Send>;

/// Produces the batches a run trains on.
///
/// Sources are factories: every call to `shard` starts a fresh iteration, which lets the same
/// source feed several replicas and a codebook warm-up pass independently.
pub trait BatchSource: Send + Sync {
    /// The number of batches a full epoch holds, before sharding.
    fn batches_per_epoch(&self) -> usize;

    /// The sample rate of the signals, in Hz.
    fn sample_rate(&self) -> u32;

    /// Starts iterating the batches owned by `shard`, resuming at `start`.
    ///
    /// # Arguments
    /// * `shard` - Which replica's slice of each epoch to produce.
    /// * `start` - The first position to produce, batches before it are skipped.
    ///
    /// # Returns
    /// An iterator over the batches, each tagged with its `RunPosition`.
    fn shard(&self, shard: ShardSpec, start: RunPosition) -> BatchIter;
}

impl<S: BatchSource + ?Sized> BatchSource for std::sync::Arc<S> {
    fn batches_per_epoch(&self) -> usize {
        (**self).batches_per_epoch()
    }

    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }

    fn shard(&self, shard: ShardSpec, start: RunPosition) -> BatchIter {
        (**self).shard(shard, start)
    }
}
