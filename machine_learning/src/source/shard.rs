use std::num::NonZeroUsize;

/// The slice of every epoch a replica observes.
///
/// Batches are dealt round-robin: replica `rank` owns the batch indices `i` with
/// `i % num_replicas == rank`. The trailing batches that would leave replicas with unequal
/// counts are dropped, so every replica sees the same number of batches per epoch and reaches
/// the same reduction points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub rank: usize,
    pub num_replicas: NonZeroUsize,
}

impl ShardSpec {
    /// Creates a new `ShardSpec`.
    ///
    /// # Panics
    /// If `rank` is not below `num_replicas`.
    pub fn new(rank: usize, num_replicas: NonZeroUsize) -> Self {
        assert!(rank < num_replicas.get(), "rank out of range");
        Self { rank, num_replicas }
    }

    /// The shard of a single replica run, which owns every batch.
    pub fn single() -> Self {
        Self {
            rank: 0,
            num_replicas: NonZeroUsize::MIN,
        }
    }

    /// The number of batch indices per epoch every replica can use.
    #[inline]
    pub fn usable(self, batches_per_epoch: usize) -> usize {
        let n = self.num_replicas.get();
        batches_per_epoch / n * n
    }

    /// Whether this shard owns the batch at `index` in an epoch of `batches_per_epoch`.
    #[inline]
    pub fn owns(self, index: usize, batches_per_epoch: usize) -> bool {
        index < self.usable(batches_per_epoch) && index % self.num_replicas.get() == self.rank
    }

    /// The first batch index at or after `index` owned by this shard, if any in the epoch.
    pub fn first_owned_from(self, index: usize, batches_per_epoch: usize) -> Option<usize> {
        let n = self.num_replicas.get();
        let offset = (self.rank + n - index % n) % n;
        let first = index + offset;
        (first < self.usable(batches_per_epoch)).then_some(first)
    }

    /// How many batches this shard sees per epoch.
    #[inline]
    pub fn batches_per_epoch(self, batches_per_epoch: usize) -> usize {
        self.usable(batches_per_epoch) / self.num_replicas.get()
    }
}
