use std::{num::NonZeroUsize, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::Barrier;

/// How the per replica contributions of a reduction are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combine {
    Sum,
    Mean,
    /// Every replica receives the master's contribution.
    Root,
}

impl Combine {
    /// Combines `contributions` elementwise, visiting them in rank order.
    ///
    /// A contribution shorter than the longest one counts as zero past its end.
    pub fn combine(self, contributions: &[Vec<f32>]) -> Vec<f32> {
        if self == Combine::Root {
            return contributions.first().cloned().unwrap_or_default();
        }

        let len = contributions.iter().map(Vec::len).max().unwrap_or(0);
        let mut out = vec![0.0; len];

        for contribution in contributions {
            out.iter_mut()
                .zip(contribution)
                .for_each(|(acc, v)| *acc += v);
        }

        if self == Combine::Mean && !contributions.is_empty() {
            let n = contributions.len() as f32;
            out.iter_mut().for_each(|v| *v /= n);
        }

        out
    }
}

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f32>>>,
    result: Mutex<Vec<f32>>,
}

/// One replica's endpoint into a lock-step reduction group.
#[derive(Clone)]
pub struct ReplicaHandle {
    rank: usize,
    size: NonZeroUsize,
    shared: Arc<Shared>,
}

/// Creates the handles of a reduction group, one per replica, in rank order.
///
/// # Arguments
/// * `size` - The number of cooperating replicas.
pub fn group(size: NonZeroUsize) -> Vec<ReplicaHandle> {
    let shared = Arc::new(Shared {
        barrier: Barrier::new(size.get()),
        slots: Mutex::new(vec![Vec::new(); size.get()]),
        result: Mutex::new(Vec::new()),
    });

    (0..size.get())
        .map(|rank| ReplicaHandle {
            rank,
            size,
            shared: Arc::clone(&shared),
        })
        .collect()
}

impl ReplicaHandle {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> NonZeroUsize {
        self.size
    }

    /// Reduces `local` with the contributions of every other replica.
    ///
    /// No replica returns until all of them have contributed. A replica that never calls in
    /// leaves the rest waiting forever.
    ///
    /// # Arguments
    /// * `combine` - The combine function, must be the same on every replica.
    /// * `local` - This replica's contribution.
    ///
    /// # Returns
    /// The combined value, identical on every replica.
    pub async fn reduce(&self, combine: Combine, local: &[f32]) -> Vec<f32> {
        if self.size.get() == 1 {
            return combine.combine(&[local.to_vec()]);
        }

        self.shared.slots.lock()[self.rank] = local.to_vec();

        if self.shared.barrier.wait().await.is_leader() {
            let combined = combine.combine(&self.shared.slots.lock());
            *self.shared.result.lock() = combined;
        }

        self.shared.barrier.wait().await;
        self.shared.result.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_uniform_input_is_identity() {
        for n in 1..6 {
            let contributions = vec![vec![0.3, -2.0]; n];
            let out = Combine::Mean.combine(&contributions);
            assert!((out[0] - 0.3).abs() < 1e-6);
            assert!((out[1] + 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn sum_ignores_replica_order() {
        let a = vec![vec![1.0], vec![2.0], vec![4.0]];
        let b = vec![vec![4.0], vec![1.0], vec![2.0]];
        assert_eq!(Combine::Sum.combine(&a), vec![7.0]);
        assert_eq!(Combine::Sum.combine(&a), Combine::Sum.combine(&b));
    }

    #[test]
    fn root_takes_the_first_contribution() {
        let contributions = vec![vec![1.0, 2.0], vec![5.0, 6.0]];
        assert_eq!(Combine::Root.combine(&contributions), vec![1.0, 2.0]);
        assert!(Combine::Root.combine(&[]).is_empty());
    }

    #[tokio::test]
    async fn single_replica_is_a_no_op() {
        let handle = group(NonZeroUsize::MIN).remove(0);
        assert_eq!(handle.reduce(Combine::Mean, &[0.25]).await, vec![0.25]);
        assert_eq!(handle.reduce(Combine::Sum, &[0.25]).await, vec![0.25]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn replicas_agree_on_the_reduction() {
        let handles = group(NonZeroUsize::new(3).unwrap());

        let tasks: Vec<_> = handles
            .into_iter()
            .map(|h| {
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    for round in 0..5 {
                        let local = [(h.rank() + round) as f32];
                        seen.push(h.reduce(Combine::Sum, &local).await[0]);
                    }
                    seen
                })
            })
            .collect();

        for task in tasks {
            // ranks 0, 1, 2 plus 3 * round
            assert_eq!(task.await.unwrap(), vec![3.0, 6.0, 9.0, 12.0, 15.0]);
        }
    }
}
