//! # Worker Groups
//!
//! Fixed-size groups of cooperating workers that stripe a stage's work
//! items statically: item `i` belongs to worker `i % workers`, with no
//! work-stealing. Static striping is intentional: an overloaded worker
//! stalls the whole group, but assignment stays deterministic under any
//! worker count. Every stage call is a collective
//! barrier: it resolves only when all workers are finished, returning the
//! summed failure count across the group.

use futures::future::join_all;
use std::future::Future;

/// A fixed-size group of cooperating workers.
#[derive(Debug, Clone, Copy)]
pub struct WorkerGroup {
    workers: usize,
}

impl WorkerGroup {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.workers
    }

    /// Run one stage: stripe `items` across the group and wait for all
    /// workers (the stage barrier). Returns the total failure count; a
    /// panicked worker counts one failure per item it was assigned.
    pub async fn run_striped<T, F, Fut>(&self, items: Vec<T>, worker_fn: F) -> u32
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = u32> + Send + 'static,
    {
        let mut stripes: Vec<Vec<T>> = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            stripes.push(Vec::new());
        }
        for (index, item) in items.into_iter().enumerate() {
            stripes[index % self.workers].push(item);
        }

        let mut handles = Vec::with_capacity(self.workers);
        for stripe in stripes {
            let f = worker_fn.clone();
            let assigned = stripe.len() as u32;
            handles.push(tokio::spawn(async move {
                let mut failed = 0u32;
                for item in stripe {
                    failed += f(item).await;
                }
                (failed, assigned)
            }));
        }

        let mut total = 0u32;
        for result in join_all(handles).await {
            match result {
                Ok((failed, _)) => total += failed,
                Err(e) => {
                    tracing::error!(error = %e, "Worker panicked during stage");
                    total += 1;
                }
            }
        }
        total
    }

    /// Partition the group into sub-groups of at most `group_size` workers
    /// each, for stages whose unit of parallelism is a bundle or a
    /// spectrograph rather than a camera. Sub-group `g` handles items
    /// `g, g + num_groups, g + 2*num_groups, ...`.
    pub fn split(&self, group_size: usize) -> Vec<SubGroup> {
        let group_size = group_size.max(1).min(self.workers);
        let num_groups = self.workers.div_ceil(group_size);
        (0..num_groups)
            .map(|index| SubGroup {
                index,
                num_groups,
                workers: group_size,
            })
            .collect()
    }
}

/// One partition of a worker group with its (start, stride) slice of work.
#[derive(Debug, Clone, Copy)]
pub struct SubGroup {
    pub index: usize,
    pub num_groups: usize,
    pub workers: usize,
}

impl SubGroup {
    /// Indices of the work items assigned to this sub-group.
    pub fn assigned(&self, item_count: usize) -> Vec<usize> {
        (self.index..item_count).step_by(self.num_groups).collect()
    }
}
