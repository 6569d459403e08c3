//! Splitting a test catalog across parallel workers.
//!
//! Test `i` of the catalog goes to partition `i mod N`. Partitioning happens
//! on the raw catalog, before bucketizing, so every worker groups and runs
//! its own share independently.
//!
//! # Example
//!
//! ```
//! use fleetrun::orchestrator::Scheduler;
//!
//! let scheduler = Scheduler::new(3);
//! let tests = vec!["T1", "T2", "T3", "T4", "T5", "T6", "T7"];
//!
//! let partitions = scheduler.partition(&tests);
//! assert_eq!(partitions[0], vec!["T1", "T4", "T7"]);
//! assert_eq!(partitions[1], vec!["T2", "T5"]);
//! assert_eq!(partitions[2], vec!["T3", "T6"]);
//! ```

/// Round-robin partitioner.
pub struct Scheduler {
    workers: usize,
}

impl Scheduler {
    /// Creates a scheduler for `workers` partitions. Values below 1 are clamped.
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Returns exactly `workers` partitions, in worker order.
    ///
    /// Partitions may be empty when there are fewer items than workers; the
    /// position of a partition is its worker index.
    pub fn partition<T: Clone>(&self, items: &[T]) -> Vec<Vec<T>> {
        let mut partitions: Vec<Vec<T>> = (0..self.workers).map(|_| Vec::new()).collect();
        for (i, item) in items.iter().enumerate() {
            partitions[i % self.workers].push(item.clone());
        }
        partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seven_tests_three_workers() {
        let tests: Vec<String> = (1..=7).map(|i| format!("T{}", i)).collect();
        let partitions = Scheduler::new(3).partition(&tests);

        let sizes: Vec<usize> = partitions.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 2, 2]);
        assert_eq!(partitions[0], vec!["T1", "T4", "T7"]);
        assert_eq!(partitions[1], vec!["T2", "T5"]);
        assert_eq!(partitions[2], vec!["T3", "T6"]);
    }

    #[test]
    fn test_partitions_cover_catalog_exactly_once() {
        let tests: Vec<usize> = (0..23).collect();
        for workers in 1..=6 {
            let partitions = Scheduler::new(workers).partition(&tests);
            assert_eq!(partitions.len(), workers);

            let mut seen: Vec<usize> = partitions.into_iter().flatten().collect();
            seen.sort_unstable();
            assert_eq!(seen, tests);
        }
    }

    #[test]
    fn test_more_workers_than_tests() {
        let partitions = Scheduler::new(4).partition(&["a", "b"]);
        assert_eq!(partitions.len(), 4);
        assert!(partitions[2].is_empty() && partitions[3].is_empty());
    }

    #[test]
    fn test_zero_workers_clamped() {
        let scheduler = Scheduler::new(0);
        assert_eq!(scheduler.workers(), 1);
        assert_eq!(scheduler.partition(&[1, 2, 3]), vec![vec![1, 2, 3]]);
    }
}
