//! Where the independent block fits of one iteration run.

use rayon::prelude::*;

/// Runs a batch of independent tasks and returns every result.
///
/// Result order is not part of the contract; callers key their outputs and
/// reduce them in key order.
pub trait PartitionExecutor: Sync {
    fn execute<T, R, F>(&self, tasks: Vec<T>, work: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync + Send;
}

/// Runs tasks one after another on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialExecutor;

impl PartitionExecutor for SequentialExecutor {
    fn execute<T, R, F>(&self, tasks: Vec<T>, work: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync + Send,
    {
        tasks.into_iter().map(work).collect()
    }
}

/// Runs tasks on a rayon pool: a dedicated one when a thread count is given,
/// otherwise the global pool.
#[derive(Debug, Default)]
pub struct RayonExecutor {
    pool: Option<rayon::ThreadPool>,
}

impl RayonExecutor {
    pub fn new(threads: Option<usize>) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = match threads {
            Some(n) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("agora-block-{i}"))
                    .build()?,
            ),
            None => None,
        };
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, rayon::ThreadPool::current_num_threads)
    }
}

impl PartitionExecutor for RayonExecutor {
    fn execute<T, R, F>(&self, tasks: Vec<T>, work: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync + Send,
    {
        let run = || -> Vec<R> { tasks.into_par_iter().map(&work).collect() };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executors_return_every_result() -> Result<(), rayon::ThreadPoolBuildError> {
        let tasks: Vec<u64> = (0..64).collect();
        let mut sequential = SequentialExecutor.execute(tasks.clone(), |x| x * x);
        let mut parallel = RayonExecutor::new(Some(3))?.execute(tasks, |x| x * x);
        sequential.sort_unstable();
        parallel.sort_unstable();
        assert_eq!(sequential, parallel);
        assert_eq!(parallel.len(), 64);
        Ok(())
    }

    #[test]
    fn dedicated_pool_reports_its_size() -> Result<(), rayon::ThreadPoolBuildError> {
        assert_eq!(RayonExecutor::new(Some(2))?.threads(), 2);
        Ok(())
    }
}
