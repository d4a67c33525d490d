//! Data-parallel "for each block" dispatch.
//!
//! Kernels hand the executor a rayon indexed parallel iterator over disjoint blocks of
//! their buffers plus a body to apply to each block. [`Sequential`] runs the blocks in
//! order on the calling thread, [`ThreadPoolExecutor`] fans them out to a bounded pool
//! and joins before returning.

use crate::error::{PixelSimError, Result};
use log::info;
use pixelsim_common::PixelOptions;
use rayon::iter::plumbing::{Producer, ProducerCallback};
use rayon::prelude::*;

/// Voxels per block handed to a worker. Kernels over flat buffers use
/// `BLOCK_VOXELS * n_species` elements per block.
pub const BLOCK_VOXELS: usize = 64;

/// Apply `body` to every item of `blocks`, blocking until all are done.
pub trait ParallelFor: Send + Sync {
    fn for_each<I, F>(&self, blocks: I, body: F)
    where
        I: IndexedParallelIterator,
        F: Fn(I::Item) + Sync + Send;

    /// Number of threads that may run blocks concurrently.
    fn n_threads(&self) -> usize;
}

/// Runs every block in order on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl ParallelFor for Sequential {
    fn for_each<I, F>(&self, blocks: I, body: F)
    where
        I: IndexedParallelIterator,
        F: Fn(I::Item) + Sync + Send,
    {
        // drive the producer directly, never entering a rayon pool
        blocks.with_producer(SerialCallback(body));
    }

    fn n_threads(&self) -> usize {
        1
    }
}

/// Consumes a producer as a plain iterator on the calling thread.
struct SerialCallback<F>(F);

impl<T, F: Fn(T)> ProducerCallback<T> for SerialCallback<F> {
    type Output = ();

    fn callback<P>(self, producer: P)
    where
        P: Producer<Item = T>,
    {
        producer.into_iter().for_each(self.0);
    }
}

/// Runs blocks on a dedicated rayon thread pool.
#[derive(Debug)]
pub struct ThreadPoolExecutor {
    pool: rayon::ThreadPool,
}

impl ThreadPoolExecutor {
    /// A pool of `max_threads` workers, 0 means one per available hardware thread.
    pub fn new(max_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_threads)
            .thread_name(|i| format!("pixelsim-worker-{}", i))
            .build()
            .map_err(|e| PixelSimError::ThreadPool(e.to_string()))?;
        Ok(ThreadPoolExecutor { pool })
    }
}

impl ParallelFor for ThreadPoolExecutor {
    fn for_each<I, F>(&self, blocks: I, body: F)
    where
        I: IndexedParallelIterator,
        F: Fn(I::Item) + Sync + Send,
    {
        self.pool.install(|| blocks.for_each(body));
    }

    fn n_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

/// The backend chosen at construction time.
#[derive(Debug)]
pub enum Executor {
    Sequential(Sequential),
    Pool(ThreadPoolExecutor),
}

impl Executor {
    pub fn from_options(options: &PixelOptions) -> Result<Self> {
        if options.enable_multithreading {
            let pool = ThreadPoolExecutor::new(options.max_threads)?;
            info!("Using {} worker threads.", pool.n_threads());
            Ok(Executor::Pool(pool))
        } else {
            Ok(Executor::Sequential(Sequential))
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Executor::Sequential(Sequential)
    }
}

impl ParallelFor for Executor {
    fn for_each<I, F>(&self, blocks: I, body: F)
    where
        I: IndexedParallelIterator,
        F: Fn(I::Item) + Sync + Send,
    {
        match self {
            Executor::Sequential(s) => s.for_each(blocks, body),
            Executor::Pool(p) => p.for_each(blocks, body),
        }
    }

    fn n_threads(&self) -> usize {
        match self {
            Executor::Sequential(s) => s.n_threads(),
            Executor::Pool(p) => p.n_threads(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn fill_with_block_index<E: ParallelFor>(exec: &E) -> Vec<usize> {
        let mut data = vec![0usize; 1000];
        exec.for_each(data.par_chunks_mut(7).enumerate(), |(b, chunk)| {
            chunk.iter_mut().for_each(|x| *x = b);
        });
        data
    }

    #[test]
    fn backends_agree() {
        let seq = fill_with_block_index(&Sequential);
        let pool = fill_with_block_index(&ThreadPoolExecutor::new(3).unwrap());
        assert_eq!(seq, pool);
        assert_eq!(seq[999], 999 / 7);
    }

    #[test]
    fn sequential_stays_on_calling_thread() {
        let caller = std::thread::current().id();
        let seen = Mutex::new(Vec::new());
        let data = vec![1.0f64; 4096];
        Sequential.for_each(data.par_chunks(16), |_| {
            seen.lock().unwrap().push(std::thread::current().id());
        });
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 256);
        assert!(seen.iter().all(|id| *id == caller));
    }

    #[test]
    fn sequential_visits_blocks_in_order_outside_any_pool() {
        let order = Mutex::new(Vec::new());
        let data = vec![0u8; 100];
        Sequential.for_each(data.par_chunks(10).enumerate(), |(b, _)| {
            assert!(rayon::current_thread_index().is_none());
            order.lock().unwrap().push(b);
        });
        assert_eq!(order.into_inner().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn executor_from_options() {
        let mut options = PixelOptions::default();
        assert_eq!(Executor::from_options(&options).unwrap().n_threads(), 1);
        options.enable_multithreading = true;
        options.max_threads = 2;
        assert_eq!(Executor::from_options(&options).unwrap().n_threads(), 2);
    }
}
