//! General-purpose CPU thread pool
//!
//! Runs CPU-side work (image decode, shader compilation) off the main thread.
//! GPU work never runs here; each device has its own worker thread in
//! [`crate::render::device::LogicalDevice`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam_channel::{Receiver, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Retire,
}

/// Handle to the result of a job submitted to the [`ThreadPool`]
pub struct JobHandle<R> {
    receiver: Receiver<R>,
}

impl<R> JobHandle<R> {
    /// Block until the job has produced its result
    ///
    /// Returns `None` if the job panicked or the pool shut down before running it.
    pub fn wait(self) -> Option<R> {
        self.receiver.recv().ok()
    }

    /// Return the result if the job has already finished
    pub fn try_take(&self) -> Option<R> {
        self.receiver.try_recv().ok()
    }
}

/// Pool of named worker threads fed from one shared queue
///
/// The pool can be resized after construction; retiring workers finish the
/// jobs queued ahead of their retirement first.
pub struct ThreadPool {
    sender: Option<Sender<Message>>,
    receiver: Receiver<Message>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    size: AtomicUsize,
    spawned: AtomicUsize,
    pending: Arc<AtomicUsize>,
}

impl ThreadPool {
    /// Spawn a pool with `threads` workers (at least one)
    pub fn new(threads: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Message>();
        let pool = Self {
            sender: Some(sender),
            receiver,
            workers: Mutex::new(Vec::new()),
            size: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
            pending: Arc::new(AtomicUsize::new(0)),
        };
        pool.resize(threads);
        log::debug!("Thread pool started with {} workers", pool.thread_count());
        pool
    }

    /// Pool size for a machine: a fraction of hardware concurrency minus the GPU workers
    pub fn recommended_size(pool_fraction: f32, reserved_gpu_workers: usize, min_threads: usize) -> usize {
        let hardware = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::size_for(hardware, pool_fraction, reserved_gpu_workers, min_threads)
    }

    fn size_for(hardware: usize, pool_fraction: f32, reserved_gpu_workers: usize, min_threads: usize) -> usize {
        let share = (hardware as f32 * pool_fraction).floor() as usize;
        share.saturating_sub(reserved_gpu_workers).max(min_threads.max(1))
    }

    /// Grow or shrink to `threads` workers (at least one)
    pub fn resize(&self, threads: usize) {
        let target = threads.max(1);
        let Some(sender) = &self.sender else {
            return;
        };
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let (finished, running): (Vec<_>, Vec<_>) = workers.drain(..).partition(|w| w.is_finished());
        *workers = running;
        for worker in finished {
            let _ = worker.join();
        }

        let current = self.size.load(Ordering::Acquire);
        if target > current {
            for _ in current..target {
                let index = self.spawned.fetch_add(1, Ordering::AcqRel);
                match self.spawn_worker(index) {
                    Ok(handle) => {
                        workers.push(handle);
                        self.size.fetch_add(1, Ordering::AcqRel);
                    }
                    Err(e) => log::error!("Failed to spawn cpu-pool-{}: {}", index, e),
                }
            }
        } else {
            for _ in target..current {
                if sender.send(Message::Retire).is_ok() {
                    self.size.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
        if target != current {
            log::debug!("Thread pool resized from {} to {} workers", current, self.thread_count());
        }
    }

    fn spawn_worker(&self, index: usize) -> std::io::Result<thread::JoinHandle<()>> {
        let receiver = self.receiver.clone();
        let pending = Arc::clone(&self.pending);
        thread::Builder::new()
            .name(format!("cpu-pool-{}", index))
            .spawn(move || {
                for message in receiver.iter() {
                    let Message::Run(job) = message else {
                        break;
                    };
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                        log::error!("Thread pool job panicked on cpu-pool-{}", index);
                    }
                    pending.fetch_sub(1, Ordering::AcqRel);
                }
            })
    }

    /// Number of worker threads
    pub fn thread_count(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Jobs queued or running
    pub fn pending_jobs(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Queue a job and get a handle to its result
    pub fn spawn<R, F>(&self, job: F) -> JobHandle<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let wrapped: Job = Box::new(move || {
            let _ = result_tx.send(job());
        });

        if let Some(sender) = &self.sender {
            self.pending.fetch_add(1, Ordering::AcqRel);
            if sender.send(Message::Run(wrapped)).is_err() {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                log::warn!("Thread pool is shut down; job dropped");
            }
        }

        JobHandle { receiver: result_rx }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel lets workers finish queued jobs and exit
        self.sender.take();
        let workers = std::mem::take(self.workers.get_mut().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_return_results() {
        let pool = ThreadPool::new(2);
        let handles: Vec<_> = (0..8).map(|i| pool.spawn(move || i * i)).collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(results, vec![0, 1, 4, 9, 16, 25, 36, 49]);
    }

    #[test]
    fn test_panicking_job_does_not_kill_pool() {
        let pool = ThreadPool::new(1);
        let failed = pool.spawn(|| -> u32 { panic!("boom") });
        assert!(failed.wait().is_none());
        assert_eq!(pool.spawn(|| 7).wait(), Some(7));
    }

    #[test]
    fn test_size_reserves_gpu_workers() {
        assert_eq!(ThreadPool::size_for(16, 0.75, 2, 1), 10);
        assert_eq!(ThreadPool::size_for(2, 0.5, 4, 1), 1);
        assert_eq!(ThreadPool::size_for(8, 1.0, 0, 3), 8);
        assert_eq!(ThreadPool::size_for(1, 0.5, 0, 0), 1);
    }

    #[test]
    fn test_drop_drains_queued_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(1);
            for _ in 0..16 {
                let counter = Arc::clone(&counter);
                pool.spawn(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_resize_grows_and_shrinks() {
        let pool = ThreadPool::new(1);
        pool.resize(4);
        assert_eq!(pool.thread_count(), 4);
        let handles: Vec<_> = (0..8).map(|i| pool.spawn(move || i + 1)).collect();
        assert_eq!(handles.into_iter().filter_map(JobHandle::wait).sum::<i32>(), 36);

        pool.resize(2);
        assert_eq!(pool.thread_count(), 2);
        assert_eq!(pool.spawn(|| 5).wait(), Some(5));

        pool.resize(0);
        assert_eq!(pool.thread_count(), 1);
        assert_eq!(pool.spawn(|| 9).wait(), Some(9));
    }
}
