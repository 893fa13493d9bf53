//! Bounded worker pool for handler continuations.
//!
//! A fixed set of threads drains a FIFO queue behind a mutex + condvar pair.
//! The state machine guarantees at most one continuation per connection is in
//! flight; the pool itself only guarantees FIFO submission order and a clean
//! drain on shutdown.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct State {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

pub struct AsyncPool {
    shared: Arc<(Mutex<State>, Condvar)>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncPool {
    /// Spawns `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new((
            Mutex::new(State {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            Condvar::new(),
        ));

        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("async-worker-{i}"))
                .spawn(move || worker_loop(&shared))
                .expect("cannot spawn async worker thread");
            workers.push(handle);
        }

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Queues a job; returns false once the pool has been shut down.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let (lock, cv) = &*self.shared;
        let mut state = lock.lock().unwrap();
        if state.shutdown {
            return false;
        }
        state.jobs.push_back(Box::new(job));
        cv.notify_one();
        true
    }

    /// Waits for queued and in-flight jobs to finish, then joins the workers.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        let (lock, cv) = &*self.shared;
        {
            let mut state = lock.lock().unwrap();
            state.shutdown = true;
            cv.notify_all();
        }

        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for AsyncPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &(Mutex<State>, Condvar)) {
    let (lock, cv) = shared;
    loop {
        let job = {
            let mut state = lock.lock().unwrap();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = cv.wait(state).unwrap();
            }
        };

        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!("async job panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn jobs_run_fifo_on_one_worker() {
        let pool = AsyncPool::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..8 {
            let order = Arc::clone(&order);
            assert!(pool.submit(move || order.lock().unwrap().push(i)));
        }

        pool.shutdown();
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_drains_in_flight_jobs() {
        let pool = AsyncPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let done = Arc::clone(&done);
            pool.submit(move || {
                std::thread::sleep(Duration::from_millis(50));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn submissions_after_shutdown_are_rejected() {
        let pool = AsyncPool::new(1);
        pool.shutdown();
        assert!(!pool.submit(|| {}));
        // Second shutdown is a no-op.
        pool.shutdown();
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker() {
        let pool = AsyncPool::new(1);
        let done = Arc::new(AtomicUsize::new(0));

        pool.submit(|| panic!("boom"));
        let d = Arc::clone(&done);
        pool.submit(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });

        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
