//! The blocking-call offload pool (§4.6): threads created on demand (up to
//! a cap) to run operations the interpreter can't execute without blocking
//! a worker, e.g. a synchronous FFI call or filesystem operation. Requests
//! beyond the cap queue for the next thread to free up.
//!
//! Grounded on the same on-demand-thread-creation idea `mo-gc`'s block pool
//! uses for block chunks (grow lazily, cap the total, never shrink back):
//! here the "chunk" is a worker thread instead of a block of heap memory.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct State {
    queue: Mutex<Vec<Job>>,
    wake: Condvar,
    live_threads: Mutex<usize>,
    cap: usize,
    shutdown: Mutex<bool>,
}

/// An unbounded queue of blocking jobs drained by up to `cap` worker
/// threads, spun up lazily as load demands.
pub struct BlockingPool {
    state: Arc<State>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockingPool {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        BlockingPool {
            state: Arc::new(State {
                queue: Mutex::new(Vec::new()),
                wake: Condvar::new(),
                live_threads: Mutex::new(0),
                cap: cap.max(1),
                shutdown: Mutex::new(false),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Queues `job`, spawning a new thread to help drain it if the pool
    /// hasn't reached its cap yet.
    pub fn submit(&self, job: Job) {
        self.state.queue.lock().unwrap().push(job);
        self.state.wake.notify_one();

        let mut live = self.state.live_threads.lock().unwrap();
        if *live < self.state.cap {
            *live += 1;
            drop(live);
            let state = Arc::clone(&self.state);
            let handle = std::thread::Builder::new()
                .name("nimbus-blocking".into())
                .spawn(move || run(&state))
                .expect("spawning a blocking-pool thread");
            self.threads.lock().unwrap().push(handle);
        }
    }

    pub fn shutdown(&self) {
        *self.state.shutdown.lock().unwrap() = true;
        self.state.wake.notify_all();
        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for BlockingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(state: &State) {
    loop {
        let mut queue = state.queue.lock().unwrap();
        loop {
            if *state.shutdown.lock().unwrap() && queue.is_empty() {
                return;
            }
            if let Some(job) = queue.pop() {
                drop(queue);
                job();
                break;
            }
            queue = state.wake.wait(queue).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn runs_submitted_jobs() {
        let pool = BlockingPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let done = Arc::clone(&done);
            pool.submit(Box::new(move || {
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while done.load(Ordering::SeqCst) < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(done.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn caps_thread_count() {
        let pool = BlockingPool::new(3);
        for _ in 0..20 {
            pool.submit(Box::new(|| {}));
        }
        std::thread::sleep(Duration::from_millis(100));
        assert!(*pool.state.live_threads.lock().unwrap() <= 3);
    }
}
