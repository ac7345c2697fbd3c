//! The timer wheel: a monotonic-deadline min-heap drained by a dedicated
//! thread, used for `sleep` and for the timeout half of an I/O park (§4.5).
//!
//! Generalises `mo-gc`'s single background-thread-with-a-mutex pattern
//! (used there for the mature collector's housekeeping) into a min-heap of
//! deadlines guarded by a `parking_lot` mutex/condvar pair.
//!
//! Cancellation needs no structural removal: a park generation is bumped by
//! whichever caller cancels it, and a stale generation popped off the heap
//! is simply discarded by `TimeoutSink::on_timeout`'s own generation check.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Delivers a fired deadline back to whoever asked for it (the scheduler).
/// `generation` lets the caller recognise and discard a stale timer entry
/// for a park that was already won by a race with I/O readiness or explicit
/// cancellation.
pub trait TimeoutSink: Send + Sync {
    fn on_timeout(&self, process_id: u64, generation: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    deadline: Instant,
    process_id: u64,
    generation: u64,
}

// Reversed so a `BinaryHeap` (a max-heap) pops the earliest deadline first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct State {
    heap: Mutex<BinaryHeap<Entry>>,
    wake: Condvar,
    shutdown: AtomicBool,
}

/// A monotonic timer wheel with one background thread draining it.
pub struct TimerWheel {
    state: Arc<State>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerWheel {
    #[must_use]
    pub fn new(sink: Arc<dyn TimeoutSink>) -> Arc<Self> {
        let state = Arc::new(State {
            heap: Mutex::new(BinaryHeap::new()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let thread_state = Arc::clone(&state);
        let thread = std::thread::Builder::new()
            .name("nimbus-timer".into())
            .spawn(move || run(&thread_state, sink.as_ref()))
            .expect("spawning the timer thread");

        Arc::new(TimerWheel {
            state,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Schedules a wakeup `after` from now for `process_id`, tagged with
    /// `generation` so a later cancellation can invalidate it without
    /// touching the heap.
    pub fn sleep(&self, after: Duration, process_id: u64, generation: u64) {
        let deadline = Instant::now() + after;
        let mut heap = self.state.heap.lock();
        let wake_sooner = heap.peek().is_none_or(|top| deadline < top.deadline);
        heap.push(Entry { deadline, process_id, generation });
        drop(heap);
        if wake_sooner {
            self.state.wake.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.state.shutdown.store(true, AtomicOrdering::Release);
        self.state.wake.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run(state: &State, sink: &dyn TimeoutSink) {
    loop {
        let mut heap = state.heap.lock();
        if state.shutdown.load(AtomicOrdering::Acquire) {
            return;
        }

        match heap.peek().copied() {
            None => {
                state.wake.wait(&mut heap);
            }
            Some(next) => {
                let now = Instant::now();
                if next.deadline <= now {
                    heap.pop();
                    drop(heap);
                    sink.on_timeout(next.process_id, next.generation);
                } else {
                    let _ = state.wake.wait_for(&mut heap, next.deadline - now);
                }
            }
        }
    }
}
