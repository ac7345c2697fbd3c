//! Parallel mark phase: a scoped pool of worker threads drains a shared
//! work-stealing deque of roots, marking reachable objects and scheduling
//! their children, until no work remains anywhere (§4.3).
//!
//! Generalises `mo-gc`'s single-threaded mark-sweep walk the way Inko's
//! `gc::tracer` generalises it into a deque-backed pool: a global
//! `Injector` seeded with roots, one local `Worker` per thread, and
//! in-order stealing from peers when both the local queue and the
//! injector run dry.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_deque::{Injector, Steal, Stealer, Worker};

use crate::value::Reference;

/// Marks every object reachable from `roots`, tracing into `header.class`
/// and each payload's own fields. Objects already marked are not
/// re-visited or re-traced, so cycles terminate naturally.
///
/// `threads` is clamped to at least 1; the caller (a stop-the-world young
/// or mature cycle) picks it, typically `num_cpus::get()`.
#[must_use]
pub fn mark(roots: Vec<Reference>, threads: usize) -> usize {
    let threads = threads.max(1);
    let injector = Injector::new();
    let outstanding = AtomicUsize::new(roots.len());
    for root in roots {
        injector.push(root);
    }

    let workers: Vec<Worker<Reference>> = (0..threads).map(|_| Worker::new_fifo()).collect();
    let stealers: Vec<Stealer<Reference>> = workers.iter().map(Worker::stealer).collect();
    let marked = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for worker in workers {
            scope.spawn(|| trace_worker(worker, &injector, &stealers, &outstanding, &marked));
        }
    });

    marked.load(Ordering::Relaxed)
}

fn trace_worker(
    worker: Worker<Reference>,
    injector: &Injector<Reference>,
    stealers: &[Stealer<Reference>],
    outstanding: &AtomicUsize,
    marked: &AtomicUsize,
) {
    loop {
        let Some(reference) = pop_job(&worker, injector, stealers) else {
            if outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            std::hint::spin_loop();
            continue;
        };

        let Some(ptr) = reference.as_object_ptr() else {
            outstanding.fetch_sub(1, Ordering::AcqRel);
            continue;
        };
        // SAFETY: the owning process is suspended for the duration of the
        // collection cycle, so no mutator thread observes or mutates this
        // object concurrently; only the mark bit and age (both atomic) are
        // touched by sibling tracer threads.
        let header = unsafe { &(*ptr).header };
        if header.mark() {
            // Already marked by another tracer; don't re-trace its children.
            outstanding.fetch_sub(1, Ordering::AcqRel);
            continue;
        }
        marked.fetch_add(1, Ordering::Relaxed);

        let mut children = Vec::new();
        if header.class.is_heap_pointer() {
            children.push(header.class);
        }
        unsafe { (*ptr).data.trace(|child| children.push(child)) };

        outstanding.fetch_add(children.len(), Ordering::AcqRel);
        for child in children {
            worker.push(child);
        }
        outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Local queue first, then the global injector, then peers — in that
/// order, and in-order rather than randomised among peers, matching the
/// ordering this pattern is usually measured fastest with.
fn pop_job(
    worker: &Worker<Reference>,
    injector: &Injector<Reference>,
    stealers: &[Stealer<Reference>],
) -> Option<Reference> {
    if let Some(job) = worker.pop() {
        return Some(job);
    }

    loop {
        match injector.steal_batch_and_pop(worker) {
            Steal::Success(job) => return Some(job),
            Steal::Empty => break,
            Steal::Retry => {}
        }
    }

    for stealer in stealers {
        loop {
            match stealer.steal_batch_and_pop(worker) {
                Steal::Success(job) => return Some(job),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
    }

    None
}
