//! Per-process garbage collection: root enumeration, parallel mark, sweep
//! (§4.3).
//!
//! A process's heap is always collected while that process is suspended —
//! the scheduler guarantees exclusive access, so unlike `mo-gc`'s
//! background-thread `ParHeap` collector this needs no handshake with a
//! running mutator. What's generalised from `mo-gc` is the shape of a
//! cycle: enumerate roots, trace, sweep, report stats; what's new is that
//! tracing itself is parallelised (`tracer`) and sweep/promotion is the
//! per-generation logic already in `crate::heap`.

pub mod stats;
pub mod tracer;

pub use stats::{GcStats, Generation, LogStatsLogger, StatsLogger};

use std::time::Instant;

use crate::heap::{MatureSweepStats, YoungSweepStats};
use crate::process::Process;
use crate::value::Reference;

/// Roots common to both young and mature cycles: the register file (which
/// covers every live frame's window, not just the topmost), each frame's
/// closure captures, pending mailbox messages, and cached inline-cache
/// receiver classes.
fn common_roots(process: &Process) -> Vec<Reference> {
    let mut roots: Vec<Reference> = process.registers.clone();
    for frame in &process.frames {
        roots.extend(frame.captures.iter().copied());
    }
    roots.extend(process.mailbox.pending_messages());
    roots.extend(process.inline_cache.cached_classes());
    roots
}

/// Runs a young collection: roots plus the remembered set (mature objects
/// that may point into the young generation), trace, then sweep/promote.
/// Mature objects are not traced into, per §4.3's "mature fields are not
/// traversed" for a young cycle.
pub fn young_cycle(
    process: &mut Process,
    threads: usize,
    logger: &dyn StatsLogger,
) -> YoungSweepStats {
    let started = Instant::now();
    let mut roots = common_roots(process);
    roots.extend(process.heap.remembered_set().iter().copied());

    let marked = tracer::mark(roots, threads);
    let stats = process.heap.sweep_young();

    logger.record(&GcStats {
        generation: Generation::Young,
        process_id: process.id,
        objects_marked: marked,
        objects_reclaimed: stats.dropped,
        blocks_reclaimed: stats.blocks_reclaimed,
        blocks_examined: stats.blocks_examined,
        objects_promoted: stats.promoted,
        pause: started.elapsed(),
    });

    process.pending_finalizers.extend(process.heap.drain_finalizer_queue());
    stats
}

/// Runs a mature collection: same shape, but mature objects are the trace
/// roots' terminus rather than young ones, and there's no promotion.
pub fn mature_cycle(
    process: &mut Process,
    threads: usize,
    logger: &dyn StatsLogger,
) -> MatureSweepStats {
    let started = Instant::now();
    let roots = common_roots(process);

    let marked = tracer::mark(roots, threads);
    let stats = process.heap.sweep_mature();

    logger.record(&GcStats {
        generation: Generation::Mature,
        process_id: process.id,
        objects_marked: marked,
        objects_reclaimed: stats.dropped,
        blocks_reclaimed: stats.blocks_reclaimed,
        blocks_examined: stats.blocks_examined,
        objects_promoted: 0,
        pause: started.elapsed(),
    });

    process.pending_finalizers.extend(process.heap.drain_finalizer_queue());
    stats
}
