//! Per-cycle collection statistics and the logging sink for them (§4.3,
//! §9.1). Mirrors `mo-gc`'s approach of keeping collection numbers as plain
//! data the embedder can do whatever it wants with, rather than printing
//! directly from the collector.

use std::time::Duration;

/// One GC cycle's numbers, for a single process.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    pub generation: Generation,
    pub process_id: u64,
    pub objects_marked: usize,
    pub objects_reclaimed: usize,
    pub blocks_reclaimed: usize,
    pub blocks_examined: usize,
    pub objects_promoted: usize,
    pub pause: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Generation {
    #[default]
    Young,
    Mature,
}

/// Where a VM reports GC statistics. The default implementation logs
/// structured events through the `log` facade (§9.1); an embedder wanting
/// metrics elsewhere implements this trait instead.
pub trait StatsLogger: Send + Sync {
    fn record(&self, stats: &GcStats);
}

/// Emits one `log::info!` event per cycle with every field, the same
/// shape the scheduler and reactor use for their own structured logging.
#[derive(Debug, Default)]
pub struct LogStatsLogger;

impl StatsLogger for LogStatsLogger {
    fn record(&self, stats: &GcStats) {
        log::info!(
            target: "nimbus_vm::gc",
            "process={} generation={:?} marked={} reclaimed={} promoted={} blocks={}/{} pause_us={}",
            stats.process_id,
            stats.generation,
            stats.objects_marked,
            stats.objects_reclaimed,
            stats.objects_promoted,
            stats.blocks_reclaimed,
            stats.blocks_examined,
            stats.pause.as_micros(),
        );
    }
}
