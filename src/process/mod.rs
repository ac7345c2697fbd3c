//! A process: its heap, register/call-frame stack, mailbox and status word.
//!
//! Generalises `mo-gc`'s single-mutator `AppThread` (one heap, one `Mutator`)
//! into one-heap-per-process, with the status word and mailbox this VM's
//! cooperative scheduler needs to park and resume processes (§3).

pub mod frame;
pub mod mailbox;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::block_pool::{BlockPool, PermanentSpace};
use crate::config::Config;
use crate::heap::ProcessHeap;
use crate::loader::Module;
use crate::value::Reference;

pub use frame::CallFrame;
pub use mailbox::Mailbox;

/// Monotonically increasing process identifiers.
pub type ProcessId = u64;

fn next_process_id() -> ProcessId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// The process status word (§3, §4.6). `Pinned` is tracked separately as a
/// nesting counter, not a `Status` variant, per the state machine note that
/// "Pinned is orthogonal".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Runnable,
    Running,
    WaitingForMessage,
    WaitingForIo,
    WaitingForTimeout,
    Terminating,
    Terminated,
}

/// Why a process is parked, so the reactor/timer/mailbox know how to wake
/// it and so a losing race (timeout vs. I/O) can be cancelled (§5).
#[derive(Debug, Clone)]
pub enum ParkReason {
    Io { fd: i32, generation: u64 },
    Timeout { generation: u64 },
    Message,
}

/// Outcome of a panic: the record carried to a watcher's mailbox or stderr
/// (§4.7, §7).
#[derive(Debug, Clone)]
pub struct PanicRecord {
    pub message: String,
    pub trace: Vec<String>,
}

/// A lightweight green process. Call frames, the mailbox and GC bookkeeping
/// live here; the scheduler and interpreter operate on this type without
/// reaching into another process's state (§3 invariant: no process observes
/// another's heap directly).
pub struct Process {
    pub id: ProcessId,
    pub heap: ProcessHeap,
    pub permanent: Arc<PermanentSpace>,
    pub frames: Vec<CallFrame>,
    pub registers: Vec<Reference>,
    pub mailbox: Mailbox,
    pub status: Status,
    pub park_reason: Option<ParkReason>,
    pub pin_count: u32,
    pub is_main: bool,
    pub reductions_remaining: usize,
    pub must_yield: bool,
    pub gc_generation: AtomicU32,
    pub panic_record: Option<PanicRecord>,
    pub inline_cache: crate::interpreter::InlineCacheTable,
    /// Objects a GC cycle found finalisable-but-unreachable. Run on this
    /// process's next scheduling, not during the collection itself (§4.3).
    pub pending_finalizers: Vec<Reference>,
}

impl Process {
    pub fn new(
        pool: Arc<BlockPool>,
        permanent: Arc<PermanentSpace>,
        config: Arc<Config>,
        is_main: bool,
    ) -> Self {
        let reductions = config.reductions;
        Process {
            id: next_process_id(),
            heap: ProcessHeap::new(pool, config),
            permanent,
            frames: Vec::new(),
            registers: vec![Reference::nil(); 64],
            mailbox: Mailbox::new(),
            status: Status::Runnable,
            park_reason: None,
            pin_count: 0,
            is_main,
            reductions_remaining: reductions,
            must_yield: false,
            gc_generation: AtomicU32::new(0),
            panic_record: None,
            inline_cache: crate::interpreter::InlineCacheTable::new(),
            pending_finalizers: Vec::new(),
        }
    }

    /// Pushes a new call frame whose register window starts at the current
    /// register-file length, growing it to fit (§4.7 register window,
    /// capped at 65 535 registers per method per §4.7).
    pub fn push_frame(
        &mut self,
        module: Arc<Module>,
        block_index: usize,
        register_base: usize,
        registers_needed: u16,
        return_register: Option<u16>,
    ) {
        let needed = register_base + registers_needed as usize;
        if self.registers.len() < needed {
            self.registers.resize(needed, Reference::nil());
        }
        self.frames.push(CallFrame::new(
            module,
            block_index,
            register_base,
            return_register,
        ));
    }

    #[must_use]
    pub fn current_frame(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut CallFrame> {
        self.frames.last_mut()
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    pub fn pin(&mut self) {
        self.pin_count += 1;
    }

    /// Decrements the pin count; only releases the pin at zero (§4.6).
    pub fn unpin(&mut self) {
        self.pin_count = self.pin_count.saturating_sub(1);
    }

    /// Called at a safepoint (backward branch or call boundary, §4.7) to
    /// check whether the scheduler has requested this process yield.
    #[must_use]
    pub fn at_safepoint(&self) -> bool {
        self.must_yield || self.reductions_remaining == 0
    }

    pub fn request_yield(&mut self) {
        self.must_yield = true;
    }

    pub fn refill_reductions(&mut self, quantum: usize) {
        self.reductions_remaining = quantum;
        self.must_yield = false;
    }

    /// Marks the process Terminated; frame drop and finaliser execution are
    /// driven by the interpreter before this is called (§3 lifecycle, §4.7
    /// panics).
    pub fn terminate(&mut self, panic: Option<PanicRecord>) {
        self.status = Status::Terminated;
        self.panic_record = panic;
        self.frames.clear();
    }

    /// Panics on an out-of-range index, which should never happen: the
    /// loader rejects any image whose instructions reference a register
    /// beyond its block's `registers_count` (`loader::validate_registers`),
    /// and `push_frame` always grows the register file to at least that
    /// many slots before a frame runs.
    #[must_use]
    pub fn register(&self, index: u16) -> Reference {
        let frame_base = self.current_frame().map_or(0, |f| f.register_base);
        self.registers[frame_base + index as usize]
    }

    pub fn set_register(&mut self, index: u16, value: Reference) {
        let frame_base = self.current_frame().map_or(0, |f| f.register_base);
        self.registers[frame_base + index as usize] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_pool::{BlockPool, PermanentSpace};

    fn process() -> Process {
        let config = Arc::new(Config::default());
        Process::new(
            BlockPool::new(4),
            PermanentSpace::new(1024 * 1024),
            config,
            false,
        )
    }

    #[test]
    fn new_process_is_runnable_and_unpinned() {
        let p = process();
        assert_eq!(p.status, Status::Runnable);
        assert!(!p.is_pinned());
    }

    #[test]
    fn pin_nesting_only_releases_at_zero() {
        let mut p = process();
        p.pin();
        p.pin();
        assert!(p.is_pinned());
        p.unpin();
        assert!(p.is_pinned());
        p.unpin();
        assert!(!p.is_pinned());
    }

    #[test]
    fn reduction_budget_refills_on_resume() {
        let mut p = process();
        p.reductions_remaining = 0;
        p.must_yield = true;
        assert!(p.at_safepoint());
        p.refill_reductions(4096);
        assert!(!p.at_safepoint());
    }
}
