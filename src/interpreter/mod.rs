//! The bytecode interpreter: instruction encoding and the dispatch loop.
//!
//! One instruction is read and executed per iteration of `run_quantum`,
//! charging one reduction each (coarser instructions charge more, per §9's
//! open question resolution — see `DESIGN.md`). A safepoint check happens
//! at every backward branch and call boundary (§4.7).

pub mod dispatch;
pub mod opcode;

use std::sync::Arc;

use crate::loader::{LoadError, Module, Reader};
use crate::value::Reference;

pub use dispatch::{run_quantum, Services, StepOutcome};
pub use opcode::Opcode;

/// One decoded bytecode instruction. Registers are frame-relative indices
/// (§4.7: a per-frame register window capped at 65 535); literal, module
/// and function indices use the extended-index encoding since a large
/// image can exceed 16 bits of literals (§6).
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    LoadNil { dst: u16 },
    LoadBool { dst: u16, value: bool },
    LoadInt { dst: u16, value: i32 },
    LoadLiteral { dst: u16, literal: u32 },
    Move { dst: u16, src: u16 },

    Add { dst: u16, lhs: u16, rhs: u16 },
    Sub { dst: u16, lhs: u16, rhs: u16 },
    Mul { dst: u16, lhs: u16, rhs: u16 },
    Div { dst: u16, lhs: u16, rhs: u16 },
    Mod { dst: u16, lhs: u16, rhs: u16 },

    Eq { dst: u16, lhs: u16, rhs: u16 },
    Lt { dst: u16, lhs: u16, rhs: u16 },
    Le { dst: u16, lhs: u16, rhs: u16 },
    Gt { dst: u16, lhs: u16, rhs: u16 },
    Ge { dst: u16, lhs: u16, rhs: u16 },

    /// Converts an embedded int to its decimal string representation, the
    /// one conversion the value representation's int/singleton/pointer
    /// tiers can express without a float tier (see `DESIGN.md`).
    IntToString { dst: u16, src: u16 },

    NewArray { dst: u16, len_reg: u16 },
    NewTuple { dst: u16, start: u16, count: u16 },
    NewInstance { dst: u16, class: u16, field_count: u16 },
    GetField { dst: u16, object: u16, index: u16 },
    SetField { object: u16, index: u16, value: u16 },
    GetElement { dst: u16, array: u16, index: u16 },
    SetElement { array: u16, index: u16, value: u16 },

    /// Calls through a per-callsite inline cache keyed by `site` (§4.7,
    /// §9 prototype dispatch).
    CallMethod {
        dst: u16,
        receiver: u16,
        method_literal: u32,
        arg_start: u16,
        arg_count: u16,
        site: u32,
    },
    TailCallMethod {
        receiver: u16,
        method_literal: u32,
        arg_start: u16,
        arg_count: u16,
        site: u32,
    },
    InvokeClosure {
        dst: u16,
        closure: u16,
        arg_start: u16,
        arg_count: u16,
    },
    Return { value: u16 },
    ReturnNil,
    Throw { value: u16 },

    MakeClosure { dst: u16, function: u32, capture_start: u16, capture_count: u16 },

    Jump { target: u32 },
    JumpIfFalse { cond: u16, target: u32 },
    JumpIfTrue { cond: u16, target: u32 },

    Spawn { dst: u16, module: u32, entry_block: u32 },
    Send { target: u16, value: u16 },
    Receive { dst: u16 },
    Sleep { millis: u16 },

    IoRead { dst: u16, fd: u16, max_len: u16 },
    IoWrite { fd: u16, data: u16 },

    /// The native-call hook: opaque to this crate, resolved by the (out of
    /// scope) FFI bridge at link time.
    FfiCall { dst: u16, native_id: u32, arg_start: u16, arg_count: u16 },

    Safepoint,
    Yield,
}

impl Instruction {
    pub(crate) fn decode(r: &mut Reader<'_>) -> Result<Self, LoadError> {
        let op = Opcode::try_from(r.u8()?)
            .map_err(|_| LoadError::BadInstruction("unknown opcode"))?;
        Ok(match op {
            Opcode::LoadNil => Instruction::LoadNil { dst: r.u16()? },
            Opcode::LoadBool => Instruction::LoadBool {
                dst: r.u16()?,
                value: r.u8()? != 0,
            },
            Opcode::LoadInt => Instruction::LoadInt {
                dst: r.u16()?,
                value: r.i32()?,
            },
            Opcode::LoadLiteral => Instruction::LoadLiteral {
                dst: r.u16()?,
                literal: r.index()?,
            },
            Opcode::Move => Instruction::Move {
                dst: r.u16()?,
                src: r.u16()?,
            },
            Opcode::Add => Instruction::Add { dst: r.u16()?, lhs: r.u16()?, rhs: r.u16()? },
            Opcode::Sub => Instruction::Sub { dst: r.u16()?, lhs: r.u16()?, rhs: r.u16()? },
            Opcode::Mul => Instruction::Mul { dst: r.u16()?, lhs: r.u16()?, rhs: r.u16()? },
            Opcode::Div => Instruction::Div { dst: r.u16()?, lhs: r.u16()?, rhs: r.u16()? },
            Opcode::Mod => Instruction::Mod { dst: r.u16()?, lhs: r.u16()?, rhs: r.u16()? },
            Opcode::Eq => Instruction::Eq { dst: r.u16()?, lhs: r.u16()?, rhs: r.u16()? },
            Opcode::Lt => Instruction::Lt { dst: r.u16()?, lhs: r.u16()?, rhs: r.u16()? },
            Opcode::Le => Instruction::Le { dst: r.u16()?, lhs: r.u16()?, rhs: r.u16()? },
            Opcode::Gt => Instruction::Gt { dst: r.u16()?, lhs: r.u16()?, rhs: r.u16()? },
            Opcode::Ge => Instruction::Ge { dst: r.u16()?, lhs: r.u16()?, rhs: r.u16()? },
            Opcode::IntToString => Instruction::IntToString { dst: r.u16()?, src: r.u16()? },
            Opcode::NewArray => Instruction::NewArray { dst: r.u16()?, len_reg: r.u16()? },
            Opcode::NewTuple => Instruction::NewTuple {
                dst: r.u16()?,
                start: r.u16()?,
                count: r.u16()?,
            },
            Opcode::NewInstance => Instruction::NewInstance {
                dst: r.u16()?,
                class: r.u16()?,
                field_count: r.u16()?,
            },
            Opcode::GetField => Instruction::GetField {
                dst: r.u16()?,
                object: r.u16()?,
                index: r.u16()?,
            },
            Opcode::SetField => Instruction::SetField {
                object: r.u16()?,
                index: r.u16()?,
                value: r.u16()?,
            },
            Opcode::GetElement => Instruction::GetElement {
                dst: r.u16()?,
                array: r.u16()?,
                index: r.u16()?,
            },
            Opcode::SetElement => Instruction::SetElement {
                array: r.u16()?,
                index: r.u16()?,
                value: r.u16()?,
            },
            Opcode::CallMethod => Instruction::CallMethod {
                dst: r.u16()?,
                receiver: r.u16()?,
                method_literal: r.index()?,
                arg_start: r.u16()?,
                arg_count: r.u16()?,
                site: r.u32()?,
            },
            Opcode::TailCallMethod => Instruction::TailCallMethod {
                receiver: r.u16()?,
                method_literal: r.index()?,
                arg_start: r.u16()?,
                arg_count: r.u16()?,
                site: r.u32()?,
            },
            Opcode::InvokeClosure => Instruction::InvokeClosure {
                dst: r.u16()?,
                closure: r.u16()?,
                arg_start: r.u16()?,
                arg_count: r.u16()?,
            },
            Opcode::Return => Instruction::Return { value: r.u16()? },
            Opcode::ReturnNil => Instruction::ReturnNil,
            Opcode::Throw => Instruction::Throw { value: r.u16()? },
            Opcode::MakeClosure => Instruction::MakeClosure {
                dst: r.u16()?,
                function: r.index()?,
                capture_start: r.u16()?,
                capture_count: r.u16()?,
            },
            Opcode::Jump => Instruction::Jump { target: r.u32()? },
            Opcode::JumpIfFalse => Instruction::JumpIfFalse {
                cond: r.u16()?,
                target: r.u32()?,
            },
            Opcode::JumpIfTrue => Instruction::JumpIfTrue {
                cond: r.u16()?,
                target: r.u32()?,
            },
            Opcode::Spawn => Instruction::Spawn {
                dst: r.u16()?,
                module: r.index()?,
                entry_block: r.index()?,
            },
            Opcode::Send => Instruction::Send {
                target: r.u16()?,
                value: r.u16()?,
            },
            Opcode::Receive => Instruction::Receive { dst: r.u16()? },
            Opcode::Sleep => Instruction::Sleep { millis: r.u16()? },
            Opcode::IoRead => Instruction::IoRead {
                dst: r.u16()?,
                fd: r.u16()?,
                max_len: r.u16()?,
            },
            Opcode::IoWrite => Instruction::IoWrite {
                fd: r.u16()?,
                data: r.u16()?,
            },
            Opcode::FfiCall => Instruction::FfiCall {
                dst: r.u16()?,
                native_id: r.index()?,
                arg_start: r.u16()?,
                arg_count: r.u16()?,
            },
            Opcode::Safepoint => Instruction::Safepoint,
            Opcode::Yield => Instruction::Yield,
        })
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        fn idx(out: &mut Vec<u8>, v: u32) {
            if v < 0xFFFF {
                out.extend_from_slice(&(v as u16).to_le_bytes());
            } else {
                out.extend_from_slice(&0xFFFFu16.to_le_bytes());
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        fn r16(out: &mut Vec<u8>, v: u16) {
            out.extend_from_slice(&v.to_le_bytes());
        }
        fn r32(out: &mut Vec<u8>, v: u32) {
            out.extend_from_slice(&v.to_le_bytes());
        }

        match *self {
            Instruction::LoadNil { dst } => {
                out.push(Opcode::LoadNil as u8);
                r16(out, dst);
            }
            Instruction::LoadBool { dst, value } => {
                out.push(Opcode::LoadBool as u8);
                r16(out, dst);
                out.push(u8::from(value));
            }
            Instruction::LoadInt { dst, value } => {
                out.push(Opcode::LoadInt as u8);
                r16(out, dst);
                r32(out, value as u32);
            }
            Instruction::LoadLiteral { dst, literal } => {
                out.push(Opcode::LoadLiteral as u8);
                r16(out, dst);
                idx(out, literal);
            }
            Instruction::Move { dst, src } => {
                out.push(Opcode::Move as u8);
                r16(out, dst);
                r16(out, src);
            }
            Instruction::Add { dst, lhs, rhs } => {
                out.push(Opcode::Add as u8);
                r16(out, dst);
                r16(out, lhs);
                r16(out, rhs);
            }
            Instruction::Sub { dst, lhs, rhs } => {
                out.push(Opcode::Sub as u8);
                r16(out, dst);
                r16(out, lhs);
                r16(out, rhs);
            }
            Instruction::Mul { dst, lhs, rhs } => {
                out.push(Opcode::Mul as u8);
                r16(out, dst);
                r16(out, lhs);
                r16(out, rhs);
            }
            Instruction::Div { dst, lhs, rhs } => {
                out.push(Opcode::Div as u8);
                r16(out, dst);
                r16(out, lhs);
                r16(out, rhs);
            }
            Instruction::Mod { dst, lhs, rhs } => {
                out.push(Opcode::Mod as u8);
                r16(out, dst);
                r16(out, lhs);
                r16(out, rhs);
            }
            Instruction::Eq { dst, lhs, rhs } => {
                out.push(Opcode::Eq as u8);
                r16(out, dst);
                r16(out, lhs);
                r16(out, rhs);
            }
            Instruction::Lt { dst, lhs, rhs } => {
                out.push(Opcode::Lt as u8);
                r16(out, dst);
                r16(out, lhs);
                r16(out, rhs);
            }
            Instruction::Le { dst, lhs, rhs } => {
                out.push(Opcode::Le as u8);
                r16(out, dst);
                r16(out, lhs);
                r16(out, rhs);
            }
            Instruction::Gt { dst, lhs, rhs } => {
                out.push(Opcode::Gt as u8);
                r16(out, dst);
                r16(out, lhs);
                r16(out, rhs);
            }
            Instruction::Ge { dst, lhs, rhs } => {
                out.push(Opcode::Ge as u8);
                r16(out, dst);
                r16(out, lhs);
                r16(out, rhs);
            }
            Instruction::IntToString { dst, src } => {
                out.push(Opcode::IntToString as u8);
                r16(out, dst);
                r16(out, src);
            }
            Instruction::NewArray { dst, len_reg } => {
                out.push(Opcode::NewArray as u8);
                r16(out, dst);
                r16(out, len_reg);
            }
            Instruction::NewTuple { dst, start, count } => {
                out.push(Opcode::NewTuple as u8);
                r16(out, dst);
                r16(out, start);
                r16(out, count);
            }
            Instruction::NewInstance { dst, class, field_count } => {
                out.push(Opcode::NewInstance as u8);
                r16(out, dst);
                r16(out, class);
                r16(out, field_count);
            }
            Instruction::GetField { dst, object, index } => {
                out.push(Opcode::GetField as u8);
                r16(out, dst);
                r16(out, object);
                r16(out, index);
            }
            Instruction::SetField { object, index, value } => {
                out.push(Opcode::SetField as u8);
                r16(out, object);
                r16(out, index);
                r16(out, value);
            }
            Instruction::GetElement { dst, array, index } => {
                out.push(Opcode::GetElement as u8);
                r16(out, dst);
                r16(out, array);
                r16(out, index);
            }
            Instruction::SetElement { array, index, value } => {
                out.push(Opcode::SetElement as u8);
                r16(out, array);
                r16(out, index);
                r16(out, value);
            }
            Instruction::CallMethod {
                dst,
                receiver,
                method_literal,
                arg_start,
                arg_count,
                site,
            } => {
                out.push(Opcode::CallMethod as u8);
                r16(out, dst);
                r16(out, receiver);
                idx(out, method_literal);
                r16(out, arg_start);
                r16(out, arg_count);
                r32(out, site);
            }
            Instruction::TailCallMethod {
                receiver,
                method_literal,
                arg_start,
                arg_count,
                site,
            } => {
                out.push(Opcode::TailCallMethod as u8);
                r16(out, receiver);
                idx(out, method_literal);
                r16(out, arg_start);
                r16(out, arg_count);
                r32(out, site);
            }
            Instruction::InvokeClosure {
                dst,
                closure,
                arg_start,
                arg_count,
            } => {
                out.push(Opcode::InvokeClosure as u8);
                r16(out, dst);
                r16(out, closure);
                r16(out, arg_start);
                r16(out, arg_count);
            }
            Instruction::Return { value } => {
                out.push(Opcode::Return as u8);
                r16(out, value);
            }
            Instruction::ReturnNil => out.push(Opcode::ReturnNil as u8),
            Instruction::Throw { value } => {
                out.push(Opcode::Throw as u8);
                r16(out, value);
            }
            Instruction::MakeClosure {
                dst,
                function,
                capture_start,
                capture_count,
            } => {
                out.push(Opcode::MakeClosure as u8);
                r16(out, dst);
                idx(out, function);
                r16(out, capture_start);
                r16(out, capture_count);
            }
            Instruction::Jump { target } => {
                out.push(Opcode::Jump as u8);
                r32(out, target);
            }
            Instruction::JumpIfFalse { cond, target } => {
                out.push(Opcode::JumpIfFalse as u8);
                r16(out, cond);
                r32(out, target);
            }
            Instruction::JumpIfTrue { cond, target } => {
                out.push(Opcode::JumpIfTrue as u8);
                r16(out, cond);
                r32(out, target);
            }
            Instruction::Spawn { dst, module, entry_block } => {
                out.push(Opcode::Spawn as u8);
                r16(out, dst);
                idx(out, module);
                idx(out, entry_block);
            }
            Instruction::Send { target, value } => {
                out.push(Opcode::Send as u8);
                r16(out, target);
                r16(out, value);
            }
            Instruction::Receive { dst } => {
                out.push(Opcode::Receive as u8);
                r16(out, dst);
            }
            Instruction::Sleep { millis } => {
                out.push(Opcode::Sleep as u8);
                r16(out, millis);
            }
            Instruction::IoRead { dst, fd, max_len } => {
                out.push(Opcode::IoRead as u8);
                r16(out, dst);
                r16(out, fd);
                r16(out, max_len);
            }
            Instruction::IoWrite { fd, data } => {
                out.push(Opcode::IoWrite as u8);
                r16(out, fd);
                r16(out, data);
            }
            Instruction::FfiCall {
                dst,
                native_id,
                arg_start,
                arg_count,
            } => {
                out.push(Opcode::FfiCall as u8);
                r16(out, dst);
                idx(out, native_id);
                r16(out, arg_start);
                r16(out, arg_count);
            }
            Instruction::Safepoint => out.push(Opcode::Safepoint as u8),
            Instruction::Yield => out.push(Opcode::Yield as u8),
        }
    }
}

/// An inline cache slot for prototype-based method dispatch: remembers the
/// last (receiver class, resolved method) pair for a callsite (§4.7, §9).
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineCacheEntry {
    pub receiver_class: Option<Reference>,
    pub resolved_function: u32,
}

/// Per-module inline cache storage, indexed by callsite id.
#[derive(Debug, Default)]
pub struct InlineCacheTable {
    entries: Vec<InlineCacheEntry>,
}

impl InlineCacheTable {
    #[must_use]
    pub fn new() -> Self {
        InlineCacheTable { entries: Vec::new() }
    }

    pub fn lookup(&self, site: u32) -> Option<InlineCacheEntry> {
        self.entries.get(site as usize).copied()
    }

    pub fn update(&mut self, site: u32, entry: InlineCacheEntry) {
        let idx = site as usize;
        if self.entries.len() <= idx {
            self.entries.resize(idx + 1, InlineCacheEntry::default());
        }
        self.entries[idx] = entry;
    }

    /// Every cached receiver class, so a GC root scan can keep them alive
    /// even if a class isn't otherwise reachable (§4.3).
    pub fn cached_classes(&self) -> impl Iterator<Item = Reference> + '_ {
        self.entries.iter().filter_map(|e| e.receiver_class)
    }

    /// Invalidates every cached entry for `class`, called when that class's
    /// method table is mutated (§4.7).
    pub fn invalidate_class(&mut self, class: Reference) {
        for entry in &mut self.entries {
            if entry.receiver_class == Some(class) {
                *entry = InlineCacheEntry::default();
            }
        }
    }
}

/// A module resolved to a concrete entry block, used by `Spawn`.
#[derive(Clone)]
pub struct ModuleEntry {
    pub module: Arc<Module>,
    pub block_index: usize,
}
