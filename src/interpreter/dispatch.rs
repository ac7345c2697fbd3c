//! The instruction dispatch loop.
//!
//! Runs a process until it yields, blocks, faults, or its reduction budget
//! is exhausted (§4.7). Cross-process effects (spawn, send) are requested
//! through the [`Runtime`] trait rather than reaching into the scheduler
//! directly, keeping the interpreter ignorant of how processes are actually
//! scheduled — mirroring how the source keeps its mutator decoupled from
//! its thread pool.

use std::sync::Arc;

use crate::block_pool::PermanentSpace;
use crate::loader::{Image, Module};
use crate::process::{ParkReason, PanicRecord, Process, Status};
use crate::value::{ObjectData, Reference};

use super::{InlineCacheEntry, Instruction};

/// What the interpreter needs from the scheduler to execute `Spawn` and
/// `Send`. Implemented by [`crate::scheduler::Scheduler`].
pub trait Runtime {
    /// Creates and enqueues a new process running `entry`'s body from its
    /// first instruction, returning its process id.
    fn spawn(&self, entry: Arc<Module>) -> u64;
    /// Delivers `value` to `target`'s mailbox, waking it if parked waiting
    /// for a message. Returns `false` if the target is unknown (already
    /// terminated), matching a message silently dropped.
    fn send(&self, target: u64, value: Reference) -> bool;
}

pub struct Services<'a> {
    pub image: &'a Image,
    pub runtime: &'a dyn Runtime,
}

/// What happened when a process's quantum ended.
#[derive(Debug)]
pub enum StepOutcome {
    /// Reduction budget exhausted or an explicit `Yield`; still Runnable.
    Yielded,
    WaitingForMessage,
    WaitingForIo {
        fd: i32,
        writable: bool,
        timeout_millis: Option<u64>,
    },
    WaitingForTimeout {
        millis: u64,
    },
    Terminated,
}

/// Deep-copies a value into the VM-wide permanent space, preserving sharing
/// within the one send via an identity table (§4.7, §9). A message can't be
/// copied straight into the receiving process's heap the way the design
/// note describes, because the sender generally has no safe, synchronised
/// access to that heap (the receiver may be running on another worker right
/// now); copying into the append-only permanent arena instead needs no
/// handshake with the receiver and is immediately safe to hand over. The
/// cost is that sent objects are never reclaimed until the VM exits — see
/// `DESIGN.md`. Already-permanent references and embedded values pass
/// through unchanged.
fn deep_copy(value: Reference, permanent: &PermanentSpace) -> Reference {
    use std::collections::HashMap;

    fn go(value: Reference, permanent: &PermanentSpace, seen: &mut HashMap<usize, Reference>) -> Reference {
        let Some(ptr) = value.as_object_ptr() else {
            return value;
        };
        // SAFETY: the source process's heap outlives this call; we only
        // read, never mutate, the source object.
        let header_is_permanent = unsafe { (*ptr).header.is_permanent() };
        if header_is_permanent {
            return value;
        }
        if let Some(existing) = seen.get(&value.addr()) {
            return *existing;
        }
        let data = unsafe {
            match &(*ptr).data {
                ObjectData::String(s) => ObjectData::String(s.clone()),
                ObjectData::Array(items) => {
                    let copied: Vec<Reference> =
                        items.iter().map(|r| go(*r, permanent, seen)).collect();
                    ObjectData::Array(copied)
                }
                ObjectData::Tuple(items) => {
                    let copied: Box<[Reference]> =
                        items.iter().map(|r| go(*r, permanent, seen)).collect();
                    ObjectData::Tuple(copied)
                }
                ObjectData::Instance { fields } => {
                    let copied: Box<[Reference]> =
                        fields.iter().map(|r| go(*r, permanent, seen)).collect();
                    ObjectData::Instance { fields: copied }
                }
                ObjectData::Closure {
                    captures,
                    function_index,
                } => {
                    let copied: Box<[Reference]> =
                        captures.iter().map(|r| go(*r, permanent, seen)).collect();
                    ObjectData::Closure {
                        captures: copied,
                        function_index: *function_index,
                    }
                }
                ObjectData::Class { .. } => {
                    // Classes are expected to live in permanent space; if one
                    // doesn't, fall back to sharing the reference rather than
                    // attempting to clone a method table.
                    return value;
                }
            }
        };
        let class = unsafe { (*ptr).header.class };
        // Permanent space is append-only and bounded (§9); a message that
        // would overflow it is dropped as a nil rather than panicking the
        // sender.
        let new_ref = permanent.allocate(class, data).unwrap_or(Reference::nil());
        seen.insert(value.addr(), new_ref);
        new_ref
    }

    go(value, permanent, &mut HashMap::new())
}

fn arith(op: impl Fn(i64, i64) -> Option<i64>, lhs: Reference, rhs: Reference) -> Reference {
    match (lhs.as_int(), rhs.as_int()) {
        (Some(a), Some(b)) => op(a, b).map_or(Reference::nil(), Reference::int),
        _ => Reference::nil(),
    }
}

fn compare(op: impl Fn(i64, i64) -> bool, lhs: Reference, rhs: Reference) -> Reference {
    match (lhs.as_int(), rhs.as_int()) {
        (Some(a), Some(b)) => Reference::bool(op(a, b)),
        _ => Reference::bool(lhs == rhs && op(0, 0)),
    }
}

/// Walks the prototype chain from `receiver`'s class looking for
/// `method_name`, consulting and then populating the inline cache for
/// `site` (§4.7, §9).
fn resolve_method(
    process: &mut Process,
    receiver: Reference,
    method_name: &str,
    site: u32,
) -> Option<u32> {
    let class = receiver
        .as_object_ptr()
        .map(|ptr| unsafe { (*ptr).header.class })?;

    if let Some(cached) = process.inline_cache.lookup(site) {
        if cached.receiver_class == Some(class) {
            return Some(cached.resolved_function);
        }
    }

    let mut cursor = class;
    loop {
        let ptr = cursor.as_object_ptr()?;
        let (parent, resolved) = unsafe {
            match &(*ptr).data {
                ObjectData::Class { parent, methods, .. } => {
                    (*parent, methods.get(method_name).copied())
                }
                _ => return None,
            }
        };
        if let Some(function_index) = resolved {
            process.inline_cache.update(
                site,
                InlineCacheEntry {
                    receiver_class: Some(class),
                    resolved_function: function_index,
                },
            );
            return Some(function_index);
        }
        if parent.is_nil() {
            return None;
        }
        cursor = parent;
    }
}

fn literal_string(process: &Process, index: u32) -> String {
    process
        .current_frame()
        .and_then(|f| f.module.literals.get(index as usize))
        .cloned()
        .unwrap_or_default()
}

/// Runs `process` until its quantum ends one way or another.
pub fn run_quantum(process: &mut Process, services: &Services<'_>) -> StepOutcome {
    if process.frames.is_empty() {
        return StepOutcome::Terminated;
    }

    loop {
        if process.reductions_remaining == 0 || process.must_yield {
            return StepOutcome::Yielded;
        }

        let Some(frame) = process.current_frame() else {
            process.terminate(None);
            return StepOutcome::Terminated;
        };
        let module = Arc::clone(&frame.module);
        let offset = frame.instruction_offset;

        let Some(instruction) = module.body.instructions.get(offset).cloned() else {
            // Falling off the end of a block is an implicit `return nil`.
            if !do_return(process, Reference::nil()) {
                process.terminate(None);
                return StepOutcome::Terminated;
            }
            continue;
        };

        process.reductions_remaining = process.reductions_remaining.saturating_sub(
            reduction_cost(&instruction),
        );

        let mut next_offset = offset + 1;
        let mut panicked: Option<String> = None;

        match instruction {
            Instruction::LoadNil { dst } => process.set_register(dst, Reference::nil()),
            Instruction::LoadBool { dst, value } => process.set_register(dst, Reference::bool(value)),
            Instruction::LoadInt { dst, value } => {
                process.set_register(dst, Reference::int(i64::from(value)));
            }
            Instruction::LoadLiteral { dst, literal } => {
                let s = literal_string(process, literal);
                let r = process.heap.allocate(Reference::nil(), ObjectData::String(s.into_boxed_str()));
                process.set_register(dst, r);
            }
            Instruction::Move { dst, src } => {
                let v = process.register(src);
                process.set_register(dst, v);
            }
            Instruction::Add { dst, lhs, rhs } => {
                let v = arith(|a, b| a.checked_add(b), process.register(lhs), process.register(rhs));
                process.set_register(dst, v);
            }
            Instruction::Sub { dst, lhs, rhs } => {
                let v = arith(|a, b| a.checked_sub(b), process.register(lhs), process.register(rhs));
                process.set_register(dst, v);
            }
            Instruction::Mul { dst, lhs, rhs } => {
                let v = arith(|a, b| a.checked_mul(b), process.register(lhs), process.register(rhs));
                process.set_register(dst, v);
            }
            Instruction::Div { dst, lhs, rhs } => {
                let rhs_v = process.register(rhs);
                if rhs_v.as_int() == Some(0) {
                    panicked = Some("division by zero".to_string());
                } else {
                    let v = arith(|a, b| a.checked_div(b), process.register(lhs), rhs_v);
                    process.set_register(dst, v);
                }
            }
            Instruction::Mod { dst, lhs, rhs } => {
                let rhs_v = process.register(rhs);
                if rhs_v.as_int() == Some(0) {
                    panicked = Some("division by zero".to_string());
                } else {
                    let v = arith(|a, b| a.checked_rem(b), process.register(lhs), rhs_v);
                    process.set_register(dst, v);
                }
            }
            Instruction::Eq { dst, lhs, rhs } => {
                let v = Reference::bool(process.register(lhs) == process.register(rhs));
                process.set_register(dst, v);
            }
            Instruction::Lt { dst, lhs, rhs } => {
                let v = compare(|a, b| a < b, process.register(lhs), process.register(rhs));
                process.set_register(dst, v);
            }
            Instruction::Le { dst, lhs, rhs } => {
                let v = compare(|a, b| a <= b, process.register(lhs), process.register(rhs));
                process.set_register(dst, v);
            }
            Instruction::Gt { dst, lhs, rhs } => {
                let v = compare(|a, b| a > b, process.register(lhs), process.register(rhs));
                process.set_register(dst, v);
            }
            Instruction::Ge { dst, lhs, rhs } => {
                let v = compare(|a, b| a >= b, process.register(lhs), process.register(rhs));
                process.set_register(dst, v);
            }
            Instruction::IntToString { dst, src } => {
                let s = process
                    .register(src)
                    .as_int()
                    .map_or_else(String::new, |i| i.to_string());
                let r = process.heap.allocate(Reference::nil(), ObjectData::String(s.into_boxed_str()));
                process.set_register(dst, r);
            }
            Instruction::NewArray { dst, len_reg } => {
                let len = process.register(len_reg).as_int().unwrap_or(0).max(0) as usize;
                let r = process
                    .heap
                    .allocate(Reference::nil(), ObjectData::Array(vec![Reference::nil(); len]));
                process.set_register(dst, r);
            }
            Instruction::NewTuple { dst, start, count } => {
                let items: Vec<Reference> = (0..count).map(|i| process.register(start + i)).collect();
                let r = process
                    .heap
                    .allocate(Reference::nil(), ObjectData::Tuple(items.into_boxed_slice()));
                process.set_register(dst, r);
            }
            Instruction::NewInstance { dst, class, field_count } => {
                let class_ref = process.register(class);
                let fields = vec![Reference::nil(); field_count as usize].into_boxed_slice();
                let r = process.heap.allocate(class_ref, ObjectData::Instance { fields });
                process.set_register(dst, r);
            }
            Instruction::GetField { dst, object, index } => {
                let obj = process.register(object);
                let v = obj.as_object_ptr().map_or(Reference::nil(), |ptr| unsafe {
                    match &(*ptr).data {
                        ObjectData::Instance { fields } => {
                            fields.get(index as usize).copied().unwrap_or(Reference::nil())
                        }
                        _ => Reference::nil(),
                    }
                });
                process.set_register(dst, v);
            }
            Instruction::SetField { object, index, value } => {
                let obj = process.register(object);
                let val = process.register(value);
                if let Some(ptr) = obj.as_object_ptr() {
                    unsafe {
                        if let ObjectData::Instance { fields } = &mut (*ptr).data {
                            if let Some(slot) = fields.get_mut(index as usize) {
                                *slot = val;
                            }
                        }
                    }
                    process.heap.write_barrier(obj, val);
                }
            }
            Instruction::GetElement { dst, array, index } => {
                let arr = process.register(array);
                let idx = process.register(index).as_int().unwrap_or(-1);
                let v = arr.as_object_ptr().map_or(Reference::nil(), |ptr| unsafe {
                    match &(*ptr).data {
                        ObjectData::Array(items) if idx >= 0 => {
                            items.get(idx as usize).copied().unwrap_or(Reference::nil())
                        }
                        ObjectData::Tuple(items) if idx >= 0 => {
                            items.get(idx as usize).copied().unwrap_or(Reference::nil())
                        }
                        _ => Reference::nil(),
                    }
                });
                process.set_register(dst, v);
            }
            Instruction::SetElement { array, index, value } => {
                let arr = process.register(array);
                let idx = process.register(index).as_int().unwrap_or(-1);
                let val = process.register(value);
                if let Some(ptr) = arr.as_object_ptr() {
                    unsafe {
                        if let ObjectData::Array(items) = &mut (*ptr).data {
                            if idx >= 0 {
                                if let Some(slot) = items.get_mut(idx as usize) {
                                    *slot = val;
                                }
                            }
                        }
                    }
                    process.heap.write_barrier(arr, val);
                }
            }
            Instruction::CallMethod {
                dst,
                receiver,
                method_literal,
                arg_start,
                arg_count,
                site,
            } => {
                let receiver_v = process.register(receiver);
                let name = literal_string(process, method_literal);
                match resolve_method(process, receiver_v, &name, site) {
                    Some(function_index) => {
                        if let Some(f) = process.current_frame_mut() {
                            f.instruction_offset = next_offset;
                        }
                        do_call(process, services, function_index, arg_start, arg_count, Some(dst));
                        if process.at_safepoint() {
                            return StepOutcome::Yielded;
                        }
                        continue;
                    }
                    None => panicked = Some(format!("no method `{name}` on receiver")),
                }
            }
            Instruction::TailCallMethod {
                receiver,
                method_literal,
                arg_start,
                arg_count,
                site,
            } => {
                let receiver_v = process.register(receiver);
                let name = literal_string(process, method_literal);
                match resolve_method(process, receiver_v, &name, site) {
                    Some(function_index) => {
                        let popped = process.frames.pop();
                        let return_register = popped.as_ref().and_then(|f| f.return_register);
                        let register_base = popped.map_or(0, |f| f.register_base);
                        do_call_at(
                            process,
                            services,
                            function_index,
                            arg_start,
                            arg_count,
                            return_register,
                            register_base,
                        );
                        if process.at_safepoint() {
                            return StepOutcome::Yielded;
                        }
                        continue;
                    }
                    None => panicked = Some(format!("no method `{name}` on receiver")),
                }
            }
            Instruction::InvokeClosure {
                dst,
                closure,
                arg_start,
                arg_count,
            } => {
                let closure_v = process.register(closure);
                let resolved = closure_v.as_object_ptr().and_then(|ptr| unsafe {
                    match &(*ptr).data {
                        ObjectData::Closure { function_index, captures } => {
                            Some((*function_index, captures.clone()))
                        }
                        _ => None,
                    }
                });
                match resolved {
                    Some((function_index, captures)) => {
                        do_call(process, services, function_index, arg_start, arg_count, Some(dst));
                        if let Some(frame) = process.current_frame_mut() {
                            frame.captures = captures.into_vec();
                        }
                    }
                    None => panicked = Some("invoked a non-closure value".to_string()),
                }
            }
            Instruction::Return { value } => {
                let v = process.register(value);
                if !do_return(process, v) {
                    process.terminate(None);
                    return StepOutcome::Terminated;
                }
                continue;
            }
            Instruction::ReturnNil => {
                if !do_return(process, Reference::nil()) {
                    process.terminate(None);
                    return StepOutcome::Terminated;
                }
                continue;
            }
            Instruction::Throw { value } => {
                let v = process.register(value);
                if !do_throw(process, v) {
                    let message = format!("{:?}", v);
                    panicked = Some(message);
                } else {
                    continue;
                }
            }
            Instruction::MakeClosure {
                dst,
                function,
                capture_start,
                capture_count,
            } => {
                let captures: Vec<Reference> =
                    (0..capture_count).map(|i| process.register(capture_start + i)).collect();
                let r = process.heap.allocate(
                    Reference::nil(),
                    ObjectData::Closure {
                        captures: captures.into_boxed_slice(),
                        function_index: function,
                    },
                );
                process.set_register(dst, r);
            }
            Instruction::Jump { target } => {
                if (target as usize) <= offset && process.at_safepoint() {
                    if let Some(frame) = process.current_frame_mut() {
                        frame.instruction_offset = target as usize;
                    }
                    return StepOutcome::Yielded;
                }
                next_offset = target as usize;
            }
            Instruction::JumpIfFalse { cond, target } => {
                if process.register(cond).as_bool() == Some(false) {
                    next_offset = target as usize;
                }
            }
            Instruction::JumpIfTrue { cond, target } => {
                if process.register(cond).as_bool() == Some(true) {
                    next_offset = target as usize;
                }
            }
            Instruction::Spawn { dst, module: module_idx, .. } => {
                match services.image.modules.get(module_idx as usize) {
                    Some(entry_module) => {
                        let entry = Arc::new(entry_module.clone());
                        let pid = services.runtime.spawn(entry);
                        process.set_register(dst, Reference::int(pid as i64));
                    }
                    None => panicked = Some("spawn: unknown module index".to_string()),
                }
            }
            Instruction::Send { target, value } => {
                let target_pid = process.register(target).as_int();
                let value_v = process.register(value);
                match target_pid {
                    Some(pid) => {
                        let copied = deep_copy(value_v, process.permanent.as_ref());
                        services.runtime.send(pid as u64, copied);
                    }
                    None => panicked = Some("send: target is not a process id".to_string()),
                }
            }
            Instruction::Receive { dst } => {
                if let Some(msg) = process.mailbox.try_recv() {
                    process.set_register(dst, msg);
                } else {
                    if let Some(frame) = process.current_frame_mut() {
                        frame.instruction_offset = offset;
                    }
                    process.status = Status::WaitingForMessage;
                    process.park_reason = Some(ParkReason::Message);
                    return StepOutcome::WaitingForMessage;
                }
            }
            Instruction::Sleep { millis } => {
                if let Some(frame) = process.current_frame_mut() {
                    frame.instruction_offset = next_offset;
                }
                process.status = Status::WaitingForTimeout;
                return StepOutcome::WaitingForTimeout {
                    millis: u64::from(millis),
                };
            }
            Instruction::IoRead { dst, fd, max_len } => {
                let fd_num = process.register(fd).as_int().unwrap_or(-1) as i32;
                match raw_read(fd_num, max_len as usize) {
                    Ok(bytes) => {
                        let s = String::from_utf8_lossy(&bytes).into_owned();
                        let r = process
                            .heap
                            .allocate(Reference::nil(), ObjectData::String(s.into_boxed_str()));
                        process.set_register(dst, r);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        if let Some(frame) = process.current_frame_mut() {
                            frame.instruction_offset = offset;
                        }
                        process.status = Status::WaitingForIo;
                        return StepOutcome::WaitingForIo {
                            fd: fd_num,
                            writable: false,
                            timeout_millis: None,
                        };
                    }
                    Err(_) => panicked = Some("io read error".to_string()),
                }
            }
            Instruction::IoWrite { fd, data } => {
                let fd_num = process.register(fd).as_int().unwrap_or(-1) as i32;
                let payload = process.register(data).as_object_ptr().map(|ptr| unsafe {
                    match &(*ptr).data {
                        ObjectData::String(s) => s.as_bytes().to_vec(),
                        _ => Vec::new(),
                    }
                });
                match payload {
                    Some(bytes) => match raw_write(fd_num, &bytes) {
                        Ok(()) => {}
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            if let Some(frame) = process.current_frame_mut() {
                                frame.instruction_offset = offset;
                            }
                            process.status = Status::WaitingForIo;
                            return StepOutcome::WaitingForIo {
                                fd: fd_num,
                                writable: true,
                                timeout_millis: None,
                            };
                        }
                        Err(_) => panicked = Some("io write error".to_string()),
                    },
                    None => panicked = Some("io write: not a string".to_string()),
                }
            }
            Instruction::FfiCall { dst, .. } => {
                // The FFI bridge is an external collaborator (§1); this hook
                // just returns nil, matching "opaque native call hook". Pin
                // around the call anyway, since native code with
                // thread-local state is exactly §4.6's pinning use case.
                process.pin();
                process.set_register(dst, Reference::nil());
                process.unpin();
            }
            Instruction::Safepoint => {
                if process.at_safepoint() {
                    if let Some(frame) = process.current_frame_mut() {
                        frame.instruction_offset = next_offset;
                    }
                    return StepOutcome::Yielded;
                }
            }
            Instruction::Yield => {
                if let Some(frame) = process.current_frame_mut() {
                    frame.instruction_offset = next_offset;
                }
                return StepOutcome::Yielded;
            }
        }

        if let Some(message) = panicked {
            if !do_throw(process, Reference::nil()) {
                let trace = process
                    .frames
                    .iter()
                    .map(|f| format!("{}:{}", f.module.name, f.instruction_offset))
                    .collect();
                process.terminate(Some(PanicRecord { message, trace }));
                return StepOutcome::Terminated;
            }
            continue;
        }

        if let Some(frame) = process.current_frame_mut() {
            frame.instruction_offset = next_offset;
        }

        if next_offset <= offset && process.at_safepoint() {
            return StepOutcome::Yielded;
        }
    }
}

/// One reduction per instruction, with coarser operations (deep-copy send,
/// array allocation) charged proportionally — the VM's resolution of §9's
/// open question about per-instruction reduction cost.
fn reduction_cost(instruction: &Instruction) -> usize {
    match instruction {
        Instruction::Send { .. } => 4,
        Instruction::NewArray { .. } | Instruction::NewTuple { .. } | Instruction::NewInstance { .. } => 2,
        Instruction::Spawn { .. } => 8,
        _ => 1,
    }
}

fn do_call(
    process: &mut Process,
    services: &Services<'_>,
    function_index: u32,
    arg_start: u16,
    arg_count: u16,
    return_register: Option<u16>,
) {
    do_call_at(
        process,
        services,
        function_index,
        arg_start,
        arg_count,
        return_register,
        process.registers.len(),
    );
}

/// Like `do_call`, but reuses `register_base` instead of growing the
/// register file — used by `TailCallMethod` so a tail-recursive loop
/// doesn't leak register-file space on every iteration.
fn do_call_at(
    process: &mut Process,
    services: &Services<'_>,
    function_index: u32,
    arg_start: u16,
    arg_count: u16,
    return_register: Option<u16>,
    register_base: usize,
) {
    let Some(target_module) = services.image.modules.get(function_index as usize) else {
        return;
    };
    let args: Vec<Reference> = (0..arg_count).map(|i| process.register(arg_start + i)).collect();
    let registers_needed = target_module.body.registers_count.max(arg_count);
    process.push_frame(
        Arc::new(target_module.clone()),
        0,
        register_base,
        registers_needed,
        return_register,
    );
    for (i, arg) in args.into_iter().enumerate() {
        process.set_register(i as u16, arg);
    }
}

/// Pops the current frame and stores `value` into the caller's return
/// register, if any. Returns `false` when the entry frame itself returned
/// (the process should terminate).
fn do_return(process: &mut Process, value: Reference) -> bool {
    let Some(finished) = process.frames.pop() else {
        return false;
    };
    match finished.return_register {
        Some(reg) if !process.frames.is_empty() => {
            process.set_register(reg, value);
            true
        }
        Some(_) | None => !process.frames.is_empty(),
    }
}

/// Unwinds to the nearest frame with a catch handler covering its current
/// offset, storing the thrown value in the handler's register. Returns
/// `false` if no handler exists anywhere on the stack (the process panics).
fn do_throw(process: &mut Process, value: Reference) -> bool {
    while let Some(frame) = process.current_frame() {
        if let Some((handler_offset, handler_register)) = frame.catch_target() {
            process.set_register(handler_register, value);
            if let Some(frame) = process.current_frame_mut() {
                frame.instruction_offset = handler_offset as usize;
            }
            return true;
        }
        process.frames.pop();
    }
    false
}

fn raw_read(fd: i32, max_len: usize) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    #[cfg(unix)]
    {
        use std::os::unix::io::FromRawFd;
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
        let mut buf = vec![0u8; max_len];
        let result = file.read(&mut buf);
        std::mem::forget(file);
        let n = result?;
        buf.truncate(n);
        Ok(buf)
    }
    #[cfg(not(unix))]
    {
        let _ = (fd, max_len);
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "raw fd io unsupported"))
    }
}

fn raw_write(fd: i32, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    #[cfg(unix)]
    {
        use std::os::unix::io::FromRawFd;
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
        let result = file.write_all(bytes);
        std::mem::forget(file);
        result
    }
    #[cfg(not(unix))]
    {
        let _ = (fd, bytes);
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "raw fd io unsupported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_pool::{BlockPool, PermanentSpace};
    use crate::config::Config;
    use crate::loader::{CodeBlock, Image, Module};
    use crate::process::Process;

    struct NoRuntime;
    impl Runtime for NoRuntime {
        fn spawn(&self, _entry: Arc<Module>) -> u64 {
            0
        }
        fn send(&self, _target: u64, _value: Reference) -> bool {
            false
        }
    }

    fn module_with(instructions: Vec<Instruction>) -> Arc<Module> {
        Arc::new(Module {
            name: "main".into(),
            source_path: "main.src".into(),
            literals: vec![],
            body: CodeBlock {
                name: "main".into(),
                file: "main.src".into(),
                line: 1,
                locals_count: 0,
                registers_count: 8,
                instructions,
                catch_table: vec![],
            },
        })
    }

    fn process_running(module: Arc<Module>) -> Process {
        let config = Arc::new(Config::default());
        let mut process = Process::new(
            BlockPool::new(4),
            PermanentSpace::new(1024 * 1024),
            config,
            false,
        );
        process.push_frame(module, 0, 0, 8, None);
        process
    }

    #[test]
    fn arithmetic_and_return() {
        let module = module_with(vec![
            Instruction::LoadInt { dst: 0, value: 2 },
            Instruction::LoadInt { dst: 1, value: 3 },
            Instruction::Add { dst: 2, lhs: 0, rhs: 1 },
            Instruction::Return { value: 2 },
        ]);
        let mut process = process_running(module);
        let image = Image { modules: vec![], entry_module: 0 };
        let runtime = NoRuntime;
        let services = Services { image: &image, runtime: &runtime };
        let outcome = run_quantum(&mut process, &services);
        assert!(matches!(outcome, StepOutcome::Terminated));
    }

    /// (§4.6 pinning) `FfiCall` is the one instruction with native,
    /// thread-local-state semantics, so it pins for the call's duration —
    /// but unpins before returning, since this hook never actually
    /// suspends mid-call.
    #[test]
    fn ffi_call_pins_for_the_duration_and_unpins_after() {
        let module = module_with(vec![
            Instruction::FfiCall { dst: 0, native_id: 0, arg_start: 0, arg_count: 0 },
            Instruction::ReturnNil,
        ]);
        let mut process = process_running(module);
        let image = Image { modules: vec![], entry_module: 0 };
        let runtime = NoRuntime;
        let services = Services { image: &image, runtime: &runtime };
        run_quantum(&mut process, &services);
        assert!(!process.is_pinned());
    }

    #[test]
    fn division_by_zero_panics_process() {
        let module = module_with(vec![
            Instruction::LoadInt { dst: 0, value: 1 },
            Instruction::LoadInt { dst: 1, value: 0 },
            Instruction::Div { dst: 2, lhs: 0, rhs: 1 },
            Instruction::ReturnNil,
        ]);
        let mut process = process_running(module);
        let image = Image { modules: vec![], entry_module: 0 };
        let runtime = NoRuntime;
        let services = Services { image: &image, runtime: &runtime };
        let outcome = run_quantum(&mut process, &services);
        assert!(matches!(outcome, StepOutcome::Terminated));
        assert!(process.panic_record.is_some());
    }

    #[test]
    fn receive_parks_on_empty_mailbox() {
        let module = module_with(vec![Instruction::Receive { dst: 0 }]);
        let mut process = process_running(module);
        let image = Image { modules: vec![], entry_module: 0 };
        let runtime = NoRuntime;
        let services = Services { image: &image, runtime: &runtime };
        let outcome = run_quantum(&mut process, &services);
        assert!(matches!(outcome, StepOutcome::WaitingForMessage));
        assert_eq!(process.status, Status::WaitingForMessage);
    }

    #[test]
    fn receive_consumes_pending_message() {
        let module = module_with(vec![
            Instruction::Receive { dst: 0 },
            Instruction::Return { value: 0 },
        ]);
        let mut process = process_running(module);
        process.mailbox.sender().send(Reference::int(7));
        let image = Image { modules: vec![], entry_module: 0 };
        let runtime = NoRuntime;
        let services = Services { image: &image, runtime: &runtime };
        let outcome = run_quantum(&mut process, &services);
        assert!(matches!(outcome, StepOutcome::Terminated));
    }

    #[test]
    fn sleep_requests_timeout_wait() {
        let module = module_with(vec![Instruction::Sleep { millis: 50 }]);
        let mut process = process_running(module);
        let image = Image { modules: vec![], entry_module: 0 };
        let runtime = NoRuntime;
        let services = Services { image: &image, runtime: &runtime };
        let outcome = run_quantum(&mut process, &services);
        assert!(matches!(outcome, StepOutcome::WaitingForTimeout { millis: 50 }));
    }

    #[test]
    fn tail_call_reuses_register_base_instead_of_growing() {
        // r0 = receiver, r1 = counter (set externally), r5/r6/r7 scratch.
        // Self-recursively tail-calls "go" until the counter hits zero, then
        // returns. A naive `do_call` would append a fresh register window on
        // every iteration; reusing the popped frame's base keeps the
        // register file from growing.
        let module = module_with(vec![
            Instruction::LoadInt { dst: 5, value: 0 },
            Instruction::Eq { dst: 6, lhs: 1, rhs: 5 },
            Instruction::JumpIfTrue { cond: 6, target: 6 },
            Instruction::LoadInt { dst: 7, value: 1 },
            Instruction::Sub { dst: 1, lhs: 1, rhs: 7 },
            Instruction::TailCallMethod {
                receiver: 0,
                method_literal: 0,
                arg_start: 0,
                arg_count: 2,
                site: 0,
            },
            Instruction::Return { value: 1 },
        ]);
        let mut module_with_literal = (*module).clone();
        module_with_literal.literals = vec!["go".to_string()];
        let module = Arc::new(module_with_literal);

        let mut process = process_running(Arc::clone(&module));
        let class = process.heap.allocate(
            Reference::nil(),
            ObjectData::Class {
                name: "C".into(),
                parent: Reference::nil(),
                methods: std::collections::HashMap::from([("go".into(), 0u32)]),
            },
        );
        let instance = process
            .heap
            .allocate(class, ObjectData::Instance { fields: Box::new([]) });
        process.set_register(0, instance);
        process.set_register(1, Reference::int(50));

        let image = Image { modules: vec![(*module).clone()], entry_module: 0 };
        let runtime = NoRuntime;
        let services = Services { image: &image, runtime: &runtime };

        let registers_before = process.registers.len();
        let outcome = run_quantum(&mut process, &services);
        assert!(matches!(outcome, StepOutcome::Terminated));
        assert_eq!(process.registers.len(), registers_before);
    }
}
