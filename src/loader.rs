//! The bytecode image reader.
//!
//! The full bytecode image format, compiler toolchain and optimizer are
//! external collaborators (§1); this module owns exactly the thin slice
//! needed to boot a process end to end: validating the header, decoding the
//! string and module tables, and building in-memory [`Module`]/[`CodeBlock`]
//! objects with their instruction streams and catch tables, per §6.

use std::io;

use thiserror::Error;

use crate::interpreter::Instruction;

pub const SIGNATURE: [u8; 4] = *b"NIMB";
pub const VERSION: u16 = 1;
/// Over-limit images are rejected outright rather than read incrementally.
pub const MAX_IMAGE_SIZE: u64 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("io error reading image: {0}")]
    Io(#[from] io::Error),
    #[error("bad signature: expected {SIGNATURE:?}, got {0:?}")]
    BadSignature([u8; 4]),
    #[error("unsupported version {0} (expected {VERSION})")]
    UnsupportedVersion(u16),
    #[error("image exceeds maximum size of {MAX_IMAGE_SIZE} bytes")]
    TooLarge,
    #[error("string table index {0} out of range")]
    BadStringIndex(u32),
    #[error("no modules in image")]
    NoModules,
    #[error("truncated image: expected more data while reading {0}")]
    Truncated(&'static str),
    #[error("malformed instruction: {0}")]
    BadInstruction(&'static str),
    #[error("register {0} is out of range for a block with {1} registers")]
    BadRegister(u16, u16),
}

/// A catch-table entry: an instruction-range handler, per §4.7's "try/else
/// as control flow" design note.
#[derive(Debug, Clone, Copy)]
pub struct CatchEntry {
    pub start: u32,
    pub end: u32,
    pub handler_offset: u32,
    pub handler_register: u16,
}

/// One compiled method/block body.
#[derive(Debug, Clone)]
pub struct CodeBlock {
    pub name: String,
    pub file: String,
    pub line: u32,
    pub locals_count: u16,
    pub registers_count: u16,
    pub instructions: Vec<Instruction>,
    pub catch_table: Vec<CatchEntry>,
}

/// A loaded module: its name, source path, literal table, and the code
/// block that runs when the module is first referenced.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub source_path: String,
    pub literals: Vec<String>,
    pub body: CodeBlock,
}

/// The fully decoded image: every module plus which one holds the program's
/// entry point.
#[derive(Debug, Clone)]
pub struct Image {
    pub modules: Vec<Module>,
    pub entry_module: usize,
}

/// A forward-only cursor over the raw image bytes. `pub(crate)` so the
/// interpreter's instruction decoder can share it without this module
/// needing to know anything about opcodes.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    pub(crate) fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], LoadError> {
        if self.pos + n > self.data.len() {
            return Err(LoadError::Truncated(what));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1, "u8")?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, LoadError> {
        let bytes = self.take(2, "u16")?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, LoadError> {
        let bytes = self.take(4, "u32")?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, LoadError> {
        Ok(self.u32()? as i32)
    }

    /// Decodes a literal/register index, honouring the extended-index
    /// prefix for values that don't fit in 16 bits (§6).
    pub(crate) fn index(&mut self) -> Result<u32, LoadError> {
        let narrow = self.u16()?;
        if narrow == 0xFFFF {
            self.u32()
        } else {
            Ok(u32::from(narrow))
        }
    }

    fn string(&mut self) -> Result<String, LoadError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len, "string table entry")?;
        String::from_utf8(bytes.to_vec()).map_err(|_| LoadError::Truncated("utf8 string"))
    }
}

/// Decodes a full image from an in-memory buffer (callers reading from a
/// file should size-check before loading, per `MAX_IMAGE_SIZE`).
pub fn load(bytes: &[u8]) -> Result<Image, LoadError> {
    if bytes.len() as u64 > MAX_IMAGE_SIZE {
        return Err(LoadError::TooLarge);
    }

    let mut r = Reader::new(bytes);

    let mut signature = [0u8; 4];
    signature.copy_from_slice(r.take(4, "signature")?);
    if signature != SIGNATURE {
        return Err(LoadError::BadSignature(signature));
    }

    let version = r.u16()?;
    if version != VERSION {
        return Err(LoadError::UnsupportedVersion(version));
    }

    let string_count = r.u32()? as usize;
    let mut strings = Vec::with_capacity(string_count);
    for _ in 0..string_count {
        strings.push(r.string()?);
    }
    let get_string = |idx: u32, strings: &[String]| -> Result<String, LoadError> {
        strings
            .get(idx as usize)
            .cloned()
            .ok_or(LoadError::BadStringIndex(idx))
    };

    let module_count = r.u32()? as usize;
    let mut modules = Vec::with_capacity(module_count);
    for _ in 0..module_count {
        let name_idx = r.index()?;
        let path_idx = r.index()?;
        let literal_count = r.u32()? as usize;
        let mut literals = Vec::with_capacity(literal_count);
        for _ in 0..literal_count {
            let lit_idx = r.index()?;
            literals.push(get_string(lit_idx, &strings)?);
        }
        let body = read_code_block(&mut r, &strings)?;
        modules.push(Module {
            name: get_string(name_idx, &strings)?,
            source_path: get_string(path_idx, &strings)?,
            literals,
            body,
        });
    }

    if modules.is_empty() {
        return Err(LoadError::NoModules);
    }

    Ok(Image {
        modules,
        entry_module: 0,
    })
}

fn read_code_block(r: &mut Reader<'_>, strings: &[String]) -> Result<CodeBlock, LoadError> {
    let name_idx = r.index()?;
    let file_idx = r.index()?;
    let line = r.u32()?;
    let locals_count = r.u16()?;
    let registers_count = r.u16()?;

    let instruction_count = r.u32()? as usize;
    let mut instructions = Vec::with_capacity(instruction_count);
    for _ in 0..instruction_count {
        instructions.push(Instruction::decode(r)?);
    }

    let catch_count = r.u32()? as usize;
    let mut catch_table = Vec::with_capacity(catch_count);
    for _ in 0..catch_count {
        catch_table.push(CatchEntry {
            start: r.u32()?,
            end: r.u32()?,
            handler_offset: r.u32()?,
            handler_register: r.u16()?,
        });
    }

    let block = CodeBlock {
        name: strings
            .get(name_idx as usize)
            .cloned()
            .ok_or(LoadError::BadStringIndex(name_idx))?,
        file: strings
            .get(file_idx as usize)
            .cloned()
            .ok_or(LoadError::BadStringIndex(file_idx))?,
        line,
        locals_count,
        registers_count,
        instructions,
        catch_table,
    };
    validate_registers(&block)?;
    Ok(block)
}

/// Checks every register operand an instruction reads or writes against the
/// block's own `registers_count`, so a malformed or hand-rolled image can
/// never hand the interpreter an out-of-range register index (§4.7, §7: an
/// interpreter fault must surface as a process panic, never a host-level
/// out-of-bounds access).
fn validate_registers(code: &CodeBlock) -> Result<(), LoadError> {
    let count = code.registers_count;
    let check = |r: u16| -> Result<(), LoadError> {
        if r < count {
            Ok(())
        } else {
            Err(LoadError::BadRegister(r, count))
        }
    };
    let check_range = |start: u16, n: u16| -> Result<(), LoadError> {
        let end = u32::from(start) + u32::from(n);
        if end <= u32::from(count) {
            Ok(())
        } else {
            Err(LoadError::BadRegister(start, count))
        }
    };

    for instr in &code.instructions {
        match *instr {
            Instruction::LoadNil { dst }
            | Instruction::LoadBool { dst, .. }
            | Instruction::LoadInt { dst, .. }
            | Instruction::LoadLiteral { dst, .. }
            | Instruction::Spawn { dst, .. }
            | Instruction::Receive { dst } => check(dst)?,
            Instruction::Move { dst, src } | Instruction::IntToString { dst, src } => {
                check(dst)?;
                check(src)?;
            }
            Instruction::Add { dst, lhs, rhs }
            | Instruction::Sub { dst, lhs, rhs }
            | Instruction::Mul { dst, lhs, rhs }
            | Instruction::Div { dst, lhs, rhs }
            | Instruction::Mod { dst, lhs, rhs }
            | Instruction::Eq { dst, lhs, rhs }
            | Instruction::Lt { dst, lhs, rhs }
            | Instruction::Le { dst, lhs, rhs }
            | Instruction::Gt { dst, lhs, rhs }
            | Instruction::Ge { dst, lhs, rhs } => {
                check(dst)?;
                check(lhs)?;
                check(rhs)?;
            }
            Instruction::NewArray { dst, len_reg } => {
                check(dst)?;
                check(len_reg)?;
            }
            Instruction::NewTuple { dst, start, count: n } => {
                check(dst)?;
                check_range(start, n)?;
            }
            Instruction::NewInstance { dst, class, .. } => {
                check(dst)?;
                check(class)?;
            }
            Instruction::GetField { dst, object, .. } => {
                check(dst)?;
                check(object)?;
            }
            Instruction::SetField { object, value, .. } => {
                check(object)?;
                check(value)?;
            }
            Instruction::GetElement { dst, array, index } => {
                check(dst)?;
                check(array)?;
                check(index)?;
            }
            Instruction::SetElement { array, index, value } => {
                check(array)?;
                check(index)?;
                check(value)?;
            }
            Instruction::CallMethod { dst, receiver, arg_start, arg_count, .. } => {
                check(dst)?;
                check(receiver)?;
                check_range(arg_start, arg_count)?;
            }
            Instruction::TailCallMethod { receiver, arg_start, arg_count, .. } => {
                check(receiver)?;
                check_range(arg_start, arg_count)?;
            }
            Instruction::InvokeClosure { dst, closure, arg_start, arg_count } => {
                check(dst)?;
                check(closure)?;
                check_range(arg_start, arg_count)?;
            }
            Instruction::Return { value } | Instruction::Throw { value } => check(value)?,
            Instruction::MakeClosure { dst, capture_start, capture_count, .. } => {
                check(dst)?;
                check_range(capture_start, capture_count)?;
            }
            Instruction::JumpIfFalse { cond, .. } | Instruction::JumpIfTrue { cond, .. } => {
                check(cond)?;
            }
            Instruction::Send { target, value } => {
                check(target)?;
                check(value)?;
            }
            Instruction::IoRead { dst, fd, .. } => {
                check(dst)?;
                check(fd)?;
            }
            Instruction::IoWrite { fd, data } => {
                check(fd)?;
                check(data)?;
            }
            Instruction::FfiCall { dst, arg_start, arg_count, .. } => {
                check(dst)?;
                check_range(arg_start, arg_count)?;
            }
            Instruction::ReturnNil
            | Instruction::Jump { .. }
            | Instruction::Sleep { .. }
            | Instruction::Safepoint
            | Instruction::Yield => {}
        }
    }
    Ok(())
}

/// Reads an image from a file path, enforcing the size limit before loading
/// the whole thing into memory.
pub fn load_file(path: &std::path::Path) -> Result<Image, LoadError> {
    use std::io::Read;
    let metadata = std::fs::metadata(path)?;
    if metadata.len() > MAX_IMAGE_SIZE {
        return Err(LoadError::TooLarge);
    }
    let mut file = std::fs::File::open(path)?;
    let mut bytes = Vec::with_capacity(metadata.len() as usize);
    file.read_to_end(&mut bytes)?;
    load(&bytes)
}

/// Encodes an [`Image`] back to bytes in the documented format. Used by
/// tests and by embedders that build images programmatically rather than
/// through the (external) compiler toolchain.
pub mod writer {
    use super::{CatchEntry, LoadError, SIGNATURE, VERSION};
    use crate::interpreter::Instruction;

    #[derive(Default)]
    pub struct ImageBuilder {
        strings: Vec<String>,
        modules: Vec<ModuleBuilder>,
    }

    struct ModuleBuilder {
        name: u32,
        path: u32,
        literals: Vec<u32>,
        body: CodeBlockBuilder,
    }

    pub struct CodeBlockBuilder {
        name: u32,
        file: u32,
        line: u32,
        locals_count: u16,
        registers_count: u16,
        instructions: Vec<Instruction>,
        catch_table: Vec<CatchEntry>,
    }

    impl ImageBuilder {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn intern(&mut self, s: &str) -> u32 {
            if let Some(idx) = self.strings.iter().position(|existing| existing == s) {
                return idx as u32;
            }
            self.strings.push(s.to_string());
            (self.strings.len() - 1) as u32
        }

        pub fn intern_str(&mut self, s: &str) -> u32 {
            self.intern(s)
        }

        pub fn add_module(
            &mut self,
            name: &str,
            path: &str,
            literals: &[&str],
            code: CodeBlockBuilder,
        ) -> &mut Self {
            let name = self.intern(name);
            let path = self.intern(path);
            let literal_ids = literals.iter().map(|l| self.intern(l)).collect();
            self.modules.push(ModuleBuilder {
                name,
                path,
                literals: literal_ids,
                body: code,
            });
            self
        }

        /// Serializes to bytes; errors only if an `Instruction` refuses to
        /// encode, which the current instruction set never does.
        pub fn build(self) -> Result<Vec<u8>, LoadError> {
            let mut out = Vec::new();
            out.extend_from_slice(&SIGNATURE);
            out.extend_from_slice(&VERSION.to_le_bytes());
            out.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
            for s in &self.strings {
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            out.extend_from_slice(&(self.modules.len() as u32).to_le_bytes());
            for module in &self.modules {
                write_index(&mut out, module.name);
                write_index(&mut out, module.path);
                out.extend_from_slice(&(module.literals.len() as u32).to_le_bytes());
                for lit in &module.literals {
                    write_index(&mut out, *lit);
                }
                write_code_block(&mut out, &module.body);
            }
            Ok(out)
        }
    }

    impl CodeBlockBuilder {
        #[must_use]
        pub fn new(
            name: u32,
            file: u32,
            line: u32,
            locals_count: u16,
            registers_count: u16,
            instructions: Vec<Instruction>,
        ) -> Self {
            CodeBlockBuilder {
                name,
                file,
                line,
                locals_count,
                registers_count,
                instructions,
                catch_table: Vec::new(),
            }
        }

        #[must_use]
        pub fn with_catch(mut self, entry: CatchEntry) -> Self {
            self.catch_table.push(entry);
            self
        }
    }

    fn write_index(out: &mut Vec<u8>, idx: u32) {
        if idx < 0xFFFF {
            out.extend_from_slice(&(idx as u16).to_le_bytes());
        } else {
            out.extend_from_slice(&0xFFFFu16.to_le_bytes());
            out.extend_from_slice(&idx.to_le_bytes());
        }
    }

    fn write_code_block(out: &mut Vec<u8>, code: &CodeBlockBuilder) {
        write_index(out, code.name);
        write_index(out, code.file);
        out.extend_from_slice(&code.line.to_le_bytes());
        out.extend_from_slice(&code.locals_count.to_le_bytes());
        out.extend_from_slice(&code.registers_count.to_le_bytes());
        out.extend_from_slice(&(code.instructions.len() as u32).to_le_bytes());
        for inst in &code.instructions {
            inst.encode(out);
        }
        out.extend_from_slice(&(code.catch_table.len() as u32).to_le_bytes());
        for entry in &code.catch_table {
            out.extend_from_slice(&entry.start.to_le_bytes());
            out.extend_from_slice(&entry.end.to_le_bytes());
            out.extend_from_slice(&entry.handler_offset.to_le_bytes());
            out.extend_from_slice(&entry.handler_register.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::writer::{CodeBlockBuilder, ImageBuilder};
    use super::*;
    use crate::interpreter::Instruction;

    #[test]
    fn roundtrip_minimal_image() {
        let mut builder = ImageBuilder::new();
        let code = CodeBlockBuilder::new(0, 1, 1, 0, 2, vec![Instruction::ReturnNil]);
        builder.add_module("main", "main.src", &[], code);
        let bytes = builder.build().unwrap();

        let image = load(&bytes).expect("roundtrip should load");
        assert_eq!(image.modules.len(), 1);
        assert_eq!(image.modules[0].name, "main");
        assert_eq!(image.modules[0].body.instructions.len(), 1);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut bytes = vec![b'X', b'X', b'X', b'X'];
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        assert!(matches!(load(&bytes), Err(LoadError::BadSignature(_))));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = SIGNATURE.to_vec();
        bytes.extend_from_slice(&999u16.to_le_bytes());
        assert!(matches!(
            load(&bytes),
            Err(LoadError::UnsupportedVersion(999))
        ));
    }

    #[test]
    fn rejects_truncated_image() {
        let bytes = SIGNATURE.to_vec();
        assert!(matches!(load(&bytes), Err(LoadError::Truncated(_))));
    }

    #[test]
    fn rejects_an_instruction_referencing_a_register_past_the_block_count() {
        let mut builder = ImageBuilder::new();
        // registers_count is 2 (valid indices 0-1); dst: 5 is out of range.
        let code = CodeBlockBuilder::new(0, 1, 1, 0, 2, vec![Instruction::LoadNil { dst: 5 }]);
        builder.add_module("main", "main.src", &[], code);
        let bytes = builder.build().unwrap();

        assert!(matches!(load(&bytes), Err(LoadError::BadRegister(5, 2))));
    }

    #[test]
    fn rejects_a_call_argument_range_that_runs_past_the_block_count() {
        let mut builder = ImageBuilder::new();
        let code = CodeBlockBuilder::new(
            0,
            1,
            1,
            0,
            4,
            vec![Instruction::InvokeClosure { dst: 0, closure: 1, arg_start: 2, arg_count: 4 }],
        );
        builder.add_module("main", "main.src", &[], code);
        let bytes = builder.build().unwrap();

        assert!(matches!(load(&bytes), Err(LoadError::BadRegister(2, 4))));
    }

    #[test]
    fn rejects_empty_module_table() {
        let mut bytes = SIGNATURE.to_vec();
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes()); // string count
        bytes.extend_from_slice(&0u32.to_le_bytes()); // module count
        assert!(matches!(load(&bytes), Err(LoadError::NoModules)));
    }
}
