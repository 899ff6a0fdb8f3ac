//! The serialized program container.
//!
//! A snapshot is the on-disk form the pipeline consumes and re-emits: a
//! small header followed by one record per compiled function. Each record
//! carries the header flags, the literal boundary counts (8-bit wide, or
//! 16-bit when [`FunctionFlags::UINT16_ARGUMENTS`] is set), the literal
//! pool and the raw code bytes.
//!
//! ```text
//! magic "BPRS" | version u16 | function count u32
//! per function:
//!   flags u16
//!   argument_end register_end ident_end const_literal_end literal_end
//!   stack_limit                (u8 or u16 each, per the width flag)
//!   literal pool               (literal_end x u64)
//!   code length u32 | code bytes
//! ```
//!
//! All integers are little-endian. Reading is zero-copy up to the per-field
//! parse: [`Snapshot::open`] memory-maps the file and never loads it twice.
//! Unlike the in-pipeline contract violations, damaged container data is a
//! recoverable [`Error::Malformed`]/[`Error::OutOfBounds`].

use std::{fs, path::Path};

use memmap2::Mmap;
use tracing::debug;

use crate::{
    bytecode::{
        encode_function, Function, FunctionFlags, LiteralBoundaries, LiteralPool, OpcodeTable,
    },
    Error, Result,
};

const MAGIC: [u8; 4] = *b"BPRS";
const VERSION: u16 = 1;

/// Bounds-checked little-endian cursor over the raw container bytes.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(Error::OutOfBounds)?;
        let slice = self.data.get(self.pos..end).ok_or(Error::OutOfBounds)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

/// A parsed program container holding its function units.
#[derive(Debug)]
pub struct Snapshot {
    functions: Vec<Function>,
}

impl Snapshot {
    /// Memory-maps and parses a container file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileError`] if the file cannot be opened,
    /// [`Error::Empty`] for a zero-length file, and the parse errors of
    /// [`Snapshot::from_bytes`] otherwise.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = fs::File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(Error::Empty);
        }

        let mmap = match unsafe { Mmap::map(&file) } {
            Ok(mmap) => mmap,
            Err(error) => return Err(Error::Error(error.to_string())),
        };

        Self::from_bytes(&mmap)
    }

    /// Parses a container from a byte buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Empty`] for an empty buffer, [`Error::Malformed`]
    /// for a bad magic, flag or boundary encoding, [`Error::NotSupported`]
    /// for an unknown version and [`Error::OutOfBounds`] for truncation.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Empty);
        }

        let mut reader = Reader::new(data);

        let magic = reader.bytes(4)?;
        if magic != MAGIC {
            return Err(malformed_error!("bad container magic {:02x?}", magic));
        }
        if reader.u16()? != VERSION {
            return Err(Error::NotSupported);
        }

        let count = reader.u32()?;
        let mut functions = Vec::new();
        for _ in 0..count {
            functions.push(read_function(&mut reader)?);
        }

        debug!(functions = functions.len(), "snapshot parsed");
        Ok(Self { functions })
    }

    /// The parsed function units.
    #[must_use]
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Mutable access for the optimizer.
    pub fn functions_mut(&mut self) -> &mut [Function] {
        &mut self.functions
    }

    /// Serializes the container, re-encoding every decoded function's
    /// instruction stream. Functions never decoded keep their original code
    /// bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if a boundary no longer fits its
    /// encoded width or re-encoding fails.
    pub fn to_bytes(&self, table: &OpcodeTable) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&(self.functions.len() as u32).to_le_bytes());

        for func in &self.functions {
            write_function(&mut out, func, table)?;
        }
        Ok(out)
    }

    /// Serializes the container to a file.
    ///
    /// # Errors
    ///
    /// See [`Snapshot::to_bytes`]; additionally [`Error::FileError`] on
    /// write failure.
    pub fn write(&self, path: impl AsRef<Path>, table: &OpcodeTable) -> Result<()> {
        fs::write(path, self.to_bytes(table)?)?;
        Ok(())
    }
}

fn boundary(reader: &mut Reader<'_>, wide: bool) -> Result<u16> {
    if wide {
        reader.u16()
    } else {
        Ok(u16::from(reader.u8()?))
    }
}

fn read_function(reader: &mut Reader<'_>) -> Result<Function> {
    let raw_flags = reader.u16()?;
    let flags = FunctionFlags::from_bits(raw_flags)
        .ok_or_else(|| malformed_error!("unknown function flags {:#06x}", raw_flags))?;
    let wide = flags.contains(FunctionFlags::UINT16_ARGUMENTS);

    let argument_end = boundary(reader, wide)?;
    let register_end = boundary(reader, wide)?;
    let ident_end = boundary(reader, wide)?;
    let const_literal_end = boundary(reader, wide)?;
    let literal_end = boundary(reader, wide)?;
    let stack_limit = boundary(reader, wide)?;

    let bounds = LiteralBoundaries::new(
        flags,
        argument_end,
        register_end,
        ident_end,
        const_literal_end,
        literal_end,
        stack_limit,
    )?;

    let mut pool = Vec::with_capacity(usize::from(literal_end));
    for _ in 0..literal_end {
        pool.push(reader.u64()?);
    }

    let code_len = reader.u32()? as usize;
    let code = reader.bytes(code_len)?.to_vec();

    Ok(Function::new(flags, bounds, LiteralPool::new(pool), code))
}

fn write_function(out: &mut Vec<u8>, func: &Function, table: &OpcodeTable) -> Result<()> {
    let flags = func.flags();
    let wide = flags.contains(FunctionFlags::UINT16_ARGUMENTS);
    let bounds = func.bounds();

    out.extend_from_slice(&flags.bits().to_le_bytes());

    for value in [
        bounds.argument_end,
        bounds.register_end,
        bounds.ident_end,
        bounds.const_literal_end,
        bounds.literal_end,
        bounds.stack_limit,
    ] {
        if wide {
            out.extend_from_slice(&value.to_le_bytes());
        } else {
            let narrow = u8::try_from(value)
                .map_err(|_| malformed_error!("boundary {} exceeds the narrow width", value))?;
            out.push(narrow);
        }
    }

    for &value in func.pool().values() {
        out.extend_from_slice(&value.to_le_bytes());
    }

    let code = if func.instructions.is_empty() {
        func.code().to_vec()
    } else {
        encode_function(&func.instructions, table, bounds)?
    };
    out.extend_from_slice(&(code.len() as u32).to_le_bytes());
    out.extend_from_slice(&code);

    Ok(())
}
