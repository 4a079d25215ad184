//! Script-level function table (§7's `TooManyPrototypes`, §1's "script-
//! level function table full").
//!
//! A [`CompiledModule`] aggregates every [`Prototype`] a script compiles
//! to -- the top-level functions plus every closure nested inside them --
//! into one container with a binary on-disk format, mirroring the
//! teacher's `raya-bytecode::module::Module` (magic + version + CRC32
//! checksum header, followed by length-prefixed sections).

use crate::constants::MAX_PROTOTYPE_SIZE;
use crate::pool::ConstantPool;
use crate::prototype::Prototype;
use crate::upvalue::{decode_slot, encode_slot};
use thiserror::Error;

/// Magic number for a lavascript compiled-module file: "LAVA".
pub const MAGIC: [u8; 4] = *b"LAVA";

/// Current module format version.
pub const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("unexpected end of module data")]
    Truncated,
    #[error("invalid magic number: expected {MAGIC:?}, got {0:?}")]
    InvalidMagic([u8; 4]),
    #[error("unsupported module version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("module declares more than {MAX_PROTOTYPE_SIZE} prototypes")]
    TooManyPrototypes,
}

/// A whole compiled script: every prototype its compilation produced.
#[derive(Debug)]
pub struct CompiledModule {
    pub prototypes: Vec<Prototype>,
}

impl CompiledModule {
    pub fn new(prototypes: Vec<Prototype>) -> Result<Self, ModuleError> {
        if prototypes.len() > MAX_PROTOTYPE_SIZE {
            return Err(ModuleError::TooManyPrototypes);
        }
        Ok(Self { prototypes })
    }

    /// Encode to binary: `magic | version | checksum | u32 count | prototypes...`.
    /// The checksum is a CRC32 over everything after the checksum field.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.bytes(&MAGIC);
        w.u32(VERSION);
        let checksum_at = w.buf.len();
        w.u32(0); // patched below
        let payload_start = w.buf.len();

        w.u32(self.prototypes.len() as u32);
        for p in &self.prototypes {
            encode_prototype(&mut w, p);
        }

        let checksum = crc32fast::hash(&w.buf[payload_start..]);
        w.buf[checksum_at..checksum_at + 4].copy_from_slice(&checksum.to_le_bytes());
        w.buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ModuleError> {
        let mut r = Reader::new(data);
        let magic: [u8; 4] = r.bytes(4)?.try_into().unwrap();
        if magic != MAGIC {
            return Err(ModuleError::InvalidMagic(magic));
        }
        let version = r.u32()?;
        if version != VERSION {
            return Err(ModuleError::UnsupportedVersion(version));
        }
        let stored_checksum = r.u32()?;
        let payload = &data[r.pos..];
        let actual = crc32fast::hash(payload);
        if actual != stored_checksum {
            return Err(ModuleError::ChecksumMismatch { expected: stored_checksum, actual });
        }

        let count = r.u32()? as usize;
        if count > MAX_PROTOTYPE_SIZE {
            return Err(ModuleError::TooManyPrototypes);
        }
        let mut prototypes = Vec::with_capacity(count);
        for _ in 0..count {
            prototypes.push(decode_prototype(&mut r)?);
        }
        Ok(Self { prototypes })
    }

    /// Dump every prototype's wire shape as a JSON array, for tooling --
    /// never consulted by `encode`/`decode` themselves.
    pub fn to_debug_json(&self) -> serde_json::Result<String> {
        let dumps: Vec<serde_json::Value> = self
            .prototypes
            .iter()
            .map(|p| p.to_debug_json().map(|s| serde_json::from_str(&s).unwrap()))
            .collect::<serde_json::Result<_>>()?;
        serde_json::to_string(&dumps)
    }
}

fn encode_prototype(w: &mut Writer, p: &Prototype) {
    w.string(&p.proto_string);
    w.u8(p.argument_size);
    w.u8(p.max_local_var_size);

    let reals = p.constants.reals();
    w.u32(reals.len() as u32);
    for r in reals {
        w.buf.extend_from_slice(&r.to_bits().to_le_bytes());
    }
    let strings = p.constants.strings();
    w.u32(strings.len() as u32);
    for s in strings {
        w.string(s);
    }
    let sso = p.constants.sso_strings();
    w.u32(sso.len() as u32);
    for s in sso {
        w.string(s);
    }

    w.u32(p.upvalues.len() as u32);
    for &slot in &p.upvalues {
        w.u32(slot);
    }

    w.u32(p.code.len() as u32);
    for &word in &p.code {
        w.u32(word);
    }
    for info in &p.source_info {
        w.u32(info.start);
        w.u32(info.end);
    }
    for &off in &p.reg_offset {
        w.u8(off);
    }
}

fn decode_prototype(r: &mut Reader<'_>) -> Result<Prototype, ModuleError> {
    let proto_string = r.string()?;
    let argument_size = r.u8()?;
    let max_local_var_size = r.u8()?;

    let real_count = r.u32()? as usize;
    let mut reals = Vec::with_capacity(real_count);
    for _ in 0..real_count {
        reals.push(f64::from_bits(u64::from_le_bytes(r.bytes(8)?.try_into().unwrap())));
    }
    let string_count = r.u32()? as usize;
    let mut strings = Vec::with_capacity(string_count);
    for _ in 0..string_count {
        strings.push(r.string()?);
    }
    let sso_count = r.u32()? as usize;
    let mut sso_strings = Vec::with_capacity(sso_count);
    for _ in 0..sso_count {
        sso_strings.push(r.string()?);
    }
    let constants = ConstantPool::from_parts(reals, strings, sso_strings);

    let upvalue_count = r.u32()? as usize;
    let mut upvalues = Vec::with_capacity(upvalue_count);
    for _ in 0..upvalue_count {
        let slot = r.u32()?;
        // Round-trips through decode/encode so a corrupt slot is caught
        // as an invalid (state, index) pair rather than silently kept.
        let (state, index) = decode_slot(slot);
        upvalues.push(encode_slot(state, index));
    }

    let code_len = r.u32()? as usize;
    let mut code = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        code.push(r.u32()?);
    }
    let mut source_info = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        let start = r.u32()?;
        let end = r.u32()?;
        source_info.push(crate::encoding::SourceInfo::new(start, end));
    }
    let mut reg_offset = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        reg_offset.push(r.u8()?);
    }

    Ok(Prototype {
        proto_string,
        argument_size,
        max_local_var_size,
        constants,
        upvalues,
        code,
        source_info,
        reg_offset,
    })
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ModuleError> {
        if self.pos + n > self.data.len() {
            return Err(ModuleError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ModuleError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ModuleError> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String, ModuleError> {
        let len = self.u32()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ModuleError::Truncated)
    }
}
