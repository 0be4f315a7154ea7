//! Binary record stream codec
//!
//! A stream is a sequence of messages, each introduced by a one-byte opcode:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ 0x01 RECORD  │ uvarint type_id, uvarint len, body[len]      │
//! │ 0x10 RECORD  │ typedef: uvarint n, n × (name, type_id)      │
//! │ 0x11 ARRAY   │ typedef: uvarint inner_id                    │
//! │ 0x12 SET     │ typedef: uvarint inner_id                    │
//! │ 0x13 MAP     │ typedef: uvarint key_id, uvarint value_id    │
//! │ 0x14 UNION   │ typedef: uvarint n, n × type_id              │
//! │ 0x15 ALIAS   │ typedef: name, uvarint type_id               │
//! │ 0x16 ENUM    │ typedef: uvarint n, n × name                 │
//! │ 0x20 LZ4     │ uvarint raw_len, uvarint len, crc32, data    │
//! │ 0xff EOS     │ end of stream: type dictionary resets        │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Typedefs are numbered implicitly from `FIRST_COMPOUND_ID` in the order
//! they appear within a stream. The offset immediately after an EOS is a
//! sync point: a reader seeked there needs no earlier state.

use crate::error::{ZarError, ZarResult};
use crate::record::data::Record;
use crate::record::types::{AliasType, Column, Type, TypeContext, FIRST_COMPOUND_ID, ID_INT64};
use crate::record::varint::{put_uvarint, read_uvarint, truncated};
use crate::record::RecordReader;
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

pub const OP_RECORD: u8 = 0x01;
pub const TYPEDEF_RECORD: u8 = 0x10;
pub const TYPEDEF_ARRAY: u8 = 0x11;
pub const TYPEDEF_SET: u8 = 0x12;
pub const TYPEDEF_MAP: u8 = 0x13;
pub const TYPEDEF_UNION: u8 = 0x14;
pub const TYPEDEF_ALIAS: u8 = 0x15;
pub const TYPEDEF_ENUM: u8 = 0x16;
pub const OP_COMPRESSED: u8 = 0x20;
pub const OP_EOS: u8 = 0xff;

/// Bytes that follow an EOS when a stream opens with an array-of-int64
/// typedef followed by a record typedef.
pub const TRAILER_SIGNATURE: [u8; 3] = [TYPEDEF_ARRAY, ID_INT64 as u8, TYPEDEF_RECORD];

/// Upper bound on a single message body
const MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024;

/// Writer options
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterOptions {
    /// Compress messages into LZ4 blocks of roughly this many bytes (0 = off)
    pub lz4_block_size: usize,
    /// End the stream automatically after this many records (0 = never)
    pub stream_records_max: usize,
}

/// Stream writer
pub struct Writer<W: Write> {
    out: W,
    position: u64,
    types: HashMap<Type, u32>,
    next_id: u32,
    block: Vec<u8>,
    opts: WriterOptions,
    stream_records: usize,
    last_sync: u64,
}

impl<W: Write> Writer<W> {
    pub fn new(out: W) -> Self {
        Self::with_options(out, WriterOptions::default())
    }

    pub fn with_options(out: W, opts: WriterOptions) -> Self {
        Self {
            out,
            position: 0,
            types: HashMap::new(),
            next_id: FIRST_COMPOUND_ID,
            block: Vec::new(),
            opts,
            stream_records: 0,
            last_sync: 0,
        }
    }

    /// Bytes handed to the underlying writer so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Offset of the most recent sync point.
    pub fn last_sync(&self) -> u64 {
        self.last_sync
    }

    /// Uncompressed bytes waiting for the current LZ4 block.
    pub fn buffered(&self) -> usize {
        self.block.len()
    }

    /// Records written since the last sync point.
    pub fn stream_records(&self) -> usize {
        self.stream_records
    }

    pub fn write(&mut self, rec: &Record) -> ZarResult<()> {
        let id = self.define(rec.ty())?;
        let body = rec.bytes();
        let mut msg = Vec::with_capacity(body.len() + 8);
        msg.push(OP_RECORD);
        put_uvarint(&mut msg, id as u64);
        put_uvarint(&mut msg, body.len() as u64);
        msg.extend_from_slice(&body);
        self.emit(&msg)?;
        self.stream_records += 1;
        if self.opts.stream_records_max > 0 && self.stream_records >= self.opts.stream_records_max
        {
            self.end_stream()?;
        }
        Ok(())
    }

    /// Emit typedefs for `ty` and its children as needed; returns its local id.
    fn define(&mut self, ty: &Type) -> ZarResult<u32> {
        if let Some(id) = ty.primitive_id() {
            return Ok(id);
        }
        if let Some(&id) = self.types.get(ty) {
            return Ok(id);
        }
        let mut msg = Vec::new();
        match ty {
            Type::Record(cols) => {
                let mut ids = Vec::with_capacity(cols.len());
                for col in cols.iter() {
                    ids.push(self.define(&col.ty)?);
                }
                msg.push(TYPEDEF_RECORD);
                put_uvarint(&mut msg, cols.len() as u64);
                for (col, id) in cols.iter().zip(ids) {
                    put_str(&mut msg, &col.name);
                    put_uvarint(&mut msg, id as u64);
                }
            }
            Type::Array(inner) | Type::Set(inner) => {
                let id = self.define(inner)?;
                msg.push(if matches!(ty, Type::Set(_)) {
                    TYPEDEF_SET
                } else {
                    TYPEDEF_ARRAY
                });
                put_uvarint(&mut msg, id as u64);
            }
            Type::Map(kv) => {
                let key = self.define(&kv.0)?;
                let val = self.define(&kv.1)?;
                msg.push(TYPEDEF_MAP);
                put_uvarint(&mut msg, key as u64);
                put_uvarint(&mut msg, val as u64);
            }
            Type::Union(types) => {
                let mut ids = Vec::with_capacity(types.len());
                for t in types.iter() {
                    ids.push(self.define(t)?);
                }
                msg.push(TYPEDEF_UNION);
                put_uvarint(&mut msg, ids.len() as u64);
                for id in ids {
                    put_uvarint(&mut msg, id as u64);
                }
            }
            Type::Alias(alias) => {
                let id = self.define(&alias.ty)?;
                msg.push(TYPEDEF_ALIAS);
                put_str(&mut msg, &alias.name);
                put_uvarint(&mut msg, id as u64);
            }
            Type::Enum(symbols) => {
                msg.push(TYPEDEF_ENUM);
                put_uvarint(&mut msg, symbols.len() as u64);
                for sym in symbols.iter() {
                    put_str(&mut msg, sym);
                }
            }
            _ => return Err(ZarError::Validation(format!("cannot define type {}", ty))),
        }
        self.emit(&msg)?;
        let id = self.next_id;
        self.next_id += 1;
        self.types.insert(ty.clone(), id);
        Ok(id)
    }

    fn emit(&mut self, msg: &[u8]) -> ZarResult<()> {
        if self.opts.lz4_block_size == 0 {
            self.out.write_all(msg)?;
            self.position += msg.len() as u64;
            return Ok(());
        }
        self.block.extend_from_slice(msg);
        if self.block.len() >= self.opts.lz4_block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> ZarResult<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let compressed = lz4_flex::compress(&self.block);
        let mut header = Vec::with_capacity(16);
        header.push(OP_COMPRESSED);
        put_uvarint(&mut header, self.block.len() as u64);
        put_uvarint(&mut header, compressed.len() as u64);
        header.extend_from_slice(&crc32fast::hash(&compressed).to_le_bytes());
        self.out.write_all(&header)?;
        self.out.write_all(&compressed)?;
        self.position += (header.len() + compressed.len()) as u64;
        self.block.clear();
        Ok(())
    }

    /// Close the current stream. The returned offset is a sync point.
    pub fn end_stream(&mut self) -> ZarResult<u64> {
        self.flush_block()?;
        self.out.write_all(&[OP_EOS])?;
        self.position += 1;
        self.reset_stream();
        Ok(self.position)
    }

    fn reset_stream(&mut self) {
        self.types.clear();
        self.next_id = FIRST_COMPOUND_ID;
        self.stream_records = 0;
        self.last_sync = self.position;
    }

    /// Append already-encoded stream bytes that end at a sync point.
    pub fn append_raw<R: Read>(&mut self, src: &mut R) -> ZarResult<u64> {
        self.flush_block()?;
        let n = std::io::copy(src, &mut self.out)?;
        self.position += n;
        self.reset_stream();
        Ok(n)
    }

    pub fn flush(&mut self) -> ZarResult<()> {
        self.flush_block()?;
        self.out.flush()?;
        Ok(())
    }

    /// Flush pending data and hand back the underlying writer.
    pub fn into_inner(mut self) -> ZarResult<W> {
        self.flush()?;
        Ok(self.out)
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_uvarint(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

/// Wraps a reader and counts consumed bytes.
struct Counting<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for Counting<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

enum TypeDef {
    Record(Vec<(String, u32)>),
    Array(u32),
    Set(u32),
    Map(u32, u32),
    Union(Vec<u32>),
    Alias(String, u32),
    Enum(Vec<String>),
}

enum Message {
    Eos,
    Compressed { raw_len: usize, crc: u32, data: Vec<u8> },
    TypeDef(TypeDef),
    Record { id: u32, body: Vec<u8> },
}

/// Stream reader
pub struct Reader<R: Read> {
    input: Counting<R>,
    zctx: Arc<TypeContext>,
    locals: Vec<Type>,
    block: Option<Cursor<Vec<u8>>>,
}

impl<R: Read> Reader<R> {
    pub fn new(input: R, zctx: Arc<TypeContext>) -> Self {
        Self {
            input: Counting {
                inner: input,
                count: 0,
            },
            zctx,
            locals: Vec::new(),
            block: None,
        }
    }

    /// Start counting positions from `offset` (for readers opened mid-file).
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.input.count = offset;
        self
    }

    /// Bytes consumed from the underlying input.
    pub fn position(&self) -> u64 {
        self.input.count
    }

    pub fn context(&self) -> &Arc<TypeContext> {
        &self.zctx
    }

    /// Read the next record; `None` at end of input.
    pub fn read(&mut self) -> ZarResult<Option<Record>> {
        loop {
            let in_block = self.block_remaining() > 0;
            let msg = {
                let src: &mut dyn Read = match self.block.as_mut() {
                    Some(block) if in_block => block,
                    _ => &mut self.input,
                };
                match read_message(src)? {
                    Some(msg) => msg,
                    None => return Ok(None),
                }
            };
            match msg {
                Message::Eos => {
                    if in_block {
                        return Err(self.corrupt("end of stream inside compressed block"));
                    }
                    self.locals.clear();
                }
                Message::Compressed { raw_len, crc, data } => {
                    if in_block {
                        return Err(self.corrupt("nested compressed block"));
                    }
                    if crc32fast::hash(&data) != crc {
                        return Err(self.corrupt("compressed block checksum mismatch"));
                    }
                    let raw = lz4_flex::decompress(&data, raw_len)
                        .map_err(|e| self.corrupt(&format!("lz4: {}", e)))?;
                    self.block = Some(Cursor::new(raw));
                }
                Message::TypeDef(def) => {
                    let ty = self.resolve(def)?;
                    self.locals.push(self.zctx.canonical(&ty));
                }
                Message::Record { id, body } => {
                    let ty = self.lookup(id)?;
                    return Record::decode(ty, &body).map(Some);
                }
            }
        }
    }

    fn block_remaining(&self) -> usize {
        match &self.block {
            Some(block) => block.get_ref().len() - block.position() as usize,
            None => 0,
        }
    }

    fn corrupt(&self, what: &str) -> ZarError {
        ZarError::Corrupt(format!("{} at offset {}", what, self.input.count))
    }

    fn lookup(&self, id: u32) -> ZarResult<Type> {
        if let Some(ty) = Type::from_primitive_id(id) {
            return Ok(ty);
        }
        id.checked_sub(FIRST_COMPOUND_ID)
            .and_then(|idx| self.locals.get(idx as usize))
            .cloned()
            .ok_or_else(|| self.corrupt(&format!("undefined type id {}", id)))
    }

    fn resolve(&self, def: TypeDef) -> ZarResult<Type> {
        let ty = match def {
            TypeDef::Record(cols) => {
                let mut columns = Vec::with_capacity(cols.len());
                for (name, id) in cols {
                    columns.push(Column::new(name, self.lookup(id)?));
                }
                return self.zctx.lookup_record(columns);
            }
            TypeDef::Array(id) => Type::Array(Arc::new(self.lookup(id)?)),
            TypeDef::Set(id) => Type::Set(Arc::new(self.lookup(id)?)),
            TypeDef::Map(k, v) => Type::Map(Arc::new((self.lookup(k)?, self.lookup(v)?))),
            TypeDef::Union(ids) => {
                let types = ids
                    .into_iter()
                    .map(|id| self.lookup(id))
                    .collect::<ZarResult<Vec<_>>>()?;
                return self.zctx.lookup_union(types);
            }
            TypeDef::Alias(name, id) => Type::Alias(Arc::new(AliasType {
                name,
                ty: self.lookup(id)?,
            })),
            TypeDef::Enum(symbols) => Type::Enum(symbols.into()),
        };
        Ok(ty)
    }
}

impl<R: Read + Seek> Reader<R> {
    /// Reposition at a sync point.
    pub fn seek(&mut self, offset: u64) -> ZarResult<()> {
        self.input.inner.seek(SeekFrom::Start(offset))?;
        self.input.count = offset;
        self.locals.clear();
        self.block = None;
        Ok(())
    }
}

impl<R: Read + Send> RecordReader for Reader<R> {
    fn read(&mut self) -> ZarResult<Option<Record>> {
        Reader::read(self)
    }

    fn position(&self) -> Option<u64> {
        Some(Reader::position(self))
    }
}

fn read_message(src: &mut dyn Read) -> ZarResult<Option<Message>> {
    let mut op = [0u8; 1];
    loop {
        match src.read(&mut op) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let msg = match op[0] {
        OP_EOS => Message::Eos,
        OP_RECORD => {
            let id = read_id(src)?;
            let body = read_bytes(src)?;
            Message::Record { id, body }
        }
        OP_COMPRESSED => {
            let raw_len = read_len(src)? as usize;
            let len = read_len(src)? as usize;
            let mut crc = [0u8; 4];
            src.read_exact(&mut crc).map_err(truncated)?;
            let mut data = vec![0u8; len];
            src.read_exact(&mut data).map_err(truncated)?;
            Message::Compressed {
                raw_len,
                crc: u32::from_le_bytes(crc),
                data,
            }
        }
        TYPEDEF_RECORD => {
            let n = read_len(src)?;
            let mut cols = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let name = read_string(src)?;
                cols.push((name, read_id(src)?));
            }
            Message::TypeDef(TypeDef::Record(cols))
        }
        TYPEDEF_ARRAY => Message::TypeDef(TypeDef::Array(read_id(src)?)),
        TYPEDEF_SET => Message::TypeDef(TypeDef::Set(read_id(src)?)),
        TYPEDEF_MAP => {
            let k = read_id(src)?;
            Message::TypeDef(TypeDef::Map(k, read_id(src)?))
        }
        TYPEDEF_UNION => {
            let n = read_len(src)?;
            let mut ids = Vec::with_capacity(n as usize);
            for _ in 0..n {
                ids.push(read_id(src)?);
            }
            Message::TypeDef(TypeDef::Union(ids))
        }
        TYPEDEF_ALIAS => {
            let name = read_string(src)?;
            Message::TypeDef(TypeDef::Alias(name, read_id(src)?))
        }
        TYPEDEF_ENUM => {
            let n = read_len(src)?;
            let mut symbols = Vec::with_capacity(n as usize);
            for _ in 0..n {
                symbols.push(read_string(src)?);
            }
            Message::TypeDef(TypeDef::Enum(symbols))
        }
        other => {
            return Err(ZarError::Corrupt(format!("unknown opcode 0x{:02x}", other)));
        }
    };
    Ok(Some(msg))
}

fn read_len(src: &mut dyn Read) -> ZarResult<u64> {
    let n = read_uvarint(src)?;
    if n > MAX_MESSAGE_SIZE {
        return Err(ZarError::Corrupt(format!("message length {} too large", n)));
    }
    Ok(n)
}

fn read_id(src: &mut dyn Read) -> ZarResult<u32> {
    u32::try_from(read_uvarint(src)?)
        .map_err(|_| ZarError::Corrupt("type id out of range".to_string()))
}

fn read_bytes(src: &mut dyn Read) -> ZarResult<Vec<u8>> {
    let len = read_len(src)? as usize;
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

fn read_string(src: &mut dyn Read) -> ZarResult<String> {
    String::from_utf8(read_bytes(src)?)
        .map_err(|e| ZarError::Corrupt(format!("invalid utf-8 name: {}", e)))
}
