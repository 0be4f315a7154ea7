//! Values and their body encoding
//!
//! Every value is stored tagged: a uvarint `0` for null, otherwise
//! `uvarint(len + 1)` followed by `len` payload bytes. Container payloads are
//! the concatenation of their tagged elements, so a record body is simply the
//! payload of its record value.
//!
//! ```text
//! int32/int64/time/duration  zigzag varint
//! uint64/enum                uvarint
//! float64                    8 bytes little-endian
//! bool                       1 byte
//! string/bytes               raw bytes
//! ip                         4 or 16 bytes
//! map                        key, value, key, value, ...
//! union                      uvarint selector, tagged value
//! ```

use crate::error::{ZarError, ZarResult};
use crate::record::types::Type;
use crate::record::varint::{put_uvarint, put_varint, uvarint, varint};
use crate::span::{format_ts, Ts};
use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Time(Ts),
    Duration(i64),
    Ip(IpAddr),
    Record(Vec<Value>),
    Array(Vec<Value>),
    Set(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Union(usize, Box<Value>),
    Enum(u64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Uint(_) | Value::Float(_) => 2,
            Value::Time(_) => 3,
            Value::Duration(_) => 4,
            Value::String(_) => 5,
            Value::Bytes(_) => 6,
            Value::Ip(_) => 7,
            Value::Enum(_) => 8,
            Value::Record(_) => 9,
            Value::Array(_) => 10,
            Value::Set(_) => 11,
            Value::Map(_) => 12,
            Value::Union(..) => 13,
        }
    }

    /// Total order over values. Nulls sort first; numbers compare across
    /// integer and float representations.
    pub fn compare(&self, other: &Value) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Uint(a), Uint(b)) => a.cmp(b),
            (Int(a), Uint(b)) => (*a as i128).cmp(&(*b as i128)),
            (Uint(a), Int(b)) => (*a as i128).cmp(&(*b as i128)),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Float(a), Int(b)) => a.total_cmp(&(*b as f64)),
            (Int(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Uint(b)) => a.total_cmp(&(*b as f64)),
            (Uint(a), Float(b)) => (*a as f64).total_cmp(b),
            (Time(a), Time(b)) | (Duration(a), Duration(b)) => a.cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Ip(a), Ip(b)) => a.cmp(b),
            (Enum(a), Enum(b)) => a.cmp(b),
            (Record(a), Record(b)) | (Array(a), Array(b)) | (Set(a), Set(b)) => {
                compare_seq(a, b)
            }
            (Map(a), Map(b)) => {
                for ((ak, av), (bk, bv)) in a.iter().zip(b.iter()) {
                    let ord = ak.compare(bk).then_with(|| av.compare(bv));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Union(sa, a), Union(sb, b)) => sa.cmp(sb).then_with(|| a.compare(b)),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Append the tagged encoding of this value.
    pub fn encode_tagged(&self, out: &mut Vec<u8>) {
        if self.is_null() {
            out.push(0);
            return;
        }
        let payload = self.payload();
        put_uvarint(out, payload.len() as u64 + 1);
        out.extend_from_slice(&payload);
    }

    /// Untagged payload bytes; used as a total-order tiebreaker.
    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_payload(&mut out);
        out
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => {}
            Value::Bool(b) => out.push(*b as u8),
            Value::Int(v) | Value::Time(v) | Value::Duration(v) => put_varint(out, *v),
            Value::Uint(v) | Value::Enum(v) => put_uvarint(out, *v),
            Value::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::String(s) => out.extend_from_slice(s.as_bytes()),
            Value::Bytes(b) => out.extend_from_slice(b),
            Value::Ip(IpAddr::V4(ip)) => out.extend_from_slice(&ip.octets()),
            Value::Ip(IpAddr::V6(ip)) => out.extend_from_slice(&ip.octets()),
            Value::Record(vals) | Value::Array(vals) | Value::Set(vals) => {
                for v in vals {
                    v.encode_tagged(out);
                }
            }
            Value::Map(entries) => {
                for (k, v) in entries {
                    k.encode_tagged(out);
                    v.encode_tagged(out);
                }
            }
            Value::Union(selector, inner) => {
                put_uvarint(out, *selector as u64);
                inner.encode_tagged(out);
            }
        }
    }

    /// Decode a payload of type `ty`.
    pub fn decode(ty: &Type, payload: &[u8]) -> ZarResult<Value> {
        let mut buf = payload;
        let value = match ty {
            Type::Null => Value::Null,
            Type::Bool => match buf {
                [b] => {
                    buf = &[];
                    Value::Bool(*b != 0)
                }
                _ => return Err(bad_len("bool", payload.len())),
            },
            Type::Int32 | Type::Int64 => Value::Int(varint(&mut buf)?),
            Type::Time => Value::Time(varint(&mut buf)?),
            Type::Duration => Value::Duration(varint(&mut buf)?),
            Type::Uint64 => Value::Uint(uvarint(&mut buf)?),
            Type::Enum(symbols) => {
                let idx = uvarint(&mut buf)?;
                if idx as usize >= symbols.len() {
                    return Err(ZarError::Corrupt(format!("enum index {} out of range", idx)));
                }
                Value::Enum(idx)
            }
            Type::Float64 => {
                let bytes: [u8; 8] = buf
                    .try_into()
                    .map_err(|_| bad_len("float64", payload.len()))?;
                buf = &[];
                Value::Float(f64::from_le_bytes(bytes))
            }
            Type::String => {
                let s = std::str::from_utf8(buf)
                    .map_err(|e| ZarError::Corrupt(format!("invalid utf-8 string: {}", e)))?;
                buf = &[];
                Value::String(s.to_string())
            }
            Type::Bytes => {
                let b = buf.to_vec();
                buf = &[];
                Value::Bytes(b)
            }
            Type::Ip => {
                let ip = match buf.len() {
                    4 => {
                        let octets: [u8; 4] = buf.try_into().map_err(|_| bad_len("ip", 4))?;
                        IpAddr::V4(Ipv4Addr::from(octets))
                    }
                    16 => {
                        let octets: [u8; 16] = buf.try_into().map_err(|_| bad_len("ip", 16))?;
                        IpAddr::V6(Ipv6Addr::from(octets))
                    }
                    n => return Err(bad_len("ip", n)),
                };
                buf = &[];
                Value::Ip(ip)
            }
            Type::Record(cols) => {
                let mut vals = Vec::with_capacity(cols.len());
                for col in cols.iter() {
                    vals.push(next_value(&mut buf, &col.ty)?);
                }
                Value::Record(vals)
            }
            Type::Array(inner) | Type::Set(inner) => {
                let mut vals = Vec::new();
                while !buf.is_empty() {
                    vals.push(next_value(&mut buf, inner)?);
                }
                if matches!(ty, Type::Set(_)) {
                    Value::Set(vals)
                } else {
                    Value::Array(vals)
                }
            }
            Type::Map(kv) => {
                let mut entries = Vec::new();
                while !buf.is_empty() {
                    let k = next_value(&mut buf, &kv.0)?;
                    let v = next_value(&mut buf, &kv.1)?;
                    entries.push((k, v));
                }
                Value::Map(entries)
            }
            Type::Union(types) => {
                let selector = uvarint(&mut buf)? as usize;
                let inner_ty = types.get(selector).ok_or_else(|| {
                    ZarError::Corrupt(format!("union selector {} out of range", selector))
                })?;
                Value::Union(selector, Box::new(next_value(&mut buf, inner_ty)?))
            }
            Type::Alias(alias) => return Value::decode(&alias.ty, payload),
        };
        if !buf.is_empty() {
            return Err(ZarError::Corrupt(format!(
                "{} trailing bytes after {} value",
                buf.len(),
                ty
            )));
        }
        Ok(value)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<Ts> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<i64> {
        match self {
            Value::Duration(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            Value::Ip(ip) => Some(*ip),
            _ => None,
        }
    }
}

fn compare_seq(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = x.compare(y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn bad_len(what: &str, len: usize) -> ZarError {
    ZarError::Corrupt(format!("bad {} payload length {}", what, len))
}

/// Decode the next tagged value of type `ty` from `buf`.
pub(crate) fn next_value(buf: &mut &[u8], ty: &Type) -> ZarResult<Value> {
    let tag = uvarint(buf)?;
    if tag == 0 {
        return Ok(Value::Null);
    }
    let len = (tag - 1) as usize;
    if len > buf.len() {
        return Err(ZarError::Corrupt(format!(
            "value length {} exceeds remaining {} bytes",
            len,
            buf.len()
        )));
    }
    let (payload, rest) = buf.split_at(len);
    *buf = rest;
    Value::decode(ty, payload)
}

/// A value rendered with its type, for text output.
pub struct Typed<'a>(pub &'a Type, pub &'a Value);

impl std::fmt::Display for Typed<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Typed(ty, val) = *self;
        match (ty.underlying(), val) {
            (_, Value::Null) => write!(f, "null"),
            (Type::Record(cols), Value::Record(vals)) => {
                write!(f, "{{")?;
                for (i, (col, v)) in cols.iter().zip(vals.iter()).enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", col.name, Typed(&col.ty, v))?;
                }
                write!(f, "}}")
            }
            (Type::Array(inner), Value::Array(vals)) => {
                write!(f, "[")?;
                write_list(f, inner, vals)?;
                write!(f, "]")
            }
            (Type::Set(inner), Value::Set(vals)) => {
                write!(f, "|[")?;
                write_list(f, inner, vals)?;
                write!(f, "]|")
            }
            (Type::Map(kv), Value::Map(entries)) => {
                write!(f, "|{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", Typed(&kv.0, k), Typed(&kv.1, v))?;
                }
                write!(f, "}}|")
            }
            (Type::Union(types), Value::Union(sel, inner)) => match types.get(*sel) {
                Some(inner_ty) => write!(f, "{}", Typed(inner_ty, inner)),
                None => write!(f, "{}", inner),
            },
            (Type::Enum(symbols), Value::Enum(idx)) => match symbols.get(*idx as usize) {
                Some(sym) => write!(f, "{}", sym),
                None => write!(f, "{}", idx),
            },
            _ => write!(f, "{}", val),
        }
    }
}

fn write_list(f: &mut std::fmt::Formatter<'_>, ty: &Type, vals: &[Value]) -> std::fmt::Result {
    for (i, v) in vals.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, "{}", Typed(ty, v))?;
    }
    Ok(())
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::Uint(v) | Value::Enum(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:?}", v),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => {
                write!(f, "0x")?;
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Value::Time(t) => write!(f, "{}", format_ts(*t)),
            Value::Duration(d) => write!(f, "{}ns", d),
            Value::Ip(ip) => write!(f, "{}", ip),
            Value::Record(vals) | Value::Array(vals) | Value::Set(vals) => {
                write!(f, "[")?;
                for (i, v) in vals.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "|{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", k, v)?;
                }
                write!(f, "}}|")
            }
            Value::Union(_, inner) => write!(f, "{}", inner),
        }
    }
}
