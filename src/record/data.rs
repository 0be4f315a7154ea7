//! Typed records

use crate::error::{ZarError, ZarResult};
use crate::record::types::{Column, Type};
use crate::record::value::{Typed, Value};
use crate::span::Ts;
use std::net::IpAddr;

/// Name of the timestamp field every archived record carries
pub const TS_FIELD: &str = "ts";

/// Result of a walk visitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// Descend into this value's children
    Continue,
    /// Do not descend into this value
    SkipChildren,
}

/// A record value together with its record type
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    ty: Type,
    values: Vec<Value>,
}

impl Record {
    /// Build a record; `ty` must be a record type with one column per value.
    pub fn new(ty: Type, values: Vec<Value>) -> ZarResult<Self> {
        let cols = ty
            .columns()
            .ok_or_else(|| ZarError::Validation(format!("{} is not a record type", ty)))?;
        if cols.len() != values.len() {
            return Err(ZarError::Validation(format!(
                "record type has {} columns but {} values were given",
                cols.len(),
                values.len()
            )));
        }
        Ok(Self { ty, values })
    }

    /// Decode a record body.
    pub fn decode(ty: Type, body: &[u8]) -> ZarResult<Self> {
        if ty.columns().is_none() {
            return Err(ZarError::Corrupt(format!("{} is not a record type", ty)));
        }
        match Value::decode(&ty, body)? {
            Value::Record(values) => Ok(Self { ty, values }),
            _ => Err(ZarError::Corrupt("record body did not decode to a record".into())),
        }
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn columns(&self) -> &[Column] {
        self.ty.columns().unwrap_or(&[])
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Encoded body bytes.
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for v in &self.values {
            v.encode_tagged(&mut out);
        }
        out
    }

    /// Look up a field by dotted path, e.g. `id.orig_h`.
    pub fn field(&self, path: &str) -> Option<(&Type, &Value)> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let idx = self.ty.column_index(first)?;
        let mut ty = &self.columns()[idx].ty;
        let mut val = &self.values[idx];
        for part in parts {
            let idx = ty.column_index(part)?;
            let cols = ty.columns()?;
            match val {
                Value::Record(vals) => {
                    ty = &cols[idx].ty;
                    val = &vals[idx];
                }
                _ => return None,
            }
        }
        Some((ty, val))
    }

    pub fn has_field(&self, path: &str) -> bool {
        self.field(path).is_some()
    }

    pub fn int(&self, path: &str) -> Option<i64> {
        self.field(path)?.1.as_int()
    }

    pub fn uint(&self, path: &str) -> Option<u64> {
        self.field(path)?.1.as_uint()
    }

    pub fn float(&self, path: &str) -> Option<f64> {
        self.field(path)?.1.as_float()
    }

    pub fn string(&self, path: &str) -> Option<&str> {
        self.field(path)?.1.as_str()
    }

    pub fn bool(&self, path: &str) -> Option<bool> {
        self.field(path)?.1.as_bool()
    }

    pub fn time(&self, path: &str) -> Option<Ts> {
        self.field(path)?.1.as_time()
    }

    pub fn duration(&self, path: &str) -> Option<i64> {
        self.field(path)?.1.as_duration()
    }

    pub fn ip(&self, path: &str) -> Option<IpAddr> {
        self.field(path)?.1.as_ip()
    }

    /// The record's timestamp, if it has a `ts` field of type time.
    pub fn ts(&self) -> Option<Ts> {
        self.time(TS_FIELD)
    }

    /// Visit every value in the record tree, depth first. Column values are
    /// visited before their children; a visitor returning `SkipChildren`
    /// prunes the descent.
    pub fn walk<F>(&self, visit: &mut F) -> ZarResult<()>
    where
        F: FnMut(&Type, &Value) -> ZarResult<Walk>,
    {
        for (col, val) in self.columns().iter().zip(self.values.iter()) {
            walk_value(&col.ty, val, visit)?;
        }
        Ok(())
    }
}

fn walk_value<F>(ty: &Type, val: &Value, visit: &mut F) -> ZarResult<()>
where
    F: FnMut(&Type, &Value) -> ZarResult<Walk>,
{
    if visit(ty, val)? == Walk::SkipChildren {
        return Ok(());
    }
    match (ty.underlying(), val) {
        (Type::Record(cols), Value::Record(vals)) => {
            for (col, v) in cols.iter().zip(vals.iter()) {
                walk_value(&col.ty, v, visit)?;
            }
        }
        (Type::Array(inner), Value::Array(vals)) | (Type::Set(inner), Value::Set(vals)) => {
            for v in vals {
                walk_value(inner, v, visit)?;
            }
        }
        (Type::Map(kv), Value::Map(entries)) => {
            for (k, v) in entries {
                walk_value(&kv.0, k, visit)?;
                walk_value(&kv.1, v, visit)?;
            }
        }
        (Type::Union(types), Value::Union(sel, inner)) => {
            if let Some(inner_ty) = types.get(*sel) {
                walk_value(inner_ty, inner, visit)?;
            }
        }
        _ => {}
    }
    Ok(())
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Typed(&self.ty, &Value::Record(self.values.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::types::TypeContext;

    fn conn(zctx: &TypeContext) -> Record {
        let id = zctx
            .lookup_record(vec![Column::new("orig_h", Type::Ip), Column::new("resp_p", Type::Uint64)])
            .unwrap();
        let ty = zctx
            .lookup_record(vec![
                Column::new("ts", Type::Time),
                Column::new("id", id),
                Column::new("counts", zctx.lookup_array(Type::Int64)),
            ])
            .unwrap();
        Record::new(
            ty,
            vec![
                Value::Time(1_587_508_830_068_523_240),
                Value::Record(vec![Value::Ip("10.1.2.3".parse().unwrap()), Value::Uint(53)]),
                Value::Array(vec![Value::Int(336), Value::Int(7)]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_field_paths() {
        let zctx = TypeContext::new();
        let rec = conn(&zctx);
        assert_eq!(rec.ts(), Some(1_587_508_830_068_523_240));
        assert_eq!(rec.uint("id.resp_p"), Some(53));
        assert_eq!(rec.ip("id.orig_h"), Some("10.1.2.3".parse().unwrap()));
        assert!(rec.field("id.missing").is_none());
        assert!(rec.field("counts.x").is_none());
    }

    #[test]
    fn test_body_round_trip() {
        let zctx = TypeContext::new();
        let rec = conn(&zctx);
        let decoded = Record::decode(rec.ty().clone(), &rec.bytes()).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_walk_visits_leaves() {
        let zctx = TypeContext::new();
        let rec = conn(&zctx);
        let mut ints = Vec::new();
        rec.walk(&mut |ty, v| {
            if *ty == Type::Int64 {
                ints.push(v.clone());
            }
            Ok(Walk::Continue)
        })
        .unwrap();
        assert_eq!(ints, vec![Value::Int(336), Value::Int(7)]);
    }

    #[test]
    fn test_arity_checked() {
        let zctx = TypeContext::new();
        let ty = zctx
            .lookup_record(vec![Column::new("ts", Type::Time)])
            .unwrap();
        assert!(Record::new(ty, vec![]).is_err());
    }
}
