//! Types and the type context
//!
//! Types are structural: two types built from the same parts compare equal.
//! The `TypeContext` interns them so that equal types share one allocation
//! and hands out stable per-context ids. Primitive ids are fixed; compound
//! types are numbered from `FIRST_COMPOUND_ID` in the order they are first
//! seen.

use crate::error::{ZarError, ZarResult};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

pub const ID_NULL: u32 = 0;
pub const ID_BOOL: u32 = 1;
pub const ID_INT32: u32 = 2;
pub const ID_INT64: u32 = 3;
pub const ID_UINT64: u32 = 4;
pub const ID_FLOAT64: u32 = 5;
pub const ID_STRING: u32 = 6;
pub const ID_BYTES: u32 = 7;
pub const ID_TIME: u32 = 8;
pub const ID_DURATION: u32 = 9;
pub const ID_IP: u32 = 10;

/// First id handed out to a compound type
pub const FIRST_COMPOUND_ID: u32 = 23;

/// A record column
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Column {
    pub name: String,
    pub ty: Type,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// A named type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AliasType {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Null,
    Bool,
    Int32,
    Int64,
    Uint64,
    Float64,
    String,
    Bytes,
    Time,
    Duration,
    Ip,
    Record(Arc<[Column]>),
    Array(Arc<Type>),
    Set(Arc<Type>),
    Map(Arc<(Type, Type)>),
    Union(Arc<[Type]>),
    Alias(Arc<AliasType>),
    Enum(Arc<[String]>),
}

impl Type {
    /// Fixed id of a primitive type.
    pub fn primitive_id(&self) -> Option<u32> {
        let id = match self {
            Type::Null => ID_NULL,
            Type::Bool => ID_BOOL,
            Type::Int32 => ID_INT32,
            Type::Int64 => ID_INT64,
            Type::Uint64 => ID_UINT64,
            Type::Float64 => ID_FLOAT64,
            Type::String => ID_STRING,
            Type::Bytes => ID_BYTES,
            Type::Time => ID_TIME,
            Type::Duration => ID_DURATION,
            Type::Ip => ID_IP,
            _ => return None,
        };
        Some(id)
    }

    pub fn from_primitive_id(id: u32) -> Option<Type> {
        let ty = match id {
            ID_NULL => Type::Null,
            ID_BOOL => Type::Bool,
            ID_INT32 => Type::Int32,
            ID_INT64 => Type::Int64,
            ID_UINT64 => Type::Uint64,
            ID_FLOAT64 => Type::Float64,
            ID_STRING => Type::String,
            ID_BYTES => Type::Bytes,
            ID_TIME => Type::Time,
            ID_DURATION => Type::Duration,
            ID_IP => Type::Ip,
            _ => return None,
        };
        Some(ty)
    }

    pub fn from_primitive_name(name: &str) -> Option<Type> {
        let ty = match name {
            "null" => Type::Null,
            "bool" => Type::Bool,
            "int32" => Type::Int32,
            "int64" => Type::Int64,
            "uint64" => Type::Uint64,
            "float64" => Type::Float64,
            "string" => Type::String,
            "bytes" => Type::Bytes,
            "time" => Type::Time,
            "duration" => Type::Duration,
            "ip" => Type::Ip,
            _ => return None,
        };
        Some(ty)
    }

    pub fn is_primitive(&self) -> bool {
        self.primitive_id().is_some()
    }

    /// Strip aliases down to the underlying type.
    pub fn underlying(&self) -> &Type {
        let mut ty = self;
        while let Type::Alias(alias) = ty {
            ty = &alias.ty;
        }
        ty
    }

    pub fn columns(&self) -> Option<&[Column]> {
        match self.underlying() {
            Type::Record(cols) => Some(cols),
            _ => None,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns()?.iter().position(|c| c.name == name)
    }

    /// True for records, arrays, sets, maps and unions.
    pub fn is_container(&self) -> bool {
        matches!(
            self.underlying(),
            Type::Record(_) | Type::Array(_) | Type::Set(_) | Type::Map(_) | Type::Union(_)
        )
    }

    /// Types referenced directly by this one.
    pub fn children(&self) -> Vec<&Type> {
        match self {
            Type::Record(cols) => cols.iter().map(|c| &c.ty).collect(),
            Type::Array(inner) | Type::Set(inner) => vec![inner.as_ref()],
            Type::Map(kv) => vec![&kv.0, &kv.1],
            Type::Union(types) => types.iter().collect(),
            Type::Alias(alias) => vec![&alias.ty],
            _ => Vec::new(),
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Null => write!(f, "null"),
            Type::Bool => write!(f, "bool"),
            Type::Int32 => write!(f, "int32"),
            Type::Int64 => write!(f, "int64"),
            Type::Uint64 => write!(f, "uint64"),
            Type::Float64 => write!(f, "float64"),
            Type::String => write!(f, "string"),
            Type::Bytes => write!(f, "bytes"),
            Type::Time => write!(f, "time"),
            Type::Duration => write!(f, "duration"),
            Type::Ip => write!(f, "ip"),
            Type::Record(cols) => {
                write!(f, "record[")?;
                for (i, col) in cols.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", col.name, col.ty)?;
                }
                write!(f, "]")
            }
            Type::Array(inner) => write!(f, "array[{}]", inner),
            Type::Set(inner) => write!(f, "set[{}]", inner),
            Type::Map(kv) => write!(f, "map[{},{}]", kv.0, kv.1),
            Type::Union(types) => {
                write!(f, "union[")?;
                for (i, ty) in types.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", ty)?;
                }
                write!(f, "]")
            }
            Type::Alias(alias) => write!(f, "{}", alias.name),
            Type::Enum(symbols) => write!(f, "enum[{}]", symbols.join(",")),
        }
    }
}

#[derive(Default)]
struct ContextInner {
    ids: HashMap<Type, u32>,
    types: Vec<Type>,
}

/// Interning table for types.
///
/// Shared by the readers and writers of one pipeline; it only ever grows.
#[derive(Default)]
pub struct TypeContext {
    inner: RwLock<ContextInner>,
}

impl TypeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a type (and everything it references), returning its id.
    pub fn lookup(&self, ty: &Type) -> u32 {
        self.intern(ty).1
    }

    /// Canonical shared instance of `ty`.
    pub fn canonical(&self, ty: &Type) -> Type {
        self.intern(ty).0
    }

    fn intern(&self, ty: &Type) -> (Type, u32) {
        if let Some(id) = ty.primitive_id() {
            return (ty.clone(), id);
        }
        {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            if let Some(&id) = inner.ids.get(ty) {
                let idx = (id - FIRST_COMPOUND_ID) as usize;
                return (inner.types[idx].clone(), id);
            }
        }
        for child in ty.children() {
            self.intern(child);
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(&id) = inner.ids.get(ty) {
            let idx = (id - FIRST_COMPOUND_ID) as usize;
            return (inner.types[idx].clone(), id);
        }
        let id = FIRST_COMPOUND_ID + inner.types.len() as u32;
        inner.types.push(ty.clone());
        inner.ids.insert(ty.clone(), id);
        (ty.clone(), id)
    }

    pub fn lookup_by_id(&self, id: u32) -> Option<Type> {
        if let Some(ty) = Type::from_primitive_id(id) {
            return Some(ty);
        }
        let idx = id.checked_sub(FIRST_COMPOUND_ID)? as usize;
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.types.get(idx).cloned()
    }

    /// Record type with the given columns. Column names must be unique.
    pub fn lookup_record(&self, columns: Vec<Column>) -> ZarResult<Type> {
        let mut seen = HashSet::new();
        for col in &columns {
            if col.name.is_empty() {
                return Err(ZarError::Validation("empty column name".to_string()));
            }
            if !seen.insert(col.name.as_str()) {
                return Err(ZarError::Validation(format!(
                    "duplicate column name \"{}\"",
                    col.name
                )));
            }
        }
        Ok(self.canonical(&Type::Record(columns.into())))
    }

    pub fn lookup_array(&self, inner: Type) -> Type {
        self.canonical(&Type::Array(Arc::new(inner)))
    }

    pub fn lookup_set(&self, inner: Type) -> Type {
        self.canonical(&Type::Set(Arc::new(inner)))
    }

    pub fn lookup_map(&self, key: Type, value: Type) -> Type {
        self.canonical(&Type::Map(Arc::new((key, value))))
    }

    pub fn lookup_union(&self, types: Vec<Type>) -> ZarResult<Type> {
        if types.is_empty() {
            return Err(ZarError::Validation("union with no types".to_string()));
        }
        Ok(self.canonical(&Type::Union(types.into())))
    }

    pub fn lookup_alias(&self, name: impl Into<String>, ty: Type) -> Type {
        self.canonical(&Type::Alias(Arc::new(AliasType {
            name: name.into(),
            ty,
        })))
    }

    pub fn lookup_enum(&self, symbols: Vec<String>) -> Type {
        self.canonical(&Type::Enum(symbols.into()))
    }

    /// Number of compound types interned so far.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .types
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_structural() {
        let zctx = TypeContext::new();
        let a = zctx
            .lookup_record(vec![Column::new("ts", Type::Time), Column::new("v", Type::Int64)])
            .unwrap();
        let b = zctx
            .lookup_record(vec![Column::new("ts", Type::Time), Column::new("v", Type::Int64)])
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(zctx.lookup(&a), zctx.lookup(&b));
        assert_eq!(zctx.lookup(&Type::Int64), ID_INT64);
        assert_eq!(zctx.lookup_by_id(zctx.lookup(&a)), Some(a));
    }

    #[test]
    fn test_children_interned_first() {
        let zctx = TypeContext::new();
        let arr = zctx.lookup_array(Type::String);
        let rec = zctx
            .lookup_record(vec![Column::new("tags", arr.clone())])
            .unwrap();
        assert!(zctx.lookup(&arr) < zctx.lookup(&rec));
        assert_eq!(zctx.len(), 2);
    }

    #[test]
    fn test_duplicate_columns_rejected() {
        let zctx = TypeContext::new();
        let err = zctx
            .lookup_record(vec![Column::new("a", Type::Int64), Column::new("a", Type::String)])
            .unwrap_err();
        assert!(matches!(err, ZarError::Validation(_)));
    }

    #[test]
    fn test_display() {
        let zctx = TypeContext::new();
        let rec = zctx
            .lookup_record(vec![
                Column::new("a", zctx.lookup_array(Type::Int64)),
                Column::new("b", zctx.lookup_alias("port", Type::Uint64)),
            ])
            .unwrap();
        assert_eq!(rec.to_string(), "record[a:array[int64],b:port]");
        assert_eq!(rec.column_index("b"), Some(1));
    }
}
