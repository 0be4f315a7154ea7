//! Record comparators

use crate::record::{Record, Value};
use crate::span::Direction;
use std::cmp::Ordering;
use std::sync::Arc;

/// Shared record ordering
pub type RecordCompare = Arc<dyn Fn(&Record, &Record) -> Ordering + Send + Sync>;

/// Order records by the value of `field` under `direction`. Records missing
/// the field sort as null.
pub fn by_field(field: impl Into<String>, direction: Direction) -> RecordCompare {
    let field = field.into();
    Arc::new(move |a: &Record, b: &Record| {
        let va = a.field(&field).map(|(_, v)| v).unwrap_or(&Value::Null);
        let vb = b.field(&field).map(|(_, v)| v).unwrap_or(&Value::Null);
        direction.apply(va.compare(vb))
    })
}

/// Order records by timestamp under `direction`.
pub fn by_ts(direction: Direction) -> RecordCompare {
    by_field(crate::record::TS_FIELD, direction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Column, Type, TypeContext};

    #[test]
    fn test_by_ts_reverse() {
        let zctx = TypeContext::new();
        let ty = zctx
            .lookup_record(vec![Column::new("ts", Type::Time)])
            .unwrap();
        let a = Record::new(ty.clone(), vec![Value::Time(1)]).unwrap();
        let b = Record::new(ty, vec![Value::Time(2)]).unwrap();
        let cmp = by_ts(Direction::Reverse);
        assert_eq!(cmp(&a, &b), Ordering::Greater);
        assert_eq!(by_ts(Direction::Forward)(&a, &b), Ordering::Less);
    }
}
