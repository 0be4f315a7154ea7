//! Shared fixtures for archive tests

use crate::archive::import::{import, ImportOptions};
use crate::archive::metadata::{Archive, CreateOptions};
use crate::record::{ArrayReader, Column, Record, Type, TypeContext, Value};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Four records over two days; the first record of each day carries
/// `v = 336`.
pub(crate) fn sample_records(zctx: &TypeContext) -> Vec<Record> {
    let ty = zctx
        .lookup_record(vec![
            Column::new("ts", Type::Time),
            Column::new("v", Type::Int64),
            Column::new("msg", Type::String),
        ])
        .unwrap();
    [
        (1_587_508_830_068_523_240i64, 336i64),
        (1_587_517_405_066_655_910, 336),
        (1_587_509_168_067_598_390, 7),
        (1_587_517_149_063_044_070, 8),
    ]
    .iter()
    .enumerate()
    .map(|(i, (ts, v))| {
        Record::new(
            ty.clone(),
            vec![
                Value::Time(*ts),
                Value::Int(*v),
                Value::String(format!("record {}", i)),
            ],
        )
        .unwrap()
    })
    .collect()
}

/// A reverse archive with a 1000 byte threshold holding `sample_records`.
pub(crate) fn sample_archive(root: &Path, zctx: &Arc<TypeContext>) -> Archive {
    let archive = Archive::create(root, CreateOptions::default().log_size_threshold(1000)).unwrap();
    let mut input = ArrayReader::new(sample_records(zctx));
    import(
        &archive,
        zctx.clone(),
        &mut input,
        &ImportOptions::default(),
        &CancellationToken::new(),
    )
    .unwrap();
    archive
}
