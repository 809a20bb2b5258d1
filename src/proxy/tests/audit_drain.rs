//! End-to-end drain-on-shutdown coverage for the audit writer: records
//! submitted before the stop signal must all land in the log file in
//! submission order, whether the writer stops via cancellation or via
//! every handle being dropped.

use std::time::Duration;

use proxy::audit::{AuditLogWriter, AuditLogWriterConfig, AuditRecord, AuditWriterError};

fn decode_all(bytes: &[u8]) -> Vec<AuditRecord> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut decoder, &mut out).unwrap();
    assert!(out.starts_with(proxy::audit::VERSION_HEADER));
    let mut cursor = std::io::Cursor::new(&out[proxy::audit::VERSION_HEADER.len()..]);
    let mut records = Vec::new();
    while let Some(record) = AuditRecord::decode_from(&mut cursor).unwrap() {
        records.push(record);
    }
    records
}

#[tokio::test]
async fn drains_one_hundred_records_on_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir
        .path()
        .join("cancel.log.gz")
        .to_str()
        .unwrap()
        .to_string();
    let cancel = tokio_util::sync::CancellationToken::new();
    let (handle, join) = AuditLogWriter::spawn(
        AuditLogWriterConfig {
            file_path_template: template.clone(),
            rotate_time: Duration::from_secs(3600),
            queue_capacity: 256,
        },
        cancel.clone(),
    )
    .unwrap();

    for i in 0..100u32 {
        let mut record = handle.get_record().await;
        record.connection_id = i;
        record.user = format!("user{i}");
        record.state = "connect".to_string();
        handle.submit(record, &cancel).await.unwrap();
    }

    cancel.cancel();
    let result = join.await.unwrap();
    assert!(matches!(result, Err(AuditWriterError::Cancelled)));

    let bytes = std::fs::read(&template).unwrap();
    let records = decode_all(&bytes);
    assert_eq!(records.len(), 100);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.connection_id, i as u32);
        assert_eq!(record.user, format!("user{i}"));
    }
}

#[tokio::test]
async fn drains_one_hundred_records_on_handle_drop() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir
        .path()
        .join("drop.log.gz")
        .to_str()
        .unwrap()
        .to_string();
    let cancel = tokio_util::sync::CancellationToken::new();
    let (handle, join) = AuditLogWriter::spawn(
        AuditLogWriterConfig {
            file_path_template: template.clone(),
            rotate_time: Duration::from_secs(3600),
            queue_capacity: 256,
        },
        cancel.clone(),
    )
    .unwrap();

    for i in 0..100u32 {
        let mut record = handle.get_record().await;
        record.connection_id = i;
        record.user = format!("user{i}");
        record.state = "connect".to_string();
        handle.submit(record, &cancel).await.unwrap();
    }

    drop(handle);
    let result = join.await.unwrap();
    assert!(matches!(result, Err(AuditWriterError::Closed)));

    let bytes = std::fs::read(&template).unwrap();
    let records = decode_all(&bytes);
    assert_eq!(records.len(), 100);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.connection_id, i as u32);
        assert_eq!(record.user, format!("user{i}"));
    }
}
