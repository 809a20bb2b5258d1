pub mod record;
pub mod writer;

pub use record::{AuditRecord, MAX_RECORD_PACKET_LEN};
pub use writer::{AuditLogWriter, AuditLogWriterConfig, AuditWriterError, AuditWriterHandle, VERSION_HEADER};
