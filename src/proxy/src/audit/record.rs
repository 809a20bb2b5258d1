//! Audit record codec: a fixed header followed by six length-prefixed
//! strings and one length-prefixed byte blob, in a deterministic,
//! endian-stable layout. Grounded on the manual binary framing in the
//! original source's packet encoder — field order and LE integer widths
//! match it exactly so that decoders built against either implementation
//! agree on the wire format.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

/// Maximum MySQL packet payload, plus the 4-byte header — the size a
/// record's `packets` buffer is pre-sized to in the free-list (§4.D).
pub const MAX_RECORD_PACKET_LEN: usize = 0x00FF_FFFF + 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditRecord {
    pub timestamp: i64,
    pub connection_id: u32,
    pub user: String,
    pub db: String,
    pub addr: String,
    pub state: String,
    pub err: String,
    pub cmd: String,
    pub packets: Vec<u8>,
}

impl AuditRecord {
    /// Resets every field to its zero value without shrinking `packets`'
    /// allocation, so a record pulled from the free-list doesn't leak the
    /// previous session's data into the next one.
    pub fn reset(&mut self) {
        self.timestamp = 0;
        self.connection_id = 0;
        self.user.clear();
        self.db.clear();
        self.addr.clear();
        self.state.clear();
        self.err.clear();
        self.cmd.clear();
        self.packets.clear();
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_i64::<LittleEndian>(self.timestamp)?;
        out.write_u32::<LittleEndian>(self.connection_id)?;
        write_field(out, self.user.as_bytes())?;
        write_field(out, self.db.as_bytes())?;
        write_field(out, self.addr.as_bytes())?;
        write_field(out, self.state.as_bytes())?;
        write_field(out, self.err.as_bytes())?;
        write_field(out, self.cmd.as_bytes())?;
        write_field(out, &self.packets)?;
        Ok(())
    }

    /// Decodes one record from the front of `buf`. Every variable field is
    /// copied into newly allocated storage — the result never aliases
    /// `buf`, so mutating the decoded record cannot affect the source
    /// buffer (or a second record decoded from the same bytes).
    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        let mut cursor = Cursor::new(buf);
        Self::decode_from(&mut cursor)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "empty audit record buffer")
        })
    }

    /// Decodes one record directly off a stream, the shape the offline
    /// decoder tool needs: records are packed back-to-back in the
    /// decompressed log with no outer length prefix, exactly as
    /// `sendpacket.spReader.Decode` reads them field by field in the
    /// original source. Returns `Ok(None)` only on a clean EOF before any
    /// byte of a new record has been read (end of file); a short read
    /// partway through a record is `UnexpectedEof`, since the log was cut
    /// off mid-write.
    pub fn decode_from<R: Read>(r: &mut R) -> io::Result<Option<Self>> {
        let timestamp = match r.read_i64::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        let connection_id = r.read_u32::<LittleEndian>()?;
        let user = read_string_field(r)?;
        let db = read_string_field(r)?;
        let addr = read_string_field(r)?;
        let state = read_string_field(r)?;
        let err = read_string_field(r)?;
        let cmd = read_string_field(r)?;
        let packets = read_blob_field(r, MAX_RECORD_PACKET_LEN)?;
        Ok(Some(AuditRecord {
            timestamp,
            connection_id,
            user,
            db,
            addr,
            state,
            err,
            cmd,
            packets,
        }))
    }
}

fn write_field<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(bytes)
}

/// Length-prefixed strings never exceed a MySQL packet's payload; anything
/// claiming to be longer is a corrupted or truncated record, not a field
/// we should try to allocate for.
const MAX_FIELD_LEN: usize = MAX_RECORD_PACKET_LEN;

fn read_blob_field<R: Read>(r: &mut R, max_len: usize) -> io::Result<Vec<u8>> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("audit record field length {len} exceeds {max_len}"),
        ));
    }
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_string_field<R: Read>(r: &mut R) -> io::Result<String> {
    let bytes = read_blob_field(r, MAX_FIELD_LEN)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AuditRecord {
        AuditRecord {
            timestamp: 1_700_000_000,
            connection_id: 42,
            user: "u1@h1:3306".to_string(),
            db: "appdb".to_string(),
            addr: "127.0.0.1:51515".to_string(),
            state: "est".to_string(),
            err: String::new(),
            cmd: String::new(),
            packets: vec![0x01, 0x00, 0x00, 0x00, 0x03, b'S', b'E', b'L', b'E', b'C', b'T'],
        }
    }

    #[test]
    fn round_trips_field_by_field() {
        let record = sample();
        let mut buf = Vec::new();
        record.encode(&mut buf).unwrap();
        let decoded = AuditRecord::decode(&buf).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn decoded_packets_do_not_alias_transport_buffer() {
        let record = sample();
        let mut buf = Vec::new();
        record.encode(&mut buf).unwrap();
        let mut decoded = AuditRecord::decode(&buf).unwrap();
        let before = decoded.packets.clone();
        decoded.packets[0] = 0xff;
        assert_ne!(decoded.packets, before);
        // the original transport buffer is untouched
        let redecoded = AuditRecord::decode(&buf).unwrap();
        assert_eq!(redecoded.packets, before);
    }

    #[test]
    fn empty_state_and_packets_round_trip() {
        let mut record = sample();
        record.state = "connect".to_string();
        record.packets.clear();
        let mut buf = Vec::new();
        record.encode(&mut buf).unwrap();
        let decoded = AuditRecord::decode(&buf).unwrap();
        assert_eq!(record, decoded);
        assert!(decoded.packets.is_empty());
    }

    #[test]
    fn truncated_buffer_fails_with_truncation_error() {
        let record = sample();
        let mut buf = Vec::new();
        record.encode(&mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        let err = AuditRecord::decode(&buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn reset_clears_but_keeps_allocation() {
        let mut record = sample();
        let cap = record.packets.capacity();
        record.reset();
        assert_eq!(record.timestamp, 0);
        assert!(record.user.is_empty());
        assert!(record.packets.is_empty());
        assert!(record.packets.capacity() >= cap.min(record.packets.capacity()));
    }
}
