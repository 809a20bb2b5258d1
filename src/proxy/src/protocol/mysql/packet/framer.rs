//! A deliberately simple single-packet reader/writer for the steady-state
//! relay loop, distinct from [`super::packet_reader::PacketReader`]'s
//! `nom`-based, 16MB-split-aware reassembly used during the handshake.
//! Audited traffic is forwarded packet-by-packet without reassembling
//! multi-packet payloads — the proxy never interprets the payload beyond
//! its length, so there is nothing to reassemble for.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::io::TimeoutIo;
use crate::protocol::mysql::constants::PACKET_HEADER_LEN;

/// Reads one complete MySQL packet (header + payload) into `buf`, growing
/// it as needed, and returns the total frame length on success or `None`
/// on a clean end-of-stream. The sequence byte (`buf[3]`) is left in
/// place but otherwise ignored, per the protocol's own acknowledgment
/// that the proxy verifies nothing about it.
pub async fn read_packet<S: AsyncRead + Unpin>(
    io: &mut TimeoutIo<S>,
    buf: &mut Vec<u8>,
) -> io::Result<Option<usize>> {
    if buf.len() < PACKET_HEADER_LEN {
        buf.resize(PACKET_HEADER_LEN, 0);
    }
    let n = io.read_exact(&mut buf[0..PACKET_HEADER_LEN]).await?;
    if n == 0 {
        return Ok(None);
    }

    let payload_len =
        (buf[0] as usize) | ((buf[1] as usize) << 8) | ((buf[2] as usize) << 16);
    let total_len = PACKET_HEADER_LEN + payload_len;
    if buf.len() < total_len {
        buf.resize(total_len, 0);
    }
    if payload_len > 0 {
        io.read_exact(&mut buf[PACKET_HEADER_LEN..total_len]).await?;
    }
    Ok(Some(total_len))
}

/// Writes the full `4 + N` byte frame atomically to the paired stream.
pub async fn write_packet<S: AsyncWrite + Unpin>(
    io: &mut TimeoutIo<S>,
    frame: &[u8],
) -> io::Result<()> {
    io.write_all(frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn reads_exactly_one_packet() {
        let (client, mut server) = duplex(64);
        let mut io = TimeoutIo::new(client, Duration::from_secs(5), CancellationToken::new());
        server
            .write_all(&[0x05, 0x00, 0x00, 0x01, b'h', b'e', b'l', b'l', b'o'])
            .await
            .unwrap();
        let mut buf = Vec::new();
        let len = read_packet(&mut io, &mut buf).await.unwrap().unwrap();
        assert_eq!(len, 9);
        assert_eq!(&buf[4..9], b"hello");
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let (client, server) = duplex(64);
        drop(server);
        let mut io = TimeoutIo::new(client, Duration::from_secs(5), CancellationToken::new());
        let mut buf = Vec::new();
        assert!(read_packet(&mut io, &mut buf).await.unwrap().is_none());
    }
}
