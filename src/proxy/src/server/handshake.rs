//! Server-side MySQL handshake (spec §4.G step 1): TLS upgrade negotiation
//! and `caching_sha2_password` authentication, producing the routing
//! decision (admin loop vs. upstream dial) the session mediator needs.
//!
//! Mined from `static_proxy.rs`'s `initial_handshake`/
//! `respond_client_handshake_rsp` idioms (packet sequencing, auth-plugin
//! switch, winnow error mapping), but unlike that demo this performs a
//! *real* TLS upgrade: on `CLIENT_SSL`, the plain socket is reunited from
//! its split halves, handed to a `tokio_rustls::TlsAcceptor`, and the
//! resulting `ServerStream` is re-split for the rest of the handshake and
//! session. See `io::maybe_tls` for why this indirection is needed.

use std::io;

use mysql_common::constants::CapabilityFlags;
use rand::rngs::OsRng;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Oaep, RsaPrivateKey};
use sha1::Sha1;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{info, warn};
use winnow::error::ErrMode;

#[cfg(feature = "tls")]
use std::sync::Arc;
#[cfg(feature = "tls")]
use tokio_rustls::{rustls, TlsAcceptor};

use crate::credential::CredentialStore;
use crate::io::ServerStream;
use crate::protocol::mysql::basic::{client_handshake_response, HandshakeResponse};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers;
use crate::server::auth;
use crate::server::DEFAULT_SERVER_VERSION;

/// Where to dial upstream, and as which user, once the client is
/// authenticated — empty for admin sessions.
#[derive(Debug, Clone)]
pub struct DialTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

/// Everything the session mediator needs after the handshake completes:
/// the (possibly TLS-upgraded) split stream, the routing decision, and
/// the negotiated capabilities.
pub struct Handshake {
    pub client_read: ReadHalf<ServerStream>,
    pub client_write: WriteHalf<ServerStream>,
    pub client_capabilities: CapabilityFlags,
    pub database: Option<String>,
    pub raw_username: String,
    pub is_admin: bool,
    pub dial: Option<DialTarget>,
}

/// The `username[:pass]@host[:port]` grammar (spec §4.G step 3).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedProxyUser {
    user: String,
    inline_password: Option<String>,
    host: String,
    port: u16,
}

fn parse_proxy_user(raw: &str) -> ParsedProxyUser {
    let (user_part, host_part) = match raw.rsplit_once('@') {
        Some((u, h)) => (u, Some(h)),
        None => (raw, None),
    };
    let (user, inline_password) = match user_part.split_once(':') {
        Some((u, p)) => (u.to_string(), Some(p.to_string())),
        None => (user_part.to_string(), None),
    };
    let (host, port) = match host_part {
        Some(h) => match h.rsplit_once(':') {
            Some((host, port_str)) => (host.to_string(), port_str.parse().unwrap_or(3306)),
            None => (h.to_string(), 3306),
        },
        None => ("localhost".to_string(), 3306),
    };
    ParsedProxyUser {
        user,
        inline_password,
        host,
        port,
    }
}

fn map_handshake_err(
    result: Result<(&[u8], HandshakeResponse), ErrMode<winnow::error::ContextError>>,
) -> io::Result<HandshakeResponse> {
    result
        .map(|(_, rsp)| rsp)
        .map_err(|e| match e {
            ErrMode::Incomplete(_) => io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client sent an incomplete handshake response",
            ),
            ErrMode::Backtrack(err) | ErrMode::Cut(err) => io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad client handshake response: {err:?}"),
            ),
        })
}

fn eof_err(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, what.to_string())
}

fn auth_denied(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, msg.into())
}

/// Runs the full handshake: writes the initial handshake packet, reads
/// the client's response, upgrades to TLS if negotiated, authenticates
/// via `caching_sha2_password` (fast-auth scramble, falling back to
/// full authentication over TLS or RSA), and resolves routing.
pub async fn perform(
    stream: TcpStream,
    conn_id: u32,
    credential_store: &CredentialStore,
    admin_user: &str,
    #[cfg(feature = "tls")] tls_config: Option<Arc<rustls::ServerConfig>>,
) -> io::Result<Handshake> {
    let salt = auth::gen_user_salt();
    let (read_half, write_half) = stream.into_split();
    let mut writer = PacketWriter::new(write_half);

    #[cfg(feature = "tls")]
    writers::write_initial_handshake(
        &mut writer,
        conn_id as u64,
        salt,
        DEFAULT_SERVER_VERSION,
        &tls_config,
    )
    .await?;
    #[cfg(not(feature = "tls"))]
    writers::write_initial_handshake(&mut writer, conn_id as u64, salt, DEFAULT_SERVER_VERSION)
        .await?;
    writer.flush_all().await?;

    let mut reader = PacketReader::new(read_half);
    let (seq, pkt) = reader
        .next_async()
        .await?
        .ok_or_else(|| eof_err("client disconnected before sending a handshake response"))?;
    let first_rsp = map_handshake_err(client_handshake_response(&pkt, false))?;

    #[cfg(feature = "tls")]
    let wants_tls = first_rsp.client_flag.contains(CapabilityFlags::CLIENT_SSL) && tls_config.is_some();
    #[cfg(not(feature = "tls"))]
    let wants_tls = false;

    let (mut reader, mut writer, handshake_rsp) = if wants_tls {
        #[cfg(feature = "tls")]
        {
            let read_half = reader.r;
            let write_half = writer.inner_writer;
            let tcp_stream = read_half
                .reunite(write_half)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            let acceptor = TlsAcceptor::from(tls_config.clone().expect("checked above"));
            let tls_stream = acceptor.accept(tcp_stream).await.map_err(|e| {
                io::Error::new(io::ErrorKind::Other, format!("TLS handshake failed: {e}"))
            })?;
            let server_stream = ServerStream::Tls(Box::new(tls_stream));
            let (split_read, split_write) = tokio::io::split(server_stream);
            let mut reader = PacketReader::new(split_read);
            let mut writer = PacketWriter::new(split_write);
            writer.set_seq(seq.wrapping_add(1));

            let (_, pkt) = reader
                .next_async()
                .await?
                .ok_or_else(|| eof_err("client disconnected during TLS upgrade"))?;
            let handshake_rsp = map_handshake_err(client_handshake_response(&pkt, true))?;
            (reader, writer, handshake_rsp)
        }
        #[cfg(not(feature = "tls"))]
        unreachable!("wants_tls is always false without the tls feature")
    } else {
        let read_half = reader.r;
        let write_half = writer.inner_writer;
        let tcp_stream = read_half
            .reunite(write_half)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let server_stream = ServerStream::Plain(tcp_stream);
        let (split_read, split_write) = tokio::io::split(server_stream);
        let mut reader = PacketReader::new(split_read);
        let mut writer = PacketWriter::new(split_write);
        writer.set_seq(seq.wrapping_add(1));
        (reader, writer, first_rsp)
    };

    if !handshake_rsp
        .client_flag
        .contains(CapabilityFlags::CLIENT_PROTOCOL_41)
    {
        writers::write_err_packet(
            ErrorKind::ER_NOT_SUPPORTED_YET,
            b"client must support CLIENT_PROTOCOL_41",
            &mut writer,
        )
        .await?;
        writer.flush_all().await?;
        return Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "client does not support CLIENT_PROTOCOL_41",
        ));
    }

    let raw_username = handshake_rsp.db_user_string();
    let is_admin = raw_username == admin_user;

    let dial = if is_admin {
        None
    } else {
        let parsed = parse_proxy_user(&raw_username);
        Some(parsed)
    };

    let expected_password = if is_admin {
        credential_store
            .lookup(&raw_username)
            .await
            .ok_or_else(|| auth_denied(format!("unknown admin user {raw_username:?}")))?
    } else {
        let parsed = dial.as_ref().expect("dial is Some for non-admin users");
        match &parsed.inline_password {
            Some(pw) => pw.clone(),
            None => credential_store
                .lookup(&raw_username)
                .await
                .ok_or_else(|| auth_denied(format!("no credentials for {raw_username:?}")))?,
        }
    };

    let dial_target = dial.map(|parsed| DialTarget {
        host: parsed.host,
        port: parsed.port,
        user: parsed.user,
        password: expected_password.clone(),
    });

    authenticate(
        &mut reader,
        &mut writer,
        &salt,
        &expected_password,
        server_stream_is_tls(&handshake_rsp, wants_tls),
        &handshake_rsp.auth_response,
    )
    .await?;

    writers::write_ok_packet_with_client_flags(
        &mut writer,
        handshake_rsp.client_flag,
        crate::protocol::mysql::basic::OkPacket {
            status_flags: mysql_common::constants::StatusFlags::SERVER_STATUS_AUTOCOMMIT,
            ..Default::default()
        },
    )
    .await?;
    writer.flush_all().await?;

    info!(
        user = %raw_username,
        is_admin,
        tls = wants_tls,
        "handshake complete"
    );

    Ok(Handshake {
        client_read: reader.r,
        client_write: writer.inner_writer,
        client_capabilities: handshake_rsp.client_flag,
        database: handshake_rsp
            .database
            .as_ref()
            .map(|d| String::from_utf8_lossy(d).to_string()),
        raw_username,
        is_admin,
        dial: dial_target,
    })
}

/// `wants_tls` already reflects whether the upgrade happened; kept as a
/// tiny named helper so the call site at least reads as a deliberate
/// choice rather than a stray boolean.
fn server_stream_is_tls(_handshake_rsp: &HandshakeResponse, wants_tls: bool) -> bool {
    wants_tls
}

/// Verifies `caching_sha2_password`: fast-auth scramble first, falling
/// back to full authentication (cleartext over TLS, RSA-OAEP otherwise)
/// when the client didn't send a usable scramble.
async fn authenticate<R, W>(
    reader: &mut PacketReader<R>,
    writer: &mut PacketWriter<W>,
    nonce: &[u8; 20],
    expected_password: &str,
    is_tls: bool,
    auth_response: &[u8],
) -> io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let expected_scramble = auth::scramble_caching_sha2_password(expected_password.as_bytes(), nonce);
    if auth_response.len() == 32 && auth_response == expected_scramble {
        writers::write_auth_more_data(writer, &[0x03]).await?;
        writer.flush_all().await?;
        return Ok(());
    }

    let recovered = if is_tls {
        writers::write_auth_more_data(writer, &[0x04]).await?;
        writer.flush_all().await?;
        let (_, pkt) = reader
            .next_async()
            .await?
            .ok_or_else(|| eof_err("client disconnected during full authentication"))?;
        let mut bytes = pkt.to_vec();
        if bytes.last() == Some(&0) {
            bytes.pop();
        }
        String::from_utf8(bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "password is not valid utf-8"))?
    } else {
        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("RSA keygen failed: {e}")))?;
        let public_key = private_key.to_public_key();
        let public_pem = public_key
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("RSA PEM encode failed: {e}")))?;
        writers::write_auth_more_data(writer, public_pem.as_bytes()).await?;
        writer.flush_all().await?;

        let (_, pkt) = reader
            .next_async()
            .await?
            .ok_or_else(|| eof_err("client disconnected during RSA full authentication"))?;
        let xored = private_key
            .decrypt(Oaep::new::<Sha1>(), &pkt)
            .map_err(|_| auth_denied("RSA full-auth decryption failed"))?;
        let mut bytes: Vec<u8> = xored
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ nonce[i % nonce.len()])
            .collect();
        if bytes.last() == Some(&0) {
            bytes.pop();
        }
        String::from_utf8(bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "password is not valid utf-8"))?
    };

    if recovered == expected_password {
        Ok(())
    } else {
        warn!("caching_sha2_password full authentication failed");
        writers::write_err_packet(
            ErrorKind::ER_ACCESS_DENIED_ERROR,
            b"Access denied",
            writer,
        )
        .await?;
        writer.flush_all().await?;
        Err(auth_denied("full authentication password mismatch"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_pass_host_port() {
        let parsed = parse_proxy_user("u1:pw@h1:3307");
        assert_eq!(parsed.user, "u1");
        assert_eq!(parsed.inline_password.as_deref(), Some("pw"));
        assert_eq!(parsed.host, "h1");
        assert_eq!(parsed.port, 3307);
    }

    #[test]
    fn defaults_missing_port_to_3306() {
        let parsed = parse_proxy_user("u1@h1");
        assert_eq!(parsed.port, 3306);
        assert_eq!(parsed.host, "h1");
    }

    #[test]
    fn defaults_missing_host_to_localhost() {
        let parsed = parse_proxy_user("u1");
        assert_eq!(parsed.host, "localhost");
        assert_eq!(parsed.port, 3306);
        assert_eq!(parsed.user, "u1");
        assert!(parsed.inline_password.is_none());
    }

    #[test]
    fn full_username_is_preserved_for_lookup() {
        let raw = "u1@h1:3306";
        let parsed = parse_proxy_user(raw);
        assert_eq!(parsed.user, "u1");
        // the lookup key is the *raw* string, not `parsed.user` — verified
        // by credential::tests::insert_then_select_round_trips using the
        // full `user@host:port` as the stored pattern.
    }
}
