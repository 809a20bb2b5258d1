//! Session mediator (spec §4.G/§5): everything that happens after a
//! successful handshake — admin SQL dispatch, or packet-by-packet
//! relaying to the dialed upstream with one audit record per
//! client→server packet plus a bracketing `connect`/`disconnect` pair.
//!
//! Grounded on `static_proxy.rs`'s `on_cmd` dispatch loop for the admin
//! side (same `from_packet`/`Command` match, same "unknown command gets
//! an OK, not an error" texture) and on `examples/original_source/pkg/mysqlproxy/proxy.go`'s
//! `handleConn`/`pipe` pair for the relay side: write to the outbound
//! socket first, enqueue the audit record second, and let whichever
//! direction's pipe exits first cancel its sibling.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mysql_common::constants::CapabilityFlags;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(feature = "tls")]
use tokio_rustls::rustls;

use crate::admin::{self, AdminOutcome, AdminQueryError};
use crate::audit::AuditWriterHandle;
use crate::credential::{CredentialError, CredentialStore};
use crate::io::TimeoutIo;
use crate::protocol::mysql::basic::{self, Command};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::framer;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::writers;
use crate::server::handshake::{self, Handshake};
use crate::server::upstream;

/// Shared, per-listener state every session needs; cheap to clone via
/// `Arc`, never mutated after the listener constructs it.
pub struct MediatorContext {
    pub credential_store: Arc<CredentialStore>,
    pub audit: AuditWriterHandle,
    pub admin_user: String,
    pub con_timeout: Duration,
    pub root_cancel: CancellationToken,
    #[cfg(feature = "tls")]
    pub tls_config: Option<Arc<rustls::ServerConfig>>,
}

/// Runs one accepted connection end to end: handshake, then either the
/// admin loop or the relay, then the bracketing audit markers. Errors
/// are logged here, not propagated — a single session's failure must
/// never take down the listener.
pub async fn run_session(
    stream: TcpStream,
    conn_id: u32,
    peer_addr: SocketAddr,
    ctx: Arc<MediatorContext>,
) {
    let handshake_result = handshake::perform(
        stream,
        conn_id,
        &ctx.credential_store,
        &ctx.admin_user,
        #[cfg(feature = "tls")]
        ctx.tls_config.clone(),
    )
    .await;

    let hs = match handshake_result {
        Ok(hs) => hs,
        Err(e) => {
            // The client never resolved to a known user, so there is
            // nothing to attach a "connect"/"disconnect" pair to — spec
            // §7 only requires audit coverage from a successful
            // handshake onward.
            warn!(conn_id, addr = %peer_addr, error = %e, "handshake failed");
            return;
        }
    };

    let user = hs.raw_username.clone();
    let db = hs.database.clone().unwrap_or_default();
    let addr = peer_addr.to_string();
    let cancel = ctx.root_cancel.child_token();

    if !emit_marker(&ctx, conn_id, &user, &db, &addr, "connect", "", &cancel).await {
        return;
    }

    let is_admin = hs.is_admin;
    let err = if is_admin {
        run_admin_loop(hs, &ctx, conn_id, &cancel).await
    } else {
        run_relay(hs, &ctx, conn_id, &addr, &cancel).await
    };

    emit_marker(&ctx, conn_id, &user, &db, &addr, "disconnect", &err, &cancel).await;

    info!(conn_id, user = %user, is_admin, "session closed");
}

/// Submits one marker record; a submit failure is treated as fatal per
/// spec §7 (the audit writer is load-bearing, not best-effort), so it
/// cancels the whole proxy's root token and tells the caller to stop.
async fn emit_marker(
    ctx: &MediatorContext,
    conn_id: u32,
    user: &str,
    db: &str,
    addr: &str,
    state: &str,
    err: &str,
    cancel: &CancellationToken,
) -> bool {
    let mut record = ctx.audit.get_record().await;
    record.timestamp = now_epoch_seconds();
    record.connection_id = conn_id;
    record.user = user.to_string();
    record.db = db.to_string();
    record.addr = addr.to_string();
    record.state = state.to_string();
    record.err = err.to_string();

    match ctx.audit.submit(record, cancel).await {
        Ok(()) => true,
        Err(e) => {
            error!(conn_id, error = %e, "audit submit failed; cancelling proxy");
            ctx.root_cancel.cancel();
            false
        }
    }
}

/// Seconds since epoch, per spec §3's `timestamp` field. Saturates rather
/// than panics on a clock set before 1970 — a broken system clock should
/// not take down the audit path.
fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn admin_error_kind(e: &AdminQueryError) -> ErrorKind {
    match e {
        AdminQueryError::Parse(_) => ErrorKind::ER_PARSE_ERROR,
        AdminQueryError::UnsupportedStatement => ErrorKind::ER_NOT_SUPPORTED_YET,
        AdminQueryError::UnsupportedWhere => ErrorKind::ER_PARSE_ERROR,
        AdminQueryError::Credential(ce) => credential_error_kind(ce),
    }
}

fn credential_error_kind(e: &CredentialError) -> ErrorKind {
    match e {
        CredentialError::WhereNotEqual => ErrorKind::ER_NOT_SUPPORTED_YET,
        CredentialError::NoUpdateData => ErrorKind::ER_NOT_SUPPORTED_YET,
        CredentialError::NotFoundData => ErrorKind::ER_NOT_SUPPORTED_YET,
        CredentialError::AlreadyExists(_) => ErrorKind::ER_DUP_ENTRY,
        CredentialError::UnknownColumn(_) => ErrorKind::ER_BAD_FIELD_ERROR,
        CredentialError::Io(_)
        | CredentialError::Json(_)
        | CredentialError::MalformedCiphertext
        | CredentialError::DecryptionFailed => ErrorKind::ER_INTERNAL_ERROR,
    }
}

/// Runs the admin "virtual database" loop: every `COM_QUERY` is handed
/// to [`admin::execute`] against the credential store; everything else
/// gets the minimal response a real server would give a client that
/// never asks for more. No `TimeoutIo`, matching `handshake.rs`'s own
/// precedent of driving the raw split halves directly.
async fn run_admin_loop(
    hs: Handshake,
    ctx: &MediatorContext,
    conn_id: u32,
    cancel: &CancellationToken,
) -> String {
    let mut reader = PacketReader::new(hs.client_read);
    let mut writer = PacketWriter::new(hs.client_write);
    let client_flags = hs.client_capabilities;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return String::new(),
            result = reader.next_async() => result,
        };

        let (seq, pkt) = match next {
            Ok(Some(pair)) => pair,
            Ok(None) => return String::new(),
            Err(e) => return e.to_string(),
        };
        writer.set_seq(seq.wrapping_add(1));

        match basic::from_packet(&pkt) {
            Ok((_, Command::Query(sql))) => {
                let sql = String::from_utf8_lossy(sql).into_owned();
                match admin::execute(&ctx.credential_store, &sql).await {
                    Ok(AdminOutcome::Rows(columns, rows)) => {
                        if let Err(e) =
                            writers::write_text_result_set(&mut writer, client_flags, "servers", &columns, &rows)
                                .await
                        {
                            return e.to_string();
                        }
                    }
                    Ok(AdminOutcome::Affected(n)) => {
                        if let Err(e) = writers::write_ok_packet(
                            &mut writer,
                            n,
                            0,
                            mysql_common::constants::StatusFlags::SERVER_STATUS_AUTOCOMMIT,
                        )
                        .await
                        {
                            return e.to_string();
                        }
                    }
                    Err(e) => {
                        warn!(conn_id, error = %e, "admin query failed");
                        let msg = e.to_string();
                        if let Err(write_err) =
                            writers::write_err_packet(admin_error_kind(&e), msg.as_bytes(), &mut writer).await
                        {
                            return write_err.to_string();
                        }
                    }
                }
                if let Err(e) = writer.flush_all().await {
                    return e.to_string();
                }
            }
            Ok((_, Command::Ping)) => {
                if let Err(e) = writers::write_ok_packet_with_client_flags(
                    &mut writer,
                    client_flags,
                    crate::protocol::mysql::basic::OkPacket::default(),
                )
                .await
                {
                    return e.to_string();
                }
                if let Err(e) = writer.flush_all().await {
                    return e.to_string();
                }
            }
            Ok((_, Command::Quit)) => return String::new(),
            Ok(_) => {
                if let Err(e) = writers::write_err_packet(
                    ErrorKind::ER_NOT_SUPPORTED_YET,
                    b"admin session only supports COM_QUERY, COM_PING and COM_QUIT",
                    &mut writer,
                )
                .await
                {
                    return e.to_string();
                }
                if let Err(e) = writer.flush_all().await {
                    return e.to_string();
                }
            }
            Err(e) => {
                warn!(conn_id, error = ?e, "admin session sent an unparseable command");
                return format!("unparseable command: {e:?}");
            }
        }
    }
}

/// Dials upstream as the client's resolved user and relays packets in
/// both directions until either side closes or the session is
/// cancelled. Returns the session-ending error string (empty on a
/// clean close).
async fn run_relay(
    hs: Handshake,
    ctx: &Arc<MediatorContext>,
    conn_id: u32,
    addr: &str,
    cancel: &CancellationToken,
) -> String {
    let target = match &hs.dial {
        Some(target) => target.clone(),
        None => return "no dial target resolved for a non-admin session".to_string(),
    };
    let mirror_local_files = hs.client_capabilities.contains(CapabilityFlags::CLIENT_LOCAL_FILES);

    let (upstream_read, upstream_write) =
        match upstream::connect(&target, mirror_local_files, hs.database.as_deref()).await {
            Ok(halves) => halves,
            Err(e) => {
                warn!(conn_id, host = %target.host, port = target.port, error = %e, "upstream dial failed");
                return e.to_string();
            }
        };

    let client_read = TimeoutIo::new(hs.client_read, ctx.con_timeout, cancel.clone());
    let client_write = TimeoutIo::new(hs.client_write, ctx.con_timeout, cancel.clone());
    let upstream_read = TimeoutIo::new(upstream_read, ctx.con_timeout, cancel.clone());
    let upstream_write = TimeoutIo::new(upstream_write, ctx.con_timeout, cancel.clone());

    let user = hs.raw_username;
    let db = hs.database.unwrap_or_default();
    let relay_cancel = cancel.clone();
    let audit = ctx.audit.clone();

    let server_to_client = tokio::spawn(server_to_client_pump(
        upstream_read,
        client_write,
        relay_cancel.clone(),
    ));

    let client_err = client_to_server_pump(
        client_read,
        upstream_write,
        audit,
        conn_id,
        user,
        db,
        addr.to_string(),
        relay_cancel.clone(),
    )
    .await;

    relay_cancel.cancel();
    let server_err = match server_to_client.await {
        Ok(err) => err,
        Err(e) => format!("server-to-client pump panicked: {e}"),
    };

    if !client_err.is_empty() {
        client_err
    } else {
        server_err
    }
}

/// Reads one client packet at a time, relays it upstream, and submits
/// an audit record for it — in that order, so a record is never logged
/// for a write that never reached the server.
#[allow(clippy::too_many_arguments)]
async fn client_to_server_pump(
    mut client_read: TimeoutIo<tokio::io::ReadHalf<crate::io::ServerStream>>,
    mut upstream_write: TimeoutIo<tokio::net::tcp::OwnedWriteHalf>,
    audit: AuditWriterHandle,
    conn_id: u32,
    user: String,
    db: String,
    addr: String,
    cancel: CancellationToken,
) -> String {
    loop {
        let mut record = audit.get_record().await;
        record.timestamp = now_epoch_seconds();
        record.connection_id = conn_id;
        record.user = user.clone();
        record.db = db.clone();
        record.addr = addr.clone();
        record.state = "est".to_string();

        let read_result = tokio::select! {
            _ = cancel.cancelled() => {
                audit.put_record(record);
                return String::new();
            }
            result = framer::read_packet(&mut client_read, &mut record.packets) => result,
        };

        let len = match read_result {
            Ok(Some(len)) => len,
            Ok(None) => {
                audit.put_record(record);
                return String::new();
            }
            Err(e) => {
                audit.put_record(record);
                return e.to_string();
            }
        };
        // `read_packet` reuses `record.packets`' allocation across calls and
        // only ever grows it — a shorter packet than the previous one would
        // otherwise leave stale trailing bytes in both the upstream write
        // and the audit payload.
        record.packets.truncate(len);
        // `cmd` stays empty here — it's the offline decoder's job to turn
        // `packets`' leading command byte into a name (spec §6/§8 scenario
        // 1), not the mediator's.

        if let Err(e) = framer::write_packet(&mut upstream_write, &record.packets).await {
            audit.put_record(record);
            return e.to_string();
        }

        if let Err(e) = audit.submit(record, &cancel).await {
            error!(conn_id, error = %e, "audit submit failed during relay");
            return e.to_string();
        }
    }
}

/// Straight byte-for-byte copy from the upstream to the client — this
/// direction is never audited (spec §5: only client→server traffic is
/// recorded).
async fn server_to_client_pump(
    mut upstream_read: TimeoutIo<tokio::net::tcp::OwnedReadHalf>,
    mut client_write: TimeoutIo<tokio::io::WriteHalf<crate::io::ServerStream>>,
    cancel: CancellationToken,
) -> String {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let read_result = tokio::select! {
            _ = cancel.cancelled() => return String::new(),
            result = upstream_read.read(&mut buf) => result,
        };
        let n = match read_result {
            Ok(0) => return String::new(),
            Ok(n) => n,
            Err(e) => return e.to_string(),
        };
        if let Err(e) = client_write.write_all(&buf[..n]).await {
            return e.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_error_kinds_preserve_distinguishable_messages() {
        let e = AdminQueryError::Credential(CredentialError::WhereNotEqual);
        assert_eq!(e.to_string(), "where only supports equal operation");
        assert_eq!(admin_error_kind(&e), ErrorKind::ER_NOT_SUPPORTED_YET);
    }

    #[test]
    fn duplicate_user_maps_to_dup_entry() {
        let e = CredentialError::AlreadyExists("u1".to_string());
        assert_eq!(credential_error_kind(&e), ErrorKind::ER_DUP_ENTRY);
    }
}
