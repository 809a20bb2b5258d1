//! TCP accept loop (spec §4.G step 0 / §4.H): binds the listen address,
//! assigns each accepted connection a monotonic id, and spawns a
//! [`mediator::run_session`] task per connection. Grounded on
//! `examples/original_source/pkg/mysqlproxy/proxy.go`'s `Serve` loop
//! (accept-spawn-isolate shape, one misbehaving connection can't take
//! down the listener) with graceful shutdown layered on through the
//! same `CancellationToken` every other component already uses.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::server::mediator::{self, MediatorContext};

/// Binds `bind_address` and accepts connections until `ctx.root_cancel`
/// fires, at which point the listener stops accepting and returns once
/// every in-flight session has been spawned (sessions themselves observe
/// the same token and wind down independently).
pub async fn serve(bind_address: &str, ctx: Arc<MediatorContext>) -> io::Result<()> {
    let listener = TcpListener::bind(bind_address).await?;
    info!(address = %bind_address, "listening");

    let conn_id = AtomicU32::new(0);
    let cancel = ctx.root_cancel.clone();

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                info!("listener shutting down");
                return Ok(());
            }
            result = listener.accept() => result,
        };

        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY");
        }

        let id = conn_id.fetch_add(1, Ordering::Relaxed);
        let ctx = ctx.clone();

        tokio::spawn(async move {
            mediator::run_session(stream, id, peer_addr, ctx).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLogWriter, AuditLogWriterConfig};
    use crate::credential::CredentialStore;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn accepts_a_connection_and_serves_the_initial_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let credential_store = Arc::new(CredentialStore::new(dir.path().join("config.json")));
        let cancel = CancellationToken::new();
        let (audit, _join) = AuditLogWriter::spawn(
            AuditLogWriterConfig {
                file_path_template: dir.path().join("audit.log.gz").to_str().unwrap().to_string(),
                rotate_time: Duration::from_secs(3600),
                queue_capacity: 16,
            },
            cancel.clone(),
        )
        .unwrap();

        let ctx = Arc::new(MediatorContext {
            credential_store,
            audit,
            admin_user: "admin".to_string(),
            con_timeout: Duration::from_secs(5),
            root_cancel: cancel.clone(),
            #[cfg(feature = "tls")]
            tls_config: None,
        });

        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp_listener.local_addr().unwrap();
        drop(tcp_listener);

        let serve_ctx = ctx.clone();
        let bind_address = addr.to_string();
        let serve_cancel = cancel.clone();
        let handle = tokio::spawn(async move { serve(&bind_address, serve_ctx).await });

        // give the bind a moment to land before connecting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut byte = [0u8; 1];
        client.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte[0], 10); // protocol version 10

        serve_cancel.cancel();
        let _ = client.shutdown().await;
        handle.await.unwrap().unwrap();
    }
}
