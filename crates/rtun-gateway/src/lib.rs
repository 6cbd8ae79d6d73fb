pub mod portfwd;
pub mod router;
pub mod session;

use std::sync::Arc;

use rtun_core::credentials::CredentialStore;
use rtun_core::error::ErrorKind;
use rtun_core::metrics::{NoopObserver, SessionObserver};
use rtun_core::transport::Connection;
use rtun_core::types::{GroupId, Protocol, TargetAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use router::GroupRouter;
pub use session::GatewaySession;

/// Accepts one inbound tunnel connection, completes the handshake, registers it into
/// `router`, and runs its read loop until the transport dies — `spec.md` §4.F in full.
/// Call this once per `Listener::accept()` result, typically spawned as its own task.
pub async fn serve_session<C: Connection, S: CredentialStore>(
    connection: C,
    store: Arc<S>,
    router: Arc<GroupRouter<GatewaySession<C>>>,
) -> Result<(), ErrorKind> {
    serve_session_with_observer(connection, store, router, Arc::new(NoopObserver)).await
}

/// Same as [`serve_session`] but lets the caller plug in a [`SessionObserver`] other
/// than the default no-op, e.g. to feed an external metrics exporter.
pub async fn serve_session_with_observer<C: Connection, S: CredentialStore>(
    connection: C,
    store: Arc<S>,
    router: Arc<GroupRouter<GatewaySession<C>>>,
    observer: Arc<dyn SessionObserver>,
) -> Result<(), ErrorKind> {
    let session = Arc::new(GatewaySession::handshake_with_observer(connection, store.as_ref(), observer).await?);
    router.register(session.group_id().clone(), session.clone()).await;

    session.run().await;

    router.unregister(session.group_id(), session.client_id()).await;
    Ok(())
}

/// `Dispatch` (`spec.md` §4.G): authenticates an external proxy request against the
/// Credential Store, round-robins it to a live session in `group_id`'s pool, opens a
/// virtual connection, and pipes `external` bidirectionally with it until either side
/// closes. `auth_user` is always the `group_id` in string form; callers (the HTTP
/// CONNECT / SOCKS5 / TUIC front-ends) are responsible for that mapping.
pub async fn dispatch<C, Cred, X>(
    router: &GroupRouter<GatewaySession<C>>,
    store: &Cred,
    group_id: GroupId,
    auth_pass: &str,
    target: TargetAddr,
    protocol: Protocol,
    external: X,
) -> Result<(), ErrorKind>
where
    C: Connection,
    Cred: CredentialStore,
    X: AsyncRead + AsyncWrite + Unpin,
{
    if !store.validate(&group_id, auth_pass).await.unwrap_or(false) {
        return Err(ErrorKind::AuthFailed { group_id: group_id.to_string() });
    }

    let session = router.dispatch(&group_id).await?;
    let (conn_id, virtual_conn, inbound_rx) = session.dispatch_connect(target, protocol).await?;

    pipe_external(session.as_ref(), conn_id, virtual_conn, external, inbound_rx).await
}

async fn pipe_external<C, S>(
    session: &GatewaySession<C>,
    conn_id: rtun_core::types::ConnId,
    virtual_conn: Arc<rtun_core::mux::VirtualConn>,
    external: S,
    mut inbound_rx: tokio::sync::mpsc::UnboundedReceiver<bytes::Bytes>,
) -> Result<(), ErrorKind>
where
    C: Connection,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut read_half, mut write_half) = tokio::io::split(external);

    let upstream = async {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if session.send_data(conn_id, bytes::Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                break;
            }
        }
    };

    let downstream = async {
        while let Some(payload) = inbound_rx.recv().await {
            let len = payload.len();
            if write_half.write_all(&payload).await.is_err() {
                break;
            }
            virtual_conn.release_inbound(len);
        }
    };

    tokio::join!(upstream, downstream);
    session.send_close(conn_id, None).await;
    Ok(())
}
