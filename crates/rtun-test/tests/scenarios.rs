//! End-to-end scenarios exercising Gateway + Private Client + Group Router together over
//! `LoopbackTransport`, corresponding to `spec.md` §8's S1-S6.
//!
//! Front-end wire protocols (HTTP CONNECT, SOCKS5, TUIC) are out of scope for this
//! workspace; these scenarios drive the same seam those front-ends would call —
//! `rtun_gateway::dispatch` — directly with an in-memory duplex standing in for the
//! external proxy client's socket.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rtun_core::context::AppContext;
use rtun_core::credentials::MemoryCredentialStore;
use rtun_core::error::ErrorKind;
use rtun_core::transport::{HandshakeMeta, Listener};
use rtun_core::types::{ClientId, GroupId, OpenPortSpec, Protocol, TargetAddr};
use rtun_client::{ClientSession, HostPatternSpec, HostPolicy};
use rtun_gateway::{dispatch, serve_session, GatewaySession, GroupRouter};
use rtun_test::LoopbackTransport;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn group(name: &str) -> GroupId {
    GroupId::new(name).unwrap()
}

fn handshake(group_id: &str, group_password: &str) -> HandshakeMeta {
    HandshakeMeta {
        client_id: ClientId::generate(),
        group_id: group(group_id),
        username: "user".into(),
        password: String::new(),
        group_password: Some(group_password.into()),
    }
}

type Gateway = GroupRouter<GatewaySession<rtun_test::LoopbackConnection>>;

fn start_gateway(transport: &LoopbackTransport, store: Arc<MemoryCredentialStore>) -> Arc<Gateway> {
    let router = Arc::new(GroupRouter::new());
    let mut listener = transport.listener();
    let router_for_loop = router.clone();
    tokio::spawn(async move {
        loop {
            let connection = match listener.accept().await {
                Ok(connection) => connection,
                Err(_) => break,
            };
            let store = store.clone();
            let router = router_for_loop.clone();
            tokio::spawn(async move {
                let _ = serve_session(connection, store, router).await;
            });
        }
    });
    router
}

fn spawn_client(
    transport: LoopbackTransport,
    group_id: &str,
    group_password: &str,
    allowed: Vec<HostPatternSpec>,
    open_ports: Vec<OpenPortSpec>,
) -> (Arc<ClientSession<LoopbackTransport>>, tokio::task::JoinHandle<()>) {
    let policy = HostPolicy::compile(allowed, vec![]).unwrap();
    let session = Arc::new(ClientSession::new(
        transport,
        "loopback".into(),
        handshake(group_id, group_password),
        policy,
        open_ports,
        AppContext::new(),
    ));
    let handle = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });
    (session, handle)
}

async fn wait_for_group_size(router: &Gateway, group_id: &GroupId, expected: usize) {
    for _ in 0..200 {
        if router.group_size(group_id).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("group never reached the expected size in time");
}

async fn start_echo_server() -> u16 {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut socket, _peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

/// S1: a single external CONNECT rides the tunnel to a Client, which dials the allowed
/// local target; bytes written on either end of the pipe appear verbatim on the other.
#[tokio::test]
async fn s1_single_hop_connect_pipes_bytes_end_to_end() {
    let store = Arc::new(MemoryCredentialStore::new());
    let transport = LoopbackTransport::new();
    let router = start_gateway(&transport, store.clone());

    let echo_port = start_echo_server().await;
    let allowed = vec![HostPatternSpec::Literal { host: "127.0.0.1".into(), port: Some(echo_port) }];
    let (_client, _handle) = spawn_client(transport, "g1", "hunter2", allowed, vec![]);
    wait_for_group_size(&router, &group("g1"), 1).await;

    let (mut external, peer) = tokio::io::duplex(4096);
    let target = TargetAddr::IPv4(Ipv4Addr::LOCALHOST, echo_port);

    let router_for_task = router.clone();
    let store_for_task = store.clone();
    let dispatch_task = tokio::spawn(async move {
        dispatch(router_for_task.as_ref(), store_for_task.as_ref(), group("g1"), "hunter2", target, Protocol::Tcp, peer)
            .await
    });

    external.write_all(b"hello through the tunnel").await.unwrap();
    let mut buf = [0u8; 64];
    let n = external.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello through the tunnel");

    drop(external);
    dispatch_task.await.unwrap().unwrap();
}

/// S2: dispatching with the wrong group password never reaches a Client at all.
#[tokio::test]
async fn s2_auth_failure_rejects_dispatch_before_touching_a_client() {
    let store = Arc::new(MemoryCredentialStore::new());
    let transport = LoopbackTransport::new();
    let router = start_gateway(&transport, store.clone());
    let (_client, _handle) = spawn_client(transport, "g1", "correct-password", vec![], vec![]);
    wait_for_group_size(&router, &group("g1"), 1).await;

    let (_external, peer) = tokio::io::duplex(64);
    let err = dispatch(
        router.as_ref(),
        store.as_ref(),
        group("g1"),
        "wrong-password",
        TargetAddr::Domain("example.org".into(), 80),
        Protocol::Tcp,
        peer,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ErrorKind::AuthFailed { .. }));
}

/// S3: a Client whose host policy doesn't allow the requested target acks the CONNECT
/// with `ok=false`, which dispatch surfaces as a refused upstream, not a hang.
#[tokio::test]
async fn s3_host_policy_denial_refuses_the_connect() {
    let store = Arc::new(MemoryCredentialStore::new());
    let transport = LoopbackTransport::new();
    let router = start_gateway(&transport, store.clone());
    let (_client, _handle) = spawn_client(transport, "g1", "pw", vec![], vec![]);
    wait_for_group_size(&router, &group("g1"), 1).await;

    let (_external, peer) = tokio::io::duplex(64);
    let err = dispatch(
        router.as_ref(),
        store.as_ref(),
        group("g1"),
        "pw",
        TargetAddr::Domain("forbidden.example.org".into(), 443),
        Protocol::Tcp,
        peer,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ErrorKind::UpstreamRefused { .. }));
}

/// S4: ten dispatches against a two-Client group split exactly 5/5, in round-robin order.
#[tokio::test]
async fn s4_round_robins_fairly_across_two_replicas() {
    let store = Arc::new(MemoryCredentialStore::new());
    let transport = LoopbackTransport::new();
    let router = start_gateway(&transport, store.clone());

    let (_client_a, _handle_a) = spawn_client(transport.clone(), "g1", "pw", vec![], vec![]);
    let (_client_b, _handle_b) = spawn_client(transport, "g1", "pw", vec![], vec![]);
    wait_for_group_size(&router, &group("g1"), 2).await;

    let mut counts: HashMap<ClientId, usize> = HashMap::new();
    for _ in 0..10 {
        let session = router.dispatch(&group("g1")).await.unwrap();
        *counts.entry(session.client_id().clone()).or_insert(0) += 1;
    }

    assert_eq!(counts.len(), 2, "both replicas should have been picked");
    for count in counts.values() {
        assert_eq!(*count, 5);
    }
}

/// S5: a Client's configured reverse port forward binds on the Gateway and pipes bytes
/// to the Client's local target, with no external dispatch involved.
#[tokio::test]
async fn s5_reverse_port_forwarding_pipes_to_the_local_target() {
    let store = Arc::new(MemoryCredentialStore::new());
    let transport = LoopbackTransport::new();
    let _router = start_gateway(&transport, store.clone());

    let echo_port = start_echo_server().await;
    let remote_port = 40_000 + (rand::random::<u16>() % 5_000);
    let open_ports = vec![OpenPortSpec {
        remote_port,
        protocol: Protocol::Tcp,
        local_host: "127.0.0.1".into(),
        local_port: echo_port,
    }];
    let (_client, _handle) = spawn_client(transport, "g1", "pw", vec![], open_ports);

    let mut stream = None;
    for _ in 0..200 {
        match tokio::net::TcpStream::connect(("127.0.0.1", remote_port)).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    let mut stream = stream.expect("reverse port never came up");

    stream.write_all(b"reverse tunnel payload").await.unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"reverse tunnel payload");
}

/// S6: killing a Client's transport mid-session drops it out of routing once the
/// Gateway's read loop notices the peer is gone, without taking the Gateway down.
#[tokio::test]
async fn s6_transport_death_drops_the_session_from_routing() {
    let store = Arc::new(MemoryCredentialStore::new());
    let transport = LoopbackTransport::new();
    let router = start_gateway(&transport, store.clone());

    let (_client, handle) = spawn_client(transport, "g1", "pw", vec![], vec![]);
    wait_for_group_size(&router, &group("g1"), 1).await;

    handle.abort();
    wait_for_group_size(&router, &group("g1"), 0).await;

    let (_external, peer) = tokio::io::duplex(64);
    let err = dispatch(
        router.as_ref(),
        store.as_ref(),
        group("g1"),
        "pw",
        TargetAddr::Domain("example.org".into(), 80),
        Protocol::Tcp,
        peer,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ErrorKind::NoClientAvailable { .. }));
}

/// S6b: killing a Client's transport while a dispatched stream has well over the 64 KiB
/// inbound buffer's worth of bytes in flight still unblocks the external half with an
/// orderly EOF within 5 s, instead of hanging forever on a `VirtualConn` whose
/// `inbound_tx` nothing ever drops (`spec.md` §4.F step 4, §4.C, §7 TransportDead).
#[tokio::test]
async fn s6b_transport_death_mid_stream_closes_the_external_socket() {
    const PAYLOAD_LEN: usize = 256 * 1024; // several multiples of INBOUND_BUFFER_CAPACITY

    let store = Arc::new(MemoryCredentialStore::new());
    let transport = LoopbackTransport::new();
    let router = start_gateway(&transport, store.clone());

    let echo_port = start_echo_server().await;
    let allowed = vec![HostPatternSpec::Literal { host: "127.0.0.1".into(), port: Some(echo_port) }];
    let (_client, handle) = spawn_client(transport, "g1", "pw", allowed, vec![]);
    wait_for_group_size(&router, &group("g1"), 1).await;

    let (mut external, peer) = tokio::io::duplex(4096);
    let target = TargetAddr::IPv4(Ipv4Addr::LOCALHOST, echo_port);

    let router_for_task = router.clone();
    let store_for_task = store.clone();
    let dispatch_task = tokio::spawn(async move {
        dispatch(router_for_task.as_ref(), store_for_task.as_ref(), group("g1"), "pw", target, Protocol::Tcp, peer).await
    });

    // Drive the echo round-trip from a separate task: the `tokio::io::duplex` backing
    // `external` is far smaller than `PAYLOAD_LEN`, so writing and reading must run
    // concurrently or both sides deadlock on a full pipe before a single byte of the
    // bug this guards against would ever show up.
    let writer = tokio::spawn(async move {
        let payload = vec![0xABu8; PAYLOAD_LEN];
        let _ = external.write_all(&payload).await;
        let mut received = 0usize;
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match external.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => received += n,
            }
        }
        received
    });

    // Let well over 64 KiB round-trip through the tunnel before killing the transport,
    // so the dispatched `VirtualConn` has outstanding inbound buffer state live on the
    // Gateway when the Client disappears.
    tokio::time::sleep(Duration::from_millis(200)).await;

    handle.abort();

    let received = tokio::time::timeout(Duration::from_secs(5), writer)
        .await
        .expect("external socket never reached EOF after the client's transport died")
        .unwrap();
    assert!(received > 0, "expected at least some of the echoed payload before the transport died");

    tokio::time::timeout(Duration::from_secs(5), dispatch_task)
        .await
        .expect("dispatch never returned after the client's transport died")
        .unwrap()
        .unwrap();
}
