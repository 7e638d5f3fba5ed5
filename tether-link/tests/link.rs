//! Loopback TCP tests for the server and client roles.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_link::{
    ChannelDispatcher, Client, Delivery, HandshakeFailurePolicy, Link, LinkConfig, LinkError,
    Server, ServerConfig, SessionHandle, SessionState,
};
use tether_protocol::{Event, EventRegistry, Frame, RawEvent};
use tether_transform::ChaChaTransform;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;

const EVENT_TYPE: u32 = 100;

type Deliveries = UnboundedReceiver<Delivery>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tether_link=debug")
        .with_test_writer()
        .try_init();
}

fn registry() -> EventRegistry {
    let mut registry = EventRegistry::new();
    registry.register_raw(EVENT_TYPE).unwrap();
    registry
}

fn event(body: &str) -> Arc<dyn Event> {
    Arc::new(RawEvent::new(EVENT_TYPE, body.as_bytes().to_vec()))
}

async fn start_server(config: LinkConfig) -> (Arc<Server>, Deliveries) {
    init_tracing();
    let (dispatcher, rx) = ChannelDispatcher::channel();
    let link = Link::new(config, registry(), Arc::new(dispatcher));
    let server = Arc::new(
        Server::bind(ServerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0))), link)
            .await
            .unwrap(),
    );
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.run().await;
    });
    (server, rx)
}

async fn connect(addr: SocketAddr, config: LinkConfig) -> (Client, Deliveries) {
    let (dispatcher, rx) = ChannelDispatcher::channel();
    let link = Link::new(config, registry(), Arc::new(dispatcher));
    (Client::connect(addr, link).await.unwrap(), rx)
}

async fn next(rx: &mut Deliveries) -> Delivery {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("dispatcher closed")
}

async fn connected(rx: &mut Deliveries) -> SessionHandle {
    match next(rx).await {
        Delivery::Connected {
            handle,
            success: true,
            ..
        } => handle,
        other => panic!("expected Connected, got {:?}", other),
    }
}

async fn next_body(rx: &mut Deliveries) -> (SessionHandle, String) {
    match next(rx).await {
        Delivery::Event(envelope) => {
            let raw = envelope.event.downcast_ref::<RawEvent>().unwrap();
            (
                envelope.handle,
                String::from_utf8(raw.body.to_vec()).unwrap(),
            )
        }
        other => panic!("expected Event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_events_arrive_in_order() {
    let (server, mut server_rx) = start_server(LinkConfig::new("server")).await;
    let (client, mut client_rx) = connect(server.local_addr(), LinkConfig::new("client")).await;
    let server_handle = connected(&mut server_rx).await;
    connected(&mut client_rx).await;

    for i in 0..200 {
        client.send(event(&format!("m{}", i))).unwrap();
    }
    for i in 0..200 {
        let (handle, body) = next_body(&mut server_rx).await;
        assert_eq!(handle, server_handle);
        assert_eq!(body, format!("m{}", i));
    }

    assert!(server.send(server_handle, event("back")));
    assert_eq!(next_body(&mut client_rx).await.1, "back");
    assert_eq!(client.session().stats().events_sent, 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_senders_keep_per_caller_order() {
    const CALLERS: usize = 4;
    const PER_CALLER: usize = 100;

    let (server, mut server_rx) = start_server(LinkConfig::new("server")).await;
    let (client, mut client_rx) = connect(server.local_addr(), LinkConfig::new("client")).await;
    connected(&mut server_rx).await;
    connected(&mut client_rx).await;

    let session = client.session();
    let senders: Vec<_> = (0..CALLERS)
        .map(|caller| {
            let session = session.clone();
            tokio::spawn(async move {
                for i in 0..PER_CALLER {
                    assert!(session.send(event(&format!("{}:{}", caller, i))));
                    if i % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        })
        .collect();
    for sender in senders {
        sender.await.unwrap();
    }

    let mut next_seq = [0usize; CALLERS];
    for _ in 0..CALLERS * PER_CALLER {
        let (_, body) = next_body(&mut server_rx).await;
        let (caller, seq) = body.split_once(':').unwrap();
        let caller: usize = caller.parse().unwrap();
        let seq: usize = seq.parse().unwrap();
        assert_eq!(seq, next_seq[caller], "caller {} out of order", caller);
        next_seq[caller] += 1;
    }
    assert_eq!(next_seq, [PER_CALLER; CALLERS]);

    // Nothing duplicated after the expected total.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server_rx.try_recv().is_err());
    assert_eq!(
        session.stats().events_sent,
        (CALLERS * PER_CALLER) as u64
    );
}

#[tokio::test]
async fn test_chacha_handshake_protects_both_directions() {
    let config = || LinkConfig::new("sealed").with_transform(ChaChaTransform::new());
    let (server, mut server_rx) = start_server(config()).await;
    let (client, mut client_rx) = connect(server.local_addr(), config()).await;
    let server_handle = connected(&mut server_rx).await;
    connected(&mut client_rx).await;

    let session = client.session();
    assert!(session.tx_ready());
    assert!(session.rx_ready());

    client.send(event("secret")).unwrap();
    assert_eq!(next_body(&mut server_rx).await.1, "secret");
    server.send(server_handle, event("reply"));
    assert_eq!(next_body(&mut client_rx).await.1, "reply");

    let server_session = server.link().session(server_handle).unwrap();
    assert!(server_session.tx_ready());
    assert!(server_session.rx_ready());
}

#[tokio::test]
async fn test_handshake_failure_closes_by_default() {
    let sealed = LinkConfig::new("sealed").with_transform(ChaChaTransform::new());
    let (server, mut server_rx) = start_server(sealed).await;
    let (_client, mut client_rx) = connect(server.local_addr(), LinkConfig::new("plain")).await;

    // The plain side needs no handshake and is announced at once.
    connected(&mut client_rx).await;
    assert!(matches!(
        next(&mut server_rx).await,
        Delivery::Connected { success: false, .. }
    ));
    assert!(matches!(
        next(&mut client_rx).await,
        Delivery::Disconnected { .. }
    ));
}

#[tokio::test]
async fn test_handshake_failure_plaintext_policy() {
    let sealed = LinkConfig::new("sealed")
        .with_transform(ChaChaTransform::new())
        .with_handshake_failure(HandshakeFailurePolicy::Plaintext);
    let (server, mut server_rx) = start_server(sealed).await;
    let (client, mut client_rx) = connect(server.local_addr(), LinkConfig::new("plain")).await;
    connected(&mut client_rx).await;
    let server_handle = connected(&mut server_rx).await;

    let server_session = server.link().session(server_handle).unwrap();
    assert!(!server_session.tx_ready());
    assert!(!server_session.rx_ready());

    client.send(event("in the clear")).unwrap();
    assert_eq!(next_body(&mut server_rx).await.1, "in the clear");
}

#[tokio::test]
async fn test_unknown_and_oversized_messages_are_skipped() {
    let (server, mut server_rx) =
        start_server(LinkConfig::new("server").with_max_payload_size(64)).await;
    let mut raw = TcpStream::connect(server.local_addr()).await.unwrap();
    let handle = connected(&mut server_rx).await;

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&Frame::new(50, "who knows".into()).encode().unwrap());
    bytes.extend_from_slice(&Frame::new(EVENT_TYPE, vec![0u8; 200].into()).encode().unwrap());
    bytes.extend_from_slice(&Frame::new(EVENT_TYPE, "kept".into()).encode().unwrap());
    raw.write_all(&bytes).await.unwrap();

    assert_eq!(next_body(&mut server_rx).await, (handle, "kept".to_string()));
    let stats = server.link().session(handle).unwrap().stats();
    assert_eq!(stats.messages_skipped, 2);
    assert_eq!(stats.events_received, 1);
}

#[tokio::test]
async fn test_setup_timeout_reports_failed_connect() {
    let config = LinkConfig::new("server")
        .with_recovery(Duration::from_secs(5))
        .with_setup_timeout(Duration::from_millis(100));
    let (server, mut server_rx) = start_server(config).await;

    // Never sends SessionReq.
    let _raw = TcpStream::connect(server.local_addr()).await.unwrap();
    assert!(matches!(
        next(&mut server_rx).await,
        Delivery::Connected { success: false, .. }
    ));
}

#[tokio::test]
async fn test_close_is_final_with_recovery_enabled() {
    let config = || LinkConfig::new("recoverable").with_recovery(Duration::from_secs(5));
    let (server, mut server_rx) = start_server(config()).await;
    let (client, mut client_rx) = connect(server.local_addr(), config()).await;
    let server_handle = connected(&mut server_rx).await;
    connected(&mut client_rx).await;

    client.send(event("last words")).unwrap();
    assert!(client.close());
    assert!(!client.close());
    assert!(matches!(
        client.send(event("after close")),
        Err(LinkError::NotConnected)
    ));

    assert_eq!(next_body(&mut server_rx).await.1, "last words");
    match next(&mut server_rx).await {
        Delivery::Disconnected { handle, .. } => assert_eq!(handle, server_handle),
        other => panic!("expected Disconnected, got {:?}", other),
    }
    assert!(matches!(
        next(&mut client_rx).await,
        Delivery::Disconnected { .. }
    ));
    assert!(server.link().recovery().is_empty());
    assert!(client.link().recovery().is_empty());
}

#[tokio::test]
async fn test_recovery_keeps_handle_and_queue() {
    let config = || LinkConfig::new("recoverable").with_recovery(Duration::from_secs(5));
    let (server, mut server_rx) = start_server(config()).await;
    let (client, mut client_rx) = connect(
        server.local_addr(),
        config().with_reconnect_interval(Duration::from_millis(20)),
    )
    .await;
    let server_handle = connected(&mut server_rx).await;
    let client_handle = connected(&mut client_rx).await;
    let token = client.session().token().unwrap();

    let old = client.session();
    old.abort();
    let detached = old.wait_detached().await;
    assert!(matches!(
        detached,
        SessionState::Recovering | SessionState::Transferred
    ));

    // Queued while the connection is down.
    for i in 0..5 {
        assert!(old.send(event(&format!("q{}", i))));
    }

    match next(&mut client_rx).await {
        Delivery::Recovered { handle, .. } => assert_eq!(handle, client_handle),
        other => panic!("expected Recovered, got {:?}", other),
    }
    match next(&mut server_rx).await {
        Delivery::Recovered { handle, .. } => assert_eq!(handle, server_handle),
        other => panic!("expected Recovered, got {:?}", other),
    }

    for i in 0..5 {
        let (handle, body) = next_body(&mut server_rx).await;
        assert_eq!(handle, server_handle);
        assert_eq!(body, format!("q{}", i));
    }

    assert_eq!(client.handle(), client_handle);
    assert_eq!(client.session().token().as_deref(), Some(token.as_str()));
    assert_eq!(old.state(), SessionState::Transferred);
    assert_eq!(server.session_count(), 1);

    // The recovered session keeps working in both directions.
    assert!(server.send(server_handle, event("welcome back")));
    assert_eq!(next_body(&mut client_rx).await.1, "welcome back");
}

#[tokio::test]
async fn test_recovery_window_expires() {
    let (server, mut server_rx) =
        start_server(LinkConfig::new("server").with_recovery(Duration::from_millis(200))).await;
    let (client, mut client_rx) = connect(
        server.local_addr(),
        LinkConfig::new("client").with_recovery(Duration::from_millis(200)),
    )
    .await;
    let server_handle = connected(&mut server_rx).await;
    let client_handle = connected(&mut client_rx).await;

    // Without its supervisor the client never reconnects.
    let session = client.session();
    drop(client);
    session.abort();

    match next(&mut server_rx).await {
        Delivery::Disconnected { handle, .. } => assert_eq!(handle, server_handle),
        other => panic!("expected Disconnected, got {:?}", other),
    }
    match next(&mut client_rx).await {
        Delivery::Disconnected { handle, .. } => assert_eq!(handle, client_handle),
        other => panic!("expected Disconnected, got {:?}", other),
    }
    assert_eq!(server.session_count(), 0);
    assert!(!server.send(server_handle, event("too late")));
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_connect_refused() {
    init_tracing();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (dispatcher, _rx) = ChannelDispatcher::channel();
    let link = Link::new(LinkConfig::new("client"), registry(), Arc::new(dispatcher));
    let err = Client::connect(addr, link).await.unwrap_err();
    assert!(matches!(err, LinkError::Io(_) | LinkError::ConnectTimeout(_)));
    assert!(err.is_retryable());
}
