//! Service addressing end to end: datagrams, streams, ping, failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use trellis::{NetError, Node, NodeId, NodeSettings, TcpDialerBackend, TcpListenerBackend};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(27000);

fn next_addr() -> String {
    format!("127.0.0.1:{}", PORT_COUNTER.fetch_add(1, Ordering::SeqCst))
}

fn id(s: &str) -> NodeId {
    NodeId::parse(s).unwrap()
}

/// Two connected nodes, a listening and b dialing.
async fn connected_pair(a_name: &str, b_name: &str) -> (Node, Node) {
    let a = Node::new(NodeSettings::new(id(a_name)).keepalive(Duration::from_millis(200)));
    let b = Node::new(NodeSettings::new(id(b_name)).keepalive(Duration::from_millis(200)));
    let addr = next_addr();
    a.attach_backend(
        Box::new(TcpListenerBackend::new(addr.clone())),
        1.0,
        HashMap::new(),
    )
    .await
    .unwrap();
    b.attach_backend(
        Box::new(TcpDialerBackend::new(addr, true)),
        1.0,
        HashMap::new(),
    )
    .await
    .unwrap();

    let mut rx = b.routing_watch();
    let a_id = a.node_id().clone();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if rx.borrow_and_update().route_to(&a_id).is_some() {
                return;
            }
            rx.changed().await.expect("routing watch");
        }
    })
    .await
    .expect("pair must converge");
    (a, b)
}

#[tokio::test]
async fn datagram_echo_service_round_trips() {
    let (a, b) = connected_pair("echo-a", "echo-b").await;

    // Echo service on a: returns every payload to its sender.
    let server = a
        .listen_and_advertise("echo", [("type".to_string(), "echo".to_string())])
        .await
        .unwrap();
    tokio::spawn(async move {
        while let Ok(datagram) = server.recv(Duration::from_secs(30)).await {
            let _ = server
                .send_to(&datagram.from_node, &datagram.from_service, datagram.payload)
                .await;
        }
    });

    let client = b.listen_packet("client").unwrap();
    client
        .send_to(&id("echo-a"), "echo", b"ping".to_vec())
        .await
        .unwrap();
    let reply = client
        .recv(Duration::from_secs(1))
        .await
        .expect("echo reply within a second");
    assert_eq!(reply.payload, b"ping");
    assert_eq!(reply.from_node, id("echo-a"));

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn stream_echo_round_trips() {
    let (a, b) = connected_pair("secho-a", "secho-b").await;

    let listener = a.listen_stream("mirror", []).await.unwrap();
    tokio::spawn(async move {
        while let Ok(stream) = listener.accept().await {
            tokio::spawn(async move {
                while let Ok(bytes) = stream.recv(Duration::from_secs(30)).await {
                    if stream.send(&bytes).await.is_err() {
                        break;
                    }
                }
                stream.close().await;
            });
        }
    });

    let stream = b.dial(&id("secho-a"), "mirror").await.expect("dial mirror");
    stream.send(b"through the mesh").await.unwrap();
    let reply = stream.recv(Duration::from_secs(5)).await.unwrap();
    assert_eq!(reply, b"through the mesh");

    stream.close().await;
    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn unbound_service_reports_no_such_service() {
    let (a, b) = connected_pair("ghost-a", "ghost-b").await;

    let client = b.listen_packet("client").unwrap();
    client
        .send_to(&id("ghost-a"), "nope", b"hello?".to_vec())
        .await
        .unwrap();
    let err = client
        .recv(Duration::from_secs(5))
        .await
        .expect_err("the notice must surface as an error");
    match err {
        NetError::NoSuchService { node, service } => {
            assert_eq!(node, id("ghost-a"));
            assert_eq!(service, "nope");
        }
        other => panic!("expected NoSuchService, got {other:?}"),
    }

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn unknown_destination_fails_fast() {
    let (a, b) = connected_pair("fast-a", "fast-b").await;
    let client = b.listen_packet("client").unwrap();
    let err = client
        .send_to(&id("nowhere"), "svc", b"x".to_vec())
        .await
        .expect_err("no route, no send");
    assert!(matches!(err, NetError::Unreachable(_)));
    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn ping_over_the_mesh() {
    let (a, b) = connected_pair("ping-a", "ping-b").await;
    let rtt = b
        .ping(&id("ping-a"), Duration::from_secs(5))
        .await
        .expect("ping succeeds");
    assert!(rtt < Duration::from_secs(5));
    // Pinging an unknown node times out or reports unreachable.
    let err = b
        .ping(&id("absent"), Duration::from_millis(500))
        .await
        .expect_err("absent node cannot answer");
    assert!(matches!(
        err,
        NetError::Timeout | NetError::Unreachable(_)
    ));
    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn service_adverts_reach_the_directory() {
    let (a, b) = connected_pair("dir-a", "dir-b").await;
    let _conn = a
        .listen_and_advertise("catalog", [("type".to_string(), "demo".to_string())])
        .await
        .unwrap();

    let mut rx = b.routing_watch();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if rx
                .borrow_and_update()
                .providers_of("catalog")
                .contains(&id("dir-a"))
            {
                return;
            }
            rx.changed().await.expect("routing watch");
        }
    })
    .await
    .expect("advert must flood to the peer");

    a.shutdown();
    b.shutdown();
}
