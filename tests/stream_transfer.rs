//! Bulk reliable-stream transfer through the mesh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use trellis::{NetError, Node, NodeId, NodeSettings, TcpDialerBackend, TcpListenerBackend};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(28000);

fn next_addr() -> String {
    format!("127.0.0.1:{}", PORT_COUNTER.fetch_add(1, Ordering::SeqCst))
}

fn id(s: &str) -> NodeId {
    NodeId::parse(s).unwrap()
}

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

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

const TRANSFER_SIZE: usize = 1024 * 1024;

#[tokio::test]
async fn one_mebibyte_arrives_intact_and_in_order() {
    let (a, b) = connected_pair("bulk-a", "bulk-b").await;

    let listener = a.listen_stream("sink", []).await.unwrap();
    let server = tokio::spawn(async move {
        let stream = listener.accept().await.expect("one inbound stream");
        let mut received: Vec<u8> = Vec::with_capacity(TRANSFER_SIZE);
        loop {
            match stream.recv(Duration::from_secs(30)).await {
                Ok(bytes) => received.extend_from_slice(&bytes),
                Err(NetError::Closed) => break,
                Err(e) => panic!("stream failed mid-transfer: {e}"),
            }
        }
        // Sender finished; confirm over the still-open reverse
        // direction before closing our side.
        stream
            .send(format!("received {}", received.len()).as_bytes())
            .await
            .expect("confirmation");
        stream.close().await;
        received
    });

    let stream = b.dial(&id("bulk-a"), "sink").await.expect("dial sink");
    let payload = pattern(TRANSFER_SIZE);
    // Write in uneven slabs so fragmentation and the flow-control
    // window both get exercised.
    for slab in payload.chunks(200_000) {
        stream.send(slab).await.expect("send slab");
    }
    stream.close().await;

    let confirmation = stream
        .recv(Duration::from_secs(30))
        .await
        .expect("confirmation after close");
    assert_eq!(confirmation, format!("received {TRANSFER_SIZE}").as_bytes());

    let received = tokio::time::timeout(Duration::from_secs(30), server)
        .await
        .expect("server finishes")
        .unwrap();
    assert_eq!(received.len(), TRANSFER_SIZE);
    assert_eq!(received, payload, "bytes must arrive intact and in order");

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn dialing_a_missing_stream_service_times_out() {
    let (a, b) = connected_pair("miss-a", "miss-b").await;
    let err = b
        .dial_timeout(&id("miss-a"), "not-listening", Duration::from_millis(800))
        .await
        .expect_err("nothing is listening");
    assert!(
        matches!(err, NetError::Timeout | NetError::NoSuchService { .. }),
        "got {err:?}"
    );
    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn concurrent_streams_do_not_interleave() {
    let (a, b) = connected_pair("multi-a", "multi-b").await;

    let listener = a.listen_stream("labelled", []).await.unwrap();
    tokio::spawn(async move {
        while let Ok(stream) = listener.accept().await {
            tokio::spawn(async move {
                // Echo everything back on the same stream.
                while let Ok(bytes) = stream.recv(Duration::from_secs(30)).await {
                    if stream.send(&bytes).await.is_err() {
                        break;
                    }
                }
                stream.close().await;
            });
        }
    });

    let mut tasks = Vec::new();
    for label in 0u8..4 {
        let b = b.clone();
        tasks.push(tokio::spawn(async move {
            let stream = b
                .dial(&id("multi-a"), "labelled")
                .await
                .expect("concurrent dial");
            let message = vec![label; 10_000];
            stream.send(&message).await.unwrap();
            let mut echoed = Vec::new();
            while echoed.len() < message.len() {
                echoed.extend(stream.recv(Duration::from_secs(10)).await.unwrap());
            }
            assert_eq!(echoed, message, "stream {label} got someone else's bytes");
            stream.close().await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    a.shutdown();
    b.shutdown();
}
