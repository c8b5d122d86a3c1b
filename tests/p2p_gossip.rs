use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use minichain::p2p::{Envelope, MessageType, PeerTransport, TransportConfig};

fn local_config() -> TransportConfig {
    TransportConfig { listen_addr: "127.0.0.1:0".to_string(), ..Default::default() }
}

async fn wait_for_peers(transport: &PeerTransport, want: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while transport.peer_count() < want {
        if tokio::time::Instant::now() > deadline {
            panic!("peers failed to connect (have {}, want {want})", transport.peer_count());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn broadcast_reaches_a_seeded_peer() {
    let a = PeerTransport::new(local_config());
    a.start().await.expect("start transport a");
    let a_addr = a.local_addr().unwrap().to_string();

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(1);
    let b = PeerTransport::new(TransportConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        seeds: vec![a_addr],
        ..Default::default()
    });
    b.register_handler(MessageType::Tx, move |_peer, payload| {
        let _ = tx.try_send(payload);
    });
    b.start().await.expect("start transport b");

    wait_for_peers(&a, 1).await;
    wait_for_peers(&b, 1).await;

    a.broadcast(&Envelope::new(MessageType::Tx, b"hello".to_vec(), None));

    let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for broadcast")
        .expect("channel closed");
    assert_eq!(got, b"hello");

    a.close();
    b.close();
}

#[tokio::test]
async fn broadcast_except_skips_the_named_peer() {
    let a = PeerTransport::new(local_config());
    a.start().await.unwrap();
    let a_addr = a.local_addr().unwrap().to_string();

    let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let sink = received.clone();
    let b = PeerTransport::new(TransportConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        seeds: vec![a_addr],
        ..Default::default()
    });
    b.register_handler(MessageType::Tx, move |_peer, payload| {
        sink.lock().unwrap().push(payload);
    });
    b.start().await.unwrap();

    wait_for_peers(&a, 1).await;
    wait_for_peers(&b, 1).await;

    let b_id = a.peer_ids().pop().expect("a knows one peer");
    a.broadcast_except(&b_id, &Envelope::new(MessageType::Tx, b"skipped".to_vec(), None));
    a.broadcast(&Envelope::new(MessageType::Tx, b"delivered".to_vec(), None));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if !received.lock().unwrap().is_empty() {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("broadcast never arrived");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let seen = received.lock().unwrap().clone();
    assert_eq!(seen, vec![b"delivered".to_vec()]);

    a.close();
    b.close();
}

#[tokio::test]
async fn handlers_only_fire_for_their_message_type() {
    let a = PeerTransport::new(local_config());
    a.start().await.unwrap();
    let a_addr = a.local_addr().unwrap().to_string();

    let (tx, mut rx) = mpsc::channel::<(MessageType, Vec<u8>)>(4);
    let b = PeerTransport::new(TransportConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        seeds: vec![a_addr],
        ..Default::default()
    });
    b.register_handler(MessageType::Ping, move |_peer, payload| {
        let _ = tx.try_send((MessageType::Ping, payload));
    });
    b.start().await.unwrap();

    wait_for_peers(&a, 1).await;
    wait_for_peers(&b, 1).await;

    // no handler registered for Block on b: silently dropped
    a.broadcast(&Envelope::new(MessageType::Block, b"ignored".to_vec(), None));
    a.broadcast(&Envelope::new(MessageType::Ping, b"ping".to_vec(), None));

    let (msg_type, payload) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    assert_eq!(msg_type, MessageType::Ping);
    assert_eq!(payload, b"ping");
    assert!(rx.try_recv().is_err());

    a.close();
    b.close();
}

#[tokio::test]
async fn peer_cap_refuses_extra_connections() {
    let a = PeerTransport::new(TransportConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        max_peers: 1,
        ..Default::default()
    });
    a.start().await.unwrap();
    let a_addr = a.local_addr().unwrap().to_string();

    let b = PeerTransport::new(TransportConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        seeds: vec![a_addr.clone()],
        ..Default::default()
    });
    b.start().await.unwrap();
    wait_for_peers(&a, 1).await;

    let c = PeerTransport::new(TransportConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        seeds: vec![a_addr],
        ..Default::default()
    });
    c.start().await.unwrap();

    // give c time to dial; a must stay at its cap
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.peer_count(), 1);

    a.close();
    b.close();
    c.close();
}
