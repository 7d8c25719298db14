//! End-to-end scenarios over loopback sockets: handshake, the
//! post-handshake burst, and self-connection rejection.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use minode_p2p::config::Config;
use minode_p2p::connection::Status;
use minode_p2p::listener::Listener;
use minode_p2p::state::State;
use minode_p2p::{dialer, unix_now};
use minode_types::{Object, PROTOCOL_VERSION};

fn test_config() -> Config {
    Config {
        listen_host: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        listen_port: 0,
        // The manager is not running in these tests; nothing dials on
        // its own.
        send_outgoing_connections: false,
        ..Config::default()
    }
}

async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..150 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handshake_reaches_fully_established_on_both_sides() {
    let server = State::new(test_config());
    let client = State::new(test_config());

    // One unexpired object on the server; the burst advertises it and
    // the client fetches it. It carries no proof of work, so the client
    // drops it without penalizing the connection.
    let object = Object::new([0; 8], unix_now() + 300, 42, 1, 1, b"gossip".to_vec());
    server.objects.insert(object.clone());

    let listener = Listener::bind(server.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
    let addr = listener.local_addr();
    tokio::spawn(listener.run());

    dialer::spawn(&client, addr.ip(), addr.port());

    wait_for("client to establish", || {
        client
            .connections
            .snapshot()
            .iter()
            .any(|conn| conn.is_fully_established())
    })
    .await;
    wait_for("server to establish", || {
        server
            .connections
            .snapshot()
            .iter()
            .any(|conn| conn.is_fully_established())
    })
    .await;

    let handle = client.connections.snapshot().into_iter().next().unwrap();
    let version = handle.remote_version().expect("version was exchanged");
    assert_eq!(version.protocol_version, PROTOCOL_VERSION);
    assert_ne!(version.nonce, client.nonce);

    // The outbound handshake promotes the server into the known pool.
    assert_eq!(client.pools.known_ip_len(), 1);

    // Give the inv/getdata/object exchange time to happen, then check
    // the unsealed object was dropped and the link survived (peers may
    // be buggy, not hostile).
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!client.objects.has(&object.vector()));
    assert!(client
        .connections
        .snapshot()
        .iter()
        .any(|conn| conn.is_fully_established()));

    server.shutdown.cancel();
    client.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn self_connection_is_torn_down_before_verack() {
    let state = State::new(test_config());

    let listener = Listener::bind(state.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
    let addr = listener.local_addr();
    tokio::spawn(listener.run());

    dialer::spawn(&state, addr.ip(), addr.port());

    // The accepting side sees its own nonce in the version message and
    // disconnects; the dialing side follows when the socket closes.
    wait_for("both ends to disconnect", || {
        let connections = state.connections.snapshot();
        connections.len() >= 2
            && connections
                .iter()
                .all(|conn| conn.status() == Status::Disconnected)
    })
    .await;
    assert!(state
        .connections
        .snapshot()
        .iter()
        .all(|conn| !conn.is_fully_established()));

    state.shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_limit_closes_excess_inbound_sockets() {
    let mut config = test_config();
    config.connection_limit = 0;
    let server = State::new(config);
    let client = State::new(test_config());

    let listener = Listener::bind(server.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
    let addr = listener.local_addr();
    tokio::spawn(listener.run());

    // The first connection occupies the set; the second is refused.
    dialer::spawn(&client, addr.ip(), addr.port());
    wait_for("first connection to register", || {
        !server.connections.is_empty()
    })
    .await;
    dialer::spawn(&client, addr.ip(), addr.port());

    wait_for("second connection to be refused", || {
        client
            .connections
            .snapshot()
            .iter()
            .any(|conn| conn.status() == Status::Disconnected)
    })
    .await;
    assert!(server.connections.len() <= 2);

    server.shutdown.cancel();
    client.shutdown.cancel();
}
