//! Lookups across a local testnet over loopback UDP.

use std::collections::HashSet;

use krpc_dht::{rpc::Config, Bytes, Dht, DhtPingError, Id, Testnet};

fn logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[test]
fn bootstrapped_nodes_know_each_other() {
    let testnet = Testnet::new(6).unwrap();

    for node in &testnet.nodes[1..] {
        let info = node.info().unwrap();

        assert!(info.bootstrapped());
        assert!(info.routing_table_size() > 0);
    }

    let bootstrap = testnet.nodes[0].to_bootstrap().unwrap();
    assert!(!bootstrap.is_empty());
}

#[test]
fn find_node_returns_closest_with_tokens() {
    let testnet = Testnet::new(8).unwrap();

    let target = Id::random();
    let nodes = testnet.nodes[4].find_node(target).unwrap();

    assert!(!nodes.is_empty());
    assert!(nodes.iter().all(|node| node.token.is_some()));

    let distances: Vec<_> = nodes.iter().map(|node| node.id.xor(&target)).collect();
    let mut sorted = distances.clone();
    sorted.sort();
    assert_eq!(distances, sorted);
}

#[test]
fn store_then_get() {
    logging();

    let testnet = Testnet::new(8).unwrap();

    let key = Id::from_hash(b"key");

    let acked = testnet.nodes[2]
        .store_value(key, Bytes::from_static(b"one"))
        .unwrap();
    assert!(!acked.is_empty());

    testnet.nodes[5]
        .store_value(key, Bytes::from_static(b"two"))
        .unwrap();

    let holders = testnet.nodes[7].find_value(key).unwrap();
    assert!(!holders.is_empty());
    assert!(holders.iter().all(|node| node.num_values > 0));

    let values: Vec<Bytes> = testnet.nodes[7].get_value(key, 0).unwrap().collect();
    let unique: HashSet<&Bytes> = values.iter().collect();

    assert_eq!(values.len(), unique.len());
    assert_eq!(
        unique,
        HashSet::from([&Bytes::from_static(b"one"), &Bytes::from_static(b"two")])
    );
}

#[test]
fn get_missing_value() {
    let testnet = Testnet::new(4).unwrap();

    assert_eq!(
        testnet.nodes[3].get_value(Id::random(), 0).unwrap().count(),
        0
    );
}

#[test]
fn ping() {
    let testnet = Testnet::new(2).unwrap();

    let address = testnet.nodes[1].info().unwrap().local_addr();
    let address = format!("127.0.0.1:{}", address.port()).parse().unwrap();

    let node = testnet.nodes[0].ping(address).unwrap();

    assert_eq!(&node.id, testnet.nodes[1].info().unwrap().id());
}

#[test]
fn ping_after_shutdown() {
    let dht = Dht::new(Config {
        port: Some(0),
        ..Default::default()
    })
    .unwrap();

    dht.shutdown();

    assert!(matches!(
        dht.ping("127.0.0.1:1".parse().unwrap()),
        Err(DhtPingError::DhtWasShutdown(_))
    ));
}
