//! Struct and implementation of the Node entry in the Kademlia routing table
use std::{
    convert::TryInto,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use bytes::Bytes;

use crate::common::{Id, ID_SIZE};
use crate::{Error, Result};

/// Size of an IPv4 node in compact form: id, ip and port.
pub const COMPACT_NODE_SIZE: usize = ID_SIZE + 6;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A remote peer, as known to the routing table or to a running action.
pub struct Node {
    pub id: Id,
    pub address: SocketAddr,
    /// Write token handed out by this node, required to store values at it.
    pub token: Option<Bytes>,
    /// How many values this node claims to hold for the current lookup key.
    pub num_values: usize,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Node {
        Node {
            id,
            address,
            token: None,
            num_values: 0,
        }
    }

    /// Creates a node with a random id and a random local address, useful for testing.
    pub fn random() -> Node {
        Node::new(
            Id::random(),
            SocketAddr::from(([127, 0, 0, 1], rand::random::<u16>().max(1))),
        )
    }

    pub fn with_token(mut self, token: Bytes) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_num_values(mut self, num_values: usize) -> Self {
        self.num_values = num_values;
        self
    }

    /// Replace the token, an empty token clears it.
    pub fn update_token(&mut self, token: Bytes) {
        self.token = if token.is_empty() { None } else { Some(token) };
    }

    pub fn update_num_values(&mut self, num_values: usize) {
        self.num_values = num_values;
    }

    /// Returns true if both nodes have the same id and address.
    pub fn same_contact(&self, other: &Node) -> bool {
        self.id == other.id && self.address == other.address
    }
}

/// Encode IPv4 nodes as concatenated compact node info, IPv6 nodes are skipped.
pub fn nodes_to_bytes(nodes: &[Node]) -> Vec<u8> {
    let mut vec = Vec::with_capacity(COMPACT_NODE_SIZE * nodes.len());
    for node in nodes {
        if let SocketAddr::V4(v4) = node.address {
            vec.extend_from_slice(node.id.as_bytes());
            vec.extend_from_slice(&v4.ip().octets());
            vec.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    vec
}

/// Decode concatenated compact node info.
pub fn bytes_to_nodes<T: AsRef<[u8]>>(bytes: T) -> Result<Vec<Node>> {
    let bytes = bytes.as_ref();
    if bytes.len() % COMPACT_NODE_SIZE != 0 {
        return Err(Error::InvalidCompactInfo(
            "wrong number of bytes for nodes message",
        ));
    }

    bytes
        .chunks_exact(COMPACT_NODE_SIZE)
        .map(|chunk| {
            let id = Id::from_bytes(&chunk[..ID_SIZE])?;
            let address = bytes_to_sockaddr(&chunk[ID_SIZE..])?;
            Ok(Node::new(id, address))
        })
        .collect()
}

/// Decode a 6 bytes compact IPv4 address.
pub fn bytes_to_sockaddr<T: AsRef<[u8]>>(bytes: T) -> Result<SocketAddr> {
    let bytes = bytes.as_ref();
    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);

            let port_bytes_as_array: [u8; 2] = bytes[4..6]
                .try_into()
                .map_err(|_| Error::InvalidCompactInfo("wrong number of bytes for port"))?;

            Ok(SocketAddr::new(
                IpAddr::V4(ip),
                u16::from_be_bytes(port_bytes_as_array),
            ))
        }

        18 => Err(Error::InvalidCompactInfo("IPv6 is not supported")),

        _ => Err(Error::InvalidCompactInfo(
            "wrong number of bytes for sockaddr",
        )),
    }
}

/// (De)serialize a list of nodes as a single compact bencode string.
pub(crate) mod compact_nodes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::{bytes_to_nodes, nodes_to_bytes, Node};

    pub fn serialize<S: Serializer>(nodes: &[Node], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&nodes_to_bytes(nodes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Node>, D::Error> {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;

        bytes_to_nodes(bytes).map_err(de::Error::custom)
    }
}
