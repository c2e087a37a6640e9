#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;

#[cfg(feature = "async")]
pub mod async_dht;
mod dht;
mod error;
pub mod rpc;

pub use crate::common::{
    messages, ErrorSpecific, Id, Message, MessageType, Node, Request, RequestSpecific, Routing,
    RoutingTable, ID_SIZE, MAX_BUCKET_SIZE_K,
};
pub use bytes::Bytes;
pub use dht::{Dht, DhtPingError, DhtWasShutdown, Testnet};
pub use error::{Error, Result};
