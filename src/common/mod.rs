//! Miscellaneous common structs used throughout the library.

mod id;
pub mod messages;
mod node;
mod routing_table;

pub use id::*;
pub use messages::{ErrorSpecific, Message, MessageType, Request, RequestSpecific};
pub use node::*;
pub use routing_table::*;
