//! # Cairn
//!
//! A Kademlia-style distributed hash table node storing small values at
//! 160-bit keys over UDP.
//!
//! The core is single-threaded and cooperative: the embedder owns the
//! sockets and the clock, feeds inbound datagrams and ticks through
//! [Dht::periodic], and sleeps until the returned deadline. Outbound
//! packets leave synchronously through an injected [Transport]; wire
//! encoding is the embedder's choice.

pub mod common;
pub mod dht;
mod engine;
mod error;
pub mod routing;
pub mod scheduler;
pub mod search;
pub mod storage;
pub mod tokens;
pub mod transport;

pub use crate::common::{
    accept_all, get_callback, DoneCallback, Family, GetCallback, Id, ShutdownCallback, Value,
    ValueFilter, ValueType,
};
pub use crate::dht::{AddressFilter, Config, Dht, NodeExport, Status, DEFAULT_STORAGE_LIMIT};
pub use crate::error::Error;
pub use crate::routing::NodeStats;
pub use crate::transport::Transport;

// Alias Result to be the crate Result.
pub type Result<T, E = error::Error> = core::result::Result<T, E>;
