//! Typed DHT message records exchanged through the transport seam.
//!
//! Wire encoding is delegated to the embedder's [crate::Transport]; the
//! core only builds and consumes these records.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::common::{Id, Value};

/// Error code answered when a write token does not verify.
pub const ERROR_WRONG_TOKEN: u16 = 401;
/// Error code answered when accepting a value would exceed the budget.
pub const ERROR_STORAGE_FULL: u16 = 503;
/// Error code answered by bootstrap-only nodes for store/listen requests.
pub const ERROR_NOT_STORING: u16 = 403;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// A peer record as carried in the `nodes` fields of responses.
pub struct NodeRecord {
    pub id: Id,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Which families of closer nodes the requester wants back.
pub struct Want {
    pub v4: bool,
    pub v6: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Echoed between a request and its response.
    pub transaction_id: u16,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    Request(RequestBody),
    Response(ResponseBody),
    Error(ErrorBody),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    pub sender_id: Id,
    pub kind: RequestKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestKind {
    Ping,
    FindNode {
        target: Id,
        want: Want,
    },
    GetValues {
        key: Id,
        want: Want,
    },
    Listen {
        key: Id,
        token: Box<[u8]>,
        /// Request id the listener expects echoed on value pushes.
        rid: u16,
    },
    AnnounceValues {
        key: Id,
        token: Box<[u8]>,
        values: Vec<Value>,
        /// Seconds elapsed since the values were created.
        age_secs: u64,
    },
}

impl RequestKind {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::Ping => "ping",
            RequestKind::FindNode { .. } => "find_node",
            RequestKind::GetValues { .. } => "get_values",
            RequestKind::Listen { .. } => "listen",
            RequestKind::AnnounceValues { .. } => "announce_values",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub sender_id: Id,
    /// The requester's address as observed by the responder, used for
    /// public address inference.
    pub requester_addr: Option<SocketAddr>,
    pub answer: RequestAnswer,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
/// Everything a response can carry back.
pub struct RequestAnswer {
    /// Write token gating announce requests from our address.
    pub token: Option<Box<[u8]>>,
    pub nodes4: Vec<NodeRecord>,
    pub nodes6: Vec<NodeRecord>,
    pub values: Vec<Value>,
    /// Echo of the listen request id, set on listen acks and value pushes.
    pub ack_rid: Option<u16>,
}

impl RequestAnswer {
    pub fn with_nodes(mut self, nodes4: Vec<NodeRecord>, nodes6: Vec<NodeRecord>) -> Self {
        self.nodes4 = nodes4;
        self.nodes6 = nodes6;
        self
    }

    pub fn with_token(mut self, token: Box<[u8]>) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_values(mut self, values: Vec<Value>) -> Self {
        self.values = values;
        self
    }

    pub fn with_ack_rid(mut self, rid: u16) -> Self {
        self.ack_rid = Some(rid);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub description: String,
}
