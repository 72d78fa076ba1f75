//! In-memory transport and peer helpers shared by integration tests.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use cairn::common::messages::{
    Message, MessageBody, RequestAnswer, RequestKind, ResponseBody,
};
use cairn::{Error, Id, Transport};

pub type Outbox = Rc<RefCell<Vec<(Message, SocketAddr)>>>;

/// Codec for tests: bincode over [Message], with outbound capture.
pub struct TestTransport {
    sent: Outbox,
}

impl TestTransport {
    pub fn new() -> (Box<TestTransport>, Outbox) {
        let sent: Outbox = Rc::new(RefCell::new(vec![]));
        (Box::new(TestTransport { sent: sent.clone() }), sent)
    }
}

impl Transport for TestTransport {
    fn parse(&mut self, buf: &[u8], _from: SocketAddr) -> cairn::Result<Message> {
        bincode::deserialize(buf).map_err(|e| Error::MalformedMessage(e.to_string()))
    }

    fn send(&mut self, message: &Message, to: SocketAddr) {
        self.sent.borrow_mut().push((message.clone(), to));
    }
}

pub fn encode(message: &Message) -> Vec<u8> {
    bincode::serialize(message).expect("messages serialize")
}

/// Drain everything the node sent since the last call.
pub fn take_sent(outbox: &Outbox) -> Vec<(Message, SocketAddr)> {
    std::mem::take(&mut *outbox.borrow_mut())
}

/// A scripted remote peer.
#[derive(Clone, Copy)]
pub struct Peer {
    pub id: Id,
    pub addr: SocketAddr,
}

impl Peer {
    pub fn new(id: Id, addr: SocketAddr) -> Peer {
        Peer { id, addr }
    }

    /// A response echoing `request`'s transaction id.
    pub fn response(&self, request: &Message, answer: RequestAnswer) -> Message {
        Message {
            transaction_id: request.transaction_id,
            body: MessageBody::Response(ResponseBody {
                sender_id: self.id,
                requester_addr: None,
                answer,
            }),
        }
    }

    /// A response that also reports the requester's public address.
    pub fn response_with_requester_addr(
        &self,
        request: &Message,
        answer: RequestAnswer,
        requester_addr: SocketAddr,
    ) -> Message {
        Message {
            transaction_id: request.transaction_id,
            body: MessageBody::Response(ResponseBody {
                sender_id: self.id,
                requester_addr: Some(requester_addr),
                answer,
            }),
        }
    }

    /// A request originated by this peer.
    pub fn request(&self, transaction_id: u16, kind: RequestKind) -> Message {
        Message {
            transaction_id,
            body: MessageBody::Request(cairn::common::messages::RequestBody {
                sender_id: self.id,
                kind,
            }),
        }
    }
}

/// First captured message matching the predicate.
pub fn find_sent(
    sent: &[(Message, SocketAddr)],
    pred: impl Fn(&Message, &SocketAddr) -> bool,
) -> Option<(Message, SocketAddr)> {
    sent.iter().find(|(m, a)| pred(m, a)).cloned()
}

/// Kind of an outbound request, if it is one.
pub fn request_kind(message: &Message) -> Option<&RequestKind> {
    match &message.body {
        MessageBody::Request(body) => Some(&body.kind),
        _ => None,
    }
}

/// An id with the given first byte, zero elsewhere except a distinct tail.
pub fn id_with_first_byte(byte: u8, tail: u8) -> Id {
    let mut bytes = [0_u8; 20];
    bytes[0] = byte;
    bytes[19] = tail;
    Id(bytes)
}
