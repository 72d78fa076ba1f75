//! Transaction-id-keyed request tracking: retries, timeouts, dispatch.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::messages::{
    ErrorBody, Message, MessageBody, RequestAnswer, RequestBody, RequestKind, ResponseBody,
};
use crate::common::{Family, Id, Node, NodeCache, ValueId};
use crate::transport::Transport;

/// First-attempt timeout; doubles on every retry.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
/// Send attempts before a request expires and counts against the node.
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
/// Why a request was sent; routes its reply or expiry back to the right
/// subsystem without holding callbacks in the request map.
pub(crate) enum RequestContext {
    /// Plain liveness probe (facade `ping_node`, candidate promotion).
    Ping,
    /// Probe of a dubious bucket occupant; expiry promotes the bucket's
    /// cached candidate.
    CachedPing { family: Family },
    /// Bucket refresh `find_node`.
    Maintenance { family: Family },
    /// Search bootstrap `find_node`.
    SearchFind { target: Id, family: Family },
    /// Search `get_values`.
    SearchGet { target: Id, family: Family },
    /// Search `listen`.
    SearchListen { target: Id, family: Family },
    /// Search `announce_value` for one value.
    SearchAnnounce {
        target: Id,
        family: Family,
        value_id: ValueId,
    },
}

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub node: Node,
    pub kind: RequestKind,
    pub ctx: RequestContext,
    pub attempt: u32,
    pub last_try: Instant,
    pub deadline: Instant,
}

#[derive(Debug)]
/// Outcome of an outstanding request, handed to the facade to dispatch.
pub(crate) enum NetEvent {
    Reply {
        ctx: RequestContext,
        node: Node,
        answer: RequestAnswer,
        requester_addr: Option<SocketAddr>,
    },
    ReplyError {
        ctx: RequestContext,
        node: Node,
        code: u16,
        description: String,
    },
    /// All attempts went unanswered; the node's failure count was bumped.
    Expired { ctx: RequestContext, node: Node },
}

#[derive(Debug)]
/// Classified inbound message.
pub(crate) enum Incoming {
    Event(NetEvent),
    /// A request for the server side to answer.
    Request {
        node: Node,
        tid: u16,
        kind: RequestKind,
        from: SocketAddr,
    },
    /// A response matching no outstanding request: either a listener value
    /// push (correlated by the search tid) or junk to drop.
    Unmatched {
        tid: u16,
        from: SocketAddr,
        answer: Option<RequestAnswer>,
    },
}

/// Tracks outstanding requests by transaction id and owns the transport.
pub(crate) struct NetworkEngine {
    local_id: Id,
    next_tid: u16,
    transport: Box<dyn Transport>,
    pending: BTreeMap<u16, PendingRequest>,
}

impl NetworkEngine {
    pub fn new(local_id: Id, transport: Box<dyn Transport>) -> Self {
        NetworkEngine {
            local_id,
            next_tid: 0,
            transport,
            pending: BTreeMap::new(),
        }
    }

    // === Getters ===

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, tid: u16) -> bool {
        self.pending.contains_key(&tid)
    }

    /// Earliest retry-or-expiry deadline among outstanding requests.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.pending.values().map(|r| r.deadline).min()
    }

    // === Public Methods ===

    /// Decode one inbound datagram through the embedder's codec.
    pub fn parse(&mut self, buf: &[u8], from: SocketAddr) -> crate::Result<Message> {
        self.transport.parse(buf, from)
    }

    /// Send a request and start tracking it. Returns the transaction id.
    pub fn send_request(
        &mut self,
        node: &Node,
        kind: RequestKind,
        ctx: RequestContext,
        now: Instant,
    ) -> u16 {
        let tid = self.tid();

        trace!(tid, to = %node.id(), kind = kind.name(), "Sending request");

        self.transport.send(
            &Message {
                transaction_id: tid,
                body: MessageBody::Request(RequestBody {
                    sender_id: self.local_id,
                    kind: kind.clone(),
                }),
            },
            node.addr(),
        );
        node.on_request_sent(now);

        self.pending.insert(
            tid,
            PendingRequest {
                node: node.clone(),
                kind,
                ctx,
                attempt: 0,
                last_try: now,
                deadline: now + REQUEST_TIMEOUT,
            },
        );

        tid
    }

    /// Drop a request from the map; no event will fire for it.
    pub fn cancel(&mut self, tid: u16) {
        self.pending.remove(&tid);
    }

    /// Drop every request whose context matches the predicate.
    pub fn cancel_where(&mut self, pred: impl Fn(&RequestContext) -> bool) {
        self.pending.retain(|_, request| !pred(&request.ctx));
    }

    pub fn cancel_all(&mut self) {
        self.pending.clear();
    }

    /// Classify one inbound message against the request map.
    pub fn on_message(
        &mut self,
        message: Message,
        from: SocketAddr,
        cache: &mut NodeCache,
        now: Instant,
    ) -> Incoming {
        let tid = message.transaction_id;

        match message.body {
            MessageBody::Request(request) => {
                let node = cache.get_or_insert(request.sender_id, from);
                node.on_seen(now);

                Incoming::Request {
                    node,
                    tid,
                    kind: request.kind,
                    from,
                }
            }
            MessageBody::Response(response) => {
                let Some(request) = self.take_match(tid, &from) else {
                    return Incoming::Unmatched {
                        tid,
                        from,
                        answer: Some(response.answer),
                    };
                };

                let node = self.resolve_responder(request.node, response.sender_id, from, cache);
                node.on_replied(now);

                Incoming::Event(NetEvent::Reply {
                    ctx: request.ctx,
                    node,
                    answer: response.answer,
                    requester_addr: response.requester_addr,
                })
            }
            MessageBody::Error(ErrorBody { code, description }) => {
                let Some(request) = self.take_match(tid, &from) else {
                    return Incoming::Unmatched {
                        tid,
                        from,
                        answer: None,
                    };
                };

                // An error reply still proves the node is alive.
                request.node.on_replied(now);

                debug!(tid, code, %description, "Error response");

                Incoming::Event(NetEvent::ReplyError {
                    ctx: request.ctx,
                    node: request.node,
                    code,
                    description,
                })
            }
        }
    }

    /// Retry or expire requests whose deadline passed.
    pub fn run_timeouts(&mut self, now: Instant) -> Vec<NetEvent> {
        let due: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(tid, _)| *tid)
            .collect();

        let mut events = vec![];

        for tid in due {
            let Some(mut request) = self.pending.remove(&tid) else {
                continue;
            };

            if request.attempt + 1 < MAX_ATTEMPTS {
                request.attempt += 1;
                request.last_try = now;
                request.deadline = now + REQUEST_TIMEOUT * 2_u32.pow(request.attempt);

                trace!(tid, attempt = request.attempt, to = %request.node.id(), "Retrying request");

                self.transport.send(
                    &Message {
                        transaction_id: tid,
                        body: MessageBody::Request(RequestBody {
                            sender_id: self.local_id,
                            kind: request.kind.clone(),
                        }),
                    },
                    request.node.addr(),
                );
                request.node.on_request_sent(now);

                self.pending.insert(tid, request);
            } else {
                request.node.on_request_expired();

                debug!(tid, node = %request.node.id(), "Request expired");

                events.push(NetEvent::Expired {
                    ctx: request.ctx,
                    node: request.node,
                });
            }
        }

        events
    }

    /// Send a response to a request we are serving.
    pub fn respond(&mut self, to: SocketAddr, tid: u16, answer: RequestAnswer) {
        self.transport.send(
            &Message {
                transaction_id: tid,
                body: MessageBody::Response(ResponseBody {
                    sender_id: self.local_id,
                    requester_addr: Some(to),
                    answer,
                }),
            },
            to,
        );
    }

    /// Send a typed protocol error back to a requester.
    pub fn respond_error(&mut self, to: SocketAddr, tid: u16, code: u16, description: &str) {
        self.transport.send(
            &Message {
                transaction_id: tid,
                body: MessageBody::Error(ErrorBody {
                    code,
                    description: description.to_string(),
                }),
            },
            to,
        );
    }

    // === Private Methods ===

    /// Remove and return the pending request this message answers, if the
    /// transaction id and source address both check out.
    fn take_match(&mut self, tid: u16, from: &SocketAddr) -> Option<PendingRequest> {
        let matched = self
            .pending
            .get(&tid)
            .map_or(false, |r| addr_match(&r.node.addr(), from));

        if matched {
            self.pending.remove(&tid)
        } else {
            None
        }
    }

    /// Requests sent to an address without a known id (bootstrap pings)
    /// are credited to the responder's claimed id.
    fn resolve_responder(
        &self,
        requested: Node,
        sender_id: Id,
        from: SocketAddr,
        cache: &mut NodeCache,
    ) -> Node {
        if requested.id() == sender_id {
            requested
        } else {
            cache.get_or_insert(sender_id, from)
        }
    }

    /// Fresh 16-bit transaction id, skipping ids still in flight.
    fn tid(&mut self) -> u16 {
        loop {
            let tid = self.next_tid;
            self.next_tid = self.next_tid.wrapping_add(1);

            if !self.pending.contains_key(&tid) {
                return tid;
            }
        }
    }
}

/// Same as `SocketAddr::eq` but tolerates an unspecified ip on either side.
fn addr_match(a: &SocketAddr, b: &SocketAddr) -> bool {
    if a.port() != b.port() {
        return false;
    }

    a.ip().is_unspecified() || b.ip().is_unspecified() || a.ip() == b.ip()
}
