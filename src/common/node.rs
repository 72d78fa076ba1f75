//! Shared node records and the weak cache canonicalizing them.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::common::Id;

/// The age of a node's last reply before it stops being good.
pub const NODE_GOOD_TIME: Duration = Duration::from_secs(120 * 60);
/// Reply staleness bound: search nodes older than this need a fresh get.
pub const NODE_EXPIRE_TIME: Duration = Duration::from_secs(10 * 60);
/// Upper bound on a request round trip including retries.
pub const MAX_RESPONSE_TIME: Duration = Duration::from_secs(3);
/// Unanswered requests before a node is written off as expired.
pub const MAX_PINGED: u32 = 3;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
/// Address family a node was observed on. Routing tables, searches and
/// stats are kept per family.
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Family {
        if addr.is_ipv4() {
            Family::V4
        } else {
            Family::V6
        }
    }
}

#[derive(Debug)]
/// Liveness state of a remote peer, shared between the routing table,
/// searches and outstanding requests.
pub struct NodeState {
    pub(crate) id: Id,
    pub(crate) addr: SocketAddr,
    /// Last time anything was heard from this node.
    pub(crate) last_seen: Option<Instant>,
    /// Last time this node answered one of our requests.
    pub(crate) last_reply: Option<Instant>,
    /// Last time a request was sent to this node.
    pub(crate) last_ping: Option<Instant>,
    /// Requests that went unanswered since the last reply.
    pub(crate) pinged: u32,
}

#[derive(Clone)]
/// Handle to a canonical node record.
///
/// One record exists per `(id, family)`; see [NodeCache]. The handle is
/// cheap to clone and all copies observe liveness updates.
pub struct Node(Rc<RefCell<NodeState>>);

impl Node {
    pub fn new(id: Id, addr: SocketAddr) -> Node {
        Node(Rc::new(RefCell::new(NodeState {
            id,
            addr,
            last_seen: None,
            last_reply: None,
            last_ping: None,
            pinged: 0,
        })))
    }

    /// Creates a node with a random id for testing purposes.
    pub fn random() -> Node {
        Node::new(Id::random(), SocketAddr::from(([0, 0, 0, 0], 1)))
    }

    // === Getters ===

    pub fn id(&self) -> Id {
        self.0.borrow().id
    }

    pub fn addr(&self) -> SocketAddr {
        self.0.borrow().addr
    }

    pub fn family(&self) -> Family {
        Family::of(&self.0.borrow().addr)
    }

    pub fn last_reply(&self) -> Option<Instant> {
        self.0.borrow().last_reply
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.0.borrow().last_seen
    }

    /// Replied recently and not written off.
    pub fn is_good(&self, now: Instant) -> bool {
        let state = self.0.borrow();

        state.pinged < MAX_PINGED
            && state
                .last_reply
                .map_or(false, |t| now < t + NODE_GOOD_TIME)
    }

    /// Too many unanswered requests in a row.
    pub fn is_expired(&self) -> bool {
        self.0.borrow().pinged >= MAX_PINGED
    }

    /// Known but neither good nor expired.
    pub fn is_dubious(&self, now: Instant) -> bool {
        !self.is_good(now) && !self.is_expired()
    }

    /// We heard from this node more recently than it answered us, meaning
    /// our knowledge of it comes from its own requests.
    pub fn is_incoming(&self) -> bool {
        let state = self.0.borrow();

        match (state.last_seen, state.last_reply) {
            (Some(seen), Some(reply)) => seen > reply,
            (Some(_), None) => true,
            _ => false,
        }
    }

    // === State transitions ===

    pub(crate) fn on_seen(&self, now: Instant) {
        self.0.borrow_mut().last_seen = Some(now);
    }

    pub(crate) fn on_replied(&self, now: Instant) {
        let mut state = self.0.borrow_mut();

        state.last_seen = Some(now);
        state.last_reply = Some(now);
        state.pinged = 0;
    }

    pub(crate) fn on_request_sent(&self, now: Instant) {
        self.0.borrow_mut().last_ping = Some(now);
    }

    pub(crate) fn on_request_expired(&self) {
        self.0.borrow_mut().pinged += 1;
    }

    /// Give the node another chance after a connectivity change.
    pub(crate) fn reset_liveness(&self) {
        self.0.borrow_mut().pinged = 0;
    }

    /// A request went out to this node within `backoff`.
    pub(crate) fn pinged_within(&self, now: Instant, backoff: Duration) -> bool {
        self.0
            .borrow()
            .last_ping
            .map_or(false, |t| now < t + backoff)
    }

    /// A node that moved keeps its record; the address follows it.
    pub(crate) fn set_addr(&self, addr: SocketAddr) {
        self.0.borrow_mut().addr = addr;
    }

    pub(crate) fn ptr_eq(&self, other: &Node) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn downgrade(&self) -> Weak<RefCell<NodeState>> {
        Rc::downgrade(&self.0)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id() && self.addr() == other.addr()
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.0.borrow();

        f.debug_struct("Node")
            .field("id", &state.id)
            .field("addr", &state.addr)
            .field("pinged", &state.pinged)
            .finish()
    }
}

#[derive(Debug, Default)]
/// Weak-reference pool canonicalizing node records by `(id, family)`.
///
/// Records die when no strong reference (routing table, search, request)
/// remains; the cache itself never keeps a node alive.
pub struct NodeCache {
    nodes: HashMap<(Id, Family), Weak<RefCell<NodeState>>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the canonical record for `(id, family)` if one is alive.
    pub fn get(&self, id: &Id, family: Family) -> Option<Node> {
        self.nodes
            .get(&(*id, family))
            .and_then(|weak| weak.upgrade())
            .map(Node)
    }

    /// Returns the canonical record, creating it on first sight. A known
    /// node observed at a new address has its address updated.
    pub fn get_or_insert(&mut self, id: Id, addr: SocketAddr) -> Node {
        let family = Family::of(&addr);

        if let Some(node) = self.get(&id, family) {
            if node.addr() != addr {
                node.set_addr(addr);
            }
            return node;
        }

        if self.nodes.len() % 32 == 0 {
            self.vacuum();
        }

        let node = Node::new(id, addr);
        self.nodes.insert((id, family), node.downgrade());

        node
    }

    /// Reset the liveness of every cached node, giving expired ones a new
    /// chance. Used on connectivity changes.
    pub fn clear_bad_nodes(&mut self, family: Option<Family>) {
        for ((_, f), weak) in self.nodes.iter() {
            if family.map_or(true, |family| *f == family) {
                if let Some(state) = weak.upgrade() {
                    Node(state).reset_liveness();
                }
            }
        }
    }

    fn vacuum(&mut self) {
        self.nodes.retain(|_, weak| weak.strong_count() > 0);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn liveness_transitions() {
        let node = Node::random();
        let t = now();

        assert!(!node.is_good(t));
        assert!(node.is_dubious(t));

        node.on_replied(t);
        assert!(node.is_good(t));
        assert!(!node.is_good(t + NODE_GOOD_TIME + Duration::from_secs(1)));

        for _ in 0..MAX_PINGED {
            node.on_request_expired();
        }
        assert!(node.is_expired());

        node.on_replied(t);
        assert!(!node.is_expired());
    }

    #[test]
    fn cache_canonicalizes() {
        let mut cache = NodeCache::new();
        let id = Id::random();
        let addr = SocketAddr::from(([127, 0, 0, 1], 4000));

        let a = cache.get_or_insert(id, addr);
        let b = cache.get_or_insert(id, addr);

        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn cache_drops_dead_records() {
        let mut cache = NodeCache::new();
        let id = Id::random();
        let addr = SocketAddr::from(([127, 0, 0, 1], 4000));

        {
            let _node = cache.get_or_insert(id, addr);
        }

        assert!(cache.get(&id, Family::V4).is_none());
    }

    #[test]
    fn cache_follows_address_changes() {
        let mut cache = NodeCache::new();
        let id = Id::random();

        let node = cache.get_or_insert(id, SocketAddr::from(([127, 0, 0, 1], 4000)));
        let moved = cache.get_or_insert(id, SocketAddr::from(([127, 0, 0, 2], 4001)));

        assert!(node.ptr_eq(&moved));
        assert_eq!(node.addr(), SocketAddr::from(([127, 0, 0, 2], 4001)));
    }

    #[test]
    fn incoming_nodes() {
        let node = Node::random();
        let t = now();

        node.on_seen(t);
        assert!(node.is_incoming());

        node.on_replied(t + Duration::from_secs(1));
        assert!(!node.is_incoming());
    }
}
