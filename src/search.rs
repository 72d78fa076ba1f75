//! Iterative lookup state: the frontier of closest peers and the get,
//! announce and listen operations pending against it.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::common::{
    DoneCallback, Family, GetCallback, Id, Node, TypeRegistry, Value, ValueFilter, ValueId,
    MAX_RESPONSE_TIME, NODE_EXPIRE_TIME,
};
use crate::routing::TARGET_NODES;
use crate::scheduler::JobHandle;
use crate::storage::LISTEN_EXPIRE_TIME;

/// Frontier size: the 8 target nodes plus a backtrack reserve.
pub const SEARCH_NODES: usize = 14;
/// Synced nodes that listens are installed on.
pub const LISTEN_NODES: usize = 3;
/// Floor between consecutive get waves of one search.
pub const SEARCH_GET_STEP: Duration = Duration::from_secs(3);
/// Finished searches are kept this long for cheap re-use.
pub const SEARCH_EXPIRE_TIME: Duration = Duration::from_secs(62 * 60);
/// Refresh announces and listens this margin before the remote expiry.
pub const REANNOUNCE_MARGIN: Duration = Duration::from_secs(5);
/// Most searches kept per family; the oldest finished one is evicted.
pub const MAX_SEARCHES: usize = 128;
/// Backoff between routing-table refills of one search.
pub(crate) const REFILL_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
/// Minimal view of one outstanding request, updated from engine events.
pub(crate) struct RequestTrace {
    pub last_try: Instant,
    pub reply_time: Option<Instant>,
    pub expired: bool,
}

impl RequestTrace {
    pub fn new(now: Instant) -> Self {
        RequestTrace {
            last_try: now,
            reply_time: None,
            expired: false,
        }
    }

    /// Sent and neither answered nor given up on.
    pub fn pending(&self) -> bool {
        !self.expired && self.reply_time.is_none()
    }

    pub fn on_reply(&mut self, now: Instant) {
        self.reply_time = Some(now);
        self.expired = false;
    }

    pub fn on_expired(&mut self) {
        self.expired = true;
    }
}

#[derive(Debug)]
/// One frontier entry.
pub(crate) struct SearchNode {
    pub node: Node,
    /// Write token minted by this node, required for announces.
    pub token: Option<Box<[u8]>>,
    /// Last time this node answered a get of ours.
    pub last_get_reply: Option<Instant>,
    pub get_request: Option<RequestTrace>,
    pub listen_request: Option<RequestTrace>,
    /// Announce status per value id.
    pub acked: BTreeMap<ValueId, RequestTrace>,
    /// Inserted from the routing table after the search was synced; only
    /// queried when the non-candidate slots are busy or expired.
    pub candidate: bool,
}

impl SearchNode {
    fn new(node: Node, candidate: bool) -> Self {
        SearchNode {
            node,
            token: None,
            last_get_reply: None,
            get_request: None,
            listen_request: None,
            acked: BTreeMap::new(),
            candidate,
        }
    }

    /// Usable for announce and listen: alive, holding a token, and heard
    /// from recently.
    pub fn is_synced(&self, now: Instant) -> bool {
        !self.node.is_expired()
            && self.token.is_some()
            && self
                .last_get_reply
                .map_or(false, |t| now < t + NODE_EXPIRE_TIME)
    }

    /// Worth sending a get: no get in flight, and the last reply is either
    /// stale or older than the search's latest work item.
    pub fn can_get(&self, now: Instant, update: Instant) -> bool {
        !self.node.is_expired()
            && !self.get_request.as_ref().map_or(false, RequestTrace::pending)
            && self
                .last_get_reply
                .map_or(true, |t| now >= t + NODE_EXPIRE_TIME || t < update)
    }

    pub fn is_announced(&self, vid: ValueId, expiration: Duration, now: Instant) -> bool {
        self.acked
            .get(&vid)
            .and_then(|trace| trace.reply_time)
            .map_or(false, |t| now < t + expiration)
    }

    pub fn is_listening(&self, now: Instant) -> bool {
        self.listen_request
            .as_ref()
            .and_then(|trace| trace.reply_time)
            .map_or(false, |t| now < t + LISTEN_EXPIRE_TIME)
    }

    /// When to next send an announce of `vid` to this node. `None` means
    /// immediately.
    pub fn announce_time(&self, vid: ValueId, expiration: Duration) -> Option<Instant> {
        let trace = self.acked.get(&vid)?;

        Some(match trace.reply_time {
            Some(reply) => {
                (reply + expiration - REANNOUNCE_MARGIN).max(trace.last_try + MAX_RESPONSE_TIME)
            }
            None => trace.last_try + MAX_RESPONSE_TIME,
        })
    }

    /// When to next refresh the listen on this node. `None` means
    /// immediately.
    pub fn listen_time(&self) -> Option<Instant> {
        let trace = self.listen_request.as_ref()?;

        Some(match trace.reply_time {
            Some(reply) => (reply + LISTEN_EXPIRE_TIME - REANNOUNCE_MARGIN)
                .max(trace.last_try + MAX_RESPONSE_TIME),
            None => trace.last_try + MAX_RESPONSE_TIME,
        })
    }
}

/// A single get operation attached to a search.
pub(crate) struct Get {
    pub start: Instant,
    pub filter: ValueFilter,
    pub cb: GetCallback,
    pub done: Option<DoneCallback>,
    /// Value ids already delivered; shared with the sibling family search
    /// so a value reaches the caller once.
    pub seen: Rc<RefCell<BTreeSet<ValueId>>>,
    pub cancelled: bool,
}

/// A value being kept announced at the search target.
pub(crate) struct Announce {
    pub value: Rc<Value>,
    pub created: Instant,
    /// Fires once, on the first ack or on search expiry.
    pub done: Option<DoneCallback>,
}

/// A local listen subscription riding on this search.
pub(crate) struct SearchListener {
    pub filter: ValueFilter,
    pub cb: GetCallback,
    /// Shared with the sibling family subscription.
    pub seen: Rc<RefCell<BTreeSet<ValueId>>>,
}

/// Per-(target, family) iterative lookup state.
pub(crate) struct Search {
    pub target: Id,
    pub family: Family,
    /// Sent as the listen request id; unsolicited value pushes carrying it
    /// are routed back to this search.
    pub tid: u16,
    /// Frontier, sorted by XOR distance to the target, capped at
    /// [SEARCH_NODES].
    pub nodes: Vec<SearchNode>,
    pub gets: Vec<Get>,
    pub announces: Vec<Announce>,
    pub listeners: BTreeMap<usize, SearchListener>,
    pub step_time: Option<Instant>,
    pub get_step_time: Option<Instant>,
    pub refill_time: Option<Instant>,
    /// Bumped when the search gains new work, forcing re-gets of nodes
    /// that replied before it.
    pub update_time: Instant,
    /// No live node left in the frontier.
    pub expired: bool,
    /// Every pending operation completed at least once.
    pub done: bool,
    pub step_job: Option<JobHandle>,
}

impl Search {
    pub fn new(target: Id, family: Family, tid: u16, now: Instant) -> Self {
        Search {
            target,
            family,
            tid,
            nodes: vec![],
            gets: vec![],
            announces: vec![],
            listeners: BTreeMap::new(),
            step_time: None,
            get_step_time: None,
            refill_time: None,
            update_time: now,
            expired: false,
            done: false,
            step_job: None,
        }
    }

    // === Frontier ===

    /// Insert a node that answered (or was reported) during the lookup.
    /// Returns `false` if it was already present (its token and reply time
    /// are refreshed) or too far to keep.
    pub fn insert_node(&mut self, node: Node, now: Instant, token: Option<Box<[u8]>>) -> bool {
        let candidate = token.is_none() && self.is_synced(now);
        self.insert(node, now, token, candidate)
    }

    /// Insert a routing-table refill entry.
    pub fn insert_candidate(&mut self, node: Node, now: Instant) -> bool {
        self.insert(node, now, None, true)
    }

    fn insert(
        &mut self,
        node: Node,
        now: Instant,
        token: Option<Box<[u8]>>,
        candidate: bool,
    ) -> bool {
        if node.family() != self.family {
            return false;
        }

        if let Some(existing) = self.nodes.iter_mut().find(|n| n.node.id() == node.id()) {
            if let Some(token) = token {
                existing.token = Some(token);
                existing.last_get_reply = Some(now);
                existing.candidate = false;
            }
            return false;
        }

        let distance = node.id().xor(&self.target);
        let pos = self
            .nodes
            .partition_point(|n| n.node.id().xor(&self.target) <= distance);

        if pos >= SEARCH_NODES {
            return false;
        }

        let mut entry = SearchNode::new(node, candidate);
        if let Some(token) = token {
            entry.token = Some(token);
            entry.last_get_reply = Some(now);
            entry.candidate = false;
        }

        self.nodes.insert(pos, entry);
        self.nodes.truncate(SEARCH_NODES);

        true
    }

    pub fn node_mut(&mut self, id: &Id) -> Option<&mut SearchNode> {
        self.nodes.iter_mut().find(|n| n.node.id() == *id)
    }

    /// The synced frontier: the closest [TARGET_NODES] live, non-candidate
    /// entries.
    fn frontier(&self) -> impl Iterator<Item = &SearchNode> {
        self.nodes
            .iter()
            .filter(|n| !n.candidate && !n.node.is_expired())
            .take(TARGET_NODES)
    }

    /// All of the synced frontier holds fresh tokens; announces and
    /// listens may proceed.
    pub fn is_synced(&self, now: Instant) -> bool {
        let mut any = false;

        for node in self.frontier() {
            if !node.is_synced(now) {
                return false;
            }
            any = true;
        }

        any
    }

    /// Every frontier node died; the search is kept only as a cache.
    pub fn all_expired(&self) -> bool {
        !self.nodes.is_empty() && self.nodes.iter().all(|n| n.node.is_expired())
    }

    pub fn expired_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.node.is_expired()).count()
    }

    /// A get is done once every synced-frontier node answered it, or the
    /// whole search expired.
    pub fn get_done(&self, get: &Get) -> bool {
        if self.expired {
            return true;
        }

        let mut any = false;
        for node in self.frontier() {
            if node.last_get_reply.map_or(true, |t| t < get.start) {
                return false;
            }
            any = true;
        }

        any
    }

    // === Scheduling ===

    /// When `next_step` should fire again, honoring the re-announce and
    /// re-listen deadlines and the get-step floor. `None` means the search
    /// has nothing left to drive.
    pub fn next_step_time(&self, types: &TypeRegistry, now: Instant) -> Option<Instant> {
        if self.expired {
            return None;
        }

        if self.gets.is_empty() && self.announces.is_empty() && self.listeners.is_empty() {
            return None;
        }

        let mut next: Option<Instant> = None;
        let mut fold = |t: Instant| {
            next = Some(next.map_or(t, |n: Instant| n.min(t)));
        };

        // Floor relative to the last wave (or step, so a step that sent
        // nothing does not immediately refire).
        let get_floor = self
            .get_step_time
            .or(self.step_time)
            .map_or(now, |t| t + SEARCH_GET_STEP)
            .max(now);

        if !self.is_synced(now) || !self.gets.is_empty() {
            fold(get_floor);
        }

        if self.is_synced(now) {
            for announce in &self.announces {
                let expiration = types.get(announce.value.type_id).expiration;

                for node in self.frontier().filter(|n| n.is_synced(now)) {
                    match node.announce_time(announce.value.id, expiration) {
                        Some(t) => fold(t.max(now)),
                        None => fold(now),
                    }
                }
            }

            if !self.listeners.is_empty() {
                for node in self
                    .frontier()
                    .filter(|n| n.is_synced(now))
                    .take(LISTEN_NODES)
                {
                    match node.listen_time() {
                        Some(t) => fold(t.max(now)),
                        None => fold(now),
                    }
                }
            }
        }

        next
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;
    use crate::common::accept_all;
    use crate::common::get_callback;

    fn node_with_distance(target: &Id, prefix_bits: usize, port: u16) -> Node {
        // Shares `prefix_bits` leading bits with the target, then diverges.
        let id = target
            .random_under_prefix(prefix_bits)
            .with_bit(prefix_bits, !target.bit(prefix_bits));
        Node::new(id, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn search(target: Id) -> Search {
        Search::new(target, Family::V4, 1, Instant::now())
    }

    #[test]
    fn frontier_stays_sorted_and_capped() {
        let target = Id::random();
        let mut sr = search(target);
        let now = Instant::now();

        for i in 0..SEARCH_NODES + 6 {
            sr.insert_node(node_with_distance(&target, i, 5000 + i as u16), now, None);
        }

        assert_eq!(sr.nodes.len(), SEARCH_NODES);
        for pair in sr.nodes.windows(2) {
            assert!(
                pair[0].node.id().xor(&target) <= pair[1].node.id().xor(&target),
                "frontier must be sorted by distance"
            );
        }

        // A node farther than the whole frontier is refused.
        let far = node_with_distance(&target, 0, 9999);
        if far.id().xor(&target) > sr.nodes.last().unwrap().node.id().xor(&target) {
            assert!(!sr.insert_node(far, now, None));
        }
    }

    #[test]
    fn duplicate_insert_refreshes_token() {
        let target = Id::random();
        let mut sr = search(target);
        let now = Instant::now();

        let node = node_with_distance(&target, 4, 5100);
        assert!(sr.insert_node(node.clone(), now, None));
        assert!(!sr.insert_node(node.clone(), now, Some(vec![1_u8; 64].into())));

        let entry = sr.node_mut(&node.id()).unwrap();
        assert!(entry.token.is_some());
        assert_eq!(entry.last_get_reply, Some(now));
        assert!(!entry.candidate);
    }

    #[test]
    fn frontier_distance_is_monotone_under_inserts() {
        let target = Id::random();
        let mut sr = search(target);
        let now = Instant::now();

        let mut last_eighth: Option<Id> = None;

        for i in 0..64_u16 {
            let node = Node::new(Id::random(), SocketAddr::from(([127, 0, 0, 1], 6000 + i)));
            sr.insert_node(node, now, None);

            if sr.nodes.len() >= TARGET_NODES {
                let eighth = sr.nodes[TARGET_NODES - 1].node.id().xor(&target);
                if let Some(prev) = last_eighth {
                    assert!(eighth <= prev, "8th-closest distance must not increase");
                }
                last_eighth = Some(eighth);
            }
        }
    }

    #[test]
    fn sync_requires_fresh_tokens() {
        let target = Id::random();
        let mut sr = search(target);
        let now = Instant::now();

        assert!(!sr.is_synced(now), "empty frontier is not synced");

        for i in 0..4_u16 {
            let node = node_with_distance(&target, i as usize, 5200 + i);
            sr.insert_node(node, now, Some(vec![i as u8; 64].into()));
        }
        assert!(sr.is_synced(now));

        // Tokens go stale after NODE_EXPIRE_TIME.
        assert!(!sr.is_synced(now + NODE_EXPIRE_TIME + Duration::from_secs(1)));
    }

    #[test]
    fn can_get_respects_pending_and_staleness() {
        let target = Id::random();
        let mut sr = search(target);
        let now = Instant::now();

        let node = node_with_distance(&target, 2, 5300);
        sr.insert_node(node.clone(), now, Some(vec![7_u8; 64].into()));

        let update = now;
        let entry = sr.node_mut(&node.id()).unwrap();

        // Fresh reply, nothing new: no get needed.
        assert!(!entry.can_get(now + Duration::from_secs(1), update));

        // New work arrived after the reply: get again.
        assert!(entry.can_get(now + Duration::from_secs(1), now + Duration::from_secs(1)));

        // In-flight get blocks another.
        entry.get_request = Some(RequestTrace::new(now));
        assert!(!entry.can_get(now + Duration::from_secs(1), now + Duration::from_secs(1)));
    }

    #[test]
    fn announce_deadline_mixes_both_floors() {
        let target = Id::random();
        let mut sr = search(target);
        let t0 = Instant::now();

        let node = node_with_distance(&target, 1, 5400);
        sr.insert_node(node.clone(), t0, Some(vec![1_u8; 64].into()));

        let expiration = Duration::from_secs(600);
        let entry = sr.node_mut(&node.id()).unwrap();

        // Nothing acked yet: due immediately.
        assert_eq!(entry.announce_time(9, expiration), None);

        let mut trace = RequestTrace::new(t0);
        trace.on_reply(t0 + Duration::from_secs(1));
        entry.acked.insert(9, trace);

        let expected =
            (t0 + Duration::from_secs(1) + expiration - REANNOUNCE_MARGIN).max(t0 + MAX_RESPONSE_TIME);
        assert_eq!(entry.announce_time(9, expiration), Some(expected));
        assert!(entry.is_announced(9, expiration, t0 + Duration::from_secs(2)));
        assert!(!entry.is_announced(9, expiration, t0 + expiration + Duration::from_secs(2)));
    }

    #[test]
    fn next_step_time_is_none_without_work() {
        let target = Id::random();
        let mut sr = search(target);
        let now = Instant::now();

        sr.insert_node(node_with_distance(&target, 3, 5500), now, None);

        assert_eq!(sr.next_step_time(&TypeRegistry::new(), now), None);

        sr.gets.push(Get {
            start: now,
            filter: accept_all(),
            cb: get_callback(|_| true),
            done: None,
            seen: Rc::new(RefCell::new(BTreeSet::new())),
            cancelled: false,
        });

        assert_eq!(sr.next_step_time(&TypeRegistry::new(), now), Some(now));
    }
}
