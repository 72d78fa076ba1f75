//! Per-family routing tables: range buckets with the asymmetric split rule.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::debug;

use crate::common::messages::NodeRecord;
use crate::common::{Family, Id, Node, ID_BITS};

/// Maximum nodes per bucket.
pub const BUCKET_SIZE: usize = 8;
/// Nodes handed to queries and search refills.
pub const TARGET_NODES: usize = 8;
/// A bucket with no activity for this long is due a maintenance probe.
pub const BUCKET_EXPIRE_TIME: Duration = Duration::from_secs(10 * 60);
/// Full buckets within this depth of the home chain may still split.
const HOME_CHAIN_DEPTH: usize = 6;
/// Backoff between pings of the same dubious occupant.
const PING_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug)]
/// A half-open range of the id space holding up to [BUCKET_SIZE] nodes.
///
/// The range is `[first, next.first)` where `next` is the following bucket;
/// `depth` is the number of leading bits all ids in the range share.
pub struct Bucket {
    pub(crate) first: Id,
    pub(crate) depth: usize,
    /// Time of the last confirmed activity in this bucket's range.
    pub(crate) time: Instant,
    pub(crate) nodes: Vec<Node>,
    /// A likely replacement remembered while the bucket is full.
    pub(crate) cached: Option<NodeRecord>,
}

impl Bucket {
    fn new(first: Id, depth: usize, time: Instant) -> Bucket {
        Bucket {
            first,
            depth,
            time,
            nodes: Vec::with_capacity(BUCKET_SIZE),
            cached: None,
        }
    }

    /// A random id inside this bucket's range.
    pub fn random_id(&self) -> Id {
        self.first.random_under_prefix(self.depth)
    }

    /// A random non-expired node, used as the maintenance probe target.
    pub fn random_node(&self) -> Option<Node> {
        let mut rng = rand::thread_rng();

        self.nodes
            .iter()
            .filter(|n| !n.is_expired())
            .collect::<Vec<_>>()
            .choose(&mut rng)
            .map(|n| (*n).clone())
    }

    fn contains(&self, id: &Id) -> bool {
        self.first.common_prefix_bits(id) >= self.depth
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Per-family node counts reported by [RoutingTable::stats].
pub struct NodeStats {
    pub good: usize,
    pub dubious: usize,
    pub cached: usize,
    pub incoming: usize,
}

#[derive(Debug, PartialEq)]
/// What happened to an inserted node.
pub(crate) enum Insert {
    Added,
    Refreshed,
    /// Bucket full and unsplittable; the node was parked as the cached
    /// candidate. `ping` is a dubious occupant worth probing: if it fails,
    /// the candidate takes its place.
    Full { ping: Option<Node> },
    /// Own id or wrong family.
    Rejected,
}

#[derive(Debug)]
/// Maintenance probe to send: `find_node(target)` addressed to `node`.
pub(crate) struct MaintenanceProbe {
    pub target: Id,
    pub node: Node,
}

#[derive(Debug)]
/// An ordered list of non-overlapping buckets covering the id space.
///
/// Exactly one bucket contains any given id; adjacent buckets share their
/// boundary. Only buckets on the home chain split when full.
pub struct RoutingTable {
    family: Family,
    local_id: Id,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(family: Family, local_id: Id, now: Instant) -> Self {
        RoutingTable {
            family,
            local_id,
            buckets: vec![Bucket::new(Id::ZERO, 0, now)],
        }
    }

    // === Getters ===

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn local_id(&self) -> &Id {
        &self.local_id
    }

    pub(crate) fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.nodes.is_empty())
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    /// The bucket whose range contains `id`.
    pub(crate) fn bucket_of(&self, id: &Id) -> &Bucket {
        &self.buckets[self.bucket_index(id)]
    }

    // === Public Methods ===

    /// Attempts to insert a node following the asymmetric split rule.
    /// `confirmed` means the node just answered a request of ours, which
    /// also refreshes its bucket's activity time.
    pub(crate) fn add(&mut self, node: &Node, confirmed: bool, now: Instant) -> Insert {
        if node.id() == self.local_id || node.family() != self.family {
            return Insert::Rejected;
        }

        let id = node.id();

        loop {
            let index = self.bucket_index(&id);
            let bucket = &mut self.buckets[index];

            if confirmed {
                bucket.time = now;
            }

            if bucket.nodes.iter().any(|n| n.ptr_eq(node)) {
                return Insert::Refreshed;
            }

            if bucket.nodes.len() < BUCKET_SIZE {
                bucket.nodes.push(node.clone());
                return Insert::Added;
            }

            // Replace an occupant that was written off.
            if let Some(pos) = bucket.nodes.iter().position(|n| n.is_expired()) {
                bucket.nodes.remove(pos);
                bucket.nodes.push(node.clone());
                return Insert::Added;
            }

            if self.splittable(index) {
                self.split(index);
                continue;
            }

            // Full and frozen: remember the newcomer, probe a dubious
            // occupant so a failure opens a slot.
            let bucket = &mut self.buckets[index];
            bucket.cached = Some(NodeRecord {
                id,
                addr: node.addr(),
            });

            let ping = bucket
                .nodes
                .iter()
                .filter(|n| n.is_dubious(now) && !n.pinged_within(now, PING_BACKOFF))
                .min_by_key(|n| n.last_reply())
                .cloned();

            return Insert::Full { ping };
        }
    }

    /// Up to `count` good-or-dubious nodes sorted by XOR distance to
    /// `target`. Expired nodes never qualify, so no clock is needed.
    pub fn find_closest(&self, target: &Id, count: usize) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| !n.is_expired())
            .cloned()
            .collect();

        nodes.sort_by(|a, b| a.id().xor(target).cmp(&b.id().xor(target)));
        nodes.truncate(count);

        nodes
    }

    /// Take the cached replacement candidate near `id`, if any.
    pub(crate) fn take_cached(&mut self, id: &Id) -> Option<NodeRecord> {
        let index = self.bucket_index(id);
        self.buckets[index].cached.take()
    }

    /// Probes for buckets whose range went quiet. Each due bucket gets one
    /// `find_node` towards a random id inside its range.
    pub(crate) fn bucket_maintenance(&mut self, now: Instant) -> Vec<MaintenanceProbe> {
        let mut probes = vec![];

        for bucket in self.buckets.iter_mut() {
            if now < bucket.time + BUCKET_EXPIRE_TIME {
                continue;
            }

            if let Some(node) = bucket.random_node() {
                probes.push(MaintenanceProbe {
                    target: bucket.random_id(),
                    node,
                });
                // A reply will refresh it again; this stops the bucket
                // from being probed on every pass until then.
                bucket.time = now;
            }
        }

        probes
    }

    /// One probe around the local id, keeping the neighborhood fresh. Runs
    /// on every maintenance pass, not only when the home bucket expires.
    pub(crate) fn neighborhood_maintenance(&mut self, now: Instant) -> Option<MaintenanceProbe> {
        let home = self.bucket_index(&self.local_id);
        let target = self.buckets[home].random_id();

        let mut rng = rand::thread_rng();
        let mut candidates: Vec<usize> = vec![home];
        if home > 0 {
            candidates.push(home - 1);
        }
        if home + 1 < self.buckets.len() {
            candidates.push(home + 1);
        }
        candidates.shuffle(&mut rng);

        for index in candidates {
            if let Some(node) = self.buckets[index].random_node() {
                self.buckets[index].time = now;
                return Some(MaintenanceProbe { target, node });
            }
        }

        None
    }

    pub fn stats(&self, now: Instant) -> NodeStats {
        let mut stats = NodeStats::default();

        for bucket in &self.buckets {
            if bucket.cached.is_some() {
                stats.cached += 1;
            }
            for node in &bucket.nodes {
                if node.is_good(now) {
                    stats.good += 1;
                } else if node.is_dubious(now) {
                    stats.dubious += 1;
                }
                if node.is_incoming() {
                    stats.incoming += 1;
                }
            }
        }

        stats
    }

    /// Human readable table dump.
    pub fn log(&self, now: Instant) -> String {
        let mut out = String::new();

        let _ = writeln!(
            out,
            "Routing table ({:?}, {} nodes)",
            self.family,
            self.node_count()
        );
        for bucket in &self.buckets {
            let _ = writeln!(
                out,
                "  [{} depth {:3}] {} nodes{}{}",
                bucket.first,
                bucket.depth,
                bucket.nodes.len(),
                if bucket.cached.is_some() { " +cached" } else { "" },
                if bucket.contains(&self.local_id) {
                    " (home)"
                } else {
                    ""
                },
            );
            for node in &bucket.nodes {
                let state = if node.is_good(now) {
                    "good"
                } else if node.is_expired() {
                    "expired"
                } else {
                    "dubious"
                };
                let _ = writeln!(out, "    {} {} [{}]", node.id(), node.addr(), state);
            }
        }

        out
    }

    // === Private Methods ===

    fn bucket_index(&self, id: &Id) -> usize {
        self.buckets.partition_point(|b| b.first <= *id) - 1
    }

    /// Only buckets containing the local id, or within
    /// [HOME_CHAIN_DEPTH] of the home chain, may split.
    fn splittable(&self, index: usize) -> bool {
        let bucket = &self.buckets[index];

        bucket.depth < ID_BITS
            && self.local_id.common_prefix_bits(&bucket.first) + HOME_CHAIN_DEPTH >= bucket.depth
    }

    /// Split a bucket in two equal halves along its midpoint.
    fn split(&mut self, index: usize) {
        let (mid, depth, time) = {
            let bucket = &self.buckets[index];
            (
                bucket.first.with_bit(bucket.depth, true),
                bucket.depth,
                bucket.time,
            )
        };

        debug!(family = ?self.family, mid = %mid, depth, "Splitting bucket");

        let mut upper = Bucket::new(mid, depth + 1, time);
        let lower = &mut self.buckets[index];
        lower.depth += 1;

        let (stay, moved): (Vec<Node>, Vec<Node>) =
            lower.nodes.drain(..).partition(|n| n.id() < mid);
        lower.nodes = stay;
        upper.nodes = moved;

        if let Some(cached) = lower.cached.take() {
            if cached.id < mid {
                lower.cached = Some(cached);
            } else {
                upper.cached = Some(cached);
            }
        }

        self.buckets.insert(index + 1, upper);
    }
}
