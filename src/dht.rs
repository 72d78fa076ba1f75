//! The DHT node facade: public operations, server-side request handling,
//! and the periodic driver tying the subsystems together.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::fmt::Write as _;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::rc::Rc;
use std::time::{Duration, Instant};

use dyn_clone::DynClone;
use lru::LruCache;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::common::messages::{
    NodeRecord, RequestAnswer, RequestKind, Want, ERROR_NOT_STORING, ERROR_STORAGE_FULL,
    ERROR_WRONG_TOKEN,
};
use crate::common::{
    DoneCallback, Family, GetCallback, Id, Node, NodeCache, ShutdownCallback, TypeId, TypeRegistry,
    Value, ValueFilter, ValueId, ValueType,
};
use crate::engine::{Incoming, NetEvent, NetworkEngine, RequestContext};
use crate::routing::{Insert, NodeStats, RoutingTable, TARGET_NODES};
use crate::scheduler::{JobHandle, Scheduler};
use crate::search::{
    Announce, Get, RequestTrace, Search, SearchListener, LISTEN_NODES, MAX_SEARCHES,
    REFILL_BACKOFF, SEARCH_EXPIRE_TIME, SEARCH_GET_STEP, SEARCH_NODES,
};
use crate::storage::{Storage, MAX_HASHES, STORAGE_MAINTENANCE_INTERVAL};
use crate::tokens::TokenEngine;
use crate::transport::Transport;
use crate::{Error, Result};

/// Default in-memory storage budget.
pub const DEFAULT_STORAGE_LIMIT: usize = 64 * 1024 * 1024;

/// Cadence of the storage/search expiry sweep.
const EXPIRE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Distinct confirmations before a reported address is trusted.
const PUBLIC_ADDRESS_THRESHOLD: u32 = 3;
/// Bound on the reported-address tally.
const REPORTED_ADDRS_MAX: usize = 16;
/// Recently-misbehaving source addresses we refuse to hear from.
const BLACKLISTED_MAX: usize = 10;

/// Decides whether a source address is administratively refused.
///
/// Combined with the internal blacklist of misbehaving sources; the
/// default allows everyone.
pub trait AddressFilter: Debug + DynClone {
    fn is_blacklisted(&self, addr: &SocketAddr) -> bool;
}

dyn_clone::clone_trait_object!(AddressFilter);

#[derive(Debug, Clone)]
struct AllowAll;

impl AddressFilter for AllowAll {
    fn is_blacklisted(&self, _addr: &SocketAddr) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Connectivity of the node for one family, derived from table stats.
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
/// Node configuration.
pub struct Config {
    /// Own id; random when unset.
    pub node_id: Option<Id>,
    /// Bootstrap-only nodes route but never store values or listeners.
    pub is_bootstrap: bool,
    /// In-memory storage budget in bytes.
    pub max_store_size: usize,
    /// Injected blacklist predicate.
    pub filter: Box<dyn AddressFilter>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: None,
            is_bootstrap: false,
            max_store_size: DEFAULT_STORAGE_LIMIT,
            filter: Box::new(AllowAll),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// A good node exported for warm restarts.
pub struct NodeExport {
    pub id: Id,
    pub addr: SocketAddr,
}

#[derive(Serialize, Deserialize)]
struct ValueExport {
    value: Value,
    age_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
/// Deferred work interpreted by [Dht::run_job].
enum Job {
    SearchStep { target: Id, family: Family },
    ConfirmNodes,
    RotateSecrets,
    Expire,
    StorageMaintenance,
}

struct ListenEntry {
    key: Id,
    storage_token: Option<usize>,
}

/// A Kademlia DHT node storing small values at 160-bit keys.
///
/// Single-threaded cooperative: feed inbound datagrams and clock ticks
/// through [Dht::periodic]; outbound packets leave synchronously through
/// the injected [Transport].
pub struct Dht {
    myid: Id,
    is_bootstrap: bool,
    now: Instant,

    types: TypeRegistry,
    cache: NodeCache,
    table4: RoutingTable,
    table6: RoutingTable,

    storages: BTreeMap<Id, Storage>,
    total_store_size: usize,
    total_values: usize,
    max_store_size: usize,

    searches: BTreeMap<(Id, Family), Search>,
    next_search_tid: u16,

    listens: BTreeMap<usize, ListenEntry>,
    next_listen_token: usize,

    tokens: TokenEngine,
    scheduler: Scheduler<Job>,
    /// Handle of the pending [Job::ConfirmNodes], edited in place when
    /// maintenance must run sooner.
    confirm_job: JobHandle,
    engine: NetworkEngine,

    blacklist: LruCache<SocketAddr, ()>,
    filter: Box<dyn AddressFilter>,

    reported_addrs: Vec<(u32, SocketAddr)>,
    public_addr: [Option<SocketAddr>; 2],

    shutting_down: bool,
}

impl Dht {
    pub fn new(config: Config, transport: Box<dyn Transport>, now: Instant) -> Self {
        let myid = config.node_id.unwrap_or_else(Id::random);

        debug!(id = %myid, is_bootstrap = config.is_bootstrap, "Starting node");

        let mut scheduler = Scheduler::new();
        let confirm_job = scheduler.schedule(now + Duration::from_secs(5), Job::ConfirmNodes);
        scheduler.schedule(
            now + crate::tokens::ROTATE_SECRETS_INTERVAL,
            Job::RotateSecrets,
        );
        scheduler.schedule(now + EXPIRE_SWEEP_INTERVAL, Job::Expire);
        scheduler.schedule(now + STORAGE_MAINTENANCE_INTERVAL, Job::StorageMaintenance);

        Dht {
            myid,
            is_bootstrap: config.is_bootstrap,
            now,
            types: TypeRegistry::new(),
            cache: NodeCache::new(),
            table4: RoutingTable::new(Family::V4, myid, now),
            table6: RoutingTable::new(Family::V6, myid, now),
            storages: BTreeMap::new(),
            total_store_size: 0,
            total_values: 0,
            max_store_size: config.max_store_size,
            searches: BTreeMap::new(),
            next_search_tid: 1,
            listens: BTreeMap::new(),
            next_listen_token: 1,
            tokens: TokenEngine::new(now),
            scheduler,
            confirm_job,
            engine: NetworkEngine::new(myid, transport),
            blacklist: LruCache::new(
                NonZeroUsize::new(BLACKLISTED_MAX).expect("BLACKLISTED_MAX is non-zero"),
            ),
            filter: config.filter,
            reported_addrs: vec![],
            public_addr: [None, None],
            shutting_down: false,
        }
    }

    // === Getters ===

    /// The id of this node.
    pub fn id(&self) -> &Id {
        &self.myid
    }

    pub fn status(&self, family: Family) -> Status {
        let stats = self.table(family).stats(self.now);

        if stats.good > 0 {
            Status::Connected
        } else if stats.dubious > 0 {
            Status::Connecting
        } else {
            Status::Disconnected
        }
    }

    /// The better of the two per-family statuses.
    pub fn overall_status(&self) -> Status {
        self.status(Family::V4).max(self.status(Family::V6))
    }

    /// Total memory used by stored values and their count.
    pub fn get_store_size(&self) -> (usize, usize) {
        (self.total_store_size, self.total_values)
    }

    pub fn get_nodes_stats(&self, family: Family) -> NodeStats {
        self.table(family).stats(self.now)
    }

    /// Addresses remote peers report for us, most confirmed first.
    pub fn get_public_address(&self, family: Option<Family>) -> Vec<SocketAddr> {
        let mut tally: Vec<(u32, SocketAddr)> = self
            .reported_addrs
            .iter()
            .filter(|(_, addr)| family.map_or(true, |f| Family::of(addr) == f))
            .copied()
            .collect();

        tally.sort_by(|a, b| b.0.cmp(&a.0));
        tally.into_iter().map(|(_, addr)| addr).collect()
    }

    // === Configuration ===

    pub fn register_type(&mut self, value_type: ValueType) {
        self.types.register(value_type);
    }

    pub fn get_type(&self, id: TypeId) -> ValueType {
        self.types.get(id)
    }

    /// Set the in-memory storage limit in bytes.
    pub fn set_storage_limit(&mut self, limit: usize) {
        self.max_store_size = limit;
    }

    // === Driver ===

    /// Single entry point: dispatch one inbound datagram if supplied, run
    /// everything that is due, and return the next wakeup deadline.
    pub fn periodic(&mut self, packet: Option<(&[u8], SocketAddr)>, now: Instant) -> Instant {
        self.now = self.now.max(now);

        if let Some((buf, from)) = packet {
            if let Err(error) = self.ingest(buf, from) {
                debug!(%from, %error, "Dropped packet");
            }
        }

        let events = self.engine.run_timeouts(self.now);
        for event in events {
            self.handle_event(event);
        }

        while let Some(job) = self.scheduler.pop_due(self.now) {
            self.run_job(job);
        }

        let next = match (self.scheduler.next_deadline(), self.engine.next_timeout()) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => self.now + EXPIRE_SWEEP_INTERVAL,
        };

        next.max(self.now)
    }

    // === Operations ===

    /// Search the network for values at `key`, streaming them through `cb`
    /// (return `false` to cancel). `done` fires exactly once when both
    /// family searches conclude; `false` means nothing was found before
    /// every reachable peer expired.
    pub fn get(
        &mut self,
        key: Id,
        cb: GetCallback,
        done: Option<DoneCallback>,
        filter: ValueFilter,
    ) {
        let now = self.now;
        let seen = Rc::new(RefCell::new(BTreeSet::new()));
        let (done4, done6) = split_done_all(done);

        for (family, done) in [(Family::V4, done4), (Family::V6, done6)] {
            let sr = self.ensure_search(key, family);
            sr.gets.push(Get {
                start: now,
                filter: filter.clone(),
                cb: cb.clone(),
                done: Some(done),
                seen: seen.clone(),
                cancelled: false,
            });
            sr.update_time = now;
            sr.done = false;
            self.schedule_search_step(key, family, now);
        }
    }

    /// Keep `value` announced at `key` until [Dht::cancel_put]. `done`
    /// fires once: on the first accepted announce, or with `false` when no
    /// peer could be reached.
    pub fn put(
        &mut self,
        key: Id,
        value: Value,
        done: Option<DoneCallback>,
        created: Option<Instant>,
    ) {
        let value = Rc::new(value);
        let created = created.unwrap_or(self.now).min(self.now);
        let (done4, done6) = split_done_any(done);

        for (family, done) in [(Family::V4, done4), (Family::V6, done6)] {
            self.announce(key, family, value.clone(), created, Some(done));
        }
    }

    /// Values this node is currently announcing at `key`.
    pub fn get_put(&self, key: &Id) -> Vec<Rc<Value>> {
        let mut values: Vec<Rc<Value>> = vec![];

        for family in [Family::V4, Family::V6] {
            if let Some(sr) = self.searches.get(&(*key, family)) {
                for announce in &sr.announces {
                    if !values.iter().any(|v| v.id == announce.value.id) {
                        values.push(announce.value.clone());
                    }
                }
            }
        }

        values
    }

    pub fn get_put_value(&self, key: &Id, vid: ValueId) -> Option<Rc<Value>> {
        self.get_put(key).into_iter().find(|v| v.id == vid)
    }

    /// Stop announcing `vid` at `key`. Returns whether anything was
    /// removed; pending announce traffic is cancelled immediately.
    pub fn cancel_put(&mut self, key: &Id, vid: ValueId) -> bool {
        let mut removed = false;

        for family in [Family::V4, Family::V6] {
            if let Some(sr) = self.searches.get_mut(&(*key, family)) {
                let before = sr.announces.len();
                sr.announces.retain(|a| a.value.id != vid);
                removed |= sr.announces.len() < before;
            }
        }

        if removed {
            let key = *key;
            self.engine.cancel_where(|ctx| {
                matches!(ctx, RequestContext::SearchAnnounce { target, value_id, .. }
                    if *target == key && *value_id == vid)
            });
        }

        removed
    }

    /// Subscribe to values under `key`: local matches are delivered
    /// immediately, remote notifications as they arrive. Returns a token
    /// for [Dht::cancel_listen].
    pub fn listen(&mut self, key: Id, cb: GetCallback, filter: ValueFilter) -> usize {
        let now = self.now;
        let token = self.next_listen_token;
        self.next_listen_token += 1;

        let seen = Rc::new(RefCell::new(BTreeSet::new()));

        for family in [Family::V4, Family::V6] {
            let sr = self.ensure_search(key, family);
            sr.listeners.insert(
                token,
                SearchListener {
                    filter: filter.clone(),
                    cb: cb.clone(),
                    seen: seen.clone(),
                },
            );
            sr.update_time = now;
            sr.done = false;
            self.schedule_search_step(key, family, now);
        }

        let storage_token = if self.is_bootstrap {
            None
        } else {
            let storage = self
                .storages
                .entry(key)
                .or_insert_with(|| Storage::new(key, now));
            let storage_token = storage.local_listen(filter.clone(), cb.clone());

            // Deliver what we already hold.
            let local = storage.get(&filter);
            if !local.is_empty() {
                let mut seen = seen.borrow_mut();
                for value in &local {
                    seen.insert(value.id);
                }
                drop(seen);
                (cb.borrow_mut())(&local);
            }

            Some(storage_token)
        };

        self.listens.insert(token, ListenEntry { key, storage_token });

        token
    }

    /// Unsubscribe both families and the local storage.
    pub fn cancel_listen(&mut self, key: &Id, token: usize) -> bool {
        let Some(entry) = self.listens.remove(&token) else {
            return false;
        };
        if entry.key != *key {
            self.listens.insert(token, entry);
            return false;
        }

        for family in [Family::V4, Family::V6] {
            if let Some(sr) = self.searches.get_mut(&(*key, family)) {
                sr.listeners.remove(&token);

                if sr.listeners.is_empty() {
                    let key = *key;
                    self.engine.cancel_where(move |ctx| {
                        matches!(ctx, RequestContext::SearchListen { target, family: f }
                            if *target == key && *f == family)
                    });
                }
            }
        }

        if let Some(storage_token) = entry.storage_token {
            if let Some(storage) = self.storages.get_mut(key) {
                storage.cancel_local_listen(storage_token);
            }
        }

        true
    }

    /// Locally stored values at `key`.
    pub fn get_local(&self, key: &Id, filter: &ValueFilter) -> Vec<Rc<Value>> {
        self.storages
            .get(key)
            .map(|st| st.get(filter))
            .unwrap_or_default()
    }

    pub fn get_local_by_id(&self, key: &Id, vid: ValueId) -> Option<Rc<Value>> {
        self.storages.get(key).and_then(|st| st.get_by_id(vid))
    }

    /// Seed the routing table without pinging; for bootstrapping from
    /// previously known nodes.
    pub fn insert_node(&mut self, id: Id, addr: SocketAddr) -> bool {
        if is_martian(&addr) {
            return false;
        }

        let node = self.cache.get_or_insert(id, addr);
        let now = self.now;

        matches!(
            self.insert_into_table(&node, false, now),
            Insert::Added | Insert::Refreshed
        )
    }

    /// Send a ping to an address we may know nothing about. Returns the
    /// transaction id.
    pub fn ping_node(&mut self, addr: SocketAddr) -> u16 {
        let node = Node::new(Id::ZERO, addr);
        self.engine
            .send_request(&node, RequestKind::Ping, RequestContext::Ping, self.now)
    }

    /// The lower layers report a connectivity change: reverify everything,
    /// re-acquire tokens, refresh listens.
    pub fn connectivity_changed(&mut self) {
        debug!("Connectivity changed");

        self.cache.clear_bad_nodes(None);

        let now = self.now;
        let mut steps = vec![];

        for ((target, family), sr) in self.searches.iter_mut() {
            for node in sr.nodes.iter_mut() {
                node.token = None;
                node.last_get_reply = None;
                node.listen_request = None;
                node.acked.clear();
            }
            sr.update_time = now;
            sr.expired = false;

            if !sr.gets.is_empty() || !sr.announces.is_empty() || !sr.listeners.is_empty() {
                steps.push((*target, *family));
            }
        }

        for (target, family) in steps {
            self.schedule_search_step(target, family, now);
        }

        self.scheduler.edit(self.confirm_job, now);
    }

    /// Cancel every outstanding operation and notify `cb` once drained.
    pub fn shutdown(&mut self, cb: ShutdownCallback) {
        debug!(pending = self.engine.pending_count(), "Shutting down");

        self.shutting_down = true;
        self.engine.cancel_all();

        let mut searches = std::mem::take(&mut self.searches);
        for (_, sr) in searches.iter_mut() {
            if let Some(handle) = sr.step_job.take() {
                self.scheduler.cancel(handle);
            }
            for get in sr.gets.iter_mut() {
                if let Some(done) = get.done.take() {
                    done(false);
                }
            }
            for announce in sr.announces.iter_mut() {
                if let Some(done) = announce.done.take() {
                    done(false);
                }
            }
        }
        self.listens.clear();

        cb();
    }

    // === Persistence ===

    /// Good nodes ordered by most recent activity, for warm restarts.
    pub fn export_nodes(&self) -> Vec<NodeExport> {
        let mut nodes: Vec<Node> = self
            .table4
            .find_closest(&self.myid, usize::MAX)
            .into_iter()
            .chain(self.table6.find_closest(&self.myid, usize::MAX).into_iter())
            .filter(|n| n.is_good(self.now))
            .collect();

        nodes.sort_by(|a, b| b.last_reply().cmp(&a.last_reply()));

        nodes
            .into_iter()
            .map(|n| NodeExport {
                id: n.id(),
                addr: n.addr(),
            })
            .collect()
    }

    /// Serialize every stored value, preserving remaining lifetimes.
    pub fn export_values(&self) -> Vec<(Id, Box<[u8]>)> {
        self.storages
            .iter()
            .filter(|(_, st)| !st.is_empty())
            .filter_map(|(key, st)| {
                let records: Vec<ValueExport> = st
                    .records()
                    .iter()
                    .map(|record| ValueExport {
                        value: (*record.value).clone(),
                        age_secs: self.now.duration_since(record.time.min(self.now)).as_secs(),
                    })
                    .collect();

                match bincode::serialize(&records) {
                    Ok(blob) => Some((*key, blob.into_boxed_slice())),
                    Err(error) => {
                        warn!(%key, %error, "Failed to export values");
                        None
                    }
                }
            })
            .collect()
    }

    /// Restore a previous [Dht::export_values] dump.
    pub fn import_values(&mut self, exports: &[(Id, Box<[u8]>)]) -> Result<()> {
        let local = SocketAddr::from(([127, 0, 0, 1], 0));

        for (key, blob) in exports {
            let records: Vec<ValueExport> = bincode::deserialize(blob)?;

            for record in records {
                let created = self
                    .now
                    .checked_sub(Duration::from_secs(record.age_secs))
                    .unwrap_or(self.now);

                if let Err(error) = self.store_value(*key, Rc::new(record.value), created, local) {
                    debug!(%key, %error, "Skipped imported value");
                }
            }
        }

        Ok(())
    }

    // === Introspection ===

    pub fn routing_table_log(&self, family: Family) -> String {
        self.table(family).log(self.now)
    }

    pub fn storage_log(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(
            out,
            "Storage ({} keys, {} values, {} bytes)",
            self.storages.len(),
            self.total_values,
            self.total_store_size
        );
        for (key, st) in &self.storages {
            let _ = writeln!(
                out,
                "  {}: {} values ({} bytes), {} listeners, {} local",
                key,
                st.value_count(),
                st.total_size(),
                st.listeners.len(),
                st.local_listeners.len()
            );
        }

        out
    }

    pub fn searches_log(&self, family: Family) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "Searches ({family:?})");
        for ((target, f), sr) in &self.searches {
            if *f != family {
                continue;
            }
            let _ = writeln!(
                out,
                "  {}: {} nodes ({} expired){}{}{} gets={} announces={} listeners={}",
                target,
                sr.nodes.len(),
                sr.expired_count(),
                if sr.is_synced(self.now) { " synced" } else { "" },
                if sr.done { " done" } else { "" },
                if sr.expired { " expired" } else { "" },
                sr.gets.len(),
                sr.announces.len(),
                sr.listeners.len(),
            );
        }

        out
    }

    // === Ingress ===

    fn ingest(&mut self, buf: &[u8], from: SocketAddr) -> Result<()> {
        if self.filter.is_blacklisted(&from) || self.blacklist.contains(&from) {
            return Err(Error::BlacklistedAddress(from));
        }
        if is_martian(&from) {
            return Err(Error::MartianAddress(from));
        }

        let message = match self.engine.parse(buf, from) {
            Ok(message) => message,
            Err(error) => {
                // Deliberately garbled traffic gets the source snubbed.
                self.blacklist.put(from, ());
                return Err(error);
            }
        };

        let now = self.now;
        match self.engine.on_message(message, from, &mut self.cache, now) {
            Incoming::Request {
                node,
                tid,
                kind,
                from,
            } => {
                self.handle_request(node, tid, kind, from);
                Ok(())
            }
            Incoming::Event(event) => {
                self.handle_event(event);
                Ok(())
            }
            Incoming::Unmatched {
                tid,
                answer: Some(answer),
                ..
            } if !answer.values.is_empty() => self.handle_listen_push(tid, answer),
            Incoming::Unmatched { tid, .. } => Err(Error::UnexpectedTransactionId(tid)),
        }
    }

    /// An unsolicited values response: route it to the search whose listen
    /// request id matches.
    fn handle_listen_push(&mut self, tid: u16, answer: RequestAnswer) -> Result<()> {
        // A response that failed the address check for an outstanding
        // request is junk, not a listener push.
        if self.engine.is_pending(tid) {
            return Err(Error::UnexpectedTransactionId(tid));
        }

        let Some(key) = self
            .searches
            .iter()
            .find(|(_, sr)| sr.tid == tid && !sr.listeners.is_empty())
            .map(|(key, _)| *key)
        else {
            return Err(Error::UnexpectedTransactionId(tid));
        };

        let Some(mut sr) = self.searches.remove(&key) else {
            return Ok(());
        };

        let values: Vec<Rc<Value>> = answer.values.into_iter().map(Rc::new).collect();
        let cancelled = deliver_values(&mut sr, &values);

        self.searches.insert(key, sr);

        for token in cancelled {
            self.cancel_listen(&key.0, token);
        }

        Ok(())
    }

    // === Server side ===

    fn handle_request(&mut self, node: Node, tid: u16, kind: RequestKind, from: SocketAddr) {
        trace!(from = %node.id(), kind = kind.name(), "Handling request");

        let now = self.now;
        self.insert_into_table(&node, false, now);

        if self.tokens.should_rotate(now) {
            self.tokens.rotate(now);
        }

        match kind {
            RequestKind::Ping => {
                self.engine.respond(from, tid, RequestAnswer::default());
            }
            RequestKind::FindNode { target, want } => {
                let answer = RequestAnswer::default()
                    .with_nodes(self.closer_nodes(&target, want.v4, Family::V4), self.closer_nodes(&target, want.v6, Family::V6));
                self.engine.respond(from, tid, answer);
            }
            RequestKind::GetValues { key, want } => {
                let mut answer = RequestAnswer::default()
                    .with_nodes(self.closer_nodes(&key, want.v4, Family::V4), self.closer_nodes(&key, want.v6, Family::V6));

                if !self.is_bootstrap {
                    answer = answer.with_token(self.tokens.make_token(&from));

                    if let Some(storage) = self.storages.get(&key) {
                        let all = crate::common::accept_all();
                        answer = answer
                            .with_values(storage.get(&all).iter().map(|v| (**v).clone()).collect());
                    }
                }

                self.engine.respond(from, tid, answer);
            }
            RequestKind::Listen { key, token, rid } => {
                if self.is_bootstrap {
                    self.engine
                        .respond_error(from, tid, ERROR_NOT_STORING, "Node does not store");
                    return;
                }
                if !self.tokens.token_match(&token, &from) {
                    debug!(%key, %from, "Listen with wrong token");
                    self.engine
                        .respond_error(from, tid, ERROR_WRONG_TOKEN, "Wrong token");
                    return;
                }
                if !self.storages.contains_key(&key) && self.storages.len() >= MAX_HASHES {
                    self.engine
                        .respond_error(from, tid, ERROR_STORAGE_FULL, "Storage is full");
                    return;
                }

                let storage = self
                    .storages
                    .entry(key)
                    .or_insert_with(|| Storage::new(key, now));
                storage.add_listener(node.id(), from, rid, now);

                self.engine
                    .respond(from, tid, RequestAnswer::default().with_ack_rid(rid));
            }
            RequestKind::AnnounceValues {
                key,
                token,
                values,
                age_secs,
            } => {
                if self.is_bootstrap {
                    self.engine
                        .respond_error(from, tid, ERROR_NOT_STORING, "Node does not store");
                    return;
                }
                if !self.tokens.token_match(&token, &from) {
                    debug!(%key, %from, "Announce with wrong token");
                    self.engine
                        .respond_error(from, tid, ERROR_WRONG_TOKEN, "Wrong token");
                    return;
                }

                let created = self
                    .now
                    .checked_sub(Duration::from_secs(age_secs))
                    .unwrap_or(self.now);

                for value in values {
                    match self.store_value(key, Rc::new(value), created, from) {
                        Ok(_) => {}
                        Err(Error::StorageFull) => {
                            self.engine.respond_error(
                                from,
                                tid,
                                ERROR_STORAGE_FULL,
                                "Storage is full",
                            );
                            return;
                        }
                        Err(error) => {
                            debug!(%key, %error, "Announce refused");
                            return;
                        }
                    }
                }

                self.engine.respond(from, tid, RequestAnswer::default());
            }
        }
    }

    fn closer_nodes(&self, target: &Id, wanted: bool, family: Family) -> Vec<NodeRecord> {
        if !wanted {
            return vec![];
        }

        self.table(family)
            .find_closest(target, TARGET_NODES)
            .into_iter()
            .map(|n| NodeRecord {
                id: n.id(),
                addr: n.addr(),
            })
            .collect()
    }

    // === Storage ===

    /// Store a value under `key`, enforcing the global budget and
    /// notifying listeners on change.
    fn store_value(
        &mut self,
        key: Id,
        value: Rc<Value>,
        created: Instant,
        from: SocketAddr,
    ) -> Result<bool> {
        if self.is_bootstrap {
            return Ok(false);
        }

        if !self.storages.contains_key(&key) && self.storages.len() >= MAX_HASHES {
            return Err(Error::StorageFull);
        }

        let now = self.now;
        let size_left = self.max_store_size as isize - self.total_store_size as isize;

        let storage = self
            .storages
            .entry(key)
            .or_insert_with(|| Storage::new(key, now));

        let outcome = storage.store(value, created.min(now), size_left, &self.types, &from)?;

        self.total_store_size = (self.total_store_size as isize + outcome.size_delta) as usize;
        self.total_values = (self.total_values as isize + outcome.count_delta) as usize;

        match outcome.changed {
            Some(changed) => {
                self.storage_changed(key, changed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Push a changed value to remote listeners (reusing their request id)
    /// and run local listener callbacks synchronously.
    fn storage_changed(&mut self, key: Id, value: Rc<Value>) {
        let Some(storage) = self.storages.get(&key) else {
            return;
        };

        let pushes: Vec<(SocketAddr, u16)> = storage
            .listeners
            .values()
            .map(|l| (l.addr, l.rid))
            .collect();
        let local: Vec<(usize, ValueFilter, GetCallback)> = storage
            .local_listeners
            .iter()
            .map(|(token, l)| (*token, l.filter.clone(), l.cb.clone()))
            .collect();

        for (addr, rid) in pushes {
            trace!(%key, to = %addr, "Pushing value to listener");
            self.engine.respond(
                addr,
                rid,
                RequestAnswer::default()
                    .with_values(vec![(*value).clone()])
                    .with_ack_rid(rid),
            );
        }

        let mut cancelled = vec![];
        for (token, filter, cb) in local {
            if !filter(&value) {
                continue;
            }
            if !(cb.borrow_mut())(&[value.clone()]) {
                cancelled.push(token);
            }
        }

        for storage_token in cancelled {
            // Map the storage token back to its global listen entry.
            let global = self
                .listens
                .iter()
                .find(|(_, e)| e.key == key && e.storage_token == Some(storage_token))
                .map(|(token, _)| *token);

            if let Some(token) = global {
                self.cancel_listen(&key, token);
            } else if let Some(storage) = self.storages.get_mut(&key) {
                storage.cancel_local_listen(storage_token);
            }
        }
    }

    // === Searches ===

    fn announce(
        &mut self,
        key: Id,
        family: Family,
        value: Rc<Value>,
        created: Instant,
        done: Option<DoneCallback>,
    ) {
        let now = self.now;
        let sr = self.ensure_search(key, family);

        if let Some(existing) = sr.announces.iter_mut().find(|a| a.value.id == value.id) {
            existing.value = value;
            existing.created = created;
            if let Some(done) = done {
                existing.done = Some(done);
            }
        } else {
            sr.announces.push(Announce {
                value,
                created,
                done,
            });
        }

        sr.update_time = now;
        sr.done = false;
        self.schedule_search_step(key, family, now);
    }

    /// Find or create the search for `(key, family)`, reviving expired
    /// ones and evicting the oldest finished search at capacity.
    fn ensure_search(&mut self, key: Id, family: Family) -> &mut Search {
        let skey = (key, family);

        if !self.searches.contains_key(&skey) {
            self.evict_searches(family);

            let tid = self.search_tid();
            let now = self.now;
            let mut sr = Search::new(key, family, tid, now);

            for node in self.table(family).find_closest(&key, SEARCH_NODES) {
                sr.insert_candidate(node, now);
            }
            sr.refill_time = Some(now);

            self.searches.insert(skey, sr);
        }

        let sr = self
            .searches
            .get_mut(&skey)
            .expect("search inserted above");

        if sr.expired {
            // Revived by a new operation: give the frontier another go.
            sr.expired = false;
            sr.refill_time = None;
        }

        sr
    }

    fn evict_searches(&mut self, family: Family) {
        let count = self.searches.keys().filter(|(_, f)| *f == family).count();
        if count < MAX_SEARCHES {
            return;
        }

        let victim = self
            .searches
            .iter()
            .filter(|((_, f), _)| *f == family)
            .filter(|(_, sr)| sr.done || sr.expired)
            .min_by_key(|(_, sr)| sr.update_time)
            .map(|(key, _)| *key)
            .or_else(|| {
                self.searches
                    .iter()
                    .filter(|((_, f), _)| *f == family)
                    .min_by_key(|(_, sr)| sr.update_time)
                    .map(|(key, _)| *key)
            });

        if let Some(key) = victim {
            debug!(target = %key.0, "Evicting search");
            if let Some(mut sr) = self.searches.remove(&key) {
                if let Some(handle) = sr.step_job.take() {
                    self.scheduler.cancel(handle);
                }
                finalize_operations(&mut sr);
            }
        }
    }

    fn search_tid(&mut self) -> u16 {
        loop {
            let tid = self.next_search_tid;
            self.next_search_tid = self.next_search_tid.checked_add(1).unwrap_or(1);

            if !self.searches.values().any(|sr| sr.tid == tid) {
                return tid;
            }
        }
    }

    /// Pull the search's step job earlier (or create it).
    fn schedule_search_step(&mut self, target: Id, family: Family, at: Instant) {
        let Some(sr) = self.searches.get_mut(&(target, family)) else {
            return;
        };

        match sr.step_job {
            Some(handle) if self.scheduler.deadline(handle).is_some() => {
                if self.scheduler.deadline(handle).map_or(true, |d| at < d) {
                    self.scheduler.edit(handle, at);
                }
            }
            _ => {
                sr.step_job = Some(self.scheduler.schedule(at, Job::SearchStep { target, family }));
            }
        }
    }

    /// One step of the search state machine; reschedules itself.
    fn search_step(&mut self, target: Id, family: Family) {
        let skey = (target, family);
        let Some(mut sr) = self.searches.remove(&skey) else {
            return;
        };

        if self.shutting_down {
            self.searches.insert(skey, sr);
            return;
        }

        let now = self.now;
        sr.step_job = None;
        sr.step_time = Some(now);

        // 1. Refill a thin or dying frontier from the routing table.
        if !sr.expired {
            let bad = sr.expired_count();
            let thin = sr.nodes.len() < SEARCH_NODES
                || bad > sr.nodes.len().saturating_sub(TARGET_NODES);
            let backoff_over = sr.refill_time.map_or(true, |t| now >= t + REFILL_BACKOFF);

            if thin && backoff_over {
                let mut inserted = 0;
                for node in self.table(family).find_closest(&target, SEARCH_NODES) {
                    if sr.insert_candidate(node, now) {
                        inserted += 1;
                    }
                }
                sr.refill_time = Some(now);
                if inserted > 0 {
                    trace!(%target, ?family, inserted, "Refilled search");
                }
            }
        }

        // 2. Expiry: nothing alive left to talk to.
        if !sr.expired && (sr.all_expired() || sr.nodes.is_empty()) {
            debug!(%target, ?family, "Search expired");
            sr.expired = true;

            for announce in sr.announces.iter_mut() {
                if let Some(done) = announce.done.take() {
                    done(false);
                }
            }
        }

        if !sr.expired {
            if sr.nodes.len() < TARGET_NODES {
                self.search_bootstrap(&mut sr, now);
            }
            self.search_send_gets(&mut sr, now);

            if sr.is_synced(now) {
                self.search_send_announces(&mut sr, now);
                self.search_send_listens(&mut sr, now);
            }
        }

        // 3. Conclude finished gets.
        let mut index = 0;
        while index < sr.gets.len() {
            let finished = sr.gets[index].cancelled || sr.get_done(&sr.gets[index]);

            if finished {
                let mut get = sr.gets.remove(index);
                if let Some(done) = get.done.take() {
                    let delivered = !get.seen.borrow().is_empty();
                    done(delivered || !sr.expired);
                }
            } else {
                index += 1;
            }
        }

        sr.done = sr.gets.is_empty() && sr.announces.is_empty() && sr.listeners.is_empty();

        // 4. Schedule the next step.
        if let Some(next) = sr.next_step_time(&self.types, now) {
            sr.step_job = Some(
                self.scheduler
                    .schedule(next, Job::SearchStep { target, family }),
            );
        }

        self.searches.insert(skey, sr);
    }

    /// Under-populated frontier: ask peers we have not probed yet for
    /// closer nodes. Each node gets one `find_node`; after it answers,
    /// the regular get waves take over.
    fn search_bootstrap(&mut self, sr: &mut Search, now: Instant) {
        let target = sr.target;
        let family = sr.family;
        let want = self.want(family);

        for node in sr.nodes.iter_mut() {
            if node.node.is_expired() {
                continue;
            }
            if node.get_request.as_ref().map_or(false, |t| !t.expired) {
                continue;
            }

            self.engine.send_request(
                &node.node,
                RequestKind::FindNode { target, want },
                RequestContext::SearchFind { target, family },
                now,
            );
            node.get_request = Some(RequestTrace::new(now));
        }
    }

    /// Walk the frontier in distance order sending `get_values`, keeping
    /// at most [TARGET_NODES] in flight.
    fn search_send_gets(&mut self, sr: &mut Search, now: Instant) {
        if sr.get_step_time.map_or(false, |t| now < t + SEARCH_GET_STEP) {
            return;
        }

        let target = sr.target;
        let family = sr.family;
        let want = self.want(family);
        let update = sr.update_time;

        let mut in_flight = sr
            .nodes
            .iter()
            .filter(|n| n.get_request.as_ref().map_or(false, RequestTrace::pending))
            .count();
        let mut sent = 0;

        // Non-candidates first; candidates only when nothing else moves.
        for pass in 0..2 {
            if pass == 1 && (sent > 0 || in_flight > 0) {
                break;
            }

            for index in 0..sr.nodes.len().min(SEARCH_NODES) {
                if in_flight >= TARGET_NODES {
                    break;
                }

                let node = &mut sr.nodes[index];
                if node.candidate != (pass == 1) {
                    continue;
                }
                if !node.can_get(now, update) {
                    continue;
                }

                self.engine.send_request(
                    &node.node,
                    RequestKind::GetValues { key: target, want },
                    RequestContext::SearchGet { target, family },
                    now,
                );
                node.get_request = Some(RequestTrace::new(now));
                in_flight += 1;
                sent += 1;
            }
        }

        if sent > 0 {
            sr.get_step_time = Some(now);
        }
    }

    /// Send announces with the nodes' tokens for every value not yet
    /// acked, honoring per-node re-announce deadlines.
    fn search_send_announces(&mut self, sr: &mut Search, now: Instant) {
        if sr.announces.is_empty() {
            return;
        }

        let target = sr.target;
        let family = sr.family;

        let announces: Vec<(Rc<Value>, Instant, Duration)> = sr
            .announces
            .iter()
            .map(|a| {
                (
                    a.value.clone(),
                    a.created,
                    self.types.get(a.value.type_id).expiration,
                )
            })
            .collect();

        let mut frontier = 0;
        for index in 0..sr.nodes.len() {
            if frontier >= TARGET_NODES {
                break;
            }
            if sr.nodes[index].candidate || sr.nodes[index].node.is_expired() {
                continue;
            }
            frontier += 1;

            for (value, created, expiration) in &announces {
                let node = &mut sr.nodes[index];

                if !node.is_synced(now) {
                    continue;
                }
                if node
                    .acked
                    .get(&value.id)
                    .map_or(false, RequestTrace::pending)
                {
                    continue;
                }
                if node.is_announced(value.id, *expiration, now) {
                    continue;
                }
                if let Some(at) = node.announce_time(value.id, *expiration) {
                    if at > now {
                        continue;
                    }
                }
                let Some(token) = node.token.clone() else {
                    continue;
                };

                trace!(%target, to = %node.node.id(), value = ?value, "Announcing value");

                self.engine.send_request(
                    &node.node,
                    RequestKind::AnnounceValues {
                        key: target,
                        token,
                        values: vec![(**value).clone()],
                        age_secs: now.duration_since(*created).as_secs(),
                    },
                    RequestContext::SearchAnnounce {
                        target,
                        family,
                        value_id: value.id,
                    },
                    now,
                );
                node.acked.insert(value.id, RequestTrace::new(now));
            }
        }
    }

    /// Install or refresh listens on the closest synced nodes.
    fn search_send_listens(&mut self, sr: &mut Search, now: Instant) {
        if sr.listeners.is_empty() {
            return;
        }

        let target = sr.target;
        let family = sr.family;
        let rid = sr.tid;

        let mut installed = 0;
        for index in 0..sr.nodes.len() {
            if installed >= LISTEN_NODES {
                break;
            }

            let node = &mut sr.nodes[index];
            if node.candidate || !node.is_synced(now) {
                continue;
            }
            installed += 1;

            if node
                .listen_request
                .as_ref()
                .map_or(false, RequestTrace::pending)
            {
                continue;
            }
            if node.is_listening(now) {
                if let Some(at) = node.listen_time() {
                    if at > now {
                        continue;
                    }
                }
            }
            let Some(token) = node.token.clone() else {
                continue;
            };

            trace!(%target, to = %node.node.id(), "Installing listen");

            self.engine.send_request(
                &node.node,
                RequestKind::Listen {
                    key: target,
                    token,
                    rid,
                },
                RequestContext::SearchListen { target, family },
                now,
            );
            node.listen_request = Some(RequestTrace::new(now));
        }
    }

    // === Event dispatch ===

    fn handle_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Reply {
                ctx,
                node,
                answer,
                requester_addr,
            } => self.handle_reply(ctx, node, answer, requester_addr),
            NetEvent::ReplyError {
                ctx, node, code, ..
            } => self.handle_reply_error(ctx, node, code),
            NetEvent::Expired { ctx, node } => self.handle_expired(ctx, node),
        }
    }

    fn handle_reply(
        &mut self,
        ctx: RequestContext,
        node: Node,
        answer: RequestAnswer,
        requester_addr: Option<SocketAddr>,
    ) {
        let now = self.now;

        if let Some(addr) = requester_addr {
            self.reported_addr(addr);
        }

        // Absorb every reported peer.
        for record in answer.nodes4.iter().chain(answer.nodes6.iter()) {
            if is_martian(&record.addr) || record.id == self.myid {
                continue;
            }
            let reported = self.cache.get_or_insert(record.id, record.addr);
            self.insert_into_table(&reported, false, now);
        }

        // The responder proved itself.
        self.insert_into_table(&node, true, now);

        match ctx {
            RequestContext::Ping
            | RequestContext::CachedPing { .. }
            | RequestContext::Maintenance { .. } => {}
            RequestContext::SearchFind { target, family }
            | RequestContext::SearchGet { target, family } => {
                let is_get = matches!(ctx, RequestContext::SearchGet { .. });
                self.handle_search_reply(target, family, node, answer, is_get);
            }
            RequestContext::SearchListen { target, family } => {
                if let Some(sr) = self.searches.get_mut(&(target, family)) {
                    if let Some(entry) = sr.node_mut(&node.id()) {
                        if let Some(trace) = entry.listen_request.as_mut() {
                            trace.on_reply(now);
                        }
                    }
                    self.schedule_search_step(target, family, now);
                }
            }
            RequestContext::SearchAnnounce {
                target,
                family,
                value_id,
            } => {
                if let Some(sr) = self.searches.get_mut(&(target, family)) {
                    if let Some(entry) = sr.node_mut(&node.id()) {
                        if let Some(trace) = entry.acked.get_mut(&value_id) {
                            trace.on_reply(now);
                        }
                    }
                    // The first accepted announce completes the put.
                    if let Some(announce) =
                        sr.announces.iter_mut().find(|a| a.value.id == value_id)
                    {
                        if let Some(done) = announce.done.take() {
                            done(true);
                        }
                    }
                    self.schedule_search_step(target, family, now);
                }
            }
        }
    }

    fn handle_search_reply(
        &mut self,
        target: Id,
        family: Family,
        node: Node,
        answer: RequestAnswer,
        is_get: bool,
    ) {
        let skey = (target, family);
        let Some(mut sr) = self.searches.remove(&skey) else {
            return;
        };

        let now = self.now;

        // Promote reported nodes into the frontier.
        let records = match family {
            Family::V4 => &answer.nodes4,
            Family::V6 => &answer.nodes6,
        };
        for record in records {
            if is_martian(&record.addr) || record.id == self.myid {
                continue;
            }
            let reported = self.cache.get_or_insert(record.id, record.addr);
            sr.insert_node(reported, now, None);
        }

        // Record the responder's token and reply.
        sr.insert_node(node.clone(), now, answer.token.clone());
        if let Some(entry) = sr.node_mut(&node.id()) {
            if let Some(trace) = entry.get_request.as_mut() {
                trace.on_reply(now);
            }
        }

        let cancelled = if is_get {
            let values: Vec<Rc<Value>> = answer.values.into_iter().map(Rc::new).collect();
            deliver_values(&mut sr, &values)
        } else {
            vec![]
        };

        self.searches.insert(skey, sr);

        for token in cancelled {
            self.cancel_listen(&target, token);
        }

        self.schedule_search_step(target, family, now);
    }

    fn handle_reply_error(&mut self, ctx: RequestContext, node: Node, code: u16) {
        let now = self.now;

        match ctx {
            RequestContext::SearchAnnounce {
                target,
                family,
                value_id,
            } => {
                if let Some(sr) = self.searches.get_mut(&(target, family)) {
                    if let Some(entry) = sr.node_mut(&node.id()) {
                        match code {
                            ERROR_WRONG_TOKEN => {
                                // Forces a fresh get before the next try.
                                entry.token = None;
                                entry.last_get_reply = None;
                                entry.acked.remove(&value_id);
                            }
                            _ => {
                                // Treat as acked so the retry waits for the
                                // normal re-announce deadline.
                                if let Some(trace) = entry.acked.get_mut(&value_id) {
                                    trace.on_reply(now);
                                }
                            }
                        }
                    }
                    self.schedule_search_step(target, family, now);
                }
            }
            RequestContext::SearchListen { target, family } => {
                if let Some(sr) = self.searches.get_mut(&(target, family)) {
                    if let Some(entry) = sr.node_mut(&node.id()) {
                        if code == ERROR_WRONG_TOKEN {
                            entry.token = None;
                            entry.last_get_reply = None;
                        }
                        entry.listen_request = None;
                    }
                    self.schedule_search_step(target, family, now);
                }
            }
            RequestContext::SearchFind { target, family }
            | RequestContext::SearchGet { target, family } => {
                if let Some(sr) = self.searches.get_mut(&(target, family)) {
                    if let Some(entry) = sr.node_mut(&node.id()) {
                        if let Some(trace) = entry.get_request.as_mut() {
                            trace.on_reply(now);
                        }
                    }
                    self.schedule_search_step(target, family, now);
                }
            }
            RequestContext::Ping
            | RequestContext::CachedPing { .. }
            | RequestContext::Maintenance { .. } => {}
        }
    }

    fn handle_expired(&mut self, ctx: RequestContext, node: Node) {
        let now = self.now;

        match ctx {
            RequestContext::Ping | RequestContext::Maintenance { .. } => {}
            RequestContext::CachedPing { family } => {
                // The dubious occupant died: give its slot to the cached
                // candidate.
                let cached = self.table_mut(family).take_cached(&node.id());
                if let Some(record) = cached {
                    if !is_martian(&record.addr) {
                        let candidate = self.cache.get_or_insert(record.id, record.addr);
                        self.engine.send_request(
                            &candidate,
                            RequestKind::Ping,
                            RequestContext::Ping,
                            now,
                        );
                    }
                }
            }
            RequestContext::SearchFind { target, family }
            | RequestContext::SearchGet { target, family } => {
                if let Some(sr) = self.searches.get_mut(&(target, family)) {
                    if let Some(entry) = sr.node_mut(&node.id()) {
                        if let Some(trace) = entry.get_request.as_mut() {
                            trace.on_expired();
                        }
                    }
                    self.schedule_search_step(target, family, now);
                }
            }
            RequestContext::SearchListen { target, family } => {
                if let Some(sr) = self.searches.get_mut(&(target, family)) {
                    if let Some(entry) = sr.node_mut(&node.id()) {
                        if let Some(trace) = entry.listen_request.as_mut() {
                            trace.on_expired();
                        }
                    }
                    self.schedule_search_step(target, family, now);
                }
            }
            RequestContext::SearchAnnounce {
                target,
                family,
                value_id,
            } => {
                if let Some(sr) = self.searches.get_mut(&(target, family)) {
                    if let Some(entry) = sr.node_mut(&node.id()) {
                        if let Some(trace) = entry.acked.get_mut(&value_id) {
                            trace.on_expired();
                        }
                    }
                    self.schedule_search_step(target, family, now);
                }
            }
        }
    }

    // === Jobs ===

    fn run_job(&mut self, job: Job) {
        match job {
            Job::SearchStep { target, family } => self.search_step(target, family),
            Job::ConfirmNodes => self.confirm_nodes(),
            Job::RotateSecrets => {
                let now = self.now;
                if self.tokens.should_rotate(now) {
                    trace!("Rotating token secrets");
                    self.tokens.rotate(now);
                }
                self.scheduler.schedule(
                    now + crate::tokens::ROTATE_SECRETS_INTERVAL,
                    Job::RotateSecrets,
                );
            }
            Job::Expire => {
                self.expire_storage();
                self.expire_searches();

                let now = self.now;
                let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..10));
                self.scheduler
                    .schedule(now + EXPIRE_SWEEP_INTERVAL + jitter, Job::Expire);
            }
            Job::StorageMaintenance => {
                self.data_persistence();

                let now = self.now;
                self.scheduler
                    .schedule(now + Duration::from_secs(60), Job::StorageMaintenance);
            }
        }
    }

    /// Routing table upkeep: probe quiet buckets and the neighborhood of
    /// the local id, then reschedule at a pace matching the activity.
    fn confirm_nodes(&mut self) {
        let now = self.now;
        let mut sent = 0;

        for family in [Family::V4, Family::V6] {
            let want = self.want(family);

            let mut probes = vec![];
            if let Some(probe) = self.table_mut(family).neighborhood_maintenance(now) {
                probes.push(probe);
            }
            probes.extend(self.table_mut(family).bucket_maintenance(now));

            for probe in probes {
                self.engine.send_request(
                    &probe.node,
                    RequestKind::FindNode {
                        target: probe.target,
                        want,
                    },
                    RequestContext::Maintenance { family },
                    now,
                );
                sent += 1;
            }
        }

        let mut rng = rand::thread_rng();
        let delay = if sent > 0 {
            Duration::from_secs(rng.gen_range(5..25))
        } else {
            Duration::from_secs(rng.gen_range(60..180))
        };

        self.confirm_job = self.scheduler.schedule(now + delay, Job::ConfirmNodes);
    }

    fn expire_storage(&mut self) {
        let now = self.now;
        let types = self.types.clone();

        let mut size_delta = 0_isize;
        let mut count_delta = 0_isize;

        self.storages.retain(|_, storage| {
            let (size, count) = storage.expire(&types, now);
            size_delta += size;
            count_delta += count;

            !storage.is_done()
        });

        self.total_store_size = (self.total_store_size as isize + size_delta) as usize;
        self.total_values = (self.total_values as isize + count_delta) as usize;
    }

    fn expire_searches(&mut self) {
        let now = self.now;

        let stale: Vec<(Id, Family)> = self
            .searches
            .iter()
            .filter(|(_, sr)| {
                let last = sr.step_time.map_or(sr.update_time, |t| t.max(sr.update_time));
                now >= last + SEARCH_EXPIRE_TIME
            })
            .map(|(key, _)| *key)
            .collect();

        for key in stale {
            debug!(target = %key.0, "Dropping idle search");
            if let Some(mut sr) = self.searches.remove(&key) {
                if let Some(handle) = sr.step_job.take() {
                    self.scheduler.cancel(handle);
                }
                finalize_operations(&mut sr);
            }
        }
    }

    /// Re-announce stored values whose key drifted out of our 8-closest
    /// set; this is how values survive node churn.
    fn data_persistence(&mut self) {
        let now = self.now;

        let due: Vec<Id> = self
            .storages
            .iter()
            .filter(|(_, st)| st.maintenance_time <= now && !st.is_empty())
            .map(|(key, _)| *key)
            .collect();

        for key in due {
            if let Some(storage) = self.storages.get_mut(&key) {
                storage.maintenance_time = now + STORAGE_MAINTENANCE_INTERVAL;
            }

            for family in [Family::V4, Family::V6] {
                let closest = self.table(family).find_closest(&key, TARGET_NODES);
                let crowded = closest.len() == TARGET_NODES
                    && closest
                        .last()
                        .map_or(false, |far| far.id().closer_to(&key, &self.myid));

                if !crowded {
                    continue;
                }

                debug!(%key, ?family, "Storage drifted out of responsibility, republishing");

                let records: Vec<(Rc<Value>, Instant)> = self
                    .storages
                    .get(&key)
                    .map(|st| {
                        st.records()
                            .iter()
                            .map(|r| (r.value.clone(), r.time))
                            .collect()
                    })
                    .unwrap_or_default();

                for (value, created) in records {
                    self.announce(key, family, value, created, None);
                }
            }
        }
    }

    // === Nodes ===

    fn table(&self, family: Family) -> &RoutingTable {
        match family {
            Family::V4 => &self.table4,
            Family::V6 => &self.table6,
        }
    }

    fn table_mut(&mut self, family: Family) -> &mut RoutingTable {
        match family {
            Family::V4 => &mut self.table4,
            Family::V6 => &mut self.table6,
        }
    }

    fn want(&self, family: Family) -> Want {
        Want {
            v4: family == Family::V4 || self.table4.node_count() < TARGET_NODES,
            v6: family == Family::V6 || self.table6.node_count() < TARGET_NODES,
        }
    }

    fn insert_into_table(&mut self, node: &Node, confirmed: bool, now: Instant) -> Insert {
        let family = node.family();
        let outcome = self.table_mut(family).add(node, confirmed, now);

        match &outcome {
            Insert::Full { ping: Some(dubious) } => {
                trace!(node = %dubious.id(), "Pinging dubious bucket occupant");
                self.engine.send_request(
                    dubious,
                    RequestKind::Ping,
                    RequestContext::CachedPing { family },
                    now,
                );
            }
            Insert::Added if confirmed => {
                // A confirmed node may improve running searches.
                let mut steps = vec![];
                for ((target, f), sr) in self.searches.iter_mut() {
                    if *f != family || sr.expired || sr.done {
                        continue;
                    }
                    if sr.insert_node(node.clone(), now, None) {
                        steps.push((*target, *f));
                    }
                }
                for (target, family) in steps {
                    self.schedule_search_step(target, family, now);
                }
            }
            _ => {}
        }

        outcome
    }

    /// Tally an address remote peers observed for us; enough distinct
    /// confirmations of a new one imply our connectivity changed.
    fn reported_addr(&mut self, addr: SocketAddr) {
        if is_martian(&addr) {
            return;
        }

        let count = match self.reported_addrs.iter_mut().find(|(_, a)| *a == addr) {
            Some((count, _)) => {
                *count += 1;
                *count
            }
            None => {
                if self.reported_addrs.len() >= REPORTED_ADDRS_MAX {
                    return;
                }
                self.reported_addrs.push((1, addr));
                1
            }
        };

        let slot = match Family::of(&addr) {
            Family::V4 => 0,
            Family::V6 => 1,
        };

        if count >= PUBLIC_ADDRESS_THRESHOLD && self.public_addr[slot] != Some(addr) {
            debug!(%addr, "Public address changed");
            self.public_addr[slot] = Some(addr);
            self.connectivity_changed();
        }
    }
}

/// Deliver values to a search's gets and listeners, deduplicating by
/// value id. Returns the listener tokens whose callbacks cancelled.
fn deliver_values(sr: &mut Search, values: &[Rc<Value>]) -> Vec<usize> {
    let mut cancelled = vec![];

    for get in sr.gets.iter_mut() {
        if get.cancelled {
            continue;
        }

        let fresh: Vec<Rc<Value>> = values
            .iter()
            .filter(|v| (get.filter)(v) && !get.seen.borrow().contains(&v.id))
            .cloned()
            .collect();
        if fresh.is_empty() {
            continue;
        }

        {
            let mut seen = get.seen.borrow_mut();
            for value in &fresh {
                seen.insert(value.id);
            }
        }

        if !(get.cb.borrow_mut())(&fresh) {
            get.cancelled = true;
        }
    }

    for (token, listener) in sr.listeners.iter_mut() {
        let fresh: Vec<Rc<Value>> = values
            .iter()
            .filter(|v| (listener.filter)(v) && !listener.seen.borrow().contains(&v.id))
            .cloned()
            .collect();
        if fresh.is_empty() {
            continue;
        }

        {
            let mut seen = listener.seen.borrow_mut();
            for value in &fresh {
                seen.insert(value.id);
            }
        }

        if !(listener.cb.borrow_mut())(&fresh) {
            cancelled.push(*token);
        }
    }

    cancelled
}

/// Fire the failure callbacks of a search being dropped.
fn finalize_operations(sr: &mut Search) {
    for get in sr.gets.iter_mut() {
        if let Some(done) = get.done.take() {
            let delivered = !get.seen.borrow().is_empty();
            done(delivered);
        }
    }
    for announce in sr.announces.iter_mut() {
        if let Some(done) = announce.done.take() {
            done(false);
        }
    }
}

/// `done` combinator for gets: fires after both family searches conclude,
/// successful if either was.
fn split_done_all(done: Option<DoneCallback>) -> (DoneCallback, DoneCallback) {
    struct State {
        remaining: u8,
        ok: bool,
        done: Option<DoneCallback>,
    }

    let state = Rc::new(RefCell::new(State {
        remaining: 2,
        ok: false,
        done,
    }));

    let make = |state: Rc<RefCell<State>>| -> DoneCallback {
        Box::new(move |success| {
            let mut state = state.borrow_mut();
            state.ok |= success;
            state.remaining -= 1;
            if state.remaining == 0 {
                let ok = state.ok;
                if let Some(done) = state.done.take() {
                    drop(state);
                    done(ok);
                }
            }
        })
    };

    (make(state.clone()), make(state))
}

/// `done` combinator for puts: fires on the first success, or with
/// `false` once both families failed.
fn split_done_any(done: Option<DoneCallback>) -> (DoneCallback, DoneCallback) {
    struct State {
        failures: u8,
        done: Option<DoneCallback>,
    }

    let state = Rc::new(RefCell::new(State { failures: 0, done }));

    let make = |state: Rc<RefCell<State>>| -> DoneCallback {
        Box::new(move |success| {
            let mut state = state.borrow_mut();
            if success {
                if let Some(done) = state.done.take() {
                    drop(state);
                    done(true);
                }
            } else {
                state.failures += 1;
                if state.failures == 2 {
                    if let Some(done) = state.done.take() {
                        drop(state);
                        done(false);
                    }
                }
            }
        })
    };

    (make(state.clone()), make(state))
}

/// Addresses no legitimate peer can use.
fn is_martian(addr: &SocketAddr) -> bool {
    if addr.port() == 0 {
        return true;
    }

    match addr.ip() {
        IpAddr::V4(ip) => ip.is_unspecified() || ip.is_multicast() || ip.is_broadcast(),
        IpAddr::V6(ip) => ip.is_unspecified() || ip.is_multicast(),
    }
}
