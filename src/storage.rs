//! Per-key value storage: expiry, listeners, memory accounting.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::common::{GetCallback, Id, TypeRegistry, Value, ValueFilter, ValueId};
use crate::{Error, Result};

/// Remote listeners expire this long after their last refresh.
pub const LISTEN_EXPIRE_TIME: Duration = Duration::from_secs(30);
/// How often a storage re-checks that this node is still responsible
/// for its key.
pub const STORAGE_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Most values a single key will hold.
pub const MAX_VALUES_PER_KEY: usize = 2048;
/// Most keys tracked before new stores are refused.
pub const MAX_HASHES: usize = 16384;

#[derive(Debug, Clone)]
pub(crate) struct StoredValue {
    pub value: Rc<Value>,
    /// Creation time, driving expiry together with the type's expiration.
    pub time: Instant,
}

#[derive(Debug, Clone)]
/// A remote peer asking to be told about changes under a key.
pub(crate) struct RemoteListener {
    pub addr: SocketAddr,
    /// Request id the peer correlates unsolicited pushes with.
    pub rid: u16,
    pub time: Instant,
}

/// A local subscription; the callback runs synchronously on changes.
pub(crate) struct LocalListener {
    pub filter: ValueFilter,
    pub cb: GetCallback,
}

#[derive(Debug, Default, PartialEq)]
/// What a store changed, so the caller can maintain global accounting.
pub(crate) struct StoreOutcome {
    /// The stored value if anything actually changed.
    pub changed: Option<Rc<Value>>,
    pub size_delta: isize,
    pub count_delta: isize,
}

/// Values and listeners for one key.
pub(crate) struct Storage {
    pub key: Id,
    values: Vec<StoredValue>,
    pub listeners: BTreeMap<Id, RemoteListener>,
    pub local_listeners: BTreeMap<usize, LocalListener>,
    next_listener_token: usize,
    /// When to next check whether this node still belongs to the key's
    /// closest set.
    pub maintenance_time: Instant,
    total_size: usize,
}

impl Storage {
    pub fn new(key: Id, now: Instant) -> Self {
        Storage {
            key,
            values: vec![],
            listeners: BTreeMap::new(),
            local_listeners: BTreeMap::new(),
            next_listener_token: 1,
            maintenance_time: now + STORAGE_MAINTENANCE_INTERVAL,
            total_size: 0,
        }
    }

    // === Getters ===

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn records(&self) -> &[StoredValue] {
        &self.values
    }

    pub fn get(&self, filter: &ValueFilter) -> Vec<Rc<Value>> {
        self.values
            .iter()
            .filter(|v| filter(&v.value))
            .map(|v| v.value.clone())
            .collect()
    }

    pub fn get_by_id(&self, vid: ValueId) -> Option<Rc<Value>> {
        self.values
            .iter()
            .find(|v| v.value.id == vid)
            .map(|v| v.value.clone())
    }

    // === Public Methods ===

    /// Store a new value or replace the one sharing its id, within
    /// `size_left` bytes of remaining budget.
    ///
    /// A same-id store with identical content refreshes the creation time
    /// but reports no change, so listeners stay quiet.
    pub fn store(
        &mut self,
        value: Rc<Value>,
        created: Instant,
        size_left: isize,
        types: &TypeRegistry,
        from: &SocketAddr,
    ) -> Result<StoreOutcome> {
        let key = self.key;

        if let Some(existing) = self.values.iter_mut().find(|v| v.value.id == value.id) {
            if *existing.value == *value {
                existing.time = existing.time.max(created);
                return Ok(StoreOutcome::default());
            }

            let vtype = types.get(value.type_id);
            if !(vtype.edit_policy)(&key, &existing.value, &value, from) {
                debug!(key = %key, value = ?value, "Edit policy refused value");
                return Ok(StoreOutcome::default());
            }

            let size_delta = value.size() as isize - existing.value.size() as isize;
            if size_delta > size_left {
                return Err(Error::StorageFull);
            }

            self.total_size = (self.total_size as isize + size_delta) as usize;
            existing.value = value.clone();
            existing.time = created;

            return Ok(StoreOutcome {
                changed: Some(value),
                size_delta,
                count_delta: 0,
            });
        }

        let vtype = types.get(value.type_id);
        if !(vtype.store_policy)(&key, &value, from) {
            debug!(key = %key, value = ?value, "Store policy refused value");
            return Ok(StoreOutcome::default());
        }

        let size = value.size() as isize;
        if size > size_left || self.values.len() >= MAX_VALUES_PER_KEY {
            return Err(Error::StorageFull);
        }

        self.total_size += value.size();
        self.values.push(StoredValue {
            value: value.clone(),
            time: created,
        });

        Ok(StoreOutcome {
            changed: Some(value),
            size_delta: size,
            count_delta: 1,
        })
    }

    /// Register or refresh the remote listener of `node_id`.
    pub fn add_listener(&mut self, node_id: Id, addr: SocketAddr, rid: u16, now: Instant) {
        self.listeners
            .insert(node_id, RemoteListener { addr, rid, time: now });
    }

    pub fn local_listen(&mut self, filter: ValueFilter, cb: GetCallback) -> usize {
        let token = self.next_listener_token;
        self.next_listener_token += 1;

        self.local_listeners.insert(token, LocalListener { filter, cb });

        token
    }

    pub fn cancel_local_listen(&mut self, token: usize) -> bool {
        self.local_listeners.remove(&token).is_some()
    }

    /// Drop expired values and stale remote listeners. Returns the (size,
    /// count) deltas, both non-positive.
    pub fn expire(&mut self, types: &TypeRegistry, now: Instant) -> (isize, isize) {
        let mut size_delta = 0_isize;
        let mut count_delta = 0_isize;

        self.values.retain(|v| {
            let expires = v.time + types.get(v.value.type_id).expiration;
            if expires <= now {
                debug!(key = %self.key, value = ?v.value, "Value expired");
                size_delta -= v.value.size() as isize;
                count_delta -= 1;
                false
            } else {
                true
            }
        });
        self.total_size = (self.total_size as isize + size_delta) as usize;

        self.listeners
            .retain(|_, l| now < l.time + LISTEN_EXPIRE_TIME);

        (size_delta, count_delta)
    }

    /// The storage can be evicted: nothing stored, nobody subscribed.
    pub fn is_done(&self) -> bool {
        self.values.is_empty() && self.listeners.is_empty() && self.local_listeners.is_empty()
    }
}
