//! Values stored on the network and the type policies arbitrating them.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::common::Id;

/// Identifier of a value within a key, unique per storage.
pub type ValueId = u64;
/// Identifier of a registered [ValueType].
pub type TypeId = u16;

#[derive(Clone, PartialEq, Serialize, Deserialize)]
/// A small piece of data stored at a key.
///
/// The `owner`, `signature` and `recipient` fields are opaque to the core;
/// signing and encryption are the embedder's concern.
pub struct Value {
    pub id: ValueId,
    pub type_id: TypeId,
    pub data: Bytes,
    /// Opaque public key of the value owner, if signed.
    pub owner: Option<Box<[u8]>>,
    /// Opaque signature blob.
    pub signature: Option<Box<[u8]>>,
    /// Target node id for encrypted values.
    pub recipient: Option<Id>,
}

impl Value {
    /// Creates an unsigned value with a random non-zero id.
    pub fn new(type_id: TypeId, data: impl Into<Bytes>) -> Value {
        Value {
            id: loop {
                let id = rand::random();
                if id != 0 {
                    break id;
                }
            },
            type_id,
            data: data.into(),
            owner: None,
            signature: None,
            recipient: None,
        }
    }

    pub fn with_id(mut self, id: ValueId) -> Value {
        self.id = id;
        self
    }

    /// Memory accounted against the storage budget.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Value(id={:016x}, type={}, {} bytes)",
            self.id,
            self.type_id,
            self.data.len()
        )
    }
}

/// Prefilter applied to values before they reach a callback.
pub type ValueFilter = Rc<dyn Fn(&Value) -> bool>;

/// A filter accepting every value.
pub fn accept_all() -> ValueFilter {
    Rc::new(|_| true)
}

/// Decides whether a new value may be stored at a key.
/// Arguments: key, candidate value, source address.
pub type StorePolicy = Rc<dyn Fn(&Id, &Value, &SocketAddr) -> bool>;

/// Decides whether an incoming value may replace a stored one with the
/// same value id. Arguments: key, stored value, candidate, source address.
pub type EditPolicy = Rc<dyn Fn(&Id, &Value, &Value, &SocketAddr) -> bool>;

#[derive(Clone)]
/// Registered policy object driving expiry and acceptance of values.
pub struct ValueType {
    pub id: TypeId,
    pub name: &'static str,
    /// Values of this type are garbage collected this long after insertion.
    pub expiration: Duration,
    pub store_policy: StorePolicy,
    pub edit_policy: EditPolicy,
}

impl ValueType {
    /// The implicit type of unregistered values: id 0, 10 minute expiry,
    /// accept-all policies.
    pub fn user_data() -> ValueType {
        ValueType::new(0, "USER_DATA", Duration::from_secs(10 * 60))
    }

    pub fn new(id: TypeId, name: &'static str, expiration: Duration) -> ValueType {
        ValueType {
            id,
            name,
            expiration,
            store_policy: Rc::new(|_, _, _| true),
            edit_policy: Rc::new(|_, _, _, _| true),
        }
    }

    pub fn with_store_policy(mut self, policy: StorePolicy) -> ValueType {
        self.store_policy = policy;
        self
    }

    pub fn with_edit_policy(mut self, policy: EditPolicy) -> ValueType {
        self.edit_policy = policy;
        self
    }
}

impl Debug for ValueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ValueType({}, {:?})", self.id, self.name)
    }
}

#[derive(Debug, Clone)]
/// Value types known to the node, keyed by type id.
pub struct TypeRegistry {
    types: BTreeMap<TypeId, ValueType>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry {
            types: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, value_type: ValueType) {
        self.types.insert(value_type.id, value_type);
    }

    /// The type registered under `id`, or the USER_DATA fallback.
    pub fn get(&self, id: TypeId) -> ValueType {
        self.types
            .get(&id)
            .cloned()
            .unwrap_or_else(ValueType::user_data)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn value_ids_are_non_zero() {
        for _ in 0..64 {
            assert_ne!(Value::new(0, "payload").id, 0);
        }
    }

    #[test]
    fn registry_falls_back_to_user_data() {
        let mut registry = TypeRegistry::new();
        registry.register(ValueType::new(7, "IM_MESSAGE", Duration::from_secs(60)));

        assert_eq!(registry.get(7).name, "IM_MESSAGE");
        assert_eq!(registry.get(42).name, "USER_DATA");
    }

    #[test]
    fn policies_are_respected_defaults() {
        let vtype = ValueType::user_data();
        let key = Id::random();
        let value = Value::new(0, "x");
        let from = SocketAddr::from(([127, 0, 0, 1], 1));

        assert!((vtype.store_policy)(&key, &value, &from));
        assert!((vtype.edit_policy)(&key, &value, &value, &from));
    }
}
