//! Types shared across the engine: ids, nodes, values, messages.

pub mod id;
pub mod messages;
pub mod node;
pub mod value;

use std::cell::RefCell;
use std::rc::Rc;

pub use id::{Id, ID_BITS, ID_SIZE};
pub use node::{Family, Node, NodeCache, MAX_RESPONSE_TIME, NODE_EXPIRE_TIME, NODE_GOOD_TIME};
pub use value::{
    accept_all, EditPolicy, StorePolicy, TypeId, TypeRegistry, Value, ValueFilter, ValueId,
    ValueType,
};

/// Streaming callback for values found on the network. Returning `false`
/// cancels the operation.
pub type GetCallback = Rc<RefCell<dyn FnMut(&[Rc<Value>]) -> bool>>;

/// Completion callback; fires exactly once per operation.
pub type DoneCallback = Box<dyn FnOnce(bool)>;

/// Callback invoked when a shutdown has drained outstanding operations.
pub type ShutdownCallback = Box<dyn FnOnce()>;

/// Wraps a plain closure into a [GetCallback].
pub fn get_callback(cb: impl FnMut(&[Rc<Value>]) -> bool + 'static) -> GetCallback {
    Rc::new(RefCell::new(cb))
}
