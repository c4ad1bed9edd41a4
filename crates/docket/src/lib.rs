//! An in-process document model with transactional undo/redo.
//!
//! A document is a tree of [Node]s: [ValueCell]s hold single values,
//! [Collection]s hold ordered items and [Record]s hold schema-declared slots.
//! Once the top of a tree is set as the root of a [History], every edit made
//! through the tree is recorded as a reversible operation:
//!
//! ```ignore
//! let history = History::new();
//! let list = Collection::<ValueCell<i32>>::new();
//! history.set_root(list.clone())?;
//! list.push(ValueCell::new(1))?;
//! list.get(0).unwrap().set(2)?;
//! history.undo()?;
//! assert_eq!(list.get(0).unwrap().get(), 1);
//! ```
//!
//! Edits made on a tree that is not rooted at a history are applied directly
//! and leave no trace.
#![warn(rustdoc::broken_intra_doc_links)]

pub mod collection;
pub mod configure;
pub mod history;
pub mod node;
pub mod observer;
pub mod op;
pub mod path;
pub mod persist;
pub mod record;
pub mod txn;
pub mod value;

pub use collection::{Collection, CollectionEvent, CollectionMode, ListChange};
pub use configure::{HistoryOptions, ThreadCheck};
pub use docket_common::{
    parse_index, DocError, DocResult, InternalString, NodePath, NodeUid, TxnId,
    COUNTER_SEGMENT, PATH_SEPARATOR,
};
pub use history::{History, HistoryEvent};
pub use node::{same_node, Node, NodeCore, NodeKind, NodeRef, WeakNodeRef};
pub use observer::{Coalesce, Delivery, Observers, Subscription};
pub use op::{AtomicOperation, ListOp, ListOpKind, OpContext, OpTarget, SetChildOp, SetValueOp};
pub use path::{is_in_history_tree, path_from, path_of, resolve, resolve_as};
pub use persist::{serialize, Element, NodeType, Reference, Registry, SerializeCx};
pub use record::{Child, ChildSlot, Owned, Record, Ref, RefSlot, Schema, Slot, SlotReader};
pub use txn::Transaction;
pub use value::{CellValue, Equality, TxnIdMode, ValueCell, ValueEvent};
