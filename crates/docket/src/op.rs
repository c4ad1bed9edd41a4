//! Reversible edits.
//!
//! An operation is built against its live sender. Before the history records
//! it, [AtomicOperation::prepare] swaps the sender for its path below the
//! history root, so the log can outlive the objects it was built from.

use std::{any::Any, borrow::Cow, fmt::Debug, marker::PhantomData, sync::Arc};

use docket_common::{DocError, DocResult, NodePath, TxnId};
use enum_as_inner::EnumAsInner;

use crate::{
    collection::Collection,
    node::{Node, NodeRef},
    path::{downcast_node, path_from, path_of, resolve, resolve_as},
    persist::NodeType,
    record::{Record, Schema},
    txn::Transaction,
    value::{CellValue, ValueCell},
};

/// What an operation needs to find its target while it runs.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    root: Option<NodeRef>,
}

impl OpContext {
    pub fn new(root: Option<NodeRef>) -> Self {
        Self { root }
    }

    /// A context without a root. Only live targets can be applied with it.
    pub fn detached() -> Self {
        Self { root: None }
    }

    pub fn root(&self) -> DocResult<&NodeRef> {
        self.root.as_ref().ok_or(DocError::NoRoot)
    }

    pub fn resolve(&self, path: &NodePath) -> DocResult<NodeRef> {
        resolve(self.root()?, path)
    }

    pub fn resolve_as<T: Node>(&self, path: &NodePath) -> DocResult<Arc<T>> {
        resolve_as(self.root()?, path)
    }

    pub fn path_of(&self, node: &dyn Node) -> DocResult<NodePath> {
        path_from(&**self.root()?, node)
    }
}

/// A minimal reversible edit.
///
/// `apply` and `revert` must be exact inverses given the state right before
/// the forward call.
pub trait AtomicOperation: Send + Sync + Debug + 'static {
    fn name(&self) -> Cow<'_, str>;

    /// Drops every live reference the operation was built with.
    fn prepare(&mut self, _cx: &OpContext) -> DocResult<()> {
        Ok(())
    }

    fn is_valid_for_history(&self) -> bool {
        true
    }

    fn apply(&self, cx: &OpContext) -> DocResult<()>;

    fn revert(&self, cx: &OpContext) -> DocResult<()>;

    /// Only transactions carry an id.
    fn id(&self) -> Option<TxnId> {
        None
    }

    fn as_transaction(&self) -> Option<&Transaction> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// The node a document operation edits.
///
/// `Live` before the operation is prepared, `Path` afterwards. Never both.
#[derive(Debug, Clone, EnumAsInner)]
pub enum OpTarget {
    Live(NodeRef),
    Path(NodePath),
}

impl OpTarget {
    pub fn prepare(&mut self, cx: &OpContext) -> DocResult<()> {
        if let OpTarget::Live(node) = self {
            let path = cx.path_of(&**node)?;
            *self = OpTarget::Path(path);
        }

        Ok(())
    }

    pub fn resolve_as<T: Node>(&self, cx: &OpContext) -> DocResult<Arc<T>> {
        match self {
            OpTarget::Live(node) => downcast_node(node.clone(), &path_of(&**node)),
            OpTarget::Path(path) => cx.resolve_as(path),
        }
    }
}

/// Assigns a [ValueCell].
#[derive(Debug, Clone)]
pub struct SetValueOp<T: CellValue> {
    target: OpTarget,
    old: T,
    new: T,
}

impl<T: CellValue> SetValueOp<T> {
    pub fn new(sender: NodeRef, old: T, new: T) -> Self {
        Self {
            target: OpTarget::Live(sender),
            old,
            new,
        }
    }

    pub fn target(&self) -> &OpTarget {
        &self.target
    }

    pub fn old(&self) -> &T {
        &self.old
    }

    pub fn new_value(&self) -> &T {
        &self.new
    }
}

impl<T: CellValue> AtomicOperation for SetValueOp<T> {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed("Set value")
    }

    fn prepare(&mut self, cx: &OpContext) -> DocResult<()> {
        self.target.prepare(cx)
    }

    fn is_valid_for_history(&self) -> bool {
        self.target.is_path()
    }

    fn apply(&self, cx: &OpContext) -> DocResult<()> {
        let cell = self.target.resolve_as::<ValueCell<T>>(cx)?;
        cell.force_set(self.new.clone());
        Ok(())
    }

    fn revert(&self, cx: &OpContext) -> DocResult<()> {
        let cell = self.target.resolve_as::<ValueCell<T>>(cx)?;
        cell.force_set(self.old.clone());
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListOpKind {
    Insert,
    Remove,
}

/// Inserts or removes one item of a [Collection].
///
/// The item itself is kept so undo and redo put back the very same node.
#[derive(Debug)]
pub struct ListOp<T: NodeType> {
    target: OpTarget,
    kind: ListOpKind,
    index: usize,
    item: Arc<T>,
}

impl<T: NodeType> ListOp<T> {
    pub fn insert(sender: NodeRef, index: usize, item: Arc<T>) -> Self {
        Self {
            target: OpTarget::Live(sender),
            kind: ListOpKind::Insert,
            index,
            item,
        }
    }

    pub fn remove(sender: NodeRef, index: usize, item: Arc<T>) -> Self {
        Self {
            target: OpTarget::Live(sender),
            kind: ListOpKind::Remove,
            index,
            item,
        }
    }

    pub fn kind(&self) -> ListOpKind {
        self.kind
    }

    pub fn is_insert(&self) -> bool {
        self.kind == ListOpKind::Insert
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn item(&self) -> &Arc<T> {
        &self.item
    }

    pub fn target(&self) -> &OpTarget {
        &self.target
    }

    fn run(&self, cx: &OpContext, kind: ListOpKind) -> DocResult<()> {
        let list = self.target.resolve_as::<Collection<T>>(cx)?;
        match kind {
            ListOpKind::Insert => list.raw_insert(self.index, self.item.clone()),
            ListOpKind::Remove => list.raw_remove(self.index, &self.item),
        }
    }
}

impl<T: NodeType> AtomicOperation for ListOp<T> {
    fn name(&self) -> Cow<'_, str> {
        match self.kind {
            ListOpKind::Insert => Cow::Borrowed("Insert item"),
            ListOpKind::Remove => Cow::Borrowed("Remove item"),
        }
    }

    fn prepare(&mut self, cx: &OpContext) -> DocResult<()> {
        self.target.prepare(cx)
    }

    fn is_valid_for_history(&self) -> bool {
        self.target.is_path()
    }

    fn apply(&self, cx: &OpContext) -> DocResult<()> {
        self.run(cx, self.kind)
    }

    fn revert(&self, cx: &OpContext) -> DocResult<()> {
        let inverse = match self.kind {
            ListOpKind::Insert => ListOpKind::Remove,
            ListOpKind::Remove => ListOpKind::Insert,
        };
        self.run(cx, inverse)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Replaces the node held by a [Child](crate::record::Child) slot of a [Record].
///
/// Both nodes are kept, so undo puts the old node back under the slot name.
#[derive(Debug)]
pub struct SetChildOp<S: Schema> {
    target: OpTarget,
    slot: &'static str,
    old: Option<NodeRef>,
    new: Option<NodeRef>,
    _schema: PhantomData<fn() -> S>,
}

impl<S: Schema> SetChildOp<S> {
    pub fn new(
        sender: NodeRef,
        slot: &'static str,
        old: Option<NodeRef>,
        new: Option<NodeRef>,
    ) -> Self {
        Self {
            target: OpTarget::Live(sender),
            slot,
            old,
            new,
            _schema: PhantomData,
        }
    }

    pub fn target(&self) -> &OpTarget {
        &self.target
    }

    pub fn slot(&self) -> &'static str {
        self.slot
    }

    pub fn old(&self) -> Option<&NodeRef> {
        self.old.as_ref()
    }

    pub fn new_node(&self) -> Option<&NodeRef> {
        self.new.as_ref()
    }
}

impl<S: Schema> AtomicOperation for SetChildOp<S> {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed("Set child")
    }

    fn prepare(&mut self, cx: &OpContext) -> DocResult<()> {
        self.target.prepare(cx)
    }

    fn is_valid_for_history(&self) -> bool {
        self.target.is_path()
    }

    fn apply(&self, cx: &OpContext) -> DocResult<()> {
        let record = self.target.resolve_as::<Record<S>>(cx)?;
        record.raw_set_child(self.slot, self.old.as_ref(), self.new.clone())
    }

    fn revert(&self, cx: &OpContext) -> DocResult<()> {
        let record = self.target.resolve_as::<Record<S>>(cx)?;
        record.raw_set_child(self.slot, self.new.as_ref(), self.old.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
