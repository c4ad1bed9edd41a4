//! Ordered sequences of nodes.
//!
//! Items of an owning collection are children: they are named by their index
//! and linked back to the collection. A foreign collection only points at
//! nodes owned elsewhere; it never touches their parent links and path
//! resolution does not descend into it.
//!
//! Every structural edit is bracketed by an increment and a decrement of the
//! collection's counter cell (path segment `-1`), so one multi-item edit is
//! observable as a unit even though it is recorded as several operations.

use std::{
    any::Any,
    borrow::Cow,
    fmt::Debug,
    ops::Range,
    sync::{Arc, Weak},
};

use docket_common::{parse_index, DocError, DocResult, InternalString, COUNTER_SEGMENT};
use parking_lot::Mutex;
use smallvec::{smallvec, SmallVec};

use crate::{
    history::History,
    node::{Node, NodeCore, NodeKind, NodeRef, WeakNodeRef},
    observer::{Coalesce, Delivery, Observers, Subscription},
    op::{AtomicOperation, ListOp, OpContext},
    path::resolve_as,
    persist::{Element, NodeType, Reference, SerializeCx},
    value::{TxnIdMode, ValueCell},
};

const FOREIGN_MARKER: &str = "foreign";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CollectionMode {
    #[default]
    Owning,
    /// Reference only: items keep their own parents.
    Foreign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListChange {
    Insert { index: usize, len: usize },
    Remove { index: usize, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionEvent {
    pub changes: SmallVec<[ListChange; 1]>,
}

impl CollectionEvent {
    fn single(change: ListChange) -> Self {
        Self {
            changes: smallvec![change],
        }
    }
}

impl Coalesce for CollectionEvent {
    fn coalesce(&mut self, later: Self) {
        for change in later.changes {
            let merged = match (self.changes.last_mut(), change) {
                (
                    Some(ListChange::Insert { index, len }),
                    ListChange::Insert {
                        index: next,
                        len: more,
                    },
                ) if next == *index + *len => {
                    *len += more;
                    true
                }
                (
                    Some(ListChange::Remove { index, len }),
                    ListChange::Remove {
                        index: next,
                        len: more,
                    },
                ) if next == *index || next + more == *index => {
                    *index = next.min(*index);
                    *len += more;
                    true
                }
                _ => false,
            };
            if !merged {
                self.changes.push(change);
            }
        }
    }
}

#[derive(Default)]
struct CollectionConfig {
    txn_mode: TxnIdMode,
    label: Option<InternalString>,
}

pub struct Collection<T: NodeType> {
    core: NodeCore,
    mode: CollectionMode,
    items: Mutex<Vec<Arc<T>>>,
    counter: Arc<ValueCell<i32>>,
    config: Mutex<CollectionConfig>,
    observers: Observers<CollectionEvent>,
}

impl<T: NodeType> Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.core.name())
            .field("mode", &self.mode)
            .field("items", &*self.items.lock())
            .finish()
    }
}

impl<T: NodeType> Collection<T> {
    pub fn new() -> Arc<Self> {
        Self::with_mode(CollectionMode::Owning)
    }

    pub fn foreign() -> Arc<Self> {
        Self::with_mode(CollectionMode::Foreign)
    }

    pub fn with_mode(mode: CollectionMode) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let this: WeakNodeRef = this.clone();
            let core = NodeCore::new(this);
            let counter = ValueCell::new(0);
            counter.core().adopt(&core, COUNTER_SEGMENT);
            Self {
                core,
                mode,
                items: Mutex::new(Vec::new()),
                counter,
                config: Mutex::new(CollectionConfig::default()),
                observers: Observers::new(),
            }
        })
    }

    pub fn mode(&self) -> CollectionMode {
        self.mode
    }

    pub fn is_foreign(&self) -> bool {
        self.mode == CollectionMode::Foreign
    }

    /// Structural edits in progress. Zero outside of an edit.
    pub fn counter(&self) -> &Arc<ValueCell<i32>> {
        &self.counter
    }

    pub fn set_txn_mode(&self, mode: TxnIdMode) {
        self.config.lock().txn_mode = mode;
    }

    pub fn set_label(&self, label: impl Into<InternalString>) {
        self.config.lock().label = Some(label.into());
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Arc<T>> {
        self.items.lock().get(index).cloned()
    }

    pub fn to_vec(&self) -> Vec<Arc<T>> {
        self.items.lock().clone()
    }

    /// Iterates over a snapshot of the items.
    pub fn iter(&self) -> impl Iterator<Item = Arc<T>> {
        self.to_vec().into_iter()
    }

    pub fn position(&self, item: &Arc<T>) -> Option<usize> {
        self.items.lock().iter().position(|x| Arc::ptr_eq(x, item))
    }

    pub fn subscribe(
        &self,
        delivery: Delivery,
        callback: impl Fn(&CollectionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.observers.subscribe(delivery, callback)
    }

    pub fn push(&self, item: Arc<T>) -> DocResult<()> {
        let len = self.len();
        self.insert_many(len, [item])
    }

    pub fn insert(&self, index: usize, item: Arc<T>) -> DocResult<()> {
        self.insert_many(index, [item])
    }

    /// Inserts `items` at `index`, recorded as one insert per item in forward
    /// order.
    pub fn insert_many(
        &self,
        index: usize,
        items: impl IntoIterator<Item = Arc<T>>,
    ) -> DocResult<()> {
        let items: Vec<Arc<T>> = items.into_iter().collect();
        if items.is_empty() {
            return Ok(());
        }

        self.check_insert(index, &items)?;
        let this = self.this()?;
        self.batch(|history| {
            for (i, item) in items.into_iter().enumerate() {
                submit(history, ListOp::insert(this.clone(), index + i, item))?;
            }
            Ok(())
        })
    }

    pub fn remove(&self, index: usize) -> DocResult<Arc<T>> {
        let end = index.checked_add(1).ok_or(DocError::OutOfBound {
            pos: index,
            len: self.len(),
        })?;
        let mut removed = self.remove_range(index..end)?;
        removed
            .pop()
            .ok_or(DocError::OutOfBound { pos: index, len: self.len() })
    }

    /// Removes the items in `range`, recorded as one removal per item from the
    /// tail to the head, so every recorded index stays valid on replay.
    pub fn remove_range(&self, range: Range<usize>) -> DocResult<Vec<Arc<T>>> {
        let removed = {
            let items = self.items.lock();
            if range.start > range.end || range.end > items.len() {
                return Err(DocError::OutOfBound {
                    pos: range.end,
                    len: items.len(),
                });
            }
            items[range.clone()].to_vec()
        };
        if removed.is_empty() {
            return Ok(removed);
        }

        let this = self.this()?;
        let start = range.start;
        self.batch(|history| {
            for (offset, item) in removed.iter().enumerate().rev() {
                let op = ListOp::remove(this.clone(), start + offset, item.clone());
                submit(history, op)?;
            }
            Ok(())
        })?;
        Ok(removed)
    }

    /// Removes `item`, failing when it is not in this collection.
    pub fn remove_item(&self, item: &Arc<T>) -> DocResult<usize> {
        let index = self.position(item).ok_or_else(|| {
            DocError::not_found(format!(
                "{} in collection {}",
                item.core().describe(),
                self.core.describe()
            ))
        })?;
        self.remove(index)?;
        Ok(index)
    }

    /// Removes every item. Does nothing at all on an empty collection.
    pub fn clear(&self) -> DocResult<()> {
        let len = self.len();
        if len == 0 {
            return Ok(());
        }

        self.remove_range(0..len).map(|_| ())
    }

    fn this(&self) -> DocResult<NodeRef> {
        self.core
            .this()
            .ok_or_else(|| DocError::not_found(self.core.describe()))
    }

    fn check_insert(&self, index: usize, new_items: &[Arc<T>]) -> DocResult<()> {
        let items = self.items.lock();
        if index > items.len() {
            return Err(DocError::OutOfBound {
                pos: index,
                len: items.len(),
            });
        }

        if self.is_foreign() {
            return Ok(());
        }

        for (i, item) in new_items.iter().enumerate() {
            if let Some(pos) = items.iter().position(|x| Arc::ptr_eq(x, item)) {
                return Err(DocError::DuplicateOwnership { index: pos });
            }

            if new_items[..i].iter().any(|x| Arc::ptr_eq(x, item)) {
                return Err(DocError::DuplicateOwnership { index: index + i });
            }

            if let Some(parent) = item.core().parent() {
                return Err(DocError::AlreadyOwned {
                    parent: parent.core().describe().into_boxed_str(),
                });
            }

            if self.core.is_self_or_descendant_of(item.core().uid()) {
                return Err(DocError::Cycle {
                    name: item.core().describe().into_boxed_str(),
                });
            }
        }

        Ok(())
    }

    /// Brackets `f` with the counter increment and decrement.
    ///
    /// Attached collections run everything inside one transaction; detached
    /// ones apply directly and record nothing.
    fn batch(&self, f: impl FnOnce(Option<&History>) -> DocResult<()>) -> DocResult<()> {
        let Some(history) = self.core.history() else {
            let depth = self.counter.get();
            self.counter.force_set(depth + 1);
            let result = f(None);
            self.counter.force_set(depth);
            return result;
        };

        let (mode, label) = {
            let config = self.config.lock();
            (config.txn_mode, config.label.clone())
        };
        let id = mode.resolve(&self.core, &history);
        let name = label.unwrap_or_else(|| InternalString::from("Edit collection"));
        history.execute_in_transaction(id, &name, || {
            self.counter.update(|x| x + 1)?;
            f(Some(&history))?;
            self.counter.update(|x| x - 1)
        })
    }

    /// Inserts without recording. Used by [ListOp] and deserialization.
    pub(crate) fn raw_insert(&self, index: usize, item: Arc<T>) -> DocResult<()> {
        let len = self.len();
        if index > len {
            return Err(DocError::OutOfBound { pos: index, len });
        }

        if !self.is_foreign() {
            item.core().attach(&self.core, index.to_string())?;
        }

        {
            let mut items = self.items.lock();
            items.insert(index, item);
            self.renumber(&items, index + 1);
        }

        self.observers.emit(
            CollectionEvent::single(ListChange::Insert { index, len: 1 }),
            self.core.history().as_ref(),
        );
        Ok(())
    }

    /// Removes the item at `index`, which must be `expected`.
    pub(crate) fn raw_remove(&self, index: usize, expected: &Arc<T>) -> DocResult<()> {
        let removed = {
            let mut items = self.items.lock();
            if index >= items.len() {
                return Err(DocError::OutOfBound {
                    pos: index,
                    len: items.len(),
                });
            }

            if !Arc::ptr_eq(&items[index], expected) {
                return Err(DocError::not_found(format!(
                    "{} at index {}",
                    expected.core().describe(),
                    index
                )));
            }

            let removed = items.remove(index);
            self.renumber(&items, index);
            removed
        };

        if !self.is_foreign() {
            removed.core().detach();
        }

        self.observers.emit(
            CollectionEvent::single(ListChange::Remove { index, len: 1 }),
            self.core.history().as_ref(),
        );
        Ok(())
    }

    fn renumber(&self, items: &[Arc<T>], from: usize) {
        if self.is_foreign() {
            return;
        }

        for (i, item) in items.iter().enumerate().skip(from) {
            item.core().rename(i.to_string());
        }
    }
}

fn submit<T: NodeType>(history: Option<&History>, op: ListOp<T>) -> DocResult<()> {
    match history {
        Some(history) => history.execute(Box::new(op)),
        None => op.apply(&OpContext::detached()),
    }
}

impl<T: NodeType> Node for Collection<T> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Collection
    }

    fn child(&self, segment: &str) -> Option<NodeRef> {
        match parse_index(segment)? {
            -1 => Some(self.counter.clone() as NodeRef),
            _ if self.is_foreign() => None,
            i => self.get(i as usize).map(|x| x as NodeRef),
        }
    }

    fn children(&self) -> Vec<NodeRef> {
        if self.is_foreign() {
            return Vec::new();
        }

        self.items
            .lock()
            .iter()
            .map(|x| x.clone() as NodeRef)
            .collect()
    }

    fn type_tag(&self) -> Cow<'static, str> {
        Self::static_type_tag()
    }

    fn to_element(&self, cx: &SerializeCx) -> DocResult<Element> {
        let mut element = Element::new(self.type_tag(), &self.core.name());
        let items = self.to_vec();
        match self.mode {
            CollectionMode::Owning => {
                for item in items.iter() {
                    element.children.push(item.to_element(cx)?);
                }
            }
            CollectionMode::Foreign => {
                element.value = Some(serde_json::Value::from(FOREIGN_MARKER));
                for (i, item) in items.iter().enumerate() {
                    if let Some(path) = cx.reference(&**item) {
                        element.refs.push(Reference {
                            slot: i.to_string().into(),
                            path,
                        });
                    }
                }
            }
        }

        Ok(element)
    }

    fn restore_refs(&self, top: &NodeRef, refs: &[Reference]) -> DocResult<()> {
        if !self.is_foreign() {
            return Ok(());
        }

        for reference in refs {
            let item = resolve_as::<T>(top, &reference.path)?;
            let len = self.len();
            self.raw_insert(len, item)?;
        }

        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T: NodeType> NodeType for Collection<T> {
    fn static_type_tag() -> Cow<'static, str> {
        Cow::Owned(format!("collection<{}>", T::static_type_tag()))
    }

    fn from_element(element: &Element) -> DocResult<Arc<Self>> {
        element.expect_tag(&Self::static_type_tag())?;
        let foreign = element.value.as_ref().and_then(|v| v.as_str()) == Some(FOREIGN_MARKER);
        if foreign {
            // Items are linked by `restore_refs` once the whole tree exists.
            return Ok(Self::foreign());
        }

        let list = Self::new();
        for (i, child) in element.children.iter().enumerate() {
            list.raw_insert(i, T::from_element(child)?)?;
        }

        Ok(list)
    }
}
