//! Nodes with a fixed set of named slots.
//!
//! A [Schema] lists its slots in declaration order. [Owned] slots hold child
//! nodes, which are linked to the record when it is constructed and take part
//! in path resolution and serialization. [Child] slots are owning too, but
//! their node can be replaced later through [Record::set_child], which is
//! recorded like any other edit. [Ref] slots only point at nodes owned
//! elsewhere in the tree; they are stored as paths when serialized and
//! re-linked afterwards.

use std::{
    any::Any,
    borrow::Cow,
    fmt::Debug,
    ops::Deref,
    sync::{Arc, Weak},
};

use docket_common::{DocError, DocResult, NodePath, PATH_SEPARATOR};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::{
    node::{same_node, Node, NodeCore, NodeKind, NodeRef, WeakNodeRef},
    op::{AtomicOperation, OpContext, SetChildOp},
    path::{downcast_node, path_of, resolve},
    persist::{Element, NodeType, Reference, SerializeCx},
};

/// An owning child slot.
#[derive(Debug)]
pub struct Owned<T: Node>(Arc<T>);

impl<T: Node> Owned<T> {
    pub fn new(node: Arc<T>) -> Self {
        Self(node)
    }

    pub fn node(&self) -> &Arc<T> {
        &self.0
    }
}

impl<T: Node> Deref for Owned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// An owning slot whose node can be replaced, or left empty.
pub struct Child<T: Node>(Mutex<Option<Arc<T>>>);

impl<T: Node> Debug for Child<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.get() {
            Some(node) => write!(f, "Child({})", node.core().uid()),
            None => f.write_str("Child(None)"),
        }
    }
}

impl<T: Node> Default for Child<T> {
    fn default() -> Self {
        Self(Mutex::new(None))
    }
}

impl<T: Node> Child<T> {
    pub fn new(node: Arc<T>) -> Self {
        Self(Mutex::new(Some(node)))
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.0.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_none()
    }
}

/// Type-erased access to a [Child] slot.
pub trait ChildSlot: Send + Sync {
    fn current(&self) -> Option<NodeRef>;

    /// Fails with `TypeMismatch` when `node` cannot fill this slot.
    fn check(&self, node: &NodeRef, path: &NodePath) -> DocResult<()>;

    /// Stores `node` without touching any parent link.
    fn store(&self, node: Option<NodeRef>, path: &NodePath) -> DocResult<()>;
}

impl<T: Node> ChildSlot for Child<T> {
    fn current(&self) -> Option<NodeRef> {
        self.get().map(|x| x as NodeRef)
    }

    fn check(&self, node: &NodeRef, path: &NodePath) -> DocResult<()> {
        if node.as_any().is::<T>() {
            return Ok(());
        }

        Err(DocError::TypeMismatch {
            path: path.clone(),
            expected: std::any::type_name::<T>(),
        })
    }

    fn store(&self, node: Option<NodeRef>, path: &NodePath) -> DocResult<()> {
        let node = match node {
            Some(node) => Some(downcast_node::<T>(node, path)?),
            None => None,
        };
        *self.0.lock() = node;
        Ok(())
    }
}

/// A non-owning slot. Assignments are not recorded in the history; use a
/// `ValueCell<Arc<_>>` when a reference must be undoable.
pub struct Ref<T: Node>(Mutex<Weak<T>>);

impl<T: Node> Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.get() {
            Some(node) => write!(f, "Ref({})", node.core().uid()),
            None => f.write_str("Ref(None)"),
        }
    }
}

impl<T: Node> Default for Ref<T> {
    fn default() -> Self {
        Self(Mutex::new(Weak::new()))
    }
}

impl<T: Node> Ref<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to(node: &Arc<T>) -> Self {
        Self(Mutex::new(Arc::downgrade(node)))
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.0.lock().upgrade()
    }

    pub fn set(&self, node: &Arc<T>) {
        *self.0.lock() = Arc::downgrade(node);
    }

    pub fn clear(&self) {
        *self.0.lock() = Weak::new();
    }
}

/// Type-erased access to a [Ref] slot.
pub trait RefSlot: Send + Sync {
    fn target(&self) -> Option<NodeRef>;

    fn restore(&self, node: NodeRef, path: &NodePath) -> DocResult<()>;
}

impl<T: Node> RefSlot for Ref<T> {
    fn target(&self) -> Option<NodeRef> {
        self.get().map(|x| x as NodeRef)
    }

    fn restore(&self, node: NodeRef, path: &NodePath) -> DocResult<()> {
        let node = downcast_node::<T>(node, path)?;
        self.set(&node);
        Ok(())
    }
}

pub enum Slot<'a> {
    Owned { name: &'static str, node: NodeRef },
    Child { name: &'static str, slot: &'a dyn ChildSlot },
    Ref { name: &'static str, slot: &'a dyn RefSlot },
}

impl<'a> Slot<'a> {
    pub fn owned<T: Node>(name: &'static str, slot: &Owned<T>) -> Self {
        Slot::Owned {
            name,
            node: slot.0.clone(),
        }
    }

    pub fn child<T: Node>(name: &'static str, slot: &'a Child<T>) -> Self {
        Slot::Child { name, slot }
    }

    pub fn reference<T: Node>(name: &'static str, slot: &'a Ref<T>) -> Self {
        Slot::Ref { name, slot }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Slot::Owned { name, .. } | Slot::Child { name, .. } | Slot::Ref { name, .. } => *name,
        }
    }

    /// The node this slot owns right now.
    pub fn node(&self) -> Option<NodeRef> {
        match self {
            Slot::Owned { node, .. } => Some(node.clone()),
            Slot::Child { slot, .. } => slot.current(),
            Slot::Ref { .. } => None,
        }
    }
}

/// Declares the slots of a record type.
///
/// ```ignore
/// #[derive(Debug)]
/// struct Track {
///     title: Owned<ValueCell<String>>,
///     clips: Owned<Collection<Clip>>,
///     selected: Ref<Clip>,
/// }
///
/// impl Schema for Track {
///     const TYPE_TAG: &'static str = "track";
///
///     fn slots(&self) -> Vec<Slot<'_>> {
///         vec![
///             Slot::owned("title", &self.title),
///             Slot::owned("clips", &self.clips),
///             Slot::reference("selected", &self.selected),
///         ]
///     }
///
///     fn from_slots(reader: &mut SlotReader) -> DocResult<Self> {
///         Ok(Track {
///             title: reader.owned("title")?,
///             clips: reader.owned("clips")?,
///             selected: reader.reference(),
///         })
///     }
/// }
/// ```
pub trait Schema: Send + Sync + Debug + Sized + 'static {
    const TYPE_TAG: &'static str;

    fn slots(&self) -> Vec<Slot<'_>>;

    fn from_slots(reader: &mut SlotReader<'_>) -> DocResult<Self>;
}

/// Rebuilds owned slots from a serialized record.
pub struct SlotReader<'a> {
    element: &'a Element,
}

impl<'a> SlotReader<'a> {
    pub fn owned<T: NodeType>(&mut self, name: &str) -> DocResult<Owned<T>> {
        let child = self
            .element
            .children
            .iter()
            .find(|x| x.name == name)
            .ok_or_else(|| {
                DocError::decode(format!("`{}` has no slot `{}`", self.element.tag, name))
            })?;
        Ok(Owned(T::from_element(child)?))
    }

    /// A missing element leaves the slot empty.
    pub fn child<T: NodeType>(&mut self, name: &str) -> DocResult<Child<T>> {
        match self.element.children.iter().find(|x| x.name == name) {
            Some(child) => Ok(Child::new(T::from_element(child)?)),
            None => Ok(Child::empty()),
        }
    }

    /// References are linked once the whole tree is rebuilt.
    pub fn reference<T: Node>(&mut self) -> Ref<T> {
        Ref::new()
    }
}

pub struct Record<S: Schema> {
    core: NodeCore,
    schema: S,
}

impl<S: Schema> Debug for Record<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("name", &self.core.name())
            .field("schema", &self.schema)
            .finish()
    }
}

impl<S: Schema> Record<S> {
    /// Links every owned slot of `schema` below the new record.
    ///
    /// Fails when two slots share a name, or an owned node already has a
    /// parent or fills two slots.
    pub fn new(schema: S) -> DocResult<Arc<Self>> {
        validate(&schema)?;
        Ok(Arc::new_cyclic(|this: &Weak<Self>| {
            let this: WeakNodeRef = this.clone();
            let core = NodeCore::new(this);
            for slot in schema.slots() {
                if let Some(node) = slot.node() {
                    node.core().adopt(&core, slot.name());
                }
            }

            Self { core, schema }
        }))
    }

    pub fn schema(&self) -> &S {
        &self.schema
    }

    /// Puts `node` into the [Child] slot `name`, detaching the node it held.
    ///
    /// `node` must be detached. Inside a history tree the assignment is
    /// recorded as one undoable step.
    pub fn set_child<T: Node>(&self, name: &str, node: Option<Arc<T>>) -> DocResult<()> {
        let (slot_name, current) = self
            .schema
            .slots()
            .iter()
            .find_map(|slot| match slot {
                Slot::Child { name: n, slot } if *n == name => Some((*n, slot.current())),
                _ => None,
            })
            .ok_or_else(|| self.no_child_slot(name))?;
        let node = node.map(|x| x as NodeRef);
        if same_slot_node(current.as_ref(), node.as_ref()) {
            return Ok(());
        }

        if let Some(new) = &node {
            check_detached(new, slot_name)?;
        }

        let this = self
            .core
            .this()
            .ok_or_else(|| DocError::not_found(self.core.describe()))?;
        let op = SetChildOp::<S>::new(this, slot_name, current, node);
        match self.core.history() {
            Some(history) => {
                let id = history.allocate_id();
                history.execute_in_transaction(id, "Set child", || history.execute(Box::new(op)))
            }
            None => op.apply(&OpContext::detached()),
        }
    }

    /// Swaps the node of a [Child] slot without recording. `expected` must be
    /// the node the slot holds now.
    pub(crate) fn raw_set_child(
        &self,
        name: &str,
        expected: Option<&NodeRef>,
        node: Option<NodeRef>,
    ) -> DocResult<()> {
        let slots = self.schema.slots();
        let slot = slots.iter().find_map(|slot| match slot {
            Slot::Child { name: n, slot } if *n == name => Some(*slot),
            _ => None,
        });
        let Some(slot) = slot else {
            return Err(self.no_child_slot(name));
        };

        let current = slot.current();
        if !same_slot_node(current.as_ref(), expected) {
            return Err(DocError::not_found(format!(
                "the expected node in slot `{}` of {}",
                name,
                self.core.describe()
            )));
        }

        let path = path_of(self).join(name);
        if let Some(new) = &node {
            slot.check(new, &path)?;
            check_detached(new, name)?;
            new.core().attach(&self.core, name)?;
        }

        if let Err(e) = slot.store(node.clone(), &path) {
            if let Some(new) = &node {
                new.core().detach();
            }
            return Err(e);
        }

        if let Some(old) = current {
            old.core().detach();
        }

        Ok(())
    }

    fn no_child_slot(&self, name: &str) -> DocError {
        DocError::not_found(format!("child slot `{}` of `{}`", name, S::TYPE_TAG))
    }
}

fn same_slot_node(a: Option<&NodeRef>, b: Option<&NodeRef>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => same_node(&**a, &**b),
        _ => false,
    }
}

fn check_detached(node: &NodeRef, name: &str) -> DocResult<()> {
    match node.core().parent() {
        Some(parent) => Err(DocError::ParentConflict {
            name: name.into(),
            parent: parent.core().describe().into_boxed_str(),
        }),
        None => Ok(()),
    }
}

fn validate<S: Schema>(schema: &S) -> DocResult<()> {
    let mut names = FxHashSet::default();
    let mut owned = FxHashSet::default();
    for (index, slot) in schema.slots().into_iter().enumerate() {
        let name = slot.name();
        if name.is_empty() || name.contains(PATH_SEPARATOR) {
            return Err(DocError::configuration(format!(
                "`{}` is not a valid slot name of `{}`",
                name,
                S::TYPE_TAG
            )));
        }

        if !names.insert(name) {
            return Err(DocError::configuration(format!(
                "slot `{}` is declared twice in `{}`",
                name,
                S::TYPE_TAG
            )));
        }

        if let Some(node) = slot.node() {
            if let Some(parent) = node.core().parent() {
                return Err(DocError::AlreadyOwned {
                    parent: parent.core().describe().into_boxed_str(),
                });
            }

            if !owned.insert(node.core().uid()) {
                return Err(DocError::DuplicateOwnership { index });
            }
        }
    }

    Ok(())
}

impl<S: Schema> Deref for Record<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.schema
    }
}

impl<S: Schema> Node for Record<S> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Record
    }

    fn child(&self, segment: &str) -> Option<NodeRef> {
        self.schema
            .slots()
            .into_iter()
            .find(|slot| slot.name() == segment)
            .and_then(|slot| slot.node())
    }

    fn children(&self) -> Vec<NodeRef> {
        self.schema
            .slots()
            .into_iter()
            .filter_map(|slot| slot.node())
            .collect()
    }

    fn type_tag(&self) -> Cow<'static, str> {
        Cow::Borrowed(S::TYPE_TAG)
    }

    fn to_element(&self, cx: &SerializeCx) -> DocResult<Element> {
        let mut element = Element::new(S::TYPE_TAG, &self.core.name());
        for slot in self.schema.slots() {
            match slot {
                Slot::Owned { node, .. } => element.children.push(node.to_element(cx)?),
                Slot::Child { slot, .. } => {
                    if let Some(node) = slot.current() {
                        element.children.push(node.to_element(cx)?);
                    }
                }
                Slot::Ref { name, slot } => {
                    let Some(target) = slot.target() else {
                        continue;
                    };

                    if let Some(path) = cx.reference(&*target) {
                        element.refs.push(Reference {
                            slot: name.into(),
                            path,
                        });
                    }
                }
            }
        }

        Ok(element)
    }

    fn restore_refs(&self, top: &NodeRef, refs: &[Reference]) -> DocResult<()> {
        let slots = self.schema.slots();
        for reference in refs {
            let slot = slots.iter().find_map(|slot| match slot {
                Slot::Ref { name, slot } if *name == &*reference.slot => Some(*slot),
                _ => None,
            });
            let Some(slot) = slot else {
                return Err(DocError::decode(format!(
                    "`{}` has no reference slot `{}`",
                    S::TYPE_TAG,
                    reference.slot
                )));
            };

            let node = resolve(top, &reference.path)?;
            slot.restore(node, &reference.path)?;
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

impl<S: Schema> NodeType for Record<S> {
    fn static_type_tag() -> Cow<'static, str> {
        Cow::Borrowed(S::TYPE_TAG)
    }

    fn from_element(element: &Element) -> DocResult<Arc<Self>> {
        element.expect_tag(S::TYPE_TAG)?;
        let mut reader = SlotReader { element };
        Record::new(S::from_slots(&mut reader)?)
    }
}
