//! Identity and parent links of the nodes in a document tree.
//!
//! Ownership flows strictly downwards: a collection or a record holds its
//! children through `Arc`, and every child only keeps a [Weak] back-reference
//! to its parent. A node without a live parent is the top of its own tree.

use std::{
    any::Any,
    borrow::Cow,
    fmt::Debug,
    sync::{Arc, Weak},
};

use docket_common::{DocError, DocResult, InternalString, NodeUid, PATH_SEPARATOR};
use parking_lot::Mutex;

use crate::{
    history::{History, HistoryInner},
    persist::{Element, Reference, SerializeCx},
};

pub type NodeRef = Arc<dyn Node>;
pub type WeakNodeRef = Weak<dyn Node>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A single observable value slot.
    Value,
    /// Children are addressed by position.
    Collection,
    /// Children are the named slots declared by a schema.
    Record,
}

/// The structural contract every node of a document tree implements.
///
/// Users normally don't implement it by hand: [crate::ValueCell],
/// [crate::Collection] and [crate::Record] cover values, sequences and
/// schema-declared structs.
pub trait Node: Send + Sync + Debug + 'static {
    fn core(&self) -> &NodeCore;

    fn kind(&self) -> NodeKind;

    /// Looks up a direct child by its path segment.
    fn child(&self, segment: &str) -> Option<NodeRef>;

    /// Owned children, in declaration or positional order.
    fn children(&self) -> Vec<NodeRef>;

    fn children_names(&self) -> Vec<InternalString> {
        self.children().iter().map(|x| x.core().name()).collect()
    }

    /// Tag under which the persistence registry can rebuild this node.
    fn type_tag(&self) -> Cow<'static, str>;

    fn to_element(&self, cx: &SerializeCx) -> DocResult<Element>;

    /// Re-links non-owning references after a whole tree was deserialized.
    fn restore_refs(&self, _top: &NodeRef, _refs: &[Reference]) -> DocResult<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[derive(Default)]
struct Link {
    name: InternalString,
    parent: Option<(NodeUid, WeakNodeRef)>,
}

impl Link {
    fn live_parent(&self) -> Option<NodeRef> {
        self.parent.as_ref().and_then(|(_, p)| p.upgrade())
    }
}

/// Identity, name and parent link shared by all node kinds.
pub struct NodeCore {
    uid: NodeUid,
    this: WeakNodeRef,
    link: Mutex<Link>,
    /// Only set on the node that is currently the root of a [History].
    binding: Mutex<Weak<HistoryInner>>,
}

impl Debug for NodeCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let link = self.link.lock();
        f.debug_struct("NodeCore")
            .field("uid", &self.uid)
            .field("name", &link.name)
            .field("parent", &link.parent.as_ref().map(|(uid, _)| *uid))
            .finish()
    }
}

impl NodeCore {
    pub(crate) fn new(this: WeakNodeRef) -> Self {
        Self {
            uid: NodeUid::fresh(),
            this,
            link: Mutex::new(Link::default()),
            binding: Mutex::new(Weak::new()),
        }
    }

    #[inline]
    pub fn uid(&self) -> NodeUid {
        self.uid
    }

    pub fn name(&self) -> InternalString {
        self.link.lock().name.clone()
    }

    pub fn parent(&self) -> Option<NodeRef> {
        self.link.lock().live_parent()
    }

    pub fn has_parent(&self) -> bool {
        self.parent().is_some()
    }

    /// The `Arc` owning this node. `None` only while the node is being dropped.
    pub fn this(&self) -> Option<NodeRef> {
        self.this.upgrade()
    }

    /// The top of the tree this node belongs to. A detached node is its own top.
    pub fn top(&self) -> Option<NodeRef> {
        let mut cur = self.this()?;
        while let Some(parent) = cur.core().parent() {
            cur = parent;
        }

        Some(cur)
    }

    /// Whether `uid` is this node or one of its ancestors.
    pub fn is_self_or_descendant_of(&self, uid: NodeUid) -> bool {
        if self.uid == uid {
            return true;
        }

        let mut cur = self.parent();
        while let Some(node) = cur {
            if node.core().uid == uid {
                return true;
            }
            cur = node.core().parent();
        }

        false
    }

    /// Links this node below `parent` under `name`.
    ///
    /// Re-attaching to the same parent only renames the node.
    pub fn attach(&self, parent: &NodeCore, name: impl Into<InternalString>) -> DocResult<()> {
        let name = name.into();
        if name.contains(PATH_SEPARATOR) || name.is_empty() {
            return Err(DocError::configuration(format!(
                "`{}` is not a valid node name",
                name
            )));
        }

        if parent.is_self_or_descendant_of(self.uid) {
            return Err(DocError::Cycle {
                name: name.to_string().into_boxed_str(),
            });
        }

        let mut link = self.link.lock();
        if let Some(current) = link.live_parent() {
            if current.core().uid != parent.uid {
                return Err(DocError::ParentConflict {
                    name: name.to_string().into_boxed_str(),
                    parent: current.core().describe().into_boxed_str(),
                });
            }
        }

        link.name = name;
        link.parent = Some((parent.uid, parent.this.clone()));
        Ok(())
    }

    /// Links a node that was just constructed and therefore cannot conflict.
    pub(crate) fn adopt(&self, parent: &NodeCore, name: impl Into<InternalString>) {
        let mut link = self.link.lock();
        link.name = name.into();
        link.parent = Some((parent.uid, parent.this.clone()));
    }

    pub(crate) fn rename(&self, name: impl Into<InternalString>) {
        self.link.lock().name = name.into();
    }

    pub fn detach(&self) {
        let mut link = self.link.lock();
        link.parent = None;
        link.name = InternalString::default();
    }

    pub(crate) fn bind_history(&self, history: Weak<HistoryInner>) {
        *self.binding.lock() = history;
    }

    pub(crate) fn unbind_history(&self) {
        *self.binding.lock() = Weak::new();
    }

    /// The history this node's edits are routed through.
    ///
    /// Only `Some` when the node is attached to the tree rooted at that
    /// history's current root.
    pub fn history(&self) -> Option<History> {
        let top = self.top()?;
        let inner = top.core().binding.lock().upgrade()?;
        let history = History::from_inner(inner);
        history.is_root(&*top).then_some(history)
    }

    pub(crate) fn describe(&self) -> String {
        let (name, _) = crate::path::locate(self);
        if name.is_root() {
            format!("{}", self.uid)
        } else {
            format!("`{}` ({})", name, self.uid)
        }
    }
}

/// Pointer identity of two nodes.
#[inline]
pub fn same_node(a: &dyn Node, b: &dyn Node) -> bool {
    a.core().uid() == b.core().uid()
}
