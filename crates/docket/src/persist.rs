//! Element trees: the format-neutral shape a document is saved as.
//!
//! Every element records the type tag of the node it came from. A [Registry]
//! maps tags to factories, so a saved tree can be rebuilt without knowing its
//! concrete type up front. Encoding elements to bytes is left to the caller;
//! elements implement serde's traits for that.

use std::{borrow::Cow, fmt::Debug, sync::Arc};

use docket_common::{DocError, DocResult, InternalString, NodePath, NodeUid};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    collection::Collection,
    node::{Node, NodeRef},
    path::locate,
    value::ValueCell,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub tag: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Element>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<Reference>,
}

impl Element {
    pub fn new(tag: impl Into<String>, name: &str) -> Self {
        Self {
            tag: tag.into(),
            name: name.to_string(),
            value: None,
            children: Vec::new(),
            refs: Vec::new(),
        }
    }

    pub fn expect_tag(&self, tag: &str) -> DocResult<()> {
        if self.tag != tag {
            return Err(DocError::decode(format!(
                "expected an element tagged `{}`, found `{}`",
                tag, self.tag
            )));
        }

        Ok(())
    }
}

/// A non-owning link, stored as the target's path below the serialized node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub slot: InternalString,
    pub path: NodePath,
}

/// State shared by one serialization pass.
#[derive(Debug, Clone)]
pub struct SerializeCx {
    top: NodeUid,
    base: NodePath,
}

impl SerializeCx {
    /// Path of `target` relative to the node being serialized.
    ///
    /// References leaving the serialized subtree cannot be restored and are
    /// dropped with a warning.
    pub fn reference(&self, target: &dyn Node) -> Option<NodePath> {
        let (path, top) = locate(target.core());
        let relative = if top == self.top {
            path.strip_prefix(&self.base)
        } else {
            None
        };
        if relative.is_none() {
            warn!(
                "dropping reference to {}: it is outside the serialized tree",
                target.core().describe()
            );
        }

        relative
    }
}

/// Nodes that can be rebuilt from an [Element].
pub trait NodeType: Node + Sized {
    fn static_type_tag() -> Cow<'static, str>;

    fn from_element(element: &Element) -> DocResult<Arc<Self>>;
}

pub fn serialize(node: &dyn Node) -> DocResult<Element> {
    let (base, top) = locate(node.core());
    let cx = SerializeCx { top, base };
    node.to_element(&cx)
}

type Factory = Arc<dyn Fn(&Element) -> DocResult<NodeRef> + Send + Sync>;

/// Type tag to factory lookup used by [Registry::deserialize].
#[derive(Clone, Default)]
pub struct Registry {
    factories: FxHashMap<String, Factory>,
}

impl Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.factories.keys().collect();
        tags.sort();
        f.debug_struct("Registry").field("tags", &tags).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry knowing the built-in value cells and collections of them.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register::<ValueCell<bool>>();
        registry.register::<ValueCell<i32>>();
        registry.register::<ValueCell<i64>>();
        registry.register::<ValueCell<f64>>();
        registry.register::<ValueCell<String>>();
        registry.register::<Collection<ValueCell<bool>>>();
        registry.register::<Collection<ValueCell<i32>>>();
        registry.register::<Collection<ValueCell<i64>>>();
        registry.register::<Collection<ValueCell<f64>>>();
        registry.register::<Collection<ValueCell<String>>>();
        registry
    }

    pub fn register<N: NodeType>(&mut self) -> &mut Self {
        self.factories.insert(
            N::static_type_tag().into_owned(),
            Arc::new(|element: &Element| {
                N::from_element(element).map(|x| x as NodeRef)
            }),
        );
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// Rebuilds a detached tree from `element`, then re-links the references
    /// recorded in it.
    pub fn deserialize(&self, element: &Element) -> DocResult<NodeRef> {
        let factory = self
            .factories
            .get(&element.tag)
            .ok_or_else(|| DocError::UnknownTypeTag(element.tag.clone().into_boxed_str()))?;
        let top = factory(element)?;
        restore_refs(&top, &top, element)?;
        Ok(top)
    }
}

fn restore_refs(top: &NodeRef, node: &NodeRef, element: &Element) -> DocResult<()> {
    if !element.refs.is_empty() {
        node.restore_refs(top, &element.refs)?;
    }

    let children = node.children();
    if children.len() != element.children.len() {
        return Err(DocError::decode(format!(
            "`{}` was rebuilt with {} children, expected {}",
            element.tag,
            children.len(),
            element.children.len()
        )));
    }

    for (child, child_element) in children.iter().zip(element.children.iter()) {
        restore_refs(top, child, child_element)?;
    }

    Ok(())
}
