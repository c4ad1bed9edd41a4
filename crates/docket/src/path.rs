//! Reference-free addressing of nodes.
//!
//! A [NodePath] is rebuilt by walking parent links up to the top of a tree and
//! resolved again by descending through [Node::child]. Recorded operations keep
//! only paths, so the history never pins the nodes it was built from.

use std::sync::Arc;

use docket_common::{DocError, DocResult, NodePath, NodeUid};

use crate::{
    history::History,
    node::{Node, NodeCore, NodeRef},
};

/// Returns the path of `node` below the top of its tree, and the top's uid.
pub fn locate(node: &NodeCore) -> (NodePath, NodeUid) {
    let mut segments = Vec::new();
    let mut name = node.name();
    let mut top = node.uid();
    let mut parent = node.parent();
    while let Some(p) = parent {
        segments.push(name);
        name = p.core().name();
        top = p.core().uid();
        parent = p.core().parent();
    }

    segments.reverse();
    (segments.into_iter().collect(), top)
}

/// Path of `node` from the top of its tree.
pub fn path_of(node: &dyn Node) -> NodePath {
    locate(node.core()).0
}

/// Path of `node` below `root`, failing when `node` lives in another tree.
pub fn path_from(root: &dyn Node, node: &dyn Node) -> DocResult<NodePath> {
    let (path, top) = locate(node.core());
    if top != root.core().uid() {
        return Err(DocError::not_found(format!(
            "{} is not attached below {}",
            node.core().describe(),
            root.core().describe()
        )));
    }

    Ok(path)
}

pub fn resolve(root: &NodeRef, path: &NodePath) -> DocResult<NodeRef> {
    let mut cur = root.clone();
    for segment in path.segments() {
        cur = cur
            .child(segment)
            .ok_or_else(|| DocError::PathNotFound {
                path: path.clone(),
                segment: segment.to_string().into_boxed_str(),
            })?;
    }

    Ok(cur)
}

/// Resolves `path` and downcasts the node to its concrete type.
pub fn resolve_as<T: Node>(root: &NodeRef, path: &NodePath) -> DocResult<Arc<T>> {
    let node = resolve(root, path)?;
    downcast_node(node, path)
}

pub(crate) fn downcast_node<T: Node>(node: NodeRef, path: &NodePath) -> DocResult<Arc<T>> {
    node.into_any()
        .downcast::<T>()
        .map_err(|_| DocError::TypeMismatch {
            path: path.clone(),
            expected: std::any::type_name::<T>(),
        })
}

/// Whether the top of `node`'s tree is the current root of `history`.
pub fn is_in_history_tree(node: &dyn Node, history: &History) -> bool {
    history.is_in_history_tree(node)
}
