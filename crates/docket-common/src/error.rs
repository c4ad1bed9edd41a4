use thiserror::Error;

use crate::{NodePath, TxnId};

pub type DocResult<T> = Result<T, DocError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocError {
    #[error("History is already applying an operation. An operation's apply/revert must not drive the history recursively")]
    Reentrancy,
    #[error("History is bound to thread {expected} but was called from thread {found}")]
    WrongThread { expected: Box<str>, found: Box<str> },
    #[error("There is nothing to undo")]
    NothingToUndo,
    #[error("There is nothing to redo")]
    NothingToRedo,
    #[error("Cannot {action} while transaction {id} is open")]
    TransactionOpen { action: &'static str, id: TxnId },
    #[error("There is no open transaction")]
    NoActiveTransaction,
    #[error("The history has no root. Call `History::set_root` before executing document operations")]
    NoRoot,
    #[error("Node `{name}` already belongs to another parent ({parent})")]
    ParentConflict { name: Box<str>, parent: Box<str> },
    #[error("Attaching `{name}` would make it its own ancestor")]
    Cycle { name: Box<str> },
    #[error("The node is already an item of this collection (index {index})")]
    DuplicateOwnership { index: usize },
    #[error("The node is already owned by {parent}. Remove it from its current owner first")]
    AlreadyOwned { parent: Box<str> },
    #[error("Cannot find ({0})")]
    NotFound(Box<str>),
    #[error("Index out of bound. The given pos is {pos}, but the length is {len}")]
    OutOfBound { pos: usize, len: usize },
    #[error("Path `{path}` does not resolve: no child named `{segment}`")]
    PathNotFound { path: NodePath, segment: Box<str> },
    #[error("Node at `{path}` is not a {expected}")]
    TypeMismatch {
        path: NodePath,
        expected: &'static str,
    },
    #[error("Operation `{0}` still references its live sender and cannot be recorded")]
    NotPrepared(Box<str>),
    #[error("Invalid configuration ({0})")]
    Configuration(Box<str>),
    #[error("No factory is registered for type tag `{0}`")]
    UnknownTypeTag(Box<str>),
    #[error("Decode error ({0})")]
    Decode(Box<str>),
}

impl DocError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into().into_boxed_str())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into().into_boxed_str())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into().into_boxed_str())
    }

    /// Structural contract violations are never absorbed by the engine.
    pub fn is_invariant_violation(&self) -> bool {
        !matches!(
            self,
            DocError::Configuration(_) | DocError::UnknownTypeTag(_) | DocError::Decode(_)
        )
    }
}
