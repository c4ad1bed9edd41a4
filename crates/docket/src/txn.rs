use std::{any::Any, borrow::Cow, sync::Arc};

use docket_common::{DocResult, InternalString, TxnId};
use tracing::warn;

use crate::op::{AtomicOperation, OpContext};

/// A named group of operations committed and undone as one unit.
#[derive(Debug, Clone)]
pub struct Transaction {
    id: TxnId,
    name: InternalString,
    ops: Vec<Arc<dyn AtomicOperation>>,
}

impl Transaction {
    pub fn new(id: TxnId, name: impl Into<InternalString>) -> Self {
        Self {
            id,
            name: name.into(),
            ops: Vec::new(),
        }
    }

    #[inline]
    pub fn txn_id(&self) -> TxnId {
        self.id
    }

    pub fn label(&self) -> &InternalString {
        &self.name
    }

    pub fn ops(&self) -> &[Arc<dyn AtomicOperation>] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn push(&mut self, op: Arc<dyn AtomicOperation>) {
        self.ops.push(op);
    }

    /// Moves the ops from `at` on into a new transaction with the same id.
    pub(crate) fn split_off(&mut self, at: usize) -> Transaction {
        Transaction {
            id: self.id,
            name: self.name.clone(),
            ops: self.ops.split_off(at.min(self.ops.len())),
        }
    }
}

impl AtomicOperation for Transaction {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.name)
    }

    fn is_valid_for_history(&self) -> bool {
        self.ops.iter().all(|op| op.is_valid_for_history())
    }

    /// Children run forward. When one fails, the ones already applied are
    /// reverted before the error is returned.
    fn apply(&self, cx: &OpContext) -> DocResult<()> {
        for (i, op) in self.ops.iter().enumerate() {
            if let Err(e) = op.apply(cx) {
                for done in self.ops[..i].iter().rev() {
                    if let Err(revert_err) = done.revert(cx) {
                        warn!("failed to unwind `{}`: {}", done.name(), revert_err);
                    }
                }
                return Err(e);
            }
        }

        Ok(())
    }

    /// Children run in reverse.
    fn revert(&self, cx: &OpContext) -> DocResult<()> {
        for (i, op) in self.ops.iter().enumerate().rev() {
            if let Err(e) = op.revert(cx) {
                for done in self.ops[i + 1..].iter() {
                    if let Err(apply_err) = done.apply(cx) {
                        warn!("failed to unwind `{}`: {}", done.name(), apply_err);
                    }
                }
                return Err(e);
            }
        }

        Ok(())
    }

    fn id(&self) -> Option<TxnId> {
        Some(self.id)
    }

    fn as_transaction(&self) -> Option<&Transaction> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
