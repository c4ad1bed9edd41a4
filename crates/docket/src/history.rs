//! The undo/redo sequencer.
//!
//! A [History] owns a linear log of committed entries and a cursor into it.
//! Entries after the cursor form the redo tail; a fresh edit prunes it. Edits
//! can be grouped into a single [Transaction], which is recorded as one entry
//! when it ends and reverted as a whole when it is rolled back.

use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use docket_common::{DocError, DocResult, InternalString, TxnId};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, error, instrument, trace};

use crate::{
    configure::{HistoryOptions, ThreadCheck},
    node::{Node, NodeRef},
    observer::{Coalesce, DeferredDelivery, Delivery, Observers, Subscription},
    op::{AtomicOperation, OpContext},
    txn::Transaction,
};

static GLOBAL: Lazy<History> = Lazy::new(History::new);

/// Changes of the log that UIs may want to reflect, e.g. to enable the undo
/// button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryEvent {
    Recorded {
        name: InternalString,
        id: Option<TxnId>,
    },
    Undone {
        name: InternalString,
    },
    Redone {
        name: InternalString,
    },
    RolledBack {
        id: TxnId,
    },
    /// The log was emptied, either explicitly or by assigning a new root.
    Cleared,
}

impl Coalesce for HistoryEvent {
    fn coalesce(&mut self, later: Self) {
        *self = later;
    }
}

struct HistoryState {
    root: Option<NodeRef>,
    log: VecDeque<Arc<dyn AtomicOperation>>,
    /// Number of entries before the cursor. `cursor == applied - 1`.
    applied: usize,
    active: Option<Transaction>,
    /// Ops the active transaction already had when it was reopened.
    resumed: usize,
    /// Caller-chosen ids at or above `next_id`, skipped by `allocate_id`.
    used_ids: FxHashSet<TxnId>,
    next_id: TxnId,
    /// Set while undo, redo or a rollback replays entries.
    replaying: bool,
    options: HistoryOptions,
}

impl HistoryState {
    fn context(&self) -> OpContext {
        OpContext::new(self.root.clone())
    }

    fn push_entry(&mut self, entry: Arc<dyn AtomicOperation>) {
        self.log.truncate(self.applied);
        self.log.push_back(entry);
        self.applied += 1;
        if let Some(max) = self.options.max_undo_steps {
            while self.log.len() > max {
                self.log.pop_front();
                self.applied -= 1;
            }
        }
    }

    fn reset_log(&mut self) {
        self.log.clear();
        self.applied = 0;
        self.used_ids.clear();
    }

    fn check_idle(&self, action: &'static str) -> DocResult<()> {
        match &self.active {
            Some(txn) => Err(DocError::TransactionOpen {
                action,
                id: txn.txn_id(),
            }),
            None => Ok(()),
        }
    }
}

pub(crate) struct HistoryInner {
    state: Mutex<HistoryState>,
    in_action: AtomicBool,
    deferred: Mutex<Vec<Arc<dyn DeferredDelivery>>>,
    observers: Observers<HistoryEvent>,
}

/// A cloneable handle to one document's history.
///
/// Nodes find the history they belong to through the root of their tree, see
/// [History::set_root]. Use [History::global] when the application only ever
/// edits one document at a time.
#[derive(Clone)]
pub struct History {
    inner: Arc<HistoryInner>,
}

impl Debug for History {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("History")
            .field("root", &state.root.as_ref().map(|r| r.core().uid()))
            .field("len", &state.log.len())
            .field("cursor", &(state.applied as isize - 1))
            .field("active", &state.active.as_ref().map(|t| t.txn_id()))
            .finish()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

/// Resets the in-action flag even when an operation panics.
struct ActionGuard<'a>(&'a AtomicBool);

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Rolls back the transaction opened by [History::execute_in_transaction]
/// when the closure unwinds.
struct TransactionGuard<'a> {
    history: &'a History,
    armed: bool,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.history.rollback_transaction() {
                error!("rollback after panic failed: {}", e);
            }
        }
    }
}

impl History {
    pub fn new() -> Self {
        Self::with_options(HistoryOptions::default())
    }

    pub fn with_options(options: HistoryOptions) -> Self {
        Self {
            inner: Arc::new(HistoryInner {
                state: Mutex::new(HistoryState {
                    root: None,
                    log: VecDeque::new(),
                    applied: 0,
                    active: None,
                    resumed: 0,
                    used_ids: FxHashSet::default(),
                    next_id: TxnId::FIRST_ALLOCATED,
                    replaying: false,
                    options,
                }),
                in_action: AtomicBool::new(false),
                deferred: Mutex::new(Vec::new()),
                observers: Observers::new(),
            }),
        }
    }

    /// The process-wide default history.
    pub fn global() -> History {
        GLOBAL.clone()
    }

    pub(crate) fn from_inner(inner: Arc<HistoryInner>) -> Self {
        Self { inner }
    }

    pub fn ptr_eq(&self, other: &History) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn options(&self) -> HistoryOptions {
        self.inner.state.lock().options.clone()
    }

    /// Replaces the options. A smaller `max_undo_steps` takes effect on the
    /// next recorded entry.
    pub fn set_options(&self, options: HistoryOptions) {
        self.inner.state.lock().options = options;
    }

    pub fn set_max_undo_steps(&self, steps: Option<usize>) {
        self.inner.state.lock().options.max_undo_steps = steps;
    }

    /// Only the calling thread may drive this history from now on.
    pub fn bind_to_current_thread(&self) {
        self.inner.state.lock().options.thread_check = ThreadCheck::current();
    }

    pub fn set_thread_check(&self, check: ThreadCheck) {
        self.inner.state.lock().options.thread_check = check;
    }

    fn check_thread(&self) -> DocResult<()> {
        if !cfg!(debug_assertions) {
            return Ok(());
        }

        let allowed = self.inner.state.lock().options.thread_check.allowed_thread();
        match allowed {
            Some(expected) if expected != std::thread::current().id() => {
                Err(DocError::WrongThread {
                    expected: format!("{:?}", expected).into_boxed_str(),
                    found: format!("{:?}", std::thread::current().id()).into_boxed_str(),
                })
            }
            _ => Ok(()),
        }
    }

    fn check_reentrancy(&self) -> DocResult<()> {
        if self.inner.in_action.load(Ordering::Acquire) {
            return Err(DocError::Reentrancy);
        }

        Ok(())
    }

    fn run_action<R>(&self, f: impl FnOnce() -> DocResult<R>) -> DocResult<R> {
        if self
            .inner
            .in_action
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DocError::Reentrancy);
        }

        let _guard = ActionGuard(&self.inner.in_action);
        f()
    }

    /// Opens a new document: `root` becomes the top of the tracked tree and
    /// the whole log is discarded.
    #[instrument(skip_all)]
    pub fn set_root(&self, root: NodeRef) -> DocResult<()> {
        self.check_thread()?;
        self.check_reentrancy()?;
        if let Some(parent) = root.core().parent() {
            return Err(DocError::ParentConflict {
                name: root.core().name().to_string().into_boxed_str(),
                parent: parent.core().describe().into_boxed_str(),
            });
        }

        let old = {
            let mut state = self.inner.state.lock();
            state.check_idle("set the root")?;
            state.reset_log();
            state.root.replace(root.clone())
        };
        if let Some(old) = old {
            old.core().unbind_history();
        }

        root.core().bind_history(Arc::downgrade(&self.inner));
        self.discard_deferred();
        debug!("root set to {}", root.core().uid());
        self.inner.observers.emit(HistoryEvent::Cleared, None);
        Ok(())
    }

    /// Detaches the current root and discards the log.
    pub fn clear_root(&self) -> DocResult<Option<NodeRef>> {
        self.check_thread()?;
        self.check_reentrancy()?;
        let old = {
            let mut state = self.inner.state.lock();
            state.check_idle("clear the root")?;
            state.reset_log();
            state.root.take()
        };
        if let Some(old) = &old {
            old.core().unbind_history();
        }

        self.inner.observers.emit(HistoryEvent::Cleared, None);
        Ok(old)
    }

    pub fn root(&self) -> Option<NodeRef> {
        self.inner.state.lock().root.clone()
    }

    pub fn is_root(&self, node: &dyn Node) -> bool {
        self.inner
            .state
            .lock()
            .root
            .as_ref()
            .map(|r| r.core().uid() == node.core().uid())
            .unwrap_or(false)
    }

    /// Whether the top of `node`'s parent chain is this history's root.
    pub fn is_in_history_tree(&self, node: &dyn Node) -> bool {
        match node.core().top() {
            Some(top) => self.is_root(&*top),
            None => false,
        }
    }

    /// Queries like this one only read the log and skip the thread check.
    pub fn has_undo(&self) -> bool {
        self.undo_count() > 0
    }

    pub fn has_redo(&self) -> bool {
        self.redo_count() > 0
    }

    pub fn undo_count(&self) -> usize {
        self.inner.state.lock().applied
    }

    pub fn redo_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.log.len() - state.applied
    }

    /// Index of the entry the next undo reverts, `-1` when there is none.
    pub fn cursor(&self) -> isize {
        self.inner.state.lock().applied as isize - 1
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn undo_name(&self) -> Option<InternalString> {
        let state = self.inner.state.lock();
        let index = state.applied.checked_sub(1)?;
        state.log.get(index).map(|e| e.name().into_owned().into())
    }

    pub fn redo_name(&self) -> Option<InternalString> {
        let state = self.inner.state.lock();
        state.log.get(state.applied).map(|e| e.name().into_owned().into())
    }

    pub fn entry(&self, index: usize) -> Option<Arc<dyn AtomicOperation>> {
        self.inner.state.lock().log.get(index).cloned()
    }

    /// The most recently recorded entry, including the redo tail.
    pub fn last_entry(&self) -> Option<Arc<dyn AtomicOperation>> {
        self.inner.state.lock().log.back().cloned()
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.state.lock().active.is_some()
    }

    pub fn active_transaction_id(&self) -> Option<TxnId> {
        self.inner.state.lock().active.as_ref().map(|t| t.txn_id())
    }

    /// A transaction id that was never used by this history.
    pub fn allocate_id(&self) -> TxnId {
        let mut state = self.inner.state.lock();
        loop {
            let id = state.next_id;
            state.next_id = id.next();
            if !state.used_ids.remove(&id) {
                return id;
            }
        }
    }

    /// Runs `op` and records it, inside the open transaction if there is one.
    #[instrument(skip_all)]
    pub fn execute(&self, op: Box<dyn AtomicOperation>) -> DocResult<()> {
        self.check_thread()?;
        self.check_reentrancy()?;
        let cx = self.inner.state.lock().context();
        let mut op = op;
        op.prepare(&cx)?;
        if !op.is_valid_for_history() {
            return Err(DocError::NotPrepared(op.name().into()));
        }

        let op: Arc<dyn AtomicOperation> = Arc::from(op);
        self.run_action(|| op.apply(&cx))?;
        let committed = {
            let mut state = self.inner.state.lock();
            match state.active.as_mut() {
                Some(txn) => {
                    trace!("append `{}` to transaction {}", op.name(), txn.txn_id());
                    txn.push(op.clone());
                    false
                }
                None => {
                    state.push_entry(op.clone());
                    true
                }
            }
        };

        if committed {
            debug!("recorded `{}`", op.name());
            self.flush_deferred();
            self.inner.observers.emit(
                HistoryEvent::Recorded {
                    name: op.name().into_owned().into(),
                    id: None,
                },
                None,
            );
        }

        Ok(())
    }

    /// Opens a transaction.
    ///
    /// Returns `false` when one is already open; the caller then joins it and
    /// must not end it. When idle, with no redo tail, and the latest entry is
    /// a transaction with the same `id`, that entry is reopened instead so
    /// successive calls collapse into one undo step. Rolling a reopened
    /// transaction back only reverts what was added after reopening it.
    pub fn start_transaction(&self, id: TxnId, name: &str) -> DocResult<bool> {
        self.check_thread()?;
        self.check_reentrancy()?;
        let mut state = self.inner.state.lock();
        if state.active.is_some() {
            return Ok(false);
        }

        if id >= state.next_id {
            state.used_ids.insert(id);
        }

        if state.applied > 0 && state.applied == state.log.len() {
            let resumed = state
                .log
                .back()
                .and_then(|e| e.as_transaction())
                .filter(|t| t.txn_id() == id)
                .cloned();
            if let Some(txn) = resumed {
                trace!("resume transaction {}", id);
                state.log.pop_back();
                state.applied -= 1;
                state.resumed = txn.len();
                state.active = Some(txn);
                return Ok(true);
            }
        }

        state.resumed = 0;
        state.active = Some(Transaction::new(id, name));
        Ok(true)
    }

    /// Commits the open transaction. An empty transaction leaves no entry.
    #[instrument(skip_all)]
    pub fn end_transaction(&self) -> DocResult<()> {
        self.check_thread()?;
        let txn = {
            let mut state = self.inner.state.lock();
            let txn = state.active.take().ok_or(DocError::NoActiveTransaction)?;
            state.resumed = 0;
            if txn.is_empty() {
                None
            } else {
                state.push_entry(Arc::new(txn.clone()));
                Some(txn)
            }
        };

        self.flush_deferred();
        if let Some(txn) = txn {
            debug!("recorded transaction {} with {} ops", txn.txn_id(), txn.len());
            self.inner.observers.emit(
                HistoryEvent::Recorded {
                    name: txn.label().clone(),
                    id: Some(txn.txn_id()),
                },
                None,
            );
        }

        Ok(())
    }

    /// Reverts everything the open transaction collected and discards it,
    /// together with the notifications it buffered.
    #[instrument(skip_all)]
    pub fn rollback_transaction(&self) -> DocResult<()> {
        self.check_thread()?;
        self.check_reentrancy()?;
        let (txn, cx) = {
            let mut state = self.inner.state.lock();
            let mut committed = state.active.take().ok_or(DocError::NoActiveTransaction)?;
            let resumed = std::mem::take(&mut state.resumed);
            let txn = committed.split_off(resumed);
            if !committed.is_empty() {
                trace!("keep {} committed ops of transaction {}", resumed, txn.txn_id());
                state.log.push_back(Arc::new(committed));
                state.applied += 1;
            }
            state.replaying = true;
            (txn, state.context())
        };

        let result = self.run_action(|| txn.revert(&cx));
        self.inner.state.lock().replaying = false;
        self.discard_deferred();
        debug!("rolled back transaction {}", txn.txn_id());
        self.inner
            .observers
            .emit(HistoryEvent::RolledBack { id: txn.txn_id() }, None);
        result
    }

    /// Runs `f` inside a transaction.
    ///
    /// An `Err` from `f`, or a panic, rolls the transaction back; the error is
    /// returned unchanged. When a transaction is already open, `f` simply
    /// joins it and the outer caller decides its fate.
    pub fn execute_in_transaction<R, E>(
        &self,
        id: TxnId,
        name: &str,
        f: impl FnOnce() -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<DocError>,
    {
        if !self.start_transaction(id, name)? {
            return f();
        }

        let mut guard = TransactionGuard {
            history: self,
            armed: true,
        };
        let result = f();
        guard.armed = false;
        drop(guard);
        match result {
            Ok(value) => {
                self.end_transaction()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback_transaction() {
                    error!("rollback of transaction {} failed: {}", id, rollback_err);
                    return Err(rollback_err.into());
                }

                Err(e)
            }
        }
    }

    #[instrument(skip_all)]
    pub fn undo(&self) -> DocResult<()> {
        self.check_thread()?;
        self.check_reentrancy()?;
        let (entry, cx) = {
            let mut state = self.inner.state.lock();
            state.check_idle("undo")?;
            if state.applied == 0 {
                return Err(DocError::NothingToUndo);
            }

            let entry = state.log[state.applied - 1].clone();
            state.replaying = true;
            (entry, state.context())
        };

        let result = self.run_action(|| entry.revert(&cx));
        {
            let mut state = self.inner.state.lock();
            state.replaying = false;
            if result.is_ok() {
                state.applied -= 1;
            }
        }

        self.finish_replay(&result);
        result?;
        debug!("undone `{}`", entry.name());
        self.inner.observers.emit(
            HistoryEvent::Undone {
                name: entry.name().into_owned().into(),
            },
            None,
        );
        Ok(())
    }

    #[instrument(skip_all)]
    pub fn redo(&self) -> DocResult<()> {
        self.check_thread()?;
        self.check_reentrancy()?;
        let (entry, cx) = {
            let mut state = self.inner.state.lock();
            state.check_idle("redo")?;
            if state.applied >= state.log.len() {
                return Err(DocError::NothingToRedo);
            }

            let entry = state.log[state.applied].clone();
            state.replaying = true;
            (entry, state.context())
        };

        let result = self.run_action(|| entry.apply(&cx));
        {
            let mut state = self.inner.state.lock();
            state.replaying = false;
            if result.is_ok() {
                state.applied += 1;
            }
        }

        self.finish_replay(&result);
        result?;
        debug!("redone `{}`", entry.name());
        self.inner.observers.emit(
            HistoryEvent::Redone {
                name: entry.name().into_owned().into(),
            },
            None,
        );
        Ok(())
    }

    fn finish_replay(&self, result: &DocResult<()>) {
        match result {
            Ok(()) => self.flush_deferred(),
            Err(e) => {
                error!("replay failed: {}", e);
                self.discard_deferred();
            }
        }
    }

    /// Drops every entry. The document itself is left as is.
    pub fn clear(&self) -> DocResult<()> {
        self.check_thread()?;
        self.check_reentrancy()?;
        {
            let mut state = self.inner.state.lock();
            state.check_idle("clear the history")?;
            state.reset_log();
        }

        self.inner.observers.emit(HistoryEvent::Cleared, None);
        Ok(())
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&HistoryEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.observers.subscribe(Delivery::Immediate, callback)
    }

    /// Whether node notifications are currently being held back for
    /// after-commit subscribers.
    pub(crate) fn is_batching(&self) -> bool {
        let state = self.inner.state.lock();
        state.active.is_some() || state.replaying
    }

    pub(crate) fn defer(&self, delivery: Arc<dyn DeferredDelivery>) {
        self.inner.deferred.lock().push(delivery);
    }

    fn flush_deferred(&self) {
        loop {
            let batch = std::mem::take(&mut *self.inner.deferred.lock());
            if batch.is_empty() {
                break;
            }

            for delivery in batch {
                delivery.flush();
            }
        }
    }

    fn discard_deferred(&self) {
        let batch = std::mem::take(&mut *self.inner.deferred.lock());
        for delivery in batch {
            delivery.discard();
        }
    }
}

#[cfg(test)]
mod test {
    use std::borrow::Cow;

    use super::*;
    use crate::{Collection, ValueCell};

    #[test]
    fn allocated_ids_skip_used_ones() {
        let history = History::new();
        assert!(history
            .start_transaction(TxnId::FIRST_ALLOCATED, "manual")
            .unwrap());
        history.end_transaction().unwrap();
        let id = history.allocate_id();
        assert_eq!(id, TxnId::FIRST_ALLOCATED.next());
        assert_ne!(history.allocate_id(), id);
    }

    #[test]
    fn used_ids_stay_bounded() {
        let history = History::new();
        let root = Collection::<ValueCell<i32>>::new();
        history.set_root(root.clone()).unwrap();
        let cell = ValueCell::new(0);
        root.push(cell.clone()).unwrap();
        for i in 1..=100 {
            cell.set(i).unwrap();
        }
        history
            .execute_in_transaction(TxnId(7), "small", || cell.set(-1))
            .unwrap();
        assert!(history.inner.state.lock().used_ids.is_empty());

        let ahead = TxnId(TxnId::FIRST_ALLOCATED.0 + 1_000);
        history
            .execute_in_transaction(ahead, "ahead", || cell.set(-2))
            .unwrap();
        assert_eq!(history.inner.state.lock().used_ids.len(), 1);
        history.clear().unwrap();
        assert!(history.inner.state.lock().used_ids.is_empty());
    }

    #[test]
    fn nested_start_joins_outer() {
        let history = History::new();
        assert!(history.start_transaction(TxnId(1), "outer").unwrap());
        assert!(!history.start_transaction(TxnId(2), "inner").unwrap());
        assert_eq!(history.active_transaction_id(), Some(TxnId(1)));
        history.end_transaction().unwrap();
        assert!(!history.in_transaction());
        // Nothing was executed, so nothing was recorded.
        assert!(!history.has_undo());
    }

    #[test]
    fn end_without_transaction() {
        let history = History::new();
        assert_eq!(history.end_transaction(), Err(DocError::NoActiveTransaction));
        assert_eq!(
            history.rollback_transaction(),
            Err(DocError::NoActiveTransaction)
        );
    }

    #[test]
    fn undo_requires_idle() {
        let history = History::new();
        let root = Collection::<ValueCell<i32>>::new();
        history.set_root(root.clone()).unwrap();
        root.push(ValueCell::new(1)).unwrap();
        history.start_transaction(TxnId(5), "open").unwrap();
        assert!(matches!(
            history.undo(),
            Err(DocError::TransactionOpen { action: "undo", .. })
        ));
        history.end_transaction().unwrap();
        history.undo().unwrap();
        assert!(root.is_empty());
        assert_eq!(history.undo(), Err(DocError::NothingToUndo));
        history.redo().unwrap();
        assert_eq!(history.redo(), Err(DocError::NothingToRedo));
    }

    #[derive(Debug)]
    struct Unprepared;

    impl AtomicOperation for Unprepared {
        fn name(&self) -> Cow<'_, str> {
            Cow::Borrowed("unprepared")
        }

        fn is_valid_for_history(&self) -> bool {
            false
        }

        fn apply(&self, _cx: &OpContext) -> DocResult<()> {
            Ok(())
        }

        fn revert(&self, _cx: &OpContext) -> DocResult<()> {
            Ok(())
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn unprepared_op_is_rejected() {
        let history = History::new();
        assert!(matches!(
            history.execute(Box::new(Unprepared)),
            Err(DocError::NotPrepared(_))
        ));
        assert!(!history.has_undo());
    }

    #[test]
    fn set_root_rejects_attached_node() {
        let history = History::new();
        let root = Collection::<ValueCell<i32>>::new();
        let cell = ValueCell::new(0);
        root.push(cell.clone()).unwrap();
        assert!(matches!(
            history.set_root(cell),
            Err(DocError::ParentConflict { .. })
        ));
    }

    #[test]
    fn new_root_clears_log() {
        let history = History::new();
        let first = Collection::<ValueCell<i32>>::new();
        history.set_root(first.clone()).unwrap();
        first.push(ValueCell::new(1)).unwrap();
        assert!(history.has_undo());
        let second = Collection::<ValueCell<i32>>::new();
        history.set_root(second.clone()).unwrap();
        assert!(!history.has_undo());
        assert!(!history.is_in_history_tree(&*first));
        assert!(history.is_in_history_tree(&*second));
        // The old document is detached from history now.
        first.push(ValueCell::new(2)).unwrap();
        assert!(!history.has_undo());
    }
}
