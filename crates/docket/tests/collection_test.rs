use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use docket::{
    Collection, CollectionEvent, Delivery, DocError, History, ListChange, ListOp, Node,
    ValueCell,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

#[ctor::ctor]
fn init() {
    dev_utils::setup_test_log();
}

type List = Collection<ValueCell<i32>>;

fn values(list: &List) -> Vec<i32> {
    list.iter().map(|x| x.get()).collect()
}

fn rooted() -> (History, Arc<List>) {
    let list = List::new();
    let history = History::new();
    history.set_root(list.clone()).unwrap();
    (history, list)
}

/// `(is_insert, index, value)` of the list operations in the latest entry.
fn recorded_list_ops(history: &History) -> Vec<(bool, usize, i32)> {
    let entry = history.last_entry().unwrap();
    let txn = entry.as_transaction().unwrap();
    txn.ops()
        .iter()
        .filter_map(|op| op.as_any().downcast_ref::<ListOp<ValueCell<i32>>>())
        .map(|op| (op.is_insert(), op.index(), op.item().get()))
        .collect()
}

#[test]
fn batch_insert_and_remove_order() -> anyhow::Result<()> {
    let (history, list) = rooted();
    list.push(ValueCell::new(0))?;
    list.insert_many(1, [ValueCell::new(1), ValueCell::new(2), ValueCell::new(3)])?;
    assert_eq!(
        recorded_list_ops(&history),
        vec![(true, 1, 1), (true, 2, 2), (true, 3, 3)]
    );
    list.remove_range(1..4)?;
    assert_eq!(
        recorded_list_ops(&history),
        vec![(false, 3, 3), (false, 2, 2), (false, 1, 1)]
    );
    assert_eq!(values(&list), vec![0]);
    history.undo()?;
    assert_eq!(values(&list), vec![0, 1, 2, 3]);
    history.redo()?;
    assert_eq!(values(&list), vec![0]);
    Ok(())
}

#[test]
fn counter_brackets_every_edit() -> anyhow::Result<()> {
    let (history, list) = rooted();
    list.insert_many(0, [ValueCell::new(1), ValueCell::new(2)])?;
    let entry = history.last_entry().unwrap();
    let txn = entry.as_transaction().unwrap();
    // increment, two inserts, decrement
    assert_eq!(txn.len(), 4);
    assert_eq!(list.counter().get(), 0);

    let depths = Arc::new(Mutex::new(Vec::new()));
    let depths_cp = depths.clone();
    let counter = list.counter().clone();
    let _sub = list.subscribe(Delivery::Immediate, move |_| {
        depths_cp.lock().push(counter.get());
    });
    list.clear()?;
    history.undo()?;
    // Items change only while the counter is raised, also on replay.
    assert_eq!(*depths.lock(), vec![1, 1, 1, 1]);
    assert_eq!(list.counter().get(), 0);
    Ok(())
}

#[test]
fn clear_on_empty_records_nothing() -> anyhow::Result<()> {
    let (history, list) = rooted();
    let count = Arc::new(AtomicUsize::new(0));
    let count_cp = count.clone();
    let _sub = list.subscribe(Delivery::Immediate, move |_| {
        count_cp.fetch_add(1, Ordering::SeqCst);
    });
    list.clear()?;
    assert!(!history.has_undo());
    assert_eq!(count.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn remove_item_and_failures() -> anyhow::Result<()> {
    let (history, list) = rooted();
    let a = ValueCell::new(1);
    let b = ValueCell::new(2);
    list.insert_many(0, [a.clone(), b.clone()])?;
    assert_eq!(list.remove_item(&a)?, 0);
    assert_eq!(&*b.core().name(), "0");
    assert!(matches!(list.remove_item(&a), Err(DocError::NotFound(_))));
    assert_eq!(
        list.remove(4).unwrap_err(),
        DocError::OutOfBound { pos: 5, len: 1 }
    );
    assert_eq!(history.undo_count(), 2);
    history.undo()?;
    assert_eq!(list.position(&a), Some(0));
    assert_eq!(&*a.core().name(), "0");
    assert_eq!(&*b.core().name(), "1");
    Ok(())
}

#[test]
fn removed_item_can_move_elsewhere() -> anyhow::Result<()> {
    let (history, list) = rooted();
    let inner = List::new();
    let outer = Collection::<List>::new();
    let root_history = History::new();
    root_history.set_root(outer.clone())?;
    outer.push(inner.clone())?;

    let a = ValueCell::new(1);
    list.push(a.clone())?;
    assert!(matches!(inner.push(a.clone()), Err(DocError::AlreadyOwned { .. })));
    list.remove(0)?;
    inner.push(a.clone())?;
    assert_eq!(docket::path_of(&*a).to_string(), "0/0");
    assert!(root_history.is_in_history_tree(&*a));
    assert!(!history.is_in_history_tree(&*a));
    // The old document cannot take it back while it lives in the new one.
    assert!(matches!(history.undo(), Err(DocError::ParentConflict { .. })));
    assert_eq!(values(&list), Vec::<i32>::new());
    Ok(())
}

#[test]
fn foreign_collection_under_history() -> anyhow::Result<()> {
    let owner = List::new();
    let picks = List::foreign();
    let top = Collection::<List>::new();
    top.insert_many(0, [owner.clone(), picks.clone()])?;
    let history = History::new();
    history.set_root(top.clone())?;

    let a = ValueCell::new(1);
    owner.push(a.clone())?;
    picks.push(a.clone())?;
    picks.push(a.clone())?;
    assert_eq!(picks.len(), 2);
    assert_eq!(docket::path_of(&*a).to_string(), "0/0");
    assert!(docket::resolve(&(top.clone() as docket::NodeRef), &"1/0".parse::<docket::NodePath>()?).is_err());

    picks.clear()?;
    history.undo()?;
    assert_eq!(picks.len(), 2);
    assert!(Arc::ptr_eq(&picks.get(1).unwrap(), &a));
    assert_eq!(&*a.core().name(), "0");
    Ok(())
}

#[test]
fn after_commit_collection_event_is_coalesced() -> anyhow::Result<()> {
    let (history, list) = rooted();
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_cp = events.clone();
    let _sub = list.subscribe(Delivery::AfterCommit, move |e: &CollectionEvent| {
        events_cp.lock().push(e.clone());
    });
    list.insert_many(0, [ValueCell::new(1), ValueCell::new(2), ValueCell::new(3)])?;
    list.clear()?;
    history.undo()?;
    let events = events.lock();
    assert_eq!(events.len(), 3);
    assert_eq!(
        events[0].changes.as_slice(),
        &[ListChange::Insert { index: 0, len: 3 }]
    );
    assert_eq!(
        events[1].changes.as_slice(),
        &[ListChange::Remove { index: 0, len: 3 }]
    );
    assert_eq!(
        events[2].changes.as_slice(),
        &[ListChange::Insert { index: 0, len: 3 }]
    );
    Ok(())
}

#[derive(Debug, Clone)]
enum Action {
    Insert(usize, i32),
    Remove(usize),
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0usize..16, any::<i32>()).prop_map(|(i, v)| Action::Insert(i, v)),
        (0usize..16).prop_map(Action::Remove),
    ]
}

proptest! {
    #[test]
    fn undo_redo_round_trip(
        init in prop::collection::vec(any::<i32>(), 0..4),
        actions in prop::collection::vec(action(), 0..24),
    ) {
        let list = List::new();
        list.insert_many(0, init.iter().map(|x| ValueCell::new(*x))).unwrap();
        let history = History::new();
        history.set_root(list.clone()).unwrap();
        let before = values(&list);
        let mut steps = 0;
        for action in actions {
            match action {
                Action::Insert(i, v) => {
                    list.insert(i % (list.len() + 1), ValueCell::new(v)).unwrap();
                    steps += 1;
                }
                Action::Remove(i) => {
                    if !list.is_empty() {
                        list.remove(i % list.len()).unwrap();
                        steps += 1;
                    }
                }
            }
        }

        let after = values(&list);
        prop_assert_eq!(history.undo_count(), steps);
        for _ in 0..steps {
            history.undo().unwrap();
        }
        prop_assert_eq!(values(&list), before);
        prop_assert!(!history.has_undo());
        for _ in 0..steps {
            history.redo().unwrap();
        }
        prop_assert_eq!(values(&list), after);
        prop_assert!(!history.has_redo());
        for (i, item) in list.iter().enumerate() {
            prop_assert_eq!(item.core().name().to_string(), i.to_string());
        }
    }
}
