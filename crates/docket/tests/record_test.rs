use std::sync::Arc;

use docket::{
    path_of, resolve, resolve_as, serialize, Child, Collection, DocError, DocResult, Element,
    History, Node, NodePath, NodeRef, Owned, Record, Ref, Registry, Schema, Slot, SlotReader,
    ValueCell,
};
use pretty_assertions::assert_eq;

#[ctor::ctor]
fn init() {
    dev_utils::setup_test_log();
}

#[derive(Debug)]
struct Track {
    title: Owned<ValueCell<String>>,
    gain: Owned<ValueCell<f64>>,
}

impl Schema for Track {
    const TYPE_TAG: &'static str = "track";

    fn slots(&self) -> Vec<Slot<'_>> {
        vec![Slot::owned("title", &self.title), Slot::owned("gain", &self.gain)]
    }

    fn from_slots(reader: &mut SlotReader<'_>) -> DocResult<Self> {
        Ok(Track {
            title: reader.owned("title")?,
            gain: reader.owned("gain")?,
        })
    }
}

type Tracks = Collection<Record<Track>>;

#[derive(Debug)]
struct Project {
    tracks: Owned<Tracks>,
    selection: Owned<Tracks>,
    focus: Ref<Record<Track>>,
}

impl Schema for Project {
    const TYPE_TAG: &'static str = "project";

    fn slots(&self) -> Vec<Slot<'_>> {
        vec![
            Slot::owned("tracks", &self.tracks),
            Slot::owned("selection", &self.selection),
            Slot::reference("focus", &self.focus),
        ]
    }

    fn from_slots(reader: &mut SlotReader<'_>) -> DocResult<Self> {
        Ok(Project {
            tracks: reader.owned("tracks")?,
            selection: reader.owned("selection")?,
            focus: reader.reference(),
        })
    }
}

#[derive(Debug)]
struct Folder {
    folders: Owned<Collection<Record<Folder>>>,
}

impl Schema for Folder {
    const TYPE_TAG: &'static str = "folder";

    fn slots(&self) -> Vec<Slot<'_>> {
        vec![Slot::owned("folders", &self.folders)]
    }

    fn from_slots(reader: &mut SlotReader<'_>) -> DocResult<Self> {
        Ok(Folder {
            folders: reader.owned("folders")?,
        })
    }
}

#[derive(Debug)]
struct Bus {
    label: Owned<ValueCell<String>>,
    input: Child<Record<Track>>,
}

impl Schema for Bus {
    const TYPE_TAG: &'static str = "bus";

    fn slots(&self) -> Vec<Slot<'_>> {
        vec![Slot::owned("label", &self.label), Slot::child("input", &self.input)]
    }

    fn from_slots(reader: &mut SlotReader<'_>) -> DocResult<Self> {
        Ok(Bus {
            label: reader.owned("label")?,
            input: reader.child("input")?,
        })
    }
}

fn bus() -> Arc<Record<Bus>> {
    Record::new(Bus {
        label: Owned::new(ValueCell::new("A".to_string())),
        input: Child::empty(),
    })
    .unwrap()
}

fn track(title: &str, gain: f64) -> Arc<Record<Track>> {
    Record::new(Track {
        title: Owned::new(ValueCell::new(title.to_string())),
        gain: Owned::new(ValueCell::new(gain)),
    })
    .unwrap()
}

fn project(titles: &[&str]) -> Arc<Record<Project>> {
    let tracks = Tracks::new();
    tracks
        .insert_many(0, titles.iter().map(|x| track(x, 1.0)))
        .unwrap();
    Record::new(Project {
        tracks: Owned::new(tracks),
        selection: Owned::new(Tracks::foreign()),
        focus: Ref::new(),
    })
    .unwrap()
}

fn folder() -> Arc<Record<Folder>> {
    Record::new(Folder {
        folders: Owned::new(Collection::new()),
    })
    .unwrap()
}

fn titles(tracks: &Tracks) -> Vec<String> {
    tracks.iter().map(|x| x.title.get()).collect()
}

fn path(s: &str) -> NodePath {
    s.parse().unwrap()
}

#[test]
fn paths_run_through_slots_and_positions() {
    let project = project(&["drums", "bass"]);
    let top = project.clone() as NodeRef;
    let bass = project.tracks.get(1).unwrap();
    assert_eq!(path_of(&*bass.title).to_string(), "tracks/1/title");
    let title = resolve_as::<ValueCell<String>>(&top, &path("tracks/1/title")).unwrap();
    assert!(Arc::ptr_eq(&title, bass.title.node()));
    let counter = resolve_as::<ValueCell<i32>>(&top, &path("tracks/-1")).unwrap();
    assert!(Arc::ptr_eq(&counter, project.tracks.counter()));
    assert!(resolve(&top, &NodePath::root()).is_ok());
}

#[test]
fn unresolvable_paths() {
    let project = project(&["drums"]);
    let top = project.clone() as NodeRef;
    assert_eq!(
        resolve(&top, &path("tracks/5/title")).unwrap_err(),
        DocError::PathNotFound {
            path: path("tracks/5/title"),
            segment: "5".into(),
        }
    );
    assert!(matches!(
        resolve(&top, &path("focus")),
        Err(DocError::PathNotFound { .. })
    ));
    assert!(matches!(
        resolve_as::<ValueCell<f64>>(&top, &path("tracks/0/title")),
        Err(DocError::TypeMismatch { .. })
    ));
}

#[test]
fn record_edits_are_undoable() -> anyhow::Result<()> {
    let project = project(&["drums", "bass"]);
    let history = History::new();
    history.set_root(project.clone())?;
    let drums = project.tracks.get(0).unwrap();
    drums.title.set("kit".into())?;
    drums.gain.set(0.5)?;
    project.tracks.remove(0)?;
    assert_eq!(titles(&project.tracks), vec!["bass".to_string()]);
    assert!(!drums.core().has_parent());

    history.undo()?;
    assert_eq!(titles(&project.tracks), vec!["kit".to_string(), "bass".to_string()]);
    assert_eq!(path_of(&*drums.gain).to_string(), "tracks/0/gain");
    history.undo()?;
    history.undo()?;
    assert_eq!(drums.title.get(), "drums");
    assert_eq!(drums.gain.get(), 1.0);
    assert!(!history.has_undo());
    Ok(())
}

#[test]
fn undo_follows_the_node_at_the_recorded_path() -> anyhow::Result<()> {
    let project = project(&["drums", "bass"]);
    let history = History::new();
    history.set_root(project.clone())?;
    let bass = project.tracks.get(1).unwrap();
    bass.title.set("sub".into())?;
    // The remove is undone first, so the recorded path finds bass again.
    project.tracks.remove(0)?;
    history.undo()?;
    history.undo()?;
    assert_eq!(titles(&project.tracks), vec!["drums".to_string(), "bass".to_string()]);
    Ok(())
}

#[test]
fn folders_cannot_contain_their_ancestors() {
    let outer = folder();
    let inner = folder();
    outer.folders.push(inner.clone()).unwrap();
    assert_eq!(path_of(&*inner.folders).to_string(), "folders/0/folders");
    assert!(matches!(
        inner.folders.push(outer.clone()),
        Err(DocError::Cycle { .. })
    ));
    assert!(matches!(
        outer.folders.push(outer.clone()),
        Err(DocError::Cycle { .. })
    ));
    assert!(matches!(
        outer.folders.push(inner.clone()),
        Err(DocError::DuplicateOwnership { index: 0 })
    ));
    assert_eq!(outer.folders.len(), 1);
    assert!(inner.folders.is_empty());
}

#[test]
fn invalid_slot_names_are_rejected() {
    #[derive(Debug)]
    struct Bad {
        a: Owned<ValueCell<i32>>,
        b: Owned<ValueCell<i32>>,
    }

    impl Schema for Bad {
        const TYPE_TAG: &'static str = "bad";

        fn slots(&self) -> Vec<Slot<'_>> {
            vec![Slot::owned("x", &self.a), Slot::owned("x", &self.b)]
        }

        fn from_slots(_reader: &mut SlotReader<'_>) -> DocResult<Self> {
            Err(DocError::decode("bad"))
        }
    }

    let err = Record::new(Bad {
        a: Owned::new(ValueCell::new(1)),
        b: Owned::new(ValueCell::new(2)),
    })
    .unwrap_err();
    assert!(matches!(err, DocError::Configuration(_)));
}

#[test]
fn child_assignment_is_undoable() -> anyhow::Result<()> {
    let bus = bus();
    let history = History::new();
    history.set_root(bus.clone())?;
    let drums = track("drums", 1.0);
    let bass = track("bass", 1.0);
    bus.set_child("input", Some(drums.clone()))?;
    assert_eq!(path_of(&*drums.title).to_string(), "input/title");
    bus.set_child("input", Some(bass.clone()))?;
    assert!(!drums.core().has_parent());
    assert!(Arc::ptr_eq(&bus.input.get().unwrap(), &bass));
    bass.title.set("sub".into())?;
    assert_eq!(history.undo_count(), 3);

    history.undo()?;
    assert_eq!(bass.title.get(), "bass");
    history.undo()?;
    assert!(Arc::ptr_eq(&bus.input.get().unwrap(), &drums));
    assert!(!bass.core().has_parent());
    assert_eq!(path_of(&*drums.gain).to_string(), "input/gain");
    history.undo()?;
    assert!(bus.input.is_empty());
    assert!(!drums.core().has_parent());

    history.redo()?;
    history.redo()?;
    assert!(Arc::ptr_eq(&bus.input.get().unwrap(), &bass));
    assert!(!drums.core().has_parent());
    assert_eq!(path_of(&*bass.gain).to_string(), "input/gain");
    history.redo()?;
    assert_eq!(bass.title.get(), "sub");

    bus.set_child::<Record<Track>>("input", None)?;
    assert!(bus.input.is_empty());
    assert!(!bass.core().has_parent());
    history.undo()?;
    assert!(Arc::ptr_eq(&bus.input.get().unwrap(), &bass));
    Ok(())
}

#[test]
fn child_assignment_rejects_owned_or_mistyped_nodes() -> anyhow::Result<()> {
    let project = project(&["drums"]);
    let bus = bus();
    let history = History::new();
    history.set_root(bus.clone())?;
    let drums = project.tracks.get(0).unwrap();
    assert!(matches!(
        bus.set_child("input", Some(drums.clone())),
        Err(DocError::ParentConflict { .. })
    ));
    assert!(bus.input.is_empty());
    assert_eq!(path_of(&*drums).to_string(), "tracks/0");
    assert!(matches!(
        bus.set_child("input", Some(ValueCell::new(1))),
        Err(DocError::TypeMismatch { .. })
    ));
    assert!(matches!(
        bus.set_child("label", Some(track("x", 0.0))),
        Err(DocError::NotFound(_))
    ));
    assert!(bus.input.is_empty());
    assert!(!history.has_undo());
    Ok(())
}

#[test]
fn child_slot_round_trip() -> anyhow::Result<()> {
    let mut registry = Registry::with_defaults();
    registry.register::<Record<Bus>>();
    let bus = bus();
    let element = serialize(&*bus)?;
    assert_eq!(element.children.len(), 1);
    let rebuilt = registry
        .deserialize(&element)?
        .into_any()
        .downcast::<Record<Bus>>()
        .unwrap();
    assert!(rebuilt.input.is_empty());

    bus.set_child("input", Some(track("keys", 0.5)))?;
    let element = serialize(&*bus)?;
    let rebuilt = registry
        .deserialize(&element)?
        .into_any()
        .downcast::<Record<Bus>>()
        .unwrap();
    let input = rebuilt.input.get().unwrap();
    assert_eq!(input.title.get(), "keys");
    assert_eq!(path_of(&*input.gain).to_string(), "input/gain");
    Ok(())
}

fn registry() -> Registry {
    let mut registry = Registry::with_defaults();
    registry.register::<Record<Project>>();
    registry
}

#[test]
fn project_round_trip_restores_references() -> anyhow::Result<()> {
    let project = project(&["drums", "bass", "keys"]);
    let keys = project.tracks.get(2).unwrap();
    let drums = project.tracks.get(0).unwrap();
    project.focus.set(&keys);
    project.selection.push(keys.clone())?;
    project.selection.push(drums.clone())?;

    let element = serialize(&*project)?;
    let json = serde_json::to_string(&element)?;
    let decoded: Element = serde_json::from_str(&json)?;
    assert_eq!(decoded, element);

    let rebuilt = registry()
        .deserialize(&decoded)?
        .into_any()
        .downcast::<Record<Project>>()
        .unwrap();
    assert_eq!(
        titles(&rebuilt.tracks),
        vec!["drums".to_string(), "bass".to_string(), "keys".to_string()]
    );
    let focus = rebuilt.focus.get().unwrap();
    assert!(Arc::ptr_eq(&focus, &rebuilt.tracks.get(2).unwrap()));
    assert!(!Arc::ptr_eq(&focus, &keys));
    assert_eq!(titles(&rebuilt.selection), vec!["keys".to_string(), "drums".to_string()]);
    assert!(Arc::ptr_eq(
        &rebuilt.selection.get(1).unwrap(),
        &rebuilt.tracks.get(0).unwrap()
    ));
    assert!(rebuilt.selection.is_foreign());
    assert!(!rebuilt.core().has_parent());

    // The rebuilt tree is a regular document.
    let history = History::new();
    history.set_root(rebuilt.clone())?;
    focus.title.set("lead".into())?;
    history.undo()?;
    assert_eq!(focus.title.get(), "keys");
    Ok(())
}

#[test]
fn references_outside_the_serialized_tree_are_dropped() -> anyhow::Result<()> {
    let project = project(&["drums"]);
    let stray = track("stray", 0.0);
    project.focus.set(&stray);
    project.selection.push(project.tracks.get(0).unwrap())?;

    let element = serialize(&*project)?;
    assert!(element.refs.is_empty());
    let rebuilt = registry()
        .deserialize(&element)?
        .into_any()
        .downcast::<Record<Project>>()
        .unwrap();
    assert!(rebuilt.focus.get().is_none());
    assert_eq!(rebuilt.selection.len(), 1);

    // Serializing the selection alone loses its targets.
    let selection = serialize(&*project.selection)?;
    assert_eq!(selection.value, Some(serde_json::Value::from("foreign")));
    assert!(selection.refs.is_empty());
    Ok(())
}

#[test]
fn subtree_serialization_uses_relative_names() -> anyhow::Result<()> {
    let project = project(&["drums", "bass"]);
    let bass = project.tracks.get(1).unwrap();
    let element = serialize(&*bass)?;
    assert_eq!(element.tag, "track");
    assert_eq!(element.name, "1");
    assert_eq!(
        element.children.iter().map(|x| x.name.as_str()).collect::<Vec<_>>(),
        vec!["title", "gain"]
    );

    let mut registry = Registry::new();
    registry.register::<Record<Track>>();
    let copy = registry
        .deserialize(&element)?
        .into_any()
        .downcast::<Record<Track>>()
        .unwrap();
    assert_eq!(copy.title.get(), "bass");
    assert!(!copy.core().has_parent());
    assert_eq!(path_of(&*copy.gain).to_string(), "gain");
    Ok(())
}

#[test]
fn decode_errors() {
    let registry = registry();
    let mut element = serialize(&*project(&["drums"])).unwrap();
    element.children.retain(|x| x.name != "selection");
    assert!(matches!(
        registry.deserialize(&element),
        Err(DocError::Decode(_))
    ));
    assert!(matches!(
        registry.deserialize(&Element::new("track", "")),
        Err(DocError::UnknownTypeTag(_))
    ));
}
