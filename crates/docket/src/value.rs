use std::{
    any::Any,
    borrow::Cow,
    fmt::Debug,
    sync::{Arc, Weak},
};

use docket_common::{DocError, DocResult, InternalString, TxnId};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    history::History,
    node::{Node, NodeCore, NodeKind, NodeRef, WeakNodeRef},
    observer::{Coalesce, Delivery, Observers, Subscription},
    op::SetValueOp,
    persist::{Element, NodeType, SerializeCx},
};

/// Types that can live in a [ValueCell].
///
/// A type declares which equality rules it can evaluate. Asking a cell for a
/// rule its type cannot evaluate is a configuration error reported by
/// [ValueCell::set].
pub trait CellValue: Clone + Debug + Send + Sync + 'static {
    const TYPE_NAME: &'static str;

    fn default_equality() -> Equality<Self> {
        Equality::Value
    }

    fn value_eq(&self, _other: &Self) -> Option<bool> {
        None
    }

    fn identity_eq(&self, _other: &Self) -> Option<bool> {
        None
    }

    fn to_json(&self) -> DocResult<serde_json::Value> {
        Err(DocError::configuration(format!(
            "`{}` values cannot be serialized",
            Self::TYPE_NAME
        )))
    }

    fn from_json(_value: &serde_json::Value) -> DocResult<Self> {
        Err(DocError::configuration(format!(
            "`{}` values cannot be deserialized",
            Self::TYPE_NAME
        )))
    }
}

fn json_of<T: Serialize>(value: &T) -> DocResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| DocError::decode(e.to_string()))
}

fn from_json_of<T: DeserializeOwned>(value: &serde_json::Value) -> DocResult<T> {
    T::deserialize(value).map_err(|e| DocError::decode(e.to_string()))
}

macro_rules! impl_plain_value {
    ($($t:ty => $name:literal),* $(,)?) => {
        $(
            impl CellValue for $t {
                const TYPE_NAME: &'static str = $name;

                fn value_eq(&self, other: &Self) -> Option<bool> {
                    Some(self == other)
                }

                fn to_json(&self) -> DocResult<serde_json::Value> {
                    json_of(self)
                }

                fn from_json(value: &serde_json::Value) -> DocResult<Self> {
                    from_json_of(value)
                }
            }
        )*
    };
}

impl_plain_value!(
    bool => "bool",
    i8 => "i8",
    i16 => "i16",
    i32 => "i32",
    i64 => "i64",
    u8 => "u8",
    u16 => "u16",
    u32 => "u32",
    u64 => "u64",
    usize => "usize",
    f32 => "f32",
    f64 => "f64",
    char => "char",
    String => "string",
    InternalString => "istring",
);

impl<T: CellValue> CellValue for Option<T> {
    const TYPE_NAME: &'static str = "option";

    fn value_eq(&self, other: &Self) -> Option<bool> {
        match (self, other) {
            (None, None) => Some(true),
            (Some(a), Some(b)) => a.value_eq(b),
            _ => Some(false),
        }
    }

    fn identity_eq(&self, other: &Self) -> Option<bool> {
        match (self, other) {
            (None, None) => Some(true),
            (Some(a), Some(b)) => a.identity_eq(b),
            _ => Some(false),
        }
    }

    fn default_equality() -> Equality<Self> {
        match T::default_equality() {
            Equality::Identity => Equality::Identity,
            _ => Equality::Value,
        }
    }

    fn to_json(&self) -> DocResult<serde_json::Value> {
        match self {
            Some(v) => v.to_json(),
            None => Ok(serde_json::Value::Null),
        }
    }

    fn from_json(value: &serde_json::Value) -> DocResult<Self> {
        if value.is_null() {
            return Ok(None);
        }

        T::from_json(value).map(Some)
    }
}

impl<T: CellValue> CellValue for Vec<T> {
    const TYPE_NAME: &'static str = "vec";

    fn value_eq(&self, other: &Self) -> Option<bool> {
        if self.len() != other.len() {
            return Some(false);
        }

        for (a, b) in self.iter().zip(other.iter()) {
            if !a.value_eq(b)? {
                return Some(false);
            }
        }

        Some(true)
    }

    fn to_json(&self) -> DocResult<serde_json::Value> {
        self.iter()
            .map(|x| x.to_json())
            .collect::<DocResult<Vec<_>>>()
            .map(serde_json::Value::Array)
    }

    fn from_json(value: &serde_json::Value) -> DocResult<Self> {
        let list = value
            .as_array()
            .ok_or_else(|| DocError::decode(format!("expected a list, found {}", value)))?;
        list.iter().map(T::from_json).collect()
    }
}

/// Object-like values: compared by identity, serialized through serde.
impl<T> CellValue for Arc<T>
where
    T: Serialize + DeserializeOwned + Debug + Send + Sync + 'static,
{
    const TYPE_NAME: &'static str = "arc";

    fn default_equality() -> Equality<Self> {
        Equality::Identity
    }

    fn identity_eq(&self, other: &Self) -> Option<bool> {
        Some(Arc::ptr_eq(self, other))
    }

    fn to_json(&self) -> DocResult<serde_json::Value> {
        json_of(&**self)
    }

    fn from_json(value: &serde_json::Value) -> DocResult<Self> {
        from_json_of::<T>(value).map(Arc::new)
    }
}

/// How a cell decides whether an assignment is a real change.
pub enum Equality<T> {
    /// `==` on the value.
    Value,
    /// Pointer identity of object-like values.
    Identity,
    Custom(Arc<dyn Fn(&T, &T) -> bool + Send + Sync>),
    /// Every assignment is recorded.
    Never,
}

impl<T> Clone for Equality<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Value => Self::Value,
            Self::Identity => Self::Identity,
            Self::Custom(f) => Self::Custom(f.clone()),
            Self::Never => Self::Never,
        }
    }
}

impl<T> Debug for Equality<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value => f.write_str("Value"),
            Self::Identity => f.write_str("Identity"),
            Self::Custom(_) => f.write_str("Custom"),
            Self::Never => f.write_str("Never"),
        }
    }
}

impl<T: CellValue> Equality<T> {
    pub fn custom(f: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    pub fn is_equal(&self, a: &T, b: &T) -> DocResult<bool> {
        let unsupported = |rule: &str| {
            DocError::configuration(format!(
                "`{}` does not support {} equality",
                T::TYPE_NAME,
                rule
            ))
        };
        match self {
            Self::Value => a.value_eq(b).ok_or_else(|| unsupported("value")),
            Self::Identity => a.identity_eq(b).ok_or_else(|| unsupported("identity")),
            Self::Custom(f) => Ok(f(a, b)),
            Self::Never => Ok(false),
        }
    }
}

/// Which transaction id a cell's recorded edits use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TxnIdMode {
    /// The cell's own identity: consecutive edits of the same cell merge into
    /// one undo step.
    Own,
    /// A freshly allocated id per edit.
    #[default]
    Unique,
    /// A caller-supplied id, to coalesce the edits of one gesture.
    Fixed(TxnId),
}

impl TxnIdMode {
    pub(crate) fn resolve(&self, core: &NodeCore, history: &History) -> TxnId {
        match self {
            TxnIdMode::Own => core.uid().into(),
            TxnIdMode::Unique => history.allocate_id(),
            TxnIdMode::Fixed(id) => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueEvent<T> {
    pub old: T,
    pub new: T,
}

impl<T> Coalesce for ValueEvent<T> {
    fn coalesce(&mut self, later: Self) {
        self.new = later.new;
    }
}

struct CellConfig<T> {
    equality: Equality<T>,
    txn_mode: TxnIdMode,
    label: Option<InternalString>,
}

/// A single observable value slot.
pub struct ValueCell<T: CellValue> {
    core: NodeCore,
    value: Mutex<T>,
    config: Mutex<CellConfig<T>>,
    observers: Observers<ValueEvent<T>>,
}

impl<T: CellValue> Debug for ValueCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueCell")
            .field("name", &self.core.name())
            .field("value", &*self.value.lock())
            .finish()
    }
}

impl<T: CellValue> ValueCell<T> {
    pub fn new(value: T) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let this: WeakNodeRef = this.clone();
            Self {
                core: NodeCore::new(this),
                value: Mutex::new(value),
                config: Mutex::new(CellConfig {
                    equality: T::default_equality(),
                    txn_mode: TxnIdMode::default(),
                    label: None,
                }),
                observers: Observers::new(),
            }
        })
    }

    pub fn get(&self) -> T {
        self.value.lock().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.lock())
    }

    pub fn set_equality(&self, equality: Equality<T>) {
        self.config.lock().equality = equality;
    }

    pub fn set_txn_mode(&self, mode: TxnIdMode) {
        self.config.lock().txn_mode = mode;
    }

    pub fn txn_mode(&self) -> TxnIdMode {
        self.config.lock().txn_mode
    }

    /// Name of the undo step recorded by [ValueCell::set].
    pub fn set_label(&self, label: impl Into<InternalString>) {
        self.config.lock().label = Some(label.into());
    }

    /// Assigns a new value.
    ///
    /// Equal values (under the cell's [Equality]) are ignored. A cell outside
    /// the history tree is updated in place; inside it, the edit is recorded
    /// as one undoable operation.
    pub fn set(&self, value: T) -> DocResult<()> {
        let (equality, mode, label) = {
            let config = self.config.lock();
            (config.equality.clone(), config.txn_mode, config.label.clone())
        };
        let old = self.get();
        if equality.is_equal(&old, &value)? {
            return Ok(());
        }

        let (Some(history), Some(this)) = (self.core.history(), self.core.this()) else {
            self.force_set(value);
            return Ok(());
        };

        let id = mode.resolve(&self.core, &history);
        let name = label.unwrap_or_else(|| InternalString::from("Set value"));
        let op = SetValueOp::new(this, old, value);
        history.execute_in_transaction(id, &name, || history.execute(Box::new(op)))
    }

    pub fn update(&self, f: impl FnOnce(&T) -> T) -> DocResult<()> {
        let value = self.with(f);
        self.set(value)
    }

    /// Assigns without consulting the history and notifies observers.
    ///
    /// Returns the previous value.
    pub fn force_set(&self, value: T) -> T {
        let old = std::mem::replace(&mut *self.value.lock(), value.clone());
        self.observers.emit(
            ValueEvent {
                old: old.clone(),
                new: value,
            },
            self.core.history().as_ref(),
        );
        old
    }

    pub fn subscribe(
        &self,
        delivery: Delivery,
        callback: impl Fn(&ValueEvent<T>) + Send + Sync + 'static,
    ) -> Subscription {
        self.observers.subscribe(delivery, callback)
    }
}

impl<T: CellValue> Node for ValueCell<T> {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Value
    }

    fn child(&self, _segment: &str) -> Option<NodeRef> {
        None
    }

    fn children(&self) -> Vec<NodeRef> {
        Vec::new()
    }

    fn type_tag(&self) -> Cow<'static, str> {
        Self::static_type_tag()
    }

    fn to_element(&self, _cx: &SerializeCx) -> DocResult<Element> {
        let value = self.with(|v| v.to_json())?;
        let mut element = Element::new(self.type_tag(), &self.core.name());
        element.value = Some(value);
        Ok(element)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T: CellValue> NodeType for ValueCell<T> {
    fn static_type_tag() -> Cow<'static, str> {
        Cow::Owned(format!("value<{}>", T::TYPE_NAME))
    }

    fn from_element(element: &Element) -> DocResult<Arc<Self>> {
        element.expect_tag(&Self::static_type_tag())?;
        let value = element
            .value
            .as_ref()
            .ok_or_else(|| DocError::decode(format!("`{}` has no value", element.name)))?;
        Ok(ValueCell::new(T::from_json(value)?))
    }
}
