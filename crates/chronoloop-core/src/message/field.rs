//! Fixed-capacity table of named, typed message fields.

use std::any::Any;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Maximum number of distinct field names a message can carry.
pub const MAX_FIELDS: usize = 64;

/// Opaque payload carried by pointer fields. Duplicating a message shares it.
pub type Pointer = Arc<dyn Any + Send + Sync>;

/// Integer rectangle (edges, not origin + size).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }
}

/// The type tag of a field value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int32,
    Int64,
    Size,
    Float,
    Double,
    Pointer,
    String,
    Rect,
}

/// A single field value.
#[derive(Clone)]
pub enum FieldValue {
    Int32(i32),
    Int64(i64),
    Size(usize),
    Float(f32),
    Double(f64),
    Pointer(Pointer),
    String(String),
    Rect(Rect),
}

impl FieldValue {
    /// The type tag of this value.
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Int32(_) => FieldType::Int32,
            FieldValue::Int64(_) => FieldType::Int64,
            FieldValue::Size(_) => FieldType::Size,
            FieldValue::Float(_) => FieldType::Float,
            FieldValue::Double(_) => FieldType::Double,
            FieldValue::Pointer(_) => FieldType::Pointer,
            FieldValue::String(_) => FieldType::String,
            FieldValue::Rect(_) => FieldType::Rect,
        }
    }
}

impl std::fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Int32(v) => write!(f, "Int32({v})"),
            FieldValue::Int64(v) => write!(f, "Int64({v})"),
            FieldValue::Size(v) => write!(f, "Size({v})"),
            FieldValue::Float(v) => write!(f, "Float({v})"),
            FieldValue::Double(v) => write!(f, "Double({v})"),
            FieldValue::Pointer(p) => write!(f, "Pointer({:p})", Arc::as_ptr(p)),
            FieldValue::String(s) => write!(f, "String({s:?})"),
            FieldValue::Rect(r) => write!(f, "Rect({r:?})"),
        }
    }
}

#[derive(Clone, Debug)]
struct Field {
    name: String,
    value: FieldValue,
}

/// Ordered field storage, bounded at [`MAX_FIELDS`] and searched linearly.
#[derive(Clone, Debug, Default)]
pub(crate) struct FieldTable {
    items: Vec<Field>,
}

impl FieldTable {
    pub(crate) fn new() -> Self {
        Self { items: Vec::new() }
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.items.iter().position(|item| item.name == name)
    }

    /// Insert or replace. The old value (and any string it owned) is dropped
    /// before the new one is stored.
    pub(crate) fn set(&mut self, name: &str, value: FieldValue) -> Result<()> {
        match self.index_of(name) {
            Some(index) => {
                self.items[index].value = value;
                Ok(())
            }
            None if self.items.len() >= MAX_FIELDS => Err(Error::FieldCapacityExceeded {
                name: name.to_string(),
                capacity: MAX_FIELDS,
            }),
            None => {
                self.items.push(Field {
                    name: name.to_string(),
                    value,
                });
                Ok(())
            }
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&FieldValue> {
        self.index_of(name).map(|index| &self.items[index].value)
    }

    pub(crate) fn get_typed(&self, name: &str, ty: FieldType) -> Option<&FieldValue> {
        self.get(name).filter(|value| value.field_type() == ty)
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.index_of(name).map(|index| self.items.remove(index).value)
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.items
            .iter()
            .map(|item| (item.name.as_str(), &item.value))
    }
}
