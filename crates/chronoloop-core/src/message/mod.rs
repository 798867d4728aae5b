//! Message envelopes.
//!
//! A [`Message`] carries a numeric kind (`what`), up to [`MAX_FIELDS`] named
//! typed fields and an optional binding to a target handler. Posting moves the
//! message into the target's looper; the looper hands it back to the handler on
//! its worker thread once the deadline has passed.
//!
//! Messages are owned values. Whoever holds one (the poster, a looper queue, or
//! a handler during delivery) is the only party acting on its fields.

mod field;

pub use field::{FieldType, FieldValue, Pointer, Rect, MAX_FIELDS};

use field::FieldTable;

use crate::error::{Error, Result};
use crate::runtime::{HandlerId, HandlerRef};

/// A typed, named-field envelope bound to a target handler.
#[derive(Clone, Debug, Default)]
pub struct Message {
    what: u32,
    fields: FieldTable,
    target: Option<HandlerRef>,
}

macro_rules! scalar_field {
    ($set:ident, $find:ident, $variant:ident, $ty:ty) => {
        #[doc = concat!("Set a `", stringify!($ty), "` field, replacing any value under `name`.")]
        pub fn $set(&mut self, name: &str, value: $ty) -> Result<()> {
            self.fields.set(name, FieldValue::$variant(value))
        }

        #[doc = concat!("Look up a `", stringify!($ty), "` field. `None` if absent or of another type.")]
        pub fn $find(&self, name: &str) -> Option<$ty> {
            match self.fields.get_typed(name, FieldType::$variant) {
                Some(FieldValue::$variant(value)) => Some(*value),
                _ => None,
            }
        }
    };
}

impl Message {
    /// Create a message of kind `what` bound to `target`.
    pub fn new(what: u32, target: &HandlerRef) -> Self {
        Self {
            what,
            fields: FieldTable::new(),
            target: Some(target.clone()),
        }
    }

    /// Create an unbound message with kind 0.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create an unbound message of kind `what`.
    pub fn with_what(what: u32) -> Self {
        Self {
            what,
            ..Self::default()
        }
    }

    pub fn what(&self) -> u32 {
        self.what
    }

    pub fn set_what(&mut self, what: u32) {
        self.what = what;
    }

    /// Rebind the message. `None` clears both the handler and looper binding.
    pub fn set_target(&mut self, target: Option<&HandlerRef>) {
        self.target = target.cloned();
    }

    /// The handler this message is bound to, if any.
    pub fn target(&self) -> Option<&HandlerRef> {
        self.target.as_ref()
    }

    pub(crate) fn target_id(&self) -> Option<HandlerId> {
        self.target.as_ref().map(HandlerRef::id)
    }

    scalar_field!(set_int32, find_int32, Int32, i32);
    scalar_field!(set_int64, find_int64, Int64, i64);
    scalar_field!(set_size, find_size, Size, usize);
    scalar_field!(set_float, find_float, Float, f32);
    scalar_field!(set_double, find_double, Double, f64);
    scalar_field!(set_rect, find_rect, Rect, Rect);

    /// Set a string field. The message owns its own copy of the text.
    pub fn set_string(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        self.fields.set(name, FieldValue::String(value.into()))
    }

    /// Look up a string field.
    pub fn find_string(&self, name: &str) -> Option<&str> {
        match self.fields.get_typed(name, FieldType::String) {
            Some(FieldValue::String(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Set an opaque pointer field. Duplicates share the payload.
    pub fn set_pointer(&mut self, name: &str, value: Pointer) -> Result<()> {
        self.fields.set(name, FieldValue::Pointer(value))
    }

    /// Look up a pointer field.
    pub fn find_pointer(&self, name: &str) -> Option<Pointer> {
        match self.fields.get_typed(name, FieldType::Pointer) {
            Some(FieldValue::Pointer(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Set a field from an already-built value.
    pub fn set_field(&mut self, name: &str, value: FieldValue) -> Result<()> {
        self.fields.set(name, value)
    }

    /// Typed lookup that treats a type mismatch as absence.
    pub fn find_field(&self, name: &str, ty: FieldType) -> Option<&FieldValue> {
        self.fields.get_typed(name, ty)
    }

    /// Typed lookup that says why nothing was found.
    pub fn field(&self, name: &str, ty: FieldType) -> Result<&FieldValue> {
        let value = self
            .fields
            .get(name)
            .ok_or_else(|| Error::FieldNotFound(name.to_string()))?;
        if value.field_type() != ty {
            return Err(Error::FieldTypeMismatch {
                name: name.to_string(),
                expected: ty,
                found: value.field_type(),
            });
        }
        Ok(value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.get(name).is_some()
    }

    /// Remove a field, returning its value.
    pub fn remove_field(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    /// Drop every field. Kind and target are kept.
    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.len() == 0
    }

    /// Iterate fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter()
    }

    /// Deep copy: same kind and target, strings copied, pointer payloads shared.
    pub fn dup(&self) -> Message {
        self.clone()
    }

    /// Post to the bound handler's looper for delivery in `delay_us`
    /// microseconds. Non-positive delays mean "as soon as possible".
    ///
    /// Fails with [`Error::TargetGone`] if the message is unbound or the looper
    /// has been dropped.
    pub fn post(self, delay_us: i64) -> Result<()> {
        let looper = self
            .target
            .as_ref()
            .and_then(|target| target.looper())
            .ok_or(Error::TargetGone)?;
        looper.post(self, delay_us);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_typed_roundtrip() {
        let mut msg = Message::with_what(7);
        msg.set_int32("i32", -3).unwrap();
        msg.set_int64("i64", 1 << 40).unwrap();
        msg.set_size("size", 12).unwrap();
        msg.set_float("f", 0.25).unwrap();
        msg.set_double("d", 2.5).unwrap();
        msg.set_string("s", "hello").unwrap();
        msg.set_rect("r", Rect::new(0, 0, 640, 480)).unwrap();

        assert_eq!(msg.what(), 7);
        assert_eq!(msg.find_int32("i32"), Some(-3));
        assert_eq!(msg.find_int64("i64"), Some(1 << 40));
        assert_eq!(msg.find_size("size"), Some(12));
        assert_eq!(msg.find_float("f"), Some(0.25));
        assert_eq!(msg.find_double("d"), Some(2.5));
        assert_eq!(msg.find_string("s"), Some("hello"));
        assert_eq!(msg.find_rect("r"), Some(Rect::new(0, 0, 640, 480)));
        assert_eq!(msg.len(), 7);
        assert!(msg.find_int32("missing").is_none());
    }

    #[test]
    fn test_overwrite_with_other_type() {
        let mut msg = Message::empty();
        msg.set_string("value", "old").unwrap();
        msg.set_int64("value", 42).unwrap();

        assert!(msg.find_string("value").is_none());
        assert_eq!(msg.find_int64("value"), Some(42));
        assert_eq!(msg.len(), 1);
        assert!(matches!(
            msg.field("value", FieldType::String),
            Err(Error::FieldTypeMismatch {
                found: FieldType::Int64,
                ..
            })
        ));
        assert!(matches!(
            msg.field("nope", FieldType::Int64),
            Err(Error::FieldNotFound(_))
        ));
    }

    #[test]
    fn test_dup_strings_are_independent() {
        let mut original = Message::with_what(3);
        original.set_string("name", "clock").unwrap();
        original.set_int32("n", 1).unwrap();

        let mut copy = original.dup();
        assert_eq!(copy.what(), 3);
        assert_eq!(copy.find_string("name"), Some("clock"));

        copy.set_string("name", "changed").unwrap();
        original.set_int32("n", 2).unwrap();
        assert_eq!(original.find_string("name"), Some("clock"));
        assert_eq!(copy.find_string("name"), Some("changed"));
        assert_eq!(copy.find_int32("n"), Some(1));
    }

    #[test]
    fn test_dup_shares_pointer_payload() {
        let payload: Pointer = Arc::new(String::from("frame"));
        let mut msg = Message::empty();
        msg.set_pointer("buffer", payload.clone()).unwrap();
        let copy = msg.dup();

        let shared = copy.find_pointer("buffer").unwrap();
        assert!(Arc::ptr_eq(&shared, &payload));
        assert_eq!(shared.downcast_ref::<String>().map(String::as_str), Some("frame"));
    }

    #[test]
    fn test_capacity_exceeded_keeps_message_intact() {
        let mut msg = Message::empty();
        for i in 0..MAX_FIELDS {
            msg.set_int32(&format!("k{i}"), i as i32).unwrap();
        }
        assert!(matches!(
            msg.set_string("extra", "x"),
            Err(Error::FieldCapacityExceeded { .. })
        ));
        assert_eq!(msg.len(), MAX_FIELDS);
        assert!(!msg.contains("extra"));
    }

    #[test]
    fn test_post_unbound_is_target_gone() {
        let msg = Message::with_what(1);
        assert!(matches!(msg.post(0), Err(Error::TargetGone)));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut msg = Message::with_what(9);
        msg.set_int32("a", 1).unwrap();
        msg.set_int32("b", 2).unwrap();
        assert!(matches!(msg.remove_field("a"), Some(FieldValue::Int32(1))));
        assert!(!msg.contains("a"));
        msg.clear();
        assert!(msg.is_empty());
        assert_eq!(msg.what(), 9);
    }
}
