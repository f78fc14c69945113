use std::fmt;

use crate::error::{ErrorKind, RuntimeError};

/// The discriminant of a [`Value`].
///
/// Tag numbering is part of the game image format: tag bytes in the list,
/// map, object, and function tables, and the type byte of the `Push8/16/32`
/// opcodes, carry these exact values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueTag {
    None = 0,
    Integer = 1,
    String = 2,
    List = 3,
    Map = 4,
    /// A function ("node" in compiler parlance).
    Node = 5,
    Object = 6,
    /// A property id on an object.
    Property = 7,
    /// A reinterpretation target for `AsType`/`New`.
    TypeId = 8,
    /// A bytecode offset relative to the current frame's base address.
    JumpTarget = 9,
    /// A destination-only reference to a local slot. Never a stored value.
    VarRef = 10,
    /// A dense index into the vocabulary table.
    Vocab = 11,
    /// An indirection through a local slot, resolved on evaluation.
    LocalVar = 12,
    /// Wildcard, valid only in function argument declarations.
    Any = 13,
}

impl ValueTag {
    pub const COUNT: usize = ValueTag::Any as usize + 1;

    pub const fn name(self) -> &'static str {
        match self {
            ValueTag::None => "none",
            ValueTag::Integer => "integer",
            ValueTag::String => "string",
            ValueTag::List => "list",
            ValueTag::Map => "map",
            ValueTag::Node => "function",
            ValueTag::Object => "object",
            ValueTag::Property => "property",
            ValueTag::TypeId => "type-id",
            ValueTag::JumpTarget => "jump-target",
            ValueTag::VarRef => "var-ref",
            ValueTag::Vocab => "vocab",
            ValueTag::LocalVar => "local-var",
            ValueTag::Any => "any",
        }
    }
}

impl TryFrom<u8> for ValueTag {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: ValueTag is repr(u8) with contiguous variants from 0.
            Ok(unsafe { core::mem::transmute::<u8, ValueTag>(byte) })
        } else {
            Err(byte)
        }
    }
}

impl fmt::Display for ValueTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The tagged scalar flowing through the whole machine.
///
/// The payload is always a 32-bit integer; its meaning depends on the tag
/// (literal integer, heap ident, property id, jump offset, local slot index,
/// vocabulary index). A Value may additionally carry a transient `this`
/// binding, the object that a function-typed property was read from. It
/// routes method-style calls and takes no part in equality or hashing.
#[derive(Debug, Clone, Copy)]
pub struct Value {
    pub tag: ValueTag,
    pub payload: i32,
    this: Option<i32>,
}

impl Value {
    pub const fn new(tag: ValueTag, payload: i32) -> Self {
        Self {
            tag,
            payload,
            this: None,
        }
    }

    pub const fn none() -> Self {
        Self::new(ValueTag::None, 0)
    }

    pub const fn integer(v: i32) -> Self {
        Self::new(ValueTag::Integer, v)
    }

    pub const fn string(ident: i32) -> Self {
        Self::new(ValueTag::String, ident)
    }

    pub const fn list(ident: i32) -> Self {
        Self::new(ValueTag::List, ident)
    }

    pub const fn map(ident: i32) -> Self {
        Self::new(ValueTag::Map, ident)
    }

    pub const fn node(ident: i32) -> Self {
        Self::new(ValueTag::Node, ident)
    }

    pub const fn object(ident: i32) -> Self {
        Self::new(ValueTag::Object, ident)
    }

    pub const fn property(id: i32) -> Self {
        Self::new(ValueTag::Property, id)
    }

    pub const fn type_id(tag: ValueTag) -> Self {
        Self::new(ValueTag::TypeId, tag as i32)
    }

    pub const fn jump_target(offset: i32) -> Self {
        Self::new(ValueTag::JumpTarget, offset)
    }

    pub const fn var_ref(slot: i32) -> Self {
        Self::new(ValueTag::VarRef, slot)
    }

    pub const fn vocab(index: i32) -> Self {
        Self::new(ValueTag::Vocab, index)
    }

    pub const fn local_var(slot: i32) -> Self {
        Self::new(ValueTag::LocalVar, slot)
    }

    /// Attach a self binding (the object a method was looked up on).
    pub const fn with_this(mut self, object_ident: i32) -> Self {
        self.this = Some(object_ident);
        self
    }

    pub const fn this(&self) -> Option<i32> {
        self.this
    }

    pub const fn is_none(&self) -> bool {
        matches!(self.tag, ValueTag::None)
    }

    /// The composite key used when this value keys a map entry.
    pub fn key(&self) -> MapKey {
        MapKey {
            tag: self.tag,
            payload: self.payload,
        }
    }

    /// Whether a conditional jump treats this value as zero.
    pub fn is_zero(&self) -> bool {
        match self.tag {
            ValueTag::None => true,
            _ => self.payload == 0,
        }
    }

    pub fn require_type(&self, tag: ValueTag) -> Result<(), RuntimeError> {
        if self.tag == tag {
            Ok(())
        } else {
            Err(RuntimeError::new(
                ErrorKind::TypeMismatch,
                format!("expected {}, got {}", tag, self.tag),
            ))
        }
    }

    pub fn require_either(
        &self,
        a: ValueTag,
        b: ValueTag,
    ) -> Result<(), RuntimeError> {
        if self.tag == a || self.tag == b {
            Ok(())
        } else {
            Err(RuntimeError::new(
                ErrorKind::TypeMismatch,
                format!("expected {} or {}, got {}", a, b, self.tag),
            ))
        }
    }

    pub fn forbid_type(&self, tag: ValueTag) -> Result<(), RuntimeError> {
        if self.tag == tag {
            Err(RuntimeError::new(
                ErrorKind::TypeMismatch,
                format!("{} not allowed here", tag),
            ))
        } else {
            Ok(())
        }
    }
}

impl PartialEq for Value {
    /// Equality ignores the self binding: tag and payload only.
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag && self.payload == other.payload
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag, self.payload)
    }
}

/// Map key: the `tag:payload` composite of a [`Value`], self binding dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapKey {
    pub tag: ValueTag,
    pub payload: i32,
}

impl MapKey {
    pub fn value(&self) -> Value {
        Value::new(self.tag, self.payload)
    }
}

impl From<Value> for MapKey {
    fn from(v: Value) -> Self {
        v.key()
    }
}

/// The single comparison primitive behind every comparison opcode.
///
/// Values of different tags never compare equal, regardless of payload.
/// Two integers compare by signed difference; equal tags of any other kind
/// compare equal iff payloads match; None equals None.
pub fn compare(left: Value, right: Value) -> i32 {
    if left.tag != right.tag {
        return 1;
    }
    match left.tag {
        ValueTag::None => 0,
        ValueTag::Integer => {
            (left.payload as i64 - right.payload as i64).signum() as i32
        }
        _ => {
            if left.payload == right.payload {
                0
            } else {
                1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trips_through_byte() {
        for byte in 0..ValueTag::COUNT as u8 {
            let tag = ValueTag::try_from(byte).unwrap();
            assert_eq!(tag as u8, byte);
        }
        assert!(ValueTag::try_from(ValueTag::COUNT as u8).is_err());
        assert!(ValueTag::try_from(0xFF).is_err());
    }

    #[test]
    fn equality_ignores_self_binding() {
        let plain = Value::node(7);
        let bound = Value::node(7).with_this(3);
        assert_eq!(plain, bound);
        assert_eq!(plain.key(), bound.key());
    }

    #[test]
    fn compare_is_reflexive_for_integers() {
        for v in [i32::MIN, -1, 0, 1, 42, i32::MAX] {
            assert_eq!(compare(Value::integer(v), Value::integer(v)), 0);
        }
    }

    #[test]
    fn compare_orders_integers_without_overflow() {
        assert!(compare(Value::integer(i32::MIN), Value::integer(i32::MAX)) < 0);
        assert!(compare(Value::integer(i32::MAX), Value::integer(i32::MIN)) > 0);
        assert!(compare(Value::integer(-3), Value::integer(5)) < 0);
    }

    #[test]
    fn compare_mismatched_tags_is_never_equal() {
        assert_ne!(compare(Value::integer(4), Value::string(4)), 0);
        assert_ne!(compare(Value::none(), Value::integer(0)), 0);
        assert_eq!(compare(Value::none(), Value::none()), 0);
        assert_eq!(compare(Value::object(9), Value::object(9)), 0);
        assert_ne!(compare(Value::object(9), Value::object(10)), 0);
    }

    #[test]
    fn type_checks_enforce_tag_constraints() {
        let v = Value::string(1);
        assert!(v.require_type(ValueTag::String).is_ok());
        let err = v.require_type(ValueTag::Integer).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TypeMismatch);
        assert!(v.require_either(ValueTag::List, ValueTag::String).is_ok());
        assert!(v.require_either(ValueTag::List, ValueTag::Map).is_err());
        assert!(v.forbid_type(ValueTag::String).is_err());
        assert!(v.forbid_type(ValueTag::VarRef).is_ok());
    }
}
