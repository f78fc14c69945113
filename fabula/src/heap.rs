use indexmap::IndexMap;

use crate::error::{ErrorKind, RuntimeError};
use crate::value::{MapKey, Value, ValueTag};

/// Ident 0 means "no object" in parent/child/sibling links.
pub const NO_OBJECT: i32 = 0;

/// Where an entity was defined, for the `Origin` opcode.
///
/// `file` is the ident of a string-table entry holding the source file name;
/// a negative ident means the compiler stripped debug info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Dynamic,
    Source { file: i32, line: i32 },
}

#[derive(Debug)]
pub struct StringEntry {
    pub ident: i32,
    pub is_static: bool,
    pub marked: bool,
    pub origin: Origin,
    pub text: String,
}

#[derive(Debug)]
pub struct ListEntry {
    pub ident: i32,
    pub is_static: bool,
    pub marked: bool,
    pub origin: Origin,
    pub items: Vec<Value>,
}

#[derive(Debug)]
pub struct MapEntry {
    pub ident: i32,
    pub is_static: bool,
    pub marked: bool,
    pub origin: Origin,
    pub entries: IndexMap<MapKey, Value>,
}

/// A game object: properties plus intrusive forest links.
#[derive(Debug)]
pub struct ObjectEntry {
    pub ident: i32,
    pub is_static: bool,
    pub marked: bool,
    pub origin: Origin,
    /// String ident of the object's source-level name, negative if stripped.
    pub name: i32,
    pub parent: i32,
    pub child: i32,
    pub sibling: i32,
    pub properties: IndexMap<u16, Value>,
}

/// Loaded once from the image; never collected.
#[derive(Debug)]
pub struct FunctionEntry {
    pub ident: i32,
    pub origin: Origin,
    /// String ident of the function's source-level name, negative if stripped.
    pub name: i32,
    pub arg_count: u16,
    pub local_count: u16,
    /// Declared type per slot, `Any` admitting every tag. Covers
    /// `arg_count + local_count` slots; only the argument slots are checked
    /// at call time.
    pub slot_types: Vec<ValueTag>,
    pub code_position: u32,
}

/// The heap: every mutable container the interpreter touches, plus the
/// function table and vocabulary.
///
/// Entries live in per-kind arenas keyed by a process-wide unique,
/// monotonically increasing ident. Idents are never reused; after a
/// collection the space is sparse and no compaction ever occurs.
#[derive(Debug, Default)]
pub struct Heap {
    pub strings: IndexMap<i32, StringEntry>,
    pub lists: IndexMap<i32, ListEntry>,
    pub maps: IndexMap<i32, MapEntry>,
    pub objects: IndexMap<i32, ObjectEntry>,
    pub functions: IndexMap<i32, FunctionEntry>,
    pub vocab: Vec<String>,
    next_ident: i32,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            next_ident: 1,
            ..Self::default()
        }
    }

    /// Keep the allocation counter strictly above a statically assigned
    /// ident, so dynamic entries never collide with loaded ones.
    pub fn note_static_ident(&mut self, ident: i32) {
        if ident >= self.next_ident {
            self.next_ident = ident + 1;
        }
    }

    fn alloc_ident(&mut self) -> i32 {
        let ident = self.next_ident;
        self.next_ident += 1;
        ident
    }

    /// Allocate a fresh dynamic entry of the given kind.
    pub fn create(&mut self, tag: ValueTag) -> Result<Value, RuntimeError> {
        match tag {
            ValueTag::String => {
                let ident = self.alloc_ident();
                self.strings.insert(
                    ident,
                    StringEntry {
                        ident,
                        is_static: false,
                        marked: false,
                        origin: Origin::Dynamic,
                        text: String::new(),
                    },
                );
                Ok(Value::string(ident))
            }
            ValueTag::List => {
                let ident = self.alloc_ident();
                self.lists.insert(
                    ident,
                    ListEntry {
                        ident,
                        is_static: false,
                        marked: false,
                        origin: Origin::Dynamic,
                        items: Vec::new(),
                    },
                );
                Ok(Value::list(ident))
            }
            ValueTag::Map => {
                let ident = self.alloc_ident();
                self.maps.insert(
                    ident,
                    MapEntry {
                        ident,
                        is_static: false,
                        marked: false,
                        origin: Origin::Dynamic,
                        entries: IndexMap::new(),
                    },
                );
                Ok(Value::map(ident))
            }
            ValueTag::Object => {
                let ident = self.alloc_ident();
                self.objects.insert(
                    ident,
                    ObjectEntry {
                        ident,
                        is_static: false,
                        marked: false,
                        origin: Origin::Dynamic,
                        name: -1,
                        parent: NO_OBJECT,
                        child: NO_OBJECT,
                        sibling: NO_OBJECT,
                        properties: IndexMap::new(),
                    },
                );
                Ok(Value::object(ident))
            }
            other => Err(RuntimeError::new(
                ErrorKind::TypeMismatch,
                format!("cannot allocate a value of type {}", other),
            )),
        }
    }

    pub fn get_string(&self, ident: i32) -> Result<&StringEntry, RuntimeError> {
        self.strings
            .get(&ident)
            .ok_or_else(|| RuntimeError::invalid_reference("string", ident))
    }

    pub fn get_string_mut(
        &mut self,
        ident: i32,
    ) -> Result<&mut StringEntry, RuntimeError> {
        self.strings
            .get_mut(&ident)
            .ok_or_else(|| RuntimeError::invalid_reference("string", ident))
    }

    pub fn get_list(&self, ident: i32) -> Result<&ListEntry, RuntimeError> {
        self.lists
            .get(&ident)
            .ok_or_else(|| RuntimeError::invalid_reference("list", ident))
    }

    pub fn get_list_mut(
        &mut self,
        ident: i32,
    ) -> Result<&mut ListEntry, RuntimeError> {
        self.lists
            .get_mut(&ident)
            .ok_or_else(|| RuntimeError::invalid_reference("list", ident))
    }

    pub fn get_map(&self, ident: i32) -> Result<&MapEntry, RuntimeError> {
        self.maps
            .get(&ident)
            .ok_or_else(|| RuntimeError::invalid_reference("map", ident))
    }

    pub fn get_map_mut(
        &mut self,
        ident: i32,
    ) -> Result<&mut MapEntry, RuntimeError> {
        self.maps
            .get_mut(&ident)
            .ok_or_else(|| RuntimeError::invalid_reference("map", ident))
    }

    pub fn get_object(&self, ident: i32) -> Result<&ObjectEntry, RuntimeError> {
        self.objects
            .get(&ident)
            .ok_or_else(|| RuntimeError::invalid_reference("object", ident))
    }

    pub fn get_object_mut(
        &mut self,
        ident: i32,
    ) -> Result<&mut ObjectEntry, RuntimeError> {
        self.objects
            .get_mut(&ident)
            .ok_or_else(|| RuntimeError::invalid_reference("object", ident))
    }

    pub fn get_function(
        &self,
        ident: i32,
    ) -> Result<&FunctionEntry, RuntimeError> {
        self.functions
            .get(&ident)
            .ok_or_else(|| RuntimeError::invalid_reference("function", ident))
    }

    pub fn get_vocab(&self, index: i32) -> Result<&str, RuntimeError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.vocab.get(i))
            .map(String::as_str)
            .ok_or_else(|| RuntimeError::invalid_reference("vocab word", index))
    }

    pub fn lookup_vocab(&self, word: &str) -> Option<i32> {
        self.vocab.iter().position(|w| w == word).map(|i| i as i32)
    }

    /// Read a property, falling back along the parent chain, defaulting to
    /// Integer 0 when no ancestor defines it.
    pub fn get_property(
        &self,
        object: i32,
        prop: u16,
    ) -> Result<Value, RuntimeError> {
        let mut current = object;
        while current != NO_OBJECT {
            let entry = self.get_object(current)?;
            if let Some(value) = entry.properties.get(&prop) {
                // A function property picks up the receiver as self binding.
                if value.tag == ValueTag::Node {
                    return Ok(value.with_this(object));
                }
                return Ok(*value);
            }
            current = entry.parent;
        }
        Ok(Value::integer(0))
    }

    pub fn set_property(
        &mut self,
        object: i32,
        prop: u16,
        value: Value,
    ) -> Result<(), RuntimeError> {
        self.get_object_mut(object)?.properties.insert(prop, value);
        Ok(())
    }

    /// Existence check on the object itself; no inheritance fallback.
    pub fn has_property(
        &self,
        object: i32,
        prop: u16,
    ) -> Result<bool, RuntimeError> {
        Ok(self.get_object(object)?.properties.contains_key(&prop))
    }

    pub fn delete_property(
        &mut self,
        object: i32,
        prop: u16,
    ) -> Result<bool, RuntimeError> {
        Ok(self
            .get_object_mut(object)?
            .properties
            .shift_remove(&prop)
            .is_some())
    }

    /// Idents of an object's direct children, in sibling-chain order.
    pub fn children(&self, object: i32) -> Result<Vec<i32>, RuntimeError> {
        let mut out = Vec::new();
        let mut current = self.get_object(object)?.child;
        while current != NO_OBJECT {
            out.push(current);
            current = self.get_object(current)?.sibling;
        }
        Ok(out)
    }

    /// Whether `ancestor` is `object` itself or one of its ancestors.
    fn is_ancestor_or_self(
        &self,
        ancestor: i32,
        object: i32,
    ) -> Result<bool, RuntimeError> {
        let mut current = object;
        while current != NO_OBJECT {
            if current == ancestor {
                return Ok(true);
            }
            current = self.get_object(current)?.parent;
        }
        Ok(false)
    }

    /// Detach `object` from its parent's child/sibling chain and reattach it
    /// at the tail of `new_parent`'s child list (or make it a root when
    /// `new_parent` is [`NO_OBJECT`]). Rejects any move that would make an
    /// object its own descendant.
    pub fn move_object(
        &mut self,
        object: i32,
        new_parent: i32,
    ) -> Result<(), RuntimeError> {
        self.get_object(object)?;
        if new_parent != NO_OBJECT {
            self.get_object(new_parent)?;
            if self.is_ancestor_or_self(object, new_parent)? {
                return Err(RuntimeError::new(
                    ErrorKind::CircularContainment,
                    format!(
                        "moving object {} under {} would create a cycle",
                        object, new_parent
                    ),
                ));
            }
        }

        self.detach(object)?;

        if new_parent != NO_OBJECT {
            let tail = {
                let mut tail = NO_OBJECT;
                let mut current = self.get_object(new_parent)?.child;
                while current != NO_OBJECT {
                    tail = current;
                    current = self.get_object(current)?.sibling;
                }
                tail
            };
            if tail == NO_OBJECT {
                self.get_object_mut(new_parent)?.child = object;
            } else {
                self.get_object_mut(tail)?.sibling = object;
            }
        }

        let entry = self.get_object_mut(object)?;
        entry.parent = new_parent;
        entry.sibling = NO_OBJECT;
        Ok(())
    }

    fn detach(&mut self, object: i32) -> Result<(), RuntimeError> {
        let (parent, sibling) = {
            let entry = self.get_object(object)?;
            (entry.parent, entry.sibling)
        };
        if parent == NO_OBJECT {
            return Ok(());
        }
        let first = self.get_object(parent)?.child;
        if first == object {
            self.get_object_mut(parent)?.child = sibling;
        } else {
            let mut current = first;
            while current != NO_OBJECT {
                let next = self.get_object(current)?.sibling;
                if next == object {
                    self.get_object_mut(current)?.sibling = sibling;
                    break;
                }
                current = next;
            }
        }
        Ok(())
    }

    /// The lowest object ident strictly greater than `after`, used by the
    /// `NextObject` opcode to enumerate the whole object table.
    pub fn next_object_ident(&self, after: Option<i32>) -> Option<i32> {
        let floor = after.unwrap_or(i32::MIN);
        self.objects
            .keys()
            .copied()
            .filter(|&id| id > floor)
            .min()
    }

    /// Liveness check for the `IsValid` opcode.
    pub fn is_valid(&self, value: Value) -> bool {
        match value.tag {
            ValueTag::String => self.strings.contains_key(&value.payload),
            ValueTag::List => self.lists.contains_key(&value.payload),
            ValueTag::Map => self.maps.contains_key(&value.payload),
            ValueTag::Object => self.objects.contains_key(&value.payload),
            ValueTag::Node => self.functions.contains_key(&value.payload),
            ValueTag::Vocab => {
                usize::try_from(value.payload)
                    .map(|i| i < self.vocab.len())
                    .unwrap_or(false)
            }
            ValueTag::None => false,
            _ => true,
        }
    }

    /// Whether the entry behind a value is immune to collection.
    pub fn is_static(&self, value: Value) -> bool {
        match value.tag {
            ValueTag::String => {
                self.strings.get(&value.payload).is_some_and(|e| e.is_static)
            }
            ValueTag::List => {
                self.lists.get(&value.payload).is_some_and(|e| e.is_static)
            }
            ValueTag::Map => {
                self.maps.get(&value.payload).is_some_and(|e| e.is_static)
            }
            ValueTag::Object => {
                self.objects.get(&value.payload).is_some_and(|e| e.is_static)
            }
            // Functions and vocabulary are loaded once and never collected.
            ValueTag::Node | ValueTag::Vocab => true,
            _ => false,
        }
    }

    /// Source description of an entity for the `Origin` opcode.
    pub fn origin_of(&self, value: Value) -> Option<Origin> {
        match value.tag {
            ValueTag::String => {
                self.strings.get(&value.payload).map(|e| e.origin)
            }
            ValueTag::List => self.lists.get(&value.payload).map(|e| e.origin),
            ValueTag::Map => self.maps.get(&value.payload).map(|e| e.origin),
            ValueTag::Object => {
                self.objects.get(&value.payload).map(|e| e.origin)
            }
            ValueTag::Node => {
                self.functions.get(&value.payload).map(|e| e.origin)
            }
            _ => None,
        }
    }
}
