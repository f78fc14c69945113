use std::fmt;

use log::debug;

use crate::heap::{
    FunctionEntry, Heap, ListEntry, MapEntry, ObjectEntry, Origin, StringEntry,
};
use crate::value::{Value, ValueTag};

pub const IMAGE_MAGIC: u32 = u32::from_le_bytes(*b"FABV");
pub const IMAGE_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 64;
/// Strings and vocabulary words are obfuscated with a per-byte XOR.
pub const STRING_XOR: u8 = 0x7B;

/// An unrecoverable load failure. There is no partial-load recovery: the
/// whole image either loads or the game is unplayable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    Truncated { offset: usize },
    BadMagic(u32),
    UnsupportedVersion(u32),
    InvalidUtf8 { offset: usize },
    UnknownTag { offset: usize, tag: u8 },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Truncated { offset } => {
                write!(f, "image truncated at offset {}", offset)
            }
            LoadError::BadMagic(magic) => {
                write!(f, "not a game image (magic {:#010x})", magic)
            }
            LoadError::UnsupportedVersion(version) => {
                write!(f, "unsupported image version {}", version)
            }
            LoadError::InvalidUtf8 { offset } => {
                write!(f, "invalid utf-8 in string table at offset {}", offset)
            }
            LoadError::UnknownTag { offset, tag } => {
                write!(f, "unknown value tag {:#04x} at offset {}", tag, offset)
            }
        }
    }
}

impl std::error::Error for LoadError {}

/// Header metadata resolved against the string table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameInfo {
    pub name: String,
    pub author: String,
    pub version: String,
    pub game_id: String,
    pub build_number: u32,
}

/// A fully materialized game: heap, entry point, and bytecode segment.
#[derive(Debug)]
pub struct GameImage {
    pub heap: Heap,
    pub main_function: i32,
    pub bytecode: Vec<u8>,
    pub info: GameInfo,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn truncated(&self) -> LoadError {
        LoadError::Truncated { offset: self.pos }
    }

    fn seek(&mut self, pos: usize) -> Result<(), LoadError> {
        if pos > self.bytes.len() {
            return Err(LoadError::Truncated { offset: pos });
        }
        self.pos = pos;
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], LoadError> {
        let end = self.pos.checked_add(len).ok_or_else(|| self.truncated())?;
        if end > self.bytes.len() {
            return Err(self.truncated());
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, LoadError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, LoadError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, LoadError> {
        Ok(self.read_u32()? as i32)
    }

    fn read_tag(&mut self) -> Result<ValueTag, LoadError> {
        let offset = self.pos;
        let byte = self.read_u8()?;
        ValueTag::try_from(byte)
            .map_err(|tag| LoadError::UnknownTag { offset, tag })
    }

    fn read_value(&mut self) -> Result<Value, LoadError> {
        let tag = self.read_tag()?;
        let payload = self.read_i32()?;
        Ok(Value::new(tag, payload))
    }

    /// One obfuscated string table entry: length, then XORed UTF-8 bytes.
    fn read_text(&mut self) -> Result<String, LoadError> {
        let len = self.read_u16()? as usize;
        let offset = self.pos;
        let raw = self.take(len)?;
        let decoded: Vec<u8> = raw.iter().map(|b| b ^ STRING_XOR).collect();
        String::from_utf8(decoded).map_err(|_| LoadError::InvalidUtf8 { offset })
    }

    fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}

/// Materialize a game image from its binary form.
///
/// Every loaded entry is static: immune to collection, its ident tracked so
/// dynamically created entries never collide. Loading replaces whatever
/// game came before it; the caller discards the previous heap and call
/// stack wholesale.
pub fn load_image(bytes: &[u8]) -> Result<GameImage, LoadError> {
    let mut r = Reader::new(bytes);

    let magic = r.read_u32()?;
    if magic != IMAGE_MAGIC {
        return Err(LoadError::BadMagic(magic));
    }
    let version = r.read_u32()?;
    if version != IMAGE_VERSION {
        return Err(LoadError::UnsupportedVersion(version));
    }
    let main_function = r.read_i32()?;
    r.seek(16)?;
    let name_id = r.read_i32()?;
    let author_id = r.read_i32()?;
    let version_id = r.read_i32()?;
    let game_id_id = r.read_i32()?;
    let build_number = r.read_u32()?;

    let mut heap = Heap::new();
    r.seek(HEADER_SIZE)?;

    // String table: idents are the dense table indices.
    let string_count = r.read_u32()?;
    for ident in 0..string_count as i32 {
        let text = r.read_text()?;
        heap.strings.insert(
            ident,
            StringEntry {
                ident,
                is_static: true,
                marked: false,
                origin: Origin::Source { file: -1, line: 0 },
                text,
            },
        );
        heap.note_static_ident(ident);
    }

    let vocab_count = r.read_u32()?;
    for _ in 0..vocab_count {
        let word = r.read_text()?;
        heap.vocab.push(word);
    }

    let list_count = r.read_u32()?;
    for _ in 0..list_count {
        let file = r.read_i32()?;
        let line = r.read_i32()?;
        let ident = r.read_i32()?;
        let size = r.read_u16()? as usize;
        let mut items = Vec::with_capacity(size);
        for _ in 0..size {
            items.push(r.read_value()?);
        }
        heap.lists.insert(
            ident,
            ListEntry {
                ident,
                is_static: true,
                marked: false,
                origin: Origin::Source { file, line },
                items,
            },
        );
        heap.note_static_ident(ident);
    }

    let map_count = r.read_u32()?;
    for _ in 0..map_count {
        let file = r.read_i32()?;
        let line = r.read_i32()?;
        let ident = r.read_i32()?;
        let size = r.read_u16()? as usize;
        let mut entries = indexmap::IndexMap::with_capacity(size);
        for _ in 0..size {
            let key = r.read_value()?;
            let value = r.read_value()?;
            entries.insert(key.key(), value);
        }
        heap.maps.insert(
            ident,
            MapEntry {
                ident,
                is_static: true,
                marked: false,
                origin: Origin::Source { file, line },
                entries,
            },
        );
        heap.note_static_ident(ident);
    }

    let object_count = r.read_u32()?;
    for _ in 0..object_count {
        let name = r.read_i32()?;
        let file = r.read_i32()?;
        let line = r.read_i32()?;
        let ident = r.read_i32()?;
        let parent = r.read_i32()?;
        let child = r.read_i32()?;
        let sibling = r.read_i32()?;
        let size = r.read_u16()? as usize;
        let mut properties = indexmap::IndexMap::with_capacity(size);
        for _ in 0..size {
            let prop = r.read_u16()?;
            let value = r.read_value()?;
            properties.insert(prop, value);
        }
        heap.objects.insert(
            ident,
            ObjectEntry {
                ident,
                is_static: true,
                marked: false,
                origin: Origin::Source { file, line },
                name,
                parent,
                child,
                sibling,
                properties,
            },
        );
        heap.note_static_ident(ident);
    }

    let function_count = r.read_u32()?;
    for _ in 0..function_count {
        let name = r.read_i32()?;
        let file = r.read_i32()?;
        let line = r.read_i32()?;
        let ident = r.read_i32()?;
        let arg_count = r.read_u16()?;
        let local_count = r.read_u16()?;
        let slot_count = arg_count as usize + local_count as usize;
        let mut slot_types = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            slot_types.push(r.read_tag()?);
        }
        let code_position = r.read_u32()?;
        heap.functions.insert(
            ident,
            FunctionEntry {
                ident,
                origin: Origin::Source { file, line },
                name,
                arg_count,
                local_count,
                slot_types,
                code_position,
            },
        );
        heap.note_static_ident(ident);
    }

    // Legacy size field; the bytecode segment is simply the rest.
    let _legacy_size = r.read_u32()?;
    let bytecode = r.remaining().to_vec();

    let info = GameInfo {
        name: header_string(&heap, name_id),
        author: header_string(&heap, author_id),
        version: header_string(&heap, version_id),
        game_id: header_string(&heap, game_id_id),
        build_number,
    };

    debug!(
        "loaded image: {} strings, {} vocab, {} lists, {} maps, {} objects, \
         {} functions, {} bytecode bytes",
        string_count,
        vocab_count,
        list_count,
        map_count,
        object_count,
        function_count,
        bytecode.len()
    );

    Ok(GameImage {
        heap,
        main_function,
        bytecode,
        info,
    })
}

/// Header metadata ids are best-effort: a dangling id yields an empty field
/// rather than failing the whole load.
fn header_string(heap: &Heap, ident: i32) -> String {
    heap.strings
        .get(&ident)
        .map(|e| e.text.clone())
        .unwrap_or_default()
}
