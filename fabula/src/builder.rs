use crate::image::{HEADER_SIZE, IMAGE_MAGIC, IMAGE_VERSION, STRING_XOR};
use crate::op::Opcode;
use crate::value::{Value, ValueTag};

/// A forward jump target whose offset has not been resolved yet.
///
/// Created by [`BytecodeBuilder::jump_label`]; resolve it with
/// [`BytecodeBuilder::bind`].
#[derive(Debug)]
pub struct Label {
    /// Position of the i32 payload bytes inside the buffer.
    offset_pos: usize,
}

/// Builds one function's bytecode.
///
/// Offsets are relative to the start of the buffer, which matches the
/// frame's base address once [`ImageBuilder::add_function`] places the code
/// in the image's bytecode segment.
#[derive(Debug, Default)]
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn emit(&mut self, op: Opcode) {
        self.buf.push(op as u8);
    }

    /// Push a tagged immediate, choosing the narrowest encoding.
    pub fn push_value(&mut self, tag: ValueTag, payload: i32) {
        if (0..=0xFF).contains(&payload) {
            self.emit(Opcode::Push8);
            self.emit_u8(tag as u8);
            self.emit_u8(payload as u8);
        } else if (0..=0xFFFF).contains(&payload) {
            self.emit(Opcode::Push16);
            self.emit_u8(tag as u8);
            self.emit_u16(payload as u16);
        } else {
            self.emit(Opcode::Push32);
            self.emit_u8(tag as u8);
            self.emit_i32(payload);
        }
    }

    /// Push an integer, using the dedicated 0/1 opcodes where possible.
    pub fn push_int(&mut self, v: i32) {
        match v {
            0 => self.emit(Opcode::Push0),
            1 => self.emit(Opcode::Push1),
            _ => self.push_value(ValueTag::Integer, v),
        }
    }

    pub fn push_none(&mut self) {
        self.emit(Opcode::PushNone);
    }

    /// Push a JumpTarget whose offset is bound later.
    pub fn jump_label(&mut self) -> Label {
        self.emit(Opcode::Push32);
        self.emit_u8(ValueTag::JumpTarget as u8);
        let offset_pos = self.buf.len();
        self.emit_i32(0);
        Label { offset_pos }
    }

    /// Resolve a label to the current offset.
    pub fn bind(&mut self, label: Label) {
        let offset = self.buf.len() as i32;
        self.buf[label.offset_pos..label.offset_pos + 4]
            .copy_from_slice(&offset.to_le_bytes());
    }

    /// Push a JumpTarget at a known (usually backward) offset.
    pub fn push_target(&mut self, offset: usize) {
        self.push_value(ValueTag::JumpTarget, offset as i32);
    }
}

/// Non-string entity idents start here so they never collide with the
/// string table's dense indices. The loader only requires uniqueness; this
/// split is a builder convention.
const IDENT_BASE: i32 = 0x1000;

#[derive(Debug)]
struct ListDef {
    file: i32,
    line: i32,
    ident: i32,
    items: Vec<Value>,
}

#[derive(Debug)]
struct MapDef {
    file: i32,
    line: i32,
    ident: i32,
    pairs: Vec<(Value, Value)>,
}

#[derive(Debug)]
struct ObjectDef {
    name: i32,
    file: i32,
    line: i32,
    ident: i32,
    parent: i32,
    properties: Vec<(u16, Value)>,
}

#[derive(Debug)]
struct FunctionDef {
    name: i32,
    file: i32,
    line: i32,
    ident: i32,
    arg_count: u16,
    local_count: u16,
    slot_types: Vec<ValueTag>,
    code_position: u32,
}

/// Writes the binary game image format.
///
/// Hosts that generate games programmatically (and the test suite) build
/// images through this; the loader in [`crate::image`] reads the same
/// layout back.
#[derive(Debug, Default)]
pub struct ImageBuilder {
    strings: Vec<String>,
    vocab: Vec<String>,
    lists: Vec<ListDef>,
    maps: Vec<MapDef>,
    objects: Vec<ObjectDef>,
    functions: Vec<FunctionDef>,
    bytecode: Vec<u8>,
    next_ident: i32,
    main_function: u32,
    name_id: u32,
    author_id: u32,
    version_id: u32,
    game_id_id: u32,
    build_number: u32,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            next_ident: IDENT_BASE,
            main_function: u32::MAX,
            name_id: u32::MAX,
            author_id: u32::MAX,
            version_id: u32::MAX,
            game_id_id: u32::MAX,
            ..Self::default()
        }
    }

    fn alloc_ident(&mut self) -> i32 {
        let ident = self.next_ident;
        self.next_ident += 1;
        ident
    }

    /// Add a string; its ident is its dense table index.
    pub fn add_string(&mut self, text: impl Into<String>) -> i32 {
        self.strings.push(text.into());
        (self.strings.len() - 1) as i32
    }

    /// Add a vocabulary word; returns its dense index.
    pub fn add_vocab(&mut self, word: impl Into<String>) -> i32 {
        self.vocab.push(word.into());
        (self.vocab.len() - 1) as i32
    }

    pub fn add_list(&mut self, items: Vec<Value>) -> i32 {
        self.add_list_at(-1, 0, items)
    }

    pub fn add_list_at(&mut self, file: i32, line: i32, items: Vec<Value>) -> i32 {
        let ident = self.alloc_ident();
        self.lists.push(ListDef {
            file,
            line,
            ident,
            items,
        });
        ident
    }

    pub fn add_map(&mut self, pairs: Vec<(Value, Value)>) -> i32 {
        self.add_map_at(-1, 0, pairs)
    }

    pub fn add_map_at(
        &mut self,
        file: i32,
        line: i32,
        pairs: Vec<(Value, Value)>,
    ) -> i32 {
        let ident = self.alloc_ident();
        self.maps.push(MapDef {
            file,
            line,
            ident,
            pairs,
        });
        ident
    }

    /// Add an object under `parent` (0 = root). Child/sibling links are
    /// derived from insertion order when the image is written.
    pub fn add_object(
        &mut self,
        parent: i32,
        properties: Vec<(u16, Value)>,
    ) -> i32 {
        self.add_object_at(-1, -1, 0, parent, properties)
    }

    pub fn add_object_at(
        &mut self,
        name: i32,
        file: i32,
        line: i32,
        parent: i32,
        properties: Vec<(u16, Value)>,
    ) -> i32 {
        let ident = self.alloc_ident();
        self.objects.push(ObjectDef {
            name,
            file,
            line,
            ident,
            parent,
            properties,
        });
        ident
    }

    /// Append a function's code to the bytecode segment and record its
    /// header. The slot type list covers arguments then locals; missing
    /// entries default to Any.
    pub fn add_function(
        &mut self,
        arg_count: u16,
        local_count: u16,
        slot_types: Vec<ValueTag>,
        code: BytecodeBuilder,
    ) -> i32 {
        self.add_function_at(-1, -1, 0, arg_count, local_count, slot_types, code)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_function_at(
        &mut self,
        name: i32,
        file: i32,
        line: i32,
        arg_count: u16,
        local_count: u16,
        mut slot_types: Vec<ValueTag>,
        code: BytecodeBuilder,
    ) -> i32 {
        slot_types.resize((arg_count + local_count) as usize, ValueTag::Any);
        let ident = self.alloc_ident();
        let code_position = self.bytecode.len() as u32;
        self.bytecode.extend_from_slice(&code.into_bytes());
        self.functions.push(FunctionDef {
            name,
            file,
            line,
            ident,
            arg_count,
            local_count,
            slot_types,
            code_position,
        });
        ident
    }

    pub fn set_main(&mut self, function: i32) {
        self.main_function = function as u32;
    }

    pub fn set_info(
        &mut self,
        name: i32,
        author: i32,
        version: i32,
        game_id: i32,
        build_number: u32,
    ) {
        self.name_id = name as u32;
        self.author_id = author as u32;
        self.version_id = version as u32;
        self.game_id_id = game_id as u32;
        self.build_number = build_number;
    }

    pub fn build(self) -> Vec<u8> {
        assert!(
            (self.strings.len() as i32) < IDENT_BASE,
            "string table overflows the ident base"
        );

        let mut out = Vec::new();

        // 64-byte header.
        out.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
        out.extend_from_slice(&IMAGE_VERSION.to_le_bytes());
        out.extend_from_slice(&self.main_function.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.name_id.to_le_bytes());
        out.extend_from_slice(&self.author_id.to_le_bytes());
        out.extend_from_slice(&self.version_id.to_le_bytes());
        out.extend_from_slice(&self.game_id_id.to_le_bytes());
        out.extend_from_slice(&self.build_number.to_le_bytes());
        out.resize(HEADER_SIZE, 0);

        write_text_table(&mut out, &self.strings);
        write_text_table(&mut out, &self.vocab);

        out.extend_from_slice(&(self.lists.len() as u32).to_le_bytes());
        for list in &self.lists {
            out.extend_from_slice(&list.file.to_le_bytes());
            out.extend_from_slice(&list.line.to_le_bytes());
            out.extend_from_slice(&list.ident.to_le_bytes());
            out.extend_from_slice(&(list.items.len() as u16).to_le_bytes());
            for item in &list.items {
                write_value(&mut out, *item);
            }
        }

        out.extend_from_slice(&(self.maps.len() as u32).to_le_bytes());
        for map in &self.maps {
            out.extend_from_slice(&map.file.to_le_bytes());
            out.extend_from_slice(&map.line.to_le_bytes());
            out.extend_from_slice(&map.ident.to_le_bytes());
            out.extend_from_slice(&(map.pairs.len() as u16).to_le_bytes());
            for (key, value) in &map.pairs {
                write_value(&mut out, *key);
                write_value(&mut out, *value);
            }
        }

        out.extend_from_slice(&(self.objects.len() as u32).to_le_bytes());
        for object in &self.objects {
            let child = self
                .objects
                .iter()
                .find(|o| o.parent == object.ident)
                .map(|o| o.ident)
                .unwrap_or(0);
            let sibling = if object.parent != 0 {
                self.objects
                    .iter()
                    .filter(|o| o.parent == object.parent)
                    .skip_while(|o| o.ident != object.ident)
                    .nth(1)
                    .map(|o| o.ident)
                    .unwrap_or(0)
            } else {
                0
            };
            out.extend_from_slice(&object.name.to_le_bytes());
            out.extend_from_slice(&object.file.to_le_bytes());
            out.extend_from_slice(&object.line.to_le_bytes());
            out.extend_from_slice(&object.ident.to_le_bytes());
            out.extend_from_slice(&object.parent.to_le_bytes());
            out.extend_from_slice(&child.to_le_bytes());
            out.extend_from_slice(&sibling.to_le_bytes());
            out.extend_from_slice(
                &(object.properties.len() as u16).to_le_bytes(),
            );
            for (prop, value) in &object.properties {
                out.extend_from_slice(&prop.to_le_bytes());
                write_value(&mut out, *value);
            }
        }

        out.extend_from_slice(&(self.functions.len() as u32).to_le_bytes());
        for function in &self.functions {
            out.extend_from_slice(&function.name.to_le_bytes());
            out.extend_from_slice(&function.file.to_le_bytes());
            out.extend_from_slice(&function.line.to_le_bytes());
            out.extend_from_slice(&function.ident.to_le_bytes());
            out.extend_from_slice(&function.arg_count.to_le_bytes());
            out.extend_from_slice(&function.local_count.to_le_bytes());
            for tag in &function.slot_types {
                out.push(*tag as u8);
            }
            out.extend_from_slice(&function.code_position.to_le_bytes());
        }

        // Legacy size field, ignored by the loader.
        out.extend_from_slice(&(self.bytecode.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.bytecode);
        out
    }
}

fn write_text_table(out: &mut Vec<u8>, table: &[String]) {
    out.extend_from_slice(&(table.len() as u32).to_le_bytes());
    for text in table {
        let bytes = text.as_bytes();
        out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
        out.extend(bytes.iter().map(|b| b ^ STRING_XOR));
    }
}

fn write_value(out: &mut Vec<u8>, value: Value) {
    out.push(value.tag as u8);
    out.extend_from_slice(&value.payload.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_value_picks_the_narrowest_encoding() {
        let mut b = BytecodeBuilder::new();
        b.push_value(ValueTag::String, 7);
        b.push_value(ValueTag::Integer, 300);
        b.push_value(ValueTag::Integer, -1);
        let bytes = b.into_bytes();
        assert_eq!(bytes[0], Opcode::Push8 as u8);
        assert_eq!(bytes[3], Opcode::Push16 as u8);
        assert_eq!(bytes[7], Opcode::Push32 as u8);
        assert_eq!(&bytes[9..13], &(-1i32).to_le_bytes());
    }

    #[test]
    fn labels_patch_forward_jumps() {
        let mut b = BytecodeBuilder::new();
        let label = b.jump_label();
        b.emit(Opcode::Jump);
        b.emit(Opcode::Say);
        b.bind(label);
        let end = b.current_offset();
        let bytes = b.into_bytes();
        assert_eq!(
            i32::from_le_bytes(bytes[2..6].try_into().unwrap()),
            end as i32
        );
    }
}
