use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{ErrorKind, RuntimeError};
use crate::gc;
use crate::heap::{Heap, NO_OBJECT, Origin};
use crate::host::{FileStore, SettingsStore};
use crate::image::{GameImage, GameInfo};
use crate::op::Opcode;
use crate::stack::{CallStack, Frame, build_locals};
use crate::value::{Value, ValueTag, compare};

/// Dispatches per slice before the loop yields to keep the host responsive.
pub const DEFAULT_SLICE_BUDGET: u32 = 131_072;
/// Run the collector every Nth completed turn.
pub const DEFAULT_GC_FREQUENCY: u64 = 5;

/// What a suspended machine is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRequest {
    Key,
    Option,
    Line,
}

/// One entry of the pending option menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionEntry {
    pub caption: Value,
    pub value: Value,
    pub extra: Value,
}

/// The outcome handed to the host after each run of the opcode loop.
///
/// `Working` is the cooperative time-slicing yield: no output is flushed
/// and the host must call [`Machine::resume_slice`] on its next tick. All
/// other variants end the turn and carry the flushed output buffer.
#[derive(Debug)]
pub enum Turn {
    Finished { output: String },
    AwaitingKey { output: String },
    AwaitingOption { output: String, options: Vec<OptionEntry> },
    AwaitingLine { output: String },
    Working,
    Failed { output: String, error: RuntimeError, dump: String },
}

enum Flow {
    Continue,
    Finished,
    Await(InputRequest),
}

/// The virtual machine: one heap, one call stack, one game.
///
/// Single-threaded by contract; suspension points are the input opcodes and
/// the slice budget, and between any two resumptions nothing else touches
/// the heap. Starting a new game means building a fresh `Machine`.
pub struct Machine {
    pub heap: Heap,
    bytecode: Vec<u8>,
    main_function: i32,
    pub info: GameInfo,
    ip: usize,
    calls: CallStack,
    op_count: u64,
    turn_count: u64,
    output: String,
    options: Vec<OptionEntry>,
    option_extra: Value,
    pending: Option<InputRequest>,
    rng: StdRng,
    files: Box<dyn FileStore>,
    settings: Box<dyn SettingsStore>,
    pub slice_budget: u32,
    pub gc_frequency: u64,
}

impl Machine {
    pub fn new(
        image: GameImage,
        files: Box<dyn FileStore>,
        settings: Box<dyn SettingsStore>,
    ) -> Self {
        Self {
            heap: image.heap,
            bytecode: image.bytecode,
            main_function: image.main_function,
            info: image.info,
            ip: 0,
            calls: CallStack::new(),
            op_count: 0,
            turn_count: 0,
            output: String::new(),
            options: Vec::new(),
            option_extra: Value::none(),
            pending: None,
            rng: StdRng::from_entropy(),
            files,
            settings,
            slice_budget: DEFAULT_SLICE_BUDGET,
            gc_frequency: DEFAULT_GC_FREQUENCY,
        }
    }

    /// Fix the RNG for reproducible runs.
    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn op_count(&self) -> u64 {
        self.op_count
    }

    pub fn call_depth(&self) -> usize {
        self.calls.len()
    }

    pub fn pending_input(&self) -> Option<InputRequest> {
        self.pending
    }

    /// The extra value of the most recently chosen option.
    pub fn option_extra(&self) -> Value {
        self.option_extra
    }

    /// Begin the game: call the image's main function and run.
    pub fn start(&mut self) -> Turn {
        self.calls.clear();
        self.output.clear();
        self.options.clear();
        self.option_extra = Value::none();
        self.pending = None;
        match self.call_function(self.main_function, &[], NO_OBJECT) {
            Ok(()) => self.run(),
            Err(error) => self.fail_turn(error),
        }
    }

    /// Supply the key code a suspended `GetKey` asked for.
    pub fn resume_key(&mut self, code: i32) -> Turn {
        self.resume_with(InputRequest::Key, Value::integer(code))
    }

    /// Supply the line of input a suspended `GetLine` asked for. The text
    /// becomes a fresh dynamic string.
    pub fn resume_line(&mut self, line: &str) -> Turn {
        if self.pending != Some(InputRequest::Line) {
            return self.fail_turn(RuntimeError::new(
                ErrorKind::TypeMismatch,
                "no pending line request",
            ));
        }
        let value = match self.new_string(line) {
            Ok(v) => v,
            Err(error) => return self.fail_turn(error),
        };
        self.resume_with(InputRequest::Line, value)
    }

    /// Choose one of the pending options of a suspended `GetOption`. The
    /// option's value is pushed; its extra is parked in the rooted extra
    /// slot for the host.
    pub fn resume_option(&mut self, index: usize) -> Turn {
        if self.pending != Some(InputRequest::Option) {
            return self.fail_turn(RuntimeError::new(
                ErrorKind::TypeMismatch,
                "no pending option request",
            ));
        }
        let Some(chosen) = self.options.get(index).cloned() else {
            return self.fail_turn(RuntimeError::new(
                ErrorKind::InvalidReference,
                format!("no option at index {}", index),
            ));
        };
        self.options.clear();
        self.option_extra = chosen.extra;
        self.resume_with(InputRequest::Option, chosen.value)
    }

    /// Continue after a [`Turn::Working`] yield.
    pub fn resume_slice(&mut self) -> Turn {
        if self.pending.is_some() {
            return self.fail_turn(RuntimeError::new(
                ErrorKind::TypeMismatch,
                "machine is awaiting input, not a time slice",
            ));
        }
        self.run()
    }

    fn resume_with(&mut self, expect: InputRequest, value: Value) -> Turn {
        if self.pending != Some(expect) {
            return self.fail_turn(RuntimeError::new(
                ErrorKind::TypeMismatch,
                format!("no pending {:?} request", expect),
            ));
        }
        self.pending = None;
        if let Err(error) = self.push(value) {
            return self.fail_turn(error);
        }
        self.run()
    }

    /// Run the collector now. Roots: static entries (implicit), every
    /// frame's operand stack and locals, the frame self bindings, the
    /// pending options, and the parked extra slot.
    pub fn collect_garbage(&mut self) -> usize {
        let mut roots: Vec<Value> = Vec::new();
        for frame in self.calls.iter() {
            roots.extend_from_slice(frame.stack_values());
            roots.extend_from_slice(frame.local_values());
            if frame.this != NO_OBJECT {
                roots.push(Value::object(frame.this));
            }
        }
        for option in &self.options {
            roots.push(option.caption);
            roots.push(option.value);
            roots.push(option.extra);
        }
        roots.push(self.option_extra);
        gc::collect(&mut self.heap, &roots)
    }

    // ── the opcode loop ────────────────────────────────────────────

    fn run(&mut self) -> Turn {
        let mut steps: u32 = 0;
        loop {
            if self.calls.is_empty() {
                return self.finish_turn();
            }
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finished) => return self.finish_turn(),
                Ok(Flow::Await(request)) => {
                    self.pending = Some(request);
                    return self.suspend_turn(request);
                }
                Err(error) => return self.fail_turn(error),
            }
            steps += 1;
            if steps >= self.slice_budget {
                debug!("slice budget of {} exhausted, yielding", self.slice_budget);
                return Turn::Working;
            }
        }
    }

    fn end_of_turn(&mut self) -> String {
        self.turn_count += 1;
        if self.gc_frequency > 0 && self.turn_count % self.gc_frequency == 0 {
            self.collect_garbage();
        }
        std::mem::take(&mut self.output)
    }

    fn finish_turn(&mut self) -> Turn {
        let output = self.end_of_turn();
        Turn::Finished { output }
    }

    fn suspend_turn(&mut self, request: InputRequest) -> Turn {
        let output = self.end_of_turn();
        match request {
            InputRequest::Key => Turn::AwaitingKey { output },
            InputRequest::Line => Turn::AwaitingLine { output },
            InputRequest::Option => Turn::AwaitingOption {
                output,
                options: self.options.clone(),
            },
        }
    }

    fn fail_turn(&mut self, error: RuntimeError) -> Turn {
        // The call stack is deliberately NOT reset: the original engine
        // leaves whatever state existed at the point of failure in place,
        // and a later turn resumes against it.
        warn!("turn failed: {}", error);
        let dump = self.calls.dump();
        let output = std::mem::take(&mut self.output);
        Turn::Failed {
            output,
            error,
            dump,
        }
    }

    fn step(&mut self) -> Result<Flow, RuntimeError> {
        let at = self.ip;
        let byte = self.fetch_u8()?;
        let opcode = Opcode::try_from(byte).map_err(|b| {
            RuntimeError::new(
                ErrorKind::UnknownOpcode,
                format!("opcode {:#04x} at {:#x}", b, at),
            )
        })?;
        self.op_count += 1;

        match opcode {
            Opcode::Return => {
                let mut frame = self
                    .calls
                    .pop()
                    .ok_or_else(RuntimeError::stack_underflow)?;
                let result = frame.result();
                if self.calls.is_empty() {
                    return Ok(Flow::Finished);
                }
                self.ip = frame.return_address;
                self.push(result)?;
            }

            Opcode::Push0 => self.push(Value::integer(0))?,
            Opcode::Push1 => self.push(Value::integer(1))?,
            Opcode::PushNone => self.push(Value::none())?,
            Opcode::Push8 => {
                let tag = self.fetch_tag()?;
                let payload = self.fetch_u8()? as i32;
                self.push(Value::new(tag, payload))?;
            }
            Opcode::Push16 => {
                let tag = self.fetch_tag()?;
                let payload = self.fetch_u16()? as i32;
                self.push(Value::new(tag, payload))?;
            }
            Opcode::Push32 => {
                let tag = self.fetch_tag()?;
                let payload = self.fetch_i32()?;
                self.push(Value::new(tag, payload))?;
            }

            Opcode::Store => {
                let dest = self.calls.top()?.pop()?;
                dest.require_type(ValueTag::VarRef)?;
                let value = self.pop()?;
                value.forbid_type(ValueTag::VarRef)?;
                let slot = usize::try_from(dest.payload).map_err(|_| {
                    RuntimeError::new(
                        ErrorKind::InvalidLocalIndex,
                        format!("local {}", dest.payload),
                    )
                })?;
                self.calls.top()?.set_local(slot, value)?;
            }

            Opcode::CollectGarbage => {
                let collected = self.collect_garbage();
                debug!("explicit gc collected {} entries", collected);
            }

            Opcode::Say => {
                let value = self.pop()?;
                let text = self.stringify(value)?;
                self.output.push_str(&text);
            }
            Opcode::SayUCFirst => {
                let value = self.pop()?;
                let text = self.stringify(value)?;
                self.output.push_str(&ucfirst(&text));
            }
            Opcode::SayUnsigned => {
                let value = self.pop_int()?;
                self.output.push_str(&(value as u32).to_string());
            }
            Opcode::SayChar => {
                let code = self.pop_int()?;
                let c = u32::try_from(code)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| {
                        RuntimeError::new(
                            ErrorKind::TypeMismatch,
                            format!("invalid character code {}", code),
                        )
                    })?;
                self.output.push(c);
            }

            Opcode::StackPop => {
                self.pop()?;
            }
            Opcode::StackDup => {
                let top = self.calls.top()?.peek(0)?;
                self.push(top)?;
            }
            Opcode::StackPeek => {
                let position = self.pop_index()?;
                let value = self.calls.top()?.peek(position)?;
                self.push(value)?;
            }
            Opcode::StackSize => {
                let depth = self.calls.top()?.depth() as i32;
                self.push(Value::integer(depth))?;
            }
            Opcode::StackSwap => {
                let b = self.pop_index()?;
                let a = self.pop_index()?;
                self.calls.top()?.swap(a, b)?;
            }

            Opcode::Call => {
                let target = self.pop()?;
                target.require_type(ValueTag::Node)?;
                let argc = self.pop_index()?;
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(self.pop()?);
                }
                args.reverse();
                let this = target.this().ok_or_else(|| {
                    RuntimeError::new(
                        ErrorKind::TypeMismatch,
                        format!(
                            "function {} called without a self binding",
                            target.payload
                        ),
                    )
                })?;
                self.call_function(target.payload, &args, this)?;
            }

            Opcode::IsValid => {
                let value = self.pop()?;
                let valid = self.heap.is_valid(value);
                self.push(Value::integer(valid as i32))?;
            }
            Opcode::IsStatic => {
                let value = self.pop()?;
                let is_static = self.heap.is_static(value);
                self.push(Value::integer(is_static as i32))?;
            }
            Opcode::TypeOf => {
                let value = self.pop()?;
                self.push(Value::type_id(value.tag))?;
            }
            Opcode::AsType => {
                let type_id = self.pop_tagged(ValueTag::TypeId)?;
                let value = self.pop()?;
                let tag = tag_from_payload(type_id.payload)?;
                self.push(Value::new(tag, value.payload))?;
            }
            Opcode::New => {
                let type_id = self.pop_tagged(ValueTag::TypeId)?;
                let tag = tag_from_payload(type_id.payload)?;
                let value = self.heap.create(tag)?;
                self.push(value)?;
            }
            Opcode::Origin => {
                let value = self.pop()?;
                let text = self.origin_text(value);
                let result = self.new_string(&text)?;
                self.push(result)?;
            }

            Opcode::ListPush => {
                let value = self.pop()?;
                value.forbid_type(ValueTag::VarRef)?;
                let list = self.pop_tagged(ValueTag::List)?;
                self.heap.get_list_mut(list.payload)?.items.push(value);
            }
            Opcode::ListPop => {
                let list = self.pop_tagged(ValueTag::List)?;
                let value = self
                    .heap
                    .get_list_mut(list.payload)?
                    .items
                    .pop()
                    .unwrap_or_else(Value::none);
                self.push(value)?;
            }
            Opcode::Sort => {
                let list = self.pop_tagged(ValueTag::List)?;
                self.heap
                    .get_list_mut(list.payload)?
                    .items
                    .sort_by_key(|v| (v.tag as u8, v.payload));
            }

            Opcode::GetItem => self.get_item()?,
            Opcode::SetItem => self.set_item(false)?,
            Opcode::AddItem => self.set_item(true)?,
            Opcode::HasItem => self.has_item()?,
            Opcode::DelItem => self.del_item()?,
            Opcode::GetSize => self.get_size()?,
            Opcode::GetKeys => self.get_keys()?,
            Opcode::GetRandom => {
                let list = self.pop_tagged(ValueTag::List)?;
                let items = &self.heap.get_list(list.payload)?.items;
                let value = if items.is_empty() {
                    Value::integer(0)
                } else {
                    items[self.rng.gen_range(0..items.len())]
                };
                self.push(value)?;
            }
            Opcode::IndexOf => {
                let needle = self.pop()?;
                let list = self.pop_tagged(ValueTag::List)?;
                let index = self
                    .heap
                    .get_list(list.payload)?
                    .items
                    .iter()
                    .position(|item| compare(*item, needle) == 0)
                    .map(|i| i as i32)
                    .unwrap_or(-1);
                self.push(Value::integer(index))?;
            }

            Opcode::Equal => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(Value::integer((compare(left, right) == 0) as i32))?;
            }
            Opcode::NotEqual => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(Value::integer((compare(left, right) != 0) as i32))?;
            }
            Opcode::LessThan => self.ordered(|d| d < 0)?,
            Opcode::LessThanEqual => self.ordered(|d| d <= 0)?,
            Opcode::GreaterThan => self.ordered(|d| d > 0)?,
            Opcode::GreaterThanEqual => self.ordered(|d| d >= 0)?,

            Opcode::Jump => {
                let target = self.pop_tagged(ValueTag::JumpTarget)?;
                self.jump(target)?;
            }
            Opcode::JumpZero => {
                let target = self.pop_tagged(ValueTag::JumpTarget)?;
                let test = self.pop()?;
                if test.is_zero() {
                    self.jump(target)?;
                }
            }
            Opcode::JumpNotZero => {
                let target = self.pop_tagged(ValueTag::JumpTarget)?;
                let test = self.pop()?;
                if !test.is_zero() {
                    self.jump(target)?;
                }
            }

            Opcode::Not => {
                let value = self.pop()?;
                self.push(Value::integer(value.is_zero() as i32))?;
            }
            Opcode::Add => self.binary_int(|a, b| a.wrapping_add(b))?,
            Opcode::Sub => self.binary_int(|a, b| a.wrapping_sub(b))?,
            Opcode::Mult => self.binary_int(|a, b| a.wrapping_mul(b))?,
            // Division by zero yields 0, matching the source bytecode's
            // 32-bit wraparound contract.
            Opcode::Div => {
                self.binary_int(|a, b| if b == 0 { 0 } else { a.wrapping_div(b) })?
            }
            Opcode::Mod => {
                self.binary_int(|a, b| if b == 0 { 0 } else { a.wrapping_rem(b) })?
            }
            Opcode::BitAnd => self.binary_int(|a, b| a & b)?,
            Opcode::BitOr => self.binary_int(|a, b| a | b)?,
            Opcode::BitXor => self.binary_int(|a, b| a ^ b)?,
            Opcode::ShiftLeft => {
                self.binary_int(|a, b| a.wrapping_shl(b as u32))?
            }
            Opcode::ShiftRight => {
                self.binary_int(|a, b| a.wrapping_shr(b as u32))?
            }
            Opcode::Negate => {
                let value = self.pop_int()?;
                self.push(Value::integer(value.wrapping_neg()))?;
            }
            Opcode::BitNot => {
                let value = self.pop_int()?;
                self.push(Value::integer(!value))?;
            }
            Opcode::Random => {
                let max = self.pop_int()?;
                let value = if max < 1 {
                    0
                } else {
                    self.rng.gen_range(1..=max)
                };
                self.push(Value::integer(value))?;
            }

            Opcode::NextObject => {
                let value = self.pop()?;
                value.require_either(ValueTag::None, ValueTag::Object)?;
                let after = match value.tag {
                    ValueTag::Object => Some(value.payload),
                    _ => None,
                };
                let next = self
                    .heap
                    .next_object_ident(after)
                    .map(Value::object)
                    .unwrap_or_else(Value::none);
                self.push(next)?;
            }

            Opcode::GetSetting => {
                let name = self.pop_tagged(ValueTag::String)?;
                let key = self.heap.get_string(name.payload)?.text.clone();
                match self.settings.get(&key) {
                    Some(text) => {
                        let value = self.new_string(&text)?;
                        self.push(value)?;
                    }
                    None => self.push(Value::none())?,
                }
            }
            Opcode::SetSetting => {
                let value = self.pop()?;
                let name = self.pop_tagged(ValueTag::String)?;
                let key = self.heap.get_string(name.payload)?.text.clone();
                let text = self.stringify(value)?;
                self.settings.set(&key, &text);
            }

            Opcode::GetKey => return Ok(Flow::Await(InputRequest::Key)),
            Opcode::GetOption => {
                if self.options.is_empty() {
                    warn!("GetOption with an empty option list");
                }
                return Ok(Flow::Await(InputRequest::Option));
            }
            Opcode::GetLine => return Ok(Flow::Await(InputRequest::Line)),
            Opcode::AddOption => {
                let extra = self.pop()?;
                let value = self.pop()?;
                let caption = self.pop_tagged(ValueTag::String)?;
                self.options.push(OptionEntry {
                    caption,
                    value,
                    extra,
                });
            }

            Opcode::StringClear => {
                let target = self.pop_tagged(ValueTag::String)?;
                self.mutable_string(target.payload)?.text.clear();
            }
            Opcode::StringAppend => {
                let value = self.pop()?;
                let target = self.pop_tagged(ValueTag::String)?;
                let text = self.stringify(value)?;
                self.mutable_string(target.payload)?.text.push_str(&text);
            }
            Opcode::StringAppendUF => {
                let value = self.pop()?;
                let target = self.pop_tagged(ValueTag::String)?;
                let text = ucfirst(&self.stringify(value)?);
                self.mutable_string(target.payload)?.text.push_str(&text);
            }
            Opcode::StringCompare => {
                let right = self.pop_tagged(ValueTag::String)?;
                let left = self.pop_tagged(ValueTag::String)?;
                let ordering = self
                    .heap
                    .get_string(left.payload)?
                    .text
                    .cmp(&self.heap.get_string(right.payload)?.text);
                self.push(Value::integer(ordering as i32))?;
            }

            Opcode::Error => {
                let value = self.pop()?;
                let message = self.stringify(value)?;
                return Err(RuntimeError::new(ErrorKind::UserError, message));
            }

            Opcode::EncodeString => {
                let source = self.pop_tagged(ValueTag::String)?;
                let bytes = self.heap.get_string(source.payload)?.text.clone();
                let items: Vec<Value> = bytes
                    .as_bytes()
                    .chunks(4)
                    .map(|chunk| {
                        let mut word = [0u8; 4];
                        word[..chunk.len()].copy_from_slice(chunk);
                        Value::integer(i32::from_le_bytes(word))
                    })
                    .collect();
                let list = self.heap.create(ValueTag::List)?;
                self.heap.get_list_mut(list.payload)?.items = items;
                self.push(list)?;
            }
            Opcode::DecodeString => {
                let source = self.pop_tagged(ValueTag::List)?;
                let items = self.heap.get_list(source.payload)?.items.clone();
                let mut bytes = Vec::with_capacity(items.len() * 4);
                'words: for item in items {
                    item.require_type(ValueTag::Integer)?;
                    for byte in item.payload.to_le_bytes() {
                        if byte == 0 {
                            break 'words;
                        }
                        bytes.push(byte);
                    }
                }
                let text = String::from_utf8_lossy(&bytes).into_owned();
                let value = self.new_string(&text)?;
                self.push(value)?;
            }

            Opcode::FileList => {
                let names = self.files.list(&self.info.game_id);
                let mut items = Vec::with_capacity(names.len());
                for name in names {
                    items.push(self.new_string(&name)?);
                }
                let list = self.heap.create(ValueTag::List)?;
                self.heap.get_list_mut(list.payload)?.items = items;
                self.push(list)?;
            }
            Opcode::FileRead => {
                let name = self.pop_string_text()?;
                match self.files.read(&self.info.game_id, &name) {
                    Some(bytes) => {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        let value = self.new_string(&text)?;
                        self.push(value)?;
                    }
                    None => self.push(Value::none())?,
                }
            }
            Opcode::FileWrite => {
                let content = self.pop_tagged(ValueTag::String)?;
                let name = self.pop_string_text()?;
                let bytes =
                    self.heap.get_string(content.payload)?.text.clone();
                self.files.write(&self.info.game_id, &name, bytes.as_bytes());
            }
            Opcode::FileDelete => {
                let name = self.pop_string_text()?;
                let deleted = self.files.delete(&self.info.game_id, &name);
                self.push(Value::integer(deleted as i32))?;
            }

            Opcode::Tokenize => {
                let source = self.pop_tagged(ValueTag::String)?;
                let text =
                    self.heap.get_string(source.payload)?.text.to_lowercase();
                let mut items = Vec::new();
                for token in text
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|t| !t.is_empty())
                {
                    match self.heap.lookup_vocab(token) {
                        Some(index) => items.push(Value::vocab(index)),
                        None => items.push(self.new_string(token)?),
                    }
                }
                let list = self.heap.create(ValueTag::List)?;
                self.heap.get_list_mut(list.payload)?.items = items;
                self.push(list)?;
            }

            Opcode::GetParent => {
                let object = self.pop_tagged(ValueTag::Object)?;
                let parent = self.heap.get_object(object.payload)?.parent;
                self.push(object_or_none(parent))?;
            }
            Opcode::GetFirstChild => {
                let object = self.pop_tagged(ValueTag::Object)?;
                let child = self.heap.get_object(object.payload)?.child;
                self.push(object_or_none(child))?;
            }
            Opcode::GetSibling => {
                let object = self.pop_tagged(ValueTag::Object)?;
                let sibling = self.heap.get_object(object.payload)?.sibling;
                self.push(object_or_none(sibling))?;
            }
            Opcode::GetChildren => {
                let object = self.pop_tagged(ValueTag::Object)?;
                let children = self.heap.children(object.payload)?;
                let items: Vec<Value> =
                    children.into_iter().map(Value::object).collect();
                let list = self.heap.create(ValueTag::List)?;
                self.heap.get_list_mut(list.payload)?.items = items;
                self.push(list)?;
            }
            Opcode::GetChildCount => {
                let object = self.pop_tagged(ValueTag::Object)?;
                let count = self.heap.children(object.payload)?.len() as i32;
                self.push(Value::integer(count))?;
            }
            Opcode::MoveTo => {
                let destination = self.pop()?;
                destination.require_either(ValueTag::Object, ValueTag::None)?;
                let object = self.pop_tagged(ValueTag::Object)?;
                let new_parent = match destination.tag {
                    ValueTag::Object => destination.payload,
                    _ => NO_OBJECT,
                };
                self.heap.move_object(object.payload, new_parent)?;
            }
        }

        Ok(Flow::Continue)
    }

    // ── fetch helpers ──────────────────────────────────────────────

    fn fetch_u8(&mut self) -> Result<u8, RuntimeError> {
        let byte = *self.bytecode.get(self.ip).ok_or_else(|| {
            RuntimeError::new(
                ErrorKind::UnknownOpcode,
                format!("instruction pointer {} out of range", self.ip),
            )
        })?;
        self.ip += 1;
        Ok(byte)
    }

    fn fetch_u16(&mut self) -> Result<u16, RuntimeError> {
        let lo = self.fetch_u8()?;
        let hi = self.fetch_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn fetch_i32(&mut self) -> Result<i32, RuntimeError> {
        let lo = self.fetch_u16()?;
        let hi = self.fetch_u16()?;
        Ok(((hi as u32) << 16 | lo as u32) as i32)
    }

    fn fetch_tag(&mut self) -> Result<ValueTag, RuntimeError> {
        let byte = self.fetch_u8()?;
        tag_from_payload(byte as i32)
    }

    // ── stack helpers ──────────────────────────────────────────────

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        self.calls.top()?.push(value);
        Ok(())
    }

    /// Pop and resolve LocalVar indirections to a concrete value.
    fn pop(&mut self) -> Result<Value, RuntimeError> {
        let frame = self.calls.top()?;
        let raw = frame.pop()?;
        frame.evaluate(raw)
    }

    fn pop_tagged(&mut self, tag: ValueTag) -> Result<Value, RuntimeError> {
        let value = self.pop()?;
        value.require_type(tag)?;
        Ok(value)
    }

    fn pop_int(&mut self) -> Result<i32, RuntimeError> {
        Ok(self.pop_tagged(ValueTag::Integer)?.payload)
    }

    fn pop_index(&mut self) -> Result<usize, RuntimeError> {
        let value = self.pop_int()?;
        usize::try_from(value).map_err(|_| {
            RuntimeError::new(
                ErrorKind::InvalidStackPosition,
                format!("negative position {}", value),
            )
        })
    }

    fn pop_string_text(&mut self) -> Result<String, RuntimeError> {
        let value = self.pop_tagged(ValueTag::String)?;
        Ok(self.heap.get_string(value.payload)?.text.clone())
    }

    // ── opcode bodies too large for the match ──────────────────────

    fn call_function(
        &mut self,
        function: i32,
        args: &[Value],
        this: i32,
    ) -> Result<(), RuntimeError> {
        let (arg_count, local_count, code_position) = {
            let entry = self.heap.get_function(function)?;
            for (i, arg) in args.iter().take(entry.arg_count as usize).enumerate()
            {
                let declared = entry.slot_types[i];
                if declared != ValueTag::Any && arg.tag != declared {
                    return Err(RuntimeError::new(
                        ErrorKind::TypeMismatch,
                        format!(
                            "argument {}: expected {}, got {}",
                            i, declared, arg.tag
                        ),
                    ));
                }
            }
            (
                entry.arg_count as usize,
                entry.local_count as usize,
                entry.code_position as usize,
            )
        };
        let locals = build_locals(args, arg_count, arg_count + local_count);
        self.calls.push(Frame::new(
            function,
            code_position,
            self.ip,
            this,
            locals,
        ));
        self.ip = code_position;
        Ok(())
    }

    fn jump(&mut self, target: Value) -> Result<(), RuntimeError> {
        let base = self.calls.top()?.base_address;
        let offset = usize::try_from(target.payload).map_err(|_| {
            RuntimeError::new(
                ErrorKind::UnknownOpcode,
                format!("negative jump target {}", target.payload),
            )
        })?;
        self.ip = base + offset;
        Ok(())
    }

    fn binary_int(
        &mut self,
        f: impl FnOnce(i32, i32) -> i32,
    ) -> Result<(), RuntimeError> {
        let right = self.pop_int()?;
        let left = self.pop_int()?;
        self.push(Value::integer(f(left, right)))
    }

    fn ordered(
        &mut self,
        f: impl FnOnce(i32) -> bool,
    ) -> Result<(), RuntimeError> {
        let right = self.pop_tagged(ValueTag::Integer)?;
        let left = self.pop_tagged(ValueTag::Integer)?;
        self.push(Value::integer(f(compare(left, right)) as i32))
    }

    fn get_item(&mut self) -> Result<(), RuntimeError> {
        let key = self.pop()?;
        let receiver = self.pop()?;
        let value = match receiver.tag {
            ValueTag::Object => {
                let prop = property_id(key)?;
                self.heap.get_property(receiver.payload, prop)?
            }
            ValueTag::List => {
                key.require_type(ValueTag::Integer)?;
                let items = &self.heap.get_list(receiver.payload)?.items;
                // Out-of-range list reads yield Integer 0, not an error.
                usize::try_from(key.payload)
                    .ok()
                    .and_then(|i| items.get(i))
                    .copied()
                    .unwrap_or_else(|| Value::integer(0))
            }
            ValueTag::Map => self
                .heap
                .get_map(receiver.payload)?
                .entries
                .get(&key.key())
                .copied()
                .unwrap_or_else(Value::none),
            other => return Err(container_mismatch(other)),
        };
        self.push(value)
    }

    fn set_item(&mut self, insert: bool) -> Result<(), RuntimeError> {
        let value = self.pop()?;
        value.forbid_type(ValueTag::VarRef)?;
        let key = self.pop()?;
        let receiver = self.pop()?;
        match receiver.tag {
            ValueTag::Object => {
                let prop = property_id(key)?;
                self.heap.set_property(receiver.payload, prop, value)?;
            }
            ValueTag::List => {
                key.require_type(ValueTag::Integer)?;
                let items = &mut self.heap.get_list_mut(receiver.payload)?.items;
                // Negative indices clamp to 0; writes past the end extend.
                let index = usize::try_from(key.payload).unwrap_or(0);
                if insert {
                    let index = index.min(items.len());
                    items.insert(index, value);
                } else {
                    if index >= items.len() {
                        items.resize(index + 1, Value::none());
                    }
                    items[index] = value;
                }
            }
            ValueTag::Map => {
                self.heap
                    .get_map_mut(receiver.payload)?
                    .entries
                    .insert(key.key(), value);
            }
            other => return Err(container_mismatch(other)),
        }
        Ok(())
    }

    fn has_item(&mut self) -> Result<(), RuntimeError> {
        let key = self.pop()?;
        let receiver = self.pop()?;
        let present = match receiver.tag {
            ValueTag::Object => {
                let prop = property_id(key)?;
                self.heap.has_property(receiver.payload, prop)?
            }
            ValueTag::List => {
                key.require_type(ValueTag::Integer)?;
                let len = self.heap.get_list(receiver.payload)?.items.len();
                usize::try_from(key.payload).map(|i| i < len).unwrap_or(false)
            }
            ValueTag::Map => self
                .heap
                .get_map(receiver.payload)?
                .entries
                .contains_key(&key.key()),
            other => return Err(container_mismatch(other)),
        };
        self.push(Value::integer(present as i32))
    }

    fn del_item(&mut self) -> Result<(), RuntimeError> {
        let key = self.pop()?;
        let receiver = self.pop()?;
        match receiver.tag {
            ValueTag::Object => {
                let prop = property_id(key)?;
                self.heap.delete_property(receiver.payload, prop)?;
            }
            ValueTag::List => {
                key.require_type(ValueTag::Integer)?;
                let items = &mut self.heap.get_list_mut(receiver.payload)?.items;
                if let Ok(index) = usize::try_from(key.payload) {
                    if index < items.len() {
                        items.remove(index);
                    }
                }
            }
            ValueTag::Map => {
                self.heap
                    .get_map_mut(receiver.payload)?
                    .entries
                    .shift_remove(&key.key());
            }
            other => return Err(container_mismatch(other)),
        }
        Ok(())
    }

    fn get_size(&mut self) -> Result<(), RuntimeError> {
        let receiver = self.pop()?;
        let size = match receiver.tag {
            ValueTag::Object => {
                self.heap.get_object(receiver.payload)?.properties.len()
            }
            ValueTag::List => self.heap.get_list(receiver.payload)?.items.len(),
            ValueTag::Map => self.heap.get_map(receiver.payload)?.entries.len(),
            ValueTag::String => {
                self.heap.get_string(receiver.payload)?.text.chars().count()
            }
            other => return Err(container_mismatch(other)),
        };
        self.push(Value::integer(size as i32))
    }

    fn get_keys(&mut self) -> Result<(), RuntimeError> {
        let receiver = self.pop()?;
        let items: Vec<Value> = match receiver.tag {
            ValueTag::Object => self
                .heap
                .get_object(receiver.payload)?
                .properties
                .keys()
                .map(|&p| Value::property(p as i32))
                .collect(),
            ValueTag::Map => self
                .heap
                .get_map(receiver.payload)?
                .entries
                .keys()
                .map(|k| k.value())
                .collect(),
            other => return Err(container_mismatch(other)),
        };
        let list = self.heap.create(ValueTag::List)?;
        self.heap.get_list_mut(list.payload)?.items = items;
        self.push(list)
    }

    // ── misc helpers ───────────────────────────────────────────────

    fn new_string(&mut self, text: &str) -> Result<Value, RuntimeError> {
        let value = self.heap.create(ValueTag::String)?;
        self.heap.get_string_mut(value.payload)?.text.push_str(text);
        Ok(value)
    }

    fn mutable_string(
        &mut self,
        ident: i32,
    ) -> Result<&mut crate::heap::StringEntry, RuntimeError> {
        let entry = self.heap.get_string_mut(ident)?;
        if entry.is_static {
            return Err(RuntimeError::new(
                ErrorKind::StaticMutationDenied,
                format!("string {} is static", ident),
            ));
        }
        Ok(entry)
    }

    /// Render a value as output text. Non-string payloads are stringified;
    /// None renders as nothing.
    fn stringify(&self, value: Value) -> Result<String, RuntimeError> {
        Ok(match value.tag {
            ValueTag::None => String::new(),
            ValueTag::Integer => value.payload.to_string(),
            ValueTag::String => {
                self.heap.get_string(value.payload)?.text.clone()
            }
            ValueTag::Vocab => {
                self.heap.get_vocab(value.payload)?.to_string()
            }
            _ => value.to_string(),
        })
    }

    fn origin_text(&self, value: Value) -> String {
        match self.heap.origin_of(value) {
            Some(Origin::Dynamic) => "dynamic".to_string(),
            Some(Origin::Source { file, line }) if file >= 0 => {
                let name = self
                    .heap
                    .strings
                    .get(&file)
                    .map(|e| e.text.as_str())
                    .unwrap_or("?");
                format!("{}:{}", name, line)
            }
            _ => "no debug info".to_string(),
        }
    }
}

fn object_or_none(ident: i32) -> Value {
    if ident == NO_OBJECT {
        Value::none()
    } else {
        Value::object(ident)
    }
}

fn container_mismatch(tag: ValueTag) -> RuntimeError {
    RuntimeError::new(
        ErrorKind::TypeMismatch,
        format!("expected object, list, or map, got {}", tag),
    )
}

fn property_id(key: Value) -> Result<u16, RuntimeError> {
    key.require_type(ValueTag::Property)?;
    u16::try_from(key.payload).map_err(|_| {
        RuntimeError::new(
            ErrorKind::TypeMismatch,
            format!("property id {} out of range", key.payload),
        )
    })
}

fn tag_from_payload(payload: i32) -> Result<ValueTag, RuntimeError> {
    u8::try_from(payload)
        .ok()
        .and_then(|b| ValueTag::try_from(b).ok())
        .ok_or_else(|| {
            RuntimeError::new(
                ErrorKind::TypeMismatch,
                format!("invalid type byte {}", payload),
            )
        })
}

fn ucfirst(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{BytecodeBuilder, ImageBuilder};
    use crate::host::{MemoryFileStore, MemorySettings};
    use crate::image::load_image;

    fn machine_from(image: ImageBuilder) -> Machine {
        let game = load_image(&image.build()).unwrap();
        Machine::new(
            game,
            Box::new(MemoryFileStore::new()),
            Box::new(MemorySettings::new()),
        )
    }

    /// Build a machine whose main function takes no args and has no locals.
    fn machine(
        build: impl FnOnce(&mut ImageBuilder) -> BytecodeBuilder,
    ) -> Machine {
        let mut image = ImageBuilder::new();
        let code = build(&mut image);
        let main = image.add_function(0, 0, vec![], code);
        image.set_main(main);
        machine_from(image)
    }

    fn finished_output(turn: Turn) -> String {
        match turn {
            Turn::Finished { output } => output,
            other => panic!("expected Finished, got {:?}", other),
        }
    }

    fn failure(turn: Turn) -> RuntimeError {
        match turn {
            Turn::Failed { error, .. } => error,
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn hello_world_prints_and_finishes() {
        let mut m = machine(|image| {
            let hello = image.add_string("Hello");
            let mut b = BytecodeBuilder::new();
            b.push_value(ValueTag::String, hello);
            b.emit(Opcode::Say);
            b.emit(Opcode::Return);
            b
        });
        assert_eq!(finished_output(m.start()), "Hello");
        assert_eq!(m.call_depth(), 0);
    }

    #[test]
    fn arithmetic_wraps_and_division_by_zero_is_zero() {
        let mut m = machine(|_| {
            let mut b = BytecodeBuilder::new();
            b.push_value(ValueTag::Integer, i32::MAX);
            b.push_int(1);
            b.emit(Opcode::Add);
            b.emit(Opcode::Say);
            b.push_int(32);
            b.emit(Opcode::SayChar);
            b.push_int(5);
            b.push_int(0);
            b.emit(Opcode::Div);
            b.emit(Opcode::Say);
            b.push_int(32);
            b.emit(Opcode::SayChar);
            b.push_int(5);
            b.push_int(0);
            b.emit(Opcode::Mod);
            b.emit(Opcode::Say);
            b.emit(Opcode::Return);
            b
        });
        assert_eq!(finished_output(m.start()), "-2147483648 0 0");
    }

    #[test]
    fn jump_zero_skips_when_the_test_is_zero() {
        let mut m = machine(|image| {
            let skipped = image.add_string("skipped");
            let end = image.add_string("end");
            let mut b = BytecodeBuilder::new();
            b.push_int(0);
            let label = b.jump_label();
            b.emit(Opcode::JumpZero);
            b.push_value(ValueTag::String, skipped);
            b.emit(Opcode::Say);
            b.bind(label);
            b.push_value(ValueTag::String, end);
            b.emit(Opcode::Say);
            b.emit(Opcode::Return);
            b
        });
        assert_eq!(finished_output(m.start()), "end");
    }

    #[test]
    fn store_writes_locals_and_local_var_reads_them_back() {
        let mut image = ImageBuilder::new();
        let mut b = BytecodeBuilder::new();
        b.push_int(42);
        b.push_value(ValueTag::VarRef, 0);
        b.emit(Opcode::Store);
        b.push_value(ValueTag::LocalVar, 0);
        b.emit(Opcode::Say);
        b.emit(Opcode::Return);
        let main = image.add_function(0, 1, vec![], b);
        image.set_main(main);
        let mut m = machine_from(image);
        assert_eq!(finished_output(m.start()), "42");
    }

    #[test]
    fn call_through_a_property_binds_self_and_returns() {
        let mut image = ImageBuilder::new();
        let mut callee = BytecodeBuilder::new();
        callee.push_value(ValueTag::LocalVar, 0);
        callee.emit(Opcode::Say);
        callee.push_int(99);
        callee.emit(Opcode::Return);
        let f = image.add_function(1, 0, vec![ValueTag::Integer], callee);
        let obj = image.add_object(0, vec![(1, Value::node(f))]);

        let mut main = BytecodeBuilder::new();
        main.push_int(7);
        main.push_int(1);
        main.push_value(ValueTag::Object, obj);
        main.push_value(ValueTag::Property, 1);
        main.emit(Opcode::GetItem);
        main.emit(Opcode::Call);
        main.emit(Opcode::Say); // the callee's result
        main.emit(Opcode::Return);
        let m_id = image.add_function(0, 0, vec![], main);
        image.set_main(m_id);

        let mut m = machine_from(image);
        assert_eq!(finished_output(m.start()), "799");
    }

    #[test]
    fn call_argument_type_mismatch_is_fatal() {
        let mut image = ImageBuilder::new();
        let mut callee = BytecodeBuilder::new();
        callee.emit(Opcode::Return);
        let f = image.add_function(1, 0, vec![ValueTag::Integer], callee);
        let obj = image.add_object(0, vec![(1, Value::node(f))]);

        let hello = image.add_string("x");
        let mut main = BytecodeBuilder::new();
        main.push_value(ValueTag::String, hello);
        main.push_int(1);
        main.push_value(ValueTag::Object, obj);
        main.push_value(ValueTag::Property, 1);
        main.emit(Opcode::GetItem);
        main.emit(Opcode::Call);
        main.emit(Opcode::Return);
        let m_id = image.add_function(0, 0, vec![], main);
        image.set_main(m_id);

        let mut m = machine_from(image);
        let error = failure(m.start());
        assert_eq!(error.kind, ErrorKind::TypeMismatch);
        assert!(error.message.contains("argument 0"));
    }

    #[test]
    fn calling_a_function_without_a_self_binding_is_fatal() {
        let mut image = ImageBuilder::new();
        let mut callee = BytecodeBuilder::new();
        callee.emit(Opcode::Return);
        let f = image.add_function(0, 0, vec![], callee);
        let mut main = BytecodeBuilder::new();
        main.push_int(0);
        main.push_value(ValueTag::Node, f);
        main.emit(Opcode::Call);
        main.emit(Opcode::Return);
        let m_id = image.add_function(0, 0, vec![], main);
        image.set_main(m_id);

        let mut m = machine_from(image);
        let error = failure(m.start());
        assert_eq!(error.kind, ErrorKind::TypeMismatch);
        assert!(error.message.contains("self binding"));
    }

    #[test]
    fn get_option_suspends_and_resumes_with_the_chosen_value() {
        let mut m = machine(|image| {
            let north = image.add_string("north");
            let extra = image.add_string("compass");
            let mut b = BytecodeBuilder::new();
            b.push_value(ValueTag::String, north);
            b.push_int(11);
            b.push_value(ValueTag::String, extra);
            b.emit(Opcode::AddOption);
            b.emit(Opcode::GetOption);
            b.emit(Opcode::Say);
            b.emit(Opcode::Return);
            b
        });
        let options = match m.start() {
            Turn::AwaitingOption { output, options } => {
                assert_eq!(output, "");
                options
            }
            other => panic!("expected AwaitingOption, got {:?}", other),
        };
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].value, Value::integer(11));
        assert_eq!(m.pending_input(), Some(InputRequest::Option));

        assert_eq!(finished_output(m.resume_option(0)), "11");
        assert_eq!(options[0].extra, m.option_extra());
        assert_eq!(m.pending_input(), None);
    }

    #[test]
    fn key_and_line_input_round_trip() {
        let mut m = machine(|_| {
            let mut b = BytecodeBuilder::new();
            b.emit(Opcode::GetKey);
            b.emit(Opcode::Say);
            b.emit(Opcode::GetLine);
            b.emit(Opcode::Say);
            b.emit(Opcode::Return);
            b
        });
        assert!(matches!(m.start(), Turn::AwaitingKey { .. }));
        match m.resume_key(65) {
            Turn::AwaitingLine { output } => assert_eq!(output, "65"),
            other => panic!("expected AwaitingLine, got {:?}", other),
        }
        assert_eq!(finished_output(m.resume_line("go north")), "go north");
    }

    #[test]
    fn resuming_with_the_wrong_input_kind_fails() {
        let mut m = machine(|_| {
            let mut b = BytecodeBuilder::new();
            b.emit(Opcode::GetKey);
            b.emit(Opcode::StackPop);
            b.emit(Opcode::Return);
            b
        });
        assert!(matches!(m.start(), Turn::AwaitingKey { .. }));
        let error = failure(m.resume_line("nope"));
        assert_eq!(error.kind, ErrorKind::TypeMismatch);
    }

    #[test]
    fn static_strings_refuse_mutation_and_the_stack_survives() {
        let mut m = machine(|image| {
            let target = image.add_string("fixed");
            let tail = image.add_string("!");
            let mut b = BytecodeBuilder::new();
            b.push_value(ValueTag::String, target);
            b.push_value(ValueTag::String, tail);
            b.emit(Opcode::StringAppend);
            b.emit(Opcode::Return);
            b
        });
        let error = failure(m.start());
        assert_eq!(error.kind, ErrorKind::StaticMutationDenied);
        // The call stack is left as it was at the point of failure.
        assert_eq!(m.call_depth(), 1);
    }

    #[test]
    fn dynamic_strings_accept_append_clear_and_ucfirst() {
        let mut m = machine(|image| {
            let hello = image.add_string("hello");
            let mut b = BytecodeBuilder::new();
            b.push_value(ValueTag::TypeId, ValueTag::String as i32);
            b.emit(Opcode::New);
            b.emit(Opcode::StackDup);
            b.push_value(ValueTag::String, hello);
            b.emit(Opcode::StringAppendUF);
            b.emit(Opcode::Say);
            b.emit(Opcode::Return);
            b
        });
        assert_eq!(finished_output(m.start()), "Hello");
    }

    #[test]
    fn encode_then_decode_recovers_the_text() {
        let mut m = machine(|image| {
            let src = image.add_string("Hello, world!");
            let mut b = BytecodeBuilder::new();
            b.push_value(ValueTag::String, src);
            b.emit(Opcode::EncodeString);
            b.emit(Opcode::DecodeString);
            b.emit(Opcode::Say);
            b.emit(Opcode::Return);
            b
        });
        assert_eq!(finished_output(m.start()), "Hello, world!");
    }

    #[test]
    fn tokenize_lowercases_and_prefers_vocabulary_words() {
        let mut m = machine(|image| {
            image.add_vocab("go");
            image.add_vocab("north");
            let input = image.add_string("Go North, quickly!");
            let mut b = BytecodeBuilder::new();
            b.push_value(ValueTag::String, input);
            b.emit(Opcode::Tokenize);
            for index in 0..3 {
                b.emit(Opcode::StackDup);
                b.push_int(index);
                b.emit(Opcode::GetItem);
                b.emit(Opcode::Say);
                b.push_int(32);
                b.emit(Opcode::SayChar);
            }
            b.emit(Opcode::StackPop);
            b.emit(Opcode::Return);
            b
        });
        assert_eq!(finished_output(m.start()), "go north quickly ");
    }

    #[test]
    fn runaway_loops_yield_working_at_the_slice_budget() {
        let mut m = machine(|_| {
            let mut b = BytecodeBuilder::new();
            b.push_target(0);
            b.emit(Opcode::Jump);
            b
        });
        m.slice_budget = 100;
        assert!(matches!(m.start(), Turn::Working));
        assert!(matches!(m.resume_slice(), Turn::Working));
    }

    #[test]
    fn error_opcode_fails_with_the_payload_as_message() {
        let mut m = machine(|image| {
            let msg = image.add_string("boom");
            let mut b = BytecodeBuilder::new();
            b.push_value(ValueTag::String, msg);
            b.emit(Opcode::Error);
            b.emit(Opcode::Return);
            b
        });
        match m.start() {
            Turn::Failed { error, dump, .. } => {
                assert_eq!(error.kind, ErrorKind::UserError);
                assert_eq!(error.message, "boom");
                assert!(dump.contains("function"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn turn_boundary_gc_sweeps_garbage_made_during_the_turn() {
        let mut m = machine(|_| {
            let mut b = BytecodeBuilder::new();
            b.push_value(ValueTag::TypeId, ValueTag::List as i32);
            b.emit(Opcode::New);
            b.emit(Opcode::StackPop);
            b.emit(Opcode::GetKey);
            b.emit(Opcode::StackPop);
            b.emit(Opcode::Return);
            b
        });
        m.gc_frequency = 1;
        assert!(matches!(m.start(), Turn::AwaitingKey { .. }));
        assert!(m.heap.lists.is_empty());
        assert!(matches!(m.resume_key(0), Turn::Finished { .. }));
    }

    #[test]
    fn move_to_rewires_the_object_forest() {
        let mut image = ImageBuilder::new();
        let parent = image.add_object(0, vec![]);
        let child = image.add_object(0, vec![]);
        let mut b = BytecodeBuilder::new();
        b.push_value(ValueTag::Object, child);
        b.push_value(ValueTag::Object, parent);
        b.emit(Opcode::MoveTo);
        b.push_value(ValueTag::Object, parent);
        b.emit(Opcode::GetChildCount);
        b.emit(Opcode::Say);
        b.push_value(ValueTag::Object, child);
        b.emit(Opcode::GetParent);
        b.push_value(ValueTag::Object, parent);
        b.emit(Opcode::Equal);
        b.emit(Opcode::Say);
        b.push_value(ValueTag::Object, child);
        b.push_none();
        b.emit(Opcode::MoveTo);
        b.push_value(ValueTag::Object, parent);
        b.emit(Opcode::GetFirstChild);
        b.emit(Opcode::Say);
        b.emit(Opcode::Return);
        let main = image.add_function(0, 0, vec![], b);
        image.set_main(main);

        let mut m = machine_from(image);
        // detached again: GetFirstChild of the emptied parent prints nothing
        assert_eq!(finished_output(m.start()), "11");
    }

    #[test]
    fn list_writes_extend_and_out_of_range_reads_are_zero() {
        let mut m = machine(|image| {
            let list = image.add_list(vec![]);
            let mut b = BytecodeBuilder::new();
            b.push_value(ValueTag::List, list);
            b.push_int(5);
            b.push_int(9);
            b.emit(Opcode::SetItem);
            b.push_value(ValueTag::List, list);
            b.emit(Opcode::GetSize);
            b.emit(Opcode::Say);
            b.push_value(ValueTag::List, list);
            b.push_int(5);
            b.emit(Opcode::GetItem);
            b.emit(Opcode::Say);
            b.push_value(ValueTag::List, list);
            b.push_int(50);
            b.emit(Opcode::GetItem);
            b.emit(Opcode::Say);
            b.emit(Opcode::Return);
            b
        });
        assert_eq!(finished_output(m.start()), "690");
    }

    #[test]
    fn add_item_clamps_indices_to_the_list_bounds() {
        let mut m = machine(|image| {
            let list =
                image.add_list(vec![Value::integer(1), Value::integer(2)]);
            let mut b = BytecodeBuilder::new();
            // index far past the end appends
            b.push_value(ValueTag::List, list);
            b.push_int(99);
            b.push_int(3);
            b.emit(Opcode::AddItem);
            // negative index inserts at the front
            b.push_value(ValueTag::List, list);
            b.push_int(-5);
            b.push_int(0);
            b.emit(Opcode::AddItem);
            b.push_value(ValueTag::List, list);
            b.emit(Opcode::GetSize);
            b.emit(Opcode::Say);
            b.push_value(ValueTag::List, list);
            b.push_int(0);
            b.emit(Opcode::GetItem);
            b.emit(Opcode::Say);
            b.push_value(ValueTag::List, list);
            b.push_int(3);
            b.emit(Opcode::GetItem);
            b.emit(Opcode::Say);
            b.emit(Opcode::Return);
            b
        });
        assert_eq!(finished_output(m.start()), "403");
    }

    #[test]
    fn map_keys_are_distinguished_by_tag() {
        let mut m = machine(|_| {
            let mut b = BytecodeBuilder::new();
            b.push_value(ValueTag::TypeId, ValueTag::Map as i32);
            b.emit(Opcode::New);
            b.emit(Opcode::StackDup);
            b.push_int(1);
            b.push_int(7);
            b.emit(Opcode::SetItem);
            b.emit(Opcode::StackDup);
            b.push_value(ValueTag::Property, 1);
            b.push_int(8);
            b.emit(Opcode::SetItem);
            b.emit(Opcode::StackDup);
            b.push_int(1);
            b.emit(Opcode::GetItem);
            b.emit(Opcode::Say);
            b.emit(Opcode::StackDup);
            b.push_value(ValueTag::Property, 1);
            b.emit(Opcode::GetItem);
            b.emit(Opcode::Say);
            b.emit(Opcode::StackDup);
            b.push_value(ValueTag::Property, 2);
            b.emit(Opcode::HasItem);
            b.emit(Opcode::Say);
            b.emit(Opcode::StackPop);
            b.emit(Opcode::Return);
            b
        });
        assert_eq!(finished_output(m.start()), "780");
    }

    #[test]
    fn sort_and_index_of_work_on_lists() {
        let mut m = machine(|image| {
            let list = image.add_list(vec![
                Value::integer(3),
                Value::integer(1),
                Value::integer(2),
            ]);
            let mut b = BytecodeBuilder::new();
            b.push_value(ValueTag::List, list);
            b.emit(Opcode::Sort);
            b.push_value(ValueTag::List, list);
            b.push_int(0);
            b.emit(Opcode::GetItem);
            b.emit(Opcode::Say);
            b.push_value(ValueTag::List, list);
            b.push_int(2);
            b.emit(Opcode::GetItem);
            b.emit(Opcode::Say);
            b.push_value(ValueTag::List, list);
            b.push_int(2);
            b.emit(Opcode::IndexOf);
            b.emit(Opcode::Say);
            b.emit(Opcode::Return);
            b
        });
        assert_eq!(finished_output(m.start()), "131");
    }

    #[test]
    fn file_and_settings_opcodes_round_trip_through_the_host() {
        let mut image = ImageBuilder::new();
        let name = image.add_string("save1");
        let content = image.add_string("data");
        let key = image.add_string("volume");
        let title = image.add_string("Demo");
        let author = image.add_string("me");
        let version = image.add_string("1.0");
        let game_id = image.add_string("demo-1");
        image.set_info(title, author, version, game_id, 3);

        let mut b = BytecodeBuilder::new();
        b.push_value(ValueTag::String, name);
        b.emit(Opcode::FileRead);
        b.emit(Opcode::Say); // missing file reads as None, prints nothing
        b.push_value(ValueTag::String, name);
        b.push_value(ValueTag::String, content);
        b.emit(Opcode::FileWrite);
        b.emit(Opcode::FileList);
        b.emit(Opcode::GetSize);
        b.emit(Opcode::Say);
        b.push_value(ValueTag::String, name);
        b.emit(Opcode::FileRead);
        b.emit(Opcode::Say);
        b.push_value(ValueTag::String, name);
        b.emit(Opcode::FileDelete);
        b.emit(Opcode::Say);
        b.push_value(ValueTag::String, key);
        b.push_int(3);
        b.emit(Opcode::SetSetting);
        b.push_value(ValueTag::String, key);
        b.emit(Opcode::GetSetting);
        b.emit(Opcode::Say);
        b.emit(Opcode::Return);
        let main = image.add_function(0, 0, vec![], b);
        image.set_main(main);

        let mut m = machine_from(image);
        assert_eq!(m.info.game_id, "demo-1");
        assert_eq!(finished_output(m.start()), "1data13");
    }

    #[test]
    fn random_stays_in_range_and_degenerate_bounds_give_zero() {
        let mut m = machine(|_| {
            let mut b = BytecodeBuilder::new();
            b.push_int(6);
            b.emit(Opcode::Random);
            b.emit(Opcode::Say);
            b.push_int(0);
            b.emit(Opcode::Random);
            b.emit(Opcode::Say);
            b.push_int(-4);
            b.emit(Opcode::Random);
            b.emit(Opcode::Say);
            b.emit(Opcode::Return);
            b
        });
        m.seed_rng(7);
        let out = finished_output(m.start());
        let first: u32 = out[..1].parse().unwrap();
        assert!((1..=6).contains(&first));
        assert_eq!(&out[1..], "00");
    }

    #[test]
    fn type_introspection_opcodes_agree_with_the_heap() {
        let mut m = machine(|image| {
            let s = image.add_string("x");
            let mut b = BytecodeBuilder::new();
            b.push_value(ValueTag::String, s);
            b.emit(Opcode::IsStatic);
            b.emit(Opcode::Say);
            b.push_value(ValueTag::TypeId, ValueTag::String as i32);
            b.emit(Opcode::New);
            b.emit(Opcode::StackDup);
            b.emit(Opcode::IsStatic);
            b.emit(Opcode::Say);
            b.emit(Opcode::IsValid);
            b.emit(Opcode::Say);
            b.push_value(ValueTag::String, s);
            b.emit(Opcode::TypeOf);
            b.push_value(ValueTag::TypeId, ValueTag::String as i32);
            b.emit(Opcode::Equal);
            b.emit(Opcode::Say);
            b.emit(Opcode::Return);
            b
        });
        assert_eq!(finished_output(m.start()), "1011");
    }

    #[test]
    fn container_ops_reject_non_container_receivers() {
        let mut m = machine(|_| {
            let mut b = BytecodeBuilder::new();
            b.push_int(1);
            b.push_int(0);
            b.emit(Opcode::GetItem);
            b.emit(Opcode::Return);
            b
        });
        let error = failure(m.start());
        assert_eq!(error.kind, ErrorKind::TypeMismatch);
        assert!(error.message.contains("expected object, list, or map"));
        assert!(error.message.contains("integer"));
    }

    #[test]
    fn origin_describes_where_entities_come_from() {
        let mut image = ImageBuilder::new();
        let file = image.add_string("room.src");
        let room = image.add_object_at(-1, file, 12, 0, vec![]);
        let stripped = image.add_list(vec![]);

        let mut b = BytecodeBuilder::new();
        b.push_value(ValueTag::Object, room);
        b.emit(Opcode::Origin);
        b.emit(Opcode::Say);
        b.push_int(32);
        b.emit(Opcode::SayChar);
        b.push_value(ValueTag::List, stripped);
        b.emit(Opcode::Origin);
        b.emit(Opcode::Say);
        b.push_int(32);
        b.emit(Opcode::SayChar);
        b.push_value(ValueTag::TypeId, ValueTag::List as i32);
        b.emit(Opcode::New);
        b.emit(Opcode::Origin);
        b.emit(Opcode::Say);
        b.emit(Opcode::Return);
        let main = image.add_function(0, 0, vec![], b);
        image.set_main(main);

        let mut m = machine_from(image);
        assert_eq!(
            finished_output(m.start()),
            "room.src:12 no debug info dynamic"
        );
    }

    #[test]
    fn next_object_walks_idents_in_ascending_order() {
        let mut image = ImageBuilder::new();
        let a = image.add_object(0, vec![]);
        let b_obj = image.add_object(0, vec![]);
        let c = image.add_object(0, vec![]);

        let mut b = BytecodeBuilder::new();
        b.push_none();
        b.emit(Opcode::NextObject);
        for expected in [a, b_obj, c] {
            b.emit(Opcode::StackDup);
            b.push_value(ValueTag::Object, expected);
            b.emit(Opcode::Equal);
            b.emit(Opcode::Say);
            b.emit(Opcode::NextObject);
        }
        // past the last object the walk yields None
        b.emit(Opcode::Not);
        b.emit(Opcode::Say);
        b.emit(Opcode::Return);
        let main = image.add_function(0, 0, vec![], b);
        image.set_main(main);

        let mut m = machine_from(image);
        assert_eq!(finished_output(m.start()), "1111");
    }

    #[test]
    fn unknown_opcodes_report_their_byte_and_position() {
        let mut image = ImageBuilder::new();
        let mut code = BytecodeBuilder::new();
        code.push_int(0);
        code.emit(Opcode::StackPop);
        let main = image.add_function(0, 0, vec![], code);
        image.set_main(main);
        let mut built = image.build();
        // the bytecode segment ends the image; overwrite the trailing
        // StackPop with the reserved byte 64
        let len = built.len();
        built[len - 1] = 64;
        let game = load_image(&built).unwrap();
        let mut m = Machine::new(
            game,
            Box::new(MemoryFileStore::new()),
            Box::new(MemorySettings::new()),
        );
        let error = failure(m.start());
        assert_eq!(error.kind, ErrorKind::UnknownOpcode);
        assert!(error.message.contains("0x40"));
    }
}
