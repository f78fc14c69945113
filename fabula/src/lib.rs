//! A bytecode virtual machine for interactive fiction.
//!
//! A game is compiled elsewhere into a binary image: string and vocabulary
//! tables, static lists, maps and objects, a function table, and one
//! bytecode segment. [`image::load_image`] reads that into a [`heap::Heap`],
//! and [`interp::Machine`] runs it turn by turn. The machine never blocks on
//! input; the input opcodes suspend it and the host resumes it with a key
//! code, a chosen option, or a line of text.

pub mod builder;
pub mod error;
pub mod gc;
pub mod heap;
pub mod host;
pub mod image;
pub mod interp;
pub mod op;
pub mod stack;
pub mod value;

pub use builder::{BytecodeBuilder, ImageBuilder};
pub use error::{ErrorKind, RuntimeError};
pub use heap::{Heap, NO_OBJECT, Origin};
pub use host::{FileStore, MemoryFileStore, MemorySettings, SettingsStore};
pub use image::{GameImage, GameInfo, LoadError, load_image};
pub use interp::{InputRequest, Machine, OptionEntry, Turn};
pub use op::Opcode;
pub use value::{MapKey, Value, ValueTag, compare};
