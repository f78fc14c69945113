/// Bytecode opcodes.
///
/// The numbering is part of the game image format and spans 0–89 with gaps
/// (64, 67, 71–73 are reserved); it must stay bit-exact so existing images
/// keep working. Opcodes take their operands from the current frame's
/// operand stack; only `Push8`/`Push16`/`Push32` read inline immediates
/// (a type byte followed by a little-endian 8-, 16-, or 32-bit payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Pop the current frame; its top-of-stack (or None) becomes the result.
    Return = 0,
    Push0 = 1,
    Push1 = 2,
    PushNone = 3,
    /// Operands: `type:u8`, `value:u8` (zero-extended).
    Push8 = 4,
    /// Operands: `type:u8`, `value:u16le` (zero-extended).
    Push16 = 5,
    /// Operands: `type:u8`, `value:i32le`.
    Push32 = 6,
    /// Pop a VarRef destination, pop a value, write the local slot.
    Store = 7,
    CollectGarbage = 8,
    SayUCFirst = 9,
    Say = 10,
    SayUnsigned = 11,
    SayChar = 12,
    StackPop = 13,
    StackDup = 14,
    StackPeek = 15,
    StackSize = 16,
    /// Pop a function value and an argument count, then that many arguments.
    Call = 17,
    IsValid = 18,
    ListPush = 19,
    ListPop = 20,
    Sort = 21,
    GetItem = 22,
    HasItem = 23,
    GetSize = 24,
    SetItem = 25,
    TypeOf = 26,
    DelItem = 27,
    AddItem = 28,
    /// Reinterpret a payload under a new tag, without conversion.
    AsType = 29,
    Equal = 30,
    NotEqual = 31,
    LessThan = 32,
    LessThanEqual = 33,
    GreaterThan = 34,
    GreaterThanEqual = 35,
    /// Pop a JumpTarget; `IP = frame.base_address + target`.
    Jump = 36,
    JumpZero = 37,
    JumpNotZero = 38,
    Not = 39,
    Add = 40,
    Sub = 41,
    Mult = 42,
    Div = 43,
    Mod = 44,
    BitAnd = 45,
    BitOr = 46,
    BitXor = 47,
    ShiftLeft = 48,
    ShiftRight = 49,
    Negate = 50,
    BitNot = 51,
    Random = 52,
    NextObject = 53,
    IndexOf = 54,
    GetRandom = 55,
    GetKeys = 56,
    StackSwap = 57,
    GetSetting = 58,
    SetSetting = 59,
    /// Suspend until the host supplies a key code.
    GetKey = 60,
    /// Suspend until the host supplies a chosen option's value.
    GetOption = 61,
    /// Suspend until the host supplies a line of input.
    GetLine = 62,
    AddOption = 63,
    StringClear = 65,
    StringAppend = 66,
    StringCompare = 68,
    /// Pop a value and raise a user-triggered fatal error.
    Error = 69,
    Origin = 70,
    New = 74,
    StringAppendUF = 75,
    IsStatic = 76,
    EncodeString = 77,
    DecodeString = 78,
    FileList = 79,
    FileRead = 80,
    FileWrite = 81,
    FileDelete = 82,
    Tokenize = 83,
    GetParent = 84,
    GetFirstChild = 85,
    GetSibling = 86,
    GetChildren = 87,
    GetChildCount = 88,
    MoveTo = 89,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        // The numbering has reserved gaps, so a transmute over a range check
        // is not enough.
        match byte {
            0..=63 | 65 | 66 | 68..=70 | 74..=89 => {
                // SAFETY: every accepted byte above is a declared variant of
                // this repr(u8) enum.
                Ok(unsafe { core::mem::transmute::<u8, Opcode>(byte) })
            }
            _ => Err(byte),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbering_is_bit_exact() {
        assert_eq!(Opcode::Return as u8, 0);
        assert_eq!(Opcode::Push32 as u8, 6);
        assert_eq!(Opcode::Call as u8, 17);
        assert_eq!(Opcode::Jump as u8, 36);
        assert_eq!(Opcode::Add as u8, 40);
        assert_eq!(Opcode::BitNot as u8, 51);
        assert_eq!(Opcode::AddOption as u8, 63);
        assert_eq!(Opcode::StringClear as u8, 65);
        assert_eq!(Opcode::StringCompare as u8, 68);
        assert_eq!(Opcode::Origin as u8, 70);
        assert_eq!(Opcode::New as u8, 74);
        assert_eq!(Opcode::Tokenize as u8, 83);
        assert_eq!(Opcode::MoveTo as u8, 89);
    }

    #[test]
    fn reserved_gaps_are_rejected() {
        for byte in [64u8, 67, 71, 72, 73, 90, 0xFF] {
            assert_eq!(Opcode::try_from(byte), Err(byte));
        }
    }

    #[test]
    fn assigned_bytes_round_trip() {
        for byte in 0..=89u8 {
            if let Ok(op) = Opcode::try_from(byte) {
                assert_eq!(op as u8, byte);
            }
        }
    }
}
