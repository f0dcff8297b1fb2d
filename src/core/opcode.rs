//! Instruction set. The `Push`, `Dup` and `Swap` variants stand for their
//! whole families (0x60..=0x7f, 0x80..=0x8f, 0x90..=0x9f); the interpreter
//! decodes the family ranges before falling back to [FromPrimitive].

use num_derive::FromPrimitive;

#[repr(u8)]
#[derive(FromPrimitive, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
    Stop = 0x00,
    Add = 0x01,
    Mul = 0x02,
    Sub = 0x03,
    Div = 0x04,
    SDiv = 0x05,
    Mod = 0x06,
    SMod = 0x07,
    AddMod = 0x08,
    MulMod = 0x09,
    Exp = 0x0a,
    SignExtend = 0x0b,

    Lt = 0x10,
    Gt = 0x11,
    Slt = 0x12,
    Sgt = 0x13,
    Eql = 0x14,
    IsZero = 0x15,
    And = 0x16,
    Or = 0x17,
    Xor = 0x18,
    Not = 0x19,
    Byte = 0x1a,
    Shl = 0x1b,
    Shr = 0x1c,
    Sar = 0x1d,

    Sha3 = 0x20,

    Addr = 0x30,
    Balance = 0x31,
    Origin = 0x32,
    Caller = 0x33,
    CallValue = 0x34,
    CallDataLoad = 0x35,
    CallDataSize = 0x36,
    CallDataCopy = 0x37,
    CodeSize = 0x38,
    CodeCopy = 0x39,
    GasPrice = 0x3a,
    ReturnDataSize = 0x3d,
    ReturnDataCopy = 0x3e,

    Coinbase = 0x41,
    Timestamp = 0x42,
    Number = 0x43,
    GasLimit = 0x45,
    ChainId = 0x46,
    SelfBalance = 0x47,

    Pop = 0x50,
    MLoad = 0x51,
    MStore = 0x52,
    MStore8 = 0x53,
    SLoad = 0x54,
    SStore = 0x55,
    Jump = 0x56,
    JumpI = 0x57,
    PC = 0x58,
    MSize = 0x59,
    Gas = 0x5a,
    JumpDest = 0x5b,

    Push = 0x60,
    Dup = 0x80,
    Swap = 0x90,

    Log0 = 0xa0,
    Log1 = 0xa1,
    Log2 = 0xa2,
    Log3 = 0xa3,
    Log4 = 0xa4,

    Create = 0xf0,
    Call = 0xf1,
    Return = 0xf3,
    StaticCall = 0xfa,
    Revert = 0xfd,
    Invalid = 0xfe,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn decode_known_and_unknown_bytes() {
        assert_eq!(Opcode::from_u8(0x00), Some(Opcode::Stop));
        assert_eq!(Opcode::from_u8(0x55), Some(Opcode::SStore));
        assert_eq!(Opcode::from_u8(0x5b), Some(Opcode::JumpDest));
        assert_eq!(Opcode::from_u8(0xfd), Some(Opcode::Revert));
        // gaps in the instruction set decode to nothing
        assert_eq!(Opcode::from_u8(0x0c), None);
        assert_eq!(Opcode::from_u8(0x21), None);
        assert_eq!(Opcode::from_u8(0xff), None);
    }
}
