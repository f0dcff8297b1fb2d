//! The virtual machine: a 256-bit word stack machine executed by a
//! non-recursive interpreter. The VM never touches chain-level concerns;
//! it is driven by the transaction executor with an [Env] describing the
//! surrounding transaction and block.

mod alu;
mod frame;
mod interp;
mod memory;
pub mod opcode;
pub mod params;
mod stack;

use bitvec::vec::BitVec;
use num_traits::FromPrimitive;

use crate::common::{checked_as_u64, Addr, Gas, Wei, U256};

pub use interp::{Interpreter, VmOutcome};
pub use opcode::Opcode;

/// An immutable, analyzed code object. Jump validation must run in constant
/// time, which [PlainCode] achieves with a precomputed opcode bitmap.
pub trait Code {
    fn is_valid_jumpdest(&self, dest: &U256) -> bool;
    fn as_bytes(&self) -> &[u8];
}

/// Code object constructed directly from raw bytecode; caches the
/// opcode-position bitmap so PUSH immediates can never be jump targets.
pub struct PlainCode {
    code: Box<[u8]>,
    bitmap: BitVec,
}

impl PlainCode {
    pub fn new(code: Box<[u8]>) -> Self {
        let bitmap = crate::common::gen_code_bitmap(&code);
        Self { code, bitmap }
    }

    fn is_opcode(&self, dest: usize) -> bool {
        self.bitmap.get(dest).map(|b| *b).unwrap_or(false)
    }
}

impl Code for PlainCode {
    fn is_valid_jumpdest(&self, dest: &U256) -> bool {
        let dest = if let Some(dest) = checked_as_u64(dest) {
            dest as usize
        } else {
            return false
        };
        if self.is_opcode(dest) {
            if let Some(Opcode::JumpDest) =
                self.code.get(dest).copied().and_then(Opcode::from_u8)
            {
                return true
            }
        }
        false
    }

    fn as_bytes(&self) -> &[u8] {
        &self.code
    }
}

/// Everything the interpreter can observe about the world outside the frame:
/// the transaction origin and gas price, the enclosing block, and the chain.
pub struct Env {
    pub chain_id: u64,
    pub origin: Addr,
    pub gas_price: Wei,
    pub block: BlockEnv,
}

pub struct BlockEnv {
    pub number: u64,
    pub timestamp: u64,
    pub coinbase: Addr,
    pub gas_limit: Gas,
}

/// A log record emitted by LOG0..LOG4. Owned by the receipt of the emitting
/// transaction once the frame that produced it commits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub address: Addr,
    pub topics: Vec<crate::common::Hash>,
    pub data: crate::common::Bytes,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VmError {
    OutOfGas,
    StackUnderflow,
    StackOverflow,
    InvalidJump,
    InvalidOpcode,
    /// Execution hit REVERT; return data is preserved by the interpreter.
    Reverted,
    OutOfMemory,
    Depth,
    InsufficientBalance,
    ContractCollision,
    WriteProtection,
    ReturnDataOutOfBounds,
    GasOverflow,
    MaxCodeSizeExceeded,
}

#[inline(always)]
fn gas_checked_mul(x: Gas, y: Gas) -> Result<Gas, VmError> {
    x.checked_mul(y).ok_or(VmError::GasOverflow)
}

/// Reads `[off, off+len)` from `src`, right-padding with zeros past the end
/// of the buffer.
fn get_data(src: &[u8], mut off: u64, len: u64) -> Vec<u8> {
    let src_len = src.len() as u64;
    if off > src_len {
        off = src_len
    }
    let mut end = off.saturating_add(len);
    if end > src_len {
        end = src_len
    }
    let mut data = src[off as usize..end as usize].to_vec();
    data.resize(len as usize, 0);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_data() {
        assert_eq!(
            get_data(&hex::decode("00010203").unwrap(), 0, 4),
            hex::decode("00010203").unwrap()
        );
        assert_eq!(
            get_data(&hex::decode("0001").unwrap(), 1, 4),
            hex::decode("01000000").unwrap()
        );
        assert_eq!(get_data(&[], 100, 2), vec![0, 0]);
    }

    #[test]
    fn jumpdest_inside_push_data_is_invalid() {
        // PUSH1 0x5b JUMPDEST
        let code = PlainCode::new(hex::decode("605b5b").unwrap().into());
        assert!(!code.is_valid_jumpdest(&1.into()));
        assert!(code.is_valid_jumpdest(&2.into()));
        assert!(!code.is_valid_jumpdest(&100.into()));
        assert!(!code.is_valid_jumpdest(&U256::MAX));
    }
}
