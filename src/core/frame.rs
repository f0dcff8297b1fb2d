use std::rc::Rc;

use log::debug;
use sha3::Digest;

use super::alu;
use super::memory::Memory;
use super::params::*;
use super::stack::Stack;
use super::{gas_checked_mul, get_data, Code, LogEntry, VmError};
use crate::common::{checked_as_u64, Addr, Bytes, Gas, Wei, U256};
use crate::state::SnapshotId;

/// What to do with a frame's result once it halts. The top frame belongs to
/// the transaction executor (which owns the outermost snapshot); inner
/// frames carry the snapshot they must unwind on failure.
pub(super) enum FrameKind {
    Top,
    Call {
        snapshot: SnapshotId,
        ret_off: U256,
        ret_len: U256,
    },
    Create {
        snapshot: SnapshotId,
        contract: Addr,
    },
}

pub(super) struct CallFrame {
    pub pc: u64,
    pub memory: Memory,
    pub stack: Stack,
    pub code: Rc<dyn Code>,
    /// address of the executing contract
    pub callee: Addr,
    /// address of the caller
    pub caller: Addr,
    pub kind: FrameKind,
    pub input: Box<[u8]>,
    pub value: Wei,
    pub last_returned: Bytes,
    pub gas_left: Gas,
    pub read_only: bool,
    pub logs: Vec<LogEntry>,
}

macro_rules! make_unary_op {
    ($name: ident, $gas: expr) => {
        #[inline(always)]
        pub fn $name(&mut self) -> Result<(), VmError> {
            let a = self.stack.pop()?;
            self.stack.push(alu::$name(a))?;
            self.use_gas($gas)
        }
    };
}

macro_rules! make_binary_op {
    ($name: ident, $gas: expr) => {
        #[inline(always)]
        pub fn $name(&mut self) -> Result<(), VmError> {
            let (a, b) = self.stack.pop2()?;
            self.stack.push(alu::$name(a, b))?;
            self.use_gas($gas)
        }
    };
}

macro_rules! make_ternary_op {
    ($name: ident, $gas: expr) => {
        #[inline(always)]
        pub fn $name(&mut self) -> Result<(), VmError> {
            let (a, b, c) = self.stack.pop3()?;
            self.stack.push(alu::$name(a, b, c))?;
            self.use_gas($gas)
        }
    };
}

impl CallFrame {
    #[inline]
    pub fn new(
        code: Rc<dyn Code>, input: Box<[u8]>, value: Wei, callee: Addr,
        caller: Addr, kind: FrameKind, gas: Gas, read_only: bool,
    ) -> Self {
        Self {
            pc: 0x0,
            memory: Memory::new(),
            stack: Stack::new(),
            code,
            callee,
            caller,
            kind,
            input,
            value,
            last_returned: Bytes::empty(),
            gas_left: gas,
            read_only,
            logs: Vec::new(),
        }
    }

    make_binary_op!(add, GAS_FASTEST);
    make_binary_op!(mul, GAS_FAST);
    make_binary_op!(sub, GAS_FASTEST);
    make_binary_op!(div, GAS_FAST);
    make_binary_op!(sdiv, GAS_FAST);
    make_binary_op!(rem, GAS_FAST);
    make_binary_op!(smod, GAS_FAST);
    make_ternary_op!(add_mod, GAS_MID);
    make_ternary_op!(mul_mod, GAS_MID);

    #[inline(always)]
    pub fn exp(&mut self) -> Result<(), VmError> {
        let (a, b) = self.stack.pop2()?;
        self.stack.push(alu::exp(a, b))?;
        self.use_gas(gas_checked_mul(
            GAS_EXP_BYTE,
            (b.bits() as u64 + 7) >> 3,
        )?)
    }

    make_binary_op!(sign_extend, GAS_FAST);
    make_binary_op!(lt, GAS_FASTEST);
    make_binary_op!(gt, GAS_FASTEST);
    make_binary_op!(slt, GAS_FASTEST);
    make_binary_op!(sgt, GAS_FASTEST);
    make_binary_op!(eq, GAS_FASTEST);
    make_unary_op!(is_zero, GAS_FASTEST);
    make_binary_op!(and, GAS_FASTEST);
    make_binary_op!(or, GAS_FASTEST);
    make_binary_op!(xor, GAS_FASTEST);
    make_unary_op!(not, GAS_FASTEST);
    make_binary_op!(byte, GAS_FASTEST);
    make_binary_op!(shl, GAS_FASTEST);
    make_binary_op!(shr, GAS_FASTEST);
    make_binary_op!(sar, GAS_FASTEST);

    #[inline(always)]
    pub fn sha3(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_SHA3)?;
        let (off, len) = self.stack.pop2()?;
        let (data, gas) = self.memory.slice(off, len)?;
        // the VM is big-endian
        self.stack
            .push(U256::from_big_endian(&sha3::Keccak256::digest(data)))?;
        self.use_gas(gas_checked_mul(
            Memory::to_word_size(len.low_u64()),
            GAS_SHA3_WORD,
        )?)?;
        self.use_gas(gas)
    }

    #[inline(always)]
    pub fn addr(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.callee.clone().into())
    }

    #[inline(always)]
    pub fn caller(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.caller.clone().into())
    }

    #[inline(always)]
    pub fn call_value(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.value.clone().into())
    }

    #[inline(always)]
    pub fn call_data_load(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_FASTEST)?;
        let data = if let Some(off) = checked_as_u64(&self.stack.pop()?) {
            U256::from_big_endian(&get_data(&self.input, off, 32))
        } else {
            U256::zero()
        };
        self.stack.push(data)
    }

    #[inline(always)]
    pub fn call_data_size(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.input.len().into())
    }

    #[inline(always)]
    pub fn call_data_copy(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_FASTEST)?;
        let (mem_off, data_off, len) = self.stack.pop3()?;
        let (mem, gas) = self.memory.slice_mut(mem_off, len)?;
        let len = len.low_u64();
        let data_off = checked_as_u64(&data_off).unwrap_or(u64::MAX);
        mem.copy_from_slice(&get_data(&self.input, data_off, len));
        self.use_gas(gas)?;
        self.use_gas(gas_checked_mul(Memory::to_word_size(len), GAS_COPY_WORD)?)
    }

    #[inline(always)]
    pub fn code_size(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.code.as_bytes().len().into())
    }

    #[inline(always)]
    pub fn code_copy(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_FASTEST)?;
        let (mem_off, code_off, len) = self.stack.pop3()?;
        let (mem, gas) = self.memory.slice_mut(mem_off, len)?;
        let len = len.low_u64();
        let code_off = checked_as_u64(&code_off).unwrap_or(u64::MAX);
        mem.copy_from_slice(&get_data(self.code.as_bytes(), code_off, len));
        self.use_gas(gas_checked_mul(
            Memory::to_word_size(len),
            GAS_COPY_WORD,
        )?)?;
        self.use_gas(gas)
    }

    #[inline(always)]
    pub fn return_data_size(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.last_returned.len().into())
    }

    #[inline(always)]
    pub fn return_data_copy(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_FASTEST)?;
        let (mem_off, data_off, len) = self.stack.pop3()?;
        // unlike calldata, reading past the return buffer is an error, not
        // zero padding
        let end = checked_as_u64(&data_off.overflowing_add(len).0)
            .ok_or(VmError::ReturnDataOutOfBounds)?;
        if end as usize > self.last_returned.len() {
            return Err(VmError::ReturnDataOutOfBounds)
        }
        let data_off =
            checked_as_u64(&data_off).ok_or(VmError::ReturnDataOutOfBounds)?;
        let (mem, gas) = self.memory.slice_mut(mem_off, len)?;
        mem.copy_from_slice(
            &self.last_returned[data_off as usize..end as usize],
        );
        self.use_gas(gas)?;
        self.use_gas(gas_checked_mul(
            Memory::to_word_size(len.low_u64()),
            GAS_COPY_WORD,
        )?)
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.pop().map(|_| ())
    }

    #[inline(always)]
    pub fn mload(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_FASTEST)?;
        let off = self.stack.pop()?;
        let (mem, gas) = self.memory.slice(off, 32.into())?;
        self.stack.push(U256::from_big_endian(mem))?;
        self.use_gas(gas)
    }

    #[inline(always)]
    pub fn mstore(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_FASTEST)?;
        let (off, val) = self.stack.pop2()?;
        let (mem, gas) = self.memory.slice_mut(off, 32.into())?;
        val.to_big_endian(mem);
        self.use_gas(gas)
    }

    #[inline(always)]
    pub fn mstore8(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_FASTEST)?;
        let (off, val) = self.stack.pop2()?;
        let (mem, gas) = self.memory.slice_mut(off, U256::one())?;
        mem[0] = val.low_u64() as u8;
        self.use_gas(gas)
    }

    #[inline(always)]
    pub fn pc(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.pc.into())
    }

    #[inline(always)]
    pub fn msize(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.memory.len().into())
    }

    #[inline(always)]
    pub fn gas(&mut self) -> Result<(), VmError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.gas_left.into())
    }

    #[inline(always)]
    pub fn push(&mut self, data: &[u8]) -> Result<(), VmError> {
        self.use_gas(GAS_FASTEST)?;
        // right-aligned, big endian
        let mut b = [0u8; 32];
        b[32 - data.len()..].copy_from_slice(data);
        self.stack.push(U256::from_big_endian(&b))
    }

    #[inline(always)]
    pub fn dup(&mut self, pos: usize) -> Result<(), VmError> {
        self.use_gas(GAS_FASTEST)?;
        self.stack.dup(pos)
    }

    #[inline(always)]
    pub fn swap(&mut self, pos: usize) -> Result<(), VmError> {
        self.use_gas(GAS_FASTEST)?;
        self.stack.swap(pos)
    }

    #[inline(always)]
    pub fn use_gas(&mut self, gas: Gas) -> Result<(), VmError> {
        if self.gas_left < gas {
            debug!("out of gas: {} < {}", self.gas_left, gas);
            return Err(VmError::OutOfGas)
        }
        self.gas_left -= gas;
        Ok(())
    }
}
