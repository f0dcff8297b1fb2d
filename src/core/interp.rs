//! The interpreter drives call frames without recursion: the frame being
//! executed sits in `cur`, suspended parents live on an explicit stack, and
//! a halting instruction pops the frame and settles its result into the
//! parent according to the frame's [FrameKind]. Each inner frame owns one
//! world-state snapshot which it commits on success and reverts on failure;
//! the top frame's snapshot belongs to the transaction executor.

use std::rc::Rc;

use log::debug;
use num_traits::FromPrimitive;

use super::frame::{CallFrame, FrameKind};
use super::params::*;
use super::{
    gas_checked_mul, Code, Env, LogEntry, Opcode, PlainCode, VmError,
};
use crate::common::{
    checked_as_u64, create_addr, Addr, Bytes, Gas, Wei, U256,
};
use crate::state::{SnapshotId, WorldState};

/// The settled result of one top-level VM run.
pub struct VmOutcome {
    pub data: Bytes,
    pub gas_left: Gas,
    pub logs: Vec<LogEntry>,
    pub error: Option<VmError>,
}

impl VmOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// The decoded instruction.
struct Inst<'a> {
    opcode: Opcode,
    /// data pushed by a PUSH* instruction, None otherwise
    data: Option<&'a [u8]>,
    /// position used by DUP* and SWAP*, ignored otherwise
    pos: usize,
}

enum Status {
    Running,
    Finished(VmOutcome),
}

pub struct Interpreter<'a> {
    state: &'a mut WorldState,
    env: &'a Env,
    call_stack: Vec<Box<CallFrame>>,
    /// Frame being executed, not included in `call_stack`.
    cur: Box<CallFrame>,
    status: Status,
}

impl<'a> Interpreter<'a> {
    fn new(state: &'a mut WorldState, env: &'a Env) -> Self {
        // placeholder frame; swapped out as soon as the real top frame is
        // pushed
        let dummy = Box::new(CallFrame::new(
            Rc::new(PlainCode::new(Vec::new().into())),
            Vec::new().into(),
            Wei::zero().clone(),
            Addr::zero().clone(),
            Addr::zero().clone(),
            FrameKind::Top,
            0,
            false,
        ));
        Self {
            state,
            env,
            call_stack: Vec::new(),
            cur: dummy,
            status: Status::Running,
        }
    }

    /// Runs `callee`'s stored code. The caller (the transaction executor)
    /// has already performed the value transfer and holds the outer
    /// snapshot; empty code short-circuits to success with no gas charged.
    pub fn run_call(
        state: &'a mut WorldState, env: &'a Env, caller: Addr, callee: Addr,
        value: Wei, input: Box<[u8]>, gas: Gas,
    ) -> VmOutcome {
        let code = state.get_code(&callee);
        if code.as_bytes().is_empty() {
            return VmOutcome {
                data: Bytes::empty(),
                gas_left: gas,
                logs: Vec::new(),
                error: None,
            }
        }
        let mut it = Self::new(state, env);
        it.frame_push(code, input, value, callee, caller, FrameKind::Top, gas, false);
        it.exec()
    }

    /// Runs init code in the context of the new `contract` account. On
    /// success the outcome's data is the runtime code; installing it (and
    /// charging the deposit) is the executor's job.
    pub fn run_create(
        state: &'a mut WorldState, env: &'a Env, creator: Addr,
        contract: Addr, init_code: Box<[u8]>, value: Wei, gas: Gas,
    ) -> VmOutcome {
        let code: Rc<dyn Code> = Rc::new(PlainCode::new(init_code));
        let mut it = Self::new(state, env);
        it.frame_push(
            code,
            Vec::new().into(),
            value,
            contract,
            creator,
            FrameKind::Top,
            gas,
            false,
        );
        it.exec()
    }

    // frame bookkeeping

    #[inline(always)]
    fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    #[inline(always)]
    #[allow(clippy::too_many_arguments)]
    fn frame_push(
        &mut self, code: Rc<dyn Code>, input: Box<[u8]>, value: Wei,
        callee: Addr, caller: Addr, kind: FrameKind, gas: Gas,
        read_only: bool,
    ) {
        let mut old = Box::new(CallFrame::new(
            code,
            input,
            value,
            callee,
            caller,
            kind,
            gas,
            // child frames inherit the parent's write protection
            self.cur.read_only || read_only,
        ));
        std::mem::swap(&mut self.cur, &mut old);
        self.call_stack.push(old);
    }

    #[inline(always)]
    fn frame_pop(&mut self) -> Box<CallFrame> {
        let mut frame = self.call_stack.pop().expect("frame stack underflow");
        std::mem::swap(&mut self.cur, &mut frame);
        frame
    }

    /// Pops the current frame and settles `data`/`err` into its parent (or
    /// into the final outcome for the top frame). An `Err` return means the
    /// parent itself failed while accepting the result and must unwind too.
    fn finish_frame(
        &mut self, data: Bytes, err: Option<VmError>,
    ) -> Result<(), VmError> {
        let frame = self.frame_pop();
        match frame.kind {
            FrameKind::Top => {
                let (gas_left, logs) = match err {
                    None => (frame.gas_left, frame.logs),
                    // REVERT leaves the unused gas with the caller
                    Some(VmError::Reverted) => (frame.gas_left, Vec::new()),
                    Some(_) => (0, Vec::new()),
                };
                self.status = Status::Finished(VmOutcome {
                    data,
                    gas_left,
                    logs,
                    error: err,
                });
                Ok(())
            }
            FrameKind::Call {
                snapshot,
                ret_off,
                ret_len,
            } => self.call_end(
                snapshot, ret_off, ret_len, data, frame.gas_left, frame.logs,
                err,
            ),
            FrameKind::Create { snapshot, contract } => self.create_end(
                snapshot, contract, data, frame.gas_left, frame.logs, err,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn call_end(
        &mut self, snapshot: SnapshotId, ret_off: U256, ret_len: U256,
        data: Bytes, gas_left: Gas, logs: Vec<LogEntry>,
        err: Option<VmError>,
    ) -> Result<(), VmError> {
        match err {
            None => self
                .state
                .commit(snapshot)
                .expect("call snapshot misaligned"),
            Some(_) => self
                .state
                .revert(snapshot)
                .expect("call snapshot misaligned"),
        }
        debug!("call frame settled: {:?}", err);
        let gas_back = match err {
            None | Some(VmError::Reverted) => gas_left,
            _ => 0,
        };
        let parent = &mut self.cur;
        if let None | Some(VmError::Reverted) = err {
            parent.memory.set(ret_off, ret_len, &data)?;
        }
        parent.gas_left += gas_back;
        parent.stack.push(match err {
            Some(_) => U256::zero(),
            None => U256::one(),
        })?;
        parent.last_returned = data;
        if err.is_none() {
            parent.logs.extend(logs)
        }
        Ok(())
    }

    fn create_end(
        &mut self, snapshot: SnapshotId, contract: Addr, data: Bytes,
        mut gas_left: Gas, logs: Vec<LogEntry>, err: Option<VmError>,
    ) -> Result<(), VmError> {
        let mut ret = err;
        if ret.is_none() {
            if data.len() > MAX_CODE_SIZE {
                ret = Some(VmError::MaxCodeSizeExceeded)
            } else {
                let deposit =
                    gas_checked_mul(data.len() as Gas, GAS_CREATE_DATA)?;
                if gas_left < deposit {
                    ret = Some(VmError::OutOfGas)
                } else {
                    gas_left -= deposit;
                    self.state.set_code(&contract, &data);
                }
            }
        }
        match ret {
            None => self
                .state
                .commit(snapshot)
                .expect("create snapshot misaligned"),
            Some(_) => self
                .state
                .revert(snapshot)
                .expect("create snapshot misaligned"),
        }
        let gas_back = match ret {
            None | Some(VmError::Reverted) => gas_left,
            _ => 0,
        };
        let parent = &mut self.cur;
        parent.gas_left += gas_back;
        parent.stack.push(match ret {
            Some(_) => U256::zero(),
            None => contract.into(),
        })?;
        parent.last_returned = if let Some(VmError::Reverted) = ret {
            data
        } else {
            Bytes::empty()
        };
        if ret.is_none() {
            parent.logs.extend(logs)
        }
        Ok(())
    }

    // instructions that need the environment or the world state

    #[inline(always)]
    fn origin(&mut self) -> Result<(), VmError> {
        self.cur.use_gas(GAS_QUICK)?;
        self.cur.stack.push(self.env.origin.clone().into())
    }

    #[inline(always)]
    fn gas_price(&mut self) -> Result<(), VmError> {
        self.cur.use_gas(GAS_QUICK)?;
        self.cur.stack.push(self.env.gas_price.clone().into())
    }

    #[inline(always)]
    fn coinbase(&mut self) -> Result<(), VmError> {
        self.cur.use_gas(GAS_QUICK)?;
        self.cur.stack.push(self.env.block.coinbase.clone().into())
    }

    #[inline(always)]
    fn timestamp(&mut self) -> Result<(), VmError> {
        self.cur.use_gas(GAS_QUICK)?;
        self.cur.stack.push(self.env.block.timestamp.into())
    }

    #[inline(always)]
    fn number(&mut self) -> Result<(), VmError> {
        self.cur.use_gas(GAS_QUICK)?;
        self.cur.stack.push(self.env.block.number.into())
    }

    #[inline(always)]
    fn gas_limit(&mut self) -> Result<(), VmError> {
        self.cur.use_gas(GAS_QUICK)?;
        self.cur.stack.push(self.env.block.gas_limit.into())
    }

    #[inline(always)]
    fn chain_id(&mut self) -> Result<(), VmError> {
        self.cur.use_gas(GAS_QUICK)?;
        self.cur.stack.push(self.env.chain_id.into())
    }

    #[inline(always)]
    fn balance(&mut self) -> Result<(), VmError> {
        self.cur.use_gas(GAS_BALANCE)?;
        let addr: Addr = self.cur.stack.pop()?.into();
        let balance = self.state.get_balance(&addr);
        self.cur.stack.push(balance.into())
    }

    #[inline(always)]
    fn self_balance(&mut self) -> Result<(), VmError> {
        self.cur.use_gas(GAS_FAST)?;
        let balance = self.state.get_balance(&self.cur.callee);
        self.cur.stack.push(balance.into())
    }

    #[inline(always)]
    fn sload(&mut self) -> Result<(), VmError> {
        self.cur.use_gas(GAS_SLOAD)?;
        let key = self.cur.stack.pop()?.into();
        let val = self.state.get_storage(&self.cur.callee, &key);
        self.cur.stack.push(val)
    }

    #[inline(always)]
    fn sstore(&mut self) -> Result<(), VmError> {
        if self.cur.read_only {
            return Err(VmError::WriteProtection)
        }
        self.cur.use_gas(GAS_SSTORE)?;
        let (key, val) = self.cur.stack.pop2()?;
        let callee = self.cur.callee.clone();
        self.state.set_storage(&callee, &key.into(), &val);
        Ok(())
    }

    #[inline(always)]
    fn jump(&mut self) -> Result<(), VmError> {
        let call = &mut self.cur;
        call.use_gas(GAS_MID)?;
        let dest = call.stack.pop()?;
        if !call.code.is_valid_jumpdest(&dest) {
            return Err(VmError::InvalidJump)
        }
        // pc is bumped at the end of every loop iteration
        call.pc = dest.as_u64().wrapping_sub(1);
        Ok(())
    }

    #[inline(always)]
    fn jumpi(&mut self) -> Result<(), VmError> {
        let call = &mut self.cur;
        call.use_gas(GAS_SLOW)?;
        let (dest, cond) = call.stack.pop2()?;
        if !cond.is_zero() {
            if !call.code.is_valid_jumpdest(&dest) {
                return Err(VmError::InvalidJump)
            }
            call.pc = dest.as_u64().wrapping_sub(1);
        }
        Ok(())
    }

    #[inline(always)]
    fn log(&mut self, num: usize) -> Result<(), VmError> {
        let call = &mut self.cur;
        if call.read_only {
            return Err(VmError::WriteProtection)
        }
        call.use_gas(GAS_LOG)?;
        call.use_gas(gas_checked_mul(num as Gas, GAS_LOG_TOPIC)?)?;
        let (off, len) = call.stack.pop2()?;
        call.use_gas(gas_checked_mul(
            checked_as_u64(&len).ok_or(VmError::OutOfMemory)?,
            GAS_LOG_DATA,
        )?)?;
        let mut topics = Vec::new();
        for _ in 0..num {
            topics.push(call.stack.pop()?.into());
        }
        let (mem, mem_gas) = call.memory.slice(off, len)?;
        let entry = LogEntry {
            address: call.callee.clone(),
            topics,
            data: mem.into(),
        };
        call.logs.push(entry);
        call.use_gas(mem_gas)
    }

    /// All-but-one-64th retention: a frame may hand at most 63/64 of its
    /// remaining gas to a child.
    #[inline(always)]
    fn gas_quota(&mut self, requested: &U256) -> Result<Gas, VmError> {
        let avail = self.cur.gas_left - self.cur.gas_left / 64;
        Ok(match checked_as_u64(requested) {
            Some(r) if r < avail => r,
            _ => avail,
        })
    }

    #[inline(always)]
    fn call_begin(&mut self, read_only: bool) -> Result<(), VmError> {
        self.cur.use_gas(GAS_CALL)?;
        let call = &mut self.cur;
        let (gas, addr, val) = if read_only {
            let (gas, addr) = call.stack.pop2()?;
            (gas, addr, U256::zero())
        } else {
            call.stack.pop3()?
        };
        let (in_off, in_len) = call.stack.pop2()?;
        let (ret_off, ret_len) = call.stack.pop2()?;
        let (input, mem_gas) = call.memory.slice(in_off, in_len)?;
        let input: Box<[u8]> = input.to_vec().into();
        if call.read_only && !val.is_zero() {
            return Err(VmError::WriteProtection)
        }
        if !val.is_zero() {
            call.use_gas(GAS_CALL_VALUE_TRANS)?;
        }
        call.use_gas(mem_gas)?;
        let mut quota = self.gas_quota(&gas)?;
        self.cur.use_gas(quota)?;
        if !val.is_zero() {
            quota += GAS_CALL_STIPEND
        }

        let callee: Addr = addr.into();
        let caller = self.cur.callee.clone();
        let value: Wei = val.into();
        let snapshot = self.state.snapshot();
        self.enter_call(
            callee,
            caller,
            input,
            quota,
            value,
            FrameKind::Call {
                snapshot,
                ret_off,
                ret_len,
            },
            read_only,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn enter_call(
        &mut self, callee: Addr, caller: Addr, input: Box<[u8]>, gas: Gas,
        value: Wei, kind: FrameKind, read_only: bool,
    ) -> Result<(), VmError> {
        if self.call_depth() == MAX_CALL_DEPTH {
            return Err(VmError::Depth)
        }
        if self.state.get_balance(&caller) < value {
            return Err(VmError::InsufficientBalance)
        }
        self.state
            .transfer_balance(&caller, &callee, &value)
            .map_err(|_| VmError::InsufficientBalance)?;
        let code = self.state.get_code(&callee);
        if code.as_bytes().is_empty() {
            // nothing to run; settle the call in place
            match kind {
                FrameKind::Call {
                    snapshot,
                    ret_off,
                    ret_len,
                } => {
                    self.call_end(
                        snapshot,
                        ret_off,
                        ret_len,
                        Bytes::empty(),
                        gas,
                        Vec::new(),
                        None,
                    )?;
                    // no frame was entered, so bump pc here
                    self.advance_pc(0, false);
                }
                _ => unreachable!(),
            }
            return Ok(())
        }
        self.frame_push(code, input, value, callee, caller, kind, gas, read_only);
        Ok(())
    }

    #[inline(always)]
    fn create_begin(&mut self) -> Result<(), VmError> {
        self.cur.use_gas(GAS_CREATE)?;
        if self.cur.read_only {
            return Err(VmError::WriteProtection)
        }
        if self.call_depth() == MAX_CALL_DEPTH {
            return Err(VmError::Depth)
        }

        let call = &mut self.cur;
        let (value, off, len) = call.stack.pop3()?;
        let (input, mem_gas) = call.memory.slice(off, len)?;
        let code = input.to_vec().into_boxed_slice();
        call.use_gas(mem_gas)?;

        // hand over everything but one 64th
        let mut quota = call.gas_left;
        quota -= quota / 64;
        call.use_gas(quota)?;

        let caller = call.callee.clone();
        let value: Wei = value.into();

        if self.state.get_balance(&caller) < value {
            return Err(VmError::InsufficientBalance)
        }
        let nonce = self.state.get_nonce(&caller);
        let contract = create_addr(&caller, nonce);
        let snapshot = self.state.snapshot();
        self.state.increment_nonce(&caller);
        if self.state.get_nonce(&contract) != 0
            || !self.state.get_code(&contract).as_bytes().is_empty()
        {
            return Err(VmError::ContractCollision)
        }
        self.state.set_nonce(&contract, 1);
        self.state
            .transfer_balance(&caller, &contract, &value)
            .map_err(|_| VmError::InsufficientBalance)?;

        let code: Rc<dyn Code> = Rc::new(PlainCode::new(code));
        self.frame_push(
            code,
            Vec::new().into(),
            value,
            contract.clone(),
            caller,
            FrameKind::Create { snapshot, contract },
            quota,
            false,
        );
        Ok(())
    }

    #[inline(always)]
    fn return_(&mut self) -> Result<(), VmError> {
        let call = &mut self.cur;
        let (off, len) = call.stack.pop2()?;
        let (retval, mem_gas) = call.memory.slice(off, len)?;
        let retval: Bytes = retval.into();
        call.use_gas(mem_gas)?;
        self.finish_frame(retval, None)
    }

    #[inline(always)]
    fn revert(&mut self) -> Result<(), VmError> {
        let call = &mut self.cur;
        let (off, len) = call.stack.pop2()?;
        let (retval, mem_gas) = call.memory.slice(off, len)?;
        let retval: Bytes = retval.into();
        call.use_gas(mem_gas)?;
        self.finish_frame(retval, Some(VmError::Reverted))
    }

    #[inline(always)]
    fn advance_pc(&mut self, skip: u64, enter_call: bool) {
        if !enter_call {
            self.cur.pc = self.cur.pc.wrapping_add(skip + 1)
        }
    }

    fn exec(mut self) -> VmOutcome {
        use Opcode::*;
        while let Status::Running = self.status {
            let code_rc = self.cur.code.clone();
            let code = code_rc.as_bytes();
            let pc = self.cur.pc as usize;
            let raw_opcode = code.get(pc).copied().unwrap_or(Stop as u8);
            let inst = match raw_opcode {
                // PUSH* family (32)
                c @ (0x60..=0x7f) => {
                    let n = (c - 0x60 + 1) as usize;
                    let base = pc + 1;
                    match code.get(base..base + n) {
                        Some(data) => Inst {
                            opcode: Push,
                            data: Some(data),
                            pos: 0,
                        },
                        // immediate truncated by the end of code
                        None => Inst {
                            opcode: Invalid,
                            data: None,
                            pos: 0,
                        },
                    }
                }
                // DUP* family (16)
                c @ (0x80..=0x8f) => Inst {
                    opcode: Dup,
                    data: None,
                    pos: (c - 0x80 + 1) as usize,
                },
                // SWAP* family (16)
                c @ (0x90..=0x9f) => Inst {
                    opcode: Swap,
                    data: None,
                    pos: (c - 0x90 + 1) as usize,
                },
                _ => match FromPrimitive::from_u8(raw_opcode) {
                    Some(opcode) => Inst {
                        opcode,
                        data: None,
                        pos: 0,
                    },
                    None => Inst {
                        opcode: Invalid,
                        data: None,
                        pos: 0,
                    },
                },
            };
            let call = &mut self.cur;
            let mut enter_call = false;
            let mut succ = match inst.opcode {
                Stop => self.finish_frame(Bytes::empty(), None),
                Add => call.add(),
                Mul => call.mul(),
                Sub => call.sub(),
                Div => call.div(),
                SDiv => call.sdiv(),
                Mod => call.rem(),
                SMod => call.smod(),
                AddMod => call.add_mod(),
                MulMod => call.mul_mod(),
                Exp => call.exp(),
                SignExtend => call.sign_extend(),
                Lt => call.lt(),
                Gt => call.gt(),
                Slt => call.slt(),
                Sgt => call.sgt(),
                Eql => call.eq(),
                IsZero => call.is_zero(),
                And => call.and(),
                Or => call.or(),
                Xor => call.xor(),
                Not => call.not(),
                Byte => call.byte(),
                Shl => call.shl(),
                Shr => call.shr(),
                Sar => call.sar(),
                Sha3 => call.sha3(),
                Addr => call.addr(),
                Balance => self.balance(),
                Origin => self.origin(),
                Caller => call.caller(),
                CallValue => call.call_value(),
                CallDataLoad => call.call_data_load(),
                CallDataSize => call.call_data_size(),
                CallDataCopy => call.call_data_copy(),
                CodeSize => call.code_size(),
                CodeCopy => call.code_copy(),
                GasPrice => self.gas_price(),
                ReturnDataSize => call.return_data_size(),
                ReturnDataCopy => call.return_data_copy(),
                Coinbase => self.coinbase(),
                Timestamp => self.timestamp(),
                Number => self.number(),
                GasLimit => self.gas_limit(),
                ChainId => self.chain_id(),
                SelfBalance => self.self_balance(),
                Pop => call.pop(),
                MLoad => call.mload(),
                MStore => call.mstore(),
                MStore8 => call.mstore8(),
                SLoad => self.sload(),
                SStore => self.sstore(),
                Jump => self.jump(),
                JumpI => self.jumpi(),
                PC => call.pc(),
                MSize => call.msize(),
                Gas => call.gas(),
                JumpDest => call.use_gas(GAS_JUMPDEST),
                Log0 => self.log(0),
                Log1 => self.log(1),
                Log2 => self.log(2),
                Log3 => self.log(3),
                Log4 => self.log(4),
                Push => call.push(inst.data.unwrap()),
                Dup => call.dup(inst.pos),
                Swap => call.swap(inst.pos),
                Create => {
                    enter_call = true;
                    self.create_begin()
                }
                Call => {
                    enter_call = true;
                    self.call_begin(false)
                }
                StaticCall => {
                    enter_call = true;
                    self.call_begin(true)
                }
                Return => self.return_(),
                Revert => self.revert(),
                _ => Err(VmError::InvalidOpcode),
            };
            // a failing frame unwinds into its parent, which may fail in
            // turn while accepting the result
            let mut skip = match &inst.data {
                Some(d) => d.len() as u64,
                None => 0,
            };
            if succ.is_err() {
                // whatever op failed, the frame that ends up current is a
                // parent sitting on its one-byte call op (or the finished
                // top); it must step past it, not past the failed op
                enter_call = false;
                skip = 0;
            }
            while let Err(err) = succ {
                succ = self.finish_frame(Bytes::empty(), Some(err));
            }
            self.advance_pc(skip, enter_call);
        }
        match self.status {
            Status::Finished(res) => res,
            _ => unreachable!(),
        }
    }
}
