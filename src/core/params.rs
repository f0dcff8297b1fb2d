use crate::common::Gas;

pub const MAX_CALL_DEPTH: usize = 1024;
pub const MAX_STACK_DEPTH: usize = 1024;
pub const MAX_CODE_SIZE: usize = 24576;
pub const MAX_MEM_SIZE: usize = 0x1fffffffe0;

// gas consumption parameters (single flat schedule, no fork switching)
pub const GAS_QUICK: Gas = 2;
pub const GAS_FASTEST: Gas = 3;
pub const GAS_FAST: Gas = 5;
pub const GAS_MID: Gas = 8;
pub const GAS_SLOW: Gas = 10;
pub const GAS_EXT: Gas = 20;
pub const GAS_BALANCE: Gas = 20;
pub const GAS_SHA3: Gas = 30;
pub const GAS_SHA3_WORD: Gas = 6;
pub const GAS_COPY_WORD: Gas = 3;
pub const GAS_EXP_BYTE: Gas = 10;
pub const GAS_LOG: Gas = 375;
pub const GAS_LOG_TOPIC: Gas = 375;
pub const GAS_LOG_DATA: Gas = 8;
pub const GAS_SLOAD: Gas = 50;
pub const GAS_SSTORE: Gas = 5000;
pub const GAS_JUMPDEST: Gas = 1;
pub const GAS_CREATE: Gas = 32000;
pub const GAS_CREATE_DATA: Gas = 200;
pub const GAS_CALL: Gas = 40;
pub const GAS_CALL_STIPEND: Gas = 2300;
pub const GAS_CALL_VALUE_TRANS: Gas = 9000;
pub const GAS_MEM_RESIZE_WORD: Gas = 3;
pub const QUAD_COEF_DIV: Gas = 512;
pub const GAS_TX: Gas = 21000;
