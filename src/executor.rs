//! The transaction executor: validates a transaction against the current
//! world state, charges gas, drives the VM for the call or creation, refunds
//! what was not used and settles the snapshot.
//!
//! Failures split into two classes. Validation failures ([ExecError]) leave
//! the world untouched and mean the transaction cannot be included at all.
//! Execution failures (a revert, out-of-gas, a creation collision) are
//! normal block citizens: the snapshot is rolled back but the sender still
//! pays for the gas that burned, and the nonce still advances.

use log::debug;

use crate::common::{create_addr, Addr, Bytes, Gas, Wei};
use crate::core::params::{GAS_CREATE_DATA, GAS_TX, MAX_CODE_SIZE};
use crate::core::{Code, Env, Interpreter, LogEntry, VmError, VmOutcome};
use crate::state::WorldState;
use crate::tx::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    MissingSender,
    InvalidNonce { expected: u64, got: u64 },
    InsufficientBalance,
    GasLimitTooLow,
}

/// The settled effect of one included transaction; the block processor
/// wraps this into a [crate::block::Receipt].
#[derive(Debug, PartialEq, Eq)]
pub struct ExecOutcome {
    /// 1 on success, 0 on a failed but included execution.
    pub status: u8,
    pub gas_used: Gas,
    pub return_data: Bytes,
    /// Address of the deployed contract, successful creations only.
    pub contract_address: Option<Addr>,
    pub logs: Vec<LogEntry>,
    pub error: Option<VmError>,
}

/// Runs `tx` against `state`. `Err` means pre-state validation failed and
/// nothing changed; `Ok` means the state transition happened (successfully
/// or not) and exactly one nonce increment plus the gas charge stuck.
pub fn execute(
    state: &mut WorldState, env: &Env, tx: &Transaction,
) -> Result<ExecOutcome, ExecError> {
    let sender = tx.from.as_ref().ok_or(ExecError::MissingSender)?.clone();
    let expected = state.get_nonce(&sender);
    if tx.nonce != expected {
        return Err(ExecError::InvalidNonce {
            expected,
            got: tx.nonce,
        })
    }
    if tx.gas_limit < GAS_TX {
        return Err(ExecError::GasLimitTooLow)
    }
    let cost = tx.max_cost().ok_or(ExecError::InsufficientBalance)?;
    if state.get_balance(&sender) < cost {
        return Err(ExecError::InsufficientBalance)
    }

    // validation passed; from here on the sender pays
    let gas_fee = tx
        .gas_price
        .checked_mul(&Wei::from(tx.gas_limit))
        .expect("cost bounded by max_cost");
    let snap = state.snapshot();
    state
        .sub_balance(&sender, &gas_fee)
        .expect("balance validated");
    state.increment_nonce(&sender);

    let gas_budget = tx.gas_limit - GAS_TX;
    let mut contract_address = None;
    let outcome = match &tx.to {
        Some(to) => {
            state
                .transfer_balance(&sender, to, &tx.value)
                .expect("balance validated");
            Interpreter::run_call(
                state,
                env,
                sender.clone(),
                to.clone(),
                tx.value.clone(),
                tx.data.to_vec().into(),
                gas_budget,
            )
        }
        None => {
            let contract = create_addr(&sender, expected);
            if state.get_nonce(&contract) != 0
                || !state.get_code(&contract).as_bytes().is_empty()
            {
                debug!("contract address collision at {}", contract);
                VmOutcome {
                    data: Bytes::empty(),
                    gas_left: 0,
                    logs: Vec::new(),
                    error: Some(VmError::ContractCollision),
                }
            } else {
                state.set_nonce(&contract, 1);
                state
                    .transfer_balance(&sender, &contract, &tx.value)
                    .expect("balance validated");
                let mut out = Interpreter::run_create(
                    state,
                    env,
                    sender.clone(),
                    contract.clone(),
                    tx.data.to_vec().into(),
                    tx.value.clone(),
                    gas_budget,
                );
                // the returned data becomes the runtime code, paid by the
                // code deposit charge
                if out.error.is_none() {
                    let deposit = out.data.len() as Gas * GAS_CREATE_DATA;
                    if out.data.len() > MAX_CODE_SIZE {
                        out.error = Some(VmError::MaxCodeSizeExceeded);
                        out.gas_left = 0;
                    } else if out.gas_left < deposit {
                        out.error = Some(VmError::OutOfGas);
                        out.gas_left = 0;
                    } else {
                        out.gas_left -= deposit;
                        state.set_code(&contract, &out.data);
                        contract_address = Some(contract);
                    }
                }
                out
            }
        }
    };

    let gas_used = GAS_TX + (gas_budget - outcome.gas_left);
    let refund = tx
        .gas_price
        .checked_mul(&Wei::from(tx.gas_limit - gas_used))
        .expect("bounded by gas_fee");
    match outcome.error {
        None => {
            state
                .add_balance(&sender, &refund)
                .expect("refund bounded by prior debit");
            state.commit(snap).expect("executor snapshot misaligned");
            Ok(ExecOutcome {
                status: 1,
                gas_used,
                return_data: outcome.data,
                contract_address,
                logs: outcome.logs,
                error: None,
            })
        }
        Some(err) => {
            // unwind everything, then re-apply the two effects that must
            // survive: the gas charge and the nonce increment
            state.revert(snap).expect("executor snapshot misaligned");
            state
                .sub_balance(&sender, &gas_fee)
                .expect("balance validated");
            state.increment_nonce(&sender);
            state
                .add_balance(&sender, &refund)
                .expect("refund bounded by prior debit");
            debug!("tx {} failed: {:?}", tx.hash(), err);
            Ok(ExecOutcome {
                status: 0,
                gas_used,
                return_data: outcome.data,
                contract_address: None,
                logs: Vec::new(),
                error: Some(err),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Hash, U256};
    use crate::core::BlockEnv;

    fn env() -> Env {
        Env {
            chain_id: 1,
            origin: Addr::zero().clone(),
            gas_price: Wei::from(1u64),
            block: BlockEnv {
                number: 1,
                timestamp: 1000,
                coinbase: Addr::zero().clone(),
                gas_limit: 8_000_000,
            },
        }
    }

    fn addr(n: u8) -> Addr {
        Addr::from_slice(&[n; 20])
    }

    fn transfer(from: Addr, to: Addr, value: u64, nonce: u64) -> Transaction {
        Transaction {
            from: Some(from),
            to: Some(to),
            value: Wei::from(value),
            gas_limit: GAS_TX,
            gas_price: Wei::from(1u64),
            nonce,
            data: Bytes::empty(),
        }
    }

    #[test]
    fn plain_transfer_charges_exactly_intrinsic_gas() {
        let mut w = WorldState::new();
        let (alice, bob) = (addr(1), addr(2));
        w.add_balance(&alice, &Wei::from(1_000_000u64)).unwrap();

        let out =
            execute(&mut w, &env(), &transfer(alice.clone(), bob.clone(), 5, 0))
                .unwrap();
        assert_eq!(out.status, 1);
        assert_eq!(out.gas_used, GAS_TX);
        assert_eq!(w.get_balance(&bob), Wei::from(5u64));
        assert_eq!(
            w.get_balance(&alice),
            Wei::from(1_000_000u64 - 5 - GAS_TX)
        );
        assert_eq!(w.get_nonce(&alice), 1);
    }

    #[test]
    fn validation_failures_leave_state_untouched() {
        let mut w = WorldState::new();
        let (alice, bob) = (addr(1), addr(2));
        w.add_balance(&alice, &Wei::from(100u64)).unwrap();

        // wrong nonce
        assert_eq!(
            execute(&mut w, &env(), &transfer(alice.clone(), bob.clone(), 1, 3)),
            Err(ExecError::InvalidNonce {
                expected: 0,
                got: 3
            })
        );
        // cannot afford gas
        assert_eq!(
            execute(&mut w, &env(), &transfer(alice.clone(), bob.clone(), 1, 0)),
            Err(ExecError::InsufficientBalance)
        );
        // gas limit below the intrinsic charge
        let mut tx = transfer(alice.clone(), bob.clone(), 0, 0);
        tx.gas_limit = 100;
        assert_eq!(execute(&mut w, &env(), &tx), Err(ExecError::GasLimitTooLow));
        // no sender
        let mut tx = transfer(alice.clone(), bob, 0, 0);
        tx.from = None;
        assert_eq!(execute(&mut w, &env(), &tx), Err(ExecError::MissingSender));

        assert_eq!(w.get_balance(&alice), Wei::from(100u64));
        assert_eq!(w.get_nonce(&alice), 0);
    }

    #[test]
    fn reverting_call_keeps_gas_charge_and_nonce() {
        let mut w = WorldState::new();
        let (alice, target) = (addr(1), addr(0xc0));
        w.add_balance(&alice, &Wei::from(10_000_000u64)).unwrap();
        // sets slot 0 to 42, then reverts
        w.set_code(
            &target,
            &hex::decode("602a60005560006000fd").unwrap(),
        );

        let mut tx = transfer(alice.clone(), target.clone(), 0, 0);
        tx.gas_limit = 100_000;
        let out = execute(&mut w, &env(), &tx).unwrap();

        assert_eq!(out.status, 0);
        assert_eq!(out.error, Some(VmError::Reverted));
        // slot stays clear, nonce advanced, gas partially consumed
        assert_eq!(
            w.get_storage(&target, &Hash::from(U256::zero())),
            U256::zero()
        );
        assert_eq!(w.get_nonce(&alice), 1);
        assert!(out.gas_used > GAS_TX);
        assert!(out.gas_used < tx.gas_limit);
        assert_eq!(
            w.get_balance(&alice),
            Wei::from(10_000_000u64 - out.gas_used)
        );
    }

    #[test]
    fn creation_installs_runtime_code_at_deterministic_address() {
        let mut w = WorldState::new();
        let alice = addr(1);
        w.add_balance(&alice, &Wei::from(10_000_000u64)).unwrap();

        // init code returns a 1-byte runtime: PUSH1 0 PUSH1 0 MSTORE8
        // PUSH1 1 PUSH1 0 RETURN
        let tx = Transaction {
            from: Some(alice.clone()),
            to: None,
            value: Wei::from(7u64),
            gas_limit: 200_000,
            gas_price: Wei::from(1u64),
            nonce: 0,
            data: hex::decode("600060005360016000f3").unwrap().into(),
        };
        let out = execute(&mut w, &env(), &tx).unwrap();
        assert_eq!(out.status, 1);
        let contract = out.contract_address.clone().unwrap();
        assert_eq!(contract, create_addr(&alice, 0));
        assert_eq!(w.get_code(&contract).as_bytes(), &[0u8]);
        assert_eq!(w.get_nonce(&contract), 1);
        assert_eq!(w.get_balance(&contract), Wei::from(7u64));

        // a second identical creation collides (nonce differs, so a new
        // address is derived; force the collision by replaying nonce 0
        // against an account that now exists)
        let mut w2 = WorldState::new();
        w2.add_balance(&alice, &Wei::from(10_000_000u64)).unwrap();
        w2.set_nonce(&create_addr(&alice, 0), 1);
        let out = execute(&mut w2, &env(), &tx).unwrap();
        assert_eq!(out.status, 0);
        assert_eq!(out.error, Some(VmError::ContractCollision));
        assert_eq!(out.gas_used, tx.gas_limit);
        assert_eq!(w2.get_nonce(&alice), 1);
    }

    #[test]
    fn reverting_init_code_leaves_no_account() {
        let mut w = WorldState::new();
        let alice = addr(1);
        w.add_balance(&alice, &Wei::from(10_000_000u64)).unwrap();

        let tx = Transaction {
            from: Some(alice.clone()),
            to: None,
            value: Wei::zero().clone(),
            gas_limit: 100_000,
            gas_price: Wei::from(1u64),
            nonce: 0,
            // PUSH1 0 PUSH1 0 REVERT
            data: hex::decode("60006000fd").unwrap().into(),
        };
        let out = execute(&mut w, &env(), &tx).unwrap();
        assert_eq!(out.status, 0);
        let contract = create_addr(&alice, 0);
        assert!(!w.exists(&contract));
        // the base debit survived
        assert!(w.get_balance(&alice) < Wei::from(10_000_000u64));
        assert_eq!(w.get_nonce(&alice), 1);
    }

    #[test]
    fn execution_is_timing_independent() {
        let run = || {
            let mut w = WorldState::new();
            let alice = addr(1);
            w.add_balance(&alice, &Wei::from(10_000_000u64)).unwrap();
            w.clear_modified();
            for nonce in 0..3 {
                let tx = transfer(alice.clone(), addr(2), 10, nonce);
                execute(&mut w, &env(), &tx).unwrap();
            }
            w.modified_root()
        };
        assert_eq!(run(), run());
    }
}
