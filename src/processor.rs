//! The block processor assembles and checks blocks. It keeps no state of
//! its own beyond configuration: the chain manager lends it the world
//! state, pool and consensus for the duration of a call.

use log::{debug, warn};

use crate::block::{
    receipts_root, transactions_root, Block, Header, Receipt,
};
use crate::chain::ChainError;
use crate::common::{Addr, Bytes, Gas, Hash};
use crate::config::ChainConfig;
use crate::consensus::PoaConsensus;
use crate::core::{BlockEnv, Env};
use crate::executor::{execute, ExecOutcome};
use crate::state::WorldState;
use crate::tx::Transaction;
use crate::txpool::TxPool;

pub struct BlockProcessor {
    pub chain_id: u64,
    pub gas_limit: Gas,
}

impl BlockProcessor {
    pub fn from_config(config: &ChainConfig) -> Self {
        Self {
            chain_id: config.chain_id,
            gas_limit: config.gas_limit,
        }
    }

    fn env_for(
        &self, tx: &Transaction, number: u64, timestamp: u64,
        validator: &Addr,
    ) -> Env {
        Env {
            chain_id: self.chain_id,
            origin: tx.from.clone().unwrap_or_else(|| Addr::zero().clone()),
            gas_price: tx.gas_price.clone(),
            block: BlockEnv {
                number,
                timestamp,
                coinbase: validator.clone(),
                gas_limit: self.gas_limit,
            },
        }
    }

    fn receipt_of(
        out: ExecOutcome, tx_hash: Hash, number: u64, cumulative: Gas,
    ) -> Receipt {
        Receipt {
            tx_hash,
            block_number: number,
            gas_used: out.gas_used,
            cumulative_gas_used: cumulative,
            contract_address: out.contract_address,
            logs: out.logs,
            status: out.status,
        }
    }

    /// Builds and signs the next block on top of `parent` from the pool's
    /// eligible transactions. Transactions that fail execution stay in the
    /// block with a zero-status receipt; transactions that no longer pass
    /// pre-state validation are skipped.
    pub fn create_block(
        &self, state: &mut WorldState, pool: &TxPool,
        consensus: &PoaConsensus, parent: &Header, parent_hash: &Hash,
        timestamp: u64,
    ) -> Result<(Block, Vec<Receipt>), ChainError> {
        let number = parent.number + 1;
        let validator = consensus
            .next_validator(number)
            .ok_or(ChainError::NoActiveValidators)?;

        let snap = state.snapshot();
        state.clear_modified();
        let mut transactions = Vec::new();
        let mut receipts = Vec::new();
        let mut cumulative: Gas = 0;
        for entry in pool.transactions_for_block(self.gas_limit) {
            if cumulative + entry.tx.gas_limit > self.gas_limit {
                break
            }
            let env = self.env_for(&entry.tx, number, timestamp, &validator);
            match execute(state, &env, &entry.tx) {
                Ok(out) => {
                    cumulative += out.gas_used;
                    receipts.push(Self::receipt_of(
                        out,
                        entry.hash.clone(),
                        number,
                        cumulative,
                    ));
                    transactions.push(entry.tx.clone());
                }
                Err(err) => {
                    // raced with an earlier transaction in this block or a
                    // state change since admission; leave it out
                    debug!("skipping {} at block {}: {:?}", entry.hash, number, err);
                }
            }
        }

        let mut header = Header {
            parent_hash: parent_hash.clone(),
            number,
            timestamp,
            state_root: state.modified_root(),
            tx_root: transactions_root(&transactions),
            receipts_root: receipts_root(&receipts),
            validator,
            signature: Bytes::empty(),
            gas_limit: self.gas_limit,
            gas_used: cumulative,
            extra_data: Bytes::empty(),
        };
        consensus.sign_header(&mut header);
        state.commit(snap).expect("block snapshot misaligned");
        Ok((
            Block {
                header,
                transactions,
            },
            receipts,
        ))
    }

    /// Structural validation of a received block against its parent and the
    /// current pre-state. Execution-level failures of individual
    /// transactions are NOT checked here; only consensus and shape.
    pub fn validate_block(
        &self, block: &Block, parent: &Header, consensus: &PoaConsensus,
        state: &WorldState, now: u64,
    ) -> Result<(), ChainError> {
        let header = &block.header;
        if header.number != parent.number + 1 {
            return Err(ChainError::BlockNumberMismatch)
        }
        consensus.validate_header(header, parent, now)?;
        if header.gas_limit != self.gas_limit {
            return Err(ChainError::GasLimitMismatch)
        }
        if header.gas_used > header.gas_limit {
            return Err(ChainError::GasUsedMismatch)
        }
        let limit_sum: Gas =
            block.transactions.iter().map(|tx| tx.gas_limit).sum();
        if header.gas_used > limit_sum {
            return Err(ChainError::GasUsedMismatch)
        }

        let mut seen = std::collections::HashSet::new();
        for tx in &block.transactions {
            if !seen.insert(tx.hash()) {
                return Err(ChainError::DuplicateTransaction)
            }
        }
        if transactions_root(&block.transactions) != header.tx_root {
            return Err(ChainError::TxRootMismatch)
        }

        // pre-state validation: nonces sequential per sender from the
        // current account nonce, cost covered by the pre-state balance
        let mut nonces: std::collections::HashMap<Addr, u64> =
            std::collections::HashMap::new();
        for tx in &block.transactions {
            let sender = tx
                .from
                .clone()
                .ok_or(ChainError::InvalidTransaction(
                    crate::executor::ExecError::MissingSender,
                ))?;
            let expected = *nonces
                .entry(sender.clone())
                .or_insert_with(|| state.get_nonce(&sender));
            if tx.nonce != expected {
                return Err(ChainError::InvalidTransaction(
                    crate::executor::ExecError::InvalidNonce {
                        expected,
                        got: tx.nonce,
                    },
                ))
            }
            nonces.insert(sender.clone(), expected + 1);
            let cost = tx.max_cost().ok_or(ChainError::InvalidTransaction(
                crate::executor::ExecError::InsufficientBalance,
            ))?;
            if state.get_balance(&sender) < cost {
                return Err(ChainError::InvalidTransaction(
                    crate::executor::ExecError::InsufficientBalance,
                ))
            }
        }
        Ok(())
    }

    /// Executes a validated block against the world state. The whole block
    /// applies atomically: a structural surprise (a transaction that cannot
    /// even start, or a gas-used total that disagrees with the header)
    /// reverts everything and rejects the block; per-transaction execution
    /// failures are fine and simply yield zero-status receipts.
    pub fn apply_block(
        &self, state: &mut WorldState, block: &Block,
    ) -> Result<Vec<Receipt>, ChainError> {
        let header = &block.header;
        let snap = state.snapshot();
        state.clear_modified();
        let mut receipts = Vec::new();
        let mut cumulative: Gas = 0;
        for tx in &block.transactions {
            let env =
                self.env_for(tx, header.number, header.timestamp, &header.validator);
            match execute(state, &env, tx) {
                Ok(out) => {
                    cumulative += out.gas_used;
                    receipts.push(Self::receipt_of(
                        out,
                        tx.hash(),
                        header.number,
                        cumulative,
                    ));
                }
                Err(err) => {
                    warn!(
                        "block {} carries unexecutable tx {}: {:?}",
                        header.number,
                        tx.hash(),
                        err
                    );
                    state.revert(snap).expect("block snapshot misaligned");
                    return Err(ChainError::InvalidTransaction(err))
                }
            }
        }
        if cumulative != header.gas_used {
            state.revert(snap).expect("block snapshot misaligned");
            return Err(ChainError::GasUsedMismatch)
        }
        state.commit(snap).expect("block snapshot misaligned");
        Ok(receipts)
    }
}

impl BlockProcessor {
    /// Best-effort application used when adopting a reorged-in chain whose
    /// pre-state this node never rewound: transactions that cannot execute
    /// against the local state are skipped instead of rejecting the block.
    pub fn apply_block_tolerant(
        &self, state: &mut WorldState, block: &Block,
    ) -> Vec<Receipt> {
        let header = &block.header;
        state.clear_modified();
        let mut receipts = Vec::new();
        let mut cumulative: Gas = 0;
        for tx in &block.transactions {
            let env = self.env_for(
                tx,
                header.number,
                header.timestamp,
                &header.validator,
            );
            match execute(state, &env, tx) {
                Ok(out) => {
                    cumulative += out.gas_used;
                    receipts.push(Self::receipt_of(
                        out,
                        tx.hash(),
                        header.number,
                        cumulative,
                    ));
                }
                Err(err) => {
                    warn!(
                        "reorg: skipping tx {} of block {}: {:?}",
                        tx.hash(),
                        header.number,
                        err
                    );
                }
            }
        }
        receipts
    }
}
