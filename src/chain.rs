//! The chain manager: the single owner of world state, pool, consensus and
//! the persistent store. Everything mutates through here, one operation at
//! a time, so there is no locking anywhere below.

use std::str::FromStr;

use log::{info, warn};
use rlp_derive::{RlpDecodable, RlpEncodable};

use crate::block::{receipts_root, transactions_root, Block, Header, Receipt};
use crate::common::{Addr, Bytes, Hash, Wei, U256};
use crate::config::ChainConfig;
use crate::consensus::{ConsensusError, ForkChoice, PoaConsensus};
use crate::core::Code;
use crate::executor::ExecError;
use crate::processor::BlockProcessor;
use crate::state::WorldState;
use crate::storage::ChainStore;
use crate::tx::Transaction;
use crate::txpool::{PoolConfig, PoolError, TxPool};

#[derive(Debug, PartialEq, Eq)]
pub enum ChainError {
    UnknownParent,
    AlreadyKnown,
    BlockNumberMismatch,
    TxRootMismatch,
    GasUsedMismatch,
    GasLimitMismatch,
    DuplicateTransaction,
    NoActiveValidators,
    Consensus(ConsensusError),
    InvalidTransaction(ExecError),
    Codec(rlp::DecoderError),
    BadConfig(String),
    CorruptStore(String),
}

impl From<ConsensusError> for ChainError {
    fn from(e: ConsensusError) -> Self {
        ChainError::Consensus(e)
    }
}

impl From<rlp::DecoderError> for ChainError {
    fn from(e: rlp::DecoderError) -> Self {
        ChainError::Codec(e)
    }
}

/// On-disk account record under `account:<hex-addr>`.
#[derive(RlpEncodable, RlpDecodable)]
struct AccountRecord {
    nonce: u64,
    balance: Wei,
    code: Bytes,
}

const KEY_CHAIN_TIP: &str = "chainTip";
const KEY_CHAIN_TIP_NUMBER: &str = "chainTipNumber";

fn block_key(hash: &Hash) -> String {
    format!("block:{}", hash.to_key_hex())
}

fn header_key(hash: &Hash) -> String {
    format!("header:{}", hash.to_key_hex())
}

fn number_key(number: u64) -> String {
    format!("blockByNumber:{}", number)
}

fn metadata_key(hash: &Hash) -> String {
    format!("metadata:{}", hash.to_key_hex())
}

fn tx_key(hash: &Hash) -> String {
    format!("transaction:{}", hash.to_key_hex())
}

fn tx_block_key(hash: &Hash) -> String {
    format!("txBlock:{}", hash.to_key_hex())
}

fn tx_index_key(hash: &Hash) -> String {
    format!("txIndex:{}", hash.to_key_hex())
}

fn account_key(addr: &Addr) -> String {
    format!("account:{}", addr.to_key_hex())
}

fn storage_key(addr: &Addr, slot: &Hash) -> String {
    format!("storage:{}:{}", addr.to_key_hex(), slot.to_key_hex())
}

pub struct ChainManager<S: ChainStore> {
    config: ChainConfig,
    state: WorldState,
    pool: TxPool,
    consensus: PoaConsensus,
    processor: BlockProcessor,
    store: S,
    tip: Header,
    tip_hash: Hash,
}

impl<S: ChainStore> ChainManager<S> {
    /// Bootstraps from a populated store, or creates and persists the
    /// genesis block from the configured allocation.
    pub fn new(config: ChainConfig, store: S) -> Result<Self, ChainError> {
        let pool = TxPool::new(PoolConfig {
            min_gas_price: config.min_gas_price.clone(),
            block_gas_limit: config.gas_limit,
            max_pool_size: config.max_pool_size,
            max_account_transactions: config.max_account_transactions,
            transaction_timeout: config.transaction_timeout,
        });
        let consensus = PoaConsensus::new(
            config.validators.clone(),
            config.block_time,
            config.inactivity_threshold,
        );
        let processor = BlockProcessor::from_config(&config);

        let mut mgr = Self {
            config,
            state: WorldState::new(),
            pool,
            consensus,
            processor,
            store,
            tip: Header {
                parent_hash: Hash::zero().clone(),
                number: 0,
                timestamp: 0,
                state_root: Hash::zero().clone(),
                tx_root: Hash::zero().clone(),
                receipts_root: Hash::zero().clone(),
                validator: Addr::zero().clone(),
                signature: Bytes::empty(),
                gas_limit: 0,
                gas_used: 0,
                extra_data: Bytes::empty(),
            },
            tip_hash: Hash::zero().clone(),
        };
        match mgr.store.get(KEY_CHAIN_TIP) {
            Some(tip_bytes) => mgr.load(&tip_bytes)?,
            None => mgr.create_genesis()?,
        }
        Ok(mgr)
    }

    fn create_genesis(&mut self) -> Result<(), ChainError> {
        self.state.clear_modified();
        for (addr_hex, acc) in &self.config.alloc.clone() {
            let addr = Addr::from_str(addr_hex).map_err(|_| {
                ChainError::BadConfig(format!("bad alloc address {}", addr_hex))
            })?;
            self.state
                .add_balance(&addr, &acc.balance)
                .map_err(|e| ChainError::BadConfig(format!("{:?}", e)))?;
            if acc.nonce > 0 {
                self.state.set_nonce(&addr, acc.nonce);
            }
            if !acc.code.is_empty() {
                self.state.set_code(&addr, &acc.code);
            }
            for (key_hex, val_hex) in &acc.storage {
                let key = U256::from_str(key_hex).map_err(|_| {
                    ChainError::BadConfig(format!("bad slot {}", key_hex))
                })?;
                let val = U256::from_str(val_hex).map_err(|_| {
                    ChainError::BadConfig(format!("bad value {}", val_hex))
                })?;
                self.state.set_storage(&addr, &key.into(), &val);
            }
        }

        // block 0: zero parent, no signature, the first configured
        // authority as validator
        let header = Header {
            parent_hash: Hash::zero().clone(),
            number: 0,
            timestamp: self.config.genesis_timestamp,
            state_root: self.state.modified_root(),
            tx_root: transactions_root(&[]),
            receipts_root: receipts_root(&[]),
            validator: self
                .config
                .validators
                .first()
                .cloned()
                .unwrap_or_else(|| Addr::zero().clone()),
            signature: Bytes::empty(),
            gas_limit: self.config.gas_limit,
            gas_used: 0,
            extra_data: Bytes::empty(),
        };
        let genesis = Block {
            header,
            transactions: Vec::new(),
        };
        info!("created genesis block {}", genesis.hash());
        self.adopt(&genesis, &[]);
        Ok(())
    }

    fn load(&mut self, tip_bytes: &[u8]) -> Result<(), ChainError> {
        if tip_bytes.len() != 32 {
            return Err(ChainError::CorruptStore("chainTip".into()))
        }
        let tip_hash = Hash::from_slice(tip_bytes);
        let tip = self
            .get_header(&tip_hash)
            .ok_or_else(|| ChainError::CorruptStore("tip header".into()))?;

        let mut accounts = Vec::new();
        for (key, val) in self.store.iter_prefix("account:") {
            let addr_hex = &key["account:".len()..];
            let addr = hex::decode(addr_hex)
                .ok()
                .filter(|b| b.len() == 20)
                .map(|b| Addr::from_slice(&b))
                .ok_or_else(|| ChainError::CorruptStore(key.clone()))?;
            let rec: AccountRecord = rlp::decode(&val)?;
            accounts.push((addr, rec));
        }
        let mut slots = Vec::new();
        for (key, val) in self.store.iter_prefix("storage:") {
            let rest = &key["storage:".len()..];
            let (addr_hex, slot_hex) = rest
                .split_once(':')
                .ok_or_else(|| ChainError::CorruptStore(key.clone()))?;
            let addr = hex::decode(addr_hex)
                .ok()
                .filter(|b| b.len() == 20)
                .map(|b| Addr::from_slice(&b))
                .ok_or_else(|| ChainError::CorruptStore(key.clone()))?;
            let slot = hex::decode(slot_hex)
                .ok()
                .filter(|b| b.len() == 32)
                .map(|b| Hash::from_slice(&b))
                .ok_or_else(|| ChainError::CorruptStore(key.clone()))?;
            if val.len() != 32 {
                return Err(ChainError::CorruptStore(key.clone()))
            }
            slots.push((addr, slot, U256::from_big_endian(&val)));
        }

        for (addr, rec) in accounts {
            self.state.set_nonce(&addr, rec.nonce);
            self.state
                .add_balance(&addr, &rec.balance)
                .map_err(|e| ChainError::CorruptStore(format!("{:?}", e)))?;
            if !rec.code.is_empty() {
                self.state.set_code(&addr, &rec.code);
            }
        }
        for (addr, slot, val) in slots {
            self.state.set_storage(&addr, &slot, &val);
        }
        info!("loaded chain at height {} ({})", tip.number, tip_hash);
        self.tip = tip;
        self.tip_hash = tip_hash;
        Ok(())
    }

    // persistence

    fn persist_block_data(&mut self, block: &Block, receipts: &[Receipt]) {
        let hash = block.hash();
        self.store.put(&block_key(&hash), block.encode());
        self.store
            .put(&header_key(&hash), rlp::encode(&block.header).to_vec());
        for (i, tx) in block.transactions.iter().enumerate() {
            let th = tx.hash();
            self.store.put(&tx_key(&th), tx.encode());
            self.store
                .put(&tx_block_key(&th), hash.as_bytes().to_vec());
            self.store
                .put(&tx_index_key(&th), (i as u64).to_be_bytes().to_vec());
        }
        let mut s = rlp::RlpStream::new_list(receipts.len());
        for r in receipts {
            s.append(r);
        }
        self.store.put(&metadata_key(&hash), s.out().to_vec());
    }

    /// Marks `block` canonical: number index, tip pointers and the post
    /// state of the accounts it touched.
    fn persist_canonical(&mut self, block: &Block) {
        let hash = block.hash();
        self.store
            .put(&number_key(block.header.number), hash.as_bytes().to_vec());
        self.store
            .put(KEY_CHAIN_TIP, hash.as_bytes().to_vec());
        self.store.put(
            KEY_CHAIN_TIP_NUMBER,
            block.header.number.to_string().into_bytes(),
        );

        let touched: Vec<Addr> =
            self.state.modified_addresses().cloned().collect();
        for addr in touched {
            let rec = AccountRecord {
                nonce: self.state.get_nonce(&addr),
                balance: self.state.get_balance(&addr),
                code: self.state.get_code(&addr).as_bytes().into(),
            };
            self.store.put(&account_key(&addr), rlp::encode(&rec).to_vec());
            // rewrite this account's slots from scratch
            let prefix = format!("storage:{}:", addr.to_key_hex());
            let stale: Vec<String> = self
                .store
                .iter_prefix(&prefix)
                .map(|(k, _)| k)
                .collect();
            for k in stale {
                self.store.delete(&k);
            }
            for (slot, val) in self.state.storage_pairs(&addr) {
                let mut buf = [0u8; 32];
                val.to_big_endian(&mut buf);
                self.store
                    .put(&storage_key(&addr, &slot), buf.to_vec());
            }
        }
    }

    /// Full bookkeeping for a block becoming the new tip.
    fn adopt(&mut self, block: &Block, receipts: &[Receipt]) {
        self.consensus.update_validator_state(&block.header);
        self.persist_block_data(block, receipts);
        self.persist_canonical(block);
        let included: Vec<Hash> =
            block.transactions.iter().map(|tx| tx.hash()).collect();
        self.pool.remove_transactions(&included);
        self.tip = block.header.clone();
        self.tip_hash = block.hash();
    }

    // lookups

    pub fn get_header(&self, hash: &Hash) -> Option<Header> {
        let bytes = self.store.get(&header_key(hash))?;
        rlp::decode(&bytes).ok()
    }

    pub fn get_block(&self, hash: &Hash) -> Option<Block> {
        let bytes = self.store.get(&block_key(hash))?;
        Block::decode(&bytes).ok()
    }

    pub fn canonical_hash(&self, number: u64) -> Option<Hash> {
        let bytes = self.store.get(&number_key(number))?;
        if bytes.len() != 32 {
            return None
        }
        Some(Hash::from_slice(&bytes))
    }

    pub fn get_block_by_number(&self, number: u64) -> Option<Block> {
        self.get_block(&self.canonical_hash(number)?)
    }

    /// A stored transaction with the block hash and in-block index it was
    /// included under.
    pub fn get_transaction(
        &self, hash: &Hash,
    ) -> Option<(Transaction, Hash, u64)> {
        let tx = Transaction::decode(&self.store.get(&tx_key(hash))?).ok()?;
        let block_bytes = self.store.get(&tx_block_key(hash))?;
        if block_bytes.len() != 32 {
            return None
        }
        let idx_bytes = self.store.get(&tx_index_key(hash))?;
        let idx = u64::from_be_bytes(idx_bytes.try_into().ok()?);
        Some((tx, Hash::from_slice(&block_bytes), idx))
    }

    pub fn get_receipts(&self, block_hash: &Hash) -> Option<Vec<Receipt>> {
        let bytes = self.store.get(&metadata_key(block_hash))?;
        let rlp = rlp::Rlp::new(&bytes);
        let mut receipts = Vec::new();
        for i in 0..rlp.item_count().ok()? {
            receipts.push(rlp.val_at(i).ok()?);
        }
        Some(receipts)
    }

    pub fn get_receipt(&self, tx_hash: &Hash) -> Option<Receipt> {
        let block_bytes = self.store.get(&tx_block_key(tx_hash))?;
        if block_bytes.len() != 32 {
            return None
        }
        let receipts = self.get_receipts(&Hash::from_slice(&block_bytes))?;
        receipts.into_iter().find(|r| &r.tx_hash == tx_hash)
    }

    pub fn tip(&self) -> &Header {
        &self.tip
    }

    pub fn tip_hash(&self) -> &Hash {
        &self.tip_hash
    }

    pub fn state(&self) -> &WorldState {
        &self.state
    }

    pub fn pool(&self) -> &TxPool {
        &self.pool
    }

    pub fn consensus(&self) -> &PoaConsensus {
        &self.consensus
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    // operations

    /// Pool admission against the current account nonce.
    pub fn add_transaction(
        &mut self, tx: Transaction, now: u64,
    ) -> Result<Hash, PoolError> {
        let account_nonce = tx
            .from
            .as_ref()
            .map(|a| self.state.get_nonce(a))
            .unwrap_or(0);
        self.pool.add_transaction(tx, account_nonce, now)
    }

    /// Expires pool entries older than the configured timeout.
    pub fn expire_transactions(&mut self, now: u64) {
        self.pool.remove_old_transactions(now)
    }

    /// Builds, signs, applies and stores the next block. The timestamp is
    /// pushed forward if `now` violates the minimum block spacing.
    pub fn produce_block(&mut self, now: u64) -> Result<Block, ChainError> {
        let timestamp =
            now.max(self.tip.timestamp + self.config.block_time);
        let tip = self.tip.clone();
        let tip_hash = self.tip_hash.clone();
        let (block, receipts) = self.processor.create_block(
            &mut self.state,
            &self.pool,
            &self.consensus,
            &tip,
            &tip_hash,
            timestamp,
        )?;
        info!(
            "produced block {} ({} txs, {} gas)",
            block.header.number,
            block.transactions.len(),
            block.header.gas_used
        );
        self.adopt(&block, &receipts);
        Ok(block)
    }

    /// Imports a block produced elsewhere: validate, consult fork choice,
    /// then extend, shelve (side chain) or reorganize.
    pub fn add_block(
        &mut self, block: Block, now: u64,
    ) -> Result<(), ChainError> {
        let hash = block.hash();
        if self.store.get(&block_key(&hash)).is_some() {
            return Err(ChainError::AlreadyKnown)
        }
        let parent = self
            .get_header(&block.header.parent_hash)
            .ok_or(ChainError::UnknownParent)?;
        if block.header.number != parent.number + 1 {
            return Err(ChainError::BlockNumberMismatch)
        }

        match self
            .consensus
            .should_reorg(&block.header, &self.tip, &self.tip_hash)
        {
            ForkChoice::Extend => {
                let tip = self.tip.clone();
                self.processor.validate_block(
                    &block,
                    &tip,
                    &self.consensus,
                    &self.state,
                    now,
                )?;
                let receipts =
                    self.processor.apply_block(&mut self.state, &block)?;
                info!("imported block {} ({})", block.header.number, hash);
                self.adopt(&block, &receipts);
                Ok(())
            }
            ForkChoice::Ignore => {
                // remember it; a longer fork may build on it later
                self.consensus
                    .validate_header(&block.header, &parent, now)?;
                info!(
                    "stored side block {} at height {}",
                    hash, block.header.number
                );
                self.persist_block_data(&block, &[]);
                Ok(())
            }
            ForkChoice::Reorg => self.reorg(block, now),
        }
    }

    /// Adopts a strictly longer competing chain. The displaced blocks'
    /// transactions go back to the pool; the new chain's blocks apply
    /// best-effort (there is no deep state rewind here, by design).
    fn reorg(&mut self, block: Block, now: u64) -> Result<(), ChainError> {
        // walk the incoming chain back to a canonical ancestor
        let mut segment = vec![block];
        loop {
            let (parent_hash, parent_number) = {
                let last = segment.last().expect("segment never empty");
                (
                    last.header.parent_hash.clone(),
                    last.header.number - 1,
                )
            };
            if self.canonical_hash(parent_number).as_ref()
                == Some(&parent_hash)
            {
                break
            }
            let parent = self
                .get_block(&parent_hash)
                .ok_or(ChainError::UnknownParent)?;
            segment.push(parent);
        }
        segment.reverse();
        let fork_number = segment[0].header.number - 1;
        warn!(
            "reorg: abandoning #{}..#{} for {} blocks forking at #{}",
            fork_number + 1,
            self.tip.number,
            segment.len(),
            fork_number
        );

        // displaced transactions return to the pool
        let mut displaced = Vec::new();
        for number in (fork_number + 1)..=self.tip.number {
            if let Some(b) = self.get_block_by_number(number) {
                displaced.push(b);
            }
        }
        for b in &displaced {
            for tx in &b.transactions {
                let account_nonce = tx
                    .from
                    .as_ref()
                    .map(|a| self.state.get_nonce(a))
                    .unwrap_or(0);
                self.pool
                    .restore_transaction(tx.clone(), account_nonce, now);
            }
        }

        // adopt the new chain in order
        for b in &segment {
            let receipts =
                self.processor.apply_block_tolerant(&mut self.state, b);
            self.adopt(b, &receipts);
        }
        Ok(())
    }
}
