//! The pending-transaction pool.
//!
//! Two hash-keyed buckets: **pending** holds transactions whose nonces are
//! contiguous with the sender's account nonce (eligible for inclusion),
//! **queued** holds transactions waiting for a nonce gap to fill. A queued
//! transaction promotes the moment its predecessor enters pending or is
//! mined. Admission order is total: every accepted transaction gets a
//! monotonically increasing priority number, which breaks gas-price ties in
//! block selection (earlier arrival wins) and eviction (earlier arrival is
//! evicted first among equally cheap entries).

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};

use crate::common::{Addr, Gas, Hash, Wei};
use crate::tx::Transaction;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    GasPriceTooLow,
    GasLimitTooHigh,
    ZeroGasLimit,
    MissingSender,
    Duplicate,
    StaleNonce,
    AccountLimitExceeded,
}

#[derive(Clone)]
pub struct PoolConfig {
    pub min_gas_price: Wei,
    pub block_gas_limit: Gas,
    pub max_pool_size: usize,
    pub max_account_transactions: usize,
    /// Seconds after which an entry ages out.
    pub transaction_timeout: u64,
}

#[derive(Clone)]
pub struct PoolEntry {
    pub tx: Transaction,
    pub hash: Hash,
    pub sender: Addr,
    /// Coarse admission time (unix seconds).
    pub arrival: u64,
    /// Admission order; lower means earlier.
    pub priority: u64,
}

struct SenderQueue {
    pending: BTreeMap<u64, Hash>,
    queued: BTreeMap<u64, Hash>,
    /// Next nonce that would be admitted straight to pending.
    next_nonce: u64,
}

impl SenderQueue {
    fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.queued.is_empty()
    }

    fn len(&self) -> usize {
        self.pending.len() + self.queued.len()
    }
}

pub struct TxPool {
    config: PoolConfig,
    pending: HashMap<Hash, PoolEntry>,
    queued: HashMap<Hash, PoolEntry>,
    senders: HashMap<Addr, SenderQueue>,
    priority_counter: u64,
}

impl TxPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            queued: HashMap::new(),
            senders: HashMap::new(),
            priority_counter: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.queued.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.pending.contains_key(hash) || self.queued.contains_key(hash)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The nonce the pool expects next from `sender`: the account nonce
    /// advanced past the sender's contiguous pending sequence.
    pub fn pending_nonce(&self, sender: &Addr, account_nonce: u64) -> u64 {
        self.senders
            .get(sender)
            .map(|q| q.next_nonce.max(account_nonce))
            .unwrap_or(account_nonce)
    }

    /// Admission. `account_nonce` is the sender's current world-state nonce;
    /// `now` is coarse unix seconds.
    pub fn add_transaction(
        &mut self, tx: Transaction, account_nonce: u64, now: u64,
    ) -> Result<Hash, PoolError> {
        if tx.gas_price < self.config.min_gas_price {
            return Err(PoolError::GasPriceTooLow)
        }
        if tx.gas_limit == 0 {
            return Err(PoolError::ZeroGasLimit)
        }
        if tx.gas_limit > self.config.block_gas_limit {
            return Err(PoolError::GasLimitTooHigh)
        }
        let sender = match &tx.from {
            Some(addr) => addr.clone(),
            None => return Err(PoolError::MissingSender),
        };
        let hash = tx.hash();
        if self.contains(&hash) {
            return Err(PoolError::Duplicate)
        }

        self.resync_sender(&sender, account_nonce);
        let queue =
            self.senders.entry(sender.clone()).or_insert(SenderQueue {
                pending: BTreeMap::new(),
                queued: BTreeMap::new(),
                next_nonce: account_nonce,
            });
        if queue.len() >= self.config.max_account_transactions {
            return Err(PoolError::AccountLimitExceeded)
        }
        if tx.nonce < queue.next_nonce {
            debug!(
                "stale transaction from {}: nonce {} < {}",
                sender, tx.nonce, queue.next_nonce
            );
            return Err(PoolError::StaleNonce)
        }

        let priority = self.priority_counter;
        self.priority_counter += 1;
        let entry = PoolEntry {
            hash: hash.clone(),
            sender: sender.clone(),
            arrival: now,
            priority,
            tx,
        };

        if entry.tx.nonce == queue.next_nonce {
            queue.pending.insert(entry.tx.nonce, hash.clone());
            queue.next_nonce = entry.tx.nonce + 1;
            self.pending.insert(hash.clone(), entry);
            self.promote(&sender);
        } else {
            // a replacement for an already-queued nonce must outbid it
            if let Some(old_hash) = queue.queued.get(&entry.tx.nonce) {
                let old_price =
                    self.queued[old_hash].tx.gas_price.clone();
                if entry.tx.gas_price <= old_price {
                    return Err(PoolError::Duplicate)
                }
                let old_hash = old_hash.clone();
                queue.queued.remove(&entry.tx.nonce);
                self.queued.remove(&old_hash);
            }
            queue.queued.insert(entry.tx.nonce, hash.clone());
            self.queued.insert(hash.clone(), entry);
        }

        while self.len() > self.config.max_pool_size {
            self.evict_cheapest();
        }
        Ok(hash)
    }

    /// Brings a sender's view in line with a world-state nonce that advanced
    /// outside the pool, purging anything stale and promoting what became
    /// contiguous.
    fn resync_sender(&mut self, sender: &Addr, account_nonce: u64) {
        let stale: Vec<Hash> = match self.senders.get(sender) {
            Some(q) if account_nonce > q.next_nonce => q
                .pending
                .range(..account_nonce)
                .chain(q.queued.range(..account_nonce))
                .map(|(_, h)| h.clone())
                .collect(),
            _ => return,
        };
        for hash in &stale {
            self.drop_entry(hash);
        }
        if let Some(q) = self.senders.get_mut(sender) {
            if account_nonce > q.next_nonce {
                q.next_nonce = account_nonce;
            }
        }
        self.promote(sender);
    }

    /// Moves queued entries of `sender` to pending while their nonces are
    /// contiguous with the expected next nonce.
    fn promote(&mut self, sender: &Addr) {
        while let Some(hash) = self
            .senders
            .get_mut(sender)
            .and_then(|q| q.queued.remove(&q.next_nonce))
        {
            let q = self.senders.get_mut(sender).unwrap();
            q.pending.insert(q.next_nonce, hash.clone());
            q.next_nonce += 1;
            if let Some(entry) = self.queued.remove(&hash) {
                self.pending.insert(hash, entry);
            }
        }
    }

    /// Removes one entry from whichever bucket holds it and from its
    /// sender's queue. Does not trigger promotion.
    fn drop_entry(&mut self, hash: &Hash) -> Option<PoolEntry> {
        let entry = self
            .pending
            .remove(hash)
            .or_else(|| self.queued.remove(hash))?;
        if let Some(q) = self.senders.get_mut(&entry.sender) {
            q.pending.remove(&entry.tx.nonce);
            q.queued.remove(&entry.tx.nonce);
            if q.is_empty() {
                self.senders.remove(&entry.sender);
            }
        }
        Some(entry)
    }

    /// Evicts the globally cheapest entry, oldest first among equals.
    fn evict_cheapest(&mut self) {
        let victim = self
            .pending
            .values()
            .chain(self.queued.values())
            .min_by(|a, b| {
                (a.tx.gas_price.clone(), a.priority)
                    .cmp(&(b.tx.gas_price.clone(), b.priority))
            })
            .map(|e| e.hash.clone());
        if let Some(hash) = victim {
            warn!("pool over capacity, evicting {}", hash);
            self.drop_entry(&hash);
        }
    }

    /// Deletes entries (typically the transactions of a freshly stored
    /// block), then promotes whatever became eligible for the affected
    /// senders.
    pub fn remove_transactions(&mut self, hashes: &[Hash]) {
        let mut touched = Vec::new();
        for hash in hashes {
            if let Some(entry) = self.drop_entry(hash) {
                touched.push(entry.sender);
            }
        }
        touched.sort();
        touched.dedup();
        for sender in touched {
            self.promote(&sender);
        }
    }

    /// Pending entries ordered by descending gas price (priority breaks
    /// ties, earlier arrival first), cut off where the cumulative gas limit
    /// would exceed `gas_limit`.
    pub fn transactions_for_block(&self, gas_limit: Gas) -> Vec<PoolEntry> {
        let mut entries: Vec<&PoolEntry> = self.pending.values().collect();
        entries.sort_by(|a, b| {
            b.tx.gas_price
                .cmp(&a.tx.gas_price)
                .then(a.priority.cmp(&b.priority))
        });
        let mut out = Vec::new();
        let mut cumulative: Gas = 0;
        for entry in entries {
            if cumulative + entry.tx.gas_limit > gas_limit {
                break
            }
            cumulative += entry.tx.gas_limit;
            out.push(entry.clone());
        }
        out
    }

    /// Re-inserts a transaction displaced by a reorg. Unlike admission, a
    /// nonce already behind the expected next is kept (queued) instead of
    /// rejected as stale; if it never becomes executable again it ages out
    /// with the timeout.
    pub fn restore_transaction(
        &mut self, tx: Transaction, account_nonce: u64, now: u64,
    ) {
        let sender = match &tx.from {
            Some(addr) => addr.clone(),
            None => return,
        };
        let hash = tx.hash();
        if self.contains(&hash) {
            return
        }
        let queue =
            self.senders.entry(sender.clone()).or_insert(SenderQueue {
                pending: BTreeMap::new(),
                queued: BTreeMap::new(),
                next_nonce: account_nonce,
            });
        let priority = self.priority_counter;
        self.priority_counter += 1;
        let entry = PoolEntry {
            hash: hash.clone(),
            sender: sender.clone(),
            arrival: now,
            priority,
            tx,
        };
        if entry.tx.nonce == queue.next_nonce {
            queue.pending.insert(entry.tx.nonce, hash.clone());
            queue.next_nonce = entry.tx.nonce + 1;
            self.pending.insert(hash, entry);
            self.promote(&sender);
        } else if !queue.queued.contains_key(&entry.tx.nonce) {
            queue.queued.insert(entry.tx.nonce, hash.clone());
            self.queued.insert(hash, entry);
        }
        while self.len() > self.config.max_pool_size {
            self.evict_cheapest();
        }
    }

    /// Ages out entries older than the configured timeout.
    pub fn remove_old_transactions(&mut self, now: u64) {
        let expired: Vec<Hash> = self
            .pending
            .values()
            .chain(self.queued.values())
            .filter(|e| now.saturating_sub(e.arrival)
                > self.config.transaction_timeout)
            .map(|e| e.hash.clone())
            .collect();
        if !expired.is_empty() {
            debug!("expiring {} pool entries", expired.len());
            self.remove_transactions(&expired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Bytes;

    fn config() -> PoolConfig {
        PoolConfig {
            min_gas_price: Wei::from(1u64),
            block_gas_limit: 1_000_000,
            max_pool_size: 100,
            max_account_transactions: 16,
            transaction_timeout: 3600,
        }
    }

    fn addr(n: u8) -> Addr {
        Addr::from_slice(&[n; 20])
    }

    fn tx(from: u8, nonce: u64, gas_price: u64) -> Transaction {
        Transaction {
            from: Some(addr(from)),
            to: Some(addr(0xee)),
            value: Wei::zero().clone(),
            gas_limit: 21000,
            gas_price: Wei::from(gas_price),
            nonce,
            data: Bytes::empty(),
        }
    }

    #[test]
    fn admission_rules_in_order() {
        let mut pool = TxPool::new(config());

        let mut t = tx(1, 0, 0);
        assert_eq!(
            pool.add_transaction(t.clone(), 0, 0),
            Err(PoolError::GasPriceTooLow)
        );
        t.gas_price = Wei::from(2u64);
        t.gas_limit = 0;
        assert_eq!(
            pool.add_transaction(t.clone(), 0, 0),
            Err(PoolError::ZeroGasLimit)
        );
        t.gas_limit = 2_000_000;
        assert_eq!(
            pool.add_transaction(t.clone(), 0, 0),
            Err(PoolError::GasLimitTooHigh)
        );
        t.gas_limit = 21000;
        t.from = None;
        assert_eq!(
            pool.add_transaction(t.clone(), 0, 0),
            Err(PoolError::MissingSender)
        );
        t.from = Some(addr(1));
        let hash = pool.add_transaction(t.clone(), 0, 0).unwrap();
        assert_eq!(
            pool.add_transaction(t.clone(), 0, 0),
            Err(PoolError::Duplicate)
        );
        assert!(pool.contains(&hash));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn stale_nonce_rejected() {
        let mut pool = TxPool::new(config());
        assert_eq!(
            pool.add_transaction(tx(1, 2, 5), 3, 0),
            Err(PoolError::StaleNonce)
        );
        pool.add_transaction(tx(1, 3, 5), 3, 0).unwrap();
        // below the contiguous pending window is stale too
        assert_eq!(
            pool.add_transaction(tx(1, 3, 9), 3, 0),
            Err(PoolError::StaleNonce)
        );
    }

    #[test]
    fn account_limit_enforced() {
        let mut cfg = config();
        cfg.max_account_transactions = 2;
        let mut pool = TxPool::new(cfg);
        pool.add_transaction(tx(1, 0, 5), 0, 0).unwrap();
        pool.add_transaction(tx(1, 1, 5), 0, 0).unwrap();
        assert_eq!(
            pool.add_transaction(tx(1, 2, 5), 0, 0),
            Err(PoolError::AccountLimitExceeded)
        );
        // other senders are unaffected
        pool.add_transaction(tx(2, 0, 5), 0, 0).unwrap();
    }

    #[test]
    fn nonce_gap_goes_to_queued_and_promotes() {
        let mut pool = TxPool::new(config());
        // nonce 1 with expected 0 waits in queued
        pool.add_transaction(tx(1, 1, 5), 0, 0).unwrap();
        assert_eq!(pool.pending_count(), 0);
        assert_eq!(pool.len(), 1);

        // nonce 0 arrives and drags nonce 1 into pending with it
        pool.add_transaction(tx(1, 0, 5), 0, 0).unwrap();
        assert_eq!(pool.pending_count(), 2);
        assert_eq!(pool.pending_nonce(&addr(1), 0), 2);
    }

    #[test]
    fn mined_predecessor_promotes_queued() {
        let mut pool = TxPool::new(config());
        let h0 = pool.add_transaction(tx(1, 0, 5), 0, 0).unwrap();
        // gap: nonce 2 waits
        pool.add_transaction(tx(1, 2, 5), 0, 0).unwrap();
        assert_eq!(pool.pending_count(), 1);

        // nonce 0 mined; nonce 1 arrives against the advanced account
        pool.remove_transactions(&[h0]);
        pool.add_transaction(tx(1, 1, 5), 1, 0).unwrap();
        assert_eq!(pool.pending_count(), 2);
        let selected = pool.transactions_for_block(1_000_000);
        assert_eq!(
            selected.iter().map(|e| e.tx.nonce).collect::<Vec<_>>().len(),
            2
        );
    }

    #[test]
    fn selection_orders_by_price_then_arrival() {
        let mut pool = TxPool::new(config());
        pool.add_transaction(tx(1, 0, 5), 0, 0).unwrap();
        pool.add_transaction(tx(2, 0, 9), 0, 0).unwrap();
        pool.add_transaction(tx(3, 0, 9), 0, 0).unwrap();
        pool.add_transaction(tx(4, 0, 2), 0, 0).unwrap();

        let picked = pool.transactions_for_block(1_000_000);
        let senders: Vec<Addr> =
            picked.iter().map(|e| e.sender.clone()).collect();
        // price 9 first (sender 2 before 3 by arrival), then 5, then 2
        assert_eq!(senders, vec![addr(2), addr(3), addr(1), addr(4)]);
    }

    #[test]
    fn selection_respects_block_gas_limit() {
        let mut pool = TxPool::new(config());
        for s in 1..=5u8 {
            pool.add_transaction(tx(s, 0, 5), 0, 0).unwrap();
        }
        let picked = pool.transactions_for_block(21000 * 3);
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn capacity_eviction_drops_cheapest_oldest() {
        let mut cfg = config();
        cfg.max_pool_size = 3;
        let mut pool = TxPool::new(cfg);
        let h_cheap_old = pool.add_transaction(tx(1, 0, 2), 0, 0).unwrap();
        pool.add_transaction(tx(2, 0, 2), 0, 10).unwrap();
        pool.add_transaction(tx(3, 0, 5), 0, 20).unwrap();

        // a pricier transaction pushes out the cheapest, oldest entry
        let h_new = pool.add_transaction(tx(4, 0, 9), 0, 30).unwrap();
        assert_eq!(pool.len(), 3);
        assert!(!pool.contains(&h_cheap_old));
        assert!(pool.contains(&h_new));
    }

    #[test]
    fn queued_replacement_needs_higher_price() {
        let mut pool = TxPool::new(config());
        let h_low = pool.add_transaction(tx(1, 5, 3), 0, 0).unwrap();
        assert_eq!(
            pool.add_transaction(tx(1, 5, 3), 0, 0),
            Err(PoolError::Duplicate)
        );
        let h_high = pool.add_transaction(tx(1, 5, 7), 0, 0).unwrap();
        assert!(!pool.contains(&h_low));
        assert!(pool.contains(&h_high));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn age_out() {
        let mut pool = TxPool::new(config());
        pool.add_transaction(tx(1, 0, 5), 0, 100).unwrap();
        pool.add_transaction(tx(2, 0, 5), 0, 4000).unwrap();
        pool.remove_old_transactions(4100);
        assert_eq!(pool.len(), 1);
        pool.remove_old_transactions(10_000);
        assert!(pool.is_empty());
    }

    #[test]
    fn resync_purges_stale_entries() {
        let mut pool = TxPool::new(config());
        let h0 = pool.add_transaction(tx(1, 0, 5), 0, 0).unwrap();
        let h5 = pool.add_transaction(tx(1, 5, 5), 0, 0).unwrap();
        // the chain advanced to nonce 5 elsewhere; admitting nonce 6
        // resyncs the sender view
        pool.add_transaction(tx(1, 6, 5), 5, 0).unwrap();
        assert!(!pool.contains(&h0));
        // nonce 5 was still useful: it became pending
        assert!(pool.contains(&h5));
        assert_eq!(pool.pending_count(), 2);
    }
}
