//! The world state: every account the chain knows about, with nested
//! snapshot support.
//!
//! Rather than deep-copying the account map per checkpoint, mutations append
//! undo records to a journal and a snapshot is just a watermark into it.
//! Reverting replays the records in reverse down to the watermark; committing
//! drops the watermark and keeps the records so an outer snapshot can still
//! revert across the inner one. Once no snapshot is open the journal is
//! discarded wholesale.

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use crate::common::{Addr, Hash, Wei, U256, U256Rlp};
use crate::core::{Code, PlainCode};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StateError {
    InsufficientBalance,
    BalanceOverflow,
    SnapshotNotFound,
}

/// A restore point returned by [WorldState::snapshot]. Ids are positions in
/// the open-snapshot stack, so an id becomes reusable once reverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotId(usize);

#[derive(Clone)]
pub struct Account {
    pub nonce: u64,
    pub balance: Wei,
    code: Rc<PlainCode>,
    storage: HashMap<Hash, U256>,
}

impl Account {
    fn new() -> Self {
        Self {
            nonce: 0,
            balance: Wei::zero().clone(),
            code: Rc::new(PlainCode::new(Vec::new().into())),
            storage: HashMap::new(),
        }
    }
}

enum Undo {
    BalanceChanged(Addr, Wei),
    NonceChanged(Addr, u64),
    CodeChanged(Addr, Rc<PlainCode>),
    StorageChanged(Addr, Hash, U256),
    AccountCreated(Addr),
}

pub struct WorldState {
    accounts: HashMap<Addr, Account>,
    journal: Vec<Undo>,
    marks: Vec<usize>,
    /// Addresses written since the last [Self::clear_modified], the scope of
    /// the state-root commitment.
    modified: BTreeSet<Addr>,
}

impl WorldState {
    pub fn new() -> Self {
        Self {
            accounts: HashMap::new(),
            journal: Vec::new(),
            marks: Vec::new(),
            modified: BTreeSet::new(),
        }
    }

    #[inline(always)]
    fn record(&mut self, undo: Undo) {
        if !self.marks.is_empty() {
            self.journal.push(undo)
        }
    }

    /// Fetches the account for mutation, creating it lazily.
    fn account_mut(&mut self, addr: &Addr) -> &mut Account {
        if !self.accounts.contains_key(addr) {
            self.record(Undo::AccountCreated(addr.clone()));
            self.accounts.insert(addr.clone(), Account::new());
        }
        self.modified.insert(addr.clone());
        self.accounts.get_mut(addr).unwrap()
    }

    pub fn exists(&self, addr: &Addr) -> bool {
        self.accounts.contains_key(addr)
    }

    pub fn get_balance(&self, addr: &Addr) -> Wei {
        self.accounts
            .get(addr)
            .map(|acc| acc.balance.clone())
            .unwrap_or_else(|| Wei::zero().clone())
    }

    pub fn add_balance(
        &mut self, addr: &Addr, val: &Wei,
    ) -> Result<(), StateError> {
        let old = self.get_balance(addr);
        let new = old.checked_add(val).ok_or(StateError::BalanceOverflow)?;
        self.record(Undo::BalanceChanged(addr.clone(), old));
        self.account_mut(addr).balance = new;
        Ok(())
    }

    pub fn sub_balance(
        &mut self, addr: &Addr, val: &Wei,
    ) -> Result<(), StateError> {
        let old = self.get_balance(addr);
        let new =
            old.checked_sub(val).ok_or(StateError::InsufficientBalance)?;
        self.record(Undo::BalanceChanged(addr.clone(), old));
        self.account_mut(addr).balance = new;
        Ok(())
    }

    pub fn transfer_balance(
        &mut self, from: &Addr, to: &Addr, val: &Wei,
    ) -> Result<(), StateError> {
        self.sub_balance(from, val)?;
        self.add_balance(to, val)
    }

    pub fn get_nonce(&self, addr: &Addr) -> u64 {
        self.accounts.get(addr).map(|acc| acc.nonce).unwrap_or(0)
    }

    pub fn set_nonce(&mut self, addr: &Addr, nonce: u64) {
        let old = self.get_nonce(addr);
        self.record(Undo::NonceChanged(addr.clone(), old));
        self.account_mut(addr).nonce = nonce;
    }

    pub fn increment_nonce(&mut self, addr: &Addr) {
        self.set_nonce(addr, self.get_nonce(addr) + 1)
    }

    pub fn get_code(&self, addr: &Addr) -> Rc<PlainCode> {
        self.accounts
            .get(addr)
            .map(|acc| acc.code.clone())
            .unwrap_or_else(|| Rc::new(PlainCode::new(Vec::new().into())))
    }

    pub fn set_code(&mut self, addr: &Addr, code: &[u8]) {
        let old = self.get_code(addr);
        self.record(Undo::CodeChanged(addr.clone(), old));
        self.account_mut(addr).code = Rc::new(PlainCode::new(code.into()));
    }

    /// Returns the stored word, or zero for a slot that was never written
    /// (or was written back to zero).
    pub fn get_storage(&self, addr: &Addr, key: &Hash) -> U256 {
        self.accounts
            .get(addr)
            .and_then(|acc| acc.storage.get(key).copied())
            .unwrap_or_else(U256::zero)
    }

    /// Stores a word; a zero value deletes the slot so `zero` and `absent`
    /// stay indistinguishable.
    pub fn set_storage(&mut self, addr: &Addr, key: &Hash, val: &U256) {
        let old = self.get_storage(addr, key);
        self.record(Undo::StorageChanged(addr.clone(), key.clone(), old));
        let acc = self.account_mut(addr);
        if val.is_zero() {
            acc.storage.remove(key);
        } else {
            acc.storage.insert(key.clone(), *val);
        }
    }

    /// True when the slot physically exists in the backing map; test hook
    /// for the zero-elision rule.
    pub fn has_storage_entry(&self, addr: &Addr, key: &Hash) -> bool {
        self.accounts
            .get(addr)
            .map(|acc| acc.storage.contains_key(key))
            .unwrap_or(false)
    }

    pub fn snapshot(&mut self) -> SnapshotId {
        self.marks.push(self.journal.len());
        SnapshotId(self.marks.len() - 1)
    }

    /// Restores the world exactly to the state at `id`'s creation and
    /// invalidates `id` and every snapshot taken after it.
    pub fn revert(&mut self, id: SnapshotId) -> Result<(), StateError> {
        if id.0 >= self.marks.len() {
            return Err(StateError::SnapshotNotFound)
        }
        let mark = self.marks[id.0];
        self.marks.truncate(id.0);
        // A field record laid down just before the account's own
        // AccountCreated record replays after the removal; those are skipped.
        while self.journal.len() > mark {
            match self.journal.pop().unwrap() {
                Undo::BalanceChanged(addr, old) => {
                    if let Some(acc) = self.accounts.get_mut(&addr) {
                        acc.balance = old
                    }
                }
                Undo::NonceChanged(addr, old) => {
                    if let Some(acc) = self.accounts.get_mut(&addr) {
                        acc.nonce = old
                    }
                }
                Undo::CodeChanged(addr, old) => {
                    if let Some(acc) = self.accounts.get_mut(&addr) {
                        acc.code = old
                    }
                }
                Undo::StorageChanged(addr, key, old) => {
                    if let Some(acc) = self.accounts.get_mut(&addr) {
                        if old.is_zero() {
                            acc.storage.remove(&key);
                        } else {
                            acc.storage.insert(key, old);
                        }
                    }
                }
                Undo::AccountCreated(addr) => {
                    self.accounts.remove(&addr);
                }
            }
        }
        if self.marks.is_empty() {
            self.journal.clear()
        }
        Ok(())
    }

    /// Discards the checkpoint without rolling back; outer snapshots keep
    /// the ability to revert across the committed span.
    pub fn commit(&mut self, id: SnapshotId) -> Result<(), StateError> {
        if id.0 >= self.marks.len() {
            return Err(StateError::SnapshotNotFound)
        }
        self.marks.truncate(id.0);
        if self.marks.is_empty() {
            self.journal.clear()
        }
        Ok(())
    }

    pub fn clear_modified(&mut self) {
        self.modified.clear()
    }

    /// Addresses written since the last [Self::clear_modified], in order.
    pub fn modified_addresses(&self) -> impl Iterator<Item = &Addr> {
        self.modified.iter()
    }

    /// Live storage slots of an account, sorted by key.
    pub fn storage_pairs(&self, addr: &Addr) -> Vec<(Hash, U256)> {
        let mut pairs: Vec<(Hash, U256)> = self
            .accounts
            .get(addr)
            .map(|acc| {
                acc.storage.iter().map(|(k, v)| (k.clone(), *v)).collect()
            })
            .unwrap_or_default();
        pairs.sort();
        pairs
    }

    /// Content hash over the accounts written since [Self::clear_modified],
    /// in address order: the commitment published as a header's state root.
    pub fn modified_root(&self) -> Hash {
        let mut s = rlp::RlpStream::new_list(self.modified.len());
        for addr in &self.modified {
            match self.accounts.get(addr) {
                Some(acc) => {
                    let mut slots: Vec<(&Hash, &U256)> =
                        acc.storage.iter().collect();
                    slots.sort();
                    s.begin_list(5);
                    s.append(addr);
                    s.append(&acc.nonce);
                    s.append(&acc.balance);
                    s.append(&Hash::digest(acc.code.as_bytes()));
                    s.begin_list(slots.len());
                    for (k, v) in slots {
                        s.begin_list(2);
                        s.append(k);
                        s.append(&U256Rlp(*v));
                    }
                }
                None => {
                    // written then reverted away; commit to its absence
                    s.begin_list(1);
                    s.append(addr);
                }
            }
        }
        Hash::digest(&s.out())
    }
}

impl Default for WorldState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn addr(n: u8) -> Addr {
        Addr::from_slice(&[n; 20])
    }

    fn key(n: u8) -> Hash {
        Hash::from_slice(&[n; 32])
    }

    #[test]
    fn balances_checked_both_ways() {
        let mut w = WorldState::new();
        let a = addr(1);
        assert!(w.add_balance(&a, &Wei::from(100u64)).is_ok());
        assert_eq!(
            w.sub_balance(&a, &Wei::from(101u64)),
            Err(StateError::InsufficientBalance)
        );
        assert_eq!(
            w.add_balance(&a, &Wei::from(U256::MAX)),
            Err(StateError::BalanceOverflow)
        );
        assert_eq!(w.get_balance(&a), Wei::from(100u64));
    }

    #[test]
    fn storage_zero_deletes_slot() {
        let mut w = WorldState::new();
        let a = addr(1);
        w.set_storage(&a, &key(1), &42.into());
        assert!(w.has_storage_entry(&a, &key(1)));
        w.set_storage(&a, &key(1), &U256::zero());
        assert_eq!(w.get_storage(&a, &key(1)), U256::zero());
        assert!(!w.has_storage_entry(&a, &key(1)));
    }

    #[test]
    fn revert_restores_exact_state() {
        let mut w = WorldState::new();
        let (a, b) = (addr(1), addr(2));
        w.add_balance(&a, &Wei::from(50u64)).unwrap();
        w.set_storage(&a, &key(1), &7.into());
        w.set_code(&a, &[0x60, 0x00]);

        let snap = w.snapshot();
        w.transfer_balance(&a, &b, &Wei::from(20u64)).unwrap();
        w.set_storage(&a, &key(1), &U256::zero());
        w.set_storage(&a, &key(2), &9.into());
        w.set_code(&b, &[0x00]);
        w.increment_nonce(&a);
        w.revert(snap).unwrap();

        assert_eq!(w.get_balance(&a), Wei::from(50u64));
        assert_eq!(w.get_balance(&b), Wei::zero().clone());
        assert!(!w.exists(&b));
        assert_eq!(w.get_storage(&a, &key(1)), 7.into());
        assert!(!w.has_storage_entry(&a, &key(2)));
        assert_eq!(w.get_nonce(&a), 0);
        assert_eq!(w.get_code(&a).as_bytes(), &[0x60, 0x00]);
    }

    #[test]
    fn commit_keeps_mutations_and_outer_can_still_revert() {
        let mut w = WorldState::new();
        let a = addr(1);
        w.add_balance(&a, &Wei::from(10u64)).unwrap();

        let outer = w.snapshot();
        w.add_balance(&a, &Wei::from(1u64)).unwrap();
        let inner = w.snapshot();
        w.add_balance(&a, &Wei::from(2u64)).unwrap();
        w.commit(inner).unwrap();
        assert_eq!(w.get_balance(&a), Wei::from(13u64));

        w.revert(outer).unwrap();
        assert_eq!(w.get_balance(&a), Wei::from(10u64));
    }

    #[test]
    fn revert_invalidates_later_snapshots_and_ids_are_reusable() {
        let mut w = WorldState::new();
        let a = addr(1);
        let s0 = w.snapshot();
        let s1 = w.snapshot();
        w.add_balance(&a, &Wei::from(5u64)).unwrap();
        w.revert(s0).unwrap();
        assert_eq!(w.revert(s1), Err(StateError::SnapshotNotFound));
        assert_eq!(w.commit(s0), Err(StateError::SnapshotNotFound));
        // the id slot can be taken again
        let s0b = w.snapshot();
        assert_eq!(s0b, s0);
        w.add_balance(&a, &Wei::from(5u64)).unwrap();
        w.revert(s0b).unwrap();
        assert!(!w.exists(&a));
    }

    #[test]
    fn snapshot_commit_is_noop_on_observable_state() {
        let mut w = WorldState::new();
        let a = addr(9);
        w.add_balance(&a, &Wei::from(3u64)).unwrap();
        let root_before = {
            w.clear_modified();
            w.add_balance(&a, &Wei::from(0u64)).unwrap();
            w.modified_root()
        };
        let s = w.snapshot();
        w.commit(s).unwrap();
        assert_eq!(w.modified_root(), root_before);
        assert_eq!(w.get_balance(&a), Wei::from(3u64));
    }

    #[test]
    fn modified_root_is_deterministic() {
        let build = || {
            let mut w = WorldState::new();
            let a = Addr::from_str("0x6ac7ea33f8831ea9dcc53393aaa88b25a785dbf0")
                .unwrap();
            w.add_balance(&a, &Wei::from(7u64)).unwrap();
            w.set_storage(&a, &key(3), &4.into());
            w.set_storage(&a, &key(1), &2.into());
            w.modified_root()
        };
        assert_eq!(build(), build());
    }
}
