//! Proof-of-authority consensus: an ordered validator set rotated
//! round-robin by block height, with liveness accounting that benches
//! validators who keep missing their slots.
//!
//! Signatures here are presence-and-derivation checks only: a signed header
//! carries the keccak digest of its unsigned encoding. The chain trusts its
//! configured authority set; what the signature buys is determinism and a
//! non-empty commitment to the exact header bytes.

use log::{info, warn};

use crate::block::Header;
use crate::common::{Addr, Hash};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    UnknownValidator,
    DuplicateValidator,
    NoActiveValidators,
    WrongValidator { expected: Addr, got: Addr },
    TimestampTooEarly,
    TimestampTooLate,
    MissingSignature,
    BadSignature,
}

/// Fork-choice verdict for a block arriving on top of the current tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkChoice {
    /// Not better than what we have (or ambiguous at equal height).
    Ignore,
    /// Direct child of the tip.
    Extend,
    /// Strictly longer chain on a different ancestry; the caller walks back
    /// to the common ancestor.
    Reorg,
}

#[derive(Debug, Clone)]
pub struct Validator {
    pub address: Addr,
    pub active: bool,
    pub missed_blocks: u32,
    pub last_block: u64,
}

pub struct PoaConsensus {
    validators: Vec<Validator>,
    /// Missed-slot count at which a validator is benched.
    inactivity_threshold: u32,
    /// Minimum parent-to-child timestamp spacing in seconds.
    block_time: u64,
}

/// Allowed clock drift into the future for received headers, seconds.
const MAX_CLOCK_DRIFT: u64 = 60;

impl PoaConsensus {
    pub fn new(
        validators: Vec<Addr>, block_time: u64, inactivity_threshold: u32,
    ) -> Self {
        Self {
            validators: validators
                .into_iter()
                .map(|address| Validator {
                    address,
                    active: true,
                    missed_blocks: 0,
                    last_block: 0,
                })
                .collect(),
            inactivity_threshold,
            block_time,
        }
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    fn active_validators(&self) -> Vec<&Validator> {
        self.validators
            .iter()
            .filter(|v| v.active && v.missed_blocks < self.inactivity_threshold)
            .collect()
    }

    /// The validator whose slot block `number` is: round-robin over the
    /// active set. `None` when every validator is benched.
    pub fn expected_validator(&self, number: u64) -> Option<Addr> {
        let active = self.active_validators();
        if active.is_empty() {
            return None
        }
        let idx = (number % active.len() as u64) as usize;
        Some(active[idx].address.clone())
    }

    /// The producer for the next block at height `number`.
    pub fn next_validator(&self, number: u64) -> Option<Addr> {
        self.expected_validator(number)
    }

    /// Fills in the mock signature: the keccak digest of the header with an
    /// empty signature field.
    pub fn sign_header(&self, header: &mut Header) {
        header.signature =
            header.signing_hash().as_bytes().to_vec().into();
    }

    /// Header rules for a received (non-genesis) block: right validator for
    /// the slot, sane timestamps, and a signature that is present and
    /// derived from the header bytes.
    pub fn validate_header(
        &self, header: &Header, parent: &Header, now: u64,
    ) -> Result<(), ConsensusError> {
        let expected = self
            .expected_validator(header.number)
            .ok_or(ConsensusError::NoActiveValidators)?;
        if header.validator != expected {
            return Err(ConsensusError::WrongValidator {
                expected,
                got: header.validator.clone(),
            })
        }
        if header.timestamp <= parent.timestamp
            || header.timestamp - parent.timestamp < self.block_time
        {
            return Err(ConsensusError::TimestampTooEarly)
        }
        if header.timestamp > now + MAX_CLOCK_DRIFT {
            return Err(ConsensusError::TimestampTooLate)
        }
        if header.signature.is_empty() {
            return Err(ConsensusError::MissingSignature)
        }
        if &header.signature[..] != header.signing_hash().as_bytes() {
            return Err(ConsensusError::BadSignature)
        }
        Ok(())
    }

    /// Liveness bookkeeping for an accepted block: the producer's counters
    /// reset; the validator whose slot it actually was (when different)
    /// takes a missed-block strike, and is benched at the threshold.
    pub fn update_validator_state(&mut self, header: &Header) {
        if let Some(expected) = self.expected_validator(header.number) {
            if expected != header.validator {
                let threshold = self.inactivity_threshold;
                if let Some(v) = self.find_mut(&expected) {
                    v.missed_blocks += 1;
                    warn!(
                        "validator {} missed slot {} ({} strikes)",
                        v.address, header.number, v.missed_blocks
                    );
                    if v.missed_blocks >= threshold && v.active {
                        v.active = false;
                        info!("validator {} deactivated", v.address);
                    }
                }
            }
        }
        let number = header.number;
        if let Some(v) = self.find_mut(&header.validator.clone()) {
            v.missed_blocks = 0;
            v.last_block = number;
        }
    }

    fn find_mut(&mut self, addr: &Addr) -> Option<&mut Validator> {
        self.validators.iter_mut().find(|v| &v.address == addr)
    }

    pub fn add_validator(&mut self, addr: Addr) -> Result<(), ConsensusError> {
        if self.validators.iter().any(|v| v.address == addr) {
            return Err(ConsensusError::DuplicateValidator)
        }
        self.validators.push(Validator {
            address: addr,
            active: true,
            missed_blocks: 0,
            last_block: 0,
        });
        Ok(())
    }

    pub fn remove_validator(
        &mut self, addr: &Addr,
    ) -> Result<(), ConsensusError> {
        let before = self.validators.len();
        self.validators.retain(|v| &v.address != addr);
        if self.validators.len() == before {
            return Err(ConsensusError::UnknownValidator)
        }
        Ok(())
    }

    /// Fork choice for `new` against the current `tip` (with `tip_hash` its
    /// header hash).
    pub fn should_reorg(
        &self, new: &Header, tip: &Header, tip_hash: &Hash,
    ) -> ForkChoice {
        if new.number <= tip.number {
            ForkChoice::Ignore
        } else if &new.parent_hash == tip_hash {
            ForkChoice::Extend
        } else if new.number == tip.number + 1 {
            // same height ancestry fork, nothing to prefer
            ForkChoice::Ignore
        } else {
            ForkChoice::Reorg
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Bytes, Hash};

    fn addr(n: u8) -> Addr {
        Addr::from_slice(&[n; 20])
    }

    fn three() -> PoaConsensus {
        PoaConsensus::new(vec![addr(0), addr(1), addr(2)], 5, 2)
    }

    fn header(number: u64, timestamp: u64, validator: Addr) -> Header {
        Header {
            parent_hash: Hash::zero().clone(),
            number,
            timestamp,
            state_root: Hash::zero().clone(),
            tx_root: Hash::zero().clone(),
            receipts_root: Hash::zero().clone(),
            validator,
            signature: Bytes::empty(),
            gas_limit: 8_000_000,
            gas_used: 0,
            extra_data: Bytes::empty(),
        }
    }

    fn signed(mut h: Header, c: &PoaConsensus) -> Header {
        c.sign_header(&mut h);
        h
    }

    #[test]
    fn round_robin_over_active_set() {
        let c = three();
        assert_eq!(c.expected_validator(0), Some(addr(0)));
        assert_eq!(c.expected_validator(1), Some(addr(1)));
        assert_eq!(c.expected_validator(2), Some(addr(2)));
        assert_eq!(c.expected_validator(3), Some(addr(0)));
    }

    #[test]
    fn missed_slots_deactivate_after_threshold() {
        let mut c = three();
        // validator 1's slots (heights 1 and 4) produced by validator 0
        c.update_validator_state(&header(1, 10, addr(0)));
        assert_eq!(c.validators()[1].missed_blocks, 1);
        assert!(c.validators()[1].active);

        c.update_validator_state(&header(4, 40, addr(0)));
        assert_eq!(c.validators()[1].missed_blocks, 2);
        assert!(!c.validators()[1].active);

        // rotation never lands on the benched validator again
        for n in 0..20 {
            assert_ne!(c.next_validator(n), Some(addr(1)));
        }
    }

    #[test]
    fn producing_resets_strikes() {
        let mut c = three();
        c.update_validator_state(&header(1, 10, addr(0)));
        assert_eq!(c.validators()[1].missed_blocks, 1);
        c.update_validator_state(&header(4, 40, addr(1)));
        assert_eq!(c.validators()[1].missed_blocks, 0);
        assert_eq!(c.validators()[1].last_block, 4);
    }

    #[test]
    fn header_validation_rules() {
        let c = three();
        let parent = header(0, 100, addr(0));
        let now = 1000;

        let good = signed(header(1, 110, addr(1)), &c);
        assert!(c.validate_header(&good, &parent, now).is_ok());

        let wrong = signed(header(1, 110, addr(2)), &c);
        assert!(matches!(
            c.validate_header(&wrong, &parent, now),
            Err(ConsensusError::WrongValidator { .. })
        ));

        // spacing below block time
        let early = signed(header(1, 103, addr(1)), &c);
        assert_eq!(
            c.validate_header(&early, &parent, now),
            Err(ConsensusError::TimestampTooEarly)
        );
        let not_after = signed(header(1, 100, addr(1)), &c);
        assert_eq!(
            c.validate_header(&not_after, &parent, now),
            Err(ConsensusError::TimestampTooEarly)
        );
        let future = signed(header(1, now + 120, addr(1)), &c);
        assert_eq!(
            c.validate_header(&future, &parent, now),
            Err(ConsensusError::TimestampTooLate)
        );

        let unsigned = header(1, 110, addr(1));
        assert_eq!(
            c.validate_header(&unsigned, &parent, now),
            Err(ConsensusError::MissingSignature)
        );
        let mut forged = signed(header(1, 110, addr(1)), &c);
        forged.signature = vec![1, 2, 3].into();
        assert_eq!(
            c.validate_header(&forged, &parent, now),
            Err(ConsensusError::BadSignature)
        );
    }

    #[test]
    fn signature_is_a_function_of_header_bytes() {
        let c = three();
        let a = signed(header(1, 110, addr(1)), &c);
        let b = signed(header(1, 110, addr(1)), &c);
        assert_eq!(a.signature, b.signature);
        let other = signed(header(2, 120, addr(1)), &c);
        assert_ne!(a.signature, other.signature);
    }

    #[test]
    fn membership_management() {
        let mut c = three();
        assert_eq!(
            c.add_validator(addr(1)),
            Err(ConsensusError::DuplicateValidator)
        );
        assert!(c.add_validator(addr(9)).is_ok());
        assert!(c.remove_validator(&addr(9)).is_ok());
        assert_eq!(
            c.remove_validator(&addr(9)),
            Err(ConsensusError::UnknownValidator)
        );
    }

    #[test]
    fn fork_choice_table() {
        let c = three();
        let tip = header(5, 100, addr(2));
        let tip_hash = tip.hash();

        // not longer
        assert_eq!(
            c.should_reorg(&header(5, 110, addr(2)), &tip, &tip_hash),
            ForkChoice::Ignore
        );
        // direct child
        let mut child = header(6, 110, addr(0));
        child.parent_hash = tip_hash.clone();
        assert_eq!(
            c.should_reorg(&child, &tip, &tip_hash),
            ForkChoice::Extend
        );
        // same-height successor on a different parent
        let stranger = header(6, 110, addr(0));
        assert_eq!(
            c.should_reorg(&stranger, &tip, &tip_hash),
            ForkChoice::Ignore
        );
        // strictly longer chain
        assert_eq!(
            c.should_reorg(&header(7, 120, addr(1)), &tip, &tip_hash),
            ForkChoice::Reorg
        );
    }
}
