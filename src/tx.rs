//! Transactions and their canonical encoding.
//!
//! A transaction is identified everywhere (pool, block body, store indexes)
//! by the keccak hash of its RLP encoding. Field order on the wire:
//! `[from, to, value, gasLimit, gasPrice, nonce, data]`, with `from`
//! zero-padded when absent and `to` empty for contract creations.

use crate::common::{Addr, Bytes, Gas, Hash, NullableAddr, Wei};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub from: Option<Addr>,
    /// `None` makes this a contract creation.
    pub to: Option<Addr>,
    pub value: Wei,
    pub gas_limit: Gas,
    pub gas_price: Wei,
    pub nonce: u64,
    pub data: Bytes,
}

impl Transaction {
    pub fn is_create(&self) -> bool {
        self.to.is_none()
    }

    /// Maximum amount the sender can be charged: value plus the full gas
    /// budget at the offered price. `None` on 256-bit overflow.
    pub fn max_cost(&self) -> Option<Wei> {
        self.gas_price
            .checked_mul(&Wei::from(self.gas_limit))?
            .checked_add(&self.value)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut s = rlp::RlpStream::new_list(7);
        match &self.from {
            Some(addr) => s.append(addr),
            None => s.append(Addr::zero()),
        };
        s.append(&NullableAddr(self.to.clone()));
        s.append(&self.value);
        s.append(&self.gas_limit);
        s.append(&self.gas_price);
        s.append(&self.nonce);
        s.append(&self.data);
        s.out().to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, rlp::DecoderError> {
        let rlp = rlp::Rlp::new(bytes);
        if !rlp.is_list() || rlp.item_count()? != 7 {
            return Err(rlp::DecoderError::RlpIncorrectListLen)
        }
        let from: Addr = rlp.val_at(0)?;
        let to: NullableAddr = rlp.val_at(1)?;
        Ok(Self {
            // the zero padding of a vacant sender decodes back to vacancy
            from: if from == *Addr::zero() { None } else { Some(from) },
            to: to.0,
            value: rlp.val_at(2)?,
            gas_limit: rlp.val_at(3)?,
            gas_price: rlp.val_at(4)?,
            nonce: rlp.val_at(5)?,
            data: rlp.val_at(6)?,
        })
    }

    pub fn hash(&self) -> Hash {
        Hash::digest(&self.encode())
    }
}

impl rlp::Encodable for Transaction {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.append_raw(&self.encode(), 1);
    }
}

impl rlp::Decodable for Transaction {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        Self::decode(rlp.as_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn sample() -> Transaction {
        Transaction {
            from: Some(
                Addr::from_str("0x6ac7ea33f8831ea9dcc53393aaa88b25a785dbf0")
                    .unwrap(),
            ),
            to: Some(
                Addr::from_str("0xcd234a471b72ba2f1ccf0a70fcaba648a5eecd8d")
                    .unwrap(),
            ),
            value: Wei::from(1_000_000u64),
            gas_limit: 21000,
            gas_price: Wei::from(2u64),
            nonce: 7,
            data: Bytes::empty(),
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        for tx in [
            sample(),
            Transaction {
                to: None,
                data: vec![0x60, 0x00].into(),
                ..sample()
            },
            Transaction {
                from: None,
                ..sample()
            },
        ] {
            let enc = tx.encode();
            assert_eq!(Transaction::decode(&enc).unwrap(), tx);
        }
    }

    #[test]
    fn hash_is_deterministic_and_field_sensitive() {
        let a = sample();
        let mut b = sample();
        assert_eq!(a.hash(), b.hash());
        b.nonce += 1;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn max_cost_overflow_is_detected() {
        let mut tx = sample();
        tx.gas_price = Wei::from(crate::common::U256::MAX);
        assert!(tx.max_cost().is_none());
        assert_eq!(
            sample().max_cost().unwrap(),
            Wei::from(1_000_000u64 + 2 * 21000)
        );
    }

    #[test]
    fn garbage_rejected() {
        assert!(Transaction::decode(b"not rlp").is_err());
        // a 6-item list is not a transaction
        let mut s = rlp::RlpStream::new_list(6);
        for _ in 0..6 {
            s.append(&1u8);
        }
        assert!(Transaction::decode(&s.out()).is_err());
    }
}
