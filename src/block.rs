//! Blocks, headers, receipts and the canonical commitments over them.
//!
//! `transactionsRoot` and `receiptsRoot` are content hashes: keccak over the
//! RLP list of the canonical encodings of their inputs. Recomputing either
//! from the same inputs is bit-for-bit stable, which is all the fork-choice
//! and validation logic relies on.

use rlp_derive::{RlpDecodable, RlpEncodable};

use crate::common::{Addr, Bytes, Gas, Hash, NullableAddr};
use crate::core::LogEntry;
use crate::tx::Transaction;

/// Wire order: parentHash, number, timestamp, stateRoot, transactionsRoot,
/// receiptsRoot, validator, signature, gasLimit, gasUsed, extraData.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Header {
    pub parent_hash: Hash,
    pub number: u64,
    pub timestamp: u64,
    pub state_root: Hash,
    pub tx_root: Hash,
    pub receipts_root: Hash,
    pub validator: Addr,
    pub signature: Bytes,
    pub gas_limit: Gas,
    pub gas_used: Gas,
    pub extra_data: Bytes,
}

impl Header {
    /// Block identity: keccak of the full encoding, signature included.
    pub fn hash(&self) -> Hash {
        Hash::digest(&rlp::encode(self))
    }

    /// The bytes a validator signs: the header with the signature field
    /// emptied out.
    pub fn signing_hash(&self) -> Hash {
        let mut unsigned = self.clone();
        unsigned.signature = Bytes::empty();
        Hash::digest(&rlp::encode(&unsigned))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut s = rlp::RlpStream::new_list(2);
        s.append(&self.header);
        s.begin_list(self.transactions.len());
        for tx in &self.transactions {
            s.append(tx);
        }
        s.out().to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, rlp::DecoderError> {
        let rlp = rlp::Rlp::new(bytes);
        if !rlp.is_list() || rlp.item_count()? != 2 {
            return Err(rlp::DecoderError::RlpIncorrectListLen)
        }
        let header: Header = rlp.val_at(0)?;
        let txs = rlp.at(1)?;
        let mut transactions = Vec::with_capacity(txs.item_count()?);
        for i in 0..txs.item_count()? {
            transactions.push(txs.val_at(i)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

/// The structured result of one transaction inside a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: Hash,
    pub block_number: u64,
    pub gas_used: Gas,
    pub cumulative_gas_used: Gas,
    /// Set for successful contract creations.
    pub contract_address: Option<Addr>,
    pub logs: Vec<LogEntry>,
    /// 1 for success, 0 for a failed (but included) execution.
    pub status: u8,
}

impl rlp::Encodable for LogEntry {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(3);
        s.append(&self.address);
        s.begin_list(self.topics.len());
        for t in &self.topics {
            s.append(t);
        }
        s.append(&self.data);
    }
}

impl rlp::Decodable for LogEntry {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        if rlp.item_count()? != 3 {
            return Err(rlp::DecoderError::RlpIncorrectListLen)
        }
        let topics_rlp = rlp.at(1)?;
        let mut topics = Vec::with_capacity(topics_rlp.item_count()?);
        for i in 0..topics_rlp.item_count()? {
            topics.push(topics_rlp.val_at(i)?);
        }
        Ok(Self {
            address: rlp.val_at(0)?,
            topics,
            data: rlp.val_at(2)?,
        })
    }
}

impl rlp::Encodable for Receipt {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(7);
        s.append(&self.tx_hash);
        s.append(&self.block_number);
        s.append(&self.gas_used);
        s.append(&self.cumulative_gas_used);
        s.append(&NullableAddr(self.contract_address.clone()));
        s.begin_list(self.logs.len());
        for log in &self.logs {
            s.append(log);
        }
        s.append(&self.status);
    }
}

impl rlp::Decodable for Receipt {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        if rlp.item_count()? != 7 {
            return Err(rlp::DecoderError::RlpIncorrectListLen)
        }
        let contract: NullableAddr = rlp.val_at(4)?;
        let logs_rlp = rlp.at(5)?;
        let mut logs = Vec::with_capacity(logs_rlp.item_count()?);
        for i in 0..logs_rlp.item_count()? {
            logs.push(logs_rlp.val_at(i)?);
        }
        Ok(Self {
            tx_hash: rlp.val_at(0)?,
            block_number: rlp.val_at(1)?,
            gas_used: rlp.val_at(2)?,
            cumulative_gas_used: rlp.val_at(3)?,
            contract_address: contract.0,
            logs,
            status: rlp.val_at(6)?,
        })
    }
}

/// keccak over the RLP list of the canonical transaction encodings.
pub fn transactions_root(txs: &[Transaction]) -> Hash {
    let mut s = rlp::RlpStream::new_list(txs.len());
    for tx in txs {
        s.append(tx);
    }
    Hash::digest(&s.out())
}

/// keccak over the RLP list of the canonical receipt encodings.
pub fn receipts_root(receipts: &[Receipt]) -> Hash {
    let mut s = rlp::RlpStream::new_list(receipts.len());
    for r in receipts {
        s.append(r);
    }
    Hash::digest(&s.out())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Bytes, Wei};

    fn header() -> Header {
        Header {
            parent_hash: Hash::from_slice(&[1; 32]),
            number: 5,
            timestamp: 1_700_000_000,
            state_root: Hash::from_slice(&[2; 32]),
            tx_root: Hash::from_slice(&[3; 32]),
            receipts_root: Hash::from_slice(&[4; 32]),
            validator: Addr::from_slice(&[5; 20]),
            signature: vec![0xde, 0xad].into(),
            gas_limit: 8_000_000,
            gas_used: 21000,
            extra_data: Bytes::empty(),
        }
    }

    fn tx(nonce: u64) -> Transaction {
        Transaction {
            from: Some(Addr::from_slice(&[9; 20])),
            to: Some(Addr::from_slice(&[8; 20])),
            value: Wei::from(1u64),
            gas_limit: 21000,
            gas_price: Wei::from(1u64),
            nonce,
            data: Bytes::empty(),
        }
    }

    #[test]
    fn header_roundtrip_is_byte_identical() {
        let h = header();
        let enc = rlp::encode(&h);
        let dec: Header = rlp::decode(&enc).unwrap();
        assert_eq!(dec, h);
        assert_eq!(rlp::encode(&dec), enc);
    }

    #[test]
    fn header_hash_covers_signature_but_signing_hash_does_not() {
        let a = header();
        let mut b = header();
        b.signature = vec![0xff].into();
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.signing_hash(), b.signing_hash());
        let mut c = header();
        c.gas_used += 1;
        assert_ne!(a.signing_hash(), c.signing_hash());
    }

    #[test]
    fn block_roundtrip() {
        let b = Block {
            header: header(),
            transactions: vec![tx(0), tx(1)],
        };
        assert_eq!(Block::decode(&b.encode()).unwrap(), b);
    }

    #[test]
    fn roots_are_pure_functions_of_inputs() {
        let txs = vec![tx(0), tx(1)];
        assert_eq!(transactions_root(&txs), transactions_root(&txs.clone()));
        assert_ne!(transactions_root(&txs), transactions_root(&txs[..1]));
        assert_ne!(transactions_root(&[]), *Hash::zero());

        let r = Receipt {
            tx_hash: tx(0).hash(),
            block_number: 5,
            gas_used: 21000,
            cumulative_gas_used: 21000,
            contract_address: None,
            logs: vec![LogEntry {
                address: Addr::from_slice(&[7; 20]),
                topics: vec![Hash::from_slice(&[1; 32])],
                data: vec![1, 2, 3].into(),
            }],
            status: 1,
        };
        assert_eq!(receipts_root(&[r.clone()]), receipts_root(&[r.clone()]));
        let enc = rlp::encode(&r);
        assert_eq!(rlp::decode::<Receipt>(&enc).unwrap(), r);
    }
}
