//! Basic value types shared by every layer: 20-byte addresses, 32-byte
//! hashes, 256-bit balances and the byte buffers that travel between them.
//!
//! All of the wrappers are thin newtypes over [primitive_types] so the
//! arithmetic-heavy code (the VM ALU) can work on [U256] directly while the
//! rest of the system keeps the distinct domain types apart.

use bitvec::vec::BitVec;
use hex::{FromHex, ToHex};
use once_cell::sync::OnceCell;
pub use primitive_types::U256;
use primitive_types::{H160, H256};
use serde::de::{self, Deserialize, Deserializer, Visitor};
use sha3::Digest;

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// Gas is counted in plain 64-bit units.
pub type Gas = u64;

/// An account balance or transferred value (balances are checked, never
/// wrapped).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct Wei(U256);

/// A 20-byte account address.
#[derive(Clone, PartialEq, Eq, Hash, Default, Debug, PartialOrd, Ord)]
pub struct Addr(H160);

/// A 32-byte content hash (keccak-256 everywhere in this crate).
#[derive(Clone, PartialEq, Eq, Hash, Default, Debug, PartialOrd, Ord)]
pub struct Hash(H256);

/// An owned, hex-printable byte buffer.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Bytes(Vec<u8>);

// Wei

impl Wei {
    #[inline(always)]
    pub fn checked_add(&self, other: &Wei) -> Option<Wei> {
        Some(Wei(self.0.checked_add(other.0)?))
    }

    #[inline(always)]
    pub fn checked_sub(&self, other: &Wei) -> Option<Wei> {
        Some(Wei(self.0.checked_sub(other.0)?))
    }

    #[inline(always)]
    pub fn checked_mul(&self, other: &Wei) -> Option<Wei> {
        Some(Wei(self.0.checked_mul(other.0)?))
    }

    #[inline]
    pub fn zero() -> &'static Self {
        static V: OnceCell<Wei> = OnceCell::new();
        V.get_or_init(|| U256::zero().into())
    }

    #[inline(always)]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<U256> for Wei {
    fn from(u: U256) -> Self {
        Self(u)
    }
}

impl From<u64> for Wei {
    fn from(u: u64) -> Self {
        Self(u.into())
    }
}

impl From<Wei> for U256 {
    fn from(w: Wei) -> Self {
        w.0
    }
}

impl AsRef<U256> for Wei {
    fn as_ref(&self) -> &U256 {
        &self.0
    }
}

impl FromStr for Wei {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(Self(U256::from_str(s).map_err(|_| ())?))
    }
}

impl fmt::Display for Wei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::LowerHex for Wei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl<'de> Deserialize<'de> for Wei {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(deserializer.deserialize_identifier(U256Visitor)?.into())
    }
}

// Addr

impl Addr {
    #[inline]
    pub fn zero() -> &'static Self {
        static V: OnceCell<Addr> = OnceCell::new();
        V.get_or_init(|| U256::zero().into())
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    #[inline(always)]
    pub fn from_slice(s: &[u8]) -> Self {
        Self(H160::from_slice(s))
    }

    /// Lower-case hex rendering without a `0x` prefix, as used by the
    /// storage key scheme.
    #[inline]
    pub fn to_key_hex(&self) -> String {
        self.as_bytes().encode_hex()
    }
}

impl From<U256> for Addr {
    fn from(u: U256) -> Self {
        let mut bytes: [u8; 32] = Default::default();
        u.to_big_endian(&mut bytes);
        Self::from_slice(&bytes[12..])
    }
}

impl From<[u8; 20]> for Addr {
    fn from(bytes: [u8; 20]) -> Self {
        Self(H160(bytes))
    }
}

impl From<Addr> for U256 {
    fn from(addr: Addr) -> Self {
        U256::from_big_endian(addr.as_bytes())
    }
}

impl FromStr for Addr {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(Self(H160::from_str(s).map_err(|_| ())?))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<'de> Deserialize<'de> for Addr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let bytes = deserializer.deserialize_identifier(BytesVisitor)?.0;
        if bytes.len() != 20 {
            return Err(D::Error::invalid_length(
                bytes.len(),
                &"length of 20 bytes",
            ))
        }
        Ok(Addr::from_slice(&bytes))
    }
}

// Hash

impl Hash {
    /// Keccak-256 of the given bytes; the one hash function used for block,
    /// transaction and state identity.
    #[inline(always)]
    pub fn digest(slice: &[u8]) -> Self {
        Self::from_slice(sha3::Keccak256::digest(slice).as_slice())
    }

    #[inline]
    pub fn zero() -> &'static Self {
        static V: OnceCell<Hash> = OnceCell::new();
        V.get_or_init(|| Self(H256::zero()))
    }

    #[inline(always)]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    #[inline(always)]
    pub fn from_slice(s: &[u8]) -> Self {
        Self(H256::from_slice(s))
    }

    #[inline]
    pub fn to_fixed_bytes(self) -> [u8; 32] {
        self.0.to_fixed_bytes()
    }

    #[inline]
    pub fn to_key_hex(&self) -> String {
        self.as_bytes().encode_hex()
    }
}

impl From<[u8; 32]> for Hash {
    fn from(u: [u8; 32]) -> Self {
        Self(u.into())
    }
}

impl From<U256> for Hash {
    fn from(u: U256) -> Self {
        let mut bytes: [u8; 32] = Default::default();
        u.to_big_endian(&mut bytes);
        Self::from_slice(&bytes)
    }
}

impl From<Hash> for U256 {
    fn from(hash: Hash) -> Self {
        U256::from_big_endian(hash.as_bytes())
    }
}

impl FromStr for Hash {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(Self(H256::from_str(s).map_err(|_| ())?))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// Bytes

impl Bytes {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&[u8]> for Bytes {
    fn from(s: &[u8]) -> Self {
        Self(s.into())
    }
}

impl Deref for Bytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "{}", self.0.encode_hex::<String>())
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "0x{}", self.0.encode_hex::<String>())
    }
}

impl rlp::Encodable for Bytes {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.encoder().encode_value(self)
    }
}

impl rlp::Decodable for Bytes {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        rlp.decoder().decode_value(|bytes| Ok(Self(bytes.to_vec())))
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_identifier(BytesVisitor)
    }
}

/// An address slot that may be vacant on the wire (`to` of a contract
/// creation encodes as the empty byte string).
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct NullableAddr(pub Option<Addr>);

impl rlp::Decodable for NullableAddr {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        rlp.decoder().decode_value(|bytes| {
            if bytes.is_empty() {
                Ok(NullableAddr(None))
            } else {
                match bytes.len().cmp(&20) {
                    core::cmp::Ordering::Less => {
                        Err(rlp::DecoderError::RlpIsTooShort)
                    }
                    core::cmp::Ordering::Greater => {
                        Err(rlp::DecoderError::RlpIsTooBig)
                    }
                    core::cmp::Ordering::Equal => {
                        let mut t = [0u8; 20];
                        t.copy_from_slice(bytes);
                        Ok(Self(Some(t.into())))
                    }
                }
            }
        })
    }
}

impl rlp::Encodable for NullableAddr {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.encoder().encode_value(match &self.0 {
            Some(addr) => addr.as_bytes(),
            None => &[],
        });
    }
}

// NOTE: adapted from https://docs.rs/impl-rlp/latest/src/impl_rlp/lib.rs.html
macro_rules! impl_wrapped_uint_rlp {
    ($name: ident, $wrapper_name: ident, $size: expr) => {
        impl rlp::Encodable for $wrapper_name {
            fn rlp_append(&self, s: &mut rlp::RlpStream) {
                let leading_empty_bytes = $size * 8 - (self.0.bits() + 7) / 8;
                let mut buffer = [0u8; $size * 8];
                self.0.to_big_endian(&mut buffer);
                s.encoder().encode_value(&buffer[leading_empty_bytes..]);
            }
        }

        impl rlp::Decodable for $wrapper_name {
            fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
                rlp.decoder().decode_value(|bytes| {
                    if !bytes.is_empty() && bytes[0] == 0 {
                        Err(rlp::DecoderError::RlpInvalidIndirection)
                    } else if bytes.len() <= $size * 8 {
                        Ok($wrapper_name($name::from(bytes)))
                    } else {
                        Err(rlp::DecoderError::RlpIsTooBig)
                    }
                })
            }
        }
    };
}

// NOTE: adapted from https://docs.rs/impl-rlp/latest/src/impl_rlp/lib.rs.html
macro_rules! impl_wrapped_fixed_hash_rlp {
    ($name: ident, $wrapper_name: ident, $size: expr) => {
        impl rlp::Encodable for $wrapper_name {
            fn rlp_append(&self, s: &mut rlp::RlpStream) {
                s.encoder().encode_value(self.0.as_ref());
            }
        }

        impl rlp::Decodable for $wrapper_name {
            fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
                rlp.decoder().decode_value(|bytes| {
                    match bytes.len().cmp(&$size) {
                        core::cmp::Ordering::Less => {
                            Err(rlp::DecoderError::RlpIsTooShort)
                        }
                        core::cmp::Ordering::Greater => {
                            Err(rlp::DecoderError::RlpIsTooBig)
                        }
                        core::cmp::Ordering::Equal => {
                            let mut t = [0u8; $size];
                            t.copy_from_slice(bytes);
                            Ok($wrapper_name($name(t)))
                        }
                    }
                })
            }
        }
    };
}

impl_wrapped_uint_rlp!(U256, Wei, 4);
impl_wrapped_fixed_hash_rlp!(H160, Addr, 20);
impl_wrapped_fixed_hash_rlp!(H256, Hash, 32);

/// A plain [U256] carried through RLP as a minimal big-endian byte string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct U256Rlp(pub U256);
impl_wrapped_uint_rlp!(U256, U256Rlp, 4);

/// The deterministic contract address for a creation by `addr` at `nonce`:
/// the last 20 bytes of keccak(rlp([sender, nonce])).
pub fn create_addr(addr: &Addr, nonce: u64) -> Addr {
    let mut rlp_encoded = rlp::RlpStream::new_list(2);
    rlp_encoded.append(&addr.as_bytes()).append(&nonce);
    let rlp_encoded = rlp_encoded.out();
    Addr::from_slice(&sha3::Keccak256::digest(rlp_encoded).as_slice()[12..])
}

#[test]
fn test_create_addr() {
    let addr0 =
        Addr::from_str("0x6ac7ea33f8831ea9dcc53393aaa88b25a785dbf0").unwrap();
    assert_eq!(
        create_addr(&addr0, 0),
        Addr::from_str("0xcd234a471b72ba2f1ccf0a70fcaba648a5eecd8d").unwrap()
    );
    assert_eq!(
        create_addr(&addr0, 1),
        Addr::from_str("0x343c43a37d37dff08ae8c4a11544c718abb4fcf8").unwrap()
    );
}

/// Marks which byte offsets of `code` hold an opcode (as opposed to PUSH
/// immediate data). Jump validation consults this so a JUMPDEST byte inside
/// PUSH data is not a valid target.
pub fn gen_code_bitmap(code: &[u8]) -> BitVec {
    let mut bitmap = BitVec::repeat(false, code.len());
    let mut nskip = 0;
    for (i, b) in code.iter().enumerate() {
        if nskip > 0 {
            nskip -= 1;
            continue
        }
        bitmap.set(i, true);
        match b {
            0x60..=0x7f => nskip = b - 0x60 + 1,
            _ => (),
        }
    }
    bitmap
}

#[inline(always)]
pub fn checked_as_u64(x: &U256) -> Option<u64> {
    if x > &u64::MAX.into() {
        None
    } else {
        Some(x.as_u64())
    }
}

pub struct BytesVisitor;
impl<'de> Visitor<'de> for BytesVisitor {
    type Value = Bytes;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .write_str("starts with `0x` and has even number of hex digits")
    }

    fn visit_str<E>(self, value: &str) -> Result<Bytes, E>
    where
        E: de::Error,
    {
        if value.len() < 2 {
            return Err(de::Error::invalid_length(value.len(), &self))
        }
        let bytes = value.as_bytes();
        if bytes[0] == b'0' && (bytes[1] == b'x' || bytes[1] == b'X') {
            match Vec::from_hex(&value[2..]) {
                Ok(v) => Ok(v.into()),
                Err(_) => Err(de::Error::invalid_value(
                    de::Unexpected::Str(value),
                    &self,
                )),
            }
        } else {
            Err(de::Error::invalid_value(de::Unexpected::Str(value), &self))
        }
    }
}

pub struct U256Visitor;

impl<'de> Visitor<'de> for U256Visitor {
    type Value = U256;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .write_str("a string that starts with `0x` and has hex digits")
    }

    fn visit_str<E>(self, value: &str) -> Result<U256, E>
    where
        E: de::Error,
    {
        U256::from_str(value).map_err(|_| {
            de::Error::invalid_value(de::Unexpected::Str(value), &self)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_bitmap_skips_push_data() {
        // PUSH2 0x5b5b JUMPDEST
        let code = hex::decode("615b5b5b").unwrap();
        let bitmap = gen_code_bitmap(&code);
        assert!(bitmap[0]);
        assert!(!bitmap[1]);
        assert!(!bitmap[2]);
        assert!(bitmap[3]);
    }

    #[test]
    fn nullable_addr_roundtrip() {
        let some = NullableAddr(Some(
            Addr::from_str("0x6ac7ea33f8831ea9dcc53393aaa88b25a785dbf0")
                .unwrap(),
        ));
        let none = NullableAddr(None);
        for v in [some, none] {
            let enc = rlp::encode(&v);
            assert_eq!(rlp::decode::<NullableAddr>(&enc).unwrap(), v);
        }
    }

    #[test]
    fn wei_checked_math() {
        let one = Wei::from(1u64);
        assert_eq!(Wei::zero().checked_sub(&one), None);
        assert_eq!(one.checked_add(&one), Some(Wei::from(2u64)));
        assert_eq!(Wei::from(U256::MAX).checked_add(&one), None);
    }
}
