use once_cell::sync::OnceCell;

use super::params::*;
use super::VmError;
use crate::common::{Gas, U256};

/// Byte-addressable frame memory. Grows monotonically in 32-byte words and
/// charges the quadratic expansion fee on growth; reads past the high-water
/// mark expand the space (zero-filled) just like writes.
pub struct Memory {
    space: Vec<u8>,
    charged: Gas,
}

impl Memory {
    #[inline(always)]
    fn max_size() -> &'static U256 {
        static V: OnceCell<U256> = OnceCell::new();
        V.get_or_init(|| MAX_MEM_SIZE.into())
    }

    /// Number of 32-byte words needed to hold `size` bytes.
    #[inline(always)]
    pub fn to_word_size(size: u64) -> u64 {
        if size > u64::MAX - 31 {
            (u64::MAX >> 5) + 1
        } else {
            (size + 31) >> 5
        }
    }

    pub fn new() -> Self {
        Self {
            space: Vec::new(),
            charged: 0,
        }
    }

    /// Grows memory to cover `size` bytes and returns the incremental
    /// expansion fee (zero when no growth happens).
    #[inline(always)]
    pub fn expand(&mut self, size: U256) -> Result<Gas, VmError> {
        if &size > Self::max_size() {
            return Err(VmError::OutOfMemory)
        }
        let size64 = size.as_u64();
        Ok(if size64 > self.space.len() as u64 {
            let words = Self::to_word_size(size64);
            let new_size = (words << 5) as usize;
            self.space.resize(new_size, 0);
            let total =
                words * GAS_MEM_RESIZE_WORD + words * words / QUAD_COEF_DIV;
            let fee = total - self.charged;
            self.charged = total;
            fee
        } else {
            0
        })
    }

    #[inline(always)]
    pub fn slice_mut(
        &mut self, off: U256, len: U256,
    ) -> Result<(&mut [u8], Gas), VmError> {
        let end = off.checked_add(len).ok_or(VmError::OutOfMemory)?;
        self.expand(end)
            .map(|gas| (&mut self.space[off.as_usize()..end.as_usize()], gas))
    }

    #[inline(always)]
    pub fn slice(
        &mut self, off: U256, len: U256,
    ) -> Result<(&[u8], Gas), VmError> {
        self.slice_mut(off, len).map(|e| (&*e.0, e.1))
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.space.len()
    }

    /// Copies `data` into `[off, off+len)`, truncating to the shorter of the
    /// two ranges.
    #[inline(always)]
    pub fn set(
        &mut self, off: U256, len: U256, data: &[u8],
    ) -> Result<Gas, VmError> {
        let (slice, gas) = self.slice_mut(off, len)?;
        let n = std::cmp::min(slice.len(), data.len());
        slice[..n].copy_from_slice(&data[..n]);
        Ok(gas)
    }
}
