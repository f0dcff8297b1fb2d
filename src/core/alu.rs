//! The arithmetic/logic unit: every operation wraps modulo 2^256, division
//! and modulo by zero yield zero, and the `s*` variants reinterpret their
//! operands in two's complement.

use primitive_types::{U256, U512};

#[inline(always)]
pub fn add(a: U256, b: U256) -> U256 {
    a.overflowing_add(b).0
}

#[inline(always)]
pub fn sub(a: U256, b: U256) -> U256 {
    a.overflowing_sub(b).0
}

#[inline(always)]
pub fn mul(a: U256, b: U256) -> U256 {
    a.overflowing_mul(b).0
}

#[inline(always)]
pub fn div(a: U256, b: U256) -> U256 {
    match a.checked_div(b) {
        Some(r) => r,
        None => U256::zero(),
    }
}

/// Two's-complement negation.
#[inline(always)]
pub fn neg(a: U256) -> U256 {
    a.overflowing_sub(U256::one()).0 ^ U256::MAX
}

#[inline(always)]
pub fn sign_abs(x: U256) -> (bool, U256) {
    if x.bit(255) {
        (true, neg(x))
    } else {
        (false, x)
    }
}

#[inline(always)]
pub fn sdiv(a: U256, b: U256) -> U256 {
    let (a_sign, a_abs) = sign_abs(a);
    let (b_sign, b_abs) = sign_abs(b);
    match a_abs.checked_div(b_abs) {
        Some(r) => {
            if a_sign ^ b_sign {
                neg(r)
            } else {
                r
            }
        }
        None => U256::zero(),
    }
}

#[inline(always)]
pub fn rem(a: U256, b: U256) -> U256 {
    match a.checked_rem(b) {
        Some(r) => r,
        None => U256::zero(),
    }
}

/// Signed remainder: same sign as the dividend, `a - b * sdiv(a, b)`.
#[inline(always)]
pub fn smod(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::zero()
    }
    let q = sdiv(a, b);
    a.overflowing_sub(b.overflowing_mul(q).0).0
}

#[inline(always)]
pub fn add_mod(a: U256, b: U256, n: U256) -> U256 {
    let a: U512 = a.into();
    let b: U512 = b.into();
    match (a + b).checked_rem(n.into()) {
        Some(r) => U256::try_from(r).unwrap_or_else(|_| U256::zero()),
        None => U256::zero(),
    }
}

#[inline(always)]
pub fn mul_mod(a: U256, b: U256, n: U256) -> U256 {
    let a: U512 = a.into();
    let b: U512 = b.into();
    match (a * b).checked_rem(n.into()) {
        Some(r) => U256::try_from(r).unwrap_or_else(|_| U256::zero()),
        None => U256::zero(),
    }
}

/// `base^exp mod 2^256` by square-and-multiply.
#[inline(always)]
pub fn exp(a: U256, b: U256) -> U256 {
    a.overflowing_pow(b).0
}

/// Extends the sign bit of the value whose most significant retained byte is
/// byte `back` (0-based from the low end).
#[inline(always)]
pub fn sign_extend(mut back: U256, x: U256) -> U256 {
    let maxb: U256 = 31.into();
    if back > maxb {
        back = maxb
    }
    let shift: usize = (back.as_u32() as usize + 1) << 3;
    if x.bit(shift - 1) {
        let mask: U256 = (U256::one() << (256 - shift)) - U256::one();
        x | (mask << shift)
    } else {
        x
    }
}

#[inline(always)]
fn bool_to_u256(t: bool) -> U256 {
    if t {
        U256::one()
    } else {
        U256::zero()
    }
}

#[inline(always)]
pub fn lt(a: U256, b: U256) -> U256 {
    bool_to_u256(a < b)
}

#[inline(always)]
pub fn gt(a: U256, b: U256) -> U256 {
    bool_to_u256(a > b)
}

#[inline(always)]
pub fn slt(a: U256, b: U256) -> U256 {
    let (a_sign, a_abs) = sign_abs(a);
    let (b_sign, b_abs) = sign_abs(b);
    if a_sign ^ b_sign {
        bool_to_u256(a_sign)
    } else {
        bool_to_u256(if a_abs == b_abs {
            false
        } else {
            (a_abs < b_abs) ^ a_sign
        })
    }
}

#[inline(always)]
pub fn sgt(a: U256, b: U256) -> U256 {
    let (a_sign, a_abs) = sign_abs(a);
    let (b_sign, b_abs) = sign_abs(b);
    if a_sign ^ b_sign {
        bool_to_u256(b_sign)
    } else {
        bool_to_u256(if a_abs == b_abs {
            false
        } else {
            (a_abs > b_abs) ^ b_sign
        })
    }
}

#[inline(always)]
pub fn eq(a: U256, b: U256) -> U256 {
    bool_to_u256(a == b)
}

#[inline(always)]
pub fn is_zero(a: U256) -> U256 {
    bool_to_u256(a.is_zero())
}

#[inline(always)]
pub fn and(a: U256, b: U256) -> U256 {
    a & b
}

#[inline(always)]
pub fn or(a: U256, b: U256) -> U256 {
    a | b
}

#[inline(always)]
pub fn xor(a: U256, b: U256) -> U256 {
    a ^ b
}

#[inline(always)]
pub fn not(a: U256) -> U256 {
    !a
}

/// Byte `i` of `x`, counting from the big end.
#[inline(always)]
pub fn byte(i: U256, x: U256) -> U256 {
    let i = if i > 31.into() { 31 } else { i.as_u32() };
    (x >> (248 - (i << 3))) & 0xff.into()
}

#[inline(always)]
pub fn shl(s: U256, val: U256) -> U256 {
    if s < 256.into() {
        val << s
    } else {
        U256::zero()
    }
}

#[inline(always)]
pub fn shr(s: U256, val: U256) -> U256 {
    if s < 256.into() {
        val >> s
    } else {
        U256::zero()
    }
}

/// Arithmetic right shift: fills with the sign bit, saturating to all-ones
/// (or zero) for shifts of 256 and beyond.
#[inline(always)]
pub fn sar(s: U256, mut val: U256) -> U256 {
    let ext = val.bit(255);
    let s = if s >= 256.into() {
        return if ext { U256::MAX } else { U256::zero() }
    } else {
        s.as_u32()
    };
    val >>= s;
    if ext && s > 0 {
        val | (sub(U256::one() << s, 1.into())) << (256 - s)
    } else {
        val
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(i: i64) -> U256 {
        if i < 0 {
            neg(((-i) as u64).into())
        } else {
            (i as u64).into()
        }
    }

    fn to_i64(x: U256) -> i64 {
        if x.bit(255) {
            -(neg(x).as_u64() as i64)
        } else {
            x.as_u64() as i64
        }
    }

    #[test]
    fn wrapping_binary_ops() {
        assert_eq!(add(U256::MAX, 1.into()), U256::zero());
        assert_eq!(sub(U256::zero(), 1.into()), U256::MAX);
        assert_eq!(mul(U256::MAX, 2.into()), sub(U256::MAX, 1.into()));
        assert_eq!(exp(2.into(), 256.into()), U256::zero());
        assert_eq!(exp(3.into(), 5.into()), 243.into());
    }

    #[test]
    fn division_by_zero_is_zero() {
        assert_eq!(div(7.into(), 0.into()), U256::zero());
        assert_eq!(rem(7.into(), 0.into()), U256::zero());
        assert_eq!(sdiv(signed(-7), 0.into()), U256::zero());
        assert_eq!(smod(signed(-7), 0.into()), U256::zero());
        assert_eq!(add_mod(1.into(), 2.into(), 0.into()), U256::zero());
        assert_eq!(mul_mod(3.into(), 4.into(), 0.into()), U256::zero());
    }

    #[test]
    fn signed_divisions_match_native() {
        let n = 100;
        for i in -n..=n {
            for j in -n..=n {
                if j == 0 {
                    continue
                }
                assert_eq!(to_i64(sdiv(signed(i), signed(j))), i / j);
                assert_eq!(to_i64(smod(signed(i), signed(j))), i % j);
            }
        }
    }

    #[test]
    fn signed_comparisons_match_native() {
        for i in -3..=3 {
            for j in -3..=3 {
                assert_eq!(!slt(signed(i), signed(j)).is_zero(), i < j);
                assert_eq!(!sgt(signed(i), signed(j)).is_zero(), i > j);
            }
        }
    }

    #[test]
    fn sign_extend_matches_native() {
        let cases: &[(u64, u64, i64)] = &[
            (0x7f, 0, 0x7f),
            (0x80, 0, -128),
            (0xff, 0, -1),
            (0x7fff, 1, 0x7fff),
            (0x8000, 1, -32768),
            (0x12345678, 3, 0x12345678),
        ];
        for &(x, back, want) in cases {
            assert_eq!(
                sign_extend(back.into(), x.into()),
                signed(want),
                "x={:#x} back={}",
                x,
                back
            );
        }
        // back >= 31 is the identity
        assert_eq!(sign_extend(31.into(), U256::MAX), U256::MAX);
        assert_eq!(sign_extend(100.into(), 5.into()), U256::from(5));
    }

    #[test]
    fn shifts() {
        assert_eq!(shl(1.into(), 1.into()), 2.into());
        assert_eq!(shl(256.into(), 1.into()), U256::zero());
        assert_eq!(shr(1.into(), 4.into()), 2.into());
        assert_eq!(shr(256.into(), U256::MAX), U256::zero());
    }

    #[test]
    fn sar_matches_signed_shift() {
        // non-negative values behave like shr
        for s in 0..64u64 {
            let x0 = shl(s.into(), 1.into());
            for i in 0..=256u64 {
                assert_eq!(sar(i.into(), x0), shr(i.into(), x0));
            }
        }
        // negative values round toward negative infinity
        for x in 2..64i64 {
            for i in 0..=8u32 {
                assert_eq!(to_i64(sar(i.into(), signed(-x))), (-x) >> i);
            }
        }
        assert_eq!(sar(256.into(), signed(-1)), U256::MAX);
        assert_eq!(sar(300.into(), signed(-1)), U256::MAX);
        assert_eq!(sar(300.into(), 5.into()), U256::zero());
    }

    #[test]
    fn byte_indexing() {
        let x = U256::from_big_endian(&{
            let mut b = [0u8; 32];
            b[0] = 0xab;
            b[31] = 0xcd;
            b
        });
        assert_eq!(byte(0.into(), x), 0xab.into());
        assert_eq!(byte(31.into(), x), 0xcd.into());
        assert_eq!(byte(32.into(), x), 0xcd.into());
    }
}
