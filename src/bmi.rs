//! BMI1 and BMI2, generic over the operand width.
//!
//! Every function is pure: it takes operand values and returns the result
//! and, where the instruction defines them, the flags to write back.
//! AF and PF are never part of an update.

use crate::primitive::Word;
use crate::regs::{FlagUpdate, Flags};

/// flags written by the flag producing BMI instructions
pub const BMI_FLAGS: Flags = Flags::CF
    .union(Flags::ZF)
    .union(Flags::SF)
    .union(Flags::OF);

#[inline]
fn result_flags<T: Word<N>, const N: usize>(dest: T, carry: bool) -> FlagUpdate {
    FlagUpdate::new(BMI_FLAGS)
        .with(Flags::CF, carry)
        .with(Flags::ZF, dest.is_zero())
        .with(Flags::SF, dest.msb())
        .with(Flags::OF, false)
}

/// ANDN, as documented by https://www.felixcloutier.com/x86/andn
#[inline]
pub fn andn<T: Word<N>, const N: usize>(src1: T, src2: T) -> (T, FlagUpdate) {
    let dest = !src1 & src2;
    (dest, result_flags(dest, false))
}

/// BLSR, as documented by https://www.felixcloutier.com/x86/blsr
#[inline]
pub fn blsr<T: Word<N>, const N: usize>(src: T) -> (T, FlagUpdate) {
    let dest = src & src.wrapping_sub(T::ONE);
    (dest, result_flags(dest, src.is_zero()))
}

/// BLSMSK, as documented by https://www.felixcloutier.com/x86/blsmsk
#[inline]
pub fn blsmsk<T: Word<N>, const N: usize>(src: T) -> (T, FlagUpdate) {
    let dest = src ^ src.wrapping_sub(T::ONE);
    // the mask always has bit 0 set
    let flags = result_flags(dest, src.is_zero()).with(Flags::ZF, false);
    (dest, flags)
}

/// BLSI, as documented by https://www.felixcloutier.com/x86/blsi
#[inline]
pub fn blsi<T: Word<N>, const N: usize>(src: T) -> (T, FlagUpdate) {
    let dest = src.wrapping_neg() & src;
    (dest, result_flags(dest, !src.is_zero()))
}

/// BZHI, as documented by https://www.felixcloutier.com/x86/bzhi
///
/// only the low byte of `index` counts
#[inline]
pub fn bzhi<T: Word<N>, const N: usize>(src: T, index: T) -> (T, FlagUpdate) {
    let n = (index.to_u64() & 0xff) as u32;
    if n > T::BITS - 1 {
        return (src, result_flags(src, true));
    }
    let dest = src & T::low_mask(n);
    (dest, result_flags(dest, false))
}

/// BEXTR, as documented by https://www.felixcloutier.com/x86/bextr
///
/// `control` holds the start bit in bits 7:0 and the length in bits 15:8
#[inline]
pub fn bextr<T: Word<N>, const N: usize>(src: T, control: T) -> (T, FlagUpdate) {
    let control = control.to_u64();
    let start = (control & 0xff) as u32;
    let len = ((control >> 8) & 0xff) as u32;
    let dest = if start >= T::BITS {
        T::ZERO
    } else {
        src.shr_masked(start) & T::low_mask(len.min(T::BITS - start))
    };
    (dest, result_flags(dest, false))
}

/// PDEP, as documented by https://www.felixcloutier.com/x86/pdep
///
/// deposits the low bits of `src` at the positions set in `mask`
#[inline]
pub fn pdep<T: Word<N>, const N: usize>(src: T, mask: T) -> T {
    let src = src.to_u64();
    let mut mask = mask.to_u64();
    let mut dest = 0u64;
    let mut k = 0;
    while mask != 0 {
        let lowest = mask & mask.wrapping_neg();
        if (src >> k) & 1 != 0 {
            dest |= lowest;
        }
        mask ^= lowest;
        k += 1;
    }
    T::from_u64(dest)
}

/// PEXT, as documented by https://www.felixcloutier.com/x86/pext
///
/// gathers the bits of `src` selected by `mask` into the low end
#[inline]
pub fn pext<T: Word<N>, const N: usize>(src: T, mask: T) -> T {
    let src = src.to_u64();
    let mut mask = mask.to_u64();
    let mut dest = 0u64;
    let mut k = 0;
    while mask != 0 {
        let lowest = mask & mask.wrapping_neg();
        if src & lowest != 0 {
            dest |= 1 << k;
        }
        mask ^= lowest;
        k += 1;
    }
    T::from_u64(dest)
}

/// MULX, as documented by https://www.felixcloutier.com/x86/mulx
///
/// returns `(low, high)` of the unsigned product
#[inline]
pub fn mulx<T: Word<N>, const N: usize>(src: T, rdx: T) -> (T, T) {
    src.widening_mul(rdx)
}

/// SHLX, as documented by https://www.felixcloutier.com/x86/sarx:shlx:shrx
#[inline]
pub fn shlx<T: Word<N>, const N: usize>(src: T, count: T) -> T {
    src.shl_masked(count.to_u64() as u32)
}

#[inline]
pub fn shrx<T: Word<N>, const N: usize>(src: T, count: T) -> T {
    src.shr_masked(count.to_u64() as u32)
}

#[inline]
pub fn sarx<T: Word<N>, const N: usize>(src: T, count: T) -> T {
    src.sar_masked(count.to_u64() as u32)
}

/// RORX, as documented by https://www.felixcloutier.com/x86/rorx
#[inline]
pub fn rorx<T: Word<N>, const N: usize>(src: T, imm: u8) -> T {
    src.rotate_right(imm as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn flags(update: FlagUpdate) -> Flags {
        assert_eq!(update.mask, BMI_FLAGS);
        update.value
    }

    #[test]
    fn andn_clears_and_sets_zero() {
        let (dest, f) = andn::<u64, 8>(0xff00, 0x0ff0);
        assert_eq!(dest, 0x00f0);
        assert_eq!(flags(f), Flags::empty());

        let (dest, f) = andn::<u32, 4>(u32::MAX, 0x1234);
        assert_eq!(dest, 0);
        assert_eq!(flags(f), Flags::ZF);
    }

    #[test]
    fn blsr_family() {
        assert_eq!(blsr::<u32, 4>(0b1011_0000).0, 0b1010_0000);
        assert_eq!(blsmsk::<u32, 4>(0b1011_0000).0, 0b0001_1111);
        assert_eq!(blsi::<u32, 4>(0b1011_0000).0, 0b0001_0000);

        // zero input: CF set by BLSR and BLSMSK, clear for BLSI
        assert_eq!(flags(blsr::<u64, 8>(0).1), Flags::CF | Flags::ZF);
        let (dest, f) = blsmsk::<u64, 8>(0);
        assert_eq!(dest, u64::MAX);
        assert_eq!(flags(f), Flags::CF | Flags::SF);
        assert_eq!(flags(blsi::<u64, 8>(0).1), Flags::ZF);

        assert_eq!(flags(blsi::<u32, 4>(0x8000_0000).1), Flags::CF | Flags::SF);
    }

    #[test]
    fn bzhi_index_past_width() {
        let (dest, f) = bzhi::<u32, 4>(0xdead_beef, 8);
        assert_eq!(dest, 0xef);
        assert_eq!(flags(f), Flags::empty());

        let (dest, f) = bzhi::<u32, 4>(0xdead_beef, 32);
        assert_eq!(dest, 0xdead_beef);
        assert_eq!(flags(f), Flags::CF | Flags::SF);

        // only the low byte of the index is used
        let (dest, f) = bzhi::<u64, 8>(u64::MAX, 0x100);
        assert_eq!(dest, 0);
        assert_eq!(flags(f), Flags::ZF);
    }

    #[test]
    fn bextr_extracts_and_saturates() {
        let (dest, _) = bextr::<u32, 4>(0x1234_5678, 0x0804);
        assert_eq!(dest, 0x67);

        // length runs past the top of the source
        let (dest, _) = bextr::<u32, 4>(0xf000_0000, 0xff1c);
        assert_eq!(dest, 0xf);

        let (dest, f) = bextr::<u64, 8>(u64::MAX, 0x0840);
        assert_eq!(dest, 0);
        assert_eq!(flags(f), Flags::ZF);
    }

    #[test]
    fn pdep_pext_examples() {
        // the examples from the SDM figures
        assert_eq!(pdep::<u32, 4>(0b1011, 0b1111_0000), 0b1011_0000);
        assert_eq!(pext::<u32, 4>(0b1011_0000, 0b1111_0000), 0b1011);
        assert_eq!(pdep::<u64, 8>(0b101, 0x8000_0000_0000_0101), 0x8000_0000_0000_0001);
        assert_eq!(pext::<u64, 8>(u64::MAX, 1 << 63), 1);
    }

    #[test]
    fn mulx_halves() {
        assert_eq!(mulx::<u64, 8>(u64::MAX, 2), (u64::MAX - 1, 1));
        assert_eq!(mulx::<u32, 4>(0x1_0000, 0x1_0000), (0, 1));
    }

    #[test]
    fn shifts_mask_count() {
        assert_eq!(shlx::<u32, 4>(1, 33), 2);
        assert_eq!(shrx::<u64, 8>(1 << 63, 127), 1);
        assert_eq!(sarx::<u32, 4>(0x8000_0000, 4), 0xf800_0000);
        assert_eq!(rorx::<u32, 4>(1, 1), 0x8000_0000);
        assert_eq!(rorx::<u64, 8>(1, 65), 1 << 63);
    }

    proptest! {
        #[test]
        fn pext_undoes_pdep_64(src: u64, mask: u64) {
            let expected = src & <u64 as Word<8>>::low_mask(mask.count_ones());
            prop_assert_eq!(pext::<u64, 8>(pdep::<u64, 8>(src, mask), mask), expected);
        }

        #[test]
        fn pext_undoes_pdep_32(src: u32, mask: u32) {
            let expected = src & <u32 as Word<4>>::low_mask(mask.count_ones());
            prop_assert_eq!(pext::<u32, 4>(pdep::<u32, 4>(src, mask), mask), expected);
        }

        #[test]
        fn bextr_whole_word_is_identity(src: u64, narrow: u32) {
            prop_assert_eq!(bextr::<u64, 8>(src, 64 << 8).0, src);
            prop_assert_eq!(bextr::<u32, 4>(narrow, 32 << 8).0, narrow);
        }

        #[test]
        fn rorx_composes(src: u64, a in 0u8..64, b in 0u8..64) {
            prop_assert_eq!(
                rorx::<u64, 8>(rorx::<u64, 8>(src, a), b),
                rorx::<u64, 8>(src, (a + b) % 64)
            );
            let narrow = src as u32;
            prop_assert_eq!(
                rorx::<u32, 4>(rorx::<u32, 4>(narrow, a), b),
                rorx::<u32, 4>(narrow, (a + b) % 32)
            );
        }

        #[test]
        fn bmi_never_writes_af_or_pf(src: u64, other: u64) {
            for update in [
                andn::<u64, 8>(src, other).1,
                blsr::<u64, 8>(src).1,
                blsmsk::<u64, 8>(src).1,
                blsi::<u64, 8>(src).1,
                bzhi::<u64, 8>(src, other).1,
                bextr::<u64, 8>(src, other).1,
            ] {
                prop_assert!(!update.mask.intersects(Flags::AF | Flags::PF));
            }
        }
    }
}
