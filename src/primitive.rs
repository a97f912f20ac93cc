use core::fmt::Debug;
use core::ops::{BitAnd, BitOr, BitXor, Not};

/// Operand sizes of the general purpose forms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Bitness {
    ThirtyTwo = 32,
    SixtyFour = 64,
}

/// A little endian value that can be moved in and out of registers and memory.
pub trait Primitive<const SIZE: usize>: Sized + Copy + Debug + Eq {
    fn to_u128(self) -> u128;

    /// truncating conversion, the way a narrow register read works
    fn from_u128(val: u128) -> Self;

    fn from_le_bytes(bytes: [u8; SIZE]) -> Self;

    fn to_le_bytes(self) -> [u8; SIZE];
}

macro_rules! impl_primitive {
    ($type:ty,$bytes:expr) => {
        impl Primitive<$bytes> for $type {
            #[inline]
            fn to_u128(self) -> u128 {
                self as u128
            }

            #[inline]
            fn from_u128(val: u128) -> Self {
                val as $type
            }

            #[inline]
            fn from_le_bytes(bytes: [u8; $bytes]) -> Self {
                <$type>::from_le_bytes(bytes)
            }

            #[inline]
            fn to_le_bytes(self) -> [u8; $bytes] {
                <$type>::to_le_bytes(self)
            }
        }
    };
}

impl_primitive!(u32, 4);
impl_primitive!(u64, 8);
impl_primitive!(u128, 16);

/// General purpose register widths, with the bit operations BMI is built from.
///
/// Every method has x86 semantics at the type's width, so the 32 and 64 bit
/// forms of an instruction share one generic body.
pub trait Word<const SIZE: usize>:
    Primitive<SIZE>
    + Not<Output = Self>
    + BitAnd<Output = Self>
    + BitOr<Output = Self>
    + BitXor<Output = Self>
{
    const BITS: u32 = SIZE as u32 * 8;
    const ZERO: Self;
    const ONE: Self;

    fn to_u64(self) -> u64;

    fn from_u64(val: u64) -> Self;

    #[inline]
    fn msb(self) -> bool {
        self.to_u64() >> (Self::BITS - 1) & 1 != 0
    }

    #[inline]
    fn is_zero(self) -> bool {
        self == Self::ZERO
    }

    fn wrapping_sub(self, rhs: Self) -> Self;

    fn wrapping_neg(self) -> Self;

    fn rotate_right(self, count: u32) -> Self;

    /// shift left, `count` is masked to the width like the hardware does
    fn shl_masked(self, count: u32) -> Self;

    /// logical shift right, `count` is masked to the width
    fn shr_masked(self, count: u32) -> Self;

    /// arithmetic shift right, `count` is masked to the width
    fn sar_masked(self, count: u32) -> Self;

    /// mask with the low `count` bits set, saturating at the full width
    fn low_mask(count: u32) -> Self;

    /// full unsigned product as `(low, high)`
    fn widening_mul(self, rhs: Self) -> (Self, Self);
}

macro_rules! impl_word {
    ($type:ty,$signed:ty,$wide:ty,$bytes:expr) => {
        impl Word<$bytes> for $type {
            const ZERO: Self = 0;
            const ONE: Self = 1;

            #[inline]
            fn to_u64(self) -> u64 {
                self as u64
            }

            #[inline]
            fn from_u64(val: u64) -> Self {
                val as $type
            }

            #[inline]
            fn wrapping_sub(self, rhs: Self) -> Self {
                <$type>::wrapping_sub(self, rhs)
            }

            #[inline]
            fn wrapping_neg(self) -> Self {
                <$type>::wrapping_neg(self)
            }

            #[inline]
            fn rotate_right(self, count: u32) -> Self {
                <$type>::rotate_right(self, count % <$type>::BITS)
            }

            #[inline]
            fn shl_masked(self, count: u32) -> Self {
                self.wrapping_shl(count & (<$type>::BITS - 1))
            }

            #[inline]
            fn shr_masked(self, count: u32) -> Self {
                self.wrapping_shr(count & (<$type>::BITS - 1))
            }

            #[inline]
            fn sar_masked(self, count: u32) -> Self {
                (self as $signed).wrapping_shr(count & (<$type>::BITS - 1)) as $type
            }

            #[inline]
            fn low_mask(count: u32) -> Self {
                if count >= <$type>::BITS {
                    <$type>::MAX
                } else {
                    (1 << count) - 1
                }
            }

            #[inline]
            fn widening_mul(self, rhs: Self) -> (Self, Self) {
                let product = self as $wide * rhs as $wide;
                (product as $type, (product >> <$type>::BITS) as $type)
            }
        }
    };
}

impl_word!(u32, i32, u64, 4);
impl_word!(u64, i64, u128, 8);
