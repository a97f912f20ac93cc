//! SSE4.2 packed string compares.
//!
//! All four instructions run the same pipeline and only differ in where the
//! lengths come from and what gets written back:
//!
//! 1. compare every element of B against every element of A
//! 2. force entries involving invalid elements according to [`OVERRIDES`]
//! 3. aggregate the matrix into IntRes1
//! 4. apply the polarity to get IntRes2
//! 5. produce an index for ECX or a mask for XMM0, plus flags
//!
//! See the SDM Vol2 section 4.1, "Imm8 Control Byte Operation for
//! PCMPESTRI / PCMPESTRM / PCMPISTRI / PCMPISTRM".

use crate::regs::{FlagUpdate, Flags};

const MAX_ELEMENTS: usize = 16;

/// Comparison mode, IMM8[3:2].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregation {
    EqualAny,
    Ranges,
    EqualEach,
    EqualOrdered,
}

/// IMM8[5:4]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarity {
    Positive,
    Negative,
    MaskedPositive,
    /// negate only the elements below the length of B
    MaskedNegative,
}

/// The IMM8 control byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Control(pub u8);

impl Control {
    /// 16 bit elements instead of bytes
    #[inline]
    pub fn words(self) -> bool {
        self.0 & 0x1 != 0
    }

    #[inline]
    pub fn signed(self) -> bool {
        self.0 & 0x2 != 0
    }

    #[inline]
    pub fn aggregation(self) -> Aggregation {
        match (self.0 >> 2) & 0x3 {
            0 => Aggregation::EqualAny,
            1 => Aggregation::Ranges,
            2 => Aggregation::EqualEach,
            _ => Aggregation::EqualOrdered,
        }
    }

    #[inline]
    pub fn polarity(self) -> Polarity {
        match (self.0 >> 4) & 0x3 {
            0 => Polarity::Positive,
            1 => Polarity::Negative,
            2 => Polarity::MaskedPositive,
            _ => Polarity::MaskedNegative,
        }
    }

    /// IMM8[6] for the index forms: report the most significant set bit
    #[inline]
    pub fn most_significant(self) -> bool {
        self.0 & 0x40 != 0
    }

    /// IMM8[6] for the mask forms: one element wide mask per bit
    #[inline]
    pub fn expand_mask(self) -> bool {
        self.0 & 0x40 != 0
    }

    /// elements per 128 bit register
    #[inline]
    pub fn elements(self) -> usize {
        if self.words() {
            8
        } else {
            16
        }
    }
}

/// Where the string lengths come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lengths {
    /// PCMPISTRx, each string ends at its first zero element
    Implicit,
    /// PCMPESTRx, signed lengths from rAX for A and rDX for B
    Explicit { a: i64, b: i64 },
}

/// A 128-bit register viewed as a string of bytes or words.
#[derive(Clone, Copy, Debug)]
struct PackedString {
    elements: [i32; MAX_ELEMENTS],
    count: usize,
}

impl PackedString {
    fn new(value: u128, ctl: Control) -> Self {
        let mut elements = [0i32; MAX_ELEMENTS];
        let count = ctl.elements();
        for (i, element) in elements.iter_mut().take(count).enumerate() {
            *element = match (ctl.words(), ctl.signed()) {
                (false, false) => (value >> (i * 8)) as u8 as i32,
                (false, true) => (value >> (i * 8)) as u8 as i8 as i32,
                (true, false) => (value >> (i * 16)) as u16 as i32,
                (true, true) => (value >> (i * 16)) as u16 as i16 as i32,
            };
        }
        Self { elements, count }
    }

    /// index of the first zero element, or the element count
    fn implicit_len(&self) -> usize {
        self.elements[..self.count]
            .iter()
            .position(|&e| e == 0)
            .unwrap_or(self.count)
    }

    #[inline]
    fn get(&self, index: usize) -> i32 {
        self.elements[index]
    }
}

/// absolute value of an explicit length register, saturated to the element count
#[inline]
pub fn explicit_len(reg: i64, elements: usize) -> usize {
    reg.unsigned_abs().min(elements as u64) as usize
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Override {
    Computed,
    ForceTrue,
    ForceFalse,
}

use Override::{Computed, ForceFalse, ForceTrue};

/// What a matrix entry becomes when either element is past the end of its
/// string, indexed by aggregation, then `[a valid][b valid]`.
const OVERRIDES: [[[Override; 2]; 2]; 4] = [
    // EqualAny
    [[ForceFalse, ForceFalse], [ForceFalse, Computed]],
    // Ranges
    [[ForceFalse, ForceFalse], [ForceFalse, Computed]],
    // EqualEach
    [[ForceTrue, ForceFalse], [ForceFalse, Computed]],
    // EqualOrdered
    [[ForceTrue, ForceTrue], [ForceFalse, Computed]],
];

/// `m[b][a]`, b indexes the second operand and a the first
struct CompareMatrix([[bool; MAX_ELEMENTS]; MAX_ELEMENTS]);

impl CompareMatrix {
    fn build(a: &PackedString, la: usize, b: &PackedString, lb: usize, agg: Aggregation) -> Self {
        let mut m = [[false; MAX_ELEMENTS]; MAX_ELEMENTS];
        let n = a.count;
        for (j, row) in m.iter_mut().take(n).enumerate() {
            for (i, entry) in row.iter_mut().take(n).enumerate() {
                let computed = match agg {
                    // lower bounds sit at even positions of A, upper bounds at odd ones
                    Aggregation::Ranges if i % 2 == 0 => b.get(j) >= a.get(i),
                    Aggregation::Ranges => b.get(j) <= a.get(i),
                    _ => b.get(j) == a.get(i),
                };
                *entry = match OVERRIDES[agg as usize][(i < la) as usize][(j < lb) as usize] {
                    Computed => computed,
                    ForceTrue => true,
                    ForceFalse => false,
                };
            }
        }
        Self(m)
    }

    fn aggregate(&self, agg: Aggregation, n: usize) -> u16 {
        let m = &self.0;
        let mut res = 0u16;
        for j in 0..n {
            let hit = match agg {
                Aggregation::EqualAny => (0..n).any(|i| m[j][i]),
                Aggregation::Ranges => (0..n).step_by(2).any(|i| m[j][i] && m[j][i + 1]),
                Aggregation::EqualEach => m[j][j],
                Aggregation::EqualOrdered => (0..n - j).all(|k| m[j + k][k]),
            };
            res |= (hit as u16) << j;
        }
        res
    }
}

/// The outcome of one packed compare, before it is written anywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Comparison {
    pub int_res1: u16,
    pub int_res2: u16,
    /// valid elements in A
    pub la: usize,
    /// valid elements in B
    pub lb: usize,
    pub elements: usize,
}

/// flags a packed compare writes
pub const PCMPSTR_FLAGS: Flags = Flags::CF
    .union(Flags::PF)
    .union(Flags::AF)
    .union(Flags::ZF)
    .union(Flags::SF)
    .union(Flags::OF);

impl Comparison {
    /// the PCMPxSTRI result, the element count when nothing matched
    pub fn index(&self, ctl: Control) -> u32 {
        if self.int_res2 == 0 {
            return self.elements as u32;
        }
        if ctl.most_significant() {
            15 - self.int_res2.leading_zeros()
        } else {
            self.int_res2.trailing_zeros()
        }
    }

    /// the PCMPxSTRM result for XMM0
    pub fn mask(&self, ctl: Control) -> u128 {
        if !ctl.expand_mask() {
            return self.int_res2 as u128;
        }
        let (lane_bits, lane) = if ctl.words() {
            (16, 0xffffu128)
        } else {
            (8, 0xffu128)
        };
        (0..self.elements)
            .filter(|&i| self.int_res2 & (1 << i) != 0)
            .fold(0u128, |mask, i| mask | (lane << (i * lane_bits)))
    }

    pub fn flags(&self) -> FlagUpdate {
        FlagUpdate::new(PCMPSTR_FLAGS)
            .with(Flags::CF, self.int_res2 != 0)
            .with(Flags::ZF, self.lb < self.elements)
            .with(Flags::SF, self.la < self.elements)
            .with(Flags::OF, self.int_res2 & 1 != 0)
            .with(Flags::AF, false)
            .with(Flags::PF, false)
    }
}

/// Compare `a` (the register operand) against `b` (register or memory).
pub fn compare(ctl: Control, a: u128, b: u128, lengths: Lengths) -> Comparison {
    let n = ctl.elements();
    let a = PackedString::new(a, ctl);
    let b = PackedString::new(b, ctl);
    let (la, lb) = match lengths {
        Lengths::Implicit => (a.implicit_len(), b.implicit_len()),
        Lengths::Explicit { a, b } => (explicit_len(a, n), explicit_len(b, n)),
    };

    let agg = ctl.aggregation();
    let int_res1 = CompareMatrix::build(&a, la, &b, lb, agg).aggregate(agg, n);

    let all = ((1u32 << n) - 1) as u16;
    let int_res2 = match ctl.polarity() {
        Polarity::Positive | Polarity::MaskedPositive => int_res1,
        Polarity::Negative => !int_res1 & all,
        Polarity::MaskedNegative => int_res1 ^ ((1u32 << lb) - 1) as u16,
    };

    Comparison {
        int_res1,
        int_res2,
        la,
        lb,
        elements: n,
    }
}
