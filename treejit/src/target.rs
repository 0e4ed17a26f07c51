//! Target machine description: the physical register file, register masks and
//! register pairs.
//!
//! The target is a 32-bit x86-class machine with eight general purpose
//! registers. Note that large portions of the code rely on these registers
//! mapping to the integers 0..7 (both inc.) in order: bit `i` of a [RegMask]
//! is register `i`.

use std::{fmt, ops};
use strum::{EnumCount, EnumIter, FromRepr};

/// A physical general purpose register.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, EnumCount, EnumIter, FromRepr)]
pub enum Reg {
    Eax,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
}

/// How many registers are there? Only needed because `Reg::COUNT` isn't
/// usable in array lengths on stable.
pub const REG_COUNT: usize = 8;

static_assertions::const_assert_eq!(REG_COUNT, <Reg as EnumCount>::COUNT);

impl Reg {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn mask(self) -> RegMask {
        RegMask(1 << self.code())
    }

    /// The textual name, as it appears in emitted listings.
    pub fn name(self) -> &'static str {
        match self {
            Reg::Eax => "eax",
            Reg::Ecx => "ecx",
            Reg::Edx => "edx",
            Reg::Ebx => "ebx",
            Reg::Esp => "esp",
            Reg::Ebp => "ebp",
            Reg::Esi => "esi",
            Reg::Edi => "edi",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A set of physical registers. The universal currency of the register
/// allocator: every query and command traffics in these.
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct RegMask(u8);

/// The empty register set.
pub const RBM_NONE: RegMask = RegMask(0);
/// All allocatable integer registers. ESP and EBP are reserved for the stack
/// and frame pointers and are never handed out.
pub const RBM_ALLINT: RegMask = RegMask(0b1100_1111);
/// Callee saved registers.
pub const RBM_CALLEE_SAVED: RegMask = RegMask(0b1100_1000);
/// Registers trashed by a call.
pub const RBM_CALLEE_TRASH: RegMask = RegMask(0b0000_0111);
/// The fixed integer argument registers, in argument order: ECX then EDX.
pub const RBM_ARG_REGS: RegMask = RegMask(0b0000_0110);
/// Where a call's single-register return value lands.
pub const RBM_RETVAL: RegMask = RegMask(0b0000_0001);
/// Where a call's double-width return value lands: EAX (low) and EDX (high).
pub const RBM_PAIR_RETVAL: RegMask = RegMask(0b0000_0101);

/// The order in which registers are considered for internal tree temps.
pub static REG_TMP_ORDER: [Reg; 6] = [Reg::Eax, Reg::Edx, Reg::Ecx, Reg::Ebx, Reg::Esi, Reg::Edi];

/// The fixed argument registers in argument order.
pub static ARG_REG_ORDER: [Reg; 2] = [Reg::Ecx, Reg::Edx];

impl RegMask {
    pub fn from_bits(bits: u8) -> Self {
        RegMask(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, reg: Reg) -> bool {
        self.0 & reg.mask().0 != 0
    }

    /// Is `other` a subset of `self`?
    pub fn contains_all(self, other: RegMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Does the mask have exactly zero or one bits set?
    pub fn at_most_one(self) -> bool {
        self.0 & self.0.wrapping_sub(1) == 0
    }

    /// The lowest-numbered register in the mask, if any.
    pub fn lowest(self) -> Option<Reg> {
        if self.0 == 0 {
            None
        } else {
            // The unwrap cannot fail: the bit index is < REG_COUNT.
            Some(Reg::from_repr(self.0.trailing_zeros() as u8).unwrap())
        }
    }

    /// Iterate the registers in the mask, lowest first.
    pub fn iter(self) -> impl Iterator<Item = Reg> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                None
            } else {
                let i = bits.trailing_zeros() as u8;
                bits &= bits - 1;
                Some(Reg::from_repr(i).unwrap())
            }
        })
    }

    /// The first register of the mask in temp-preference order, or `None` if
    /// the mask contains no allocatable register.
    pub fn pick_in_tmp_order(self) -> Option<Reg> {
        REG_TMP_ORDER.iter().copied().find(|r| self.contains(*r))
    }
}

impl ops::BitOr for RegMask {
    type Output = RegMask;
    fn bitor(self, rhs: RegMask) -> RegMask {
        RegMask(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for RegMask {
    fn bitor_assign(&mut self, rhs: RegMask) {
        self.0 |= rhs.0;
    }
}

impl ops::BitAnd for RegMask {
    type Output = RegMask;
    fn bitand(self, rhs: RegMask) -> RegMask {
        RegMask(self.0 & rhs.0)
    }
}

impl ops::BitAndAssign for RegMask {
    fn bitand_assign(&mut self, rhs: RegMask) {
        self.0 &= rhs.0;
    }
}

/// Set subtraction.
impl ops::Sub for RegMask {
    type Output = RegMask;
    fn sub(self, rhs: RegMask) -> RegMask {
        RegMask(self.0 & !rhs.0)
    }
}

impl ops::SubAssign for RegMask {
    fn sub_assign(&mut self, rhs: RegMask) {
        self.0 &= !rhs.0;
    }
}

impl ops::Not for RegMask {
    type Output = RegMask;
    fn not(self) -> RegMask {
        RegMask(!self.0)
    }
}

impl From<Reg> for RegMask {
    fn from(reg: Reg) -> Self {
        reg.mask()
    }
}

impl fmt::Debug for RegMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for reg in self.iter() {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{reg}")?;
            first = false;
        }
        write!(f, "}}")
    }
}

/// One half of a register pair: either a physical register or the half's home
/// stack location ("partially enregistered").
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HalfReg {
    Reg(Reg),
    Stk,
}

impl HalfReg {
    pub fn reg(self) -> Option<Reg> {
        match self {
            HalfReg::Reg(r) => Some(r),
            HalfReg::Stk => None,
        }
    }
}

/// A register pair holding a value wider than a single register (the low and
/// high halves of a 64-bit value on this 32-bit target). Either half may be
/// [HalfReg::Stk].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegPair {
    pub lo: HalfReg,
    pub hi: HalfReg,
}

impl RegPair {
    pub fn new(lo: Reg, hi: Reg) -> Self {
        debug_assert_ne!(lo, hi);
        RegPair {
            lo: HalfReg::Reg(lo),
            hi: HalfReg::Reg(hi),
        }
    }

    /// The mask of the enregistered halves.
    pub fn mask(self) -> RegMask {
        let mut m = RBM_NONE;
        if let HalfReg::Reg(r) = self.lo {
            m |= r.mask();
        }
        if let HalfReg::Reg(r) = self.hi {
            m |= r.mask();
        }
        m
    }

    /// Both halves in registers, and distinct ones?
    pub fn is_proper(self) -> bool {
        match (self.lo, self.hi) {
            (HalfReg::Reg(lo), HalfReg::Reg(hi)) => lo != hi,
            _ => false,
        }
    }
}

impl fmt::Display for RegPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = |h: HalfReg| match h {
            HalfReg::Reg(r) => r.name(),
            HalfReg::Stk => "stk",
        };
        write!(f, "{}:{}", h(self.hi), h(self.lo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn reg_codes_match_mask_bits() {
        for (i, reg) in Reg::iter().enumerate() {
            assert_eq!(reg.code(), u8::try_from(i).unwrap());
            assert_eq!(reg.mask().bits(), 1 << i);
        }
    }

    #[test]
    fn mask_constants() {
        assert!(!RBM_ALLINT.contains(Reg::Esp));
        assert!(!RBM_ALLINT.contains(Reg::Ebp));
        assert_eq!(RBM_ALLINT.count(), 6);
        assert_eq!(RBM_CALLEE_SAVED | RBM_CALLEE_TRASH, RBM_ALLINT);
        assert!(RBM_ALLINT.contains_all(RBM_ARG_REGS));
        assert_eq!(
            RBM_PAIR_RETVAL,
            Reg::Eax.mask() | Reg::Edx.mask()
        );
    }

    #[test]
    fn mask_ops() {
        let m = Reg::Eax.mask() | Reg::Ebx.mask();
        assert!(m.contains(Reg::Eax));
        assert!(!m.contains(Reg::Ecx));
        assert_eq!((m - Reg::Eax.mask()).lowest(), Some(Reg::Ebx));
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![Reg::Eax, Reg::Ebx]);
        assert!(Reg::Eax.mask().at_most_one());
        assert!(RBM_NONE.at_most_one());
        assert!(!m.at_most_one());
    }

    #[test]
    fn tmp_order_prefers_eax() {
        assert_eq!(RBM_ALLINT.pick_in_tmp_order(), Some(Reg::Eax));
        let m = Reg::Ecx.mask() | Reg::Edx.mask();
        assert_eq!(m.pick_in_tmp_order(), Some(Reg::Edx));
    }

    #[test]
    fn pair_masks() {
        let p = RegPair::new(Reg::Eax, Reg::Edx);
        assert!(p.is_proper());
        assert_eq!(p.mask(), RBM_PAIR_RETVAL);
        let half = RegPair {
            lo: HalfReg::Reg(Reg::Eax),
            hi: HalfReg::Stk,
        };
        assert!(!half.is_proper());
        assert_eq!(half.mask(), Reg::Eax.mask());
    }
}
