//! Register content tracking and the condition-flags cache.
//!
//! [RegTracker] remembers, per register, whether the register is known to
//! hold a particular constant or a particular local's current value, so leaf
//! loads can reuse register contents instead of re-loading them. It is a
//! cache of facts, not an ownership record: anything it claims must be
//! re-establishable from the frame, and clearing it is always sound.
//!
//! [FlagsCache] remembers which register or local the hardware condition
//! flags currently reflect, so a compare against zero can be elided.

use crate::{
    ir::LclId,
    target::{Reg, RegMask, REG_COUNT},
};
use strum::IntoEnumIterator;

/// What we know a register to hold.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegVal {
    /// Nothing known.
    Trash,
    Const(i32),
    /// The current value of a local.
    Lcl(LclId),
    /// The low half of a long local.
    LclLo(LclId),
    /// The high half of a long local.
    LclHi(LclId),
}

#[derive(Debug)]
pub struct RegTracker {
    vals: [RegVal; REG_COUNT],
}

impl Default for RegTracker {
    fn default() -> Self {
        RegTracker {
            vals: [RegVal::Trash; REG_COUNT],
        }
    }
}

impl RegTracker {
    pub fn new() -> Self {
        RegTracker::default()
    }

    /// Assume all registers contain garbage (block entry, labels).
    pub fn clear(&mut self) {
        self.vals = [RegVal::Trash; REG_COUNT];
    }

    pub fn trash_reg(&mut self, reg: Reg) {
        self.vals[usize::from(reg.code())] = RegVal::Trash;
    }

    pub fn trash_mask(&mut self, mask: RegMask) {
        for reg in mask.iter() {
            self.trash_reg(reg);
        }
    }

    /// The value of `lcl` changed: forget every register mirroring it.
    pub fn trash_lcl(&mut self, lcl: LclId) {
        for v in self.vals.iter_mut() {
            match v {
                RegVal::Lcl(l) | RegVal::LclLo(l) | RegVal::LclHi(l) if *l == lcl => {
                    *v = RegVal::Trash
                }
                _ => (),
            }
        }
    }

    /// A store may have changed any local's home: forget every register
    /// mirroring a local, leaving known constants alone.
    pub fn trash_all_lcls(&mut self) {
        for v in self.vals.iter_mut() {
            match v {
                RegVal::Lcl(_) | RegVal::LclLo(_) | RegVal::LclHi(_) => *v = RegVal::Trash,
                _ => (),
            }
        }
    }

    pub fn set_const(&mut self, reg: Reg, val: i32) {
        self.vals[usize::from(reg.code())] = RegVal::Const(val);
    }

    pub fn set_lcl(&mut self, reg: Reg, lcl: LclId) {
        self.vals[usize::from(reg.code())] = RegVal::Lcl(lcl);
    }

    pub fn set_lcl_half(&mut self, reg: Reg, lcl: LclId, low: bool) {
        self.vals[usize::from(reg.code())] = if low {
            RegVal::LclLo(lcl)
        } else {
            RegVal::LclHi(lcl)
        };
    }

    /// `dst` now holds a copy of `src`'s value.
    pub fn copy(&mut self, dst: Reg, src: Reg) {
        self.vals[usize::from(dst.code())] = self.vals[usize::from(src.code())];
    }

    pub fn swap(&mut self, a: Reg, b: Reg) {
        self.vals.swap(usize::from(a.code()), usize::from(b.code()));
    }

    /// A register known to hold the constant `val`, constrained to `ok`.
    pub fn const_in_reg(&self, val: i32, ok: RegMask) -> Option<Reg> {
        Reg::iter().find(|r| {
            ok.contains(*r) && self.vals[usize::from(r.code())] == RegVal::Const(val)
        })
    }

    /// A register known to hold the current value of `lcl`, constrained to
    /// `ok`.
    pub fn lcl_in_reg(&self, lcl: LclId, ok: RegMask) -> Option<Reg> {
        Reg::iter().find(|r| {
            ok.contains(*r) && self.vals[usize::from(r.code())] == RegVal::Lcl(lcl)
        })
    }

    pub fn lcl_half_in_reg(&self, lcl: LclId, low: bool, ok: RegMask) -> Option<Reg> {
        let want = if low {
            RegVal::LclLo(lcl)
        } else {
            RegVal::LclHi(lcl)
        };
        Reg::iter().find(|r| ok.contains(*r) && self.vals[usize::from(r.code())] == want)
    }
}

/// What the condition flags currently reflect.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum FlagsSrc {
    Reg(Reg),
    Lcl(LclId),
}

/// Caches whether the hardware flags already reflect a register's or local's
/// value, to elide redundant compares against zero.
#[derive(Debug, Default)]
pub struct FlagsCache {
    src: Option<FlagsSrc>,
}

impl FlagsCache {
    pub fn new() -> Self {
        FlagsCache::default()
    }

    pub fn trash(&mut self) {
        self.src = None;
    }

    /// The flags now reflect `reg`'s value (an ALU op just targeted it).
    pub fn set_for_reg(&mut self, reg: Reg) {
        self.src = Some(FlagsSrc::Reg(reg));
    }

    pub fn set_for_lcl(&mut self, lcl: LclId) {
        self.src = Some(FlagsSrc::Lcl(lcl));
    }

    /// `reg` was overwritten without the flags tracking it.
    pub fn trash_if_reg(&mut self, reg: Reg) {
        if self.src == Some(FlagsSrc::Reg(reg)) {
            self.src = None;
        }
    }

    pub fn trash_if_lcl(&mut self, lcl: LclId) {
        if self.src == Some(FlagsSrc::Lcl(lcl)) {
            self.src = None;
        }
    }

    pub fn reflects_reg(&self, reg: Reg) -> bool {
        self.src == Some(FlagsSrc::Reg(reg))
    }

    pub fn reflects_lcl(&self, lcl: LclId) -> bool {
        self.src == Some(FlagsSrc::Lcl(lcl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::RBM_ALLINT;

    fn lcl(i: usize) -> LclId {
        LclId::new(i).unwrap()
    }

    #[test]
    fn constant_reuse() {
        let mut trk = RegTracker::new();
        trk.set_const(Reg::Esi, 7);
        assert_eq!(trk.const_in_reg(7, RBM_ALLINT), Some(Reg::Esi));
        assert_eq!(trk.const_in_reg(8, RBM_ALLINT), None);
        assert_eq!(trk.const_in_reg(7, Reg::Eax.mask()), None);
        trk.trash_reg(Reg::Esi);
        assert_eq!(trk.const_in_reg(7, RBM_ALLINT), None);
    }

    #[test]
    fn lcl_tracking_dies_with_the_lcl() {
        let mut trk = RegTracker::new();
        trk.set_lcl(Reg::Eax, lcl(3));
        trk.set_lcl_half(Reg::Ebx, lcl(4), true);
        assert_eq!(trk.lcl_in_reg(lcl(3), RBM_ALLINT), Some(Reg::Eax));
        assert_eq!(trk.lcl_half_in_reg(lcl(4), true, RBM_ALLINT), Some(Reg::Ebx));
        trk.trash_lcl(lcl(3));
        assert_eq!(trk.lcl_in_reg(lcl(3), RBM_ALLINT), None);
        // Copies follow values.
        trk.copy(Reg::Ecx, Reg::Ebx);
        assert_eq!(trk.lcl_half_in_reg(lcl(4), true, Reg::Ecx.mask()), Some(Reg::Ecx));
    }

    #[test]
    fn flags_cache() {
        let mut fl = FlagsCache::new();
        fl.set_for_reg(Reg::Eax);
        assert!(fl.reflects_reg(Reg::Eax));
        fl.trash_if_reg(Reg::Ebx);
        assert!(fl.reflects_reg(Reg::Eax));
        fl.trash_if_reg(Reg::Eax);
        assert!(!fl.reflects_reg(Reg::Eax));
        fl.set_for_lcl(lcl(1));
        assert!(fl.reflects_lcl(lcl(1)));
        fl.trash();
        assert!(!fl.reflects_lcl(lcl(1)));
    }
}
