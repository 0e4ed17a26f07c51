//! Precise GC pointer tracking.
//!
//! Two register masks record which registers currently hold live object
//! references and interior pointers; a tracked-local bitset records which
//! live locals are GC-typed. The cardinal rule is that these move in
//! lockstep with every register-content change: there is no "temporarily
//! inconsistent" state observable at an instruction boundary that can be a
//! collection point.

use crate::{
    ir::{Forest, NodeId, Ty},
    liveness::{Liveness, VarSet},
    target::{Reg, RegMask, RBM_NONE},
};

/// The GC-ness of a value or slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GcKind {
    None,
    Ref,
    Byref,
}

impl GcKind {
    pub fn of(ty: Ty) -> GcKind {
        match ty {
            Ty::Ref => GcKind::Ref,
            Ty::Byref => GcKind::Byref,
            _ => GcKind::None,
        }
    }
}

/// Which write barrier, if any, a store must go through.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Barrier {
    None,
    /// The target is provably a heap object: the plain barrier helper.
    Unchecked,
    /// The target may be outside the heap (e.g. a byref that could point at
    /// a stack location): the helper that range-checks first.
    Checked,
}

/// The live GC pointer set recorded for the stack map at a call site.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CallSiteGc {
    pub gcrefs: RegMask,
    pub byrefs: RegMask,
    pub gc_lcls: VarSet,
}

#[derive(Debug, Default)]
pub struct GcInfo {
    reg_gcref: RegMask,
    reg_byref: RegMask,
    /// Live tracked locals whose (frame-homed) value is a GC pointer.
    live_gc_lcls: VarSet,
    /// Locals whose frame home's GC-ness has been registered with the
    /// stack-map side of the emitter. Registration happens once per method.
    frame_reported: VarSet,
}

impl GcInfo {
    pub fn new() -> Self {
        GcInfo::default()
    }

    pub fn reg_gcref(&self) -> RegMask {
        self.reg_gcref
    }

    pub fn reg_byref(&self) -> RegMask {
        self.reg_byref
    }

    /// All registers currently holding a GC pointer of either flavor.
    pub fn gc_regs(&self) -> RegMask {
        self.reg_gcref | self.reg_byref
    }

    pub fn kind_of(&self, reg: Reg) -> GcKind {
        if self.reg_gcref.contains(reg) {
            GcKind::Ref
        } else if self.reg_byref.contains(reg) {
            GcKind::Byref
        } else {
            GcKind::None
        }
    }

    /// Record that `reg` now holds a value of type `ty`. Clears any previous
    /// GC-ness; the two masks stay disjoint.
    pub fn mark_reg(&mut self, reg: Reg, ty: Ty) {
        self.mark_reg_kind(reg, GcKind::of(ty));
    }

    pub fn mark_reg_kind(&mut self, reg: Reg, kind: GcKind) {
        let m = reg.mask();
        self.reg_gcref -= m;
        self.reg_byref -= m;
        match kind {
            GcKind::None => (),
            GcKind::Ref => self.reg_gcref |= m,
            GcKind::Byref => self.reg_byref |= m,
        }
        debug_assert!((self.reg_gcref & self.reg_byref).is_empty());
    }

    /// Record that no register in `mask` holds a GC pointer.
    pub fn mark_mask_npt(&mut self, mask: RegMask) {
        self.reg_gcref -= mask;
        self.reg_byref -= mask;
    }

    /// `dst` now holds a copy of `src`'s value; `src` is unchanged.
    pub fn copy(&mut self, dst: Reg, src: Reg) {
        self.mark_reg_kind(dst, self.kind_of(src));
    }

    /// The values of `a` and `b` have been exchanged.
    pub fn swap(&mut self, a: Reg, b: Reg) {
        let ka = self.kind_of(a);
        let kb = self.kind_of(b);
        self.mark_reg_kind(a, kb);
        self.mark_reg_kind(b, ka);
    }

    /// Block entry / label: no register provably holds a pointer.
    pub fn clear_regs(&mut self) {
        self.reg_gcref = RBM_NONE;
        self.reg_byref = RBM_NONE;
    }

    pub fn live_gc_lcls(&self) -> VarSet {
        self.live_gc_lcls
    }

    /// A GC-typed local becomes live. Registers the frame home's GC-ness
    /// with the stack map the first time the local is seen; returns `true`
    /// if this call did the registration.
    pub fn lcl_birth(&mut self, lcl: crate::ir::LclId, ty: Ty) -> bool {
        debug_assert!(ty.is_gc());
        self.live_gc_lcls.insert(lcl);
        if self.frame_reported.contains(lcl) {
            false
        } else {
            self.frame_reported.insert(lcl);
            true
        }
    }

    pub fn lcl_death(&mut self, lcl: crate::ir::LclId) {
        self.live_gc_lcls.remove(lcl);
    }

    /// Reset the per-block local state from a block's live-in set.
    pub fn set_live_lcls(&mut self, live: &Liveness) {
        let mut s = VarSet::EMPTY;
        for lcl in live.cur_live().iter() {
            if live.lcl(lcl).ty.is_gc() {
                s.insert(lcl);
            }
        }
        self.live_gc_lcls = s;
    }

    /// Wind the register masks back to a snapshot. Only the ternary
    /// branch-merge logic may do this: it re-runs codegen from a state it
    /// saved, so the snapshot is the truth.
    pub fn restore_regs(&mut self, gcref: RegMask, byref: RegMask) {
        debug_assert!((gcref & byref).is_empty());
        self.reg_gcref = gcref;
        self.reg_byref = byref;
    }

    /// Snapshot counterpart of [Self::restore_regs] for the local set.
    pub fn restore_live_lcls(&mut self, s: VarSet) {
        self.live_gc_lcls = s;
    }

    /// The snapshot recorded for the stack map when a call is emitted.
    pub fn call_site(&self, live: &Liveness) -> CallSiteGc {
        // The local set is recomputed from liveness rather than read from
        // live_gc_lcls so the two can be cross-checked in debug builds.
        let mut gc_lcls = VarSet::EMPTY;
        for lcl in live.cur_live().iter() {
            if live.lcl(lcl).ty.is_gc() {
                gc_lcls.insert(lcl);
            }
        }
        debug_assert_eq!(gc_lcls, self.live_gc_lcls);
        CallSiteGc {
            gcrefs: self.reg_gcref,
            byrefs: self.reg_byref,
            gc_lcls,
        }
    }
}

/// Decide the write-barrier dispatch for a store of a `src_ty`-typed value
/// through the address computed by `addr`.
///
/// Only object references need a barrier. A store through an address that is
/// itself an object reference lands in a heap object and takes the plain
/// helper; a byref (or anything else we cannot prove) may point at a stack
/// or static location and takes the range-checked helper.
pub fn store_barrier(fo: &Forest, addr: NodeId, src_ty: Ty) -> Barrier {
    if src_ty != Ty::Ref {
        return Barrier::None;
    }
    match fo.node(addr).ty {
        Ty::Ref => Barrier::Unchecked,
        _ => Barrier::Checked,
    }
}

/// Stores to class statics go through the checked barrier: the static area
/// is outside the managed heap.
pub fn cls_var_barrier(src_ty: Ty) -> Barrier {
    if src_ty == Ty::Ref {
        Barrier::Checked
    } else {
        Barrier::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Reg;

    #[test]
    fn masks_stay_disjoint() {
        let mut gc = GcInfo::new();
        gc.mark_reg(Reg::Eax, Ty::Ref);
        assert_eq!(gc.kind_of(Reg::Eax), GcKind::Ref);
        gc.mark_reg(Reg::Eax, Ty::Byref);
        assert_eq!(gc.kind_of(Reg::Eax), GcKind::Byref);
        assert!(!gc.reg_gcref().contains(Reg::Eax));
        gc.mark_reg(Reg::Eax, Ty::Int);
        assert_eq!(gc.kind_of(Reg::Eax), GcKind::None);
        assert!(gc.gc_regs().is_empty());
    }

    #[test]
    fn copy_and_swap_transfer_kinds() {
        let mut gc = GcInfo::new();
        gc.mark_reg(Reg::Esi, Ty::Ref);
        gc.mark_reg(Reg::Edi, Ty::Byref);
        gc.copy(Reg::Eax, Reg::Esi);
        assert_eq!(gc.kind_of(Reg::Eax), GcKind::Ref);
        assert_eq!(gc.kind_of(Reg::Esi), GcKind::Ref);
        gc.swap(Reg::Esi, Reg::Edi);
        assert_eq!(gc.kind_of(Reg::Esi), GcKind::Byref);
        assert_eq!(gc.kind_of(Reg::Edi), GcKind::Ref);
    }

    #[test]
    fn frame_home_reported_once() {
        let mut gc = GcInfo::new();
        let mut live = Liveness::new();
        let l = live.add_lcl(Ty::Ref, 4).unwrap();
        assert!(gc.lcl_birth(l, Ty::Ref));
        gc.lcl_death(l);
        assert!(!gc.lcl_birth(l, Ty::Ref));
        assert!(gc.live_gc_lcls().contains(l));
    }

    #[test]
    fn barrier_dispatch() {
        let mut fo = Forest::new();
        let obj = fo.lcl_var(crate::ir::LclId::new(0).unwrap(), Ty::Ref);
        let byref = fo.lcl_var(crate::ir::LclId::new(1).unwrap(), Ty::Byref);
        assert_eq!(store_barrier(&fo, obj, Ty::Ref), Barrier::Unchecked);
        assert_eq!(store_barrier(&fo, byref, Ty::Ref), Barrier::Checked);
        assert_eq!(store_barrier(&fo, obj, Ty::Int), Barrier::None);
        assert_eq!(cls_var_barrier(Ty::Ref), Barrier::Checked);
        assert_eq!(cls_var_barrier(Ty::Int), Barrier::None);
    }
}
