//! The register set manager.
//!
//! Owns the used/locked/multiply-used register masks and the per-register
//! ownership records; grants, locks and frees registers; spills and reloads
//! register contents to and from temp slots. The GC tracker is updated in
//! lockstep with every content change made here.
//!
//! A note on "used": a register holding a node's value is only *protected*
//! once the consumer marks it used ([RegAlloc::mark_used]). Until then the
//! binding is transient and the register may be handed out again. Locked
//! registers are a stronger state still: they may not even be spilled, and
//! asking to spill one is a fatal caller bug.

use crate::{
    config::StressRegs,
    emit::{Emitter, Ins, MemRef},
    gcinfo::{GcInfo, GcKind},
    ir::{Forest, Loc, NodeId, Ty},
    log::{Log, Verbosity},
    target::{
        HalfReg, Reg, RegMask, RegPair, RBM_ALLINT, RBM_CALLEE_SAVED, RBM_NONE, REG_COUNT,
        REG_TMP_ORDER,
    },
    temps::{SlotId, TempAlloc},
    track::RegTracker,
};

/// Should a computed value stay marked used after the operation, or is the
/// caller done with it?
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KeepReg {
    Free,
    Keep,
}

/// One saved use of a multiply-used register: a second (third, ...) live
/// node whose value is the register's current content.
#[derive(Clone, Debug)]
struct MultiDsc {
    tree: NodeId,
    addr: Option<NodeId>,
}

/// One use recorded in a spill event.
#[derive(Clone, Debug)]
struct SpillUse {
    tree: NodeId,
    addr: Option<NodeId>,
}

/// One spill event. When a multiply-used register is spilled, all of its
/// uses travel together and share the one temp (they are the same value).
#[derive(Clone, Debug)]
struct SpillDsc {
    temp: SlotId,
    /// `uses[0]` was the active use at spill time; the rest are the saved
    /// multi uses, newest first.
    uses: Vec<SpillUse>,
}

fn use_if_zero(regs: RegMask, fallback: RegMask) -> RegMask {
    if regs.is_empty() {
        fallback
    } else {
        regs
    }
}

pub struct RegAlloc {
    mask_used: RegMask,
    mask_lock: RegMask,
    mask_mult: RegMask,
    /// Every register ever handed out; consulted so the first allocation
    /// pass avoids dirtying a callee-saved register the method hasn't
    /// touched yet.
    mask_modified: RegMask,
    used_tree: [Option<NodeId>; REG_COUNT],
    used_addr: [Option<NodeId>; REG_COUNT],
    /// Spill events per register, newest at the end.
    spill_desc: [Vec<SpillDsc>; REG_COUNT],
    /// Saved prior uses of multiply-used registers, newest at the end.
    multi_desc: [Vec<MultiDsc>; REG_COUNT],
    pub gc: GcInfo,
    pub tmp: TempAlloc,
    pub trk: RegTracker,
    pub log: Log,
    stress: StressRegs,
}

impl RegAlloc {
    pub fn new(log: Log, stress: StressRegs) -> Self {
        RegAlloc {
            mask_used: RBM_NONE,
            mask_lock: RBM_NONE,
            mask_mult: RBM_NONE,
            mask_modified: RBM_NONE,
            used_tree: [None; REG_COUNT],
            used_addr: [None; REG_COUNT],
            spill_desc: std::array::from_fn(|_| Vec::new()),
            multi_desc: std::array::from_fn(|_| Vec::new()),
            gc: GcInfo::new(),
            tmp: TempAlloc::new(),
            trk: RegTracker::new(),
            log,
            stress,
        }
    }

    // ----------------------------------------------------------------
    // Mask queries.

    /// Any register that isn't used is free. A locked register is always
    /// also used, so locked registers are never free.
    pub fn free_mask(&self) -> RegMask {
        debug_assert!(self.mask_used.contains_all(self.mask_lock));
        RBM_ALLINT - self.mask_used
    }

    /// Registers that may be grabbed (spilling their current contents if
    /// necessary): anything allocatable that isn't locked.
    pub fn can_grab_mask(&self) -> RegMask {
        debug_assert!(self.mask_used.contains_all(self.mask_lock));
        RBM_ALLINT - self.mask_lock
    }

    pub fn used_mask(&self) -> RegMask {
        self.mask_used
    }

    pub fn lock_mask(&self) -> RegMask {
        self.mask_lock
    }

    pub fn mult_mask(&self) -> RegMask {
        self.mask_mult
    }

    pub fn modified_mask(&self) -> RegMask {
        self.mask_modified
    }

    /// The node currently recorded as the register's (primary) owner.
    pub fn owner(&self, reg: Reg) -> Option<NodeId> {
        self.used_tree[usize::from(reg.code())]
    }

    /// Is `node`'s value currently held in `reg`? The register may be used
    /// by several nodes, in which case the saved uses are searched too.
    pub fn is_tree_in_reg(&self, reg: Reg, node: NodeId) -> bool {
        let i = usize::from(reg.code());
        if self.used_tree[i] == Some(node) {
            return true;
        }
        if self.mask_mult.contains(reg) {
            return self.multi_desc[i].iter().any(|d| d.tree == node);
        }
        false
    }

    /// Narrow `regs` to the hint if the hint intersects it; otherwise leave
    /// `regs` alone. Hints are recommendations, never requirements.
    fn narrow_hint(regs: RegMask, hint: RegMask) -> RegMask {
        let narrowed = regs & hint;
        use_if_zero(narrowed, regs)
    }

    /// Choose a register from `mask` in temp-preference order; the first
    /// pass avoids dirtying a callee-saved register the method has never
    /// touched, the second pass takes anything.
    fn pick_in_tmp_order(&self, mask: RegMask) -> Option<Reg> {
        let avoid = RBM_CALLEE_SAVED - self.mask_modified;
        for pass in 0..2 {
            for &reg in &REG_TMP_ORDER {
                if pass == 0 && avoid.contains(reg) {
                    continue;
                }
                if mask.contains(reg) {
                    return Some(reg);
                }
            }
        }
        None
    }

    // ----------------------------------------------------------------
    // Granting registers.

    /// Pick a register known to be free, preferring the hint. It is the
    /// caller's responsibility that one is free.
    pub fn pick_free(&mut self, hint: RegMask) -> Reg {
        let free = self.free_mask();
        assert!(!free.is_empty(), "pick_free with no free registers");
        let regs = Self::narrow_hint(free, hint);
        let reg = self.pick_in_tmp_order(regs).unwrap();
        self.mask_modified |= reg.mask();
        reg
    }

    /// Choose a register from `mask` and return it. If no register in the
    /// set is currently free, one of them will be spilled, even if other
    /// registers outside the set are free.
    ///
    /// # Panics
    ///
    /// If every register in `mask` is locked: that is a caller ordering bug
    /// (too many simultaneously live operands), not a resource condition.
    pub fn grab(&mut self, fo: &mut Forest, em: &mut dyn Emitter, mask: RegMask) -> Reg {
        assert!(!mask.is_empty());
        let mask = mask - self.mask_lock;
        assert!(
            !mask.is_empty(),
            "grab: every candidate register is locked"
        );

        // See if one of the desired registers happens to be free.
        if let Some(reg) = self.pick_in_tmp_order(mask & self.free_mask()) {
            self.mask_modified |= reg.mask();
            return reg;
        }

        // We'll have to spill one of the registers in the mask.
        let ok = mask & self.can_grab_mask();
        let victim = ok.lowest().expect("grab: no register can be spilled");
        self.spill_reg(fo, em, victim);
        self.mask_modified |= victim.mask();
        victim
    }

    /// Find a register to use, spilling if necessary. Free registers are
    /// tried in this order: `free ∩ best`, `free ∩ need`, any free register.
    /// If none is free the victim is drawn from `need` (when possible).
    ///
    /// Both masks are purely recommendations: the returned register can lie
    /// outside them, and under `TJ_STRESS_REGS` deliberately will.
    pub fn pick(
        &mut self,
        fo: &mut Forest,
        em: &mut dyn Emitter,
        need: RegMask,
        best: RegMask,
    ) -> Reg {
        if self.stress == StressRegs::PickInverted {
            // Return a register the caller did *not* ask for, to check that
            // callers cope with unsatisfied recommendations.
            let mut bad = self.can_grab_mask() - (need | best);
            bad = use_if_zero(bad, self.can_grab_mask());
            return self.grab(fo, em, bad);
        }

        let free = self.free_mask();
        if !best.is_empty() {
            if let Some(reg) = self.pick_in_tmp_order(free & best) {
                self.mask_modified |= reg.mask();
                return reg;
            }
        }
        if !need.is_empty() {
            if let Some(reg) = self.pick_in_tmp_order(free & need) {
                self.mask_modified |= reg.mask();
                return reg;
            }
        }
        if let Some(reg) = self.pick_in_tmp_order(free) {
            self.mask_modified |= reg.mask();
            return reg;
        }

        // No choice but to spill; might as well evict from the wanted set.
        let mut spill_from = use_if_zero(need, free);
        if (spill_from & self.can_grab_mask()).is_empty() {
            spill_from = self.can_grab_mask();
        }
        assert!(!spill_from.is_empty(), "pick: every register is locked");
        self.grab(fo, em, spill_from)
    }

    // ----------------------------------------------------------------
    // Used / free transitions.

    /// The register is already used: save the preceding use so the register
    /// can serve both owners, and restore it when one is freed.
    fn rec_multi(&mut self, reg: Reg) {
        let i = usize::from(reg.code());
        debug_assert!(self.mask_used.contains(reg));
        let tree = self.used_tree[i].take().expect("multi-use of ownerless register");
        let addr = self.used_addr[i].take();
        self.multi_desc[i].push(MultiDsc { tree, addr });
        self.mask_mult |= reg.mask();
        self.log.log(
            Verbosity::RegAlloc,
            &format!("{reg} multi-use inc ({} saved)", self.multi_desc[i].len()),
        );
    }

    /// The register has multiple uses; drop the current one and reveal the
    /// most recently saved use.
    fn rmv_multi(&mut self, fo: &Forest, reg: Reg) {
        let i = usize::from(reg.code());
        debug_assert!(self.mask_mult.contains(reg));
        let dsc = self.multi_desc[i].pop().expect("multi mask set but no saved uses");
        if self.multi_desc[i].is_empty() {
            self.mask_mult -= reg.mask();
        }
        // The revealed owner's GC-ness becomes the register's again, unless
        // that owner's value is off in a temp.
        if !fo.node(dsc.tree).spilled {
            self.gc.mark_reg(reg, fo.node(dsc.tree).ty);
        }
        self.used_tree[i] = Some(dsc.tree);
        self.used_addr[i] = dsc.addr;
    }

    /// Mark the register holding `node`'s value as used, transferring the
    /// node's GC-ness onto the register.
    pub fn mark_used(&mut self, fo: &Forest, node: NodeId) {
        self.mark_used_addr(fo, node, None);
    }

    /// Like [Self::mark_used], but also records the indirection node whose
    /// addressing mode this register is pinned for.
    pub fn mark_used_addr(&mut self, fo: &Forest, node: NodeId, addr: Option<NodeId>) {
        let n = fo.node(node);
        assert!(n.in_reg(), "mark_used of a value not in a register");
        let reg = n.reg();
        let i = usize::from(reg.code());

        self.gc.mark_reg(reg, n.ty);

        // No locked register may ever be free.
        debug_assert!((self.mask_lock & self.free_mask()).is_empty());

        if self.mask_used.contains(reg) {
            self.rec_multi(reg);
        }
        self.mask_used |= reg.mask();
        assert!(self.used_tree[i].is_none());
        self.used_tree[i] = Some(node);
        self.used_addr[i] = addr;
        self.log
            .log(Verbosity::RegAlloc, &format!("{reg} now holds [{node:?}]"));
    }

    /// Mark the register pair holding `node`'s value as used. Pair values
    /// are never GC pointers, so both halves are marked not-pointer.
    pub fn mark_pair_used(&mut self, fo: &Forest, node: NodeId) {
        let n = fo.node(node);
        assert_eq!(n.ty, Ty::Long);
        assert!(n.in_reg());
        let pair = n.pair();

        self.gc.mark_mask_npt(pair.mask());
        debug_assert!((self.mask_lock & self.free_mask()).is_empty());

        for half in [pair.lo, pair.hi] {
            if let HalfReg::Reg(reg) = half {
                let i = usize::from(reg.code());
                if self.mask_used.contains(reg) {
                    self.rec_multi(reg);
                }
                self.mask_used |= reg.mask();
                assert!(self.used_tree[i].is_none());
                self.used_tree[i] = Some(node);
            }
        }
    }

    /// Mark the register set as no longer used. Multiply-used members are
    /// not freed outright: the saved prior use is revealed instead.
    pub fn mark_free(&mut self, fo: &Forest, mask: RegMask) {
        if !(mask & self.mask_mult).is_empty() {
            let plain = mask - self.mask_mult;
            for reg in (mask & self.mask_mult).iter() {
                self.rmv_multi(fo, reg);
            }
            if !plain.is_empty() {
                self.mark_free(fo, plain);
            }
            return;
        }

        self.gc.mark_mask_npt(mask);
        for reg in mask.iter() {
            let i = usize::from(reg.code());
            assert!(
                self.used_tree[i].is_some(),
                "freeing {reg} which holds no value"
            );
            self.used_tree[i] = None;
            self.used_addr[i] = None;
        }
        assert!(self.mask_used.contains_all(mask));
        self.mask_used -= mask;
        debug_assert!((self.mask_lock & self.free_mask()).is_empty());
    }

    /// Free `reg` from the given node only. If the register also holds
    /// other still-live nodes it stays used for them.
    pub fn mark_free_one(&mut self, fo: &Forest, reg: Reg, node: NodeId) {
        assert!(self.is_tree_in_reg(reg, node));
        let i = usize::from(reg.code());

        if !self.mask_mult.contains(reg) {
            self.mark_free(fo, reg.mask());
            return;
        }

        if self.used_tree[i] == Some(node) {
            self.rmv_multi(fo, reg);
            return;
        }

        // The node is one of the saved uses; drop just that record.
        let pos = self.multi_desc[i]
            .iter()
            .rposition(|d| d.tree == node)
            .expect("node not found among the register's saved uses");
        self.multi_desc[i].remove(pos);
        if self.multi_desc[i].is_empty() {
            self.mask_mult -= reg.mask();
        }
    }

    // ----------------------------------------------------------------
    // Locking.

    /// Mark the registers as used and locked. They must currently be
    /// neither.
    pub fn lock(&mut self, mask: RegMask) {
        assert!((self.mask_used & mask).is_empty());
        self.mask_used |= mask;
        assert!((self.mask_lock & mask).is_empty());
        self.mask_lock |= mask;
    }

    /// Lock registers that are already marked used.
    pub fn lock_used(&mut self, mask: RegMask) {
        assert!((self.mask_lock & mask).is_empty());
        assert!(self.mask_used.contains_all(mask));
        self.mask_lock |= mask;
    }

    /// Undo [Self::lock].
    pub fn unlock(&mut self, mask: RegMask) {
        assert!(self.mask_used.contains_all(mask));
        self.mask_used -= mask;
        assert!(self.mask_lock.contains_all(mask));
        self.mask_lock -= mask;
    }

    /// Undo [Self::lock_used]: the registers stay used.
    pub fn unlock_used(&mut self, mask: RegMask) {
        assert!(self.mask_used.contains_all(mask));
        assert!(self.mask_lock.contains_all(mask));
        self.mask_lock -= mask;
    }

    /// Lock a set whose members may or may not already be used. Returns the
    /// already-used subset, which must be passed back to
    /// [Self::unlock_mixed].
    pub fn lock_mixed(&mut self, mask: RegMask) -> RegMask {
        let used = self.mask_used & mask;
        let unused = mask - used;
        if !used.is_empty() {
            self.lock_used(used);
        }
        if !unused.is_empty() {
            self.lock(unused);
        }
        used
    }

    pub fn unlock_mixed(&mut self, mask: RegMask, used: RegMask) {
        let unused = mask - used;
        if !used.is_empty() {
            self.unlock_used(used);
        }
        if !unused.is_empty() {
            self.unlock(unused);
        }
    }

    // ----------------------------------------------------------------
    // Spilling.

    /// Spill the given register, which must be marked used and not locked.
    pub fn spill_reg(&mut self, fo: &mut Forest, em: &mut dyn Emitter, reg: Reg) {
        let tree = self.used_tree[usize::from(reg.code())]
            .expect("spilling a register that holds no value");
        self.spill_tree(fo, em, reg, tree);
    }

    pub fn spill_reg_if_used(&mut self, fo: &mut Forest, em: &mut dyn Emitter, reg: Reg) {
        if self.mask_used.contains(reg) && !self.mask_lock.contains(reg) {
            self.spill_reg(fo, em, reg);
        }
    }

    /// Spill every used register in `mask`. None of them may be locked.
    pub fn spill_regs(&mut self, fo: &mut Forest, em: &mut dyn Emitter, mask: RegMask) {
        assert!((mask & self.mask_lock).is_empty(), "spilling locked registers");
        for reg in (mask & self.mask_used).iter() {
            // A pair member spilled earlier in this loop may have freed more
            // than one bit; re-check.
            if self.mask_used.contains(reg) {
                self.spill_reg(fo, em, reg);
            }
        }
    }

    /// The workhorse: store `reg`'s value (the value of `tree`, and of every
    /// saved multi use) to a fresh temp, mark the trees spilled, and free
    /// the register.
    fn spill_tree(&mut self, fo: &mut Forest, em: &mut dyn Emitter, reg: Reg, tree: NodeId) {
        let i = usize::from(reg.code());
        let mask = reg.mask();

        // The register being spilled must be used but not locked.
        assert!(self.mask_used.contains_all(mask));
        assert!(
            (self.mask_lock & mask).is_empty(),
            "spilling locked register {reg}: caller ordering bug"
        );
        debug_assert_eq!(self.used_tree[i], Some(tree));

        let n = fo.node(tree);
        // One half of a pair spills a native word; small types are widened
        // to a word in their temp, the way they are widened in registers.
        let (size, gc) = if n.ty.is_pair() {
            (4, GcKind::None)
        } else {
            (n.ty.stack_size(), GcKind::of(n.ty))
        };

        let temp = self.tmp.take(size, gc);
        em.emit(Ins::Store {
            dst: MemRef::Temp(temp),
            src: reg,
            size,
        });
        self.log.log(
            Verbosity::Spill,
            &format!("{reg} spilled [{tree:?}] to tmp.{}", usize::from(temp)),
        );

        // Gather the active use plus any saved multi uses; they all denote
        // the one value now sitting in the temp.
        let mut uses = vec![SpillUse {
            tree,
            addr: self.used_addr[i].take(),
        }];
        while let Some(m) = self.multi_desc[i].pop() {
            uses.push(SpillUse {
                tree: m.tree,
                addr: m.addr,
            });
        }
        self.mask_mult -= mask;

        for u in &uses {
            // Any addressing mode this register was pinned for is now stale.
            if let Some(a) = u.addr {
                fo.node_mut(a).addr_spilled = true;
            }
            fo.node_mut(u.tree).spilled = true;
        }

        self.spill_desc[i].push(SpillDsc { temp, uses });

        // The register is now free.
        self.used_tree[i] = None;
        self.mask_used -= mask;
        self.gc.mark_mask_npt(mask);
        debug_assert!((self.mask_lock & self.free_mask()).is_empty());
    }

    /// Any spill descriptors outstanding anywhere? Quiet at statement ends.
    pub fn no_pending_spills(&self) -> bool {
        self.spill_desc.iter().all(|v| v.is_empty())
    }

    /// Does `node` have a pending spill from `reg`?
    fn find_spill(&self, reg: Reg, node: NodeId) -> Option<usize> {
        self.spill_desc[usize::from(reg.code())]
            .iter()
            .rposition(|d| d.uses.iter().any(|u| u.tree == node))
    }

    /// Reload one spilled use of `node` (evicted from `old_reg`) into a
    /// register drawn from `need` (or its old register when that is free
    /// and acceptable). Does not mark the new register used.
    fn unspill_one(
        &mut self,
        fo: &mut Forest,
        em: &mut dyn Emitter,
        node: NodeId,
        old_reg: Reg,
        keep_new: KeepReg,
        need: RegMask,
    ) -> Reg {
        let i = usize::from(old_reg.code());
        let di = self
            .find_spill(old_reg, node)
            .expect("unspill of a value that was never spilled");

        // Pick a new home for the value: a register matching `need` if that
        // is non-empty, preferring the old register when it is free.
        let pref = old_reg.mask();
        let mut need = need;
        if (!(pref & need).is_empty() || need.is_empty())
            && !(pref & self.free_mask()).is_empty()
        {
            need = pref;
        }
        let new_reg = self.grab(fo, em, use_if_zero(need, RBM_ALLINT));

        let temp = self.spill_desc[i][di].temp;
        let size = self.tmp.size(temp);
        em.emit(Ins::Load {
            dst: new_reg,
            src: MemRef::Temp(temp),
            size,
        });
        self.log.log(
            Verbosity::Spill,
            &format!("{new_reg} reloaded [{node:?}] from tmp.{}", usize::from(temp)),
        );

        // The register's content is now this value; keep the GC bitsets in
        // step even before anyone marks it used.
        self.trk.trash_reg(new_reg);
        let ty = fo.node(node).ty;
        self.gc.mark_reg(new_reg, if ty.is_pair() { Ty::Int } else { ty });

        // Detach the requested use from the event.
        let pos = self.spill_desc[i][di]
            .uses
            .iter()
            .position(|u| u.tree == node)
            .unwrap();
        self.spill_desc[i][di].uses.remove(pos);

        let others_left = !self.spill_desc[i][di].uses.is_empty();
        if others_left && keep_new == KeepReg::Keep {
            // If the value is going back to its old register and none of the
            // other uses belong to an addressing mode or a pair, reinstate
            // them all as live multi uses of the new register. Otherwise
            // they stay spilled: callers holding an addressability token
            // cached the register mask and cannot be told it changed.
            let ok = new_reg == old_reg
                && ty != Ty::Long
                && self.spill_desc[i][di].uses.iter().all(|u| u.addr.is_none());
            if ok {
                let dsc = self.spill_desc[i].remove(di);
                let ni = usize::from(new_reg.code());
                // Oldest first so the stack ends up newest-at-the-end again.
                for u in dsc.uses.into_iter().rev() {
                    fo.node_mut(u.tree).spilled = false;
                    self.multi_desc[ni].push(MultiDsc {
                        tree: u.tree,
                        addr: u.addr,
                    });
                }
                self.mask_mult |= new_reg.mask();
                self.tmp.release(dsc.temp);
                return new_reg;
            }
            // Temp stays live for the remaining uses.
            return new_reg;
        }

        if !others_left {
            self.spill_desc[i].remove(di);
            self.tmp.release(temp);
        }
        new_reg
    }

    /// The given node's value has been spilled; reload it into a register
    /// in `need` (any register if `need` is empty). With [KeepReg::Keep]
    /// the new register is marked used.
    pub fn unspill(
        &mut self,
        fo: &mut Forest,
        em: &mut dyn Emitter,
        node: NodeId,
        need: RegMask,
        keep: KeepReg,
    ) -> Reg {
        let n = fo.node(node);
        assert!(!n.ty.is_pair(), "use unspill_pair for wide values");
        assert!(n.spilled);
        let old_reg = n.reg();

        // Note the addressing mode the old use belonged to, if any, before
        // the descriptor disappears.
        let addr = self.spill_desc[usize::from(old_reg.code())]
            .iter()
            .rev()
            .find_map(|d| d.uses.iter().find(|u| u.tree == node).map(|u| u.addr))
            .flatten();

        let new_reg = self.unspill_one(fo, em, node, old_reg, keep, need);

        let n = fo.node_mut(node);
        n.loc = Loc::Reg(new_reg);
        n.spilled = false;

        if keep == KeepReg::Keep {
            self.mark_used_addr(fo, node, addr);
        }
        new_reg
    }

    /// Pair variant of [Self::unspill]: either or both halves may have been
    /// spilled, and either half may be homed on the stack. It is assumed the
    /// pair was marked used before the spill (modulo the spillage itself).
    pub fn unspill_pair(
        &mut self,
        fo: &mut Forest,
        em: &mut dyn Emitter,
        node: NodeId,
        need: RegMask,
        keep: KeepReg,
    ) -> RegPair {
        assert!(fo.node(node).ty.is_pair());
        let pair = fo.node(node).pair();
        let mut lo = pair.lo;
        let mut hi = pair.hi;

        if let HalfReg::Reg(lo_reg) = lo {
            if !self.is_tree_in_reg(lo_reg, node) {
                // The low half was spilled. Keep the high half (if it
                // survived) pinned while we grab a home for the low.
                if let HalfReg::Reg(hi_reg) = hi {
                    if self.is_tree_in_reg(hi_reg, node) {
                        self.lock_used(hi_reg.mask());
                        lo = HalfReg::Reg(self.unspill_one(fo, em, node, lo_reg, keep, need));
                        self.unlock_used(hi_reg.mask());
                    } else {
                        lo = HalfReg::Reg(self.unspill_one(fo, em, node, lo_reg, keep, need));
                    }
                } else {
                    lo = HalfReg::Reg(self.unspill_one(fo, em, node, lo_reg, keep, need));
                }
            } else {
                // Still resident; release it so the re-mark below is clean.
                self.mark_free_one(fo, lo_reg, node);
            }
        }

        if let HalfReg::Reg(hi_reg) = hi {
            if !self.is_tree_in_reg(hi_reg, node) {
                let lock_lo = match lo {
                    HalfReg::Reg(r) => r.mask(),
                    HalfReg::Stk => RBM_NONE,
                };
                let used = self.lock_mixed(lock_lo);
                hi = HalfReg::Reg(self.unspill_one(fo, em, node, hi_reg, keep, need));
                self.unlock_mixed(lock_lo, used);
            } else {
                self.mark_free_one(fo, hi_reg, node);
            }
        }

        let new_pair = RegPair { lo, hi };
        let n = fo.node_mut(node);
        n.loc = Loc::Pair(new_pair);
        n.spilled = false;

        if keep == KeepReg::Keep {
            self.mark_pair_used(fo, node);
        }
        new_pair
    }

    // ----------------------------------------------------------------
    // Pairs.

    /// Choose a register pair from `mask` (only registers in the set are
    /// considered), spilling one or two used registers if it has no two
    /// free members.
    pub fn grab_pair(&mut self, fo: &mut Forest, em: &mut dyn Emitter, mask: RegMask) -> RegPair {
        assert!(!mask.is_empty());
        let mask = mask - self.mask_lock;
        assert!(mask.count() >= 2, "grab_pair: fewer than two grabbable registers");

        let ok = mask & self.free_mask();
        let r1 = match self.pick_in_tmp_order(ok) {
            Some(r) => {
                self.mask_modified |= r.mask();
                r
            }
            None => self.grab(fo, em, mask),
        };

        // Hold the first register so grabbing the second can't take it.
        self.lock(r1.mask());
        let r2 = self.grab(fo, em, mask - r1.mask());
        self.unlock(r1.mask());

        if r1.code() < r2.code() {
            RegPair::new(r1, r2)
        } else {
            RegPair::new(r2, r1)
        }
    }

    /// Choose a register pair from `mask` (or from all available registers
    /// when `mask` is empty), preferring free pairs over spilling.
    pub fn pick_pair(&mut self, fo: &mut Forest, em: &mut dyn Emitter, mask: RegMask) -> RegPair {
        let free = self.free_mask();
        let ok = if mask.is_empty() { free } else { free & mask };
        if ok.count() >= 2 {
            let r1 = self.pick_in_tmp_order(ok).unwrap();
            let r2 = self.pick_in_tmp_order(ok - r1.mask()).unwrap();
            self.mask_modified |= r1.mask() | r2.mask();
            return if r1.code() < r2.code() {
                RegPair::new(r1, r2)
            } else {
                RegPair::new(r2, r1)
            };
        }
        // The recommended set didn't pan out; retry against all free
        // registers before resorting to spilling.
        if !mask.is_empty() && free.count() >= 2 {
            let r1 = self.pick_in_tmp_order(free).unwrap();
            let r2 = self.pick_in_tmp_order(free - r1.mask()).unwrap();
            self.mask_modified |= r1.mask() | r2.mask();
            return if r1.code() < r2.code() {
                RegPair::new(r1, r2)
            } else {
                RegPair::new(r2, r1)
            };
        }
        let mut spill_from = use_if_zero(mask, free);
        if (spill_from & self.can_grab_mask()).count() < 2 {
            spill_from = self.can_grab_mask();
        }
        self.grab_pair(fo, em, spill_from)
    }

    // ----------------------------------------------------------------
    // Block boundaries.

    /// Block entry: nothing survives. All registers are assumed trashed, so
    /// nothing may still be marked used or spilled (the caller must have
    /// wound the protocol down first).
    pub fn assert_quiescent(&self) {
        assert!(
            self.mask_used.is_empty(),
            "registers still used at a boundary: {:?}",
            self.mask_used
        );
        assert!(self.mask_lock.is_empty());
        assert!(self.mask_mult.is_empty());
        assert!(self.no_pending_spills(), "unresolved spills at a boundary");
        assert!(self.tmp.all_free(), "leaked spill temps at a boundary");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::StressRegs,
        emit::BufEmitter,
        ir::{Forest, Loc, Oper},
        log::Log,
        target::{Reg, RBM_NONE},
    };

    fn new_ra() -> RegAlloc {
        RegAlloc::new(Log::new().unwrap(), StressRegs::Off)
    }

    /// Make a node and pretend codegen just produced its value in `reg`.
    fn resident(fo: &mut Forest, ty: Ty, reg: Reg) -> NodeId {
        let id = fo.add(Oper::ConstInt(0), ty).unwrap();
        fo.node_mut(id).loc = Loc::Reg(reg);
        id
    }

    #[test]
    fn kept_registers_are_never_free() {
        let mut fo = Forest::new();
        let mut em = BufEmitter::new();
        let mut ra = new_ra();

        let r = ra.pick(&mut fo, &mut em, RBM_NONE, RBM_NONE);
        let n = resident(&mut fo, Ty::Int, r);
        ra.mark_used(&fo, n);
        assert!(!ra.free_mask().contains(r));

        // Grant every other register too; with everything used, a further
        // pick must spill, and the spilled register must be one of ours.
        for _ in 0..RBM_ALLINT.count() - 1 {
            let r2 = ra.pick(&mut fo, &mut em, RBM_NONE, RBM_NONE);
            let n2 = resident(&mut fo, Ty::Int, r2);
            ra.mark_used(&fo, n2);
        }
        assert!(ra.free_mask().is_empty());
        let victim = ra.pick(&mut fo, &mut em, RBM_NONE, RBM_NONE);
        assert!(RBM_ALLINT.contains(victim));
        // The victim's old owner is now recorded as spilled.
        assert!(!ra.no_pending_spills());
    }

    #[test]
    fn spill_then_unspill_round_trips() {
        let mut fo = Forest::new();
        let mut em = BufEmitter::new();
        let mut ra = new_ra();

        let n = resident(&mut fo, Ty::Ref, Reg::Esi);
        ra.mark_used(&fo, n);
        assert_eq!(ra.gc.kind_of(Reg::Esi), crate::gcinfo::GcKind::Ref);

        ra.spill_reg(&mut fo, &mut em, Reg::Esi);
        assert!(fo.node(n).spilled);
        assert!(ra.free_mask().contains(Reg::Esi));
        assert_eq!(ra.gc.kind_of(Reg::Esi), crate::gcinfo::GcKind::None);
        assert!(!ra.tmp.all_free());

        let new = ra.unspill(&mut fo, &mut em, n, Reg::Esi.mask(), KeepReg::Keep);
        assert_eq!(new, Reg::Esi);
        assert!(!fo.node(n).spilled);
        assert_eq!(fo.node(n).reg(), Reg::Esi);
        assert_eq!(ra.owner(Reg::Esi), Some(n));
        assert_eq!(ra.gc.kind_of(Reg::Esi), crate::gcinfo::GcKind::Ref);
        assert!(ra.tmp.all_free());

        // The reload came from the same temp the spill went to.
        let text = em.text();
        assert!(text.contains("mov dword [tmp.0], esi"));
        assert!(text.contains("mov esi, dword [tmp.0]"));
    }

    #[test]
    fn multi_use_frees_one_owner_at_a_time() {
        let mut fo = Forest::new();
        let mut em = BufEmitter::new();
        let mut ra = new_ra();

        let first = resident(&mut fo, Ty::Ref, Reg::Ebx);
        ra.mark_used(&fo, first);
        // A second node reuses the same register (same value, two trees).
        let second = resident(&mut fo, Ty::Ref, Reg::Ebx);
        ra.mark_used(&fo, second);
        assert!(ra.mult_mask().contains(Reg::Ebx));

        // Freeing one owner leaves the register used by the other, with its
        // GC-ness intact.
        ra.mark_free_one(&fo, Reg::Ebx, second);
        assert!(ra.used_mask().contains(Reg::Ebx));
        assert!(!ra.mult_mask().contains(Reg::Ebx));
        assert_eq!(ra.owner(Reg::Ebx), Some(first));
        assert_eq!(ra.gc.kind_of(Reg::Ebx), crate::gcinfo::GcKind::Ref);

        ra.mark_free_one(&fo, Reg::Ebx, first);
        assert!(ra.free_mask().contains(Reg::Ebx));
        assert_eq!(ra.gc.kind_of(Reg::Ebx), crate::gcinfo::GcKind::None);
        ra.assert_quiescent();
        let _ = em;
    }

    #[test]
    fn multi_use_spill_and_unspill_reinstates_all_owners() {
        let mut fo = Forest::new();
        let mut em = BufEmitter::new();
        let mut ra = new_ra();

        let first = resident(&mut fo, Ty::Int, Reg::Esi);
        ra.mark_used(&fo, first);
        let second = resident(&mut fo, Ty::Int, Reg::Esi);
        ra.mark_used(&fo, second);

        ra.spill_reg(&mut fo, &mut em, Reg::Esi);
        assert!(fo.node(first).spilled);
        assert!(fo.node(second).spilled);

        // Unspilling the active use back into the same register brings the
        // other owner back to life as a multi use.
        let new = ra.unspill(&mut fo, &mut em, second, Reg::Esi.mask(), KeepReg::Keep);
        assert_eq!(new, Reg::Esi);
        assert!(!fo.node(first).spilled);
        assert!(ra.mult_mask().contains(Reg::Esi));
        assert!(ra.is_tree_in_reg(Reg::Esi, first));
        assert!(ra.is_tree_in_reg(Reg::Esi, second));
        assert!(ra.tmp.all_free());
    }

    #[test]
    #[should_panic(expected = "locked")]
    fn spilling_a_locked_register_is_fatal() {
        let mut fo = Forest::new();
        let mut em = BufEmitter::new();
        let mut ra = new_ra();

        let n = resident(&mut fo, Ty::Int, Reg::Eax);
        ra.mark_used(&fo, n);
        ra.lock_used(Reg::Eax.mask());
        ra.spill_regs(&mut fo, &mut em, Reg::Eax.mask());
    }

    #[test]
    #[should_panic(expected = "locked")]
    fn grab_with_everything_locked_is_fatal() {
        let mut fo = Forest::new();
        let mut em = BufEmitter::new();
        let mut ra = new_ra();
        ra.lock(RBM_ALLINT);
        ra.grab(&mut fo, &mut em, RBM_ALLINT);
    }

    #[test]
    fn grab_prefers_free_members_and_spills_within_the_mask() {
        let mut fo = Forest::new();
        let mut em = BufEmitter::new();
        let mut ra = new_ra();

        // Occupy EAX.
        let n = resident(&mut fo, Ty::Int, Reg::Eax);
        ra.mark_used(&fo, n);

        // Grabbing from {EAX, EBX} takes the free EBX without spilling.
        let got = ra.grab(&mut fo, &mut em, Reg::Eax.mask() | Reg::Ebx.mask());
        assert_eq!(got, Reg::Ebx);
        assert!(ra.no_pending_spills());

        // Grabbing from {EAX} alone must evict the tenant.
        let got = ra.grab(&mut fo, &mut em, Reg::Eax.mask());
        assert_eq!(got, Reg::Eax);
        assert!(fo.node(n).spilled);
    }

    #[test]
    fn pick_honors_best_then_need_then_any() {
        let mut fo = Forest::new();
        let mut em = BufEmitter::new();
        let mut ra = new_ra();

        let r = ra.pick(&mut fo, &mut em, Reg::Ecx.mask(), Reg::Esi.mask());
        assert_eq!(r, Reg::Esi);
        let r = ra.pick(&mut fo, &mut em, Reg::Ecx.mask(), RBM_NONE);
        assert_eq!(r, Reg::Ecx);
        // With nothing free in `need`, any free register is acceptable.
        let n = resident(&mut fo, Ty::Int, Reg::Ecx);
        ra.mark_used(&fo, n);
        let r = ra.pick(&mut fo, &mut em, Reg::Ecx.mask(), RBM_NONE);
        assert_ne!(r, Reg::Ecx);
        assert!(ra.no_pending_spills());
    }

    #[test]
    fn unspill_prefers_the_old_register() {
        let mut fo = Forest::new();
        let mut em = BufEmitter::new();
        let mut ra = new_ra();

        let n = resident(&mut fo, Ty::Int, Reg::Edi);
        ra.mark_used(&fo, n);
        ra.spill_reg(&mut fo, &mut em, Reg::Edi);
        // No mask constraint: the old register is free, so it is reused.
        let new = ra.unspill(&mut fo, &mut em, n, RBM_NONE, KeepReg::Free);
        assert_eq!(new, Reg::Edi);
        // Transient binding only: the register is not marked used.
        assert!(ra.free_mask().contains(Reg::Edi));
    }

    #[test]
    fn pair_grab_yields_two_distinct_registers() {
        let mut fo = Forest::new();
        let mut em = BufEmitter::new();
        let mut ra = new_ra();

        let p = ra.pick_pair(&mut fo, &mut em, RBM_NONE);
        assert!(p.is_proper());

        // With all but two registers used, picking still succeeds without a
        // spill.
        let mut ra = new_ra();
        for reg in [Reg::Eax, Reg::Ecx, Reg::Edx, Reg::Ebx] {
            let n = resident(&mut fo, Ty::Int, reg);
            ra.mark_used(&fo, n);
        }
        let p = ra.pick_pair(&mut fo, &mut em, RBM_NONE);
        assert!(p.is_proper());
        assert_eq!(p.mask(), Reg::Esi.mask() | Reg::Edi.mask());
        assert!(ra.no_pending_spills());
    }

    #[test]
    fn pair_unspill_restores_both_halves() {
        let mut fo = Forest::new();
        let mut em = BufEmitter::new();
        let mut ra = new_ra();

        let n = fo.add(Oper::ConstLng(0x1_0000_0002), Ty::Long).unwrap();
        fo.node_mut(n).loc = Loc::Pair(RegPair::new(Reg::Eax, Reg::Edx));
        ra.mark_pair_used(&fo, n);

        // Evict just the low half.
        ra.spill_reg(&mut fo, &mut em, Reg::Eax);
        assert!(fo.node(n).spilled);
        assert!(ra.used_mask().contains(Reg::Edx));

        let p = ra.unspill_pair(&mut fo, &mut em, n, RBM_NONE, KeepReg::Keep);
        assert!(p.is_proper());
        assert_eq!(p.hi, HalfReg::Reg(Reg::Edx));
        assert!(!fo.node(n).spilled);
        assert!(ra.used_mask().contains_all(p.mask()));
        assert!(ra.tmp.all_free());
    }

    #[test]
    fn callee_saved_avoided_until_needed() {
        let mut fo = Forest::new();
        let mut em = BufEmitter::new();
        let mut ra = new_ra();
        // First picks come from the caller-trash set.
        let r1 = ra.pick(&mut fo, &mut em, RBM_NONE, RBM_NONE);
        assert!(crate::target::RBM_CALLEE_TRASH.contains(r1));
    }
}
