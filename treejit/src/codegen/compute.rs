//! Value materialization: evaluating an IR sub-tree into a register (or
//! register pair) under caller constraints.
//!
//! A value freshly produced here has only a *transient* register binding:
//! the register may be reused by the next independent computation. Callers
//! that need the value to survive intervening codegen pass [KeepReg::Keep]
//! and later either consume the value or release the register; a kept value
//! that got spilled in the interim must be brought back with
//! [CodeGen::recover] before reuse.

use crate::{
    emit::{AluOp, Emitter, Ins, MemRef, RegImm},
    ir::{strip_comma, BinOp, Loc, NodeId, Oper, Ty},
    regalloc::KeepReg,
    target::{HalfReg, Reg, RegMask, RegPair, RBM_ALLINT, RBM_NONE},
};

use super::CodeGen;

/// Must the result land inside the requested mask, or is the mask merely a
/// preference?
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Exactness {
    Any,
    Exact,
}

fn alu_for(op: BinOp) -> AluOp {
    match op {
        BinOp::Add => AluOp::Add,
        BinOp::Sub => AluOp::Sub,
        BinOp::Mul => AluOp::Imul,
        BinOp::And => AluOp::And,
        BinOp::Or => AluOp::Or,
        BinOp::Xor => AluOp::Xor,
        BinOp::Lsh => AluOp::Shl,
        BinOp::Rsh => AluOp::Shr,
    }
}

impl<E: Emitter> CodeGen<E> {
    /// Evaluate `node` into a register satisfying the caller's constraints:
    ///
    /// * `need`/`exact`: with [Exactness::Exact] the result is guaranteed to
    ///   land in `need` (copied there if necessary); with [Exactness::Any]
    ///   the mask is a preference only.
    /// * `free_only`: guarantee the returned register carries no other
    ///   claim, so the caller may destroy its contents.
    /// * `keep`: mark the result register used so it survives intervening
    ///   computations.
    pub fn compute_into(
        &mut self,
        node: NodeId,
        need: RegMask,
        exact: Exactness,
        keep: KeepReg,
        free_only: bool,
    ) -> Reg {
        let (effects, node) = strip_comma(&self.fo, node);
        for e in effects {
            self.gen_side_effect(e);
        }
        assert!(
            !self.fo.node(node).ty.is_pair(),
            "compute_into on a wide value; use compute_into_pair"
        );

        let mut reg = self.gen_into_reg(node, need);

        let wrong_reg = exact == Exactness::Exact && !need.is_empty() && !need.contains(reg);
        let shared = free_only
            && self.ra.used_mask().contains(reg)
            && !(self.ra.owner(reg) == Some(node) && !self.ra.mult_mask().contains(reg));

        if wrong_reg || shared {
            let dest_mask = if exact == Exactness::Exact && !need.is_empty() {
                need
            } else {
                RBM_ALLINT - reg.mask()
            };
            let held = self.ra.lock_mixed(reg.mask());
            let new = self.ra.pick(&mut self.fo, &mut self.em, dest_mask, RBM_NONE);
            self.ra.unlock_mixed(reg.mask(), held);
            if new != reg {
                self.emit_copy(new, reg);
                if self.ra.is_tree_in_reg(reg, node) {
                    self.ra.mark_free_one(&self.fo, reg, node);
                }
                self.fo.node_mut(node).loc = Loc::Reg(new);
                reg = new;
            }
        }

        if keep == KeepReg::Keep && !self.ra.is_tree_in_reg(reg, node) {
            self.ra.mark_used(&self.fo, node);
        }
        reg
    }

    /// Re-establish a previously computed value before reuse: reload it if
    /// it was spilled, move it if it sits outside `need`, and re-assert its
    /// GC tracking. Must be called whenever a value's liveness spans an
    /// intervening computation that could have spilled it.
    pub fn recover(&mut self, node: NodeId, need: RegMask, keep: KeepReg) -> Reg {
        let (_, node) = strip_comma(&self.fo, node);
        let n = self.fo.node(node);
        assert!(!n.ty.is_pair(), "use recover_pair for wide values");
        let ty = n.ty;

        if n.spilled {
            return self
                .ra
                .unspill(&mut self.fo, &mut self.em, node, need, keep);
        }

        let reg = n.reg();
        if !need.is_empty() && !need.contains(reg) {
            let kept = self.ra.is_tree_in_reg(reg, node);
            let held = self.ra.lock_mixed(reg.mask());
            let new = self.ra.pick(&mut self.fo, &mut self.em, need, RBM_NONE);
            self.ra.unlock_mixed(reg.mask(), held);
            self.emit_copy(new, reg);
            if kept {
                self.ra.mark_free_one(&self.fo, reg, node);
            }
            self.fo.node_mut(node).loc = Loc::Reg(new);
            if kept || keep == KeepReg::Keep {
                self.ra.mark_used(&self.fo, node);
            }
            return new;
        }

        self.ra.gc.mark_reg(reg, ty);
        if keep == KeepReg::Keep && !self.ra.is_tree_in_reg(reg, node) {
            self.ra.mark_used(&self.fo, node);
        }
        reg
    }

    /// Produce `node`'s value in some register (transient binding),
    /// preferring `need` for fresh loads.
    fn gen_into_reg(&mut self, node: NodeId, need: RegMask) -> Reg {
        let n = self.fo.node(node);
        debug_assert!(!n.ty.is_pair());

        if n.spilled {
            return self
                .ra
                .unspill(&mut self.fo, &mut self.em, node, need, KeepReg::Free);
        }
        if n.in_reg() {
            return n.reg();
        }

        match self.fo.node(node).oper.clone() {
            Oper::ConstInt(v) => self.gen_const_leaf(node, v, need),
            Oper::Null => self.gen_const_leaf(node, 0, need),
            Oper::LclVar(lcl) => {
                let death = self.fo.node(node).lcl_death;
                let ty = self.fo.node(node).ty;
                let reg = match self.ra.trk.lcl_in_reg(lcl, RBM_ALLINT) {
                    Some(r) => r,
                    None => {
                        let r = self.ra.pick(&mut self.fo, &mut self.em, need, RBM_NONE);
                        let off = self.live.lcl(lcl).frame_off;
                        self.em.emit(Ins::Load {
                            dst: r,
                            src: MemRef::Frame { off },
                            size: ty.size(),
                        });
                        self.ra.trk.set_lcl(r, lcl);
                        self.ra.gc.mark_reg(r, ty);
                        self.flags.trash_if_reg(r);
                        r
                    }
                };
                self.use_lcl(lcl, death);
                self.fo.node_mut(node).loc = Loc::Reg(reg);
                reg
            }
            Oper::ClsVar(slot) => {
                let ty = self.fo.node(node).ty;
                let r = self.ra.pick(&mut self.fo, &mut self.em, need, RBM_NONE);
                self.em.emit(Ins::Load {
                    dst: r,
                    src: MemRef::ClsVar(slot),
                    size: ty.size(),
                });
                self.ra.trk.trash_reg(r);
                self.ra.gc.mark_reg(r, ty);
                self.flags.trash_if_reg(r);
                self.fo.node_mut(node).loc = Loc::Reg(r);
                r
            }
            Oper::Ind(_) => self.gen_ind(node, need),
            Oper::Bin { .. } => self.gen_bin(node, need),
            Oper::Relop { .. } => self.gen_relop_value(node, need),
            Oper::Qmark { .. } => match self.gen_qmark(node) {
                Loc::Reg(r) => r,
                loc => panic!("conditional produced {loc:?} in single-register context"),
            },
            Oper::Call { .. } => {
                self.gen_call(node);
                self.fo.node(node).reg()
            }
            Oper::ConstLng(_) | Oper::Asg { .. } | Oper::Comma { .. } => {
                unreachable!("not a single-register value producer")
            }
        }
    }

    fn gen_const_leaf(&mut self, node: NodeId, v: i32, need: RegMask) -> Reg {
        let ty = self.fo.node(node).ty;
        // A register already holding this constant serves as-is; ownership
        // questions are settled by the caller's keep/free_only handling.
        if let Some(r) = self.ra.trk.const_in_reg(v, RBM_ALLINT) {
            self.fo.node_mut(node).loc = Loc::Reg(r);
            return r;
        }
        let r = self.ra.pick(&mut self.fo, &mut self.em, need, RBM_NONE);
        self.em.emit(Ins::MovRI { dst: r, imm: v });
        self.ra.trk.set_const(r, v);
        self.ra.gc.mark_reg(r, ty);
        self.flags.trash_if_reg(r);
        self.fo.node_mut(node).loc = Loc::Reg(r);
        r
    }

    /// Load through an indirection, using a compound operand rather than
    /// materializing the address.
    fn gen_ind(&mut self, node: NodeId, need: RegMask) -> Reg {
        let ty = self.fo.node(node).ty;
        let amask = self.make_addressable(node, RBM_NONE, KeepReg::Keep, true, false);
        let held = self.ra.lock_mixed(amask);
        let dst = self.ra.pick(&mut self.fo, &mut self.em, need, RBM_NONE);
        self.ra.unlock_mixed(amask, held);
        let mem = self.addr_operand(node);
        self.em.emit(Ins::Load {
            dst,
            src: mem,
            size: ty.size(),
        });
        self.done_addressable(node, amask, KeepReg::Free);
        self.ra.trk.trash_reg(dst);
        self.ra.gc.mark_reg(dst, ty);
        self.flags.trash_if_reg(dst);
        self.fo.node_mut(node).loc = Loc::Reg(dst);
        dst
    }

    fn gen_bin(&mut self, node: NodeId, _need: RegMask) -> Reg {
        let (op, lhs, rhs, reverse) = match self.fo.node(node).oper {
            Oper::Bin { op, lhs, rhs } => (op, lhs, rhs, self.fo.node(node).reverse_ops),
            _ => unreachable!(),
        };
        let ty = self.fo.node(node).ty;
        let shift = matches!(op, BinOp::Lsh | BinOp::Rsh);
        let rhs_const = match self.fo.node(rhs).oper {
            Oper::ConstInt(v) => Some(v),
            _ => None,
        };

        // The result is produced destructively in the first operand's
        // register, so that register must carry no other claim.
        let dst = if let Some(imm) = rhs_const {
            // Immediate form: no second computation to survive.
            let dst = self.compute_into(lhs, RBM_NONE, Exactness::Any, KeepReg::Keep, true);
            if shift {
                self.em.emit(Ins::Alu {
                    op: alu_for(op),
                    dst,
                    src: RegImm::Imm(imm & 31),
                });
            } else {
                self.em.emit(Ins::Alu {
                    op: alu_for(op),
                    dst,
                    src: RegImm::Imm(imm),
                });
            }
            self.ra.mark_free_one(&self.fo, dst, lhs);
            dst
        } else if shift {
            // The shift count is constrained to ECX by the ISA.
            let ecx = Reg::Ecx.mask();
            self.compute_into(lhs, RBM_ALLINT - ecx, Exactness::Any, KeepReg::Keep, true);
            self.compute_into(rhs, ecx, Exactness::Exact, KeepReg::Keep, false);
            let dst = self.recover(lhs, RBM_ALLINT - ecx, KeepReg::Keep);
            self.em.emit(Ins::ShiftCl {
                op: alu_for(op),
                dst,
            });
            self.ra.mark_free_one(&self.fo, Reg::Ecx, rhs);
            self.ra.mark_free_one(&self.fo, dst, lhs);
            dst
        } else if !reverse && self.is_mem_operand(rhs) {
            // Second operand referenced straight from memory: one
            // instruction, no register consumed for it.
            self.compute_into(lhs, RBM_NONE, Exactness::Any, KeepReg::Keep, true);
            let amask = self.make_addressable(rhs, RBM_NONE, KeepReg::Keep, false, false);
            let dst = self.recover(lhs, RBM_NONE, KeepReg::Keep);
            let amask = self.keep_addressable(rhs, amask, dst.mask());
            if self.fo.node(rhs).in_reg() {
                self.em.emit(Ins::Alu {
                    op: alu_for(op),
                    dst,
                    src: RegImm::Reg(self.fo.node(rhs).reg()),
                });
            } else {
                let mem = self.addr_operand(rhs);
                self.em.emit(Ins::AluM {
                    op: alu_for(op),
                    dst,
                    src: mem,
                });
            }
            self.done_addressable(rhs, amask, KeepReg::Free);
            self.ra.mark_free_one(&self.fo, dst, lhs);
            dst
        } else {
            // General case: evaluate both operands into registers, honoring
            // the declared evaluation order.
            let (first, second) = if reverse { (rhs, lhs) } else { (lhs, rhs) };
            self.compute_into(first, RBM_NONE, Exactness::Any, KeepReg::Keep, first == lhs);
            self.compute_into(second, RBM_NONE, Exactness::Any, KeepReg::Keep, second == lhs);
            self.recover(first, RBM_NONE, KeepReg::Keep);
            let dst = self.fo.node(lhs).reg();
            let src = self.fo.node(rhs).reg();
            self.em.emit(Ins::Alu {
                op: alu_for(op),
                dst,
                src: RegImm::Reg(src),
            });
            self.ra.mark_free_one(&self.fo, src, rhs);
            self.ra.mark_free_one(&self.fo, dst, lhs);
            dst
        };

        self.fo.node_mut(lhs).loc = Loc::None;
        self.fo.node_mut(node).loc = Loc::Reg(dst);
        self.ra.trk.trash_reg(dst);
        self.ra.gc.mark_reg(dst, ty);
        self.flags.set_for_reg(dst);
        dst
    }

    /// Materialize a comparison as 0/1.
    fn gen_relop_value(&mut self, node: NodeId, need: RegMask) -> Reg {
        let cond = self.gen_relop_cond(node);
        let r = self.ra.pick(&mut self.fo, &mut self.em, need, RBM_NONE);
        let done = self.em.new_label();
        // Plain moves leave the flags alone, so the branch can follow them.
        self.em.emit(Ins::MovRI { dst: r, imm: 1 });
        self.em.emit(Ins::Jcc { cond, target: done });
        self.em.emit(Ins::MovRI { dst: r, imm: 0 });
        self.em.bind_label(done);
        self.ra.trk.trash_reg(r);
        self.ra.gc.mark_reg(r, Ty::Int);
        self.flags.trash_if_reg(r);
        self.fo.node_mut(node).loc = Loc::Reg(r);
        r
    }

    /// Is `node` a leaf we can reference as a memory operand without
    /// loading it first?
    fn is_mem_operand(&self, node: NodeId) -> bool {
        let n = self.fo.node(node);
        if n.in_reg() || n.spilled || n.ty.is_small() {
            return false;
        }
        matches!(n.oper, Oper::LclVar(_) | Oper::ClsVar(_) | Oper::Ind(_))
    }

    // ----------------------------------------------------------------
    // The register-pair engine.

    /// Evaluate a wide value into a register pair. `need` recommends where
    /// fresh registers come from.
    pub fn compute_into_pair(&mut self, node: NodeId, need: RegMask, keep: KeepReg) -> RegPair {
        let (effects, node) = strip_comma(&self.fo, node);
        for e in effects {
            self.gen_side_effect(e);
        }
        assert!(self.fo.node(node).ty.is_pair());

        if self.fo.node(node).spilled {
            return self
                .ra
                .unspill_pair(&mut self.fo, &mut self.em, node, need, keep);
        }
        if self.fo.node(node).in_reg() {
            let p = self.fo.node(node).pair();
            if keep == KeepReg::Keep && !self.pair_is_kept(node) {
                self.ra.mark_pair_used(&self.fo, node);
            }
            return p;
        }

        let p = match self.fo.node(node).oper.clone() {
            Oper::ConstLng(v) => {
                let p = self.ra.pick_pair(&mut self.fo, &mut self.em, need);
                let (lo, hi) = (p.lo.reg().unwrap(), p.hi.reg().unwrap());
                self.em.emit(Ins::MovRI {
                    dst: lo,
                    imm: v as i32,
                });
                self.em.emit(Ins::MovRI {
                    dst: hi,
                    imm: (v >> 32) as i32,
                });
                self.ra.trk.set_const(lo, v as i32);
                self.ra.trk.set_const(hi, (v >> 32) as i32);
                self.ra.gc.mark_mask_npt(p.mask());
                self.flags.trash_if_reg(lo);
                self.flags.trash_if_reg(hi);
                p
            }
            Oper::LclVar(lcl) => {
                let death = self.fo.node(node).lcl_death;
                let lo_hit = self.ra.trk.lcl_half_in_reg(lcl, true, RBM_ALLINT);
                let hi_hit = self.ra.trk.lcl_half_in_reg(lcl, false, RBM_ALLINT);
                let p = match (lo_hit, hi_hit) {
                    (Some(lo), Some(hi)) if lo != hi => RegPair {
                        lo: HalfReg::Reg(lo),
                        hi: HalfReg::Reg(hi),
                    },
                    _ => {
                        let p = self.ra.pick_pair(&mut self.fo, &mut self.em, need);
                        let (lo, hi) = (p.lo.reg().unwrap(), p.hi.reg().unwrap());
                        let off = self.live.lcl(lcl).frame_off;
                        self.em.emit(Ins::Load {
                            dst: lo,
                            src: MemRef::Frame { off },
                            size: 4,
                        });
                        self.em.emit(Ins::Load {
                            dst: hi,
                            src: MemRef::Frame { off: off - 4 },
                            size: 4,
                        });
                        self.ra.trk.set_lcl_half(lo, lcl, true);
                        self.ra.trk.set_lcl_half(hi, lcl, false);
                        self.ra.gc.mark_mask_npt(p.mask());
                        self.flags.trash_if_reg(lo);
                        self.flags.trash_if_reg(hi);
                        p
                    }
                };
                self.use_lcl(lcl, death);
                p
            }
            Oper::Ind(_) => self.gen_ind_pair(node, need),
            Oper::Bin { .. } => self.gen_bin_pair(node),
            Oper::Qmark { .. } => match self.gen_qmark(node) {
                Loc::Pair(p) => p,
                loc => panic!("conditional produced {loc:?} in pair context"),
            },
            Oper::Call { .. } => {
                self.gen_call(node);
                self.fo.node(node).pair()
            }
            other => panic!("{other:?} cannot produce a wide value"),
        };

        self.fo.node_mut(node).loc = Loc::Pair(p);
        if keep == KeepReg::Keep && !self.pair_is_kept(node) {
            self.ra.mark_pair_used(&self.fo, node);
        }
        p
    }

    /// Pair analogue of [Self::recover].
    pub fn recover_pair(&mut self, node: NodeId, need: RegMask, keep: KeepReg) -> RegPair {
        let (_, node) = strip_comma(&self.fo, node);
        assert!(self.fo.node(node).ty.is_pair());
        if self.fo.node(node).spilled {
            return self
                .ra
                .unspill_pair(&mut self.fo, &mut self.em, node, need, keep);
        }
        let p = self.fo.node(node).pair();
        self.ra.gc.mark_mask_npt(p.mask());
        if keep == KeepReg::Keep && !self.pair_is_kept(node) {
            self.ra.mark_pair_used(&self.fo, node);
        }
        p
    }

    /// Release the claims a kept pair value holds on its registers.
    pub fn release_pair(&mut self, node: NodeId) {
        let p = self.fo.node(node).pair();
        for half in [p.lo, p.hi] {
            if let HalfReg::Reg(r) = half {
                if self.ra.is_tree_in_reg(r, node) {
                    self.ra.mark_free_one(&self.fo, r, node);
                }
            }
        }
    }

    fn pair_is_kept(&self, node: NodeId) -> bool {
        let p = self.fo.node(node).pair();
        match (p.lo, p.hi) {
            (HalfReg::Reg(r), _) | (HalfReg::Stk, HalfReg::Reg(r)) => {
                self.ra.is_tree_in_reg(r, node)
            }
            _ => false,
        }
    }

    fn gen_ind_pair(&mut self, node: NodeId, need: RegMask) -> RegPair {
        let amask = self.make_addressable(node, RBM_NONE, KeepReg::Keep, true, false);
        let held = self.ra.lock_mixed(amask);
        let p = self.ra.pick_pair(&mut self.fo, &mut self.em, need);
        self.ra.unlock_mixed(amask, held);
        let (lo, hi) = (p.lo.reg().unwrap(), p.hi.reg().unwrap());
        let mem = match self.addr_operand(node) {
            MemRef::Amode(m) => m,
            other => panic!("indirection with non-compound operand {other:?}"),
        };
        let mut mem_hi = mem;
        mem_hi.disp = mem_hi.disp.wrapping_add(4);
        self.em.emit(Ins::Load {
            dst: lo,
            src: MemRef::Amode(mem),
            size: 4,
        });
        self.em.emit(Ins::Load {
            dst: hi,
            src: MemRef::Amode(mem_hi),
            size: 4,
        });
        self.done_addressable(node, amask, KeepReg::Free);
        self.ra.trk.trash_reg(lo);
        self.ra.trk.trash_reg(hi);
        self.ra.gc.mark_mask_npt(p.mask());
        self.flags.trash_if_reg(lo);
        self.flags.trash_if_reg(hi);
        p
    }

    fn gen_bin_pair(&mut self, node: NodeId) -> RegPair {
        let (op, lhs, rhs, reverse) = match self.fo.node(node).oper {
            Oper::Bin { op, lhs, rhs } => (op, lhs, rhs, self.fo.node(node).reverse_ops),
            _ => unreachable!(),
        };
        let (op_lo, op_hi) = match op {
            BinOp::Add => (AluOp::Add, AluOp::Adc),
            BinOp::Sub => (AluOp::Sub, AluOp::Sbb),
            BinOp::And => (AluOp::And, AluOp::And),
            BinOp::Or => (AluOp::Or, AluOp::Or),
            BinOp::Xor => (AluOp::Xor, AluOp::Xor),
            other => panic!("{other:?} is not a pair ALU operator"),
        };

        let (first, second) = if reverse { (rhs, lhs) } else { (lhs, rhs) };
        self.compute_into_pair(first, RBM_NONE, KeepReg::Keep);
        self.compute_into_pair(second, RBM_NONE, KeepReg::Keep);
        self.recover_pair(first, RBM_NONE, KeepReg::Keep);

        // The result is formed destructively in the left operand's pair.
        self.pair_sole_claim(lhs);
        let dst = self.fo.node(lhs).pair();
        let src = self.fo.node(rhs).pair();
        assert!(
            dst.is_proper() && src.is_proper(),
            "pair arithmetic on partially enregistered operands"
        );
        let (dl, dh) = (dst.lo.reg().unwrap(), dst.hi.reg().unwrap());
        let (sl, sh) = (src.lo.reg().unwrap(), src.hi.reg().unwrap());

        // Low half first: the carry/borrow chains into the high half.
        self.em.emit(Ins::Alu {
            op: op_lo,
            dst: dl,
            src: RegImm::Reg(sl),
        });
        self.em.emit(Ins::Alu {
            op: op_hi,
            dst: dh,
            src: RegImm::Reg(sh),
        });

        self.release_pair(rhs);
        self.release_pair(lhs);
        self.fo.node_mut(lhs).loc = Loc::None;
        self.ra.trk.trash_reg(dl);
        self.ra.trk.trash_reg(dh);
        self.ra.gc.mark_mask_npt(dst.mask());
        self.flags.trash();
        dst
    }

    /// Ensure the kept pair value of `node` has sole claim on both of its
    /// registers, copying it to a fresh pair if not.
    fn pair_sole_claim(&mut self, node: NodeId) {
        let p = self.fo.node(node).pair();
        let mut shared = false;
        for half in [p.lo, p.hi] {
            if let HalfReg::Reg(r) = half {
                if self.ra.used_mask().contains(r)
                    && !(self.ra.owner(r) == Some(node) && !self.ra.mult_mask().contains(r))
                {
                    shared = true;
                }
            }
        }
        if !shared {
            return;
        }
        let mask = p.mask();
        let held = self.ra.lock_mixed(mask);
        let fresh = self
            .ra
            .pick_pair(&mut self.fo, &mut self.em, RBM_ALLINT - mask);
        self.ra.unlock_mixed(mask, held);
        self.move_pair(node, fresh);
    }

    /// Relocate a value already in one pair to the target pair, handling
    /// the overlap cases without clobbering a half that is still needed.
    /// Halves homed on the stack are loaded directly.
    pub fn move_pair(&mut self, node: NodeId, dst: RegPair) {
        assert!(dst.is_proper(), "move_pair target must be two registers");
        let src = self.fo.node(node).pair();
        if src == dst {
            return;
        }
        let was_kept = self.pair_is_kept(node);
        if was_kept {
            self.release_pair(node);
        }

        let dl = dst.lo.reg().unwrap();
        let dh = dst.hi.reg().unwrap();

        match (src.lo, src.hi) {
            (HalfReg::Reg(sl), HalfReg::Reg(sh)) => {
                if dl == sh && dh == sl {
                    // Fully swapped: exchange in place, no scratch needed.
                    self.em.emit(Ins::Xchg { a: sl, b: sh });
                    self.ra.trk.swap(sl, sh);
                    self.ra.gc.swap(sl, sh);
                } else if dl == sh {
                    // Writing the low target would clobber the source high
                    // half; move the high half out of the way first.
                    if dh != sh {
                        self.emit_copy(dh, sh);
                    }
                    if dl != sl {
                        self.emit_copy(dl, sl);
                    }
                } else {
                    if dl != sl {
                        self.emit_copy(dl, sl);
                    }
                    if dh != sh {
                        self.emit_copy(dh, sh);
                    }
                }
            }
            (HalfReg::Stk, HalfReg::Reg(sh)) => {
                if dl == sh {
                    if dh != sh {
                        self.emit_copy(dh, sh);
                    }
                    self.load_pair_half(node, dl, true);
                } else {
                    self.load_pair_half(node, dl, true);
                    if dh != sh {
                        self.emit_copy(dh, sh);
                    }
                }
            }
            (HalfReg::Reg(sl), HalfReg::Stk) => {
                if dh == sl {
                    if dl != sl {
                        self.emit_copy(dl, sl);
                    }
                    self.load_pair_half(node, dh, false);
                } else {
                    self.load_pair_half(node, dh, false);
                    if dl != sl {
                        self.emit_copy(dl, sl);
                    }
                }
            }
            (HalfReg::Stk, HalfReg::Stk) => {
                self.load_pair_half(node, dl, true);
                self.load_pair_half(node, dh, false);
            }
        }

        self.fo.node_mut(node).loc = Loc::Pair(dst);
        if was_kept {
            self.ra.mark_pair_used(&self.fo, node);
        }
    }

    /// Load one stack-homed half of a partially enregistered value.
    fn load_pair_half(&mut self, node: NodeId, dst: Reg, low: bool) {
        let lcl = match self.fo.node(node).oper {
            Oper::LclVar(l) => l,
            ref other => panic!("stack-homed pair half on non-local {other:?}"),
        };
        let off = self.live.lcl(lcl).frame_off;
        let off = if low { off } else { off - 4 };
        self.em.emit(Ins::Load {
            dst,
            src: MemRef::Frame { off },
            size: 4,
        });
        self.ra.trk.set_lcl_half(dst, lcl, low);
        self.ra.gc.mark_reg(dst, Ty::Int);
        self.flags.trash_if_reg(dst);
    }
}
