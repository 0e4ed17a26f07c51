//! The per-method code generation state and the statement-level driver.
//!
//! One [CodeGen] exists per method compilation; it owns the tree arena, the
//! register set manager (with its GC tracker and temp allocator), the
//! liveness state and the emitter. The external tree walker calls
//! [CodeGen::begin_block] once per basic block and [CodeGen::gen_stmt] once
//! per statement; everything else is the internal protocol.
//!
//! Basic blocks reachable from multiple predecessors are reinitialized
//! conservatively (all registers trashed) rather than reconciling register
//! state across edges; the only intra-block merge point is the ternary
//! operator, which snapshots and verifies convergence explicitly.

mod addr;
mod compute;

pub use addr::{find_addr_shape, AddrShape};
pub use compute::Exactness;

use crate::{
    config::Config,
    emit::{Cond, Emitter, Helper, Ins, MemRef},
    gcinfo::{cls_var_barrier, store_barrier, Barrier},
    ir::{strip_comma, Forest, LclId, Loc, NodeId, Oper, RelOp, Ty},
    liveness::{Liveness, VarSet},
    log::Log,
    regalloc::{KeepReg, RegAlloc},
    target::{Reg, RegMask, ARG_REG_ORDER, RBM_CALLEE_TRASH, RBM_NONE},
    track::FlagsCache,
    CompilationError,
};

/// The dataflow state snapshotted around a ternary's arms and verified to
/// converge.
#[derive(Debug, PartialEq)]
struct PostState {
    live: VarSet,
    gcref: RegMask,
    byref: RegMask,
    gc_lcls: VarSet,
    used: RegMask,
    lock: RegMask,
    mult: RegMask,
}

/// The code generation state for one method.
pub struct CodeGen<E: Emitter> {
    pub fo: Forest,
    pub live: Liveness,
    pub ra: RegAlloc,
    pub flags: FlagsCache,
    pub em: E,
    #[allow(dead_code)]
    cfg: Config,
}

impl<E: Emitter> CodeGen<E> {
    pub fn new(em: E) -> Result<Self, CompilationError> {
        let cfg = Config::from_env()?;
        let log = Log::new()?;
        Ok(CodeGen {
            fo: Forest::new(),
            live: Liveness::new(),
            ra: RegAlloc::new(log, cfg.stress_regs),
            flags: FlagsCache::new(),
            em,
            cfg,
        })
    }

    // ----------------------------------------------------------------
    // Small lockstep helpers.

    /// Copy `src` into `dst`, carrying tracker and GC facts along.
    pub(crate) fn emit_copy(&mut self, dst: Reg, src: Reg) {
        debug_assert_ne!(dst, src);
        self.em.emit(Ins::MovRR { dst, src });
        self.ra.trk.copy(dst, src);
        self.ra.gc.copy(dst, src);
        self.flags.trash_if_reg(dst);
    }

    /// Account for a use of a local at this point of the walk.
    pub(crate) fn use_lcl(&mut self, lcl: LclId, death: bool) {
        let gc = self.live.lcl(lcl).ty.is_gc();
        self.live.use_of(lcl, death);
        if death && gc {
            self.ra.gc.lcl_death(lcl);
        }
    }

    // ----------------------------------------------------------------
    // Block boundaries.

    /// Start a basic block: all registers are assumed trashed (nothing is
    /// provably carried in from a predecessor), and the live set becomes
    /// the block's live-in set.
    pub fn begin_block(&mut self, live_in: VarSet) {
        self.ra.assert_quiescent();
        self.ra.trk.clear();
        self.flags.trash();
        self.ra.gc.clear_regs();
        self.live.set_live_in(live_in);
        self.ra.gc.set_live_lcls(&self.live);
    }

    /// End the current block; the register file must be quiescent.
    pub fn end_block(&mut self) {
        self.ra.assert_quiescent();
    }

    // ----------------------------------------------------------------
    // Statements.

    /// Generate code for one statement tree.
    pub fn gen_stmt(&mut self, root: NodeId) {
        let (effects, root) = strip_comma(&self.fo, root);
        for e in effects {
            self.gen_side_effect(e);
        }
        self.gen_side_effect(root);
        // Statement boundary: every claim taken during the statement must
        // have been released.
        assert!(
            self.ra.used_mask().is_empty(),
            "registers leaked at statement end: {:?}",
            self.ra.used_mask()
        );
        assert!(self.ra.no_pending_spills(), "spills leaked at statement end");
    }

    /// Evaluate a tree for its side effects, discarding any value.
    pub(crate) fn gen_side_effect(&mut self, node: NodeId) {
        match self.fo.node(node).oper {
            Oper::Asg { .. } => self.gen_store(node),
            Oper::Call { .. } => self.gen_call(node),
            _ => {
                if self.fo.node(node).ty.is_pair() {
                    self.compute_into_pair(node, RBM_NONE, KeepReg::Free);
                } else if self.fo.node(node).ty != Ty::Void {
                    self.compute_into(node, RBM_NONE, Exactness::Any, KeepReg::Free, false);
                }
            }
        }
    }

    // ----------------------------------------------------------------
    // Stores.

    fn gen_store(&mut self, asg: NodeId) {
        let (dst, src) = match self.fo.node(asg).oper {
            Oper::Asg { dst, src } => (dst, src),
            _ => unreachable!(),
        };
        let (effects, dst) = strip_comma(&self.fo, dst);
        for e in effects {
            self.gen_side_effect(e);
        }
        assert!(
            self.fo.node(dst).oper.is_location(),
            "store target is not a location"
        );

        match self.fo.node(dst).oper {
            Oper::LclVar(lcl) => self.gen_lcl_store(lcl, src),
            Oper::ClsVar(slot) => self.gen_cls_var_store(slot, src),
            Oper::Ind(addr) => self.gen_ind_store(dst, addr, src),
            _ => unreachable!(),
        }
    }

    fn gen_lcl_store(&mut self, lcl: LclId, src: NodeId) {
        let ty = self.live.lcl(lcl).ty;
        let off = self.live.lcl(lcl).frame_off;

        if ty.is_pair() {
            let p = self.compute_into_pair(src, RBM_NONE, KeepReg::Free);
            assert!(p.is_proper());
            let (lo, hi) = (p.lo.reg().unwrap(), p.hi.reg().unwrap());
            self.em.emit(Ins::Store {
                dst: MemRef::Frame { off },
                src: lo,
                size: 4,
            });
            self.em.emit(Ins::Store {
                dst: MemRef::Frame { off: off - 4 },
                src: hi,
                size: 4,
            });
            self.live.def_of(lcl);
            self.ra.trk.trash_lcl(lcl);
            self.ra.trk.set_lcl_half(lo, lcl, true);
            self.ra.trk.set_lcl_half(hi, lcl, false);
            self.flags.trash_if_lcl(lcl);
            return;
        }

        // Constant sources store directly, no register consumed.
        if let Oper::ConstInt(v) = self.fo.node(src).oper {
            if !ty.is_gc() {
                self.em.emit(Ins::StoreImm {
                    dst: MemRef::Frame { off },
                    imm: v,
                    size: ty.size(),
                });
                self.live.def_of(lcl);
                self.ra.trk.trash_lcl(lcl);
                self.flags.trash_if_lcl(lcl);
                return;
            }
        }

        let r = self.compute_into(src, RBM_NONE, Exactness::Any, KeepReg::Free, false);
        self.em.emit(Ins::Store {
            dst: MemRef::Frame { off },
            src: r,
            size: ty.size(),
        });
        self.live.def_of(lcl);
        self.ra.trk.trash_lcl(lcl);
        let flags_knew_src = self.flags.reflects_reg(r);
        self.flags.trash_if_lcl(lcl);
        if !ty.is_small() {
            self.ra.trk.set_lcl(r, lcl);
            if flags_knew_src {
                self.flags.set_for_lcl(lcl);
            }
        }
        if ty.is_gc() {
            self.ra.gc.lcl_birth(lcl, ty);
        }
    }

    fn gen_cls_var_store(&mut self, slot: u16, src: NodeId) {
        let src_ty = self.fo.node(src).ty;
        match cls_var_barrier(src_ty) {
            Barrier::None => {
                let r = self.compute_into(src, RBM_NONE, Exactness::Any, KeepReg::Free, false);
                self.em.emit(Ins::Store {
                    dst: MemRef::ClsVar(slot),
                    src: r,
                    size: src_ty.size(),
                });
            }
            barrier => {
                // Form the slot's address in the barrier's address register.
                let edx = Reg::Edx;
                let got = self.ra.grab(&mut self.fo, &mut self.em, edx.mask());
                debug_assert_eq!(got, edx);
                self.em.emit(Ins::Lea {
                    dst: edx,
                    src: MemRef::ClsVar(slot),
                });
                self.ra.trk.trash_reg(edx);
                self.ra.gc.mark_reg(edx, Ty::Byref);
                self.flags.trash_if_reg(edx);
                self.ra.lock(edx.mask());
                self.compute_into(src, Reg::Ecx.mask(), Exactness::Exact, KeepReg::Keep, true);
                self.ra.unlock(edx.mask());
                self.emit_barrier_call(barrier);
                self.ra.mark_free_one(&self.fo, Reg::Ecx, src);
            }
        }
    }

    fn gen_ind_store(&mut self, dst: NodeId, addr: NodeId, src: NodeId) {
        let src_ty = self.fo.node(src).ty;
        match store_barrier(&self.fo, addr, src_ty) {
            Barrier::None => {
                if src_ty.is_pair() {
                    let amask =
                        self.make_addressable(dst, RBM_NONE, KeepReg::Keep, true, false);
                    let p = self.compute_into_pair(src, RBM_NONE, KeepReg::Keep);
                    let amask = self.keep_addressable(dst, amask, p.mask());
                    assert!(p.is_proper());
                    let mem = match self.addr_operand(dst) {
                        MemRef::Amode(m) => m,
                        other => panic!("wide store needs a compound operand, got {other:?}"),
                    };
                    let mut mem_hi = mem;
                    mem_hi.disp = mem_hi.disp.wrapping_add(4);
                    self.em.emit(Ins::Store {
                        dst: MemRef::Amode(mem),
                        src: p.lo.reg().unwrap(),
                        size: 4,
                    });
                    self.em.emit(Ins::Store {
                        dst: MemRef::Amode(mem_hi),
                        src: p.hi.reg().unwrap(),
                        size: 4,
                    });
                    self.release_pair(src);
                    self.done_addressable(dst, amask, KeepReg::Free);
                } else {
                    let amask =
                        self.make_addressable(dst, RBM_NONE, KeepReg::Keep, true, false);
                    if let Oper::ConstInt(v) = self.fo.node(src).oper {
                        let amask = self.keep_addressable(dst, amask, RBM_NONE);
                        let mem = self.addr_operand(dst);
                        self.em.emit(Ins::StoreImm {
                            dst: mem,
                            imm: v,
                            size: src_ty.size(),
                        });
                        self.done_addressable(dst, amask, KeepReg::Free);
                    } else {
                        let r =
                            self.compute_into(src, RBM_NONE, Exactness::Any, KeepReg::Keep, false);
                        let amask = self.keep_addressable(dst, amask, r.mask());
                        let r = self.recover(src, RBM_NONE, KeepReg::Keep);
                        let mem = self.addr_operand(dst);
                        self.em.emit(Ins::Store {
                            dst: mem,
                            src: r,
                            size: src_ty.size(),
                        });
                        self.ra.mark_free_one(&self.fo, r, src);
                        self.done_addressable(dst, amask, KeepReg::Free);
                    }
                }
                // A store through a pointer may alias any local's home.
                self.ra.trk.trash_all_lcls();
            }
            barrier => {
                // The barrier helper takes the target address in EDX and the
                // value in ECX, performing the store itself.
                self.compute_into(addr, Reg::Edx.mask(), Exactness::Exact, KeepReg::Keep, true);
                self.ra.lock_used(Reg::Edx.mask());
                self.compute_into(src, Reg::Ecx.mask(), Exactness::Exact, KeepReg::Keep, true);
                self.ra.unlock_used(Reg::Edx.mask());
                self.emit_barrier_call(barrier);
                self.ra.mark_free_one(&self.fo, Reg::Edx, addr);
                self.ra.mark_free_one(&self.fo, Reg::Ecx, src);
            }
        }
    }

    fn emit_barrier_call(&mut self, barrier: Barrier) {
        let helper = match barrier {
            Barrier::Unchecked => Helper::WriteBarrier,
            Barrier::Checked => Helper::WriteBarrierChecked,
            Barrier::None => unreachable!(),
        };
        self.em.emit(Ins::CallHelper { helper });
        let trashed = Reg::Edx.mask() | Reg::Ecx.mask();
        self.ra.trk.trash_mask(trashed);
        self.ra.trk.trash_all_lcls();
        self.ra.gc.mark_mask_npt(trashed);
        self.flags.trash();
    }

    // ----------------------------------------------------------------
    // Calls.

    /// Generate a call: arguments to the fixed argument registers (the rest
    /// pushed), live caller-saved values spilled, the live GC pointer set
    /// snapshotted for the stack map, and the return value bound.
    pub(crate) fn gen_call(&mut self, node: NodeId) {
        let (target, args) = match self.fo.node(node).oper {
            Oper::Call { target, ref args } => (target, args.clone()),
            _ => unreachable!(),
        };
        let ty = self.fo.node(node).ty;

        let mut reg_args: Vec<(NodeId, Reg)> = Vec::new();
        for (i, arg) in args.into_iter().enumerate() {
            if i < ARG_REG_ORDER.len() {
                let r = ARG_REG_ORDER[i];
                self.compute_into(arg, r.mask(), Exactness::Exact, KeepReg::Keep, true);
                self.ra.lock_used(r.mask());
                reg_args.push((arg, r));
            } else if self.fo.node(arg).ty.is_pair() {
                let p = self.compute_into_pair(arg, RBM_NONE, KeepReg::Free);
                assert!(p.is_proper());
                self.em.emit(Ins::Push {
                    src: p.hi.reg().unwrap(),
                });
                self.em.emit(Ins::Push {
                    src: p.lo.reg().unwrap(),
                });
            } else {
                let r = self.compute_into(arg, RBM_NONE, Exactness::Any, KeepReg::Free, false);
                self.em.emit(Ins::Push { src: r });
            }
        }

        // Anything still live in a caller-saved register must survive in
        // memory across the call.
        let to_spill = (RBM_CALLEE_TRASH & self.ra.used_mask()) - self.ra.lock_mask();
        if !to_spill.is_empty() {
            self.ra.spill_regs(&mut self.fo, &mut self.em, to_spill);
        }

        // The call consumes the argument registers.
        for (arg, r) in reg_args {
            self.ra.unlock_used(r.mask());
            self.ra.mark_free_one(&self.fo, r, arg);
        }

        self.em.emit(Ins::Call { target });
        let site = self.ra.gc.call_site(&self.live);
        self.em.record_call_site(site);

        self.ra.trk.trash_mask(RBM_CALLEE_TRASH);
        self.ra.gc.mark_mask_npt(RBM_CALLEE_TRASH);
        self.flags.trash();

        match ty {
            Ty::Void => (),
            Ty::Long => {
                self.fo.node_mut(node).loc =
                    Loc::Pair(crate::target::RegPair::new(Reg::Eax, Reg::Edx));
            }
            _ => {
                self.fo.node_mut(node).loc = Loc::Reg(Reg::Eax);
                self.ra.gc.mark_reg(Reg::Eax, ty);
            }
        }
    }

    // ----------------------------------------------------------------
    // Comparisons and the ternary operator.

    fn relop_cond(op: RelOp) -> Cond {
        match op {
            RelOp::Eq => Cond::E,
            RelOp::Ne => Cond::Ne,
            RelOp::Lt => Cond::L,
            RelOp::Le => Cond::Le,
            RelOp::Gt => Cond::G,
            RelOp::Ge => Cond::Ge,
        }
    }

    /// Emit the compare for a relational node and return the condition that
    /// will be true when the relation holds. A compare of a register
    /// against zero is elided when the flags already reflect that register.
    pub(crate) fn gen_relop_cond(&mut self, node: NodeId) -> Cond {
        let (op, lhs, rhs) = match self.fo.node(node).oper {
            Oper::Relop { op, lhs, rhs } => (op, lhs, rhs),
            ref other => panic!("conditional on non-relational node {other:?}"),
        };
        let cond = Self::relop_cond(op);
        assert!(!self.fo.node(lhs).ty.is_pair(), "wide compares unsupported");

        let rhs_const = match self.fo.node(rhs).oper {
            Oper::ConstInt(v) => Some(v),
            Oper::Null => Some(0),
            _ => None,
        };

        if rhs_const == Some(0) && matches!(op, RelOp::Eq | RelOp::Ne) {
            let r = self.compute_into(lhs, RBM_NONE, Exactness::Any, KeepReg::Free, false);
            if !self.flags.reflects_reg(r) {
                self.em.emit(Ins::Test { a: r, b: r });
                self.flags.set_for_reg(r);
            }
            return cond;
        }

        if let Some(v) = rhs_const {
            let r = self.compute_into(lhs, RBM_NONE, Exactness::Any, KeepReg::Free, false);
            self.em.emit(Ins::Cmp {
                lhs: r,
                rhs: crate::emit::RegImm::Imm(v),
            });
            self.flags.trash();
            return cond;
        }

        self.compute_into(lhs, RBM_NONE, Exactness::Any, KeepReg::Keep, false);
        let rr = self.compute_into(rhs, RBM_NONE, Exactness::Any, KeepReg::Keep, false);
        let lr = self.recover(lhs, RBM_NONE, KeepReg::Keep);
        self.em.emit(Ins::Cmp {
            lhs: lr,
            rhs: crate::emit::RegImm::Reg(rr),
        });
        self.ra.mark_free_one(&self.fo, rr, rhs);
        self.ra.mark_free_one(&self.fo, lr, lhs);
        self.flags.trash();
        cond
    }

    fn state_snapshot(&self) -> PostState {
        PostState {
            live: self.live.cur_live(),
            gcref: self.ra.gc.reg_gcref(),
            byref: self.ra.gc.reg_byref(),
            gc_lcls: self.ra.gc.live_gc_lcls(),
            used: self.ra.used_mask(),
            lock: self.ra.lock_mask(),
            mult: self.ra.mult_mask(),
        }
    }

    fn state_restore(&mut self, s: &PostState) {
        self.live.set_live_in(s.live);
        self.ra.gc.restore_regs(s.gcref, s.byref);
        self.ra.gc.restore_live_lcls(s.gc_lcls);
        // Register content facts from the abandoned path are one-sided.
        self.ra.trk.clear();
        self.flags.trash();
    }

    /// A conditional value: evaluate the condition, then one of the two
    /// value trees, with both paths producing the result in the same
    /// register (pair) and converging to the same liveness and GC state.
    pub(crate) fn gen_qmark(&mut self, node: NodeId) -> Loc {
        let (cond, then_val, else_val) = match self.fo.node(node).oper {
            Oper::Qmark {
                cond,
                then_val,
                else_val,
            } => (cond, then_val, else_val),
            _ => unreachable!(),
        };
        let ty = self.fo.node(node).ty;

        let c = self.gen_relop_cond(cond);
        let else_l = self.em.new_label();
        let done_l = self.em.new_label();
        self.em.emit(Ins::Jcc {
            cond: c.invert(),
            target: else_l,
        });
        self.flags.trash();
        let pre = self.state_snapshot();

        let loc = if ty.is_pair() {
            Loc::Pair(self.compute_into_pair(then_val, RBM_NONE, KeepReg::Free))
        } else {
            Loc::Reg(self.compute_into(then_val, RBM_NONE, Exactness::Any, KeepReg::Free, false))
        };
        self.em.emit(Ins::Jmp { target: done_l });
        let post_then = self.state_snapshot();

        self.state_restore(&pre);
        self.em.bind_label(else_l);
        match loc {
            Loc::Reg(r) => {
                let r2 = self.compute_into(else_val, r.mask(), Exactness::Exact, KeepReg::Free, false);
                assert_eq!(r2, r, "ternary arms disagree on the result register");
            }
            Loc::Pair(p) => {
                let p2 = self.compute_into_pair(else_val, RBM_NONE, KeepReg::Free);
                if p2 != p {
                    self.move_pair(else_val, p);
                }
            }
            Loc::None => unreachable!(),
        }
        let post_else = self.state_snapshot();
        assert_eq!(
            post_then, post_else,
            "ternary arms reach different dataflow states"
        );
        self.em.bind_label(done_l);
        self.ra.trk.clear();
        self.flags.trash();

        self.fo.node_mut(node).loc = loc;
        loc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        emit::{BufEmitter, Emitted, Ins},
        ir::{BinOp, Ty},
        target::{HalfReg, RegPair, RBM_ALLINT},
    };
    use fm::FMBuilder;
    use std::collections::HashMap;

    fn cg() -> CodeGen<BufEmitter> {
        CodeGen::new(BufEmitter::new()).unwrap()
    }

    fn fmatch(ptn: &str, text: &str) {
        let matcher = FMBuilder::new(ptn).unwrap().build().unwrap();
        if let Err(e) = matcher.matches(text) {
            panic!("emitted code did not match pattern:\n{e}");
        }
    }

    #[test]
    fn add_of_two_locals() {
        let mut cg = cg();
        let a = cg.live.add_lcl(Ty::Int, 4).unwrap();
        let b = cg.live.add_lcl(Ty::Int, 8).unwrap();
        let c = cg.live.add_lcl(Ty::Int, 12).unwrap();
        let mut live_in = VarSet::EMPTY;
        live_in.insert(a);
        live_in.insert(b);
        cg.begin_block(live_in);

        let na = cg.fo.lcl_var(a, Ty::Int);
        let nb = cg.fo.lcl_var(b, Ty::Int);
        let sum = cg.fo.bin(BinOp::Add, Ty::Int, na, nb);
        let nc = cg.fo.lcl_var(c, Ty::Int);
        let asg = cg.fo.asg(nc, sum);
        cg.gen_stmt(asg);
        cg.end_block();

        // The second operand is consumed straight from memory.
        fmatch(
            "mov eax, dword [ebp-4]\n\
             add eax, dword [ebp-8]\n\
             mov dword [ebp-12], eax\n",
            &cg.em.text(),
        );
    }

    #[test]
    fn spilled_operand_is_reloaded_exactly_once() {
        let mut cg = cg();
        let a = cg.live.add_lcl(Ty::Int, 4).unwrap();
        let b = cg.live.add_lcl(Ty::Int, 8).unwrap();
        cg.begin_block(VarSet::EMPTY);

        // Compute `a` and keep it, then force it out of its register, as an
        // intervening call's register demands would.
        let na = cg.fo.lcl_var(a, Ty::Int);
        let ra_reg = cg.compute_into(na, RBM_NONE, Exactness::Any, KeepReg::Keep, false);
        cg.ra.spill_reg(&mut cg.fo, &mut cg.em, ra_reg);
        assert!(cg.fo.node(na).spilled);

        let nb = cg.fo.lcl_var(b, Ty::Int);
        let sum = cg.fo.bin(BinOp::Add, Ty::Int, na, nb);
        let r = cg.compute_into(sum, RBM_NONE, Exactness::Any, KeepReg::Free, false);

        // Exactly one reload from the spill temp.
        let reloads = cg
            .em
            .insns()
            .filter(|i| matches!(i, Ins::Load { src: MemRef::Temp(_), .. }))
            .count();
        assert_eq!(reloads, 1);
        // The result register carries no lock and no leftover claims.
        assert!(!cg.ra.lock_mask().contains(r));
        assert!(cg.ra.used_mask().is_empty());
        assert!(cg.ra.no_pending_spills());
        assert!(cg.ra.tmp.all_free());
    }

    /// Interpret the emitted moves/loads over a model register file, so
    /// pair moves can be checked for value preservation, not just shape.
    fn run_moves(em: &BufEmitter, regs: &mut HashMap<Reg, i64>, frame: &HashMap<i32, i64>) {
        for item in em.items() {
            if let Emitted::Ins(ins) = item {
                match ins {
                    Ins::MovRR { dst, src } => {
                        let v = regs[src];
                        regs.insert(*dst, v);
                    }
                    Ins::Xchg { a, b } => {
                        let va = regs[a];
                        let vb = regs[b];
                        regs.insert(*a, vb);
                        regs.insert(*b, va);
                    }
                    Ins::Load {
                        dst,
                        src: MemRef::Frame { off },
                        ..
                    } => {
                        regs.insert(*dst, frame[off]);
                    }
                    other => panic!("unexpected instruction in move test: {other}"),
                }
            }
        }
    }

    fn pair_move_case(src: RegPair, dst: RegPair) {
        let mut cg = cg();
        let l = cg.live.add_lcl(Ty::Long, 8).unwrap();
        cg.begin_block(VarSet::EMPTY);

        let n = cg.fo.lcl_var(l, Ty::Long);
        cg.fo.node_mut(n).loc = crate::ir::Loc::Pair(src);

        // Model state: the pair value is 0x11223344_55667788, with the
        // halves placed wherever `src` says they are.
        let mut regs: HashMap<Reg, i64> = HashMap::new();
        let mut frame: HashMap<i32, i64> = HashMap::new();
        frame.insert(8, 0x55667788); // low half home
        frame.insert(4, 0x11223344); // high half home
        if let HalfReg::Reg(r) = src.lo {
            regs.insert(r, 0x55667788);
        }
        if let HalfReg::Reg(r) = src.hi {
            regs.insert(r, 0x11223344);
        }

        cg.move_pair(n, dst);
        run_moves(&cg.em, &mut regs, &frame);

        assert_eq!(regs[&dst.lo.reg().unwrap()], 0x55667788, "low half clobbered");
        assert_eq!(regs[&dst.hi.reg().unwrap()], 0x11223344, "high half clobbered");
        assert_eq!(cg.fo.node(n).pair(), dst);
    }

    #[test]
    fn move_pair_disjoint() {
        pair_move_case(
            RegPair::new(Reg::Eax, Reg::Edx),
            RegPair::new(Reg::Ebx, Reg::Esi),
        );
    }

    #[test]
    fn move_pair_low_shared() {
        // Target low half sits where the source high half lives.
        pair_move_case(
            RegPair::new(Reg::Eax, Reg::Edx),
            RegPair::new(Reg::Edx, Reg::Ebx),
        );
    }

    #[test]
    fn move_pair_high_shared() {
        // Target high half sits where the source low half lives.
        pair_move_case(
            RegPair::new(Reg::Eax, Reg::Edx),
            RegPair::new(Reg::Ebx, Reg::Eax),
        );
    }

    #[test]
    fn move_pair_fully_swapped() {
        let src = RegPair::new(Reg::Eax, Reg::Edx);
        let dst = RegPair {
            lo: HalfReg::Reg(Reg::Edx),
            hi: HalfReg::Reg(Reg::Eax),
        };
        pair_move_case(src, dst);
        // And the swap really is an in-place exchange, not a spill dance.
        let mut cg = cg();
        let l = cg.live.add_lcl(Ty::Long, 8).unwrap();
        cg.begin_block(VarSet::EMPTY);
        let n = cg.fo.lcl_var(l, Ty::Long);
        cg.fo.node_mut(n).loc = crate::ir::Loc::Pair(src);
        cg.move_pair(n, dst);
        assert_eq!(cg.em.insns().count(), 1);
        assert!(matches!(cg.em.insns().next(), Some(&Ins::Xchg { .. })));
    }

    #[test]
    fn move_pair_stack_homed_half() {
        pair_move_case(
            RegPair {
                lo: HalfReg::Stk,
                hi: HalfReg::Reg(Reg::Edx),
            },
            RegPair::new(Reg::Eax, Reg::Ebx),
        );
        // The nasty order: the low target is the source high register.
        pair_move_case(
            RegPair {
                lo: HalfReg::Stk,
                hi: HalfReg::Reg(Reg::Edx),
            },
            RegPair::new(Reg::Edx, Reg::Ebx),
        );
    }

    #[test]
    fn addressable_token_released_exactly() {
        let mut cg = cg();
        let p = cg.live.add_lcl(Ty::Byref, 4).unwrap();
        let i = cg.live.add_lcl(Ty::Int, 8).unwrap();
        let mut live_in = VarSet::EMPTY;
        live_in.insert(p);
        live_in.insert(i);
        cg.begin_block(live_in);

        let np = cg.fo.lcl_var(p, Ty::Byref);
        let ni = cg.fo.lcl_var(i, Ty::Int);
        let two = cg.fo.int_const(2);
        let scaled = cg.fo.bin(BinOp::Lsh, Ty::Int, ni, two);
        let sum = cg.fo.bin(BinOp::Add, Ty::Byref, np, scaled);
        let ind = cg.fo.ind(sum, Ty::Int);

        let mask = cg.make_addressable(ind, RBM_NONE, KeepReg::Keep, true, false);
        assert_eq!(mask.count(), 2);
        assert_eq!(cg.ra.used_mask(), mask);

        // Intervening work evicts one component; keep_addressable must
        // re-validate and return the replacement token.
        let victim = mask.lowest().unwrap();
        cg.ra.spill_reg(&mut cg.fo, &mut cg.em, victim);
        assert!(cg.fo.node(ind).addr_spilled);
        let mask2 = cg.keep_addressable(ind, mask, RBM_NONE);
        assert_eq!(mask2.count(), 2);
        assert!(!cg.fo.node(ind).addr_spilled);

        // Release frees exactly the token, nothing else.
        cg.done_addressable(ind, mask2, KeepReg::Free);
        assert!(cg.ra.used_mask().is_empty());
        assert_eq!(cg.ra.free_mask(), RBM_ALLINT);
        assert!(cg.ra.tmp.all_free());
    }

    #[test]
    fn ternary_converges_and_places_both_arms_in_one_register() {
        let mut cg = cg();
        let a = cg.live.add_lcl(Ty::Int, 4).unwrap();
        let b = cg.live.add_lcl(Ty::Int, 8).unwrap();
        let out = cg.live.add_lcl(Ty::Int, 12).unwrap();
        let mut live_in = VarSet::EMPTY;
        live_in.insert(a);
        live_in.insert(b);
        cg.begin_block(live_in);

        let na = cg.fo.lcl_var(a, Ty::Int);
        let zero = cg.fo.int_const(0);
        let cond = cg.fo.relop(crate::ir::RelOp::Ne, na, zero);
        // Both arms read `b`; one adds a constant first.
        let nb1 = cg.fo.lcl_var(b, Ty::Int);
        let one = cg.fo.int_const(1);
        let then_v = cg.fo.bin(BinOp::Add, Ty::Int, nb1, one);
        let else_v = cg.fo.lcl_var(b, Ty::Int);
        let q = cg.fo.qmark(cond, then_v, else_v);
        let nout = cg.fo.lcl_var(out, Ty::Int);
        let asg = cg.fo.asg(nout, q);
        cg.gen_stmt(asg);
        cg.end_block();

        // Shape: test, branch to the else arm, then-arm, jump over, labels.
        let text = cg.em.text();
        let branch = regex::Regex::new(r"(?m)^j(e|ne) l0$").unwrap();
        assert!(branch.is_match(&text), "{text}");
        assert!(text.contains("jmp l1"), "{text}");
        assert!(text.contains("l0:\n"), "{text}");
        assert!(text.contains("l1:\n"), "{text}");
        // Exactly one store of the merged result.
        assert!(text.contains("mov dword [ebp-12],"), "{text}");
    }

    #[test]
    fn gc_snapshot_at_call_matches_liveness_oracle() {
        let mut cg = cg();
        let obj = cg.live.add_lcl(Ty::Ref, 4).unwrap();
        let n_int = cg.live.add_lcl(Ty::Int, 8).unwrap();
        let mut live_in = VarSet::EMPTY;
        live_in.insert(obj);
        live_in.insert(n_int);
        cg.begin_block(live_in);

        // Hold the object reference in a callee-saved register across the
        // call.
        let nobj = cg.fo.lcl_var(obj, Ty::Ref);
        let r = cg.compute_into(
            nobj,
            Reg::Esi.mask(),
            Exactness::Exact,
            KeepReg::Keep,
            false,
        );
        assert_eq!(r, Reg::Esi);

        let narg = cg.fo.lcl_var(n_int, Ty::Int);
        let call = cg.fo.call(7, Ty::Void, vec![narg]);
        cg.gen_call(call);

        let site = cg.em.call_sites().next().expect("no call site recorded");
        // Oracle: the only live GC value in a register is the ref in ESI;
        // the only live GC-typed local is `obj`.
        assert_eq!(site.gcrefs, Reg::Esi.mask());
        assert!(site.byrefs.is_empty());
        assert!(site.gc_lcls.contains(obj));
        assert!(!site.gc_lcls.contains(n_int));

        cg.ra.mark_free_one(&cg.fo, Reg::Esi, nobj);
        cg.end_block();
    }

    #[test]
    fn call_spills_caller_saved_values_and_restores_on_recover() {
        let mut cg = cg();
        let a = cg.live.add_lcl(Ty::Int, 4).unwrap();
        let mut live_in = VarSet::EMPTY;
        live_in.insert(a);
        cg.begin_block(live_in);

        let na = cg.fo.lcl_var(a, Ty::Int);
        let r = cg.compute_into(na, Reg::Eax.mask(), Exactness::Exact, KeepReg::Keep, false);
        assert_eq!(r, Reg::Eax);

        let call = cg.fo.call(3, Ty::Void, vec![]);
        cg.gen_call(call);
        assert!(cg.fo.node(na).spilled);

        let r2 = cg.recover(na, RBM_NONE, KeepReg::Keep);
        assert!(!cg.fo.node(na).spilled);
        cg.ra.mark_free_one(&cg.fo, r2, na);
        cg.end_block();
    }

    #[test]
    fn shift_count_lands_in_ecx() {
        let mut cg = cg();
        let a = cg.live.add_lcl(Ty::Int, 4).unwrap();
        let b = cg.live.add_lcl(Ty::Int, 8).unwrap();
        let mut live_in = VarSet::EMPTY;
        live_in.insert(a);
        live_in.insert(b);
        cg.begin_block(live_in);

        let na = cg.fo.lcl_var(a, Ty::Int);
        let nb = cg.fo.lcl_var(b, Ty::Int);
        let sh = cg.fo.bin(BinOp::Lsh, Ty::Int, na, nb);
        let r = cg.compute_into(sh, RBM_NONE, Exactness::Any, KeepReg::Free, false);
        assert_ne!(r, Reg::Ecx);
        let text = cg.em.text();
        assert!(text.contains("shl"), "{text}");
        assert!(text.contains(", cl"), "{text}");
    }

    #[test]
    fn ref_store_through_pointer_uses_write_barrier() {
        let mut cg = cg();
        let obj = cg.live.add_lcl(Ty::Ref, 4).unwrap();
        let val = cg.live.add_lcl(Ty::Ref, 8).unwrap();
        let mut live_in = VarSet::EMPTY;
        live_in.insert(obj);
        live_in.insert(val);
        cg.begin_block(live_in);

        // *(obj) = val: the target is provably a heap object, so the plain
        // barrier is used and it receives the address in EDX, value in ECX.
        let nobj = cg.fo.lcl_var(obj, Ty::Ref);
        let ind = cg.fo.ind(nobj, Ty::Ref);
        let nval = cg.fo.lcl_var(val, Ty::Ref);
        let asg = cg.fo.asg(ind, nval);
        cg.gen_stmt(asg);
        cg.end_block();

        let text = cg.em.text();
        assert!(text.contains("call helper:write_barrier\n"), "{text}");
        assert!(text.contains("mov edx, dword [ebp-4]"), "{text}");
        assert!(text.contains("mov ecx, dword [ebp-8]"), "{text}");
        // No plain store was emitted for the reference.
        assert!(!text.contains("mov dword [edx]"), "{text}");
    }

    #[test]
    fn long_arithmetic_uses_carry_chain() {
        let mut cg = cg();
        let a = cg.live.add_lcl(Ty::Long, 8).unwrap();
        let out = cg.live.add_lcl(Ty::Long, 16).unwrap();
        let mut live_in = VarSet::EMPTY;
        live_in.insert(a);
        cg.begin_block(live_in);

        let na = cg.fo.lcl_var(a, Ty::Long);
        let k = cg.fo.lng_const(0x1_0000_0001);
        let sum = cg.fo.bin(BinOp::Add, Ty::Long, na, k);
        let nout = cg.fo.lcl_var(out, Ty::Long);
        let asg = cg.fo.asg(nout, sum);
        cg.gen_stmt(asg);
        cg.end_block();

        let text = cg.em.text();
        let add_pos = text.find("add ").expect("no add");
        let adc_pos = text.find("adc ").expect("no adc");
        assert!(add_pos < adc_pos, "carry chain out of order:\n{text}");
    }
}
