//! The addressability protocol.
//!
//! An IR sub-tree is "addressable" once it can be referenced as a machine
//! memory (or immediate) operand without materializing its value into a
//! register. For an indirection this means decomposing the address
//! expression into base + index*scale + displacement, computing base and
//! index into registers, and pinning those registers until the caller has
//! emitted the instruction that consumes the compound operand.
//!
//! The three calls come in matched sets: [CodeGen::make_addressable] pins
//! and returns a register mask, [CodeGen::keep_addressable] re-validates
//! (and possibly re-materializes) the mode after intervening codegen, and
//! [CodeGen::done_addressable] releases exactly the most recently returned
//! mask.

use crate::{
    emit::{Emitter, MemOperand, MemRef},
    ir::{strip_comma, BinOp, Forest, NodeId, Oper},
    regalloc::KeepReg,
    target::{RegMask, RBM_ALLINT, RBM_NONE},
};

use super::{CodeGen, Exactness};

/// A matched addressing-mode shape: the component sub-trees that must be in
/// registers, plus the parts folded into the operand itself.
#[derive(Clone, Debug, Default)]
pub struct AddrShape {
    pub base: Option<NodeId>,
    pub index: Option<NodeId>,
    pub scale: u8,
    pub disp: i32,
}

/// Classification of one side of an address-forming `Add`.
enum Side {
    Const(i32),
    Scaled(NodeId, u8),
    Plain(NodeId),
}

fn classify(fo: &Forest, node: NodeId) -> Side {
    match fo.node(node).oper {
        Oper::ConstInt(v) => Side::Const(v),
        Oper::Bin {
            op: BinOp::Lsh,
            lhs,
            rhs,
        } => match fo.node(rhs).oper {
            Oper::ConstInt(c @ 0..=3) => Side::Scaled(lhs, 1 << c),
            _ => Side::Plain(node),
        },
        Oper::Bin {
            op: BinOp::Mul,
            lhs,
            rhs,
        } => match fo.node(rhs).oper {
            Oper::ConstInt(m @ (1 | 2 | 4 | 8)) => Side::Scaled(lhs, m as u8),
            _ => Side::Plain(node),
        },
        _ => Side::Plain(node),
    }
}

/// Best-effort, non-backtracking match of an address expression against
/// base + index*scale + disp. Always yields a usable shape: in the worst
/// case the whole expression becomes the base.
pub fn find_addr_shape(fo: &Forest, addr: NodeId) -> AddrShape {
    let (_, addr) = strip_comma(fo, addr);
    match fo.node(addr).oper {
        Oper::ConstInt(v) => AddrShape {
            disp: v,
            ..Default::default()
        },
        Oper::Bin {
            op: BinOp::Add,
            lhs,
            rhs,
        } => {
            let mut shape = AddrShape {
                scale: 1,
                ..Default::default()
            };
            for side in [classify(fo, lhs), classify(fo, rhs)] {
                match side {
                    Side::Const(v) => shape.disp = shape.disp.wrapping_add(v),
                    Side::Scaled(x, s) if shape.index.is_none() => {
                        shape.index = Some(x);
                        shape.scale = s;
                    }
                    Side::Scaled(..) => {
                        // A second scaled term can't fold; give up on this
                        // whole shape and take the expression as the base.
                        return AddrShape {
                            base: Some(addr),
                            ..Default::default()
                        };
                    }
                    Side::Plain(x) => {
                        if shape.base.is_none() {
                            shape.base = Some(x);
                        } else if shape.index.is_none() {
                            shape.index = Some(x);
                            shape.scale = 1;
                        } else {
                            return AddrShape {
                                base: Some(addr),
                                ..Default::default()
                            };
                        }
                    }
                }
            }
            shape
        }
        _ => match classify(fo, addr) {
            Side::Scaled(x, s) => AddrShape {
                index: Some(x),
                scale: s,
                ..Default::default()
            },
            _ => AddrShape {
                base: Some(addr),
                ..Default::default()
            },
        },
    }
}

/// A rough operand-count metric used to order base/index evaluation so the
/// side needing more registers goes first (fewer values live across the
/// other side's computation).
fn weight(fo: &Forest, node: NodeId) -> usize {
    match fo.node(node).oper {
        Oper::LclVar(_) | Oper::ClsVar(_) | Oper::ConstInt(_) | Oper::ConstLng(_) | Oper::Null => 1,
        Oper::Ind(a) => 1 + weight(fo, a),
        Oper::Bin { lhs, rhs, .. } | Oper::Relop { lhs, rhs, .. } => {
            1 + weight(fo, lhs) + weight(fo, rhs)
        }
        Oper::Comma { effect, value } => weight(fo, effect) + weight(fo, value),
        Oper::Asg { dst, src } => 1 + weight(fo, dst) + weight(fo, src),
        Oper::Qmark {
            cond,
            then_val,
            else_val,
        } => 1 + weight(fo, cond) + weight(fo, then_val) + weight(fo, else_val),
        Oper::Call { ref args, .. } => 2 + args.len(),
    }
}

impl<E: Emitter> CodeGen<E> {
    /// Make `node` addressable: after this returns, [Self::addr_operand]
    /// yields a memory operand for it. The returned mask is the set of
    /// registers pinned for the mode; it must be released with a matching
    /// [Self::done_addressable] (possibly after re-validation through
    /// [Self::keep_addressable]).
    ///
    /// `small_ok` permits referencing a sub-word location in place;
    /// without it, small-typed values are widened into a register.
    /// `defer_ok` permits postponing the commitment of registers for modes
    /// that do not need any (the caller will call [Self::keep_addressable]
    /// before use).
    #[must_use = "the returned mask must be released via done_addressable"]
    pub fn make_addressable(
        &mut self,
        node: NodeId,
        need: RegMask,
        keep: KeepReg,
        small_ok: bool,
        defer_ok: bool,
    ) -> RegMask {
        let (effects, node) = strip_comma(&self.fo, node);
        for e in effects {
            self.gen_side_effect(e);
        }

        let n = self.fo.node(node);

        // Values already sitting in a register are trivially addressable.
        if n.in_reg() {
            if n.ty.is_pair() {
                let mask = n.pair().mask();
                if keep == KeepReg::Keep {
                    self.ra.mark_pair_used(&self.fo, node);
                }
                return mask;
            }
            let reg = n.reg();
            if keep == KeepReg::Keep {
                self.ra.mark_used(&self.fo, node);
            }
            return reg.mask();
        }
        if n.spilled {
            let reg = self
                .ra
                .unspill(&mut self.fo, &mut self.em, node, need, keep);
            return reg.mask();
        }

        match self.fo.node(node).oper.clone() {
            Oper::LclVar(lcl) if small_ok || !self.fo.node(node).ty.is_small() => {
                let death = self.fo.node(node).lcl_death;
                self.use_lcl(lcl, death);
                RBM_NONE
            }
            Oper::ClsVar(_) if small_ok || !self.fo.node(node).ty.is_small() => RBM_NONE,
            Oper::ConstInt(_) | Oper::ConstLng(_) | Oper::Null => RBM_NONE,
            Oper::Ind(addr) => {
                let shape = find_addr_shape(&self.fo, addr);
                if shape.base.is_none() && shape.index.is_none() && defer_ok {
                    // Nothing to pin; commit later in keep_addressable.
                    return RBM_NONE;
                }
                self.commit_addr_shape(node, &shape)
            }
            _ => {
                // Fallback: fully evaluate the value into a register.
                let reg = self.compute_into(node, need, Exactness::Any, KeepReg::Keep, false);
                reg.mask()
            }
        }
    }

    /// Evaluate the components of an address shape into registers, pin
    /// them, and return their mask.
    fn commit_addr_shape(&mut self, ind: NodeId, shape: &AddrShape) -> RegMask {
        // Evaluate the heavier side first so fewer values live across the
        // other side's computation.
        let mut comps: Vec<NodeId> = Vec::new();
        match (shape.base, shape.index) {
            (Some(b), Some(i)) => {
                if weight(&self.fo, i) > weight(&self.fo, b) {
                    comps.push(i);
                    comps.push(b);
                } else {
                    comps.push(b);
                    comps.push(i);
                }
            }
            (Some(b), None) => comps.push(b),
            (None, Some(i)) => comps.push(i),
            (None, None) => return RBM_NONE,
        }

        for &c in &comps {
            self.compute_into(c, RBM_NONE, Exactness::Any, KeepReg::Free, false);
            // Pin with the owning indirection recorded, so a later spill of
            // this register flags the mode stale.
            self.ra.mark_used_addr(&self.fo, c, Some(ind));
        }

        // Computing the second component may have evicted the first; put
        // everything back before handing out the mask.
        self.revalidate_comps(ind, &comps);

        let mut mask = RBM_NONE;
        for &c in &comps {
            mask |= self.fo.node(c).reg().mask();
        }
        mask
    }

    /// Reload any spilled components of `ind`'s mode, avoiding the other
    /// components' registers (and `avoid`).
    fn revalidate_comps_avoiding(&mut self, ind: NodeId, comps: &[NodeId], avoid: RegMask) {
        for &c in comps {
            if self.fo.node(c).spilled {
                let mut others = RBM_NONE;
                for &o in comps {
                    if o != c && self.fo.node(o).in_reg() {
                        others |= self.fo.node(o).reg().mask();
                    }
                }
                let need = RBM_ALLINT - others - avoid;
                self.ra
                    .unspill(&mut self.fo, &mut self.em, c, need, KeepReg::Keep);
                // The spill descriptor carried the addr tag, so the unspill
                // re-pinned the register for `ind` already.
            }
        }
        self.fo.node_mut(ind).addr_spilled = false;
    }

    fn revalidate_comps(&mut self, ind: NodeId, comps: &[NodeId]) {
        self.revalidate_comps_avoiding(ind, comps, RBM_NONE);
    }

    /// Re-validate an addressing mode formed earlier: if intervening
    /// codegen spilled any pinned register, re-materialize the mode. The
    /// returned mask replaces the one from [Self::make_addressable];
    /// registers in `avoid` will not be chosen for reloads.
    #[must_use = "the returned mask supersedes the old token"]
    pub fn keep_addressable(&mut self, node: NodeId, mask: RegMask, avoid: RegMask) -> RegMask {
        let (_, node) = strip_comma(&self.fo, node);
        let n = self.fo.node(node);

        if n.in_reg() && !n.addr_spilled {
            return mask;
        }

        if n.spilled {
            // The value itself (trivially-addressable case) went to a temp.
            let reg = self
                .ra
                .unspill(&mut self.fo, &mut self.em, node, RBM_ALLINT - avoid, KeepReg::Keep);
            return reg.mask();
        }

        match self.fo.node(node).oper.clone() {
            Oper::Ind(addr) => {
                let shape = find_addr_shape(&self.fo, addr);
                let mut comps = Vec::new();
                if let Some(b) = shape.base {
                    comps.push(b);
                }
                if let Some(i) = shape.index {
                    comps.push(i);
                }
                // A deferred mode commits here; an intact one passes
                // through; a stale one reloads its spilled components.
                if comps.iter().any(|&c| self.fo.node(c).loc == crate::ir::Loc::None) {
                    debug_assert!(mask.is_empty());
                    return self.commit_addr_shape(node, &shape);
                }
                if !self.fo.node(node).addr_spilled {
                    return mask;
                }
                self.revalidate_comps_avoiding(node, &comps, avoid);
                let mut new_mask = RBM_NONE;
                for &c in &comps {
                    new_mask |= self.fo.node(c).reg().mask();
                }
                new_mask
            }
            _ => mask,
        }
    }

    /// Release the registers pinned for `node`'s addressing mode: exactly
    /// the mask most recently returned by [Self::make_addressable] /
    /// [Self::keep_addressable]. With [KeepReg::Keep] the registers remain
    /// pinned (the caller takes over ownership).
    pub fn done_addressable(&mut self, node: NodeId, mask: RegMask, keep: KeepReg) {
        let (_, _node) = strip_comma(&self.fo, node);
        if keep == KeepReg::Keep {
            return;
        }
        if !mask.is_empty() {
            self.ra.mark_free(&self.fo, mask);
        }
    }

    /// The memory (or register) operand for an addressable node. Must be
    /// preceded by a successful make/keep_addressable.
    pub fn addr_operand(&self, node: NodeId) -> MemRef {
        let (_, node) = strip_comma(&self.fo, node);
        let n = self.fo.node(node);
        match n.oper {
            Oper::LclVar(lcl) => MemRef::Frame {
                off: self.live.lcl(lcl).frame_off,
            },
            Oper::ClsVar(slot) => MemRef::ClsVar(slot),
            Oper::Ind(addr) => {
                let shape = find_addr_shape(&self.fo, addr);
                let mut m = MemOperand {
                    base: None,
                    index: None,
                    disp: shape.disp,
                };
                if let Some(b) = shape.base {
                    m.base = Some(self.fo.node(b).reg());
                }
                if let Some(i) = shape.index {
                    m.index = Some((self.fo.node(i).reg(), shape.scale));
                }
                MemRef::Amode(m)
            }
            _ => panic!("no memory operand for {:?}", n.oper),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Forest, Ty};

    #[test]
    fn shape_matching() {
        let mut fo = Forest::new();
        let l0 = crate::ir::LclId::new(0).unwrap();
        let l1 = crate::ir::LclId::new(1).unwrap();

        // base + index*4 + 8
        let base = fo.lcl_var(l0, Ty::Byref);
        let idx = fo.lcl_var(l1, Ty::Int);
        let four = fo.int_const(2);
        let scaled = fo.bin(BinOp::Lsh, Ty::Int, idx, four);
        let sum = fo.bin(BinOp::Add, Ty::Byref, base, scaled);
        let eight = fo.int_const(8);
        let addr = fo.bin(BinOp::Add, Ty::Byref, sum, eight);

        // The matcher is non-backtracking: the outer add sees (add, const),
        // and the inner add is not re-flattened, so it becomes the base.
        let shape = find_addr_shape(&fo, addr);
        assert_eq!(shape.disp, 8);
        assert_eq!(shape.base, Some(sum));

        // One level: base + scaled index.
        let shape = find_addr_shape(&fo, sum);
        assert_eq!(shape.base, Some(base));
        assert_eq!(shape.index, Some(idx));
        assert_eq!(shape.scale, 4);
    }

    #[test]
    fn constant_address_is_pure_disp() {
        let mut fo = Forest::new();
        let c = fo.int_const(0x1000);
        let shape = find_addr_shape(&fo, c);
        assert_eq!(shape.disp, 0x1000);
        assert!(shape.base.is_none() && shape.index.is_none());
    }

    #[test]
    fn two_scaled_terms_degrade_to_base() {
        let mut fo = Forest::new();
        let l0 = crate::ir::LclId::new(0).unwrap();
        let l1 = crate::ir::LclId::new(1).unwrap();
        let a = fo.lcl_var(l0, Ty::Int);
        let b = fo.lcl_var(l1, Ty::Int);
        let two = fo.int_const(1);
        let sa = fo.bin(BinOp::Lsh, Ty::Int, a, two);
        let two2 = fo.int_const(1);
        let sb = fo.bin(BinOp::Lsh, Ty::Int, b, two2);
        let sum = fo.bin(BinOp::Add, Ty::Int, sa, sb);
        let shape = find_addr_shape(&fo, sum);
        // First scaled term folds, second forces the degraded shape.
        assert_eq!(shape.base, Some(sum));
        assert!(shape.index.is_none());
    }
}
