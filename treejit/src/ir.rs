//! The per-statement expression-tree IR.
//!
//! Trees are stored in an arena ([Forest]) and referred to by typed indices
//! rather than direct references; this keeps the node size down and sidesteps
//! representing graph structures with references. Conventions used throughout
//! the crate:
//!
//!  * `fo`: the name conventionally given to the shared [Forest] instance
//!  * `Idx`/`Id`: an index into one of the arena vectors
//!
//! A node's register binding ([Loc]) is a borrowed, revocable relationship:
//! the register allocator may reuse or spill the register later unless the
//! node has been explicitly marked used ("kept") by its consumer.

use crate::{
    target::{Reg, RegPair},
    CompilationError,
};
use typed_index_collections::TiVec;

/// Generate a 16-bit typed index newtype.
macro_rules! index_16bit {
    ($struct:ident) => {
        impl $struct {
            pub fn new(v: usize) -> Result<Self, CompilationError> {
                u16::try_from(v)
                    .map_err(|_| {
                        CompilationError::LimitExceeded(format!(
                            "{} overflow",
                            stringify!($struct)
                        ))
                    })
                    .map(Self)
            }

            pub fn to_u16(self) -> u16 {
                self.0
            }
        }

        impl From<usize> for $struct {
            /// Required for `TiVec`. Panics on overflow: use [Self::new] on
            /// untrusted sizes.
            fn from(v: usize) -> Self {
                Self::new(v).unwrap()
            }
        }

        impl From<$struct> for usize {
            fn from(s: $struct) -> usize {
                s.0.into()
            }
        }
    };
}

/// A tree node index into [Forest::nodes].
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, PartialOrd)]
pub struct NodeId(u16);
index_16bit!(NodeId);

/// A local variable index into the method's locals table.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, PartialOrd)]
pub struct LclId(u16);
index_16bit!(LclId);

/// A value type. `Ref` and `Byref` are the GC-tracked types; `Long` is the
/// only type wider than a native register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Ty {
    Byte,
    Short,
    Int,
    Long,
    /// An object reference: points at the start of a managed heap object.
    Ref,
    /// An interior pointer: may point into the middle of a heap object, or at
    /// a stack location.
    Byref,
    Void,
}

impl Ty {
    pub fn size(self) -> usize {
        match self {
            Ty::Byte => 1,
            Ty::Short => 2,
            Ty::Int | Ty::Ref | Ty::Byref => 4,
            Ty::Long => 8,
            Ty::Void => 0,
        }
    }

    /// The size of the value once it lives in a register or spill temp:
    /// small types are widened to a full word.
    pub fn stack_size(self) -> usize {
        match self {
            Ty::Long => 8,
            Ty::Void => 0,
            _ => 4,
        }
    }

    /// Narrower than a register?
    pub fn is_small(self) -> bool {
        matches!(self, Ty::Byte | Ty::Short)
    }

    /// Is a value of this type traced by the garbage collector?
    pub fn is_gc(self) -> bool {
        matches!(self, Ty::Ref | Ty::Byref)
    }

    /// Does a value of this type occupy a register pair?
    pub fn is_pair(self) -> bool {
        matches!(self, Ty::Long)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Lsh,
    Rsh,
}

impl BinOp {
    pub fn commutes(self) -> bool {
        matches!(self, BinOp::Add | BinOp::Mul | BinOp::And | BinOp::Or | BinOp::Xor)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RelOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// What a node computes.
#[derive(Clone, Debug)]
pub enum Oper {
    /// Use of a local variable (frame homed).
    LclVar(LclId),
    /// A class-static variable slot.
    ClsVar(u16),
    ConstInt(i32),
    ConstLng(i64),
    /// The null object reference.
    Null,
    /// An indirection: load through the address computed by the operand.
    Ind(NodeId),
    /// Store `src` into the location denoted by `dst` (a `LclVar`, `ClsVar`
    /// or `Ind`).
    Asg { dst: NodeId, src: NodeId },
    Bin { op: BinOp, lhs: NodeId, rhs: NodeId },
    Relop { op: RelOp, lhs: NodeId, rhs: NodeId },
    /// Evaluate `effect` for its side effects, then yield `value`.
    Comma { effect: NodeId, value: NodeId },
    /// A conditional value: `cond ? then_val : else_val`.
    Qmark {
        cond: NodeId,
        then_val: NodeId,
        else_val: NodeId,
    },
    /// A call to the method with the given token. Arguments are passed per
    /// the fixed convention in [crate::target::ARG_REG_ORDER].
    Call { target: u16, args: Vec<NodeId> },
}

impl Oper {
    /// Does this operator denote a memory location a store can target?
    pub fn is_location(&self) -> bool {
        matches!(self, Oper::LclVar(_) | Oper::ClsVar(_) | Oper::Ind(_))
    }
}

/// Where a node's computed value currently lives, if anywhere.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Loc {
    /// Not (yet) computed.
    None,
    Reg(Reg),
    Pair(RegPair),
}

/// A tree node plus its mutable codegen state.
#[derive(Clone, Debug)]
pub struct Node {
    pub oper: Oper,
    pub ty: Ty,
    /// The register (pair) binding. When `spilled` is set this records where
    /// the value lived at the time it was evicted.
    pub loc: Loc,
    /// The value (or, for a pair, at least one half of it) has been spilled
    /// to a temp.
    pub spilled: bool,
    /// Evaluate the second operand before the first.
    pub reverse_ops: bool,
    /// On a `LclVar` use: the local dies here (decoration supplied by the
    /// liveness oracle).
    pub lcl_death: bool,
    /// A register pinned for this node's addressing mode was spilled by
    /// intervening codegen; the mode must be re-validated before use.
    pub addr_spilled: bool,
}

impl Node {
    fn new(oper: Oper, ty: Ty) -> Self {
        Node {
            oper,
            ty,
            loc: Loc::None,
            spilled: false,
            reverse_ops: false,
            lcl_death: false,
            addr_spilled: false,
        }
    }

    /// Is the node's value currently live in a register (pair)?
    pub fn in_reg(&self) -> bool {
        self.loc != Loc::None && !self.spilled
    }

    /// The node's single register. Panics if the value is not in one.
    pub fn reg(&self) -> Reg {
        match self.loc {
            Loc::Reg(r) => r,
            _ => panic!("node has no single-register binding: {:?}", self.loc),
        }
    }

    pub fn pair(&self) -> RegPair {
        match self.loc {
            Loc::Pair(p) => p,
            _ => panic!("node has no register-pair binding: {:?}", self.loc),
        }
    }
}

/// The arena of tree nodes for one statement (or a few; the arena is reset
/// per statement by the driver).
#[derive(Debug, Default)]
pub struct Forest {
    nodes: TiVec<NodeId, Node>,
}

impl Forest {
    pub fn new() -> Self {
        Forest::default()
    }

    pub fn add(&mut self, oper: Oper, ty: Ty) -> Result<NodeId, CompilationError> {
        let id = NodeId::new(self.nodes.len())?;
        self.nodes.push(Node::new(oper, ty));
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    // Convenience builders, used heavily by tests and the statement driver.
    // These panic on arena overflow; go through [Self::add] when building
    // trees from untrusted method bodies.

    pub fn int_const(&mut self, v: i32) -> NodeId {
        self.add(Oper::ConstInt(v), Ty::Int).unwrap()
    }

    pub fn lng_const(&mut self, v: i64) -> NodeId {
        self.add(Oper::ConstLng(v), Ty::Long).unwrap()
    }

    pub fn null(&mut self) -> NodeId {
        self.add(Oper::Null, Ty::Ref).unwrap()
    }

    pub fn lcl_var(&mut self, lcl: LclId, ty: Ty) -> NodeId {
        self.add(Oper::LclVar(lcl), ty).unwrap()
    }

    pub fn cls_var(&mut self, slot: u16, ty: Ty) -> NodeId {
        self.add(Oper::ClsVar(slot), ty).unwrap()
    }

    pub fn ind(&mut self, addr: NodeId, ty: Ty) -> NodeId {
        self.add(Oper::Ind(addr), ty).unwrap()
    }

    pub fn asg(&mut self, dst: NodeId, src: NodeId) -> NodeId {
        self.add(Oper::Asg { dst, src }, Ty::Void).unwrap()
    }

    pub fn bin(&mut self, op: BinOp, ty: Ty, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.add(Oper::Bin { op, lhs, rhs }, ty).unwrap()
    }

    pub fn relop(&mut self, op: RelOp, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.add(Oper::Relop { op, lhs, rhs }, Ty::Int).unwrap()
    }

    pub fn comma(&mut self, effect: NodeId, value: NodeId) -> NodeId {
        let ty = self.node(value).ty;
        self.add(Oper::Comma { effect, value }, ty).unwrap()
    }

    pub fn qmark(&mut self, cond: NodeId, then_val: NodeId, else_val: NodeId) -> NodeId {
        let ty = self.node(then_val).ty;
        debug_assert_eq!(ty, self.node(else_val).ty);
        self.add(
            Oper::Qmark {
                cond,
                then_val,
                else_val,
            },
            ty,
        )
        .unwrap()
    }

    pub fn call(&mut self, target: u16, ty: Ty, args: Vec<NodeId>) -> NodeId {
        self.add(Oper::Call { target, args }, ty).unwrap()
    }
}

/// Strip any chain of side-effect wrappers off `node`, returning the wrapped
/// side-effect trees (outermost first) and the core value node. Applied once
/// at entry to each protocol function so the rest of the code never sees a
/// `Comma`.
pub fn strip_comma(fo: &Forest, mut node: NodeId) -> (Vec<NodeId>, NodeId) {
    let mut effects = Vec::new();
    while let Oper::Comma { effect, value } = fo.node(node).oper {
        effects.push(effect);
        node = value;
    }
    (effects, node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_dense() {
        let mut fo = Forest::new();
        let a = fo.int_const(1);
        let b = fo.int_const(2);
        let c = fo.bin(BinOp::Add, Ty::Int, a, b);
        assert_eq!(usize::from(a), 0);
        assert_eq!(usize::from(b), 1);
        assert_eq!(usize::from(c), 2);
        assert!(matches!(fo.node(c).oper, Oper::Bin { op: BinOp::Add, .. }));
    }

    #[test]
    fn strip_comma_unwraps_chains() {
        let mut fo = Forest::new();
        let e1 = fo.int_const(1);
        let e2 = fo.int_const(2);
        let v = fo.int_const(3);
        let inner = fo.comma(e2, v);
        let outer = fo.comma(e1, inner);
        let (effects, core) = strip_comma(&fo, outer);
        assert_eq!(effects, vec![e1, e2]);
        assert_eq!(core, v);
        // A non-comma strips to itself.
        let (effects, core) = strip_comma(&fo, v);
        assert!(effects.is_empty());
        assert_eq!(core, v);
    }

    #[test]
    fn ty_properties() {
        assert!(Ty::Ref.is_gc());
        assert!(Ty::Byref.is_gc());
        assert!(!Ty::Int.is_gc());
        assert!(Ty::Long.is_pair());
        assert_eq!(Ty::Long.size(), 8);
    }
}
