//! The narrow interface to the instruction emitter.
//!
//! Byte encoding and relocation live in an external collaborator; this crate
//! hands it one abstract machine instruction at a time, plus label
//! definitions and per-call-site GC snapshots for the stack map. [BufEmitter]
//! records everything textually and is what the tests drive.

use crate::{gcinfo::CallSiteGc, target::Reg, temps::SlotId};
use std::fmt;

/// A branch target. Labels are created and later bound through the
/// [Emitter].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Label(pub u16);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// A resolved base+index*scale+disp memory operand.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MemOperand {
    pub base: Option<Reg>,
    pub index: Option<(Reg, u8)>,
    pub disp: i32,
}

impl fmt::Display for MemOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        let mut any = false;
        if let Some(b) = self.base {
            write!(f, "{b}")?;
            any = true;
        }
        if let Some((i, s)) = self.index {
            if any {
                write!(f, "+")?;
            }
            write!(f, "{i}*{s}")?;
            any = true;
        }
        if self.disp != 0 || !any {
            if any && self.disp >= 0 {
                write!(f, "+")?;
            }
            write!(f, "{}", self.disp)?;
        }
        write!(f, "]")
    }
}

/// A memory location an instruction can read or write.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemRef {
    Amode(MemOperand),
    /// A class-static slot.
    ClsVar(u16),
    /// A local's frame home: `off` bytes below the frame pointer. For a
    /// `Long` local, `off` addresses the low half and `off - 4` the high.
    Frame { off: i32 },
    /// A spill temp.
    Temp(SlotId),
}

impl fmt::Display for MemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemRef::Amode(m) => write!(f, "{m}"),
            MemRef::ClsVar(s) => write!(f, "[static:{s}]"),
            MemRef::Frame { off } => write!(f, "[ebp-{off}]"),
            MemRef::Temp(t) => write!(f, "[tmp.{}]", usize::from(*t)),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AluOp {
    Add,
    Adc,
    Sub,
    Sbb,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Imul,
}

impl AluOp {
    fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Adc => "adc",
            AluOp::Sub => "sub",
            AluOp::Sbb => "sbb",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
            AluOp::Shl => "shl",
            AluOp::Shr => "shr",
            AluOp::Imul => "imul",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Cond {
    E,
    Ne,
    L,
    Le,
    G,
    Ge,
}

impl Cond {
    pub fn invert(self) -> Cond {
        match self {
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::L => Cond::Ge,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
            Cond::Ge => Cond::L,
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Cond::E => "je",
            Cond::Ne => "jne",
            Cond::L => "jl",
            Cond::Le => "jle",
            Cond::G => "jg",
            Cond::Ge => "jge",
        }
    }
}

/// Runtime helpers the generated code can call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Helper {
    /// Store a ref into a location known to be in the heap.
    WriteBarrier,
    /// Store a ref into a location that may be outside the heap.
    WriteBarrierChecked,
}

impl Helper {
    fn name(self) -> &'static str {
        match self {
            Helper::WriteBarrier => "write_barrier",
            Helper::WriteBarrierChecked => "write_barrier_checked",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegImm {
    Reg(Reg),
    Imm(i32),
}

impl fmt::Display for RegImm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegImm::Reg(r) => write!(f, "{r}"),
            RegImm::Imm(i) => write!(f, "{i}"),
        }
    }
}

fn size_kw(size: usize) -> &'static str {
    match size {
        1 => "byte",
        2 => "word",
        4 => "dword",
        _ => panic!("bad operand size {size}"),
    }
}

/// One abstract machine instruction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Ins {
    MovRR { dst: Reg, src: Reg },
    MovRI { dst: Reg, imm: i32 },
    Xchg { a: Reg, b: Reg },
    Load { dst: Reg, src: MemRef, size: usize },
    Store { dst: MemRef, src: Reg, size: usize },
    StoreImm { dst: MemRef, imm: i32, size: usize },
    Lea { dst: Reg, src: MemRef },
    Alu { op: AluOp, dst: Reg, src: RegImm },
    /// ALU op with a memory source operand: the payoff of addressability.
    AluM { op: AluOp, dst: Reg, src: MemRef },
    /// Variable shift: count in ECX, as the ISA demands.
    ShiftCl { op: AluOp, dst: Reg },
    Cmp { lhs: Reg, rhs: RegImm },
    Test { a: Reg, b: Reg },
    Jcc { cond: Cond, target: Label },
    Jmp { target: Label },
    Push { src: Reg },
    Call { target: u16 },
    CallHelper { helper: Helper },
}

impl fmt::Display for Ins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ins::MovRR { dst, src } => write!(f, "mov {dst}, {src}"),
            Ins::MovRI { dst, imm } => write!(f, "mov {dst}, {imm}"),
            Ins::Xchg { a, b } => write!(f, "xchg {a}, {b}"),
            Ins::Load { dst, src, size } => {
                write!(f, "mov {dst}, {} {src}", size_kw(*size))
            }
            Ins::Store { dst, src, size } => {
                write!(f, "mov {} {dst}, {src}", size_kw(*size))
            }
            Ins::StoreImm { dst, imm, size } => {
                write!(f, "mov {} {dst}, {imm}", size_kw(*size))
            }
            Ins::Lea { dst, src } => write!(f, "lea {dst}, {src}"),
            Ins::Alu { op, dst, src } => write!(f, "{} {dst}, {src}", op.mnemonic()),
            Ins::AluM { op, dst, src } => {
                write!(f, "{} {dst}, dword {src}", op.mnemonic())
            }
            Ins::ShiftCl { op, dst } => write!(f, "{} {dst}, cl", op.mnemonic()),
            Ins::Cmp { lhs, rhs } => write!(f, "cmp {lhs}, {rhs}"),
            Ins::Test { a, b } => write!(f, "test {a}, {b}"),
            Ins::Jcc { cond, target } => write!(f, "{} {target}", cond.mnemonic()),
            Ins::Jmp { target } => write!(f, "jmp {target}"),
            Ins::Push { src } => write!(f, "push {src}"),
            Ins::Call { target } => write!(f, "call m{target}"),
            Ins::CallHelper { helper } => write!(f, "call helper:{}", helper.name()),
        }
    }
}

/// The emitter: append one instruction at a time, place labels, and record
/// stack-map snapshots at call sites.
pub trait Emitter {
    fn emit(&mut self, ins: Ins);
    fn new_label(&mut self) -> Label;
    fn bind_label(&mut self, label: Label);
    fn record_call_site(&mut self, gc: CallSiteGc);
}

#[derive(Clone, Debug, PartialEq)]
pub enum Emitted {
    Ins(Ins),
    Bind(Label),
    CallSite(CallSiteGc),
}

/// An emitter that records everything; the test suite's observation point.
#[derive(Debug, Default)]
pub struct BufEmitter {
    items: Vec<Emitted>,
    next_label: u16,
}

impl BufEmitter {
    pub fn new() -> Self {
        BufEmitter::default()
    }

    pub fn items(&self) -> &[Emitted] {
        &self.items
    }

    pub fn insns(&self) -> impl Iterator<Item = &Ins> {
        self.items.iter().filter_map(|x| match x {
            Emitted::Ins(i) => Some(i),
            _ => None,
        })
    }

    pub fn call_sites(&self) -> impl Iterator<Item = &CallSiteGc> {
        self.items.iter().filter_map(|x| match x {
            Emitted::CallSite(s) => Some(s),
            _ => None,
        })
    }

    /// The recorded stream as one line per instruction/label, for matching
    /// in tests.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for item in &self.items {
            match item {
                Emitted::Ins(i) => out.push_str(&format!("{i}\n")),
                Emitted::Bind(l) => out.push_str(&format!("{l}:\n")),
                Emitted::CallSite(s) => out.push_str(&format!(
                    "; gc refs={:?} byrefs={:?} lcls={:?}\n",
                    s.gcrefs, s.byrefs, s.gc_lcls
                )),
            }
        }
        out
    }
}

impl Emitter for BufEmitter {
    fn emit(&mut self, ins: Ins) {
        self.items.push(Emitted::Ins(ins));
    }

    fn new_label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    fn bind_label(&mut self, label: Label) {
        self.items.push(Emitted::Bind(label));
    }

    fn record_call_site(&mut self, gc: CallSiteGc) {
        self.items.push(Emitted::CallSite(gc));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Reg;

    #[test]
    fn display_forms() {
        assert_eq!(
            Ins::MovRR {
                dst: Reg::Eax,
                src: Reg::Ebx
            }
            .to_string(),
            "mov eax, ebx"
        );
        let m = MemOperand {
            base: Some(Reg::Ebx),
            index: Some((Reg::Ecx, 4)),
            disp: 8,
        };
        assert_eq!(m.to_string(), "[ebx+ecx*4+8]");
        assert_eq!(
            Ins::AluM {
                op: AluOp::Add,
                dst: Reg::Eax,
                src: MemRef::Amode(m)
            }
            .to_string(),
            "add eax, dword [ebx+ecx*4+8]"
        );
        assert_eq!(
            Ins::Load {
                dst: Reg::Esi,
                src: MemRef::Frame { off: 12 },
                size: 4
            }
            .to_string(),
            "mov esi, dword [ebp-12]"
        );
    }

    #[test]
    fn cond_inversion_round_trips() {
        for c in [Cond::E, Cond::Ne, Cond::L, Cond::Le, Cond::G, Cond::Ge] {
            assert_eq!(c.invert().invert(), c);
        }
    }

    #[test]
    fn buf_emitter_records_in_order() {
        let mut em = BufEmitter::new();
        let l = em.new_label();
        em.emit(Ins::Jmp { target: l });
        em.bind_label(l);
        assert_eq!(em.text(), "jmp l0\nl0:\n");
    }
}
