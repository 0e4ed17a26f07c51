//! The instruction-selection and register-allocation core of a tree-walking,
//! single-pass JIT code generator for a managed-language runtime.
//!
//! The crate walks an expression-tree IR one statement at a time and emits
//! abstract machine instructions through a narrow [emit::Emitter] interface,
//! while managing a small fixed register file, forming memory addressing
//! modes, handling register pairs for values wider than a register, and
//! maintaining precise GC pointer tracking at every potential collection
//! point.
//!
//! The pieces, leaves first:
//!
//!  * [target]: registers, register masks, register pairs.
//!  * [ir]: the per-statement expression trees.
//!  * [temps]: stack temp slots for spilled values.
//!  * [regalloc]: the register set manager (grant/lock/spill/reload and
//!    the multiply-used register bookkeeping).
//!  * [gcinfo]: the GC pointer bitsets and write-barrier dispatch.
//!  * [track]: register content tracking and the condition-flags cache.
//!  * [liveness]: tracked-local live sets.
//!  * [codegen]: value materialization, addressability, pairs, ternaries,
//!    calls and the statement driver.
//!
//! Contract violations inside the core (spilling a locked register, freeing
//! an ownerless register, diverging ternary arms) are compiler bugs, not
//! input errors, and abort via `panic!`. The crate boundary reports the few
//! resource-shaped conditions through [CompilationError].

use thiserror::Error;

pub mod codegen;
pub mod config;
pub mod emit;
pub mod gcinfo;
pub mod ir;
pub mod liveness;
pub mod log;
pub mod regalloc;
pub mod target;
pub mod temps;
pub mod track;

pub use codegen::{CodeGen, Exactness};
pub use regalloc::KeepReg;

/// A failure to compile a method.
#[derive(Error, Debug)]
pub enum CompilationError {
    #[error("Internal error: {0}")]
    /// Something went wrong that is probably the result of a bug in the
    /// code generator itself.
    InternalError(String),
    #[error("Limit exceeded: {0}")]
    /// A structural limit was exceeded (e.g. too many tree nodes or tracked
    /// locals for the compact indices used here).
    LimitExceeded(String),
    #[error("Resource exhausted: {0}")]
    /// An external resource ran out; the embedder probably wants to know.
    ResourceExhausted(String),
}
