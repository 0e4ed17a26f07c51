//! Tracked-local liveness.
//!
//! Liveness itself is computed by an earlier dataflow pass (the "liveness
//! oracle", an external collaborator); it reaches this crate as per-block
//! live-in sets plus last-use decorations on `LclVar` nodes. This module
//! maintains the current live set as the tree walk advances.

use crate::{
    ir::{LclId, Ty},
    CompilationError,
};
use std::{fmt, ops};
use typed_index_collections::TiVec;

/// A set of tracked local variables. At most 64 locals are tracked per
/// method; methods with more give up on tracking the excess (a limit the
/// driver surfaces as a [CompilationError]).
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct VarSet(u64);

impl VarSet {
    pub const EMPTY: VarSet = VarSet(0);

    pub fn bit(lcl: LclId) -> Result<VarSet, CompilationError> {
        let i = usize::from(lcl);
        if i >= 64 {
            return Err(CompilationError::LimitExceeded(format!(
                "local V{i:02} exceeds the tracked-local limit"
            )));
        }
        Ok(VarSet(1 << i))
    }

    pub fn contains(self, lcl: LclId) -> bool {
        let i = usize::from(lcl);
        i < 64 && self.0 & (1 << i) != 0
    }

    pub fn insert(&mut self, lcl: LclId) {
        self.0 |= VarSet::bit(lcl).unwrap().0;
    }

    pub fn remove(&mut self, lcl: LclId) {
        self.0 &= !VarSet::bit(lcl).unwrap().0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = LclId> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                None
            } else {
                let i = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(LclId::new(i).unwrap())
            }
        })
    }
}

impl ops::BitOr for VarSet {
    type Output = VarSet;
    fn bitor(self, rhs: VarSet) -> VarSet {
        VarSet(self.0 | rhs.0)
    }
}

impl ops::BitAnd for VarSet {
    type Output = VarSet;
    fn bitand(self, rhs: VarSet) -> VarSet {
        VarSet(self.0 & rhs.0)
    }
}

impl ops::Sub for VarSet {
    type Output = VarSet;
    fn sub(self, rhs: VarSet) -> VarSet {
        VarSet(self.0 & !rhs.0)
    }
}

impl fmt::Debug for VarSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for lcl in self.iter() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "V{:02}", usize::from(lcl))?;
            first = false;
        }
        write!(f, "}}")
    }
}

/// Per-local static information.
#[derive(Clone, Debug)]
pub struct LclInfo {
    pub ty: Ty,
    /// Frame offset of the local's home, in bytes below the frame pointer.
    pub frame_off: i32,
}

/// The method's locals table plus the live set at the point the tree walk
/// has reached.
#[derive(Debug, Default)]
pub struct Liveness {
    lcls: TiVec<LclId, LclInfo>,
    live: VarSet,
}

impl Liveness {
    pub fn new() -> Self {
        Liveness::default()
    }

    /// Register a local. Locals must be registered before the first block.
    pub fn add_lcl(&mut self, ty: Ty, frame_off: i32) -> Result<LclId, CompilationError> {
        let id = LclId::new(self.lcls.len())?;
        // Force the tracked-local limit check now rather than at first use.
        VarSet::bit(id)?;
        self.lcls.push(LclInfo { ty, frame_off });
        Ok(id)
    }

    pub fn lcl(&self, lcl: LclId) -> &LclInfo {
        &self.lcls[lcl]
    }

    pub fn lcl_count(&self) -> usize {
        self.lcls.len()
    }

    pub fn cur_live(&self) -> VarSet {
        self.live
    }

    pub fn is_live(&self, lcl: LclId) -> bool {
        self.live.contains(lcl)
    }

    /// Block entry: replace the live set with the block's live-in set.
    pub fn set_live_in(&mut self, live_in: VarSet) {
        self.live = live_in;
    }

    /// A use of `lcl`; `death` is the oracle's last-use decoration.
    pub fn use_of(&mut self, lcl: LclId, death: bool) {
        if death {
            self.live.remove(lcl);
        }
    }

    /// A definition of `lcl`: it is live from here on.
    pub fn def_of(&mut self, lcl: LclId) {
        self.live.insert(lcl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varset_ops() {
        let mut live = Liveness::new();
        let a = live.add_lcl(Ty::Int, 4).unwrap();
        let b = live.add_lcl(Ty::Ref, 8).unwrap();
        let mut s = VarSet::EMPTY;
        s.insert(a);
        assert!(s.contains(a));
        assert!(!s.contains(b));
        s.insert(b);
        assert_eq!(s.iter().collect::<Vec<_>>(), vec![a, b]);
        s.remove(a);
        assert!(!s.contains(a));
    }

    #[test]
    fn death_and_def_update_live_set() {
        let mut live = Liveness::new();
        let a = live.add_lcl(Ty::Int, 4).unwrap();
        let b = live.add_lcl(Ty::Int, 8).unwrap();
        let mut live_in = VarSet::EMPTY;
        live_in.insert(a);
        live.set_live_in(live_in);
        assert!(live.is_live(a));
        live.use_of(a, true);
        assert!(!live.is_live(a));
        live.def_of(b);
        assert!(live.is_live(b));
        live.use_of(b, false);
        assert!(live.is_live(b));
    }
}
