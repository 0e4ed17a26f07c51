//! Temporary stack slots for spilled values.
//!
//! Slots live in the method frame, below the locals. Released slots are kept
//! on a free list and reused by later spills of the same size and GC-ness;
//! the frame never shrinks within a method. GC-typed slots keep their
//! GC-ness for the slot's whole lifetime so the stack map stays truthful
//! even across reuse.

use crate::gcinfo::GcKind;
use typed_index_collections::TiVec;

/// A temp slot index.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlotId(u16);

impl From<usize> for SlotId {
    fn from(v: usize) -> Self {
        SlotId(u16::try_from(v).unwrap())
    }
}

impl From<SlotId> for usize {
    fn from(s: SlotId) -> usize {
        s.0.into()
    }
}

/// This data structure keeps track of an abstract frame pointer during code
/// generation. The abstract frame pointer is zero-based, so its value also
/// serves as the size of the frame's temp area.
///
/// The implementation is platform agnostic: as the frame gets bigger, the
/// abstract frame pointer grows upwards, even though the real stack grows
/// downwards.
#[derive(Debug, Default)]
pub struct AbstractFrame(usize);

impl AbstractFrame {
    /// Aligns the abstract frame pointer to the specified number of bytes.
    ///
    /// Returns the newly aligned frame pointer.
    pub fn align(&mut self, to: usize) -> usize {
        let rem = self.0 % to;
        if rem != 0 {
            self.0 += to - rem;
        }
        self.0
    }

    /// Makes the frame bigger by `nbytes` bytes.
    ///
    /// Returns the new frame pointer.
    pub fn grow(&mut self, nbytes: usize) -> usize {
        self.0 += nbytes;
        self.0
    }

    /// Returns the frame pointer value.
    pub fn size(&self) -> usize {
        self.0
    }
}

#[derive(Clone, Debug)]
struct TempSlot {
    size: usize,
    gc: GcKind,
    /// Byte offset of the slot's end from the temp-area base.
    off: usize,
    in_use: bool,
}

/// The temp slot allocator.
#[derive(Debug, Default)]
pub struct TempAlloc {
    frame: AbstractFrame,
    slots: TiVec<SlotId, TempSlot>,
}

impl TempAlloc {
    pub fn new() -> Self {
        TempAlloc::default()
    }

    /// Reserve a slot of the given size and GC-ness, reusing a released slot
    /// when one matches.
    pub fn take(&mut self, size: usize, gc: GcKind) -> SlotId {
        debug_assert!(size == 4 || size == 8);
        if let Some((id, slot)) = self
            .slots
            .iter_mut_enumerated()
            .find(|(_, s)| !s.in_use && s.size == size && s.gc == gc)
        {
            slot.in_use = true;
            return id;
        }
        self.frame.align(size);
        let off = self.frame.grow(size);
        let id = SlotId::from(self.slots.len());
        self.slots.push(TempSlot {
            size,
            gc,
            off,
            in_use: true,
        });
        id
    }

    /// Return a slot to the free list.
    pub fn release(&mut self, id: SlotId) {
        let slot = &mut self.slots[id];
        assert!(slot.in_use, "releasing a temp slot that is not in use");
        slot.in_use = false;
    }

    pub fn off(&self, id: SlotId) -> usize {
        self.slots[id].off
    }

    pub fn size(&self, id: SlotId) -> usize {
        self.slots[id].size
    }

    pub fn gc(&self, id: SlotId) -> GcKind {
        self.slots[id].gc
    }

    /// Are all slots released? Holds at every statement boundary once all
    /// spills have been resolved.
    pub fn all_free(&self) -> bool {
        self.slots.iter().all(|s| !s.in_use)
    }

    /// Total bytes of frame consumed by temps.
    pub fn frame_size(&self) -> usize {
        self.frame.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow() {
        let mut f = AbstractFrame::default();
        assert_eq!(f.grow(8), 8);
        assert_eq!(f.grow(8), 16);
        assert_eq!(f.grow(1), 17);
        assert_eq!(f.grow(0), 17);
    }

    #[test]
    fn align() {
        let mut f = AbstractFrame::default();
        assert_eq!(f.align(8), 0);
        f.grow(1);
        assert_eq!(f.align(4), 4);
        assert_eq!(f.align(4), 4);
        assert_eq!(f.align(8), 8);
    }

    #[test]
    fn reuse_matches_size_and_gcness() {
        let mut tmp = TempAlloc::new();
        let a = tmp.take(4, GcKind::None);
        let b = tmp.take(4, GcKind::Ref);
        assert_ne!(tmp.off(a), tmp.off(b));
        tmp.release(a);
        tmp.release(b);
        // A GC slot must not be handed out for a non-GC spill and vice
        // versa, but matching requests reuse the released slot.
        let c = tmp.take(4, GcKind::Ref);
        assert_eq!(tmp.off(c), tmp.off(b));
        let d = tmp.take(4, GcKind::None);
        assert_eq!(tmp.off(d), tmp.off(a));
        assert!(!tmp.all_free());
        tmp.release(c);
        tmp.release(d);
        assert!(tmp.all_free());
    }

    #[test]
    fn wide_slots_are_aligned() {
        let mut tmp = TempAlloc::new();
        let _ = tmp.take(4, GcKind::None);
        let w = tmp.take(8, GcKind::None);
        assert_eq!(tmp.off(w) % 8, 0);
        assert_eq!(tmp.size(w), 8);
    }
}
