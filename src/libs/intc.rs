use std::sync::Arc;

use crate::libs::regs::{intc, RegisterSurface};

/// Interrupt-controller sub-block of a counter bank or of the matrix.
///
/// Causes are grouped in numbered 32-bit groups, each with a cause, a mask
/// (1 = masked) and a write-one-to-clear register.
#[derive(Clone)]
pub struct InterruptGroups {
    regs: Arc<dyn RegisterSurface>,
    base: u64,
    groups: u8,
}

impl InterruptGroups {
    pub fn new(regs: Arc<dyn RegisterSurface>, base: u64, groups: u8) -> Self {
        InterruptGroups { regs, base, groups }
    }

    pub fn groups(&self) -> u8 {
        self.groups
    }

    pub fn cause(&self, group: u8) -> u32 {
        self.regs.read32(intc::reg(self.base, group, intc::CAUSE))
    }

    pub fn mask(&self, group: u8) -> u32 {
        self.regs.read32(intc::reg(self.base, group, intc::MASK))
    }

    /// Causes that are raised and not masked.
    pub fn pending(&self, group: u8) -> u32 {
        self.cause(group) & !self.mask(group)
    }

    /// Clears exactly `bits`. A cause raised after it was read stays set.
    pub fn clear(&self, group: u8, bits: u32) {
        if bits != 0 {
            self.regs.write32(intc::reg(self.base, group, intc::CLEAR), bits);
        }
    }

    /// Masks (`masked = true`) or unmasks `bits`, leaving the others alone.
    pub fn set_mask(&self, group: u8, bits: u32, masked: bool) -> u32 {
        let addr = intc::reg(self.base, group, intc::MASK);
        let cur = self.regs.read32(addr);
        let new = if masked { cur | bits } else { cur & !bits };
        self.regs.write32(addr, new);
        new
    }

    /// First group with a pending cause and that cause's bit.
    pub fn first_pending(&self) -> Option<(u8, u8)> {
        (0..self.groups).find_map(|g| {
            let p = self.pending(g);
            (p != 0).then(|| (g, p.trailing_zeros() as u8))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::cctm::CrossTriggerMatrix;
    use crate::libs::regs::cctm;
    use crate::libs::revision::RevisionTag;
    use crate::libs::sim::{demo_map, SimComplex, SimUnitSpec};

    fn matrix_groups() -> (CrossTriggerMatrix, InterruptGroups) {
        let map = demo_map(RevisionTag::RevA, 4);
        let sim = SimComplex::new(&map, SimUnitSpec::default());
        let intc = InterruptGroups::new(sim.clone(), map.cctm_base + cctm::INTC, cctm::INT_GROUPS);
        (CrossTriggerMatrix::new(sim, map.cctm_base), intc)
    }

    #[test]
    fn masked_causes_are_not_pending() {
        let (m, intc) = matrix_groups();
        m.force_trigger(0b0110, true);
        assert_eq!(intc.cause(0), 0b0110);
        assert_eq!(intc.pending(0), 0);
        assert_eq!(intc.first_pending(), None);

        assert_eq!(intc.set_mask(0, 0b0100, false), !0b0100);
        assert_eq!(intc.pending(0), 0b0100);
        assert_eq!(intc.first_pending(), Some((0, 2)));
    }

    #[test]
    fn clear_only_touches_bits_read() {
        let (m, intc) = matrix_groups();
        intc.set_mask(0, u32::MAX, false);
        m.force_trigger(0b0001, true);
        let taken = intc.pending(0);
        assert_eq!(taken, 0b0001);

        // A cause raised after the read survives the clear of the old bits.
        m.force_trigger(0b1000, true);
        intc.clear(0, taken);
        assert_eq!(intc.pending(0), 0b1000);
    }
}
