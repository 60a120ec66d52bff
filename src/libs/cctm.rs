use std::sync::Arc;

use crate::libs::error::{out_of_range, PmdtError, Result};
use crate::libs::intc::InterruptGroups;
use crate::libs::regs::{cctm, RegisterSurface, TsCtrl, TsRatio};

/// Per-destination routing rows.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CrossLine {
    /// A trigger from a source pauses the destination.
    Pause,
    /// A trigger from a source enables the destination.
    Enable,
    /// A trigger from a source clears the destination's counters.
    Clear,
    /// A trigger from a source raises the destination's gpio line.
    Gpio,
    /// A trigger from a source is forwarded as the destination's trigger.
    Trigger,
}

impl CrossLine {
    fn reg(self) -> u64 {
        match self {
            CrossLine::Pause => cctm::R_PAUSE_SRC,
            CrossLine::Enable => cctm::R_ENABLE_SRC,
            CrossLine::Clear => cctm::R_CLEAR_SRC,
            CrossLine::Gpio => cctm::R_GPIO_SRC,
            CrossLine::Trigger => cctm::R_TRIGGER_SRC,
        }
    }
}

/// Cross-trigger matrix of a complex.
///
/// Wires the enable, pause, clear, gpio and trigger lines of every unit
/// together. Bit `n` of every vector is the unit whose
/// [`crate::libs::unit_map::UnitDesc::cctm_bit`] is `n`. Once a row is
/// programmed, propagation happens in hardware; software only sets and
/// observes the lines. The matrix also distributes the shared timestamp.
pub struct CrossTriggerMatrix {
    regs: Arc<dyn RegisterSurface>,
    base: u64,
    intc: InterruptGroups,
}

impl CrossTriggerMatrix {
    pub fn new(regs: Arc<dyn RegisterSurface>, base: u64) -> Self {
        let intc = InterruptGroups::new(regs.clone(), base + cctm::INTC, cctm::INT_GROUPS);
        CrossTriggerMatrix { regs, base, intc }
    }

    pub fn interrupts(&self) -> &InterruptGroups {
        &self.intc
    }

    fn update(&self, reg: u64, mask: u64, on: bool) -> u64 {
        let cur = self.regs.read64(self.base + reg);
        let new = if on { cur | mask } else { cur & !mask };
        self.regs.write64(self.base + reg, new);
        new
    }

    /// Asserts or releases the enable line of every unit in `mask`.
    /// Returns the resulting enable vector.
    pub fn enable(&self, mask: u64, on: bool) -> u64 {
        self.update(cctm::ENABLE, mask, on)
    }

    /// Pauses or resumes every unit in `mask`. Returns the resulting pause
    /// vector, including pauses raised by hardware.
    pub fn pause(&self, mask: u64, on: bool) -> u64 {
        self.update(cctm::PAUSE, mask, on)
    }

    /// Clears the counters and latched triggers of every unit in `mask`.
    pub fn clear(&self, mask: u64) {
        self.regs.write64(self.base + cctm::CLEAR, mask);
    }

    pub fn gpio_enable(&self, mask: u64, on: bool) -> u64 {
        self.update(cctm::GPIO_ENABLE, mask, on)
    }

    /// Forces (or releases) the trigger line of every unit in `mask`, as if
    /// the unit had detected a violation.
    pub fn force_trigger(&self, mask: u64, on: bool) -> u64 {
        self.update(cctm::FORCE_TRIGGER, mask, on)
    }

    pub fn enabled(&self) -> u64 {
        self.regs.read64(self.base + cctm::ENABLE)
    }

    /// Units whose trigger line has fired since they were last cleared.
    pub fn triggers(&self) -> u64 {
        self.regs.read64(self.base + cctm::TRIGGER_STATE)
    }

    pub fn gpio_state(&self) -> u64 {
        self.regs.read64(self.base + cctm::GPIO_STATE)
    }

    pub fn pause_state(&self) -> u64 {
        self.regs.read64(self.base + cctm::PAUSE_STATE)
    }

    fn check_dest(dest_bit: u8) -> Result<()> {
        if dest_bit >= cctm::MAX_UNITS {
            return Err(out_of_range("cross-trigger destination", dest_bit as usize, cctm::MAX_UNITS as usize));
        }
        Ok(())
    }

    /// Adds (`on`) or removes sources from one destination row.
    ///
    /// # Parameters
    ///
    /// - `line`: `CrossLine` - Which routing table to edit.
    /// - `dest_bit`: `u8` - Matrix bit of the destination unit.
    /// - `source_mask`: `u64` - Matrix bits of the source units.
    /// - `on`: `bool` - Add (`true`) or remove the sources.
    ///
    /// # Returns
    ///
    /// The resulting row.
    pub fn set_row(&self, line: CrossLine, dest_bit: u8, source_mask: u64, on: bool) -> Result<u64> {
        Self::check_dest(dest_bit)?;
        let row = self.update(cctm::row(dest_bit, line.reg()), source_mask, on);
        log::debug!("cctm row {:?}[{}] = {:#018x}", line, dest_bit, row);
        Ok(row)
    }

    pub fn row(&self, line: CrossLine, dest_bit: u8) -> Result<u64> {
        Self::check_dest(dest_bit)?;
        Ok(self.regs.read64(self.base + cctm::row(dest_bit, line.reg())))
    }

    /// Lets the units in `source_mask` pause `dest_bit` by firing a trigger.
    pub fn cross_pause_enable(&self, dest_bit: u8, source_mask: u64, on: bool) -> Result<u64> {
        self.set_row(CrossLine::Pause, dest_bit, source_mask, on)
    }

    /// Clears every routing row of `dest_bit`.
    pub fn clear_rows(&self, dest_bit: u8) -> Result<()> {
        Self::check_dest(dest_bit)?;
        for line in [
            CrossLine::Pause,
            CrossLine::Enable,
            CrossLine::Clear,
            CrossLine::Gpio,
            CrossLine::Trigger,
        ] {
            self.regs.write64(self.base + cctm::row(dest_bit, line.reg()), 0);
        }
        Ok(())
    }

    // Timestamp distribution. Every write reaches all units within one clock
    // of skew.

    /// Sets the timestamp increment as `numerator / denominator` per cycle.
    pub fn timestamp_ratio_set(&self, numerator: u16, denominator: u16) -> Result<()> {
        if numerator == 0 || denominator == 0 {
            return Err(PmdtError::InvalidField {
                field: "timestamp ratio",
                reason: format!("{}/{} is not a valid ratio", numerator, denominator),
            });
        }
        let mut ratio = TsRatio(0);
        ratio.set_numerator(numerator as u32);
        ratio.set_denominator(denominator as u32);
        self.regs.write32(self.base + cctm::TS_RATIO, ratio.0);
        Ok(())
    }

    /// Value loaded into the timestamp by the next clear.
    pub fn timestamp_initial_value_set(&self, value: u64) {
        self.regs.write64(self.base + cctm::TS_INIT, value);
    }

    fn update_ts(&self, f: impl FnOnce(&mut TsCtrl)) {
        let mut ctrl = TsCtrl(self.regs.read32(self.base + cctm::TS_CTRL));
        f(&mut ctrl);
        self.regs.write32(self.base + cctm::TS_CTRL, ctrl.0);
    }

    pub fn timestamp_enable(&self, on: bool) {
        self.update_ts(|c| c.set_enable(on));
    }

    pub fn timestamp_pause(&self, on: bool) {
        self.update_ts(|c| c.set_pause(on));
    }

    /// Reloads the timestamp with its initial value.
    pub fn timestamp_clear(&self) {
        self.regs.write32(self.base + cctm::TS_CLEAR, 1);
    }

    pub fn timestamp_get(&self) -> u64 {
        self.regs.read64(self.base + cctm::TS_VALUE)
    }
}
