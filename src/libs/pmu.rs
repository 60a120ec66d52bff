use std::sync::Arc;

use crate::libs::error::{out_of_range, PmdtError, Result};
use crate::libs::intc::InterruptGroups;
use crate::libs::regs::{pmu, CounterCfg, CounterStatus, PmuCaps, RegisterSurface, WindowCfg};
use crate::libs::revision::{HwRevision, TriggerSource, TRIGGER_SOURCES};

/// Largest window size field before the unit shift has to grow.
const WINDOW_SIZE_MAX: u64 = (1 << 24) - 1;
const WINDOW_SHIFT_MAX: u32 = 31;

/// Resources a unit implements, as reported by its capabilities register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitCaps {
    pub counters: u8,
    pub monitors: u8,
    pub elas: u8,
    pub ram_addr_bits: u8,
    pub trackers: u8,
}

impl UnitCaps {
    pub fn all_counters(&self) -> u32 {
        if self.counters >= 32 {
            u32::MAX
        } else {
            (1u32 << self.counters) - 1
        }
    }
}

/// Binding and thresholds of one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterConfig {
    /// Raw trigger source number, 0..128.
    pub trigger: u8,
    pub window_enable: bool,
    pub pause_enable: bool,
    pub low: u64,
    pub high: u64,
}

/// Snapshot returned by [`CounterBank::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterReport {
    pub active: bool,
    pub any_violation: bool,
    pub overflow: bool,
    pub underflow: bool,
    pub paused: bool,
    pub trigger: u8,
    /// Count accumulated in the current window.
    pub value: u64,
    /// Count frozen at the previous window boundary.
    pub previous: u64,
    pub violations: u32,
}

/// Event counter bank of one unit.
///
/// Up to 32 counters, each bound to one of 128 trigger sources, optionally
/// counting over a window shared by the bank. At a window boundary (or on
/// every event when windowing is off) the count is compared with the
/// counter's thresholds:
///
/// - `count >= high` raises an overflow violation.
/// - `count < low` raises an underflow violation (windowed counters only).
pub struct CounterBank {
    regs: Arc<dyn RegisterSurface>,
    rev: Arc<dyn HwRevision>,
    base: u64,
    caps: UnitCaps,
    intc: InterruptGroups,
}

impl CounterBank {
    /// Opens the counter bank of the unit at `unit_base` and reads its
    /// capabilities.
    pub fn new(regs: Arc<dyn RegisterSurface>, rev: Arc<dyn HwRevision>, unit_base: u64) -> Self {
        let base = unit_base + rev.pmu_offset();
        let raw = PmuCaps(regs.read32(base + pmu::CAPS));
        let caps = UnitCaps {
            counters: (raw.counters() as u8).min(32),
            monitors: raw.monitors() as u8,
            elas: raw.elas() as u8,
            ram_addr_bits: raw.ram_addr_bits() as u8,
            trackers: raw.trackers() as u8,
        };
        let intc = InterruptGroups::new(regs.clone(), base + pmu::INTC, 2);
        CounterBank {
            regs,
            rev,
            base,
            caps,
            intc,
        }
    }

    pub fn caps(&self) -> UnitCaps {
        self.caps
    }

    pub fn interrupts(&self) -> &InterruptGroups {
        &self.intc
    }

    /// Raw trigger number of `source` on this revision.
    pub fn trigger_for(&self, source: TriggerSource) -> Result<u8> {
        self.rev.encode_trigger(source).ok_or_else(|| PmdtError::InvalidField {
            field: "trigger source",
            reason: format!("{:?} does not exist on {}", source, self.rev.tag()),
        })
    }

    pub fn decode_trigger(&self, raw: u8) -> Option<TriggerSource> {
        self.rev.decode_trigger(raw)
    }

    fn check_id(&self, counter_id: u8) -> Result<()> {
        if counter_id >= self.caps.counters {
            return Err(out_of_range("counter", counter_id as usize, self.caps.counters as usize));
        }
        Ok(())
    }

    fn check_mask(&self, mask: u32) -> Result<()> {
        let extra = mask & !self.caps.all_counters();
        if extra != 0 {
            return Err(out_of_range(
                "counter",
                extra.trailing_zeros() as usize,
                self.caps.counters as usize,
            ));
        }
        Ok(())
    }

    /// Binds `counter_id` to a trigger source and threshold pair.
    ///
    /// # Parameters
    ///
    /// - `counter_id`: `u8` - Counter to program, below `caps().counters`.
    /// - `config`: `&CounterConfig` - Raw trigger number (see
    ///   [`CounterBank::trigger_for`]), window and pause participation, and
    ///   thresholds. `low` must not exceed `high` on a windowed counter.
    pub fn configure(&self, counter_id: u8, config: &CounterConfig) -> Result<()> {
        self.check_id(counter_id)?;
        if config.trigger >= TRIGGER_SOURCES {
            return Err(out_of_range("trigger source", config.trigger as usize, TRIGGER_SOURCES as usize));
        }
        if config.window_enable && config.low > config.high {
            return Err(PmdtError::InvalidField {
                field: "thresholds",
                reason: format!("low {} above high {}", config.low, config.high),
            });
        }

        let mut cfg = CounterCfg(0);
        cfg.set_trigger(config.trigger as u32);
        cfg.set_window_en(config.window_enable);
        cfg.set_pause_en(config.pause_enable);

        self.regs.write64(self.base + pmu::counter(counter_id, pmu::C_THR_LOW), config.low);
        self.regs.write64(self.base + pmu::counter(counter_id, pmu::C_THR_HIGH), config.high);
        self.regs.write32(self.base + pmu::counter(counter_id, pmu::C_CFG), cfg.0);

        log::debug!(
            "counter {:#x}/{}: trigger {} window {} low {} high {}",
            self.base,
            counter_id,
            config.trigger,
            config.window_enable,
            config.low,
            config.high
        );
        Ok(())
    }

    /// Reads back the binding of `counter_id`.
    pub fn config(&self, counter_id: u8) -> Result<CounterConfig> {
        self.check_id(counter_id)?;
        let cfg = CounterCfg(self.regs.read32(self.base + pmu::counter(counter_id, pmu::C_CFG)));
        Ok(CounterConfig {
            trigger: cfg.trigger() as u8,
            window_enable: cfg.window_en(),
            pause_enable: cfg.pause_en(),
            low: self.regs.read64(self.base + pmu::counter(counter_id, pmu::C_THR_LOW)),
            high: self.regs.read64(self.base + pmu::counter(counter_id, pmu::C_THR_HIGH)),
        })
    }

    fn update_mask(&self, reg: u64, mask: u32, on: bool) -> u32 {
        let cur = self.regs.read32(self.base + reg);
        let new = if on { cur | mask } else { cur & !mask };
        if new != cur {
            self.regs.write32(self.base + reg, new);
        }
        new
    }

    /// Enables or disables every counter in `mask`. Enabling an enabled
    /// counter is a no-op.
    ///
    /// # Parameters
    ///
    /// - `mask`: `u32` - One bit per counter; bits past the implemented
    ///   counters are rejected.
    /// - `on`: `bool` - Enable (`true`) or disable.
    ///
    /// # Returns
    ///
    /// The resulting enabled set.
    pub fn enable(&self, mask: u32, on: bool) -> Result<u32> {
        self.check_mask(mask)?;
        Ok(self.update_mask(pmu::CNT_ENABLE, mask, on))
    }

    pub fn enabled(&self) -> u32 {
        self.regs.read32(self.base + pmu::CNT_ENABLE)
    }

    /// Pauses or resumes every counter in `mask`. Takes effect at the next
    /// window boundary. Returns the resulting paused set.
    pub fn pause(&self, mask: u32, on: bool) -> Result<u32> {
        self.check_mask(mask)?;
        Ok(self.update_mask(pmu::CNT_PAUSE, mask, on))
    }

    pub fn paused(&self) -> u32 {
        self.regs.read32(self.base + pmu::CNT_PAUSE)
    }

    /// Clears count, previous value, violation count and latched violation
    /// flags of every counter in `mask`.
    pub fn clear(&self, mask: u32) -> Result<()> {
        self.check_mask(mask)?;
        if mask != 0 {
            self.regs.write32(self.base + pmu::CNT_CLEAR, mask);
        }
        Ok(())
    }

    /// Sets the window length, shared by every windowed counter of the bank.
    ///
    /// # Returns
    ///
    /// The length actually programmed, after rounding to the register's
    /// size/shift resolution.
    pub fn set_window(&self, cycles: u64) -> Result<u64> {
        if cycles == 0 {
            return Err(PmdtError::InvalidField {
                field: "window",
                reason: "window length must be non-zero".to_string(),
            });
        }
        let mut shift = 0u32;
        while (cycles >> shift) > WINDOW_SIZE_MAX {
            shift += 1;
        }
        if shift > WINDOW_SHIFT_MAX {
            return Err(PmdtError::InvalidField {
                field: "window",
                reason: format!("{} cycles cannot be represented", cycles),
            });
        }
        let mut cfg = WindowCfg(0);
        cfg.set_size((cycles >> shift) as u32);
        cfg.set_unit_shift(shift);
        self.regs.write32(self.base + pmu::WINDOW_CFG, cfg.0);
        Ok(self.window())
    }

    /// Window length in cycles, after rounding to the register's resolution.
    pub fn window(&self) -> u64 {
        let cfg = WindowCfg(self.regs.read32(self.base + pmu::WINDOW_CFG));
        (cfg.size() as u64) << cfg.unit_shift()
    }

    /// Number of window boundaries crossed since reset.
    pub fn window_count(&self) -> u64 {
        self.regs.read64(self.base + pmu::WINDOW_COUNT)
    }

    /// Samples one counter.
    ///
    /// # Errors
    ///
    /// [`PmdtError::Busy`] if a window boundary was crossed while sampling;
    /// the values could mix two windows and the caller should retry.
    pub fn status(&self, counter_id: u8) -> Result<CounterReport> {
        self.check_id(counter_id)?;
        let before = self.window_count();

        let st = CounterStatus(self.regs.read32(self.base + pmu::counter(counter_id, pmu::C_STATUS)));
        let cfg = CounterCfg(self.regs.read32(self.base + pmu::counter(counter_id, pmu::C_CFG)));
        let value = self.regs.read64(self.base + pmu::counter(counter_id, pmu::C_VALUE));
        let previous = self.regs.read64(self.base + pmu::counter(counter_id, pmu::C_PREV));
        let violations = self.regs.read32(self.base + pmu::counter(counter_id, pmu::C_VIOLATIONS));

        if self.window_count() != before {
            return Err(PmdtError::Busy);
        }

        Ok(CounterReport {
            active: st.active(),
            any_violation: st.any_violation(),
            overflow: st.overflow(),
            underflow: st.underflow(),
            paused: st.paused(),
            trigger: cfg.trigger() as u8,
            value,
            previous,
            violations,
        })
    }

    /// [`CounterBank::status`], retried up to `attempts` times while busy.
    pub fn status_retry(&self, counter_id: u8, attempts: usize) -> Result<CounterReport> {
        let mut last = PmdtError::Busy;
        for _ in 0..attempts.max(1) {
            match self.status(counter_id) {
                Err(e) if e.is_retryable() => last = e,
                other => return other,
            }
        }
        Err(last)
    }
}
