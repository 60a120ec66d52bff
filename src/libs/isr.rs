use std::fmt;

use bitflags::bitflags;

use crate::libs::axi_monitor::LogEntry;
use crate::libs::common::bits_of;
use crate::libs::config::Feature;
use crate::libs::ela::TraceEntry;
use crate::libs::error::Result;
use crate::libs::pmdt::{Pmdt, STATUS_ATTEMPTS};
use crate::libs::pmu::CounterReport;
use crate::libs::regs::{pmu, Direction, MonitorCause};

bitflags! {
    /// Kinds of run-time violation carried by an [`ErrorReport`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ErrorKind: u32 {
        const TIMEOUT = 1 << 0;
        const HISTOGRAM = 1 << 1;
        const TRAP = 1 << 2;
        const TRACK_OVERFLOW = 1 << 3;
        const TRACK_UNDERFLOW = 1 << 4;
        const BUS_ERROR = 1 << 5;
        /// Cause with no owner in the unit's allocation.
        const UNKNOWN = 1 << 31;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterViolation {
    pub counter: u8,
    pub feature: Option<Feature>,
    pub report: CounterReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub unit: u8,
    pub kinds: ErrorKind,
    /// Last stale transaction of each timed-out monitor.
    pub timeouts: Vec<(Direction, LogEntry)>,
    pub violations: Vec<CounterViolation>,
    /// Trace memory of the unit's engines, oldest first.
    pub trace: Vec<TraceEntry>,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "unit {}: {:?}", self.unit, self.kinds)?;
        for (d, e) in &self.timeouts {
            writeln!(f, "  timeout {:?}: {}", d, e)?;
        }
        for v in &self.violations {
            let owner = v.feature.map(|f| f.to_string()).unwrap_or_else(|| "?".to_string());
            writeln!(
                f,
                "  counter {:>2} ({}): value {} previous {} violations {}",
                v.counter, owner, v.report.value, v.report.previous, v.report.violations
            )?;
        }
        if !self.trace.is_empty() {
            writeln!(f, "  {} trace entries", self.trace.len())?;
        }
        Ok(())
    }
}

fn counter_kind(feature: Option<Feature>, report: &CounterReport) -> ErrorKind {
    match feature {
        Some(Feature::Histogram) => ErrorKind::HISTOGRAM,
        Some(Feature::Trap) => ErrorKind::TRAP,
        Some(Feature::Track) if report.underflow => ErrorKind::TRACK_UNDERFLOW,
        Some(Feature::Track) => ErrorKind::TRACK_OVERFLOW,
        Some(Feature::Timeout) => ErrorKind::TIMEOUT,
        None => ErrorKind::UNKNOWN,
    }
}

impl Pmdt {
    /// Services the first pending matrix cause.
    ///
    /// The matrix names the unit; the unit's counter bank names the counters
    /// and monitor causes. Causes are cleared only once the report is built,
    /// and only for the bits read, so a cause raised meanwhile stays pending.
    /// A failed call leaves every cause in place for the next one.
    ///
    /// # Returns
    ///
    /// The unit's [`ErrorReport`], or `Ok(None)` when nothing is pending or
    /// the cause belongs to a unit that is not configured; such a cause is
    /// cleared and logged.
    pub fn service_interrupt(&self) -> Result<Option<ErrorReport>> {
        let cctm_intc = self.cctm().interrupts();
        let Some((group, bit)) = cctm_intc.first_pending() else {
            return Ok(None);
        };
        let cctm_bit = group * 32 + bit;
        let clear_cause = || cctm_intc.clear(group, 1 << bit);

        let Some(record) = self.map().by_cctm_bit(cctm_bit).and_then(|d| self.unit(d.id)) else {
            log::warn!("dropping interrupt for unconfigured cctm bit {}", cctm_bit);
            clear_cause();
            return Ok(None);
        };
        let id = record.desc.id;
        let alloc = &record.allocation;
        let hw = self.hw(id)?;
        let unit_intc = hw.bank.interrupts();
        let events = unit_intc.pending(pmu::INT_GROUP_EVENT);
        let status = unit_intc.pending(pmu::INT_GROUP_MONITOR);
        log::debug!("unit {}: events {:#x} status {:#x}", id, events, status);

        let mut kinds = ErrorKind::empty();
        let mut timeouts = Vec::new();
        for b in bits_of(status as u64) {
            let (monitor, cause) = MonitorCause::decode(b);
            match cause {
                MonitorCause::Timeout => {
                    kinds |= ErrorKind::TIMEOUT;
                    let log = hw.monitor(monitor)?.read_log();
                    if let (Some(d), Some(entry)) = (alloc.direction_of(monitor), log.last_timeout) {
                        timeouts.push((d, entry));
                    }
                }
                MonitorCause::BusError => kinds |= ErrorKind::BUS_ERROR,
                // Reported per counter below.
                MonitorCause::Overflow | MonitorCause::Underflow => {}
            }
        }

        let mut violations = Vec::new();
        for c in bits_of(events as u64) {
            let report = hw.bank.status_retry(c, STATUS_ATTEMPTS)?;
            let feature = alloc.owner_of(c).map(|f| f.feature);
            kinds |= counter_kind(feature, &report);
            violations.push(CounterViolation {
                counter: c,
                feature,
                report,
            });
        }
        if kinds.is_empty() {
            kinds = ErrorKind::UNKNOWN;
        }

        // Freeze trace memory before reading it.
        let mut trace = Vec::new();
        for &e in alloc.elas.keys() {
            let engine = hw.ela(e)?;
            engine.write_lock(false);
            engine.stop()?;
            trace.extend(engine.dump()?);
        }

        unit_intc.clear(pmu::INT_GROUP_EVENT, events);
        unit_intc.clear(pmu::INT_GROUP_MONITOR, status);
        clear_cause();
        log::info!("unit {} ({}) reported {:?}", id, record.desc.name, kinds);
        Ok(Some(ErrorReport {
            unit: id,
            kinds,
            timeouts,
            violations,
            trace,
        }))
    }
}
