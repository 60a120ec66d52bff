use std::collections::BTreeMap;
use std::sync::Arc;

use crate::libs::axi_monitor::BusMonitor;
use crate::libs::cctm::CrossTriggerMatrix;
use crate::libs::common::mask_of;
use crate::libs::config::{self, Allocation, UnitHw, UnitRequest};
use crate::libs::ela::TraceEngine;
use crate::libs::error::{PmdtError, Result};
use crate::libs::pmu::{CounterBank, CounterReport};
use crate::libs::regs::{pmu, RegisterSurface};
use crate::libs::revision::{revision, HwRevision};
use crate::libs::unit_map::{UnitDesc, UnitMap};

/// Attempts made when a counter read races a window boundary.
pub(crate) const STATUS_ATTEMPTS: usize = 4;

/// A configured unit.
#[derive(Debug, Clone)]
pub struct UnitRecord {
    pub desc: UnitDesc,
    pub request: UnitRequest,
    pub allocation: Allocation,
}

/// One complex: its register surface, revision, unit map and matrix.
/// A unit is ready only while it has a [`UnitRecord`].
pub struct Pmdt {
    regs: Arc<dyn RegisterSurface>,
    rev: Arc<dyn HwRevision>,
    map: UnitMap,
    cctm: CrossTriggerMatrix,
    units: BTreeMap<u8, UnitRecord>,
}

impl Pmdt {
    pub fn new(map: UnitMap, regs: Arc<dyn RegisterSurface>) -> Self {
        let rev = revision(map.revision);
        let cctm = CrossTriggerMatrix::new(regs.clone(), map.cctm_base);
        log::debug!("pmdt complex {} with {} units", map.revision, map.len());
        Pmdt {
            regs,
            rev,
            map,
            cctm,
            units: BTreeMap::new(),
        }
    }

    pub fn revision(&self) -> &dyn HwRevision {
        self.rev.as_ref()
    }

    pub fn map(&self) -> &UnitMap {
        &self.map
    }

    pub fn cctm(&self) -> &CrossTriggerMatrix {
        &self.cctm
    }

    pub fn unit(&self, id: u8) -> Option<&UnitRecord> {
        self.units.get(&id)
    }

    pub fn units(&self) -> impl Iterator<Item = &UnitRecord> {
        self.units.values()
    }

    pub fn is_ready(&self, id: u8) -> bool {
        self.units.contains_key(&id)
    }

    /// Driver handles for every sub-block the unit reports in its
    /// capabilities register.
    pub fn hw(&self, id: u8) -> Result<UnitHw> {
        let desc = self.map.get(id)?;
        Ok(self.hw_for(desc))
    }

    fn hw_for(&self, desc: &UnitDesc) -> UnitHw {
        let bank = CounterBank::new(self.regs.clone(), self.rev.clone(), desc.base);
        let caps = bank.caps();
        let monitors = (0..caps.monitors)
            .map(|i| BusMonitor::new(self.regs.clone(), self.rev.clone(), desc.base, i))
            .collect();
        let elas = (0..caps.elas)
            .map(|i| TraceEngine::new(self.regs.clone(), self.rev.clone(), desc.base, i, caps.ram_addr_bits))
            .collect();
        UnitHw { bank, monitors, elas }
    }

    /// Plans and programs `request` on unit `id`. A unit that was already
    /// configured is torn down first. On any failure the unit is left
    /// disabled and not ready.
    pub fn configure_unit(&mut self, id: u8, request: UnitRequest) -> Result<&Allocation> {
        let desc = self.map.get(id)?.clone();
        if self.units.contains_key(&id) {
            self.disable_unit(id)?;
        }
        let hw = self.hw_for(&desc);
        let allocation = config::plan(&request, &hw.bank.caps()).map_err(|e| {
            log::warn!("unit {} ({}): {}", id, desc.name, e);
            e
        })?;

        let programmed = config::program(&hw, &request, &allocation, desc.clock_hz)
            .and_then(|()| self.wire_matrix(desc.cctm_bit));
        if let Err(e) = programmed {
            log::warn!("unit {} ({}): {}, tearing down", id, desc.name, e);
            self.teardown(&hw, desc.cctm_bit);
            return Err(e);
        }

        log::info!("unit {} ({}) ready, {} counters", id, desc.name, allocation.counters_used());
        let record = UnitRecord {
            desc,
            request,
            allocation,
        };
        Ok(&self.units.entry(id).or_insert(record).allocation)
    }

    /// Self-pause row, interrupt cause and enable line of one unit.
    fn wire_matrix(&self, bit: u8) -> Result<()> {
        let unit = mask_of([bit]);
        self.cctm.clear_rows(bit)?;
        self.cctm.cross_pause_enable(bit, unit, true)?;
        self.cctm.pause(unit, false);
        self.cctm.clear(unit);
        let intc = self.cctm.interrupts();
        intc.clear(bit / 32, 1 << (bit % 32));
        intc.set_mask(bit / 32, 1 << (bit % 32), false);
        self.cctm.enable(unit, true);
        Ok(())
    }

    fn teardown(&self, hw: &UnitHw, bit: u8) {
        for e in &hw.elas {
            e.write_lock(false);
            if let Err(err) = e.stop() {
                log::warn!("trace engine {}: {}", e.index(), err);
            }
        }
        if let Err(err) = hw.bank.enable(hw.bank.caps().all_counters(), false) {
            log::warn!("counter bank: {}", err);
        }
        for m in &hw.monitors {
            m.enable(false);
        }
        let intc = hw.bank.interrupts();
        for group in [pmu::INT_GROUP_EVENT, pmu::INT_GROUP_MONITOR] {
            intc.set_mask(group, u32::MAX, true);
            intc.clear(group, u32::MAX);
        }

        let unit = mask_of([bit]);
        self.cctm.enable(unit, false);
        self.cctm.pause(unit, false);
        let cause = self.cctm.interrupts();
        cause.set_mask(bit / 32, 1 << (bit % 32), true);
        cause.clear(bit / 32, 1 << (bit % 32));
        if let Err(err) = self.cctm.clear_rows(bit) {
            log::warn!("cctm rows of bit {}: {}", bit, err);
        }
    }

    /// Stops and masks everything the unit drives and forgets its record.
    pub fn disable_unit(&mut self, id: u8) -> Result<()> {
        let desc = self.map.get(id)?.clone();
        let hw = self.hw_for(&desc);
        self.teardown(&hw, desc.cctm_bit);
        if self.units.remove(&id).is_some() {
            log::info!("unit {} ({}) disabled", id, desc.name);
        }
        Ok(())
    }

    /// Re-arms a unit after a violation: releases its pause, clears the
    /// latched counter state and restarts its trace engines.
    pub fn rearm_unit(&self, id: u8) -> Result<()> {
        let record = self.units.get(&id).ok_or(PmdtError::NotConfigured(id))?;
        let hw = self.hw_for(&record.desc);
        let bit = record.desc.cctm_bit;
        let mask = record.allocation.counter_mask();

        for &e in record.allocation.elas.keys() {
            let engine = hw.ela(e)?;
            engine.write_lock(false);
            engine.stop()?;
            engine.ram_reset()?;
        }
        hw.bank.enable(mask, false)?;
        hw.bank.clear(mask)?;
        for &m in record.allocation.monitors.values() {
            hw.monitor(m)?.clear()?;
        }
        self.cctm.clear(mask_of([bit]));
        self.cctm.pause(mask_of([bit]), false);
        hw.bank.enable(mask, true)?;
        for &e in record.allocation.elas.keys() {
            let engine = hw.ela(e)?;
            engine.start()?;
            engine.write_lock(true);
        }
        log::debug!("unit {} re-armed", id);
        Ok(())
    }

    /// Counter report of one unit, retried across window boundaries.
    pub fn counter_report(&self, id: u8, counter: u8) -> Result<CounterReport> {
        let hw = self.hw(id)?;
        hw.bank.status_retry(counter, STATUS_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::config::{DirectionReq, HistogramFeature, TimeoutFeature, TrackerPattern, TrapFeature};
    use crate::libs::revision::RevisionTag;
    use crate::libs::sim::{demo_map, SimComplex, SimUnitSpec, Transaction};

    fn rig(spec: SimUnitSpec) -> (Arc<SimComplex>, Pmdt) {
        let map = demo_map(RevisionTag::RevB, 3);
        let sim = SimComplex::new(&map, spec);
        let pmdt = Pmdt::new(map, sim.clone());
        (sim, pmdt)
    }

    fn trap_request() -> UnitRequest {
        UnitRequest {
            trap: Some(TrapFeature {
                direction: DirectionReq::Read,
                pattern: TrackerPattern {
                    address: 0x1000,
                    address_mask: !0xF,
                    id: None,
                },
                trace: true,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn configured_unit_is_ready_and_wired() {
        let (_, mut pmdt) = rig(SimUnitSpec::default());
        let alloc = pmdt.configure_unit(1, trap_request()).unwrap().clone();
        assert!(pmdt.is_ready(1));
        assert!(!pmdt.is_ready(0));
        assert_eq!(alloc.counter_mask(), 0b1);
        assert_eq!(pmdt.cctm().enabled(), 0b10);
        assert_eq!(
            pmdt.cctm().row(crate::libs::cctm::CrossLine::Pause, 1).unwrap(),
            0b10
        );
        let hw = pmdt.hw(1).unwrap();
        assert!(hw.elas[0].is_running());
        assert!(hw.elas[0].is_locked());
    }

    #[test]
    fn failed_configuration_leaves_unit_down() {
        let (_, mut pmdt) = rig(SimUnitSpec {
            monitors: 1,
            ..Default::default()
        });
        let req = UnitRequest {
            histogram: Some(HistogramFeature {
                direction: DirectionReq::Both,
                bars_ns: [0, 100, 200, 300, 400],
                window_us: None,
                bin_limits: [None; 5],
            }),
            ..Default::default()
        };
        assert!(pmdt.configure_unit(0, req).is_err());
        assert!(!pmdt.is_ready(0));
        assert_eq!(pmdt.cctm().enabled(), 0);
    }

    #[test]
    fn bars_beyond_timeout_abort_programming() {
        let (_, mut pmdt) = rig(SimUnitSpec::default());
        let req = UnitRequest {
            timeout: Some(TimeoutFeature {
                direction: DirectionReq::Read,
                timeout_ns: 300,
            }),
            histogram: Some(HistogramFeature {
                direction: DirectionReq::Read,
                bars_ns: [0, 100, 200, 300, 400],
                window_us: None,
                bin_limits: [None; 5],
            }),
            ..Default::default()
        };
        let err = pmdt.configure_unit(2, req).unwrap_err();
        assert!(matches!(err, PmdtError::InvalidField { .. }));
        assert!(!pmdt.is_ready(2));
        assert_eq!(pmdt.hw(2).unwrap().bank.enabled(), 0);
    }

    #[test]
    fn disable_and_rearm() {
        let (sim, mut pmdt) = rig(SimUnitSpec::default());
        pmdt.configure_unit(0, trap_request()).unwrap();
        sim.inject(0, 0, &Transaction::read(0x1004, 10));
        assert_eq!(pmdt.cctm().pause_state() & 1, 1);
        assert!(pmdt.counter_report(0, 0).unwrap().overflow);

        pmdt.rearm_unit(0).unwrap();
        assert_eq!(pmdt.cctm().pause_state() & 1, 0);
        let report = pmdt.counter_report(0, 0).unwrap();
        assert!(!report.overflow);
        assert_eq!(report.value, 0);

        pmdt.disable_unit(0).unwrap();
        assert!(!pmdt.is_ready(0));
        assert_eq!(pmdt.cctm().enabled(), 0);
        assert!(matches!(pmdt.rearm_unit(0), Err(PmdtError::NotConfigured(0))));
    }

    #[test]
    fn reconfiguration_drops_stale_trace_routes() {
        let (_, mut pmdt) = rig(SimUnitSpec {
            elas: 1,
            ..Default::default()
        });
        pmdt.configure_unit(0, trap_request()).unwrap();
        let hw = pmdt.hw(0).unwrap();
        assert_eq!(hw.monitors[0].trace_selection(0).unwrap(), 0b1);

        let mut write = trap_request();
        if let Some(t) = write.trap.as_mut() {
            t.direction = DirectionReq::Write;
        }
        let alloc = pmdt.configure_unit(0, write).unwrap().clone();
        assert_eq!(alloc.elas, BTreeMap::from([(0, 1)]));
        assert_eq!(hw.monitors[0].trace_selection(0).unwrap(), 0);
        assert_eq!(hw.monitors[1].trace_selection(0).unwrap(), 0b1);
    }

    #[test]
    fn unknown_unit_is_rejected() {
        let (_, mut pmdt) = rig(SimUnitSpec::default());
        assert!(matches!(
            pmdt.configure_unit(9, trap_request()),
            Err(PmdtError::UnknownUnit(9))
        ));
    }
}
