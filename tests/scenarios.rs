use std::sync::Arc;

use pretty_assertions::assert_eq;

use pmdt_tools::libs::axi_monitor::Tracker;
use pmdt_tools::libs::cctm::CrossLine;
use pmdt_tools::libs::config::{
    DirectionReq, Feature, HistogramFeature, TimeoutFeature, TrackerPattern, TrapFeature, UnitRequest,
};
use pmdt_tools::libs::error::PmdtError;
use pmdt_tools::libs::isr::ErrorKind;
use pmdt_tools::libs::pmdt::Pmdt;
use pmdt_tools::libs::regs::{Direction, LogMode};
use pmdt_tools::libs::revision::{RevisionTag, TriggerSource};
use pmdt_tools::libs::sim::{demo_map, SimComplex, SimUnitSpec, Transaction};

fn complex(tag: RevisionTag, units: u8, spec: SimUnitSpec) -> (Arc<SimComplex>, Pmdt) {
    let map = demo_map(tag, units);
    let sim = SimComplex::new(&map, spec);
    let pmdt = Pmdt::new(map, sim.clone());
    (sim, pmdt)
}

fn histogram(direction: DirectionReq) -> HistogramFeature {
    HistogramFeature {
        direction,
        bars_ns: [0, 100, 200, 300, 400],
        window_us: None,
        bin_limits: [None; 5],
    }
}

fn trap(address: u64, trace: bool) -> UnitRequest {
    UnitRequest {
        trap: Some(TrapFeature {
            direction: DirectionReq::Read,
            pattern: TrackerPattern {
                address,
                address_mask: !0xFF,
                id: None,
            },
            trace,
        }),
        ..Default::default()
    }
}

#[test]
fn tracker_matches_exact_address_only() {
    let (sim, pmdt) = complex(RevisionTag::RevA, 1, SimUnitSpec::default());
    pmdt.cctm().enable(1, true);
    let hw = pmdt.hw(0).unwrap();
    let mon = &hw.monitors[0];
    mon.configure_mode(Direction::Read, LogMode::FullTransaction, false);
    mon.configure_tracker(0, Tracker::new(0xFFFF_FFF0, 0x1000 << 4)).unwrap();
    mon.enable(true);

    sim.inject(0, 0, &Transaction::read(0x1000, 10));
    assert_eq!(mon.tracker_hits(0).unwrap(), 1);
    sim.inject(0, 0, &Transaction::read(0x1001, 10));
    assert_eq!(mon.tracker_hits(0).unwrap(), 1);
}

#[test]
fn latency_150_lands_in_bin_2() {
    let (sim, mut pmdt) = complex(RevisionTag::RevB, 1, SimUnitSpec::default());
    let req = UnitRequest {
        histogram: Some(histogram(DirectionReq::Read)),
        ..Default::default()
    };
    let alloc = pmdt.configure_unit(0, req).unwrap().clone();
    sim.inject(0, 0, &Transaction::read(0x40, 150));

    let hw = pmdt.hw(0).unwrap();
    assert_eq!(hw.monitors[0].read_bin_counts(), [0, 0, 1, 0, 0, 0]);
    let bins = &alloc.features[0].counters;
    let values: Vec<u64> = bins
        .iter()
        .map(|&c| pmdt.counter_report(0, c).unwrap().value)
        .collect();
    assert_eq!(values, vec![0, 0, 1, 0, 0]);
}

#[test]
fn timeout_only_request_gets_one_residual_counter() {
    let spec = SimUnitSpec {
        monitors: 1,
        elas: 1,
        ..Default::default()
    };
    let (_, mut pmdt) = complex(RevisionTag::RevA, 1, spec);
    let req = UnitRequest {
        timeout: Some(TimeoutFeature {
            direction: DirectionReq::Read,
            timeout_ns: 2_000,
        }),
        ..Default::default()
    };
    let alloc = pmdt.configure_unit(0, req).unwrap().clone();
    assert!(pmdt.is_ready(0));
    assert_eq!(alloc.counters_used(), 1);

    let hw = pmdt.hw(0).unwrap();
    let counter = alloc.features[0].counters[0];
    let trigger = hw.bank.config(counter).unwrap().trigger;
    assert_eq!(
        hw.bank.decode_trigger(trigger),
        Some(TriggerSource::LatencyBin { monitor: 0, bin: 0 })
    );
    assert!(hw.monitors[0].is_enabled());
    assert_eq!(hw.monitors[0].bars().1, Some(2_000));
}

#[test]
fn both_direction_histogram_on_single_monitor_unit_fails() {
    let spec = SimUnitSpec {
        monitors: 1,
        ..Default::default()
    };
    let (_, mut pmdt) = complex(RevisionTag::RevB, 1, spec);
    let req = UnitRequest {
        histogram: Some(histogram(DirectionReq::Both)),
        ..Default::default()
    };
    let err = pmdt.configure_unit(0, req).unwrap_err();
    assert!(matches!(err, PmdtError::InsufficientResources { .. }));
    assert!(!pmdt.is_ready(0));
    assert!(pmdt.unit(0).is_none());
}

#[test]
fn wrapped_trace_is_reported_oldest_first() {
    let (sim, mut pmdt) = complex(RevisionTag::RevB, 1, SimUnitSpec::default());
    pmdt.configure_unit(0, trap(0x1000, true)).unwrap();
    let depth = pmdt.hw(0).unwrap().elas[0].depth() as u64;

    let extra = 10;
    for i in 0..depth + extra {
        sim.inject(0, 0, &Transaction::read(0x1000 + (i % 64) * 4, 30).with_id(i as u16));
    }
    let report = pmdt.service_interrupt().unwrap().unwrap();
    assert!(report.kinds.contains(ErrorKind::TRAP));
    assert_eq!(report.trace.len() as u64, depth);
    let ids: Vec<u64> = report.trace.iter().map(|e| (e.payload >> 40) as u64).collect();
    let expected: Vec<u64> = (extra..depth + extra).collect();
    assert_eq!(ids, expected);
}

#[test]
fn cross_pause_follows_only_enabled_sources() {
    let (sim, mut pmdt) = complex(RevisionTag::RevA, 3, SimUnitSpec::default());
    for unit in 0..3 {
        pmdt.configure_unit(unit, trap(0x2000, false)).unwrap();
    }
    // Unit 0 follows unit 1, not unit 2.
    pmdt.cctm().cross_pause_enable(0, 0b010, true).unwrap();
    assert_eq!(pmdt.cctm().row(CrossLine::Pause, 0).unwrap(), 0b011);

    sim.inject(2, 0, &Transaction::read(0x2000, 10));
    assert_eq!(pmdt.cctm().pause_state() & 0b111, 0b100);

    sim.inject(1, 0, &Transaction::read(0x2000, 10));
    assert_eq!(pmdt.cctm().pause_state() & 0b111, 0b111);
}

#[test]
fn histogram_bin_limit_reports_owning_feature() {
    let (sim, mut pmdt) = complex(RevisionTag::RevB, 2, SimUnitSpec::default());
    let mut h = histogram(DirectionReq::Write);
    h.bin_limits[4] = Some(2);
    let alloc = pmdt
        .configure_unit(
            1,
            UnitRequest {
                histogram: Some(h),
                ..Default::default()
            },
        )
        .unwrap()
        .clone();
    let slow_bin = alloc.features[0].counters[4];

    sim.inject(1, 1, &Transaction::write(0x80, 1_000));
    assert_eq!(pmdt.service_interrupt().unwrap(), None);
    sim.inject(1, 1, &Transaction::write(0x80, 1_000));

    let report = pmdt.service_interrupt().unwrap().unwrap();
    assert_eq!(report.unit, 1);
    assert_eq!(report.kinds, ErrorKind::HISTOGRAM);
    assert_eq!(report.violations.len(), 1);
    assert_eq!(report.violations[0].counter, slow_bin);
    assert_eq!(report.violations[0].feature, Some(Feature::Histogram));
    assert_eq!(report.violations[0].report.value, 2);

    // Violation froze the unit.
    assert_eq!(pmdt.cctm().pause_state() & 0b10, 0b10);
    pmdt.rearm_unit(1).unwrap();
    assert_eq!(pmdt.cctm().pause_state() & 0b10, 0);
}
