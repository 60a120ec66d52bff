use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::libs::axi_monitor::{BusMonitor, TraceFields, Tracker};
use crate::libs::common::{ns_to_cycles, us_to_cycles};
use crate::libs::ela::{Action, TraceEngine, TriggerStateConfig};
use crate::libs::error::{invalid, out_of_range, PmdtError, Result};
use crate::libs::pmu::{CounterBank, CounterConfig, UnitCaps};
use crate::libs::regs::{axim, pmu, Direction, LogMode, MonitorCause, NextState};
use crate::libs::revision::TriggerSource;

/// Direction a feature watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionReq {
    Read,
    Write,
    Both,
}

impl DirectionReq {
    pub fn directions(self) -> Vec<Direction> {
        match self {
            DirectionReq::Read => vec![Direction::Read],
            DirectionReq::Write => vec![Direction::Write],
            DirectionReq::Both => vec![Direction::Read, Direction::Write],
        }
    }
}

/// Address/id pattern matched by a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerPattern {
    pub address: u64,
    /// Address bits that must agree with `address`.
    pub address_mask: u64,
    pub id: Option<u16>,
}

impl TrackerPattern {
    pub fn tracker(&self) -> Tracker {
        let t = Tracker::for_address(self.address, self.address_mask);
        match self.id {
            Some(id) => t.with_id(id),
            None => t,
        }
    }
}

/// Flag transactions that stay outstanding longer than `timeout_ns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutFeature {
    pub direction: DirectionReq,
    pub timeout_ns: u64,
}

/// Sort transactions into five latency bins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramFeature {
    pub direction: DirectionReq,
    /// Bin boundaries in nanoseconds, non-decreasing.
    pub bars_ns: [u64; 5],
    /// Evaluate bin limits once per window instead of continuously.
    pub window_us: Option<u64>,
    /// Per-bin hit count at which the bin raises a violation.
    pub bin_limits: [Option<u64>; 5],
}

/// Raise a violation on the first transaction matching `pattern`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapFeature {
    pub direction: DirectionReq,
    pub pattern: TrackerPattern,
    /// Capture matching transactions in a trace engine, frozen by the
    /// violation.
    pub trace: bool,
}

/// Keep the number of matching transactions per window within bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackFeature {
    pub direction: DirectionReq,
    pub pattern: TrackerPattern,
    pub window_us: u64,
    pub low: u64,
    pub high: u64,
    pub trace: bool,
}

/// Features requested for one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitRequest {
    pub timeout: Option<TimeoutFeature>,
    pub histogram: Option<HistogramFeature>,
    pub trap: Option<TrapFeature>,
    pub track: Option<TrackFeature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    Timeout,
    Histogram,
    Trap,
    Track,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Feature::Timeout => "timeout",
            Feature::Histogram => "histogram",
            Feature::Trap => "trap",
            Feature::Track => "track",
        };
        write!(f, "{}", name)
    }
}

/// Resources one feature received on one monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureAlloc {
    pub feature: Feature,
    pub direction: Direction,
    pub monitor: u8,
    /// Counters in trigger order; for histograms index `i` counts bin `i`.
    pub counters: Vec<u8>,
    pub tracker: Option<u8>,
    pub ela: Option<u8>,
}

/// Result of [`plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub monitors: BTreeMap<Direction, u8>,
    /// Trace engine to the monitor feeding it.
    pub elas: BTreeMap<u8, u8>,
    pub features: Vec<FeatureAlloc>,
    /// Shared window of the counter bank, in microseconds.
    pub window_us: Option<u64>,
}

impl Allocation {
    pub fn counter_mask(&self) -> u32 {
        self.features
            .iter()
            .flat_map(|f| f.counters.iter())
            .fold(0, |m, &c| m | 1 << c)
    }

    pub fn counters_used(&self) -> usize {
        self.features.iter().map(|f| f.counters.len()).sum()
    }

    /// Feature owning `counter`, if any.
    pub fn owner_of(&self, counter: u8) -> Option<&FeatureAlloc> {
        self.features.iter().find(|f| f.counters.contains(&counter))
    }

    pub fn monitor_of(&self, direction: Direction) -> Option<u8> {
        self.monitors.get(&direction).copied()
    }

    pub fn direction_of(&self, monitor: u8) -> Option<Direction> {
        self.monitors
            .iter()
            .find(|(_, &m)| m == monitor)
            .map(|(d, _)| *d)
    }

    pub fn ela_of(&self, monitor: u8) -> Option<u8> {
        self.elas.iter().find(|(_, &m)| m == monitor).map(|(e, _)| *e)
    }

    fn features_on(&self, monitor: u8) -> impl Iterator<Item = &FeatureAlloc> {
        self.features.iter().filter(move |f| f.monitor == monitor)
    }
}

impl fmt::Display for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (d, m) in &self.monitors {
            writeln!(f, "monitor {} watches {:?}", m, d)?;
        }
        for fa in &self.features {
            write!(f, "{:<9} {:?} monitor {} counters {:?}", fa.feature, fa.direction, fa.monitor, fa.counters)?;
            if let Some(t) = fa.tracker {
                write!(f, " tracker {}", t)?;
            }
            if let Some(e) = fa.ela {
                write!(f, " trace engine {}", e)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

fn insufficient(resource: &'static str, requested: usize, available: usize) -> PmdtError {
    PmdtError::InsufficientResources {
        resource,
        requested,
        available,
    }
}

/// Assigns hardware resources to the features of `request`.
///
/// Monitors, trace engines, trackers and event counters are handed out, and
/// the returned [`Allocation`] records which resource serves which feature
/// so a firing counter can be mapped back to its feature. [`program`] then
/// writes the plan to hardware.
///
/// # Parameters
///
/// - `request`: `&UnitRequest` - Features wanted on the unit.
/// - `caps`: `&UnitCaps` - What the unit implements, from its capabilities
///   register.
///
/// # Returns
///
/// The allocation. Nothing is written to hardware.
///
/// # Errors
///
/// - [`PmdtError::InsufficientResources`] when a feature needs more monitors,
///   trace engines, trackers or counters than `caps` reports.
/// - [`PmdtError::DirectionConflict`] when the features together need both
///   directions of a single-monitor unit.
/// - [`PmdtError::InvalidField`] for an empty request or clashing windows.
pub fn plan(request: &UnitRequest, caps: &UnitCaps) -> Result<Allocation> {
    let mut wanted: Vec<(Feature, DirectionReq, bool)> = Vec::new();
    if let Some(h) = &request.histogram {
        wanted.push((Feature::Histogram, h.direction, false));
    }
    if let Some(t) = &request.trap {
        wanted.push((Feature::Trap, t.direction, t.trace));
    }
    if let Some(t) = &request.track {
        wanted.push((Feature::Track, t.direction, t.trace));
    }
    if let Some(t) = &request.timeout {
        wanted.push((Feature::Timeout, t.direction, false));
    }
    if wanted.is_empty() {
        return Err(invalid("request", "no feature requested"));
    }

    // Monitors and trace engines each feature needs on its own.
    for (feature, dir, traced) in &wanted {
        let need = dir.directions().len();
        if need > caps.monitors as usize {
            log::debug!("{} needs {} monitors", feature, need);
            return Err(insufficient("bus monitors", need, caps.monitors as usize));
        }
        if *traced && need > caps.elas as usize {
            return Err(insufficient("trace engines", need, caps.elas as usize));
        }
    }

    // Directions across features.
    let dirs: BTreeSet<Direction> = wanted
        .iter()
        .flat_map(|(_, d, _)| d.directions())
        .collect();
    if dirs.len() > caps.monitors as usize {
        return Err(PmdtError::DirectionConflict(format!(
            "features watch {:?} but the unit has {} monitor",
            dirs, caps.monitors
        )));
    }
    let monitors: BTreeMap<Direction, u8> = if caps.monitors >= 2 {
        dirs.iter()
            .map(|&d| (d, if d == Direction::Read { 0 } else { 1 }))
            .collect()
    } else {
        dirs.iter().map(|&d| (d, 0)).collect()
    };

    let window_us = match (
        request.histogram.and_then(|h| h.window_us),
        request.track.map(|t| t.window_us),
    ) {
        (Some(a), Some(b)) if a != b => {
            return Err(invalid(
                "window",
                format!("histogram window {}us and track window {}us share one counter bank", a, b),
            ))
        }
        (Some(0), _) | (_, Some(0)) => return Err(invalid("window", "window must be non-zero")),
        (a, b) => a.or(b),
    };

    // Counters in priority order: histogram bins, trap, track, residual.
    let mut planner = Planner {
        caps,
        monitors: &monitors,
        next_counter: 0,
        trackers: BTreeMap::new(),
        elas: BTreeMap::new(),
        features: Vec::new(),
    };
    if let Some(h) = &request.histogram {
        planner.add(Feature::Histogram, h.direction, axim::NUM_BARS as u8, false, false)?;
    }
    if let Some(t) = &request.trap {
        planner.add(Feature::Trap, t.direction, 1, true, t.trace)?;
    }
    if let Some(t) = &request.track {
        planner.add(Feature::Track, t.direction, 1, true, t.trace)?;
    }
    if let Some(t) = &request.timeout {
        // A timeout-only monitor still needs one counter so it is enabled.
        let driven: BTreeSet<u8> = planner.features.iter().map(|f| f.monitor).collect();
        for d in t.direction.directions() {
            let monitor = monitors[&d];
            let counters = if driven.contains(&monitor) {
                vec![]
            } else {
                planner.take(1)?
            };
            planner.features.push(FeatureAlloc {
                feature: Feature::Timeout,
                direction: d,
                monitor,
                counters,
                tracker: None,
                ela: None,
            });
        }
    }
    let Planner { features, elas, .. } = planner;

    let alloc = Allocation {
        monitors,
        elas,
        features,
        window_us,
    };
    log::debug!("planned {} counters on {} monitors", alloc.counters_used(), alloc.monitors.len());
    Ok(alloc)
}

struct Planner<'a> {
    caps: &'a UnitCaps,
    monitors: &'a BTreeMap<Direction, u8>,
    next_counter: u8,
    trackers: BTreeMap<u8, u8>,
    elas: BTreeMap<u8, u8>,
    features: Vec<FeatureAlloc>,
}

impl Planner<'_> {
    fn take(&mut self, n: u8) -> Result<Vec<u8>> {
        let end = self.next_counter as usize + n as usize;
        if end > self.caps.counters as usize {
            return Err(insufficient("event counters", end, self.caps.counters as usize));
        }
        let ids = (self.next_counter..self.next_counter + n).collect();
        self.next_counter += n;
        Ok(ids)
    }

    fn take_tracker(&mut self, monitor: u8) -> Result<u8> {
        let used = self.trackers.entry(monitor).or_insert(0);
        if *used >= self.caps.trackers {
            return Err(insufficient("trackers", *used as usize + 1, self.caps.trackers as usize));
        }
        *used += 1;
        Ok(*used - 1)
    }

    /// Engine tracing `monitor`, bound from the free pool on first use.
    fn take_ela(&mut self, monitor: u8) -> Result<u8> {
        if let Some((&e, _)) = self.elas.iter().find(|(_, &m)| m == monitor) {
            return Ok(e);
        }
        let e = self.elas.len() as u8;
        if e >= self.caps.elas {
            return Err(insufficient("trace engines", e as usize + 1, self.caps.elas as usize));
        }
        self.elas.insert(e, monitor);
        Ok(e)
    }

    fn add(&mut self, feature: Feature, dir: DirectionReq, counters: u8, tracked: bool, trace: bool) -> Result<()> {
        for d in dir.directions() {
            let monitor = self.monitors[&d];
            let tracker = if tracked {
                Some(self.take_tracker(monitor)?)
            } else {
                None
            };
            let ela = if trace { Some(self.take_ela(monitor)?) } else { None };
            let counters = self.take(counters)?;
            self.features.push(FeatureAlloc {
                feature,
                direction: d,
                monitor,
                counters,
                tracker,
                ela,
            });
        }
        Ok(())
    }
}

/// Driver handles for every sub-block of one unit.
pub struct UnitHw {
    pub bank: CounterBank,
    pub monitors: Vec<BusMonitor>,
    pub elas: Vec<TraceEngine>,
}

impl UnitHw {
    pub fn monitor(&self, index: u8) -> Result<&BusMonitor> {
        self.monitors
            .get(index as usize)
            .ok_or_else(|| out_of_range("bus monitor", index as usize, self.monitors.len()))
    }

    pub fn ela(&self, index: u8) -> Result<&TraceEngine> {
        self.elas
            .get(index as usize)
            .ok_or_else(|| out_of_range("trace engine", index as usize, self.elas.len()))
    }
}

fn cycles_u32(ns: u64, clock_hz: u64, field: &'static str) -> Result<u32> {
    let cycles = ns_to_cycles(ns, clock_hz);
    u32::try_from(cycles).map_err(|_| invalid(field, format!("{}ns is {} cycles, beyond 32 bits", ns, cycles)))
}

/// Writes `alloc` to the unit. Counters, monitors and trace engines are left
/// running; interrupt masks are opened for every allocated cause.
///
/// # Parameters
///
/// - `hw`: `&UnitHw` - Driver handles of the unit.
/// - `request`: `&UnitRequest` - The request `alloc` was planned from.
/// - `alloc`: `&Allocation` - Result of [`plan`] for `request`.
/// - `clock_hz`: `u64` - Unit clock, used to turn nanoseconds and
///   microseconds into cycles.
pub fn program(hw: &UnitHw, request: &UnitRequest, alloc: &Allocation, clock_hz: u64) -> Result<()> {
    let bank = &hw.bank;
    let mask = alloc.counter_mask();
    bank.enable(mask, false)?;

    if let Some(us) = alloc.window_us {
        let granted = bank.set_window(us_to_cycles(us, clock_hz))?;
        log::debug!("window {}us -> {} cycles", us, granted);
    }

    let timeout_cycles = match &request.timeout {
        Some(t) => Some(cycles_u32(t.timeout_ns, clock_hz, "timeout")?).filter(|&c| c != 0),
        None => None,
    };

    for mon in &hw.monitors {
        mon.disable_trace_channels()?;
    }

    let mut monitor_causes: BTreeMap<u8, u32> = BTreeMap::new();
    for (&direction, &m) in &alloc.monitors {
        let mon = hw.monitor(m)?;
        mon.enable(false);
        mon.configure_mode(direction, LogMode::FullTransaction, false);

        let timeout = alloc
            .features_on(m)
            .any(|f| f.feature == Feature::Timeout)
            .then_some(timeout_cycles)
            .flatten();
        let bars = match &request.histogram {
            Some(h) if alloc.features_on(m).any(|f| f.feature == Feature::Histogram) => {
                let mut bars = [0u32; axim::NUM_BARS];
                for (b, ns) in bars.iter_mut().zip(h.bars_ns.iter()) {
                    *b = cycles_u32(*ns, clock_hz, "latency bars")?;
                }
                bars
            }
            // Without a histogram every non-stale transaction lands in bin 0.
            _ => [timeout.unwrap_or(u32::MAX); axim::NUM_BARS],
        };
        mon.configure_bars(bars, timeout)?;
        for t in 0..axim::MAX_TRACKERS.min(bank.caps().trackers) {
            mon.disable_tracker(t)?;
        }
        mon.clear()?;

        let causes = monitor_causes.entry(m).or_insert(0);
        if timeout.is_some() {
            *causes |= 1 << MonitorCause::Timeout.bit(m);
        }
    }

    let mut trace_trackers: BTreeMap<u8, u8> = BTreeMap::new();
    for fa in &alloc.features {
        let mon = hw.monitor(fa.monitor)?;
        let m = fa.monitor;
        let causes = monitor_causes.entry(m).or_insert(0);
        match fa.feature {
            Feature::Histogram => {
                let Some(h) = &request.histogram else { continue };
                for (bin, &c) in fa.counters.iter().enumerate() {
                    let trigger = bank.trigger_for(TriggerSource::LatencyBin { monitor: m, bin: bin as u8 })?;
                    bank.configure(
                        c,
                        &CounterConfig {
                            trigger,
                            window_enable: h.window_us.is_some(),
                            pause_enable: true,
                            low: 0,
                            high: h.bin_limits[bin].unwrap_or(u64::MAX),
                        },
                    )?;
                }
                *causes |= 1 << MonitorCause::Overflow.bit(m);
            }
            Feature::Trap | Feature::Track => {
                let (pattern, window, low, high) = match (fa.feature, &request.trap, &request.track) {
                    (Feature::Trap, Some(t), _) => (t.pattern, false, 0, 1),
                    (Feature::Track, _, Some(t)) => (t.pattern, true, t.low, t.high),
                    _ => continue,
                };
                let Some(tracker) = fa.tracker else { continue };
                mon.configure_tracker(tracker, pattern.tracker())?;
                let trigger = bank.trigger_for(TriggerSource::TrackerMatch { monitor: m, tracker })?;
                for &c in &fa.counters {
                    bank.configure(
                        c,
                        &CounterConfig {
                            trigger,
                            window_enable: window,
                            pause_enable: true,
                            low,
                            high,
                        },
                    )?;
                }
                *causes |= 1 << MonitorCause::Overflow.bit(m);
                if fa.feature == Feature::Track {
                    *causes |= 1 << MonitorCause::Underflow.bit(m);
                } else {
                    *causes |= 1 << MonitorCause::BusError.bit(m);
                }
                if fa.ela.is_some() {
                    *trace_trackers.entry(m).or_insert(0) |= 1 << tracker;
                }
            }
            Feature::Timeout => {
                for &c in &fa.counters {
                    let trigger = bank.trigger_for(TriggerSource::LatencyBin { monitor: m, bin: 0 })?;
                    bank.configure(
                        c,
                        &CounterConfig {
                            trigger,
                            window_enable: false,
                            pause_enable: false,
                            low: 0,
                            high: u64::MAX,
                        },
                    )?;
                }
            }
        }
    }

    for (&e, &m) in &alloc.elas {
        let engine = hw.ela(e)?;
        engine.write_lock(false);
        engine.stop()?;
        engine.configure(0, 0, 0, Action::default())?;
        engine.configure_state(
            0,
            &TriggerStateConfig {
                next: NextState::State(0),
                action: Action::TRACE,
                ..Default::default()
            },
        )?;
        engine.ram_reset()?;
        // Channel `e` of the monitor feeds engine `e`.
        let trackers = trace_trackers.get(&m).copied().unwrap_or(0);
        let width = hw
            .monitor(m)?
            .configure_trace(e, trackers, TraceFields::ADDRESS | TraceFields::ID)?;
        log::debug!("trace engine {} on monitor {}: {} bit entries", e, m, width.bits);
    }

    bank.clear(mask)?;
    let intc = bank.interrupts();
    intc.clear(pmu::INT_GROUP_EVENT, u32::MAX);
    intc.clear(pmu::INT_GROUP_MONITOR, u32::MAX);
    intc.set_mask(pmu::INT_GROUP_EVENT, mask, false);
    let status_mask = monitor_causes.values().fold(0, |a, b| a | b);
    intc.set_mask(pmu::INT_GROUP_MONITOR, status_mask, false);

    bank.enable(mask, true)?;
    for &m in alloc.monitors.values() {
        hw.monitor(m)?.enable(true);
    }
    for &e in alloc.elas.keys() {
        let engine = hw.ela(e)?;
        engine.start()?;
        engine.write_lock(true);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn caps(monitors: u8, elas: u8, counters: u8) -> UnitCaps {
        UnitCaps {
            counters,
            monitors,
            elas,
            ram_addr_bits: 6,
            trackers: 4,
        }
    }

    fn pattern() -> TrackerPattern {
        TrackerPattern {
            address: 0x1000,
            address_mask: !0xF,
            id: None,
        }
    }

    fn histogram(direction: DirectionReq) -> HistogramFeature {
        HistogramFeature {
            direction,
            bars_ns: [0, 100, 200, 300, 400],
            window_us: None,
            bin_limits: [None; 5],
        }
    }

    #[test]
    fn timeout_only_gets_one_residual_counter() {
        let req = UnitRequest {
            timeout: Some(TimeoutFeature {
                direction: DirectionReq::Read,
                timeout_ns: 1000,
            }),
            ..Default::default()
        };
        let alloc = plan(&req, &caps(1, 0, 8)).unwrap();
        assert_eq!(alloc.counters_used(), 1);
        assert_eq!(
            alloc.features,
            vec![FeatureAlloc {
                feature: Feature::Timeout,
                direction: Direction::Read,
                monitor: 0,
                counters: vec![0],
                tracker: None,
                ela: None,
            }]
        );
    }

    #[test]
    fn timeout_shares_monitor_with_histogram() {
        let req = UnitRequest {
            timeout: Some(TimeoutFeature {
                direction: DirectionReq::Read,
                timeout_ns: 1000,
            }),
            histogram: Some(histogram(DirectionReq::Read)),
            ..Default::default()
        };
        let alloc = plan(&req, &caps(2, 0, 8)).unwrap();
        assert_eq!(alloc.counters_used(), 5);
        assert_eq!(alloc.owner_of(4).unwrap().feature, Feature::Histogram);
    }

    #[test]
    fn counters_follow_priority_order() {
        let req = UnitRequest {
            histogram: Some(histogram(DirectionReq::Write)),
            trap: Some(TrapFeature {
                direction: DirectionReq::Write,
                pattern: pattern(),
                trace: false,
            }),
            track: Some(TrackFeature {
                direction: DirectionReq::Read,
                pattern: pattern(),
                window_us: 10,
                low: 1,
                high: 100,
                trace: false,
            }),
            ..Default::default()
        };
        let alloc = plan(&req, &caps(2, 0, 8)).unwrap();
        let order: Vec<(Feature, Vec<u8>)> = alloc
            .features
            .iter()
            .map(|f| (f.feature, f.counters.clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                (Feature::Histogram, vec![0, 1, 2, 3, 4]),
                (Feature::Trap, vec![5]),
                (Feature::Track, vec![6]),
            ]
        );
        assert_eq!(alloc.monitor_of(Direction::Read), Some(0));
        assert_eq!(alloc.monitor_of(Direction::Write), Some(1));
        assert_eq!(alloc.window_us, Some(10));
    }

    #[test]
    fn both_directions_on_one_monitor_is_insufficient() {
        let req = UnitRequest {
            histogram: Some(histogram(DirectionReq::Both)),
            ..Default::default()
        };
        let err = plan(&req, &caps(1, 0, 32)).unwrap_err();
        assert!(matches!(
            err,
            PmdtError::InsufficientResources {
                resource: "bus monitors",
                requested: 2,
                available: 1
            }
        ));
        assert!(err.is_configuration());
    }

    #[test]
    fn mixed_directions_conflict_on_one_monitor() {
        let req = UnitRequest {
            histogram: Some(histogram(DirectionReq::Read)),
            timeout: Some(TimeoutFeature {
                direction: DirectionReq::Write,
                timeout_ns: 50,
            }),
            ..Default::default()
        };
        assert!(matches!(plan(&req, &caps(1, 0, 32)), Err(PmdtError::DirectionConflict(_))));
        assert!(plan(&req, &caps(2, 0, 32)).is_ok());
    }

    #[rstest]
    #[case(4, true)]
    #[case(5, false)]
    fn histogram_needs_five_counters(#[case] counters: u8, #[case] fails: bool) {
        let req = UnitRequest {
            histogram: Some(histogram(DirectionReq::Read)),
            ..Default::default()
        };
        assert_eq!(plan(&req, &caps(1, 0, counters)).is_err(), fails);
    }

    #[test]
    fn one_traced_direction_takes_the_first_free_engine() {
        let req = UnitRequest {
            trap: Some(TrapFeature {
                direction: DirectionReq::Write,
                pattern: pattern(),
                trace: true,
            }),
            ..Default::default()
        };
        let alloc = plan(&req, &caps(2, 1, 8)).unwrap();
        assert_eq!(alloc.monitor_of(Direction::Write), Some(1));
        assert_eq!(alloc.elas, BTreeMap::from([(0, 1)]));
        assert_eq!(alloc.features[0].ela, Some(0));
        assert_eq!(alloc.ela_of(1), Some(0));
        assert_eq!(alloc.ela_of(0), None);

        assert!(matches!(
            plan(&req, &caps(2, 0, 8)),
            Err(PmdtError::InsufficientResources {
                resource: "trace engines",
                requested: 1,
                available: 0
            })
        ));
    }

    #[rstest]
    #[case::one_feature_both_directions(DirectionReq::Both, DirectionReq::Both)]
    #[case::two_features_apart(DirectionReq::Read, DirectionReq::Write)]
    fn two_traced_directions_need_two_engines(#[case] trap: DirectionReq, #[case] track: DirectionReq) {
        let req = UnitRequest {
            trap: Some(TrapFeature {
                direction: trap,
                pattern: pattern(),
                trace: true,
            }),
            track: Some(TrackFeature {
                direction: track,
                pattern: pattern(),
                window_us: 10,
                low: 0,
                high: 10,
                trace: true,
            }),
            ..Default::default()
        };
        assert!(matches!(
            plan(&req, &caps(2, 1, 8)),
            Err(PmdtError::InsufficientResources {
                resource: "trace engines",
                requested: 2,
                available: 1
            })
        ));
        let alloc = plan(&req, &caps(2, 2, 8)).unwrap();
        assert_eq!(alloc.elas.len(), 2);
    }

    #[test]
    fn features_on_one_monitor_share_its_engine() {
        let req = UnitRequest {
            trap: Some(TrapFeature {
                direction: DirectionReq::Read,
                pattern: pattern(),
                trace: true,
            }),
            track: Some(TrackFeature {
                direction: DirectionReq::Read,
                pattern: pattern(),
                window_us: 10,
                low: 0,
                high: 10,
                trace: true,
            }),
            ..Default::default()
        };
        let alloc = plan(&req, &caps(1, 1, 8)).unwrap();
        assert_eq!(alloc.elas, BTreeMap::from([(0, 0)]));
        assert!(alloc.features.iter().all(|f| f.ela == Some(0)));
    }

    #[test]
    fn windows_must_agree() {
        let req = UnitRequest {
            histogram: Some(HistogramFeature {
                window_us: Some(5),
                ..histogram(DirectionReq::Read)
            }),
            track: Some(TrackFeature {
                direction: DirectionReq::Read,
                pattern: pattern(),
                window_us: 10,
                low: 0,
                high: 10,
                trace: false,
            }),
            ..Default::default()
        };
        assert!(matches!(plan(&req, &caps(1, 0, 32)), Err(PmdtError::InvalidField { .. })));
    }

    #[test]
    fn empty_request_is_rejected() {
        assert!(plan(&UnitRequest::default(), &caps(2, 2, 32)).is_err());
    }
}
