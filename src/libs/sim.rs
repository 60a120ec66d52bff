use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::libs::axi_monitor::{classify_latency, TraceFields, Tracker, TxnFields};
use crate::libs::common::bits_of;
use crate::libs::ela::TraceEntry;
use crate::libs::regs::{
    axim, cctm, ela, intc, pmu, u128_of_words, words_of_u128, ActionBits, CompareOp,
    CounterCfg, CounterStatus, Direction, ElaCtrl, ElaInit, ElaStatus, LogMeta, MonitorCause,
    MonitorCtrl, MonitorStatus, NextState, PmuCaps, RamWritePtr, RegisterSurface, StateNext,
    TraceChannelCfg, TrackerCtrl, TrigCtrl, TsCtrl, TsRatio, WindowCfg,
};
use crate::libs::revision::{revision, HwRevision, RevisionTag, TriggerSource};
use crate::libs::unit_map::{UnitDesc, UnitMap};

/// Address space reserved for one unit.
pub const UNIT_SPAN: u64 = 0x2_0000;
pub const DEMO_UNIT_BASE: u64 = 0x0010_0000;
pub const DEMO_CCTM_BASE: u64 = 0x00F0_0000;

const MONITOR_SPAN: u64 = 0x200;
const PMU_SPAN: u64 = pmu::COUNTER_BASE + 32 * pmu::COUNTER_STRIDE;
const CCTM_SPAN: u64 = cctm::ROW_BASE + cctm::MAX_UNITS as u64 * cctm::ROW_STRIDE;
const PMU_INT_GROUPS: u8 = 2;

/// Resources every simulated unit implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimUnitSpec {
    pub counters: u8,
    pub monitors: u8,
    pub elas: u8,
    pub ram_addr_bits: u8,
    pub trackers: u8,
}

impl Default for SimUnitSpec {
    fn default() -> Self {
        SimUnitSpec {
            counters: 8,
            monitors: 2,
            elas: 2,
            ram_addr_bits: 6,
            trackers: 4,
        }
    }
}

/// A unit map of `units` evenly spaced units at 1 GHz, unit `i` owning
/// cross-trigger bit `i`.
pub fn demo_map(tag: RevisionTag, units: u8) -> UnitMap {
    let mut map = UnitMap::new(tag, DEMO_CCTM_BASE);
    for id in 0..units.min(cctm::MAX_UNITS) {
        let desc = UnitDesc {
            id,
            name: format!("unit{}", id),
            base: DEMO_UNIT_BASE + id as u64 * UNIT_SPAN,
            bus: "noc0".to_string(),
            clock_hz: 1_000_000_000,
            cctm_bit: id,
        };
        if let Err(e) = map.add(desc) {
            log::warn!("demo map: {}", e);
        }
    }
    map
}

/// One bus transaction presented to a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    pub direction: Direction,
    pub address: u64,
    pub id: u16,
    /// Latency of the phase the monitor measures, in cycles.
    pub latency: u64,
    pub prot: u8,
    pub cache: u8,
    pub attributes: u8,
    pub data: u64,
    pub byte_count: u8,
    pub outstanding: u8,
    pub user: u8,
    /// Completed with an error response.
    pub bus_error: bool,
}

impl Transaction {
    fn new(direction: Direction, address: u64, latency: u64) -> Self {
        Transaction {
            direction,
            address,
            id: 0,
            latency,
            prot: 0,
            cache: 0,
            attributes: 0,
            data: 0,
            byte_count: 4,
            outstanding: 1,
            user: 0,
            bus_error: false,
        }
    }

    pub fn read(address: u64, latency: u64) -> Self {
        Self::new(Direction::Read, address, latency)
    }

    pub fn write(address: u64, latency: u64) -> Self {
        Self::new(Direction::Write, address, latency)
    }

    pub fn with_id(mut self, id: u16) -> Self {
        self.id = id;
        self
    }

    pub fn with_data(mut self, data: u64) -> Self {
        self.data = data;
        self
    }

    pub fn with_bus_error(mut self) -> Self {
        self.bus_error = true;
        self
    }

    fn fields(&self) -> TxnFields {
        TxnFields {
            address: self.address,
            id: self.id,
            prot: self.prot,
            cache: self.cache,
        }
    }

    /// Packs the selected fields, least significant first, in the order the
    /// monitor serializes them. Bits past 128 are dropped.
    fn serialize(&self, fields: TraceFields, rev: &dyn HwRevision) -> u128 {
        let mut out = 0u128;
        let mut pos = 0u32;
        for (flag, value, width) in [
            (TraceFields::ADDRESS, self.address, rev.trace_address_bits()),
            (TraceFields::ID, self.id as u64, rev.trace_id_bits()),
            (TraceFields::ATTRIBUTES, self.attributes as u64, 7),
            (TraceFields::BYTE_COUNT, self.byte_count as u64, 8),
            (TraceFields::OUTSTANDING, self.outstanding as u64, 8),
            (TraceFields::USER, self.user as u64, 8),
            (TraceFields::DATA, self.data, 64),
        ] {
            if !fields.contains(flag) || pos >= 128 {
                continue;
            }
            let masked = if width >= 64 {
                value
            } else {
                value & ((1u64 << width) - 1)
            };
            out |= (masked as u128) << pos;
            pos += width;
        }
        out
    }
}

struct UnitSlot {
    id: u8,
    base: u64,
    bit: u8,
}

enum Region {
    Pmu(usize, u64),
    Monitor(u64),
    Ela(usize, u8, u64),
    Cctm(u64),
    Plain,
}

struct SimState {
    rev: Arc<dyn HwRevision>,
    spec: SimUnitSpec,
    cctm_base: u64,
    units: Vec<UnitSlot>,
    regs: HashMap<u64, u32>,
    window_elapsed: Vec<u64>,
    /// Pause state latched at the last window boundary, per unit.
    window_pause: Vec<u32>,
    ts_frac: u64,
    ela_since_ts: HashMap<(usize, u8), u32>,
    ela_outputs: HashMap<(usize, u8), u8>,
}

/// Behavioral model of a complex behind a [`RegisterSurface`].
///
/// Reproduces what the hardware does on its own: counting, window
/// boundaries, violation latching, interrupt causes, cross-trigger
/// propagation, timestamps and trace capture. Traffic comes in through
/// [`SimComplex::inject`], [`SimComplex::ela_signal`] and
/// [`SimComplex::reset_event`]; time advances with [`SimComplex::tick`].
pub struct SimComplex {
    state: Mutex<SimState>,
}

impl SimComplex {
    pub fn new(map: &UnitMap, spec: SimUnitSpec) -> Arc<Self> {
        let rev = revision(map.revision);
        let spec = SimUnitSpec {
            counters: spec.counters.clamp(1, 32),
            monitors: spec.monitors.min(2),
            elas: spec.elas.min(2),
            ram_addr_bits: spec.ram_addr_bits.min(rev.max_ram_addr_bits()),
            trackers: spec.trackers.min(axim::MAX_TRACKERS),
        };
        let units: Vec<UnitSlot> = map
            .units()
            .map(|u| UnitSlot {
                id: u.id,
                base: u.base,
                bit: u.cctm_bit,
            })
            .collect();
        let n = units.len();
        let mut state = SimState {
            rev,
            spec,
            cctm_base: map.cctm_base,
            units,
            regs: HashMap::new(),
            window_elapsed: vec![0; n],
            window_pause: vec![0; n],
            ts_frac: 0,
            ela_since_ts: HashMap::new(),
            ela_outputs: HashMap::new(),
        };
        state.reset();
        Arc::new(SimComplex {
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Presents `txn` to monitor `monitor` of unit `unit`.
    pub fn inject(&self, unit: u8, monitor: u8, txn: &Transaction) {
        self.lock().inject(unit, monitor, txn);
    }

    /// Advances every clock in the complex by `cycles`.
    pub fn tick(&self, cycles: u64) {
        self.lock().tick(cycles);
    }

    /// Drives signal group `group` of a trace engine for one evaluation.
    pub fn ela_signal(&self, unit: u8, engine: u8, group: u32, signals: u128, ext: u32) {
        let mut s = self.lock();
        if let Some(slot) = s.slot_of(unit) {
            if engine < s.spec.elas && s.get(s.ela_base(slot, engine) + ela::GROUP_SEL) == group {
                s.ela_evaluate(slot, engine, signals, ext);
            }
        }
    }

    /// Asserts or de-asserts the reset line watched by state S4.
    pub fn reset_event(&self, unit: u8, engine: u8, asserted: bool) {
        self.lock().reset_event(unit, engine, asserted);
    }

    pub fn set_busy_level(&self, unit: u8, monitor: u8, level: u8) {
        let mut s = self.lock();
        if let Some(slot) = s.slot_of(unit) {
            let addr = s.monitor_base(slot, monitor) + axim::STATUS;
            let mut st = MonitorStatus(s.get(addr));
            st.set_busy_level(level as u32);
            s.set(addr, st.0);
        }
    }

    /// Output lines (bits 3..0) and clock-stop request (bit 4) last driven by
    /// a trace engine.
    pub fn ela_outputs(&self, unit: u8, engine: u8) -> u8 {
        let s = self.lock();
        s.slot_of(unit)
            .and_then(|slot| s.ela_outputs.get(&(slot, engine)).copied())
            .unwrap_or(0)
    }
}

impl RegisterSurface for SimComplex {
    fn read32(&self, addr: u64) -> u32 {
        self.lock().read(addr)
    }

    fn write32(&self, addr: u64, val: u32) {
        self.lock().write(addr, val)
    }
}

impl SimState {
    fn reset(&mut self) {
        let mut caps = PmuCaps(0);
        caps.set_counters(self.spec.counters as u32);
        caps.set_monitors(self.spec.monitors as u32);
        caps.set_elas(self.spec.elas as u32);
        caps.set_ram_addr_bits(self.spec.ram_addr_bits as u32);
        caps.set_trackers(self.spec.trackers as u32);

        for slot in 0..self.units.len() {
            let pb = self.pmu_base(slot);
            self.set(pb + pmu::CAPS, caps.0);
            for g in 0..PMU_INT_GROUPS {
                self.set(intc::reg(pb + pmu::INTC, g, intc::MASK), u32::MAX);
            }
        }
        for g in 0..cctm::INT_GROUPS {
            self.set(intc::reg(self.cctm_base + cctm::INTC, g, intc::MASK), u32::MAX);
        }
        let mut ratio = TsRatio(0);
        ratio.set_numerator(1);
        ratio.set_denominator(1);
        self.set(self.cctm_base + cctm::TS_RATIO, ratio.0);
    }

    // Register file

    fn get(&self, addr: u64) -> u32 {
        self.regs.get(&addr).copied().unwrap_or(0)
    }

    fn set(&mut self, addr: u64, val: u32) {
        self.regs.insert(addr, val);
    }

    fn get64(&self, addr: u64) -> u64 {
        self.get(addr) as u64 | (self.get(addr + 4) as u64) << 32
    }

    fn set64(&mut self, addr: u64, val: u64) {
        self.set(addr, val as u32);
        self.set(addr + 4, (val >> 32) as u32);
    }

    fn get128(&self, addr: u64) -> u128 {
        u128_of_words([self.get(addr), self.get(addr + 4), self.get(addr + 8), self.get(addr + 12)])
    }

    fn bump(&mut self, addr: u64) {
        let v = self.get(addr).wrapping_add(1);
        self.set(addr, v);
    }

    // Topology

    fn slot_of(&self, unit: u8) -> Option<usize> {
        self.units.iter().position(|u| u.id == unit)
    }

    fn slot_of_bit(&self, bit: u8) -> Option<usize> {
        self.units.iter().position(|u| u.bit == bit)
    }

    fn pmu_base(&self, slot: usize) -> u64 {
        self.units[slot].base + self.rev.pmu_offset()
    }

    fn monitor_base(&self, slot: usize, monitor: u8) -> u64 {
        self.units[slot].base + self.rev.monitor_offset(monitor)
    }

    fn ela_base(&self, slot: usize, engine: u8) -> u64 {
        self.units[slot].base + self.rev.ela_offset(engine)
    }

    fn depth(&self) -> u32 {
        1 << self.spec.ram_addr_bits
    }

    fn region(&self, addr: u64) -> Region {
        if addr >= self.cctm_base && addr < self.cctm_base + CCTM_SPAN {
            return Region::Cctm(addr - self.cctm_base);
        }
        let ela_span = ela::RAM_BASE + self.depth() as u64 * ela::RAM_STRIDE;
        for (slot, u) in self.units.iter().enumerate() {
            if addr < u.base || addr >= u.base + UNIT_SPAN {
                continue;
            }
            let off = addr - u.base;
            for m in 0..self.spec.monitors {
                let mo = self.rev.monitor_offset(m);
                if off >= mo && off < mo + MONITOR_SPAN {
                    return Region::Monitor(off - mo);
                }
            }
            for e in 0..self.spec.elas {
                let eo = self.rev.ela_offset(e);
                if off >= eo && off < eo + ela_span {
                    return Region::Ela(slot, e, off - eo);
                }
            }
            let po = self.rev.pmu_offset();
            if off >= po && off < po + PMU_SPAN {
                return Region::Pmu(slot, off - po);
            }
            return Region::Plain;
        }
        Region::Plain
    }

    // Register access with side effects

    fn read(&self, addr: u64) -> u32 {
        if let Region::Pmu(slot, off) = self.region(addr) {
            if off >= pmu::COUNTER_BASE && (off - pmu::COUNTER_BASE) % pmu::COUNTER_STRIDE == pmu::C_STATUS {
                let c = ((off - pmu::COUNTER_BASE) / pmu::COUNTER_STRIDE) as u8;
                let pb = addr - off;
                let mut st = CounterStatus(self.get(addr));
                st.set_active(self.get(pb + pmu::CNT_ENABLE) & (1 << c) != 0);
                st.set_paused(self.counter_paused(slot, c));
                return st.0;
            }
        }
        self.get(addr)
    }

    fn write(&mut self, addr: u64, val: u32) {
        match self.region(addr) {
            Region::Pmu(_, off) => self.pmu_write(addr - off, off, val),
            Region::Monitor(off) => self.monitor_write(addr - off, off, val),
            Region::Ela(slot, e, off) => self.ela_write(slot, e, off, val),
            Region::Cctm(off) => self.cctm_write(off, val),
            Region::Plain => self.set(addr, val),
        }
    }

    fn intc_write(&mut self, base: u64, rel: u64, val: u32) {
        let group = (rel / intc::GROUP_STRIDE) as u8;
        match rel % intc::GROUP_STRIDE {
            intc::CAUSE => {}
            intc::CLEAR => {
                let addr = intc::reg(base, group, intc::CAUSE);
                let cause = self.get(addr) & !val;
                self.set(addr, cause);
            }
            _ => self.set(base + rel, val),
        }
    }

    fn raise(&mut self, intc_base: u64, group: u8, bit: u8) {
        let addr = intc::reg(intc_base, group, intc::CAUSE);
        let cause = self.get(addr) | 1 << bit;
        self.set(addr, cause);
    }

    fn pmu_write(&mut self, pb: u64, off: u64, val: u32) {
        let intc_end = pmu::INTC + PMU_INT_GROUPS as u64 * intc::GROUP_STRIDE;
        match off {
            pmu::CAPS => {}
            o if o == pmu::WINDOW_COUNT || o == pmu::WINDOW_COUNT + 4 => {}
            pmu::CNT_ENABLE => {
                let rising = val & !self.get(pb + off);
                self.set(pb + off, val);
                // Re-enabling re-arms latched violations.
                for c in bits_of(rising as u64) {
                    self.set(pb + pmu::counter(c, pmu::C_STATUS), 0);
                }
            }
            pmu::CNT_CLEAR => {
                for c in bits_of(val as u64) {
                    self.clear_counter(pb, c);
                }
            }
            o if (pmu::INTC..intc_end).contains(&o) => self.intc_write(pb + pmu::INTC, o - pmu::INTC, val),
            o if o >= pmu::COUNTER_BASE => {
                let reg = (o - pmu::COUNTER_BASE) % pmu::COUNTER_STRIDE;
                if reg != pmu::C_STATUS && reg < pmu::C_VALUE {
                    self.set(pb + off, val);
                }
            }
            _ => self.set(pb + off, val),
        }
    }

    fn clear_counter(&mut self, pb: u64, c: u8) {
        self.set64(pb + pmu::counter(c, pmu::C_VALUE), 0);
        self.set64(pb + pmu::counter(c, pmu::C_PREV), 0);
        self.set(pb + pmu::counter(c, pmu::C_VIOLATIONS), 0);
        self.set(pb + pmu::counter(c, pmu::C_STATUS), 0);
    }

    fn monitor_write(&mut self, mb: u64, off: u64, val: u32) {
        let bins_end = axim::BIN_COUNT + axim::NUM_BIN_COUNTS as u64 * 4;
        match off {
            axim::CLEAR => self.monitor_clear(mb),
            axim::STATUS => {}
            o if (axim::BIN_COUNT..bins_end).contains(&o) => {}
            o if o >= axim::LOG_BASE => {}
            o if (axim::TRACKER_BASE..axim::TRACE_BASE).contains(&o)
                && (o - axim::TRACKER_BASE) % axim::TRACKER_STRIDE == axim::T_HITS => {}
            _ => self.set(mb + off, val),
        }
    }

    fn monitor_clear(&mut self, mb: u64) {
        for i in 0..axim::NUM_BIN_COUNTS {
            self.set(mb + axim::bin_count(i), 0);
        }
        for t in 0..axim::MAX_TRACKERS {
            self.set(mb + axim::tracker(t, axim::T_HITS), 0);
        }
        for slot in 0..=axim::LOG_LAST_TIMEOUT {
            self.set(mb + axim::log(slot, axim::L_LATENCY), 0);
            self.set64(mb + axim::log(slot, axim::L_ADDR), 0);
            self.set(mb + axim::log(slot, axim::L_META), 0);
        }
        let mut st = MonitorStatus(self.get(mb + axim::STATUS));
        st.set_clear_done(true);
        self.set(mb + axim::STATUS, st.0);
    }

    fn ela_write(&mut self, slot: usize, e: u8, off: u64, val: u32) {
        let eb = self.ela_base(slot, e);
        match off {
            ela::STATUS => {}
            ela::CTRL => {
                let was = ElaCtrl(self.get(eb + ela::CTRL)).run();
                let now = ElaCtrl(val).run();
                self.set(eb + ela::CTRL, val);
                if now && !was {
                    self.ela_start(slot, e);
                } else if was && !now {
                    let mut st = ElaStatus(self.get(eb + ela::STATUS));
                    st.set_running(false);
                    self.set(eb + ela::STATUS, st.0);
                }
            }
            _ => self.set(eb + off, val),
        }
    }

    fn ela_start(&mut self, slot: usize, e: u8) {
        let eb = self.ela_base(slot, e);
        let init = ElaInit(self.get(eb + ela::INIT));
        let mut st = ElaStatus(0);
        st.set_state(init.state());
        st.set_running(true);
        self.set(eb + ela::STATUS, st.0);
        self.enter_state(eb, init.state() as u8);
        self.ela_since_ts.insert((slot, e), 0);
        let action = ActionBits(init.action());
        self.ela_outputs
            .insert((slot, e), action.output() as u8 | (action.stop_clock() as u8) << 4);
    }

    fn enter_state(&mut self, eb: u64, s: u8) {
        let trig = TrigCtrl(self.get(eb + ela::state(s, ela::S_TRIG_CTRL)));
        if trig.counter_reset() {
            self.set(eb + ela::state(s, ela::S_COUNTER), 0);
        }
    }

    fn cctm_write(&mut self, off: u64, val: u32) {
        let cb = self.cctm_base;
        let intc_end = cctm::INTC + cctm::INT_GROUPS as u64 * intc::GROUP_STRIDE;
        match off {
            o if o == cctm::PAUSE || o == cctm::PAUSE + 4 => {
                self.set(cb + o, val);
                self.set(cb + cctm::PAUSE_STATE + (o - cctm::PAUSE), val);
            }
            o if o == cctm::CLEAR || o == cctm::CLEAR + 4 => {
                let shift = ((o - cctm::CLEAR) * 8) as u8;
                for b in bits_of(val as u64) {
                    self.clear_unit(b + shift);
                }
            }
            o if o == cctm::FORCE_TRIGGER || o == cctm::FORCE_TRIGGER + 4 => {
                let rising = val & !self.get(cb + o);
                self.set(cb + o, val);
                let shift = ((o - cctm::FORCE_TRIGGER) * 8) as u8;
                for b in bits_of(rising as u64) {
                    self.fire_trigger(b + shift);
                }
            }
            o if (cctm::TRIGGER_STATE..cctm::TS_CTRL).contains(&o) => {}
            cctm::TS_CLEAR => {
                let init = self.get64(cb + cctm::TS_INIT);
                self.set64(cb + cctm::TS_VALUE, init);
                self.ts_frac = 0;
            }
            o if o == cctm::TS_VALUE || o == cctm::TS_VALUE + 4 => {}
            o if (cctm::INTC..intc_end).contains(&o) => self.intc_write(cb + cctm::INTC, o - cctm::INTC, val),
            _ => self.set(cb + off, val),
        }
    }

    // Cross-trigger fabric

    fn or64(&mut self, addr: u64, bits: u64) {
        let v = self.get64(addr) | bits;
        self.set64(addr, v);
    }

    fn clear_unit(&mut self, bit: u8) {
        if let Some(slot) = self.slot_of_bit(bit) {
            let pb = self.pmu_base(slot);
            for c in 0..self.spec.counters {
                self.clear_counter(pb, c);
            }
        }
        let cb = self.cctm_base;
        for reg in [cctm::TRIGGER_STATE, cctm::GPIO_STATE] {
            let v = self.get64(cb + reg) & !(1u64 << bit);
            self.set64(cb + reg, v);
        }
    }

    fn latch_trigger(&mut self, bit: u8) {
        let cb = self.cctm_base;
        self.or64(cb + cctm::TRIGGER_STATE, 1 << bit);
        self.raise(cb + cctm::INTC, bit / 32, bit % 32);
    }

    /// Fires the trigger line of `bit` and follows the routing rows.
    fn fire_trigger(&mut self, bit: u8) {
        let cb = self.cctm_base;
        self.latch_trigger(bit);
        let mut queue = VecDeque::from([bit]);
        while let Some(src) = queue.pop_front() {
            let sbit = 1u64 << src;
            for dest in 0..cctm::MAX_UNITS {
                let row = |reg: u64| cb + cctm::row(dest, reg);
                let dbit = 1u64 << dest;
                if self.get64(row(cctm::R_PAUSE_SRC)) & sbit != 0 {
                    self.or64(cb + cctm::PAUSE, dbit);
                    self.or64(cb + cctm::PAUSE_STATE, dbit);
                }
                if self.get64(row(cctm::R_ENABLE_SRC)) & sbit != 0 {
                    self.or64(cb + cctm::ENABLE, dbit);
                }
                if self.get64(row(cctm::R_CLEAR_SRC)) & sbit != 0 {
                    self.clear_unit(dest);
                }
                if self.get64(row(cctm::R_GPIO_SRC)) & sbit != 0
                    && self.get64(cb + cctm::GPIO_ENABLE) & dbit != 0
                {
                    self.or64(cb + cctm::GPIO_STATE, dbit);
                }
                if self.get64(row(cctm::R_TRIGGER_SRC)) & sbit != 0
                    && self.get64(cb + cctm::TRIGGER_STATE) & dbit == 0
                {
                    self.latch_trigger(dest);
                    queue.push_back(dest);
                }
            }
        }
    }

    // Counting

    fn live_pause(&self, slot: usize, c: u8) -> bool {
        let pb = self.pmu_base(slot);
        let cfg = CounterCfg(self.get(pb + pmu::counter(c, pmu::C_CFG)));
        let unit_paused = self.get64(self.cctm_base + cctm::PAUSE_STATE) & (1u64 << self.units[slot].bit) != 0;
        self.get(pb + pmu::CNT_PAUSE) & (1 << c) != 0 || (cfg.pause_en() && unit_paused)
    }

    fn counter_paused(&self, slot: usize, c: u8) -> bool {
        let pb = self.pmu_base(slot);
        let cfg = CounterCfg(self.get(pb + pmu::counter(c, pmu::C_CFG)));
        if cfg.window_en() {
            self.window_pause[slot] & (1 << c) != 0
        } else {
            self.live_pause(slot, c)
        }
    }

    fn count_events(&mut self, slot: usize, events: &[u8]) {
        let pb = self.pmu_base(slot);
        let enabled = self.get(pb + pmu::CNT_ENABLE);
        for c in 0..self.spec.counters {
            if enabled & (1 << c) == 0 {
                continue;
            }
            let cfg = CounterCfg(self.get(pb + pmu::counter(c, pmu::C_CFG)));
            let n = events.iter().filter(|&&e| e as u32 == cfg.trigger()).count() as u64;
            if n == 0 || self.counter_paused(slot, c) {
                continue;
            }
            let value = self.get64(pb + pmu::counter(c, pmu::C_VALUE)) + n;
            self.set64(pb + pmu::counter(c, pmu::C_VALUE), value);
            if cfg.window_en() {
                continue;
            }
            let high = self.get64(pb + pmu::counter(c, pmu::C_THR_HIGH));
            let mut st = CounterStatus(self.get(pb + pmu::counter(c, pmu::C_STATUS)));
            if value >= high && !st.overflow() {
                st.set_overflow(true);
                st.set_any_violation(true);
                self.set(pb + pmu::counter(c, pmu::C_STATUS), st.0);
                self.bump(pb + pmu::counter(c, pmu::C_VIOLATIONS));
                self.raise_violation(slot, c, cfg.trigger() as u8, MonitorCause::Overflow);
            }
        }
    }

    fn raise_violation(&mut self, slot: usize, c: u8, trigger: u8, cause: MonitorCause) {
        let ib = self.pmu_base(slot) + pmu::INTC;
        self.raise(ib, pmu::INT_GROUP_EVENT, c);
        let monitor = match self.rev.decode_trigger(trigger) {
            Some(TriggerSource::LatencyBin { monitor, .. })
            | Some(TriggerSource::Timeout { monitor })
            | Some(TriggerSource::TrackerMatch { monitor, .. }) => Some(monitor),
            _ => None,
        };
        if let Some(m) = monitor {
            self.raise(ib, pmu::INT_GROUP_MONITOR, cause.bit(m));
        }
        let bit = self.units[slot].bit;
        self.fire_trigger(bit);
    }

    fn window_boundary(&mut self, slot: usize) {
        let pb = self.pmu_base(slot);
        let count = self.get64(pb + pmu::WINDOW_COUNT) + 1;
        self.set64(pb + pmu::WINDOW_COUNT, count);

        let enabled = self.get(pb + pmu::CNT_ENABLE);
        for c in 0..self.spec.counters {
            let cfg = CounterCfg(self.get(pb + pmu::counter(c, pmu::C_CFG)));
            if !cfg.window_en() || enabled & (1 << c) == 0 || self.window_pause[slot] & (1 << c) != 0 {
                continue;
            }
            let value = self.get64(pb + pmu::counter(c, pmu::C_VALUE));
            self.set64(pb + pmu::counter(c, pmu::C_PREV), value);
            self.set64(pb + pmu::counter(c, pmu::C_VALUE), 0);

            let high = self.get64(pb + pmu::counter(c, pmu::C_THR_HIGH));
            let low = self.get64(pb + pmu::counter(c, pmu::C_THR_LOW));
            let mut st = CounterStatus(self.get(pb + pmu::counter(c, pmu::C_STATUS)));
            let cause = if value >= high {
                st.set_overflow(true);
                Some(MonitorCause::Overflow)
            } else if value < low {
                st.set_underflow(true);
                Some(MonitorCause::Underflow)
            } else {
                None
            };
            if let Some(cause) = cause {
                st.set_any_violation(true);
                self.set(pb + pmu::counter(c, pmu::C_STATUS), st.0);
                self.bump(pb + pmu::counter(c, pmu::C_VIOLATIONS));
                self.raise_violation(slot, c, cfg.trigger() as u8, cause);
            }
        }

        let mut latched = 0u32;
        for c in 0..self.spec.counters {
            if self.live_pause(slot, c) {
                latched |= 1 << c;
            }
        }
        self.window_pause[slot] = latched;
    }

    fn tick(&mut self, cycles: u64) {
        let cb = self.cctm_base;
        let ctrl = TsCtrl(self.get(cb + cctm::TS_CTRL));
        if ctrl.enable() && !ctrl.pause() {
            let ratio = TsRatio(self.get(cb + cctm::TS_RATIO));
            let den = ratio.denominator().max(1) as u128;
            let acc = self.ts_frac as u128 + cycles as u128 * ratio.numerator() as u128;
            let value = self.get64(cb + cctm::TS_VALUE).wrapping_add((acc / den) as u64);
            self.set64(cb + cctm::TS_VALUE, value);
            self.ts_frac = (acc % den) as u64;
        }

        for slot in 0..self.units.len() {
            let cfg = WindowCfg(self.get(self.pmu_base(slot) + pmu::WINDOW_CFG));
            let window = (cfg.size() as u64) << cfg.unit_shift();
            if window == 0 {
                continue;
            }
            self.window_elapsed[slot] += cycles;
            while self.window_elapsed[slot] >= window {
                self.window_elapsed[slot] -= window;
                self.window_boundary(slot);
            }
        }
    }

    // Bus monitors

    fn write_log(&mut self, mb: u64, slot: u8, txn: &Transaction) {
        let mut meta = LogMeta(0);
        meta.set_id(txn.id as u32);
        meta.set_valid(true);
        meta.set_attributes(txn.attributes as u32);
        self.set(mb + axim::log(slot, axim::L_LATENCY), txn.latency.min(u32::MAX as u64) as u32);
        self.set64(mb + axim::log(slot, axim::L_ADDR), txn.address);
        self.set(mb + axim::log(slot, axim::L_META), meta.0);
    }

    fn inject(&mut self, unit: u8, monitor: u8, txn: &Transaction) {
        let Some(slot) = self.slot_of(unit) else {
            log::warn!("sim: no unit {}", unit);
            return;
        };
        if monitor >= self.spec.monitors {
            return;
        }
        if self.get64(self.cctm_base + cctm::ENABLE) & (1u64 << self.units[slot].bit) == 0 {
            return;
        }
        let mb = self.monitor_base(slot, monitor);
        let ctrl = MonitorCtrl(self.get(mb + axim::CTRL));
        if !ctrl.enable() || Direction::from_bit(ctrl.direction()) != txn.direction {
            return;
        }

        let mut bars = [0u32; axim::NUM_BARS];
        for (i, b) in bars.iter_mut().enumerate() {
            *b = self.get(mb + axim::bar(i));
        }
        let bin = classify_latency(&bars, txn.latency);
        self.bump(mb + axim::bin_count(bin));
        self.write_log(mb, bin as u8, txn);
        let max_valid = LogMeta(self.get(mb + axim::log(axim::LOG_MAX_LATENCY, axim::L_META))).valid();
        let max = self.get(mb + axim::log(axim::LOG_MAX_LATENCY, axim::L_LATENCY)) as u64;
        if !max_valid || txn.latency > max {
            self.write_log(mb, axim::LOG_MAX_LATENCY, txn);
        }

        let ib = self.pmu_base(slot) + pmu::INTC;
        let mut causes = Vec::new();
        let mut events = vec![self.rev.encode_trigger(TriggerSource::LatencyBin { monitor, bin: bin as u8 })];
        let timeout = self.get(mb + axim::TIMEOUT);
        if timeout != 0 && txn.latency > timeout as u64 {
            self.bump(mb + axim::bin_count(axim::NUM_BIN_COUNTS - 1));
            self.write_log(mb, axim::LOG_LAST_TIMEOUT, txn);
            causes.push(MonitorCause::Timeout);
            events.push(self.rev.encode_trigger(TriggerSource::Timeout { monitor }));
        }
        if txn.bus_error {
            causes.push(MonitorCause::BusError);
        }
        // Unmasked monitor-level causes also drive the unit's trigger line.
        let mut fire = false;
        for cause in causes {
            let bit = cause.bit(monitor);
            self.raise(ib, pmu::INT_GROUP_MONITOR, bit);
            fire |= self.get(intc::reg(ib, pmu::INT_GROUP_MONITOR, intc::MASK)) & (1 << bit) == 0;
        }

        let vector = txn.fields().vector();
        let mut hits = 0u8;
        for t in 0..self.spec.trackers {
            if !TrackerCtrl(self.get(mb + axim::tracker(t, axim::T_CTRL))).enable() {
                continue;
            }
            let tracker = Tracker::new(
                self.get64(mb + axim::tracker(t, axim::T_MASK)),
                self.get64(mb + axim::tracker(t, axim::T_COMPARE)),
            );
            if tracker.matches(vector) {
                self.bump(mb + axim::tracker(t, axim::T_HITS));
                hits |= 1 << t;
                events.push(self.rev.encode_trigger(TriggerSource::TrackerMatch { monitor, tracker: t }));
            }
        }

        let events: Vec<u8> = events.into_iter().flatten().collect();
        self.count_events(slot, &events);
        if fire {
            let bit = self.units[slot].bit;
            self.fire_trigger(bit);
        }
        if hits != 0 {
            self.forward_trace(slot, mb, hits, txn);
        }
    }

    /// Hands a tracked transaction to every trace engine whose channel
    /// selects one of the hit trackers. Channel `n` feeds engine `n`.
    fn forward_trace(&mut self, slot: usize, mb: u64, hits: u8, txn: &Transaction) {
        let rev = self.rev.clone();
        for ch in 0..axim::TRACE_CHANNELS.min(self.spec.elas) {
            let cfg = TraceChannelCfg(self.get(mb + axim::trace_channel(ch)));
            if cfg.enable() && (cfg.trackers() as u8) & hits != 0 {
                let payload = txn.serialize(TraceFields::from_bits_truncate(cfg.fields()), rev.as_ref());
                self.ela_evaluate(slot, ch, payload, hits as u32);
            }
        }
    }

    // Trace engines

    fn ela_evaluate(&mut self, slot: usize, e: u8, signals: u128, ext: u32) {
        let eb = self.ela_base(slot, e);
        let mut st = ElaStatus(self.get(eb + ela::STATUS));
        if !st.running() || st.final_state() {
            return;
        }
        let s = st.state() as u8;
        let reg = |r: u64| eb + ela::state(s, r);

        let trig = TrigCtrl(self.get(reg(ela::S_TRIG_CTRL)));
        let op = CompareOp::from_raw(trig.op());
        let mask = self.get128(reg(ela::S_SIG_MASK));
        let compare = self.get128(reg(ela::S_SIG_COMPARE));
        let primary = if trig.counter_mode() {
            let target = self.get(reg(ela::S_CNT_COMPARE));
            let mut counter = self.get(reg(ela::S_COUNTER));
            let held = trig.counter_break() && op.apply(counter, target);
            if (signals & mask) == (compare & mask) && !held {
                counter = counter.wrapping_add(1);
                self.set(reg(ela::S_COUNTER), counter);
            }
            op.apply(counter, target)
        } else {
            op.apply(signals & mask, compare & mask)
        };
        let ext_mask = self.get(reg(ela::S_EXT_MASK));
        let alternate = ext_mask != 0 && (ext & ext_mask) == (self.get(reg(ela::S_EXT_COMPARE)) & ext_mask);

        let next = StateNext(self.get(reg(ela::S_NEXT)));
        let (action, successor) = if primary {
            (ActionBits(self.get(reg(ela::S_ACTION))), next.next())
        } else if alternate {
            (ActionBits(self.get(reg(ela::S_ALT_ACTION))), next.alt_next())
        } else {
            return;
        };

        if trig.counter_clear() {
            self.set(reg(ela::S_COUNTER), 0);
        }
        if action.trace() {
            self.capture(
                slot,
                e,
                TraceEntry {
                    state: s,
                    counter_select: trig.counter_select() as u8,
                    payload: signals,
                    ..Default::default()
                },
            );
        }
        self.ela_outputs
            .insert((slot, e), action.output() as u8 | (action.stop_clock() as u8) << 4);

        match NextState::from_raw(successor) {
            NextState::State(n) if n < self.rev.ela_states() => {
                st.set_state(n as u32);
                self.set(eb + ela::STATUS, st.0);
                if n != s {
                    self.enter_state(eb, n);
                }
            }
            _ => {
                st.set_final_state(true);
                self.set(eb + ela::STATUS, st.0);
            }
        }
    }

    fn store_entry(&mut self, eb: u64, entry: &TraceEntry) {
        let depth = self.depth();
        let ptr = RamWritePtr(self.get(eb + ela::RAM_WPTR));
        let index = ptr.ptr() % depth;
        self.set(eb + ela::ram(index, ela::E_HEADER), entry.header());
        for (i, w) in words_of_u128(entry.payload).iter().enumerate() {
            self.set(eb + ela::ram(index, ela::E_PAYLOAD) + i as u64 * 4, *w);
        }
        let mut next = RamWritePtr(0);
        next.set_ptr((index + 1) % depth);
        next.set_wrap(ptr.wrap() || index + 1 == depth);
        self.set(eb + ela::RAM_WPTR, next.0);
    }

    fn capture(&mut self, slot: usize, e: u8, entry: TraceEntry) {
        let eb = self.ela_base(slot, e);
        let bits = self.rev.payload_bits();
        let payload_mask = if bits >= 128 { u128::MAX } else { (1u128 << bits) - 1 };
        self.store_entry(
            eb,
            &TraceEntry {
                payload: entry.payload & payload_mask,
                ..entry
            },
        );

        let interval = self.get(eb + ela::TS_CTRL);
        if interval == 0 {
            return;
        }
        let due = {
            let since = self.ela_since_ts.entry((slot, e)).or_insert(0);
            *since += 1;
            if *since >= interval {
                *since = 0;
                true
            } else {
                false
            }
        };
        if due {
            let ts = self.get64(self.cctm_base + cctm::TS_VALUE);
            self.store_entry(
                eb,
                &TraceEntry {
                    state: entry.state,
                    timestamp: true,
                    payload: ts as u128,
                    ..Default::default()
                },
            );
        }
    }

    fn reset_event(&mut self, unit: u8, e: u8, asserted: bool) {
        let Some(slot) = self.slot_of(unit) else {
            return;
        };
        if self.rev.ela_states() <= ela::RESET_STATE || e >= self.spec.elas {
            return;
        }
        let eb = self.ela_base(slot, e);
        if !ElaStatus(self.get(eb + ela::STATUS)).running() {
            return;
        }
        if !ActionBits(self.get(eb + ela::state(ela::RESET_STATE, ela::S_ACTION))).trace() {
            return;
        }
        let ts = self.get64(self.cctm_base + cctm::TS_VALUE);
        self.store_entry(
            eb,
            &TraceEntry {
                state: ela::RESET_STATE,
                timestamp: true,
                s4_override: true,
                payload: (ts as u128) << 1 | asserted as u128,
                ..Default::default()
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::axi_monitor::BusMonitor;
    use crate::libs::cctm::{CrossLine, CrossTriggerMatrix};
    use crate::libs::ela::{Action, TraceEngine, TriggerStateConfig};
    use crate::libs::pmu::{CounterBank, CounterConfig};
    use crate::libs::regs::LogMode;

    fn bin4_counter(bank: &CounterBank, id: u8, window: bool, high: u64) {
        let trigger = bank
            .trigger_for(TriggerSource::LatencyBin { monitor: 0, bin: 4 })
            .unwrap();
        bank.configure(
            id,
            &CounterConfig {
                trigger,
                window_enable: window,
                pause_enable: true,
                low: 0,
                high,
            },
        )
        .unwrap();
        bank.enable(1 << id, true).unwrap();
    }

    #[test]
    fn caps_reflect_spec_and_revision_limits() {
        let map = demo_map(RevisionTag::RevA, 1);
        let spec = SimUnitSpec {
            ram_addr_bits: 12,
            ..Default::default()
        };
        let sim = SimComplex::new(&map, spec);
        let bank = CounterBank::new(sim.clone(), revision(RevisionTag::RevA), map.get(0).unwrap().base);
        assert_eq!(bank.caps().ram_addr_bits, 7);
        assert_eq!(bank.caps().counters, 8);
    }

    #[test]
    fn interrupt_masks_start_masked() {
        let map = demo_map(RevisionTag::RevA, 1);
        let sim = SimComplex::new(&map, SimUnitSpec::default());
        let bank = CounterBank::new(sim.clone(), revision(RevisionTag::RevA), map.get(0).unwrap().base);
        assert_eq!(bank.interrupts().mask(0), u32::MAX);
    }

    #[test]
    fn windowed_pause_waits_for_boundary() {
        let map = demo_map(RevisionTag::RevA, 1);
        let sim = SimComplex::new(&map, SimUnitSpec::default());
        let rev = revision(RevisionTag::RevA);
        let base = map.get(0).unwrap().base;
        CrossTriggerMatrix::new(sim.clone(), map.cctm_base).enable(1, true);
        let mon = BusMonitor::new(sim.clone(), rev.clone(), base, 0);
        mon.enable(true);
        let bank = CounterBank::new(sim.clone(), rev, base);
        bin4_counter(&bank, 0, true, 100);
        bank.set_window(10).unwrap();

        bank.pause(1, true).unwrap();
        sim.inject(0, 0, &Transaction::read(0, 1));
        assert_eq!(bank.status(0).unwrap().value, 1);

        sim.tick(10);
        sim.inject(0, 0, &Transaction::read(0, 1));
        let st = bank.status(0).unwrap();
        assert!(st.paused);
        assert_eq!((st.value, st.previous), (0, 1));
    }

    #[test]
    fn trigger_rows_chain_across_units() {
        let map = demo_map(RevisionTag::RevB, 3);
        let sim = SimComplex::new(&map, SimUnitSpec::default());
        let cctm = CrossTriggerMatrix::new(sim.clone(), map.cctm_base);
        cctm.set_row(CrossLine::Trigger, 1, 0b001, true).unwrap();
        cctm.set_row(CrossLine::Pause, 2, 0b010, true).unwrap();
        cctm.force_trigger(0b001, true);
        assert_eq!(cctm.triggers(), 0b011);
        assert_eq!(cctm.pause_state(), 0b100);
        assert_eq!(cctm.interrupts().cause(0), 0b011);
    }

    #[test]
    fn bus_error_and_timeout_raise_monitor_causes() {
        let map = demo_map(RevisionTag::RevB, 1);
        let sim = SimComplex::new(&map, SimUnitSpec::default());
        let rev = revision(RevisionTag::RevB);
        let base = map.get(0).unwrap().base;
        CrossTriggerMatrix::new(sim.clone(), map.cctm_base).enable(1, true);
        let mon = BusMonitor::new(sim.clone(), rev.clone(), base, 1);
        mon.configure_mode(Direction::Write, LogMode::FullTransaction, false);
        mon.configure_bars([1, 2, 3, 4, 5], Some(10)).unwrap();
        mon.enable(true);
        sim.inject(0, 1, &Transaction::write(0x10, 11).with_bus_error());
        let bank = CounterBank::new(sim.clone(), rev, base);
        let cause = bank.interrupts().cause(pmu::INT_GROUP_MONITOR);
        assert_eq!(
            cause,
            1 << MonitorCause::Timeout.bit(1) | 1 << MonitorCause::BusError.bit(1)
        );
    }

    #[test]
    fn trace_engine_drives_outputs() {
        let map = demo_map(RevisionTag::RevA, 1);
        let sim = SimComplex::new(&map, SimUnitSpec::default());
        let e = TraceEngine::new(sim.clone(), revision(RevisionTag::RevA), map.get(0).unwrap().base, 1, 6);
        e.configure(0, 3, 0, Action::default()).unwrap();
        e.configure_state(
            0,
            &TriggerStateConfig {
                action: Action {
                    output: 0b0101,
                    stop_clock: true,
                    trace: false,
                },
                ..Default::default()
            },
        )
        .unwrap();
        e.start().unwrap();
        sim.ela_signal(0, 1, 2, 0, 0);
        assert_eq!(sim.ela_outputs(0, 1), 0);
        sim.ela_signal(0, 1, 3, 0, 0);
        assert_eq!(sim.ela_outputs(0, 1), 0b1_0101);
    }

    #[test]
    fn tracked_transactions_reach_trace_memory() {
        let map = demo_map(RevisionTag::RevB, 1);
        let sim = SimComplex::new(&map, SimUnitSpec::default());
        let rev = revision(RevisionTag::RevB);
        let base = map.get(0).unwrap().base;
        CrossTriggerMatrix::new(sim.clone(), map.cctm_base).enable(1, true);
        let mon = BusMonitor::new(sim.clone(), rev.clone(), base, 0);
        mon.configure_tracker(2, Tracker::for_address(0x4000, !0xFFF)).unwrap();
        mon.configure_trace(0, 0b100, TraceFields::ADDRESS | TraceFields::ID).unwrap();
        mon.enable(true);

        let e = TraceEngine::new(sim.clone(), rev, base, 0, 6);
        e.configure(0, 0, 0, Action::default()).unwrap();
        e.configure_state(
            0,
            &TriggerStateConfig {
                next: NextState::State(0),
                action: Action::TRACE,
                ..Default::default()
            },
        )
        .unwrap();
        e.start().unwrap();
        sim.inject(0, 0, &Transaction::read(0x4010, 3).with_id(7));
        sim.inject(0, 0, &Transaction::read(0x9000, 3));
        e.stop().unwrap();

        let dump = e.dump().unwrap();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump[0].payload, 0x4010 | 7u128 << 40);
    }
}
