use std::sync::Arc;

use crate::libs::common::{poll_until, POLL_DEADLINE, POLL_INTERVAL};
use crate::libs::error::{invalid, out_of_range, PmdtError, Result};
use crate::libs::regs::{
    ela, u128_of_words, words_of_u128, ActionBits, CompareMode, CompareOp, ElaCtrl, ElaInit,
    ElaStatus, NextState, RamWritePtr, RegisterSurface, StateNext, TraceHeader, TrigCtrl,
};
use crate::libs::revision::HwRevision;

/// What a state does when one of its comparisons fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Action {
    /// Output signal lines driven while the action holds (4 bits).
    pub output: u8,
    pub stop_clock: bool,
    /// Capture the evaluated vector into trace memory.
    pub trace: bool,
}

impl Action {
    pub const TRACE: Action = Action {
        output: 0,
        stop_clock: false,
        trace: true,
    };

    fn to_raw(self) -> u32 {
        let mut a = ActionBits(0);
        a.set_output(self.output as u32);
        a.set_stop_clock(self.stop_clock);
        a.set_trace(self.trace);
        a.0
    }

    fn from_raw(raw: u32) -> Self {
        let a = ActionBits(raw);
        Action {
            output: a.output() as u8,
            stop_clock: a.stop_clock(),
            trace: a.trace(),
        }
    }
}

/// Per-state counter behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterControl {
    /// Reload the counter with zero whenever the state is entered.
    pub reset_on_entry: bool,
    /// Zero the counter when the state fires.
    pub clear_on_match: bool,
    /// Stop counting once the counter comparison holds.
    pub hold_on_match: bool,
    /// Counter id recorded in the header of captured entries (0..=3).
    pub select: u8,
}

/// Full programming of one trigger state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerStateConfig {
    pub mode: CompareMode,
    pub op: CompareOp,
    pub counter: CounterControl,
    /// Counter value compared with `op` in [`CompareMode::Counter`].
    pub counter_compare: u32,
    pub next: NextState,
    pub action: Action,
    pub alt_next: NextState,
    pub alt_action: Action,
    /// External trigger test; a zero mask disables the alternate path.
    pub ext_mask: u32,
    pub ext_compare: u32,
    pub signal_mask: u128,
    pub signal_compare: u128,
}

impl Default for TriggerStateConfig {
    fn default() -> Self {
        TriggerStateConfig {
            mode: CompareMode::Signal,
            op: CompareOp::Equal,
            counter: CounterControl::default(),
            counter_compare: 0,
            next: NextState::Final,
            action: Action::default(),
            alt_next: NextState::Final,
            alt_action: Action::default(),
            ext_mask: 0,
            ext_compare: 0,
            signal_mask: 0,
            signal_compare: 0,
        }
    }
}

/// Where [`TraceEngine::ram_read`] reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamAddr {
    At(u32),
    /// The read pointer, which then advances.
    Next,
}

/// One captured trace memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceEntry {
    /// State that produced the entry.
    pub state: u8,
    pub counter_select: u8,
    /// Payload holds a timestamp rather than a signal vector.
    pub timestamp: bool,
    /// Written by the reset-capture state, outside the main sequence.
    pub s4_override: bool,
    pub payload: u128,
}

impl TraceEntry {
    pub(crate) fn header(&self) -> u32 {
        let mut h = TraceHeader(0);
        h.set_state(self.state as u32);
        h.set_counter_select(self.counter_select as u32);
        h.set_timestamp(self.timestamp);
        h.set_s4_override(self.s4_override);
        h.set_valid(true);
        h.0
    }

    /// Header word followed by the payload words that fit `payload_bits`,
    /// least significant first.
    pub fn to_words(&self, payload_bits: u32) -> Vec<u32> {
        let n = (payload_bits / 32) as usize;
        let mut words = Vec::with_capacity(1 + n);
        words.push(self.header());
        words.extend_from_slice(&words_of_u128(self.payload)[..n.min(4)]);
        words
    }
}

/// Renders a dump as a table, one row per entry.
pub fn format_trace(entries: &[TraceEntry], payload_bits: u32) -> Vec<String> {
    let words = (payload_bits / 32).clamp(1, 4) as usize;
    let mut lines = Vec::with_capacity(entries.len() + 1);

    let mut header = vec![
        "  IDX".to_string(),
        "STATE".to_string(),
        "CNT".to_string(),
        "FLAGS".to_string(),
    ];
    for i in (0..words).rev() {
        header.push(format!("  PAYLOAD {}", i));
    }
    lines.push(format!("| {} |", header.join(" | ")));

    for (idx, e) in entries.iter().enumerate() {
        let mut row = vec![
            format!("{:>5}", idx),
            format!("{:>5}", format!("S{}", e.state)),
            format!("{:>3}", e.counter_select),
            format!(
                "{:<5}",
                match (e.timestamp, e.s4_override) {
                    (true, true) => "TS+R",
                    (true, false) => "TS",
                    (false, true) => "RST",
                    (false, false) => "",
                }
            ),
        ];
        let payload = words_of_u128(e.payload);
        for w in payload[..words].iter().rev() {
            row.push(format!("{:#010x}", w));
        }
        lines.push(format!("| {} |", row.join(" | ")));
    }
    lines
}

/// Trigger-state machine plus circular trace memory.
///
/// States S0..S3 are always present, S4 only on revisions with five states.
/// Each state compares a selected signal group (or its own counter) with a
/// mask/compare pair and separately tests the external trigger inputs. The
/// primary comparison picks `next`/`action`; if it fails and the external
/// test passes, `alt_next`/`alt_action` are taken instead.
///
/// Configuration and memory access are only legal while the engine is
/// stopped, and configuration additionally requires the lock released.
pub struct TraceEngine {
    regs: Arc<dyn RegisterSurface>,
    rev: Arc<dyn HwRevision>,
    base: u64,
    index: u8,
    ram_addr_bits: u8,
}

impl TraceEngine {
    /// Opens trace engine `index` of the unit at `unit_base`. Its memory
    /// holds `2^ram_addr_bits` entries, as reported by the unit's
    /// capabilities.
    pub fn new(
        regs: Arc<dyn RegisterSurface>,
        rev: Arc<dyn HwRevision>,
        unit_base: u64,
        index: u8,
        ram_addr_bits: u8,
    ) -> Self {
        let base = unit_base + rev.ela_offset(index);
        TraceEngine {
            regs,
            ram_addr_bits: ram_addr_bits.min(rev.max_ram_addr_bits()),
            rev,
            base,
            index,
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn depth(&self) -> u32 {
        1 << self.ram_addr_bits
    }

    pub fn payload_bits(&self) -> u32 {
        self.rev.payload_bits()
    }

    fn status(&self) -> ElaStatus {
        ElaStatus(self.regs.read32(self.base + ela::STATUS))
    }

    pub fn is_running(&self) -> bool {
        self.status().running()
    }

    pub fn is_locked(&self) -> bool {
        self.regs.read32(self.base + ela::LOCK) & 1 != 0
    }

    /// Asserts or releases the software guard against configuration writes.
    pub fn write_lock(&self, on: bool) {
        self.regs.write32(self.base + ela::LOCK, on as u32);
    }

    fn check_configurable(&self) -> Result<()> {
        if self.is_running() || self.is_locked() {
            return Err(PmdtError::Permission(self.index));
        }
        Ok(())
    }

    fn check_stopped(&self) -> Result<()> {
        if self.is_running() {
            return Err(PmdtError::Permission(self.index));
        }
        Ok(())
    }

    fn check_state(&self, id: u8) -> Result<()> {
        let states = self.rev.ela_states();
        if id >= states {
            return Err(out_of_range("trigger state", id as usize, states as usize));
        }
        Ok(())
    }

    /// Global setup: timestamp interval (captures between timestamp entries,
    /// 0 = none), watched signal group, and the state and action applied on
    /// start.
    pub fn configure(&self, ts_interval: u32, group_select: u32, init_state: u8, init_action: Action) -> Result<()> {
        self.check_configurable()?;
        self.check_state(init_state)?;
        let mut init = ElaInit(0);
        init.set_state(init_state as u32);
        init.set_action(init_action.to_raw());
        self.regs.write32(self.base + ela::TS_CTRL, ts_interval);
        self.regs.write32(self.base + ela::GROUP_SEL, group_select);
        self.regs.write32(self.base + ela::INIT, init.0);
        Ok(())
    }

    /// Programs trigger state `id`.
    ///
    /// # Parameters
    ///
    /// - `id`: `u8` - State to program, below the revision's state count.
    /// - `cfg`: `&TriggerStateConfig` - Comparison, successors and actions.
    ///
    /// # Errors
    ///
    /// [`PmdtError::Permission`] unless the engine is stopped and unlocked.
    pub fn configure_state(&self, id: u8, cfg: &TriggerStateConfig) -> Result<()> {
        self.check_configurable()?;
        self.check_state(id)?;
        if cfg.counter.select > 3 {
            return Err(invalid("counter select", format!("{} exceeds 3", cfg.counter.select)));
        }
        if cfg.action.output > 0xF || cfg.alt_action.output > 0xF {
            return Err(invalid("output", "only four output lines exist"));
        }
        for next in [cfg.next, cfg.alt_next] {
            if let NextState::State(s) = next {
                self.check_state(s)?;
            }
        }

        let mut trig = TrigCtrl(0);
        trig.set_counter_mode(cfg.mode == CompareMode::Counter);
        trig.set_op(cfg.op as u32);
        trig.set_counter_reset(cfg.counter.reset_on_entry);
        trig.set_counter_clear(cfg.counter.clear_on_match);
        trig.set_counter_break(cfg.counter.hold_on_match);
        trig.set_counter_select(cfg.counter.select as u32);

        let mut next = StateNext(0);
        next.set_next(cfg.next.raw());
        next.set_alt_next(cfg.alt_next.raw());

        let reg = |r| self.base + ela::state(id, r);
        self.regs.write32(reg(ela::S_TRIG_CTRL), trig.0);
        self.regs.write32(reg(ela::S_NEXT), next.0);
        self.regs.write32(reg(ela::S_ACTION), cfg.action.to_raw());
        self.regs.write32(reg(ela::S_ALT_ACTION), cfg.alt_action.to_raw());
        self.regs.write32(reg(ela::S_EXT_MASK), cfg.ext_mask);
        self.regs.write32(reg(ela::S_EXT_COMPARE), cfg.ext_compare);
        for (i, (m, c)) in words_of_u128(cfg.signal_mask)
            .iter()
            .zip(words_of_u128(cfg.signal_compare).iter())
            .enumerate()
        {
            self.regs.write32(reg(ela::S_SIG_MASK) + i as u64 * 4, *m);
            self.regs.write32(reg(ela::S_SIG_COMPARE) + i as u64 * 4, *c);
        }
        self.regs.write32(reg(ela::S_CNT_COMPARE), cfg.counter_compare);
        self.regs.write32(reg(ela::S_COUNTER), 0);

        log::debug!("ela {:#x}: state {} -> {:?} / alt {:?}", self.base, id, cfg.next, cfg.alt_next);
        Ok(())
    }

    pub fn state_config(&self, id: u8) -> Result<TriggerStateConfig> {
        self.check_state(id)?;
        let reg = |r| self.base + ela::state(id, r);
        let trig = TrigCtrl(self.regs.read32(reg(ela::S_TRIG_CTRL)));
        let next = StateNext(self.regs.read32(reg(ela::S_NEXT)));
        let mut mask = [0u32; 4];
        let mut compare = [0u32; 4];
        for i in 0..4 {
            mask[i] = self.regs.read32(reg(ela::S_SIG_MASK) + i as u64 * 4);
            compare[i] = self.regs.read32(reg(ela::S_SIG_COMPARE) + i as u64 * 4);
        }
        Ok(TriggerStateConfig {
            mode: if trig.counter_mode() {
                CompareMode::Counter
            } else {
                CompareMode::Signal
            },
            op: CompareOp::from_raw(trig.op()),
            counter: CounterControl {
                reset_on_entry: trig.counter_reset(),
                clear_on_match: trig.counter_clear(),
                hold_on_match: trig.counter_break(),
                select: trig.counter_select() as u8,
            },
            counter_compare: self.regs.read32(reg(ela::S_CNT_COMPARE)),
            next: NextState::from_raw(next.next()),
            action: Action::from_raw(self.regs.read32(reg(ela::S_ACTION))),
            alt_next: NextState::from_raw(next.alt_next()),
            alt_action: Action::from_raw(self.regs.read32(reg(ela::S_ALT_ACTION))),
            ext_mask: self.regs.read32(reg(ela::S_EXT_MASK)),
            ext_compare: self.regs.read32(reg(ela::S_EXT_COMPARE)),
            signal_mask: u128_of_words(mask),
            signal_compare: u128_of_words(compare),
        })
    }

    pub fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let mut ctrl = ElaCtrl(0);
        ctrl.set_run(true);
        self.regs.write32(self.base + ela::CTRL, ctrl.0);
        log::debug!("ela {:#x}: started", self.base);
        Ok(())
    }

    /// Requests a stop and waits until the engine leaves the running state,
    /// which happens at its next state re-evaluation.
    pub fn stop(&self) -> Result<()> {
        self.regs.write32(self.base + ela::CTRL, 0);
        poll_until(POLL_INTERVAL, POLL_DEADLINE, "trace engine stop", || !self.is_running())
    }

    pub fn current_state(&self) -> NextState {
        let st = self.status();
        if st.final_state() {
            NextState::Final
        } else {
            NextState::State(st.state() as u8)
        }
    }

    pub fn ram_read_ptr(&self) -> Result<u32> {
        self.check_stopped()?;
        Ok(self.regs.read32(self.base + ela::RAM_RPTR) % self.depth())
    }

    /// Next slot the engine writes, and whether memory has wrapped at least
    /// once.
    pub fn ram_write_ptr(&self) -> Result<(u32, bool)> {
        self.check_stopped()?;
        let w = RamWritePtr(self.regs.read32(self.base + ela::RAM_WPTR));
        Ok((w.ptr() % self.depth(), w.wrap()))
    }

    fn read_slot(&self, index: u32) -> TraceEntry {
        let h = TraceHeader(self.regs.read32(self.base + ela::ram(index, ela::E_HEADER)));
        let mut payload = [0u32; 4];
        for (i, w) in payload.iter_mut().enumerate() {
            *w = self.regs.read32(self.base + ela::ram(index, ela::E_PAYLOAD) + i as u64 * 4);
        }
        TraceEntry {
            state: h.state() as u8,
            counter_select: h.counter_select() as u8,
            timestamp: h.timestamp(),
            s4_override: h.s4_override(),
            payload: u128_of_words(payload),
        }
    }

    /// Reads one entry. Reading leaves the read pointer on the following
    /// slot.
    pub fn ram_read(&self, addr: RamAddr) -> Result<TraceEntry> {
        self.check_stopped()?;
        let index = match addr {
            RamAddr::At(i) if i >= self.depth() => {
                return Err(out_of_range("trace memory slot", i as usize, self.depth() as usize))
            }
            RamAddr::At(i) => i,
            RamAddr::Next => self.regs.read32(self.base + ela::RAM_RPTR) % self.depth(),
        };
        let entry = self.read_slot(index);
        self.regs
            .write32(self.base + ela::RAM_RPTR, (index + 1) % self.depth());
        Ok(entry)
    }

    /// Writes `entry` at the write pointer and advances it, as the engine
    /// would. Returns the slot written.
    pub fn ram_write(&self, entry: &TraceEntry) -> Result<u32> {
        self.check_stopped()?;
        let (index, wrapped) = self.ram_write_ptr()?;
        self.regs.write32(self.base + ela::ram(index, ela::E_HEADER), entry.header());
        for (i, w) in words_of_u128(entry.payload).iter().enumerate() {
            self.regs
                .write32(self.base + ela::ram(index, ela::E_PAYLOAD) + i as u64 * 4, *w);
        }
        let next = index + 1;
        let mut ptr = RamWritePtr(0);
        ptr.set_ptr(next % self.depth());
        ptr.set_wrap(wrapped || next == self.depth());
        self.regs.write32(self.base + ela::RAM_WPTR, ptr.0);
        Ok(index)
    }

    /// Rewinds both memory pointers and forgets the wrap.
    pub fn ram_reset(&self) -> Result<()> {
        self.check_stopped()?;
        self.regs.write32(self.base + ela::RAM_WPTR, 0);
        self.regs.write32(self.base + ela::RAM_RPTR, 0);
        Ok(())
    }

    /// Every captured entry, oldest first.
    ///
    /// # Returns
    ///
    /// The entries from slot 0 up to the write pointer, or after a wrap the
    /// whole memory starting at the write pointer.
    ///
    /// # Errors
    ///
    /// [`PmdtError::Permission`] while the engine is running.
    pub fn dump(&self) -> Result<Vec<TraceEntry>> {
        let (wptr, wrapped) = self.ram_write_ptr()?;
        let (start, count) = if wrapped {
            (wptr, self.depth())
        } else {
            (0, wptr)
        };
        self.regs.write32(self.base + ela::RAM_RPTR, start);
        (0..count).map(|_| self.ram_read(RamAddr::Next)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::revision::{revision, RevisionTag};
    use crate::libs::sim::{demo_map, SimComplex, SimUnitSpec};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn engine(tag: RevisionTag) -> (Arc<SimComplex>, TraceEngine) {
        let map = demo_map(tag, 1);
        let sim = SimComplex::new(&map, SimUnitSpec::default());
        let ram_bits = SimUnitSpec::default().ram_addr_bits;
        let e = TraceEngine::new(sim.clone(), revision(tag), map.get(0).unwrap().base, 0, ram_bits);
        (sim, e)
    }

    fn capture_on(value: u128, next: NextState) -> TriggerStateConfig {
        TriggerStateConfig {
            signal_mask: u128::MAX,
            signal_compare: value,
            next,
            action: Action::TRACE,
            ..Default::default()
        }
    }

    #[test]
    fn configuration_requires_stopped_and_unlocked() {
        let (_sim, e) = engine(RevisionTag::RevB);
        e.write_lock(true);
        assert!(matches!(
            e.configure_state(0, &TriggerStateConfig::default()),
            Err(PmdtError::Permission(0))
        ));
        e.write_lock(false);
        e.configure_state(0, &TriggerStateConfig::default()).unwrap();

        e.start().unwrap();
        assert!(matches!(e.configure(0, 0, 0, Action::default()), Err(PmdtError::Permission(0))));
        assert!(matches!(e.ram_read(RamAddr::Next), Err(PmdtError::Permission(0))));
        assert!(e.ram_write_ptr().is_err());
        e.stop().unwrap();
        assert!(e.ram_read_ptr().is_ok());
    }

    #[test]
    fn state_four_only_on_rev_b() {
        let (_sim, a) = engine(RevisionTag::RevA);
        assert!(matches!(
            a.configure_state(4, &TriggerStateConfig::default()),
            Err(PmdtError::OutOfRange { .. })
        ));
        let (_sim, b) = engine(RevisionTag::RevB);
        b.configure_state(4, &TriggerStateConfig::default()).unwrap();
    }

    #[test]
    fn state_config_reads_back() {
        let (_sim, e) = engine(RevisionTag::RevB);
        let cfg = TriggerStateConfig {
            mode: CompareMode::Counter,
            op: CompareOp::GreaterOrEqual,
            counter: CounterControl {
                reset_on_entry: true,
                clear_on_match: false,
                hold_on_match: true,
                select: 2,
            },
            counter_compare: 7,
            next: NextState::State(2),
            action: Action {
                output: 0b1010,
                stop_clock: true,
                trace: true,
            },
            alt_next: NextState::Final,
            alt_action: Action::default(),
            ext_mask: 0xF0,
            ext_compare: 0x30,
            signal_mask: 1u128 << 100,
            signal_compare: 1u128 << 100,
        };
        e.configure_state(1, &cfg).unwrap();
        assert_eq!(e.state_config(1).unwrap(), cfg);
    }

    #[test]
    fn sequence_captures_and_reaches_final() {
        let (sim, e) = engine(RevisionTag::RevB);
        e.configure(0, 0, 0, Action::default()).unwrap();
        e.configure_state(0, &capture_on(0xA, NextState::State(1))).unwrap();
        e.configure_state(1, &capture_on(0xB, NextState::Final)).unwrap();
        e.start().unwrap();

        sim.ela_signal(0, 0, 0, 0xB, 0);
        assert_eq!(e.current_state(), NextState::State(0));
        sim.ela_signal(0, 0, 0, 0xA, 0);
        assert_eq!(e.current_state(), NextState::State(1));
        sim.ela_signal(0, 0, 0, 0xB, 0);
        assert_eq!(e.current_state(), NextState::Final);
        sim.ela_signal(0, 0, 0, 0xB, 0);

        e.stop().unwrap();
        let dump = e.dump().unwrap();
        assert_eq!(dump.len(), 2);
        assert_eq!((dump[0].state, dump[0].payload), (0, 0xA));
        assert_eq!((dump[1].state, dump[1].payload), (1, 0xB));
    }

    #[test]
    fn external_test_takes_alternate_path() {
        let (sim, e) = engine(RevisionTag::RevA);
        let cfg = TriggerStateConfig {
            alt_next: NextState::State(3),
            alt_action: Action::TRACE,
            ext_mask: 0b11,
            ext_compare: 0b01,
            ..capture_on(0xFF, NextState::State(1))
        };
        e.configure(0, 0, 0, Action::default()).unwrap();
        e.configure_state(0, &cfg).unwrap();
        e.start().unwrap();
        sim.ela_signal(0, 0, 0, 0x1, 0b11);
        assert_eq!(e.current_state(), NextState::State(0));
        sim.ela_signal(0, 0, 0, 0x1, 0b01);
        assert_eq!(e.current_state(), NextState::State(3));
    }

    #[test]
    fn counter_mode_fires_after_count() {
        let (sim, e) = engine(RevisionTag::RevA);
        let cfg = TriggerStateConfig {
            mode: CompareMode::Counter,
            op: CompareOp::GreaterOrEqual,
            counter_compare: 3,
            ..capture_on(0x1, NextState::Final)
        };
        e.configure(0, 0, 0, Action::default()).unwrap();
        e.configure_state(0, &cfg).unwrap();
        e.start().unwrap();
        for _ in 0..2 {
            sim.ela_signal(0, 0, 0, 0x1, 0);
        }
        assert_eq!(e.current_state(), NextState::State(0));
        sim.ela_signal(0, 0, 0, 0x1, 0);
        assert_eq!(e.current_state(), NextState::Final);
    }

    #[test]
    fn reset_capture_overrides_without_moving_sequence() {
        let (sim, e) = engine(RevisionTag::RevB);
        e.configure(0, 0, 0, Action::default()).unwrap();
        e.configure_state(0, &capture_on(0xA, NextState::State(1))).unwrap();
        e.configure_state(
            4,
            &TriggerStateConfig {
                action: Action::TRACE,
                ..Default::default()
            },
        )
        .unwrap();
        e.start().unwrap();
        sim.reset_event(0, 0, true);
        assert_eq!(e.current_state(), NextState::State(0));
        e.stop().unwrap();
        let dump = e.dump().unwrap();
        assert_eq!(dump.len(), 1);
        assert!(dump[0].s4_override);
        assert_eq!(dump[0].state, 4);
    }

    #[test]
    fn ram_read_advances_pointer() {
        let (_sim, e) = engine(RevisionTag::RevA);
        for p in 0..3u128 {
            e.ram_write(&TraceEntry {
                payload: p,
                ..Default::default()
            })
            .unwrap();
        }
        assert_eq!(e.ram_read(RamAddr::At(1)).unwrap().payload, 1);
        assert_eq!(e.ram_read_ptr().unwrap(), 2);
        assert_eq!(e.ram_read(RamAddr::Next).unwrap().payload, 2);
        assert!(e.ram_read(RamAddr::At(e.depth())).is_err());
    }

    #[test]
    fn entry_words_follow_payload_width() {
        let entry = TraceEntry {
            state: 3,
            counter_select: 1,
            timestamp: true,
            s4_override: false,
            payload: 0x1111_2222_3333_4444_5555_6666_7777_8888,
        };
        let w64 = entry.to_words(64);
        assert_eq!(w64.len(), 3);
        assert_eq!(&w64[1..], &[0x7777_8888, 0x5555_6666]);
        let header = TraceHeader(w64[0]);
        assert_eq!((header.state(), header.counter_select(), header.timestamp()), (3, 1, true));
        assert_eq!(entry.to_words(128).len(), 5);
    }

    #[test]
    fn format_trace_renders_table() {
        let lines = format_trace(
            &[TraceEntry {
                state: 2,
                payload: 0xDEAD_BEEF,
                ..Default::default()
            }],
            64,
        );
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("|   IDX | STATE"));
        assert!(lines[1].contains("0x00000000 | 0xdeadbeef"));
        assert!(lines[1].contains("S2"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn wrapped_dump_is_oldest_first(extra in 1u32..200) {
            let (_sim, e) = engine(RevisionTag::RevA);
            let total = e.depth() + extra;
            for p in 0..total {
                e.ram_write(&TraceEntry { payload: p as u128, ..Default::default() }).unwrap();
            }
            let dump = e.dump().unwrap();
            prop_assert_eq!(dump.len() as u32, e.depth());
            let expected: Vec<u128> = (total - e.depth()..total).map(|p| p as u128).collect();
            let got: Vec<u128> = dump.iter().map(|d| d.payload).collect();
            prop_assert_eq!(got, expected);
        }
    }
}
