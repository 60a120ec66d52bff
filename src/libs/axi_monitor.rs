use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::libs::common::{poll_until, POLL_DEADLINE, POLL_INTERVAL};
use crate::libs::error::{invalid, out_of_range, Result};
use crate::libs::regs::{
    axim, Direction, LogMeta, LogMode, MonitorCtrl, MonitorStatus, RegisterSurface,
    TraceChannelCfg, TrackerCtrl, TxnVector,
};
use crate::libs::revision::HwRevision;

/// Total serialized width a trace channel can carry, header included.
pub const TRACE_WIDTH_BUDGET: u32 = 128;
/// Fixed header prepended to every forwarded transaction.
pub const TRACE_HEADER_BITS: u32 = 5;

/// Bin a latency falls into: the smallest `i` with `latency < bars[i]`, or
/// the last bin when no bar exceeds it. A latency equal to a bar belongs to
/// the next bin up.
pub fn classify_latency(bars: &[u32; axim::NUM_BARS], latency: u64) -> usize {
    bars.iter()
        .position(|&b| latency < b as u64)
        .unwrap_or(axim::NUM_BARS - 1)
}

/// Mask/compare filter over a transaction vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tracker {
    pub mask: u64,
    pub compare: u64,
}

impl Tracker {
    pub fn new(mask: u64, compare: u64) -> Self {
        Tracker { mask, compare }
    }

    /// Matches valid transactions whose address agrees with `address` on the
    /// bits set in `address_mask`.
    pub fn for_address(address: u64, address_mask: u64) -> Self {
        let mut mask = TxnVector(0);
        mask.set_valid(true);
        mask.set_address(address_mask);
        let mut compare = TxnVector(0);
        compare.set_valid(true);
        compare.set_address(address & address_mask);
        Tracker {
            mask: mask.0,
            compare: compare.0,
        }
    }

    /// Narrows the tracker to one transaction id.
    pub fn with_id(self, id: u16) -> Self {
        let mut mask = TxnVector(self.mask);
        mask.set_id(0xFFFF);
        let mut compare = TxnVector(self.compare);
        compare.set_id(id as u64);
        Tracker {
            mask: mask.0,
            compare: compare.0,
        }
    }

    pub fn matches(&self, vector: u64) -> bool {
        (vector & self.mask) == (self.compare & self.mask)
    }
}

/// Transaction fields as seen by trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxnFields {
    pub address: u64,
    pub id: u16,
    pub prot: u8,
    pub cache: u8,
}

impl TxnFields {
    /// Packs the fields into the tracker vector, validity bit set.
    pub fn vector(&self) -> u64 {
        let mut v = TxnVector(0);
        v.set_valid(true);
        v.set_prot(self.prot as u64);
        v.set_address(self.address);
        v.set_id(self.id as u64);
        v.set_cache(self.cache as u64);
        v.0
    }
}

bitflags! {
    /// Fields serialized when a tracker hit is forwarded to trace.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TraceFields: u32 {
        const ATTRIBUTES = 1 << 0;
        const DATA = 1 << 1;
        const BYTE_COUNT = 1 << 2;
        const OUTSTANDING = 1 << 3;
        const USER = 1 << 4;
        const ADDRESS = 1 << 5;
        const ID = 1 << 6;
    }
}

impl TraceFields {
    /// Serialized width of the selected fields plus the fixed header.
    pub fn width(self, rev: &dyn HwRevision) -> u32 {
        let mut bits = TRACE_HEADER_BITS;
        for (flag, w) in [
            (TraceFields::ATTRIBUTES, 7),
            (TraceFields::DATA, 64),
            (TraceFields::BYTE_COUNT, 8),
            (TraceFields::OUTSTANDING, 8),
            (TraceFields::USER, 8),
            (TraceFields::ADDRESS, rev.trace_address_bits()),
            (TraceFields::ID, rev.trace_id_bits()),
        ] {
            if self.contains(flag) {
                bits += w;
            }
        }
        bits
    }
}

/// Outcome of [`BusMonitor::configure_trace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceWidth {
    pub bits: u32,
    /// Hardware drops the bits beyond [`TRACE_WIDTH_BUDGET`].
    pub truncated: bool,
}

/// One logged transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogEntry {
    pub latency: u32,
    pub address: u64,
    pub id: u16,
    pub attributes: u8,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "addr {:#012x} id {:#06x} attr {:#04x} latency {}",
            self.address, self.id, self.attributes, self.latency
        )
    }
}

/// The three fixed log snapshots of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonitorLog {
    /// Last transaction that landed in each bin.
    pub bins: [Option<LogEntry>; axim::NUM_BARS],
    pub max_latency: Option<LogEntry>,
    pub last_timeout: Option<LogEntry>,
    /// 0..=128; high values mean the monitor may be dropping events.
    pub busy_level: u8,
}

/// One bus transaction monitor of a unit.
///
/// A monitor watches one direction of the unit's bus port. It sorts each
/// transaction's latency into five histogram bins, logs stale transactions
/// past a timeout bound, and matches transactions against up to four
/// trackers whose hits can be forwarded to the trace engines.
pub struct BusMonitor {
    regs: Arc<dyn RegisterSurface>,
    rev: Arc<dyn HwRevision>,
    base: u64,
    index: u8,
}

impl BusMonitor {
    pub fn new(regs: Arc<dyn RegisterSurface>, rev: Arc<dyn HwRevision>, unit_base: u64, index: u8) -> Self {
        let base = unit_base + rev.monitor_offset(index);
        BusMonitor {
            regs,
            rev,
            base,
            index,
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    fn ctrl(&self) -> MonitorCtrl {
        MonitorCtrl(self.regs.read32(self.base + axim::CTRL))
    }

    /// Selects the watched direction, the measured latency phase and the
    /// time unit. The enable bit is left as is.
    pub fn configure_mode(&self, direction: Direction, log_mode: LogMode, fine_grain_clock: bool) {
        let mut ctrl = self.ctrl();
        ctrl.set_direction(direction.bit());
        ctrl.set_log_mode(log_mode as u32);
        ctrl.set_fine_grain(fine_grain_clock);
        self.regs.write32(self.base + axim::CTRL, ctrl.0);
    }

    pub fn direction(&self) -> Direction {
        Direction::from_bit(self.ctrl().direction())
    }

    pub fn log_mode(&self) -> LogMode {
        LogMode::from_raw(self.ctrl().log_mode())
    }

    /// Programs the five bin boundaries and the timeout bound, in cycles.
    /// `None` disables the timeout.
    pub fn configure_bars(&self, bars: [u32; axim::NUM_BARS], timeout: Option<u32>) -> Result<()> {
        if bars.windows(2).any(|w| w[0] > w[1]) {
            return Err(invalid("latency bars", format!("{:?} is not non-decreasing", bars)));
        }
        if let Some(t) = timeout {
            if t == 0 {
                return Err(invalid("timeout", "timeout bound must be non-zero"));
            }
            if bars[axim::NUM_BARS - 1] > t {
                return Err(invalid(
                    "latency bars",
                    format!("last bar {} exceeds timeout {}", bars[axim::NUM_BARS - 1], t),
                ));
            }
        }
        for (i, b) in bars.iter().enumerate() {
            self.regs.write32(self.base + axim::bar(i), *b);
        }
        self.regs.write32(self.base + axim::TIMEOUT, timeout.unwrap_or(0));
        Ok(())
    }

    pub fn bars(&self) -> ([u32; axim::NUM_BARS], Option<u32>) {
        let mut bars = [0u32; axim::NUM_BARS];
        for (i, b) in bars.iter_mut().enumerate() {
            *b = self.regs.read32(self.base + axim::bar(i));
        }
        let t = self.regs.read32(self.base + axim::TIMEOUT);
        (bars, (t != 0).then_some(t))
    }

    fn check_tracker(id: u8) -> Result<()> {
        if id >= axim::MAX_TRACKERS {
            return Err(out_of_range("tracker", id as usize, axim::MAX_TRACKERS as usize));
        }
        Ok(())
    }

    /// Programs and enables tracker `id`.
    pub fn configure_tracker(&self, id: u8, tracker: Tracker) -> Result<()> {
        Self::check_tracker(id)?;
        self.regs.write64(self.base + axim::tracker(id, axim::T_MASK), tracker.mask);
        self.regs.write64(self.base + axim::tracker(id, axim::T_COMPARE), tracker.compare);
        let mut ctrl = TrackerCtrl(0);
        ctrl.set_enable(true);
        self.regs.write32(self.base + axim::tracker(id, axim::T_CTRL), ctrl.0);
        Ok(())
    }

    pub fn disable_tracker(&self, id: u8) -> Result<()> {
        Self::check_tracker(id)?;
        self.regs.write32(self.base + axim::tracker(id, axim::T_CTRL), 0);
        Ok(())
    }

    pub fn tracker(&self, id: u8) -> Result<Option<Tracker>> {
        Self::check_tracker(id)?;
        let ctrl = TrackerCtrl(self.regs.read32(self.base + axim::tracker(id, axim::T_CTRL)));
        if !ctrl.enable() {
            return Ok(None);
        }
        Ok(Some(Tracker {
            mask: self.regs.read64(self.base + axim::tracker(id, axim::T_MASK)),
            compare: self.regs.read64(self.base + axim::tracker(id, axim::T_COMPARE)),
        }))
    }

    pub fn tracker_hits(&self, id: u8) -> Result<u32> {
        Self::check_tracker(id)?;
        Ok(self.regs.read32(self.base + axim::tracker(id, axim::T_HITS)))
    }

    /// Forwards hits of the trackers in `tracker_mask` to trace engine
    /// `channel` of the unit, serializing `fields`.
    ///
    /// A selection wider than [`TRACE_WIDTH_BUDGET`] is accepted; the
    /// hardware truncates it and the result says so.
    pub fn configure_trace(&self, channel: u8, tracker_mask: u8, fields: TraceFields) -> Result<TraceWidth> {
        if channel >= axim::TRACE_CHANNELS {
            return Err(out_of_range("trace channel", channel as usize, axim::TRACE_CHANNELS as usize));
        }
        if tracker_mask >> axim::MAX_TRACKERS != 0 {
            return Err(invalid("tracker selection", format!("{:#x} names a missing tracker", tracker_mask)));
        }

        let bits = fields.width(self.rev.as_ref());
        let truncated = bits > TRACE_WIDTH_BUDGET;
        if truncated {
            log::warn!(
                "monitor {:#x}: trace fields {:?} need {} bits, {} will be truncated",
                self.base,
                fields,
                bits,
                bits - TRACE_WIDTH_BUDGET
            );
        }

        let mut cfg = TraceChannelCfg(0);
        cfg.set_trackers(tracker_mask as u32);
        cfg.set_fields(fields.bits());
        cfg.set_enable(tracker_mask != 0);
        self.regs.write32(self.base + axim::trace_channel(channel), cfg.0);
        Ok(TraceWidth { bits, truncated })
    }

    /// Trackers forwarded through `channel`; zero when the channel is off.
    pub fn trace_selection(&self, channel: u8) -> Result<u8> {
        if channel >= axim::TRACE_CHANNELS {
            return Err(out_of_range("trace channel", channel as usize, axim::TRACE_CHANNELS as usize));
        }
        let cfg = TraceChannelCfg(self.regs.read32(self.base + axim::trace_channel(channel)));
        Ok(if cfg.enable() { cfg.trackers() as u8 } else { 0 })
    }

    /// Stops forwarding to every trace engine.
    pub fn disable_trace_channels(&self) -> Result<()> {
        for ch in 0..axim::TRACE_CHANNELS {
            self.configure_trace(ch, 0, TraceFields::empty())?;
        }
        Ok(())
    }

    pub fn enable(&self, on: bool) {
        let mut ctrl = self.ctrl();
        ctrl.set_enable(on);
        self.regs.write32(self.base + axim::CTRL, ctrl.0);
    }

    pub fn is_enabled(&self) -> bool {
        self.ctrl().enable()
    }

    /// Clears bin counters, tracker hit counters and logs, then waits for
    /// the monitor to acknowledge.
    pub fn clear(&self) -> Result<()> {
        self.regs.write32(self.base + axim::CLEAR, 1);
        poll_until(POLL_INTERVAL, POLL_DEADLINE, "monitor clear", || {
            MonitorStatus(self.regs.read32(self.base + axim::STATUS)).clear_done()
        })
    }

    pub fn busy_level(&self) -> u8 {
        let st = MonitorStatus(self.regs.read32(self.base + axim::STATUS));
        (st.busy_level() as u8).min(axim::BUSY_LEVEL_MAX)
    }

    /// Hit counts of bins 0..=4 followed by the timeout bin.
    pub fn read_bin_counts(&self) -> [u32; axim::NUM_BIN_COUNTS] {
        let mut counts = [0u32; axim::NUM_BIN_COUNTS];
        for (i, c) in counts.iter_mut().enumerate() {
            *c = self.regs.read32(self.base + axim::bin_count(i));
        }
        counts
    }

    fn read_log_slot(&self, slot: u8) -> Option<LogEntry> {
        let meta = LogMeta(self.regs.read32(self.base + axim::log(slot, axim::L_META)));
        if !meta.valid() {
            return None;
        }
        Some(LogEntry {
            latency: self.regs.read32(self.base + axim::log(slot, axim::L_LATENCY)),
            address: self.regs.read64(self.base + axim::log(slot, axim::L_ADDR)),
            id: meta.id() as u16,
            attributes: meta.attributes() as u8,
        })
    }

    pub fn read_log(&self) -> MonitorLog {
        let mut bins = [None; axim::NUM_BARS];
        for (i, slot) in bins.iter_mut().enumerate() {
            *slot = self.read_log_slot(i as u8);
        }
        MonitorLog {
            bins,
            max_latency: self.read_log_slot(axim::LOG_MAX_LATENCY),
            last_timeout: self.read_log_slot(axim::LOG_LAST_TIMEOUT),
            busy_level: self.busy_level(),
        }
    }
}
