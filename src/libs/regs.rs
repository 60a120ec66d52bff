use std::fmt::Debug;
use std::sync::atomic::{fence, Ordering};

use bitfield::bitfield;

/// Access to the 32-bit registers of a PMDT complex.
///
/// Hardware registers are shared mutable state, so both accessors take
/// `&self`. Implementations must be safe to share with an interrupt path.
pub trait RegisterSurface: Send + Sync {
    fn read32(&self, addr: u64) -> u32;
    fn write32(&self, addr: u64, val: u32);

    /// Reads a 64-bit value split across two consecutive registers.
    ///
    /// The low word is sampled, then the high word, then the low word again.
    /// If the low word went down in between, the value wrapped into the high
    /// word while sampling and the read is repeated.
    fn read64(&self, addr: u64) -> u64 {
        loop {
            let lo = self.read32(addr);
            fence(Ordering::SeqCst);
            let hi = self.read32(addr + 4);
            fence(Ordering::SeqCst);
            let lo_again = self.read32(addr);
            if lo_again >= lo {
                return ((hi as u64) << 32) | lo_again as u64;
            }
        }
    }

    /// Writes a 64-bit value, committing the high word last.
    fn write64(&self, addr: u64, val: u64) {
        self.write32(addr, val as u32);
        fence(Ordering::SeqCst);
        self.write32(addr + 4, (val >> 32) as u32);
    }
}

impl<T: RegisterSurface + ?Sized> RegisterSurface for std::sync::Arc<T> {
    fn read32(&self, addr: u64) -> u32 {
        (**self).read32(addr)
    }

    fn write32(&self, addr: u64, val: u32) {
        (**self).write32(addr, val)
    }
}

/// Transaction direction watched by a bus monitor.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn from_bit(bit: bool) -> Self {
        if bit {
            Direction::Write
        } else {
            Direction::Read
        }
    }

    pub fn bit(self) -> bool {
        self == Direction::Write
    }
}

/// Which latency phase of a transaction a monitor measures.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum LogMode {
    FullTransaction = 0, // Request issue to last response beat.
    RequestAccept = 1,   // Request issue to request accept.
    ResponseAccept = 2,  // First response beat to response accept.
}

impl LogMode {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => LogMode::RequestAccept,
            2 => LogMode::ResponseAccept,
            _ => LogMode::FullTransaction,
        }
    }
}

/// Comparison operator of a trigger state.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum CompareOp {
    Equal = 0,
    NotEqual = 1,
    Greater = 2,
    GreaterOrEqual = 3,
    Less = 4,
    LessOrEqual = 5,
}

impl CompareOp {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => CompareOp::NotEqual,
            2 => CompareOp::Greater,
            3 => CompareOp::GreaterOrEqual,
            4 => CompareOp::Less,
            5 => CompareOp::LessOrEqual,
            _ => CompareOp::Equal,
        }
    }

    pub fn apply<T: PartialOrd>(self, lhs: T, rhs: T) -> bool {
        match self {
            CompareOp::Equal => lhs == rhs,
            CompareOp::NotEqual => lhs != rhs,
            CompareOp::Greater => lhs > rhs,
            CompareOp::GreaterOrEqual => lhs >= rhs,
            CompareOp::Less => lhs < rhs,
            CompareOp::LessOrEqual => lhs <= rhs,
        }
    }
}

/// What a trigger state compares against.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CompareMode {
    Signal,
    Counter,
}

/// Successor of a trigger state. `Final` stops evaluation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NextState {
    State(u8),
    Final,
}

const NEXT_FINAL: u32 = 7;

impl NextState {
    pub fn from_raw(raw: u32) -> Self {
        if raw >= 5 {
            NextState::Final
        } else {
            NextState::State(raw as u8)
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            NextState::State(s) => s as u32,
            NextState::Final => NEXT_FINAL,
        }
    }
}

// ---------------------------------------------------------------------------
// Event counter bank
// ---------------------------------------------------------------------------

pub mod pmu {
    pub const CAPS: u64 = 0x000;
    pub const CNT_ENABLE: u64 = 0x004;
    pub const CNT_PAUSE: u64 = 0x008;
    pub const CNT_CLEAR: u64 = 0x00C; // Write-one strobe.
    pub const WINDOW_CFG: u64 = 0x010;
    pub const WINDOW_COUNT: u64 = 0x018; // 64-bit, monotonically increasing.
    pub const INTC: u64 = 0x040;

    pub const COUNTER_BASE: u64 = 0x100;
    pub const COUNTER_STRIDE: u64 = 0x40;

    pub const C_CFG: u64 = 0x00;
    pub const C_STATUS: u64 = 0x04;
    pub const C_THR_LOW: u64 = 0x08; // 64-bit.
    pub const C_THR_HIGH: u64 = 0x10; // 64-bit.
    pub const C_VALUE: u64 = 0x18; // 64-bit.
    pub const C_PREV: u64 = 0x20; // 64-bit.
    pub const C_VIOLATIONS: u64 = 0x28;

    pub fn counter(id: u8, reg: u64) -> u64 {
        COUNTER_BASE + id as u64 * COUNTER_STRIDE + reg
    }

    /// Interrupt group carrying one violation bit per counter.
    pub const INT_GROUP_EVENT: u8 = 0;
    /// Interrupt group carrying monitor-level timeout/overflow/underflow.
    pub const INT_GROUP_MONITOR: u8 = 1;
    pub const MONITOR_STATUS_BITS: u8 = 4;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct PmuCaps(u32);
    impl Debug;
    u32;
    pub counters, set_counters: 5, 0;
    pub monitors, set_monitors: 9, 8;
    pub elas, set_elas: 13, 12;
    pub ram_addr_bits, set_ram_addr_bits: 20, 16;
    pub trackers, set_trackers: 26, 24;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct WindowCfg(u32);
    impl Debug;
    u32;
    pub size, set_size: 23, 0;
    pub unit_shift, set_unit_shift: 28, 24;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct CounterCfg(u32);
    impl Debug;
    u32;
    pub trigger, set_trigger: 6, 0;
    pub window_en, set_window_en: 8;
    pub pause_en, set_pause_en: 9;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct CounterStatus(u32);
    impl Debug;
    u32;
    pub active, set_active: 0;
    pub any_violation, set_any_violation: 1;
    pub overflow, set_overflow: 2;
    pub underflow, set_underflow: 3;
    pub paused, set_paused: 4;
}

/// Monitor-level interrupt causes inside [`pmu::INT_GROUP_MONITOR`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum MonitorCause {
    Timeout = 0,
    Overflow = 1,
    Underflow = 2,
    BusError = 3,
}

impl MonitorCause {
    pub const ALL: [MonitorCause; 4] = [
        MonitorCause::Timeout,
        MonitorCause::Overflow,
        MonitorCause::Underflow,
        MonitorCause::BusError,
    ];

    pub fn bit(self, monitor: u8) -> u8 {
        monitor * pmu::MONITOR_STATUS_BITS + self as u8
    }

    /// Splits a monitor-group cause bit into (monitor, cause).
    pub fn decode(bit: u8) -> (u8, MonitorCause) {
        let cause = MonitorCause::ALL[(bit % pmu::MONITOR_STATUS_BITS) as usize];
        (bit / pmu::MONITOR_STATUS_BITS, cause)
    }
}

// ---------------------------------------------------------------------------
// Bus transaction monitor
// ---------------------------------------------------------------------------

pub mod axim {
    pub const CTRL: u64 = 0x00;
    pub const CLEAR: u64 = 0x04; // Write-one strobe.
    pub const STATUS: u64 = 0x08;
    pub const BARS: u64 = 0x10;
    pub const TIMEOUT: u64 = 0x24;
    pub const BIN_COUNT: u64 = 0x30;

    pub const TRACKER_BASE: u64 = 0x60;
    pub const TRACKER_STRIDE: u64 = 0x20;
    pub const T_CTRL: u64 = 0x00;
    pub const T_MASK: u64 = 0x08; // 64-bit.
    pub const T_COMPARE: u64 = 0x10; // 64-bit.
    pub const T_HITS: u64 = 0x18;

    pub const TRACE_BASE: u64 = 0xE0;
    pub const TRACE_CHANNELS: u8 = 4;

    pub const LOG_BASE: u64 = 0x100;
    pub const LOG_STRIDE: u64 = 0x10;
    pub const L_LATENCY: u64 = 0x0;
    pub const L_ADDR: u64 = 0x4; // 64-bit.
    pub const L_META: u64 = 0xC;
    pub const LOG_MAX_LATENCY: u8 = 5;
    pub const LOG_LAST_TIMEOUT: u8 = 6;

    pub const NUM_BARS: usize = 5;
    /// Bins 0..=4 plus the timeout bin.
    pub const NUM_BIN_COUNTS: usize = 6;
    pub const MAX_TRACKERS: u8 = 4;
    pub const BUSY_LEVEL_MAX: u8 = 128;

    pub fn bar(i: usize) -> u64 {
        BARS + i as u64 * 4
    }

    pub fn bin_count(i: usize) -> u64 {
        BIN_COUNT + i as u64 * 4
    }

    pub fn tracker(id: u8, reg: u64) -> u64 {
        TRACKER_BASE + id as u64 * TRACKER_STRIDE + reg
    }

    pub fn trace_channel(ch: u8) -> u64 {
        TRACE_BASE + ch as u64 * 4
    }

    pub fn log(slot: u8, reg: u64) -> u64 {
        LOG_BASE + slot as u64 * LOG_STRIDE + reg
    }
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct MonitorCtrl(u32);
    impl Debug;
    u32;
    pub enable, set_enable: 0;
    pub direction, set_direction: 1;
    pub log_mode, set_log_mode: 3, 2;
    pub fine_grain, set_fine_grain: 4;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct MonitorStatus(u32);
    impl Debug;
    u32;
    pub clear_done, set_clear_done: 0;
    pub busy_level, set_busy_level: 15, 8;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct TrackerCtrl(u32);
    impl Debug;
    u32;
    pub enable, set_enable: 0;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct TraceChannelCfg(u32);
    impl Debug;
    u32;
    pub trackers, set_trackers: 3, 0;
    pub fields, set_fields: 14, 8;
    pub enable, set_enable: 31;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct LogMeta(u32);
    impl Debug;
    u32;
    pub id, set_id: 15, 0;
    pub valid, set_valid: 16;
    pub attributes, set_attributes: 23, 17;
}

bitfield! {
    /// Transaction vector matched by trackers.
    ///
    /// Bit 0 is the validity bit, bits 3..1 the protection attributes, bits
    /// 43..4 the address, bits 59..44 the transaction id and bits 63..60 the
    /// cache attributes.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct TxnVector(u64);
    impl Debug;
    u64;
    pub valid, set_valid: 0;
    pub prot, set_prot: 3, 1;
    pub address, set_address: 43, 4;
    pub id, set_id: 59, 44;
    pub cache, set_cache: 63, 60;
}

// ---------------------------------------------------------------------------
// Trace engine
// ---------------------------------------------------------------------------

pub mod ela {
    pub const CTRL: u64 = 0x000;
    pub const LOCK: u64 = 0x004;
    pub const STATUS: u64 = 0x008;
    pub const TS_CTRL: u64 = 0x00C;
    pub const GROUP_SEL: u64 = 0x010;
    pub const INIT: u64 = 0x014;
    pub const RAM_WPTR: u64 = 0x020;
    pub const RAM_RPTR: u64 = 0x024;

    pub const STATE_BASE: u64 = 0x100;
    pub const STATE_STRIDE: u64 = 0x80;
    pub const S_TRIG_CTRL: u64 = 0x00;
    pub const S_NEXT: u64 = 0x04;
    pub const S_ACTION: u64 = 0x08;
    pub const S_ALT_ACTION: u64 = 0x0C;
    pub const S_EXT_MASK: u64 = 0x10;
    pub const S_EXT_COMPARE: u64 = 0x14;
    pub const S_SIG_MASK: u64 = 0x20; // Four words, least significant first.
    pub const S_SIG_COMPARE: u64 = 0x30; // Four words.
    pub const S_CNT_COMPARE: u64 = 0x40;
    pub const S_COUNTER: u64 = 0x44;

    pub const RAM_BASE: u64 = 0x1000;
    pub const RAM_STRIDE: u64 = 0x20;
    pub const E_HEADER: u64 = 0x00;
    pub const E_PAYLOAD: u64 = 0x04; // Four words.

    pub const MAX_STATES: u8 = 5;
    pub const RESET_STATE: u8 = 4;

    pub fn state(id: u8, reg: u64) -> u64 {
        STATE_BASE + id as u64 * STATE_STRIDE + reg
    }

    pub fn ram(index: u32, reg: u64) -> u64 {
        RAM_BASE + index as u64 * RAM_STRIDE + reg
    }
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct ElaCtrl(u32);
    impl Debug;
    u32;
    pub run, set_run: 0;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct ElaStatus(u32);
    impl Debug;
    u32;
    pub state, set_state: 2, 0;
    pub running, set_running: 8;
    pub final_state, set_final_state: 9;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct ElaInit(u32);
    impl Debug;
    u32;
    pub state, set_state: 2, 0;
    pub action, set_action: 13, 8;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct RamWritePtr(u32);
    impl Debug;
    u32;
    pub ptr, set_ptr: 15, 0;
    pub wrap, set_wrap: 31;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct TrigCtrl(u32);
    impl Debug;
    u32;
    pub counter_mode, set_counter_mode: 0;
    pub op, set_op: 3, 1;
    pub counter_reset, set_counter_reset: 4;
    pub counter_clear, set_counter_clear: 5;
    pub counter_break, set_counter_break: 6;
    pub counter_select, set_counter_select: 8, 7;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct StateNext(u32);
    impl Debug;
    u32;
    pub next, set_next: 2, 0;
    pub alt_next, set_alt_next: 6, 4;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct ActionBits(u32);
    impl Debug;
    u32;
    pub output, set_output: 3, 0;
    pub stop_clock, set_stop_clock: 4;
    pub trace, set_trace: 5;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct TraceHeader(u32);
    impl Debug;
    u32;
    pub state, set_state: 2, 0;
    pub counter_select, set_counter_select: 4, 3;
    pub timestamp, set_timestamp: 5;
    pub s4_override, set_s4_override: 6;
    pub valid, set_valid: 7;
}

// ---------------------------------------------------------------------------
// Cross-trigger matrix
// ---------------------------------------------------------------------------

pub mod cctm {
    pub const ENABLE: u64 = 0x000; // All bit-vectors are 64-bit, one bit per unit.
    pub const PAUSE: u64 = 0x008;
    pub const CLEAR: u64 = 0x010; // Write-one strobe.
    pub const GPIO_ENABLE: u64 = 0x018;
    pub const FORCE_TRIGGER: u64 = 0x020;
    pub const TRIGGER_STATE: u64 = 0x028;
    pub const GPIO_STATE: u64 = 0x030;
    pub const PAUSE_STATE: u64 = 0x038;

    pub const TS_CTRL: u64 = 0x040;
    pub const TS_CLEAR: u64 = 0x044; // Write-one strobe.
    pub const TS_RATIO: u64 = 0x048;
    pub const TS_INIT: u64 = 0x050; // 64-bit.
    pub const TS_VALUE: u64 = 0x058; // 64-bit.

    pub const INTC: u64 = 0x080;
    pub const INT_GROUPS: u8 = 2;

    pub const ROW_BASE: u64 = 0x200;
    pub const ROW_STRIDE: u64 = 0x40;
    pub const R_PAUSE_SRC: u64 = 0x00;
    pub const R_ENABLE_SRC: u64 = 0x08;
    pub const R_CLEAR_SRC: u64 = 0x10;
    pub const R_GPIO_SRC: u64 = 0x18;
    pub const R_TRIGGER_SRC: u64 = 0x20;

    pub const MAX_UNITS: u8 = 64;

    pub fn row(dest_bit: u8, reg: u64) -> u64 {
        ROW_BASE + dest_bit as u64 * ROW_STRIDE + reg
    }
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct TsCtrl(u32);
    impl Debug;
    u32;
    pub enable, set_enable: 0;
    pub pause, set_pause: 1;
}

bitfield! {
    #[derive(Clone, Copy)]
    pub struct TsRatio(u32);
    impl Debug;
    u32;
    pub numerator, set_numerator: 15, 0;
    pub denominator, set_denominator: 31, 16;
}

// ---------------------------------------------------------------------------
// Interrupt controller sub-block (shared by the counter bank and matrix)
// ---------------------------------------------------------------------------

pub mod intc {
    pub const GROUP_STRIDE: u64 = 0x10;
    pub const CAUSE: u64 = 0x0;
    pub const MASK: u64 = 0x4; // 1 = masked.
    pub const CLEAR: u64 = 0x8; // Write-one-to-clear.

    pub fn reg(base: u64, group: u8, reg: u64) -> u64 {
        base + group as u64 * GROUP_STRIDE + reg
    }
}

/// Splits a 128-bit value into four words, least significant first.
pub fn words_of_u128(v: u128) -> [u32; 4] {
    [v as u32, (v >> 32) as u32, (v >> 64) as u32, (v >> 96) as u32]
}

/// Joins four words, least significant first, into a 128-bit value.
pub fn u128_of_words(w: [u32; 4]) -> u128 {
    w.iter()
        .rev()
        .fold(0u128, |acc, &word| (acc << 32) | word as u128)
}
