pub mod libs {
    pub mod axi_monitor;
    pub mod cctm;
    pub mod cli;
    pub mod common;
    pub mod config;
    pub mod ela;
    pub mod error;
    pub mod intc;
    pub mod isr;
    pub mod mmio;
    pub mod pmdt;
    pub mod pmu;
    pub mod regs;
    pub mod revision;
    pub mod sim;
    pub mod unit_map;
}
