use std::path::Path;
use std::sync::Arc;

use clap::{Args, ValueEnum};
use clap_num::maybe_hex;

use crate::libs::common::validate_unit_map_path;
use crate::libs::config::{
    DirectionReq, HistogramFeature, TimeoutFeature, TrackFeature, TrackerPattern, TrapFeature, UnitRequest,
};
use crate::libs::error::{invalid, Result};
use crate::libs::mmio::MmioWindow;
use crate::libs::pmdt::Pmdt;
use crate::libs::revision::RevisionTag;
use crate::libs::sim::{demo_map, SimComplex, SimUnitSpec};
use crate::libs::unit_map::UnitMap;

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum DirArg {
    Read,
    Write,
    Both,
}

impl From<DirArg> for DirectionReq {
    fn from(d: DirArg) -> Self {
        match d {
            DirArg::Read => DirectionReq::Read,
            DirArg::Write => DirectionReq::Write,
            DirArg::Both => DirectionReq::Both,
        }
    }
}

/// Where the registers of the complex come from.
#[derive(Args, Debug, Clone)]
pub struct BackendArgs {
    /// Drive a simulated complex instead of hardware.
    #[arg(long = "sim", conflicts_with = "unit_map")]
    pub sim: bool,

    /// Units of the simulated complex.
    #[arg(long = "sim-units", default_value_t = 4)]
    pub sim_units: u8,

    /// Revision of the simulated complex.
    #[arg(long = "revision", value_enum, default_value_t = RevisionTag::RevB)]
    pub revision: RevisionTag,

    #[arg(short = 'm', long = "unit-map", value_parser = validate_unit_map_path, required_unless_present = "sim")]
    pub unit_map: Option<String>,

    /// Resource file exposing the complex (PCI BAR or /dev/mem).
    #[arg(short = 'R', long = "resource", requires = "unit_map")]
    pub resource: Option<String>,

    #[arg(long = "resource-offset", default_value_t = 0, value_parser = maybe_hex::<u64>)]
    pub resource_offset: u64,

    #[arg(long = "window-size", default_value_t = 0x0100_0000, value_parser = maybe_hex::<u64>)]
    pub window_size: u64,
}

/// An opened complex. `sim` is set when it is simulated.
pub struct Session {
    pub pmdt: Pmdt,
    pub sim: Option<Arc<SimComplex>>,
}

impl BackendArgs {
    pub fn open(&self) -> Result<Session> {
        if self.sim {
            let map = demo_map(self.revision, self.sim_units);
            let sim = SimComplex::new(&map, SimUnitSpec::default());
            return Ok(Session {
                pmdt: Pmdt::new(map, sim.clone()),
                sim: Some(sim),
            });
        }
        let Some(path) = &self.unit_map else {
            return Err(invalid("unit map", "either --sim or --unit-map is required"));
        };
        let map = UnitMap::load(path)?;
        let Some(resource) = &self.resource else {
            return Err(invalid("resource", "hardware access needs --resource"));
        };
        let window = MmioWindow::open(Path::new(resource), self.resource_offset, 0, self.window_size as usize)?;
        Ok(Session {
            pmdt: Pmdt::new(map, Arc::new(window)),
            sim: None,
        })
    }
}

/// Features of one unit, as flags.
#[derive(Args, Debug, Clone)]
pub struct FeatureArgs {
    /// Flag transactions outstanding longer than this many nanoseconds.
    #[arg(long = "timeout-ns", value_parser = maybe_hex::<u64>)]
    pub timeout_ns: Option<u64>,

    #[arg(long = "timeout-dir", value_enum, default_value_t = DirArg::Read)]
    pub timeout_dir: DirArg,

    /// Latency histogram on the given direction.
    #[arg(long = "histogram", value_enum)]
    pub histogram: Option<DirArg>,

    /// Five non-decreasing bin boundaries in nanoseconds.
    #[arg(long = "bars", value_delimiter = ',', default_values_t = [0u64, 100, 200, 300, 400])]
    pub bars: Vec<u64>,

    /// Hit count per bin that raises a violation.
    #[arg(long = "bin-limit", value_delimiter = ',')]
    pub bin_limits: Vec<u64>,

    /// Evaluate histogram and track counts once per window.
    #[arg(long = "window-us")]
    pub window_us: Option<u64>,

    /// Trap the first transaction matching the tracker pattern.
    #[arg(long = "trap", value_enum)]
    pub trap: Option<DirArg>,

    /// Keep matching transactions per window within --low..--high.
    #[arg(long = "track", value_enum, requires = "window_us")]
    pub track: Option<DirArg>,

    #[arg(short = 'a', long = "address", default_value_t = 0, value_parser = maybe_hex::<u64>)]
    pub address: u64,

    #[arg(long = "address-mask", default_value_t = u64::MAX, value_parser = maybe_hex::<u64>)]
    pub address_mask: u64,

    #[arg(long = "id", value_parser = maybe_hex::<u16>)]
    pub id: Option<u16>,

    #[arg(long = "low", default_value_t = 0)]
    pub low: u64,

    #[arg(long = "high", default_value_t = u64::MAX)]
    pub high: u64,

    /// Capture trapped or tracked transactions in trace memory.
    #[arg(long = "trace")]
    pub trace: bool,
}

impl FeatureArgs {
    pub fn request(&self) -> Result<UnitRequest> {
        let pattern = TrackerPattern {
            address: self.address,
            address_mask: self.address_mask,
            id: self.id,
        };
        let histogram = match self.histogram {
            Some(dir) => {
                let bars_ns: [u64; 5] = self
                    .bars
                    .as_slice()
                    .try_into()
                    .map_err(|_| invalid("bars", "exactly five bin boundaries are needed"))?;
                let mut bin_limits = [None; 5];
                if !self.bin_limits.is_empty() {
                    if self.bin_limits.len() != 5 {
                        return Err(invalid("bin limits", "exactly five limits are needed"));
                    }
                    for (l, v) in bin_limits.iter_mut().zip(&self.bin_limits) {
                        *l = Some(*v);
                    }
                }
                Some(HistogramFeature {
                    direction: dir.into(),
                    bars_ns,
                    window_us: self.window_us,
                    bin_limits,
                })
            }
            None => None,
        };
        let track = match (self.track, self.window_us) {
            (Some(dir), Some(window_us)) => Some(TrackFeature {
                direction: dir.into(),
                pattern,
                window_us,
                low: self.low,
                high: self.high,
                trace: self.trace,
            }),
            (Some(_), None) => return Err(invalid("track", "tracking needs --window-us")),
            _ => None,
        };
        Ok(UnitRequest {
            timeout: self.timeout_ns.map(|timeout_ns| TimeoutFeature {
                direction: self.timeout_dir.into(),
                timeout_ns,
            }),
            histogram,
            trap: self.trap.map(|dir| TrapFeature {
                direction: dir.into(),
                pattern,
                trace: self.trace,
            }),
            track,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        backend: BackendArgs,
        #[command(flatten)]
        features: FeatureArgs,
    }

    #[test]
    fn histogram_flags_build_a_request() {
        let cli = Cli::try_parse_from([
            "t",
            "--sim",
            "--histogram",
            "write",
            "--bars",
            "10,20,30,40,50",
            "--timeout-ns",
            "0x100",
            "--timeout-dir",
            "write",
        ])
        .unwrap();
        let req = cli.features.request().unwrap();
        assert_eq!(
            req.histogram,
            Some(HistogramFeature {
                direction: DirectionReq::Write,
                bars_ns: [10, 20, 30, 40, 50],
                window_us: None,
                bin_limits: [None; 5],
            })
        );
        assert_eq!(req.timeout.map(|t| t.timeout_ns), Some(256));
        assert!(req.trap.is_none() && req.track.is_none());
    }

    #[test]
    fn trap_uses_the_tracker_pattern() {
        let cli = Cli::try_parse_from([
            "t",
            "--sim",
            "--trap",
            "read",
            "-a",
            "0x1000",
            "--address-mask",
            "0xfffffff0",
            "--trace",
        ])
        .unwrap();
        let trap = cli.features.request().unwrap().trap.unwrap();
        assert_eq!(trap.pattern.address, 0x1000);
        assert_eq!(trap.pattern.address_mask, 0xffff_fff0);
        assert!(trap.trace);
    }

    #[test]
    fn track_without_window_is_rejected_by_clap() {
        assert!(Cli::try_parse_from(["t", "--sim", "--track", "read"]).is_err());
    }

    #[test]
    fn hardware_needs_a_unit_map() {
        assert!(Cli::try_parse_from(["t"]).is_err());
    }

    #[test]
    fn sim_session_opens() {
        let cli = Cli::try_parse_from(["t", "--sim", "--sim-units", "2", "--revision", "rev-a"]).unwrap();
        let session = cli.backend.open().unwrap();
        assert!(session.sim.is_some());
        assert_eq!(session.pmdt.map().len(), 2);
        assert_eq!(session.pmdt.revision().tag(), RevisionTag::RevA);
    }
}
