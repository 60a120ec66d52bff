use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use regex::Regex;

use crate::libs::common::hex_parser;
use crate::libs::error::{PmdtError, Result};
use crate::libs::regs::cctm::MAX_UNITS;
use crate::libs::revision::RevisionTag;

/// One monitored hardware unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDesc {
    pub id: u8,
    pub name: String,
    pub base: u64,
    pub bus: String,
    pub clock_hz: u64,
    pub cctm_bit: u8,
}

impl fmt::Display for UnitDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}({})", self.id, self.name)
    }
}

/// Which logical unit sits at which base address, on which bus, at which
/// clock, and which matrix bit it owns. Built in code or read from a text
/// file:
///
/// ```text
/// # comment
/// revision b
/// cctm 0x00F00000
/// unit 0 ddr0  base=0x00100000 bus=noc0 clock=800000000 cctm=0
/// unit 1 eth0  base=0x00120000 bus=noc1 clock=500000000 cctm=1
/// ```
#[derive(Debug, Clone)]
pub struct UnitMap {
    pub revision: RevisionTag,
    pub cctm_base: u64,
    units: BTreeMap<u8, UnitDesc>,
}

impl UnitMap {
    pub fn new(revision: RevisionTag, cctm_base: u64) -> Self {
        UnitMap {
            revision,
            cctm_base,
            units: BTreeMap::new(),
        }
    }

    /// Adds a unit, rejecting duplicate ids and matrix bits.
    pub fn add(&mut self, desc: UnitDesc) -> Result<()> {
        if desc.cctm_bit >= MAX_UNITS {
            return Err(PmdtError::OutOfRange {
                what: "cross-trigger bit",
                index: desc.cctm_bit as usize,
                limit: MAX_UNITS as usize,
            });
        }
        if desc.clock_hz == 0 {
            return Err(PmdtError::InvalidField {
                field: "clock",
                reason: format!("unit {} has a zero clock", desc.id),
            });
        }
        if self.units.contains_key(&desc.id) {
            return Err(PmdtError::InvalidField {
                field: "unit id",
                reason: format!("unit {} listed twice", desc.id),
            });
        }
        if let Some(other) = self.by_cctm_bit(desc.cctm_bit) {
            return Err(PmdtError::InvalidField {
                field: "cross-trigger bit",
                reason: format!("bit {} already owned by {}", desc.cctm_bit, other),
            });
        }
        self.units.insert(desc.id, desc);
        Ok(())
    }

    pub fn get(&self, id: u8) -> Result<&UnitDesc> {
        self.units.get(&id).ok_or(PmdtError::UnknownUnit(id))
    }

    pub fn by_cctm_bit(&self, bit: u8) -> Option<&UnitDesc> {
        self.units.values().find(|u| u.cctm_bit == bit)
    }

    pub fn units(&self) -> impl Iterator<Item = &UnitDesc> {
        self.units.values()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses the text form shown in the module documentation.
    pub fn parse(text: &str) -> Result<Self> {
        let revision_re = Regex::new(r"^revision\s+(\S+)$").map_err(regex_err)?;
        let cctm_re = Regex::new(r"^cctm\s+(0[xX][0-9a-fA-F_]+|\d+)$").map_err(regex_err)?;
        let unit_re = Regex::new(
            r"^unit\s+(\d+)\s+(\w+)\s+base=(0[xX][0-9a-fA-F_]+|\d+)\s+bus=(\w+)\s+clock=(\d+)\s+cctm=(\d+)$",
        )
        .map_err(regex_err)?;

        let mut revision = None;
        let mut cctm_base = None;
        let mut units = Vec::new();

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            if let Some(caps) = revision_re.captures(line) {
                revision = Some(caps[1].parse::<RevisionTag>().map_err(|reason| {
                    PmdtError::UnitMap {
                        line: line_no,
                        reason,
                    }
                })?);
            } else if let Some(caps) = cctm_re.captures(line) {
                cctm_base = Some(number(&caps[1], line_no)?);
            } else if let Some(caps) = unit_re.captures(line) {
                let id = small(number(&caps[1], line_no)?, "unit id", line_no)?;
                let cctm_bit = small(number(&caps[6], line_no)?, "cctm bit", line_no)?;
                units.push((
                    line_no,
                    UnitDesc {
                        id,
                        name: caps[2].to_string(),
                        base: number(&caps[3], line_no)?,
                        bus: caps[4].to_string(),
                        clock_hz: number(&caps[5], line_no)?,
                        cctm_bit,
                    },
                ));
            } else {
                return Err(PmdtError::UnitMap {
                    line: line_no,
                    reason: format!("unrecognised entry '{}'", line),
                });
            }
        }

        let revision = revision.ok_or(PmdtError::UnitMap {
            line: 0,
            reason: "missing 'revision' entry".to_string(),
        })?;
        let cctm_base = cctm_base.ok_or(PmdtError::UnitMap {
            line: 0,
            reason: "missing 'cctm' entry".to_string(),
        })?;

        let mut map = UnitMap::new(revision, cctm_base);
        for (line, desc) in units {
            map.add(desc).map_err(|e| PmdtError::UnitMap {
                line,
                reason: e.to_string(),
            })?;
        }
        Ok(map)
    }
}

fn regex_err(e: regex::Error) -> PmdtError {
    PmdtError::UnitMap {
        line: 0,
        reason: e.to_string(),
    }
}

fn number(s: &str, line: usize) -> Result<u64> {
    hex_parser(s).map_err(|e| PmdtError::UnitMap {
        line,
        reason: format!("bad number '{}': {}", s, e),
    })
}

fn small(v: u64, what: &str, line: usize) -> Result<u8> {
    u8::try_from(v).map_err(|_| PmdtError::UnitMap {
        line,
        reason: format!("{} {} does not fit in 8 bits", what, v),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "\
# two units on rev-b
revision b
cctm 0x00F00000

unit 0 ddr0 base=0x00100000 bus=noc0 clock=800000000 cctm=0   # memory
unit 4 eth0 base=0x00120000 bus=noc1 clock=500000000 cctm=1
";

    #[test]
    fn parses_sample_map() {
        let map = UnitMap::parse(SAMPLE).unwrap();
        assert_eq!(map.revision, RevisionTag::RevB);
        assert_eq!(map.cctm_base, 0x00F0_0000);
        assert_eq!(map.len(), 2);
        assert_eq!(
            map.get(4).unwrap(),
            &UnitDesc {
                id: 4,
                name: "eth0".to_string(),
                base: 0x0012_0000,
                bus: "noc1".to_string(),
                clock_hz: 500_000_000,
                cctm_bit: 1,
            }
        );
        assert_eq!(map.by_cctm_bit(1).unwrap().id, 4);
    }

    #[test]
    fn rejects_unknown_lines_with_line_number() {
        let err = UnitMap::parse("revision a\ncctm 0\nbogus\n").unwrap_err();
        match err {
            PmdtError::UnitMap { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_shared_cctm_bit() {
        let text = "revision a\ncctm 0\n\
                    unit 0 a base=0 bus=x clock=1 cctm=2\n\
                    unit 1 b base=0x1000 bus=x clock=1 cctm=2\n";
        assert!(matches!(UnitMap::parse(text), Err(PmdtError::UnitMap { line: 4, .. })));
    }

    #[test]
    fn requires_revision_and_matrix() {
        assert!(UnitMap::parse("cctm 0\n").is_err());
        assert!(UnitMap::parse("revision a\n").is_err());
    }

    #[test]
    fn unknown_unit_is_reported() {
        let map = UnitMap::new(RevisionTag::RevA, 0);
        assert!(matches!(map.get(9), Err(PmdtError::UnknownUnit(9))));
    }
}
