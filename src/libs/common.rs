use std::num::ParseIntError;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::libs::error::{PmdtError, Result};

/// Default interval between two samples of a polled completion flag.
pub const POLL_INTERVAL: Duration = Duration::from_micros(10);

/// Default deadline for hardware operations that acknowledge through a flag.
pub const POLL_DEADLINE: Duration = Duration::from_millis(10);

/// Validates the path of a unit-map file given on the command line.
///
/// Used as a `clap` value parser, so it returns a plain `String` error that
/// clap prints verbatim.
///
/// # Errors
///
/// - The file does not exist.
/// - The path names a directory.
pub fn validate_unit_map_path(path: &str) -> std::result::Result<String, String> {
    let p = Path::new(path);
    if !p.exists() {
        return Err(format!("No such unit map: {}", path));
    }
    if p.is_dir() {
        return Err(format!("Unit map {} is a directory", path));
    }
    Ok(path.to_string())
}

/// Parses a string representation of a hexadecimal or decimal number.
///
/// This function attempts to parse the input string as a hexadecimal number if it
/// starts with "0x" or "0X". If it does not, it tries to parse it as a decimal
/// integer. Underscores are accepted as digit separators.
pub fn hex_parser(s: &str) -> std::result::Result<u64, ParseIntError> {
    let cleaned: String = s.chars().filter(|c| *c != '_').collect();
    if let Some(hex) = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16)
    } else {
        cleaned.parse::<u64>()
    }
}

/// Polls `condition` every `interval` until it returns `true` or `deadline`
/// has elapsed.
///
/// The condition is always sampled at least once, and once more after the
/// deadline, so a flag that sets during the final sleep is not missed.
///
/// # Errors
///
/// Returns [`PmdtError::Timeout`] naming `what` if the condition never held.
pub fn poll_until<F>(interval: Duration, deadline: Duration, what: &'static str, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        let waited = start.elapsed();
        if waited >= deadline {
            return if condition() {
                Ok(())
            } else {
                Err(PmdtError::Timeout { what, waited })
            };
        }
        thread::sleep(interval.min(deadline - waited));
    }
}

/// Converts a duration in nanoseconds into cycles of a clock running at
/// `clock_hz`, rounding up so a bound is never shortened.
pub fn ns_to_cycles(ns: u64, clock_hz: u64) -> u64 {
    let cycles = (ns as u128 * clock_hz as u128).div_ceil(1_000_000_000);
    cycles.min(u64::MAX as u128) as u64
}

/// Converts microseconds into cycles of a clock running at `clock_hz`.
pub fn us_to_cycles(us: u64, clock_hz: u64) -> u64 {
    ns_to_cycles(us.saturating_mul(1000), clock_hz)
}

/// Builds a bit mask from a list of bit positions.
pub fn mask_of<I: IntoIterator<Item = u8>>(bits: I) -> u64 {
    bits.into_iter().fold(0u64, |m, b| m | (1u64 << b))
}

/// Iterates the positions of the set bits of `mask`, lowest first.
pub fn bits_of(mask: u64) -> impl Iterator<Item = u8> {
    (0..64u8).filter(move |b| mask & (1u64 << b) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn hex_parser_accepts_both_radixes() {
        assert_eq!(hex_parser("0x1000").unwrap(), 0x1000);
        assert_eq!(hex_parser("0XFFFF_FFF0").unwrap(), 0xFFFF_FFF0);
        assert_eq!(hex_parser("150").unwrap(), 150);
        assert!(hex_parser("0xZZ").is_err());
    }

    #[test]
    fn poll_until_returns_once_condition_holds() {
        let calls = Cell::new(0);
        poll_until(Duration::from_micros(1), Duration::from_secs(1), "flag", || {
            calls.set(calls.get() + 1);
            calls.get() == 3
        })
        .unwrap();
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn poll_until_times_out() {
        let err = poll_until(Duration::from_micros(50), Duration::from_micros(200), "stuck flag", || false)
            .unwrap_err();
        match err {
            PmdtError::Timeout { what, waited } => {
                assert_eq!(what, "stuck flag");
                assert!(waited >= Duration::from_micros(200));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn cycle_conversion_rounds_up() {
        assert_eq!(ns_to_cycles(100, 1_000_000_000), 100);
        assert_eq!(ns_to_cycles(1, 400_000_000), 1);
        assert_eq!(ns_to_cycles(150, 800_000_000), 120);
        assert_eq!(us_to_cycles(2, 100_000_000), 200);
    }

    #[test]
    fn masks_round_trip_positions() {
        let m = mask_of([0, 3, 63]);
        assert_eq!(m, 0x8000_0000_0000_0009);
        assert_eq!(bits_of(m).collect::<Vec<_>>(), vec![0, 3, 63]);
    }
}
