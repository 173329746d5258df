use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::constants::*;

/// Bitmask from `AFL_DRIVER_CLOSE_FD_MASK`, modeled after libFuzzer's `-close_fd_mask`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseMask(u8);

impl CloseMask {
    pub const STDOUT: u8 = 1;
    pub const STDERR: u8 = 2;

    pub fn new(bits: u8) -> Self {
        Self(bits & (Self::STDOUT | Self::STDERR))
    }

    pub fn closes_stdout(self) -> bool {
        self.0 & Self::STDOUT != 0
    }

    pub fn closes_stderr(self) -> bool {
        self.0 & Self::STDERR != 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    /// Append diagnostics to this file instead of wherever stderr pointed at startup
    pub stderr_duplicate: Option<PathBuf>,
    pub close_fd_mask: CloseMask,
    /// Keep the placeholder map and never call `__afl_manual_init()`
    pub skip_handoff: bool,
}

impl DriverConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var_os(key))
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let close_fd_mask = match lookup(ENV_CLOSE_FD_MASK) {
            // Anything outside 0..=3 only has its low two bits looked at
            Some(mask) => CloseMask::new(atoi(&mask.to_string_lossy()) as u8),
            None => CloseMask::default(),
        };

        Self {
            stderr_duplicate: lookup(ENV_STDERR_DUPLICATE_FILENAME).map(PathBuf::from),
            close_fd_mask,
            skip_handoff: lookup(ENV_DISABLE_INSTRUMENTATION).is_some(),
        }
    }
}

/// C `atoi()`: optional sign followed by leading decimal digits. Garbage parses as 0.
pub fn atoi(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let mut val: i64 = 0;
    for c in digits.bytes().take_while(u8::is_ascii_digit) {
        val = val.saturating_mul(10).saturating_add(i64::from(c - b'0'));
    }

    if negative {
        -val
    } else {
        val
    }
}

#[test]
fn test_atoi() {
    assert_eq!(atoi("1000"), 1000);
    assert_eq!(atoi("  42abc"), 42);
    assert_eq!(atoi("-7"), -7);
    assert_eq!(atoi("+3"), 3);
    assert_eq!(atoi("runs=100"), 0);
    assert_eq!(atoi(""), 0);
    assert_eq!(atoi("99999999999999999999999"), i64::MAX);
}

#[test]
fn test_config_from_lookup() {
    use std::collections::HashMap;

    let mut vars = HashMap::new();
    vars.insert(ENV_CLOSE_FD_MASK, OsString::from("3"));
    vars.insert(ENV_STDERR_DUPLICATE_FILENAME, OsString::from("/tmp/driver.log"));
    vars.insert(ENV_DISABLE_INSTRUMENTATION, OsString::from("1"));

    let config = DriverConfig::from_lookup(|k| vars.get(k).cloned());
    assert!(config.close_fd_mask.closes_stdout());
    assert!(config.close_fd_mask.closes_stderr());
    assert_eq!(config.stderr_duplicate, Some(PathBuf::from("/tmp/driver.log")));
    assert!(config.skip_handoff);

    let config = DriverConfig::from_lookup(|_| None);
    assert_eq!(config.close_fd_mask, CloseMask::default());
    assert!(config.stderr_duplicate.is_none());
    assert!(!config.skip_handoff);
}

#[test]
fn test_close_mask_bits() {
    let mask = DriverConfig::from_lookup(|k| {
        if k == ENV_CLOSE_FD_MASK {
            Some(OsString::from("2"))
        } else {
            None
        }
    })
    .close_fd_mask;
    assert!(!mask.closes_stdout());
    assert!(mask.closes_stderr());

    assert_eq!(CloseMask::new(0xfd), CloseMask::new(1));
}
