//! Stand-ins for the afl++ runtime and the fuzz target

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{self, Read};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::ptr;

use tempfile::NamedTempFile;

use crate::config::DriverConfig;
use crate::harness::{Capabilities, Harness};
use crate::redirect::OutputRedirector;
use crate::runtime::EngineRuntime;
use crate::Setup;

/// Grants up to `budget` persistent-loop iterations, like an afl++ runtime that re-forks
/// after `budget` inputs
pub struct MockRuntime {
    map: *mut u8,
    budget: usize,
    granted: usize,
    pub manual_inits: usize,
    pub map_at_manual_init: Option<*mut u8>,
    pub sharedmem_fuzzing: bool,
    pub bounds_seen: Vec<u32>,
}

impl MockRuntime {
    pub fn with_budget(budget: usize) -> Self {
        Self {
            map: ptr::null_mut(),
            budget,
            granted: 0,
            manual_inits: 0,
            map_at_manual_init: None,
            sharedmem_fuzzing: true,
            bounds_seen: Vec::new(),
        }
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::with_budget(0)
    }
}

impl EngineRuntime for MockRuntime {
    fn publish_coverage_map(&mut self, map: *mut u8) {
        self.map = map;
    }

    fn coverage_map(&self) -> *mut u8 {
        self.map
    }

    fn set_sharedmem_fuzzing(&mut self, enabled: bool) {
        self.sharedmem_fuzzing = enabled;
    }

    fn manual_init(&mut self) {
        self.manual_inits += 1;
        self.map_at_manual_init = Some(self.map);
    }

    fn persistent_loop(&mut self, max_iterations: u32) -> bool {
        self.bounds_seen.push(max_iterations);
        if self.granted < self.budget && self.granted < max_iterations as usize {
            self.granted += 1;
            true
        } else {
            false
        }
    }
}

type InitializeHook = Box<dyn FnMut(&mut Vec<OsString>) -> i32>;

/// Remembers every input it was run on
pub struct RecordingHarness {
    ret: i32,
    on_initialize: Option<InitializeHook>,
    pub inputs: Vec<Vec<u8>>,
    /// Number of inputs already run when the one-time setup happened
    pub initialized_after: Option<usize>,
}

impl RecordingHarness {
    pub fn returning(ret: i32) -> Self {
        Self {
            ret,
            on_initialize: None,
            inputs: Vec::new(),
            initialized_after: None,
        }
    }

    /// Give the target a one-time setup hook
    pub fn with_initialize<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&mut Vec<OsString>) -> i32 + 'static,
    {
        self.on_initialize = Some(Box::new(hook));
        self
    }
}

impl Harness for RecordingHarness {
    fn test_one_input(&mut self, data: &[u8]) -> i32 {
        self.inputs.push(data.to_vec());
        self.ret
    }

    fn has_initialize(&self) -> bool {
        self.on_initialize.is_some()
    }

    fn initialize(&mut self, args: &mut Vec<OsString>) -> Option<i32> {
        let hook = self.on_initialize.as_mut()?;
        self.initialized_after = Some(self.inputs.len());
        Some(hook(args))
    }
}

/// A fresh descriptor onto `file`, standing in for stdout or stderr
pub fn scratch_fd(file: &NamedTempFile) -> RawFd {
    file.reopen().expect("failed to reopen scratch file").into_raw_fd()
}

/// Startup settings that leave the test process's own streams alone
pub fn quiet_setup(stderr: &NamedTempFile) -> Setup {
    Setup {
        config: DriverConfig::default(),
        redirector: OutputRedirector::new(-1, scratch_fd(stderr)),
        caps: Capabilities::default(),
    }
}

pub fn os_args(args: &[&str]) -> Vec<OsString> {
    args.iter().map(OsString::from).collect()
}

/// Hands out one chunk per `read`, the way afl-fuzz delivers one input per read(2)
pub struct ChunkReader {
    chunks: VecDeque<Vec<u8>>,
}

impl ChunkReader {
    pub fn new<I: IntoIterator<Item = Vec<u8>>>(chunks: I) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.chunks.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }
}
