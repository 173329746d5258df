use std::convert::TryFrom;
use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::ptr;

use anyhow::{bail, Result};
use libc::c_void;
use log::{debug, info};

use crate::args::ExecutionContext;
use crate::config::DriverConfig;
use crate::constants::*;
use crate::forkserver::Bootstrap;
use crate::harness::Harness;
use crate::logging;
use crate::replay::execute_files_one_by_one;
use crate::runtime::EngineRuntime;
use crate::Setup;

// Referenced through volatile reads so the signatures survive into the final binary
#[used]
static PERSISTENT_SIGNATURE: &[u8] = PERSISTENT_MARKER;
#[used]
static DEFER_SIGNATURE: &[u8] = DEFER_MARKER;

/// The input of the warmup run. Only its first byte ever reaches the harness.
pub struct ProbeInput([u8; PROBE_INPUT_SIZE]);

impl ProbeInput {
    pub fn new() -> Self {
        let mut bytes = [0; PROBE_INPUT_SIZE];
        let persistent = unsafe { ptr::read_volatile(&PERSISTENT_SIGNATURE) };
        let defer = unsafe { ptr::read_volatile(&DEFER_SIGNATURE) };

        bytes[..persistent.len()].copy_from_slice(persistent);
        bytes[PROBE_DEFER_OFFSET..PROBE_DEFER_OFFSET + defer.len()].copy_from_slice(defer);

        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn warmup_slice(&self) -> &[u8] {
        &self.0[..1]
    }
}

impl Default for ProbeInput {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    /// Output redirected, target set up, mode known
    Bootstrapped,
    WarmupRun,
    Looping,
    Draining,
    Exit,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub warmup_runs: usize,
    /// Inputs the harness was run on
    pub executions: usize,
    /// Iterations afl++ granted, including ones that delivered no input
    pub iterations: usize,
}

/// Drives the target from `main` on: set up, then run every input afl-fuzz sends until
/// `__afl_persistent_loop()` says to stop.
///
/// afl++ decides when to re-fork; the driver only passes the bound along.
pub struct PersistentLoop<'a, R: EngineRuntime, H: Harness> {
    runtime: &'a mut R,
    harness: &'a mut H,
    phase: Phase,
}

impl<'a, R: EngineRuntime, H: Harness> PersistentLoop<'a, R, H> {
    pub fn new(runtime: &'a mut R, harness: &'a mut H) -> Self {
        Self {
            runtime,
            harness,
            phase: Phase::Start,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        debug!("persistent loop: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    fn expect_phase(&self, phase: Phase) -> Result<()> {
        if self.phase != phase {
            bail!("Driver is in {:?}, expected {:?}", self.phase, phase);
        }

        Ok(())
    }

    /// Redirect output, start logging and run the target's one-time setup, then work out
    /// what to do from the arguments the setup left behind.
    ///
    /// `args` include the program name.
    pub fn bootstrap(
        &mut self,
        bootstrap: &Bootstrap,
        setup: &Setup,
        mut args: Vec<OsString>,
    ) -> Result<ExecutionContext> {
        self.expect_phase(Phase::Start)?;

        let binding = setup.redirector.apply(&setup.config, &setup.caps)?;
        logging::init(&binding)?;
        bootstrap.report();

        if self.harness.has_initialize() {
            info!("Running LLVMFuzzerInitialize ...");
        }
        if let Some(rc) = self.harness.initialize(&mut args) {
            info!("LLVMFuzzerInitialize returned {}, continuing", rc);
        }

        let ctx = ExecutionContext::resolve(&args);
        self.runtime.set_sharedmem_fuzzing(ctx.sharedmem_fuzzing);
        self.enter(Phase::Bootstrapped);

        Ok(ctx)
    }

    /// Run each file once instead of looping. afl++ is still told init is done.
    pub fn replay<W: Write>(
        &mut self,
        bootstrap: &mut Bootstrap,
        inputs: &[PathBuf],
        out: &mut W,
    ) -> Result<usize> {
        self.expect_phase(Phase::Bootstrapped)?;

        bootstrap.hand_off(&mut *self.runtime)?;
        let executed = execute_files_one_by_one(&mut *self.harness, inputs, out)?;
        self.enter(Phase::Exit);

        Ok(executed)
    }

    /// Panics if `bound` is not positive
    pub fn run<I: Read>(
        &mut self,
        bound: i64,
        bootstrap: &mut Bootstrap,
        config: &DriverConfig,
        input: &mut I,
    ) -> Result<LoopStats> {
        assert!(bound > 0, "iteration bound must be positive, got {}", bound);
        let bound = u32::try_from(bound).unwrap_or(u32::MAX);
        self.expect_phase(Phase::Bootstrapped)?;

        let mut stats = LoopStats::default();

        self.enter(Phase::WarmupRun);
        if !config.skip_handoff {
            bootstrap.hand_off(&mut *self.runtime)?;
        }
        info!("dummy map is now at {:p}", self.runtime.coverage_map());

        // Coverage from the target's first-run initialization is attributed to this run
        // instead of to a real input
        let probe = ProbeInput::new();
        let _ = self.harness.test_one_input(probe.warmup_slice());
        stats.warmup_runs += 1;

        self.enter(Phase::Looping);
        let mut buf = vec![0; STDIN_BUF_SIZE];
        while self.runtime.persistent_loop(bound) {
            stats.iterations += 1;

            match input.read(&mut buf) {
                Ok(0) => (),
                Ok(n) => {
                    self.harness.test_one_input(&buf[..n]);
                    stats.executions += 1;
                }
                Err(e) => debug!("failed to read input: {}", e),
            }
        }

        self.enter(Phase::Draining);
        debug!(
            "ran {} inputs over {} iterations",
            stats.executions, stats.iterations
        );
        self.enter(Phase::Exit);

        Ok(stats)
    }
}

/// Unbuffered stdin: every `read` is exactly one read(2), so one afl-fuzz input is never
/// split across or merged with the next
pub struct RawStdin;

impl Read for RawStdin {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(libc::STDIN_FILENO, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(n as usize)
    }
}

#[test]
fn test_probe_markers() {
    let probe = ProbeInput::new();
    let bytes = probe.as_bytes();

    assert_eq!(bytes.len(), 64);
    assert_eq!(&bytes[..23], b"##SIG_AFL_PERSISTENT##\0");
    assert_eq!(&bytes[32..58], b"##SIG_AFL_DEFER_FORKSRV##\0");
    assert!(bytes[23..32].iter().all(|&b| b == 0));
    assert!(bytes[58..].iter().all(|&b| b == 0));

    assert_eq!(probe.warmup_slice(), b"#");
}

#[test]
fn test_loop_respects_bound() {
    use tempfile::NamedTempFile;

    use crate::forkserver::DeferPolicy;
    use crate::testutil::{os_args, quiet_setup, ChunkReader, MockRuntime, RecordingHarness};

    let stderr = NamedTempFile::new().expect("failed to create temporary file");
    let setup = quiet_setup(&stderr);
    let mut runtime = MockRuntime::with_budget(100);
    let mut harness = RecordingHarness::returning(-1);
    let mut input = ChunkReader::new((0..100).map(|i| vec![i as u8; i + 1]));
    let mut bootstrap = Bootstrap::establish_placeholder(DeferPolicy::from_override(true), &mut runtime);

    let mut driver = PersistentLoop::new(&mut runtime, &mut harness);
    assert_eq!(driver.phase(), Phase::Start);
    driver
        .bootstrap(&bootstrap, &setup, os_args(&["driver", "-5"]))
        .expect("bootstrap failed");
    assert_eq!(driver.phase(), Phase::Bootstrapped);

    let stats = driver
        .run(5, &mut bootstrap, &setup.config, &mut input)
        .expect("loop failed");
    assert_eq!(driver.phase(), Phase::Exit);

    assert_eq!(stats.warmup_runs, 1);
    assert_eq!(stats.executions, 5);
    assert_eq!(harness.inputs.len(), 6);
    assert_eq!(harness.inputs[0], b"#".to_vec());
    assert_eq!(harness.inputs[1], vec![0]);
    assert_eq!(harness.inputs[5], vec![4; 5]);

    assert_eq!(runtime.bounds_seen, vec![5; 6]);
    assert_eq!(runtime.manual_inits, 1);
    assert!(bootstrap.handed_off());
    assert!(runtime.coverage_map().is_null());
}

#[cfg(test)]
#[test_log::test]
fn test_engine_stops_early() {
    use tempfile::NamedTempFile;

    use crate::forkserver::DeferPolicy;
    use crate::testutil::{os_args, quiet_setup, ChunkReader, MockRuntime, RecordingHarness};

    let stderr = NamedTempFile::new().expect("failed to create temporary file");
    let setup = quiet_setup(&stderr);
    // afl++ only grants three iterations, two of which deliver nothing
    let mut runtime = MockRuntime::with_budget(3);
    let mut harness = RecordingHarness::returning(0);
    let mut input = ChunkReader::new(vec![vec![], b"abc".to_vec(), vec![]]);
    let mut bootstrap = Bootstrap::establish_placeholder(DeferPolicy::from_override(true), &mut runtime);

    let mut driver = PersistentLoop::new(&mut runtime, &mut harness);
    driver
        .bootstrap(&bootstrap, &setup, os_args(&["driver"]))
        .expect("bootstrap failed");
    let stats = driver
        .run(UNBOUNDED_ITERATIONS, &mut bootstrap, &setup.config, &mut input)
        .expect("loop failed");

    assert_eq!(stats.iterations, 3);
    assert_eq!(stats.executions, 1);
    assert_eq!(harness.inputs, vec![b"#".to_vec(), b"abc".to_vec()]);
    assert_eq!(runtime.bounds_seen[0], i32::MAX as u32);
}

#[test]
fn test_skip_handoff_keeps_placeholder() {
    use tempfile::NamedTempFile;

    use crate::forkserver::DeferPolicy;
    use crate::testutil::{os_args, quiet_setup, ChunkReader, MockRuntime, RecordingHarness};

    let stderr = NamedTempFile::new().expect("failed to create temporary file");
    let mut setup = quiet_setup(&stderr);
    setup.config.skip_handoff = true;
    let mut runtime = MockRuntime::with_budget(1);
    let mut harness = RecordingHarness::returning(0);
    let mut input = ChunkReader::new(vec![b"x".to_vec()]);
    let mut bootstrap = Bootstrap::establish_placeholder(DeferPolicy::from_override(true), &mut runtime);
    let placeholder = runtime.coverage_map();
    assert!(!placeholder.is_null());

    let mut driver = PersistentLoop::new(&mut runtime, &mut harness);
    driver
        .bootstrap(&bootstrap, &setup, os_args(&["driver", "-10"]))
        .expect("bootstrap failed");
    driver
        .run(10, &mut bootstrap, &setup.config, &mut input)
        .expect("loop failed");

    // Warmup still happens
    assert_eq!(harness.inputs.len(), 2);
    assert_eq!(runtime.manual_inits, 0);
    assert_eq!(runtime.coverage_map(), placeholder);
    assert!(!bootstrap.handed_off());
}

#[test]
fn test_loop_needs_bootstrap() {
    use crate::forkserver::DeferPolicy;
    use crate::testutil::{ChunkReader, MockRuntime, RecordingHarness};

    let mut runtime = MockRuntime::with_budget(1);
    let mut harness = RecordingHarness::returning(0);
    let mut bootstrap = Bootstrap::establish_placeholder(DeferPolicy::from_override(true), &mut runtime);

    let mut driver = PersistentLoop::new(&mut runtime, &mut harness);
    let res = driver.run(
        1,
        &mut bootstrap,
        &DriverConfig::default(),
        &mut ChunkReader::new(vec![b"x".to_vec()]),
    );
    assert!(res.is_err());
    assert_eq!(driver.phase(), Phase::Start);
    assert!(harness.inputs.is_empty());
    assert_eq!(runtime.manual_inits, 0);

    bootstrap.hand_off(&mut runtime).expect("hand off failed");
}

#[test]
fn test_setup_hook_runs_before_resolution() {
    use tempfile::NamedTempFile;

    use crate::args::Mode;
    use crate::forkserver::DeferPolicy;
    use crate::testutil::{os_args, quiet_setup, MockRuntime, RecordingHarness};

    let stderr = NamedTempFile::new().expect("failed to create temporary file");
    let setup = quiet_setup(&stderr);
    let mut runtime = MockRuntime::with_budget(0);
    let mut harness = RecordingHarness::returning(0).with_initialize(|args| {
        args.truncate(1);
        args.push("-25".into());
        7
    });
    let mut bootstrap = Bootstrap::establish_placeholder(DeferPolicy::from_override(true), &mut runtime);

    let ctx = PersistentLoop::new(&mut runtime, &mut harness)
        .bootstrap(&bootstrap, &setup, os_args(&["driver", "crash-1", "crash-2"]))
        .expect("bootstrap failed");

    assert_eq!(ctx.mode, Mode::Persistent { bound: 25 });
    assert_eq!(harness.initialized_after, Some(0));
    assert!(!runtime.sharedmem_fuzzing);

    bootstrap.hand_off(&mut runtime).expect("hand off failed");
}

#[cfg(test)]
fn bootstrapped_bound_panics(bound: i64) {
    use tempfile::NamedTempFile;

    use crate::forkserver::DeferPolicy;
    use crate::testutil::{os_args, quiet_setup, ChunkReader, MockRuntime, RecordingHarness};

    let stderr = NamedTempFile::new().expect("failed to create temporary file");
    let setup = quiet_setup(&stderr);
    let mut runtime = MockRuntime::with_budget(1);
    let mut harness = RecordingHarness::returning(0);
    let mut bootstrap = Bootstrap::establish_placeholder(DeferPolicy::from_override(true), &mut runtime);

    let mut driver = PersistentLoop::new(&mut runtime, &mut harness);
    driver
        .bootstrap(&bootstrap, &setup, os_args(&["driver"]))
        .expect("bootstrap failed");
    let mut input = ChunkReader::new(Vec::<Vec<u8>>::new());
    let _ = driver.run(bound, &mut bootstrap, &setup.config, &mut input);
}

#[test]
#[should_panic(expected = "iteration bound must be positive")]
fn test_zero_bound_panics() {
    bootstrapped_bound_panics(0);
}

#[test]
#[should_panic(expected = "iteration bound must be positive")]
fn test_negative_bound_panics() {
    bootstrapped_bound_panics(-3);
}
