//! Lets afl++ fuzz libFuzzer-style targets (`LLVMFuzzerTestOneInput`) in persistent
//! mode with a deferred forkserver.
//!
//! Startup happens in two steps:
//!
//! 1. [`Bootstrap::establish`], as early as possible (before the afl++ runtime's
//!    constructor): decide whether the forkserver is deferred and map a placeholder
//!    coverage map.
//! 2. [`run`], from `main`: redirect output, run the target's one-time setup, then either
//!    replay files given on the command line or hand off to afl-fuzz and loop.

use std::ffi::OsString;
use std::io::{self, Read, Write};

use anyhow::Result;

mod args;
mod config;
mod constants;
mod forkserver;
mod harness;
mod logging;
mod persistent;
mod redirect;
mod replay;
mod runtime;
mod shmem;
#[cfg(test)]
mod testutil;

pub use args::{ExecutionContext, Mode};
pub use config::{CloseMask, DriverConfig};
pub use forkserver::{Bootstrap, DeferPolicy};
pub use harness::{Capabilities, Harness};
pub use persistent::{LoopStats, PersistentLoop, Phase, ProbeInput, RawStdin};
pub use redirect::{OutputRedirector, OutputStreamBinding};
pub use replay::execute_files_one_by_one;
pub use runtime::EngineRuntime;
pub use shmem::{CoverageBuffer, CoverageSlot, MapError, MapStrategy};

/// How `main` sets up the process before handing control to the target
pub struct Setup {
    pub config: DriverConfig,
    pub redirector: OutputRedirector,
    pub caps: Capabilities,
}

impl Setup {
    /// Settings from the environment, acting on the real stdout and stderr
    pub fn from_env(caps: Capabilities) -> Self {
        Self {
            config: DriverConfig::from_env(),
            redirector: OutputRedirector::default(),
            caps,
        }
    }
}

/// Everything that happens from `main` on.
///
/// `args` are the process arguments including the program name.
pub fn run<R, H, I>(
    bootstrap: Bootstrap,
    runtime: &mut R,
    harness: &mut H,
    args: Vec<OsString>,
    input: &mut I,
    caps: Capabilities,
) -> Result<()>
where
    R: EngineRuntime,
    H: Harness,
    I: Read,
{
    let setup = Setup::from_env(caps);
    let stdout = io::stdout();

    run_with(&setup, bootstrap, runtime, harness, args, input, &mut stdout.lock())
}

/// Like [`run`], with explicit settings and an explicit destination for progress output
pub fn run_with<R, H, I, W>(
    setup: &Setup,
    mut bootstrap: Bootstrap,
    runtime: &mut R,
    harness: &mut H,
    args: Vec<OsString>,
    input: &mut I,
    out: &mut W,
) -> Result<()>
where
    R: EngineRuntime,
    H: Harness,
    I: Read,
    W: Write,
{
    let mut driver = PersistentLoop::new(runtime, harness);
    let ctx = driver.bootstrap(&bootstrap, setup, args)?;

    // Any expensive one-time initialization of the driver itself goes here

    match ctx.mode {
        Mode::Replay { ref inputs } => {
            driver.replay(&mut bootstrap, inputs, out)?;
        }
        Mode::Persistent { bound } => {
            driver.run(bound, &mut bootstrap, &setup.config, input)?;
            writeln!(
                out,
                "{}: successfully executed input(s)",
                ctx.program.to_string_lossy()
            )?;
        }
    }

    Ok(())
}

#[test]
fn test_run_replays_rewritten_args() {
    use std::cell::Cell;
    use std::fs::{self, File};
    use std::rc::Rc;
    use tempfile::{tempdir, NamedTempFile};

    use crate::testutil::{os_args, scratch_fd, ChunkReader, MockRuntime, RecordingHarness};

    let dir = tempdir().expect("failed to create temporary dir");
    let crash = dir.path().join("crash");
    let log_path = dir.path().join("stderr.log");
    File::create(&crash)
        .and_then(|mut f| f.write_all(b"boom"))
        .expect("failed to write input");

    let stderr = NamedTempFile::new().expect("failed to create temporary file");
    let setup = Setup {
        config: DriverConfig {
            stderr_duplicate: Some(log_path.clone()),
            ..DriverConfig::default()
        },
        redirector: OutputRedirector::new(-1, scratch_fd(&stderr)),
        caps: Capabilities::default(),
    };

    // Stderr has to be redirected by the time the target sets itself up
    let redirected = Rc::new(Cell::new(false));
    let redirected_hook = Rc::clone(&redirected);
    let hook_log_path = log_path.clone();
    let crash_arg = crash.clone().into_os_string();
    let mut harness = RecordingHarness::returning(0).with_initialize(move |args| {
        redirected_hook.set(hook_log_path.exists());
        args.truncate(1);
        args.push(crash_arg.clone());
        0
    });

    let mut runtime = MockRuntime::with_budget(10);
    let bootstrap = Bootstrap::establish_placeholder(DeferPolicy::from_override(true), &mut runtime);
    let mut input = ChunkReader::new(vec![b"from stdin".to_vec()]);
    let mut out = Vec::new();

    run_with(
        &setup,
        bootstrap,
        &mut runtime,
        &mut harness,
        os_args(&["driver", "-5"]),
        &mut input,
        &mut out,
    )
    .expect("driver failed");

    assert!(redirected.get());
    assert_eq!(harness.initialized_after, Some(0));
    // No warmup run and nothing read from stdin
    assert_eq!(harness.inputs, vec![b"boom".to_vec()]);
    assert!(runtime.bounds_seen.is_empty());

    assert!(!runtime.sharedmem_fuzzing);
    assert_eq!(runtime.manual_inits, 1);
    assert_eq!(runtime.map_at_manual_init, Some(std::ptr::null_mut()));
    assert!(runtime.coverage_map().is_null());

    let expected = format!(
        "Reading 4 bytes from {}\nExecution successful.\n",
        crash.display()
    );
    assert_eq!(String::from_utf8(out).unwrap(), expected);
    assert_eq!(fs::read(stderr.path()).unwrap(), b"");
}

#[test]
fn test_run_persistent_reports_completion() {
    use tempfile::NamedTempFile;

    use crate::testutil::{os_args, quiet_setup, ChunkReader, MockRuntime, RecordingHarness};

    let stderr = NamedTempFile::new().expect("failed to create temporary file");
    let setup = quiet_setup(&stderr);

    // A file argument the setup hook swaps for a bound
    let mut harness = RecordingHarness::returning(0).with_initialize(|args| {
        args.truncate(1);
        args.push("-2".into());
        0
    });
    let mut runtime = MockRuntime::with_budget(10);
    let bootstrap = Bootstrap::establish_placeholder(DeferPolicy::from_override(true), &mut runtime);
    let mut input = ChunkReader::new(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    let mut out = Vec::new();

    run_with(
        &setup,
        bootstrap,
        &mut runtime,
        &mut harness,
        os_args(&["fuzz-target", "crash-1"]),
        &mut input,
        &mut out,
    )
    .expect("driver failed");

    assert_eq!(harness.initialized_after, Some(0));
    assert_eq!(
        harness.inputs,
        vec![b"#".to_vec(), b"a".to_vec(), b"b".to_vec()]
    );
    assert_eq!(runtime.bounds_seen, vec![2; 3]);

    assert!(!runtime.sharedmem_fuzzing);
    assert_eq!(runtime.manual_inits, 1);
    assert_eq!(runtime.map_at_manual_init, Some(std::ptr::null_mut()));
    assert!(runtime.coverage_map().is_null());

    assert_eq!(
        String::from_utf8(out).unwrap(),
        "fuzz-target: successfully executed input(s)\n"
    );
}
