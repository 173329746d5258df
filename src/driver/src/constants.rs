use static_assertions::const_assert;

/// Low address the placeholder coverage map is preferably mapped at
pub const PLACEHOLDER_MAP_ADDR: usize = 0x10000;
/// Large enough for any edge map an instrumented target writes before the real map exists
pub const PLACEHOLDER_MAP_SIZE: usize = 256_000;

/// Replay mode reads at most this many bytes per file (afl++ `MAX_FILE`)
pub const MAX_FILE: u64 = 1024 * 1024;
/// Size of the buffer each persistent-mode input is read into
pub const STDIN_BUF_SIZE: usize = 1_024_000;

/// Iteration bound used when none is given on the command line
pub const UNBOUNDED_ITERATIONS: i64 = i32::MAX as i64;

/// Environment variables consulted by the driver
pub const ENV_DONT_DEFER: &str = "AFL_DRIVER_DONT_DEFER";
pub const ENV_STDERR_DUPLICATE_FILENAME: &str = "AFL_DRIVER_STDERR_DUPLICATE_FILENAME";
pub const ENV_CLOSE_FD_MASK: &str = "AFL_DRIVER_CLOSE_FD_MASK";
pub const ENV_DISABLE_INSTRUMENTATION: &str = "AFL_DISABLE_LLVM_INSTRUMENTATION";
pub const ENV_LOG: &str = "AFL_DRIVER_LOG";

/// Read by the afl++ runtime constructor. When set, the forkserver waits for
/// `__afl_manual_init()`.
pub const ENV_DEFER_FORKSRV: &str = "__AFL_DEFER_FORKSRV";

/// afl-fuzz greps the target binary for these to enable persistent and deferred mode
pub const PERSISTENT_MARKER: &[u8] = b"##SIG_AFL_PERSISTENT##\0";
pub const DEFER_MARKER: &[u8] = b"##SIG_AFL_DEFER_FORKSRV##\0";

pub const PROBE_INPUT_SIZE: usize = 64;
pub const PROBE_DEFER_OFFSET: usize = 32;

const_assert!(PERSISTENT_MARKER.len() <= PROBE_DEFER_OFFSET);
const_assert!(PROBE_DEFER_OFFSET + DEFER_MARKER.len() <= PROBE_INPUT_SIZE);
