//! C entry point for libFuzzer-style targets fuzzed by afl++.
//!
//! Link `libafldriver.a` together with the instrumented target and afl++'s
//! `afl-compiler-rt.o`. The archive provides `main`.

use std::ffi::{CStr, OsString};
use std::mem;
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::io::RawFd;
use std::process;
use std::slice;
use std::sync::Mutex;

use driver::{Bootstrap, Capabilities, EngineRuntime, Harness, RawStdin};

extern "C" {
    // afl++ runtime
    static mut __afl_area_ptr: *mut u8;
    fn __afl_persistent_loop(max_cnt: c_uint) -> c_int;
    fn __afl_manual_init();

    // The target
    fn LLVMFuzzerTestOneInput(data: *const u8, size: usize) -> c_int;

    // hooks.c
    fn afl_driver_initialize_hook() -> *mut c_void;
    fn afl_driver_set_report_fd_hook() -> *mut c_void;
}

type InitializeFn = unsafe extern "C" fn(*mut c_int, *mut *mut *mut c_char) -> c_int;
type SetReportFdFn = unsafe extern "C" fn(*mut c_void);

/// Inputs are always read from stdin
#[no_mangle]
pub static mut __afl_sharedmem_fuzzing: c_int = 0;

/// Targets with a libFuzzer custom mutator reference this. It is never called under afl++.
#[no_mangle]
pub extern "C" fn LLVMFuzzerMutate(_data: *mut u8, _size: usize, _max_size: usize) -> usize {
    0
}

struct AflRuntime;

impl EngineRuntime for AflRuntime {
    fn publish_coverage_map(&mut self, map: *mut u8) {
        unsafe { __afl_area_ptr = map };
    }

    fn coverage_map(&self) -> *mut u8 {
        unsafe { __afl_area_ptr }
    }

    fn set_sharedmem_fuzzing(&mut self, enabled: bool) {
        unsafe { __afl_sharedmem_fuzzing = enabled as c_int };
    }

    fn manual_init(&mut self) {
        unsafe { __afl_manual_init() };
    }

    fn persistent_loop(&mut self, max_iterations: u32) -> bool {
        unsafe { __afl_persistent_loop(max_iterations) != 0 }
    }
}

/// The linked fuzz target. Keeps the real `argc`/`argv` since `LLVMFuzzerInitialize` may
/// hold on to (or replace) them.
struct LibFuzzerTarget {
    argc: c_int,
    argv: *mut *mut c_char,
}

impl Harness for LibFuzzerTarget {
    fn test_one_input(&mut self, data: &[u8]) -> i32 {
        unsafe { LLVMFuzzerTestOneInput(data.as_ptr(), data.len()) }
    }

    fn has_initialize(&self) -> bool {
        !unsafe { afl_driver_initialize_hook() }.is_null()
    }

    fn initialize(&mut self, args: &mut Vec<OsString>) -> Option<i32> {
        let hook = unsafe { afl_driver_initialize_hook() };
        if hook.is_null() {
            return None;
        }

        let hook: InitializeFn = unsafe { mem::transmute(hook) };
        let rc = unsafe { hook(&mut self.argc, &mut self.argv) };
        *args = unsafe { collect_args(self.argc, self.argv) };

        Some(rc)
    }
}

fn capabilities() -> Capabilities {
    let hook = unsafe { afl_driver_set_report_fd_hook() };
    if hook.is_null() {
        return Capabilities::default();
    }

    let set_report_fd: SetReportFdFn = unsafe { mem::transmute(hook) };
    Capabilities {
        // The sanitizer runtime takes the fd smuggled through a pointer
        set_report_fd: Some(Box::new(move |fd: RawFd| unsafe {
            set_report_fd(fd as isize as *mut c_void)
        })),
    }
}

unsafe fn collect_args(argc: c_int, argv: *mut *mut c_char) -> Vec<OsString> {
    if argv.is_null() || argc <= 0 {
        return Vec::new();
    }

    slice::from_raw_parts(argv, argc as usize)
        .iter()
        .filter(|arg| !arg.is_null())
        .map(|&arg| OsString::from_vec(CStr::from_ptr(arg).to_bytes().to_vec()))
        .collect()
}

/// Filled in by `early_init` before any other constructor runs
static EARLY: Mutex<Option<Bootstrap>> = Mutex::new(None);

/// Must run before afl++'s `__afl_auto_init` constructor, which reads the defer
/// setting, and before any instrumented constructor writes coverage.
extern "C" fn early_init() {
    let bootstrap = Bootstrap::establish(&mut AflRuntime);
    if let Ok(mut slot) = EARLY.lock() {
        *slot = Some(bootstrap);
    }
}

#[cfg(target_os = "linux")]
#[used]
#[link_section = ".init_array.00000"]
static EARLY_INIT: extern "C" fn() = early_init;

fn take_bootstrap() -> Bootstrap {
    #[cfg(target_os = "linux")]
    {
        // Keeps the object holding the constructor in the final link
        let _ = unsafe { std::ptr::read_volatile(&EARLY_INIT) };
    }

    let early = EARLY.lock().ok().and_then(|mut slot| slot.take());
    // Without an early constructor this is the earliest point available
    early.unwrap_or_else(|| Bootstrap::establish(&mut AflRuntime))
}

#[no_mangle]
pub extern "C" fn main(argc: c_int, argv: *mut *mut c_char) -> c_int {
    let bootstrap = take_bootstrap();
    let args = unsafe { collect_args(argc, argv) };
    let mut target = LibFuzzerTarget { argc, argv };

    match driver::run(
        bootstrap,
        &mut AflRuntime,
        &mut target,
        args,
        &mut RawStdin,
        capabilities(),
    ) {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("Unclean driver exit: {:#}", e);
            process::abort();
        }
    }
}
