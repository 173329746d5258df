use std::ffi::OsString;
use std::os::unix::io::RawFd;

/// A libFuzzer-style fuzz target
pub trait Harness {
    /// `LLVMFuzzerTestOneInput`. The return value is ignored by the driver.
    fn test_one_input(&mut self, data: &[u8]) -> i32;

    /// Whether the target provides `LLVMFuzzerInitialize`
    fn has_initialize(&self) -> bool {
        false
    }

    /// `LLVMFuzzerInitialize`, which may rewrite the process arguments.
    ///
    /// Returns `None` if the target does not provide one.
    fn initialize(&mut self, _args: &mut Vec<OsString>) -> Option<i32> {
        None
    }
}

/// Optional hooks other runtimes linked into the binary may provide
#[derive(Default)]
pub struct Capabilities {
    /// `__sanitizer_set_report_fd`
    pub set_report_fd: Option<Box<dyn Fn(RawFd)>>,
}
