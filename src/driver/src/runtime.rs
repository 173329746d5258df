/// The parts of the afl++ runtime the driver talks to.
///
/// The real implementation sits on top of `__afl_area_ptr`, `__afl_sharedmem_fuzzing`,
/// `__afl_manual_init()` and `__afl_persistent_loop()`, which only exist once the final
/// binary is linked against `afl-compiler-rt.o`.
pub trait EngineRuntime {
    /// Point the instrumentation at `map`. Null means "no map attached yet".
    fn publish_coverage_map(&mut self, map: *mut u8);

    fn coverage_map(&self) -> *mut u8;

    fn set_sharedmem_fuzzing(&mut self, enabled: bool);

    /// Tell the deferred forkserver that initialization is done
    fn manual_init(&mut self);

    /// Returns true while another input should be run in this process
    fn persistent_loop(&mut self, max_iterations: u32) -> bool;
}
