use std::env;

use anyhow::{bail, Result};
use log::{info, warn};

use crate::constants::*;
use crate::runtime::EngineRuntime;
use crate::shmem::{acquire_placeholder, CoverageSlot, MapError};

/// Whether the afl++ forkserver waits for `__afl_manual_init()` before forking.
///
/// Must be decided before the afl++ runtime's own constructor runs, since that is
/// where `__AFL_DEFER_FORKSRV` is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferPolicy {
    defer: bool,
}

impl DeferPolicy {
    /// Read `AFL_DRIVER_DONT_DEFER`. If set, any inherited deferral request is dropped so
    /// the forkserver starts right away.
    pub fn decide() -> Self {
        let policy = Self::from_override(env::var_os(ENV_DONT_DEFER).is_some());
        if !policy.defer {
            env::remove_var(ENV_DEFER_FORKSRV);
        }

        policy
    }

    pub fn from_override(dont_defer: bool) -> Self {
        Self { defer: !dont_defer }
    }

    pub fn defers(&self) -> bool {
        self.defer
    }
}

/// Everything set up before `main`: the defer decision and the placeholder coverage map.
///
/// Instrumented code can run (and write coverage) before afl-fuzz attaches the real
/// map, so `__afl_area_ptr` has to point at something valid from the very start.
#[derive(Debug)]
pub struct Bootstrap {
    policy: DeferPolicy,
    coverage: CoverageSlot,
    placeholder_error: Option<MapError>,
    handed_off: bool,
}

impl Bootstrap {
    /// Decide the defer policy, then map and publish the placeholder.
    ///
    /// Runs before the logger exists, so nothing here may log.
    pub fn establish<R: EngineRuntime>(runtime: &mut R) -> Self {
        let policy = DeferPolicy::decide();
        Self::establish_placeholder(policy, runtime)
    }

    pub fn establish_placeholder<R: EngineRuntime>(policy: DeferPolicy, runtime: &mut R) -> Self {
        if policy.defers() {
            env::set_var(ENV_DEFER_FORKSRV, "1");
        }

        let (coverage, placeholder_error) = match acquire_placeholder() {
            Ok(buffer) => (CoverageSlot::holding(buffer, runtime), None),
            Err(e) => {
                let mut slot = CoverageSlot::empty();
                // Nothing mapped, so this only clears the runtime's pointer
                let _ = slot.release(runtime);
                (slot, Some(e))
            }
        };

        Self {
            policy,
            coverage,
            placeholder_error,
            handed_off: false,
        }
    }

    pub fn policy(&self) -> DeferPolicy {
        self.policy
    }

    pub fn coverage(&self) -> &CoverageSlot {
        &self.coverage
    }

    pub fn handed_off(&self) -> bool {
        self.handed_off
    }

    /// Log what happened before the logger was up
    pub fn report(&self) {
        match (self.coverage.current(), &self.placeholder_error) {
            (Some(buffer), _) => info!(
                "dummy map is at {:p} ({} mapping)",
                buffer.as_ptr(),
                buffer.tier()
            ),
            (None, Some(e)) => {
                warn!("dummy map unavailable: {}", e);
                for (tier, err) in &e.attempts {
                    warn!("  {} mapping failed: {}", tier, err);
                }
            }
            (None, None) => (),
        }

        if !self.policy.defers() {
            info!("forkserver deferral disabled by {}", ENV_DONT_DEFER);
        }
    }

    /// Drop the placeholder and tell afl++ to attach its real coverage map.
    ///
    /// May only happen once per process.
    pub fn hand_off<R: EngineRuntime>(&mut self, runtime: &mut R) -> Result<()> {
        if self.handed_off {
            bail!("Forkserver was already signalled");
        }

        self.coverage.release(runtime)?;
        runtime.manual_init();
        self.handed_off = true;

        Ok(())
    }
}

#[test]
fn test_defer_policy_env() {
    use crate::testutil::MockRuntime;

    env::set_var(ENV_DEFER_FORKSRV, "1");
    env::set_var(ENV_DONT_DEFER, "1");
    let policy = DeferPolicy::decide();
    assert!(!policy.defers());
    assert!(env::var_os(ENV_DEFER_FORKSRV).is_none());

    // The override also wins over the placeholder step
    let mut runtime = MockRuntime::default();
    let mut bootstrap = Bootstrap::establish_placeholder(policy, &mut runtime);
    assert!(env::var_os(ENV_DEFER_FORKSRV).is_none());
    bootstrap.hand_off(&mut runtime).unwrap();

    env::remove_var(ENV_DONT_DEFER);
    let mut bootstrap = Bootstrap::establish(&mut runtime);
    assert!(bootstrap.policy().defers());
    assert_eq!(env::var_os(ENV_DEFER_FORKSRV), Some("1".into()));
    bootstrap.hand_off(&mut runtime).unwrap();

    env::remove_var(ENV_DEFER_FORKSRV);
}

#[test]
fn test_hand_off_once() {
    use crate::testutil::MockRuntime;

    let mut runtime = MockRuntime::default();
    let mut bootstrap = Bootstrap::establish_placeholder(DeferPolicy::from_override(true), &mut runtime);

    let placeholder = bootstrap
        .coverage()
        .current()
        .expect("placeholder should be mapped")
        .as_ptr();
    assert_eq!(runtime.coverage_map(), placeholder);
    assert!(!bootstrap.handed_off());

    bootstrap.hand_off(&mut runtime).expect("first hand off failed");
    assert!(bootstrap.handed_off());
    assert!(runtime.coverage_map().is_null());
    assert!(bootstrap.coverage().current().is_none());
    assert_eq!(runtime.manual_inits, 1);
    // Coverage map was cleared before the forkserver was signalled
    assert_eq!(runtime.map_at_manual_init, Some(std::ptr::null_mut()));

    assert!(bootstrap.hand_off(&mut runtime).is_err());
    assert_eq!(runtime.manual_inits, 1);
}
