use std::fmt;
use std::io;
use std::ptr::{self, NonNull};

use anyhow::{bail, Result};
use libc::c_void;
use log::debug;
use thiserror::Error;

use crate::constants::*;
use crate::runtime::EngineRuntime;

/// Ways of mapping the placeholder coverage map, in the order they are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapStrategy {
    /// Exactly the preferred address, failing if something already lives there
    PreferredFixed,
    /// The preferred address as a hint. The kernel may place it elsewhere but never
    /// clobbers an existing mapping.
    UnconstrainedFixed,
    /// Wherever the kernel likes
    Anonymous,
}

impl MapStrategy {
    pub const FALLBACK_ORDER: [MapStrategy; 3] = [
        MapStrategy::PreferredFixed,
        MapStrategy::UnconstrainedFixed,
        MapStrategy::Anonymous,
    ];
}

impl fmt::Display for MapStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MapStrategy::PreferredFixed => "preferred-fixed",
            MapStrategy::UnconstrainedFixed => "unconstrained-fixed",
            MapStrategy::Anonymous => "anonymous",
        };
        write!(f, "{}", s)
    }
}

/// Every strategy in [`MapStrategy::FALLBACK_ORDER`] failed
#[derive(Debug, Error)]
#[error("no mapping strategy succeeded for a {size} byte coverage map")]
pub struct MapError {
    pub size: usize,
    pub attempts: Vec<(MapStrategy, io::Error)>,
}

/// A shared anonymous mapping the instrumentation writes edge hits into.
///
/// There is no `Drop` impl: the placeholder has to stay mapped for the life of the
/// process unless it is explicitly handed off, since instrumented code may still hold
/// `__afl_area_ptr` during process teardown.
#[derive(Debug)]
pub struct CoverageBuffer {
    ptr: NonNull<u8>,
    size: usize,
    tier: MapStrategy,
}

// The mapping is process wide and not tied to the thread that created it
unsafe impl Send for CoverageBuffer {}

impl CoverageBuffer {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn tier(&self) -> MapStrategy {
        self.tier
    }

    fn unmap(self) -> Result<()> {
        if unsafe { libc::munmap(self.ptr.as_ptr() as *mut c_void, self.size) } != 0 {
            bail!(
                "Failed to munmap coverage map at {:p}: {}",
                self.ptr,
                io::Error::last_os_error()
            );
        }

        Ok(())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_FIXED_NOREPLACE: Option<libc::c_int> = Some(libc::MAP_FIXED_NOREPLACE);
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_FIXED_NOREPLACE: Option<libc::c_int> = None;

/// mmap() `size` bytes of shared anonymous memory according to `strategy`
pub fn map_with(strategy: MapStrategy, size: usize) -> io::Result<NonNull<u8>> {
    let (addr, extra_flags) = match strategy {
        MapStrategy::PreferredFixed => match MAP_FIXED_NOREPLACE {
            Some(flag) => (PLACEHOLDER_MAP_ADDR as *mut c_void, flag),
            None => return Err(io::Error::from_raw_os_error(libc::ENOTSUP)),
        },
        MapStrategy::UnconstrainedFixed => (PLACEHOLDER_MAP_ADDR as *mut c_void, 0),
        MapStrategy::Anonymous => (ptr::null_mut(), 0),
    };

    let ptr = unsafe {
        libc::mmap(
            addr,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS | extra_flags,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    // Kernels older than 4.17 silently ignore MAP_FIXED_NOREPLACE and treat the address
    // as a hint
    if strategy == MapStrategy::PreferredFixed && ptr != addr {
        unsafe { libc::munmap(ptr, size) };
        return Err(io::Error::from_raw_os_error(libc::EEXIST));
    }

    NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
}

/// Try each strategy in order with `map`, keeping the first mapping that succeeds
pub fn acquire_with<F>(size: usize, mut map: F) -> Result<CoverageBuffer, MapError>
where
    F: FnMut(MapStrategy, usize) -> io::Result<NonNull<u8>>,
{
    let mut attempts = Vec::new();

    for &tier in MapStrategy::FALLBACK_ORDER.iter() {
        match map(tier, size) {
            Ok(ptr) => return Ok(CoverageBuffer { ptr, size, tier }),
            Err(e) => attempts.push((tier, e)),
        }
    }

    Err(MapError { size, attempts })
}

/// Map the placeholder coverage map instrumented code writes into until afl-fuzz
/// attaches the real one
pub fn acquire_placeholder() -> Result<CoverageBuffer, MapError> {
    acquire_with(PLACEHOLDER_MAP_SIZE, map_with)
}

/// Holds the single live coverage map and keeps the runtime's view of it in sync
#[derive(Debug, Default)]
pub struct CoverageSlot {
    live: Option<CoverageBuffer>,
}

impl CoverageSlot {
    pub fn empty() -> Self {
        Self { live: None }
    }

    pub fn current(&self) -> Option<&CoverageBuffer> {
        self.live.as_ref()
    }

    /// Make `buffer` the process-wide coverage map
    pub fn holding<R: EngineRuntime>(buffer: CoverageBuffer, runtime: &mut R) -> Self {
        runtime.publish_coverage_map(buffer.as_ptr());
        Self { live: Some(buffer) }
    }

    /// Unmap the live coverage map, if any, and clear the runtime's pointer.
    ///
    /// Calling this on an empty slot only clears the pointer.
    pub fn release<R: EngineRuntime>(&mut self, runtime: &mut R) -> Result<()> {
        // Clear first so nothing writes into memory that is about to go away
        runtime.publish_coverage_map(ptr::null_mut());

        if let Some(buffer) = self.live.take() {
            debug!("Releasing {} coverage map at {:p}", buffer.tier, buffer.ptr);
            buffer.unmap()?;
        }

        Ok(())
    }
}

#[test]
fn test_fallback_order() {
    let mut tried = Vec::new();
    let mut backing = vec![0u8; 16];
    let backing_ptr = NonNull::new(backing.as_mut_ptr()).unwrap();

    let buffer = acquire_with(16, |tier, _| {
        tried.push(tier);
        match tier {
            MapStrategy::PreferredFixed => Err(io::Error::from_raw_os_error(libc::EEXIST)),
            _ => Ok(backing_ptr),
        }
    })
    .expect("second tier should succeed");

    assert_eq!(
        tried,
        vec![MapStrategy::PreferredFixed, MapStrategy::UnconstrainedFixed]
    );
    assert_eq!(buffer.tier(), MapStrategy::UnconstrainedFixed);
    assert_eq!(buffer.as_ptr(), backing.as_mut_ptr());
    assert_eq!(buffer.size(), 16);

    // Not a real mapping, don't unmap it
    std::mem::forget(buffer);
}

#[test]
fn test_all_strategies_fail() {
    let mut tried = Vec::new();
    let err = acquire_with(PLACEHOLDER_MAP_SIZE, |tier, _| {
        tried.push(tier);
        Err(io::Error::from_raw_os_error(libc::ENOMEM))
    })
    .expect_err("no strategy should succeed");

    assert_eq!(tried, MapStrategy::FALLBACK_ORDER.to_vec());
    assert_eq!(err.size, PLACEHOLDER_MAP_SIZE);
    assert_eq!(err.attempts.len(), 3);
}

#[test]
fn test_occupied_preferred_address() {
    let first = acquire_placeholder().expect("failed to map placeholder");
    let second = acquire_placeholder().expect("failed to map second placeholder");

    assert_ne!(first.as_ptr(), second.as_ptr());
    if first.tier() == MapStrategy::PreferredFixed {
        assert_eq!(first.as_ptr() as usize, PLACEHOLDER_MAP_ADDR);
        assert_ne!(second.tier(), MapStrategy::PreferredFixed);
    }

    // Placeholder must be writable across its whole length
    unsafe {
        *first.as_ptr() = 1;
        *first.as_ptr().add(first.size() - 1) = 1;
    }

    second.unmap().expect("failed to unmap");
    first.unmap().expect("failed to unmap");
}

#[test]
fn test_slot_release_is_idempotent() {
    use crate::testutil::MockRuntime;

    let mut runtime = MockRuntime::default();

    let buffer = acquire_with(4096, |_, size| map_with(MapStrategy::Anonymous, size))
        .expect("failed to map");
    let ptr = buffer.as_ptr();
    let mut slot = CoverageSlot::holding(buffer, &mut runtime);
    assert_eq!(runtime.coverage_map(), ptr);
    assert!(slot.current().is_some());

    slot.release(&mut runtime).expect("failed to release");
    assert!(runtime.coverage_map().is_null());
    assert!(slot.current().is_none());

    slot.release(&mut runtime).expect("second release should be a no-op");
    assert!(runtime.coverage_map().is_null());
}
