use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::unistd::{dup, dup2};

use crate::config::{CloseMask, DriverConfig};
use crate::harness::Capabilities;

/// Where the driver's own diagnostics go.
///
/// Lives for the rest of the process once established; the preserved descriptor is
/// never closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputStreamBinding {
    /// Descriptor the target sees as stderr
    target_fd: RawFd,
    /// Duplicate made before the target's view of stderr was discarded
    preserved_fd: Option<RawFd>,
    /// File stderr was reopened onto, if any
    duplicate_path: Option<PathBuf>,
}

impl OutputStreamBinding {
    pub fn new(target_fd: RawFd) -> Self {
        Self {
            target_fd,
            preserved_fd: None,
            duplicate_path: None,
        }
    }

    /// Descriptor the driver and sanitizers should write diagnostics to
    pub fn diagnostic_fd(&self) -> RawFd {
        self.preserved_fd.unwrap_or(self.target_fd)
    }

    pub fn preserved_fd(&self) -> Option<RawFd> {
        self.preserved_fd
    }

    pub fn duplicate_path(&self) -> Option<&Path> {
        self.duplicate_path.as_deref()
    }

    /// An owned handle onto the diagnostic stream
    pub fn writer(&self) -> Result<File> {
        let fd = dup(self.diagnostic_fd()).with_context(|| "Failed to dup diagnostic fd")?;
        Ok(unsafe { File::from_raw_fd(fd) })
    }
}

/// Applies `AFL_DRIVER_STDERR_DUPLICATE_FILENAME` and `AFL_DRIVER_CLOSE_FD_MASK`.
///
/// Much of this mirrors libFuzzer's `-close_fd_mask` handling.
pub struct OutputRedirector {
    stdout_fd: RawFd,
    stderr_fd: RawFd,
}

impl Default for OutputRedirector {
    fn default() -> Self {
        Self::new(libc::STDOUT_FILENO, libc::STDERR_FILENO)
    }
}

impl OutputRedirector {
    pub fn new(stdout_fd: RawFd, stderr_fd: RawFd) -> Self {
        Self {
            stdout_fd,
            stderr_fd,
        }
    }

    pub fn apply(&self, config: &DriverConfig, caps: &Capabilities) -> Result<OutputStreamBinding> {
        let mut binding = OutputStreamBinding::new(self.stderr_fd);
        self.maybe_duplicate_diagnostic_stream(config.stderr_duplicate.as_deref(), &mut binding)?;
        self.maybe_apply_close_mask(config.close_fd_mask, &mut binding, caps)?;

        Ok(binding)
    }

    /// Reopen stderr in append mode onto `path`.
    ///
    /// Everything written to stderr from here on, by anyone, lands in `path`.
    pub fn maybe_duplicate_diagnostic_stream(
        &self,
        path: Option<&Path>,
        binding: &mut OutputStreamBinding,
    ) -> Result<()> {
        let path = match path {
            Some(p) => p,
            None => return Ok(()),
        };

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("Failed to duplicate stderr to {}", path.display()))?;

        dup2(file.as_raw_fd(), self.stderr_fd)
            .with_context(|| format!("Failed to redirect stderr to {}", path.display()))?;

        binding.duplicate_path = Some(path.to_path_buf());

        Ok(())
    }

    pub fn maybe_apply_close_mask(
        &self,
        mask: CloseMask,
        binding: &mut OutputStreamBinding,
        caps: &Capabilities,
    ) -> Result<()> {
        if mask.closes_stderr() {
            self.dup_and_close_stderr(binding, caps)?;
        }

        if mask.closes_stdout() {
            discard_output(self.stdout_fd)?;
        }

        Ok(())
    }

    /// Stop the target from writing to stderr while still letting sanitizers and the
    /// driver write to wherever stderr went before.
    fn dup_and_close_stderr(&self, binding: &mut OutputStreamBinding, caps: &Capabilities) -> Result<()> {
        let preserved = dup(binding.target_fd).with_context(|| "Failed to preserve stderr")?;
        binding.preserved_fd = Some(preserved);

        if let Some(set_report_fd) = &caps.set_report_fd {
            set_report_fd(preserved);
        }

        discard_output(binding.target_fd)
    }
}

/// Point `fd` at /dev/null
fn discard_output(fd: RawFd) -> Result<()> {
    let null = OpenOptions::new()
        .write(true)
        .open("/dev/null")
        .with_context(|| "Failed to open /dev/null")?;
    dup2(null.as_raw_fd(), fd).with_context(|| format!("Failed to discard output of fd={}", fd))?;

    Ok(())
}

#[test]
fn test_close_mask_both() {
    use std::cell::Cell;
    use std::fs;
    use std::io::Write;
    use std::rc::Rc;
    use tempfile::NamedTempFile;

    use crate::testutil::scratch_fd;

    // Stand-ins for stdout and stderr so the test process keeps its own streams
    let out = NamedTempFile::new().expect("failed to create temporary file");
    let err = NamedTempFile::new().expect("failed to create temporary file");
    let out_fd = scratch_fd(&out);
    let err_fd = scratch_fd(&err);

    let reported = Rc::new(Cell::new(None::<RawFd>));
    let reported_hook = Rc::clone(&reported);
    let caps = Capabilities {
        set_report_fd: Some(Box::new(move |fd: RawFd| reported_hook.set(Some(fd)))),
    };

    let redirector = OutputRedirector::new(out_fd, err_fd);
    let mut binding = OutputStreamBinding::new(err_fd);
    redirector
        .maybe_apply_close_mask(CloseMask::new(3), &mut binding, &caps)
        .expect("failed to apply close mask");

    let preserved = binding.preserved_fd().expect("stderr should be preserved");
    assert_ne!(preserved, err_fd);
    assert_eq!(binding.diagnostic_fd(), preserved);
    assert_eq!(reported.get(), Some(preserved));

    // What the target would see as its stdout and stderr
    let mut target_out = unsafe { File::from_raw_fd(out_fd) };
    let mut target_err = unsafe { File::from_raw_fd(err_fd) };
    target_out
        .write_all(b"target stdout")
        .expect("write to discarded stdout failed");
    target_err
        .write_all(b"target stderr")
        .expect("write to discarded stderr failed");
    binding
        .writer()
        .expect("failed to open diagnostic writer")
        .write_all(b"driver diagnostics")
        .expect("failed to write diagnostics");

    assert_eq!(fs::read(out.path()).unwrap(), b"");
    assert_eq!(fs::read(err.path()).unwrap(), b"driver diagnostics");
}

#[test]
fn test_close_mask_without_sanitizer() {
    use tempfile::NamedTempFile;

    use crate::testutil::scratch_fd;

    let err = NamedTempFile::new().expect("failed to create temporary file");
    let err_fd = scratch_fd(&err);

    let redirector = OutputRedirector::new(-1, err_fd);
    let mut binding = OutputStreamBinding::new(err_fd);
    redirector
        .maybe_apply_close_mask(CloseMask::new(2), &mut binding, &Capabilities::default())
        .expect("failed to apply close mask");

    assert!(binding.preserved_fd().is_some());
}

#[test]
fn test_duplicate_appends() {
    use std::fs;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    use crate::testutil::scratch_fd;

    let dir = tempdir().expect("failed to create temporary dir");
    let log_path = dir.path().join("stderr.log");

    for run in 0..2 {
        let err = NamedTempFile::new().expect("failed to create temporary file");
        let err_fd = scratch_fd(&err);

        let config = DriverConfig {
            stderr_duplicate: Some(log_path.clone()),
            ..DriverConfig::default()
        };
        let binding = OutputRedirector::new(-1, err_fd)
            .apply(&config, &Capabilities::default())
            .expect("failed to duplicate stderr");
        assert_eq!(binding.duplicate_path(), Some(log_path.as_path()));

        let mut writer = binding.writer().expect("failed to open diagnostic writer");
        writeln!(writer, "run {}", run).expect("failed to write diagnostics");

        // The original destination no longer sees anything
        assert_eq!(fs::read(err.path()).unwrap(), b"");
        drop(unsafe { File::from_raw_fd(err_fd) });
    }

    assert_eq!(fs::read_to_string(&log_path).unwrap(), "run 0\nrun 1\n");
}

#[test]
fn test_duplicate_open_failure() {
    let redirector = OutputRedirector::new(-1, -1);
    let mut binding = OutputStreamBinding::new(-1);
    let res = redirector.maybe_duplicate_diagnostic_stream(
        Some(Path::new("/nonexistent-dir/for/driver/stderr.log")),
        &mut binding,
    );

    assert!(res.is_err());
    assert!(binding.duplicate_path().is_none());
}
