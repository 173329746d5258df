use std::ffi::OsString;
use std::iter;
use std::path::PathBuf;

use log::warn;
use structopt::clap::AppSettings;
use structopt::StructOpt;

use crate::config::atoi;
use crate::constants::UNBOUNDED_ITERATIONS;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "afl-driver",
    about = "Run a libFuzzer-style target under afl-fuzz, or on individual inputs",
    settings = &[
        AppSettings::DisableHelpFlags,
        AppSettings::DisableVersion,
        AppSettings::TrailingVarArg,
    ]
)]
struct Opt {
    /// `-N` to let afl-fuzz run N inputs per process, or input files to run once each
    #[structopt(parse(from_os_str))]
    args: Vec<OsString>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Run inputs from afl-fuzz, at most `bound` per process incarnation.
    ///
    /// `bound` is not validated here.
    Persistent { bound: i64 },
    /// Run each file once and exit
    Replay { inputs: Vec<PathBuf> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub program: OsString,
    pub mode: Mode,
    /// Inputs arrive through shared memory instead of stdin
    pub sharedmem_fuzzing: bool,
}

impl ExecutionContext {
    /// Work out the mode from the (possibly harness-rewritten) process arguments.
    ///
    /// Every argument after the program name is taken literally. `--help`, `-V` and `--`
    /// are file names or bounds like anything else.
    pub fn resolve(args: &[OsString]) -> Self {
        let program = args.first().cloned().unwrap_or_else(|| OsString::from("afl-driver"));
        // A leading `--` ends option parsing before any argument is seen
        let literal = iter::once(program.clone())
            .chain(iter::once(OsString::from("--")))
            .chain(args.iter().skip(1).cloned());
        let opts = Opt::from_iter(literal);

        Self {
            program,
            mode: resolve_mode(opts.args),
            sharedmem_fuzzing: false,
        }
    }
}

fn resolve_mode(args: Vec<OsString>) -> Mode {
    if args.len() == 1 {
        let arg = args[0].to_string_lossy().into_owned();

        if let Some(bound) = arg.strip_prefix('-') {
            return Mode::Persistent { bound: atoi(bound) };
        }

        let bound = atoi(&arg);
        if bound > 0 {
            warn!("using the deprecated call style `<program> {}`", bound);
            return Mode::Persistent { bound };
        }
    }

    if args.is_empty() {
        return Mode::Persistent {
            bound: UNBOUNDED_ITERATIONS,
        };
    }

    Mode::Replay {
        inputs: args.into_iter().map(PathBuf::from).collect(),
    }
}

#[cfg(test)]
fn resolve_strs(args: &[&str]) -> ExecutionContext {
    let args: Vec<OsString> = args.iter().map(OsString::from).collect();
    ExecutionContext::resolve(&args)
}

#[test]
fn test_no_args_is_unbounded() {
    let ctx = resolve_strs(&["driver"]);
    assert_eq!(ctx.program, OsString::from("driver"));
    assert_eq!(
        ctx.mode,
        Mode::Persistent {
            bound: UNBOUNDED_ITERATIONS
        }
    );
    assert!(!ctx.sharedmem_fuzzing);
}

#[test]
fn test_flag_bound() {
    assert_eq!(
        resolve_strs(&["driver", "-1000"]).mode,
        Mode::Persistent { bound: 1000 }
    );

    // Not validated until the loop starts
    assert_eq!(
        resolve_strs(&["driver", "-0"]).mode,
        Mode::Persistent { bound: 0 }
    );
    assert_eq!(
        resolve_strs(&["driver", "-abc"]).mode,
        Mode::Persistent { bound: 0 }
    );
}

#[cfg(test)]
#[test_log::test]
fn test_deprecated_bare_bound() {
    assert_eq!(
        resolve_strs(&["driver", "500"]).mode,
        Mode::Persistent { bound: 500 }
    );
}

#[test]
fn test_files_select_replay() {
    assert_eq!(
        resolve_strs(&["driver", "crash-1"]).mode,
        Mode::Replay {
            inputs: vec![PathBuf::from("crash-1")]
        }
    );

    assert_eq!(
        resolve_strs(&["driver", "a", "-5", "c"]).mode,
        Mode::Replay {
            inputs: vec![
                PathBuf::from("a"),
                PathBuf::from("-5"),
                PathBuf::from("c")
            ]
        }
    );

    // Two numbers are two file names
    assert_eq!(
        resolve_strs(&["driver", "1", "2"]).mode,
        Mode::Replay {
            inputs: vec![PathBuf::from("1"), PathBuf::from("2")]
        }
    );
}

#[test]
fn test_flag_lookalikes_are_files() {
    assert_eq!(
        resolve_strs(&["driver", "crash-1", "--help"]).mode,
        Mode::Replay {
            inputs: vec![PathBuf::from("crash-1"), PathBuf::from("--help")]
        }
    );

    assert_eq!(
        resolve_strs(&["driver", "--", "a"]).mode,
        Mode::Replay {
            inputs: vec![PathBuf::from("--"), PathBuf::from("a")]
        }
    );

    assert_eq!(
        resolve_strs(&["driver", "a", "-h", "--version"]).mode,
        Mode::Replay {
            inputs: vec![
                PathBuf::from("a"),
                PathBuf::from("-h"),
                PathBuf::from("--version")
            ]
        }
    );
}

#[test]
fn test_flag_lookalikes_are_bounds() {
    // Single dash arguments always go down the `-K` path
    assert_eq!(
        resolve_strs(&["driver", "-V"]).mode,
        Mode::Persistent { bound: 0 }
    );
    assert_eq!(
        resolve_strs(&["driver", "--help"]).mode,
        Mode::Persistent { bound: 0 }
    );
    assert_eq!(
        resolve_strs(&["driver", "--"]).mode,
        Mode::Persistent { bound: 0 }
    );
}
