use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::Result;
use log::debug;

use crate::constants::MAX_FILE;
use crate::harness::Harness;

/// Run the harness once on each file in `inputs`, in order.
///
/// Files that can't be opened or read are skipped without complaint. Returns how many
/// inputs were executed.
pub fn execute_files_one_by_one<H, W>(harness: &mut H, inputs: &[PathBuf], out: &mut W) -> Result<usize>
where
    H: Harness,
    W: Write,
{
    let mut executed = 0;
    let mut buf = Vec::new();

    for path in inputs {
        let file = match OpenOptions::new().read(true).open(path) {
            Ok(f) => f,
            Err(e) => {
                debug!("skipping {}: {}", path.display(), e);
                continue;
            }
        };

        buf.clear();
        if let Err(e) = file.take(MAX_FILE).read_to_end(&mut buf) {
            debug!("skipping {}: {}", path.display(), e);
            continue;
        }
        if buf.is_empty() {
            continue;
        }

        writeln!(out, "Reading {} bytes from {}", buf.len(), path.display())?;
        out.flush()?;
        harness.test_one_input(&buf);
        writeln!(out, "Execution successful.")?;
        executed += 1;
    }

    Ok(executed)
}

#[test]
fn test_replay_skips_missing() {
    use std::fs::File;
    use tempfile::tempdir;

    use crate::testutil::RecordingHarness;

    let dir = tempdir().expect("failed to create temporary dir");
    let first = dir.path().join("first");
    let missing = dir.path().join("missing");
    let third = dir.path().join("third");
    File::create(&first)
        .and_then(|mut f| f.write_all(b"hello"))
        .expect("failed to write input");
    File::create(&third)
        .and_then(|mut f| f.write_all(b"world!"))
        .expect("failed to write input");

    let mut harness = RecordingHarness::returning(0);
    let mut out = Vec::new();
    let executed = execute_files_one_by_one(
        &mut harness,
        &[first.clone(), missing, third.clone()],
        &mut out,
    )
    .expect("replay failed");

    assert_eq!(executed, 2);
    assert_eq!(harness.inputs, vec![b"hello".to_vec(), b"world!".to_vec()]);

    let expected = format!(
        "Reading 5 bytes from {}\nExecution successful.\nReading 6 bytes from {}\nExecution successful.\n",
        first.display(),
        third.display()
    );
    assert_eq!(String::from_utf8(out).unwrap(), expected);
}

#[test]
fn test_replay_truncates_large_files() {
    use std::fs::File;
    use tempfile::tempdir;

    use crate::testutil::RecordingHarness;

    let dir = tempdir().expect("failed to create temporary dir");
    let big = dir.path().join("big");
    let empty = dir.path().join("empty");
    File::create(&big)
        .and_then(|mut f| f.write_all(&vec![b'A'; MAX_FILE as usize + 100]))
        .expect("failed to write input");
    File::create(&empty).expect("failed to create input");

    let mut harness = RecordingHarness::returning(0);
    let executed = execute_files_one_by_one(&mut harness, &[empty, big], &mut Vec::<u8>::new())
        .expect("replay failed");

    // Empty files are not run
    assert_eq!(executed, 1);
    assert_eq!(harness.inputs[0].len(), MAX_FILE as usize);
}
