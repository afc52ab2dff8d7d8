// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::io::Write;

use tempfile::NamedTempFile;

use super::*;

#[test]
fn reads_lines_incrementally() {
    let mut file = NamedTempFile::new().expect("tempfile");
    writeln!(file, "line one").unwrap();
    let mut reader = TailReader::new(file.path().to_path_buf());

    let lines = reader.read_new_lines().expect("read");
    assert_eq!(lines, vec!["line one".to_owned()]);

    writeln!(file, "line two").unwrap();
    let lines = reader.read_new_lines().expect("read");
    assert_eq!(lines, vec!["line two".to_owned()]);
}

#[test]
fn missing_file_yields_no_lines() {
    let mut reader = TailReader::new(PathBuf::from("/nonexistent/path/to/cast.log"));
    assert_eq!(reader.read_new_lines().expect("read"), Vec::<String>::new());
}

#[test]
fn trailing_fragment_without_newline_is_held_as_carry() {
    let mut file = NamedTempFile::new().expect("tempfile");
    write!(file, "complete\nfragment").unwrap();
    let mut reader = TailReader::new(file.path().to_path_buf());

    let lines = reader.read_new_lines().expect("read");
    assert_eq!(lines, vec!["complete".to_owned()]);
    assert_eq!(reader.carry, "fragment");

    // Once the newline arrives, the held fragment is emitted whole.
    write!(file, " finished\n").unwrap();
    let lines = reader.read_new_lines().expect("read");
    assert_eq!(lines, vec!["fragment finished".to_owned()]);
}

#[test]
fn shrinking_file_is_fatal() {
    let mut file = NamedTempFile::new().expect("tempfile");
    writeln!(file, "one line long enough to shrink from").unwrap();
    let mut reader = TailReader::new(file.path().to_path_buf());
    reader.read_new_lines().expect("read");

    file.as_file_mut().set_len(1).expect("truncate");

    let err = reader.read_new_lines().expect_err("shrink must be fatal");
    assert!(err.is_fatal());
}

#[tokio::test]
async fn wait_for_file_returns_once_created() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("stdout");
    let reader = TailReader::new(path.clone()).with_poll_interval(Duration::from_millis(10));
    let shutdown = CancellationToken::new();

    let wait_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reader.wait_for_file(&shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    std::fs::write(&path, "").expect("create file");

    let appeared = tokio::time::timeout(Duration::from_secs(2), wait_handle)
        .await
        .expect("timed out")
        .expect("join");
    assert!(appeared);
}

#[tokio::test]
async fn run_emits_fatal_on_shrink_and_stops() {
    let mut file = NamedTempFile::new().expect("tempfile");
    writeln!(file, "a line that is reasonably long").unwrap();

    let reader = TailReader::new(file.path().to_path_buf()).with_poll_interval(Duration::from_millis(20));
    let (tx, mut rx) = mpsc::channel(8);
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn(reader.run(tx, shutdown.clone()));

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.expect("timeout").expect("event");
    assert!(matches!(first, TailEvent::Lines(_)));

    file.as_file_mut().set_len(1).expect("truncate");

    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.expect("timeout").expect("event");
    assert!(matches!(second, TailEvent::Fatal(_)));

    handle.await.expect("join");
}
