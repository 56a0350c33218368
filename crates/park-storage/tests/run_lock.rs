//! Cross-process behaviour of the run lock. The test binary re-executes itself
//! as the lock holder so the holder can be killed like a real sync process.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use park_storage::{LockError, RunLock};
use tempfile::tempdir;

const HOLDER_DIR_ENV: &str = "PARK_LOCK_HOLDER_DIR";
const READY_MARKER: &str = "lock-holder-ready";
const LOCK_NAME: &str = "sync-parking";

/// Only does work when spawned by `spawn_holder`; a no-op in a normal test run.
#[test]
fn lock_holder_process() {
    let Ok(dir) = std::env::var(HOLDER_DIR_ENV) else {
        return;
    };
    let lock = RunLock::new(LOCK_NAME, &dir).expect("lock");
    let _guard = lock.acquire().expect("holder acquire");
    println!("{READY_MARKER}");
    std::io::stdout().flush().expect("flush");

    // Hold until the parent closes stdin or kills us.
    let mut sink = Vec::new();
    let _ = std::io::stdin().read_to_end(&mut sink);
}

/// The stdout reader is returned so the pipe stays open until the holder exits.
fn spawn_holder(dir: &Path) -> (Child, BufReader<ChildStdout>) {
    let exe = std::env::current_exe().expect("current test binary");
    let mut child = Command::new(exe)
        .args([
            "lock_holder_process",
            "--exact",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(HOLDER_DIR_ENV, dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn holder");

    let stdout = child.stdout.take().expect("holder stdout");
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).expect("read holder stdout");
        assert!(read > 0, "holder exited before taking the lock");
        if line.contains(READY_MARKER) {
            break;
        }
    }
    (child, reader)
}

#[test]
fn contended_acquire_fails_then_succeeds_after_holder_is_killed() {
    let dir = tempdir().expect("tempdir");
    let (mut holder, _stdout) = spawn_holder(dir.path());
    let lock = RunLock::new(LOCK_NAME, dir.path()).expect("lock");

    match lock.acquire() {
        Err(LockError::Held { holder_pid, .. }) => assert_eq!(holder_pid, Some(holder.id())),
        other => {
            let _ = holder.kill();
            panic!("expected Held while holder runs, got {other:?}");
        }
    }

    // SIGKILL: no destructor runs in the holder, the kernel must drop the lock.
    holder.kill().expect("kill holder");
    holder.wait().expect("reap holder");

    lock.acquire().expect("acquire after holder was killed");
}

#[test]
fn lock_is_free_after_holder_exits_normally() {
    let dir = tempdir().expect("tempdir");
    let (mut holder, _stdout) = spawn_holder(dir.path());

    drop(holder.stdin.take());
    let status = holder.wait().expect("reap holder");
    assert!(status.success());

    let lock = RunLock::new(LOCK_NAME, dir.path()).expect("lock");
    lock.acquire().expect("acquire after holder exited");
}

#[test]
fn other_job_names_are_unaffected_by_a_foreign_holder() {
    let dir = tempdir().expect("tempdir");
    let (mut holder, _stdout) = spawn_holder(dir.path());

    let other = RunLock::new("sync-availability", dir.path()).expect("lock");
    let acquired = other.acquire();

    let _ = holder.kill();
    let _ = holder.wait();
    acquired.expect("different name never contends");
}
