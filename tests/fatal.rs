//! Registry and chain misuse must end the process.
//!
//! Each case re-runs this test binary with `FATAL_CASE` set, filtered to
//! `fatal_child`, and checks that the child aborted with a diagnostic.

use std::{
    env,
    process::{Command, Output},
    ptr,
};

use zone_shim::{registry, AllocatorDispatch, HeapZone, NativeHeap, DEFAULT_DISPATCH};

const CASE_VAR: &str = "FATAL_CASE";

static DANGLING: AllocatorDispatch = AllocatorDispatch {
    next: None,
    ..AllocatorDispatch::forwarding(&DEFAULT_DISPATCH)
};

#[test]
fn fatal_child() {
    let case = match env::var(CASE_VAR) {
        Ok(case) => case,
        Err(_) => return,
    };
    let zone = HeapZone::new(b"fatal\0", NativeHeap::LINKED).leak();
    match case.as_str() {
        "register_twice" => {
            registry().register_zone(zone);
            registry().register_zone(zone);
        }
        "lookup_unregistered" => unsafe {
            DEFAULT_DISPATCH.alloc(16, zone);
        },
        "forward_past_end" => unsafe {
            registry().register_zone(zone);
            DANGLING.free(ptr::null_mut(), zone);
        },
        other => panic!("unknown case {}", other),
    }
    // Reaching this point means the violation went unnoticed.
    std::process::exit(0);
}

fn run_child(case: &str) -> Output {
    Command::new(env::current_exe().unwrap())
        .env(CASE_VAR, case)
        .args(["fatal_child", "--exact", "--nocapture", "--test-threads=1"])
        .output()
        .unwrap()
}

fn assert_aborted(output: &Output, message: &str) {
    assert!(!output.status.success());
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(output.status.signal(), Some(libc::SIGABRT));
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains(message),
        "expected '{}' in child stderr:\n{}",
        message,
        stderr
    );
}

#[test]
fn registering_twice_aborts() {
    assert_aborted(&run_child("register_twice"), "is already registered");
}

#[test]
fn dispatch_for_unregistered_zone_aborts() {
    assert_aborted(&run_child("lookup_unregistered"), "was never registered");
}

#[test]
fn forwarding_past_the_end_aborts() {
    assert_aborted(
        &run_child("forward_past_end"),
        "non-terminal dispatch node has no successor",
    );
}
