//! The broker binary as a process

use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn spawn_broker() -> Child {
    Command::new(env!("CARGO_BIN_EXE_switchyard-broker"))
        .args(["--endpoint", "tcp://127.0.0.1:*"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap()
}

fn wait_exit(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return Some(status);
        }
        thread::sleep(Duration::from_millis(20));
    }
    None
}

fn stops_cleanly_on(signal: libc::c_int) {
    let mut child = spawn_broker();
    // Give it time to bind and install the handler
    thread::sleep(Duration::from_millis(500));
    assert!(child.try_wait().unwrap().is_none(), "broker exited early");

    let rc = unsafe { libc::kill(child.id() as libc::pid_t, signal) };
    assert_eq!(rc, 0);

    match wait_exit(&mut child, Duration::from_secs(5)) {
        Some(status) => assert!(status.success(), "exit status {:?}", status),
        None => {
            let _ = child.kill();
            panic!("broker ignored signal {}", signal);
        }
    }
}

#[test]
fn test_sigterm_stops_broker() {
    stops_cleanly_on(libc::SIGTERM);
}

#[test]
fn test_sigint_stops_broker() {
    stops_cleanly_on(libc::SIGINT);
}
