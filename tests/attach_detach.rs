//! Attach/detach behavior against a real child process.
//!
//! Tracing one's own child is permitted under the default Yama policy, but
//! hardened environments may still refuse it; the tests tolerate a
//! permission failure rather than asserting through it.

use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use strobe::attach::AttachController;
use strobe::domain::{CaptureError, Pid, Tid};
use strobe::inspect;

fn spawn_sleeper() -> Child {
    Command::new("sleep")
        .arg("30")
        .stdout(Stdio::null())
        .spawn()
        .expect("spawning sleep")
}

#[allow(clippy::cast_possible_wrap)]
fn pid_of(child: &Child) -> Pid {
    Pid(child.id() as i32)
}

#[test]
fn test_attach_stops_and_detach_resumes() {
    let mut child = spawn_sleeper();
    let pid = pid_of(&child);
    // Give the child a moment to exec
    sleep(Duration::from_millis(50));

    let mut controller = AttachController::new(pid);
    match controller.attach_and_stop() {
        Ok(()) => {}
        Err(CaptureError::PermissionDenied(_)) => {
            child.kill().ok();
            child.wait().ok();
            return;
        }
        Err(err) => panic!("attach failed: {err}"),
    }

    let halted: Vec<Tid> = controller.halted().iter().copied().collect();
    assert!(!halted.is_empty());

    // Every thread still listed is in the halted set (fixed point)
    for tid in inspect::list_threads(pid).unwrap() {
        assert!(controller.halted().contains(&tid), "thread {tid} missed by attach");
    }

    // Halted threads report the traced-stop state
    for &tid in &halted {
        assert_eq!(inspect::thread_state(tid), Some('t'));
    }

    controller.detach_and_resume();
    assert!(controller.halted().is_empty());
    sleep(Duration::from_millis(50));
    // Resumed again: sleeping, not traced
    assert_eq!(inspect::thread_state(Tid(pid.0 as u32)), Some('S'));

    child.kill().ok();
    child.wait().ok();
}

#[test]
fn test_detach_tolerates_exited_threads() {
    let mut child = spawn_sleeper();
    let pid = pid_of(&child);
    sleep(Duration::from_millis(50));

    let mut controller = AttachController::new(pid);
    match controller.attach_and_stop() {
        Ok(()) => {}
        Err(CaptureError::PermissionDenied(_)) => {
            child.kill().ok();
            child.wait().ok();
            return;
        }
        Err(err) => panic!("attach failed: {err}"),
    }

    // The target dies while stopped; detach must not report an error
    child.kill().ok();
    child.wait().ok();
    controller.detach_and_resume();
    assert!(controller.halted().is_empty());
}

#[test]
fn test_attach_to_missing_process_is_process_gone() {
    // Spawn and reap a child so its pid is known-dead
    let mut child = spawn_sleeper();
    let pid = pid_of(&child);
    child.kill().ok();
    child.wait().ok();

    let mut controller = AttachController::new(pid);
    assert!(matches!(controller.attach_and_stop(), Err(CaptureError::ProcessGone(_))));
}
