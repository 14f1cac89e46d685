//! End-to-end behavior of the facade over the threaded host.

use pulse_sched::{Promise, SchedError, Scheduler, TaskFailure};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_context_runs_and_is_joined_by_flush() {
    let sched = Scheduler::threaded();
    let ran = Arc::new(AtomicBool::new(false));

    let flag = ran.clone();
    let worker = sched
        .new_context("worker", move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
    sched.start(&worker).unwrap();

    // A foreign context cannot be drained from here; the request is armed
    // for its owner and the call reports not-drained.
    assert!(!sched.flush(&worker, 10));

    // Flushing the creator's own (empty) environment joins the child.
    assert!(sched.flush_current(5_000));
    assert!(ran.load(Ordering::SeqCst));

    sched.shutdown();
}

#[test]
fn test_scheduling_into_running_context_from_outside() {
    let sched = Scheduler::threaded();
    let seen = Arc::new(AtomicUsize::new(0));

    // The body parks briefly so the cross-thread append happens while the
    // context is alive; the post-task flush must still drain it.
    let worker = sched
        .new_context("worker", || {
            thread::sleep(Duration::from_millis(100));
        })
        .unwrap();
    sched.start(&worker).unwrap();

    let counter = seen.clone();
    sched
        .run_finally_in(&worker, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    thread::sleep(Duration::from_millis(400));
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    sched.shutdown();
}

#[test]
fn test_kill_then_schedule_fails_fast() {
    let sched = Scheduler::threaded();
    let worker = sched.new_context("victim", || {}).unwrap();
    sched.start(&worker).unwrap();

    assert!(sched.kill(&worker, 1_000));

    let err = sched.run_deferred_in(&worker, || {}).unwrap_err();
    assert!(matches!(err, SchedError::Terminated { .. }));
    let err = sched.run_finally_in(&worker, || {}).unwrap_err();
    assert!(matches!(err, SchedError::Terminated { .. }));

    sched.shutdown();
}

#[test]
fn test_kill_interrupts_stuck_context() {
    let sched = Arc::new(Scheduler::threaded());
    let interrupted = Arc::new(AtomicBool::new(false));

    let inner = sched.clone();
    let flag = interrupted.clone();
    let worker = sched
        .new_context("stuck", move || {
            // Sleeps far longer than the kill budget; only an interrupt
            // can cut this short.
            if !inner.try_sleep(10_000.0) {
                flag.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();
    sched.start(&worker).unwrap();
    thread::sleep(Duration::from_millis(50));

    let before = Instant::now();
    assert!(!sched.kill(&worker, 100));
    assert!(before.elapsed() < Duration::from_secs(5));

    thread::sleep(Duration::from_millis(200));
    assert!(interrupted.load(Ordering::SeqCst));

    sched.shutdown();
}

#[test]
fn test_watchdog_interrupts_overrunning_task() {
    let sched = Arc::new(Scheduler::threaded());
    let cut_short = Arc::new(AtomicBool::new(false));

    let inner = sched.clone();
    let flag = cut_short.clone();
    let worker = sched
        .new_context("runaway", move || {
            inner.schedule_interruption(50.0);
            if !inner.try_sleep(10_000.0) {
                flag.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();
    sched.start(&worker).unwrap();

    thread::sleep(Duration::from_millis(500));
    assert!(cut_short.load(Ordering::SeqCst), "watchdog never fired");

    sched.shutdown();
}

#[test]
fn test_run_timeout_is_a_lower_bound() {
    let sched = Scheduler::threaded();
    let fired_at = Arc::new(Mutex::new(None));

    let start = Instant::now();
    let slot = fired_at.clone();
    sched.run_timeout(80.0, move || {
        *slot.lock().unwrap() = Some(start.elapsed());
    });

    // The task only becomes eligible after the delay, and still needs the
    // calling environment to be drained.
    thread::sleep(Duration::from_millis(150));
    assert!(sched.flush_current(1_000));

    let elapsed = fired_at.lock().unwrap().expect("delayed task never ran");
    assert!(elapsed >= Duration::from_millis(80), "fired early: {elapsed:?}");

    sched.shutdown();
}

#[test]
fn test_resolve_delivers_value_from_another_thread() {
    let sched = Scheduler::threaded();
    let promise: Promise<u32> = Promise::new();
    let received = Arc::new(Mutex::new(None));

    let slot = received.clone();
    sched.resolve(&promise, move |outcome| {
        *slot.lock().unwrap() = Some(outcome);
    });

    let completer = promise.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        completer.complete(99);
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    while received.lock().unwrap().is_none() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(*received.lock().unwrap(), Some(Ok(99)));

    sched.shutdown();
}

#[test]
fn test_resolve_delivers_failures_not_silence() {
    let sched = Scheduler::threaded();
    let promise: Promise<u32> = Promise::new();
    let received = Arc::new(Mutex::new(None));

    let slot = received.clone();
    sched.resolve(&promise, move |outcome| {
        *slot.lock().unwrap() = Some(outcome);
    });

    promise.fail(TaskFailure::new("upstream died"));

    let deadline = Instant::now() + Duration::from_secs(2);
    while received.lock().unwrap().is_none() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let outcome = received.lock().unwrap().take().expect("never delivered");
    assert_eq!(outcome.unwrap_err().message(), "upstream died");

    sched.shutdown();
}

#[test]
fn test_try_sleep_fractional_and_uninterrupted() {
    let sched = Scheduler::threaded();
    let before = Instant::now();
    assert!(sched.try_sleep(2.5));
    assert!(before.elapsed() >= Duration::from_micros(2_500));
    sched.shutdown();
}

#[test]
fn test_is_in_process_tracks_managed_work() {
    let sched = Arc::new(Scheduler::threaded());
    assert!(!sched.is_in_process());

    let seen = Arc::new(AtomicBool::new(false));
    let inner = sched.clone();
    let flag = seen.clone();
    let worker = sched
        .new_context("probe", move || {
            flag.store(inner.is_in_process(), Ordering::SeqCst);
        })
        .unwrap();
    sched.start(&worker).unwrap();

    assert!(sched.flush_current(2_000));
    assert!(seen.load(Ordering::SeqCst));

    sched.shutdown();
}

#[test]
fn test_start_time_reflects_begin_not_creation() {
    let sched = Scheduler::threaded();
    let worker = sched
        .new_context("late-starter", || {
            thread::sleep(Duration::from_millis(20));
        })
        .unwrap();

    let created = sched.now();
    thread::sleep(Duration::from_millis(60));

    sched.start(&worker).unwrap();
    thread::sleep(Duration::from_millis(30));

    let started = sched
        .context_start_time(&worker)
        .expect("start moment missing");
    assert!(started.since(created) >= 50.0);

    sched.shutdown();
}
