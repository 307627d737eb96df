//! Scheduler and phase arbiter tests.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use cairn::scheduler::{PhaseMutex, RunPhase, Scheduler, new_count};

#[test]
fn serial_scheduler_runs_inline() {
    let s = Scheduler::new(1);
    assert!(s.serial());
    let hits = Arc::new(AtomicUsize::new(0));
    let count = new_count();
    for _ in 0..10 {
        let h = hits.clone();
        s.spawn(&count, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
    }
    // Inline execution means everything already ran.
    assert_eq!(hits.load(Ordering::SeqCst), 10);
    s.wait(&count);
}

#[test]
fn parallel_scheduler_completes_all_tasks() {
    let s = Scheduler::new(4);
    let hits = Arc::new(AtomicUsize::new(0));
    let count = new_count();
    for _ in 0..100 {
        let h = hits.clone();
        s.spawn(&count, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
    }
    s.wait(&count);
    assert_eq!(hits.load(Ordering::SeqCst), 100);
}

#[test]
fn waiter_participates_in_execution() {
    // With a single worker thread, a task that spawns subtasks and waits
    // for them can only finish if the waiter helps execute.
    let s = Arc::new(Scheduler::new(2));
    let hits = Arc::new(AtomicUsize::new(0));
    let outer = new_count();
    {
        let s2 = s.clone();
        let h = hits.clone();
        s.spawn(&outer, move || {
            let inner = new_count();
            for _ in 0..8 {
                let h2 = h.clone();
                s2.spawn(&inner, move || {
                    h2.fetch_add(1, Ordering::SeqCst);
                });
            }
            s2.wait(&inner);
        });
    }
    s.wait(&outer);
    assert_eq!(hits.load(Ordering::SeqCst), 8);
}

#[test]
fn phase_lock_is_shared_within_a_phase() {
    let p = PhaseMutex::new();
    let a = p.lock(RunPhase::Match);
    let b = p.lock(RunPhase::Match);
    assert_eq!(p.current(), RunPhase::Match);
    drop(a);
    drop(b);
    let _c = p.lock(RunPhase::Execute);
    assert_eq!(p.current(), RunPhase::Execute);
}

#[test]
fn phase_switches_only_when_drained() {
    let p = Arc::new(PhaseMutex::new());
    let guard = p.lock(RunPhase::Match);

    let p2 = p.clone();
    let t = std::thread::spawn(move || {
        // Blocks until the match guard drops.
        let _g = p2.lock(RunPhase::Load);
        p2.current()
    });
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(p.current(), RunPhase::Match, "load waits for match users");
    drop(guard);
    assert_eq!(t.join().unwrap(), RunPhase::Load);
}
