#![cfg(feature = "debug-memory")]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use lalloc_core::{AllocOptions, Allocator, Corruption, DebugMonitor, GeneralAllocator, HeapMonitor};
use parking_lot::Mutex;

#[test]
fn in_place_resizes_never_race_heap_walks() {
    const RESIZES: usize = 200_000;

    let monitor = DebugMonitor::new(1_000_000);
    let done = AtomicBool::new(false);
    let walks = AtomicUsize::new(0);
    let failures = AtomicUsize::new(0);
    let first_failure: Mutex<Option<Corruption>> = Mutex::new(None);

    thread::scope(|s| {
        s.spawn(|| {
            while !done.load(Ordering::Acquire) {
                if let Err(err) = monitor.verify_heap() {
                    failures.fetch_add(1, Ordering::Relaxed);
                    first_failure.lock().get_or_insert(err);
                }
                walks.fetch_add(1, Ordering::Relaxed);
            }
        });

        s.spawn(|| {
            let general = GeneralAllocator::with_monitor(&monitor);
            let mut user = general
                .allocate(Some(Allocator::heap()), 8, None, AllocOptions::NONE)
                .expect("heap allocation");
            for step in 0..RESIZES {
                let size = if step % 2 == 0 { 16 } else { 8 };
                user = unsafe { general.reallocate(user, size, AllocOptions::NONE) }
                    .expect("reallocate");
            }
            unsafe { general.free(user.as_ptr(), AllocOptions::NONE) };
            done.store(true, Ordering::Release);
        });
    });

    assert!(walks.load(Ordering::Relaxed) > 0);
    assert_eq!(
        failures.load(Ordering::Relaxed),
        0,
        "first spurious report: {:?}",
        *first_failure.lock()
    );
    assert_eq!(monitor.live_count(), 0);
}

#[test]
fn concurrent_threads_share_one_monitor() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 2_000;

    let monitor = DebugMonitor::new(16);

    thread::scope(|s| {
        for t in 0..THREADS {
            let monitor = &monitor;
            s.spawn(move || {
                let general = GeneralAllocator::with_monitor(monitor);
                let mut live = Vec::new();
                for round in 0..ROUNDS {
                    let size = 1 + (round * 7 + t * 13) % 512;
                    let user = general
                        .allocate(Some(Allocator::heap()), size, None, AllocOptions::NONE)
                        .expect("allocate");
                    live.push(user);
                    if round % 3 == 0 {
                        let victim = live.swap_remove(round % live.len());
                        let grown = unsafe { general.reallocate(victim, size * 2, AllocOptions::NONE) }
                            .expect("reallocate");
                        live.push(grown);
                    }
                    if live.len() > 32 {
                        let victim = live.swap_remove(0);
                        unsafe { general.free(victim.as_ptr(), AllocOptions::NONE) };
                    }
                }
                for user in live {
                    unsafe { general.free(user.as_ptr(), AllocOptions::NONE) };
                }
            });
        }
    });

    assert_eq!(monitor.verify_heap(), Ok(()));
    assert_eq!(monitor.live_count(), 0);
    assert_eq!(monitor.allocation_count(), (THREADS * ROUNDS) as u64);
}
