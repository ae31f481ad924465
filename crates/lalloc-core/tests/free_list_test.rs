#![cfg(feature = "debug-memory")]

use std::ptr::NonNull;

use lalloc_core::{
    AllocError, AllocOptions, Allocator, DebugMonitor, FreeListAllocator, GeneralAllocator, HeapMonitor,
    PlacementPolicy,
};

#[derive(Debug, Clone)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

struct Live {
    user: NonNull<u8>,
    size: usize,
    tag: u8,
}

fn assert_tagged(live: &Live, len: usize, seed: u64, step: usize) {
    // SAFETY: `user` is live and holds at least `len` bytes.
    let bytes = unsafe { std::slice::from_raw_parts(live.user.as_ptr(), len) };
    if let Some(pos) = bytes.iter().position(|&b| b != live.tag) {
        panic!(
            "seed={seed} step={step}: byte {pos} of a {}-byte block is {:#04x}, expected {:#04x}",
            live.size, bytes[pos], live.tag
        );
    }
}

#[test]
fn random_traffic_coalesces_back_to_one_range() {
    const STEPS: usize = 3_000;

    for policy in [PlacementPolicy::FindFirst, PlacementPolicy::FindBest] {
        for seed in [1_u64, 0x5EED, 0xDEAD_BEEF] {
            let list = FreeListAllocator::new(64 * 1024, policy).expect("storage");
            let monitor = DebugMonitor::new(32);
            let general = GeneralAllocator::with_monitor(&monitor);
            // SAFETY: `list` outlives every block allocated through the handle.
            let handle = unsafe { Allocator::from_ref(&list) };
            let mut rng = XorShift64::new(seed);
            let mut live: Vec<Live> = Vec::new();

            for step in 0..STEPS {
                let op = rng.gen_range_usize(0, 9);
                if op < 5 || live.is_empty() {
                    let size = rng.gen_range_usize(1, 700);
                    let tag = (step % 251) as u8 + 1;
                    match general.allocate(Some(handle), size, None, AllocOptions::NONE) {
                        Ok(user) => {
                            unsafe { user.as_ptr().write_bytes(tag, size) };
                            live.push(Live { user, size, tag });
                        }
                        Err(AllocError::Exhausted { .. }) => {}
                        Err(other) => panic!("seed={seed} step={step}: {other}"),
                    }
                } else if op < 7 {
                    let index = rng.gen_range_usize(0, live.len() - 1);
                    let new_size = rng.gen_range_usize(1, 1_400);
                    let kept = live[index].size.min(new_size);
                    match unsafe { general.reallocate(live[index].user, new_size, AllocOptions::NONE) } {
                        Ok(user) => {
                            let entry = &mut live[index];
                            entry.user = user;
                            assert_tagged(entry, kept, seed, step);
                            unsafe { user.as_ptr().write_bytes(entry.tag, new_size) };
                            entry.size = new_size;
                        }
                        Err(AllocError::Exhausted { .. }) => {
                            let entry = &live[index];
                            assert_tagged(entry, entry.size, seed, step);
                        }
                        Err(other) => panic!("seed={seed} step={step}: {other}"),
                    }
                } else {
                    let index = rng.gen_range_usize(0, live.len() - 1);
                    let entry = live.swap_remove(index);
                    assert_tagged(&entry, entry.size, seed, step);
                    unsafe { general.free(entry.user.as_ptr(), AllocOptions::NONE) };
                }
            }

            for entry in live.drain(..) {
                unsafe { general.free(entry.user.as_ptr(), AllocOptions::NONE) };
            }
            assert_eq!(monitor.verify_heap(), Ok(()), "seed={seed} policy={policy:?}");
            assert_eq!(monitor.live_count(), 0, "seed={seed} policy={policy:?}");
            assert_eq!(list.used(), 0, "seed={seed} policy={policy:?}");
            assert_eq!(list.free_range_count(), 1, "seed={seed} policy={policy:?}");
            assert_eq!(list.largest_free_range(), list.capacity());
            assert!(list.peak_used() > 0);
        }
    }
}

#[test]
fn facade_free_all_unlinks_and_resets() {
    let list = FreeListAllocator::new(4096, PlacementPolicy::FindFirst).expect("storage");
    let monitor = DebugMonitor::new(1);
    let general = GeneralAllocator::with_monitor(&monitor);
    // SAFETY: `list` outlives the handle.
    let handle = unsafe { Allocator::from_ref(&list) };

    let first = general
        .allocate(Some(handle), 100, None, AllocOptions::NONE)
        .expect("allocate");
    for size in [1, 64, 300] {
        general
            .allocate(Some(handle), size, Some(64), AllocOptions::NONE)
            .expect("allocate");
    }
    assert_eq!(monitor.live_count_owned_by(handle), 4);

    general.free_all(Some(handle), AllocOptions::NONE);
    assert_eq!(monitor.live_count(), 0);
    assert_eq!(monitor.verify_heap(), Ok(()));
    assert_eq!(list.used(), 0);
    assert_eq!(list.free_range_count(), 1);

    let again = general
        .allocate(Some(handle), 100, None, AllocOptions::NONE)
        .expect("allocate");
    assert_eq!(again, first);
    unsafe { general.free(again.as_ptr(), AllocOptions::NONE) };
}

#[test]
fn shared_list_serves_several_threads() {
    static LIST: std::sync::OnceLock<FreeListAllocator> = std::sync::OnceLock::new();
    let list = LIST.get_or_init(|| FreeListAllocator::new(256 * 1024, PlacementPolicy::FindBest).expect("storage"));
    let monitor = DebugMonitor::new(64);

    std::thread::scope(|s| {
        for t in 0..4_usize {
            let monitor = &monitor;
            s.spawn(move || {
                let general = GeneralAllocator::with_monitor(monitor);
                let handle = Allocator::from_static(list);
                let mut live = Vec::new();
                for round in 0..500 {
                    let size = 8 + (round * 31 + t * 17) % 400;
                    let user = general
                        .allocate(Some(handle), size, None, AllocOptions::NONE)
                        .expect("allocate");
                    live.push(user);
                    if live.len() > 16 {
                        let victim = live.swap_remove(round % live.len());
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
    assert_eq!(list.used(), 0);
    assert_eq!(list.free_range_count(), 1);
}
