use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use sentry_malloc::{Fault, SentryMalloc, BLOCK_OVERHEAD};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn stress_test_1() {
    init_logging();
    static ALLOCATOR: SentryMalloc = SentryMalloc::new();
    const HEAP_SIZE: usize = 256 * 1024;
    ALLOCATOR.init(HEAP_SIZE).unwrap();

    let thread_count = 8;
    let mut handles = vec![];
    for thread_index in 0..thread_count {
        handles.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(0xC0FFEE + thread_index as u64);
            let origin = thread_index + 1;
            // allocate-write-verify-free loop
            for _ in 0..2_000 {
                let size = rng.gen_range(1..=256);
                let p = ALLOCATOR.allocate(size, origin).unwrap();
                let payload = unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), size) };
                payload.fill(origin as u8);
                assert!(payload.iter().all(|&byte| byte == origin as u8));
                ALLOCATOR.free(p.as_ptr(), origin).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().expect("Thread panicked.");
    }

    assert_eq!(ALLOCATOR.allocated_bytes(), 0);
    assert_eq!(ALLOCATOR.statistics().current_allocations, 0);

    // Everything coalesced back into a single block spanning the heap.
    let p = ALLOCATOR.allocate(HEAP_SIZE - BLOCK_OVERHEAD, 99).unwrap();
    ALLOCATOR.free(p.as_ptr(), 99).unwrap();

    // Only ids that were actually passed ended up in the caller log.
    let valid_ids = 1..=thread_count + 98;
    assert!(ALLOCATOR
        .latest_caller_ids(usize::MAX)
        .iter()
        .all(|id| valid_ids.contains(id)));
}

#[test]
fn stress_test_2() {
    init_logging();
    static ALLOCATOR: SentryMalloc = SentryMalloc::new();
    const HEAP_SIZE: usize = 64 * 1024;
    ALLOCATOR.init(HEAP_SIZE).unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    let mut live: Vec<(*mut u8, usize, u8)> = vec![];

    for round in 0..5_000u32 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(1..=512);
            match ALLOCATOR.allocate(size, 1 + round % 7) {
                Ok(p) => {
                    let fill = rng.gen::<u8>();
                    unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), size).fill(fill) };
                    live.push((p.as_ptr(), size, fill));
                }
                // A full heap is expected here; freeing continues below.
                Err(Fault::OutOfMemory) => {}
                Err(other) => panic!("unexpected fault: {other}"),
            }
        } else {
            let index = rng.gen_range(0..live.len());
            let (p, size, fill) = live.swap_remove(index);
            let payload = unsafe { std::slice::from_raw_parts(p, size) };
            assert!(
                payload.iter().all(|&byte| byte == fill),
                "payload altered before free"
            );
            ALLOCATOR.free(p, 1000).unwrap();
        }

        // The aggregate accounting never drifts from the live set.
        let requested: usize = live.iter().map(|&(_, size, _)| size).sum();
        assert_eq!(ALLOCATOR.allocated_bytes(), requested);
        assert_eq!(
            ALLOCATOR.statistics().current_allocations as usize,
            live.len()
        );
    }

    for (p, _, _) in live.drain(..) {
        ALLOCATOR.free(p, 1001).unwrap();
    }
    assert_eq!(ALLOCATOR.allocated_bytes(), 0);
    assert!(ALLOCATOR.allocate(HEAP_SIZE - BLOCK_OVERHEAD, 1002).is_ok());
}
