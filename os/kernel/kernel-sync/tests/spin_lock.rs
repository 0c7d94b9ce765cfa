use kernel_sync::SpinLock;
use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn guard_releases_on_drop() {
    let l = SpinLock::new("counter", 0_u32);

    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());

    let mut g = l.lock();
    *g += 1;
    assert_eq!(*g, 42);
}

#[test]
fn with_lock_returns_closure_value() {
    let l = SpinLock::new("stack", vec![3_u32, 2, 1]);
    let top = l.with_lock(Vec::pop);
    assert_eq!(top, Some(1));
    assert_eq!(l.lock().as_slice(), &[3, 2]);
}

#[test]
fn debug_output_names_the_lock() {
    let l = SpinLock::new("superpages", ());
    let s = format!("{l:?}");
    assert!(s.contains("superpages"), "{s}");
    assert!(s.contains("locked: false"), "{s}");
    assert_eq!(l.name(), "superpages");
}

#[test]
fn contended_pops_hand_out_each_item_once() {
    const THREADS: usize = 8;
    const ITEMS: usize = 4_000;

    let stack = Arc::new(SpinLock::new("free", (0..ITEMS).collect::<Vec<_>>()));
    let seen = Arc::new((0..ITEMS).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
    let start = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let stack = Arc::clone(&stack);
            let seen = Arc::clone(&seen);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                while let Some(i) = stack.with_lock(Vec::pop) {
                    seen[i].fetch_add(1, Ordering::SeqCst);
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert!(seen.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    assert!(stack.lock().is_empty());
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new("panicky", 0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn spinlock_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let l = SpinLock::new("sync", 0u8);
    takes_sync(&l);
}
