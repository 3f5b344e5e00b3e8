#![cfg(all(test, feature = "loom"))]

use crate::Pool;
use loom::sync::atomic::{AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;

#[test]
fn no_double_acquire() {
    loom::model(|| {
        let pool = Arc::new(Pool::<u64>::new(1));
        let handed_out = Arc::new(AtomicUsize::new(0));

        let run = |pool: Arc<Pool<u64>>, handed_out: Arc<AtomicUsize>| {
            if pool.acquire_raw().is_some() {
                handed_out.fetch_add(1, Ordering::SeqCst);
            }
        };

        let t1 = thread::spawn({
            let pool = pool.clone();
            let handed_out = handed_out.clone();
            move || run(pool, handed_out)
        });
        let t2 = thread::spawn({
            let pool = pool.clone();
            let handed_out = handed_out.clone();
            move || run(pool, handed_out)
        });

        t1.join().unwrap();
        t2.join().unwrap();

        // One slot, no releases: exactly one thread may win it.
        assert_eq!(handed_out.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn acquire_release_round_trips() {
    loom::model(|| {
        let pool = Arc::new(Pool::<u64>::new(2));

        let run = |pool: Arc<Pool<u64>>, value: u64| {
            if let Ok(ptr) = pool.acquire(value) {
                unsafe {
                    assert_eq!(*ptr.as_ref(), value);
                    pool.release(ptr);
                }
            }
        };

        let t1 = thread::spawn({
            let pool = pool.clone();
            move || run(pool, 42)
        });
        let t2 = thread::spawn({
            let pool = pool.clone();
            move || run(pool, 666)
        });

        t1.join().unwrap();
        t2.join().unwrap();

        assert!(pool.is_full());
    });
}
