use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;

use tcam_usb::parallel::{
    acquire_default_work_pool, default_work_pool_refs, release_default_work_pool, Latch, Semaphore,
    WorkItem, WorkPool, MAX_WORK_ITEM_COUNT,
};

struct Slot<'a> {
    runs: &'a AtomicUsize,
}

impl WorkItem for Slot<'_> {
    fn do_one(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn every_item_runs_exactly_once() {
    let pool = WorkPool::new(4);
    pool.start().unwrap();

    let latch = Arc::new(Latch::default());
    for round in 0..50 {
        let counts: Vec<AtomicUsize> = (0..MAX_WORK_ITEM_COUNT).map(|_| AtomicUsize::new(0)).collect();
        let items: Vec<_> = counts.iter().map(|runs| Slot { runs }).collect();

        pool.queue_items_and_wait(&latch, &items);

        for (index, count) in counts.iter().enumerate() {
            assert_eq!(count.load(Ordering::SeqCst), 1, "round {round}, item {index}");
        }
        assert_eq!(latch.count(), 0);
    }

    pool.stop();
}

#[test]
fn empty_batches_return_immediately() {
    let pool = WorkPool::new(2);
    pool.start().unwrap();
    let items: Vec<Slot<'_>> = Vec::new();
    pool.queue_items_and_wait(&Arc::new(Latch::default()), &items);
}

#[test]
fn latch_releases_all_waiters_each_cycle() {
    let latch = Arc::new(Latch::new(0));
    let released = Arc::new(AtomicUsize::new(0));

    for cycle in 1..=3 {
        latch.reset(2);
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let latch = latch.clone();
                let released = released.clone();
                thread::spawn(move || {
                    latch.wait();
                    released.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(released.load(Ordering::SeqCst), (cycle - 1) * 3);

        latch.count_down();
        latch.count_down();
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), cycle * 3);
    }
}

#[test]
fn semaphore_timed_wait_reports_timeouts() {
    let sem = Arc::new(Semaphore::new(0));

    let start = Instant::now();
    assert!(!sem.timed_wait(Duration::from_millis(30)));
    assert!(start.elapsed() >= Duration::from_millis(30));

    let poster = {
        let sem = sem.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            sem.unlock(1);
        })
    };
    assert!(sem.timed_wait(Duration::from_secs(5)));
    poster.join().unwrap();
    assert_eq!(sem.available(), 0);
}

#[test]
#[serial]
fn default_pool_lives_while_referenced() {
    assert_eq!(default_work_pool_refs(), 0);

    let first = acquire_default_work_pool().unwrap();
    let second = acquire_default_work_pool().unwrap();
    assert_eq!(default_work_pool_refs(), 2);

    release_default_work_pool(second);
    assert_eq!(default_work_pool_refs(), 1);

    drop(first);
    assert_eq!(default_work_pool_refs(), 0);

    // A fresh acquire builds a new pool
    let again = acquire_default_work_pool().unwrap();
    assert_eq!(default_work_pool_refs(), 1);
    drop(again);
    assert_eq!(default_work_pool_refs(), 0);
}
