use super::*;
use crate::task::TaskError;
use crate::util::test::trace_init;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::thread;
use std::time::Duration;

#[test]
fn processes_every_item_exactly_once() {
    let _trace = trace_init();
    let pool = TaskPool::with_name("fanout", 4);

    const N: usize = 250;
    let counters: Arc<Vec<AtomicUsize>> =
        Arc::new((0..N).map(|_| AtomicUsize::new(0)).collect());

    let job = ParallelFor::new("count", {
        let counters = counters.clone();
        move |_cx, item, total| {
            assert_eq!(total, N);
            counters[item].fetch_add(1, SeqCst);
            Ok(())
        }
    })
    .pool(pool.clone());

    job.schedule(N, 16).join().expect("no item fails");
    pool.shutdown();

    for (item, counter) in counters.iter().enumerate() {
        assert_eq!(counter.load(SeqCst), 1, "item {item} processed once");
    }
}

#[test]
fn batch_larger_than_range() {
    let _trace = trace_init();
    let pool = TaskPool::with_name("one-job", 2);
    let count = Arc::new(AtomicUsize::new(0));

    let job = ParallelFor::new("tiny", {
        let count = count.clone();
        move |_cx, _item, _total| {
            count.fetch_add(1, SeqCst);
            Ok(())
        }
    })
    .pool(pool.clone());

    job.schedule(3, 100).join().expect("no item fails");
    pool.shutdown();
    assert_eq!(count.load(SeqCst), 3);
}

#[test]
fn exact_multiple_batches_cover_all_items() {
    let _trace = trace_init();
    let pool = TaskPool::with_name("full-batches", 4);

    // every job runs its batch to the quota; none may strand an index.
    const N: usize = 64;
    const BATCH: usize = 16;
    let counters: Arc<Vec<AtomicUsize>> =
        Arc::new((0..N).map(|_| AtomicUsize::new(0)).collect());

    let job = ParallelFor::new("full", {
        let counters = counters.clone();
        move |_cx, item, _total| {
            counters[item].fetch_add(1, SeqCst);
            Ok(())
        }
    })
    .pool(pool.clone());

    job.schedule(N, BATCH).join().expect("no item fails");
    pool.shutdown();

    for (item, counter) in counters.iter().enumerate() {
        assert_eq!(counter.load(SeqCst), 1, "item {item} processed once");
    }
}

#[test]
fn zero_elements_completes_immediately() {
    let _trace = trace_init();
    let pool = TaskPool::with_name("empty", 1);

    let job = ParallelFor::new("empty", |_cx, _item, _total| Ok(())).pool(pool.clone());
    let handle = job.schedule(0, 8);

    // no jobs are spawned at all, so the handle is terminal on return.
    assert_eq!(handle.status(), Status::Succeeded);
    pool.shutdown();
}

#[test]
fn failing_item_fails_the_fan_out() {
    let _trace = trace_init();
    let pool = TaskPool::with_name("bad-item", 2);

    let job = ParallelFor::new("bad", |_cx, item, _total| {
        if item == 7 {
            Err(TaskError::new("item 7 is broken"))
        } else {
            Ok(())
        }
    })
    .pool(pool.clone());

    let handle = job.schedule(64, 8);
    assert!(handle.join().is_err());
    assert!(handle.is_failed());
    pool.shutdown();
}

#[test]
fn schedule_on_shut_down_pool_fails() {
    let _trace = trace_init();
    let pool = TaskPool::with_name("closed-fanout", 1);
    pool.shutdown();

    let job = ParallelFor::new("never", |_cx, _item, _total| Ok(())).pool(pool.clone());
    let handle = job.schedule(8, 2);

    // the chunk jobs cannot be submitted; the handle must fail, not hang.
    assert_eq!(handle.wait_completed(), Status::Failed);
}

#[test]
fn panicking_item_fails_the_fan_out() {
    let _trace = trace_init();
    let pool = TaskPool::with_name("panicky-item", 2);

    let job = ParallelFor::new("explode", |_cx, item, _total| {
        if item == 3 {
            panic!("deliberate panic");
        }
        Ok(())
    })
    .pool(pool.clone());

    let handle = job.schedule(16, 4);
    assert!(handle.join().is_err());
    pool.shutdown();
}

#[test]
fn schedule_after_waits_for_dependency() {
    let _trace = trace_init();
    let pool = TaskPool::with_name("seq", 2);
    let dep_done = Arc::new(AtomicBool::new(false));

    let dep = Task::builder().name("dep").pool(pool.clone()).build({
        let dep_done = dep_done.clone();
        move |_| {
            thread::sleep(Duration::from_millis(20));
            dep_done.store(true, SeqCst);
            Ok(())
        }
    });

    let job = ParallelFor::new("after", {
        let dep_done = dep_done.clone();
        move |_cx, _item, _total| {
            if dep_done.load(SeqCst) {
                Ok(())
            } else {
                Err(TaskError::new("item ran before the dependency completed"))
            }
        }
    })
    .pool(pool.clone());

    let handle = job.schedule_after(64, 8, dep.signal());
    dep.run();

    handle.join().expect("items run only after the dependency");
    pool.shutdown();
}

#[test]
fn schedule_after_failed_dependency_runs_nothing() {
    let _trace = trace_init();
    let pool = TaskPool::with_name("seq-fail", 2);
    let ran = Arc::new(AtomicUsize::new(0));

    let dep = Task::builder()
        .name("dep")
        .pool(pool.clone())
        .build(|_| Err(TaskError::new("deliberate failure")));

    let job = ParallelFor::new("after", {
        let ran = ran.clone();
        move |_cx, _item, _total| {
            ran.fetch_add(1, SeqCst);
            Ok(())
        }
    })
    .pool(pool.clone());

    let handle = job.schedule_after(64, 8, dep.signal());
    dep.run();

    assert_eq!(handle.wait_completed(), Status::Failed);
    pool.shutdown();
    assert_eq!(ran.load(SeqCst), 0, "no item may run");
}
