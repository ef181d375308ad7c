use super::*;
use crate::pool::Builder as PoolBuilder;
use crate::test_utils::*;
use anyhow::Result;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::atomic::AtomicUsize;
use std::time::{Duration, Instant};

assert_impl_all!(ThreadPool: Send, Sync, Clone);
assert_impl_all!(PoolWork: Send, Sync, ThreadPoolExecutor);

#[rstest]
#[case::n_1(1)]
#[case::n_5(5)]
#[case::n_64(64)]
fn test_each_submit_runs_once(#[case] n: usize) -> Result<()> {
    let pool = test_pool(2);
    let hits = Arc::new(AtomicUsize::new(0));

    let work = {
        let hits = Arc::clone(&hits);
        pool.register(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    };

    for _ in 0..n {
        work.submit();
    }

    assert!(wait_until(Duration::from_secs(5), || {
        hits.load(Ordering::SeqCst) == n
    }));

    work.terminate();
    pool.shutdown()?;
    Ok(())
}

#[test]
fn test_threads_spawn_lazily() -> Result<()> {
    let pool = test_pool(3);
    assert_eq!(pool.num_threads(), 0);

    let work = pool.register(|_| thread::sleep(Duration::from_millis(20)));
    for _ in 0..10 {
        work.submit();
    }

    assert!(pool.num_threads() <= 3);
    assert!(wait_until(Duration::from_secs(1), || pool.num_threads() > 0));

    work.terminate();
    pool.shutdown()?;
    assert_eq!(pool.num_threads(), 0);
    Ok(())
}

#[test]
fn test_terminate_waits_for_in_flight() -> Result<()> {
    let pool = test_pool(1);
    let finished = Arc::new(AtomicUsize::new(0));

    let work = {
        let finished = Arc::clone(&finished);
        pool.register(move |_| {
            thread::sleep(Duration::from_millis(50));
            finished.fetch_add(1, Ordering::SeqCst);
        })
    };

    work.submit();
    assert!(wait_until(Duration::from_secs(1), || {
        work.work.state.lock().in_flight == 1
    }));

    let start = Instant::now();
    work.terminate();
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() >= Duration::from_millis(10));

    // Closed work ignores later submissions.
    work.submit();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(finished.load(Ordering::SeqCst), 1);

    pool.shutdown()?;
    Ok(())
}

#[test]
fn test_complete_releases_terminate_early() -> Result<()> {
    let pool = test_pool(1);
    let release = Arc::new(AtomicBool::new(false));
    let entered = Arc::new(AtomicBool::new(false));

    let work = {
        let release = Arc::clone(&release);
        let entered = Arc::clone(&entered);
        pool.register(move |status| {
            status.complete();
            assert!(status.is_complete());
            entered.store(true, Ordering::SeqCst);

            while !release.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    work.submit();
    assert!(wait_until(Duration::from_secs(1), || {
        entered.load(Ordering::SeqCst)
    }));
    assert_eq!(work.work.state.lock().in_flight, 0);

    // The callback is still spinning, but it already completed.
    let start = Instant::now();
    work.terminate();
    assert!(start.elapsed() < Duration::from_millis(500));

    release.store(true, Ordering::SeqCst);
    pool.shutdown()?;
    Ok(())
}

#[test]
fn test_terminate_from_own_callback() -> Result<()> {
    let pool = test_pool(1);
    let slot: Arc<Mutex<Option<PoolWork>>> = Arc::new(Mutex::new(None));
    let done = Arc::new(AtomicBool::new(false));

    let work = {
        let slot = Arc::clone(&slot);
        let done = Arc::clone(&done);
        pool.register(move |_| {
            if let Some(work) = slot.lock().as_ref() {
                work.terminate();
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    *slot.lock() = Some(work);
    if let Some(work) = slot.lock().as_ref() {
        work.submit();
    }

    assert!(wait_until(Duration::from_secs(1), || done.load(Ordering::SeqCst)));
    assert!(slot.lock().take().is_some());
    pool.shutdown()?;
    Ok(())
}

#[test]
fn test_may_run_long_grows_pool() -> Result<()> {
    let pool = PoolBuilder::new()
        .worker_threads(1)
        .max_threads(2)
        .try_build()?;
    let release = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicUsize::new(0));

    let work = {
        let release = Arc::clone(&release);
        let started = Arc::clone(&started);
        pool.register(move |_| {
            assert!(may_run_long());
            started.fetch_add(1, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    work.submit();
    work.submit();

    // The second invocation only runs because the first one grew the pool.
    assert!(wait_until(Duration::from_secs(2), || {
        started.load(Ordering::SeqCst) == 2
    }));
    assert_eq!(pool.num_threads(), 2);

    release.store(true, Ordering::SeqCst);
    work.terminate();
    pool.shutdown()?;
    Ok(())
}

#[test]
fn test_current_helpers_outside_pool() {
    assert!(!complete_current());
    assert!(!may_run_long());
}

#[test]
fn test_builder_validation() {
    assert!(PoolBuilder::new().worker_threads(4).max_threads(2).try_build().is_err());

    let pool = PoolBuilder::new().worker_threads(2).try_build();
    assert!(matches!(pool, Ok(p) if p.shared.cfg.max_threads == 8));
}

#[test]
fn test_builder_reconfigures_in_place() {
    let mut builder = PoolBuilder::new();
    builder.worker_threads(1).max_threads(2);

    let pool = builder.try_build();
    assert!(matches!(pool, Ok(p) if p.shared.cfg.max_threads == 2));

    builder.worker_threads(3);
    assert!(builder.try_build().is_err());
}

#[test]
#[should_panic(expected = "worker_threads must be greater than 0")]
fn test_builder_rejects_zero_workers() {
    let _ = PoolBuilder::new().worker_threads(0);
}
