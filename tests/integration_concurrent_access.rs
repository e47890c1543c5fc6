//! Concurrency behaviour under contended access.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use breakwater::{BreakerConfig, BreakerError, CircuitBreaker, Registry, State};
use futures::future::join_all;
use thiserror::Error;
use tokio::time::sleep;

#[derive(Error, Debug)]
#[error("backend unavailable")]
struct BackendError;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closed_breaker_admits_all_concurrent_callers() {
    let breaker = Arc::new(CircuitBreaker::with_defaults("db"));
    let completed = Arc::new(AtomicU32::new(0));

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let breaker = Arc::clone(&breaker);
            let completed = Arc::clone(&completed);
            tokio::spawn(async move {
                breaker
                    .execute(|| async {
                        sleep(Duration::from_millis(2)).await;
                        completed.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BackendError>(())
                    })
                    .await
            })
        })
        .collect();

    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 50);
    assert_eq!(breaker.counts().total_successes, 50);
    assert_eq!(breaker.state(), State::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn half_open_admits_at_most_the_probe_limit() {
    let config = BreakerConfig::default()
        .with_failure_threshold(1)
        .with_success_threshold(20)
        .with_timeout(Duration::ZERO)
        .with_max_half_open_requests(3);
    let breaker = Arc::new(CircuitBreaker::new("db", config).unwrap());

    // Trip, then let the zero timeout move it straight to half-open.
    let _ = breaker
        .execute(|| async { Err::<(), _>(BackendError) })
        .await;
    assert_eq!(breaker.state(), State::HalfOpen);

    // Every admitted probe parks on the watch channel until all tasks
    // have either been admitted or rejected, so admissions overlap fully.
    let invoked = Arc::new(AtomicU32::new(0));
    let (release, parked) = tokio::sync::watch::channel(false);

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let breaker = Arc::clone(&breaker);
            let invoked = Arc::clone(&invoked);
            let mut parked = parked.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        parked.wait_for(|released| *released).await.unwrap();
                        Ok::<_, BackendError>(())
                    })
                    .await
            })
        })
        .collect();

    // Wait for rejections to settle, then release the admitted probes.
    sleep(Duration::from_millis(50)).await;
    release.send(true).unwrap();

    let mut successes = 0;
    let mut probe_limited = 0;
    for result in join_all(tasks).await {
        match result.unwrap() {
            Ok(()) => successes += 1,
            Err(BreakerError::ProbeLimit) => probe_limited += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(successes, 3);
    assert_eq!(probe_limited, 17);
    assert_eq!(invoked.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_call_outcome_from_old_generation_is_discarded() {
    let config = BreakerConfig::default()
        .with_failure_threshold(2)
        .with_timeout(Duration::from_secs(60));
    let breaker = Arc::new(CircuitBreaker::new("db", config).unwrap());

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let slow = {
        let breaker = Arc::clone(&breaker);
        tokio::spawn(async move {
            breaker
                .execute(|| async {
                    rx.await.unwrap();
                    Ok::<_, BackendError>("late")
                })
                .await
        })
    };
    while breaker.counts().requests < 1 {
        sleep(Duration::from_millis(1)).await;
    }

    for _ in 0..2 {
        let _ = breaker
            .execute(|| async { Err::<(), _>(BackendError) })
            .await;
    }
    let tripped = breaker.snapshot();
    assert_eq!(tripped.state, State::Open);

    // The caller still gets its success; the breaker ignores it.
    tx.send(()).unwrap();
    assert_eq!(slow.await.unwrap().unwrap(), "late");

    let after = breaker.snapshot();
    assert_eq!(after.state, State::Open);
    assert_eq!(after.generation, tripped.generation);
    assert_eq!(after.counts, tripped.counts);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registry_lookups_share_one_instance() {
    let registry = Arc::new(Registry::new());

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get("db") })
        })
        .collect();

    let breakers: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    for breaker in &breakers[1..] {
        assert!(Arc::ptr_eq(&breakers[0], breaker));
    }
    assert_eq!(registry.names(), vec!["db".to_owned()]);
}
