mod common;

use common::{harness, TestError};
use fetchgate::{
    BackoffStrategy, CategoryLimit, Decision, Descriptor, GovernanceConfig, GovernanceError,
    ManualClock, RateLimitConfig, RateLimiter, Request, RetryState, TransportError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn api_config() -> GovernanceConfig {
    let mut config = GovernanceConfig::default();
    config.rate_limit.categories.insert("api".into(), CategoryLimit::new(10, 2.0));
    config.queue.max_concurrency = 16;
    config
}

fn ok(value: &'static str) -> impl FnMut() -> std::future::Ready<Result<String, TransportError<TestError>>> {
    move || std::future::ready(Ok(value.to_string()))
}

#[tokio::test]
async fn eleventh_request_backs_off_until_a_token_refills() {
    let h = harness(api_config());

    for n in 0..10 {
        let request = Request::new(format!("item-{n}"), "api").uncached();
        h.layer.issue(request, ok("ok")).await.unwrap();
    }
    assert!(h.sleeper.calls().is_empty());

    let result = h.layer.issue(Request::new("item-10", "api").uncached(), ok("late")).await;
    assert_eq!(result.unwrap(), "late");
    // 500ms then 1000ms: by t+1500 three tokens have refilled.
    assert_eq!(h.sleeper.calls(), vec![Duration::from_millis(500), Duration::from_millis(1_000)]);
}

#[test]
fn exhausted_bucket_schedule_is_exponential_then_rejects() {
    let clock = ManualClock::new();
    let mut config = RateLimitConfig::default();
    config.categories.insert("api".into(), CategoryLimit::new(10, 2.0));
    let limiter = RateLimiter::new(config, Arc::new(clock)).unwrap();
    let descriptor = Descriptor::new("api");

    for _ in 0..10 {
        assert!(limiter.admit(&descriptor, &mut RetryState::new("warm")).is_proceed());
    }

    // Time stands still, so every check sees the same 500ms wait.
    let mut retry = RetryState::new("eleventh");
    let delays: Vec<Duration> = (0..3)
        .map(|_| match limiter.admit(&descriptor, &mut retry) {
            Decision::Backoff { delay, .. } => delay,
            other => panic!("expected backoff, got {other:?}"),
        })
        .collect();
    assert_eq!(
        delays,
        vec![Duration::from_millis(500), Duration::from_millis(1_000), Duration::from_millis(2_000)]
    );
    assert!(matches!(
        limiter.admit(&descriptor, &mut retry),
        Decision::Reject(fetchgate::Rejection::RateLimitExceeded { .. })
    ));
}

#[test]
fn linear_backoff_applies_per_category() {
    let clock = ManualClock::new();
    let mut config = RateLimitConfig::default();
    config.categories.insert(
        "slow".into(),
        CategoryLimit::new(1, 2.0).backoff(BackoffStrategy::Linear).max_retries(5),
    );
    let limiter = RateLimiter::new(config, Arc::new(clock)).unwrap();
    let descriptor = Descriptor::new("slow");
    assert!(limiter.admit(&descriptor, &mut RetryState::new("warm")).is_proceed());

    let mut retry = RetryState::new("k");
    let delays: Vec<u128> = (0..3)
        .map(|_| match limiter.admit(&descriptor, &mut retry) {
            Decision::Backoff { delay, .. } => delay.as_millis(),
            other => panic!("expected backoff, got {other:?}"),
        })
        .collect();
    assert_eq!(delays, vec![500, 1_000, 1_500]);
    assert_eq!(retry.strategy, BackoffStrategy::Linear);
}

#[tokio::test]
async fn zero_retries_surfaces_rate_limit_exceeded_immediately() {
    let mut config = api_config();
    config.rate_limit.categories.insert("tiny".into(), CategoryLimit::new(1, 1.0).max_retries(0));
    let h = harness(config);

    h.layer.issue(Request::new("a", "tiny").uncached(), ok("a")).await.unwrap();
    let err = h.layer.issue(Request::new("b", "tiny").uncached(), ok("b")).await.unwrap_err();

    assert!(err.is_rate_limited());
    assert_eq!(err.retry_after(), Some(Duration::from_millis(1_000)));
    assert!(h.sleeper.calls().is_empty());
}

#[tokio::test]
async fn server_throttling_retries_with_hint_then_gives_up() {
    let h = harness(api_config());
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let err = h
        .layer
        .issue(Request::new("k", "api"), move || {
            seen.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err::<String, _>(TransportError::<TestError>::rate_limited_secs(2)))
        })
        .await
        .unwrap_err();

    assert_eq!(err, GovernanceError::MaxRetriesExceeded { category: "api".into(), attempts: 4 });
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        h.sleeper.calls(),
        vec![Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)]
    );
}

#[tokio::test]
async fn server_throttling_without_hint_waits_one_second() {
    let h = harness(api_config());
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let value = h
        .layer
        .issue(Request::new("k", "api"), move || {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if n == 0 {
                Err(TransportError::RateLimited { retry_after: None })
            } else {
                Ok::<_, TransportError<TestError>>("after".to_string())
            })
        })
        .await
        .unwrap();

    assert_eq!(value, "after");
    assert_eq!(h.sleeper.calls(), vec![Duration::from_secs(1)]);
}

#[tokio::test]
async fn oversized_payload_is_rejected_before_queue_and_bucket() {
    let h = harness(api_config());
    let body = "x".repeat(2 * 1024 * 1024);
    let request = Request::new("upload", "api").with_body(&body).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let err = h
        .layer
        .issue(request, move || {
            seen.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok::<_, TransportError<TestError>>(String::new()))
        })
        .await
        .unwrap_err();

    assert!(err.is_payload_too_large());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.layer.limiter().bucket_count(), 0);
    assert_eq!(h.layer.queue_size() + h.layer.active_count(), 0);
}
