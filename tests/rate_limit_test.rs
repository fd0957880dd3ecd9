//! Fixed-window rate limiting and override resolution.

use std::sync::Arc;
use std::time::Duration;

use workq::backend::InMemoryBackend;
use workq::clock::ManualClock;
use workq::config::RateLimiterConfig;
use workq::traffic::rate_limit::{MODE_RULES, ModeRule};
use workq::traffic::{Mode, RateLimitContext, TrafficShapingRateLimiter};

fn limiter() -> (Arc<ManualClock>, Arc<InMemoryBackend>, TrafficShapingRateLimiter) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let backend = Arc::new(InMemoryBackend::new(clock.clone()));
    let limiter = TrafficShapingRateLimiter::new(backend.clone(), RateLimiterConfig::default());
    (clock, backend, limiter)
}

#[tokio::test]
async fn sixth_hit_in_window_is_limited() {
    let (_, _, limiter) = limiter();
    let ctx = RateLimitContext::new("api", 5, true);

    for n in 1..=5 {
        let decision = limiter.increment_and_get("app", &ctx).await.unwrap();
        assert_eq!(decision.count, n);
        assert_eq!(decision.limited, n == 5, "hit {n}");
    }
    let sixth = limiter.increment_and_get("app", &ctx).await.unwrap();
    assert!(sixth.limited);
    assert!(sixth.enforced);
    assert_eq!(sixth.count, 6);
    assert_eq!(sixth.capacity, 5);
    assert!(sixth.retry_after >= Duration::from_secs(3));
    assert!(sixth.retry_after <= Duration::from_secs(4));
}

#[tokio::test]
async fn window_resets_after_its_length() {
    let (clock, _, limiter) = limiter();
    let ctx = RateLimitContext::new("api", 2, true);

    for _ in 0..3 {
        limiter.increment_and_get("app", &ctx).await.unwrap();
    }
    clock.advance(Duration::from_secs(1));

    let decision = limiter.increment_and_get("app", &ctx).await.unwrap();
    assert_eq!(decision.count, 1);
    assert!(!decision.limited);
}

#[tokio::test]
async fn subjects_and_namespaces_count_separately() {
    let (_, _, limiter) = limiter();
    let api = RateLimitContext::new("api", 1, true);
    let jobs = RateLimitContext::new("jobs", 1, true);

    assert_eq!(limiter.increment_and_get("a", &api).await.unwrap().count, 1);
    assert_eq!(limiter.increment_and_get("b", &api).await.unwrap().count, 1);
    assert_eq!(limiter.increment_and_get("a", &jobs).await.unwrap().count, 1);
    assert_eq!(limiter.increment_and_get("a", &api).await.unwrap().count, 2);
}

#[tokio::test]
async fn learning_mode_reports_without_enforcing() {
    let (_, _, limiter) = limiter();
    let ctx = RateLimitContext::new("api", 1, false);

    let decision = limiter.increment_and_get("app", &ctx).await.unwrap();
    assert!(decision.limited);
    assert!(!decision.enforced);
    assert_eq!(decision.retry_after, Duration::ZERO);
}

#[tokio::test]
async fn zero_capacity_limits_every_hit() {
    let (_, _, limiter) = limiter();
    let ctx = RateLimitContext::new("api", 0, true);
    assert!(limiter.increment_and_get("app", &ctx).await.unwrap().limited);
}

#[tokio::test]
async fn subject_capacity_override_beats_namespace_override() {
    let (_, _, limiter) = limiter();
    let ctx = RateLimitContext::new("api", 5, true);

    assert_eq!(limiter.resolve_capacity("app", &ctx).await.unwrap(), 5);

    limiter.set_capacity_override("api", None, 20).await.unwrap();
    assert_eq!(limiter.resolve_capacity("app", &ctx).await.unwrap(), 20);

    limiter
        .set_capacity_override("api", Some("app"), 50)
        .await
        .unwrap();
    assert_eq!(limiter.resolve_capacity("app", &ctx).await.unwrap(), 50);
    assert_eq!(limiter.resolve_capacity("other", &ctx).await.unwrap(), 20);

    assert!(limiter.clear_capacity_override("api", Some("app")).await.unwrap());
    assert_eq!(limiter.resolve_capacity("app", &ctx).await.unwrap(), 20);
    assert!(limiter.clear_capacity_override("api", None).await.unwrap());
    assert_eq!(limiter.resolve_capacity("app", &ctx).await.unwrap(), 5);
}

#[tokio::test]
async fn unparseable_capacity_override_falls_through() {
    use workq::backend::KeyValueBackend;

    let (_, backend, limiter) = limiter();
    let ctx = RateLimitContext::new("api", 5, true);
    backend
        .hset("workq.ratelimit.capacity", "api:app", "lots")
        .await
        .unwrap();
    limiter.set_capacity_override("api", None, 8).await.unwrap();

    assert_eq!(limiter.resolve_capacity("app", &ctx).await.unwrap(), 8);
}

#[tokio::test]
async fn mode_follows_rule_precedence() {
    let (_, _, limiter) = limiter();
    let ctx = RateLimitContext::new("api", 5, false);

    assert_eq!(limiter.resolve_mode("app", &ctx).await.unwrap(), Mode::Learning);

    limiter.set_learning_flag("api", None, false).await.unwrap();
    assert_eq!(limiter.resolve_mode("app", &ctx).await.unwrap(), Mode::Enforcing);

    limiter
        .set_learning_flag("api", Some("app"), true)
        .await
        .unwrap();
    assert_eq!(limiter.resolve_mode("app", &ctx).await.unwrap(), Mode::Learning);

    limiter.add_enforced_subject("api", "app").await.unwrap();
    assert_eq!(limiter.resolve_mode("app", &ctx).await.unwrap(), Mode::Enforcing);

    limiter.add_ignored_subject("api", "app").await.unwrap();
    assert_eq!(limiter.resolve_mode("app", &ctx).await.unwrap(), Mode::Learning);

    limiter.remove_ignored_subject("api", "app").await.unwrap();
    limiter.remove_enforced_subject("api", "app").await.unwrap();
    limiter.clear_learning_flag("api", Some("app")).await.unwrap();
    assert_eq!(limiter.resolve_mode("app", &ctx).await.unwrap(), Mode::Enforcing);
}

#[tokio::test]
async fn each_mode_rule_answers_only_for_its_own_source() {
    let (_, _, limiter) = limiter();
    let ctx = RateLimitContext::new("api", 5, true);
    limiter.add_ignored_subject("api", "app").await.unwrap();

    let answers: Vec<Option<Mode>> = {
        let mut out = Vec::new();
        for rule in MODE_RULES {
            out.push(limiter.apply_mode_rule(rule, "app", &ctx).await.unwrap());
        }
        out
    };
    assert_eq!(answers, vec![Some(Mode::Learning), None, None, None]);
    assert_eq!(
        limiter
            .apply_mode_rule(ModeRule::EnforcedSubject, "app", &ctx)
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn default_context_uses_configured_defaults() {
    let (_, _, limiter) = limiter();
    let ctx = limiter.default_context("api");
    assert_eq!(ctx.namespace, "api");
    assert_eq!(ctx.capacity, 10);
    assert!(!ctx.enforcing);
}

#[tokio::test]
async fn overrides_change_live_decisions() {
    let (_, _, limiter) = limiter();
    let ctx = limiter.default_context("api");
    limiter
        .set_capacity_override("api", Some("app"), 1)
        .await
        .unwrap();
    limiter.add_enforced_subject("api", "app").await.unwrap();

    let decision = limiter.increment_and_get("app", &ctx).await.unwrap();
    assert!(decision.limited);
    assert!(decision.enforced);
    assert_eq!(decision.capacity, 1);
}
