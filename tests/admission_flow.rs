//! Rate limiting and circuit breaking in front of the registry.

use registry_shield::infrastructure::mocks::{MockCaptureLayer, MockClock};
use registry_shield::{
    AdmissionController, AdmissionError, CircuitState, HealthStatus, LimiterConfig, Metrics,
    Operation, RegistryError, ServiceEventKind, ServiceInfo, ShieldConfig, ValidationError,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;

fn controller(config: ShieldConfig) -> (AdmissionController, MockClock, Metrics) {
    let clock = MockClock::new(Instant::now());
    let metrics = Metrics::new();
    let controller = AdmissionController::new(config, Arc::new(clock.clone()), metrics.clone())
        .expect("valid config");
    (controller, clock, metrics)
}

fn svc(id: &str, name: &str) -> ServiceInfo {
    ServiceInfo::new(id, name, "10.0.0.1", 8080)
}

/// Open the breaker at `key` with failures the registry never produces itself.
fn trip(controller: &AdmissionController, key: &str) {
    let breaker = controller.breakers().get(key);
    for _ in 0..controller.breakers().config().failure_threshold {
        let _ = breaker.execute(|| Err::<(), _>("backend down"));
    }
}

#[test]
fn test_rejections_are_distinguishable() {
    let mut config = ShieldConfig::default();
    config.limits.deregistration = LimiterConfig::fixed_window(3, Duration::from_secs(1));
    config.breaker.failure_threshold = 2;
    let (controller, _, metrics) = controller(config);

    // Client faults pass through as registry errors
    let invalid = controller.register(svc("api-1", "")).unwrap_err();
    assert_eq!(
        invalid,
        AdmissionError::Registry(RegistryError::Validation(ValidationError::EmptyName))
    );
    assert_eq!(invalid.status_code(), 400);

    let missing = controller.deregister("ghost").unwrap_err();
    assert_eq!(missing.status_code(), 404);
    assert!(!missing.is_retryable());

    trip(&controller, "deregistration:api-1");
    let open = controller.deregister("api-1").unwrap_err();
    assert_eq!(open.status_code(), 503);
    assert!(open.is_retryable());

    // A repeated client fault still does not open anything
    assert_eq!(controller.deregister("ghost").unwrap_err().status_code(), 404);

    // Window exhausted: the limiter answers before the breaker
    let limited = controller.deregister("ghost").unwrap_err();
    assert_eq!(
        limited,
        AdmissionError::RateLimited {
            operation: Operation::Deregistration
        }
    );
    assert_eq!(limited.status_code(), 429);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.requests_rate_limited, 1);
    assert_eq!(snapshot.requests_short_circuited, 1);
    assert_eq!(snapshot.breaker_trips, 1);
}

#[test]
fn test_breaker_recovers_through_half_open() {
    let mut config = ShieldConfig::default();
    config.breaker.failure_threshold = 1;
    config.breaker.success_threshold = 1;
    config.breaker.max_requests = 1;
    config.breaker.timeout_ms = 5_000;
    let (controller, clock, _) = controller(config);
    controller.register(svc("api-1", "api")).unwrap();

    trip(&controller, "heartbeat:api-1");
    let breaker = controller.breakers().get("heartbeat:api-1");
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(controller.heartbeat("api-1").unwrap_err().status_code(), 503);

    clock.advance(Duration::from_secs(5));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    controller.heartbeat("api-1").unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[test]
fn test_breakers_isolate_services() {
    let mut config = ShieldConfig::default();
    config.breaker.failure_threshold = 1;
    let (controller, _, _) = controller(config);

    // A bad request is the caller's fault and leaves the breaker closed
    assert_eq!(controller.register(svc("", "payments")).unwrap_err().status_code(), 400);
    controller.register(svc("payments-1", "payments")).unwrap();
    assert_eq!(
        controller.breakers().get("registration:payments").state(),
        CircuitState::Closed
    );

    trip(&controller, "registration:payments");
    assert_eq!(
        controller.register(svc("payments-2", "payments")).unwrap_err(),
        AdmissionError::CircuitOpen {
            key: "registration:payments".into()
        }
    );
    controller.register(svc("orders-1", "orders")).unwrap();

    let snapshots = controller.breakers().snapshots();
    assert_eq!(snapshots["registration:payments"].state, CircuitState::Open);
    assert_eq!(snapshots["registration:orders"].state, CircuitState::Closed);
}

#[test]
fn test_sliding_window_heartbeat_limit() {
    let mut config = ShieldConfig::default();
    config.limits.heartbeat = LimiterConfig::sliding_window(5, Duration::from_secs(1));
    let (controller, clock, _) = controller(config);
    controller.register(svc("api-1", "api")).unwrap();

    for _ in 0..5 {
        controller.heartbeat("api-1").unwrap();
    }
    assert!(matches!(
        controller.heartbeat("api-1"),
        Err(AdmissionError::RateLimited { .. })
    ));

    clock.advance(Duration::from_millis(1010));
    controller.heartbeat("api-1").unwrap();

    let stats = controller.limiters().stats();
    let heartbeat = &stats["service_heartbeat"];
    assert_eq!(heartbeat.allowed_requests, 6);
    assert_eq!(heartbeat.rejected_requests, 1);
}

#[tokio::test]
async fn test_health_updates_reach_watchers() {
    let (controller, _, _) = controller(ShieldConfig::default());
    controller.register(svc("api-1", "api")).unwrap();
    let mut events = controller
        .registry()
        .watch("api", CancellationToken::new())
        .unwrap();

    controller
        .update_health("api-1", HealthStatus::Critical)
        .unwrap();
    controller
        .update_health("api-1", HealthStatus::Passing)
        .unwrap();

    assert_eq!(events.recv().await.unwrap().kind, ServiceEventKind::Unhealthy);
    assert_eq!(events.recv().await.unwrap().kind, ServiceEventKind::Healthy);
}

#[test]
fn test_breaker_transitions_are_logged() {
    let capture = MockCaptureLayer::new();
    let subscriber = tracing_subscriber::registry().with(capture.clone());

    let mut config = ShieldConfig::default();
    config.breaker.failure_threshold = 1;
    let (controller, _, _) = controller(config);
    controller.register(svc("api-1", "api")).unwrap();

    tracing::subscriber::with_default(subscriber, || {
        controller.heartbeat("ghost").unwrap_err();
        trip(&controller, "heartbeat:api-1");
        controller.heartbeat("api-1").unwrap_err();
    });

    assert_eq!(capture.with_message("registry operation failed").len(), 1);
    let opened = capture.with_message("circuit breaker opened");
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].level, Level::WARN);
    assert_eq!(opened[0].field("breaker"), Some("heartbeat:api-1"));

    let rejected = capture.with_message("operation rejected by circuit breaker");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].field("operation"), Some("service_heartbeat"));
}

#[test]
fn test_breakers_do_not_grow_with_departed_instances() {
    let (controller, _, _) = controller(ShieldConfig::default());

    for i in 0..1000 {
        controller.heartbeat(&format!("ghost-{}", i)).unwrap_err();
    }
    for i in 0..50 {
        let id = format!("api-{}", i);
        controller.register(svc(&id, "api")).unwrap();
        controller.heartbeat(&id).unwrap();
        controller.update_health(&id, HealthStatus::Passing).unwrap();
        controller.deregister(&id).unwrap();
    }
    assert_eq!(controller.breakers().len(), 1);

    controller.prune_breakers();
    assert!(controller.breakers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_started_controller_prunes_evicted_instances() {
    let mut config = ShieldConfig::default();
    config.registry.heartbeat_interval_ms = 100;
    let (controller, clock, _) = controller(config);
    controller.start().unwrap();

    controller.register(svc("api-1", "api").with_ttl(1)).unwrap();
    controller.heartbeat("api-1").unwrap();
    assert_eq!(controller.breakers().len(), 2);

    clock.advance(Duration::from_secs(2));
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(controller.registry().is_empty());
    assert!(controller.breakers().is_empty());

    controller.stop().await;
}
