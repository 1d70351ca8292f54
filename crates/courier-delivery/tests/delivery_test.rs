//! End-to-end delivery scenarios against a mock receiver.
//!
//! Time is driven by `TestClock` and attempts are executed with
//! `process_due`, so backoff schedules are checked to the second without
//! sleeping.

mod common;

use anyhow::Result;
use common::TestEnv;
use courier_core::{
    signing::{self, SIGNATURE_HEADER},
    AttemptErrorKind, Clock, DeliveryEvent, DeliveryStatus, EventType,
};
use courier_delivery::DeliveryConfig;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn receiver_recovers_on_fourth_attempt() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .with_priority(2)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let registration = env.register(&format!("{}/hook", server.uri()), &["payment.received"]).await;
    let webhook_id = registration.webhook.id;

    let report = env.engine.dispatch(env.event("evt_1", EventType::PaymentReceived)).await?;
    assert_eq!(report.attempts.len(), 1);

    assert_eq!(env.engine.process_due().await?, 1);
    for minutes in [1, 5, 10] {
        assert_eq!(env.advance_and_process(minutes).await, 1);
    }

    let attempts = env.pair(webhook_id, "evt_1").await;
    assert_eq!(attempts.len(), 4);
    for attempt in &attempts[..3] {
        assert_eq!(attempt.status, DeliveryStatus::Retrying);
        assert_eq!(attempt.response_code, Some(500));
    }
    let last = &attempts[3];
    assert_eq!(last.attempt_number, 4);
    assert_eq!(last.status, DeliveryStatus::Success);
    assert_eq!(last.next_retry_at, None);
    assert!(env.registry.get(webhook_id).await?.last_called_at.is_some());

    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 4);
    for request in &requests {
        let signature = request.headers.get(SIGNATURE_HEADER).unwrap().to_str()?;
        assert!(signing::verify(signature, &request.body, &registration.secret));
    }
    Ok(())
}

#[tokio::test]
async fn always_failing_receiver_exhausts_after_five_attempts() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let webhook_id = env.register(&server.uri(), &["payment.received"]).await.webhook.id;
    let start = env.clock.now_utc();

    env.engine.dispatch(env.event("evt_1", EventType::PaymentReceived)).await?;
    env.engine.process_due().await?;
    for minutes in [1, 5, 10, 30] {
        assert_eq!(env.advance_and_process(minutes).await, 1);
    }

    // nothing left to run, even an hour later
    assert_eq!(env.advance_and_process(60).await, 0);
    assert_eq!(env.engine.queue_depth(), 0);

    let attempts = env.pair(webhook_id, "evt_1").await;
    assert_eq!(attempts.len(), 5);
    assert_eq!(attempts[4].status, DeliveryStatus::MaxRetriesExceeded);
    assert_eq!(attempts[4].response_body_excerpt.as_deref(), Some("unavailable"));

    let offsets: Vec<i64> =
        attempts.iter().map(|a| (a.timestamp - start).num_minutes()).collect();
    assert_eq!(offsets, vec![0, 1, 6, 16, 46]);

    for pair in attempts.windows(2) {
        assert_eq!(pair[1].attempt_number, pair[0].attempt_number + 1);
        assert!(pair[1].timestamp >= pair[0].next_retry_at.unwrap());
    }

    assert_eq!(server.received_requests().await.unwrap_or_default().len(), 5);

    let exhausted = env
        .events
        .events()
        .into_iter()
        .filter(|e| matches!(e, DeliveryEvent::Exhausted(_)))
        .count();
    assert_eq!(exhausted, 1);
    assert_eq!(env.engine.stats().await.exhausted_deliveries, 1);
    Ok(())
}

#[tokio::test]
async fn retry_never_fires_early() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let env = TestEnv::new();
    env.register(&server.uri(), &["payment.received"]).await;
    env.engine.dispatch(env.event("evt_1", EventType::PaymentReceived)).await?;
    env.engine.process_due().await?;

    env.clock.advance(std::time::Duration::from_secs(59));
    assert_eq!(env.engine.process_due().await?, 0);

    env.clock.advance(std::time::Duration::from_secs(1));
    assert_eq!(env.engine.process_due().await?, 1);
    Ok(())
}

#[tokio::test]
async fn dispatching_twice_delivers_once() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let webhook_id = env.register(&server.uri(), &["payment.received"]).await.webhook.id;

    env.engine.dispatch(env.event("evt_1", EventType::PaymentReceived)).await?;
    env.engine.dispatch(env.event("evt_1", EventType::PaymentReceived)).await?;
    env.engine.process_due().await?;
    env.engine.process_due().await?;

    assert_eq!(env.pair(webhook_id, "evt_1").await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn inactive_webhook_gets_no_attempts() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let registration = env
        .registry
        .register(courier_core::registry::NewWebhook {
            url: server.uri(),
            events: vec!["payment.received".into()],
            description: None,
            headers: Default::default(),
            is_active: Some(false),
        })
        .await?;

    let report = env.engine.dispatch(env.event("evt_1", EventType::PaymentReceived)).await?;
    env.engine.process_due().await?;

    assert_eq!(report.matched_webhooks, 0);
    assert!(env.pair(registration.webhook.id, "evt_1").await.is_empty());
    Ok(())
}

#[tokio::test]
async fn deactivation_skips_queued_retries() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let webhook_id = env.register(&server.uri(), &["payment.received"]).await.webhook.id;
    env.engine.dispatch(env.event("evt_1", EventType::PaymentReceived)).await?;
    env.engine.process_due().await?;

    env.registry
        .update(webhook_id, courier_core::registry::WebhookUpdate {
            is_active: Some(false),
            ..Default::default()
        })
        .await?;
    assert_eq!(env.advance_and_process(1).await, 1);

    let attempts = env.pair(webhook_id, "evt_1").await;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].status, DeliveryStatus::Failed);
    assert_eq!(attempts[1].error_kind, Some(AttemptErrorKind::Cancelled));

    // no further follow-up after a cancelled attempt
    assert_eq!(env.advance_and_process(60).await, 0);
    Ok(())
}

#[tokio::test]
async fn deleted_webhook_skips_queued_attempt() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let webhook_id = env.register(&server.uri(), &["payment.received"]).await.webhook.id;
    env.engine.dispatch(env.event("evt_1", EventType::PaymentReceived)).await?;
    env.registry.delete(webhook_id).await?;
    env.engine.process_due().await?;

    let attempts = env.pair(webhook_id, "evt_1").await;
    assert_eq!(attempts[0].status, DeliveryStatus::Failed);
    assert_eq!(attempts[0].error_kind, Some(AttemptErrorKind::Cancelled));
    Ok(())
}

#[tokio::test]
async fn rate_limited_attempt_retries_after_one_minute() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let webhook_id = env.register(&server.uri(), &["payment.received"]).await.webhook.id;
    env.registry.configure_rate_limits(webhook_id, 1, 100).await?;
    let start = env.clock.now_utc();

    env.engine.dispatch(env.event("evt_1", EventType::PaymentReceived)).await?;
    env.engine.dispatch(env.event("evt_2", EventType::PaymentReceived)).await?;
    assert_eq!(env.engine.process_due().await?, 2);

    let limited = env.pair(webhook_id, "evt_2").await;
    assert_eq!(limited[0].status, DeliveryStatus::Retrying);
    assert_eq!(limited[0].error_kind, Some(AttemptErrorKind::RateLimited));
    assert_eq!(limited[0].next_retry_at, Some(start + chrono::Duration::minutes(1)));

    assert_eq!(env.advance_and_process(1).await, 1);
    let limited = env.pair(webhook_id, "evt_2").await;
    assert_eq!(limited[1].status, DeliveryStatus::Success);
    Ok(())
}

#[tokio::test]
async fn deliveries_after_rotation_use_new_secret() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let registration = env.register(&server.uri(), &["payment.received"]).await;
    let rotation = env.registry.rotate_secret(registration.webhook.id).await?;

    env.engine.dispatch(env.event("evt_1", EventType::PaymentReceived)).await?;
    env.engine.process_due().await?;

    let requests = server.received_requests().await.unwrap_or_default();
    let request = &requests[0];
    let signature = request.headers.get(SIGNATURE_HEADER).unwrap().to_str()?;
    assert!(signing::verify(signature, &request.body, &rotation.new_secret));
    assert!(!signing::verify(signature, &request.body, &registration.secret));
    Ok(())
}

#[tokio::test]
async fn delivery_headers_and_body_match_stored_attempt() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::header("Content-Type", "application/json"))
        .and(matchers::header("X-Webhook-Event-Id", "evt_1"))
        .and(matchers::header("X-Webhook-Event-Type", "payment.received"))
        .and(matchers::header("X-Webhook-Attempt", "1"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let webhook_id = env.register(&server.uri(), &["payment.received"]).await.webhook.id;
    env.engine.dispatch(env.event("evt_1", EventType::PaymentReceived)).await?;
    env.engine.process_due().await?;

    let attempt = &env.pair(webhook_id, "evt_1").await[0];
    let request = &server.received_requests().await.unwrap_or_default()[0];
    assert_eq!(attempt.request_body.as_bytes(), request.body.as_slice());
    assert_eq!(
        attempt.request_headers[SIGNATURE_HEADER],
        request.headers.get(SIGNATURE_HEADER).unwrap().to_str()?
    );

    let body: serde_json::Value = serde_json::from_slice(&request.body)?;
    assert_eq!(body["id"], "evt_1");
    assert_eq!(body["type"], "payment.received");
    assert_eq!(body["data"]["amount"], 4200);
    Ok(())
}

#[tokio::test]
async fn enforced_allowlist_blocks_unlisted_destination() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let env = TestEnv::with_config(DeliveryConfig { enforce_ip_allowlist: true, ..Default::default() });
    let webhook_id = env.register(&server.uri(), &["payment.received"]).await.webhook.id;
    env.registry.configure_allowlist(webhook_id, &["10.0.0.0/8".to_string()], true).await?;

    env.engine.dispatch(env.event("evt_1", EventType::PaymentReceived)).await?;
    env.engine.process_due().await?;

    let attempt = &env.pair(webhook_id, "evt_1").await[0];
    assert_eq!(attempt.status, DeliveryStatus::Retrying);
    assert_eq!(attempt.error_kind, Some(AttemptErrorKind::Transport));
    Ok(())
}

#[tokio::test]
async fn unenforced_allowlist_only_warns() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let webhook_id = env.register(&server.uri(), &["payment.received"]).await.webhook.id;
    env.registry.configure_allowlist(webhook_id, &["10.0.0.0/8".to_string()], true).await?;

    env.engine.dispatch(env.event("evt_1", EventType::PaymentReceived)).await?;
    env.engine.process_due().await?;

    assert_eq!(env.pair(webhook_id, "evt_1").await[0].status, DeliveryStatus::Success);
    Ok(())
}

#[tokio::test]
async fn test_deliver_reports_single_outcome() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let env = TestEnv::new();
    let result = env.engine.test_deliver(&server.uri(), EventType::ProjectCreated).await?;

    assert_eq!(result.status, DeliveryStatus::Failed);
    assert_eq!(result.response_code, Some(503));
    assert!(env.store.all_attempts().await.is_empty());
    assert_eq!(env.engine.queue_depth(), 0);
    Ok(())
}
