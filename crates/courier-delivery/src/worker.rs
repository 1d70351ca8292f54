//! Delivery engine and its workers.
//!
//! Workers pop due tasks from the shared `DeliveryQueue`, take the
//! (webhook, event) pair lock, and run one attempt: rate limit, sign, POST,
//! classify, persist. The follow-up attempt row is inserted and queued only
//! after the current row's outcome has been stored, so attempts for a pair
//! stay strictly ordered.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_core::{
    allowlist::IpAllowlist, signing, AttemptErrorKind, Clock, CoreError, DeliveryAttempt,
    DeliveryEvent, DeliveryExhaustedEvent, DeliveryFailedEvent, DeliveryStatus, DeliveryStore,
    DeliverySucceededEvent, Event, EventHandler, EventType, NoOpEventHandler, Webhook,
    WebhookRegistry,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{resolve_destination, signed_headers, ClientConfig, DeliveryClient, DeliveryRequest, DeliveryResponse},
    dispatcher::{DispatchReport, Dispatcher},
    error::{DeliveryError, Result},
    probe::{DeliveryProbe, ProbeResult},
    queue::{DeliveryQueue, DeliveryTask, PairLocks},
    rate_limit::{InMemoryRateWindows, RateLimiter, RateLimits, RateWindowStore},
    retry::{RetryContext, RetryDecision, RetryPolicy},
    worker_pool::WorkerPool,
};

/// Pause after a worker-level failure before the task is tried again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Longest an idle worker sleeps before re-checking the queue.
    pub poll_interval: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Backoff table and attempt budget.
    pub retry_policy: RetryPolicy,

    /// Fail attempts whose destination resolves outside an enabled
    /// allowlist instead of only logging a warning.
    pub enforce_ip_allowlist: bool,

    /// Delay before re-queueing a task whose pair is locked by another
    /// worker.
    pub lock_retry_delay: Duration,

    /// Maximum time to wait for workers to finish on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            poll_interval: crate::DEFAULT_POLL_INTERVAL,
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            enforce_ip_allowlist: false,
            lock_retry_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Statistics for delivery engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Number of active delivery workers.
    pub active_workers: usize,
    /// Attempts executed since startup, including cancelled ones.
    pub attempts_processed: u64,
    /// Attempts answered with 2xx.
    pub successful_deliveries: u64,
    /// Failed attempts, whether or not a retry was scheduled.
    pub failed_attempts: u64,
    /// Pairs that ran out of attempts.
    pub exhausted_deliveries: u64,
    /// Attempts skipped because their webhook was deactivated or deleted.
    pub cancelled_attempts: u64,
    /// Attempts currently executing.
    pub in_flight_deliveries: u64,
}

/// State shared by the engine and every worker.
pub(crate) struct WorkerContext {
    pub(crate) registry: WebhookRegistry,
    pub(crate) store: Arc<dyn DeliveryStore>,
    pub(crate) queue: Arc<DeliveryQueue>,
    pub(crate) locks: PairLocks,
    pub(crate) limiter: RateLimiter,
    pub(crate) client: Arc<DeliveryClient>,
    pub(crate) config: DeliveryConfig,
    pub(crate) stats: Arc<RwLock<EngineStats>>,
    pub(crate) event_handler: Arc<dyn EventHandler>,
    pub(crate) clock: Arc<dyn Clock>,
}

/// Main delivery engine coordinating webhook delivery workers.
pub struct DeliveryEngine {
    context: Arc<WorkerContext>,
    dispatcher: Dispatcher,
    probe: DeliveryProbe,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
}

impl DeliveryEngine {
    /// Creates an engine that publishes no outcome events.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the configuration is invalid
    /// or the HTTP client cannot be built.
    pub fn new(
        registry: WebhookRegistry,
        store: Arc<dyn DeliveryStore>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::with_event_handler(registry, store, config, clock, Arc::new(NoOpEventHandler))
    }

    /// Creates an engine publishing outcomes to `event_handler`, with
    /// process-local rate windows.
    ///
    /// # Errors
    ///
    /// See [`DeliveryEngine::new`].
    pub fn with_event_handler(
        registry: WebhookRegistry,
        store: Arc<dyn DeliveryStore>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        Self::with_rate_windows(
            registry,
            store,
            config,
            clock,
            event_handler,
            Arc::new(InMemoryRateWindows::new()),
        )
    }

    /// Creates an engine whose rate windows live in `rate_windows`.
    ///
    /// # Errors
    ///
    /// See [`DeliveryEngine::new`].
    pub fn with_rate_windows(
        registry: WebhookRegistry,
        store: Arc<dyn DeliveryStore>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
        rate_windows: Arc<dyn RateWindowStore>,
    ) -> Result<Self> {
        if config.retry_policy.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be at least 1"));
        }
        if config.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }

        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);
        let defaults = RateLimits {
            per_minute: registry.config().default_rate_limit_per_minute,
            per_hour: registry.config().default_rate_limit_per_hour,
        };
        let limiter = RateLimiter::new(rate_windows, clock.clone(), defaults);
        let queue = Arc::new(DeliveryQueue::new());
        let dispatcher =
            Dispatcher::new(registry.clone(), store.clone(), queue.clone(), clock.clone());
        let probe = DeliveryProbe::new(
            client.clone(),
            clock.clone(),
            registry.config().allow_insecure_urls,
        );

        let context = Arc::new(WorkerContext {
            registry,
            store,
            queue,
            locks: PairLocks::new(),
            limiter,
            client,
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            event_handler,
            clock,
        });

        Ok(Self {
            context,
            dispatcher,
            probe,
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
        })
    }

    /// Handle for dispatching events into this engine.
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Handle for running test deliveries.
    pub fn probe(&self) -> DeliveryProbe {
        self.probe.clone()
    }

    /// Dispatches `event` to its subscribers.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::dispatch`].
    pub async fn dispatch(&self, event: Event) -> Result<DispatchReport> {
        self.dispatcher.dispatch(event).await
    }

    /// Sends one synthetic event to `url` without retries.
    ///
    /// # Errors
    ///
    /// See [`DeliveryProbe::run`].
    pub async fn test_deliver(&self, url: &str, event_type: EventType) -> Result<ProbeResult> {
        self.probe.run(url, event_type).await
    }

    /// Re-queues every stored `pending` attempt at its scheduled time, and
    /// every `retrying` attempt whose follow-up row was never inserted.
    ///
    /// Called once at startup so attempts scheduled before a restart still
    /// run.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the store cannot be read.
    pub async fn recover_pending(&self) -> Result<usize> {
        let pending = self.context.store.pending_attempts().await?;
        for attempt in &pending {
            self.context.queue.push(DeliveryTask::for_attempt(attempt), attempt.scheduled_at);
        }

        let stalled = self.context.store.stalled_retries().await?;
        let now = self.context.clock.now_utc();
        for attempt in &stalled {
            self.context.queue.push(DeliveryTask::for_attempt(attempt), now);
        }

        info!(
            recovered = pending.len(),
            stalled_retries = stalled.len(),
            "re-queued pending delivery attempts"
        );
        Ok(pending.len() + stalled.len())
    }

    /// Starts the delivery engine with configured worker pool.
    ///
    /// Returns immediately after spawning workers. Use `shutdown()` to stop
    /// gracefully, or drop the engine to cancel workers immediately.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the engine is already
    /// running.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::configuration("delivery engine already started"));
        }

        info!(
            worker_count = self.context.config.worker_count,
            poll_interval_ms = self.context.config.poll_interval.as_millis(),
            "starting webhook delivery engine"
        );

        let mut worker_pool =
            WorkerPool::new(self.context.clone(), self.cancellation_token.clone());
        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started successfully");
        Ok(())
    }

    /// Gracefully shuts down the delivery engine.
    ///
    /// Signals all workers to stop taking new tasks and waits for in-flight
    /// attempts to finish. Queued tasks stay `pending` in the store and are
    /// recovered on the next start.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if workers do not stop in
    /// time.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.context.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.context.stats.read().await.clone()
    }

    /// Whether workers have been started and at least one is still running.
    pub fn is_running(&self) -> bool {
        self.worker_pool.as_ref().is_some_and(WorkerPool::has_active_workers)
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> Arc<WorkerContext> {
        self.context.clone()
    }

    /// Number of tasks waiting in the queue, due or not.
    pub fn queue_depth(&self) -> usize {
        self.context.queue.len()
    }

    /// Runs every task due at the clock's current time on the calling task.
    ///
    /// Tasks that fall due while draining, such as zero-delay retries, run
    /// too. Intended for tests and tooling that drive time manually instead
    /// of starting workers.
    ///
    /// # Errors
    ///
    /// Returns the first storage failure.
    pub async fn process_due(&self) -> Result<usize> {
        let worker = DeliveryWorker::new(0, self.context.clone(), self.cancellation_token.clone());

        let mut processed = 0;
        while let Some(task) = self.context.queue.pop_due(self.context.clock.now_utc()) {
            worker.process_task(task).await?;
            processed += 1;
        }
        Ok(processed)
    }
}

/// Individual worker that executes queued attempts.
pub(crate) struct DeliveryWorker {
    id: usize,
    context: Arc<WorkerContext>,
    cancellation_token: CancellationToken,
}

impl DeliveryWorker {
    pub(crate) fn new(
        id: usize,
        context: Arc<WorkerContext>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, context, cancellation_token }
    }

    /// Main worker loop: executes due tasks until cancelled.
    pub(crate) async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            let now = self.context.clock.now_utc();
            if let Some(task) = self.context.queue.pop_due(now) {
                if let Err(error) = self.process_task(task.clone()).await {
                    error!(
                        worker_id = self.id,
                        attempt_id = %task.attempt_id,
                        error = %error,
                        "attempt processing failed"
                    );
                    self.context.queue.push(task, now + to_chrono(ERROR_BACKOFF));
                    tokio::select! {
                        () = self.context.clock.sleep(ERROR_BACKOFF) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                }
                continue;
            }

            let wait = self.context.queue.next_due().map_or(self.context.config.poll_interval, |due| {
                (due - now).to_std().unwrap_or(Duration::ZERO).min(self.context.config.poll_interval)
            });

            tokio::select! {
                () = self.context.clock.sleep(wait) => {}
                () = self.context.queue.notified() => {}
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Executes one queued task under its pair lock.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if reading or persisting the attempt
    /// fails.
    pub(crate) async fn process_task(&self, task: DeliveryTask) -> Result<()> {
        let Some(_guard) = self.context.locks.try_lock(task.webhook_id, &task.event_id) else {
            debug!(
                worker_id = self.id,
                webhook_id = %task.webhook_id,
                event_id = %task.event_id,
                "pair busy; requeueing task"
            );
            let due = self.context.clock.now_utc() + to_chrono(self.context.config.lock_retry_delay);
            self.context.queue.push(task, due);
            return Ok(());
        };

        let Some(attempt) = self.context.store.find_attempt(task.attempt_id).await? else {
            warn!(worker_id = self.id, attempt_id = %task.attempt_id, "queued attempt not found");
            return Ok(());
        };
        if attempt.status == DeliveryStatus::Retrying {
            return self.resume_follow_up(&attempt).await;
        }
        if attempt.status != DeliveryStatus::Pending {
            debug!(
                worker_id = self.id,
                attempt_id = %attempt.id,
                status = %attempt.status,
                "attempt already processed"
            );
            return Ok(());
        }

        {
            let mut stats = self.context.stats.write().await;
            stats.in_flight_deliveries += 1;
        }

        let result = self.execute(attempt).await;

        {
            let mut stats = self.context.stats.write().await;
            stats.in_flight_deliveries -= 1;
            stats.attempts_processed += 1;
        }

        result
    }

    async fn execute(&self, mut attempt: DeliveryAttempt) -> Result<()> {
        let webhook = match self.context.registry.find_any(attempt.webhook_id).await? {
            Some(webhook) if webhook.is_deleted() => {
                self.context.limiter.forget(webhook.id);
                return self.cancel(attempt, "webhook deleted").await;
            },
            Some(webhook) if !webhook.is_active => {
                return self.cancel(attempt, "webhook deactivated").await;
            },
            Some(webhook) => webhook,
            None => {
                self.context.limiter.forget(attempt.webhook_id);
                return self.cancel(attempt, "webhook not found").await;
            },
        };

        debug!(
            worker_id = self.id,
            webhook_id = %webhook.id,
            event_id = %attempt.event_id,
            attempt_number = attempt.attempt_number,
            "attempting webhook delivery"
        );

        let outcome = self.attempt_delivery(&webhook, &mut attempt).await;
        self.record_outcome(&webhook, attempt, outcome).await
    }

    /// Rate limit, sign, and POST. The returned error is the attempt's
    /// failure classification, never a storage failure.
    async fn attempt_delivery(
        &self,
        webhook: &Webhook,
        attempt: &mut DeliveryAttempt,
    ) -> Result<DeliveryResponse> {
        attempt.request_url.clone_from(&webhook.url);

        if !self.context.limiter.try_acquire(webhook) {
            return Err(DeliveryError::RateLimited);
        }

        let signature = signing::sign(&webhook.active_secret, attempt.request_body.as_bytes())
            .map_err(|e| DeliveryError::signing(e.to_string()))?;
        attempt.request_headers = signed_headers(
            &webhook.custom_headers,
            &attempt.event_id,
            attempt.event_type,
            attempt.attempt_number,
            signature,
        );

        if webhook.security.ip_allowlist_enabled {
            self.check_allowlist(webhook).await?;
        }

        let response = self
            .context
            .client
            .deliver(DeliveryRequest {
                delivery_id: attempt.id,
                event_id: attempt.event_id.clone(),
                url: attempt.request_url.clone(),
                headers: attempt.request_headers.clone(),
                body: Bytes::from(attempt.request_body.clone()),
                attempt_number: attempt.attempt_number,
            })
            .await?;

        if response.is_success {
            Ok(response)
        } else {
            Err(DeliveryError::receiver(response.status_code, response.body_excerpt))
        }
    }

    async fn check_allowlist(&self, webhook: &Webhook) -> Result<()> {
        let enforce = self.context.config.enforce_ip_allowlist;
        let allowlist = IpAllowlist::parse(&webhook.security.ip_allowlist)
            .map_err(|e| DeliveryError::transport(format!("invalid ip allowlist: {e}")))?;

        let addrs = match resolve_destination(&webhook.url).await {
            Ok(addrs) => addrs,
            Err(error) if !enforce => {
                warn!(webhook_id = %webhook.id, error = %error, "could not resolve destination for allowlist check");
                return Ok(());
            },
            Err(error) => return Err(error),
        };

        if addrs.iter().any(|addr| allowlist.contains(*addr)) {
            return Ok(());
        }

        if enforce {
            return Err(DeliveryError::transport(format!(
                "destination {addrs:?} is outside the webhook ip allowlist"
            )));
        }
        warn!(
            webhook_id = %webhook.id,
            resolved = ?addrs,
            "destination is outside the webhook ip allowlist"
        );
        Ok(())
    }

    async fn record_outcome(
        &self,
        webhook: &Webhook,
        mut attempt: DeliveryAttempt,
        outcome: Result<DeliveryResponse>,
    ) -> Result<()> {
        let now = self.context.clock.now_utc();
        attempt.timestamp = now;

        let error = match outcome {
            Ok(response) => {
                attempt.status = DeliveryStatus::Success;
                attempt.response_code = Some(response.status_code);
                attempt.response_body_excerpt = Some(response.body_excerpt);
                attempt.next_retry_at = None;
                self.context.store.update_attempt(attempt.clone()).await?;
                self.context.registry.mark_called(webhook.id, now).await?;

                {
                    let mut stats = self.context.stats.write().await;
                    stats.successful_deliveries += 1;
                }

                info!(
                    worker_id = self.id,
                    webhook_id = %webhook.id,
                    event_id = %attempt.event_id,
                    attempt_number = attempt.attempt_number,
                    status_code = response.status_code,
                    duration_ms = response.duration.as_millis(),
                    "webhook delivered successfully"
                );

                self.context
                    .event_handler
                    .handle_event(DeliveryEvent::Succeeded(DeliverySucceededEvent {
                        delivery_id: attempt.id,
                        webhook_id: webhook.id,
                        event_id: attempt.event_id,
                        attempt_number: attempt.attempt_number,
                        response_code: response.status_code,
                        delivered_at: now,
                    }))
                    .await;
                return Ok(());
            },
            Err(error) => error,
        };

        attempt.response_code = error.status_code();
        if let DeliveryError::Receiver { body, .. } = &error {
            attempt.response_body_excerpt = Some(body.clone());
        }
        attempt.error_message = Some(error.to_string());
        attempt.error_kind = error.attempt_error_kind();

        let decision = RetryContext::new(
            attempt.attempt_number,
            error.clone(),
            now,
            self.context.config.retry_policy.clone(),
        )
        .decide_retry();

        match decision {
            RetryDecision::Retry { next_attempt_at } => {
                attempt.status = DeliveryStatus::Retrying;
                attempt.next_retry_at = Some(next_attempt_at);
                self.context.store.update_attempt(attempt.clone()).await?;
                self.schedule_next(webhook, &attempt, next_attempt_at).await?;

                {
                    let mut stats = self.context.stats.write().await;
                    stats.failed_attempts += 1;
                }

                warn!(
                    worker_id = self.id,
                    webhook_id = %webhook.id,
                    event_id = %attempt.event_id,
                    attempt_number = attempt.attempt_number,
                    next_retry_at = %next_attempt_at,
                    error = %error,
                    "delivery failed, retry scheduled"
                );
                self.publish_failure(&attempt, Some(next_attempt_at)).await;
            },
            RetryDecision::GiveUp { reason, exhausted: true } => {
                attempt.status = DeliveryStatus::MaxRetriesExceeded;
                attempt.next_retry_at = None;
                self.context.store.update_attempt(attempt.clone()).await?;

                {
                    let mut stats = self.context.stats.write().await;
                    stats.failed_attempts += 1;
                    stats.exhausted_deliveries += 1;
                }

                error!(
                    worker_id = self.id,
                    webhook_id = %webhook.id,
                    event_id = %attempt.event_id,
                    attempts = attempt.attempt_number,
                    reason = %reason,
                    "delivery exhausted all attempts"
                );

                self.context
                    .event_handler
                    .handle_event(DeliveryEvent::Exhausted(DeliveryExhaustedEvent {
                        delivery_id: attempt.id,
                        webhook_id: webhook.id,
                        event_id: attempt.event_id,
                        attempts: attempt.attempt_number,
                        last_error: error.to_string(),
                        exhausted_at: now,
                    }))
                    .await;
            },
            RetryDecision::GiveUp { reason, exhausted: false } => {
                attempt.status = DeliveryStatus::Failed;
                attempt.next_retry_at = None;
                self.context.store.update_attempt(attempt.clone()).await?;

                {
                    let mut stats = self.context.stats.write().await;
                    stats.failed_attempts += 1;
                }

                error!(
                    worker_id = self.id,
                    webhook_id = %webhook.id,
                    event_id = %attempt.event_id,
                    attempt_number = attempt.attempt_number,
                    reason = %reason,
                    "delivery failed permanently"
                );
                self.publish_failure(&attempt, None).await;
            },
        }

        Ok(())
    }

    /// Re-issues the follow-up of a `retrying` row whose successor insert
    /// failed, at the time recorded on the row.
    async fn resume_follow_up(&self, attempt: &DeliveryAttempt) -> Result<()> {
        let Some(webhook) = self.context.registry.find_any(attempt.webhook_id).await? else {
            warn!(
                worker_id = self.id,
                attempt_id = %attempt.id,
                webhook_id = %attempt.webhook_id,
                "retrying attempt has no webhook; follow-up dropped"
            );
            return Ok(());
        };

        let due_at = attempt.next_retry_at.unwrap_or_else(|| self.context.clock.now_utc());
        debug!(
            worker_id = self.id,
            webhook_id = %webhook.id,
            event_id = %attempt.event_id,
            attempt_number = attempt.attempt_number + 1,
            due_at = %due_at,
            "re-issuing follow-up attempt"
        );
        self.schedule_next(&webhook, attempt, due_at).await
    }

    /// Inserts and queues attempt `n + 1`. An existing row for that number
    /// means another path already scheduled it.
    async fn schedule_next(
        &self,
        webhook: &Webhook,
        attempt: &DeliveryAttempt,
        due_at: DateTime<Utc>,
    ) -> Result<()> {
        let next = DeliveryAttempt::pending(
            webhook,
            attempt.event_id.clone(),
            attempt.event_type,
            attempt.attempt_number + 1,
            attempt.request_body.clone(),
            due_at,
            self.context.clock.now_utc(),
        );
        let task = DeliveryTask::for_attempt(&next);

        match self.context.store.insert_attempt(next).await {
            Ok(()) => {
                self.context.queue.push(task, due_at);
                Ok(())
            },
            Err(CoreError::Conflict(_)) => {
                debug!(
                    webhook_id = %webhook.id,
                    event_id = %attempt.event_id,
                    attempt_number = attempt.attempt_number + 1,
                    "follow-up attempt already scheduled"
                );
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn cancel(&self, mut attempt: DeliveryAttempt, reason: &str) -> Result<()> {
        let error = DeliveryError::cancelled(reason);
        attempt.status = DeliveryStatus::Failed;
        attempt.error_kind = error.attempt_error_kind();
        attempt.error_message = Some(error.to_string());
        attempt.next_retry_at = None;
        attempt.timestamp = self.context.clock.now_utc();
        self.context.store.update_attempt(attempt.clone()).await?;

        {
            let mut stats = self.context.stats.write().await;
            stats.cancelled_attempts += 1;
        }

        info!(
            worker_id = self.id,
            webhook_id = %attempt.webhook_id,
            event_id = %attempt.event_id,
            attempt_number = attempt.attempt_number,
            reason,
            "skipping queued attempt"
        );
        self.publish_failure(&attempt, None).await;
        Ok(())
    }

    async fn publish_failure(
        &self,
        attempt: &DeliveryAttempt,
        next_retry_at: Option<DateTime<Utc>>,
    ) {
        self.context
            .event_handler
            .handle_event(DeliveryEvent::Failed(DeliveryFailedEvent {
                delivery_id: attempt.id,
                webhook_id: attempt.webhook_id,
                event_id: attempt.event_id.clone(),
                attempt_number: attempt.attempt_number,
                error_kind: attempt.error_kind.unwrap_or(AttemptErrorKind::Transport),
                error_message: attempt.error_message.clone().unwrap_or_default(),
                next_retry_at,
            }))
            .await;
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(1))
}
