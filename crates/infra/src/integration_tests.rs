//! Integration tests for the full queue pipeline.
//!
//! Tests: submit → JobStore → Dispatcher → handler → LeaseManager →
//! RetryController / Sweeper → StatusEvent
//!
//! Verifies:
//! - Duplicate submissions collapse onto one job
//! - Expired leases are recovered exactly once
//! - Lower lanes and quiet tenants are never starved
//! - Failures walk the retry path to completion or the dead-letter state

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, mpsc};
    use std::thread;
    use std::time::{Duration, Instant};

    use pipeq_core::{
        Clock, ErrorClass, IdempotencyKey, JobError, JobState, Lane, ManualClock, NewJob,
        PayloadRef, TenantId, UserId, WorkerId,
    };
    use pipeq_events::StatusEvent;

    use crate::config::{PoolConfig, QueueConfig, QuotaTier};
    use crate::jobs::{
        CancelOutcome, DispatchOutcome, HandlerError, HandlerOutcome, InMemoryJobStore, JobQueue,
        QueueError, ReleaseOutcome, RetryPolicy,
    };

    struct Harness {
        queue: JobQueue,
        store: Arc<InMemoryJobStore>,
        clock: Arc<ManualClock>,
    }

    fn test_config() -> QueueConfig {
        QueueConfig {
            lease_duration: Duration::from_secs(30),
            retry: RetryPolicy::fixed(Duration::from_secs(1)),
            poll_interval: Duration::from_millis(5),
            ..QueueConfig::default()
        }
    }

    fn harness(config: QueueConfig) -> Harness {
        let store = InMemoryJobStore::arc();
        let clock = Arc::new(ManualClock::starting_now());
        let queue =
            JobQueue::with_clock(store.clone(), config, clock.clone()).expect("valid config");
        Harness { queue, store, clock }
    }

    fn job_for(tenant: TenantId, user: UserId, lane: Lane, key: &str) -> NewJob {
        NewJob::new(
            tenant,
            user,
            lane,
            format!("{}.run", lane.as_str()),
            IdempotencyKey::new(key),
            PayloadRef::new(format!("s3://docs/{key}")),
        )
    }

    fn job(tenant: TenantId, lane: Lane, key: &str) -> NewJob {
        job_for(tenant, UserId::new(), lane, key)
    }

    fn complete_everything(queue: &JobQueue) {
        queue.register_handler("*", |_ctx, _payload| Ok(HandlerOutcome::Completed));
    }

    fn worker() -> WorkerId {
        WorkerId::new("test-worker")
    }

    fn ran_state(outcome: DispatchOutcome) -> JobState {
        match outcome {
            DispatchOutcome::Ran { state, .. } => state,
            other => panic!("expected a job to run, got {other:?}"),
        }
    }

    fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn duplicate_submission_returns_the_same_job() {
        let h = harness(test_config());
        let tenant = TenantId::new();

        let first = h.queue.submit(job(tenant, Lane::Ingest, "doc-1")).unwrap();
        let second = h.queue.submit(job(tenant, Lane::Ingest, "doc-1")).unwrap();
        let other_tenant = h.queue.submit(job(TenantId::new(), Lane::Ingest, "doc-1")).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.job_id, second.job_id);
        assert!(other_tenant.created);
        assert_eq!(h.store.len(), 2);
    }

    #[test]
    fn invalid_submission_is_rejected() {
        let h = harness(test_config());
        let spec = job(TenantId::new(), Lane::Batch, "export").with_max_attempts(0);
        assert!(matches!(h.queue.submit(spec), Err(QueueError::Domain(_))));
        assert!(h.store.is_empty());
    }

    #[test]
    fn expired_lease_is_reclaimed_once_and_reassigned() {
        let h = harness(test_config());
        let job_id = h.queue.submit(job(TenantId::new(), Lane::Ingest, "doc")).unwrap().job_id;
        let (w1, w2) = (WorkerId::new("w1"), WorkerId::new("w2"));

        h.queue.leases().claim(job_id, &w1, Duration::from_secs(30)).unwrap();
        h.clock.advance(Duration::from_secs(31));

        let report = h.queue.sweeper().sweep_once().unwrap();
        assert_eq!(report.requeued, 1);
        let reclaimed = h.queue.get(job_id).unwrap();
        assert_eq!(reclaimed.state, JobState::Pending);
        assert_eq!(reclaimed.attempt_count, 1);
        assert!(reclaimed.lease.is_none());

        let claimed = h.queue.leases().claim(job_id, &w2, Duration::from_secs(30)).unwrap();
        assert_eq!(claimed.lease_owner(), Some(&w2));
        assert_eq!(h.queue.sweeper().sweep_once().unwrap().requeued, 0);

        // The original worker finishing late changes nothing.
        let stale = h.queue.leases().release(job_id, &w1, ReleaseOutcome::Completed);
        assert!(matches!(stale, Err(QueueError::LeaseExpired { .. })));
        assert_eq!(h.queue.get(job_id).unwrap().lease_owner(), Some(&w2));

        let done = h.queue.leases().release(job_id, &w2, ReleaseOutcome::Completed).unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.attempt_count, 2);
    }

    #[test]
    fn renewal_keeps_the_lease_alive() {
        let h = harness(test_config());
        let job_id = h.queue.submit(job(TenantId::new(), Lane::Interactive, "q")).unwrap().job_id;
        let w = worker();

        h.queue.leases().claim(job_id, &w, Duration::from_secs(30)).unwrap();
        h.clock.advance(Duration::from_secs(20));
        let status = h.queue.leases().renew(job_id, &w, Duration::from_secs(30)).unwrap();
        assert!(!status.cancel_requested);
        h.clock.advance(Duration::from_secs(20));

        assert_eq!(h.queue.sweeper().sweep_once().unwrap().requeued, 0);
        assert_eq!(h.queue.get(job_id).unwrap().state, JobState::Processing);

        let intruder =
            h.queue.leases().renew(job_id, &WorkerId::new("other"), Duration::from_secs(30));
        assert!(matches!(intruder, Err(QueueError::LeaseExpired { .. })));
    }

    #[test]
    fn lease_expiry_on_last_attempt_dead_letters() {
        let h = harness(test_config());
        let spec = job(TenantId::new(), Lane::Approval, "train").with_max_attempts(1);
        let job_id = h.queue.submit(spec).unwrap().job_id;

        h.queue.leases().claim(job_id, &worker(), Duration::from_secs(30)).unwrap();
        h.clock.advance(Duration::from_secs(31));

        let report = h.queue.sweeper().sweep_once().unwrap();
        assert_eq!(report.exhausted, 1);
        assert_eq!(report.dead_lettered, 1);
        let job = h.queue.get(job_id).unwrap();
        assert_eq!(job.state, JobState::DeadLetter);
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn lower_lanes_get_a_slot_every_window() {
        let mut config = test_config();
        config.quotas.default_tier = QuotaTier::new(1_000, 1.0);
        let h = harness(config);
        complete_everything(&h.queue);
        let tenant = TenantId::new();

        for i in 0..50 {
            h.queue.submit(job(tenant, Lane::Interactive, &format!("rag-{i}"))).unwrap();
        }
        for i in 0..5 {
            h.queue.submit(job(tenant, Lane::Batch, &format!("export-{i}"))).unwrap();
        }

        let lanes: Vec<Lane> = (0..20)
            .map(|_| match h.queue.dispatch_once(&worker()).unwrap() {
                DispatchOutcome::Ran { lane, .. } => lane,
                other => panic!("unexpected {other:?}"),
            })
            .collect();

        assert_eq!(lanes[9], Lane::Batch);
        assert_eq!(lanes[19], Lane::Batch);
        assert_eq!(lanes.iter().filter(|l| **l == Lane::Batch).count(), 2);
    }

    #[test]
    fn interactive_jobs_overtake_a_batch_backlog() {
        let mut config = test_config();
        config.quotas.default_tier = QuotaTier::new(1_000, 1.0);
        let h = harness(config);
        complete_everything(&h.queue);
        let tenant = TenantId::new();

        for i in 0..30 {
            h.queue.submit(job(tenant, Lane::Batch, &format!("export-{i}"))).unwrap();
        }
        for _ in 0..5 {
            ran_state(h.queue.dispatch_once(&worker()).unwrap());
        }
        let queries: Vec<_> = (0..3)
            .map(|i| {
                let key = format!("rag-{i}");
                h.queue.submit(job(tenant, Lane::Interactive, &key)).unwrap().job_id
            })
            .collect();

        let mut ticks = 0;
        while queries
            .iter()
            .any(|id| h.queue.get(*id).unwrap().state != JobState::Completed)
        {
            ran_state(h.queue.dispatch_once(&worker()).unwrap());
            ticks += 1;
            assert!(ticks <= 4, "interactive jobs waited {ticks} ticks");
        }
    }

    #[test]
    fn throttled_tenant_does_not_block_others() {
        let noisy = TenantId::new();
        let quiet = TenantId::new();
        let mut config = test_config();
        config.quotas.tenant_tiers.insert(noisy, QuotaTier::new(2, 1.0));
        let h = harness(config);
        complete_everything(&h.queue);

        for i in 0..5 {
            h.queue.submit(job(noisy, Lane::Ingest, &format!("noisy-{i}"))).unwrap();
        }
        for i in 0..2 {
            h.queue.submit(job(quiet, Lane::Ingest, &format!("quiet-{i}"))).unwrap();
        }

        for _ in 0..4 {
            assert_eq!(ran_state(h.queue.dispatch_once(&worker()).unwrap()), JobState::Completed);
        }
        assert_eq!(h.queue.stats(noisy).unwrap().completed, 2);
        assert_eq!(h.queue.stats(quiet).unwrap().completed, 2);
        assert_eq!(
            h.queue.dispatch_once(&worker()).unwrap(),
            DispatchOutcome::Idle { throttled: 1 }
        );

        h.clock.advance(Duration::from_secs(1));
        assert_eq!(ran_state(h.queue.dispatch_once(&worker()).unwrap()), JobState::Completed);
        assert_eq!(h.queue.stats(noisy).unwrap().completed, 3);
    }

    #[test]
    fn throttled_user_does_not_block_teammates() {
        let tenant = TenantId::new();
        let (heavy, light) = (UserId::new(), UserId::new());
        let mut config = test_config();
        config.quotas.per_user = Some(QuotaTier::new(1, 1.0));
        let h = harness(config);
        complete_everything(&h.queue);

        h.queue.submit(job_for(tenant, heavy, Lane::Ingest, "h-1")).unwrap();
        h.queue.submit(job_for(tenant, heavy, Lane::Ingest, "h-2")).unwrap();
        let light_job = h.queue.submit(job_for(tenant, light, Lane::Ingest, "l-1")).unwrap().job_id;

        ran_state(h.queue.dispatch_once(&worker()).unwrap());
        match h.queue.dispatch_once(&worker()).unwrap() {
            DispatchOutcome::Ran { job_id, .. } => assert_eq!(job_id, light_job),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            h.queue.dispatch_once(&worker()).unwrap(),
            DispatchOutcome::Idle { throttled: 1 }
        );
    }

    #[test]
    fn throttled_user_backlog_does_not_hide_later_jobs() {
        let (busy_tenant, other_tenant) = (TenantId::new(), TenantId::new());
        let (heavy, teammate) = (UserId::new(), UserId::new());
        let mut config = test_config();
        config.quotas.per_user = Some(QuotaTier::new(1, 1.0));
        let backlog = config.dispatch_batch_size + 8;
        let h = harness(config);
        complete_everything(&h.queue);

        for i in 0..backlog {
            let key = format!("heavy-{i}");
            h.queue.submit(job_for(busy_tenant, heavy, Lane::Ingest, &key)).unwrap();
        }
        let teammate_job = h
            .queue
            .submit(job_for(busy_tenant, teammate, Lane::Ingest, "teammate"))
            .unwrap()
            .job_id;
        let other_job = h
            .queue
            .submit(job(other_tenant, Lane::Ingest, "other"))
            .unwrap()
            .job_id;

        ran_state(h.queue.dispatch_once(&worker()).unwrap());
        let mut ran = HashSet::new();
        for _ in 0..2 {
            match h.queue.dispatch_once(&worker()).unwrap() {
                DispatchOutcome::Ran { job_id, .. } => {
                    ran.insert(job_id);
                }
                other => panic!("later jobs starved behind a throttled user: {other:?}"),
            }
        }
        assert_eq!(ran, HashSet::from([teammate_job, other_job]));
        assert_eq!(h.queue.get(other_job).unwrap().state, JobState::Completed);
        assert!(matches!(
            h.queue.dispatch_once(&worker()).unwrap(),
            DispatchOutcome::Idle { throttled } if throttled >= 1
        ));
    }

    #[test]
    fn retryable_failures_exhaust_into_dead_letter() {
        let h = harness(test_config());
        h.queue.register_handler("ingest.*", |_ctx, _payload| {
            Err(HandlerError::retryable("converter timed out"))
        });
        let tenant = TenantId::new();
        let job_id = h.queue.submit(job(tenant, Lane::Ingest, "doc")).unwrap().job_id;

        assert_eq!(ran_state(h.queue.dispatch_once(&worker()).unwrap()), JobState::Retrying);
        // Not due yet.
        assert_eq!(
            h.queue.dispatch_once(&worker()).unwrap(),
            DispatchOutcome::Idle { throttled: 0 }
        );

        h.clock.advance(Duration::from_secs(1));
        assert_eq!(h.queue.sweeper().sweep_once().unwrap().promoted, 1);
        assert_eq!(ran_state(h.queue.dispatch_once(&worker()).unwrap()), JobState::Retrying);

        h.clock.advance(Duration::from_secs(1));
        h.queue.sweeper().sweep_once().unwrap();
        assert_eq!(ran_state(h.queue.dispatch_once(&worker()).unwrap()), JobState::DeadLetter);

        let job = h.queue.get(job_id).unwrap();
        assert_eq!(job.attempt_count, 3);
        assert_eq!(job.error_history.len(), 3);
        assert_eq!(
            job.error_history.iter().map(|e| e.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let dead = h.queue.list_dead_letters(tenant, 10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, job_id);
    }

    #[test]
    fn terminal_failure_skips_retries() {
        let h = harness(test_config());
        h.queue.register_handler("batch.run", |_ctx, _payload| {
            Err(HandlerError::terminal("payload schema rejected"))
        });
        let job_id = h.queue.submit(job(TenantId::new(), Lane::Batch, "export")).unwrap().job_id;

        assert_eq!(ran_state(h.queue.dispatch_once(&worker()).unwrap()), JobState::DeadLetter);
        let job = h.queue.get(job_id).unwrap();
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.last_error.map(|e| e.class), Some(ErrorClass::Terminal));
    }

    #[test]
    fn missing_handler_dead_letters() {
        let h = harness(test_config());
        h.queue.register_handler("rag.*", |_ctx, _payload| Ok(HandlerOutcome::Completed));
        let job_id = h.queue.submit(job(TenantId::new(), Lane::Ingest, "doc")).unwrap().job_id;

        assert_eq!(ran_state(h.queue.dispatch_once(&worker()).unwrap()), JobState::DeadLetter);
        let error = h.queue.get(job_id).unwrap().last_error.unwrap();
        assert_eq!(error.class, ErrorClass::Terminal);
        assert!(error.message.contains("no handler"));
    }

    #[test]
    fn handler_panic_is_a_retryable_failure() {
        let h = harness(test_config());
        h.queue.register_handler("*", |_ctx, _payload| panic!("corrupt pdf"));
        let job_id = h.queue.submit(job(TenantId::new(), Lane::Ingest, "doc")).unwrap().job_id;

        assert_eq!(ran_state(h.queue.dispatch_once(&worker()).unwrap()), JobState::Retrying);
        let job = h.queue.get(job_id).unwrap();
        assert!(job.last_error.is_none());
        let error = job.error_history.last().unwrap();
        assert_eq!(error.class, ErrorClass::Retryable);
        assert!(error.message.contains("corrupt pdf"));
    }

    #[test]
    fn full_lifecycle_emits_every_transition() {
        let h = harness(test_config());
        let events = h.queue.subscribe();
        h.queue.register_handler("*", |ctx, _payload| {
            if ctx.attempt < 3 {
                Err(HandlerError::retryable("flaky upstream"))
            } else {
                Ok(HandlerOutcome::Completed)
            }
        });
        let job_id = h.queue.submit(job(TenantId::new(), Lane::Ingest, "doc")).unwrap().job_id;

        for _ in 0..2 {
            ran_state(h.queue.dispatch_once(&worker()).unwrap());
            h.clock.advance(Duration::from_secs(1));
            h.queue.sweeper().sweep_once().unwrap();
        }
        assert_eq!(ran_state(h.queue.dispatch_once(&worker()).unwrap()), JobState::Completed);

        use JobState::*;
        let seen: Vec<StatusEvent> = events.drain();
        let transitions: Vec<(JobState, JobState)> =
            seen.iter().map(|e| (e.from_state, e.to_state)).collect();
        assert_eq!(
            transitions,
            vec![
                (Pending, Processing),
                (Processing, Failed),
                (Failed, Retrying),
                (Retrying, Pending),
                (Pending, Processing),
                (Processing, Failed),
                (Failed, Retrying),
                (Retrying, Pending),
                (Pending, Processing),
                (Processing, Completed),
            ]
        );
        assert!(seen.iter().all(|e| e.job_id == job_id));
        assert_eq!(seen.last().map(|e| e.attempt_count), Some(3));

        let job = h.queue.get(job_id).unwrap();
        assert_eq!(job.attempt_count, 3);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn pending_job_cancels_immediately() {
        let h = harness(test_config());
        complete_everything(&h.queue);
        let job_id = h.queue.submit(job(TenantId::new(), Lane::Batch, "export")).unwrap().job_id;

        assert_eq!(h.queue.cancel(job_id).unwrap(), CancelOutcome::Canceled);
        assert_eq!(h.queue.get(job_id).unwrap().state, JobState::Canceled);
        assert_eq!(
            h.queue.dispatch_once(&worker()).unwrap(),
            DispatchOutcome::Idle { throttled: 0 }
        );
        assert!(matches!(
            h.queue.cancel(job_id),
            Err(QueueError::AlreadyTerminal { state: JobState::Canceled, .. })
        ));
    }

    #[test]
    fn running_job_observes_cancellation() {
        let h = harness(test_config());
        h.queue.register_handler("*", |ctx, _payload| {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !ctx.is_canceled() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
            if ctx.is_canceled() {
                Ok(HandlerOutcome::Canceled)
            } else {
                Ok(HandlerOutcome::Completed)
            }
        });
        let job_id = h.queue.submit(job(TenantId::new(), Lane::Ingest, "doc")).unwrap().job_id;
        let pool = h.queue.spawn_dispatcher(PoolConfig::all_lanes(1)).unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            h.queue.get(job_id).map(|j| j.state == JobState::Processing).unwrap_or(false)
        }));
        assert_eq!(h.queue.cancel(job_id).unwrap(), CancelOutcome::Signaled);
        assert!(wait_until(Duration::from_secs(5), || {
            h.queue.get(job_id).map(|j| j.state == JobState::Canceled).unwrap_or(false)
        }));
        pool.shutdown();

        let job = h.queue.get(job_id).unwrap();
        assert!(job.cancel_requested);
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn handler_ignoring_cancellation_runs_to_completion() {
        let h = harness(test_config());
        let (started_tx, started_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let resume_rx = Mutex::new(resume_rx);
        h.queue.register_handler("*", move |_ctx, _payload| {
            started_tx.lock().unwrap().send(()).unwrap();
            resume_rx.lock().unwrap().recv().unwrap();
            Ok(HandlerOutcome::Completed)
        });
        let job_id = h.queue.submit(job(TenantId::new(), Lane::Ingest, "doc")).unwrap().job_id;

        let outcome = thread::scope(|s| {
            let tick = s.spawn(|| h.queue.dispatch_once(&worker()));
            started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(h.queue.cancel(job_id).unwrap(), CancelOutcome::Signaled);
            resume_tx.send(()).unwrap();
            tick.join().unwrap().unwrap()
        });

        assert_eq!(ran_state(outcome), JobState::Completed);
        let job = h.queue.get(job_id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.cancel_requested);
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn retrying_job_cancels_when_promoted() {
        let h = harness(test_config());
        h.queue.register_handler("*", |_ctx, _payload| Err(HandlerError::retryable("busy")));
        let job_id = h.queue.submit(job(TenantId::new(), Lane::Ingest, "doc")).unwrap().job_id;
        ran_state(h.queue.dispatch_once(&worker()).unwrap());

        assert_eq!(h.queue.cancel(job_id).unwrap(), CancelOutcome::Deferred);
        assert_eq!(h.queue.get(job_id).unwrap().state, JobState::Retrying);

        h.clock.advance(Duration::from_secs(1));
        let report = h.queue.sweeper().sweep_once().unwrap();
        assert_eq!(report.promoted_canceled, 1);
        assert_eq!(h.queue.get(job_id).unwrap().state, JobState::Canceled);
    }

    #[test]
    fn requeue_dead_letter_creates_a_fresh_job() {
        let h = harness(test_config());
        h.queue.register_handler("*", |_ctx, _payload| Err(HandlerError::terminal("bad input")));
        let tenant = TenantId::new();
        let spec = job(tenant, Lane::Ingest, "doc").with_max_attempts(5);
        let old_id = h.queue.submit(spec.clone()).unwrap().job_id;
        ran_state(h.queue.dispatch_once(&worker()).unwrap());

        let requeued = h.queue.requeue_dead_letter(old_id).unwrap();
        assert!(requeued.created);
        assert_ne!(requeued.job_id, old_id);

        let fresh = h.queue.get(requeued.job_id).unwrap();
        assert_eq!(fresh.state, JobState::Pending);
        assert_eq!(fresh.attempt_count, 0);
        assert_eq!(fresh.max_attempts, 5);
        assert_eq!(h.queue.get(old_id).unwrap().state, JobState::DeadLetter);

        // The key now points at the requeued job.
        assert_eq!(h.queue.submit(spec).unwrap().job_id, requeued.job_id);
        assert!(matches!(
            h.queue.requeue_dead_letter(requeued.job_id),
            Err(QueueError::NotDeadLettered { state: JobState::Pending, .. })
        ));
    }

    #[test]
    fn idempotency_key_frees_up_after_retention() {
        let h = harness(test_config());
        let tenant = TenantId::new();
        let first = h.queue.submit(job(tenant, Lane::Batch, "nightly")).unwrap().job_id;
        h.queue.cancel(first).unwrap();

        assert_eq!(h.queue.submit(job(tenant, Lane::Batch, "nightly")).unwrap().job_id, first);

        h.clock.advance(h.queue.config().idempotency_retention + Duration::from_secs(1));
        assert_eq!(h.queue.sweeper().sweep_once().unwrap().pruned, 1);

        let again = h.queue.submit(job(tenant, Lane::Batch, "nightly")).unwrap();
        assert!(again.created);
        assert_ne!(again.job_id, first);
    }

    #[test]
    fn sweeper_recovers_failures_left_undecided() {
        let h = harness(test_config());
        let job_id = h.queue.submit(job(TenantId::new(), Lane::Ingest, "doc")).unwrap().job_id;
        let w = worker();

        // A dispatcher that died after recording the outcome.
        h.queue.leases().claim(job_id, &w, Duration::from_secs(30)).unwrap();
        let error = JobError::retryable("oom killed", 1, h.clock.now());
        h.queue.leases().release(job_id, &w, ReleaseOutcome::Failed(error)).unwrap();

        assert_eq!(h.queue.sweeper().sweep_once().unwrap().recovered, 0);
        h.clock.advance(h.queue.config().effective_sweep_interval() + Duration::from_secs(1));
        assert_eq!(h.queue.sweeper().sweep_once().unwrap().recovered, 1);
        assert_eq!(h.queue.get(job_id).unwrap().state, JobState::Retrying);
    }

    #[test]
    fn pools_drain_only_their_lanes() {
        let mut config = test_config();
        config.pools = vec![
            PoolConfig::new("interactive", 2, [Lane::Interactive]),
            PoolConfig::new("bulk", 2, [Lane::Ingest, Lane::Batch]),
        ];
        let h = harness(config);
        let seen: Arc<Mutex<Vec<(String, Lane)>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        h.queue.register_handler("*", move |ctx, _payload| {
            recorder
                .lock()
                .unwrap()
                .push((ctx.worker.as_str().to_string(), ctx.lane));
            Ok(HandlerOutcome::Completed)
        });

        let tenants = [TenantId::new(), TenantId::new(), TenantId::new()];
        let lanes = [Lane::Interactive, Lane::Ingest, Lane::Batch];
        for (i, lane) in lanes.into_iter().cycle().take(12).enumerate() {
            h.queue.submit(job(tenants[i % 3], lane, &format!("job-{i}"))).unwrap();
        }

        let pools = h.queue.spawn_pools().unwrap();
        assert_eq!(pools.iter().map(|p| p.workers()).sum::<usize>(), 4);
        assert!(wait_until(Duration::from_secs(10), || {
            pools.iter().map(|p| p.stats().completed).sum::<u64>() == 12
        }));
        pools.into_iter().for_each(|p| p.shutdown());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 12);
        for (worker, lane) in seen.iter() {
            if worker.starts_with("interactive-") {
                assert_eq!(*lane, Lane::Interactive);
            } else {
                assert!(worker.starts_with("bulk-"));
                assert_ne!(*lane, Lane::Interactive);
            }
        }
        let workers: HashSet<&str> = seen.iter().map(|(w, _)| w.as_str()).collect();
        assert!(!workers.is_empty());
    }

    #[test]
    fn background_sweeper_reclaims_expired_leases() {
        let mut config = test_config();
        config.sweep_interval = Some(Duration::from_millis(10));
        let h = harness(config);
        let job_id = h.queue.submit(job(TenantId::new(), Lane::Ingest, "doc")).unwrap().job_id;
        h.queue.leases().claim(job_id, &worker(), Duration::from_secs(30)).unwrap();
        h.clock.advance(Duration::from_secs(31));

        let sweeper = h.queue.spawn_sweeper().unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            h.queue.get(job_id).map(|j| j.state == JobState::Pending).unwrap_or(false)
        }));
        sweeper.shutdown();
        assert_eq!(h.queue.get(job_id).unwrap().attempt_count, 1);
    }

    #[test]
    fn handler_counts_match_dispatch_counts() {
        let h = harness(test_config());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        h.queue.register_handler("*", move |_ctx, _payload| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::Completed)
        });
        let tenant = TenantId::new();
        for i in 0..5 {
            h.queue.submit(job(tenant, Lane::Approval, &format!("train-{i}"))).unwrap();
        }
        while let DispatchOutcome::Ran { .. } = h.queue.dispatch_once(&worker()).unwrap() {}

        assert_eq!(runs.load(Ordering::SeqCst), 5);
        let stats = h.queue.stats(tenant).unwrap();
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.total(), 5);
    }
}
