#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

//! These tests start a PostgreSQL container and need a Docker daemon.

use chrono::{DateTime, Duration, TimeZone, Utc};
use claims::{assert_matches, assert_none, assert_some, assert_some_eq};
use nudges::delivery_log::{Reservation, Reserved};
use nudges::memory::{ScriptedSender, StaticDirectory};
use nudges::queue::{archived_jobs, buried_jobs, retrying_job_count};
use nudges::schema::DeliveryStatus;
use nudges::{
    DeliveryLogStore, Dispatcher, JobQueue, ManualClock, MessageKind, NotificationJob,
    PgDeliveryLog, PgJobQueue, RecipientProfile, Runner, SendReport, setup_database,
};
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Start a database with `TestContainers` and run the bundled migrations
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let container = Postgres::default().start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        setup_database(&pool).await?;

        Ok((pool, container))
    }

    pub(super) fn reservation(now: DateTime<Utc>, existing: Option<i64>) -> Reservation {
        Reservation {
            user_id: 42,
            kind: MessageKind::EveningReminder,
            body: "Hi Grace, you still have 2 tasks left for today.".into(),
            now,
            existing,
        }
    }

    pub(super) fn evening() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 19, 0, 0).unwrap()
    }
}

use test_utils::{evening, reservation};

async fn job_is_locked(id: i64, pool: &PgPool) -> anyhow::Result<bool> {
    let result = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM notification_jobs WHERE id = $1 FOR UPDATE SKIP LOCKED",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(result.is_none())
}

async fn delivery_log_count(pool: &PgPool) -> anyhow::Result<i64> {
    Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM delivery_logs")
        .fetch_one(pool)
        .await?)
}

#[tokio::test]
async fn setup_database_creates_tables() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let table_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables
         WHERE table_name IN ('notification_jobs', 'archived_notification_jobs', 'delivery_logs')
         AND table_schema = 'public'",
    )
    .fetch_one(&pool)
    .await?;

    assert_eq!(table_count, 3);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_accept_exactly_one() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let log = PgDeliveryLog::new(pool.clone());

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let log = log.clone();
            tokio::spawn(async move { log.reserve(reservation(evening(), None)).await })
        })
        .collect();

    let mut accepted = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await?? {
            Reserved::Accepted(record) => {
                assert_eq!(record.status, DeliveryStatus::Queued);
                accepted += 1;
            }
            Reserved::Duplicate => duplicates += 1,
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(duplicates, 9);
    assert_eq!(delivery_log_count(&pool).await?, 1);

    Ok(())
}

#[tokio::test]
async fn failed_records_are_rearmed_and_expire_after_the_window() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let log = PgDeliveryLog::new(pool.clone());

    let Reserved::Accepted(first) = log.reserve(reservation(evening(), None)).await? else {
        panic!("first reservation should be accepted");
    };

    let failed = log.mark_failed(first.id, "30003: Unreachable destination handset").await?;
    assert_eq!(failed.status, DeliveryStatus::Failed);

    // A failed record does not block a fresh attempt.
    let later = evening() + Duration::minutes(1);
    let Reserved::Accepted(rearmed) = log.reserve(reservation(later, Some(first.id))).await? else {
        panic!("retry should re-arm the failed record");
    };
    assert_eq!(rearmed.id, first.id);
    assert_eq!(rearmed.status, DeliveryStatus::Queued);

    let sent = log.mark_sent(first.id, Some("SM1"), later).await?;
    assert_eq!(sent.status, DeliveryStatus::Sent);
    assert_some_eq!(sent.sent_at, later);

    let delivered = assert_some!(log.mark_delivered("SM1").await?);
    assert_eq!(delivered.status, DeliveryStatus::Delivered);
    assert_none!(log.mark_delivered("SM-unknown").await?);

    let within = evening() + Duration::hours(22);
    assert_matches!(log.reserve(reservation(within, None)).await?, Reserved::Duplicate);

    let after = evening() + Duration::hours(24);
    assert_matches!(log.reserve(reservation(after, None)).await?, Reserved::Accepted(_));

    let recent = log.recent_for_user(42, 10).await?;
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[1].id, first.id);
    assert_eq!(recent[1].status, DeliveryStatus::Delivered);

    assert_some!(log.find(first.id).await?);
    assert_none!(log.find(first.id + 100).await?);

    Ok(())
}

#[tokio::test]
async fn reserved_jobs_stay_locked_until_released() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = PgJobQueue::new(pool.clone());
    let job = NotificationJob::new(42, MessageKind::MorningNudge);

    let id = queue.enqueue(&job, evening()).await?;
    assert!(!job_is_locked(id, &pool).await?);

    let (queued, lease) = assert_some!(queue.reserve(evening()).await?);
    assert_eq!(queued.id, id);
    assert_eq!(queued.data, json!({ "user_id": 42, "kind": "morning_nudge" }));
    assert!(job_is_locked(id, &pool).await?);
    assert_none!(queue.reserve(evening()).await?);

    queue
        .retry_at(lease, evening() + Duration::minutes(1), "boom", Some(7))
        .await?;
    assert!(!job_is_locked(id, &pool).await?);
    assert_eq!(retrying_job_count(&pool).await?, 1);

    // Not due yet.
    assert_none!(queue.reserve(evening()).await?);

    let (queued, lease) = assert_some!(queue.reserve(evening() + Duration::minutes(1)).await?);
    assert_eq!(queued.attempts, 1);
    assert_some_eq!(queued.delivery_log_id, 7);
    assert_some_eq!(queued.last_error.as_deref(), "boom");

    queue.bury(lease, evening(), "gave up").await?;
    assert_none!(queue.reserve(evening() + Duration::hours(1)).await?);

    let buried = buried_jobs(&pool, 10).await?;
    assert_eq!(buried.len(), 1);
    assert_eq!(buried[0].attempts, 2);
    assert_eq!(retrying_job_count(&pool).await?, 0);

    Ok(())
}

#[tokio::test]
async fn jobs_are_deduplicated_unless_running() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = PgJobQueue::new(pool.clone());
    let job = NotificationJob::new(42, MessageKind::EveningReminder);

    assert_some!(queue.enqueue_deduplicated(&job, evening()).await?);
    assert_none!(queue.enqueue_deduplicated(&job, evening()).await?);

    let (_queued, lease) = assert_some!(queue.reserve(evening()).await?);
    assert_some!(queue.enqueue_deduplicated(&job, evening()).await?);
    queue.complete(lease).await?;

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notification_jobs")
        .fetch_one(&pool)
        .await?;
    assert_eq!(remaining, 1);

    Ok(())
}

#[tokio::test]
async fn completed_jobs_can_be_archived() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let queue = PgJobQueue::new(pool.clone()).archive_completed_jobs(true);

    let id = queue
        .enqueue(&NotificationJob::new(42, MessageKind::MorningNudge), evening())
        .await?;
    let (_queued, lease) = assert_some!(queue.reserve(evening()).await?);
    queue.complete(lease).await?;

    let archived = archived_jobs(&pool, None).await?;
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].job.id, id);
    assert_eq!(archived_jobs(&pool, Some(0)).await?.len(), 0);

    Ok(())
}

#[tokio::test]
async fn runner_sends_through_postgres_once() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let directory = StaticDirectory::new()
        .with_recipient(RecipientProfile {
            user_id: 42,
            display_name: "Grace Hopper".into(),
            contact_address: "+44 20 7946 0958".into(),
            opted_in: true,
            timezone: "Europe/London".into(),
        })
        .with_pending(42, 2);
    let sender = ScriptedSender::new().with_replies([SendReport::failed(None, "timeout")]);

    let clock = Arc::new(ManualClock::new(evening()));
    let dispatcher = Dispatcher::new(PgDeliveryLog::new(pool.clone()), directory, sender)
        .clock(clock.clone());
    let dispatcher = Arc::new(dispatcher);
    let queue = Arc::new(PgJobQueue::new(pool.clone()));

    let job = NotificationJob::new(42, MessageKind::EveningReminder);
    for _ in 0..3 {
        queue.enqueue(&job, evening()).await?;
    }

    let run = || {
        Runner::new(queue.clone(), dispatcher.clone())
            .num_workers(3)
            .shutdown_when_queue_empty()
            .start()
    };

    // The first send fails. Whichever attempt reserves next owns the send;
    // every other one is vetoed by the live record.
    run().wait_for_shutdown().await;
    clock.advance(Duration::minutes(1));
    run().wait_for_shutdown().await;

    let calls = dispatcher.sender().calls();
    assert!(calls.iter().all(|call| call.address == "+442079460958"));

    let live: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM delivery_logs WHERE status IN ('queued', 'sent', 'delivered')",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(live, 1);
    assert_eq!(
        dispatcher
            .log()
            .recent_for_user(42, 10)
            .await?
            .iter()
            .filter(|record| record.status == DeliveryStatus::Sent)
            .count(),
        1
    );

    Ok(())
}
