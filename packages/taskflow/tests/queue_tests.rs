//! Pull-queue semantics: locking, ordering, stealing, retries, and the
//! idempotency index.

mod common;

use common::{dt, test_db};
use taskflow_core::{InstanceStatus, Task, TaskInstance, TaskPriority, TaskflowError};

fn task(name: &str) -> Task {
    Task::builder().name(name).active(true).build()
}

#[tokio::test]
async fn pull_locks_starts_and_counts_the_attempt() {
    let db = test_db().await;

    let queued = db
        .store
        .insert_task_instance(&task("task1").new_instance(dt(2017, 6, 4, 6, 0, 0), false))
        .await
        .unwrap();

    let now = dt(2017, 6, 4, 6, 0, 12);
    let pulled = db.store.pull("test", now, 100, None, false).await.unwrap();
    assert_eq!(pulled.len(), 1);

    let instance = &pulled[0];
    assert_eq!(instance.id, queued.id);
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.locked_at, Some(now));
    assert_eq!(instance.started_at, Some(now));
    assert_eq!(instance.worker_id.as_deref(), Some("test"));
    assert_eq!(instance.attempts, 1);
}

#[tokio::test]
async fn completing_a_pulled_instance_records_the_outcome() {
    let db = test_db().await;

    db.store
        .insert_task_instance(&task("task1").new_instance(dt(2017, 6, 4, 6, 0, 0), false))
        .await
        .unwrap();

    let pulled = db
        .store
        .pull("test", dt(2017, 6, 4, 6, 0, 12), 100, None, false)
        .await
        .unwrap();

    let ended = dt(2017, 6, 4, 6, 0, 15);
    let succeeded = db
        .store
        .succeed_task_instance(pulled[0].id, ended)
        .await
        .unwrap();

    assert_eq!(succeeded.status, InstanceStatus::Success);
    assert_eq!(succeeded.ended_at, Some(ended));
    assert_eq!(succeeded.attempts, 1);
    assert_eq!(succeeded.worker_id.as_deref(), Some("test"));
}

#[tokio::test]
async fn pull_dispatches_higher_priority_first() {
    let db = test_db().await;
    let run_at = dt(2017, 6, 4, 6, 0, 0);

    let normal = db
        .store
        .insert_task_instance(&task("task1").new_instance(run_at, false))
        .await
        .unwrap();
    let mut high_instance = task("task1").new_instance(run_at, false);
    high_instance.priority = TaskPriority::High;
    let high = db.store.insert_task_instance(&high_instance).await.unwrap();

    let now = dt(2017, 6, 4, 6, 0, 12);
    let first = db.store.pull("test", now, 1, None, false).await.unwrap();
    assert_eq!(first[0].id, high.id);
    assert_eq!(first[0].priority, TaskPriority::High);

    let second = db.store.pull("test", now, 1, None, false).await.unwrap();
    assert_eq!(second[0].id, normal.id);
    assert_eq!(second[0].priority, TaskPriority::Normal);
}

#[tokio::test]
async fn pull_breaks_priority_ties_by_run_at() {
    let db = test_db().await;

    let sooner = db
        .store
        .insert_task_instance(&task("task1").new_instance(dt(2017, 6, 4, 6, 0, 5), false))
        .await
        .unwrap();
    let later = db
        .store
        .insert_task_instance(&task("task1").new_instance(dt(2017, 6, 4, 6, 0, 10), false))
        .await
        .unwrap();

    let now = dt(2017, 6, 4, 6, 0, 12);
    assert_eq!(
        db.store.pull("test", now, 1, None, false).await.unwrap()[0].id,
        sooner.id
    );
    assert_eq!(
        db.store.pull("test", now, 1, None, false).await.unwrap()[0].id,
        later.id
    );
}

#[tokio::test]
async fn instance_is_eligible_exactly_at_run_at() {
    let db = test_db().await;
    let run_at = dt(2017, 6, 4, 6, 0, 0);

    db.store
        .insert_task_instance(&task("task1").new_instance(run_at, false))
        .await
        .unwrap();

    let early = db
        .store
        .pull("test", dt(2017, 6, 4, 5, 59, 59), 100, None, false)
        .await
        .unwrap();
    assert!(early.is_empty());

    let on_time = db.store.pull("test", run_at, 100, None, false).await.unwrap();
    assert_eq!(on_time.len(), 1);
}

#[tokio::test]
async fn push_instances_are_invisible_to_worker_pulls() {
    let db = test_db().await;
    let run_at = dt(2017, 6, 4, 6, 0, 0);

    let push_task = Task::builder()
        .name("push_task")
        .active(true)
        .push_destination("batch")
        .build();
    db.store
        .insert_task_instance(&push_task.new_instance(run_at, false))
        .await
        .unwrap();

    let now = dt(2017, 6, 4, 6, 0, 12);
    let worker_pull = db.store.pull("worker", now, 100, None, false).await.unwrap();
    assert!(worker_pull.is_empty());

    let pusher_pull = db.store.pull("Pusher", now, 100, None, true).await.unwrap();
    assert_eq!(pusher_pull.len(), 1);
    assert!(pusher_pull[0].push);
}

#[tokio::test]
async fn task_names_filter_scopes_the_pull() {
    let db = test_db().await;
    let run_at = dt(2017, 6, 4, 6, 0, 0);

    db.store
        .insert_task_instance(&task("task1").new_instance(run_at, false))
        .await
        .unwrap();
    db.store
        .insert_task_instance(&task("task2").new_instance(run_at, false))
        .await
        .unwrap();

    let now = dt(2017, 6, 4, 6, 0, 12);
    let scoped = db
        .store
        .pull("test", now, 100, Some(&["task1".to_string()]), false)
        .await
        .unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].task_name, "task1");

    // An empty filter means no specialization: everything matches.
    let unscoped = db.store.pull("test", now, 100, Some(&[]), false).await.unwrap();
    assert_eq!(unscoped.len(), 1);
    assert_eq!(unscoped[0].task_name, "task2");
}

#[tokio::test]
async fn stuck_running_instance_is_stolen_after_its_timeout() {
    let db = test_db().await;

    let definition = Task::builder().name("task1").active(true).retries(2).build();
    db.store
        .insert_task_instance(&definition.new_instance(dt(2017, 6, 4, 6, 0, 0), false))
        .await
        .unwrap();

    let first_pull = dt(2017, 6, 4, 6, 0, 12);
    let pulled = db
        .store
        .pull("worker-a", first_pull, 100, None, false)
        .await
        .unwrap();
    assert_eq!(pulled[0].worker_id.as_deref(), Some("worker-a"));
    assert_eq!(pulled[0].attempts, 1);

    // Exactly at locked_at + timeout the row is not yet stealable.
    let at_deadline = dt(2017, 6, 4, 6, 5, 12);
    assert!(db
        .store
        .pull("worker-b", at_deadline, 100, None, false)
        .await
        .unwrap()
        .is_empty());

    let past_deadline = dt(2017, 6, 4, 6, 5, 15);
    let stolen = db
        .store
        .pull("worker-b", past_deadline, 100, None, false)
        .await
        .unwrap();
    assert_eq!(stolen.len(), 1);
    assert_eq!(stolen[0].status, InstanceStatus::Running);
    assert_eq!(stolen[0].worker_id.as_deref(), Some("worker-b"));
    assert_eq!(stolen[0].locked_at, Some(past_deadline));
    // The original start survives the steal.
    assert_eq!(stolen[0].started_at, Some(first_pull));
    assert_eq!(stolen[0].attempts, 2);
}

#[tokio::test]
async fn custom_timeout_extends_the_steal_window() {
    let db = test_db().await;

    let definition = Task::builder()
        .name("task1")
        .active(true)
        .retries(2)
        .timeout(7200)
        .build();
    db.store
        .insert_task_instance(&definition.new_instance(dt(2017, 6, 4, 6, 0, 0), false))
        .await
        .unwrap();

    db.store
        .pull("worker-a", dt(2017, 6, 4, 6, 0, 12), 100, None, false)
        .await
        .unwrap();

    // Almost two hours later the lock still holds.
    assert!(db
        .store
        .pull("worker-b", dt(2017, 6, 4, 8, 0, 10), 100, None, false)
        .await
        .unwrap()
        .is_empty());

    let stolen = db
        .store
        .pull("worker-b", dt(2017, 6, 4, 8, 0, 15), 100, None, false)
        .await
        .unwrap();
    assert_eq!(stolen.len(), 1);
    assert_eq!(stolen[0].attempts, 2);
}

#[tokio::test]
async fn failed_instance_retries_after_its_delay_then_fails_for_good() {
    let db = test_db().await;

    let definition = Task::builder().name("task1").active(true).retries(1).build();
    db.store
        .insert_task_instance(&definition.new_instance(dt(2017, 6, 4, 6, 0, 0), false))
        .await
        .unwrap();

    let pulled = db
        .store
        .pull("worker-a", dt(2017, 6, 4, 6, 0, 12), 100, None, false)
        .await
        .unwrap();

    let failed_at = dt(2017, 6, 4, 6, 0, 15);
    let retried = db
        .store
        .fail_task_instance(pulled[0].id, failed_at)
        .await
        .unwrap();
    assert_eq!(retried.status, InstanceStatus::Retry);
    assert_eq!(retried.locked_at, Some(failed_at));
    assert!(retried.ended_at.is_none());

    // Within the retry window nothing is handed out.
    assert!(db
        .store
        .pull("worker-b", dt(2017, 6, 4, 6, 5, 14), 100, None, false)
        .await
        .unwrap()
        .is_empty());

    let second = db
        .store
        .pull("worker-b", dt(2017, 6, 4, 6, 5, 16), 100, None, false)
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].status, InstanceStatus::Running);
    assert_eq!(second[0].attempts, 2);
    assert_eq!(second[0].started_at, Some(dt(2017, 6, 4, 6, 0, 12)));

    // No attempts left: the second failure is terminal.
    let ended = dt(2017, 6, 4, 6, 5, 20);
    let dead = db.store.fail_task_instance(second[0].id, ended).await.unwrap();
    assert_eq!(dead.status, InstanceStatus::Failed);
    assert_eq!(dead.ended_at, Some(ended));

    // And pull never resurrects it.
    assert!(db
        .store
        .pull("worker-c", dt(2017, 6, 4, 7, 0, 0), 100, None, false)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn unique_key_blocks_concurrent_duplicates_only() {
    let db = test_db().await;

    let mut first = task("t1").new_instance(dt(2017, 6, 4, 6, 0, 0), false);
    first.unique = Some("k1".to_string());
    let first = db.store.insert_task_instance(&first).await.unwrap();

    let mut duplicate = task("t1").new_instance(dt(2017, 6, 4, 8, 0, 0), false);
    duplicate.unique = Some("k1".to_string());
    let err = db.store.insert_task_instance(&duplicate).await.unwrap_err();
    assert!(matches!(err, TaskflowError::UniqueConflict));

    // A terminal instance releases the key.
    db.store
        .succeed_task_instance(first.id, dt(2017, 6, 4, 6, 1, 0))
        .await
        .unwrap();
    assert!(db.store.insert_task_instance(&duplicate).await.is_ok());
}

#[tokio::test]
async fn fail_timed_out_only_reaps_exhausted_overdue_instances() {
    let db = test_db().await;
    let locked_at = dt(2017, 6, 4, 6, 0, 0);

    let build = |name: &str, status: InstanceStatus, attempts: i32, max_attempts: i32| {
        TaskInstance::builder()
            .task_name(name)
            .run_at(locked_at)
            .status(status)
            .locked_at(Some(locked_at))
            .attempts(attempts)
            .max_attempts(max_attempts)
            .timeout(300)
            .retry_delay(300)
            .build()
    };

    let exhausted = db
        .store
        .insert_task_instance(&build("exhausted", InstanceStatus::Running, 1, 1))
        .await
        .unwrap();
    let retryable = db
        .store
        .insert_task_instance(&build("retryable", InstanceStatus::Running, 1, 3))
        .await
        .unwrap();
    let in_flight = db
        .store
        .insert_task_instance(&build("in_flight", InstanceStatus::Running, 1, 1))
        .await
        .unwrap();
    let exhausted_retry = db
        .store
        .insert_task_instance(&build("exhausted_retry", InstanceStatus::Retry, 2, 2))
        .await
        .unwrap();

    // Move the still-in-flight row's lock close to now.
    sqlx::query("UPDATE task_instances SET locked_at = $1 WHERE id = $2")
        .bind(dt(2017, 6, 4, 6, 5, 0))
        .bind(in_flight.id)
        .execute(&db.pool)
        .await
        .unwrap();

    let now = dt(2017, 6, 4, 6, 5, 30);
    let reaped = db.store.fail_timed_out(now).await.unwrap();
    assert_eq!(reaped, 2);

    let exhausted = db.store.get_task_instance(exhausted.id).await.unwrap();
    assert_eq!(exhausted.status, InstanceStatus::Failed);
    assert_eq!(exhausted.ended_at, Some(now));

    let exhausted_retry = db.store.get_task_instance(exhausted_retry.id).await.unwrap();
    assert_eq!(exhausted_retry.status, InstanceStatus::Failed);

    // Attempts remain: timeout stealing, not reaping, handles this row.
    assert_eq!(
        db.store.get_task_instance(retryable.id).await.unwrap().status,
        InstanceStatus::Running
    );
    // Lock not yet expired.
    assert_eq!(
        db.store.get_task_instance(in_flight.id).await.unwrap().status,
        InstanceStatus::Running
    );
}

#[tokio::test]
async fn dequeue_cancels_only_queued_instances() {
    let db = test_db().await;
    let run_at = dt(2017, 6, 4, 6, 0, 0);

    let queued = db
        .store
        .insert_task_instance(&task("task1").new_instance(run_at, false))
        .await
        .unwrap();
    let now = dt(2017, 6, 4, 6, 0, 5);
    assert!(db.store.dequeue_task_instance(queued.id, now).await.unwrap());

    let dequeued = db.store.get_task_instance(queued.id).await.unwrap();
    assert_eq!(dequeued.status, InstanceStatus::Dequeued);
    assert_eq!(dequeued.ended_at, Some(now));

    // A dequeued row is terminal: never pulled again.
    assert!(db
        .store
        .pull("test", dt(2017, 6, 4, 7, 0, 0), 100, None, false)
        .await
        .unwrap()
        .is_empty());

    // Running instances are out of dequeue's reach.
    let running = db
        .store
        .insert_task_instance(&task("task2").new_instance(run_at, false))
        .await
        .unwrap();
    db.store
        .pull("test", dt(2017, 6, 4, 7, 0, 0), 100, None, false)
        .await
        .unwrap();
    assert!(!db.store.dequeue_task_instance(running.id, now).await.unwrap());
}

#[tokio::test]
async fn dequeue_cancels_only_queued_workflow_instances() {
    let db = test_db().await;

    let workflow = taskflow_core::Workflow::builder().name("workflow1").build();
    let queued = db
        .store
        .insert_workflow_instance(&workflow.new_instance(dt(2017, 6, 3, 6, 0, 0), false))
        .await
        .unwrap();

    let now = dt(2017, 6, 3, 6, 0, 5);
    assert!(db
        .store
        .dequeue_workflow_instance(queued.id, now)
        .await
        .unwrap());
    let dequeued = db.store.get_workflow_instance(queued.id).await.unwrap();
    assert_eq!(dequeued.status, InstanceStatus::Dequeued);
    assert_eq!(dequeued.ended_at, Some(now));

    // A second dequeue finds nothing in `queued`.
    assert!(!db
        .store
        .dequeue_workflow_instance(queued.id, now)
        .await
        .unwrap());
}

#[tokio::test]
async fn concurrent_pulls_never_share_a_row() {
    let db = test_db().await;
    let run_at = dt(2017, 6, 4, 6, 0, 0);

    for _ in 0..20 {
        db.store
            .insert_task_instance(&task("task1").new_instance(run_at, false))
            .await
            .unwrap();
    }

    let now = dt(2017, 6, 4, 6, 0, 12);
    let pulls = futures::future::join_all((0..4).map(|worker| {
        let store = db.store.clone();
        async move {
            store
                .pull(&format!("worker-{worker}"), now, 10, None, false)
                .await
                .unwrap()
        }
    }))
    .await;

    let mut seen = std::collections::HashSet::new();
    for pulled in pulls {
        for instance in pulled {
            assert!(seen.insert(instance.id), "row dispatched twice");
        }
    }
    assert_eq!(seen.len(), 20);
}
