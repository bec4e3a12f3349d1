//! Scheduler behaviour driven through the engine with a fake executor.

mod common;

use std::time::Duration;

use common::{Behaviour, drain, fake_engine, named_task, wait_for};
use ffqueue::domain::TaskStatus;
use ffqueue::notify::EngineEvent;
use ffqueue::service::{CANCELED_BY_USER, SOURCE_API};
use ffqueue::store::JobStore;

const TIMEOUT: Duration = Duration::from_secs(10);

async fn wait_all_terminal(store: &ffqueue::store::MemoryStore, expected: usize) {
    wait_for(TIMEOUT, || async move {
        let tasks = store.tasks();
        (tasks.len() == expected && tasks.iter().all(|t| t.status.is_terminal())).then_some(())
    })
    .await;
}

#[tokio::test]
async fn test_dispatch_follows_priority_then_submission_order() {
    let t = fake_engine(1, Behaviour::SucceedAfter(Duration::from_millis(5)));
    let tasks = t.engine.tasks();
    for (name, priority) in [("low", 1), ("high", 10), ("mid-a", 5), ("mid-b", 5), ("none", 0)] {
        tasks
            .create_task(named_task(name, priority), None, SOURCE_API)
            .await
            .unwrap();
    }

    t.engine.start();
    wait_all_terminal(&t.store, 5).await;
    t.engine.stop().await;

    assert_eq!(t.executor.order(), vec!["high", "mid-a", "mid-b", "low", "none"]);
    assert_eq!(t.executor.peak(), 1);
}

#[tokio::test]
async fn test_concurrency_ceiling_is_never_exceeded() {
    let t = fake_engine(2, Behaviour::SucceedAfter(Duration::from_millis(50)));
    for i in 0..6 {
        t.engine
            .tasks()
            .create_task(named_task(&format!("t{i}"), 0), None, SOURCE_API)
            .await
            .unwrap();
    }

    t.engine.start();
    let scheduler = t.engine.scheduler();
    wait_for(TIMEOUT, || async move { (scheduler.in_flight() == 2).then_some(()) }).await;
    wait_all_terminal(&t.store, 6).await;
    t.engine.stop().await;

    assert_eq!(t.executor.peak(), 2);
    assert_eq!(t.executor.order().len(), 6);
    let counts = t.engine.tasks().status_counts().await.unwrap();
    assert_eq!(counts[&TaskStatus::DoneSuccessful], 6);
}

#[tokio::test]
async fn test_dispatched_tasks_are_claimed_with_start_time() {
    let t = fake_engine(1, Behaviour::WaitForCancel);
    let task = t
        .engine
        .tasks()
        .create_task(named_task("claimed", 0), None, SOURCE_API)
        .await
        .unwrap();

    t.engine.start();
    let (store, id) = (&t.store, &task.id);
    let running = wait_for(TIMEOUT, || async move {
        let stored = store.get_task(id).await.unwrap();
        (stored.status == TaskStatus::Running).then_some(stored)
    })
    .await;
    assert!(running.started_at >= task.created_at);

    t.engine.stop().await;
    let stored = t.store.get_task(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::DoneCanceled);
    assert_eq!(stored.error, "engine shutting down");
}

#[tokio::test]
async fn test_cancel_racing_dispatch_yields_one_terminal_state() {
    for round in 0..25 {
        let mut t = fake_engine(4, Behaviour::WaitForCancel);
        let task = t
            .engine
            .tasks()
            .create_task(named_task(&format!("race-{round}"), 0), None, SOURCE_API)
            .await
            .unwrap();

        t.engine.start();
        if round % 2 == 1 {
            tokio::task::yield_now().await;
        }
        let id = task.id.as_str();
        t.engine.tasks().cancel_task(id).await.unwrap();

        let store = &t.store;
        let stored = wait_for(TIMEOUT, || async move {
            let stored = store.get_task(id).await.unwrap();
            stored.status.is_terminal().then_some(stored)
        })
        .await;
        // Give a losing writer the chance to show up
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.engine.stop().await;

        assert_eq!(stored.status, TaskStatus::DoneCanceled, "round {round}");
        assert_eq!(stored.error, CANCELED_BY_USER, "round {round}");
        assert_eq!(
            t.store.get_task(&task.id).await.unwrap().status,
            TaskStatus::DoneCanceled
        );

        let terminal_updates = drain(&mut t.events)
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::TaskUpdated(u) if u.id == task.id && u.status.is_terminal()))
            .count();
        assert_eq!(terminal_updates, 1, "round {round}");
    }
}

#[tokio::test]
async fn test_batch_finished_fires_exactly_once() {
    let mut t = fake_engine(3, Behaviour::SucceedAfter(Duration::from_millis(10)));
    let batch = t
        .engine
        .tasks()
        .create_batch((0..5).map(|i| named_task(&format!("b{i}"), 0)).collect())
        .await
        .unwrap();
    let batch_id = batch[0].batch.clone().unwrap();

    t.engine.start();
    wait_all_terminal(&t.store, 5).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    t.engine.stop().await;

    let finished: Vec<_> = drain(&mut t.events)
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::BatchFinished(task) => task.batch,
            _ => None,
        })
        .collect();
    assert_eq!(finished, vec![batch_id]);
}
