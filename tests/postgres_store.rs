//! Integration tests for the PostgreSQL task-queue store.
//!
//! These tests need a scratch database; every run drops the gridmatch tables.
//! Run with: DATABASE_URL=postgres://... cargo test --test postgres_store -- --ignored

use std::collections::BTreeSet;
use std::sync::Arc;

use gridmatch::collaborators::StaticShareConfig;
use gridmatch::scheduler::{MatchOutcome, SchedulerConfig, SchedulerFacade};
use gridmatch::storage::{MigrationRunner, PgTaskQueueStore, StoreError, TaskQueueStore};
use gridmatch::taskqueue::{Capabilities, JobRequirements, MultiValueField, TaskQueueDefinition};

async fn fresh_store() -> PgTaskQueueStore {
    let url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL environment variable must be set for integration tests");
    let store = PgTaskQueueStore::connect(&url)
        .await
        .expect("Should connect to database");
    let runner = MigrationRunner::new(store.pool().clone());
    runner.reset_database().await.expect("Should reset schema");
    runner.run_migrations().await.expect("Should migrate");
    store
}

#[tokio::test]
#[ignore] // Run with: cargo test --test postgres_store -- --ignored
async fn test_fingerprint_lookup_and_uniqueness() {
    let store = fresh_store().await;
    let def = TaskQueueDefinition::new("/CN=a", "g", "S", 5_000)
        .with_values(MultiValueField::Sites, ["A", "B"])
        .with_values(MultiValueField::BannedSites, Vec::<String>::new());

    let id = store.create(&def, 1.0, false).await.expect("Should create");
    assert_eq!(store.find(&def).await.unwrap(), Some(id));

    let err = store.create(&def, 1.0, false).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateDefinition));

    let wildcard = TaskQueueDefinition::new("/CN=a", "g", "S", 5_000)
        .with_values(MultiValueField::Sites, ["A", "B"]);
    assert_eq!(store.find(&wildcard).await.unwrap(), None);

    let loaded = store.get_task_queue(id).await.unwrap().expect("Should load");
    assert_eq!(loaded.definition, def);
    assert!(!loaded.enabled);
}

#[tokio::test]
#[ignore]
async fn test_enabled_flag_compare_and_swap() {
    let store = fresh_store().await;
    let def = TaskQueueDefinition::new("/CN=a", "g", "S", 500);
    let id = store.create(&def, 1.0, false).await.unwrap();

    assert!(!store.set_enabled(id, true, false).await.unwrap().changed);
    assert!(store.set_enabled(id, false, true).await.unwrap().changed);
    assert!(!store.set_enabled(id, false, true).await.unwrap().changed);

    store.add_job(id, "j1", 1, 1.0).await.unwrap();
    assert!(!store.delete_if_empty(id).await.unwrap());
    assert!(store.remove_job("j1").await.unwrap().removed);
    assert!(!store.remove_job("j1").await.unwrap().removed);
    assert!(store.delete_if_empty(id).await.unwrap());
    assert_eq!(store.find(&def).await.unwrap(), None);
}

#[tokio::test]
#[ignore]
async fn test_matching_query_honours_wildcards_and_bans() {
    let store = fresh_store().await;
    let open = TaskQueueDefinition::new("/CN=a", "g", "S", 500)
        .with_values(MultiValueField::BannedSites, ["Bad"]);
    let listed = TaskQueueDefinition::new("/CN=b", "g", "S", 500)
        .with_values(MultiValueField::Sites, ["Good"]);
    let open_id = store.create(&open, 1.0, true).await.unwrap();
    let listed_id = store.create(&listed, 1.0, true).await.unwrap();

    let ids = |caps: Capabilities| {
        let filter = caps.validate(&BTreeSet::new()).unwrap();
        let store = store.clone();
        async move {
            store
                .matching_queues(&filter)
                .await
                .unwrap()
                .into_iter()
                .map(|c| c.task_queue_id)
                .collect::<BTreeSet<_>>()
        }
    };

    let good = Capabilities::new().with_value(MultiValueField::Sites, "Good");
    assert_eq!(ids(good).await, BTreeSet::from([open_id, listed_id]));

    let other = Capabilities::new().with_value(MultiValueField::Sites, "Other");
    assert_eq!(ids(other).await, BTreeSet::from([open_id]));

    let bad = Capabilities::new().with_value(MultiValueField::Sites, "Bad");
    assert!(ids(bad).await.is_empty());
}

#[tokio::test]
#[ignore]
async fn test_scheduler_round_trip() {
    let store = Arc::new(fresh_store().await);
    let scheduler = SchedulerFacade::new(
        SchedulerConfig::default().with_rng_seed(1),
        store.clone(),
        Arc::new(StaticShareConfig::new(1.0)),
        None,
    )
    .unwrap();

    let reqs = JobRequirements::new("/CN=u", "g", "S", 1_000);
    let id = scheduler.insert_job("j1", &reqs, 10).await.unwrap();
    assert_eq!(scheduler.insert_job("j2", &reqs, 5).await.unwrap(), id);

    let caps = Capabilities::new().with_setup("S").with_cpu_time(2_000);
    assert!(scheduler.match_job(&caps).await.unwrap().is_match());
    assert!(scheduler.match_job(&caps).await.unwrap().is_match());
    assert_eq!(scheduler.match_job(&caps).await.unwrap(), MatchOutcome::NoMatch);
    assert!(store.get_task_queue(id).await.unwrap().is_none());
}
