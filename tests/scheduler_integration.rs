//! End-to-end scheduler tests against the in-memory store.

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use gridmatch::collaborators::{
    FileUsageReporter, InMemoryUsageReporter, StaticShareConfig, UsageGrouping,
};
use gridmatch::scheduler::{
    HistoryConfig, HistoryWindow, MatchOutcome, SchedulerConfig, SchedulerFacade, SharesCorrector,
};
use gridmatch::storage::{MemoryTaskQueueStore, QueueFilter, TaskQueue, TaskQueueStore};
use gridmatch::taskqueue::{
    Capabilities, JobRequirements, MultiValueField, TaskQueueDefinition, TaskQueueId,
};
use gridmatch::SchedulerError;

fn config(seed: u64) -> SchedulerConfig {
    SchedulerConfig::default()
        .with_rng_seed(seed)
        .with_insert_retry_delay(Duration::from_millis(1))
}

fn scheduler(store: Arc<MemoryTaskQueueStore>, shares: StaticShareConfig, seed: u64) -> SchedulerFacade {
    SchedulerFacade::new(config(seed), store, Arc::new(shares), None)
        .expect("valid scheduler config")
}

fn reqs(owner: &str, group: &str) -> JobRequirements {
    JobRequirements::new(owner, group, "S", 1_000)
}

fn priority(queues: &[TaskQueue], id: TaskQueueId) -> f64 {
    queues
        .iter()
        .find(|q| q.id == id)
        .expect("queue listed")
        .priority
}

#[tokio::test]
async fn test_two_jobs_one_queue_end_to_end() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let scheduler = scheduler(store.clone(), StaticShareConfig::new(1.0), 11);

    let q1 = scheduler.insert_job("j1", &reqs("/CN=u", "g"), 10).await.unwrap();
    let q2 = scheduler.insert_job("j2", &reqs("/CN=u", "g"), 5).await.unwrap();
    assert_eq!(q1, q2);
    assert_eq!(store.queue_count(), 1);
    assert_eq!(store.count_jobs(q1).await.unwrap(), 2);

    let caps = Capabilities::new().with_setup("S").with_cpu_time(2_000);
    let mut seen = HashSet::new();
    for _ in 0..2 {
        match scheduler.match_job(&caps).await.unwrap() {
            MatchOutcome::Matched(job) => {
                assert_eq!(job.task_queue_id, q1);
                assert!(seen.insert(job.job_id));
            }
            MatchOutcome::NoMatch => panic!("expected a job"),
        }
    }
    assert_eq!(seen, HashSet::from(["j1".to_string(), "j2".to_string()]));

    assert_eq!(scheduler.match_job(&caps).await.unwrap(), MatchOutcome::NoMatch);
    assert!(store.get_task_queue(q1).await.unwrap().is_none());
    assert_eq!(store.queue_count(), 0);
}

#[tokio::test]
async fn test_equivalent_requirements_share_a_queue() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let scheduler = scheduler(store.clone(), StaticShareConfig::new(1.0), 12);

    let a = reqs("/CN=u", "g").with_values(MultiValueField::Sites, ["B", "A", "A"]);
    let b = reqs("/CN=u", "g").with_values(MultiValueField::Sites, [" A", "B "]);
    let q1 = scheduler.insert_job("j1", &a, 1).await.unwrap();
    let q2 = scheduler.insert_job("j2", &b, 1).await.unwrap();
    assert_eq!(q1, q2);

    // Same bucket, different absence of a multi-value attribute.
    let wildcard = reqs("/CN=u", "g");
    let q3 = scheduler.insert_job("j3", &wildcard, 1).await.unwrap();
    assert_ne!(q1, q3);

    // cpuTime 600 and 1000 both bucket to 5000.
    let q4 = scheduler
        .insert_job("j4", &JobRequirements::new("/CN=u", "g", "S", 600), 1)
        .await
        .unwrap();
    assert_eq!(q3, q4);
    assert_eq!(store.queue_count(), 2);
}

#[tokio::test]
async fn test_fair_share_frequency_follows_priorities() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let heavy = TaskQueueDefinition::new("/CN=heavy", "g", "S", 5_000);
    let light = TaskQueueDefinition::new("/CN=light", "g", "S", 5_000);
    let heavy_id = store.create(&heavy, 1.0, true).await.unwrap();
    let light_id = store.create(&light, 1.0, true).await.unwrap();

    let trials = 4_000;
    for i in 0..trials {
        store.add_job(heavy_id, &format!("h{}", i), 1, 1.0).await.unwrap();
        store.add_job(light_id, &format!("l{}", i), 1, 1.0).await.unwrap();
    }
    store
        .set_priorities(&[(heavy_id, 3.0), (light_id, 1.0)])
        .await
        .unwrap();

    let scheduler = scheduler(store.clone(), StaticShareConfig::new(1.0), 13);
    let caps = Capabilities::new().with_setup("S");
    let mut from_heavy = 0;
    for _ in 0..trials {
        let outcome = scheduler.match_job(&caps).await.unwrap();
        if outcome.job().unwrap().task_queue_id == heavy_id {
            from_heavy += 1;
        }
    }

    let frequency = from_heavy as f64 / trials as f64;
    assert!(
        (frequency - 0.75).abs() < 0.03,
        "heavy queue frequency {} not within 0.03 of 0.75",
        frequency
    );
}

#[tokio::test]
async fn test_orphans_are_removed_everywhere() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let scheduler = scheduler(store.clone(), StaticShareConfig::new(1.0), 14);
    let requirements = reqs("/CN=u", "g").with_values(MultiValueField::Platforms, ["EL9"]);
    let id = scheduler.insert_job("j1", &requirements, 1).await.unwrap();

    let report = scheduler.delete_jobs(&["j1".to_string()]).await.unwrap();
    assert_eq!(report.deleted_queues, vec![id]);

    let definition = requirements
        .to_definition(&config(0).segments().unwrap())
        .unwrap();
    assert_eq!(store.find(&definition).await.unwrap(), None);
    assert!(scheduler
        .matching_task_queues(&Capabilities::new())
        .await
        .unwrap()
        .is_empty());

    // An empty queue left behind by other means is swept up too.
    let stray = store
        .create(&TaskQueueDefinition::new("/CN=x", "h", "S", 500), 1.0, true)
        .await
        .unwrap();
    assert_eq!(scheduler.clean_orphaned_task_queues().await.unwrap(), vec![stray]);
    assert_eq!(store.queue_count(), 0);
}

#[tokio::test]
async fn test_disabled_queue_makes_inserts_busy() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let facade = SchedulerFacade::new(
        config(15).with_insert_retries(4),
        store.clone(),
        Arc::new(StaticShareConfig::new(1.0)),
        None,
    )
    .unwrap();
    let id = facade.insert_job("j1", &reqs("/CN=u", "g"), 1).await.unwrap();
    assert!(store.set_enabled(id, true, false).await.unwrap().changed);

    let err = facade.insert_job("j2", &reqs("/CN=u", "g"), 1).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Busy { attempts: 4 }));

    // Matching skips it as well, without touching its jobs.
    assert_eq!(
        facade.match_job(&Capabilities::new()).await.unwrap(),
        MatchOutcome::NoMatch
    );
    assert_eq!(store.job_count(), 1);
}

#[tokio::test]
async fn test_concurrent_matches_never_share_a_job() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let facade = Arc::new(scheduler(store.clone(), StaticShareConfig::new(1.0), 16));
    for i in 0..40 {
        let owner = format!("/CN=u{}", i % 4);
        facade
            .insert_job(&format!("j{}", i), &reqs(&owner, "g"), (i % 5) as i64)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let facade = Arc::clone(&facade);
        handles.push(tokio::spawn(async move {
            let mut taken = Vec::new();
            while let MatchOutcome::Matched(job) =
                facade.match_job(&Capabilities::new()).await.unwrap()
            {
                taken.push(job.job_id);
            }
            taken
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(unique.len(), all.len());
    assert_eq!(all.len(), 40);
    assert_eq!(store.queue_count(), 0);
}

#[tokio::test]
async fn test_pooled_and_split_groups() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let shares = StaticShareConfig::new(1.0)
        .with_group("pooled", 6.0, true)
        .with_group("split", 6.0, false);
    let scheduler = scheduler(store.clone(), shares, 17);

    let p1 = scheduler.insert_job("p1", &reqs("/CN=a", "pooled"), 2).await.unwrap();
    let p2 = scheduler.insert_job("p2", &reqs("/CN=b", "pooled"), 1).await.unwrap();
    let s1 = scheduler.insert_job("s1", &reqs("/CN=a", "split"), 2).await.unwrap();
    let s2 = scheduler.insert_job("s2", &reqs("/CN=b", "split"), 1).await.unwrap();
    scheduler.recalculate_all().await.unwrap();

    let queues = scheduler
        .retrieve_task_queues(&QueueFilter::new())
        .await
        .unwrap();

    // Pooled: one share split by job priority sums, 2:1.
    assert!((priority(&queues, p1) - 4.0).abs() < 1e-9);
    assert!((priority(&queues, p2) - 2.0).abs() < 1e-9);
    // Split: each identity gets half regardless of job priorities.
    assert!((priority(&queues, s1) - 3.0).abs() < 1e-9);
    assert!((priority(&queues, s2) - 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_history_boosts_underserved_group() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let day = Duration::from_secs(86_400);
    let reporter = Arc::new(InMemoryUsageReporter::new());
    reporter.set_usage(day, UsageGrouping::ByGroup, [("busy", 90.0), ("idle", 10.0)]);
    let history = HistoryConfig::default()
        .with_windows(vec![HistoryWindow::new(day, 1.0, 3.0)])
        .with_update_period(Duration::ZERO);
    let corrector = Arc::new(SharesCorrector::new(history, reporter));

    let facade = SchedulerFacade::new(
        config(18),
        store.clone(),
        Arc::new(StaticShareConfig::new(1.0)),
        Some(corrector.clone()),
    )
    .unwrap();
    let busy = facade.insert_job("b1", &reqs("/CN=a", "busy"), 1).await.unwrap();
    let idle = facade.insert_job("i1", &reqs("/CN=b", "idle"), 1).await.unwrap();

    let queues = facade.retrieve_task_queues(&QueueFilter::new()).await.unwrap();
    assert_eq!(priority(&queues, busy), priority(&queues, idle));

    assert!(gridmatch::scheduler::sweep_once(facade.calculator()).await.unwrap());
    let queues = facade.retrieve_task_queues(&QueueFilter::new()).await.unwrap();
    assert!(priority(&queues, idle) > priority(&queues, busy));
}

#[tokio::test]
async fn test_history_from_usage_export() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let mut export = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        export,
        "windows:\n  86400:\n    groups:\n      busy: 90.0\n      idle: 10.0"
    )
    .unwrap();
    let history = HistoryConfig::from_yaml_str(
        "update_period_secs: 0\nwindows:\n  - { time_span_secs: 86400, weight: 1.0, max_correction: 3.0 }\n",
    )
    .unwrap();
    let reporter = Arc::new(FileUsageReporter::new(export.path()));
    let corrector = Arc::new(SharesCorrector::new(history, reporter));

    let facade = SchedulerFacade::new(
        config(19),
        store.clone(),
        Arc::new(StaticShareConfig::new(1.0)),
        Some(corrector),
    )
    .unwrap();
    let busy = facade.insert_job("b1", &reqs("/CN=a", "busy"), 1).await.unwrap();
    let idle = facade.insert_job("i1", &reqs("/CN=b", "idle"), 1).await.unwrap();

    assert!(gridmatch::scheduler::sweep_once(facade.calculator()).await.unwrap());
    let queues = facade.retrieve_task_queues(&QueueFilter::new()).await.unwrap();
    assert!(priority(&queues, idle) > priority(&queues, busy));
}
