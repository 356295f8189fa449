//! Thread-mode worker pool and controller tests.

use frameflow::Error;
use frameflow::config::RunConfig;
use frameflow::execution::{
    App, ItemResult, Runner, StopHandle, WorkItem, WorkerConfig, WorkerPool, drive,
};
use frameflow::frame::Shape;
use frameflow::prelude::WorkflowApp;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Computes every real item, records which worker saw it.
struct Recorder {
    worker: usize,
    item: WorkItem,
    seen: Arc<Mutex<Vec<(usize, u64)>>>,
    fail: Option<u64>,
}

impl App for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }
    fn prepare(&mut self) -> frameflow::Result<()> {
        Ok(())
    }
    fn pre_cycle(&mut self, item: WorkItem) {
        self.item = item;
    }
    fn carry_on(&mut self) -> bool {
        matches!(self.item, WorkItem::Index(_))
    }
    fn compute(&mut self, index: u64) -> frameflow::Result<ItemResult> {
        if self.fail == Some(index) {
            return Err(Error::FatalIo(format!("item {index} unreadable")));
        }
        self.seen.lock().unwrap().push((self.worker, index));
        Ok(ItemResult::Published {
            shape: Shape::new(1, 1),
            source: index.to_string(),
        })
    }
    fn store_result(&mut self, _index: u64, _result: ItemResult) -> frameflow::Result<()> {
        Ok(())
    }
}

/// Controller side: collects what arrives.
#[derive(Default)]
struct Collector {
    stored: Vec<(u64, bool)>,
}

impl App for Collector {
    fn name(&self) -> &str {
        "collector"
    }
    fn prepare(&mut self) -> frameflow::Result<()> {
        Ok(())
    }
    fn carry_on(&mut self) -> bool {
        false
    }
    fn compute(&mut self, _index: u64) -> frameflow::Result<ItemResult> {
        unreachable!("the controller never computes")
    }
    fn store_result(&mut self, index: u64, result: ItemResult) -> frameflow::Result<()> {
        self.stored.push((index, result.is_failed()));
        Ok(())
    }
    fn start_index(&self) -> u64 {
        100
    }
}

fn fast() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(1),
        input_timeout: Duration::from_millis(5),
        compute_budget: None,
    }
}

type Seen = Arc<Mutex<Vec<(usize, u64)>>>;

fn recorder_pool(workers: usize, fail: Option<u64>) -> (WorkerPool, Seen) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let shared = seen.clone();
    let pool = WorkerPool::spawn_threads(workers, fast(), None, move |worker| {
        Ok(Box::new(Recorder {
            worker,
            item: WorkItem::Idle,
            seen: shared.clone(),
            fail,
        }) as Box<dyn App>)
    })
    .unwrap();
    (pool, seen)
}

// ============================================================================
// Pool
// ============================================================================

/// Every submitted index is computed exactly once across the pool.
#[test]
fn test_each_item_computed_once() {
    let (mut pool, seen) = recorder_pool(4, None);
    for i in 0..40 {
        pool.submit(i).unwrap();
    }
    let mut results = BTreeSet::new();
    while results.len() < 40 {
        if let Some((index, _)) = pool.recv_result(Duration::from_secs(5)).unwrap() {
            assert!(results.insert(index), "index {index} reported twice");
        }
    }
    pool.submit_terminal().unwrap();
    pool.wait_finished(Duration::from_secs(5)).unwrap();
    assert_eq!(pool.finished_count(), 4);

    let seen = seen.lock().unwrap();
    let indices: BTreeSet<u64> = seen.iter().map(|&(_, i)| i).collect();
    assert_eq!(seen.len(), 40);
    assert_eq!(indices, (0..40).collect());
}

#[test]
fn test_stop_acknowledged_by_every_worker() {
    let (mut pool, _) = recorder_pool(3, None);
    pool.stop();
    pool.wait_finished(Duration::from_secs(5)).unwrap();
    assert_eq!(pool.finished_count(), 3);
}

#[test]
fn test_factory_failure_still_acknowledges() {
    let mut pool = WorkerPool::spawn_threads(2, fast(), None, |worker| {
        if worker == 1 {
            Err(Error::Config("no detector".into()))
        } else {
            Ok(Box::new(Collector::default()) as Box<dyn App>)
        }
    })
    .unwrap();
    pool.stop();
    let err = pool.wait_finished(Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(pool.finished_count(), 2);
}

#[test]
fn test_zero_workers_rejected() {
    let result = WorkerPool::spawn_threads(0, fast(), None, |_| {
        Ok(Box::new(Collector::default()) as Box<dyn App>)
    });
    assert!(matches!(result, Err(Error::Config(_))));
}

// ============================================================================
// Controller
// ============================================================================

#[test]
fn test_drive_counts_failures() {
    let (pool, _) = recorder_pool(2, Some(103));
    let mut controller = Collector::default();
    let summary = drive(
        &mut controller,
        pool,
        Some(10),
        Duration::from_secs(5),
        &StopHandle::default(),
    )
    .unwrap();

    assert_eq!(summary.completed, 9);
    assert_eq!(summary.failed, 1);
    let mut indices: Vec<u64> = controller.stored.iter().map(|&(i, _)| i).collect();
    indices.sort_unstable();
    assert_eq!(indices, (100..110).collect::<Vec<_>>());
    assert!(controller.stored.contains(&(103, true)));
}

/// Ends the whole run from one worker; every other item computes normally.
struct Misconfigured {
    item: WorkItem,
}

impl App for Misconfigured {
    fn name(&self) -> &str {
        "misconfigured"
    }
    fn prepare(&mut self) -> frameflow::Result<()> {
        Ok(())
    }
    fn pre_cycle(&mut self, item: WorkItem) {
        self.item = item;
    }
    fn carry_on(&mut self) -> bool {
        matches!(self.item, WorkItem::Index(_))
    }
    fn compute(&mut self, index: u64) -> frameflow::Result<ItemResult> {
        if index == 100 {
            return Err(Error::Config("detector geometry missing".into()));
        }
        Ok(ItemResult::Published {
            shape: Shape::new(1, 1),
            source: index.to_string(),
        })
    }
    fn store_result(&mut self, _index: u64, _result: ItemResult) -> frameflow::Result<()> {
        Ok(())
    }
}

/// A run-terminating error in one worker ends the run while the other
/// worker is still alive.
#[test]
fn test_drive_ends_when_one_worker_fails_run() {
    let pool = WorkerPool::spawn_threads(2, fast(), None, |_| {
        Ok(Box::new(Misconfigured {
            item: WorkItem::Idle,
        }) as Box<dyn App>)
    })
    .unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let mut controller = Collector::default();
        let result = drive(
            &mut controller,
            pool,
            Some(4),
            Duration::from_secs(2),
            &StopHandle::default(),
        );
        let _ = tx.send(result);
    });

    let result = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("controller did not return");
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_drive_stops_on_request() {
    let (pool, _) = recorder_pool(1, None);
    let stop = StopHandle::default();
    stop.stop();
    let mut controller = Collector::default();
    let summary = drive(&mut controller, pool, None, Duration::from_secs(5), &stop).unwrap();
    assert_eq!(summary.completed + summary.failed, 0);
}

/// A workflow run in thread mode, from configuration to collected frames.
#[test]
fn test_runner_thread_mode_workflow() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("pipeline.toml"),
        r#"
        [[node]]
        id = "source"
        plugin = "constant_source"
        params = { height = 2, width = 3, value = 1.0 }

        [[node]]
        id = "scaled"
        plugin = "scale"
        parent = "source"
        params = { factor = 4.0 }
        "#,
    )
    .unwrap();
    let config_path = dir.path().join("run.toml");
    std::fs::write(
        &config_path,
        r#"
        [pool]
        workers = 3
        mode = "thread"
        poll_interval_ms = 1
        input_timeout_ms = 5

        [app]
        kind = "workflow"
        pipeline = "pipeline.toml"
        first_index = 5
        "#,
    )
    .unwrap();

    let config = RunConfig::load(&config_path).unwrap();
    let (_app, summary) = Runner::new(config).run(Some(12)).unwrap();
    assert_eq!(summary.completed, 12);
    assert_eq!(summary.failed, 0);
}

#[test]
fn test_workflow_results_are_collected_by_index() {
    let description = frameflow::pipeline::PipelineDescription::from_toml_str(
        r#"
        [[node]]
        id = "source"
        plugin = "constant_source"
        params = { height = 1, width = 1, value = 2.0 }
        "#,
    )
    .unwrap();
    let registry = Arc::new(frameflow::plugin::PluginRegistry::with_builtins());
    let worker_description = description.clone();
    let worker_registry = registry.clone();
    let pool = WorkerPool::spawn_threads(2, fast(), None, move |_| {
        Ok(Box::new(WorkflowApp::new(
            worker_description.clone(),
            worker_registry.clone(),
        )) as Box<dyn App>)
    })
    .unwrap();

    let mut controller = WorkflowApp::new(description, registry);
    controller.prepare().unwrap();
    drive(
        &mut controller,
        pool,
        Some(6),
        Duration::from_secs(5),
        &StopHandle::default(),
    )
    .unwrap();

    let indices: Vec<u64> = controller.results().keys().copied().collect();
    assert_eq!(indices, (0..6).collect::<Vec<_>>());
    for frames in controller.results().values() {
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame.as_slice(), &[2.0]);
    }
}
