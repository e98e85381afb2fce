use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use farmhand_castore::{
    blobservice::MemoryBlobService,
    cache::LocalCache,
    fixtures::{DUMMY_DIGEST, HELLOWORLD_BLOB_CONTENTS, HELLOWORLD_BLOB_DIGEST},
    DigestFunction, Directory, Node,
};
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tonic::async_trait;

use super::{ChannelSink, Completion, InputFetchStage, PipelineStage, StageWorker};
use crate::{
    action::{Action, Command},
    claims::ClaimPool,
    exec::ExecFileSystem,
    operation::{OperationContext, QueueEntry},
};

#[derive(Debug)]
struct Job {
    id: u32,
    fail: bool,
}

#[derive(Debug, thiserror::Error)]
enum JobError {
    #[error("job failed")]
    Failed,
    #[error("job interrupted")]
    Interrupted,
}

#[derive(Default)]
struct Counters {
    running: AtomicUsize,
    max_running: AtomicUsize,
}

/// Holds each job until the gate hands out a permit.
struct Gated {
    gate: Arc<Semaphore>,
    counters: Arc<Counters>,
}

#[async_trait]
impl StageWorker for Gated {
    type Unit = Job;
    type Error = JobError;

    fn name(&self) -> &'static str {
        "gated"
    }

    fn describe(&self, unit: &Job) -> String {
        format!("job-{}", unit.id)
    }

    async fn process(&self, unit: &mut Job, cancel: &CancellationToken) -> Result<(), JobError> {
        let running = self.counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters
            .max_running
            .fetch_max(running, Ordering::SeqCst);

        let result = tokio::select! {
            permit = self.gate.acquire() => {
                permit.unwrap().forget();
                if unit.fail { Err(JobError::Failed) } else { Ok(()) }
            }
            _ = cancel.cancelled() => Err(JobError::Interrupted),
        };

        self.counters.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

type Received<T> = mpsc::Receiver<(T, Completion)>;

fn gated_stage(
    width: u32,
) -> (
    Arc<PipelineStage<Gated>>,
    Arc<Semaphore>,
    Arc<Counters>,
    Received<Job>,
    Received<Job>,
) {
    let gate = Arc::new(Semaphore::new(0));
    let counters = Arc::new(Counters::default());
    let (output_tx, output_rx) = mpsc::channel(16);
    let (error_tx, error_rx) = mpsc::channel(16);

    let stage = Arc::new(PipelineStage::new(
        Gated {
            gate: gate.clone(),
            counters: counters.clone(),
        },
        width,
        Arc::new(ChannelSink::new(output_tx)),
        Arc::new(ChannelSink::new(error_tx)),
    ));
    (stage, gate, counters, output_rx, error_rx)
}

async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn active_never_exceeds_width() {
    let (stage, gate, counters, mut output_rx, _error_rx) = gated_stage(2);
    let cancel = CancellationToken::new();
    let driver = tokio::spawn(stage.clone().run(cancel.clone()));

    let producer = tokio::spawn({
        let stage = stage.clone();
        let cancel = cancel.clone();
        async move {
            for id in 0..5 {
                stage.put(Job { id, fail: false }, &cancel).await.unwrap();
            }
        }
    });

    wait_for(|| stage.slot_usage() == 2).await;
    // give the driver a chance to overshoot
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(2, stage.slot_usage());
    assert_eq!(2, counters.running.load(Ordering::SeqCst));

    gate.add_permits(5);
    producer.await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..5 {
        let (job, completion) = output_rx.recv().await.unwrap();
        assert!(completion.success);
        assert_eq!("gated", completion.stage);
        ids.push(job.id);
    }
    ids.sort();
    assert_eq!(vec![0, 1, 2, 3, 4], ids);
    assert!(counters.max_running.load(Ordering::SeqCst) <= 2);

    stage.close();
    driver.await.unwrap();
    assert_eq!(0, stage.slot_usage());
    assert_eq!(5, stage.metrics().completed());
    assert_eq!(0, stage.metrics().slot_usage());
}

#[tokio::test]
async fn failures_go_to_the_error_sink() {
    let (stage, gate, _counters, mut output_rx, mut error_rx) = gated_stage(1);
    let cancel = CancellationToken::new();
    let driver = tokio::spawn(stage.clone().run(cancel.clone()));
    gate.add_permits(2);

    stage.put(Job { id: 1, fail: true }, &cancel).await.unwrap();
    let (job, completion) = error_rx.recv().await.unwrap();
    assert_eq!(1, job.id);
    assert!(!completion.success);
    assert_eq!("0/1", completion.usage);
    assert_eq!("Failure, 0/1", completion.to_string());
    assert_eq!(Some("job failed".to_string()), completion.error);

    stage.put(Job { id: 2, fail: false }, &cancel).await.unwrap();
    let (job, completion) = output_rx.recv().await.unwrap();
    assert_eq!(2, job.id);
    assert_eq!("Success, 0/1", completion.to_string());

    stage.close();
    driver.await.unwrap();
    assert_eq!(1, stage.metrics().completed());
    assert_eq!(1, stage.metrics().failed());
}

#[tokio::test]
async fn cancelling_the_driver_interrupts_active_workers() {
    let (stage, _gate, counters, _output_rx, mut error_rx) = gated_stage(1);
    let cancel = CancellationToken::new();
    let driver = tokio::spawn(stage.clone().run(cancel.clone()));

    stage
        .put(Job { id: 7, fail: false }, &CancellationToken::new())
        .await
        .unwrap();
    wait_for(|| counters.running.load(Ordering::SeqCst) == 1).await;

    cancel.cancel();
    driver.await.unwrap();

    let (job, completion) = error_rx.recv().await.unwrap();
    assert_eq!(7, job.id);
    assert_eq!(Some("job interrupted".to_string()), completion.error);
    assert_eq!(0, stage.slot_usage());
}

#[tokio::test]
async fn put_gives_the_unit_back_once_closed() {
    let (stage, _gate, _counters, _output_rx, _error_rx) = gated_stage(1);
    stage.close();

    let job = stage
        .put(Job { id: 3, fail: false }, &CancellationToken::new())
        .await
        .expect_err("must be rejected");
    assert_eq!(3, job.id);
    assert!(stage.take().await.is_none());
}

#[tokio::test]
async fn units_queued_before_close_are_processed() {
    let (stage, gate, _counters, mut output_rx, _error_rx) = gated_stage(1);
    gate.add_permits(1);

    stage
        .put(Job { id: 1, fail: false }, &CancellationToken::new())
        .await
        .unwrap();
    stage.close();
    assert!(!stage.has_capacity());

    stage.clone().run(CancellationToken::new()).await;

    let (job, completion) = output_rx.recv().await.unwrap();
    assert_eq!(1, job.id);
    assert!(completion.success);
    assert_eq!(1, stage.metrics().completed());
}

#[tokio::test]
async fn units_queued_at_cancellation_go_to_the_error_sink() {
    let (stage, _gate, _counters, _output_rx, mut error_rx) = gated_stage(1);
    let cancel = CancellationToken::new();

    assert!(stage.has_capacity());
    stage
        .put(Job { id: 4, fail: false }, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!stage.has_capacity());

    cancel.cancel();
    stage.clone().run(cancel).await;

    let (job, completion) = error_rx.recv().await.unwrap();
    assert_eq!(4, job.id);
    assert!(!completion.success);
    assert_eq!(1, stage.metrics().failed());
}

/// Panics on odd job ids.
struct Panicky;

#[async_trait]
impl StageWorker for Panicky {
    type Unit = Job;
    type Error = JobError;

    fn name(&self) -> &'static str {
        "panicky"
    }

    fn describe(&self, unit: &Job) -> String {
        format!("job-{}", unit.id)
    }

    async fn process(&self, unit: &mut Job, _cancel: &CancellationToken) -> Result<(), JobError> {
        if unit.id % 2 == 1 {
            panic!("job-{} exploded", unit.id);
        }
        Ok(())
    }
}

#[tokio::test]
async fn panicking_worker_releases_its_slot() {
    let (output_tx, mut output_rx) = mpsc::channel(4);
    let (error_tx, mut error_rx) = mpsc::channel(4);
    let stage = Arc::new(PipelineStage::new(
        Panicky,
        1,
        Arc::new(ChannelSink::new(output_tx)),
        Arc::new(ChannelSink::new(error_tx)),
    ));
    let cancel = CancellationToken::new();
    let driver = tokio::spawn(stage.clone().run(cancel.clone()));

    stage.put(Job { id: 1, fail: false }, &cancel).await.unwrap();
    let (job, completion) = error_rx.recv().await.unwrap();
    assert_eq!(1, job.id);
    assert!(!completion.success);
    assert_eq!("0/1", completion.usage);
    assert_eq!(
        Some("worker panicked: job-1 exploded".to_string()),
        completion.error
    );
    assert_eq!(0, stage.slot_usage());

    stage.put(Job { id: 2, fail: false }, &cancel).await.unwrap();
    let (job, completion) = output_rx.recv().await.unwrap();
    assert_eq!(2, job.id);
    assert_eq!("Success, 0/1", completion.to_string());

    stage.close();
    driver.await.unwrap();
    assert_eq!(0, stage.slot_usage());
    assert_eq!(1, stage.metrics().failed());
    assert_eq!(1, stage.metrics().completed());
}

/// An operation's match claim travels with it through the input fetch stage
/// and is released once the context is dropped.
#[tokio::test]
async fn input_fetch_stage_materializes_exec_dirs() {
    let tmpdir = TempDir::new().unwrap();
    let blob_service = MemoryBlobService::default();
    blob_service.put(DigestFunction::Sha256, HELLOWORLD_BLOB_CONTENTS);
    let cache = Arc::new(
        LocalCache::new(tmpdir.path().join("cache"), blob_service)
            .await
            .unwrap(),
    );
    let exec = Arc::new(ExecFileSystem::new(tmpdir.path().join("exec"), cache));

    let (output_tx, mut output_rx) = mpsc::channel(4);
    let (error_tx, mut error_rx) = mpsc::channel(4);
    let stage = Arc::new(InputFetchStage::input_fetch(
        exec,
        2,
        Arc::new(ChannelSink::new(output_tx)),
        Arc::new(ChannelSink::new(error_tx)),
    ));
    let cancel = CancellationToken::new();
    let driver = tokio::spawn(stage.clone().run(cancel.clone()));

    let mut root = Directory::new();
    root.add(
        "hello.txt",
        Node::File {
            digest: HELLOWORLD_BLOB_DIGEST.clone(),
            executable: false,
        },
    )
    .unwrap();
    let good = root.digest(DigestFunction::Sha256);
    let index = Arc::new(HashMap::from([(good.clone(), root)]));

    let entry = |name: &str, input_root_digest| QueueEntry {
        operation_name: name.to_string(),
        action: Action {
            command_digest: DUMMY_DIGEST.clone(),
            input_root_digest,
        },
        command: Command::default(),
        index: index.clone(),
    };

    let slots = ClaimPool::new(2);
    let claim = slots.acquire(1).await.unwrap();
    stage
        .put(OperationContext::new(entry("good", good), claim), &cancel)
        .await
        .unwrap();

    let (context, completion) = output_rx.recv().await.unwrap();
    assert!(completion.success);
    let exec_dir = context.exec_dir.clone().expect("exec dir must be set");
    assert_eq!(
        HELLOWORLD_BLOB_CONTENTS,
        std::fs::read(exec_dir.join("hello.txt")).unwrap()
    );
    assert_eq!(1, slots.available());
    drop(context);
    assert_eq!(2, slots.available());

    // the input root is missing from the index
    let claim = slots.acquire(1).await.unwrap();
    stage
        .put(
            OperationContext::new(entry("bad", DUMMY_DIGEST.clone()), claim),
            &cancel,
        )
        .await
        .unwrap();
    let (context, completion) = error_rx.recv().await.unwrap();
    assert!(!completion.success);
    assert!(context.exec_dir.is_none());
    assert!(!tmpdir.path().join("exec/bad").exists());

    stage.close();
    driver.await.unwrap();
}
