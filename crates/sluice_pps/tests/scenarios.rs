//! End-to-end pipeline scenarios against an in-process cluster.

use async_trait::async_trait;
use sluice_coord::{MemoryKv, MetadataStore};
use sluice_core::{CommitId, JobId, Timestamp};
use sluice_pps::{
    Catalog, ClusterConfig, ControllerConfig, InputCommit, InputSpec, JobRecord, JobState, JobStatus,
    LocalCluster, PipelineSpec, PpsApi, Transform,
};
use sluice_storage::{FileEntry, FileTree, VersionedStore};
use sluice_worker::{
    DatumFiles, DatumOutcome, DatumRunner, FailurePolicy, FailureThreshold, FnRunner, Glob, OutputFile,
    RunError, WorkerConfig, WorkerState,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn config() -> ClusterConfig {
    ClusterConfig::new()
        .with_controller(
            ControllerConfig::new()
                .with_lease(1_000, 100)
                .with_recovery_interval(50)
                .with_job_liveness(300),
        )
        .with_worker(WorkerConfig::new().with_claim_timeout(300).with_heartbeat_interval(20))
}

fn job_id(pipeline: &str, input: &str, repo: &str, commit: CommitId) -> JobId {
    JobRecord::new(pipeline, pipeline, vec![InputCommit::commit(input, repo, commit)], true).id
}

async fn commit_files(store: &VersionedStore, repo: &str, files: &[(&str, &str)]) -> CommitId {
    let info = store.start_commit(repo, "master", None).await.unwrap();
    for (path, data) in files {
        store.put_file(repo, &info.id, path, data.as_bytes().to_vec()).await.unwrap();
    }
    store.finish_commit(repo, &info.id).await.unwrap();
    info.id
}

/// Wait for a job to be created, then for it to end
async fn await_job(cluster: &LocalCluster, id: &JobId) -> JobStatus {
    for _ in 0..500 {
        if cluster.api().inspect_job(id).await.is_ok() {
            return cluster.wait_for_job(id, Duration::from_secs(10)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} was never created", id);
}

fn copy_runner() -> Arc<dyn DatumRunner> {
    Arc::new(FnRunner::new("copy", |d: &DatumFiles| -> Result<Vec<OutputFile>, RunError> {
        Ok(d.files.iter().map(|f| OutputFile::new(f.path.clone(), f.data.clone())).collect())
    }))
}

/// Copies its input unless it sees `/bad`
fn picky_runner() -> Arc<dyn DatumRunner> {
    Arc::new(FnRunner::new("picky", |d: &DatumFiles| -> Result<Vec<OutputFile>, RunError> {
        if d.files.iter().any(|f| f.path == "/bad") {
            return Err(RunError::Transform("refusing /bad".to_string()));
        }
        Ok(d.files.iter().map(|f| OutputFile::new(f.path.clone(), f.data.clone())).collect())
    }))
}

/// Copies its input after a delay, counting executions
#[derive(Debug)]
struct SlowRunner {
    delay: Duration,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl DatumRunner for SlowRunner {
    async fn run(&self, datum: &DatumFiles) -> Result<Vec<OutputFile>, RunError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(datum
            .files
            .iter()
            .map(|f| OutputFile::new(f.path.clone(), f.data.clone()))
            .collect())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_process_transform_copies_file() {
    let cluster = LocalCluster::start(config()).await.unwrap();
    let store = cluster.store().clone();
    store.create_repo("r", "raw input").await.unwrap();

    let spec = PipelineSpec::new(
        "cat",
        Transform::new(
            "busybox",
            vec![
                "sh".into(),
                "-c".into(),
                r#"cat "$SLUICE_INPUT_DIR/r/file" > "$SLUICE_OUTPUT_DIR/file""#.into(),
            ],
        ),
    )
    .with_input(InputSpec::repo("r", "r", "master", Glob::Root));
    cluster.api().create_pipeline(spec).await.unwrap();

    let input = commit_files(&store, "r", &[("/file", "hello")]).await;
    let id = job_id("cat", "r", "r", input);
    assert_eq!(await_job(&cluster, &id).await, JobStatus::Success);

    let job = cluster.api().inspect_job(&id).await.unwrap();
    let output = job.output_commit.unwrap();
    assert_eq!(store.get_file("cat", &output, "/file").await.unwrap().as_ref(), b"hello");
    assert_eq!(cluster.api().inspect_branch("cat", "master").await.unwrap().head, Some(output));
    assert!(cluster.api().inspect_commit("cat", &output).await.unwrap().is_finished());
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_policies() {
    let cluster = LocalCluster::start(config()).await.unwrap();
    cluster.runners().register("picky", picky_runner());
    let store = cluster.store().clone();
    store.create_repo("data", "").await.unwrap();

    let pipeline = |name: &str, policy: FailurePolicy| {
        PipelineSpec::new(name, Transform::new("picky", vec!["picky".into()]))
            .with_input(InputSpec::repo("data", "data", "master", Glob::Files))
            .with_datum_tries(2)
            .with_failure_policy(policy)
    };
    cluster
        .api()
        .create_pipeline(pipeline("strict", FailurePolicy::FailFast))
        .await
        .unwrap();
    cluster
        .api()
        .create_pipeline(pipeline(
            "lenient",
            FailurePolicy::BestEffort {
                threshold: FailureThreshold::Count(0),
            },
        ))
        .await
        .unwrap();
    cluster
        .api()
        .create_pipeline(pipeline(
            "tolerant",
            FailurePolicy::BestEffort {
                threshold: FailureThreshold::Percent(50),
            },
        ))
        .await
        .unwrap();

    let input = commit_files(&store, "data", &[("/good", "g"), ("/bad", "b")]).await;

    let strict = job_id("strict", "data", "data", input);
    assert_eq!(await_job(&cluster, &strict).await, JobStatus::Error);
    let job = cluster.api().inspect_job(&strict).await.unwrap();
    assert_eq!(job.state, JobState::Failure);
    assert!(job.reason.is_some());
    let output = job.output_commit.unwrap();
    assert!(store.inspect_commit("strict", &output).await.unwrap().is_finished());
    assert!(store.get_file("strict", &output, "/good").await.unwrap_err().is_not_found());

    let lenient = job_id("lenient", "data", "data", input);
    assert_eq!(await_job(&cluster, &lenient).await, JobStatus::Error);
    let output = cluster.api().inspect_job(&lenient).await.unwrap().output_commit.unwrap();
    assert_eq!(store.get_file("lenient", &output, "/good").await.unwrap().as_ref(), b"g");

    let tolerant = job_id("tolerant", "data", "data", input);
    assert_eq!(await_job(&cluster, &tolerant).await, JobStatus::Success);
    let job = cluster.api().inspect_job(&tolerant).await.unwrap();
    assert_eq!(job.counts.failed, 1);
    let output = job.output_commit.unwrap();
    assert_eq!(store.get_file("tolerant", &output, "/good").await.unwrap().as_ref(), b"g");
    assert!(store.get_file("tolerant", &output, "/bad").await.unwrap_err().is_not_found());
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_finishes_open_commit_of_finished_job() {
    let meta = MetadataStore::new(Arc::new(MemoryKv::new()));
    let store = VersionedStore::in_memory();
    store.create_repo("r", "").await.unwrap();
    let input = commit_files(&store, "r", &[("/file", "hello")]).await;

    let api = PpsApi::new(Catalog::new(meta.clone()), store.clone());
    let spec = PipelineSpec::new("p", Transform::new("copy", vec!["cp".into()]))
        .with_input(InputSpec::repo("r", "r", "master", Glob::Root));
    api.create_pipeline(spec).await.unwrap();

    // A leader staged the output and recorded success, then died before
    // finishing the commit.
    let open = store.start_output_commit("p", "master", None).await.unwrap();
    let data = b"hello".to_vec();
    let entry = FileEntry {
        size: data.len() as u64,
        address: store.content().write(data).unwrap(),
    };
    let mut tree = FileTree::new();
    tree.insert("/file", entry).unwrap();
    store.put_datum_output("p", &open.id, "datum-0", tree).await.unwrap();

    let mut job = JobRecord::new("p", "p", vec![InputCommit::commit("r", "r", input)], true);
    job.advance(JobState::Running).unwrap();
    job.output_commit = Some(open.id);
    job.advance(JobState::Success).unwrap();
    Catalog::new(meta.clone()).create_job_once(&job).await.unwrap();
    assert_eq!(api.get_job_status(&job.id).await.unwrap(), JobStatus::Running);

    let cluster = LocalCluster::from_parts(config(), meta, store.clone()).await.unwrap();
    cluster.runners().register("copy", copy_runner());
    assert_eq!(
        cluster.wait_for_job(&job.id, Duration::from_secs(10)).await.unwrap(),
        JobStatus::Success
    );
    assert_eq!(store.get_file("p", &open.id, "/file").await.unwrap().as_ref(), b"hello");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let jobs = cluster.api().list_jobs(Some("p")).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(store.list_commit("p", None).await.unwrap().len(), 1);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_kill_running_job() {
    let cluster = LocalCluster::start(config()).await.unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    cluster.runners().register(
        "slow",
        Arc::new(SlowRunner {
            delay: Duration::from_millis(100),
            runs: runs.clone(),
        }),
    );
    let store = cluster.store().clone();
    store.create_repo("many", "").await.unwrap();
    cluster
        .api()
        .create_pipeline(
            PipelineSpec::new("slow", Transform::new("slow", vec!["sleep".into()]))
                .with_input(InputSpec::repo("many", "many", "master", Glob::Files)),
        )
        .await
        .unwrap();

    let names: Vec<String> = (0..20).map(|i| format!("/f{:02}", i)).collect();
    let files: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), "x")).collect();
    let input = commit_files(&store, "many", &files).await;
    let id = job_id("slow", "many", "many", input);

    for _ in 0..500 {
        if runs.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(runs.load(Ordering::SeqCst) > 0);

    let killed = cluster.api().kill_job(&id).await.unwrap();
    assert_eq!(killed.state, JobState::Killed);
    assert_eq!(
        cluster.wait_for_job(&id, Duration::from_secs(5)).await.unwrap(),
        JobStatus::Killed
    );

    let mut finished = false;
    for _ in 0..300 {
        let job = cluster.api().inspect_job(&id).await.unwrap();
        if let Some(output) = job.output_commit {
            if store.inspect_commit("slow", &output).await.unwrap().is_finished() {
                assert!(store.get_tree("slow", &output).await.unwrap().is_empty());
                finished = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(finished, "output commit of the killed job was left open");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let settled = runs.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(runs.load(Ordering::SeqCst), settled);
    assert!(settled < names.len());
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_create_job_reruns_killed_input_set() {
    let cluster = LocalCluster::start(config()).await.unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    cluster.runners().register(
        "slow",
        Arc::new(SlowRunner {
            delay: Duration::from_millis(20),
            runs: runs.clone(),
        }),
    );
    let store = cluster.store().clone();
    store.create_repo("many", "").await.unwrap();
    cluster
        .api()
        .create_pipeline(
            PipelineSpec::new("slow", Transform::new("slow", vec!["sleep".into()]))
                .with_input(InputSpec::repo("many", "many", "master", Glob::Files)),
        )
        .await
        .unwrap();

    let names: Vec<String> = (0..20).map(|i| format!("/f{:02}", i)).collect();
    let files: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), "x")).collect();
    let input = commit_files(&store, "many", &files).await;
    let id = job_id("slow", "many", "many", input);
    for _ in 0..500 {
        if runs.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cluster.api().kill_job(&id).await.unwrap();
    assert_eq!(
        cluster.wait_for_job(&id, Duration::from_secs(5)).await.unwrap(),
        JobStatus::Killed
    );

    let rerun = cluster
        .api()
        .create_job("slow", &[("many".to_string(), input)])
        .await
        .unwrap();
    assert_ne!(rerun.id, id);
    assert_eq!(rerun.generation, 1);
    cluster.api().start_job(&rerun.id).await.unwrap();
    assert_eq!(await_job(&cluster, &rerun.id).await, JobStatus::Success);

    let output = cluster.api().inspect_job(&rerun.id).await.unwrap().output_commit.unwrap();
    assert_eq!(store.get_tree("slow", &output).await.unwrap().len(), names.len());
    assert_eq!(cluster.api().get_job_status(&id).await.unwrap(), JobStatus::Killed);
    assert_eq!(cluster.api().list_jobs(Some("slow")).await.unwrap().len(), 2);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_create_job_yields_one_job() {
    let cluster = LocalCluster::start(config()).await.unwrap();
    cluster.runners().register("copy", copy_runner());
    let store = cluster.store().clone();
    store.create_repo("r", "").await.unwrap();
    cluster
        .api()
        .create_pipeline(
            PipelineSpec::new("dedup", Transform::new("copy", vec!["cp".into()]))
                .with_input(InputSpec::repo("r", "r", "master", Glob::Files)),
        )
        .await
        .unwrap();
    let input = commit_files(&store, "r", &[("/a", "1")]).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let api = cluster.api().clone();
        handles.push(tokio::spawn(async move {
            api.create_job("dedup", &[("r".to_string(), input)]).await.unwrap().id
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids, vec![job_id("dedup", "r", "r", input)]);

    cluster.api().start_job(&ids[0]).await.unwrap();
    assert_eq!(await_job(&cluster, &ids[0]).await, JobStatus::Success);
    assert_eq!(cluster.api().list_jobs(Some("dedup")).await.unwrap().len(), 1);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sequential_commits_leave_no_open_commit() {
    let cluster = LocalCluster::start(config()).await.unwrap();
    cluster.runners().register("picky", picky_runner());
    let store = cluster.store().clone();
    store.create_repo("src", "").await.unwrap();
    cluster
        .api()
        .create_pipeline(
            PipelineSpec::new("seq", Transform::new("picky", vec!["picky".into()]))
                .with_input(InputSpec::repo("src", "src", "master", Glob::Files)),
        )
        .await
        .unwrap();

    let first = commit_files(&store, "src", &[("/a", "1")]).await;
    assert_eq!(await_job(&cluster, &job_id("seq", "src", "src", first)).await, JobStatus::Success);
    let second = commit_files(&store, "src", &[("/bad", "2")]).await;
    assert_eq!(await_job(&cluster, &job_id("seq", "src", "src", second)).await, JobStatus::Error);
    let third = commit_files(&store, "src", &[("/c", "3")]).await;
    let last = job_id("seq", "src", "src", third);
    assert_eq!(await_job(&cluster, &last).await, JobStatus::Success);

    let jobs = cluster.api().list_jobs(Some("seq")).await.unwrap();
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.state.is_terminal()));
    for commit in store.list_commit("seq", None).await.unwrap() {
        assert!(commit.is_finished(), "commit {} left open", commit.id);
    }
    let head = cluster.api().inspect_branch("seq", "master").await.unwrap().head;
    assert_eq!(head, cluster.api().inspect_job(&last).await.unwrap().output_commit);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crashed_worker_datum_is_redispatched() {
    let cluster = LocalCluster::start(config()).await.unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    cluster.runners().register(
        "slow",
        Arc::new(SlowRunner {
            delay: Duration::from_millis(400),
            runs: runs.clone(),
        }),
    );
    let store = cluster.store().clone();
    store.create_repo("pair", "").await.unwrap();
    cluster
        .api()
        .create_pipeline(
            PipelineSpec::new("crashy", Transform::new("slow", vec!["sleep".into()]))
                .with_input(InputSpec::repo("pair", "pair", "master", Glob::Files))
                .with_parallelism(2)
                .with_stats(true),
        )
        .await
        .unwrap();
    let input = commit_files(&store, "pair", &[("/a", "1"), ("/b", "2")]).await;
    let id = job_id("crashy", "pair", "pair", input);

    let mut crashed = false;
    for _ in 0..500 {
        if let Some(pool) = cluster.pool("crashy").await {
            let busy = pool
                .workers()
                .await
                .into_iter()
                .find(|(_, state)| *state == WorkerState::Busy);
            if let Some((worker, _)) = busy {
                pool.crash_worker(&worker).await.unwrap();
                crashed = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(crashed);

    assert_eq!(await_job(&cluster, &id).await, JobStatus::Success);
    let output = cluster.api().inspect_job(&id).await.unwrap().output_commit.unwrap();
    assert_eq!(store.get_file("crashy", &output, "/a").await.unwrap().as_ref(), b"1");
    assert_eq!(store.get_file("crashy", &output, "/b").await.unwrap().as_ref(), b"2");
    assert!(runs.load(Ordering::SeqCst) >= 3);

    let stats = cluster.api().get_job_stats(&id).await.unwrap();
    assert_eq!(stats.datums.len(), 2);
    assert!(stats.datums.iter().all(|d| d.outcome == DatumOutcome::Success));
    assert!(stats.datums.iter().any(|d| d.attempts >= 2));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_host_dir_input() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("one"), b"1").unwrap();
    std::fs::create_dir_all(dir.path().join("nested")).unwrap();
    std::fs::write(dir.path().join("nested/two"), b"2").unwrap();

    let cluster = LocalCluster::start(config()).await.unwrap();
    cluster.runners().register("copy", copy_runner());
    cluster
        .api()
        .create_pipeline(
            PipelineSpec::new("mirror", Transform::new("copy", vec!["cp".into()]))
                .with_input(InputSpec::host_dir("local", dir.path(), Glob::Files)),
        )
        .await
        .unwrap();

    let job = cluster.api().create_job("mirror", &[]).await.unwrap();
    cluster.api().start_job(&job.id).await.unwrap();
    assert_eq!(await_job(&cluster, &job.id).await, JobStatus::Success);

    let again = cluster.api().create_job("mirror", &[]).await.unwrap();
    assert_eq!(again.id, job.id);
    assert_eq!(cluster.api().list_jobs(Some("mirror")).await.unwrap().len(), 1);

    let output = cluster.api().inspect_job(&job.id).await.unwrap().output_commit.unwrap();
    let store = cluster.store();
    assert_eq!(store.get_file("mirror", &output, "/one").await.unwrap().as_ref(), b"1");
    assert_eq!(store.get_file("mirror", &output, "/nested/two").await.unwrap().as_ref(), b"2");
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_commits_finished_between_leaders_are_processed() {
    let replicated = || {
        config().with_controller(
            ControllerConfig::new()
                .with_replicas(2)
                .with_lease(1_000, 100)
                .with_recovery_interval(50)
                .with_job_liveness(300),
        )
    };
    let meta = MetadataStore::new(Arc::new(MemoryKv::new()));
    let store = VersionedStore::in_memory();
    store.create_repo("r", "").await.unwrap();

    let before = LocalCluster::from_parts(replicated(), meta.clone(), store.clone()).await.unwrap();
    before.runners().register("copy", copy_runner());
    before
        .api()
        .create_pipeline(
            PipelineSpec::new("relay", Transform::new("copy", vec!["cp".into()]))
                .with_input(InputSpec::repo("r", "r", "master", Glob::Files)),
        )
        .await
        .unwrap();
    let first = commit_files(&store, "r", &[("/one", "1")]).await;
    assert_eq!(await_job(&before, &job_id("relay", "r", "r", first)).await, JobStatus::Success);
    before.shutdown().await;

    let second = commit_files(&store, "r", &[("/two", "2")]).await;
    let third = commit_files(&store, "r", &[("/three", "3")]).await;

    let after = LocalCluster::from_parts(replicated(), meta, store.clone()).await.unwrap();
    after.runners().register("copy", copy_runner());
    for commit in [second, third] {
        let id = job_id("relay", "r", "r", commit);
        assert_eq!(await_job(&after, &id).await, JobStatus::Success);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(after.api().list_jobs(Some("relay")).await.unwrap().len(), 3);

    let job = after.api().inspect_job(&job_id("relay", "r", "r", third)).await.unwrap();
    let output = job.output_commit.unwrap();
    assert_eq!(store.get_file("relay", &output, "/three").await.unwrap().as_ref(), b"3");
    after.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_replicas_run_each_job_once() {
    let cluster = LocalCluster::start(config().with_controller(
        ControllerConfig::new()
            .with_replicas(2)
            .with_lease(1_000, 100)
            .with_recovery_interval(50)
            .with_job_liveness(300),
    ))
    .await
    .unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    cluster.runners().register(
        "slow",
        Arc::new(SlowRunner {
            delay: Duration::from_millis(10),
            runs: runs.clone(),
        }),
    );
    let store = cluster.store().clone();
    store.create_repo("r", "").await.unwrap();
    cluster
        .api()
        .create_pipeline(
            PipelineSpec::new("twice", Transform::new("slow", vec!["sleep".into()]))
                .with_input(InputSpec::repo("r", "r", "master", Glob::Files)),
        )
        .await
        .unwrap();
    let input = commit_files(&store, "r", &[("/a", "1"), ("/b", "2"), ("/c", "3")]).await;
    let id = job_id("twice", "r", "r", input);
    assert_eq!(await_job(&cluster, &id).await, JobStatus::Success);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.replicas().len(), 2);
    assert_eq!(cluster.api().list_jobs(Some("twice")).await.unwrap().len(), 1);
    assert_eq!(store.list_commit("twice", None).await.unwrap().len(), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    let job = cluster.api().inspect_job(&id).await.unwrap();
    assert!(job.started.is_some() && job.finished.is_some());
    assert!(job.created <= Timestamp::now());
    cluster.shutdown().await;
}
