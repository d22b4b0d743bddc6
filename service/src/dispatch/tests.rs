use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use domain::error::InvalidResources;
use domain::model::vo::{BackendKind, ResourceSpec, SubmissionArtifact};
use domain::service::BackendStatus::{Queued, Running};
use infrastructure::retry::Backoff;
use mockall::mock;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use super::*;
use crate::template::TemplateBindings;

/// Backend double answering status polls from a per-job script. The last answer repeats.
#[derive(Default)]
struct ScriptedAdapter {
    next_id: AtomicU32,
    scripts: Mutex<HashMap<String, VecDeque<BackendStatus>>>,
    /// Everything the backend accepted, with the tag it was submitted under
    jobs: Mutex<Vec<(BackendHandle, String)>>,
    rejected: Mutex<Vec<String>>,
    status_down: AtomicBool,
    refuse_cancel: AtomicBool,
    cancelled: Mutex<Vec<BackendHandle>>,
    submit_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl ScriptedAdapter {
    fn script(&self, id: &str, statuses: impl IntoIterator<Item = BackendStatus>) {
        let tag = JobId::from(id).correlation_tag();
        self.scripts.lock().unwrap().insert(tag, statuses.into_iter().collect());
    }

    fn reject(&self, id: &str) {
        self.rejected.lock().unwrap().push(JobId::from(id).correlation_tag());
    }

    fn submissions(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    fn handles(&self) -> Vec<BackendHandle> {
        self.jobs.lock().unwrap().iter().map(|(handle, _)| handle.clone()).collect()
    }
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn submit(
        &self,
        artifact: &SubmissionArtifact,
        _resources: &ResourceSpec,
    ) -> Result<BackendHandle, AdapterError> {
        let gate = self.submit_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.rejected.lock().unwrap().contains(&artifact.tag) {
            return Err(AdapterError::Rejected("over quota".to_owned()));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = BackendHandle::new(BackendKind::Local, n.to_string());
        self.jobs.lock().unwrap().push((handle.clone(), artifact.tag.clone()));
        Ok(handle)
    }

    async fn status(&self, handle: &BackendHandle) -> Result<BackendStatus, AdapterError> {
        if self.status_down.load(Ordering::SeqCst) {
            return Err(AdapterError::Transient("connection refused".to_owned()));
        }
        let tag = self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .find(|(h, _)| h == handle)
            .map(|(_, tag)| tag.clone());
        let Some(tag) = tag else {
            return Ok(BackendStatus::NotFound);
        };
        let mut scripts = self.scripts.lock().unwrap();
        let status = scripts.get_mut(&tag).and_then(|queue| {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        });
        Ok(status.unwrap_or(BackendStatus::Completed { exit_code: Some(0) }))
    }

    async fn cancel(&self, handle: &BackendHandle) -> Result<bool, AdapterError> {
        if self.refuse_cancel.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.cancelled.lock().unwrap().push(handle.clone());
        Ok(true)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<BackendHandle>, AdapterError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, tag)| filter.tag.as_deref().map_or(true, |t| t == tag))
            .map(|(handle, _)| handle.clone())
            .collect())
    }
}

mock! {
    Adapter {}

    #[async_trait]
    impl BackendAdapter for Adapter {
        fn kind(&self) -> BackendKind;
        async fn submit(
            &self,
            artifact: &SubmissionArtifact,
            resources: &ResourceSpec,
        ) -> Result<BackendHandle, AdapterError>;
        async fn status(&self, handle: &BackendHandle) -> Result<BackendStatus, AdapterError>;
        async fn status_many(
            &self,
            handles: &[BackendHandle],
        ) -> Vec<Result<BackendStatus, AdapterError>>;
        async fn cancel(&self, handle: &BackendHandle) -> Result<bool, AdapterError>;
        async fn list(&self, filter: &ListFilter) -> Result<Vec<BackendHandle>, AdapterError>;
    }
}

fn policy(not_found: NotFoundPolicy) -> BackendPolicy {
    BackendPolicy {
        poll_interval: Duration::from_millis(10),
        call_timeout: Duration::from_secs(1),
        retry: Backoff::new(2, Duration::from_millis(1), Duration::from_millis(2)),
        failure_budget: 3,
        not_found,
        check_workdir: true,
    }
}

fn template() -> ScriptTemplate {
    ScriptTemplate::builtin("local", BackendKind::Local, TemplateBindings::default()).unwrap()
}

struct Fixture {
    manager: Arc<DispatchManager>,
    adapter: Arc<ScriptedAdapter>,
    workdir: TempDir,
}

impl Fixture {
    fn new(not_found: NotFoundPolicy) -> Self {
        let adapter = Arc::new(ScriptedAdapter::default());
        let mut manager = DispatchManager::new("local");
        manager.register_backend("local", adapter.clone(), policy(not_found), template()).unwrap();
        Self {
            manager: Arc::new(manager),
            adapter,
            workdir: tempfile::tempdir().unwrap(),
        }
    }

    fn job(&self, id: &str, dependencies: &[&str]) -> JobDescriptor {
        job_in(&self.workdir, id, dependencies)
    }

    fn state(&self, id: &str) -> JobState {
        self.manager.get_state(&id.into()).unwrap()
    }

    fn record(&self, id: &str) -> JobRecord {
        self.manager.get(&id.into()).unwrap()
    }

    async fn poll(&self, times: usize) {
        for _ in 0..times {
            self.manager.poll_once().await;
        }
    }

    fn events(&self) -> Vec<DispatchEvent> {
        self.manager.events().drain().collect()
    }
}

fn job_in(workdir: &TempDir, id: &str, dependencies: &[&str]) -> JobDescriptor {
    JobDescriptor::builder()
        .id(id)
        .commands(vec!["echo hi".to_owned()])
        .resources(ResourceSpec::builder().workdir(workdir.path()).build())
        .dependencies(dependencies.iter().map(|dep| JobId::from(*dep)).collect())
        .build()
}

fn mocked(adapter: MockAdapter) -> (DispatchManager, TempDir) {
    let mut manager = DispatchManager::new("slurm");
    manager
        .register_backend("slurm", Arc::new(adapter), policy(NotFoundPolicy::Hold), template())
        .unwrap();
    (manager, tempfile::tempdir().unwrap())
}

#[tokio::test]
async fn submitted_job_reaches_a_terminal_state() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.adapter.script("a", [Queued, Running, Running, BackendStatus::Completed { exit_code: Some(0) }]);

    f.manager.submit(f.job("a", &[])).await.unwrap();
    assert_eq!(f.state("a"), JobState::Submitted);

    f.poll(1).await;
    assert_eq!(f.state("a"), JobState::Queued);
    f.poll(3).await;

    let record = f.record("a");
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.result.exit_code, Some(0));
    assert!(record.result.duration().is_some());
    assert_eq!(f.manager.in_progress(), 0);
}

#[tokio::test]
async fn unmet_dependencies_stay_pending() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.adapter.script("a", [Running]);

    f.manager.submit(f.job("a", &[])).await.unwrap();
    f.manager.submit(f.job("b", &["a"])).await.unwrap();
    for _ in 0..5 {
        f.poll(1).await;
        let b = f.record("b");
        assert_eq!(b.state, JobState::Pending);
        assert_eq!(b.handle, None);
    }
    assert_eq!(f.adapter.submissions(), 1);
    assert_eq!(f.manager.list_by_state(JobState::Pending), vec![JobId::from("b")]);
}

#[tokio::test]
async fn completed_dependency_releases_dependents() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.adapter.script("a", [Running, BackendStatus::Completed { exit_code: Some(0) }]);

    f.manager.submit(f.job("a", &[])).await.unwrap();
    f.manager.submit(f.job("b", &["a"])).await.unwrap();
    f.poll(1).await;
    assert_eq!(f.state("b"), JobState::Pending);

    f.poll(1).await;
    assert_eq!(f.state("a"), JobState::Completed);
    assert_eq!(f.state("b"), JobState::Submitted);
    assert_eq!(f.adapter.submissions(), 2);
}

#[tokio::test]
async fn failed_dependency_cancels_transitive_dependents() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.adapter.script(
        "a",
        [
            Running,
            BackendStatus::Failed { exit_code: Some(2), reason: "segfault".to_owned() },
        ],
    );

    f.manager.submit(f.job("a", &[])).await.unwrap();
    f.manager.submit(f.job("b", &["a"])).await.unwrap();
    f.manager.submit(f.job("c", &["b"])).await.unwrap();
    f.poll(2).await;

    let a = f.record("a");
    assert_eq!(a.state, JobState::Failed);
    assert_eq!(
        a.result.failure,
        Some(JobFailure::Backend { exit_code: Some(2), reason: "segfault".to_owned() })
    );
    for (id, dependency) in [("b", "a"), ("c", "b")] {
        let record = f.record(id);
        assert_eq!(record.state, JobState::Cancelled);
        assert_eq!(record.handle, None);
        assert_eq!(
            record.result.failure,
            Some(JobFailure::Dependency { dependency: dependency.into() })
        );
    }
    assert_eq!(f.adapter.submissions(), 1);

    let cancelled: Vec<_> = f
        .events()
        .into_iter()
        .filter(|event| matches!(event, DispatchEvent::DependencyCancelled { .. }))
        .collect();
    assert_eq!(
        cancelled,
        vec![
            DispatchEvent::DependencyCancelled { job: "b".into(), dependency: "a".into() },
            DispatchEvent::DependencyCancelled { job: "c".into(), dependency: "b".into() },
        ]
    );

    f.poll(2).await;
    assert_eq!(f.state("a"), JobState::Failed);
}

#[tokio::test]
async fn job_depending_on_a_failed_job_is_cancelled_at_submit() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.adapter.reject("a");

    let err = f.manager.submit(f.job("a", &[])).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Submission { source: SubmissionError::Rejected(_), .. }
    ));
    let a = f.record("a");
    assert_eq!(a.state, JobState::Failed);
    assert_eq!(a.handle, None);
    assert!(matches!(a.result.failure, Some(JobFailure::Submission { .. })));

    f.manager.submit(f.job("b", &["a"])).await.unwrap();
    assert_eq!(f.state("b"), JobState::Cancelled);
    assert_eq!(f.adapter.submissions(), 0);
}

#[tokio::test]
async fn missing_workdir_fails_the_job() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    let job = JobDescriptor::builder()
        .id("a")
        .commands(vec!["true".to_owned()])
        .resources(ResourceSpec::builder().workdir(f.workdir.path().join("gone")).build())
        .build();

    let err = f.manager.submit(job).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Submission {
            source: SubmissionError::InvalidResources(InvalidResources::MissingWorkdir(_)),
            ..
        }
    ));
    assert_eq!(f.state("a"), JobState::Failed);
}

#[tokio::test]
async fn descriptors_are_validated() {
    let f = Fixture::new(NotFoundPolicy::Hold);

    let err = f.manager.submit(f.job("b", &["a"])).await.unwrap_err();
    assert_eq!(
        err,
        DispatchError::UnknownDependency { job: "b".into(), dependency: "a".into() }
    );

    let err = f.manager.submit(f.job("z", &["z"])).await.unwrap_err();
    assert_eq!(err, DispatchError::DependencyCycle("z".into()));

    let mut job = f.job("c", &[]);
    job.backend_hint = Some("gpu".to_owned());
    let err = f.manager.submit(job).await.unwrap_err();
    assert_eq!(err, DispatchError::UnknownBackend("gpu".to_owned()));

    let mut job = f.job("d", &[]);
    job.commands.clear();
    assert!(matches!(
        f.manager.submit(job).await,
        Err(DispatchError::InvalidDescriptor { .. })
    ));
    assert!(f.manager.registry().is_empty());
}

#[tokio::test]
async fn resubmission_may_not_close_a_cycle() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.adapter.script("x", [Running]);
    f.manager.submit(f.job("x", &[])).await.unwrap();
    f.manager.submit(f.job("a", &["x"])).await.unwrap();
    f.manager.submit(f.job("b", &["a"])).await.unwrap();

    let err = f.manager.submit(f.job("a", &["x", "b"])).await.unwrap_err();
    assert_eq!(err, DispatchError::DependencyCycle("a".into()));
}

#[tokio::test]
async fn cancel_on_terminal_job_is_a_no_op() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.adapter.script("a", [BackendStatus::Completed { exit_code: Some(0) }]);
    f.manager.submit(f.job("a", &[])).await.unwrap();
    f.poll(1).await;

    assert_eq!(f.manager.cancel(&"a".into()).await, Ok(false));
    assert_eq!(f.state("a"), JobState::Completed);
    assert!(f.adapter.cancelled.lock().unwrap().is_empty());
}

#[tokio::test]
async fn acknowledged_cancel() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.adapter.script("a", [Running]);
    f.manager.submit(f.job("a", &[])).await.unwrap();
    f.poll(1).await;

    assert_eq!(f.manager.cancel(&"a".into()).await, Ok(true));
    assert_eq!(f.state("a"), JobState::Cancelled);
    assert_eq!(f.adapter.cancelled.lock().unwrap().len(), 1);

    f.poll(1).await;
    assert_eq!(f.state("a"), JobState::Cancelled);
}

#[tokio::test]
async fn refused_cancel_leaves_state_alone() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.adapter.script("a", [Running]);
    f.adapter.refuse_cancel.store(true, Ordering::SeqCst);
    f.manager.submit(f.job("a", &[])).await.unwrap();
    f.poll(1).await;

    assert_eq!(f.manager.cancel(&"a".into()).await, Ok(false));
    assert_eq!(f.state("a"), JobState::Running);
    assert!(f
        .events()
        .iter()
        .any(|event| matches!(event, DispatchEvent::CancelRejected { job, .. } if job.as_str() == "a")));
}

#[tokio::test]
async fn cancelling_a_pending_job_cancels_its_dependents() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.adapter.script("a", [Running]);
    f.manager.submit(f.job("a", &[])).await.unwrap();
    f.manager.submit(f.job("b", &["a"])).await.unwrap();
    f.manager.submit(f.job("c", &["b"])).await.unwrap();

    assert_eq!(f.manager.cancel(&"b".into()).await, Ok(true));
    assert_eq!(f.state("b"), JobState::Cancelled);
    assert_eq!(f.state("c"), JobState::Cancelled);
    assert_eq!(f.state("a"), JobState::Submitted);
    assert_eq!(f.manager.cancel(&"nope".into()).await, Err(DispatchError::UnknownJob("nope".into())));
}

#[tokio::test]
async fn cancel_all_stops_everything() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.adapter.script("a", [Running]);
    f.manager.submit(f.job("a", &[])).await.unwrap();
    f.manager.submit(f.job("b", &["a"])).await.unwrap();
    assert_eq!(f.manager.in_progress(), 2);

    // b goes down with a before its own turn comes.
    assert_eq!(f.manager.cancel_all().await, 1);
    assert_eq!(f.manager.in_progress(), 0);
    assert_eq!(f.state("b"), JobState::Cancelled);
}

#[tokio::test]
async fn withdrawn_submission_is_cancelled_at_the_backend() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    let gate = Arc::new(Semaphore::new(0));
    *f.adapter.submit_gate.lock().unwrap() = Some(gate.clone());

    let submit = {
        let manager = f.manager.clone();
        let job = f.job("a", &[]);
        tokio::spawn(async move { manager.submit(job).await })
    };
    while !f.manager.get(&"a".into()).is_some_and(|record| record.claimed) {
        tokio::task::yield_now().await;
    }

    assert_eq!(f.manager.cancel(&"a".into()).await, Ok(true));
    gate.add_permits(1);
    submit.await.unwrap().unwrap();

    let record = f.record("a");
    assert_eq!(record.state, JobState::Cancelled);
    assert_eq!(record.handle, None);
    assert_eq!(*f.adapter.cancelled.lock().unwrap(), f.adapter.handles());
}

#[tokio::test]
async fn failed_submission_of_a_withdrawn_job_is_not_reported() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    let gate = Arc::new(Semaphore::new(0));
    *f.adapter.submit_gate.lock().unwrap() = Some(gate.clone());
    f.adapter.reject("a");

    let submit = {
        let manager = f.manager.clone();
        let job = f.job("a", &[]);
        tokio::spawn(async move { manager.submit(job).await })
    };
    while !f.manager.get(&"a".into()).is_some_and(|record| record.claimed) {
        tokio::task::yield_now().await;
    }

    assert_eq!(f.manager.cancel(&"a".into()).await, Ok(true));
    gate.add_permits(1);
    assert!(submit.await.unwrap().is_err());

    assert_eq!(f.state("a"), JobState::Cancelled);
    assert!(!f
        .events()
        .iter()
        .any(|event| matches!(event, DispatchEvent::SubmissionFailed { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_submits_store_one_handle() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let manager = f.manager.clone();
            let job = f.job("a", &[]);
            tokio::spawn(async move { manager.submit(job).await })
        })
        .collect();

    for task in tasks {
        match task.await.unwrap() {
            Ok(_) | Err(DispatchError::AlreadySubmitted(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(f.adapter.submissions(), 1);
    let record = f.record("a");
    assert_eq!(record.state, JobState::Submitted);
    assert_eq!(record.handle, f.adapter.handles().first().cloned());
}

#[tokio::test]
async fn unresolved_not_found_holds_the_job() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.adapter.script("a", [Running, BackendStatus::NotFound]);
    f.manager.submit(f.job("a", &[])).await.unwrap();
    f.poll(1).await;
    f.poll(5).await;

    let record = f.record("a");
    assert_eq!(record.state, JobState::Running);
    assert_eq!(record.reconciliation.not_found_polls, 5);
    assert!(record.reconciliation.ambiguous);

    let ambiguities: Vec<_> = f
        .events()
        .into_iter()
        .filter(|event| matches!(event, DispatchEvent::ReconciliationAmbiguity { .. }))
        .collect();
    assert_eq!(ambiguities.len(), 1);
    assert!(matches!(
        &ambiguities[0],
        DispatchEvent::ReconciliationAmbiguity { polls: 1, job, .. } if job.as_str() == "a"
    ));
}

#[tokio::test]
async fn not_found_becomes_lost_after_threshold() {
    let f = Fixture::new(NotFoundPolicy::Lost { after: 3 });
    f.adapter.script("a", [Running, BackendStatus::NotFound]);
    f.manager.submit(f.job("a", &[])).await.unwrap();
    f.manager.submit(f.job("b", &["a"])).await.unwrap();

    f.poll(3).await;
    assert_eq!(f.state("a"), JobState::Running);
    f.poll(1).await;

    let a = f.record("a");
    assert_eq!(a.state, JobState::Lost);
    assert!(matches!(a.result.failure, Some(JobFailure::Lost { .. })));
    assert_eq!(f.state("b"), JobState::Cancelled);
}

#[tokio::test]
async fn not_found_after_grace_counts_as_completed() {
    let f = Fixture::new(NotFoundPolicy::Completed { grace: Duration::ZERO });
    f.adapter.script("a", [BackendStatus::NotFound]);
    f.manager.submit(f.job("a", &[])).await.unwrap();
    f.manager.submit(f.job("b", &["a"])).await.unwrap();
    f.poll(1).await;

    let a = f.record("a");
    assert_eq!(a.state, JobState::Completed);
    assert_eq!(a.result.exit_code, None);
    assert_eq!(f.state("b"), JobState::Submitted);
}

#[tokio::test]
async fn status_failures_exhaust_the_budget() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.adapter.script("a", [Running]);
    f.manager.submit(f.job("a", &[])).await.unwrap();
    f.poll(1).await;

    f.adapter.status_down.store(true, Ordering::SeqCst);
    f.poll(2).await;
    let a = f.record("a");
    assert_eq!(a.state, JobState::Running);
    assert_eq!(a.reconciliation.transient_failures, 2);

    f.adapter.status_down.store(false, Ordering::SeqCst);
    f.poll(1).await;
    assert_eq!(f.record("a").reconciliation.transient_failures, 0);

    f.adapter.status_down.store(true, Ordering::SeqCst);
    f.poll(3).await;
    assert_eq!(f.state("a"), JobState::Lost);
}

#[tokio::test(start_paused = true)]
async fn await_terminal_returns_current_state_on_timeout() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.adapter.script("a", [Running]);
    f.manager.submit(f.job("a", &[])).await.unwrap();
    f.poll(1).await;

    let state = f.manager.await_terminal(&"a".into(), Duration::from_millis(1)).await;
    assert_eq!(state, Ok(JobState::Running));
}

#[tokio::test]
async fn await_terminal_wakes_on_completion() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.adapter.script("a", [Running, BackendStatus::Completed { exit_code: Some(0) }]);
    f.manager.submit(f.job("a", &[])).await.unwrap();

    let waiter = {
        let manager = f.manager.clone();
        tokio::spawn(async move { manager.await_terminal(&"a".into(), Duration::from_secs(30)).await })
    };
    f.poll(2).await;
    assert_eq!(waiter.await.unwrap(), Ok(JobState::Completed));
}

#[tokio::test(start_paused = true)]
async fn pollers_drive_jobs_until_shutdown() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.adapter.script("a", [Queued, Running, BackendStatus::Completed { exit_code: Some(0) }]);
    f.manager.submit(f.job("a", &[])).await.unwrap();

    let shutdown = CancellationToken::new();
    let pollers = f.manager.spawn_pollers(shutdown.clone());
    let state = f.manager.await_terminal(&"a".into(), Duration::from_secs(60)).await;
    assert_eq!(state, Ok(JobState::Completed));

    shutdown.cancel();
    for poller in pollers {
        poller.await.unwrap();
    }
}

#[tokio::test]
async fn resume_continues_restored_jobs() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    let record = |id: &str, deps: &[&str], state: JobState| {
        let mut record = JobRecord::new(Arc::new(f.job(id, deps)), "local");
        record.state = state;
        record
    };

    let mut a = record("a", &[], JobState::Completed);
    a.handle = Some(BackendHandle::new(BackendKind::Local, "a-1"));
    let b = record("b", &["a"], JobState::Pending);
    // c was sent before the restart but the answer never arrived.
    let mut c = record("c", &[], JobState::Pending);
    c.submit_attempts = 1;
    let earlier = BackendHandle::new(BackendKind::Local, "c-1");
    f.adapter.jobs.lock().unwrap().push((earlier.clone(), JobId::from("c").correlation_tag()));
    let d = record("d", &[], JobState::Failed);
    let e = record("e", &["d"], JobState::Pending);

    f.manager.registry().restore([a, b, c, d, e]);
    f.manager.resume().await;

    assert_eq!(f.state("b"), JobState::Submitted);
    let c = f.record("c");
    assert_eq!(c.state, JobState::Submitted);
    assert_eq!(c.handle, Some(earlier));
    assert_eq!(f.state("e"), JobState::Cancelled);
    assert_eq!(f.adapter.submissions(), 2);
}

#[tokio::test]
async fn lookup_does_not_adopt_a_similarly_named_job() {
    let f = Fixture::new(NotFoundPolicy::Hold);
    f.manager.submit(f.job("a.b", &[])).await.unwrap();

    let mut restored = JobRecord::new(Arc::new(f.job("a_b", &[])), "local");
    restored.submit_attempts = 1;
    f.manager.registry().restore([restored]);
    f.manager.resume().await;

    let (dotted, underscored) = (f.record("a.b"), f.record("a_b"));
    assert_eq!(underscored.state, JobState::Submitted);
    assert_ne!(dotted.handle, underscored.handle);
    assert_eq!(f.adapter.submissions(), 2);
}

#[tokio::test]
async fn unconfirmed_submission_is_found_by_tag() {
    let mut adapter = MockAdapter::new();
    adapter
        .expect_submit()
        .times(1)
        .returning(|_, _| Err(AdapterError::Transient("timed out".to_owned())));
    adapter
        .expect_list()
        .withf(|filter| filter.tag == Some(JobId::from("a").correlation_tag()))
        .times(1)
        .returning(|_| Ok(vec![BackendHandle::new(BackendKind::Slurm, "42")]));
    let (manager, workdir) = mocked(adapter);

    manager.submit(job_in(&workdir, "a", &[])).await.unwrap();

    let record = manager.get(&"a".into()).unwrap();
    assert_eq!(record.state, JobState::Submitted);
    assert_eq!(record.handle, Some(BackendHandle::new(BackendKind::Slurm, "42")));
    assert_eq!(record.submit_attempts, 1);
}

#[tokio::test]
async fn transient_submit_failures_exhaust_retries() {
    let mut adapter = MockAdapter::new();
    adapter
        .expect_submit()
        .times(3)
        .returning(|_, _| Err(AdapterError::Transient("connection refused".to_owned())));
    adapter.expect_list().times(3).returning(|_| Ok(vec![]));
    let (manager, workdir) = mocked(adapter);

    let err = manager.submit(job_in(&workdir, "a", &[])).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Submission {
            source: SubmissionError::RetriesExhausted { attempts: 3, .. },
            ..
        }
    ));
    let record = manager.get(&"a".into()).unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.handle, None);
    assert_eq!(record.submit_attempts, 3);
}

#[tokio::test]
async fn rejected_submission_is_not_retried() {
    let mut adapter = MockAdapter::new();
    adapter
        .expect_submit()
        .times(1)
        .returning(|_, _| Err(AdapterError::Rejected("invalid partition".to_owned())));
    let (manager, workdir) = mocked(adapter);

    let err = manager.submit(job_in(&workdir, "a", &[])).await.unwrap_err();
    assert_eq!(
        err,
        DispatchError::Submission {
            job: "a".into(),
            source: SubmissionError::Rejected("invalid partition".to_owned()),
        }
    );
}

#[test]
fn backends_are_registered_once() {
    let mut manager = DispatchManager::new("local");
    let adapter = Arc::new(ScriptedAdapter::default());
    let policy = policy(NotFoundPolicy::Hold);
    manager.register_backend("local", adapter.clone(), policy, template()).unwrap();
    assert_eq!(
        manager.register_backend("local", adapter, policy, template()),
        Err(DispatchError::DuplicateBackend("local".to_owned()))
    );
}

/// Backend that accepts every call and never answers.
struct SilentAdapter;

#[async_trait]
impl BackendAdapter for SilentAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn submit(
        &self,
        _artifact: &SubmissionArtifact,
        _resources: &ResourceSpec,
    ) -> Result<BackendHandle, AdapterError> {
        std::future::pending().await
    }

    async fn status(&self, _handle: &BackendHandle) -> Result<BackendStatus, AdapterError> {
        std::future::pending().await
    }

    async fn cancel(&self, _handle: &BackendHandle) -> Result<bool, AdapterError> {
        std::future::pending().await
    }

    async fn list(&self, _filter: &ListFilter) -> Result<Vec<BackendHandle>, AdapterError> {
        std::future::pending().await
    }
}

fn silent() -> (DispatchManager, TempDir) {
    let mut manager = DispatchManager::new("local");
    manager
        .register_backend("local", Arc::new(SilentAdapter), policy(NotFoundPolicy::Hold), template())
        .unwrap();
    (manager, tempfile::tempdir().unwrap())
}

#[tokio::test(start_paused = true)]
async fn unanswered_submission_exhausts_retries() {
    let (manager, workdir) = silent();

    let err = manager.submit(job_in(&workdir, "a", &[])).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Submission {
            source: SubmissionError::RetriesExhausted { attempts: 3, .. },
            ..
        }
    ));
    let record = manager.get(&"a".into()).unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.submit_attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn unanswered_status_polls_count_against_the_budget() {
    let (manager, workdir) = silent();
    let mut record = JobRecord::new(Arc::new(job_in(&workdir, "a", &[])), "local");
    record.state = JobState::Submitted;
    record.handle = Some(BackendHandle::new(BackendKind::Local, "1"));
    manager.registry().restore([record]);

    let started = tokio::time::Instant::now();
    manager.poll_once().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    let record = manager.get(&"a".into()).unwrap();
    assert_eq!(record.state, JobState::Submitted);
    assert_eq!(record.reconciliation.transient_failures, 1);

    manager.poll_once().await;
    manager.poll_once().await;
    let record = manager.get(&"a".into()).unwrap();
    assert_eq!(record.state, JobState::Lost);
    assert!(matches!(record.result.failure, Some(JobFailure::Lost { .. })));
}
