//! Submission sequencing, status polling and dependency propagation.

#[cfg(test)]
mod tests;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use domain::error::{AdapterError, DispatchError, SubmissionError};
use domain::model::entity::{JobFailure, JobRecord, JobState};
use domain::model::vo::{BackendHandle, JobDescriptor, JobId};
use domain::service::{BackendAdapter, BackendStatus, ListFilter};
use infrastructure::sync::timer;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{BackendPolicy, NotFoundPolicy};
use crate::event::DispatchEvent;
use crate::registry::JobRegistry;
use crate::template::{ScriptTemplate, TemplateEngine};

struct Backend {
    adapter: Arc<dyn BackendAdapter>,
    template_id: String,
    policy: BackendPolicy,
}

enum Readiness {
    Ready,
    Waiting,
    Blocked(JobId),
}

/// The only writer of the job registry.
///
/// Backends are registered up front; after that the manager is shared behind an `Arc` and
/// every operation takes `&self`.
pub struct DispatchManager {
    registry: JobRegistry,
    templates: TemplateEngine,
    backends: HashMap<String, Backend>,
    default_backend: String,
    events: flume::Receiver<DispatchEvent>,
}

impl DispatchManager {
    pub fn new(default_backend: impl Into<String>) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            registry: JobRegistry::new(tx),
            templates: TemplateEngine::new(),
            backends: HashMap::new(),
            default_backend: default_backend.into(),
            events: rx,
        }
    }

    pub fn register_backend(
        &mut self,
        name: impl Into<String>,
        adapter: Arc<dyn BackendAdapter>,
        policy: BackendPolicy,
        template: ScriptTemplate,
    ) -> Result<(), DispatchError> {
        let name = name.into();
        if self.backends.contains_key(&name) {
            return Err(DispatchError::DuplicateBackend(name));
        }
        let template_id = template.id().to_owned();
        self.templates.register(template);
        self.backends.insert(name, Backend { adapter, template_id, policy });
        Ok(())
    }

    #[inline]
    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Stream of lifecycle notifications. Every receiver competes for the same events.
    pub fn events(&self) -> flume::Receiver<DispatchEvent> {
        self.events.clone()
    }

    pub fn get_state(&self, id: &JobId) -> Option<JobState> {
        self.registry.state(id)
    }

    pub fn get(&self, id: &JobId) -> Option<JobRecord> {
        self.registry.get(id)
    }

    pub fn list_by_state(&self, state: JobState) -> Vec<JobId> {
        self.registry.list_by_state(state)
    }

    /// Number of jobs that have not reached a terminal state.
    pub fn in_progress(&self) -> usize {
        self.registry.count(|record| !record.state.is_terminal())
    }

    /// Registers the job and submits it right away when nothing blocks it.
    ///
    /// A failure to submit leaves the job registered as `Failed` and is returned as
    /// [`DispatchError::Submission`].
    pub async fn submit(&self, descriptor: JobDescriptor) -> Result<JobId, DispatchError> {
        let id = descriptor.id.clone();
        if descriptor.commands.is_empty() {
            return Err(DispatchError::InvalidDescriptor {
                job: id,
                reason: "no commands to run".to_owned(),
            });
        }
        if let Err(e) = descriptor.resources.validate() {
            return Err(DispatchError::InvalidDescriptor { job: id, reason: e.to_string() });
        }

        if descriptor.dependencies.contains(&id) {
            return Err(DispatchError::DependencyCycle(id));
        }
        let backend = descriptor.backend_hint.clone().unwrap_or_else(|| self.default_backend.clone());
        if !self.backends.contains_key(&backend) {
            return Err(DispatchError::UnknownBackend(backend));
        }
        if let Some(dependency) =
            descriptor.dependencies.iter().find(|dep| self.registry.state(dep).is_none())
        {
            return Err(DispatchError::UnknownDependency {
                job: id,
                dependency: dependency.clone(),
            });
        }
        if self.creates_cycle(&id, &descriptor.dependencies) {
            return Err(DispatchError::DependencyCycle(id));
        }

        let descriptor = Arc::new(descriptor);
        let generation = self.registry.insert(JobRecord::new(descriptor.clone(), backend))?;
        tracing::info!(job_id = %id, "Job registered");

        match self.readiness(&descriptor) {
            Readiness::Ready => self
                .try_submit(&id, generation)
                .await
                .map_err(|source| DispatchError::Submission { job: id.clone(), source })?,
            Readiness::Waiting => {}
            Readiness::Blocked(dependency) => {
                if self.cancel_for_dependency(&id, &dependency) {
                    self.cancel_dependents(&id);
                }
            }
        }
        Ok(id)
    }

    /// Polls every backend once.
    pub async fn poll_once(&self) {
        let mut names: Vec<_> = self.backends.keys().cloned().collect();
        names.sort();
        for name in names {
            self.poll_backend(&name).await;
        }
    }

    /// One status round for the jobs a backend holds, batched through `status_many`.
    pub async fn poll_backend(&self, name: &str) {
        let Some(backend) = self.backends.get(name) else {
            return;
        };
        let jobs = self.registry.collect(|record| match &record.handle {
            Some(handle) if record.backend == name && record.state.is_active() => {
                Some((record.id().clone(), handle.clone()))
            }
            _ => None,
        });
        if jobs.is_empty() {
            return;
        }
        tracing::debug!(backend = name, jobs = jobs.len(), "Refreshing state of jobs");

        let handles: Vec<_> = jobs.iter().map(|(_, handle)| handle.clone()).collect();
        let statuses = match with_timeout(
            backend.policy.call_timeout,
            async { Ok(backend.adapter.status_many(&handles).await) },
        )
        .await
        {
            Ok(statuses) if statuses.len() == handles.len() => statuses,
            Ok(statuses) => {
                let reason = format!("{} answers for {} jobs", statuses.len(), handles.len());
                vec![Err(AdapterError::Transient(reason)); handles.len()]
            }
            Err(e) => vec![Err(e); handles.len()],
        };

        for ((id, handle), status) in jobs.into_iter().zip(statuses) {
            self.apply_status(backend, &id, &handle, status).await;
        }
    }

    async fn apply_status(
        &self,
        backend: &Backend,
        id: &JobId,
        handle: &BackendHandle,
        status: Result<BackendStatus, AdapterError>,
    ) {
        match status {
            Ok(BackendStatus::Queued) => self.observe(id, JobState::Queued),
            Ok(BackendStatus::Running) => self.observe(id, JobState::Running),
            Ok(BackendStatus::Completed { exit_code }) => {
                if self.finish(id, JobState::Completed, exit_code, None) {
                    tracing::info!(job_id = %id, %handle, "Job completed");
                    self.release_dependents(id).await;
                }
            }
            Ok(BackendStatus::Failed { exit_code, reason }) => {
                let failure = JobFailure::Backend { exit_code, reason };
                if self.finish(id, JobState::Failed, exit_code, Some(failure)) {
                    tracing::info!(job_id = %id, %handle, "Job failed");
                    self.cancel_dependents(id);
                }
            }
            Ok(BackendStatus::NotFound) => self.not_found(backend, id, handle).await,
            Err(e) => {
                let failures = self.registry.update(id, |record| {
                    if !record.state.is_active() {
                        return None;
                    }
                    record.reconciliation.transient_failures += 1;
                    Some(record.reconciliation.transient_failures)
                });
                let Some(failures) = failures.flatten() else {
                    return;
                };
                tracing::debug!(job_id = %id, failures, "Status unavailable: {e}");
                if failures >= backend.policy.failure_budget {
                    let reason = format!("status unavailable after {failures} attempts: {e}");
                    if self.mark_lost(id, reason) {
                        self.cancel_dependents(id);
                    }
                }
            }
        }
    }

    fn observe(&self, id: &JobId, state: JobState) {
        self.registry.update(id, |record| {
            if record.state.is_active() {
                record.state = state;
                record.reconciliation.reset();
            }
        });
    }

    async fn not_found(&self, backend: &Backend, id: &JobId, handle: &BackendHandle) {
        let now = Utc::now();
        let counted = self.registry.update(id, |record| {
            if !record.state.is_active() {
                return None;
            }
            let reconciliation = &mut record.reconciliation;
            reconciliation.transient_failures = 0;
            reconciliation.not_found_polls += 1;
            let first = *reconciliation.first_not_found.get_or_insert(now);
            Some((reconciliation.not_found_polls, first))
        });
        let Some((polls, first)) = counted.flatten() else {
            return;
        };

        match backend.policy.not_found {
            NotFoundPolicy::Hold => {
                let newly = self.registry.update(id, |record| {
                    !std::mem::replace(&mut record.reconciliation.ambiguous, true)
                });
                if newly == Some(true) {
                    tracing::warn!(
                        job_id = %id,
                        %handle,
                        "Backend no longer knows the job, holding it until an operator decides"
                    );
                    self.registry.emit(DispatchEvent::ReconciliationAmbiguity {
                        job: id.clone(),
                        handle: handle.clone(),
                        polls,
                    });
                }
            }
            NotFoundPolicy::Lost { after } => {
                if polls >= after {
                    let reason = format!("not found by the backend for {polls} polls");
                    if self.mark_lost(id, reason) {
                        self.cancel_dependents(id);
                    }
                }
            }
            NotFoundPolicy::Completed { grace } => {
                if (now - first).to_std().unwrap_or_default() >= grace
                    && self.finish(id, JobState::Completed, None, None)
                {
                    tracing::info!(job_id = %id, %handle, "Job gone from the backend, assuming it completed");
                    self.release_dependents(id).await;
                }
            }
        }
    }

    /// Stops a job. `Ok(false)` means the job is already terminal or the backend did not
    /// acknowledge; in the latter case the stored state is left as it was.
    pub async fn cancel(&self, id: &JobId) -> Result<bool, DispatchError> {
        loop {
            let record =
                self.registry.get(id).ok_or_else(|| DispatchError::UnknownJob(id.clone()))?;
            if record.state.is_terminal() {
                return Ok(false);
            }
            if let Some(handle) = record.handle {
                return self.cancel_at_backend(id, &record.backend, handle).await;
            }

            // Not at a backend yet. A submission still in flight notices the cancellation
            // when it tries to commit and withdraws its handle.
            let cancelled = self.registry.update(id, |record| {
                if record.state != JobState::Pending {
                    return false;
                }
                record.state = JobState::Cancelled;
                record.result.finished_at = Some(Utc::now());
                true
            });
            if cancelled == Some(true) {
                tracing::info!(job_id = %id, "Pending job cancelled");
                self.cancel_dependents(id);
                return Ok(true);
            }
            // A submission committed in between; go through the backend.
        }
    }

    async fn cancel_at_backend(
        &self,
        id: &JobId,
        backend: &str,
        handle: BackendHandle,
    ) -> Result<bool, DispatchError> {
        let backend = self
            .backends
            .get(backend)
            .ok_or_else(|| DispatchError::UnknownBackend(backend.to_owned()))?;
        let policy = backend.policy;
        let ret = policy
            .retry
            .retry(
                || with_timeout(policy.call_timeout, backend.adapter.cancel(&handle)),
                AdapterError::is_transient,
            )
            .await;

        match ret {
            Ok(true) => {
                let cancelled = self.registry.update(id, |record| {
                    if record.state.is_terminal() {
                        return false;
                    }
                    record.state = JobState::Cancelled;
                    record.result.finished_at = Some(Utc::now());
                    true
                });
                if cancelled == Some(true) {
                    tracing::info!(job_id = %id, %handle, "Job cancelled");
                    self.cancel_dependents(id);
                    return Ok(true);
                }
                Ok(false)
            }
            Ok(false) | Err((AdapterError::Rejected(_), _)) => {
                tracing::warn!(job_id = %id, %handle, "Backend refused to cancel the job");
                self.registry.emit(DispatchEvent::CancelRejected { job: id.clone(), handle });
                Ok(false)
            }
            Err((e, attempts)) => {
                let reason = format!("cancel unconfirmed after {attempts} attempts: {e}");
                if self.mark_lost(id, reason) {
                    self.cancel_dependents(id);
                }
                Ok(false)
            }
        }
    }

    /// Cancels every job that is not terminal yet. Returns how many were cancelled.
    pub async fn cancel_all(&self) -> usize {
        let ids = self.registry.ids_where(|record| !record.state.is_terminal());
        let mut cancelled = 0;
        for id in ids {
            match self.cancel(&id).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(job_id = %id, "Cancel failed: {e}"),
            }
        }
        cancelled
    }

    /// Waits until the job is terminal or `timeout` elapses, then returns its state. A
    /// timeout is not an error: the current, possibly non-terminal, state is returned.
    pub async fn await_terminal(
        &self,
        id: &JobId,
        timeout: Duration,
    ) -> Result<JobState, DispatchError> {
        let mut rx =
            self.registry.subscribe(id).ok_or_else(|| DispatchError::UnknownJob(id.clone()))?;
        let _ = tokio::time::timeout(timeout, rx.wait_for(|state| state.is_terminal())).await;
        let state = self.registry.state(id).unwrap_or(*rx.borrow());
        Ok(state)
    }

    /// Continues after records were restored from a checkpoint: failed dependencies are
    /// propagated and jobs whose dependencies are met get submitted.
    pub async fn resume(&self) {
        for id in self.registry.ids_where(|record| record.state.is_unsuccessful()) {
            self.cancel_dependents(&id);
        }

        let pending = self.registry.collect(|record| {
            (record.state == JobState::Pending)
                .then(|| (record.descriptor.clone(), record.generation))
        });
        tracing::info!(pending = pending.len(), "Resuming pending jobs");
        for (descriptor, generation) in pending {
            if !matches!(self.readiness(&descriptor), Readiness::Ready) {
                continue;
            }
            if let Err(e) = self.try_submit(&descriptor.id, generation).await {
                tracing::error!(job_id = %descriptor.id, "Submission failed: {e}");
            }
        }
    }

    /// Starts one polling task per backend, each at its own interval, until `shutdown` is
    /// cancelled.
    pub fn spawn_pollers(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.backends
            .iter()
            .map(|(name, backend)| {
                let this = self.clone();
                let name = name.clone();
                let span = tracing::info_span!("poll_backend", backend = %name);
                let interval = backend.policy.poll_interval;
                let shutdown = shutdown.clone();
                tokio::spawn(
                    async move {
                        timer::until_cancelled(interval, shutdown, || {
                            let this = this.clone();
                            let name = name.clone();
                            async move { this.poll_backend(&name).await }
                        })
                        .await
                    }
                    .instrument(span),
                )
            })
            .collect()
    }

    fn readiness(&self, descriptor: &JobDescriptor) -> Readiness {
        let mut ready = true;
        for dependency in &descriptor.dependencies {
            match self.registry.state(dependency) {
                Some(JobState::Completed) => {}
                Some(state) if state.is_unsuccessful() => {
                    return Readiness::Blocked(dependency.clone())
                }
                _ => ready = false,
            }
        }
        if ready {
            Readiness::Ready
        } else {
            Readiness::Waiting
        }
    }

    fn creates_cycle(&self, id: &JobId, dependencies: &BTreeSet<JobId>) -> bool {
        let mut stack: Vec<_> = dependencies.iter().cloned().collect();
        let mut seen = HashSet::new();
        while let Some(next) = stack.pop() {
            if &next == id {
                return true;
            }
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(record) = self.registry.get(&next) {
                stack.extend(record.descriptor.dependencies.iter().cloned());
            }
        }
        false
    }

    /// Claims the record, renders it and hands it to its backend. Returns `Ok` without doing
    /// anything when the record was replaced, claimed by someone else or is no longer pending.
    async fn try_submit(&self, id: &JobId, generation: u64) -> Result<(), SubmissionError> {
        let claimed = self.registry.update(id, |record| {
            if record.state != JobState::Pending || record.claimed || record.generation != generation
            {
                return None;
            }
            record.claimed = true;
            Some((record.descriptor.clone(), record.backend.clone(), record.submit_attempts))
        });
        let Some((descriptor, backend_name, attempts)) = claimed.flatten() else {
            return Ok(());
        };

        let submitted = match self.backends.get(&backend_name) {
            Some(backend) => self.submit_to_backend(backend, &descriptor, attempts).await,
            None => Err(SubmissionError::Rejected(format!("no backend named `{backend_name}`"))),
        };

        match submitted {
            Ok(handle) => {
                let committed = self.registry.update(id, |record| {
                    record.claimed = false;
                    if record.state != JobState::Pending || record.generation != generation {
                        return false;
                    }
                    record.state = JobState::Submitted;
                    record.handle = Some(handle.clone());
                    record.result.submitted_at = Some(Utc::now());
                    true
                });
                if committed == Some(true) {
                    tracing::info!(job_id = %id, %handle, "Job submitted");
                } else if let Some(backend) = self.backends.get(&backend_name) {
                    tracing::warn!(job_id = %id, %handle, "Job was withdrawn during submission, cancelling it");
                    let cancel = backend.adapter.cancel(&handle);
                    if let Err(e) = with_timeout(backend.policy.call_timeout, cancel).await {
                        tracing::warn!(job_id = %id, %handle, "Orphan job not cancelled: {e}");
                    }
                }
                Ok(())
            }
            Err(err) => {
                tracing::error!(job_id = %id, "Submission failed: {err}");
                let failure = match &err {
                    SubmissionError::Template(e) => JobFailure::Template { message: e.to_string() },
                    e => JobFailure::Submission { message: e.to_string() },
                };
                let failed = self.registry.update(id, |record| {
                    record.claimed = false;
                    if record.state != JobState::Pending {
                        return false;
                    }
                    record.state = JobState::Failed;
                    record.result.failure = Some(failure);
                    record.result.finished_at = Some(Utc::now());
                    true
                });
                if failed == Some(true) {
                    self.registry.emit(DispatchEvent::SubmissionFailed {
                        job: id.clone(),
                        reason: err.to_string(),
                    });
                    self.cancel_dependents(id);
                }
                Err(err)
            }
        }
    }

    async fn submit_to_backend(
        &self,
        backend: &Backend,
        descriptor: &JobDescriptor,
        prior_attempts: u32,
    ) -> Result<BackendHandle, SubmissionError> {
        if backend.policy.check_workdir {
            descriptor.resources.check_workdir()?;
        }
        let artifact = self.templates.render(&backend.template_id, descriptor)?;
        tracing::debug!(job_id = %descriptor.id, digest = %artifact.digest, "Rendered job script");

        // An earlier run may have reached the backend without hearing back.
        if prior_attempts > 0 {
            if let Some(handle) = self.lookup(backend, &artifact.tag).await {
                tracing::info!(job_id = %descriptor.id, %handle, "Found earlier submission");
                return Ok(handle);
            }
        }

        let policy = backend.policy;
        let (id, artifact) = (&descriptor.id, &artifact);
        let ret = policy
            .retry
            .retry(
                || async move {
                    self.registry.update(id, |record| record.submit_attempts += 1);
                    let submit = backend.adapter.submit(artifact, &descriptor.resources);
                    match with_timeout(policy.call_timeout, submit).await {
                        Err(e) if e.is_transient() => {
                            tracing::warn!(job_id = %id, "Submission unconfirmed: {e}");
                            self.lookup(backend, &artifact.tag).await.ok_or(e)
                        }
                        other => other,
                    }
                },
                AdapterError::is_transient,
            )
            .await;

        ret.map_err(|(e, attempts)| match e {
            AdapterError::Rejected(reason) => SubmissionError::Rejected(reason),
            AdapterError::Transient(last) => SubmissionError::RetriesExhausted { attempts, last },
        })
    }

    /// Asks the backend whether it already holds a job under `tag`.
    async fn lookup(&self, backend: &Backend, tag: &str) -> Option<BackendHandle> {
        let filter = ListFilter::tag(tag);
        match with_timeout(backend.policy.call_timeout, backend.adapter.list(&filter)).await {
            Ok(handles) => {
                if handles.len() > 1 {
                    tracing::warn!(tag, count = handles.len(), "Several backend jobs share a tag");
                }
                handles.into_iter().next()
            }
            Err(e) => {
                tracing::debug!(tag, "Lookup failed: {e}");
                None
            }
        }
    }

    /// Moves an active job to a terminal state. Returns whether this call did it.
    fn finish(
        &self,
        id: &JobId,
        state: JobState,
        exit_code: Option<i32>,
        failure: Option<JobFailure>,
    ) -> bool {
        self.registry.update(id, |record| {
            if !record.state.is_active() {
                return false;
            }
            record.state = state;
            record.result.exit_code = exit_code;
            record.result.failure = failure;
            record.result.finished_at = Some(Utc::now());
            record.reconciliation.reset();
            true
        }) == Some(true)
    }

    fn mark_lost(&self, id: &JobId, reason: String) -> bool {
        tracing::warn!(job_id = %id, "Job lost: {reason}");
        self.finish(id, JobState::Lost, None, Some(JobFailure::Lost { reason }))
    }

    fn cancel_for_dependency(&self, id: &JobId, dependency: &JobId) -> bool {
        let cancelled = self.registry.update(id, |record| {
            if record.state != JobState::Pending {
                return false;
            }
            record.state = JobState::Cancelled;
            record.result.failure = Some(JobFailure::Dependency { dependency: dependency.clone() });
            record.result.finished_at = Some(Utc::now());
            true
        }) == Some(true);
        if cancelled {
            tracing::info!(job_id = %id, %dependency, "Dependency failed, job cancelled");
            self.registry.emit(DispatchEvent::DependencyCancelled {
                job: id.clone(),
                dependency: dependency.clone(),
            });
        }
        cancelled
    }

    /// Cancels everything that transitively depends on `root`. Only pending jobs are
    /// touched, so each one is reported once.
    fn cancel_dependents(&self, root: &JobId) {
        let mut queue = VecDeque::from([root.clone()]);
        while let Some(failed) = queue.pop_front() {
            for dependent in self.registry.dependents(&failed) {
                if self.cancel_for_dependency(&dependent, &failed) {
                    queue.push_back(dependent);
                }
            }
        }
    }

    async fn release_dependents(&self, id: &JobId) {
        for dependent in self.registry.dependents(id) {
            let Some(record) = self.registry.get(&dependent) else {
                continue;
            };
            if record.state != JobState::Pending
                || !matches!(self.readiness(&record.descriptor), Readiness::Ready)
            {
                continue;
            }
            if let Err(e) = self.try_submit(&dependent, record.generation).await {
                tracing::debug!(job_id = %dependent, "Dependent not submitted: {e}");
            }
        }
    }
}

/// Bounds an adapter call; running out of time is a transient failure.
async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, AdapterError>>,
) -> Result<T, AdapterError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or_else(|_| Err(AdapterError::Transient(format!("no answer within {limit:?}"))))
}
