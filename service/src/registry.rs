use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use domain::error::DispatchError;
use domain::model::entity::{JobRecord, JobState};
use domain::model::vo::JobId;
use tokio::sync::watch;

use crate::event::DispatchEvent;

#[derive(Debug)]
struct Slot {
    record: JobRecord,
    state_tx: watch::Sender<JobState>,
}

/// Authoritative store of job id to record.
///
/// Every write replaces a whole record under the entry's shard lock, so readers see state and
/// handle change together. Writes are only reachable through the dispatch manager.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: DashMap<JobId, Slot>,
    events: flume::Sender<DispatchEvent>,
}

impl JobRegistry {
    pub(crate) fn new(events: flume::Sender<DispatchEvent>) -> Self {
        Self { jobs: DashMap::new(), events }
    }

    pub fn get(&self, id: &JobId) -> Option<JobRecord> {
        self.jobs.get(id).map(|slot| slot.record.clone())
    }

    pub fn state(&self, id: &JobId) -> Option<JobState> {
        self.jobs.get(id).map(|slot| slot.record.state)
    }

    /// Ids in the given state, sorted.
    pub fn list_by_state(&self, state: JobState) -> Vec<JobId> {
        let mut ids: Vec<_> = self
            .jobs
            .iter()
            .filter(|slot| slot.record.state == state)
            .map(|slot| slot.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Copy of every record, sorted by id.
    pub fn snapshot(&self) -> Vec<JobRecord> {
        let mut records: Vec<_> = self.jobs.iter().map(|slot| slot.record.clone()).collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        records
    }

    /// State updates of one job. The current state is readable immediately.
    pub fn subscribe(&self, id: &JobId) -> Option<watch::Receiver<JobState>> {
        self.jobs.get(id).map(|slot| slot.state_tx.subscribe())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub(crate) fn count(&self, f: impl Fn(&JobRecord) -> bool) -> usize {
        self.jobs.iter().filter(|slot| f(&slot.record)).count()
    }

    /// Ids of records matching `f`, sorted.
    pub(crate) fn ids_where(&self, f: impl Fn(&JobRecord) -> bool) -> Vec<JobId> {
        let mut ids = self.collect(|record| f(record).then(|| record.id().clone()));
        ids.sort();
        ids
    }

    pub(crate) fn collect<T>(&self, f: impl Fn(&JobRecord) -> Option<T>) -> Vec<T> {
        self.jobs.iter().filter_map(|slot| f(&slot.record)).collect()
    }

    /// Jobs that list `id` as a direct dependency.
    pub(crate) fn dependents(&self, id: &JobId) -> Vec<JobId> {
        self.ids_where(|record| record.descriptor.dependencies.contains(id))
    }

    /// Rebuilds records from a checkpoint. Existing entries with the same id are replaced;
    /// their subscribers stay attached and see the restored state.
    pub fn restore(&self, records: impl IntoIterator<Item = JobRecord>) {
        for mut record in records {
            record.claimed = false;
            match self.jobs.entry(record.id().clone()) {
                Entry::Vacant(entry) => {
                    let (state_tx, _) = watch::channel(record.state);
                    entry.insert(Slot { record, state_tx });
                }
                Entry::Occupied(mut entry) => {
                    let slot = entry.get_mut();
                    record.generation = slot.record.generation + 1;
                    slot.state_tx.send_replace(record.state);
                    slot.record = record;
                }
            }
        }
    }

    /// Stores a fresh `Pending` record. A same-id record is only replaced while it is still
    /// `Pending` and nobody is submitting it; the later write wins. Returns the generation the
    /// stored record carries.
    pub(crate) fn insert(&self, mut record: JobRecord) -> Result<u64, DispatchError> {
        match self.jobs.entry(record.id().clone()) {
            Entry::Vacant(entry) => {
                let (state_tx, _) = watch::channel(record.state);
                entry.insert(Slot { record, state_tx });
                Ok(0)
            }
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                if slot.record.state != JobState::Pending || slot.record.claimed {
                    return Err(DispatchError::AlreadySubmitted(record.id().clone()));
                }
                record.generation = slot.record.generation + 1;
                let generation = record.generation;
                slot.record = record;
                Ok(generation)
            }
        }
    }

    /// Applies `f` to a record atomically with respect to every other access to that record.
    ///
    /// A state change that breaks the lifecycle rules is rolled back together with the handle,
    /// so terminal records keep their state and handle forever. Result metadata may still
    /// change. `f` must not call back into the registry.
    pub(crate) fn update<R>(&self, id: &JobId, f: impl FnOnce(&mut JobRecord) -> R) -> Option<R> {
        let mut slot = self.jobs.get_mut(id)?;
        let before = slot.record.state;
        let handle = slot.record.handle.clone();
        let ret = f(&mut slot.record);

        let after = slot.record.state;
        let handle_changed = slot.record.handle != handle;
        if (after != before && !before.can_transition_to(after))
            || (before.is_terminal() && handle_changed)
        {
            tracing::warn!(job_id = %id, %before, %after, "Refusing invalid state transition");
            slot.record.state = before;
            slot.record.handle = handle;
        } else if after != before {
            tracing::debug!(job_id = %id, %before, %after, "Job state changed");
            slot.state_tx.send_replace(after);
            let _ = self.events.send(DispatchEvent::StateChanged {
                job: id.clone(),
                from: before,
                to: after,
            });
        }
        Some(ret)
    }

    pub(crate) fn emit(&self, event: DispatchEvent) {
        let _ = self.events.send(event);
    }
}
