//! The public scheduler: Schedule, Migrate, Unschedule.
//!
//! One runloop serializes every request, so two operators cannot race
//! placements. Placement picks an endpoint per instance, writes intents
//! into the registry, and waits on the acks; any failure unwinds the
//! completed sub-operations in LIFO order.
//!
//! Container ids are the operational atom: a hash of job, task, and
//! instance index over a canonical encoding. Changing any dimension of a
//! job's config produces a new set of ids, which is what makes migration a
//! schedule-1/unschedule-1 interleave rather than an in-place mutation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use flotilla_api::{Error, Grace, Job, Task};

use crate::algorithms::{random_non_dirty, SchedulingAlgorithm};
use crate::registry::{Registry, Signal, SignalWithContext, TaskSpec};
use crate::transformer::{AgentState, Transformer};

/// Read access to the fleet state, for placement and job lookup.
#[async_trait]
pub trait AgentStater: Send + Sync + 'static {
    async fn agent_states(&self) -> BTreeMap<String, AgentState>;
}

#[async_trait]
impl AgentStater for Transformer {
    async fn agent_states(&self) -> BTreeMap<String, AgentState> {
        Transformer::agent_states(self).await
    }
}

enum Request {
    Schedule {
        job: Job,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Migrate {
        existing: Job,
        target: Job,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Unschedule {
        job: Job,
        reply: oneshot::Sender<Result<(), Error>>,
    },
}

/// Handle to the scheduler runloop.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::Sender<Request>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        stater: Arc<dyn AgentStater>,
        lost: mpsc::UnboundedReceiver<(String, TaskSpec)>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run(registry, stater, lost, rx));
        Self { tx }
    }

    pub async fn schedule(&self, job: Job) -> Result<(), Error> {
        self.request(|reply| Request::Schedule { job, reply }).await
    }

    pub async fn migrate(&self, existing: Job, target: Job) -> Result<(), Error> {
        self.request(|reply| Request::Migrate {
            existing,
            target,
            reply,
        })
        .await
    }

    pub async fn unschedule(&self, job: Job) -> Result<(), Error> {
        self.request(|reply| Request::Unschedule { job, reply }).await
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), Error>>) -> Request,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::RuntimeFailure("scheduler runloop stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::RuntimeFailure("scheduler runloop stopped".to_string()))?
    }
}

async fn run(
    registry: Arc<Registry>,
    stater: Arc<dyn AgentStater>,
    mut lost: mpsc::UnboundedReceiver<(String, TaskSpec)>,
    mut rx: mpsc::Receiver<Request>,
) {
    let algorithm: SchedulingAlgorithm = random_non_dirty;
    let mut lost_live = true;

    loop {
        tokio::select! {
            request = rx.recv() => match request {
                Some(Request::Schedule { job, reply }) => {
                    let _ = reply.send(handle_schedule(&registry, &stater, algorithm, job).await);
                }
                Some(Request::Migrate { existing, target, reply }) => {
                    let _ = reply.send(handle_migrate(&registry, &stater, algorithm, existing, target).await);
                }
                Some(Request::Unschedule { job, reply }) => {
                    let _ = reply.send(handle_unschedule(&registry, &stater, job).await);
                }
                None => return,
            },

            entry = lost.recv(), if lost_live => match entry {
                // Lost containers are surfaced for the operator; re-placing
                // them automatically is a policy decision we don't make.
                Some((id, spec)) => {
                    warn!(container_id = %id, endpoint = %spec.endpoint, "container lost");
                }
                None => lost_live = false,
            }
        }
    }
}

async fn handle_schedule(
    registry: &Arc<Registry>,
    stater: &Arc<dyn AgentStater>,
    algorithm: SchedulingAlgorithm,
    job: Job,
) -> Result<(), Error> {
    job.valid()?;
    let states = stater.agent_states().await;
    let specs = place_job(&job, &states, algorithm)?;
    info!(job = %job.job_name, task_specs = specs.len(), "schedule");
    apply(registry, Maneuver::Schedule, &specs).await
}

async fn handle_unschedule(
    registry: &Arc<Registry>,
    stater: &Arc<dyn AgentStater>,
    job: Job,
) -> Result<(), Error> {
    let states = stater.agent_states().await;
    let specs = find_job(&job, &states);
    info!(job = %job.job_name, task_specs = specs.len(), "unschedule");
    apply(registry, Maneuver::Unschedule, &specs).await
}

/// Migrate one task instance at a time: schedule one new, unschedule one
/// old, per task, with leftover old tasks unscheduled last. Any failure
/// unwinds the completed sub-operations LIFO.
async fn handle_migrate(
    registry: &Arc<Registry>,
    stater: &Arc<dyn AgentStater>,
    algorithm: SchedulingAlgorithm,
    existing: Job,
    target: Job,
) -> Result<(), Error> {
    // Migrations require a stable artifact across the job.
    existing
        .artifact_url()
        .map_err(|e| Error::InvalidInput(format!("can't migrate job {}: {e}", existing.job_name)))?;
    target.valid()?;

    info!(job = %existing.job_name, "migrate");

    let states = stater.agent_states().await;
    let new_specs = place_job(&target, &states, algorithm)
        .map_err(|e| Error::RuntimeFailure(format!("when placing tasks for new job: {e}")))?;

    let mut old_groups = group_by_task(find_job(&existing, &states));
    let new_groups = group_by_task(new_specs);

    let mut undo: Vec<(Maneuver, BTreeMap<String, TaskSpec>)> = Vec::new();

    let result = async {
        for (task_name, new_instances) in &new_groups {
            let old_instances = old_groups.remove(task_name).unwrap_or_default();
            info!(
                job = %target.job_name,
                task = %task_name,
                old_scale = old_instances.len(),
                new_scale = new_instances.len(),
                "migrating task"
            );

            for i in 0..new_instances.len().max(old_instances.len()) {
                if let Some((id, spec)) = new_instances.get(i) {
                    let one = BTreeMap::from([(id.clone(), spec.clone())]);
                    apply(registry, Maneuver::Schedule, &one)
                        .await
                        .map_err(|e| {
                            Error::RuntimeFailure(format!(
                                "while scheduling instance of task {task_name:?}: {e}"
                            ))
                        })?;
                    undo.push((Maneuver::Unschedule, one));
                }
                if let Some((id, spec)) = old_instances.get(i) {
                    let one = BTreeMap::from([(id.clone(), spec.clone())]);
                    apply(registry, Maneuver::Unschedule, &one)
                        .await
                        .map_err(|e| {
                            Error::RuntimeFailure(format!(
                                "while unscheduling instance of task {task_name:?}: {e}"
                            ))
                        })?;
                    undo.push((Maneuver::Schedule, one));
                }
            }
        }

        // Tasks present in the old job but absent from the new one.
        for (task_name, old_instances) in &old_groups {
            info!(
                job = %existing.job_name,
                task = %task_name,
                old_scale = old_instances.len(),
                "unscheduling leftover task"
            );
            for (id, spec) in old_instances {
                let one = BTreeMap::from([(id.clone(), spec.clone())]);
                apply(registry, Maneuver::Unschedule, &one)
                    .await
                    .map_err(|e| {
                        Error::RuntimeFailure(format!(
                            "while unscheduling instance of task {task_name:?}: {e}"
                        ))
                    })?;
                undo.push((Maneuver::Schedule, one));
            }
        }

        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            info!(job = %target.job_name, "migrated");
            Ok(())
        }
        Err(e) => {
            warn!(job = %target.job_name, error = %e, "migration failed, rolling back");
            for (maneuver, specs) in undo.into_iter().rev() {
                if let Err(undo_err) = apply(registry, maneuver, &specs).await {
                    warn!(error = %undo_err, "rollback step failed");
                }
            }
            Err(e)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Maneuver {
    Schedule,
    Unschedule,
}

/// Apply one maneuver to every spec in the map, waiting on each ack. The
/// first unacceptable signal (or timeout at twice the grace window)
/// reverts everything already applied, LIFO.
async fn apply(
    registry: &Arc<Registry>,
    maneuver: Maneuver,
    specs: &BTreeMap<String, TaskSpec>,
) -> Result<(), Error> {
    let (acceptable, grace_window): (Signal, fn(&Grace) -> u64) = match maneuver {
        Maneuver::Schedule => (Signal::ScheduleSuccessful, |g| g.startup),
        Maneuver::Unschedule => (Signal::UnscheduleSuccessful, |g| g.shutdown),
    };

    let mut undo: Vec<(String, TaskSpec)> = Vec::new();

    let revert = |registry: &Arc<Registry>, undo: Vec<(String, TaskSpec)>| {
        for (id, spec) in undo.into_iter().rev() {
            let result = match maneuver {
                Maneuver::Schedule => registry.unschedule(&id, spec, None),
                Maneuver::Unschedule => registry.schedule(&id, spec, None),
            };
            if let Err(e) = result {
                warn!(container_id = %id, error = %e, "revert failed");
            }
        }
    };

    for (id, spec) in specs {
        let (ack, ack_rx) = oneshot::channel::<SignalWithContext>();
        let submitted = match maneuver {
            Maneuver::Schedule => registry.schedule(id, spec.clone(), Some(ack)),
            Maneuver::Unschedule => registry.unschedule(id, spec.clone(), Some(ack)),
        };
        if let Err(e) = submitted {
            warn!(container_id = %id, endpoint = %spec.endpoint, error = %e, "intent rejected");
            revert(registry, undo);
            return Err(e);
        }

        let wait = Duration::from_secs(2 * grace_window(&spec.config.grace).max(1));
        match tokio::time::timeout(wait, ack_rx).await {
            Ok(Ok(signal)) => {
                info!(
                    container_id = %id,
                    endpoint = %spec.endpoint,
                    signal = %signal.signal,
                    "{}", signal.context
                );
                if signal.signal != acceptable {
                    revert(registry, undo);
                    return Err(Error::RuntimeFailure(format!(
                        "{id} on {}: unacceptable signal {}, giving up",
                        spec.endpoint, signal.signal
                    )));
                }
                undo.push((id.clone(), spec.clone()));
            }
            Ok(Err(_)) => {
                revert(registry, undo);
                return Err(Error::RuntimeFailure(format!(
                    "{id} on {}: ack channel closed",
                    spec.endpoint
                )));
            }
            Err(_) => {
                revert(registry, undo);
                return Err(Error::OperationTimeout(format!(
                    "{id} on {}: no signal within {}s",
                    spec.endpoint,
                    wait.as_secs()
                )));
            }
        }
    }

    Ok(())
}

/// 1 job -> N tasks -> sum-of-scales instances: find a home for every
/// instance and derive its container id.
fn place_job(
    job: &Job,
    states: &BTreeMap<String, AgentState>,
    algorithm: SchedulingAlgorithm,
) -> Result<BTreeMap<String, TaskSpec>, Error> {
    let mut specs = BTreeMap::new();
    for task in job.tasks.values() {
        for instance in 0..task.scale {
            let endpoint = algorithm(states, &task.container_config).map_err(|e| {
                Error::AgentUnavailable(format!(
                    "couldn't place instance {}/{} of {:?}: {e}",
                    instance + 1,
                    task.scale,
                    task.task_name
                ))
            })?;
            specs.insert(
                make_container_id(job, task, instance),
                TaskSpec {
                    endpoint,
                    config: task.container_config.clone(),
                },
            );
        }
    }
    Ok(specs)
}

/// Every live container whose job name matches and whose task name is in
/// the job, tagged with its current endpoint.
fn find_job(job: &Job, states: &BTreeMap<String, AgentState>) -> BTreeMap<String, TaskSpec> {
    let mut specs = BTreeMap::new();
    for (endpoint, state) in states {
        for instance in state.container_instances.values() {
            if instance.config.job_name != job.job_name {
                continue;
            }
            if !job.tasks.contains_key(&instance.config.task_name) {
                continue;
            }
            specs.insert(
                instance.id.clone(),
                TaskSpec {
                    endpoint: endpoint.clone(),
                    config: instance.config.clone(),
                },
            );
        }
    }
    specs
}

/// Split one spec map into per-task lists, ordered by container id so
/// migration walks instances deterministically.
fn group_by_task(
    specs: BTreeMap<String, TaskSpec>,
) -> BTreeMap<String, Vec<(String, TaskSpec)>> {
    let mut groups: BTreeMap<String, Vec<(String, TaskSpec)>> = BTreeMap::new();
    for (id, spec) in specs {
        groups
            .entry(spec.config.task_name.clone())
            .or_default()
            .push((id, spec));
    }
    groups
}

/// `<job>-<hash(job)>:<task>-<hash(task)>:<instance>`. The hash runs over
/// the serde encoding, which is stable: struct fields serialize in
/// declaration order and all maps in the job tree are BTreeMaps.
pub fn make_container_id(job: &Job, task: &Task, instance: u32) -> String {
    format!(
        "{}-{}:{}-{}:{}",
        job.job_name,
        ref_hash(job),
        task.task_name,
        ref_hash(task),
        instance
    )
}

fn ref_hash<T: Serialize>(value: &T) -> String {
    let encoded = serde_json::to_vec(value).expect("job types always encode");
    format!("{:x}", md5::compute(encoded))
}
