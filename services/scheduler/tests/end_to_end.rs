//! End-to-end scheduling scenarios against in-memory agents: the real
//! registry, transformer, state machines, and scheduler runloop, with only
//! the network replaced.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use flotilla_api::{Command, ContainerConfig, ContainerStatus, Error, Grace, Job, ResourceLimits, Task};
use flotilla_scheduler::discovery::StaticDiscovery;
use flotilla_scheduler::proxy::{AgentApi, InMemoryAgent};
use flotilla_scheduler::registry::{Registry, TaskSpec};
use flotilla_scheduler::scheduler::Scheduler;
use flotilla_scheduler::transformer::{AgentConnector, Transformer};

const POLL: Duration = Duration::from_millis(10);

/// Hands out shared in-memory agents by endpoint, creating on demand.
#[derive(Clone, Default)]
struct FakeConnector {
    agents: Arc<Mutex<BTreeMap<String, InMemoryAgent>>>,
}

impl FakeConnector {
    fn agent(&self, endpoint: &str) -> InMemoryAgent {
        self.agents
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_default()
            .clone()
    }
}

impl AgentConnector for FakeConnector {
    fn connect(&self, endpoint: &str) -> Arc<dyn AgentApi> {
        Arc::new(self.agent(endpoint))
    }
}

struct Domain {
    registry: Arc<Registry>,
    discovery: Arc<StaticDiscovery>,
    transformer: Transformer,
    scheduler: Scheduler,
    connector: FakeConnector,
    lost: mpsc::UnboundedReceiver<(String, TaskSpec)>,
}

/// One scheduling domain: registry, transformer, scheduler, and a fleet of
/// in-memory agents. The lost channel is held by the test so agent-death
/// scenarios can observe it.
async fn domain(endpoints: &[&str]) -> Domain {
    let (lost_tx, lost_rx) = mpsc::unbounded_channel();
    let (observed_tx, observed_rx) = mpsc::unbounded_channel();
    let registry = Registry::new(Some(lost_tx));

    let connector = FakeConnector::default();
    let discovery = Arc::new(StaticDiscovery::new(
        endpoints.iter().map(|e| e.to_string()).collect(),
    ));
    let transformer = Transformer::new(
        discovery.clone(),
        registry.clone(),
        Arc::new(connector.clone()),
        POLL,
    );

    // Tee lost entries: the scheduler logs them, the test asserts on them.
    let mut lost_rx = lost_rx;
    let (scheduler_lost_tx, scheduler_lost_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(entry) = lost_rx.recv().await {
            let _ = observed_tx.send(entry.clone());
            let _ = scheduler_lost_tx.send(entry);
        }
    });

    let scheduler = Scheduler::new(
        registry.clone(),
        Arc::new(transformer.clone()),
        scheduler_lost_rx,
    );

    Domain {
        registry,
        discovery,
        transformer,
        scheduler,
        connector,
        lost: observed_rx,
    }
}

/// Wait until the transformer's view of an endpoint holds `count`
/// instances. Agent state machines consume the event stream
/// asynchronously, so acks can land before the view catches up.
async fn settled_view(d: &Domain, endpoint: &str, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let states = d.transformer.agent_states().await;
        let seen = states
            .get(endpoint)
            .map(|s| s.container_instances.len())
            .unwrap_or(0);
        if seen == count {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "view of {endpoint} stuck at {seen}, want {count}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn task(job: &str, name: &str, scale: u32) -> Task {
    Task {
        task_name: name.to_string(),
        scale,
        container_config: ContainerConfig {
            job_name: job.to_string(),
            task_name: name.to_string(),
            artifact_url: "http://artifacts.internal/site.tar.gz".to_string(),
            command: Command {
                working_dir: "/srv".to_string(),
                exec: vec!["./run".to_string()],
            },
            resources: ResourceLimits { mem: 32, cpus: 0.1 },
            grace: Grace {
                startup: 2,
                shutdown: 2,
            },
            ..Default::default()
        },
    }
}

fn job(name: &str, tasks: &[(&str, u32)]) -> Job {
    Job {
        job_name: name.to_string(),
        tasks: tasks
            .iter()
            .map(|(task_name, scale)| (task_name.to_string(), task(name, task_name, *scale)))
            .collect(),
    }
}

#[tokio::test]
async fn schedule_a_two_task_job_onto_one_agent() {
    let d = domain(&["agent-1"]).await;
    let agent = d.connector.agent("agent-1");

    d.scheduler
        .schedule(job("site", &[("web", 2), ("db", 1)]))
        .await
        .unwrap();

    // Three instances on the agent, all running.
    let instances = agent.containers().await.unwrap();
    assert_eq!(instances.len(), 3);
    assert!(instances
        .iter()
        .all(|i| i.status == ContainerStatus::Running));

    // All three acks came back schedule-successful: everything scheduled.
    let state = d.registry.snapshot();
    assert_eq!(state.scheduled.len(), 3);
    assert!(state.pending_schedule.is_empty());

    d.transformer.stop().await;
}

#[tokio::test]
async fn double_schedule_is_a_conflict() {
    let d = domain(&["agent-1"]).await;
    let site = job("site", &[("web", 1)]);

    d.scheduler.schedule(site.clone()).await.unwrap();
    let err = d.scheduler.schedule(site).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // The failed request didn't disturb the first.
    assert_eq!(d.registry.snapshot().scheduled.len(), 1);

    d.transformer.stop().await;
}

#[tokio::test]
async fn schedule_with_zero_tasks_succeeds() {
    let d = domain(&["agent-1"]).await;
    d.scheduler.schedule(job("empty", &[])).await.unwrap();
    assert!(d.registry.snapshot().scheduled.is_empty());
    d.transformer.stop().await;
}

#[tokio::test]
async fn scale_zero_is_invalid_input() {
    let d = domain(&["agent-1"]).await;
    let err = d
        .scheduler
        .schedule(job("site", &[("web", 0)]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    d.transformer.stop().await;
}

#[tokio::test]
async fn schedule_with_no_trustable_agent_fails() {
    let d = domain(&[]).await;
    let err = d
        .scheduler
        .schedule(job("site", &[("web", 1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AgentUnavailable(_)));
    d.transformer.stop().await;
}

#[tokio::test]
async fn unschedule_empties_agent_and_registry() {
    let d = domain(&["agent-1"]).await;
    let agent = d.connector.agent("agent-1");
    let site = job("site", &[("web", 2)]);

    d.scheduler.schedule(site.clone()).await.unwrap();
    assert_eq!(agent.instance_ids().len(), 2);
    settled_view(&d, "agent-1", 2).await;

    d.scheduler.unschedule(site).await.unwrap();
    assert!(agent.instance_ids().is_empty());

    let state = d.registry.snapshot();
    assert!(state.scheduled.is_empty());
    assert!(state.pending_unschedule.is_empty());

    d.transformer.stop().await;
}

#[tokio::test]
async fn start_failure_fails_the_schedule_call() {
    let d = domain(&["agent-1"]).await;
    let agent = d.connector.agent("agent-1");

    // PUT lands the container in failed; the transformer reports a start
    // failure, and the registry abandons the intent.
    agent.put_lands_in(ContainerStatus::Failed);

    let err = d
        .scheduler
        .schedule(job("site", &[("web", 1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RuntimeFailure(_)));

    let state = d.registry.snapshot();
    assert!(state.pending_schedule.is_empty());
    assert!(state.scheduled.is_empty());

    d.transformer.stop().await;
}

#[tokio::test]
async fn startup_past_the_grace_window_is_a_start_failure() {
    let d = domain(&["agent-1"]).await;
    let agent = d.connector.agent("agent-1");

    // The container accepts the PUT but never leaves starting; the grace
    // window expires and the maneuver is reported failed.
    agent.put_lands_in(ContainerStatus::Starting);

    let err = d
        .scheduler
        .schedule(job("site", &[("web", 1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RuntimeFailure(_)));

    let state = d.registry.snapshot();
    assert!(state.pending_schedule.is_empty());
    assert!(state.scheduled.is_empty());

    d.transformer.stop().await;
}

#[tokio::test]
async fn lost_agent_converts_containers_to_lost_signals_once() {
    let mut d = domain(&["agent-1"]).await;

    d.scheduler
        .schedule(job("site", &[("web", 1)]))
        .await
        .unwrap();
    let state = d.registry.snapshot();
    assert_eq!(state.scheduled.len(), 1);
    let id = state.scheduled.keys().next().unwrap().clone();
    settled_view(&d, "agent-1", 1).await;

    // The agent disappears from discovery.
    d.discovery.set_endpoints(vec![]);

    // Its container is signalled lost and leaves the registry.
    let (lost_id, lost_spec) = tokio::time::timeout(Duration::from_secs(5), d.lost.recv())
        .await
        .expect("lost signal never arrived")
        .unwrap();
    assert_eq!(lost_id, id);
    assert_eq!(lost_spec.endpoint, "agent-1");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let state = d.registry.snapshot();
        if state.scheduled.is_empty() && state.pending_schedule.is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "registry kept the lost container");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Exactly once: nothing further on the lost channel.
    assert!(d.lost.try_recv().is_err());

    d.transformer.stop().await;
}

#[tokio::test]
async fn migrate_grows_a_task_and_rolls_back_on_put_failure() {
    let d = domain(&["agent-1"]).await;
    let agent = d.connector.agent("agent-1");

    // Original job: web at scale 3.
    let old = job("site", &[("web", 3)]);
    d.scheduler.schedule(old.clone()).await.unwrap();
    let original_ids: Vec<String> = {
        let mut ids = agent.instance_ids();
        ids.sort();
        ids
    };
    assert_eq!(original_ids.len(), 3);
    settled_view(&d, "agent-1", 3).await;

    // Target: scale 5 with a new env var. Same artifact, so migration is
    // permitted; different config, so every instance gets a fresh id.
    let mut new = job("site", &[("web", 5)]);
    new.tasks
        .get_mut("web")
        .unwrap()
        .container_config
        .env
        .insert("FEATURE".to_string(), "on".to_string());

    // The 3 original PUTs used indices 0..2. The migration schedules new
    // instances one at a time; fail the fifth one (index 7 overall).
    agent.fail_put_at(7);

    let err = d.scheduler.migrate(old, new).await.unwrap_err();
    assert!(matches!(err, Error::RuntimeFailure(_)));

    // Full LIFO rollback: the agent holds exactly the original three
    // instances again, and the registry is back to its pre-migrate state.
    let mut ids = agent.instance_ids();
    ids.sort();
    assert_eq!(ids, original_ids);

    let state = d.registry.snapshot();
    assert_eq!(state.scheduled.len(), 3);
    assert!(state.pending_schedule.is_empty());
    assert!(state.pending_unschedule.is_empty());
    for id in &original_ids {
        assert!(state.scheduled.contains_key(id));
    }

    d.transformer.stop().await;
}

#[tokio::test]
async fn migrate_replaces_instances_when_it_succeeds() {
    let d = domain(&["agent-1"]).await;
    let agent = d.connector.agent("agent-1");

    let old = job("site", &[("web", 2)]);
    d.scheduler.schedule(old.clone()).await.unwrap();
    let old_ids = agent.instance_ids();
    settled_view(&d, "agent-1", 2).await;

    let mut new = job("site", &[("web", 2)]);
    new.tasks
        .get_mut("web")
        .unwrap()
        .container_config
        .env
        .insert("FEATURE".to_string(), "on".to_string());

    d.scheduler.migrate(old, new).await.unwrap();

    let ids = agent.instance_ids();
    assert_eq!(ids.len(), 2);
    for id in &old_ids {
        assert!(!ids.contains(id), "old instance {id} survived the migration");
    }
    assert_eq!(d.registry.snapshot().scheduled.len(), 2);

    d.transformer.stop().await;
}

#[tokio::test]
async fn migrate_requires_a_uniform_artifact() {
    let d = domain(&["agent-1"]).await;

    let mut old = job("site", &[("web", 1), ("db", 1)]);
    old.tasks
        .get_mut("db")
        .unwrap()
        .container_config
        .artifact_url = "http://artifacts.internal/other.tar.gz".to_string();

    let err = d
        .scheduler
        .migrate(old, job("site", &[("web", 1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    d.transformer.stop().await;
}
