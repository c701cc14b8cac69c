//! The transformer: makes remote agents reflect the registry's desired
//! state.
//!
//! One runloop owns the set of agent state machines. It reacts to two
//! inputs, discovery updates and registry snapshots, and reports every
//! maneuver outcome back into the registry as a signal.
//!
//! Between the registry subscription and the runloop sits a single-slot
//! coalescing forwarder: work done here emits signals that re-enter the
//! registry and produce fresh snapshots, so the runloop must never be the
//! reason the registry's broadcast backs up. The transformer only ever
//! needs the latest snapshot anyway.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use flotilla_api::{ContainerInstance, ContainerStatus, HostResources};

use crate::discovery::AgentDiscovery;
use crate::proxy::{AgentApi, RemoteAgent};
use crate::registry::{Registry, RegistryState, Signal, TaskSpec};
use crate::state_machine::StateMachine;

/// Extra slack on top of each grace window before a maneuver is declared
/// failed.
const GRACE_SLACK: Duration = Duration::from_millis(500);

/// The scheduler's picture of one agent, as consumed by scheduling
/// algorithms.
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    /// When set, the report cannot be trusted and no placement should
    /// land here.
    pub dirty: bool,
    pub host_resources: HostResources,
    pub container_instances: BTreeMap<String, ContainerInstance>,
}

/// How the transformer reaches an endpoint. Tests connect in-memory agents.
pub trait AgentConnector: Send + Sync + 'static {
    fn connect(&self, endpoint: &str) -> Arc<dyn AgentApi>;
}

/// Connects over HTTP.
pub struct HttpConnector;

impl AgentConnector for HttpConnector {
    fn connect(&self, endpoint: &str) -> Arc<dyn AgentApi> {
        Arc::new(RemoteAgent::new(endpoint))
    }
}

enum Request {
    States(oneshot::Sender<BTreeMap<String, AgentState>>),
    Stop(oneshot::Sender<()>),
}

/// Handle to the transformer runloop.
#[derive(Clone)]
pub struct Transformer {
    tx: mpsc::Sender<Request>,
}

impl Transformer {
    pub fn new(
        discovery: Arc<dyn AgentDiscovery>,
        registry: Arc<Registry>,
        connector: Arc<dyn AgentConnector>,
        agent_poll_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(16);

        // Coalescing forwarder between the registry broadcast and the
        // runloop: capacity one, newer snapshots overwrite the slot.
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (coalesced_tx, coalesced_rx) = mpsc::channel(1);
        let subscription = registry.notify(raw_tx);
        tokio::spawn(forward_latest(raw_rx, coalesced_tx));

        tokio::spawn(run(
            discovery,
            registry,
            connector,
            agent_poll_interval,
            subscription,
            coalesced_rx,
            rx,
        ));

        Self { tx }
    }

    /// Current state of every known agent. Endpoints whose host-resources
    /// query fails are reported dirty.
    pub async fn agent_states(&self) -> BTreeMap<String, AgentState> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Request::States(reply)).await.is_err() {
            return BTreeMap::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Terminate the runloop and every agent state machine.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Request::Stop(reply)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Single-value caching forwarder: always delivers the most recent
/// snapshot, dropping intermediates while the receiver is busy.
async fn forward_latest(
    mut src: mpsc::UnboundedReceiver<RegistryState>,
    dst: mpsc::Sender<RegistryState>,
) {
    while let Some(mut latest) = src.recv().await {
        loop {
            tokio::select! {
                permit = dst.reserve() => {
                    match permit {
                        Ok(permit) => permit.send(latest),
                        Err(_) => return,
                    }
                    break;
                }
                newer = src.recv() => match newer {
                    Some(newer) => latest = newer,
                    None => {
                        let _ = dst.send(latest).await;
                        return;
                    }
                },
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    discovery: Arc<dyn AgentDiscovery>,
    registry: Arc<Registry>,
    connector: Arc<dyn AgentConnector>,
    agent_poll_interval: Duration,
    registry_subscription: u64,
    mut snapshots: mpsc::Receiver<RegistryState>,
    mut rx: mpsc::Receiver<Request>,
) {
    let mut machines: BTreeMap<String, StateMachine> = BTreeMap::new();
    migrate_agents(&mut machines, discovery.endpoints(), &registry, &connector).await;
    info!(agents = machines.len(), "transformer started");

    let mut endpoints: watch::Receiver<Vec<String>> = discovery.subscribe();
    let mut discovery_live = true;
    let mut stop_reply = None;

    loop {
        tokio::select! {
            changed = endpoints.changed(), if discovery_live => {
                if changed.is_err() {
                    // Discovery went away; keep reconciling what we have.
                    discovery_live = false;
                    continue;
                }
                let incoming = endpoints.borrow_and_update().clone();
                migrate_agents(&mut machines, incoming, &registry, &connector).await;
            }

            snapshot = snapshots.recv() => match snapshot {
                Some(snapshot) => {
                    reconcile(&snapshot, &machines, &registry, agent_poll_interval).await;
                }
                // The registry dropped us; nothing left to reconcile.
                None => break,
            },

            request = rx.recv() => match request {
                Some(Request::States(reply)) => {
                    let _ = reply.send(collect_agent_states(&machines).await);
                }
                other => {
                    if let Some(Request::Stop(reply)) = other {
                        stop_reply = Some(reply);
                    }
                    break;
                }
            },
        }
    }

    registry.stop(registry_subscription);
    for machine in machines.values() {
        machine.stop().await;
    }
    if let Some(reply) = stop_reply {
        let _ = reply.send(());
    }
}

/// One reconciliation pass against the latest snapshot.
///
/// A signal is only delivered when the registry has the maneuver in
/// flight: schedule outcomes for ids in pending-schedule, unschedule
/// outcomes for ids in pending-unschedule. Everything else (self-healing
/// a scheduled container whose instance vanished, tearing down an orphan
/// the registry never tracked, acting on a view that lags the agent by an
/// event or two) still does the agent-side work, but has no registry
/// transition to drive; the outcome is logged and the next snapshot
/// converges.
async fn reconcile(
    snapshot: &RegistryState,
    machines: &BTreeMap<String, StateMachine>,
    registry: &Arc<Registry>,
    poll: Duration,
) {
    let desired = merge_desired(snapshot);
    let actual = remote_state(machines).await;
    let (to_schedule, to_unschedule) = diff_registry_states(&desired, &actual);

    for (id, spec) in to_schedule {
        info!(container_id = %id, endpoint = %spec.endpoint, "triggering schedule");
        let signal = schedule_one(&id, &spec, machines, poll).await;
        if snapshot.pending_schedule.contains_key(&id) {
            registry.signal(&id, signal);
        } else {
            debug!(container_id = %id, signal = %signal, "untracked schedule settled");
        }
    }
    for (id, spec) in to_unschedule {
        info!(container_id = %id, endpoint = %spec.endpoint, "triggering unschedule");
        let signal = unschedule_one(&id, &spec, machines, poll).await;
        if snapshot.pending_unschedule.contains_key(&id) {
            registry.signal(&id, signal);
        } else {
            debug!(container_id = %id, signal = %signal, "untracked unschedule settled");
        }
    }
}

/// Everything the registry wants live: pending-schedule plus scheduled.
fn merge_desired(snapshot: &RegistryState) -> BTreeMap<String, TaskSpec> {
    let mut merged = snapshot.pending_schedule.clone();
    merged.extend(snapshot.scheduled.clone());
    merged
}

/// Live state across all agents, tagged with the owning endpoint.
async fn remote_state(
    machines: &BTreeMap<String, StateMachine>,
) -> BTreeMap<String, (String, ContainerInstance)> {
    let mut actual = BTreeMap::new();
    for (endpoint, machine) in machines {
        for (id, instance) in machine.container_instances().await {
            actual.insert(id, (endpoint.clone(), instance));
        }
    }
    actual
}

/// Diff desired against actual.
///
/// - desired but missing, or present with status `failed`: schedule
/// - present but undesired: unschedule
/// - present at the wrong endpoint: unschedule there, schedule here
pub(crate) fn diff_registry_states(
    desired: &BTreeMap<String, TaskSpec>,
    actual: &BTreeMap<String, (String, ContainerInstance)>,
) -> (BTreeMap<String, TaskSpec>, BTreeMap<String, TaskSpec>) {
    let mut to_schedule = BTreeMap::new();
    let mut to_unschedule = BTreeMap::new();

    for (id, want) in desired {
        match actual.get(id) {
            None => {
                to_schedule.insert(id.clone(), want.clone());
            }
            Some((_, instance)) => match instance.status {
                ContainerStatus::Failed => {
                    to_schedule.insert(id.clone(), want.clone());
                }
                ContainerStatus::Starting
                | ContainerStatus::Running
                | ContainerStatus::Finished => {}
                // Deleted is event-only; a state machine never stores it.
                ContainerStatus::Deleted => {}
            },
        }
    }

    for (id, (endpoint, instance)) in actual {
        let spec = TaskSpec {
            endpoint: endpoint.clone(),
            config: instance.config.clone(),
        };
        match desired.get(id) {
            None => {
                to_unschedule.insert(id.clone(), spec);
            }
            Some(want) if &want.endpoint != endpoint => {
                // Move: tear down the misplaced copy, bring up the right one.
                to_unschedule.insert(id.clone(), spec);
                to_schedule.insert(id.clone(), want.clone());
            }
            Some(_) => {}
        }
    }

    (to_schedule, to_unschedule)
}

/// PUT the container, then block until it leaves `starting`. The blocking
/// matters: without it a second schedule request could slip in before the
/// registry observes success and duplicate the whole maneuver.
async fn schedule_one(
    id: &str,
    spec: &TaskSpec,
    machines: &BTreeMap<String, StateMachine>,
    poll: Duration,
) -> Signal {
    let Some(machine) = machines.get(&spec.endpoint) else {
        warn!(endpoint = %spec.endpoint, "agent unavailable");
        return Signal::AgentUnavailable;
    };

    if let Err(e) = machine.proxy().put(id, &spec.config).await {
        warn!(container_id = %id, endpoint = %spec.endpoint, error = %e, "PUT failed");
        return Signal::ContainerPutFailed;
    }

    let window = Duration::from_secs(spec.config.grace.startup) + GRACE_SLACK;
    let startup = async {
        loop {
            tokio::time::sleep(poll).await;
            let instance = machine
                .proxy()
                .get(id)
                .await
                .map_err(|e| format!("when making container GET: {e}"))?;
            match instance.status {
                ContainerStatus::Starting => continue,
                ContainerStatus::Running => return Ok(()),
                status => return Err(format!("container status {status}")),
            }
        }
    };

    match tokio::time::timeout(window, startup).await {
        Ok(Ok(())) => Signal::ScheduleSuccessful,
        Ok(Err(reason)) => {
            warn!(container_id = %id, endpoint = %spec.endpoint, %reason, "start failed");
            Signal::ContainerStartFailed
        }
        Err(_) => {
            warn!(
                container_id = %id,
                endpoint = %spec.endpoint,
                startup_secs = spec.config.grace.startup,
                "start timed out"
            );
            Signal::ContainerStartFailed
        }
    }
}

/// Stop, poll until terminated, delete.
async fn unschedule_one(
    id: &str,
    spec: &TaskSpec,
    machines: &BTreeMap<String, StateMachine>,
    poll: Duration,
) -> Signal {
    let Some(machine) = machines.get(&spec.endpoint) else {
        warn!(endpoint = %spec.endpoint, "agent unavailable");
        return Signal::AgentUnavailable;
    };

    if let Err(e) = machine.proxy().stop(id).await {
        warn!(container_id = %id, endpoint = %spec.endpoint, error = %e, "stop failed");
        return Signal::ContainerStopFailed;
    }

    let window = Duration::from_secs(spec.config.grace.shutdown) + GRACE_SLACK;
    let shutdown = async {
        loop {
            tokio::time::sleep(poll).await;
            let instance = machine
                .proxy()
                .get(id)
                .await
                .map_err(|e| format!("when making container GET: {e}"))?;
            match instance.status {
                ContainerStatus::Failed | ContainerStatus::Finished => return Ok::<(), String>(()),
                _ => continue,
            }
        }
    };

    match tokio::time::timeout(window, shutdown).await {
        Ok(Ok(())) => {}
        Ok(Err(reason)) => {
            warn!(container_id = %id, endpoint = %spec.endpoint, %reason, "stop failed");
            return Signal::ContainerStopFailed;
        }
        Err(_) => {
            warn!(
                container_id = %id,
                endpoint = %spec.endpoint,
                shutdown_secs = spec.config.grace.shutdown,
                "stop timed out"
            );
            return Signal::ContainerStopFailed;
        }
    }

    if let Err(e) = machine.proxy().delete(id).await {
        warn!(container_id = %id, endpoint = %spec.endpoint, error = %e, "DELETE failed");
        return Signal::ContainerDeleteFailed;
    }

    Signal::UnscheduleSuccessful
}

/// Reuse surviving machines, construct new ones, and signal every
/// container of a lost machine as lost, exactly once, before stopping
/// it.
async fn migrate_agents(
    machines: &mut BTreeMap<String, StateMachine>,
    incoming: Vec<String>,
    registry: &Arc<Registry>,
    connector: &Arc<dyn AgentConnector>,
) {
    let mut next: BTreeMap<String, StateMachine> = BTreeMap::new();
    for endpoint in incoming {
        match machines.remove(&endpoint) {
            Some(machine) => {
                next.insert(endpoint, machine);
            }
            None => {
                info!(endpoint = %endpoint, "agent discovered");
                let proxy = connector.connect(&endpoint);
                next.insert(endpoint.clone(), StateMachine::new(endpoint, proxy));
            }
        }
    }

    // Whatever remains was lost.
    for (endpoint, machine) in std::mem::take(machines) {
        let instances = machine.container_instances().await;
        warn!(endpoint = %endpoint, containers = instances.len(), "agent lost");
        for id in instances.keys() {
            registry.signal(id, Signal::ContainerLost);
        }
        machine.stop().await;
    }

    *machines = next;
}

async fn collect_agent_states(
    machines: &BTreeMap<String, StateMachine>,
) -> BTreeMap<String, AgentState> {
    let mut states = BTreeMap::new();
    for (endpoint, machine) in machines {
        let (host_resources, resources_dirty) = match machine.proxy().resources().await {
            Ok(resources) => (resources, false),
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "host resources query failed");
                (HostResources::default(), true)
            }
        };
        states.insert(
            endpoint.clone(),
            AgentState {
                dirty: resources_dirty || machine.dirty().await,
                host_resources,
                container_instances: machine.container_instances().await,
            },
        );
    }
    states
}
