//! The desired-state registry.
//!
//! Written to by the scheduler (intents), driven forward by the
//! transformer (signals), observed by anyone who subscribes to snapshots.
//! A container id lives in at most one of the three maps at any time;
//! signals move it between them and out.
//!
//! Scheduling and unscheduling are supported directly; migrations are the
//! scheduler's business, built from schedule-1/unschedule-1 with an undo
//! stack.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use flotilla_api::{ContainerConfig, Error};

/// Placement of a single container instance.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub endpoint: String,
    pub config: ContainerConfig,
}

/// One immutable snapshot of the registry. Broadcast after every mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryState {
    pub pending_schedule: BTreeMap<String, TaskSpec>,
    pub scheduled: BTreeMap<String, TaskSpec>,
    pub pending_unschedule: BTreeMap<String, TaskSpec>,
}

/// Terminal outcome of an agent-side maneuver, delivered by the
/// transformer to drive a registry transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    ScheduleSuccessful,
    ScheduleFailed,
    UnscheduleSuccessful,
    UnscheduleFailed,
    ContainerLost,
    AgentUnavailable,
    ContainerPutFailed,
    ContainerStartFailed,
    ContainerStopFailed,
    ContainerDeleteFailed,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Signal::ScheduleSuccessful => "schedule-successful",
            Signal::ScheduleFailed => "schedule-failed",
            Signal::UnscheduleSuccessful => "unschedule-successful",
            Signal::UnscheduleFailed => "unschedule-failed",
            Signal::ContainerLost => "container-lost",
            Signal::AgentUnavailable => "agent-unavailable",
            Signal::ContainerPutFailed => "container-put-failed",
            Signal::ContainerStartFailed => "container-start-failed",
            Signal::ContainerStopFailed => "container-stop-failed",
            Signal::ContainerDeleteFailed => "container-delete-failed",
        };
        write!(f, "{name}")
    }
}

/// A signal plus a line of human-readable context, forwarded to the ack
/// channel registered with the intent.
#[derive(Debug)]
pub struct SignalWithContext {
    pub signal: Signal,
    pub context: String,
}

pub type Ack = oneshot::Sender<SignalWithContext>;

pub struct Registry {
    inner: Mutex<Inner>,
}

struct Inner {
    pending_schedule: BTreeMap<String, TaskSpec>,
    scheduled: BTreeMap<String, TaskSpec>,
    pending_unschedule: BTreeMap<String, TaskSpec>,
    acks: HashMap<String, Ack>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<RegistryState>>,
    next_subscription: u64,
    /// Receives specs lost by failed agents, under the assumption somebody
    /// re-schedules them.
    lost: Option<mpsc::UnboundedSender<(String, TaskSpec)>>,
}

impl Registry {
    pub fn new(lost: Option<mpsc::UnboundedSender<(String, TaskSpec)>>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                pending_schedule: BTreeMap::new(),
                scheduled: BTreeMap::new(),
                pending_unschedule: BTreeMap::new(),
                acks: HashMap::new(),
                subscribers: HashMap::new(),
                next_subscription: 1,
                lost,
            }),
        })
    }

    /// Record the intent to schedule. Valid only when the id is absent from
    /// every map. The ack, if any, receives the terminal signal of the
    /// maneuver exactly once.
    pub fn schedule(&self, id: &str, spec: TaskSpec, ack: Option<Ack>) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();

        if id.is_empty() {
            return Err(Error::InvalidInput("invalid container ID".to_string()));
        }
        if inner.pending_schedule.contains_key(id) {
            return Err(Error::Conflict(format!("{id} already pending schedule")));
        }
        if inner.scheduled.contains_key(id) {
            return Err(Error::Conflict(format!("{id} already scheduled")));
        }
        if inner.pending_unschedule.contains_key(id) {
            return Err(Error::Conflict(format!("{id} is pending unschedule")));
        }
        assert!(
            !inner.acks.contains_key(id),
            "{id} has a registered ack but isn't present in any state map"
        );

        inner.pending_schedule.insert(id.to_string(), spec);
        if let Some(ack) = ack {
            inner.acks.insert(id.to_string(), ack);
        }

        inner.broadcast();
        Ok(())
    }

    /// Record the intent to unschedule. Valid only when the id is
    /// currently scheduled.
    pub fn unschedule(&self, id: &str, spec: TaskSpec, ack: Option<Ack>) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();

        if id.is_empty() {
            return Err(Error::InvalidInput("invalid container ID".to_string()));
        }
        if inner.pending_schedule.contains_key(id) {
            return Err(Error::Conflict(format!("{id} is pending schedule")));
        }
        if inner.pending_unschedule.contains_key(id) {
            return Err(Error::Conflict(format!("{id} is already pending unschedule")));
        }
        if !inner.scheduled.contains_key(id) {
            return Err(Error::NotFound(format!("{id} isn't scheduled")));
        }
        assert!(
            !inner.acks.contains_key(id),
            "{id} has a registered ack but isn't present in any state map"
        );

        inner.scheduled.remove(id);
        inner.pending_unschedule.insert(id.to_string(), spec);
        if let Some(ack) = ack {
            inner.acks.insert(id.to_string(), ack);
        }

        inner.broadcast();
        Ok(())
    }

    /// Apply the outcome of an agent-side maneuver. A signal whose required
    /// source state does not hold is a programming error, except for
    /// `container-lost`, which can legitimately race a completed
    /// unschedule and is ignored.
    pub fn signal(&self, id: &str, signal: Signal) {
        let mut inner = self.inner.lock().unwrap();

        let context = match signal {
            Signal::ScheduleSuccessful => {
                let spec = inner
                    .pending_schedule
                    .remove(id)
                    .expect("schedule-successful for a container not pending schedule");
                let endpoint = spec.endpoint.clone();
                inner.scheduled.insert(id.to_string(), spec);
                format!("{id} pending-schedule -> scheduled: OK, on {endpoint}")
            }

            Signal::ScheduleFailed => {
                let spec = inner
                    .pending_schedule
                    .remove(id)
                    .expect("schedule-failed for a container not pending schedule");
                format!("{id} pending-schedule -> (deleted): schedule failed on {}", spec.endpoint)
            }

            Signal::UnscheduleSuccessful => {
                inner
                    .pending_unschedule
                    .remove(id)
                    .expect("unschedule-successful for a container not pending unschedule");
                format!("{id} pending-unschedule -> (deleted): OK")
            }

            Signal::UnscheduleFailed => {
                let spec = inner
                    .pending_unschedule
                    .remove(id)
                    .expect("unschedule-failed for a container not pending unschedule");
                let endpoint = spec.endpoint.clone();
                inner.scheduled.insert(id.to_string(), spec);
                format!("{id} pending-unschedule -> scheduled: unschedule failed on {endpoint}")
            }

            Signal::ContainerLost => match inner.scheduled.remove(id) {
                Some(spec) => {
                    let endpoint = spec.endpoint.clone();
                    if let Some(lost) = &inner.lost {
                        let _ = lost.send((id.to_string(), spec));
                    }
                    format!("{id} LOST -> abandoned, on {endpoint}")
                }
                None => {
                    warn!(container_id = %id, "lost container wasn't known to be scheduled; ignoring");
                    return;
                }
            },

            Signal::AgentUnavailable => {
                if let Some(spec) = inner.pending_schedule.remove(id) {
                    format!("{id} pending-schedule -> (deleted): agent {} unavailable", spec.endpoint)
                } else if let Some(spec) = inner.pending_unschedule.remove(id) {
                    format!("{id} pending-unschedule -> (deleted): agent {} unavailable", spec.endpoint)
                } else {
                    panic!("agent-unavailable for a container not mid-maneuver");
                }
            }

            Signal::ContainerPutFailed => {
                let spec = inner
                    .pending_schedule
                    .remove(id)
                    .expect("container-put-failed for a container not pending schedule");
                format!("{id} pending-schedule -> (deleted): container PUT failed on {}", spec.endpoint)
            }

            Signal::ContainerStartFailed => {
                let spec = inner
                    .pending_schedule
                    .remove(id)
                    .expect("container-start-failed for a container not pending schedule");
                format!("{id} pending-schedule -> (deleted): container start failed on {}", spec.endpoint)
            }

            Signal::ContainerStopFailed => {
                // A failed stop means the container presumably still runs;
                // require another operator action to move it again.
                let spec = inner
                    .pending_unschedule
                    .remove(id)
                    .expect("container-stop-failed for a container not pending unschedule");
                let endpoint = spec.endpoint.clone();
                inner.scheduled.insert(id.to_string(), spec);
                format!("{id} pending-unschedule -> scheduled: container stop failed on {endpoint}")
            }

            Signal::ContainerDeleteFailed => {
                // A failed delete leaves an orphan on the agent, which we
                // tolerate.
                let spec = inner
                    .pending_unschedule
                    .remove(id)
                    .expect("container-delete-failed for a container not pending unschedule");
                format!("{id} pending-unschedule -> (deleted): OK, but delete failed on {}", spec.endpoint)
            }
        };

        inner.broadcast();

        // Every signal terminates the maneuver, so the ack is consumed.
        if let Some(ack) = inner.acks.remove(id) {
            let _ = ack.send(SignalWithContext {
                signal,
                context: context.clone(),
            });
        }

        info!(container_id = %id, signal = %signal, "{context}");
    }

    /// Subscribe to registry snapshots. The current snapshot is delivered
    /// immediately, so subscribe-then-read observes a consistent
    /// serialization point.
    pub fn notify(&self, sink: mpsc::UnboundedSender<RegistryState>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let snapshot = inner.snapshot();
        let _ = sink.send(snapshot);
        let id = inner.next_subscription;
        inner.next_subscription += 1;
        inner.subscribers.insert(id, sink);
        id
    }

    /// Drop a snapshot subscription.
    pub fn stop(&self, subscription: u64) {
        self.inner.lock().unwrap().subscribers.remove(&subscription);
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> RegistryState {
        self.inner.lock().unwrap().snapshot()
    }
}

impl Inner {
    fn snapshot(&self) -> RegistryState {
        RegistryState {
            pending_schedule: self.pending_schedule.clone(),
            scheduled: self.scheduled.clone(),
            pending_unschedule: self.pending_unschedule.clone(),
        }
    }

    /// Every mutation produces exactly one broadcast. Sends are unbounded
    /// so the registry lock is never held against a slow subscriber;
    /// subscribers coalesce on their side.
    fn broadcast(&mut self) {
        let snapshot = self.snapshot();
        self.subscribers
            .retain(|_, sink| sink.send(snapshot.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(endpoint: &str) -> TaskSpec {
        TaskSpec {
            endpoint: endpoint.to_string(),
            config: ContainerConfig::default(),
        }
    }

    fn ack() -> (Ack, oneshot::Receiver<SignalWithContext>) {
        oneshot::channel()
    }

    #[tokio::test]
    async fn schedule_signal_unschedule_signal_round_trips_to_empty() {
        let registry = Registry::new(None);
        let initial = registry.snapshot();

        registry.schedule("c1", spec("agent-1"), None).unwrap();
        registry.signal("c1", Signal::ScheduleSuccessful);
        assert!(registry.snapshot().scheduled.contains_key("c1"));

        registry.unschedule("c1", spec("agent-1"), None).unwrap();
        registry.signal("c1", Signal::UnscheduleSuccessful);

        assert_eq!(registry.snapshot(), initial);
    }

    #[tokio::test]
    async fn id_lives_in_at_most_one_map() {
        let registry = Registry::new(None);
        registry.schedule("c1", spec("agent-1"), None).unwrap();

        let state = registry.snapshot();
        assert!(state.pending_schedule.contains_key("c1"));
        assert!(!state.scheduled.contains_key("c1"));
        assert!(!state.pending_unschedule.contains_key("c1"));

        registry.signal("c1", Signal::ScheduleSuccessful);
        let state = registry.snapshot();
        assert!(!state.pending_schedule.contains_key("c1"));
        assert!(state.scheduled.contains_key("c1"));

        registry.unschedule("c1", spec("agent-1"), None).unwrap();
        let state = registry.snapshot();
        assert!(!state.scheduled.contains_key("c1"));
        assert!(state.pending_unschedule.contains_key("c1"));
    }

    #[tokio::test]
    async fn double_schedule_is_a_conflict() {
        let registry = Registry::new(None);
        registry.schedule("c1", spec("agent-1"), None).unwrap();
        assert!(matches!(
            registry.schedule("c1", spec("agent-1"), None),
            Err(Error::Conflict(_))
        ));

        registry.signal("c1", Signal::ScheduleSuccessful);
        assert!(matches!(
            registry.schedule("c1", spec("agent-1"), None),
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn unschedule_requires_scheduled() {
        let registry = Registry::new(None);
        assert!(registry.unschedule("nope", spec("agent-1"), None).is_err());

        registry.schedule("c1", spec("agent-1"), None).unwrap();
        // Pending-schedule is not scheduled.
        assert!(registry.unschedule("c1", spec("agent-1"), None).is_err());
    }

    #[tokio::test]
    async fn ack_receives_exactly_one_terminal_signal() {
        let registry = Registry::new(None);
        let (tx, rx) = ack();

        registry.schedule("c1", spec("agent-1"), Some(tx)).unwrap();
        registry.signal("c1", Signal::ScheduleSuccessful);

        let received = rx.await.unwrap();
        assert_eq!(received.signal, Signal::ScheduleSuccessful);
        assert!(received.context.contains("agent-1"));
        // The sender side is consumed; nothing further can arrive.
    }

    #[tokio::test]
    async fn stop_failed_restores_scheduled() {
        let registry = Registry::new(None);
        registry.schedule("c1", spec("agent-1"), None).unwrap();
        registry.signal("c1", Signal::ScheduleSuccessful);
        registry.unschedule("c1", spec("agent-1"), None).unwrap();

        registry.signal("c1", Signal::ContainerStopFailed);
        assert!(registry.snapshot().scheduled.contains_key("c1"));
    }

    #[tokio::test]
    async fn delete_failed_tolerates_the_orphan() {
        let registry = Registry::new(None);
        registry.schedule("c1", spec("agent-1"), None).unwrap();
        registry.signal("c1", Signal::ScheduleSuccessful);
        registry.unschedule("c1", spec("agent-1"), None).unwrap();

        registry.signal("c1", Signal::ContainerDeleteFailed);
        let state = registry.snapshot();
        assert!(state.scheduled.is_empty());
        assert!(state.pending_unschedule.is_empty());
    }

    #[tokio::test]
    async fn lost_container_is_pushed_for_rescheduling() {
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
        let registry = Registry::new(Some(lost_tx));

        registry.schedule("c1", spec("agent-1"), None).unwrap();
        registry.signal("c1", Signal::ScheduleSuccessful);
        registry.signal("c1", Signal::ContainerLost);

        let (id, lost_spec) = lost_rx.recv().await.unwrap();
        assert_eq!(id, "c1");
        assert_eq!(lost_spec.endpoint, "agent-1");
        assert!(registry.snapshot().scheduled.is_empty());
    }

    #[tokio::test]
    async fn lost_for_unknown_container_is_ignored() {
        let registry = Registry::new(None);
        // Does not panic; the signal races a completed unschedule.
        registry.signal("ghost", Signal::ContainerLost);
    }

    #[tokio::test]
    async fn agent_unavailable_abandons_either_maneuver() {
        let registry = Registry::new(None);

        registry.schedule("c1", spec("agent-1"), None).unwrap();
        registry.signal("c1", Signal::AgentUnavailable);
        assert!(registry.snapshot().pending_schedule.is_empty());

        registry.schedule("c2", spec("agent-1"), None).unwrap();
        registry.signal("c2", Signal::ScheduleSuccessful);
        registry.unschedule("c2", spec("agent-1"), None).unwrap();
        registry.signal("c2", Signal::AgentUnavailable);
        let state = registry.snapshot();
        assert!(state.pending_unschedule.is_empty());
        assert!(state.scheduled.is_empty());
    }

    #[tokio::test]
    async fn every_mutation_broadcasts_one_snapshot() {
        let registry = Registry::new(None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.notify(tx);

        // Subscription delivers the current state immediately.
        assert_eq!(rx.recv().await.unwrap(), RegistryState::default());

        registry.schedule("c1", spec("agent-1"), None).unwrap();
        let snapshot = rx.recv().await.unwrap();
        assert!(snapshot.pending_schedule.contains_key("c1"));

        registry.signal("c1", Signal::ScheduleSuccessful);
        let snapshot = rx.recv().await.unwrap();
        assert!(snapshot.scheduled.contains_key("c1"));
        assert!(snapshot.pending_schedule.is_empty());
    }

    #[test]
    #[should_panic]
    fn signal_with_wrong_source_state_panics() {
        let registry = Registry::new(None);
        registry.signal("ghost", Signal::ScheduleSuccessful);
    }
}
