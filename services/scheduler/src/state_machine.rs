//! The scheduler's view of one remote agent.
//!
//! A runloop per endpoint consumes the agent's event stream and rewrites a
//! local instance map: `starting` and `running` upsert, terminal statuses
//! remove. The first batch after every (re)connect is the agent's full
//! snapshot and replaces the map wholesale.
//!
//! `dirty` means the view cannot be trusted: set while the stream is down,
//! cleared by the snapshot that opens the next subscription. Scheduling
//! algorithms skip dirty agents.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use flotilla_api::{ContainerInstance, ContainerStatus};

use crate::proxy::{AgentApi, AgentEvent, EventStream};

const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(15);

enum Query {
    Instances(oneshot::Sender<BTreeMap<String, ContainerInstance>>),
    Dirty(oneshot::Sender<bool>),
    Stop(oneshot::Sender<()>),
}

/// Handle to one agent's state machine runloop.
#[derive(Clone)]
pub struct StateMachine {
    endpoint: String,
    proxy: Arc<dyn AgentApi>,
    tx: mpsc::Sender<Query>,
}

impl StateMachine {
    pub fn new(endpoint: impl Into<String>, proxy: Arc<dyn AgentApi>) -> Self {
        let endpoint = endpoint.into();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run(endpoint.clone(), proxy.clone(), rx));
        Self { endpoint, proxy, tx }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The REST client for commanding this agent.
    pub fn proxy(&self) -> Arc<dyn AgentApi> {
        self.proxy.clone()
    }

    /// The current instance map. Empty after stop.
    pub async fn container_instances(&self) -> BTreeMap<String, ContainerInstance> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Query::Instances(reply)).await.is_err() {
            return BTreeMap::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Whether the current view can be trusted.
    pub async fn dirty(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Query::Dirty(reply)).await.is_err() {
            return true;
        }
        rx.await.unwrap_or(true)
    }

    /// Terminate the runloop and its event stream.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Query::Stop(reply)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run(endpoint: String, proxy: Arc<dyn AgentApi>, mut rx: mpsc::Receiver<Query>) {
    let mut instances: BTreeMap<String, ContainerInstance> = BTreeMap::new();
    // Trust is earned by the first full snapshot.
    let mut dirty = true;
    let mut stream: Option<EventStream> = None;
    let mut reconnect_delay = Duration::ZERO;

    loop {
        tokio::select! {
            query = rx.recv() => match query {
                Some(Query::Instances(reply)) => {
                    let _ = reply.send(instances.clone());
                }
                Some(Query::Dirty(reply)) => {
                    let _ = reply.send(dirty);
                }
                Some(Query::Stop(reply)) => {
                    let _ = reply.send(());
                    return;
                }
                None => return,
            },

            event = recv_event(&mut stream), if stream.is_some() => match event {
                Some(AgentEvent::Snapshot(batch)) => {
                    debug!(endpoint = %endpoint, instances = batch.len(), "full state update");
                    instances.clear();
                    for instance in batch {
                        apply(&endpoint, &mut instances, instance);
                    }
                    dirty = false;
                }
                Some(AgentEvent::Delta(instance)) => {
                    // A delta racing ahead of the opening snapshot is
                    // harmless: the snapshot that follows overwrites the
                    // whole map.
                    apply(&endpoint, &mut instances, instance);
                }
                None => {
                    warn!(endpoint = %endpoint, "event stream disconnected");
                    dirty = true;
                    stream = None;
                    reconnect_delay = Duration::ZERO;
                }
            },

            _ = tokio::time::sleep(reconnect_delay), if stream.is_none() => {
                match proxy.events().await {
                    Ok(subscription) => {
                        info!(endpoint = %endpoint, "event stream connected");
                        stream = Some(subscription);
                    }
                    Err(e) => {
                        debug!(endpoint = %endpoint, error = %e, "event stream connect failed");
                        reconnect_delay = next_delay(reconnect_delay);
                    }
                }
            }
        }
    }
}

async fn recv_event(stream: &mut Option<EventStream>) -> Option<AgentEvent> {
    match stream {
        Some(stream) => stream.recv().await,
        // Guarded out by the select condition.
        None => std::future::pending().await,
    }
}

fn apply(
    endpoint: &str,
    instances: &mut BTreeMap<String, ContainerInstance>,
    instance: ContainerInstance,
) {
    match instance.status {
        ContainerStatus::Starting | ContainerStatus::Running => {
            debug!(endpoint = %endpoint, container_id = %instance.id, status = %instance.status, "adding");
            instances.insert(instance.id.clone(), instance);
        }
        ContainerStatus::Finished | ContainerStatus::Failed | ContainerStatus::Deleted => {
            debug!(endpoint = %endpoint, container_id = %instance.id, status = %instance.status, "removing");
            instances.remove(&instance.id);
        }
    }
}

fn next_delay(current: Duration) -> Duration {
    if current.is_zero() {
        RECONNECT_BASE
    } else {
        (current * 2).min(RECONNECT_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use flotilla_api::ContainerConfig;

    use crate::proxy::InMemoryAgent;

    async fn settled(machine: &StateMachine, want: usize) -> BTreeMap<String, ContainerInstance> {
        for _ in 0..100 {
            let instances = machine.container_instances().await;
            if instances.len() == want {
                return instances;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("state machine never settled at {want} instances");
    }

    #[tokio::test]
    async fn snapshot_clears_dirty_and_seeds_the_map() {
        let agent = InMemoryAgent::new();
        agent.put("c1", &ContainerConfig::default()).await.unwrap();

        let machine = StateMachine::new("agent-1", Arc::new(agent));
        let instances = settled(&machine, 1).await;
        assert!(instances.contains_key("c1"));
        assert!(!machine.dirty().await);

        machine.stop().await;
    }

    #[tokio::test]
    async fn terminal_statuses_remove_instances() {
        let agent = InMemoryAgent::new();
        agent.put("c1", &ContainerConfig::default()).await.unwrap();
        agent.put("c2", &ContainerConfig::default()).await.unwrap();

        let machine = StateMachine::new("agent-1", Arc::new(agent.clone()));
        settled(&machine, 2).await;

        agent.set_status("c1", ContainerStatus::Failed);
        let instances = settled(&machine, 1).await;
        assert!(!instances.contains_key("c1"));
        assert!(instances.contains_key("c2"));

        machine.stop().await;
    }

    #[tokio::test]
    async fn disconnect_marks_dirty_and_reconnect_reconciles() {
        let agent = InMemoryAgent::new();
        agent.put("c1", &ContainerConfig::default()).await.unwrap();

        let machine = StateMachine::new("agent-1", Arc::new(agent.clone()));
        settled(&machine, 1).await;

        // Partition: the stream drops, and a container appears while the
        // scheduler isn't looking.
        agent.disconnect_streams();
        agent.put("c2", &ContainerConfig::default()).await.unwrap();

        // The machine reconnects on its own; the opening snapshot carries
        // the missed container and restores trust.
        let instances = settled(&machine, 2).await;
        assert!(instances.contains_key("c2"));
        assert!(!machine.dirty().await);

        machine.stop().await;
    }

    #[tokio::test]
    async fn queries_survive_a_stopped_runloop() {
        let agent = InMemoryAgent::new();
        let machine = StateMachine::new("agent-1", Arc::new(agent));
        machine.stop().await;

        assert!(machine.dirty().await);
        assert!(machine.container_instances().await.is_empty());
    }
}
