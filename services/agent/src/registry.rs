//! The agent's container registry: container id to runloop handle, plus
//! the event fan-out that feeds the HTTP event stream.
//!
//! Every registered container is subscribed to a shared channel; a
//! background task forwards each status change to all currently registered
//! external sinks. Initial subscription state (the full `containers`
//! snapshot) is the API layer's concern; the registry only forwards deltas.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use flotilla_api::{ContainerInstance, Error};

use crate::container::Container;

pub struct Registry {
    containers: Mutex<HashMap<String, Container>>,
    sinks: Arc<Mutex<HashMap<u64, mpsc::Sender<ContainerInstance>>>>,
    next_sink: AtomicU64,
    /// Shared fan-in every container broadcasts into.
    events_tx: mpsc::Sender<ContainerInstance>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        let (events_tx, mut events_rx) = mpsc::channel::<ContainerInstance>(1024);
        let sinks: Arc<Mutex<HashMap<u64, mpsc::Sender<ContainerInstance>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let fanout_sinks = Arc::clone(&sinks);
        tokio::spawn(async move {
            let mut dropped: u64 = 0;
            while let Some(instance) = events_rx.recv().await {
                let mut sinks = fanout_sinks.lock().unwrap();
                sinks.retain(|_, sink| match sink.try_send(instance.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped += 1;
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
            if dropped > 0 {
                debug!(dropped, "event stream sinks missed updates");
            }
        });

        Arc::new(Self {
            containers: Mutex::new(HashMap::new()),
            sinks,
            next_sink: AtomicU64::new(1),
            events_tx,
        })
    }

    /// Register a container under its id. Fails when the id is taken; the
    /// container keeps running and the caller owns the conflict.
    pub async fn register(&self, container: Container) -> Result<(), Error> {
        {
            let mut containers = self.containers.lock().unwrap();
            if containers.contains_key(container.id()) {
                return Err(Error::Conflict(format!(
                    "container {} already exists",
                    container.id()
                )));
            }
            containers.insert(container.id().to_string(), container.clone());
        }

        // Feed this container's status changes into the shared fan-out.
        container.subscribe(self.events_tx.clone()).await?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Container> {
        self.containers.lock().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        self.containers.lock().unwrap().remove(id);
    }

    pub fn len(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.lock().unwrap().is_empty()
    }

    /// Snapshot of every registered container's current state.
    pub async fn instances(&self) -> Vec<ContainerInstance> {
        let containers: Vec<Container> = self.containers.lock().unwrap().values().cloned().collect();
        let mut instances = Vec::with_capacity(containers.len());
        for container in containers {
            // A container destroyed between snapshot and query is skipped.
            if let Ok(instance) = container.instance().await {
                instances.push(instance);
            }
        }
        instances
    }

    /// Subscribe a sink to all subsequent container status changes.
    pub fn notify(&self, sink: mpsc::Sender<ContainerInstance>) -> u64 {
        let id = self.next_sink.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().unwrap().insert(id, sink);
        id
    }

    /// Remove an event sink.
    pub fn stop(&self, subscription: u64) {
        self.sinks.lock().unwrap().remove(&subscription);
    }
}
