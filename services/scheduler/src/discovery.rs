//! Agent discovery: where the transformer learns the set of endpoints.

use tokio::sync::watch;

/// Produces the current endpoint list and notifies on change.
pub trait AgentDiscovery: Send + Sync + 'static {
    fn endpoints(&self) -> Vec<String>;
    fn subscribe(&self) -> watch::Receiver<Vec<String>>;
}

/// A fixed (but settable) endpoint list, wired from configuration. Also
/// what tests use to simulate agents joining and leaving.
pub struct StaticDiscovery {
    tx: watch::Sender<Vec<String>>,
}

impl StaticDiscovery {
    pub fn new(endpoints: Vec<String>) -> Self {
        let (tx, _) = watch::channel(endpoints);
        Self { tx }
    }

    /// Replace the endpoint list and notify subscribers.
    pub fn set_endpoints(&self, endpoints: Vec<String>) {
        let _ = self.tx.send(endpoints);
    }
}

impl AgentDiscovery for StaticDiscovery {
    fn endpoints(&self) -> Vec<String> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.tx.subscribe()
    }
}
