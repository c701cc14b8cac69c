//! Typed client for the agent REST surface.
//!
//! `RemoteAgent` speaks the `/api/v0` wire protocol; `AgentApi` is the seam
//! the rest of the scheduler programs against, so the transformer and the
//! agent state machines are testable against `InMemoryAgent` without a
//! network.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use flotilla_api::{
    ContainerConfig, ContainerInstance, ContainerStatus, Error, HostResources,
    API_VERSION_PREFIX, CONTAINERS_EVENT, CONTAINER_EVENT,
};

/// One message on an agent event stream.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The agent's complete state. Opens every subscription.
    Snapshot(Vec<ContainerInstance>),
    /// One instance changed.
    Delta(ContainerInstance),
}

/// A live event-stream subscription. Dropping it ends the stream.
pub struct EventStream {
    rx: mpsc::Receiver<AgentEvent>,
}

impl EventStream {
    pub fn new(rx: mpsc::Receiver<AgentEvent>) -> Self {
        Self { rx }
    }

    /// The next event, or None when the stream has disconnected.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }
}

/// The agent API from the scheduler's point of view.
#[async_trait]
pub trait AgentApi: Send + Sync + 'static {
    async fn put(&self, id: &str, config: &ContainerConfig) -> Result<(), Error>;
    async fn get(&self, id: &str) -> Result<ContainerInstance, Error>;
    async fn start(&self, id: &str) -> Result<(), Error>;
    async fn stop(&self, id: &str) -> Result<(), Error>;
    async fn restart(&self, id: &str) -> Result<(), Error>;
    async fn delete(&self, id: &str) -> Result<(), Error>;
    async fn containers(&self) -> Result<Vec<ContainerInstance>, Error>;
    async fn resources(&self) -> Result<HostResources, Error>;
    async fn events(&self) -> Result<EventStream, Error>;
    /// The last `history` log lines of one container, oldest first.
    async fn log(&self, id: &str, history: usize) -> Result<Vec<String>, Error>;
}

/// REST client for one remote agent endpoint.
pub struct RemoteAgent {
    endpoint: String,
    base: String,
    client: reqwest::Client,
}

impl RemoteAgent {
    pub fn new(endpoint: &str) -> Self {
        let base = if endpoint.contains("://") {
            format!("{endpoint}{API_VERSION_PREFIX}")
        } else {
            format!("http://{endpoint}{API_VERSION_PREFIX}")
        };
        Self {
            endpoint: endpoint.to_string(),
            base,
            client: reqwest::Client::new(),
        }
    }

    fn unavailable(&self, e: reqwest::Error) -> Error {
        Error::AgentUnavailable(format!("{}: {e}", self.endpoint))
    }

    /// Fold a non-2xx response into the shared taxonomy.
    async fn error_for(&self, response: reqwest::Response) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail = format!("{}: HTTP {status}: {body}", self.endpoint);
        match status.as_u16() {
            400 => Error::InvalidInput(detail),
            404 => Error::NotFound(detail),
            409 => Error::Conflict(detail),
            _ => Error::RuntimeFailure(detail),
        }
    }

    async fn expect_success(&self, response: reqwest::Response) -> Result<(), Error> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.error_for(response).await)
        }
    }

    async fn post_action(&self, id: &str, action: &str) -> Result<(), Error> {
        let response = self
            .client
            .post(format!("{}/containers/{id}/{action}", self.base))
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        self.expect_success(response).await
    }
}

#[async_trait]
impl AgentApi for RemoteAgent {
    async fn put(&self, id: &str, config: &ContainerConfig) -> Result<(), Error> {
        let response = self
            .client
            .put(format!("{}/containers/{id}", self.base))
            .json(config)
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        self.expect_success(response).await
    }

    async fn get(&self, id: &str) -> Result<ContainerInstance, Error> {
        let response = self
            .client
            .get(format!("{}/containers/{id}", self.base))
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        if !response.status().is_success() {
            return Err(self.error_for(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| Error::RuntimeFailure(format!("{}: invalid agent response: {e}", self.endpoint)))
    }

    async fn start(&self, id: &str) -> Result<(), Error> {
        self.post_action(id, "start").await
    }

    async fn stop(&self, id: &str) -> Result<(), Error> {
        self.post_action(id, "stop").await
    }

    async fn restart(&self, id: &str) -> Result<(), Error> {
        self.post_action(id, "restart").await
    }

    async fn delete(&self, id: &str) -> Result<(), Error> {
        let response = self
            .client
            .delete(format!("{}/containers/{id}", self.base))
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        self.expect_success(response).await
    }

    async fn containers(&self) -> Result<Vec<ContainerInstance>, Error> {
        let response = self
            .client
            .get(format!("{}/containers", self.base))
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        if !response.status().is_success() {
            return Err(self.error_for(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| Error::RuntimeFailure(format!("{}: invalid agent response: {e}", self.endpoint)))
    }

    async fn resources(&self) -> Result<HostResources, Error> {
        let response = self
            .client
            .get(format!("{}/resources", self.base))
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        if !response.status().is_success() {
            return Err(self.error_for(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| Error::RuntimeFailure(format!("{}: invalid agent response: {e}", self.endpoint)))
    }

    async fn log(&self, id: &str, history: usize) -> Result<Vec<String>, Error> {
        let response = self
            .client
            .get(format!("{}/containers/{id}/log", self.base))
            .query(&[("history", history)])
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        if !response.status().is_success() {
            return Err(self.error_for(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| Error::RuntimeFailure(format!("{}: invalid agent response: {e}", self.endpoint)))
    }

    async fn events(&self) -> Result<EventStream, Error> {
        let response = self
            .client
            .get(format!("{}/containers", self.base))
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        if !response.status().is_success() {
            return Err(self.error_for(response).await);
        }

        let (tx, rx) = mpsc::channel(64);
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "event stream read failed");
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // Frames are separated by a blank line.
                while let Some(boundary) = buffer.find("\n\n") {
                    let frame: String = buffer.drain(..boundary + 2).collect();
                    let Some(event) = parse_sse_frame(&frame) else {
                        continue;
                    };
                    if tx.send(event).await.is_err() {
                        // Receiver gone: the subscription was stopped.
                        return;
                    }
                }
            }
            debug!(endpoint = %endpoint, "event stream closed");
        });

        Ok(EventStream::new(rx))
    }
}

/// Decode one SSE frame into an agent event. Comment frames and unknown
/// event names yield None.
fn parse_sse_frame(frame: &str) -> Option<AgentEvent> {
    let mut event_name = "";
    let mut data = String::new();
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event_name = rest.trim();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push_str(rest.trim_start());
        }
    }

    match event_name {
        CONTAINERS_EVENT => serde_json::from_str(&data).ok().map(AgentEvent::Snapshot),
        CONTAINER_EVENT => serde_json::from_str(&data).ok().map(AgentEvent::Delta),
        _ => None,
    }
}

// =============================================================================
// In-memory agent
// =============================================================================

/// A whole agent behind the `AgentApi` trait, for tests: containers go
/// `starting` on PUT, flip to the configured status on the first GET, and
/// finish on stop. Event subscribers get the snapshot-then-deltas contract
/// of the real stream.
#[derive(Clone, Default)]
pub struct InMemoryAgent {
    inner: Arc<Mutex<InMemoryState>>,
}

#[derive(Default)]
struct InMemoryState {
    instances: BTreeMap<String, ContainerInstance>,
    subscribers: Vec<mpsc::Sender<AgentEvent>>,
    /// Status a container lands in after PUT; `Running` by default.
    put_status: Option<ContainerStatus>,
    /// Fail the nth PUT (0-based across the agent's lifetime), once.
    fail_put_at: Option<usize>,
    puts_seen: usize,
    fail_stops: bool,
    fail_deletes: bool,
}

impl InMemoryAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Containers put after this call land in `status` instead of running.
    pub fn put_lands_in(&self, status: ContainerStatus) {
        self.inner.lock().unwrap().put_status = Some(status);
    }

    /// Fail the nth PUT (0-based), once.
    pub fn fail_put_at(&self, n: usize) {
        self.inner.lock().unwrap().fail_put_at = Some(n);
    }

    pub fn fail_stops(&self, fail: bool) {
        self.inner.lock().unwrap().fail_stops = fail;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_deletes = fail;
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().instances.keys().cloned().collect()
    }

    /// Drop every live event stream, as a network partition would.
    pub fn disconnect_streams(&self) {
        self.inner.lock().unwrap().subscribers.clear();
    }

    /// Flip a container's status and broadcast the change, as an agent
    /// would after a supervisor heartbeat.
    pub fn set_status(&self, id: &str, status: ContainerStatus) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(instance) = inner.instances.get_mut(id) {
            instance.status = status;
            let instance = instance.clone();
            inner.publish(instance);
        }
    }
}

impl InMemoryState {
    fn publish(&mut self, instance: ContainerInstance) {
        self.subscribers
            .retain(|sink| sink.try_send(AgentEvent::Delta(instance.clone())).is_ok());
    }
}

#[async_trait]
impl AgentApi for InMemoryAgent {
    async fn put(&self, id: &str, config: &ContainerConfig) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();

        if inner.instances.contains_key(id) {
            return Err(Error::Conflict(format!("container {id} already exists")));
        }

        // Only fresh puts count toward the induced-failure index, so a
        // redundant re-PUT (the transformer acting on a view that lags the
        // agent) can't shift it.
        let n = inner.puts_seen;
        inner.puts_seen += 1;
        if inner.fail_put_at == Some(n) {
            inner.fail_put_at = None;
            return Err(Error::RuntimeFailure(format!("induced PUT failure for {id}")));
        }

        let status = inner.put_status.unwrap_or(ContainerStatus::Running);
        let instance = ContainerInstance {
            id: id.to_string(),
            status,
            config: config.clone(),
        };
        inner.instances.insert(id.to_string(), instance.clone());
        inner.publish(instance);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<ContainerInstance, Error> {
        self.inner
            .lock()
            .unwrap()
            .instances
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("container {id} unknown")))
    }

    async fn start(&self, _id: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_stops {
            return Err(Error::RuntimeFailure(format!("induced stop failure for {id}")));
        }
        let Some(instance) = inner.instances.get_mut(id) else {
            return Err(Error::NotFound(format!("container {id} unknown")));
        };
        instance.status = ContainerStatus::Finished;
        let instance = instance.clone();
        inner.publish(instance);
        Ok(())
    }

    async fn restart(&self, _id: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_deletes {
            return Err(Error::RuntimeFailure(format!("induced delete failure for {id}")));
        }
        let Some(mut instance) = inner.instances.remove(id) else {
            return Err(Error::NotFound(format!("container {id} unknown")));
        };
        instance.status = ContainerStatus::Deleted;
        inner.publish(instance);
        Ok(())
    }

    async fn containers(&self) -> Result<Vec<ContainerInstance>, Error> {
        Ok(self.inner.lock().unwrap().instances.values().cloned().collect())
    }

    async fn resources(&self) -> Result<HostResources, Error> {
        Ok(HostResources::default())
    }

    async fn events(&self) -> Result<EventStream, Error> {
        let (tx, rx) = mpsc::channel(64);
        let mut inner = self.inner.lock().unwrap();
        let snapshot: Vec<ContainerInstance> = inner.instances.values().cloned().collect();
        let _ = tx.try_send(AgentEvent::Snapshot(snapshot));
        inner.subscribers.push(tx);
        Ok(EventStream::new(rx))
    }

    async fn log(&self, _id: &str, _history: usize) -> Result<Vec<String>, Error> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_frame_parses_named_events() {
        let frame = "event: container\ndata: {\"container_id\":\"c1\",\"status\":\"running\",\"config\":{\"job_name\":\"\",\"task_name\":\"\",\"artifact_url\":\"\",\"ports\":{},\"env\":{},\"command\":{\"working_dir\":\"\",\"exec\":[]},\"resources\":{\"mem\":0,\"cpus\":0.0},\"storage\":{\"tmp\":{},\"volumes\":{}},\"grace\":{\"startup\":0,\"shutdown\":0}}}\n\n";
        match parse_sse_frame(frame) {
            Some(AgentEvent::Delta(instance)) => {
                assert_eq!(instance.id, "c1");
                assert_eq!(instance.status, ContainerStatus::Running);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn sse_comment_frames_are_skipped() {
        assert!(parse_sse_frame(": keep-alive\n\n").is_none());
    }

    #[tokio::test]
    async fn in_memory_agent_streams_snapshot_then_deltas() {
        let agent = InMemoryAgent::new();
        agent
            .put("c1", &ContainerConfig::default())
            .await
            .unwrap();

        let mut stream = agent.events().await.unwrap();
        match stream.recv().await.unwrap() {
            AgentEvent::Snapshot(instances) => assert_eq!(instances.len(), 1),
            other => panic!("expected snapshot, got {other:?}"),
        }

        agent.set_status("c1", ContainerStatus::Failed);
        match stream.recv().await.unwrap() {
            AgentEvent::Delta(instance) => assert_eq!(instance.status, ContainerStatus::Failed),
            other => panic!("expected delta, got {other:?}"),
        }
    }
}
