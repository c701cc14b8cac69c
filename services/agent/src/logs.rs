//! Per-container log buffering and fan-out.
//!
//! Each container owns a `ContainerLog`: a runloop holding a ring buffer of
//! the most recent lines plus a set of subscriber sinks. Delivery to sinks
//! is strictly non-blocking; a sink that is not ready misses the line and
//! the dropped counter goes up. Slow subscribers are the subscriber's
//! problem.
//!
//! Lines arrive either from the supervising process's stdout/stderr pipes
//! or over the UDP ingest socket, where each datagram is routed by its
//! leading `container[<id>]` tag.

use std::collections::{HashMap, VecDeque};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::registry::Registry;

/// Max UDP log datagram: one line plus the container id tag.
pub const MAX_LOG_DATAGRAM: usize = 50_000 + 256;

/// Fixed-capacity buffer over the most recent lines, in insertion order.
#[derive(Debug)]
pub struct RingBuffer {
    entries: VecDeque<String>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert a line, evicting the oldest when full.
    pub fn insert(&mut self, line: String) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(line);
    }

    /// The last `count` lines, oldest first. Never more than the buffer
    /// holds; fewer when the buffer has fewer.
    pub fn last(&self, count: usize) -> Vec<String> {
        let count = count.min(self.entries.len());
        self.entries
            .iter()
            .skip(self.entries.len() - count)
            .cloned()
            .collect()
    }
}

enum LogMsg {
    Add(String),
    Last {
        count: usize,
        reply: oneshot::Sender<Vec<String>>,
    },
    Notify {
        sink: mpsc::Sender<String>,
        reply: oneshot::Sender<u64>,
    },
    Stop(u64),
    Exit,
}

/// Handle to one container's log runloop.
#[derive(Clone)]
pub struct ContainerLog {
    tx: mpsc::Sender<LogMsg>,
}

impl ContainerLog {
    pub fn new(buffer_lines: usize) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run_log_loop(buffer_lines, rx));
        Self { tx }
    }

    /// Feed a line into the buffer and notify all subscribers.
    pub async fn add_line(&self, line: String) {
        let _ = self.tx.send(LogMsg::Add(line)).await;
    }

    /// The last `n` lines, oldest to newest. Idempotent.
    pub async fn last(&self, n: usize) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(LogMsg::Last { count: n, reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Subscribe a sink to subsequent lines. The returned id unsubscribes.
    pub async fn notify(&self, sink: mpsc::Sender<String>) -> u64 {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(LogMsg::Notify { sink, reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Remove a subscriber.
    pub async fn stop(&self, subscription: u64) {
        let _ = self.tx.send(LogMsg::Stop(subscription)).await;
    }

    /// Terminate the runloop, releasing all subscribers.
    pub async fn exit(&self) {
        let _ = self.tx.send(LogMsg::Exit).await;
    }
}

async fn run_log_loop(buffer_lines: usize, mut rx: mpsc::Receiver<LogMsg>) {
    let mut entries = RingBuffer::new(buffer_lines);
    let mut sinks: HashMap<u64, mpsc::Sender<String>> = HashMap::new();
    let mut next_subscription: u64 = 1;
    let mut dropped: u64 = 0;

    while let Some(msg) = rx.recv().await {
        match msg {
            LogMsg::Add(line) => {
                entries.insert(line.clone());
                sinks.retain(|_, sink| match sink.try_send(line.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped += 1;
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
            LogMsg::Last { count, reply } => {
                let _ = reply.send(entries.last(count));
            }
            LogMsg::Notify { sink, reply } => {
                let id = next_subscription;
                next_subscription += 1;
                sinks.insert(id, sink);
                let _ = reply.send(id);
            }
            LogMsg::Stop(id) => {
                sinks.remove(&id);
            }
            LogMsg::Exit => break,
        }
    }

    if dropped > 0 {
        debug!(dropped, "log subscribers missed lines");
    }
}

/// Listen for log datagrams and route each to its container's buffer.
///
/// Every well-formed line begins with `container[<id>]`; datagrams without
/// a routable tag are counted and dropped.
pub async fn receive_logs(registry: std::sync::Arc<Registry>, socket: UdpSocket) {
    let mut buf = vec![0u8; MAX_LOG_DATAGRAM];
    info!(addr = ?socket.local_addr().ok(), "log ingest listening");

    loop {
        let (n, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "log ingest read failed");
                return;
            }
        };

        let line = String::from_utf8_lossy(&buf[..n]).into_owned();
        let Some(id) = container_id_tag(&line) else {
            warn!(%addr, "log line without container tag dropped");
            continue;
        };

        let Some(container) = registry.get(id) else {
            warn!(%addr, container_id = %id, "log line for unknown container dropped");
            continue;
        };

        container.log().add_line(line).await;
    }
}

/// Extract the id from a leading `container[<id>]` tag.
fn container_id_tag(line: &str) -> Option<&str> {
    let rest = line.split_once("container[")?.1;
    let (id, _) = rest.split_once(']')?;
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_keeps_most_recent_in_order() {
        let mut buf = RingBuffer::new(3);
        for line in ["m1", "m2", "m3", "m4"] {
            buf.insert(line.to_string());
        }
        assert_eq!(buf.last(3), vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn ring_buffer_last_caps_at_capacity() {
        let mut buf = RingBuffer::new(3);
        buf.insert("a".to_string());
        buf.insert("b".to_string());
        assert_eq!(buf.last(10), vec!["a", "b"]);
        buf.insert("c".to_string());
        buf.insert("d".to_string());
        assert_eq!(buf.last(10), vec!["b", "c", "d"]);
    }

    #[test]
    fn container_tag_parses() {
        assert_eq!(
            container_id_tag("container[job-a:task-b:0] hello"),
            Some("job-a:task-b:0")
        );
        assert_eq!(container_id_tag("no tag here"), None);
        assert_eq!(container_id_tag("container[] empty"), None);
    }

    #[tokio::test]
    async fn last_is_idempotent() {
        let log = ContainerLog::new(8);
        log.add_line("one".to_string()).await;
        log.add_line("two".to_string()).await;
        assert_eq!(log.last(2).await, vec!["one", "two"]);
        assert_eq!(log.last(2).await, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn blocked_sink_misses_lines_without_blocking_others() {
        let log = ContainerLog::new(8);

        let (ready_tx, mut ready_rx) = mpsc::channel(1);
        let (blocked_tx, _blocked_rx) = mpsc::channel(1);

        log.notify(ready_tx).await;
        let blocked = log.notify(blocked_tx.clone()).await;

        // Fill the blocked sink so the next publish finds it not ready.
        blocked_tx.send("filler".to_string()).await.unwrap();

        log.add_line("m1".to_string()).await;

        assert_eq!(ready_rx.recv().await.unwrap(), "m1");
        log.stop(blocked).await;
    }

    #[tokio::test]
    async fn stopped_sink_receives_nothing_further() {
        let log = ContainerLog::new(8);
        let (tx, mut rx) = mpsc::channel(4);
        let id = log.notify(tx).await;

        log.add_line("before".to_string()).await;
        assert_eq!(rx.recv().await.unwrap(), "before");

        log.stop(id).await;
        log.add_line("after".to_string()).await;

        // Sender side is dropped once the runloop forgets it.
        assert!(rx.recv().await.is_none());
    }
}
