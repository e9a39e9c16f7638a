//! The property channel between the agent and its control plane.
//!
//! The cloud transport itself is an external collaborator: whatever it is,
//! it delivers versioned desired-property JSON blobs and accepts
//! reported-property JSON blobs. This module pins that seam down as a trait,
//! with an in-memory rendition for tests and a line-delimited stdio rendition
//! for driving a local agent.

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::Lines;
use tokio::io::Stdin;
use tokio::io::Stdout;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("The property channel is closed")]
    Closed,

    #[error(transparent)]
    FromIo(#[from] std::io::Error),
}

/// A versioned desired-property delivery.
#[derive(Clone, Debug)]
pub struct DesiredUpdate {
    pub value: Value,
    pub version: i64,
}

#[async_trait]
pub trait PropertyTransport: Send {
    /// Next desired-property update, or `None` once the channel is closed.
    async fn recv(&mut self) -> Option<DesiredUpdate>;

    /// Send a reported-property document.
    async fn send(&mut self, reported: Value) -> Result<(), TransportError>;
}

/// In-memory property channel: the probe side plays the control plane.
pub struct InMemoryTransport {
    desired_rx: mpsc::Receiver<DesiredUpdate>,
    reported_tx: mpsc::UnboundedSender<Value>,
}

/// Control-plane side of an in-memory channel.
pub struct TransportProbe {
    pub desired_tx: mpsc::Sender<DesiredUpdate>,
    pub reported_rx: mpsc::UnboundedReceiver<Value>,
}

impl TransportProbe {
    /// Deliver a desired-property update, stamping the next version.
    pub async fn deliver(&mut self, value: Value, version: i64) {
        self.desired_tx
            .send(DesiredUpdate { value, version })
            .await
            .expect("the agent side of the channel is alive");
    }
}

pub fn in_memory() -> (InMemoryTransport, TransportProbe) {
    let (desired_tx, desired_rx) = mpsc::channel(16);
    let (reported_tx, reported_rx) = mpsc::unbounded_channel();
    (
        InMemoryTransport {
            desired_rx,
            reported_tx,
        },
        TransportProbe {
            desired_tx,
            reported_rx,
        },
    )
}

#[async_trait]
impl PropertyTransport for InMemoryTransport {
    async fn recv(&mut self) -> Option<DesiredUpdate> {
        self.desired_rx.recv().await
    }

    async fn send(&mut self, reported: Value) -> Result<(), TransportError> {
        self.reported_tx
            .send(reported)
            .map_err(|_| TransportError::Closed)
    }
}

/// Property channel over stdin/stdout, one JSON document per line.
///
/// Deliveries are stamped with increasing versions in arrival order; lines
/// that do not parse as JSON are dropped with a warning.
pub struct StdioTransport {
    lines: Lines<BufReader<Stdin>>,
    stdout: Stdout,
    version: i64,
}

impl StdioTransport {
    pub fn new() -> Self {
        StdioTransport {
            lines: BufReader::new(tokio::io::stdin()).lines(),
            stdout: tokio::io::stdout(),
            version: 0,
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        StdioTransport::new()
    }
}

#[async_trait]
impl PropertyTransport for StdioTransport {
    async fn recv(&mut self) -> Option<DesiredUpdate> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(err) => {
                    warn!("Reading the property channel failed: {err}");
                    return None;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(value) => {
                    self.version += 1;
                    return Some(DesiredUpdate {
                        value,
                        version: self.version,
                    });
                }
                Err(err) => warn!("Dropping a non-JSON property delivery: {err}"),
            }
        }
    }

    async fn send(&mut self, reported: Value) -> Result<(), TransportError> {
        let mut line = reported.to_string();
        line.push('\n');
        self.stdout.write_all(line.as_bytes()).await?;
        self.stdout.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn in_memory_channel_round_trips_both_directions() {
        let (mut transport, mut probe) = in_memory();

        probe.deliver(json!({"workflow": {"action": 3, "id": "w1"}}), 7).await;
        let update = transport.recv().await.unwrap();
        assert_eq!(update.version, 7);
        assert_eq!(update.value["workflow"]["id"], json!("w1"));

        transport.send(json!({"agent": {"state": 0}})).await.unwrap();
        let reported = probe.reported_rx.recv().await.unwrap();
        assert_eq!(reported["agent"]["state"], json!(0));
    }

    #[tokio::test]
    async fn recv_ends_when_the_probe_goes_away() {
        let (mut transport, probe) = in_memory();
        drop(probe);
        assert!(transport.recv().await.is_none());
    }
}
