use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use uns_api::topic;
use uns_api::{Message, MessageBus, TagSource, UnsError, WireValue, Worker};

/// Pending cadence signals; extra signals beyond this are dropped.
const SIGNAL_QUEUE: usize = 16;

/// On every cadence signal, reads each configured node from a tag source,
/// decodes structured values and republishes them under
/// `devices/<worker>/nodes/<node>`.
pub struct AcquisitionWorker {
    name: String,
    bus: Arc<dyn MessageBus>,
    source: Arc<dyn TagSource>,
    nodes: Vec<String>,
    cadence: String,
    signals: tokio::sync::Mutex<mpsc::Receiver<String>>,
}

impl AcquisitionWorker {
    pub fn new(
        name: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        source: Arc<dyn TagSource>,
        nodes: Vec<String>,
        cadence: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE);

        let worker = name.clone();
        bus.on_message(Arc::new(move |msg: &Message| -> Result<(), UnsError> {
            if !topic::is_cadence_topic(&msg.topic) {
                return Ok(());
            }
            match tx.try_send(msg.topic.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(signal)) => {
                    tracing::debug!(worker = %worker, signal = %signal, "acquisition busy, signal dropped");
                }
                Err(TrySendError::Closed(_)) => {}
            }
            Ok(())
        }));

        Self {
            name,
            bus,
            source,
            nodes,
            cadence: cadence.into(),
            signals: tokio::sync::Mutex::new(rx),
        }
    }

    /// Read, decode and publish every node once. Node failures are logged
    /// and do not stop the pass. Returns the number of published nodes.
    pub async fn acquire_all(&self) -> usize {
        let mut published = 0;
        for node in &self.nodes {
            let value = match self.acquire(node).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(worker = %self.name, node = %node, error = %e, "node acquisition failed");
                    continue;
                }
            };
            let topic = topic::device_node_topic(&self.name, node);
            match self.bus.publish(&topic, value, false).await {
                Ok(()) => published += 1,
                Err(e) => tracing::error!(worker = %self.name, topic = %topic, error = %e, "publish failed"),
            }
        }
        published
    }

    async fn acquire(&self, node: &str) -> Result<Value, UnsError> {
        let reading = self.source.read(node).await?;
        match reading.value {
            WireValue::Scalar(v) => Ok(v),
            WireValue::Structured(bytes) => {
                let schema = self.source.schema(&reading.data_type).await?;
                Ok(format_ua_binary::decode(&schema, &reading.data_type, &bytes)?)
            }
        }
    }
}

impl Worker for AcquisitionWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        Box::pin(async move {
            self.source
                .connect()
                .await
                .map_err(|e| e.with_context(format!("worker '{}'", self.name)))?;
            self.bus.connect().await?;
            self.bus.subscribe(&[self.cadence.as_str()]).await?;
            tracing::info!(worker = %self.name, nodes = self.nodes.len(), cadence = %self.cadence, "acquisition started");

            let mut signals = self.signals.lock().await;
            while let Some(signal) = signals.recv().await {
                let published = self.acquire_all().await;
                tracing::debug!(worker = %self.name, signal = %signal, published, "acquisition pass");
            }
            Ok(())
        })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        self.source.close()
    }
}
