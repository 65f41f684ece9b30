use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use uns_api::topic::ALL_TOPICS;
use uns_api::{Message, MessageBus, RetainedStore, UnsError, Worker};

/// Subscribes to the whole namespace and keeps the latest payload of every
/// topic in a retained store, as text.
pub struct CacheWorker {
    name: String,
    bus: Arc<dyn MessageBus>,
}

impl CacheWorker {
    pub fn new(name: impl Into<String>, bus: Arc<dyn MessageBus>, store: Arc<dyn RetainedStore>) -> Self {
        bus.on_message(Arc::new(move |msg: &Message| -> Result<(), UnsError> {
            store.put(&msg.topic, Value::String(msg.payload_text().into_owned()));
            Ok(())
        }));
        Self {
            name: name.into(),
            bus,
        }
    }
}

impl Worker for CacheWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        Box::pin(async move {
            self.bus.connect().await?;
            self.bus.subscribe(&[ALL_TOPICS]).await?;
            tracing::info!(worker = %self.name, "caching every topic");
            std::future::pending::<()>().await;
            Ok(())
        })
    }
}
