use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use storage_memory::HistoryWindow;
use uns_api::{Message, MessageBus, UnsError, Worker};

/// Feeds every delivery on its topics into one shared history window.
pub struct HistoryWorker {
    name: String,
    bus: Arc<dyn MessageBus>,
    topics: Vec<String>,
    window: Arc<HistoryWindow>,
}

impl HistoryWorker {
    pub fn new(name: impl Into<String>, bus: Arc<dyn MessageBus>, topics: Vec<String>) -> Self {
        let window = Arc::new(HistoryWindow::new());
        let sink = window.clone();
        bus.on_message(Arc::new(move |msg: &Message| -> Result<(), UnsError> {
            sink.append(&msg.topic, msg.received_at, msg.payload_value());
            Ok(())
        }));
        Self {
            name: name.into(),
            bus,
            topics,
            window,
        }
    }

    pub fn window(&self) -> Arc<HistoryWindow> {
        self.window.clone()
    }
}

impl Worker for HistoryWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        Box::pin(async move {
            self.bus.connect().await?;
            let filters: Vec<&str> = self.topics.iter().map(String::as_str).collect();
            self.bus.subscribe(&filters).await?;
            tracing::info!(worker = %self.name, topics = ?self.topics, "recording history");
            std::future::pending::<()>().await;
            Ok(())
        })
    }
}
