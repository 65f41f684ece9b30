pub mod acquisition;
pub mod cache;
pub mod heartbeat;
pub mod history;

pub use acquisition::AcquisitionWorker;
pub use cache::CacheWorker;
pub use heartbeat::HeartbeatWorker;
pub use history::HistoryWorker;

#[cfg(test)]
pub(crate) mod testing {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};

    use uns_api::{Message, MessageBus, MessageHandler, UnsError};

    /// In-memory bus: records publishes and lets a test deliver messages
    /// straight to the registered handlers.
    #[derive(Default)]
    pub struct RecordingBus {
        pub published: Mutex<Vec<(String, serde_json::Value, bool)>>,
        pub filters: Mutex<Vec<String>>,
        pub connects: Mutex<usize>,
        pub fail_publish: Mutex<bool>,
        handlers: Mutex<Vec<Arc<dyn MessageHandler>>>,
    }

    impl RecordingBus {
        pub fn deliver(&self, topic: &str, payload: &[u8]) {
            let message = Message::new(topic, payload.to_vec());
            let handlers = self.handlers.lock().unwrap().clone();
            for h in handlers {
                let _ = h.handle(&message);
            }
        }

        pub fn topics(&self) -> Vec<String> {
            self.published.lock().unwrap().iter().map(|(t, _, _)| t.clone()).collect()
        }
    }

    impl MessageBus for RecordingBus {
        fn name(&self) -> &str {
            "recording"
        }

        fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
            *self.connects.lock().unwrap() += 1;
            Box::pin(async { Ok(()) })
        }

        fn subscribe(
            &self,
            filters: &[&str],
        ) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
            *self.filters.lock().unwrap() = filters.iter().map(|f| f.to_string()).collect();
            Box::pin(async { Ok(()) })
        }

        fn publish(
            &self,
            topic: &str,
            payload: serde_json::Value,
            retain: bool,
        ) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
            let result = if *self.fail_publish.lock().unwrap() {
                Err(UnsError::not_connected("recording bus is down"))
            } else {
                self.published
                    .lock()
                    .unwrap()
                    .push((topic.to_string(), payload, retain));
                Ok(())
            };
            Box::pin(async move { result })
        }

        fn on_message(&self, handler: Arc<dyn MessageHandler>) {
            self.handlers.lock().unwrap().push(handler);
        }

        fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }
}
