use std::collections::HashMap;

/// Latest value per topic. Read surface for external collaborators
/// (lookups), write surface for the cache worker.
///
/// Implementations must tolerate concurrent writers and readers.
pub trait RetainedStore: Send + Sync {
    /// Upsert: the new value replaces whatever the topic held.
    fn put(&self, topic: &str, value: serde_json::Value);

    /// Values for the requested topics. Unknown topics are simply absent.
    fn get(&self, topics: &[&str]) -> HashMap<String, serde_json::Value>;

    /// Every topic with a retained value, in no particular order.
    fn keys(&self) -> Vec<String>;
}
