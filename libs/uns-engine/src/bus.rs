//! Reconnecting pub/sub client on top of a [`Transport`].

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use uns_api::topic;
use uns_api::{Message, MessageBus, MessageHandler, Transport, UnsError};

use crate::backoff::{Backoff, sleep_or_cancel};

/// `MessageBus` implementation: connect with capped exponential backoff,
/// re-apply the active filter set after every reconnect, and fan each
/// delivery out to the registered handlers in registration order.
pub struct BusClient {
    inner: Arc<BusInner>,
}

struct BusInner {
    name: String,
    transport: Arc<dyn Transport>,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    filters: Mutex<Vec<String>>,
    backoff: Backoff,
    token: CancellationToken,
    receive_loop: Mutex<Option<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl BusClient {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        backoff: Backoff,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                name: name.into(),
                transport,
                handlers: RwLock::new(Vec::new()),
                filters: Mutex::new(Vec::new()),
                backoff,
                token,
                receive_loop: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    fn ensure_receive_loop(&self) {
        let mut slot = lock(&self.inner.receive_loop);
        let running = slot.as_ref().is_some_and(|h| !h.is_finished());
        if !running {
            let inner = self.inner.clone();
            *slot = Some(tokio::spawn(inner.receive_loop()));
        }
    }
}

impl BusInner {
    fn filters_snapshot(&self) -> Vec<String> {
        lock(&self.filters).clone()
    }

    /// Connect and re-apply the active filters.
    async fn establish(&self) -> Result<(), UnsError> {
        self.transport.connect().await?;
        let filters = self.filters_snapshot();
        if !filters.is_empty() {
            self.transport.subscribe(&filters).await?;
        }
        Ok(())
    }

    async fn connect_with_retry(&self) -> Result<(), UnsError> {
        let _guard = self.connect_lock.lock().await;
        if self.transport.is_connected() {
            return Ok(());
        }

        let mut attempt: u32 = 0;
        loop {
            if self.token.is_cancelled() {
                return Err(UnsError::cancelled(format!("client '{}': connect abandoned", self.name)));
            }
            match self.establish().await {
                Ok(()) => {
                    tracing::info!(client = %self.name, attempts = attempt + 1, "connected");
                    return Ok(());
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        client = %self.name,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "connect failed, retrying"
                    );
                    attempt = attempt.saturating_add(1);
                    if !sleep_or_cancel(delay, &self.token).await {
                        return Err(UnsError::cancelled(format!(
                            "client '{}': connect abandoned",
                            self.name
                        )));
                    }
                }
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => break,
                msg = self.transport.recv() => msg,
            };
            match next {
                Some(raw) => self.dispatch(Message::from(raw)),
                None => {
                    if self.token.is_cancelled() {
                        break;
                    }
                    tracing::warn!(client = %self.name, "connection lost, reconnecting");
                    if self.connect_with_retry().await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(client = %self.name, "receive loop stopped");
    }

    fn dispatch(&self, message: Message) {
        tracing::trace!(client = %self.name, topic = %message.topic, bytes = message.payload.len(), "delivered");
        let handlers: Vec<Arc<dyn MessageHandler>> = match self.handlers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(&message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(
                    client = %self.name,
                    topic = %message.topic,
                    error = %e,
                    "message handler failed"
                ),
                Err(panic) => tracing::error!(
                    client = %self.name,
                    topic = %message.topic,
                    panic = %panic_message(panic.as_ref()),
                    "message handler panicked"
                ),
            }
        }
    }
}

impl MessageBus for BusClient {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        Box::pin(async move {
            self.inner.connect_with_retry().await?;
            self.ensure_receive_loop();
            Ok(())
        })
    }

    fn subscribe(
        &self,
        filters: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        let new: Vec<String> = filters.iter().map(|f| f.to_string()).collect();
        Box::pin(async move {
            if let Some(bad) = new.iter().find(|f| !topic::is_valid_filter(f)) {
                return Err(UnsError::config(format!("invalid topic filter '{bad}'")));
            }
            let old = std::mem::replace(&mut *lock(&self.inner.filters), new.clone());
            if same_filters(&old, &new) && self.inner.transport.is_connected() {
                // Already active on this session; resubscribing would replay retained messages.
                tracing::debug!(client = %self.inner.name, filters = ?new, "filters unchanged");
                return Ok(());
            }

            if self.inner.transport.is_connected() {
                if !old.is_empty() {
                    self.inner.transport.unsubscribe(&old).await?;
                }
                if !new.is_empty() {
                    self.inner.transport.subscribe(&new).await?;
                }
            }
            tracing::debug!(client = %self.inner.name, filters = ?new, "subscribed");
            Ok(())
        })
    }

    fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        retain: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let body = serde_json::to_vec(&payload)?;

            if !self.inner.transport.is_connected() {
                // One immediate attempt; never wait behind a running reconnect.
                let Ok(guard) = self.inner.connect_lock.try_lock() else {
                    return Err(UnsError::not_connected(format!(
                        "client '{}' is reconnecting",
                        self.inner.name
                    )));
                };
                if let Err(e) = self.inner.establish().await {
                    return Err(UnsError::not_connected(format!(
                        "client '{}': reconnect failed: {e}",
                        self.inner.name
                    )));
                }
                tracing::info!(client = %self.inner.name, "reconnected on publish");
                drop(guard);
                self.ensure_receive_loop();
            }

            self.inner
                .transport
                .publish(&topic, body, retain)
                .await
                .map_err(|e| e.with_context(format!("publish '{topic}'")))
        })
    }

    fn on_message(&self, handler: Arc<dyn MessageHandler>) {
        match self.inner.handlers.write() {
            Ok(mut guard) => guard.push(handler),
            Err(poisoned) => poisoned.into_inner().push(handler),
        }
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        Box::pin(async move {
            let handle = lock(&self.inner.receive_loop).take();
            if let Some(handle) = handle {
                handle.abort();
            }
            if self.inner.transport.is_connected() {
                self.inner.transport.disconnect().await?;
                tracing::info!(client = %self.inner.name, "disconnected");
            }
            Ok(())
        })
    }
}

fn same_filters(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().all(|f| b.contains(f)) && b.iter().all(|f| a.contains(f))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("bus client lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
