//! In-process pub/sub broker.
//!
//! `LocalBroker` routes publishes to every session whose filters match the
//! topic, keeps retained messages and replays them on subscribe, and can be
//! switched offline to simulate a broker outage: all sessions are dropped
//! and connects are refused until it comes back.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use uns_api::topic;
use uns_api::{Transport, TransportFactory, TransportMessage, TransportSettings, UnsError};

// ═══════════════════════════════════════════════════════════════
//  LocalBroker
// ═══════════════════════════════════════════════════════════════

struct Session {
    client_id: String,
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<TransportMessage>,
}

struct BrokerState {
    online: bool,
    sessions: HashMap<u64, Session>,
    retained: BTreeMap<String, Vec<u8>>,
    next_session: u64,
}

#[derive(Clone)]
pub struct LocalBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                online: true,
                sessions: HashMap::new(),
                retained: BTreeMap::new(),
                next_session: 1,
            })),
        }
    }

    pub fn transport(&self, client_id: impl Into<String>) -> LocalTransport {
        LocalTransport {
            broker: self.clone(),
            client_id: client_id.into(),
            session: Mutex::new(None),
            rx: tokio::sync::Mutex::new(None),
        }
    }

    /// Going offline drops every session; connects fail until back online.
    pub fn set_online(&self, online: bool) {
        let mut state = self.lock();
        state.online = online;
        if !online {
            let dropped = state.sessions.len();
            state.sessions.clear();
            tracing::info!(sessions = dropped, "local broker offline");
        } else {
            tracing::info!("local broker online");
        }
    }

    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Retained payload for an exact topic.
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.lock().retained.get(topic).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("local broker lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn open_session(
        &self,
        client_id: &str,
    ) -> Result<(u64, mpsc::UnboundedReceiver<TransportMessage>), UnsError> {
        let mut state = self.lock();
        if !state.online {
            return Err(UnsError::connection("local broker is offline"));
        }
        // Same client id takes over the previous session.
        state.sessions.retain(|_, s| s.client_id != client_id);

        let id = state.next_session;
        state.next_session += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions.insert(
            id,
            Session {
                client_id: client_id.to_string(),
                filters: Vec::new(),
                tx,
            },
        );
        Ok((id, rx))
    }

    fn close_session(&self, id: u64) {
        self.lock().sessions.remove(&id);
    }

    fn has_session(&self, id: u64) -> bool {
        self.lock().sessions.contains_key(&id)
    }

    fn add_filters(&self, id: u64, filters: &[String]) -> Result<(), UnsError> {
        let mut state = self.lock();
        let BrokerState {
            sessions, retained, ..
        } = &mut *state;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| UnsError::not_connected("session is gone"))?;

        for filter in filters {
            if !topic::is_valid_filter(filter) {
                return Err(UnsError::config(format!("invalid topic filter '{filter}'")));
            }
            if !session.filters.contains(filter) {
                session.filters.push(filter.clone());
            }
            for (t, payload) in retained.iter() {
                if topic::matches(filter, t) {
                    let _ = session.tx.send(TransportMessage {
                        topic: t.clone(),
                        payload: payload.clone(),
                        retain: true,
                    });
                }
            }
        }
        Ok(())
    }

    fn remove_filters(&self, id: u64, filters: &[String]) -> Result<(), UnsError> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(&id)
            .ok_or_else(|| UnsError::not_connected("session is gone"))?;
        session.filters.retain(|f| !filters.contains(f));
        Ok(())
    }

    fn route(&self, id: u64, topic_name: &str, payload: Vec<u8>, retain: bool) -> Result<(), UnsError> {
        let mut state = self.lock();
        if !state.sessions.contains_key(&id) {
            return Err(UnsError::not_connected("session is gone"));
        }

        if retain {
            if payload.is_empty() {
                state.retained.remove(topic_name);
            } else {
                state.retained.insert(topic_name.to_string(), payload.clone());
            }
        }

        let mut delivered = 0usize;
        for session in state.sessions.values() {
            if session.filters.iter().any(|f| topic::matches(f, topic_name)) {
                let _ = session.tx.send(TransportMessage {
                    topic: topic_name.to_string(),
                    payload: payload.clone(),
                    retain: false,
                });
                delivered += 1;
            }
        }
        tracing::trace!(topic = %topic_name, delivered, "routed");
        Ok(())
    }
}

impl TransportFactory for LocalBroker {
    fn create(&self, settings: &TransportSettings) -> Result<Arc<dyn Transport>, UnsError> {
        if settings.host.is_some() {
            tracing::debug!(
                client_id = %settings.client_id,
                "local transport is in-process, host/port/credentials unused"
            );
        }
        Ok(Arc::new(self.transport(settings.client_id.clone())))
    }
}

// ═══════════════════════════════════════════════════════════════
//  LocalTransport
// ═══════════════════════════════════════════════════════════════

/// One client connection to a `LocalBroker`.
pub struct LocalTransport {
    broker: LocalBroker,
    client_id: String,
    session: Mutex<Option<u64>>,
    rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<TransportMessage>>>,
}

impl LocalTransport {
    fn session_id(&self) -> Option<u64> {
        match self.session.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_session(&self, id: Option<u64>) {
        match self.session.lock() {
            Ok(mut guard) => *guard = id,
            Err(poisoned) => *poisoned.into_inner() = id,
        }
    }

    fn live_session(&self) -> Result<u64, UnsError> {
        match self.session_id() {
            Some(id) if self.broker.has_session(id) => Ok(id),
            _ => Err(UnsError::not_connected(format!(
                "client '{}' is not connected",
                self.client_id
            ))),
        }
    }
}

impl Transport for LocalTransport {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        Box::pin(async move {
            let (id, rx) = self.broker.open_session(&self.client_id)?;
            if let Some(old) = self.session_id() {
                self.broker.close_session(old);
            }
            self.set_session(Some(id));
            *self.rx.lock().await = Some(rx);
            tracing::debug!(client_id = %self.client_id, session = id, "local session opened");
            Ok(())
        })
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        Box::pin(async move {
            if let Some(id) = self.session_id() {
                self.broker.close_session(id);
            }
            self.set_session(None);
            *self.rx.lock().await = None;
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.live_session().is_ok()
    }

    fn subscribe(
        &self,
        filters: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        let filters = filters.to_vec();
        Box::pin(async move {
            let id = self.live_session()?;
            self.broker.add_filters(id, &filters)
        })
    }

    fn unsubscribe(
        &self,
        filters: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        let filters = filters.to_vec();
        Box::pin(async move {
            let id = self.live_session()?;
            self.broker.remove_filters(id, &filters)
        })
    }

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let id = self.live_session()?;
            self.broker.route(id, &topic, payload, retain)
        })
    }

    fn recv(&self) -> Pin<Box<dyn Future<Output = Option<TransportMessage>> + Send + '_>> {
        Box::pin(async move {
            let mut guard = self.rx.lock().await;
            match guard.as_mut() {
                Some(rx) => rx.recv().await,
                None => None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use uns_api::ErrorKind;

    fn filters(f: &[&str]) -> Vec<String> {
        f.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn routes_to_matching_sessions_once() {
        let broker = LocalBroker::new();
        let a = broker.transport("a");
        let b = broker.transport("b");
        assert_ok!(a.connect().await);
        assert_ok!(b.connect().await);
        assert_ok!(b.subscribe(&filters(&["devices/#", "devices/+/nodes/speed"])).await);

        assert_ok!(a.publish("devices/plc/nodes/speed", b"1".to_vec(), false).await);
        assert_ok!(a.publish("timers/1s", b"{}".to_vec(), false).await);

        let got = b.recv().await.unwrap();
        assert_eq!(got.topic, "devices/plc/nodes/speed");
        assert_eq!(got.payload, b"1");
        assert!(!got.retain);

        // No second copy, and nothing for timers.
        assert_ok!(a.publish("devices/end", Vec::new(), false).await);
        assert_eq!(b.recv().await.unwrap().topic, "devices/end");
    }

    #[tokio::test]
    async fn retained_messages_replay_on_subscribe() {
        let broker = LocalBroker::new();
        let publisher = broker.transport("pub");
        assert_ok!(publisher.connect().await);
        assert_ok!(publisher.publish("cfg/a", b"1".to_vec(), true).await);
        assert_ok!(publisher.publish("cfg/b", b"2".to_vec(), true).await);
        assert_ok!(publisher.publish("cfg/b", Vec::new(), true).await);
        assert_eq!(broker.retained("cfg/a"), Some(b"1".to_vec()));
        assert_eq!(broker.retained("cfg/b"), None);

        let late = broker.transport("late");
        assert_ok!(late.connect().await);
        assert_ok!(late.subscribe(&filters(&["cfg/#"])).await);
        let got = late.recv().await.unwrap();
        assert_eq!(got.topic, "cfg/a");
        assert!(got.retain);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broker = LocalBroker::new();
        let t = broker.transport("t");
        assert_ok!(t.connect().await);
        assert_ok!(t.subscribe(&filters(&["x/#", "y"])).await);
        assert_ok!(t.unsubscribe(&filters(&["x/#"])).await);
        assert_ok!(t.publish("x/1", b"a".to_vec(), false).await);
        assert_ok!(t.publish("y", b"b".to_vec(), false).await);
        assert_eq!(t.recv().await.unwrap().topic, "y");
    }

    #[tokio::test]
    async fn outage_drops_sessions_and_refuses_connects() {
        let broker = LocalBroker::new();
        let t = broker.transport("t");
        assert_ok!(t.connect().await);
        assert!(t.is_connected());

        broker.set_online(false);
        assert!(!t.is_connected());
        assert!(t.recv().await.is_none());

        let err = assert_err!(t.connect().await);
        assert_eq!(err.kind(), ErrorKind::Connection);
        let err = assert_err!(t.publish("a", Vec::new(), false).await);
        assert_eq!(err.kind(), ErrorKind::NotConnected);

        broker.set_online(true);
        assert_ok!(t.connect().await);
        assert!(t.is_connected());
        assert_eq!(broker.session_count(), 1);
    }

    #[tokio::test]
    async fn same_client_id_takes_over() {
        let broker = LocalBroker::new();
        let first = broker.transport("dup");
        let second = broker.transport("dup");
        assert_ok!(first.connect().await);
        assert_ok!(second.connect().await);
        assert!(!first.is_connected());
        assert!(second.is_connected());
        assert_eq!(broker.session_count(), 1);
    }

    #[tokio::test]
    async fn factory_uses_client_id() {
        let broker = LocalBroker::new();
        let settings = TransportSettings {
            client_id: "engine-1".into(),
            host: Some("localhost".into()),
            port: 1883,
            username: "engine-1".into(),
            password: String::new(),
            tls: None,
        };
        let t = assert_ok!(broker.create(&settings));
        assert_ok!(t.connect().await);
        assert_eq!(broker.session_count(), 1);
        assert_ok!(t.disconnect().await);
        assert_eq!(broker.session_count(), 0);
    }
}
