//! MQTT transport backed by `rumqttc`.
//!
//! Each `connect` builds a fresh client and event loop, waits for the
//! broker's CONNACK and then drives the event loop on a background task
//! that forwards incoming publishes. When the network drops, the task ends
//! and `recv` returns `None`; reconnecting is left to the bus.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeFilter, TlsConfiguration,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use uns_api::topic;
use uns_api::{
    TlsSettings, Transport, TransportFactory, TransportMessage, TransportSettings, UnsError,
};

/// Upper bound for TCP connect plus CONNACK.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long `disconnect` lets the event loop flush the DISCONNECT packet.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Capacity of the request channel between client and event loop.
const REQUEST_CAPACITY: usize = 64;

// ═══════════════════════════════════════════════════════════════
//  Options
// ═══════════════════════════════════════════════════════════════

/// Build client options from transport settings. Reads the TLS files.
pub fn mqtt_options(settings: &TransportSettings) -> Result<MqttOptions, UnsError> {
    let host = settings
        .host
        .as_deref()
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| UnsError::config("mqtt transport needs a host"))?;
    if settings.client_id.is_empty() || settings.client_id.starts_with(' ') {
        return Err(UnsError::config(format!(
            "invalid mqtt client id '{}'",
            settings.client_id
        )));
    }

    let mut options = MqttOptions::new(settings.client_id.clone(), host, settings.port);
    options.set_credentials(settings.username.clone(), settings.password.clone());
    if let Some(tls) = &settings.tls {
        options.set_transport(rumqttc::Transport::Tls(tls_configuration(tls)?));
    }
    Ok(options)
}

fn tls_configuration(tls: &TlsSettings) -> Result<TlsConfiguration, UnsError> {
    let ca = read_pem("ca_file", &tls.ca_file)?;
    let client_auth = match (&tls.cert_file, &tls.key_file) {
        (Some(cert), Some(key)) => Some((read_pem("cert_file", cert)?, read_pem("key_file", key)?)),
        (None, None) => None,
        _ => {
            return Err(UnsError::config(
                "tls cert_file and key_file must be set together",
            ));
        }
    };
    Ok(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    })
}

fn read_pem(field: &str, path: &str) -> Result<Vec<u8>, UnsError> {
    std::fs::read(path).map_err(|e| UnsError::config(format!("tls {field} '{path}': {e}")))
}

// ═══════════════════════════════════════════════════════════════
//  Factory
// ═══════════════════════════════════════════════════════════════

/// Creates `MqttTransport`s from messaging-client settings.
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttTransportFactory;

impl TransportFactory for MqttTransportFactory {
    fn create(&self, settings: &TransportSettings) -> Result<Arc<dyn Transport>, UnsError> {
        let options = mqtt_options(settings)?;
        Ok(Arc::new(MqttTransport::new(options)))
    }
}

// ═══════════════════════════════════════════════════════════════
//  MqttTransport
// ═══════════════════════════════════════════════════════════════

struct Session {
    client: AsyncClient,
    driver: JoinHandle<()>,
}

pub struct MqttTransport {
    options: MqttOptions,
    connected: Arc<AtomicBool>,
    session: Mutex<Option<Session>>,
    rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<TransportMessage>>>,
}

impl MqttTransport {
    pub fn new(options: MqttOptions) -> Self {
        Self {
            options,
            connected: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
            rx: tokio::sync::Mutex::new(None),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn client(&self) -> Result<AsyncClient, UnsError> {
        let guard = self.lock_session();
        match guard.as_ref() {
            Some(session) if self.connected.load(Ordering::Acquire) => Ok(session.client.clone()),
            _ => Err(UnsError::not_connected(format!(
                "mqtt client '{}' is not connected",
                self.options.client_id()
            ))),
        }
    }

    fn take_session(&self) -> Option<Session> {
        self.lock_session().take()
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(session) = self.take_session() {
            session.driver.abort();
        }
    }
}

async fn handshake(eventloop: &mut EventLoop) -> Result<(), UnsError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(UnsError::connection(format!("broker refused: {:?}", ack.code)))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(UnsError::connection(e.to_string())),
        }
    }
}

/// Poll the event loop until the network drops or a DISCONNECT goes out.
async fn drive(
    client_id: String,
    mut eventloop: EventLoop,
    tx: mpsc::UnboundedSender<TransportMessage>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let msg = TransportMessage {
                    topic: p.topic,
                    payload: p.payload.to_vec(),
                    retain: p.retain,
                };
                if tx.send(msg).is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(client_id = %client_id, error = %e, "mqtt connection lost");
                break;
            }
        }
    }
    connected.store(false, Ordering::Release);
}

impl Transport for MqttTransport {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        Box::pin(async move {
            if let Some(old) = self.take_session() {
                old.driver.abort();
            }
            self.connected.store(false, Ordering::Release);

            let (client, mut eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
            let (host, port) = self.options.broker_address();
            match tokio::time::timeout(CONNECT_TIMEOUT, handshake(&mut eventloop)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(UnsError::connection(format!(
                        "no CONNACK from {host}:{port} within {CONNECT_TIMEOUT:?}"
                    )));
                }
            }

            let (tx, rx) = mpsc::unbounded_channel();
            self.connected.store(true, Ordering::Release);
            let driver = tokio::spawn(drive(
                self.options.client_id(),
                eventloop,
                tx,
                self.connected.clone(),
            ));
            *self.lock_session() = Some(Session { client, driver });
            *self.rx.lock().await = Some(rx);
            tracing::info!(
                client_id = %self.options.client_id(),
                host = %host,
                port,
                "mqtt connected"
            );
            Ok(())
        })
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        Box::pin(async move {
            if let Some(session) = self.take_session() {
                if self.connected.load(Ordering::Acquire) {
                    if let Err(e) = session.client.disconnect().await {
                        tracing::debug!(error = %e, "mqtt disconnect request failed");
                    }
                }
                let mut driver = session.driver;
                if tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err() {
                    driver.abort();
                }
            }
            self.connected.store(false, Ordering::Release);
            *self.rx.lock().await = None;
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn subscribe(
        &self,
        filters: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        let filters = filters.to_vec();
        Box::pin(async move {
            if let Some(bad) = filters.iter().find(|f| !topic::is_valid_filter(f)) {
                return Err(UnsError::config(format!("invalid topic filter '{bad}'")));
            }
            if filters.is_empty() {
                return Ok(());
            }
            let client = self.client()?;
            client
                .subscribe_many(
                    filters
                        .into_iter()
                        .map(|f| SubscribeFilter::new(f, QoS::AtMostOnce)),
                )
                .await
                .map_err(|e| UnsError::not_connected(e.to_string()))
        })
    }

    fn unsubscribe(
        &self,
        filters: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        let filters = filters.to_vec();
        Box::pin(async move {
            let client = self.client()?;
            for filter in filters {
                client
                    .unsubscribe(filter)
                    .await
                    .map_err(|e| UnsError::not_connected(e.to_string()))?;
            }
            Ok(())
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
            let client = self.client()?;
            client
                .publish(topic, QoS::AtMostOnce, retain, payload)
                .await
                .map_err(|e| UnsError::not_connected(e.to_string()))
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

    fn settings() -> TransportSettings {
        TransportSettings {
            client_id: "main-cache".into(),
            host: Some("broker.plant.local".into()),
            port: 8883,
            username: "svc-uns".into(),
            password: "s3cret".into(),
            tls: None,
        }
    }

    #[test]
    fn options_carry_every_setting() {
        let options = assert_ok!(mqtt_options(&settings()));
        assert_eq!(options.client_id(), "main-cache");
        assert_eq!(
            options.broker_address(),
            ("broker.plant.local".to_string(), 8883)
        );
        assert_eq!(
            options.credentials(),
            Some(("svc-uns".to_string(), "s3cret".to_string()))
        );
        assert!(matches!(options.transport(), rumqttc::Transport::Tcp));
    }

    #[test]
    fn tls_files_are_loaded() {
        let dir = std::env::temp_dir().join(format!("uns-mqtt-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let ca = dir.join("ca.pem");
        let cert = dir.join("client.pem");
        let key = dir.join("client.key");
        std::fs::write(&ca, b"ca").unwrap();
        std::fs::write(&cert, b"cert").unwrap();
        std::fs::write(&key, b"key").unwrap();

        let mut s = settings();
        s.tls = Some(TlsSettings {
            ca_file: ca.display().to_string(),
            cert_file: Some(cert.display().to_string()),
            key_file: Some(key.display().to_string()),
        });
        let options = assert_ok!(mqtt_options(&s));
        match options.transport() {
            rumqttc::Transport::Tls(TlsConfiguration::Simple {
                ca, client_auth, ..
            }) => {
                assert_eq!(ca, b"ca".to_vec());
                assert_eq!(client_auth, Some((b"cert".to_vec(), b"key".to_vec())));
            }
            _ => panic!("expected simple tls transport"),
        }

        s.tls = Some(TlsSettings {
            ca_file: dir.join("missing.pem").display().to_string(),
            cert_file: None,
            key_file: None,
        });
        let err = mqtt_options(&s).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn host_is_required() {
        let mut s = settings();
        s.host = None;
        let err = MqttTransportFactory.create(&s).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);

        let mut s = settings();
        s.client_id = String::new();
        assert!(MqttTransportFactory.create(&s).is_err());
    }

    #[tokio::test]
    async fn unreachable_broker_fails_connect() {
        let mut s = settings();
        s.host = Some("127.0.0.1".into());
        s.port = 1;
        let transport = assert_ok!(MqttTransportFactory.create(&s));

        let err = assert_err!(transport.connect().await);
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(!transport.is_connected());

        let err = assert_err!(transport.publish("timers/1s", b"{}".to_vec(), false).await);
        assert_eq!(err.kind(), ErrorKind::NotConnected);
        assert!(transport.recv().await.is_none());
        assert_ok!(transport.disconnect().await);
    }
}
