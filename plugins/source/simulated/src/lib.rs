use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use uns_api::schema::SchemaDictionary;
use uns_api::{NodeReading, TagSource, TagSourceFactory, TagSourceSettings, UnsError, WireValue};

/// Endpoint scheme served by this source.
pub const SCHEME: &str = "sim";

// ═══════════════════════════════════════════════════════════════
//  Config
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default, serde::Deserialize)]
pub struct SimulatedConfig {
    /// Refuse every connect.
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub nodes: Vec<SimulatedNode>,
    /// Dictionary serving the structured nodes.
    #[serde(default)]
    pub schema: Option<SchemaDictionary>,
    /// Login the endpoint accepts. Anonymous when absent.
    #[serde(default)]
    pub login: Option<SimulatedLogin>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct SimulatedLogin {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_data_type() -> String {
    "BaseDataType".to_string()
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SimulatedNode {
    pub id: String,
    #[serde(default = "default_data_type")]
    pub data_type: String,
    /// Static value, or the counter start when `step` is set.
    #[serde(default)]
    pub value: Option<Value>,
    /// Counter increment applied on every read.
    #[serde(default)]
    pub step: Option<f64>,
    /// Binary body of a structured value.
    #[serde(default)]
    pub encoded: Option<Vec<u8>>,
    /// Every read of this node fails.
    #[serde(default)]
    pub fail: bool,
}

// ═══════════════════════════════════════════════════════════════
//  SimulatedSource
// ═══════════════════════════════════════════════════════════════

/// Tag source backed by configured nodes instead of a field device.
pub struct SimulatedSource {
    source_id: String,
    endpoint_url: String,
    username: String,
    password: String,
    offline: bool,
    login: Option<SimulatedLogin>,
    nodes: HashMap<String, SimulatedNode>,
    counters: Mutex<HashMap<String, f64>>,
    schema: Option<Arc<SchemaDictionary>>,
    connected: AtomicBool,
}

impl SimulatedSource {
    pub fn new(settings: &TagSourceSettings, config: SimulatedConfig) -> Self {
        let counters = config
            .nodes
            .iter()
            .filter(|n| n.step.is_some())
            .map(|n| {
                let start = n.value.as_ref().and_then(Value::as_f64).unwrap_or(0.0);
                (n.id.clone(), start)
            })
            .collect();

        Self {
            source_id: settings.source_id.clone(),
            endpoint_url: settings.endpoint_url.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            offline: config.offline,
            login: config.login,
            nodes: config.nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            counters: Mutex::new(counters),
            schema: config.schema.map(Arc::new),
            connected: AtomicBool::new(false),
        }
    }

    fn next_count(&self, node: &str, step: f64) -> f64 {
        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("simulated counters lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let slot = counters.entry(node.to_string()).or_insert(0.0);
        let current = *slot;
        *slot += step;
        current
    }

    fn sample(&self, node: &SimulatedNode) -> Result<WireValue, UnsError> {
        if node.fail {
            return Err(UnsError::acquisition(format!("node '{}' is faulted", node.id)));
        }
        if let Some(bytes) = &node.encoded {
            return Ok(WireValue::Structured(bytes.clone()));
        }
        if let Some(step) = node.step {
            let n = self.next_count(&node.id, step);
            let value = serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null);
            return Ok(WireValue::Scalar(value));
        }
        Ok(WireValue::Scalar(node.value.clone().unwrap_or(Value::Null)))
    }
}

impl TagSource for SimulatedSource {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        Box::pin(async move {
            if self.offline {
                return Err(UnsError::connection(format!(
                    "endpoint {} is unreachable",
                    self.endpoint_url
                )));
            }
            if let Some(login) = &self.login {
                if login.username != self.username || login.password != self.password {
                    return Err(UnsError::connection(format!(
                        "endpoint {} rejected user '{}'",
                        self.endpoint_url, self.username
                    )));
                }
            }
            self.connected.store(true, Ordering::SeqCst);
            tracing::info!(
                source = %self.source_id,
                endpoint = %self.endpoint_url,
                user = %self.username,
                nodes = self.nodes.len(),
                "simulated source connected"
            );
            Ok(())
        })
    }

    fn read(
        &self,
        node: &str,
    ) -> Pin<Box<dyn Future<Output = Result<NodeReading, UnsError>> + Send + '_>> {
        let node = node.to_string();
        Box::pin(async move {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(UnsError::not_connected(format!(
                    "source '{}' is not connected",
                    self.source_id
                )));
            }
            let cfg = self
                .nodes
                .get(&node)
                .ok_or_else(|| UnsError::acquisition(format!("unknown node '{node}'")))?;
            Ok(NodeReading {
                value: self.sample(cfg)?,
                data_type: cfg.data_type.clone(),
            })
        })
    }

    fn schema(
        &self,
        data_type: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<SchemaDictionary>, UnsError>> + Send + '_>> {
        let data_type = data_type.to_string();
        Box::pin(async move {
            match &self.schema {
                Some(dict) if dict.find(&data_type).is_some() => Ok(dict.clone()),
                _ => Err(UnsError::schema(format!(
                    "no schema dictionary declares '{data_type}'"
                ))),
            }
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        Box::pin(async move {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  SimulatedSourceFactory
// ═══════════════════════════════════════════════════════════════

pub struct SimulatedSourceFactory;

impl TagSourceFactory for SimulatedSourceFactory {
    fn create(&self, settings: &TagSourceSettings) -> Result<Arc<dyn TagSource>, UnsError> {
        if !settings.endpoint_url.starts_with("sim://") {
            return Err(UnsError::config(format!(
                "simulated source needs a sim:// endpoint, got '{}'",
                settings.endpoint_url
            )));
        }
        let config: SimulatedConfig = if settings.config_json.trim().is_empty() || settings.config_json == "{}" {
            SimulatedConfig::default()
        } else {
            serde_json::from_str(&settings.config_json)
                .map_err(|e| UnsError::config(format!("simulated source config: {e}")))?
        };
        Ok(Arc::new(SimulatedSource::new(settings, config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};
    use uns_api::ErrorKind;

    fn settings(config: Value) -> TagSourceSettings {
        TagSourceSettings {
            source_id: "plc1".into(),
            endpoint_url: "sim://plc1".into(),
            username: String::new(),
            password: String::new(),
            config_json: config.to_string(),
        }
    }

    #[tokio::test]
    async fn reads_static_counter_and_structured_nodes() {
        let source = SimulatedSourceFactory
            .create(&settings(json!({
                "nodes": [
                    { "id": "ns=2;s=Name", "data_type": "String", "value": "pump" },
                    { "id": "ns=2;s=Count", "data_type": "Double", "value": 10, "step": 2 },
                    { "id": "ns=2;s=Pump", "data_type": "Pump", "encoded": [1, 0, 0, 0] }
                ],
                "schema": {
                    "types": [
                        { "kind": "structured", "name": "Pump",
                          "fields": [{ "name": "Speed", "type_name": "opc:Int32" }] }
                    ]
                }
            })))
            .unwrap();
        assert_ok!(source.connect().await);

        let name = source.read("ns=2;s=Name").await.unwrap();
        assert_eq!(name.value, WireValue::Scalar(json!("pump")));
        assert_eq!(name.data_type, "String");

        assert_eq!(source.read("ns=2;s=Count").await.unwrap().value, WireValue::Scalar(json!(10.0)));
        assert_eq!(source.read("ns=2;s=Count").await.unwrap().value, WireValue::Scalar(json!(12.0)));

        let pump = source.read("ns=2;s=Pump").await.unwrap();
        assert_eq!(pump.value, WireValue::Structured(vec![1, 0, 0, 0]));
        let dict = source.schema("Pump").await.unwrap();
        assert!(dict.structured("Pump").is_some());
    }

    #[tokio::test]
    async fn unknown_and_faulted_nodes_fail() {
        let source = SimulatedSourceFactory
            .create(&settings(json!({ "nodes": [{ "id": "bad", "fail": true }] })))
            .unwrap();
        assert_ok!(source.connect().await);

        let err = assert_err!(source.read("missing").await);
        assert_eq!(err.kind(), ErrorKind::Acquisition);
        let err = assert_err!(source.read("bad").await);
        assert_eq!(err.kind(), ErrorKind::Acquisition);
        let err = assert_err!(source.schema("Pump").await);
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[tokio::test]
    async fn offline_source_refuses_connect() {
        let source = SimulatedSourceFactory
            .create(&settings(json!({ "offline": true })))
            .unwrap();
        let err = assert_err!(source.connect().await);
        assert_eq!(err.kind(), ErrorKind::Connection);
        let err = assert_err!(source.read("x").await);
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn login_checks_worker_credentials() {
        let login = json!({ "login": { "username": "opc-reader", "password": "pw" } });

        let source = SimulatedSourceFactory.create(&settings(login.clone())).unwrap();
        let err = assert_err!(source.connect().await);
        assert_eq!(err.kind(), ErrorKind::Connection);

        let mut s = settings(login);
        s.username = "opc-reader".into();
        s.password = "pw".into();
        let source = SimulatedSourceFactory.create(&s).unwrap();
        assert_ok!(source.connect().await);
    }

    #[test]
    fn rejects_foreign_scheme() {
        let mut s = settings(json!({}));
        s.endpoint_url = "opc.tcp://plc1:4840".into();
        let err = SimulatedSourceFactory.create(&s).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
