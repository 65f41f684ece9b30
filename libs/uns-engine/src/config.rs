use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use uns_api::topic;
use uns_api::{TlsSettings, TransportSettings};

use crate::backoff::Backoff;
use crate::error::EngineError;

/// Root configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnsConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub messaging_clients: Vec<MessagingClientConfig>,

    #[serde(default)]
    pub retained_stores: Vec<RetainedStoreConfig>,

    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    /// Restart a worker after it stops, with backoff.
    #[default]
    Always,
    /// Start once and leave it.
    Never,
}

fn default_start_delay_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Workers to start, in start order.
    #[serde(default)]
    pub worker_names: Vec<String>,

    /// Delay between two successive worker starts.
    #[serde(default = "default_start_delay_ms")]
    pub start_delay_ms: u64,

    #[serde(default)]
    pub restart: RestartPolicy,

    #[serde(default)]
    pub restart_backoff: BackoffConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_names: Vec::new(),
            start_delay_ms: default_start_delay_ms(),
            restart: RestartPolicy::default(),
            restart_backoff: BackoffConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }
}

fn default_initial_ms() -> u64 {
    500
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl From<BackoffConfig> for Backoff {
    fn from(cfg: BackoffConfig) -> Self {
        Backoff {
            initial: Duration::from_millis(cfg.initial_ms),
            max: Duration::from_millis(cfg.max_ms),
            multiplier: cfg.multiplier,
        }
    }
}

impl BackoffConfig {
    fn validate(&self, ctx: &str) -> Result<(), EngineError> {
        if self.initial_ms == 0 || self.max_ms < self.initial_ms {
            return Err(EngineError::Config(format!(
                "{ctx}: backoff needs 0 < initial_ms <= max_ms"
            )));
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(EngineError::Config(format!(
                "{ctx}: backoff multiplier must be a finite number >= 1"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Messaging clients & stores
// ---------------------------------------------------------------------------

fn default_transport() -> String {
    "local".to_string()
}

fn default_port() -> u16 {
    1883
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagingClientConfig {
    pub name: String,

    /// Name of the registered transport factory.
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Defaults to `name`.
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Defaults to the client id.
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: String,

    /// Connect over TLS with these PEM files.
    #[serde(default)]
    pub tls: Option<TlsSettings>,

    #[serde(default)]
    pub reconnect: BackoffConfig,
}

impl MessagingClientConfig {
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or(&self.name)
    }

    /// Transport settings for a connection of this client. A worker gets its
    /// own connection, identified as `<client_id>-<worker>`.
    pub fn settings(&self, worker: Option<&str>) -> TransportSettings {
        let client_id = match worker {
            Some(w) => format!("{}-{w}", self.client_id()),
            None => self.client_id().to_string(),
        };
        TransportSettings {
            username: self
                .username
                .clone()
                .unwrap_or_else(|| self.client_id().to_string()),
            client_id,
            host: self.host.clone(),
            port: self.port,
            password: self.password.clone(),
            tls: self.tls.clone(),
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        let ctx = format!("messaging client '{}'", self.name);
        self.reconnect.validate(&ctx)?;
        if let Some(tls) = &self.tls {
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                return Err(EngineError::Config(format!(
                    "{ctx}: tls cert_file and key_file must be set together"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetainedStoreConfig {
    pub name: String,
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub name: String,

    /// Messaging client the worker talks through.
    pub messaging_client: String,

    #[serde(default)]
    pub retained_store: Option<String>,

    #[serde(flatten)]
    pub kind: WorkerKind,
}

fn default_history_topics() -> Vec<String> {
    vec!["devices/#".to_string()]
}

fn default_cadence() -> String {
    "timers/#".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerKind {
    Heartbeat,
    Cache,
    History {
        #[serde(default = "default_history_topics")]
        topics: Vec<String>,
    },
    Acquisition(AcquisitionConfig),
}

impl WorkerKind {
    pub fn label(&self) -> &'static str {
        match self {
            WorkerKind::Heartbeat => "heartbeat",
            WorkerKind::Cache => "cache",
            WorkerKind::History { .. } => "history",
            WorkerKind::Acquisition(_) => "acquisition",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionConfig {
    pub endpoint_url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Pipe-delimited node identifiers, read in order.
    pub nodes: String,

    /// Filter of the cadence signal that triggers a pass.
    #[serde(default = "default_cadence")]
    pub cadence: String,

    /// Handed to the tag-source factory as JSON.
    #[serde(default)]
    pub source_config: Option<toml::Value>,
}

impl AcquisitionConfig {
    pub fn node_list(&self) -> Vec<String> {
        self.nodes
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn source_config_json(&self) -> Result<String, EngineError> {
        match &self.source_config {
            None => Ok("{}".to_string()),
            Some(v) => serde_json::to_string(v)
                .map_err(|e| EngineError::Config(format!("source_config: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Load / validate
// ---------------------------------------------------------------------------

impl UnsConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn messaging_client(&self, name: &str) -> Option<&MessagingClientConfig> {
        self.messaging_clients.iter().find(|c| c.name == name)
    }

    pub fn worker(&self, name: &str) -> Option<&WorkerConfig> {
        self.workers.iter().find(|w| w.name == name)
    }

    /// Check every cross-reference before anything is started.
    pub fn validate(&self) -> Result<(), EngineError> {
        unique("messaging client", self.messaging_clients.iter().map(|c| c.name.as_str()))?;
        unique("retained store", self.retained_stores.iter().map(|s| s.name.as_str()))?;
        unique("worker", self.workers.iter().map(|w| w.name.as_str()))?;
        unique("orchestrator worker name", self.orchestrator.worker_names.iter().map(String::as_str))?;

        self.orchestrator.restart_backoff.validate("orchestrator")?;
        for client in &self.messaging_clients {
            client.validate()?;
        }

        for name in &self.orchestrator.worker_names {
            if self.worker(name).is_none() {
                return Err(EngineError::UnknownWorker(name.clone()).with_context("orchestrator"));
            }
        }

        for worker in &self.workers {
            self.validate_worker(worker)
                .map_err(|e| e.with_context(format!("worker '{}'", worker.name)))?;
        }
        Ok(())
    }

    fn validate_worker(&self, worker: &WorkerConfig) -> Result<(), EngineError> {
        if self.messaging_client(&worker.messaging_client).is_none() {
            return Err(EngineError::UnknownMessagingClient(worker.messaging_client.clone()));
        }
        if let Some(store) = &worker.retained_store {
            if !self.retained_stores.iter().any(|s| &s.name == store) {
                return Err(EngineError::UnknownRetainedStore(store.clone()));
            }
        }

        match &worker.kind {
            WorkerKind::Heartbeat => {}
            WorkerKind::Cache => {
                if worker.retained_store.is_none() {
                    return Err(EngineError::Config(
                        "cache worker needs a retained_store".to_string(),
                    ));
                }
            }
            WorkerKind::History { topics } => {
                if topics.is_empty() {
                    return Err(EngineError::Config("history worker needs topics".to_string()));
                }
                for filter in topics {
                    check_filter(filter)?;
                }
            }
            WorkerKind::Acquisition(acq) => {
                if acq.endpoint_url.trim().is_empty() {
                    return Err(EngineError::Config("endpoint_url is empty".to_string()));
                }
                if acq.node_list().is_empty() {
                    return Err(EngineError::Config("nodes list is empty".to_string()));
                }
                check_filter(&acq.cadence)?;
            }
        }
        Ok(())
    }
}

fn unique<'a>(what: &str, names: impl Iterator<Item = &'a str>) -> Result<(), EngineError> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(EngineError::Config(format!("{what} with empty name")));
        }
        if !seen.insert(name) {
            return Err(EngineError::Config(format!("duplicate {what} '{name}'")));
        }
    }
    Ok(())
}

fn check_filter(filter: &str) -> Result<(), EngineError> {
    if topic::is_valid_filter(filter) {
        Ok(())
    } else {
        Err(EngineError::Config(format!("invalid topic filter '{filter}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [orchestrator]
        worker_names = ["heartbeat", "cache", "history", "plc1"]
        start_delay_ms = 100
        restart = "never"

        [[messaging_clients]]
        name = "main"
        host = "broker.local"

        [messaging_clients.reconnect]
        initial_ms = 250

        [[retained_stores]]
        name = "latest"

        [[workers]]
        name = "heartbeat"
        kind = "heartbeat"
        messaging_client = "main"

        [[workers]]
        name = "cache"
        kind = "cache"
        messaging_client = "main"
        retained_store = "latest"

        [[workers]]
        name = "history"
        kind = "history"
        messaging_client = "main"

        [[workers]]
        name = "plc1"
        kind = "acquisition"
        messaging_client = "main"
        endpoint_url = "sim://plc1"
        nodes = "ns=2;s=Speed| ns=2;s=Pump ||"

        [workers.source_config]
        offline = false
    "#;

    #[test]
    fn parses_full_config_with_defaults() {
        let cfg = UnsConfig::parse(FULL).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.orchestrator.start_delay(), Duration::from_millis(100));
        assert_eq!(cfg.orchestrator.restart, RestartPolicy::Never);

        let main = cfg.messaging_client("main").unwrap();
        assert_eq!(main.transport, "local");
        assert_eq!(main.port, 1883);
        assert_eq!(main.reconnect.initial_ms, 250);
        assert_eq!(main.reconnect.max_ms, 30_000);

        let settings = main.settings(Some("cache"));
        assert_eq!(settings.client_id, "main-cache");
        assert_eq!(settings.username, "main");
        assert_eq!(settings.host.as_deref(), Some("broker.local"));

        match &cfg.worker("history").unwrap().kind {
            WorkerKind::History { topics } => assert_eq!(topics, &vec!["devices/#".to_string()]),
            other => panic!("unexpected {other:?}"),
        }
        match &cfg.worker("plc1").unwrap().kind {
            WorkerKind::Acquisition(acq) => {
                assert_eq!(acq.node_list(), vec!["ns=2;s=Speed", "ns=2;s=Pump"]);
                assert_eq!(acq.cadence, "timers/#");
                assert_eq!(acq.source_config_json().unwrap(), r#"{"offline":false}"#);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn defaults_when_sections_missing() {
        let cfg = UnsConfig::parse("").unwrap();
        assert_eq!(cfg.orchestrator.start_delay_ms, 2000);
        assert_eq!(cfg.orchestrator.restart, RestartPolicy::Always);
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_worker_name_fails_validation() {
        let mut cfg = UnsConfig::parse(FULL).unwrap();
        cfg.orchestrator.worker_names.push("ghost".into());
        assert!(matches!(cfg.validate(), Err(EngineError::UnknownWorker(_))));
    }

    #[test]
    fn unresolved_references_fail_validation() {
        let cfg = UnsConfig::parse(&FULL.replace(r#"retained_store = "latest""#, r#"retained_store = "gone""#)).unwrap();
        assert!(matches!(cfg.validate(), Err(EngineError::UnknownRetainedStore(_))));

        let cfg = UnsConfig::parse(&FULL.replacen(r#"messaging_client = "main""#, r#"messaging_client = "aux""#, 1)).unwrap();
        assert!(matches!(cfg.validate(), Err(EngineError::UnknownMessagingClient(_))));
    }

    #[test]
    fn cache_without_store_and_empty_nodes_fail() {
        let cfg = UnsConfig::parse(&FULL.replace(r#"retained_store = "latest""#, "")).unwrap();
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));

        let cfg = UnsConfig::parse(&FULL.replace("ns=2;s=Speed| ns=2;s=Pump ||", " | ")).unwrap();
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn duplicate_names_fail() {
        let mut cfg = UnsConfig::parse(FULL).unwrap();
        let dup = cfg.workers[0].clone();
        cfg.workers.push(dup);
        assert!(matches!(cfg.validate(), Err(EngineError::Config(msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn tls_settings_reach_the_transport() {
        let with_tls = FULL.replace(
            "[messaging_clients.reconnect]",
            "[messaging_clients.tls]\n        ca_file = \"ca.pem\"\n        cert_file = \"client.pem\"\n        key_file = \"client.key\"\n\n        [messaging_clients.reconnect]",
        );
        let cfg = UnsConfig::parse(&with_tls).unwrap();
        cfg.validate().unwrap();
        let tls = cfg.messaging_client("main").unwrap().settings(None).tls.unwrap();
        assert_eq!(tls.ca_file, "ca.pem");
        assert_eq!(tls.key_file.as_deref(), Some("client.key"));

        let cfg = UnsConfig::parse(&with_tls.replace("key_file = \"client.key\"", "")).unwrap();
        assert!(matches!(cfg.validate(), Err(EngineError::Config(msg)) if msg.contains("key_file")));
    }

    #[test]
    fn unknown_kind_is_a_parse_error() {
        let err = UnsConfig::parse(
            r#"
            [[workers]]
            name = "x"
            kind = "teleport"
            messaging_client = "main"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
