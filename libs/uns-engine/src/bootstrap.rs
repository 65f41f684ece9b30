use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use storage_memory::{HistoryWindow, RetainedTable};
use uns_api::{
    MessageBus, RetainedStore, TagSourceFactory, TagSourceSettings, TransportFactory, Worker,
};

use crate::bus::BusClient;
use crate::config::{MessagingClientConfig, UnsConfig, WorkerConfig, WorkerKind};
use crate::error::EngineError;
use crate::orchestrator::{Orchestrator, OrchestratorSettings, Supervisor, WorkerSet};
use crate::workers::{AcquisitionWorker, CacheWorker, HeartbeatWorker, HistoryWorker};

/// How long shutdown waits for workers before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ═══════════════════════════════════════════════════════════════
//  Factories
// ═══════════════════════════════════════════════════════════════

/// Transport factories by name, tag-source factories by endpoint scheme.
#[derive(Default, Clone)]
pub struct Factories {
    transports: HashMap<String, Arc<dyn TransportFactory>>,
    tag_sources: HashMap<String, Arc<dyn TagSourceFactory>>,
}

impl Factories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(mut self, name: impl Into<String>, factory: Arc<dyn TransportFactory>) -> Self {
        self.transports.insert(name.into(), factory);
        self
    }

    pub fn with_tag_source(mut self, scheme: impl Into<String>, factory: Arc<dyn TagSourceFactory>) -> Self {
        self.tag_sources.insert(scheme.into(), factory);
        self
    }

    fn transport(&self, name: &str) -> Result<&Arc<dyn TransportFactory>, EngineError> {
        self.transports
            .get(name)
            .ok_or_else(|| EngineError::UnknownTransport(name.to_string()))
    }

    fn tag_source(&self, endpoint_url: &str) -> Result<&Arc<dyn TagSourceFactory>, EngineError> {
        endpoint_url
            .split_once("://")
            .and_then(|(scheme, _)| self.tag_sources.get(scheme))
            .ok_or_else(|| EngineError::UnknownTagSource(endpoint_url.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Engine
// ═══════════════════════════════════════════════════════════════

/// The running engine: stores, buses and the supervised workers.
pub struct Engine {
    token: CancellationToken,
    stores: HashMap<String, Arc<RetainedTable>>,
    histories: HashMap<String, Arc<HistoryWindow>>,
    worker_buses: HashMap<String, Arc<BusClient>>,
    publishers: HashMap<String, Arc<BusClient>>,
    supervisor: Option<Supervisor>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("stores", &self.stores.keys().collect::<Vec<_>>())
            .field("workers", &self.worker_buses.keys().collect::<Vec<_>>())
            .field("messaging_clients", &self.publishers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Engine {
    /// Validate the configuration, build every component and start the
    /// orchestrator. Nothing is started when validation fails.
    pub async fn bootstrap(config: UnsConfig, factories: &Factories) -> Result<Self, EngineError> {
        config.validate()?;
        let token = CancellationToken::new();

        // --- 1. Retained stores ---
        let stores: HashMap<String, Arc<RetainedTable>> = config
            .retained_stores
            .iter()
            .map(|s| {
                tracing::info!(store = %s.name, "created retained store");
                (s.name.clone(), Arc::new(RetainedTable::new()))
            })
            .collect();

        // --- 2. Publishing connection per messaging client ---
        let mut publishers = HashMap::new();
        for client in &config.messaging_clients {
            let bus = create_bus(client, None, factories, &token)
                .map_err(|e| e.with_context(format!("messaging client '{}'", client.name)))?;
            publishers.insert(client.name.clone(), Arc::new(bus));
        }

        // --- 3. Workers, each with its own connection ---
        let mut set = WorkerSet::new();
        let mut worker_buses = HashMap::new();
        let mut histories = HashMap::new();
        for worker_cfg in &config.workers {
            let ctx = format!("worker '{}'", worker_cfg.name);
            let client = config
                .messaging_client(&worker_cfg.messaging_client)
                .ok_or_else(|| EngineError::UnknownMessagingClient(worker_cfg.messaging_client.clone()))
                .map_err(|e| e.with_context(&ctx))?;
            let bus = Arc::new(
                create_bus(client, Some(&worker_cfg.name), factories, &token)
                    .map_err(|e| e.with_context(&ctx))?,
            );

            let worker = create_worker(worker_cfg, bus.clone(), &stores, &mut histories, factories)
                .map_err(|e| e.with_context(&ctx))?;
            tracing::info!(
                worker = %worker_cfg.name,
                kind = worker_cfg.kind.label(),
                client = %client.name,
                "created worker"
            );
            set.insert(worker)?;
            worker_buses.insert(worker_cfg.name.clone(), bus);
        }

        // --- 4. Orchestrator ---
        let orchestrator = Orchestrator::new(
            &set,
            &config.orchestrator.worker_names,
            OrchestratorSettings {
                start_delay: config.orchestrator.start_delay(),
                restart: config.orchestrator.restart,
                restart_backoff: config.orchestrator.restart_backoff.into(),
            },
        )?;
        let supervisor = orchestrator.start(token.clone());

        Ok(Engine {
            token,
            stores,
            histories,
            worker_buses,
            publishers,
            supervisor: Some(supervisor),
        })
    }

    /// Latest-value lookups for external collaborators.
    pub fn retained_store(&self, name: &str) -> Option<Arc<dyn RetainedStore>> {
        self.stores
            .get(name)
            .map(|s| s.clone() as Arc<dyn RetainedStore>)
    }

    /// History window of a history worker.
    pub fn history(&self, worker: &str) -> Option<Arc<HistoryWindow>> {
        self.histories.get(worker).cloned()
    }

    /// Publishing connection of a messaging client.
    pub fn bus(&self, messaging_client: &str) -> Option<Arc<dyn MessageBus>> {
        self.publishers
            .get(messaging_client)
            .map(|b| b.clone() as Arc<dyn MessageBus>)
    }

    /// Graceful shutdown: cancel, wait for workers (aborting stragglers),
    /// then disconnect every connection.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.shutdown(SHUTDOWN_GRACE).await;
        }

        for (name, bus) in self.worker_buses.iter().chain(self.publishers.iter()) {
            if let Err(e) = bus.disconnect().await {
                tracing::error!(client = %name, error = %e, "disconnect failed");
            }
        }
        tracing::info!("engine shut down");
    }
}

fn create_bus(
    client: &MessagingClientConfig,
    worker: Option<&str>,
    factories: &Factories,
    token: &CancellationToken,
) -> Result<BusClient, EngineError> {
    let factory = factories.transport(&client.transport)?;
    let settings = client.settings(worker);
    let transport = factory.create(&settings)?;
    let name = match worker {
        Some(w) => format!("{}/{w}", client.name),
        None => client.name.clone(),
    };
    Ok(BusClient::new(name, transport, client.reconnect.into(), token.child_token()))
}

fn create_worker(
    cfg: &WorkerConfig,
    bus: Arc<BusClient>,
    stores: &HashMap<String, Arc<RetainedTable>>,
    histories: &mut HashMap<String, Arc<HistoryWindow>>,
    factories: &Factories,
) -> Result<Arc<dyn Worker>, EngineError> {
    let bus: Arc<dyn MessageBus> = bus;
    let worker: Arc<dyn Worker> = match &cfg.kind {
        WorkerKind::Heartbeat => Arc::new(HeartbeatWorker::new(&cfg.name, bus)),
        WorkerKind::Cache => {
            let store_name = cfg
                .retained_store
                .as_deref()
                .ok_or_else(|| EngineError::Config("cache worker needs a retained_store".into()))?;
            let store = stores
                .get(store_name)
                .cloned()
                .ok_or_else(|| EngineError::UnknownRetainedStore(store_name.to_string()))?;
            Arc::new(CacheWorker::new(&cfg.name, bus, store))
        }
        WorkerKind::History { topics } => {
            let worker = HistoryWorker::new(&cfg.name, bus, topics.clone());
            histories.insert(cfg.name.clone(), worker.window());
            Arc::new(worker)
        }
        WorkerKind::Acquisition(acq) => {
            let settings = TagSourceSettings {
                source_id: cfg.name.clone(),
                endpoint_url: acq.endpoint_url.clone(),
                username: acq.username.clone(),
                password: acq.password.clone(),
                config_json: acq.source_config_json()?,
            };
            let source = factories.tag_source(&acq.endpoint_url)?.create(&settings)?;
            Arc::new(AcquisitionWorker::new(
                &cfg.name,
                bus,
                source,
                acq.node_list(),
                acq.cadence.clone(),
            ))
        }
    };
    Ok(worker)
}
