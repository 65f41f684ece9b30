use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use source_simulated::SimulatedSourceFactory;
use transport_local::LocalBroker;
use uns_engine::{Engine, EngineError, Factories, UnsConfig};

const CONFIG: &str = r#"
    [orchestrator]
    worker_names = ["cache", "history", "plc1", "heartbeat"]
    start_delay_ms = 200
    restart = "always"

    [[messaging_clients]]
    name = "main"

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
    nodes = "ns=2;s=Pump|ns=2;s=Missing|ns=2;s=Count"
    cadence = "timers/1s"

    [[workers.source_config.nodes]]
    id = "ns=2;s=Pump"
    data_type = "Pump"
    encoded = [170, 5, 0, 0, 1, 0, 0, 0]

    [[workers.source_config.nodes]]
    id = "ns=2;s=Count"
    data_type = "Double"
    step = 1.0

    [[workers.source_config.schema.types]]
    kind = "structured"
    name = "Pump"
    fields = [
        { name = "Speed", type_name = "opc:Int32" },
        { name = "State", type_name = "tns:PumpState" },
    ]

    [[workers.source_config.schema.types]]
    kind = "enumerated"
    name = "PumpState"
    values = [
        { name = "Stopped", value = 0 },
        { name = "Running", value = 1 },
    ]
"#;

fn factories(broker: &LocalBroker) -> Factories {
    Factories::new()
        .with_transport("local", Arc::new(broker.clone()))
        .with_tag_source("sim", Arc::new(SimulatedSourceFactory))
}

#[tokio::test(start_paused = true)]
async fn heartbeat_drives_acquisition_into_cache_and_history() {
    let broker = LocalBroker::new();
    let config = UnsConfig::parse(CONFIG).unwrap();
    let engine = Engine::bootstrap(config, &factories(&broker)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(6)).await;

    let store = engine.retained_store("latest").unwrap();
    let keys = store.keys();
    assert!(keys.contains(&"timers/1s".to_string()), "keys: {keys:?}");

    let pump_topic = "devices/plc1/nodes/ns=2;s=Pump";
    let got = store.get(&[pump_topic, "devices/plc1/nodes/ns=2;s=Missing"]);
    assert_eq!(got.len(), 1);
    let text = got[pump_topic].as_str().unwrap();
    let decoded: Value = serde_json::from_str(text).unwrap();
    assert_eq!(decoded, json!({ "Speed": 1450, "State": "Running" }));

    let history = engine.history("history").unwrap();
    assert!(!history.is_empty());
    assert!(history.snapshot().iter().all(|r| r.topic.starts_with("devices/plc1/")));
    let counts: Vec<Value> = history
        .for_topic("devices/plc1/nodes/ns=2;s=Count")
        .into_iter()
        .map(|r| r.value)
        .collect();
    assert_eq!(counts.first(), Some(&json!(0.0)));

    engine.shutdown().await;
    assert_eq!(broker.session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn external_publish_reaches_the_cache() {
    let broker = LocalBroker::new();
    let mut config = UnsConfig::parse(CONFIG).unwrap();
    config.orchestrator.worker_names = vec!["cache".into()];
    let engine = Engine::bootstrap(config, &factories(&broker)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let bus = engine.bus("main").unwrap();
    bus.publish("ops/notes", json!({"shift": "B"}), true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let store = engine.retained_store("latest").unwrap();
    assert_eq!(store.get(&["ops/notes"])["ops/notes"], json!(r#"{"shift":"B"}"#));
    assert!(broker.retained("ops/notes").is_some());
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn workers_ride_out_a_broker_outage() {
    let broker = LocalBroker::new();
    let mut config = UnsConfig::parse(CONFIG).unwrap();
    config.orchestrator.worker_names = vec!["cache".into(), "heartbeat".into()];
    let engine = Engine::bootstrap(config, &factories(&broker)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    broker.set_online(false);
    tokio::time::sleep(Duration::from_secs(5)).await;
    broker.set_online(true);
    tokio::time::sleep(Duration::from_secs(35)).await;

    // Cache re-subscribed and heartbeat publishes again.
    let store = engine.retained_store("latest").unwrap();
    let before = store.get(&["timers/1s"])["timers/1s"].clone();
    tokio::time::sleep(Duration::from_secs(2)).await;
    let after = store.get(&["timers/1s"])["timers/1s"].clone();
    assert_ne!(before, after);
    engine.shutdown().await;
}

#[tokio::test]
async fn invalid_config_starts_nothing() {
    let broker = LocalBroker::new();
    let mut config = UnsConfig::parse(CONFIG).unwrap();
    config.orchestrator.worker_names.push("ghost".into());
    let err = Engine::bootstrap(config, &factories(&broker)).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownWorker(_)));
    assert_eq!(broker.session_count(), 0);

    let config = UnsConfig::parse(&CONFIG.replace("sim://plc1", "opc.tcp://plc1:4840")).unwrap();
    let err = Engine::bootstrap(config, &factories(&broker)).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownTagSource(_)), "{err}");
}
