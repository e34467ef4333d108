//! Core infrastructure tests.

mod common;

use common::config_file;
use linemq::cluster::MemoryCoordination;
use linemq::core::config::{Config, ConfigOverrides, StorageBackend};
use linemq::core::error::{ErrorKind, HttpErrorMapping, QueueError};
use linemq::core::runtime::{ComponentHealth, Runtime};
use linemq::core::time::{duration_to_ms, Clock, ManualClock, Tick};
use linemq::queue::CreateRequest;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Config tests
// ============================================================================

#[test]
fn empty_config_uses_defaults() {
    let config = Config::from_toml("").unwrap();
    assert_eq!(config.node.ip, "127.0.0.1");
    assert_eq!(config.node.port, 8808);
    assert_eq!(config.storage.backend, StorageBackend::Durable);
    assert_eq!(config.storage.dir, "data");
    assert!(config.storage.is_strict());
    assert_eq!(config.queue.recycle_tick(), Duration::from_secs(1));
    assert!(!config.cluster.is_clustered());
    assert_eq!(config.telemetry.log_level, "info");
}

#[test]
fn parse_full_config_file() {
    let file = config_file(
        r#"
[node]
ip = "10.1.2.3"
port = 9000

[storage]
backend = "memory"
durability_mode = "group-fsync"

[queue]
recycle_tick_ms = 250
max_payload_bytes = 4096

[cluster]
name = "prod"
endpoints = ["http://etcd-0:2379", "etcd-1:2379"]
heartbeat_interval_ms = 1000
peer_ttl_ms = 4000

[telemetry]
log_level = "debug"
"#,
    );

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.node.port, 9000);
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert!(!config.storage.is_strict());
    assert_eq!(config.queue.max_payload_bytes, 4096);
    assert_eq!(config.cluster.endpoints.len(), 2);
    assert!(config.cluster.is_clustered());
    assert_eq!(config.telemetry.log_level, "debug");
}

#[test]
fn invalid_values_are_rejected() {
    let cases = [
        "[storage]\ndurability_mode = \"sometimes\"",
        "[storage]\nbackend = \"tape\"",
        "[storage]\ncompaction_garbage_ratio = 1.5",
        "[queue]\nrecycle_tick_ms = 0",
        "[cluster]\nname = \"a/b\"",
        "[cluster]\nheartbeat_interval_ms = 5000\npeer_ttl_ms = 5000",
        "[cluster]\nendpoints = [\"\"]",
        "[telemetry]\nlog_level = \"loud\"",
        "[node]\nport = 0",
    ];
    for case in cases {
        assert!(Config::from_toml(case).is_err(), "accepted: {}", case);
    }
}

#[test]
fn missing_config_file_is_an_error() {
    let err = Config::from_file(std::path::Path::new("/nonexistent/linemq.toml")).unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
}

#[test]
fn overrides_replace_file_values() {
    let mut config = Config::from_toml("[storage]\ndir = \"/var/lib/linemq\"").unwrap();
    config.apply_overrides(&ConfigOverrides {
        log_level: Some("warn".to_string()),
        storage_dir: None,
        backend: Some(StorageBackend::Memory),
        port: Some(7000),
    });

    assert_eq!(config.telemetry.log_level, "warn");
    assert_eq!(config.storage.dir, "/var/lib/linemq");
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.node.port, 7000);
}

#[test]
fn rendered_config_parses_back() {
    let mut config = Config::default();
    config.cluster.endpoints = vec!["etcd:2379".to_string()];
    config.queue.recycle_tick_ms = 100;

    let parsed = Config::from_toml(&config.to_toml().unwrap()).unwrap();
    assert_eq!(parsed.cluster.endpoints, config.cluster.endpoints);
    assert_eq!(parsed.queue.recycle_tick_ms, 100);
}

// ============================================================================
// Error tests
// ============================================================================

#[test]
fn error_kinds_map_to_status_codes() {
    let cases = [
        (QueueError::validation("bad key"), ErrorKind::Validation, 400),
        (
            QueueError::InvalidRecycle {
                recycle: Duration::ZERO,
            },
            ErrorKind::InvalidArgument,
            400,
        ),
        (
            QueueError::TopicNotFound {
                topic: "foo".to_string(),
            },
            ErrorKind::NotFound,
            404,
        ),
        (
            QueueError::Empty {
                topic: "foo".to_string(),
                line: "x".to_string(),
            },
            ErrorKind::NotFound,
            404,
        ),
        (
            QueueError::LineExists {
                topic: "foo".to_string(),
                line: "x".to_string(),
            },
            ErrorKind::Conflict,
            409,
        ),
        (
            QueueError::io(&anyhow::anyhow!("disk full")),
            ErrorKind::Io,
            500,
        ),
        (QueueError::Closed, ErrorKind::Closed, 503),
    ];

    for (error, kind, status) in cases {
        assert_eq!(error.kind(), kind, "{}", error);
        assert_eq!(HttpErrorMapping::status_code(&error), status, "{}", error);
    }
}

#[test]
fn client_errors_are_distinguished() {
    assert!(QueueError::validation("x").is_client_error());
    assert!(!QueueError::Closed.is_client_error());
    assert!(!QueueError::io(&anyhow::anyhow!("boom")).is_client_error());

    let err = QueueError::io(&anyhow::anyhow!("disk full").context("failed to append"));
    assert!(err.to_string().contains("disk full"));
}

// ============================================================================
// Time tests
// ============================================================================

#[test]
fn manual_clock_moves_only_when_told() {
    let clock = ManualClock::new(1_000);
    assert_eq!(clock.now(), Tick::new(1_000));

    clock.advance(Duration::from_millis(250));
    assert_eq!(clock.now().ms, 1_250);

    clock.set(10);
    assert_eq!(clock.now().ms, 10);
    assert_eq!(Tick::new(10).add_ms(15), Tick::new(25));
    assert_eq!(Tick::new(u64::MAX).add_ms(1).ms, u64::MAX);
}

#[test]
fn durations_round_up_to_milliseconds() {
    assert_eq!(duration_to_ms(Duration::from_micros(1_999)), 2);
    assert_eq!(duration_to_ms(Duration::from_nanos(1)), 1);
    assert_eq!(duration_to_ms(Duration::ZERO), 0);
    assert_eq!(duration_to_ms(Duration::from_secs(10)), 10_000);
}

// ============================================================================
// Runtime tests
// ============================================================================

fn memory_config() -> Config {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    config.queue.recycle_tick_ms = 20;
    config.cluster.heartbeat_interval_ms = 20;
    config.cluster.peer_ttl_ms = 60;
    config
}

#[test]
fn runtime_rejects_invalid_config() {
    let mut config = memory_config();
    config.telemetry.log_level = "chatty".to_string();
    assert!(Runtime::new(config).is_err());
}

#[tokio::test]
async fn standalone_runtime_serves_traffic() {
    let mut runtime = Runtime::new(memory_config()).unwrap();
    assert!(runtime.engine().is_none());

    runtime.start().await.unwrap();
    assert!(runtime.is_running());
    assert!(runtime.is_ready());
    assert_eq!(runtime.health().coordinator, ComponentHealth::Disabled);

    let engine = runtime.engine().unwrap();
    engine.create(&CreateRequest::topic("foo")).unwrap();
    engine
        .create(&CreateRequest::line("foo", "x", Duration::from_secs(5)))
        .unwrap();
    engine.push("foo", b"hello").unwrap();
    assert_eq!(&engine.pop("foo/x").unwrap().payload[..], b"hello");

    runtime.stop().await.unwrap();
    assert!(!runtime.is_running());
    assert!(engine.is_closed());
    assert_eq!(runtime.health().engine, ComponentHealth::Stopped);
    assert_eq!(runtime.health().coordinator, ComponentHealth::Disabled);
}

#[tokio::test]
async fn clustered_runtime_registers_and_deregisters() {
    let service = MemoryCoordination::new();
    let mut runtime = Runtime::new(memory_config())
        .unwrap()
        .with_coordination(Arc::new(service.clone()));

    runtime.start().await.unwrap();
    assert_eq!(runtime.health().coordinator, ComponentHealth::Healthy);

    runtime
        .engine()
        .unwrap()
        .create(&CreateRequest::topic("orders"))
        .unwrap();
    let mut published = false;
    for _ in 0..200 {
        if service.len() == 2 {
            published = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(published);

    runtime.stop().await.unwrap();
    assert!(service.is_empty());
}

#[tokio::test]
async fn runtime_run_returns_after_shutdown_request() {
    let mut runtime = Runtime::new(memory_config()).unwrap();
    let shutdown = runtime.shutdown_receiver();

    // A pending request makes `run` stop right after starting.
    runtime.shutdown();
    assert!(*shutdown.borrow());
    runtime.run().await.unwrap();

    assert!(!runtime.is_running());
    assert_eq!(runtime.health().storage, ComponentHealth::Stopped);
}
