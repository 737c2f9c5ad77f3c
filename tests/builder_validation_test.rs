//! Integration tests for component construction through the public API

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use kafka_components::kafka::{KafkaConfig, SimpleComponentBuilder};
use kafka_components::models::Batch;
use kafka_components::test_utils::{noop_processor, MockBroker};
use kafka_components::{Error, GroupComponentBuilder, StartOffset};

fn config_message(err: Error) -> String {
    match err {
        Error::Config(message) => message,
        other => panic!("expected config error, got {:?}", other),
    }
}

#[test]
fn test_every_problem_is_reported_at_once() {
    let err = GroupComponentBuilder::new("")
        .batch_size(0)
        .retry_wait(Duration::ZERO)
        .failure_strategy_name("abort")
        .build()
        .err()
        .expect("build should fail");

    let message = config_message(err);
    for field in ["name", "brokers", "topics", "group_id", "processor", "batch_size", "retry_wait", "failure_strategy"] {
        assert!(message.contains(&format!("'{}'", field)), "missing {} in {}", field, message);
    }
    assert!(message.contains("validation failed with 8 error(s)"), "{}", message);
}

#[test]
fn test_simple_component_rules() {
    let err = SimpleComponentBuilder::new("orders")
        .brokers(["localhost:9092"])
        .topic("orders")
        .shared_processor(noop_processor())
        .batch_timeout(Duration::ZERO)
        .start_offset(StartOffset::Stored)
        .build()
        .err()
        .expect("build should fail");

    let message = config_message(err);
    assert!(message.contains("2 error(s)"), "{}", message);
    assert!(message.contains("'batch_timeout'"));
    assert!(message.contains("'start_offset'"));
}

#[test]
fn test_valid_group_component() {
    let broker = MockBroker::new();
    let component = GroupComponentBuilder::new("orders")
        .brokers(["localhost:9092", "localhost:9093"])
        .topics(["orders", "refunds"])
        .group_id("billing")
        .processor(|_batch: Batch| async { Ok::<(), anyhow::Error>(()) })
        .batch_size(50)
        .batch_timeout(Duration::ZERO)
        .retries(5)
        .connector(broker.connector())
        .build()
        .expect("valid options");

    let config = component.config();
    assert_eq!(config.batch_size, 50);
    assert_eq!(config.retries, 5);
    assert_eq!(config.topics_label(), "orders,refunds");
}

#[test]
fn test_env_settings_map_onto_builders() {
    let settings: KafkaConfig = serde_json::from_value(json!({
        "brokers": "kafka-1:9092,kafka-2:9092",
        "topics": "orders",
        "batch_size": 25,
        "failure_strategy": "skip"
    }))
    .expect("settings deserialize with defaults");

    let component = settings
        .simple_builder("orders")
        .shared_processor(Arc::new(|_batch: Batch| async { Ok::<(), anyhow::Error>(()) }))
        .build()
        .expect("valid settings");

    assert_eq!(component.config().brokers, vec!["kafka-1:9092", "kafka-2:9092"]);
    assert_eq!(component.config().batch_size, 25);
}

#[test]
fn test_message_decoding() {
    #[derive(serde::Deserialize)]
    struct Order {
        id: u32,
    }

    let broker = MockBroker::new();
    broker.create_topic("orders", 1);
    broker.produce("orders", 0, json!({ "id": 7 }).to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let record = runtime
        .block_on(broker.client().fetch_record("orders", 0, 0))
        .unwrap();
    let message = kafka_components::Message::new(tracing::Span::none(), record);

    let order: Order = message.decode().unwrap();
    assert_eq!(order.id, 7);
}
